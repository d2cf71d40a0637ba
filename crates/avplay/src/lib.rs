pub mod cli;
pub mod config;
pub mod controls;
pub mod output;
pub mod runtime;
