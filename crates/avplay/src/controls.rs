//! Interactive commands read from stdin while a file plays.

use std::io::BufRead;

use crossbeam_channel::Sender;

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Control {
    TogglePause,
    SeekTo(f64),
    /// Relative seek; negative values go backwards.
    SeekBy(f64),
    Status,
    Quit,
}

/// Parse one input line. Blank lines yield `Ok(None)`.
pub fn parse_control(line: &str) -> Result<Option<Control>, String> {
    let mut parts = line.split_whitespace();
    let Some(cmd) = parts.next() else {
        return Ok(None);
    };
    let arg = parts.next();
    if parts.next().is_some() {
        return Err(format!("too many arguments: {line}"));
    }

    let control = match (cmd, arg) {
        ("p", None) => Control::TogglePause,
        ("i", None) => Control::Status,
        ("q", None) => Control::Quit,
        ("s", Some(secs)) => Control::SeekTo(parse_secs(secs)?),
        ("f", Some(secs)) => Control::SeekBy(parse_secs(secs)?),
        ("b", Some(secs)) => Control::SeekBy(-parse_secs(secs)?),
        ("s" | "f" | "b", None) => return Err(format!("{cmd}: missing seconds")),
        _ => return Err(format!("unknown command: {line}")),
    };
    Ok(Some(control))
}

fn parse_secs(s: &str) -> Result<f64, String> {
    match s.parse::<f64>() {
        Ok(v) if v.is_finite() && v >= 0.0 => Ok(v),
        _ => Err(format!("invalid seconds: {s}")),
    }
}

pub const HELP: &str = "commands: p (pause/resume), s <secs>, f <secs>, b <secs>, i (status), q (quit)";

/// Forward parsed stdin commands to `tx` on a background thread.
///
/// End of input is reported as [`Control::Quit`].
pub fn spawn_stdin_reader(tx: Sender<Control>) -> std::io::Result<std::thread::JoinHandle<()>> {
    std::thread::Builder::new()
        .name("stdin-controls".to_string())
        .spawn(move || {
            let stdin = std::io::stdin();
            for line in stdin.lock().lines() {
                let Ok(line) = line else { break };
                match parse_control(&line) {
                    Ok(Some(control)) => {
                        if tx.send(control).is_err() {
                            return;
                        }
                    }
                    Ok(None) => {}
                    Err(e) => eprintln!("{e}\n{HELP}"),
                }
            }
            let _ = tx.send(Control::Quit);
        })
}
