//! Injected diagnostics sink for step markers inside the pipeline threads.
//!
//! Every component receives an `Arc<dyn Diagnostics>` at construction. The default
//! [`TracingDiagnostics`] turns markers into `trace`-level events.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::Instant;

pub trait Diagnostics: Send + Sync {
    /// Record that `scope` reached numbered `step` (e.g. a flush phase).
    fn mark(&self, scope: &str, step: u32);

    /// Record an occurrence of `label` along with the interval since the last one.
    fn time_mark(&self, label: &str);

    /// Record a labelled value (first frame after a seek, etc).
    fn label_mark(&self, label: &str, value: &str);
}

pub struct NullDiagnostics;

impl Diagnostics for NullDiagnostics {
    fn mark(&self, _scope: &str, _step: u32) {}
    fn time_mark(&self, _label: &str) {}
    fn label_mark(&self, _label: &str, _value: &str) {}
}

#[derive(Default)]
pub struct TracingDiagnostics {
    last_marks: Mutex<HashMap<String, Instant>>,
}

impl TracingDiagnostics {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Diagnostics for TracingDiagnostics {
    fn mark(&self, scope: &str, step: u32) {
        tracing::trace!(scope, step, "mark");
    }

    fn time_mark(&self, label: &str) {
        let now = Instant::now();
        let since_ms = {
            let mut marks = self.last_marks.lock().unwrap_or_else(PoisonError::into_inner);
            marks
                .insert(label.to_string(), now)
                .map(|prev| now.duration_since(prev).as_secs_f64() * 1000.0)
        };
        tracing::trace!(label, since_ms = ?since_ms, "time mark");
    }

    fn label_mark(&self, label: &str, value: &str) {
        tracing::trace!(label, value, "label mark");
    }
}

#[cfg(test)]
pub(crate) mod recording {
    use super::*;

    /// Collects marks for assertions.
    #[derive(Default)]
    pub struct RecordingDiagnostics {
        pub marks: Mutex<Vec<(String, u32)>>,
        pub labels: Mutex<Vec<(String, String)>>,
    }

    impl Diagnostics for RecordingDiagnostics {
        fn mark(&self, scope: &str, step: u32) {
            self.marks.lock().unwrap().push((scope.to_string(), step));
        }

        fn time_mark(&self, _label: &str) {}

        fn label_mark(&self, label: &str, value: &str) {
            self.labels
                .lock()
                .unwrap()
                .push((label.to_string(), value.to_string()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn time_mark_tracks_labels_independently() {
        let diag = TracingDiagnostics::new();
        diag.time_mark("video frame in");
        diag.time_mark("audio frame in");
        diag.time_mark("video frame in");
        let marks = diag.last_marks.lock().unwrap();
        assert_eq!(marks.len(), 2);
    }
}
