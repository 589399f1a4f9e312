//! Structured diagnostic events, mirrored through the `log` crate.
//!
//! The high-level client API (out of scope for this crate) is expected to
//! subscribe to [`Diagnostic`] events for UI surfaces, while every layer in
//! this crate also logs through `log::{warn,info,debug}!` at the matching
//! level so the events are visible even without a subscriber attached —
//! the same "log plus explicit event" duplication cratetorrent uses for
//! its `Alert` channel.

use std::fmt;

/// `None < Warning < Info < Debug`, i.e. `Debug` is the most verbose
/// level.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum DiagnosticLevel {
    None,
    Warning,
    Info,
    Debug,
}

impl Default for DiagnosticLevel {
    fn default() -> Self {
        DiagnosticLevel::Info
    }
}

/// A single diagnostic event, analogous to cratetorrent's `Alert` but
/// generalized to carry a free-form message plus an optional cause chain
/// entry, since this core surfaces protocol and connection conditions
/// rather than disk IO results.
#[derive(Clone, Debug)]
pub struct Diagnostic {
    pub level: DiagnosticLevel,
    pub message: String,
    pub cause: Option<String>,
}

impl Diagnostic {
    pub fn new(level: DiagnosticLevel, message: impl Into<String>) -> Self {
        Self {
            level,
            message: message.into(),
            cause: None,
        }
    }

    pub fn with_cause(mut self, cause: impl fmt::Display) -> Self {
        self.cause = Some(cause.to_string());
        self
    }
}

/// A sink that receives every diagnostic emitted by the core, filtered by
/// [`Conf::minimum_diagnostic_level`](crate::conf::Conf::minimum_diagnostic_level)
/// before it reaches the subscriber.
pub trait DiagnosticSink: Send + Sync {
    fn on_diagnostic(&self, diagnostic: Diagnostic);
}

/// A sink that drops everything. Used when the caller hasn't installed one.
#[derive(Clone, Copy, Debug, Default)]
pub struct NullDiagnosticSink;

impl DiagnosticSink for NullDiagnosticSink {
    fn on_diagnostic(&self, _diagnostic: Diagnostic) {}
}

/// Emits `diagnostic` to `sink` (if its level clears `minimum_level`) and
/// unconditionally mirrors it through the `log` crate at the matching
/// level, so a caller without a diagnostic subscriber still sees
/// everything in their logs.
pub fn emit(
    sink: &dyn DiagnosticSink,
    minimum_level: DiagnosticLevel,
    diagnostic: Diagnostic,
) {
    match diagnostic.level {
        DiagnosticLevel::Warning => {
            log::warn!("{}", render(&diagnostic));
        }
        DiagnosticLevel::Info => {
            log::info!("{}", render(&diagnostic));
        }
        DiagnosticLevel::Debug => {
            log::debug!("{}", render(&diagnostic));
        }
        DiagnosticLevel::None => {}
    }
    if diagnostic.level <= minimum_level && diagnostic.level != DiagnosticLevel::None {
        sink.on_diagnostic(diagnostic);
    }
}

fn render(diagnostic: &Diagnostic) -> String {
    match &diagnostic.cause {
        Some(cause) => format!("{} (cause: {})", diagnostic.message, cause),
        None => diagnostic.message.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct RecordingSink {
        received: Mutex<Vec<Diagnostic>>,
    }

    impl DiagnosticSink for RecordingSink {
        fn on_diagnostic(&self, diagnostic: Diagnostic) {
            self.received.lock().unwrap().push(diagnostic);
        }
    }

    #[test]
    fn level_ordering_is_least_to_most_verbose() {
        assert!(DiagnosticLevel::None < DiagnosticLevel::Warning);
        assert!(DiagnosticLevel::Warning < DiagnosticLevel::Info);
        assert!(DiagnosticLevel::Info < DiagnosticLevel::Debug);
    }

    #[test]
    fn below_minimum_level_is_dropped() {
        let sink = Arc::new(RecordingSink::default());
        emit(
            sink.as_ref(),
            DiagnosticLevel::Warning,
            Diagnostic::new(DiagnosticLevel::Debug, "chatter"),
        );
        assert!(sink.received.lock().unwrap().is_empty());
    }

    #[test]
    fn at_or_below_minimum_level_is_forwarded() {
        let sink = Arc::new(RecordingSink::default());
        emit(
            sink.as_ref(),
            DiagnosticLevel::Debug,
            Diagnostic::new(DiagnosticLevel::Info, "child added"),
        );
        let received = sink.received.lock().unwrap();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].message, "child added");
    }
}
