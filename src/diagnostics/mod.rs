//! Diagnostic sink for non-fatal engine conditions.
//!
//! The engine reports two kinds of conditions: non-fatal warnings, which go
//! through a [`Sink`] threaded explicitly into the run context, and fatal
//! failures, which abort the run through the error type of the `autodiff`
//! module. There is no ambient global sink; every run names its own.

use std::fmt;

/// One recorded warning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostic {
    pub message: String,
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "warning: {}", self.message)
    }
}

/// Receiver of non-fatal diagnostics. Execution continues after `warn`.
pub trait Sink {
    fn warn(&mut self, message: &str);
}

/// Forwards warnings to the `log` facade.
#[derive(Debug, Default)]
pub struct LogSink;

impl Sink for LogSink {
    fn warn(&mut self, message: &str) {
        log::warn!("{message}");
    }
}

/// Collects warnings in memory; useful in tests and batch drivers.
#[derive(Debug, Default)]
pub struct CollectingSink {
    pub warnings: Vec<Diagnostic>,
}

impl CollectingSink {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Sink for CollectingSink {
    fn warn(&mut self, message: &str) {
        log::warn!("{message}");
        self.warnings.push(Diagnostic { message: message.to_string() });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collecting_sink_records_in_order() {
        let mut sink = CollectingSink::new();
        sink.warn("first");
        sink.warn("second");
        let messages: Vec<_> = sink.warnings.iter().map(|d| d.message.as_str()).collect();
        assert_eq!(messages, vec!["first", "second"]);
    }
}
