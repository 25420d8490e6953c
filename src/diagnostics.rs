//! Notes, warnings and errors about the user's program. The passes report
//! through [`Diagnostics`], which applies the suppression rules and forwards
//! whatever survives to a [`DiagnosticSink`].

use colored::Colorize;
use hashbrown::HashMap;
use strum::Display;

use crate::{config::PassOptions, intern::InternedSymbol, middle::policy::Policy};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Display)]
#[strum(serialize_all = "lowercase")]
pub enum DiagnosticLevel {
    /// Advisory, usually about a missed optimization
    Note,
    /// Likely programmer error, compilation continues
    Warning,
    /// The construct was replaced with code that fails at run time
    Error,
}

/// Where a diagnostic was raised
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DiagnosticContext {
    pub function: Option<InternedSymbol>,
    pub operation: String,
}

impl DiagnosticContext {
    pub fn new(function: Option<InternedSymbol>, operation: impl Into<String>) -> Self {
        Self {
            function,
            operation: operation.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostic {
    pub level: DiagnosticLevel,
    pub context: DiagnosticContext,
    pub message: String,
}

impl core::fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let level = match self.level {
            DiagnosticLevel::Note => "note".cyan().bold(),
            DiagnosticLevel::Warning => "warning".yellow().bold(),
            DiagnosticLevel::Error => "error".red().bold(),
        };

        write!(f, "{level}{} ", ":".white().bold())?;

        if let Some(function) = self.context.function {
            write!(f, "{} ", format!("in {function}").blue())?;
        }

        write!(
            f,
            "{} {}",
            format!("({})", self.context.operation).white(),
            self.message
        )
    }
}

/// Receives every diagnostic that was not suppressed
pub trait DiagnosticSink {
    fn report(&mut self, diagnostic: Diagnostic);
}

/// Keeps diagnostics in memory, in the order they were reported
#[derive(Debug, Default)]
pub struct CollectingSink {
    pub diagnostics: Vec<Diagnostic>,
}

impl CollectingSink {
    pub fn count(&self, level: DiagnosticLevel) -> usize {
        self.diagnostics.iter().filter(|d| d.level == level).count()
    }

    pub fn messages(&self, level: DiagnosticLevel) -> Vec<&str> {
        self.diagnostics
            .iter()
            .filter(|d| d.level == level)
            .map(|d| d.message.as_str())
            .collect()
    }
}

impl DiagnosticSink for CollectingSink {
    fn report(&mut self, diagnostic: Diagnostic) {
        self.diagnostics.push(diagnostic);
    }
}

/// Prints diagnostics to stderr as they arrive
#[derive(Debug, Default)]
pub struct ConsoleSink;

impl DiagnosticSink for ConsoleSink {
    fn report(&mut self, diagnostic: Diagnostic) {
        eprintln!("{diagnostic}");
    }
}

/// Per-unit counts of what was actually reported
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DiagnosticCounts {
    pub notes: usize,
    pub warnings: usize,
    pub errors: usize,
    /// Notes dropped because an identical note was already reported too often
    pub capped_notes: usize,
}

pub struct Diagnostics<'a> {
    sink: &'a mut dyn DiagnosticSink,
    suppress_warnings: bool,
    max_repeated_notes: usize,
    counts: DiagnosticCounts,
    repeated_notes: HashMap<String, usize>,
}

impl<'a> Diagnostics<'a> {
    pub fn new(sink: &'a mut dyn DiagnosticSink, options: &PassOptions) -> Self {
        Self {
            sink,
            suppress_warnings: options.suppress_warnings,
            max_repeated_notes: options.max_repeated_notes,
            counts: DiagnosticCounts::default(),
            repeated_notes: HashMap::new(),
        }
    }

    /// Resets the counters at the start of a compilation unit and returns
    /// the counts of the previous one
    pub fn begin_unit(&mut self) -> DiagnosticCounts {
        self.repeated_notes.clear();
        std::mem::take(&mut self.counts)
    }

    pub fn counts(&self) -> &DiagnosticCounts {
        &self.counts
    }

    pub fn note(&mut self, policy: &Policy, context: DiagnosticContext, message: impl Into<String>) {
        if !policy.notes_enabled() {
            return;
        }

        let message = message.into();
        let seen = self.repeated_notes.entry(message.clone()).or_default();
        *seen += 1;

        if *seen > self.max_repeated_notes {
            self.counts.capped_notes += 1;
            return;
        }

        self.counts.notes += 1;
        self.emit(DiagnosticLevel::Note, context, message);
    }

    pub fn warning(&mut self, context: DiagnosticContext, message: impl Into<String>) {
        if self.suppress_warnings {
            return;
        }

        self.counts.warnings += 1;
        self.emit(DiagnosticLevel::Warning, context, message.into());
    }

    /// For constructs replaced outright by a stub that fails at run time.
    /// The passes never report through it: a proven type violation or a bad
    /// argument count still leaves the rest of the unit compilable, so those
    /// are warnings. Errors are never suppressed.
    pub fn error(&mut self, context: DiagnosticContext, message: impl Into<String>) {
        self.counts.errors += 1;
        self.emit(DiagnosticLevel::Error, context, message.into());
    }

    fn emit(&mut self, level: DiagnosticLevel, context: DiagnosticContext, message: String) {
        tracing::debug!(%level, operation = %context.operation, "{message}");

        self.sink.report(Diagnostic {
            level,
            context,
            message,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context() -> DiagnosticContext {
        DiagnosticContext::new(Some(InternedSymbol::new("f")), "call to +")
    }

    #[test]
    fn repeated_notes_are_capped() {
        let mut sink = CollectingSink::default();
        let options = PassOptions {
            max_repeated_notes: 2,
            ..Default::default()
        };

        let mut diagnostics = Diagnostics::new(&mut sink, &options);
        for _ in 0..5 {
            diagnostics.note(&Policy::default(), context(), "same note");
        }
        diagnostics.note(&Policy::default(), context(), "other note");

        assert_eq!(diagnostics.counts().notes, 3);
        assert_eq!(diagnostics.counts().capped_notes, 3);
        assert_eq!(sink.count(DiagnosticLevel::Note), 3);
    }

    #[test]
    fn notes_are_silenced_by_policy() {
        let mut sink = CollectingSink::default();
        let options = PassOptions::default();
        let quiet = Policy {
            inhibit_warnings: 3,
            ..Default::default()
        };

        let mut diagnostics = Diagnostics::new(&mut sink, &options);
        diagnostics.note(&quiet, context(), "hidden");
        diagnostics.warning(context(), "shown");

        assert_eq!(sink.messages(DiagnosticLevel::Note), Vec::<&str>::new());
        assert_eq!(sink.messages(DiagnosticLevel::Warning), vec!["shown"]);
    }

    #[test]
    fn warnings_can_be_suppressed() {
        let mut sink = CollectingSink::default();
        let options = PassOptions {
            suppress_warnings: true,
            ..Default::default()
        };

        let mut diagnostics = Diagnostics::new(&mut sink, &options);
        diagnostics.warning(context(), "hidden");
        diagnostics.error(context(), "shown");

        assert_eq!(diagnostics.begin_unit().errors, 1);
        assert_eq!(sink.count(DiagnosticLevel::Warning), 0);
        assert_eq!(sink.count(DiagnosticLevel::Error), 1);
    }
}
