//! Diagnostic accumulation for the compile pipeline (§4.4, §7).
//!
//! Compile-phase errors do not short-circuit individually: they accumulate
//! into a [`DiagnosticSink`] with a severity, and only `Fatal` unwinds the
//! current module's compilation. The driver inspects the sink after each
//! phase and aborts if any `Error`/`Fatal` diagnostic was recorded.

use std::env;
use std::fmt;

use crate::ast::Span;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Info,
    Warning,
    Error,
    Fatal,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Error => "error",
            Severity::Fatal => "fatal",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Diagnostic {
    pub severity: Severity,
    pub title: String,
    pub message: Option<String>,
    pub module: Option<String>,
    pub span: Option<Span>,
}

impl Diagnostic {
    pub fn new(severity: Severity, title: impl Into<String>) -> Self {
        Self {
            severity,
            title: title.into(),
            message: None,
            module: None,
            span: None,
        }
    }

    pub fn info(title: impl Into<String>) -> Self {
        Self::new(Severity::Info, title)
    }

    pub fn warning(title: impl Into<String>) -> Self {
        Self::new(Severity::Warning, title)
    }

    pub fn error(title: impl Into<String>) -> Self {
        Self::new(Severity::Error, title)
    }

    pub fn fatal(title: impl Into<String>) -> Self {
        Self::new(Severity::Fatal, title)
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_module(mut self, module: impl Into<String>) -> Self {
        self.module = Some(module.into());
        self
    }

    pub fn with_span(mut self, span: Span) -> Self {
        self.span = Some(span);
        self
    }

    pub fn render(&self) -> String {
        let use_color = env::var_os("NO_COLOR").is_none();
        let (color, reset) = if use_color {
            let color = match self.severity {
                Severity::Info => "\u{1b}[36m",
                Severity::Warning => "\u{1b}[33m",
                Severity::Error | Severity::Fatal => "\u{1b}[31m",
            };
            (color, "\u{1b}[0m")
        } else {
            ("", "")
        };

        let module = self.module.as_deref().unwrap_or("<unknown>");
        let mut out = format!("{color}-- {} [{module}]{reset}", self.severity);
        if let Some(span) = self.span {
            out.push_str(&format!(" at {}:{}", span.line, span.col));
        }
        out.push('\n');
        out.push_str(&self.title);
        if let Some(message) = &self.message {
            out.push('\n');
            out.push_str(message);
        }
        out
    }
}

/// Accumulates diagnostics across a compile phase. The compiler's
/// non-fatal errors all land here so a user sees every problem found,
/// not just the first.
#[derive(Debug, Default)]
pub struct DiagnosticSink {
    diagnostics: Vec<Diagnostic>,
}

impl DiagnosticSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, diagnostic: Diagnostic) {
        self.diagnostics.push(diagnostic);
    }

    /// Any diagnostic at `Error` severity or above.
    pub fn has_errors(&self) -> bool {
        self.diagnostics
            .iter()
            .any(|d| d.severity >= Severity::Error)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Diagnostic> {
        self.diagnostics.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.diagnostics.is_empty()
    }

    pub fn len(&self) -> usize {
        self.diagnostics.len()
    }

    pub fn render_all(&self) -> String {
        self.diagnostics
            .iter()
            .map(Diagnostic::render)
            .collect::<Vec<_>>()
            .join("\n\n")
    }
}

/// Raised when a `Fatal` diagnostic unwinds compilation of the current
/// module (§7: "Fatal severity short-circuits via unwind").
#[derive(Debug, Clone, PartialEq)]
pub struct FatalError(pub Diagnostic);

impl fmt::Display for FatalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.render())
    }
}

impl std::error::Error for FatalError {}

pub type CompileResult<T> = Result<T, FatalError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sink_reports_errors_but_not_warnings() {
        let mut sink = DiagnosticSink::new();
        sink.push(Diagnostic::warning("unused import"));
        assert!(!sink.has_errors());
        sink.push(Diagnostic::error("undeclared identifier"));
        assert!(sink.has_errors());
        assert_eq!(sink.len(), 2);
    }

    #[test]
    fn render_includes_span() {
        let d = Diagnostic::error("boom")
            .with_span(Span::new(0, 1, 3, 7))
            .with_module("A");
        let rendered = d.render();
        assert!(rendered.contains("3:7"));
        assert!(rendered.contains('A'));
    }
}
