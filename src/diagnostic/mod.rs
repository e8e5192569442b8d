pub mod ansi;
pub mod json;

use crate::error::{ErrorKind, ScriptError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Severity {
    Error,
    Warning,
}

/// A source position to point at, 1-based.
#[derive(Debug, Clone)]
pub struct Label {
    pub line: u32,
    pub col: u32,
    pub message: String,
    pub is_primary: bool,
}

#[derive(Debug, Clone)]
pub struct Diagnostic {
    pub severity: Severity,
    pub code: Option<&'static str>,
    pub message: String,
    pub labels: Vec<Label>,
    pub notes: Vec<String>,
    pub suggestion: Option<String>,
    pub source: Option<String>,
}

impl Diagnostic {
    pub fn error(message: impl Into<String>) -> Self {
        Diagnostic {
            severity: Severity::Error,
            code: None,
            message: message.into(),
            labels: Vec::new(),
            notes: Vec::new(),
            suggestion: None,
            source: None,
        }
    }

    pub fn warning(message: impl Into<String>) -> Self {
        Diagnostic { severity: Severity::Warning, ..Diagnostic::error(message) }
    }

    pub fn with_code(mut self, code: &'static str) -> Self {
        self.code = Some(code);
        self
    }

    pub fn with_label(mut self, line: u32, col: u32, label: impl Into<String>) -> Self {
        self.labels.push(Label { line, col, message: label.into(), is_primary: true });
        self
    }

    pub fn with_secondary_label(mut self, line: u32, col: u32, label: impl Into<String>) -> Self {
        self.labels.push(Label { line, col, message: label.into(), is_primary: false });
        self
    }

    pub fn with_note(mut self, note: impl Into<String>) -> Self {
        self.notes.push(note.into());
        self
    }

    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestion = Some(suggestion.into());
        self
    }

    /// Source text the labels point into; newlines are normalized to match
    /// the positions the compiler reports.
    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(crate::lexer::normalize_newlines(&source.into()));
        self
    }
}

fn code_for(kind: ErrorKind) -> &'static str {
    match kind {
        ErrorKind::Lexical => "lexical",
        ErrorKind::Syntax => "syntax",
        ErrorKind::Runtime => "runtime",
    }
}

/// The innermost trace entry becomes the primary label; outer frames
/// become "called from" notes.
impl From<&ScriptError> for Diagnostic {
    fn from(e: &ScriptError) -> Self {
        let mut d = Diagnostic::error(&e.message).with_code(code_for(e.kind));
        let mut trace = e.trace.iter();
        if let Some(inner) = trace.next() {
            d = d.with_label(inner.line, inner.col, "here");
        }
        for outer in trace {
            d = d.with_note(format!("called from line {}, column {}", outer.line, outer.col));
        }
        if e.kind == ErrorKind::Runtime && e.message.starts_with("member `") && e.message.contains("does not exist") {
            d = d.with_suggestion("check the spelling, or declare the member before reading it");
        }
        d
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::Engine;

    #[test]
    fn diagnostic_error_builder() {
        let d = Diagnostic::error("something went wrong");
        assert_eq!(d.severity, Severity::Error);
        assert_eq!(d.message, "something went wrong");
        assert!(d.labels.is_empty());
        assert!(d.notes.is_empty());
        assert!(d.suggestion.is_none());
        assert_eq!(Diagnostic::warning("w").severity, Severity::Warning);
    }

    #[test]
    fn diagnostic_with_label() {
        let d = Diagnostic::error("bad token").with_label(2, 8, "here");
        assert_eq!(d.labels.len(), 1);
        assert_eq!((d.labels[0].line, d.labels[0].col), (2, 8));
        assert!(d.labels[0].is_primary);
    }

    #[test]
    fn source_is_normalized() {
        let d = Diagnostic::error("x").with_source("a\r\nb");
        assert_eq!(d.source.as_deref(), Some("a\nb"));
    }

    #[test]
    fn from_syntax_error() {
        let e = Engine::new().eval("var x = (1;").unwrap_err();
        let d = Diagnostic::from(&e);
        assert_eq!(d.code, Some("syntax"));
        assert_eq!(d.labels.len(), 1);
        assert!(d.notes.is_empty());
    }

    #[test]
    fn from_runtime_error_with_frames() {
        let source = "function inner() { return undefinedThing.member; }\nfunction outer() { return inner(); }\nreturn outer();";
        let e = Engine::new().eval(source).unwrap_err();
        let d = Diagnostic::from(&e);
        assert_eq!(d.code, Some("runtime"));
        assert_eq!(d.labels[0].line, 1);
        assert_eq!(d.notes.len(), 2);
        assert!(d.notes[0].starts_with("called from line 2"));
        assert!(d.notes[1].starts_with("called from line 3"));
    }

    #[test]
    fn runtime_error_without_position() {
        let d = Diagnostic::from(&ScriptError::runtime("division by zero"));
        assert!(d.labels.is_empty());
        assert!(d.message.contains("division by zero"));
    }
}
