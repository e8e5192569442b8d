use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Lexical,
    Syntax,
    Runtime,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::Lexical => "lexical error",
            ErrorKind::Syntax => "syntax error",
            ErrorKind::Runtime => "runtime error",
        };
        f.write_str(name)
    }
}

/// A source position, both fields 1-based.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TracePoint {
    pub line: u32,
    pub col: u32,
}

/// The engine's single exception type.
///
/// `trace` grows by one entry for every frame the error unwinds through,
/// innermost first. Compile-time errors carry exactly the offending token.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct ScriptError {
    pub kind: ErrorKind,
    pub message: String,
    pub trace: Vec<TracePoint>,
}

pub type Result<T> = std::result::Result<T, ScriptError>;

impl ScriptError {
    pub fn runtime(message: impl Into<String>) -> Self {
        ScriptError { kind: ErrorKind::Runtime, message: message.into(), trace: Vec::new() }
    }

    pub fn lexical(message: impl Into<String>, line: u32, col: u32) -> Self {
        ScriptError {
            kind: ErrorKind::Lexical,
            message: message.into(),
            trace: vec![TracePoint { line, col }],
        }
    }

    pub fn syntax(message: impl Into<String>, line: u32, col: u32) -> Self {
        ScriptError {
            kind: ErrorKind::Syntax,
            message: message.into(),
            trace: vec![TracePoint { line, col }],
        }
    }

    pub fn push_trace(&mut self, line: u32, col: u32) {
        self.trace.push(TracePoint { line, col });
    }

    /// Innermost position, if any frame recorded one.
    pub fn position(&self) -> Option<TracePoint> {
        self.trace.first().copied()
    }

    /// One line per trace entry, innermost first.
    pub fn backtrace(&self) -> String {
        self.trace
            .iter()
            .map(|p| format!("at line {}, column {}", p.line, p.col))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_kind() {
        let e = ScriptError::runtime("member x not exist");
        assert_eq!(e.to_string(), "runtime error: member x not exist");
    }

    #[test]
    fn trace_accumulates_in_push_order() {
        let mut e = ScriptError::runtime("boom");
        e.push_trace(3, 1);
        e.push_trace(7, 4);
        assert_eq!(e.position(), Some(TracePoint { line: 3, col: 1 }));
        assert_eq!(e.backtrace(), "at line 3, column 1\nat line 7, column 4");
    }

    #[test]
    fn compile_errors_carry_one_position() {
        let e = ScriptError::syntax("expected `)`", 2, 9);
        assert_eq!(e.kind, ErrorKind::Syntax);
        assert_eq!(e.trace.len(), 1);
    }
}
