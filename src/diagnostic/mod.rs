use std::fmt;

use crate::compiler::CompileError;
use crate::lexer::LexError;
use crate::vm::RuntimeError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Error,
    Warning,
}

/// One reportable line for CLI output: severity, origin, message, and any
/// follow-up notes. Script errors come in through the `From` impls below.
#[derive(Debug, Clone)]
pub struct Diagnostic {
    pub severity: Severity,
    pub script: Option<String>,
    pub line: Option<u32>,
    pub message: String,
    pub notes: Vec<String>,
}

impl Diagnostic {
    pub fn error(message: impl Into<String>) -> Self {
        Diagnostic {
            severity: Severity::Error,
            script: None,
            line: None,
            message: message.into(),
            notes: Vec::new(),
        }
    }

    pub fn warning(message: impl Into<String>) -> Self {
        Diagnostic {
            severity: Severity::Warning,
            ..Diagnostic::error(message)
        }
    }

    pub fn with_script(mut self, name: impl Into<String>) -> Self {
        self.script = Some(name.into());
        self
    }

    pub fn with_line(mut self, line: u32) -> Self {
        self.line = Some(line);
        self
    }

    pub fn with_note(mut self, note: impl Into<String>) -> Self {
        self.notes.push(note.into());
        self
    }

    pub fn is_error(&self) -> bool {
        self.severity == Severity::Error
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.severity {
            Severity::Error => write!(f, "error: ")?,
            Severity::Warning => write!(f, "warning: ")?,
        }
        if let Some(script) = &self.script {
            write!(f, "{script}:")?;
            if let Some(line) = self.line {
                write!(f, "{line}:")?;
            }
            write!(f, " ")?;
        } else if let Some(line) = self.line {
            write!(f, "line {line}: ")?;
        }
        write!(f, "{}", self.message)?;
        for note in &self.notes {
            write!(f, "\n  note: {note}")?;
        }
        Ok(())
    }
}

// ---- From impls for script error types ----

impl From<&LexError> for Diagnostic {
    fn from(e: &LexError) -> Self {
        Diagnostic::error(format!("unrecognized input '{}'", e.snippet)).with_line(e.line)
    }
}

impl From<&CompileError> for Diagnostic {
    fn from(e: &CompileError) -> Self {
        Diagnostic::error(&e.message)
            .with_script(&e.script)
            .with_line(e.line)
    }
}

impl From<&RuntimeError> for Diagnostic {
    fn from(e: &RuntimeError) -> Self {
        Diagnostic::error(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_fills_defaults() {
        let d = Diagnostic::error("something went wrong");
        assert_eq!(d.severity, Severity::Error);
        assert!(d.script.is_none());
        assert!(d.line.is_none());
        assert!(d.notes.is_empty());
        assert!(d.is_error());
        assert!(!Diagnostic::warning("w").is_error());
    }

    #[test]
    fn display_prefixes_script_and_line() {
        let d = Diagnostic::error("expected '{' after state name")
            .with_script("guard")
            .with_line(3);
        assert_eq!(d.to_string(), "error: guard:3: expected '{' after state name");
    }

    #[test]
    fn display_without_script_labels_the_line() {
        let d = Diagnostic::error("unrecognized input '@'").with_line(2);
        assert_eq!(d.to_string(), "error: line 2: unrecognized input '@'");
    }

    #[test]
    fn notes_render_on_their_own_lines() {
        let d = Diagnostic::warning("defines no states")
            .with_script("inert")
            .with_note("nothing will run on update");
        let text = d.to_string();
        assert!(text.starts_with("warning: inert: defines no states"));
        assert!(text.contains("\n  note: nothing will run on update"));
    }

    #[test]
    fn from_lex_error() {
        let e = LexError {
            line: 4,
            snippet: "@".to_string(),
        };
        let d = Diagnostic::from(&e);
        assert_eq!(d.line, Some(4));
        assert!(d.message.contains('@'));
    }

    #[test]
    fn from_compile_error() {
        let e = CompileError {
            script: "guard".to_string(),
            line: 7,
            message: "assignment to undeclared variable 'y'".to_string(),
        };
        let d = Diagnostic::from(&e);
        assert_eq!(d.script.as_deref(), Some("guard"));
        assert_eq!(d.line, Some(7));
        assert!(d.message.contains("undeclared"));
    }

    #[test]
    fn from_runtime_error() {
        let e = RuntimeError::DivisionByZero;
        let d = Diagnostic::from(&e);
        assert!(d.message.contains("division by zero"));
        // Bytecode carries no line pointer at runtime.
        assert!(d.line.is_none());
    }
}
