use std::{fmt, sync::Arc};

use thiserror::Error;

/// Position of a token inside a named source.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CodeLocation {
    pub source: Arc<str>,
    pub line: u32,
    pub column: u32,
}

impl CodeLocation {
    pub fn new(source: Arc<str>, line: u32, column: u32) -> Self {
        Self {
            source,
            line,
            column,
        }
    }
}

impl fmt::Display for CodeLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.source, self.line, self.column)
    }
}

/// Classification of a diagnostic event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiagnosticKind {
    Lex,
    Syntax,
    Compiler,
    Runtime,
    Watchdog,
}

impl DiagnosticKind {
    pub fn is_compile_time(self) -> bool {
        matches!(self, Self::Lex | Self::Syntax | Self::Compiler)
    }

    pub fn is_runtime(self) -> bool {
        matches!(self, Self::Runtime | Self::Watchdog)
    }
}

impl fmt::Display for DiagnosticKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Lex => "lex error",
            Self::Syntax => "syntax error",
            Self::Compiler => "compile error",
            Self::Runtime => "runtime error",
            Self::Watchdog => "watchdog",
        };
        f.write_str(label)
    }
}

/// One entry of a runtime call stack, innermost first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StackEntry {
    pub function: String,
    pub location: Option<CodeLocation>,
}

impl fmt::Display for StackEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.location {
            Some(location) => write!(f, "{} ({location})", self.function),
            None => write!(f, "{}", self.function),
        }
    }
}

/// Rich diagnostic information surfaced to end users.
#[derive(Debug, Clone)]
pub struct Diagnostic {
    pub kind: DiagnosticKind,
    pub message: String,
    pub location: Option<CodeLocation>,
    pub notes: Vec<String>,
    pub call_stack: Vec<StackEntry>,
}

impl Diagnostic {
    pub fn new(kind: DiagnosticKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            location: None,
            notes: Vec::new(),
            call_stack: Vec::new(),
        }
    }

    pub fn lex(message: impl Into<String>, location: CodeLocation) -> Self {
        Self::new(DiagnosticKind::Lex, message).with_location(location)
    }

    pub fn syntax(message: impl Into<String>, location: CodeLocation) -> Self {
        Self::new(DiagnosticKind::Syntax, message).with_location(location)
    }

    pub fn compiler(message: impl Into<String>, location: CodeLocation) -> Self {
        Self::new(DiagnosticKind::Compiler, message).with_location(location)
    }

    /// Runtime failure raised by host code; the executor fills in the location.
    pub fn runtime(message: impl Into<String>) -> Self {
        Self::new(DiagnosticKind::Runtime, message)
    }

    pub fn with_location(mut self, location: CodeLocation) -> Self {
        self.location = Some(location);
        self
    }

    pub fn with_note(mut self, note: impl Into<String>) -> Self {
        self.notes.push(note.into());
        self
    }

    pub fn with_call_stack(mut self, call_stack: Vec<StackEntry>) -> Self {
        self.call_stack = call_stack;
        self
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.kind)?;
        if let Some(location) = &self.location {
            write!(f, " at {location}")?;
        }
        write!(f, ": {}", self.message)?;
        for note in &self.notes {
            write!(f, "\n  note: {note}")?;
        }
        for entry in &self.call_stack {
            write!(f, "\n  in {entry}")?;
        }
        Ok(())
    }
}

impl std::error::Error for Diagnostic {}

/// Unified error type for the Noodle toolchain.
#[derive(Debug, Error)]
pub enum NoodleError {
    #[error("{0}")]
    Diagnostic(#[from] Diagnostic),
    #[error("registration error: {0}")]
    Registration(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl NoodleError {
    pub fn diagnostic(&self) -> Option<&Diagnostic> {
        match self {
            Self::Diagnostic(diagnostic) => Some(diagnostic),
            _ => None,
        }
    }

    pub fn kind(&self) -> Option<DiagnosticKind> {
        self.diagnostic().map(|diagnostic| diagnostic.kind)
    }
}

pub type Result<T> = std::result::Result<T, NoodleError>;
