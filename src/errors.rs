//! Assembler errors with source positions and cause chains

use std::fmt;
use std::rc::Rc;

/// A position in the assembly source, attached to every token-producing
/// event so errors can point back at the offending line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Origin {
    pub file: Rc<str>,
    pub line: usize,
    pub column: usize,
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "File \"{}\", line {}", self.file, self.line)
    }
}

/// What went wrong, independent of the message wording
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Grammar or tokenization failure
    Syntax,
    /// Duplicate label definition
    NameConflict,
    /// Generic expression evaluation failure (undefined name, ...)
    Expression,
    /// A label's address could not be resolved concretely
    Label,
    /// Evaluation re-entered the same symbol
    CyclicDependency,
    /// Arithmetic fault while evaluating an expression
    Evaluation,
    /// `%argv` parsing did not match the declared spec
    Usage,
    /// Word size outside what this emulator can represent
    UnsupportedWordSize,
    /// Anything else the assembler refuses to accept
    General,
}

/// An error raised while assembling a program
#[derive(Debug, Clone)]
pub struct AsmError {
    kind: ErrorKind,
    message: String,
    origin: Origin,
    cause: Option<Box<AsmError>>,
}

impl AsmError {
    pub fn new(kind: ErrorKind, message: impl Into<String>, origin: Origin) -> AsmError {
        AsmError {
            kind,
            message: message.into(),
            origin,
            cause: None,
        }
    }

    /// The catch-all syntax error for source that is wrong in no
    /// particularly describable way
    pub fn unhelpful(origin: Origin) -> AsmError {
        AsmError::new(ErrorKind::Syntax, "Invalid syntax", origin)
    }

    pub fn with_cause(mut self, cause: AsmError) -> AsmError {
        self.cause = Some(Box::new(cause));
        self
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn origin(&self) -> &Origin {
        &self.origin
    }

    pub fn cause(&self) -> Option<&AsmError> {
        self.cause.as_deref()
    }
}

impl fmt::Display for AsmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for AsmError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.cause.as_ref().map(|c| c as &(dyn std::error::Error + 'static))
    }
}
