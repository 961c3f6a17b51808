//! Error type definitions for the runtime core.

use std::error::Error as StdError;
use std::fmt;

/// Unified error type for the runtime and the JIT pipeline.
#[derive(Debug, Clone)]
pub struct HError {
    pub kind: ErrorKind,
}

/// Categorized error kinds
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorKind {
    // JIT pipeline
    CompileFailed {
        message: String,
    },
    LinkFailed {
        message: String,
    },
    VerifyFailed {
        message: String,
    },
    ObjectEmitFailed {
        message: String,
    },
    DriverFailed {
        message: String,
    },

    // Library loading
    LibraryFailed {
        message: String,
    },

    // Reference discipline
    NullReference,
    IllegalReference {
        message: String,
    },

    // Fiber machinery
    FiberInternal {
        message: String,
    },

    // Fallback
    Generic {
        message: String,
    },
}

/// Result type alias
pub type HResult<T> = Result<T, HError>;

impl HError {
    /// Create a new error with the given kind
    pub fn new(kind: ErrorKind) -> Self {
        HError { kind }
    }

    /// Get a human-readable description
    pub fn description(&self) -> String {
        match &self.kind {
            ErrorKind::CompileFailed { message } => {
                format!("jit: compilation failed: {}", message)
            }
            ErrorKind::LinkFailed { message } => {
                format!("jit: linking failed: {}", message)
            }
            ErrorKind::VerifyFailed { message } => {
                format!("jit: linked module failed verification ({})", message)
            }
            ErrorKind::ObjectEmitFailed { message } => {
                format!("jit: object emission failed: {}", message)
            }
            ErrorKind::DriverFailed { message } => {
                format!("could not create shared object: {}", message)
            }
            ErrorKind::LibraryFailed { message } => {
                format!("library error: {}", message)
            }
            ErrorKind::NullReference => "attempt to access null reference".to_string(),
            ErrorKind::IllegalReference { message } => message.clone(),
            ErrorKind::FiberInternal { message } => format!("fiber: {}", message),
            ErrorKind::Generic { message } => format!("Error: {}", message),
        }
    }
}

impl fmt::Display for HError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.description())
    }
}

impl StdError for HError {}

// Compatibility conversions
impl From<HError> for String {
    fn from(err: HError) -> String {
        err.description()
    }
}

impl From<String> for HError {
    fn from(msg: String) -> Self {
        HError::new(ErrorKind::Generic { message: msg })
    }
}

impl From<&str> for HError {
    fn from(msg: &str) -> Self {
        HError::new(ErrorKind::Generic {
            message: msg.to_string(),
        })
    }
}

impl From<std::io::Error> for HError {
    fn from(err: std::io::Error) -> Self {
        HError::new(ErrorKind::Generic {
            message: err.to_string(),
        })
    }
}
