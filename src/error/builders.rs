//! Constructor helpers for common error kinds.

use super::types::{ErrorKind, HError};

impl HError {
    pub fn compile_failed(message: impl Into<String>) -> Self {
        HError::new(ErrorKind::CompileFailed {
            message: message.into(),
        })
    }

    pub fn link_failed(message: impl Into<String>) -> Self {
        HError::new(ErrorKind::LinkFailed {
            message: message.into(),
        })
    }

    pub fn verify_failed(message: impl Into<String>) -> Self {
        HError::new(ErrorKind::VerifyFailed {
            message: message.into(),
        })
    }

    pub fn object_emit_failed(message: impl Into<String>) -> Self {
        HError::new(ErrorKind::ObjectEmitFailed {
            message: message.into(),
        })
    }

    pub fn driver_failed(message: impl Into<String>) -> Self {
        HError::new(ErrorKind::DriverFailed {
            message: message.into(),
        })
    }

    pub fn library_failed(message: impl Into<String>) -> Self {
        HError::new(ErrorKind::LibraryFailed {
            message: message.into(),
        })
    }

    pub fn null_reference() -> Self {
        HError::new(ErrorKind::NullReference)
    }

    pub fn illegal_reference(message: impl Into<String>) -> Self {
        HError::new(ErrorKind::IllegalReference {
            message: message.into(),
        })
    }

    pub fn fiber_internal(message: impl Into<String>) -> Self {
        HError::new(ErrorKind::FiberInternal {
            message: message.into(),
        })
    }

    pub fn generic(message: impl Into<String>) -> Self {
        HError::new(ErrorKind::Generic {
            message: message.into(),
        })
    }
}
