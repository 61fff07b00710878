//! Error types for the host side of the boundary.

use std::fmt;

use thiserror::Error;

use super::value::{ObjRef, Value};

/// A guest exception caught by the trampoline.
#[derive(Debug, Clone, PartialEq)]
pub struct GuestException {
    /// The exception object. Pinned in the GC arena when it is handed out.
    pub value: Value,
    pub class_name: String,
    pub message: String,
    /// Method names from innermost to outermost at the point of the raise.
    pub backtrace: Vec<String>,
}

impl fmt::Display for GuestException {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.class_name, self.message)
    }
}

/// Main error type for boundary operations
#[derive(Error, Debug, Clone, PartialEq)]
pub enum BridgeError {
    #[error("wrong value tag: expected {expected}, found {found}")]
    WrongTag {
        expected: &'static str,
        found: &'static str,
    },

    #[error("reference to a collected object: {0:?}")]
    DeadReference(ObjRef),

    #[error("guest raised {0}")]
    Raised(GuestException),

    #[error("guest heap exhausted with {live} live objects")]
    HeapExhausted { live: usize },

    #[error("unknown class: {0}")]
    UnknownClass(String),

    #[error("exception slot holds a value that is not an exception")]
    NotAnException,

    /// Failure reported by host code; raised in the guest as a RuntimeError.
    #[error("{0}")]
    Host(String),
}

impl BridgeError {
    pub fn host(message: impl Into<String>) -> Self {
        BridgeError::Host(message.into())
    }

    /// The guest exception, if this error is a contained raise.
    pub fn guest_exception(&self) -> Option<&GuestException> {
        match self {
            BridgeError::Raised(exc) => Some(exc),
            _ => None,
        }
    }
}

/// Result type alias
pub type BridgeResult<T> = Result<T, BridgeError>;
