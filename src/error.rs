//! Error types for the event sandbox.

use std::fmt;
use std::time::Duration;

use thiserror::Error;

/// Errors that can occur while validating, marshaling or executing guest code.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SandboxError {
    /// Static validation flagged the code. Advisory only: execution still
    /// goes through the isolated context.
    #[error("validation failed: {0}")]
    Validation(String),

    /// The guest code could not be parsed.
    #[error("{message}")]
    Syntax {
        /// Parser message, e.g. `SyntaxError: unexpected token in expression`.
        message: String,
        /// Guest stack trace, if the engine produced one.
        stack: Option<String>,
    },

    /// The guest code threw while running.
    #[error("{message}")]
    Runtime {
        /// Rendered exception, e.g. `TypeError: not a function`.
        message: String,
        /// Guest stack trace, if the thrown value carried one.
        stack: Option<String>,
    },

    /// The interrupt predicate fired before the evaluation finished.
    #[error("execution timed out after {0:?}")]
    Timeout(Duration),

    /// A guest allocation hit the runtime's memory ceiling.
    #[error("memory limit of {limit_bytes} bytes exceeded")]
    OutOfMemory {
        /// Configured ceiling in bytes.
        limit_bytes: usize,
    },

    /// A value could not cross the host/guest boundary.
    #[error("marshal error: {0}")]
    Marshal(String),

    /// The interpreter runtime or context could not be brought up.
    #[error("sandbox initialization failed: {0}")]
    Initialization(String),

    /// The code exceeds the configured size limit.
    #[error("code size {actual} bytes exceeds limit of {max} bytes")]
    CodeTooLarge {
        /// Configured limit in bytes.
        max: usize,
        /// Size of the rejected code.
        actual: usize,
    },

    /// The sandbox was destroyed and cannot run code anymore.
    #[error("sandbox has been destroyed")]
    Destroyed,

    /// Anything not attributable to the guest.
    #[error("system error: {0}")]
    System(String),
}

/// Coarse classification of a [`SandboxError`], carried on failed results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    ValidationFailure,
    SyntaxError,
    RuntimeError,
    Timeout,
    OutOfMemory,
    MarshalError,
    InitializationFailure,
    SystemError,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::ValidationFailure => "validation_failure",
            ErrorKind::SyntaxError => "syntax_error",
            ErrorKind::RuntimeError => "runtime_error",
            ErrorKind::Timeout => "timeout",
            ErrorKind::OutOfMemory => "out_of_memory",
            ErrorKind::MarshalError => "marshal_error",
            ErrorKind::InitializationFailure => "initialization_failure",
            ErrorKind::SystemError => "system_error",
        };
        f.write_str(name)
    }
}

impl SandboxError {
    /// The taxonomy bucket this error falls into.
    pub fn kind(&self) -> ErrorKind {
        match self {
            SandboxError::Validation(_) => ErrorKind::ValidationFailure,
            SandboxError::Syntax { .. } => ErrorKind::SyntaxError,
            SandboxError::Runtime { .. } => ErrorKind::RuntimeError,
            SandboxError::Timeout(_) => ErrorKind::Timeout,
            SandboxError::OutOfMemory { .. } => ErrorKind::OutOfMemory,
            SandboxError::Marshal(_) => ErrorKind::MarshalError,
            SandboxError::Initialization(_) => ErrorKind::InitializationFailure,
            SandboxError::CodeTooLarge { .. }
            | SandboxError::Destroyed
            | SandboxError::System(_) => ErrorKind::SystemError,
        }
    }

    /// Check if this error represents a timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(self, SandboxError::Timeout(_))
    }

    /// Check if this error represents a memory limit violation.
    pub fn is_memory_limit(&self) -> bool {
        matches!(self, SandboxError::OutOfMemory { .. })
    }

    /// Check if this error was thrown by guest code (parse or runtime).
    pub fn is_guest_exception(&self) -> bool {
        matches!(self, SandboxError::Syntax { .. } | SandboxError::Runtime { .. })
    }

    /// Guest stack trace, when one was captured.
    pub fn stack(&self) -> Option<&str> {
        match self {
            SandboxError::Syntax { stack, .. } | SandboxError::Runtime { stack, .. } => {
                stack.as_deref()
            }
            _ => None,
        }
    }

    /// Whether the guest context may be left in a bad state and should be
    /// recreated before the next evaluation.
    pub fn taints_context(&self) -> bool {
        matches!(
            self,
            SandboxError::Timeout(_) | SandboxError::OutOfMemory { .. }
        )
    }
}

/// Result type alias for sandbox operations.
pub type Result<T> = std::result::Result<T, SandboxError>;

/// Classify an exception thrown inside the guest.
///
/// `name` and `message` are the `name`/`message` properties of the thrown
/// value when it is an `Error`; `memory_limit` is the runtime ceiling used
/// to report allocation failures.
pub fn classify_guest_exception(
    name: Option<&str>,
    message: &str,
    stack: Option<String>,
    memory_limit: usize,
) -> SandboxError {
    if name == Some("InternalError") && message.contains("out of memory") {
        return SandboxError::OutOfMemory {
            limit_bytes: memory_limit,
        };
    }

    let rendered = match name {
        Some(name) if message.is_empty() => name.to_string(),
        Some(name) => format!("{name}: {message}"),
        None => message.to_string(),
    };

    if name == Some("SyntaxError") {
        SandboxError::Syntax {
            message: rendered,
            stack,
        }
    } else {
        SandboxError::Runtime {
            message: rendered,
            stack,
        }
    }
}
