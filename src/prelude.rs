//! Prelude module for convenient imports.

pub use crate::dispatcher::{DispatchOutcome, DispatcherConfig, EventDispatcher, HandlerCode};
pub use crate::error::{ErrorKind, Result, SandboxError};
pub use crate::sandbox::{
    config::SandboxConfig,
    executor::{ExecutionResult, SecureSandbox},
    globals::Action,
};
pub use crate::validator::CodeValidator;
