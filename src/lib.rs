//! # Event Sandbox
//!
//! A secure execution environment for untrusted event-handler scripts.
//!
//! UI documents bind JavaScript snippets to events. This crate runs those
//! snippets in an isolated QuickJS interpreter (through `rquickjs`) and
//! feeds event payloads and host context into them. It enforces strict
//! security boundaries including:
//!
//! - **Memory limits**: the guest runtime's allocator fails past a configured ceiling
//! - **Timeout protection**: an interrupt predicate polled between bytecode steps
//! - **Host isolation**: no page, network or storage APIs exist inside the guest
//! - **Copy-only marshaling**: values cross the boundary as deep JSON-plain copies
//! - **Narrow bridge**: `dispatch(action)` and `getState()` are the only way out
//!
//! ## Example
//!
//! ```rust,no_run
//! use event_sandbox_rs::prelude::*;
//! use serde_json::json;
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() -> Result<()> {
//!     let mut dispatcher = EventDispatcher::new(
//!         |action| {
//!             println!("dispatched {}", action.kind);
//!             Ok(())
//!         },
//!         || Ok(json!({ "count": 1 })),
//!         DispatcherConfig::default(),
//!     );
//!     dispatcher.set_context("appName", "Demo");
//!
//!     let outcome = dispatcher
//!         .execute("console.log(appName); return appName.length;", None, &[])
//!         .await?;
//!     assert_eq!(outcome.handler_value(), Some(&json!(4)));
//!
//!     dispatcher.destroy();
//!     Ok(())
//! }
//! ```
//!
//! ## Security Model
//!
//! The sandbox provides defense-in-depth through multiple isolation layers:
//!
//! 1. **Interpreter isolation**: guest code runs in its own QuickJS runtime and context
//! 2. **Curated globals**: JSON, Math, Date and console are host-side re-implementations
//! 3. **Resource limits**: memory and execution time are bounded
//! 4. **Step-level interruption**: busy loops without calls are still stopped
//! 5. **Static validation**: dangerous patterns are reported, never trusted as the boundary

pub mod dispatcher;
pub mod error;
pub mod prelude;
pub mod sandbox;
pub mod validator;

// Re-export main types at crate root for convenience
pub use dispatcher::{
    ContextValue, DispatchOutcome, DispatcherConfig, EventDispatcher, EventHandler, HandlerCode,
};
pub use error::{ErrorKind, Result, SandboxError};
pub use sandbox::cache::ValidationCache;
pub use sandbox::config::{SandboxConfig, SandboxConfigBuilder};
pub use sandbox::executor::{execute_in_sandbox, ExecutionResult, SecureSandbox};
pub use sandbox::globals::{Action, Bridge};
pub use sandbox::io::{ConsoleCapture, ConsoleEntry, ConsoleLevel};
pub use validator::{
    CodeValidator, DangerousPattern, PatternKind, Severity, SyntaxCheck, ValidationResult,
};
