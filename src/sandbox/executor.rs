//! Core execution engine: lifecycle, code wrapping and result capture.

use std::time::{Duration, Instant};

use serde::de::DeserializeOwned;
use serde_json::Value as JsonValue;
use tokio::sync::OnceCell;

use crate::error::{ErrorKind, Result, SandboxError};
use crate::sandbox::config::SandboxConfig;
use crate::sandbox::globals::{self, Action, Bridge, DISPATCH_PRIMITIVE, GET_STATE_PRIMITIVE};
use crate::sandbox::host::GuestHost;
use crate::sandbox::io::ConsoleCapture;
use crate::sandbox::limits::ExecutionClock;

/// Names the wrapped program binds as locals before the handler body runs.
pub(crate) const LOCAL_BINDINGS: [&str; 4] =
    ["dispatch", "getState", "setComponentData", "setComponentConfig"];

/// Result of one guest evaluation.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionResult<T = JsonValue> {
    /// Whether the evaluation completed without throwing.
    pub success: bool,
    /// Completion value; `None` on failure or when the guest produced `undefined`.
    pub value: Option<T>,
    /// Rendered failure message.
    pub error: Option<String>,
    /// Failure classification.
    pub error_kind: Option<ErrorKind>,
    /// Guest stack trace, if the thrown value carried one.
    pub stack: Option<String>,
    /// Wall-clock time from call entry to return.
    pub duration: Duration,
}

impl<T> ExecutionResult<T> {
    /// A successful result.
    pub fn success(value: Option<T>, duration: Duration) -> Self {
        Self {
            success: true,
            value,
            error: None,
            error_kind: None,
            stack: None,
            duration,
        }
    }

    /// A failed result describing `err`.
    pub fn failure(err: &SandboxError, duration: Duration) -> Self {
        Self {
            success: false,
            value: None,
            error: Some(err.to_string()),
            error_kind: Some(err.kind()),
            stack: err.stack().map(str::to_string),
            duration,
        }
    }

    /// Check if the execution was successful.
    pub fn is_success(&self) -> bool {
        self.success
    }

    /// Check if the evaluation was interrupted by the time limit.
    pub fn is_timeout(&self) -> bool {
        self.error_kind == Some(ErrorKind::Timeout)
    }

    /// Check if the evaluation hit the memory ceiling.
    pub fn is_memory_limit(&self) -> bool {
        self.error_kind == Some(ErrorKind::OutOfMemory)
    }

    /// Duration in whole milliseconds.
    pub fn duration_ms(&self) -> u128 {
        self.duration.as_millis()
    }
}

impl ExecutionResult<JsonValue> {
    /// Convert the value into a typed one. A value that does not fit `U`
    /// turns the result into a marshal failure.
    pub fn deserialize<U: DeserializeOwned>(self) -> ExecutionResult<U> {
        let Self {
            success,
            value,
            error,
            error_kind,
            stack,
            duration,
        } = self;

        match value.map(serde_json::from_value::<U>).transpose() {
            Ok(value) => ExecutionResult {
                success,
                value,
                error,
                error_kind,
                stack,
                duration,
            },
            Err(err) => ExecutionResult::failure(&SandboxError::Marshal(err.to_string()), duration),
        }
    }
}

/// An isolated guest interpreter bound to one pair of host callbacks.
///
/// The interpreter is brought up lazily on first use. A sandbox runs one
/// evaluation at a time and is not `Send`; hosts that fire events
/// concurrently should queue them or give each source its own sandbox.
pub struct SecureSandbox {
    config: SandboxConfig,
    bridge: Bridge,
    console: ConsoleCapture,
    clock: ExecutionClock,
    host: OnceCell<std::result::Result<GuestHost, SandboxError>>,
    destroyed: bool,
}

impl std::fmt::Debug for SecureSandbox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecureSandbox")
            .field("config", &self.config)
            .field("initialized", &self.host.initialized())
            .field("destroyed", &self.destroyed)
            .finish()
    }
}

impl SecureSandbox {
    /// Create a sandbox whose guest `dispatch`/`getState` call the given closures.
    pub fn new<D, S>(dispatch: D, get_state: S, config: SandboxConfig) -> Self
    where
        D: Fn(Action) -> anyhow::Result<()> + Send + Sync + 'static,
        S: Fn() -> anyhow::Result<JsonValue> + Send + Sync + 'static,
    {
        Self::with_bridge(Bridge::new(dispatch, get_state), config)
    }

    /// Create a sandbox from an existing bridge.
    pub fn with_bridge(bridge: Bridge, config: SandboxConfig) -> Self {
        let console = if config.enable_console {
            ConsoleCapture::new(config.max_console_entries)
        } else {
            ConsoleCapture::silent()
        };
        let clock = ExecutionClock::new(config.timeout);

        Self {
            config,
            bridge,
            console,
            clock,
            host: OnceCell::new(),
            destroyed: false,
        }
    }

    /// Get the sandbox configuration.
    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    /// Guest console output retained so far.
    pub fn console(&self) -> &ConsoleCapture {
        &self.console
    }

    /// Whether initialization has completed, successfully or not.
    pub fn is_initialized(&self) -> bool {
        self.host.initialized()
    }

    /// Whether [`SecureSandbox::destroy`] has been called.
    pub fn is_destroyed(&self) -> bool {
        self.destroyed
    }

    /// Bring up the runtime and context.
    ///
    /// Idempotent; concurrent callers await the same bring-up. A failure is
    /// remembered and returned on every later call.
    pub async fn initialize(&self) -> Result<()> {
        self.host().await.map(|_| ())
    }

    async fn host(&self) -> Result<&GuestHost> {
        if self.destroyed {
            return Err(SandboxError::Destroyed);
        }
        self.host
            .get_or_init(|| async { self.bring_up() })
            .await
            .as_ref()
            .map_err(Clone::clone)
    }

    fn bring_up(&self) -> Result<GuestHost> {
        let host = GuestHost::create(
            self.config.memory_limit_bytes(),
            self.config.max_stack_size,
            self.clock.clone(),
        )?;
        let clock = self.clock.clone();
        host.install_interrupt_check(move || clock.should_interrupt());
        self.install_context(&host)?;

        tracing::debug!(
            memory_limit_mb = self.config.memory_limit_mb,
            timeout_ms = self.config.timeout.as_millis() as u64,
            "sandbox initialized"
        );
        Ok(host)
    }

    /// Create a fresh context, run the global injector and make it current.
    fn install_context(&self, host: &GuestHost) -> Result<()> {
        let context = host.new_context()?;
        let limits = host.dump_limits();
        context
            .with(|ctx| {
                globals::install(&ctx, &self.bridge, &self.config, &self.console, &limits)
            })
            .map_err(|e| SandboxError::Initialization(format!("failed to install globals: {e}")))?;
        host.replace_context(context);
        Ok(())
    }

    /// Evaluate `code` as a function body.
    ///
    /// Guest failures (parse errors, exceptions, timeouts, memory) come back
    /// as failed results. `Err` is reserved for failures of the sandbox
    /// itself: destroyed, oversized code, or a failed bring-up.
    pub async fn run(&self, code: &str) -> Result<ExecutionResult> {
        let started = Instant::now();

        if code.len() > self.config.max_code_size {
            return Err(SandboxError::CodeTooLarge {
                max: self.config.max_code_size,
                actual: code.len(),
            });
        }
        let host = self.host().await?;

        let program = wrap_program(code);
        let outcome = host.eval(&program);
        let duration = started.elapsed();

        match outcome {
            Ok(value) => {
                tracing::debug!(duration_ms = duration.as_millis() as u64, "execution finished");
                Ok(ExecutionResult::success(value, duration))
            }
            Err(err) => {
                tracing::warn!(
                    kind = %err.kind(),
                    duration_ms = duration.as_millis() as u64,
                    "execution failed: {}",
                    err
                );
                if err.taints_context() {
                    self.recover(host);
                }
                Ok(ExecutionResult::failure(&err, duration))
            }
        }
    }

    /// Evaluate `code`, folding every failure into the result.
    pub async fn execute(&self, code: &str) -> ExecutionResult {
        let started = Instant::now();
        match self.run(code).await {
            Ok(result) => result,
            Err(err) => {
                tracing::warn!(kind = %err.kind(), "execution refused: {}", err);
                ExecutionResult::failure(&err, started.elapsed())
            }
        }
    }

    /// Evaluate `code` and convert the value into `T`.
    pub async fn execute_as<T: DeserializeOwned>(&self, code: &str) -> ExecutionResult<T> {
        self.execute(code).await.deserialize()
    }

    /// Replace a context that was interrupted or ran out of memory.
    fn recover(&self, host: &GuestHost) {
        host.dispose_context();
        host.collect_garbage();
        match self.install_context(host) {
            Ok(()) => tracing::debug!("guest context recreated"),
            Err(err) => tracing::error!("failed to recreate guest context: {}", err),
        }
    }

    /// Release the context and runtime. Safe to call more than once and
    /// before initialization; the sandbox refuses to run code afterwards.
    pub fn destroy(&mut self) {
        if let Some(Ok(host)) = self.host.take() {
            host.dispose();
            tracing::debug!("sandbox destroyed");
        }
        self.destroyed = true;
    }
}

impl Drop for SecureSandbox {
    fn drop(&mut self) {
        self.destroy();
    }
}

/// Wrap handler code in an immediately-invoked function that receives the
/// bridge primitives and helpers as parameters, so guest code sees them as
/// plain local names even if the globals were reassigned.
fn wrap_program(code: &str) -> String {
    format!(
        "(function ({params}) {{\n{code}\n}})({DISPATCH_PRIMITIVE}, {GET_STATE_PRIMITIVE}, \
         setComponentData, setComponentConfig)",
        params = LOCAL_BINDINGS.join(", "),
    )
}

/// Construct a sandbox, run `code` once and tear it down.
pub async fn execute_in_sandbox<D, S>(
    code: &str,
    dispatch: D,
    get_state: S,
    config: SandboxConfig,
) -> ExecutionResult
where
    D: Fn(Action) -> anyhow::Result<()> + Send + Sync + 'static,
    S: Fn() -> anyhow::Result<JsonValue> + Send + Sync + 'static,
{
    let mut sandbox = SecureSandbox::new(dispatch, get_state, config);
    let result = sandbox.execute(code).await;
    sandbox.destroy();
    result
}
