//! The guest interpreter host: one QuickJS runtime with a memory ceiling,
//! an interrupt hook, and the context guest code is evaluated in.

use std::cell::RefCell;

use rquickjs::{Context, Ctx, Runtime, Value};
use serde_json::Value as JsonValue;

use crate::error::{classify_guest_exception, Result, SandboxError};
use crate::sandbox::limits::{ArmedClock, ExecutionClock};
use crate::sandbox::marshal::{self, DumpError, DumpLimits};

/// Owns the runtime and its current context.
///
/// The runtime lives as long as the host; the context can be disposed and
/// replaced when an evaluation leaves it in a doubtful state.
pub struct GuestHost {
    runtime: Runtime,
    context: RefCell<Option<Context>>,
    clock: ExecutionClock,
    memory_limit: usize,
}

impl GuestHost {
    /// Allocate a runtime whose allocations fail past `memory_limit` bytes.
    pub fn create(memory_limit: usize, max_stack_size: usize, clock: ExecutionClock) -> Result<Self> {
        let runtime = Runtime::new().map_err(|e| {
            SandboxError::Initialization(format!("failed to create runtime: {e}"))
        })?;
        runtime.set_memory_limit(memory_limit);
        runtime.set_max_stack_size(max_stack_size);

        Ok(Self {
            runtime,
            context: RefCell::new(None),
            clock,
            memory_limit,
        })
    }

    /// Install the predicate the engine polls between bytecode steps.
    /// Returning `true` aborts the running evaluation.
    pub fn install_interrupt_check<F>(&self, predicate: F)
    where
        F: FnMut() -> bool + Send + 'static,
    {
        self.runtime.set_interrupt_handler(Some(Box::new(predicate)));
    }

    /// Create a context with its own global object. It is not installed;
    /// see [`GuestHost::replace_context`].
    pub fn new_context(&self) -> Result<Context> {
        Context::full(&self.runtime)
            .map_err(|e| SandboxError::Initialization(format!("failed to create context: {e}")))
    }

    /// Make `context` the one evaluations run in, returning the previous one.
    pub fn replace_context(&self, context: Context) -> Option<Context> {
        self.context.borrow_mut().replace(context)
    }

    /// Whether a context is currently installed.
    pub fn has_context(&self) -> bool {
        self.context.borrow().is_some()
    }

    /// Evaluate `source` and copy its completion value out to the host.
    ///
    /// The interrupt clock is armed for the whole evaluation, including the
    /// copy-out, since reading guest properties can run guest getters.
    pub fn eval(&self, source: &str) -> Result<Option<JsonValue>> {
        let context = self.current_context()?;
        let _armed = ArmedClock::start(&self.clock);

        let limits = self.dump_limits();
        context.with(|ctx| match ctx.eval::<Value, _>(source) {
            Ok(value) => marshal::dump_within(&value, &limits).map_err(|err| match err {
                DumpError::Engine(err) => self.classify(&ctx, err),
                DumpError::Interrupted => SandboxError::Timeout(self.clock.timeout()),
                other => SandboxError::Marshal(other.describe()),
            }),
            Err(err) => Err(self.classify(&ctx, err)),
        })
    }

    /// Copy-out bounds for this runtime: the memory ceiling as byte budget,
    /// polled against the execution clock.
    pub fn dump_limits(&self) -> DumpLimits {
        DumpLimits::new(self.memory_limit).with_clock(self.clock.clone())
    }

    /// Run `f` inside the current context.
    pub fn with_context<F, R>(&self, f: F) -> Result<R>
    where
        F: for<'js> FnOnce(Ctx<'js>) -> R,
    {
        let context = self.current_context()?;
        Ok(context.with(f))
    }

    /// Release the current context. Safe to call repeatedly and after a
    /// failed evaluation.
    pub fn dispose_context(&self) {
        self.context.borrow_mut().take();
    }

    /// Run a full garbage collection cycle.
    pub fn collect_garbage(&self) {
        self.runtime.run_gc();
    }

    /// Release the context and then the runtime.
    pub fn dispose(self) {
        self.dispose_context();
        drop(self.runtime);
    }

    fn current_context(&self) -> Result<Context> {
        self.context
            .borrow()
            .clone()
            .ok_or_else(|| SandboxError::System("guest context is not available".to_string()))
    }

    /// Map an engine error to the failure taxonomy, consuming the pending
    /// guest exception if there is one.
    fn classify(&self, ctx: &Ctx<'_>, err: rquickjs::Error) -> SandboxError {
        let thrown = match err {
            rquickjs::Error::Exception => Some(ctx.catch()),
            _ => None,
        };

        if self.clock.timed_out() {
            return SandboxError::Timeout(self.clock.timeout());
        }

        match (err, thrown) {
            (_, Some(thrown)) => describe_thrown(&thrown, self.memory_limit),
            (rquickjs::Error::Allocation, None) => SandboxError::OutOfMemory {
                limit_bytes: self.memory_limit,
            },
            (other, None) => SandboxError::Runtime {
                message: other.to_string(),
                stack: None,
            },
        }
    }
}

/// Errors are reported as `Name: message` with their stack; any other
/// thrown value is rendered as JSON text.
fn describe_thrown(thrown: &Value<'_>, memory_limit: usize) -> SandboxError {
    if let Some(object) = thrown.as_object() {
        let name = object.get::<_, Option<String>>("name").ok().flatten();
        let message = object.get::<_, Option<String>>("message").ok().flatten();
        if name.is_some() || message.is_some() {
            let stack = object
                .get::<_, Option<String>>("stack")
                .ok()
                .flatten()
                .filter(|stack| !stack.trim().is_empty());
            return classify_guest_exception(
                name.as_deref(),
                message.as_deref().unwrap_or_default(),
                stack,
                memory_limit,
            );
        }
    }
    classify_guest_exception(None, &marshal::render(thrown), None, memory_limit)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::{Duration, Instant};

    fn host_with_timeout(timeout: Duration) -> GuestHost {
        let clock = ExecutionClock::new(timeout);
        let host = GuestHost::create(16 * 1024 * 1024, 256 * 1024, clock.clone()).unwrap();
        host.install_interrupt_check(move || clock.should_interrupt());
        let context = host.new_context().unwrap();
        host.replace_context(context);
        host
    }

    #[test]
    fn test_eval_returns_copied_value() {
        let host = host_with_timeout(Duration::from_secs(5));
        let value = host.eval("({ sum: 1 + 2, list: ['a'] })").unwrap();
        assert_eq!(value, Some(json!({"sum": 3, "list": ["a"]})));
    }

    #[test]
    fn test_thrown_error_is_classified() {
        let host = host_with_timeout(Duration::from_secs(5));
        let err = host.eval("throw new TypeError('bad input')").unwrap_err();
        match err {
            SandboxError::Runtime { message, .. } => assert_eq!(message, "TypeError: bad input"),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_thrown_primitive_is_rendered() {
        let host = host_with_timeout(Duration::from_secs(5));
        let err = host.eval("throw { code: 7 }").unwrap_err();
        assert_eq!(err.to_string(), r#"{"code":7}"#);
    }

    #[test]
    fn test_syntax_error() {
        let host = host_with_timeout(Duration::from_secs(5));
        let err = host.eval("let = ;").unwrap_err();
        assert!(matches!(err, SandboxError::Syntax { .. }));
    }

    #[test]
    fn test_busy_loop_is_interrupted() {
        let host = host_with_timeout(Duration::from_millis(50));
        let started = Instant::now();
        let err = host.eval("while (true) {}").unwrap_err();
        assert!(err.is_timeout());
        assert!(started.elapsed() < Duration::from_secs(2));

        // The runtime stays usable once the clock is re-armed.
        assert_eq!(host.eval("1 + 1").unwrap(), Some(json!(2)));
    }

    #[test]
    fn test_missing_context() {
        let host = host_with_timeout(Duration::from_secs(1));
        host.dispose_context();
        host.dispose_context();
        assert!(!host.has_context());
        assert!(matches!(host.eval("1"), Err(SandboxError::System(_))));
    }
}
