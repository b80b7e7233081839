//! Host-facing event dispatch.
//!
//! An [`EventDispatcher`] turns handler code bound to a UI event into a
//! self-contained program (context bindings, the event payload, extra
//! arguments, a console shim and the handler body) and runs it through one
//! [`SecureSandbox`].

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::{Map, Value as JsonValue};

use crate::error::{ErrorKind, Result, SandboxError};
use crate::sandbox::cache::ValidationCache;
use crate::sandbox::config::SandboxConfig;
use crate::sandbox::executor::{ExecutionResult, SecureSandbox};
use crate::sandbox::globals::{Action, Bridge};
use crate::sandbox::io::{ConsoleCapture, ConsoleLevel};
use crate::validator::ValidationResult;

/// Names the generated program binds itself; context entries using them
/// are skipped.
const RESERVED_NAMES: &[&str] = &[
    "event",
    "console",
    "dispatch",
    "getState",
    "setComponentData",
    "setComponentConfig",
];

const JS_KEYWORDS: &[&str] = &[
    "await", "break", "case", "catch", "class", "const", "continue", "debugger", "default",
    "delete", "do", "else", "enum", "export", "extends", "false", "finally", "for", "function",
    "if", "implements", "import", "in", "instanceof", "interface", "let", "new", "null",
    "package", "private", "protected", "public", "return", "static", "super", "switch", "this",
    "throw", "true", "try", "typeof", "var", "void", "while", "with", "yield", "arguments",
    "eval", "undefined", "NaN", "Infinity",
];

/// Code bound to one event: a single snippet or a chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandlerCode {
    Single(String),
    /// Run in order, stopping at the first failure.
    Chain(Vec<String>),
}

impl From<&str> for HandlerCode {
    fn from(code: &str) -> Self {
        HandlerCode::Single(code.to_string())
    }
}

impl From<String> for HandlerCode {
    fn from(code: String) -> Self {
        HandlerCode::Single(code)
    }
}

impl From<Vec<String>> for HandlerCode {
    fn from(chain: Vec<String>) -> Self {
        HandlerCode::Chain(chain)
    }
}

impl From<Vec<&str>> for HandlerCode {
    fn from(chain: Vec<&str>) -> Self {
        HandlerCode::Chain(chain.into_iter().map(str::to_string).collect())
    }
}

/// What [`EventDispatcher::execute`] produced, mirroring the [`HandlerCode`] shape.
#[derive(Debug, Clone, PartialEq)]
pub enum DispatchOutcome {
    Single(ExecutionResult),
    /// Results up to and including the first failure.
    Chain(Vec<ExecutionResult>),
}

impl DispatchOutcome {
    /// All results as a slice.
    pub fn results(&self) -> &[ExecutionResult] {
        match self {
            DispatchOutcome::Single(result) => std::slice::from_ref(result),
            DispatchOutcome::Chain(results) => results,
        }
    }

    /// Whether every produced result succeeded.
    pub fn is_success(&self) -> bool {
        self.results().iter().all(ExecutionResult::is_success)
    }

    /// The value a bound handler resolves to.
    ///
    /// A single result yields its value when it succeeded. A chain yields the
    /// value of the last successful result found scanning backwards, which is
    /// not necessarily the final element.
    pub fn handler_value(&self) -> Option<&JsonValue> {
        match self {
            DispatchOutcome::Single(result) if result.success => result.value.as_ref(),
            DispatchOutcome::Single(_) => None,
            DispatchOutcome::Chain(results) => results
                .iter()
                .rev()
                .find(|r| r.success)
                .and_then(|r| r.value.as_ref()),
        }
    }

    /// Take the single result. A chain yields its last result.
    pub fn into_last(self) -> Option<ExecutionResult> {
        match self {
            DispatchOutcome::Single(result) => Some(result),
            DispatchOutcome::Chain(results) => results.into_iter().last(),
        }
    }
}

/// A host-side context entry as the guest program will see it.
#[derive(Debug, Clone, PartialEq)]
pub enum ContextValue {
    /// JSON data emitted as a constant binding.
    Data(JsonValue),
    /// A bridge primitive; bound by the sandbox, never serialized.
    Bridge(&'static str),
    /// A value that could not be serialized; skipped with the reason.
    Unserializable(String),
}

/// Configuration for an [`EventDispatcher`].
#[derive(Debug, Clone, Default)]
pub struct DispatcherConfig {
    /// Configuration of the underlying sandbox.
    pub sandbox: SandboxConfig,
    /// Initial context entries.
    pub context: Map<String, JsonValue>,
    /// Return system-level failures as `Err` instead of a failed result.
    pub throw_on_error: bool,
}

impl DispatcherConfig {
    pub fn with_sandbox(mut self, sandbox: SandboxConfig) -> Self {
        self.sandbox = sandbox;
        self
    }

    pub fn with_context(mut self, key: impl Into<String>, value: JsonValue) -> Self {
        self.context.insert(key.into(), value);
        self
    }

    pub fn with_throw_on_error(mut self, throw_on_error: bool) -> Self {
        self.throw_on_error = throw_on_error;
        self
    }
}

/// Per-call inputs of the generated program. Rebuilt for every call.
struct ExecutionContext<'a> {
    event: Option<&'a JsonValue>,
    extra_args: &'a [JsonValue],
    context_vars: BTreeMap<String, ContextValue>,
}

impl ExecutionContext<'_> {
    fn build_program(&self, code: &str) -> String {
        let mut program = String::new();

        for (key, value) in &self.context_vars {
            let line = match (binding_problem(key), value) {
                (Some(problem), _) => format!("// skipped context entry: {problem}"),
                (None, ContextValue::Data(data)) => {
                    format!("const {key} = {};", js_literal(data))
                }
                (None, ContextValue::Bridge(name)) => format!("// {name}: bound by the sandbox"),
                (None, ContextValue::Unserializable(reason)) => {
                    format!("// skipped {key}: {}", single_line(reason))
                }
            };
            program.push_str(&line);
            program.push('\n');
        }

        match self.event {
            Some(event) => program.push_str(&format!("const event = {};\n", js_literal(event))),
            None => program.push_str("const event = undefined;\n"),
        }
        for (index, arg) in self.extra_args.iter().enumerate() {
            program.push_str(&format!("const arg{index} = {};\n", js_literal(arg)));
        }

        let shim = ConsoleLevel::ALL
            .iter()
            .map(|level| {
                let method = level.method();
                format!("  {method}: (...args) => __console_{method}(...args),")
            })
            .collect::<Vec<_>>()
            .join("\n");
        program.push_str(&format!("const console = {{\n{shim}\n}};\n"));

        program.push_str(code);
        program
    }
}

/// Why `key` cannot become a binding, if it cannot.
fn binding_problem(key: &str) -> Option<&'static str> {
    let mut chars = key.chars();
    let valid_start = chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_' || c == '$');
    if !valid_start || !chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '$') {
        return Some("not a valid identifier");
    }
    if JS_KEYWORDS.contains(&key) {
        return Some("reserved word");
    }
    let is_arg = key
        .strip_prefix("arg")
        .is_some_and(|rest| !rest.is_empty() && rest.chars().all(|c| c.is_ascii_digit()));
    if is_arg || RESERVED_NAMES.contains(&key) {
        return Some("name is bound by the dispatcher");
    }
    None
}

/// JSON text as a guest expression. A `"__proto__"` key in an object
/// literal sets the prototype, so that key is written in computed form.
fn js_literal(value: &JsonValue) -> String {
    let mut out = String::new();
    write_literal(value, &mut out);
    out
}

fn write_literal(value: &JsonValue, out: &mut String) {
    match value {
        JsonValue::Array(items) => {
            out.push('[');
            for (index, item) in items.iter().enumerate() {
                if index > 0 {
                    out.push(',');
                }
                write_literal(item, out);
            }
            out.push(']');
        }
        JsonValue::Object(map) => {
            out.push('{');
            for (index, (key, item)) in map.iter().enumerate() {
                if index > 0 {
                    out.push(',');
                }
                let quoted = JsonValue::String(key.clone()).to_string();
                if key == "__proto__" {
                    out.push('[');
                    out.push_str(&quoted);
                    out.push(']');
                } else {
                    out.push_str(&quoted);
                }
                out.push(':');
                write_literal(item, out);
            }
            out.push('}');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

fn single_line(text: &str) -> String {
    text.chars()
        .map(|c| match c {
            '\n' | '\r' | '\u{2028}' | '\u{2029}' => ' ',
            other => other,
        })
        .collect()
}

/// Runs event handler code inside one sandbox.
pub struct EventDispatcher {
    sandbox: SecureSandbox,
    context: BTreeMap<String, ContextValue>,
    throw_on_error: bool,
    validation: Arc<ValidationCache>,
}

impl std::fmt::Debug for EventDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventDispatcher")
            .field("sandbox", &self.sandbox)
            .field("context", &self.context.keys().collect::<Vec<_>>())
            .field("throw_on_error", &self.throw_on_error)
            .finish()
    }
}

impl EventDispatcher {
    /// Create a dispatcher whose guest `dispatch`/`getState` call the given closures.
    pub fn new<D, S>(dispatch: D, get_state: S, config: DispatcherConfig) -> Self
    where
        D: Fn(Action) -> anyhow::Result<()> + Send + Sync + 'static,
        S: Fn() -> anyhow::Result<JsonValue> + Send + Sync + 'static,
    {
        Self::with_bridge(Bridge::new(dispatch, get_state), config)
    }

    /// Create a dispatcher from an existing bridge.
    pub fn with_bridge(bridge: Bridge, config: DispatcherConfig) -> Self {
        let DispatcherConfig {
            sandbox,
            context,
            throw_on_error,
        } = config;

        Self {
            sandbox: SecureSandbox::with_bridge(bridge, sandbox),
            context: context
                .into_iter()
                .map(|(key, value)| (key, ContextValue::Data(value)))
                .collect(),
            throw_on_error,
            validation: Arc::new(ValidationCache::new()),
        }
    }

    /// Share `cache` with other dispatchers instead of using a private one.
    pub fn with_validation_cache(mut self, cache: Arc<ValidationCache>) -> Self {
        self.validation = cache;
        self
    }

    /// Eagerly bring up the sandbox.
    pub async fn initialize(&self) -> Result<()> {
        self.sandbox.initialize().await
    }

    /// Set a context entry. Values that fail to serialize are kept and
    /// reported as skipped in the generated program.
    pub fn set_context<V: Serialize>(&mut self, key: impl Into<String>, value: V) {
        let value = match serde_json::to_value(value) {
            Ok(data) => ContextValue::Data(data),
            Err(err) => ContextValue::Unserializable(err.to_string()),
        };
        self.context.insert(key.into(), value);
    }

    /// The context with the two bridge primitives overlaid.
    pub fn get_context(&self) -> BTreeMap<String, ContextValue> {
        let mut context = self.context.clone();
        context.insert("dispatch".to_string(), ContextValue::Bridge("dispatch"));
        context.insert("getState".to_string(), ContextValue::Bridge("getState"));
        context
    }

    /// Advisory validation of `code`, cached.
    pub fn validate(&self, code: &str) -> Arc<ValidationResult> {
        self.validation.get_or_validate(code)
    }

    /// The cache behind [`EventDispatcher::validate`]. Private caches are
    /// bounded at [`DEFAULT_CAPACITY`](crate::sandbox::cache::DEFAULT_CAPACITY).
    pub fn validation_cache(&self) -> &Arc<ValidationCache> {
        &self.validation
    }

    /// Guest console output of the underlying sandbox.
    pub fn console(&self) -> &ConsoleCapture {
        self.sandbox.console()
    }

    /// The underlying sandbox.
    pub fn sandbox(&self) -> &SecureSandbox {
        &self.sandbox
    }

    /// Run handler code for one event.
    ///
    /// A chain runs strictly in order and stops after the first failed
    /// snippet. Failures of the sandbox itself become a failed result with
    /// zero duration, or `Err` when `throw_on_error` is set.
    pub async fn execute(
        &self,
        code: impl Into<HandlerCode>,
        event: Option<JsonValue>,
        extra_args: &[JsonValue],
    ) -> Result<DispatchOutcome> {
        match code.into() {
            HandlerCode::Single(snippet) => {
                let result = self.execute_single(&snippet, event.as_ref(), extra_args).await?;
                Ok(DispatchOutcome::Single(result))
            }
            HandlerCode::Chain(snippets) => {
                let mut results = Vec::with_capacity(snippets.len());
                for (index, snippet) in snippets.iter().enumerate() {
                    let result = self.execute_single(snippet, event.as_ref(), extra_args).await?;
                    let failed = !result.success;
                    results.push(result);
                    if failed {
                        tracing::warn!(
                            step = index,
                            skipped = snippets.len() - index - 1,
                            "chain execution interrupted"
                        );
                        break;
                    }
                }
                Ok(DispatchOutcome::Chain(results))
            }
        }
    }

    async fn execute_single(
        &self,
        code: &str,
        event: Option<&JsonValue>,
        extra_args: &[JsonValue],
    ) -> Result<ExecutionResult> {
        let validation = self.validate(code);
        for pattern in &validation.dangerous_patterns {
            tracing::warn!(
                kind = ?pattern.kind,
                severity = %pattern.severity,
                position = pattern.position,
                matched = %pattern.matched_text,
                "{}",
                pattern.description
            );
        }

        let context = ExecutionContext {
            event,
            extra_args,
            context_vars: self.get_context(),
        };
        let program = context.build_program(code);

        match self.sandbox.run(&program).await {
            Ok(result) => Ok(result),
            Err(err) if self.throw_on_error => Err(err),
            Err(err) => {
                tracing::error!("event execution system error: {}", err);
                Ok(system_failure(&err))
            }
        }
    }

    /// Bind `code` into a callable handler.
    pub fn create_handler(&self, code: impl Into<HandlerCode>) -> EventHandler<'_> {
        EventHandler {
            dispatcher: self,
            code: code.into(),
        }
    }

    /// Release the sandbox.
    pub fn destroy(&mut self) {
        self.sandbox.destroy();
    }
}

fn system_failure(err: &SandboxError) -> ExecutionResult {
    ExecutionResult {
        success: false,
        value: None,
        error: Some(format!("Event execution system error: {err}")),
        error_kind: Some(ErrorKind::SystemError),
        stack: None,
        duration: Duration::ZERO,
    }
}

/// Handler code bound to a dispatcher, ready to be wired to an event.
#[derive(Debug, Clone)]
pub struct EventHandler<'a> {
    dispatcher: &'a EventDispatcher,
    code: HandlerCode,
}

impl EventHandler<'_> {
    /// The bound code.
    pub fn code(&self) -> &HandlerCode {
        &self.code
    }

    /// Run the handler and unwrap its value; see
    /// [`DispatchOutcome::handler_value`].
    pub async fn call(&self, event: Option<JsonValue>, extra_args: &[JsonValue]) -> Result<Option<JsonValue>> {
        let outcome = self
            .dispatcher
            .execute(self.code.clone(), event, extra_args)
            .await?;
        Ok(outcome.handler_value().cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn dispatcher() -> EventDispatcher {
        EventDispatcher::new(|_| Ok(()), || Ok(json!({})), DispatcherConfig::default())
    }

    fn result(success: bool, value: Option<JsonValue>) -> ExecutionResult {
        ExecutionResult {
            success,
            value,
            error: (!success).then(|| "Error: failed".to_string()),
            error_kind: (!success).then_some(ErrorKind::RuntimeError),
            stack: None,
            duration: Duration::ZERO,
        }
    }

    #[test]
    fn test_private_validation_cache_is_bounded() {
        let dispatcher = dispatcher();
        assert_eq!(
            dispatcher.validation_cache().capacity(),
            Some(crate::sandbox::cache::DEFAULT_CAPACITY)
        );
    }

    #[test]
    fn test_proto_key_is_written_as_computed_key() {
        let value = json!({"__proto__": {"admin": true}, "list": [1, "a\"b"], "n": null});
        assert_eq!(
            js_literal(&value),
            r#"{["__proto__"]:{"admin":true},"list":[1,"a\"b"],"n":null}"#
        );
    }

    #[test]
    fn test_build_program_layout() {
        let mut vars = BTreeMap::new();
        vars.insert("appName".to_string(), ContextValue::Data(json!("Demo")));
        vars.insert("dispatch".to_string(), ContextValue::Bridge("dispatch"));
        let event = json!({"value": 1});
        let args = [json!(true)];
        let context = ExecutionContext {
            event: Some(&event),
            extra_args: &args,
            context_vars: vars,
        };

        let program = context.build_program("return appName;");
        let lines: Vec<_> = program.lines().collect();
        assert_eq!(lines[0], r#"const appName = "Demo";"#);
        assert_eq!(lines[1], "// dispatch: bound by the sandbox");
        assert_eq!(lines[2], r#"const event = {"value":1};"#);
        assert_eq!(lines[3], "const arg0 = true;");
        assert_eq!(lines[4], "const console = {");
        assert!(program.contains("  debug: (...args) => __console_debug(...args),"));
        assert!(program.ends_with("};\nreturn appName;"));
    }

    #[test]
    fn test_binding_problems() {
        assert_eq!(binding_problem("userName"), None);
        assert_eq!(binding_problem("$store_1"), None);
        assert_eq!(binding_problem("argument"), None);
        assert_eq!(binding_problem("1st"), Some("not a valid identifier"));
        assert_eq!(binding_problem("a-b"), Some("not a valid identifier"));
        assert_eq!(binding_problem(""), Some("not a valid identifier"));
        assert_eq!(binding_problem("class"), Some("reserved word"));
        assert_eq!(binding_problem("arg0"), Some("name is bound by the dispatcher"));
        assert_eq!(binding_problem("event"), Some("name is bound by the dispatcher"));
    }

    #[test]
    fn test_skip_comment_stays_on_one_line() {
        assert_eq!(single_line("a\nb\u{2028}c"), "a b c");
    }

    #[test]
    fn test_get_context_overlays_bridge() {
        let mut dispatcher = dispatcher();
        dispatcher.set_context("appName", "Demo");
        dispatcher.set_context("dispatch", "shadowed");

        let context = dispatcher.get_context();
        assert_eq!(context["appName"], ContextValue::Data(json!("Demo")));
        assert_eq!(context["dispatch"], ContextValue::Bridge("dispatch"));
        assert_eq!(context["getState"], ContextValue::Bridge("getState"));
    }

    #[test]
    fn test_unserializable_context_value() {
        use std::collections::HashMap;

        let mut dispatcher = dispatcher();
        let mut tuple_keys = HashMap::new();
        tuple_keys.insert((1, 2), "x");
        dispatcher.set_context("lookup", tuple_keys);

        assert!(matches!(
            dispatcher.get_context()["lookup"],
            ContextValue::Unserializable(_)
        ));
    }

    #[test]
    fn test_handler_value_reverse_scan() {
        let chain = DispatchOutcome::Chain(vec![
            result(true, Some(json!(1))),
            result(true, Some(json!(2))),
            result(false, None),
        ]);
        assert_eq!(chain.handler_value(), Some(&json!(2)));
        assert!(!chain.is_success());

        let single_failed = DispatchOutcome::Single(result(false, None));
        assert_eq!(single_failed.handler_value(), None);

        let empty = DispatchOutcome::Chain(Vec::new());
        assert_eq!(empty.handler_value(), None);
        assert!(empty.into_last().is_none());
    }

    #[test]
    fn test_handler_code_conversions() {
        assert_eq!(HandlerCode::from("a"), HandlerCode::Single("a".to_string()));
        assert_eq!(
            HandlerCode::from(vec!["a", "b"]),
            HandlerCode::Chain(vec!["a".to_string(), "b".to_string()])
        );
    }

    #[test]
    fn test_config_builder() {
        let config = DispatcherConfig::default()
            .with_context("theme", json!("dark"))
            .with_throw_on_error(true);
        assert!(config.throw_on_error);
        assert_eq!(config.context["theme"], json!("dark"));
    }
}
