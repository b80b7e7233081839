//! The capability surface installed into every guest context.
//!
//! Guest code can reach exactly what is installed here: a console that
//! forwards to the host log, host-backed `JSON`, `Math` and `Date`, the two
//! bridge primitives and helpers layered on top of them. Host objects that
//! are not installed simply do not exist inside the guest.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use rquickjs::function::Rest;
use rquickjs::object::Property;
use rquickjs::{Ctx, Exception, Function, Object, Type, Value};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::sandbox::config::SandboxConfig;
use crate::sandbox::io::{ConsoleCapture, ConsoleLevel};
use crate::sandbox::marshal::{self, DumpError, DumpLimits};

/// Native dispatch primitive. User code reaches it through `dispatch`.
pub const DISPATCH_PRIMITIVE: &str = "__dispatch";
/// Native state accessor. User code reaches it through `getState`.
pub const GET_STATE_PRIMITIVE: &str = "__getState";

/// Base globals whose presence is governed by the allow-list.
pub const RESTRICTABLE_GLOBALS: &[&str] = &[
    "Object",
    "Function",
    "Array",
    "Number",
    "Boolean",
    "String",
    "Symbol",
    "BigInt",
    "Math",
    "JSON",
    "Date",
    "RegExp",
    "Reflect",
    "Proxy",
    "Promise",
    "Map",
    "Set",
    "WeakMap",
    "WeakSet",
    "WeakRef",
    "FinalizationRegistry",
    "ArrayBuffer",
    "SharedArrayBuffer",
    "DataView",
    "Int8Array",
    "Uint8Array",
    "Uint8ClampedArray",
    "Int16Array",
    "Uint16Array",
    "Int32Array",
    "Uint32Array",
    "BigInt64Array",
    "BigUint64Array",
    "Float32Array",
    "Float64Array",
    "Atomics",
    "Iterator",
    "eval",
    "parseInt",
    "parseFloat",
    "isNaN",
    "isFinite",
    "encodeURI",
    "encodeURIComponent",
    "decodeURI",
    "decodeURIComponent",
    "escape",
    "unescape",
    "performance",
    "queueMicrotask",
    "globalThis",
];

const MATH_CONSTANTS: &[(&str, f64)] = &[
    ("PI", std::f64::consts::PI),
    ("E", std::f64::consts::E),
    ("LN2", std::f64::consts::LN_2),
    ("LN10", std::f64::consts::LN_10),
    ("LOG2E", std::f64::consts::LOG2_E),
    ("LOG10E", std::f64::consts::LOG10_E),
    ("SQRT1_2", std::f64::consts::FRAC_1_SQRT_2),
    ("SQRT2", std::f64::consts::SQRT_2),
];

const MATH_FUNCTIONS: &[&str] = &[
    "abs", "acos", "acosh", "asin", "asinh", "atan", "atan2", "atanh", "cbrt", "ceil", "clz32",
    "cos", "cosh", "exp", "expm1", "floor", "fround", "hypot", "imul", "log", "log1p", "log10",
    "log2", "max", "min", "pow", "random", "round", "sign", "sin", "sinh", "sqrt", "tan", "tanh",
    "trunc",
];

/// Product helpers, defined in guest code on top of `__dispatch`.
const HELPER_SNIPPETS: &[&str] = &[
    r#"function setComponentData(id, value) {
  __dispatch({ type: 'components/setComponentData', payload: { id, value } });
}"#,
    r#"function setComponentConfig(id, config) {
  __dispatch({ type: 'components/setComponentConfig', payload: { id, config } });
}"#,
];

/// An action forwarded from guest code to the host store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Action {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<JsonValue>,
}

impl Action {
    pub fn new(kind: impl Into<String>, payload: Option<JsonValue>) -> Self {
        Self {
            kind: kind.into(),
            payload,
        }
    }
}

/// Host callback receiving dispatched actions.
pub type DispatchFn = Arc<dyn Fn(Action) -> anyhow::Result<()> + Send + Sync>;
/// Host callback producing a snapshot of the application state.
pub type GetStateFn = Arc<dyn Fn() -> anyhow::Result<JsonValue> + Send + Sync>;

/// The two host callbacks behind the bridge primitives.
#[derive(Clone)]
pub struct Bridge {
    dispatch: DispatchFn,
    get_state: GetStateFn,
}

impl fmt::Debug for Bridge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Bridge")
            .field("dispatch", &"<host fn>")
            .field("get_state", &"<host fn>")
            .finish()
    }
}

impl Bridge {
    pub fn new<D, S>(dispatch: D, get_state: S) -> Self
    where
        D: Fn(Action) -> anyhow::Result<()> + Send + Sync + 'static,
        S: Fn() -> anyhow::Result<JsonValue> + Send + Sync + 'static,
    {
        Self {
            dispatch: Arc::new(dispatch),
            get_state: Arc::new(get_state),
        }
    }

    /// Forward an action to the host store.
    pub fn dispatch(&self, action: Action) -> anyhow::Result<()> {
        (self.dispatch)(action)
    }

    /// Take a snapshot of the host state.
    pub fn get_state(&self) -> anyhow::Result<JsonValue> {
        (self.get_state)()
    }
}

/// Populate a fresh context's global object.
pub fn install<'js>(
    ctx: &Ctx<'js>,
    bridge: &Bridge,
    config: &SandboxConfig,
    console: &ConsoleCapture,
    limits: &DumpLimits,
) -> rquickjs::Result<()> {
    let globals = ctx.globals();
    for name in RESTRICTABLE_GLOBALS {
        if !config.allows(name) {
            globals.remove(*name)?;
        }
    }

    install_console(ctx, console, limits)?;
    if config.allows("JSON") {
        install_json(ctx, limits)?;
    }
    if config.allows("Math") {
        install_math(ctx)?;
    }
    if config.allows("Date") {
        install_date(ctx)?;
    }
    install_bridge(ctx, bridge, limits)?;

    for snippet in HELPER_SNIPPETS {
        ctx.eval::<(), _>(*snippet)?;
    }

    for (name, value) in &config.inject_vars {
        let value = marshal::inject(ctx, value)?;
        globals.prop(
            name.as_str(),
            Property::from(value).writable().enumerable().configurable(),
        )?;
    }
    Ok(())
}

/// `console.*` plus the `__console_<method>` primitives the dispatcher's
/// console shim forwards to.
fn install_console<'js>(
    ctx: &Ctx<'js>,
    console: &ConsoleCapture,
    limits: &DumpLimits,
) -> rquickjs::Result<()> {
    let globals = ctx.globals();
    let object = Object::new(ctx.clone())?;

    for level in ConsoleLevel::ALL {
        let sink = console.clone();
        let limits = limits.clone();
        let method = Function::new(
            ctx.clone(),
            move |args: Rest<Value<'js>>| -> rquickjs::Result<()> {
                let mut values = Vec::with_capacity(args.0.len());
                for arg in args.0.iter() {
                    match marshal::dump_within(arg, &limits) {
                        Ok(value) => values.push(value),
                        Err(DumpError::Engine(err)) => return Err(err),
                        Err(other) => {
                            values.push(Some(JsonValue::String(format!("[{}]", other.describe()))))
                        }
                    }
                }
                sink.emit(level, &values);
                Ok(())
            },
        )?;
        let primitive = format!("__console_{}", level.method());
        object.set(level.method(), method.clone())?;
        globals.set(primitive.as_str(), method)?;
    }

    globals.set("console", object)
}

/// JSON handled host-side: values are dumped, serialized with `serde_json`
/// and the text handed back; parsing goes the other way.
fn install_json<'js>(ctx: &Ctx<'js>, limits: &DumpLimits) -> rquickjs::Result<()> {
    let json = Object::new(ctx.clone())?;

    let limits = limits.clone();
    let stringify = Function::new(
        ctx.clone(),
        move |ctx: Ctx<'js>, args: Rest<Value<'js>>| -> rquickjs::Result<Value<'js>> {
            let Some(target) = args.0.first() else {
                return Ok(Value::new_undefined(ctx));
            };
            let indent = args.0.get(2).and_then(indent_from);
            let host = marshal::dump_within(target, &limits)
                .map_err(|err| err.into_guest_error(&ctx, "JSON.stringify: "))?;
            let Some(host) = host else {
                return Ok(Value::new_undefined(ctx));
            };
            let text = to_json_text(&host, indent.as_deref())
                .map_err(|err| Exception::throw_type(&ctx, &format!("JSON.stringify: {err}")))?;
            Ok(rquickjs::String::from_str(ctx, &text)?.into_value())
        },
    )?;

    let parse = Function::new(
        ctx.clone(),
        |ctx: Ctx<'js>, args: Rest<Value<'js>>| -> rquickjs::Result<Value<'js>> {
            let text = match args.0.first() {
                Some(value) => match value.as_string() {
                    Some(s) => s.to_string()?,
                    None => marshal::render(value),
                },
                None => "undefined".to_string(),
            };
            let host: JsonValue = serde_json::from_str(&text).map_err(|err| {
                Exception::throw_syntax(&ctx, &format!("JSON parse error: {err}"))
            })?;
            marshal::inject(&ctx, &host)
        },
    )?;

    json.set("stringify", stringify)?;
    json.set("parse", parse)?;
    ctx.globals().set("JSON", json)
}

fn indent_from(space: &Value<'_>) -> Option<String> {
    let indent = match space.type_of() {
        Type::Int | Type::Float => {
            let width = space.as_number().unwrap_or(0.0).clamp(0.0, 10.0) as usize;
            " ".repeat(width)
        }
        Type::String => space
            .as_string()
            .and_then(|s| s.to_string().ok())
            .map(|s| s.chars().take(10).collect())
            .unwrap_or_default(),
        _ => String::new(),
    };
    (!indent.is_empty()).then_some(indent)
}

fn to_json_text(value: &JsonValue, indent: Option<&str>) -> serde_json::Result<String> {
    let Some(indent) = indent else {
        return serde_json::to_string(value);
    };
    let mut buf = Vec::new();
    let formatter = serde_json::ser::PrettyFormatter::with_indent(indent.as_bytes());
    let mut serializer = serde_json::Serializer::with_formatter(&mut buf, formatter);
    value.serialize(&mut serializer)?;
    Ok(String::from_utf8_lossy(&buf).into_owned())
}

/// Constants copied by value; every function is a host closure over `f64`.
fn install_math<'js>(ctx: &Ctx<'js>) -> rquickjs::Result<()> {
    let math = Object::new(ctx.clone())?;
    for (name, value) in MATH_CONSTANTS {
        math.set(*name, *value)?;
    }
    for name in MATH_FUNCTIONS {
        let name: &'static str = name;
        let func = Function::new(ctx.clone(), move |args: Rest<Value<'js>>| -> f64 {
            let numbers: Vec<f64> = args.0.iter().map(to_number).collect();
            math_call(name, &numbers)
        })?;
        math.set(name, func)?;
    }
    ctx.globals().set("Math", math)
}

/// `ToNumber` for the primitive cases guest code passes to `Math`.
fn to_number(value: &Value<'_>) -> f64 {
    match value.type_of() {
        Type::Int | Type::Float => value.as_number().unwrap_or(f64::NAN),
        Type::Bool => {
            if value.as_bool() == Some(true) {
                1.0
            } else {
                0.0
            }
        }
        Type::Null => 0.0,
        Type::String => value
            .as_string()
            .and_then(|s| s.to_string().ok())
            .map_or(f64::NAN, |s| parse_numeric(&s)),
        _ => f64::NAN,
    }
}

fn parse_numeric(text: &str) -> f64 {
    let trimmed = text.trim();
    match trimmed {
        "" => 0.0,
        "Infinity" | "+Infinity" => f64::INFINITY,
        "-Infinity" => f64::NEG_INFINITY,
        _ if trimmed.chars().any(|c| c.is_ascii_alphabetic() && c != 'e' && c != 'E') => f64::NAN,
        _ => trimmed.parse().unwrap_or(f64::NAN),
    }
}

fn to_uint32(x: f64) -> u32 {
    if !x.is_finite() {
        return 0;
    }
    x.trunc().rem_euclid(4_294_967_296.0) as u32
}

fn math_call(name: &str, args: &[f64]) -> f64 {
    let arg = |i: usize| args.get(i).copied().unwrap_or(f64::NAN);
    let x = arg(0);
    match name {
        "abs" => x.abs(),
        "acos" => x.acos(),
        "acosh" => x.acosh(),
        "asin" => x.asin(),
        "asinh" => x.asinh(),
        "atan" => x.atan(),
        "atan2" => x.atan2(arg(1)),
        "atanh" => x.atanh(),
        "cbrt" => x.cbrt(),
        "ceil" => x.ceil(),
        "clz32" => f64::from(to_uint32(x).leading_zeros()),
        "cos" => x.cos(),
        "cosh" => x.cosh(),
        "exp" => x.exp(),
        "expm1" => x.exp_m1(),
        "floor" => x.floor(),
        "fround" => f64::from(x as f32),
        "hypot" => {
            if args.iter().any(|v| v.is_infinite()) {
                f64::INFINITY
            } else {
                args.iter().map(|v| v * v).sum::<f64>().sqrt()
            }
        }
        "imul" => f64::from((to_uint32(x) as i32).wrapping_mul(to_uint32(arg(1)) as i32)),
        "log" => x.ln(),
        "log1p" => x.ln_1p(),
        "log10" => x.log10(),
        "log2" => x.log2(),
        "max" => args.iter().copied().fold(f64::NEG_INFINITY, |acc, v| {
            if acc.is_nan() || v.is_nan() {
                f64::NAN
            } else {
                acc.max(v)
            }
        }),
        "min" => args.iter().copied().fold(f64::INFINITY, |acc, v| {
            if acc.is_nan() || v.is_nan() {
                f64::NAN
            } else {
                acc.min(v)
            }
        }),
        "pow" => x.powf(arg(1)),
        "random" => rand::random::<f64>(),
        // Halves round towards +Infinity.
        "round" => {
            if !x.is_finite() || x.fract() == 0.0 {
                x
            } else {
                (x + 0.5).floor()
            }
        }
        "sign" => {
            if x.is_nan() || x == 0.0 {
                x
            } else {
                x.signum()
            }
        }
        "sin" => x.sin(),
        "sinh" => x.sinh(),
        "sqrt" => x.sqrt(),
        "tan" => x.tan(),
        "tanh" => x.tanh(),
        "trunc" => x.trunc(),
        _ => f64::NAN,
    }
}

/// `Date` is a constructor returning an ISO-8601 snapshot string, never a
/// live date object. Fields are interpreted as UTC.
fn install_date<'js>(ctx: &Ctx<'js>) -> rquickjs::Result<()> {
    let date = Function::new(
        ctx.clone(),
        |ctx: Ctx<'js>, args: Rest<Value<'js>>| -> rquickjs::Result<String> {
            date_snapshot(&args.0)
                .map(|at| at.format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string())
                .ok_or_else(|| Exception::throw_range(&ctx, "Invalid time value"))
        },
    )?;
    date.set_constructor(true);
    ctx.globals().set("Date", date)
}

fn date_snapshot(args: &[Value<'_>]) -> Option<DateTime<Utc>> {
    match args {
        [] => Some(Utc::now()),
        [single] => match single.as_string() {
            Some(text) => parse_date_text(&text.to_string().ok()?),
            None => from_millis(to_number(single)),
        },
        parts => {
            let numbers: Vec<f64> = parts.iter().map(to_number).collect();
            from_fields(&numbers)
        }
    }
}

fn from_millis(ms: f64) -> Option<DateTime<Utc>> {
    // Beyond +-8.64e15 ms a JS date is invalid.
    if !ms.is_finite() || ms.abs() > 8.64e15 {
        return None;
    }
    DateTime::<Utc>::from_timestamp_millis(ms.trunc() as i64)
}

fn parse_date_text(text: &str) -> Option<DateTime<Utc>> {
    let text = text.trim();
    if let Ok(parsed) = DateTime::parse_from_rfc3339(text) {
        return Some(parsed.with_timezone(&Utc));
    }
    if let Ok(parsed) = NaiveDateTime::parse_from_str(text, "%Y-%m-%dT%H:%M:%S%.f") {
        return Some(parsed.and_utc());
    }
    if let Ok(parsed) = NaiveDateTime::parse_from_str(text, "%Y-%m-%dT%H:%M") {
        return Some(parsed.and_utc());
    }
    NaiveDate::parse_from_str(text, "%Y-%m-%d")
        .ok()
        .and_then(|day| day.and_hms_opt(0, 0, 0))
        .map(|at| at.and_utc())
}

/// `Date(year, monthIndex, day?, hours?, minutes?, seconds?, ms?)`; out of
/// range fields carry over like they do in JS.
fn from_fields(fields: &[f64]) -> Option<DateTime<Utc>> {
    if fields.iter().any(|f| !f.is_finite()) {
        return None;
    }
    let field = |i: usize, default: f64| fields.get(i).copied().unwrap_or(default).trunc();

    let mut year = field(0, f64::NAN);
    if (0.0..=99.0).contains(&year) {
        year += 1900.0;
    }
    let month = field(1, 0.0);
    let year = year + (month / 12.0).floor();
    let month = month.rem_euclid(12.0);
    if year.abs() > 275_760.0 {
        return None;
    }

    let offset_ms = (field(2, 1.0) - 1.0) * 86_400_000.0
        + field(3, 0.0) * 3_600_000.0
        + field(4, 0.0) * 60_000.0
        + field(5, 0.0) * 1000.0
        + field(6, 0.0);
    if offset_ms.abs() > 8.64e15 {
        return None;
    }

    let start = NaiveDate::from_ymd_opt(year as i32, month as u32 + 1, 1)?
        .and_hms_opt(0, 0, 0)?
        .and_utc();
    from_millis(start.timestamp_millis() as f64 + offset_ms)
}

/// `__dispatch` and `__getState`. Both marshal by deep copy on every call.
fn install_bridge<'js>(
    ctx: &Ctx<'js>,
    bridge: &Bridge,
    limits: &DumpLimits,
) -> rquickjs::Result<()> {
    let host = bridge.clone();
    let limits = limits.clone();
    let dispatch = Function::new(
        ctx.clone(),
        move |ctx: Ctx<'js>, args: Rest<Value<'js>>| -> rquickjs::Result<()> {
            let dumped = match args.0.first() {
                Some(raw) => marshal::dump_within(raw, &limits)
                    .map_err(|err| err.into_guest_error(&ctx, "Dispatch error: "))?,
                None => None,
            };
            let action = dumped
                .and_then(|value| serde_json::from_value::<Action>(value).ok())
                .ok_or_else(|| {
                    Exception::throw_type(
                        &ctx,
                        "Dispatch error: action must be an object with a string `type`",
                    )
                })?;
            tracing::trace!(action = %action.kind, "guest dispatch");
            host.dispatch(action)
                .map_err(|err| Exception::throw_message(&ctx, &format!("Dispatch error: {err}")))
        },
    )?;

    let host = bridge.clone();
    let get_state = Function::new(
        ctx.clone(),
        move |ctx: Ctx<'js>| -> rquickjs::Result<Value<'js>> {
            let state = host.get_state().map_err(|err| {
                Exception::throw_message(&ctx, &format!("GetState error: {err}"))
            })?;
            marshal::inject(&ctx, &state)
        },
    )?;

    let globals = ctx.globals();
    globals.set(DISPATCH_PRIMITIVE, dispatch)?;
    globals.set(GET_STATE_PRIMITIVE, get_state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_math_round_matches_js() {
        assert_eq!(math_call("round", &[2.5]), 3.0);
        assert_eq!(math_call("round", &[-2.5]), -2.0);
        assert_eq!(math_call("round", &[-2.6]), -3.0);
    }

    #[test]
    fn test_math_integer_helpers() {
        assert_eq!(math_call("clz32", &[1.0]), 31.0);
        assert_eq!(math_call("clz32", &[0.0]), 32.0);
        assert_eq!(math_call("imul", &[3.0, 4.0]), 12.0);
        assert_eq!(math_call("imul", &[4_294_967_295.0, 5.0]), -5.0);
    }

    #[test]
    fn test_math_min_max() {
        assert_eq!(math_call("max", &[]), f64::NEG_INFINITY);
        assert_eq!(math_call("min", &[3.0, 1.0, 2.0]), 1.0);
        assert!(math_call("max", &[1.0, f64::NAN]).is_nan());
        assert!(math_call("abs", &[]).is_nan());
    }

    #[test]
    fn test_parse_numeric() {
        assert_eq!(parse_numeric(" 42 "), 42.0);
        assert_eq!(parse_numeric(""), 0.0);
        assert_eq!(parse_numeric("1e3"), 1000.0);
        assert!(parse_numeric("inf").is_nan());
        assert!(parse_numeric("abc").is_nan());
    }

    #[test]
    fn test_date_fields() {
        let at = from_fields(&[2024.0, 0.0, 15.0, 10.0, 30.0]).unwrap();
        assert_eq!(at.to_rfc3339(), "2024-01-15T10:30:00+00:00");

        // Month 12 rolls into the next year.
        let rolled = from_fields(&[2023.0, 12.0, 1.0]).unwrap();
        assert_eq!(rolled.format("%Y-%m-%d").to_string(), "2024-01-01");
    }

    #[test]
    fn test_date_text_and_millis() {
        assert_eq!(
            parse_date_text("2024-03-01").unwrap().timestamp_millis(),
            1_709_251_200_000
        );
        assert!(parse_date_text("not a date").is_none());
        assert_eq!(from_millis(0.0).unwrap().timestamp(), 0);
        assert!(from_millis(f64::NAN).is_none());
    }

    #[test]
    fn test_action_shape() {
        let action: Action =
            serde_json::from_value(json!({"type": "x", "payload": {"n": 1}})).unwrap();
        assert_eq!(action, Action::new("x", Some(json!({"n": 1}))));

        let bare: Action = serde_json::from_value(json!({"type": "y"})).unwrap();
        assert_eq!(serde_json::to_value(&bare).unwrap(), json!({"type": "y"}));

        assert!(serde_json::from_value::<Action>(json!({"kind": "z"})).is_err());
    }

    #[test]
    fn test_json_text_indent() {
        let value = json!({"a": [1]});
        assert_eq!(to_json_text(&value, None).unwrap(), r#"{"a":[1]}"#);
        assert_eq!(
            to_json_text(&value, Some("  ")).unwrap(),
            "{\n  \"a\": [\n    1\n  ]\n}"
        );
    }
}
