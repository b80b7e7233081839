//! Deep, copy-based value conversion across the host/guest boundary.
//!
//! Host values are JSON-plain [`serde_json::Value`]s. Guest values are
//! engine handles that only live inside a context scope, so every value
//! leaving the guest is copied out before the scope ends and nothing on
//! either side ever aliases the other's memory.

use rquickjs::object::Property;
use rquickjs::{Array, Ctx, Exception, Object, Type, Value};
use serde_json::{Map, Number, Value as JsonValue};

use crate::sandbox::limits::ExecutionClock;

/// Deepest nesting accepted in either direction. Guest cycles hit this
/// limit instead of recursing forever.
pub const MAX_DEPTH: usize = 128;

/// Copy budget used when no guest memory limit is at hand.
pub const DEFAULT_DUMP_BYTES: usize = 32 * 1024 * 1024;

/// Estimated host bytes charged for every copied node.
const NODE_COST: usize = 32;

/// Nodes copied between two polls of the execution clock.
const CLOCK_POLL_INTERVAL: usize = 256;

/// Why a guest value could not be copied to the host.
#[derive(Debug)]
pub enum DumpError {
    /// The value nests deeper than [`MAX_DEPTH`], which includes cycles.
    TooDeep,
    /// The copy would exceed the byte budget. Shared references count once
    /// per occurrence, so a small guest graph can expand past it.
    TooLarge(usize),
    /// The execution clock fired while copying.
    Interrupted,
    /// The value has no JSON-plain host representation.
    Unsupported(&'static str),
    /// The engine failed (a getter threw, or the evaluation was interrupted).
    Engine(rquickjs::Error),
}

impl From<rquickjs::Error> for DumpError {
    fn from(err: rquickjs::Error) -> Self {
        match err {
            rquickjs::Error::Utf8(_) => DumpError::Unsupported("unpaired surrogate string"),
            other => DumpError::Engine(other),
        }
    }
}

impl DumpError {
    /// Message for the boundary failures the marshaler itself detects.
    pub fn describe(&self) -> String {
        match self {
            DumpError::TooDeep => format!(
                "value nests deeper than {MAX_DEPTH} levels or contains a cycle"
            ),
            DumpError::TooLarge(budget) => {
                format!("value exceeds the copy budget of {budget} bytes")
            }
            DumpError::Interrupted => "copy interrupted by the execution timeout".to_string(),
            DumpError::Unsupported(what) => format!("{what} values cannot leave the sandbox"),
            DumpError::Engine(err) => err.to_string(),
        }
    }

    /// Convert into an engine error, throwing a guest `TypeError` for
    /// marshaler-detected failures so guest code sees a normal exception.
    pub fn into_guest_error(self, ctx: &Ctx<'_>, prefix: &str) -> rquickjs::Error {
        match self {
            DumpError::Engine(err) => err,
            DumpError::Interrupted => Exception::throw_internal(ctx, "interrupted"),
            other => Exception::throw_type(ctx, &format!("{prefix}{}", other.describe())),
        }
    }
}

/// Bounds applied to one copy-out.
#[derive(Debug, Clone)]
pub struct DumpLimits {
    max_bytes: usize,
    clock: Option<ExecutionClock>,
}

impl Default for DumpLimits {
    fn default() -> Self {
        Self::new(DEFAULT_DUMP_BYTES)
    }
}

impl DumpLimits {
    /// Refuse copies whose estimated host size passes `max_bytes`.
    pub fn new(max_bytes: usize) -> Self {
        Self {
            max_bytes,
            clock: None,
        }
    }

    /// Also stop when `clock` reports the evaluation has run out of time.
    pub fn with_clock(mut self, clock: ExecutionClock) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn max_bytes(&self) -> usize {
        self.max_bytes
    }
}

/// Copy a host value into a fresh guest value.
///
/// Arrays and objects become new guest containers; each element handle is
/// released as soon as it has been stored. Object keys are defined as own
/// data properties, so a `"__proto__"` key stays a plain key.
pub fn inject<'js>(ctx: &Ctx<'js>, value: &JsonValue) -> rquickjs::Result<Value<'js>> {
    inject_at(ctx, value, 0)
}

fn inject_at<'js>(ctx: &Ctx<'js>, value: &JsonValue, depth: usize) -> rquickjs::Result<Value<'js>> {
    if depth > MAX_DEPTH {
        return Err(Exception::throw_range(
            ctx,
            &format!("value nests deeper than {MAX_DEPTH} levels"),
        ));
    }

    match value {
        JsonValue::Null => Ok(Value::new_null(ctx.clone())),
        JsonValue::Bool(b) => Ok(Value::new_bool(ctx.clone(), *b)),
        JsonValue::Number(n) => Ok(inject_number(ctx, n)),
        JsonValue::String(s) => Ok(rquickjs::String::from_str(ctx.clone(), s)?.into_value()),
        JsonValue::Array(items) => {
            let array = Array::new(ctx.clone())?;
            for (index, item) in items.iter().enumerate() {
                array.set(index, inject_at(ctx, item, depth + 1)?)?;
            }
            Ok(array.into_value())
        }
        JsonValue::Object(map) => {
            let object = Object::new(ctx.clone())?;
            for (key, item) in map {
                let item = inject_at(ctx, item, depth + 1)?;
                object.prop(
                    key.as_str(),
                    Property::from(item).writable().enumerable().configurable(),
                )?;
            }
            Ok(object.into_value())
        }
    }
}

fn inject_number<'js>(ctx: &Ctx<'js>, n: &Number) -> Value<'js> {
    match n.as_i64().and_then(|i| i32::try_from(i).ok()) {
        Some(small) => Value::new_int(ctx.clone(), small),
        None => Value::new_float(ctx.clone(), n.as_f64().unwrap_or(f64::NAN)),
    }
}

/// Copy a guest value out to the host under the default limits.
///
/// Returns `None` for `undefined` and for values JSON has no form for
/// (functions, symbols). Inside objects such properties are omitted; inside
/// arrays they become `null`, matching `JSON.stringify`.
pub fn dump(value: &Value<'_>) -> Result<Option<JsonValue>, DumpError> {
    dump_within(value, &DumpLimits::default())
}

/// Copy a guest value out to the host, charging every node against `limits`.
pub fn dump_within(value: &Value<'_>, limits: &DumpLimits) -> Result<Option<JsonValue>, DumpError> {
    let mut walker = Walker {
        limits,
        spent: 0,
        nodes: 0,
    };
    walker.dump_at(value, 0)
}

struct Walker<'a> {
    limits: &'a DumpLimits,
    spent: usize,
    nodes: usize,
}

impl Walker<'_> {
    fn charge(&mut self, bytes: usize) -> Result<(), DumpError> {
        self.spent = self.spent.saturating_add(bytes);
        if self.spent > self.limits.max_bytes {
            return Err(DumpError::TooLarge(self.limits.max_bytes));
        }
        self.nodes += 1;
        if self.nodes % CLOCK_POLL_INTERVAL == 0 {
            if let Some(clock) = &self.limits.clock {
                if clock.should_interrupt() {
                    return Err(DumpError::Interrupted);
                }
            }
        }
        Ok(())
    }

    fn dump_at(&mut self, value: &Value<'_>, depth: usize) -> Result<Option<JsonValue>, DumpError> {
        if depth > MAX_DEPTH {
            return Err(DumpError::TooDeep);
        }
        self.charge(NODE_COST)?;

        let dumped = match value.type_of() {
            Type::Uninitialized | Type::Undefined => None,
            Type::Null => Some(JsonValue::Null),
            Type::Bool => value.as_bool().map(JsonValue::Bool),
            Type::Int => value.as_int().map(|i| JsonValue::Number(i.into())),
            Type::Float => value.as_float().map(number_from_f64),
            Type::String => match value.as_string() {
                Some(s) => {
                    let text = s.to_string()?;
                    self.charge(text.len())?;
                    Some(JsonValue::String(text))
                }
                None => None,
            },
            Type::BigInt => return Err(DumpError::Unsupported("BigInt")),
            Type::Array => match value.as_array() {
                Some(array) => Some(self.dump_array(array, depth)?),
                None => None,
            },
            Type::Object | Type::Exception => match value.as_object() {
                Some(object) => Some(self.dump_object(object, depth)?),
                None => None,
            },
            _ => None,
        };
        Ok(dumped)
    }

    fn dump_array(&mut self, array: &Array<'_>, depth: usize) -> Result<JsonValue, DumpError> {
        // `length` can exceed i32 for sparse arrays; read it as a number.
        let length: f64 = array.as_inner().get("length")?;
        let remaining = self.limits.max_bytes.saturating_sub(self.spent) / NODE_COST;
        if !(0.0..=remaining as f64).contains(&length) {
            return Err(DumpError::TooLarge(self.limits.max_bytes));
        }
        let length = length as usize;

        let mut items = Vec::new();
        for index in 0..length {
            let item: Value = array.get(index)?;
            items.push(self.dump_at(&item, depth + 1)?.unwrap_or(JsonValue::Null));
        }
        Ok(JsonValue::Array(items))
    }

    fn dump_object(&mut self, object: &Object<'_>, depth: usize) -> Result<JsonValue, DumpError> {
        let mut map = Map::new();
        for prop in object.props::<String, Value>() {
            let (key, item) = prop?;
            self.charge(key.len())?;
            if let Some(dumped) = self.dump_at(&item, depth + 1)? {
                map.insert(key, dumped);
            }
        }
        Ok(JsonValue::Object(map))
    }
}

/// Integral floats come back as integers so `4.0` compares equal to `4`;
/// non-finite numbers have no JSON form and become `null`.
pub fn number_from_f64(f: f64) -> JsonValue {
    const I64_RANGE: f64 = 9_007_199_254_740_992.0; // 2^53
    if f.is_finite() && f.fract() == 0.0 && f.abs() <= I64_RANGE {
        if f == 0.0 && f.is_sign_negative() {
            return Number::from_f64(f).map_or(JsonValue::Null, JsonValue::Number);
        }
        return JsonValue::Number((f as i64).into());
    }
    Number::from_f64(f).map_or(JsonValue::Null, JsonValue::Number)
}

/// Best-effort host rendering of a thrown or logged guest value.
pub fn render(value: &Value<'_>) -> String {
    match dump(value) {
        Ok(None) => "undefined".to_string(),
        Ok(Some(JsonValue::String(s))) => s,
        Ok(Some(other)) => other.to_string(),
        Err(err) => format!("[unrenderable value: {}]", err.describe()),
    }
}
