//! Round-trip properties of the host/guest value marshaler.

use event_sandbox_rs::prelude::*;
use std::time::Duration;

use event_sandbox_rs::sandbox::limits::ExecutionClock;
use event_sandbox_rs::sandbox::marshal::{dump, dump_within, inject, DumpError, DumpLimits};
use proptest::collection::{btree_map, vec};
use proptest::prelude::*;
use proptest::test_runner::TestCaseResult;
use rquickjs::{Context, Runtime};
use serde_json::{json, Map, Value};

fn number_strategy() -> BoxedStrategy<Value> {
    prop_oneof![
        any::<i32>().prop_map(Value::from),
        (-(1i64 << 53)..=(1i64 << 53)).prop_map(Value::from),
        (-1.0e9f64..1.0e9)
            .prop_filter("non-integral", |f| f.fract() != 0.0)
            .prop_map(Value::from),
    ]
    .boxed()
}

fn leaf_strategy() -> BoxedStrategy<Value> {
    prop_oneof![
        Just(Value::Null),
        any::<bool>().prop_map(Value::Bool),
        number_strategy(),
        "\\PC{0,16}".prop_map(Value::String),
    ]
    .boxed()
}

/// Object keys, including the ones engines treat specially.
fn key_strategy() -> BoxedStrategy<String> {
    prop_oneof![
        Just("__proto__".to_string()),
        Just("constructor".to_string()),
        "(0|[1-9][0-9]{0,3})",
        "[a-z][a-z0-9_]{0,5}",
        "\\PC{0,8}",
    ]
    .boxed()
}

fn json_strategy() -> BoxedStrategy<Value> {
    leaf_strategy()
        .prop_recursive(4, 128, 12, |inner| {
            prop_oneof![
                vec(inner.clone(), 0..24).prop_map(Value::Array),
                btree_map(key_strategy(), inner, 0..8)
                    .prop_map(|entries| Value::Object(entries.into_iter().collect::<Map<_, _>>())),
            ]
        })
        .boxed()
}

fn assert_roundtrip(value: &Value) -> TestCaseResult {
    let runtime = Runtime::new().map_err(|e| TestCaseError::fail(e.to_string()))?;
    let context = Context::full(&runtime).map_err(|e| TestCaseError::fail(e.to_string()))?;

    let back = context.with(|ctx| {
        let handle = inject(&ctx, value).map_err(|e| e.to_string())?;
        dump(&handle).map_err(|e| e.describe())
    });
    prop_assert_eq!(back, Ok(Some(value.clone())));
    Ok(())
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 256,
        failure_persistence: None,
        .. ProptestConfig::default()
    })]

    #[test]
    fn marshal_inject_then_dump_is_identity(value in json_strategy()) {
        assert_roundtrip(&value)?;
    }

    #[test]
    fn sandbox_returns_injected_vars_unchanged(value in json_strategy()) {
        let config = SandboxConfig::builder().inject_var("payload", value.clone()).build();
        let sandbox = SecureSandbox::new(|_| Ok(()), || Ok(Value::Null), config);

        let result = tokio_test::block_on(sandbox.execute("return payload;"));
        prop_assert!(result.success, "{:?}", result.error);
        prop_assert_eq!(result.value, Some(value));
    }
}

#[test]
fn json_parse_and_stringify_go_through_the_host() {
    let sandbox = SecureSandbox::new(|_| Ok(()), || Ok(Value::Null), SandboxConfig::default());

    let result = tokio_test::block_on(sandbox.execute(
        r#"const parsed = JSON.parse('{"a":[1,2.5,"x"],"b":{"c":null}}');
           return [parsed, JSON.stringify(parsed), JSON.stringify({ k: 1 }, null, 2)];"#,
    ));
    assert_eq!(
        result.value,
        Some(json!([
            { "a": [1, 2.5, "x"], "b": { "c": null } },
            r#"{"a":[1,2.5,"x"],"b":{"c":null}}"#,
            "{\n  \"k\": 1\n}"
        ]))
    );

    let invalid = tokio_test::block_on(sandbox.execute("return JSON.parse('{oops');"));
    assert!(invalid.error.unwrap().starts_with("SyntaxError: JSON parse error"));
}

/// Evaluate `source` in a fresh context and copy the result out under `limits`.
fn dump_guest(source: &str, limits: &DumpLimits) -> std::result::Result<Option<Value>, DumpError> {
    let runtime = Runtime::new().unwrap();
    let context = Context::full(&runtime).unwrap();
    context.with(|ctx| {
        let value: rquickjs::Value = ctx.eval(source).unwrap();
        dump_within(&value, limits)
    })
}

#[test]
fn proto_key_survives_as_own_property() {
    let runtime = Runtime::new().unwrap();
    let context = Context::full(&runtime).unwrap();
    let original = json!({ "__proto__": { "admin": true }, "name": "x" });

    context.with(|ctx| {
        let handle = inject(&ctx, &original).unwrap();
        assert_eq!(dump(&handle).unwrap(), Some(original.clone()));

        ctx.globals().set("v", handle).unwrap();
        let inherited: bool = ctx.eval("v.admin === true").unwrap();
        let own: bool = ctx.eval("Object.getPrototypeOf(v) === Object.prototype").unwrap();
        assert!(!inherited);
        assert!(own);
    });
}

#[test]
fn sparse_array_is_charged_for_its_length() {
    let limits = DumpLimits::new(1 << 20);

    let huge = dump_guest("const a = []; a[4294967294] = 1; a", &limits);
    assert!(matches!(huge, Err(DumpError::TooLarge(_))), "{huge:?}");

    let wide = dump_guest("const a = []; a[100000] = 1; a", &limits);
    assert!(matches!(wide, Err(DumpError::TooLarge(_))), "{wide:?}");

    let holes = dump_guest("const a = []; a[3] = 1; a", &limits).unwrap();
    assert_eq!(holes, Some(json!([null, null, null, 1])));
}

#[test]
fn shared_reference_dag_is_bounded() {
    let limits = DumpLimits::new(1 << 20);

    let expanded = dump_guest(
        "let a = [1]; for (let i = 0; i < 22; i++) a = [a, a]; a",
        &limits,
    );
    assert!(matches!(expanded, Err(DumpError::TooLarge(_))), "{expanded:?}");

    let small = dump_guest("let a = [1]; for (let i = 0; i < 3; i++) a = [a, a]; a", &limits);
    assert_eq!(
        small.unwrap(),
        Some(json!([[[[1], [1]], [[1], [1]]], [[[1], [1]], [[1], [1]]]]))
    );
}

#[test]
fn expired_clock_interrupts_the_copy() {
    let clock = ExecutionClock::new(Duration::ZERO);
    clock.arm();
    std::thread::sleep(Duration::from_millis(2));
    let limits = DumpLimits::new(usize::MAX / 2).with_clock(clock);

    let result = dump_guest(
        "let a = [1]; for (let i = 0; i < 16; i++) a = [a, a]; a",
        &limits,
    );
    assert!(matches!(result, Err(DumpError::Interrupted)), "{result:?}");
}

#[test]
fn lone_surrogate_string_is_refused() {
    let limits = DumpLimits::default();

    let lone = dump_guest(r#"({ text: "\uD800" })"#, &limits);
    assert!(matches!(lone, Err(DumpError::Unsupported(_))), "{lone:?}");

    let paired = dump_guest(r#""\uD83D\uDE00""#, &limits).unwrap();
    assert_eq!(paired, Some(json!("\u{1F600}")));
}
