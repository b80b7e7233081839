//! Example demonstrating error handling patterns.
//!
//! This example shows how guest failures are reported:
//! - Guest exceptions and syntax errors
//! - Timeouts
//! - Memory limits
//! - Boundary (marshal) failures
//! - Advisory validation
//!
//! Run with: cargo run --example error_handling

use std::time::Duration;

use event_sandbox_rs::prelude::*;
use serde_json::json;

fn describe(label: &str, result: &ExecutionResult) {
    match (&result.error_kind, &result.error) {
        (Some(kind), Some(error)) => {
            println!("{label}: [{kind}] {error}");
            if let Some(stack) = &result.stack {
                println!("  stack: {} lines", stack.lines().count());
            }
        }
        _ => println!("{label}: ok -> {:?}", result.value),
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    println!("=== Error Handling Example ===\n");

    let config = SandboxConfig::builder()
        .timeout(Duration::from_millis(200))
        .memory_limit_mb(16)
        .build();
    let sandbox = SecureSandbox::new(|_| Ok(()), || Ok(json!({ "items": [] })), config);

    // Example 1: exceptions
    println!("--- Guest exceptions ---");
    describe("TypeError", &sandbox.execute("return null.field;").await);
    describe("thrown Error", &sandbox.execute("throw new RangeError('out of range');").await);
    describe("thrown value", &sandbox.execute("throw { code: 42 };").await);
    describe("syntax", &sandbox.execute("return (1 + ;").await);
    describe("caught", &sandbox.execute("try { missing(); } catch (e) { return e.name; }").await);
    println!();

    // Example 2: resource limits
    println!("--- Resource limits ---");
    describe("busy loop", &sandbox.execute("for (;;) {}").await);
    describe(
        "allocation",
        &sandbox
            .execute("const parts = []; for (;;) { parts.push('x'.repeat(1 << 20)); }")
            .await,
    );
    describe("recovered", &sandbox.execute("return 'context recreated';").await);
    println!();

    // Example 3: marshaling
    println!("--- Boundary failures ---");
    describe("cycle", &sandbox.execute("const a = {}; a.a = a; return a;").await);
    describe("bad action", &sandbox.execute("dispatch('not an action');").await);
    println!();

    // Example 4: system-level errors
    println!("--- System errors ---");
    let tiny = SandboxConfig::builder().max_code_size(16).build();
    let strict = SecureSandbox::new(|_| Ok(()), || Ok(json!(null)), tiny);
    match strict.run("return 'this is longer than sixteen bytes';").await {
        Ok(result) => describe("unexpected", &result),
        Err(e) => println!("run() refused: {} (kind {})", e, e.kind()),
    }
    println!();

    // Example 5: advisory validation
    println!("--- Validation ---");
    for code in ["return getState().items;", "fetch('/steal?c=' + getState())", "eval('1')"] {
        let report = CodeValidator::analyze(code);
        println!(
            "{code:?}: valid={} patterns={:?}",
            report.valid,
            report
                .dangerous_patterns
                .iter()
                .map(|p| format!("{:?}/{}", p.kind, p.severity))
                .collect::<Vec<_>>()
        );
        for suggestion in &report.suggestions {
            println!("  suggestion: {suggestion}");
        }
    }

    Ok(())
}
