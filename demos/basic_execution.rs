//! Basic example of running event handler code in the sandbox.
//!
//! Run with: cargo run --example basic_execution

use std::sync::{Arc, Mutex};
use std::time::Duration;

use event_sandbox_rs::prelude::*;
use serde_json::json;

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "event_sandbox=info,event_sandbox_rs=info".into()),
        )
        .init();

    // A tiny application store standing in for the host state
    let store = Arc::new(Mutex::new(json!({ "counter": 0, "user": { "name": "Ada" } })));

    let writer = Arc::clone(&store);
    let reader = Arc::clone(&store);

    // Configure the sandbox
    let config = SandboxConfig::builder()
        .timeout(Duration::from_secs(5))
        .memory_limit_mb(32)
        .inject_var("appVersion", json!("1.4.0"))
        .build();

    println!("Creating sandbox with config: {:?}", config);

    let sandbox = SecureSandbox::new(
        move |action| {
            let mut state = writer.lock().map_err(|_| anyhow::anyhow!("store poisoned"))?;
            if action.kind == "counter/add" {
                let by = action.payload.as_ref().and_then(|p| p.as_i64()).unwrap_or(1);
                let current = state["counter"].as_i64().unwrap_or(0);
                state["counter"] = json!(current + by);
            }
            Ok(())
        },
        move || {
            let state = reader.lock().map_err(|_| anyhow::anyhow!("store poisoned"))?;
            Ok(state.clone())
        },
        config,
    );
    sandbox.initialize().await?;

    // Simple computation
    let result = sandbox.execute("return [1, 2, 3].map((n) => n * n);").await;
    println!("Squares: {:?} in {}ms", result.value, result.duration_ms());

    // Read state, mutate it through the bridge, read it again
    let result = sandbox
        .execute(
            r#"
console.log('hello from', getState().user.name, 'running', appVersion);
dispatch({ type: 'counter/add', payload: 5 });
return getState().counter;
"#,
        )
        .await;
    println!("Counter after dispatch: {:?}", result.value);
    println!("Console: {:?}", sandbox.console().messages());

    // Typed results
    let typed: ExecutionResult<Vec<String>> = sandbox
        .execute_as("return ['a', 'b'].map((s) => s.toUpperCase());")
        .await;
    println!("Typed value: {:?}", typed.value);

    // Curated globals are host-side re-implementations
    let result = sandbox
        .execute("return { now: Date(0), max: Math.max(3, 9, 4), text: JSON.stringify({ ok: true }) };")
        .await;
    println!("Globals: {}", result.value.unwrap_or_default());

    println!("\nHost store: {}", store.lock().map_err(|_| SandboxError::System("store poisoned".into()))?);
    Ok(())
}
