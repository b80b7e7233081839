//! Example of binding handler chains to UI events through the dispatcher.
//!
//! Run with: cargo run --example event_chains

use std::sync::{Arc, Mutex};

use event_sandbox_rs::prelude::*;
use event_sandbox_rs::ValidationCache;
use serde_json::{json, Value};

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "event_sandbox=info,event_sandbox_rs=info".into()),
        )
        .init();

    println!("=== Event Chains Example ===\n");

    let components = Arc::new(Mutex::new(json!({})));
    let writer = Arc::clone(&components);
    let reader = Arc::clone(&components);

    let config = DispatcherConfig::default()
        .with_context("appName", json!("Demo"))
        .with_context("theme", json!({ "primary": "#1677ff" }));

    let mut dispatcher = EventDispatcher::new(
        move |action| {
            let mut state = writer.lock().map_err(|_| anyhow::anyhow!("store poisoned"))?;
            if let Some(payload) = action.payload {
                let id = payload["id"].as_str().unwrap_or("unknown").to_string();
                let entry = payload.get("value").or_else(|| payload.get("config")).cloned();
                state[id] = entry.unwrap_or(Value::Null);
            }
            Ok(())
        },
        move || {
            let state = reader.lock().map_err(|_| anyhow::anyhow!("store poisoned"))?;
            Ok(json!({ "components": state.clone() }))
        },
        config,
    )
    .with_validation_cache(Arc::new(ValidationCache::new()));
    dispatcher.initialize().await?;

    // A schema node's `events.onClick`, bound once and fired many times
    let on_click = dispatcher.create_handler(vec![
        "setComponentData('greeting', 'Hello from ' + appName);",
        "setComponentConfig('greeting', { color: theme.primary, clicks: event.clicks });",
        "return getState().components.greeting;",
    ]);
    for clicks in 1..=2 {
        let value = on_click.call(Some(json!({ "clicks": clicks })), &[]).await?;
        println!("onClick #{clicks} resolved to {value:?}");
    }

    // A chain whose middle step fails stops there
    let outcome = dispatcher
        .execute(
            vec![
                "return 'validated';",
                "throw new Error('submit rejected');",
                "setComponentData('status', 'sent');",
            ],
            None,
            &[],
        )
        .await?;
    for (i, result) in outcome.results().iter().enumerate() {
        println!("step {i}: success={} error={:?}", result.success, result.error);
    }
    println!("handler value: {:?}", outcome.handler_value());

    // Context updates apply to the next call
    dispatcher.set_context("appName", "Renamed");
    let outcome = dispatcher
        .execute("console.info('now', appName); return appName;", None, &[json!(1)])
        .await?;
    println!("after set_context: {:?}", outcome.handler_value());

    // Advisory findings are logged but the code still runs, contained
    let report = dispatcher.validate("return typeof document;");
    println!("validation: valid={} findings={}", report.valid, report.dangerous_patterns.len());

    println!("\nComponents: {}", components.lock().map_err(|_| SandboxError::System("store poisoned".into()))?);
    dispatcher.destroy();
    Ok(())
}
