//! Benchmarks for the event sandbox.
//!
//! Run with: cargo bench

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use event_sandbox_rs::prelude::*;
use event_sandbox_rs::sandbox::marshal::{dump, inject};
use serde_json::{json, Value};
use tokio::runtime::{Builder, Runtime};

fn runtime() -> Runtime {
    Builder::new_current_thread()
        .enable_time()
        .build()
        .expect("failed to build tokio runtime")
}

fn sandbox() -> SecureSandbox {
    SecureSandbox::new(
        |_| Ok(()),
        || Ok(json!({ "items": (0..100).collect::<Vec<_>>() })),
        SandboxConfig::default(),
    )
}

/// Benchmark cold start (runtime, context and globals).
fn bench_cold_start(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("cold_start");
    group.sample_size(20);

    group.bench_function("initialize", |b| {
        b.iter(|| {
            let sandbox = sandbox();
            rt.block_on(sandbox.initialize()).unwrap();
            black_box(sandbox)
        });
    });

    group.finish();
}

/// Benchmark guest code execution on a warm sandbox.
fn bench_execution(c: &mut Criterion) {
    let rt = runtime();
    let sandbox = sandbox();
    rt.block_on(sandbox.initialize()).unwrap();

    let mut group = c.benchmark_group("execution");

    group.bench_function("return_constant", |b| {
        b.iter(|| black_box(rt.block_on(sandbox.execute("return 1 + 1;"))));
    });

    group.bench_function("loop_1000", |b| {
        b.iter(|| {
            black_box(rt.block_on(
                sandbox.execute("let total = 0; for (let i = 0; i < 1000; i++) { total += i; } return total;"),
            ))
        });
    });

    group.bench_function("get_state_sum", |b| {
        b.iter(|| {
            black_box(rt.block_on(
                sandbox.execute("return getState().items.reduce((a, b) => a + b, 0);"),
            ))
        });
    });

    group.finish();
}

/// Benchmark dispatcher chains of increasing length.
fn bench_dispatch_chains(c: &mut Criterion) {
    let rt = runtime();
    let mut dispatcher = EventDispatcher::new(|_| Ok(()), || Ok(json!({})), DispatcherConfig::default());
    dispatcher.set_context("appName", "Bench");
    rt.block_on(dispatcher.initialize()).unwrap();

    let mut group = c.benchmark_group("dispatch_chain");
    for length in [1usize, 4, 16].iter() {
        let chain: Vec<String> = (0..*length)
            .map(|i| format!("dispatch({{ type: 'step', payload: {i} }}); return appName.length + {i};"))
            .collect();

        group.throughput(Throughput::Elements(*length as u64));
        group.bench_with_input(BenchmarkId::from_parameter(length), &chain, |b, chain| {
            b.iter(|| {
                black_box(
                    rt.block_on(dispatcher.execute(chain.clone(), Some(json!({ "x": 1 })), &[]))
                        .unwrap(),
                )
            });
        });
    }
    group.finish();
}

/// Benchmark marshaling of nested values.
fn bench_marshal(c: &mut Criterion) {
    let qjs = rquickjs::Runtime::new().unwrap();
    let context = rquickjs::Context::full(&qjs).unwrap();

    let mut group = c.benchmark_group("marshal");
    for width in [10usize, 100, 1000].iter() {
        let value: Value = json!({
            "rows": (0..*width)
                .map(|i| json!({ "id": i, "label": format!("row {i}"), "ratio": i as f64 / 3.0 }))
                .collect::<Vec<_>>()
        });

        group.throughput(Throughput::Elements(*width as u64));
        group.bench_with_input(BenchmarkId::new("inject_dump", width), &value, |b, value| {
            b.iter(|| {
                context.with(|ctx| {
                    let handle = inject(&ctx, value).unwrap();
                    black_box(dump(&handle).unwrap())
                })
            });
        });
    }
    group.finish();
}

/// Benchmark the static validator.
fn bench_validation(c: &mut Criterion) {
    let code = "const items = getState().items;\n\
                items.forEach((item) => setComponentData(item.id, item.value));\n\
                if (window.parent) { eval('1'); }\n"
        .repeat(20);

    let mut group = c.benchmark_group("validation");
    group.bench_function("validate", |b| {
        b.iter(|| black_box(CodeValidator::validate(&code)));
    });
    group.bench_function("check_syntax", |b| {
        b.iter(|| black_box(CodeValidator::check_syntax(&code)));
    });
    group.finish();
}

criterion_group!(
    benches,
    bench_cold_start,
    bench_execution,
    bench_dispatch_chains,
    bench_marshal,
    bench_validation,
);

criterion_main!(benches);
