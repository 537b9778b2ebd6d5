use criterion::{black_box, criterion_group, criterion_main, Criterion};
use renderd::detection::{detect_block, detect_captcha, PageSnapshot};
use renderd::{Config, ProxySettings};
use std::time::Duration;

// Fast settings for all benchmarks
fn configure_fast_group(group: &mut criterion::BenchmarkGroup<criterion::measurement::WallTime>) {
    group.warm_up_time(Duration::from_millis(500));
    group.measurement_time(Duration::from_millis(500));
    group.sample_size(20);
}

fn benchmark_config_creation(c: &mut Criterion) {
    let mut group = c.benchmark_group("config");
    configure_fast_group(&mut group);

    group.bench_function("creation", |b| {
        b.iter(|| {
            let config = Config::default();
            black_box(config);
        });
    });

    group.finish();
}

fn benchmark_request_validation(c: &mut Criterion) {
    let mut group = c.benchmark_group("request_validation");
    configure_fast_group(&mut group);

    let raw = serde_json::json!({
        "url": "https://example.com/listing?page=3",
        "render": {
            "wait_until": "networkidle",
            "timeout_ms": 20000,
            "scroll": { "enabled": true, "max_scrolls": 10, "delay_ms": 400 }
        },
        "browser": { "viewport": { "width": 1920, "height": 1080 } }
    });

    group.bench_function("validate", |b| {
        b.iter(|| {
            let body: renderd::api::RenderRequestBody =
                serde_json::from_value(raw.clone()).unwrap();
            let result = renderd::validate(body);
            let _ = black_box(result);
        });
    });

    group.finish();
}

fn benchmark_proxy_parsing(c: &mut Criterion) {
    let mut group = c.benchmark_group("proxy_parsing");
    configure_fast_group(&mut group);

    let servers = [
        "proxy.example.com",
        "http://proxy.example.com:3128",
        "socks5://10.0.0.1",
    ];

    group.bench_function("parse", |b| {
        b.iter(|| {
            for server in &servers {
                let result = ProxySettings::parse(server, None, None);
                let _ = black_box(result);
            }
        });
    });

    group.finish();
}

fn benchmark_detection(c: &mut Criterion) {
    let mut group = c.benchmark_group("detection");
    configure_fast_group(&mut group);

    let snapshot = PageSnapshot {
        html: format!(
            "<html><head>{}</head><body><h1>Catalog</h1>{}</body></html>",
            "<script src='/app.js'></script>".repeat(4),
            "<div class='row'>item</div>".repeat(200),
        ),
        text: "Catalog item ".repeat(200),
        status: 200,
        selector_hits: Vec::new(),
    };

    group.bench_function("captcha", |b| {
        b.iter(|| {
            let verdict = detect_captcha(black_box(&snapshot));
            black_box(verdict);
        });
    });

    group.bench_function("block", |b| {
        b.iter(|| {
            let verdict = detect_block(black_box(&snapshot));
            black_box(verdict);
        });
    });

    group.finish();
}

criterion_group!(
    benches,
    benchmark_config_creation,
    benchmark_request_validation,
    benchmark_proxy_parsing,
    benchmark_detection
);
criterion_main!(benches);
