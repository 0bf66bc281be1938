//! End-to-end pipeline: controller, ledger, fair-share scheduler, worker
//! pool and admin surface wired together.
//!
//! Run with `RUST_LOG=debug cargo run --example worker_pool` for the
//! library's structured logs.

use floodgate::fairness::{FairShareConfig, FairShareScheduler};
use floodgate::ledger::{InMemoryStore, PlatformRateLimitConfig, RateLimitLedger};
use floodgate::{
    init_tracing, AdminSurface, BackpressureConfig, ControllerBuilder, LoadTestSpec, Priority,
    QueuedMessage, Route, SendError, Transport, WorkerPoolConfig, WorkerPoolManager,
};
use serde_json::json;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

fn main() {
    init_tracing();
    println!("=== Worker Pool Example ===\n");

    let controller = ControllerBuilder::new()
        .config(BackpressureConfig::testing())
        .build_shared()
        .expect("testing preset is valid");
    let _monitor = Arc::clone(&controller)
        .start_monitor()
        .expect("monitor thread");

    // Ten sends per minute per Instagram credential, three in any burst
    let store = Arc::new(InMemoryStore::new());
    let ledger = Arc::new(RateLimitLedger::with_store(store.clone()).expect("persistence thread"));
    ledger
        .load_platform_configs(vec![
            PlatformRateLimitConfig::for_platform("instagram")
                .per_minute(10)
                .burst(3, 1)
                .jitter(5, 20),
            PlatformRateLimitConfig::for_platform("tiktok").per_minute(100),
        ])
        .expect("valid rate limits");

    let scheduler = Arc::new(FairShareScheduler::new(FairShareConfig::default()));
    scheduler
        .set_weight("instagram", "brand", 2.0)
        .expect("positive weight");

    let delivered = Arc::new(AtomicU64::new(0));
    let counter = Arc::clone(&delivered);
    let transport: Arc<dyn Transport> = Arc::new(move |route: &Route, message: &QueuedMessage| {
        counter.fetch_add(message.batch_size() as u64, Ordering::Relaxed);
        println!(
            "   → {} ({} payloads, {})",
            route,
            message.batch_size(),
            message.priority
        );
        Ok::<(), SendError>(())
    });

    let pool = Arc::new(
        WorkerPoolManager::new(
            Arc::clone(&controller),
            Arc::clone(&ledger),
            Arc::clone(&scheduler),
            transport,
            WorkerPoolConfig {
                max_rate_limit_retries: 2,
                ..WorkerPoolConfig::default()
            },
        )
        .expect("valid pool config"),
    );
    pool.start().expect("dispatcher thread");

    let admin = AdminSurface::new(
        Arc::clone(&controller),
        Arc::clone(&ledger),
        Arc::clone(&scheduler),
    )
    .with_pool(Arc::clone(&pool));

    println!("1. Publishing for two Instagram credentials and one TikTok credential:");
    for i in 0..8 {
        controller.publish("instagram:brand:media", json!({ "post": i }), Priority::High);
        controller.publish("instagram:creator:media", json!({ "post": i }), Priority::Medium);
        controller.publish("tiktok:studio:upload", json!({ "clip": i }), Priority::Low);
    }
    thread::sleep(Duration::from_secs(2));

    println!("\n2. Synthetic load test:");
    let id = admin
        .start_load_test(LoadTestSpec {
            subject_prefix: "tiktok:loadtest".into(),
            subjects: 4,
            messages_per_second: 40,
            duration_ms: 1_000,
            priority: Priority::Low,
        })
        .expect("no load test running");
    println!("   Started load test {id}");
    thread::sleep(Duration::from_millis(1_500));
    if let Some(report) = admin.load_test_status() {
        println!(
            "   Published {} accepted {} rejected {}",
            report.published,
            report.accepted,
            report.rejected()
        );
    }

    println!("\n3. Status:");
    let status = admin.status();
    println!(
        "   {} ({}) level={} queue={} action: {}",
        serde_json::to_string(&status.health).unwrap_or_default(),
        status.http_status,
        status.degradation_level,
        status.queue_depth,
        status.suggested_action
    );
    println!("   Delivered payloads: {}", delivered.load(Ordering::Relaxed));
    println!("   Pool: {:?}", pool.stats());
    if let Ok(state) = admin.fair_share_state("instagram") {
        for credential in state.credentials {
            println!(
                "   instagram/{} weight={} consumed={}",
                credential.credential, credential.weight, credential.consumed
            );
        }
    }
    println!("   Rate limit hits: {}", ledger.total_hits());
    ledger.flush_persistence(Duration::from_secs(1));
    println!("   Persisted hits: {}", store.hit_count());

    let abandoned = pool.shutdown();
    println!("\nShut down, {abandoned} pending entries abandoned");
}
