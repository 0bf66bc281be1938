use floodgate::admission::{
    ControllerEvent, DegradationLevel, DropReason, FixedProbe, ResourceUsage, SamplingCurve,
};
use floodgate::fairness::{FairShareConfig, FairShareScheduler};
use floodgate::ledger::{
    AttemptTag, InMemoryStore, LedgerStore, LimitWindow, MeterDecision, PlatformRateLimitConfig,
    RateLimitKey, RateLimitLedger,
};
use floodgate::{
    AdminSurface, BackpressureConfig, BackpressureController, ControllerBuilder, Priority,
    QueuedMessage, Route, SendError, Transport, WorkerPoolConfig, WorkerPoolManager,
};
use parking_lot::Mutex;
use proptest::prelude::*;
use serde_json::json;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use uuid::Uuid;

const LEVELS: [DegradationLevel; 4] = [
    DegradationLevel::None,
    DegradationLevel::Low,
    DegradationLevel::Medium,
    DegradationLevel::High,
];

const PRIORITIES: [Priority; 4] = [
    Priority::Low,
    Priority::Medium,
    Priority::High,
    Priority::Critical,
];

fn controller_with(config: BackpressureConfig) -> Arc<BackpressureController> {
    ControllerBuilder::new()
        .config(config)
        .probe(Arc::new(FixedProbe::new(16.0, 1.0)))
        .rng_seed(42)
        .build_shared()
        .unwrap()
}

fn testing_controller() -> Arc<BackpressureController> {
    controller_with(BackpressureConfig::testing())
}

fn wait_until(timeout: Duration, mut done: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if done() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    done()
}

fn drops_by_priority(events: &crossbeam_channel::Receiver<ControllerEvent>) -> [u64; 4] {
    let mut counts = [0u64; 4];
    for event in events.try_iter() {
        if let ControllerEvent::MessageDropped { message, .. } = event {
            counts[message.priority.index()] += 1;
        }
    }
    counts
}

// ============================================================================
// Sampling curve properties
// ============================================================================

fn sampling_curve() -> impl Strategy<Value = SamplingCurve> {
    (
        prop::array::uniform4(0.0f64..=1.0),
        prop::array::uniform3(0.0f64..=4.0),
    )
        .prop_map(|(mut base, mut factor)| {
            base.sort_by(|a, b| a.total_cmp(b));
            factor.sort_by(|a, b| b.total_cmp(a));
            SamplingCurve {
                level_base: base,
                priority_factor: [factor[0], factor[1], factor[2], 0.0],
            }
        })
}

proptest! {
    #[test]
    fn test_drop_probability_non_decreasing_in_level(
        curve in sampling_curve(),
        prioritization in any::<bool>(),
    ) {
        let config = BackpressureConfig {
            sampling_curve: curve,
            enable_prioritization: prioritization,
            ..BackpressureConfig::testing()
        };
        prop_assert!(config.validate().is_ok());
        for priority in PRIORITIES {
            for pair in LEVELS.windows(2) {
                prop_assert!(
                    config.drop_probability(pair[0], priority)
                        <= config.drop_probability(pair[1], priority)
                );
            }
        }
    }

    #[test]
    fn test_drop_probability_non_increasing_in_priority(
        curve in sampling_curve(),
        prioritization in any::<bool>(),
    ) {
        let config = BackpressureConfig {
            sampling_curve: curve,
            enable_prioritization: prioritization,
            ..BackpressureConfig::testing()
        };
        for level in LEVELS {
            for pair in PRIORITIES.windows(2) {
                prop_assert!(
                    config.drop_probability(level, pair[1])
                        <= config.drop_probability(level, pair[0])
                );
            }
            prop_assert_eq!(config.drop_probability(level, Priority::Critical), 0.0);
        }
    }
}

// ============================================================================
// Circuit breakers
// ============================================================================

#[test]
fn test_manual_breaker_rejects_with_circuit_open_event() {
    let controller = testing_controller();
    let events = controller.subscribe();

    assert!(controller.open_circuit_breaker("X"));
    assert!(!controller.publish("X", json!({"n": 1}), Priority::Medium));

    let dropped: Vec<_> = events
        .try_iter()
        .filter_map(|e| match e {
            ControllerEvent::MessageDropped { message, reason } => Some((message.subject, reason)),
            _ => None,
        })
        .collect();
    assert_eq!(dropped, vec![("X".to_string(), DropReason::CircuitOpen)]);
    assert_eq!(controller.metrics().drops.circuit_open, 1);
}

#[test]
fn test_open_breaker_rejects_until_closed() {
    let controller = testing_controller();
    controller.open_circuit_breaker("orders");

    for priority in PRIORITIES {
        for i in 0..5 {
            assert!(!controller.publish("orders", json!(i), priority));
        }
    }
    // Other subjects are unaffected
    assert!(controller.publish("invoices", json!(1), Priority::Low));

    assert!(controller.close_circuit_breaker("orders"));
    assert!(controller.publish("orders", json!(1), Priority::Low));
}

#[test]
fn test_open_breaker_is_idempotent() {
    let controller = testing_controller();
    let events = controller.subscribe();

    assert!(controller.open_circuit_breaker("S"));
    assert!(!controller.open_circuit_breaker("S"));

    let opened = events
        .try_iter()
        .filter(|e| matches!(e, ControllerEvent::CircuitBreakerOpened { .. }))
        .count();
    assert_eq!(opened, 1);
    assert_eq!(controller.metrics().open_circuit_breakers, 1);
}

#[test]
fn test_failures_trip_breaker_and_cooldown_probes() {
    let controller = testing_controller();
    let config = controller.config();

    for _ in 0..config.min_failure_samples {
        controller.record_send_failure("flaky");
    }
    assert!(controller.breakers().any_open());
    assert!(!controller.publish("flaky", json!(1), Priority::Critical));

    // After the cooldown the breaker half-opens and a successful send closes it.
    thread::sleep(Duration::from_millis(config.breaker_cooldown_ms + 50));
    let admitted = (0..50).any(|i| controller.publish("flaky", json!(i), Priority::High));
    assert!(admitted);
    controller.record_send_success("flaky");
    assert!(!controller.breakers().any_open());
}

// ============================================================================
// Queue accounting
// ============================================================================

#[test]
fn test_drain_and_clear_account_for_every_message() {
    for _ in 0..20 {
        let controller = testing_controller();
        for i in 0..60 {
            assert!(controller.publish(&format!("s{i}"), json!(i), Priority::High));
        }
        let initial = controller.queue_depth();
        assert_eq!(initial, 60);

        let drainer = {
            let controller = Arc::clone(&controller);
            thread::spawn(move || controller.drain_queue())
        };
        let cleared = controller.clear_queue();
        let drained = drainer.join().unwrap();

        assert_eq!(initial, drained + cleared + controller.queue_depth());
        let metrics = controller.metrics();
        assert_eq!(metrics.total_drained as usize, drained);
        assert_eq!(metrics.total_cleared as usize, cleared);
    }
}

#[test]
fn test_clear_then_drain_sees_nothing() {
    let controller = testing_controller();
    for i in 0..10 {
        controller.publish("s", json!(i), Priority::Medium);
    }
    assert_eq!(controller.clear_queue(), 10);
    assert_eq!(controller.drain_queue(), 0);
    assert_eq!(controller.queue_depth(), 0);
}

// ============================================================================
// Degradation scenarios
// ============================================================================

#[test]
fn test_overflowing_queue_drops_and_degrades() {
    let controller = testing_controller();

    let accepted = (0..150)
        .filter(|i| controller.publish("bulk", json!({ "i": i }), Priority::Low))
        .count();
    assert!(accepted < 150);
    assert!(controller.metrics().total_dropped() >= 1);

    let level = controller.tick();
    assert_ne!(level, DegradationLevel::None);
    assert_ne!(controller.metrics().degradation_level, DegradationLevel::None);
    assert_eq!(controller.degradation_history().len(), 1);
}

#[test]
fn test_critical_survives_backpressure_better_than_low() {
    let controller = testing_controller();
    let events = controller.subscribe();

    // Memory above budget forces the highest level.
    let usage = ResourceUsage {
        memory_mb: 10_000.0,
        cpu_percent: 10.0,
    };
    assert_eq!(controller.evaluate(usage), DegradationLevel::High);

    for i in 0..40 {
        controller.publish(&format!("c{i}"), json!(i), Priority::Critical);
        controller.publish(&format!("l{i}"), json!(i), Priority::Low);
    }

    let drops = drops_by_priority(&events);
    let dropped_low = drops[Priority::Low.index()];
    let dropped_critical = drops[Priority::Critical.index()];
    assert!(dropped_low >= dropped_critical);
    assert!(dropped_low > 0);
    assert_eq!(dropped_critical, 0);
}

#[test]
fn test_recovery_steps_down_one_level_at_a_time() {
    let controller = testing_controller();
    let config = controller.config();
    let hot = ResourceUsage {
        memory_mb: config.max_memory_usage_mb as f64 * 2.0,
        cpu_percent: 0.0,
    };
    let cool = ResourceUsage::default();

    assert_eq!(controller.evaluate_at(hot, 1_000), DegradationLevel::High);
    assert_eq!(controller.evaluate_at(cool, 1_010), DegradationLevel::High);

    let mut now = 1_010;
    let mut seen = vec![DegradationLevel::High];
    while controller.degradation_level() != DegradationLevel::None {
        now += config.recovery_delay_ms;
        let level = controller.evaluate_at(cool, now);
        if seen.last() != Some(&level) {
            seen.push(level);
        }
        assert!(now < 1_010 + 10 * config.recovery_delay_ms);
    }
    assert_eq!(seen, LEVELS.iter().rev().copied().collect::<Vec<_>>());
}

#[test]
fn test_preset_is_reflected_in_metrics() {
    let controller = controller_with(BackpressureConfig::production());
    assert_eq!(controller.metrics().max_queue_size, 10_000);

    controller.apply_preset("testing").unwrap();
    assert_eq!(controller.metrics().max_queue_size, 100);

    assert!(controller.apply_preset("nonexistent").is_err());
    assert_eq!(controller.metrics().max_queue_size, 100);
}

// ============================================================================
// Fairness
// ============================================================================

#[test]
fn test_sustained_contention_stays_within_tolerance() {
    let scheduler = FairShareScheduler::new(FairShareConfig {
        tolerance: 1.0,
        window_ms: 60_000,
    });
    let weights = [("a", 1.0), ("b", 2.0), ("c", 4.0)];
    for (credential, weight) in weights {
        scheduler.set_weight("ig", credential, weight).unwrap();
    }

    let now = 10_000;
    for _ in 0..700 {
        let candidates = weights.iter().map(|(c, _)| (*c, 0u64));
        let next = scheduler.next_credential_at("ig", candidates, now).unwrap();
        scheduler.record_consumption_at("ig", &next, 1, now);
    }

    let check = scheduler.check_fairness_at("ig", now);
    assert!(check.fair, "spread {} over tolerance", check.spread);

    // Consumption tracks the weights: 100 / 200 / 400
    let ratios: Vec<f64> = weights
        .iter()
        .map(|(c, _)| scheduler.fairness_ratio_at("ig", c, now).unwrap())
        .collect();
    for ratio in &ratios {
        assert!((ratio - 100.0).abs() <= 1.0);
    }
}

// ============================================================================
// Rate limit ledger
// ============================================================================

#[test]
fn test_ledger_limits_and_persists_hits() {
    let store = Arc::new(InMemoryStore::new());
    let ledger = RateLimitLedger::with_store(store.clone()).unwrap();
    ledger
        .load_platform_configs(vec![
            PlatformRateLimitConfig::for_platform("tiktok").per_minute(3),
            PlatformRateLimitConfig::for_platform("tiktok")
                .endpoint("upload")
                .per_minute(1),
        ])
        .unwrap();

    let feed = RateLimitKey::new("acct", "tiktok", "feed");
    let upload = RateLimitKey::new("acct", "tiktok", "upload");
    let now = 120_000;

    for _ in 0..3 {
        assert!(ledger.meter_at(&feed, AttemptTag::new(Uuid::now_v7(), 0), now).is_allowed());
    }
    let limited = ledger.meter_at(&feed, AttemptTag::new(Uuid::now_v7(), 0), now);
    assert!(matches!(
        limited,
        MeterDecision::Limited {
            window: LimitWindow::Minute,
            ..
        }
    ));

    // The exact endpoint config wins over the wildcard
    assert!(ledger.meter_at(&upload, AttemptTag::new(Uuid::now_v7(), 0), now).is_allowed());
    assert!(!ledger.meter_at(&upload, AttemptTag::new(Uuid::now_v7(), 0), now).is_allowed());

    // Next minute frees the window
    assert!(ledger
        .meter_at(&feed, AttemptTag::new(Uuid::now_v7(), 0), now + 60_000)
        .is_allowed());

    assert!(ledger.flush_persistence(Duration::from_secs(5)));
    assert_eq!(store.hit_count(), 2);
    assert_eq!(ledger.total_hits(), 2);
    assert!(!ledger.persistence_degraded());

    // A fresh ledger picks the configs back up from the store
    drop(ledger);
    assert_eq!(store.load_platform_configs().unwrap().len(), 2);
    let restored = RateLimitLedger::with_store(store).unwrap();
    assert_eq!(restored.platform_configs().len(), 2);
}

#[test]
fn test_ledger_survives_store_outage() {
    let store = Arc::new(InMemoryStore::new());
    let ledger = RateLimitLedger::with_store(store.clone()).unwrap();
    ledger
        .load_platform_configs(vec![PlatformRateLimitConfig::for_platform("ig").per_hour(1)])
        .unwrap();
    assert!(ledger.flush_persistence(Duration::from_secs(5)));

    store.set_available(false);
    let key = RateLimitKey::new("acct", "ig", "media");
    assert!(ledger.meter(&key, AttemptTag::new(Uuid::now_v7(), 0)).is_allowed());
    assert!(!ledger.meter(&key, AttemptTag::new(Uuid::now_v7(), 0)).is_allowed());
    assert!(ledger.flush_persistence(Duration::from_secs(5)));
    assert!(ledger.persistence_degraded());

    store.set_available(true);
    assert!(!ledger.meter(&key, AttemptTag::new(Uuid::now_v7(), 0)).is_allowed());
    assert!(ledger.flush_persistence(Duration::from_secs(5)));
    assert!(!ledger.persistence_degraded());
}

// ============================================================================
// End to end
// ============================================================================

type Sent = Arc<Mutex<Vec<(Route, QueuedMessage)>>>;

fn recording_transport() -> (Arc<dyn Transport>, Sent) {
    let sent: Sent = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&sent);
    let transport: Arc<dyn Transport> = Arc::new(move |route: &Route, message: &QueuedMessage| {
        sink.lock().push((route.clone(), message.clone()));
        Ok::<(), SendError>(())
    });
    (transport, sent)
}

#[test]
fn test_pipeline_delivers_within_rate_limits() {
    let controller = testing_controller();
    let ledger = Arc::new(RateLimitLedger::new());
    ledger
        .load_platform_configs(vec![PlatformRateLimitConfig::for_platform("ig").per_day(3)])
        .unwrap();
    let scheduler = Arc::new(FairShareScheduler::default());
    let (transport, sent) = recording_transport();

    let pool = Arc::new(
        WorkerPoolManager::new(
            Arc::clone(&controller),
            Arc::clone(&ledger),
            Arc::clone(&scheduler),
            transport,
            WorkerPoolConfig {
                min_workers_per_platform: 1,
                max_workers_per_platform: 2,
                poll_interval_ms: 5,
                scale_interval_ms: 20,
                max_rate_limit_retries: 1,
                retry_base_delay_ms: 5,
                ..Default::default()
            },
        )
        .unwrap(),
    );
    pool.start().unwrap();

    for i in 0..5 {
        assert!(controller.publish("ig:alice", json!(i), Priority::High));
        assert!(controller.publish("ig:bob", json!(i), Priority::High));
    }

    assert!(wait_until(Duration::from_secs(10), || {
        let stats = pool.stats();
        stats.sent + stats.rate_limit_drops == 10
    }));
    let stats = pool.stats();
    assert_eq!(stats.sent, 6);
    assert_eq!(stats.rate_limit_drops, 4);
    assert!(wait_until(Duration::from_secs(5), || {
        controller.metrics().drops.rate_limited == 4
    }));

    // Each credential spends its own daily budget
    let sent = sent.lock();
    assert_eq!(sent.iter().filter(|(route, _)| route.credential == "alice").count(), 3);
    assert_eq!(sent.iter().filter(|(route, _)| route.credential == "bob").count(), 3);
    drop(sent);

    let admin =
        AdminSurface::new(Arc::clone(&controller), ledger, scheduler).with_pool(Arc::clone(&pool));
    let report = admin.status();
    assert!(report.workers.is_some());
    assert_eq!(report.queue_depth, 0);

    assert_eq!(pool.shutdown(), 0);
    assert!(pool.is_shut_down());
}

#[test]
fn test_shared_lane_is_served_by_weight() {
    let controller = testing_controller();
    let scheduler = Arc::new(FairShareScheduler::default());
    scheduler.set_weight("ig", "bob", 2.0).unwrap();
    let (transport, sent) = recording_transport();
    let pool = WorkerPoolManager::new(
        Arc::clone(&controller),
        Arc::new(RateLimitLedger::new()),
        Arc::clone(&scheduler),
        transport,
        WorkerPoolConfig {
            min_workers_per_platform: 1,
            max_workers_per_platform: 1,
            poll_interval_ms: 5,
            auto_scale: false,
            ..Default::default()
        },
    )
    .unwrap();

    // Alice's backlog is older, so plain FIFO would serve her first
    for i in 0..10 {
        assert!(controller.publish("ig:alice", json!(i), Priority::High));
    }
    for i in 0..10 {
        assert!(controller.publish("ig:bob", json!(i), Priority::High));
    }
    assert_eq!(pool.dispatch_once(), 20);
    assert_eq!(pool.scale_workers("ig"), 1);

    assert!(wait_until(Duration::from_secs(5), || sent.lock().len() == 20));
    let order: Vec<_> = sent
        .lock()
        .iter()
        .map(|(route, _)| route.credential.clone())
        .collect();
    let bob_first_nine = order[..9].iter().filter(|c| *c == "bob").count();
    assert_eq!(bob_first_nine, 6);
    assert_eq!(order.iter().filter(|c| *c == "alice").count(), 10);
    pool.shutdown();
}
