//! Basic usage example for the floodgate crate.

use floodgate::admission::{ControllerEvent, FixedProbe, ResourceUsage};
use floodgate::{BackpressureConfig, ControllerBuilder, Priority};
use serde_json::json;
use std::sync::Arc;

fn main() {
    println!("=== Basic Backpressure Example ===\n");

    // Example 1: Publishing into a healthy controller
    healthy_example();

    println!("{}", "\n".to_owned() + "=".repeat(50).as_str() + "\n");

    // Example 2: Load shedding under pressure
    shedding_example();

    println!("{}", "\n".to_owned() + "=".repeat(50).as_str() + "\n");

    // Example 3: Circuit breakers
    breaker_example();
}

fn healthy_example() {
    println!("1. Healthy Controller:");

    let controller = ControllerBuilder::new()
        .config(BackpressureConfig::testing())
        .probe(Arc::new(FixedProbe::new(64.0, 5.0)))
        .build()
        .expect("testing preset is valid");

    for i in 1..=5 {
        let accepted = controller.publish("orders", json!({ "order": i }), Priority::Medium);
        println!("   Publish {} - {}", i, if accepted { "✅ Accepted" } else { "❌ Dropped" });
    }

    let batch = controller.dequeue(10);
    println!("   Dequeued {} entries for delivery", batch.len());
    println!("   Health: {:?}", controller.health_status());
}

fn shedding_example() {
    println!("2. Load Shedding:");

    let controller = ControllerBuilder::new()
        .config(BackpressureConfig::testing())
        .probe(Arc::new(FixedProbe::new(64.0, 5.0)))
        .rng_seed(3)
        .build()
        .expect("testing preset is valid");

    // Memory far over budget pushes the controller to `high`
    let level = controller.evaluate(ResourceUsage {
        memory_mb: 8_192.0,
        cpu_percent: 20.0,
    });
    println!("   Degradation level: {}", level);

    for priority in [Priority::Low, Priority::Medium, Priority::High, Priority::Critical] {
        let accepted = (0..100)
            .filter(|i| controller.publish(&format!("{priority}-{}", i % 7), json!(i), priority))
            .count();
        println!("   {:<8} accepted {:>3}/100", priority, accepted);
    }

    let metrics = controller.metrics();
    println!("\n{}", metrics.summary());
    for rec in controller.recommendations() {
        println!("   [{:?}] {}", rec.severity, rec.message);
    }
}

fn breaker_example() {
    println!("3. Circuit Breakers:");

    let controller = ControllerBuilder::new()
        .config(BackpressureConfig::testing())
        .probe(Arc::new(FixedProbe::new(64.0, 5.0)))
        .build()
        .expect("testing preset is valid");
    let events = controller.subscribe();

    controller.open_circuit_breaker("payments");
    let accepted = controller.publish("payments", json!({"amount": 10}), Priority::Critical);
    println!("   Publish to open breaker accepted: {}", accepted);

    controller.close_circuit_breaker("payments");
    let accepted = controller.publish("payments", json!({"amount": 10}), Priority::Critical);
    println!("   Publish after close accepted: {}", accepted);

    println!("   Events:");
    for event in events.try_iter() {
        match event {
            ControllerEvent::MessageDropped { message, reason } => {
                println!("   - message_dropped ({} on {})", reason, message.subject)
            }
            other => println!("   - {}", other.name()),
        }
    }
}
