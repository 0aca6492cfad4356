//! # Tracker Demo
//!
//! Starts an agent from environment configuration, records a few events and
//! runs the background schedulers until Ctrl-C.

use serde_json::{json, Map, Value};
use std::sync::Arc;
use tracker::{AgentConfig, SchedulerConfig, Tracker};

fn props(value: Value) -> Map<String, Value> {
    value.as_object().cloned().unwrap_or_default()
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("=================================================");
    println!("  Tracker Agent - Event Collection Demo          ");
    println!("=================================================");
    println!();

    let config = AgentConfig::from_env();
    println!("Opening event store at {}...", config.db_path.display());

    // The HTTP clients block, so the tracker is built off the runtime threads.
    let tracker = match tokio::task::spawn_blocking(move || Tracker::new(config)).await? {
        Ok(tracker) => Arc::new(tracker),
        Err(e) => {
            eprintln!("✗ Failed to initialize tracker: {}", e);
            return Err(e.into());
        }
    };
    println!("✓ Tracker initialized");
    println!("  - Pending records: {}", tracker.pending_records());
    println!(
        "  - Delivery: {}",
        tracker.config().server_url.as_deref().unwrap_or("disabled")
    );
    println!(
        "  - Remote config: {}",
        tracker.config().remote_config_url.as_deref().unwrap_or("disabled")
    );
    println!();

    tracker.track("AppStart", props(json!({"resume_from_background": false})));
    tracker.track("ViewScreen", props(json!({"screen": "home"})));
    tracker.track("Purchase", props(json!({"sku": "demo-1", "price": 9.99})));

    tracker.spawn_schedulers(SchedulerConfig::from_agent_config(tracker.config()));
    println!("Schedulers running, press Ctrl-C to stop");
    println!();

    tokio::signal::ctrl_c().await?;

    let stats = {
        let tracker = tracker.clone();
        tokio::task::spawn_blocking(move || {
            if let Err(e) = tracker.flush_sync() {
                eprintln!("✗ Final flush failed: {}", e);
            }
            tracker.shutdown();
            tracker.stats()
        })
        .await?
    };

    println!("Tracker Statistics:");
    println!("  - Submitted: {}", stats.ingest.submitted);
    println!("  - Stored: {}", stats.ingest.stored);
    println!("  - Ignored: {}", stats.ingest.ignored);
    println!("  - Rejected: {}", stats.ingest.rejected);
    println!("  - Evicted: {}", stats.store.evicted);
    println!("  - Pending: {}", stats.pending_records);
    if let Some(flush) = stats.flush {
        println!("  - Delivered: {}", flush.events_delivered);
    }
    println!();

    // Drop the blocking HTTP clients off the runtime threads.
    tokio::task::spawn_blocking(move || drop(tracker)).await?;

    println!("=================================================");
    println!("  Tracker Shut Down");
    println!("=================================================");

    Ok(())
}
