//! End-to-end pipeline behavior through the `Tracker` facade.

use parking_lot::Mutex;
use serde_json::{json, Map, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracker::flush::{DeliveryTransport, FlushBatch};
use tracker::tracker::REMOTE_CONFIG_CHANGED_EVENT;
use tracker::types::EVENT_SESSION_ID;
use tracker::{
    AgentConfig, AgentError, EventBuilder, MemoryBackend, Result, SchedulerConfig, Tracker,
    TrackerParts, WorkerState,
};

const WAIT: Duration = Duration::from_secs(5);
const MINUTE: u64 = 60 * 1000;
const T0: u64 = 1_700_000_000_000;

#[derive(Default)]
struct RecordingTransport {
    fail: AtomicBool,
    events: Mutex<Vec<Value>>,
}

impl RecordingTransport {
    fn names(&self) -> Vec<String> {
        self.events
            .lock()
            .iter()
            .map(|e| e["event"].as_str().unwrap_or_default().to_string())
            .collect()
    }
}

impl DeliveryTransport for RecordingTransport {
    fn deliver(&self, batch: &FlushBatch) -> Result<()> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(AgentError::Transport("connection refused".to_string()));
        }
        self.events.lock().extend(batch.events.iter().cloned());
        Ok(())
    }
}

fn tracker_with(config: AgentConfig) -> (Tracker, Arc<RecordingTransport>) {
    let transport = Arc::new(RecordingTransport::default());
    let parts = TrackerParts::in_memory().with_transport(transport.clone());
    (Tracker::with_parts(config, parts).unwrap(), transport)
}

fn props(value: Value) -> Map<String, Value> {
    value.as_object().cloned().unwrap_or_default()
}

#[test]
fn test_events_delivered_in_submission_order() {
    let (tracker, transport) = tracker_with(AgentConfig::default());
    for n in 0..120 {
        tracker.track(&format!("E{}", n), props(json!({ "n": n })));
    }

    assert_eq!(tracker.flush_sync().unwrap(), 120);
    assert_eq!(tracker.pending_records(), 0);

    let names = transport.names();
    let expected: Vec<String> = (0..120).map(|n| format!("E{}", n)).collect();
    assert_eq!(names, expected);

    let events = transport.events.lock();
    assert_eq!(events[0]["type"], "track");
    assert_eq!(events[0]["lib"]["$lib"], "Rust");
    assert!(events[0]["_flush_time"].is_u64());
    assert!(events[0]["properties"][EVENT_SESSION_ID].is_string());
}

#[test]
fn test_idle_gap_rotates_session_id() {
    let (tracker, transport) = tracker_with(AgentConfig::default());
    tracker.track_event(EventBuilder::track("A", T0));
    tracker.track_event(EventBuilder::track("B", T0 + 29 * MINUTE));
    tracker.track_event(EventBuilder::track("C", T0 + 60 * MINUTE));
    tracker.flush_sync().unwrap();

    let events = transport.events.lock();
    let ids: Vec<&str> = events
        .iter()
        .map(|e| e["properties"][EVENT_SESSION_ID].as_str().unwrap())
        .collect();
    assert_eq!(ids[0], ids[1]);
    assert_ne!(ids[1], ids[2]);
}

#[test]
fn test_sessions_disabled_leave_events_unstamped() {
    let (tracker, transport) = tracker_with(AgentConfig::default().with_session(false));
    tracker.track("A", Map::new());
    tracker.flush_sync().unwrap();
    assert!(transport.events.lock()[0]["properties"]
        .get(EVENT_SESSION_ID)
        .is_none());
}

#[test]
fn test_consent_replays_in_order_before_later_events() {
    let (tracker, transport) = tracker_with(AgentConfig::default().disable_data_collect());
    tracker.track("A", Map::new());
    tracker.track("B", Map::new());
    assert!(tracker.drain(WAIT));
    assert_eq!(tracker.pending_records(), 0);
    assert_eq!(tracker.stats().buffered, 2);

    assert_eq!(tracker.grant_consent(), 2);
    tracker.track("C", Map::new());

    tracker.flush_sync().unwrap();
    assert_eq!(transport.names(), vec!["A", "B", "C"]);
}

#[test]
fn test_blacklisted_event_never_written() {
    let (tracker, transport) = tracker_with(AgentConfig::default());
    tracker.apply_remote_config(r#"{"v":"1","configs":{"event_blacklist":["Spam"],"effect_mode":1}}"#);
    tracker.track("Spam", Map::new());
    tracker.track("Ham", Map::new());
    tracker.flush_sync().unwrap();

    assert_eq!(transport.names(), vec![REMOTE_CONFIG_CHANGED_EVENT, "Ham"]);
    assert_eq!(tracker.stats().ingest.ignored, 1);
}

#[test]
fn test_kill_switch_stops_ingestion_but_not_delivery() {
    let (tracker, transport) = tracker_with(AgentConfig::default());
    tracker.track("Before", Map::new());
    assert!(tracker.drain(WAIT));

    tracker.apply_remote_config(r#"{"v":"2","configs":{"disableSDK":true,"effect_mode":1}}"#);
    tracker.track("After", Map::new());
    assert!(tracker.drain(WAIT));
    assert_eq!(tracker.pending_records(), 1);

    tracker.flush_sync().unwrap();
    assert_eq!(transport.names(), vec!["Before"]);
}

#[test]
fn test_deferred_config_takes_effect_after_restart() {
    let backend = Arc::new(MemoryBackend::new());
    let parts = || TrackerParts {
        backend: backend.clone(),
        state: backend.clone(),
        ..TrackerParts::in_memory()
    };

    let first = Tracker::with_parts(AgentConfig::default(), parts()).unwrap();
    assert!(!first.apply_remote_config(r#"{"v":"3","configs":{"event_blacklist":["Later"]}}"#));
    first.track("Later", Map::new());
    assert!(first.drain(WAIT));
    assert_eq!(first.pending_records(), 2);
    first.shutdown();
    drop(first);

    let second = Tracker::with_parts(AgentConfig::default(), parts()).unwrap();
    second.track("Later", Map::new());
    assert!(second.drain(WAIT));
    assert_eq!(second.pending_records(), 2);
    assert!(second.remote_config().ignores("Later"));
}

#[test]
fn test_malformed_config_falls_back_to_permissive_default() {
    let backend = Arc::new(MemoryBackend::new());
    let parts = || TrackerParts {
        backend: backend.clone(),
        state: backend.clone(),
        ..TrackerParts::in_memory()
    };

    let first = Tracker::with_parts(AgentConfig::default(), parts()).unwrap();
    first.apply_remote_config("<html>502 Bad Gateway</html>");
    first.shutdown();
    drop(first);

    let second = Tracker::with_parts(AgentConfig::default(), parts()).unwrap();
    let config = second.remote_config();
    assert!(!config.disable_sdk);
    assert!(config.event_blacklist.is_empty());
    second.track("Anything", Map::new());
    assert!(second.drain(WAIT));
    assert_eq!(second.stats().ingest.stored, 1);
}

#[test]
fn test_worker_stop_and_restart_loses_nothing() {
    let (tracker, transport) = tracker_with(AgentConfig::default());
    tracker.stop_worker();
    assert_eq!(tracker.worker_state(), WorkerState::Stopped);

    for n in 0..10 {
        tracker.track(&format!("E{}", n), Map::new());
    }
    assert_eq!(tracker.pending_records(), 0);
    assert_eq!(tracker.stats().queued, 10);

    tracker.start_worker().unwrap();
    tracker.flush_sync().unwrap();
    assert_eq!(transport.names().len(), 10);
    assert_eq!(transport.names()[9], "E9");
}

#[test]
fn test_failed_delivery_keeps_events_for_retry() {
    let (tracker, transport) = tracker_with(AgentConfig::default());
    tracker.track("A", Map::new());
    tracker.track("B", Map::new());

    transport.fail.store(true, Ordering::SeqCst);
    assert!(matches!(tracker.flush_sync(), Err(AgentError::Transport(_))));
    assert_eq!(tracker.pending_records(), 2);

    transport.fail.store(false, Ordering::SeqCst);
    assert_eq!(tracker.flush_sync().unwrap(), 2);
    assert_eq!(transport.names(), vec!["A", "B"]);
    assert_eq!(tracker.stats().flush.unwrap().failures, 1);
}

#[test]
fn test_declared_time_property_overrides_event_time() {
    let (tracker, transport) = tracker_with(AgentConfig::default());
    tracker.track("Backfill", props(json!({"$time": T0})));
    tracker.flush_sync().unwrap();

    let events = transport.events.lock();
    assert_eq!(events[0]["time"], T0);
    assert!(events[0]["properties"].get("$time").is_none());
}

#[test]
fn test_delete_all_is_not_held_back_by_consent() {
    let backend = Arc::new(MemoryBackend::new());
    let parts = || TrackerParts {
        backend: backend.clone(),
        state: backend.clone(),
        ..TrackerParts::in_memory()
    };

    let first = Tracker::with_parts(AgentConfig::default(), parts()).unwrap();
    first.track("A", Map::new());
    first.track("B", Map::new());
    assert!(first.drain(WAIT));
    first.shutdown();
    drop(first);

    let config = AgentConfig::default()
        .disable_data_collect()
        .with_replay_capacity(1);
    let second = Tracker::with_parts(config, parts()).unwrap();
    assert_eq!(second.pending_records(), 2);

    // Fills the replay buffer.
    second.track("C", Map::new());
    second.delete_all();
    assert!(second.drain(WAIT));
    assert_eq!(second.pending_records(), 0);
    assert_eq!(second.stats().buffered, 1);

    assert_eq!(second.grant_consent(), 1);
    assert!(second.drain(WAIT));
    assert_eq!(second.pending_records(), 1);
}

#[test]
fn test_flush_interleaved_with_ingestion_delivers_each_event_once() {
    let (tracker, transport) = tracker_with(AgentConfig::default());
    let done = AtomicBool::new(false);

    std::thread::scope(|scope| {
        scope.spawn(|| {
            while !done.load(Ordering::SeqCst) {
                tracker.flush_once().unwrap();
            }
        });
        for n in 0..500 {
            tracker.track(&format!("E{}", n), Map::new());
        }
        assert!(tracker.drain(WAIT));
        done.store(true, Ordering::SeqCst);
    });
    tracker.flush_sync().unwrap();

    let expected: Vec<String> = (0..500).map(|n| format!("E{}", n)).collect();
    assert_eq!(transport.names(), expected);
    assert_eq!(tracker.pending_records(), 0);
}

async fn wait_for_delivery(transport: &RecordingTransport, count: usize) {
    for _ in 0..300 {
        if transport.names().len() >= count {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

fn hourly_flush() -> SchedulerConfig {
    SchedulerConfig {
        flush_interval: Duration::from_secs(3600),
        ..SchedulerConfig::default()
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_bulk_size_wakes_flush_scheduler() {
    let (tracker, transport) = tracker_with(AgentConfig::default().with_flush_bulk_size(50));
    tracker.spawn_schedulers(hourly_flush());
    // Let the immediate first tick pass on the empty store.
    tokio::time::sleep(Duration::from_millis(200)).await;

    for n in 0..49 {
        tracker.track(&format!("E{}", n), Map::new());
    }
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(transport.names().is_empty());

    tracker.track("E49", Map::new());
    wait_for_delivery(&transport, 50).await;
    assert_eq!(transport.names().len(), 50);
    assert_eq!(transport.names()[49], "E49");
    tracker.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_config_change_event_is_flushed_right_away() {
    let (tracker, transport) = tracker_with(AgentConfig::default());
    tracker.spawn_schedulers(hourly_flush());
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert!(tracker.apply_remote_config(r#"{"v":"5","configs":{"effect_mode":1}}"#));
    wait_for_delivery(&transport, 1).await;
    assert_eq!(transport.names(), vec![REMOTE_CONFIG_CHANGED_EVENT]);
    tracker.shutdown();
}
