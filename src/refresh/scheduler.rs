//! Background schedulers - periodic tasks driving delivery, remote config
//! polling and the session heartbeat.
//!
//! Each scheduler runs as a tokio task started with `start(self: Arc<Self>)`
//! and loops on an interval. Blocking work (SQLite, HTTP) goes through
//! `spawn_blocking` so the runtime threads never block.
//!
//! # Flush
//!
//! Runs every `flush_interval` and whenever the ingestion pipeline signals
//! that the store reached the bulk size.
//!
//! # Remote config
//!
//! Checks the fetch anchor every `remote_check_interval` and fetches when the
//! randomized deadline has passed. The first check happens at startup.
//!
//! # Session heartbeat
//!
//! Rotates the session after an idle gap even when no events arrive.

use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::interval;

use crate::config::AgentConfig;
use crate::flush::FlushService;
use crate::remote::{ConfigSource, FetchOutcome, RemoteConfig, RemoteConfigGate};
use crate::session::SessionLifecycleManager;
use crate::types::now_ms;
use log::{debug, error, info, warn};

/// Called after a fetch returned a new document: `(config, applied)`.
pub type ConfigUpdateHook = Arc<dyn Fn(&RemoteConfig, bool) + Send + Sync>;

/// Configuration for the background schedulers.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Interval between flush rounds
    pub flush_interval: Duration,
    /// Interval between checks of the remote config fetch anchor
    pub remote_check_interval: Duration,
    /// Interval between session heartbeats
    pub heartbeat_interval: Duration,
    /// Whether the schedulers run at all
    pub enabled: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            flush_interval: Duration::from_secs(15),
            remote_check_interval: Duration::from_secs(10 * 60),
            heartbeat_interval: Duration::from_secs(30),
            enabled: true,
        }
    }
}

impl SchedulerConfig {
    pub fn from_agent_config(config: &AgentConfig) -> Self {
        Self {
            flush_interval: config.flush_interval(),
            heartbeat_interval: config.heartbeat_interval(),
            ..Default::default()
        }
    }
}

// ============================================================================
// Flush
// ============================================================================

/// Periodic and on-demand delivery of stored events.
pub struct FlushScheduler {
    flush: Arc<FlushService>,
    wake: Arc<Notify>,
    interval: Duration,
    /// Timestamp of the last round that delivered without error
    last_flush_at: Arc<RwLock<Option<u64>>>,
}

impl FlushScheduler {
    pub fn new(flush: Arc<FlushService>, wake: Arc<Notify>, interval: Duration) -> Self {
        Self {
            flush,
            wake,
            interval,
            last_flush_at: Arc::new(RwLock::new(None)),
        }
    }

    pub fn last_flush(&self) -> Option<u64> {
        *self.last_flush_at.read()
    }

    pub async fn start(self: Arc<Self>) {
        info!(
            "Starting flush scheduler with {}-second interval",
            self.interval.as_secs()
        );

        let mut ticker = interval(self.interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = self.wake.notified() => debug!("flush woken by bulk size"),
            }
            self.do_flush().await;
        }
    }

    async fn do_flush(&self) {
        let flush = self.flush.clone();
        match tokio::task::spawn_blocking(move || flush.flush_all()).await {
            Ok(Ok(sent)) => {
                if sent > 0 {
                    debug!("scheduled flush delivered {} events", sent);
                }
                *self.last_flush_at.write() = Some(now_ms());
            }
            Ok(Err(e)) => warn!("Scheduled flush failed, retrying next round: {}", e),
            Err(e) => error!("Flush task aborted: {}", e),
        }
    }
}

// ============================================================================
// Remote config
// ============================================================================

/// Polls the remote config source on the randomized schedule.
pub struct RemoteConfigScheduler {
    gate: Arc<RemoteConfigGate>,
    source: Arc<dyn ConfigSource>,
    check_interval: Duration,
    on_update: Option<ConfigUpdateHook>,
}

impl RemoteConfigScheduler {
    pub fn new(
        gate: Arc<RemoteConfigGate>,
        source: Arc<dyn ConfigSource>,
        check_interval: Duration,
    ) -> Self {
        Self {
            gate,
            source,
            check_interval,
            on_update: None,
        }
    }

    pub fn with_update_hook(mut self, hook: ConfigUpdateHook) -> Self {
        self.on_update = Some(hook);
        self
    }

    pub async fn start(self: Arc<Self>) {
        info!(
            "Starting remote config scheduler, checking every {} seconds",
            self.check_interval.as_secs()
        );

        let mut ticker = interval(self.check_interval);
        loop {
            ticker.tick().await;
            if self.gate.is_fetch_due(now_ms()) {
                self.do_fetch().await;
            }
        }
    }

    async fn do_fetch(&self) {
        let gate = self.gate.clone();
        let source = self.source.clone();
        let fetched =
            tokio::task::spawn_blocking(move || gate.fetch_once(source.as_ref(), now_ms())).await;

        match fetched {
            Ok(Ok(FetchOutcome::NotModified)) => debug!("remote config not modified"),
            Ok(Ok(FetchOutcome::Updated { config, applied })) => {
                info!("Fetched remote config version {:?}", config.version);
                if let Some(hook) = &self.on_update {
                    hook(&config, applied);
                }
            }
            Ok(Err(e)) => warn!("Remote config fetch failed, keeping current config: {}", e),
            Err(e) => error!("Remote config task aborted: {}", e),
        }
    }
}

// ============================================================================
// Session heartbeat
// ============================================================================

pub struct SessionHeartbeat {
    session: Arc<SessionLifecycleManager>,
    interval: Duration,
}

impl SessionHeartbeat {
    pub fn new(session: Arc<SessionLifecycleManager>, interval: Duration) -> Self {
        Self { session, interval }
    }

    pub async fn start(self: Arc<Self>) {
        if !self.session.is_enabled() {
            info!("Sessions are disabled, skipping heartbeat");
            return;
        }

        let mut ticker = interval(self.interval);
        loop {
            ticker.tick().await;
            let session = self.session.clone();
            if let Err(e) =
                tokio::task::spawn_blocking(move || session.refresh_by_timer(now_ms())).await
            {
                error!("Session heartbeat aborted: {}", e);
            }
        }
    }
}
