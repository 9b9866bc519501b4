//! Repeater scheduler: independently paced jobs that re-transmit and mutate
//! an intention until stopped.
//!
//! Each repeater is owned by one tokio task. A cycle mutates the entry under
//! the map lock, releases it, delivers the resulting message and then sleeps
//! `1 / rate` before the next cycle, so cycles of one repeater never overlap.
//! `stop` flips the entry inactive and cancels the task; the entry stays
//! visible to [`RepeaterScheduler::stats`] for the grace window and is then
//! purged.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::Utc;
use intentcast_protocol::constants::{MAX_MULTIPLIER, REPEATER_GRACE_WINDOW};
use intentcast_protocol::{IntentionPacket, Message, MessageType, PacketError, RepeaterFlags};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::dispatcher::Dispatcher;

/// Shortest allowed pause between two cycles of one repeater.
pub const MIN_CYCLE_DELAY: Duration = Duration::from_millis(1);

/// Identifier of a repeater, unique for the lifetime of the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BroadcastId(pub u64);

impl fmt::Display for BroadcastId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Options accepted by [`RepeaterScheduler::start`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RepeaterOptions {
    /// Replace the intention with its SHA-256 hex digest every cycle.
    pub use_hashing: bool,
    /// Repeat the intention `multiplier` times (capped at 100).
    pub use_multiplier: bool,
    pub multiplier: u32,
    /// Recorded in the packet; no transform is applied.
    pub use_compression: bool,
    /// Cycles per second. Must be positive.
    pub repetition_rate_hz: f64,
}

impl Default for RepeaterOptions {
    fn default() -> Self {
        Self {
            use_hashing: false,
            use_multiplier: false,
            multiplier: 1,
            use_compression: false,
            repetition_rate_hz: 1.0,
        }
    }
}

impl RepeaterOptions {
    /// The subset of options embedded in repeater packets.
    pub fn flags(&self) -> RepeaterFlags {
        RepeaterFlags {
            use_hashing: self.use_hashing,
            use_multiplier: self.use_multiplier,
            multiplier: self.multiplier,
            use_compression: self.use_compression,
        }
    }

    /// Delay between cycles, or `InvalidOptions` for a rate that is not
    /// positive or whose delay falls outside `[MIN_CYCLE_DELAY, Duration::MAX]`.
    pub fn cycle_delay(&self) -> Result<Duration, RepeaterError> {
        let rate = self.repetition_rate_hz;
        if !rate.is_finite() || rate <= 0.0 {
            return Err(RepeaterError::InvalidOptions(format!(
                "repetition rate must be a positive number of Hz, got {rate}"
            )));
        }
        match Duration::try_from_secs_f64(1.0 / rate) {
            Ok(delay) if delay >= MIN_CYCLE_DELAY => Ok(delay),
            _ => Err(RepeaterError::InvalidOptions(format!(
                "repetition rate {rate} Hz is out of range"
            ))),
        }
    }

    /// Number of repetitions actually applied by the multiplier.
    pub fn effective_multiplier(&self) -> usize {
        self.multiplier.clamp(1, MAX_MULTIPLIER) as usize
    }
}

/// Errors produced by the repeater scheduler.
#[derive(Debug, thiserror::Error)]
pub enum RepeaterError {
    #[error("invalid repeater options: {0}")]
    InvalidOptions(String),

    #[error("repeater {0} not found")]
    NotFound(BroadcastId),

    #[error("packet error: {0}")]
    Packet(#[from] PacketError),

    #[error("repeater scheduler is shut down")]
    ShutDown,
}

/// Lifecycle of a repeater.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RepeaterState {
    /// Registered, first cycle not yet run.
    Created,
    Running,
    /// Stopped, still inside the grace window.
    Stopping,
    /// Purged.
    Terminated,
}

/// Scheduler settings.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// How long stopped repeaters remain visible in statistics.
    pub grace_window: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            grace_window: REPEATER_GRACE_WINDOW,
        }
    }
}

/// Statistics for one tracked repeater.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BroadcastStats {
    pub id: BroadcastId,
    pub intention: String,
    pub iterations: u64,
    pub runtime_ms: u64,
    pub repetition_rate_hz: f64,
    pub active: bool,
}

/// Snapshot over every tracked repeater, active or in its grace window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RepeaterStats {
    pub active_count: usize,
    pub total_iterations: u64,
    pub broadcasts: Vec<BroadcastStats>,
}

/// Full view of one repeater, including its current packet.
#[derive(Debug, Clone)]
pub struct BroadcastDetail {
    pub stats: BroadcastStats,
    pub state: RepeaterState,
    pub current_intention: String,
    pub frequency: f64,
    pub field_type: String,
    pub options: RepeaterOptions,
    /// Time since the last completed cycle.
    pub since_last_update: Duration,
    pub packet: IntentionPacket,
    pub packet_data: String,
}

struct ActiveBroadcast {
    id: BroadcastId,
    original_intention: String,
    /// Output of the hashing chain; equals the original without hashing.
    current_intention: String,
    frequency: f64,
    field_type: String,
    packet: IntentionPacket,
    packet_data: String,
    iterations: u64,
    started_at: Instant,
    last_update: Instant,
    stopped_at: Option<Instant>,
    options: RepeaterOptions,
    delay: Duration,
    active: bool,
    state: RepeaterState,
    cancel: CancellationToken,
}

impl ActiveBroadcast {
    /// Runs one cycle's mutation and returns the message to deliver.
    fn advance(&mut self) -> Result<Message, RepeaterError> {
        let current = if self.options.use_hashing {
            hex::encode(Sha256::digest(self.current_intention.as_bytes()))
        } else {
            self.current_intention.clone()
        };
        let transformed = if self.options.use_multiplier {
            current.repeat(self.options.effective_multiplier())
        } else {
            current.clone()
        };

        let iteration = self.iterations + 1;
        let packet = self.packet.next_cycle(transformed, iteration)?;
        let packet_data = packet.transport_encode()?;

        self.current_intention = current;
        self.iterations = iteration;
        self.packet = packet;
        self.packet_data = packet_data;
        self.last_update = Instant::now();
        self.state = RepeaterState::Running;

        Ok(Message {
            id: None,
            msg_type: MessageType::Repeater,
            data: serde_json::json!({
                "id": self.id,
                "intention": self.original_intention,
                "currentIntention": self.current_intention,
                "frequency": self.frequency,
                "fieldType": self.field_type,
                "iterations": self.iterations,
                "repetitionRateHz": self.options.repetition_rate_hz,
            }),
            timestamp: Utc::now(),
            packet_data: Some(self.packet_data.clone()),
        })
    }

    fn stats(&self, now: Instant) -> BroadcastStats {
        let end = self.stopped_at.unwrap_or(now);
        BroadcastStats {
            id: self.id,
            intention: self.original_intention.clone(),
            iterations: self.iterations,
            runtime_ms: end.duration_since(self.started_at).as_millis() as u64,
            repetition_rate_hz: self.options.repetition_rate_hz,
            active: self.active,
        }
    }
}

struct SchedulerInner {
    broadcasts: Mutex<HashMap<BroadcastId, ActiveBroadcast>>,
    next_id: AtomicU64,
    dispatcher: Arc<Dispatcher>,
    grace_window: Duration,
    cancel: CancellationToken,
}

impl SchedulerInner {
    /// One cycle for `id`. Returns the delay before the next cycle, or
    /// `None` when the repeater is gone or inactive.
    async fn cycle(&self, id: BroadcastId) -> Option<Duration> {
        let (message, delay) = {
            let mut broadcasts = self.broadcasts.lock().await;
            let entry = broadcasts.get_mut(&id)?;
            if !entry.active {
                return None;
            }
            match entry.advance() {
                Ok(message) => (message, entry.delay),
                Err(e) => {
                    tracing::warn!(%id, error = %e, "repeater cycle failed, retrying next tick");
                    return Some(entry.delay);
                }
            }
        };

        self.dispatcher.dispatch(message);
        Some(delay)
    }
}

/// Owns every running repeater.
pub struct RepeaterScheduler {
    inner: Arc<SchedulerInner>,
}

impl RepeaterScheduler {
    pub fn new(config: SchedulerConfig, dispatcher: Arc<Dispatcher>) -> Self {
        Self {
            inner: Arc::new(SchedulerInner {
                broadcasts: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                dispatcher,
                grace_window: config.grace_window,
                cancel: CancellationToken::new(),
            }),
        }
    }

    /// Validates the request, registers the repeater and schedules its
    /// first cycle immediately.
    pub async fn start(
        &self,
        intention: &str,
        frequency: f64,
        field_type: &str,
        options: RepeaterOptions,
    ) -> Result<BroadcastId, RepeaterError> {
        if self.inner.cancel.is_cancelled() {
            return Err(RepeaterError::ShutDown);
        }
        let delay = options.cycle_delay()?;
        if intention.trim().is_empty() {
            return Err(RepeaterError::InvalidOptions("intention is required".into()));
        }
        if !frequency.is_finite() || frequency <= 0.0 {
            return Err(RepeaterError::InvalidOptions(format!(
                "frequency must be a positive number, got {frequency}"
            )));
        }

        let packet =
            IntentionPacket::encode_repeater(intention, frequency, field_type, options.flags())?;
        let packet_data = packet.transport_encode()?;

        let id = BroadcastId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        let cancel = self.inner.cancel.child_token();
        let now = Instant::now();

        self.inner.broadcasts.lock().await.insert(
            id,
            ActiveBroadcast {
                id,
                original_intention: intention.to_string(),
                current_intention: intention.to_string(),
                frequency,
                field_type: field_type.to_string(),
                packet,
                packet_data,
                iterations: 0,
                started_at: now,
                last_update: now,
                stopped_at: None,
                options,
                delay,
                active: true,
                state: RepeaterState::Created,
                cancel: cancel.clone(),
            },
        );

        tokio::spawn(run_repeater(Arc::clone(&self.inner), id, cancel));

        tracing::info!(
            %id,
            rate_hz = options.repetition_rate_hz,
            hashing = options.use_hashing,
            multiplier = options.use_multiplier.then_some(options.multiplier),
            "repeater started"
        );
        Ok(id)
    }

    /// Stops a repeater. A cycle already in flight may still complete once.
    ///
    /// The entry stays in [`stats`](Self::stats) for the grace window.
    pub async fn stop(&self, id: BroadcastId) -> Result<(), RepeaterError> {
        let iterations = {
            let mut broadcasts = self.inner.broadcasts.lock().await;
            let entry = broadcasts.get_mut(&id).ok_or(RepeaterError::NotFound(id))?;
            if !entry.active {
                return Ok(());
            }
            entry.active = false;
            entry.state = RepeaterState::Stopping;
            entry.stopped_at = Some(Instant::now());
            entry.cancel.cancel();
            entry.iterations
        };

        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            tokio::time::sleep(inner.grace_window).await;
            if inner.broadcasts.lock().await.remove(&id).is_some() {
                tracing::debug!(%id, "stopped repeater purged");
            }
        });

        tracing::info!(%id, iterations, "repeater stopped");
        Ok(())
    }

    /// Read-only snapshot over all tracked repeaters, ordered by id.
    pub async fn stats(&self) -> RepeaterStats {
        let broadcasts = self.inner.broadcasts.lock().await;
        let now = Instant::now();

        let mut list: Vec<BroadcastStats> = broadcasts.values().map(|b| b.stats(now)).collect();
        list.sort_by_key(|b| b.id);

        RepeaterStats {
            active_count: list.iter().filter(|b| b.active).count(),
            total_iterations: list.iter().map(|b| b.iterations).sum(),
            broadcasts: list,
        }
    }

    /// Full view of one tracked repeater.
    pub async fn detail(&self, id: BroadcastId) -> Option<BroadcastDetail> {
        let broadcasts = self.inner.broadcasts.lock().await;
        let entry = broadcasts.get(&id)?;
        let now = Instant::now();
        Some(BroadcastDetail {
            stats: entry.stats(now),
            state: entry.state,
            current_intention: entry.current_intention.clone(),
            frequency: entry.frequency,
            field_type: entry.field_type.clone(),
            options: entry.options,
            since_last_update: now.duration_since(entry.last_update),
            packet: entry.packet.clone(),
            packet_data: entry.packet_data.clone(),
        })
    }

    /// Lifecycle state of `id`; `None` if it was never issued.
    pub async fn state(&self, id: BroadcastId) -> Option<RepeaterState> {
        if let Some(entry) = self.inner.broadcasts.lock().await.get(&id) {
            return Some(entry.state);
        }
        let issued = id.0 >= 1 && id.0 < self.inner.next_id.load(Ordering::Relaxed);
        issued.then_some(RepeaterState::Terminated)
    }

    /// Cancels every repeater worker and marks every entry stopped.
    ///
    /// Entries stay visible to [`stats`](Self::stats) with their final
    /// counts; later calls to [`start`](Self::start) fail.
    pub async fn shutdown(&self) {
        self.inner.cancel.cancel();

        let mut broadcasts = self.inner.broadcasts.lock().await;
        let now = Instant::now();
        let mut stopped = 0usize;
        for entry in broadcasts.values_mut().filter(|b| b.active) {
            entry.active = false;
            entry.state = RepeaterState::Stopping;
            entry.stopped_at = Some(now);
            stopped += 1;
        }
        tracing::info!(stopped, "repeater scheduler shut down");
    }
}

impl Drop for RepeaterScheduler {
    fn drop(&mut self) {
        self.inner.cancel.cancel();
    }
}

/// Worker loop owning one repeater.
async fn run_repeater(inner: Arc<SchedulerInner>, id: BroadcastId, cancel: CancellationToken) {
    let mut delay = Duration::ZERO;
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
        }
        match inner.cycle(id).await {
            Some(next) => delay = next,
            None => break,
        }
    }
    tracing::debug!(%id, "repeater worker exited");
}
