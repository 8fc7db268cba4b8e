use std::time::{Duration, Instant};

use schema::TelemetryEvent;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::queue::TelemetryQueue;

pub const SYNC_INTERVAL: Duration = Duration::from_secs(10);
/// Failsafe: forces a submission even when nothing new accumulated, so the
/// server can tell "connected but not answering" from "disconnected".
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryBatch {
    pub attempt_id: String,
    pub events: Vec<TelemetryEvent>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    Accepted,
    /// Not a hard failure: the server dictates when the next submission may
    /// happen.
    RateLimited { retry_after_ms: u64 },
    Failed(String),
}

/// Seam between the scheduler and the wire. The sim tool submits over HTTP;
/// tests script outcomes.
pub trait SyncTransport {
    fn submit(&mut self, batch: &TelemetryBatch) -> SyncOutcome;
}

/// Drives queue flushing for one attempt. Single-threaded cooperative: the
/// caller ticks it from its own timer loop; at most one sync is outstanding
/// at a time, and the queue is only truncated after the server acknowledges.
pub struct SyncScheduler<T: SyncTransport> {
    attempt_id: String,
    queue: TelemetryQueue,
    transport: T,
    in_flight: bool,
    pending_ack: usize,
    last_sync_at: Instant,
    last_heartbeat_at: Instant,
    retry_at: Option<Instant>,
    sync_interval: Duration,
    heartbeat_interval: Duration,
}

impl<T: SyncTransport> SyncScheduler<T> {
    pub fn new(attempt_id: &str, queue: TelemetryQueue, transport: T) -> Self {
        Self::with_intervals(attempt_id, queue, transport, SYNC_INTERVAL, HEARTBEAT_INTERVAL)
    }

    pub fn with_intervals(
        attempt_id: &str,
        queue: TelemetryQueue,
        transport: T,
        sync_interval: Duration,
        heartbeat_interval: Duration,
    ) -> Self {
        let now = Instant::now();
        Self {
            attempt_id: attempt_id.to_string(),
            queue,
            transport,
            in_flight: false,
            pending_ack: 0,
            last_sync_at: now,
            last_heartbeat_at: now,
            retry_at: None,
            sync_interval,
            heartbeat_interval,
        }
    }

    pub fn queue_mut(&mut self) -> &mut TelemetryQueue {
        &mut self.queue
    }

    pub fn queue(&self) -> &TelemetryQueue {
        &self.queue
    }

    pub fn retry_pending(&self) -> bool {
        self.retry_at.is_some()
    }

    /// Periodic driver. Trigger precedence: a server-dictated retry window
    /// gates everything (never retry sooner, one coalesced timer); then the
    /// heartbeat failsafe; then the regular interval.
    pub fn tick(&mut self, now: Instant) {
        if self.in_flight {
            return;
        }
        if let Some(retry_at) = self.retry_at {
            if now < retry_at {
                return;
            }
            // The coalesced retry fires once; a fresh rate limit re-arms it.
            self.retry_at = None;
            self.run_sync(now, false);
            return;
        }
        if now.duration_since(self.last_heartbeat_at) >= self.heartbeat_interval {
            self.run_sync(now, true);
            return;
        }
        if now.duration_since(self.last_sync_at) >= self.sync_interval {
            self.run_sync(now, false);
        }
    }

    /// Explicit flush; no-op when the queue is empty or a sync is in flight.
    pub fn sync(&mut self, now: Instant) {
        self.run_sync(now, false);
    }

    /// Best-effort flush on page/tab teardown.
    pub fn flush_on_teardown(&mut self, now: Instant) {
        self.run_sync(now, true);
    }

    /// Snapshot the queue and mark a sync in flight. Returns `None` when
    /// there is nothing to do: already in flight, inside a retry window, or
    /// an unforced call with an empty queue.
    pub fn begin_sync(&mut self, now: Instant, force: bool) -> Option<TelemetryBatch> {
        if self.in_flight {
            return None;
        }
        if let Some(retry_at) = self.retry_at
            && now < retry_at
        {
            return None;
        }
        if !force && self.queue.is_empty() {
            return None;
        }
        self.in_flight = true;
        self.pending_ack = self.queue.len();
        Some(TelemetryBatch {
            attempt_id: self.attempt_id.clone(),
            events: self.queue.peek_all().to_vec(),
        })
    }

    /// Settle an in-flight sync. Success removes exactly the snapshotted
    /// events; a rate limit schedules one coalesced retry; any other failure
    /// leaves the queue intact for the next trigger.
    pub fn complete_sync(&mut self, outcome: SyncOutcome, now: Instant) {
        if !self.in_flight {
            return;
        }
        self.in_flight = false;
        self.last_sync_at = now;
        self.last_heartbeat_at = now;
        match outcome {
            SyncOutcome::Accepted => {
                self.queue.ack(self.pending_ack);
                self.retry_at = None;
            }
            SyncOutcome::RateLimited { retry_after_ms } => {
                info!(
                    attempt_id = %self.attempt_id,
                    retry_after_ms, "telemetry sync rate limited"
                );
                self.retry_at = Some(now + Duration::from_millis(retry_after_ms));
            }
            SyncOutcome::Failed(reason) => {
                warn!(
                    attempt_id = %self.attempt_id,
                    %reason, "telemetry sync failed; batch kept for retry"
                );
            }
        }
        self.pending_ack = 0;
    }

    fn run_sync(&mut self, now: Instant, force: bool) {
        let Some(batch) = self.begin_sync(now, force) else {
            return;
        };
        let outcome = self.transport.submit(&batch);
        self.complete_sync(outcome, now);
    }
}
