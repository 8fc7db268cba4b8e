use std::time::Instant;

use auth::SessionPolicy;
use evaluation::{EvaluationError, FinalizeOutcome, finalize_attempt};
use schema::{
    CompetencyEdge, CompetencyNode, DeviceClass, DiagnosticExam, ExamAttempt, TelemetryEvent,
    unix_timestamp_millis,
};
use store::{CheckpointPolicy, FileWal, InMemoryStore, StoreError, TelemetryFoldStats};
use tracing::error;
use uuid::Uuid;

use crate::{
    config,
    rate_limit::{FixedWindowLimiter, RateLimitPolicy},
};

/// Per-process ingestion state: the store, optional WAL, rate limiters, and
/// metric counters. One instance per process, shared behind a mutex; all
/// cross-request state lives here or in the store.
pub struct IngestionRuntime {
    store: InMemoryStore,
    wal: Option<FileWal>,
    checkpoint_policy: CheckpointPolicy,
    session_policy: SessionPolicy,
    audit_log_path: Option<String>,
    batch_limiter: FixedWindowLimiter,
    finalize_limiter: FixedWindowLimiter,
    batch_max_events: usize,
    batches_accepted: u64,
    batches_rejected: u64,
    events_appended: u64,
    attempts_created: u64,
    finalizations_total: u64,
    rate_limited_total: u64,
    auth_failure_total: u64,
    authz_denied_total: u64,
    audit_events_total: u64,
    audit_write_error_total: u64,
    started_at: Instant,
}

impl IngestionRuntime {
    pub fn in_memory(store: InMemoryStore, session_policy: SessionPolicy) -> Self {
        Self::build(store, None, CheckpointPolicy::default(), session_policy)
    }

    pub fn persistent(
        store: InMemoryStore,
        wal: FileWal,
        checkpoint_policy: CheckpointPolicy,
        session_policy: SessionPolicy,
    ) -> Self {
        Self::build(store, Some(wal), checkpoint_policy, session_policy)
    }

    fn build(
        store: InMemoryStore,
        wal: Option<FileWal>,
        checkpoint_policy: CheckpointPolicy,
        session_policy: SessionPolicy,
    ) -> Self {
        Self {
            store,
            wal,
            checkpoint_policy,
            session_policy,
            audit_log_path: None,
            batch_limiter: FixedWindowLimiter::new(config::resolve_batch_rate_policy()),
            finalize_limiter: FixedWindowLimiter::new(config::resolve_finalize_rate_policy()),
            batch_max_events: config::resolve_batch_max_events(),
            batches_accepted: 0,
            batches_rejected: 0,
            events_appended: 0,
            attempts_created: 0,
            finalizations_total: 0,
            rate_limited_total: 0,
            auth_failure_total: 0,
            authz_denied_total: 0,
            audit_events_total: 0,
            audit_write_error_total: 0,
            started_at: Instant::now(),
        }
    }

    pub fn with_audit_log_path(mut self, path: Option<String>) -> Self {
        self.audit_log_path = path;
        self
    }

    pub fn with_rate_policies(mut self, batch: RateLimitPolicy, finalize: RateLimitPolicy) -> Self {
        self.batch_limiter = FixedWindowLimiter::new(batch);
        self.finalize_limiter = FixedWindowLimiter::new(finalize);
        self
    }

    pub fn with_batch_max_events(mut self, batch_max_events: usize) -> Self {
        self.batch_max_events = batch_max_events.max(1);
        self
    }

    pub fn store(&self) -> &InMemoryStore {
        &self.store
    }

    pub fn session_policy(&self) -> &SessionPolicy {
        &self.session_policy
    }

    pub fn audit_log_path(&self) -> Option<&str> {
        self.audit_log_path.as_deref()
    }

    pub fn batch_max_events(&self) -> usize {
        self.batch_max_events
    }

    // -- content seeding ----------------------------------------------------

    pub fn seed_exam(&mut self, exam: DiagnosticExam) -> Result<(), StoreError> {
        match self.wal.as_mut() {
            Some(wal) => self.store.upsert_exam_persistent(wal, exam),
            None => self.store.upsert_exam(exam),
        }
    }

    pub fn seed_node(&mut self, node: CompetencyNode) -> Result<(), StoreError> {
        match self.wal.as_mut() {
            Some(wal) => self.store.upsert_node_persistent(wal, node),
            None => self.store.upsert_node(node),
        }
    }

    pub fn seed_edge(&mut self, edge: CompetencyEdge) -> Result<(), StoreError> {
        match self.wal.as_mut() {
            Some(wal) => self.store.upsert_edge_persistent(wal, edge),
            None => self.store.upsert_edge(edge),
        }
    }

    // -- operations ---------------------------------------------------------

    pub fn create_attempt(
        &mut self,
        exam_id: &str,
        owner_id: &str,
    ) -> Result<ExamAttempt, StoreError> {
        let attempt_id = Uuid::new_v4().to_string();
        let now_ms = unix_timestamp_millis();
        let attempt = match self.wal.as_mut() {
            Some(wal) => self
                .store
                .create_attempt_persistent(wal, &attempt_id, exam_id, owner_id, now_ms)?,
            None => self
                .store
                .create_attempt(&attempt_id, exam_id, owner_id, now_ms)?
                .clone(),
        };
        self.attempts_created += 1;
        self.checkpoint_if_due();
        Ok(attempt)
    }

    pub fn submit_batch(
        &mut self,
        attempt_id: &str,
        events: &[TelemetryEvent],
        device_class: Option<DeviceClass>,
    ) -> Result<TelemetryFoldStats, StoreError> {
        let now_ms = unix_timestamp_millis();
        let stats = match self.wal.as_mut() {
            Some(wal) => self.store.append_telemetry_persistent(
                wal,
                attempt_id,
                events,
                now_ms,
                device_class,
            ),
            None => self
                .store
                .append_telemetry(attempt_id, events, now_ms, device_class),
        }?;
        self.batches_accepted += 1;
        self.events_appended += stats.appended as u64;
        self.checkpoint_if_due();
        Ok(stats)
    }

    pub fn finalize(&mut self, attempt_id: &str) -> Result<FinalizeOutcome, EvaluationError> {
        let now_ms = unix_timestamp_millis();
        let outcome = finalize_attempt(&mut self.store, self.wal.as_mut(), attempt_id, now_ms)?;
        self.finalizations_total += 1;
        self.checkpoint_if_due();
        Ok(outcome)
    }

    pub fn attempt_owner(&self, attempt_id: &str) -> Option<String> {
        self.store
            .attempt_by_id(attempt_id)
            .map(|attempt| attempt.owner_id.clone())
    }

    fn checkpoint_if_due(&mut self) {
        if let Some(wal) = self.wal.as_mut()
            && let Err(err) = wal.checkpoint_if_due(&self.store, &self.checkpoint_policy)
        {
            error!(%err, "wal checkpoint failed");
        }
    }

    // -- gates and counters -------------------------------------------------

    pub fn check_batch_rate(&mut self, key: &str, now: Instant) -> Result<(), u64> {
        let decision = self.batch_limiter.check(key, now);
        if decision.is_err() {
            self.rate_limited_total += 1;
        }
        decision
    }

    pub fn check_finalize_rate(&mut self, key: &str, now: Instant) -> Result<(), u64> {
        let decision = self.finalize_limiter.check(key, now);
        if decision.is_err() {
            self.rate_limited_total += 1;
        }
        decision
    }

    pub fn observe_batch_rejected(&mut self) {
        self.batches_rejected += 1;
    }

    pub fn observe_auth_failure(&mut self) {
        self.auth_failure_total += 1;
    }

    pub fn observe_authz_denied(&mut self) {
        self.authz_denied_total += 1;
    }

    pub fn observe_audit_event(&mut self, write_ok: bool) {
        self.audit_events_total += 1;
        if !write_ok {
            self.audit_write_error_total += 1;
        }
    }

    pub fn metrics_text(&self) -> String {
        format!(
            "# TYPE atlas_telemetry_batches_accepted_total counter\n\
atlas_telemetry_batches_accepted_total {}\n\
# TYPE atlas_telemetry_batches_rejected_total counter\n\
atlas_telemetry_batches_rejected_total {}\n\
# TYPE atlas_telemetry_events_appended_total counter\n\
atlas_telemetry_events_appended_total {}\n\
# TYPE atlas_telemetry_attempts_created_total counter\n\
atlas_telemetry_attempts_created_total {}\n\
# TYPE atlas_telemetry_finalizations_total counter\n\
atlas_telemetry_finalizations_total {}\n\
# TYPE atlas_telemetry_rate_limited_total counter\n\
atlas_telemetry_rate_limited_total {}\n\
# TYPE atlas_telemetry_auth_failure_total counter\n\
atlas_telemetry_auth_failure_total {}\n\
# TYPE atlas_telemetry_authz_denied_total counter\n\
atlas_telemetry_authz_denied_total {}\n\
# TYPE atlas_telemetry_audit_events_total counter\n\
atlas_telemetry_audit_events_total {}\n\
# TYPE atlas_telemetry_audit_write_error_total counter\n\
atlas_telemetry_audit_write_error_total {}\n\
# TYPE atlas_telemetry_attempts_total gauge\n\
atlas_telemetry_attempts_total {}\n\
# TYPE atlas_telemetry_uptime_seconds gauge\n\
atlas_telemetry_uptime_seconds {:.4}\n",
            self.batches_accepted,
            self.batches_rejected,
            self.events_appended,
            self.attempts_created,
            self.finalizations_total,
            self.rate_limited_total,
            self.auth_failure_total,
            self.authz_denied_total,
            self.audit_events_total,
            self.audit_write_error_total,
            self.store.attempts_len(),
            self.started_at.elapsed().as_secs_f64()
        )
    }
}
