use std::{
    collections::BTreeMap,
    fs::{File, OpenOptions, create_dir_all, rename},
    io::{BufRead, BufReader, Write},
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use schema::{
    AttemptMetadata, AttemptStatus, CompetencyEdge, CompetencyNode, DeviceClass, DiagnosticExam,
    DiagnosticResult, ExamAttempt, StudentProgress, TelemetryEvent, ValidationError,
    validate_edge, validate_event, validate_exam, validate_node,
};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum StoreError {
    #[error("validation error: {0}")]
    Validation(#[from] ValidationError),
    #[error("unknown exam: {0}")]
    UnknownExam(String),
    #[error("unknown attempt: {0}")]
    UnknownAttempt(String),
    #[error("attempt already completed: {0}")]
    AttemptCompleted(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("io error: {0}")]
    Io(String),
    #[error("parse error: {0}")]
    Parse(String),
}

impl From<std::io::Error> for StoreError {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(value: serde_json::Error) -> Self {
        Self::Parse(value.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TelemetryFoldStats {
    pub appended: usize,
    pub answers_folded: usize,
}

/// Fold ANSWER_UPDATE events in arrival order, keeping the last value per
/// question. Replaying a full ledger through this function must reproduce the
/// attempt's `current_state` exactly.
pub fn fold_answer_events<'a>(
    events: impl IntoIterator<Item = &'a TelemetryEvent>,
) -> BTreeMap<String, Value> {
    let mut folded = BTreeMap::new();
    for event in events {
        if let TelemetryEvent::AnswerUpdate(payload) = event {
            folded.insert(payload.question_id.clone(), payload.value.clone());
        }
    }
    folded
}

// ---------------------------------------------------------------------------
// In-memory store — the relational-store stand-in
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InMemoryStore {
    exams: BTreeMap<String, DiagnosticExam>,
    nodes: Vec<CompetencyNode>,
    edges: Vec<CompetencyEdge>,
    attempts: BTreeMap<String, ExamAttempt>,
    /// Forensic ledger per attempt: ordered, append-only, never rewritten.
    ledgers: BTreeMap<String, Vec<TelemetryEvent>>,
    progress: Vec<StudentProgress>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    // -- content records ----------------------------------------------------

    pub fn upsert_exam(&mut self, exam: DiagnosticExam) -> Result<(), StoreError> {
        validate_exam(&exam)?;
        self.exams.insert(exam.exam_id.clone(), exam);
        Ok(())
    }

    pub fn exam_by_id(&self, exam_id: &str) -> Option<&DiagnosticExam> {
        self.exams.get(exam_id)
    }

    pub fn exams_len(&self) -> usize {
        self.exams.len()
    }

    pub fn upsert_node(&mut self, node: CompetencyNode) -> Result<(), StoreError> {
        validate_node(&node)?;
        match self.nodes.iter_mut().find(|existing| existing.id == node.id) {
            Some(existing) => *existing = node,
            None => self.nodes.push(node),
        }
        Ok(())
    }

    pub fn upsert_edge(&mut self, edge: CompetencyEdge) -> Result<(), StoreError> {
        validate_edge(&edge)?;
        if !self.edges.contains(&edge) {
            self.edges.push(edge);
        }
        Ok(())
    }

    pub fn competency_nodes(&self) -> &[CompetencyNode] {
        &self.nodes
    }

    pub fn competency_edges(&self) -> &[CompetencyEdge] {
        &self.edges
    }

    // -- attempts -----------------------------------------------------------

    pub fn create_attempt(
        &mut self,
        attempt_id: &str,
        exam_id: &str,
        owner_id: &str,
        now_ms: u64,
    ) -> Result<&ExamAttempt, StoreError> {
        if attempt_id.trim().is_empty() {
            return Err(StoreError::Validation(ValidationError::MissingField(
                "attempt_id",
            )));
        }
        if owner_id.trim().is_empty() {
            return Err(StoreError::Validation(ValidationError::MissingField(
                "owner_id",
            )));
        }
        if !self.exams.contains_key(exam_id) {
            return Err(StoreError::UnknownExam(exam_id.to_string()));
        }
        if self.attempts.contains_key(attempt_id) {
            return Err(StoreError::Conflict(format!(
                "attempt '{attempt_id}' already exists"
            )));
        }
        let attempt = ExamAttempt {
            attempt_id: attempt_id.to_string(),
            exam_id: exam_id.to_string(),
            owner_id: owner_id.to_string(),
            status: AttemptStatus::InProgress,
            current_state: BTreeMap::new(),
            metadata: AttemptMetadata {
                started_at_ms: now_ms,
                last_seen_at_ms: now_ms,
                finished_at_ms: None,
                device_class: None,
            },
            results_cache: None,
        };
        Ok(self
            .attempts
            .entry(attempt_id.to_string())
            .or_insert(attempt))
    }

    pub fn attempt_by_id(&self, attempt_id: &str) -> Option<&ExamAttempt> {
        self.attempts.get(attempt_id)
    }

    pub fn attempts_len(&self) -> usize {
        self.attempts.len()
    }

    pub fn attempts(&self) -> impl Iterator<Item = &ExamAttempt> {
        self.attempts.values()
    }

    /// Double-write, atomic per batch: every event lands in the forensic
    /// ledger and the ANSWER_UPDATE subset folds into `current_state`
    /// (last-write-wins per question, within-batch order preserved). The
    /// liveness timestamp refreshes even for an empty heartbeat batch, and a
    /// changed device class is recorded.
    pub fn append_telemetry(
        &mut self,
        attempt_id: &str,
        events: &[TelemetryEvent],
        now_ms: u64,
        device_class: Option<DeviceClass>,
    ) -> Result<TelemetryFoldStats, StoreError> {
        let attempt = self
            .attempts
            .get_mut(attempt_id)
            .ok_or_else(|| StoreError::UnknownAttempt(attempt_id.to_string()))?;
        if attempt.status == AttemptStatus::Completed {
            return Err(StoreError::AttemptCompleted(attempt_id.to_string()));
        }
        // Validate the whole batch before any side effect.
        for event in events {
            validate_event(event)?;
        }

        let ledger = self.ledgers.entry(attempt_id.to_string()).or_default();
        ledger.extend(events.iter().cloned());

        let mut answers_folded = 0;
        for event in events {
            if let TelemetryEvent::AnswerUpdate(payload) = event {
                attempt
                    .current_state
                    .insert(payload.question_id.clone(), payload.value.clone());
                answers_folded += 1;
            }
        }

        attempt.metadata.last_seen_at_ms = now_ms;
        if let Some(device_class) = device_class
            && attempt.metadata.device_class != Some(device_class)
        {
            attempt.metadata.device_class = Some(device_class);
        }

        Ok(TelemetryFoldStats {
            appended: events.len(),
            answers_folded,
        })
    }

    pub fn exam_state(&self, attempt_id: &str) -> Option<&BTreeMap<String, Value>> {
        self.attempts
            .get(attempt_id)
            .map(|attempt| &attempt.current_state)
    }

    pub fn telemetry_log(&self, attempt_id: &str) -> Result<&[TelemetryEvent], StoreError> {
        if !self.attempts.contains_key(attempt_id) {
            return Err(StoreError::UnknownAttempt(attempt_id.to_string()));
        }
        Ok(self
            .ledgers
            .get(attempt_id)
            .map(Vec::as_slice)
            .unwrap_or_default())
    }

    /// The finalization linearization point: flips the status exactly once.
    pub fn complete_attempt(&mut self, attempt_id: &str, now_ms: u64) -> Result<(), StoreError> {
        let attempt = self
            .attempts
            .get_mut(attempt_id)
            .ok_or_else(|| StoreError::UnknownAttempt(attempt_id.to_string()))?;
        if attempt.status == AttemptStatus::Completed {
            return Err(StoreError::AttemptCompleted(attempt_id.to_string()));
        }
        attempt.status = AttemptStatus::Completed;
        attempt.metadata.finished_at_ms = Some(now_ms);
        Ok(())
    }

    /// Rollback path for a finalization whose scoring failed after the status
    /// flip; a retried request then scores cleanly.
    pub fn reopen_attempt(&mut self, attempt_id: &str) -> Result<(), StoreError> {
        let attempt = self
            .attempts
            .get_mut(attempt_id)
            .ok_or_else(|| StoreError::UnknownAttempt(attempt_id.to_string()))?;
        attempt.status = AttemptStatus::InProgress;
        attempt.metadata.finished_at_ms = None;
        Ok(())
    }

    /// Attaches the immutable results cache. A second attach is a conflict:
    /// the cache is written exactly once per attempt.
    pub fn attach_results(
        &mut self,
        attempt_id: &str,
        result: DiagnosticResult,
    ) -> Result<(), StoreError> {
        let attempt = self
            .attempts
            .get_mut(attempt_id)
            .ok_or_else(|| StoreError::UnknownAttempt(attempt_id.to_string()))?;
        if attempt.results_cache.is_some() {
            return Err(StoreError::Conflict(format!(
                "results already attached to attempt '{attempt_id}'"
            )));
        }
        attempt.results_cache = Some(result);
        Ok(())
    }

    // -- progress -----------------------------------------------------------

    pub fn upsert_progress(&mut self, row: StudentProgress) -> Result<(), StoreError> {
        if row.student_id.trim().is_empty() {
            return Err(StoreError::Validation(ValidationError::MissingField(
                "student_id",
            )));
        }
        if row.competency_id.trim().is_empty() {
            return Err(StoreError::Validation(ValidationError::MissingField(
                "competency_id",
            )));
        }
        match self.progress.iter_mut().find(|existing| {
            existing.student_id == row.student_id && existing.competency_id == row.competency_id
        }) {
            Some(existing) => *existing = row,
            None => self.progress.push(row),
        }
        Ok(())
    }

    pub fn progress_for_student(&self, student_id: &str) -> Vec<StudentProgress> {
        self.progress
            .iter()
            .filter(|row| row.student_id == student_id)
            .cloned()
            .collect()
    }

    pub fn all_progress(&self) -> &[StudentProgress] {
        &self.progress
    }

    // -- persistence --------------------------------------------------------

    pub fn load_from_wal(wal: &FileWal) -> Result<Self, StoreError> {
        let (snapshot, records) = wal.replay()?;
        let mut store = snapshot.unwrap_or_default();
        for record in records {
            store.apply_record(record)?;
        }
        Ok(store)
    }

    fn apply_record(&mut self, record: WalRecord) -> Result<(), StoreError> {
        match record {
            WalRecord::ExamUpsert { exam } => self.upsert_exam(exam),
            WalRecord::NodeUpsert { node } => self.upsert_node(node),
            WalRecord::EdgeUpsert { edge } => self.upsert_edge(edge),
            WalRecord::AttemptCreated {
                attempt_id,
                exam_id,
                owner_id,
                created_at_ms,
            } => self
                .create_attempt(&attempt_id, &exam_id, &owner_id, created_at_ms)
                .map(|_| ()),
            WalRecord::TelemetryAppended {
                attempt_id,
                events,
                at_ms,
                device_class,
            } => self
                .append_telemetry(&attempt_id, &events, at_ms, device_class)
                .map(|_| ()),
            WalRecord::AttemptCompleted { attempt_id, at_ms } => {
                self.complete_attempt(&attempt_id, at_ms)
            }
            WalRecord::AttemptReopened { attempt_id } => self.reopen_attempt(&attempt_id),
            WalRecord::ResultsAttached { attempt_id, result } => {
                self.attach_results(&attempt_id, result)
            }
            WalRecord::ProgressUpsert { row } => self.upsert_progress(row),
        }
    }
}

// ---------------------------------------------------------------------------
// Write-ahead log
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "record", rename_all = "snake_case")]
pub enum WalRecord {
    ExamUpsert {
        exam: DiagnosticExam,
    },
    NodeUpsert {
        node: CompetencyNode,
    },
    EdgeUpsert {
        edge: CompetencyEdge,
    },
    AttemptCreated {
        attempt_id: String,
        exam_id: String,
        owner_id: String,
        created_at_ms: u64,
    },
    TelemetryAppended {
        attempt_id: String,
        events: Vec<TelemetryEvent>,
        at_ms: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        device_class: Option<DeviceClass>,
    },
    AttemptCompleted {
        attempt_id: String,
        at_ms: u64,
    },
    AttemptReopened {
        attempt_id: String,
    },
    ResultsAttached {
        attempt_id: String,
        result: DiagnosticResult,
    },
    ProgressUpsert {
        row: StudentProgress,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalCheckpointStats {
    pub truncated_wal_records: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CheckpointPolicy {
    pub max_wal_records: Option<usize>,
}

/// Append-only JSONL log with a sidecar snapshot. Writes are synced per
/// record; `checkpoint` folds the log into the snapshot and truncates it.
pub struct FileWal {
    path: PathBuf,
    wal_records: usize,
}

impl FileWal {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            create_dir_all(parent)?;
        }
        OpenOptions::new().create(true).append(true).open(&path)?;
        let wal_records = count_non_empty_lines(&path)?;
        Ok(Self { path, wal_records })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn snapshot_path(&self) -> PathBuf {
        let mut path = self.path.clone().into_os_string();
        path.push(".snapshot");
        PathBuf::from(path)
    }

    pub fn wal_record_count(&self) -> usize {
        self.wal_records
    }

    pub fn append(&mut self, record: &WalRecord) -> Result<(), StoreError> {
        let line = serde_json::to_string(record)?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        writeln!(file, "{line}")?;
        file.sync_data()?;
        self.wal_records += 1;
        Ok(())
    }

    /// Current durable state: the latest snapshot (if any) plus every record
    /// appended since.
    pub fn replay(&self) -> Result<(Option<InMemoryStore>, Vec<WalRecord>), StoreError> {
        let snapshot_path = self.snapshot_path();
        let snapshot = if snapshot_path.exists() {
            let file = File::open(&snapshot_path)?;
            Some(serde_json::from_reader(BufReader::new(file))?)
        } else {
            None
        };

        let file = File::open(&self.path)?;
        let mut records = Vec::new();
        for line in BufReader::new(file).lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            records.push(serde_json::from_str(&line)?);
        }
        Ok((snapshot, records))
    }

    /// Write the full store state to the snapshot (atomic rename) and
    /// truncate the log.
    pub fn checkpoint(&mut self, store: &InMemoryStore) -> Result<WalCheckpointStats, StoreError> {
        let snapshot_path = self.snapshot_path();
        let mut tmp_path = snapshot_path.clone().into_os_string();
        tmp_path.push(".tmp");
        let tmp_path = PathBuf::from(tmp_path);

        let mut tmp = File::create(&tmp_path)?;
        let payload = serde_json::to_string(store)?;
        tmp.write_all(payload.as_bytes())?;
        tmp.sync_data()?;
        rename(&tmp_path, &snapshot_path)?;

        let truncated = self.wal_records;
        File::create(&self.path)?.sync_data()?;
        self.wal_records = 0;
        Ok(WalCheckpointStats {
            truncated_wal_records: truncated,
        })
    }

    pub fn checkpoint_if_due(
        &mut self,
        store: &InMemoryStore,
        policy: &CheckpointPolicy,
    ) -> Result<Option<WalCheckpointStats>, StoreError> {
        let Some(max_records) = policy.max_wal_records else {
            return Ok(None);
        };
        if self.wal_records < max_records.max(1) {
            return Ok(None);
        }
        self.checkpoint(store).map(Some)
    }
}

fn count_non_empty_lines(path: &Path) -> Result<usize, StoreError> {
    let file = File::open(path)?;
    let mut count = 0;
    for line in BufReader::new(file).lines() {
        if !line?.trim().is_empty() {
            count += 1;
        }
    }
    Ok(count)
}

// ---------------------------------------------------------------------------
// Persistent mutator variants — in-memory op first, then the WAL append
// ---------------------------------------------------------------------------

impl InMemoryStore {
    pub fn upsert_exam_persistent(
        &mut self,
        wal: &mut FileWal,
        exam: DiagnosticExam,
    ) -> Result<(), StoreError> {
        self.upsert_exam(exam.clone())?;
        wal.append(&WalRecord::ExamUpsert { exam })
    }

    pub fn upsert_node_persistent(
        &mut self,
        wal: &mut FileWal,
        node: CompetencyNode,
    ) -> Result<(), StoreError> {
        self.upsert_node(node.clone())?;
        wal.append(&WalRecord::NodeUpsert { node })
    }

    pub fn upsert_edge_persistent(
        &mut self,
        wal: &mut FileWal,
        edge: CompetencyEdge,
    ) -> Result<(), StoreError> {
        self.upsert_edge(edge.clone())?;
        wal.append(&WalRecord::EdgeUpsert { edge })
    }

    pub fn create_attempt_persistent(
        &mut self,
        wal: &mut FileWal,
        attempt_id: &str,
        exam_id: &str,
        owner_id: &str,
        now_ms: u64,
    ) -> Result<ExamAttempt, StoreError> {
        let attempt = self
            .create_attempt(attempt_id, exam_id, owner_id, now_ms)?
            .clone();
        wal.append(&WalRecord::AttemptCreated {
            attempt_id: attempt_id.to_string(),
            exam_id: exam_id.to_string(),
            owner_id: owner_id.to_string(),
            created_at_ms: now_ms,
        })?;
        Ok(attempt)
    }

    pub fn append_telemetry_persistent(
        &mut self,
        wal: &mut FileWal,
        attempt_id: &str,
        events: &[TelemetryEvent],
        now_ms: u64,
        device_class: Option<DeviceClass>,
    ) -> Result<TelemetryFoldStats, StoreError> {
        let stats = self.append_telemetry(attempt_id, events, now_ms, device_class)?;
        wal.append(&WalRecord::TelemetryAppended {
            attempt_id: attempt_id.to_string(),
            events: events.to_vec(),
            at_ms: now_ms,
            device_class,
        })?;
        Ok(stats)
    }

    pub fn complete_attempt_persistent(
        &mut self,
        wal: &mut FileWal,
        attempt_id: &str,
        now_ms: u64,
    ) -> Result<(), StoreError> {
        self.complete_attempt(attempt_id, now_ms)?;
        wal.append(&WalRecord::AttemptCompleted {
            attempt_id: attempt_id.to_string(),
            at_ms: now_ms,
        })
    }

    pub fn reopen_attempt_persistent(
        &mut self,
        wal: &mut FileWal,
        attempt_id: &str,
    ) -> Result<(), StoreError> {
        self.reopen_attempt(attempt_id)?;
        wal.append(&WalRecord::AttemptReopened {
            attempt_id: attempt_id.to_string(),
        })
    }

    pub fn attach_results_persistent(
        &mut self,
        wal: &mut FileWal,
        attempt_id: &str,
        result: DiagnosticResult,
    ) -> Result<(), StoreError> {
        self.attach_results(attempt_id, result.clone())?;
        wal.append(&WalRecord::ResultsAttached {
            attempt_id: attempt_id.to_string(),
            result,
        })
    }

    pub fn upsert_progress_persistent(
        &mut self,
        wal: &mut FileWal,
        row: StudentProgress,
    ) -> Result<(), StoreError> {
        self.upsert_progress(row.clone())?;
        wal.append(&WalRecord::ProgressUpsert { row })
    }
}
