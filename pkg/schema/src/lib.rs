use std::{
    collections::{BTreeMap, HashSet},
    time::{SystemTime, UNIX_EPOCH},
};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

// ---------------------------------------------------------------------------
// Telemetry events — the forensic-log vocabulary
// ---------------------------------------------------------------------------

/// One interaction event captured while a learner answers a probe.
/// Append-only; never mutated after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event_type", content = "payload")]
pub enum TelemetryEvent {
    #[serde(rename = "ANSWER_UPDATE")]
    AnswerUpdate(AnswerUpdatePayload),
    #[serde(rename = "HESITATION")]
    Hesitation(HesitationPayload),
    #[serde(rename = "NAVIGATION")]
    Navigation(NavigationPayload),
}

impl TelemetryEvent {
    pub fn question_id(&self) -> &str {
        match self {
            Self::AnswerUpdate(payload) => &payload.question_id,
            Self::Hesitation(payload) => &payload.question_id,
            Self::Navigation(payload) => &payload.question_id,
        }
    }

    pub fn timestamp_ms(&self) -> u64 {
        match self {
            Self::AnswerUpdate(payload) => payload.timestamp_ms,
            Self::Hesitation(payload) => payload.timestamp_ms,
            Self::Navigation(payload) => payload.timestamp_ms,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnswerUpdatePayload {
    pub question_id: String,
    /// Opaque per-question answer; interpreted per `ProbeKind` at evaluation.
    pub value: Value,
    pub telemetry: AnswerTelemetry,
    pub timestamp_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct AnswerTelemetry {
    pub time_ms: u64,
    pub hesitation_count: u32,
    pub focus_lost_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f32>,
}

/// Synthesized when a tracked answer replaces a different, non-empty prior
/// value: "changed my mind" is detectable purely from the ledger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HesitationPayload {
    pub question_id: String,
    pub from: Value,
    pub to: Value,
    pub timestamp_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NavigationPayload {
    pub question_id: String,
    pub timestamp_ms: u64,
}

// ---------------------------------------------------------------------------
// Diagnostic probes
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProbeKind {
    /// Answer value is a single option id.
    MultipleChoice,
    /// Answer value is an ordered array of option ids.
    Ranking,
    /// Answer value is the id of the option (region) the learner flagged.
    Spotting,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProbeOption {
    pub id: String,
    pub content: String,
    pub is_correct: bool,
    /// "I don't know" option — never correct.
    #[serde(default)]
    pub is_gap: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub feedback: Option<String>,
    /// Set on trap options: choosing this option reveals a known misconception.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diagnoses_misconception_id: Option<String>,
    /// Correct ordinal for ranking probes, 0-based.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rank_position: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiagnosticProbe {
    pub id: String,
    pub competency_id: String,
    pub kind: ProbeKind,
    pub stem: String,
    pub options: Vec<ProbeOption>,
}

impl DiagnosticProbe {
    pub fn option_by_id(&self, option_id: &str) -> Option<&ProbeOption> {
        self.options.iter().find(|option| option.id == option_id)
    }

    /// A probe is a trap when any option is engineered to diagnose a
    /// specific misconception.
    pub fn is_trap(&self) -> bool {
        self.options
            .iter()
            .any(|option| option.diagnoses_misconception_id.is_some())
    }

    pub fn gap_option(&self) -> Option<&ProbeOption> {
        self.options.iter().find(|option| option.is_gap)
    }
}

/// One diagnostic exam groups the probes an attempt runs against;
/// `question_id` in telemetry is the probe id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiagnosticExam {
    pub exam_id: String,
    pub title: String,
    pub probes: Vec<DiagnosticProbe>,
}

impl DiagnosticExam {
    pub fn probe_by_id(&self, probe_id: &str) -> Option<&DiagnosticProbe> {
        self.probes.iter().find(|probe| probe.id == probe_id)
    }
}

// ---------------------------------------------------------------------------
// Competency graph records
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompetencyNode {
    pub id: String,
    pub title: String,
    pub description: String,
}

/// `source_id` is a prerequisite of `target_id`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CompetencyEdge {
    pub source_id: String,
    pub target_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressStatus {
    Mastered,
    Completed,
    Misconception,
    Infected,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StudentProgress {
    pub student_id: String,
    pub competency_id: String,
    pub status: ProgressStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub misconception_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

// ---------------------------------------------------------------------------
// Graph mutations — produced by triage, consumed by the progress store
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MutationAction {
    InsertNode,
    UnlockNext,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InsertPosition {
    Before,
    After,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MutationStatus {
    Mastered,
    Infected,
    Locked,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MutationMetadata {
    pub new_status: MutationStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<InsertPosition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_id: Option<String>,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphMutation {
    pub action: MutationAction,
    pub target_node_id: String,
    pub metadata: MutationMetadata,
}

// ---------------------------------------------------------------------------
// Attempts
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AttemptStatus {
    InProgress,
    Completed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceClass {
    Desktop,
    Mobile,
    Tablet,
    Unknown,
}

impl DeviceClass {
    pub fn from_user_agent(raw: &str) -> Self {
        let raw = raw.trim();
        if raw.is_empty() {
            return Self::Unknown;
        }
        if raw.contains("iPad") || raw.contains("Tablet") {
            return Self::Tablet;
        }
        if raw.contains("Mobi") || raw.contains("Android") || raw.contains("iPhone") {
            return Self::Mobile;
        }
        Self::Desktop
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptMetadata {
    pub started_at_ms: u64,
    /// Refreshed on every accepted batch, including empty heartbeats, so idle
    /// detection can tell "connected but not answering" from "disconnected".
    pub last_seen_at_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_class: Option<DeviceClass>,
}

/// Aggregate root for one exam session. `current_state` is the mutable
/// snapshot; the forensic ledger for the attempt lives in the store. Replaying
/// all ANSWER_UPDATE events in order and keeping the last value per question
/// must reproduce `current_state` exactly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExamAttempt {
    pub attempt_id: String,
    pub exam_id: String,
    pub owner_id: String,
    pub status: AttemptStatus,
    pub current_state: BTreeMap<String, Value>,
    pub metadata: AttemptMetadata,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub results_cache: Option<DiagnosticResult>,
}

// ---------------------------------------------------------------------------
// Diagnostic results
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum QuestionClassification {
    Mastery,
    Misconception { misconception_id: String },
    Gap,
    Unscored { reason: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompetencyDiagnosis {
    pub question_id: String,
    pub competency_id: String,
    pub classification: QuestionClassification,
    pub time_ms: u64,
    pub hesitation_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct DiagnosticScore {
    pub total: usize,
    pub answered: usize,
    pub correct: usize,
}

/// Metacognitive calibration: how well self-reported confidence tracked
/// actual correctness.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct CalibrationSummary {
    pub rated_responses: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mean_confidence_correct: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mean_confidence_incorrect: Option<f32>,
    pub overconfident_errors: usize,
    pub underconfident_correct: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiagnosticResult {
    pub attempt_id: String,
    pub completed_at_ms: u64,
    pub score: DiagnosticScore,
    pub diagnoses: Vec<CompetencyDiagnosis>,
    pub calibration: CalibrationSummary,
    pub mutations: Vec<GraphMutation>,
}

// ---------------------------------------------------------------------------
// Render views — derived, never persisted
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NodeStatus {
    Locked,
    Available,
    Completed,
    Mastered,
    Infected,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphNodeView {
    pub id: String,
    pub label: String,
    pub description: String,
    pub status: NodeStatus,
    pub level: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub infection_reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphEdgeView {
    pub source_id: String,
    pub target_id: String,
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("missing field: {0}")]
    MissingField(&'static str),
    #[error("invalid field: {0}")]
    InvalidField(&'static str),
}

pub fn validate_event(event: &TelemetryEvent) -> Result<(), ValidationError> {
    if event.question_id().trim().is_empty() {
        return Err(ValidationError::MissingField("question_id"));
    }
    if let TelemetryEvent::AnswerUpdate(payload) = event
        && let Some(confidence) = payload.telemetry.confidence
        && !(0.0..=1.0).contains(&confidence)
    {
        return Err(ValidationError::InvalidField("telemetry.confidence"));
    }
    Ok(())
}

pub fn validate_option(option: &ProbeOption) -> Result<(), ValidationError> {
    if option.id.trim().is_empty() {
        return Err(ValidationError::MissingField("option.id"));
    }
    if option.content.trim().is_empty() {
        return Err(ValidationError::MissingField("option.content"));
    }
    // An "I don't know" option never counts as correct.
    if option.is_gap && option.is_correct {
        return Err(ValidationError::InvalidField("option.is_gap"));
    }
    if let Some(misconception_id) = &option.diagnoses_misconception_id
        && misconception_id.trim().is_empty()
    {
        return Err(ValidationError::MissingField(
            "option.diagnoses_misconception_id",
        ));
    }
    Ok(())
}

pub fn validate_probe(probe: &DiagnosticProbe) -> Result<(), ValidationError> {
    if probe.id.trim().is_empty() {
        return Err(ValidationError::MissingField("probe.id"));
    }
    if probe.competency_id.trim().is_empty() {
        return Err(ValidationError::MissingField("probe.competency_id"));
    }
    if probe.stem.trim().is_empty() {
        return Err(ValidationError::MissingField("probe.stem"));
    }
    for option in &probe.options {
        validate_option(option)?;
    }
    let mut seen_ids = HashSet::new();
    for option in &probe.options {
        if !seen_ids.insert(option.id.as_str()) {
            return Err(ValidationError::InvalidField("probe.options[].id"));
        }
    }
    match probe.kind {
        ProbeKind::MultipleChoice | ProbeKind::Spotting => {
            if probe.options.len() < 2 {
                return Err(ValidationError::InvalidField("probe.options"));
            }
            if !probe.options.iter().any(|option| option.is_correct) {
                return Err(ValidationError::InvalidField("probe.options.is_correct"));
            }
        }
        ProbeKind::Ranking => {
            if probe.options.len() < 2 {
                return Err(ValidationError::InvalidField("probe.options"));
            }
            let mut positions = HashSet::new();
            for option in &probe.options {
                let Some(position) = option.rank_position else {
                    return Err(ValidationError::MissingField("option.rank_position"));
                };
                if !positions.insert(position) {
                    return Err(ValidationError::InvalidField("option.rank_position"));
                }
            }
        }
    }
    Ok(())
}

pub fn validate_exam(exam: &DiagnosticExam) -> Result<(), ValidationError> {
    if exam.exam_id.trim().is_empty() {
        return Err(ValidationError::MissingField("exam_id"));
    }
    if exam.title.trim().is_empty() {
        return Err(ValidationError::MissingField("exam.title"));
    }
    if exam.probes.is_empty() {
        return Err(ValidationError::InvalidField("exam.probes"));
    }
    let mut seen_ids = HashSet::new();
    for probe in &exam.probes {
        validate_probe(probe)?;
        if !seen_ids.insert(probe.id.as_str()) {
            return Err(ValidationError::InvalidField("exam.probes[].id"));
        }
    }
    Ok(())
}

pub fn validate_node(node: &CompetencyNode) -> Result<(), ValidationError> {
    if node.id.trim().is_empty() {
        return Err(ValidationError::MissingField("node.id"));
    }
    if node.title.trim().is_empty() {
        return Err(ValidationError::MissingField("node.title"));
    }
    Ok(())
}

pub fn validate_edge(edge: &CompetencyEdge) -> Result<(), ValidationError> {
    if edge.source_id.trim().is_empty() {
        return Err(ValidationError::MissingField("edge.source_id"));
    }
    if edge.target_id.trim().is_empty() {
        return Err(ValidationError::MissingField("edge.target_id"));
    }
    if edge.source_id == edge.target_id {
        return Err(ValidationError::InvalidField("edge.target_id"));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Shared helpers
// ---------------------------------------------------------------------------

pub fn unix_timestamp_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_millis() as u64)
        .unwrap_or_default()
}

/// Helper to create a `ProbeOption` with default optional fields.
/// Used throughout tests to avoid repetitive struct construction.
pub fn option_builder(id: &str, content: &str, is_correct: bool) -> ProbeOption {
    ProbeOption {
        id: id.to_string(),
        content: content.to_string(),
        is_correct,
        is_gap: false,
        feedback: None,
        diagnoses_misconception_id: None,
        rank_position: None,
    }
}

/// Helper to create a multiple-choice `DiagnosticProbe` from prebuilt options.
pub fn probe_builder(id: &str, competency_id: &str, options: Vec<ProbeOption>) -> DiagnosticProbe {
    DiagnosticProbe {
        id: id.to_string(),
        competency_id: competency_id.to_string(),
        kind: ProbeKind::MultipleChoice,
        stem: format!("Probe {id}"),
        options,
    }
}
