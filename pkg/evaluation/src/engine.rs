use std::collections::BTreeMap;

use schema::{
    AttemptStatus, CalibrationSummary, CompetencyDiagnosis, DiagnosticExam, DiagnosticProbe,
    DiagnosticResult, DiagnosticScore, GraphMutation, MutationStatus, ProbeKind, ProgressStatus,
    QuestionClassification, StudentProgress, TelemetryEvent,
};
use serde_json::Value;
use store::{FileWal, InMemoryStore, StoreError};
use thiserror::Error;
use tracing::warn;
use triage::TriageError;

const OVERCONFIDENCE_THRESHOLD: f32 = 0.75;
const UNDERCONFIDENCE_THRESHOLD: f32 = 0.25;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum EvaluationError {
    #[error("unknown attempt: {0}")]
    UnknownAttempt(String),
    #[error("unknown exam: {0}")]
    UnknownExam(String),
    #[error("forensic log unavailable for attempt: {0}")]
    LedgerUnavailable(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, PartialEq)]
pub struct FinalizeOutcome {
    pub result: DiagnosticResult,
    /// True when the attempt had already been finalized and the cached
    /// result was returned without re-scoring.
    pub already_completed: bool,
}

/// Finalize an attempt: flip it to COMPLETED (the linearization point),
/// rehydrate the forensic log, reconstruct per-question telemetry, classify
/// every response, and attach the immutable diagnostic result. Safe under
/// at-least-once delivery: a second call short-circuits with the cache.
pub fn finalize_attempt(
    store: &mut InMemoryStore,
    mut wal: Option<&mut FileWal>,
    attempt_id: &str,
    now_ms: u64,
) -> Result<FinalizeOutcome, EvaluationError> {
    let attempt = store
        .attempt_by_id(attempt_id)
        .ok_or_else(|| EvaluationError::UnknownAttempt(attempt_id.to_string()))?;

    if attempt.status == AttemptStatus::Completed
        && let Some(result) = attempt.results_cache.clone()
    {
        return Ok(FinalizeOutcome {
            result,
            already_completed: true,
        });
    }

    let owner_id = attempt.owner_id.clone();
    let exam_id = attempt.exam_id.clone();
    // A completed attempt without a cache means an earlier run died between
    // the flip and the attach; score it without flipping again.
    let needs_flip = attempt.status == AttemptStatus::InProgress;
    let exam = store
        .exam_by_id(&exam_id)
        .cloned()
        .ok_or_else(|| EvaluationError::UnknownExam(exam_id.clone()))?;

    if needs_flip {
        match wal.as_deref_mut() {
            Some(wal) => store.complete_attempt_persistent(wal, attempt_id, now_ms)?,
            None => store.complete_attempt(attempt_id, now_ms)?,
        }
    }

    let scored = score_attempt(store, &exam, attempt_id, now_ms);
    let result = match scored {
        Ok(result) => result,
        Err(err) => {
            // No partial or guessed scoring: roll the flip back so a retry
            // can finalize cleanly, and fail loudly.
            if needs_flip {
                let rollback = match wal.as_deref_mut() {
                    Some(wal) => store.reopen_attempt_persistent(wal, attempt_id),
                    None => store.reopen_attempt(attempt_id),
                };
                if let Err(rollback_err) = rollback {
                    warn!(%attempt_id, error = %rollback_err, "finalization rollback failed");
                }
            }
            return Err(err);
        }
    };

    match wal.as_deref_mut() {
        Some(wal) => store.attach_results_persistent(wal, attempt_id, result.clone())?,
        None => store.attach_results(attempt_id, result.clone())?,
    }
    apply_mutations(store, wal, &owner_id, &result.mutations)?;

    Ok(FinalizeOutcome {
        result,
        already_completed: false,
    })
}

fn score_attempt(
    store: &InMemoryStore,
    exam: &DiagnosticExam,
    attempt_id: &str,
    now_ms: u64,
) -> Result<DiagnosticResult, EvaluationError> {
    let ledger = store
        .telemetry_log(attempt_id)
        .map_err(|_| EvaluationError::LedgerUnavailable(attempt_id.to_string()))?;
    let snapshot = store
        .attempt_by_id(attempt_id)
        .map(|attempt| attempt.current_state.clone())
        .unwrap_or_default();

    let mut diagnoses = Vec::with_capacity(exam.probes.len());
    let mut mutations = Vec::new();
    let mut score = DiagnosticScore {
        total: exam.probes.len(),
        ..DiagnosticScore::default()
    };

    for probe in &exam.probes {
        let evidence = reconstruct_question(ledger, &snapshot, &probe.id);
        let (classification, question_mutations) = classify_question(probe, &evidence);

        if evidence.final_value.is_some() {
            score.answered += 1;
        }
        if classification == QuestionClassification::Mastery {
            score.correct += 1;
        }

        diagnoses.push(CompetencyDiagnosis {
            question_id: probe.id.clone(),
            competency_id: probe.competency_id.clone(),
            classification,
            time_ms: evidence.time_ms,
            hesitation_count: evidence.hesitation_count,
            confidence: evidence.confidence,
        });
        mutations.extend(question_mutations);
    }

    Ok(DiagnosticResult {
        attempt_id: attempt_id.to_string(),
        completed_at_ms: now_ms,
        score,
        calibration: summarize_calibration(&diagnoses),
        diagnoses,
        mutations,
    })
}

#[derive(Debug, Default)]
struct QuestionEvidence {
    final_value: Option<Value>,
    confidence: Option<f32>,
    time_ms: u64,
    hesitation_count: u32,
}

/// Rebuild what the learner did on one question from the ordered ledger plus
/// the snapshot: final value, the most recent confidence annotation, time
/// from the last ANSWER_UPDATE, and the count of HESITATION events.
fn reconstruct_question(
    ledger: &[TelemetryEvent],
    snapshot: &BTreeMap<String, Value>,
    question_id: &str,
) -> QuestionEvidence {
    let mut evidence = QuestionEvidence {
        final_value: snapshot.get(question_id).cloned(),
        ..QuestionEvidence::default()
    };
    for event in ledger {
        match event {
            TelemetryEvent::AnswerUpdate(payload) if payload.question_id == question_id => {
                evidence.time_ms = payload.telemetry.time_ms;
                if let Some(confidence) = payload.telemetry.confidence {
                    evidence.confidence = Some(confidence);
                }
            }
            TelemetryEvent::Hesitation(payload) if payload.question_id == question_id => {
                evidence.hesitation_count += 1;
            }
            _ => {}
        }
    }
    evidence
}

/// Exhaustive per-kind classification. Triage owns the mapping to mutations;
/// a classification failure becomes an unscored gap instead of aborting the
/// whole attempt.
fn classify_question(
    probe: &DiagnosticProbe,
    evidence: &QuestionEvidence,
) -> (QuestionClassification, Vec<GraphMutation>) {
    let Some(value) = &evidence.final_value else {
        // Never answered: a gap in evidence, but no graph change — the
        // learner produced nothing to diagnose from.
        return (QuestionClassification::Gap, Vec::new());
    };

    let triaged = match probe.kind {
        ProbeKind::MultipleChoice | ProbeKind::Spotting => match value.as_str() {
            Some(option_id) => triage::evaluate(probe, option_id),
            None => {
                return unscored(probe, "submitted value is not an option id");
            }
        },
        ProbeKind::Ranking => match decode_order(value) {
            Some(order) => triage::evaluate_ranking(probe, &order),
            None => {
                return unscored(probe, "submitted value is not an ordered id list");
            }
        },
    };

    match triaged {
        Ok(mutations) => (classification_from_mutations(&mutations), mutations),
        Err(TriageError::OptionNotFound { option_id, .. }) => {
            unscored(probe, &format!("option '{option_id}' not found"))
        }
        Err(TriageError::KindMismatch { .. }) => {
            unscored(probe, "submission shape does not match the probe kind")
        }
    }
}

fn unscored(
    probe: &DiagnosticProbe,
    reason: &str,
) -> (QuestionClassification, Vec<GraphMutation>) {
    warn!(probe_id = %probe.id, %reason, "question left unscored");
    (
        QuestionClassification::Unscored {
            reason: reason.to_string(),
        },
        Vec::new(),
    )
}

fn classification_from_mutations(mutations: &[GraphMutation]) -> QuestionClassification {
    for mutation in mutations {
        match mutation.metadata.new_status {
            MutationStatus::Infected => {
                return QuestionClassification::Misconception {
                    misconception_id: mutation
                        .metadata
                        .content_id
                        .clone()
                        .unwrap_or_default(),
                };
            }
            MutationStatus::Mastered => return QuestionClassification::Mastery,
            MutationStatus::Locked => return QuestionClassification::Gap,
        }
    }
    QuestionClassification::Gap
}

fn decode_order(value: &Value) -> Option<Vec<String>> {
    let items = value.as_array()?;
    items
        .iter()
        .map(|item| item.as_str().map(str::to_string))
        .collect()
}

fn summarize_calibration(diagnoses: &[CompetencyDiagnosis]) -> CalibrationSummary {
    let mut summary = CalibrationSummary::default();
    let mut correct_sum = 0.0_f32;
    let mut correct_count = 0usize;
    let mut incorrect_sum = 0.0_f32;
    let mut incorrect_count = 0usize;

    for diagnosis in diagnoses {
        if matches!(diagnosis.classification, QuestionClassification::Unscored { .. }) {
            continue;
        }
        let Some(confidence) = diagnosis.confidence else {
            continue;
        };
        summary.rated_responses += 1;
        let correct = diagnosis.classification == QuestionClassification::Mastery;
        if correct {
            correct_sum += confidence;
            correct_count += 1;
            if confidence <= UNDERCONFIDENCE_THRESHOLD {
                summary.underconfident_correct += 1;
            }
        } else {
            incorrect_sum += confidence;
            incorrect_count += 1;
            if confidence >= OVERCONFIDENCE_THRESHOLD {
                summary.overconfident_errors += 1;
            }
        }
    }

    if correct_count > 0 {
        summary.mean_confidence_correct = Some(correct_sum / correct_count as f32);
    }
    if incorrect_count > 0 {
        summary.mean_confidence_incorrect = Some(incorrect_sum / incorrect_count as f32);
    }
    summary
}

/// Fold the mutations that carry progress semantics into the student's rows.
/// Gap scaffolding (locked INSERT_NODE) targets remediation content, not the
/// tested competency, so it leaves the rows alone.
fn apply_mutations(
    store: &mut InMemoryStore,
    mut wal: Option<&mut FileWal>,
    student_id: &str,
    mutations: &[GraphMutation],
) -> Result<(), EvaluationError> {
    for mutation in mutations {
        let row = match mutation.metadata.new_status {
            MutationStatus::Mastered => StudentProgress {
                student_id: student_id.to_string(),
                competency_id: mutation.target_node_id.clone(),
                status: ProgressStatus::Mastered,
                misconception_id: None,
                reason: Some(mutation.metadata.reason.clone()),
            },
            MutationStatus::Infected => StudentProgress {
                student_id: student_id.to_string(),
                competency_id: mutation.target_node_id.clone(),
                status: ProgressStatus::Infected,
                misconception_id: mutation.metadata.content_id.clone(),
                reason: Some(mutation.metadata.reason.clone()),
            },
            MutationStatus::Locked => continue,
        };
        match wal.as_deref_mut() {
            Some(wal) => store.upsert_progress_persistent(wal, row)?,
            None => store.upsert_progress(row)?,
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use schema::{
        AnswerTelemetry, AnswerUpdatePayload, HesitationPayload, option_builder, probe_builder,
    };
    use serde_json::json;

    fn trap_option() -> schema::ProbeOption {
        let mut option = option_builder("trap", "Looks right", false);
        option.diagnoses_misconception_id = Some("misc-sign-flip".to_string());
        option
    }

    fn sample_exam() -> DiagnosticExam {
        let mut ranking = probe_builder(
            "q3",
            "comp-order",
            vec![
                option_builder("r1", "First", false),
                option_builder("r2", "Second", false),
            ],
        );
        ranking.kind = ProbeKind::Ranking;
        ranking.options[0].rank_position = Some(0);
        ranking.options[1].rank_position = Some(1);

        DiagnosticExam {
            exam_id: "exam-1".into(),
            title: "Diagnostic".into(),
            probes: vec![
                probe_builder(
                    "q1",
                    "comp-a",
                    vec![
                        option_builder("a", "Right", true),
                        option_builder("b", "Wrong", false),
                    ],
                ),
                probe_builder(
                    "q2",
                    "comp-b",
                    vec![option_builder("a", "Right", true), trap_option()],
                ),
                ranking,
                probe_builder(
                    "q4",
                    "comp-d",
                    vec![
                        option_builder("a", "Right", true),
                        option_builder("b", "Wrong", false),
                    ],
                ),
            ],
        }
    }

    fn answer(question: &str, value: Value, confidence: Option<f32>, time_ms: u64) -> TelemetryEvent {
        TelemetryEvent::AnswerUpdate(AnswerUpdatePayload {
            question_id: question.into(),
            value,
            telemetry: AnswerTelemetry {
                time_ms,
                confidence,
                ..AnswerTelemetry::default()
            },
            timestamp_ms: time_ms,
        })
    }

    fn seeded_store() -> InMemoryStore {
        let mut store = InMemoryStore::new();
        store.upsert_exam(sample_exam()).unwrap();
        store.create_attempt("att-1", "exam-1", "stu-1", 1_000).unwrap();
        store
            .append_telemetry(
                "att-1",
                &[
                    answer("q1", json!("a"), Some(0.9), 1_200),
                    TelemetryEvent::Hesitation(HesitationPayload {
                        question_id: "q2".into(),
                        from: json!("a"),
                        to: json!("trap"),
                        timestamp_ms: 1_800,
                    }),
                    answer("q2", json!("trap"), Some(0.9), 2_000),
                    answer("q3", json!(["r2", "r1"]), None, 2_500),
                    // q4 left unanswered.
                ],
                2_600,
                None,
            )
            .unwrap();
        store
    }

    #[test]
    fn finalization_scores_and_attaches_the_result() {
        let mut store = seeded_store();
        let outcome = finalize_attempt(&mut store, None, "att-1", 9_000).unwrap();
        assert!(!outcome.already_completed);

        let result = &outcome.result;
        assert_eq!(result.score.total, 4);
        assert_eq!(result.score.answered, 3);
        assert_eq!(result.score.correct, 1);

        assert_eq!(result.diagnoses[0].classification, QuestionClassification::Mastery);
        assert_eq!(
            result.diagnoses[1].classification,
            QuestionClassification::Misconception {
                misconception_id: "misc-sign-flip".to_string()
            }
        );
        assert_eq!(result.diagnoses[2].classification, QuestionClassification::Gap);
        assert_eq!(result.diagnoses[3].classification, QuestionClassification::Gap);

        let attempt = store.attempt_by_id("att-1").unwrap();
        assert_eq!(attempt.status, AttemptStatus::Completed);
        assert_eq!(attempt.metadata.finished_at_ms, Some(9_000));
        assert_eq!(attempt.results_cache.as_ref(), Some(result));
    }

    #[test]
    fn per_question_telemetry_is_reconstructed_from_the_ledger() {
        let mut store = seeded_store();
        let outcome = finalize_attempt(&mut store, None, "att-1", 9_000).unwrap();
        let q2 = &outcome.result.diagnoses[1];
        assert_eq!(q2.time_ms, 2_000);
        assert_eq!(q2.hesitation_count, 1);
        assert_eq!(q2.confidence, Some(0.9));
    }

    #[test]
    fn finalizing_twice_returns_the_cache_without_rescoring() {
        let mut store = seeded_store();
        let first = finalize_attempt(&mut store, None, "att-1", 9_000).unwrap();
        let second = finalize_attempt(&mut store, None, "att-1", 9_999).unwrap();
        assert!(second.already_completed);
        // Identical cache: the second call did not re-score or re-stamp.
        assert_eq!(first.result, second.result);
        assert_eq!(second.result.completed_at_ms, 9_000);
    }

    #[test]
    fn mastery_and_infection_fold_into_progress_rows() {
        let mut store = seeded_store();
        finalize_attempt(&mut store, None, "att-1", 9_000).unwrap();

        let progress = store.progress_for_student("stu-1");
        let comp_a = progress.iter().find(|row| row.competency_id == "comp-a").unwrap();
        assert_eq!(comp_a.status, ProgressStatus::Mastered);
        let comp_b = progress.iter().find(|row| row.competency_id == "comp-b").unwrap();
        assert_eq!(comp_b.status, ProgressStatus::Infected);
        assert_eq!(comp_b.misconception_id.as_deref(), Some("misc-sign-flip"));
        // The ranking gap produced scaffolding, not a progress row.
        assert!(!progress.iter().any(|row| row.competency_id == "comp-order"));
    }

    #[test]
    fn malformed_submission_is_recorded_as_unscored() {
        let mut store = InMemoryStore::new();
        store.upsert_exam(sample_exam()).unwrap();
        store.create_attempt("att-2", "exam-1", "stu-2", 1_000).unwrap();
        store
            .append_telemetry(
                "att-2",
                &[answer("q1", json!({"weird": true}), None, 1_100)],
                1_200,
                None,
            )
            .unwrap();

        let outcome = finalize_attempt(&mut store, None, "att-2", 2_000).unwrap();
        assert!(matches!(
            outcome.result.diagnoses[0].classification,
            QuestionClassification::Unscored { .. }
        ));
        // The rest of the attempt still scored.
        assert_eq!(outcome.result.score.total, 4);
    }

    #[test]
    fn unknown_option_id_is_unscored_not_fatal() {
        let mut store = InMemoryStore::new();
        store.upsert_exam(sample_exam()).unwrap();
        store.create_attempt("att-3", "exam-1", "stu-3", 1_000).unwrap();
        store
            .append_telemetry("att-3", &[answer("q1", json!("zz"), None, 1_100)], 1_200, None)
            .unwrap();

        let outcome = finalize_attempt(&mut store, None, "att-3", 2_000).unwrap();
        assert!(matches!(
            outcome.result.diagnoses[0].classification,
            QuestionClassification::Unscored { .. }
        ));
    }

    #[test]
    fn calibration_summary_tracks_confidence_against_correctness() {
        let mut store = InMemoryStore::new();
        store.upsert_exam(sample_exam()).unwrap();
        store.create_attempt("att-4", "exam-1", "stu-4", 1_000).unwrap();
        store
            .append_telemetry(
                "att-4",
                &[
                    answer("q1", json!("a"), Some(0.2), 1_100),
                    answer("q2", json!("trap"), Some(0.9), 1_200),
                ],
                1_300,
                None,
            )
            .unwrap();

        let outcome = finalize_attempt(&mut store, None, "att-4", 2_000).unwrap();
        let calibration = &outcome.result.calibration;
        assert_eq!(calibration.rated_responses, 2);
        assert_eq!(calibration.mean_confidence_correct, Some(0.2));
        assert_eq!(calibration.mean_confidence_incorrect, Some(0.9));
        assert_eq!(calibration.overconfident_errors, 1);
        assert_eq!(calibration.underconfident_correct, 1);
    }

    #[test]
    fn unknown_attempt_fails_loudly() {
        let mut store = InMemoryStore::new();
        assert_eq!(
            finalize_attempt(&mut store, None, "ghost", 1_000),
            Err(EvaluationError::UnknownAttempt("ghost".to_string()))
        );
    }
}
