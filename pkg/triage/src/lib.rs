use schema::{
    DiagnosticProbe, GraphMutation, InsertPosition, MutationAction, MutationMetadata,
    MutationStatus, ProbeKind, ProbeOption,
};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TriageError {
    #[error("option '{option_id}' not found on probe '{probe_id}'")]
    OptionNotFound { probe_id: String, option_id: String },
    #[error("probe '{probe_id}' does not take this submission shape")]
    KindMismatch { probe_id: String },
}

/// Classify a submitted option against a probe's answer structure. Pure and
/// deterministic: the same (probe, option) pair always yields the same
/// mutations. An unknown option id is an explicit error, never a default
/// classification.
pub fn evaluate(
    probe: &DiagnosticProbe,
    submitted_option_id: &str,
) -> Result<Vec<GraphMutation>, TriageError> {
    if probe.kind == ProbeKind::Ranking {
        return Err(TriageError::KindMismatch {
            probe_id: probe.id.clone(),
        });
    }
    let option =
        probe
            .option_by_id(submitted_option_id)
            .ok_or_else(|| TriageError::OptionNotFound {
                probe_id: probe.id.clone(),
                option_id: submitted_option_id.to_string(),
            })?;

    if let Some(misconception_id) = option.diagnoses_misconception_id.as_deref() {
        // The learner chose the option engineered to reveal a known
        // misconception: insert a remediation target tied to the node under
        // test, not a generic failure.
        return Ok(vec![GraphMutation {
            action: MutationAction::InsertNode,
            target_node_id: probe.competency_id.clone(),
            metadata: MutationMetadata {
                new_status: MutationStatus::Infected,
                position: None,
                content_id: Some(misconception_id.to_string()),
                reason: format!(
                    "Detected specific conceptual error: option '{}' diagnoses misconception '{}'",
                    option.id, misconception_id
                ),
            },
        }]);
    }

    if !option.is_correct {
        return Ok(vec![gap_mutation(probe, Some(option))]);
    }

    Ok(vec![mastery_mutation(probe)])
}

/// Classify a ranking submission: the full ordered list of option ids.
/// Correct when it is exactly the options in ascending `rank_position`.
pub fn evaluate_ranking(
    probe: &DiagnosticProbe,
    submitted_order: &[String],
) -> Result<Vec<GraphMutation>, TriageError> {
    if probe.kind != ProbeKind::Ranking {
        return Err(TriageError::KindMismatch {
            probe_id: probe.id.clone(),
        });
    }
    for option_id in submitted_order {
        if probe.option_by_id(option_id).is_none() {
            return Err(TriageError::OptionNotFound {
                probe_id: probe.id.clone(),
                option_id: option_id.clone(),
            });
        }
    }

    let mut expected: Vec<&ProbeOption> = probe.options.iter().collect();
    expected.sort_by_key(|option| option.rank_position.unwrap_or(u32::MAX));
    let correct = expected.len() == submitted_order.len()
        && expected
            .iter()
            .zip(submitted_order)
            .all(|(option, submitted)| option.id == *submitted);

    if correct {
        Ok(vec![mastery_mutation(probe)])
    } else {
        Ok(vec![gap_mutation(probe, None)])
    }
}

fn mastery_mutation(probe: &DiagnosticProbe) -> GraphMutation {
    GraphMutation {
        action: MutationAction::UnlockNext,
        target_node_id: probe.competency_id.clone(),
        metadata: MutationMetadata {
            new_status: MutationStatus::Mastered,
            position: None,
            content_id: None,
            reason: format!(
                "Competency mastery confirmed: correct response on probe '{}'",
                probe.id
            ),
        },
    }
}

fn gap_mutation(probe: &DiagnosticProbe, option: Option<&ProbeOption>) -> GraphMutation {
    // Remediation content is scaffolding inserted as a prerequisite of the
    // node under test, not a sibling.
    let reason = match option {
        Some(option) if option.is_gap => format!(
            "Knowledge gap detected: learner declared not knowing on probe '{}'",
            probe.id
        ),
        _ => format!("Knowledge gap detected: incorrect response on probe '{}'", probe.id),
    };
    GraphMutation {
        action: MutationAction::InsertNode,
        target_node_id: probe.competency_id.clone(),
        metadata: MutationMetadata {
            new_status: MutationStatus::Locked,
            position: Some(InsertPosition::Before),
            content_id: None,
            reason,
        },
    }
}
