use std::collections::HashMap;

use schema::{AttemptStatus, QuestionClassification};
use store::InMemoryStore;

/// Item parameters in the slip/guess sense: `slip` is the probability a
/// learner who holds the competency still answers wrong; `guess` the
/// probability one who lacks it answers right.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ItemCalibration {
    pub slip: f32,
    pub guess: f32,
}

/// One scored response, the estimator's input row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemObservation {
    pub probe_id: String,
    pub student_id: String,
    pub correct: bool,
}

/// The estimation itself is an external statistical service; this crate only
/// fixes the contract it must satisfy.
pub trait CalibrationEstimator {
    fn estimate(&self, observations: &[ItemObservation]) -> HashMap<String, ItemCalibration>;
}

/// Fixed-parameter estimator for tests and offline what-if runs.
#[derive(Debug, Clone, Default)]
pub struct FixedCalibration {
    pub parameters: HashMap<String, ItemCalibration>,
}

impl CalibrationEstimator for FixedCalibration {
    fn estimate(&self, _observations: &[ItemObservation]) -> HashMap<String, ItemCalibration> {
        self.parameters.clone()
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ItemHealthThresholds {
    pub max_slip: f32,
    pub max_guess: f32,
}

impl Default for ItemHealthThresholds {
    fn default() -> Self {
        Self {
            max_slip: 0.35,
            max_guess: 0.35,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ItemHealthFlag {
    pub probe_id: String,
    pub slip: f32,
    pub guess: f32,
    pub observations: usize,
}

/// Derive estimator input from every finalized attempt's cached diagnoses.
/// Unscored questions carry no signal and are skipped.
pub fn observations_from_attempts(store: &InMemoryStore) -> Vec<ItemObservation> {
    let mut observations = Vec::new();
    for attempt in store.attempts() {
        if attempt.status != AttemptStatus::Completed {
            continue;
        }
        let Some(result) = &attempt.results_cache else {
            continue;
        };
        for diagnosis in &result.diagnoses {
            if matches!(diagnosis.classification, QuestionClassification::Unscored { .. }) {
                continue;
            }
            observations.push(ItemObservation {
                probe_id: diagnosis.question_id.clone(),
                student_id: attempt.owner_id.clone(),
                correct: diagnosis.classification == QuestionClassification::Mastery,
            });
        }
    }
    observations
}

/// Flag items whose calibrated parameters exceed the thresholds, worst
/// offender first. Items the estimator returned no parameters for are not
/// flagged.
pub fn item_health_report(
    estimator: &dyn CalibrationEstimator,
    observations: &[ItemObservation],
    thresholds: ItemHealthThresholds,
) -> Vec<ItemHealthFlag> {
    let parameters = estimator.estimate(observations);
    let mut counts: HashMap<&str, usize> = HashMap::new();
    for observation in observations {
        *counts.entry(observation.probe_id.as_str()).or_insert(0) += 1;
    }

    let mut flags: Vec<ItemHealthFlag> = parameters
        .into_iter()
        .filter(|(_, calibration)| {
            calibration.slip > thresholds.max_slip || calibration.guess > thresholds.max_guess
        })
        .map(|(probe_id, calibration)| ItemHealthFlag {
            observations: counts.get(probe_id.as_str()).copied().unwrap_or(0),
            probe_id,
            slip: calibration.slip,
            guess: calibration.guess,
        })
        .collect();
    flags.sort_by(|a, b| {
        b.slip
            .max(b.guess)
            .total_cmp(&a.slip.max(a.guess))
            .then_with(|| a.probe_id.cmp(&b.probe_id))
    });
    flags
}
