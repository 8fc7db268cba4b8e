use std::time::Instant;

use auth::SessionPolicy;
use ingestion::IngestionRuntime;
use schema::{
    AnswerTelemetry, AnswerUpdatePayload, DiagnosticExam, DiagnosticProbe, TelemetryEvent,
    option_builder, probe_builder,
};
use serde_json::json;
use store::{InMemoryStore, fold_answer_events};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BenchmarkProfile {
    Smoke,
    Standard,
    Large,
}

impl BenchmarkProfile {
    fn from_arg(raw: &str) -> Option<Self> {
        match raw {
            "smoke" => Some(Self::Smoke),
            "standard" | "default" => Some(Self::Standard),
            "large" => Some(Self::Large),
            _ => None,
        }
    }

    fn attempts(self) -> usize {
        match self {
            Self::Smoke => 20,
            Self::Standard => 200,
            Self::Large => 1_000,
        }
    }

    fn batches_per_attempt(self) -> usize {
        match self {
            Self::Smoke => 5,
            Self::Standard => 10,
            Self::Large => 20,
        }
    }

    fn probes(self) -> usize {
        match self {
            Self::Smoke => 10,
            Self::Standard => 20,
            Self::Large => 40,
        }
    }
}

fn main() {
    let profile = std::env::args()
        .nth(1)
        .and_then(|raw| BenchmarkProfile::from_arg(&raw))
        .unwrap_or(BenchmarkProfile::Smoke);

    if let Err(err) = run(profile) {
        eprintln!("benchmark-smoke failed: {err}");
        std::process::exit(1);
    }
}

fn synthetic_exam(probe_count: usize) -> DiagnosticExam {
    let probes: Vec<DiagnosticProbe> = (0..probe_count)
        .map(|idx| {
            probe_builder(
                &format!("q{idx}"),
                &format!("comp-{idx}"),
                vec![
                    option_builder("right", "Correct answer", true),
                    option_builder("wrong", "Distractor", false),
                ],
            )
        })
        .collect();
    DiagnosticExam {
        exam_id: "exam-bench".into(),
        title: "Benchmark exam".into(),
        probes,
    }
}

fn run(profile: BenchmarkProfile) -> Result<(), String> {
    let attempts = profile.attempts();
    let batches_per_attempt = profile.batches_per_attempt();
    let probe_count = profile.probes();

    let mut runtime = IngestionRuntime::in_memory(
        InMemoryStore::new(),
        SessionPolicy::from_env(Some("tok-bench:bench")),
    );
    runtime
        .seed_exam(synthetic_exam(probe_count))
        .map_err(|e| e.to_string())?;

    // Ingest phase: every attempt streams batches, alternating answers so
    // the snapshot keeps being rewritten.
    let mut attempt_ids = Vec::with_capacity(attempts);
    let ingest_started = Instant::now();
    let mut events_total = 0usize;
    for attempt_idx in 0..attempts {
        let attempt = runtime
            .create_attempt("exam-bench", &format!("stu-{attempt_idx}"))
            .map_err(|e| e.to_string())?;
        for batch_idx in 0..batches_per_attempt {
            let events: Vec<TelemetryEvent> = (0..probe_count)
                .map(|probe_idx| {
                    let value = if (batch_idx + probe_idx) % 2 == 0 {
                        "right"
                    } else {
                        "wrong"
                    };
                    TelemetryEvent::AnswerUpdate(AnswerUpdatePayload {
                        question_id: format!("q{probe_idx}"),
                        value: json!(value),
                        telemetry: AnswerTelemetry {
                            time_ms: 800,
                            ..AnswerTelemetry::default()
                        },
                        timestamp_ms: (batch_idx * 1_000 + probe_idx) as u64,
                    })
                })
                .collect();
            events_total += events.len();
            runtime
                .submit_batch(&attempt.attempt_id, &events, None)
                .map_err(|e| e.to_string())?;
        }
        attempt_ids.push(attempt.attempt_id);
    }
    let ingest_seconds = ingest_started.elapsed().as_secs_f64();

    // Gate: the ledger replay invariant must hold for every attempt.
    for attempt_id in &attempt_ids {
        let store = runtime.store();
        let replayed = fold_answer_events(
            store
                .telemetry_log(attempt_id)
                .map_err(|e| e.to_string())?,
        );
        let attempt = store
            .attempt_by_id(attempt_id)
            .ok_or("attempt disappeared")?;
        if replayed != attempt.current_state {
            return Err(format!("ledger replay diverged for attempt {attempt_id}"));
        }
    }

    // Finalize phase.
    let finalize_started = Instant::now();
    let mut correct_total = 0usize;
    for attempt_id in &attempt_ids {
        let outcome = runtime.finalize(attempt_id).map_err(|e| e.to_string())?;
        correct_total += outcome.result.score.correct;
    }
    let finalize_seconds = finalize_started.elapsed().as_secs_f64();

    let scored = runtime
        .store()
        .attempts()
        .filter(|attempt| attempt.results_cache.is_some())
        .count();
    if scored != attempts {
        return Err(format!("{scored}/{attempts} attempts carry a results cache"));
    }

    println!("Telemetry pipeline benchmark");
    println!("profile: {profile:?}");
    println!("attempts: {attempts}");
    println!("batches_per_attempt: {batches_per_attempt}");
    println!("probes_per_exam: {probe_count}");
    println!("events_ingested: {events_total}");
    println!("ingest_seconds: {ingest_seconds:.4}");
    println!(
        "ingest_events_per_second: {:.2}",
        events_total as f64 / ingest_seconds.max(0.0001)
    );
    println!("finalize_seconds: {finalize_seconds:.4}");
    println!(
        "finalize_attempts_per_second: {:.2}",
        attempts as f64 / finalize_seconds.max(0.0001)
    );
    println!("correct_total: {correct_total}");
    Ok(())
}
