use std::{collections::VecDeque, time::Instant};

use serde_json::{Value, json};
use telemetry::{AnswerOverrides, SyncOutcome, SyncScheduler, SyncTransport, TelemetryBatch, TelemetryQueue};

fn main() {
    match run(std::env::args().collect()) {
        Ok(output) => {
            if !output.is_empty() {
                println!("{output}");
            }
        }
        Err(err) => {
            eprintln!("probe-sim error: {err}");
            std::process::exit(2);
        }
    }
}

fn run(args: Vec<String>) -> Result<String, String> {
    let mut args: VecDeque<String> = args.into_iter().skip(1).collect();
    if args.is_empty() {
        return Ok(usage());
    }
    if matches!(
        args.front().map(String::as_str),
        Some("help" | "--help" | "-h")
    ) {
        return Ok(usage());
    }

    let cmd = pop_required(&mut args, "command")?;
    match cmd.as_str() {
        "run" => cmd_run(&mut args),
        "state" => cmd_state(&mut args),
        _ => Err(format!("unknown command '{cmd}'\n\n{}", usage())),
    }
}

fn usage() -> String {
    [
        "Usage: probe-sim <command>",
        "",
        "Commands:",
        "  run --server URL --token TOKEN --exam EXAM_ID [--owner OWNER]",
        "      [--answer QID=VALUE]...    simulate a learner session: track the",
        "                                 answers in order (repeats for the same",
        "                                 question exercise hesitation capture),",
        "                                 sync, then finalize and print the result",
        "  state --server URL --token TOKEN --attempt ATTEMPT_ID",
        "                                 print the server-side snapshot for resume",
    ]
    .join("\n")
}

struct Session {
    server: String,
    token: String,
    client: reqwest::blocking::Client,
}

impl Session {
    fn post(&self, path: &str, body: Value) -> Result<(u16, Value), String> {
        let response = self
            .client
            .post(format!("{}{}", self.server, path))
            .bearer_auth(&self.token)
            .json(&body)
            .send()
            .map_err(|e| format!("request to {path} failed: {e}"))?;
        let status = response.status().as_u16();
        let body = response
            .json::<Value>()
            .map_err(|e| format!("response from {path} was not JSON: {e}"))?;
        Ok((status, body))
    }

    fn get(&self, path: &str) -> Result<(u16, Value), String> {
        let response = self
            .client
            .get(format!("{}{}", self.server, path))
            .bearer_auth(&self.token)
            .send()
            .map_err(|e| format!("request to {path} failed: {e}"))?;
        let status = response.status().as_u16();
        let body = response
            .json::<Value>()
            .map_err(|e| format!("response from {path} was not JSON: {e}"))?;
        Ok((status, body))
    }
}

/// Submits batches to the ingestion service, honoring its structured
/// rate-limit replies.
struct HttpSyncTransport {
    session: Session,
}

impl SyncTransport for HttpSyncTransport {
    fn submit(&mut self, batch: &TelemetryBatch) -> SyncOutcome {
        let body = match serde_json::to_value(batch) {
            Ok(body) => body,
            Err(err) => return SyncOutcome::Failed(format!("encoding batch failed: {err}")),
        };
        match self.session.post("/v1/telemetry/batch", body) {
            Ok((200, _)) => SyncOutcome::Accepted,
            Ok((429, reply)) => SyncOutcome::RateLimited {
                retry_after_ms: reply["retry_after_ms"].as_u64().unwrap_or(1_000),
            },
            Ok((status, reply)) => SyncOutcome::Failed(format!(
                "server answered {status}: {}",
                reply["error"].as_str().unwrap_or("unknown error")
            )),
            Err(err) => SyncOutcome::Failed(err),
        }
    }
}

fn cmd_run(args: &mut VecDeque<String>) -> Result<String, String> {
    let mut server = None;
    let mut token = None;
    let mut exam = None;
    let mut owner = None;
    let mut answers: Vec<(String, String)> = Vec::new();

    while let Some(flag) = args.pop_front() {
        match flag.as_str() {
            "--server" => server = Some(pop_required(args, "--server value")?),
            "--token" => token = Some(pop_required(args, "--token value")?),
            "--exam" => exam = Some(pop_required(args, "--exam value")?),
            "--owner" => owner = Some(pop_required(args, "--owner value")?),
            "--answer" => {
                let raw = pop_required(args, "--answer value")?;
                let (question, value) = raw
                    .split_once('=')
                    .ok_or_else(|| format!("--answer expects QID=VALUE, got '{raw}'"))?;
                answers.push((question.to_string(), value.to_string()));
            }
            _ => return Err(format!("unknown run option '{flag}'")),
        }
    }
    let server = server.ok_or("--server is required")?;
    let token = token.ok_or("--token is required")?;
    let exam = exam.ok_or("--exam is required")?;
    if answers.is_empty() {
        return Err("at least one --answer is required".to_string());
    }

    let session = Session {
        server: server.trim_end_matches('/').to_string(),
        token,
        client: reqwest::blocking::Client::new(),
    };

    let mut create_body = json!({ "exam_id": exam });
    if let Some(owner) = owner {
        create_body["owner_id"] = json!(owner);
    }
    let (status, created) = session.post("/v1/attempts", create_body)?;
    if status != 200 {
        return Err(format!(
            "attempt creation failed ({status}): {}",
            created["error"].as_str().unwrap_or("unknown error")
        ));
    }
    let attempt_id = created["attempt_id"]
        .as_str()
        .ok_or("server did not return an attempt_id")?
        .to_string();

    let finalize_session = Session {
        server: session.server.clone(),
        token: session.token.clone(),
        client: reqwest::blocking::Client::new(),
    };
    let mut scheduler = SyncScheduler::new(
        &attempt_id,
        TelemetryQueue::new(),
        HttpSyncTransport { session },
    );

    for (question, value) in &answers {
        scheduler
            .queue_mut()
            .track_answer(question, json!(value), AnswerOverrides::default());
    }
    scheduler.flush_on_teardown(Instant::now());
    if !scheduler.queue().is_empty() {
        return Err("telemetry sync did not drain the queue; see logs".to_string());
    }

    let (status, finalized) =
        finalize_session.post(&format!("/v1/attempts/{attempt_id}/finalize"), json!({}))?;
    if status != 200 {
        return Err(format!(
            "finalization failed ({status}): {}",
            finalized["error"].as_str().unwrap_or("unknown error")
        ));
    }

    let score = &finalized["result"]["score"];
    let mut out = vec![
        format!("attempt {attempt_id} finalized"),
        format!(
            "score: {}/{} correct, {} answered",
            score["correct"], score["total"], score["answered"]
        ),
    ];
    if let Some(diagnoses) = finalized["result"]["diagnoses"].as_array() {
        for diagnosis in diagnoses {
            out.push(format!(
                "  {}: {} (hesitations: {})",
                diagnosis["question_id"].as_str().unwrap_or("?"),
                diagnosis["classification"]["kind"].as_str().unwrap_or("?"),
                diagnosis["hesitation_count"]
            ));
        }
    }
    Ok(out.join("\n"))
}

fn cmd_state(args: &mut VecDeque<String>) -> Result<String, String> {
    let mut server = None;
    let mut token = None;
    let mut attempt = None;
    while let Some(flag) = args.pop_front() {
        match flag.as_str() {
            "--server" => server = Some(pop_required(args, "--server value")?),
            "--token" => token = Some(pop_required(args, "--token value")?),
            "--attempt" => attempt = Some(pop_required(args, "--attempt value")?),
            _ => return Err(format!("unknown state option '{flag}'")),
        }
    }
    let server = server.ok_or("--server is required")?;
    let token = token.ok_or("--token is required")?;
    let attempt = attempt.ok_or("--attempt is required")?;

    let session = Session {
        server: server.trim_end_matches('/').to_string(),
        token,
        client: reqwest::blocking::Client::new(),
    };
    let (status, body) = session.get(&format!("/v1/attempts/{attempt}/state"))?;
    if status != 200 {
        return Err(format!(
            "state fetch failed ({status}): {}",
            body["error"].as_str().unwrap_or("unknown error")
        ));
    }
    serde_json::to_string_pretty(&body["current_state"])
        .map_err(|e| format!("rendering state failed: {e}"))
}

fn pop_required(args: &mut VecDeque<String>, what: &str) -> Result<String, String> {
    args.pop_front().ok_or_else(|| format!("missing {what}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn help_prints_usage() {
        let output = run(vec!["probe-sim".into(), "help".into()]).unwrap();
        assert!(output.contains("Usage: probe-sim"));
    }

    #[test]
    fn run_requires_answers() {
        let err = run(vec![
            "probe-sim".into(),
            "run".into(),
            "--server".into(),
            "http://localhost:8081".into(),
            "--token".into(),
            "tok".into(),
            "--exam".into(),
            "exam-1".into(),
        ])
        .unwrap_err();
        assert!(err.contains("--answer"));
    }

    #[test]
    fn unknown_command_is_reported() {
        let err = run(vec!["probe-sim".into(), "bogus".into()]).unwrap_err();
        assert!(err.contains("unknown command"));
    }
}
