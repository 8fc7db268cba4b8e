use std::{sync::mpsc, time::Instant};

use serde_json::{Value, json};

#[derive(Debug, Clone)]
struct Config {
    server: String,
    token: String,
    exam_id: String,
    concurrency: usize,
    batches_per_worker: usize,
    events_per_batch: usize,
}

#[derive(Debug, Default)]
struct WorkerStats {
    success: usize,
    failed: usize,
    rate_limited: usize,
    latencies_ms: Vec<f64>,
    sample_errors: Vec<String>,
}

fn main() {
    let config = match parse_args(std::env::args().skip(1)) {
        Ok(config) => config,
        Err(message) => {
            eprintln!("{message}");
            std::process::exit(2);
        }
    };

    if let Err(err) = run(config) {
        eprintln!("concurrent-load failed: {err}");
        std::process::exit(1);
    }
}

fn usage() -> String {
    [
        "Usage: concurrent-load --server URL --token TOKEN --exam EXAM_ID",
        "                       [--concurrency N] [--batches-per-worker N]",
        "                       [--events-per-batch N]",
    ]
    .join("\n")
}

fn parse_args(args: impl Iterator<Item = String>) -> Result<Config, String> {
    let mut server = None;
    let mut token = None;
    let mut exam_id = None;
    let mut concurrency = 4usize;
    let mut batches_per_worker = 50usize;
    let mut events_per_batch = 10usize;

    let mut args = args.peekable();
    while let Some(flag) = args.next() {
        let mut value = |what: &str| -> Result<String, String> {
            args.next().ok_or_else(|| format!("missing {what}"))
        };
        match flag.as_str() {
            "--server" => server = Some(value("--server value")?),
            "--token" => token = Some(value("--token value")?),
            "--exam" => exam_id = Some(value("--exam value")?),
            "--concurrency" => {
                concurrency = value("--concurrency value")?
                    .parse()
                    .map_err(|_| "invalid --concurrency".to_string())?;
            }
            "--batches-per-worker" => {
                batches_per_worker = value("--batches-per-worker value")?
                    .parse()
                    .map_err(|_| "invalid --batches-per-worker".to_string())?;
            }
            "--events-per-batch" => {
                events_per_batch = value("--events-per-batch value")?
                    .parse()
                    .map_err(|_| "invalid --events-per-batch".to_string())?;
            }
            "help" | "--help" | "-h" => return Err(usage()),
            _ => return Err(format!("unknown option '{flag}'\n\n{}", usage())),
        }
    }

    Ok(Config {
        server: server.ok_or_else(|| format!("--server is required\n\n{}", usage()))?,
        token: token.ok_or_else(|| format!("--token is required\n\n{}", usage()))?,
        exam_id: exam_id.ok_or_else(|| format!("--exam is required\n\n{}", usage()))?,
        concurrency: concurrency.max(1),
        batches_per_worker: batches_per_worker.max(1),
        events_per_batch: events_per_batch.max(1),
    })
}

fn run(config: Config) -> Result<(), String> {
    let total_batches = config.concurrency * config.batches_per_worker;
    let started_at = Instant::now();
    let (tx, rx) = mpsc::channel::<WorkerStats>();

    std::thread::scope(|scope| {
        for worker_idx in 0..config.concurrency {
            let tx = tx.clone();
            let config = config.clone();
            scope.spawn(move || {
                let _ = tx.send(run_worker(&config, worker_idx));
            });
        }
    });
    drop(tx);

    let elapsed_seconds = started_at.elapsed().as_secs_f64();
    let mut success = 0usize;
    let mut failed = 0usize;
    let mut rate_limited = 0usize;
    let mut latencies_ms = Vec::with_capacity(total_batches);
    let mut errors = Vec::new();

    for stats in rx {
        success += stats.success;
        failed += stats.failed;
        rate_limited += stats.rate_limited;
        latencies_ms.extend(stats.latencies_ms);
        for err in stats.sample_errors {
            if errors.len() >= 10 {
                break;
            }
            errors.push(err);
        }
    }

    if success == 0 {
        return Err("no successful batches".to_string());
    }

    latencies_ms.sort_by(|a, b| a.total_cmp(b));
    let avg_ms = latencies_ms.iter().sum::<f64>() / latencies_ms.len() as f64;

    println!("Telemetry ingestion load benchmark");
    println!("server: {}", config.server);
    println!("concurrency: {}", config.concurrency);
    println!("batches_per_worker: {}", config.batches_per_worker);
    println!("events_per_batch: {}", config.events_per_batch);
    println!("total_batches: {total_batches}");
    println!("successful_batches: {success}");
    println!("rate_limited_batches: {rate_limited}");
    println!("failed_batches: {failed}");
    println!("elapsed_seconds: {elapsed_seconds:.4}");
    println!(
        "throughput_batches_per_second: {:.2}",
        success as f64 / elapsed_seconds.max(0.0001)
    );
    println!("latency_avg_ms: {avg_ms:.4}");
    println!("latency_p50_ms: {:.4}", percentile(&latencies_ms, 0.50));
    println!("latency_p95_ms: {:.4}", percentile(&latencies_ms, 0.95));
    println!("latency_p99_ms: {:.4}", percentile(&latencies_ms, 0.99));

    if failed > 0 {
        for err in errors {
            println!("error_sample: {err}");
        }
        return Err(format!("{failed} batches failed"));
    }
    Ok(())
}

fn run_worker(config: &Config, worker_idx: usize) -> WorkerStats {
    let mut stats = WorkerStats::default();
    let client = reqwest::blocking::Client::new();
    let server = config.server.trim_end_matches('/');

    let attempt_id = match create_attempt(&client, server, config) {
        Ok(attempt_id) => attempt_id,
        Err(err) => {
            stats.failed += config.batches_per_worker;
            stats.sample_errors.push(err);
            return stats;
        }
    };

    for batch_idx in 0..config.batches_per_worker {
        let events: Vec<Value> = (0..config.events_per_batch)
            .map(|event_idx| {
                json!({
                    "event_type": "ANSWER_UPDATE",
                    "payload": {
                        "question_id": format!("q{}", event_idx % 8),
                        "value": format!("option-{worker_idx}-{batch_idx}"),
                        "telemetry": {
                            "time_ms": 700,
                            "hesitation_count": 0,
                            "focus_lost_count": 0
                        },
                        "timestamp_ms": (batch_idx * 1_000 + event_idx) as u64
                    }
                })
            })
            .collect();

        let req_started = Instant::now();
        let response = client
            .post(format!("{server}/v1/telemetry/batch"))
            .bearer_auth(&config.token)
            .json(&json!({ "attempt_id": attempt_id, "events": events }))
            .send();
        match response {
            Ok(response) if response.status().as_u16() == 200 => {
                stats.success += 1;
                stats
                    .latencies_ms
                    .push(req_started.elapsed().as_secs_f64() * 1000.0);
            }
            Ok(response) if response.status().as_u16() == 429 => {
                stats.rate_limited += 1;
            }
            Ok(response) => {
                stats.failed += 1;
                if stats.sample_errors.len() < 4 {
                    stats
                        .sample_errors
                        .push(format!("unexpected HTTP status code: {}", response.status()));
                }
            }
            Err(err) => {
                stats.failed += 1;
                if stats.sample_errors.len() < 4 {
                    stats.sample_errors.push(err.to_string());
                }
            }
        }
    }
    stats
}

fn create_attempt(
    client: &reqwest::blocking::Client,
    server: &str,
    config: &Config,
) -> Result<String, String> {
    let response = client
        .post(format!("{server}/v1/attempts"))
        .bearer_auth(&config.token)
        .json(&json!({ "exam_id": config.exam_id }))
        .send()
        .map_err(|e| format!("attempt creation failed: {e}"))?;
    if response.status().as_u16() != 200 {
        return Err(format!(
            "attempt creation failed with status {}",
            response.status()
        ));
    }
    let body: Value = response
        .json()
        .map_err(|e| format!("attempt creation returned invalid JSON: {e}"))?;
    body["attempt_id"]
        .as_str()
        .map(str::to_string)
        .ok_or_else(|| "attempt creation response missing attempt_id".to_string())
}

fn percentile(sorted: &[f64], quantile: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let idx = (((sorted.len() - 1) as f64) * quantile).round() as usize;
    sorted[idx]
}
