use std::{
    collections::HashMap,
    fs::{OpenOptions, create_dir_all},
    io::{BufRead, BufReader, Write},
    path::Path,
    sync::{Mutex, OnceLock},
};

use auth::sha256_hex;
use schema::unix_timestamp_millis;
use serde::{Deserialize, Serialize};
use tracing::error;

/// One mutating call's outcome, chained into a tamper-evident JSONL log.
#[derive(Debug, Clone, Copy)]
pub struct AuditEvent<'a> {
    pub action: &'a str,
    pub attempt_id: Option<&'a str>,
    pub account_id: Option<&'a str>,
    pub status: u16,
    pub outcome: &'a str,
    pub reason: &'a str,
}

const AUDIT_CHAIN_GENESIS_HASH: &str =
    "0000000000000000000000000000000000000000000000000000000000000000";

#[derive(Debug, Clone, Serialize, Deserialize)]
struct AuditRecord {
    seq: u64,
    ts_unix_ms: u64,
    service: String,
    action: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    attempt_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    account_id: Option<String>,
    status: u16,
    outcome: String,
    reason: String,
    prev_hash: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    hash: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct AuditChainState {
    next_seq: u64,
    last_hash: String,
}

impl Default for AuditChainState {
    fn default() -> Self {
        Self {
            next_seq: 1,
            last_hash: AUDIT_CHAIN_GENESIS_HASH.to_string(),
        }
    }
}

/// Best-effort: an audit write failure is reported, never propagated into
/// the request outcome.
pub fn emit_audit_event(audit_log_path: Option<&str>, event: AuditEvent<'_>) -> bool {
    let Some(path) = audit_log_path else {
        return true;
    };
    match append_audit_record(path, &event, unix_timestamp_millis()) {
        Ok(()) => true,
        Err(err) => {
            error!(%err, "telemetry audit write failed");
            false
        }
    }
}

pub fn append_audit_record(
    path: &str,
    event: &AuditEvent<'_>,
    timestamp_ms: u64,
) -> Result<(), String> {
    if let Some(parent) = Path::new(path).parent()
        && !parent.as_os_str().is_empty()
    {
        create_dir_all(parent).map_err(|e| format!("creating audit directory failed: {e}"))?;
    }
    let mut chain_states = audit_chain_states()
        .lock()
        .map_err(|_| "acquiring audit chain lock failed".to_string())?;
    let state = if let Some(existing) = chain_states.get(path).cloned() {
        existing
    } else {
        let loaded = load_audit_chain_state(path)?;
        chain_states.insert(path.to_string(), loaded.clone());
        loaded
    };

    let mut record = AuditRecord {
        seq: state.next_seq,
        ts_unix_ms: timestamp_ms,
        service: "telemetry-ingestion".to_string(),
        action: event.action.to_string(),
        attempt_id: event.attempt_id.map(str::to_string),
        account_id: event.account_id.map(str::to_string),
        status: event.status,
        outcome: event.outcome.to_string(),
        reason: event.reason.to_string(),
        prev_hash: state.last_hash.clone(),
        hash: None,
    };
    let canonical =
        serde_json::to_string(&record).map_err(|e| format!("encoding audit record failed: {e}"))?;
    let hash = sha256_hex(canonical.as_bytes());
    record.hash = Some(hash.clone());
    let payload =
        serde_json::to_string(&record).map_err(|e| format!("encoding audit record failed: {e}"))?;

    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| format!("opening audit file failed: {e}"))?;
    writeln!(file, "{payload}").map_err(|e| format!("appending audit file failed: {e}"))?;

    chain_states.insert(
        path.to_string(),
        AuditChainState {
            next_seq: state.next_seq.saturating_add(1),
            last_hash: hash,
        },
    );
    Ok(())
}

/// Walk the chain and recompute every hash. Returns the number of verified
/// records; any break in the chain is an error naming the sequence number.
pub fn verify_audit_chain(path: &str) -> Result<usize, String> {
    let file = OpenOptions::new()
        .read(true)
        .open(path)
        .map_err(|e| format!("opening audit file failed: {e}"))?;
    let mut expected_prev = AUDIT_CHAIN_GENESIS_HASH.to_string();
    let mut verified = 0;
    for line in BufReader::new(file).lines() {
        let line = line.map_err(|e| format!("reading audit file failed: {e}"))?;
        if line.trim().is_empty() {
            continue;
        }
        let mut record: AuditRecord =
            serde_json::from_str(&line).map_err(|e| format!("decoding audit record failed: {e}"))?;
        let Some(recorded_hash) = record.hash.take() else {
            return Err(format!("audit record {} is missing its hash", record.seq));
        };
        if record.prev_hash != expected_prev {
            return Err(format!("audit chain broken before record {}", record.seq));
        }
        let canonical = serde_json::to_string(&record)
            .map_err(|e| format!("encoding audit record failed: {e}"))?;
        if sha256_hex(canonical.as_bytes()) != recorded_hash {
            return Err(format!("audit record {} hash mismatch", record.seq));
        }
        expected_prev = recorded_hash;
        verified += 1;
    }
    Ok(verified)
}

fn audit_chain_states() -> &'static Mutex<HashMap<String, AuditChainState>> {
    static STATES: OnceLock<Mutex<HashMap<String, AuditChainState>>> = OnceLock::new();
    STATES.get_or_init(|| Mutex::new(HashMap::new()))
}

#[cfg(test)]
pub(crate) fn clear_cached_audit_chain_state(path: &str) {
    if let Ok(mut states) = audit_chain_states().lock() {
        states.remove(path);
    }
}

fn load_audit_chain_state(path: &str) -> Result<AuditChainState, String> {
    if !Path::new(path).exists() {
        return Ok(AuditChainState::default());
    }
    let file = OpenOptions::new()
        .read(true)
        .open(path)
        .map_err(|e| format!("opening audit file failed: {e}"))?;
    let mut last_line: Option<String> = None;
    for line in BufReader::new(file).lines() {
        let line = line.map_err(|e| format!("reading audit file failed: {e}"))?;
        if !line.trim().is_empty() {
            last_line = Some(line);
        }
    }
    let Some(last_line) = last_line else {
        return Ok(AuditChainState::default());
    };
    let record: AuditRecord = serde_json::from_str(&last_line)
        .map_err(|e| format!("decoding audit record failed: {e}"))?;
    let hash = record
        .hash
        .ok_or_else(|| format!("audit record {} is missing its hash", record.seq))?;
    Ok(AuditChainState {
        next_seq: record.seq.saturating_add(1),
        last_hash: hash,
    })
}
