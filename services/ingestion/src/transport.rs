use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::Instant,
};

use auth::{AccessDecision, authorize_attempt_access};
use evaluation::EvaluationError;
use schema::DeviceClass;
use serde::Serialize;
use store::StoreError;

use crate::{
    api::{
        CreateAttemptRequest, CreateAttemptResponse, ErrorResponse, ExamStateResponse,
        FinalizeResponse, TelemetryBatchRequest, TelemetryBatchResponse,
    },
    audit::{AuditEvent, emit_audit_event},
    service::IngestionRuntime,
};

pub type SharedRuntime = Arc<Mutex<IngestionRuntime>>;

pub const MAX_HTTP_BODY_BYTES: usize = 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpRequest {
    pub method: String,
    pub target: String,
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    pub content_type: &'static str,
    pub body: String,
}

impl HttpResponse {
    pub fn ok_json(body: String) -> Self {
        Self {
            status: 200,
            content_type: "application/json",
            body,
        }
    }

    pub fn ok_text(body: String) -> Self {
        Self {
            status: 200,
            content_type: "text/plain; version=0.0.4; charset=utf-8",
            body,
        }
    }

    pub fn error(status: u16, error: ErrorResponse) -> Self {
        Self {
            status,
            content_type: "application/json",
            body: json_body(&error),
        }
    }

    pub fn bad_request(message: &str) -> Self {
        Self::error(400, ErrorResponse::new(message))
    }

    pub fn unauthorized(message: &str) -> Self {
        Self::error(401, ErrorResponse::new(message))
    }

    pub fn forbidden(message: &str) -> Self {
        Self::error(403, ErrorResponse::new(message))
    }

    pub fn not_found(message: &str) -> Self {
        Self::error(404, ErrorResponse::new(message))
    }

    pub fn method_not_allowed(message: &str) -> Self {
        Self::error(405, ErrorResponse::new(message))
    }

    pub fn conflict(message: &str) -> Self {
        Self::error(409, ErrorResponse::new(message))
    }

    pub fn rate_limited(retry_after_ms: u64) -> Self {
        Self::error(429, ErrorResponse::rate_limited(retry_after_ms))
    }

    pub fn internal_server_error(message: &str) -> Self {
        Self::error(500, ErrorResponse::new(message))
    }
}

fn json_body<T: Serialize>(value: &T) -> String {
    serde_json::to_string(value)
        .unwrap_or_else(|_| "{\"success\":false,\"error\":\"encoding failure\"}".to_string())
}

pub fn handle_request(runtime: &SharedRuntime, request: &HttpRequest) -> HttpResponse {
    let path = split_target(&request.target);
    match (request.method.as_str(), path.as_str()) {
        ("GET", "/health") => HttpResponse::ok_json("{\"status\":\"ok\"}".to_string()),
        ("GET", "/metrics") => {
            let body = match runtime.lock() {
                Ok(guard) => guard.metrics_text(),
                Err(_) => "atlas_telemetry_metrics_unavailable 1\n".to_string(),
            };
            HttpResponse::ok_text(body)
        }
        ("POST", "/v1/telemetry/batch") => handle_telemetry_batch(runtime, request),
        ("POST", "/v1/attempts") => handle_create_attempt(runtime, request),
        (_, "/v1/telemetry/batch") | (_, "/v1/attempts") => {
            HttpResponse::method_not_allowed("only POST is supported")
        }
        (_, "/health") | (_, "/metrics") => HttpResponse::method_not_allowed("only GET is supported"),
        (method, _) => {
            if let Some(rest) = path.strip_prefix("/v1/attempts/") {
                if let Some(attempt_id) = rest.strip_suffix("/state") {
                    return match method {
                        "GET" => handle_exam_state(runtime, request, attempt_id),
                        _ => HttpResponse::method_not_allowed("only GET is supported"),
                    };
                }
                if let Some(attempt_id) = rest.strip_suffix("/finalize") {
                    return match method {
                        "POST" => handle_finalize(runtime, request, attempt_id),
                        _ => HttpResponse::method_not_allowed("only POST is supported"),
                    };
                }
            }
            HttpResponse::not_found("unknown path")
        }
    }
}

/// §submitTelemetryBatch — gate order is fixed and fail closed: schema
/// validation, rate limit, authentication, ownership, then the double write.
fn handle_telemetry_batch(runtime: &SharedRuntime, request: &HttpRequest) -> HttpResponse {
    if let Some(response) = reject_non_json(request, "POST /v1/telemetry/batch") {
        return response;
    }
    let batch: TelemetryBatchRequest = match decode_body(request) {
        Ok(batch) => batch,
        Err(response) => return response,
    };
    if batch.attempt_id.trim().is_empty() {
        return HttpResponse::bad_request("attempt_id is required");
    }

    let caller_key = rate_limit_key(request);
    let device_class = device_class_of(request);

    let mut audit_status = 500;
    let mut audit_outcome = "error";
    let mut audit_reason = "runtime lock unavailable".to_string();
    let mut audit_account: Option<String> = None;

    let response = 'gates: {
        let mut guard = match runtime.lock() {
            Ok(guard) => guard,
            Err(_) => {
                break 'gates HttpResponse::internal_server_error(
                    "failed to acquire ingestion runtime lock",
                );
            }
        };

        if batch.events.len() > guard.batch_max_events() {
            audit_status = 400;
            audit_outcome = "denied";
            audit_reason = format!(
                "batch exceeds {} events",
                guard.batch_max_events()
            );
            guard.observe_batch_rejected();
            break 'gates HttpResponse::bad_request(&audit_reason);
        }

        if let Err(retry_after_ms) = guard.check_batch_rate(&caller_key, Instant::now()) {
            audit_status = 429;
            audit_outcome = "rate_limited";
            audit_reason = format!("retry after {retry_after_ms} ms");
            break 'gates HttpResponse::rate_limited(retry_after_ms);
        }

        let context = match guard.session_policy().authenticate(bearer_token(request)) {
            Ok(context) => context,
            Err(err) => {
                audit_status = 401;
                audit_outcome = "denied";
                audit_reason = err.to_string();
                guard.observe_auth_failure();
                guard.observe_batch_rejected();
                break 'gates HttpResponse::unauthorized(&audit_reason);
            }
        };
        audit_account = Some(context.account_id.clone());

        let Some(owner_id) = guard.attempt_owner(&batch.attempt_id) else {
            audit_status = 404;
            audit_outcome = "denied";
            audit_reason = "attempt not found".to_string();
            guard.observe_batch_rejected();
            break 'gates HttpResponse::not_found(&audit_reason);
        };

        if let AccessDecision::Forbidden(reason) = authorize_attempt_access(&context, &owner_id) {
            audit_status = 403;
            audit_outcome = "denied";
            audit_reason = reason.to_string();
            guard.observe_authz_denied();
            guard.observe_batch_rejected();
            break 'gates HttpResponse::forbidden(reason);
        }

        match guard.submit_batch(&batch.attempt_id, &batch.events, device_class) {
            Ok(stats) => {
                audit_status = 200;
                audit_outcome = "success";
                audit_reason = format!(
                    "accepted {} events ({} answers)",
                    stats.appended, stats.answers_folded
                );
                HttpResponse::ok_json(json_body(&TelemetryBatchResponse {
                    success: true,
                    appended: stats.appended,
                    answers_folded: stats.answers_folded,
                }))
            }
            Err(err) => {
                guard.observe_batch_rejected();
                let (status, message) = map_store_error(&err);
                audit_status = status;
                audit_reason = message.clone();
                HttpResponse::error(status, ErrorResponse::new(message))
            }
        }
    };

    record_audit(
        runtime,
        AuditEvent {
            action: "telemetry_batch",
            attempt_id: Some(&batch.attempt_id),
            account_id: audit_account.as_deref(),
            status: audit_status,
            outcome: audit_outcome,
            reason: &audit_reason,
        },
    );
    response
}

fn handle_create_attempt(runtime: &SharedRuntime, request: &HttpRequest) -> HttpResponse {
    if let Some(response) = reject_non_json(request, "POST /v1/attempts") {
        return response;
    }
    let create: CreateAttemptRequest = match decode_body(request) {
        Ok(create) => create,
        Err(response) => return response,
    };
    if create.exam_id.trim().is_empty() {
        return HttpResponse::bad_request("exam_id is required");
    }

    let mut audit_status = 500;
    let mut audit_outcome = "error";
    let mut audit_reason = "runtime lock unavailable".to_string();
    let mut audit_account: Option<String> = None;
    let mut audit_attempt: Option<String> = None;

    let response = 'gates: {
        let mut guard = match runtime.lock() {
            Ok(guard) => guard,
            Err(_) => {
                break 'gates HttpResponse::internal_server_error(
                    "failed to acquire ingestion runtime lock",
                );
            }
        };

        let context = match guard.session_policy().authenticate(bearer_token(request)) {
            Ok(context) => context,
            Err(err) => {
                audit_status = 401;
                audit_outcome = "denied";
                audit_reason = err.to_string();
                guard.observe_auth_failure();
                break 'gates HttpResponse::unauthorized(&audit_reason);
            }
        };
        audit_account = Some(context.account_id.clone());

        let owner_id = create
            .owner_id
            .clone()
            .or_else(|| context.active_learner_id.clone())
            .unwrap_or_else(|| context.account_id.clone());
        if let AccessDecision::Forbidden(_) = authorize_attempt_access(&context, &owner_id) {
            audit_status = 403;
            audit_outcome = "denied";
            audit_reason = "cannot create attempts for another learner".to_string();
            guard.observe_authz_denied();
            break 'gates HttpResponse::forbidden(&audit_reason);
        }

        match guard.create_attempt(&create.exam_id, &owner_id) {
            Ok(attempt) => {
                audit_status = 200;
                audit_outcome = "success";
                audit_reason = "attempt created".to_string();
                audit_attempt = Some(attempt.attempt_id.clone());
                HttpResponse::ok_json(json_body(&CreateAttemptResponse {
                    success: true,
                    attempt_id: attempt.attempt_id,
                    exam_id: attempt.exam_id,
                    owner_id: attempt.owner_id,
                    status: attempt.status,
                }))
            }
            Err(err) => {
                let (status, message) = map_store_error(&err);
                audit_status = status;
                audit_reason = message.clone();
                HttpResponse::error(status, ErrorResponse::new(message))
            }
        }
    };

    record_audit(
        runtime,
        AuditEvent {
            action: "create_attempt",
            attempt_id: audit_attempt.as_deref(),
            account_id: audit_account.as_deref(),
            status: audit_status,
            outcome: audit_outcome,
            reason: &audit_reason,
        },
    );
    response
}

/// §getExamState — resume support: the snapshot alone is enough to restore
/// the client without replaying the forensic log.
fn handle_exam_state(
    runtime: &SharedRuntime,
    request: &HttpRequest,
    attempt_id: &str,
) -> HttpResponse {
    let Ok(guard) = runtime.lock() else {
        return HttpResponse::internal_server_error("failed to acquire ingestion runtime lock");
    };
    let context = match guard.session_policy().authenticate(bearer_token(request)) {
        Ok(context) => context,
        Err(err) => return HttpResponse::unauthorized(&err.to_string()),
    };
    let Some(attempt) = guard.store().attempt_by_id(attempt_id) else {
        return HttpResponse::not_found("attempt not found");
    };
    if let AccessDecision::Forbidden(reason) = authorize_attempt_access(&context, &attempt.owner_id)
    {
        return HttpResponse::forbidden(reason);
    }
    HttpResponse::ok_json(json_body(&ExamStateResponse {
        success: true,
        attempt_id: attempt_id.to_string(),
        current_state: attempt.current_state.clone(),
    }))
}

/// §finalizeAttempt — strict rate limit, ownership, then the idempotent
/// evaluation pass.
fn handle_finalize(
    runtime: &SharedRuntime,
    request: &HttpRequest,
    attempt_id: &str,
) -> HttpResponse {
    let caller_key = rate_limit_key(request);

    let mut audit_status = 500;
    let mut audit_outcome = "error";
    let mut audit_reason = "runtime lock unavailable".to_string();
    let mut audit_account: Option<String> = None;

    let response = 'gates: {
        let mut guard = match runtime.lock() {
            Ok(guard) => guard,
            Err(_) => {
                break 'gates HttpResponse::internal_server_error(
                    "failed to acquire ingestion runtime lock",
                );
            }
        };

        if let Err(retry_after_ms) = guard.check_finalize_rate(&caller_key, Instant::now()) {
            audit_status = 429;
            audit_outcome = "rate_limited";
            audit_reason = format!("retry after {retry_after_ms} ms");
            break 'gates HttpResponse::rate_limited(retry_after_ms);
        }

        let context = match guard.session_policy().authenticate(bearer_token(request)) {
            Ok(context) => context,
            Err(err) => {
                audit_status = 401;
                audit_outcome = "denied";
                audit_reason = err.to_string();
                guard.observe_auth_failure();
                break 'gates HttpResponse::unauthorized(&audit_reason);
            }
        };
        audit_account = Some(context.account_id.clone());

        let Some(owner_id) = guard.attempt_owner(attempt_id) else {
            audit_status = 404;
            audit_outcome = "denied";
            audit_reason = "attempt not found".to_string();
            break 'gates HttpResponse::not_found(&audit_reason);
        };
        if let AccessDecision::Forbidden(reason) = authorize_attempt_access(&context, &owner_id) {
            audit_status = 403;
            audit_outcome = "denied";
            audit_reason = reason.to_string();
            guard.observe_authz_denied();
            break 'gates HttpResponse::forbidden(reason);
        }

        match guard.finalize(attempt_id) {
            Ok(outcome) => {
                audit_status = 200;
                audit_outcome = "success";
                audit_reason = if outcome.already_completed {
                    "already completed; cache returned".to_string()
                } else {
                    "attempt finalized".to_string()
                };
                HttpResponse::ok_json(json_body(&FinalizeResponse {
                    success: true,
                    already_completed: outcome.already_completed,
                    result: outcome.result,
                }))
            }
            Err(err) => {
                let (status, message) = map_evaluation_error(&err);
                audit_status = status;
                audit_reason = message.clone();
                HttpResponse::error(status, ErrorResponse::new(message))
            }
        }
    };

    record_audit(
        runtime,
        AuditEvent {
            action: "finalize",
            attempt_id: Some(attempt_id),
            account_id: audit_account.as_deref(),
            status: audit_status,
            outcome: audit_outcome,
            reason: &audit_reason,
        },
    );
    response
}

// ---------------------------------------------------------------------------
// Shared request plumbing
// ---------------------------------------------------------------------------

fn record_audit(runtime: &SharedRuntime, event: AuditEvent<'_>) {
    let audit_log_path = runtime
        .lock()
        .ok()
        .and_then(|guard| guard.audit_log_path().map(str::to_string));
    let write_ok = emit_audit_event(audit_log_path.as_deref(), event);
    if let Ok(mut guard) = runtime.lock() {
        guard.observe_audit_event(write_ok);
    }
}

fn reject_non_json(request: &HttpRequest, endpoint: &str) -> Option<HttpResponse> {
    if let Some(content_type) = request.headers.get("content-type")
        && !content_type
            .to_ascii_lowercase()
            .contains("application/json")
    {
        return Some(HttpResponse::bad_request(&format!(
            "content-type must include application/json for {endpoint}"
        )));
    }
    None
}

fn decode_body<T: serde::de::DeserializeOwned>(
    request: &HttpRequest,
) -> Result<T, HttpResponse> {
    let body = std::str::from_utf8(&request.body)
        .map_err(|_| HttpResponse::bad_request("request body must be valid UTF-8"))?;
    serde_json::from_str(body)
        .map_err(|err| HttpResponse::bad_request(&format!("malformed request body: {err}")))
}

fn bearer_token(request: &HttpRequest) -> Option<&str> {
    if let Some(value) = request.headers.get("x-session-token") {
        return Some(value.as_str());
    }
    let value = request.headers.get("authorization")?;
    value.strip_prefix("Bearer ").map(str::trim)
}

/// Rate limits key on the session token when presented, else the forwarded
/// client address, else one shared anonymous bucket.
fn rate_limit_key(request: &HttpRequest) -> String {
    if let Some(token) = bearer_token(request) {
        return format!("token:{token}");
    }
    if let Some(addr) = request.headers.get("x-forwarded-for") {
        let first = addr.split(',').next().unwrap_or(addr).trim();
        if !first.is_empty() {
            return format!("addr:{first}");
        }
    }
    "anonymous".to_string()
}

fn device_class_of(request: &HttpRequest) -> Option<DeviceClass> {
    request
        .headers
        .get("user-agent")
        .map(|raw| DeviceClass::from_user_agent(raw))
}

fn map_store_error(error: &StoreError) -> (u16, String) {
    match error {
        StoreError::Validation(err) => (400, format!("validation error: {err}")),
        StoreError::UnknownExam(exam_id) => (404, format!("exam not found: {exam_id}")),
        StoreError::UnknownAttempt(attempt_id) => {
            (404, format!("attempt not found: {attempt_id}"))
        }
        StoreError::AttemptCompleted(attempt_id) => (
            409,
            format!("attempt already completed: {attempt_id}"),
        ),
        StoreError::Conflict(message) => (409, message.clone()),
        StoreError::Io(message) | StoreError::Parse(message) => {
            (500, format!("internal persistence error: {message}"))
        }
    }
}

fn map_evaluation_error(error: &EvaluationError) -> (u16, String) {
    match error {
        EvaluationError::UnknownAttempt(attempt_id) => {
            (404, format!("attempt not found: {attempt_id}"))
        }
        EvaluationError::UnknownExam(exam_id) => (409, format!("exam not found: {exam_id}")),
        EvaluationError::LedgerUnavailable(attempt_id) => (
            500,
            format!("forensic log unavailable for attempt: {attempt_id}"),
        ),
        EvaluationError::Store(err) => map_store_error(err),
    }
}

fn split_target(target: &str) -> String {
    target
        .split_once('?')
        .map(|(path, _)| path)
        .unwrap_or(target)
        .to_string()
}
