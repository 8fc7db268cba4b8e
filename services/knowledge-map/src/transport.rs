use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use auth::{AccessDecision, authorize_attempt_access};
use graph::GraphError;
use serde::Serialize;

use crate::{
    api::{ErrorResponse, GlobalMapResponse, StudentMapResponse},
    service::KnowledgeMapRuntime,
};

pub type SharedRuntime = Arc<Mutex<KnowledgeMapRuntime>>;

pub const MAX_HTTP_BODY_BYTES: usize = 64 * 1024;

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
                Err(_) => "atlas_kmap_metrics_unavailable 1\n".to_string(),
            };
            HttpResponse::ok_text(body)
        }
        ("GET", "/v1/knowledge-map/global") => handle_global_map(runtime, request),
        (_, "/v1/knowledge-map/global") | (_, "/health") | (_, "/metrics") => {
            HttpResponse::error(405, ErrorResponse::new("only GET is supported"))
        }
        (method, _) => {
            if let Some(student_id) = path.strip_prefix("/v1/knowledge-map/students/") {
                return match method {
                    "GET" => handle_student_map(runtime, request, student_id),
                    _ => HttpResponse::error(405, ErrorResponse::new("only GET is supported")),
                };
            }
            HttpResponse::error(404, ErrorResponse::new("unknown path"))
        }
    }
}

/// Aggregate curriculum view; administrative audience only.
fn handle_global_map(runtime: &SharedRuntime, request: &HttpRequest) -> HttpResponse {
    let Ok(mut guard) = runtime.lock() else {
        return HttpResponse::error(
            500,
            ErrorResponse::new("failed to acquire knowledge-map runtime lock"),
        );
    };
    let context = match guard.session_policy().authenticate(bearer_token(request)) {
        Ok(context) => context,
        Err(err) => {
            guard.observe_auth_failure();
            return HttpResponse::error(401, ErrorResponse::new(err.to_string()));
        }
    };
    if !context.is_admin() {
        guard.observe_authz_denied();
        return HttpResponse::error(
            403,
            ErrorResponse::new("the global knowledge map is an administrative view"),
        );
    }

    match guard.global_map() {
        Ok((nodes, edges)) => HttpResponse::ok_json(json_body(&GlobalMapResponse {
            success: true,
            nodes,
            edges,
        })),
        Err(err) => graph_error_response(&err),
    }
}

/// Per-student view with fog-of-war masking; visible to that learner and to
/// admins.
fn handle_student_map(
    runtime: &SharedRuntime,
    request: &HttpRequest,
    student_id: &str,
) -> HttpResponse {
    if student_id.trim().is_empty() {
        return HttpResponse::error(400, ErrorResponse::new("student id is required"));
    }
    let Ok(mut guard) = runtime.lock() else {
        return HttpResponse::error(
            500,
            ErrorResponse::new("failed to acquire knowledge-map runtime lock"),
        );
    };
    let context = match guard.session_policy().authenticate(bearer_token(request)) {
        Ok(context) => context,
        Err(err) => {
            guard.observe_auth_failure();
            return HttpResponse::error(401, ErrorResponse::new(err.to_string()));
        }
    };
    // Same tri-modal rule as attempt access: self, active learner, or admin.
    if let AccessDecision::Forbidden(_) = authorize_attempt_access(&context, student_id) {
        guard.observe_authz_denied();
        return HttpResponse::error(
            403,
            ErrorResponse::new("caller may not view this learner's map"),
        );
    }

    match guard.student_map(student_id) {
        Ok((nodes, edges)) => HttpResponse::ok_json(json_body(&StudentMapResponse {
            success: true,
            student_id: student_id.to_string(),
            nodes,
            edges,
        })),
        Err(err) => graph_error_response(&err),
    }
}

fn graph_error_response(err: &GraphError) -> HttpResponse {
    // Cycles and dangling edges are data-integrity faults in the curriculum
    // content, not caller mistakes.
    HttpResponse::error(
        500,
        ErrorResponse::new(format!("competency graph integrity error: {err}")),
    )
}

fn bearer_token(request: &HttpRequest) -> Option<&str> {
    if let Some(value) = request.headers.get("x-session-token") {
        return Some(value.as_str());
    }
    let value = request.headers.get("authorization")?;
    value.strip_prefix("Bearer ").map(str::trim)
}

fn split_target(target: &str) -> String {
    target
        .split_once('?')
        .map(|(path, _)| path)
        .unwrap_or(target)
        .to_string()
}
