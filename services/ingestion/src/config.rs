use std::time::Duration;

use crate::rate_limit::RateLimitPolicy;

pub const DEFAULT_BIND_ADDR: &str = "127.0.0.1:8081";
pub const DEFAULT_BATCH_MAX_EVENTS: usize = 500;
const DEFAULT_BATCH_RATE_MAX_CALLS: u32 = 60;
const DEFAULT_BATCH_RATE_WINDOW_SECS: u64 = 60;
const DEFAULT_FINALIZE_RATE_MAX_CALLS: u32 = 5;
const DEFAULT_FINALIZE_RATE_WINDOW_SECS: u64 = 60;

pub fn env_opt(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

pub fn parse_env_usize(key: &str) -> Option<usize> {
    env_opt(key).and_then(|value| value.parse().ok())
}

pub fn parse_env_u32(key: &str) -> Option<u32> {
    env_opt(key).and_then(|value| value.parse().ok())
}

pub fn parse_env_u64(key: &str) -> Option<u64> {
    env_opt(key).and_then(|value| value.parse().ok())
}

pub fn resolve_bind_addr() -> String {
    env_opt("ATLAS_TELEMETRY_BIND").unwrap_or_else(|| DEFAULT_BIND_ADDR.to_string())
}

pub fn resolve_batch_max_events() -> usize {
    parse_env_usize("ATLAS_TELEMETRY_BATCH_MAX_EVENTS")
        .filter(|value| *value > 0)
        .unwrap_or(DEFAULT_BATCH_MAX_EVENTS)
}

pub fn resolve_batch_rate_policy() -> RateLimitPolicy {
    RateLimitPolicy::new(
        parse_env_u32("ATLAS_TELEMETRY_RATE_MAX_CALLS")
            .filter(|value| *value > 0)
            .unwrap_or(DEFAULT_BATCH_RATE_MAX_CALLS),
        Duration::from_secs(
            parse_env_u64("ATLAS_TELEMETRY_RATE_WINDOW_SECS")
                .filter(|value| *value > 0)
                .unwrap_or(DEFAULT_BATCH_RATE_WINDOW_SECS),
        ),
    )
}

pub fn resolve_finalize_rate_policy() -> RateLimitPolicy {
    RateLimitPolicy::new(
        parse_env_u32("ATLAS_TELEMETRY_FINALIZE_RATE_MAX_CALLS")
            .filter(|value| *value > 0)
            .unwrap_or(DEFAULT_FINALIZE_RATE_MAX_CALLS),
        Duration::from_secs(
            parse_env_u64("ATLAS_TELEMETRY_FINALIZE_RATE_WINDOW_SECS")
                .filter(|value| *value > 0)
                .unwrap_or(DEFAULT_FINALIZE_RATE_WINDOW_SECS),
        ),
    )
}

pub fn resolve_http_workers() -> usize {
    parse_env_usize("ATLAS_TELEMETRY_HTTP_WORKERS")
        .filter(|value| *value > 0)
        .unwrap_or(4)
}
