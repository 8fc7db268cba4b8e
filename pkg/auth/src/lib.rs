use std::collections::{HashMap, HashSet};

use sha2::{Digest, Sha256};
use thiserror::Error;

// ---------------------------------------------------------------------------
// Caller identity
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Learner,
    Admin,
}

/// The authenticated caller of a service request. `active_learner_id` is the
/// currently-active learner-session identity, which in the surrounding
/// product can be a cookie-scoped identity distinct from the account itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthContext {
    pub account_id: String,
    pub active_learner_id: Option<String>,
    pub roles: HashSet<Role>,
}

impl AuthContext {
    pub fn is_admin(&self) -> bool {
        self.roles.contains(&Role::Admin)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    #[error("missing bearer token")]
    MissingToken,
    #[error("unknown or revoked token")]
    UnknownToken,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AccessDecision {
    Allowed,
    Forbidden(&'static str),
}

// ---------------------------------------------------------------------------
// Session-token policy
// ---------------------------------------------------------------------------

/// Token registry standing in for the external session layer. Parsed from an
/// env string of the form
/// `token:account[:learner=<id>][:roles=admin,learner];token2:...`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SessionPolicy {
    sessions: HashMap<String, AuthContext>,
}

impl SessionPolicy {
    pub fn from_env(raw: Option<&str>) -> Self {
        let mut sessions = HashMap::new();
        let Some(raw) = raw else {
            return Self { sessions };
        };
        for entry in raw.split(';') {
            let entry = entry.trim();
            if entry.is_empty() {
                continue;
            }
            let mut parts = entry.split(':');
            let (Some(token), Some(account)) = (parts.next(), parts.next()) else {
                continue;
            };
            let token = token.trim();
            let account = account.trim();
            if token.is_empty() || account.is_empty() {
                continue;
            }
            let mut context = AuthContext {
                account_id: account.to_string(),
                active_learner_id: None,
                roles: HashSet::from([Role::Learner]),
            };
            for extra in parts {
                if let Some(learner) = extra.strip_prefix("learner=") {
                    let learner = learner.trim();
                    if !learner.is_empty() {
                        context.active_learner_id = Some(learner.to_string());
                    }
                } else if let Some(roles) = extra.strip_prefix("roles=") {
                    context.roles = parse_roles(roles);
                }
            }
            sessions.insert(token.to_string(), context);
        }
        Self { sessions }
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Resolve a presented bearer token to the caller identity. An empty
    /// registry rejects every caller: authentication fails closed.
    pub fn authenticate(&self, bearer_token: Option<&str>) -> Result<AuthContext, AuthError> {
        let token = bearer_token
            .map(str::trim)
            .filter(|token| !token.is_empty())
            .ok_or(AuthError::MissingToken)?;
        self.sessions
            .get(token)
            .cloned()
            .ok_or(AuthError::UnknownToken)
    }
}

fn parse_roles(raw: &str) -> HashSet<Role> {
    let mut roles = HashSet::new();
    for value in raw.split(',') {
        match value.trim() {
            "admin" => {
                roles.insert(Role::Admin);
            }
            "learner" => {
                roles.insert(Role::Learner);
            }
            _ => {}
        }
    }
    if roles.is_empty() {
        roles.insert(Role::Learner);
    }
    roles
}

/// Tri-modal ownership check for attempt access: the caller must be the
/// attempt's owner, or the caller's active learner-session identity must
/// equal the owner, or the caller must hold the admin role.
pub fn authorize_attempt_access(context: &AuthContext, attempt_owner: &str) -> AccessDecision {
    if context.account_id == attempt_owner {
        return AccessDecision::Allowed;
    }
    if context
        .active_learner_id
        .as_deref()
        .is_some_and(|learner| learner == attempt_owner)
    {
        return AccessDecision::Allowed;
    }
    if context.is_admin() {
        return AccessDecision::Allowed;
    }
    AccessDecision::Forbidden("caller does not own this attempt")
}

// ---------------------------------------------------------------------------
// Hashing — audit-chain support
// ---------------------------------------------------------------------------

pub fn sha256_hex(input: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input);
    hex::encode(hasher.finalize())
}
