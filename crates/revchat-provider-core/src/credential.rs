use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;

/// Tri-state validity. `Unknown` credentials are admissible but get probed
/// lazily on the next acquisition sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Validity {
    Unknown,
    Valid,
    Invalid,
}

/// Upstream-reported quota. Only set when the back-end actually reports it
/// (Grok.com does via `/rest/rate-limits`); absent means "unknown, assume
/// available".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Quota {
    pub remaining: u32,
    pub total: u32,
    pub window_seconds: u64,
}

/// One pool entry: opaque secret material plus its tracked lifecycle state.
///
/// `secret` is either a plain cookie string or a structured token set,
/// depending on the back-end. `extra` carries back-end-specific metadata
/// such as the resolved account email or username.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Credential {
    pub id: i64,
    pub secret: Value,
    pub validity: Validity,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quota: Option<Quota>,
    #[serde(default, with = "time::serde::rfc3339::option", skip_serializing_if = "Option::is_none")]
    pub cooldown_until: Option<OffsetDateTime>,
    #[serde(default, with = "time::serde::rfc3339::option", skip_serializing_if = "Option::is_none")]
    pub last_used: Option<OffsetDateTime>,
    #[serde(default, with = "time::serde::rfc3339::option", skip_serializing_if = "Option::is_none")]
    pub last_validated_at: Option<OffsetDateTime>,
    #[serde(default)]
    pub usage_count: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub invalid_reason: Option<String>,
    #[serde(default)]
    pub extra: Value,
}

impl Credential {
    pub fn new(id: i64, secret: Value) -> Self {
        Self {
            id,
            secret,
            validity: Validity::Unknown,
            quota: None,
            cooldown_until: None,
            last_used: None,
            last_validated_at: None,
            usage_count: 0,
            invalid_reason: None,
            extra: Value::Null,
        }
    }

    pub fn is_cooling(&self, now: OffsetDateTime) -> bool {
        self.cooldown_until.is_some_and(|until| until > now)
    }

    pub fn needs_validation(&self, now: OffsetDateTime, interval: Duration) -> bool {
        if self.validity == Validity::Unknown {
            return true;
        }
        match self.last_validated_at {
            Some(at) => (now - at).whole_seconds() >= interval.as_secs() as i64,
            None => true,
        }
    }

    /// Truncated secret for log lines. Never log the full material.
    pub fn secret_preview(&self) -> String {
        let raw = match &self.secret {
            Value::String(s) => s.as_str(),
            other => other
                .get("cookie")
                .and_then(Value::as_str)
                .unwrap_or("<structured>"),
        };
        let preview: String = raw.chars().take(20).collect();
        if raw.chars().count() > 20 {
            format!("{preview}...")
        } else {
            preview
        }
    }

    pub fn identity(&self) -> Option<&str> {
        self.extra.get("identity").and_then(Value::as_str)
    }
}

/// Persisted pool view: the full ordered credential list. The rotation
/// cursor is runtime state and deliberately not part of the snapshot.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PoolSnapshot {
    pub credentials: Vec<Credential>,
}

impl PoolSnapshot {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn from_secrets(secrets: Vec<Value>) -> Self {
        Self {
            credentials: secrets
                .into_iter()
                .enumerate()
                .map(|(i, secret)| Credential::new(i as i64, secret))
                .collect(),
        }
    }
}
