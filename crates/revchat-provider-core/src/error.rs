use std::time::Duration;

use thiserror::Error;

/// Request-level error taxonomy. Everything below the orchestrator is
/// recovered locally; callers only ever observe these as terminal events.
#[derive(Debug, Clone, Error)]
pub enum GatewayError {
    #[error("no credentials available: {0}")]
    NoCredentials(String),
    #[error("credential rejected by upstream: {0}")]
    CredentialInvalid(String),
    #[error("upstream rate limited: {0}")]
    RateLimited(String),
    #[error("upstream transport challenge")]
    TransportChallenge,
    #[error("connection error: {0}")]
    Connection(String),
    #[error("upstream protocol error: {0}")]
    Protocol(String),
}

/// Pool state transition requested by a failed attempt.
#[derive(Debug, Clone)]
pub enum PoolMark {
    Invalid {
        reason: String,
    },
    Cooldown {
        /// None means the configured default for the pool.
        duration: Option<Duration>,
        reason: String,
    },
}

/// One failed upstream attempt: the error to surface if retries run out,
/// plus the pool transition (if any) the failure is evidence for.
#[derive(Debug)]
pub struct AttemptFailure {
    pub error: GatewayError,
    pub mark: Option<PoolMark>,
}

impl AttemptFailure {
    pub fn bare(error: GatewayError) -> Self {
        Self { error, mark: None }
    }
}
