use std::sync::{Arc, Mutex};
use std::time::Duration;

use rand::Rng;
use serde::Deserialize;
use thiserror::Error;
use time::OffsetDateTime;
use tracing::{info, warn};

use crate::credential::{Credential, PoolSnapshot, Validity};
use crate::provider::CredentialValidator;
use crate::state::StateSink;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RotationStrategy {
    #[default]
    RoundRobin,
    Random,
    LeastUsed,
}

#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub strategy: RotationStrategy,
    /// Applied when the upstream signals a rate limit without naming a window.
    pub default_cooldown: Duration,
    /// Credentials validated longer ago than this are re-probed lazily on the
    /// next acquisition sweep.
    pub validation_interval: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            strategy: RotationStrategy::RoundRobin,
            default_cooldown: Duration::from_secs(60 * 60),
            validation_interval: Duration::from_secs(60 * 60),
        }
    }
}

#[derive(Debug, Clone, Error)]
pub enum AcquireError {
    #[error("no admissible credentials ({invalid} invalid, {cooling} cooling, {total} total)")]
    NoneAvailable {
        total: usize,
        invalid: usize,
        cooling: usize,
    },
}

#[derive(Debug)]
struct PoolState {
    credentials: Vec<Credential>,
    /// Next pool position the round-robin strategy tries.
    cursor: usize,
    /// Counts chats for secondary-mode rotation; unrelated to credential
    /// selection.
    rotation_counter: u64,
}

/// Shared credential pool for one back-end.
///
/// All state transitions go through one mutex and are lock-only; network
/// probes copy the credential out, probe, then reacquire to write results.
/// Every mutation is pushed to the `StateSink` so a restart resumes with
/// known validity.
pub struct CredentialPool {
    backend: String,
    config: PoolConfig,
    state: Mutex<PoolState>,
    sink: Arc<dyn StateSink>,
}

impl CredentialPool {
    pub fn new(
        backend: impl Into<String>,
        config: PoolConfig,
        snapshot: PoolSnapshot,
        sink: Arc<dyn StateSink>,
    ) -> Self {
        let backend = backend.into();
        info!(
            backend = %backend,
            credentials = snapshot.credentials.len(),
            strategy = ?config.strategy,
            "pool ready"
        );
        Self {
            backend,
            config,
            state: Mutex::new(PoolState {
                credentials: snapshot.credentials,
                cursor: 0,
                rotation_counter: 0,
            }),
            sink,
        }
    }

    pub fn backend(&self) -> &str {
        &self.backend
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Select the next admissible credential, excluding `exclude` for this
    /// call only. Expired cooldowns are swept first; invalid credentials are
    /// never returned.
    pub fn acquire(&self, exclude: &[i64]) -> Result<Credential, AcquireError> {
        let now = OffsetDateTime::now_utc();
        let mut state = self.lock();
        let swept = sweep_cooldowns(&mut state.credentials, now);
        if swept {
            self.persist(&state);
        }

        let admissible: Vec<usize> = state
            .credentials
            .iter()
            .enumerate()
            .filter(|(_, cred)| {
                cred.validity != Validity::Invalid
                    && !cred.is_cooling(now)
                    && !exclude.contains(&cred.id)
            })
            .map(|(pos, _)| pos)
            .collect();

        if admissible.is_empty() {
            let total = state.credentials.len();
            let invalid = state
                .credentials
                .iter()
                .filter(|c| c.validity == Validity::Invalid)
                .count();
            let cooling = state
                .credentials
                .iter()
                .filter(|c| c.is_cooling(now))
                .count();
            return Err(AcquireError::NoneAvailable {
                total,
                invalid,
                cooling,
            });
        }

        let pos = match self.config.strategy {
            RotationStrategy::RoundRobin => {
                // Resume from the cursor's position, cyclically; if the
                // cursor no longer points at an admissible entry, the first
                // admissible one past it wins.
                let cursor = state.cursor;
                *admissible
                    .iter()
                    .find(|&&pos| pos >= cursor)
                    .unwrap_or(&admissible[0])
            }
            RotationStrategy::Random => admissible[rand::rng().random_range(0..admissible.len())],
            RotationStrategy::LeastUsed => *admissible
                .iter()
                .min_by_key(|&&pos| (state.credentials[pos].usage_count, pos))
                .unwrap_or(&admissible[0]),
        };

        state.cursor = (pos + 1) % state.credentials.len();
        Ok(state.credentials[pos].clone())
    }

    /// Like `acquire`, but lazily revalidates stale credentials before
    /// handing them out. Entries failing the probe are skipped.
    pub async fn acquire_validated(
        &self,
        exclude: &[i64],
        validator: &dyn CredentialValidator,
    ) -> Result<Credential, AcquireError> {
        let mut skipped: Vec<i64> = exclude.to_vec();
        loop {
            let candidate = self.acquire(&skipped)?;
            let now = OffsetDateTime::now_utc();
            if !candidate.needs_validation(now, self.config.validation_interval) {
                return Ok(candidate);
            }
            if self.revalidate(candidate.id, validator).await
                && let Some(refreshed) = self.get(candidate.id)
                // The probe may have cooled a still-valid credential (zero
                // remaining quota); it is not admissible either way.
                && !refreshed.is_cooling(OffsetDateTime::now_utc())
            {
                return Ok(refreshed);
            }
            // Failed or cooled by the probe; keep it out of this acquisition
            // loop even if a concurrent revalidation restores it.
            skipped.push(candidate.id);
        }
    }

    pub fn report_success(&self, id: i64) {
        let mut state = self.lock();
        if let Some(cred) = find_mut(&mut state.credentials, id) {
            cred.usage_count += 1;
            cred.last_used = Some(OffsetDateTime::now_utc());
            self.persist(&state);
        }
    }

    pub fn report_invalid(&self, id: i64, reason: &str) {
        let backend = self.backend.clone();
        let mut state = self.lock();
        if let Some(cred) = find_mut(&mut state.credentials, id) {
            cred.validity = Validity::Invalid;
            cred.invalid_reason = Some(reason.to_string());
            warn!(backend = %backend, credential_id = id, reason = %reason, "credential invalidated");
            self.persist(&state);
        }
    }

    /// Start a cooldown. `duration: None` applies the configured default;
    /// an explicit value comes from an upstream-supplied window.
    pub fn report_cooldown(&self, id: i64, duration: Option<Duration>) {
        let duration = duration.unwrap_or(self.config.default_cooldown);
        let until = OffsetDateTime::now_utc() + duration;
        let backend = self.backend.clone();
        let mut state = self.lock();
        if let Some(cred) = find_mut(&mut state.credentials, id) {
            cred.cooldown_until = Some(until);
            info!(
                backend = %backend,
                credential_id = id,
                cooldown_secs = duration.as_secs(),
                "credential cooling down"
            );
            self.persist(&state);
        }
    }

    /// Re-probe one credential. The network call happens without the pool
    /// lock; results are written back afterwards.
    pub async fn revalidate(&self, id: i64, validator: &dyn CredentialValidator) -> bool {
        let Some(candidate) = self.get(id) else {
            return false;
        };
        let outcome = validator.probe(&candidate).await;

        let mut state = self.lock();
        let Some(cred) = find_mut(&mut state.credentials, id) else {
            return false;
        };
        let now = OffsetDateTime::now_utc();
        cred.last_validated_at = Some(now);
        if outcome.valid {
            cred.validity = Validity::Valid;
            cred.invalid_reason = None;
            if let Some(quota) = outcome.quota {
                cred.quota = Some(quota);
                // Still a working session, just spent: cool it for the
                // reported window instead of dropping it from the pool.
                if quota.remaining == 0 {
                    cred.cooldown_until =
                        Some(now + Duration::from_secs(quota.window_seconds));
                }
            }
            if let Some(extra) = outcome.extra {
                cred.extra = extra;
            }
            if let Some(identity) = outcome.identity {
                if let Some(map) = cred.extra.as_object_mut() {
                    map.insert("identity".to_string(), identity.clone().into());
                } else {
                    cred.extra = serde_json::json!({ "identity": identity });
                }
            }
        } else {
            cred.validity = Validity::Invalid;
            cred.invalid_reason = Some("probe failed".to_string());
        }
        let valid = outcome.valid;
        self.persist(&state);
        info!(
            backend = %self.backend,
            credential_id = id,
            valid,
            "credential revalidated"
        );
        valid
    }

    /// Bump the chat counter used by secondary-mode rotation.
    pub fn rotation_tick(&self) -> u64 {
        let mut state = self.lock();
        state.rotation_counter += 1;
        state.rotation_counter
    }

    pub fn get(&self, id: i64) -> Option<Credential> {
        self.lock().credentials.iter().find(|c| c.id == id).cloned()
    }

    pub fn snapshot(&self) -> PoolSnapshot {
        PoolSnapshot {
            credentials: self.lock().credentials.clone(),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, PoolState> {
        // A poisoned pool would otherwise wedge every request; the state is
        // still internally consistent after a payload panic.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn persist(&self, state: &PoolState) {
        self.sink.persist(PoolSnapshot {
            credentials: state.credentials.clone(),
        });
    }
}

/// Clear expired cooldowns. Previously-valid credentials become admissible
/// again; invalid ones stay out via their validity flag.
fn sweep_cooldowns(credentials: &mut [Credential], now: OffsetDateTime) -> bool {
    let mut changed = false;
    for cred in credentials.iter_mut() {
        if let Some(until) = cred.cooldown_until
            && until <= now
        {
            cred.cooldown_until = None;
            changed = true;
        }
    }
    changed
}

fn find_mut(credentials: &mut [Credential], id: i64) -> Option<&mut Credential> {
    credentials.iter_mut().find(|c| c.id == id)
}
