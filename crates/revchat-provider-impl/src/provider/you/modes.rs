use std::sync::Mutex;
use std::time::Duration;

use dashmap::DashMap;
use time::OffsetDateTime;
use tracing::info;

pub const CUSTOM_MODE: &str = "custom";

#[derive(Debug, Clone)]
pub struct ModeConfig {
    /// Chats between flips of the preferred mode; 0 disables rotation.
    pub rotation_interval: u64,
    pub cooldown: Duration,
}

impl Default for ModeConfig {
    fn default() -> Self {
        Self {
            rotation_interval: 3,
            cooldown: Duration::from_secs(60 * 60),
        }
    }
}

/// What the registry wants for the next request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModeChoice {
    Custom,
    Agent(String),
    /// Agent mode preferred but no agent exists for this model yet; the
    /// caller may provision one.
    AgentWanted,
}

#[derive(Debug, Clone)]
struct AgentMode {
    id: String,
    valid: bool,
}

/// You.com chat-mode state: the `custom` / `agent:<id>` alternation, the
/// per-model registry of provisioned agents, and per-mode cooldown clocks.
///
/// Mode cooldowns are deliberately decoupled from credential cooldowns: a
/// request can be blocked on mode cooldown while the cookie itself is
/// healthy, and vice versa.
pub struct ModeRegistry {
    config: ModeConfig,
    prefer_agent: Mutex<bool>,
    agents: DashMap<String, AgentMode>,
    cooldowns: DashMap<String, OffsetDateTime>,
}

impl ModeRegistry {
    pub fn new(config: ModeConfig) -> Self {
        Self {
            config,
            prefer_agent: Mutex::new(false),
            agents: DashMap::new(),
            cooldowns: DashMap::new(),
        }
    }

    /// Feed the pool's chat counter; every `rotation_interval` chats the
    /// preferred mode flips between custom and agent.
    pub fn note_rotation(&self, counter: u64) {
        let interval = self.config.rotation_interval;
        if interval == 0 || counter % interval != 0 {
            return;
        }
        let mut prefer_agent = self.prefer_agent.lock().unwrap_or_else(|p| p.into_inner());
        *prefer_agent = !*prefer_agent;
        info!(
            backend = "you",
            prefer_agent = *prefer_agent,
            "chat mode rotated"
        );
    }

    pub fn register_agent(&self, model: &str, agent_id: &str) {
        info!(backend = "you", model, agent_id, "agent mode registered");
        self.agents.insert(
            model.to_string(),
            AgentMode {
                id: agent_id.to_string(),
                valid: true,
            },
        );
    }

    pub fn invalidate_agent(&self, model: &str) {
        if let Some(mut agent) = self.agents.get_mut(model) {
            agent.valid = false;
        }
    }

    pub fn agent_id(&self, model: &str) -> Option<String> {
        self.agents
            .get(model)
            .filter(|agent| agent.valid)
            .map(|agent| agent.id.clone())
    }

    pub fn start_cooldown(&self, mode: &str) {
        let until = OffsetDateTime::now_utc() + self.config.cooldown;
        info!(
            backend = "you",
            mode,
            cooldown_secs = self.config.cooldown.as_secs(),
            "chat mode cooling down"
        );
        self.cooldowns.insert(mode.to_string(), until);
    }

    pub fn is_cooling(&self, mode: &str) -> bool {
        let Some(until) = self.cooldowns.get(mode).map(|entry| *entry) else {
            return false;
        };
        if OffsetDateTime::now_utc() >= until {
            self.cooldowns.remove(mode);
            return false;
        }
        true
    }

    /// Decide the mode for one request: the preferred mode wins unless it is
    /// cooling and the alternative is available. Both cooling falls back to
    /// the preferred mode and lets the request surface the limit.
    pub fn select(&self, model: &str) -> ModeChoice {
        let prefer_agent = *self.prefer_agent.lock().unwrap_or_else(|p| p.into_inner());
        let custom_cooling = self.is_cooling(CUSTOM_MODE);
        let agent = self.agent_id(model);
        let agent_cooling = agent
            .as_deref()
            .map(|id| self.is_cooling(id))
            .unwrap_or(false);

        if prefer_agent {
            match agent {
                Some(id) if !agent_cooling => ModeChoice::Agent(id),
                Some(id) if custom_cooling => ModeChoice::Agent(id),
                Some(_) => ModeChoice::Custom,
                None => ModeChoice::AgentWanted,
            }
        } else if custom_cooling {
            match agent {
                Some(id) if !agent_cooling => ModeChoice::Agent(id),
                _ => ModeChoice::Custom,
            }
        } else {
            ModeChoice::Custom
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> ModeRegistry {
        ModeRegistry::new(ModeConfig {
            rotation_interval: 2,
            cooldown: Duration::from_secs(3600),
        })
    }

    #[test]
    fn default_choice_is_custom() {
        let modes = registry();
        assert_eq!(modes.select("claude_3_5_sonnet"), ModeChoice::Custom);
    }

    #[test]
    fn rotation_flips_preference_at_interval() {
        let modes = registry();
        modes.register_agent("m", "agent-1");
        modes.note_rotation(1);
        assert_eq!(modes.select("m"), ModeChoice::Custom);
        modes.note_rotation(2);
        assert_eq!(modes.select("m"), ModeChoice::Agent("agent-1".to_string()));
    }

    #[test]
    fn preferring_agent_without_one_requests_provisioning() {
        let modes = registry();
        modes.note_rotation(2);
        assert_eq!(modes.select("m"), ModeChoice::AgentWanted);
    }

    #[test]
    fn cooling_custom_falls_back_to_agent() {
        let modes = registry();
        modes.register_agent("m", "agent-1");
        modes.start_cooldown(CUSTOM_MODE);
        assert_eq!(modes.select("m"), ModeChoice::Agent("agent-1".to_string()));
    }

    #[test]
    fn cooling_agent_falls_back_to_custom() {
        let modes = registry();
        modes.register_agent("m", "agent-1");
        modes.note_rotation(2);
        modes.start_cooldown("agent-1");
        assert_eq!(modes.select("m"), ModeChoice::Custom);
    }

    #[test]
    fn both_cooling_keeps_preferred_mode() {
        let modes = registry();
        modes.register_agent("m", "agent-1");
        modes.note_rotation(2);
        modes.start_cooldown("agent-1");
        modes.start_cooldown(CUSTOM_MODE);
        assert_eq!(modes.select("m"), ModeChoice::Agent("agent-1".to_string()));
    }

    #[test]
    fn mode_cooldowns_are_per_mode() {
        let modes = registry();
        modes.start_cooldown("agent-1");
        assert!(modes.is_cooling("agent-1"));
        assert!(!modes.is_cooling(CUSTOM_MODE));
    }

    #[test]
    fn invalidated_agents_are_not_selected() {
        let modes = registry();
        modes.register_agent("m", "agent-1");
        modes.invalidate_agent("m");
        modes.note_rotation(2);
        assert_eq!(modes.select("m"), ModeChoice::AgentWanted);
    }

    #[test]
    fn zero_interval_disables_rotation() {
        let modes = ModeRegistry::new(ModeConfig {
            rotation_interval: 0,
            cooldown: Duration::from_secs(3600),
        });
        modes.register_agent("m", "agent-1");
        for counter in 1..=10 {
            modes.note_rotation(counter);
        }
        assert_eq!(modes.select("m"), ModeChoice::Custom);
    }
}
