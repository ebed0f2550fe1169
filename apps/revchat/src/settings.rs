use std::time::Duration;

use serde::Deserialize;
use serde_json::{Value, json};

use revchat_provider_core::{PoolConfig, RotationStrategy};
use revchat_provider_impl::provider::you::YouSettings;
use revchat_provider_impl::provider::you::modes::ModeConfig;

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_state_dir() -> String {
    "state".to_string()
}

fn default_attempt_budget() -> u32 {
    3
}

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub proxy: Option<String>,
    #[serde(default = "default_state_dir")]
    pub state_dir: String,
    #[serde(default = "default_attempt_budget")]
    pub attempt_budget: u32,

    #[serde(default)]
    pub you_cookies: Vec<String>,
    #[serde(default)]
    pub x_credentials: Vec<XCredential>,
    #[serde(default)]
    pub grok_cookies: Vec<String>,

    #[serde(default)]
    pub rotation: RotationSettings,
    #[serde(default)]
    pub you_settings: YouSettings,
}

#[derive(Debug, Clone, Deserialize)]
pub struct XCredential {
    pub cookie: String,
    pub authorization: String,
    #[serde(rename = "x-csrf-token", alias = "csrf_token")]
    pub csrf_token: String,
}

impl XCredential {
    pub fn to_secret(&self) -> Value {
        json!({
            "cookie": self.cookie,
            "authorization": self.authorization,
            "x-csrf-token": self.csrf_token,
        })
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RotationSettings {
    #[serde(default)]
    pub you: BackendRotation,
    #[serde(default)]
    pub x: BackendRotation,
    #[serde(default)]
    pub grok: BackendRotation,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BackendRotation {
    #[serde(default)]
    pub strategy: RotationStrategy,
    /// Chats between secondary-mode rotations (You.com); 0 disables.
    #[serde(default = "default_rotation_interval")]
    pub rotation_interval: u64,
    #[serde(default = "default_cooldown_minutes")]
    pub cooldown_minutes: u64,
    #[serde(default = "default_validation_interval_hours")]
    pub validation_interval_hours: u64,
}

fn default_rotation_interval() -> u64 {
    3
}

fn default_cooldown_minutes() -> u64 {
    60
}

fn default_validation_interval_hours() -> u64 {
    1
}

impl Default for BackendRotation {
    fn default() -> Self {
        Self {
            strategy: RotationStrategy::default(),
            rotation_interval: default_rotation_interval(),
            cooldown_minutes: default_cooldown_minutes(),
            validation_interval_hours: default_validation_interval_hours(),
        }
    }
}

impl BackendRotation {
    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            strategy: self.strategy,
            default_cooldown: Duration::from_secs(self.cooldown_minutes * 60),
            validation_interval: Duration::from_secs(self.validation_interval_hours * 3600),
        }
    }

    pub fn mode_config(&self) -> ModeConfig {
        ModeConfig {
            rotation_interval: self.rotation_interval,
            cooldown: Duration::from_secs(self.cooldown_minutes * 60),
        }
    }
}

impl Settings {
    pub fn load(path: &str) -> Result<Self, config::ConfigError> {
        config::Config::builder()
            .add_source(config::File::with_name(path).required(false))
            .add_source(config::Environment::with_prefix("REVCHAT").separator("__"))
            .build()?
            .try_deserialize()
    }

    /// Placeholder secrets from a template config are worth a loud warning
    /// but not a refusal to start; other backends may be fine.
    pub fn placeholder_secrets(&self) -> Vec<&'static str> {
        let mut found = Vec::new();
        if self.you_cookies.iter().any(|c| c.contains("YOUR_")) {
            found.push("you_cookies");
        }
        if self.x_credentials.iter().any(|c| c.cookie.contains("YOUR_")) {
            found.push("x_credentials");
        }
        if self.grok_cookies.iter().any(|c| c.contains("YOUR_")) {
            found.push("grok_cookies");
        }
        found
    }

    pub fn you_secrets(&self) -> Vec<Value> {
        self.you_cookies.iter().cloned().map(Value::String).collect()
    }

    pub fn x_secrets(&self) -> Vec<Value> {
        self.x_credentials
            .iter()
            .map(XCredential::to_secret)
            .collect()
    }

    pub fn grok_secrets(&self) -> Vec<Value> {
        self.grok_cookies
            .iter()
            .cloned()
            .map(Value::String)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply_without_a_config_file() {
        let settings: Settings = serde_json::from_str("{}").unwrap();
        assert_eq!(settings.port, 8080);
        assert_eq!(settings.attempt_budget, 3);
        assert_eq!(settings.rotation.you.rotation_interval, 3);
        assert!(settings.you_cookies.is_empty());
    }

    #[test]
    fn x_credentials_accept_both_key_spellings() {
        let settings: Settings = serde_json::from_str(
            r#"{"x_credentials": [
                {"cookie": "c", "authorization": "a", "x-csrf-token": "t"},
                {"cookie": "c2", "authorization": "a2", "csrf_token": "t2"}
            ]}"#,
        )
        .unwrap();
        assert_eq!(settings.x_credentials.len(), 2);
        assert_eq!(settings.x_secrets()[1]["x-csrf-token"], "t2");
    }

    #[test]
    fn placeholders_are_reported_per_backend() {
        let settings: Settings = serde_json::from_str(
            r#"{"you_cookies": ["YOUR_YOU_COOKIE_HERE"], "grok_cookies": ["real"]}"#,
        )
        .unwrap();
        assert_eq!(settings.placeholder_secrets(), vec!["you_cookies"]);
    }

    #[test]
    fn rotation_strategy_parses_snake_case() {
        let rotation: BackendRotation =
            serde_json::from_str(r#"{"strategy": "least_used"}"#).unwrap();
        assert_eq!(rotation.strategy, RotationStrategy::LeastUsed);
    }
}
