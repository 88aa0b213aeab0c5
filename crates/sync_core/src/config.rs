use std::{collections::HashMap, fs, path::Path, time::Duration};

use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    pub server_url: String,
    pub database_url: String,
    pub max_retries: u32,
    pub initial_retry_delay_ms: u64,
    pub tenant_debounce_ms: u64,
    pub conversation_debounce_ms: u64,
    pub event_channel_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            server_url: "http://127.0.0.1:8080".into(),
            database_url: "sqlite://./data/outbox.db".into(),
            max_retries: 3,
            initial_retry_delay_ms: 1000,
            tenant_debounce_ms: 300,
            conversation_debounce_ms: 50,
            event_channel_capacity: 1024,
        }
    }
}

impl EngineConfig {
    pub fn tenant_debounce(&self) -> Duration {
        Duration::from_millis(self.tenant_debounce_ms)
    }

    pub fn conversation_debounce(&self) -> Duration {
        Duration::from_millis(self.conversation_debounce_ms)
    }
}

/// Defaults, overridden by `engine.toml` in the working directory, overridden
/// by environment variables.
pub fn load_config() -> EngineConfig {
    load_config_from(Path::new("engine.toml"))
}

pub fn load_config_from(path: &Path) -> EngineConfig {
    let mut config = EngineConfig::default();

    if let Ok(raw) = fs::read_to_string(path) {
        if let Ok(file_cfg) = toml::from_str::<HashMap<String, toml::Value>>(&raw) {
            if let Some(v) = file_cfg.get("server_url").and_then(|v| v.as_str()) {
                config.server_url = v.to_string();
            }
            if let Some(v) = file_cfg.get("database_url").and_then(|v| v.as_str()) {
                config.database_url = v.to_string();
            }
            if let Some(v) = file_cfg.get("max_retries").and_then(|v| v.as_integer()) {
                config.max_retries = v as u32;
            }
            if let Some(v) = file_cfg
                .get("initial_retry_delay_ms")
                .and_then(|v| v.as_integer())
            {
                config.initial_retry_delay_ms = v as u64;
            }
            if let Some(v) = file_cfg
                .get("tenant_debounce_ms")
                .and_then(|v| v.as_integer())
            {
                config.tenant_debounce_ms = v as u64;
            }
            if let Some(v) = file_cfg
                .get("conversation_debounce_ms")
                .and_then(|v| v.as_integer())
            {
                config.conversation_debounce_ms = v as u64;
            }
        }
    }

    if let Ok(v) = std::env::var("SERVER_URL") {
        config.server_url = v;
    }
    if let Ok(v) = std::env::var("APP__SERVER_URL") {
        config.server_url = v;
    }

    if let Ok(v) = std::env::var("DATABASE_URL") {
        config.database_url = v;
    }
    if let Ok(v) = std::env::var("APP__DATABASE_URL") {
        config.database_url = v;
    }

    if let Ok(v) = std::env::var("APP__MAX_RETRIES") {
        if let Ok(parsed) = v.parse() {
            config.max_retries = parsed;
        }
    }
    if let Ok(v) = std::env::var("APP__INITIAL_RETRY_DELAY_MS") {
        if let Ok(parsed) = v.parse() {
            config.initial_retry_delay_ms = parsed;
        }
    }
    if let Ok(v) = std::env::var("APP__TENANT_DEBOUNCE_MS") {
        if let Ok(parsed) = v.parse() {
            config.tenant_debounce_ms = parsed;
        }
    }
    if let Ok(v) = std::env::var("APP__CONVERSATION_DEBOUNCE_MS") {
        if let Ok(parsed) = v.parse() {
            config.conversation_debounce_ms = parsed;
        }
    }

    config
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
