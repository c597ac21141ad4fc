use std::{collections::HashMap, fs, time::Duration};

use coordination::CoordinationConfig;
use shared::domain::ConversationId;

#[derive(Debug, Clone)]
pub struct Settings {
    pub server_url: String,
    pub conversation_id: String,
    pub briefing: Option<String>,
    pub approval_poll_seconds: Option<u64>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            server_url: "http://127.0.0.1:8443".into(),
            conversation_id: "default".into(),
            briefing: None,
            approval_poll_seconds: None,
        }
    }
}

impl Settings {
    pub fn into_coordination_config(self) -> CoordinationConfig {
        CoordinationConfig {
            server_url: self.server_url,
            conversation_id: ConversationId::new(self.conversation_id),
            briefing: self.briefing,
            approval_poll_interval: self.approval_poll_seconds.map(Duration::from_secs),
            ..CoordinationConfig::default()
        }
    }
}

pub fn load_settings() -> Settings {
    let mut settings = Settings::default();

    if let Ok(raw) = fs::read_to_string("console.toml") {
        apply_file_config(&mut settings, &raw);
    }

    if let Ok(v) = std::env::var("SERVER_URL") {
        settings.server_url = v;
    }
    if let Ok(v) = std::env::var("APP__SERVER_URL") {
        settings.server_url = v;
    }

    if let Ok(v) = std::env::var("CONVERSATION_ID") {
        settings.conversation_id = v;
    }
    if let Ok(v) = std::env::var("APP__CONVERSATION_ID") {
        settings.conversation_id = v;
    }

    if let Ok(v) = std::env::var("APP__BRIEFING") {
        settings.briefing = Some(v);
    }

    if let Ok(v) = std::env::var("APP__APPROVAL_POLL_SECONDS") {
        if let Ok(parsed) = v.parse::<u64>() {
            settings.approval_poll_seconds = Some(parsed);
        }
    }

    settings
}

fn apply_file_config(settings: &mut Settings, raw: &str) {
    let Ok(file_cfg) = toml::from_str::<HashMap<String, String>>(raw) else {
        return;
    };
    if let Some(v) = file_cfg.get("server_url") {
        settings.server_url = v.clone();
    }
    if let Some(v) = file_cfg.get("conversation_id") {
        settings.conversation_id = v.clone();
    }
    if let Some(v) = file_cfg.get("briefing") {
        settings.briefing = Some(v.clone());
    }
    if let Some(v) = file_cfg.get("approval_poll_seconds") {
        if let Ok(parsed) = v.parse::<u64>() {
            settings.approval_poll_seconds = Some(parsed);
        }
    }
}
