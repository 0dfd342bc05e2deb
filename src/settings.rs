use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::store::{SessionConfig, DEFAULT_LOG_LIMIT, DEFAULT_TOOL_TIMELINE_LIMIT};

const APP_DIR_NAME: &str = "voxstream";
const SETTINGS_FILE_NAME: &str = "settings.json";

const ENV_BASE_URL: &str = "VOXSTREAM_BASE_URL";
const ENV_API_KEY: &str = "VOXSTREAM_API_KEY";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChatSettings {
    /// Backend origin, e.g. `http://localhost:8000`.
    pub base_url: String,

    /// Streaming chat endpoint, relative to `base_url`.
    pub chat_path: String,

    /// Session listing endpoint, relative to `base_url`.
    pub sessions_path: String,

    pub model: String,
    pub assistant_language: String,
    pub enable_tools: bool,

    /// Ask the backend to synthesize a spoken reply (`done.audio_b64`).
    pub expect_audio: bool,

    /// Most recent tool events kept per session.
    pub tool_timeline_limit: usize,

    /// Most recent backend log lines kept per exchange.
    pub log_limit: usize,

    /// Recording is stopped automatically after this many seconds.
    pub max_recording_secs: u64,

    /// Capture rate sent with voice payloads.
    pub sample_rate: u32,

    /// Clear the tool timeline when a new session starts.
    pub reset_timeline_on_new_session: bool,

    /// Connect timeout for backend requests.
    pub request_timeout_secs: u64,

    /// Bearer token. Only ever read from the environment, never persisted.
    #[serde(skip)]
    pub api_key: Option<String>,
}

impl Default for ChatSettings {
    fn default() -> Self {
        let session = SessionConfig::default();
        Self {
            base_url: "http://localhost:8000".to_string(),
            chat_path: "/v1/unified-chat".to_string(),
            sessions_path: "/v1/sessions".to_string(),
            model: session.model,
            assistant_language: session.assistant_language,
            enable_tools: session.enable_tools,
            expect_audio: session.expect_audio,
            tool_timeline_limit: DEFAULT_TOOL_TIMELINE_LIMIT,
            log_limit: DEFAULT_LOG_LIMIT,
            max_recording_secs: 30,
            sample_rate: 16_000,
            reset_timeline_on_new_session: true,
            request_timeout_secs: 10,
            api_key: None,
        }
    }
}

impl ChatSettings {
    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            model: self.model.clone(),
            assistant_language: self.assistant_language.clone(),
            enable_tools: self.enable_tools,
            expect_audio: self.expect_audio,
        }
    }

    /// Apply `VOXSTREAM_*` environment variables on top of the file values.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(url) = lookup(ENV_BASE_URL).filter(|v| !v.trim().is_empty()) {
            log::info!("Settings: base_url overridden from {}", ENV_BASE_URL);
            self.base_url = url.trim().to_string();
        }
        if let Some(key) = lookup(ENV_API_KEY).filter(|v| !v.trim().is_empty()) {
            self.api_key = Some(key.trim().to_string());
        }
    }
}

pub fn settings_path() -> Result<PathBuf, String> {
    let dir = dirs::config_dir().ok_or_else(|| "Could not determine config directory".to_string())?;
    Ok(dir.join(APP_DIR_NAME).join(SETTINGS_FILE_NAME))
}

/// Load from the default location, then apply `.env` and environment overrides.
pub fn load_settings() -> ChatSettings {
    // A missing .env is normal
    let _ = dotenvy::dotenv();

    let mut settings = match settings_path() {
        Ok(path) => load_settings_from(&path),
        Err(e) => {
            log::warn!("Settings: {}", e);
            ChatSettings::default()
        }
    };
    settings.apply_env_overrides();
    settings
}

pub fn load_settings_from(path: &Path) -> ChatSettings {
    match std::fs::read_to_string(path) {
        Ok(contents) => match serde_json::from_str::<ChatSettings>(&contents) {
            Ok(settings) => settings,
            Err(e) => {
                log::warn!("Settings: failed to parse {:?}: {}", path, e);
                ChatSettings::default()
            }
        },
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => ChatSettings::default(),
        Err(e) => {
            log::warn!("Settings: failed to read {:?}: {}", path, e);
            ChatSettings::default()
        }
    }
}

pub fn save_settings(settings: &ChatSettings) -> Result<(), String> {
    save_settings_to(&settings_path()?, settings)
}

pub fn save_settings_to(path: &Path, settings: &ChatSettings) -> Result<(), String> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| format!("Failed to create config directory {:?}: {}", parent, e))?;
    }

    let contents =
        serde_json::to_string_pretty(settings).map_err(|e| format!("Serialize settings: {}", e))?;

    // Temp file in the same directory, then rename over the target
    let tmp_path = path.with_extension("json.tmp");
    std::fs::write(&tmp_path, &contents)
        .map_err(|e| format!("Write temp settings {:?}: {}", tmp_path, e))?;

    // rename does not replace an existing file on Windows
    if cfg!(windows) && path.exists() {
        if let Err(e) = std::fs::remove_file(path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                return Err(format!("Remove existing settings file {:?}: {}", path, e));
            }
        }
    }

    std::fs::rename(&tmp_path, path)
        .map_err(|e| format!("Rename temp settings {:?} to {:?}: {}", tmp_path, path, e))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_file_fills_defaults() {
        let settings: ChatSettings =
            serde_json::from_str(r#"{"model": "gpt-x", "log_limit": 5}"#).expect("parse");
        assert_eq!(settings.model, "gpt-x");
        assert_eq!(settings.log_limit, 5);
        assert_eq!(settings.tool_timeline_limit, 20);
        assert_eq!(settings.chat_path, "/v1/unified-chat");
    }

    #[test]
    fn api_key_is_never_serialized() {
        let settings = ChatSettings {
            api_key: Some("secret".to_string()),
            ..ChatSettings::default()
        };
        let json = serde_json::to_string(&settings).expect("serialize");
        assert!(!json.contains("secret"));
    }

    #[test]
    fn overrides_apply_non_empty_values_only() {
        let mut settings = ChatSettings::default();
        settings.apply_overrides(|key| match key {
            ENV_BASE_URL => Some(" http://backend:9000 ".to_string()),
            ENV_API_KEY => Some("   ".to_string()),
            _ => None,
        });
        assert_eq!(settings.base_url, "http://backend:9000");
        assert_eq!(settings.api_key, None);
    }

    #[test]
    fn session_config_copies_request_fields() {
        let settings = ChatSettings {
            model: "m".to_string(),
            expect_audio: true,
            ..ChatSettings::default()
        };
        let config = settings.session_config();
        assert_eq!(config.model, "m");
        assert!(config.expect_audio);
        assert!(config.enable_tools);
    }

    #[test]
    fn save_then_load_round_trips_through_disk() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("nested").join(SETTINGS_FILE_NAME);
        let settings = ChatSettings {
            base_url: "http://example:1234".to_string(),
            max_recording_secs: 12,
            ..ChatSettings::default()
        };

        save_settings_to(&path, &settings).expect("save");
        assert!(!path.with_extension("json.tmp").exists());
        assert_eq!(load_settings_from(&path), settings);

        // Overwrite an existing file
        let updated = ChatSettings {
            sample_rate: 8_000,
            ..settings
        };
        save_settings_to(&path, &updated).expect("save again");
        assert_eq!(load_settings_from(&path).sample_rate, 8_000);
    }

    #[test]
    fn missing_or_corrupt_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let missing = dir.path().join("absent.json");
        assert_eq!(load_settings_from(&missing), ChatSettings::default());

        let corrupt = dir.path().join(SETTINGS_FILE_NAME);
        std::fs::write(&corrupt, "{ not json").expect("write");
        assert_eq!(load_settings_from(&corrupt), ChatSettings::default());
    }
}
