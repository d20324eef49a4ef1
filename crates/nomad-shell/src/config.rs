use nomad_types::{default_config_path, expand_tilde};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

pub const CONFIG_ENV: &str = "NOMAD_CONFIG";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ListeningMode {
    #[default]
    Local,
    All,
}

impl ListeningMode {
    pub fn host(self) -> &'static str {
        match self {
            Self::Local => "127.0.0.1",
            Self::All => "0.0.0.0",
        }
    }

    fn parse(raw: &str) -> Option<Self> {
        match raw {
            "local" => Some(Self::Local),
            "all" => Some(Self::All),
            _ => None,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct RawAppConfig {
    #[serde(default)]
    preferences: Option<RawPreferences>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawPreferences {
    #[serde(default)]
    listening_mode: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AppConfig {
    pub listening_mode: ListeningMode,
}

impl AppConfig {
    /// Reads `path`, falling back to defaults when it is missing or malformed.
    pub fn load_or_default(path: &Path) -> Self {
        let raw = match fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(err) => {
                debug!("app config {} not readable: {err}", path.display());
                return Self::default();
            }
        };
        Self::parse(&raw).unwrap_or_else(|err| {
            warn!("ignoring malformed app config {}: {err}", path.display());
            Self::default()
        })
    }

    pub fn parse(raw: &str) -> serde_json::Result<Self> {
        if raw.trim().is_empty() {
            return Ok(Self::default());
        }
        let parsed: RawAppConfig = serde_json::from_str(raw)?;
        let listening_mode = parsed
            .preferences
            .and_then(|prefs| prefs.listening_mode)
            .and_then(|mode| {
                let parsed = ListeningMode::parse(mode.trim());
                if parsed.is_none() {
                    warn!("unknown listeningMode '{mode}', using local");
                }
                parsed
            })
            .unwrap_or_default();
        Ok(Self { listening_mode })
    }
}

pub fn resolve_config_path(explicit: Option<&Path>) -> PathBuf {
    if let Some(path) = explicit {
        return path.to_path_buf();
    }
    std::env::var(CONFIG_ENV)
        .ok()
        .filter(|value| !value.trim().is_empty())
        .map(|value| expand_tilde(value.trim()))
        .unwrap_or_else(default_config_path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{SystemTime, UNIX_EPOCH};

    #[test]
    fn parses_listening_mode() {
        let config =
            AppConfig::parse(r#"{"preferences":{"listeningMode":"all","theme":"dark"}}"#).unwrap();
        assert_eq!(config.listening_mode, ListeningMode::All);
        assert_eq!(config.listening_mode.host(), "0.0.0.0");

        let config = AppConfig::parse(r#"{"preferences":{"listeningMode":"local"}}"#).unwrap();
        assert_eq!(config.listening_mode.host(), "127.0.0.1");
    }

    #[test]
    fn missing_or_unknown_mode_defaults_to_local() {
        assert_eq!(AppConfig::parse("{}").unwrap().listening_mode, ListeningMode::Local);
        assert_eq!(AppConfig::parse("").unwrap().listening_mode, ListeningMode::Local);
        assert_eq!(
            AppConfig::parse(r#"{"preferences":{"listeningMode":"lan"}}"#)
                .unwrap()
                .listening_mode,
            ListeningMode::Local
        );
    }

    #[test]
    fn unreadable_or_malformed_file_yields_defaults() {
        let base = unique_temp_dir("config");
        fs::create_dir_all(&base).unwrap();
        let missing = base.join("missing.json");
        assert_eq!(AppConfig::load_or_default(&missing), AppConfig::default());

        let broken = base.join("broken.json");
        fs::write(&broken, "{ preferences: ").unwrap();
        assert_eq!(AppConfig::load_or_default(&broken), AppConfig::default());

        let valid = base.join("config.json");
        fs::write(&valid, r#"{"preferences":{"listeningMode":"all"}}"#).unwrap();
        assert_eq!(AppConfig::load_or_default(&valid).listening_mode, ListeningMode::All);

        let _ = fs::remove_dir_all(&base);
    }

    #[test]
    fn explicit_config_path_wins() {
        let explicit = PathBuf::from("/srv/nomad/config.json");
        assert_eq!(resolve_config_path(Some(&explicit)), explicit);
    }

    fn unique_temp_dir(label: &str) -> PathBuf {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        std::env::temp_dir().join(format!("nomad-shell-{label}-{nanos}"))
    }
}
