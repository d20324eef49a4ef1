use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::env;
use std::path::{Path, PathBuf};

pub const METHOD_PING: &str = "ping";
pub const METHOD_GET_STATUS: &str = "getStatus";
pub const METHOD_RESTART: &str = "restart";
pub const METHOD_SWITCH_USER: &str = "switchUser";
pub const METHOD_RELOAD: &str = "reload";
pub const METHOD_SHUTDOWN: &str = "shutdown";

pub const EVENT_STATUS: &str = "backend:status";
pub const EVENT_READY: &str = "backend:ready";
pub const EVENT_ERROR: &str = "backend:error";
pub const EVENT_LOG: &str = "backend:log";

pub const ENV_DATA_ROOT: &str = "NOMAD_DATA_ROOT";
pub const ENV_CONFIG_PATH: &str = "NOMAD_CONFIG_PATH";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    pub id: u64,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    pub id: u64,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Response {
    pub fn ok(id: u64, result: Value) -> Self {
        Self {
            id,
            ok: true,
            result: Some(result),
            error: None,
        }
    }

    pub fn err(id: u64, message: impl Into<String>) -> Self {
        Self {
            id,
            ok: false,
            result: None,
            error: Some(message.into()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessState {
    Stopped,
    Starting,
    Ready,
    Error,
}

/// Snapshot of the supervised backend. Always handed out by value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessStatus {
    pub state: ProcessState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Default for ProcessStatus {
    fn default() -> Self {
        Self::stopped()
    }
}

impl ProcessStatus {
    pub fn stopped() -> Self {
        Self {
            state: ProcessState::Stopped,
            pid: None,
            port: None,
            url: None,
            error: None,
        }
    }

    pub fn starting(pid: Option<u32>) -> Self {
        Self {
            state: ProcessState::Starting,
            pid,
            ..Self::stopped()
        }
    }

    pub fn ready(pid: Option<u32>, port: u16, url: String) -> Self {
        Self {
            state: ProcessState::Ready,
            pid,
            port: Some(port),
            url: Some(url),
            error: None,
        }
    }

    pub fn failed(pid: Option<u32>, message: impl Into<String>) -> Self {
        Self {
            state: ProcessState::Error,
            pid,
            error: Some(message.into()),
            ..Self::stopped()
        }
    }

    pub fn is_ready(&self) -> bool {
        self.state == ProcessState::Ready
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogStream {
    Stdout,
    Stderr,
}

impl LogStream {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Stdout => "stdout",
            Self::Stderr => "stderr",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub stream: LogStream,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "payload")]
pub enum ShellEvent {
    #[serde(rename = "backend:status")]
    Status(ProcessStatus),
    #[serde(rename = "backend:ready")]
    Ready(ProcessStatus),
    #[serde(rename = "backend:error")]
    Error(ErrorPayload),
    #[serde(rename = "backend:log")]
    Log(LogEntry),
}

impl ShellEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Status(_) => EVENT_STATUS,
            Self::Ready(_) => EVENT_READY,
            Self::Error(_) => EVENT_ERROR,
            Self::Log(_) => EVENT_LOG,
        }
    }
}

/// Per-user environment handed to the backend on its next start.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserEnv {
    pub data_root: PathBuf,
    pub config_path: PathBuf,
}

impl UserEnv {
    pub fn for_data_root(data_root: impl Into<PathBuf>) -> Self {
        let data_root = data_root.into();
        let config_path = data_root.join("config.json");
        Self {
            data_root,
            config_path,
        }
    }

    pub fn env_vars(&self) -> [(&'static str, String); 2] {
        [
            (ENV_DATA_ROOT, path_to_string(&self.data_root)),
            (ENV_CONFIG_PATH, path_to_string(&self.config_path)),
        ]
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SwitchUserParams {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserSummary {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub guest: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SwitchUserResult {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<UserSummary>,
}

impl SwitchUserResult {
    pub fn failed() -> Self {
        Self {
            success: false,
            user: None,
        }
    }
}

pub fn default_data_dir() -> PathBuf {
    if let Some(data_dir) = dirs::data_local_dir() {
        return data_dir.join("codenomad");
    }

    PathBuf::from(".codenomad")
}

pub fn default_config_path() -> PathBuf {
    if let Some(config_dir) = dirs::config_dir() {
        return config_dir.join("codenomad").join("config.json");
    }

    if let Ok(home) = env::var("HOME") {
        return PathBuf::from(home)
            .join(".config")
            .join("codenomad")
            .join("config.json");
    }

    PathBuf::from(".config/codenomad/config.json")
}

pub fn expand_tilde(raw_path: &str) -> PathBuf {
    if raw_path == "~" || raw_path.starts_with("~/") {
        if let Some(home) = dirs::home_dir() {
            if raw_path == "~" {
                return home;
            }
            return home.join(raw_path.trim_start_matches("~/"));
        }
    }

    PathBuf::from(raw_path)
}

fn path_to_string(path: &Path) -> String {
    path.to_string_lossy().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_serializes_lowercase_state_and_skips_empty_fields() {
        let value = serde_json::to_value(ProcessStatus::starting(Some(42))).unwrap();
        assert_eq!(value, serde_json::json!({"state": "starting", "pid": 42}));
    }

    #[test]
    fn shell_event_carries_its_name() {
        let event = ShellEvent::Ready(ProcessStatus::ready(
            Some(7),
            54321,
            "http://127.0.0.1:54321".to_string(),
        ));
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["event"], EVENT_READY);
        assert_eq!(value["payload"]["port"], 54321);
        assert_eq!(event.name(), EVENT_READY);
    }

    #[test]
    fn user_env_places_config_inside_data_root() {
        let env = UserEnv::for_data_root("/tmp/users/alice");
        assert_eq!(env.config_path, PathBuf::from("/tmp/users/alice/config.json"));
        let vars = env.env_vars();
        assert_eq!(vars[0], (ENV_DATA_ROOT, "/tmp/users/alice".to_string()));
        assert_eq!(
            vars[1],
            (ENV_CONFIG_PATH, "/tmp/users/alice/config.json".to_string())
        );
    }

    #[test]
    fn expand_tilde_leaves_plain_paths_alone() {
        assert_eq!(expand_tilde("/etc/app.json"), PathBuf::from("/etc/app.json"));
        assert_eq!(expand_tilde("relative/x"), PathBuf::from("relative/x"));
    }
}
