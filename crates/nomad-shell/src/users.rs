use anyhow::{Context, Result};
use nomad_types::{ProcessStatus, SwitchUserParams, SwitchUserResult, UserEnv, UserSummary};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::{info, warn};

use crate::lock;
use crate::supervisor::{StartOptions, Supervisor, SupervisorError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserRecord {
    pub id: String,
    pub name: String,
    pub guest: bool,
}

impl UserRecord {
    pub fn summary(&self) -> UserSummary {
        UserSummary {
            id: self.id.clone(),
            name: self.name.clone(),
            guest: self.guest,
        }
    }
}

pub trait UserStore: Send + Sync {
    fn find(&self, id: &str) -> Option<UserRecord>;
    fn verify_password(&self, id: &str, password: &str) -> bool;
    fn set_active(&self, id: &str) -> Result<()>;
    fn data_root(&self, id: &str) -> PathBuf;
}

pub trait BackendControl: Send + Sync {
    fn set_user_env(&self, env: UserEnv);
    fn stop(&self);
    fn start(&self, options: StartOptions) -> Result<ProcessStatus, SupervisorError>;
}

impl BackendControl for Supervisor {
    fn set_user_env(&self, env: UserEnv) {
        Supervisor::set_user_env(self, env);
    }

    fn stop(&self) {
        Supervisor::stop(self);
    }

    fn start(&self, options: StartOptions) -> Result<ProcessStatus, SupervisorError> {
        Supervisor::start(self, options)
    }
}

pub struct UserSwitcher {
    store: Arc<dyn UserStore>,
    backend: Arc<dyn BackendControl>,
    gate: Mutex<()>,
}

impl UserSwitcher {
    pub fn new(store: Arc<dyn UserStore>, backend: Arc<dyn BackendControl>) -> Self {
        Self {
            store,
            backend,
            gate: Mutex::new(()),
        }
    }

    /// Activates a user and restarts the backend under their data root.
    ///
    /// Switches run one at a time. Unknown ids and bad passwords come back as
    /// an unsuccessful result. A backend that fails to come back up after a
    /// successful switch is reported through the status events, not here.
    pub fn switch_user(&self, params: &SwitchUserParams, options: StartOptions) -> SwitchUserResult {
        let _gate = lock(&self.gate);

        let Some(user) = self.store.find(&params.id) else {
            warn!("user switch rejected: unknown user {}", params.id);
            return SwitchUserResult::failed();
        };
        if !user.guest {
            let password = params.password.as_deref().unwrap_or_default();
            if !self.store.verify_password(&user.id, password) {
                warn!("user switch rejected: bad credentials for {}", user.id);
                return SwitchUserResult::failed();
            }
        }
        if let Err(err) = self.store.set_active(&user.id) {
            warn!("failed to activate user {}: {err:#}", user.id);
            return SwitchUserResult::failed();
        }

        let env = UserEnv::for_data_root(self.store.data_root(&user.id));
        if let Err(err) = fs::create_dir_all(&env.data_root) {
            warn!(
                "failed to create data root {}: {err}",
                env.data_root.display()
            );
        }
        info!("switching to user {} ({})", user.id, env.data_root.display());
        self.backend.set_user_env(env);
        self.backend.stop();
        if let Err(err) = self.backend.start(options) {
            warn!("backend restart for user {} failed: {err}", user.id);
        }

        SwitchUserResult {
            success: true,
            user: Some(user.summary()),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UsersFile {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    active_user_id: Option<String>,
    #[serde(default)]
    users: Vec<StoredUser>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredUser {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub guest: bool,
    #[serde(default)]
    pub salt: String,
    #[serde(default)]
    pub password_hash: String,
}

/// `users.json` under the shell data directory; each user's data lives in
/// `users/<id>/` next to it.
pub struct FileUserStore {
    root: PathBuf,
}

impl FileUserStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn users_path(&self) -> PathBuf {
        self.root.join("users.json")
    }

    pub fn active_user_id(&self) -> Option<String> {
        self.load().ok().and_then(|file| file.active_user_id)
    }

    fn load(&self) -> Result<UsersFile> {
        let path = self.users_path();
        if !path.exists() {
            return Ok(UsersFile::default());
        }
        let raw = fs::read_to_string(&path)
            .with_context(|| format!("failed to read users file: {}", path.display()))?;
        serde_json::from_str(&raw)
            .with_context(|| format!("failed to parse users file: {}", path.display()))
    }

    fn save(&self, file: &UsersFile) -> Result<()> {
        let data = serde_json::to_string_pretty(file).context("failed to serialize users")?;
        atomic_write_file(&self.users_path(), data.as_bytes())
    }

    fn stored(&self, id: &str) -> Option<StoredUser> {
        match self.load() {
            Ok(file) => file.users.into_iter().find(|user| user.id == id),
            Err(err) => {
                warn!("{err:#}");
                None
            }
        }
    }
}

impl UserStore for FileUserStore {
    fn find(&self, id: &str) -> Option<UserRecord> {
        self.stored(id).map(|user| UserRecord {
            id: user.id,
            name: user.name,
            guest: user.guest,
        })
    }

    fn verify_password(&self, id: &str, password: &str) -> bool {
        let Some(user) = self.stored(id) else {
            return false;
        };
        !user.password_hash.is_empty() && hash_password(&user.salt, password) == user.password_hash
    }

    fn set_active(&self, id: &str) -> Result<()> {
        let mut file = self.load()?;
        file.active_user_id = Some(id.to_string());
        self.save(&file)
    }

    fn data_root(&self, id: &str) -> PathBuf {
        self.root.join("users").join(safe_dir_name(id))
    }
}

/// Hex SHA-256 of `salt` followed by `password`.
pub fn hash_password(salt: &str, password: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(salt.as_bytes());
    hasher.update(password.as_bytes());
    let digest = hasher.finalize();
    let mut out = String::with_capacity(digest.len() * 2);
    for byte in digest {
        let _ = write!(out, "{byte:02x}");
    }
    out
}

/// Escapes `_` and every byte outside `[A-Za-z0-9-]` as `_XX`, so distinct
/// ids never share a directory.
fn safe_dir_name(id: &str) -> String {
    if id.is_empty() {
        return "_".to_string();
    }
    let mut name = String::with_capacity(id.len());
    for byte in id.bytes() {
        if byte.is_ascii_alphanumeric() || byte == b'-' {
            name.push(char::from(byte));
        } else {
            let _ = write!(name, "_{byte:02x}");
        }
    }
    name
}

fn atomic_write_file(target: &Path, data: &[u8]) -> Result<()> {
    let parent = target
        .parent()
        .with_context(|| format!("cannot determine parent directory for {}", target.display()))?;
    fs::create_dir_all(parent)
        .with_context(|| format!("failed to create directory: {}", parent.display()))?;
    let tmp_path = target.with_extension("tmp");
    fs::write(&tmp_path, data)
        .with_context(|| format!("failed to write temporary file: {}", tmp_path.display()))?;
    fs::rename(&tmp_path, target).with_context(|| {
        format!(
            "failed to rename {} to {}",
            tmp_path.display(),
            target.display()
        )
    })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;
    use std::time::{Duration, SystemTime, UNIX_EPOCH};

    struct FakeStore {
        users: HashMap<String, (UserRecord, &'static str)>,
        active: Mutex<Option<String>>,
    }

    impl FakeStore {
        fn new() -> Self {
            let mut users = HashMap::new();
            users.insert(
                "alice".to_string(),
                (
                    UserRecord {
                        id: "alice".to_string(),
                        name: "Alice".to_string(),
                        guest: false,
                    },
                    "hunter2",
                ),
            );
            users.insert(
                "guest".to_string(),
                (
                    UserRecord {
                        id: "guest".to_string(),
                        name: "Guest".to_string(),
                        guest: true,
                    },
                    "",
                ),
            );
            Self {
                users,
                active: Mutex::new(None),
            }
        }
    }

    impl UserStore for FakeStore {
        fn find(&self, id: &str) -> Option<UserRecord> {
            self.users.get(id).map(|(record, _)| record.clone())
        }

        fn verify_password(&self, id: &str, password: &str) -> bool {
            self.users
                .get(id)
                .is_some_and(|(_, expected)| *expected == password)
        }

        fn set_active(&self, id: &str) -> Result<()> {
            *self.active.lock().unwrap() = Some(id.to_string());
            Ok(())
        }

        fn data_root(&self, id: &str) -> PathBuf {
            std::env::temp_dir().join("nomad-shell-users-test").join(id)
        }
    }

    #[derive(Default)]
    struct RecordingBackend {
        calls: Mutex<Vec<String>>,
        in_flight: AtomicUsize,
        overlapped: AtomicUsize,
    }

    impl BackendControl for RecordingBackend {
        fn set_user_env(&self, env: UserEnv) {
            self.calls
                .lock()
                .unwrap()
                .push(format!("env:{}", env.data_root.display()));
        }

        fn stop(&self) {
            if self.in_flight.fetch_add(1, Ordering::SeqCst) > 0 {
                self.overlapped.fetch_add(1, Ordering::SeqCst);
            }
            self.calls.lock().unwrap().push("stop".to_string());
        }

        fn start(&self, _options: StartOptions) -> Result<ProcessStatus, SupervisorError> {
            thread::sleep(Duration::from_millis(20));
            self.calls.lock().unwrap().push("start".to_string());
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            Ok(ProcessStatus::ready(Some(1), 4000, "http://127.0.0.1:4000".to_string()))
        }
    }

    fn switcher() -> (UserSwitcher, Arc<FakeStore>, Arc<RecordingBackend>) {
        let store = Arc::new(FakeStore::new());
        let backend = Arc::new(RecordingBackend::default());
        (
            UserSwitcher::new(store.clone(), backend.clone()),
            store,
            backend,
        )
    }

    fn params(id: &str, password: Option<&str>) -> SwitchUserParams {
        SwitchUserParams {
            id: id.to_string(),
            password: password.map(str::to_string),
        }
    }

    #[test]
    fn valid_credentials_restart_backend_with_user_env() {
        let (switcher, store, backend) = switcher();
        let result = switcher.switch_user(&params("alice", Some("hunter2")), StartOptions::default());

        assert!(result.success);
        assert_eq!(result.user.unwrap().name, "Alice");
        assert_eq!(store.active.lock().unwrap().as_deref(), Some("alice"));
        let calls = backend.calls.lock().unwrap().clone();
        assert_eq!(calls.len(), 3);
        assert!(calls[0].starts_with("env:") && calls[0].ends_with("alice"));
        assert_eq!(&calls[1..], ["stop", "start"]);
    }

    #[test]
    fn bad_password_and_unknown_user_fail_without_restart() {
        let (switcher, store, backend) = switcher();
        assert_eq!(
            switcher.switch_user(&params("alice", Some("nope")), StartOptions::default()),
            SwitchUserResult::failed()
        );
        assert_eq!(
            switcher.switch_user(&params("alice", None), StartOptions::default()),
            SwitchUserResult::failed()
        );
        assert_eq!(
            switcher.switch_user(&params("mallory", Some("x")), StartOptions::default()),
            SwitchUserResult::failed()
        );
        assert!(store.active.lock().unwrap().is_none());
        assert!(backend.calls.lock().unwrap().is_empty());
    }

    #[test]
    fn guest_skips_password_check() {
        let (switcher, _store, _backend) = switcher();
        let result = switcher.switch_user(&params("guest", None), StartOptions::default());
        assert!(result.success);
        assert!(result.user.unwrap().guest);
    }

    #[test]
    fn concurrent_switches_run_one_after_another() {
        let (switcher, _store, backend) = switcher();
        let switcher = Arc::new(switcher);
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let switcher = switcher.clone();
                thread::spawn(move || {
                    switcher.switch_user(&params("guest", None), StartOptions::default())
                })
            })
            .collect();
        for handle in handles {
            assert!(handle.join().unwrap().success);
        }
        assert_eq!(backend.overlapped.load(Ordering::SeqCst), 0);
        assert_eq!(backend.calls.lock().unwrap().len(), 12);
    }

    #[test]
    fn file_store_verifies_hashes_and_persists_active_user() {
        let base = unique_temp_dir("users");
        fs::create_dir_all(&base).unwrap();
        let users = serde_json::json!({
            "users": [
                {"id": "alice", "name": "Alice", "salt": "s1", "passwordHash": hash_password("s1", "pw")},
                {"id": "guest", "name": "Guest", "guest": true}
            ]
        });
        fs::write(base.join("users.json"), users.to_string()).unwrap();

        let store = FileUserStore::new(&base);
        assert!(store.verify_password("alice", "pw"));
        assert!(!store.verify_password("alice", "wrong"));
        assert!(!store.verify_password("guest", ""));
        assert!(store.find("guest").unwrap().guest);
        assert!(store.find("bob").is_none());

        store.set_active("alice").unwrap();
        assert_eq!(store.active_user_id().as_deref(), Some("alice"));
        assert_eq!(FileUserStore::new(&base).find("alice").unwrap().name, "Alice");
        assert_eq!(store.data_root("alice"), base.join("users").join("alice"));
        assert_eq!(
            store.data_root("../alice"),
            base.join("users").join("_2e_2e_2falice")
        );

        let _ = fs::remove_dir_all(&base);
    }

    #[test]
    fn distinct_ids_never_share_a_data_root() {
        let store = FileUserStore::new("/srv/nomad");
        assert_ne!(store.data_root("a.b"), store.data_root("a_b"));
        assert_ne!(store.data_root("../alice"), store.data_root("___alice"));
        assert_ne!(store.data_root(""), store.data_root("_"));
        assert_eq!(safe_dir_name("a_b"), "a_5fb");
        assert_eq!(safe_dir_name("a.b"), "a_2eb");
        assert_eq!(safe_dir_name("émile"), "_c3_a9mile");
    }

    fn unique_temp_dir(label: &str) -> PathBuf {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        std::env::temp_dir().join(format!("nomad-shell-{label}-{nanos}"))
    }
}
