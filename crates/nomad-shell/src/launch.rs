use anyhow::{bail, Result};
use nomad_types::UserEnv;
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use tracing::debug;

use crate::config::AppConfig;

pub const DEFAULT_DEV_SERVER_URL: &str = "http://localhost:3000";
pub const SERVER_BIN_ENV: &str = "NOMAD_SERVER_BIN";
pub const NODE_BINARY_ENV: &str = "NODE_BINARY";

const DIST_ENTRIES: &[&str] = &[
    "server/dist/bin.js",
    "server/dist/index.js",
    "server/dist/server/bin.js",
    "server/dist/server/index.js",
    "resources/server/dist/bin.js",
    "resources/server/dist/index.js",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendCommand {
    pub program: String,
    pub leading_args: Vec<String>,
}

impl BackendCommand {
    pub fn executable(program: impl Into<String>, leading_args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            leading_args,
        }
    }

    /// Locates the backend when no explicit binary was given.
    ///
    /// `NOMAD_SERVER_BIN` wins. Otherwise the built server entry is run with
    /// node; in dev mode `tsx` plus the TypeScript source is preferred when both
    /// exist.
    pub fn resolve(dev: bool) -> Result<Self> {
        if let Some(bin) = std::env::var(SERVER_BIN_ENV)
            .ok()
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
        {
            return Ok(Self::executable(bin, Vec::new()));
        }

        let node = std::env::var(NODE_BINARY_ENV)
            .ok()
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
            .unwrap_or_else(|| "node".to_string());
        let roots = search_roots();

        if dev {
            let tsx = first_existing(
                roots
                    .iter()
                    .map(|root| root.join("node_modules/tsx/dist/cli.js")),
            );
            let source = first_existing(roots.iter().flat_map(|root| {
                [
                    root.join("packages/server/src/index.ts"),
                    root.join("server/src/index.ts"),
                ]
            }));
            if let (Some(tsx), Some(source)) = (tsx, source) {
                debug!("dev backend via tsx {} {}", tsx.display(), source.display());
                return Ok(Self::executable(
                    node,
                    vec![path_to_string(&tsx), path_to_string(&source)],
                ));
            }
        }

        let dist = first_existing(roots.iter().flat_map(|root| {
            DIST_ENTRIES
                .iter()
                .flat_map(move |entry| [root.join("packages").join(entry), root.join(entry)])
        }));
        match dist {
            Some(entry) => Ok(Self::executable(node, vec![path_to_string(&entry)])),
            None => bail!(
                "unable to locate the backend server build (server/dist/bin.js); build the server package or pass --server-bin"
            ),
        }
    }
}

#[derive(Debug, Clone)]
pub struct LaunchSettings {
    pub command: BackendCommand,
    /// App config consulted for `listeningMode` when no user is active or the
    /// active user has no config file of their own.
    pub config_path: PathBuf,
    pub dev_server_url: String,
    pub login_shell: bool,
    pub cwd: Option<PathBuf>,
}

impl LaunchSettings {
    pub fn new(command: BackendCommand, config_path: PathBuf) -> Self {
        Self {
            command,
            config_path,
            dev_server_url: DEFAULT_DEV_SERVER_URL.to_string(),
            login_shell: cfg!(unix),
            cwd: None,
        }
    }

    pub fn plan(&self, dev: bool, user_env: Option<&UserEnv>) -> LaunchPlan {
        let config_path = user_env
            .map(|env| env.config_path.as_path())
            .filter(|path| path.is_file())
            .unwrap_or(self.config_path.as_path());
        let host = AppConfig::load_or_default(config_path).listening_mode.host();

        let mut args = self.command.leading_args.clone();
        args.extend(serve_args(host, dev.then_some(self.dev_server_url.as_str())));

        let env = user_env
            .map(|env| {
                env.env_vars()
                    .into_iter()
                    .map(|(key, value)| (key.to_string(), value))
                    .collect()
            })
            .unwrap_or_default();

        if self.login_shell && cfg!(unix) {
            let shell = default_shell();
            let command_line = format!(
                "exec {}",
                build_shell_command_with_args(&self.command.program, &args)
            );
            return LaunchPlan {
                args: login_shell_args(&shell, &command_line),
                program: shell,
                env,
                cwd: self.cwd.clone(),
            };
        }

        LaunchPlan {
            program: self.command.program.clone(),
            args,
            env,
            cwd: self.cwd.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchPlan {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub cwd: Option<PathBuf>,
}

impl LaunchPlan {
    pub fn command(&self) -> Command {
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .envs(self.env.iter().map(|(key, value)| (key, value)))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(cwd) = &self.cwd {
            command.current_dir(cwd);
        }
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            command.process_group(0);
        }
        command
    }

    pub fn display(&self) -> String {
        build_shell_command_with_args(&self.program, &self.args)
    }
}

pub fn serve_args(host: &str, dev_server_url: Option<&str>) -> Vec<String> {
    let mut args = vec![
        "serve".to_string(),
        "--host".to_string(),
        host.to_string(),
        "--port".to_string(),
        "0".to_string(),
    ];
    if let Some(url) = dev_server_url {
        args.extend([
            "--ui-dev-server".to_string(),
            url.to_string(),
            "--log-level".to_string(),
            "debug".to_string(),
        ]);
    }
    args
}

fn default_shell() -> String {
    if let Ok(shell) = std::env::var("SHELL") {
        if !shell.trim().is_empty() {
            return shell;
        }
    }
    if cfg!(target_os = "macos") {
        "/bin/zsh".to_string()
    } else {
        "/bin/sh".to_string()
    }
}

fn login_shell_args(shell: &str, command_line: &str) -> Vec<String> {
    let shell_name = Path::new(shell)
        .file_name()
        .and_then(OsStr::to_str)
        .unwrap_or("")
        .to_lowercase();
    // zsh only reads the user's PATH setup from .zshrc in interactive mode
    if shell_name.contains("zsh") {
        vec!["-l".into(), "-i".into(), "-c".into(), command_line.into()]
    } else {
        vec!["-l".into(), "-c".into(), command_line.into()]
    }
}

fn build_shell_command_with_args(command: &str, args: &[String]) -> String {
    let mut rendered = quote_shell_arg(command);
    for arg in args {
        rendered.push(' ');
        rendered.push_str(quote_shell_arg(arg).as_str());
    }
    rendered
}

fn quote_shell_arg(raw: &str) -> String {
    if raw.is_empty() {
        return "''".to_string();
    }
    if raw
        .chars()
        .all(|ch| ch.is_ascii_alphanumeric() || "-_./:@".contains(ch))
    {
        return raw.to_string();
    }
    format!("'{}'", raw.replace('\'', "'\"'\"'"))
}

fn search_roots() -> Vec<PathBuf> {
    let mut roots = Vec::new();
    if let Ok(cwd) = std::env::current_dir() {
        roots.extend(cwd.ancestors().take(4).map(Path::to_path_buf));
    }
    if let Ok(exe) = std::env::current_exe() {
        if let Some(dir) = exe.parent() {
            roots.push(dir.to_path_buf());
            roots.push(dir.join("../Resources"));
            roots.push(dir.join("../lib/codenomad"));
            roots.push(dir.join("../lib/CodeNomad"));
        }
    }
    roots
}

fn first_existing(candidates: impl IntoIterator<Item = PathBuf>) -> Option<PathBuf> {
    candidates
        .into_iter()
        .find(|candidate| candidate.is_file())
        .map(|candidate| candidate.canonicalize().unwrap_or(candidate))
}

fn path_to_string(path: &Path) -> String {
    path.to_string_lossy().to_string()
}
