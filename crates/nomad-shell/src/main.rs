use anyhow::{Context, Result};
use clap::Parser;
use nomad_shell::app::{AppContext, AppMessage, AppOptions};
use nomad_shell::config::resolve_config_path;
use nomad_shell::launch::{BackendCommand, LaunchSettings, DEFAULT_DEV_SERVER_URL};
use nomad_shell::probe::{ProbeSurface, DEFAULT_PROBE_TIMEOUT};
use nomad_shell::retry::RetryPolicy;
use nomad_shell::supervisor::{startup_timeout_from_env, Supervisor, SupervisorSettings};
use nomad_shell::surface::ThreadTimers;
use nomad_shell::users::{FileUserStore, UserStore, UserSwitcher};
use nomad_types::{default_data_dir, Request, UserEnv};
use std::io::{self, BufRead};
use std::path::PathBuf;
use std::sync::mpsc::{self, Sender};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Debug, Parser)]
#[command(
    name = "nomad-shell",
    version,
    about = "Supervises the CodeNomad server and hands its UI to the window once it is up"
)]
struct Args {
    /// Backend executable. Defaults to NOMAD_SERVER_BIN or the built server entry run with node.
    #[arg(long)]
    server_bin: Option<String>,
    /// Extra argument placed before `serve`. Repeatable.
    #[arg(long = "server-arg", allow_hyphen_values = true)]
    server_args: Vec<String>,
    #[arg(long)]
    dev: bool,
    #[arg(long, default_value = DEFAULT_DEV_SERVER_URL)]
    dev_server_url: String,
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long)]
    data_root: Option<PathBuf>,
    #[arg(long)]
    no_login_shell: bool,
    #[arg(long)]
    startup_timeout_ms: Option<u64>,
    #[arg(long)]
    headless_probe_timeout_ms: Option<u64>,
}

fn main() -> Result<()> {
    init_logging();
    let args = Args::parse();
    let dev = args.dev || env_flag("NOMAD_DEV");

    let command = match args.server_bin {
        Some(bin) => BackendCommand::executable(bin, args.server_args),
        None => {
            let mut command = BackendCommand::resolve(dev)?;
            command.leading_args.extend(args.server_args);
            command
        }
    };
    let mut launch = LaunchSettings::new(command, resolve_config_path(args.config.as_deref()));
    launch.dev_server_url = args.dev_server_url;
    launch.login_shell = launch.login_shell && !args.no_login_shell;

    let mut settings = SupervisorSettings::new(launch);
    settings.startup_timeout = args
        .startup_timeout_ms
        .map(Duration::from_millis)
        .unwrap_or_else(startup_timeout_from_env);
    let supervisor = Arc::new(Supervisor::with_log_probe(settings)?);

    let data_root = args.data_root.unwrap_or_else(default_data_dir);
    let store = Arc::new(FileUserStore::new(&data_root));
    if let Some(active) = store.active_user_id() {
        info!("restoring active user {active}");
        supervisor.set_user_env(UserEnv::for_data_root(store.data_root(&active)));
    }
    let switcher = Arc::new(UserSwitcher::new(store, supervisor.clone()));

    let (sender, receiver) = mpsc::channel();
    let probe_timeout = args
        .headless_probe_timeout_ms
        .map(Duration::from_millis)
        .unwrap_or(DEFAULT_PROBE_TIMEOUT);
    let surface = ProbeSurface::new(sender.clone(), io::stdout(), probe_timeout);
    let timers = ThreadTimers::new(sender.clone());
    let app = AppContext::new(
        supervisor,
        switcher,
        surface,
        timers,
        AppOptions {
            dev,
            retry: RetryPolicy::default(),
        },
        (sender.clone(), receiver),
    );

    install_signal_handler(sender.clone());
    spawn_control_reader(sender)?;
    app.run()?;
    info!("nomad-shell shutdown complete");
    Ok(())
}

fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_writer(io::stderr)
        .with_env_filter(
            std::env::var("NOMAD_SHELL_LOG")
                .or_else(|_| std::env::var("RUST_LOG"))
                .unwrap_or_else(|_| "info".to_string()),
        )
        .try_init();
}

fn env_flag(key: &str) -> bool {
    std::env::var(key)
        .map(|value| matches!(value.trim(), "1" | "true" | "yes"))
        .unwrap_or(false)
}

/// Reads JSON request lines from stdin. Closing stdin shuts the shell down.
fn spawn_control_reader(sender: Sender<AppMessage>) -> Result<()> {
    thread::Builder::new()
        .name("control-reader".to_string())
        .spawn(move || {
            for line in io::stdin().lock().lines() {
                let line = match line {
                    Ok(line) => line,
                    Err(err) => {
                        warn!("failed to read control input: {err}");
                        break;
                    }
                };
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }
                match serde_json::from_str::<Request>(trimmed) {
                    Ok(request) => {
                        if sender.send(AppMessage::Request(request)).is_err() {
                            return;
                        }
                    }
                    Err(err) => warn!("ignoring malformed request: {err}"),
                }
            }
            info!("control input closed, shutting down");
            let _ = sender.send(AppMessage::Shutdown);
        })
        .context("failed to spawn control reader")?;
    Ok(())
}

#[cfg(unix)]
fn install_signal_handler(sender: Sender<AppMessage>) {
    use std::sync::atomic::{AtomicBool, Ordering};

    static SIGNAL_RECEIVED: AtomicBool = AtomicBool::new(false);

    extern "C" fn handler(_sig: libc::c_int) {
        SIGNAL_RECEIVED.store(true, Ordering::SeqCst);
    }

    unsafe {
        libc::signal(libc::SIGTERM, handler as *const () as libc::sighandler_t);
        libc::signal(libc::SIGINT, handler as *const () as libc::sighandler_t);
    }

    // The handler only flips the flag; this thread turns it into a message.
    thread::spawn(move || {
        while !SIGNAL_RECEIVED.load(Ordering::SeqCst) {
            thread::sleep(Duration::from_millis(100));
        }
        info!("received signal, initiating graceful shutdown");
        let _ = sender.send(AppMessage::Shutdown);
    });
}

#[cfg(not(unix))]
fn install_signal_handler(_sender: Sender<AppMessage>) {}
