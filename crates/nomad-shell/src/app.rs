use anyhow::{Context, Result};
use nomad_types::{
    ProcessState, Request, Response, ShellEvent, SwitchUserParams, METHOD_GET_STATUS,
    METHOD_PING, METHOD_RELOAD, METHOD_RESTART, METHOD_SHUTDOWN, METHOD_SWITCH_USER,
};
use serde::de::DeserializeOwned;
use serde_json::json;
use std::sync::mpsc::{Receiver, Sender};
use std::sync::Arc;
use std::thread;
use tracing::{debug, error, info};

use crate::handoff::{Coordinator, HandoffEvent};
use crate::retry::RetryPolicy;
use crate::supervisor::{StartOptions, Supervisor};
use crate::surface::{Surface, Timers};
use crate::users::UserSwitcher;

#[derive(Debug)]
pub enum AppMessage {
    Handoff(HandoffEvent),
    Backend(ShellEvent),
    Request(Request),
    Reply(Response),
    Shutdown,
}

impl From<HandoffEvent> for AppMessage {
    fn from(event: HandoffEvent) -> Self {
        Self::Handoff(event)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct AppOptions {
    pub dev: bool,
    pub retry: RetryPolicy,
}

pub struct AppContext<S, T> {
    supervisor: Arc<Supervisor>,
    switcher: Arc<UserSwitcher>,
    coordinator: Coordinator<S, T>,
    sender: Sender<AppMessage>,
    receiver: Receiver<AppMessage>,
    options: AppOptions,
}

impl<S: Surface, T: Timers> AppContext<S, T> {
    /// `sender` and `receiver` are the two ends of the loop's channel; the
    /// surface and timers should already hold clones of `sender`.
    pub fn new(
        supervisor: Arc<Supervisor>,
        switcher: Arc<UserSwitcher>,
        surface: S,
        timers: T,
        options: AppOptions,
        (sender, receiver): (Sender<AppMessage>, Receiver<AppMessage>),
    ) -> Self {
        Self {
            coordinator: Coordinator::new(surface, timers, options.retry),
            supervisor,
            switcher,
            sender,
            receiver,
            options,
        }
    }

    pub fn run(mut self) -> Result<()> {
        self.forward_backend_events()?;
        self.coordinator.show_loading_screen(false);
        self.spawn_initial_start()?;

        while let Ok(message) = self.receiver.recv() {
            if !self.dispatch(message) {
                break;
            }
        }

        info!("shutting down backend");
        self.supervisor.shutdown();
        Ok(())
    }

    /// Handles one message. Returns false once the loop should exit.
    pub fn dispatch(&mut self, message: AppMessage) -> bool {
        match message {
            AppMessage::Handoff(event) => {
                let window_created = event == HandoffEvent::WindowCreated;
                self.coordinator.handle(event);
                if window_created {
                    self.resume_if_ready();
                }
            }
            AppMessage::Backend(event) => self.on_backend_event(event),
            AppMessage::Request(request) => return self.on_request(request),
            AppMessage::Reply(response) => self.coordinator.surface_mut().respond(&response),
            AppMessage::Shutdown => return false,
        }
        true
    }

    fn on_backend_event(&mut self, event: ShellEvent) {
        self.coordinator.surface_mut().deliver(&event);
        match &event {
            ShellEvent::Status(status) => {
                if matches!(status.state, ProcessState::Starting | ProcessState::Stopped) {
                    self.coordinator.show_loading_screen(false);
                }
            }
            ShellEvent::Ready(status) => {
                if let Some(url) = status.url.as_deref() {
                    self.coordinator.start_preload(url);
                }
            }
            ShellEvent::Error(payload) => debug!("backend error: {}", payload.message),
            ShellEvent::Log(_) => {}
        }
    }

    fn resume_if_ready(&mut self) {
        let status = self.supervisor.status();
        if let (true, Some(url)) = (status.is_ready(), status.url.as_deref()) {
            self.coordinator.start_preload(url);
        }
    }

    fn on_request(&mut self, request: Request) -> bool {
        debug!("request {} {}", request.id, request.method);
        let id = request.id;
        let response = match request.method.as_str() {
            METHOD_PING => Response::ok(
                id,
                json!({
                    "pong": true,
                    "shell": "nomad-shell",
                    "version": env!("CARGO_PKG_VERSION")
                }),
            ),
            METHOD_GET_STATUS => Response::ok(
                id,
                serde_json::to_value(self.supervisor.status()).unwrap_or_else(|_| json!({})),
            ),
            METHOD_RESTART => {
                let supervisor = self.supervisor.clone();
                let options = self.start_options();
                self.spawn_worker(id, move || {
                    supervisor.stop();
                    match supervisor.start(options) {
                        Ok(status) => Response::ok(
                            id,
                            serde_json::to_value(status).unwrap_or_else(|_| json!({})),
                        ),
                        Err(err) => Response::err(id, err.to_string()),
                    }
                });
                return true;
            }
            METHOD_SWITCH_USER => match parse_params::<SwitchUserParams>(&request.params) {
                Ok(params) => {
                    let switcher = self.switcher.clone();
                    let options = self.start_options();
                    self.spawn_worker(id, move || {
                        let result = switcher.switch_user(&params, options);
                        Response::ok(
                            id,
                            serde_json::to_value(result).unwrap_or_else(|_| json!({})),
                        )
                    });
                    return true;
                }
                Err(err) => Response::err(id, format!("{err:#}")),
            },
            METHOD_RELOAD => Response::ok(id, json!({ "reloaded": self.coordinator.reload() })),
            METHOD_SHUTDOWN => {
                self.coordinator
                    .surface_mut()
                    .respond(&Response::ok(id, json!({ "stopping": true })));
                return false;
            }
            method => Response::err(id, format!("unknown method: {method}")),
        };
        self.coordinator.surface_mut().respond(&response);
        true
    }

    fn start_options(&self) -> StartOptions {
        StartOptions {
            dev: self.options.dev,
        }
    }

    fn spawn_worker<F>(&self, id: u64, job: F)
    where
        F: FnOnce() -> Response + Send + 'static,
    {
        let sender = self.sender.clone();
        let spawned = thread::Builder::new()
            .name(format!("request-{id}"))
            .spawn(move || {
                let _ = sender.send(AppMessage::Reply(job()));
            });
        if let Err(err) = spawned {
            error!("failed to spawn worker for request {id}: {err}");
            let _ = self
                .sender
                .send(AppMessage::Reply(Response::err(id, err.to_string())));
        }
    }

    fn forward_backend_events(&self) -> Result<()> {
        let events = self.supervisor.subscribe();
        let sender = self.sender.clone();
        thread::Builder::new()
            .name("backend-events".to_string())
            .spawn(move || {
                for event in events {
                    if sender.send(AppMessage::Backend(event)).is_err() {
                        break;
                    }
                }
            })
            .context("failed to spawn backend event forwarder")?;
        Ok(())
    }

    fn spawn_initial_start(&self) -> Result<()> {
        let supervisor = self.supervisor.clone();
        let options = self.start_options();
        thread::Builder::new()
            .name("backend-start".to_string())
            .spawn(move || {
                if let Err(err) = supervisor.start(options) {
                    error!("backend failed to start: {err}");
                }
            })
            .context("failed to spawn backend start thread")?;
        Ok(())
    }
}

fn parse_params<P: DeserializeOwned>(params: &serde_json::Value) -> Result<P> {
    serde_json::from_value(params.clone()).context("invalid request params")
}
