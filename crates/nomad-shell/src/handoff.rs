use tracing::{debug, error, info, warn};

use crate::retry::{LoadError, RetryDecision, RetryPolicy, RetryState};
use crate::surface::{is_internal_url, ErrorPage, Surface, Ticket, TimerId, Timers};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandoffEvent {
    PreloadLoaded { ticket: Ticket },
    PreloadFailed { ticket: Ticket, error: LoadError },
    VisibleLoaded { ticket: Ticket },
    VisibleFailed { ticket: Ticket, error: LoadError },
    LoadTimedOut { ticket: Ticket },
    RetryDue { ticket: Ticket },
    WindowCreated,
    WindowDestroyed,
}

#[derive(Debug)]
struct Preload {
    url: String,
    ticket: Ticket,
}

#[derive(Debug)]
struct VisibleLoad {
    url: String,
    ticket: Ticket,
    timeout: TimerId,
}

#[derive(Debug)]
struct PendingRetry {
    url: String,
    ticket: Ticket,
    timer: TimerId,
}

pub struct Coordinator<S, T> {
    surface: S,
    timers: T,
    retry: RetryState,
    current_url: Option<String>,
    pending_url: Option<String>,
    last_committed: Option<String>,
    showing_loading: bool,
    preload: Option<Preload>,
    visible: Option<VisibleLoad>,
    pending_retry: Option<PendingRetry>,
    next_ticket: Ticket,
}

impl<S: Surface, T: Timers> Coordinator<S, T> {
    pub fn new(surface: S, timers: T, policy: RetryPolicy) -> Self {
        Self {
            surface,
            timers,
            retry: RetryState::new(policy),
            current_url: None,
            pending_url: None,
            last_committed: None,
            showing_loading: false,
            preload: None,
            visible: None,
            pending_retry: None,
            next_ticket: 1,
        }
    }

    pub fn surface_mut(&mut self) -> &mut S {
        &mut self.surface
    }

    fn preloading_url(&self) -> Option<&str> {
        self.preload.as_ref().map(|preload| preload.url.as_str())
    }

    /// Puts the loading screen up and drops any preload, load or retry in
    /// flight. Without `force` this is a no-op when the loading screen is
    /// already idle.
    pub fn show_loading_screen(&mut self, force: bool) {
        let busy = self.preload.is_some() || self.visible.is_some() || self.pending_retry.is_some();
        if self.showing_loading && !force && !busy {
            return;
        }
        self.discard_preload();
        self.cancel_visible_load();
        self.cancel_pending_retry();
        self.current_url = None;
        self.showing_loading = true;
        if self.surface.has_window() {
            self.surface.show_loading();
        }
    }

    pub fn start_preload(&mut self, url: &str) {
        if !is_internal_url(url) {
            warn!("refusing to hand off non-local url {url}");
            return;
        }
        if !self.surface.has_window() {
            debug!("no window yet, deferring {url}");
            self.pending_url = Some(url.to_string());
            return;
        }
        if self.current_url.as_deref() == Some(url) && !self.showing_loading {
            debug!("{url} already live");
            return;
        }
        if self.preloading_url() == Some(url) {
            return;
        }

        self.discard_preload();
        self.pending_url = None;
        let ticket = self.take_ticket();
        info!("preloading {url}");
        self.surface.create_preload(url, ticket);
        self.preload = Some(Preload {
            url: url.to_string(),
            ticket,
        });
    }

    pub fn reload(&mut self) -> bool {
        let Some(url) = self
            .current_url
            .clone()
            .or_else(|| self.last_committed.clone())
        else {
            warn!("reload requested before any url was committed");
            return false;
        };
        if !self.surface.has_window() {
            self.pending_url = Some(url);
            return false;
        }
        info!("reloading {url}");
        self.cancel_pending_retry();
        self.cancel_visible_load();
        self.retry.reset();
        self.showing_loading = false;
        self.current_url = Some(url.clone());
        self.load_visible(url);
        true
    }

    pub fn handle(&mut self, event: HandoffEvent) {
        match event {
            HandoffEvent::PreloadLoaded { ticket } => self.preload_loaded(ticket),
            HandoffEvent::PreloadFailed { ticket, error } => self.preload_failed(ticket, &error),
            HandoffEvent::VisibleLoaded { ticket } => self.visible_loaded(ticket),
            HandoffEvent::VisibleFailed { ticket, error } => {
                self.visible_failed(ticket, error, true)
            }
            HandoffEvent::LoadTimedOut { ticket } => {
                self.visible_failed(ticket, LoadError::timeout(), false)
            }
            HandoffEvent::RetryDue { ticket } => self.retry_due(ticket),
            HandoffEvent::WindowCreated => self.window_created(),
            HandoffEvent::WindowDestroyed => self.window_destroyed(),
        }
    }

    fn preload_loaded(&mut self, ticket: Ticket) {
        let Some(preload) = self.preload.take_if_ticket(ticket) else {
            debug!("ignoring stale preload {ticket}");
            return;
        };
        self.surface.destroy_preload(preload.ticket);
        self.cancel_pending_retry();
        self.cancel_visible_load();
        self.showing_loading = false;
        self.current_url = Some(preload.url.clone());
        self.last_committed = Some(preload.url.clone());
        self.retry.reset();
        info!("committing {}", preload.url);
        self.load_visible(preload.url);
    }

    fn preload_failed(&mut self, ticket: Ticket, error: &LoadError) {
        let Some(preload) = self.preload.take_if_ticket(ticket) else {
            return;
        };
        self.surface.destroy_preload(preload.ticket);
        warn!("preload of {} failed: {error}", preload.url);
    }

    fn visible_loaded(&mut self, ticket: Ticket) {
        let Some(load) = self.visible.take_if_ticket(ticket) else {
            return;
        };
        self.timers.cancel(load.timeout);
        if self.retry.attempt() > 0 {
            info!("{} loaded after {} failure(s)", load.url, self.retry.attempt());
        }
        self.retry.record_success();
    }

    fn visible_failed(&mut self, ticket: Ticket, error: LoadError, cancel_timer: bool) {
        let Some(load) = self.visible.take_if_ticket(ticket) else {
            return;
        };
        if cancel_timer {
            self.timers.cancel(load.timeout);
        }

        match self.retry.record_failure(&error) {
            RetryDecision::Retry { attempt, delay } => {
                warn!(
                    "loading {} failed ({error}), retry {attempt} in {}ms",
                    load.url,
                    delay.as_millis()
                );
                self.current_url = None;
                self.showing_loading = true;
                self.surface.show_loading();
                let retry_ticket = self.take_ticket();
                let timer = self.timers.schedule(
                    delay,
                    HandoffEvent::RetryDue {
                        ticket: retry_ticket,
                    },
                );
                self.pending_retry = Some(PendingRetry {
                    url: load.url,
                    ticket: retry_ticket,
                    timer,
                });
            }
            RetryDecision::GiveUp { attempts, message } => {
                error!("giving up on {} after {attempts} attempt(s): {message}", load.url);
                self.current_url = None;
                self.showing_loading = false;
                self.surface.show_error(&ErrorPage {
                    url: load.url,
                    message,
                    attempts,
                });
            }
        }
    }

    fn retry_due(&mut self, ticket: Ticket) {
        let Some(retry) = self.pending_retry.take_if_ticket(ticket) else {
            return;
        };
        debug!("retrying {}", retry.url);
        self.showing_loading = false;
        self.current_url = Some(retry.url.clone());
        self.load_visible(retry.url);
    }

    fn window_destroyed(&mut self) {
        let kept = self
            .preload
            .as_ref()
            .map(|preload| preload.url.clone())
            .or_else(|| self.pending_retry.as_ref().map(|retry| retry.url.clone()))
            .or_else(|| self.visible.as_ref().map(|load| load.url.clone()))
            .or_else(|| self.pending_url.take());
        debug!("window destroyed, keeping {kept:?}");

        self.discard_preload();
        self.cancel_visible_load();
        self.cancel_pending_retry();
        self.current_url = None;
        self.showing_loading = false;
        self.pending_url = kept;
    }

    fn window_created(&mut self) {
        self.show_loading_screen(true);
        if let Some(url) = self.pending_url.take() {
            self.start_preload(&url);
        }
    }

    fn load_visible(&mut self, url: String) {
        let ticket = self.take_ticket();
        let timeout = self.timers.schedule(
            self.retry.policy().load_timeout,
            HandoffEvent::LoadTimedOut { ticket },
        );
        self.surface.load_visible(&url, ticket);
        self.visible = Some(VisibleLoad {
            url,
            ticket,
            timeout,
        });
    }

    fn discard_preload(&mut self) {
        if let Some(preload) = self.preload.take() {
            self.surface.destroy_preload(preload.ticket);
        }
    }

    fn cancel_visible_load(&mut self) {
        if let Some(load) = self.visible.take() {
            self.timers.cancel(load.timeout);
        }
    }

    fn cancel_pending_retry(&mut self) {
        if let Some(retry) = self.pending_retry.take() {
            self.timers.cancel(retry.timer);
        }
    }

    fn take_ticket(&mut self) -> Ticket {
        let ticket = self.next_ticket;
        self.next_ticket += 1;
        ticket
    }
}

trait Ticketed {
    fn ticket(&self) -> Ticket;
}

impl Ticketed for Preload {
    fn ticket(&self) -> Ticket {
        self.ticket
    }
}

impl Ticketed for VisibleLoad {
    fn ticket(&self) -> Ticket {
        self.ticket
    }
}

impl Ticketed for PendingRetry {
    fn ticket(&self) -> Ticket {
        self.ticket
    }
}

trait TakeIfTicket<V> {
    fn take_if_ticket(&mut self, ticket: Ticket) -> Option<V>;
}

impl<V: Ticketed> TakeIfTicket<V> for Option<V> {
    fn take_if_ticket(&mut self, ticket: Ticket) -> Option<V> {
        if self.as_ref().is_some_and(|value| value.ticket() == ticket) {
            self.take()
        } else {
            None
        }
    }
}
