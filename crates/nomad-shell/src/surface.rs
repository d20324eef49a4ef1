use nomad_types::{Response, ShellEvent};
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::Sender;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;
use url::Url;

use crate::handoff::HandoffEvent;
use crate::lock;

pub type Ticket = u64;
pub type TimerId = u64;

pub trait Surface {
    fn has_window(&self) -> bool;

    fn show_loading(&mut self);

    /// Starts loading `url` in the visible window. The outcome arrives as
    /// `VisibleLoaded` or `VisibleFailed` with the same ticket.
    fn load_visible(&mut self, url: &str, ticket: Ticket);

    fn show_error(&mut self, page: &ErrorPage);

    /// Creates a hidden view loading `url`. The outcome arrives as
    /// `PreloadLoaded` or `PreloadFailed` with the same ticket.
    fn create_preload(&mut self, url: &str, ticket: Ticket);

    fn destroy_preload(&mut self, ticket: Ticket);

    fn deliver(&mut self, event: &ShellEvent);

    fn respond(&mut self, response: &Response);
}

pub trait Timers {
    fn schedule(&mut self, delay: Duration, event: HandoffEvent) -> TimerId;

    fn cancel(&mut self, id: TimerId);
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorPage {
    pub url: String,
    pub message: String,
    pub attempts: u32,
}

/// Whether the window may navigate to `raw` in place.
pub fn is_internal_url(raw: &str) -> bool {
    let Ok(url) = Url::parse(raw) else {
        return false;
    };
    match url.scheme() {
        "tauri" | "asset" | "file" => true,
        "http" | "https" => matches!(url.host_str(), Some("127.0.0.1" | "localhost" | "[::1]")),
        _ => false,
    }
}

/// One sleeping thread per timer. A cancelled id leaves the live set and never fires.
pub struct ThreadTimers<M> {
    sender: Sender<M>,
    next_id: AtomicU64,
    live: Arc<Mutex<HashSet<TimerId>>>,
}

impl<M> ThreadTimers<M>
where
    M: From<HandoffEvent> + Send + 'static,
{
    pub fn new(sender: Sender<M>) -> Self {
        Self {
            sender,
            next_id: AtomicU64::new(1),
            live: Arc::new(Mutex::new(HashSet::new())),
        }
    }
}

impl<M> Timers for ThreadTimers<M>
where
    M: From<HandoffEvent> + Send + 'static,
{
    fn schedule(&mut self, delay: Duration, event: HandoffEvent) -> TimerId {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        lock(&self.live).insert(id);
        let live = self.live.clone();
        let sender = self.sender.clone();
        thread::spawn(move || {
            thread::sleep(delay);
            if lock(&live).remove(&id) {
                let _ = sender.send(M::from(event));
            }
        });
        id
    }

    fn cancel(&mut self, id: TimerId) {
        lock(&self.live).remove(&id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    #[test]
    fn internal_urls_are_local_only() {
        assert!(is_internal_url("http://127.0.0.1:54321/"));
        assert!(is_internal_url("https://localhost:3000/app"));
        assert!(is_internal_url("file:///tmp/loading.html"));
        assert!(is_internal_url("asset://localhost/index.html"));
        assert!(!is_internal_url("https://example.com/"));
        assert!(!is_internal_url("http://0.0.0.0:54321/"));
        assert!(!is_internal_url("not a url"));
    }

    #[test]
    fn thread_timers_fire_unless_cancelled() {
        let (tx, rx) = mpsc::channel::<HandoffEvent>();
        let mut timers = ThreadTimers::new(tx);
        let cancelled = timers.schedule(
            Duration::from_millis(20),
            HandoffEvent::RetryDue { ticket: 1 },
        );
        timers.schedule(
            Duration::from_millis(40),
            HandoffEvent::RetryDue { ticket: 2 },
        );
        timers.cancel(cancelled);

        let fired = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(fired, HandoffEvent::RetryDue { ticket: 2 });
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
        assert!(lock(&timers.live).is_empty());
    }
}
