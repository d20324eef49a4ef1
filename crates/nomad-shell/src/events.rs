use nomad_types::ShellEvent;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Mutex;

use crate::lock;

/// Channels are unbounded: status transitions must never be dropped. A
/// subscriber whose receiver was dropped is pruned on the next broadcast.
#[derive(Debug, Default)]
pub struct EventBus {
    senders: Mutex<Vec<Sender<ShellEvent>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> Receiver<ShellEvent> {
        let (tx, rx) = mpsc::channel();
        lock(&self.senders).push(tx);
        rx
    }

    pub fn broadcast(&self, event: ShellEvent) {
        lock(&self.senders).retain(|tx| tx.send(event.clone()).is_ok());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nomad_types::{ErrorPayload, ProcessStatus};

    #[test]
    fn every_subscriber_sees_events_in_order() {
        let bus = EventBus::new();
        let first = bus.subscribe();
        let second = bus.subscribe();

        bus.broadcast(ShellEvent::Status(ProcessStatus::starting(None)));
        bus.broadcast(ShellEvent::Error(ErrorPayload {
            message: "boom".to_string(),
        }));

        for rx in [first, second] {
            let names: Vec<&str> = rx.try_iter().map(|event| event.name()).collect();
            assert_eq!(names, vec![nomad_types::EVENT_STATUS, nomad_types::EVENT_ERROR]);
        }
    }

    #[test]
    fn dropped_subscribers_are_pruned() {
        let bus = EventBus::new();
        let kept = bus.subscribe();
        drop(bus.subscribe());
        assert_eq!(lock(&bus.senders).len(), 2);

        bus.broadcast(ShellEvent::Status(ProcessStatus::stopped()));
        assert_eq!(lock(&bus.senders).len(), 1);
        assert_eq!(kept.try_iter().count(), 1);
    }
}
