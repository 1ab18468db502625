//! Process-wide event bus for observers of sync activity

use crate::model::FolderState;
use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// The puller has started working on an item.
    ItemStarted { folder: String, item: String },
    /// A folder changed state.
    StateChanged { folder: String, state: FolderState },
}

/// Fan-out bus. Subscribers get their own unbounded channel; ones that
/// have gone away are dropped on the next emit.
#[derive(Default)]
pub struct EventBus {
    subs: Mutex<Vec<Sender<Event>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> Receiver<Event> {
        let (tx, rx) = unbounded();
        self.subs.lock().push(tx);
        rx
    }

    pub fn emit(&self, event: Event) {
        self.subs.lock().retain(|tx| tx.send(event.clone()).is_ok());
    }
}
