//! Typed in-process event channel.
//!
//! Cross-component signals (generation state, round state, appended messages)
//! go through explicit listener registration with a defined payload per event,
//! instead of an ambient string-keyed event bus.

use std::sync::{Arc, Mutex};

use crate::group::turns::Speaker;
use crate::pipeline::GenerationState;

#[derive(Debug, Clone)]
pub enum ChatEvent {
    GenerationStateChanged {
        chat_id: String,
        state: GenerationState,
    },
    RoundStateChanged {
        chat_id: String,
        round_number: u32,
        next_speaker: Speaker,
        starts_new_round: bool,
    },
    MessageAppended {
        chat_id: String,
        index: usize,
    },
}

pub trait ChatEventListener: Send + Sync {
    fn on_event(&self, event: &ChatEvent);
}

impl<F> ChatEventListener for F
where
    F: Fn(&ChatEvent) + Send + Sync,
{
    fn on_event(&self, event: &ChatEvent) {
        self(event)
    }
}

#[derive(Clone, Default)]
pub struct EventEmitter {
    listeners: Arc<Mutex<Vec<Arc<dyn ChatEventListener>>>>,
}

impl EventEmitter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, listener: Arc<dyn ChatEventListener>) {
        if let Ok(mut list) = self.listeners.lock() {
            list.push(listener);
        }
    }

    /// Delivers synchronously, in registration order, on the caller's task.
    pub fn emit(&self, event: &ChatEvent) {
        let snapshot: Vec<Arc<dyn ChatEventListener>> = match self.listeners.lock() {
            Ok(list) => list.clone(),
            Err(_) => return,
        };
        for listener in snapshot {
            listener.on_event(event);
        }
    }
}
