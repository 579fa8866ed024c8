//! Observer registration and notification fan-out.
//!
//! The engine holds only non-owning handles: observers live as long as the
//! caller keeps the `Arc` alive, and stale handles are pruned lazily. Every
//! callback runs on the engine task, so notification order is total.

use crate::conversation::{HumanAgentParticipation, Message, Transfer};
use std::sync::{Arc, Weak};
use uuid::Uuid;

/// Callbacks for conversation changes. All methods default to no-ops, so an
/// observer implements only the subset it cares about.
pub trait ChatObserver: Send + Sync {
    /// A message was appended to the conversation.
    fn message_added(&self, _message: &Message) {}

    /// A message's text or attachments changed.
    fn message_changed(&self, _message: &Message) {}

    /// A message was removed (a placeholder that will never fill).
    fn message_removed(&self, _id: Uuid) {}

    /// The conversation was handed off to another production context.
    fn transfer(&self, _transfer: &Transfer) {}

    /// A user-visible error for a failed send.
    fn error(&self, _message: &str) {}

    /// Human-agent hand-off status changed.
    fn participation_changed(&self, _participation: Option<&HumanAgentParticipation>) {}

    /// The server ended the conversation.
    fn conversation_ended(&self) {}

    /// The send gate opened or closed.
    fn can_send_changed(&self, _can_send: bool) {}
}

/// The set of registered observers, held weakly.
#[derive(Default)]
pub(crate) struct ObserverSet {
    observers: Vec<Weak<dyn ChatObserver>>,
}

impl ObserverSet {
    pub fn add(&mut self, observer: Weak<dyn ChatObserver>) {
        self.observers.push(observer);
    }

    /// Remove by pointer identity.
    pub fn remove(&mut self, observer: &Weak<dyn ChatObserver>) {
        self.observers.retain(|existing| !existing.ptr_eq(observer));
    }

    /// Number of observers still alive. Dead handles are pruned.
    pub fn live_count(&mut self) -> usize {
        self.observers.retain(|o| o.strong_count() > 0);
        self.observers.len()
    }

    /// Invoke a callback on every live observer, pruning dead handles.
    pub fn notify(&mut self, f: impl Fn(&dyn ChatObserver)) {
        self.observers.retain(|o| o.strong_count() > 0);
        for observer in &self.observers {
            if let Some(observer) = observer.upgrade() {
                f(observer.as_ref());
            }
        }
    }
}
