//! Conversation state: ordered messages, gating flags, and hand-off status.

use chrono::Utc;
use confab_wire::{Attachment, Role};
use std::collections::HashMap;
use uuid::Uuid;

/// Reserved content marking a reply-in-progress bubble. Replaced by the
/// first real text delta.
pub const TYPING_PLACEHOLDER: &str = "\u{2026}";

/// One chat bubble. Owned by the [`Conversation`]; created and mutated only
/// by the engine task.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub id: Uuid,
    pub role: Role,
    pub text: String,
    pub attachments: Vec<Attachment>,
    /// Creation time, epoch milliseconds.
    pub timestamp: i64,
}

impl Message {
    pub(crate) fn new(role: Role, text: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            role,
            text: text.into(),
            attachments: Vec::new(),
            timestamp: Utc::now().timestamp_millis(),
        }
    }

    pub(crate) fn placeholder(role: Role) -> Self {
        Self::new(role, TYPING_PLACEHOLDER)
    }

    /// Whether this message still shows the reply-in-progress marker and
    /// carries no content of its own.
    pub fn is_placeholder(&self) -> bool {
        self.text == TYPING_PLACEHOLDER && self.attachments.is_empty()
    }
}

/// Where a human-agent hand-off currently stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandOffState {
    Waiting,
    Joined,
    Left,
}

/// Live hand-off status, present once a hand-off has begun.
#[derive(Debug, Clone, PartialEq)]
pub struct HumanAgentParticipation {
    pub state: HandOffState,
    pub queue_size: Option<u32>,
    pub display_name: Option<String>,
}

impl HumanAgentParticipation {
    pub(crate) fn waiting() -> Self {
        Self {
            state: HandOffState::Waiting,
            queue_size: None,
            display_name: None,
        }
    }
}

/// Record of a conversation transfer, built from a transfer update.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Transfer {
    pub is_synchronous: bool,
    pub is_contact_center: bool,
    pub data: HashMap<String, String>,
}

/// Conversation state. Mutated only by the engine task; callers read it
/// through snapshots.
#[derive(Debug, Clone)]
pub struct Conversation {
    /// Messages in insertion order, which is display order.
    pub messages: Vec<Message>,
    pub can_send: bool,
    pub ended: bool,
    pub synchronously_transferred: bool,
    /// Opaque continuation token, replaced wholesale by each `state` event.
    pub state: Option<serde_json::Value>,
    /// Opaque long-poll cursor, monotonically replaced, never rewound.
    pub cursor: Option<serde_json::Value>,
    pub participation: Option<HumanAgentParticipation>,
    /// Conversation id assigned by a legacy-generation envelope.
    pub conversation_id: Option<String>,
    /// Transcript encryption key assigned by a legacy-generation envelope.
    pub encryption_key: Option<String>,
}

impl Default for Conversation {
    fn default() -> Self {
        Self {
            messages: Vec::new(),
            can_send: true,
            ended: false,
            synchronously_transferred: false,
            state: None,
            cursor: None,
            participation: None,
            conversation_id: None,
            encryption_key: None,
        }
    }
}

impl Conversation {
    pub fn message(&self, id: Uuid) -> Option<&Message> {
        self.messages.iter().find(|m| m.id == id)
    }

    pub(crate) fn message_mut(&mut self, id: Uuid) -> Option<&mut Message> {
        self.messages.iter_mut().find(|m| m.id == id)
    }

    pub(crate) fn remove_message(&mut self, id: Uuid) -> Option<Message> {
        let index = self.messages.iter().position(|m| m.id == id)?;
        Some(self.messages.remove(index))
    }
}
