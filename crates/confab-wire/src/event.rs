//! Typed chat updates decoded from response frames.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Participant role attached to a message update.
///
/// Older service generations spell the human-agent role `human_agent`, newer
/// ones `humanAgent`; both are accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Role {
    User,
    Assistant,
    #[serde(alias = "human_agent")]
    HumanAgent,
    Status,
}

/// A file or link delivered alongside message text.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Attachment {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub content_type: Option<String>,
}

/// One decoded update from the chat stream.
///
/// The wire representation is a JSON object discriminated by its `type`
/// field, except for the two legacy envelope variants, which are bare
/// objects from an older protocol generation and are matched before the
/// tagged schema (see [`ChatEvent::decode`]).
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ChatEvent {
    /// Wholesale replacement of the opaque continuation token.
    State { state: serde_json::Value },

    /// Incremental message output.
    Message {
        role: Role,
        #[serde(default)]
        text: Option<String>,
        #[serde(default)]
        attachments: Vec<Attachment>,
        #[serde(default)]
        is_end_of_message: Option<bool>,
        #[serde(default)]
        preparing_followup: Option<bool>,
    },

    /// Hand-off of the conversation to another production context.
    Transfer {
        #[serde(default)]
        is_synchronous: Option<bool>,
        #[serde(default)]
        is_contact_center: Option<bool>,
        #[serde(default)]
        data: HashMap<String, String>,
    },

    /// Application-level error reported inside a successfully parsed frame.
    Error {
        #[serde(default)]
        user_visible_message: Option<String>,
    },

    /// Human-agent hand-off status. The boolean fields are independent and
    /// may co-occur in one event.
    HumanAgentInfo {
        #[serde(default)]
        queue_size: Option<u32>,
        #[serde(default)]
        display_name: Option<String>,
        #[serde(default)]
        joined: Option<bool>,
        #[serde(default)]
        left: Option<bool>,
        #[serde(default)]
        typing: Option<bool>,
    },

    /// The server has ended the conversation.
    EndConversation,

    /// Replacement of the opaque long-poll cursor.
    LivePollCursor { cursor: serde_json::Value },

    /// Legacy envelope assigning the conversation id.
    #[serde(skip)]
    LegacyConversationId { conversation_id: String },

    /// Legacy envelope assigning the transcript encryption key.
    #[serde(skip)]
    LegacyEncryptionKey { encryption_key: String },
}

/// Legacy conversation-id envelope. `deny_unknown_fields` keeps it from
/// shadowing tagged updates that happen to carry a `conversationId` field.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
struct ConversationIdEnvelope {
    conversation_id: String,
}

/// Legacy encryption-key envelope.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
struct EncryptionKeyEnvelope {
    encryption_key: String,
}

impl ChatEvent {
    /// Decode one frame, trying the candidate schemas in priority order:
    /// legacy envelopes first, then the `type`-discriminated update. A frame
    /// matching none of them fails with [`Error::InvalidChatUpdate`], which
    /// is fatal to the owning session.
    pub fn decode(frame: &str) -> Result<ChatEvent> {
        if let Ok(envelope) = serde_json::from_str::<ConversationIdEnvelope>(frame) {
            return Ok(ChatEvent::LegacyConversationId {
                conversation_id: envelope.conversation_id,
            });
        }
        if let Ok(envelope) = serde_json::from_str::<EncryptionKeyEnvelope>(frame) {
            return Ok(ChatEvent::LegacyEncryptionKey {
                encryption_key: envelope.encryption_key,
            });
        }
        serde_json::from_str::<ChatEvent>(frame).map_err(|e| {
            tracing::debug!(error = %e, frame, "frame matched no update schema");
            Error::InvalidChatUpdate {
                frame: frame.to_owned(),
            }
        })
    }
}
