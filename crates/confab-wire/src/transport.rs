//! HTTP boundary to the chat service.

use crate::error::{Error, Result};
use crate::framing::Framing;
use crate::session::{EventStream, decode_frames};
use async_trait::async_trait;
use serde::Serialize;
use std::collections::HashMap;
use tokio_util::sync::CancellationToken;

/// Begin marker of the legacy marker-delimited framing.
pub const FRAME_BEGIN: &str = "<<chat>>";
/// End marker of the legacy marker-delimited framing.
pub const FRAME_END: &str = "<</chat>>";

/// Which protocol generation the service speaks.
///
/// The generation is fixed per configuration; it selects both the send
/// endpoint path and the framing of the response body. It is never
/// auto-detected within a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Generation {
    /// Newline-delimited frames, `POST {base}/chat`.
    #[default]
    Current,
    /// Marker-delimited frames, `POST {base}/embed/chat`. Responses may also
    /// carry the untagged legacy envelope events.
    LegacyEmbed,
}

impl Generation {
    /// The framing variant this generation uses.
    pub fn framing(&self) -> Framing {
        match self {
            Generation::Current => Framing::Newline,
            Generation::LegacyEmbed => Framing::marker(FRAME_BEGIN, FRAME_END),
        }
    }

    fn chat_path(&self) -> &'static str {
        match self {
            Generation::Current => "/chat",
            Generation::LegacyEmbed => "/embed/chat",
        }
    }
}

/// Body of a send request.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SendRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Opaque continuation token from the last `state` event, forwarded
    /// verbatim.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub variables: HashMap<String, String>,
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub secrets: HashMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub locale: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub custom_greeting: Option<String>,
    #[serde(skip_serializing_if = "is_false")]
    pub contact_center: bool,
    /// Whether the client is long-polling for human-agent output.
    #[serde(skip_serializing_if = "is_false")]
    pub polling: bool,
    #[serde(skip_serializing_if = "is_false")]
    pub end_conversation: bool,
    /// Conversation id assigned by a legacy-generation envelope.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
}

/// Body of a long-poll request.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PollRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub variables: HashMap<String, String>,
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub secrets: HashMap<String, String>,
    /// Opaque cursor from the last `livePollCursor` event.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cursor: Option<serde_json::Value>,
}

fn is_false(value: &bool) -> bool {
    !*value
}

/// Transport for streamed exchanges with the chat service.
///
/// The engine talks to the service exclusively through this trait, so tests
/// substitute scripted implementations.
#[async_trait]
pub trait ChatTransport: Send + Sync {
    /// POST a message and stream back the decoded updates.
    async fn send(&self, request: SendRequest, cancel: CancellationToken) -> Result<EventStream>;

    /// Open one long-poll and stream back the decoded updates.
    async fn poll(&self, request: PollRequest, cancel: CancellationToken) -> Result<EventStream>;
}

/// Production transport over reqwest.
pub struct HttpChatTransport {
    client: reqwest::Client,
    base_url: String,
    generation: Generation,
}

impl HttpChatTransport {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_generation(base_url, Generation::default())
    }

    pub fn with_generation(base_url: impl Into<String>, generation: Generation) -> Self {
        let mut base_url = base_url.into();
        while base_url.ends_with('/') {
            base_url.pop();
        }
        Self {
            client: reqwest::Client::new(),
            base_url,
            generation,
        }
    }

    pub fn generation(&self) -> Generation {
        self.generation
    }

    async fn open<B: Serialize + Sync>(
        &self,
        path: &str,
        body: &B,
        cancel: CancellationToken,
    ) -> Result<EventStream> {
        let url = format!("{}{}", self.base_url, path);
        tracing::debug!(%url, "opening chat stream");

        let response = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Error::Aborted),
            response = self.client.post(&url).json(body).send() => response?,
        };

        // Status is checked before any body bytes are decoded; buffered
        // body content of a failed response is never surfaced as events.
        let status = response.status();
        if !status.is_success() {
            tracing::warn!(%url, status = status.as_u16(), "chat request rejected");
            return Err(Error::Status(status.as_u16()));
        }

        Ok(decode_frames(
            response.bytes_stream(),
            self.generation.framing(),
            cancel,
        ))
    }
}

#[async_trait]
impl ChatTransport for HttpChatTransport {
    async fn send(&self, request: SendRequest, cancel: CancellationToken) -> Result<EventStream> {
        self.open(self.generation.chat_path(), &request, cancel).await
    }

    async fn poll(&self, request: PollRequest, cancel: CancellationToken) -> Result<EventStream> {
        self.open("/chat/live/poll", &request, cancel).await
    }
}
