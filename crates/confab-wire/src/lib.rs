//! confab-wire: wire protocol for the confab chat service
//!
//! This crate turns the service's chunked HTTP responses into typed chat
//! updates: framing of the raw body, schema decoding of individual frames,
//! and cancellable streaming sessions over reqwest.

pub mod error;
pub mod event;
pub mod framing;
pub mod session;
pub mod transport;

pub use error::{Error, Result};
pub use event::{Attachment, ChatEvent, Role};
pub use framing::{FrameBuffer, Framing};
pub use session::{EventStream, decode_frames};
pub use transport::{ChatTransport, Generation, HttpChatTransport, PollRequest, SendRequest};
