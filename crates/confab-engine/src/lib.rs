//! confab-engine: client-side conversation engine for the confab chat service
//!
//! This crate consumes event streams from confab-wire, maintains the
//! conversation state machine (message assembly, placeholder bubbles,
//! transfer and hand-off handling), supervises the human-agent long-poll
//! loop, and fans out ordered change notifications to registered observers.

pub mod config;
pub mod conversation;
pub mod engine;
pub mod error;
pub mod observer;
pub mod poll;

pub use config::EngineConfig;
pub use conversation::{
    Conversation, HandOffState, HumanAgentParticipation, Message, TYPING_PLACEHOLDER, Transfer,
};
pub use engine::ChatEngine;
pub use error::{Error, Result};
pub use observer::ChatObserver;
pub use poll::BackoffConfig;
