//! Engine configuration.

use crate::poll::BackoffConfig;
use confab_wire::Generation;
use std::collections::HashMap;

/// Configuration for a [`ChatEngine`](crate::engine::ChatEngine).
#[derive(Debug, Clone, Default)]
pub struct EngineConfig {
    /// Channel token identifying the integration.
    pub token: Option<String>,
    /// Locale forwarded with every request.
    pub locale: Option<String>,
    /// Greeting override requested from the service.
    pub custom_greeting: Option<String>,
    /// Variables forwarded with every request.
    pub variables: HashMap<String, String>,
    /// Secrets forwarded with every request.
    pub secrets: HashMap<String, String>,
    /// Ask the service to route synchronous transfers through the contact
    /// center.
    pub contact_center: bool,
    /// Protocol generation the service speaks. Fixes the send endpoint and
    /// the response framing.
    pub generation: Generation,
    /// Long-poll retry pacing.
    pub backoff: BackoffConfig,
}
