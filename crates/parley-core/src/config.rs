//! Engine configuration.

use std::fmt;
use std::sync::Arc;

use crate::error::ParleyError;
use crate::events::EventSink;
use crate::origin::{AllowedOrigins, normalize_origin};
use crate::validation::PayloadValidator;

/// What kind of browsing context the peer endpoint is. The engine treats
/// both identically; transports differ in endpoint acquisition and liveness.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PeerKind {
    Iframe,
    Window,
}

/// Liveness monitoring knobs.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HeartbeatConfig {
    pub enabled: bool,
    pub interval_ms: u64,
    pub timeout_ms: u64,
    pub max_misses: u32,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_ms: 5_000,
            timeout_ms: 2_000,
            max_misses: 3,
        }
    }
}

pub const DEFAULT_HANDSHAKE_TIMEOUT_MS: u64 = 10_000;

#[derive(Clone)]
pub struct EngineConfig {
    pub peer_kind: PeerKind,
    pub allowed_origins: AllowedOrigins,
    pub heartbeat: HeartbeatConfig,
    /// When set, an inbound origin rejection during the handshake fails the
    /// in-flight `connect` instead of letting it idle out.
    pub strict_origin: bool,
    /// Explicit opt-in for posting with the `"*"` target origin.
    pub allow_any_target_origin: bool,
    /// This document's own origin; used as the outbound target for
    /// same-origin deployments where no peer origin is declared.
    pub local_origin: Option<String>,
    pub handshake_timeout_ms: u64,
    /// Analytics sink receiving a copy of every lifecycle event.
    pub sink: Option<Arc<dyn EventSink>>,
    /// Schema validator; defaults to the structural [`JsonTypeValidator`].
    ///
    /// [`JsonTypeValidator`]: crate::validation::JsonTypeValidator
    pub validator: Option<Arc<dyn PayloadValidator>>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            peer_kind: PeerKind::Iframe,
            allowed_origins: AllowedOrigins::Any,
            heartbeat: HeartbeatConfig::default(),
            strict_origin: false,
            allow_any_target_origin: false,
            local_origin: None,
            handshake_timeout_ms: DEFAULT_HANDSHAKE_TIMEOUT_MS,
            sink: None,
            validator: None,
        }
    }
}

impl fmt::Debug for EngineConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineConfig")
            .field("peer_kind", &self.peer_kind)
            .field("allowed_origins", &self.allowed_origins)
            .field("heartbeat", &self.heartbeat)
            .field("strict_origin", &self.strict_origin)
            .field("allow_any_target_origin", &self.allow_any_target_origin)
            .field("local_origin", &self.local_origin)
            .field("handshake_timeout_ms", &self.handshake_timeout_ms)
            .field("sink", &self.sink.as_ref().map(|_| "<sink>"))
            .field("validator", &self.validator.as_ref().map(|_| "<validator>"))
            .finish()
    }
}

impl EngineConfig {
    pub fn validate(&self) -> Result<(), ParleyError> {
        if self.allowed_origins.is_empty_list() {
            return Err(ParleyError::config(
                "allowed_origins list is empty; nothing could ever be admitted",
            ));
        }
        if self.handshake_timeout_ms == 0 {
            return Err(ParleyError::config("handshake_timeout_ms must be nonzero"));
        }
        if self.heartbeat.enabled {
            if self.heartbeat.interval_ms == 0 {
                return Err(ParleyError::config("heartbeat interval_ms must be nonzero"));
            }
            if self.heartbeat.timeout_ms == 0 {
                return Err(ParleyError::config("heartbeat timeout_ms must be nonzero"));
            }
            if self.heartbeat.max_misses == 0 {
                return Err(ParleyError::config("heartbeat max_misses must be nonzero"));
            }
        }
        if let Some(local) = &self.local_origin {
            normalize_origin(local)
                .map_err(|e| ParleyError::config(format!("bad local_origin: {e}")))?;
        }
        Ok(())
    }
}
