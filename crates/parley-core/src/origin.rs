//! Origin normalization, inbound admission, and outbound target resolution.
//!
//! Origins are compared in normalized form: lowercase scheme and host,
//! default ports stripped, explicit non-default ports preserved. Opaque
//! origins (`file://`, `data:`) normalize to the literal `"null"`, matching
//! what the browser reports for them.

use std::collections::HashSet;

use thiserror::Error;
use url::Url;

use crate::error::{ErrorCode, ParleyError};

/// The serialization of an opaque origin.
pub const OPAQUE_ORIGIN: &str = "null";

#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("unparseable origin '{origin}'")]
pub struct OriginParseError {
    pub origin: String,
}

/// Normalize an origin string.
pub fn normalize_origin(raw: &str) -> Result<String, OriginParseError> {
    let trimmed = raw.trim();
    if trimmed == OPAQUE_ORIGIN {
        return Ok(OPAQUE_ORIGIN.to_string());
    }
    let url = Url::parse(trimmed).map_err(|_| OriginParseError {
        origin: raw.to_string(),
    })?;
    // `ascii_serialization` lowercases, strips default ports, and yields
    // "null" for opaque origins (file:, data:).
    Ok(url.origin().ascii_serialization())
}

/// Inbound origin policy.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AllowedOrigins {
    /// Admit every source origin.
    Any,
    /// Admit only the listed origins (stored normalized).
    List(HashSet<String>),
}

impl AllowedOrigins {
    pub fn any() -> Self {
        AllowedOrigins::Any
    }

    /// Build an allow list, normalizing every entry. Unparseable entries are
    /// a construction error rather than a silently-dead list item.
    pub fn list<I, S>(origins: I) -> Result<Self, OriginParseError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut set = HashSet::new();
        for origin in origins {
            set.insert(normalize_origin(origin.as_ref())?);
        }
        Ok(AllowedOrigins::List(set))
    }

    pub fn admits(&self, source_origin: &str) -> bool {
        match self {
            AllowedOrigins::Any => true,
            AllowedOrigins::List(set) => match normalize_origin(source_origin) {
                Ok(normalized) => set.contains(&normalized),
                Err(_) => false,
            },
        }
    }

    /// The sole entry of a single-origin allow list.
    pub fn single(&self) -> Option<&str> {
        match self {
            AllowedOrigins::List(set) if set.len() == 1 => set.iter().next().map(String::as_str),
            _ => None,
        }
    }

    pub fn is_empty_list(&self) -> bool {
        matches!(self, AllowedOrigins::List(set) if set.is_empty())
    }
}

/// Decides whether inbound frames are trusted and which target origin
/// outbound posts carry.
#[derive(Clone, Debug)]
pub struct OriginGate {
    allowed: AllowedOrigins,
    local_origin: Option<String>,
    allow_any_target: bool,
}

impl OriginGate {
    pub fn new(
        allowed: AllowedOrigins,
        local_origin: Option<String>,
        allow_any_target: bool,
    ) -> Self {
        Self {
            allowed,
            local_origin,
            allow_any_target,
        }
    }

    /// Admit or reject an inbound frame by its source origin.
    pub fn admit(&self, source_origin: &str) -> bool {
        self.allowed.admits(source_origin)
    }

    /// Compute the target origin for outbound posts.
    ///
    /// Precedence: the peer's declared origin, then a single-entry allow
    /// list, then the local origin (same-origin deployments), then `"*"` —
    /// which is forbidden without the explicit opt-in, since a wildcard
    /// outbound post goes to whichever origin currently owns the peer
    /// endpoint.
    pub fn resolve_target_origin(&self, expected: Option<&str>) -> Result<String, ParleyError> {
        if let Some(origin) = expected {
            return normalize_origin(origin).map_err(|e| ParleyError::Security {
                code: ErrorCode::TargetOriginForbidden,
                origin: e.origin,
            });
        }
        if let Some(origin) = self.allowed.single() {
            return Ok(origin.to_string());
        }
        if let Some(local) = &self.local_origin {
            return Ok(local.clone());
        }
        if matches!(self.allowed, AllowedOrigins::Any) && self.allow_any_target {
            return Ok("*".to_string());
        }
        Err(ParleyError::Security {
            code: ErrorCode::TargetOriginForbidden,
            origin: "*".to_string(),
        })
    }
}
