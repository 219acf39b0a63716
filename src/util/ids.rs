//! Identifier types and allocation-id generation.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Length of generated allocation identifiers.
pub const ALLOC_ID_LEN: usize = 8;

/// Identifier of a target (board, VM, network segment...).
pub type TargetId = String;

/// Identity string handed over by the authentication layer.
pub type UserId = String;

/// Opaque allocation identifier, unique for the life of the server.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AllocId(String);

impl AllocId {
    /// Generate a fresh random identifier.
    ///
    /// Uniqueness against live allocations is the caller's job; the engine
    /// retries on collision.
    #[must_use]
    pub fn generate() -> Self {
        let raw = uuid::Uuid::new_v4().simple().to_string();
        Self(raw[..ALLOC_ID_LEN].to_string())
    }

    /// Parse an externally supplied identifier, rejecting anything outside
    /// `[_a-zA-Z0-9]+`.
    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        if is_valid_alloc_id(raw) {
            Some(Self(raw.to_string()))
        } else {
            None
        }
    }

    /// Borrow the identifier text.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AllocId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// True when `raw` only holds characters valid in an allocation id.
#[must_use]
pub fn is_valid_alloc_id(raw: &str) -> bool {
    !raw.is_empty() && raw.chars().all(|c| c == '_' || c.is_ascii_alphanumeric())
}
