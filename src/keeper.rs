use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::KeeperError;

/// Unique identifier for an API client.
///
/// Keys are opaque: they are compared byte for byte and never normalized.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Key(String);

impl Key {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for Key {
    fn from(raw: &str) -> Self {
        Self(raw.to_string())
    }
}

impl From<String> for Key {
    fn from(raw: String) -> Self {
        Self(raw)
    }
}

impl AsRef<str> for Key {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Usage statistics for one key.
///
/// `0 <= remaining <= limit` holds for every record a store hands out.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stats {
    /// Number of remaining calls for this key
    pub remaining: i64,
    /// Total limit for this key
    pub limit: i64,
}

impl Stats {
    /// A fresh record with the whole limit available.
    pub fn full(limit: i64) -> Self {
        Self {
            remaining: limit,
            limit,
        }
    }

    pub fn is_exhausted(&self) -> bool {
        self.remaining <= 0
    }
}

/// Outcome of a successful [`Keeper::allow`] call.
///
/// A denial is a normal result, not an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// The call was admitted and `remaining` was decremented once.
    Granted(Stats),
    /// The quota is exhausted; nothing was mutated.
    Denied(Stats),
}

impl Admission {
    pub fn is_granted(&self) -> bool {
        matches!(self, Admission::Granted(_))
    }

    pub fn stats(&self) -> Stats {
        match self {
            Admission::Granted(stats) | Admission::Denied(stats) => *stats,
        }
    }
}

/// Storage-agnostic quota contract.
///
/// Implementations must make the check-and-decrement in [`allow`](Keeper::allow)
/// indivisible for concurrent calls on the same key. Dropping the returned
/// future cancels the call; a cancelled call never commits a decrement.
#[async_trait]
pub trait Keeper: Send + Sync {
    /// Check whether the key may make a call, consuming one unit if so.
    async fn allow(&self, key: &Key) -> Result<Admission, KeeperError>;

    /// Current statistics for the key. Never mutates state.
    async fn stats(&self, key: &Key) -> Result<Stats, KeeperError>;
}
