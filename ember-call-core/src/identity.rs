//! User identity types
//!
//! Account identifiers are assigned by the backend as numeric ids. The
//! numeric ordering matters: simultaneous-offer collisions are resolved by
//! comparing the two identities, so `UserId` is `Ord`.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::num::ParseIntError;
use std::str::FromStr;

/// Backend-assigned numeric account identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct UserId(pub u64);

impl UserId {
    /// Create a user id from its raw numeric value
    #[must_use]
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Raw numeric value
    #[must_use]
    pub const fn as_u64(&self) -> u64 {
        self.0
    }

    /// Transport destination this user receives call signals on
    #[must_use]
    pub fn signal_destination(&self) -> String {
        format!("call-signals/{}", self.0)
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for UserId {
    type Err = ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(s.trim().parse()?))
    }
}

impl From<u64> for UserId {
    fn from(raw: u64) -> Self {
        Self(raw)
    }
}

/// A remote party as shown in call UI: account id plus display name.
///
/// The display name travels with the offer signal so an incoming call can
/// render a caller card before any profile lookup completes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Peer {
    /// Account identifier
    pub id: UserId,
    /// Profile display name at the time the call was placed
    pub display_name: String,
}

impl Peer {
    /// Create a peer record
    pub fn new(id: impl Into<UserId>, display_name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            display_name: display_name.into(),
        }
    }
}

impl fmt::Display for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.display_name, self.id)
    }
}
