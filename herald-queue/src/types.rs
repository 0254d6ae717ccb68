use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

/// Identifier of a queued message.
///
/// Assigned by the store from a persisted sequence, so ids are strictly
/// increasing in enqueue order and never reused, not even after the row with
/// the highest id has been deleted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(u64);

impl MessageId {
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for MessageId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim().parse().map(Self)
    }
}

impl From<u64> for MessageId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

/// Opaque reference to an account in the user directory.
///
/// `UserId(0)` is the "no user" sentinel producers use for system mail that
/// is neither direct nor tied to an account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(u64);

impl UserId {
    pub const NONE: Self = Self(0);

    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }

    #[must_use]
    pub const fn is_none(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for UserId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim().parse().map(Self)
    }
}

/// Who a message is addressed to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Recipient {
    /// A literal address supplied by the producer; never looked up.
    Direct(String),
    /// An account whose current address is resolved at delivery time.
    ByUser(UserId),
}

impl Recipient {
    #[must_use]
    pub fn direct(address: impl Into<String>) -> Self {
        Self::Direct(address.into())
    }

    #[must_use]
    pub const fn user(id: u64) -> Self {
        Self::ByUser(UserId::new(id))
    }

    /// Reporting classification, derived on every call.
    #[must_use]
    pub const fn class(&self) -> RecipientClass {
        match self {
            Self::Direct(_) => RecipientClass::Direct,
            Self::ByUser(id) if id.is_none() => RecipientClass::Userless,
            Self::ByUser(_) => RecipientClass::User,
        }
    }

    #[must_use]
    pub const fn user_id(&self) -> Option<UserId> {
        match self {
            Self::ByUser(id) if !id.is_none() => Some(*id),
            _ => None,
        }
    }

    #[must_use]
    pub fn direct_address(&self) -> Option<&str> {
        match self {
            Self::Direct(address) => Some(address),
            Self::ByUser(_) => None,
        }
    }
}

impl fmt::Display for Recipient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Direct(address) => write!(f, "direct:{address}"),
            Self::ByUser(id) => write!(f, "user:{id}"),
        }
    }
}

/// Error returned when a recipient string cannot be parsed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Invalid recipient '{0}', expected 'direct:<address>' or 'user:<id>'")]
pub struct ParseRecipientError(pub String);

impl FromStr for Recipient {
    type Err = ParseRecipientError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once(':') {
            Some(("direct", address)) if !address.trim().is_empty() => {
                Ok(Self::Direct(address.trim().to_string()))
            }
            Some(("user", id)) => id
                .parse()
                .map(Self::ByUser)
                .map_err(|_| ParseRecipientError(s.to_string())),
            _ => Err(ParseRecipientError(s.to_string())),
        }
    }
}

/// Reporting tag for a recipient: `direct`, `user` or `userless`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecipientClass {
    Direct,
    User,
    Userless,
}

impl RecipientClass {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Direct => "direct",
            Self::User => "user",
            Self::Userless => "userless",
        }
    }
}

impl fmt::Display for RecipientClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RecipientClass {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "direct" => Ok(Self::Direct),
            "user" => Ok(Self::User),
            "userless" => Ok(Self::Userless),
            other => Err(format!("Unknown recipient class: {other}")),
        }
    }
}

/// Token proving ownership of a claim.
///
/// Each claim gets a fresh ULID; writes presenting an older token are stale.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClaimToken(ulid::Ulid);

impl ClaimToken {
    #[must_use]
    pub fn generate() -> Self {
        Self(ulid::Ulid::new())
    }
}

impl fmt::Display for ClaimToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
