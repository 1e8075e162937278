use crate::error::{Error, ErrorKind};
use derive_more::Display;
use std::str::FromStr;

/// A Redmine issue number, exactly as it appeared in the file name.
///
/// Always a non-empty run of ASCII digits. Leading zeros are kept so that
/// the identifier round-trips to the same folder name it was found with.
#[derive(Debug, Display, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
#[cfg_attr(feature = "serde", serde(transparent))]
pub struct TicketId(String);

impl TicketId {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Numeric value, for APIs that want one. `None` if the identifier is
    /// too long to fit (which Redmine would reject anyway).
    pub fn number(&self) -> Option<u64> {
        self.0.parse().ok()
    }
}

impl FromStr for TicketId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
            exn::bail!(ErrorKind::InvalidIdentifier(s.to_string()));
        }
        Ok(Self(s.to_string()))
    }
}

impl TryFrom<String> for TicketId {
    type Error = Error;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<TicketId> for String {
    fn from(value: TicketId) -> Self {
        value.0
    }
}

// Deserializing goes through `FromStr` so a hand-edited journal can't smuggle
// in a non-numeric identifier.
#[cfg(feature = "serde")]
impl<'de> serde::Deserialize<'de> for TicketId {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = <String as serde::Deserialize>::deserialize(deserializer)?;
        value.parse().map_err(|_| serde::de::Error::custom(format!("not a ticket identifier: {value:?}")))
    }
}

impl AsRef<str> for TicketId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
