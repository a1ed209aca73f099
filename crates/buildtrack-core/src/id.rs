//! Build identifiers.

use derive_more::{Display, From};
use serde::{Deserialize, Serialize};

/// Identifier of a build, as assigned by the `builds` table.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Display, From,
)]
#[display("{_0}")]
#[serde(transparent)]
pub struct BuildId(i64);

impl BuildId {
    pub const fn new(id: i64) -> Self {
        Self(id)
    }

    /// Get the underlying database key.
    pub fn as_i64(&self) -> i64 {
        self.0
    }
}

impl From<BuildId> for i64 {
    fn from(id: BuildId) -> Self {
        id.0
    }
}

impl std::str::FromStr for BuildId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(s.parse()?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_and_parse() {
        let id = BuildId::new(42);
        assert_eq!(id.to_string(), "42");
        assert_eq!("42".parse::<BuildId>().unwrap(), id);
        assert!("forty-two".parse::<BuildId>().is_err());
    }

    #[test]
    fn test_serializes_as_plain_integer() {
        let json = serde_json::to_string(&BuildId::new(7)).unwrap();
        assert_eq!(json, "7");
    }
}
