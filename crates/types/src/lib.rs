//! Validated value types shared across the consent workspace.
//!
//! These types carry their invariants in the type system so that the core never has to
//! re-validate a title, a reason or a principal identifier once it has been constructed.

use std::fmt;
use std::str::FromStr;

/// Errors that can occur when creating validated text types.
#[derive(Debug, thiserror::Error)]
pub enum TextError {
    /// The input text was empty or contained only whitespace
    #[error("Text cannot be empty")]
    Empty,
}

/// A string type that guarantees non-empty content.
///
/// This type wraps a `String` and ensures it contains at least one non-whitespace character.
/// The input is automatically trimmed of leading and trailing whitespace during construction.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NonEmptyText(String);

impl NonEmptyText {
    /// Creates a new `NonEmptyText` from the given input.
    ///
    /// The input is trimmed of leading and trailing whitespace. If the trimmed
    /// result is empty, an error is returned.
    pub fn new(input: impl AsRef<str>) -> Result<Self, TextError> {
        let trimmed = input.as_ref().trim();
        if trimmed.is_empty() {
            return Err(TextError::Empty);
        }
        Ok(Self(trimmed.to_owned()))
    }

    /// Returns the inner string as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Number of characters (not bytes) in the text.
    pub fn char_len(&self) -> usize {
        self.0.chars().count()
    }
}

impl fmt::Display for NonEmptyText {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for NonEmptyText {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl serde::Serialize for NonEmptyText {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> serde::Deserialize<'de> for NonEmptyText {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        NonEmptyText::new(&s).map_err(serde::de::Error::custom)
    }
}

/// Maximum accepted length of a principal identifier, in bytes.
pub const MAX_PRINCIPAL_LEN: usize = 128;

/// Errors raised when parsing a principal identifier.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum PrincipalError {
    #[error("principal identifier cannot be empty")]
    Empty,
    #[error("principal identifier exceeds {MAX_PRINCIPAL_LEN} bytes")]
    TooLong,
    #[error("principal identifier contains invalid character {0:?}")]
    InvalidCharacter(char),
}

/// An opaque, globally unique identity (for example a wallet address).
///
/// Principals compare case-insensitively. The identifier is normalised to lowercase on
/// construction so that `Eq`, `Hash` and `Ord` all agree with that rule.
///
/// Accepted characters are ASCII letters, digits and `: . _ - @`. Anything else (whitespace,
/// control characters, non-ASCII) is treated as a malformed identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Principal(String);

impl Principal {
    /// Parses and normalises a principal identifier.
    pub fn parse(input: impl AsRef<str>) -> Result<Self, PrincipalError> {
        let trimmed = input.as_ref().trim();
        if trimmed.is_empty() {
            return Err(PrincipalError::Empty);
        }
        if trimmed.len() > MAX_PRINCIPAL_LEN {
            return Err(PrincipalError::TooLong);
        }
        if let Some(bad) = trimmed
            .chars()
            .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, ':' | '.' | '_' | '-' | '@')))
        {
            return Err(PrincipalError::InvalidCharacter(bad));
        }
        Ok(Self(trimmed.to_ascii_lowercase()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Principal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Principal {
    type Err = PrincipalError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Principal::parse(s)
    }
}

impl AsRef<str> for Principal {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl serde::Serialize for Principal {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> serde::Deserialize<'de> for Principal {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Principal::parse(&s).map_err(serde::de::Error::custom)
    }
}

/// Error returned when a role name is not recognised.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("unknown role: {0}")]
pub struct UnknownRole(pub String);

/// Role a principal holds in the system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Patient,
    Doctor,
    Admin,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Patient => "patient",
            Role::Doctor => "doctor",
            Role::Admin => "admin",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = UnknownRole;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "patient" => Ok(Role::Patient),
            "doctor" => Ok(Role::Doctor),
            "admin" => Ok(Role::Admin),
            other => Err(UnknownRole(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn non_empty_text_trims_and_rejects_blank() {
        assert_eq!(NonEmptyText::new("  report ").unwrap().as_str(), "report");
        assert!(matches!(NonEmptyText::new("   "), Err(TextError::Empty)));
    }

    #[test]
    fn principal_is_case_insensitive() {
        let a = Principal::parse("0xABCdef").unwrap();
        let b = Principal::parse("0xabcDEF").unwrap();
        assert_eq!(a, b);
        assert_eq!(a.as_str(), "0xabcdef");
    }

    #[test]
    fn principal_rejects_malformed_input() {
        assert_eq!(Principal::parse(""), Err(PrincipalError::Empty));
        assert_eq!(
            Principal::parse("0x12 34"),
            Err(PrincipalError::InvalidCharacter(' '))
        );
        assert_eq!(
            Principal::parse("a".repeat(MAX_PRINCIPAL_LEN + 1)),
            Err(PrincipalError::TooLong)
        );
    }

    #[test]
    fn principal_deserialises_normalised() {
        let p: Principal = serde_json::from_str("\"0xDEAD\"").unwrap();
        assert_eq!(p.as_str(), "0xdead");
        assert!(serde_json::from_str::<Principal>("\"\"").is_err());
    }

    #[test]
    fn role_round_trips_through_str() {
        assert_eq!("Doctor".parse::<Role>().unwrap(), Role::Doctor);
        assert!("nurse".parse::<Role>().is_err());
    }
}
