//! Pieces shared by access and transfer requests.

use crate::constants::{DELETED_TITLE_SUFFIX, MAX_FREE_TEXT_LEN};
use crate::error::{ConsentError, ConsentResult};
use consent_types::NonEmptyText;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Urgency {
    #[default]
    Routine,
    Urgent,
    Emergency,
}

impl Urgency {
    pub fn as_str(&self) -> &'static str {
        match self {
            Urgency::Routine => "routine",
            Urgency::Urgent => "urgent",
            Urgency::Emergency => "emergency",
        }
    }
}

impl fmt::Display for Urgency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Urgency {
    type Err = ConsentError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "routine" => Ok(Urgency::Routine),
            "urgent" => Ok(Urgency::Urgent),
            "emergency" => Ok(Urgency::Emergency),
            other => Err(ConsentError::Validation(format!("unknown urgency: {other}"))),
        }
    }
}

/// Purpose statement: trimmed, at least `min_len` characters, at most [`MAX_FREE_TEXT_LEN`].
pub(crate) fn purpose_text(input: &str, min_len: usize) -> ConsentResult<NonEmptyText> {
    let trimmed = input.trim();
    let len = trimmed.chars().count();
    if len < min_len.max(1) {
        return Err(ConsentError::Validation(format!(
            "purpose must be at least {min_len} characters"
        )));
    }
    required_text("purpose", trimmed)
}

/// Non-empty free text within [`MAX_FREE_TEXT_LEN`].
pub(crate) fn required_text(field: &'static str, input: &str) -> ConsentResult<NonEmptyText> {
    let trimmed = input.trim();
    if trimmed.chars().count() > MAX_FREE_TEXT_LEN {
        return Err(ConsentError::Validation(format!(
            "{field} exceeds {MAX_FREE_TEXT_LEN} characters"
        )));
    }
    NonEmptyText::new(trimmed)
        .map_err(|_| ConsentError::Validation(format!("{field} must not be empty")))
}

/// Optional free text; blank input becomes `None`.
pub(crate) fn optional_text(
    field: &'static str,
    input: Option<&str>,
) -> ConsentResult<Option<NonEmptyText>> {
    match input.map(str::trim) {
        None | Some("") => Ok(None),
        Some(text) => required_text(field, text).map(Some),
    }
}

/// `"Title"` → `"Title (Deleted)"`, applied once.
pub(crate) fn deleted_title(title: &str) -> String {
    if title.ends_with(DELETED_TITLE_SUFFIX) {
        title.to_string()
    } else {
        format!("{title}{DELETED_TITLE_SUFFIX}")
    }
}
