//! Tag normalization and comparison policy.

use std::borrow::Cow;
use std::collections::HashSet;

use serde_json::Value;

use crate::errors::AppError;

/// How tags are compared, both when matching and when rejecting duplicates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TagCase {
    /// Plain string equality.
    #[default]
    Sensitive,
    /// Equality of the lowercased forms.
    Insensitive,
}

impl TagCase {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sensitive" | "exact" => Some(TagCase::Sensitive),
            "insensitive" | "lower" | "lowercase" => Some(TagCase::Insensitive),
            _ => None,
        }
    }

    /// Comparison key for a tag under this policy.
    pub fn key<'a>(&self, tag: &'a str) -> Cow<'a, str> {
        match self {
            TagCase::Sensitive => Cow::Borrowed(tag),
            TagCase::Insensitive => Cow::Owned(tag.to_lowercase()),
        }
    }

    pub fn same(&self, a: &str, b: &str) -> bool {
        self.key(a) == self.key(b)
    }
}

/// Trim tags for storage, rejecting blank entries and dropping repeats.
pub fn normalize_tags(tags: &[String], case: TagCase) -> Result<Vec<String>, AppError> {
    let mut seen = HashSet::new();
    let mut out = Vec::with_capacity(tags.len());

    for tag in tags {
        let trimmed = tag.trim();
        if trimmed.is_empty() {
            return Err(AppError::Validation("Tags must not be blank".to_string()));
        }
        if seen.insert(case.key(trimmed).into_owned()) {
            out.push(trimmed.to_string());
        } else {
            tracing::debug!(tag = trimmed, "Dropping repeated tag");
        }
    }

    Ok(out)
}

/// Append a single tag, refusing one that is already present.
pub fn add_tag(tags: &mut Vec<String>, tag: &str, case: TagCase) -> Result<(), AppError> {
    let trimmed = tag.trim();
    if trimmed.is_empty() {
        return Err(AppError::Validation("Tag must not be blank".to_string()));
    }
    if tags.iter().any(|existing| case.same(existing, trimmed)) {
        return Err(AppError::Validation(format!(
            "Tag '{}' is already present",
            trimmed
        )));
    }
    tags.push(trimmed.to_string());
    Ok(())
}

/// Parse a stored JSON tag array.
///
/// Entries that are not strings are skipped with a warning, as is a column
/// that does not hold an array at all. `owner` names the row for the log.
pub fn parse_stored_tags(raw: &str, owner: &str) -> Vec<String> {
    let values: Vec<Value> = match serde_json::from_str(raw) {
        Ok(v) => v,
        Err(e) => {
            tracing::warn!(owner, error = %e, "Ignoring malformed tag column");
            return Vec::new();
        }
    };

    values
        .into_iter()
        .filter_map(|value| match value {
            Value::String(s) => Some(s),
            other => {
                tracing::warn!(owner, entry = %other, "Skipping non-string tag entry");
                None
            }
        })
        .collect()
}
