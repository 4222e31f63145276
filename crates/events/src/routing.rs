//! Routing key normalization and composition.
//!
//! Keys are dot-joined segments. Every segment is lowercase, limited to
//! `[a-z0-9-]`, and never starts, ends, or repeats a hyphen. Normalizing an
//! already-normalized key is a no-op.

use core::fmt;

use thiserror::Error;

use crate::topology::{COMMANDS_SEGMENT, QUEUE_PREFIX};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum NamingError {
    /// Nothing was left of a segment after normalization.
    #[error("routing segment {0:?} is empty after normalization")]
    EmptySegment(String),

    /// A key was requested with zero segments.
    #[error("routing key needs at least one segment")]
    NoSegments,

    /// Version tags start at 1.
    #[error("version must be an integer >= 1, got {0}")]
    InvalidVersion(i64),
}

/// A normalized, dot-separated routing key.
///
/// Only constructible through the builders in this module, so holding one
/// means the key is already canonical.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RoutingKey(String);

impl RoutingKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RoutingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for RoutingKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Normalize a single routing segment.
///
/// Lowercases, strips quotes, turns underscores, whitespace and slashes into
/// hyphens, drops anything outside `[a-z0-9-]`, collapses hyphen runs and
/// trims hyphens at both ends.
pub fn normalize_segment(value: &str) -> Result<String, NamingError> {
    let mut out = String::with_capacity(value.len());

    for ch in value.chars().flat_map(char::to_lowercase) {
        match ch {
            '"' | '\'' | '`' => {}
            'a'..='z' | '0'..='9' => out.push(ch),
            '-' | '_' | '/' => push_hyphen(&mut out),
            c if c.is_whitespace() => push_hyphen(&mut out),
            _ => {}
        }
    }

    while out.ends_with('-') {
        out.pop();
    }

    if out.is_empty() {
        return Err(NamingError::EmptySegment(value.to_string()));
    }
    Ok(out)
}

fn push_hyphen(out: &mut String) {
    if !out.is_empty() && !out.ends_with('-') {
        out.push('-');
    }
}

/// Join normalized segments with `.`.
pub fn build_key<I>(segments: I) -> Result<RoutingKey, NamingError>
where
    I: IntoIterator,
    I::Item: fmt::Display,
{
    let normalized = segments
        .into_iter()
        .map(|segment| normalize_segment(&segment.to_string()))
        .collect::<Result<Vec<_>, _>>()?;

    if normalized.is_empty() {
        return Err(NamingError::NoSegments);
    }
    Ok(RoutingKey(normalized.join(".")))
}

/// Canonicalize an externally supplied key: empty segments are dropped and
/// the rest re-normalized.
pub fn normalize_key(existing: &str) -> Result<RoutingKey, NamingError> {
    build_key(existing.split('.').filter(|segment| !segment.trim().is_empty()))
}

/// `1` → `"v1"`.
pub fn format_version_tag(version: i64) -> Result<String, NamingError> {
    if version < 1 {
        return Err(NamingError::InvalidVersion(version));
    }
    Ok(format!("v{version}"))
}

/// `domain.action.vN`
pub fn event_routing_key(domain: &str, action: &str, version: i64) -> Result<RoutingKey, NamingError> {
    let tag = format_version_tag(version)?;
    build_key([domain, action, tag.as_str()])
}

/// `commands.target.action.vN`
pub fn command_routing_key(target: &str, action: &str, version: i64) -> Result<RoutingKey, NamingError> {
    let tag = format_version_tag(version)?;
    build_key([COMMANDS_SEGMENT, target, action, tag.as_str()])
}

/// `q.<service>`; dotted service names keep their dots.
pub fn queue_name(service_name: &str) -> Result<String, NamingError> {
    let service = normalize_key(service_name)?;
    Ok(format!("{QUEUE_PREFIX}.{service}"))
}

/// Topic-exchange pattern matching: `*` matches exactly one segment, `#`
/// matches zero or more.
pub fn topic_matches(pattern: &str, key: &str) -> bool {
    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = key.split('.').collect();
    match_words(&pattern, &key)
}

fn match_words(pattern: &[&str], key: &[&str]) -> bool {
    match pattern.split_first() {
        None => key.is_empty(),
        Some((&"#", rest)) => (0..=key.len()).any(|skip| match_words(rest, &key[skip..])),
        Some((&"*", rest)) => !key.is_empty() && match_words(rest, &key[1..]),
        Some((word, rest)) => key.first() == Some(word) && match_words(rest, &key[1..]),
    }
}
