//! Topic name and pattern validation
//!
//! Key rules:
//! - Topic names MUST NOT contain wildcards (+ or #)
//! - Patterns and templates MAY contain wildcards
//! - Multi-level wildcard (#) must be the last level and occupy it entirely
//! - Single-level wildcard (+) must occupy an entire level
//! - Relay patterns never contain empty levels (`a//b`, `/a`, `a/`)

use super::TopicError;

/// Longest topic an MQTT string can carry
pub const MAX_TOPIC_LEN: usize = 65535;

/// Represents a level in a topic
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TopicLevel<'a> {
    /// Normal topic level
    Normal(&'a str),
    /// Single-level wildcard (+)
    SingleWildcard,
    /// Multi-level wildcard (#)
    MultiWildcard,
}

/// Parse topic into levels
pub fn parse_levels(topic: &str) -> impl Iterator<Item = TopicLevel<'_>> {
    topic.split('/').map(|level| match level {
        "+" => TopicLevel::SingleWildcard,
        "#" => TopicLevel::MultiWildcard,
        s => TopicLevel::Normal(s),
    })
}

/// Validate a source pattern or destination template
///
/// - Must be at least 1 character and at most 65535 bytes
/// - Must not contain null character
/// - Must not contain empty levels
/// - `+` and `#` must occupy an entire level; `#` must be last
pub fn validate_pattern(pattern: &str) -> Result<(), TopicError> {
    if pattern.is_empty() {
        return Err(TopicError::Empty);
    }

    if pattern.len() > MAX_TOPIC_LEN {
        return Err(TopicError::TooLong);
    }

    if pattern.contains('\0') {
        return Err(TopicError::NullCharacter);
    }

    let level_count = pattern.split('/').count();
    for (i, level) in pattern.split('/').enumerate() {
        if level.is_empty() {
            return Err(TopicError::EmptyLevel);
        }

        if level.contains('#') {
            if level != "#" {
                return Err(TopicError::PartialWildcard);
            }
            if i != level_count - 1 {
                return Err(TopicError::MultiWildcardNotLast);
            }
        }

        if level.contains('+') && level != "+" {
            return Err(TopicError::PartialWildcard);
        }
    }

    Ok(())
}

/// Validate a concrete topic name (used in PUBLISH)
///
/// Topic names:
/// - Must be at least 1 character
/// - Must not exceed 65535 bytes
/// - Must not contain null character
/// - Must not contain wildcards (+ or #)
pub fn validate_topic_name(topic: &str) -> Result<(), TopicError> {
    if topic.is_empty() {
        return Err(TopicError::Empty);
    }

    if topic.len() > MAX_TOPIC_LEN {
        return Err(TopicError::TooLong);
    }

    if topic.contains('\0') {
        return Err(TopicError::NullCharacter);
    }

    if topic.contains(['+', '#']) {
        return Err(TopicError::WildcardInName);
    }

    Ok(())
}
