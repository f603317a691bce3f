//! Topic matching and rewriting
//!
//! A relay rule binds a wildcard pattern on the source broker to a template
//! on the destination broker. Matching a concrete topic against the pattern
//! yields the text each wildcard stood for; rewriting substitutes those
//! captures into the template's wildcard positions in order.

mod pattern;
pub mod validation;

pub use pattern::{match_topic, rewrite, Captures, Level, TopicPattern};
pub use validation::{validate_pattern, validate_topic_name, TopicLevel};

use std::fmt;

/// Errors in topic patterns, templates and rewrites
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TopicError {
    /// Pattern or topic is empty
    Empty,
    /// Longer than an MQTT string allows
    TooLong,
    /// Contains a null character
    NullCharacter,
    /// Contains `//`, or a leading or trailing `/`
    EmptyLevel,
    /// `+` or `#` shares a level with other characters
    PartialWildcard,
    /// `#` appears before the last level
    MultiWildcardNotLast,
    /// A concrete topic name contains a wildcard
    WildcardInName,
    /// Template wildcards differ from the pattern's in number, kind or order
    TemplateMismatch { pattern: String, template: String },
    /// Rewrite given a different number of captures than the template needs
    CaptureCount { expected: usize, actual: usize },
}

impl fmt::Display for TopicError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Empty => write!(f, "topic cannot be empty"),
            Self::TooLong => write!(f, "topic exceeds maximum length"),
            Self::NullCharacter => write!(f, "topic cannot contain null character"),
            Self::EmptyLevel => write!(f, "topic cannot contain empty levels"),
            Self::PartialWildcard => write!(f, "wildcard must occupy entire level"),
            Self::MultiWildcardNotLast => write!(f, "multi-level wildcard must be last level"),
            Self::WildcardInName => write!(f, "topic name cannot contain wildcards"),
            Self::TemplateMismatch { pattern, template } => write!(
                f,
                "template '{}' does not use the wildcards of pattern '{}' in order",
                template, pattern
            ),
            Self::CaptureCount { expected, actual } => write!(
                f,
                "template needs {} captures, got {}",
                expected, actual
            ),
        }
    }
}

impl std::error::Error for TopicError {}
