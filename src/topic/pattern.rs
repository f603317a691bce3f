//! Wildcard patterns, captures and template rewriting

use std::fmt;

use smallvec::SmallVec;

use super::validation::{parse_levels, validate_pattern, validate_topic_name, TopicLevel};
use super::TopicError;

/// One level of a parsed pattern or template
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Level {
    Literal(String),
    /// `+`
    Single,
    /// `#`, always the last level
    Multi,
}

impl Level {
    fn is_wildcard(&self) -> bool {
        !matches!(self, Level::Literal(_))
    }
}

/// Text matched by each wildcard of a pattern, in pattern order.
///
/// A `+` capture is exactly one level. A `#` capture is the remaining levels
/// joined by `/`, and is empty when `#` matched zero levels.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Captures(SmallVec<[String; 4]>);

impl Captures {
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&str> {
        self.0.get(index).map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }
}

impl<S: Into<String>> FromIterator<S> for Captures {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        Captures(iter.into_iter().map(Into::into).collect())
    }
}

/// A validated wildcard pattern (or destination template).
///
/// Patterns are parsed once at load time; matching and rewriting never
/// re-validate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicPattern {
    raw: String,
    levels: Vec<Level>,
}

impl TopicPattern {
    pub fn parse(pattern: &str) -> Result<Self, TopicError> {
        validate_pattern(pattern)?;

        let levels = parse_levels(pattern)
            .map(|level| match level {
                TopicLevel::Normal(s) => Level::Literal(s.to_string()),
                TopicLevel::SingleWildcard => Level::Single,
                TopicLevel::MultiWildcard => Level::Multi,
            })
            .collect();

        Ok(Self {
            raw: pattern.to_string(),
            levels,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn levels(&self) -> &[Level] {
        &self.levels
    }

    /// Number of `+` and `#` levels
    pub fn wildcard_count(&self) -> usize {
        self.levels.iter().filter(|l| l.is_wildcard()).count()
    }

    pub fn has_wildcards(&self) -> bool {
        self.wildcard_count() > 0
    }

    /// Check that `template` uses the same wildcards as this pattern, with
    /// the same kinds in the same order. `#` is trailing in both by
    /// construction, so a `#` capture can only land in a trailing position.
    pub fn check_template(&self, template: &TopicPattern) -> Result<(), TopicError> {
        let ours = self.levels.iter().filter(|l| l.is_wildcard());
        let theirs = template.levels.iter().filter(|l| l.is_wildcard());

        if ours.eq(theirs) {
            Ok(())
        } else {
            Err(TopicError::TemplateMismatch {
                pattern: self.raw.clone(),
                template: template.raw.clone(),
            })
        }
    }

    /// Match a concrete topic name against this pattern.
    ///
    /// Returns the captures on a match. Topics that are not valid names,
    /// topics with empty levels, and `$` topics against a pattern starting
    /// with a wildcard never match.
    pub fn matches(&self, topic: &str) -> Option<Captures> {
        if validate_topic_name(topic).is_err() {
            return None;
        }

        if topic.starts_with('$') && self.levels.first().is_some_and(Level::is_wildcard) {
            return None;
        }

        let mut captures = Captures::default();
        let mut remaining = topic;
        let mut exhausted = false;

        for level in &self.levels {
            if let Level::Multi = level {
                if !exhausted && remaining.split('/').any(str::is_empty) {
                    return None;
                }
                captures.0.push(if exhausted {
                    String::new()
                } else {
                    remaining.to_string()
                });
                return Some(captures);
            }

            if exhausted {
                return None;
            }

            let (head, tail) = match remaining.split_once('/') {
                Some((head, tail)) => (head, Some(tail)),
                None => (remaining, None),
            };
            if head.is_empty() {
                return None;
            }

            match level {
                Level::Literal(expected) if expected != head => return None,
                Level::Literal(_) => {}
                Level::Single | Level::Multi => captures.0.push(head.to_string()),
            }

            match tail {
                Some(tail) => remaining = tail,
                None => exhausted = true,
            }
        }

        exhausted.then_some(captures)
    }

    /// Substitute captures into this template's wildcard positions.
    ///
    /// Literal levels pass through. An empty `#` capture drops the trailing
    /// level entirely, so `b/#` with nothing captured becomes `b`.
    pub fn rewrite(&self, captures: &Captures) -> Result<String, TopicError> {
        let expected = self.wildcard_count();
        if captures.len() != expected {
            return Err(TopicError::CaptureCount {
                expected,
                actual: captures.len(),
            });
        }

        let mut out = String::with_capacity(self.raw.len() + 16);
        let mut next = captures.iter();

        for level in &self.levels {
            let text = match level {
                Level::Literal(s) => s.as_str(),
                Level::Single | Level::Multi => next.next().unwrap_or_default(),
            };

            if text.is_empty() {
                // Only a `#` capture can be empty, and it is the last level
                continue;
            }
            if !out.is_empty() {
                out.push('/');
            }
            out.push_str(text);
        }

        if out.is_empty() {
            return Err(TopicError::Empty);
        }
        Ok(out)
    }
}

impl fmt::Display for TopicPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

/// Match `topic` against `pattern`
pub fn match_topic(topic: &str, pattern: &TopicPattern) -> Option<Captures> {
    pattern.matches(topic)
}

/// Rewrite `captures` into `template`
pub fn rewrite(captures: &Captures, template: &TopicPattern) -> Result<String, TopicError> {
    template.rewrite(captures)
}
