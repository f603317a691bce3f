//! Content filters
//!
//! A rule may carry an ordered chain of filter clauses. Clauses run in order
//! and the first failure rejects the message with that clause's reason.
//! An empty chain accepts everything without looking at the payload.

mod content;

#[cfg(test)]
mod tests;

pub use content::EvaluableContent;

use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::config::FiltersConfig;

/// Message priority levels, lowest first
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Priority {
    Low,
    Medium,
    Normal,
    High,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Low => "low",
            Priority::Medium => "medium",
            Priority::Normal => "normal",
            Priority::High => "high",
        }
    }
}

impl FromStr for Priority {
    type Err = UnknownPriority;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        [
            Priority::Low,
            Priority::Medium,
            Priority::Normal,
            Priority::High,
        ]
        .into_iter()
        .find(|p| p.as_str().eq_ignore_ascii_case(s))
        .ok_or_else(|| UnknownPriority(s.to_string()))
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A priority string that is not one of the known levels
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownPriority(pub String);

impl fmt::Display for UnknownPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "unknown priority '{}' (expected low, medium, normal or high)",
            self.0
        )
    }
}

impl std::error::Error for UnknownPriority {}

/// Why a message was dropped by a filter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RejectReason {
    PriorityBelowThreshold,
    TypeBlocked,
    TooOld,
    MissingField,
}

impl RejectReason {
    pub const ALL: [RejectReason; 4] = [
        RejectReason::PriorityBelowThreshold,
        RejectReason::TypeBlocked,
        RejectReason::TooOld,
        RejectReason::MissingField,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RejectReason::PriorityBelowThreshold => "priority_below_threshold",
            RejectReason::TypeBlocked => "type_blocked",
            RejectReason::TooOld => "too_old",
            RejectReason::MissingField => "missing_field",
        }
    }
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of running a filter chain
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Accept,
    Reject(RejectReason),
}

/// A single content predicate
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FilterClause {
    /// `priority` must be a known level at or above the threshold
    PriorityMin(Priority),
    /// `type`, when present, must not be in the set
    TypeBlocklist(HashSet<String>),
    /// `timestamp` (epoch seconds) must be at most this many seconds old
    MaxAgeSeconds(u64),
    /// Every named field must be present and non-null
    RequiredFields(Vec<String>),
}

impl FilterClause {
    /// Evaluate against decoded content. `now` is epoch seconds.
    pub fn evaluate(&self, content: &EvaluableContent, now: f64) -> Result<(), RejectReason> {
        match self {
            FilterClause::RequiredFields(names) => {
                if names.iter().all(|name| content.has_field(name)) {
                    Ok(())
                } else {
                    Err(RejectReason::MissingField)
                }
            }
            FilterClause::PriorityMin(threshold) => {
                let rank = match content {
                    EvaluableContent::Structured { priority, .. } => priority
                        .as_deref()
                        .and_then(|p| p.parse::<Priority>().ok()),
                    EvaluableContent::Opaque => None,
                };
                match rank {
                    Some(rank) if rank >= *threshold => Ok(()),
                    _ => Err(RejectReason::PriorityBelowThreshold),
                }
            }
            FilterClause::TypeBlocklist(blocked) => match content {
                EvaluableContent::Structured { kind, .. } => match kind {
                    Some(kind) if blocked.contains(kind) => Err(RejectReason::TypeBlocked),
                    _ => Ok(()),
                },
                // There is no type to check an opaque payload against
                EvaluableContent::Opaque => Err(RejectReason::TypeBlocked),
            },
            FilterClause::MaxAgeSeconds(max_age) => {
                let timestamp = match content {
                    EvaluableContent::Structured { timestamp, .. } => *timestamp,
                    EvaluableContent::Opaque => None,
                };
                match timestamp {
                    Some(ts) if now - ts <= *max_age as f64 => Ok(()),
                    _ => Err(RejectReason::TooOld),
                }
            }
        }
    }
}

/// Ordered, fail-fast chain of filter clauses
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FilterChain {
    clauses: Vec<FilterClause>,
}

impl FilterChain {
    pub fn new(clauses: Vec<FilterClause>) -> Self {
        Self { clauses }
    }

    /// Build the chain for a rule's `filters` object.
    ///
    /// Clause order is fixed regardless of key order in the document:
    /// required fields, priority, type blocklist, age. Empty sets add no
    /// clause.
    pub fn from_config(config: &FiltersConfig) -> Result<Self, UnknownPriority> {
        let mut clauses = Vec::with_capacity(4);

        if !config.required_fields.is_empty() {
            clauses.push(FilterClause::RequiredFields(config.required_fields.clone()));
        }
        if let Some(ref level) = config.priority_min {
            clauses.push(FilterClause::PriorityMin(level.parse()?));
        }
        if !config.type_blocklist.is_empty() {
            clauses.push(FilterClause::TypeBlocklist(
                config.type_blocklist.iter().cloned().collect(),
            ));
        }
        if let Some(max_age) = config.max_age_seconds {
            clauses.push(FilterClause::MaxAgeSeconds(max_age));
        }

        Ok(Self { clauses })
    }

    pub fn is_empty(&self) -> bool {
        self.clauses.is_empty()
    }

    pub fn clauses(&self) -> &[FilterClause] {
        &self.clauses
    }

    /// Evaluate a raw payload at time `now`.
    ///
    /// The payload is only decoded when there is at least one clause.
    pub fn evaluate(&self, payload: &[u8], now: SystemTime) -> Verdict {
        if self.clauses.is_empty() {
            return Verdict::Accept;
        }

        let content = EvaluableContent::decode(payload);
        let now = epoch_seconds(now);

        for clause in &self.clauses {
            if let Err(reason) = clause.evaluate(&content, now) {
                return Verdict::Reject(reason);
            }
        }
        Verdict::Accept
    }
}

/// Evaluate `payload` against `filters` at time `now`
pub fn evaluate(payload: &[u8], filters: &FilterChain, now: SystemTime) -> Verdict {
    filters.evaluate(payload, now)
}

fn epoch_seconds(time: SystemTime) -> f64 {
    time.duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}
