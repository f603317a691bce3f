//! Relay Rule Configuration

use serde::Deserialize;

/// Direction a rule relays in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleDirection {
    /// Source broker to destination broker only
    #[default]
    OneWay,
    /// Also relay destination to source with the rewrite inverted
    Bidirectional,
}

/// One entry of the `rules` array
#[derive(Debug, Clone, Deserialize)]
pub struct RuleConfig {
    /// Name used in logs and metrics (defaults to the rule's index)
    #[serde(default)]
    pub name: Option<String>,

    /// Wildcard pattern on the source broker
    pub source_topic: String,

    /// Destination template using the same wildcards as `source_topic`
    pub dest_topic: String,

    #[serde(default)]
    pub direction: RuleDirection,

    /// Topic prefix for this rule only, replacing `relay.topic_prefix`.
    /// An empty string turns the relay-wide prefix off for the rule.
    #[serde(default)]
    pub prefix: Option<String>,

    /// Content filters; absent means forward everything
    #[serde(default)]
    pub filters: FiltersConfig,

    /// Subscription QoS for `source_topic`
    #[serde(default = "default_qos")]
    pub qos: u8,
}

/// The `filters` object of a rule
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct FiltersConfig {
    /// Minimum priority: low, medium, normal or high
    pub priority_min: Option<String>,
    /// Values of `type` that are dropped
    pub type_blocklist: Vec<String>,
    /// Maximum age of `timestamp` in seconds
    pub max_age_seconds: Option<u64>,
    /// Fields that must be present and non-null
    pub required_fields: Vec<String>,
}

fn default_qos() -> u8 {
    1
}

impl RuleConfig {
    pub fn new(source_topic: impl Into<String>, dest_topic: impl Into<String>) -> Self {
        Self {
            name: None,
            source_topic: source_topic.into(),
            dest_topic: dest_topic.into(),
            direction: RuleDirection::default(),
            prefix: None,
            filters: FiltersConfig::default(),
            qos: default_qos(),
        }
    }

    pub fn is_bidirectional(&self) -> bool {
        self.direction == RuleDirection::Bidirectional
    }
}
