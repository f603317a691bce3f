//! Relay Rule Registry
//!
//! Compiles the configured rules once at startup into an immutable, ordered
//! registry shared by every relay direction. Lookups walk the rules in
//! declaration order and the first match wins; there is no fan-out.

use std::fmt;

use crate::config::{
    normalize_prefix, Config, ConfigError, RelayOptions, RuleConfig, RuleDirection,
};
use crate::filter::FilterChain;
use crate::protocol::QoS;
use crate::topic::{Captures, TopicError, TopicPattern};

/// Which way a message travels through a rule
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Flow {
    /// Source broker to destination broker
    Forward,
    /// Destination broker back to source, for bidirectional rules
    Reverse,
}

impl Flow {
    pub fn as_str(&self) -> &'static str {
        match self {
            Flow::Forward => "forward",
            Flow::Reverse => "reverse",
        }
    }
}

impl fmt::Display for Flow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A compiled relay rule
#[derive(Debug, Clone)]
pub struct RelayRule {
    /// Configured name, or the rule's index
    pub id: String,
    pub source: TopicPattern,
    pub dest: TopicPattern,
    pub direction: RuleDirection,
    pub filters: FilterChain,
    /// Subscription QoS
    pub qos: QoS,
    /// Topic prefix on the destination side: the rule's own, else the
    /// relay-wide one
    pub prefix: Option<String>,
}

impl RelayRule {
    /// Compile one configured rule. `default_prefix` applies unless the
    /// rule sets its own; an empty rule prefix turns prefixing off.
    pub fn compile(
        index: usize,
        config: &RuleConfig,
        default_prefix: Option<&str>,
    ) -> Result<Self, ConfigError> {
        let id = config.name.clone().unwrap_or_else(|| index.to_string());
        let rule_error = |message: String| ConfigError::Rule {
            rule: id.clone(),
            message,
        };

        let source = TopicPattern::parse(&config.source_topic)
            .map_err(|e| rule_error(format!("source_topic '{}': {}", config.source_topic, e)))?;
        let dest = TopicPattern::parse(&config.dest_topic)
            .map_err(|e| rule_error(format!("dest_topic '{}': {}", config.dest_topic, e)))?;
        source
            .check_template(&dest)
            .map_err(|e| rule_error(e.to_string()))?;

        let filters =
            FilterChain::from_config(&config.filters).map_err(|e| rule_error(e.to_string()))?;
        let qos = QoS::from_u8(config.qos)
            .ok_or_else(|| rule_error("qos must be 0, 1, or 2".to_string()))?;

        let prefix = match config.prefix.as_deref() {
            Some(own) => normalize_prefix(own),
            None => default_prefix,
        };

        Ok(Self {
            id,
            source,
            dest,
            direction: config.direction,
            filters,
            qos,
            prefix: prefix.map(str::to_string),
        })
    }

    /// Does this rule relay in the given flow?
    pub fn applies_to(&self, flow: Flow) -> bool {
        match flow {
            Flow::Forward => true,
            Flow::Reverse => self.direction == RuleDirection::Bidirectional,
        }
    }

    /// Pattern matched against inbound topics in this flow
    pub fn pattern(&self, flow: Flow) -> &TopicPattern {
        match flow {
            Flow::Forward => &self.source,
            Flow::Reverse => &self.dest,
        }
    }

    /// Template rewritten into for this flow
    pub fn template(&self, flow: Flow) -> &TopicPattern {
        match flow {
            Flow::Forward => &self.dest,
            Flow::Reverse => &self.source,
        }
    }

    /// The part of an inbound topic this rule matches against. Reverse
    /// topics lose the prefix; without it they are not this rule's.
    fn unprefixed<'t>(&self, flow: Flow, topic: &'t str) -> Option<&'t str> {
        match (flow, &self.prefix) {
            (Flow::Reverse, Some(prefix)) => topic
                .strip_prefix(prefix.as_str())
                .and_then(|rest| rest.strip_prefix('/')),
            _ => Some(topic),
        }
    }

    /// Topic filter the subscriber of this flow uses for the rule
    fn subscription_filter(&self, flow: Flow) -> String {
        match (flow, &self.prefix) {
            (Flow::Reverse, Some(prefix)) => format!("{}/{}", prefix, self.dest),
            _ => self.pattern(flow).to_string(),
        }
    }
}

/// A topic filter subscribed on behalf of one or more rules
#[derive(Debug, Clone, PartialEq)]
pub struct RuleSubscription {
    /// Subscription Identifier, the filter's 1-based position in its flow
    pub id: u32,
    pub filter: TopicPattern,
    /// Highest QoS asked for by the rules sharing the filter
    pub qos: QoS,
}

/// A rule matched for an inbound topic
#[derive(Debug)]
pub struct RuleMatch<'a> {
    pub rule: &'a RelayRule,
    pub captures: Captures,
}

/// Immutable ordered set of relay rules
#[derive(Debug, Clone, Default)]
pub struct RuleRegistry {
    rules: Vec<RelayRule>,
    forward: Vec<RuleSubscription>,
    reverse: Vec<RuleSubscription>,
}

impl RuleRegistry {
    /// Compile every rule of a validated configuration
    pub fn build(config: &Config) -> Result<Self, ConfigError> {
        Self::from_config(&config.rules, &config.relay)
    }

    pub fn from_config(rules: &[RuleConfig], options: &RelayOptions) -> Result<Self, ConfigError> {
        let default_prefix = options.normalized_prefix();
        let rules = rules
            .iter()
            .enumerate()
            .map(|(index, rule)| RelayRule::compile(index, rule, default_prefix))
            .collect::<Result<Vec<_>, _>>()?;

        let forward = Self::collect_subscriptions(&rules, Flow::Forward)?;
        let reverse = Self::collect_subscriptions(&rules, Flow::Reverse)?;
        Ok(Self {
            rules,
            forward,
            reverse,
        })
    }

    /// One entry per distinct filter, in rule order, at the highest QoS
    fn collect_subscriptions(
        rules: &[RelayRule],
        flow: Flow,
    ) -> Result<Vec<RuleSubscription>, ConfigError> {
        let mut out: Vec<RuleSubscription> = Vec::new();

        for rule in rules.iter().filter(|r| r.applies_to(flow)) {
            let filter = rule.subscription_filter(flow);
            if let Some(existing) = out.iter_mut().find(|s| s.filter.as_str() == filter) {
                existing.qos = existing.qos.max(rule.qos);
                continue;
            }

            let pattern = TopicPattern::parse(&filter).map_err(|e| ConfigError::Rule {
                rule: rule.id.clone(),
                message: format!("subscription '{}': {}", filter, e),
            })?;
            out.push(RuleSubscription {
                id: out.len() as u32 + 1,
                filter: pattern,
                qos: rule.qos,
            });
        }

        Ok(out)
    }

    pub fn rules(&self) -> &[RelayRule] {
        &self.rules
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Whether any rule relays destination to source
    pub fn has_reverse(&self) -> bool {
        self.rules.iter().any(|r| r.applies_to(Flow::Reverse))
    }

    /// Find the first rule whose pattern matches `topic` in this flow.
    ///
    /// In the reverse flow each rule strips its own prefix before matching;
    /// topics without it never match that rule.
    pub fn find(&self, flow: Flow, topic: &str) -> Option<RuleMatch<'_>> {
        self.rules
            .iter()
            .filter(|rule| rule.applies_to(flow))
            .find_map(|rule| {
                let topic = rule.unprefixed(flow, topic)?;
                rule.pattern(flow)
                    .matches(topic)
                    .map(|captures| RuleMatch { rule, captures })
            })
    }

    /// Rewrite a match into its outbound topic.
    ///
    /// In the forward flow the rule's prefix is prepended.
    pub fn rewrite(&self, flow: Flow, matched: &RuleMatch<'_>) -> Result<String, TopicError> {
        let topic = matched.rule.template(flow).rewrite(&matched.captures)?;
        match (flow, &matched.rule.prefix) {
            (Flow::Forward, Some(prefix)) => Ok(format!("{}/{}", prefix, topic)),
            _ => Ok(topic),
        }
    }

    /// Match and rewrite in one step, ignoring filters
    pub fn route(&self, flow: Flow, topic: &str) -> Option<(&RelayRule, String)> {
        let matched = self.find(flow, topic)?;
        let rewritten = self.rewrite(flow, &matched).ok()?;
        Some((matched.rule, rewritten))
    }

    /// Topic filters the subscriber of this flow needs, in rule order.
    /// A filter used by several rules is subscribed once at the highest QoS.
    pub fn subscriptions(&self, flow: Flow) -> &[RuleSubscription] {
        match flow {
            Flow::Forward => &self.forward,
            Flow::Reverse => &self.reverse,
        }
    }

    /// Identifier of the subscription that delivers `topic` on its own
    /// behalf: the first granted filter matching it. Copies a broker sends
    /// for any other overlapping filter are duplicates.
    pub fn owning_subscription(&self, flow: Flow, topic: &str, refused: &[u32]) -> Option<u32> {
        self.subscriptions(flow)
            .iter()
            .filter(|s| !refused.contains(&s.id))
            .find(|s| s.filter.matches(topic).is_some())
            .map(|s| s.id)
    }
}
