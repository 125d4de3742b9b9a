//! Routing rules, topic naming, and the bounded routing-decision cache
//! (spec §3 "Routing rule", §4.5 "Routing"/"Topic naming").

use std::collections::HashSet;

use indexmap::IndexMap;
use parking_lot::Mutex;

use crate::schema::{CanonicalRecord, RoutingKey};

const MAX_TOPIC_LENGTH: usize = 249;

/// Whether matching `conditions` selects or excludes the record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Polarity {
    Include,
    Exclude,
}

/// Structural match over a record's (exchange, symbol, data-type);
/// unset sets match anything (spec §3 "conditions match any combination ...").
#[derive(Debug, Clone, Default)]
pub struct RoutingConditions {
    pub exchanges: Option<HashSet<String>>,
    pub symbols: Option<HashSet<String>>,
    pub data_type_tags: Option<HashSet<String>>,
    pub polarity: Option<Polarity>,
}

impl RoutingConditions {
    pub fn matches(&self, record: &CanonicalRecord) -> bool {
        let structural = self.exchanges.as_ref().is_none_or(|s| s.contains(&record.exchange))
            && self.symbols.as_ref().is_none_or(|s| s.contains(&record.symbol))
            && self.data_type_tags.as_ref().is_none_or(|s| s.contains(&record.data_type.as_tag()));
        match self.polarity {
            Some(Polarity::Exclude) => !structural,
            _ => structural,
        }
    }
}

/// One channel this rule delivers to, with the topic template that
/// channel's outbound message should carry (spec §4.5 "Topic naming").
#[derive(Debug, Clone)]
pub struct RoutingTarget {
    pub channel_id: String,
    /// e.g. `{prefix}.{exchange}.{type}.{symbol}`.
    pub topic_template: String,
}

#[derive(Debug, Clone)]
pub struct RoutingRule {
    /// Higher values evaluate first.
    pub priority: i32,
    pub conditions: RoutingConditions,
    pub targets: Vec<RoutingTarget>,
    /// If true, a match stops evaluation of lower-priority rules.
    pub short_circuit: bool,
}

/// The result of evaluating the rule list for one record: which
/// channels receive it, the topic each was assigned, and the ordering
/// key (spec §5 "Ordering keys emitted to C5 ...").
#[derive(Debug, Clone)]
pub struct RoutingDecision {
    pub targets: Vec<RoutingTarget>,
    pub ordering_key: String,
}

pub struct RoutingTable {
    rules: Vec<RoutingRule>,
    default_target: RoutingTarget,
    default_topic_template: String,
    cache_capacity: usize,
    cache: Mutex<IndexMap<RoutingKey, RoutingDecision>>,
}

impl RoutingTable {
    pub fn new(mut rules: Vec<RoutingRule>, default_channel_id: impl Into<String>, default_topic_template: impl Into<String>, cache_capacity: usize) -> Self {
        rules.sort_by(|a, b| b.priority.cmp(&a.priority));
        let default_topic_template = default_topic_template.into();
        Self {
            rules,
            default_target: RoutingTarget { channel_id: default_channel_id.into(), topic_template: default_topic_template.clone() },
            default_topic_template,
            cache_capacity,
            cache: Mutex::new(IndexMap::new()),
        }
    }

    /// Replaces the rule list and drops the cache (spec §4.5 "the cache
    /// is invalidated whenever rules change").
    pub fn set_rules(&mut self, mut rules: Vec<RoutingRule>) {
        rules.sort_by(|a, b| b.priority.cmp(&a.priority));
        self.rules = rules;
        self.cache.lock().clear();
    }

    pub fn resolve(&self, record: &CanonicalRecord) -> RoutingDecision {
        let key = record.routing_key();
        if let Some(cached) = self.cache.lock().get(&key) {
            return cached.clone();
        }

        let mut targets = Vec::new();
        for rule in &self.rules {
            if rule.conditions.matches(record) {
                targets.extend(rule.targets.iter().cloned());
                if rule.short_circuit {
                    break;
                }
            }
        }
        if targets.is_empty() {
            targets.push(self.default_target.clone());
        }
        let decision = RoutingDecision { targets, ordering_key: format!("{}|{}", record.exchange, record.symbol) };

        let mut cache = self.cache.lock();
        if cache.len() >= self.cache_capacity {
            cache.shift_remove_index(0);
        }
        cache.insert(key, decision.clone());
        decision
    }

    pub fn default_topic_template(&self) -> &str {
        &self.default_topic_template
    }
}

/// Expands a topic template's `{field}` placeholders and normalizes the
/// result to the wire's topic-name grammar (spec §6 "Topic namespace":
/// lowercase alphanumeric plus `._-`, max 249 chars).
pub fn render_topic(template: &str, prefix: &str, environment: &str, record: &CanonicalRecord) -> String {
    let expanded = template
        .replace("{prefix}", prefix)
        .replace("{environment}", environment)
        .replace("{exchange}", &record.exchange)
        .replace("{symbol}", &record.symbol)
        .replace("{type}", &record.data_type.as_tag());
    normalize_topic_name(&expanded)
}

pub fn normalize_topic_name(raw: &str) -> String {
    let mut normalized: String = raw
        .to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '.' || c == '-' || c == '_' { c } else { '-' })
        .collect();
    normalized.truncate(MAX_TOPIC_LENGTH);
    while normalized.ends_with(['-', '.', '_']) {
        normalized.pop();
    }
    normalized
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{DataType, Payload, Side, TradeData};
    use rust_decimal::Decimal;

    fn sample_record() -> CanonicalRecord {
        CanonicalRecord {
            exchange: "binance".into(),
            symbol: "BTC/USDT".into(),
            data_type: DataType::Trade,
            timestamp: 1,
            received_at: 2,
            data: Payload::Trade(TradeData { id: "1".into(), price: Decimal::ONE, quantity: Decimal::ONE, side: Side::Buy }),
            skip_batching: false,
        }
    }

    #[test]
    fn unmatched_record_uses_default_target() {
        let table = RoutingTable::new(vec![], "durable", "{prefix}.{exchange}.{type}.{symbol}", 16);
        let decision = table.resolve(&sample_record());
        assert_eq!(decision.targets.len(), 1);
        assert_eq!(decision.targets[0].channel_id, "durable");
    }

    #[test]
    fn matching_rule_routes_to_its_targets() {
        let rule = RoutingRule {
            priority: 10,
            conditions: RoutingConditions { exchanges: Some(["binance".to_string()].into()), ..Default::default() },
            targets: vec![RoutingTarget { channel_id: "broadcast".into(), topic_template: "{exchange}.{symbol}".into() }],
            short_circuit: true,
        };
        let table = RoutingTable::new(vec![rule], "durable", "default.{exchange}", 16);
        let decision = table.resolve(&sample_record());
        assert_eq!(decision.targets[0].channel_id, "broadcast");
    }

    #[test]
    fn exclude_polarity_inverts_match() {
        let rule = RoutingRule {
            priority: 10,
            conditions: RoutingConditions { exchanges: Some(["coinbase".to_string()].into()), polarity: Some(Polarity::Exclude), ..Default::default() },
            targets: vec![RoutingTarget { channel_id: "cache".into(), topic_template: "x".into() }],
            short_circuit: true,
        };
        let table = RoutingTable::new(vec![rule], "durable", "default", 16);
        // record is "binance", so excluding "coinbase" matches (not coinbase) -> rule fires
        let decision = table.resolve(&sample_record());
        assert_eq!(decision.targets[0].channel_id, "cache");
    }

    #[test]
    fn ordering_key_defaults_to_exchange_symbol() {
        let table = RoutingTable::new(vec![], "durable", "default", 16);
        let decision = table.resolve(&sample_record());
        assert_eq!(decision.ordering_key, "binance|BTC/USDT");
    }

    #[test]
    fn topic_template_is_normalized_to_lowercase_dash_form() {
        let record = sample_record();
        let rendered = render_topic("{prefix}.{exchange}.{type}.{symbol}", "md", "prod", &record);
        assert_eq!(rendered, "md.binance.trade.btc-usdt");
    }

    #[test]
    fn topic_name_is_truncated_to_max_length() {
        let long = "a".repeat(300);
        let rendered = normalize_topic_name(&long);
        assert_eq!(rendered.len(), MAX_TOPIC_LENGTH);
    }

    #[test]
    fn cache_respects_capacity_bound() {
        let table = RoutingTable::new(vec![], "durable", "default.{symbol}", 2);
        for i in 0..5 {
            let mut record = sample_record();
            record.symbol = format!("SYM{i}/USDT");
            table.resolve(&record);
        }
        assert!(table.cache.lock().len() <= 2);
    }
}
