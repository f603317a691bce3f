//! Filter chain tests

use std::collections::HashSet;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use pretty_assertions::assert_eq;

use super::*;
use crate::config::FiltersConfig;

const T: u64 = 1_700_000_000;

fn at(secs: u64) -> SystemTime {
    UNIX_EPOCH + Duration::from_secs(secs)
}

fn chain(clauses: Vec<FilterClause>) -> FilterChain {
    FilterChain::new(clauses)
}

fn blocklist(types: &[&str]) -> FilterClause {
    FilterClause::TypeBlocklist(types.iter().map(|t| t.to_string()).collect::<HashSet<_>>())
}

#[test]
fn test_priority_ordering() {
    assert!(Priority::Low < Priority::Medium);
    assert!(Priority::Medium < Priority::Normal);
    assert!(Priority::Normal < Priority::High);
    assert_eq!("HIGH".parse::<Priority>(), Ok(Priority::High));
    assert_eq!(
        "urgent".parse::<Priority>(),
        Err(UnknownPriority("urgent".to_string()))
    );
}

#[test]
fn test_empty_chain_accepts_anything() {
    let filters = FilterChain::default();
    assert_eq!(filters.evaluate(b"\x00\x01binary", at(T)), Verdict::Accept);
    assert_eq!(evaluate(b"{}", &filters, at(T)), Verdict::Accept);
}

#[test]
fn test_priority_min_normal() {
    let filters = chain(vec![FilterClause::PriorityMin(Priority::Normal)]);

    assert_eq!(
        filters.evaluate(br#"{"priority":"low"}"#, at(T)),
        Verdict::Reject(RejectReason::PriorityBelowThreshold)
    );
    assert_eq!(
        filters.evaluate(br#"{"priority":"medium"}"#, at(T)),
        Verdict::Reject(RejectReason::PriorityBelowThreshold)
    );
    assert_eq!(
        filters.evaluate(br#"{"priority":"normal"}"#, at(T)),
        Verdict::Accept
    );
    assert_eq!(
        filters.evaluate(br#"{"priority":"high"}"#, at(T)),
        Verdict::Accept
    );
}

#[test]
fn test_priority_min_missing_or_unknown_fails() {
    let filters = chain(vec![FilterClause::PriorityMin(Priority::Low)]);
    let reject = Verdict::Reject(RejectReason::PriorityBelowThreshold);

    assert_eq!(filters.evaluate(br#"{"level":"high"}"#, at(T)), reject);
    assert_eq!(filters.evaluate(br#"{"priority":"urgent"}"#, at(T)), reject);
    assert_eq!(filters.evaluate(br#"{"priority":1}"#, at(T)), reject);
    assert_eq!(filters.evaluate(b"plain text", at(T)), reject);
}

#[test]
fn test_type_blocklist() {
    let filters = chain(vec![blocklist(&["debug"])]);

    assert_eq!(
        filters.evaluate(br#"{"type":"debug"}"#, at(T)),
        Verdict::Reject(RejectReason::TypeBlocked)
    );
    assert_eq!(filters.evaluate(br#"{"type":"info"}"#, at(T)), Verdict::Accept);
    assert_eq!(filters.evaluate(br#"{"value":1}"#, at(T)), Verdict::Accept);
}

#[test]
fn test_max_age_seconds() {
    let filters = chain(vec![FilterClause::MaxAgeSeconds(300)]);
    let payload = |ts: u64| format!(r#"{{"timestamp":{}}}"#, ts);

    assert_eq!(
        filters.evaluate(payload(T - 400).as_bytes(), at(T)),
        Verdict::Reject(RejectReason::TooOld)
    );
    assert_eq!(
        filters.evaluate(payload(T - 10).as_bytes(), at(T)),
        Verdict::Accept
    );
    // boundary is inclusive
    assert_eq!(
        filters.evaluate(payload(T - 300).as_bytes(), at(T)),
        Verdict::Accept
    );
    assert_eq!(
        filters.evaluate(br#"{"timestamp":"2024-01-01T00:00:00"}"#, at(T)),
        Verdict::Reject(RejectReason::TooOld)
    );
    assert_eq!(
        filters.evaluate(br#"{}"#, at(T)),
        Verdict::Reject(RejectReason::TooOld)
    );
}

#[test]
fn test_required_fields() {
    let filters = chain(vec![FilterClause::RequiredFields(vec![
        "priority".to_string(),
    ])]);

    assert_eq!(
        filters.evaluate(br#"{"type":"info"}"#, at(T)),
        Verdict::Reject(RejectReason::MissingField)
    );
    assert_eq!(
        filters.evaluate(br#"{"priority":null}"#, at(T)),
        Verdict::Reject(RejectReason::MissingField)
    );
    assert_eq!(
        filters.evaluate(br#"{"priority":"low"}"#, at(T)),
        Verdict::Accept
    );

    let empty = chain(vec![FilterClause::RequiredFields(vec![])]);
    assert_eq!(empty.evaluate(br#"{}"#, at(T)), Verdict::Accept);
}

#[test]
fn test_chain_is_fail_fast_in_order() {
    let filters = chain(vec![
        FilterClause::RequiredFields(vec!["priority".to_string()]),
        FilterClause::PriorityMin(Priority::Normal),
        blocklist(&["debug"]),
    ]);

    // Missing priority reports the first failing clause
    assert_eq!(
        filters.evaluate(br#"{"type":"debug"}"#, at(T)),
        Verdict::Reject(RejectReason::MissingField)
    );
    assert_eq!(
        filters.evaluate(br#"{"priority":"high","type":"debug"}"#, at(T)),
        Verdict::Reject(RejectReason::TypeBlocked)
    );
    assert_eq!(
        filters.evaluate(br#"{"priority":"high","type":"info"}"#, at(T)),
        Verdict::Accept
    );
}

#[test]
fn test_opaque_payload_fails_every_clause() {
    for clause in [
        FilterClause::PriorityMin(Priority::Low),
        blocklist(&["debug"]),
        FilterClause::MaxAgeSeconds(u64::MAX),
        FilterClause::RequiredFields(vec!["a".to_string()]),
    ] {
        let filters = chain(vec![clause]);
        assert!(matches!(
            filters.evaluate(b"\xde\xad\xbe\xef", at(T)),
            Verdict::Reject(_)
        ));
    }
}

#[test]
fn test_from_config_clause_order() {
    let config: FiltersConfig = serde_json::from_str(
        r#"{"max_age_seconds": 60, "type_blocklist": ["debug"],
            "priority_min": "normal", "required_fields": ["priority"]}"#,
    )
    .unwrap();

    let filters = FilterChain::from_config(&config).unwrap();
    assert_eq!(
        filters.clauses(),
        &[
            FilterClause::RequiredFields(vec!["priority".to_string()]),
            FilterClause::PriorityMin(Priority::Normal),
            blocklist(&["debug"]),
            FilterClause::MaxAgeSeconds(60),
        ]
    );
}

#[test]
fn test_from_config_skips_absent_and_empty() {
    let config: FiltersConfig =
        serde_json::from_str(r#"{"required_fields": [], "type_blocklist": []}"#).unwrap();
    assert!(FilterChain::from_config(&config).unwrap().is_empty());
}

#[test]
fn test_from_config_unknown_priority() {
    let config: FiltersConfig = serde_json::from_str(r#"{"priority_min": "urgent"}"#).unwrap();
    assert_eq!(
        FilterChain::from_config(&config),
        Err(UnknownPriority("urgent".to_string()))
    );
}
