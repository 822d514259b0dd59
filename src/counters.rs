//! Conditional counter engine (`spec.md` §4.8): always-on totals plus
//! rule-indexed totals and optional unique-value tracking. Counter failures
//! are logged and swallowed — never cascade into the write pipeline.

use serde_json::Value;

use crate::config::{CounterOp, CounterRulesConfig, PredicateScope};
use crate::error::Result;
use crate::storage::MetadataStore;
use crate::types::Timestamp;

/// Evaluates every configured rule against `meta_view`/`payload_view` and
/// upserts the scope's totals document. Always increments the op bucket;
/// rule buckets only increment when the rule applies to `op` and its
/// predicate matches.
pub fn record_operation(
    store: &dyn MetadataStore,
    rules: &CounterRulesConfig,
    scope_key: &str,
    op: CounterOp,
    meta_view: &Value,
    payload_view: &Value,
    now: Timestamp,
) -> Result<()> {
    let rules = rules.rules.clone();
    let meta_view = meta_view.clone();
    let payload_view = payload_view.clone();

    store.update_counter_totals(
        scope_key,
        Box::new(move |totals| {
            bump(&mut totals.created, &mut totals.updated, &mut totals.deleted, op);
            totals.last_at = Some(now);

            for rule in &rules {
                if !rule.on.contains(&op) {
                    continue;
                }
                let view = match rule.scope {
                    PredicateScope::Meta => &meta_view,
                    PredicateScope::Payload => &payload_view,
                };
                if !evaluate_predicate(&rule.when, view) {
                    continue;
                }
                let rule_totals = totals.rules.entry(rule.name.clone()).or_default();
                bump(
                    &mut rule_totals.created,
                    &mut rule_totals.updated,
                    &mut rule_totals.deleted,
                    op,
                );
                if let Some(unique_props) = &rule.count_unique {
                    for prop in unique_props {
                        if let Some(value) = lookup_dotted(view, prop) {
                            if let Some(s) = value_to_unique_string(value) {
                                rule_totals.record_unique(prop, s);
                            }
                        }
                    }
                }
            }
        }),
    )
}

fn bump(created: &mut u64, updated: &mut u64, deleted: &mut u64, op: CounterOp) {
    match op {
        CounterOp::Create => *created += 1,
        CounterOp::Update => *updated += 1,
        CounterOp::Delete => *deleted += 1,
    }
}

fn value_to_unique_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// Walks a dot path (`a.b.c`) against a JSON object tree.
pub fn lookup_dotted<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = value;
    for segment in path.split('.') {
        current = current.as_object()?.get(segment)?;
    }
    Some(current)
}

/// Evaluates a `when` predicate map: every declared path must match its
/// condition (shorthand equality, or an operator object).
pub fn evaluate_predicate(when: &std::collections::HashMap<String, Value>, view: &Value) -> bool {
    when.iter().all(|(path, condition)| {
        let value = lookup_dotted(view, path);
        matches_condition(value, condition)
    })
}

fn matches_condition(value: Option<&Value>, condition: &Value) -> bool {
    if let Some(obj) = condition.as_object() {
        let has_operator = obj.keys().any(|k| k.starts_with('$'));
        if has_operator {
            return obj.iter().all(|(op, arg)| match op.as_str() {
                "$eq" => value == Some(arg),
                "$ne" => value != Some(arg),
                "$in" => arg
                    .as_array()
                    .map(|arr| value.map(|v| arr.contains(v)).unwrap_or(false))
                    .unwrap_or(false),
                "$nin" => arg
                    .as_array()
                    .map(|arr| !value.map(|v| arr.contains(v)).unwrap_or(false))
                    .unwrap_or(true),
                "$exists" => {
                    let want = arg.as_bool().unwrap_or(true);
                    value.is_some() == want
                }
                "$gt" => numeric_cmp(value, arg, |a, b| a > b),
                "$gte" => numeric_cmp(value, arg, |a, b| a >= b),
                "$lt" => numeric_cmp(value, arg, |a, b| a < b),
                "$lte" => numeric_cmp(value, arg, |a, b| a <= b),
                "$regex" => match (value.and_then(Value::as_str), arg.as_str()) {
                    (Some(s), Some(pattern)) => regex::Regex::new(pattern).map(|re| re.is_match(s)).unwrap_or(false),
                    _ => false,
                },
                _ => false,
            });
        }
    }
    value == Some(condition)
}

fn numeric_cmp(value: Option<&Value>, arg: &Value, cmp: impl Fn(f64, f64) -> bool) -> bool {
    match (value.and_then(Value::as_f64), arg.as_f64()) {
        (Some(a), Some(b)) => cmp(a, b),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CounterRule;
    use crate::storage::RedbMetadataStore;
    use serde_json::json;
    use std::collections::HashMap;
    use tempfile::tempdir;

    fn active_rule() -> CounterRule {
        CounterRule {
            name: "active".to_string(),
            on: vec![CounterOp::Create, CounterOp::Update],
            scope: PredicateScope::Meta,
            when: HashMap::from([("status".to_string(), json!("active"))]),
            count_unique: None,
        }
    }

    #[test]
    fn test_evaluate_predicate_shorthand_equality() {
        let when = HashMap::from([("status".to_string(), json!("active"))]);
        assert!(evaluate_predicate(&when, &json!({"status": "active"})));
        assert!(!evaluate_predicate(&when, &json!({"status": "pending"})));
    }

    #[test]
    fn test_evaluate_predicate_missing_path_is_undefined() {
        let when = HashMap::from([("status".to_string(), json!("active"))]);
        assert!(!evaluate_predicate(&when, &json!({})));
    }

    #[test]
    fn test_evaluate_predicate_operators() {
        let when = HashMap::from([("age".to_string(), json!({"$gte": 18}))]);
        assert!(evaluate_predicate(&when, &json!({"age": 21})));
        assert!(!evaluate_predicate(&when, &json!({"age": 10})));
    }

    #[test]
    fn test_evaluate_predicate_regex() {
        let when = HashMap::from([("email".to_string(), json!({"$regex": "^a.*@x$"}))]);
        assert!(evaluate_predicate(&when, &json!({"email": "alice@x"})));
        assert!(!evaluate_predicate(&when, &json!({"email": "bob@x"})));
    }

    #[test]
    fn test_record_operation_bumps_totals_and_rule() {
        let dir = tempdir().unwrap();
        let store = RedbMetadataStore::open(dir.path().join("t.redb")).unwrap();
        let rules = CounterRulesConfig { rules: vec![active_rule()] };
        record_operation(
            &store,
            &rules,
            "scope",
            CounterOp::Create,
            &json!({"status": "active"}),
            &json!({}),
            Timestamp::now(),
        )
        .unwrap();
        record_operation(
            &store,
            &rules,
            "scope",
            CounterOp::Create,
            &json!({"status": "pending"}),
            &json!({}),
            Timestamp::now(),
        )
        .unwrap();
        let totals = store.get_counter_totals("scope").unwrap().unwrap();
        assert_eq!(totals.created, 2);
        assert_eq!(totals.rules["active"].created, 1);
    }

    #[test]
    fn test_record_operation_count_unique() {
        let dir = tempdir().unwrap();
        let store = RedbMetadataStore::open(dir.path().join("t.redb")).unwrap();
        let mut rule = active_rule();
        rule.count_unique = Some(vec!["status".to_string()]);
        let rules = CounterRulesConfig { rules: vec![rule] };
        record_operation(
            &store,
            &rules,
            "scope",
            CounterOp::Create,
            &json!({"status": "active"}),
            &json!({}),
            Timestamp::now(),
        )
        .unwrap();
        let totals = store.get_counter_totals("scope").unwrap().unwrap();
        assert_eq!(totals.rules["active"].unique["status"], vec!["active".to_string()]);
    }
}
