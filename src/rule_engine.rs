//! Subscription rule engine (§4.6).
//!
//! Grounded in `original_source/objectoplex/rule_engine.py`'s
//! `routing_decision` for the prefix-dispatch structure (`!`/`#`/`@`/plain)
//! and the last-rule-wins verdict accumulation; the path-glob segment
//! matching itself is an upgrade the spec makes explicit over the
//! original's plain string equality.

use crate::object::BusinessObject;

/// Glob-like path matching: split both sides on `/`, a `*` segment
/// matches the remainder of the path (including zero segments), anything
/// else must match the corresponding segment exactly. A `None` pattern
/// is never matched by a literal pattern, but `"*"` matches anything,
/// `None` included.
fn matches(pattern: &str, value: Option<&str>) -> bool {
    if pattern == "*" {
        return true;
    }
    let value = match value {
        Some(v) => v,
        None => return false,
    };
    let mut pattern_segs = pattern.split('/');
    let mut value_segs = value.split('/');
    loop {
        match pattern_segs.next() {
            None => return value_segs.next().is_none(),
            Some("*") => return true,
            Some(p) => match value_segs.next() {
                None => return false,
                Some(v) if v == p => continue,
                Some(_) => return false,
            },
        }
    }
}

/// Decides whether `obj` passes `rules` (an ordered list of subscription
/// rule strings). Every rule is evaluated in order; the last rule that
/// matches wins (§4.6). An empty rule list never matches anything.
pub fn routing_decision(obj: &BusinessObject, rules: &[String]) -> bool {
    let mut verdict = false;

    for raw_rule in rules {
        let (negative, rule) = match raw_rule.strip_prefix('!') {
            Some(rest) => (true, rest),
            None => (false, raw_rule.as_str()),
        };

        if let Some(nature_pattern) = rule.strip_prefix('#') {
            let natures = obj
                .metadata
                .get("natures")
                .and_then(|v| v.as_array())
                .map(|a| a.iter().filter_map(|v| v.as_str()));
            if let Some(natures) = natures {
                for nature in natures {
                    if matches(nature_pattern, Some(nature)) {
                        verdict = !negative;
                        break;
                    }
                }
            }
        } else if let Some(event_pattern) = rule.strip_prefix('@') {
            if let Some(event) = &obj.event {
                if matches(event_pattern, Some(event)) {
                    verdict = !negative;
                }
            }
        } else {
            let obj_type = obj
                .metadata
                .get("type")
                .and_then(|v| v.as_str());
            if rule == "*" || matches(rule, obj_type) {
                verdict = !negative;
            }
        }
    }

    verdict
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{Map, Value};

    fn obj_with(fields: Vec<(&str, Value)>) -> BusinessObject {
        let mut metadata = Map::new();
        for (k, v) in fields {
            metadata.insert(k.to_owned(), v);
        }
        BusinessObject::new(metadata, Vec::new())
    }

    #[test]
    fn star_passes_unless_negated_after() {
        let rules = vec!["*".to_owned(), "!@ping".to_owned()];
        let ping = obj_with(vec![("event", Value::from("ping"))]);
        assert!(!routing_decision(&ping, &rules));

        let text = obj_with(vec![("type", Value::from("text/plain"))]);
        assert!(routing_decision(&text, &rules));
    }

    #[test]
    fn nature_rule() {
        let rules = vec!["#colour".to_owned()];
        let with_nature = obj_with(vec![("natures", Value::from(vec!["colour"]))]);
        assert!(routing_decision(&with_nature, &rules));

        let without_nature = obj_with(vec![]);
        assert!(!routing_decision(&without_nature, &rules));
    }

    #[test]
    fn path_glob_rule() {
        let rules = vec!["a/*".to_owned()];
        let matching = obj_with(vec![("type", Value::from("a/b/c"))]);
        assert!(routing_decision(&matching, &rules));

        let non_matching = obj_with(vec![("type", Value::from("b/a"))]);
        assert!(!routing_decision(&non_matching, &rules));
    }

    #[test]
    fn empty_rules_never_match() {
        let rules: Vec<String> = vec![];
        let obj = obj_with(vec![("type", Value::from("text/plain"))]);
        assert!(!routing_decision(&obj, &rules));
    }

    #[test]
    fn later_rule_overrides_earlier() {
        let rules = vec!["*".to_owned(), "!text/plain".to_owned(), "text/plain".to_owned()];
        let obj = obj_with(vec![("type", Value::from("text/plain"))]);
        assert!(routing_decision(&obj, &rules));
    }

    #[test]
    fn null_type_never_matches_literal_pattern() {
        let rules = vec!["text/plain".to_owned()];
        let obj = obj_with(vec![]);
        assert!(!routing_decision(&obj, &rules));
    }
}
