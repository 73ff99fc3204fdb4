//! Broker-side filter evaluation for the in-memory bus.
//!
//! Real brokers evaluate a SQL-92 subset over application properties; the
//! proxy only ever installs conjunctions of equality terms (e.g.
//! `toAgent = 'writer' AND fromProxy = 'proxy-1'`) and the accept-all
//! rule `1=1`, so that is the grammar supported here.

use std::collections::HashMap;

/// Evaluate a filter rule against a message's application properties.
///
/// Supported grammar: `1=1`, `key = 'value'`, and `AND`-conjunctions of
/// those. Malformed terms evaluate to false (the broker drops what it
/// cannot match).
pub fn filter_matches(rule: &str, properties: &HashMap<String, String>) -> bool {
    let rule = rule.trim();
    if rule.is_empty() {
        return true;
    }
    rule.split(" AND ")
        .map(str::trim)
        .all(|term| term_matches(term, properties))
}

fn term_matches(term: &str, properties: &HashMap<String, String>) -> bool {
    if term.replace(' ', "") == "1=1" {
        return true;
    }
    let Some((key, value)) = parse_equality(term) else {
        return false;
    };
    properties.get(key).map(String::as_str) == Some(value)
}

/// Split `key = 'value'` into its parts, tolerating whitespace.
fn parse_equality(term: &str) -> Option<(&str, &str)> {
    let (key, rest) = term.split_once('=')?;
    let key = key.trim();
    let rest = rest.trim();
    let value = rest.strip_prefix('\'')?.strip_suffix('\'')?;
    if key.is_empty() {
        return None;
    }
    Some((key, value))
}

/// Extract the quoted agent id from a `toAgent = '<id>'` term inside a
/// filter rule, when one is present.
pub fn to_agent_target(rule: &str) -> Option<&str> {
    rule.split(" AND ")
        .map(str::trim)
        .filter_map(parse_equality)
        .find(|(key, _)| *key == "toAgent")
        .map(|(_, value)| value)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn props(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn accept_all_rules() {
        let p = props(&[("toAgent", "writer")]);
        assert!(filter_matches("1=1", &p));
        assert!(filter_matches("1 = 1", &p));
        assert!(filter_matches("", &p));
    }

    #[test]
    fn equality_term() {
        let p = props(&[("toAgent", "writer")]);
        assert!(filter_matches("toAgent = 'writer'", &p));
        assert!(!filter_matches("toAgent = 'critic'", &p));
        assert!(!filter_matches("fromProxy = 'proxy-1'", &p));
    }

    #[test]
    fn conjunction() {
        let p = props(&[("toAgent", "writer"), ("fromProxy", "proxy-1")]);
        assert!(filter_matches(
            "toAgent = 'writer' AND fromProxy = 'proxy-1'",
            &p
        ));
        assert!(!filter_matches(
            "toAgent = 'writer' AND fromProxy = 'proxy-2'",
            &p
        ));
    }

    #[test]
    fn malformed_term_never_matches() {
        let p = props(&[("toAgent", "writer")]);
        assert!(!filter_matches("toAgent LIKE 'writer'", &p));
        assert!(!filter_matches("= 'writer'", &p));
    }

    #[test]
    fn extracts_to_agent_target() {
        assert_eq!(to_agent_target("toAgent = 'writer'"), Some("writer"));
        assert_eq!(
            to_agent_target("fromProxy = 'p1' AND toAgent = 'critic'"),
            Some("critic")
        );
        assert_eq!(to_agent_target("fromProxy = 'p1'"), None);
    }
}
