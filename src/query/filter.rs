// src/query/filter.rs
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::Amount;
use crate::error::LedgerError;

/// Comparison operator of a filter leaf.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operator {
    Match,
    Lt,
    Lte,
    Gt,
    Gte,
    Exists,
}

impl Operator {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Match => "$match",
            Self::Lt => "$lt",
            Self::Lte => "$lte",
            Self::Gt => "$gt",
            Self::Gte => "$gte",
            Self::Exists => "$exists",
        }
    }
}

/// Filter tree over query keys.
///
/// JSON shape: `{"$and": [...]}`, `{"$not": {...}}`, and leaves like
/// `{"$match": {"address": "users/"}}` or `{"$gte": {"balance[USD]": 100}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Value", into = "Value")]
pub enum Filter {
    And(Vec<Filter>),
    Or(Vec<Filter>),
    Not(Box<Filter>),
    Leaf {
        operator: Operator,
        key: String,
        value: Value,
    },
}

impl Filter {
    pub fn match_(key: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::leaf(Operator::Match, key, value)
    }

    pub fn lt(key: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::leaf(Operator::Lt, key, value)
    }

    pub fn lte(key: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::leaf(Operator::Lte, key, value)
    }

    pub fn gt(key: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::leaf(Operator::Gt, key, value)
    }

    pub fn gte(key: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::leaf(Operator::Gte, key, value)
    }

    pub fn exists(key: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::leaf(Operator::Exists, key, value)
    }

    pub fn and(filters: Vec<Filter>) -> Self {
        Self::And(filters)
    }

    pub fn or(filters: Vec<Filter>) -> Self {
        Self::Or(filters)
    }

    pub fn not(filter: Filter) -> Self {
        Self::Not(Box::new(filter))
    }

    fn leaf(operator: Operator, key: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::Leaf {
            operator,
            key: key.into(),
            value: value.into(),
        }
    }

    /// Visit every leaf, failing fast on the first error.
    pub fn walk_leaves<F>(&self, f: &mut F) -> Result<(), LedgerError>
    where
        F: FnMut(Operator, &str, &Value) -> Result<(), LedgerError>,
    {
        match self {
            Self::And(children) | Self::Or(children) => {
                for child in children {
                    child.walk_leaves(f)?;
                }
                Ok(())
            }
            Self::Not(child) => child.walk_leaves(f),
            Self::Leaf {
                operator,
                key,
                value,
            } => f(*operator, key, value),
        }
    }

    /// True when any leaf key satisfies the predicate.
    pub fn references_key<F: Fn(&str) -> bool>(&self, predicate: F) -> bool {
        let mut found = false;
        let _ = self.walk_leaves(&mut |_, key, _| {
            if predicate(key) {
                found = true;
            }
            Ok(())
        });
        found
    }

    /// Evaluate the boolean structure over a leaf predicate.
    pub fn evaluate<F>(&self, leaf: &F) -> Result<bool, LedgerError>
    where
        F: Fn(Operator, &str, &Value) -> Result<bool, LedgerError>,
    {
        match self {
            Self::And(children) => {
                for child in children {
                    if !child.evaluate(leaf)? {
                        return Ok(false);
                    }
                }
                Ok(true)
            }
            Self::Or(children) => {
                for child in children {
                    if child.evaluate(leaf)? {
                        return Ok(true);
                    }
                }
                Ok(children.is_empty())
            }
            Self::Not(child) => Ok(!child.evaluate(leaf)?),
            Self::Leaf {
                operator,
                key,
                value,
            } => leaf(*operator, key, value),
        }
    }
}

impl TryFrom<Value> for Filter {
    type Error = LedgerError;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        let invalid = || LedgerError::InvalidQuery(format!("malformed filter: {}", value));
        let object = value.as_object().ok_or_else(invalid)?;
        if object.len() != 1 {
            return Err(invalid());
        }
        let (operator, operand) = object.iter().next().ok_or_else(invalid)?;
        match operator.as_str() {
            "$and" | "$or" => {
                let children = operand
                    .as_array()
                    .ok_or_else(invalid)?
                    .iter()
                    .map(|child| Filter::try_from(child.clone()))
                    .collect::<Result<Vec<_>, _>>()?;
                if operator == "$and" {
                    Ok(Filter::And(children))
                } else {
                    Ok(Filter::Or(children))
                }
            }
            "$not" => Ok(Filter::Not(Box::new(Filter::try_from(operand.clone())?))),
            "$match" | "$lt" | "$lte" | "$gt" | "$gte" | "$exists" => {
                let leaf = operand.as_object().ok_or_else(invalid)?;
                if leaf.len() != 1 {
                    return Err(invalid());
                }
                let (key, leaf_value) = leaf.iter().next().ok_or_else(invalid)?;
                let operator = match operator.as_str() {
                    "$match" => Operator::Match,
                    "$lt" => Operator::Lt,
                    "$lte" => Operator::Lte,
                    "$gt" => Operator::Gt,
                    "$gte" => Operator::Gte,
                    _ => Operator::Exists,
                };
                Ok(Filter::Leaf {
                    operator,
                    key: key.clone(),
                    value: leaf_value.clone(),
                })
            }
            other => Err(LedgerError::InvalidQuery(format!(
                "unknown filter operator: {}",
                other
            ))),
        }
    }
}

impl From<Filter> for Value {
    fn from(filter: Filter) -> Value {
        match filter {
            Filter::And(children) => serde_json::json!({
                "$and": children.into_iter().map(Value::from).collect::<Vec<_>>(),
            }),
            Filter::Or(children) => serde_json::json!({
                "$or": children.into_iter().map(Value::from).collect::<Vec<_>>(),
            }),
            Filter::Not(child) => serde_json::json!({ "$not": Value::from(*child) }),
            Filter::Leaf {
                operator,
                key,
                value,
            } => {
                let mut leaf = serde_json::Map::new();
                leaf.insert(key, value);
                let mut outer = serde_json::Map::new();
                outer.insert(operator.as_str().to_string(), Value::Object(leaf));
                Value::Object(outer)
            }
        }
    }
}

/// A filter key, possibly carrying a bracketed argument like `metadata[tier]`
/// or `balance[USD]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterKey<'a> {
    Plain(&'a str),
    Indexed { base: &'a str, arg: &'a str },
}

pub fn parse_key(key: &str) -> FilterKey<'_> {
    if let Some((base, rest)) = key.split_once('[') {
        if let Some(arg) = rest.strip_suffix(']') {
            return FilterKey::Indexed { base, arg };
        }
    }
    FilterKey::Plain(key)
}

fn invalid_pair(operator: Operator, key: &str) -> LedgerError {
    LedgerError::InvalidQuery(format!(
        "operator {} not allowed on key '{}'",
        operator.as_str(),
        key
    ))
}

fn unknown_key(key: &str) -> LedgerError {
    LedgerError::InvalidQuery(format!("unknown key '{}'", key))
}

const COMPARISONS: [Operator; 5] = [
    Operator::Match,
    Operator::Lt,
    Operator::Lte,
    Operator::Gt,
    Operator::Gte,
];

/// Validate a filter against the keys accepted on account queries.
pub fn validate_accounts_filter(filter: &Filter) -> Result<(), LedgerError> {
    filter.walk_leaves(&mut |operator, key, _value| match parse_key(key) {
        FilterKey::Plain("address") if operator == Operator::Match => Ok(()),
        FilterKey::Plain("address") => Err(invalid_pair(operator, key)),
        FilterKey::Plain("metadata") if operator == Operator::Exists => Ok(()),
        FilterKey::Plain("metadata") => Err(invalid_pair(operator, key)),
        FilterKey::Plain("balance") if COMPARISONS.contains(&operator) => Ok(()),
        FilterKey::Plain("balance") => Err(invalid_pair(operator, key)),
        FilterKey::Indexed { base: "metadata", .. } if operator == Operator::Match => Ok(()),
        FilterKey::Indexed { base: "metadata", .. } => Err(invalid_pair(operator, key)),
        FilterKey::Indexed { base: "balance", .. } if COMPARISONS.contains(&operator) => Ok(()),
        FilterKey::Indexed { base: "balance", .. } => Err(invalid_pair(operator, key)),
        _ => Err(unknown_key(key)),
    })
}

/// Validate a filter against the keys accepted on transaction queries.
pub fn validate_transactions_filter(filter: &Filter) -> Result<(), LedgerError> {
    filter.walk_leaves(&mut |operator, key, _value| match parse_key(key) {
        FilterKey::Plain("id") if COMPARISONS.contains(&operator) => Ok(()),
        FilterKey::Plain("timestamp") if COMPARISONS.contains(&operator) => Ok(()),
        FilterKey::Plain("reference" | "account" | "source" | "destination" | "reverted")
            if operator == Operator::Match =>
        {
            Ok(())
        }
        FilterKey::Plain("metadata") if operator == Operator::Exists => Ok(()),
        FilterKey::Indexed { base: "metadata", .. } if operator == Operator::Match => Ok(()),
        FilterKey::Plain(
            "id" | "timestamp" | "reference" | "account" | "source" | "destination" | "reverted"
            | "metadata",
        )
        | FilterKey::Indexed { base: "metadata", .. } => Err(invalid_pair(operator, key)),
        _ => Err(unknown_key(key)),
    })
}

/// True when the filter reads account balances (forces volume loading).
pub fn uses_balance(filter: &Filter) -> bool {
    filter.references_key(|key| {
        matches!(
            parse_key(key),
            FilterKey::Plain("balance") | FilterKey::Indexed { base: "balance", .. }
        )
    })
}

/// True when the filter reads metadata.
pub fn uses_metadata(filter: &Filter) -> bool {
    filter.references_key(|key| {
        matches!(
            parse_key(key),
            FilterKey::Plain("metadata") | FilterKey::Indexed { base: "metadata", .. }
        )
    })
}

/// Segment-anchored address matching.
///
/// The pattern is split on `/`; each non-empty segment is a regex that must
/// match the whole corresponding address segment, an empty segment matches
/// any single segment, and a trailing empty segment turns the pattern into a
/// prefix match (`users/` matches every address under `users`).
pub fn match_address(pattern: &str, address: &str) -> Result<bool, LedgerError> {
    let mut pattern_segments: Vec<&str> = pattern.split('/').collect();
    let prefix = pattern_segments.len() > 1 && pattern_segments.last() == Some(&"");
    if prefix {
        pattern_segments.pop();
    }

    let address_segments: Vec<&str> = address.split('/').collect();
    if prefix {
        if address_segments.len() < pattern_segments.len() {
            return Ok(false);
        }
    } else if address_segments.len() != pattern_segments.len() {
        return Ok(false);
    }

    for (pattern_segment, address_segment) in pattern_segments.iter().zip(&address_segments) {
        if pattern_segment.is_empty() {
            continue;
        }
        let re = Regex::new(&format!("^{}$", pattern_segment)).map_err(|err| {
            LedgerError::InvalidQuery(format!("invalid address pattern: {}", err))
        })?;
        if !re.is_match(address_segment) {
            return Ok(false);
        }
    }
    Ok(true)
}

/// Interpret a filter value as an exact amount.
pub fn value_to_amount(value: &Value) -> Result<Amount, LedgerError> {
    serde_json::from_value(value.clone())
        .map_err(|err| LedgerError::InvalidQuery(format!("invalid amount in filter: {}", err)))
}

/// Apply a comparison operator to an amount.
pub fn compare_amount(
    operator: Operator,
    actual: &Amount,
    expected: &Value,
) -> Result<bool, LedgerError> {
    let expected = value_to_amount(expected)?;
    Ok(match operator {
        Operator::Match => *actual == expected,
        Operator::Lt => *actual < expected,
        Operator::Lte => *actual <= expected,
        Operator::Gt => *actual > expected,
        Operator::Gte => *actual >= expected,
        Operator::Exists => false,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parse_json_shape() {
        let filter: Filter = serde_json::from_value(json!({
            "$and": [
                {"$match": {"address": "users/"}},
                {"$gte": {"balance[USD]": 100}},
            ]
        }))
        .unwrap();
        match &filter {
            Filter::And(children) => assert_eq!(children.len(), 2),
            other => panic!("unexpected: {:?}", other),
        }

        // round trip
        let encoded = serde_json::to_value(&filter).unwrap();
        let back: Filter = serde_json::from_value(encoded).unwrap();
        assert_eq!(back, filter);
    }

    #[test]
    fn unknown_operator_rejected() {
        assert!(serde_json::from_value::<Filter>(json!({"$nope": {"address": "a"}})).is_err());
    }

    #[test]
    fn accounts_validation() {
        assert!(validate_accounts_filter(&Filter::match_("address", "users/")).is_ok());
        assert!(validate_accounts_filter(&Filter::exists("metadata", "tier")).is_ok());
        assert!(validate_accounts_filter(&Filter::match_("metadata[tier]", "gold")).is_ok());
        assert!(validate_accounts_filter(&Filter::gte("balance[USD]", 10)).is_ok());

        assert!(validate_accounts_filter(&Filter::lt("address", "a")).is_err());
        assert!(validate_accounts_filter(&Filter::match_("metadata", "x")).is_err());
        assert!(validate_accounts_filter(&Filter::match_("unknown", "x")).is_err());
    }

    #[test]
    fn transactions_validation() {
        assert!(validate_transactions_filter(&Filter::match_("reference", "r1")).is_ok());
        assert!(validate_transactions_filter(&Filter::lte("timestamp", "2024-01-01T00:00:00Z"))
            .is_ok());
        assert!(validate_transactions_filter(&Filter::match_("reverted", true)).is_ok());
        assert!(validate_transactions_filter(&Filter::exists("reference", "x")).is_err());
        assert!(validate_transactions_filter(&Filter::match_("balance", 1)).is_err());
    }

    #[test]
    fn address_matching() {
        assert!(match_address("users/1234", "users/1234").unwrap());
        assert!(!match_address("users/1234", "users/1234/wallet").unwrap());
        assert!(match_address("users/", "users/1234/wallet").unwrap());
        assert!(!match_address("users/", "orders/1").unwrap());
        assert!(match_address("/1234", "users/1234").unwrap());
        assert!(!match_address("/1234", "users/9").unwrap());
        assert!(match_address("users/.*", "users/1234").unwrap());
        assert!(match_address("world", "world").unwrap());
        assert!(!match_address("world", "worldwide").unwrap());
    }

    #[test]
    fn balance_detection() {
        assert!(uses_balance(&Filter::gte("balance[USD]", 1)));
        assert!(uses_balance(&Filter::and(vec![
            Filter::match_("address", "a"),
            Filter::not(Filter::lt("balance", 0)),
        ])));
        assert!(!uses_balance(&Filter::match_("address", "a")));
    }

    #[test]
    fn amount_comparison() {
        let actual = Amount::from(100);
        assert!(compare_amount(Operator::Gte, &actual, &json!(100)).unwrap());
        assert!(compare_amount(Operator::Lt, &actual, &json!(101)).unwrap());
        assert!(!compare_amount(Operator::Match, &actual, &json!(99)).unwrap());
        assert!(compare_amount(Operator::Match, &actual, &json!("100")).unwrap());
        assert!(compare_amount(Operator::Match, &actual, &json!(1.5)).is_err());
    }
}
