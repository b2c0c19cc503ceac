// src/core/metadata.rs
use std::collections::BTreeMap;

use serde_json::Value;

/// String-keyed JSON metadata attached to accounts, transactions and ledgers.
///
/// Backed by a BTreeMap so serialized form is key-ordered, which the log
/// hash chain relies on.
pub type Metadata = BTreeMap<String, Value>;

/// Merge `incoming` into `existing`; incoming wins per key.
/// Returns true when the merge changed anything.
pub fn merge(existing: &mut Metadata, incoming: &Metadata) -> bool {
    let mut changed = false;
    for (key, value) in incoming {
        match existing.get(key) {
            Some(current) if current == value => {}
            _ => {
                existing.insert(key.clone(), value.clone());
                changed = true;
            }
        }
    }
    changed
}

/// True when `outer` already contains every entry of `inner` with equal values.
pub fn contains(outer: &Metadata, inner: &Metadata) -> bool {
    inner
        .iter()
        .all(|(key, value)| outer.get(key) == Some(value))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn merge_incoming_wins() {
        let mut existing = Metadata::from([("a".to_string(), json!("1"))]);
        let incoming = Metadata::from([
            ("a".to_string(), json!("2")),
            ("b".to_string(), json!("3")),
        ]);

        assert!(merge(&mut existing, &incoming));
        assert_eq!(existing.get("a"), Some(&json!("2")));
        assert_eq!(existing.get("b"), Some(&json!("3")));
    }

    #[test]
    fn merge_identical_is_noop() {
        let mut existing = Metadata::from([("a".to_string(), json!("1"))]);
        let incoming = existing.clone();
        assert!(!merge(&mut existing, &incoming));
    }

    #[test]
    fn containment() {
        let outer = Metadata::from([
            ("a".to_string(), json!("1")),
            ("b".to_string(), json!("2")),
        ]);
        let inner = Metadata::from([("a".to_string(), json!("1"))]);
        assert!(contains(&outer, &inner));
        assert!(!contains(&inner, &outer));
    }
}
