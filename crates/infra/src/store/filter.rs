//! Record filters: field → condition, all conditions ANDed.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use serde_json::Value as JsonValue;

use genflow_core::timestamp;

use super::Document;

/// Condition on a single document field.
#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    /// Field equals the value (a missing field equals `null`).
    Eq(JsonValue),
    /// Field equals any of the values.
    In(Vec<JsonValue>),
    /// `gte <= field < lt`; either bound may be open.
    Range {
        gte: Option<JsonValue>,
        lt: Option<JsonValue>,
    },
}

impl Condition {
    pub fn matches(&self, value: Option<&JsonValue>) -> bool {
        let value = value.unwrap_or(&JsonValue::Null);
        match self {
            Condition::Eq(expected) => value == expected,
            Condition::In(options) => options.iter().any(|o| o == value),
            Condition::Range { gte, lt } => {
                let above = gte.as_ref().is_none_or(|lo| {
                    matches!(
                        compare_values(value, lo),
                        Some(Ordering::Greater | Ordering::Equal)
                    )
                });
                let below = lt
                    .as_ref()
                    .is_none_or(|hi| matches!(compare_values(value, hi), Some(Ordering::Less)));
                above && below
            }
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Filter {
    conditions: BTreeMap<String, Condition>,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn eq(mut self, field: impl Into<String>, value: impl Into<JsonValue>) -> Self {
        self.conditions
            .insert(field.into(), Condition::Eq(value.into()));
        self
    }

    pub fn is_in<I, V>(mut self, field: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<JsonValue>,
    {
        self.conditions.insert(
            field.into(),
            Condition::In(values.into_iter().map(Into::into).collect()),
        );
        self
    }

    pub fn range(
        mut self,
        field: impl Into<String>,
        gte: Option<JsonValue>,
        lt: Option<JsonValue>,
    ) -> Self {
        self.conditions
            .insert(field.into(), Condition::Range { gte, lt });
        self
    }

    /// Set a condition, returning the one it replaced.
    pub fn insert(&mut self, field: impl Into<String>, condition: Condition) -> Option<Condition> {
        self.conditions.insert(field.into(), condition)
    }

    pub fn get(&self, field: &str) -> Option<&Condition> {
        self.conditions.get(field)
    }

    pub fn contains(&self, field: &str) -> bool {
        self.conditions.contains_key(field)
    }

    pub fn is_empty(&self) -> bool {
        self.conditions.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Condition)> {
        self.conditions.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn matches(&self, doc: &Document) -> bool {
        self.conditions
            .iter()
            .all(|(field, cond)| cond.matches(doc.get(field)))
    }
}

/// Order two JSON scalars. Timestamp strings compare chronologically, other
/// strings lexicographically, numbers numerically; mixed kinds are unordered.
pub fn compare_values(a: &JsonValue, b: &JsonValue) -> Option<Ordering> {
    match (a, b) {
        (JsonValue::Number(x), JsonValue::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (JsonValue::String(x), JsonValue::String(y)) => {
            match (timestamp::parse(x), timestamp::parse(y)) {
                (Some(tx), Some(ty)) => Some(tx.cmp(&ty)),
                _ => Some(x.cmp(y)),
            }
        }
        (JsonValue::Bool(x), JsonValue::Bool(y)) => Some(x.cmp(y)),
        (JsonValue::Null, JsonValue::Null) => Some(Ordering::Equal),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(v: JsonValue) -> Document {
        v.as_object().cloned().unwrap()
    }

    #[test]
    fn eq_treats_missing_field_as_null() {
        let d = doc(json!({"a": 1}));
        assert!(Filter::new().eq("b", JsonValue::Null).matches(&d));
        assert!(!Filter::new().eq("a", 2).matches(&d));
    }

    #[test]
    fn range_compares_timestamps_chronologically() {
        let d = doc(json!({"createdAt": "2026-01-01T10:00:00.5Z"}));
        let f = Filter::new().range(
            "createdAt",
            Some(json!("2026-01-01T10:00:00Z")),
            Some(json!("2026-01-01T11:00:00.000Z")),
        );
        assert!(f.matches(&d));

        let f = Filter::new().range("createdAt", Some(json!("2026-01-01T10:00:01Z")), None);
        assert!(!f.matches(&d));
    }

    #[test]
    fn in_matches_any_option() {
        let d = doc(json!({"status": "completed"}));
        assert!(Filter::new().is_in("status", ["succeeded", "completed"]).matches(&d));
        assert!(!Filter::new().is_in("status", ["failed"]).matches(&d));
    }

    #[test]
    fn mixed_kinds_never_satisfy_a_range() {
        let d = doc(json!({"n": "ten"}));
        assert!(!Filter::new().range("n", Some(json!(1)), None).matches(&d));
    }
}
