//! Filter tree shared by relation metadata and engine-issued queries.
//!
//! The same structure describes both the declarative filter a relation
//! carries in metadata and the ad-hoc queries the engine runs against record
//! collections, so one `matches` implementation serves both.

use crate::record::resolve_path;
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum MatchKind {
    #[default]
    And,
    Or,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operator {
    Equals,
    NotEquals,
    In,
    NotIn,
    GreaterThan,
    GreaterOrEquals,
    LessThan,
    LessOrEquals,
    Exists,
    Contains,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    pub term: String,
    pub operator: Operator,
    #[serde(default)]
    pub value: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Filter {
    #[serde(default, rename = "match")]
    pub kind: MatchKind,
    #[serde(default)]
    pub conditions: Vec<Condition>,
    #[serde(default)]
    pub filters: Vec<Filter>,
}

impl Filter {
    pub fn and() -> Self {
        Self::default()
    }

    pub fn or() -> Self {
        Self {
            kind: MatchKind::Or,
            ..Self::default()
        }
    }

    pub fn condition(mut self, term: impl Into<String>, operator: Operator, value: Value) -> Self {
        self.conditions.push(Condition {
            term: term.into(),
            operator,
            value,
        });
        self
    }

    pub fn nested(mut self, filter: Filter) -> Self {
        self.filters.push(filter);
        self
    }

    /// Query matching a single record by `_id`.
    pub fn by_id(id: &str) -> Self {
        Self::and().condition("_id", Operator::Equals, Value::String(id.to_string()))
    }

    /// Query matching records whose (possibly list-typed) field references
    /// the given id, i.e. `field._id == id`.
    pub fn field_references(field: &str, id: &str) -> Self {
        Self::and().condition(
            format!("{field}._id"),
            Operator::Equals,
            Value::String(id.to_string()),
        )
    }

    pub fn matches(&self, doc: &Value) -> bool {
        let conditions = self.conditions.iter().map(|c| c.matches(doc));
        let nested = self.filters.iter().map(|f| f.matches(doc));
        match self.kind {
            MatchKind::And => conditions.chain(nested).all(|m| m),
            MatchKind::Or => conditions.chain(nested).any(|m| m),
        }
    }

    /// Every condition term in the tree, depth-first. Used to decide whether
    /// a changed field can affect a filtered aggregate.
    pub fn terms(&self) -> Vec<String> {
        let mut terms: Vec<String> = self.conditions.iter().map(|c| c.term.clone()).collect();
        for filter in &self.filters {
            terms.extend(filter.terms());
        }
        terms
    }
}

impl Condition {
    fn matches(&self, doc: &Value) -> bool {
        let found = resolve_path(doc, &self.term);
        match self.operator {
            Operator::Exists => {
                let wanted = self.value.as_bool().unwrap_or(true);
                let present = found.iter().any(|v| !v.is_null());
                present == wanted
            }
            Operator::Equals => found.iter().any(|v| values_equal(v, &self.value)),
            Operator::NotEquals => !found.iter().any(|v| values_equal(v, &self.value)),
            Operator::In => match &self.value {
                Value::Array(options) => found
                    .iter()
                    .any(|v| options.iter().any(|o| values_equal(v, o))),
                _ => false,
            },
            Operator::NotIn => match &self.value {
                Value::Array(options) => !found
                    .iter()
                    .any(|v| options.iter().any(|o| values_equal(v, o))),
                _ => true,
            },
            Operator::GreaterThan => found.iter().any(|v| compare(v, &self.value) == Some(std::cmp::Ordering::Greater)),
            Operator::GreaterOrEquals => found
                .iter()
                .any(|v| matches!(compare(v, &self.value), Some(std::cmp::Ordering::Greater | std::cmp::Ordering::Equal))),
            Operator::LessThan => found.iter().any(|v| compare(v, &self.value) == Some(std::cmp::Ordering::Less)),
            Operator::LessOrEquals => found
                .iter()
                .any(|v| matches!(compare(v, &self.value), Some(std::cmp::Ordering::Less | std::cmp::Ordering::Equal))),
            Operator::Contains => found.iter().any(|v| match (v.as_str(), self.value.as_str()) {
                (Some(haystack), Some(needle)) => haystack.contains(needle),
                _ => false,
            }),
        }
    }
}

fn values_equal(a: &Value, b: &Value) -> bool {
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) => x == y,
        _ => a == b,
    }
}

fn compare(a: &Value, b: &Value) -> Option<std::cmp::Ordering> {
    if let (Some(x), Some(y)) = (a.as_f64(), b.as_f64()) {
        return x.partial_cmp(&y);
    }
    match (a.as_str(), b.as_str()) {
        (Some(x), Some(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

/// Reduces dotted paths to their first segment. Changed-field maps are keyed
/// by top-level field names, so intersection tests work on first segments.
pub fn first_segments(paths: &[String]) -> Vec<String> {
    let mut out: Vec<String> = paths
        .iter()
        .map(|p| p.split('.').next().unwrap_or(p).to_string())
        .collect();
    out.sort();
    out.dedup();
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_equals_on_nested_path() {
        let filter = Filter::field_references("customer", "x1");
        assert!(filter.matches(&json!({"customer": {"_id": "x1", "name": "X"}})));
        assert!(!filter.matches(&json!({"customer": {"_id": "x2"}})));
    }

    #[test]
    fn test_equals_matches_inside_lists() {
        let filter = Filter::field_references("members", "m2");
        let doc = json!({"members": [{"_id": "m1"}, {"_id": "m2"}]});
        assert!(filter.matches(&doc));
    }

    #[test]
    fn test_or_filter() {
        let filter = Filter::or()
            .condition("status", Operator::Equals, json!("open"))
            .condition("status", Operator::Equals, json!("pending"));
        assert!(filter.matches(&json!({"status": "pending"})));
        assert!(!filter.matches(&json!({"status": "closed"})));
    }

    #[test]
    fn test_numeric_comparison_across_int_and_float() {
        let filter = Filter::and().condition("amount", Operator::GreaterOrEquals, json!(10));
        assert!(filter.matches(&json!({"amount": 10.0})));
        assert!(!filter.matches(&json!({"amount": 9.5})));
    }

    #[test]
    fn test_terms_are_collected_recursively() {
        let filter = Filter::and()
            .condition("status", Operator::Equals, json!("open"))
            .nested(Filter::or().condition("owner._id", Operator::Exists, json!(true)));
        let mut terms = filter.terms();
        terms.sort();
        assert_eq!(terms, vec!["owner._id", "status"]);
        assert_eq!(first_segments(&terms), vec!["owner", "status"]);
    }

    #[test]
    fn test_filter_deserializes_from_yaml() {
        let yaml = r#"
match: and
conditions:
  - term: status
    operator: equals
    value: open
"#;
        let filter: Filter = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(filter.conditions[0].operator, Operator::Equals);
    }
}
