use serde_json::{Map, Value};

/// Where a `$set` lands.
#[derive(Debug, Clone, PartialEq)]
pub enum SetTarget {
    /// A dotted field path; intermediate objects are created as needed.
    Field(String),
    /// The element of a list-typed field whose `_id` matched the query.
    /// Equivalent to a positional (`field.$`) update.
    ListItem { field: String, item_id: String },
}

/// A declarative update applied to matching records. Each operation is
/// idempotent so replays under at-least-once delivery are harmless.
#[derive(Debug, Clone, Default)]
pub struct UpdateDoc {
    pub set: Vec<(SetTarget, Value)>,
    pub unset: Vec<String>,
    pub push: Vec<(String, Value)>,
    /// Removes list elements whose `_id` equals the given id.
    pub pull: Vec<(String, String)>,
}

impl UpdateDoc {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(mut self, path: impl Into<String>, value: Value) -> Self {
        self.set.push((SetTarget::Field(path.into()), value));
        self
    }

    pub fn set_list_item(mut self, field: impl Into<String>, item_id: impl Into<String>, value: Value) -> Self {
        self.set.push((
            SetTarget::ListItem {
                field: field.into(),
                item_id: item_id.into(),
            },
            value,
        ));
        self
    }

    pub fn unset(mut self, path: impl Into<String>) -> Self {
        self.unset.push(path.into());
        self
    }

    pub fn push(mut self, field: impl Into<String>, value: Value) -> Self {
        self.push.push((field.into(), value));
        self
    }

    pub fn pull(mut self, field: impl Into<String>, item_id: impl Into<String>) -> Self {
        self.pull.push((field.into(), item_id.into()));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.set.is_empty() && self.unset.is_empty() && self.push.is_empty() && self.pull.is_empty()
    }

    /// Applies the update in place, returning whether the document changed.
    pub fn apply(&self, doc: &mut Value) -> bool {
        let mut changed = false;

        for (target, value) in &self.set {
            match target {
                SetTarget::Field(path) => {
                    changed |= set_path(doc, path, value.clone());
                }
                SetTarget::ListItem { field, item_id } => {
                    if let Some(Value::Array(items)) = doc.get_mut(field.as_str()) {
                        for item in items.iter_mut() {
                            if item.get("_id").and_then(Value::as_str) == Some(item_id.as_str())
                                && item != value
                            {
                                *item = value.clone();
                                changed = true;
                            }
                        }
                    }
                }
            }
        }

        for path in &self.unset {
            changed |= unset_path(doc, path);
        }

        for (field, value) in &self.push {
            let map = match doc.as_object_mut() {
                Some(map) => map,
                None => continue,
            };
            let entry = map
                .entry(field.clone())
                .or_insert_with(|| Value::Array(Vec::new()));
            if let Value::Array(items) = entry {
                items.push(value.clone());
                changed = true;
            }
        }

        for (field, item_id) in &self.pull {
            if let Some(Value::Array(items)) = doc.get_mut(field.as_str()) {
                let before = items.len();
                items.retain(|item| item.get("_id").and_then(Value::as_str) != Some(item_id.as_str()));
                changed |= items.len() != before;
            }
        }

        changed
    }
}

fn set_path(doc: &mut Value, path: &str, value: Value) -> bool {
    let mut segments = path.split('.').peekable();
    let mut current = doc;
    while let Some(segment) = segments.next() {
        let map = match current {
            Value::Object(map) => map,
            _ => return false,
        };
        if segments.peek().is_none() {
            let changed = map.get(segment) != Some(&value);
            map.insert(segment.to_string(), value);
            return changed;
        }
        current = map
            .entry(segment.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
    }
    false
}

fn unset_path(doc: &mut Value, path: &str) -> bool {
    let mut segments = path.split('.').peekable();
    let mut current = doc;
    while let Some(segment) = segments.next() {
        let map = match current {
            Value::Object(map) => map,
            _ => return false,
        };
        if segments.peek().is_none() {
            return map.remove(segment).is_some();
        }
        match map.get_mut(segment) {
            Some(next) => current = next,
            None => return false,
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_set_creates_nested_objects() {
        let mut doc = json!({"_id": "a"});
        let update = UpdateDoc::new().set("contact", json!({"_id": "c1", "name": "Alice"}));
        assert!(update.apply(&mut doc));
        assert_eq!(doc["contact"]["name"], "Alice");
    }

    #[test]
    fn test_set_is_idempotent() {
        let mut doc = json!({"total": 5});
        let update = UpdateDoc::new().set("total", json!(5));
        assert!(!update.apply(&mut doc));
    }

    #[test]
    fn test_positional_set_replaces_matching_element_only() {
        let mut doc = json!({"members": [{"_id": "a", "name": "old"}, {"_id": "b", "name": "keep"}]});
        let update = UpdateDoc::new().set_list_item("members", "a", json!({"_id": "a", "name": "new"}));
        assert!(update.apply(&mut doc));
        assert_eq!(doc["members"][0]["name"], "new");
        assert_eq!(doc["members"][1]["name"], "keep");
    }

    #[test]
    fn test_unset_and_pull() {
        let mut doc = json!({"total": 10, "orders": [{"_id": "o1"}, {"_id": "o2"}]});
        let update = UpdateDoc::new().unset("total").pull("orders", "o1");
        assert!(update.apply(&mut doc));
        assert!(doc.get("total").is_none());
        assert_eq!(doc["orders"], json!([{"_id": "o2"}]));
    }

    #[test]
    fn test_push_creates_list() {
        let mut doc = json!({"_id": "x"});
        let update = UpdateDoc::new().push("orders", json!({"_id": "o1"}));
        assert!(update.apply(&mut doc));
        assert_eq!(doc["orders"], json!([{"_id": "o1"}]));
    }
}
