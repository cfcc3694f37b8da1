use std::fmt;

use serde_json::{Map, Value};

/// A dotted path into a JSON object, e.g. `"location.latitude"`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldPath {
    segments: Vec<String>,
}

impl FieldPath {
    /// Parse a dot-separated path. Returns `None` for an empty path or one
    /// with empty segments (`"a..b"`).
    pub fn parse(path: &str) -> Option<Self> {
        let segments: Vec<String> = path.split('.').map(|s| s.to_string()).collect();
        if segments.iter().any(|s| s.is_empty()) {
            return None;
        }
        Some(Self { segments })
    }

    /// Walk to the object holding the last segment.
    fn parent_mut<'a>(&self, map: &'a mut Map<String, Value>) -> Option<&'a mut Map<String, Value>> {
        let (_, parents) = self.segments.split_last()?;
        let mut current = map;
        for segment in parents {
            match current.get_mut(segment) {
                Some(Value::Object(child)) => current = child,
                _ => return None,
            }
        }
        Some(current)
    }

    fn leaf(&self) -> &str {
        // parse() guarantees at least one segment
        self.segments.last().map(String::as_str).unwrap_or_default()
    }

    /// Remove the field, keeping the order of its siblings.
    /// Returns true if the field was present.
    pub fn remove_from(&self, map: &mut Map<String, Value>) -> bool {
        let leaf = self.leaf().to_string();
        match self.parent_mut(map) {
            Some(parent) => parent.shift_remove(&leaf).is_some(),
            None => false,
        }
    }

    /// Replace the field's value with `placeholder` if the field is present.
    /// Returns true if the stored value changed.
    pub fn mask_in(&self, map: &mut Map<String, Value>, placeholder: &Value) -> bool {
        let leaf = self.leaf().to_string();
        let Some(slot) = self.parent_mut(map).and_then(|p| p.get_mut(&leaf)) else {
            return false;
        };
        if slot == placeholder {
            return false;
        }
        *slot = placeholder.clone();
        true
    }
}

impl fmt::Display for FieldPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.segments.join("."))
    }
}

/// A request path pattern such as `/parse/classes/Day/*`.
///
/// Segments compare literally, except `*` which matches any single segment.
/// A trailing slash on the request path is ignored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutePattern {
    raw: String,
    segments: Vec<String>,
}

impl RoutePattern {
    pub fn parse(pattern: &str) -> Self {
        Self {
            raw: pattern.to_string(),
            segments: split_path(pattern),
        }
    }

    pub fn matches(&self, path: &str) -> bool {
        let segments = split_path(path);
        segments.len() == self.segments.len()
            && self
                .segments
                .iter()
                .zip(&segments)
                .all(|(want, got)| want == "*" || want == got)
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }
}

fn split_path(path: &str) -> Vec<String> {
    let trimmed = path.trim_end_matches('/');
    trimmed
        .trim_start_matches('/')
        .split('/')
        .map(|s| s.to_string())
        .collect()
}
