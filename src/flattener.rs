use ahash::AHashSet;
use serde_json::{Map, Value};

use crate::error::StructuralError;

pub const PATH_SEPARATOR: char = '.';
pub const DEFAULT_MAX_DEPTH: usize = 256;

/// Ordered `path -> leaf` pairs produced from one document.
///
/// Entries keep the order the leaves were visited in: insertion order for
/// objects, positional order for arrays. Paths are unique within a set.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecordSet {
    entries: Vec<(String, Value)>,
}

impl RecordSet {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, path: &str) -> Option<&Value> {
        self.entries
            .iter()
            .find(|(p, _)| p == path)
            .map(|(_, v)| v)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.entries.iter().map(|(p, v)| (p.as_str(), v))
    }

    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(p, _)| p.as_str())
    }

    pub fn into_map(self) -> Map<String, Value> {
        self.entries.into_iter().collect()
    }
}

impl IntoIterator for RecordSet {
    type Item = (String, Value);
    type IntoIter = std::vec::IntoIter<(String, Value)>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.into_iter()
    }
}

/// Walks a document tree with an explicit stack and emits one entry per leaf.
#[derive(Debug, Clone, Copy)]
pub struct Flattener {
    max_depth: usize,
}

impl Default for Flattener {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_DEPTH)
    }
}

impl Flattener {
    pub fn new(max_depth: usize) -> Self {
        Self { max_depth }
    }

    pub fn max_depth(&self) -> usize {
        self.max_depth
    }

    pub fn flatten(&self, node: &Value) -> Result<RecordSet, StructuralError> {
        self.flatten_with_prefix(node, "")
    }

    /// Flatten `node` with every emitted path starting at `prefix`.
    ///
    /// A non-empty prefix should end with the separator, the same shape the
    /// walk itself hands down to children (`"parent."`).
    pub fn flatten_with_prefix(
        &self,
        node: &Value,
        prefix: &str,
    ) -> Result<RecordSet, StructuralError> {
        let mut out = RecordSet::default();
        let mut seen: AHashSet<String> = AHashSet::new();

        // (node, prefix carrying a trailing separator, depth)
        let mut stack: Vec<(&Value, String, usize)> = vec![(node, prefix.to_string(), 0)];

        while let Some((current, path, depth)) = stack.pop() {
            if depth > self.max_depth {
                return Err(StructuralError::DepthExceeded {
                    limit: self.max_depth,
                    path: trim_separator(&path).to_string(),
                });
            }

            match current {
                // Children are pushed in reverse so they pop in natural order.
                Value::Object(fields) => {
                    for (key, child) in fields.iter().rev() {
                        stack.push((child, child_prefix(&path, key), depth + 1));
                    }
                }
                Value::Array(items) => {
                    for (index, child) in items.iter().enumerate().rev() {
                        stack.push((child, child_prefix(&path, &index.to_string()), depth + 1));
                    }
                }
                leaf => {
                    let key = trim_separator(&path).to_string();
                    if !seen.insert(key.clone()) {
                        return Err(StructuralError::PathCollision { path: key });
                    }
                    out.entries.push((key, leaf.clone()));
                }
            }
        }

        Ok(out)
    }
}

/// Flatten with the default depth limit.
pub fn flatten(node: &Value) -> Result<RecordSet, StructuralError> {
    Flattener::default().flatten(node)
}

/// Number of scalar leaves under `node`.
pub fn leaf_count(node: &Value) -> usize {
    let mut count = 0;
    let mut stack = vec![node];
    while let Some(current) = stack.pop() {
        match current {
            Value::Object(fields) => stack.extend(fields.values()),
            Value::Array(items) => stack.extend(items.iter()),
            _ => count += 1,
        }
    }
    count
}

/// Turn a parsed root into the collection the pipeline works on.
///
/// A top-level array is the collection; anything else becomes a collection of one.
pub fn into_collection(root: Value) -> Vec<Value> {
    match root {
        Value::Array(items) => items,
        other => vec![other],
    }
}

fn child_prefix(prefix: &str, key: &str) -> String {
    let mut next = String::with_capacity(prefix.len() + key.len() + 1);
    next.push_str(prefix);
    next.push_str(key);
    next.push(PATH_SEPARATOR);
    next
}

// Only the one separator the walk appended is dropped, keys may end in '.' themselves.
fn trim_separator(path: &str) -> &str {
    path.strip_suffix(PATH_SEPARATOR).unwrap_or(path)
}
