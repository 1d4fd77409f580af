//! Row shapes: wire-format normalization between the remote and local rows.
//!
//! Remote rows use snake_case column names and may carry structured columns
//! as JSON-encoded strings. Local rows use camelCase and real JSON values.
//! Table-specific reshaping is described by a [`TableShape`], never coded
//! per table.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;

use folio_common::{Error, Result, Row};

/// Convert `camelCase` to `snake_case`.
pub fn to_snake_case(s: &str) -> String {
    let mut result = String::with_capacity(s.len() + 4);
    for (i, ch) in s.chars().enumerate() {
        if ch.is_uppercase() {
            if i > 0 {
                result.push('_');
            }
            result.extend(ch.to_lowercase());
        } else {
            result.push(ch);
        }
    }
    result
}

/// Convert `snake_case` to `camelCase`.
pub fn to_camel_case(s: &str) -> String {
    let mut result = String::with_capacity(s.len());
    let mut upper_next = false;
    for ch in s.chars() {
        if ch == '_' {
            // leading underscores are kept (e.g. `_local`)
            if result.is_empty() {
                result.push(ch);
            } else {
                upper_next = true;
            }
        } else if upper_next {
            result.extend(ch.to_uppercase());
            upper_next = false;
        } else {
            result.push(ch);
        }
    }
    result
}

/// A tagged union stored flat on the remote and nested locally.
///
/// Remote: `{type: "rectangle", geometry: {rects: [...]}}`.
/// Local:  `{data: {type: "rectangle", rects: [...]}}`.
/// Field names are given in their local (camelCase) form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnionShape {
    /// Discriminant field, top level on the remote.
    pub discriminant: String,
    /// Remote object holding the variant's fields.
    pub source: String,
    /// Local object holding discriminant and variant fields together.
    pub target: String,
}

/// Per-table reshaping rules.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TableShape {
    /// Remote (snake_case) columns that may arrive as JSON-encoded strings.
    #[serde(default)]
    pub json_columns: Vec<String>,
    /// Optional tagged-union folding.
    #[serde(default)]
    pub union: Option<UnionShape>,
}

/// Shapes for every table that needs more than a field rename.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ShapeRegistry {
    shapes: HashMap<String, TableShape>,
}

impl ShapeRegistry {
    /// Create an empty registry: every table only gets field renames.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the shape of a table, replacing any previous one.
    pub fn register(&mut self, table: impl Into<String>, shape: TableShape) {
        self.shapes.insert(table.into(), shape);
    }

    /// Builder-style [`register`](Self::register).
    pub fn with(mut self, table: impl Into<String>, shape: TableShape) -> Self {
        self.register(table, shape);
        self
    }

    pub fn get(&self, table: &str) -> Option<&TableShape> {
        self.shapes.get(table)
    }

    /// Turn a remote row into a local row.
    ///
    /// Never fails: a JSON column that does not parse is kept as a string.
    pub fn normalize_row(&self, table: &str, row: Row) -> Row {
        let shape = self.shapes.get(table);
        let mut out = Map::with_capacity(row.len());

        for (key, value) in row {
            let decoded = match (&value, shape) {
                (Value::String(raw), Some(shape)) if shape.json_columns.contains(&key) => {
                    serde_json::from_str(raw).unwrap_or(value)
                }
                _ => value,
            };
            out.insert(to_camel_case(&key), decoded);
        }

        if let Some(union) = shape.and_then(|s| s.union.as_ref()) {
            fold_union(&mut out, union);
        }
        out
    }

    /// Turn a local write payload into the remote's shape.
    ///
    /// # Errors
    /// - Payload is not a JSON object
    pub fn denormalize_payload(&self, table: &str, payload: &Value) -> Result<Value> {
        let Value::Object(map) = payload else {
            return Err(Error::InvalidInput("Payload must be an object".to_string()));
        };
        let mut map = map.clone();

        if let Some(union) = self.shapes.get(table).and_then(|s| s.union.as_ref()) {
            split_union(&mut map, union);
        }

        let out: Map<String, Value> = map
            .into_iter()
            .map(|(key, value)| (to_snake_case(&key), value))
            .collect();
        Ok(Value::Object(out))
    }
}

fn fold_union(row: &mut Row, union: &UnionShape) {
    let Some(discriminant) = row.remove(&union.discriminant) else {
        return;
    };
    let mut target = Map::new();
    target.insert(union.discriminant.clone(), discriminant);
    if let Some(Value::Object(fields)) = row.remove(&union.source) {
        target.extend(fields);
    }
    row.insert(union.target.clone(), Value::Object(target));
}

fn split_union(payload: &mut Map<String, Value>, union: &UnionShape) {
    let Some(Value::Object(mut target)) = payload.remove(&union.target) else {
        return;
    };
    if let Some(discriminant) = target.remove(&union.discriminant) {
        payload.insert(union.discriminant.clone(), discriminant);
    }
    let source = if target.is_empty() {
        Value::Null
    } else {
        Value::Object(target)
    };
    payload.insert(union.source.clone(), source);
}
