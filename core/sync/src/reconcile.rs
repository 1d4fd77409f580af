//! Read-time merge of synced rows with the pending log.
//!
//! [`merge`] is a pure function of its two inputs. Malformed entries (rows
//! without a string id, non-object payloads) are skipped, never fatal.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};

use folio_common::{row_id, OperationKind, Row};

use crate::pending::{PendingChange, PendingStatus};

/// Field name of the local annotation on merged rows.
pub const LOCAL_FIELD: &str = "_local";

/// Local sync state attached to a merged row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocalAnnotation {
    pub status: PendingStatus,
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl LocalAnnotation {
    fn from_change(change: &PendingChange) -> Self {
        Self {
            status: change.status,
            timestamp: change.timestamp,
            error: change.error.clone(),
        }
    }
}

/// One entity in the merged view.
#[derive(Debug, Clone, PartialEq)]
pub struct MergedRow {
    pub row: Row,
    /// Present when local changes were folded into this row.
    pub local: Option<LocalAnnotation>,
}

impl MergedRow {
    pub fn id(&self) -> Option<&str> {
        row_id(&self.row)
    }

    /// Row as JSON with the `_local` annotation inlined.
    pub fn into_value(self) -> Value {
        let mut row = self.row;
        if let Some(local) = self.local {
            if let Ok(annotation) = serde_json::to_value(local) {
                row.insert(LOCAL_FIELD.to_string(), annotation);
            }
        }
        Value::Object(row)
    }
}

#[derive(Default)]
struct Buckets<'a> {
    inserts: HashMap<&'a str, &'a PendingChange>,
    insert_order: Vec<&'a str>,
    updates: HashMap<&'a str, Vec<&'a PendingChange>>,
    deletes: HashSet<&'a str>,
}

impl<'a> Buckets<'a> {
    fn collect(local: &'a [PendingChange]) -> Self {
        let mut buckets = Self::default();
        for change in local {
            let id = change.entity_id.as_str();
            match change.operation {
                OperationKind::Insert => {
                    if !matches!(change.data, Some(Value::Object(_))) {
                        continue;
                    }
                    match buckets.inserts.get(id) {
                        // later log entries win ties
                        Some(existing) if existing.timestamp > change.timestamp => {}
                        Some(_) => {
                            buckets.inserts.insert(id, change);
                        }
                        None => {
                            buckets.inserts.insert(id, change);
                            buckets.insert_order.push(id);
                        }
                    }
                }
                OperationKind::Update => buckets.updates.entry(id).or_default().push(change),
                OperationKind::Delete => {
                    buckets.deletes.insert(id);
                }
            }
        }

        for updates in buckets.updates.values_mut() {
            // stable: equal timestamps keep log order
            updates.sort_by_key(|change| change.timestamp);
        }
        buckets
    }

    /// Fold the id's updates over `base`, returning the annotation of the
    /// last one applied.
    fn fold_updates(&self, id: &str, base: &mut Row) -> Option<LocalAnnotation> {
        let updates = self.updates.get(id)?;
        let mut last = None;
        for update in updates {
            if let Some(Value::Object(patch)) = &update.data {
                for (key, value) in patch {
                    base.insert(key.clone(), value.clone());
                }
            }
            last = Some(LocalAnnotation::from_change(update));
        }
        last
    }
}

/// Combine synced rows with pending changes of the same table.
///
/// Local inserts come first in insertion order, then synced rows in input
/// order. Callers that need a specific order sort afterwards.
pub fn merge(synced: &[Row], local: &[PendingChange]) -> Vec<MergedRow> {
    let buckets = Buckets::collect(local);
    let mut produced: HashSet<&str> = HashSet::new();
    let mut merged = Vec::with_capacity(synced.len() + buckets.inserts.len());

    for &id in &buckets.insert_order {
        if buckets.deletes.contains(id) {
            continue;
        }
        let Some(insert) = buckets.inserts.get(id) else {
            continue;
        };
        let Some(Value::Object(payload)) = &insert.data else {
            continue;
        };

        let mut row = payload.clone();
        let local = buckets
            .fold_updates(id, &mut row)
            .unwrap_or_else(|| LocalAnnotation::from_change(insert));
        produced.insert(id);
        merged.push(MergedRow {
            row,
            local: Some(local),
        });
    }

    for synced_row in synced {
        let Some(id) = row_id(synced_row) else {
            continue;
        };
        if produced.contains(id) || buckets.deletes.contains(id) {
            continue;
        }

        let mut row = synced_row.clone();
        let local = buckets.fold_updates(id, &mut row);
        produced.insert(id);
        merged.push(MergedRow { row, local });
    }

    merged
}

fn compare_values(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    match (a, b) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Greater,
        (Some(_), None) => Ordering::Less,
        (Some(Value::Number(x)), Some(Value::Number(y))) => {
            let x = x.as_f64().unwrap_or(0.0);
            let y = y.as_f64().unwrap_or(0.0);
            x.partial_cmp(&y).unwrap_or(Ordering::Equal)
        }
        (Some(Value::String(x)), Some(Value::String(y))) => x.cmp(y),
        (Some(Value::Bool(x)), Some(Value::Bool(y))) => x.cmp(y),
        (Some(x), Some(y)) => x.to_string().cmp(&y.to_string()),
    }
}

/// Sort merged rows by a field, rows lacking it last. Stable.
pub fn sort_by_field(rows: &mut [MergedRow], field: &str, descending: bool) {
    rows.sort_by(|a, b| {
        let ordering = compare_values(a.row.get(field), b.row.get(field));
        if descending {
            match (a.row.get(field), b.row.get(field)) {
                (Some(_), Some(_)) => ordering.reverse(),
                _ => ordering,
            }
        } else {
            ordering
        }
    });
}

/// Merged rows as plain JSON objects.
pub fn into_values(rows: Vec<MergedRow>) -> Vec<Value> {
    rows.into_iter().map(MergedRow::into_value).collect()
}
