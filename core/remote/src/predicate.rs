//! Minimal filter expressions for in-process feeds.
//!
//! Supports conjunctions of equality tests: `work_id = 'w1' AND deleted = false`.

use serde_json::Value;

use folio_common::{Error, Result, Row};

#[derive(Debug, Clone, PartialEq)]
enum Op {
    Eq,
    NotEq,
}

#[derive(Debug, Clone, PartialEq)]
struct Clause {
    column: String,
    op: Op,
    value: Value,
}

/// A parsed filter expression.
#[derive(Debug, Clone, PartialEq)]
pub struct Predicate {
    clauses: Vec<Clause>,
}

impl Predicate {
    /// Parse a filter expression.
    ///
    /// # Errors
    /// - Clause without `=`/`!=`
    /// - Empty column name or unparseable literal
    pub fn parse(expr: &str) -> Result<Self> {
        let mut clauses = Vec::new();
        for part in split_and(expr) {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }
            let (column, op, literal) = if let Some((c, v)) = part.split_once("!=") {
                (c, Op::NotEq, v)
            } else if let Some((c, v)) = part.split_once('=') {
                (c, Op::Eq, v)
            } else {
                return Err(Error::InvalidInput(format!(
                    "Unsupported filter clause: {}",
                    part
                )));
            };

            let column = column.trim();
            if column.is_empty() {
                return Err(Error::InvalidInput(format!("Missing column in: {}", part)));
            }
            clauses.push(Clause {
                column: column.to_string(),
                op,
                value: parse_literal(literal.trim())?,
            });
        }
        Ok(Self { clauses })
    }

    /// Evaluate against a remote row. Missing columns compare as null.
    pub fn matches(&self, row: &Row) -> bool {
        self.clauses.iter().all(|clause| {
            let actual = row.get(&clause.column).unwrap_or(&Value::Null);
            match clause.op {
                Op::Eq => actual == &clause.value,
                Op::NotEq => actual != &clause.value,
            }
        })
    }
}

fn split_and(expr: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut rest = expr;
    loop {
        let upper = rest.to_ascii_uppercase();
        match upper.find(" AND ") {
            Some(pos) => {
                parts.push(&rest[..pos]);
                rest = &rest[pos + 5..];
            }
            None => {
                parts.push(rest);
                break;
            }
        }
    }
    parts
}

fn parse_literal(raw: &str) -> Result<Value> {
    if raw.len() >= 2 && raw.starts_with('\'') && raw.ends_with('\'') {
        return Ok(Value::String(raw[1..raw.len() - 1].replace("''", "'")));
    }
    match raw.to_ascii_lowercase().as_str() {
        "true" => return Ok(Value::Bool(true)),
        "false" => return Ok(Value::Bool(false)),
        "null" => return Ok(Value::Null),
        _ => {}
    }
    serde_json::from_str::<serde_json::Number>(raw)
        .map(Value::Number)
        .map_err(|_| Error::InvalidInput(format!("Unsupported literal: {}", raw)))
}
