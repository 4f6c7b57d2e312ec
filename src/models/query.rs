//! Normalized query results.
//!
//! Every adapter shapes driver output into [`QueryResult`]: one entry per
//! statement in a batch, rows as column-name → JSON value maps, and either
//! `row_count` (SELECT) or `affected_rows` (everything else).

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// A result column. Only the name is dialect-independent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Field {
    pub name: String,
}

impl Field {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

/// A row as an ordered column-name → value map.
pub type Row = serde_json::Map<String, JsonValue>;

/// The dialect-independent result of one statement.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryResult {
    /// Command label from the statement identifier, e.g. "SELECT".
    pub command: String,
    pub rows: Vec<Row>,
    pub fields: Vec<Field>,
    /// Set for row-returning statements only.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub row_count: Option<u64>,
    /// Set for side-effecting statements only; `None` when the driver does
    /// not report a count.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub affected_rows: Option<u64>,
}

impl QueryResult {
    /// Build a result for a row-returning statement.
    pub fn with_rows(command: impl Into<String>, rows: Vec<Row>, fields: Vec<Field>) -> Self {
        let row_count = rows.len() as u64;
        Self {
            command: command.into(),
            rows,
            fields,
            row_count: Some(row_count),
            affected_rows: None,
        }
    }

    /// Build the single empty result a side-effecting statement produces.
    pub fn for_command(command: impl Into<String>, affected_rows: Option<u64>) -> Self {
        Self {
            command: command.into(),
            rows: Vec::new(),
            fields: Vec::new(),
            row_count: None,
            affected_rows,
        }
    }
}

/// Observable lifecycle of a query handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryOutcome {
    Pending,
    Running,
    Done,
    Canceled,
    Failed,
}
