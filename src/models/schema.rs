//! Introspection value types.
//!
//! These are the shapes returned by the adapter listing operations. They stay
//! deliberately thin — a table is a name plus an optional schema, a column is
//! a name plus a data type — so every dialect can fill them.

use serde::{Deserialize, Serialize};

/// A table or view reference.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableRef {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schema: Option<String>,
    pub name: String,
}

impl TableRef {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            schema: None,
            name: name.into(),
        }
    }

    pub fn with_schema(mut self, schema: impl Into<String>) -> Self {
        self.schema = Some(schema.into());
        self
    }
}

/// A column name and its dialect-reported data type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ColumnInfo {
    pub column_name: String,
    pub data_type: String,
}

impl ColumnInfo {
    pub fn new(column_name: impl Into<String>, data_type: impl Into<String>) -> Self {
        Self {
            column_name: column_name.into(),
            data_type: data_type.into(),
        }
    }
}

/// Stored routine kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RoutineType {
    Function,
    Procedure,
}

impl std::fmt::Display for RoutineType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Function => write!(f, "FUNCTION"),
            Self::Procedure => write!(f, "PROCEDURE"),
        }
    }
}

/// A stored routine (function or procedure).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoutineInfo {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schema: Option<String>,
    pub routine_name: String,
    pub routine_type: RoutineType,
}

/// A table constraint column, e.g. one primary- or foreign-key member.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TableKey {
    pub column_name: String,
    /// "PRIMARY KEY", "FOREIGN KEY", "UNIQUE", ...
    pub key_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub constraint_name: Option<String>,
    /// Set for foreign keys: the table the key points at.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub referenced_table: Option<String>,
}

/// An only/ignore name filter applied to database and schema listings.
///
/// Both lists are optional; an empty filter passes everything. `only` wins
/// over `ignore` when both are present.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Filter {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub only: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ignore: Option<Vec<String>>,
}

impl Filter {
    /// True when `name` passes the filter.
    pub fn matches(&self, name: &str) -> bool {
        if let Some(only) = &self.only {
            return only.iter().any(|n| n == name);
        }
        if let Some(ignore) = &self.ignore {
            return !ignore.iter().any(|n| n == name);
        }
        true
    }

    /// Retain only the names that pass the filter, preserving order.
    pub fn apply(&self, names: Vec<String>) -> Vec<String> {
        names.into_iter().filter(|n| self.matches(n)).collect()
    }
}

/// Apply an optional filter to a name list.
pub fn apply_filter(names: Vec<String>, filter: Option<&Filter>) -> Vec<String> {
    match filter {
        Some(f) => f.apply(names),
        None => names,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_ref_builder() {
        let t = TableRef::new("users").with_schema("public");
        assert_eq!(t.schema.as_deref(), Some("public"));
        assert_eq!(t.name, "users");
    }

    #[test]
    fn test_filter_only_wins() {
        let f = Filter {
            only: Some(vec!["a".into()]),
            ignore: Some(vec!["a".into()]),
        };
        assert!(f.matches("a"));
        assert!(!f.matches("b"));
    }

    #[test]
    fn test_filter_ignore() {
        let f = Filter {
            only: None,
            ignore: Some(vec!["template0".into(), "template1".into()]),
        };
        let names = vec!["postgres".to_string(), "template0".to_string()];
        assert_eq!(f.apply(names), vec!["postgres".to_string()]);
    }

    #[test]
    fn test_empty_filter_passes_everything() {
        let f = Filter::default();
        assert!(f.matches("anything"));
    }

    #[test]
    fn test_apply_filter_none() {
        let names = vec!["x".to_string()];
        assert_eq!(apply_filter(names.clone(), None), names);
    }
}
