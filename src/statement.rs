//! SQL statement identification.
//!
//! Splits a raw text blob into individual statements and classifies each one
//! so results can be labeled with the command that produced them. Parsing
//! uses [sqlparser](https://docs.rs/sqlparser/) with the generic dialect;
//! text that does not parse (vendor-specific syntax, PRAGMAs, CQL) falls
//! back to leading-keyword classification so identification never fails.

use sqlparser::ast::{ObjectType, Statement};
use sqlparser::dialect::GenericDialect;
use sqlparser::parser::Parser;

/// Command classification for a single SQL statement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatementKind {
    Select,
    Insert,
    Update,
    Delete,
    CreateDatabase,
    DropDatabase,
    CreateTable,
    CreateView,
    CreateTrigger,
    Explain,
    Unknown,
}

impl StatementKind {
    /// The command label used on normalized results, e.g. `"SELECT"`.
    pub fn as_command(&self) -> &'static str {
        match self {
            Self::Select => "SELECT",
            Self::Insert => "INSERT",
            Self::Update => "UPDATE",
            Self::Delete => "DELETE",
            Self::CreateDatabase => "CREATE_DATABASE",
            Self::DropDatabase => "DROP_DATABASE",
            Self::CreateTable => "CREATE_TABLE",
            Self::CreateView => "CREATE_VIEW",
            Self::CreateTrigger => "CREATE_TRIGGER",
            Self::Explain => "EXPLAIN",
            Self::Unknown => "UNKNOWN",
        }
    }

    /// True for statements expected to produce a row set.
    pub fn returns_rows(&self) -> bool {
        matches!(self, Self::Select | Self::Explain)
    }
}

impl std::fmt::Display for StatementKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_command())
    }
}

/// One identified statement: its classification and original text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentifiedStatement {
    pub kind: StatementKind,
    pub text: String,
}

/// Split a blob into ordered, classified statements.
///
/// Comments are stripped before splitting; empty input yields an empty list;
/// statements with an unrecognized leading keyword classify as
/// [`StatementKind::Unknown`] rather than erroring.
pub fn identify(sql: &str) -> Vec<IdentifiedStatement> {
    let stripped = strip_comments(sql);

    split_statements(&stripped)
        .into_iter()
        .map(|text| {
            let kind = classify(&text);
            IdentifiedStatement { kind, text }
        })
        .collect()
}

/// Classify a single statement, preferring the parser over keyword scanning.
fn classify(statement: &str) -> StatementKind {
    let dialect = GenericDialect {};
    match Parser::parse_sql(&dialect, statement) {
        Ok(parsed) if !parsed.is_empty() => classify_ast(&parsed[0]),
        _ => classify_keywords(statement),
    }
}

fn classify_ast(stmt: &Statement) -> StatementKind {
    match stmt {
        Statement::Query(_) => StatementKind::Select,
        Statement::Insert { .. } => StatementKind::Insert,
        Statement::Update { .. } => StatementKind::Update,
        Statement::Delete { .. } => StatementKind::Delete,
        Statement::CreateDatabase { .. } => StatementKind::CreateDatabase,
        Statement::CreateTable { .. } => StatementKind::CreateTable,
        Statement::CreateView { .. } => StatementKind::CreateView,
        Statement::CreateTrigger { .. } => StatementKind::CreateTrigger,
        Statement::Drop { object_type, .. } => match object_type {
            ObjectType::Database => StatementKind::DropDatabase,
            _ => StatementKind::Unknown,
        },
        Statement::Explain { .. } | Statement::ExplainTable { .. } => StatementKind::Explain,
        _ => StatementKind::Unknown,
    }
}

/// Leading-keyword classification for text the parser rejects.
fn classify_keywords(statement: &str) -> StatementKind {
    let mut words = statement
        .split_whitespace()
        .map(|w| w.to_ascii_uppercase());
    let first = match words.next() {
        Some(w) => w,
        None => return StatementKind::Unknown,
    };
    let second = words.next().unwrap_or_default();

    match first.as_str() {
        "SELECT" | "WITH" => StatementKind::Select,
        "INSERT" => StatementKind::Insert,
        "UPDATE" => StatementKind::Update,
        "DELETE" => StatementKind::Delete,
        "EXPLAIN" => StatementKind::Explain,
        "CREATE" => match second.as_str() {
            "DATABASE" | "KEYSPACE" => StatementKind::CreateDatabase,
            "TABLE" => StatementKind::CreateTable,
            "VIEW" => StatementKind::CreateView,
            "TRIGGER" => StatementKind::CreateTrigger,
            _ => StatementKind::Unknown,
        },
        "DROP" => match second.as_str() {
            "DATABASE" | "KEYSPACE" => StatementKind::DropDatabase,
            _ => StatementKind::Unknown,
        },
        _ => StatementKind::Unknown,
    }
}

/// Remove `--` line comments and `/* */` block comments, preserving quoted
/// strings. Block comments do not nest.
fn strip_comments(sql: &str) -> String {
    let mut out = String::with_capacity(sql.len());
    let mut chars = sql.chars().peekable();
    let mut quote: Option<char> = None;

    while let Some(c) = chars.next() {
        if let Some(q) = quote {
            out.push(c);
            if c == q {
                quote = None;
            }
            continue;
        }
        match c {
            '\'' | '"' | '`' => {
                quote = Some(c);
                out.push(c);
            }
            '-' if chars.peek() == Some(&'-') => {
                for c in chars.by_ref() {
                    if c == '\n' {
                        out.push('\n');
                        break;
                    }
                }
            }
            '/' if chars.peek() == Some(&'*') => {
                chars.next();
                let mut prev = '\0';
                for c in chars.by_ref() {
                    if prev == '*' && c == '/' {
                        break;
                    }
                    prev = c;
                }
            }
            _ => out.push(c),
        }
    }
    out
}

/// Split on semicolons outside quoted strings. Trailing empty segments are
/// dropped so `"SELECT 1;"` yields one statement.
fn split_statements(sql: &str) -> Vec<String> {
    let mut pieces = Vec::new();
    let mut current = String::new();
    let mut quote: Option<char> = None;

    for c in sql.chars() {
        if let Some(q) = quote {
            current.push(c);
            if c == q {
                quote = None;
            }
            continue;
        }
        match c {
            '\'' | '"' | '`' => {
                quote = Some(c);
                current.push(c);
            }
            ';' => {
                let trimmed = current.trim();
                if !trimmed.is_empty() {
                    pieces.push(trimmed.to_string());
                }
                current.clear();
            }
            _ => current.push(c),
        }
    }
    let trimmed = current.trim();
    if !trimmed.is_empty() {
        pieces.push(trimmed.to_string());
    }
    pieces
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(sql: &str) -> Vec<StatementKind> {
        identify(sql).into_iter().map(|s| s.kind).collect()
    }

    #[test]
    fn test_identify_empty_input() {
        assert!(identify("").is_empty());
        assert!(identify("   \n\t ").is_empty());
        assert!(identify(";;;").is_empty());
    }

    #[test]
    fn test_identify_select() {
        assert_eq!(kinds("SELECT * FROM users"), vec![StatementKind::Select]);
        assert_eq!(kinds("select 1"), vec![StatementKind::Select]);
    }

    #[test]
    fn test_identify_cte_as_select() {
        assert_eq!(
            kinds("WITH cte AS (SELECT 1) SELECT * FROM cte"),
            vec![StatementKind::Select]
        );
    }

    #[test]
    fn test_identify_dml() {
        assert_eq!(
            kinds("INSERT INTO t VALUES (1); UPDATE t SET a = 2; DELETE FROM t"),
            vec![
                StatementKind::Insert,
                StatementKind::Update,
                StatementKind::Delete
            ]
        );
    }

    #[test]
    fn test_identify_ddl() {
        assert_eq!(
            kinds("CREATE DATABASE foo"),
            vec![StatementKind::CreateDatabase]
        );
        assert_eq!(kinds("DROP DATABASE foo"), vec![StatementKind::DropDatabase]);
        assert_eq!(
            kinds("CREATE TABLE t (id INT)"),
            vec![StatementKind::CreateTable]
        );
        assert_eq!(
            kinds("CREATE VIEW v AS SELECT 1"),
            vec![StatementKind::CreateView]
        );
    }

    #[test]
    fn test_identify_create_trigger() {
        let sql = "CREATE TRIGGER trg AFTER INSERT ON t BEGIN SELECT 1; END";
        // The trigger body contains a semicolon, so the splitter produces two
        // pieces; the first must still classify as a trigger.
        assert_eq!(kinds(sql)[0], StatementKind::CreateTrigger);
    }

    #[test]
    fn test_identify_explain() {
        assert_eq!(
            kinds("EXPLAIN SELECT * FROM users"),
            vec![StatementKind::Explain]
        );
    }

    #[test]
    fn test_identify_unknown_is_not_fatal() {
        assert_eq!(
            kinds("FLUMMOX the database; SELECT 1"),
            vec![StatementKind::Unknown, StatementKind::Select]
        );
    }

    #[test]
    fn test_comments_stripped_before_classification() {
        assert_eq!(
            kinds("-- leading comment\nSELECT 1"),
            vec![StatementKind::Select]
        );
        assert_eq!(
            kinds("/* block */ INSERT INTO t VALUES (1)"),
            vec![StatementKind::Insert]
        );
    }

    #[test]
    fn test_comment_only_input_is_empty() {
        assert!(identify("-- nothing here").is_empty());
        assert!(identify("/* nothing */").is_empty());
    }

    #[test]
    fn test_semicolon_inside_string_literal() {
        let stmts = identify("SELECT 'a;b' AS x; SELECT 2");
        assert_eq!(stmts.len(), 2);
        assert!(stmts[0].text.contains("'a;b'"));
    }

    #[test]
    fn test_original_text_preserved() {
        let stmts = identify("select  id ,name from t");
        assert_eq!(stmts[0].text, "select  id ,name from t");
    }

    #[test]
    fn test_multi_statement_order() {
        let stmts = identify("SELECT 1; INSERT INTO t VALUES (2); SELECT 3;");
        let k: Vec<_> = stmts.iter().map(|s| s.kind).collect();
        assert_eq!(
            k,
            vec![
                StatementKind::Select,
                StatementKind::Insert,
                StatementKind::Select
            ]
        );
    }

    #[test]
    fn test_command_labels() {
        assert_eq!(StatementKind::CreateDatabase.as_command(), "CREATE_DATABASE");
        assert_eq!(StatementKind::Unknown.as_command(), "UNKNOWN");
        assert!(StatementKind::Select.returns_rows());
        assert!(!StatementKind::Insert.returns_rows());
    }
}
