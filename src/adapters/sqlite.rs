//! SQLite adapter.
//!
//! The database is a file (or `:memory:`), so databases/schemas/routines are
//! degenerate. Introspection reads `sqlite_master` and the PRAGMA functions.
//! Batches are split by the statement identifier and executed one statement
//! at a time on the adapter's single pooled connection, which also gives the
//! per-statement results the other dialects get from their wire protocols.

use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::Row as _;
use tokio::sync::OnceCell;
use tracing::{debug, info};

use crate::adapters::types::RowToJson;
use crate::adapters::{
    normalize_results, wrap_with, Adapter, CancelHook, CancelToken, ConnectParams, StatementGroup,
};
use crate::error::{GatewayError, Result};
use crate::models::query::QueryResult;
use crate::models::schema::{
    apply_filter, ColumnInfo, Filter, RoutineInfo, RoutineType, TableKey, TableRef,
};
use crate::statement::IdentifiedStatement;
use crate::version::VersionInfo;

mod queries {
    pub const LIST_TABLES: &str = r#"
        SELECT name
        FROM sqlite_master
        WHERE type = 'table'
          AND name NOT LIKE 'sqlite_%'
        ORDER BY name
        "#;

    pub const LIST_VIEWS: &str = r#"
        SELECT name
        FROM sqlite_master
        WHERE type = 'view'
        ORDER BY name
        "#;

    pub const LIST_TRIGGERS: &str = r#"
        SELECT name
        FROM sqlite_master
        WHERE type = 'trigger'
          AND tbl_name = ?
        ORDER BY name
        "#;

    pub const TABLE_SCRIPT: &str = r#"
        SELECT sql
        FROM sqlite_master
        WHERE name = ? AND type = 'table'
        "#;

    pub const VIEW_SCRIPT: &str = r#"
        SELECT sql
        FROM sqlite_master
        WHERE name = ? AND type = 'view'
        "#;

    pub const HAS_SEQUENCE_TABLE: &str = r#"
        SELECT name
        FROM sqlite_master
        WHERE type = 'table' AND name = 'sqlite_sequence'
        "#;
}

pub struct SqliteAdapter {
    params: ConnectParams,
    state: OnceCell<(SqlitePool, VersionInfo)>,
}

impl SqliteAdapter {
    pub fn new(params: ConnectParams) -> Self {
        Self {
            params,
            state: OnceCell::new(),
        }
    }

    fn connect_options(&self) -> SqliteConnectOptions {
        SqliteConnectOptions::new()
            .filename(&self.params.database)
            .create_if_missing(true)
    }

    fn pool(&self) -> Result<&SqlitePool> {
        self.state
            .get()
            .map(|(pool, _)| pool)
            .ok_or_else(|| GatewayError::connect("adapter is not connected"))
    }
}

/// Run identified statements one at a time, collecting a group per
/// statement.
async fn run_statements(
    conn: &mut sqlx::pool::PoolConnection<sqlx::Sqlite>,
    statements: &[IdentifiedStatement],
) -> Result<Vec<StatementGroup>> {
    let mut groups = Vec::with_capacity(statements.len());
    for (index, statement) in statements.iter().enumerate() {
        if statement.kind.returns_rows() {
            let rows = sqlx::query(&statement.text)
                .fetch_all(&mut **conn)
                .await
                .map_err(|e| GatewayError::from(e).at_statement(index))?;
            let fields = rows
                .first()
                .map(|r| r.result_fields())
                .unwrap_or_default();
            groups.push(StatementGroup {
                rows: rows.iter().map(|r| r.to_row_map()).collect(),
                fields,
                affected: None,
            });
        } else {
            let done = sqlx::query(&statement.text)
                .execute(&mut **conn)
                .await
                .map_err(|e| GatewayError::from(e).at_statement(index))?;
            groups.push(StatementGroup {
                rows: Vec::new(),
                fields: Vec::new(),
                affected: Some(done.rows_affected()),
            });
        }
    }
    Ok(groups)
}

#[async_trait]
impl Adapter for SqliteAdapter {
    fn key(&self) -> &'static str {
        "sqlite"
    }

    fn params(&self) -> &ConnectParams {
        &self.params
    }

    async fn connect(&self) -> Result<VersionInfo> {
        let (_, version) = self
            .state
            .get_or_try_init(|| async {
                // One connection: the file is the serialization point anyway.
                // min_connections keeps :memory: databases alive between
                // statements.
                let pool = SqlitePoolOptions::new()
                    .min_connections(1)
                    .max_connections(1)
                    .connect_with(self.connect_options())
                    .await
                    .map_err(|e| GatewayError::connect(e.to_string()))?;

                let raw: String = sqlx::query_scalar("SELECT sqlite_version()")
                    .fetch_one(&pool)
                    .await?;
                let version = VersionInfo::from_probe("SQLite", raw);
                info!(
                    client = "sqlite",
                    version = %version.version,
                    database = %self.params.database,
                    "Connected"
                );
                Ok::<_, GatewayError>((pool, version))
            })
            .await?;
        Ok(version.clone())
    }

    async fn disconnect(&self) {
        if let Some((pool, _)) = self.state.get() {
            pool.close().await;
        }
    }

    fn version(&self) -> Option<VersionInfo> {
        self.state.get().map(|(_, v)| v.clone())
    }

    async fn list_databases(&self, filter: Option<&Filter>) -> Result<Vec<String>> {
        // The file is the database.
        Ok(apply_filter(vec![self.params.database.clone()], filter))
    }

    async fn list_schemas(&self, _filter: Option<&Filter>) -> Result<Vec<String>> {
        Ok(Vec::new())
    }

    async fn list_tables(&self, _schema: Option<&str>) -> Result<Vec<TableRef>> {
        let rows = sqlx::query(queries::LIST_TABLES)
            .fetch_all(self.pool()?)
            .await?;
        let tables: Vec<TableRef> = rows
            .iter()
            .map(|r| TableRef::new(r.get::<String, _>("name")))
            .collect();
        debug!(count = tables.len(), "Listed tables");
        Ok(tables)
    }

    async fn list_views(&self, _schema: Option<&str>) -> Result<Vec<TableRef>> {
        let rows = sqlx::query(queries::LIST_VIEWS)
            .fetch_all(self.pool()?)
            .await?;
        Ok(rows
            .iter()
            .map(|r| TableRef::new(r.get::<String, _>("name")))
            .collect())
    }

    async fn list_routines(&self, _schema: Option<&str>) -> Result<Vec<RoutineInfo>> {
        Ok(Vec::new())
    }

    async fn list_table_columns(
        &self,
        table: &str,
        _schema: Option<&str>,
    ) -> Result<Vec<ColumnInfo>> {
        let sql = format!("PRAGMA table_info({})", self.wrap_identifier(table));
        let rows = sqlx::query(&sql).fetch_all(self.pool()?).await?;
        Ok(rows
            .iter()
            .map(|r| ColumnInfo::new(r.get::<String, _>("name"), r.get::<String, _>("type")))
            .collect())
    }

    async fn list_table_triggers(
        &self,
        table: &str,
        _schema: Option<&str>,
    ) -> Result<Vec<String>> {
        let rows = sqlx::query(queries::LIST_TRIGGERS)
            .bind(table)
            .fetch_all(self.pool()?)
            .await?;
        Ok(rows.iter().map(|r| r.get("name")).collect())
    }

    async fn list_table_indexes(&self, table: &str, _schema: Option<&str>) -> Result<Vec<String>> {
        let sql = format!("PRAGMA index_list({})", self.wrap_identifier(table));
        let rows = sqlx::query(&sql).fetch_all(self.pool()?).await?;
        Ok(rows.iter().map(|r| r.get("name")).collect())
    }

    async fn get_table_references(
        &self,
        table: &str,
        _schema: Option<&str>,
    ) -> Result<Vec<String>> {
        let sql = format!("PRAGMA foreign_key_list({})", self.wrap_identifier(table));
        let rows = sqlx::query(&sql).fetch_all(self.pool()?).await?;
        let mut tables: Vec<String> = rows.iter().map(|r| r.get("table")).collect();
        tables.sort();
        tables.dedup();
        Ok(tables)
    }

    async fn get_table_keys(&self, table: &str, _schema: Option<&str>) -> Result<Vec<TableKey>> {
        let mut keys = Vec::new();

        let sql = format!("PRAGMA table_info({})", self.wrap_identifier(table));
        let rows = sqlx::query(&sql).fetch_all(self.pool()?).await?;
        for row in &rows {
            let pk: i32 = row.get("pk");
            if pk > 0 {
                keys.push(TableKey {
                    column_name: row.get("name"),
                    key_type: "PRIMARY KEY".to_string(),
                    constraint_name: None,
                    referenced_table: None,
                });
            }
        }

        let sql = format!("PRAGMA foreign_key_list({})", self.wrap_identifier(table));
        let rows = sqlx::query(&sql).fetch_all(self.pool()?).await?;
        for row in &rows {
            keys.push(TableKey {
                column_name: row.get("from"),
                key_type: "FOREIGN KEY".to_string(),
                constraint_name: None,
                referenced_table: Some(row.get("table")),
            });
        }
        Ok(keys)
    }

    async fn get_table_create_script(&self, table: &str, _schema: Option<&str>) -> Result<String> {
        let script: Option<String> = sqlx::query_scalar(queries::TABLE_SCRIPT)
            .bind(table)
            .fetch_optional(self.pool()?)
            .await?;
        script
            .map(|s| format!("{s};"))
            .ok_or_else(|| GatewayError::query(format!("table `{table}` not found"), None))
    }

    async fn get_view_create_script(&self, view: &str, _schema: Option<&str>) -> Result<String> {
        let script: Option<String> = sqlx::query_scalar(queries::VIEW_SCRIPT)
            .bind(view)
            .fetch_optional(self.pool()?)
            .await?;
        script
            .map(|s| format!("{s};"))
            .ok_or_else(|| GatewayError::query(format!("view `{view}` not found"), None))
    }

    async fn get_routine_create_script(
        &self,
        _routine: &str,
        _routine_type: RoutineType,
        _schema: Option<&str>,
    ) -> Result<String> {
        Err(GatewayError::not_supported("sqlite", "stored routines"))
    }

    async fn truncate_all_tables(&self, _schema: Option<&str>) -> Result<()> {
        let tables = self.list_tables(None).await?;
        let pool = self.pool()?;
        let mut conn = pool.acquire().await?;

        let has_sequences: Option<String> = sqlx::query_scalar(queries::HAS_SEQUENCE_TABLE)
            .fetch_optional(&mut *conn)
            .await?;

        for table in &tables {
            let sql = format!("DELETE FROM {}", self.wrap_identifier(&table.name));
            sqlx::query(&sql).execute(&mut *conn).await?;
            if has_sequences.is_some() {
                sqlx::query("DELETE FROM sqlite_sequence WHERE name = ?")
                    .bind(&table.name)
                    .execute(&mut *conn)
                    .await?;
            }
        }
        debug!(count = tables.len(), "Truncated tables");
        Ok(())
    }

    async fn execute_with_token(
        &self,
        sql: &str,
        token: &CancelToken,
    ) -> Result<Vec<QueryResult>> {
        let statements = crate::statement::identify(sql);
        if statements.is_empty() {
            return Ok(Vec::new());
        }

        let pool = self.pool()?.clone();
        let mut conn = pool.acquire().await?;
        token.arm(CancelHook::Abandon);

        let groups = tokio::select! {
            res = run_statements(&mut conn, &statements) => {
                res.map_err(|err| {
                    if token.is_canceled() {
                        GatewayError::Canceled
                    } else {
                        err
                    }
                })?
            }
            _ = token.cancelled() => return Err(GatewayError::Canceled),
        };
        Ok(normalize_results(&statements, groups))
    }

    fn wrap_identifier(&self, value: &str) -> String {
        wrap_with(value, '"', '"')
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn adapter(database: &str) -> SqliteAdapter {
        let server = crate::models::server::Server {
            name: "t".into(),
            client: "sqlite".into(),
            database: Some(database.to_string()),
            ..Default::default()
        };
        SqliteAdapter::new(ConnectParams {
            server,
            database: database.to_string(),
            select_top_limit: 1000,
        })
    }

    #[tokio::test]
    async fn test_connect_probes_version() {
        let sqlite = adapter(":memory:");
        let version = sqlite.connect().await.unwrap();
        assert_eq!(version.name, "SQLite");
        assert!(version.version.starts_with('3'));
        sqlite.disconnect().await;
    }

    #[tokio::test]
    async fn test_connect_is_idempotent() {
        let sqlite = adapter(":memory:");
        let first = sqlite.connect().await.unwrap();
        let second = sqlite.connect().await.unwrap();
        assert_eq!(first, second);
        sqlite.disconnect().await;
    }

    #[tokio::test]
    async fn test_list_tables_and_columns() {
        let sqlite = adapter(":memory:");
        sqlite.connect().await.unwrap();
        sqlite
            .execute_with_token(
                "CREATE TABLE users (id INTEGER PRIMARY KEY, name TEXT); \
                 CREATE TABLE roles (id INTEGER PRIMARY KEY)",
                &CancelToken::new(),
            )
            .await
            .unwrap();

        let tables = sqlite.list_tables(None).await.unwrap();
        let names: Vec<_> = tables.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["roles", "users"]);

        let columns = sqlite.list_table_columns("users", None).await.unwrap();
        assert_eq!(columns.len(), 2);
        assert_eq!(columns[0].column_name, "id");
        assert_eq!(columns[1].column_name, "name");
        sqlite.disconnect().await;
    }

    #[tokio::test]
    async fn test_execute_multi_statement_results() {
        let sqlite = adapter(":memory:");
        sqlite.connect().await.unwrap();
        sqlite
            .execute_with_token("CREATE TABLE t (x INTEGER)", &CancelToken::new())
            .await
            .unwrap();

        let results = sqlite
            .execute_with_token(
                "INSERT INTO t VALUES (1); INSERT INTO t VALUES (2); SELECT x FROM t",
                &CancelToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(results.len(), 3);
        assert_eq!(results[0].command, "INSERT");
        assert_eq!(results[0].affected_rows, Some(1));
        assert!(results[0].rows.is_empty());
        assert_eq!(results[2].command, "SELECT");
        assert_eq!(results[2].row_count, Some(2));
        assert_eq!(results[2].fields[0].name, "x");
        sqlite.disconnect().await;
    }

    #[tokio::test]
    async fn test_batch_error_carries_statement_index() {
        let sqlite = adapter(":memory:");
        sqlite.connect().await.unwrap();
        sqlite
            .execute_with_token("CREATE TABLE t (x INTEGER)", &CancelToken::new())
            .await
            .unwrap();

        let err = sqlite
            .execute_with_token(
                "INSERT INTO t VALUES (1); SELECT * FROM missing_table",
                &CancelToken::new(),
            )
            .await
            .unwrap_err();
        match err {
            GatewayError::Query {
                statement_index, ..
            } => assert_eq!(statement_index, Some(1)),
            other => panic!("unexpected error: {other:?}"),
        }
        sqlite.disconnect().await;
    }

    #[tokio::test]
    async fn test_create_script_round_trip() {
        let sqlite = adapter(":memory:");
        sqlite.connect().await.unwrap();
        sqlite
            .execute_with_token(
                "CREATE TABLE users (id INTEGER PRIMARY KEY, name TEXT)",
                &CancelToken::new(),
            )
            .await
            .unwrap();

        let script = sqlite.get_table_create_script("users", None).await.unwrap();
        assert!(script.starts_with("CREATE TABLE users"));
        assert!(script.ends_with(';'));
        sqlite.disconnect().await;
    }

    #[tokio::test]
    async fn test_table_keys() {
        let sqlite = adapter(":memory:");
        sqlite.connect().await.unwrap();
        sqlite
            .execute_with_token(
                "CREATE TABLE roles (id INTEGER PRIMARY KEY); \
                 CREATE TABLE users (id INTEGER PRIMARY KEY, role_id INTEGER REFERENCES roles(id))",
                &CancelToken::new(),
            )
            .await
            .unwrap();

        let keys = sqlite.get_table_keys("users", None).await.unwrap();
        assert!(keys
            .iter()
            .any(|k| k.key_type == "PRIMARY KEY" && k.column_name == "id"));
        assert!(keys
            .iter()
            .any(|k| k.key_type == "FOREIGN KEY"
                && k.referenced_table.as_deref() == Some("roles")));

        let refs = sqlite.get_table_references("users", None).await.unwrap();
        assert_eq!(refs, vec!["roles".to_string()]);
        sqlite.disconnect().await;
    }

    #[tokio::test]
    async fn test_truncate_all_tables() {
        let sqlite = adapter(":memory:");
        sqlite.connect().await.unwrap();
        sqlite
            .execute_with_token(
                "CREATE TABLE t (x INTEGER); INSERT INTO t VALUES (1); INSERT INTO t VALUES (2)",
                &CancelToken::new(),
            )
            .await
            .unwrap();

        sqlite.truncate_all_tables(None).await.unwrap();
        let results = sqlite
            .execute_with_token("SELECT * FROM t", &CancelToken::new())
            .await
            .unwrap();
        assert_eq!(results[0].row_count, Some(0));
        sqlite.disconnect().await;
    }

    #[tokio::test]
    async fn test_empty_batch_yields_empty_list() {
        let sqlite = adapter(":memory:");
        sqlite.connect().await.unwrap();
        let results = sqlite
            .execute_with_token("  -- just a comment\n", &CancelToken::new())
            .await
            .unwrap();
        assert!(results.is_empty());
        sqlite.disconnect().await;
    }

    #[test]
    fn test_wrap_identifier_double_quotes() {
        let sqlite = adapter(":memory:");
        assert_eq!(sqlite.wrap_identifier("users"), "\"users\"");
        assert_eq!(sqlite.wrap_identifier("*"), "*");
    }
}
