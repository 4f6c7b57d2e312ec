//! MySQL/MariaDB adapter.
//!
//! Introspection reads `information_schema` scoped to the connected database
//! (`DATABASE()`), so the schema argument of the listing operations is
//! ignored — MySQL's schema and database are the same thing here. Create
//! scripts come straight from `SHOW CREATE ...`. Cancellation records
//! `CONNECTION_ID()` when the batch starts and kills that thread's query
//! from a second connection; the interrupted statement reports SQLSTATE
//! 70100, which maps to the canceled error.

use async_trait::async_trait;
use futures_util::stream::StreamExt;
use sqlx::mysql::{MySqlConnectOptions, MySqlPool, MySqlPoolOptions, MySqlSslMode};
use sqlx::{Either, Row as _};
use tokio::sync::OnceCell;
use tracing::{debug, info};

use crate::adapters::types::RowToJson;
use crate::adapters::{
    normalize_results, wrap_with, Adapter, CancelHook, CancelToken, ConnectParams, StatementGroup,
    POOL_MAX_CONNECTIONS,
};
use crate::error::{GatewayError, Result};
use crate::models::query::QueryResult;
use crate::models::schema::{
    apply_filter, ColumnInfo, Filter, RoutineInfo, RoutineType, TableKey, TableRef,
};
use crate::version::VersionInfo;

/// SQLSTATE for ER_QUERY_INTERRUPTED.
const QUERY_INTERRUPTED: &str = "70100";

mod queries {
    pub const LIST_DATABASES: &str = "SHOW DATABASES";

    pub const LIST_TABLES: &str = r#"
        SELECT table_name
        FROM information_schema.tables
        WHERE table_schema = DATABASE()
          AND table_type = 'BASE TABLE'
        ORDER BY table_name
        "#;

    pub const LIST_VIEWS: &str = r#"
        SELECT table_name
        FROM information_schema.views
        WHERE table_schema = DATABASE()
        ORDER BY table_name
        "#;

    pub const LIST_ROUTINES: &str = r#"
        SELECT routine_name, routine_type
        FROM information_schema.routines
        WHERE routine_schema = DATABASE()
        ORDER BY routine_name
        "#;

    pub const LIST_COLUMNS: &str = r#"
        SELECT column_name, data_type
        FROM information_schema.columns
        WHERE table_schema = DATABASE() AND table_name = ?
        ORDER BY ordinal_position
        "#;

    pub const LIST_TRIGGERS: &str = r#"
        SELECT trigger_name
        FROM information_schema.triggers
        WHERE event_object_schema = DATABASE() AND event_object_table = ?
        ORDER BY trigger_name
        "#;

    pub const LIST_INDEXES: &str = r#"
        SELECT DISTINCT index_name
        FROM information_schema.statistics
        WHERE table_schema = DATABASE() AND table_name = ?
        ORDER BY index_name
        "#;

    pub const TABLE_REFERENCES: &str = r#"
        SELECT DISTINCT referenced_table_name
        FROM information_schema.key_column_usage
        WHERE table_schema = DATABASE()
          AND table_name = ?
          AND referenced_table_name IS NOT NULL
        ORDER BY referenced_table_name
        "#;

    pub const TABLE_KEYS: &str = r#"
        SELECT column_name,
               constraint_name,
               referenced_table_name,
               CASE WHEN constraint_name = 'PRIMARY' THEN 'PRIMARY KEY'
                    ELSE 'FOREIGN KEY'
               END AS key_type
        FROM information_schema.key_column_usage
        WHERE table_schema = DATABASE()
          AND table_name = ?
          AND (constraint_name = 'PRIMARY' OR referenced_table_name IS NOT NULL)
        ORDER BY ordinal_position
        "#;
}

pub struct MySqlAdapter {
    params: ConnectParams,
    state: OnceCell<(MySqlPool, VersionInfo)>,
}

impl MySqlAdapter {
    pub fn new(params: ConnectParams) -> Self {
        Self {
            params,
            state: OnceCell::new(),
        }
    }

    fn connect_options(&self) -> MySqlConnectOptions {
        let server = &self.params.server;
        let mut options = MySqlConnectOptions::new()
            .database(&self.params.database)
            .charset("utf8mb4");
        if let Some(socket) = &server.socket_path {
            options = options.socket(socket);
        } else {
            if let Some(host) = &server.host {
                options = options.host(host);
            }
            if let Some(port) = server.port {
                options = options.port(port);
            }
        }
        if let Some(user) = &server.user {
            options = options.username(user);
        }
        if let Some(password) = &server.password {
            options = options.password(password);
        }
        options.ssl_mode(if server.ssl == Some(true) {
            MySqlSslMode::Required
        } else {
            MySqlSslMode::Preferred
        })
    }

    fn pool(&self) -> Result<&MySqlPool> {
        self.state
            .get()
            .map(|(pool, _)| pool)
            .ok_or_else(|| GatewayError::connect("adapter is not connected"))
    }

    fn product_name(&self) -> &'static str {
        if self.params.server.client == "mariadb" {
            "MariaDB"
        } else {
            "MySQL"
        }
    }

    /// First-column string from a `SHOW CREATE ...` style row, tolerating
    /// VARBINARY results.
    fn show_create_value(row: &sqlx::mysql::MySqlRow, index: usize) -> Option<String> {
        row.try_get::<String, _>(index).ok().or_else(|| {
            row.try_get::<Vec<u8>, _>(index)
                .ok()
                .and_then(|bytes| String::from_utf8(bytes).ok())
        })
    }
}

async fn drain_batch(
    conn: &mut sqlx::pool::PoolConnection<sqlx::MySql>,
    sql: &str,
) -> Result<Vec<StatementGroup>> {
    let mut groups: Vec<StatementGroup> = Vec::new();
    let mut rows = Vec::new();
    let mut fields = Vec::new();

    let mut stream = sqlx::raw_sql(sql).fetch_many(&mut **conn);
    while let Some(item) = stream.next().await {
        match item {
            Ok(Either::Left(done)) => {
                groups.push(StatementGroup {
                    rows: std::mem::take(&mut rows),
                    fields: std::mem::take(&mut fields),
                    affected: Some(done.rows_affected()),
                });
            }
            Ok(Either::Right(row)) => {
                if fields.is_empty() {
                    fields = row.result_fields();
                }
                rows.push(row.to_row_map());
            }
            Err(err) => {
                let index = groups.len();
                return Err(GatewayError::from(err).at_statement(index));
            }
        }
    }
    Ok(groups)
}

#[async_trait]
impl Adapter for MySqlAdapter {
    fn key(&self) -> &'static str {
        // mysql and mariadb share this adapter
        "mysql"
    }

    fn params(&self) -> &ConnectParams {
        &self.params
    }

    async fn connect(&self) -> Result<VersionInfo> {
        let (_, version) = self
            .state
            .get_or_try_init(|| async {
                let pool = MySqlPoolOptions::new()
                    .max_connections(POOL_MAX_CONNECTIONS)
                    .connect_with(self.connect_options())
                    .await
                    .map_err(|e| GatewayError::connect(e.to_string()))?;

                let raw: String = sqlx::query_scalar("SELECT version()")
                    .fetch_one(&pool)
                    .await?;
                let version = VersionInfo::from_probe(self.product_name(), raw);
                info!(
                    client = %self.params.server.client,
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
        let rows = sqlx::query(queries::LIST_DATABASES)
            .fetch_all(self.pool()?)
            .await?;
        let names = rows
            .iter()
            .filter_map(|r| Self::show_create_value(r, 0))
            .collect();
        Ok(apply_filter(names, filter))
    }

    async fn list_schemas(&self, _filter: Option<&Filter>) -> Result<Vec<String>> {
        // Schemas and databases are the same namespace here.
        Ok(Vec::new())
    }

    async fn list_tables(&self, _schema: Option<&str>) -> Result<Vec<TableRef>> {
        let rows = sqlx::query(queries::LIST_TABLES)
            .fetch_all(self.pool()?)
            .await?;
        let tables: Vec<TableRef> = rows
            .iter()
            .filter_map(|r| Self::show_create_value(r, 0).map(TableRef::new))
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
            .filter_map(|r| Self::show_create_value(r, 0).map(TableRef::new))
            .collect())
    }

    async fn list_routines(&self, _schema: Option<&str>) -> Result<Vec<RoutineInfo>> {
        let rows = sqlx::query(queries::LIST_ROUTINES)
            .fetch_all(self.pool()?)
            .await?;
        Ok(rows
            .iter()
            .filter_map(|r| {
                let name = Self::show_create_value(r, 0)?;
                let routine_type = Self::show_create_value(r, 1)?;
                Some(RoutineInfo {
                    schema: None,
                    routine_name: name,
                    routine_type: if routine_type.eq_ignore_ascii_case("function") {
                        RoutineType::Function
                    } else {
                        RoutineType::Procedure
                    },
                })
            })
            .collect())
    }

    async fn list_table_columns(
        &self,
        table: &str,
        _schema: Option<&str>,
    ) -> Result<Vec<ColumnInfo>> {
        let rows = sqlx::query(queries::LIST_COLUMNS)
            .bind(table)
            .fetch_all(self.pool()?)
            .await?;
        Ok(rows
            .iter()
            .filter_map(|r| {
                Some(ColumnInfo::new(
                    Self::show_create_value(r, 0)?,
                    Self::show_create_value(r, 1)?,
                ))
            })
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
        Ok(rows
            .iter()
            .filter_map(|r| Self::show_create_value(r, 0))
            .collect())
    }

    async fn list_table_indexes(&self, table: &str, _schema: Option<&str>) -> Result<Vec<String>> {
        let rows = sqlx::query(queries::LIST_INDEXES)
            .bind(table)
            .fetch_all(self.pool()?)
            .await?;
        Ok(rows
            .iter()
            .filter_map(|r| Self::show_create_value(r, 0))
            .collect())
    }

    async fn get_table_references(
        &self,
        table: &str,
        _schema: Option<&str>,
    ) -> Result<Vec<String>> {
        let rows = sqlx::query(queries::TABLE_REFERENCES)
            .bind(table)
            .fetch_all(self.pool()?)
            .await?;
        Ok(rows
            .iter()
            .filter_map(|r| Self::show_create_value(r, 0))
            .collect())
    }

    async fn get_table_keys(&self, table: &str, _schema: Option<&str>) -> Result<Vec<TableKey>> {
        let rows = sqlx::query(queries::TABLE_KEYS)
            .bind(table)
            .fetch_all(self.pool()?)
            .await?;
        Ok(rows
            .iter()
            .filter_map(|r| {
                Some(TableKey {
                    column_name: Self::show_create_value(r, 0)?,
                    constraint_name: Self::show_create_value(r, 1),
                    referenced_table: Self::show_create_value(r, 2),
                    key_type: Self::show_create_value(r, 3)?,
                })
            })
            .collect())
    }

    async fn get_table_create_script(&self, table: &str, _schema: Option<&str>) -> Result<String> {
        let sql = format!("SHOW CREATE TABLE {}", self.wrap_identifier(table));
        let row = sqlx::query(&sql).fetch_one(self.pool()?).await?;
        // Column 0 is the table name, column 1 the DDL.
        Self::show_create_value(&row, 1)
            .ok_or_else(|| GatewayError::query("SHOW CREATE TABLE returned no script", None))
    }

    async fn get_view_create_script(&self, view: &str, _schema: Option<&str>) -> Result<String> {
        let sql = format!("SHOW CREATE VIEW {}", self.wrap_identifier(view));
        let row = sqlx::query(&sql).fetch_one(self.pool()?).await?;
        Self::show_create_value(&row, 1)
            .ok_or_else(|| GatewayError::query("SHOW CREATE VIEW returned no script", None))
    }

    async fn get_routine_create_script(
        &self,
        routine: &str,
        routine_type: RoutineType,
        _schema: Option<&str>,
    ) -> Result<String> {
        let keyword = match routine_type {
            RoutineType::Function => "FUNCTION",
            RoutineType::Procedure => "PROCEDURE",
        };
        let sql = format!("SHOW CREATE {keyword} {}", self.wrap_identifier(routine));
        let row = sqlx::query(&sql).fetch_one(self.pool()?).await?;
        // Layout: name, sql_mode, DDL, charset columns.
        Self::show_create_value(&row, 2)
            .ok_or_else(|| GatewayError::query("SHOW CREATE returned no script", None))
    }

    async fn truncate_all_tables(&self, _schema: Option<&str>) -> Result<()> {
        let tables = self.list_tables(None).await?;
        let mut conn = self.pool()?.acquire().await?;
        sqlx::query("SET FOREIGN_KEY_CHECKS = 0")
            .execute(&mut *conn)
            .await?;
        let result: Result<()> = async {
            for table in &tables {
                let sql = format!("TRUNCATE TABLE {}", self.wrap_identifier(&table.name));
                sqlx::query(&sql).execute(&mut *conn).await?;
            }
            Ok(())
        }
        .await;
        // Restore the check even when a truncate failed.
        let _ = sqlx::query("SET FOREIGN_KEY_CHECKS = 1")
            .execute(&mut *conn)
            .await;
        result?;
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
        let thread_id: u64 = sqlx::query_scalar("SELECT CONNECTION_ID()")
            .fetch_one(&mut *conn)
            .await?;
        token.arm(CancelHook::MySqlThread {
            id: thread_id,
            pool: pool.clone(),
        });

        let groups = tokio::select! {
            res = drain_batch(&mut conn, sql) => {
                res.map_err(|err| {
                    if token.is_canceled() || err.code() == Some(QUERY_INTERRUPTED) {
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
        wrap_with(value, '`', '`')
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::server::Server;

    fn adapter() -> MySqlAdapter {
        let server = Server {
            name: "t".into(),
            client: "mysql".into(),
            host: Some("localhost".into()),
            port: Some(3306),
            ssl: Some(false),
            ..Default::default()
        };
        MySqlAdapter::new(ConnectParams {
            server,
            database: "mysql".into(),
            select_top_limit: 1000,
        })
    }

    #[test]
    fn test_wrap_identifier_backticks() {
        let my = adapter();
        assert_eq!(my.wrap_identifier("users"), "`users`");
        assert_eq!(my.wrap_identifier("*"), "*");
        assert_eq!(my.wrap_identifier("we`ird"), "`we``ird`");
    }

    #[test]
    fn test_query_select_top_uses_limit_keyword() {
        let my = adapter();
        assert_eq!(
            my.query_select_top("users", None, Some(10)),
            "SELECT * FROM `users` LIMIT 10"
        );
    }

    #[test]
    fn test_mariadb_product_name() {
        let server = Server {
            name: "t".into(),
            client: "mariadb".into(),
            host: Some("localhost".into()),
            port: Some(3306),
            ssl: Some(false),
            ..Default::default()
        };
        let my = MySqlAdapter::new(ConnectParams {
            server,
            database: "mysql".into(),
            select_top_limit: 1000,
        });
        assert_eq!(my.product_name(), "MariaDB");
    }
}
