//! PostgreSQL adapter, also serving Redshift.
//!
//! Introspection goes through `information_schema` and the `pg_catalog`
//! views. Batches run over the simple query protocol so multi-statement
//! text produces one result per statement. Cancellation records the backend
//! pid at acquisition and issues `pg_cancel_backend` from a second
//! connection; a query killed that way surfaces SQLSTATE 57014 and is mapped
//! to the canceled error.
//!
//! Redshift shares the wire protocol but not every feature: triggers do not
//! exist, and routine source must be reconstructed from
//! `information_schema.routines` instead of `pg_get_functiondef`.

use async_trait::async_trait;
use futures_util::stream::StreamExt;
use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions, PgSslMode};
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

/// SQLSTATE reported when a backend is canceled by `pg_cancel_backend`.
const QUERY_CANCELED: &str = "57014";

const DEFAULT_SCHEMA: &str = "public";

/// Which product this adapter fronts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PgFlavor {
    Postgres,
    Redshift,
}

impl PgFlavor {
    fn product_name(self) -> &'static str {
        match self {
            Self::Postgres => "PostgreSQL",
            Self::Redshift => "Redshift",
        }
    }
}

mod queries {
    pub const LIST_DATABASES: &str = r#"
        SELECT datname
        FROM pg_database
        WHERE datistemplate = false
        ORDER BY datname
        "#;

    pub const LIST_SCHEMAS: &str = r#"
        SELECT schema_name
        FROM information_schema.schemata
        WHERE schema_name NOT IN ('pg_catalog', 'information_schema')
        ORDER BY schema_name
        "#;

    pub const LIST_TABLES: &str = r#"
        SELECT table_schema, table_name
        FROM information_schema.tables
        WHERE table_schema = $1
          AND table_type = 'BASE TABLE'
        ORDER BY table_name
        "#;

    pub const LIST_VIEWS: &str = r#"
        SELECT table_schema, table_name
        FROM information_schema.views
        WHERE table_schema = $1
        ORDER BY table_name
        "#;

    pub const LIST_ROUTINES: &str = r#"
        SELECT routine_schema, routine_name, routine_type
        FROM information_schema.routines
        WHERE routine_schema = $1
        GROUP BY routine_schema, routine_name, routine_type
        ORDER BY routine_name
        "#;

    pub const LIST_COLUMNS: &str = r#"
        SELECT column_name, data_type
        FROM information_schema.columns
        WHERE table_schema = $1 AND table_name = $2
        ORDER BY ordinal_position
        "#;

    pub const LIST_TRIGGERS: &str = r#"
        SELECT trigger_name
        FROM information_schema.triggers
        WHERE event_object_schema = $1 AND event_object_table = $2
        GROUP BY trigger_name
        ORDER BY trigger_name
        "#;

    pub const LIST_INDEXES: &str = r#"
        SELECT indexname
        FROM pg_indexes
        WHERE schemaname = $1 AND tablename = $2
        ORDER BY indexname
        "#;

    pub const TABLE_REFERENCES: &str = r#"
        SELECT ccu.table_name AS referenced_table
        FROM information_schema.table_constraints tc
        JOIN information_schema.constraint_column_usage ccu
          ON ccu.constraint_name = tc.constraint_name
          AND ccu.table_schema = tc.table_schema
        WHERE tc.table_schema = $1
          AND tc.table_name = $2
          AND tc.constraint_type = 'FOREIGN KEY'
        GROUP BY ccu.table_name
        ORDER BY ccu.table_name
        "#;

    pub const TABLE_KEYS: &str = r#"
        SELECT kcu.column_name,
               tc.constraint_type AS key_type,
               tc.constraint_name,
               CASE WHEN tc.constraint_type = 'FOREIGN KEY'
                    THEN ccu.table_name
               END AS referenced_table
        FROM information_schema.table_constraints tc
        JOIN information_schema.key_column_usage kcu
          ON kcu.constraint_name = tc.constraint_name
          AND kcu.table_schema = tc.table_schema
        LEFT JOIN information_schema.constraint_column_usage ccu
          ON ccu.constraint_name = tc.constraint_name
          AND ccu.table_schema = tc.table_schema
        WHERE tc.table_schema = $1
          AND tc.table_name = $2
          AND tc.constraint_type IN ('PRIMARY KEY', 'FOREIGN KEY')
        ORDER BY kcu.ordinal_position
        "#;

    pub const CREATE_SCRIPT_COLUMNS: &str = r#"
        SELECT column_name,
               data_type,
               character_maximum_length,
               is_nullable,
               column_default
        FROM information_schema.columns
        WHERE table_schema = $1 AND table_name = $2
        ORDER BY ordinal_position
        "#;

    pub const PRIMARY_KEY_COLUMNS: &str = r#"
        SELECT kcu.column_name
        FROM information_schema.table_constraints tc
        JOIN information_schema.key_column_usage kcu
          ON kcu.constraint_name = tc.constraint_name
          AND kcu.table_schema = tc.table_schema
        WHERE tc.table_schema = $1
          AND tc.table_name = $2
          AND tc.constraint_type = 'PRIMARY KEY'
        ORDER BY kcu.ordinal_position
        "#;

    pub const VIEW_DEFINITION: &str = r#"
        SELECT pg_get_viewdef(c.oid, true) AS definition
        FROM pg_class c
        JOIN pg_namespace n ON n.oid = c.relnamespace
        WHERE n.nspname = $1 AND c.relname = $2
        "#;

    pub const FUNCTION_DEFINITION: &str = r#"
        SELECT pg_get_functiondef(p.oid) AS definition
        FROM pg_proc p
        JOIN pg_namespace n ON n.oid = p.pronamespace
        WHERE n.nspname = $1 AND p.proname = $2
        LIMIT 1
        "#;

    /// Redshift has no `pg_get_functiondef`; rebuild from the standard view.
    pub const ROUTINE_SOURCE: &str = r#"
        SELECT routine_name, routine_definition, external_language
        FROM information_schema.routines
        WHERE routine_schema = $1 AND routine_name = $2
        LIMIT 1
        "#;
}

pub struct PostgresAdapter {
    params: ConnectParams,
    flavor: PgFlavor,
    state: OnceCell<(PgPool, VersionInfo)>,
}

impl PostgresAdapter {
    pub fn new(params: ConnectParams, flavor: PgFlavor) -> Self {
        Self {
            params,
            flavor,
            state: OnceCell::new(),
        }
    }

    fn connect_options(&self) -> PgConnectOptions {
        let server = &self.params.server;
        let mut options = PgConnectOptions::new().database(&self.params.database);
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
            PgSslMode::Require
        } else {
            PgSslMode::Prefer
        })
    }

    fn pool(&self) -> Result<&PgPool> {
        self.state
            .get()
            .map(|(pool, _)| pool)
            .ok_or_else(|| GatewayError::connect("adapter is not connected"))
    }

    fn schema_or_default<'a>(&self, schema: Option<&'a str>) -> &'a str {
        schema.unwrap_or(DEFAULT_SCHEMA)
    }
}

/// Drain a simple-protocol batch into per-statement groups.
async fn drain_batch(
    conn: &mut sqlx::pool::PoolConnection<sqlx::Postgres>,
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
impl Adapter for PostgresAdapter {
    fn key(&self) -> &'static str {
        match self.flavor {
            PgFlavor::Postgres => "postgresql",
            PgFlavor::Redshift => "redshift",
        }
    }

    fn params(&self) -> &ConnectParams {
        &self.params
    }

    async fn connect(&self) -> Result<VersionInfo> {
        let (_, version) = self
            .state
            .get_or_try_init(|| async {
                let pool = PgPoolOptions::new()
                    .max_connections(POOL_MAX_CONNECTIONS)
                    .connect_with(self.connect_options())
                    .await
                    .map_err(|e| GatewayError::connect(e.to_string()))?;

                let raw: String = sqlx::query_scalar("SELECT version()")
                    .fetch_one(&pool)
                    .await?;
                let version = VersionInfo::from_probe(self.flavor.product_name(), raw);
                info!(
                    client = self.key(),
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
        let names = rows.iter().map(|r| r.get("datname")).collect();
        Ok(apply_filter(names, filter))
    }

    async fn list_schemas(&self, filter: Option<&Filter>) -> Result<Vec<String>> {
        let rows = sqlx::query(queries::LIST_SCHEMAS)
            .fetch_all(self.pool()?)
            .await?;
        let names = rows.iter().map(|r| r.get("schema_name")).collect();
        Ok(apply_filter(names, filter))
    }

    async fn list_tables(&self, schema: Option<&str>) -> Result<Vec<TableRef>> {
        let schema = self.schema_or_default(schema);
        let rows = sqlx::query(queries::LIST_TABLES)
            .bind(schema)
            .fetch_all(self.pool()?)
            .await?;
        let tables = rows
            .iter()
            .map(|r| TableRef::new(r.get::<String, _>("table_name")).with_schema(schema))
            .collect::<Vec<_>>();
        debug!(count = tables.len(), schema, "Listed tables");
        Ok(tables)
    }

    async fn list_views(&self, schema: Option<&str>) -> Result<Vec<TableRef>> {
        let schema = self.schema_or_default(schema);
        let rows = sqlx::query(queries::LIST_VIEWS)
            .bind(schema)
            .fetch_all(self.pool()?)
            .await?;
        Ok(rows
            .iter()
            .map(|r| TableRef::new(r.get::<String, _>("table_name")).with_schema(schema))
            .collect())
    }

    async fn list_routines(&self, schema: Option<&str>) -> Result<Vec<RoutineInfo>> {
        let schema = self.schema_or_default(schema);
        let rows = sqlx::query(queries::LIST_ROUTINES)
            .bind(schema)
            .fetch_all(self.pool()?)
            .await?;
        Ok(rows
            .iter()
            .map(|r| {
                let routine_type: String = r.get("routine_type");
                RoutineInfo {
                    schema: Some(r.get("routine_schema")),
                    routine_name: r.get("routine_name"),
                    routine_type: if routine_type.eq_ignore_ascii_case("procedure") {
                        RoutineType::Procedure
                    } else {
                        RoutineType::Function
                    },
                }
            })
            .collect())
    }

    async fn list_table_columns(
        &self,
        table: &str,
        schema: Option<&str>,
    ) -> Result<Vec<ColumnInfo>> {
        let rows = sqlx::query(queries::LIST_COLUMNS)
            .bind(self.schema_or_default(schema))
            .bind(table)
            .fetch_all(self.pool()?)
            .await?;
        Ok(rows
            .iter()
            .map(|r| ColumnInfo::new(r.get::<String, _>("column_name"), r.get::<String, _>("data_type")))
            .collect())
    }

    async fn list_table_triggers(
        &self,
        table: &str,
        schema: Option<&str>,
    ) -> Result<Vec<String>> {
        if self.flavor == PgFlavor::Redshift {
            return Ok(Vec::new());
        }
        let rows = sqlx::query(queries::LIST_TRIGGERS)
            .bind(self.schema_or_default(schema))
            .bind(table)
            .fetch_all(self.pool()?)
            .await?;
        Ok(rows.iter().map(|r| r.get("trigger_name")).collect())
    }

    async fn list_table_indexes(&self, table: &str, schema: Option<&str>) -> Result<Vec<String>> {
        let rows = sqlx::query(queries::LIST_INDEXES)
            .bind(self.schema_or_default(schema))
            .bind(table)
            .fetch_all(self.pool()?)
            .await?;
        Ok(rows.iter().map(|r| r.get("indexname")).collect())
    }

    async fn get_table_references(
        &self,
        table: &str,
        schema: Option<&str>,
    ) -> Result<Vec<String>> {
        let rows = sqlx::query(queries::TABLE_REFERENCES)
            .bind(self.schema_or_default(schema))
            .bind(table)
            .fetch_all(self.pool()?)
            .await?;
        Ok(rows.iter().map(|r| r.get("referenced_table")).collect())
    }

    async fn get_table_keys(&self, table: &str, schema: Option<&str>) -> Result<Vec<TableKey>> {
        let rows = sqlx::query(queries::TABLE_KEYS)
            .bind(self.schema_or_default(schema))
            .bind(table)
            .fetch_all(self.pool()?)
            .await?;
        Ok(rows
            .iter()
            .map(|r| TableKey {
                column_name: r.get("column_name"),
                key_type: r.get("key_type"),
                constraint_name: r.try_get("constraint_name").ok(),
                referenced_table: r.try_get("referenced_table").ok().flatten(),
            })
            .collect())
    }

    async fn get_table_create_script(&self, table: &str, schema: Option<&str>) -> Result<String> {
        let schema_name = self.schema_or_default(schema);
        let columns = sqlx::query(queries::CREATE_SCRIPT_COLUMNS)
            .bind(schema_name)
            .bind(table)
            .fetch_all(self.pool()?)
            .await?;
        if columns.is_empty() {
            return Err(GatewayError::query(
                format!("table `{table}` not found in schema `{schema_name}`"),
                None,
            ));
        }

        let mut lines: Vec<String> = columns
            .iter()
            .map(|r| {
                let name: String = r.get("column_name");
                let data_type: String = r.get("data_type");
                let max_len: Option<i32> = r.try_get("character_maximum_length").ok().flatten();
                let nullable: String = r.get("is_nullable");
                let default: Option<String> = r.try_get("column_default").ok().flatten();

                let mut line = format!("  {} {}", self.wrap_identifier(&name), data_type);
                if let Some(n) = max_len {
                    line.push_str(&format!("({n})"));
                }
                if let Some(d) = default {
                    line.push_str(&format!(" DEFAULT {d}"));
                }
                if nullable == "NO" {
                    line.push_str(" NOT NULL");
                }
                line
            })
            .collect();

        let pk_rows = sqlx::query(queries::PRIMARY_KEY_COLUMNS)
            .bind(schema_name)
            .bind(table)
            .fetch_all(self.pool()?)
            .await?;
        if !pk_rows.is_empty() {
            let cols: Vec<String> = pk_rows
                .iter()
                .map(|r| self.wrap_identifier(&r.get::<String, _>("column_name")))
                .collect();
            lines.push(format!("  PRIMARY KEY ({})", cols.join(", ")));
        }

        Ok(format!(
            "CREATE TABLE {} (\n{}\n);",
            self.qualify(table, Some(schema_name)),
            lines.join(",\n")
        ))
    }

    async fn get_view_create_script(&self, view: &str, schema: Option<&str>) -> Result<String> {
        let schema_name = self.schema_or_default(schema);
        let definition: Option<String> = sqlx::query_scalar(queries::VIEW_DEFINITION)
            .bind(schema_name)
            .bind(view)
            .fetch_optional(self.pool()?)
            .await?;
        let definition = definition.ok_or_else(|| {
            GatewayError::query(format!("view `{view}` not found"), None)
        })?;
        Ok(format!(
            "CREATE OR REPLACE VIEW {} AS\n{}",
            self.qualify(view, Some(schema_name)),
            definition
        ))
    }

    async fn get_routine_create_script(
        &self,
        routine: &str,
        _routine_type: RoutineType,
        schema: Option<&str>,
    ) -> Result<String> {
        let schema_name = self.schema_or_default(schema);
        match self.flavor {
            PgFlavor::Postgres => {
                let definition: Option<String> = sqlx::query_scalar(queries::FUNCTION_DEFINITION)
                    .bind(schema_name)
                    .bind(routine)
                    .fetch_optional(self.pool()?)
                    .await?;
                definition.ok_or_else(|| {
                    GatewayError::query(format!("routine `{routine}` not found"), None)
                })
            }
            PgFlavor::Redshift => {
                let row = sqlx::query(queries::ROUTINE_SOURCE)
                    .bind(schema_name)
                    .bind(routine)
                    .fetch_optional(self.pool()?)
                    .await?
                    .ok_or_else(|| {
                        GatewayError::query(format!("routine `{routine}` not found"), None)
                    })?;
                let body: Option<String> = row.try_get("routine_definition").ok().flatten();
                let language: Option<String> = row.try_get("external_language").ok().flatten();
                Ok(format!(
                    "CREATE OR REPLACE FUNCTION {}.{} AS $$\n{}\n$$ LANGUAGE {};",
                    self.wrap_identifier(schema_name),
                    self.wrap_identifier(routine),
                    body.unwrap_or_default(),
                    language.unwrap_or_else(|| "plpgsql".to_string()).to_lowercase()
                ))
            }
        }
    }

    async fn truncate_all_tables(&self, schema: Option<&str>) -> Result<()> {
        let schema_name = self.schema_or_default(schema);
        let tables = self.list_tables(Some(schema_name)).await?;
        let mut conn = self.pool()?.acquire().await?;
        for table in &tables {
            let sql = format!(
                "TRUNCATE TABLE {} RESTART IDENTITY CASCADE",
                self.qualify(&table.name, Some(schema_name))
            );
            sqlx::query(&sql).execute(&mut *conn).await?;
        }
        debug!(count = tables.len(), schema = schema_name, "Truncated tables");
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
        let pid: i32 = sqlx::query_scalar("SELECT pg_backend_pid()")
            .fetch_one(&mut *conn)
            .await?;
        token.arm(CancelHook::PgBackend {
            pid,
            pool: pool.clone(),
        });

        let groups = tokio::select! {
            res = drain_batch(&mut conn, sql) => {
                res.map_err(|err| {
                    if token.is_canceled() || err.code() == Some(QUERY_CANCELED) {
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
    use crate::models::server::Server;

    fn adapter(flavor: PgFlavor) -> PostgresAdapter {
        let server = Server {
            name: "t".into(),
            client: if flavor == PgFlavor::Redshift {
                "redshift".into()
            } else {
                "postgresql".into()
            },
            host: Some("localhost".into()),
            port: Some(5432),
            ssl: Some(false),
            ..Default::default()
        };
        PostgresAdapter::new(
            ConnectParams {
                server,
                database: "postgres".into(),
                select_top_limit: 1000,
            },
            flavor,
        )
    }

    #[test]
    fn test_wrap_identifier_double_quotes() {
        let pg = adapter(PgFlavor::Postgres);
        assert_eq!(pg.wrap_identifier("users"), "\"users\"");
        assert_eq!(pg.wrap_identifier("*"), "*");
        assert_eq!(pg.wrap_identifier("we\"ird"), "\"we\"\"ird\"");
        assert_eq!(pg.wrap_identifier("tags[1]"), "\"tags\"[1]");
    }

    #[test]
    fn test_query_select_top_uses_limit() {
        let pg = adapter(PgFlavor::Postgres);
        assert_eq!(
            pg.query_select_top("users", Some("public"), Some(25)),
            "SELECT * FROM \"public\".\"users\" LIMIT 25"
        );
        // Defaults to the configured cap.
        assert_eq!(
            pg.query_select_top("users", None, None),
            "SELECT * FROM \"users\" LIMIT 1000"
        );
    }

    #[test]
    fn test_key_by_flavor() {
        assert_eq!(adapter(PgFlavor::Postgres).key(), "postgresql");
        assert_eq!(adapter(PgFlavor::Redshift).key(), "redshift");
    }

    #[test]
    fn test_not_connected_errors() {
        let pg = adapter(PgFlavor::Postgres);
        assert!(pg.pool().is_err());
        assert!(pg.version().is_none());
    }
}
