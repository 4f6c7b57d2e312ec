//! Dialect adapters.
//!
//! Every supported engine implements the same [`Adapter`] contract; callers
//! never see a driver type. Dispatch goes through [`create_adapter`], keyed
//! by the descriptor's client string. Dialect-specific behavior — identifier
//! quoting, introspection SQL, multi-statement handling, cancellation — lives
//! entirely inside each implementation.

pub mod cassandra;
pub mod mysql;
pub mod postgres;
pub mod sqlite;
pub mod sqlserver;
pub mod types;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::{GatewayError, Result};
use crate::models::query::QueryResult;
use crate::models::schema::{ColumnInfo, Filter, RoutineInfo, RoutineType, TableKey, TableRef};
use crate::models::server::Server;
use crate::statement::{IdentifiedStatement, StatementKind};
use crate::version::VersionInfo;

pub use postgres::{PgFlavor, PostgresAdapter};

/// Placeholder adapters leave in generated WHERE clauses for the caller to
/// fill in.
pub const CONDITION_PLACEHOLDER: &str = "<condition>";

/// Runtime parameters handed to an adapter: the descriptor with plaintext
/// secrets and the post-tunnel effective address, plus the database to bind.
#[derive(Debug, Clone)]
pub struct ConnectParams {
    pub server: Server,
    pub database: String,
    /// Row cap for `get_query_select_top` when the caller passes no limit.
    pub select_top_limit: u64,
}

/// Maximum pooled connections per (session, database).
pub const POOL_MAX_CONNECTIONS: u32 = 5;

// =============================================================================
// Cancellation
// =============================================================================

/// Dialect-specific action a cancel request performs.
pub enum CancelHook {
    /// Issue `SELECT pg_cancel_backend(pid)` on a second connection.
    PgBackend { pid: i32, pool: sqlx::PgPool },
    /// Issue `KILL QUERY <thread>` on a second connection.
    MySqlThread { id: u64, pool: sqlx::MySqlPool },
    /// No server-side action; the racing future is abandoned.
    Abandon,
}

struct TokenInner {
    signal: CancellationToken,
    hook: Mutex<Option<CancelHook>>,
    armed: AtomicBool,
}

/// Single-shot cancellation signal tied to one query handle.
///
/// The adapter arms the token once the statement reaches the executing state
/// (registering the dialect hook); the handle's `cancel()` fires it. Firing
/// before arming is rejected with [`GatewayError::QueryNotReady`].
#[derive(Clone)]
pub struct CancelToken {
    inner: Arc<TokenInner>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(TokenInner {
                signal: CancellationToken::new(),
                hook: Mutex::new(None),
                armed: AtomicBool::new(false),
            }),
        }
    }

    /// Mark the query as executing and register its cancel action.
    pub fn arm(&self, hook: CancelHook) {
        *self.inner.hook.lock().expect("cancel hook lock") = Some(hook);
        self.inner.armed.store(true, Ordering::Release);
    }

    pub fn is_armed(&self) -> bool {
        self.inner.armed.load(Ordering::Acquire)
    }

    /// Resolve once the token has been fired.
    pub async fn cancelled(&self) {
        self.inner.signal.cancelled().await;
    }

    pub fn is_canceled(&self) -> bool {
        self.inner.signal.is_cancelled()
    }

    fn take_hook(&self) -> Option<CancelHook> {
        self.inner.hook.lock().expect("cancel hook lock").take()
    }

    fn fire(&self) {
        self.inner.signal.cancel();
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

/// Run a token's registered cancel action and fire the signal.
pub(crate) async fn trigger_cancel(token: &CancelToken) -> Result<()> {
    if !token.is_armed() {
        return Err(GatewayError::QueryNotReady);
    }
    match token.take_hook() {
        Some(CancelHook::PgBackend { pid, pool }) => {
            sqlx::query("SELECT pg_cancel_backend($1)")
                .bind(pid)
                .execute(&pool)
                .await?;
        }
        Some(CancelHook::MySqlThread { id, pool }) => {
            sqlx::query(&format!("KILL QUERY {id}")).execute(&pool).await?;
        }
        Some(CancelHook::Abandon) | None => {}
    }
    token.fire();
    Ok(())
}

// =============================================================================
// The uniform contract
// =============================================================================

#[async_trait]
pub trait Adapter: Send + Sync {
    /// The dialect key this adapter serves, e.g. "postgresql".
    fn key(&self) -> &'static str;

    /// Connection parameters the adapter was created with.
    fn params(&self) -> &ConnectParams;

    /// Open the pool and probe the server version.
    async fn connect(&self) -> Result<VersionInfo>;

    /// Release every pooled connection.
    async fn disconnect(&self);

    /// Version info captured by the connect-time probe.
    fn version(&self) -> Option<VersionInfo>;

    async fn list_databases(&self, filter: Option<&Filter>) -> Result<Vec<String>>;
    async fn list_schemas(&self, filter: Option<&Filter>) -> Result<Vec<String>>;
    async fn list_tables(&self, schema: Option<&str>) -> Result<Vec<TableRef>>;
    async fn list_views(&self, schema: Option<&str>) -> Result<Vec<TableRef>>;
    async fn list_routines(&self, schema: Option<&str>) -> Result<Vec<RoutineInfo>>;
    async fn list_table_columns(
        &self,
        table: &str,
        schema: Option<&str>,
    ) -> Result<Vec<ColumnInfo>>;
    async fn list_table_triggers(&self, table: &str, schema: Option<&str>)
        -> Result<Vec<String>>;
    async fn list_table_indexes(&self, table: &str, schema: Option<&str>) -> Result<Vec<String>>;

    /// Names of the tables this table references through foreign keys.
    async fn get_table_references(&self, table: &str, schema: Option<&str>)
        -> Result<Vec<String>>;
    async fn get_table_keys(&self, table: &str, schema: Option<&str>) -> Result<Vec<TableKey>>;

    async fn get_table_create_script(&self, table: &str, schema: Option<&str>) -> Result<String>;
    async fn get_view_create_script(&self, view: &str, schema: Option<&str>) -> Result<String>;
    async fn get_routine_create_script(
        &self,
        routine: &str,
        routine_type: RoutineType,
        schema: Option<&str>,
    ) -> Result<String>;

    async fn truncate_all_tables(&self, schema: Option<&str>) -> Result<()>;

    /// Run a (possibly multi-statement) batch, racing against `token`, and
    /// normalize the results in source order.
    async fn execute_with_token(
        &self,
        sql: &str,
        token: &CancelToken,
    ) -> Result<Vec<QueryResult>>;

    /// Cancel the query registered on `token`.
    async fn cancel(&self, token: &CancelToken) -> Result<()> {
        trigger_cancel(token).await
    }

    /// Quote an identifier per dialect rules.
    fn wrap_identifier(&self, value: &str) -> String;

    /// A dialect-correct "first N rows" statement.
    fn query_select_top(&self, table: &str, schema: Option<&str>, limit: Option<u64>) -> String {
        let limit = limit.unwrap_or(self.params().select_top_limit);
        format!(
            "SELECT * FROM {} LIMIT {limit}",
            self.qualify(table, schema)
        )
    }

    /// Schema-qualified, quoted table name.
    fn qualify(&self, table: &str, schema: Option<&str>) -> String {
        match schema {
            Some(s) if !s.is_empty() => {
                format!("{}.{}", self.wrap_identifier(s), self.wrap_identifier(table))
            }
            _ => self.wrap_identifier(table),
        }
    }

    /// Column names in table order; feeds the script builders.
    async fn get_table_column_names(
        &self,
        table: &str,
        schema: Option<&str>,
    ) -> Result<Vec<String>> {
        Ok(self
            .list_table_columns(table, schema)
            .await?
            .into_iter()
            .map(|c| c.column_name)
            .collect())
    }

    /// `SELECT <all columns> FROM <table>;`
    async fn get_table_select_script(&self, table: &str, schema: Option<&str>) -> Result<String> {
        let columns = self.quoted_column_list(table, schema).await?;
        Ok(format!(
            "SELECT {} FROM {};",
            columns.join(", "),
            self.qualify(table, schema)
        ))
    }

    /// `INSERT INTO <table> (<columns>) VALUES (?, ...);`
    async fn get_table_insert_script(&self, table: &str, schema: Option<&str>) -> Result<String> {
        let columns = self.quoted_column_list(table, schema).await?;
        let markers = vec!["?"; columns.len()];
        Ok(format!(
            "INSERT INTO {} ({}) VALUES ({});",
            self.qualify(table, schema),
            columns.join(", "),
            markers.join(", ")
        ))
    }

    /// `UPDATE <table> SET <col>=?, ... WHERE <condition>;`
    async fn get_table_update_script(&self, table: &str, schema: Option<&str>) -> Result<String> {
        let columns = self.quoted_column_list(table, schema).await?;
        let assignments: Vec<String> = columns.iter().map(|c| format!("{c}=?")).collect();
        Ok(format!(
            "UPDATE {} SET {} WHERE {CONDITION_PLACEHOLDER};",
            self.qualify(table, schema),
            assignments.join(", ")
        ))
    }

    /// `DELETE FROM <table> WHERE <condition>;`
    async fn get_table_delete_script(&self, table: &str, schema: Option<&str>) -> Result<String> {
        Ok(format!(
            "DELETE FROM {} WHERE {CONDITION_PLACEHOLDER};",
            self.qualify(table, schema)
        ))
    }

    /// Quoted column names for script building.
    async fn quoted_column_list(&self, table: &str, schema: Option<&str>) -> Result<Vec<String>> {
        Ok(self
            .get_table_column_names(table, schema)
            .await?
            .iter()
            .map(|c| self.wrap_identifier(c))
            .collect())
    }
}

/// Build the adapter registered for the descriptor's client key.
pub fn create_adapter(params: ConnectParams) -> Result<Arc<dyn Adapter>> {
    match params.server.client.as_str() {
        "postgresql" => Ok(Arc::new(postgres::PostgresAdapter::new(
            params,
            postgres::PgFlavor::Postgres,
        ))),
        "redshift" => Ok(Arc::new(postgres::PostgresAdapter::new(
            params,
            postgres::PgFlavor::Redshift,
        ))),
        "mysql" | "mariadb" => Ok(Arc::new(mysql::MySqlAdapter::new(params))),
        "sqlite" => Ok(Arc::new(sqlite::SqliteAdapter::new(params))),
        "sqlserver" => Ok(Arc::new(sqlserver::SqlServerAdapter::new(params))),
        "cassandra" => Ok(Arc::new(cassandra::CassandraAdapter::new(params))),
        other => Err(GatewayError::validation(
            "client",
            "oneOf",
            format!("unknown client `{other}`"),
        )),
    }
}

// =============================================================================
// Shared helpers
// =============================================================================

/// Quote `value` with the given delimiters. `*` passes through, embedded
/// closing delimiters are doubled, and a trailing `[n]` array suffix stays
/// outside the quotes.
pub(crate) fn wrap_with(value: &str, open: char, close: char) -> String {
    if value == "*" {
        return value.to_string();
    }
    let (base, suffix) = split_array_suffix(value);
    let mut quoted = String::with_capacity(base.len() + 2);
    quoted.push(open);
    for c in base.chars() {
        quoted.push(c);
        if c == close {
            quoted.push(close);
        }
    }
    quoted.push(close);
    quoted.push_str(suffix);
    quoted
}

/// Split a trailing `[digits]` suffix off an identifier.
fn split_array_suffix(value: &str) -> (&str, &str) {
    if !value.ends_with(']') {
        return (value, "");
    }
    if let Some(open) = value.rfind('[') {
        let digits = &value[open + 1..value.len() - 1];
        if !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit()) {
            return (&value[..open], &value[open..]);
        }
    }
    (value, "")
}

/// Per-statement raw material collected by an adapter while draining a
/// batch.
pub(crate) struct StatementGroup {
    pub rows: Vec<crate::models::query::Row>,
    pub fields: Vec<crate::models::query::Field>,
    pub affected: Option<u64>,
}

/// Shape per-statement groups into normalized results.
///
/// Commands come from the statement identifier; a group with rows whose
/// statement identified as UNKNOWN is promoted to SELECT. Side-effecting
/// statements always yield exactly one (empty) result.
pub(crate) fn normalize_results(
    statements: &[IdentifiedStatement],
    groups: Vec<StatementGroup>,
) -> Vec<QueryResult> {
    groups
        .into_iter()
        .enumerate()
        .map(|(i, group)| {
            let kind = statements
                .get(i)
                .map(|s| s.kind)
                .unwrap_or(StatementKind::Unknown);
            let is_select = kind.returns_rows() || !group.rows.is_empty();
            let command = if kind == StatementKind::Unknown && is_select {
                "SELECT"
            } else {
                kind.as_command()
            };
            if is_select {
                QueryResult::with_rows(command, group.rows, group.fields)
            } else {
                QueryResult::for_command(command, group.affected)
            }
        })
        .collect()
}
