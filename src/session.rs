//! Sessions and the gateway facade.
//!
//! [`create_server`] turns a (decryptable) server descriptor into a
//! [`Session`] without touching the network. A session hands out one
//! [`Connection`] per database; connecting starts the SSH tunnel when the
//! descriptor carries an `ssh` block, rewrites the effective address to the
//! tunnel's loopback endpoint, opens the adapter pool, and probes the server
//! version. Everything is torn down by [`Session::end`].

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};

use tokio::sync::{OnceCell, RwLock};
use tracing::{error, info, warn};

use crate::adapters::{create_adapter, Adapter, CancelToken, ConnectParams};
use crate::config::DEFAULT_SELECT_TOP_LIMIT;
use crate::error::{GatewayError, Result};
use crate::models::query::{QueryOutcome, QueryResult};
use crate::models::schema::{ColumnInfo, Filter, RoutineInfo, RoutineType, TableKey, TableRef};
use crate::models::server::{Client, Server};
use crate::servers::decrypt_secrets;
use crate::tunnel::SshTunnel;
use crate::version::VersionInfo;

/// Observable lifecycle of one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Idle,
    Connecting,
    Open,
    Closed,
}

/// Validate the descriptor's dialect and build a session for it.
///
/// No network I/O happens here; connections are opened on demand. An
/// `encrypted` descriptor is accepted — the vault key goes to
/// [`Session::create_connection`].
pub fn create_server(server: Server) -> Result<Session> {
    create_server_with_limit(server, DEFAULT_SELECT_TOP_LIMIT)
}

/// [`create_server`] with an explicit select-top default, usually the
/// config document's `limitQueryDefaultSelectTop`.
pub fn create_server_with_limit(server: Server, select_top_limit: u64) -> Result<Session> {
    if Client::find(&server.client).is_none() {
        return Err(GatewayError::validation(
            "client",
            "oneOf",
            format!("unknown client `{}`", server.client),
        ));
    }
    Ok(Session {
        inner: Arc::new(SessionInner {
            server,
            select_top_limit,
            plain: StdMutex::new(None),
            tunnel: TunnelState {
                endpoint: OnceCell::new(),
                handle: StdMutex::new(None),
            },
            connections: RwLock::new(HashMap::new()),
        }),
    })
}

struct TunnelState {
    /// Effective (host, port) once the tunnel is up.
    endpoint: OnceCell<(String, u16)>,
    handle: StdMutex<Option<SshTunnel>>,
}

struct SessionInner {
    server: Server,
    select_top_limit: u64,
    /// Descriptor with plaintext secrets, decrypted once.
    plain: StdMutex<Option<Server>>,
    tunnel: TunnelState,
    connections: RwLock<HashMap<String, Arc<Connection>>>,
}

impl SessionInner {
    fn plaintext_server(&self, vault_key: Option<&str>) -> Result<Server> {
        let mut plain = self.plain.lock().expect("plain descriptor lock");
        if let Some(server) = &*plain {
            return Ok(server.clone());
        }
        let server = if self.server.encrypted {
            let key = vault_key.ok_or_else(|| {
                GatewayError::auth("descriptor is encrypted and no vault key was provided")
            })?;
            decrypt_secrets(&self.server, key)?
        } else {
            self.server.clone()
        };
        *plain = Some(server.clone());
        Ok(server)
    }

    /// Start the tunnel once and return the effective address, or the
    /// descriptor's own address when no `ssh` block is present.
    async fn effective_address(
        self: &Arc<Self>,
        server: &Server,
    ) -> Result<(Option<String>, Option<u16>)> {
        let ssh = match &server.ssh {
            Some(ssh) => ssh.clone(),
            None => return Ok((server.host.clone(), server.port)),
        };

        let dst_host = server.host.clone().unwrap_or_else(|| "127.0.0.1".into());
        let dst_port = server.port.unwrap_or(0);
        let endpoint = self
            .tunnel
            .endpoint
            .get_or_try_init(|| async {
                let mut tunnel = SshTunnel::open(&ssh, &dst_host, dst_port).await?;
                let local = (tunnel.local_host().to_string(), tunnel.local_port());

                // Tunnel errors are terminal for the whole session.
                if let Some(mut errors) = tunnel.take_errors() {
                    let session = Arc::downgrade(self);
                    tokio::spawn(async move {
                        if let Some(err) = errors.recv().await {
                            error!(error = %err, "SSH tunnel failed; closing session connections");
                            if let Some(session) = session.upgrade() {
                                session.close_connections().await;
                            }
                        }
                    });
                }

                *self.tunnel.handle.lock().expect("tunnel handle lock") = Some(tunnel);
                Ok::<_, GatewayError>(local)
            })
            .await?;
        Ok((Some(endpoint.0.clone()), Some(endpoint.1)))
    }

    async fn close_connections(&self) {
        let connections: Vec<Arc<Connection>> = {
            let mut map = self.connections.write().await;
            map.drain().map(|(_, c)| c).collect()
        };
        for connection in connections {
            connection.disconnect().await;
        }
    }
}

/// Lifecycle container for every connection to one server descriptor.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("server", &self.inner.server.name)
            .finish()
    }
}

impl Session {
    /// The descriptor this session was created from (secrets as given).
    pub fn server(&self) -> &Server {
        &self.inner.server
    }

    /// The already-created connection for `database`, if any.
    pub async fn db(&self, database: &str) -> Option<Arc<Connection>> {
        self.inner.connections.read().await.get(database).cloned()
    }

    /// Get or build the connection for `database` (the descriptor's default
    /// when `None`), connecting it on first use.
    ///
    /// `vault_key` is required the first time when the descriptor is
    /// encrypted.
    pub async fn create_connection(
        &self,
        database: Option<&str>,
        vault_key: Option<&str>,
    ) -> Result<Arc<Connection>> {
        let server = self.inner.plaintext_server(vault_key)?;
        let name = database
            .map(str::to_string)
            .unwrap_or_else(|| server.default_database());

        if let Some(existing) = self.db(&name).await {
            existing.connect().await?;
            return Ok(existing);
        }

        let connection = Arc::new(Connection {
            session: self.inner.clone(),
            server,
            database: name.clone(),
            adapter: OnceCell::new(),
            status: StdMutex::new(ConnectionStatus::Idle),
        });
        {
            let mut map = self.inner.connections.write().await;
            // A racing creator may have inserted first; keep theirs.
            if let Some(existing) = map.get(&name) {
                let existing = existing.clone();
                drop(map);
                existing.connect().await?;
                return Ok(existing);
            }
            map.insert(name.clone(), connection.clone());
        }

        connection.connect().await?;
        Ok(connection)
    }

    /// Disconnect every connection and close the tunnel.
    pub async fn end(&self) {
        self.inner.close_connections().await;
        if let Some(tunnel) = self
            .inner
            .tunnel
            .handle
            .lock()
            .expect("tunnel handle lock")
            .take()
        {
            tunnel.close();
        }
        info!(server = %self.inner.server.name, "Session ended");
    }
}

/// One pooled connection to a (server, database) pair.
pub struct Connection {
    session: Arc<SessionInner>,
    /// Plaintext descriptor.
    server: Server,
    database: String,
    adapter: OnceCell<Arc<dyn Adapter>>,
    status: StdMutex<ConnectionStatus>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("database", &self.database)
            .field("status", &self.status())
            .finish()
    }
}

impl Connection {
    pub fn database(&self) -> &str {
        &self.database
    }

    pub fn status(&self) -> ConnectionStatus {
        *self.status.lock().expect("status lock")
    }

    fn set_status(&self, status: ConnectionStatus) {
        *self.status.lock().expect("status lock") = status;
    }

    fn adapter(&self) -> Result<&Arc<dyn Adapter>> {
        self.adapter
            .get()
            .ok_or_else(|| GatewayError::connect("connection is not open; call connect() first"))
    }

    /// Open the connection: tunnel (if configured), adapter pool, version
    /// probe. Safe to call concurrently; later calls join the first.
    pub async fn connect(&self) -> Result<VersionInfo> {
        self.set_status(ConnectionStatus::Connecting);
        let result = async {
            let adapter = self
                .adapter
                .get_or_try_init(|| async {
                    let (host, port) =
                        self.session.effective_address(&self.server).await?;
                    let mut effective = self.server.clone();
                    effective.host = host;
                    effective.port = port;
                    create_adapter(ConnectParams {
                        server: effective,
                        database: self.database.clone(),
                        select_top_limit: self.session.select_top_limit,
                    })
                })
                .await?;
            adapter.connect().await
        }
        .await;

        match &result {
            Ok(_) => self.set_status(ConnectionStatus::Open),
            Err(err) => {
                warn!(database = %self.database, error = %err, "Connect failed");
                self.set_status(ConnectionStatus::Idle);
            }
        }
        result
    }

    /// Release the pool. The connection can be reopened with `connect()`.
    pub async fn disconnect(&self) {
        if let Some(adapter) = self.adapter.get() {
            adapter.disconnect().await;
        }
        self.set_status(ConnectionStatus::Closed);
    }

    /// Version info captured by the connect-time probe.
    pub fn version(&self) -> Option<VersionInfo> {
        self.adapter.get().and_then(|a| a.version())
    }

    /// Build a cancelable handle for `sql` without starting it.
    pub fn query(&self, sql: impl Into<String>) -> Result<QueryOperation> {
        Ok(QueryOperation {
            text: sql.into(),
            adapter: self.adapter()?.clone(),
            token: CancelToken::new(),
            outcome: Arc::new(StdMutex::new(QueryOutcome::Pending)),
        })
    }

    /// Run a batch to completion without exposing a cancel handle.
    pub async fn execute_query(&self, sql: &str) -> Result<Vec<QueryResult>> {
        self.adapter()?
            .execute_with_token(sql, &CancelToken::new())
            .await
    }

    fn schema_arg<'a>(&'a self, schema: Option<&'a str>) -> Option<&'a str> {
        schema.or(self.server.schema.as_deref())
    }

    pub async fn list_databases(&self, filter: Option<&Filter>) -> Result<Vec<String>> {
        self.adapter()?.list_databases(filter).await
    }

    pub async fn list_schemas(&self, filter: Option<&Filter>) -> Result<Vec<String>> {
        self.adapter()?.list_schemas(filter).await
    }

    pub async fn list_tables(&self, schema: Option<&str>) -> Result<Vec<TableRef>> {
        self.adapter()?.list_tables(self.schema_arg(schema)).await
    }

    pub async fn list_views(&self, schema: Option<&str>) -> Result<Vec<TableRef>> {
        self.adapter()?.list_views(self.schema_arg(schema)).await
    }

    pub async fn list_routines(&self, schema: Option<&str>) -> Result<Vec<RoutineInfo>> {
        self.adapter()?.list_routines(self.schema_arg(schema)).await
    }

    pub async fn list_table_columns(
        &self,
        table: &str,
        schema: Option<&str>,
    ) -> Result<Vec<ColumnInfo>> {
        self.adapter()?
            .list_table_columns(table, self.schema_arg(schema))
            .await
    }

    pub async fn list_table_triggers(
        &self,
        table: &str,
        schema: Option<&str>,
    ) -> Result<Vec<String>> {
        self.adapter()?
            .list_table_triggers(table, self.schema_arg(schema))
            .await
    }

    pub async fn list_table_indexes(
        &self,
        table: &str,
        schema: Option<&str>,
    ) -> Result<Vec<String>> {
        self.adapter()?
            .list_table_indexes(table, self.schema_arg(schema))
            .await
    }

    pub async fn get_table_references(
        &self,
        table: &str,
        schema: Option<&str>,
    ) -> Result<Vec<String>> {
        self.adapter()?
            .get_table_references(table, self.schema_arg(schema))
            .await
    }

    pub async fn get_table_keys(
        &self,
        table: &str,
        schema: Option<&str>,
    ) -> Result<Vec<TableKey>> {
        self.adapter()?
            .get_table_keys(table, self.schema_arg(schema))
            .await
    }

    pub async fn get_table_create_script(
        &self,
        table: &str,
        schema: Option<&str>,
    ) -> Result<String> {
        self.adapter()?
            .get_table_create_script(table, self.schema_arg(schema))
            .await
    }

    pub async fn get_view_create_script(
        &self,
        view: &str,
        schema: Option<&str>,
    ) -> Result<String> {
        self.adapter()?
            .get_view_create_script(view, self.schema_arg(schema))
            .await
    }

    pub async fn get_routine_create_script(
        &self,
        routine: &str,
        routine_type: RoutineType,
        schema: Option<&str>,
    ) -> Result<String> {
        self.adapter()?
            .get_routine_create_script(routine, routine_type, self.schema_arg(schema))
            .await
    }

    pub fn get_query_select_top(
        &self,
        table: &str,
        schema: Option<&str>,
        limit: Option<u64>,
    ) -> Result<String> {
        Ok(self
            .adapter()?
            .query_select_top(table, self.schema_arg(schema), limit))
    }

    pub async fn get_table_select_script(
        &self,
        table: &str,
        schema: Option<&str>,
    ) -> Result<String> {
        self.adapter()?
            .get_table_select_script(table, self.schema_arg(schema))
            .await
    }

    pub async fn get_table_insert_script(
        &self,
        table: &str,
        schema: Option<&str>,
    ) -> Result<String> {
        self.adapter()?
            .get_table_insert_script(table, self.schema_arg(schema))
            .await
    }

    pub async fn get_table_update_script(
        &self,
        table: &str,
        schema: Option<&str>,
    ) -> Result<String> {
        self.adapter()?
            .get_table_update_script(table, self.schema_arg(schema))
            .await
    }

    pub async fn get_table_delete_script(
        &self,
        table: &str,
        schema: Option<&str>,
    ) -> Result<String> {
        self.adapter()?
            .get_table_delete_script(table, self.schema_arg(schema))
            .await
    }

    pub async fn truncate_all_tables(&self, schema: Option<&str>) -> Result<()> {
        self.adapter()?
            .truncate_all_tables(self.schema_arg(schema))
            .await
    }

    pub fn wrap_identifier(&self, value: &str) -> Result<String> {
        Ok(self.adapter()?.wrap_identifier(value))
    }
}

/// A query handle: run it with [`execute`](QueryOperation::execute), abort it
/// from another task with [`cancel`](QueryOperation::cancel).
pub struct QueryOperation {
    text: String,
    adapter: Arc<dyn Adapter>,
    token: CancelToken,
    outcome: Arc<StdMutex<QueryOutcome>>,
}

impl QueryOperation {
    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn outcome(&self) -> QueryOutcome {
        *self.outcome.lock().expect("outcome lock")
    }

    fn set_outcome(&self, outcome: QueryOutcome) {
        *self.outcome.lock().expect("outcome lock") = outcome;
    }

    /// Run the batch. Resolves with the canceled error when `cancel()` won
    /// the race.
    pub async fn execute(&self) -> Result<Vec<QueryResult>> {
        self.set_outcome(QueryOutcome::Running);
        let result = self.adapter.execute_with_token(&self.text, &self.token).await;
        self.set_outcome(match &result {
            Ok(_) => QueryOutcome::Done,
            Err(err) if err.is_canceled() => QueryOutcome::Canceled,
            Err(_) => QueryOutcome::Failed,
        });
        result
    }

    /// Cancel the running query. Legal only once execution has started;
    /// earlier calls report [`GatewayError::QueryNotReady`].
    pub async fn cancel(&self) -> Result<()> {
        self.adapter.cancel(&self.token).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sqlite_server() -> Server {
        Server {
            name: "memory".into(),
            client: "sqlite".into(),
            database: Some(":memory:".into()),
            ..Default::default()
        }
    }

    #[test]
    fn test_create_server_rejects_unknown_client() {
        let server = Server {
            name: "x".into(),
            client: "oracle".into(),
            ..Default::default()
        };
        let err = create_server(server).unwrap_err();
        assert!(matches!(err, GatewayError::Validation { .. }));
    }

    #[test]
    fn test_create_server_does_no_io() {
        // A bogus host must not fail until a connection is opened.
        let server = Server {
            name: "x".into(),
            client: "postgresql".into(),
            host: Some("nonexistent.invalid".into()),
            port: Some(5432),
            ssl: Some(false),
            ..Default::default()
        };
        assert!(create_server(server).is_ok());
    }

    #[tokio::test]
    async fn test_db_returns_none_before_create() {
        let session = create_server(sqlite_server()).unwrap();
        assert!(session.db("anything").await.is_none());
    }

    #[tokio::test]
    async fn test_create_connection_memoizes() {
        let session = create_server(sqlite_server()).unwrap();
        let first = session.create_connection(None, None).await.unwrap();
        assert_eq!(first.status(), ConnectionStatus::Open);
        assert_eq!(first.database(), ":memory:");

        let second = session.create_connection(None, None).await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));

        let looked_up = session.db(":memory:").await.unwrap();
        assert!(Arc::ptr_eq(&first, &looked_up));
        session.end().await;
    }

    #[tokio::test]
    async fn test_connection_version_probe() {
        let session = create_server(sqlite_server()).unwrap();
        let conn = session.create_connection(None, None).await.unwrap();
        let version = conn.version().unwrap();
        assert_eq!(version.name, "SQLite");
        session.end().await;
    }

    #[tokio::test]
    async fn test_end_closes_connections() {
        let session = create_server(sqlite_server()).unwrap();
        let conn = session.create_connection(None, None).await.unwrap();
        session.end().await;
        assert_eq!(conn.status(), ConnectionStatus::Closed);
        assert!(session.db(":memory:").await.is_none());
    }

    #[tokio::test]
    async fn test_encrypted_descriptor_requires_key() {
        let mut server = sqlite_server();
        server.encrypted = true;
        let session = create_server(server).unwrap();
        let err = session.create_connection(None, None).await.unwrap_err();
        assert!(matches!(err, GatewayError::Auth { .. }));
    }

    #[tokio::test]
    async fn test_query_operation_lifecycle() {
        let session = create_server(sqlite_server()).unwrap();
        let conn = session.create_connection(None, None).await.unwrap();
        conn.execute_query("CREATE TABLE t (x INTEGER)").await.unwrap();

        let op = conn.query("SELECT * FROM t").unwrap();
        assert_eq!(op.outcome(), QueryOutcome::Pending);

        // Canceling before execution is rejected.
        let err = op.cancel().await.unwrap_err();
        assert!(matches!(err, GatewayError::QueryNotReady));

        let results = op.execute().await.unwrap();
        assert_eq!(op.outcome(), QueryOutcome::Done);
        assert_eq!(results.len(), 1);
        session.end().await;
    }

    #[tokio::test]
    async fn test_script_builders_through_connection() {
        let session = create_server(sqlite_server()).unwrap();
        let conn = session.create_connection(None, None).await.unwrap();
        conn.execute_query("CREATE TABLE users (id INTEGER, name TEXT)")
            .await
            .unwrap();

        let select = conn.get_table_select_script("users", None).await.unwrap();
        assert_eq!(select, "SELECT \"id\", \"name\" FROM \"users\";");

        let insert = conn.get_table_insert_script("users", None).await.unwrap();
        assert_eq!(
            insert,
            "INSERT INTO \"users\" (\"id\", \"name\") VALUES (?, ?);"
        );

        let update = conn.get_table_update_script("users", None).await.unwrap();
        assert_eq!(
            update,
            "UPDATE \"users\" SET \"id\"=?, \"name\"=? WHERE <condition>;"
        );

        let delete = conn.get_table_delete_script("users", None).await.unwrap();
        assert_eq!(delete, "DELETE FROM \"users\" WHERE <condition>;");
        session.end().await;
    }
}
