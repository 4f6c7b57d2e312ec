//! Cassandra adapter, over the scylla driver.
//!
//! The connected keyspace plays the role of the database. Introspection
//! dispatches on the host's reported release version: v3+ reads
//! `system_schema.*`, v2 reads the legacy `system.schema_*` tables and maps
//! the marshal validator class names back to CQL type names. Detection is
//! best-effort — an unparseable version falls back to v3 semantics.
//!
//! CQL has no batch-of-statements execution on this path and no server-side
//! cancel: multi-statement text and `cancel()` both reject.

use async_trait::async_trait;
use scylla::frame::response::result::CqlValue;
use scylla::{Session, SessionBuilder};
use serde_json::Value as JsonValue;
use tokio::sync::OnceCell;
use tracing::{debug, info};

use crate::adapters::{wrap_with, Adapter, CancelToken, ConnectParams};
use crate::error::{GatewayError, Result};
use crate::models::query::{Field, QueryResult, Row};
use crate::models::schema::{
    apply_filter, ColumnInfo, Filter, RoutineInfo, RoutineType, TableKey, TableRef,
};
use crate::statement::StatementKind;
use crate::version::{version_compare, VersionInfo};

const MARSHAL_PREFIX: &str = "org.apache.cassandra.db.marshal.";

pub struct CassandraAdapter {
    params: ConnectParams,
    state: OnceCell<(Session, VersionInfo, bool)>,
}

impl CassandraAdapter {
    pub fn new(params: ConnectParams) -> Self {
        Self {
            params,
            state: OnceCell::new(),
        }
    }

    fn session(&self) -> Result<&Session> {
        self.state
            .get()
            .map(|(session, _, _)| session)
            .ok_or_else(|| GatewayError::connect("adapter is not connected"))
    }

    /// True when the connected host speaks the pre-3.0 schema tables.
    fn uses_legacy_schema(&self) -> bool {
        self.state
            .get()
            .map(|(_, _, legacy)| *legacy)
            .unwrap_or(false)
    }

    fn keyspace(&self) -> &str {
        &self.params.database
    }

    async fn fetch(&self, cql: &str, values: impl scylla::serialize::row::SerializeRow) -> Result<Vec<scylla::frame::response::result::Row>> {
        let result = self
            .session()?
            .query(cql, values)
            .await
            .map_err(|e| GatewayError::query(e.to_string(), None))?;
        Ok(result.rows.unwrap_or_default())
    }
}

/// Map a v2 marshal validator class to the CQL type name the v3 schema
/// tables report natively.
pub fn map_validator_type(validator: &str) -> String {
    // ReversedType(X) and similar wrappers carry the interesting class
    // inside the parentheses.
    let inner = validator
        .rfind('(')
        .map(|open| {
            let end = validator.rfind(')').unwrap_or(validator.len());
            &validator[open + 1..end]
        })
        .unwrap_or(validator);
    let class = inner.strip_prefix(MARSHAL_PREFIX).unwrap_or(inner);

    match class {
        "UTF8Type" => "text",
        "AsciiType" => "ascii",
        "Int32Type" => "int",
        "LongType" => "bigint",
        "ShortType" => "smallint",
        "ByteType" => "tinyint",
        "IntegerType" => "varint",
        "BooleanType" => "boolean",
        "BytesType" => "blob",
        "DoubleType" => "double",
        "FloatType" => "float",
        "DecimalType" => "decimal",
        "TimestampType" | "DateType" => "timestamp",
        "SimpleDateType" => "date",
        "TimeType" => "time",
        "UUIDType" => "uuid",
        "TimeUUIDType" => "timeuuid",
        "InetAddressType" => "inet",
        "CounterColumnType" => "counter",
        other => return other.to_lowercase(),
    }
    .to_string()
}

fn cql_to_json(value: &CqlValue) -> JsonValue {
    match value {
        CqlValue::Ascii(s) | CqlValue::Text(s) => JsonValue::String(s.clone()),
        CqlValue::Boolean(b) => JsonValue::Bool(*b),
        CqlValue::TinyInt(v) => JsonValue::Number((*v).into()),
        CqlValue::SmallInt(v) => JsonValue::Number((*v).into()),
        CqlValue::Int(v) => JsonValue::Number((*v).into()),
        CqlValue::BigInt(v) => JsonValue::Number((*v).into()),
        CqlValue::Counter(c) => JsonValue::Number(c.0.into()),
        CqlValue::Float(v) => serde_json::Number::from_f64(*v as f64)
            .map(JsonValue::Number)
            .unwrap_or(JsonValue::Null),
        CqlValue::Double(v) => serde_json::Number::from_f64(*v)
            .map(JsonValue::Number)
            .unwrap_or(JsonValue::Null),
        CqlValue::Blob(bytes) => crate::adapters::types::encode_binary_value(bytes),
        CqlValue::Uuid(u) => JsonValue::String(u.to_string()),
        CqlValue::Timeuuid(u) => JsonValue::String(u.to_string()),
        CqlValue::Inet(addr) => JsonValue::String(addr.to_string()),
        CqlValue::Timestamp(ts) => chrono::DateTime::from_timestamp_millis(ts.0)
            .map(|dt| JsonValue::String(dt.format("%Y-%m-%d %H:%M:%S%.f").to_string()))
            .unwrap_or(JsonValue::Null),
        CqlValue::List(items) | CqlValue::Set(items) => {
            JsonValue::Array(items.iter().map(cql_to_json).collect())
        }
        CqlValue::Map(entries) => {
            let mut map = serde_json::Map::new();
            for (k, v) in entries {
                let key = match k {
                    CqlValue::Ascii(s) | CqlValue::Text(s) => s.clone(),
                    other => format!("{other:?}"),
                };
                map.insert(key, cql_to_json(v));
            }
            JsonValue::Object(map)
        }
        CqlValue::Tuple(items) => JsonValue::Array(
            items
                .iter()
                .map(|v| v.as_ref().map(cql_to_json).unwrap_or(JsonValue::Null))
                .collect(),
        ),
        CqlValue::Empty => JsonValue::Null,
        other => JsonValue::String(format!("{other:?}")),
    }
}

fn row_string(row: &scylla::frame::response::result::Row, idx: usize) -> Option<String> {
    match row.columns.get(idx)? {
        Some(CqlValue::Text(s)) | Some(CqlValue::Ascii(s)) => Some(s.clone()),
        _ => None,
    }
}

#[async_trait]
impl Adapter for CassandraAdapter {
    fn key(&self) -> &'static str {
        "cassandra"
    }

    fn params(&self) -> &ConnectParams {
        &self.params
    }

    async fn connect(&self) -> Result<VersionInfo> {
        let (_, version, _) = self
            .state
            .get_or_try_init(|| async {
                let server = &self.params.server;
                let node = format!(
                    "{}:{}",
                    server.host.as_deref().unwrap_or("127.0.0.1"),
                    server.port.unwrap_or(9042)
                );
                let mut builder = SessionBuilder::new()
                    .known_node(&node)
                    .use_keyspace(&self.params.database, false);
                if let (Some(user), Some(password)) = (&server.user, &server.password) {
                    builder = builder.user(user, password);
                }
                let session = builder
                    .build()
                    .await
                    .map_err(|e| GatewayError::connect(e.to_string()))?;

                let result = session
                    .query("SELECT release_version FROM system.local", ())
                    .await
                    .map_err(|e| GatewayError::connect(e.to_string()))?;
                let raw = result
                    .rows
                    .unwrap_or_default()
                    .first()
                    .and_then(|r| row_string(r, 0))
                    .unwrap_or_default();

                let version = VersionInfo::from_probe("Cassandra", raw);
                // Best-effort: only a cleanly parsed pre-3 version selects
                // the legacy schema tables.
                let legacy = version.version != "0"
                    && version_compare(&version.version, "3") == std::cmp::Ordering::Less;

                info!(
                    client = "cassandra",
                    version = %version.version,
                    keyspace = %self.params.database,
                    legacy_schema = legacy,
                    "Connected"
                );
                Ok::<_, GatewayError>((session, version, legacy))
            })
            .await?;
        Ok(version.clone())
    }

    async fn disconnect(&self) {
        // The driver tears its connections down on drop.
    }

    fn version(&self) -> Option<VersionInfo> {
        self.state.get().map(|(_, v, _)| v.clone())
    }

    async fn list_databases(&self, filter: Option<&Filter>) -> Result<Vec<String>> {
        let cql = if self.uses_legacy_schema() {
            "SELECT keyspace_name FROM system.schema_keyspaces"
        } else {
            "SELECT keyspace_name FROM system_schema.keyspaces"
        };
        let rows = self.fetch(cql, ()).await?;
        let mut names: Vec<String> = rows.iter().filter_map(|r| row_string(r, 0)).collect();
        names.sort();
        Ok(apply_filter(names, filter))
    }

    async fn list_schemas(&self, _filter: Option<&Filter>) -> Result<Vec<String>> {
        Ok(Vec::new())
    }

    async fn list_tables(&self, _schema: Option<&str>) -> Result<Vec<TableRef>> {
        let rows = if self.uses_legacy_schema() {
            self.fetch(
                "SELECT columnfamily_name FROM system.schema_columnfamilies WHERE keyspace_name = ?",
                (self.keyspace(),),
            )
            .await?
        } else {
            self.fetch(
                "SELECT table_name FROM system_schema.tables WHERE keyspace_name = ?",
                (self.keyspace(),),
            )
            .await?
        };
        let mut tables: Vec<TableRef> = rows
            .iter()
            .filter_map(|r| row_string(r, 0).map(TableRef::new))
            .collect();
        tables.sort_by(|a, b| a.name.cmp(&b.name));
        debug!(count = tables.len(), keyspace = %self.keyspace(), "Listed tables");
        Ok(tables)
    }

    async fn list_views(&self, _schema: Option<&str>) -> Result<Vec<TableRef>> {
        if self.uses_legacy_schema() {
            return Ok(Vec::new());
        }
        let rows = self
            .fetch(
                "SELECT view_name FROM system_schema.views WHERE keyspace_name = ?",
                (self.keyspace(),),
            )
            .await?;
        Ok(rows
            .iter()
            .filter_map(|r| row_string(r, 0).map(TableRef::new))
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
        let columns = if self.uses_legacy_schema() {
            let rows = self
                .fetch(
                    "SELECT column_name, validator FROM system.schema_columns \
                     WHERE keyspace_name = ? AND columnfamily_name = ?",
                    (self.keyspace(), table),
                )
                .await?;
            rows.iter()
                .filter_map(|r| {
                    let name = row_string(r, 0)?;
                    let validator = row_string(r, 1)?;
                    Some(ColumnInfo::new(name, map_validator_type(&validator)))
                })
                .collect()
        } else {
            let rows = self
                .fetch(
                    "SELECT column_name, type FROM system_schema.columns \
                     WHERE keyspace_name = ? AND table_name = ?",
                    (self.keyspace(), table),
                )
                .await?;
            rows.iter()
                .filter_map(|r| {
                    Some(ColumnInfo::new(row_string(r, 0)?, row_string(r, 1)?))
                })
                .collect()
        };
        Ok(columns)
    }

    async fn list_table_triggers(
        &self,
        _table: &str,
        _schema: Option<&str>,
    ) -> Result<Vec<String>> {
        Ok(Vec::new())
    }

    async fn list_table_indexes(&self, table: &str, _schema: Option<&str>) -> Result<Vec<String>> {
        if self.uses_legacy_schema() {
            return Ok(Vec::new());
        }
        let rows = self
            .fetch(
                "SELECT index_name FROM system_schema.indexes \
                 WHERE keyspace_name = ? AND table_name = ?",
                (self.keyspace(), table),
            )
            .await?;
        Ok(rows.iter().filter_map(|r| row_string(r, 0)).collect())
    }

    async fn get_table_references(
        &self,
        _table: &str,
        _schema: Option<&str>,
    ) -> Result<Vec<String>> {
        // No foreign keys in Cassandra.
        Ok(Vec::new())
    }

    async fn get_table_keys(&self, table: &str, _schema: Option<&str>) -> Result<Vec<TableKey>> {
        if self.uses_legacy_schema() {
            return Ok(Vec::new());
        }
        let rows = self
            .fetch(
                "SELECT column_name, kind FROM system_schema.columns \
                 WHERE keyspace_name = ? AND table_name = ?",
                (self.keyspace(), table),
            )
            .await?;
        Ok(rows
            .iter()
            .filter_map(|r| {
                let column_name = row_string(r, 0)?;
                let kind = row_string(r, 1)?;
                let key_type = match kind.as_str() {
                    "partition_key" => "PRIMARY KEY",
                    "clustering" => "CLUSTERING KEY",
                    _ => return None,
                };
                Some(TableKey {
                    column_name,
                    key_type: key_type.to_string(),
                    constraint_name: None,
                    referenced_table: None,
                })
            })
            .collect())
    }

    async fn get_table_create_script(
        &self,
        _table: &str,
        _schema: Option<&str>,
    ) -> Result<String> {
        Err(GatewayError::not_supported("cassandra", "table create scripts"))
    }

    async fn get_view_create_script(&self, _view: &str, _schema: Option<&str>) -> Result<String> {
        Err(GatewayError::not_supported("cassandra", "view create scripts"))
    }

    async fn get_routine_create_script(
        &self,
        _routine: &str,
        _routine_type: RoutineType,
        _schema: Option<&str>,
    ) -> Result<String> {
        Err(GatewayError::not_supported("cassandra", "stored routines"))
    }

    async fn truncate_all_tables(&self, _schema: Option<&str>) -> Result<()> {
        let tables = self.list_tables(None).await?;
        for table in &tables {
            let cql = format!(
                "TRUNCATE TABLE {}.{}",
                self.wrap_identifier(self.keyspace()),
                self.wrap_identifier(&table.name)
            );
            self.session()?
                .query(cql, ())
                .await
                .map_err(|e| GatewayError::query(e.to_string(), None))?;
        }
        debug!(count = tables.len(), "Truncated tables");
        Ok(())
    }

    async fn execute_with_token(
        &self,
        sql: &str,
        _token: &CancelToken,
    ) -> Result<Vec<QueryResult>> {
        let statements = crate::statement::identify(sql);
        if statements.is_empty() {
            return Ok(Vec::new());
        }
        if statements.len() > 1 {
            return Err(GatewayError::not_supported(
                "cassandra",
                "multi-statement batches",
            ));
        }
        let statement = &statements[0];

        let result = self
            .session()?
            .query(statement.text.clone(), ())
            .await
            .map_err(|e| GatewayError::query(e.to_string(), None).at_statement(0))?;

        let fields: Vec<Field> = result
            .col_specs
            .iter()
            .map(|spec| Field::new(spec.name.clone()))
            .collect();
        let rows: Vec<Row> = result
            .rows
            .unwrap_or_default()
            .iter()
            .map(|row| {
                fields
                    .iter()
                    .zip(row.columns.iter())
                    .map(|(field, value)| {
                        (
                            field.name.clone(),
                            value.as_ref().map(cql_to_json).unwrap_or(JsonValue::Null),
                        )
                    })
                    .collect()
            })
            .collect();

        let is_select = statement.kind.returns_rows() || !rows.is_empty();
        let command = if statement.kind == StatementKind::Unknown && is_select {
            "SELECT"
        } else {
            statement.kind.as_command()
        };
        if is_select {
            Ok(vec![QueryResult::with_rows(command, rows, fields)])
        } else {
            Ok(vec![QueryResult::for_command(command, None)])
        }
    }

    /// Cancellation is not part of the CQL protocol.
    async fn cancel(&self, _token: &CancelToken) -> Result<()> {
        Err(GatewayError::not_supported("cassandra", "query cancellation"))
    }

    fn wrap_identifier(&self, value: &str) -> String {
        wrap_with(value, '"', '"')
    }
}
