//! Data models shared across the gateway.

pub mod query;
pub mod schema;
pub mod server;

pub use query::{Field, QueryOutcome, QueryResult, Row};
pub use schema::{apply_filter, ColumnInfo, Filter, RoutineInfo, RoutineType, TableKey, TableRef};
pub use server::{Client, Server, SshConfig, CLIENTS};
