//! Unified database access gateway.
//!
//! One dialect-agnostic API over PostgreSQL, MySQL/MariaDB, Microsoft SQL
//! Server, SQLite, Cassandra and Redshift: introspection, query execution
//! with cancellation, SSH tunneling, and a persisted server registry with
//! at-rest secret encryption.
//!
//! ```no_run
//! use sqlectron_core::models::Server;
//! use sqlectron_core::session::create_server;
//!
//! # async fn run() -> sqlectron_core::error::Result<()> {
//! let descriptor = Server {
//!     name: "local".into(),
//!     client: "postgresql".into(),
//!     host: Some("127.0.0.1".into()),
//!     port: Some(5432),
//!     user: Some("postgres".into()),
//!     ssl: Some(false),
//!     ..Default::default()
//! };
//! let session = create_server(descriptor)?;
//! let conn = session.create_connection(None, None).await?;
//! let tables = conn.list_tables(None).await?;
//! let results = conn.execute_query("SELECT 1 AS one").await?;
//! session.end().await;
//! # let _ = (tables, results);
//! # Ok(())
//! # }
//! ```

pub mod adapters;
pub mod config;
pub mod error;
pub mod models;
pub mod servers;
pub mod session;
pub mod statement;
pub mod tunnel;
pub mod validation;
pub mod vault;
pub mod version;

pub use config::{ConfigDocument, ConfigStore};
pub use error::{GatewayError, Result, CANCELED_BY_USER};
pub use models::{QueryResult, Server, CLIENTS};
pub use servers::{decrypt_secrets, ServerRegistry};
pub use session::{create_server, Connection, QueryOperation, Session};
pub use statement::{identify, IdentifiedStatement, StatementKind};
pub use version::{version_compare, VersionInfo};
