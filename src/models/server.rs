//! Server descriptor and dialect metadata.
//!
//! A [`Server`] is the persisted description of one database endpoint: which
//! dialect speaks to it, how to reach it (host/port or a local socket), the
//! credentials, and an optional SSH hop. Descriptors round-trip through the
//! registry as JSON with camelCase keys.

use serde::{Deserialize, Serialize};

/// Metadata for one supported dialect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Client {
    /// Registry key, e.g. "postgresql".
    pub key: &'static str,
    /// Human-readable name.
    pub name: &'static str,
    /// Database/keyspace used when a descriptor does not name one.
    pub default_database: &'static str,
    /// Feature switches; `server:<field>` entries prune descriptor fields
    /// from validation, the rest gate adapter operations.
    pub disabled_features: &'static [&'static str],
}

/// All dialects the gateway can speak, keyed by `client` in a descriptor.
pub const CLIENTS: &[Client] = &[
    Client {
        key: "mysql",
        name: "MySQL",
        default_database: "mysql",
        disabled_features: &["server:schema"],
    },
    Client {
        key: "mariadb",
        name: "MariaDB",
        default_database: "mysql",
        disabled_features: &["server:schema"],
    },
    Client {
        key: "postgresql",
        name: "PostgreSQL",
        default_database: "postgres",
        disabled_features: &[],
    },
    Client {
        key: "redshift",
        name: "Redshift",
        default_database: "postgres",
        disabled_features: &["server:socketPath", "listTableTriggers"],
    },
    Client {
        key: "sqlserver",
        name: "Microsoft SQL Server",
        default_database: "master",
        disabled_features: &["server:socketPath"],
    },
    Client {
        key: "sqlite",
        name: "SQLite",
        default_database: ":memory:",
        disabled_features: &[
            "server:ssl",
            "server:host",
            "server:port",
            "server:socketPath",
            "server:user",
            "server:password",
            "server:schema",
            "server:ssh",
        ],
    },
    Client {
        key: "cassandra",
        name: "Cassandra",
        default_database: "system",
        disabled_features: &[
            "server:schema",
            "server:socketPath",
            "cancelQuery",
            "scriptCreateTable",
            "listTableTriggers",
            "listRoutines",
        ],
    },
];

impl Client {
    /// Look up a dialect by key.
    pub fn find(key: &str) -> Option<&'static Client> {
        CLIENTS.iter().find(|c| c.key == key)
    }

    /// True when `feature` appears in this dialect's disabled list.
    pub fn is_disabled(&self, feature: &str) -> bool {
        self.disabled_features.contains(&feature)
    }
}

/// SSH hop configuration for tunneled connections.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SshConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    /// Path to a private key file; alternative to `password`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub passphrase: Option<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub use_passphrase: bool,
}

impl std::fmt::Debug for SshConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SshConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| "****"))
            .field("private_key", &self.private_key)
            .field("use_passphrase", &self.use_passphrase)
            .finish()
    }
}

/// A persisted server definition.
#[derive(Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct Server {
    /// Assigned by the registry on add; never mutated afterwards.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub name: String,
    /// One of the [`CLIENTS`] keys.
    pub client: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    /// Unix-socket alternative to host/port.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub socket_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    /// Required by validation; `prepare` fills in `false` when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssl: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssh: Option<SshConfig>,
    /// When true, `password` and `ssh.password` hold vault ciphertext.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub encrypted: bool,
}

impl Server {
    /// The dialect metadata for this descriptor, if the key is registered.
    pub fn client_spec(&self) -> Option<&'static Client> {
        Client::find(&self.client)
    }

    /// True when the descriptor has a non-empty id.
    pub fn has_id(&self) -> bool {
        self.id.as_deref().is_some_and(|id| !id.is_empty())
    }

    /// Database to connect to when none is requested explicitly.
    pub fn default_database(&self) -> String {
        self.database.clone().unwrap_or_else(|| {
            self.client_spec()
                .map(|c| c.default_database.to_string())
                .unwrap_or_default()
        })
    }
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("client", &self.client)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("socket_path", &self.socket_path)
            .field("database", &self.database)
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| "****"))
            .field("ssl", &self.ssl)
            .field("ssh", &self.ssh)
            .field("encrypted", &self.encrypted)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_lookup() {
        assert_eq!(Client::find("postgresql").unwrap().name, "PostgreSQL");
        assert_eq!(Client::find("mariadb").unwrap().default_database, "mysql");
        assert!(Client::find("oracle").is_none());
    }

    #[test]
    fn test_disabled_features() {
        let cassandra = Client::find("cassandra").unwrap();
        assert!(cassandra.is_disabled("cancelQuery"));
        assert!(!cassandra.is_disabled("server:host"));

        let sqlite = Client::find("sqlite").unwrap();
        assert!(sqlite.is_disabled("server:host"));
        assert!(sqlite.is_disabled("server:ssh"));
    }

    #[test]
    fn test_every_client_key_is_unique() {
        for (i, a) in CLIENTS.iter().enumerate() {
            for b in &CLIENTS[i + 1..] {
                assert_ne!(a.key, b.key);
            }
        }
    }

    #[test]
    fn test_descriptor_json_round_trip() {
        let json = r#"{
            "id": "abc",
            "name": "local",
            "client": "postgresql",
            "host": "127.0.0.1",
            "port": 5432,
            "user": "u",
            "password": "p",
            "ssl": false,
            "ssh": { "host": "bastion", "port": 22, "user": "deploy", "password": "s" }
        }"#;
        let server: Server = serde_json::from_str(json).unwrap();
        assert_eq!(server.client, "postgresql");
        assert_eq!(server.port, Some(5432));
        assert_eq!(server.ssh.as_ref().unwrap().host, "bastion");

        let out = serde_json::to_string(&server).unwrap();
        let back: Server = serde_json::from_str(&out).unwrap();
        assert_eq!(server, back);
    }

    #[test]
    fn test_socket_path_uses_camel_case() {
        let server = Server {
            name: "s".into(),
            client: "mysql".into(),
            socket_path: Some("/tmp/mysql.sock".into()),
            ssl: Some(false),
            ..Default::default()
        };
        let json = serde_json::to_string(&server).unwrap();
        assert!(json.contains("\"socketPath\""));
    }

    #[test]
    fn test_debug_masks_password() {
        let server = Server {
            name: "s".into(),
            client: "mysql".into(),
            password: Some("topsecret".into()),
            ..Default::default()
        };
        let dump = format!("{server:?}");
        assert!(!dump.contains("topsecret"));
    }

    #[test]
    fn test_default_database_falls_back_to_client() {
        let server = Server {
            name: "s".into(),
            client: "postgresql".into(),
            ..Default::default()
        };
        assert_eq!(server.default_database(), "postgres");
    }
}
