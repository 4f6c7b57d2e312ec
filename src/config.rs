//! Persisted configuration store.
//!
//! The gateway keeps its server definitions in a single JSON document,
//! `sqlectron.json`. The legacy dotfile location (`~/.sqlectron.json`) wins
//! when it already exists; otherwise the file lives in the platform config
//! directory under `Sqlectron/`. Reading a missing file creates the parent
//! directory and writes an empty document, so callers never observe "no
//! config".
//!
//! Async I/O is the default; `_sync` variants exist for startup paths that
//! run before the runtime. Both produce byte-identical JSON (2-space
//! indentation).

use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tracing::debug;
use uuid::Uuid;

use crate::error::Result;
use crate::models::server::Server;
use crate::servers::encrypt_server_secrets;

/// Default row cap for `get_query_select_top` when the document does not
/// override it.
pub const DEFAULT_SELECT_TOP_LIMIT: u64 = 1000;

const FILE_NAME: &str = "sqlectron.json";
const LEGACY_FILE_NAME: &str = ".sqlectron.json";

static DEFAULT_PATH: OnceLock<PathBuf> = OnceLock::new();

/// The on-disk document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigDocument {
    #[serde(default)]
    pub servers: Vec<Server>,
    /// Overrides [`DEFAULT_SELECT_TOP_LIMIT`] when set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit_query_default_select_top: Option<u64>,
    /// Fields this core does not interpret are preserved verbatim.
    #[serde(flatten)]
    pub rest: serde_json::Map<String, JsonValue>,
}

impl ConfigDocument {
    /// The effective select-top limit.
    pub fn select_top_limit(&self) -> u64 {
        self.limit_query_default_select_top
            .unwrap_or(DEFAULT_SELECT_TOP_LIMIT)
    }
}

/// Resolve the process-wide config file location, computed once.
pub fn default_path() -> &'static Path {
    DEFAULT_PATH.get_or_init(|| {
        if let Some(home) = dirs::home_dir() {
            let legacy = home.join(LEGACY_FILE_NAME);
            if legacy.exists() {
                return legacy;
            }
        }
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("Sqlectron")
            .join(FILE_NAME)
    })
}

/// Handle to one config document on disk.
///
/// All registry mutations go through a store; concurrent in-process writers
/// are serialized by the registry's lock, the file itself is last-writer-wins.
#[derive(Debug, Clone)]
pub struct ConfigStore {
    path: PathBuf,
}

impl ConfigStore {
    /// A store at the default platform location.
    pub fn at_default_location() -> Self {
        Self {
            path: default_path().to_path_buf(),
        }
    }

    /// A store at an explicit path (used heavily by tests).
    pub fn at_path(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the document, creating an empty one when the file is absent.
    pub async fn load(&self) -> Result<ConfigDocument> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(raw) => Ok(serde_json::from_str(&raw)?),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                let doc = ConfigDocument::default();
                self.save(&doc).await?;
                Ok(doc)
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Synchronous variant of [`load`](Self::load).
    pub fn load_sync(&self) -> Result<ConfigDocument> {
        match std::fs::read_to_string(&self.path) {
            Ok(raw) => Ok(serde_json::from_str(&raw)?),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                let doc = ConfigDocument::default();
                self.save_sync(&doc)?;
                Ok(doc)
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Write the document with 2-space indentation.
    pub async fn save(&self, doc: &ConfigDocument) -> Result<()> {
        let rendered = render(doc)?;
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&self.path, rendered).await?;
        debug!(path = %self.path.display(), "Saved configuration");
        Ok(())
    }

    /// Synchronous variant of [`save`](Self::save).
    pub fn save_sync(&self, doc: &ConfigDocument) -> Result<()> {
        let rendered = render(doc)?;
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&self.path, rendered)?;
        debug!(path = %self.path.display(), "Saved configuration");
        Ok(())
    }

    /// Normalize the stored servers: assign missing ids, default `ssl`, and
    /// encrypt plaintext secrets under `vault_key`.
    pub async fn prepare(&self, vault_key: &str) -> Result<ConfigDocument> {
        let mut doc = self.load().await?;
        if prepare_document(&mut doc, vault_key)? {
            self.save(&doc).await?;
        }
        Ok(doc)
    }

    /// Synchronous variant of [`prepare`](Self::prepare).
    pub fn prepare_sync(&self, vault_key: &str) -> Result<ConfigDocument> {
        let mut doc = self.load_sync()?;
        if prepare_document(&mut doc, vault_key)? {
            self.save_sync(&doc)?;
        }
        Ok(doc)
    }
}

fn render(doc: &ConfigDocument) -> Result<String> {
    // serde_json's pretty printer uses 2-space indentation.
    let mut out = serde_json::to_string_pretty(doc)?;
    out.push('\n');
    Ok(out)
}

/// Returns true when anything changed.
fn prepare_document(doc: &mut ConfigDocument, vault_key: &str) -> Result<bool> {
    let mut changed = false;
    for server in &mut doc.servers {
        if !server.has_id() {
            server.id = Some(Uuid::new_v4().to_string());
            changed = true;
        }
        if server.ssl.is_none() {
            server.ssl = Some(false);
            changed = true;
        }
        if !server.encrypted {
            encrypt_server_secrets(server, vault_key)?;
            changed = true;
        }
    }
    Ok(changed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vault;

    fn store() -> (tempfile::TempDir, ConfigStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = ConfigStore::at_path(dir.path().join("sqlectron.json"));
        (dir, store)
    }

    #[tokio::test]
    async fn test_load_creates_missing_file() {
        let (_dir, store) = store();
        let doc = store.load().await.unwrap();
        assert!(doc.servers.is_empty());
        assert!(store.path().exists());
    }

    #[test]
    fn test_sync_and_async_render_identically() {
        let dir = tempfile::tempdir().unwrap();
        let doc = ConfigDocument {
            servers: vec![Server {
                name: "a".into(),
                client: "postgresql".into(),
                host: Some("h".into()),
                port: Some(5432),
                ssl: Some(false),
                ..Default::default()
            }],
            ..Default::default()
        };

        let sync_store = ConfigStore::at_path(dir.path().join("sync.json"));
        sync_store.save_sync(&doc).unwrap();
        let sync_bytes = std::fs::read(sync_store.path()).unwrap();

        let rt = tokio::runtime::Runtime::new().unwrap();
        let async_store = ConfigStore::at_path(dir.path().join("async.json"));
        rt.block_on(async_store.save(&doc)).unwrap();
        let async_bytes = std::fs::read(async_store.path()).unwrap();

        assert_eq!(sync_bytes, async_bytes);
    }

    #[test]
    fn test_two_space_indentation() {
        let doc = ConfigDocument::default();
        let rendered = render(&doc).unwrap();
        assert!(rendered.starts_with("{\n  \"servers\""));
    }

    #[tokio::test]
    async fn test_prepare_assigns_id_and_encrypts() {
        let (_dir, store) = store();
        let doc = ConfigDocument {
            servers: vec![Server {
                name: "a".into(),
                client: "postgresql".into(),
                host: Some("h".into()),
                port: Some(5432),
                ssl: Some(false),
                password: Some("p".into()),
                ..Default::default()
            }],
            ..Default::default()
        };
        store.save(&doc).await.unwrap();

        let prepared = store.prepare("KEY").await.unwrap();
        let server = &prepared.servers[0];
        assert!(server.has_id());
        assert!(server.encrypted);
        let ciphertext = server.password.as_deref().unwrap();
        assert_ne!(ciphertext, "p");
        assert_eq!(vault::decrypt(ciphertext, "KEY").unwrap(), "p");

        // Reload sees the persisted form.
        let reloaded = store.load().await.unwrap();
        assert_eq!(reloaded.servers[0].id, server.id);
        assert!(reloaded.servers[0].encrypted);
    }

    #[tokio::test]
    async fn test_prepare_defaults_ssl() {
        let (_dir, store) = store();
        let doc = ConfigDocument {
            servers: vec![Server {
                name: "a".into(),
                client: "sqlite".into(),
                database: Some("/tmp/a.db".into()),
                ..Default::default()
            }],
            ..Default::default()
        };
        store.save(&doc).await.unwrap();

        let prepared = store.prepare("KEY").await.unwrap();
        assert_eq!(prepared.servers[0].ssl, Some(false));
    }

    #[tokio::test]
    async fn test_prepare_is_idempotent() {
        let (_dir, store) = store();
        let doc = ConfigDocument {
            servers: vec![Server {
                name: "a".into(),
                client: "postgresql".into(),
                host: Some("h".into()),
                port: Some(5432),
                ssl: Some(false),
                password: Some("p".into()),
                ..Default::default()
            }],
            ..Default::default()
        };
        store.save(&doc).await.unwrap();

        let first = store.prepare("KEY").await.unwrap();
        let second = store.prepare("KEY").await.unwrap();
        // Already-encrypted secrets must not be re-encrypted.
        assert_eq!(first.servers[0].password, second.servers[0].password);
        assert_eq!(first.servers[0].id, second.servers[0].id);
    }

    #[tokio::test]
    async fn test_unknown_fields_survive_round_trip() {
        let (_dir, store) = store();
        let raw = "{\n  \"servers\": [],\n  \"zoomFactor\": 1.5\n}\n";
        tokio::fs::write(store.path(), raw).await.unwrap();

        let doc = store.load().await.unwrap();
        store.save(&doc).await.unwrap();

        let reread = tokio::fs::read_to_string(store.path()).await.unwrap();
        assert!(reread.contains("zoomFactor"));
    }

    #[test]
    fn test_select_top_limit_default() {
        let doc = ConfigDocument::default();
        assert_eq!(doc.select_top_limit(), DEFAULT_SELECT_TOP_LIMIT);
        let doc = ConfigDocument {
            limit_query_default_select_top: Some(50),
            ..Default::default()
        };
        assert_eq!(doc.select_top_limit(), 50);
    }
}
