//! Server registry.
//!
//! CRUD over the persisted descriptor collection: validation, unique id
//! assignment, at-rest secret encryption, and idempotent removal. Mutations
//! from one process are serialized by an internal lock; on disk the document
//! is last-writer-wins.

use tokio::sync::Mutex;
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::ConfigStore;
use crate::error::{GatewayError, Result};
use crate::models::server::Server;
use crate::validation::validate_server;
use crate::vault;

/// Registry over one config store.
#[derive(Debug)]
pub struct ServerRegistry {
    store: ConfigStore,
    write_lock: Mutex<()>,
}

impl ServerRegistry {
    pub fn new(store: ConfigStore) -> Self {
        Self {
            store,
            write_lock: Mutex::new(()),
        }
    }

    /// Registry at the default config location.
    pub fn at_default_location() -> Self {
        Self::new(ConfigStore::at_default_location())
    }

    pub fn store(&self) -> &ConfigStore {
        &self.store
    }

    /// All stored descriptors, secrets still in ciphertext form.
    pub async fn get_all(&self) -> Result<Vec<Server>> {
        Ok(self.store.load().await?.servers)
    }

    /// Validate, assign a fresh id, encrypt secrets, persist, and return the
    /// stored form.
    pub async fn add(&self, mut server: Server, vault_key: &str) -> Result<Server> {
        validate_server(&server)?;

        let _guard = self.write_lock.lock().await;
        let mut doc = self.store.load().await?;

        server.id = Some(fresh_id(&doc.servers));
        if !server.encrypted {
            encrypt_server_secrets(&mut server, vault_key)?;
        }

        doc.servers.push(server.clone());
        self.store.save(&doc).await?;
        info!(id = %server.id.as_deref().unwrap_or(""), name = %server.name, "Added server");
        Ok(server)
    }

    /// Validate, locate by id, re-encrypt any changed secret, persist.
    ///
    /// A secret submitted unchanged (i.e. still equal to the stored
    /// ciphertext) keeps its stored bytes verbatim.
    pub async fn update(&self, mut server: Server, vault_key: &str) -> Result<Server> {
        validate_server(&server)?;
        let id = server
            .id
            .clone()
            .filter(|id| !id.is_empty())
            .ok_or_else(|| GatewayError::config("update requires a server id"))?;

        let _guard = self.write_lock.lock().await;
        let mut doc = self.store.load().await?;
        let index = doc
            .servers
            .iter()
            .position(|s| s.id.as_deref() == Some(id.as_str()))
            .ok_or_else(|| GatewayError::config(format!("no server with id `{id}`")))?;

        let existing = &doc.servers[index];
        // Only an encrypted stored value can be carried over verbatim.
        let stored_password = existing
            .password
            .as_deref()
            .filter(|_| existing.encrypted);
        server.password = carry_or_encrypt(server.password.take(), stored_password, vault_key)?;
        if let Some(ssh) = &mut server.ssh {
            let stored_ssh_password = existing
                .ssh
                .as_ref()
                .and_then(|s| s.password.as_deref())
                .filter(|_| existing.encrypted);
            ssh.password =
                carry_or_encrypt(ssh.password.take(), stored_ssh_password, vault_key)?;
        }
        server.encrypted = true;

        doc.servers[index] = server.clone();
        self.store.save(&doc).await?;
        debug!(id = %id, "Updated server");
        Ok(server)
    }

    /// Route by id presence: empty or missing id adds, otherwise updates.
    pub async fn add_or_update(&self, server: Server, vault_key: &str) -> Result<Server> {
        if server.has_id() {
            self.update(server, vault_key).await
        } else {
            self.add(server, vault_key).await
        }
    }

    /// Remove a descriptor. Removing an unknown id is not an error.
    pub async fn remove_by_id(&self, id: &str) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let mut doc = self.store.load().await?;
        let before = doc.servers.len();
        doc.servers.retain(|s| s.id.as_deref() != Some(id));
        if doc.servers.len() != before {
            self.store.save(&doc).await?;
            info!(id = %id, "Removed server");
        }
        Ok(())
    }
}

/// Generate an id no existing descriptor uses.
fn fresh_id(existing: &[Server]) -> String {
    loop {
        let id = Uuid::new_v4().to_string();
        if !existing.iter().any(|s| s.id.as_deref() == Some(id.as_str())) {
            return id;
        }
    }
}

/// Keep the stored ciphertext when the submitted value matches it, encrypt
/// otherwise.
fn carry_or_encrypt(
    submitted: Option<String>,
    stored: Option<&str>,
    vault_key: &str,
) -> Result<Option<String>> {
    match submitted {
        None => Ok(None),
        Some(value) => {
            if Some(value.as_str()) == stored {
                return Ok(Some(value));
            }
            Ok(Some(vault::encrypt(&value, vault_key)?))
        }
    }
}

/// Encrypt plaintext secrets in place and mark the descriptor encrypted.
pub fn encrypt_server_secrets(server: &mut Server, vault_key: &str) -> Result<()> {
    if let Some(password) = &server.password {
        server.password = Some(vault::encrypt(password, vault_key)?);
    }
    if let Some(ssh) = &mut server.ssh {
        if let Some(password) = &ssh.password {
            ssh.password = Some(vault::encrypt(password, vault_key)?);
        }
    }
    server.encrypted = true;
    Ok(())
}

/// Return a copy with plaintext secrets. A descriptor with `encrypted=false`
/// is returned unchanged.
pub fn decrypt_secrets(server: &Server, vault_key: &str) -> Result<Server> {
    if !server.encrypted {
        return Ok(server.clone());
    }
    let mut out = server.clone();
    if let Some(password) = &out.password {
        out.password = Some(vault::decrypt(password, vault_key)?);
    }
    if let Some(ssh) = &mut out.ssh {
        if let Some(password) = &ssh.password {
            ssh.password = Some(vault::decrypt(password, vault_key)?);
        }
    }
    out.encrypted = false;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::server::SshConfig;

    fn registry() -> (tempfile::TempDir, ServerRegistry) {
        let dir = tempfile::tempdir().unwrap();
        let store = ConfigStore::at_path(dir.path().join("sqlectron.json"));
        (dir, ServerRegistry::new(store))
    }

    fn descriptor() -> Server {
        Server {
            name: "local pg".into(),
            client: "postgresql".into(),
            host: Some("127.0.0.1".into()),
            port: Some(5432),
            user: Some("postgres".into()),
            password: Some("hunter2".into()),
            ssl: Some(false),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_add_assigns_id_and_encrypts() {
        let (_dir, registry) = registry();
        let stored = registry.add(descriptor(), "KEY").await.unwrap();

        assert!(stored.has_id());
        assert!(stored.encrypted);
        assert_ne!(stored.password.as_deref(), Some("hunter2"));

        let all = registry.get_all().await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].id, stored.id);
    }

    #[tokio::test]
    async fn test_add_then_decrypt_round_trips() {
        let (_dir, registry) = registry();
        let submitted = descriptor();
        let stored = registry.add(submitted.clone(), "KEY").await.unwrap();

        let plain = decrypt_secrets(&stored, "KEY").unwrap();
        assert_eq!(plain.password.as_deref(), Some("hunter2"));
        assert!(!plain.encrypted);

        // Equal to the submitted descriptor except for the assigned id.
        let mut expected = submitted;
        expected.id = stored.id.clone();
        assert_eq!(plain, expected);
    }

    #[tokio::test]
    async fn test_add_rejects_invalid_descriptor() {
        let (_dir, registry) = registry();
        let mut bad = descriptor();
        bad.client = "nope".into();
        let err = registry.add(bad, "KEY").await.unwrap_err();
        assert!(matches!(err, GatewayError::Validation { .. }));
        assert!(registry.get_all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_update_keeps_unchanged_ciphertext() {
        let (_dir, registry) = registry();
        let stored = registry.add(descriptor(), "KEY").await.unwrap();
        let original_ciphertext = stored.password.clone();

        // Resubmit with the ciphertext untouched, as an editing UI would.
        let mut edited = stored.clone();
        edited.name = "renamed".into();
        let updated = registry.update(edited, "KEY").await.unwrap();

        assert_eq!(updated.password, original_ciphertext);
        assert_eq!(updated.name, "renamed");
    }

    #[tokio::test]
    async fn test_update_re_encrypts_changed_password() {
        let (_dir, registry) = registry();
        let stored = registry.add(descriptor(), "KEY").await.unwrap();

        let mut edited = stored.clone();
        edited.password = Some("new-password".into());
        let updated = registry.update(edited, "KEY").await.unwrap();

        assert_ne!(updated.password, stored.password);
        let plain = decrypt_secrets(&updated, "KEY").unwrap();
        assert_eq!(plain.password.as_deref(), Some("new-password"));
    }

    #[tokio::test]
    async fn test_update_unknown_id_fails() {
        let (_dir, registry) = registry();
        let mut server = descriptor();
        server.id = Some("missing".into());
        assert!(registry.update(server, "KEY").await.is_err());
    }

    #[tokio::test]
    async fn test_add_or_update_routes_by_id() {
        let (_dir, registry) = registry();
        let added = registry.add_or_update(descriptor(), "KEY").await.unwrap();
        assert_eq!(registry.get_all().await.unwrap().len(), 1);

        let mut edited = added.clone();
        edited.name = "other".into();
        registry.add_or_update(edited, "KEY").await.unwrap();
        let all = registry.get_all().await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].name, "other");
    }

    #[tokio::test]
    async fn test_remove_by_id_restores_previous_state() {
        let (_dir, registry) = registry();
        registry.add(descriptor(), "KEY").await.unwrap();
        let before = registry.get_all().await.unwrap();

        let extra = registry.add(descriptor(), "KEY").await.unwrap();
        registry
            .remove_by_id(extra.id.as_deref().unwrap())
            .await
            .unwrap();

        assert_eq!(registry.get_all().await.unwrap(), before);
    }

    #[tokio::test]
    async fn test_remove_unknown_id_is_idempotent() {
        let (_dir, registry) = registry();
        registry.add(descriptor(), "KEY").await.unwrap();
        registry.remove_by_id("does-not-exist").await.unwrap();
        assert_eq!(registry.get_all().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_ssh_password_encrypted_too() {
        let (_dir, registry) = registry();
        let mut server = descriptor();
        server.ssh = Some(SshConfig {
            host: "bastion".into(),
            port: 22,
            user: "deploy".into(),
            password: Some("ssh-secret".into()),
            private_key: None,
            passphrase: None,
            use_passphrase: false,
        });

        let stored = registry.add(server, "KEY").await.unwrap();
        let ssh = stored.ssh.as_ref().unwrap();
        assert_ne!(ssh.password.as_deref(), Some("ssh-secret"));

        let plain = decrypt_secrets(&stored, "KEY").unwrap();
        assert_eq!(
            plain.ssh.as_ref().unwrap().password.as_deref(),
            Some("ssh-secret")
        );
    }

    #[test]
    fn test_decrypt_secrets_noop_when_not_encrypted() {
        let server = descriptor();
        let out = decrypt_secrets(&server, "KEY").unwrap();
        assert_eq!(out, server);
    }
}
