//! Integration tests for the config store and server registry.
//!
//! Exercises the full persistence path against a throwaway config file:
//! prepare round-trips, id assignment, secret encryption, and registry CRUD.

use sqlectron_core::config::{ConfigDocument, ConfigStore};
use sqlectron_core::models::Server;
use sqlectron_core::servers::{decrypt_secrets, ServerRegistry};
use sqlectron_core::vault;
use tempfile::TempDir;

fn store_in(dir: &TempDir) -> ConfigStore {
    ConfigStore::at_path(dir.path().join("sqlectron.json"))
}

fn postgres_descriptor() -> Server {
    Server {
        name: "a".into(),
        client: "postgresql".into(),
        host: Some("h".into()),
        port: Some(5432),
        ssl: Some(false),
        password: Some("p".into()),
        ..Default::default()
    }
}

#[tokio::test]
async fn test_prepare_round_trip() {
    let dir = TempDir::new().unwrap();
    let store = store_in(&dir);

    store
        .save(&ConfigDocument {
            servers: vec![postgres_descriptor()],
            ..Default::default()
        })
        .await
        .unwrap();

    store.prepare("KEY").await.unwrap();

    // Reload from disk: the stored server now has a UUID id, is encrypted,
    // and the password decrypts back to the original.
    let doc = store.load().await.unwrap();
    let server = &doc.servers[0];

    let id = server.id.as_deref().expect("id assigned");
    assert_eq!(uuid::Uuid::parse_str(id).unwrap().get_version_num(), 4);
    assert!(server.encrypted);
    assert_eq!(
        vault::decrypt(server.password.as_deref().unwrap(), "KEY").unwrap(),
        "p"
    );
}

#[tokio::test]
async fn test_prepare_sync_matches_async() {
    let dir = TempDir::new().unwrap();

    let async_store = ConfigStore::at_path(dir.path().join("a.json"));
    let sync_store = ConfigStore::at_path(dir.path().join("b.json"));
    let doc = ConfigDocument {
        servers: vec![Server {
            id: Some("fixed-id".into()),
            encrypted: true,
            password: Some("already-ciphertext".into()),
            ..postgres_descriptor()
        }],
        ..Default::default()
    };
    async_store.save(&doc).await.unwrap();
    sync_store.save_sync(&doc).unwrap();

    // Nothing to change, so prepare must leave byte-identical files.
    async_store.prepare("KEY").await.unwrap();
    sync_store.prepare_sync("KEY").unwrap();

    let a = std::fs::read(async_store.path()).unwrap();
    let b = std::fs::read(sync_store.path()).unwrap();
    assert_eq!(a, b);
}

#[tokio::test]
async fn test_missing_file_is_created_with_empty_document() {
    let dir = TempDir::new().unwrap();
    let store = ConfigStore::at_path(dir.path().join("nested").join("sqlectron.json"));

    let doc = store.load().await.unwrap();
    assert!(doc.servers.is_empty());

    let raw = std::fs::read_to_string(store.path()).unwrap();
    assert!(raw.contains("\"servers\": []"));
}

#[tokio::test]
async fn test_registry_add_decrypt_equals_submitted() {
    let dir = TempDir::new().unwrap();
    let registry = ServerRegistry::new(store_in(&dir));

    let submitted = postgres_descriptor();
    let stored = registry.add(submitted.clone(), "KEY").await.unwrap();
    let decrypted = decrypt_secrets(&stored, "KEY").unwrap();

    // Equal to the submitted form except for the assigned id.
    let mut expected = submitted;
    expected.id = stored.id.clone();
    assert_eq!(decrypted, expected);
}

#[tokio::test]
async fn test_registry_remove_restores_prior_state() {
    let dir = TempDir::new().unwrap();
    let registry = ServerRegistry::new(store_in(&dir));

    registry.add(postgres_descriptor(), "KEY").await.unwrap();
    let before = registry.get_all().await.unwrap();

    let mut second = postgres_descriptor();
    second.name = "temporary".into();
    let added = registry.add_or_update(second, "KEY").await.unwrap();
    registry
        .remove_by_id(added.id.as_deref().unwrap())
        .await
        .unwrap();

    assert_eq!(registry.get_all().await.unwrap(), before);
}

#[tokio::test]
async fn test_registry_ids_unique_across_many_adds() {
    let dir = TempDir::new().unwrap();
    let registry = ServerRegistry::new(store_in(&dir));

    for i in 0..20 {
        let mut server = postgres_descriptor();
        server.name = format!("server {i}");
        registry.add(server, "KEY").await.unwrap();
    }

    let all = registry.get_all().await.unwrap();
    let mut ids: Vec<_> = all.iter().filter_map(|s| s.id.clone()).collect();
    assert_eq!(ids.len(), 20);
    ids.sort();
    ids.dedup();
    assert_eq!(ids.len(), 20);
}
