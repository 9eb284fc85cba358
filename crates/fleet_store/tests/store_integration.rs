//! Integration tests for SqliteStore on disk.
//!
//! Uses tempfile::TempDir for isolated SQLite databases.

use fleet_core::vault::{CredentialVault, VaultKey};
use fleet_core::{
    AuditLog, AuditQuery, Command, CommandKind, CommandRepository, CommandState, Credential,
    Secret, Server, ServerRepository, ServerStatus, Transition,
};
use fleet_store::SqliteStore;
use std::sync::Arc;
use uuid::Uuid;

fn server() -> Server {
    Server {
        id: Uuid::new_v4(),
        name: "db-1".into(),
        host: "10.0.1.2".into(),
        port: 2222,
        username: "ops".into(),
        credential_ref: "cred_pending".into(),
        max_concurrent_commands: 1,
        workdir: None,
        status: ServerStatus::Online,
        last_seen: Some(chrono::Utc::now()),
        created_by: None,
        created_at: chrono::Utc::now(),
    }
}

#[tokio::test]
async fn test_state_survives_reopen() {
    let dir = tempfile::TempDir::new().unwrap();
    let db_path = dir.path().join("fleet.db");

    let server = server();
    let cmd = Command::new(server.id, Uuid::new_v4(), "composer install", CommandKind::Composer);
    {
        let store = SqliteStore::new(&db_path).await.unwrap();
        store.insert_server(&server).await.unwrap();
        store.insert_command(&cmd).await.unwrap();
        store.record(&Transition::from(&cmd)).await.unwrap();
    }

    let store = SqliteStore::new(&db_path).await.unwrap();
    let loaded = store.get_server(server.id).await.unwrap().unwrap();
    assert_eq!(loaded.port, 2222);
    let pending = store.commands_in_state(CommandState::Pending).await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].id, cmd.id);

    // Re-recording after a restart is still deduplicated
    assert!(!store.record(&Transition::from(&cmd)).await.unwrap());
    assert_eq!(store.query(&AuditQuery::default()).await.unwrap().entries.len(), 1);
}

#[tokio::test]
async fn test_vault_over_sqlite_backend() {
    let dir = tempfile::TempDir::new().unwrap();
    let db_path = dir.path().join("fleet.db");
    let key_path = dir.path().join("fleet.key");

    let credential = Credential::Password {
        password: Secret::new("s3cret"),
    };
    let reference = {
        let store = Arc::new(SqliteStore::new(&db_path).await.unwrap());
        let vault = CredentialVault::new(VaultKey::load_or_create(&key_path).unwrap(), store);
        vault.store(&credential).await.unwrap()
    };

    let store = Arc::new(SqliteStore::new(&db_path).await.unwrap());
    let vault = CredentialVault::new(VaultKey::load_or_create(&key_path).unwrap(), store.clone());
    assert_eq!(vault.resolve(&reference).await.unwrap(), credential);

    // Only the sealed form is on disk
    let raw = std::fs::read(&db_path).unwrap();
    assert!(!String::from_utf8_lossy(&raw).contains("s3cret"));
}
