use crate::sqlite::SqliteStore;
use chrono::{Duration as ChronoDuration, Utc};
use fleet_core::{
    AuditCursor, AuditLevel, AuditLog, AuditOrder, AuditQuery, Command, CommandFilter,
    CommandKind, CommandRepository, CommandState, SecretBackend, Server, ServerRepository,
    ServerStatus, Transition,
};
use futures_util::TryStreamExt;
use uuid::Uuid;

fn sample_server(name: &str) -> Server {
    Server {
        id: Uuid::new_v4(),
        name: name.to_string(),
        host: "10.0.0.5".to_string(),
        port: 22,
        username: "deploy".to_string(),
        credential_ref: "cred_abc".to_string(),
        max_concurrent_commands: 2,
        workdir: Some("/var/www/app".to_string()),
        status: ServerStatus::Offline,
        last_seen: None,
        created_by: Some(Uuid::new_v4()),
        created_at: Utc::now(),
    }
}

async fn store_with_server() -> (SqliteStore, Server) {
    let store = SqliteStore::new(":memory:")
        .await
        .expect("Failed to create store");
    let server = sample_server("web-1");
    store.insert_server(&server).await.unwrap();
    (store, server)
}

fn transition(command: &Command, state: CommandState, at_ms: i64) -> Transition {
    Transition {
        command_id: command.id,
        server_id: command.server_id,
        issuer_id: command.issuer_id,
        state,
        exit_code: None,
        reason: None,
        at: chrono::TimeZone::timestamp_millis_opt(&Utc, at_ms).unwrap(),
    }
}

#[tokio::test]
async fn test_server_roundtrip_and_update() {
    let (store, mut server) = store_with_server().await;

    let loaded = store.get_server(server.id).await.unwrap().unwrap();
    assert_eq!(loaded.name, "web-1");
    assert_eq!(loaded.workdir.as_deref(), Some("/var/www/app"));
    assert_eq!(loaded.status, ServerStatus::Offline);
    assert_eq!(loaded.created_by, server.created_by);

    server.status = ServerStatus::Online;
    server.last_seen = Some(Utc::now());
    server.max_concurrent_commands = 4;
    store.update_server(&server).await.unwrap();

    let loaded = store.get_server(server.id).await.unwrap().unwrap();
    assert_eq!(loaded.status, ServerStatus::Online);
    assert!(loaded.last_seen.is_some());
    assert_eq!(loaded.max_concurrent_commands, 4);

    assert!(store.get_server(Uuid::new_v4()).await.unwrap().is_none());
}

#[tokio::test]
async fn test_update_unknown_server_fails() {
    let store = SqliteStore::new(":memory:").await.unwrap();
    assert!(store.update_server(&sample_server("ghost")).await.is_err());
}

#[tokio::test]
async fn test_list_servers_sorted_by_name() {
    let store = SqliteStore::new(":memory:").await.unwrap();
    store.insert_server(&sample_server("worker-2")).await.unwrap();
    store.insert_server(&sample_server("api-1")).await.unwrap();

    let names: Vec<String> = store
        .list_servers()
        .await
        .unwrap()
        .into_iter()
        .map(|s| s.name)
        .collect();
    assert_eq!(names, vec!["api-1", "worker-2"]);
}

#[tokio::test]
async fn test_command_roundtrip() {
    let (store, server) = store_with_server().await;
    let mut cmd = Command::new(server.id, Uuid::new_v4(), "php artisan migrate", CommandKind::Artisan);
    store.insert_command(&cmd).await.unwrap();

    cmd.advance(CommandState::Running, Utc::now()).unwrap();
    store.update_command(&cmd).await.unwrap();
    cmd.advance(CommandState::Failed, Utc::now()).unwrap();
    cmd.exit_code = Some(1);
    cmd.stderr = Some("SQLSTATE[HY000]".to_string());
    cmd.reason = Some("exited with status 1".to_string());
    store.update_command(&cmd).await.unwrap();

    let loaded = store.get_command(cmd.id).await.unwrap().unwrap();
    assert_eq!(loaded.state, CommandState::Failed);
    assert_eq!(loaded.kind, CommandKind::Artisan);
    assert_eq!(loaded.exit_code, Some(1));
    assert_eq!(loaded.stderr.as_deref(), Some("SQLSTATE[HY000]"));
    assert_eq!(loaded.reason.as_deref(), Some("exited with status 1"));
    assert!(loaded.started_at.is_some());
    assert!(loaded.completed_at.is_some());
    assert_eq!(loaded.created_at.timestamp_millis(), cmd.created_at.timestamp_millis());
}

#[tokio::test]
async fn test_command_requires_known_server() {
    let store = SqliteStore::new(":memory:").await.unwrap();
    let cmd = Command::new(Uuid::new_v4(), Uuid::new_v4(), "uptime", CommandKind::System);
    assert!(store.insert_command(&cmd).await.is_err());
}

#[tokio::test]
async fn test_list_commands_newest_first_with_filters() {
    let (store, server) = store_with_server().await;
    let other = sample_server("web-2");
    store.insert_server(&other).await.unwrap();

    let base = Utc::now() - ChronoDuration::minutes(10);
    let mut ids = Vec::new();
    for i in 0..3 {
        let mut cmd = Command::new(server.id, Uuid::new_v4(), &format!("echo {}", i), CommandKind::Custom);
        cmd.created_at = base + ChronoDuration::seconds(i);
        store.insert_command(&cmd).await.unwrap();
        ids.push(cmd.id);
    }
    let elsewhere = Command::new(other.id, Uuid::new_v4(), "uptime", CommandKind::System);
    store.insert_command(&elsewhere).await.unwrap();

    let listed = store
        .list_commands(&CommandFilter {
            server_id: Some(server.id),
            ..Default::default()
        })
        .await
        .unwrap();
    let listed_ids: Vec<Uuid> = listed.iter().map(|c| c.id).collect();
    assert_eq!(listed_ids, vec![ids[2], ids[1], ids[0]]);

    let limited = store
        .list_commands(&CommandFilter {
            limit: Some(1),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(limited.len(), 1);
    assert_eq!(limited[0].id, elsewhere.id);

    let since = store
        .list_commands(&CommandFilter {
            since: Some(base + ChronoDuration::seconds(1)),
            server_id: Some(server.id),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(since.len(), 2);
}

#[tokio::test]
async fn test_commands_in_state_oldest_first() {
    let (store, server) = store_with_server().await;
    let base = Utc::now() - ChronoDuration::minutes(1);
    let mut pending = Vec::new();
    for i in 0..3 {
        let mut cmd = Command::new(server.id, Uuid::new_v4(), "git pull", CommandKind::Git);
        cmd.created_at = base + ChronoDuration::seconds(i);
        if i == 1 {
            cmd.advance(CommandState::Running, Utc::now()).unwrap();
        } else {
            pending.push(cmd.id);
        }
        store.insert_command(&cmd).await.unwrap();
    }

    let found: Vec<Uuid> = store
        .commands_in_state(CommandState::Pending)
        .await
        .unwrap()
        .iter()
        .map(|c| c.id)
        .collect();
    assert_eq!(found, pending);
    assert_eq!(store.commands_in_state(CommandState::Running).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_audit_record_is_idempotent() {
    let (store, server) = store_with_server().await;
    let cmd = Command::new(server.id, Uuid::new_v4(), "uptime", CommandKind::System);
    let t = Transition::from(&cmd);

    assert!(store.record(&t).await.unwrap());
    assert!(!store.record(&t).await.unwrap());

    let page = store.query(&AuditQuery::default()).await.unwrap();
    assert_eq!(page.entries.len(), 1);
    assert_eq!(page.entries[0].state, CommandState::Pending);
    assert_eq!(page.entries[0].level, AuditLevel::Info);
    assert!(page.next_cursor.is_none());
}

#[tokio::test]
async fn test_audit_level_follows_state() {
    let (store, server) = store_with_server().await;
    let cmd = Command::new(server.id, Uuid::new_v4(), "uptime", CommandKind::System);
    store.record(&transition(&cmd, CommandState::Pending, 1_000)).await.unwrap();
    store.record(&transition(&cmd, CommandState::Running, 2_000)).await.unwrap();
    store.record(&transition(&cmd, CommandState::Failed, 3_000)).await.unwrap();
    let other = Command::new(server.id, Uuid::new_v4(), "uptime", CommandKind::System);
    store.record(&transition(&other, CommandState::Cancelled, 4_000)).await.unwrap();

    let errors = store
        .query(&AuditQuery {
            level: Some(AuditLevel::Error),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(errors.entries.len(), 1);
    assert_eq!(errors.entries[0].state, CommandState::Failed);

    let warnings = store
        .query(&AuditQuery {
            level: Some(AuditLevel::Warning),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(warnings.entries.len(), 1);
    assert_eq!(warnings.entries[0].command_id, other.id);
}

#[tokio::test]
async fn test_audit_order_and_tie_break() {
    let (store, server) = store_with_server().await;
    let a = Command::new(server.id, Uuid::new_v4(), "a", CommandKind::Custom);
    let b = Command::new(server.id, Uuid::new_v4(), "b", CommandKind::Custom);
    // Same timestamp: insertion sequence decides
    store.record(&transition(&a, CommandState::Pending, 5_000)).await.unwrap();
    store.record(&transition(&b, CommandState::Pending, 5_000)).await.unwrap();
    store.record(&transition(&a, CommandState::Running, 6_000)).await.unwrap();

    let desc = store.query(&AuditQuery::default()).await.unwrap();
    let order: Vec<(Uuid, CommandState)> = desc.entries.iter().map(|e| (e.command_id, e.state)).collect();
    assert_eq!(
        order,
        vec![
            (a.id, CommandState::Running),
            (b.id, CommandState::Pending),
            (a.id, CommandState::Pending),
        ]
    );

    let asc = store
        .query(&AuditQuery {
            order: AuditOrder::Asc,
            ..Default::default()
        })
        .await
        .unwrap();
    let seqs: Vec<i64> = asc.entries.iter().map(|e| e.seq).collect();
    let mut sorted = seqs.clone();
    sorted.sort();
    assert_eq!(seqs, sorted);
}

#[tokio::test]
async fn test_audit_cursor_pages_without_gaps() {
    let (store, server) = store_with_server().await;
    for i in 0..7 {
        let cmd = Command::new(server.id, Uuid::new_v4(), "uptime", CommandKind::System);
        // Pairs share a timestamp so the cursor has to use seq
        store
            .record(&transition(&cmd, CommandState::Pending, 10_000 + (i / 2) * 1_000))
            .await
            .unwrap();
    }

    for order in [AuditOrder::Desc, AuditOrder::Asc] {
        let mut seen = Vec::new();
        let mut cursor = None;
        loop {
            let page = store
                .query(&AuditQuery {
                    order,
                    limit: Some(3),
                    cursor,
                    ..Default::default()
                })
                .await
                .unwrap();
            seen.extend(page.entries.iter().map(|e| e.seq));
            match page.next_cursor {
                Some(token) => cursor = Some(AuditCursor::decode(&token).unwrap()),
                None => break,
            }
        }
        assert_eq!(seen.len(), 7);
        let mut unique = seen.clone();
        unique.sort();
        unique.dedup();
        assert_eq!(unique.len(), 7);
    }
}

#[tokio::test]
async fn test_audit_filters_by_server_user_and_time() {
    let (store, server) = store_with_server().await;
    let other = sample_server("web-2");
    store.insert_server(&other).await.unwrap();

    let alice = Uuid::new_v4();
    let first = Command::new(server.id, alice, "uptime", CommandKind::System);
    let second = Command::new(other.id, Uuid::new_v4(), "uptime", CommandKind::System);
    store.record(&transition(&first, CommandState::Pending, 1_000)).await.unwrap();
    store.record(&transition(&first, CommandState::Running, 2_000)).await.unwrap();
    store.record(&transition(&second, CommandState::Pending, 3_000)).await.unwrap();

    let by_server = store
        .query(&AuditQuery {
            server_id: Some(other.id),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(by_server.entries.len(), 1);

    let by_user = store
        .query(&AuditQuery {
            issuer_id: Some(alice),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(by_user.entries.len(), 2);

    let window = store
        .query(&AuditQuery {
            from: chrono::TimeZone::timestamp_millis_opt(&Utc, 1_500).single(),
            to: chrono::TimeZone::timestamp_millis_opt(&Utc, 2_500).single(),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(window.entries.len(), 1);
    assert_eq!(window.entries[0].state, CommandState::Running);
}

#[tokio::test]
async fn test_audit_stream_walks_all_pages() {
    let (store, server) = store_with_server().await;
    for i in 0..5 {
        let cmd = Command::new(server.id, Uuid::new_v4(), "uptime", CommandKind::System);
        store
            .record(&transition(&cmd, CommandState::Pending, 1_000 + i))
            .await
            .unwrap();
    }

    let entries: Vec<_> = store
        .stream(AuditQuery {
            order: AuditOrder::Asc,
            limit: Some(2),
            ..Default::default()
        })
        .try_collect()
        .await
        .unwrap();
    let times: Vec<i64> = entries.iter().map(|e| e.created_at.timestamp_millis()).collect();
    assert_eq!(times, vec![1_000, 1_001, 1_002, 1_003, 1_004]);
}

#[tokio::test]
async fn test_sealed_credentials() {
    let store = SqliteStore::new(":memory:").await.unwrap();
    assert!(store.get_sealed("cred_x").await.unwrap().is_none());
    store.put_sealed("cred_x", "c2VhbGVk").await.unwrap();
    assert_eq!(store.get_sealed("cred_x").await.unwrap().as_deref(), Some("c2VhbGVk"));

    store.delete_sealed("cred_x").await.unwrap();
    assert!(store.get_sealed("cred_x").await.unwrap().is_none());
    // Deleting twice is fine
    store.delete_sealed("cred_x").await.unwrap();
}

#[tokio::test]
async fn test_delete_server_keeps_audit() {
    let (store, server) = store_with_server().await;
    let other = sample_server("web-2");
    store.insert_server(&other).await.unwrap();

    let cmd = Command::new(server.id, Uuid::new_v4(), "uptime", CommandKind::System);
    store.insert_command(&cmd).await.unwrap();
    store.record(&transition(&cmd, CommandState::Pending, 1_000)).await.unwrap();
    let kept = Command::new(other.id, Uuid::new_v4(), "uptime", CommandKind::System);
    store.insert_command(&kept).await.unwrap();

    assert!(store.delete_server(server.id).await.unwrap());
    assert!(store.get_server(server.id).await.unwrap().is_none());
    assert!(store.get_command(cmd.id).await.unwrap().is_none());
    assert!(store.get_command(kept.id).await.unwrap().is_some());

    let page = store
        .query(&AuditQuery {
            server_id: Some(server.id),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(page.entries.len(), 1);

    assert!(!store.delete_server(server.id).await.unwrap());
}
