use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use fleet_core::{
    AuditCursor, AuditEntry, AuditLevel, AuditLog, AuditOrder, AuditPage, AuditQuery, Command,
    CommandFilter, CommandId, CommandRepository, CommandState, SecretBackend, Server, ServerId,
    ServerRepository, Transition,
};
use futures_util::stream::{self, Stream, TryStreamExt};
use sqlx::sqlite::{SqlitePoolOptions, SqliteRow};
use sqlx::{Pool, QueryBuilder, Row, Sqlite};
use std::path::Path;
use uuid::Uuid;

/// SQLite persistence for servers, commands, the audit trail and sealed
/// credentials. Timestamps are stored as unix milliseconds.
#[derive(Clone)]
pub struct SqliteStore {
    pool: Pool<Sqlite>,
}

impl SqliteStore {
    /// Open (creating if needed) the database at `db_path`. `":memory:"`
    /// gives a private in-memory database held on a single connection.
    pub async fn new<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let path = db_path.as_ref();
        let in_memory = path.as_os_str() == ":memory:";

        let mut options = SqlitePoolOptions::new().after_connect(|conn, _meta| {
            Box::pin(async move {
                sqlx::query("PRAGMA foreign_keys = ON").execute(&mut *conn).await?;
                sqlx::query("PRAGMA busy_timeout = 5000").execute(&mut *conn).await?;
                Ok(())
            })
        });
        let db_url = if in_memory {
            // Every connection would otherwise see its own empty database
            options = options
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None);
            "sqlite::memory:".to_string()
        } else {
            options = options.max_connections(5);
            format!("sqlite://{}?mode=rwc", path.display())
        };

        let pool = options
            .connect(&db_url)
            .await
            .context("Failed to connect to SQLite database")?;

        let store = Self { pool };
        store.migrate().await?;
        tracing::debug!("SQLite store ready at {}", path.display());
        Ok(store)
    }

    async fn migrate(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS servers (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                host TEXT NOT NULL,
                port INTEGER NOT NULL,
                username TEXT NOT NULL,
                credential_ref TEXT NOT NULL,
                max_concurrent_commands INTEGER NOT NULL,
                workdir TEXT,
                status TEXT NOT NULL,
                last_seen INTEGER,
                created_by TEXT,
                created_at INTEGER NOT NULL
            );
            "#,
        )
        .execute(&self.pool)
        .await
        .context("Failed to create servers table")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS commands (
                id TEXT PRIMARY KEY,
                server_id TEXT NOT NULL,
                issuer_id TEXT NOT NULL,
                text TEXT NOT NULL,
                kind TEXT NOT NULL,
                state TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                started_at INTEGER,
                completed_at INTEGER,
                exit_code INTEGER,
                stdout TEXT,
                stderr TEXT,
                reason TEXT,
                FOREIGN KEY(server_id) REFERENCES servers(id)
            );
            "#,
        )
        .execute(&self.pool)
        .await
        .context("Failed to create commands table")?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_commands_server_created ON commands(server_id, created_at)",
        )
        .execute(&self.pool)
        .await
        .context("Failed to create commands server index")?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_commands_state ON commands(state)")
            .execute(&self.pool)
            .await
            .context("Failed to create commands state index")?;

        // One row per (command, state): re-recording a transition is a no-op
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS audit_entries (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                command_id TEXT NOT NULL,
                server_id TEXT NOT NULL,
                issuer_id TEXT NOT NULL,
                state TEXT NOT NULL,
                level TEXT NOT NULL,
                exit_code INTEGER,
                reason TEXT,
                created_at INTEGER NOT NULL,
                UNIQUE(command_id, state)
            );
            "#,
        )
        .execute(&self.pool)
        .await
        .context("Failed to create audit_entries table")?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_audit_created ON audit_entries(created_at, seq)",
        )
        .execute(&self.pool)
        .await
        .context("Failed to create audit time index")?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_audit_server ON audit_entries(server_id, created_at)",
        )
        .execute(&self.pool)
        .await
        .context("Failed to create audit server index")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS credentials (
                reference TEXT PRIMARY KEY,
                sealed TEXT NOT NULL,
                created_at INTEGER NOT NULL
            );
            "#,
        )
        .execute(&self.pool)
        .await
        .context("Failed to create credentials table")?;

        Ok(())
    }

    // =========================================================================
    // Audit paging
    // =========================================================================

    async fn audit_page(&self, query: &AuditQuery) -> Result<(Vec<AuditEntry>, Option<AuditCursor>)> {
        let limit = query.effective_limit();
        let mut qb = QueryBuilder::<Sqlite>::new(
            "SELECT seq, command_id, server_id, issuer_id, state, level, exit_code, reason, created_at \
             FROM audit_entries WHERE 1 = 1",
        );
        if let Some(server_id) = query.server_id {
            qb.push(" AND server_id = ").push_bind(server_id.to_string());
        }
        if let Some(issuer_id) = query.issuer_id {
            qb.push(" AND issuer_id = ").push_bind(issuer_id.to_string());
        }
        if let Some(command_id) = query.command_id {
            qb.push(" AND command_id = ").push_bind(command_id.to_string());
        }
        if let Some(level) = query.level {
            qb.push(" AND level = ").push_bind(level.as_str());
        }
        if let Some(from) = query.from {
            qb.push(" AND created_at >= ").push_bind(from.timestamp_millis());
        }
        if let Some(to) = query.to {
            qb.push(" AND created_at <= ").push_bind(to.timestamp_millis());
        }

        let (cmp, dir) = match query.order {
            AuditOrder::Desc => ("<", "DESC"),
            AuditOrder::Asc => (">", "ASC"),
        };
        if let Some(cursor) = query.cursor {
            qb.push(format!(" AND (created_at {} ", cmp))
                .push_bind(cursor.created_at_ms)
                .push(" OR (created_at = ")
                .push_bind(cursor.created_at_ms)
                .push(format!(" AND seq {} ", cmp))
                .push_bind(cursor.seq)
                .push("))");
        }
        qb.push(format!(" ORDER BY created_at {dir}, seq {dir} LIMIT "))
            .push_bind((limit + 1) as i64);

        let rows = qb
            .build()
            .fetch_all(&self.pool)
            .await
            .context("Failed to query audit entries")?;

        let mut entries = rows.iter().map(row_to_audit_entry).collect::<Result<Vec<_>>>()?;
        let next = if entries.len() > limit {
            entries.truncate(limit);
            entries.last().map(AuditCursor::after)
        } else {
            None
        };
        Ok((entries, next))
    }

    /// The same query as [`AuditLog::query`], walked page by page as entries
    /// are consumed.
    pub fn stream(&self, query: AuditQuery) -> impl Stream<Item = Result<AuditEntry>> + Send + '_ {
        stream::try_unfold(Some(query), move |next| async move {
            let Some(query) = next else {
                return Ok::<_, anyhow::Error>(None);
            };
            let (entries, cursor) = self.audit_page(&query).await?;
            let following = cursor.map(|cursor| AuditQuery {
                cursor: Some(cursor),
                ..query
            });
            let page = stream::iter(entries.into_iter().map(Ok::<_, anyhow::Error>));
            Ok(Some((page, following)))
        })
        .try_flatten()
    }
}

// =============================================================================
// Row mapping
// =============================================================================

fn parse_uuid(value: &str) -> Result<Uuid> {
    Uuid::parse_str(value).with_context(|| format!("Invalid UUID in database: {}", value))
}

fn from_millis(ms: i64) -> Result<DateTime<Utc>> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .with_context(|| format!("Invalid timestamp in database: {}", ms))
}

fn opt_millis(ms: Option<i64>) -> Result<Option<DateTime<Utc>>> {
    ms.map(from_millis).transpose()
}

fn row_to_server(row: &SqliteRow) -> Result<Server> {
    let port: i64 = row.get("port");
    let max_concurrent: i64 = row.get("max_concurrent_commands");
    let status: String = row.get("status");
    let created_by: Option<String> = row.get("created_by");
    Ok(Server {
        id: parse_uuid(row.get("id"))?,
        name: row.get("name"),
        host: row.get("host"),
        port: u16::try_from(port).context("Server port out of range")?,
        username: row.get("username"),
        credential_ref: row.get("credential_ref"),
        max_concurrent_commands: u32::try_from(max_concurrent).unwrap_or(1),
        workdir: row.get("workdir"),
        status: status.parse()?,
        last_seen: opt_millis(row.get("last_seen"))?,
        created_by: created_by.as_deref().map(parse_uuid).transpose()?,
        created_at: from_millis(row.get("created_at"))?,
    })
}

fn row_to_command(row: &SqliteRow) -> Result<Command> {
    let kind: String = row.get("kind");
    let state: String = row.get("state");
    Ok(Command {
        id: parse_uuid(row.get("id"))?,
        server_id: parse_uuid(row.get("server_id"))?,
        issuer_id: parse_uuid(row.get("issuer_id"))?,
        text: row.get("text"),
        kind: kind.parse()?,
        state: state.parse()?,
        created_at: from_millis(row.get("created_at"))?,
        started_at: opt_millis(row.get("started_at"))?,
        completed_at: opt_millis(row.get("completed_at"))?,
        exit_code: row.get("exit_code"),
        stdout: row.get("stdout"),
        stderr: row.get("stderr"),
        reason: row.get("reason"),
    })
}

fn row_to_audit_entry(row: &SqliteRow) -> Result<AuditEntry> {
    let state: String = row.get("state");
    let level: String = row.get("level");
    Ok(AuditEntry {
        seq: row.get("seq"),
        command_id: parse_uuid(row.get("command_id"))?,
        server_id: parse_uuid(row.get("server_id"))?,
        issuer_id: parse_uuid(row.get("issuer_id"))?,
        state: state.parse()?,
        level: level.parse::<AuditLevel>()?,
        exit_code: row.get("exit_code"),
        reason: row.get("reason"),
        created_at: from_millis(row.get("created_at"))?,
    })
}

// =============================================================================
// Servers
// =============================================================================

#[async_trait]
impl ServerRepository for SqliteStore {
    async fn insert_server(&self, server: &Server) -> Result<()> {
        sqlx::query(
            "INSERT INTO servers (id, name, host, port, username, credential_ref, max_concurrent_commands, \
             workdir, status, last_seen, created_by, created_at) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(server.id.to_string())
        .bind(&server.name)
        .bind(&server.host)
        .bind(server.port as i64)
        .bind(&server.username)
        .bind(&server.credential_ref)
        .bind(server.max_concurrent_commands as i64)
        .bind(&server.workdir)
        .bind(server.status.as_str())
        .bind(server.last_seen.map(|t| t.timestamp_millis()))
        .bind(server.created_by.map(|id| id.to_string()))
        .bind(server.created_at.timestamp_millis())
        .execute(&self.pool)
        .await
        .context("Failed to insert server")?;
        Ok(())
    }

    async fn update_server(&self, server: &Server) -> Result<()> {
        let result = sqlx::query(
            "UPDATE servers SET name = ?, host = ?, port = ?, username = ?, credential_ref = ?, \
             max_concurrent_commands = ?, workdir = ?, status = ?, last_seen = ? WHERE id = ?",
        )
        .bind(&server.name)
        .bind(&server.host)
        .bind(server.port as i64)
        .bind(&server.username)
        .bind(&server.credential_ref)
        .bind(server.max_concurrent_commands as i64)
        .bind(&server.workdir)
        .bind(server.status.as_str())
        .bind(server.last_seen.map(|t| t.timestamp_millis()))
        .bind(server.id.to_string())
        .execute(&self.pool)
        .await
        .context("Failed to update server")?;

        if result.rows_affected() == 0 {
            anyhow::bail!("Server {} does not exist", server.id);
        }
        Ok(())
    }

    async fn get_server(&self, id: ServerId) -> Result<Option<Server>> {
        let row = sqlx::query("SELECT * FROM servers WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .context("Failed to query server")?;
        row.as_ref().map(row_to_server).transpose()
    }

    async fn list_servers(&self) -> Result<Vec<Server>> {
        let rows = sqlx::query("SELECT * FROM servers ORDER BY name ASC, created_at ASC")
            .fetch_all(&self.pool)
            .await
            .context("Failed to list servers")?;
        rows.iter().map(row_to_server).collect()
    }

    async fn delete_server(&self, id: ServerId) -> Result<bool> {
        let mut tx = self.pool.begin().await.context("Failed to begin transaction")?;
        sqlx::query("DELETE FROM commands WHERE server_id = ?")
            .bind(id.to_string())
            .execute(&mut *tx)
            .await
            .context("Failed to delete commands of server")?;
        let result = sqlx::query("DELETE FROM servers WHERE id = ?")
            .bind(id.to_string())
            .execute(&mut *tx)
            .await
            .context("Failed to delete server")?;
        tx.commit().await.context("Failed to commit server deletion")?;
        Ok(result.rows_affected() > 0)
    }
}

// =============================================================================
// Commands
// =============================================================================

#[async_trait]
impl CommandRepository for SqliteStore {
    async fn insert_command(&self, command: &Command) -> Result<()> {
        sqlx::query(
            "INSERT INTO commands (id, server_id, issuer_id, text, kind, state, created_at, started_at, \
             completed_at, exit_code, stdout, stderr, reason) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(command.id.to_string())
        .bind(command.server_id.to_string())
        .bind(command.issuer_id.to_string())
        .bind(&command.text)
        .bind(command.kind.as_str())
        .bind(command.state.as_str())
        .bind(command.created_at.timestamp_millis())
        .bind(command.started_at.map(|t| t.timestamp_millis()))
        .bind(command.completed_at.map(|t| t.timestamp_millis()))
        .bind(command.exit_code)
        .bind(&command.stdout)
        .bind(&command.stderr)
        .bind(&command.reason)
        .execute(&self.pool)
        .await
        .context("Failed to insert command")?;
        Ok(())
    }

    async fn update_command(&self, command: &Command) -> Result<()> {
        let result = sqlx::query(
            "UPDATE commands SET state = ?, started_at = ?, completed_at = ?, exit_code = ?, \
             stdout = ?, stderr = ?, reason = ? WHERE id = ?",
        )
        .bind(command.state.as_str())
        .bind(command.started_at.map(|t| t.timestamp_millis()))
        .bind(command.completed_at.map(|t| t.timestamp_millis()))
        .bind(command.exit_code)
        .bind(&command.stdout)
        .bind(&command.stderr)
        .bind(&command.reason)
        .bind(command.id.to_string())
        .execute(&self.pool)
        .await
        .context("Failed to update command")?;

        if result.rows_affected() == 0 {
            anyhow::bail!("Command {} does not exist", command.id);
        }
        Ok(())
    }

    async fn get_command(&self, id: CommandId) -> Result<Option<Command>> {
        let row = sqlx::query("SELECT * FROM commands WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .context("Failed to query command")?;
        row.as_ref().map(row_to_command).transpose()
    }

    async fn list_commands(&self, filter: &CommandFilter) -> Result<Vec<Command>> {
        let mut qb = QueryBuilder::<Sqlite>::new("SELECT * FROM commands WHERE 1 = 1");
        if let Some(server_id) = filter.server_id {
            qb.push(" AND server_id = ").push_bind(server_id.to_string());
        }
        if let Some(state) = filter.state {
            qb.push(" AND state = ").push_bind(state.as_str());
        }
        if let Some(issuer_id) = filter.issuer_id {
            qb.push(" AND issuer_id = ").push_bind(issuer_id.to_string());
        }
        if let Some(since) = filter.since {
            qb.push(" AND created_at >= ").push_bind(since.timestamp_millis());
        }
        qb.push(" ORDER BY created_at DESC, rowid DESC LIMIT ")
            .push_bind(filter.effective_limit() as i64);

        let rows = qb
            .build()
            .fetch_all(&self.pool)
            .await
            .context("Failed to list commands")?;
        rows.iter().map(row_to_command).collect()
    }

    async fn commands_in_state(&self, state: CommandState) -> Result<Vec<Command>> {
        let rows = sqlx::query("SELECT * FROM commands WHERE state = ? ORDER BY created_at ASC, rowid ASC")
            .bind(state.as_str())
            .fetch_all(&self.pool)
            .await
            .context("Failed to query commands by state")?;
        rows.iter().map(row_to_command).collect()
    }
}

// =============================================================================
// Audit
// =============================================================================

#[async_trait]
impl AuditLog for SqliteStore {
    async fn record(&self, transition: &Transition) -> Result<bool> {
        let result = sqlx::query(
            "INSERT OR IGNORE INTO audit_entries (command_id, server_id, issuer_id, state, level, \
             exit_code, reason, created_at) VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(transition.command_id.to_string())
        .bind(transition.server_id.to_string())
        .bind(transition.issuer_id.to_string())
        .bind(transition.state.as_str())
        .bind(AuditLevel::for_state(transition.state).as_str())
        .bind(transition.exit_code)
        .bind(&transition.reason)
        .bind(transition.at.timestamp_millis())
        .execute(&self.pool)
        .await
        .context("Failed to record audit entry")?;

        let written = result.rows_affected() == 1;
        if !written {
            tracing::debug!(
                "Audit entry for {} -> {} already recorded",
                transition.command_id,
                transition.state
            );
        }
        Ok(written)
    }

    async fn query(&self, query: &AuditQuery) -> Result<AuditPage> {
        let (entries, next) = self.audit_page(query).await?;
        Ok(AuditPage {
            entries,
            next_cursor: next.map(|cursor| cursor.encode()),
        })
    }
}

// =============================================================================
// Sealed credentials
// =============================================================================

#[async_trait]
impl SecretBackend for SqliteStore {
    async fn put_sealed(&self, reference: &str, sealed: &str) -> Result<()> {
        sqlx::query(
            "INSERT INTO credentials (reference, sealed, created_at) VALUES (?, ?, ?) \
             ON CONFLICT(reference) DO UPDATE SET sealed = excluded.sealed",
        )
        .bind(reference)
        .bind(sealed)
        .bind(Utc::now().timestamp_millis())
        .execute(&self.pool)
        .await
        .context("Failed to store sealed credential")?;
        Ok(())
    }

    async fn get_sealed(&self, reference: &str) -> Result<Option<String>> {
        let row = sqlx::query("SELECT sealed FROM credentials WHERE reference = ?")
            .bind(reference)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to query sealed credential")?;
        Ok(row.map(|row| row.get("sealed")))
    }

    async fn delete_sealed(&self, reference: &str) -> Result<()> {
        sqlx::query("DELETE FROM credentials WHERE reference = ?")
            .bind(reference)
            .execute(&self.pool)
            .await
            .context("Failed to delete sealed credential")?;
        Ok(())
    }
}
