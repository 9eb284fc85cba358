use crate::error::FleetError;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

pub type ServerId = Uuid;
pub type CommandId = Uuid;
pub type UserId = Uuid;

// ============================================================================
// Callers
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Admin,
    Devops,
    Viewer,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Admin => "admin",
            Role::Devops => "devops",
            Role::Viewer => "viewer",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = FleetError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "admin" => Ok(Role::Admin),
            "devops" => Ok(Role::Devops),
            "viewer" => Ok(Role::Viewer),
            other => Err(FleetError::Validation(format!("unknown role '{}'", other))),
        }
    }
}

/// The identity on whose behalf an operation runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Caller {
    pub user_id: UserId,
    pub role: Role,
}

impl Caller {
    pub fn new(user_id: UserId, role: Role) -> Self {
        Self { user_id, role }
    }
}

// ============================================================================
// Servers
// ============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerStatus {
    Online,
    #[default]
    Offline,
    Error,
}

impl ServerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServerStatus::Online => "online",
            ServerStatus::Offline => "offline",
            ServerStatus::Error => "error",
        }
    }
}

impl FromStr for ServerStatus {
    type Err = FleetError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "online" => Ok(ServerStatus::Online),
            "offline" => Ok(ServerStatus::Offline),
            "error" => Ok(ServerStatus::Error),
            other => Err(FleetError::Validation(format!(
                "unknown server status '{}'",
                other
            ))),
        }
    }
}

/// A registered remote host. Never carries credential material, only a
/// reference into the vault.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Server {
    pub id: ServerId,
    pub name: String,
    pub host: String,
    pub port: u16,
    pub username: String,
    pub credential_ref: String,
    pub max_concurrent_commands: u32,
    /// Directory commands are run from (the application root on that host).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workdir: Option<String>,
    pub status: ServerStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_seen: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_by: Option<UserId>,
    pub created_at: DateTime<Utc>,
}

impl Server {
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Concurrency limit as a slot count; a limit of 0 is treated as 1.
    pub fn slots(&self) -> usize {
        self.max_concurrent_commands.max(1) as usize
    }
}

/// Registration request for a new server.
#[derive(Debug, Clone, Deserialize)]
pub struct NewServer {
    pub name: String,
    pub host: String,
    #[serde(default = "default_ssh_port")]
    pub port: u16,
    pub username: String,
    pub credential: crate::vault::Credential,
    #[serde(default)]
    pub max_concurrent_commands: Option<u32>,
    #[serde(default)]
    pub workdir: Option<String>,
}

fn default_ssh_port() -> u16 {
    22
}

/// Partial update of a server's operator-editable fields.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ServerPatch {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub max_concurrent_commands: Option<u32>,
    /// An empty string clears the working directory.
    #[serde(default)]
    pub workdir: Option<String>,
}

// ============================================================================
// Commands
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandKind {
    Artisan,
    Composer,
    Git,
    System,
    Custom,
}

impl CommandKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CommandKind::Artisan => "artisan",
            CommandKind::Composer => "composer",
            CommandKind::Git => "git",
            CommandKind::System => "system",
            CommandKind::Custom => "custom",
        }
    }

    /// Best guess at a command's kind from its text.
    pub fn infer(text: &str) -> Self {
        let mut tokens = text.split_whitespace();
        let first = tokens.next().unwrap_or("");
        match first {
            "php" if tokens.next() == Some("artisan") => CommandKind::Artisan,
            "artisan" => CommandKind::Artisan,
            "composer" => CommandKind::Composer,
            "git" => CommandKind::Git,
            "systemctl" | "service" | "df" | "du" | "free" | "uptime" | "ps" | "top"
            | "journalctl" | "apt" | "apt-get" | "yum" | "dnf" | "nginx" | "supervisorctl" => {
                CommandKind::System
            }
            _ => CommandKind::Custom,
        }
    }
}

impl FromStr for CommandKind {
    type Err = FleetError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "artisan" => Ok(CommandKind::Artisan),
            "composer" => Ok(CommandKind::Composer),
            "git" => Ok(CommandKind::Git),
            "system" => Ok(CommandKind::System),
            "custom" => Ok(CommandKind::Custom),
            other => Err(FleetError::Validation(format!(
                "unknown command kind '{}'",
                other
            ))),
        }
    }
}

/// Lifecycle state of a command.
///
/// ```text
/// pending ──► running ──► completed | failed | cancelled
///    │
///    └──────► cancelled | failed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandState {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl CommandState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CommandState::Pending => "pending",
            CommandState::Running => "running",
            CommandState::Completed => "completed",
            CommandState::Failed => "failed",
            CommandState::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            CommandState::Completed | CommandState::Failed | CommandState::Cancelled
        )
    }

    pub fn can_advance_to(&self, next: CommandState) -> bool {
        use CommandState::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Pending, Cancelled)
                | (Pending, Failed)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Cancelled)
        )
    }
}

impl fmt::Display for CommandState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CommandState {
    type Err = FleetError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(CommandState::Pending),
            "running" => Ok(CommandState::Running),
            "completed" => Ok(CommandState::Completed),
            "failed" => Ok(CommandState::Failed),
            "cancelled" => Ok(CommandState::Cancelled),
            other => Err(FleetError::Validation(format!(
                "unknown command state '{}'",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Command {
    pub id: CommandId,
    pub server_id: ServerId,
    pub issuer_id: UserId,
    pub text: String,
    pub kind: CommandKind,
    pub state: CommandState,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stdout: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stderr: Option<String>,
    /// Human-readable reason attached to every terminal state.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl Command {
    pub fn new(server_id: ServerId, issuer_id: UserId, text: &str, kind: CommandKind) -> Self {
        Self {
            id: Uuid::new_v4(),
            server_id,
            issuer_id,
            text: text.to_string(),
            kind,
            state: CommandState::Pending,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            exit_code: None,
            stdout: None,
            stderr: None,
            reason: None,
        }
    }

    /// Move forward to `next`, stamping the matching timestamp.
    ///
    /// Fails with `Conflict` for any transition that is not forward; a
    /// terminal command is never modified.
    pub fn advance(&mut self, next: CommandState, at: DateTime<Utc>) -> Result<(), FleetError> {
        if !self.state.can_advance_to(next) {
            return Err(FleetError::Conflict(format!(
                "command {} is {} and cannot become {}",
                self.id, self.state, next
            )));
        }
        self.state = next;
        if next == CommandState::Running {
            self.started_at = Some(at);
        }
        if next.is_terminal() {
            self.completed_at = Some(at);
        }
        Ok(())
    }

    /// Timestamp of the most recent transition.
    pub fn last_transition_at(&self) -> DateTime<Utc> {
        match self.state {
            CommandState::Pending => self.created_at,
            CommandState::Running => self.started_at.unwrap_or(self.created_at),
            _ => self
                .completed_at
                .or(self.started_at)
                .unwrap_or(self.created_at),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct CommandFilter {
    pub server_id: Option<ServerId>,
    pub state: Option<CommandState>,
    pub issuer_id: Option<UserId>,
    pub since: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
}

impl CommandFilter {
    pub const DEFAULT_LIMIT: usize = 50;
    pub const MAX_LIMIT: usize = 500;

    pub fn effective_limit(&self) -> usize {
        self.limit
            .unwrap_or(Self::DEFAULT_LIMIT)
            .clamp(1, Self::MAX_LIMIT)
    }
}

// ============================================================================
// Audit
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditLevel {
    Info,
    Warning,
    Error,
}

impl AuditLevel {
    pub fn for_state(state: CommandState) -> Self {
        match state {
            CommandState::Failed => AuditLevel::Error,
            CommandState::Cancelled => AuditLevel::Warning,
            _ => AuditLevel::Info,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AuditLevel::Info => "info",
            AuditLevel::Warning => "warning",
            AuditLevel::Error => "error",
        }
    }
}

impl FromStr for AuditLevel {
    type Err = FleetError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "info" => Ok(AuditLevel::Info),
            "warning" => Ok(AuditLevel::Warning),
            "error" => Ok(AuditLevel::Error),
            other => Err(FleetError::Validation(format!(
                "unknown audit level '{}'",
                other
            ))),
        }
    }
}

/// One state change of one command, as handed to the audit log.
#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub command_id: CommandId,
    pub server_id: ServerId,
    pub issuer_id: UserId,
    pub state: CommandState,
    pub exit_code: Option<i32>,
    pub reason: Option<String>,
    pub at: DateTime<Utc>,
}

impl From<&Command> for Transition {
    fn from(command: &Command) -> Self {
        Self {
            command_id: command.id,
            server_id: command.server_id,
            issuer_id: command.issuer_id,
            state: command.state,
            exit_code: command.exit_code,
            reason: command.reason.clone(),
            at: command.last_transition_at(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub seq: i64,
    pub command_id: CommandId,
    pub server_id: ServerId,
    pub issuer_id: UserId,
    pub state: CommandState,
    pub level: AuditLevel,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditOrder {
    #[default]
    Desc,
    Asc,
}

/// Position after the last entry of a page: (created_at millis, seq).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuditCursor {
    pub created_at_ms: i64,
    pub seq: i64,
}

impl AuditCursor {
    pub fn after(entry: &AuditEntry) -> Self {
        Self {
            created_at_ms: entry.created_at.timestamp_millis(),
            seq: entry.seq,
        }
    }

    pub fn encode(&self) -> String {
        URL_SAFE_NO_PAD.encode(format!("{}:{}", self.created_at_ms, self.seq))
    }

    pub fn decode(token: &str) -> Result<Self, FleetError> {
        let invalid = || FleetError::Validation("invalid audit cursor".to_string());
        let raw = URL_SAFE_NO_PAD.decode(token).map_err(|_| invalid())?;
        let raw = String::from_utf8(raw).map_err(|_| invalid())?;
        let (ts, seq) = raw.split_once(':').ok_or_else(invalid)?;
        Ok(Self {
            created_at_ms: ts.parse().map_err(|_| invalid())?,
            seq: seq.parse().map_err(|_| invalid())?,
        })
    }
}

#[derive(Debug, Clone, Default)]
pub struct AuditQuery {
    pub server_id: Option<ServerId>,
    pub issuer_id: Option<UserId>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    pub level: Option<AuditLevel>,
    pub command_id: Option<CommandId>,
    pub order: AuditOrder,
    pub limit: Option<usize>,
    pub cursor: Option<AuditCursor>,
}

impl AuditQuery {
    pub const DEFAULT_LIMIT: usize = 100;
    pub const MAX_LIMIT: usize = 1000;

    pub fn effective_limit(&self) -> usize {
        self.limit
            .unwrap_or(Self::DEFAULT_LIMIT)
            .clamp(1, Self::MAX_LIMIT)
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct AuditPage {
    pub entries: Vec<AuditEntry>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_cursor: Option<String>,
}

// ============================================================================
// Live events
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputStream {
    Stdout,
    Stderr,
}

/// What subscribers of a command topic receive: a state transition, or a
/// slice of output produced while the command is running.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandEvent {
    pub command_id: CommandId,
    pub server_id: ServerId,
    pub state: CommandState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream: Option<OutputStream>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_delta: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub at: DateTime<Utc>,
}

impl CommandEvent {
    pub fn transition(command: &Command) -> Self {
        Self {
            command_id: command.id,
            server_id: command.server_id,
            state: command.state,
            exit_code: command.exit_code,
            stream: None,
            output_delta: None,
            reason: command.reason.clone(),
            at: command.last_transition_at(),
        }
    }

    pub fn output(
        command_id: CommandId,
        server_id: ServerId,
        stream: OutputStream,
        delta: String,
    ) -> Self {
        Self {
            command_id,
            server_id,
            state: CommandState::Running,
            exit_code: None,
            stream: Some(stream),
            output_delta: Some(delta),
            reason: None,
            at: Utc::now(),
        }
    }

    pub fn is_transition(&self) -> bool {
        self.output_delta.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_command() -> Command {
        Command::new(Uuid::new_v4(), Uuid::new_v4(), "php artisan migrate", CommandKind::Artisan)
    }

    #[test]
    fn test_new_command_is_pending() {
        let cmd = sample_command();
        assert_eq!(cmd.state, CommandState::Pending);
        assert!(cmd.started_at.is_none());
        assert!(cmd.completed_at.is_none());
    }

    #[test]
    fn test_advance_stamps_timestamps() {
        let mut cmd = sample_command();
        let t1 = Utc::now();
        cmd.advance(CommandState::Running, t1).unwrap();
        assert_eq!(cmd.started_at, Some(t1));
        let t2 = Utc::now();
        cmd.advance(CommandState::Completed, t2).unwrap();
        assert_eq!(cmd.completed_at, Some(t2));
        assert_eq!(cmd.last_transition_at(), t2);
    }

    #[test]
    fn test_terminal_command_rejects_further_transitions() {
        let mut cmd = sample_command();
        cmd.advance(CommandState::Cancelled, Utc::now()).unwrap();
        let err = cmd.advance(CommandState::Running, Utc::now()).unwrap_err();
        assert!(matches!(err, FleetError::Conflict(_)));
        assert_eq!(cmd.state, CommandState::Cancelled);
    }

    #[test]
    fn test_running_cannot_go_back_to_pending() {
        let mut cmd = sample_command();
        cmd.advance(CommandState::Running, Utc::now()).unwrap();
        assert!(cmd.advance(CommandState::Pending, Utc::now()).is_err());
    }

    #[test]
    fn test_kind_inference() {
        assert_eq!(CommandKind::infer("php artisan cache:clear"), CommandKind::Artisan);
        assert_eq!(CommandKind::infer("composer install"), CommandKind::Composer);
        assert_eq!(CommandKind::infer("git pull origin main"), CommandKind::Git);
        assert_eq!(CommandKind::infer("systemctl restart nginx"), CommandKind::System);
        assert_eq!(CommandKind::infer("php -v"), CommandKind::Custom);
        assert_eq!(CommandKind::infer("./deploy.sh"), CommandKind::Custom);
    }

    #[test]
    fn test_audit_level_follows_state() {
        assert_eq!(AuditLevel::for_state(CommandState::Failed), AuditLevel::Error);
        assert_eq!(AuditLevel::for_state(CommandState::Cancelled), AuditLevel::Warning);
        assert_eq!(AuditLevel::for_state(CommandState::Running), AuditLevel::Info);
    }

    #[test]
    fn test_cursor_roundtrip_and_rejects_garbage() {
        let cursor = AuditCursor {
            created_at_ms: 1_700_000_000_123,
            seq: 42,
        };
        assert_eq!(AuditCursor::decode(&cursor.encode()).unwrap(), cursor);
        assert!(AuditCursor::decode("not-a-cursor!").is_err());
        assert!(AuditCursor::decode(&URL_SAFE_NO_PAD.encode("12:x")).is_err());
    }

    #[test]
    fn test_event_serializes_snake_case_without_empty_fields() {
        let cmd = sample_command();
        let json = serde_json::to_value(CommandEvent::transition(&cmd)).unwrap();
        assert_eq!(json["state"], "pending");
        assert!(json.get("output_delta").is_none());
        assert!(json.get("command_id").is_some());
    }

    #[test]
    fn test_server_slots_never_zero() {
        let server = Server {
            id: Uuid::new_v4(),
            name: "web-1".into(),
            host: "10.0.0.5".into(),
            port: 22,
            username: "deploy".into(),
            credential_ref: "cred_x".into(),
            max_concurrent_commands: 0,
            workdir: None,
            status: ServerStatus::Offline,
            last_seen: None,
            created_by: None,
            created_at: Utc::now(),
        };
        assert_eq!(server.slots(), 1);
        assert_eq!(server.address(), "10.0.0.5:22");
    }
}
