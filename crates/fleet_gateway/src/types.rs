//! Request and response bodies that are not domain types themselves.

use chrono::{DateTime, Utc};
use fleet_core::{
    AuditCursor, AuditLevel, AuditOrder, AuditQuery, CommandFilter, CommandId, CommandKind,
    CommandState, FleetError, FleetResult, ServerId,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Body of `POST /commands`.
#[derive(Debug, Clone, Deserialize)]
pub struct SubmitRequest {
    pub server_id: ServerId,
    pub text: String,
    #[serde(default)]
    pub kind: Option<CommandKind>,
}

/// Reply to an accepted submission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Submitted {
    pub id: CommandId,
    pub state: CommandState,
}

fn parse_time(field: &str, value: &str) -> FleetResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|_| FleetError::Validation(format!("{} must be an RFC 3339 timestamp", field)))
}

fn parse_opt<T, F>(value: Option<&str>, parse: F) -> FleetResult<Option<T>>
where
    F: FnOnce(&str) -> FleetResult<T>,
{
    value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(parse)
        .transpose()
}

/// Query string of `GET /commands`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CommandsParams {
    pub server_id: Option<Uuid>,
    pub state: Option<String>,
    pub issuer: Option<Uuid>,
    pub since: Option<String>,
    pub limit: Option<usize>,
}

impl CommandsParams {
    pub fn into_filter(self) -> FleetResult<CommandFilter> {
        Ok(CommandFilter {
            server_id: self.server_id,
            state: parse_opt(self.state.as_deref(), |s| s.parse())?,
            issuer_id: self.issuer,
            since: parse_opt(self.since.as_deref(), |s| parse_time("since", s))?,
            limit: self.limit,
        })
    }
}

/// Query string of `GET /audit`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AuditParams {
    pub server_id: Option<Uuid>,
    /// Issuer of the audited commands.
    pub user: Option<Uuid>,
    pub command_id: Option<Uuid>,
    pub from: Option<String>,
    pub to: Option<String>,
    pub level: Option<String>,
    pub order: Option<String>,
    pub limit: Option<usize>,
    pub cursor: Option<String>,
}

impl AuditParams {
    pub fn into_query(self) -> FleetResult<AuditQuery> {
        let order = match self.order.as_deref().map(str::trim) {
            None | Some("") | Some("desc") => AuditOrder::Desc,
            Some("asc") => AuditOrder::Asc,
            Some(other) => {
                return Err(FleetError::Validation(format!(
                    "order must be 'asc' or 'desc', got '{}'",
                    other
                )))
            }
        };
        let from = parse_opt(self.from.as_deref(), |s| parse_time("from", s))?;
        let to = parse_opt(self.to.as_deref(), |s| parse_time("to", s))?;
        if let (Some(from), Some(to)) = (from, to) {
            if from > to {
                return Err(FleetError::Validation("from is after to".to_string()));
            }
        }
        Ok(AuditQuery {
            server_id: self.server_id,
            issuer_id: self.user,
            from,
            to,
            level: parse_opt(self.level.as_deref(), |s| s.parse::<AuditLevel>())?,
            command_id: self.command_id,
            order,
            limit: self.limit,
            cursor: parse_opt(self.cursor.as_deref(), AuditCursor::decode)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_submit_request_kind_is_optional() {
        let id = Uuid::new_v4();
        let json = format!(r#"{{"server_id":"{}","text":"git pull"}}"#, id);
        let req: SubmitRequest = serde_json::from_str(&json).unwrap();
        assert_eq!(req.server_id, id);
        assert!(req.kind.is_none());

        let json = format!(r#"{{"server_id":"{}","text":"x","kind":"artisan"}}"#, id);
        let req: SubmitRequest = serde_json::from_str(&json).unwrap();
        assert_eq!(req.kind, Some(CommandKind::Artisan));
    }

    #[test]
    fn test_commands_params_parse() {
        let filter = CommandsParams {
            state: Some("running".into()),
            since: Some("2024-05-01T12:00:00Z".into()),
            limit: Some(10),
            ..Default::default()
        }
        .into_filter()
        .unwrap();
        assert_eq!(filter.state, Some(CommandState::Running));
        assert_eq!(filter.since.unwrap().to_rfc3339(), "2024-05-01T12:00:00+00:00");

        let bad = CommandsParams {
            state: Some("sleeping".into()),
            ..Default::default()
        };
        assert!(matches!(bad.into_filter(), Err(FleetError::Validation(_))));
    }

    #[test]
    fn test_audit_params_parse() {
        let query = AuditParams {
            level: Some("error".into()),
            order: Some("asc".into()),
            from: Some("2024-05-01T00:00:00Z".into()),
            ..Default::default()
        }
        .into_query()
        .unwrap();
        assert_eq!(query.level, Some(AuditLevel::Error));
        assert_eq!(query.order, AuditOrder::Asc);
        assert!(query.from.is_some());
        assert!(query.cursor.is_none());

        let defaults = AuditParams::default().into_query().unwrap();
        assert_eq!(defaults.order, AuditOrder::Desc);
    }

    #[test]
    fn test_audit_params_rejects_bad_input() {
        for params in [
            AuditParams {
                order: Some("sideways".into()),
                ..Default::default()
            },
            AuditParams {
                from: Some("yesterday".into()),
                ..Default::default()
            },
            AuditParams {
                from: Some("2024-05-02T00:00:00Z".into()),
                to: Some("2024-05-01T00:00:00Z".into()),
                ..Default::default()
            },
            AuditParams {
                cursor: Some("garbage".into()),
                ..Default::default()
            },
        ] {
            assert!(matches!(params.into_query(), Err(FleetError::Validation(_))));
        }
    }
}
