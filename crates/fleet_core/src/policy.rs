//! Who may do what, and which command texts are accepted at all.
//!
//! Role checks live in two plain functions so the dispatcher has a single
//! capability check at its boundary.

use crate::config::DispatchConfig;
use crate::error::FleetError;
use crate::model::{Caller, Role};

/// Only operators with write roles may queue commands.
pub fn can_submit(role: Role) -> bool {
    matches!(role, Role::Admin | Role::Devops)
}

/// Registering or editing servers uses the same split as submission.
pub fn can_manage_servers(role: Role) -> bool {
    matches!(role, Role::Admin | Role::Devops)
}

// ============================================================================
// SubmissionPolicy
// ============================================================================

#[derive(Debug, Clone)]
pub struct SubmissionPolicy {
    blocked_commands: Vec<String>,
    max_command_len: usize,
}

impl SubmissionPolicy {
    pub fn new(config: &DispatchConfig) -> Self {
        Self {
            blocked_commands: config.blocked_commands.clone(),
            max_command_len: config.max_command_len,
        }
    }

    pub fn authorize_submit(&self, caller: &Caller) -> Result<(), FleetError> {
        if can_submit(caller.role) {
            Ok(())
        } else {
            Err(FleetError::Authorization {
                role: caller.role,
                action: "submit commands",
            })
        }
    }

    pub fn authorize_manage(&self, caller: &Caller) -> Result<(), FleetError> {
        if can_manage_servers(caller.role) {
            Ok(())
        } else {
            Err(FleetError::Authorization {
                role: caller.role,
                action: "manage servers",
            })
        }
    }

    /// Validate command text, returning it trimmed.
    pub fn check_text<'a>(&self, text: &'a str) -> Result<&'a str, FleetError> {
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return Err(FleetError::Validation("command text is empty".to_string()));
        }
        if trimmed.len() > self.max_command_len {
            return Err(FleetError::Validation(format!(
                "command text is {} bytes, limit is {}",
                trimmed.len(),
                self.max_command_len
            )));
        }
        // Blocked patterns are denied regardless of role
        for blocked in &self.blocked_commands {
            if trimmed.contains(blocked.as_str()) {
                return Err(FleetError::Validation(format!(
                    "command contains blocked pattern: '{}'",
                    blocked
                )));
            }
        }
        Ok(trimmed)
    }
}

// ============================================================================
// Tests
// ============================================================================
