//! Core domain types

use serde::{Deserialize, Serialize};
use std::fmt;

/// Operator intent for the subsystem or a tunnel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum AdminState {
    #[serde(rename = "ADMIN_STATE_enable")]
    Enable,
    #[default]
    #[serde(rename = "ADMIN_STATE_disable")]
    Disable,
}

impl AdminState {
    pub fn is_enabled(&self) -> bool {
        matches!(self, AdminState::Enable)
    }
}

impl fmt::Display for AdminState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AdminState::Enable => write!(f, "enable"),
            AdminState::Disable => write!(f, "disable"),
        }
    }
}

/// Operational state, always derived by the agent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum OperState {
    #[serde(rename = "OPER_STATE_up")]
    Up,
    #[default]
    #[serde(rename = "OPER_STATE_down")]
    Down,
    #[serde(rename = "OPER_STATE_starting")]
    Starting,
    #[serde(rename = "OPER_STATE_failed")]
    Failed,
}

impl fmt::Display for OperState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OperState::Up => write!(f, "up"),
            OperState::Down => write!(f, "down"),
            OperState::Starting => write!(f, "starting"),
            OperState::Failed => write!(f, "failed"),
        }
    }
}
