//! Approval request and response types.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use lokai_core::config::ApprovalSettings;

/// Risk classification shown to the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

/// An action awaiting a human decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApprovalRequest {
    /// Caller-supplied; unique among pending requests.
    pub id: String,
    pub action: String,
    pub description: String,
    pub risk_level: RiskLevel,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preview: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

impl ApprovalRequest {
    pub fn new(
        id: impl Into<String>,
        action: impl Into<String>,
        description: impl Into<String>,
        risk_level: RiskLevel,
    ) -> Self {
        Self {
            id: id.into(),
            action: action.into(),
            description: description.into(),
            risk_level,
            preview: None,
            metadata: None,
        }
    }

    #[must_use]
    pub fn with_preview(mut self, preview: impl Into<String>) -> Self {
        self.preview = Some(preview.into());
        self
    }
}

/// The decision. `remember` is passed through to the requester untouched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalResponse {
    pub approved: bool,
    #[serde(default)]
    pub remember: bool,
}

impl ApprovalResponse {
    pub const fn approve() -> Self {
        Self {
            approved: true,
            remember: false,
        }
    }

    pub const fn deny() -> Self {
        Self {
            approved: false,
            remember: false,
        }
    }

    #[must_use]
    pub const fn remembered(mut self) -> Self {
        self.remember = true;
        self
    }
}

/// Snapshot of a pending request for listing.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingApproval {
    #[serde(flatten)]
    pub request: ApprovalRequest,
    /// Wall-clock creation time, milliseconds since the Unix epoch.
    pub created_at_ms: u64,
    pub expires_at_ms: u64,
}

/// How a request left the table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalOutcome {
    Approved,
    Denied,
    Cancelled,
    TimedOut,
}

/// Notifications for whoever displays approval prompts.
#[derive(Debug, Clone, PartialEq)]
pub enum ApprovalEvent {
    Requested(PendingApproval),
    Resolved { id: String, outcome: ApprovalOutcome },
}

/// Errors from approval operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ApprovalError {
    #[error("No pending approval with id: {id}")]
    NotFound { id: String },

    #[error("Approval already pending with id: {id}")]
    AlreadyPending { id: String },

    #[error("Approval timeout: {id}")]
    Timeout { id: String },

    #[error("Approval cancelled: {id}")]
    Cancelled { id: String },
}

impl ApprovalError {
    /// Stable machine-readable name of the error kind.
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::NotFound { .. } => "not_found",
            Self::AlreadyPending { .. } => "already_pending",
            Self::Timeout { .. } => "timeout",
            Self::Cancelled { .. } => "cancelled",
        }
    }
}

/// Configuration for the approval gateway.
#[derive(Debug, Clone)]
pub struct ApprovalConfig {
    /// Time a request may stay pending.
    pub timeout: Duration,
    /// Buffered events per subscriber.
    pub event_capacity: usize,
}

impl Default for ApprovalConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(5 * 60),
            event_capacity: 64,
        }
    }
}

impl From<&ApprovalSettings> for ApprovalConfig {
    fn from(settings: &ApprovalSettings) -> Self {
        Self {
            timeout: Duration::from_secs(settings.timeout_secs),
            ..Self::default()
        }
    }
}
