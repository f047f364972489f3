//! Human-in-the-loop approval gateway.
//!
//! Independent of the worker process: any party may register a request, and
//! a UI resolves, cancels, or lets it expire.

pub mod gateway;
pub mod types;

pub use gateway::{ApprovalGateway, ApprovalTicket};
pub use types::{
    ApprovalConfig, ApprovalError, ApprovalEvent, ApprovalOutcome, ApprovalRequest,
    ApprovalResponse, PendingApproval, RiskLevel,
};
