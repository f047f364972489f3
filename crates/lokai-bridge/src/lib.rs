//! Lokai Bridge Library
//!
//! Connects UI collaborators to the long-running agent worker:
//! - Process supervision with readiness probing and crash detection
//! - Call correlation and token streaming over line-delimited JSON-RPC
//! - Approval gateway for human-in-the-loop decisions
//! - A typed call surface (`AgentBridge`) over all of the above

pub mod approval;
pub mod console;
pub mod rpc;
pub mod service;
pub mod subprocess;

pub use service::{AgentBridge, AgentStatus, CancelOutcome};
