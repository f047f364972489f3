//! Call surface for UI collaborators.

pub mod router;

use std::sync::Arc;

use serde::Serialize;
use serde_json::{Value, json};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::info;

use lokai_core::Config;

use crate::approval::{
    ApprovalConfig, ApprovalError, ApprovalEvent, ApprovalGateway, ApprovalRequest,
    ApprovalResponse, PendingApproval,
};
use crate::rpc::{Correlator, RpcError, StreamingCall};
use crate::subprocess::{SupervisorError, WorkerConfig, WorkerEvent, WorkerState, WorkerSupervisor};

/// Snapshot returned by [`AgentBridge::get_status`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentStatus {
    pub running: bool,
    pub state: WorkerState,
    pub pid: Option<u32>,
    pub outstanding_calls: usize,
    pub pending_approvals: usize,
    pub last_error: Option<String>,
}

/// Result of [`AgentBridge::cancel`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CancelOutcome {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// The bridge between UI collaborators and the agent worker.
///
/// Owns one [`WorkerSupervisor`] and one [`ApprovalGateway`], and serves the
/// worker's own requests (approvals) in the background.
pub struct AgentBridge {
    supervisor: Arc<WorkerSupervisor>,
    approvals: ApprovalGateway,
    router: JoinHandle<()>,
}

impl AgentBridge {
    /// Must be called within a Tokio runtime.
    pub fn new(worker: WorkerConfig, approvals: ApprovalConfig) -> Self {
        let (supervisor, requests) = WorkerSupervisor::new(worker);
        let approvals = ApprovalGateway::new(approvals);
        let router = tokio::spawn(router::route_requests(requests, approvals.clone()));
        Self {
            supervisor: Arc::new(supervisor),
            approvals,
            router,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(
            WorkerConfig::from_config(config),
            ApprovalConfig::from(&config.approvals),
        )
    }

    pub fn supervisor(&self) -> &WorkerSupervisor {
        &self.supervisor
    }

    pub const fn approvals(&self) -> &ApprovalGateway {
        &self.approvals
    }

    /// Start the worker and wait for readiness.
    pub async fn start(&self) -> Result<(), SupervisorError> {
        self.supervisor.start().await
    }

    /// Stop the worker. Approvals the worker asked for are cancelled.
    pub async fn stop(&self) {
        self.supervisor.stop().await;
    }

    /// Send a chat message and wait for the full reply.
    pub async fn send_message(&self, text: &str) -> Result<Value, RpcError> {
        self.correlator()?
            .call("process_message", json!({ "message": text }))
            .await
    }

    /// Send a chat message and stream the reply token by token.
    pub async fn send_message_streaming(&self, text: &str) -> Result<StreamingCall, RpcError> {
        let correlator = self.correlator()?;
        Ok(correlator
            .call_streaming("process_message", json!({ "message": text }))
            .await)
    }

    pub async fn execute_tool(&self, name: &str, params: Value) -> Result<Value, RpcError> {
        self.correlator()?
            .call("execute_tool", json!({ "tool": name, "params": params }))
            .await
    }

    /// Ask the worker to abandon its current operation.
    ///
    /// Not being connected is reported in the outcome, not as an error.
    pub async fn cancel(&self) -> Result<CancelOutcome, RpcError> {
        let Ok(correlator) = self.correlator() else {
            return Ok(CancelOutcome {
                success: false,
                message: Some("Agent not running".to_string()),
            });
        };
        correlator.call("cancel", json!({})).await?;
        info!("Cancel request acknowledged by worker");
        Ok(CancelOutcome {
            success: true,
            message: None,
        })
    }

    /// Environment snapshot from the worker.
    pub async fn get_context(&self) -> Result<Value, RpcError> {
        self.correlator()?.call("get_context", json!({})).await
    }

    pub fn get_status(&self) -> AgentStatus {
        let state = self.supervisor.state();
        AgentStatus {
            running: state.accepts_calls(),
            state,
            pid: self.supervisor.pid(),
            outstanding_calls: self
                .supervisor
                .correlator()
                .map_or(0, |c| c.outstanding()),
            pending_approvals: self.approvals.count(),
            last_error: self.supervisor.last_error(),
        }
    }

    pub async fn request_approval(
        &self,
        request: ApprovalRequest,
    ) -> Result<ApprovalResponse, ApprovalError> {
        self.approvals.request(request).await
    }

    pub fn respond_to_approval(
        &self,
        id: &str,
        response: ApprovalResponse,
    ) -> Result<(), ApprovalError> {
        self.approvals.respond(id, response)
    }

    pub fn list_approvals(&self) -> Vec<PendingApproval> {
        self.approvals.list()
    }

    pub fn cancel_approval(&self, id: &str) -> bool {
        self.approvals.cancel(id)
    }

    pub fn subscribe_approvals(&self) -> broadcast::Receiver<ApprovalEvent> {
        self.approvals.subscribe()
    }

    pub fn subscribe_worker_events(&self) -> broadcast::Receiver<WorkerEvent> {
        self.supervisor.subscribe_events()
    }

    fn correlator(&self) -> Result<Arc<Correlator>, RpcError> {
        self.supervisor
            .correlator()
            .filter(|c| c.is_running())
            .ok_or(RpcError::NotRunning)
    }
}

impl Drop for AgentBridge {
    fn drop(&mut self) {
        self.router.abort();
    }
}

impl std::fmt::Debug for AgentBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentBridge")
            .field("supervisor", &self.supervisor)
            .field("approvals", &self.approvals)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::approval::RiskLevel;

    fn bridge() -> AgentBridge {
        AgentBridge::new(
            WorkerConfig::new("/nonexistent/lokai-worker"),
            ApprovalConfig::default(),
        )
    }

    #[tokio::test]
    async fn calls_fail_fast_when_not_started() {
        let bridge = bridge();
        assert_eq!(bridge.send_message("hi").await, Err(RpcError::NotRunning));
        assert_eq!(
            bridge.execute_tool("ls", json!({})).await,
            Err(RpcError::NotRunning)
        );
        assert_eq!(bridge.get_context().await, Err(RpcError::NotRunning));
        assert!(matches!(
            bridge.send_message_streaming("hi").await,
            Err(RpcError::NotRunning)
        ));
    }

    #[tokio::test]
    async fn cancel_without_worker_is_not_an_error() {
        let bridge = bridge();
        let outcome = bridge.cancel().await.unwrap();
        assert!(!outcome.success);
        assert_eq!(outcome.message.as_deref(), Some("Agent not running"));
    }

    #[tokio::test]
    async fn status_reports_idle_bridge() {
        let bridge = bridge();
        let status = bridge.get_status();
        assert!(!status.running);
        assert_eq!(status.state, WorkerState::NotStarted);
        assert_eq!(status.outstanding_calls, 0);
        assert_eq!(status.pending_approvals, 0);

        let value = serde_json::to_value(&status).unwrap();
        assert_eq!(value["state"], "not_started");
        assert_eq!(value["outstandingCalls"], 0);
    }

    #[tokio::test(start_paused = true)]
    async fn approvals_work_without_a_worker() {
        let bridge = bridge();
        let ticket = bridge
            .approvals()
            .register(ApprovalRequest::new("r1", "run", "Run tests", RiskLevel::Low))
            .unwrap();
        assert_eq!(bridge.list_approvals().len(), 1);
        assert_eq!(bridge.get_status().pending_approvals, 1);

        bridge
            .respond_to_approval("r1", ApprovalResponse::approve())
            .unwrap();
        assert_eq!(ticket.wait().await, Ok(ApprovalResponse::approve()));
        assert!(!bridge.cancel_approval("r1"));
    }
}
