#![allow(clippy::unwrap_used, clippy::panic)] // Integration tests use unwrap for brevity

//! Integration tests for the approval flow.
//!
//! The echo worker's `approve` method sends `request_approval` back to the
//! bridge and relays the answer, so these tests cover the full path:
//! worker request → gateway → UI response → reply to the worker.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{Value, json};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use lokai_bridge::AgentBridge;
use lokai_bridge::approval::{
    ApprovalConfig, ApprovalEvent, ApprovalOutcome, ApprovalRequest, ApprovalResponse,
    PendingApproval, RiskLevel,
};
use lokai_bridge::rpc::RpcError;
use lokai_bridge::subprocess::WorkerConfig;

fn echo_worker() -> WorkerConfig {
    let mut config = WorkerConfig::new(env!("CARGO_BIN_EXE_lokai-echo-worker"));
    config.readiness_initial_delay = Duration::from_millis(20);
    config.readiness_retry_interval = Duration::from_millis(200);
    config.readiness_timeout = Duration::from_secs(10);
    config.request_timeout = Duration::from_secs(5);
    config.terminate_timeout = Duration::from_secs(2);
    config
}

async fn started_bridge(approvals: ApprovalConfig) -> Arc<AgentBridge> {
    let bridge = Arc::new(AgentBridge::new(echo_worker(), approvals));
    bridge.start().await.unwrap();
    bridge
}

fn approval_params(id: &str) -> Value {
    json!({
        "id": id,
        "action": "shell",
        "description": "Run cargo test",
        "riskLevel": "medium",
        "preview": "cargo test --workspace",
    })
}

/// Ask the worker to request approval; resolves with the worker's relay.
fn worker_asks(bridge: &AgentBridge, id: &str) -> JoinHandle<Result<Value, RpcError>> {
    let correlator = bridge.supervisor().correlator().unwrap();
    let params = approval_params(id);
    tokio::spawn(async move { correlator.call("approve", params).await })
}

async fn next_requested(events: &mut broadcast::Receiver<ApprovalEvent>) -> PendingApproval {
    loop {
        match tokio::time::timeout(Duration::from_secs(5), events.recv()).await {
            Ok(Ok(ApprovalEvent::Requested(pending))) => return pending,
            Ok(Ok(_)) => {}
            other => panic!("no approval request arrived: {other:?}"),
        }
    }
}

#[tokio::test]
async fn worker_approval_is_answered_by_ui() {
    let bridge = started_bridge(ApprovalConfig::default()).await;
    let mut events = bridge.subscribe_approvals();

    let call = worker_asks(&bridge, "appr-1");
    let pending = next_requested(&mut events).await;
    assert_eq!(pending.request.id, "appr-1");
    assert_eq!(pending.request.preview.as_deref(), Some("cargo test --workspace"));
    assert_eq!(pending.expires_at_ms - pending.created_at_ms, 300_000);
    assert_eq!(bridge.list_approvals().len(), 1);

    bridge
        .respond_to_approval("appr-1", ApprovalResponse::approve().remembered())
        .unwrap();

    let reply = call.await.unwrap().unwrap();
    assert_eq!(reply, json!({"approved": true, "remember": true}));
    assert!(bridge.list_approvals().is_empty());

    bridge.stop().await;
}

#[tokio::test]
async fn denied_approval_reaches_worker() {
    let bridge = started_bridge(ApprovalConfig::default()).await;
    let mut events = bridge.subscribe_approvals();

    let call = worker_asks(&bridge, "appr-2");
    next_requested(&mut events).await;
    bridge
        .respond_to_approval("appr-2", ApprovalResponse::deny())
        .unwrap();

    let reply = call.await.unwrap().unwrap();
    assert_eq!(reply, json!({"approved": false, "remember": false}));

    bridge.stop().await;
}

#[tokio::test]
async fn cancelled_approval_is_an_error_for_worker() {
    let bridge = started_bridge(ApprovalConfig::default()).await;
    let mut events = bridge.subscribe_approvals();

    let call = worker_asks(&bridge, "appr-3");
    next_requested(&mut events).await;
    assert!(bridge.cancel_approval("appr-3"));

    match call.await.unwrap() {
        Err(RpcError::Remote { code, data, .. }) => {
            assert_eq!(code, -32000);
            assert_eq!(data.unwrap()["kind"], "cancelled");
        }
        other => panic!("expected remote error, got {other:?}"),
    }

    loop {
        match events.recv().await.unwrap() {
            ApprovalEvent::Resolved { id, outcome } => {
                assert_eq!(id, "appr-3");
                assert_eq!(outcome, ApprovalOutcome::Cancelled);
                break;
            }
            ApprovalEvent::Requested(_) => {}
        }
    }

    bridge.stop().await;
}

#[tokio::test]
async fn unanswered_approval_expires() {
    let approvals = ApprovalConfig {
        timeout: Duration::from_millis(300),
        ..ApprovalConfig::default()
    };
    let bridge = started_bridge(approvals).await;

    let call = worker_asks(&bridge, "appr-4");
    match call.await.unwrap() {
        Err(RpcError::Remote { data, .. }) => {
            assert_eq!(data.unwrap()["kind"], "timeout");
        }
        other => panic!("expected timeout error, got {other:?}"),
    }
    assert_eq!(bridge.get_status().pending_approvals, 0);
    assert!(
        bridge
            .respond_to_approval("appr-4", ApprovalResponse::approve())
            .is_err()
    );

    bridge.stop().await;
}

#[tokio::test]
async fn worker_exit_cancels_its_approval() {
    let bridge = started_bridge(ApprovalConfig::default()).await;
    let mut events = bridge.subscribe_approvals();

    let call = worker_asks(&bridge, "appr-5");
    next_requested(&mut events).await;

    bridge.stop().await;
    assert_eq!(call.await.unwrap(), Err(RpcError::NotRunning));

    let resolved = tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(
        resolved,
        ApprovalEvent::Resolved {
            id: "appr-5".into(),
            outcome: ApprovalOutcome::Cancelled,
        }
    );
    assert!(bridge.list_approvals().is_empty());
    assert!(
        bridge
            .respond_to_approval("appr-5", ApprovalResponse::approve())
            .is_err()
    );
}

#[tokio::test]
async fn ui_approvals_do_not_depend_on_worker() {
    let bridge = started_bridge(ApprovalConfig::default()).await;
    let ticket = bridge
        .approvals()
        .register(ApprovalRequest::new("ui-1", "deploy", "Deploy", RiskLevel::High))
        .unwrap();

    bridge.stop().await;
    assert_eq!(bridge.get_status().pending_approvals, 1);
    bridge
        .respond_to_approval("ui-1", ApprovalResponse::approve())
        .unwrap();
    assert_eq!(ticket.wait().await, Ok(ApprovalResponse::approve()));
}
