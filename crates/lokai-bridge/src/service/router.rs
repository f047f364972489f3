//! Handles requests the worker sends to the bridge.

use serde_json::{Value, json};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use lokai_core::jsonrpc::{INVALID_PARAMS, METHOD_NOT_FOUND, RpcResponse, SERVER_ERROR};

use crate::approval::{ApprovalError, ApprovalGateway, ApprovalRequest};
use crate::rpc::Correlator;
use crate::subprocess::InstanceRequest;

/// Worker method asking the user to approve an action.
pub const REQUEST_APPROVAL: &str = "request_approval";

/// Serve worker-originated requests until the supervisor goes away.
///
/// Each request runs on its own task; a pending approval must never hold up
/// record dispatch or other requests.
pub async fn route_requests(
    mut requests: mpsc::UnboundedReceiver<InstanceRequest>,
    approvals: ApprovalGateway,
) {
    while let Some(incoming) = requests.recv().await {
        let approvals = approvals.clone();
        tokio::spawn(async move {
            handle_request(incoming, &approvals).await;
        });
    }
    debug!("Request router finished");
}

async fn handle_request(incoming: InstanceRequest, approvals: &ApprovalGateway) {
    let InstanceRequest {
        request,
        correlator,
    } = incoming;

    let response = match request.method.as_str() {
        REQUEST_APPROVAL => {
            let Some(response) =
                request_approval(request.id, request.params, approvals, &correlator).await
            else {
                return;
            };
            response
        }
        other => {
            warn!(method = other, "Worker called unknown bridge method");
            RpcResponse::error(request.id, METHOD_NOT_FOUND, format!("Method not found: {other}"))
        }
    };

    if let Err(e) = correlator.respond(response).await {
        debug!(error = %e, "Worker gone before the bridge could answer");
    }
}

/// `None` when the worker instance ended first; its approval is cancelled
/// and there is nobody left to answer.
async fn request_approval(
    id: Value,
    params: Value,
    approvals: &ApprovalGateway,
    correlator: &Correlator,
) -> Option<RpcResponse> {
    let request: ApprovalRequest = match serde_json::from_value(params) {
        Ok(request) => request,
        Err(e) => {
            return Some(RpcResponse::error(
                id,
                INVALID_PARAMS,
                format!("Invalid approval request: {e}"),
            ));
        }
    };

    info!(approval_id = %request.id, action = %request.action, "Worker requested approval");
    let ticket = match approvals.register(request) {
        Ok(ticket) => ticket,
        Err(e) => return Some(approval_error(id, &e)),
    };
    let approval_id = ticket.id().to_string();

    tokio::select! {
        outcome = ticket.wait() => Some(match outcome {
            Ok(response) => RpcResponse::result(
                id,
                json!({"approved": response.approved, "remember": response.remember}),
            ),
            Err(e) => approval_error(id, &e),
        }),
        () = correlator.closed() => {
            if approvals.cancel(&approval_id) {
                info!(%approval_id, "Worker gone, approval cancelled");
            }
            None
        }
    }
}

fn approval_error(id: Value, e: &ApprovalError) -> RpcResponse {
    RpcResponse::error(id, SERVER_ERROR, e.to_string()).with_data(json!({"kind": e.kind()}))
}

#[cfg(test)]
#[allow(clippy::panic, clippy::unwrap_used)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use tokio::sync::watch;

    use super::*;
    use crate::approval::{ApprovalResponse, RiskLevel};
    use crate::rpc::WorkerRequest;
    use crate::subprocess::WorkerState;

    struct Harness {
        correlator: Arc<Correlator>,
        written: mpsc::Receiver<Vec<u8>>,
        state: watch::Sender<WorkerState>,
    }

    fn harness() -> Harness {
        let (writer, written) = mpsc::channel(8);
        let (state, state_rx) = watch::channel(WorkerState::Ready);
        let (correlator, _requests) = Correlator::new(writer, state_rx, Duration::from_secs(60));
        Harness {
            correlator: Arc::new(correlator),
            written,
            state,
        }
    }

    fn incoming(h: &Harness, method: &str, params: Value) -> InstanceRequest {
        InstanceRequest {
            request: WorkerRequest {
                id: json!(7),
                method: method.into(),
                params,
            },
            correlator: Arc::clone(&h.correlator),
        }
    }

    async fn written(h: &mut Harness) -> Value {
        serde_json::from_slice(&h.written.recv().await.unwrap()).unwrap()
    }

    #[tokio::test]
    async fn approval_request_is_answered_with_the_decision() {
        let mut h = harness();
        let approvals = ApprovalGateway::with_defaults();
        let params =
            serde_json::to_value(ApprovalRequest::new("r1", "delete", "rm -rf build", RiskLevel::High))
                .unwrap();

        let task = {
            let request = incoming(&h, REQUEST_APPROVAL, params);
            let approvals = approvals.clone();
            tokio::spawn(async move { handle_request(request, &approvals).await })
        };

        let mut events = approvals.subscribe();
        while !approvals.contains("r1") {
            let _ = events.recv().await;
        }
        approvals
            .respond("r1", ApprovalResponse::deny().remembered())
            .unwrap();
        task.await.unwrap();

        let reply = written(&mut h).await;
        assert_eq!(reply["id"], 7);
        assert_eq!(reply["result"], json!({"approved": false, "remember": true}));
    }

    #[tokio::test]
    async fn cancelled_approval_becomes_an_error_reply() {
        let mut h = harness();
        let approvals = ApprovalGateway::with_defaults();
        let params = json!({"id": "r2", "action": "a", "description": "d", "riskLevel": "low"});

        let task = {
            let request = incoming(&h, REQUEST_APPROVAL, params);
            let approvals = approvals.clone();
            tokio::spawn(async move { handle_request(request, &approvals).await })
        };
        let mut events = approvals.subscribe();
        while !approvals.contains("r2") {
            let _ = events.recv().await;
        }
        assert!(approvals.cancel("r2"));
        task.await.unwrap();

        let reply = written(&mut h).await;
        assert_eq!(reply["error"]["code"], SERVER_ERROR);
        assert_eq!(reply["error"]["data"]["kind"], "cancelled");
    }

    #[tokio::test]
    async fn ending_instance_cancels_its_approval() {
        let mut h = harness();
        let approvals = ApprovalGateway::with_defaults();
        let params = json!({"id": "r4", "action": "a", "description": "d", "riskLevel": "low"});

        let task = {
            let request = incoming(&h, REQUEST_APPROVAL, params);
            let approvals = approvals.clone();
            tokio::spawn(async move { handle_request(request, &approvals).await })
        };
        let mut events = approvals.subscribe();
        while !approvals.contains("r4") {
            let _ = events.recv().await;
        }

        h.state.send_replace(WorkerState::Crashed);
        task.await.unwrap();
        assert_eq!(approvals.count(), 0);
        assert!(h.written.try_recv().is_err());
    }

    #[tokio::test]
    async fn malformed_approval_params_are_invalid() {
        let mut h = harness();
        let approvals = ApprovalGateway::with_defaults();
        handle_request(incoming(&h, REQUEST_APPROVAL, json!({"id": "r3"})), &approvals).await;

        let reply = written(&mut h).await;
        assert_eq!(reply["error"]["code"], INVALID_PARAMS);
        assert_eq!(approvals.count(), 0);
    }

    #[tokio::test]
    async fn unknown_method_is_not_found() {
        let mut h = harness();
        let approvals = ApprovalGateway::with_defaults();
        handle_request(incoming(&h, "read_clipboard", Value::Null), &approvals).await;

        let reply = written(&mut h).await;
        assert_eq!(reply["id"], 7);
        assert_eq!(reply["error"]["code"], METHOD_NOT_FOUND);
    }
}
