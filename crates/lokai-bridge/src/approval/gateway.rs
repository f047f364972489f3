//! Pending approval table with per-entry expiry.
//!
//! Every way out of the table (response, cancellation, expiry) removes the
//! entry under the lock first; only the path that removed it resolves the
//! requester, so resolution is exactly-once.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::types::{
    ApprovalConfig, ApprovalError, ApprovalEvent, ApprovalOutcome, ApprovalRequest,
    ApprovalResponse, PendingApproval,
};

type Resolution = Result<ApprovalResponse, ApprovalError>;

struct Entry {
    snapshot: PendingApproval,
    /// Distinguishes this entry from a later one that reuses the id.
    generation: u64,
    tx: oneshot::Sender<Resolution>,
    timer: JoinHandle<()>,
}

#[derive(Default)]
struct Table {
    entries: HashMap<String, Entry>,
    next_generation: u64,
}

/// Mailbox of approval requests awaiting a UI decision.
///
/// Cheap to clone; clones share the same table.
#[derive(Clone)]
pub struct ApprovalGateway {
    table: Arc<Mutex<Table>>,
    events: broadcast::Sender<ApprovalEvent>,
    config: ApprovalConfig,
}

/// Completion slot returned by [`ApprovalGateway::register`].
#[derive(Debug)]
pub struct ApprovalTicket {
    id: String,
    rx: oneshot::Receiver<Resolution>,
}

impl ApprovalTicket {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Wait for the decision, a cancellation, or expiry.
    pub async fn wait(self) -> Result<ApprovalResponse, ApprovalError> {
        self.rx
            .await
            .unwrap_or(Err(ApprovalError::Cancelled { id: self.id }))
    }
}

impl ApprovalGateway {
    pub fn new(config: ApprovalConfig) -> Self {
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        Self {
            table: Arc::new(Mutex::new(Table::default())),
            events,
            config,
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(ApprovalConfig::default())
    }

    /// Store a request and start its expiry timer.
    ///
    /// Must be called within a Tokio runtime.
    pub fn register(&self, request: ApprovalRequest) -> Result<ApprovalTicket, ApprovalError> {
        let id = request.id.clone();
        let (tx, rx) = oneshot::channel();

        let snapshot = {
            let mut table = lock(&self.table);
            if table.entries.contains_key(&id) {
                return Err(ApprovalError::AlreadyPending { id });
            }
            table.next_generation += 1;
            let generation = table.next_generation;

            let created_at_ms = now_ms();
            let snapshot = PendingApproval {
                request,
                created_at_ms,
                expires_at_ms: created_at_ms.saturating_add(millis(self.config.timeout)),
            };
            let timer = tokio::spawn(expire_after(
                Arc::downgrade(&self.table),
                self.events.clone(),
                id.clone(),
                generation,
                self.config.timeout,
            ));
            table.entries.insert(
                id.clone(),
                Entry {
                    snapshot: snapshot.clone(),
                    generation,
                    tx,
                    timer,
                },
            );
            snapshot
        };

        info!(
            approval_id = %id,
            action = %snapshot.request.action,
            risk = ?snapshot.request.risk_level,
            "Approval requested"
        );
        let _ = self.events.send(ApprovalEvent::Requested(snapshot));
        Ok(ApprovalTicket { id, rx })
    }

    /// Register a request and wait for its resolution.
    pub async fn request(&self, request: ApprovalRequest) -> Result<ApprovalResponse, ApprovalError> {
        self.register(request)?.wait().await
    }

    /// Deliver a decision. A denial is a successful response with
    /// `approved: false`.
    pub fn respond(&self, id: &str, response: ApprovalResponse) -> Result<(), ApprovalError> {
        let entry = lock(&self.table)
            .entries
            .remove(id)
            .ok_or_else(|| ApprovalError::NotFound { id: id.to_string() })?;
        entry.timer.abort();

        let outcome = if response.approved {
            ApprovalOutcome::Approved
        } else {
            ApprovalOutcome::Denied
        };
        info!(approval_id = %id, ?outcome, remember = response.remember, "Approval resolved");
        if entry.tx.send(Ok(response)).is_err() {
            debug!(approval_id = %id, "Requester no longer waiting");
        }
        self.emit_resolved(id, outcome);
        Ok(())
    }

    /// Cancel a pending request. Returns `false` if it was not pending.
    pub fn cancel(&self, id: &str) -> bool {
        let Some(entry) = lock(&self.table).entries.remove(id) else {
            return false;
        };
        entry.timer.abort();
        info!(approval_id = %id, "Approval cancelled");
        let _ = entry.tx.send(Err(ApprovalError::Cancelled { id: id.to_string() }));
        self.emit_resolved(id, ApprovalOutcome::Cancelled);
        true
    }

    /// Pending requests, oldest first.
    pub fn list(&self) -> Vec<PendingApproval> {
        let table = lock(&self.table);
        let mut entries: Vec<_> = table.entries.values().collect();
        entries.sort_by_key(|e| (e.snapshot.created_at_ms, e.generation));
        entries.into_iter().map(|e| e.snapshot.clone()).collect()
    }

    pub fn count(&self) -> usize {
        lock(&self.table).entries.len()
    }

    pub fn contains(&self, id: &str) -> bool {
        lock(&self.table).entries.contains_key(id)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ApprovalEvent> {
        self.events.subscribe()
    }

    fn emit_resolved(&self, id: &str, outcome: ApprovalOutcome) {
        let _ = self.events.send(ApprovalEvent::Resolved {
            id: id.to_string(),
            outcome,
        });
    }
}

impl Default for ApprovalGateway {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl std::fmt::Debug for ApprovalGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApprovalGateway")
            .field("pending", &self.count())
            .field("timeout", &self.config.timeout)
            .finish_non_exhaustive()
    }
}

async fn expire_after(
    table: Weak<Mutex<Table>>,
    events: broadcast::Sender<ApprovalEvent>,
    id: String,
    generation: u64,
    timeout: Duration,
) {
    tokio::time::sleep(timeout).await;

    let Some(table) = table.upgrade() else {
        return;
    };
    let entry = {
        let mut table = lock(&table);
        let current = table
            .entries
            .get(&id)
            .is_some_and(|e| e.generation == generation);
        if current { table.entries.remove(&id) } else { None }
    };
    let Some(entry) = entry else {
        return;
    };

    warn!(approval_id = %id, "Approval expired");
    let _ = entry.tx.send(Err(ApprovalError::Timeout { id: id.clone() }));
    let _ = events.send(ApprovalEvent::Resolved {
        id,
        outcome: ApprovalOutcome::TimedOut,
    });
}

fn lock(table: &Mutex<Table>) -> MutexGuard<'_, Table> {
    table.lock().unwrap_or_else(PoisonError::into_inner)
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, millis)
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
#[allow(clippy::panic, clippy::unwrap_used)]
mod tests {
    use tokio::time::Instant;

    use super::*;
    use crate::approval::types::RiskLevel;

    fn request(id: &str) -> ApprovalRequest {
        ApprovalRequest::new(id, "write_file", "Write notes.md", RiskLevel::High)
    }

    #[tokio::test(start_paused = true)]
    async fn respond_resolves_the_requester() {
        let gateway = ApprovalGateway::with_defaults();
        let mut events = gateway.subscribe();
        let ticket = gateway.register(request("r1")).unwrap();

        gateway
            .respond("r1", ApprovalResponse::approve().remembered())
            .unwrap();
        let response = ticket.wait().await.unwrap();
        assert!(response.approved);
        assert!(response.remember);
        assert_eq!(gateway.count(), 0);

        assert!(matches!(events.recv().await.unwrap(), ApprovalEvent::Requested(p) if p.request.id == "r1"));
        assert_eq!(
            events.recv().await.unwrap(),
            ApprovalEvent::Resolved {
                id: "r1".into(),
                outcome: ApprovalOutcome::Approved,
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn denial_is_a_successful_resolution() {
        let gateway = ApprovalGateway::with_defaults();
        let ticket = gateway.register(request("r1")).unwrap();
        gateway.respond("r1", ApprovalResponse::deny()).unwrap();
        assert_eq!(ticket.wait().await, Ok(ApprovalResponse::deny()));
    }

    #[tokio::test(start_paused = true)]
    async fn duplicate_id_is_rejected_while_pending() {
        let gateway = ApprovalGateway::with_defaults();
        let _first = gateway.register(request("r1")).unwrap();

        let err = gateway.request(request("r1")).await.unwrap_err();
        assert_eq!(err, ApprovalError::AlreadyPending { id: "r1".into() });
        assert_eq!(gateway.count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn unanswered_request_times_out_at_five_minutes() {
        let gateway = ApprovalGateway::with_defaults();
        let started = Instant::now();
        let ticket = gateway.register(request("r1")).unwrap();

        tokio::time::sleep(Duration::from_secs(299)).await;
        assert!(gateway.contains("r1"));

        let err = ticket.wait().await.unwrap_err();
        assert_eq!(err, ApprovalError::Timeout { id: "r1".into() });
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_secs(300));
        assert!(elapsed < Duration::from_secs(301));
        assert_eq!(gateway.count(), 0);

        assert_eq!(
            gateway.respond("r1", ApprovalResponse::approve()),
            Err(ApprovalError::NotFound { id: "r1".into() })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_is_distinct_from_timeout_and_denial() {
        let gateway = ApprovalGateway::with_defaults();
        let mut events = gateway.subscribe();
        let ticket = gateway.register(request("r1")).unwrap();

        assert!(gateway.cancel("r1"));
        assert!(!gateway.cancel("r1"));
        assert_eq!(
            ticket.wait().await,
            Err(ApprovalError::Cancelled { id: "r1".into() })
        );

        let _requested = events.recv().await.unwrap();
        assert_eq!(
            events.recv().await.unwrap(),
            ApprovalEvent::Resolved {
                id: "r1".into(),
                outcome: ApprovalOutcome::Cancelled,
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn respond_to_unknown_id_is_not_found() {
        let gateway = ApprovalGateway::with_defaults();
        assert_eq!(
            gateway.respond("nope", ApprovalResponse::approve()),
            Err(ApprovalError::NotFound { id: "nope".into() })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn stale_timer_does_not_expire_a_reused_id() {
        let gateway = ApprovalGateway::with_defaults();
        let started = Instant::now();
        let _first = gateway.register(request("r1")).unwrap();

        tokio::time::sleep(Duration::from_secs(200)).await;
        gateway.respond("r1", ApprovalResponse::approve()).unwrap();
        let second = gateway.register(request("r1")).unwrap();

        // Past the first entry's deadline, the second is still pending.
        tokio::time::sleep(Duration::from_secs(150)).await;
        assert!(gateway.contains("r1"));

        assert_eq!(
            second.wait().await,
            Err(ApprovalError::Timeout { id: "r1".into() })
        );
        assert!(started.elapsed() >= Duration::from_secs(500));
    }

    #[tokio::test(start_paused = true)]
    async fn list_is_a_snapshot_in_creation_order() {
        let gateway = ApprovalGateway::with_defaults();
        let _a = gateway.register(request("a")).unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        let _b = gateway.register(request("b")).unwrap();

        let listed = gateway.list();
        let ids: Vec<_> = listed.iter().map(|p| p.request.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
        for pending in &listed {
            assert_eq!(pending.expires_at_ms - pending.created_at_ms, 300_000);
        }
        assert_eq!(gateway.count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn configured_timeout_is_honoured() {
        let gateway = ApprovalGateway::new(ApprovalConfig {
            timeout: Duration::from_secs(10),
            ..ApprovalConfig::default()
        });
        let started = Instant::now();
        let result = gateway.request(request("r1")).await;
        assert_eq!(result, Err(ApprovalError::Timeout { id: "r1".into() }));
        assert!(started.elapsed() >= Duration::from_secs(10));
    }
}
