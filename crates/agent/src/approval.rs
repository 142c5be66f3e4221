//! Approval rendezvous between suspended tool calls and a human responder.

use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use proto::{ApprovalHandler, ApprovalRequest, ApprovalResult};
use tokio::sync::{oneshot, watch};
use tracing::{debug, warn};

struct PendingEntry {
    seq: u64,
    request: ApprovalRequest,
    responder: oneshot::Sender<ApprovalResult>,
}

/// Holds approval requests until someone answers them.
///
/// Each [`request`](ApprovalHandler::request_approval) suspends only its own
/// caller. Pending requests are kept in arrival order and published through a
/// watch channel every time the set changes, so a UI can render the queue.
pub struct ApprovalRendezvous {
    pending: Mutex<Vec<PendingEntry>>,
    published: watch::Sender<Vec<ApprovalRequest>>,
    next_seq: AtomicU64,
}

impl ApprovalRendezvous {
    pub fn new() -> Self {
        let (published, _) = watch::channel(Vec::new());
        Self {
            pending: Mutex::new(Vec::new()),
            published,
            next_seq: AtomicU64::new(0),
        }
    }

    /// Suspends until the request is answered.
    ///
    /// A request whose id is already pending is refused with `Denied` and the
    /// live request is left untouched. Dropping the returned future removes
    /// the request from the pending set.
    pub async fn request(&self, req: ApprovalRequest) -> ApprovalResult {
        let (tx, rx) = oneshot::channel();
        let id = req.id.clone();
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        {
            let mut pending = self.pending.lock();
            if pending.iter().any(|e| e.request.id == id) {
                warn!(id = %id, "Duplicate approval request refused");
                return ApprovalResult::Denied;
            }
            debug!(id = %id, tool = %req.tool_name, "Approval requested");
            pending.push(PendingEntry {
                seq,
                request: req,
                responder: tx,
            });
            self.publish(&pending);
        }

        let _guard = PendingGuard { owner: self, seq };
        // A dropped sender means the entry was discarded without an answer.
        rx.await.unwrap_or(ApprovalResult::Denied)
    }

    /// Answers one pending request. Unknown or already-answered ids are a no-op.
    pub fn respond(&self, id: &str, result: ApprovalResult) -> bool {
        let entry = {
            let mut pending = self.pending.lock();
            let Some(pos) = pending.iter().position(|e| e.request.id == id) else {
                debug!(id = %id, "Ignoring response for unknown approval id");
                return false;
            };
            let entry = pending.remove(pos);
            self.publish(&pending);
            entry
        };
        debug!(id = %id, ?result, "Approval resolved");
        entry.responder.send(result).is_ok()
    }

    /// Answers every request pending at the time of the call and returns how
    /// many were resolved. Requests arriving afterwards stay pending.
    pub fn respond_all(&self, result: ApprovalResult) -> usize {
        let drained: Vec<PendingEntry> = {
            let mut pending = self.pending.lock();
            let drained = std::mem::take(&mut *pending);
            self.publish(&pending);
            drained
        };
        let count = drained.len();
        for entry in drained {
            let _ = entry.responder.send(result);
        }
        debug!(count, ?result, "Resolved all pending approvals");
        count
    }

    /// Snapshot of pending requests in arrival order.
    pub fn pending(&self) -> Vec<ApprovalRequest> {
        self.pending
            .lock()
            .iter()
            .map(|e| e.request.clone())
            .collect()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    /// Receiver that observes every change of the pending set.
    pub fn subscribe(&self) -> watch::Receiver<Vec<ApprovalRequest>> {
        self.published.subscribe()
    }

    fn publish(&self, pending: &[PendingEntry]) {
        self.published
            .send_replace(pending.iter().map(|e| e.request.clone()).collect());
    }

    /// Ids can be reused once answered, so entries are matched by sequence.
    fn discard(&self, seq: u64) {
        let mut pending = self.pending.lock();
        if let Some(pos) = pending.iter().position(|e| e.seq == seq) {
            let entry = pending.remove(pos);
            self.publish(&pending);
            debug!(id = %entry.request.id, "Approval request abandoned");
        }
    }
}

impl Default for ApprovalRendezvous {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ApprovalHandler for ApprovalRendezvous {
    async fn request_approval(&self, req: ApprovalRequest) -> ApprovalResult {
        self.request(req).await
    }
}

/// Removes a request from the pending set when its waiter goes away.
struct PendingGuard<'a> {
    owner: &'a ApprovalRendezvous,
    seq: u64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.owner.discard(self.seq);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use serde_json::json;

    use super::*;

    fn req(tool: &str) -> ApprovalRequest {
        ApprovalRequest::new(tool, json!({}), format!("run {tool}"))
    }

    async fn wait_for_pending(rendezvous: &ApprovalRendezvous, n: usize) {
        let mut rx = rendezvous.subscribe();
        rx.wait_for(|pending| pending.len() >= n)
            .await
            .expect("rendezvous alive");
    }

    #[tokio::test]
    async fn respond_resolves_the_waiting_request() {
        let rendezvous = Arc::new(ApprovalRendezvous::new());
        let request = req("sms.send");
        let id = request.id.clone();

        let waiter = {
            let rendezvous = Arc::clone(&rendezvous);
            tokio::spawn(async move { rendezvous.request(request).await })
        };
        wait_for_pending(&rendezvous, 1).await;
        assert_eq!(rendezvous.pending()[0].id, id);

        assert!(rendezvous.respond(&id, ApprovalResult::Approved));
        assert_eq!(waiter.await.expect("join"), ApprovalResult::Approved);
        assert_eq!(rendezvous.pending_count(), 0);
    }

    #[tokio::test]
    async fn pending_size_tracks_requests_minus_resolutions() {
        let rendezvous = Arc::new(ApprovalRendezvous::new());
        let requests: Vec<ApprovalRequest> = (0..4).map(|i| req(&format!("tool.{i}"))).collect();
        let ids: Vec<String> = requests.iter().map(|r| r.id.clone()).collect();

        let mut waiters = Vec::new();
        for request in requests {
            let rendezvous = Arc::clone(&rendezvous);
            waiters.push(tokio::spawn(async move { rendezvous.request(request).await }));
            // Keep arrival order deterministic.
            tokio::task::yield_now().await;
        }
        wait_for_pending(&rendezvous, 4).await;
        assert_eq!(rendezvous.pending_count(), 4);

        assert!(rendezvous.respond(&ids[1], ApprovalResult::Denied));
        assert_eq!(rendezvous.pending_count(), 3);
        assert!(rendezvous.respond(&ids[3], ApprovalResult::Approved));
        assert_eq!(rendezvous.pending_count(), 2);
        let remaining: Vec<String> = rendezvous.pending().into_iter().map(|r| r.id).collect();
        assert!(remaining.contains(&ids[0]) && remaining.contains(&ids[2]));

        assert_eq!(rendezvous.respond_all(ApprovalResult::Approved), 2);
        let results: Vec<ApprovalResult> = futures_util::future::join_all(waiters)
            .await
            .into_iter()
            .map(|r| r.expect("join"))
            .collect();
        assert_eq!(
            results,
            vec![
                ApprovalResult::Approved,
                ApprovalResult::Denied,
                ApprovalResult::Approved,
                ApprovalResult::Approved
            ]
        );
    }

    #[tokio::test]
    async fn respond_is_idempotent_and_unknown_ids_are_ignored() {
        let rendezvous = Arc::new(ApprovalRendezvous::new());
        let request = req("sms.send");
        let id = request.id.clone();
        let waiter = {
            let rendezvous = Arc::clone(&rendezvous);
            tokio::spawn(async move { rendezvous.request(request).await })
        };
        wait_for_pending(&rendezvous, 1).await;

        assert!(!rendezvous.respond("no-such-id", ApprovalResult::Approved));
        assert_eq!(rendezvous.pending_count(), 1);

        assert!(rendezvous.respond(&id, ApprovalResult::Denied));
        assert!(!rendezvous.respond(&id, ApprovalResult::Approved));
        assert_eq!(waiter.await.expect("join"), ApprovalResult::Denied);
    }

    #[tokio::test]
    async fn respond_all_leaves_later_requests_pending() {
        let rendezvous = Arc::new(ApprovalRendezvous::new());
        let first = {
            let rendezvous = Arc::clone(&rendezvous);
            tokio::spawn(async move { rendezvous.request(req("a.one")).await })
        };
        wait_for_pending(&rendezvous, 1).await;
        assert_eq!(rendezvous.respond_all(ApprovalResult::AlwaysAllow), 1);
        assert_eq!(first.await.expect("join"), ApprovalResult::AlwaysAllow);

        let late_request = req("a.two");
        let late_id = late_request.id.clone();
        let late = {
            let rendezvous = Arc::clone(&rendezvous);
            tokio::spawn(async move { rendezvous.request(late_request).await })
        };
        wait_for_pending(&rendezvous, 1).await;
        assert_eq!(rendezvous.pending()[0].id, late_id);
        assert!(rendezvous.respond(&late_id, ApprovalResult::Denied));
        assert_eq!(late.await.expect("join"), ApprovalResult::Denied);
    }

    #[tokio::test]
    async fn cancelled_waiter_is_removed_from_pending() {
        let rendezvous = Arc::new(ApprovalRendezvous::new());
        let waiter = {
            let rendezvous = Arc::clone(&rendezvous);
            tokio::spawn(async move { rendezvous.request(req("sms.send")).await })
        };
        wait_for_pending(&rendezvous, 1).await;

        waiter.abort();
        let _ = waiter.await;
        let mut rx = rendezvous.subscribe();
        tokio::time::timeout(Duration::from_secs(1), rx.wait_for(|p| p.is_empty()))
            .await
            .expect("removed")
            .expect("alive");
        assert_eq!(rendezvous.pending_count(), 0);
    }

    #[tokio::test]
    async fn duplicate_id_is_refused_without_disturbing_original() {
        let rendezvous = Arc::new(ApprovalRendezvous::new());
        let original = req("sms.send");
        let duplicate = original.clone();
        let id = original.id.clone();

        let waiter = {
            let rendezvous = Arc::clone(&rendezvous);
            tokio::spawn(async move { rendezvous.request(original).await })
        };
        wait_for_pending(&rendezvous, 1).await;

        assert_eq!(rendezvous.request(duplicate).await, ApprovalResult::Denied);
        assert_eq!(rendezvous.pending_count(), 1);

        assert!(rendezvous.respond(&id, ApprovalResult::Approved));
        assert_eq!(waiter.await.expect("join"), ApprovalResult::Approved);
    }

    #[tokio::test]
    async fn stale_waiter_does_not_discard_a_reused_id() {
        let rendezvous = Arc::new(ApprovalRendezvous::new());
        let original = req("sms.send");
        let reused = original.clone();
        let id = original.id.clone();

        let mut first = Box::pin(rendezvous.request(original));
        assert!(futures_util::poll!(first.as_mut()).is_pending());
        assert!(rendezvous.respond(&id, ApprovalResult::Approved));

        let second = {
            let rendezvous = Arc::clone(&rendezvous);
            tokio::spawn(async move { rendezvous.request(reused).await })
        };
        wait_for_pending(&rendezvous, 1).await;

        // The answered waiter goes away only after its id was queued again.
        drop(first);
        assert_eq!(rendezvous.pending_count(), 1);

        assert!(rendezvous.respond(&id, ApprovalResult::AlwaysAllow));
        assert_eq!(second.await.expect("join"), ApprovalResult::AlwaysAllow);
    }

    #[tokio::test]
    async fn works_through_the_handler_trait() {
        let rendezvous = Arc::new(ApprovalRendezvous::new());
        let handler: Arc<dyn ApprovalHandler> = rendezvous.clone();
        let waiter = tokio::spawn(async move { handler.request_approval(req("camera.snap")).await });
        wait_for_pending(&rendezvous, 1).await;
        assert_eq!(rendezvous.respond_all(ApprovalResult::Approved), 1);
        assert_eq!(waiter.await.expect("join"), ApprovalResult::Approved);
    }
}
