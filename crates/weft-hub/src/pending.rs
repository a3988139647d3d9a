//! Pending-request tracking with late-response retention.
//!
//! Every directed request dispatched through [`Hub::send_and_wait`] parks an
//! entry here until a matching reply, a timeout, or a cancel closes it.
//! Closed entries linger for a retention window so that late responses remain
//! retrievable through polling, then the janitor evicts them.
//!
//! The table is striped: entries shard by request-id hash so concurrent
//! completions do not contend on one lock.
//!
//! [`Hub::send_and_wait`]: crate::Hub::send_and_wait

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tokio::sync::oneshot;

use weft_protocol::Message;
use weft_types::AgentId;

const SHARD_COUNT: usize = 16;

/// Lifecycle state of a pending request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestStatus {
    /// Waiting for a reply.
    Pending,
    /// A reply arrived in time and was delivered to the waiter.
    Completed,
    /// The deadline elapsed before a reply arrived.
    TimedOut,
    /// The request was canceled (agent unregistered or hub stopped).
    Failed,
    /// A reply arrived after the timeout and is held for polling.
    LateReceived,
}

/// Result of polling a request id.
#[derive(Debug, Clone)]
pub enum RequestPoll {
    /// Still waiting for a reply.
    Pending,
    /// Completed in time; the response is included.
    Completed(Message),
    /// Timed out; no reply has arrived yet.
    TimedOut,
    /// A reply arrived after the timeout.
    LateReceived(Message),
    /// Unknown id, or the entry aged out of the retention window.
    Unknown,
}

/// Outcome of feeding a reply into the table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CompleteOutcome {
    /// Delivered to a live waiter.
    Delivered,
    /// Stored as a late response.
    Late,
    /// No matching open entry for this receiver.
    NoMatch,
}

struct PendingEntry {
    requester_id: AgentId,
    target_id: AgentId,
    status: RequestStatus,
    waiter: Option<oneshot::Sender<Message>>,
    response: Option<Message>,
    closed_at: Option<Instant>,
}

/// Striped table of pending requests.
pub(crate) struct PendingTable {
    shards: Vec<Mutex<HashMap<String, PendingEntry>>>,
}

impl PendingTable {
    pub(crate) fn new() -> Self {
        Self {
            shards: (0..SHARD_COUNT).map(|_| Mutex::new(HashMap::new())).collect(),
        }
    }

    fn shard(&self, request_id: &str) -> &Mutex<HashMap<String, PendingEntry>> {
        let mut hasher = DefaultHasher::new();
        request_id.hash(&mut hasher);
        &self.shards[(hasher.finish() as usize) % SHARD_COUNT]
    }

    /// Parks a new pending request and returns the completion receiver.
    pub(crate) fn insert(
        &self,
        request_id: &str,
        requester_id: &AgentId,
        target_id: &AgentId,
    ) -> oneshot::Receiver<Message> {
        let (tx, rx) = oneshot::channel();
        let entry = PendingEntry {
            requester_id: requester_id.clone(),
            target_id: target_id.clone(),
            status: RequestStatus::Pending,
            waiter: Some(tx),
            response: None,
            closed_at: None,
        };
        self.shard(request_id)
            .lock()
            .expect("pending shard lock")
            .insert(request_id.to_string(), entry);
        rx
    }

    /// Feeds a reply addressed to `receiver_id` into the table.
    ///
    /// Delivers to the waiter when the entry is still pending; stores the
    /// reply as late when the entry already timed out.
    pub(crate) fn complete(&self, request_id: &str, message: &Message) -> CompleteOutcome {
        let mut shard = self.shard(request_id).lock().expect("pending shard lock");
        let Some(entry) = shard.get_mut(request_id) else {
            return CompleteOutcome::NoMatch;
        };
        // The reply must be addressed to whoever parked the request.
        if entry.requester_id != message.receiver_id {
            return CompleteOutcome::NoMatch;
        }

        match entry.status {
            RequestStatus::Pending => {
                entry.response = Some(message.clone());
                entry.status = RequestStatus::Completed;
                entry.closed_at = Some(Instant::now());
                if let Some(waiter) = entry.waiter.take() {
                    // A dropped receiver just means the waiter gave up; the
                    // stored response still answers later polls.
                    let _ = waiter.send(message.clone());
                }
                CompleteOutcome::Delivered
            }
            RequestStatus::TimedOut => {
                entry.response = Some(message.clone());
                entry.status = RequestStatus::LateReceived;
                entry.closed_at = Some(Instant::now());
                CompleteOutcome::Late
            }
            _ => CompleteOutcome::NoMatch,
        }
    }

    /// Flips a pending entry to timed-out, keeping it for late delivery.
    pub(crate) fn mark_timed_out(&self, request_id: &str) {
        let mut shard = self.shard(request_id).lock().expect("pending shard lock");
        if let Some(entry) = shard.get_mut(request_id) {
            if entry.status == RequestStatus::Pending {
                entry.status = RequestStatus::TimedOut;
                entry.closed_at = Some(Instant::now());
                entry.waiter = None;
            }
        }
    }

    /// Removes an entry outright (routing failed before dispatch).
    pub(crate) fn discard(&self, request_id: &str) {
        self.shard(request_id)
            .lock()
            .expect("pending shard lock")
            .remove(request_id);
    }

    /// Polls the state of a request id.
    pub(crate) fn poll(&self, request_id: &str) -> RequestPoll {
        let shard = self.shard(request_id).lock().expect("pending shard lock");
        match shard.get(request_id) {
            None => RequestPoll::Unknown,
            Some(entry) => match entry.status {
                RequestStatus::Pending => RequestPoll::Pending,
                RequestStatus::TimedOut => RequestPoll::TimedOut,
                RequestStatus::Failed => RequestPoll::Unknown,
                RequestStatus::Completed => match &entry.response {
                    Some(response) => RequestPoll::Completed(response.clone()),
                    None => RequestPoll::Unknown,
                },
                RequestStatus::LateReceived => match &entry.response {
                    Some(response) => RequestPoll::LateReceived(response.clone()),
                    None => RequestPoll::Unknown,
                },
            },
        }
    }

    /// Cancels every open request in which the agent participates, as
    /// requester or target. Waiters observe a closed channel.
    pub(crate) fn cancel_for_agent(&self, agent_id: &AgentId) {
        for shard in &self.shards {
            let mut shard = shard.lock().expect("pending shard lock");
            for entry in shard.values_mut() {
                if entry.status == RequestStatus::Pending
                    && (entry.requester_id == *agent_id || entry.target_id == *agent_id)
                {
                    entry.status = RequestStatus::Failed;
                    entry.closed_at = Some(Instant::now());
                    entry.waiter = None;
                }
            }
        }
    }

    /// Cancels every open request (hub shutdown).
    pub(crate) fn cancel_all(&self) {
        for shard in &self.shards {
            let mut shard = shard.lock().expect("pending shard lock");
            for entry in shard.values_mut() {
                if entry.status == RequestStatus::Pending {
                    entry.status = RequestStatus::Failed;
                    entry.closed_at = Some(Instant::now());
                    entry.waiter = None;
                }
            }
        }
    }

    /// Evicts closed entries older than the retention window.
    /// Returns how many were removed.
    pub(crate) fn evict_older_than(&self, retention: Duration) -> usize {
        let mut evicted = 0;
        for shard in &self.shards {
            let mut shard = shard.lock().expect("pending shard lock");
            shard.retain(|_, entry| match entry.closed_at {
                Some(closed_at) => {
                    let keep = closed_at.elapsed() <= retention;
                    if !keep {
                        evicted += 1;
                    }
                    keep
                }
                None => true,
            });
        }
        evicted
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.shards
            .iter()
            .map(|s| s.lock().expect("pending shard lock").len())
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use weft_identity::AgentIdentity;
    use weft_protocol::MessageMetadata;
    use weft_types::MessageKind;

    fn reply(receiver: &str, request_id: &str) -> Message {
        let identity = AgentIdentity::generate();
        Message::signed(
            "responder",
            receiver,
            "result",
            MessageKind::Response,
            MessageMetadata::for_request(request_id),
            &identity,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn complete_delivers_to_waiter() {
        let table = PendingTable::new();
        let rx = table.insert("req-1", &"alice".to_string(), &"bob".to_string());

        let outcome = table.complete("req-1", &reply("alice", "req-1"));
        assert_eq!(outcome, CompleteOutcome::Delivered);
        let delivered = rx.await.unwrap();
        assert_eq!(delivered.content, "result");

        assert!(matches!(table.poll("req-1"), RequestPoll::Completed(_)));
    }

    #[tokio::test]
    async fn reply_to_wrong_receiver_is_ignored() {
        let table = PendingTable::new();
        let _rx = table.insert("req-1", &"alice".to_string(), &"bob".to_string());

        let outcome = table.complete("req-1", &reply("mallory", "req-1"));
        assert_eq!(outcome, CompleteOutcome::NoMatch);
        assert!(matches!(table.poll("req-1"), RequestPoll::Pending));
    }

    #[tokio::test]
    async fn late_reply_after_timeout_is_retained() {
        let table = PendingTable::new();
        let _rx = table.insert("req-1", &"alice".to_string(), &"bob".to_string());

        table.mark_timed_out("req-1");
        assert!(matches!(table.poll("req-1"), RequestPoll::TimedOut));

        let outcome = table.complete("req-1", &reply("alice", "req-1"));
        assert_eq!(outcome, CompleteOutcome::Late);
        match table.poll("req-1") {
            RequestPoll::LateReceived(message) => assert_eq!(message.content, "result"),
            other => panic!("expected LateReceived, got {other:?}"),
        }
        // Polling is idempotent within the retention window.
        assert!(matches!(table.poll("req-1"), RequestPoll::LateReceived(_)));
    }

    #[tokio::test]
    async fn cancel_for_agent_closes_waiters() {
        let table = PendingTable::new();
        let rx = table.insert("req-1", &"alice".to_string(), &"bob".to_string());
        table.cancel_for_agent(&"alice".to_string());

        assert!(rx.await.is_err());
        assert!(matches!(table.poll("req-1"), RequestPoll::Unknown));
    }

    #[tokio::test]
    async fn cancel_for_target_also_closes() {
        let table = PendingTable::new();
        let rx = table.insert("req-1", &"alice".to_string(), &"bob".to_string());
        table.cancel_for_agent(&"bob".to_string());
        assert!(rx.await.is_err());
    }

    #[tokio::test]
    async fn eviction_drops_only_closed_entries() {
        let table = PendingTable::new();
        let _rx1 = table.insert("req-1", &"alice".to_string(), &"bob".to_string());
        let _rx2 = table.insert("req-2", &"alice".to_string(), &"bob".to_string());
        table.mark_timed_out("req-1");

        // Zero retention evicts everything already closed.
        let evicted = table.evict_older_than(Duration::from_secs(0));
        assert_eq!(evicted, 1);
        assert_eq!(table.len(), 1);
        assert!(matches!(table.poll("req-1"), RequestPoll::Unknown));
        assert!(matches!(table.poll("req-2"), RequestPoll::Pending));
    }

    #[tokio::test]
    async fn unknown_id_polls_unknown() {
        let table = PendingTable::new();
        assert!(matches!(table.poll("nope"), RequestPoll::Unknown));
    }
}
