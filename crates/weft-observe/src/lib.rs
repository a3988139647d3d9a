//! Observability seam for the Weft fabric.
//!
//! The hub reports routing activity, interceptor failures, cooldowns, and
//! late responses through an [`ObserverSink`]. The default sink does nothing;
//! deployments plug in metrics or event-log implementations without the
//! fabric knowing about them.
//!
//! Sink calls happen on the hub's interceptor worker, off the routing
//! critical path, but implementations should still return quickly.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use weft_protocol::Message;
use weft_types::AgentId;

/// Receiver of fabric-level observability events.
pub trait ObserverSink: Send + Sync {
    /// A message passed the routing checks and was enqueued for delivery.
    fn on_routed(&self, _message: &Message) {}

    /// An interceptor returned an error; routing was unaffected.
    fn on_interceptor_error(&self, _agent_id: Option<&AgentId>, _error: &str) {}

    /// An agent entered cooldown for the given duration.
    fn on_cooldown(&self, _agent_id: &AgentId, _duration: Duration) {}

    /// A response arrived for a request that had already timed out.
    fn on_late_response(&self, _request_id: &str) {}

    /// An inbox was full and the router returned backpressure to the sender.
    fn on_backpressure(&self, _sender_id: &AgentId, _receiver_id: &AgentId) {}
}

/// Sink that ignores every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSink;

impl ObserverSink for NoopSink {}

/// Sink that counts events, for tests and smoke checks.
#[derive(Debug, Default)]
pub struct CountingSink {
    pub routed: AtomicU64,
    pub interceptor_errors: AtomicU64,
    pub cooldowns: AtomicU64,
    pub late_responses: AtomicU64,
    pub backpressure: AtomicU64,
}

impl CountingSink {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ObserverSink for CountingSink {
    fn on_routed(&self, _message: &Message) {
        self.routed.fetch_add(1, Ordering::Relaxed);
    }

    fn on_interceptor_error(&self, agent_id: Option<&AgentId>, error: &str) {
        tracing::debug!(?agent_id, error, "interceptor error observed");
        self.interceptor_errors.fetch_add(1, Ordering::Relaxed);
    }

    fn on_cooldown(&self, _agent_id: &AgentId, _duration: Duration) {
        self.cooldowns.fetch_add(1, Ordering::Relaxed);
    }

    fn on_late_response(&self, _request_id: &str) {
        self.late_responses.fetch_add(1, Ordering::Relaxed);
    }

    fn on_backpressure(&self, _sender_id: &AgentId, _receiver_id: &AgentId) {
        self.backpressure.fetch_add(1, Ordering::Relaxed);
    }
}
