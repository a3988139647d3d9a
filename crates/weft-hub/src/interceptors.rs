//! Read-only message interceptors.
//!
//! Interceptors observe routed traffic, globally or for a single agent. They
//! run on a dedicated worker task, off the routing critical path, and their
//! errors are logged and reported to the observability sink but never
//! propagated into routing.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use tokio::sync::mpsc;

use weft_observe::ObserverSink;
use weft_protocol::Message;
use weft_types::AgentId;

/// A read-only observer of routed messages.
///
/// Implementations must treat the message as an advisory observation: the
/// hub delivers messages independently of interceptor behavior, and the
/// invocation order relative to inbox delivery is unspecified.
pub trait Interceptor: Send + Sync {
    /// Observes one routed message.
    fn observe(&self, message: &Message) -> Result<(), InterceptorError>;
}

/// Failure inside an interceptor. Logged, never propagated.
#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct InterceptorError(pub String);

/// Handle for removing a previously added interceptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InterceptorId(u64);

type Registered = (InterceptorId, Arc<dyn Interceptor>);

pub(crate) struct Interceptors {
    next_id: AtomicU64,
    global: RwLock<Vec<Registered>>,
    by_agent: RwLock<HashMap<AgentId, Vec<Registered>>>,
}

impl Interceptors {
    pub(crate) fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            global: RwLock::new(Vec::new()),
            by_agent: RwLock::new(HashMap::new()),
        }
    }

    fn fresh_id(&self) -> InterceptorId {
        InterceptorId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    pub(crate) fn add_global(&self, interceptor: Arc<dyn Interceptor>) -> InterceptorId {
        let id = self.fresh_id();
        self.global
            .write()
            .expect("interceptor lock")
            .push((id, interceptor));
        id
    }

    pub(crate) fn add_for_agent(
        &self,
        agent_id: &AgentId,
        interceptor: Arc<dyn Interceptor>,
    ) -> InterceptorId {
        let id = self.fresh_id();
        self.by_agent
            .write()
            .expect("interceptor lock")
            .entry(agent_id.clone())
            .or_default()
            .push((id, interceptor));
        id
    }

    /// Removes an interceptor by id, wherever it is registered.
    /// Returns whether anything was removed.
    pub(crate) fn remove(&self, id: InterceptorId) -> bool {
        {
            let mut global = self.global.write().expect("interceptor lock");
            let before = global.len();
            global.retain(|(other, _)| *other != id);
            if global.len() < before {
                return true;
            }
        }
        let mut by_agent = self.by_agent.write().expect("interceptor lock");
        let mut removed = false;
        by_agent.retain(|_, entries| {
            let before = entries.len();
            entries.retain(|(other, _)| *other != id);
            removed |= entries.len() < before;
            !entries.is_empty()
        });
        removed
    }

    /// Drops all interceptors registered for one agent.
    pub(crate) fn clear_agent(&self, agent_id: &AgentId) {
        self.by_agent
            .write()
            .expect("interceptor lock")
            .remove(agent_id);
    }

    /// Invokes global interceptors, then those scoped to the receiver.
    pub(crate) fn dispatch(&self, message: &Message, sink: &dyn ObserverSink) {
        let global: Vec<Registered> = self.global.read().expect("interceptor lock").clone();
        for (_, interceptor) in &global {
            if let Err(e) = interceptor.observe(message) {
                tracing::warn!(error = %e, "global interceptor failed");
                sink.on_interceptor_error(None, &e.0);
            }
        }

        let scoped: Vec<Registered> = self
            .by_agent
            .read()
            .expect("interceptor lock")
            .get(&message.receiver_id)
            .cloned()
            .unwrap_or_default();
        for (_, interceptor) in &scoped {
            if let Err(e) = interceptor.observe(message) {
                tracing::warn!(
                    agent = %message.receiver_id,
                    error = %e,
                    "agent interceptor failed"
                );
                sink.on_interceptor_error(Some(&message.receiver_id), &e.0);
            }
        }
    }
}

/// Worker loop draining the interceptor queue.
pub(crate) async fn dispatch_worker(
    mut rx: mpsc::UnboundedReceiver<Message>,
    interceptors: Arc<Interceptors>,
    sink: Arc<dyn ObserverSink>,
) {
    while let Some(message) = rx.recv().await {
        sink.on_routed(&message);
        interceptors.dispatch(&message, sink.as_ref());
    }
    tracing::debug!("interceptor worker stopped");
}
