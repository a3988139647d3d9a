//! The communication hub: the single point through which all inter-agent
//! messages flow.
//!
//! The hub never synthesizes conversation content; it authenticates, routes,
//! correlates, and observes:
//!
//! - **Routing**: verifies the sender's signature against its registered
//!   identity, then enqueues into the receiver's bounded inbox. A full inbox
//!   surfaces [`HubError::Backpressure`] to the caller instead of silently
//!   dropping.
//! - **Collaboration chains**: the hub is the sole authority appending to a
//!   request's collaboration chain, and rejects requests whose target is
//!   already on the chain.
//! - **Request correlation**: [`Hub::send_and_wait`] parks a pending request
//!   until a matching reply or the deadline; replies arriving after a timeout
//!   are retained for polling through [`Hub::check_late_result`].
//! - **Interceptors**: read-only observers fan out on a dedicated worker
//!   task, off the routing critical path.
//!
//! Agents hold an `Arc<Hub>` for outbound operations; the hub holds only
//! inbox send handles and stop signals, never agent state, so there is no
//! reference cycle between the two.

mod history;
mod interceptors;
mod pending;

pub use interceptors::{Interceptor, InterceptorError, InterceptorId};
pub use pending::{RequestPoll, RequestStatus};

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::sync::{mpsc, watch, RwLock};
use tokio::task::JoinHandle;

use weft_identity::AgentIdentity;
use weft_observe::ObserverSink;
use weft_protocol::{CollaborationProtocol, Message, MessageMetadata, Protocol, ProtocolError};
use weft_registry::{AgentRegistration, DiscoveryOptions, Registry, RegistryError};
use weft_types::{AgentId, DiscoveredAgent, MessageKind};

use history::History;
use interceptors::Interceptors;
use pending::{CompleteOutcome, PendingTable};

/// Reserved sender id for hub-originated notices.
pub const HUB_AGENT_ID: &str = "hub";

/// Errors surfaced by hub operations.
#[derive(Debug, thiserror::Error)]
pub enum HubError {
    /// The hub is stopping and accepts no new work.
    #[error("hub is shutting down")]
    ShuttingDown,

    /// The agent id collides with the hub's reserved id.
    #[error("agent id '{0}' is reserved")]
    ReservedAgentId(AgentId),

    /// The message sender is not registered.
    #[error("sender '{0}' is not registered")]
    UnknownSender(AgentId),

    /// The message receiver is not registered.
    #[error("receiver '{0}' is not registered")]
    UnknownReceiver(AgentId),

    /// The message signature did not verify against the sender's identity.
    #[error("signature verification failed for sender '{0}'")]
    AuthenticationFailure(AgentId),

    /// The collaboration request targets an agent already on its chain.
    #[error("collaboration loop: '{0}' is already on the chain")]
    CollaborationLoop(AgentId),

    /// The receiver's inbox is full.
    #[error("inbox for '{0}' is full")]
    Backpressure(AgentId),

    /// The pending request was canceled before completion.
    #[error("request '{0}' was canceled")]
    Canceled(String),

    /// The message failed protocol validation.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// A registry operation failed.
    #[error(transparent)]
    Registry(#[from] RegistryError),
}

/// Tuning knobs for a hub instance.
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Bound of each agent inbox.
    pub inbox_capacity: usize,
    /// Bound of the in-memory message history ring.
    pub history_capacity: usize,
    /// How long closed pending requests stay pollable.
    pub late_retention: Duration,
    /// How often the janitor sweeps expired pending requests.
    pub janitor_interval: Duration,
    /// How long a timed-out partner is excluded from discovery results.
    pub timeout_partner_ttl: Duration,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            inbox_capacity: 128,
            history_capacity: 256,
            late_retention: Duration::from_secs(15 * 60),
            janitor_interval: Duration::from_secs(60),
            timeout_partner_ttl: Duration::from_secs(5 * 60),
        }
    }
}

/// Receiving side of an agent's hub registration.
#[derive(Debug)]
pub struct AgentMailbox {
    /// The agent's bounded inbox.
    pub inbox: mpsc::Receiver<Message>,
    /// Flips to `true` when the hub asks the agent to stop.
    pub stop: watch::Receiver<bool>,
}

/// Outcome of a [`Hub::send_and_wait`] call.
#[derive(Debug)]
pub enum SendOutcome {
    /// The reply arrived before the deadline.
    Completed(Message),
    /// The deadline elapsed; the request id can be polled for a late reply.
    TimedOut,
    /// The request never dispatched or was canceled mid-flight.
    Failed(HubError),
}

struct AgentHandle {
    sender: mpsc::Sender<Message>,
    stop: watch::Sender<bool>,
}

/// The routing hub.
pub struct Hub {
    registry: Arc<Registry>,
    config: HubConfig,
    identity: AgentIdentity,
    protocol: CollaborationProtocol,
    sink: Arc<dyn ObserverSink>,
    agents: RwLock<HashMap<AgentId, AgentHandle>>,
    pending: Arc<PendingTable>,
    interceptors: Arc<Interceptors>,
    intercept_tx: mpsc::UnboundedSender<Message>,
    history: Mutex<History>,
    timeout_partners: Mutex<HashMap<AgentId, HashMap<AgentId, Instant>>>,
    closed: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Hub {
    /// Creates a hub over a registry and starts its background workers.
    pub fn new(registry: Arc<Registry>, config: HubConfig, sink: Arc<dyn ObserverSink>) -> Arc<Self> {
        let interceptors = Arc::new(Interceptors::new());
        let pending = Arc::new(PendingTable::new());
        let (intercept_tx, intercept_rx) = mpsc::unbounded_channel();

        let worker = tokio::spawn(interceptors::dispatch_worker(
            intercept_rx,
            interceptors.clone(),
            sink.clone(),
        ));
        let janitor = tokio::spawn(janitor_loop(
            pending.clone(),
            config.janitor_interval,
            config.late_retention,
        ));

        let history = History::new(config.history_capacity);
        Arc::new(Self {
            registry,
            config,
            identity: AgentIdentity::generate(),
            protocol: CollaborationProtocol::new(),
            sink,
            agents: RwLock::new(HashMap::new()),
            pending,
            interceptors,
            intercept_tx,
            history: Mutex::new(history),
            timeout_partners: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
            tasks: Mutex::new(vec![worker, janitor]),
        })
    }

    /// The registry this hub routes against.
    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Registers an agent and wires up its inbox.
    ///
    /// The returned [`AgentMailbox`] is the receiving side; the hub keeps
    /// only the send handle and the stop trigger.
    pub async fn register_agent(
        &self,
        registration: AgentRegistration,
    ) -> Result<AgentMailbox, HubError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(HubError::ShuttingDown);
        }
        let agent_id = registration.profile.agent_id.clone();
        if agent_id == HUB_AGENT_ID {
            return Err(HubError::ReservedAgentId(agent_id));
        }

        self.registry.register(registration).await?;

        let (sender, inbox) = mpsc::channel(self.config.inbox_capacity);
        let (stop_tx, stop_rx) = watch::channel(false);
        self.agents
            .write()
            .await
            .insert(agent_id.clone(), AgentHandle { sender, stop: stop_tx });

        tracing::info!(agent = %agent_id, "agent connected to hub");
        Ok(AgentMailbox {
            inbox,
            stop: stop_rx,
        })
    }

    /// Unregisters an agent: signals its runtime to stop, cancels its
    /// pending requests, drops its interceptors, and removes it from the
    /// registry. Idempotent.
    ///
    /// The stopping runtime drains its inbox concurrently; its shutdown
    /// notices take [`Hub::deliver_error_notice`], which does not depend on
    /// the agent still being registered, so registry removal here cannot
    /// race the drain.
    pub async fn unregister_agent(&self, agent_id: &AgentId) -> Result<(), HubError> {
        if let Some(handle) = self.agents.write().await.remove(agent_id) {
            let _ = handle.stop.send(true);
            // Dropping the handle closes the inbox; the runtime drains what
            // is left and exits.
        }
        self.interceptors.clear_agent(agent_id);
        self.pending.cancel_for_agent(agent_id);
        self.registry.unregister(agent_id).await?;
        tracing::info!(agent = %agent_id, "agent disconnected from hub");
        Ok(())
    }

    /// Whether an agent currently has a live inbox on this hub.
    pub async fn is_connected(&self, agent_id: &AgentId) -> bool {
        self.agents.read().await.contains_key(agent_id)
    }

    /// Routes a message: validate, authenticate, chain-check, enqueue.
    ///
    /// Synchronous up to the enqueue: delivery and interceptor fan-out happen
    /// asynchronously after this returns.
    pub async fn route(&self, message: Message) -> Result<(), HubError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(HubError::ShuttingDown);
        }

        self.protocol.validate(&message)?;

        let sender_id = message.sender_id.clone();
        let receiver_id = message.receiver_id.clone();

        let Some(sender_registration) = self.registry.get(&sender_id).await else {
            return Err(HubError::UnknownSender(sender_id));
        };

        if !self.is_connected(&receiver_id).await {
            self.notify_sender(
                &sender_id,
                format!("receiver '{receiver_id}' is not registered"),
                "UNKNOWN_RECEIVER",
            )
            .await;
            return Err(HubError::UnknownReceiver(receiver_id));
        }

        if !message.verify_with(&sender_registration.identity) {
            tracing::warn!(sender = %sender_id, id = %message.id, "dropping message with bad signature");
            self.notify_sender(
                &sender_id,
                "message signature verification failed".to_string(),
                "AUTHENTICATION_FAILURE",
            )
            .await;
            return Err(HubError::AuthenticationFailure(sender_id));
        }

        let mut message = message;
        if message.kind == MessageKind::RequestCollaboration {
            let chain = message
                .metadata
                .collaboration_chain
                .get_or_insert_with(Vec::new);
            if chain.contains(&receiver_id) {
                self.notify_sender(
                    &sender_id,
                    format!("collaboration loop: '{receiver_id}' is already on the chain"),
                    "COLLABORATION_LOOP",
                )
                .await;
                return Err(HubError::CollaborationLoop(receiver_id));
            }
            if !chain.contains(&sender_id) {
                chain.push(sender_id.clone());
            }
        }

        let receiver_sender = {
            let agents = self.agents.read().await;
            match agents.get(&receiver_id) {
                Some(handle) => handle.sender.clone(),
                None => return Err(HubError::UnknownReceiver(receiver_id)),
            }
        };

        match receiver_sender.try_send(message.clone()) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.sink.on_backpressure(&sender_id, &receiver_id);
                tracing::warn!(sender = %sender_id, receiver = %receiver_id, "inbox full, backpressure");
                return Err(HubError::Backpressure(receiver_id));
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                return Err(HubError::UnknownReceiver(receiver_id));
            }
        }

        self.registry.touch(&sender_id).await;
        self.history.lock().expect("history lock").push(message.clone());
        let _ = self.intercept_tx.send(message.clone());

        if message.kind.is_reply() {
            if let Some(request_id) = message.metadata.request_id.clone() {
                match self.pending.complete(&request_id, &message) {
                    CompleteOutcome::Delivered => {
                        tracing::debug!(request = %request_id, "pending request completed");
                    }
                    CompleteOutcome::Late => {
                        tracing::info!(request = %request_id, "late response retained");
                        self.sink.on_late_response(&request_id);
                    }
                    CompleteOutcome::NoMatch => {}
                }
            }
        }

        tracing::debug!(
            sender = %sender_id,
            receiver = %receiver_id,
            kind = message.kind.label(),
            "message routed"
        );
        Ok(())
    }

    /// Routes a directed request and waits for the matching reply.
    ///
    /// The request must carry `metadata.requestId`. On timeout the request is
    /// retained: the returned id can be polled via [`Hub::check_late_result`]
    /// and the partner is excluded from the requester's discovery results for
    /// a while.
    pub async fn send_and_wait(
        &self,
        request: Message,
        timeout: Duration,
    ) -> (SendOutcome, String) {
        let Some(request_id) = request.metadata.request_id.clone() else {
            return (
                SendOutcome::Failed(HubError::Protocol(ProtocolError::MissingRequestId(
                    request.kind,
                ))),
                String::new(),
            );
        };
        let requester_id = request.sender_id.clone();
        let target_id = request.receiver_id.clone();

        let receiver = self.pending.insert(&request_id, &requester_id, &target_id);

        if let Err(e) = self.route(request).await {
            self.pending.discard(&request_id);
            return (SendOutcome::Failed(e), request_id);
        }

        match tokio::time::timeout(timeout, receiver).await {
            Ok(Ok(response)) => (SendOutcome::Completed(response), request_id),
            Ok(Err(_)) => (
                SendOutcome::Failed(HubError::Canceled(request_id.clone())),
                request_id,
            ),
            Err(_) => {
                self.pending.mark_timed_out(&request_id);
                self.record_timeout_partner(&requester_id, &target_id);
                tracing::warn!(
                    request = %request_id,
                    requester = %requester_id,
                    target = %target_id,
                    "request timed out, retaining slot for late delivery"
                );
                (SendOutcome::TimedOut, request_id)
            }
        }
    }

    /// Delivers an ERROR notice directly into the receiver's inbox.
    ///
    /// A stopping agent's runtime uses this to fulfil its drain obligation
    /// to pending senders: by the time the drain runs, the agent is already
    /// out of the registry, so the notice cannot take the sender-gated
    /// [`Hub::route`] path. Only ERROR messages are accepted, and the path
    /// stays open during hub shutdown; delivery simply fails once the
    /// receiver's handle is gone.
    pub async fn deliver_error_notice(&self, notice: Message) -> Result<(), HubError> {
        if notice.kind != MessageKind::Error {
            return Err(HubError::Protocol(ProtocolError::InvalidEnvelope(
                "only ERROR notices may bypass routing".into(),
            )));
        }
        let receiver_id = notice.receiver_id.clone();

        let receiver_sender = {
            let agents = self.agents.read().await;
            match agents.get(&receiver_id) {
                Some(handle) => handle.sender.clone(),
                None => return Err(HubError::UnknownReceiver(receiver_id)),
            }
        };
        match receiver_sender.try_send(notice.clone()) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.sink.on_backpressure(&notice.sender_id, &receiver_id);
                return Err(HubError::Backpressure(receiver_id));
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                return Err(HubError::UnknownReceiver(receiver_id));
            }
        }

        // An ERROR carrying a request id still closes the matching pending
        // request, so a waiter hears the shutdown instead of timing out.
        if let Some(request_id) = notice.metadata.request_id.clone() {
            if let CompleteOutcome::Late = self.pending.complete(&request_id, &notice) {
                self.sink.on_late_response(&request_id);
            }
        }
        Ok(())
    }

    /// Polls a request id within the late-response retention window.
    pub fn check_late_result(&self, request_id: &str) -> RequestPoll {
        self.pending.poll(request_id)
    }

    /// Adds a global interceptor observing every routed message.
    pub fn add_global_interceptor(&self, interceptor: Arc<dyn Interceptor>) -> InterceptorId {
        self.interceptors.add_global(interceptor)
    }

    /// Adds an interceptor observing messages delivered to one agent.
    pub fn add_agent_interceptor(
        &self,
        agent_id: &AgentId,
        interceptor: Arc<dyn Interceptor>,
    ) -> InterceptorId {
        self.interceptors.add_for_agent(agent_id, interceptor)
    }

    /// Removes an interceptor by id. Returns whether one was removed.
    pub fn remove_interceptor(&self, id: InterceptorId) -> bool {
        self.interceptors.remove(id)
    }

    /// All registered agents, as discovery entries.
    pub async fn list_agents(&self) -> Vec<DiscoveredAgent> {
        self.registry
            .all_agents()
            .await
            .iter()
            .map(|r| r.to_discovered(None))
            .collect()
    }

    /// Exact capability discovery.
    pub async fn find_by_capability(&self, name: &str) -> Vec<DiscoveredAgent> {
        self.registry
            .get_by_capability(name)
            .await
            .iter()
            .map(|r| r.to_discovered(None))
            .collect()
    }

    /// Semantic capability discovery on behalf of `requester`.
    ///
    /// The requester itself and its recent timeout partners are excluded.
    pub async fn find_by_description(
        &self,
        query: &str,
        requester: Option<&AgentId>,
        limit: usize,
        min_score: Option<f32>,
    ) -> Vec<DiscoveredAgent> {
        let exclude = match requester {
            Some(requester) => self.recent_timeout_partners(requester),
            None => Vec::new(),
        };
        let options = DiscoveryOptions {
            limit,
            min_score,
            requester: requester.cloned(),
            exclude,
            active_only: true,
        };
        self.registry
            .get_by_capability_description(query, &options)
            .await
            .iter()
            .map(|(r, score)| r.to_discovered(Some(*score)))
            .collect()
    }

    /// Partners that recently left this agent's requests hanging.
    pub fn recent_timeout_partners(&self, agent_id: &AgentId) -> Vec<AgentId> {
        let mut partners = self.timeout_partners.lock().expect("timeout partners lock");
        let Some(entries) = partners.get_mut(agent_id) else {
            return Vec::new();
        };
        let ttl = self.config.timeout_partner_ttl;
        entries.retain(|_, seen| seen.elapsed() <= ttl);
        entries.keys().cloned().collect()
    }

    fn record_timeout_partner(&self, requester: &AgentId, target: &AgentId) {
        self.timeout_partners
            .lock()
            .expect("timeout partners lock")
            .entry(requester.clone())
            .or_default()
            .insert(target.clone(), Instant::now());
    }

    /// A snapshot of the bounded in-memory message history.
    pub fn message_history(&self) -> Vec<Message> {
        self.history.lock().expect("history lock").snapshot()
    }

    /// Forwards a cooldown start to the observability sink. Called by agent
    /// runtimes when their rate controller trips.
    pub fn report_cooldown(&self, agent_id: &AgentId, duration: Duration) {
        self.sink.on_cooldown(agent_id, duration);
    }

    /// Stops the hub: refuses new work, cancels every pending wait, signals
    /// every agent runtime, and tears down background workers.
    pub async fn stop(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::info!("hub stopping");

        self.pending.cancel_all();

        let mut agents = self.agents.write().await;
        for (agent_id, handle) in agents.drain() {
            let _ = handle.stop.send(true);
            tracing::debug!(agent = %agent_id, "stop signaled");
        }
        drop(agents);

        for task in self.tasks.lock().expect("task lock").drain(..) {
            task.abort();
        }
        tracing::info!("hub stopped");
    }

    /// Whether the hub has been stopped.
    pub fn is_stopped(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Sends a hub-signed ERROR notice to an agent, best effort.
    async fn notify_sender(&self, agent_id: &AgentId, content: String, error_kind: &str) {
        let mut metadata = MessageMetadata::default();
        metadata
            .custom
            .insert("errorKind".into(), Value::String(error_kind.into()));
        let notice = match Message::signed(
            HUB_AGENT_ID,
            agent_id.clone(),
            content,
            MessageKind::Error,
            metadata,
            &self.identity,
        ) {
            Ok(notice) => notice,
            Err(e) => {
                tracing::error!(error = %e, "failed to build hub notice");
                return;
            }
        };
        if let Some(handle) = self.agents.read().await.get(agent_id) {
            if handle.sender.try_send(notice).is_err() {
                tracing::debug!(agent = %agent_id, "could not deliver hub notice");
            }
        }
    }
}

async fn janitor_loop(pending: Arc<PendingTable>, interval: Duration, retention: Duration) {
    loop {
        tokio::time::sleep(interval).await;
        let evicted = pending.evict_older_than(retention);
        if evicted > 0 {
            tracing::debug!(count = evicted, "evicted expired pending requests");
        }
    }
}
