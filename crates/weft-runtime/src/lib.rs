//! Per-agent runtime for the Weft fabric.
//!
//! Each spawned agent owns a cooperative loop: receive from the hub-wired
//! inbox, let the [`ReasoningEngine`] produce a reply, account the token
//! spend, and route the reply back out. Special message kinds (PING, STOP,
//! CAPABILITY_REQUEST) are answered without involving the engine.
//!
//! The loop is cancellable at every await point: the hub's stop signal
//! interrupts even a long-running engine call, after which the remaining
//! inbox is drained with shutdown errors to each pending sender.

mod engine;

pub use engine::{EchoEngine, EngineError, EngineReply, FailingEngine, ReasoningEngine, SilentEngine};

use std::collections::HashMap;
use std::time::{Duration, Instant};

use serde_json::Value;
use std::sync::Arc;
use tokio::task::JoinHandle;

use weft_control::{InteractionControl, RateLimits, Verdict};
use weft_hub::{AgentMailbox, Hub, HubError, HUB_AGENT_ID};
use weft_identity::AgentIdentity;
use weft_protocol::{Message, MessageMetadata};
use weft_types::{AgentId, AgentProfile, MessageKind};

/// Handle to a spawned agent runtime.
pub struct RunningAgent {
    agent_id: AgentId,
    handle: JoinHandle<()>,
}

impl RunningAgent {
    /// The agent this handle belongs to.
    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    /// Whether the runtime task has exited.
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Waits for the runtime task to exit.
    pub async fn join(self) {
        let _ = self.handle.await;
    }

    /// Unregisters the agent from the hub and waits for the runtime to
    /// finish its drain.
    pub async fn stop(self, hub: &Hub) {
        let _ = hub.unregister_agent(&self.agent_id).await;
        self.join().await;
    }

    /// Aborts the runtime task without draining.
    pub fn abort(&self) {
        self.handle.abort();
    }

    /// A handle that can abort the runtime after `join` has consumed `self`.
    pub fn abort_handle(&self) -> tokio::task::AbortHandle {
        self.handle.abort_handle()
    }
}

/// Spawns an agent runtime over a hub mailbox.
pub fn spawn(
    profile: AgentProfile,
    identity: AgentIdentity,
    mailbox: AgentMailbox,
    hub: Arc<Hub>,
    engine: Box<dyn ReasoningEngine>,
    limits: RateLimits,
) -> RunningAgent {
    let agent_id = profile.agent_id.clone();
    let mut control = InteractionControl::new(agent_id.clone(), limits);
    {
        let hub = hub.clone();
        let agent_id = agent_id.clone();
        control.set_cooldown_listener(move |duration| hub.report_cooldown(&agent_id, duration));
    }
    let worker = Worker {
        profile,
        identity,
        hub,
        engine,
        control,
        reply_correlation: HashMap::new(),
    };
    let handle = tokio::spawn(worker.run(mailbox));
    RunningAgent { agent_id, handle }
}

struct Worker {
    profile: AgentProfile,
    identity: AgentIdentity,
    hub: Arc<Hub>,
    engine: Box<dyn ReasoningEngine>,
    control: InteractionControl,
    /// Inbound request ids awaiting an outbound reply, keyed by peer.
    reply_correlation: HashMap<AgentId, String>,
}

impl Worker {
    async fn run(mut self, mut mailbox: AgentMailbox) {
        let agent_id = self.profile.agent_id.clone();
        tracing::info!(agent = %agent_id, "agent runtime started");

        loop {
            let message = tokio::select! {
                changed = mailbox.stop.changed() => {
                    if changed.is_err() || *mailbox.stop.borrow() {
                        break;
                    }
                    continue;
                }
                inbound = mailbox.inbox.recv() => match inbound {
                    Some(message) => message,
                    None => break,
                },
            };

            // Racing the processing against the stop signal makes even a
            // slow engine call cancellable.
            let mut stop = mailbox.stop.clone();
            let stopped = tokio::select! {
                res = stop.wait_for(|stopped| *stopped) => res.is_ok(),
                () = self.process(message) => false,
            };
            if stopped {
                break;
            }
        }

        self.drain(&mut mailbox).await;
        self.engine.shutdown().await;
        tracing::info!(agent = %agent_id, "agent runtime stopped");
    }

    async fn process(&mut self, message: Message) {
        let sender_id = message.sender_id.clone();

        if sender_id == HUB_AGENT_ID {
            tracing::warn!(
                agent = %self.profile.agent_id,
                content = %message.content,
                "hub notice received"
            );
            return;
        }

        match message.kind {
            MessageKind::Ping => {
                let metadata = self.correlated_metadata(&message);
                self.dispatch(sender_id, "PONG".into(), MessageKind::Ping, metadata)
                    .await;
            }
            MessageKind::Stop => {
                tracing::info!(
                    agent = %self.profile.agent_id,
                    peer = %sender_id,
                    "conversation closed by peer"
                );
                self.control.reset_conversation(&sender_id);
                self.reply_correlation.remove(&sender_id);
            }
            MessageKind::Cooldown => {
                tracing::info!(
                    agent = %self.profile.agent_id,
                    peer = %sender_id,
                    "peer reported cooldown"
                );
            }
            MessageKind::CapabilityRequest => {
                let body = serde_json::to_string(&self.profile.capabilities)
                    .unwrap_or_else(|_| "[]".into());
                let metadata = self.correlated_metadata(&message);
                self.dispatch(sender_id, body, MessageKind::CapabilityResponse, metadata)
                    .await;
            }
            _ => self.process_with_engine(message).await,
        }
    }

    async fn process_with_engine(&mut self, message: Message) {
        if let Verdict::Wait(until) = self.control.precheck() {
            self.notify_cooldown(&message, until).await;
            tokio::time::sleep_until(tokio::time::Instant::from_std(until)).await;
            self.control.reset_cooldown();
            // The deferred message is skipped; the peer was told to retry.
            return;
        }

        if let Some(request_id) = &message.metadata.request_id {
            self.reply_correlation
                .insert(message.sender_id.clone(), request_id.clone());
        }

        let reply = match self.engine.handle(&message).await {
            Ok(reply) => reply,
            Err(e) => {
                tracing::error!(
                    agent = %self.profile.agent_id,
                    error = %e,
                    "reasoning engine failed"
                );
                self.send_engine_error(&message, &e).await;
                return;
            }
        };

        let tokens = self.engine.last_token_usage();
        match self.control.account(tokens, &message.sender_id) {
            Verdict::Stop => {
                self.control.reset_conversation(&message.sender_id);
                self.reply_correlation.remove(&message.sender_id);
                self.dispatch(
                    message.sender_id.clone(),
                    "Maximum conversation turns reached. Ending conversation.".into(),
                    MessageKind::Stop,
                    MessageMetadata::default(),
                )
                .await;
                return;
            }
            Verdict::Wait(_) => {
                // Budget spent on this turn; the reply still goes out and the
                // next precheck enforces the cooldown.
            }
            Verdict::Continue => {}
        }

        if let Some(reply) = reply {
            self.send_reply(&message, reply).await;
        }
    }

    async fn send_reply(&mut self, inbound: &Message, reply: EngineReply) {
        let receiver_id = reply
            .receiver_id
            .unwrap_or_else(|| inbound.sender_id.clone());
        let kind = reply.kind.unwrap_or(match inbound.kind {
            MessageKind::RequestCollaboration => MessageKind::ResponseCollaboration,
            _ => MessageKind::Response,
        });

        let mut metadata = reply.metadata;
        if kind.is_reply() && metadata.request_id.is_none() {
            metadata.request_id = self.reply_correlation.remove(&receiver_id);
        }
        // Delegated requests inherit the inbound chain so the hub can detect
        // cycles across hops.
        if kind == MessageKind::RequestCollaboration && metadata.collaboration_chain.is_none() {
            metadata.collaboration_chain = inbound.metadata.collaboration_chain.clone();
        }
        if matches!(
            kind,
            MessageKind::Response | MessageKind::ResponseCollaboration
        ) && metadata.payment_address.is_none()
        {
            metadata.payment_address = self.profile.payment_address.clone();
        }

        self.dispatch(receiver_id, reply.content, kind, metadata).await;
    }

    async fn send_engine_error(&mut self, inbound: &Message, error: &EngineError) {
        let mut metadata = self.correlated_metadata(inbound);
        metadata
            .custom
            .insert("errorKind".into(), Value::String("ENGINE_FAILURE".into()));
        self.dispatch(
            inbound.sender_id.clone(),
            format!("failed to process message: {error}"),
            MessageKind::Error,
            metadata,
        )
        .await;
    }

    async fn notify_cooldown(&mut self, inbound: &Message, until: Instant) {
        let remaining = until.saturating_duration_since(Instant::now()).as_secs();
        let mut metadata = MessageMetadata::default();
        metadata.custom.insert(
            "cooldownRemaining".into(),
            Value::Number(remaining.into()),
        );
        self.dispatch(
            inbound.sender_id.clone(),
            format!("in cooldown for {remaining}s, try again later"),
            MessageKind::Cooldown,
            metadata,
        )
        .await;
    }

    /// Metadata echoing the inbound request id, if any.
    fn correlated_metadata(&mut self, inbound: &Message) -> MessageMetadata {
        let mut metadata = MessageMetadata::default();
        metadata.request_id = inbound.metadata.request_id.clone();
        metadata
    }

    /// Signs and routes an outbound message, retrying briefly on
    /// backpressure before abandoning.
    async fn dispatch(
        &self,
        receiver_id: AgentId,
        content: String,
        kind: MessageKind,
        metadata: MessageMetadata,
    ) {
        let message = match Message::signed(
            self.profile.agent_id.clone(),
            receiver_id.clone(),
            content,
            kind,
            metadata,
            &self.identity,
        ) {
            Ok(message) => message,
            Err(e) => {
                tracing::error!(agent = %self.profile.agent_id, error = %e, "failed to sign outbound message");
                return;
            }
        };

        let mut delay = Duration::from_millis(25);
        for attempt in 1..=3 {
            match self.hub.route(message.clone()).await {
                Ok(()) => return,
                Err(HubError::Backpressure(_)) if attempt < 3 => {
                    tracing::debug!(
                        agent = %self.profile.agent_id,
                        receiver = %receiver_id,
                        attempt,
                        "backpressure, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                }
                Err(e) => {
                    tracing::warn!(
                        agent = %self.profile.agent_id,
                        receiver = %receiver_id,
                        error = %e,
                        "abandoning outbound message"
                    );
                    return;
                }
            }
        }
    }

    /// Answers whatever is left in the inbox with a shutdown error.
    async fn drain(&mut self, mailbox: &mut AgentMailbox) {
        while let Ok(message) = mailbox.inbox.try_recv() {
            if message.sender_id == HUB_AGENT_ID || message.kind == MessageKind::Stop {
                continue;
            }
            let mut metadata = MessageMetadata::default();
            metadata.request_id = message.metadata.request_id.clone();
            metadata.custom.insert(
                "errorKind".into(),
                Value::String("AGENT_SHUTTING_DOWN".into()),
            );
            let notice = match Message::signed(
                self.profile.agent_id.clone(),
                message.sender_id.clone(),
                "agent is shutting down",
                MessageKind::Error,
                metadata,
                &self.identity,
            ) {
                Ok(notice) => notice,
                Err(_) => continue,
            };
            // This agent is already out of the registry, so the notice takes
            // the hub's direct delivery path instead of the sender-gated
            // route. Delivery only fails if the peer itself is gone.
            if let Err(e) = self.hub.deliver_error_notice(notice).await {
                tracing::debug!(
                    agent = %self.profile.agent_id,
                    peer = %message.sender_id,
                    error = %e,
                    "could not deliver shutdown notice"
                );
            }
        }
    }
}
