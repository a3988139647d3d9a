//! Interaction control for Weft agents.
//!
//! Tracks token spend in per-minute and per-hour windows, imposes cooldowns
//! when a window overflows, and caps the number of turns per conversation.
//! The controller is owned by one agent runtime; it is plain synchronous
//! state with no internal locking.
//!
//! Token counts come from whatever reasoning engine the runtime plugs in.
//! The controller is just "a place to call [`InteractionControl::account`]
//! after each turn".

use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Verdict returned after accounting for a turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Keep processing.
    Continue,
    /// A rate window overflowed; pause until the given instant.
    Wait(Instant),
    /// The conversation hit its turn cap and must end.
    Stop,
}

/// Rate and turn limits for one agent.
#[derive(Debug, Clone, Copy)]
pub struct RateLimits {
    /// Token budget per sliding minute.
    pub max_tokens_per_minute: u64,
    /// Token budget per sliding hour.
    pub max_tokens_per_hour: u64,
    /// Maximum turns per conversation before a STOP is issued.
    pub max_turns: u32,
}

impl Default for RateLimits {
    fn default() -> Self {
        Self {
            max_tokens_per_minute: 5_500,
            max_tokens_per_hour: 100_000,
            max_turns: 20,
        }
    }
}

/// A fixed-duration token window with monotonic accounting.
#[derive(Debug)]
struct TokenWindow {
    limit: u64,
    window: Duration,
    used: u64,
    window_start: Instant,
}

impl TokenWindow {
    fn new(limit: u64, window: Duration) -> Self {
        Self {
            limit,
            window,
            used: 0,
            window_start: Instant::now(),
        }
    }

    /// Adds tokens, rolling the window first if it has elapsed.
    fn add(&mut self, tokens: u64, now: Instant) {
        if now.duration_since(self.window_start) >= self.window {
            self.used = 0;
            self.window_start = now;
        }
        self.used = self.used.saturating_add(tokens);
    }

    /// Remaining time until this window resets, when it is over budget.
    fn overflow_backoff(&self, now: Instant) -> Option<Duration> {
        if self.used >= self.limit {
            Some(self.window.saturating_sub(now.duration_since(self.window_start)))
        } else {
            None
        }
    }
}

/// Accumulated statistics for one conversation.
#[derive(Debug, Clone)]
pub struct ConversationStats {
    /// Turns consumed so far.
    pub turns: u32,
    /// Total tokens spent.
    pub total_tokens: u64,
    /// When the conversation started.
    pub started_at: Instant,
    /// Most recent activity.
    pub last_at: Instant,
}

/// Per-agent interaction controller.
pub struct InteractionControl {
    agent_id: String,
    minute: TokenWindow,
    hour: TokenWindow,
    max_turns: u32,
    cooldown_until: Option<Instant>,
    conversations: HashMap<String, ConversationStats>,
    cooldown_listener: Option<Box<dyn Fn(Duration) + Send + Sync>>,
}

impl InteractionControl {
    pub fn new(agent_id: impl Into<String>, limits: RateLimits) -> Self {
        Self {
            agent_id: agent_id.into(),
            minute: TokenWindow::new(limits.max_tokens_per_minute, Duration::from_secs(60)),
            hour: TokenWindow::new(limits.max_tokens_per_hour, Duration::from_secs(3600)),
            max_turns: limits.max_turns,
            cooldown_until: None,
            conversations: HashMap::new(),
            cooldown_listener: None,
        }
    }

    /// Registers a listener invoked whenever a cooldown starts.
    pub fn set_cooldown_listener(&mut self, listener: impl Fn(Duration) + Send + Sync + 'static) {
        self.cooldown_listener = Some(Box::new(listener));
    }

    /// Checks whether processing may start right now.
    ///
    /// Returns [`Verdict::Wait`] while a cooldown is active.
    pub fn precheck(&mut self) -> Verdict {
        match self.cooldown_until {
            Some(until) if Instant::now() < until => Verdict::Wait(until),
            Some(_) => {
                self.cooldown_until = None;
                Verdict::Continue
            }
            None => Verdict::Continue,
        }
    }

    /// Accounts for one completed turn.
    ///
    /// Turn caps are checked before counting: the call that would exceed
    /// `max_turns` yields [`Verdict::Stop`] without consuming budget.
    /// Zero-token turns pass through without counting. A window overflow
    /// starts a cooldown lasting until the violated window rolls over.
    pub fn account(&mut self, tokens: u64, conversation_id: &str) -> Verdict {
        let now = Instant::now();

        let stats = self
            .conversations
            .entry(conversation_id.to_string())
            .or_insert_with(|| ConversationStats {
                turns: 0,
                total_tokens: 0,
                started_at: now,
                last_at: now,
            });

        if stats.turns >= self.max_turns {
            tracing::info!(
                agent = %self.agent_id,
                conversation = conversation_id,
                max_turns = self.max_turns,
                "turn cap reached, stopping conversation"
            );
            return Verdict::Stop;
        }

        if tokens == 0 {
            stats.last_at = now;
            return Verdict::Continue;
        }

        stats.turns += 1;
        stats.total_tokens += tokens;
        stats.last_at = now;

        self.minute.add(tokens, now);
        self.hour.add(tokens, now);

        let backoff = self
            .minute
            .overflow_backoff(now)
            .or_else(|| self.hour.overflow_backoff(now));

        if let Some(backoff) = backoff {
            let until = now + backoff;
            self.cooldown_until = Some(until);
            tracing::warn!(
                agent = %self.agent_id,
                backoff_secs = backoff.as_secs(),
                "token budget exhausted, entering cooldown"
            );
            if let Some(listener) = &self.cooldown_listener {
                listener(backoff);
            }
            return Verdict::Wait(until);
        }

        Verdict::Continue
    }

    /// The instant the current cooldown ends, if one is active.
    pub fn cooldown_until(&self) -> Option<Instant> {
        self.cooldown_until
    }

    /// Imposes an externally decided cooldown (e.g. a peer's COOLDOWN notice).
    pub fn impose_cooldown(&mut self, duration: Duration) {
        let until = Instant::now() + duration;
        self.cooldown_until = Some(until);
        if let Some(listener) = &self.cooldown_listener {
            listener(duration);
        }
    }

    /// Clears any active cooldown.
    pub fn reset_cooldown(&mut self) {
        self.cooldown_until = None;
    }

    /// Drops turn accounting for a conversation (on STOP or conversation end).
    pub fn reset_conversation(&mut self, conversation_id: &str) {
        self.conversations.remove(conversation_id);
    }

    /// Stats for one conversation, if it has seen any turns.
    pub fn conversation_stats(&self, conversation_id: &str) -> Option<&ConversationStats> {
        self.conversations.get(conversation_id)
    }

    #[cfg(test)]
    fn rewind_minute_window(&mut self, by: Duration) {
        self.minute.window_start -= by;
    }
}

impl std::fmt::Debug for InteractionControl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InteractionControl")
            .field("agent_id", &self.agent_id)
            .field("cooldown_until", &self.cooldown_until)
            .field("conversations", &self.conversations.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits(per_minute: u64, per_hour: u64, max_turns: u32) -> RateLimits {
        RateLimits {
            max_tokens_per_minute: per_minute,
            max_tokens_per_hour: per_hour,
            max_turns,
        }
    }

    #[test]
    fn under_budget_continues() {
        let mut control = InteractionControl::new("a", limits(100, 1000, 10));
        assert_eq!(control.account(10, "conv"), Verdict::Continue);
        assert_eq!(control.account(10, "conv"), Verdict::Continue);
        assert!(control.cooldown_until().is_none());
    }

    #[test]
    fn minute_overflow_triggers_wait() {
        let mut control = InteractionControl::new("a", limits(50, 1000, 10));
        assert_eq!(control.account(30, "conv"), Verdict::Continue);
        match control.account(30, "conv") {
            Verdict::Wait(until) => assert!(until > Instant::now()),
            other => panic!("expected Wait, got {other:?}"),
        }
        assert!(control.cooldown_until().is_some());
        // Until the window rolls, precheck keeps waiting.
        assert!(matches!(control.precheck(), Verdict::Wait(_)));
    }

    #[test]
    fn window_replenishes_after_rollover() {
        let mut control = InteractionControl::new("a", limits(50, 100_000, 100));
        assert!(matches!(control.account(60, "conv"), Verdict::Wait(_)));

        // Simulate the minute elapsing.
        control.rewind_minute_window(Duration::from_secs(61));
        control.reset_cooldown();
        assert_eq!(control.account(10, "conv"), Verdict::Continue);
    }

    #[test]
    fn hour_overflow_also_triggers_wait() {
        let mut control = InteractionControl::new("a", limits(1_000_000, 100, 100));
        assert!(matches!(control.account(150, "conv"), Verdict::Wait(_)));
    }

    #[test]
    fn turn_cap_yields_stop() {
        let mut control = InteractionControl::new("a", limits(1_000_000, 1_000_000, 3));
        for _ in 0..3 {
            assert_eq!(control.account(1, "conv"), Verdict::Continue);
        }
        // The K+1'th turn stops the conversation.
        assert_eq!(control.account(1, "conv"), Verdict::Stop);
        // Other conversations are unaffected.
        assert_eq!(control.account(1, "other"), Verdict::Continue);
    }

    #[test]
    fn zero_token_turns_do_not_count() {
        let mut control = InteractionControl::new("a", limits(1_000_000, 1_000_000, 2));
        for _ in 0..10 {
            assert_eq!(control.account(0, "conv"), Verdict::Continue);
        }
        assert_eq!(control.conversation_stats("conv").unwrap().turns, 0);
    }

    #[test]
    fn reset_conversation_restarts_turn_count() {
        let mut control = InteractionControl::new("a", limits(1_000_000, 1_000_000, 2));
        control.account(1, "conv");
        control.account(1, "conv");
        assert_eq!(control.account(1, "conv"), Verdict::Stop);

        control.reset_conversation("conv");
        assert_eq!(control.account(1, "conv"), Verdict::Continue);
    }

    #[test]
    fn cooldown_listener_fires_on_overflow() {
        use std::sync::atomic::{AtomicU32, Ordering};
        use std::sync::Arc;

        let fired = Arc::new(AtomicU32::new(0));
        let mut control = InteractionControl::new("a", limits(10, 1000, 10));
        let counter = fired.clone();
        control.set_cooldown_listener(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        assert!(matches!(control.account(20, "conv"), Verdict::Wait(_)));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn imposed_cooldown_blocks_precheck() {
        let mut control = InteractionControl::new("a", RateLimits::default());
        control.impose_cooldown(Duration::from_secs(30));
        assert!(matches!(control.precheck(), Verdict::Wait(_)));
        control.reset_cooldown();
        assert_eq!(control.precheck(), Verdict::Continue);
    }

    #[test]
    fn stats_accumulate_per_conversation() {
        let mut control = InteractionControl::new("a", RateLimits::default());
        control.account(10, "conv");
        control.account(15, "conv");
        control.account(5, "other");

        let stats = control.conversation_stats("conv").unwrap();
        assert_eq!(stats.turns, 2);
        assert_eq!(stats.total_tokens, 25);
        assert_eq!(control.conversation_stats("other").unwrap().total_tokens, 5);
    }
}
