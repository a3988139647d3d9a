//! Bounded in-memory message history.

use std::collections::VecDeque;

use weft_protocol::Message;

/// Ring buffer of recently routed messages. Oldest entries fall off when the
/// capacity is reached; nothing is ever persisted.
pub(crate) struct History {
    capacity: usize,
    entries: VecDeque<Message>,
}

impl History {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: VecDeque::with_capacity(capacity.min(64)),
        }
    }

    pub(crate) fn push(&mut self, message: Message) {
        if self.capacity == 0 {
            return;
        }
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(message);
    }

    pub(crate) fn snapshot(&self) -> Vec<Message> {
        self.entries.iter().cloned().collect()
    }
}
