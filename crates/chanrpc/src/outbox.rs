//! # Outgoing Buffer
//!
//! Envelopes wait here until the next flush. The buffer is a two-state
//! scheduler: `Idle`, or `Scheduled` with exactly one flush pending.
//!
//! ## Invariants
//! - At most one flush is pending at any time. `push` reports when the caller
//!   must schedule one; it never asks twice before `take`.
//! - `take` empties the buffer and returns to `Idle` in one step.
//! - Issue order is preserved within a flush.

use chanwire::ClientMessage;
use chanwire::RequestId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FlushState {
    Idle,
    Scheduled,
}

#[derive(Debug)]
pub(crate) struct Outbox {
    buffer: Vec<ClientMessage>,
    state: FlushState,
}

impl Outbox {
    pub fn new() -> Self {
        Self { buffer: Vec::new(), state: FlushState::Idle }
    }

    /// Appends a message. Returns `true` when a flush must be scheduled.
    pub fn push(&mut self, message: ClientMessage) -> bool {
        self.buffer.push(message);
        match self.state {
            FlushState::Idle => {
                self.state = FlushState::Scheduled;
                true
            }
            FlushState::Scheduled => false,
        }
    }

    /// Drops every unsent message for `id`. Returns how many were dropped.
    pub fn purge(&mut self, id: &RequestId) -> usize {
        let before = self.buffer.len();
        self.buffer.retain(|msg| msg.id() != id);
        before - self.buffer.len()
    }

    /// Hands the whole buffer to the flush that is running now.
    pub fn take(&mut self) -> Vec<ClientMessage> {
        self.state = FlushState::Idle;
        std::mem::take(&mut self.buffer)
    }

    #[cfg(test)]
    pub fn state(&self) -> FlushState {
        self.state
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }
}

/// Splits a flushed buffer into the messages to send.
///
/// With batching, everything goes out as one message. Without, each envelope
/// is its own message, in order.
pub(crate) fn batches(messages: Vec<ClientMessage>, batching: bool) -> Vec<Vec<ClientMessage>> {
    if messages.is_empty() {
        return Vec::new();
    }
    if batching {
        vec![messages]
    } else {
        messages.into_iter().map(|msg| vec![msg]).collect()
    }
}
