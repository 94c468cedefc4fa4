//! # Outbound Message Queue
//!
//! Holds browser-to-upstream messages that arrive while the upstream handshake
//! is still in flight.
//!
//! ## Lifecycle:
//! 1. **Buffering**: messages are appended in arrival order
//! 2. **Drained**: the upstream opened; everything was handed over once, in order
//! 3. **Discarded**: the upstream never opened; everything was dropped
//!
//! Once drained or discarded the queue is inert and refuses new messages, so a
//! message can never be delivered twice or sneak in behind the drain.
//!
//! ## Memory bounds:
//! Both the message count and the total payload size are capped. A slow or
//! silent upstream therefore costs at most the configured amount per session.

use std::collections::VecDeque;
use tokio_tungstenite::tungstenite::Message;

use crate::config::RelayConfig;
use crate::error::RelayError;

#[derive(Debug, Clone, Copy)]
pub struct QueueLimits {
    pub max_messages: usize,
    pub max_bytes: usize,
}

impl From<&RelayConfig> for QueueLimits {
    fn from(config: &RelayConfig) -> Self {
        Self {
            max_messages: config.max_queued_messages,
            max_bytes: config.max_queued_bytes,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum QueueState {
    Buffering,
    Drained,
    Discarded,
}

/// Why a message could not be queued.
#[derive(Debug, PartialEq, Eq)]
pub enum EnqueueError {
    /// Accepting the message would exceed a limit
    Overflow { messages: usize, bytes: usize },
    /// The queue was already drained or discarded
    Closed,
}

impl From<EnqueueError> for RelayError {
    fn from(err: EnqueueError) -> Self {
        match err {
            EnqueueError::Overflow { messages, bytes } => RelayError::QueueOverflow { messages, bytes },
            EnqueueError::Closed => {
                RelayError::Internal("message queued after the outbound queue was drained or discarded".to_string())
            }
        }
    }
}

#[derive(Debug)]
pub struct OutboundQueue {
    pending: VecDeque<Message>,
    bytes: usize,
    limits: QueueLimits,
    state: QueueState,
}

impl OutboundQueue {
    pub fn new(limits: QueueLimits) -> Self {
        Self {
            pending: VecDeque::new(),
            bytes: 0,
            limits,
            state: QueueState::Buffering,
        }
    }

    /// Append a message to the tail.
    ///
    /// The message is rejected, not partially stored, when it would push the
    /// queue over either limit.
    pub fn enqueue(&mut self, msg: Message) -> Result<(), EnqueueError> {
        if self.state != QueueState::Buffering {
            return Err(EnqueueError::Closed);
        }

        let size = msg.len();
        let messages = self.pending.len() + 1;
        let bytes = self.bytes + size;
        if messages > self.limits.max_messages || bytes > self.limits.max_bytes {
            return Err(EnqueueError::Overflow { messages, bytes });
        }

        self.pending.push_back(msg);
        self.bytes = bytes;
        Ok(())
    }

    /// Hand over every queued message in FIFO order.
    ///
    /// Only the first call yields anything; the queue stays inert afterwards.
    pub fn drain(&mut self) -> impl Iterator<Item = Message> {
        let pending = if self.state == QueueState::Buffering {
            std::mem::take(&mut self.pending)
        } else {
            VecDeque::new()
        };
        self.state = QueueState::Drained;
        self.bytes = 0;
        pending.into_iter()
    }

    /// Drop everything; used when the upstream never opened.
    pub fn discard(&mut self) -> usize {
        let dropped = self.pending.len();
        self.pending.clear();
        self.bytes = 0;
        if self.state == QueueState::Buffering {
            self.state = QueueState::Discarded;
        }
        dropped
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Total payload bytes currently queued.
    pub fn bytes(&self) -> usize {
        self.bytes
    }
}
