use std::collections::HashMap;

use nexus_core::ids::AgentId;
use nexus_core::messages::Message;
use tokio::task::AbortHandle;

/// Messages accumulating for one recipient, plus its pending flush timer.
#[derive(Debug)]
struct Buffer {
    messages: Vec<Message>,
    generation: u64,
    timer: Option<AbortHandle>,
}

/// What the broker should do after an offer.
#[derive(Debug)]
pub(crate) enum Offer {
    /// The cap was reached; release these now.
    Flush(Vec<Message>),
    /// (Re)arm the debounce timer for this generation.
    Arm {
        generation: u64,
        replaced: Option<AbortHandle>,
    },
}

/// Debounce buffers for `collect` delivery, keyed by recipient.
///
/// Every offer bumps the buffer's generation. A timer only flushes if its
/// generation is still current, so a timer that lost the race to abort is
/// harmless.
#[derive(Debug, Default)]
pub(crate) struct CollectionBuffers {
    buffers: HashMap<AgentId, Buffer>,
    next_generation: u64,
}

impl CollectionBuffers {
    pub(crate) fn offer(&mut self, recipient: &AgentId, message: Message, cap: usize) -> Offer {
        self.next_generation += 1;
        let generation = self.next_generation;

        let buffer = self.buffers.entry(recipient.clone()).or_insert_with(|| Buffer {
            messages: Vec::new(),
            generation,
            timer: None,
        });
        buffer.messages.push(message);
        buffer.generation = generation;
        let replaced = buffer.timer.take();

        if buffer.messages.len() >= cap.max(1) {
            if let Some(timer) = replaced {
                timer.abort();
            }
            return Offer::Flush(self.take(recipient));
        }
        Offer::Arm { generation, replaced }
    }

    /// Attach the spawned timer, unless a newer offer or a flush got there first.
    pub fn attach_timer(&mut self, recipient: &AgentId, generation: u64, timer: AbortHandle) {
        match self.buffers.get_mut(recipient) {
            Some(buffer) if buffer.generation == generation => buffer.timer = Some(timer),
            _ => timer.abort(),
        }
    }

    /// Drain the buffer if `generation` is still the latest offer. Called from
    /// the timer itself, so its handle is dropped rather than aborted.
    pub fn take_if_current(
        &mut self,
        recipient: &AgentId,
        generation: u64,
    ) -> Option<Vec<Message>> {
        if self.buffers.get(recipient)?.generation != generation {
            return None;
        }
        self.buffers.remove(recipient).map(|b| b.messages)
    }

    /// Drain the buffer unconditionally, cancelling its timer.
    pub fn take(&mut self, recipient: &AgentId) -> Vec<Message> {
        match self.buffers.remove(recipient) {
            Some(buffer) => {
                if let Some(timer) = buffer.timer {
                    timer.abort();
                }
                buffer.messages
            }
            None => Vec::new(),
        }
    }

    pub fn buffered(&self, recipient: &AgentId) -> usize {
        self.buffers.get(recipient).map_or(0, |b| b.messages.len())
    }

    /// Drop every buffer and abort every timer. Returns the number of
    /// discarded messages.
    pub fn clear(&mut self) -> usize {
        let mut dropped = 0;
        for (_, buffer) in self.buffers.drain() {
            if let Some(timer) = buffer.timer {
                timer.abort();
            }
            dropped += buffer.messages.len();
        }
        dropped
    }
}
