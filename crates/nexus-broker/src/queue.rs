use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use nexus_core::ids::{AgentId, MessageId};
use nexus_core::messages::{Message, Priority};

/// A queued message plus its arrival sequence, which breaks timestamp ties.
#[derive(Clone, Debug)]
struct Queued {
    seq: u64,
    message: Message,
}

impl Queued {
    fn key(&self) -> (Priority, DateTime<Utc>, u64) {
        (self.message.priority, self.message.timestamp, self.seq)
    }
}

/// Per-recipient pending messages, ordered by priority tier, then timestamp,
/// then arrival.
#[derive(Debug, Default)]
pub(crate) struct QueueManager {
    queues: HashMap<AgentId, Vec<Queued>>,
    next_seq: u64,
}

impl QueueManager {
    /// Insert keeping the order. Returns the recipient's new depth.
    pub fn enqueue(&mut self, recipient: &AgentId, message: Message) -> usize {
        let seq = self.next_seq;
        self.next_seq += 1;
        let queued = Queued { seq, message };
        let key = queued.key();

        let queue = self.queues.entry(recipient.clone()).or_default();
        let pos = queue.partition_point(|q| q.key() <= key);
        queue.insert(pos, queued);
        queue.len()
    }

    /// Remove the run of messages at the head that share the head's sender.
    pub fn dequeue_batch(&mut self, recipient: &AgentId) -> Vec<Message> {
        let Some(queue) = self.queues.get_mut(recipient) else {
            return Vec::new();
        };
        let Some(head) = queue.first() else {
            self.queues.remove(recipient);
            return Vec::new();
        };
        let sender = head.message.from.clone();
        let run = queue
            .iter()
            .take_while(|q| q.message.from == sender)
            .count();
        let batch = queue.drain(..run).map(|q| q.message).collect();
        self.prune(recipient);
        batch
    }

    /// Remove only the head message.
    pub fn dequeue_one(&mut self, recipient: &AgentId) -> Option<Message> {
        let queue = self.queues.get_mut(recipient)?;
        let message = (!queue.is_empty()).then(|| queue.remove(0).message);
        self.prune(recipient);
        message
    }

    /// Remove a specific message, wherever it sits.
    pub fn remove(&mut self, recipient: &AgentId, id: &MessageId) -> Option<Message> {
        let queue = self.queues.get_mut(recipient)?;
        let pos = queue.iter().position(|q| &q.message.id == id)?;
        let message = queue.remove(pos).message;
        self.prune(recipient);
        Some(message)
    }

    pub fn size(&self, recipient: &AgentId) -> usize {
        self.queues.get(recipient).map_or(0, Vec::len)
    }

    pub fn has_pending(&self, recipient: &AgentId) -> bool {
        self.size(recipient) > 0
    }

    /// Non-empty queues and their depths.
    pub fn depths(&self) -> BTreeMap<AgentId, usize> {
        self.queues
            .iter()
            .filter(|(_, q)| !q.is_empty())
            .map(|(id, q)| (id.clone(), q.len()))
            .collect()
    }

    fn prune(&mut self, recipient: &AgentId) {
        if self.queues.get(recipient).is_some_and(Vec::is_empty) {
            self.queues.remove(recipient);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn agent() -> AgentId {
        AgentId::from_raw("toolbox-ea-x")
    }

    fn msg(from: &str, content: &str, priority: Priority) -> Message {
        Message::new(from, "toolbox-ea-x", content).with_priority(priority)
    }

    fn contents(batch: &[Message]) -> Vec<&str> {
        batch.iter().map(|m| m.content.as_str()).collect()
    }

    #[test]
    fn enqueue_reports_depth() {
        let mut q = QueueManager::default();
        assert_eq!(q.enqueue(&agent(), msg("user", "a", Priority::Normal)), 1);
        assert_eq!(q.enqueue(&agent(), msg("user", "b", Priority::Normal)), 2);
        assert_eq!(q.size(&agent()), 2);
        assert!(q.has_pending(&agent()));
    }

    #[test]
    fn urgent_sorts_ahead_of_earlier_normal() {
        let mut q = QueueManager::default();
        q.enqueue(&agent(), msg("user", "normal", Priority::Normal));
        q.enqueue(&agent(), msg("user", "low", Priority::Low));
        q.enqueue(&agent(), msg("user", "urgent", Priority::Urgent));
        q.enqueue(&agent(), msg("user", "high", Priority::High));

        let batch = q.dequeue_batch(&agent());
        assert_eq!(contents(&batch), vec!["urgent", "high", "normal", "low"]);
    }

    #[test]
    fn fifo_within_tier_even_with_equal_timestamps() {
        let mut q = QueueManager::default();
        let now = Utc::now();
        for content in ["1", "2", "3"] {
            q.enqueue(&agent(), msg("user", content, Priority::Normal).with_timestamp(now));
        }
        assert_eq!(contents(&q.dequeue_batch(&agent())), vec!["1", "2", "3"]);
    }

    #[test]
    fn older_timestamp_sorts_first_within_tier() {
        let mut q = QueueManager::default();
        let now = Utc::now();
        q.enqueue(&agent(), msg("user", "late", Priority::Normal).with_timestamp(now));
        q.enqueue(
            &agent(),
            msg("user", "early", Priority::Normal).with_timestamp(now - Duration::seconds(1)),
        );
        assert_eq!(contents(&q.dequeue_batch(&agent())), vec!["early", "late"]);
    }

    #[test]
    fn batch_stops_at_sender_change() {
        let mut q = QueueManager::default();
        q.enqueue(&agent(), msg("user", "u1", Priority::Normal));
        q.enqueue(&agent(), msg("user", "u2", Priority::Normal));
        q.enqueue(&agent(), msg("meta-ia", "m1", Priority::Normal));
        q.enqueue(&agent(), msg("user", "u3", Priority::Normal));

        let first = q.dequeue_batch(&agent());
        assert_eq!(contents(&first), vec!["u1", "u2"]);
        assert!(first.iter().all(|m| m.from == "user"));

        assert_eq!(contents(&q.dequeue_batch(&agent())), vec!["m1"]);
        assert_eq!(contents(&q.dequeue_batch(&agent())), vec!["u3"]);
        assert!(q.dequeue_batch(&agent()).is_empty());
    }

    #[test]
    fn batch_never_returns_less_urgent_than_remaining() {
        let mut q = QueueManager::default();
        q.enqueue(&agent(), msg("a-ia", "a-normal", Priority::Normal));
        q.enqueue(&agent(), msg("b-ia", "b-high", Priority::High));
        q.enqueue(&agent(), msg("a-ia", "a-low", Priority::Low));

        let batch = q.dequeue_batch(&agent());
        assert_eq!(contents(&batch), vec!["b-high"]);
        let worst = batch.iter().map(|m| m.priority).max().unwrap();
        let remaining = q.dequeue_batch(&agent());
        assert!(remaining.iter().all(|m| m.priority >= worst));
    }

    #[test]
    fn empty_queue_is_removed() {
        let mut q = QueueManager::default();
        q.enqueue(&agent(), msg("user", "a", Priority::Normal));
        assert_eq!(q.depths().len(), 1);
        q.dequeue_batch(&agent());
        assert!(q.depths().is_empty());
        assert!(!q.has_pending(&agent()));
    }

    #[test]
    fn dequeue_one_takes_only_head() {
        let mut q = QueueManager::default();
        q.enqueue(&agent(), msg("user", "a", Priority::Normal));
        q.enqueue(&agent(), msg("user", "b", Priority::Normal));
        assert_eq!(q.dequeue_one(&agent()).unwrap().content, "a");
        assert_eq!(q.size(&agent()), 1);
        assert_eq!(q.dequeue_one(&agent()).unwrap().content, "b");
        assert!(q.dequeue_one(&agent()).is_none());
    }

    #[test]
    fn remove_by_id() {
        let mut q = QueueManager::default();
        let m = msg("user", "a", Priority::Normal);
        let id = m.id.clone();
        q.enqueue(&agent(), m);
        q.enqueue(&agent(), msg("user", "b", Priority::Normal));

        assert_eq!(q.remove(&agent(), &id).unwrap().content, "a");
        assert!(q.remove(&agent(), &id).is_none());
        assert_eq!(q.size(&agent()), 1);
    }

    #[test]
    fn depths_are_per_recipient() {
        let mut q = QueueManager::default();
        let other = AgentId::from_raw("toolbox-ea-y");
        q.enqueue(&agent(), msg("user", "a", Priority::Normal));
        q.enqueue(&other, msg("user", "b", Priority::Normal));
        q.enqueue(&other, msg("user", "c", Priority::Normal));

        let depths = q.depths();
        assert_eq!(depths[&agent()], 1);
        assert_eq!(depths[&other], 2);
    }
}
