//! Agent mailboxes and the in-process broker that fills them.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::envelope::{Message, Recipient};
use super::types::AgentId;
use crate::error::{Error, Result};

/// FIFO queue of messages delivered to one agent.
#[derive(Debug, Clone)]
pub struct Mailbox {
    pub agent_id: AgentId,
    inbox: VecDeque<Message>,
    /// Total messages received.
    pub total_received: u64,
    /// Total messages drained.
    pub total_drained: u64,
    pub last_activity: DateTime<Utc>,
}

impl Mailbox {
    pub fn new(agent_id: impl Into<AgentId>) -> Self {
        Self {
            agent_id: agent_id.into(),
            inbox: VecDeque::new(),
            total_received: 0,
            total_drained: 0,
            last_activity: Utc::now(),
        }
    }

    /// Append a message to the back of the queue.
    pub fn deliver(&mut self, message: Message) {
        self.inbox.push_back(message);
        self.total_received += 1;
        self.last_activity = Utc::now();
    }

    /// Take every queued message in arrival order.
    pub fn drain(&mut self) -> Vec<Message> {
        let messages: Vec<Message> = self.inbox.drain(..).collect();
        if !messages.is_empty() {
            self.total_drained += messages.len() as u64;
            self.last_activity = Utc::now();
        }
        messages
    }

    pub fn len(&self) -> usize {
        self.inbox.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inbox.is_empty()
    }

    pub fn stats(&self) -> MailboxStats {
        MailboxStats {
            agent_id: self.agent_id.clone(),
            queued: self.inbox.len(),
            total_received: self.total_received,
            total_drained: self.total_drained,
            last_activity: self.last_activity,
        }
    }
}

/// Mailbox statistics.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MailboxStats {
    pub agent_id: AgentId,
    pub queued: usize,
    pub total_received: u64,
    pub total_drained: u64,
    pub last_activity: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct BrokerState {
    mailboxes: BTreeMap<AgentId, Mailbox>,
    history: Vec<Message>,
}

/// Mailbox registry shared by every agent.
///
/// Cloning yields another handle onto the same mailboxes. Register, send and
/// drain each run under one lock, so a broadcast's recipient snapshot, its
/// enqueues and its history entry are observed as a single step.
#[derive(Debug, Clone, Default)]
pub struct MessageBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl MessageBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Create an empty mailbox for `agent_id` if it has none.
    ///
    /// Returns `true` when a mailbox was created.
    pub fn register(&self, agent_id: &str) -> bool {
        let mut state = self.state();
        if state.mailboxes.contains_key(agent_id) {
            return false;
        }
        state
            .mailboxes
            .insert(agent_id.to_string(), Mailbox::new(agent_id));
        tracing::debug!("Registered mailbox for {}", agent_id);
        true
    }

    pub fn is_registered(&self, agent_id: &str) -> bool {
        self.state().mailboxes.contains_key(agent_id)
    }

    /// Registered agent names in sorted order.
    pub fn agents(&self) -> Vec<AgentId> {
        self.state().mailboxes.keys().cloned().collect()
    }

    /// Deliver a message and record it in the history log.
    ///
    /// A broadcast reaches every registered agent except the sender. A direct
    /// send to an agent that never registered fails with
    /// [`Error::UnknownReceiver`] and changes nothing. Returns the number of
    /// mailboxes the message was placed in.
    pub fn send(&self, message: Message) -> Result<usize> {
        let mut state = self.state();

        let delivered = match &message.receiver {
            Recipient::Broadcast => {
                let mut count = 0;
                for (agent_id, mailbox) in state.mailboxes.iter_mut() {
                    if *agent_id != message.sender {
                        mailbox.deliver(message.clone());
                        count += 1;
                    }
                }
                count
            }
            Recipient::Agent(receiver) => {
                let mailbox = state.mailboxes.get_mut(receiver).ok_or_else(|| {
                    Error::UnknownReceiver {
                        receiver: receiver.clone(),
                    }
                })?;
                mailbox.deliver(message.clone());
                1
            }
        };

        tracing::debug!(
            "{} {} -> {} delivered to {} mailbox(es)",
            message.message_type(),
            message.sender,
            message.receiver,
            delivered
        );
        state.history.push(message);
        Ok(delivered)
    }

    /// Take all queued messages for `agent_id` in FIFO order. Never blocks.
    pub fn drain(&self, agent_id: &str) -> Vec<Message> {
        self.state()
            .mailboxes
            .get_mut(agent_id)
            .map(Mailbox::drain)
            .unwrap_or_default()
    }

    /// Number of messages waiting for `agent_id`.
    pub fn pending(&self, agent_id: &str) -> usize {
        self.state()
            .mailboxes
            .get(agent_id)
            .map(Mailbox::len)
            .unwrap_or(0)
    }

    /// Whether any mailbox still holds messages.
    pub fn has_pending(&self) -> bool {
        self.state().mailboxes.values().any(|m| !m.is_empty())
    }

    /// Copy of every message ever sent, in send order.
    pub fn history(&self) -> Vec<Message> {
        self.state().history.clone()
    }

    pub fn history_len(&self) -> usize {
        self.state().history.len()
    }

    pub fn stats(&self) -> Vec<MailboxStats> {
        self.state().mailboxes.values().map(Mailbox::stats).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::envelope::Payload;
    use proptest::prelude::*;

    fn ping() -> Payload {
        Payload::Received {
            processed: 0,
            failed: 0,
        }
    }

    #[test]
    fn test_register_is_idempotent() {
        let broker = MessageBroker::new();
        assert!(broker.register("ClassroomA"));
        assert!(!broker.register("ClassroomA"));
        assert_eq!(broker.agents(), vec!["ClassroomA".to_string()]);
    }

    #[test]
    fn test_direct_send_reaches_only_receiver() {
        let broker = MessageBroker::new();
        for name in ["Bottleneck", "ClassroomA", "ClassroomB"] {
            broker.register(name);
        }

        let delivered = broker
            .send(Message::direct("ClassroomA", "ClassroomB", ping()))
            .unwrap();

        assert_eq!(delivered, 1);
        assert_eq!(broker.pending("ClassroomB"), 1);
        assert_eq!(broker.pending("ClassroomA"), 0);
        assert_eq!(broker.pending("Bottleneck"), 0);
    }

    #[test]
    fn test_unknown_receiver_leaves_state_untouched() {
        let broker = MessageBroker::new();
        broker.register("ClassroomA");

        let err = broker
            .send(Message::direct("ClassroomA", "Ghost", ping()))
            .unwrap_err();

        assert!(matches!(err, Error::UnknownReceiver { ref receiver } if receiver == "Ghost"));
        assert_eq!(broker.history_len(), 0);
        assert!(!broker.is_registered("Ghost"));
    }

    #[test]
    fn test_drain_is_fifo_and_empties() {
        let broker = MessageBroker::new();
        broker.register("ClassroomA");

        let first = Message::direct("Bottleneck", "ClassroomA", ping());
        let second = Message::direct("Bottleneck", "ClassroomA", ping());
        let ids = vec![first.id.clone(), second.id.clone()];
        broker.send(first).unwrap();
        broker.send(second).unwrap();

        let drained: Vec<String> = broker.drain("ClassroomA").into_iter().map(|m| m.id).collect();
        assert_eq!(drained, ids);
        assert!(broker.drain("ClassroomA").is_empty());
        assert!(broker.drain("Nobody").is_empty());

        let stats = broker.stats();
        assert_eq!(stats[0].total_received, 2);
        assert_eq!(stats[0].total_drained, 2);
    }

    #[test]
    fn test_history_records_both_modes() {
        let broker = MessageBroker::new();
        broker.register("ClassroomA");
        broker.register("ClassroomB");

        broker
            .send(Message::broadcast("ClassroomA", ping()))
            .unwrap();
        broker
            .send(Message::direct("ClassroomB", "ClassroomA", ping()))
            .unwrap();

        assert_eq!(broker.history_len(), 2);
        assert!(broker.history()[0].is_broadcast());
    }

    #[test]
    fn test_concurrent_senders() {
        let broker = MessageBroker::new();
        broker.register("ClassroomA");

        let handles: Vec<_> = (0..4)
            .map(|i| {
                let broker = broker.clone();
                std::thread::spawn(move || {
                    for _ in 0..25 {
                        let sender = format!("Sender{}", i);
                        broker
                            .send(Message::direct(sender.clone(), "ClassroomA", ping()))
                            .unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(broker.drain("ClassroomA").len(), 100);
        assert_eq!(broker.history_len(), 100);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        /// A broadcast from one of N agents lands in exactly N - 1 mailboxes.
        #[test]
        fn prop_broadcast_fan_out(n in 1usize..12, sender_idx in 0usize..12) {
            let broker = MessageBroker::new();
            let names: Vec<String> = (0..n).map(|i| format!("Agent{}", i)).collect();
            for name in &names {
                broker.register(name);
            }
            let sender = &names[sender_idx % n];

            let delivered = broker.send(Message::broadcast(sender.clone(), ping())).unwrap();

            prop_assert_eq!(delivered, n - 1);
            prop_assert_eq!(broker.pending(sender), 0);
            for name in names.iter().filter(|name| *name != sender) {
                prop_assert_eq!(broker.pending(name), 1);
            }
        }
    }
}
