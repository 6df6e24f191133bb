//! Negotiating agents.
//!
//! Every agent owns its state outright and only learns about its peers through
//! messages drained from the shared broker. The driver calls
//! [`Agent::process_inbox`] on each agent repeatedly; one call handles whatever
//! is queued at that moment and never waits for more.

pub mod classroom;
pub mod monitor;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::protocol::{Message, MessageBroker, Payload};

pub use classroom::{ClassroomAgent, ClassroomProfile, ClassroomReport, ClassroomState};
pub use monitor::{congestion_risk, MonitorAgent, DEFAULT_MONITOR};

/// Serialized agent state, tagged with the agent it belongs to.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentSnapshot {
    pub agent_name: String,
    pub state: serde_json::Value,
}

/// Outcome of one inbox pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InboxReport {
    /// Messages handled without error.
    pub handled: usize,
    /// Messages whose handler failed.
    pub failed: usize,
}

impl InboxReport {
    pub fn total(&self) -> usize {
        self.handled + self.failed
    }

    /// Render the pass as a `RECEIVED` acknowledgement from `agent`.
    pub fn receipt(&self, agent: &str) -> Message {
        Message::broadcast(
            agent,
            Payload::Received {
                processed: self.handled,
                failed: self.failed,
            },
        )
    }
}

/// Lifecycle and message handling shared by every agent role.
pub trait Agent {
    fn name(&self) -> &str;

    fn broker(&self) -> &MessageBroker;

    /// React to one delivered message.
    fn handle_message(&mut self, message: &Message) -> Result<()>;

    /// Return the agent to the profile it was constructed with.
    fn reset_state(&mut self);

    fn snapshot_state(&self) -> Result<AgentSnapshot>;

    fn restore_state(&mut self, snapshot: AgentSnapshot) -> Result<()>;

    /// Drain the mailbox and handle each message in arrival order.
    ///
    /// A failing handler is logged with the offending message and does not
    /// stop the rest of the batch.
    fn process_inbox(&mut self) -> InboxReport {
        let messages = self.broker().drain(self.name());
        let mut report = InboxReport::default();

        for message in &messages {
            match self.handle_message(message) {
                Ok(()) => report.handled += 1,
                Err(e) => {
                    report.failed += 1;
                    tracing::warn!(
                        agent = %self.name(),
                        message_type = %message.message_type(),
                        sender = %message.sender,
                        "Failed to handle message: {} ({:?})",
                        e,
                        message.content
                    );
                }
            }
        }

        if report.total() > 0 {
            tracing::debug!(
                "[{}] processed {} message(s), {} failed",
                self.name(),
                report.handled,
                report.failed
            );
        }
        report
    }
}
