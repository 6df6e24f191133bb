//! Message envelopes carried by the broker.
//!
//! Wire shape:
//! `{id, sender, receiver, content: {message_type, <payload key>, created_at}}`
//! where exactly the payload key matching `message_type` is present.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::types::{
    AgentId, CommitmentBroadcastContent, CommitmentProposalContent, CommitmentResponseContent,
    MessageType, NegotiationStartContent, TrafficState, TrafficUpdateContent,
    ViolationReportContent, BROADCAST,
};

/// Addressee of a message.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Recipient {
    /// Every registered agent except the sender.
    Broadcast,
    Agent(AgentId),
}

impl From<String> for Recipient {
    fn from(value: String) -> Self {
        if value == BROADCAST {
            Recipient::Broadcast
        } else {
            Recipient::Agent(value)
        }
    }
}

impl From<&str> for Recipient {
    fn from(value: &str) -> Self {
        Recipient::from(value.to_string())
    }
}

impl From<Recipient> for String {
    fn from(value: Recipient) -> Self {
        match value {
            Recipient::Broadcast => BROADCAST.to_string(),
            Recipient::Agent(name) => name,
        }
    }
}

impl fmt::Display for Recipient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Recipient::Broadcast => f.write_str(BROADCAST),
            Recipient::Agent(name) => f.write_str(name),
        }
    }
}

/// Typed payload, one variant per message type.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "message_type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Payload {
    TrafficUpdate {
        traffic_update: TrafficUpdateContent,
    },
    NegotiationStart {
        negotiation_start: NegotiationStartContent,
    },
    CommitmentProposal {
        commitment_proposal: CommitmentProposalContent,
    },
    CommitmentResponse {
        commitment_response: CommitmentResponseContent,
    },
    CommitmentBroadcast {
        commitment_broadcast: CommitmentBroadcastContent,
    },
    ViolationReport {
        violation_report: ViolationReportContent,
    },
    /// Acknowledgement of an inbox pass.
    Received { processed: usize, failed: usize },
}

impl Payload {
    /// A full traffic state replacing the monitor's view.
    pub fn traffic_state(state: TrafficState) -> Self {
        Payload::TrafficUpdate {
            traffic_update: TrafficUpdateContent {
                traffic_state: Some(state),
                estimated_students: None,
            },
        }
    }

    /// Per-classroom estimates merged into the monitor's current view.
    pub fn traffic_estimates(estimated_students: BTreeMap<AgentId, u32>) -> Self {
        Payload::TrafficUpdate {
            traffic_update: TrafficUpdateContent {
                traffic_state: None,
                estimated_students: Some(estimated_students),
            },
        }
    }

    pub fn negotiation_start(negotiation_id: impl Into<String>, traffic_state: TrafficState) -> Self {
        Payload::NegotiationStart {
            negotiation_start: NegotiationStartContent {
                negotiation_id: negotiation_id.into(),
                traffic_state,
            },
        }
    }

    pub fn message_type(&self) -> MessageType {
        match self {
            Payload::TrafficUpdate { .. } => MessageType::TrafficUpdate,
            Payload::NegotiationStart { .. } => MessageType::NegotiationStart,
            Payload::CommitmentProposal { .. } => MessageType::CommitmentProposal,
            Payload::CommitmentResponse { .. } => MessageType::CommitmentResponse,
            Payload::CommitmentBroadcast { .. } => MessageType::CommitmentBroadcast,
            Payload::ViolationReport { .. } => MessageType::ViolationReport,
            Payload::Received { .. } => MessageType::Received,
        }
    }

    /// Round the payload belongs to, when it carries one.
    pub fn negotiation_id(&self) -> Option<&str> {
        match self {
            Payload::NegotiationStart { negotiation_start } => {
                Some(negotiation_start.negotiation_id.as_str())
            }
            Payload::CommitmentProposal { commitment_proposal } => {
                Some(commitment_proposal.negotiation_id.as_str())
            }
            Payload::CommitmentResponse {
                commitment_response,
            } => commitment_response.negotiation_id.as_deref(),
            Payload::CommitmentBroadcast {
                commitment_broadcast,
            } => commitment_broadcast.negotiation_id.as_deref(),
            _ => None,
        }
    }
}

impl From<CommitmentProposalContent> for Payload {
    fn from(commitment_proposal: CommitmentProposalContent) -> Self {
        Payload::CommitmentProposal {
            commitment_proposal,
        }
    }
}

impl From<CommitmentResponseContent> for Payload {
    fn from(commitment_response: CommitmentResponseContent) -> Self {
        Payload::CommitmentResponse {
            commitment_response,
        }
    }
}

impl From<CommitmentBroadcastContent> for Payload {
    fn from(commitment_broadcast: CommitmentBroadcastContent) -> Self {
        Payload::CommitmentBroadcast {
            commitment_broadcast,
        }
    }
}

impl From<ViolationReportContent> for Payload {
    fn from(violation_report: ViolationReportContent) -> Self {
        Payload::ViolationReport { violation_report }
    }
}

/// Payload envelope with its creation time.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Structure {
    #[serde(flatten)]
    pub payload: Payload,
    pub created_at: DateTime<Utc>,
}

/// An immutable message between agents.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    /// Unique message ID (ULID)
    pub id: String,
    pub sender: AgentId,
    pub receiver: Recipient,
    pub content: Structure,
}

impl Message {
    pub fn new(sender: impl Into<AgentId>, receiver: Recipient, payload: impl Into<Payload>) -> Self {
        Self {
            id: ulid::Ulid::new().to_string(),
            sender: sender.into(),
            receiver,
            content: Structure {
                payload: payload.into(),
                created_at: Utc::now(),
            },
        }
    }

    /// Address a single agent.
    pub fn direct(
        sender: impl Into<AgentId>,
        receiver: impl Into<AgentId>,
        payload: impl Into<Payload>,
    ) -> Self {
        Self::new(sender, Recipient::Agent(receiver.into()), payload)
    }

    /// Address every registered agent except the sender.
    pub fn broadcast(sender: impl Into<AgentId>, payload: impl Into<Payload>) -> Self {
        Self::new(sender, Recipient::Broadcast, payload)
    }

    /// Direct reply to this message's sender.
    pub fn reply(&self, from: impl Into<AgentId>, payload: impl Into<Payload>) -> Self {
        Self::direct(from, self.sender.clone(), payload)
    }

    pub fn payload(&self) -> &Payload {
        &self.content.payload
    }

    pub fn message_type(&self) -> MessageType {
        self.content.payload.message_type()
    }

    pub fn negotiation_id(&self) -> Option<&str> {
        self.content.payload.negotiation_id()
    }

    pub fn is_broadcast(&self) -> bool {
        self.receiver == Recipient::Broadcast
    }

    /// Whether delivery would place this message in `agent_id`'s mailbox.
    pub fn is_for(&self, agent_id: &str) -> bool {
        match &self.receiver {
            Recipient::Broadcast => self.sender != agent_id,
            Recipient::Agent(name) => name == agent_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::types::{Commitment, CommitmentType};

    #[test]
    fn test_recipient_wire_form() {
        assert_eq!(Recipient::from("BROADCAST"), Recipient::Broadcast);
        assert_eq!(
            Recipient::from("ClassroomA"),
            Recipient::Agent("ClassroomA".to_string())
        );
        assert_eq!(
            serde_json::to_value(Recipient::Broadcast).unwrap(),
            serde_json::json!("BROADCAST")
        );
    }

    #[test]
    fn test_only_matching_payload_key_present() {
        let commitment = Commitment::propose("ClassroomA", CommitmentType::EarlyExit, 2, true, 1);
        let proposal = CommitmentProposalContent {
            commitment,
            negotiation_id: "round-1".to_string(),
            conditions: None,
            student_count: Some(12),
            reason: None,
        };
        let msg = Message::broadcast("ClassroomA", proposal);

        let value = serde_json::to_value(&msg).unwrap();
        let content = value["content"].as_object().unwrap();
        assert_eq!(content["message_type"], "COMMITMENT_PROPOSAL");
        assert!(content.contains_key("commitment_proposal"));
        assert!(content.contains_key("created_at"));
        assert!(!content.contains_key("commitment_response"));
        assert!(!content.contains_key("traffic_update"));
        assert_eq!(value["receiver"], "BROADCAST");

        let back: Message = serde_json::from_value(value).unwrap();
        assert_eq!(back.negotiation_id(), Some("round-1"));
        assert_eq!(back.message_type(), MessageType::CommitmentProposal);
    }

    #[test]
    fn test_reply_targets_sender() {
        let start = Message::broadcast(
            "Bottleneck",
            Payload::negotiation_start("round-1", TrafficState::idle(50)),
        );
        let reply = start.reply("ClassroomA", Payload::Received { processed: 1, failed: 0 });

        assert_eq!(reply.sender, "ClassroomA");
        assert_eq!(reply.receiver, Recipient::Agent("Bottleneck".to_string()));
        assert!(start.is_for("ClassroomA"));
        assert!(!start.is_for("Bottleneck"));
        assert!(reply.is_for("Bottleneck"));
        assert!(!reply.is_for("ClassroomB"));
    }
}
