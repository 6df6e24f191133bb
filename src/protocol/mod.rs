//! Agent communication protocol for exitpact.
//!
//! This module defines the negotiation wire vocabulary and its transport:
//! - Typed payloads for traffic updates, round starts, proposals, responses,
//!   deal broadcasts and violation reports
//! - Message envelopes addressed to one agent or broadcast
//! - Per-agent FIFO mailboxes behind a shared broker

pub mod envelope;
pub mod mailbox;
pub mod types;

pub use envelope::{Message, Payload, Recipient, Structure};
pub use mailbox::{Mailbox, MailboxStats, MessageBroker};
pub use types::{
    clamp_unit, AgentId, Commitment, CommitmentBroadcastContent, CommitmentProposalContent,
    CommitmentResponseContent, CommitmentStatus, CommitmentType, Decision, MessageType,
    NegotiationStartContent, TrafficState, TrafficUpdateContent, ViolationReportContent,
    BROADCAST, OPEN_ACCEPTER,
};
