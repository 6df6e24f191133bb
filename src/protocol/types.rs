//! Vocabulary shared by the bottleneck monitor and classroom agents.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

use crate::error::{Error, Result};

/// Agent name; the identity key for mailboxes, trust and obligation ledgers.
pub type AgentId = String;

/// Wire value addressing every registered agent except the sender.
pub const BROADCAST: &str = "BROADCAST";

/// Accepter placeholder on a commitment nobody has taken yet.
pub const OPEN_ACCEPTER: &str = "OPEN";

/// Clamp a scalar into [0, 1]. NaN collapses to 0.
pub fn clamp_unit(value: f64) -> f64 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 1.0)
    }
}

fn deserialize_unit<'de, D>(deserializer: D) -> std::result::Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<f64>::deserialize(deserializer)?;
    Ok(clamp_unit(value.unwrap_or(0.0)))
}

/// Message type classification.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageType {
    TrafficUpdate,
    NegotiationStart,
    CommitmentProposal,
    CommitmentResponse,
    CommitmentBroadcast,
    ViolationReport,
    Received,
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MessageType::TrafficUpdate => "TRAFFIC_UPDATE",
            MessageType::NegotiationStart => "NEGOTIATION_START",
            MessageType::CommitmentProposal => "COMMITMENT_PROPOSAL",
            MessageType::CommitmentResponse => "COMMITMENT_RESPONSE",
            MessageType::CommitmentBroadcast => "COMMITMENT_BROADCAST",
            MessageType::ViolationReport => "VIOLATION_REPORT",
            MessageType::Received => "RECEIVED",
        };
        f.write_str(s)
    }
}

/// The schedule concession a commitment offers.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CommitmentType {
    /// Finish `adjustment_minutes` earlier.
    EarlyExit,
    /// Finish `adjustment_minutes` later.
    LateExit,
    /// Release students in spaced batches.
    StaggeredExit,
}

impl fmt::Display for CommitmentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommitmentType::EarlyExit => write!(f, "EARLY_EXIT"),
            CommitmentType::LateExit => write!(f, "LATE_EXIT"),
            CommitmentType::StaggeredExit => write!(f, "STAGGERED_EXIT"),
        }
    }
}

/// Commitment lifecycle status.
///
/// Transitions only move forward: proposed -> accepted -> fulfilled | violated.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum CommitmentStatus {
    Proposed,
    Accepted,
    Fulfilled,
    Violated,
}

impl CommitmentStatus {
    fn rank(self) -> u8 {
        match self {
            CommitmentStatus::Proposed => 0,
            CommitmentStatus::Accepted => 1,
            CommitmentStatus::Fulfilled | CommitmentStatus::Violated => 2,
        }
    }

    /// Whether `next` is a legal successor of this status.
    pub fn can_advance_to(self, next: CommitmentStatus) -> bool {
        next.rank() == self.rank() + 1
    }

    /// Fulfilled and violated are terminal.
    pub fn is_settled(self) -> bool {
        self.rank() == 2
    }
}

impl fmt::Display for CommitmentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommitmentStatus::Proposed => write!(f, "proposed"),
            CommitmentStatus::Accepted => write!(f, "accepted"),
            CommitmentStatus::Fulfilled => write!(f, "fulfilled"),
            CommitmentStatus::Violated => write!(f, "violated"),
        }
    }
}

/// Outcome of evaluating a proposal.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Decision {
    Accept,
    Reject,
}

/// A voluntary schedule concession.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Commitment {
    pub id: String,
    pub proposer: AgentId,
    pub accepter: AgentId,
    pub commitment_type: CommitmentType,
    pub adjustment_minutes: u32,
    pub reciprocal_obligation: bool,
    pub priority: i32,
    status: CommitmentStatus,
    pub timestamp: DateTime<Utc>,
}

impl Commitment {
    /// Create an open commitment in the `proposed` state.
    pub fn propose(
        proposer: impl Into<AgentId>,
        commitment_type: CommitmentType,
        adjustment_minutes: u32,
        reciprocal_obligation: bool,
        priority: i32,
    ) -> Self {
        Self {
            id: ulid::Ulid::new().to_string(),
            proposer: proposer.into(),
            accepter: OPEN_ACCEPTER.to_string(),
            commitment_type,
            adjustment_minutes,
            reciprocal_obligation,
            priority,
            status: CommitmentStatus::Proposed,
            timestamp: Utc::now(),
        }
    }

    pub fn status(&self) -> CommitmentStatus {
        self.status
    }

    /// Whether no agent has taken this commitment yet.
    pub fn is_open(&self) -> bool {
        self.accepter == OPEN_ACCEPTER
    }

    /// Bind the commitment to an accepter.
    pub fn accept(&mut self, accepter: impl Into<AgentId>) -> Result<()> {
        self.advance(CommitmentStatus::Accepted)?;
        self.accepter = accepter.into();
        Ok(())
    }

    pub fn fulfil(&mut self) -> Result<()> {
        self.advance(CommitmentStatus::Fulfilled)
    }

    pub fn violate(&mut self) -> Result<()> {
        self.advance(CommitmentStatus::Violated)
    }

    /// Move to `next`, refusing anything but the immediate forward step.
    pub fn advance(&mut self, next: CommitmentStatus) -> Result<()> {
        if !self.status.can_advance_to(next) {
            return Err(Error::InvalidTransition {
                commitment_id: self.id.clone(),
                from: self.status.to_string(),
                to: next.to_string(),
            });
        }
        self.status = next;
        Ok(())
    }
}

/// Snapshot of the exit bottleneck.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TrafficState {
    pub current_flow: u32,
    pub capacity_remaining: u32,
    /// Expected head count per classroom.
    #[serde(default)]
    pub estimated_students: BTreeMap<AgentId, u32>,
    #[serde(default, deserialize_with = "deserialize_unit")]
    congestion_risk: f64,
    pub timestamp: DateTime<Utc>,
}

impl TrafficState {
    pub fn new(
        current_flow: u32,
        capacity_remaining: u32,
        estimated_students: BTreeMap<AgentId, u32>,
        congestion_risk: f64,
    ) -> Self {
        Self {
            current_flow,
            capacity_remaining,
            estimated_students,
            congestion_risk: clamp_unit(congestion_risk),
            timestamp: Utc::now(),
        }
    }

    /// An empty state with the full capacity available.
    pub fn idle(capacity_remaining: u32) -> Self {
        Self::new(0, capacity_remaining, BTreeMap::new(), 0.0)
    }

    pub fn congestion_risk(&self) -> f64 {
        self.congestion_risk
    }

    pub fn set_congestion_risk(&mut self, risk: f64) {
        self.congestion_risk = clamp_unit(risk);
        self.timestamp = Utc::now();
    }

    pub fn total_students(&self) -> u64 {
        self.estimated_students.values().map(|&n| u64::from(n)).sum()
    }

    /// Fraction of the total expected load that `attendance` represents; 0 when
    /// nobody is expected.
    pub fn share_of(&self, attendance: u32) -> f64 {
        let total = self.total_students();
        if total == 0 {
            return 0.0;
        }
        f64::from(attendance) / total as f64
    }
}

/// Body of a traffic update. At least one field must be present.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct TrafficUpdateContent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub traffic_state: Option<TrafficState>,
    /// Per-classroom estimates merged into the held state when no full state is sent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub estimated_students: Option<BTreeMap<AgentId, u32>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NegotiationStartContent {
    pub negotiation_id: String,
    pub traffic_state: TrafficState,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CommitmentProposalContent {
    pub commitment: Commitment,
    pub negotiation_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conditions: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub student_count: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CommitmentResponseContent {
    pub commitment: Commitment,
    pub decision: Decision,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decision_score: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub negotiation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accepter_students: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub acceptance_reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CommitmentBroadcastContent {
    pub proposer: AgentId,
    pub accepter: AgentId,
    pub commitment: Commitment,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub negotiation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proposer_students: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accepter_students: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ViolationReportContent {
    pub agent_id: AgentId,
    pub violation_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
    pub timestamp: DateTime<Utc>,
}
