//! Negotiation round tracking.
//!
//! Handles:
//! - Phase progression per negotiation id (open, proposed, responded, confirmed)
//! - Commitments accepted within each round
//! - Expiry of rounds that never reach confirmation

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::protocol::{Commitment, Decision, Message, Payload};

/// How far a round has progressed.
///
/// Ordered so that a later phase compares greater. `Expired` is terminal and
/// only reachable through [`NegotiationRound::expire`].
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RoundPhase {
    /// Start broadcast sent.
    Open,
    /// At least one proposal broadcast.
    Proposed,
    /// At least one accepting response sent.
    Responded,
    /// A deal broadcast sent.
    Confirmed,
    /// Timed out before confirmation.
    Expired,
}

/// One congestion-triggered negotiation cycle.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NegotiationRound {
    pub id: String,
    pub phase: RoundPhase,
    /// Agents seen proposing or confirming within the round.
    pub participants: Vec<String>,
    pub accepted_commitments: Vec<Commitment>,
    pub opened_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl NegotiationRound {
    pub fn new(id: &str) -> Self {
        let now = Utc::now();
        Self {
            id: id.to_string(),
            phase: RoundPhase::Open,
            participants: Vec::new(),
            accepted_commitments: Vec::new(),
            opened_at: now,
            updated_at: now,
        }
    }

    /// Move forward to `phase`. Returns `false` when the round is expired or
    /// already at or past it.
    pub fn advance(&mut self, phase: RoundPhase) -> bool {
        if self.is_expired() || phase == RoundPhase::Expired || phase <= self.phase {
            return false;
        }
        self.phase = phase;
        self.updated_at = Utc::now();
        true
    }

    /// Mark the round expired unless it was already confirmed.
    pub fn expire(&mut self) -> bool {
        if matches!(self.phase, RoundPhase::Confirmed | RoundPhase::Expired) {
            return false;
        }
        self.phase = RoundPhase::Expired;
        self.updated_at = Utc::now();
        true
    }

    pub fn is_expired(&self) -> bool {
        self.phase == RoundPhase::Expired
    }

    pub fn add_participant(&mut self, agent_id: &str) {
        if !self.participants.iter().any(|p| p == agent_id) {
            self.participants.push(agent_id.to_string());
        }
        self.updated_at = Utc::now();
    }

    /// Record a commitment, replacing an earlier copy with the same id.
    pub fn record_commitment(&mut self, commitment: Commitment) {
        match self
            .accepted_commitments
            .iter_mut()
            .find(|c| c.id == commitment.id)
        {
            Some(existing) => *existing = commitment,
            None => self.accepted_commitments.push(commitment),
        }
        self.updated_at = Utc::now();
    }
}

/// All rounds the monitor knows about, keyed by negotiation id.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RoundBook {
    rounds: HashMap<String, NegotiationRound>,
}

impl RoundBook {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a new round; an existing round with the same id is kept.
    pub fn open(&mut self, id: &str) -> &mut NegotiationRound {
        self.rounds
            .entry(id.to_string())
            .or_insert_with(|| NegotiationRound::new(id))
    }

    pub fn get(&self, id: &str) -> Option<&NegotiationRound> {
        self.rounds.get(id)
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut NegotiationRound> {
        self.rounds.get_mut(id)
    }

    pub fn len(&self) -> usize {
        self.rounds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rounds.is_empty()
    }

    /// Expire unconfirmed rounds opened more than `timeout` before `now`.
    /// Returns the ids that expired.
    pub fn expire_stale(&mut self, now: DateTime<Utc>, timeout: Duration) -> Vec<String> {
        let mut expired = Vec::new();
        for round in self.rounds.values_mut() {
            if now - round.opened_at > timeout && round.expire() {
                expired.push(round.id.clone());
            }
        }
        expired
    }

    /// Drop confirmed or expired rounds untouched for longer than `max_age`.
    pub fn cleanup(&mut self, now: DateTime<Utc>, max_age: Duration) -> usize {
        let before = self.rounds.len();
        self.rounds
            .retain(|_, r| r.phase < RoundPhase::Confirmed || now - r.updated_at <= max_age);
        before - self.rounds.len()
    }
}

/// Furthest phase `negotiation_id` reached according to a message log.
///
/// Walks START, PROPOSAL, accepting RESPONSE and BROADCAST messages; returns
/// `None` when the log never mentions the round.
pub fn trace_phase(history: &[Message], negotiation_id: &str) -> Option<RoundPhase> {
    history
        .iter()
        .filter(|m| m.negotiation_id() == Some(negotiation_id))
        .filter_map(|m| match m.payload() {
            Payload::NegotiationStart { .. } => Some(RoundPhase::Open),
            Payload::CommitmentProposal { .. } => Some(RoundPhase::Proposed),
            Payload::CommitmentResponse {
                commitment_response,
            } if commitment_response.decision == Decision::Accept => Some(RoundPhase::Responded),
            Payload::CommitmentBroadcast { .. } => Some(RoundPhase::Confirmed),
            _ => None,
        })
        .max()
}
