//! Classroom agent.
//!
//! A classroom proposes schedule concessions when the exit is congested,
//! weighs the concessions its peers offer, and keeps its own ledger of
//! commitments, favors owed and trust in each peer.
//!
//! Obligation credit: each accepted reciprocal commitment moves the accepter's
//! credit up by one and the proposer's down by one. The credit feeds back into
//! how willing the agent is to move its own schedule.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use super::monitor::DEFAULT_MONITOR;
use super::{Agent, AgentSnapshot};
use crate::config::SystemConfig;
use crate::error::{Error, Result};
use crate::protocol::{
    clamp_unit, AgentId, Commitment, CommitmentBroadcastContent, CommitmentProposalContent,
    CommitmentResponseContent, CommitmentStatus, CommitmentType, Decision, Message,
    MessageBroker, MessageType, NegotiationStartContent, Payload, TrafficState,
    ViolationReportContent,
};

/// Trust extended to a peer with no track record.
pub const DEFAULT_TRUST: f64 = 0.5;

const TRUST_REWARD: f64 = 0.1;
const TRUST_PENALTY: f64 = 0.2;

/// Upper bound on students released per staggered batch.
const MAX_BATCH_SIZE: u32 = 30;

/// Attendance above which an early exit from a peer is worth more.
const CROWDED_ATTENDANCE: u32 = 30;

/// Construction-time description of a classroom; `reset_state` returns here.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ClassroomProfile {
    pub attendance: u32,
    /// Professor's willingness to move the schedule, in [0, 1].
    pub flexibility: f64,
    pub end_time: DateTime<Utc>,
}

impl ClassroomProfile {
    /// A class ending an hour from now.
    pub fn new(attendance: u32, flexibility: f64) -> Self {
        Self {
            attendance,
            flexibility: clamp_unit(flexibility),
            end_time: Utc::now() + Duration::hours(1),
        }
    }

    pub fn with_end_time(mut self, end_time: DateTime<Utc>) -> Self {
        self.end_time = end_time;
        self
    }
}

/// Schedule facts the classroom exposes.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ClassroomState {
    pub current_attendance: u32,
    pub flexibility: f64,
    pub end_time: DateTime<Utc>,
    pub exit_slots: Vec<DateTime<Utc>>,
}

impl From<&ClassroomProfile> for ClassroomState {
    fn from(profile: &ClassroomProfile) -> Self {
        Self {
            current_attendance: profile.attendance,
            flexibility: profile.flexibility,
            end_time: profile.end_time,
            exit_slots: Vec::new(),
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
struct OpenOffer {
    negotiation_id: String,
    commitment: Commitment,
}

/// Everything the classroom learned through negotiation.
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
struct Ledger {
    commitment_history: Vec<Commitment>,
    /// Own proposals nobody has accepted yet.
    offered: BTreeMap<String, OpenOffer>,
    /// Peer proposals this agent accepted, awaiting the proposer's confirmation.
    pending: BTreeMap<String, Commitment>,
    /// Commitment id -> negotiation id.
    rounds: HashMap<String, String>,
    obligation_credits: i32,
    violation_count: u32,
    trust_scores: HashMap<AgentId, f64>,
    current_negotiation: Option<String>,
    received_proposals: Vec<Message>,
}

#[derive(Serialize, Deserialize)]
struct ClassroomSnapshot {
    state: ClassroomState,
    ledger: Ledger,
}

/// Read-only view for driver-side reporting.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ClassroomReport {
    pub name: String,
    pub attendance: u32,
    pub end_time: DateTime<Utc>,
    pub exit_slots: Vec<DateTime<Utc>>,
    pub obligation_credits: i32,
    pub violation_count: u32,
    pub commitments: Vec<Commitment>,
}

/// A classroom taking part in exit negotiations.
pub struct ClassroomAgent {
    name: String,
    description: String,
    broker: MessageBroker,
    config: SystemConfig,
    monitor: AgentId,
    profile: ClassroomProfile,
    state: ClassroomState,
    ledger: Ledger,
}

impl ClassroomAgent {
    /// Create the classroom and register its mailbox.
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        broker: MessageBroker,
        config: SystemConfig,
        profile: ClassroomProfile,
    ) -> Self {
        let name = name.into();
        broker.register(&name);
        tracing::info!("Agent ClassroomAgent initialized - {}", name);

        Self {
            state: ClassroomState::from(&profile),
            name,
            description: description.into(),
            broker,
            config,
            monitor: DEFAULT_MONITOR.to_string(),
            profile,
            ledger: Ledger::default(),
        }
    }

    /// Address violation reports to `monitor`.
    pub fn with_monitor(mut self, monitor: impl Into<AgentId>) -> Self {
        self.monitor = monitor.into();
        self
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn state(&self) -> &ClassroomState {
        &self.state
    }

    pub fn attendance(&self) -> u32 {
        self.state.current_attendance
    }

    /// Record the head count the environment currently observes.
    pub fn observe_attendance(&mut self, attendance: u32) {
        self.state.current_attendance = attendance;
    }

    /// Replace the exit slots with a schedule computed outside the agent.
    pub fn assign_exit_slots(&mut self, slots: Vec<DateTime<Utc>>) {
        self.state.exit_slots = slots;
    }

    pub fn obligation_credits(&self) -> i32 {
        self.ledger.obligation_credits
    }

    pub fn violation_count(&self) -> u32 {
        self.ledger.violation_count
    }

    pub fn commitment_history(&self) -> &[Commitment] {
        &self.ledger.commitment_history
    }

    pub fn commitment(&self, id: &str) -> Option<&Commitment> {
        self.ledger.commitment_history.iter().find(|c| c.id == id)
    }

    pub fn pending_commitments(&self) -> Vec<&Commitment> {
        self.ledger.pending.values().collect()
    }

    pub fn offered_commitments(&self) -> Vec<&Commitment> {
        self.ledger.offered.values().map(|o| &o.commitment).collect()
    }

    pub fn current_negotiation(&self) -> Option<&str> {
        self.ledger.current_negotiation.as_deref()
    }

    pub fn received_proposals(&self) -> &[Message] {
        &self.ledger.received_proposals
    }

    /// Trust in `peer`, without recording anything for unknown peers.
    pub fn trust_score(&self, peer: &str) -> f64 {
        self.ledger
            .trust_scores
            .get(peer)
            .copied()
            .unwrap_or(DEFAULT_TRUST)
    }

    /// Reward a kept commitment, penalize a broken one.
    pub fn update_trust_score(&mut self, peer: &str, fulfilled: bool) {
        let trust = self
            .ledger
            .trust_scores
            .entry(peer.to_string())
            .or_insert(DEFAULT_TRUST);
        let delta = if fulfilled { TRUST_REWARD } else { -TRUST_PENALTY };
        *trust = clamp_unit(*trust + delta);
        tracing::debug!("[{}] Trust in {} is now {:.2}", self.name, peer, *trust);
    }

    /// Willingness to move the schedule by `minutes`, in [0, 1].
    ///
    /// Owing favors (negative credit) raises willingness, being owed lowers it.
    pub fn adjustment_score(&self, minutes: i32) -> f64 {
        let max_adjustment = f64::from(self.config.max_adjustment.max(1));
        let adjustment_factor = 1.0 - f64::from(minutes.unsigned_abs()) / max_adjustment;
        let obligation_factor =
            (1.0 - 0.1 * f64::from(self.ledger.obligation_credits)).clamp(0.5, 1.5);

        clamp_unit(self.state.flexibility * adjustment_factor * obligation_factor)
    }

    /// Concessions this classroom is willing to offer under `traffic`.
    fn plan_commitments(&self, traffic: &TrafficState) -> Vec<Commitment> {
        let policy = &self.config.proposal;
        let risk = traffic.congestion_risk();
        let mut planned = Vec::new();

        if risk < policy.min_risk || traffic.total_students() == 0 {
            return planned;
        }

        let attendance = self.state.current_attendance;
        let share = traffic.share_of(attendance);

        if share < policy.early_exit_max_share && risk > policy.early_exit_min_risk {
            let candidate = policy.early_exit_candidates.iter().copied().find(|&minutes| {
                self.adjustment_score(-(minutes as i32)) > policy.early_exit_min_score
            });
            if let Some(minutes) = candidate {
                planned.push(Commitment::propose(
                    self.name.as_str(),
                    CommitmentType::EarlyExit,
                    minutes,
                    true,
                    1,
                ));
            }
        }

        let credits = self.ledger.obligation_credits;
        if credits < 0 && risk > policy.debt_min_risk {
            let minutes = policy.debt_max_minutes.min(credits.unsigned_abs() * 2);
            if self.adjustment_score(minutes as i32) > policy.debt_min_score {
                planned.push(Commitment::propose(
                    self.name.as_str(),
                    CommitmentType::LateExit,
                    minutes,
                    false,
                    2,
                ));
            }
        }

        if share > policy.stagger_min_share
            && attendance > policy.stagger_min_attendance
            && self.adjustment_score(0) > policy.stagger_min_score
        {
            planned.push(Commitment::propose(
                self.name.as_str(),
                CommitmentType::StaggeredExit,
                0,
                false,
                3,
            ));
        }

        planned
    }

    fn proposal_message(&self, commitment: Commitment, negotiation_id: &str) -> Message {
        let (conditions, reason) = match commitment.commitment_type {
            CommitmentType::EarlyExit => (
                format!(
                    "Will finish {} minutes early; seeking reciprocal favor",
                    commitment.adjustment_minutes
                ),
                "Small class can help reduce congestion",
            ),
            CommitmentType::LateExit => (
                format!(
                    "Will finish {} minutes late to repay an outstanding favor",
                    commitment.adjustment_minutes
                ),
                "Returning a favor owed to peers",
            ),
            CommitmentType::StaggeredExit => (
                "Will release students in spaced batches".to_string(),
                "Large class dominates the exit load",
            ),
        };

        Message::broadcast(
            self.name.as_str(),
            CommitmentProposalContent {
                commitment,
                negotiation_id: negotiation_id.to_string(),
                conditions: Some(conditions),
                student_count: Some(self.state.current_attendance),
                reason: Some(reason.to_string()),
            },
        )
    }

    /// Proposal broadcasts for a round, derived only from current state and
    /// the round's traffic view.
    pub fn generate_proposals(&self, traffic: &TrafficState, negotiation_id: &str) -> Vec<Message> {
        self.plan_commitments(traffic)
            .into_iter()
            .map(|commitment| self.proposal_message(commitment, negotiation_id))
            .collect()
    }

    /// What accepting `commitment` is worth to this classroom.
    pub fn proposal_benefit(&self, commitment: &Commitment) -> f64 {
        match commitment.commitment_type {
            CommitmentType::EarlyExit => {
                if self.state.current_attendance > CROWDED_ATTENDANCE {
                    0.6
                } else {
                    0.3
                }
            }
            CommitmentType::StaggeredExit => 0.4,
            CommitmentType::LateExit => {
                if self.ledger.obligation_credits > 0 {
                    0.5
                } else {
                    0.1
                }
            }
        }
    }

    /// Trust in the proposer plus benefit, less the cost of a reciprocal
    /// obligation, plus a priority bonus.
    pub fn proposal_score(&self, commitment: &Commitment) -> f64 {
        let policy = &self.config.proposal;
        let obligation_cost = if commitment.reciprocal_obligation {
            policy.reciprocal_cost
        } else {
            0.0
        };

        self.trust_score(&commitment.proposer) + self.proposal_benefit(commitment) - obligation_cost
            + policy.priority_weight * f64::from(commitment.priority)
    }

    /// Decide on a peer's proposal.
    ///
    /// Accepting records the commitment as pending, adjusts the obligation
    /// credit and returns the response to send. Rejections are silent.
    pub fn evaluate_proposal(&mut self, message: &Message) -> Result<Option<Message>> {
        let proposal = match message.payload() {
            Payload::CommitmentProposal {
                commitment_proposal,
            } => commitment_proposal,
            _ => {
                return Err(Error::malformed(
                    &self.name,
                    message.message_type(),
                    "expected a commitment proposal",
                ))
            }
        };

        let commitment = &proposal.commitment;
        if commitment.proposer == self.name || message.sender == self.name {
            return Ok(None);
        }
        if commitment.status() != CommitmentStatus::Proposed || !commitment.is_open() {
            return Err(Error::malformed(
                &self.name,
                MessageType::CommitmentProposal,
                format!("commitment {} is no longer open", commitment.id),
            ));
        }
        if self.ledger.pending.contains_key(&commitment.id) || self.commitment(&commitment.id).is_some()
        {
            return Ok(None);
        }

        let score = self.proposal_score(commitment);
        if score <= self.config.proposal.acceptance_threshold {
            tracing::debug!(
                "[{}] Declined {} from {} (score {:.2})",
                self.name,
                commitment.commitment_type,
                commitment.proposer,
                score
            );
            return Ok(None);
        }

        let mut accepted = commitment.clone();
        accepted.accept(self.name.as_str())?;
        if accepted.reciprocal_obligation {
            self.ledger.obligation_credits += 1;
        }
        self.ledger
            .rounds
            .insert(accepted.id.clone(), proposal.negotiation_id.clone());
        self.ledger
            .pending
            .insert(accepted.id.clone(), accepted.clone());

        tracing::info!(
            "[{}] Accepting {} {}min from {} (score {:.2})",
            self.name,
            accepted.commitment_type,
            accepted.adjustment_minutes,
            accepted.proposer,
            score
        );

        let response = CommitmentResponseContent {
            commitment: accepted,
            decision: Decision::Accept,
            decision_score: Some(score),
            negotiation_id: Some(proposal.negotiation_id.clone()),
            accepter_students: Some(self.state.current_attendance),
            acceptance_reason: None,
        };
        Ok(Some(message.reply(self.name.as_str(), response)))
    }

    /// Withdraw own offers and release unconfirmed acceptances that belong to
    /// any round other than `negotiation_id`.
    fn close_stale_rounds(&mut self, negotiation_id: &str) {
        let stale_offers: Vec<String> = self
            .ledger
            .offered
            .iter()
            .filter(|(_, offer)| offer.negotiation_id != negotiation_id)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &stale_offers {
            self.ledger.offered.remove(id);
            self.ledger.rounds.remove(id);
        }

        let stale_pending: Vec<String> = self
            .ledger
            .pending
            .keys()
            .filter(|id| self.ledger.rounds.get(*id).map(String::as_str) != Some(negotiation_id))
            .cloned()
            .collect();
        for id in &stale_pending {
            if let Some(pending) = self.ledger.pending.remove(id) {
                if pending.reciprocal_obligation {
                    self.ledger.obligation_credits -= 1;
                }
            }
            self.ledger.rounds.remove(id);
        }

        if !stale_offers.is_empty() || !stale_pending.is_empty() {
            tracing::debug!(
                "[{}] Withdrew {} offer(s) and released {} acceptance(s) from earlier rounds",
                self.name,
                stale_offers.len(),
                stale_pending.len()
            );
        }
    }

    fn on_negotiation_start(&mut self, start: &NegotiationStartContent) -> Result<()> {
        self.close_stale_rounds(&start.negotiation_id);
        self.ledger.current_negotiation = Some(start.negotiation_id.clone());
        self.ledger.received_proposals.clear();

        let proposals = self.generate_proposals(&start.traffic_state, &start.negotiation_id);
        tracing::info!(
            "[{}] Round {}: offering {} proposal(s)",
            self.name,
            start.negotiation_id,
            proposals.len()
        );

        for proposal in proposals {
            if let Payload::CommitmentProposal {
                commitment_proposal,
            } = proposal.payload()
            {
                let commitment = commitment_proposal.commitment.clone();
                self.ledger
                    .rounds
                    .insert(commitment.id.clone(), start.negotiation_id.clone());
                self.ledger.offered.insert(
                    commitment.id.clone(),
                    OpenOffer {
                        negotiation_id: start.negotiation_id.clone(),
                        commitment,
                    },
                );
            }
            self.broker.send(proposal)?;
        }
        Ok(())
    }

    fn on_commitment_proposal(&mut self, message: &Message) -> Result<()> {
        self.ledger.received_proposals.push(message.clone());
        if let Some(response) = self.evaluate_proposal(message)? {
            self.broker.send(response)?;
        }
        Ok(())
    }

    /// Confirm the first acceptance of an offer and announce the deal.
    fn on_commitment_response(
        &mut self,
        sender: &str,
        response: &CommitmentResponseContent,
    ) -> Result<()> {
        if response.decision != Decision::Accept {
            tracing::debug!("[{}] {} declined {}", self.name, sender, response.commitment.id);
            return Ok(());
        }

        let id = &response.commitment.id;
        if response.commitment.proposer != self.name || response.commitment.accepter != sender {
            return Err(Error::malformed(
                &self.name,
                MessageType::CommitmentResponse,
                format!("response from {} does not match commitment {}", sender, id),
            ));
        }

        let Some(offer) = self.ledger.offered.remove(id) else {
            if self.commitment(id).is_some() {
                tracing::debug!(
                    "[{}] Commitment {} already taken; ignoring late acceptance from {}",
                    self.name,
                    id,
                    sender
                );
                return Ok(());
            }
            return Err(Error::UnknownCommitment(id.clone()));
        };

        let mut commitment = offer.commitment;
        commitment.accept(sender)?;
        if commitment.reciprocal_obligation {
            self.ledger.obligation_credits -= 1;
        }
        self.ledger.commitment_history.push(commitment.clone());

        tracing::info!(
            "[{}] Commitment {} in round {} is accepted by {}",
            self.name,
            id,
            offer.negotiation_id,
            sender
        );

        let broadcast = CommitmentBroadcastContent {
            proposer: self.name.clone(),
            accepter: sender.to_string(),
            commitment,
            negotiation_id: Some(offer.negotiation_id),
            proposer_students: Some(self.state.current_attendance),
            accepter_students: response.accepter_students,
        };
        self.broker
            .send(Message::broadcast(self.name.as_str(), broadcast))?;
        Ok(())
    }

    /// Track deals and their outcomes announced by proposers.
    fn on_commitment_broadcast(&mut self, broadcast: &CommitmentBroadcastContent) -> Result<()> {
        let commitment = &broadcast.commitment;
        if commitment.proposer == self.name {
            return Ok(());
        }

        match commitment.status() {
            CommitmentStatus::Proposed => Err(Error::malformed(
                &self.name,
                MessageType::CommitmentBroadcast,
                format!("commitment {} was announced unaccepted", commitment.id),
            )),
            CommitmentStatus::Accepted => {
                let Some(pending) = self.ledger.pending.remove(&commitment.id) else {
                    return Ok(());
                };
                if commitment.accepter == self.name {
                    tracing::info!(
                        "[{}] {} confirmed commitment {}",
                        self.name,
                        commitment.proposer,
                        commitment.id
                    );
                    self.ledger.commitment_history.push(pending);
                } else {
                    if pending.reciprocal_obligation {
                        self.ledger.obligation_credits -= 1;
                    }
                    self.ledger.rounds.remove(&commitment.id);
                    tracing::debug!(
                        "[{}] Commitment {} went to {}; releasing",
                        self.name,
                        commitment.id,
                        commitment.accepter
                    );
                }
                Ok(())
            }
            outcome @ (CommitmentStatus::Fulfilled | CommitmentStatus::Violated) => {
                if commitment.accepter != self.name {
                    return Ok(());
                }
                if let Some(pending) = self.ledger.pending.remove(&commitment.id) {
                    self.ledger.commitment_history.push(pending);
                }

                let entry = self
                    .ledger
                    .commitment_history
                    .iter_mut()
                    .find(|c| c.id == commitment.id)
                    .ok_or_else(|| Error::UnknownCommitment(commitment.id.clone()))?;
                if entry.status() == outcome {
                    return Ok(());
                }
                entry.advance(outcome)?;

                let fulfilled = outcome == CommitmentStatus::Fulfilled;
                self.update_trust_score(&commitment.proposer, fulfilled);
                tracing::info!(
                    "[{}] {} {} commitment {}",
                    self.name,
                    commitment.proposer,
                    if fulfilled { "kept" } else { "broke" },
                    commitment.id
                );
                Ok(())
            }
        }
    }

    fn apply_schedule_effect(&mut self, commitment: &Commitment) -> Result<()> {
        let shift = Duration::minutes(i64::from(commitment.adjustment_minutes));
        match commitment.commitment_type {
            CommitmentType::EarlyExit => self.state.end_time = self.state.end_time - shift,
            CommitmentType::LateExit => self.state.end_time = self.state.end_time + shift,
            CommitmentType::StaggeredExit => {
                let attendance = self.state.current_attendance;
                let batch = MAX_BATCH_SIZE.min(attendance / 3);
                if batch == 0 {
                    return Err(Error::Execution {
                        commitment_id: commitment.id.clone(),
                        reason: format!("{} students cannot be split into batches", attendance),
                    });
                }

                let spacing = i64::from(self.config.batch_spacing);
                let base = self.state.end_time;
                self.state.exit_slots = (0..attendance)
                    .step_by(batch as usize)
                    .map(|i| base + Duration::minutes(i64::from(i / batch) * spacing))
                    .collect();
            }
        }
        Ok(())
    }

    /// Apply a commitment's schedule effect and mark it fulfilled in history.
    ///
    /// Every call re-applies the effect; call it once per commitment.
    pub fn exec_commitment(&mut self, commitment: &Commitment) -> Result<Commitment> {
        let mut fulfilled = commitment.clone();
        fulfilled.fulfil()?;
        self.apply_schedule_effect(commitment)?;

        match self
            .ledger
            .commitment_history
            .iter_mut()
            .find(|c| c.id == commitment.id)
        {
            Some(entry) => *entry = fulfilled.clone(),
            None => self.ledger.commitment_history.push(fulfilled.clone()),
        }
        tracing::info!(
            "[{}] Executed {} {}min ({})",
            self.name,
            fulfilled.commitment_type,
            fulfilled.adjustment_minutes,
            fulfilled.id
        );
        Ok(fulfilled)
    }

    fn mark_violated(&mut self, id: &str) -> Result<Commitment> {
        let entry = self
            .ledger
            .commitment_history
            .iter_mut()
            .find(|c| c.id == id)
            .ok_or_else(|| Error::UnknownCommitment(id.to_string()))?;
        entry.violate()?;
        let violated = entry.clone();
        self.ledger.violation_count += 1;
        Ok(violated)
    }

    fn report_violation(&self, commitment: &Commitment, reason: &str) -> Result<()> {
        let report = ViolationReportContent {
            agent_id: self.name.clone(),
            violation_count: self.ledger.violation_count,
            details: Some(format!(
                "{} {} for {}: {}",
                commitment.commitment_type, commitment.id, commitment.accepter, reason
            )),
            timestamp: Utc::now(),
        };
        self.broker
            .send(Message::direct(self.name.as_str(), self.monitor.as_str(), report))?;
        Ok(())
    }

    fn announce_outcome(&self, commitment: &Commitment) -> Result<()> {
        let broadcast = CommitmentBroadcastContent {
            proposer: commitment.proposer.clone(),
            accepter: commitment.accepter.clone(),
            commitment: commitment.clone(),
            negotiation_id: self.ledger.rounds.get(&commitment.id).cloned(),
            proposer_students: Some(self.state.current_attendance),
            accepter_students: None,
        };
        self.broker
            .send(Message::broadcast(self.name.as_str(), broadcast))?;
        Ok(())
    }

    /// Execute every accepted commitment this classroom proposed and announce
    /// the outcome. A commitment that cannot be carried out is marked violated
    /// and reported to the monitor.
    pub fn settle_commitments(&mut self) -> Vec<Commitment> {
        let due: Vec<Commitment> = self
            .ledger
            .commitment_history
            .iter()
            .filter(|c| c.proposer == self.name && c.status() == CommitmentStatus::Accepted)
            .cloned()
            .collect();

        let mut settled = Vec::with_capacity(due.len());
        for commitment in due {
            let outcome = match self.exec_commitment(&commitment) {
                Ok(done) => done,
                Err(e) => {
                    tracing::warn!(
                        "[{}] Could not honor commitment {}: {}",
                        self.name,
                        commitment.id,
                        e
                    );
                    let violated = match self.mark_violated(&commitment.id) {
                        Ok(violated) => violated,
                        Err(e) => {
                            tracing::warn!("[{}] {}", self.name, e);
                            continue;
                        }
                    };
                    if let Err(e) = self.report_violation(&violated, &e.to_string()) {
                        tracing::warn!("[{}] Violation report not delivered: {}", self.name, e);
                    }
                    violated
                }
            };

            if let Err(e) = self.announce_outcome(&outcome) {
                tracing::warn!("[{}] Outcome of {} not announced: {}", self.name, outcome.id, e);
            }
            settled.push(outcome);
        }
        settled
    }

    pub fn report(&self) -> ClassroomReport {
        ClassroomReport {
            name: self.name.clone(),
            attendance: self.state.current_attendance,
            end_time: self.state.end_time,
            exit_slots: self.state.exit_slots.clone(),
            obligation_credits: self.ledger.obligation_credits,
            violation_count: self.ledger.violation_count,
            commitments: self.ledger.commitment_history.clone(),
        }
    }
}

impl Agent for ClassroomAgent {
    fn name(&self) -> &str {
        &self.name
    }

    fn broker(&self) -> &MessageBroker {
        &self.broker
    }

    fn handle_message(&mut self, message: &Message) -> Result<()> {
        match message.payload() {
            Payload::NegotiationStart { negotiation_start } => {
                self.on_negotiation_start(negotiation_start)
            }
            Payload::CommitmentProposal { .. } => self.on_commitment_proposal(message),
            Payload::CommitmentResponse {
                commitment_response,
            } => self.on_commitment_response(&message.sender, commitment_response),
            Payload::CommitmentBroadcast {
                commitment_broadcast,
            } => self.on_commitment_broadcast(commitment_broadcast),
            Payload::ViolationReport { .. } | Payload::Received { .. } => {
                tracing::debug!(
                    "[{}] Ignoring {} from {}",
                    self.name,
                    message.message_type(),
                    message.sender
                );
                Ok(())
            }
            Payload::TrafficUpdate { .. } => Err(Error::malformed(
                &self.name,
                message.message_type(),
                "traffic updates are addressed to the bottleneck monitor",
            )),
        }
    }

    fn reset_state(&mut self) {
        tracing::info!("[{}] Resetting state", self.name);
        self.state = ClassroomState::from(&self.profile);
        self.ledger = Ledger::default();
    }

    fn snapshot_state(&self) -> Result<AgentSnapshot> {
        let snapshot = ClassroomSnapshot {
            state: self.state.clone(),
            ledger: self.ledger.clone(),
        };
        Ok(AgentSnapshot {
            agent_name: self.name.clone(),
            state: serde_json::to_value(snapshot)?,
        })
    }

    fn restore_state(&mut self, snapshot: AgentSnapshot) -> Result<()> {
        if snapshot.agent_name != self.name {
            return Err(Error::malformed(
                &self.name,
                "snapshot",
                format!("snapshot belongs to {}", snapshot.agent_name),
            ));
        }
        let restored: ClassroomSnapshot = serde_json::from_value(snapshot.state)?;
        self.state = restored.state;
        self.ledger = restored.ledger;
        Ok(())
    }
}
