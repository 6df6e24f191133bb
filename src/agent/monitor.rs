//! Bottleneck monitor agent.
//!
//! Watches traffic at the exit, turns head counts into a congestion risk and
//! opens negotiation rounds when the risk or the head count gets too high.
//! It also keeps the books on what each round agreed and on violation reports.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use super::{Agent, AgentSnapshot};
use crate::config::SystemConfig;
use crate::core::{NegotiationRound, RoundBook, RoundPhase};
use crate::error::{Error, Result};
use crate::protocol::{
    AgentId, CommitmentBroadcastContent, CommitmentProposalContent, Message, MessageBroker,
    Payload, TrafficState, TrafficUpdateContent, ViolationReportContent,
};

/// Name the driver registers the monitor under.
pub const DEFAULT_MONITOR: &str = "Bottleneck";

/// Settled rounds are kept this many negotiation timeouts after their last update.
const ROUND_RETENTION_TIMEOUTS: i64 = 4;

/// Risk of overloading the exit.
///
/// `ceil(total / capacity)` clearance intervals are needed; the risk is that
/// count over `max_intervals`, saturating at 1. No students means no risk; a
/// zero capacity with students waiting is maximal risk.
pub fn congestion_risk(total_students: u64, capacity: u32, max_intervals: u32) -> f64 {
    if total_students == 0 {
        return 0.0;
    }
    if capacity == 0 || max_intervals == 0 {
        return 1.0;
    }
    let intervals_needed = total_students.div_ceil(u64::from(capacity));
    (intervals_needed as f64 / f64::from(max_intervals)).min(1.0)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct MonitorState {
    traffic_state: TrafficState,
    rounds: RoundBook,
    violation_counts: BTreeMap<AgentId, u32>,
    limit_exceeded: BTreeSet<AgentId>,
}

impl MonitorState {
    fn new(capacity: u32) -> Self {
        Self {
            traffic_state: TrafficState::idle(capacity),
            rounds: RoundBook::new(),
            violation_counts: BTreeMap::new(),
            limit_exceeded: BTreeSet::new(),
        }
    }
}

/// The bottleneck monitor.
pub struct MonitorAgent {
    name: String,
    description: String,
    broker: MessageBroker,
    config: SystemConfig,
    state: MonitorState,
}

impl MonitorAgent {
    /// Create the monitor and register its mailbox.
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        broker: MessageBroker,
        config: SystemConfig,
    ) -> Self {
        let name = name.into();
        broker.register(&name);
        tracing::info!("Agent MonitorAgent initialized - {}", name);

        Self {
            state: MonitorState::new(config.bottleneck_capacity),
            name,
            description: description.into(),
            broker,
            config,
        }
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn traffic_state(&self) -> &TrafficState {
        &self.state.traffic_state
    }

    pub fn congestion_risk(&self) -> f64 {
        self.state.traffic_state.congestion_risk()
    }

    pub fn rounds(&self) -> &RoundBook {
        &self.state.rounds
    }

    pub fn round(&self, negotiation_id: &str) -> Option<&NegotiationRound> {
        self.state.rounds.get(negotiation_id)
    }

    /// Whether `agent` has reported more violations than the configured limit.
    pub fn limit_exceeded(&self, agent: &str) -> bool {
        self.state.limit_exceeded.contains(agent)
    }

    pub fn agents_over_limit(&self) -> Vec<AgentId> {
        self.state.limit_exceeded.iter().cloned().collect()
    }

    /// Recompute and store the congestion risk for the held traffic state.
    pub fn calculate_congestion_risk(&mut self) -> f64 {
        let risk = congestion_risk(
            self.state.traffic_state.total_students(),
            self.config.bottleneck_capacity,
            self.config.monitor.max_acceptable_intervals,
        );
        self.state.traffic_state.set_congestion_risk(risk);
        self.state.traffic_state.congestion_risk()
    }

    /// Replace or merge the traffic view, recompute risk, and open a round if
    /// warranted. Returns the id of a newly opened round.
    pub fn on_traffic_update(&mut self, update: &TrafficUpdateContent) -> Result<Option<String>> {
        match (&update.traffic_state, &update.estimated_students) {
            (Some(state), _) => self.state.traffic_state = state.clone(),
            (None, Some(estimates)) => {
                self.state.traffic_state.estimated_students = estimates.clone();
            }
            (None, None) => {
                return Err(Error::malformed(
                    &self.name,
                    crate::protocol::MessageType::TrafficUpdate,
                    "neither a traffic state nor estimates supplied",
                ))
            }
        }

        let now = Utc::now();
        self.expire_stale_rounds(now);
        self.prune_settled_rounds(now);

        let risk = self.calculate_congestion_risk();
        tracing::info!(
            "[{}] Updated traffic state: {} students, congestion risk={:.2}",
            self.name,
            self.state.traffic_state.total_students(),
            risk
        );
        self.maybe_start_negotiation()
    }

    /// Open a round when risk or head count crosses the start trigger.
    pub fn maybe_start_negotiation(&mut self) -> Result<Option<String>> {
        let policy = self.config.monitor.clone();
        let risk = self.state.traffic_state.congestion_risk();
        let total = self.state.traffic_state.total_students();

        if total > 0
            && (risk >= policy.start_risk || total > u64::from(policy.student_count_threshold))
        {
            tracing::info!(
                "[{}] HIGH congestion risk detected ({:.2}, {} students). Initiating negotiation round.",
                self.name,
                risk,
                total
            );
            return self.start_negotiation_round().map(Some);
        }

        if risk > policy.warn_risk {
            tracing::info!(
                "[{}] MODERATE congestion risk ({:.2}). Monitoring closely.",
                self.name,
                risk
            );
        }
        Ok(None)
    }

    /// Mint a round id and broadcast the start with the current traffic view.
    pub fn start_negotiation_round(&mut self) -> Result<String> {
        let negotiation_id = uuid::Uuid::new_v4().to_string();
        self.state.rounds.open(&negotiation_id);

        let start = Message::broadcast(
            self.name.as_str(),
            Payload::negotiation_start(&negotiation_id, self.state.traffic_state.clone()),
        );
        self.broker.send(start)?;

        tracing::info!(
            "[{}] Started negotiation round {}",
            self.name,
            &negotiation_id[..8]
        );
        Ok(negotiation_id)
    }

    /// Expire rounds left unconfirmed past the negotiation timeout.
    pub fn expire_stale_rounds(&mut self, now: DateTime<Utc>) -> Vec<String> {
        let timeout = Duration::seconds(self.config.negotiation_timeout as i64);
        let expired = self.state.rounds.expire_stale(now, timeout);
        for id in &expired {
            tracing::warn!("[{}] Negotiation round {} expired unconfirmed", self.name, id);
        }
        expired
    }

    /// Forget confirmed or expired rounds untouched for several timeouts.
    pub fn prune_settled_rounds(&mut self, now: DateTime<Utc>) -> usize {
        let timeout = self.config.negotiation_timeout as i64;
        let max_age = Duration::seconds(timeout * ROUND_RETENTION_TIMEOUTS);
        let removed = self.state.rounds.cleanup(now, max_age);
        if removed > 0 {
            tracing::debug!("[{}] Pruned {} settled round(s)", self.name, removed);
        }
        removed
    }

    fn on_commitment_proposal(&mut self, sender: &str, proposal: &CommitmentProposalContent) {
        match self.state.rounds.get_mut(&proposal.negotiation_id) {
            Some(round) => {
                round.advance(RoundPhase::Proposed);
                round.add_participant(sender);
            }
            None => tracing::debug!(
                "[{}] Proposal from {} for unknown round {}",
                self.name,
                sender,
                proposal.negotiation_id
            ),
        }
    }

    /// Book a confirmed or settled commitment under its round.
    pub fn on_commitment_broadcast(&mut self, broadcast: &CommitmentBroadcastContent) {
        let negotiation_id = broadcast.negotiation_id.as_deref().unwrap_or("unknown");
        let round = self.state.rounds.open(negotiation_id);

        if round.is_expired() {
            tracing::warn!(
                "[{}] Ignoring commitment {} for expired round {}",
                self.name,
                broadcast.commitment.id,
                negotiation_id
            );
            return;
        }

        round.advance(RoundPhase::Responded);
        round.advance(RoundPhase::Confirmed);
        round.add_participant(&broadcast.proposer);
        round.add_participant(&broadcast.accepter);
        round.record_commitment(broadcast.commitment.clone());

        tracing::info!(
            "[{}] Round {}: {} {} {} by {} for {} is {}",
            self.name,
            negotiation_id,
            broadcast.commitment.commitment_type,
            broadcast.commitment.adjustment_minutes,
            broadcast.commitment.id,
            broadcast.proposer,
            broadcast.accepter,
            broadcast.commitment.status()
        );
    }

    pub fn on_violation_report(&mut self, report: &ViolationReportContent) {
        tracing::info!(
            "[{}] Received violation report from {}: total violations={}, details={}",
            self.name,
            report.agent_id,
            report.violation_count,
            report.details.as_deref().unwrap_or("-")
        );
        self.state
            .violation_counts
            .insert(report.agent_id.clone(), report.violation_count);

        let limit = self.config.violation_limit;
        if limit > 0 && report.violation_count > limit {
            tracing::error!(
                "[{}] Agent {} exceeded violation limit ({} > {})",
                self.name,
                report.agent_id,
                report.violation_count,
                limit
            );
            self.state.limit_exceeded.insert(report.agent_id.clone());
        }
    }
}

impl Agent for MonitorAgent {
    fn name(&self) -> &str {
        &self.name
    }

    fn broker(&self) -> &MessageBroker {
        &self.broker
    }

    fn handle_message(&mut self, message: &Message) -> Result<()> {
        match message.payload() {
            Payload::TrafficUpdate { traffic_update } => {
                self.on_traffic_update(traffic_update)?;
            }
            Payload::CommitmentProposal {
                commitment_proposal,
            } => self.on_commitment_proposal(&message.sender, commitment_proposal),
            Payload::CommitmentBroadcast {
                commitment_broadcast,
            } => self.on_commitment_broadcast(commitment_broadcast),
            Payload::ViolationReport { violation_report } => {
                self.on_violation_report(violation_report)
            }
            Payload::Received { .. } => {}
            Payload::NegotiationStart { .. } | Payload::CommitmentResponse { .. } => {
                return Err(Error::malformed(
                    &self.name,
                    message.message_type(),
                    "not handled by the bottleneck monitor",
                ));
            }
        }
        Ok(())
    }

    fn reset_state(&mut self) {
        tracing::info!("[{}] Resetting state", self.name);
        self.state = MonitorState::new(self.config.bottleneck_capacity);
    }

    fn snapshot_state(&self) -> Result<AgentSnapshot> {
        Ok(AgentSnapshot {
            agent_name: self.name.clone(),
            state: serde_json::to_value(&self.state)?,
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
        self.state = serde_json::from_value(snapshot.state)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Commitment, CommitmentType, MessageType};
    use proptest::prelude::*;
    use std::collections::BTreeMap;

    fn estimates(counts: &[(&str, u32)]) -> BTreeMap<AgentId, u32> {
        counts.iter().map(|(n, c)| (n.to_string(), *c)).collect()
    }

    fn setup(config: SystemConfig) -> (MessageBroker, MonitorAgent) {
        crate::logging::init_test();
        let broker = MessageBroker::new();
        let monitor = MonitorAgent::new(DEFAULT_MONITOR, "Traffic monitor", broker.clone(), config);
        for name in ["ClassroomA", "ClassroomB", "ClassroomC"] {
            broker.register(name);
        }
        (broker, monitor)
    }

    #[test]
    fn test_risk_for_three_classrooms() {
        // ceil(135 / 50) = 3 intervals out of 6.
        assert_eq!(congestion_risk(135, 50, 6), 0.5);
        assert_eq!(congestion_risk(0, 50, 6), 0.0);
        assert_eq!(congestion_risk(10_000, 50, 6), 1.0);
        assert_eq!(congestion_risk(1, 0, 6), 1.0);
    }

    #[test]
    fn test_traffic_update_opens_round() {
        let (broker, mut monitor) = setup(SystemConfig::default());
        let update = TrafficUpdateContent {
            traffic_state: None,
            estimated_students: Some(estimates(&[
                ("ClassroomA", 50),
                ("ClassroomB", 45),
                ("ClassroomC", 40),
            ])),
        };

        let id = monitor.on_traffic_update(&update).unwrap();

        assert_eq!(monitor.congestion_risk(), 0.5);
        let id = id.expect("risk 0.5 meets the default start threshold");
        assert_eq!(monitor.round(&id).unwrap().phase, RoundPhase::Open);

        let inbox = broker.drain("ClassroomA");
        assert_eq!(inbox.len(), 1);
        assert_eq!(inbox[0].message_type(), MessageType::NegotiationStart);
        assert_eq!(inbox[0].negotiation_id(), Some(id.as_str()));
        assert!(broker.drain(DEFAULT_MONITOR).is_empty());
    }

    #[test]
    fn test_zero_attendance_starts_nothing() {
        let (broker, mut monitor) = setup(SystemConfig::default());
        let update = TrafficUpdateContent {
            traffic_state: Some(TrafficState::new(0, 50, estimates(&[("ClassroomA", 0)]), 0.9)),
            estimated_students: None,
        };

        assert_eq!(monitor.on_traffic_update(&update).unwrap(), None);
        assert_eq!(monitor.congestion_risk(), 0.0);
        assert!(monitor.rounds().is_empty());
        assert_eq!(broker.history_len(), 0);
    }

    #[test]
    fn test_student_count_trigger() {
        let mut config = SystemConfig::default();
        config.monitor.start_risk = 1.0;
        config.monitor.student_count_threshold = 100;
        let (_broker, mut monitor) = setup(config);

        let update = TrafficUpdateContent {
            traffic_state: None,
            estimated_students: Some(estimates(&[("ClassroomA", 60), ("ClassroomB", 45)])),
        };
        assert!(monitor.on_traffic_update(&update).unwrap().is_some());
    }

    #[test]
    fn test_empty_update_is_malformed() {
        let (broker, mut monitor) = setup(SystemConfig::default());
        broker
            .send(Message::direct(
                "Simulation",
                DEFAULT_MONITOR,
                Payload::TrafficUpdate {
                    traffic_update: TrafficUpdateContent::default(),
                },
            ))
            .unwrap();

        let report = monitor.process_inbox();
        assert_eq!(report.failed, 1);
        assert_eq!(report.handled, 0);
    }

    #[test]
    fn test_commitment_broadcast_confirms_round() {
        let (_broker, mut monitor) = setup(SystemConfig::default());
        let id = monitor.start_negotiation_round().unwrap();

        let mut commitment = Commitment::propose("ClassroomA", CommitmentType::EarlyExit, 2, true, 1);
        commitment.accept("ClassroomB").unwrap();
        monitor.on_commitment_broadcast(&CommitmentBroadcastContent {
            proposer: "ClassroomA".to_string(),
            accepter: "ClassroomB".to_string(),
            commitment,
            negotiation_id: Some(id.clone()),
            proposer_students: Some(10),
            accepter_students: Some(90),
        });

        let round = monitor.round(&id).unwrap();
        assert_eq!(round.phase, RoundPhase::Confirmed);
        assert_eq!(round.accepted_commitments.len(), 1);
        assert_eq!(round.participants.len(), 2);
    }

    #[test]
    fn test_expired_round_ignores_late_deals() {
        let (_broker, mut monitor) = setup(SystemConfig::default());
        let id = monitor.start_negotiation_round().unwrap();

        let expired = monitor.expire_stale_rounds(Utc::now() + Duration::seconds(31));
        assert_eq!(expired, vec![id.clone()]);

        let mut commitment = Commitment::propose("ClassroomA", CommitmentType::EarlyExit, 2, true, 1);
        commitment.accept("ClassroomB").unwrap();
        monitor.on_commitment_broadcast(&CommitmentBroadcastContent {
            proposer: "ClassroomA".to_string(),
            accepter: "ClassroomB".to_string(),
            commitment,
            negotiation_id: Some(id.clone()),
            proposer_students: None,
            accepter_students: None,
        });

        let round = monitor.round(&id).unwrap();
        assert_eq!(round.phase, RoundPhase::Expired);
        assert!(round.accepted_commitments.is_empty());
    }

    #[test]
    fn test_traffic_update_prunes_settled_rounds() {
        let (_broker, mut monitor) = setup(SystemConfig::default());
        let confirmed = monitor.start_negotiation_round().unwrap();
        let abandoned = monitor.start_negotiation_round().unwrap();
        let fresh = monitor.start_negotiation_round().unwrap();

        let mut commitment = Commitment::propose("ClassroomA", CommitmentType::EarlyExit, 2, true, 1);
        commitment.accept("ClassroomB").unwrap();
        monitor.on_commitment_broadcast(&CommitmentBroadcastContent {
            proposer: "ClassroomA".to_string(),
            accepter: "ClassroomB".to_string(),
            commitment,
            negotiation_id: Some(confirmed.clone()),
            proposer_students: None,
            accepter_students: None,
        });

        let long_ago = Utc::now() - Duration::seconds(600);
        monitor.state.rounds.get_mut(&confirmed).unwrap().updated_at = long_ago;
        monitor.state.rounds.get_mut(&abandoned).unwrap().opened_at = long_ago;

        let quiet = TrafficUpdateContent {
            traffic_state: None,
            estimated_students: Some(BTreeMap::new()),
        };
        assert_eq!(monitor.on_traffic_update(&quiet).unwrap(), None);

        // The old confirmed round is gone; the abandoned one just expired and
        // is kept until it ages out too.
        assert!(monitor.round(&confirmed).is_none());
        assert_eq!(monitor.round(&abandoned).unwrap().phase, RoundPhase::Expired);
        assert_eq!(monitor.round(&fresh).unwrap().phase, RoundPhase::Open);
        assert_eq!(monitor.rounds().len(), 2);

        let removed = monitor.prune_settled_rounds(Utc::now() + Duration::seconds(121));
        assert_eq!(removed, 1);
        assert!(monitor.round(&abandoned).is_none());
        assert!(monitor.round(&fresh).is_some());
    }

    #[test]
    fn test_violation_limit_signal() {
        let (_broker, mut monitor) = setup(SystemConfig::default());
        let report = |count| ViolationReportContent {
            agent_id: "ClassroomA".to_string(),
            violation_count: count,
            details: None,
            timestamp: Utc::now(),
        };

        monitor.on_violation_report(&report(3));
        assert!(!monitor.limit_exceeded("ClassroomA"));
        monitor.on_violation_report(&report(4));
        assert!(monitor.limit_exceeded("ClassroomA"));
        assert_eq!(monitor.agents_over_limit(), vec!["ClassroomA".to_string()]);
    }

    #[test]
    fn test_snapshot_round_trip_and_reset() {
        let (_broker, mut monitor) = setup(SystemConfig::default());
        let id = monitor.start_negotiation_round().unwrap();
        let snapshot = monitor.snapshot_state().unwrap();

        monitor.reset_state();
        assert!(monitor.rounds().is_empty());

        monitor.restore_state(snapshot.clone()).unwrap();
        assert!(monitor.round(&id).is_some());

        let foreign = AgentSnapshot {
            agent_name: "ClassroomA".to_string(),
            state: snapshot.state,
        };
        assert!(monitor.restore_state(foreign).is_err());
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(200))]

        /// More students never lowers the risk, and the risk stays within [0, 1].
        #[test]
        fn prop_risk_monotone_and_bounded(
            a in 0u64..100_000,
            b in 0u64..100_000,
            capacity in 1u32..500,
        ) {
            let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
            let r_lo = congestion_risk(lo, capacity, 6);
            let r_hi = congestion_risk(hi, capacity, 6);
            prop_assert!(r_lo <= r_hi);
            prop_assert!((0.0..=1.0).contains(&r_hi));
        }
    }
}
