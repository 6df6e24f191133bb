//! Round driver.
//!
//! Owns the broker, the bottleneck monitor and the classrooms, feeds them
//! attendance each round and collects what the negotiation produced.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::agent::{
    Agent, ClassroomAgent, ClassroomProfile, ClassroomReport, MonitorAgent, DEFAULT_MONITOR,
};
use crate::config::{validate_config, SystemConfig};
use crate::core::{trace_phase, RoundPhase};
use crate::error::{Error, Result};
use crate::protocol::{
    AgentId, Commitment, CommitmentStatus, CommitmentType, Message, MessageBroker, Payload,
};

/// Sender name on driver-originated traffic updates.
pub const SIMULATION_SENDER: &str = "Simulation";

/// What one round produced.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RoundSummary {
    pub round: u32,
    pub congestion_risk: f64,
    pub total_students: u64,
    /// Effective head count per classroom fed to the monitor.
    pub attendance: BTreeMap<AgentId, u32>,
    /// Round opened by this update, if any.
    pub negotiation_id: Option<String>,
    /// Furthest phase the round reached according to the message log.
    pub phase: Option<RoundPhase>,
    pub settled: Vec<Commitment>,
    pub classrooms: Vec<ClassroomReport>,
    pub over_limit: Vec<AgentId>,
    pub messages: usize,
}

/// Batched release times: one slot per `capacity` students, `clearance`
/// minutes apart, starting at `base`.
pub fn exit_slots(
    students: u32,
    capacity: u32,
    clearance: u32,
    base: DateTime<Utc>,
) -> Vec<DateTime<Utc>> {
    if capacity == 0 {
        return Vec::new();
    }
    (0..students)
        .step_by(capacity as usize)
        .map(|i| base + Duration::minutes(i64::from(i / capacity) * i64::from(clearance)))
        .collect()
}

pub struct Simulation {
    config: SystemConfig,
    broker: MessageBroker,
    monitor: MonitorAgent,
    classrooms: Vec<ClassroomAgent>,
    rng: StdRng,
    round: u32,
}

impl Simulation {
    pub fn new(config: SystemConfig) -> Result<Self> {
        validate_config(&config)?;
        if config
            .simulation
            .classrooms
            .iter()
            .any(|c| c.name == DEFAULT_MONITOR || c.name == SIMULATION_SENDER)
        {
            return Err(Error::Config(format!(
                "classroom names '{}' and '{}' are reserved",
                DEFAULT_MONITOR, SIMULATION_SENDER
            )));
        }

        let broker = MessageBroker::new();
        let monitor = MonitorAgent::new(
            DEFAULT_MONITOR,
            "Traffic monitor",
            broker.clone(),
            config.clone(),
        );
        let classrooms = config
            .simulation
            .classrooms
            .iter()
            .map(|c| {
                ClassroomAgent::new(
                    c.name.as_str(),
                    c.description.as_str(),
                    broker.clone(),
                    config.clone(),
                    ClassroomProfile::new(c.attendance, c.flexibility),
                )
            })
            .collect();

        let rng = match config.simulation.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };

        Ok(Self {
            config,
            broker,
            monitor,
            classrooms,
            rng,
            round: 0,
        })
    }

    pub fn broker(&self) -> &MessageBroker {
        &self.broker
    }

    pub fn monitor(&self) -> &MonitorAgent {
        &self.monitor
    }

    pub fn classrooms(&self) -> &[ClassroomAgent] {
        &self.classrooms
    }

    pub fn classroom(&self, name: &str) -> Option<&ClassroomAgent> {
        self.classrooms.iter().find(|c| c.name() == name)
    }

    pub fn rounds_run(&self) -> u32 {
        self.round
    }

    fn fluctuate_attendance(&mut self) {
        let swing = i64::from(self.config.simulation.fluctuation);
        let floor = i64::from(self.config.simulation.min_attendance);
        for classroom in &mut self.classrooms {
            let delta = self.rng.gen_range(-swing..=swing);
            let next = (i64::from(classroom.attendance()) + delta).max(floor);
            classroom.observe_attendance(u32::try_from(next).unwrap_or(u32::MAX));
        }
    }

    /// Head count per classroom once fulfilled concessions are taken off,
    /// one student per adjustment minute.
    pub fn effective_attendance(&self) -> BTreeMap<AgentId, u32> {
        self.classrooms
            .iter()
            .map(|c| {
                let reduction: u32 = c
                    .commitment_history()
                    .iter()
                    .filter(|cm| {
                        cm.proposer == c.name() && cm.status() == CommitmentStatus::Fulfilled
                    })
                    .map(|cm| cm.adjustment_minutes)
                    .sum();
                (c.name().to_string(), c.attendance().saturating_sub(reduction))
            })
            .collect()
    }

    fn drain_passes(&mut self) {
        for _ in 0..self.config.simulation.passes {
            if !self.broker.has_pending() {
                break;
            }
            self.monitor.process_inbox();
            for classroom in &mut self.classrooms {
                classroom.process_inbox();
            }
        }
    }

    /// Run one full round and summarize it.
    pub fn run_round(&mut self) -> Result<RoundSummary> {
        self.round += 1;
        let history_start = self.broker.history_len();
        tracing::info!("=== Simulation Round {} ===", self.round);

        self.fluctuate_attendance();
        let attendance = self.effective_attendance();

        self.broker.send(Message::direct(
            SIMULATION_SENDER,
            DEFAULT_MONITOR,
            Payload::traffic_estimates(attendance.clone()),
        ))?;
        self.monitor.process_inbox();

        self.drain_passes();
        let mut settled = Vec::new();
        for classroom in &mut self.classrooms {
            settled.extend(classroom.settle_commitments());
        }
        self.drain_passes();

        let base = Utc::now();
        let capacity = self.config.bottleneck_capacity;
        let clearance = self.config.clearance_time;
        let limit = self.config.violation_limit;
        let staggered: BTreeSet<AgentId> = settled
            .iter()
            .filter(|c| {
                c.commitment_type == CommitmentType::StaggeredExit
                    && c.status() == CommitmentStatus::Fulfilled
            })
            .map(|c| c.proposer.clone())
            .collect();
        for classroom in &mut self.classrooms {
            // A staggered release settled this round already set its own slots.
            if !staggered.contains(classroom.name()) {
                let students = attendance.get(classroom.name()).copied().unwrap_or(0);
                classroom.assign_exit_slots(exit_slots(students, capacity, clearance, base));
            }

            if limit > 0 && classroom.violation_count() >= limit {
                tracing::warn!(
                    "{} exceeded violation limit ({} violations)",
                    classroom.name(),
                    classroom.violation_count()
                );
            }
            tracing::info!(
                "{} exit slots: {:?}",
                classroom.name(),
                classroom
                    .state()
                    .exit_slots
                    .iter()
                    .map(|t| t.format("%H:%M").to_string())
                    .collect::<Vec<_>>()
            );
        }

        let history = self.broker.history();
        let round_log = history.get(history_start..).unwrap_or_default();
        let negotiation_id = round_log.iter().find_map(|m| match m.payload() {
            Payload::NegotiationStart { negotiation_start } => {
                Some(negotiation_start.negotiation_id.clone())
            }
            _ => None,
        });
        let phase = negotiation_id
            .as_deref()
            .and_then(|id| trace_phase(&history, id));

        let summary = RoundSummary {
            round: self.round,
            congestion_risk: self.monitor.congestion_risk(),
            total_students: self.monitor.traffic_state().total_students(),
            attendance,
            negotiation_id,
            phase,
            settled,
            classrooms: self.classrooms.iter().map(ClassroomAgent::report).collect(),
            over_limit: self.monitor.agents_over_limit(),
            messages: round_log.len(),
        };
        tracing::info!(
            "Round {}: congestion risk {:.2}, {} commitment(s) settled",
            summary.round,
            summary.congestion_risk,
            summary.settled.len()
        );
        Ok(summary)
    }

    /// Run the configured number of rounds, pausing between them.
    pub async fn run(&mut self) -> Result<Vec<RoundSummary>> {
        let rounds = self.config.simulation.rounds;
        let delay = StdDuration::from_millis(self.config.simulation.round_delay_ms);
        let mut summaries = Vec::with_capacity(rounds as usize);

        for n in 0..rounds {
            summaries.push(self.run_round()?);
            if n + 1 < rounds && !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
        }
        tracing::info!("Simulation finished after {} round(s)", rounds);
        Ok(summaries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClassroomConfig;

    fn two_room_config() -> SystemConfig {
        let mut config = SystemConfig::default();
        config.bottleneck_capacity = 20;
        config.simulation.fluctuation = 0;
        config.simulation.seed = Some(7);
        config.simulation.classrooms = vec![
            ClassroomConfig::new("ClassroomA", "Seminar", 10, 0.9),
            ClassroomConfig::new("ClassroomB", "Lecture Hall", 90, 0.5),
        ];
        config
    }

    #[test]
    fn test_exit_slots() {
        let base = Utc::now();
        assert_eq!(
            exit_slots(45, 15, 2, base),
            vec![base, base + Duration::minutes(2), base + Duration::minutes(4)]
        );
        assert_eq!(exit_slots(46, 15, 2, base).len(), 4);
        assert!(exit_slots(0, 15, 2, base).is_empty());
        assert!(exit_slots(10, 0, 2, base).is_empty());
    }

    #[test]
    fn test_reserved_names_rejected() {
        let mut config = two_room_config();
        config.simulation.classrooms[0].name = DEFAULT_MONITOR.to_string();
        assert!(matches!(Simulation::new(config), Err(Error::Config(_))));
    }

    #[test]
    fn test_congested_round_reaches_confirmation() {
        crate::logging::init_test();
        let mut sim = Simulation::new(two_room_config()).unwrap();

        let summary = sim.run_round().unwrap();
        // 100 students through 20 per interval: 5 of 6 intervals.
        assert!((summary.congestion_risk - 5.0 / 6.0).abs() < 1e-9);
        assert_eq!(summary.total_students, 100);

        let id = summary.negotiation_id.clone().expect("round opened");
        assert_eq!(summary.phase, Some(RoundPhase::Confirmed));
        assert_eq!(
            sim.monitor().round(&id).map(|r| r.phase),
            Some(RoundPhase::Confirmed)
        );

        assert_eq!(summary.settled.len(), 1);
        let deal = &summary.settled[0];
        assert_eq!(deal.status(), CommitmentStatus::Fulfilled);
        assert_eq!(deal.proposer, "ClassroomA");
        assert_eq!(deal.accepter, "ClassroomB");

        let b = sim.classroom("ClassroomB").unwrap();
        assert_eq!(b.obligation_credits(), 1);
        assert_eq!(b.commitment(&deal.id).unwrap().status(), CommitmentStatus::Fulfilled);
        assert!((b.trust_score("ClassroomA") - 0.6).abs() < 1e-9);

        // ClassroomB: 90 students in batches of 20.
        let report = summary
            .classrooms
            .iter()
            .find(|r| r.name == "ClassroomB")
            .unwrap();
        assert_eq!(report.exit_slots.len(), 5);

        // The fulfilled early exit takes two students off A's next count.
        assert_eq!(sim.effective_attendance()["ClassroomA"], 8);
    }

    #[test]
    fn test_staggered_release_keeps_its_slots() {
        let mut config = two_room_config();
        config.simulation.classrooms = vec![
            ClassroomConfig::new("ClassroomA", "Lecture Hall", 90, 0.9),
            ClassroomConfig::new("ClassroomB", "Seminar", 10, 0.5),
        ];
        let mut sim = Simulation::new(config).unwrap();

        let summary = sim.run_round().unwrap();
        assert_eq!(summary.settled.len(), 1);
        assert_eq!(summary.settled[0].commitment_type, CommitmentType::StaggeredExit);

        let report = |name: &str| {
            summary
                .classrooms
                .iter()
                .find(|r| r.name == name)
                .unwrap()
                .clone()
        };
        // Three batches of 30, two minutes apart, from the agent itself.
        let large = report("ClassroomA");
        assert_eq!(large.exit_slots.len(), 3);
        assert_eq!(
            large.exit_slots[1] - large.exit_slots[0],
            Duration::minutes(2)
        );
        // The driver still schedules everyone else: 10 students, one batch.
        assert_eq!(report("ClassroomB").exit_slots.len(), 1);
    }

    #[test]
    fn test_quiet_round_opens_nothing() {
        let mut config = two_room_config();
        config.bottleneck_capacity = 50;
        config.simulation.classrooms = vec![
            ClassroomConfig::new("ClassroomA", "Seminar", 10, 0.9),
            ClassroomConfig::new("ClassroomB", "Seminar", 12, 0.5),
        ];
        let mut sim = Simulation::new(config).unwrap();

        let summary = sim.run_round().unwrap();
        assert_eq!(summary.negotiation_id, None);
        assert_eq!(summary.phase, None);
        assert!(summary.settled.is_empty());
        assert_eq!(summary.messages, 1);
    }

    #[test]
    fn test_seeded_attendance_is_reproducible() {
        let mut config = SystemConfig::default();
        config.simulation.seed = Some(42);

        let mut first = Simulation::new(config.clone()).unwrap();
        let mut second = Simulation::new(config).unwrap();
        for _ in 0..3 {
            let a = first.run_round().unwrap();
            let b = second.run_round().unwrap();
            assert_eq!(a.attendance, b.attendance);
            assert_eq!(a.attendance.len(), 3);
        }
    }

    #[tokio::test]
    async fn test_run_produces_one_summary_per_round() {
        let mut config = two_room_config();
        config.simulation.rounds = 3;
        let mut sim = Simulation::new(config).unwrap();

        let summaries = sim.run().await.unwrap();
        assert_eq!(summaries.len(), 3);
        assert_eq!(sim.rounds_run(), 3);
        assert_eq!(
            summaries.iter().map(|s| s.round).collect::<Vec<_>>(),
            vec![1, 2, 3]
        );
    }
}
