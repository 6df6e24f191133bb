//! CLI commands for exitpact using clap.

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};

use crate::agent::congestion_risk;
use crate::config::{load_config, validate_config};
use crate::simulation::{RoundSummary, Simulation};

/// exitpact - negotiated exit scheduling for classrooms sharing one bottleneck.
#[derive(Parser)]
#[command(name = "exitpact")]
#[command(version)]
#[command(about = "Classroom agents negotiating who leaves the building when", long_about = None)]
pub struct Commands {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Run negotiation rounds over the configured classrooms
    Simulate {
        /// Number of rounds
        #[arg(long)]
        rounds: Option<u32>,

        /// Drain passes over every agent per phase
        #[arg(long)]
        passes: Option<u32>,

        /// Seed for attendance fluctuation
        #[arg(long)]
        seed: Option<u64>,

        /// Pause between rounds
        #[arg(long = "delay-ms")]
        delay_ms: Option<u64>,

        /// Print round summaries as JSON
        #[arg(long)]
        json: bool,

        /// Config file
        #[arg(long, env = "EXITPACT_CONFIG")]
        config: Option<PathBuf>,
    },

    /// Congestion risk for a set of classroom head counts
    Risk {
        /// Head count per classroom
        #[arg(required = true)]
        counts: Vec<u32>,

        /// Students cleared per interval
        #[arg(long)]
        capacity: Option<u32>,

        /// Config file
        #[arg(long, env = "EXITPACT_CONFIG")]
        config: Option<PathBuf>,
    },

    /// Show the effective configuration
    Config {
        /// Config file
        #[arg(long, env = "EXITPACT_CONFIG")]
        config: Option<PathBuf>,
    },
}

impl Commands {
    /// Run the command.
    pub async fn run(&self) -> Result<()> {
        match &self.command {
            Command::Simulate {
                rounds,
                passes,
                seed,
                delay_ms,
                json,
                config,
            } => cmd_simulate(*rounds, *passes, *seed, *delay_ms, *json, config.as_deref()).await,
            Command::Risk {
                counts,
                capacity,
                config,
            } => cmd_risk(counts, *capacity, config.as_deref()),
            Command::Config { config } => cmd_config(config.as_deref()),
        }
    }
}

// Command implementations

async fn cmd_simulate(
    rounds: Option<u32>,
    passes: Option<u32>,
    seed: Option<u64>,
    delay_ms: Option<u64>,
    json: bool,
    config_path: Option<&Path>,
) -> Result<()> {
    let mut config = load_config(config_path)?;
    if let Some(rounds) = rounds {
        config.simulation.rounds = rounds;
    }
    if let Some(passes) = passes {
        config.simulation.passes = passes;
    }
    if seed.is_some() {
        config.simulation.seed = seed;
    }
    if let Some(delay_ms) = delay_ms {
        config.simulation.round_delay_ms = delay_ms;
    }
    validate_config(&config)?;

    let mut simulation = Simulation::new(config)?;
    let summaries = simulation.run().await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&summaries)?);
    } else {
        for summary in &summaries {
            print_summary(summary);
        }
    }
    Ok(())
}

fn print_summary(summary: &RoundSummary) {
    let round = match (&summary.negotiation_id, summary.phase) {
        (Some(id), Some(phase)) => format!("negotiation {} ({:?})", &id[..id.len().min(8)], phase),
        (Some(id), None) => format!("negotiation {}", &id[..id.len().min(8)]),
        _ => "no negotiation".to_string(),
    };
    println!(
        "Round {}: {} students, congestion risk {:.2}, {}",
        summary.round, summary.total_students, summary.congestion_risk, round
    );

    for classroom in &summary.classrooms {
        let slots: Vec<String> = classroom
            .exit_slots
            .iter()
            .map(|t| t.format("%H:%M").to_string())
            .collect();
        println!(
            "  {:<12} {:>3} students  ends {}  credit {:>2}  violations {}  slots [{}]",
            classroom.name,
            classroom.attendance,
            classroom.end_time.format("%H:%M"),
            classroom.obligation_credits,
            classroom.violation_count,
            slots.join(", ")
        );
    }

    for commitment in &summary.settled {
        println!(
            "  settled: {} {} {}min for {} -> {}",
            commitment.proposer,
            commitment.commitment_type,
            commitment.adjustment_minutes,
            commitment.accepter,
            commitment.status()
        );
    }
    for agent in &summary.over_limit {
        println!("  {} is over the violation limit", agent);
    }
}

fn cmd_risk(counts: &[u32], capacity: Option<u32>, config_path: Option<&Path>) -> Result<()> {
    let config = load_config(config_path)?;
    let capacity = capacity.unwrap_or(config.bottleneck_capacity);
    let max_intervals = config.monitor.max_acceptable_intervals;

    let total: u64 = counts.iter().map(|&n| u64::from(n)).sum();
    let risk = congestion_risk(total, capacity, max_intervals);

    println!("Students:   {}", total);
    println!("Capacity:   {} per interval", capacity);
    println!("Acceptable: {} intervals", max_intervals);
    println!("Risk:       {:.2}", risk);
    if risk >= config.monitor.start_risk || total > u64::from(config.monitor.student_count_threshold) {
        println!("A negotiation round would start.");
    }
    Ok(())
}

fn cmd_config(config_path: Option<&Path>) -> Result<()> {
    let config = load_config(config_path)?;
    println!("{}", serde_json::to_string_pretty(&config)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Commands::command().debug_assert();
    }

    #[test]
    fn test_parse_simulate_flags() {
        let args = Commands::try_parse_from([
            "exitpact", "simulate", "--rounds", "3", "--seed", "9", "--delay-ms", "10", "--json",
        ])
        .unwrap();

        match args.command {
            Command::Simulate {
                rounds,
                passes,
                seed,
                delay_ms,
                json,
                ..
            } => {
                assert_eq!(rounds, Some(3));
                assert_eq!(passes, None);
                assert_eq!(seed, Some(9));
                assert_eq!(delay_ms, Some(10));
                assert!(json);
            }
            _ => panic!("expected simulate"),
        }
    }

    #[test]
    fn test_risk_needs_counts() {
        assert!(Commands::try_parse_from(["exitpact", "risk"]).is_err());

        let args = Commands::try_parse_from(["exitpact", "risk", "50", "40", "--capacity", "15"])
            .unwrap();
        match args.command {
            Command::Risk {
                counts, capacity, ..
            } => {
                assert_eq!(counts, vec![50, 40]);
                assert_eq!(capacity, Some(15));
            }
            _ => panic!("expected risk"),
        }
    }

    #[test]
    fn test_explicit_missing_config_fails() {
        let dir = tempfile::TempDir::new().unwrap();
        let missing = dir.path().join("absent.json");
        assert!(cmd_config(Some(&missing)).is_err());
    }
}
