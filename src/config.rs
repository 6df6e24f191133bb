//! Configuration loading for exitpact.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// Get the exitpact home directory (~/.exitpact).
pub fn get_home_dir() -> Result<PathBuf> {
    let home = directories::UserDirs::new()
        .ok_or_else(|| Error::Config("Could not determine home directory".to_string()))?;

    Ok(home.home_dir().join(".exitpact"))
}

/// Get the default config file path.
pub fn get_config_path() -> Result<PathBuf> {
    Ok(get_home_dir()?.join("config.json"))
}

/// Load configuration.
///
/// An explicit path must exist. Without one, `~/.exitpact/config.json` is read
/// when present and defaults are used otherwise.
pub fn load_config(path: Option<&Path>) -> Result<SystemConfig> {
    let (path, explicit) = match path {
        Some(p) => (p.to_path_buf(), true),
        None => (get_config_path()?, false),
    };

    if !path.exists() {
        if explicit {
            return Err(Error::Config(format!(
                "Config file not found at {}",
                path.display()
            )));
        }
        tracing::debug!("No config at {}, using defaults", path.display());
        let config = SystemConfig::default();
        validate_config(&config)?;
        return Ok(config);
    }

    let content = std::fs::read_to_string(&path)?;
    let config: SystemConfig = serde_json::from_str(&content)?;
    validate_config(&config)?;

    tracing::debug!("Loaded config from {}", path.display());
    Ok(config)
}

/// Reject configurations the agents cannot run with.
pub fn validate_config(config: &SystemConfig) -> Result<()> {
    if config.max_adjustment == 0 {
        return Err(Error::Config("max_adjustment must be positive".to_string()));
    }
    if config.monitor.max_acceptable_intervals == 0 {
        return Err(Error::Config(
            "monitor.max_acceptable_intervals must be positive".to_string(),
        ));
    }
    if config.monitor.warn_risk > config.monitor.start_risk {
        return Err(Error::Config(format!(
            "monitor.warn_risk ({}) must not exceed monitor.start_risk ({})",
            config.monitor.warn_risk, config.monitor.start_risk
        )));
    }
    if config.simulation.passes == 0 {
        return Err(Error::Config("simulation.passes must be positive".to_string()));
    }
    if config.simulation.classrooms.is_empty() {
        return Err(Error::Config(
            "simulation.classrooms must list at least one classroom".to_string(),
        ));
    }

    let mut seen = HashSet::new();
    for classroom in &config.simulation.classrooms {
        if !seen.insert(classroom.name.as_str()) {
            return Err(Error::Config(format!(
                "duplicate classroom name '{}'",
                classroom.name
            )));
        }
    }
    Ok(())
}

/// Thresholds the bottleneck monitor applies to congestion risk.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct MonitorPolicy {
    /// Intervals the exit can absorb before risk saturates at 1.0.
    pub max_acceptable_intervals: u32,
    /// Risk at or above which a negotiation round opens.
    pub start_risk: f64,
    /// Risk above which the monitor logs that it is watching closely.
    pub warn_risk: f64,
    /// Total head count above which a round opens regardless of risk.
    pub student_count_threshold: u32,
}

impl Default for MonitorPolicy {
    fn default() -> Self {
        Self {
            max_acceptable_intervals: 6,
            start_risk: 0.5,
            warn_risk: 0.3,
            student_count_threshold: 150,
        }
    }
}

/// Proposal generation and evaluation thresholds for classroom agents.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct ProposalPolicy {
    pub min_risk: f64,

    pub early_exit_max_share: f64,
    pub early_exit_min_risk: f64,
    pub early_exit_candidates: Vec<u32>,
    pub early_exit_min_score: f64,

    pub stagger_min_share: f64,
    pub stagger_min_attendance: u32,
    pub stagger_min_score: f64,

    pub debt_min_risk: f64,
    pub debt_max_minutes: u32,
    pub debt_min_score: f64,

    pub acceptance_threshold: f64,
    pub reciprocal_cost: f64,
    pub priority_weight: f64,
}

impl Default for ProposalPolicy {
    fn default() -> Self {
        Self {
            min_risk: 0.5,
            early_exit_max_share: 0.25,
            early_exit_min_risk: 0.6,
            early_exit_candidates: vec![2, 4, 6],
            early_exit_min_score: 0.6,
            stagger_min_share: 0.3,
            stagger_min_attendance: 40,
            stagger_min_score: 0.7,
            debt_min_risk: 0.5,
            debt_max_minutes: 4,
            debt_min_score: 0.5,
            acceptance_threshold: 0.5,
            reciprocal_cost: 0.2,
            priority_weight: 0.1,
        }
    }
}

/// A classroom taking part in the simulation.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ClassroomConfig {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub attendance: u32,
    pub flexibility: f64,
}

impl ClassroomConfig {
    pub fn new(name: &str, description: &str, attendance: u32, flexibility: f64) -> Self {
        Self {
            name: name.to_string(),
            description: description.to_string(),
            attendance,
            flexibility,
        }
    }
}

/// Driver settings.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct SimulationConfig {
    pub rounds: u32,
    /// Drain passes over every agent per phase of a round.
    pub passes: u32,
    pub round_delay_ms: u64,
    /// Maximum attendance swing per round, in students.
    pub fluctuation: u32,
    pub min_attendance: u32,
    pub seed: Option<u64>,
    pub classrooms: Vec<ClassroomConfig>,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            rounds: 5,
            passes: 5,
            round_delay_ms: 0,
            fluctuation: 5,
            min_attendance: 5,
            seed: None,
            classrooms: vec![
                ClassroomConfig::new("ClassroomA", "AI Lecture", 50, 0.8),
                ClassroomConfig::new("ClassroomB", "Math Lecture", 40, 0.6),
                ClassroomConfig::new("ClassroomC", "Physics Lecture", 45, 0.9),
            ],
        }
    }
}

/// exitpact settings.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct SystemConfig {
    /// Students cleared through the exit per interval.
    pub bottleneck_capacity: u32,
    /// Minutes per clearance interval.
    pub clearance_time: u32,
    /// Minutes between staggered exit batches.
    pub batch_spacing: u32,
    /// Largest schedule adjustment, in minutes, an agent entertains.
    pub max_adjustment: u32,
    pub violation_limit: u32,
    /// Seconds a round may stay unconfirmed before it expires.
    pub negotiation_timeout: u64,
    pub monitor: MonitorPolicy,
    pub proposal: ProposalPolicy,
    pub simulation: SimulationConfig,
}

impl Default for SystemConfig {
    fn default() -> Self {
        Self {
            bottleneck_capacity: 50,
            clearance_time: 2,
            batch_spacing: 2,
            max_adjustment: 10,
            violation_limit: 3,
            negotiation_timeout: 30,
            monitor: MonitorPolicy::default(),
            proposal: ProposalPolicy::default(),
            simulation: SimulationConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults_are_valid() {
        let config = SystemConfig::default();
        assert!(validate_config(&config).is_ok());
        assert_eq!(config.bottleneck_capacity, 50);
        assert_eq!(config.monitor.max_acceptable_intervals, 6);
        assert_eq!(config.simulation.classrooms.len(), 3);
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("config.json");
        std::fs::write(
            &path,
            r#"{"bottleneck_capacity": 15, "monitor": {"start_risk": 0.8}}"#,
        )
        .unwrap();

        let config = load_config(Some(&path)).unwrap();
        assert_eq!(config.bottleneck_capacity, 15);
        assert_eq!(config.monitor.start_risk, 0.8);
        assert_eq!(config.monitor.warn_risk, 0.3);
        assert_eq!(config.max_adjustment, 10);
    }

    #[test]
    fn test_missing_explicit_file_is_error() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("nope.json");
        assert!(matches!(load_config(Some(&path)), Err(Error::Config(_))));
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let mut config = SystemConfig::default();
        config.max_adjustment = 0;
        assert!(validate_config(&config).is_err());

        let mut config = SystemConfig::default();
        config.monitor.warn_risk = 0.9;
        assert!(validate_config(&config).is_err());

        let mut config = SystemConfig::default();
        config
            .simulation
            .classrooms
            .push(ClassroomConfig::new("ClassroomA", "dup", 10, 0.5));
        assert!(validate_config(&config).is_err());
    }
}
