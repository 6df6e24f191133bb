//! exitpact library root.

pub mod agent;
pub mod cli;
pub mod config;
pub mod core;
pub mod error;
pub mod logging;
pub mod protocol;
pub mod simulation;

pub use agent::{Agent, ClassroomAgent, MonitorAgent};
pub use cli::Commands;
pub use config::{load_config, SystemConfig};
pub use error::{Error, Result};
pub use protocol::{Message, MessageBroker};
pub use simulation::{RoundSummary, Simulation};
