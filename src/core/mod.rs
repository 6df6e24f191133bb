//! Core module - negotiation round tracking.
//!
//! Rounds are keyed by the negotiation id the monitor mints; this module
//! follows their phase and the commitments accepted inside them.

pub mod round;

pub use round::{trace_phase, NegotiationRound, RoundBook, RoundPhase};
