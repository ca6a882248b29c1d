//! # Voice Activity Detection
//!
//! - **detector**: the per-session hysteresis state machine with pre-roll
//! - **model**: the pluggable speech-probability scorer and its energy-based default

pub mod detector;
pub mod model;

pub use detector::{VadEngine, VadResult, VadStatus};
pub use model::{EnergyProbabilityModel, SpeechProbabilityModel};
