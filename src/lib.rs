//! Malicious package detection for npm and PyPI.
//!
//! Source text, registry metadata and optional sandbox telemetry are turned
//! into a fixed-width feature vector, scored by a random forest and combined
//! with rule matches into an explained [`shared::scoring::Verdict`].

pub mod coordinator;
pub mod features;
pub mod shared;

pub use coordinator::{ScoringService, ServiceConfig};
pub use shared::error::{Error, Result};
