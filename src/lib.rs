//! Duskbell library - weekly notifications timed against local sunset
//!
//! This module exports internal components for integration testing.

pub mod cli;
pub mod clock;
pub mod config;
pub mod dedupe;
pub mod notify;
pub mod orchestrator;
pub mod redact;
pub mod rule;
pub mod scheduler;
pub mod solar;
