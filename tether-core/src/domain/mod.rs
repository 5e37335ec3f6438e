//! Core domain types
//!
//! This module contains the core domain structures used across Tether services.
//! Definitions (`Job`) are loaded from YAML and are immutable during execution;
//! runtime wrappers (`JobDetail` and friends) are mutated by the executor and
//! persisted by both master and worker.

pub mod detail;
pub mod job;
pub mod log;
pub mod node;
pub mod result;
pub mod status;
