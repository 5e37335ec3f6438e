//! Data Transfer Objects
//!
//! - `message`: the typed messages carried on master/worker streams
//! - `job`: request and event payloads of the master's HTTP API

pub mod job;
pub mod message;
