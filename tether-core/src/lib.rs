//! Tether Core
//!
//! Core types and abstractions shared by the Tether master and workers.
//!
//! This crate contains:
//! - Domain types: jobs, execution details, nodes, statuses, action results
//! - DTOs: the wire messages exchanged between master and workers
//! - Resolver: turns a job's stage graph into a linear execution plan
//! - Transport: the framed message codec used on every master/worker stream
//! - Store: filesystem persistence for jobs, executions, logs and files

pub mod domain;
pub mod dto;
pub mod resolver;
pub mod store;
pub mod transport;
