//! Service Module
//!
//! Node registry and the engine behind the HTTP and transport surfaces.

pub mod dispatcher;
pub mod engine;
