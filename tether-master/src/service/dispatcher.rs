//! Node Dispatcher
//!
//! Tracks live worker nodes and decides where executions run.
//!
//! - Membership changes, pings and round-robin selection all go through one
//!   lock so the node map and the rotation order never disagree
//! - `is_valid_node` and listings read the concurrent map without that lock
//! - Every execute request is recorded per (job, execution id); cancels and
//!   status queries go to the most recently recorded node

use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use thiserror::Error;

use tether_core::domain::node::{Node, NodeSummary};
use tether_core::dto::message::{Body, ExecuteRequest, JobRef, Message};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DispatchError {
    #[error("node {0} is already registered")]
    AlreadyRegistered(String),

    #[error("node {0} is not registered")]
    UnknownNode(String),

    #[error("no node available")]
    NoNodeAvailable,

    #[error("execution {0} was never dispatched")]
    NotDispatched(JobRef),
}

pub type Result<T> = std::result::Result<T, DispatchError>;

struct NodeEntry {
    node: Node,
    registered_at: DateTime<Utc>,
    last_ping: Instant,
    last_ping_at: DateTime<Utc>,
}

/// Round-robin order over registered node keys
#[derive(Default)]
struct Rotation {
    keys: Vec<String>,
    next: usize,
}

pub struct Dispatcher {
    /// Identity stamped on outbound messages
    identity: Node,
    timeout: Duration,
    nodes: DashMap<String, NodeEntry>,
    rotation: Mutex<Rotation>,
    history: DashMap<JobRef, Vec<String>>,
}

impl Dispatcher {
    /// The rotation lock, recovered if a previous holder panicked
    fn rotation(&self) -> MutexGuard<'_, Rotation> {
        self.rotation.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Dispatcher {
    pub fn new(identity: Node, timeout: Duration) -> Self {
        Self {
            identity,
            timeout,
            nodes: DashMap::new(),
            rotation: Mutex::new(Rotation::default()),
            history: DashMap::new(),
        }
    }

    // =========================================================================
    // Membership
    // =========================================================================

    /// Adds a node; a node with the same key must not already be live
    pub fn register(&self, node: Node) -> Result<()> {
        let key = node.key();
        let mut rotation = self.rotation();

        if self.nodes.contains_key(&key) {
            return Err(DispatchError::AlreadyRegistered(key));
        }

        let now = Utc::now();
        self.nodes.insert(
            key.clone(),
            NodeEntry {
                node,
                registered_at: now,
                last_ping: Instant::now(),
                last_ping_at: now,
            },
        );
        rotation.keys.push(key.clone());

        tracing::info!("Node registered: {}", key);
        Ok(())
    }

    pub fn unregister(&self, node: &Node) -> Result<()> {
        self.unregister_by_key(&node.key())
    }

    pub fn unregister_by_key(&self, key: &str) -> Result<()> {
        let mut rotation = self.rotation();
        if !self.remove_locked(&mut rotation, key) {
            return Err(DispatchError::UnknownNode(key.to_string()));
        }

        tracing::info!("Node unregistered: {}", key);
        Ok(())
    }

    /// Refreshes the last-seen time of a registered node
    pub fn ping(&self, node: &Node) -> Result<()> {
        let key = node.key();
        let _rotation = self.rotation();

        let mut entry = self
            .nodes
            .get_mut(&key)
            .ok_or_else(|| DispatchError::UnknownNode(key.clone()))?;
        entry.last_ping = Instant::now();
        entry.last_ping_at = Utc::now();

        tracing::debug!("Heartbeat received from node: {}", key);
        Ok(())
    }

    /// Evicts every node silent for longer than the timeout
    ///
    /// Returns the evicted keys.
    pub fn health_check(&self) -> Vec<String> {
        self.evict_stale(Instant::now())
    }

    fn evict_stale(&self, now: Instant) -> Vec<String> {
        let mut rotation = self.rotation();

        let stale: Vec<String> = self
            .nodes
            .iter()
            .filter(|entry| now.duration_since(entry.last_ping) > self.timeout)
            .map(|entry| entry.key().clone())
            .collect();

        for key in &stale {
            self.remove_locked(&mut rotation, key);
            tracing::warn!("Node {} missed heartbeats, evicted", key);
        }

        stale
    }

    /// Removes a node from the map and the rotation; caller holds the lock
    fn remove_locked(&self, rotation: &mut Rotation, key: &str) -> bool {
        if self.nodes.remove(key).is_none() {
            return false;
        }

        if let Some(pos) = rotation.keys.iter().position(|k| k == key) {
            rotation.keys.remove(pos);
            if pos < rotation.next {
                rotation.next -= 1;
            }
            if rotation.next >= rotation.keys.len() {
                rotation.next = 0;
            }
        }
        true
    }

    // =========================================================================
    // Selection
    // =========================================================================

    /// Returns the next node in round-robin order
    pub fn dispatch_node(&self) -> Result<Node> {
        let mut rotation = self.rotation();

        if rotation.keys.is_empty() {
            return Err(DispatchError::NoNodeAvailable);
        }

        let index = rotation.next % rotation.keys.len();
        rotation.next = (index + 1) % rotation.keys.len();

        let key = &rotation.keys[index];
        self.nodes
            .get(key)
            .map(|entry| entry.node.clone())
            .ok_or(DispatchError::NoNodeAvailable)
    }

    pub fn is_valid_node(&self, key: &str) -> bool {
        self.nodes.contains_key(key)
    }

    pub fn nodes(&self) -> Vec<NodeSummary> {
        let mut nodes: Vec<NodeSummary> = self
            .nodes
            .iter()
            .map(|entry| NodeSummary {
                key: entry.key().clone(),
                name: entry.node.name.clone(),
                address: entry.node.address.clone(),
                registered_at: entry.registered_at,
                last_ping_at: entry.last_ping_at,
            })
            .collect();
        nodes.sort_by(|a, b| a.key.cmp(&b.key));
        nodes
    }

    // =========================================================================
    // Outbound messages
    // =========================================================================

    /// Builds an execute message for `node` and records the assignment
    pub fn send_job(&self, node: &Node, request: ExecuteRequest) -> Message {
        self.history
            .entry(request.job_ref())
            .or_default()
            .push(node.key());

        Message::new(self.identity.clone(), Body::Execute(request))
    }

    /// Builds a cancel message for the node that last received `job`
    pub fn cancel_job(&self, job: &JobRef) -> Result<(Node, Message)> {
        let node = self.assigned_node(job)?;
        Ok((node, Message::new(self.identity.clone(), Body::Cancel(job.clone()))))
    }

    /// Builds a status query for the node that last received `job`
    pub fn status_query(&self, job: &JobRef) -> Result<(Node, Message)> {
        let node = self.assigned_node(job)?;
        Ok((
            node,
            Message::new(self.identity.clone(), Body::StatusQuery(job.clone())),
        ))
    }

    /// Node keys `job` was sent to, oldest first
    pub fn history(&self, job: &JobRef) -> Vec<String> {
        self.history
            .get(job)
            .map(|keys| keys.value().clone())
            .unwrap_or_default()
    }

    pub fn forget(&self, job: &JobRef) {
        self.history.remove(job);
    }

    fn assigned_node(&self, job: &JobRef) -> Result<Node> {
        let key = self
            .history
            .get(job)
            .and_then(|keys| keys.last().cloned())
            .ok_or_else(|| DispatchError::NotDispatched(job.clone()))?;

        self.nodes
            .get(&key)
            .map(|entry| entry.node.clone())
            .ok_or(DispatchError::UnknownNode(key))
    }
}
