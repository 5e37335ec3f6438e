//! Transport messages
//!
//! Every message carries the sending node's identity plus one typed body.
//! On the wire a message is a JSON object:
//!
//! ```json
//! {"node":{"name":"w1","address":"10.0.0.2"},
//!  "body":{"type":"execute","payload":{"job_name":"build","pipeline_file":"...","job_id":3}}}
//! ```

use serde::{Deserialize, Serialize};

use crate::domain::detail::JobDetail;
use crate::domain::node::Node;
use crate::domain::status::Status;

/// A (job name, execution id) pair
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobRef {
    pub job_name: String,
    pub job_id: u64,
}

impl JobRef {
    pub fn new(job_name: impl Into<String>, job_id: u64) -> Self {
        Self {
            job_name: job_name.into(),
            job_id,
        }
    }
}

impl std::fmt::Display for JobRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.job_name, self.job_id)
    }
}

/// Master asks a worker to run an execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecuteRequest {
    pub job_name: String,

    /// The job definition as YAML
    pub pipeline_file: String,

    pub job_id: u64,
}

impl ExecuteRequest {
    pub fn job_ref(&self) -> JobRef {
        JobRef::new(self.job_name.clone(), self.job_id)
    }
}

/// Live status of one execution, answering a status query
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusReport {
    pub job_name: String,
    pub job_id: u64,
    pub status: Status,
}

/// Final status of an execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub job_name: String,
    pub job_id: u64,
    pub status: Status,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Log output plus the current detail snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogChunk {
    pub job_name: String,
    pub job_id: u64,

    /// Number of log lines that precede `content`
    pub offset: usize,

    /// New log lines since the previous chunk
    pub content: String,

    pub detail: JobDetail,
}

/// Which per-execution directory a produced file belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileKind {
    /// Build outputs
    Artifact,
    /// Check reports
    Report,
}

/// A produced file of one execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileChunk {
    pub job_name: String,
    pub job_id: u64,
    pub kind: FileKind,

    /// Path below the execution's artifact or report directory
    pub path: String,

    pub data: Vec<u8>,
}

/// An error a worker reports about a request it could not handle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorReport {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job: Option<JobRef>,
    pub message: String,
}

/// Typed message payloads
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum Body {
    Register,
    Unregister,
    Heartbeat,
    Execute(ExecuteRequest),
    Cancel(JobRef),
    StatusQuery(JobRef),
    StatusResult(StatusReport),
    Result(ExecutionResult),
    Log(Box<LogChunk>),
    File(FileChunk),
    Error(ErrorReport),
}

impl Body {
    /// Short name for logging
    pub fn kind(&self) -> &'static str {
        match self {
            Body::Register => "register",
            Body::Unregister => "unregister",
            Body::Heartbeat => "heartbeat",
            Body::Execute(_) => "execute",
            Body::Cancel(_) => "cancel",
            Body::StatusQuery(_) => "status_query",
            Body::StatusResult(_) => "status_result",
            Body::Result(_) => "result",
            Body::Log(_) => "log",
            Body::File(_) => "file",
            Body::Error(_) => "error",
        }
    }
}

/// One unit on a master/worker stream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Sender identity
    pub node: Node,
    pub body: Body,
}

impl Message {
    pub fn new(node: Node, body: Body) -> Self {
        Self { node, body }
    }

    pub fn register(node: Node) -> Self {
        Self::new(node, Body::Register)
    }

    pub fn unregister(node: Node) -> Self {
        Self::new(node, Body::Unregister)
    }

    pub fn heartbeat(node: Node) -> Self {
        Self::new(node, Body::Heartbeat)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_shape() {
        let msg = Message::new(
            Node::new("w1", "10.0.0.2"),
            Body::Cancel(JobRef::new("build", 3)),
        );
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["node"]["name"], "w1");
        assert_eq!(value["body"]["type"], "cancel");
        assert_eq!(value["body"]["payload"]["job_id"], 3);

        let unit = serde_json::to_value(Message::heartbeat(Node::new("w1", "h"))).unwrap();
        assert_eq!(unit["body"]["type"], "heartbeat");
    }

    #[test]
    fn test_status_result_decodes() {
        let json = r#"{"node":{"name":"w","address":"a"},
            "body":{"type":"status_result","payload":{"job_name":"j","job_id":1,"status":"RUNNING"}}}"#;
        let msg: Message = serde_json::from_str(json).unwrap();
        assert_eq!(
            msg.body,
            Body::StatusResult(StatusReport {
                job_name: "j".into(),
                job_id: 1,
                status: Status::Running
            })
        );
        assert_eq!(msg.body.kind(), "status_result");
    }
}
