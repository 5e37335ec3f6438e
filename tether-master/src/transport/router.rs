//! Inbound message routing
//!
//! Maps each message a worker sends onto registry or execution state updates.
//! Messages from one connection are routed one at a time, in arrival order.

use tether_core::dto::message::{Body, Message};

use crate::service::engine::MasterEngine;

pub async fn route(engine: &MasterEngine, message: Message) {
    let Message { node, body } = message;
    let kind = body.kind();

    let outcome = match body {
        Body::Register | Body::Heartbeat => {
            engine.heartbeat(&node);
            Ok(())
        }
        Body::Unregister => {
            engine.leave(&node);
            Ok(())
        }
        Body::Execute(_) | Body::Cancel(_) | Body::StatusQuery(_) => {
            tracing::warn!("Node {} sent a master-only {} message", node, kind);
            Ok(())
        }
        Body::StatusResult(report) => {
            engine.resolve_status_query(report);
            Ok(())
        }
        Body::Result(result) => engine.apply_result(result).await,
        Body::Log(chunk) => engine.record_log(*chunk).await,
        Body::File(file) => engine.save_file(file).await,
        Body::Error(report) => {
            match report.job {
                Some(job) => tracing::warn!("Node {} reported for {}: {}", node, job, report.message),
                None => tracing::warn!("Node {} reported: {}", node, report.message),
            }
            Ok(())
        }
    };

    if let Err(e) = outcome {
        tracing::error!("Failed to handle {} from {}: {}", kind, node, e);
    }
}
