//! Step boundary
//!
//! Action phases run inside `guarded`, which turns every way a phase can end
//! besides success into an `ExecutionFault`: an error, a panic, or the
//! execution being cancelled while it runs.

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;

use futures::FutureExt;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Error)]
pub enum ExecutionFault {
    #[error("cancelled")]
    Cancelled,

    #[error("{0:#}")]
    Failed(anyhow::Error),

    #[error("runtime fault: {0}")]
    Panicked(String),
}

/// Runs one action phase, racing it against cancellation
pub async fn guarded<T, F>(token: &CancellationToken, work: F) -> Result<T, ExecutionFault>
where
    F: Future<Output = anyhow::Result<T>>,
{
    tokio::select! {
        biased;
        _ = token.cancelled() => Err(ExecutionFault::Cancelled),
        outcome = contained(work) => outcome,
    }
}

/// Runs one action phase to completion, containing panics
pub async fn contained<T, F>(work: F) -> Result<T, ExecutionFault>
where
    F: Future<Output = anyhow::Result<T>>,
{
    match AssertUnwindSafe(work).catch_unwind().await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(ExecutionFault::Failed(e)),
        Err(panic) => Err(ExecutionFault::Panicked(panic_message(panic.as_ref()))),
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
