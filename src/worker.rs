//! Per-request worker: cache probe, single-flight claim, compute or wait,
//! respond.
//!
//! The worker body is separated from spawning so it can be driven directly in
//! tests with a mock engine and responder.

use std::path::PathBuf;
use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, warn};

use crate::daemon::{Claim, Coordinator};
use crate::hasher::{self, DigestEngine, DigestError};
use crate::inflight::{DigestOutcome, RegistryError};
use crate::pool::Slot;
use crate::protocol::{Request, Response};
use crate::transport::Responder;

#[derive(Error, Debug)]
pub enum WorkerError {
    #[error(transparent)]
    Digest(#[from] DigestError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("Digest task failed: {0}")]
    Task(#[from] tokio::task::JoinError),

    #[error("Failed to respond on {channel}: {source}")]
    Respond {
        channel: String,
        source: std::io::Error,
    },
}

/// Everything a worker shares with its siblings.
pub struct WorkerContext {
    pub coordinator: Arc<Coordinator>,
    pub engine: Arc<dyn DigestEngine>,
    pub responder: Arc<dyn Responder>,
}

/// Runs `request` on its own task. The slot is released when the task ends,
/// however it ends.
pub fn spawn(ctx: Arc<WorkerContext>, request: Request, slot: Slot) {
    tokio::spawn(async move {
        let _slot = slot;
        if let Err(e) = handle(&ctx, request).await {
            warn!("{}", e);
        }
    });
}

/// Resolves the digest for one request and writes the response.
pub async fn handle(ctx: &WorkerContext, request: Request) -> Result<(), WorkerError> {
    let response = match resolve(ctx, &request.file_path).await {
        Ok(digest) => Response::Digest(digest),
        Err(message) => {
            warn!(path = %request.file_path, error = %message, "digest unavailable");
            Response::Error(message)
        }
    };

    ctx.responder
        .respond(&request.response_channel, response.encode())
        .await
        .map_err(|source| WorkerError::Respond {
            channel: request.response_channel.clone(),
            source,
        })?;

    debug!(path = %request.file_path, channel = %request.response_channel, "response sent");
    Ok(())
}

async fn resolve(ctx: &WorkerContext, path: &str) -> DigestOutcome {
    let claim = ctx
        .coordinator
        .claim(path)
        .map_err(|e| WorkerError::from(e).to_string())?;

    match claim {
        Claim::Cached(digest) => Ok(digest),
        Claim::Wait(handle) => {
            let outcome = ctx.coordinator.wait(handle).await;
            debug!(path = %path, ok = outcome.is_ok(), "received in-flight digest");
            outcome
        }
        Claim::Compute(claim) => {
            debug!(path = %path, "computing digest");
            let outcome = compute(Arc::clone(&ctx.engine), PathBuf::from(path))
                .await
                .map_err(|e| e.to_string());
            ctx.coordinator.publish(claim, outcome.clone());
            outcome
        }
    }
}

/// Runs the engine on the blocking pool; file reads never stall the runtime.
pub async fn compute(engine: Arc<dyn DigestEngine>, path: PathBuf) -> Result<String, WorkerError> {
    let digest = tokio::task::spawn_blocking(move || engine.digest(&path)).await??;
    Ok(hasher::to_hex(&digest))
}
