//! Server entry points over named pipes: the queued digest service and the
//! legacy single-shot protocol.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncReadExt;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::daemon::Coordinator;
use crate::dispatcher::{DispatchExit, Dispatcher};
use crate::hasher::{DigestEngine, Sha256Engine};
use crate::protocol::{self, LEGACY_RECORD_LEN, Response};
use crate::transport::{self, FifoResponder, Inbound, Responder};
use crate::worker::{self, WorkerContext};

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

const REOPEN_BACKOFF: Duration = Duration::from_millis(100);

#[tokio::main]
pub async fn run(config: Config) -> Result<(), BoxError> {
    let ctx = Arc::new(WorkerContext {
        coordinator: Coordinator::new(config.cache_capacity, config.registry_capacity),
        engine: Arc::new(Sha256Engine::new(config.block_size)),
        responder: Arc::new(FifoResponder::new(config.response_deadline)),
    });
    serve(&config, ctx).await
}

/// Creates the inbound FIFO and dispatches from it forever. Failing to create
/// or open the FIFO is fatal. The server holds a write end of its own FIFO, so
/// end-of-stream only follows a read error; either way the FIFO is reopened
/// after a short pause.
pub async fn serve(config: &Config, ctx: Arc<WorkerContext>) -> Result<(), BoxError> {
    let path = &config.inbound_path;
    transport::recreate_fifo(path)
        .map_err(|e| format!("Failed to create FIFO {}: {}", path.display(), e))?;

    info!(
        path = %path.display(),
        workers = config.max_workers,
        queue = config.queue_capacity,
        cache = config.cache_capacity,
        "digest server listening"
    );

    let mut dispatcher = Dispatcher::new(config, ctx);
    let mut inbound = open_inbound(path)?;

    loop {
        match dispatcher.run(&mut inbound).await {
            Ok(DispatchExit::Closed) => {
                warn!(path = %path.display(), "inbound closed, reopening")
            }
            Err(e) => error!(path = %path.display(), "inbound read failed: {}", e),
        }
        tokio::time::sleep(REOPEN_BACKOFF).await;
        inbound = open_inbound(path)?;
    }
}

fn open_inbound(path: &Path) -> Result<Inbound, String> {
    transport::open_inbound(path)
        .map_err(|e| format!("Failed to open FIFO {}: {}", path.display(), e))
}

/// Serves the single-shot protocol: one fixed-size record per request, one
/// task per request, no cache or coalescing.
#[tokio::main]
pub async fn run_legacy(fifo_path: PathBuf, block_size: usize) -> Result<(), BoxError> {
    transport::recreate_fifo(&fifo_path)
        .map_err(|e| format!("Failed to create FIFO {}: {}", fifo_path.display(), e))?;
    info!(path = %fifo_path.display(), "legacy digest server listening");

    let engine: Arc<dyn DigestEngine> = Arc::new(Sha256Engine::new(block_size));
    let responder: Arc<dyn Responder> = Arc::new(FifoResponder::default());
    let mut inbound = open_inbound(&fifo_path)?;
    let mut record = vec![0u8; LEGACY_RECORD_LEN];

    loop {
        if let Err(e) = inbound.read_exact(&mut record).await {
            if e.kind() != std::io::ErrorKind::UnexpectedEof {
                error!("legacy read failed: {}", e);
            }
            tokio::time::sleep(REOPEN_BACKOFF).await;
            inbound = open_inbound(&fifo_path)?;
            continue;
        }

        let message = match protocol::decode_legacy_record(&record) {
            Ok(message) => message,
            Err(e) => {
                warn!("{}", e);
                continue;
            }
        };

        let engine = Arc::clone(&engine);
        let responder = Arc::clone(&responder);
        tokio::spawn(async move {
            let response = match worker::compute(engine, PathBuf::from(&message.file_path)).await {
                Ok(digest) => Response::Digest(digest),
                Err(e) => {
                    warn!(path = %message.file_path, "{}", e);
                    Response::Error(e.to_string())
                }
            };
            let payload = response.encode_legacy().to_vec();
            if let Err(e) = responder.respond(&message.response_channel, payload).await {
                warn!(channel = %message.response_channel, "legacy response failed: {}", e);
            }
        });
    }
}
