//! The dispatcher: reads the inbound channel, frames and stats requests,
//! orders them through the queue and admits them into the worker pool.

use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use crate::config::Config;
use crate::pool::WorkerPool;
use crate::protocol::{self, MessageFramer, Request, Response};
use crate::queue::RequestQueue;
use crate::worker::{self, WorkerContext};

/// Observes every request at the moment it leaves the queue for a worker.
pub type DispatchHook = Arc<dyn Fn(&Request) + Send + Sync>;

/// Why [`Dispatcher::run`] returned.
#[derive(Debug, PartialEq, Eq)]
pub enum DispatchExit {
    /// The inbound stream reported end-of-file.
    Closed,
}

pub struct Dispatcher {
    framer: MessageFramer,
    read_size: usize,
    queue: Arc<RequestQueue>,
    pool: WorkerPool,
    ctx: Arc<WorkerContext>,
    /// Bounds error replies still waiting for their client.
    rejects: Arc<Semaphore>,
    hook: Option<DispatchHook>,
}

impl Dispatcher {
    pub fn new(config: &Config, ctx: Arc<WorkerContext>) -> Self {
        Self {
            framer: MessageFramer::new(config.max_message_len),
            read_size: config.max_message_len,
            queue: Arc::new(RequestQueue::new(config.queue_capacity)),
            pool: WorkerPool::new(config.max_workers),
            ctx,
            rejects: Arc::new(Semaphore::new(config.queue_capacity)),
            hook: None,
        }
    }

    pub fn with_hook(mut self, hook: DispatchHook) -> Self {
        self.hook = Some(hook);
        self
    }

    #[cfg(test)]
    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    /// Reads until the stream ends. Each successful read is drained fully
    /// before the next one starts.
    pub async fn run<R>(&mut self, reader: &mut R) -> std::io::Result<DispatchExit>
    where
        R: AsyncRead + Unpin,
    {
        let mut buffer = vec![0u8; self.read_size];
        loop {
            let n = reader.read(&mut buffer).await?;
            if n == 0 {
                return Ok(DispatchExit::Closed);
            }
            debug!(bytes = n, "inbound read");
            self.drain(&buffer[..n]).await;
        }
    }

    /// Enqueues every valid message of one read, then dispatches that many
    /// requests in queue order.
    pub async fn drain(&mut self, bytes: &[u8]) {
        let mut admitted = 0usize;

        for framed in self.framer.push(bytes) {
            let raw = match framed {
                Ok(raw) => raw,
                Err(e) => {
                    warn!("{}", e);
                    continue;
                }
            };
            let message = match protocol::parse_message(&raw) {
                Ok(message) => message,
                Err(e) => {
                    warn!("{}", e);
                    continue;
                }
            };
            debug!(path = %message.file_path, channel = %message.response_channel, "request received");

            let file_size = match tokio::fs::metadata(&message.file_path).await {
                Ok(metadata) => metadata.len(),
                Err(e) => {
                    warn!(path = %message.file_path, error = %e, "stat failed, request skipped");
                    self.reject(message.response_channel, format!("stat {}: {}", message.file_path, e));
                    continue;
                }
            };

            let request = message.into_request(file_size);
            let channel = request.response_channel.clone();
            match self.queue.enqueue(request) {
                Ok(()) => admitted += 1,
                Err(e) => {
                    warn!(channel = %channel, "{}", e);
                    self.reject(channel, e.to_string());
                }
            }
        }

        for _ in 0..admitted {
            let slot = match self.pool.acquire().await {
                Ok(slot) => slot,
                Err(e) => {
                    warn!("worker pool closed: {}", e);
                    return;
                }
            };
            let request = self.queue.dequeue().await;
            if let Some(hook) = &self.hook {
                hook(&request);
            }
            debug!(
                path = %request.file_path,
                size = request.file_size,
                active = self.pool.active(),
                "dispatching"
            );
            worker::spawn(Arc::clone(&self.ctx), request, slot);
        }

        if admitted > 0 {
            let (cached, in_flight) = self.ctx.coordinator.usage();
            debug!(
                dispatched = admitted,
                queued = self.queue.len(),
                peak_workers = self.pool.peak(),
                cached,
                in_flight,
                "batch drained"
            );
        }
    }

    /// Answers a request that never made it into the queue. Runs detached so
    /// a slow client cannot stall the dispatcher; once too many replies are
    /// pending the request is only logged.
    fn reject(&self, channel: String, message: String) {
        let Ok(permit) = Arc::clone(&self.rejects).try_acquire_owned() else {
            warn!(channel = %channel, "too many pending error responses, dropping");
            return;
        };
        let responder = Arc::clone(&self.ctx.responder);
        tokio::spawn(async move {
            let _permit = permit;
            let payload = Response::Error(message).encode();
            if let Err(e) = responder.respond(&channel, payload).await {
                debug!(channel = %channel, error = %e, "could not deliver error response");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::daemon::Coordinator;
    use crate::hasher::Sha256Engine;
    use crate::protocol::encode_message;
    use crate::transport::{FifoResponder, create_fifo, receive};
    use crate::worker::tests::{ChannelResponder, CountingEngine};
    use parking_lot::Mutex;
    use std::collections::HashMap;
    use std::sync::atomic::Ordering;
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio::sync::mpsc;

    const HELLO_SHA256: &str = "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824";

    fn dispatcher(
        config: &Config,
        engine: Arc<dyn crate::hasher::DigestEngine>,
    ) -> (Dispatcher, Arc<WorkerContext>, mpsc::UnboundedReceiver<(String, Response)>) {
        let (responder, rx) = ChannelResponder::new();
        let ctx = Arc::new(WorkerContext {
            coordinator: Coordinator::new(config.cache_capacity, config.registry_capacity),
            engine,
            responder: Arc::new(responder),
        });
        (Dispatcher::new(config, Arc::clone(&ctx)), ctx, rx)
    }

    async fn collect(
        rx: &mut mpsc::UnboundedReceiver<(String, Response)>,
        count: usize,
    ) -> HashMap<String, Response> {
        let mut responses = HashMap::new();
        while responses.len() < count {
            let (channel, response) = tokio::time::timeout(Duration::from_secs(5), rx.recv())
                .await
                .expect("timed out waiting for responses")
                .expect("responder dropped");
            responses.insert(channel, response);
        }
        responses
    }

    fn write_file(dir: &TempDir, name: &str, len: usize) -> String {
        let path = dir.path().join(name);
        std::fs::write(&path, vec![b'x'; len]).unwrap();
        path.to_string_lossy().into_owned()
    }

    #[tokio::test]
    async fn test_single_request_end_to_end() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a.txt");
        std::fs::write(&path, "hello").unwrap();
        let path = path.to_string_lossy().into_owned();

        let config = Config::default();
        let (mut dispatcher, _ctx, mut rx) = dispatcher(&config, Arc::new(Sha256Engine::default()));

        let input = encode_message(&path, "/tmp/resp1");
        let exit = dispatcher.run(&mut input.as_slice()).await.unwrap();
        assert_eq!(exit, DispatchExit::Closed);

        let responses = collect(&mut rx, 1).await;
        assert_eq!(responses["/tmp/resp1"], Response::Digest(HELLO_SHA256.into()));
    }

    #[tokio::test]
    async fn test_batch_dispatched_smallest_first() {
        let dir = TempDir::new().unwrap();
        let big = write_file(&dir, "big", 500);
        let small = write_file(&dir, "small", 10);
        let mid = write_file(&dir, "mid", 100);

        let config = Config {
            max_workers: 1,
            ..Config::default()
        };
        let (dispatcher, _ctx, mut rx) = dispatcher(&config, Arc::new(Sha256Engine::default()));

        let order = Arc::new(Mutex::new(Vec::new()));
        let mut dispatcher = {
            let order = Arc::clone(&order);
            dispatcher.with_hook(Arc::new(move |request: &Request| {
                order.lock().push(request.file_size);
            }))
        };

        let mut batch = encode_message(&big, "/tmp/r500");
        batch.extend(encode_message(&small, "/tmp/r10"));
        batch.extend(encode_message(&mid, "/tmp/r100"));
        dispatcher.drain(&batch).await;

        collect(&mut rx, 3).await;
        assert_eq!(*order.lock(), vec![10, 100, 500]);
        assert!(dispatcher.pool().peak() <= 1);
    }

    #[tokio::test]
    async fn test_bad_messages_do_not_abort_batch() {
        let dir = TempDir::new().unwrap();
        let good = write_file(&dir, "good", 3);
        let missing = dir.path().join("missing").to_string_lossy().into_owned();

        let config = Config::default();
        let (mut dispatcher, _ctx, mut rx) = dispatcher(&config, Arc::new(Sha256Engine::default()));

        let mut batch = b"no-separator-here\0".to_vec();
        batch.extend(encode_message(&missing, "/tmp/r_missing"));
        batch.extend(encode_message(&good, "/tmp/r_good"));
        dispatcher.drain(&batch).await;

        let responses = collect(&mut rx, 2).await;
        assert!(matches!(responses["/tmp/r_good"], Response::Digest(_)));
        assert!(matches!(responses["/tmp/r_missing"], Response::Error(_)));
    }

    #[tokio::test]
    async fn test_message_split_across_reads() {
        let dir = TempDir::new().unwrap();
        let path = write_file(&dir, "split", 42);

        let config = Config::default();
        let (mut dispatcher, _ctx, mut rx) = dispatcher(&config, Arc::new(Sha256Engine::default()));

        let message = encode_message(&path, "/tmp/r_split");
        let (head, tail) = message.split_at(message.len() / 2);
        dispatcher.drain(head).await;
        dispatcher.drain(tail).await;

        let responses = collect(&mut rx, 1).await;
        assert!(matches!(responses["/tmp/r_split"], Response::Digest(_)));
    }

    #[tokio::test]
    async fn test_full_queue_rejects_overflow() {
        let dir = TempDir::new().unwrap();
        let config = Config {
            queue_capacity: 2,
            ..Config::default()
        };
        let (mut dispatcher, _ctx, mut rx) = dispatcher(&config, Arc::new(Sha256Engine::default()));

        let mut batch = Vec::new();
        for i in 0..3 {
            let path = write_file(&dir, &format!("f{i}"), i + 1);
            batch.extend(encode_message(&path, &format!("/tmp/r{i}")));
        }
        dispatcher.drain(&batch).await;

        let responses = collect(&mut rx, 3).await;
        let errors = responses
            .values()
            .filter(|r| matches!(r, Response::Error(m) if m.contains("queue full")))
            .count();
        assert_eq!(errors, 1);
        assert!(matches!(responses["/tmp/r0"], Response::Digest(_)));
        assert!(matches!(responses["/tmp/r1"], Response::Digest(_)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_duplicate_paths_in_batch_compute_once() {
        let dir = TempDir::new().unwrap();
        let path = write_file(&dir, "dup", 64);
        let engine = Arc::new(CountingEngine::new(Duration::from_millis(150)));

        let config = Config::default();
        let (mut dispatcher, _ctx, mut rx) = dispatcher(&config, engine.clone());

        let mut batch = Vec::new();
        for i in 0..4 {
            batch.extend(encode_message(&path, &format!("/tmp/dup{i}")));
        }
        dispatcher.drain(&batch).await;

        let responses = collect(&mut rx, 4).await;
        let first = &responses["/tmp/dup0"];
        assert!(matches!(first, Response::Digest(_)));
        assert!(responses.values().all(|r| r == first));
        assert_eq!(engine.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_pool_bound_holds_under_load() {
        let dir = TempDir::new().unwrap();
        let engine = Arc::new(CountingEngine::new(Duration::from_millis(20)));
        let config = Config::default();
        let (mut dispatcher, _ctx, mut rx) = dispatcher(&config, engine.clone());

        let mut batch = Vec::new();
        for i in 0..12 {
            let path = write_file(&dir, &format!("load{i}"), i);
            batch.extend(encode_message(&path, &format!("/tmp/load{i}")));
        }
        dispatcher.drain(&batch).await;

        collect(&mut rx, 12).await;
        assert!(dispatcher.pool().peak() <= config.max_workers);
        assert_eq!(engine.calls.load(Ordering::SeqCst), 12);
    }

    fn fifo_dispatcher(config: &Config, deadline: Duration) -> Dispatcher {
        let ctx = Arc::new(WorkerContext {
            coordinator: Coordinator::new(config.cache_capacity, config.registry_capacity),
            engine: Arc::new(Sha256Engine::default()),
            responder: Arc::new(FifoResponder::new(deadline)),
        });
        Dispatcher::new(config, ctx)
    }

    #[test]
    fn test_unread_error_channels_do_not_stall_dispatch() {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .max_blocking_threads(2)
            .enable_all()
            .build()
            .unwrap();

        let dir = TempDir::new().unwrap();
        let good = dir.path().join("good.txt");
        std::fs::write(&good, "hello").unwrap();
        let good_channel = dir.path().join("r_good");
        create_fifo(&good_channel).unwrap();

        let mut batch = Vec::new();
        for i in 0..4 {
            let channel = dir.path().join(format!("r_unread{i}"));
            create_fifo(&channel).unwrap();
            let missing = dir.path().join(format!("missing{i}"));
            batch.extend(encode_message(
                missing.to_str().unwrap(),
                channel.to_str().unwrap(),
            ));
        }
        let good_message = encode_message(good.to_str().unwrap(), good_channel.to_str().unwrap());

        let (reply_tx, reply_rx) = tokio::sync::oneshot::channel();
        let reader_channel = good_channel.clone();
        std::thread::spawn(move || {
            let _ = reply_tx.send(receive(&reader_channel));
        });

        runtime.block_on(async move {
            let mut dispatcher = fifo_dispatcher(&Config::default(), Duration::from_secs(30));
            dispatcher.drain(&batch).await;

            tokio::time::timeout(Duration::from_secs(3), dispatcher.drain(&good_message))
                .await
                .expect("dispatcher stalled behind unread error channels");
            let reply = tokio::time::timeout(Duration::from_secs(3), reply_rx)
                .await
                .expect("no reply for the readable request")
                .unwrap()
                .unwrap();
            assert_eq!(Response::decode(&reply), Response::Digest(HELLO_SHA256.into()));
        });
        runtime.shutdown_background();
    }

    #[tokio::test]
    async fn test_error_reply_leaves_regular_file_alone() {
        let dir = TempDir::new().unwrap();
        let notes = dir.path().join("notes.txt");
        std::fs::write(&notes, "user data").unwrap();
        let missing = dir.path().join("missing");

        let mut dispatcher = fifo_dispatcher(&Config::default(), Duration::from_millis(100));
        dispatcher
            .drain(&encode_message(missing.to_str().unwrap(), notes.to_str().unwrap()))
            .await;

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(std::fs::read(&notes).unwrap(), b"user data");
    }

    #[tokio::test]
    async fn test_pending_error_replies_are_bounded() {
        let dir = TempDir::new().unwrap();
        let config = Config {
            queue_capacity: 2,
            ..Config::default()
        };
        let mut dispatcher = fifo_dispatcher(&config, Duration::from_secs(30));

        let mut batch = Vec::new();
        for i in 0..5 {
            let channel = dir.path().join(format!("r{i}"));
            create_fifo(&channel).unwrap();
            let missing = dir.path().join(format!("missing{i}"));
            batch.extend(encode_message(
                missing.to_str().unwrap(),
                channel.to_str().unwrap(),
            ));
        }
        dispatcher.drain(&batch).await;

        assert_eq!(dispatcher.rejects.available_permits(), 0);
    }
}
