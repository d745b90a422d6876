//! Named-pipe transport: the shared inbound FIFO and per-request response FIFOs.

use std::ffi::CString;
use std::future::Future;
use std::io::{self, Read, Write};
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWriteExt, ReadBuf};
use tokio::net::unix::pipe;

use crate::config::RESPONSE_DEADLINE;

const FIFO_MODE: libc::mode_t = 0o666;
const OPEN_RETRY_INTERVAL: Duration = Duration::from_millis(10);

/// Creates a FIFO at `path`.
pub fn create_fifo(path: &Path) -> io::Result<()> {
    let c_path = CString::new(path.as_os_str().as_bytes())
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
    // SAFETY: `c_path` is a valid NUL-terminated string that outlives the call.
    let rc = unsafe { libc::mkfifo(c_path.as_ptr(), FIFO_MODE) };
    if rc == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

/// Removes whatever sits at `path` and creates a fresh FIFO there.
pub fn recreate_fifo(path: &Path) -> io::Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(e),
    }
    create_fifo(path)
}

/// Server end of an inbound FIFO.
///
/// The server always counts as a writer of its own FIFO, so reads wait
/// between clients instead of reporting end-of-file. On Linux the FIFO is
/// opened read-write; elsewhere a separate write end is kept open.
pub struct Inbound {
    receiver: pipe::Receiver,
    #[cfg(not(target_os = "linux"))]
    _writer: pipe::Sender,
}

pub fn open_inbound(path: &Path) -> io::Result<Inbound> {
    #[cfg(target_os = "linux")]
    let inbound = Inbound {
        receiver: pipe::OpenOptions::new().read_write(true).open_receiver(path)?,
    };
    #[cfg(not(target_os = "linux"))]
    let inbound = {
        let receiver = pipe::OpenOptions::new().open_receiver(path)?;
        Inbound {
            receiver,
            _writer: pipe::OpenOptions::new().open_sender(path)?,
        }
    };
    Ok(inbound)
}

impl AsyncRead for Inbound {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.receiver).poll_read(cx, buf)
    }
}

/// Delivers one response payload to a client-named channel.
/// Abstracted so workers can be exercised without real FIFOs.
pub trait Responder: Send + Sync {
    fn respond(
        &self,
        channel: &str,
        payload: Vec<u8>,
    ) -> Pin<Box<dyn Future<Output = io::Result<()>> + Send + '_>>;
}

/// Writes responses to client FIFOs without touching the blocking pool.
///
/// Only FIFOs are accepted as channels; any other file type is refused
/// before a byte is written. While the client has not opened its end yet the
/// open is retried, up to `deadline` for the whole delivery.
pub struct FifoResponder {
    deadline: Duration,
}

impl FifoResponder {
    pub fn new(deadline: Duration) -> Self {
        Self { deadline }
    }
}

impl Default for FifoResponder {
    fn default() -> Self {
        Self::new(RESPONSE_DEADLINE)
    }
}

impl Responder for FifoResponder {
    fn respond(
        &self,
        channel: &str,
        payload: Vec<u8>,
    ) -> Pin<Box<dyn Future<Output = io::Result<()>> + Send + '_>> {
        let channel = PathBuf::from(channel);
        let deadline = self.deadline;

        Box::pin(async move {
            tokio::time::timeout(deadline, deliver(&channel, &payload))
                .await
                .map_err(|_| {
                    io::Error::new(
                        io::ErrorKind::TimedOut,
                        format!("no reader on {} after {:?}", channel.display(), deadline),
                    )
                })?
        })
    }
}

async fn deliver(channel: &Path, payload: &[u8]) -> io::Result<()> {
    let mut sender = loop {
        // Non-blocking open: ENXIO until the client opens its read end.
        // Non-FIFO paths fail with InvalidInput.
        match pipe::OpenOptions::new().open_sender(channel) {
            Ok(sender) => break sender,
            Err(e) if e.raw_os_error() == Some(libc::ENXIO) => {
                tokio::time::sleep(OPEN_RETRY_INTERVAL).await
            }
            Err(e) => return Err(e),
        }
    };
    sender.write_all(payload).await?;
    sender.flush().await
}

/// Client side: writes one encoded request to the server's inbound FIFO.
pub fn send(inbound: &Path, payload: &[u8]) -> io::Result<()> {
    let mut out = std::fs::OpenOptions::new().write(true).open(inbound)?;
    out.write_all(payload)
}

/// Client side: reads a full response from a private channel until the
/// server closes it.
pub fn receive(channel: &Path) -> io::Result<Vec<u8>> {
    let mut input = std::fs::File::open(channel)?;
    let mut bytes = Vec::new();
    input.read_to_end(&mut bytes)?;
    Ok(bytes)
}
