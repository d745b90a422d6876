//! Command-line client: submits files to a running server and prints their
//! digests, smallest file first.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::debug;

use crate::protocol::{self, Response};
use crate::transport;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DigestReport {
    pub path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub digest: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl DigestReport {
    fn failed(path: &str, size: Option<u64>, error: impl ToString) -> Self {
        Self {
            path: path.to_string(),
            size,
            digest: None,
            error: Some(error.to_string()),
        }
    }

    fn from_response(path: &str, size: u64, response: Response) -> Self {
        match response {
            Response::Digest(digest) => Self {
                path: path.to_string(),
                size: Some(size),
                digest: Some(digest),
                error: None,
            },
            Response::Error(message) => Self::failed(path, Some(size), message),
        }
    }
}

/// Which server protocol the requests are encoded for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wire {
    /// `path::channel` NUL-terminated messages.
    Queued,
    /// Fixed 512-byte records of the single-shot server.
    Legacy,
}

impl Wire {
    fn encode(self, file: &str, channel: &str) -> Vec<u8> {
        match self {
            Wire::Queued => protocol::encode_message(file, channel),
            Wire::Legacy => protocol::encode_legacy_record(file, channel),
        }
    }
}

struct Submitted {
    path: String,
    size: u64,
    channel: PathBuf,
}

fn channel_path(index: usize) -> PathBuf {
    std::env::temp_dir().join(format!("digestd_client_{}_{}", std::process::id(), index))
}

/// Sends one request per file, then collects every response. Responses are
/// read concurrently: the server answers in size order, not argument order.
pub fn request(inbound: &Path, files: &[String], wire: Wire) -> Vec<DigestReport> {
    let mut reports = Vec::with_capacity(files.len());
    let mut submitted = Vec::new();

    for (index, file) in files.iter().enumerate() {
        let size = match fs::metadata(file) {
            Ok(metadata) => metadata.len(),
            Err(e) => {
                reports.push(DigestReport::failed(file, None, e));
                continue;
            }
        };

        let channel = channel_path(index);
        if let Err(e) = transport::recreate_fifo(&channel) {
            reports.push(DigestReport::failed(file, Some(size), e));
            continue;
        }

        let payload = wire.encode(file, &channel.to_string_lossy());
        if let Err(e) = transport::send(inbound, &payload) {
            let _ = fs::remove_file(&channel);
            reports.push(DigestReport::failed(file, Some(size), e));
            continue;
        }
        debug!(path = %file, channel = %channel.display(), "request sent");

        submitted.push(Submitted {
            path: file.clone(),
            size,
            channel,
        });
    }

    std::thread::scope(|scope| {
        let readers: Vec<_> = submitted
            .iter()
            .map(|s| scope.spawn(move || transport::receive(&s.channel)))
            .collect();

        for (s, reader) in submitted.iter().zip(readers) {
            reports.push(collect(s, reader.join()));
            let _ = fs::remove_file(&s.channel);
        }
    });

    sort_by_size(&mut reports);
    reports
}

fn collect(s: &Submitted, received: std::thread::Result<io::Result<Vec<u8>>>) -> DigestReport {
    match received {
        Ok(Ok(bytes)) => DigestReport::from_response(&s.path, s.size, Response::decode(&bytes)),
        Ok(Err(e)) => DigestReport::failed(&s.path, Some(s.size), e),
        Err(_) => DigestReport::failed(&s.path, Some(s.size), "response reader panicked"),
    }
}

/// Ascending size; files that could not be stat'ed go last.
pub fn sort_by_size(reports: &mut [DigestReport]) {
    reports.sort_by_key(|r| (r.size.is_none(), r.size));
}

pub fn print(reports: &[DigestReport], json: bool, out: &mut impl Write) -> io::Result<()> {
    for report in reports {
        if json {
            serde_json::to_writer(&mut *out, report)?;
            writeln!(out)?;
            continue;
        }

        match (&report.digest, report.size) {
            (Some(digest), Some(size)) => {
                writeln!(out, "{} ({} bytes):\nSHA-256: {}\n", report.path, size, digest)?
            }
            _ => writeln!(
                out,
                "{}:\nERROR: {}\n",
                report.path,
                report.error.as_deref().unwrap_or("unknown error")
            )?,
        }
    }
    out.flush()
}
