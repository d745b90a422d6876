//! Wire protocol: request framing and parsing, response encoding.
//!
//! Inbound messages are `"<filePath>::<responseChannel>"` terminated by NUL
//! (a newline is accepted too). Several messages may share one read, and a
//! message may be split across reads; [`MessageFramer`] handles both.
//!
//! Responses are 64 lowercase hex characters followed by NUL, or
//! `"error: <message>"` followed by NUL when no digest could be produced.
//!
//! The legacy single-shot protocol uses fixed 512-byte request records and a
//! fixed 65-byte response buffer.

use thiserror::Error;

use crate::hasher::DIGEST_HEX_LEN;

pub const SEPARATOR: &str = "::";
pub const TERMINATOR: u8 = 0;
const ERROR_PREFIX: &str = "error: ";

pub const LEGACY_FIELD_LEN: usize = 256;
pub const LEGACY_RECORD_LEN: usize = LEGACY_FIELD_LEN * 2;
pub const LEGACY_RESPONSE_LEN: usize = DIGEST_HEX_LEN + 1;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Malformed request (missing '::'): {0}")]
    MissingSeparator(String),

    #[error("Malformed request (empty file path or channel): {0}")]
    EmptyField(String),

    #[error("Request is not valid UTF-8")]
    InvalidUtf8,

    #[error("Request exceeds {max} bytes")]
    TooLong { max: usize },

    #[error("Legacy record must be {expected} bytes, got {actual}")]
    RecordLength { expected: usize, actual: usize },
}

/// A parsed, stat'ed request waiting for a worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub file_path: String,
    pub response_channel: String,
    pub file_size: u64,
    key: String,
}

impl Request {
    pub fn new(file_path: String, response_channel: String, file_size: u64) -> Self {
        let key = format!("{file_path}{SEPARATOR}{response_channel}");
        Self {
            file_path,
            response_channel,
            file_size,
            key,
        }
    }

    /// `file_path::response_channel`, the queue's tie-breaker.
    pub fn key(&self) -> &str {
        &self.key
    }
}

/// A message that parsed but has not been stat'ed yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub file_path: String,
    pub response_channel: String,
}

impl Message {
    pub fn into_request(self, file_size: u64) -> Request {
        Request::new(self.file_path, self.response_channel, file_size)
    }
}

pub fn parse_message(raw: &[u8]) -> Result<Message, ProtocolError> {
    let text = std::str::from_utf8(raw).map_err(|_| ProtocolError::InvalidUtf8)?;
    let text = text.trim_end_matches('\r');
    let (file_path, response_channel) = text
        .split_once(SEPARATOR)
        .ok_or_else(|| ProtocolError::MissingSeparator(text.to_string()))?;

    if file_path.is_empty() || response_channel.is_empty() {
        return Err(ProtocolError::EmptyField(text.to_string()));
    }

    Ok(Message {
        file_path: file_path.to_string(),
        response_channel: response_channel.to_string(),
    })
}

pub fn encode_message(file_path: &str, response_channel: &str) -> Vec<u8> {
    let mut bytes = format!("{file_path}{SEPARATOR}{response_channel}").into_bytes();
    bytes.push(TERMINATOR);
    bytes
}

/// Splits a byte stream into delimited messages, carrying incomplete tails
/// over to the next read.
pub struct MessageFramer {
    pending: Vec<u8>,
    max_len: usize,
    /// Set while skipping the rest of an oversized message.
    discarding: bool,
}

impl MessageFramer {
    pub fn new(max_len: usize) -> Self {
        Self {
            pending: Vec::new(),
            max_len,
            discarding: false,
        }
    }

    /// Feeds one read's worth of bytes. Returns every complete message; empty
    /// messages (consecutive delimiters) are skipped.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<Result<Vec<u8>, ProtocolError>> {
        let mut messages = Vec::new();

        for &byte in bytes {
            if byte == TERMINATOR || byte == b'\n' {
                if self.discarding {
                    self.discarding = false;
                } else if !self.pending.is_empty() {
                    messages.push(Ok(std::mem::take(&mut self.pending)));
                }
                continue;
            }
            if self.discarding {
                continue;
            }
            if self.pending.len() >= self.max_len {
                self.pending.clear();
                self.discarding = true;
                messages.push(Err(ProtocolError::TooLong { max: self.max_len }));
                continue;
            }
            self.pending.push(byte);
        }

        messages
    }

    /// Bytes buffered for a message whose terminator has not arrived yet.
    #[cfg(test)]
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    Digest(String),
    Error(String),
}

impl Response {
    pub fn encode(&self) -> Vec<u8> {
        let mut bytes = match self {
            Response::Digest(hex) => hex.as_bytes().to_vec(),
            Response::Error(message) => format!("{ERROR_PREFIX}{message}").into_bytes(),
        };
        bytes.push(TERMINATOR);
        bytes
    }

    /// Parses a response read from a channel. Anything that is neither a
    /// 64-char hex digest nor an error message becomes an error.
    pub fn decode(bytes: &[u8]) -> Response {
        let end = bytes
            .iter()
            .position(|&b| b == TERMINATOR)
            .unwrap_or(bytes.len());
        let text = String::from_utf8_lossy(&bytes[..end]);

        if is_digest_hex(&text) {
            Response::Digest(text.into_owned())
        } else if let Some(message) = text.strip_prefix(ERROR_PREFIX) {
            Response::Error(message.to_string())
        } else if text.is_empty() {
            Response::Error("empty response".to_string())
        } else {
            Response::Error(format!("unexpected response: {text}"))
        }
    }

    /// Fixed 65-byte buffer of the legacy protocol. Error text is truncated to
    /// fit; the last byte is always NUL.
    pub fn encode_legacy(&self) -> [u8; LEGACY_RESPONSE_LEN] {
        let mut buffer = [0u8; LEGACY_RESPONSE_LEN];
        let encoded = self.encode();
        let len = encoded.len().min(LEGACY_RESPONSE_LEN - 1);
        buffer[..len].copy_from_slice(&encoded[..len]);
        buffer
    }
}

pub fn is_digest_hex(text: &str) -> bool {
    text.len() == DIGEST_HEX_LEN && text.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}

/// Decodes a legacy `{ file_path[256], response_channel[256] }` record, each
/// field NUL-padded.
pub fn decode_legacy_record(record: &[u8]) -> Result<Message, ProtocolError> {
    if record.len() != LEGACY_RECORD_LEN {
        return Err(ProtocolError::RecordLength {
            expected: LEGACY_RECORD_LEN,
            actual: record.len(),
        });
    }

    let field = |bytes: &[u8]| -> Result<String, ProtocolError> {
        let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
        std::str::from_utf8(&bytes[..end])
            .map(str::to_string)
            .map_err(|_| ProtocolError::InvalidUtf8)
    };

    let file_path = field(&record[..LEGACY_FIELD_LEN])?;
    let response_channel = field(&record[LEGACY_FIELD_LEN..])?;
    if file_path.is_empty() || response_channel.is_empty() {
        return Err(ProtocolError::EmptyField(format!(
            "{file_path}{SEPARATOR}{response_channel}"
        )));
    }

    Ok(Message {
        file_path,
        response_channel,
    })
}

pub fn encode_legacy_record(file_path: &str, response_channel: &str) -> Vec<u8> {
    let mut record = vec![0u8; LEGACY_RECORD_LEN];
    // Keep the final byte of each field as padding so it stays NUL-terminated.
    let path = &file_path.as_bytes()[..file_path.len().min(LEGACY_FIELD_LEN - 1)];
    let channel = &response_channel.as_bytes()[..response_channel.len().min(LEGACY_FIELD_LEN - 1)];
    record[..path.len()].copy_from_slice(path);
    record[LEGACY_FIELD_LEN..LEGACY_FIELD_LEN + channel.len()].copy_from_slice(channel);
    record
}
