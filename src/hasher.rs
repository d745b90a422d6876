use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::config::DIGEST_BLOCK_SIZE;

pub const DIGEST_LEN: usize = 32;
pub const DIGEST_HEX_LEN: usize = DIGEST_LEN * 2;

#[derive(Error, Debug)]
pub enum DigestError {
    #[error("Failed to open file {path}: {source}")]
    Open {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to read file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Computes the content digest of a file.
/// Implementations block on file I/O; callers run them off the async runtime.
pub trait DigestEngine: Send + Sync {
    fn digest(&self, path: &Path) -> Result<[u8; DIGEST_LEN], DigestError>;
}

/// Streaming SHA-256 over fixed-size blocks.
pub struct Sha256Engine {
    block_size: usize,
}

impl Sha256Engine {
    pub fn new(block_size: usize) -> Self {
        Self {
            block_size: block_size.max(1),
        }
    }
}

impl Default for Sha256Engine {
    fn default() -> Self {
        Self::new(DIGEST_BLOCK_SIZE)
    }
}

impl DigestEngine for Sha256Engine {
    fn digest(&self, path: &Path) -> Result<[u8; DIGEST_LEN], DigestError> {
        let mut file = File::open(path).map_err(|source| DigestError::Open {
            path: path.to_path_buf(),
            source,
        })?;

        let mut hasher = Sha256::new();
        let mut block = vec![0u8; self.block_size];
        loop {
            let n = match file.read(&mut block) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(source) => {
                    return Err(DigestError::Read {
                        path: path.to_path_buf(),
                        source,
                    });
                }
            };
            hasher.update(&block[..n]);
        }

        Ok(hasher.finalize().into())
    }
}

/// Lowercase hex rendering, always `DIGEST_HEX_LEN` characters.
pub fn to_hex(digest: &[u8; DIGEST_LEN]) -> String {
    hex::encode(digest)
}
