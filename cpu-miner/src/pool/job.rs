//! Mining jobs and shares.

use std::sync::Arc;
use std::time::SystemTime;

use crate::algo::Algorithm;
use crate::error::{Error, Result};
use crate::hasher::Digest;

use super::PoolId;

/// Byte offset of the 32-bit little-endian nonce inside a hashing blob.
pub const NONCE_OFFSET: usize = 39;

/// Smallest blob that still contains a complete nonce field.
pub const MIN_BLOB_SIZE: usize = NONCE_OFFSET + 4;

/// Largest blob a pool may send.
pub const MAX_BLOB_SIZE: usize = 128;

/// Unit of work issued by a pool.
///
/// Jobs are immutable. A new job supersedes the previous one for its
/// originating connection; `seq` increases by one for every job a
/// connection accepts, so a lower `seq` always means older work.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Job {
    /// Identifier assigned by the pool (opaque)
    pub id: String,

    /// Hashing blob with the nonce field at [`NONCE_OFFSET`]
    pub blob: Vec<u8>,

    /// 64-bit compact target; a digest qualifies when its top word is below it
    pub target: u64,

    /// Algorithm the blob must be hashed with
    pub algo: Algorithm,

    /// Connection that issued the job
    pub pool: PoolId,

    /// Per-connection sequence number
    pub seq: u64,

    /// Pool owns the top nonce byte
    pub nicehash: bool,
}

impl Job {
    /// Build a job from the hex strings pools send.
    pub fn from_hex(
        id: &str,
        blob_hex: &str,
        target_hex: &str,
        algo: Algorithm,
        pool: PoolId,
        seq: u64,
        nicehash: bool,
    ) -> Result<Self> {
        if id.is_empty() {
            return Err(Error::Protocol("job id is empty".to_string()));
        }

        Ok(Self {
            id: id.to_string(),
            blob: parse_blob(blob_hex)?,
            target: parse_target(target_hex)?,
            algo,
            pool,
            seq,
            nicehash,
        })
    }

    /// Integer difficulty implied by the target.
    pub fn difficulty(&self) -> u64 {
        u64::MAX / self.target.max(1)
    }

    /// Nonce value already present in the blob.
    ///
    /// Under nicehash the pool puts its reserved top byte here.
    pub fn blob_nonce(&self) -> u32 {
        let mut bytes = [0u8; 4];
        bytes.copy_from_slice(&self.blob[NONCE_OFFSET..NONCE_OFFSET + 4]);
        u32::from_le_bytes(bytes)
    }

    /// Blob with `nonce` written into the nonce field.
    pub fn blob_with_nonce(&self, nonce: u32) -> Vec<u8> {
        let mut blob = self.blob.clone();
        blob[NONCE_OFFSET..NONCE_OFFSET + 4].copy_from_slice(&nonce.to_le_bytes());
        blob
    }

    /// Whether `digest` satisfies this job's target.
    pub fn meets_target(&self, digest: &Digest) -> bool {
        let mut top = [0u8; 8];
        top.copy_from_slice(&digest[24..32]);
        u64::from_le_bytes(top) < self.target
    }
}

/// A nonce/digest pair satisfying a job's target.
///
/// Created by a worker, consumed exactly once by the connection that issued
/// the job.
#[derive(Debug, Clone)]
pub struct Share {
    pub job: Arc<Job>,
    pub nonce: u32,
    pub digest: Digest,
    pub found_at: SystemTime,
}

impl Share {
    pub fn new(job: Arc<Job>, nonce: u32, digest: Digest) -> Self {
        Self {
            job,
            nonce,
            digest,
            found_at: SystemTime::now(),
        }
    }

    /// Nonce in the little-endian hex form pools expect.
    pub fn nonce_hex(&self) -> String {
        hex::encode(self.nonce.to_le_bytes())
    }

    pub fn digest_hex(&self) -> String {
        hex::encode(self.digest)
    }
}

fn parse_blob(blob_hex: &str) -> Result<Vec<u8>> {
    let blob =
        hex::decode(blob_hex).map_err(|e| Error::Protocol(format!("job blob hex: {}", e)))?;
    if blob.len() < MIN_BLOB_SIZE || blob.len() > MAX_BLOB_SIZE {
        return Err(Error::Protocol(format!(
            "job blob length {} outside {}..={}",
            blob.len(),
            MIN_BLOB_SIZE,
            MAX_BLOB_SIZE
        )));
    }
    Ok(blob)
}

/// Parse a pool target.
///
/// Pools send either a 32-bit little-endian target (8 hex chars), which is
/// widened to the 64-bit form, or the 64-bit little-endian target itself
/// (16 hex chars).
pub fn parse_target(target_hex: &str) -> Result<u64> {
    let bytes =
        hex::decode(target_hex).map_err(|e| Error::Protocol(format!("job target hex: {}", e)))?;

    match bytes.len() {
        4 => {
            let mut raw = [0u8; 4];
            raw.copy_from_slice(&bytes);
            let raw = u32::from_le_bytes(raw) as u64;
            if raw == 0 {
                return Err(Error::Protocol("job target is zero".to_string()));
            }
            Ok(u64::MAX / (u32::MAX as u64 / raw))
        }
        8 => {
            let mut raw = [0u8; 8];
            raw.copy_from_slice(&bytes);
            match u64::from_le_bytes(raw) {
                0 => Err(Error::Protocol("job target is zero".to_string())),
                target => Ok(target),
            }
        }
        n => Err(Error::Protocol(format!("job target has {} bytes", n))),
    }
}
