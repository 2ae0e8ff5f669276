//! Hash executors.
//!
//! The proof-of-work transform is opaque to the rest of the crate: workers
//! hand an executor a job, a nonce and their scratch memory and get a 32-byte
//! digest back. The digest's last eight bytes, read little-endian, are what
//! gets compared against the job target.

use sha2::{Digest as _, Sha256};

use crate::pool::Job;

/// Output of one hash.
pub type Digest = [u8; 32];

/// Computes proof-of-work digests.
///
/// Implementations must be callable from many worker threads at once; all
/// per-thread state lives in the scratch slice the worker passes in.
pub trait HashExecutor: Send + Sync {
    fn name(&self) -> &'static str;

    /// Hash `job`'s blob with `nonce` in the nonce field.
    ///
    /// `scratch` is exactly one algorithm working set.
    fn hash(&self, job: &Job, nonce: u32, scratch: &mut [u8]) -> Digest;

    /// Hash `out.len()` consecutive nonces starting at `first`.
    ///
    /// `scratch` holds one working set per hash. Executors with a real
    /// interleaved multi-hash kernel override this.
    fn hash_many(&self, job: &Job, first: u32, scratch: &mut [u8], out: &mut [Digest]) {
        if out.is_empty() {
            return;
        }
        let per_hash = scratch.len() / out.len();
        for (i, (digest, chunk)) in out
            .iter_mut()
            .zip(scratch.chunks_mut(per_hash.max(1)))
            .enumerate()
        {
            *digest = self.hash(job, first.wrapping_add(i as u32), chunk);
        }
    }
}

/// Double SHA-256 over the blob.
///
/// Not memory-hard: it touches only the head of the scratch buffer. Used
/// when no production transform is linked so the pipeline runs end to end.
#[derive(Debug, Default, Clone, Copy)]
pub struct Sha256dExecutor;

impl HashExecutor for Sha256dExecutor {
    fn name(&self) -> &'static str {
        "sha256d"
    }

    fn hash(&self, job: &Job, nonce: u32, scratch: &mut [u8]) -> Digest {
        let blob = job.blob_with_nonce(nonce);
        let first = Sha256::digest(&blob);
        if scratch.len() >= first.len() {
            scratch[..first.len()].copy_from_slice(&first);
        }
        Sha256::digest(first).into()
    }
}
