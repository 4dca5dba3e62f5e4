// src/blockminer.rs - The 112-byte mining header exchanged with miners
//
// Layout (big-endian):
//   0..32   work hash
//   32..40  timestamp (milliseconds)
//   40..48  nonce
//   48..80  extra nonce (48..64 job id, 64..72 pool nonce, 72..80 reserved)
//   80..112 pool public key
use crate::constants::{BLOB_LENGTH, BLOCKMINER_LENGTH};
use crate::error::{PoolError, Result};
use crate::pow::{self, Algorithm};
use crate::util;
use std::fmt;

/// A fixed-size mining header. All accessors operate in place on the
/// underlying buffer.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct BlockMiner([u8; BLOCKMINER_LENGTH]);

impl BlockMiner {
    /// Build a header from its three 32-byte components, stamping the
    /// current time and a zero nonce.
    pub fn new(work_hash: [u8; 32], extra_nonce: [u8; 32], public_key: [u8; 32]) -> Self {
        let mut buf = [0u8; BLOCKMINER_LENGTH];
        buf[0..32].copy_from_slice(&work_hash);
        buf[32..40].copy_from_slice(&util::now_millis().to_be_bytes());
        // nonce (40..48) stays zero
        buf[48..80].copy_from_slice(&extra_nonce);
        buf[80..112].copy_from_slice(&public_key);
        BlockMiner(buf)
    }

    /// Rebuild a header from the 96-byte template blob
    /// (work hash + extra nonce + public key), with a fresh timestamp.
    pub fn from_blob(blob: &[u8]) -> Result<Self> {
        if blob.len() != BLOB_LENGTH {
            return Err(PoolError::BlockHeader(format!(
                "malformed blob: expected {} bytes, got {}",
                BLOB_LENGTH,
                blob.len()
            )));
        }
        let mut work_hash = [0u8; 32];
        let mut extra_nonce = [0u8; 32];
        let mut public_key = [0u8; 32];
        work_hash.copy_from_slice(&blob[0..32]);
        extra_nonce.copy_from_slice(&blob[32..64]);
        public_key.copy_from_slice(&blob[64..96]);
        Ok(BlockMiner::new(work_hash, extra_nonce, public_key))
    }

    /// Interpret a full 112-byte buffer as a header
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() != BLOCKMINER_LENGTH {
            return Err(PoolError::BlockHeader(format!(
                "invalid header length: expected {} bytes, got {}",
                BLOCKMINER_LENGTH,
                data.len()
            )));
        }
        let mut buf = [0u8; BLOCKMINER_LENGTH];
        buf.copy_from_slice(data);
        Ok(BlockMiner(buf))
    }

    pub fn as_bytes(&self) -> &[u8; BLOCKMINER_LENGTH] {
        &self.0
    }

    /// The 96-byte template blob sent to Xatum/getwork miners
    pub fn blob(&self) -> [u8; BLOB_LENGTH] {
        let mut blob = [0u8; BLOB_LENGTH];
        blob[0..32].copy_from_slice(&self.0[0..32]);
        blob[32..64].copy_from_slice(&self.0[48..80]);
        blob[64..96].copy_from_slice(&self.0[80..112]);
        blob
    }

    pub fn work_hash(&self) -> [u8; 32] {
        self.0[0..32].try_into().unwrap()
    }

    pub fn timestamp(&self) -> u64 {
        u64::from_be_bytes(self.0[32..40].try_into().unwrap())
    }

    pub fn set_timestamp(&mut self, timestamp: u64) {
        self.0[32..40].copy_from_slice(&timestamp.to_be_bytes());
    }

    pub fn nonce(&self) -> u64 {
        u64::from_be_bytes(self.0[40..48].try_into().unwrap())
    }

    pub fn set_nonce(&mut self, nonce: u64) {
        self.0[40..48].copy_from_slice(&nonce.to_be_bytes());
    }

    pub fn extra_nonce(&self) -> [u8; 32] {
        self.0[48..80].try_into().unwrap()
    }

    pub fn set_extra_nonce(&mut self, extra_nonce: [u8; 32]) {
        self.0[48..80].copy_from_slice(&extra_nonce);
    }

    /// Job id: the first 16 bytes of the extra nonce
    pub fn job_id(&self) -> [u8; 16] {
        self.0[48..64].try_into().unwrap()
    }

    pub fn set_job_id(&mut self, job_id: [u8; 16]) {
        self.0[48..64].copy_from_slice(&job_id);
    }

    /// Pool nonce: the 8 bytes after the job id, constant per slave process
    pub fn pool_nonce(&self) -> [u8; 8] {
        self.0[64..72].try_into().unwrap()
    }

    pub fn set_pool_nonce(&mut self, pool_nonce: [u8; 8]) {
        self.0[64..72].copy_from_slice(&pool_nonce);
    }

    pub fn public_key(&self) -> [u8; 32] {
        self.0[80..112].try_into().unwrap()
    }

    /// Fast (non-PoW) hash identifying the block
    pub fn hash(&self) -> [u8; 32] {
        pow::fast_hash(&self.0)
    }

    /// Full proof-of-work hash of the header
    pub fn pow_hash(&self, algorithm: Algorithm) -> [u8; 32] {
        pow::pow_hash(&self.0, algorithm)
    }
}

impl fmt::Debug for BlockMiner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlockMiner")
            .field("work_hash", &hex::encode(self.work_hash()))
            .field("timestamp", &self.timestamp())
            .field("nonce", &self.nonce())
            .field("extra_nonce", &hex::encode(self.extra_nonce()))
            .field("public_key", &hex::encode(self.public_key()))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> BlockMiner {
        BlockMiner::new([0x11; 32], [0x22; 32], [0x33; 32])
    }

    #[test]
    fn test_blob_roundtrip() {
        let bm = sample();
        let blob = bm.blob();

        let mut back = BlockMiner::from_blob(&blob).unwrap();
        back.set_timestamp(bm.timestamp());

        assert_eq!(back, bm);
        assert_eq!(back.blob(), blob);
    }

    #[test]
    fn test_from_blob_rejects_bad_length() {
        assert!(BlockMiner::from_blob(&[0u8; 95]).is_err());
        assert!(BlockMiner::from_blob(&[0u8; 112]).is_err());
        assert!(BlockMiner::from_bytes(&[0u8; 96]).is_err());
    }

    #[test]
    fn test_setters_leave_unrelated_fields_unchanged() {
        let mut bm = sample();
        let work_hash = bm.work_hash();
        let public_key = bm.public_key();
        let timestamp = bm.timestamp();

        bm.set_nonce(0xdead_beef_cafe_f00d);
        bm.set_job_id([7u8; 16]);
        bm.set_pool_nonce([9u8; 8]);

        assert_eq!(bm.work_hash(), work_hash);
        assert_eq!(bm.public_key(), public_key);
        assert_eq!(bm.timestamp(), timestamp);
        assert_eq!(bm.nonce(), 0xdead_beef_cafe_f00d);
        assert_eq!(bm.job_id(), [7u8; 16]);
        assert_eq!(bm.pool_nonce(), [9u8; 8]);
    }

    #[test]
    fn test_extra_nonce_partition() {
        let mut bm = sample();
        bm.set_extra_nonce([0u8; 32]);
        bm.set_job_id([0xaa; 16]);
        bm.set_pool_nonce([0xbb; 8]);

        let xn = bm.extra_nonce();
        assert_eq!(&xn[0..16], &[0xaa; 16]);
        assert_eq!(&xn[16..24], &[0xbb; 8]);
        assert_eq!(&xn[24..32], &[0u8; 8]);
    }

    #[test]
    fn test_nonce_is_big_endian() {
        let mut bm = sample();
        bm.set_nonce(1);
        assert_eq!(bm.as_bytes()[47], 1);
        assert_eq!(bm.as_bytes()[40], 0);
    }
}
