//! Streaming fs-verity measurement of a byte stream.
//!
//! Sha256 over 4 KiB blocks; each filled block hashes into the next level
//! up, so only one partial block per level is ever held. The final digest
//! is the sha256 of the fs-verity descriptor carrying the merkle root,
//! matching what the kernel reports for the same bytes as a file.

use sha2::{Digest, Sha256};
use std::io::{ErrorKind, Read};
use crate::error::*;
use crate::{Hash256, BLK_SZ};

const DESCRIPTOR_SZ: usize = 256;
const HASH_ALG_SHA256: u8 = 1;
const LOG_BLK_SZ: u8 = 12;

struct Level {
    blk: [u8; BLK_SZ],
    pos: usize,
}

impl Level {
    fn new() -> Self {
        Level {
            blk: [0u8; BLK_SZ],
            pos: 0,
        }
    }
}

pub struct FsVerityHasher {
    levels: Vec<Level>,
    n_bytes: u64,
}

impl Default for FsVerityHasher {
    fn default() -> Self {
        Self::new()
    }
}

impl FsVerityHasher {
    pub fn new() -> Self {
        FsVerityHasher {
            levels: Vec::new(),
            n_bytes: 0,
        }
    }

    /// Feed more stream bytes; chunking does not affect the final digest
    pub fn update(&mut self, data: &[u8]) {
        self.n_bytes += data.len() as u64;
        self.update_level(data, 0);
    }

    fn update_level(&mut self, mut data: &[u8], level: usize) {
        if level == self.levels.len() {
            self.levels.push(Level::new());
        }

        while !data.is_empty() {
            let l = &mut self.levels[level];
            let take = data.len().min(BLK_SZ - l.pos);
            l.blk[l.pos..l.pos + take].copy_from_slice(&data[..take]);
            l.pos += take;
            data = &data[take..];

            if self.levels[level].pos == BLK_SZ {
                let digest: Hash256 = Sha256::digest(&self.levels[level].blk[..]).into();
                self.levels[level].pos = 0;
                self.update_level(&digest, level + 1);
            }
        }
    }

    /// Zero-pad and hash the partial block at `level`, pushing the digest
    /// one level up
    fn flush_level(&mut self, level: usize) {
        let digest = {
            let l = &mut self.levels[level];
            if l.pos == 0 {
                return;
            }
            l.blk[l.pos..].fill(0);
            l.pos = 0;
            let d: Hash256 = Sha256::digest(&l.blk[..]).into();
            d
        };
        self.update_level(&digest, level + 1);
    }

    pub fn digest(mut self) -> Hash256 {
        let root: Hash256 = if self.levels.is_empty() {
            // empty stream, no merkle tree
            [0u8; 32]
        } else if self.levels.len() == 1 {
            // a single data block is its own tree
            let l = &mut self.levels[0];
            l.blk[l.pos..].fill(0);
            Sha256::digest(&l.blk[..]).into()
        } else {
            let mut level = 0;
            while level + 1 < self.levels.len() {
                self.flush_level(level);
                level += 1;
            }
            let top = self.levels.last_mut().unwrap();
            if top.pos == 32 {
                // exactly one carried hash, it already is the root
                top.blk[..32].try_into().unwrap()
            } else {
                top.blk[top.pos..].fill(0);
                Sha256::digest(&top.blk[..]).into()
            }
        };

        let mut desc = [0u8; DESCRIPTOR_SZ];
        desc[0] = 1; // descriptor version
        desc[1] = HASH_ALG_SHA256;
        desc[2] = LOG_BLK_SZ;
        desc[3] = 0; // salt_size
        desc[8..16].copy_from_slice(&self.n_bytes.to_le_bytes());
        desc[16..48].copy_from_slice(&root);
        Sha256::digest(desc).into()
    }
}

/// Measure a whole reader, as used for backing file contents
pub fn digest_from_reader<R: Read>(mut r: R) -> FsResult<Hash256> {
    let mut hasher = FsVerityHasher::new();
    let mut buf = [0u8; BLK_SZ];
    loop {
        match r.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => hasher.update(&buf[..n]),
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(hasher.digest())
}
