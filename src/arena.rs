//! Append-only buffer backing the vdata segment of the image.

use std::collections::HashMap;
use bitflags::bitflags;
use crate::disk::VDATA_ALIGN;
use crate::error::*;

/// Geometric growth floor, 1 MiB
const MIN_GROW: usize = 1 << 20;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct AppendFlags: u32 {
        const DEDUP = 1 << 0;
        const ALIGN = 1 << 1;
    }
}

/// Reference to a stored byte range, relative to the start of the vdata
/// segment. The length never includes alignment padding.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VData {
    pub off: u64,
    pub len: u32,
}

#[derive(Default)]
pub struct Arena {
    data: Vec<u8>,
    /// Dedup index over stored ranges. Keys are owned copies of the bytes,
    /// so buffer growth never invalidates them.
    index: HashMap<Vec<u8>, VData>,
}

impl Arena {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> u64 {
        self.data.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn bytes(&self) -> &[u8] {
        &self.data
    }

    /// Append `bytes` and return where they live. With `DEDUP`, an equal
    /// range stored earlier is returned instead of a new copy. With `ALIGN`,
    /// zero padding first brings the buffer length to a multiple of 4; the
    /// returned offset is post-padding.
    pub fn append(&mut self, bytes: &[u8], flags: AppendFlags) -> FsResult<VData> {
        if bytes.len() > u32::MAX as usize {
            return Err(FsError::InvalidArgument);
        }

        if flags.contains(AppendFlags::DEDUP) {
            if let Some(v) = self.index.get(bytes) {
                return Ok(*v);
            }
        }

        let mut pad = 0;
        if flags.contains(AppendFlags::ALIGN) && self.data.len() % VDATA_ALIGN != 0 {
            pad = VDATA_ALIGN - self.data.len() % VDATA_ALIGN;
        }

        if self.data.len() + pad + bytes.len() > self.data.capacity() {
            let increment = MIN_GROW.max(pad + bytes.len());
            self.data
                .try_reserve_exact(self.data.capacity() + increment - self.data.len())
                .map_err(|_| FsError::OutOfMemory)?;
        }

        self.data.resize(self.data.len() + pad, 0);
        let out = VData {
            off: self.data.len() as u64,
            len: bytes.len() as u32,
        };
        self.data.extend_from_slice(bytes);

        // every stored range is indexed, later dedup lookups may hit it;
        // a key stored earlier keeps its first mapping
        self.index.entry(bytes.to_vec()).or_insert(out);

        Ok(out)
    }
}
