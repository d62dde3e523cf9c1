pub mod disk;
pub mod error;
pub mod fs;
pub mod node;
pub mod verity;
pub mod writer;
pub(crate) mod arena;

pub use error::*;
pub use fs::{build_from_path, BuildFlags};
pub use node::{Node, Timespec};
pub use verity::{digest_from_reader, FsVerityHasher};
pub use writer::write_to;
pub use log::{warn, info, debug};

/// Block size of the fs-verity merkle construction
pub const BLK_SZ: usize = 4096;

pub type Hash256 = [u8; 32];

macro_rules! write_to_blob {
    ($T: ty) => {
        impl AsRef<[u8]> for $T {
            #[inline]
            fn as_ref(&self) -> &[u8] {
                let ptr = self as *const $T as *const u8;
                unsafe { std::slice::from_raw_parts(ptr, std::mem::size_of::<$T>()) }
            }
        }
    };
}
pub(crate) use write_to_blob;
