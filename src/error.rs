//! Error kinds per §7. Every variant carries the offending address (or, for
//! `LayoutUnknown`, the version that had no descriptor) — no error recovers
//! into silently-wrong data.

use crate::Address;

#[derive(Debug, thiserror::Error, PartialEq, Eq, Clone)]
pub enum HeapError {
    /// The informer could not satisfy a read of `len` bytes at `address`.
    #[error("read failure at {address:#x} (len {len})")]
    ReadFailure { address: Address, len: usize },

    /// `libc_version` has no known layout descriptor.
    #[error("no layout known for glibc {major}.{minor}")]
    LayoutUnknown { major: u32, minor: u32 },

    /// Tcache data was explicitly requested from a build where tcache is
    /// disabled. Never raised by ordinary arena assembly, which simply
    /// omits the tcache.
    #[error("tcache is not enabled for this build")]
    NoTcacheError,

    /// A chunk's size would exit its region, or is zero. Parsing of that
    /// region stops here; already-collected chunks are still returned.
    #[error("truncated region at {address:#x}")]
    TruncatedRegion { address: Address },
}

pub type Result<T> = std::result::Result<T, HeapError>;
