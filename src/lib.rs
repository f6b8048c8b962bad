//! An offline introspector of the glibc (ptmalloc2) heap: given read access
//! to a target's address space plus its libc version and pointer width,
//! this crate reconstructs the arena ring, per-arena `malloc_state`, the
//! chained `heap_info` regions, the chunk stream, and every free-list bin
//! (tcache, fastbins, unsorted/small/large bins) glibc's allocator
//! maintains.
//!
//! The crate does not read memory on its own — callers supply a
//! [`ProcessInformer`] backed by a live process (ptrace) or a core file.
//! Every parser here is a thin, independently callable layer over that
//! capability; there is no bundled façade object.
//!
//! ```text
//! L1 ChunkParser -> L2 MallocStateParser / HeapParser
//!                 -> L3 FastBinParser / BinParser / TcacheParser
//!                 -> L4 ArenaAssembler
//! ```

pub mod address;
pub mod arena;
pub mod bins;
pub mod chunk;
pub mod error;
pub mod heap;
pub mod informer;
pub mod malloc_state;
pub mod tcache;
pub mod version;

#[cfg(test)]
pub(crate) mod testing;

pub use address::{Address, PointerSize};
pub use arena::{Arena, ArenaAssembler};
pub use bins::{
    Bin, BinEntry, BinParser, FastBin, FastBinParser, LARGE_BIN_END, LARGE_BIN_START, NBINS,
    SMALL_BIN_END, SMALL_BIN_START, UNSORTED_BIN_INDEX, bin_head_sentinel, fastbin_chunks_size,
};
pub use chunk::{Chunk, ChunkFlags, ChunkParser, demangle};
pub use error::{HeapError, Result};
pub use heap::{HEAP_MAX_SIZE, Heap, HeapInfo, HeapParser, HeapRegion};
pub use informer::ProcessInformer;
pub use malloc_state::{MallocState, MallocStateParser, NFASTBINS, control_block_size};
pub use tcache::{TCACHE_MAX_BINS, TcacheParser, detect_tcache, tcache_chunk_size};
pub use version::{GlibcVersion, LayoutDescriptor};
