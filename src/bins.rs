//! L3: free-list walks — fastbins, tcache, and the doubly-linked
//! unsorted/small/large bins (§4.4, §4.5).

use std::collections::HashSet;

use log::debug;

use crate::chunk::{Chunk, ChunkParser};
use crate::informer::ProcessInformer;
use crate::malloc_state::{MallocState, NFASTBINS};
use crate::{Address, PointerSize};

pub const NBINS: usize = 128;
pub const UNSORTED_BIN_INDEX: usize = 1;
pub const SMALL_BIN_START: usize = 2;
pub const SMALL_BIN_END: usize = 64;
pub const LARGE_BIN_START: usize = 64;
pub const LARGE_BIN_END: usize = 127;

/// The `(fd, bk)` head cell of one unsorted/small/large bin, materialized
/// eagerly by [`crate::malloc_state::MallocStateParser`]. `address` is the
/// location of the cell itself in `malloc_state.bins[]` — not the "virtual
/// chunk" address used for sentinel comparisons (that's `address - 2P`, see
/// [`bin_head_sentinel`]). Resolved against `examples/original_source/
/// pwnlib/heap/bins/bin_parser.py`'s `base_bin_address = bin_entry.address
/// - (pointer_size*2)`, which only makes sense if `bin_entry.address` is
/// the pair's own address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BinEntry {
    pub address: Address,
    pub fd: Address,
    pub bk: Address,
    pub chunks_size: u64,
}

/// The virtual bin-head chunk address used as the walk's termination
/// sentinel (§4.5, §9). An empty bin is one where `entry.fd ==
/// bin_head_sentinel(entry, pointer_size)`.
pub fn bin_head_sentinel(entry: &BinEntry, pointer_size: PointerSize) -> Address {
    entry.address.wrapping_sub(pointer_size.double())
}

/// `chunks_size` for small-bin index `i` (2..=63): `i * 2P` — glibc's
/// `SMALLBIN_WIDTH = MALLOC_ALIGNMENT` convention, cross-checked against
/// §3's own worked example ("on 64-bit: 0x20, 0x30, …" for indices 2, 3).
pub(crate) fn bin_chunks_size(index: usize, pointer_size: PointerSize) -> u64 {
    if (SMALL_BIN_START..SMALL_BIN_END).contains(&index) {
        index as u64 * pointer_size.double()
    } else {
        0
    }
}

/// `chunks_size` for fastbin index `k`: `2P*(k+2)`, cross-checked against
/// §8's worked example (`fastbinsY[4]` holding 0x60-sized chunks on
/// 64-bit: `16*(4+2) == 0x60`).
pub fn fastbin_chunks_size(index: usize, pointer_size: PointerSize) -> u64 {
    pointer_size.double() * (index as u64 + 2)
}

/// A doubly-linked bin (unsorted, small, or large) after its chunk chain
/// has been walked.
#[derive(Debug, Clone)]
pub struct Bin {
    pub entry: BinEntry,
    pub chunks: Vec<Chunk>,
}

impl Bin {
    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }
}

/// A singly-linked fastbin or tcache bin after its chain has been walked.
/// Free-list successors are `fd`-linked only; `safe_link` records whether
/// they were (and were demangled while walking).
#[derive(Debug, Clone)]
pub struct FastBin {
    pub index: usize,
    pub chunks_size: u64,
    pub chunks: Vec<Chunk>,
    pub safe_link: bool,
}

impl FastBin {
    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }
}

pub struct FastBinParser;

impl FastBinParser {
    pub fn parse_all_from_malloc_state(
        informer: &dyn ProcessInformer,
        malloc_state: &MallocState,
    ) -> Vec<FastBin> {
        (0..NFASTBINS)
            .map(|index| Self::parse_one(informer, malloc_state, index))
            .collect()
    }

    fn parse_one(
        informer: &dyn ProcessInformer,
        malloc_state: &MallocState,
        index: usize,
    ) -> FastBin {
        let safe_link = malloc_state.layout.has_safe_link;
        let chunks_size = fastbin_chunks_size(index, malloc_state.pointer_size);

        let mut visited = HashSet::new();
        let mut chunks = Vec::new();
        let mut current = malloc_state.fastbins[index];

        while current != 0 && visited.insert(current) {
            match ChunkParser::parse(informer, current) {
                Ok(chunk) => {
                    let next = if safe_link { chunk.fd_demangled } else { chunk.fd };
                    chunks.push(chunk);
                    current = next;
                }
                Err(e) => {
                    debug!("fastbin {index} walk stopped at {current:#x}: {e}");
                    break;
                }
            }
        }

        FastBin { index, chunks_size, chunks, safe_link }
    }
}

pub struct BinParser;

impl BinParser {
    pub fn parse_unsorted_bin(
        informer: &dyn ProcessInformer,
        malloc_state: &MallocState,
    ) -> Bin {
        Self::parse_from_entry(informer, malloc_state.pointer_size, *malloc_state.unsorted_bin())
    }

    pub fn parse_small_bins(
        informer: &dyn ProcessInformer,
        malloc_state: &MallocState,
    ) -> Vec<Bin> {
        malloc_state
            .small_bins()
            .iter()
            .map(|entry| Self::parse_from_entry(informer, malloc_state.pointer_size, *entry))
            .collect()
    }

    pub fn parse_large_bins(
        informer: &dyn ProcessInformer,
        malloc_state: &MallocState,
    ) -> Vec<Bin> {
        malloc_state
            .large_bins()
            .iter()
            .map(|entry| Self::parse_from_entry(informer, malloc_state.pointer_size, *entry))
            .collect()
    }

    /// Walks one doubly-linked bin via `fd`, starting the visited set at
    /// the virtual bin-head sentinel — not at `entry.address` itself — per
    /// §4.5 and §9.
    fn parse_from_entry(
        informer: &dyn ProcessInformer,
        pointer_size: PointerSize,
        entry: BinEntry,
    ) -> Bin {
        let head = bin_head_sentinel(&entry, pointer_size);
        let mut visited = HashSet::new();
        visited.insert(head);

        let mut chunks = Vec::new();
        let mut current = entry.fd;

        while !visited.contains(&current) {
            visited.insert(current);
            match ChunkParser::parse(informer, current) {
                Ok(chunk) => {
                    current = chunk.fd;
                    chunks.push(chunk);
                }
                Err(e) => {
                    debug!("bin walk stopped at {current:#x}: {e}");
                    break;
                }
            }
        }

        Bin { entry, chunks }
    }
}
