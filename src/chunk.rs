//! L1: decode one chunk header at an address (§4.1).

use crate::informer::ProcessInformer;
use crate::{Address, HeapError, PointerSize};

const PREV_INUSE: u64 = 0x1;
const IS_MMAPPED: u64 = 0x2;
const NON_MAIN_ARENA: u64 = 0x4;
const SIZE_BITS: u64 = PREV_INUSE | IS_MMAPPED | NON_MAIN_ARENA;

/// The three low bits packed into a chunk's size field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ChunkFlags {
    pub prev_inuse: bool,
    pub is_mmapped: bool,
    pub non_main_arena: bool,
}

impl ChunkFlags {
    fn from_raw_size(raw_size: u64) -> Self {
        Self {
            prev_inuse: raw_size & PREV_INUSE != 0,
            is_mmapped: raw_size & IS_MMAPPED != 0,
            non_main_arena: raw_size & NON_MAIN_ARENA != 0,
        }
    }
}

/// `demangle(ptr, storage_loc) = ptr XOR (storage_loc >> 12)` — safe-linking
/// (glibc >= 2.32), applied only to singly-linked free-list successors. The
/// storage location is the address where `ptr` is *stored*, not the address
/// of the chunk `ptr` points to.
pub fn demangle(ptr: u64, storage_loc: Address) -> u64 {
    ptr ^ (storage_loc >> 12)
}

/// One decoded chunk header, per §3 "Chunk".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Chunk {
    pub address: Address,
    pub prev_size: u64,
    /// `raw_size & !0x7`.
    pub size: u64,
    /// The size field exactly as stored, flag bits included.
    pub raw_size: u64,
    pub flags: ChunkFlags,
    pub fd: u64,
    pub bk: u64,
    pub fd_nextsize: u64,
    pub bk_nextsize: u64,
    /// `demangle(fd, address_of_fd_field)`. Always computed; callers decide
    /// whether the chunk is actually on a safe-linked list (fastbin/tcache
    /// on glibc >= 2.32) before trusting it over raw `fd`.
    pub fd_demangled: u64,
}

impl Chunk {
    pub fn actual_size(&self) -> u64 {
        self.size
    }

    pub fn is_in_use(&self) -> bool {
        self.flags.prev_inuse
    }

    /// `size % (2P) == 0` — §3 invariant for in-arena chunks. Violations are
    /// reported to the caller but never abort parsing elsewhere.
    pub fn has_aligned_size(&self, pointer_size: PointerSize) -> bool {
        self.size % pointer_size.double() == 0
    }
}

pub struct ChunkParser;

impl ChunkParser {
    /// Reads `2P + 4P` bytes at `address` and decodes a [`Chunk`]. Fails
    /// with [`HeapError::ReadFailure`] if the informer cannot serve the
    /// range — callers decide whether that's fatal (propagated) or just
    /// ends a walk early (swallowed).
    pub fn parse(informer: &dyn ProcessInformer, address: Address) -> Result<Chunk, HeapError> {
        let p = informer.pointer_size().bytes() as u64;
        let len = (6 * p) as usize;
        let bytes = informer.read(address, len)?;

        let word = |offset: usize| -> u64 {
            let slice = &bytes[offset..offset + p as usize];
            match informer.pointer_size() {
                PointerSize::Eight => u64::from_le_bytes(slice.try_into().unwrap()),
                PointerSize::Four => u32::from_le_bytes(slice.try_into().unwrap()) as u64,
            }
        };

        let prev_size = word(0);
        let raw_size = word(p as usize);
        let size = raw_size & !SIZE_BITS;
        let fd = word((2 * p) as usize);
        let bk = word((3 * p) as usize);
        let fd_nextsize = word((4 * p) as usize);
        let bk_nextsize = word((5 * p) as usize);
        let fd_field_address = address + 2 * p;
        let fd_demangled = demangle(fd, fd_field_address);

        Ok(Chunk {
            address,
            prev_size,
            size,
            raw_size,
            flags: ChunkFlags::from_raw_size(raw_size),
            fd,
            bk,
            fd_nextsize,
            bk_nextsize,
            fd_demangled,
        })
    }
}
