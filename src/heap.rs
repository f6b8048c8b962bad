//! L2: stream one arena's chunk list across its `heap_info`-chained regions
//! (§4.3).

use log::{debug, warn};

use crate::chunk::{Chunk, ChunkParser};
use crate::informer::ProcessInformer;
use crate::malloc_state::MallocState;
use crate::{Address, HeapError, PointerSize};

/// Non-main-arena heap alignment (§6.4). Determines both the rounding used
/// to find the current `heap_info` from `malloc_state.top`, and the
/// maximum a single heap region can grow to before glibc starts a new one.
pub const HEAP_MAX_SIZE: u64 = 64 * 1024 * 1024;

fn align_up(value: u64, align: u64) -> u64 {
    (value + align - 1) & !(align - 1)
}

fn heap_for_ptr(ptr: Address) -> Address {
    ptr & !(HEAP_MAX_SIZE - 1)
}

/// One non-main-arena heap region header, per §3 "HeapInfo". The main
/// arena has no `heap_info` of its own — its single region is the
/// process image's `[heap]` mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeapInfo {
    pub address: Address,
    pub ar_ptr: Address,
    pub prev: Address,
    pub size: u64,
    pub mprotect_size: u64,
    pub pagesize: u64,
}

impl HeapInfo {
    /// Byte size of the header itself: `ar_ptr, prev, size, mprotect_size,
    /// pagesize`, each one pointer-sized word.
    pub fn header_size(pointer_size: PointerSize) -> u64 {
        5 * pointer_size.bytes() as u64
    }
}

/// A streamed heap region plus where its usable chunk stream actually
/// starts (past the embedded `heap_info`, and past the embedded
/// `malloc_state` for the arena's first region).
#[derive(Debug, Clone)]
pub struct HeapRegion {
    pub info: Option<HeapInfo>,
    pub base: Address,
    pub chunks_start: Address,
    /// Set when a chunk's size would exit the region, or was zero (§7
    /// `TruncatedRegion`); parsing of this region stopped at that chunk.
    pub truncated: bool,
}

/// One arena's chunk stream, concatenated across all its regions, per §3
/// "Arena.heap".
#[derive(Debug, Clone)]
pub struct Heap {
    pub regions: Vec<HeapRegion>,
    pub chunks: Vec<Chunk>,
    pub top: Option<Chunk>,
}

pub struct HeapParser;

impl HeapParser {
    pub fn parse_from_malloc_state(
        informer: &dyn ProcessInformer,
        malloc_state: &MallocState,
    ) -> Result<Heap, HeapError> {
        let is_main = malloc_state.address == informer.main_arena_address();
        let regions = if is_main {
            Self::main_arena_regions(informer)?
        } else {
            Self::non_main_arena_regions(informer, malloc_state)?
        };

        let mut chunks = Vec::new();
        let mut top = None;
        let mut streamed_regions = Vec::with_capacity(regions.len());

        for mut region in regions {
            let (region_chunks, region_top, truncated) =
                Self::stream_region(informer, &region, malloc_state.top)?;
            if truncated {
                warn!("{}", HeapError::TruncatedRegion { address: region.base });
            }
            region.truncated = truncated;
            chunks.extend(region_chunks);
            if let Some(t) = region_top {
                top = Some(t);
            }
            streamed_regions.push(region);
        }

        Ok(Heap { regions: streamed_regions, chunks, top })
    }

    fn main_arena_regions(informer: &dyn ProcessInformer) -> Result<Vec<HeapRegion>, HeapError> {
        match informer.main_heap_base() {
            Some(base) => Ok(vec![HeapRegion {
                info: None,
                base,
                chunks_start: base,
                truncated: false,
            }]),
            None => {
                debug!("main arena heap base unknown, yielding no regions");
                Ok(Vec::new())
            }
        }
    }

    fn non_main_arena_regions(
        informer: &dyn ProcessInformer,
        malloc_state: &MallocState,
    ) -> Result<Vec<HeapRegion>, HeapError> {
        let pointer_size = malloc_state.pointer_size;
        let header_size = HeapInfo::header_size(pointer_size);
        let mut headers = Vec::new();
        let mut current = heap_for_ptr(malloc_state.top);

        loop {
            let header = Self::read_heap_info(informer, current, pointer_size)?;
            let prev = header.prev;
            headers.push(header);
            if prev == 0 {
                break;
            }
            current = prev;
        }

        headers.sort_by_key(|h| h.address);

        // The arena's first (lowest-address) region embeds the
        // malloc_state right after the heap_info header.
        let first_region_base = headers.first().map(|h| h.address);

        let regions = headers
            .into_iter()
            .map(|info| {
                let mut start = info.address + header_size;
                if Some(info.address) == first_region_base {
                    start += Self::malloc_state_size(malloc_state);
                }
                let chunks_start = align_up(start, pointer_size.double());
                HeapRegion { info: Some(info), base: info.address, chunks_start, truncated: false }
            })
            .collect();

        Ok(regions)
    }

    fn malloc_state_size(malloc_state: &MallocState) -> u64 {
        // Mirrors the same field layout MallocStateParser reads; kept in
        // sync with it rather than duplicating offset math here.
        crate::malloc_state::control_block_size(&malloc_state.layout, malloc_state.pointer_size)
    }

    fn read_heap_info(
        informer: &dyn ProcessInformer,
        address: Address,
        pointer_size: PointerSize,
    ) -> Result<HeapInfo, HeapError> {
        let p = pointer_size.bytes() as u64;
        let bytes = informer.read(address, HeapInfo::header_size(pointer_size) as usize)?;
        let word = |offset: u64| -> u64 {
            let o = offset as usize;
            match pointer_size {
                PointerSize::Eight => u64::from_le_bytes(
                    bytes[o..o + 8].try_into().unwrap(),
                ),
                PointerSize::Four => {
                    u32::from_le_bytes(bytes[o..o + 4].try_into().unwrap()) as u64
                }
            }
        };

        Ok(HeapInfo {
            address,
            ar_ptr: word(0),
            prev: word(p),
            size: word(2 * p),
            mprotect_size: word(3 * p),
            pagesize: word(4 * p),
        })
    }

    /// Streams chunks from `region.chunks_start`, stopping at the top
    /// chunk (`top_address`) or at the region boundary, per §4.3 step 3.
    fn stream_region(
        informer: &dyn ProcessInformer,
        region: &HeapRegion,
        top_address: Address,
    ) -> Result<(Vec<Chunk>, Option<Chunk>, bool), HeapError> {
        let region_end = match region.info {
            Some(info) => region.base + info.size,
            // The main arena's single region has no declared size; the
            // only reliable stop condition is reaching the top chunk.
            None => u64::MAX,
        };

        let mut chunks = Vec::new();
        let mut top = None;
        let mut current = region.chunks_start;
        let mut truncated = false;

        loop {
            if current >= region_end {
                break;
            }
            if current == top_address {
                match ChunkParser::parse(informer, current) {
                    Ok(chunk) => top = Some(chunk),
                    Err(_) => truncated = true,
                }
                break;
            }

            let chunk = match ChunkParser::parse(informer, current) {
                Ok(chunk) => chunk,
                Err(_) => {
                    truncated = true;
                    break;
                }
            };

            let advance = chunk.actual_size();
            if advance == 0 || current + advance > region_end {
                truncated = true;
                break;
            }

            chunks.push(chunk);
            current += advance;
        }

        Ok((chunks, top, truncated))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FixtureInformer;
    use crate::version::{GlibcVersion, LayoutDescriptor};

    fn dummy_state(address: Address, top: Address) -> MallocState {
        MallocState {
            address,
            pointer_size: PointerSize::Eight,
            layout: LayoutDescriptor::for_version(&GlibcVersion::new(2, 31)),
            mutex: 0,
            flags: 0,
            have_fastchunks: None,
            fastbins: [0; crate::malloc_state::NFASTBINS],
            top,
            last_remainder: 0,
            bins: vec![
                crate::bins::BinEntry { address: 0, fd: 0, bk: 0, chunks_size: 0 };
                crate::bins::NBINS
            ],
            binmap: [0; 4],
            next: address,
            next_free: 0,
            attached_threads: None,
            system_mem: 0,
            max_system_mem: 0,
        }
    }

    #[test]
    fn main_arena_single_region_streams_to_top() {
        let mut fx = FixtureInformer::new_64()
            .with_version(2, 31)
            .with_main_arena(0x7fff_0000_0000)
            .with_main_heap_base(0x5555_5555_9000);

        fx.write_chunk(0x5555_5555_9000, 0, 0x31, 0, 0); // allocated, size 0x30
        let top = 0x5555_5555_9030;
        fx.write_chunk(top, 0, 0x1_f0a1, 0, 0);

        let state = dummy_state(0x7fff_0000_0000, top);
        let informer = fx.build();

        let heap = HeapParser::parse_from_malloc_state(&informer, &state).unwrap();
        assert_eq!(heap.chunks.len(), 1);
        assert_eq!(heap.chunks[0].address, 0x5555_5555_9000);
        assert!(heap.top.is_some());
        assert_eq!(heap.top.unwrap().address, top);
    }

    #[test]
    fn missing_main_heap_base_yields_no_regions() {
        let fx = FixtureInformer::new_64()
            .with_version(2, 31)
            .with_main_arena(0x7fff_0000_0000);
        let state = dummy_state(0x7fff_0000_0000, 0);
        let informer = fx.build();

        let heap = HeapParser::parse_from_malloc_state(&informer, &state).unwrap();
        assert!(heap.regions.is_empty());
        assert!(heap.chunks.is_empty());
    }

    #[test]
    fn zero_size_chunk_truncates_region() {
        let _ = env_logger::try_init();
        let mut fx = FixtureInformer::new_64()
            .with_version(2, 31)
            .with_main_arena(0x7fff_0000_0000)
            .with_main_heap_base(0x5555_5555_9000);
        fx.write_chunk(0x5555_5555_9000, 0, 0, 0, 0); // size == 0
        let state = dummy_state(0x7fff_0000_0000, 0x5555_5555_a000);
        let informer = fx.build();

        let heap = HeapParser::parse_from_malloc_state(&informer, &state).unwrap();
        assert!(heap.chunks.is_empty());
        assert!(heap.top.is_none());
        assert!(heap.regions[0].truncated);
    }
}
