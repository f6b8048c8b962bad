//! L2: decode one arena control block, and enumerate the arena ring (§4.2).

use log::{debug, warn};

use crate::bins::{
    BinEntry, LARGE_BIN_END, LARGE_BIN_START, NBINS, SMALL_BIN_END, SMALL_BIN_START,
    UNSORTED_BIN_INDEX,
};
use crate::informer::ProcessInformer;
use crate::version::{GlibcVersion, LayoutDescriptor};
use crate::{Address, HeapError, PointerSize};

pub const NFASTBINS: usize = 10;
const BINMAP_WORDS: usize = 4;

fn align_up(value: u64, align: u64) -> u64 {
    (value + align - 1) & !(align - 1)
}

/// Byte offsets of every field in one version's `malloc_state`, computed
/// once from a [`LayoutDescriptor`] and a [`PointerSize`] rather than
/// re-derived on every parse.
#[derive(Debug, Clone, Copy)]
struct MallocStateLayout {
    fastbins_offset: u64,
    top_offset: u64,
    last_remainder_offset: u64,
    bins_offset: u64,
    binmap_offset: u64,
    next_offset: u64,
    next_free_offset: u64,
    attached_threads_offset: Option<u64>,
    system_mem_offset: u64,
    max_system_mem_offset: u64,
    total_size: u64,
}

impl MallocStateLayout {
    fn compute(layout: &LayoutDescriptor, p: PointerSize) -> Self {
        let pb = p.bytes() as u64;
        let int_fields = if layout.has_fastchunks { 3 } else { 2 };
        let ints_bytes = int_fields * 4;
        let fastbins_offset = align_up(ints_bytes, pb);
        let top_offset = fastbins_offset + NFASTBINS as u64 * pb;
        let last_remainder_offset = top_offset + pb;
        let bins_offset = last_remainder_offset + pb;
        let bins_words = (NBINS * 2 - 2) as u64;
        let binmap_offset = bins_offset + bins_words * pb;
        let binmap_bytes = BINMAP_WORDS as u64 * 4;
        let next_offset = binmap_offset + binmap_bytes;
        let next_free_offset = next_offset + pb;
        let (attached_threads_offset, after_attached) = if layout.has_attached_threads {
            let off = next_free_offset + pb;
            (Some(off), off + pb)
        } else {
            (None, next_free_offset + pb)
        };
        let system_mem_offset = after_attached;
        let max_system_mem_offset = system_mem_offset + pb;
        let total_size = max_system_mem_offset + pb;

        Self {
            fastbins_offset,
            top_offset,
            last_remainder_offset,
            bins_offset,
            binmap_offset,
            next_offset,
            next_free_offset,
            attached_threads_offset,
            system_mem_offset,
            max_system_mem_offset,
            total_size,
        }
    }
}

/// One arena's control block, per §3 "MallocState". Field presence depends
/// on the detected glibc version — see [`LayoutDescriptor`].
#[derive(Debug, Clone)]
pub struct MallocState {
    pub address: Address,
    pub pointer_size: PointerSize,
    pub layout: LayoutDescriptor,

    pub mutex: u32,
    pub flags: u32,
    pub have_fastchunks: Option<u32>,
    pub fastbins: [Address; NFASTBINS],
    pub top: Address,
    pub last_remainder: Address,
    /// Indexed 1..=126: `bins[1]` unsorted, `bins[2..=63]` small,
    /// `bins[64..=126]` large. Index 0 and 127 are unused, per §3.
    pub bins: Vec<BinEntry>,
    pub binmap: [u32; BINMAP_WORDS],
    pub next: Address,
    pub next_free: Address,
    pub attached_threads: Option<u64>,
    pub system_mem: u64,
    pub max_system_mem: u64,
}

impl MallocState {
    pub fn unsorted_bin(&self) -> &BinEntry {
        &self.bins[UNSORTED_BIN_INDEX]
    }

    pub fn small_bins(&self) -> &[BinEntry] {
        &self.bins[SMALL_BIN_START..SMALL_BIN_END]
    }

    pub fn large_bins(&self) -> &[BinEntry] {
        &self.bins[LARGE_BIN_START..LARGE_BIN_END]
    }
}

pub struct MallocStateParser;

impl MallocStateParser {
    pub fn parse(
        informer: &dyn ProcessInformer,
        address: Address,
    ) -> Result<MallocState, HeapError> {
        let version = informer.libc_version();
        check_version_known(&version)?;
        let layout = LayoutDescriptor::for_version(&version);
        let p = informer.pointer_size();
        let field_layout = MallocStateLayout::compute(&layout, p);

        let raw = informer.read(address, field_layout.total_size as usize)?;
        let pb = p.bytes();

        let read_u32_at = |offset: u64| -> u32 {
            let o = offset as usize;
            u32::from_le_bytes(raw[o..o + 4].try_into().unwrap())
        };
        let read_word_at = |offset: u64| -> u64 {
            let o = offset as usize;
            match p {
                PointerSize::Eight => u64::from_le_bytes(raw[o..o + 8].try_into().unwrap()),
                PointerSize::Four => u32::from_le_bytes(raw[o..o + 4].try_into().unwrap()) as u64,
            }
        };

        let mutex = read_u32_at(0);
        let flags = read_u32_at(4);
        let have_fastchunks = layout.has_fastchunks.then(|| read_u32_at(8));

        let mut fastbins = [0u64; NFASTBINS];
        for (i, slot) in fastbins.iter_mut().enumerate() {
            *slot = read_word_at(field_layout.fastbins_offset + i as u64 * pb as u64);
        }

        let top = read_word_at(field_layout.top_offset);
        let last_remainder = read_word_at(field_layout.last_remainder_offset);

        // Bin index 0 is unused; index i's (fd, bk) pair lives at
        // bins_offset + (i - 1) * 2P. BinEntry.address is the pair's own
        // address (not shifted) — the sentinel math in §4.5/§9 subtracts 2P
        // from *that* to get the virtual bin-head chunk, matching
        // `base_bin_address = bin_entry.address - pointer_size*2` in the
        // original implementation.
        let mut bins = Vec::with_capacity(NBINS - 1);
        bins.push(BinEntry { address, fd: 0, bk: 0, chunks_size: 0 }); // index 0, unused placeholder
        for i in 1..NBINS {
            let pair_address = address + field_layout.bins_offset + (i as u64 - 1) * p.double();
            let fd = read_word_at(field_layout.bins_offset + (i as u64 - 1) * p.double());
            let bk = read_word_at(
                field_layout.bins_offset + (i as u64 - 1) * p.double() + pb as u64,
            );
            let chunks_size = crate::bins::bin_chunks_size(i, p);
            bins.push(BinEntry { address: pair_address, fd, bk, chunks_size });
        }

        let mut binmap = [0u32; BINMAP_WORDS];
        for (i, slot) in binmap.iter_mut().enumerate() {
            *slot = read_u32_at(field_layout.binmap_offset + i as u64 * 4);
        }

        let next = read_word_at(field_layout.next_offset);
        let next_free = read_word_at(field_layout.next_free_offset);
        let attached_threads =
            field_layout.attached_threads_offset.map(|off| read_word_at(off));
        let system_mem = read_word_at(field_layout.system_mem_offset);
        let max_system_mem = read_word_at(field_layout.max_system_mem_offset);

        debug!("parsed malloc_state at {address:#x}, next={next:#x}");

        Ok(MallocState {
            address,
            pointer_size: p,
            layout,
            mutex,
            flags,
            have_fastchunks,
            fastbins,
            top,
            last_remainder,
            bins,
            binmap,
            next,
            next_free,
            attached_threads,
            system_mem,
            max_system_mem,
        })
    }

    /// Walks the `next` ring starting at `main_address`, emitting each
    /// `MallocState` exactly once. A `ReadFailure` while parsing one arena
    /// is fatal to that arena only — it's skipped and the ring walk
    /// continues from the address it had already read as `next`... except
    /// that address came from the failed read, so the walk simply stops
    /// there (§7: "fatal to that arena (skipped in ring enumeration)").
    pub fn parse_all_from_main(
        informer: &dyn ProcessInformer,
        main_address: Address,
    ) -> Vec<MallocState> {
        let mut seen = std::collections::HashSet::new();
        let mut out = Vec::new();
        let mut current = main_address;

        loop {
            if !seen.insert(current) {
                break;
            }
            match Self::parse(informer, current) {
                Ok(state) => {
                    let next = state.next;
                    out.push(state);
                    current = next;
                }
                Err(err) => {
                    warn!("arena at {current:#x} failed to parse: {err}");
                    break;
                }
            }
        }

        out
    }
}

pub(crate) fn check_version_known(version: &GlibcVersion) -> Result<(), HeapError> {
    crate::informer::version_or_unknown(version)
}

/// Total byte size of one arena's control block for `layout`/`pointer_size`,
/// used by [`crate::heap::HeapParser`] to find where an arena's first
/// region's chunk stream starts, past its embedded `malloc_state`.
pub fn control_block_size(layout: &LayoutDescriptor, pointer_size: PointerSize) -> u64 {
    MallocStateLayout::compute(layout, pointer_size).total_size
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FixtureInformer;

    fn layout_offsets() -> (MallocStateLayout, PointerSize) {
        let layout = LayoutDescriptor::for_version(&GlibcVersion::new(2, 31));
        let p = PointerSize::Eight;
        (MallocStateLayout::compute(&layout, p), p)
    }

    #[test]
    fn single_arena_ring_terminates_at_self() {
        let (fl, _p) = layout_offsets();
        let mut fx = FixtureInformer::new_64().with_version(2, 31);
        let base = 0x7fff_0000_0000u64;
        fx.zero_region(base, fl.total_size);
        fx.write_word(base + fl.next_offset, base); // next == self
        fx.write_word(base + fl.top_offset, 0x5555_0000_1000);
        fx.write_word(base + fl.system_mem_offset, 0x21000);
        let informer = fx.build();

        let states = MallocStateParser::parse_all_from_main(&informer, base);
        assert_eq!(states.len(), 1);
        assert_eq!(states[0].next, base);
        assert_eq!(states[0].top, 0x5555_0000_1000);
    }

    #[test]
    fn two_arena_ring_has_no_duplicates() {
        let (fl, _p) = layout_offsets();
        let mut fx = FixtureInformer::new_64().with_version(2, 31);
        let main = 0x7fff_0000_0000u64;
        let a1 = 0x7fff_1000_0000u64;
        fx.zero_region(main, fl.total_size);
        fx.zero_region(a1, fl.total_size);
        fx.write_word(main + fl.next_offset, a1);
        fx.write_word(a1 + fl.next_offset, main);
        let informer = fx.build();

        let states = MallocStateParser::parse_all_from_main(&informer, main);
        assert_eq!(states.len(), 2);
        let addrs: std::collections::HashSet<_> = states.iter().map(|s| s.address).collect();
        assert_eq!(addrs.len(), 2);
    }

    #[test]
    fn read_failure_on_one_arena_stops_ring_but_keeps_earlier() {
        let (fl, _p) = layout_offsets();
        let mut fx = FixtureInformer::new_64().with_version(2, 31);
        let main = 0x7fff_0000_0000u64;
        let missing = 0xDEAD_0000u64;
        fx.zero_region(main, fl.total_size);
        fx.write_word(main + fl.next_offset, missing); // never written, read fails
        let informer = fx.build();

        let states = MallocStateParser::parse_all_from_main(&informer, main);
        assert_eq!(states.len(), 1);
    }

    #[test]
    fn fastbin_layout_shifts_with_have_fastchunks() {
        let old = LayoutDescriptor::for_version(&GlibcVersion::new(2, 23));
        let new = LayoutDescriptor::for_version(&GlibcVersion::new(2, 27));
        let old_layout = MallocStateLayout::compute(&old, PointerSize::Eight);
        let new_layout = MallocStateLayout::compute(&new, PointerSize::Eight);
        assert!(new_layout.fastbins_offset >= old_layout.fastbins_offset);
    }

    #[test]
    fn bin_entry_address_is_pair_location_not_shifted() {
        let (fl, p) = layout_offsets();
        let mut fx = FixtureInformer::new_64().with_version(2, 31);
        let base = 0x7fff_0000_0000u64;
        fx.zero_region(base, fl.total_size);
        fx.write_word(base + fl.next_offset, base);
        let informer = fx.build();

        let state = MallocStateParser::parse(&informer, base).unwrap();
        let unsorted = state.unsorted_bin();
        assert_eq!(unsorted.address, base + fl.bins_offset);
        let _ = p;
    }
}
