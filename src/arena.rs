//! L4: compose the per-layer parsers into one arena view, and iterate the
//! arena ring (§4.7).

use log::debug;

use crate::bins::{Bin, BinParser, FastBin, FastBinParser};
use crate::heap::{Heap, HeapParser};
use crate::informer::ProcessInformer;
use crate::malloc_state::{MallocState, MallocStateParser};
use crate::tcache::TcacheParser;
use crate::{Address, HeapError};

/// One arena's fully assembled view, per §3 "Arena (composed)".
#[derive(Debug, Clone)]
pub struct Arena {
    pub malloc_state: MallocState,
    pub heap: Heap,
    /// `None` when tcache is unsupported on this build or its struct
    /// couldn't be located — never a fatal condition for arena assembly.
    pub tcache: Option<Vec<FastBin>>,
    pub fastbins: Vec<FastBin>,
    pub unsorted: Bin,
    pub small_bins: Vec<Bin>,
    pub large_bins: Vec<Bin>,
}

impl Arena {
    pub fn address(&self) -> Address {
        self.malloc_state.address
    }
}

pub struct ArenaAssembler;

impl ArenaAssembler {
    /// Assembles one arena from an already-parsed `malloc_state`, calling
    /// the L2/L3 parsers in the fixed order §4.7 specifies: heap, tcache,
    /// fastbins, unsorted, small, large.
    pub fn assemble(
        informer: &dyn ProcessInformer,
        malloc_state: MallocState,
    ) -> Result<Arena, HeapError> {
        let heap = HeapParser::parse_from_malloc_state(informer, &malloc_state)?;

        let tcache = match TcacheParser::parse_all_from_heap(
            informer,
            &heap,
            &malloc_state.layout,
            malloc_state.pointer_size,
        ) {
            Ok(bins) => Some(bins),
            Err(err) => {
                debug!("no tcache for arena at {:#x}: {err}", malloc_state.address);
                None
            }
        };

        let fastbins = FastBinParser::parse_all_from_malloc_state(informer, &malloc_state);
        let unsorted = BinParser::parse_unsorted_bin(informer, &malloc_state);
        let small_bins = BinParser::parse_small_bins(informer, &malloc_state);
        let large_bins = BinParser::parse_large_bins(informer, &malloc_state);

        Ok(Arena { malloc_state, heap, tcache, fastbins, unsorted, small_bins, large_bins })
    }

    /// Walks the arena ring from `main_address` (§4.2) and assembles every
    /// reachable arena. An arena whose `malloc_state` fails to parse is
    /// dropped from the ring and the walk stops there, matching
    /// `MallocStateParser::parse_all_from_main`; an arena whose heap/tcache
    /// assembly fails is likewise dropped rather than returned half-built.
    pub fn parse_all_from_main(informer: &dyn ProcessInformer, main_address: Address) -> Vec<Arena> {
        MallocStateParser::parse_all_from_main(informer, main_address)
            .into_iter()
            .filter_map(|state| {
                let address = state.address;
                match Self::assemble(informer, state) {
                    Ok(arena) => Some(arena),
                    Err(err) => {
                        debug!("arena at {address:#x} failed to assemble: {err}");
                        None
                    }
                }
            })
            .collect()
    }
}
