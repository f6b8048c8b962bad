//! The L0 capability this crate consumes (§6.1). Two implementations are
//! expected downstream — a live process (via a debug interface) and a core
//! file (via program headers and note sections) — neither of which is
//! specified here; this crate treats them identically through the trait.

use crate::version::GlibcVersion;
use crate::{Address, HeapError, PointerSize};

/// Read-only view over a target's address space plus the handful of facts
/// about it that layout selection depends on. Implementations may block on
/// I/O (`ptrace`, file reads); that blocking is opaque to every parser here.
pub trait ProcessInformer {
    /// Reads `len` bytes starting at `address`. Fails if the range cannot be
    /// fully satisfied.
    fn read(&self, address: Address, len: usize) -> Result<Vec<u8>, HeapError>;

    fn pointer_size(&self) -> PointerSize;

    fn libc_version(&self) -> GlibcVersion;

    /// Resolved by the informer via a libc symbol offset lookup.
    fn main_arena_address(&self) -> Address;

    /// The base address of the `[heap]` mapping, when the acquisition layer
    /// can supply it. The main arena has no `heap_info` header of its own
    /// (§4.3), so its heap region's start cannot be derived from anything
    /// this crate reads out of target memory — it has to come from whatever
    /// already enumerates memory mappings on the informer's side. `None`
    /// means the main arena's heap cannot be streamed (non-main arenas are
    /// unaffected).
    fn main_heap_base(&self) -> Option<Address>;

    /// Convenience wrapper over [`Self::libc_version`], matching the
    /// original's `is_libc_version_lower_than((M, m))`.
    fn is_libc_version_lower_than(&self, major: u32, minor: u32) -> bool {
        self.libc_version().is_lower_than(major, minor)
    }

    fn read_word(&self, address: Address) -> Result<u64, HeapError> {
        let bytes = self.read(address, self.pointer_size().bytes())?;
        Ok(match self.pointer_size() {
            PointerSize::Eight => u64::from_le_bytes(bytes.try_into().unwrap()),
            PointerSize::Four => {
                u32::from_le_bytes(bytes.try_into().unwrap()) as u64
            }
        })
    }

    fn read_u32(&self, address: Address) -> Result<u32, HeapError> {
        let bytes = self.read(address, 4)?;
        Ok(u32::from_le_bytes(bytes.try_into().unwrap()))
    }
}

/// Extension point used only by the bundled fixture informer for tests
/// (§8) — real implementations live entirely outside this crate.
pub(crate) fn version_or_unknown(version: &GlibcVersion) -> Result<(), HeapError> {
    let known_floor = GlibcVersion::new(2, 0);
    if *version < known_floor {
        return Err(HeapError::LayoutUnknown { major: version.major, minor: version.minor });
    }
    Ok(())
}
