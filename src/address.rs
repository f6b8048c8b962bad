/// A machine-pointer-sized value read out of (or computed over) target
/// memory. Always stored widened to `u64` regardless of the target's actual
/// pointer width, since the pointer width itself is tracked separately via
/// [`PointerSize`].
pub type Address = u64;

/// The target process' pointer width, fixed for the lifetime of one
/// introspection session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PointerSize {
    Four,
    Eight,
}

impl PointerSize {
    pub fn bytes(self) -> usize {
        match self {
            PointerSize::Four => 4,
            PointerSize::Eight => 8,
        }
    }

    /// `2P` — the machine word pair size that governs chunk size alignment
    /// and the bin-head sentinel offset.
    pub fn double(self) -> u64 {
        2 * self.bytes() as u64
    }

    pub fn from_bytes(bytes: usize) -> Option<Self> {
        match bytes {
            4 => Some(PointerSize::Four),
            8 => Some(PointerSize::Eight),
            _ => None,
        }
    }
}
