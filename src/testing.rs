//! A `cfg(test)`-only [`ProcessInformer`] backed by a sparse in-memory image
//! (§8). Generalizes `crates/cogitator`'s original single-file-on-disk
//! fixture into "an address-indexed byte map any parser can be pointed at",
//! so every module's tests can synthesize exactly the memory layout a
//! scenario in §8 of the spec calls for without touching a real process.

use std::collections::BTreeMap;

use crate::informer::ProcessInformer;
use crate::version::GlibcVersion;
use crate::{Address, HeapError, PointerSize};

#[derive(Debug, Clone)]
pub struct FixtureInformer {
    mem: BTreeMap<Address, u8>,
    pointer_size: PointerSize,
    version: GlibcVersion,
    main_arena_address: Address,
    main_heap_base: Option<Address>,
}

impl FixtureInformer {
    fn new(pointer_size: PointerSize) -> Self {
        Self {
            mem: BTreeMap::new(),
            pointer_size,
            version: GlibcVersion::new(2, 31),
            main_arena_address: 0x7fff_0000_0000,
            main_heap_base: None,
        }
    }

    pub fn new_64() -> Self {
        Self::new(PointerSize::Eight)
    }

    pub fn new_32() -> Self {
        Self::new(PointerSize::Four)
    }

    pub fn with_version(mut self, major: u32, minor: u32) -> Self {
        self.version = GlibcVersion::new(major, minor);
        self
    }

    pub fn with_main_arena(mut self, address: Address) -> Self {
        self.main_arena_address = address;
        self
    }

    pub fn with_main_heap_base(mut self, address: Address) -> Self {
        self.main_heap_base = Some(address);
        self
    }

    pub fn write_bytes(&mut self, address: Address, bytes: &[u8]) -> &mut Self {
        for (i, b) in bytes.iter().enumerate() {
            self.mem.insert(address + i as u64, *b);
        }
        self
    }

    /// Zero-fills `len` bytes starting at `address`. Parsers that read a
    /// whole control block in one range read (`MallocStateParser::parse`)
    /// need every byte in that range mapped, even where a test only cares
    /// about a handful of fields — call this first, then overwrite the
    /// fields that matter.
    pub fn zero_region(&mut self, address: Address, len: u64) -> &mut Self {
        for i in 0..len {
            self.mem.entry(address + i).or_insert(0);
        }
        self
    }

    pub fn write_word(&mut self, address: Address, value: u64) -> &mut Self {
        let bytes = match self.pointer_size {
            PointerSize::Eight => value.to_le_bytes().to_vec(),
            PointerSize::Four => (value as u32).to_le_bytes().to_vec(),
        };
        self.write_bytes(address, &bytes)
    }

    pub fn write_u32(&mut self, address: Address, value: u32) -> &mut Self {
        self.write_bytes(address, &value.to_le_bytes())
    }

    pub fn write_u16(&mut self, address: Address, value: u16) -> &mut Self {
        self.write_bytes(address, &value.to_le_bytes())
    }

    pub fn write_u8(&mut self, address: Address, value: u8) -> &mut Self {
        self.write_bytes(address, &[value])
    }

    /// Writes a full six-word chunk header: `prev_size, raw_size, fd, bk,
    /// fd_nextsize=0, bk_nextsize=0`.
    pub fn write_chunk(
        &mut self,
        address: Address,
        prev_size: u64,
        raw_size: u64,
        fd: u64,
        bk: u64,
    ) -> &mut Self {
        let p = self.pointer_size.bytes() as u64;
        self.write_word(address, prev_size);
        self.write_word(address + p, raw_size);
        self.write_word(address + 2 * p, fd);
        self.write_word(address + 3 * p, bk);
        self.write_word(address + 4 * p, 0);
        self.write_word(address + 5 * p, 0);
        self
    }

    pub fn build(&self) -> Self {
        self.clone()
    }
}

impl ProcessInformer for FixtureInformer {
    fn read(&self, address: Address, len: usize) -> Result<Vec<u8>, HeapError> {
        let mut out = Vec::with_capacity(len);
        for i in 0..len as u64 {
            match self.mem.get(&(address + i)) {
                Some(b) => out.push(*b),
                None => return Err(HeapError::ReadFailure { address, len }),
            }
        }
        Ok(out)
    }

    fn pointer_size(&self) -> PointerSize {
        self.pointer_size
    }

    fn libc_version(&self) -> GlibcVersion {
        self.version
    }

    fn main_arena_address(&self) -> Address {
        self.main_arena_address
    }

    fn main_heap_base(&self) -> Option<Address> {
        self.main_heap_base
    }
}
