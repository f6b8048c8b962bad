//! Version-gated layout selection (§6.3). One [`LayoutDescriptor`] per
//! version band, selected once and carried as plain data rather than as
//! runtime polymorphism on `MallocState`.

use std::cmp::Ordering;

/// A glibc version triple. Only `(major, minor)` participate in ordering —
/// matching the original `is_libc_version_lower_than((M, m))` convenience,
/// which never looks at the patch level.
#[derive(Debug, Clone, Copy, Eq)]
pub struct GlibcVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: Option<u32>,
}

impl GlibcVersion {
    pub fn new(major: u32, minor: u32) -> Self {
        Self { major, minor, patch: None }
    }

    pub fn with_patch(major: u32, minor: u32, patch: u32) -> Self {
        Self { major, minor, patch: Some(patch) }
    }

    /// `is_libc_version_lower_than` from §6.1, expressed as ordinary
    /// comparison over `(major, minor)`.
    pub fn is_lower_than(&self, major: u32, minor: u32) -> bool {
        (self.major, self.minor) < (major, minor)
    }

    pub fn is_at_least(&self, major: u32, minor: u32) -> bool {
        !self.is_lower_than(major, minor)
    }
}

impl PartialEq for GlibcVersion {
    fn eq(&self, other: &Self) -> bool {
        (self.major, self.minor) == (other.major, other.minor)
    }
}

impl PartialOrd for GlibcVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for GlibcVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.major, self.minor).cmp(&(other.major, other.minor))
    }
}

impl std::fmt::Display for GlibcVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.patch {
            Some(patch) => write!(f, "{}.{}.{}", self.major, self.minor, patch),
            None => write!(f, "{}.{}", self.major, self.minor),
        }
    }
}

/// Field-set / feature gates for one version band, per the §6.3 matrix.
/// Constructed once per parser and passed down instead of branching on
/// version at every field access.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LayoutDescriptor {
    /// `malloc_state.have_fastchunks` present (glibc >= 2.27).
    pub has_fastchunks: bool,
    /// `malloc_state.attached_threads` present (glibc >= 2.23).
    pub has_attached_threads: bool,
    /// Free-list successors are safe-linked (glibc >= 2.32).
    pub has_safe_link: bool,
    /// A per-thread tcache exists (glibc >= 2.26).
    pub has_tcache: bool,
    /// `tcache_perthread_struct.counts[]` are 16-bit rather than 8-bit
    /// (glibc >= 2.30, the CVE-2017-17426-adjacent widening). Not part of
    /// the §6.3 matrix itself; resolved as an ambient addition, see
    /// DESIGN.md.
    pub has_wide_tcache_counts: bool,
}

impl LayoutDescriptor {
    pub const fn new(
        has_fastchunks: bool,
        has_attached_threads: bool,
        has_safe_link: bool,
        has_tcache: bool,
        has_wide_tcache_counts: bool,
    ) -> Self {
        Self {
            has_fastchunks,
            has_attached_threads,
            has_safe_link,
            has_tcache,
            has_wide_tcache_counts,
        }
    }

    /// Selects the layout band for `version`, per the §6.3 matrix.
    pub fn for_version(version: &GlibcVersion) -> Self {
        let has_attached_threads = version.is_at_least(2, 23);
        let has_tcache = version.is_at_least(2, 26);
        let has_fastchunks = version.is_at_least(2, 27);
        let has_safe_link = version.is_at_least(2, 32);
        let has_wide_tcache_counts = version.is_at_least(2, 30);

        Self {
            has_fastchunks,
            has_attached_threads,
            has_safe_link,
            has_tcache,
            has_wide_tcache_counts,
        }
    }
}
