//! MMU generations and translation geometry.
//!
//! All three supported MMUs translate 4 KiB pages and are driven here with
//! one page table page per 4 MiB of virtual space. The 68851 and 68030 point
//! a single segment descriptor at that page. The 68040 walks three levels,
//! so the same page table page is described to it as sixteen consecutive
//! 64-entry level 3 tables, and the level 1 and level 2 tables are packed
//! into the 4 KiB segment table frame in 512-byte chunks.

use kernel_memory_addresses::{PageSize, Size4K, Size4M, VirtualAddress};

/// Which MMU the kernel is driving.
///
/// Decided once during bootstrap from the CPU probe and never changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MmuVariant {
    /// External 68851 paired with a 68020.
    Mc68851,
    /// 68030 on-chip MMU. Same table format as the 68851.
    Mc68030,
    /// 68040 on-chip MMU. Three-level tables, copyback data cache.
    Mc68040,
}

impl MmuVariant {
    /// Whether the data cache supports the copyback mode bit.
    #[inline]
    #[must_use]
    pub const fn has_copyback(self) -> bool {
        matches!(self, Self::Mc68040)
    }

    /// Whether translation uses the packed three-level table format.
    #[inline]
    #[must_use]
    pub const fn three_level(self) -> bool {
        matches!(self, Self::Mc68040)
    }

    /// Whether a virtual window can be covered by one segment table frame.
    ///
    /// Two-level tables hold 1024 segment descriptors and span the whole
    /// 32-bit space. The 68040 frame holds the level 1 table plus seven
    /// level 2 chunks, and each chunk maps a distinct 32 MiB region, so a
    /// window may touch at most seven regions.
    #[must_use]
    pub fn window_fits(self, base: VirtualAddress, end: VirtualAddress) -> bool {
        if base >= end {
            return false;
        }
        if self.three_level() {
            let first = base.as_u32() >> LEVEL1_SHIFT;
            let last = (end.as_u32() - 1) >> LEVEL1_SHIFT;
            (last - first + 1) as usize <= STE_CHUNKS - 1
        } else {
            true
        }
    }
}

/// Virtual span of one page table page, and of one two-level descriptor.
pub const SEG_SIZE: u32 = Size4M::SIZE;
/// Shift from a virtual address to its segment number.
pub const SEG_SHIFT: u32 = Size4M::SHIFT;
/// Leaf entries in one page table page.
pub const PTES_PER_PAGE: usize = 1024;
/// Words in a table frame (segment table or page table page).
pub const WORDS_PER_FRAME: usize = 1024;

/// 68040 level 1 index shift (128 entries of 32 MiB each).
pub const LEVEL1_SHIFT: u32 = 25;
/// 68040 level 2 index shift (128 entries of 256 KiB each).
pub const LEVEL2_SHIFT: u32 = 18;
/// Entries in a 68040 level 1 or level 2 table.
pub const LEVEL12_SIZE: usize = 128;
/// Entries in a 68040 level 3 table.
pub const LEVEL3_SIZE: usize = 64;
/// 512-byte chunks in a segment table frame. Chunk 0 holds the level 1
/// table, the rest are handed out as level 2 tables.
pub const STE_CHUNKS: usize = 8;
/// Words in one 512-byte chunk.
pub const CHUNK_WORDS: usize = 128;
/// Level 2 descriptors consumed by one 4 MiB segment.
pub const L2_PER_SEGMENT: usize = 16;
/// Fresh chunk bitmap: every chunk free except chunk 0.
pub const PROTO_STFREE: u16 = 0x00FE;

/// Segment number of `va` (two-level descriptor index).
#[inline]
#[must_use]
pub const fn seg_index(va: VirtualAddress) -> usize {
    (va.as_u32() >> SEG_SHIFT) as usize
}

/// Leaf index of `va` within its page table page.
#[inline]
#[must_use]
pub const fn pte_index(va: VirtualAddress) -> usize {
    ((va.as_u32() >> Size4K::SHIFT) & 0x3FF) as usize
}

/// 68040 level 1 index of `va`.
#[inline]
#[must_use]
pub const fn level1_index(va: VirtualAddress) -> usize {
    ((va.as_u32() >> LEVEL1_SHIFT) & 0x7F) as usize
}

/// 68040 level 2 index of `va` within its level 2 table.
#[inline]
#[must_use]
pub const fn level2_index(va: VirtualAddress) -> usize {
    ((va.as_u32() >> LEVEL2_SHIFT) & 0x7F) as usize
}

/// 68040 level 3 index of `va` within its level 3 table.
#[inline]
#[must_use]
pub const fn level3_index(va: VirtualAddress) -> usize {
    ((va.as_u32() >> Size4K::SHIFT) & 0x3F) as usize
}

/// First free chunk in a segment table bitmap, if any.
#[inline]
#[must_use]
pub const fn first_free_chunk(stfree: u16) -> Option<usize> {
    if stfree == 0 {
        None
    } else {
        Some(stfree.trailing_zeros() as usize)
    }
}
