//! Translation table entry words.
//!
//! Page and segment descriptors share a single 32-bit layout family across
//! the 68851, the 68030 on-chip MMU, and the 68040. The frame number always
//! sits in the upper 20 bits; the low bits carry the descriptor type, the
//! protection, the hardware-maintained referenced and modified bits, and the
//! cache control field. Bit 8 is ignored by all three MMUs and is used here
//! to remember that a mapping is wired.

use bitflags::bitflags;
use kernel_memory_addresses::PhysicalAddress;

bitflags! {
    /// Access rights requested for a mapping.
    ///
    /// None of the supported MMUs can forbid instruction fetch from a
    /// readable page, so `EXECUTE` implies the same entry bits as `READ`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Protection: u8 {
        /// Loads are permitted.
        const READ = 0b001;
        /// Stores are permitted.
        const WRITE = 0b010;
        /// Instruction fetch is permitted.
        const EXECUTE = 0b100;
    }
}

impl Protection {
    /// No access. Mappings reduced to this are removed outright.
    pub const NONE: Self = Self::empty();
    /// Read, write, and execute.
    pub const ALL: Self = Self::READ.union(Self::WRITE).union(Self::EXECUTE);
}

/// A leaf page descriptor word.
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageEntry(u32);

impl PageEntry {
    /// Descriptor type: resident.
    pub const VALID: u32 = 0x0000_0001;
    /// Write protect. Set means read-only.
    pub const WRITE_PROTECT: u32 = 0x0000_0004;
    /// Set by the MMU when the page is read or written.
    pub const REFERENCED: u32 = 0x0000_0008;
    /// Set by the MMU when the page is written.
    pub const MODIFIED: u32 = 0x0000_0010;
    /// 68040 cache mode: copyback instead of write-through.
    pub const COPYBACK: u32 = 0x0000_0020;
    /// Cache inhibit, honored by all three MMUs.
    pub const CACHE_INHIBIT: u32 = 0x0000_0040;
    /// Software bit: the mapping must not be paged out.
    pub const WIRED: u32 = 0x0000_0100;
    /// Page frame number.
    pub const FRAME: u32 = 0xFFFF_F000;

    /// Both cache control bits.
    pub const CACHE_MASK: u32 = Self::COPYBACK | Self::CACHE_INHIBIT;
    /// The protection field.
    pub const PROT_MASK: u32 = Self::WRITE_PROTECT;
    /// Bits the attribute table accumulates.
    pub const ATTR_MASK: u32 = Self::REFERENCED | Self::MODIFIED;

    pub const INVALID: Self = Self(0);

    #[inline]
    #[must_use]
    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    #[inline]
    #[must_use]
    pub const fn bits(self) -> u32 {
        self.0
    }

    #[inline]
    #[must_use]
    pub const fn is_valid(self) -> bool {
        self.0 & Self::VALID != 0
    }

    #[inline]
    #[must_use]
    pub const fn frame(self) -> PhysicalAddress {
        PhysicalAddress::new(self.0 & Self::FRAME)
    }

    #[inline]
    #[must_use]
    pub const fn is_wired(self) -> bool {
        self.0 & Self::WIRED != 0
    }

    #[inline]
    #[must_use]
    pub const fn is_write_protected(self) -> bool {
        self.0 & Self::WRITE_PROTECT != 0
    }

    #[inline]
    #[must_use]
    pub const fn is_cache_inhibited(self) -> bool {
        self.0 & Self::CACHE_INHIBIT != 0
    }

    /// The protection field encoding for `prot`.
    #[inline]
    #[must_use]
    pub const fn prot_bits(prot: Protection) -> u32 {
        if prot.intersects(Protection::WRITE) {
            0
        } else {
            Self::WRITE_PROTECT
        }
    }
}

/// An upper-level (segment) descriptor word.
///
/// Two-level tables use one of these per 4 MiB segment. The 68040 uses the
/// same bit assignments for its level 1 and level 2 descriptors, with
/// shorter address fields because its tables are packed at sub-page
/// granularity.
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentEntry(u32);

impl SegmentEntry {
    /// Descriptor type: valid, pointing at a table.
    pub const VALID: u32 = 0x0000_0002;
    /// Set by the 68040 when the descriptor is used for a translation.
    pub const USED: u32 = 0x0000_0008;
    /// Two-level table address field: the page table page frame.
    pub const FRAME: u32 = 0xFFFF_F000;
    /// 68040 level 1 address field: a 512-byte aligned level 2 table.
    pub const LEVEL2_ADDR: u32 = 0xFFFF_FE00;
    /// 68040 level 2 address field: a 256-byte aligned level 3 table.
    pub const LEVEL3_ADDR: u32 = 0xFFFF_FF00;

    pub const INVALID: Self = Self(0);

    #[inline]
    #[must_use]
    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    #[inline]
    #[must_use]
    pub const fn bits(self) -> u32 {
        self.0
    }

    #[inline]
    #[must_use]
    pub const fn is_valid(self) -> bool {
        self.0 & Self::VALID != 0
    }

    /// Two-level descriptor for the page table page at `pt`.
    #[inline]
    #[must_use]
    pub const fn table(pt: PhysicalAddress) -> Self {
        Self((pt.as_u32() & Self::FRAME) | Self::VALID)
    }

    /// 68040 level 1 descriptor for the level 2 table at `l2`.
    #[inline]
    #[must_use]
    pub const fn level1(l2: PhysicalAddress) -> Self {
        Self((l2.as_u32() & Self::LEVEL2_ADDR) | Self::USED | Self::VALID)
    }

    /// 68040 level 2 descriptor for the level 3 table at `l3`.
    #[inline]
    #[must_use]
    pub const fn level2(l3: PhysicalAddress) -> Self {
        Self((l3.as_u32() & Self::LEVEL3_ADDR) | Self::USED | Self::VALID)
    }
}
