//! Hardware seams.
//!
//! The mapping layer reads and writes translation tables through
//! [`PhysMapper`] and drives the TLB and caches through [`MmuHardware`].
//! Kernel ports implement both against the real machine; the hosted test
//! suite substitutes a block of ordinary memory and a recording stub.

use kernel_memory_addresses::{PhysicalAddress, VirtualAddress};

/// Maps physical addresses to usable pointers.
///
/// On the machine this is a fixed-offset window (the m68k MMUs walk their
/// tables by physical address, so the tables themselves never need virtual
/// mappings; only the CPU's stores into them do).
pub trait PhysMapper {
    /// Turn a physical address into a mutable reference.
    ///
    /// # Safety
    ///
    /// The caller must ensure that `phys` points to memory that is valid
    /// for `T`, suitably aligned, and not concurrently aliased by another
    /// live reference obtained from this mapper.
    unsafe fn phys_to_mut<'a, T>(&self, phys: PhysicalAddress) -> &'a mut T;
}

/// TLB, cache, and root pointer operations.
///
/// Implementations are thin wrappers over `pflush`, `cpush`, `cinv`, and the
/// root pointer moves of the respective MMU generation.
pub trait MmuHardware {
    /// Invalidate any cached translation for one page.
    fn invalidate_page(&self, va: VirtualAddress);

    /// Invalidate all cached translations.
    fn invalidate_all(&self);

    /// Push dirty data cache lines for a physical page to memory.
    /// Meaningful on the 68040 only; write-through machines make it a no-op.
    fn push_data_page(&self, pa: PhysicalAddress);

    /// Discard instruction cache lines for a physical page.
    fn purge_inst_page(&self, pa: PhysicalAddress);

    /// Point translation at the segment table frame at `pa`.
    fn load_root(&self, pa: PhysicalAddress);
}

/// One translation table frame: 1024 descriptor words.
#[repr(C, align(4096))]
pub struct TableFrame(pub [u32; 1024]);

impl TableFrame {
    /// Write every descriptor invalid.
    pub fn clear(&mut self) {
        self.0.fill(0);
    }

    /// Whether a run of descriptors is entirely invalid.
    #[must_use]
    pub fn run_empty(&self, start: usize, len: usize) -> bool {
        self.0[start..start + len].iter().all(|&w| w == 0)
    }
}

/// One page frame viewed as raw bytes.
#[repr(C, align(4096))]
pub struct ByteFrame(pub [u8; 4096]);

/// Pooled reverse-mapping records per page frame.
pub const PV_SLOTS_PER_FRAME: usize = 4096 / core::mem::size_of::<PvSlotRaw>();

/// A page frame holding pooled reverse-mapping records.
#[repr(C, align(4096))]
pub struct PvFrame {
    pub slots: [PvSlotRaw; PV_SLOTS_PER_FRAME],
}

/// On-frame layout of one pooled reverse-mapping record.
///
/// All fields are plain words so the frame can be handed back to the
/// physical page pool without destructors.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct PvSlotRaw {
    /// Next slot id in the chain, or the nil marker.
    pub next: u32,
    /// Owning address space id.
    pub pmap: u32,
    /// Virtual address of the mapping.
    pub va: u32,
    /// Address space whose segment table references this frame as a page
    /// table page, or the nil marker.
    pub table_pmap: u32,
    /// First segment table word realized for that page table page.
    pub table_slot: u32,
}
