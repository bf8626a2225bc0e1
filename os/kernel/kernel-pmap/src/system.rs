//! System assembly and address space lifecycle.
//!
//! [`PmapSystem::bootstrap`] builds the kernel segment table and the early
//! kernel mappings from a machine description, before any page is managed.
//! [`PmapSystem::init`] runs once the physical census is final; it sizes the
//! reverse-mapping and attribute tables and fills the kernel page table
//! page pool. Everything after that goes through the mapping operations in
//! the engine module.

use alloc::vec::Vec;
use kernel_memory_addresses::{PageSize, PhysicalAddress, Size4K, Size4M, VirtualAddress};
use thiserror::Error;

use crate::attr::PageAttributes;
use crate::entry::{PageEntry, Protection};
use crate::hw::{MmuHardware, PhysMapper, TableFrame};
use crate::kpt::{KptPage, KptPool};
use crate::mmu::{self, MmuVariant};
use crate::phys::{PhysRange, PhysicalMemory};
use crate::pmap::{Pmap, PmapId, PmapRef, PmapTable};
use crate::ptarea::PtArea;
use crate::pv::PvTable;

/// Why bootstrap rejected the machine description.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum BootstrapError {
    #[error("no physical memory ranges given")]
    NoRanges,
    #[error("{0} memory ranges exceed the supported bank count")]
    TooManyRanges(usize),
    #[error("physical range {0} is empty")]
    EmptyRange(usize),
    #[error("physical range {0} is not page aligned")]
    UnalignedRange(usize),
    #[error("physical range {0} overlaps its predecessor or is out of order")]
    RangeOrder(usize),
    #[error("virtual window is not segment aligned")]
    UnalignedWindow,
    #[error("virtual window cannot hold the fixed kernel structures")]
    WindowTooSmall,
    #[error("virtual window spans too many level 1 regions for the {0:?}")]
    WindowTooLarge(MmuVariant),
    #[error("out of physical memory during bootstrap")]
    OutOfMemory,
}

/// Machine description handed to [`PmapSystem::bootstrap`].
pub struct BootstrapLayout {
    /// Which MMU the CPU probe found.
    pub variant: MmuVariant,
    /// RAM banks, page aligned and in ascending order.
    pub ranges: Vec<PhysRange>,
    /// Start of the kernel virtual window, segment aligned.
    pub window_base: VirtualAddress,
    /// End of the kernel virtual window (exclusive), segment aligned.
    pub window_end: VirtualAddress,
    /// Segments at the bottom of the window to realize immediately for the
    /// kernel image and early allocations.
    pub bootstrap_segments: u32,
    /// Most user address spaces ever live at once. Sizes the space table
    /// and the page table window.
    pub max_address_spaces: usize,
}

/// The machine-dependent mapping layer.
///
/// Owns every table the MMU walks plus the bookkeeping around them. All
/// mapping operations on kernel and user spaces go through one of these;
/// there is exactly one per machine.
pub struct PmapSystem<M: PhysMapper, H: MmuHardware> {
    pub(crate) mapper: M,
    pub(crate) hw: H,
    pub(crate) variant: MmuVariant,
    pub(crate) phys: PhysicalMemory,
    pub(crate) pmaps: PmapTable,
    pub(crate) pv: PvTable,
    pub(crate) attrs: PageAttributes,
    pub(crate) kpt: KptPool,
    pub(crate) pt_area: PtArea,
    /// The all-invalid segment table frame shared by empty user spaces.
    pub(crate) seg_zero: PhysicalAddress,
    window_base: VirtualAddress,
    kpt_base: VirtualAddress,
    /// Scratch kernel pages for whole-page copies, source and destination.
    pub(crate) scratch_src: VirtualAddress,
    pub(crate) scratch_dst: VirtualAddress,
    /// First kernel address above all bootstrap mappings.
    virt_next: VirtualAddress,
    /// Space whose segment table the root pointer currently names, if any
    /// user space is on the CPU.
    pub(crate) active: Option<PmapId>,
    pub(crate) initialized: bool,
}

impl<M: PhysMapper, H: MmuHardware> PmapSystem<M, H> {
    /// Build the system from the machine description.
    ///
    /// Allocates and zeroes the kernel segment table and the shared empty
    /// segment table, carves the fixed structures out of the top of the
    /// virtual window, realizes page tables for the head and tail segments,
    /// and points translation at the result.
    ///
    /// # Errors
    ///
    /// Rejects a malformed range list, a window the MMU cannot cover or
    /// that cannot hold the fixed structures, and exhausted physical
    /// memory.
    pub fn bootstrap(layout: BootstrapLayout, mapper: M, hw: H) -> Result<Self, BootstrapError> {
        let BootstrapLayout {
            variant,
            ranges,
            window_base,
            window_end,
            bootstrap_segments,
            max_address_spaces,
        } = layout;

        if window_end <= window_base {
            return Err(BootstrapError::WindowTooSmall);
        }
        if !window_base.is_aligned::<Size4M>() || !window_end.is_aligned::<Size4M>() {
            return Err(BootstrapError::UnalignedWindow);
        }
        if !variant.window_fits(window_base, window_end) {
            return Err(BootstrapError::WindowTooLarge(variant));
        }
        let mut phys = PhysicalMemory::new(ranges)?;

        // Carve from the top of the window down: two scratch pages, the
        // kernel page table page pool, then the user page table window
        // below the next segment boundary.
        let page = Size4K::SIZE;
        let kpt_pages = Self::kpt_pool_target(max_address_spaces);
        let fixed_bytes = (kpt_pages + 2) * page;
        let kpt_base = VirtualAddress::new(
            window_end
                .as_u32()
                .checked_sub(fixed_bytes)
                .ok_or(BootstrapError::WindowTooSmall)?,
        );
        let scratch_dst = window_end - page;
        let scratch_src = scratch_dst - page;
        let fixed_base = kpt_base.align_down::<Size4M>();
        let pt_bytes = u32::try_from(max_address_spaces)
            .ok()
            .and_then(|n| n.checked_mul(PtArea::SPAN_BYTES))
            .ok_or(BootstrapError::WindowTooSmall)?;
        let pt_base = VirtualAddress::new(
            fixed_base
                .as_u32()
                .checked_sub(pt_bytes)
                .ok_or(BootstrapError::WindowTooSmall)?,
        );
        let head_end = VirtualAddress::new(
            bootstrap_segments
                .checked_mul(mmu::SEG_SIZE)
                .and_then(|b| window_base.as_u32().checked_add(b))
                .ok_or(BootstrapError::WindowTooSmall)?,
        );
        if pt_base < window_base || head_end > pt_base {
            return Err(BootstrapError::WindowTooSmall);
        }

        let kernel_stab = phys.next_page().ok_or(BootstrapError::OutOfMemory)?;
        let seg_zero = phys.next_page().ok_or(BootstrapError::OutOfMemory)?;
        for pa in [kernel_stab, seg_zero] {
            let frame: &mut TableFrame = unsafe { mapper.phys_to_mut(pa) };
            frame.clear();
        }
        let kernel_stfree = if variant.three_level() {
            mmu::PROTO_STFREE
        } else {
            0
        };

        let mut system = Self {
            mapper,
            hw,
            variant,
            phys,
            pmaps: PmapTable::new(Pmap::kernel(kernel_stab, kernel_stfree), max_address_spaces),
            pv: PvTable::empty(),
            attrs: PageAttributes::empty(),
            kpt: KptPool::empty(),
            pt_area: PtArea::new(pt_base, fixed_base),
            seg_zero,
            window_base,
            kpt_base,
            scratch_src,
            scratch_dst,
            virt_next: window_base,
            active: None,
            initialized: false,
        };

        let mut seg = window_base;
        while seg < head_end {
            system.realize_kernel_segment(seg)?;
            seg += mmu::SEG_SIZE;
        }
        let mut seg = fixed_base;
        while seg < window_end {
            system.realize_kernel_segment(seg)?;
            seg += mmu::SEG_SIZE;
        }

        system.hw.load_root(kernel_stab);
        system.hw.invalidate_all();
        log::info!(
            "pmap bootstrap: {variant:?}, {} pages, window {window_base}..{window_end}",
            system.phys.total_pages(),
        );
        Ok(system)
    }

    /// Finish initialization once the physical census is final.
    ///
    /// Sizes the reverse-mapping headers and the attribute table and fills
    /// the kernel page table page pool. The pool pages are wired kernel
    /// mappings like any other, so they are entered through the front door
    /// and get their own reverse-mapping records.
    ///
    /// # Panics
    ///
    /// Panics when called twice or when physical memory cannot cover the
    /// pool.
    pub fn init(&mut self) {
        assert!(!self.initialized, "pmap initialized twice");
        let pages = self.phys.total_pages();
        self.pv.grow_headers(pages);
        self.attrs = PageAttributes::with_pages(pages);
        self.initialized = true;

        let count = (self.scratch_src - self.kpt_base) >> Size4K::SHIFT;
        let mut pool = Vec::with_capacity(count as usize);
        for i in 0..count {
            let Some(pa) = self.phys.next_page() else {
                panic!("out of memory for the kernel page table pool");
            };
            self.zero_frame(pa);
            pool.push(KptPage {
                va: self.kpt_base + (i << Size4K::SHIFT),
                pa,
            });
        }
        for p in &pool {
            self.enter(
                &PmapRef::kernel(),
                p.va,
                p.pa,
                Protection::READ | Protection::WRITE,
                true,
            );
        }
        for p in pool {
            self.kpt.push(p);
        }
        log::info!(
            "pmap init: {pages} managed pages, {count} pooled kernel page table pages"
        );
    }

    /// Grab physically contiguous page frames before initialization.
    ///
    /// The early kernel uses this for fixed structures sized by the census,
    /// such as the message buffer. The frames come back zeroed.
    ///
    /// # Panics
    ///
    /// Panics after [`Self::init`] and when no bank can satisfy the run.
    pub fn bootstrap_alloc(&mut self, pages: u32) -> PhysicalAddress {
        assert!(
            !self.initialized,
            "bootstrap allocation after initialization"
        );
        let Some(pa) = self.phys.take_contiguous(pages) else {
            panic!("out of memory in bootstrap allocation");
        };
        for i in 0..pages {
            self.zero_frame(pa + (i << Size4K::SHIFT));
        }
        pa
    }

    /// Map `[va, va + len)` to `[pa, pa + len)` in the kernel space before
    /// initialization, realizing segments as needed.
    ///
    /// Bootstrap mappings are permanent. They never reach the
    /// reverse-mapping table, so protection sweeps over physical pages do
    /// not see them.
    ///
    /// # Errors
    ///
    /// Fails when a segment needs a page table page and memory is gone.
    ///
    /// # Panics
    ///
    /// Panics after [`Self::init`]; late mappings go through
    /// [`Self::enter`].
    pub fn map_range(
        &mut self,
        va: VirtualAddress,
        pa: PhysicalAddress,
        len: u32,
        prot: Protection,
        cache_inhibit: bool,
    ) -> Result<(), BootstrapError> {
        assert!(!self.initialized, "late mappings go through enter");
        debug_assert!(va.is_aligned::<Size4K>() && pa.is_aligned::<Size4K>());
        debug_assert!(len % Size4K::SIZE == 0);
        debug_assert!(va >= self.window_base);

        let mut off = 0;
        while off < len {
            let curr = va + off;
            self.realize_kernel_segment(curr.align_down::<Size4M>())?;
            let Some((frame, index)) = self.pte_slot(PmapId::KERNEL, curr) else {
                unreachable!("segment was just realized")
            };
            let mut bits = (pa + off).as_u32() | PageEntry::prot_bits(prot) | PageEntry::VALID;
            if cache_inhibit {
                bits |= PageEntry::CACHE_INHIBIT;
            } else if self.variant.has_copyback() {
                bits |= PageEntry::COPYBACK;
            }
            self.set_table_word(frame, index, bits);
            off += Size4K::SIZE;
        }
        if va + len > self.virt_next {
            self.virt_next = va + len;
        }
        Ok(())
    }

    /// Give a kernel segment a raw page table page during bootstrap.
    fn realize_kernel_segment(&mut self, seg: VirtualAddress) -> Result<(), BootstrapError> {
        if self.segment_present(PmapId::KERNEL, seg) {
            return Ok(());
        }
        let frame = self.phys.next_page().ok_or(BootstrapError::OutOfMemory)?;
        self.zero_frame(frame);
        self.point_segment(PmapId::KERNEL, seg, frame);
        Ok(())
    }

    /// Pool size: one segment per expected space plus kernel growth room,
    /// capped at the traditional sixty-four pages.
    #[allow(clippy::cast_possible_truncation)]
    fn kpt_pool_target(max_address_spaces: usize) -> u32 {
        max_address_spaces.saturating_add(16).min(64) as u32
    }

    /// Kernel virtual range still open for allocation: from the highest
    /// bootstrap mapping up to the bottom of the fixed structures.
    #[must_use]
    pub fn virtual_space(&self) -> (VirtualAddress, VirtualAddress) {
        (self.virt_next, self.pt_area.base())
    }

    /// Create an empty user address space.
    ///
    /// `size` is a hint from callers that manage software maps of a given
    /// byte length themselves; anything nonzero is refused so such callers
    /// fall back to their own bookkeeping. Returns `None` when the space
    /// table is full.
    pub fn create(&mut self, size: u32) -> Option<PmapRef> {
        if size != 0 {
            return None;
        }
        let id = self.pmaps.insert(Pmap::user(self.seg_zero))?;
        log::trace!("create: space {}", id.0);
        Some(PmapRef { id })
    }

    /// Add a reference to a space and hand out another handle.
    #[must_use]
    pub fn retain(&mut self, r: &PmapRef) -> PmapRef {
        if let Some(pm) = self.pmaps.get_mut(r.id) {
            pm.count += 1;
        } else {
            debug_assert!(false, "retain of a dead space");
        }
        PmapRef { id: r.id }
    }

    /// Give back a handle. The last handle destroys the space.
    ///
    /// # Panics
    ///
    /// The kernel space cannot be released, and destroying a space that
    /// still holds mappings is a caller bug: mappings pin page table pages
    /// and reverse-mapping records that would leak.
    pub fn release(&mut self, r: PmapRef) {
        assert!(!r.is_kernel(), "kernel space cannot be released");
        let PmapRef { id } = r;
        let Some(pm) = self.pmaps.get_mut(id) else {
            debug_assert!(false, "release of a dead space");
            return;
        };
        pm.count -= 1;
        if pm.count > 0 {
            return;
        }
        assert!(
            pm.resident == 0,
            "released space still holds {} mappings",
            pm.resident
        );
        debug_assert_eq!(pm.ptpages, 0, "page table pages survived teardown");
        debug_assert_eq!(pm.sref, 0, "realized segments survived teardown");
        debug_assert_eq!(pm.stab, self.seg_zero, "segment table survived teardown");
        let span = pm.span;
        if let Some(span) = span {
            debug_assert!(
                self.pt_area.pages_in_span(span).is_empty(),
                "page table pages survived teardown"
            );
            self.pt_area.free_span(span);
        }
        if self.active == Some(id) {
            self.active = None;
        }
        self.pmaps.remove(id);
        log::trace!("release: space {} destroyed", id.0);
    }

    /// Make `r` the space the CPU translates through.
    ///
    /// Loads the root pointer at its segment table and flushes stale
    /// translations, unless the space already runs on the CPU and its
    /// segment table has not moved. Activating the kernel handle switches
    /// to the kernel-only context.
    pub fn activate(&mut self, r: &PmapRef) {
        let Some(pm) = self.pmaps.get_mut(r.id) else {
            debug_assert!(false, "activate of a dead space");
            return;
        };
        let reload = pm.stchanged || self.active != Some(r.id);
        pm.stchanged = false;
        let stab = pm.stab;
        self.active = Some(r.id);
        if reload {
            self.hw.load_root(stab);
            self.hw.invalidate_all();
        }
    }

    /// Note that `r` no longer runs on the CPU.
    pub fn deactivate(&mut self, r: &PmapRef) {
        if self.active == Some(r.id) {
            self.active = None;
        }
    }

    /// Valid mappings in the space.
    #[must_use]
    pub fn resident_count(&self, r: &PmapRef) -> u32 {
        self.pmaps.get(r.id).map_or(0, |pm| pm.resident)
    }

    /// Wired mappings in the space.
    #[must_use]
    pub fn wired_count(&self, r: &PmapRef) -> u32 {
        self.pmaps.get(r.id).map_or(0, |pm| pm.wired)
    }

    /// Page frames still free in the source.
    #[must_use]
    pub fn free_pages(&self) -> u32 {
        self.phys.free_pages()
    }

    /// Managed page frames across all banks.
    #[must_use]
    pub const fn total_pages(&self) -> u32 {
        self.phys.total_pages()
    }

    /// Which MMU the system drives.
    #[must_use]
    pub const fn variant(&self) -> MmuVariant {
        self.variant
    }

    /// The physical access seam, for callers that fill mapped frames.
    #[must_use]
    pub const fn mapper(&self) -> &M {
        &self.mapper
    }

    /// The TLB and cache driver.
    #[must_use]
    pub const fn hardware(&self) -> &H {
        &self.hw
    }

    /// Whether translations of `id` can be live in the TLB. Kernel
    /// mappings are visible in every context.
    pub(crate) fn is_active(&self, id: PmapId) -> bool {
        id.is_kernel() || self.active == Some(id)
    }

    pub(crate) fn pm(&self, id: PmapId) -> &Pmap {
        let Some(pm) = self.pmaps.get(id) else {
            panic!("dead address space {}", id.0)
        };
        pm
    }

    pub(crate) fn pm_mut(&mut self, id: PmapId) -> &mut Pmap {
        let Some(pm) = self.pmaps.get_mut(id) else {
            panic!("dead address space {}", id.0)
        };
        pm
    }

    pub(crate) fn table_word(&self, frame: PhysicalAddress, index: usize) -> u32 {
        let t: &mut TableFrame = unsafe { self.mapper.phys_to_mut(frame) };
        t.0[index]
    }

    pub(crate) fn set_table_word(&self, frame: PhysicalAddress, index: usize, word: u32) {
        let t: &mut TableFrame = unsafe { self.mapper.phys_to_mut(frame) };
        t.0[index] = word;
    }

    pub(crate) fn zero_frame(&self, pa: PhysicalAddress) {
        let t: &mut TableFrame = unsafe { self.mapper.phys_to_mut(pa) };
        t.clear();
    }
}
