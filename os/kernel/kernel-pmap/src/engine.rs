//! Mapping operations.
//!
//! The operational core of the layer: enter, remove, protect, wiring, the
//! physical page sweeps, and the table growth and reclamation behind them.
//! The table formats are fixed by the MMU generation (see [`crate::mmu`]);
//! everything here manipulates those tables through the two hardware seams
//! and keeps the reverse mappings, saved attributes, and statistics honest.
//!
//! Reverse-mapping chains are touched at raised interrupt priority, since
//! mapping calls can arrive from interrupt context on the machines this
//! targets.

use alloc::vec::Vec;
use bitflags::bitflags;
use kernel_memory_addresses::{PageSize, PhysicalAddress, Size4K, Size4M, VirtualAddress};
use kernel_sync::IplGuard;

use crate::entry::{PageEntry, Protection, SegmentEntry};
use crate::hw::{ByteFrame, MmuHardware, PhysMapper, TableFrame};
use crate::mmu;
use crate::pmap::{PmapId, PmapRef};
use crate::ptarea::PtArea;
use crate::pv::TableRef;
use crate::system::PmapSystem;

bitflags! {
    /// What a mapping teardown must flush and keep.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub(crate) struct RemoveFlags: u8 {
        /// Invalidate the cached translation.
        const TLB = 0b001;
        /// Push and purge cache lines for the frame.
        const CACHES = 0b010;
        /// Do not free the page table page even when its last entry goes.
        /// Used when the caller is about to refill the same slot.
        const KEEP_TABLE = 0b100;
    }
}

impl<M: PhysMapper, H: MmuHardware> PmapSystem<M, H> {
    /// Map `va` to the frame at `pa` with `prot` in space `r`.
    ///
    /// The workhorse. Grows page tables and segment tables as needed,
    /// replaces any previous mapping at `va`, keeps the reverse-mapping
    /// chain and statistics current, and does the minimum flush work the
    /// change requires. A wiring-only change writes the entry without
    /// touching the translation cache, since the hardware never reads the
    /// wired bit.
    ///
    /// # Panics
    ///
    /// Panics before [`Self::init`] and when table space or physical
    /// memory is exhausted.
    pub fn enter(
        &mut self,
        r: &PmapRef,
        va: VirtualAddress,
        pa: PhysicalAddress,
        prot: Protection,
        wired: bool,
    ) {
        assert!(self.initialized, "enter before init");
        let id = r.id;
        let va = va.align_down::<Size4K>();
        let pa = pa.align_down::<Size4K>();
        log::trace!("enter: space {} {va} -> {pa} {prot:?} wired={wired}", id.0);

        if !id.is_kernel() {
            self.ensure_span(id);
        }
        if self.pte_slot(id, va).is_none() {
            self.enter_table_page(id, va);
        }
        let Some((frame, index)) = self.pte_slot(id, va) else {
            panic!("page table vanished under enter");
        };
        let mut old_bits = self.table_word(frame, index);
        let old = PageEntry::from_bits(old_bits);
        let managed = self.phys.page_index(pa).is_some();
        let mut cache_inhibit = !managed;

        if old.is_valid() && old.frame() == pa {
            // Protection or wiring change. Page table pages are not wired
            // alongside; they stay resident while they hold any mapping.
            if old.is_wired() != wired {
                let pm = self.pm_mut(id);
                if wired {
                    pm.wired += 1;
                } else {
                    pm.wired -= 1;
                }
            }
            if old.is_cache_inhibited() {
                cache_inhibit = true;
            }
        } else {
            if old.is_valid() {
                // Frame changed. The teardown must not free the page table
                // page; its slot is refilled right below.
                self.remove_mapping(
                    id,
                    va,
                    RemoveFlags::TLB | RemoveFlags::CACHES | RemoveFlags::KEEP_TABLE,
                );
            }
            if !id.is_kernel() {
                let Some(span) = self.pm(id).span else {
                    unreachable!("span reserved above")
                };
                self.pt_area.add_ref(PtArea::page_va(span, mmu::seg_index(va)));
            }
            if managed {
                let Some(idx) = self.phys.page_index(pa) else {
                    unreachable!()
                };
                let _guard = IplGuard::vm();
                self.pv.insert(&self.mapper, &mut self.phys, idx, id, va);
            }
            let pm = self.pm_mut(id);
            pm.resident += 1;
            if wired {
                pm.wired += 1;
            }
            old_bits = self.table_word(frame, index);
        }

        let mut bits = pa.as_u32()
            | PageEntry::prot_bits(prot)
            | (old_bits & PageEntry::ATTR_MASK)
            | PageEntry::VALID;
        if wired {
            bits |= PageEntry::WIRED;
        }
        if cache_inhibit {
            bits |= PageEntry::CACHE_INHIBIT;
        }
        if self.variant.has_copyback()
            && bits & (PageEntry::PROT_MASK | PageEntry::CACHE_INHIBIT) == 0
        {
            bits |= PageEntry::COPYBACK;
        }
        let wiring_only = (old_bits ^ bits) == PageEntry::WIRED;
        if self.variant.has_copyback() && !wiring_only {
            self.hw.push_data_page(pa);
            self.hw.purge_inst_page(pa);
        }
        self.set_table_word(frame, index, bits);
        if !wiring_only && self.is_active(id) {
            self.hw.invalidate_page(va);
        }
    }

    /// Unmap `[start, end)` in space `r`.
    ///
    /// Segments with no page table are skipped in one stride. Page table
    /// pages and segment tables are reclaimed as their last entries go.
    ///
    /// # Panics
    ///
    /// Panics before [`Self::init`].
    pub fn remove(&mut self, r: &PmapRef, start: VirtualAddress, end: VirtualAddress) {
        assert!(self.initialized, "remove before init");
        let id = r.id;
        log::trace!("remove: space {} {start}..{end}", id.0);
        let mut va = start.align_down::<Size4K>();
        while va < end {
            let seg_end = match va.align_down::<Size4M>().as_u32().checked_add(mmu::SEG_SIZE) {
                Some(n) if VirtualAddress::new(n) < end => VirtualAddress::new(n),
                _ => end,
            };
            if self.pte_slot(id, va).is_none() {
                va = seg_end;
                continue;
            }
            while va < seg_end {
                // The walk is repeated per page: removing the last entry of
                // a page table page tears the whole segment down under us.
                let Some((frame, index)) = self.pte_slot(id, va) else {
                    break;
                };
                if PageEntry::from_bits(self.table_word(frame, index)).is_valid() {
                    self.remove_mapping(id, va, RemoveFlags::TLB | RemoveFlags::CACHES);
                }
                va += Size4K::SIZE;
            }
        }
    }

    /// Restrict the protection on `[start, end)` in space `r`.
    ///
    /// Widening requests are ignored; no access at all removes the range
    /// outright.
    ///
    /// # Panics
    ///
    /// Panics before [`Self::init`].
    pub fn protect(
        &mut self,
        r: &PmapRef,
        start: VirtualAddress,
        end: VirtualAddress,
        prot: Protection,
    ) {
        assert!(self.initialized, "protect before init");
        if prot == Protection::NONE {
            self.remove(r, start, end);
            return;
        }
        if prot.contains(Protection::WRITE) {
            return;
        }
        let id = r.id;
        let mut va = start.align_down::<Size4K>();
        while va < end {
            let seg_end = match va.align_down::<Size4M>().as_u32().checked_add(mmu::SEG_SIZE) {
                Some(n) if VirtualAddress::new(n) < end => VirtualAddress::new(n),
                _ => end,
            };
            let Some((frame, base)) = self.pte_slot(id, va) else {
                va = seg_end;
                continue;
            };
            let mut index = base;
            while va < seg_end {
                let old_bits = self.table_word(frame, index);
                let entry = PageEntry::from_bits(old_bits);
                if entry.is_valid() && !entry.is_write_protected() {
                    if self.variant.has_copyback() {
                        self.hw.push_data_page(entry.frame());
                        self.hw.purge_inst_page(entry.frame());
                    }
                    self.set_table_word(
                        frame,
                        index,
                        (old_bits & !PageEntry::PROT_MASK) | PageEntry::WRITE_PROTECT,
                    );
                    if self.is_active(id) {
                        self.hw.invalidate_page(va);
                    }
                }
                index += 1;
                va += Size4K::SIZE;
            }
        }
    }

    /// Lower the protection on every mapping of the frame at `pa`.
    ///
    /// A read-only request write protects every entry. No access removes
    /// the mappings entirely, except wired ones, which are pinned by their
    /// wire count and left in place with a warning.
    ///
    /// # Panics
    ///
    /// Panics before [`Self::init`] and when a reverse mapping has no
    /// page table entry behind it.
    pub fn page_protect(&mut self, pa: PhysicalAddress, prot: Protection) {
        assert!(self.initialized, "page_protect before init");
        if prot.contains(Protection::WRITE) {
            return;
        }
        if prot != Protection::NONE {
            self.change_entry_bits(pa, PageEntry::WRITE_PROTECT, true);
            return;
        }
        let Some(idx) = self.phys.page_index(pa) else {
            return;
        };
        let mut skip = 0;
        loop {
            let entry = {
                let _guard = IplGuard::vm();
                self.pv.nth(&self.mapper, idx, skip)
            };
            let Some((pid, va)) = entry else { break };
            let Some((frame, index)) = self.pte_slot(pid, va) else {
                panic!("reverse mapping without a page table entry");
            };
            if PageEntry::from_bits(self.table_word(frame, index)).is_wired() {
                log::warn!("page_protect: wired mapping of {pa} at {va} left in place");
                skip += 1;
                continue;
            }
            self.remove_mapping(pid, va, RemoveFlags::TLB | RemoveFlags::CACHES);
        }
    }

    /// The physical address `va` translates to in space `r`, if mapped.
    #[must_use]
    pub fn extract(&self, r: &PmapRef, va: VirtualAddress) -> Option<PhysicalAddress> {
        let (frame, index) = self.pte_slot(r.id, va)?;
        let entry = PageEntry::from_bits(self.table_word(frame, index));
        entry
            .is_valid()
            .then(|| entry.frame() + (va.as_u32() & (Size4K::SIZE - 1)))
    }

    /// Flip the wired status of the mapping at `va`.
    ///
    /// Wiring is software bookkeeping. The hardware never reads the bit,
    /// so nothing is flushed. Requests for addresses with no mapping are
    /// noted and dropped.
    pub fn change_wiring(&mut self, r: &PmapRef, va: VirtualAddress, wired: bool) {
        let id = r.id;
        let va = va.align_down::<Size4K>();
        let Some((frame, index)) = self.pte_slot(id, va) else {
            log::debug!("change_wiring: no table for {va} in space {}", id.0);
            return;
        };
        let old_bits = self.table_word(frame, index);
        let entry = PageEntry::from_bits(old_bits);
        if !entry.is_valid() {
            log::debug!("change_wiring: {va} not mapped in space {}", id.0);
            return;
        }
        if entry.is_wired() == wired {
            return;
        }
        let pm = self.pm_mut(id);
        let new_bits = if wired {
            pm.wired += 1;
            old_bits | PageEntry::WIRED
        } else {
            pm.wired -= 1;
            old_bits & !PageEntry::WIRED
        };
        self.set_table_word(frame, index, new_bits);
    }

    /// Whether the frame at `pa` was written through any mapping.
    #[must_use]
    pub fn is_modified(&self, pa: PhysicalAddress) -> bool {
        self.test_entry_bits(pa, PageEntry::MODIFIED)
    }

    /// Forget the modified history of the frame at `pa`.
    pub fn clear_modified(&mut self, pa: PhysicalAddress) {
        self.change_entry_bits(pa, PageEntry::MODIFIED, false);
    }

    /// Whether the frame at `pa` was touched through any mapping.
    #[must_use]
    pub fn is_referenced(&self, pa: PhysicalAddress) -> bool {
        self.test_entry_bits(pa, PageEntry::REFERENCED)
    }

    /// Forget the referenced history of the frame at `pa`.
    pub fn clear_referenced(&mut self, pa: PhysicalAddress) {
        self.change_entry_bits(pa, PageEntry::REFERENCED, false);
    }

    /// Zero the frame at `pa` through the scratch kernel mapping.
    ///
    /// # Panics
    ///
    /// Panics before [`Self::init`].
    pub fn zero_page(&mut self, pa: PhysicalAddress) {
        assert!(self.initialized, "zero_page before init");
        let dst = self.scratch_dst;
        self.enter(
            &PmapRef::kernel(),
            dst,
            pa,
            Protection::READ | Protection::WRITE,
            true,
        );
        let frame: &mut ByteFrame = unsafe { self.mapper.phys_to_mut(pa) };
        frame.0.fill(0);
        self.remove_mapping(
            PmapId::KERNEL,
            dst,
            RemoveFlags::TLB | RemoveFlags::CACHES,
        );
    }

    /// Copy the frame at `src` onto the frame at `dst` through the two
    /// scratch kernel mappings.
    ///
    /// # Panics
    ///
    /// Panics before [`Self::init`].
    pub fn copy_page(&mut self, src: PhysicalAddress, dst: PhysicalAddress) {
        assert!(self.initialized, "copy_page before init");
        debug_assert_ne!(src, dst);
        let src_va = self.scratch_src;
        let dst_va = self.scratch_dst;
        self.enter(&PmapRef::kernel(), src_va, src, Protection::READ, true);
        self.enter(
            &PmapRef::kernel(),
            dst_va,
            dst,
            Protection::READ | Protection::WRITE,
            true,
        );
        let s: &mut ByteFrame = unsafe { self.mapper.phys_to_mut(src) };
        let d: &mut ByteFrame = unsafe { self.mapper.phys_to_mut(dst) };
        d.0.copy_from_slice(&s.0);
        // the scratch pages are virtually contiguous
        self.remove(&PmapRef::kernel(), src_va, dst_va + Size4K::SIZE);
    }

    /// Scavenge reclaimable structures when memory runs short.
    ///
    /// Only the kernel space has anything to give: kernel page table pages
    /// whose entries are all invalid go back to the pool, and sparse
    /// reverse-mapping arena pages are compacted. Returns the number of
    /// page frames handed back to the source.
    ///
    /// # Panics
    ///
    /// Panics before [`Self::init`].
    pub fn collect(&mut self, r: &PmapRef) -> u32 {
        assert!(self.initialized, "collect before init");
        if !r.is_kernel() {
            return 0;
        }
        let _guard = IplGuard::vm();
        self.collect_kernel_tables();
        self.pv.collect(&self.mapper, &mut self.phys)
    }

    /// Note that `[start, end)` in space `r` may be paged out.
    ///
    /// Advisory. One narrow case does real work: a single kernel page
    /// being surrendered is a user page table page the paging layer is
    /// done with, and by then it must hold no valid entries. Its modified
    /// history is dropped so pageout sees it clean.
    ///
    /// # Panics
    ///
    /// Panics when the surrendered page table page still holds mappings.
    pub fn pageable(
        &mut self,
        r: &PmapRef,
        start: VirtualAddress,
        end: VirtualAddress,
        pageable: bool,
    ) {
        if !(r.is_kernel() && pageable && end - start == Size4K::SIZE) {
            return;
        }
        let va = start.align_down::<Size4K>();
        let Some(pa) = self.extract(&PmapRef::kernel(), va) else {
            return;
        };
        let Some(idx) = self.phys.page_index(pa) else {
            return;
        };
        if !self.pv.is_ptpage(idx) {
            return;
        }
        {
            let _guard = IplGuard::vm();
            if self.pv.first(idx) != Some((PmapId::KERNEL, va))
                || self.pv.nth(&self.mapper, idx, 1).is_some()
            {
                log::warn!("pageable: page table page {va} is not solely kernel mapped");
            }
        }
        let empty = {
            let table: &mut TableFrame = unsafe { self.mapper.phys_to_mut(pa) };
            table.run_empty(0, mmu::WORDS_PER_FRAME)
        };
        assert!(empty, "surrendered page table page still holds mappings");
        self.clear_modified(pa);
        log::debug!("pageable: page table page {va} surrendered");
    }

    /// Force pending translation state out to the hardware.
    ///
    /// Tables are written eagerly here, so only the address translation
    /// cache can be stale.
    pub fn update(&self) {
        self.hw.invalidate_all();
    }

    /// Tear down the single mapping at `va`, if there is one.
    ///
    /// Folds the hardware attribute bits into the frame's saved byte,
    /// unlinks the reverse-mapping record, and reclaims the page table
    /// page and segment table behind it as they empty out.
    pub(crate) fn remove_mapping(&mut self, id: PmapId, va: VirtualAddress, flags: RemoveFlags) {
        let Some((frame, index)) = self.pte_slot(id, va) else {
            return;
        };
        let old_bits = self.table_word(frame, index);
        let old = PageEntry::from_bits(old_bits);
        if !old.is_valid() {
            return;
        }
        let pa = old.frame();
        log::trace!("remove_mapping: space {} {va} -> {pa}", id.0);

        if self.variant.has_copyback() && flags.contains(RemoveFlags::CACHES) {
            self.hw.push_data_page(pa);
            self.hw.purge_inst_page(pa);
        }

        if old.is_wired() {
            self.pm_mut(id).wired -= 1;
        }
        self.pm_mut(id).resident -= 1;

        self.set_table_word(frame, index, PageEntry::INVALID.bits());
        if flags.contains(RemoveFlags::TLB) && self.is_active(id) {
            self.hw.invalidate_page(va);
        }

        if !id.is_kernel() {
            let Some(span) = self.pm(id).span else {
                unreachable!("user mapping without a table span")
            };
            let ptva = PtArea::page_va(span, mmu::seg_index(va));
            let refs = self.pt_area.del_ref(ptva);
            if refs == 0 && !flags.contains(RemoveFlags::KEEP_TABLE) {
                self.reclaim_user_table(ptva);
            }
        }

        let Some(idx) = self.phys.page_index(pa) else {
            return;
        };
        let _guard = IplGuard::vm();
        let removed = self.pv.remove(&self.mapper, &mut self.phys, idx, id, va);
        self.attrs.merge(idx, old_bits);
        if let Some(tref) = removed.table {
            self.release_table_frame(idx, tref);
        }
    }

    /// A user page table page ran out of valid entries: unmap it from the
    /// kernel window and give its frame back.
    ///
    /// Dropping the kernel mapping performs the segment table teardown on
    /// the way, through the table reference its record carries.
    fn reclaim_user_table(&mut self, ptva: VirtualAddress) {
        let pt = self.pt_area.remove_page(ptva);
        self.remove_mapping(
            PmapId::KERNEL,
            ptva,
            RemoveFlags::TLB | RemoveFlags::CACHES,
        );
        self.phys.give_back(pt.pa);
        log::debug!("reclaim: user page table page {ptva} ({}) freed", pt.pa);
    }

    /// Invalidate the segment table words that reference a dying page
    /// table page, and give the segment table itself back once no realized
    /// segment remains.
    fn release_table_frame(&mut self, idx: u32, tref: TableRef) {
        self.pv.clear_ptpage(idx);
        let tid = tref.pmap;
        let slot = usize::from(tref.slot);
        let stab = self.pm(tid).stab;

        if self.variant.three_level() {
            // sixteen level 2 descriptors cover the page; the chunk itself
            // stays allocated and is reused through the level 1 entry
            for w in 0..mmu::L2_PER_SEGMENT {
                self.set_table_word(stab, slot + w, SegmentEntry::INVALID.bits());
            }
        } else {
            self.set_table_word(stab, slot, SegmentEntry::INVALID.bits());
        }

        let seg_zero = self.seg_zero;
        let pm = self.pm_mut(tid);
        pm.ptpages -= 1;
        pm.stchanged = true;
        let mut dead_stab = None;
        if !tid.is_kernel() {
            pm.sref -= 1;
            if pm.sref == 0 {
                // the space is empty again; share the null table
                dead_stab = Some(pm.stab);
                pm.stab = seg_zero;
                pm.stfree = mmu::PROTO_STFREE;
            }
        }
        if let Some(old) = dead_stab {
            debug_assert_ne!(old, seg_zero);
            self.phys.give_back(old);
            log::debug!("release: segment table {old} returned");
        }
        if self.is_active(tid) {
            if dead_stab.is_some() {
                self.hw.load_root(seg_zero);
                self.pm_mut(tid).stchanged = false;
            }
            self.hw.invalidate_all();
        }
    }

    /// Reserve the page table window span for a user space on first use.
    fn ensure_span(&mut self, id: PmapId) {
        if self.pm(id).span.is_some() {
            return;
        }
        let Some(span) = self.pt_area.alloc_span() else {
            panic!("out of page table address space");
        };
        self.pm_mut(id).span = Some(span);
    }

    /// Realize the segment containing `va`: find a page table page, map
    /// it, and point the segment table at it.
    fn enter_table_page(&mut self, id: PmapId, va: VirtualAddress) {
        if id.is_kernel() {
            self.enter_kernel_table(va);
        } else {
            self.enter_user_table(id, va);
        }
    }

    /// A kernel segment draws its page table page from the fixed pool.
    /// When the pool is dry, emptied kernel page table pages are scavenged
    /// once before the condition is fatal.
    fn enter_kernel_table(&mut self, va: VirtualAddress) {
        if self.kpt.free_count() == 0 {
            log::debug!("enter: kernel page table pool dry, scavenging");
            self.collect_kernel_tables();
        }
        let Some(desc) = self.kpt.take() else {
            panic!("out of kernel page table pages");
        };
        self.zero_frame(desc.pa);
        self.enter(
            &PmapRef::kernel(),
            desc.va,
            desc.pa,
            Protection::READ | Protection::WRITE,
            true,
        );
        let slot = self.point_segment(PmapId::KERNEL, va, desc.pa);
        self.pm_mut(PmapId::KERNEL).ptpages += 1;
        let Some(idx) = self.phys.page_index(desc.pa) else {
            panic!("kernel page table page outside the census");
        };
        {
            let _guard = IplGuard::vm();
            self.pv.set_table_ref(
                &self.mapper,
                idx,
                desc.va,
                TableRef {
                    pmap: PmapId::KERNEL,
                    slot,
                },
            );
        }
        if self.variant.has_copyback() {
            // table walks read memory directly; copyback caching of table
            // stores would leave them invisible
            self.change_entry_bits(desc.pa, PageEntry::COPYBACK, false);
        }
    }

    /// A user segment gets a fresh frame, mapped into the space's slice of
    /// the kernel page table window.
    fn enter_user_table(&mut self, id: PmapId, va: VirtualAddress) {
        let Some(span) = self.pm(id).span else {
            unreachable!("span reserved before table growth")
        };

        // first mapping forces a private segment table
        if self.pm(id).stab == self.seg_zero {
            let Some(stab) = self.phys.next_page() else {
                panic!("out of memory for a segment table");
            };
            self.zero_frame(stab);
            let pm = self.pm_mut(id);
            pm.stab = stab;
            pm.stfree = mmu::PROTO_STFREE;
            pm.stchanged = true;
            log::debug!("enter: space {} gets segment table {stab}", id.0);
            if self.active == Some(id) {
                self.hw.load_root(stab);
                self.hw.invalidate_all();
                self.pm_mut(id).stchanged = false;
            }
        }

        // count the segment first so the table cannot be given back while
        // the page below is entered
        self.pm_mut(id).sref += 1;

        let ptva = PtArea::page_va(span, mmu::seg_index(va));
        let Some(pt_pa) = self.phys.next_page() else {
            panic!("out of memory for a page table page");
        };
        self.zero_frame(pt_pa);
        self.enter(
            &PmapRef::kernel(),
            ptva,
            pt_pa,
            Protection::READ | Protection::WRITE,
            true,
        );
        self.pt_area.note_page(ptva, pt_pa);
        let slot = self.point_segment(id, va, pt_pa);
        self.pm_mut(id).ptpages += 1;
        let Some(idx) = self.phys.page_index(pt_pa) else {
            panic!("page table page outside the census");
        };
        {
            let _guard = IplGuard::vm();
            self.pv
                .set_table_ref(&self.mapper, idx, ptva, TableRef { pmap: id, slot });
        }
        if self.variant.has_copyback() {
            self.change_entry_bits(pt_pa, PageEntry::COPYBACK, false);
        }
        if self.active == Some(id) {
            self.hw.invalidate_all();
        }
    }

    /// Point the segment table of `id` at the page table page `pt` for the
    /// segment containing `va`. Returns the first segment table word
    /// written, which the page's reverse-mapping record keeps for the
    /// teardown.
    pub(crate) fn point_segment(
        &mut self,
        id: PmapId,
        va: VirtualAddress,
        pt: PhysicalAddress,
    ) -> u16 {
        let stab = self.pm(id).stab;
        let first = if self.variant.three_level() {
            let l1i = mmu::level1_index(va);
            let l1w = self.table_word(stab, l1i);
            let chunk = if SegmentEntry::from_bits(l1w).is_valid() {
                (((l1w & SegmentEntry::LEVEL2_ADDR) - stab.as_u32()) as usize)
                    / (mmu::CHUNK_WORDS * 4)
            } else {
                let pm = self.pm_mut(id);
                let Some(c) = mmu::first_free_chunk(pm.stfree) else {
                    panic!("out of segment table chunks");
                };
                pm.stfree &= !(1u16 << c);
                let base = c * mmu::CHUNK_WORDS;
                for w in 0..mmu::CHUNK_WORDS {
                    self.set_table_word(stab, base + w, 0);
                }
                let l2_pa = stab + (base as u32 * 4);
                self.set_table_word(stab, l1i, SegmentEntry::level1(l2_pa).bits());
                c
            };
            // one page table page is sixteen consecutive level 3 tables
            let within = mmu::level2_index(va) & !(mmu::L2_PER_SEGMENT - 1);
            let first = chunk * mmu::CHUNK_WORDS + within;
            for i in 0..mmu::L2_PER_SEGMENT {
                let l3_pa = pt + (i as u32 * (mmu::LEVEL3_SIZE as u32) * 4);
                self.set_table_word(stab, first + i, SegmentEntry::level2(l3_pa).bits());
            }
            first
        } else {
            let seg = mmu::seg_index(va);
            self.set_table_word(stab, seg, SegmentEntry::table(pt).bits());
            seg
        };
        self.pm_mut(id).stchanged = true;
        first as u16
    }

    /// Whether the segment containing `va` has a page table behind it.
    pub(crate) fn segment_present(&self, id: PmapId, va: VirtualAddress) -> bool {
        self.pte_slot(id, va).is_some()
    }

    /// Page table location of `va` in `id`: the frame holding the leaf
    /// entry and the word index within it. `None` while the segment has no
    /// page table.
    pub(crate) fn pte_slot(
        &self,
        id: PmapId,
        va: VirtualAddress,
    ) -> Option<(PhysicalAddress, usize)> {
        let stab = self.pmaps.get(id)?.stab;
        if self.variant.three_level() {
            let l1 = self.table_word(stab, mmu::level1_index(va));
            if !SegmentEntry::from_bits(l1).is_valid() {
                return None;
            }
            let l2_pa = PhysicalAddress::new(l1 & SegmentEntry::LEVEL2_ADDR)
                + (mmu::level2_index(va) as u32) * 4;
            let l2 = self.word_at(l2_pa);
            if !SegmentEntry::from_bits(l2).is_valid() {
                return None;
            }
            let pte_pa = PhysicalAddress::new(l2 & SegmentEntry::LEVEL3_ADDR)
                + (mmu::level3_index(va) as u32) * 4;
            Some((
                pte_pa.align_down::<Size4K>(),
                ((pte_pa.as_u32() & (Size4K::SIZE - 1)) >> 2) as usize,
            ))
        } else {
            let ste = self.table_word(stab, mmu::seg_index(va));
            if !SegmentEntry::from_bits(ste).is_valid() {
                return None;
            }
            Some((
                PhysicalAddress::new(ste & SegmentEntry::FRAME),
                mmu::pte_index(va),
            ))
        }
    }

    /// Read the descriptor word at physical address `pa`.
    fn word_at(&self, pa: PhysicalAddress) -> u32 {
        let frame = pa.align_down::<Size4K>();
        let index = ((pa.as_u32() & (Size4K::SIZE - 1)) >> 2) as usize;
        self.table_word(frame, index)
    }

    /// Set or clear `bits` in every mapping of the frame at `pa`.
    ///
    /// Clearing also wipes the bits from the frame's saved attributes.
    fn change_entry_bits(&mut self, pa: PhysicalAddress, bits: u32, set: bool) {
        let Some(idx) = self.phys.page_index(pa) else {
            return;
        };
        let _guard = IplGuard::vm();
        if !set {
            self.attrs.clear(idx, bits);
        }
        // On the 68040, dirty lines must reach memory before write
        // protection or a cache mode change takes effect. Once per call.
        let flush = self.variant.has_copyback()
            && ((set && bits & PageEntry::WRITE_PROTECT != 0)
                || bits & PageEntry::CACHE_MASK != 0);
        let mut flushed = false;
        for (pid, va) in self.pv.snapshot(&self.mapper, idx) {
            let Some((frame, index)) = self.pte_slot(pid, va) else {
                panic!("reverse mapping without a page table entry");
            };
            let old_bits = self.table_word(frame, index);
            let new_bits = if set { old_bits | bits } else { old_bits & !bits };
            if new_bits == old_bits {
                continue;
            }
            if flush && !flushed {
                self.hw.push_data_page(pa);
                self.hw.purge_inst_page(pa);
                flushed = true;
            }
            self.set_table_word(frame, index, new_bits);
            if self.is_active(pid) {
                self.hw.invalidate_page(va);
            }
        }
    }

    /// Whether any of `bits` is set for the frame at `pa`, in its saved
    /// attributes or in any live mapping.
    fn test_entry_bits(&self, pa: PhysicalAddress, bits: u32) -> bool {
        let Some(idx) = self.phys.page_index(pa) else {
            return false;
        };
        let _guard = IplGuard::vm();
        if self.attrs.test(idx, bits) {
            return true;
        }
        for (pid, va) in self.pv.snapshot(&self.mapper, idx) {
            if let Some((frame, index)) = self.pte_slot(pid, va) {
                if self.table_word(frame, index) & bits != 0 {
                    return true;
                }
            }
        }
        false
    }

    /// Find kernel page table pages with no valid entries left, unmap
    /// them, and return them to the pool.
    fn collect_kernel_tables(&mut self) {
        let mut victims: Vec<(VirtualAddress, PhysicalAddress)> = Vec::new();
        for idx in 0..self.phys.total_pages() {
            if !self.pv.is_ptpage(idx) {
                continue;
            }
            let Some((kva, tref)) = self.pv.table_owner(&self.mapper, idx) else {
                continue;
            };
            if !tref.pmap.is_kernel() {
                continue;
            }
            let Some(pa) = self.phys.page_at(idx) else {
                unreachable!()
            };
            let empty = {
                let table: &mut TableFrame = unsafe { self.mapper.phys_to_mut(pa) };
                table.run_empty(0, mmu::WORDS_PER_FRAME)
            };
            if empty {
                victims.push((kva, pa));
            }
        }
        for (kva, pa) in victims {
            // the teardown wipes the segment table words through the
            // frame's record; the frame itself stays pooled
            self.remove_mapping(PmapId::KERNEL, kva, RemoveFlags::TLB | RemoveFlags::CACHES);
            if !self.kpt.release(pa) {
                panic!("lost a kernel page table page");
            }
            log::debug!("collect: kernel page table page {kva} pooled");
        }
    }
}
