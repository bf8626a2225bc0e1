//! Reverse mappings.
//!
//! For every managed page frame the system can name each virtual mapping of
//! that frame: one record inline in the per-page header, the rest pooled in
//! whole page frames drawn from the physical source. Chains answer "who
//! maps this frame" for protection changes, attribute queries, and page
//! steal decisions, and they carry the bookkeeping that ties a page table
//! page back to the segment table entry that references it.
//!
//! Callers hold the mapping-update exclusive section around every call that
//! touches a chain.

use alloc::vec::Vec;
use kernel_memory_addresses::{PhysicalAddress, VirtualAddress};

use crate::hw::{PV_SLOTS_PER_FRAME, PhysMapper, PvFrame, PvSlotRaw};
use crate::phys::PhysicalMemory;
use crate::pmap::PmapId;

/// Nil marker in on-frame words.
const NIL: u32 = u32::MAX;

/// A pooled record slot: arena page ordinal in the high bits, slot index in
/// the low byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct PvSlotId(u32);

impl PvSlotId {
    fn new(ordinal: u32, slot: usize) -> Self {
        debug_assert!(slot < PV_SLOTS_PER_FRAME);
        Self((ordinal << 8) | slot as u32)
    }

    const fn ordinal(self) -> u32 {
        self.0 >> 8
    }

    const fn slot(self) -> usize {
        (self.0 & 0xFF) as usize
    }
}

/// Segment table bookkeeping carried by the kernel mapping of a page table
/// page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct TableRef {
    /// Space whose segment table references the frame.
    pub pmap: PmapId,
    /// First segment table word realized for it.
    pub slot: u16,
}

/// One reverse mapping.
#[derive(Debug, Clone, Copy)]
pub(crate) struct PvRec {
    pub pmap: PmapId,
    pub va: VirtualAddress,
    pub table: Option<TableRef>,
    next: Option<PvSlotId>,
}

/// Per-managed-page chain head.
pub(crate) struct PvHeader {
    rec: Option<PvRec>,
    /// The frame currently serves as a page table page.
    pub ptpage: bool,
}

/// Hosted bookkeeping for one arena page.
struct PvPage {
    pa: PhysicalAddress,
    /// Slot index of the first free slot, or [`NIL`]. Free slots chain
    /// through their `next` word by slot index; used slots chain by global
    /// slot id.
    free_head: u32,
    nfree: u16,
}

/// The reverse-mapping table.
pub(crate) struct PvTable {
    headers: Vec<PvHeader>,
    dir: Vec<Option<PvPage>>,
    free_ordinals: Vec<u32>,
    with_free: Vec<u32>,
    nfree: u32,
}

enum Link {
    Header,
    Slot(PvSlotId),
}

impl PvTable {
    pub(crate) const fn empty() -> Self {
        Self {
            headers: Vec::new(),
            dir: Vec::new(),
            free_ordinals: Vec::new(),
            with_free: Vec::new(),
            nfree: 0,
        }
    }

    /// Size the header array for `pages` managed pages.
    pub(crate) fn grow_headers(&mut self, pages: u32) {
        self.headers.resize_with(pages as usize, || PvHeader {
            rec: None,
            ptpage: false,
        });
    }

    pub(crate) fn is_ptpage(&self, idx: u32) -> bool {
        self.headers[idx as usize].ptpage
    }

    pub(crate) fn clear_ptpage(&mut self, idx: u32) {
        self.headers[idx as usize].ptpage = false;
    }

    /// Arena pages currently held.
    pub(crate) fn arena_pages(&self) -> u32 {
        self.dir.iter().filter(|p| p.is_some()).count() as u32
    }

    fn read_slot<M: PhysMapper>(&self, mapper: &M, id: PvSlotId) -> PvSlotRaw {
        let page = self.page(id.ordinal());
        let frame: &mut PvFrame = unsafe { mapper.phys_to_mut(page.pa) };
        frame.slots[id.slot()]
    }

    fn write_slot<M: PhysMapper>(&self, mapper: &M, id: PvSlotId, raw: PvSlotRaw) {
        let page = self.page(id.ordinal());
        let frame: &mut PvFrame = unsafe { mapper.phys_to_mut(page.pa) };
        frame.slots[id.slot()] = raw;
    }

    fn page(&self, ordinal: u32) -> &PvPage {
        match self.dir[ordinal as usize].as_ref() {
            Some(p) => p,
            None => panic!("pv arena page {ordinal} is gone"),
        }
    }

    fn decode(raw: PvSlotRaw) -> PvRec {
        PvRec {
            pmap: PmapId(raw.pmap),
            va: VirtualAddress::new(raw.va),
            table: if raw.table_pmap == NIL {
                None
            } else {
                Some(TableRef {
                    pmap: PmapId(raw.table_pmap),
                    slot: raw.table_slot as u16,
                })
            },
            next: if raw.next == NIL {
                None
            } else {
                Some(PvSlotId(raw.next))
            },
        }
    }

    fn encode(rec: &PvRec) -> PvSlotRaw {
        PvSlotRaw {
            next: rec.next.map_or(NIL, |n| n.0),
            pmap: rec.pmap.0,
            va: rec.va.as_u32(),
            table_pmap: rec.table.map_or(NIL, |t| t.pmap.0),
            table_slot: rec.table.map_or(0, |t| u32::from(t.slot)),
        }
    }

    /// Record that (`pmap`, `va`) maps the frame with dense index `idx`.
    pub(crate) fn insert<M: PhysMapper>(
        &mut self,
        mapper: &M,
        phys: &mut PhysicalMemory,
        idx: u32,
        pmap: PmapId,
        va: VirtualAddress,
    ) {
        #[cfg(debug_assertions)]
        {
            let dup = self
                .snapshot(mapper, idx)
                .iter()
                .any(|&(p, v)| p == pmap && v == va);
            assert!(!dup, "mapping already on pv chain");
        }
        let head = &mut self.headers[idx as usize];
        let rec = PvRec {
            pmap,
            va,
            table: None,
            next: None,
        };
        if head.rec.is_none() {
            head.rec = Some(rec);
            return;
        }
        let id = self.alloc_slot(mapper, phys);
        let head = &mut self.headers[idx as usize];
        let Some(first) = head.rec.as_mut() else {
            unreachable!()
        };
        let chained = PvRec {
            next: first.next,
            ..rec
        };
        first.next = Some(id);
        self.write_slot(mapper, id, Self::encode(&chained));
    }

    /// Drop (`pmap`, `va`) from the frame's chain and hand back the record.
    ///
    /// # Panics
    ///
    /// A mapping the entry state says exists must be on the chain; a miss
    /// means the two structures disagree and the system state is unsound.
    pub(crate) fn remove<M: PhysMapper>(
        &mut self,
        mapper: &M,
        phys: &mut PhysicalMemory,
        idx: u32,
        pmap: PmapId,
        va: VirtualAddress,
    ) -> PvRec {
        let head = &self.headers[idx as usize];
        let Some(first) = head.rec else {
            panic!("remove: pv chain for page {idx} is empty");
        };
        if first.pmap == pmap && first.va == va {
            if let Some(nid) = first.next {
                let raw = self.read_slot(mapper, nid);
                self.headers[idx as usize].rec = Some(Self::decode(raw));
                self.free_slot(mapper, phys, nid);
            } else {
                self.headers[idx as usize].rec = None;
            }
            return first;
        }
        let mut prev = Link::Header;
        let mut cur = first.next;
        while let Some(id) = cur {
            let raw = self.read_slot(mapper, id);
            let rec = Self::decode(raw);
            if rec.pmap == pmap && rec.va == va {
                match prev {
                    Link::Header => {
                        if let Some(h) = self.headers[idx as usize].rec.as_mut() {
                            h.next = rec.next;
                        }
                    }
                    Link::Slot(p) => {
                        let mut praw = self.read_slot(mapper, p);
                        praw.next = raw.next;
                        self.write_slot(mapper, p, praw);
                    }
                }
                self.free_slot(mapper, phys, id);
                return rec;
            }
            prev = Link::Slot(id);
            cur = rec.next;
        }
        panic!("remove: mapping not on pv chain");
    }

    /// Mark the frame as a page table page and note which segment table
    /// words reference it. The kernel mapping at `kva` must already be on
    /// the chain.
    pub(crate) fn set_table_ref<M: PhysMapper>(
        &mut self,
        mapper: &M,
        idx: u32,
        kva: VirtualAddress,
        table: TableRef,
    ) {
        self.headers[idx as usize].ptpage = true;
        if let Some(h) = self.headers[idx as usize].rec.as_mut() {
            if h.pmap.is_kernel() && h.va == kva {
                h.table = Some(table);
                return;
            }
        }
        let mut cur = self.headers[idx as usize].rec.and_then(|r| r.next);
        while let Some(id) = cur {
            let mut raw = self.read_slot(mapper, id);
            let rec = Self::decode(raw);
            if rec.pmap.is_kernel() && rec.va == kva {
                raw.table_pmap = table.pmap.0;
                raw.table_slot = u32::from(table.slot);
                self.write_slot(mapper, id, raw);
                return;
            }
            cur = rec.next;
        }
        panic!("table page mapping not on pv chain");
    }

    /// First mapping of the frame, if any.
    pub(crate) fn first(&self, idx: u32) -> Option<(PmapId, VirtualAddress)> {
        self.headers[idx as usize].rec.map(|r| (r.pmap, r.va))
    }

    /// The `n`th mapping of the frame.
    pub(crate) fn nth<M: PhysMapper>(
        &self,
        mapper: &M,
        idx: u32,
        n: usize,
    ) -> Option<(PmapId, VirtualAddress)> {
        let mut rec = self.headers[idx as usize].rec?;
        for _ in 0..n {
            let id = rec.next?;
            rec = Self::decode(self.read_slot(mapper, id));
        }
        Some((rec.pmap, rec.va))
    }

    /// All mappings of the frame, in chain order.
    pub(crate) fn snapshot<M: PhysMapper>(
        &self,
        mapper: &M,
        idx: u32,
    ) -> Vec<(PmapId, VirtualAddress)> {
        let mut out = Vec::new();
        let Some(first) = self.headers[idx as usize].rec else {
            return out;
        };
        out.push((first.pmap, first.va));
        let mut cur = first.next;
        while let Some(id) = cur {
            let rec = Self::decode(self.read_slot(mapper, id));
            out.push((rec.pmap, rec.va));
            cur = rec.next;
        }
        out
    }

    /// The record that carries segment table bookkeeping, if the frame is a
    /// page table page: its kernel mapping address and the reference.
    pub(crate) fn table_owner<M: PhysMapper>(
        &self,
        mapper: &M,
        idx: u32,
    ) -> Option<(VirtualAddress, TableRef)> {
        let first = self.headers[idx as usize].rec?;
        if let Some(t) = first.table {
            return Some((first.va, t));
        }
        let mut cur = first.next;
        while let Some(id) = cur {
            let rec = Self::decode(self.read_slot(mapper, id));
            if let Some(t) = rec.table {
                return Some((rec.va, t));
            }
            cur = rec.next;
        }
        None
    }

    /// Free pooled record slots across all arena pages.
    pub(crate) fn free_slots(&self) -> u32 {
        self.nfree
    }

    fn alloc_slot<M: PhysMapper>(&mut self, mapper: &M, phys: &mut PhysicalMemory) -> PvSlotId {
        if self.nfree == 0 && !self.grow(mapper, phys) {
            panic!("out of pv entries");
        }
        let ord = match self.with_free.last() {
            Some(&o) => o,
            None => unreachable!(),
        };
        let page = match self.dir[ord as usize].as_mut() {
            Some(p) => p,
            None => unreachable!(),
        };
        let slot = page.free_head as usize;
        let id = PvSlotId::new(ord, slot);
        let raw = self.read_slot(mapper, id);
        let page = match self.dir[ord as usize].as_mut() {
            Some(p) => p,
            None => unreachable!(),
        };
        page.free_head = raw.next;
        page.nfree -= 1;
        if page.nfree == 0 {
            self.with_free.pop();
        }
        self.nfree -= 1;
        id
    }

    fn free_slot<M: PhysMapper>(
        &mut self,
        mapper: &M,
        phys: &mut PhysicalMemory,
        id: PvSlotId,
    ) {
        let ord = id.ordinal();
        let head = self.page(ord).free_head;
        self.write_slot(
            mapper,
            id,
            PvSlotRaw {
                next: head,
                pmap: NIL,
                va: 0,
                table_pmap: NIL,
                table_slot: 0,
            },
        );
        let page = match self.dir[ord as usize].as_mut() {
            Some(p) => p,
            None => unreachable!(),
        };
        page.free_head = id.slot() as u32;
        page.nfree += 1;
        self.nfree += 1;
        if page.nfree == 1 {
            self.with_free.push(ord);
        }
        // A fully idle arena page goes straight back to the source.
        if usize::from(page.nfree) == PV_SLOTS_PER_FRAME {
            let pa = page.pa;
            self.dir[ord as usize] = None;
            self.free_ordinals.push(ord);
            self.with_free.retain(|&o| o != ord);
            self.nfree -= PV_SLOTS_PER_FRAME as u32;
            phys.give_back(pa);
        }
    }

    fn grow<M: PhysMapper>(&mut self, mapper: &M, phys: &mut PhysicalMemory) -> bool {
        let Some(pa) = phys.next_page() else {
            return false;
        };
        let ord = if let Some(o) = self.free_ordinals.pop() {
            o
        } else {
            self.dir.push(None);
            self.dir.len() as u32 - 1
        };
        // Chain every slot onto the page-local free list.
        let frame: &mut PvFrame = unsafe { mapper.phys_to_mut(pa) };
        for (i, s) in frame.slots.iter_mut().enumerate() {
            *s = PvSlotRaw {
                next: if i + 1 < PV_SLOTS_PER_FRAME {
                    i as u32 + 1
                } else {
                    NIL
                },
                pmap: NIL,
                va: 0,
                table_pmap: NIL,
                table_slot: 0,
            };
        }
        self.dir[ord as usize] = Some(PvPage {
            pa,
            free_head: 0,
            nfree: PV_SLOTS_PER_FRAME as u16,
        });
        self.with_free.push(ord);
        self.nfree += PV_SLOTS_PER_FRAME as u32;
        true
    }

    /// Compact the arena: migrate records out of sparsely used pages and
    /// return the emptied pages to the source. Returns how many pages went
    /// back.
    pub(crate) fn collect<M: PhysMapper>(
        &mut self,
        mapper: &M,
        phys: &mut PhysicalMemory,
    ) -> u32 {
        // Select victims while enough slack remains elsewhere to absorb
        // their records.
        let mut victims: Vec<u32> = Vec::new();
        let ordinals: Vec<u32> = self.with_free.clone();
        for ord in ordinals {
            if self.nfree < PV_SLOTS_PER_FRAME as u32 {
                break;
            }
            let nfree = match self.dir[ord as usize].as_ref() {
                Some(p) => u32::from(p.nfree),
                None => continue,
            };
            if nfree > PV_SLOTS_PER_FRAME as u32 / 3 {
                self.with_free.retain(|&o| o != ord);
                self.nfree -= nfree;
                victims.push(ord);
            }
        }
        if victims.is_empty() {
            return 0;
        }

        let is_victim = |id: PvSlotId| victims.contains(&id.ordinal());
        for idx in 0..self.headers.len() {
            let Some(first) = self.headers[idx].rec else {
                continue;
            };
            let mut prev = Link::Header;
            let mut cur = first.next;
            while let Some(id) = cur {
                let raw = self.read_slot(mapper, id);
                let next = Self::decode(raw).next;
                if is_victim(id) {
                    let nid = self.alloc_slot(mapper, phys);
                    self.write_slot(mapper, nid, raw);
                    match prev {
                        Link::Header => {
                            if let Some(h) = self.headers[idx].rec.as_mut() {
                                h.next = Some(nid);
                            }
                        }
                        Link::Slot(p) => {
                            let mut praw = self.read_slot(mapper, p);
                            praw.next = nid.0;
                            self.write_slot(mapper, p, praw);
                        }
                    }
                    prev = Link::Slot(nid);
                } else {
                    prev = Link::Slot(id);
                }
                cur = next;
            }
        }

        let freed = victims.len() as u32;
        for ord in victims {
            let pa = self.page(ord).pa;
            self.dir[ord as usize] = None;
            self.free_ordinals.push(ord);
            phys.give_back(pa);
        }
        log::debug!("pv collect returned {freed} arena page(s)");
        freed
    }
}
