//! Kernel window for user page table pages.
//!
//! Every user space that maps anything gets a 4 MiB span of kernel
//! addresses, one page per possible segment, and its page table pages are
//! entered there as ordinary kernel mappings. Each resident page table page
//! carries a count of the valid entries it holds; when the count drops to
//! zero the page is unmapped and its frame goes back to the source at once.

use alloc::collections::BTreeMap;
use alloc::vec::Vec;
use kernel_memory_addresses::{PageSize, PhysicalAddress, Size4K, VirtualAddress};

use crate::mmu;

/// A resident user page table page.
#[derive(Debug, Clone, Copy)]
pub(crate) struct PtPage {
    pub pa: PhysicalAddress,
    /// Valid leaf entries in the page.
    pub refs: u16,
}

pub(crate) struct PtArea {
    base: VirtualAddress,
    end: VirtualAddress,
    next_span: VirtualAddress,
    free_spans: Vec<VirtualAddress>,
    /// Keyed by the kernel page number of the page table page's address.
    pages: BTreeMap<u32, PtPage>,
}

impl PtArea {
    /// Span of kernel addresses reserved per user space: one page for each
    /// of the space's possible segments.
    pub(crate) const SPAN_BYTES: u32 = (1u32 << (32 - mmu::SEG_SHIFT)) << Size4K::SHIFT;

    pub(crate) const fn new(base: VirtualAddress, end: VirtualAddress) -> Self {
        Self {
            base,
            end,
            next_span: base,
            free_spans: Vec::new(),
            pages: BTreeMap::new(),
        }
    }

    pub(crate) const fn base(&self) -> VirtualAddress {
        self.base
    }

    /// Whether `va` lies in the window.
    pub(crate) fn contains(&self, va: VirtualAddress) -> bool {
        self.base <= va && va < self.end
    }

    /// Reserve a span for a new user space.
    pub(crate) fn alloc_span(&mut self) -> Option<VirtualAddress> {
        if let Some(s) = self.free_spans.pop() {
            return Some(s);
        }
        if self.end - self.next_span >= Self::SPAN_BYTES {
            let s = self.next_span;
            self.next_span += Self::SPAN_BYTES;
            return Some(s);
        }
        None
    }

    pub(crate) fn free_span(&mut self, span: VirtualAddress) {
        debug_assert!(self.contains(span));
        self.free_spans.push(span);
    }

    /// Kernel address of the page table page for segment `seg` of a space
    /// whose span starts at `span`.
    pub(crate) fn page_va(span: VirtualAddress, seg: usize) -> VirtualAddress {
        span + (seg as u32) * Size4K::SIZE
    }

    fn key(va: VirtualAddress) -> u32 {
        va.as_u32() >> Size4K::SHIFT
    }

    /// Record a freshly mapped page table page.
    pub(crate) fn note_page(&mut self, va: VirtualAddress, pa: PhysicalAddress) {
        let old = self.pages.insert(Self::key(va), PtPage { pa, refs: 0 });
        debug_assert!(old.is_none(), "page table page mapped twice");
    }

    pub(crate) fn lookup(&self, va: VirtualAddress) -> Option<PtPage> {
        self.pages.get(&Self::key(va)).copied()
    }

    /// Count one more valid entry in the page at `va`.
    pub(crate) fn add_ref(&mut self, va: VirtualAddress) {
        let Some(p) = self.pages.get_mut(&Self::key(va)) else {
            panic!("reference to unmapped page table page")
        };
        p.refs += 1;
    }

    /// Count one valid entry gone; returns the remaining count.
    pub(crate) fn del_ref(&mut self, va: VirtualAddress) -> u16 {
        let Some(p) = self.pages.get_mut(&Self::key(va)) else {
            panic!("dereference of unmapped page table page")
        };
        assert!(p.refs > 0, "page table page reference underflow");
        p.refs -= 1;
        p.refs
    }

    /// Forget a page being torn down and hand its record back.
    pub(crate) fn remove_page(&mut self, va: VirtualAddress) -> PtPage {
        let Some(p) = self.pages.remove(&Self::key(va)) else {
            panic!("tearing down unmapped page table page")
        };
        p
    }

    /// Resident page table pages inside `span`.
    pub(crate) fn pages_in_span(&self, span: VirtualAddress) -> Vec<(VirtualAddress, PtPage)> {
        let lo = Self::key(span);
        let hi = Self::key(span + Self::SPAN_BYTES);
        self.pages
            .range(lo..hi)
            .map(|(k, p)| (VirtualAddress::new(k << Size4K::SHIFT), *p))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn area() -> PtArea {
        PtArea::new(
            VirtualAddress::new(0x0100_0000),
            VirtualAddress::new(0x0100_0000 + 2 * PtArea::SPAN_BYTES),
        )
    }

    #[test]
    fn spans_are_reserved_and_recycled() {
        let mut a = area();
        let s1 = a.alloc_span().unwrap();
        let s2 = a.alloc_span().unwrap();
        assert_eq!(s2 - s1, PtArea::SPAN_BYTES);
        assert!(a.alloc_span().is_none(), "window exhausted");
        a.free_span(s1);
        assert_eq!(a.alloc_span(), Some(s1));
    }

    #[test]
    fn reference_counts_track_entries() {
        let mut a = area();
        let span = a.alloc_span().unwrap();
        let va = PtArea::page_va(span, 3);
        a.note_page(va, PhysicalAddress::new(0x6000));

        a.add_ref(va);
        a.add_ref(va);
        assert_eq!(a.del_ref(va), 1);
        assert_eq!(a.del_ref(va), 0);

        let pt = a.remove_page(va);
        assert_eq!(pt.pa.as_u32(), 0x6000);
        assert!(a.lookup(va).is_none());
    }

    #[test]
    fn span_listing_is_isolated() {
        let mut a = area();
        let s1 = a.alloc_span().unwrap();
        let s2 = a.alloc_span().unwrap();
        a.note_page(PtArea::page_va(s1, 0), PhysicalAddress::new(0x1000));
        a.note_page(PtArea::page_va(s1, 9), PhysicalAddress::new(0x2000));
        a.note_page(PtArea::page_va(s2, 4), PhysicalAddress::new(0x3000));

        let in1 = a.pages_in_span(s1);
        assert_eq!(in1.len(), 2);
        assert_eq!(in1[0].0, PtArea::page_va(s1, 0));
        assert_eq!(in1[1].0, PtArea::page_va(s1, 9));
        assert_eq!(a.pages_in_span(s2).len(), 1);
    }
}
