//! Address space records and handles.
//!
//! Every address space is a slot in a system-owned table; the outside world
//! holds [`PmapRef`] handles that name a slot. A handle is deliberately not
//! copyable. New references come from `retain` and go away through
//! `release`, so the reference count in the record tracks live handles
//! exactly.

use alloc::vec::Vec;
use kernel_memory_addresses::{PhysicalAddress, VirtualAddress};

use crate::mmu::PROTO_STFREE;

/// Index of an address space in the system table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct PmapId(pub(crate) u32);

impl PmapId {
    /// The kernel's address space, always slot zero.
    pub(crate) const KERNEL: Self = Self(0);

    pub(crate) const fn is_kernel(self) -> bool {
        self.0 == 0
    }

    pub(crate) const fn index(self) -> usize {
        self.0 as usize
    }
}

/// Handle on an address space.
///
/// Obtained from `create` or `retain` and given back through `release`.
/// The kernel's own handle can be conjured freely since the kernel address
/// space lives as long as the system does.
#[derive(Debug, PartialEq, Eq)]
pub struct PmapRef {
    pub(crate) id: PmapId,
}

impl PmapRef {
    /// Handle on the kernel address space.
    #[must_use]
    pub const fn kernel() -> Self {
        Self {
            id: PmapId::KERNEL,
        }
    }

    /// Whether this handle names the kernel address space.
    #[must_use]
    pub const fn is_kernel(&self) -> bool {
        self.id.is_kernel()
    }
}

/// Per-address-space state.
pub(crate) struct Pmap {
    /// Segment table frame. New user spaces share the all-invalid frame
    /// until their first mapping forces a private table.
    pub stab: PhysicalAddress,
    /// Free 512-byte chunks in the segment table frame (three-level only).
    pub stfree: u16,
    /// The root pointer must be reloaded before this space runs again.
    pub stchanged: bool,
    /// Live handles.
    pub count: u32,
    /// Realized segments, counted to know when the private segment table
    /// can be given up again.
    pub sref: u32,
    /// Page table pages owned by this space.
    pub ptpages: u32,
    /// Kernel window span where this space's page table pages are mapped.
    pub span: Option<VirtualAddress>,
    /// Valid mappings.
    pub resident: u32,
    /// Wired mappings.
    pub wired: u32,
}

impl Pmap {
    /// A fresh user space sharing `seg_zero`.
    pub(crate) const fn user(seg_zero: PhysicalAddress) -> Self {
        Self {
            stab: seg_zero,
            stfree: PROTO_STFREE,
            stchanged: true,
            count: 1,
            sref: 0,
            ptpages: 0,
            span: None,
            resident: 0,
            wired: 0,
        }
    }

    /// The kernel space over its bootstrap-built segment table.
    pub(crate) const fn kernel(stab: PhysicalAddress, stfree: u16) -> Self {
        Self {
            stab,
            stfree,
            stchanged: false,
            count: 1,
            sref: 0,
            ptpages: 0,
            span: None,
            resident: 0,
            wired: 0,
        }
    }
}

/// Slot table of address spaces. Slot zero is the kernel and never leaves.
pub(crate) struct PmapTable {
    slots: Vec<Option<Pmap>>,
    free: Vec<u32>,
    limit: usize,
}

impl PmapTable {
    pub(crate) fn new(kernel: Pmap, max_user_spaces: usize) -> Self {
        let mut slots = Vec::with_capacity(1 + max_user_spaces);
        slots.push(Some(kernel));
        Self {
            slots,
            free: Vec::new(),
            limit: 1 + max_user_spaces,
        }
    }

    pub(crate) fn get(&self, id: PmapId) -> Option<&Pmap> {
        self.slots.get(id.index()).and_then(Option::as_ref)
    }

    pub(crate) fn get_mut(&mut self, id: PmapId) -> Option<&mut Pmap> {
        self.slots.get_mut(id.index()).and_then(Option::as_mut)
    }

    /// Claim a slot for a new space. `None` when the table is full.
    pub(crate) fn insert(&mut self, pm: Pmap) -> Option<PmapId> {
        if let Some(i) = self.free.pop() {
            self.slots[i as usize] = Some(pm);
            return Some(PmapId(i));
        }
        if self.slots.len() < self.limit {
            self.slots.push(Some(pm));
            return Some(PmapId(self.slots.len() as u32 - 1));
        }
        None
    }

    pub(crate) fn remove(&mut self, id: PmapId) -> Option<Pmap> {
        debug_assert!(!id.is_kernel(), "kernel slot cannot be removed");
        let pm = self.slots.get_mut(id.index()).and_then(Option::take);
        if pm.is_some() {
            self.free.push(id.0);
        }
        pm
    }

    /// Ids of all live spaces, kernel included.
    pub(crate) fn ids(&self) -> impl Iterator<Item = PmapId> + '_ {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.as_ref().map(|_| PmapId(i as u32)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slots_are_reused() {
        let seg_zero = PhysicalAddress::new(0x8000);
        let mut t = PmapTable::new(Pmap::kernel(PhysicalAddress::new(0x7000), 0), 2);
        let a = t.insert(Pmap::user(seg_zero)).unwrap();
        let b = t.insert(Pmap::user(seg_zero)).unwrap();
        assert!(t.insert(Pmap::user(seg_zero)).is_none(), "table is full");
        assert_ne!(a, b);
        t.remove(a);
        let c = t.insert(Pmap::user(seg_zero)).unwrap();
        assert_eq!(c, a, "freed slot comes back first");
        assert_eq!(t.ids().count(), 3);
    }

    #[test]
    fn kernel_slot_is_fixed() {
        let t = PmapTable::new(Pmap::kernel(PhysicalAddress::new(0x7000), 0), 1);
        assert!(t.get(PmapId::KERNEL).is_some());
        assert_eq!(t.get(PmapId::KERNEL).unwrap().stab.as_u32(), 0x7000);
    }
}
