//! Diagnostics and hosted-build access emulation.
//!
//! None of this is needed to run the machine. [`PmapSystem::probe`] and
//! [`PmapSystem::dump_physical`] expose mapping state for inspection, the
//! table count check recomputes bookkeeping the long way, and
//! [`PmapSystem::note_access`] performs the referenced and modified
//! bookkeeping that the table-walk hardware does on its own on a real
//! machine.

use kernel_memory_addresses::{PhysicalAddress, VirtualAddress};
use kernel_sync::IplGuard;

use crate::entry::PageEntry;
use crate::hw::{MmuHardware, PhysMapper, TableFrame};
use crate::pmap::PmapRef;
use crate::system::PmapSystem;

/// Decoded state of one mapping, as [`PmapSystem::probe`] reports it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MappingInfo {
    /// Frame the page is mapped to.
    pub pa: PhysicalAddress,
    pub wired: bool,
    pub write_protected: bool,
    pub cache_inhibited: bool,
    /// 68040 copyback cache mode.
    pub copyback: bool,
    pub referenced: bool,
    pub modified: bool,
}

impl<M: PhysMapper, H: MmuHardware> PmapSystem<M, H> {
    /// Decode the mapping at `va` in space `r` without touching it.
    #[must_use]
    pub fn probe(&self, r: &PmapRef, va: VirtualAddress) -> Option<MappingInfo> {
        let (frame, index) = self.pte_slot(r.id, va)?;
        let bits = self.table_word(frame, index);
        let entry = PageEntry::from_bits(bits);
        entry.is_valid().then(|| MappingInfo {
            pa: entry.frame(),
            wired: entry.is_wired(),
            write_protected: entry.is_write_protected(),
            cache_inhibited: entry.is_cache_inhibited(),
            copyback: bits & PageEntry::COPYBACK != 0,
            referenced: bits & PageEntry::REFERENCED != 0,
            modified: bits & PageEntry::MODIFIED != 0,
        })
    }

    /// Record an access to `va` in the entry, the way the table-walk
    /// hardware would: referenced always, modified on a permitted write.
    ///
    /// Returns whether the access is permitted by the mapping. Hosted
    /// builds use this in place of the hardware walker; the machine itself
    /// only needs it for MMUs run with table updates disabled.
    pub fn note_access(&mut self, r: &PmapRef, va: VirtualAddress, write: bool) -> bool {
        let Some((frame, index)) = self.pte_slot(r.id, va) else {
            return false;
        };
        let bits = self.table_word(frame, index);
        let entry = PageEntry::from_bits(bits);
        if !entry.is_valid() {
            return false;
        }
        if write && entry.is_write_protected() {
            return false;
        }
        let mut new_bits = bits | PageEntry::REFERENCED;
        if write {
            new_bits |= PageEntry::MODIFIED;
        }
        if new_bits != bits {
            self.set_table_word(frame, index, new_bits);
        }
        true
    }

    /// Live mappings of the frame at `pa`.
    #[must_use]
    pub fn mapping_count(&self, pa: PhysicalAddress) -> usize {
        let Some(idx) = self.phys.page_index(pa) else {
            return 0;
        };
        let _guard = IplGuard::vm();
        self.pv.snapshot(&self.mapper, idx).len()
    }

    /// Log the reverse-mapping chain and saved attributes of the frame at
    /// `pa`.
    pub fn dump_physical(&self, pa: PhysicalAddress) {
        let Some(idx) = self.phys.page_index(pa) else {
            log::debug!("{pa}: unmanaged");
            return;
        };
        let chain = {
            let _guard = IplGuard::vm();
            self.pv.snapshot(&self.mapper, idx)
        };
        log::debug!(
            "{pa}: {} mapping(s), table page {}, referenced {}, modified {}",
            chain.len(),
            self.pv.is_ptpage(idx),
            self.is_referenced(pa),
            self.is_modified(pa),
        );
        for (pid, va) in chain {
            log::debug!("  space {} at {va}", pid.0);
        }
    }

    /// Log one line of bookkeeping per live address space, plus the pool
    /// gauges.
    pub fn dump_spaces(&self) {
        for id in self.pmaps.ids() {
            let pm = self.pm(id);
            log::debug!(
                "space {}: segment table {}, {} resident, {} wired, {} table pages, {} segments",
                id.0,
                pm.stab,
                pm.resident,
                pm.wired,
                pm.ptpages,
                pm.sref,
            );
        }
        log::debug!(
            "kernel table pool: {} free, {} used; pv arena: {} pages, {} free slots",
            self.kpt.free_count(),
            self.kpt.used_count(),
            self.pv.arena_pages(),
            self.pv.free_slots(),
        );
    }

    /// Recount the valid entries in the user page table page mapped at
    /// kernel address `va` and compare with its recorded count.
    ///
    /// The count steers page reclamation, so a mismatch means a leak or a
    /// premature teardown ahead. Logged and reported, not fatal; the page
    /// is still usable. Addresses that are not tracked table pages pass
    /// trivially.
    #[must_use]
    pub fn verify_table_count(&self, va: VirtualAddress) -> bool {
        let Some(pt) = self.pt_area.lookup(va) else {
            return true;
        };
        let counted = {
            let table: &mut TableFrame = unsafe { self.mapper.phys_to_mut(pt.pa) };
            table
                .0
                .iter()
                .filter(|w| PageEntry::from_bits(**w).is_valid())
                .count()
        };
        if counted == usize::from(pt.refs) {
            return true;
        }
        log::warn!(
            "table page at {va}: {counted} valid entries, {} recorded",
            pt.refs
        );
        false
    }
}
