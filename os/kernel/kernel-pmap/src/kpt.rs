//! Kernel page table page pool.
//!
//! Kernel segments cannot wait for memory: faults, interrupt handlers, and
//! the pager itself all extend the kernel window. A fixed pool of page
//! frames with preassigned kernel addresses is set aside at initialization,
//! and kernel segments draw from it. When the pool runs dry the caller
//! scavenges emptied kernel page table pages and retries; only then is the
//! condition fatal.

use alloc::vec::Vec;
use kernel_memory_addresses::{PhysicalAddress, VirtualAddress};

/// One pooled page: its fixed kernel address and its frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct KptPage {
    pub va: VirtualAddress,
    pub pa: PhysicalAddress,
}

pub(crate) struct KptPool {
    free: Vec<KptPage>,
    used: Vec<KptPage>,
}

impl KptPool {
    pub(crate) const fn empty() -> Self {
        Self {
            free: Vec::new(),
            used: Vec::new(),
        }
    }

    /// Add a page to the pool during initialization.
    pub(crate) fn push(&mut self, page: KptPage) {
        self.free.push(page);
    }

    /// Claim a pooled page for a new kernel segment.
    pub(crate) fn take(&mut self) -> Option<KptPage> {
        let page = self.free.pop()?;
        self.used.push(page);
        Some(page)
    }

    /// Return the pooled page whose frame is `pa` after its segment was
    /// torn down. `false` when `pa` is not a pooled page in use.
    pub(crate) fn release(&mut self, pa: PhysicalAddress) -> bool {
        let Some(i) = self.used.iter().position(|p| p.pa == pa) else {
            return false;
        };
        let page = self.used.swap_remove(i);
        self.free.push(page);
        true
    }

    pub(crate) fn free_count(&self) -> usize {
        self.free.len()
    }

    pub(crate) fn used_count(&self) -> usize {
        self.used.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn page(n: u32) -> KptPage {
        KptPage {
            va: VirtualAddress::new(0x00F0_0000 + (n << 12)),
            pa: PhysicalAddress::new(0x0002_0000 + (n << 12)),
        }
    }

    #[test]
    fn take_and_release_cycle() {
        let mut pool = KptPool::empty();
        for n in 0..3 {
            pool.push(page(n));
        }
        assert_eq!(pool.free_count(), 3);

        let a = pool.take().unwrap();
        let b = pool.take().unwrap();
        assert_eq!(pool.used_count(), 2);
        assert_ne!(a.pa, b.pa);

        assert!(pool.release(a.pa));
        assert!(!pool.release(a.pa), "double release is refused");
        assert_eq!(pool.free_count(), 2);

        // a released page can be claimed again
        while pool.take().is_some() {}
        assert_eq!(pool.used_count(), 3);
        assert_eq!(pool.free_count(), 0);
    }
}
