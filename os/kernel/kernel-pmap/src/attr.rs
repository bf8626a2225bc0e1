//! Saved page attributes.
//!
//! When a mapping is torn down, the referenced and modified bits its entry
//! accumulated would be lost with it. This table keeps one byte per managed
//! page and ors those bits in at teardown, so pageout decisions made after
//! an unmap still see the page's history. The byte stores the entry bit
//! values directly, which keeps the merge a single or.

use alloc::vec;
use alloc::vec::Vec;

use crate::entry::PageEntry;

pub struct PageAttributes {
    bytes: Vec<u8>,
}

impl PageAttributes {
    /// An empty table; resized once the census is known.
    #[must_use]
    pub const fn empty() -> Self {
        Self { bytes: Vec::new() }
    }

    /// Table for `pages` managed pages, all clear.
    #[must_use]
    pub fn with_pages(pages: u32) -> Self {
        Self {
            bytes: vec![0; pages as usize],
        }
    }

    /// Fold the attribute bits of a dying entry into the page's byte.
    pub fn merge(&mut self, idx: u32, entry_bits: u32) {
        self.bytes[idx as usize] |= (entry_bits & PageEntry::ATTR_MASK) as u8;
    }

    /// Whether any of `bits` is recorded for the page.
    #[must_use]
    pub fn test(&self, idx: u32, bits: u32) -> bool {
        u32::from(self.bytes[idx as usize]) & bits != 0
    }

    /// Clear `bits` from the page's byte.
    pub fn clear(&mut self, idx: u32, bits: u32) {
        self.bytes[idx as usize] &= !(bits as u8);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_accumulates_and_masks() {
        let mut a = PageAttributes::with_pages(4);
        a.merge(2, PageEntry::MODIFIED | PageEntry::VALID | 0x2000);
        assert!(a.test(2, PageEntry::MODIFIED));
        assert!(!a.test(2, PageEntry::REFERENCED));
        a.merge(2, PageEntry::REFERENCED);
        assert!(a.test(2, PageEntry::REFERENCED));
        assert!(a.test(2, PageEntry::MODIFIED));
        assert!(!a.test(1, PageEntry::MODIFIED));
    }

    #[test]
    fn clear_is_selective() {
        let mut a = PageAttributes::with_pages(1);
        a.merge(0, PageEntry::REFERENCED | PageEntry::MODIFIED);
        a.clear(0, PageEntry::REFERENCED);
        assert!(!a.test(0, PageEntry::REFERENCED));
        assert!(a.test(0, PageEntry::MODIFIED));
    }
}
