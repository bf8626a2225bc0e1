//! Physical memory census and page source.
//!
//! The machines this kernel targets expose RAM as a handful of
//! discontiguous banks, so the census keeps an explicit range list and a
//! dense page index across it. All page frames the mapping layer consumes,
//! from segment tables down to pooled reverse-mapping records, are drawn
//! from here, and reclaimed frames flow back in.

use alloc::vec::Vec;
use kernel_memory_addresses::{PageSize, PhysicalAddress, Size4K};

use crate::system::BootstrapError;

/// Upper bound on the number of RAM banks.
pub const MAX_RANGES: usize = 8;

/// One bank of page-aligned physical memory, `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhysRange {
    pub start: PhysicalAddress,
    pub end: PhysicalAddress,
}

impl PhysRange {
    #[must_use]
    pub const fn new(start: PhysicalAddress, end: PhysicalAddress) -> Self {
        Self { start, end }
    }

    /// Pages in this bank.
    #[must_use]
    pub const fn pages(&self) -> u32 {
        (self.end.as_u32() - self.start.as_u32()) >> Size4K::SHIFT
    }

    #[must_use]
    pub fn contains(&self, pa: PhysicalAddress) -> bool {
        self.start <= pa && pa < self.end
    }
}

/// The page source: validated ranges plus an allocation cursor and a free
/// list of returned frames.
pub struct PhysicalMemory {
    ranges: Vec<PhysRange>,
    cursor_range: usize,
    cursor: PhysicalAddress,
    returned: Vec<PhysicalAddress>,
    total: u32,
    remaining: u32,
}

impl PhysicalMemory {
    /// Build the census over `ranges`.
    ///
    /// # Errors
    ///
    /// Rejects an empty list, more than [`MAX_RANGES`] banks, empty or
    /// unaligned banks, and banks that overlap or are out of ascending
    /// order.
    pub fn new(ranges: Vec<PhysRange>) -> Result<Self, BootstrapError> {
        if ranges.is_empty() {
            return Err(BootstrapError::NoRanges);
        }
        if ranges.len() > MAX_RANGES {
            return Err(BootstrapError::TooManyRanges(ranges.len()));
        }
        let mut total = 0u32;
        let mut prev_end = PhysicalAddress::zero();
        for (i, r) in ranges.iter().enumerate() {
            if !r.start.is_aligned::<Size4K>() || !r.end.is_aligned::<Size4K>() {
                return Err(BootstrapError::UnalignedRange(i));
            }
            if r.start >= r.end {
                return Err(BootstrapError::EmptyRange(i));
            }
            if i > 0 && r.start < prev_end {
                return Err(BootstrapError::RangeOrder(i));
            }
            prev_end = r.end;
            total += r.pages();
        }
        let cursor = ranges[0].start;
        Ok(Self {
            ranges,
            cursor_range: 0,
            cursor,
            returned: Vec::new(),
            total,
            remaining: total,
        })
    }

    /// Pages across all banks, whether or not still free.
    #[must_use]
    pub const fn total_pages(&self) -> u32 {
        self.total
    }

    /// Pages still available from the source.
    #[must_use]
    pub fn free_pages(&self) -> u32 {
        self.remaining + self.returned.len() as u32
    }

    /// Hand out one page frame. Returned frames are reissued first.
    pub fn next_page(&mut self) -> Option<PhysicalAddress> {
        if let Some(pa) = self.returned.pop() {
            return Some(pa);
        }
        while self.cursor_range < self.ranges.len() {
            let r = self.ranges[self.cursor_range];
            if self.cursor < r.end {
                let pa = self.cursor;
                self.cursor += Size4K::SIZE;
                self.remaining -= 1;
                return Some(pa);
            }
            self.cursor_range += 1;
            if self.cursor_range < self.ranges.len() {
                self.cursor = self.ranges[self.cursor_range].start;
            }
        }
        None
    }

    /// Hand out `n` physically contiguous pages, cursor only.
    ///
    /// Skips to the next bank when the current one cannot satisfy the run;
    /// the skipped tail is written off and never revisited.
    pub fn take_contiguous(&mut self, n: u32) -> Option<PhysicalAddress> {
        let bytes = n << Size4K::SHIFT;
        while self.cursor_range < self.ranges.len() {
            let r = self.ranges[self.cursor_range];
            if self.cursor < r.end && r.end - self.cursor >= bytes {
                let pa = self.cursor;
                self.cursor += bytes;
                self.remaining -= n;
                return Some(pa);
            }
            self.remaining -= (r.end - self.cursor.min(r.end)) >> Size4K::SHIFT;
            self.cursor_range += 1;
            if self.cursor_range < self.ranges.len() {
                self.cursor = self.ranges[self.cursor_range].start;
            }
        }
        None
    }

    /// Return a previously handed-out frame to the source.
    pub fn give_back(&mut self, pa: PhysicalAddress) {
        debug_assert!(pa.is_aligned::<Size4K>());
        debug_assert!(self.page_index(pa).is_some(), "frame outside all banks");
        self.returned.push(pa);
    }

    /// Dense index of the page containing `pa`, counting pages across the
    /// banks in order. `None` for addresses outside every bank.
    #[must_use]
    pub fn page_index(&self, pa: PhysicalAddress) -> Option<u32> {
        let mut base = 0u32;
        for r in &self.ranges {
            if r.contains(pa) {
                return Some(base + ((pa - r.start) >> Size4K::SHIFT));
            }
            base += r.pages();
        }
        None
    }

    /// Base address of the page with dense index `idx`.
    #[must_use]
    pub fn page_at(&self, idx: u32) -> Option<PhysicalAddress> {
        let mut base = 0u32;
        for r in &self.ranges {
            let n = r.pages();
            if idx < base + n {
                return Some(r.start + ((idx - base) << Size4K::SHIFT));
            }
            base += n;
        }
        None
    }

    /// Drain the remaining pages in hand-out order. This is the startup
    /// census the machine-independent layer runs to seed its free list.
    pub fn census(&mut self) -> impl Iterator<Item = PhysicalAddress> + '_ {
        core::iter::from_fn(move || self.next_page())
    }
}
