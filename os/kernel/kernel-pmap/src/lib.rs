//! # Physical map layer for the m68k MMU family
//!
//! This crate is the machine-dependent half of virtual memory: it owns the
//! translation tables the MMU walks and offers the machine-independent
//! layer a small set of operations over them. Map a page, unmap a range,
//! restrict protection by virtual range or by physical frame, query and
//! clear the referenced and modified history of a frame, wire and unwire,
//! copy and zero whole frames. Everything is bookkept so that the answer to
//! "who maps this frame" is always available without scanning tables.
//!
//! ## Translation geometry
//!
//! Three MMU generations are driven through one table layout: a 4 KiB page
//! table page holds the 1024 leaf entries for a 4 MiB *segment* of virtual
//! space, and a 4 KiB segment table frame names the page table pages.
//!
//! The 68851 and the 68030 walk exactly that, two levels:
//!
//! ```text
//! VA = [segment:10] [page:10] [offset:12]
//!        │            │
//!        │            └─ entry within the page table page
//!        └─ entry within the 1024-word segment table
//! ```
//!
//! The 68040 walks three levels with shorter indices. Its level 1 and
//! level 2 tables are 128 words each and its level 3 tables 64 words, so
//! the same two frames are carved up rather than replaced: the segment
//! table frame holds the level 1 table in its first 512-byte chunk and
//! hands out the other seven chunks as level 2 tables, and a page table
//! page is described to the hardware as sixteen consecutive level 3
//! tables.
//!
//! ```text
//! VA = [level1:7] [level2:7] [level3:6] [offset:12]
//! ```
//!
//! One mapping layer, one page table page per segment, either way.
//!
//! ## Life cycle
//!
//! [`PmapSystem::bootstrap`] takes a [`BootstrapLayout`] describing the RAM
//! banks and the kernel virtual window, builds the kernel segment table,
//! and switches translation on. Until [`PmapSystem::init`], the kernel
//! grows only through [`PmapSystem::map_range`] and
//! [`PmapSystem::bootstrap_alloc`]; after it, every change goes through the
//! mapping operations and is fully bookkept. User address spaces are
//! created, activated, and released through [`PmapRef`] handles.
//!
//! ## Seams
//!
//! The crate touches the machine through two traits. [`PhysMapper`] turns
//! physical addresses into references, a fixed-offset window on the real
//! machine and a block of process memory in the hosted test suite.
//! [`MmuHardware`] carries the TLB, cache, and root pointer operations.
//! Interrupt exclusion around shared mapping state uses the scoped priority
//! guard from `kernel-sync`, which falls back to an emulated status
//! register off target.
//!
//! The crate is `no_std` (with `alloc`) outside of tests.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code, clippy::cast_possible_truncation)]

mod attr;
mod debug;
mod engine;
pub mod entry;
pub mod hw;
mod kpt;
pub mod mmu;
mod phys;
mod pmap;
mod ptarea;
mod pv;
mod system;

extern crate alloc;

pub use crate::debug::MappingInfo;
pub use crate::entry::{PageEntry, Protection, SegmentEntry};
pub use crate::hw::{ByteFrame, MmuHardware, PhysMapper, TableFrame};
pub use crate::mmu::MmuVariant;
pub use crate::phys::{MAX_RANGES, PhysRange};
pub use crate::pmap::PmapRef;
pub use crate::system::{BootstrapError, BootstrapLayout, PmapSystem};

/// Address vocabulary, re-exported for callers of the mapping operations.
pub use kernel_memory_addresses::{PhysicalAddress, Size4K, Size4M, VirtualAddress};
