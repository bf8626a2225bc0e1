//! # Virtual and Physical Memory Address Types
//!
//! Strongly typed wrappers for raw memory addresses and page bases used in
//! paging and memory management code on the m68k family.
//!
//! ## Overview
//!
//! This module defines a minimal set of types that prevent mixing virtual and
//! physical addresses at compile time while remaining zero-cost wrappers around
//! `u32` values (the m68k is a 32-bit machine).
//!
//! The core idea is to build all higher-level memory abstractions from a few
//! principal types:
//!
//! | Concept | Generic | Description |
//! |----------|----------|-------------|
//! | [`MemoryAddress`] | – | A raw 32-bit address, either physical or virtual. |
//! | [`MemoryPage<S>`] | [`S: PageSize`](PageSize) | A page-aligned base address of a page of size `S`. |
//! | [`MemoryAddressOffset<S>`] | [`S: PageSize`](PageSize) | An offset within a page of size `S`. |
//!
//! These are then wrapped to distinguish between virtual and physical spaces:
//!
//! | Wrapper | Meaning |
//! |----------|----------|
//! | [`VirtualAddress`] / [`VirtualPage<S>`] | Refer to virtual (MMU translated) memory. |
//! | [`PhysicalAddress`] / [`PhysicalPage<S>`] | Refer to physical memory or device registers. |
//!
//! ## Granularities
//!
//! Two granularities matter to the segmented m68k MMUs and are supported via
//! marker types that implement [`PageSize`]:
//!
//! - [`Size4K`] — 4 KiB pages (the translation granularity)
//! - [`Size4M`] — 4 MiB segments (the span of one upper-level table slot)
//!
//! The [`PageSize`] trait defines constants [`SIZE`](PageSize::SIZE) and
//! [`SHIFT`](PageSize::SHIFT) used throughout the helpers.
//!
//! ## Typical Usage
//!
//! ```rust
//! # use kernel_memory_addresses::*;
//! // Create a virtual address
//! let va = VirtualAddress::new(0x00D4_1234);
//!
//! // Split it into a page base and an in-page offset
//! let (page, off) = va.split::<Size4K>();
//! assert_eq!(page.base().as_u32() & (Size4K::SIZE - 1), 0);
//!
//! // Join them back to the same address
//! assert_eq!(page.join(off).as_u32(), va.as_u32());
//!
//! // Segment-granularity rounding works the same way
//! assert_eq!(va.page::<Size4M>().base().as_u32(), 0x00C0_0000);
//! ```
//!
//! ## Design Notes
//!
//! - The types are `#[repr(transparent)]` and implement `Copy`, `Eq`, `Ord`, and
//!   `Hash`, making them suitable as map keys.
//! - All alignment and offset calculations are `const fn` and zero-cost in
//!   release builds.
//! - The phantom marker `S` enforces the granularity at the type level instead
//!   of using constants, ensuring all conversions are explicit.
//!
//! This forms the foundation for the physical-map layer and kernel
//! address-space management code.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(clippy::inline_always, clippy::cast_possible_truncation)]

use core::fmt;
use core::hash::Hash;
use core::marker::PhantomData;
use core::ops::{Add, AddAssign, Sub};

/// Sealed trait pattern to restrict `PageSize` impls to our markers.
mod sealed {
    pub trait Sealed {}
}

/// Marker trait for supported translation granularities.
pub trait PageSize:
    sealed::Sealed + Clone + Copy + Eq + PartialEq + Ord + PartialOrd + Hash + fmt::Display + fmt::Debug
{
    /// Granule size in bytes (power of two).
    const SIZE: u32;
    /// log2(SIZE), i.e., number of low bits used for the offset.
    const SHIFT: u32;

    fn as_str() -> &'static str;
}

/// 4 KiB page (4096 bytes), the translation granularity.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Size4K;
impl sealed::Sealed for Size4K {}
impl PageSize for Size4K {
    const SIZE: u32 = 4096;
    const SHIFT: u32 = 12;

    fn as_str() -> &'static str {
        "4K"
    }
}

/// 4 MiB segment (`4_194_304` bytes), one upper-level table slot.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Size4M;
impl sealed::Sealed for Size4M {}
impl PageSize for Size4M {
    const SIZE: u32 = 4 * 1024 * 1024;
    const SHIFT: u32 = 22;

    fn as_str() -> &'static str {
        "4M"
    }
}

impl fmt::Display for Size4K {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(Self::as_str())
    }
}

impl fmt::Display for Size4M {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(Self::as_str())
    }
}

impl fmt::Debug for Size4K {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Display::fmt(&self, f)
    }
}

impl fmt::Debug for Size4M {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Display::fmt(&self, f)
    }
}

/// Principal raw memory address ([virtual](VirtualAddress) or [physical](PhysicalAddress)).
#[repr(transparent)]
#[derive(Copy, Clone, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct MemoryAddress(u32);

impl MemoryAddress {
    #[inline]
    #[must_use]
    pub const fn new(value: u32) -> Self {
        Self(value)
    }

    #[inline]
    #[must_use]
    pub const fn as_u32(self) -> u32 {
        self.0
    }

    /// The address as an index-friendly `usize`.
    #[inline]
    #[must_use]
    pub const fn as_usize(self) -> usize {
        self.0 as usize
    }

    /// The page for size `S` that contains this address (lower bits zeroed).
    #[inline]
    #[must_use]
    pub const fn page<S: PageSize>(self) -> MemoryPage<S> {
        let value = self.align_down::<S>().0;
        MemoryPage {
            value,
            _phantom: PhantomData,
        }
    }

    /// The offset within the page of size `S` that contains this address.
    #[inline]
    #[must_use]
    pub const fn offset<S: PageSize>(self) -> MemoryAddressOffset<S> {
        let value = self.0 & (S::SIZE - 1);
        MemoryAddressOffset {
            value,
            _phantom: PhantomData,
        }
    }

    /// Split into (`MemoryPage<S>`, `MemoryAddressOffset<S>`).
    #[inline]
    #[must_use]
    pub const fn split<S: PageSize>(self) -> (MemoryPage<S>, MemoryAddressOffset<S>) {
        (self.page::<S>(), self.offset::<S>())
    }

    /// Align down to granule boundary `S`.
    #[inline]
    #[must_use]
    pub const fn align_down<S: PageSize>(self) -> Self {
        Self(self.0 & !(S::SIZE - 1))
    }

    /// Align up to granule boundary `S` (wraps to zero past the top of the
    /// 32-bit space, like the classic `round_page`).
    #[inline]
    #[must_use]
    pub const fn align_up<S: PageSize>(self) -> Self {
        Self(self.0.wrapping_add(S::SIZE - 1) & !(S::SIZE - 1))
    }

    /// Whether the address is aligned to granule `S`.
    #[inline]
    #[must_use]
    pub const fn is_aligned<S: PageSize>(self) -> bool {
        self.0 & (S::SIZE - 1) == 0
    }
}

impl fmt::Debug for MemoryAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MemoryAddress(0x{:08X})", self.0)
    }
}

impl fmt::Display for MemoryAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:08X}", self.as_u32())
    }
}

impl Add<u32> for MemoryAddress {
    type Output = Self;
    #[inline]
    fn add(self, rhs: u32) -> Self::Output {
        Self(self.0 + rhs)
    }
}

impl AddAssign<u32> for MemoryAddress {
    #[inline]
    fn add_assign(&mut self, rhs: u32) {
        self.0 += rhs;
    }
}

impl Sub for MemoryAddress {
    type Output = u32;
    #[inline]
    fn sub(self, rhs: Self) -> u32 {
        self.0 - rhs.0
    }
}

impl Sub<u32> for MemoryAddress {
    type Output = Self;
    #[inline]
    fn sub(self, rhs: u32) -> Self::Output {
        Self(self.0 - rhs)
    }
}

/// A page base address (lower `S::SHIFT` bits are zero).
#[repr(transparent)]
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct MemoryPage<S: PageSize> {
    value: u32,
    _phantom: PhantomData<S>,
}

impl<S> fmt::Display for MemoryPage<S>
where
    S: PageSize,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:08X}/{}", self.value, S::as_str())
    }
}

impl<S: PageSize> MemoryPage<S> {
    /// Create from a raw value, aligning down to the page boundary.
    #[inline]
    #[must_use]
    pub const fn from_addr(addr: MemoryAddress) -> Self {
        let value = addr.as_u32() & !(S::SIZE - 1);
        Self {
            value,
            _phantom: PhantomData,
        }
    }

    /// Page that contains `addr` (aligns down).
    #[inline]
    #[must_use]
    pub const fn containing(addr: u32) -> Self {
        Self::from_addr(MemoryAddress::new(addr))
    }

    /// Create from a raw value that must already be aligned.
    /// Panics in debug if unaligned (no runtime cost in release).
    #[inline]
    #[must_use]
    pub fn new_aligned(addr: MemoryAddress) -> Self {
        debug_assert_eq!(addr.as_u32() & (S::SIZE - 1), 0, "unaligned page address");
        let value = addr.as_u32();
        Self {
            value,
            _phantom: PhantomData,
        }
    }

    /// Return the base as `MemoryAddress`.
    #[inline]
    #[must_use]
    pub const fn base(self) -> MemoryAddress {
        MemoryAddress::new(self.value)
    }

    /// Combine with an offset to form a full address.
    #[inline]
    #[must_use]
    pub const fn join(self, off: MemoryAddressOffset<S>) -> MemoryAddress {
        MemoryAddress::new(self.value + off.as_u32())
    }
}

impl<S: PageSize> fmt::Debug for MemoryPage<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "MemoryPage<{}>(0x{:08X})",
            core::any::type_name::<S>(),
            self.value
        )
    }
}

/// The offset within a page of size `S` (`0..S::SIZE-1`).
#[repr(transparent)]
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct MemoryAddressOffset<S: PageSize> {
    value: u32,
    _phantom: PhantomData<S>,
}

impl<S: PageSize> MemoryAddressOffset<S> {
    /// Create from a raw value, asserting it is < `S::SIZE` in debug.
    #[inline]
    #[must_use]
    pub fn new(value: u32) -> Self {
        debug_assert!(value < S::SIZE, "offset must be < page size");
        let value = value & (S::SIZE - 1);
        Self {
            value,
            _phantom: PhantomData,
        }
    }

    /// Construct from a full address's offset bits.
    #[inline]
    #[must_use]
    pub const fn from_addr(addr: MemoryAddress) -> Self {
        let value = addr.as_u32() & (S::SIZE - 1);
        Self {
            value,
            _phantom: PhantomData,
        }
    }

    #[inline]
    #[must_use]
    pub const fn as_u32(self) -> u32 {
        self.value
    }
}

impl<S: PageSize> fmt::Debug for MemoryAddressOffset<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Offset<{}>({:#X})",
            core::any::type_name::<S>(),
            self.value
        )
    }
}

impl<S: PageSize> Add<MemoryAddressOffset<S>> for MemoryPage<S> {
    type Output = MemoryAddress;
    #[inline]
    fn add(self, rhs: MemoryAddressOffset<S>) -> Self::Output {
        self.join(rhs)
    }
}

impl<S: PageSize> From<MemoryAddress> for MemoryPage<S> {
    #[inline]
    fn from(addr: MemoryAddress) -> Self {
        Self::from_addr(addr)
    }
}

impl<S: PageSize> From<MemoryAddress> for MemoryAddressOffset<S> {
    #[inline]
    fn from(addr: MemoryAddress) -> Self {
        Self::from_addr(addr)
    }
}

/// Virtual memory address.
///
/// A thin wrapper around [`MemoryAddress`] that denotes **virtual** addresses.
/// It only carries the *kind* of address at the type level so you don't
/// accidentally mix virtual and physical values.
///
/// ### Semantics
/// - Use [`VirtualAddress::page`] / [`VirtualAddress::offset`] /
///   [`VirtualAddress::split`] to derive the page base and the in-page offset
///   for a concrete [`PageSize`].
/// - `page::<Size4M>()` truncates to the segment boundary of the containing
///   upper-level table slot.
///
/// ### Examples
/// ```rust
/// # use kernel_memory_addresses::*;
/// let va = VirtualAddress::new(0x00D4_1234);
/// let (vp, off) = va.split::<Size4K>();
/// assert_eq!(vp.base().as_u32() & (Size4K::SIZE - 1), 0);
/// assert_eq!(vp.join(off).as_u32(), va.as_u32());
/// ```
#[repr(transparent)]
#[derive(Copy, Clone, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct VirtualAddress(MemoryAddress);

impl VirtualAddress {
    #[inline]
    #[must_use]
    pub const fn new(v: u32) -> Self {
        Self(MemoryAddress::new(v))
    }

    #[inline]
    #[must_use]
    pub const fn zero() -> Self {
        Self::new(0)
    }

    #[inline]
    #[must_use]
    pub const fn as_u32(self) -> u32 {
        self.0.as_u32()
    }

    #[inline]
    #[must_use]
    pub const fn as_usize(self) -> usize {
        self.0.as_usize()
    }

    #[inline]
    #[must_use]
    pub const fn page<S: PageSize>(self) -> VirtualPage<S> {
        VirtualPage::<S>(self.0.page::<S>())
    }

    #[inline]
    #[must_use]
    pub const fn offset<S: PageSize>(self) -> MemoryAddressOffset<S> {
        self.0.offset::<S>()
    }

    #[inline]
    #[must_use]
    pub const fn split<S: PageSize>(self) -> (VirtualPage<S>, MemoryAddressOffset<S>) {
        (self.page::<S>(), self.offset::<S>())
    }

    #[inline]
    #[must_use]
    pub const fn align_down<S: PageSize>(self) -> Self {
        Self(self.0.align_down::<S>())
    }

    #[inline]
    #[must_use]
    pub const fn align_up<S: PageSize>(self) -> Self {
        Self(self.0.align_up::<S>())
    }

    #[inline]
    #[must_use]
    pub const fn is_aligned<S: PageSize>(self) -> bool {
        self.0.is_aligned::<S>()
    }
}

impl fmt::Debug for VirtualAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VA(0x{:08X})", self.as_u32())
    }
}

impl fmt::Display for VirtualAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:08X}", self.as_u32())
    }
}

impl Add<u32> for VirtualAddress {
    type Output = Self;
    #[inline]
    fn add(self, rhs: u32) -> Self::Output {
        Self(self.0 + rhs)
    }
}

impl AddAssign<u32> for VirtualAddress {
    #[inline]
    fn add_assign(&mut self, rhs: u32) {
        self.0 += rhs;
    }
}

impl Sub for VirtualAddress {
    type Output = u32;
    #[inline]
    fn sub(self, rhs: Self) -> u32 {
        self.0 - rhs.0
    }
}

impl Sub<u32> for VirtualAddress {
    type Output = Self;
    #[inline]
    fn sub(self, rhs: u32) -> Self::Output {
        Self(self.0 - rhs)
    }
}

/// Physical memory address.
///
/// A thin wrapper around [`MemoryAddress`] that denotes **physical** addresses
/// (RAM or device registers). Like [`VirtualAddress`], this type carries intent
/// and prevents accidental VA↔PA mix-ups.
///
/// ### Notes
/// - Translation entries store a **page-aligned** physical base (low
///   [`Size4K::SHIFT`] bits cleared) plus per-entry flag bits; use
///   `split::<Size4K>()` to reason about base vs. offset explicitly.
/// - [`page_number`](Self::page_number) and
///   [`from_page_number`](Self::from_page_number) convert to and from the
///   machine-independent page-frame numbering.
///
/// ### Examples
/// ```rust
/// # use kernel_memory_addresses::*;
/// let pa = PhysicalAddress::new(0x0010_2042);
/// let (pp, off) = pa.split::<Size4K>();
/// assert_eq!(pp.join(off).as_u32(), pa.as_u32());
/// assert_eq!(pa.page_number(), 0x102);
/// ```
#[repr(transparent)]
#[derive(Copy, Clone, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct PhysicalAddress(MemoryAddress);

impl PhysicalAddress {
    #[inline]
    #[must_use]
    pub const fn new(v: u32) -> Self {
        Self(MemoryAddress::new(v))
    }

    #[inline]
    #[must_use]
    pub const fn zero() -> Self {
        Self::new(0)
    }

    #[inline]
    #[must_use]
    pub const fn as_u32(self) -> u32 {
        self.0.as_u32()
    }

    #[inline]
    #[must_use]
    pub const fn as_usize(self) -> usize {
        self.0.as_usize()
    }

    #[inline]
    #[must_use]
    pub const fn page<S: PageSize>(self) -> PhysicalPage<S> {
        PhysicalPage::<S>(self.0.page::<S>())
    }

    #[inline]
    #[must_use]
    pub const fn offset<S: PageSize>(self) -> MemoryAddressOffset<S> {
        self.0.offset::<S>()
    }

    #[inline]
    #[must_use]
    pub const fn split<S: PageSize>(self) -> (PhysicalPage<S>, MemoryAddressOffset<S>) {
        (self.page::<S>(), self.offset::<S>())
    }

    #[inline]
    #[must_use]
    pub const fn align_down<S: PageSize>(self) -> Self {
        Self(self.0.align_down::<S>())
    }

    #[inline]
    #[must_use]
    pub const fn align_up<S: PageSize>(self) -> Self {
        Self(self.0.align_up::<S>())
    }

    #[inline]
    #[must_use]
    pub const fn is_aligned<S: PageSize>(self) -> bool {
        self.0.is_aligned::<S>()
    }

    /// The machine-independent page-frame number of the containing page.
    #[inline]
    #[must_use]
    pub const fn page_number(self) -> u32 {
        self.as_u32() >> Size4K::SHIFT
    }

    /// Physical base address of page-frame number `pn`.
    #[inline]
    #[must_use]
    pub const fn from_page_number(pn: u32) -> Self {
        Self::new(pn << Size4K::SHIFT)
    }
}

impl fmt::Debug for PhysicalAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PA(0x{:08X})", self.as_u32())
    }
}

impl fmt::Display for PhysicalAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:08X}", self.as_u32())
    }
}

impl Add<u32> for PhysicalAddress {
    type Output = Self;
    #[inline]
    fn add(self, rhs: u32) -> Self::Output {
        Self(self.0 + rhs)
    }
}

impl AddAssign<u32> for PhysicalAddress {
    #[inline]
    fn add_assign(&mut self, rhs: u32) {
        self.0 += rhs;
    }
}

impl Sub for PhysicalAddress {
    type Output = u32;
    #[inline]
    fn sub(self, rhs: Self) -> u32 {
        self.0 - rhs.0
    }
}

impl Sub<u32> for PhysicalAddress {
    type Output = Self;
    #[inline]
    fn sub(self, rhs: u32) -> Self::Output {
        Self(self.0 - rhs)
    }
}

/// Virtual memory page base for size `S`.
///
/// A `VirtualPage<S>` represents the **aligned base** of a virtual granule of
/// size `S`. It is a thin wrapper over [`MemoryPage<S>`] with virtual-address
/// intent.
///
/// ### Invariants
/// - The low `S::SHIFT` bits of the base are always zero.
#[repr(transparent)]
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct VirtualPage<S: PageSize>(MemoryPage<S>);

impl<S: PageSize> VirtualPage<S> {
    #[inline]
    #[must_use]
    pub const fn from_page(p: MemoryPage<S>) -> Self {
        Self(p)
    }

    /// Page that contains `addr` (aligns down to the granule boundary).
    #[inline]
    #[must_use]
    pub const fn containing_address(addr: VirtualAddress) -> Self {
        Self(MemoryPage::<S>::containing(addr.as_u32()))
    }

    #[inline]
    #[must_use]
    pub const fn base(self) -> VirtualAddress {
        VirtualAddress(self.0.base())
    }

    #[inline]
    #[must_use]
    pub const fn join(self, off: MemoryAddressOffset<S>) -> VirtualAddress {
        VirtualAddress(self.0.join(off))
    }
}

impl<S> fmt::Display for VirtualPage<S>
where
    S: PageSize,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl<S: PageSize> fmt::Debug for VirtualPage<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "VirtualPage<{}>({:#010X})",
            core::any::type_name::<S>(),
            self.0.base().as_u32()
        )
    }
}

/// Physical memory page base for size `S`.
///
/// A `PhysicalPage<S>` represents the **aligned base** of a physical granule
/// of size `S`. It is a thin wrapper over [`MemoryPage<S>`] with
/// physical-address intent.
///
/// ### Invariants
/// - The low `S::SHIFT` bits of the base are always zero.
#[repr(transparent)]
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct PhysicalPage<S: PageSize>(MemoryPage<S>);

impl<S: PageSize> PhysicalPage<S> {
    #[inline]
    #[must_use]
    pub const fn from_addr(p: PhysicalAddress) -> Self {
        Self::from_page(MemoryPage::from_addr(p.0))
    }

    #[inline]
    #[must_use]
    pub const fn from_page(p: MemoryPage<S>) -> Self {
        Self(p)
    }

    #[inline]
    #[must_use]
    pub const fn base(self) -> PhysicalAddress {
        PhysicalAddress(self.0.base())
    }

    #[inline]
    #[must_use]
    pub const fn join(self, off: MemoryAddressOffset<S>) -> PhysicalAddress {
        PhysicalAddress(self.0.join(off))
    }
}

impl<S> fmt::Display for PhysicalPage<S>
where
    S: PageSize,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl<S: PageSize> fmt::Debug for PhysicalPage<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "PhysicalPage<{}>({:#010X})",
            core::any::type_name::<S>(),
            self.0.base().as_u32()
        )
    }
}

impl From<u32> for MemoryAddress {
    #[inline]
    fn from(v: u32) -> Self {
        Self::new(v)
    }
}

impl From<MemoryAddress> for u32 {
    #[inline]
    fn from(a: MemoryAddress) -> Self {
        a.as_u32()
    }
}

impl From<u32> for VirtualAddress {
    #[inline]
    fn from(v: u32) -> Self {
        Self::new(v)
    }
}

impl<S> From<VirtualPage<S>> for VirtualAddress
where
    S: PageSize,
{
    fn from(value: VirtualPage<S>) -> Self {
        value.base()
    }
}

impl From<u32> for PhysicalAddress {
    #[inline]
    fn from(v: u32) -> Self {
        Self::new(v)
    }
}

impl<S> From<PhysicalPage<S>> for PhysicalAddress
where
    S: PageSize,
{
    fn from(value: PhysicalPage<S>) -> Self {
        value.base()
    }
}
