//! Shared fixtures: a heap-backed physical bank and a hardware recorder.

#![allow(dead_code)]

use std::alloc::{Layout, alloc_zeroed};
use std::cell::RefCell;

use kernel_pmap::{
    BootstrapError, BootstrapLayout, MmuHardware, MmuVariant, PhysMapper, PhysRange,
    PhysicalAddress, PmapSystem, VirtualAddress,
};

/// The simulated RAM bank: two megabytes, 512 page frames.
pub const RAM_BASE: u32 = 0x0010_0000;
pub const RAM_END: u32 = 0x0030_0000;

/// The kernel virtual window handed to [`boot`].
pub const WINDOW_BASE: u32 = 0x0040_0000;
pub const WINDOW_END: u32 = 0x0180_0000;

// Derived facts about that window with one bootstrap segment and two user
// spaces. The tests lean on these, so they are spelled out once here.
pub const PT_BASE: u32 = 0x00C0_0000;
pub const KPT_BASE: u32 = 0x017E_C000;
pub const KPT_PAGES: u32 = 18;
/// The pool is a stack, so the highest pooled address is claimed first.
pub const KPT_TOP_VA: u32 = KPT_BASE + (KPT_PAGES - 1) * 0x1000;
/// Bootstrap draws the kernel segment table first, the shared empty one
/// second.
pub const KERNEL_STAB_PA: u32 = RAM_BASE;
pub const SEG_ZERO_PA: u32 = RAM_BASE + 0x1000;

/// Heap-backed stand-in for the physical bank, handed out as raw frames.
pub struct TestMemory {
    base: u32,
    len: u32,
    mem: *mut u8,
}

impl TestMemory {
    pub fn new(base: u32, len: u32) -> Self {
        let layout = Layout::from_size_align(usize::try_from(len).unwrap(), 0x1000).unwrap();
        let mem = unsafe { alloc_zeroed(layout) };
        assert!(!mem.is_null(), "test bank allocation failed");
        Self { base, len, mem }
    }

    fn offset(&self, pa: PhysicalAddress, len: u32) -> usize {
        let off = pa
            .as_u32()
            .checked_sub(self.base)
            .filter(|&o| u64::from(o) + u64::from(len) <= u64::from(self.len));
        let Some(off) = off else {
            panic!("access at {pa} outside the test bank");
        };
        usize::try_from(off).unwrap()
    }

    pub fn read_byte(&self, pa: PhysicalAddress) -> u8 {
        unsafe { *self.mem.add(self.offset(pa, 1)) }
    }

    pub fn write_byte(&self, pa: PhysicalAddress, value: u8) {
        unsafe { *self.mem.add(self.offset(pa, 1)) = value };
    }
}

impl PhysMapper for TestMemory {
    unsafe fn phys_to_mut<'a, T>(&self, phys: PhysicalAddress) -> &'a mut T {
        let len = u32::try_from(size_of::<T>()).unwrap();
        let off = self.offset(phys, len);
        unsafe { &mut *self.mem.add(off).cast::<T>() }
    }
}

/// One recorded TLB or cache operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MmuEvent {
    FlushPage(u32),
    FlushAll,
    PushData(u32),
    PurgeInst(u32),
    LoadRoot(u32),
}

/// Hardware seam that records every operation in order.
#[derive(Default)]
pub struct RecordingMmu {
    events: RefCell<Vec<MmuEvent>>,
}

impl RecordingMmu {
    /// Drain everything recorded so far.
    pub fn take(&self) -> Vec<MmuEvent> {
        self.events.take()
    }

    /// Forget everything recorded so far.
    pub fn clear(&self) {
        self.events.borrow_mut().clear();
    }
}

impl MmuHardware for RecordingMmu {
    fn invalidate_page(&self, va: VirtualAddress) {
        self.events.borrow_mut().push(MmuEvent::FlushPage(va.as_u32()));
    }

    fn invalidate_all(&self) {
        self.events.borrow_mut().push(MmuEvent::FlushAll);
    }

    fn push_data_page(&self, pa: PhysicalAddress) {
        self.events.borrow_mut().push(MmuEvent::PushData(pa.as_u32()));
    }

    fn purge_inst_page(&self, pa: PhysicalAddress) {
        self.events.borrow_mut().push(MmuEvent::PurgeInst(pa.as_u32()));
    }

    fn load_root(&self, pa: PhysicalAddress) {
        self.events.borrow_mut().push(MmuEvent::LoadRoot(pa.as_u32()));
    }
}

/// The machine description every test uses: one bank, one bootstrap
/// segment, room for two user spaces.
pub fn layout(variant: MmuVariant) -> BootstrapLayout {
    BootstrapLayout {
        variant,
        ranges: vec![PhysRange::new(pa(RAM_BASE), pa(RAM_END))],
        window_base: va(WINDOW_BASE),
        window_end: va(WINDOW_END),
        bootstrap_segments: 1,
        max_address_spaces: 2,
    }
}

/// Bootstrap over a fresh bank.
pub fn try_boot(l: BootstrapLayout) -> Result<PmapSystem<TestMemory, RecordingMmu>, BootstrapError> {
    let mem = TestMemory::new(RAM_BASE, RAM_END - RAM_BASE);
    PmapSystem::bootstrap(l, mem, RecordingMmu::default())
}

/// A bootstrapped system that has not yet run `init`.
pub fn boot_only(variant: MmuVariant) -> PmapSystem<TestMemory, RecordingMmu> {
    let Ok(sys) = try_boot(layout(variant)) else {
        panic!("bootstrap rejected the standard test layout");
    };
    sys
}

/// A fully initialized system with the event history cleared.
pub fn boot(variant: MmuVariant) -> PmapSystem<TestMemory, RecordingMmu> {
    let mut sys = boot_only(variant);
    sys.init();
    sys.hardware().clear();
    sys
}

pub const fn va(v: u32) -> VirtualAddress {
    VirtualAddress::new(v)
}

pub const fn pa(v: u32) -> PhysicalAddress {
    PhysicalAddress::new(v)
}

/// Frames near the top of the bank, clear of everything the cursor hands
/// out during a test.
pub const fn data_frame(n: u32) -> PhysicalAddress {
    assert!(n < 64);
    PhysicalAddress::new(RAM_END - 0x0004_0000 + (n << 12))
}
