//! Interrupt priority masking.
//!
//! The m68k reports its interrupt priority level (IPL) in bits 8..=10 of the
//! status register. An interrupt is delivered only when its level is above the
//! current IPL, so raising the IPL to `n` masks every source at or below `n`.
//! The mapping layer brackets each read-modify-write of shared mapping state
//! with [`IplGuard::vm`] so that interrupt-driven mapping updates cannot
//! interleave with it.
//!
//! # Platform
//!
//! On the m68k target the helpers access the status register directly. On any
//! other target the register is emulated by a process-global atomic image so
//! the masking discipline can be exercised by hosted tests.
//!
//! # Safety & Privilege
//!
//! `move` from or to the SR is privileged on the 68010 and later; this code
//! assumes supervisor mode, which holds for all kernel code.

use core::fmt;

/// Bits 8..=10 of the status register hold the priority mask.
const SR_IPL_MASK: u16 = 0x0700;

/// Interrupt priority levels, lowest to highest.
///
/// The discriminants are the hardware priority numbers written to the
/// status-register mask field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum Ipl {
    /// All maskable interrupts admitted.
    None = 0,
    /// Soft interrupt dispatch.
    Soft = 1,
    /// Block I/O controllers.
    Bio = 2,
    /// Network interfaces.
    Net = 3,
    /// Serial hardware.
    Tty = 4,
    /// Scheduling clock.
    Clock = 5,
    /// Mapping updates. Masks every source that may call back into the
    /// physical map layer.
    Vm = 6,
    /// Masks everything the hardware allows.
    High = 7,
}

impl Ipl {
    /// Priority encoded in a status-register image.
    #[must_use]
    pub const fn from_sr(sr: u16) -> Self {
        match (sr & SR_IPL_MASK) >> 8 {
            0 => Self::None,
            1 => Self::Soft,
            2 => Self::Bio,
            3 => Self::Net,
            4 => Self::Tty,
            5 => Self::Clock,
            6 => Self::Vm,
            _ => Self::High,
        }
    }

    /// This level positioned in the status-register mask field.
    #[must_use]
    pub const fn sr_bits(self) -> u16 {
        (self as u16) << 8
    }
}

impl fmt::Display for Ipl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ipl{}", *self as u8)
    }
}

/// Scoped priority raise.
///
/// Taking the guard raises the current priority to at least the requested
/// level; dropping it restores the status register captured at entry. Guards
/// nest, each one restores what it saw.
#[must_use = "the priority drops back when the guard is dropped"]
pub struct IplGuard {
    saved: u16,
}

impl IplGuard {
    /// Raise to at least `ipl`. Never lowers the current priority.
    pub fn raise(ipl: Ipl) -> Self {
        let saved = read_sr();
        if Ipl::from_sr(saved) < ipl {
            write_sr((saved & !SR_IPL_MASK) | ipl.sr_bits());
        }
        Self { saved }
    }

    /// Exclusive section for mapping updates.
    pub fn vm() -> Self {
        Self::raise(Ipl::Vm)
    }

    /// Priority that was in effect when the guard was taken.
    #[must_use]
    pub fn saved(&self) -> Ipl {
        Ipl::from_sr(self.saved)
    }
}

impl Drop for IplGuard {
    fn drop(&mut self) {
        write_sr(self.saved);
    }
}

/// Priority currently in effect.
#[must_use]
pub fn current_ipl() -> Ipl {
    Ipl::from_sr(read_sr())
}

#[cfg(target_arch = "m68k")]
#[inline(always)]
fn read_sr() -> u16 {
    let sr: u16;
    unsafe {
        core::arch::asm!(
            "move.w %sr, {0}",
            out(reg_data) sr,
            options(nomem, nostack, preserves_flags)
        );
    }
    sr
}

#[cfg(target_arch = "m68k")]
#[inline(always)]
fn write_sr(sr: u16) {
    // Writing the SR also replaces the condition codes; callers only ever
    // restore an image captured by `read_sr`.
    unsafe {
        core::arch::asm!("move.w {0}, %sr", in(reg_data) sr, options(nomem, nostack));
    }
}

/// Hosted stand-in for the status register. Starts with the supervisor bit
/// set and the mask at zero, like the kernel after interrupt setup.
#[cfg(not(target_arch = "m68k"))]
static SR_IMAGE: core::sync::atomic::AtomicU16 = core::sync::atomic::AtomicU16::new(0x2000);

#[cfg(not(target_arch = "m68k"))]
fn read_sr() -> u16 {
    SR_IMAGE.load(core::sync::atomic::Ordering::SeqCst)
}

#[cfg(not(target_arch = "m68k"))]
fn write_sr(sr: u16) {
    SR_IMAGE.store(sr, core::sync::atomic::Ordering::SeqCst);
}
