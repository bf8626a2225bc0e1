//! # Kernel Synchronization Primitives
//!
//! Exclusive-section support for a uniprocessor m68k kernel. There is no
//! other processor to exclude, only interrupt handlers, so the one primitive
//! the mapping layer needs is priority masking: raise the CPU interrupt
//! priority, do the critical work, restore on scope exit.
//!
//! See [`IplGuard`] for the RAII wrapper and [`Ipl`] for the level lattice.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![cfg_attr(target_arch = "m68k", feature(asm_experimental_arch))]

pub mod ipl;

pub use ipl::{Ipl, IplGuard, current_ipl};
