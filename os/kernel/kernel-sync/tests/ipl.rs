use kernel_sync::{Ipl, IplGuard, current_ipl};
use std::sync::{Mutex, MutexGuard, OnceLock};

// The emulated status register is process-global, so tests that touch it
// must not overlap.
fn serialize() -> MutexGuard<'static, ()> {
    static GATE: OnceLock<Mutex<()>> = OnceLock::new();
    GATE.get_or_init(|| Mutex::new(()))
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
}

#[test]
fn raise_and_restore() {
    let _gate = serialize();

    assert_eq!(current_ipl(), Ipl::None);
    {
        let g = IplGuard::vm();
        assert_eq!(current_ipl(), Ipl::Vm);
        assert_eq!(g.saved(), Ipl::None);
    }
    assert_eq!(current_ipl(), Ipl::None);
}

#[test]
fn guards_nest_and_unwind_in_order() {
    let _gate = serialize();

    let outer = IplGuard::raise(Ipl::Bio);
    assert_eq!(current_ipl(), Ipl::Bio);
    {
        let inner = IplGuard::vm();
        assert_eq!(current_ipl(), Ipl::Vm);
        assert_eq!(inner.saved(), Ipl::Bio);
    }
    // inner drop must bring us back to the outer level, not to zero
    assert_eq!(current_ipl(), Ipl::Bio);
    drop(outer);
    assert_eq!(current_ipl(), Ipl::None);
}

#[test]
fn raise_never_lowers() {
    let _gate = serialize();

    let high = IplGuard::raise(Ipl::High);
    {
        let _vm = IplGuard::vm();
        // already above Vm; the inner guard must not drop the mask
        assert_eq!(current_ipl(), Ipl::High);
    }
    assert_eq!(current_ipl(), Ipl::High);
    drop(high);
    assert_eq!(current_ipl(), Ipl::None);
}

#[test]
fn level_ordering_matches_hardware_numbers() {
    assert!(Ipl::None < Ipl::Soft);
    assert!(Ipl::Bio < Ipl::Vm);
    assert!(Ipl::Vm < Ipl::High);
    assert_eq!(Ipl::Vm.sr_bits(), 0x0600);
    assert_eq!(Ipl::from_sr(0x2700), Ipl::High);
    assert_eq!(Ipl::from_sr(0x2000), Ipl::None);
}
