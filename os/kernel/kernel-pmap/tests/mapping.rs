mod common;

use common::{KPT_TOP_VA, MmuEvent, PT_BASE, WINDOW_BASE, boot, data_frame, pa, va};
use kernel_pmap::{MmuVariant, PmapRef, Protection};

/// A kernel page in the head segment, whose table exists from bootstrap.
const KVA: u32 = WINDOW_BASE + 0x0006_0000;

#[test]
fn mappings_round_trip_through_extract() {
    let mut sys = boot(MmuVariant::Mc68030);
    let k = PmapRef::kernel();
    let resident = sys.resident_count(&k);

    sys.enter(&k, va(KVA), data_frame(0), Protection::ALL, false);
    assert_eq!(sys.extract(&k, va(KVA)), Some(data_frame(0)));
    assert_eq!(sys.extract(&k, va(KVA + 0x0123)), Some(data_frame(0) + 0x0123));
    assert_eq!(sys.extract(&k, va(KVA + 0x1000)), None);
    assert_eq!(sys.resident_count(&k), resident + 1);
    assert_eq!(sys.mapping_count(data_frame(0)), 1);

    let info = sys.probe(&k, va(KVA)).unwrap();
    assert_eq!(info.pa, data_frame(0));
    assert!(!info.wired && !info.write_protected);
    assert!(!info.cache_inhibited && !info.copyback);

    sys.remove(&k, va(KVA), va(KVA + 0x1000));
    assert_eq!(sys.extract(&k, va(KVA)), None);
    assert_eq!(sys.mapping_count(data_frame(0)), 0);
    assert_eq!(sys.resident_count(&k), resident);

    // a second pass over the same range is a complete no-op
    sys.hardware().clear();
    sys.remove(&k, va(KVA), va(KVA + 0x1000));
    assert!(sys.hardware().take().is_empty());
    assert_eq!(sys.resident_count(&k), resident);
}

#[test]
fn wiring_changes_are_silent_and_counted() {
    let mut sys = boot(MmuVariant::Mc68030);
    let k = PmapRef::kernel();
    let wired = sys.wired_count(&k);

    sys.enter(&k, va(KVA), data_frame(1), Protection::ALL, true);
    assert_eq!(sys.wired_count(&k), wired + 1);
    sys.hardware().clear();

    // same frame, wiring drops: the entry is rewritten, nothing flushed
    sys.enter(&k, va(KVA), data_frame(1), Protection::ALL, false);
    assert_eq!(sys.wired_count(&k), wired);
    assert!(!sys.probe(&k, va(KVA)).unwrap().wired);
    assert!(sys.hardware().take().is_empty());
    assert_eq!(sys.mapping_count(data_frame(1)), 1, "no reverse-map churn");

    sys.change_wiring(&k, va(KVA), true);
    assert_eq!(sys.wired_count(&k), wired + 1);
    assert!(sys.probe(&k, va(KVA)).unwrap().wired);
    assert!(sys.hardware().take().is_empty());

    // unmapped addresses are noted and dropped
    sys.change_wiring(&k, va(KVA + 0x3000), true);
    assert_eq!(sys.wired_count(&k), wired + 1);
}

#[test]
fn replacing_a_mapping_unlinks_the_old_frame() {
    let mut sys = boot(MmuVariant::Mc68030);
    let k = PmapRef::kernel();

    sys.enter(&k, va(KVA), data_frame(2), Protection::ALL, false);
    let resident = sys.resident_count(&k);
    sys.hardware().clear();

    sys.enter(&k, va(KVA), data_frame(3), Protection::ALL, false);
    assert_eq!(sys.extract(&k, va(KVA)), Some(data_frame(3)));
    assert_eq!(sys.mapping_count(data_frame(2)), 0);
    assert_eq!(sys.mapping_count(data_frame(3)), 1);
    assert_eq!(sys.resident_count(&k), resident);
    assert!(sys.hardware().take().contains(&MmuEvent::FlushPage(KVA)));

    // the old frame left no access history behind
    assert!(!sys.is_modified(data_frame(2)));
    assert!(!sys.is_referenced(data_frame(2)));
}

#[test]
fn shared_frames_chain_across_spaces() {
    let mut sys = boot(MmuVariant::Mc68030);
    let k = PmapRef::kernel();
    let u = sys.create(0).unwrap();
    let f = data_frame(8);

    sys.enter(&k, va(KVA), f, Protection::ALL, false);
    sys.enter(&u, va(0x0000_5000), f, Protection::READ, false);
    assert_eq!(sys.mapping_count(f), 2);

    // dropping one alias leaves the other untouched
    sys.remove(&k, va(KVA), va(KVA + 0x1000));
    assert_eq!(sys.mapping_count(f), 1);
    assert_eq!(sys.extract(&u, va(0x0000_5000)), Some(f));
    assert!(sys.probe(&u, va(0x0000_5000)).unwrap().write_protected);

    sys.remove(&u, va(0x0000_5000), va(0x0000_6000));
    assert_eq!(sys.mapping_count(f), 0);
    sys.release(u);
}

#[test]
fn unmanaged_frames_are_uncached_and_unchained() {
    let mut sys = boot(MmuVariant::Mc68030);
    let k = PmapRef::kernel();
    let dev = pa(0x00F8_0000); // outside every bank

    sys.enter(&k, va(KVA), dev, Protection::ALL, false);
    let info = sys.probe(&k, va(KVA)).unwrap();
    assert!(info.cache_inhibited);
    assert_eq!(sys.mapping_count(dev), 0, "device frames are not chained");

    // cache inhibition survives a protection change on the same frame
    sys.enter(&k, va(KVA), dev, Protection::READ, false);
    let info = sys.probe(&k, va(KVA)).unwrap();
    assert!(info.cache_inhibited && info.write_protected);

    sys.remove(&k, va(KVA), va(KVA + 0x1000));
    assert_eq!(sys.extract(&k, va(KVA)), None);
    assert!(!sys.is_modified(dev) && !sys.is_referenced(dev));
}

#[test]
fn removing_nothing_touches_nothing() {
    let mut sys = boot(MmuVariant::Mc68030);
    let k = PmapRef::kernel();
    let free = sys.free_pages();
    sys.hardware().clear();

    // a realized segment with no mapping in the range
    sys.remove(&k, va(KVA), va(KVA + 0x8000));
    // a kernel segment with no page table at all
    sys.remove(&k, va(0x0080_0000), va(0x0084_0000));
    // a user space that never mapped anything
    let u = sys.create(0).unwrap();
    sys.remove(&u, va(0), va(0x0010_0000));

    assert!(sys.hardware().take().is_empty());
    assert_eq!(sys.free_pages(), free);
    sys.release(u);
}

#[test]
fn page_copies_and_zeroing_leave_no_trace() {
    let mut sys = boot(MmuVariant::Mc68030);
    let k = PmapRef::kernel();
    let (src, dst) = (data_frame(4), data_frame(5));
    sys.mapper().write_byte(src, 0xC3);
    sys.mapper().write_byte(src + 0x0FFF, 0x3C);
    sys.mapper().write_byte(dst, 0xFF);
    let resident = sys.resident_count(&k);

    sys.copy_page(src, dst);
    assert_eq!(sys.mapper().read_byte(dst), 0xC3);
    assert_eq!(sys.mapper().read_byte(dst + 0x0FFF), 0x3C);
    assert_eq!(sys.mapper().read_byte(src), 0xC3, "source undisturbed");

    sys.zero_page(src);
    assert_eq!(sys.mapper().read_byte(src), 0);
    assert_eq!(sys.mapper().read_byte(src + 0x0FFF), 0);
    assert_eq!(sys.mapper().read_byte(dst), 0xC3, "copy survives the zeroing");

    // the scratch mappings are gone and the counters settled
    assert_eq!(sys.resident_count(&k), resident);
    assert_eq!(sys.mapping_count(src), 0);
    assert_eq!(sys.mapping_count(dst), 0);
}

#[test]
fn user_translations_flush_only_while_active() {
    let mut sys = boot(MmuVariant::Mc68030);
    let u = sys.create(0).unwrap();
    let uva = va(0x0000_3000);

    // inactive: only the kernel-side table plumbing is flushed, first the
    // pooled page backing the window segment, then the table page itself
    sys.enter(&u, uva, data_frame(6), Protection::ALL, false);
    assert_eq!(
        sys.hardware().take(),
        vec![
            MmuEvent::FlushPage(KPT_TOP_VA),
            MmuEvent::FlushPage(PT_BASE)
        ]
    );

    // second mapping in the segment: no hardware traffic at all
    sys.enter(&u, va(0x0000_5000), data_frame(7), Protection::ALL, false);
    assert!(sys.hardware().take().is_empty());

    sys.activate(&u);
    let ev = sys.hardware().take();
    assert!(ev.iter().any(|e| matches!(e, MmuEvent::LoadRoot(_))));
    assert!(ev.contains(&MmuEvent::FlushAll));

    // active: the user page itself is flushed on removal
    sys.remove(&u, uva, uva + 0x1000);
    assert!(sys.hardware().take().contains(&MmuEvent::FlushPage(0x0000_3000)));

    sys.remove(&u, va(0x0000_5000), va(0x0000_6000));
    sys.deactivate(&u);
    sys.release(u);
}
