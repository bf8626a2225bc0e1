mod common;

use common::{KPT_TOP_VA, MmuEvent, PT_BASE, SEG_ZERO_PA, WINDOW_BASE, boot, data_frame, va};
use kernel_pmap::{MmuVariant, PmapRef, Protection};

/// A kernel page in the head segment, whose table exists from bootstrap.
const KVA: u32 = WINDOW_BASE + 0x0006_0000;

#[test]
fn user_tables_grow_and_reclaim() {
    let mut sys = boot(MmuVariant::Mc68030);
    let u = sys.create(0).unwrap();
    let baseline = sys.free_pages();

    // the first mapping realizes the segment table and one page table page
    sys.enter(&u, va(0x0000_2000), data_frame(0), Protection::ALL, false);
    assert_eq!(sys.free_pages(), baseline - 2);

    // a second page in the same segment reuses both
    sys.enter(&u, va(0x0000_5000), data_frame(1), Protection::ALL, false);
    assert_eq!(sys.free_pages(), baseline - 2);
    assert!(sys.verify_table_count(va(PT_BASE)));

    // the table stands as long as one entry lives in it
    sys.remove(&u, va(0x0000_2000), va(0x0000_3000));
    assert_eq!(sys.free_pages(), baseline - 2);
    assert!(sys.verify_table_count(va(PT_BASE)));

    // the last removal reclaims the page table and the segment table
    sys.remove(&u, va(0x0000_5000), va(0x0000_6000));
    assert_eq!(sys.free_pages(), baseline);
    assert_eq!(sys.extract(&u, va(0x0000_5000)), None);
    assert_eq!(sys.resident_count(&u), 0);

    // the space is still usable afterwards
    sys.enter(&u, va(0x0000_2000), data_frame(0), Protection::ALL, false);
    assert_eq!(sys.free_pages(), baseline - 2);
    sys.remove(&u, va(0), va(0x0040_0000));
    assert_eq!(sys.free_pages(), baseline);
    sys.release(u);
}

#[test]
fn removal_crosses_segment_boundaries() {
    let mut sys = boot(MmuVariant::Mc68030);
    let u = sys.create(0).unwrap();
    let baseline = sys.free_pages();
    sys.enter(&u, va(0x003F_F000), data_frame(2), Protection::ALL, false);
    sys.enter(&u, va(0x0040_0000), data_frame(3), Protection::ALL, false);
    assert_eq!(
        sys.free_pages(),
        baseline - 3,
        "two page tables behind one segment table"
    );

    // one call walks both segments and tears down whatever it empties
    sys.remove(&u, va(0x003F_F000), va(0x0040_1000));
    assert_eq!(sys.extract(&u, va(0x003F_F000)), None);
    assert_eq!(sys.extract(&u, va(0x0040_0000)), None);
    assert_eq!(sys.free_pages(), baseline);
    sys.release(u);
}

#[test]
fn activation_and_growth_reload_the_root() {
    let mut sys = boot(MmuVariant::Mc68030);
    let u = sys.create(0).unwrap();

    // an empty space runs on the shared all-invalid segment table
    sys.activate(&u);
    let ev = sys.hardware().take();
    assert!(ev.contains(&MmuEvent::LoadRoot(SEG_ZERO_PA)));
    assert!(ev.contains(&MmuEvent::FlushAll));

    // realizing the private segment table while active reloads the root
    sys.enter(&u, va(0x0000_2000), data_frame(4), Protection::ALL, false);
    let ev = sys.hardware().take();
    let root = ev.iter().find_map(|e| match e {
        MmuEvent::LoadRoot(r) => Some(*r),
        _ => None,
    });
    assert!(root.is_some_and(|r| r != SEG_ZERO_PA));
    assert!(ev.contains(&MmuEvent::FlushAll));

    // tearing the last segment down falls back to the shared table
    sys.remove(&u, va(0), va(0x0040_0000));
    let ev = sys.hardware().take();
    assert!(ev.contains(&MmuEvent::LoadRoot(SEG_ZERO_PA)));
    sys.deactivate(&u);

    // inactive growth swaps the table silently
    sys.enter(&u, va(0x0000_2000), data_frame(4), Protection::ALL, false);
    let ev = sys.hardware().take();
    assert!(!ev.iter().any(|e| matches!(e, MmuEvent::LoadRoot(_))));

    // the private root arrives with the next activation
    sys.activate(&u);
    let ev = sys.hardware().take();
    assert!(
        ev.iter()
            .any(|e| matches!(e, MmuEvent::LoadRoot(r) if *r != SEG_ZERO_PA))
    );

    // activating the space it already runs on is quiet
    sys.activate(&u);
    assert!(sys.hardware().take().is_empty());

    sys.remove(&u, va(0), va(0x0040_0000));
    sys.deactivate(&u);
    sys.release(u);
}

#[test]
fn kernel_growth_draws_from_the_pool() {
    let mut sys = boot(MmuVariant::Mc68030);
    let k = PmapRef::kernel();
    let u = sys.create(0).unwrap();
    let baseline = sys.free_pages();

    // growth beyond the bootstrap tables is served from the pool
    let gva = va(0x0080_3000);
    sys.enter(&k, gva, data_frame(5), Protection::ALL, false);
    assert_eq!(sys.extract(&k, gva), Some(data_frame(5)));
    assert_eq!(sys.free_pages(), baseline, "pool pages are preallocated");

    // the drafted pool page stays visible at its window address
    let pool_va = va(KPT_TOP_VA);
    assert!(sys.extract(&k, pool_va).is_some());

    // collect spots the emptied table and pools it again
    sys.remove(&k, gva, gva + 0x1000);
    sys.hardware().clear();
    assert_eq!(sys.collect(&k), 0, "nothing goes back to the frame source");
    let ev = sys.hardware().take();
    assert!(ev.contains(&MmuEvent::FlushPage(KPT_TOP_VA)));
    assert_eq!(sys.collect(&u), 0, "user spaces are not collected");

    // the pooled page serves the next growth
    sys.enter(&k, gva, data_frame(5), Protection::ALL, false);
    assert_eq!(sys.extract(&k, gva), Some(data_frame(5)));
    sys.remove(&k, gva, gva + 0x1000);
    sys.release(u);
}

#[test]
fn reverse_map_arena_grows_and_compacts() {
    let mut sys = boot(MmuVariant::Mc68030);
    let k = PmapRef::kernel();
    let u = sys.create(0).unwrap();
    let f = data_frame(6);
    let baseline = sys.free_pages();

    // three hundred aliases of one frame: the first lives inline, the
    // rest need pooled records
    for i in 0..300u32 {
        sys.enter(&u, va(i << 12), f, Protection::READ, false);
    }
    assert_eq!(sys.mapping_count(f), 300);
    assert_eq!(
        sys.free_pages(),
        baseline - 4,
        "segment table, page table, two record pages"
    );

    // sparse chains leave record pages partly used
    for i in (0..300u32).step_by(2) {
        sys.remove(&u, va(i << 12), va((i << 12) + 0x1000));
    }
    assert_eq!(sys.mapping_count(f), 150);
    assert_eq!(
        sys.free_pages(),
        baseline - 4,
        "sparse record pages wait for collect"
    );

    // compaction drains one page and gives it back
    assert_eq!(sys.collect(&k), 1);
    assert_eq!(sys.free_pages(), baseline - 3);
    assert_eq!(sys.mapping_count(f), 150, "chains survive the compaction");
    for i in (1..300u32).step_by(2) {
        assert_eq!(sys.extract(&u, va(i << 12)), Some(f));
    }

    // dropping the rest drains the last record page, and a fully idle
    // page goes back on its own
    sys.remove(&u, va(0), va(300 << 12));
    assert_eq!(sys.mapping_count(f), 0);
    assert_eq!(sys.free_pages(), baseline);
    sys.release(u);
}

#[test]
fn surrendering_pages_is_advisory() {
    let mut sys = boot(MmuVariant::Mc68030);
    let k = PmapRef::kernel();

    // leave an emptied kernel page table page standing for later
    sys.enter(&k, va(0x0080_3000), data_frame(9), Protection::ALL, false);
    sys.remove(&k, va(0x0080_3000), va(0x0080_4000));

    // data pages are not table pages: nothing happens
    sys.enter(&k, va(KVA), data_frame(7), Protection::ALL, false);
    sys.pageable(&k, va(KVA), va(KVA + 0x1000), true);
    assert!(sys.extract(&k, va(KVA)).is_some());

    // multi-page spans and user spaces are advisory by definition
    sys.pageable(&k, va(KVA), va(KVA + 0x2000), true);
    assert!(sys.extract(&k, va(KVA)).is_some());
    let u = sys.create(0).unwrap();
    sys.enter(&u, va(0x0000_2000), data_frame(8), Protection::READ, false);
    sys.pageable(&u, va(0x0000_2000), va(0x0000_3000), true);
    assert!(sys.extract(&u, va(0x0000_2000)).is_some());
    sys.remove(&u, va(0x0000_2000), va(0x0000_3000));
    sys.release(u);

    // the emptied table page may be surrendered where it stands
    let pool_va = va(KPT_TOP_VA);
    sys.pageable(&k, pool_va, pool_va + 0x1000, true);
    assert!(sys.extract(&k, pool_va).is_some(), "surrender does not unmap");

    // untracked addresses pass the table verifier
    assert!(sys.verify_table_count(va(PT_BASE)));
}

#[test]
#[should_panic(expected = "surrendered page table page still holds mappings")]
fn surrendering_a_live_table_page_panics() {
    let mut sys = boot(MmuVariant::Mc68030);
    let u = sys.create(0).unwrap();
    sys.enter(&u, va(0x0000_2000), data_frame(12), Protection::ALL, false);
    sys.pageable(&PmapRef::kernel(), va(PT_BASE), va(PT_BASE + 0x1000), true);
}

#[test]
#[should_panic(expected = "released space still holds")]
fn releasing_a_mapped_space_panics() {
    let mut sys = boot(MmuVariant::Mc68030);
    let u = sys.create(0).unwrap();
    sys.enter(&u, va(0x0000_2000), data_frame(11), Protection::ALL, false);
    sys.release(u);
}

#[test]
fn space_handles_and_capacity() {
    let mut sys = boot(MmuVariant::Mc68030);

    // nonzero size hints are software maps the caller keeps itself
    assert!(sys.create(0x8000).is_none());

    let a = sys.create(0).unwrap();
    let b = sys.create(0).unwrap();
    assert!(sys.create(0).is_none(), "two spaces were configured");
    assert_ne!(a, b);

    // retained handles keep the space alive past the first release
    let a2 = sys.retain(&a);
    sys.enter(&a, va(0x0000_2000), data_frame(13), Protection::ALL, false);
    sys.remove(&a, va(0x0000_2000), va(0x0000_3000));
    sys.release(a);
    assert_eq!(sys.resident_count(&a2), 0);
    sys.release(a2);

    // the freed slot serves the next creation
    let c = sys.create(0).unwrap();
    sys.release(c);
    sys.release(b);
}

#[test]
fn three_level_tables_on_the_68040() {
    let mut sys = boot(MmuVariant::Mc68040);
    let k = PmapRef::kernel();

    // the head segment tables back kernel mappings without allocation
    sys.enter(&k, va(KVA), data_frame(0), Protection::ALL, false);
    assert_eq!(sys.extract(&k, va(KVA + 0x777)), Some(data_frame(0) + 0x777));
    let baseline = sys.free_pages();

    let u = sys.create(0).unwrap();

    // first mapping: a segment table frame plus a page table page; the
    // level two chunk is carved out of the segment table frame itself
    sys.enter(&u, va(0x0000_2000), data_frame(1), Protection::ALL, false);
    assert_eq!(sys.free_pages(), baseline - 2);

    // a distant region needs another chunk, cut from the same frame
    sys.enter(&u, va(0x0200_4000), data_frame(2), Protection::ALL, false);
    assert_eq!(sys.free_pages(), baseline - 3);
    assert_eq!(sys.extract(&u, va(0x0000_2000)), Some(data_frame(1)));
    assert_eq!(sys.extract(&u, va(0x0200_4000)), Some(data_frame(2)));
    assert!(sys.verify_table_count(va(PT_BASE)));

    // another segment in an already-chunked region costs only a page table
    sys.enter(&u, va(0x0040_3000), data_frame(3), Protection::ALL, false);
    assert_eq!(sys.free_pages(), baseline - 4);

    // teardown gives back every frame, chunks included
    sys.remove(&u, va(0), va(0x0300_0000));
    assert_eq!(sys.free_pages(), baseline);
    assert_eq!(sys.extract(&u, va(0x0040_3000)), None);
    assert_eq!(sys.resident_count(&u), 0);
    sys.release(u);
    sys.remove(&k, va(KVA), va(KVA + 0x1000));
}

#[test]
fn diagnostics_do_not_disturb_state() {
    let mut sys = boot(MmuVariant::Mc68030);
    let u = sys.create(0).unwrap();
    sys.enter(&u, va(0x0000_3000), data_frame(10), Protection::ALL, false);
    sys.dump_physical(data_frame(10));
    sys.dump_spaces();
    sys.update();
    assert_eq!(sys.extract(&u, va(0x0000_3000)), Some(data_frame(10)));
    sys.remove(&u, va(0x0000_3000), va(0x0000_4000));
    sys.release(u);
}
