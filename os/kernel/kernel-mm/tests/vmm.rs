mod common;

use common::*;
use kernel_info::memory::{DEVICE_WINDOW_BASE, KERNEL_DYNAMIC_BASE};
use kernel_memory_addresses::PhysicalPage;
use kernel_mm::{AllocFlags, MapFlags, MemoryManager, MmError, PageFlags, Protection, VmaKind};

const BASE: u64 = 0x40_0000;
const RW: Protection = Protection::READ_WRITE;
const USER_RW: PageFlags = PageFlags::WRITABLE.union(PageFlags::USER);

#[test]
fn bring_up_allocates_the_kernel_tables() {
    let ram = SimulatedRam::new();
    let mm = manager(&ram);
    // Root plus the two preallocated kernel slots.
    assert_eq!(mm.pmm().free_page_count(), DMA_PAGES + NORMAL_PAGES - 3);
    assert!(mm.kernel_space().is_kernel());
    assert_eq!(mm.kernel_space().holders(), 1);
    assert_eq!(mm.kernel_space().stats().table_pages, 2, "the root is not counted");
}

#[test]
fn adopting_a_live_kernel_root() {
    let ram = SimulatedRam::new();
    // The running kernel's PML4 sits in reserved memory.
    ram.fill(pa(MIB), 0, PAGE as usize);
    let root = PhysicalPage::from_pfn(MIB / PAGE);
    let mm = unsafe { MemoryManager::with_kernel_root(&ram, RecordingMmu::default(), &memory_map(), config(), root) }
        .unwrap();

    assert_eq!(mm.kernel_space().root(), root);
    assert_eq!(mm.pmm().free_page_count(), DMA_PAGES + NORMAL_PAGES - 2);
    assert!(mm.pmm().frame(pa(MIB)).is_some_and(|f| !mm.pmm().is_allocated(pa(MIB)) && f.ref_count() == 0));
}

#[test]
fn overlapping_area_is_rejected_without_fixed() {
    let ram = SimulatedRam::new();
    let mm = manager(&ram);
    let space = mm.create_address_space().unwrap();

    let first = mm
        .create_vma(&space, va(BASE), 4 * PAGE, RW, MapFlags::empty(), VmaKind::Anonymous)
        .unwrap();
    assert_eq!(first.pages(), 4);
    assert_eq!(first.flags, MapFlags::PRIVATE);

    let before = space.vmas();
    assert_eq!(
        mm.create_vma(&space, va(BASE + 2 * PAGE), 4 * PAGE, RW, MapFlags::empty(), VmaKind::Anonymous),
        Err(MmError::VmaConflict)
    );
    assert_eq!(space.vmas(), before);
    assert_eq!(space.stats().virtual_pages, 4);
}

#[test]
fn fixed_area_replaces_what_it_overlaps() {
    let ram = SimulatedRam::new();
    let mm = manager(&ram);
    let space = mm.create_address_space().unwrap();
    mm.create_vma(&space, va(BASE), 4 * PAGE, RW, MapFlags::LOCKED, VmaKind::Anonymous)
        .unwrap();
    let free = mm.pmm().free_page_count();

    let code = mm
        .create_vma(&space, va(BASE + 2 * PAGE), 2 * PAGE, Protection::READ_EXEC, MapFlags::FIXED, VmaKind::Code)
        .unwrap();
    assert_eq!(code.kind, VmaKind::Code);
    assert!(!code.flags.contains(MapFlags::FIXED));

    let areas = space.vmas();
    assert_eq!(areas.len(), 2);
    assert_eq!((areas[0].start, areas[0].end), (va(BASE), va(BASE + 2 * PAGE)));
    assert_eq!(areas[1].kind, VmaKind::Code);
    assert_eq!(space.stats().virtual_pages, 4);

    // The replaced pages went back to the allocator.
    assert_eq!(mm.pmm().free_page_count(), free + 2);
    assert_eq!(mm.translate(&space, va(BASE + 2 * PAGE)), None);
    assert!(mm.translate(&space, va(BASE + PAGE)).is_some());
}

#[test]
fn area_arguments_are_checked() {
    let ram = SimulatedRam::new();
    let mm = manager(&ram);
    let space = mm.create_address_space().unwrap();
    let kernel = mm.kernel_space();
    let bad = |r: Result<_, MmError>| matches!(r, Err(MmError::InvalidArgument(_)));

    assert!(bad(mm.create_vma(&space, va(BASE), 0, RW, MapFlags::empty(), VmaKind::Anonymous)));
    assert!(bad(mm.create_vma(&space, va(KERNEL_DYNAMIC_BASE), PAGE, RW, MapFlags::empty(), VmaKind::Anonymous)));
    assert!(bad(mm.create_vma(kernel, va(BASE), PAGE, RW, MapFlags::empty(), VmaKind::Anonymous)));
    assert!(bad(mm.create_vma(&space, va(BASE), PAGE, RW, MapFlags::empty(), VmaKind::Device)));
    assert!(bad(mm.create_vma(
        &space,
        va(BASE),
        PAGE,
        RW,
        MapFlags::PRIVATE | MapFlags::SHARED,
        VmaKind::Anonymous
    )));
    assert!(space.vmas().is_empty());

    let shm = mm
        .create_vma(&space, va(BASE + 0x10), 0x10, RW, MapFlags::empty(), VmaKind::Shared)
        .unwrap();
    assert_eq!((shm.start, shm.end), (va(BASE), va(BASE + PAGE)), "rounded out to pages");
    assert_eq!(shm.flags, MapFlags::SHARED);
}

#[test]
fn double_map_keeps_the_first_translation() {
    let ram = SimulatedRam::new();
    let mm = manager(&ram);
    let space = mm.create_address_space().unwrap();
    let first = mm.pmm().alloc_pages(0, AllocFlags::USER).unwrap();
    let second = mm.pmm().alloc_pages(0, AllocFlags::USER).unwrap();

    mm.map_page(&space, va(BASE), first, USER_RW).unwrap();
    assert!(mm.mmu().flushed(BASE));
    assert_eq!(mm.map_page(&space, va(BASE), second, USER_RW), Err(MmError::AlreadyMapped));
    assert_eq!(mm.translate(&space, va(BASE + 0x123)), Some(first + 0x123));
    assert_eq!(space.stats().resident_pages, 1);
    assert_eq!(space.stats().table_pages, 3);

    mm.pmm().free_pages(second, 0).unwrap();
}

#[test]
fn unmapping_drops_the_mapping_reference() {
    let ram = SimulatedRam::new();
    let mm = manager(&ram);
    let space = mm.create_address_space().unwrap();
    let frame = mm.pmm().alloc_pages(0, AllocFlags::USER).unwrap();
    mm.map_page(&space, va(BASE), frame, USER_RW).unwrap();
    mm.mmu().take();

    assert_eq!(mm.unmap_page(&space, va(BASE)), Ok(frame));
    assert_eq!(mm.mmu().take(), vec![Flush::Page(BASE)]);
    assert!(!mm.pmm().is_allocated(frame));
    assert_eq!(mm.translate(&space, va(BASE)), None);
    assert_eq!(mm.unmap_page(&space, va(BASE)), Err(MmError::NotMapped));
    assert_eq!(space.stats().resident_pages, 0);
}

#[test]
fn foreign_frames_are_not_reference_counted() {
    let ram = SimulatedRam::new();
    let mm = manager(&ram);
    let space = mm.create_address_space().unwrap();
    let firmware = pa(2 * MIB);

    mm.map_page(&space, va(BASE), firmware, PageFlags::USER).unwrap();
    assert_eq!(mm.unmap_page(&space, va(BASE)), Ok(firmware));
    assert!(mm.pmm().frame(firmware).is_some_and(|f| f.is(kernel_mm::pmm::FrameState::Reserved)));
}

#[test]
fn map_page_checks_addresses() {
    let ram = SimulatedRam::new();
    let mm = manager(&ram);
    let space = mm.create_address_space().unwrap();
    let frame = mm.pmm().alloc_pages(0, AllocFlags::USER).unwrap();
    let bad = |r: Result<(), MmError>| matches!(r, Err(MmError::InvalidArgument(_)));

    assert!(bad(mm.map_page(&space, va(BASE + 8), frame, USER_RW)));
    assert!(bad(mm.map_page(&space, va(BASE), frame + 8, USER_RW)));
    assert!(bad(mm.map_page(&space, va(0x0000_9000_0000_0000), frame, USER_RW)));
    assert!(bad(mm.map_page(&space, va(KERNEL_DYNAMIC_BASE), frame, USER_RW)));
    assert_eq!(mm.pmm().ref_count(frame), Ok(1));
}

#[test]
fn unmap_pages_skips_holes() {
    let ram = SimulatedRam::new();
    let mm = manager(&ram);
    let space = mm.create_address_space().unwrap();
    let free = mm.pmm().free_page_count();
    for i in [0, 1, 3] {
        let frame = mm.pmm().alloc_pages(0, AllocFlags::USER).unwrap();
        mm.map_page(&space, va(BASE + i * PAGE), frame, USER_RW).unwrap();
    }

    assert_eq!(mm.unmap_pages(&space, va(BASE), 4), Ok(3));
    assert_eq!(mm.pmm().free_page_count(), free - space.stats().table_pages);
    assert_eq!(space.stats().resident_pages, 0);
}

#[test]
fn kernel_mappings_are_visible_in_every_space() {
    let ram = SimulatedRam::new();
    let mm = manager(&ram);
    let space = mm.create_address_space().unwrap();
    let frame = mm.pmm().alloc_pages(0, AllocFlags::KERNEL).unwrap();

    mm.map_page(mm.kernel_space(), va(KERNEL_DYNAMIC_BASE), frame, PageFlags::WRITABLE)
        .unwrap();
    assert_eq!(mm.translate(&space, va(KERNEL_DYNAMIC_BASE)), Some(frame));
    assert_eq!(mm.translate(mm.kernel_space(), va(KERNEL_DYNAMIC_BASE)), Some(frame));
}

#[test]
fn locked_areas_are_populated_with_zeroes() {
    let ram = SimulatedRam::new();
    let mm = manager(&ram);
    let space = mm.create_address_space().unwrap();
    mm.create_vma(&space, va(BASE), 3 * PAGE, RW, MapFlags::LOCKED, VmaKind::Anonymous)
        .unwrap();

    assert_eq!(space.stats().resident_pages, 3);
    for i in 0..3 {
        let frame = mm.translate(&space, va(BASE + i * PAGE)).unwrap();
        assert!(ram.read(frame, PAGE as usize).iter().all(|&b| b == 0));
        assert_eq!(mm.pmm().ref_count(frame), Ok(1));
    }
}

#[test]
fn locked_area_that_does_not_fit_is_rolled_back() {
    let ram = SimulatedRam::new();
    let mm = manager(&ram);
    let space = mm.create_address_space().unwrap();
    let free = mm.pmm().free_page_count();

    assert_eq!(
        mm.create_vma(&space, va(BASE), 2048 * PAGE, RW, MapFlags::LOCKED, VmaKind::Anonymous),
        Err(MmError::OutOfMemory)
    );
    assert!(space.vmas().is_empty());
    let stats = space.stats();
    assert_eq!((stats.resident_pages, stats.virtual_pages), (0, 0));
    // Empty tables stay until the space is destroyed.
    assert_eq!(mm.pmm().free_page_count(), free - stats.table_pages);
}

#[test]
fn inaccessible_areas_are_refused() {
    let ram = SimulatedRam::new();
    let mm = manager(&ram);
    let space = mm.create_address_space().unwrap();
    let free = mm.pmm().free_page_count();

    for flags in [MapFlags::LOCKED, MapFlags::empty()] {
        assert!(matches!(
            mm.create_vma(&space, va(BASE), PAGE, Protection::empty(), flags, VmaKind::Anonymous),
            Err(MmError::InvalidArgument(_))
        ));
    }
    assert!(space.vmas().is_empty());
    assert_eq!(mm.translate(&space, va(BASE)), None);
    assert_eq!(space.stats().resident_pages, 0);
    assert_eq!(mm.pmm().free_page_count(), free);
}

#[test]
fn destroyed_spaces_translate_nothing() {
    let ram = SimulatedRam::new();
    let mm = manager(&ram);
    let space = mm.create_address_space().unwrap();
    mm.create_vma(&space, va(BASE), PAGE, RW, MapFlags::LOCKED, VmaKind::Anonymous)
        .unwrap();
    assert!(mm.translate(&space, va(BASE)).is_some());

    assert_eq!(mm.destroy_address_space(&space), Ok(true));
    assert_eq!(mm.translate(&space, va(BASE)), None);
}

#[test]
fn protection_changes_split_and_merge() {
    let ram = SimulatedRam::new();
    let mm = manager(&ram);
    let space = mm.create_address_space().unwrap();
    mm.create_vma(&space, va(BASE), 4 * PAGE, RW, MapFlags::LOCKED, VmaKind::Anonymous)
        .unwrap();
    mm.mmu().take();

    mm.protect_range(&space, va(BASE + PAGE), 2 * PAGE, Protection::READ).unwrap();
    let areas = space.vmas();
    assert_eq!(areas.len(), 3);
    assert_eq!(areas[1].protection, Protection::READ);
    assert_eq!((areas[1].start, areas[1].end), (va(BASE + PAGE), va(BASE + 3 * PAGE)));
    assert!(mm.mmu().flushed(BASE + PAGE) && mm.mmu().flushed(BASE + 2 * PAGE));

    mm.protect_range(&space, va(BASE + PAGE), 2 * PAGE, RW).unwrap();
    let areas = space.vmas();
    assert_eq!(areas.len(), 1, "identical neighbours merge back");
    assert_eq!(areas[0].pages(), 4);
}

#[test]
fn protection_changes_need_areas() {
    let ram = SimulatedRam::new();
    let mm = manager(&ram);
    let space = mm.create_address_space().unwrap();
    mm.create_vma(&space, va(BASE), 2 * PAGE, RW, MapFlags::empty(), VmaKind::Anonymous)
        .unwrap();

    assert_eq!(
        mm.protect_range(&space, va(BASE), 3 * PAGE, Protection::READ),
        Err(MmError::NotMapped)
    );
    assert!(matches!(
        mm.protect_range(&space, va(BASE), PAGE, Protection::empty()),
        Err(MmError::InvalidArgument(_))
    ));
    assert_eq!(space.vmas()[0].protection, RW);
}

#[test]
fn unmap_range_cuts_areas_and_frees_pages() {
    let ram = SimulatedRam::new();
    let mm = manager(&ram);
    let space = mm.create_address_space().unwrap();
    mm.create_vma(&space, va(BASE), 4 * PAGE, RW, MapFlags::LOCKED, VmaKind::Anonymous)
        .unwrap();
    let free = mm.pmm().free_page_count();

    assert_eq!(mm.unmap_range(&space, va(BASE + PAGE), 2 * PAGE), Ok(2));
    assert_eq!(mm.pmm().free_page_count(), free + 2);
    let areas = space.vmas();
    assert_eq!(areas.len(), 2);
    assert_eq!(areas[0].end, va(BASE + PAGE));
    assert_eq!(areas[1].start, va(BASE + 3 * PAGE));
    assert_eq!(space.stats().virtual_pages, 2);
    assert_eq!(space.stats().resident_pages, 2);

    assert_eq!(mm.unmap_range(&space, va(0x1000_0000), PAGE), Ok(0), "nothing there");
}

#[test]
fn heaps_grow_up_and_stacks_grow_down() {
    let ram = SimulatedRam::new();
    let mm = manager(&ram);
    let space = mm.create_address_space().unwrap();
    let heap = 0x1000_0000;
    let stack = 0x7000_0000;
    mm.create_vma(&space, va(heap), 2 * PAGE, RW, MapFlags::empty(), VmaKind::Heap)
        .unwrap();
    mm.create_vma(&space, va(stack), 2 * PAGE, RW, MapFlags::empty(), VmaKind::Stack)
        .unwrap();

    let grown = mm.grow_vma(&space, va(heap), 2).unwrap();
    assert_eq!((grown.start, grown.end), (va(heap), va(heap + 4 * PAGE)));

    let grown = mm.grow_vma(&space, va(stack + PAGE), 1).unwrap();
    assert_eq!((grown.start, grown.end), (va(stack - PAGE), va(stack + 2 * PAGE)));
    assert_eq!(space.stats().virtual_pages, 7);

    mm.create_vma(&space, va(heap + 4 * PAGE), PAGE, RW, MapFlags::empty(), VmaKind::Anonymous)
        .unwrap();
    assert_eq!(mm.grow_vma(&space, va(heap), 1), Err(MmError::VmaConflict));
    assert!(matches!(
        mm.grow_vma(&space, va(heap + 4 * PAGE), 1),
        Err(MmError::InvalidArgument(_))
    ));
    assert_eq!(mm.grow_vma(&space, va(0x5000_0000), 1), Err(MmError::NotMapped));
    assert_eq!(space.find_vma(va(heap)).map(|v| v.pages()), Some(4));
}

#[test]
fn destroying_a_space_returns_every_page() {
    let ram = SimulatedRam::new();
    let mm = manager(&ram);
    let free = mm.pmm().free_page_count();

    let space = mm.create_address_space().unwrap();
    mm.create_vma(&space, va(BASE), 8 * PAGE, RW, MapFlags::LOCKED, VmaKind::Anonymous)
        .unwrap();
    mm.create_vma(&space, va(0x7fff_0000_0000), 2 * PAGE, RW, MapFlags::LOCKED, VmaKind::Stack)
        .unwrap();
    let frame = mm.pmm().alloc_pages(0, AllocFlags::USER).unwrap();
    mm.map_page(&space, va(0x2000_0000), frame, USER_RW).unwrap();
    assert!(mm.pmm().free_page_count() < free);
    mm.mmu().take();

    assert_eq!(mm.destroy_address_space(&space), Ok(true));
    assert_eq!(mm.pmm().free_page_count(), free);
    assert!(mm.mmu().take().contains(&Flush::All));
    assert!(space.is_destroyed());
    assert_eq!(space.stats().resident_pages, 0);
    assert_eq!(space.stats().table_pages, 0);
    assert!(space.vmas().is_empty());

    assert!(matches!(mm.destroy_address_space(&space), Err(MmError::InvalidArgument(_))));
    assert!(matches!(
        mm.map_page(&space, va(BASE), frame, USER_RW),
        Err(MmError::InvalidArgument(_))
    ));
    assert_eq!(mm.translate(&space, va(BASE)), None);
    mm.pmm().verify().unwrap();
}

#[test]
fn last_holder_tears_down() {
    let ram = SimulatedRam::new();
    let mm = manager(&ram);
    let space = mm.create_address_space().unwrap();

    assert_eq!(mm.retain_address_space(&space), Ok(2));
    assert_eq!(mm.destroy_address_space(&space), Ok(false));
    assert!(!space.is_destroyed());
    assert_eq!(mm.destroy_address_space(&space), Ok(true));
    assert!(mm.retain_address_space(&space).is_err());
}

#[test]
fn the_kernel_space_is_permanent() {
    let ram = SimulatedRam::new();
    let mm = manager(&ram);
    assert!(matches!(
        mm.destroy_address_space(mm.kernel_space()),
        Err(MmError::InvalidArgument(_))
    ));
    assert!(matches!(
        mm.clone_address_space(mm.kernel_space()),
        Err(MmError::InvalidArgument(_))
    ));
}

#[test]
fn spaces_get_distinct_ids() {
    let ram = SimulatedRam::new();
    let mm = manager(&ram);
    let a = mm.create_address_space().unwrap();
    let b = mm.create_address_space().unwrap();
    assert_ne!(a.id(), b.id());
    assert_ne!(a.id(), mm.kernel_space().id());
    assert_ne!(a.root(), b.root());
}

#[test]
fn device_windows_map_uncached_and_unmap() {
    let ram = SimulatedRam::new();
    let mm = manager(&ram);
    let free = mm.pmm().free_page_count();
    let tables = mm.kernel_space().stats().table_pages;
    let lapic = pa(0xFEE0_0010);

    let window = mm.map_device(lapic, 0x20).unwrap();
    assert_eq!(window, va(DEVICE_WINDOW_BASE + 0x10));
    assert_eq!(mm.translate(mm.kernel_space(), window), Some(lapic));
    let area = mm.kernel_space().find_vma(window).unwrap();
    assert_eq!(area.kind, VmaKind::Device);
    assert_eq!(area.pages(), 1);

    let second = mm.map_device(pa(0xFEC0_0000), 2 * PAGE).unwrap();
    assert_eq!(second, va(DEVICE_WINDOW_BASE + PAGE));

    mm.unmap_device(window).unwrap();
    assert_eq!(mm.translate(mm.kernel_space(), window), None);
    assert_eq!(mm.unmap_device(window), Err(MmError::NotMapped));
    assert!(mm.translate(mm.kernel_space(), second).is_some());

    // Only page tables came from the allocator.
    let new_tables = mm.kernel_space().stats().table_pages - tables;
    assert!(new_tables > 0);
    assert_eq!(mm.pmm().free_page_count(), free - new_tables);
    assert!(matches!(mm.map_device(lapic, 0), Err(MmError::InvalidArgument(_))));
}

#[test]
fn device_windows_keep_their_protection() {
    let ram = SimulatedRam::new();
    let mm = manager(&ram);
    let window = mm.map_device(pa(0xFEE0_0000), PAGE).unwrap();
    assert!(matches!(
        mm.protect_range(mm.kernel_space(), window, PAGE, Protection::READ),
        Err(MmError::InvalidArgument(_))
    ));

    let area = mm
        .create_vma(mm.kernel_space(), va(KERNEL_DYNAMIC_BASE), PAGE, RW, MapFlags::empty(), VmaKind::Anonymous)
        .unwrap();
    assert!(matches!(mm.unmap_device(area.start), Err(MmError::InvalidArgument(_))));
}
