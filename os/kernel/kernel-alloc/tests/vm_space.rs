use kernel_alloc::vmm::{FaultAccess, FaultError, Vm, VmError, VmSpace, WellKnown};
use kernel_memory_addresses::{PhysicalAddress, PhysicalPage, Size4K, VirtualAddress};
use kernel_vmem::testing::{CpuEvent, FakeCpu, TestPhys, TestPool};
use kernel_vmem::x86::X86Vm;
use kernel_vmem::{AlignmentViolation, KernelZone, NotMapped, VmFlags};

const ZONE: KernelZone = KernelZone {
    virt_start: VirtualAddress::new(0),
    phys_start: PhysicalAddress::new(0),
    size: 0x0040_0000,
};

const USER_RW: VmFlags = VmFlags::READ.union(VmFlags::WRITE).union(VmFlags::USER);
const LAZY_RW: VmFlags = USER_RW.union(VmFlags::LAZY);

type Space = VmSpace<PhysicalPage<Size4K>>;
type TestVm<'a> = Vm<X86Vm<&'a TestPhys, &'a TestPool, &'a FakeCpu>, &'a TestPool>;

struct Rig {
    phys: TestPhys,
    tables: TestPool,
    frames: TestPool,
    cpu: FakeCpu,
}

impl Rig {
    fn new() -> Self {
        let phys = TestPhys::new(128);
        // Dirty every frame the region allocator can hand out.
        for f in 48..128 {
            phys.fill(PhysicalPage::containing_address(PhysicalAddress::new(f * 4096)), 0xAA);
        }
        Self {
            phys,
            tables: TestPool::new(0..48),
            frames: TestPool::new(48..128),
            cpu: FakeCpu::new(),
        }
    }

    fn boot(&self) -> (TestVm<'_>, Space) {
        let machine = X86Vm::with_kernel_zone(&self.phys, &self.tables, &self.cpu, ZONE);
        Vm::bootstrap(machine, &self.frames).unwrap()
    }
}

fn va(v: u32) -> VirtualAddress {
    VirtualAddress::new(v)
}

#[test]
fn new_space_has_kernel_region_and_empty_well_known_regions() {
    let rig = Rig::new();
    let (mut vm, kernel) = rig.boot();
    let space = vm.create_space().unwrap();

    assert_ne!(space.object(), kernel.object());
    assert_eq!(space.kernel_region().size, ZONE.size);
    assert!(space.well_known(WellKnown::Stack).is_empty());
    assert!(space.well_known(WellKnown::Heap).is_empty());
    assert_eq!(space.regions().count(), 1);
    assert_eq!(vm.translate(&space, va(0x0010_0040)), Ok(PhysicalAddress::new(0x0010_0040)));
    assert_eq!(vm.active(), kernel.object());
}

#[test]
fn eager_region_is_backed_by_zeroed_frames() {
    let rig = Rig::new();
    let (mut vm, _) = rig.boot();
    let mut space = vm.create_space().unwrap();

    vm.map_region(&mut space, va(0x4000_0000), 0x3000, USER_RW).unwrap();

    assert_eq!(rig.frames.outstanding(), 3);
    for i in 0..3 {
        let pa = vm.translate(&space, va(0x4000_0000 + i * 0x1000)).unwrap();
        let frame = PhysicalPage::containing_address(pa);
        assert!(rig.frames.is_allocated(frame));
        assert!(rig.phys.is_zeroed(frame));
    }
    let region = space.region_containing(va(0x4000_2FFF)).unwrap();
    assert_eq!((region.size, region.unfulfilled_ppages), (0x3000, 0));
    assert_eq!(rig.cpu.unguarded_operations(), 0);
}

#[test]
fn overlapping_regions_are_rejected_without_side_effects() {
    let rig = Rig::new();
    let (mut vm, _) = rig.boot();
    let mut space = vm.create_space().unwrap();
    vm.map_region(&mut space, va(0x4000_2000), 0x2000, USER_RW).unwrap();
    let frames = rig.frames.outstanding();

    assert_eq!(
        vm.map_region(&mut space, va(0x4000_0000), 0x3000, USER_RW),
        Err(VmError::Overlap(va(0x4000_2000)))
    );
    assert_eq!(
        vm.map_region(&mut space, va(0x4000_3000), 0x1000, LAZY_RW),
        Err(VmError::Overlap(va(0x4000_2000)))
    );
    assert_eq!(
        vm.map_region(&mut space, va(0x0030_0000), 0x1000, USER_RW),
        Err(VmError::Overlap(va(0)))
    );

    assert_eq!(rig.frames.outstanding(), frames);
    assert_eq!(space.regions().count(), 2);
    assert_eq!(vm.translate(&space, va(0x4000_0000)), Err(NotMapped(va(0x4000_0000))));
    assert!(vm.translate(&space, va(0x4000_2000)).is_ok());

    // Adjacent is fine.
    vm.map_region(&mut space, va(0x4000_4000), 0x1000, USER_RW).unwrap();
}

#[test]
fn invalid_requests_are_rejected() {
    let rig = Rig::new();
    let (mut vm, _) = rig.boot();
    let mut space = vm.create_space().unwrap();

    assert_eq!(
        vm.map_region(&mut space, va(0x4000_0100), 0x1000, USER_RW),
        Err(VmError::AlignmentViolation(AlignmentViolation::Virtual(va(0x4000_0100))))
    );
    assert_eq!(
        vm.map_region(&mut space, va(0x4000_0000), 0x1800, USER_RW),
        Err(VmError::AlignmentViolation(AlignmentViolation::Size(0x1800)))
    );
    assert!(matches!(
        vm.map_region(&mut space, va(0x4000_0000), 0, USER_RW),
        Err(VmError::InvalidRange { .. })
    ));
    assert!(matches!(
        vm.map_region(&mut space, va(0xFFFF_F000), 0x1000, USER_RW),
        Err(VmError::InvalidRange { .. })
    ));
    assert_eq!(rig.frames.outstanding(), 0);
}

#[test]
fn running_out_of_frames_returns_the_ones_taken() {
    let rig = Rig::new();
    let (mut vm, _) = rig.boot();
    let mut space = vm.create_space().unwrap();

    rig.frames.fail_after(2);
    assert_eq!(
        vm.map_region(&mut space, va(0x4000_0000), 0x4000, USER_RW),
        Err(VmError::OutOfMemory)
    );
    assert_eq!(rig.frames.outstanding(), 0);
    assert!(space.region_containing(va(0x4000_0000)).is_none());
}

#[test]
fn running_out_of_page_tables_unwinds_the_region() {
    let rig = Rig::new();
    let (mut vm, _) = rig.boot();
    let mut space = vm.create_space().unwrap();
    let tables = rig.tables.outstanding();

    rig.tables.fail_after(0);
    assert_eq!(
        vm.map_region(&mut space, va(0x4000_0000), 0x2000, USER_RW),
        Err(VmError::OutOfMemory)
    );
    assert_eq!(rig.frames.outstanding(), 0);
    assert_eq!(rig.tables.outstanding(), tables);
    assert_eq!(vm.translate(&space, va(0x4000_0000)), Err(NotMapped(va(0x4000_0000))));
    assert!(space.region_containing(va(0x4000_0000)).is_none());
}

#[test]
fn lazy_region_is_fulfilled_one_page_per_fault() {
    let rig = Rig::new();
    let (mut vm, _) = rig.boot();
    let mut space = vm.create_space().unwrap();
    let base = 0x5000_0000;
    vm.map_region(&mut space, va(base), 0x4000, LAZY_RW).unwrap();

    let unfulfilled = |s: &Space| s.region_containing(va(base)).unwrap().unfulfilled_ppages;
    assert_eq!(unfulfilled(&space), 4);
    assert_eq!(rig.frames.outstanding(), 0);
    assert_eq!(vm.translate(&space, va(base)), Err(NotMapped(va(base))));

    let frame = vm.handle_fault(&mut space, va(base + 0x10), FaultAccess::user_write()).unwrap();
    assert_eq!(unfulfilled(&space), 3);
    assert_eq!(vm.translate(&space, va(base + 0x10)), Ok(frame.base() + 0x10));
    assert!(rig.phys.is_zeroed(frame));

    // Faulting on a page that is already backed does not fulfil anything.
    assert_eq!(
        vm.handle_fault(&mut space, va(base), FaultAccess::user_read()),
        Err(FaultError::AccessViolation(va(base)))
    );
    assert_eq!(unfulfilled(&space), 3);

    vm.handle_fault(&mut space, va(base + 0x2000), FaultAccess::user_read()).unwrap();
    assert_eq!(unfulfilled(&space), 2);
    assert_eq!(rig.frames.outstanding(), 2);
}

#[test]
fn unrecoverable_faults_are_reported() {
    let rig = Rig::new();
    let (mut vm, _) = rig.boot();
    let mut space = vm.create_space().unwrap();
    vm.map_region(&mut space, va(0x5000_0000), 0x2000, VmFlags::READ | VmFlags::USER | VmFlags::LAZY)
        .unwrap();

    assert_eq!(
        vm.handle_fault(&mut space, va(0x7000_0000), FaultAccess::user_read()),
        Err(FaultError::NoRegion(va(0x7000_0000)))
    );
    assert_eq!(
        vm.handle_fault(&mut space, va(0x5000_0000), FaultAccess::user_write()),
        Err(FaultError::AccessViolation(va(0x5000_0000)))
    );
    assert_eq!(
        vm.handle_fault(&mut space, va(0x0000_1000), FaultAccess::user_read()),
        Err(FaultError::AccessViolation(va(0x0000_1000)))
    );

    rig.frames.fail_after(0);
    assert_eq!(
        vm.handle_fault(&mut space, va(0x5000_1000), FaultAccess::user_read()),
        Err(FaultError::OutOfMemory)
    );
    assert_eq!(space.region_containing(va(0x5000_0000)).unwrap().unfulfilled_ppages, 2);
}

#[test]
fn unmap_returns_frames_and_is_idempotent() {
    let rig = Rig::new();
    let (mut vm, _) = rig.boot();
    let mut space = vm.create_space().unwrap();
    let tables = rig.tables.outstanding();
    vm.map_region(&mut space, va(0x4000_0000), 0x3000, USER_RW).unwrap();

    vm.unmap_region(&mut space, va(0x4000_0000), 0x3000).unwrap();
    assert_eq!(rig.frames.outstanding(), 0);
    assert_eq!(rig.tables.outstanding(), tables, "the emptied page table is freed");
    assert!(space.region_containing(va(0x4000_0000)).is_none());
    assert_eq!(vm.translate(&space, va(0x4000_1000)), Err(NotMapped(va(0x4000_1000))));

    vm.unmap_region(&mut space, va(0x4000_0000), 0x3000).unwrap();
    vm.unmap_region(&mut space, va(0x9000_0000), 0x1000).unwrap();
    assert_eq!(vm.unmap_region(&mut space, va(0x0000_0000), 0x1000), Err(VmError::KernelRange));
}

#[test]
fn unmapping_the_middle_splits_a_region() {
    let rig = Rig::new();
    let (mut vm, _) = rig.boot();
    let mut space = vm.create_space().unwrap();
    let base = 0x6000_0000;
    vm.map_region(&mut space, va(base), 0x4000, LAZY_RW).unwrap();
    vm.handle_fault(&mut space, va(base), FaultAccess::user_write()).unwrap();
    vm.handle_fault(&mut space, va(base + 0x1000), FaultAccess::user_write()).unwrap();

    vm.unmap_region(&mut space, va(base + 0x1000), 0x2000).unwrap();

    let left = *space.region_containing(va(base)).unwrap();
    let right = *space.region_containing(va(base + 0x3000)).unwrap();
    assert_eq!((left.address, left.size, left.unfulfilled_ppages), (va(base), 0x1000, 0));
    assert_eq!((right.address, right.size, right.unfulfilled_ppages), (va(base + 0x3000), 0x1000, 1));
    assert_eq!(right.flags, LAZY_RW);
    assert!(space.region_containing(va(base + 0x2000)).is_none());
    assert_eq!(rig.frames.outstanding(), 1);

    // The upper piece is still backed on demand.
    vm.handle_fault(&mut space, va(base + 0x3000), FaultAccess::user_read()).unwrap();
    assert_eq!(space.region_containing(va(base + 0x3000)).unwrap().unfulfilled_ppages, 0);
}

#[test]
fn unmapping_across_regions_trims_both() {
    let rig = Rig::new();
    let (mut vm, _) = rig.boot();
    let mut space = vm.create_space().unwrap();
    vm.map_region(&mut space, va(0x4000_0000), 0x3000, USER_RW).unwrap();
    vm.map_region(&mut space, va(0x4000_5000), 0x3000, USER_RW).unwrap();

    vm.unmap_region(&mut space, va(0x4000_2000), 0x4000).unwrap();

    assert_eq!(space.region_containing(va(0x4000_0000)).unwrap().size, 0x2000);
    let upper = space.region_containing(va(0x4000_7000)).unwrap();
    assert_eq!((upper.address, upper.size), (va(0x4000_6000), 0x2000));
    assert_eq!(rig.frames.outstanding(), 4);
}

#[test]
fn well_known_regions_are_placed_once_and_the_heap_grows() {
    let rig = Rig::new();
    let (mut vm, _) = rig.boot();
    let mut space = vm.create_space().unwrap();

    let (stack, stack_size) = WellKnown::Stack.default_range();
    vm.map_well_known(&mut space, WellKnown::Stack, stack, stack_size, WellKnown::FLAGS)
        .unwrap();
    assert_eq!(
        vm.map_well_known(&mut space, WellKnown::Stack, va(0x7000_0000), 0x1000, WellKnown::FLAGS),
        Err(VmError::RegionInUse(WellKnown::Stack))
    );
    assert_eq!(space.well_known(WellKnown::Stack).unfulfilled_ppages, stack_size / 4096);

    let heap = WellKnown::Heap.anchor();
    assert_eq!(vm.grow_heap(&mut space, 100), Ok(heap));
    assert_eq!(vm.grow_heap(&mut space, 0x2000), Ok(heap + 0x1000));
    assert_eq!(space.heap_break(), heap + 0x3000);
    assert_eq!(space.well_known(WellKnown::Heap).unfulfilled_ppages, 3);

    vm.map_region(&mut space, heap + 0x4000, 0x1000, USER_RW).unwrap();
    assert_eq!(vm.grow_heap(&mut space, 0x2000), Err(VmError::Overlap(heap + 0x4000)));
    assert_eq!(space.heap_break(), heap + 0x3000);

    vm.handle_fault(&mut space, heap + 0x2000, FaultAccess::user_write()).unwrap();
    assert_eq!(space.well_known(WellKnown::Heap).unfulfilled_ppages, 2);
}

#[test]
fn switching_and_destroying_spaces() {
    let rig = Rig::new();
    let (mut vm, kernel) = rig.boot();
    let tables = rig.tables.outstanding();
    let mut space = vm.create_space().unwrap();
    vm.map_region(&mut space, va(0x4000_0000), 0x2000, USER_RW).unwrap();
    vm.map_region(&mut space, va(0x8000_0000), 0x2000, LAZY_RW).unwrap();
    vm.handle_fault(&mut space, va(0x8000_1000), FaultAccess::user_read()).unwrap();
    rig.cpu.take_events();

    assert_eq!(vm.switch_to(&space), kernel.object());
    assert_eq!(rig.cpu.directory(), Some(space.object()));
    assert_eq!(rig.cpu.events(), [CpuEvent::LoadDirectory(space.object())]);
    assert_eq!(rig.cpu.unguarded_operations(), 0);

    let (space, e) = vm.destroy_space(space).unwrap_err();
    assert_eq!(e, VmError::SpaceActive);
    let (kernel, e) = vm.destroy_space(kernel).unwrap_err();
    assert_eq!(e, VmError::KernelRange);

    assert_eq!(vm.switch_to(&kernel), space.object());
    assert_eq!(vm.switch_to(&kernel), kernel.object(), "switching to the active space is a no-op");

    vm.destroy_space(space).unwrap();
    assert_eq!(rig.frames.outstanding(), 0);
    assert_eq!(rig.tables.outstanding(), tables);
    assert_eq!(vm.active(), kernel.object());
}

#[test]
fn user_regions_cannot_be_global() {
    let rig = Rig::new();
    let (mut vm, _) = rig.boot();
    let mut space = vm.create_space().unwrap();
    let global = USER_RW | VmFlags::GLOBAL;

    assert_eq!(
        vm.map_region(&mut space, va(0x5000_0000), 0x1000, global),
        Err(VmError::InvalidFlags(global))
    );
    let (stack, size) = WellKnown::Stack.default_range();
    assert_eq!(
        vm.map_well_known(&mut space, WellKnown::Stack, stack, size, WellKnown::FLAGS | VmFlags::GLOBAL),
        Err(VmError::InvalidFlags(WellKnown::FLAGS | VmFlags::GLOBAL))
    );

    assert_eq!(rig.frames.outstanding(), 0);
    assert!(space.region_containing(va(0x5000_0000)).is_none());
    assert!(space.well_known(WellKnown::Stack).is_empty());
    assert_eq!(vm.translate(&space, va(0x5000_0000)), Err(NotMapped(va(0x5000_0000))));
}

#[test]
fn fault_without_page_tables_leaves_the_region_unfulfilled() {
    let rig = Rig::new();
    let (mut vm, _) = rig.boot();
    let mut space = vm.create_space().unwrap();
    let base = 0x8000_0000;
    vm.map_region(&mut space, va(base), 0x2000, LAZY_RW).unwrap();
    let tables = rig.tables.outstanding();

    rig.tables.fail_after(0);
    assert_eq!(
        vm.handle_fault(&mut space, va(base + 0x1000), FaultAccess::user_write()),
        Err(FaultError::OutOfMemory)
    );
    assert_eq!(rig.frames.outstanding(), 0, "the frame taken for the page is returned");
    assert_eq!(rig.tables.outstanding(), tables);
    assert_eq!(space.region_containing(va(base)).unwrap().unfulfilled_ppages, 2);
    assert_eq!(space.unfulfilled_ppages(), 2);
    assert_eq!(vm.translate(&space, va(base + 0x1000)), Err(NotMapped(va(base + 0x1000))));

    rig.tables.never_fail();
    vm.handle_fault(&mut space, va(base + 0x1000), FaultAccess::user_write()).unwrap();
    assert_eq!(space.unfulfilled_ppages(), 1);
}
