use kernel_memory_addresses::{PhysicalAddress, PhysicalPage, Size4K, VirtualAddress, VirtualPage};
use kernel_vmem::testing::{FakeCpu, TestPhys, TestPool};
use kernel_vmem::{AddressSpace, AlignmentViolation, MapError, NotMapped, VmFlags};

fn va(v: u32) -> VirtualAddress {
    VirtualAddress::new(v)
}

fn pa(v: u32) -> PhysicalAddress {
    PhysicalAddress::new(v)
}

fn vpage(v: u32) -> VirtualPage<Size4K> {
    VirtualPage::containing_address(va(v))
}

const USER_RW: VmFlags = VmFlags::READ.union(VmFlags::WRITE).union(VmFlags::USER);

#[test]
fn single_page_translates_and_its_neighbour_does_not() {
    let phys = TestPhys::new(32);
    let pool = TestPool::new(0..32);
    let cpu = FakeCpu::new();
    let mut tables = &pool;
    let space = AddressSpace::create(&phys, &mut tables).unwrap();

    let n = space
        .map_pages(&mut tables, &cpu, [(va(0x0040_0000), pa(0x0010_0000))], USER_RW)
        .unwrap();
    assert_eq!(n, 1);

    assert_eq!(space.translate(va(0x0040_0000)), Ok(pa(0x0010_0000)));
    assert_eq!(space.translate(va(0x0040_0ABC)), Ok(pa(0x0010_0ABC)));
    assert_eq!(space.translate(va(0x0040_1000)), Err(NotMapped(va(0x0040_1000))));

    let leaf = space.leaf_entry(va(0x0040_0000)).unwrap();
    assert!(leaf.present() && leaf.writable() && leaf.user_access() && !leaf.global());
    assert!(cpu.invalidations().is_empty(), "nothing was present before");
}

#[test]
fn batch_across_tables_round_trips() {
    let phys = TestPhys::new(32);
    let pool = TestPool::new(0..32);
    let cpu = FakeCpu::new();
    let mut tables = &pool;
    let space = AddressSpace::create(&phys, &mut tables).unwrap();

    let base = 0x403F_C000;
    let pages: Vec<_> = (0..8).map(|i| (va(base + i * 0x1000), pa(0x0200_0000 + i * 0x1000))).collect();
    assert_eq!(space.map_pages(&mut tables, &cpu, pages.iter().copied(), VmFlags::READ), Ok(8));
    assert_eq!(pool.outstanding(), 3, "directory plus two tables");

    for (v, p) in pages {
        assert_eq!(space.translate(v), Ok(p));
        assert_eq!(space.translate(v + 0x7FF), Ok(p + 0x7FF));
    }
}

#[test]
fn out_of_memory_reverts_the_whole_batch() {
    let phys = TestPhys::new(32);
    let pool = TestPool::new(0..32);
    let cpu = FakeCpu::new();
    let mut tables = &pool;
    let space = AddressSpace::create(&phys, &mut tables).unwrap();

    // One table fits; the batch needs two.
    pool.fail_after(1);
    let batch = [
        (va(0x403F_E000), pa(0x0020_0000)),
        (va(0x403F_F000), pa(0x0020_1000)),
        (va(0x4040_0000), pa(0x0020_2000)),
    ];
    assert_eq!(
        space.map_pages(&mut tables, &cpu, batch, USER_RW),
        Err(MapError::OutOfMemory { index: 2 })
    );

    for (v, _) in batch {
        assert_eq!(space.translate(v), Err(NotMapped(v)));
        assert!(space.leaf_entry(v).is_none(), "table created by the batch is gone");
    }
    assert_eq!(pool.outstanding(), 1, "only the directory remains");
}

#[test]
fn rollback_restores_mappings_that_were_overwritten() {
    let phys = TestPhys::new(32);
    let pool = TestPool::new(0..32);
    let cpu = FakeCpu::new();
    let mut tables = &pool;
    let space = AddressSpace::create(&phys, &mut tables).unwrap();

    space
        .map_pages(&mut tables, &cpu, [(va(0x403F_F000), pa(0x0030_0000))], VmFlags::READ)
        .unwrap();
    let outstanding = pool.outstanding();
    cpu.take_events();

    pool.fail_after(0);
    let batch = [
        (va(0x403F_E000), pa(0x0031_0000)),
        (va(0x403F_F000), pa(0x0031_1000)),
        (va(0x4040_0000), pa(0x0031_2000)),
    ];
    assert!(matches!(
        space.map_pages(&mut tables, &cpu, batch, USER_RW),
        Err(MapError::OutOfMemory { index: 2 })
    ));

    assert_eq!(space.translate(va(0x403F_F000)), Ok(pa(0x0030_0000)));
    assert_eq!(space.translate(va(0x403F_E000)), Err(NotMapped(va(0x403F_E000))));
    let leaf = space.leaf_entry(va(0x403F_F000)).unwrap();
    assert!(!leaf.writable() && !leaf.user_access());
    assert_eq!(pool.outstanding(), outstanding);

    // The overwrite by the batch, then every present entry the rollback replaced.
    assert_eq!(
        cpu.invalidations(),
        [vpage(0x403F_F000), vpage(0x403F_F000), vpage(0x403F_E000)]
    );
    // The directory entry had been widened for the user pages.
    assert_eq!(cpu.flushes(), 1);
}

#[test]
fn misaligned_requests_change_nothing() {
    let phys = TestPhys::new(32);
    let pool = TestPool::new(0..32);
    let cpu = FakeCpu::new();
    let mut tables = &pool;
    let space = AddressSpace::create(&phys, &mut tables).unwrap();

    assert_eq!(
        space.map_pages(&mut tables, &cpu, [(va(0x4000_0010), pa(0x0010_0000))], USER_RW),
        Err(MapError::AlignmentViolation(AlignmentViolation::Virtual(va(0x4000_0010))))
    );
    let batch = [(va(0x4000_0000), pa(0x0010_0000)), (va(0x4000_1000), pa(0x0010_0800))];
    assert_eq!(
        space.map_pages(&mut tables, &cpu, batch, USER_RW),
        Err(MapError::AlignmentViolation(AlignmentViolation::Physical(pa(0x0010_0800))))
    );

    assert_eq!(space.translate(va(0x4000_0000)), Err(NotMapped(va(0x4000_0000))));
    assert!(space.leaf_entry(va(0x4000_0000)).is_none());
    assert_eq!(pool.outstanding(), 1);
    assert!(cpu.events().is_empty());
}

#[test]
fn unmap_is_idempotent_and_frees_empty_tables() {
    let phys = TestPhys::new(32);
    let pool = TestPool::new(0..32);
    let cpu = FakeCpu::new();
    let mut tables = &pool;
    let space = AddressSpace::create(&phys, &mut tables).unwrap();

    let batch = [(va(0x5000_0000), pa(0x0040_0000)), (va(0x5000_1000), pa(0x0040_1000))];
    space.map_pages(&mut tables, &cpu, batch, USER_RW).unwrap();
    assert_eq!(pool.outstanding(), 2);

    let pages = [vpage(0x5000_0000), vpage(0x5000_1000), vpage(0x5000_2000)];
    let mut released = Vec::new();
    let n = space.unmap_pages(&mut tables, &cpu, pages, |v, p| released.push((v, p)));
    assert_eq!(n, 2);
    assert_eq!(
        released,
        [
            (vpage(0x5000_0000), PhysicalPage::containing_address(pa(0x0040_0000))),
            (vpage(0x5000_1000), PhysicalPage::containing_address(pa(0x0040_1000))),
        ]
    );
    assert_eq!(cpu.invalidations(), [vpage(0x5000_0000), vpage(0x5000_1000)]);
    assert_eq!(pool.outstanding(), 1, "the emptied table went back to the pool");

    cpu.take_events();
    let n = space.unmap_pages(&mut tables, &cpu, pages, |_, _| panic!("nothing left to release"));
    assert_eq!(n, 0);
    assert!(cpu.events().is_empty());
    assert_eq!(space.translate(va(0x5000_0000)), Err(NotMapped(va(0x5000_0000))));
}

#[test]
fn partially_emptied_table_is_kept() {
    let phys = TestPhys::new(32);
    let pool = TestPool::new(0..32);
    let cpu = FakeCpu::new();
    let mut tables = &pool;
    let space = AddressSpace::create(&phys, &mut tables).unwrap();

    let batch = [(va(0x5000_0000), pa(0x0040_0000)), (va(0x5000_1000), pa(0x0040_1000))];
    space.map_pages(&mut tables, &cpu, batch, USER_RW).unwrap();
    space.unmap_pages(&mut tables, &cpu, [vpage(0x5000_0000)], |_, _| {});

    assert_eq!(pool.outstanding(), 2);
    assert_eq!(space.translate(va(0x5000_1000)), Ok(pa(0x0040_1000)));
}

#[test]
fn release_returns_every_table() {
    let phys = TestPhys::new(32);
    let pool = TestPool::new(0..32);
    let cpu = FakeCpu::new();
    let mut tables = &pool;
    let space = AddressSpace::create(&phys, &mut tables).unwrap();

    let batch = [(va(0x4000_0000), pa(0x0010_0000)), (va(0x8000_0000), pa(0x0010_1000))];
    space.map_pages(&mut tables, &cpu, batch, USER_RW).unwrap();
    assert_eq!(pool.outstanding(), 3);

    assert_eq!(space.release(&mut tables), 2);
    assert_eq!(pool.outstanding(), 0);
}
