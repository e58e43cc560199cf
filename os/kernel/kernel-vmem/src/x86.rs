//! # 32-bit x86 machine VM
//!
//! [`X86Vm`] implements [`MachineVm`] on top of the [`AddressSpace`] page
//! mapper. Its object is the physical page of a page directory.
//!
//! ## Bootstrap
//!
//! The boot directory maps the kernel zone `[virt_start, virt_start + size)`
//! onto `[phys_start, ..)` with supervisor, read/write, global 4 KiB pages.
//! Its page tables are flagged as shared and every directory created later by
//! [`MachineVm::init_object`] links the very same tables, so a kernel-zone
//! mapping made through one directory is visible through all of them.

#[cfg(target_arch = "x86")]
mod mmu;

#[cfg(target_arch = "x86")]
pub use mmu::X86Mmu;

use crate::machine::{KernelZone, MachineError, MachineVm};
use crate::{AddressSpace, Mmu, NotMapped, PhysMapper, TableAlloc, VmFlags};
use kernel_info::memory::{ENTRIES_PER_TABLE, PAGE_SIZE};
use kernel_memory_addresses::{PhysicalAddress, PhysicalPage, Size4K, VirtualAddress, VirtualPage};
use kernel_sync::IrqGuard;
use log::{debug, error, info};

/// The x86 address-space object: the page directory.
pub type PageDirectory = PhysicalPage<Size4K>;

/// Flags of the kernel-zone direct map.
pub const KERNEL_ZONE_FLAGS: VmFlags = VmFlags::READ
    .union(VmFlags::WRITE)
    .union(VmFlags::EXECUTE)
    .union(VmFlags::SUPERVISOR)
    .union(VmFlags::GLOBAL);

pub struct X86Vm<P: PhysMapper, T: TableAlloc, U: Mmu> {
    mapper: P,
    tables: T,
    cpu: U,
    zone: KernelZone,
    kernel_directory: Option<PageDirectory>,
}

impl<P: PhysMapper, T: TableAlloc, U: Mmu> X86Vm<P, T, U> {
    /// A machine using the kernel zone of the memory layout.
    pub fn new(mapper: P, tables: T, cpu: U) -> Self {
        Self::with_kernel_zone(mapper, tables, cpu, KernelZone::from_layout())
    }

    /// A machine with an explicit kernel zone.
    ///
    /// # Panics
    /// If the zone does not start and end on a 4 MiB boundary.
    pub fn with_kernel_zone(mapper: P, tables: T, cpu: U, zone: KernelZone) -> Self {
        assert!(zone.is_table_aligned(), "kernel zone {zone:?} must be 4 MiB aligned");
        Self {
            mapper,
            tables,
            cpu,
            zone,
            kernel_directory: None,
        }
    }

    /// Page-mapper view of `directory`.
    #[inline]
    pub fn space(&self, directory: PageDirectory) -> AddressSpace<'_, P> {
        AddressSpace::from_root(&self.mapper, directory)
    }
}

impl<P: PhysMapper, T: TableAlloc, U: Mmu> MachineVm for X86Vm<P, T, U> {
    type Object = PageDirectory;

    fn kernel_zone(&self) -> KernelZone {
        self.zone
    }

    fn bootstrap(&mut self) -> Result<PageDirectory, MachineError> {
        if self.kernel_directory.is_some() {
            return Err(MachineError::AlreadyBootstrapped);
        }

        let zone = self.zone;
        info!(
            "kernel zone: address={}, size={:#010x}, backed by {}",
            zone.virt_start, zone.size, zone.phys_start
        );

        let space = AddressSpace::create(&self.mapper, &mut self.tables).ok_or(MachineError::OutOfMemory)?;
        for di in zone.directory_indices() {
            let va = di.base();
            let pa = zone.phys_start + (va.as_u32() - zone.virt_start.as_u32());
            #[allow(clippy::cast_possible_truncation)]
            let pages = (0..ENTRIES_PER_TABLE as u32).map(move |i| (va + i * PAGE_SIZE, pa + i * PAGE_SIZE));
            if let Err(e) = space.map_pages(&mut self.tables, &self.cpu, pages, KERNEL_ZONE_FLAGS) {
                error!("failed to map the kernel zone at {va}: {e}");
                space.release(&mut self.tables);
                return Err(e.into());
            }
        }
        space.mark_shared(zone.directory_indices());

        let root = space.root_page();
        {
            let _irq = IrqGuard::new(&self.cpu);
            // Safety: the new directory direct maps the whole kernel zone, which
            // holds the kernel image and its stacks.
            unsafe {
                self.cpu.load_directory(root);
                self.cpu.enable_paging();
            }
        }
        self.kernel_directory = Some(root);
        info!("paging enabled with boot directory {}", root.base());
        Ok(root)
    }

    fn init(&mut self) -> Result<(), MachineError> {
        if self.kernel_directory.is_none() {
            return Err(MachineError::NotBootstrapped);
        }
        let _irq = IrqGuard::new(&self.cpu);
        // Safety: only kernel-zone entries carry the global bit, and those are
        // identical in every directory.
        unsafe {
            self.cpu.enable_global_pages();
            self.cpu.enable_write_protect();
        }
        self.cpu.flush_tlb();
        info!("global pages and supervisor write protection enabled");
        Ok(())
    }

    fn init_object(&mut self) -> Result<PageDirectory, MachineError> {
        let kernel = self.kernel_directory.ok_or(MachineError::NotBootstrapped)?;
        let space = AddressSpace::create(&self.mapper, &mut self.tables).ok_or(MachineError::OutOfMemory)?;
        space.link_shared_tables(&AddressSpace::from_root(&self.mapper, kernel), self.zone.directory_indices());
        debug!("new directory {} shares the kernel zone", space.root_page().base());
        Ok(space.root_page())
    }

    fn release_object(&mut self, object: PageDirectory) -> Result<(), MachineError> {
        if self.kernel_directory == Some(object) {
            return Err(MachineError::KernelDirectory);
        }
        if self.cpu.active_directory() == object {
            return Err(MachineError::ActiveDirectory);
        }
        AddressSpace::from_root(&self.mapper, object).release(&mut self.tables);
        Ok(())
    }

    fn map(
        &mut self,
        object: PageDirectory,
        vpages: &[VirtualAddress],
        ppages: &[PhysicalAddress],
        flags: VmFlags,
    ) -> Result<(), MachineError> {
        if vpages.len() != ppages.len() {
            return Err(MachineError::LengthMismatch {
                virt: vpages.len(),
                phys: ppages.len(),
            });
        }
        let pages = vpages.iter().copied().zip(ppages.iter().copied());
        let _irq = IrqGuard::new(&self.cpu);
        AddressSpace::from_root(&self.mapper, object).map_pages(&mut self.tables, &self.cpu, pages, flags)?;
        Ok(())
    }

    fn unmap(
        &mut self,
        object: PageDirectory,
        vpages: &[VirtualPage<Size4K>],
        released: &mut dyn FnMut(VirtualPage<Size4K>, PhysicalPage<Size4K>),
    ) {
        let _irq = IrqGuard::new(&self.cpu);
        AddressSpace::from_root(&self.mapper, object).unmap_pages(
            &mut self.tables,
            &self.cpu,
            vpages.iter().copied(),
            released,
        );
    }

    fn translate(&self, object: PageDirectory, va: VirtualAddress) -> Result<PhysicalAddress, NotMapped> {
        self.space(object).translate(va)
    }

    fn activate(&mut self, object: PageDirectory) {
        let _irq = IrqGuard::new(&self.cpu);
        // Safety: every directory handed out by this machine maps the kernel zone.
        unsafe { self.cpu.load_directory(object) }
    }

    fn clear_page(&mut self, page: PhysicalPage<Size4K>) {
        // Safety: the page was just allocated and is not mapped anywhere yet.
        let bytes = unsafe { self.mapper.phys_to_mut::<[u8; PAGE_SIZE as usize]>(page.base()) };
        bytes.fill(0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{CpuEvent, FakeCpu, TestPhys, TestPool};
    use kernel_sync::InterruptControl;

    const ZONE: KernelZone = KernelZone {
        virt_start: VirtualAddress::new(0),
        phys_start: PhysicalAddress::new(0),
        size: 0x0080_0000,
    };

    fn machine<'a>(phys: &'a TestPhys, pool: &'a TestPool, cpu: &'a FakeCpu) -> X86Vm<&'a TestPhys, &'a TestPool, &'a FakeCpu> {
        X86Vm::with_kernel_zone(phys, pool, cpu, ZONE)
    }

    #[test]
    fn bootstrap_direct_maps_kernel_zone_and_enables_paging() {
        let phys = TestPhys::new(16);
        let pool = TestPool::new(0..16);
        let cpu = FakeCpu::new();
        let mut vm = machine(&phys, &pool, &cpu);

        let boot = vm.bootstrap().unwrap();
        assert_eq!(pool.outstanding(), 3, "directory plus two page tables");
        assert_eq!(vm.translate(boot, VirtualAddress::new(0x0012_3456)), Ok(PhysicalAddress::new(0x0012_3456)));
        assert_eq!(vm.translate(boot, VirtualAddress::new(0x007F_FFFF)), Ok(PhysicalAddress::new(0x007F_FFFF)));
        assert!(vm.translate(boot, VirtualAddress::new(0x0080_0000)).is_err());

        let e = vm.space(boot).leaf_entry(VirtualAddress::new(0x1000)).unwrap();
        assert!(e.present() && e.writable() && e.global() && !e.user_access());

        assert_eq!(cpu.directory(), Some(boot));
        assert!(cpu.events().contains(&CpuEvent::EnablePaging));
        assert_eq!(cpu.unguarded_operations(), 0);
        assert_eq!(vm.bootstrap(), Err(MachineError::AlreadyBootstrapped));
    }

    #[test]
    fn init_requires_bootstrap() {
        let phys = TestPhys::new(16);
        let pool = TestPool::new(0..16);
        let cpu = FakeCpu::new();
        let mut vm = machine(&phys, &pool, &cpu);
        assert_eq!(vm.init(), Err(MachineError::NotBootstrapped));
        assert_eq!(vm.init_object(), Err(MachineError::NotBootstrapped));

        vm.bootstrap().unwrap();
        vm.init().unwrap();
        let ev = cpu.events();
        assert!(ev.contains(&CpuEvent::EnableGlobalPages));
        assert!(ev.contains(&CpuEvent::EnableWriteProtect));
        assert!(ev.contains(&CpuEvent::FlushTlb));
    }

    #[test]
    fn objects_share_kernel_tables_and_release_only_their_own() {
        let phys = TestPhys::new(16);
        let pool = TestPool::new(0..16);
        let cpu = FakeCpu::new();
        let mut vm = machine(&phys, &pool, &cpu);
        let boot = vm.bootstrap().unwrap();
        let baseline = pool.outstanding();

        let a = vm.init_object().unwrap();
        assert_eq!(vm.translate(a, VirtualAddress::new(0x0040_0010)), Ok(PhysicalAddress::new(0x0040_0010)));

        vm.map(
            a,
            &[VirtualAddress::new(0x4000_0000)],
            &[PhysicalAddress::new(0x0000_5000)],
            VmFlags::READ | VmFlags::WRITE | VmFlags::USER,
        )
        .unwrap();
        assert!(vm.translate(boot, VirtualAddress::new(0x4000_0000)).is_err());
        assert_eq!(pool.outstanding(), baseline + 2);

        assert_eq!(vm.release_object(boot), Err(MachineError::KernelDirectory));
        vm.release_object(a).unwrap();
        assert_eq!(pool.outstanding(), baseline);
        assert_eq!(vm.translate(boot, VirtualAddress::new(0x0040_0010)), Ok(PhysicalAddress::new(0x0040_0010)));
    }

    #[test]
    fn active_object_cannot_be_released() {
        let phys = TestPhys::new(16);
        let pool = TestPool::new(0..16);
        let cpu = FakeCpu::new();
        let mut vm = machine(&phys, &pool, &cpu);
        vm.bootstrap().unwrap();
        let a = vm.init_object().unwrap();
        vm.activate(a);
        assert_eq!(cpu.directory(), Some(a));
        assert_eq!(vm.release_object(a), Err(MachineError::ActiveDirectory));
    }

    #[test]
    fn map_and_unmap_run_with_interrupts_disabled() {
        let phys = TestPhys::new(16);
        let pool = TestPool::new(0..16);
        let cpu = FakeCpu::new();
        let mut vm = machine(&phys, &pool, &cpu);
        vm.bootstrap().unwrap();
        let a = vm.init_object().unwrap();
        let va = VirtualAddress::new(0x4000_0000);
        let page = VirtualPage::<Size4K>::containing_address(va);

        vm.map(a, &[va], &[PhysicalAddress::new(0x6000)], VmFlags::READ | VmFlags::USER).unwrap();
        vm.map(a, &[va], &[PhysicalAddress::new(0x7000)], VmFlags::READ | VmFlags::USER).unwrap();
        let mut released = Vec::new();
        vm.unmap(a, &[page], &mut |v, p| released.push((v, p)));

        let frame = PhysicalPage::<Size4K>::containing_address(PhysicalAddress::new(0x7000));
        assert_eq!(released, [(page, frame)]);
        assert_eq!(cpu.invalidations(), [page, page], "remap and unmap each invalidate once");
        assert_eq!(cpu.unguarded_operations(), 0);
        assert!(cpu.interrupts_enabled(), "guards restore the interrupt flag");
    }

    #[test]
    fn map_rejects_mismatched_lengths() {
        let phys = TestPhys::new(16);
        let pool = TestPool::new(0..16);
        let cpu = FakeCpu::new();
        let mut vm = machine(&phys, &pool, &cpu);
        let boot = vm.bootstrap().unwrap();
        assert_eq!(
            vm.map(boot, &[VirtualAddress::new(0x4000_0000)], &[], VmFlags::READ),
            Err(MachineError::LengthMismatch { virt: 1, phys: 0 })
        );
    }

    #[test]
    fn clear_page_zeroes_the_frame() {
        let phys = TestPhys::new(16);
        let pool = TestPool::new(0..8);
        let cpu = FakeCpu::new();
        let mut vm = machine(&phys, &pool, &cpu);
        let page = PhysicalPage::containing_address(PhysicalAddress::new(0xA000));
        phys.fill(page, 0xAB);
        assert!(!phys.is_zeroed(page));
        vm.clear_page(page);
        assert!(phys.is_zeroed(page));
    }
}
