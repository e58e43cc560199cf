//! # Memory manager bring-up
//!
//! The order matters: the logger first, so the rest can report; then the
//! boot directory and paging; then the kernel space becomes the active one.

use kernel_alloc::vmm::{Vm, VmError, VmSpace};
use kernel_qemu::QemuLogger;
use kernel_vmem::{FrameAlloc, MachineVm};
use log::{LevelFilter, SetLoggerError, info};

static LOGGER: QemuLogger = QemuLogger::new(LevelFilter::Trace);

/// Install the debug console logger, reporting records up to `level`.
///
/// # Errors
/// If a logger is already installed.
pub fn init_logging(level: LevelFilter) -> Result<(), SetLoggerError> {
    LOGGER.init()?;
    log::set_max_level(level.min(LOGGER.max_level()));
    Ok(())
}

/// Bootstrap `machine` and hand back the memory manager with the kernel space.
///
/// # Errors
/// Whatever paging bring-up reports, typically running out of page tables.
pub fn start_vm<M, F>(machine: M, frames: F) -> Result<(Vm<M, F>, VmSpace<M::Object>), VmError>
where
    M: MachineVm,
    F: FrameAlloc,
{
    let (vm, kernel) = Vm::bootstrap(machine, frames)?;
    let zone = kernel.kernel_region();
    info!(
        "kernel space {:?}: zone {}+{:#x}, {} page(s) direct mapped",
        vm.kernel_object(),
        zone.address,
        zone.size,
        zone.page_count()
    );
    Ok((vm, kernel))
}

#[cfg(target_arch = "x86")]
pub use self::x86::*;

#[cfg(target_arch = "x86")]
mod x86 {
    use super::{init_logging, start_vm};
    use kernel_alloc::frame_alloc::BitmapFrameAlloc;
    use kernel_alloc::locked::LockedAlloc;
    use kernel_alloc::phys_mapper::DirectMapPhysMapper;
    use kernel_alloc::vmm::{Vm, VmError, VmSpace};
    use kernel_info::memory::{TABLE_POOL_END, TABLE_POOL_START};
    use kernel_registers::LoadRegisterUnsafe;
    use kernel_registers::cr0::Cr0;
    use kernel_registers::cr4::Cr4;
    use kernel_vmem::x86::{PageDirectory, X86Mmu, X86Vm};
    use log::{LevelFilter, info, warn};

    /// Frames for page directories and page tables.
    pub static TABLE_POOL: LockedAlloc<BitmapFrameAlloc> =
        LockedAlloc::new(BitmapFrameAlloc::new(TABLE_POOL_START, TABLE_POOL_END));

    /// Frames backing user regions.
    pub static FRAME_POOL: LockedAlloc<BitmapFrameAlloc> = LockedAlloc::new(BitmapFrameAlloc::from_layout());

    pub type KernelMachine = X86Vm<DirectMapPhysMapper, &'static LockedAlloc<BitmapFrameAlloc>, X86Mmu>;
    pub type KernelVm = Vm<KernelMachine, &'static LockedAlloc<BitmapFrameAlloc>>;

    /// Bring up logging and paging on the boot processor.
    ///
    /// Must run once, with the kernel still executing from identity-mapped
    /// physical memory.
    ///
    /// # Errors
    /// If paging cannot be brought up.
    pub fn init(level: LevelFilter) -> Result<(KernelVm, VmSpace<PageDirectory>), VmError> {
        if init_logging(level).is_err() {
            warn!("logger already installed");
        }
        let machine = X86Vm::new(DirectMapPhysMapper::from_layout(), &TABLE_POOL, X86Mmu);
        let started = start_vm(machine, &FRAME_POOL)?;
        log_control_bits();
        info!(
            "{} table frame(s), {} user frame(s) free",
            TABLE_POOL.with(|p| p.free_count()),
            FRAME_POOL.with(|p| p.free_count())
        );
        Ok(started)
    }

    fn log_control_bits() {
        let (cr0, cr4) = unsafe { (Cr0::load_unsafe(), Cr4::load_unsafe()) };
        info!(
            "CR0={:#010x} (PG={} WP={}) CR4={:#010x} (PGE={})",
            cr0.into_bits(),
            u8::from(cr0.pg_paging()),
            u8::from(cr0.wp_write_protect()),
            cr4.into_bits(),
            u8::from(cr4.pge())
        );
    }
}
