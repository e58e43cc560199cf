use crate::Mmu;
use kernel_memory_addresses::{PhysicalPage, Size4K, VirtualPage};
use kernel_registers::cr0::Cr0;
use kernel_registers::cr3::Cr3;
use kernel_registers::cr4::Cr4;
use kernel_registers::{LoadRegisterUnsafe, StoreRegisterUnsafe};
use kernel_sync::InterruptControl;
use kernel_sync::irq::LocalCpu;

/// The MMU of the executing processor.
#[derive(Debug, Default, Copy, Clone)]
pub struct X86Mmu;

impl InterruptControl for X86Mmu {
    #[inline]
    fn interrupts_enabled(&self) -> bool {
        LocalCpu.interrupts_enabled()
    }

    #[inline]
    fn disable_interrupts(&self) {
        LocalCpu.disable_interrupts();
    }

    #[inline]
    fn enable_interrupts(&self) {
        LocalCpu.enable_interrupts();
    }
}

impl Mmu for X86Mmu {
    #[inline]
    fn invalidate_page(&self, page: VirtualPage<Size4K>) {
        let va = page.base().as_u32();
        unsafe {
            core::arch::asm!("invlpg [{}]", in(reg) va, options(nostack, preserves_flags));
        }
    }

    fn flush_tlb(&self) {
        unsafe {
            let cr4 = Cr4::load_unsafe();
            if cr4.pge() {
                // Toggling PGE drops global entries too.
                cr4.with_pge(false).store_unsafe();
                cr4.store_unsafe();
            } else {
                Cr3::load_unsafe().store_unsafe();
            }
        }
    }

    #[inline]
    fn active_directory(&self) -> PhysicalPage<Size4K> {
        unsafe { Cr3::load_unsafe() }.directory()
    }

    #[inline]
    unsafe fn load_directory(&self, directory: PhysicalPage<Size4K>) {
        unsafe { Cr3::from_directory(directory).store_unsafe() }
    }

    unsafe fn enable_paging(&self) {
        unsafe {
            let cr0 = Cr0::load_unsafe();
            cr0.with_pg_paging(true).store_unsafe();
        }
    }

    unsafe fn enable_global_pages(&self) {
        unsafe {
            let cr4 = Cr4::load_unsafe();
            cr4.with_pge(true).store_unsafe();
        }
    }

    unsafe fn enable_write_protect(&self) {
        unsafe {
            let cr0 = Cr0::load_unsafe();
            cr0.with_wp_write_protect(true).store_unsafe();
        }
    }
}
