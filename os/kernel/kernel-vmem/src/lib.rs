//! # Virtual Memory Support
//!
//! Two-level 32-bit x86 paging: entry tables, a page mapper with
//! all-or-nothing batches, and the machine interface the architecture-neutral
//! address-space model drives.
//!
//! ## What you get
//! - [`PageEntryBits`]: the 32-bit directory/table entry as a bitfield.
//! - [`EntryTable`]: a 4 KiB-aligned array of 1024 entries, used for both levels.
//! - [`AddressSpace`]: map / unmap / translate within one page directory.
//! - [`machine::MachineVm`]: the capability set an architecture provides, and
//!   [`x86::X86Vm`], its 32-bit x86 implementation.
//! - Allocation and hardware seams ([`FrameAlloc`], [`TableAlloc`],
//!   [`PhysMapper`], [`Mmu`]) so all of the above runs against simulated RAM
//!   on the host.
//!
//! ## x86 Virtual Address → Physical Address Walk
//!
//! ```text
//! | 31‒22     | 21‒12 | 11‒0   |
//! | Directory | Table | Offset |
//! ```
//!
//! ```text
//!  CR3 → Page Directory ─┬─► PDE (PS=0) → Page Table → PTE → 4 KiB page
//!                        └─► PDE (PS=1) ─────────────────────► 4 MiB page
//! ```
//!
//! | Level | Table | Entry | Description |
//! |:------|:------|:------|:------------|
//! | 1 | Page Directory | PDE | One per address space, referenced by CR3. Points to a page table or maps a 4 MiB page. |
//! | 2 | Page Table | PTE | Maps one 4 KiB page. |
//!
//! A directory entry is created on demand the first time a page in its 4 MiB
//! span is mapped, and the table behind it is released again once its last
//! page is unmapped. Directory entries covering the kernel zone point to
//! tables shared by every address space and are never released.

#![cfg_attr(not(test), no_std)]
#![allow(unsafe_code, clippy::inline_always)]

pub mod address_space;
pub mod entry_table;
pub mod machine;
mod page_entry_bits;
mod vm_flags;
pub mod x86;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

extern crate alloc;

pub use crate::address_space::{AddressSpace, AlignmentViolation, MapError, NotMapped};
pub use crate::entry_table::{DirectoryIndex, EntryTable, TableIndex};
pub use crate::machine::{KernelZone, MachineError, MachineVm};
pub use crate::page_entry_bits::PageEntryBits;
pub use crate::vm_flags::VmFlags;
use kernel_memory_addresses::{PhysicalAddress, PhysicalPage, Size4K, VirtualPage};
use kernel_sync::InterruptControl;

/// Re-export constants as info module.
pub use kernel_info::memory as info;

/// Source of physical 4 KiB pages backing region contents.
///
/// A single global resource in the kernel; implementations are not required to
/// be re-entrant. Returns `None` on out-of-memory.
pub trait FrameAlloc {
    fn alloc_page(&mut self) -> Option<PhysicalPage<Size4K>>;

    /// Return a page previously handed out by [`alloc_page`](Self::alloc_page).
    fn free_page(&mut self, page: PhysicalPage<Size4K>);
}

impl<T: FrameAlloc + ?Sized> FrameAlloc for &mut T {
    #[inline]
    fn alloc_page(&mut self) -> Option<PhysicalPage<Size4K>> {
        (**self).alloc_page()
    }

    #[inline]
    fn free_page(&mut self, page: PhysicalPage<Size4K>) {
        (**self).free_page(page);
    }
}

/// Kernel allocator for entry-table storage.
///
/// The returned storage must be addressable through the [`PhysMapper`] in use
/// and honour `align`; entry tables ask for 4096 bytes aligned to 4096.
pub trait TableAlloc {
    fn alloc_aligned(&mut self, size: usize, align: usize) -> Option<PhysicalAddress>;

    fn free(&mut self, addr: PhysicalAddress, size: usize);
}

impl<T: TableAlloc + ?Sized> TableAlloc for &mut T {
    #[inline]
    fn alloc_aligned(&mut self, size: usize, align: usize) -> Option<PhysicalAddress> {
        (**self).alloc_aligned(size, align)
    }

    #[inline]
    fn free(&mut self, addr: PhysicalAddress, size: usize) {
        (**self).free(addr, size);
    }
}

/// Converts physical addresses to *temporarily* usable references in the
/// current virtual address space (in the kernel: through the kernel-zone
/// direct map).
///
/// # Safety
/// - `pa` must be mapped writable in the current address space.
/// - Lifetime `'a` is unchecked; the mapping must stay valid for `'a`.
/// - Type `T` must match the bytes at `pa`, and no other reference to the
///   same bytes may be live while the returned one is used.
pub trait PhysMapper {
    /// # Safety
    /// See the trait documentation.
    unsafe fn phys_to_mut<'a, T>(&self, pa: PhysicalAddress) -> &'a mut T;

    /// View the frame at `page` as an [`EntryTable`].
    ///
    /// # Safety
    /// See the trait documentation.
    #[inline]
    unsafe fn table_mut<'a>(&self, page: PhysicalPage<Size4K>) -> &'a mut EntryTable {
        unsafe { self.phys_to_mut::<EntryTable>(page.base()) }
    }
}

impl<P: PhysMapper> PhysMapper for &P {
    #[inline]
    unsafe fn phys_to_mut<'a, T>(&self, pa: PhysicalAddress) -> &'a mut T {
        unsafe { (**self).phys_to_mut(pa) }
    }
}

/// The translation hardware of the executing processor.
///
/// Changing CR0/CR3/CR4 or invalidating translations must happen with
/// interrupts disabled; callers hold an [`IrqGuard`](kernel_sync::IrqGuard)
/// over the [`InterruptControl`] half of this trait while doing so.
pub trait Mmu: InterruptControl {
    /// Drop any cached translation of `page` (`invlpg`).
    fn invalidate_page(&self, page: VirtualPage<Size4K>);

    /// Drop every cached translation, global ones included.
    fn flush_tlb(&self);

    /// The page directory currently referenced by CR3.
    fn active_directory(&self) -> PhysicalPage<Size4K>;

    /// Load CR3.
    ///
    /// # Safety
    /// The directory must map the executing code, its stack and the kernel zone.
    unsafe fn load_directory(&self, directory: PhysicalPage<Size4K>);

    /// Set CR0.PG.
    ///
    /// # Safety
    /// CR3 must reference a directory that identity-maps the executing code.
    unsafe fn enable_paging(&self);

    /// Set CR4.PGE.
    ///
    /// # Safety
    /// Global entries must only be used for mappings identical in every address space.
    unsafe fn enable_global_pages(&self);

    /// Set CR0.WP.
    ///
    /// # Safety
    /// Kernel code relying on writing to read-only pages breaks afterwards.
    unsafe fn enable_write_protect(&self);
}

impl<M: Mmu + ?Sized> Mmu for &M {
    #[inline]
    fn invalidate_page(&self, page: VirtualPage<Size4K>) {
        (**self).invalidate_page(page);
    }

    #[inline]
    fn flush_tlb(&self) {
        (**self).flush_tlb();
    }

    #[inline]
    fn active_directory(&self) -> PhysicalPage<Size4K> {
        (**self).active_directory()
    }

    #[inline]
    unsafe fn load_directory(&self, directory: PhysicalPage<Size4K>) {
        unsafe { (**self).load_directory(directory) }
    }

    #[inline]
    unsafe fn enable_paging(&self) {
        unsafe { (**self).enable_paging() }
    }

    #[inline]
    unsafe fn enable_global_pages(&self) {
        unsafe { (**self).enable_global_pages() }
    }

    #[inline]
    unsafe fn enable_write_protect(&self) {
        unsafe { (**self).enable_write_protect() }
    }
}

/// Align `x` up to the nearest multiple of `a`, or `None` if that overflows `u32`.
///
/// `a` must be a non-zero power of two.
///
/// ### Examples
/// ```rust
/// # use kernel_vmem::checked_align_up;
/// assert_eq!(checked_align_up(0,    4096), Some(0));
/// assert_eq!(checked_align_up(1,    4096), Some(4096));
/// assert_eq!(checked_align_up(4096, 4096), Some(4096));
/// assert_eq!(checked_align_up(0xFFFF_F001, 4096), None);
/// ```
#[inline(always)]
#[must_use]
pub const fn checked_align_up(x: u32, a: u32) -> Option<u32> {
    debug_assert!(a.is_power_of_two());
    match x.checked_add(a - 1) {
        Some(v) => Some(v & !(a - 1)),
        None => None,
    }
}
