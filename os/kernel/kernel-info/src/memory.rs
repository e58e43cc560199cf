//! # Memory Layout

use kernel_memory_addresses::{PhysicalAddress, VirtualAddress};

/// Size of a base page, in bytes.
pub const PAGE_SIZE: u32 = 4096;

/// Number of 32-bit entries in a page directory or page table.
pub const ENTRIES_PER_TABLE: usize = 1024;

/// Span of virtual memory covered by one directory entry (one page table).
pub const TABLE_SPAN: u32 = PAGE_SIZE * ENTRIES_PER_TABLE as u32;

/// First virtual address of the kernel zone.
pub const KERNEL_VM_START: VirtualAddress = VirtualAddress::new(0x0000_0000);

/// Size of the kernel zone. The kernel zone is direct mapped onto physical
/// memory starting at [`KERNEL_PHYS_START`].
pub const KERNEL_VM_SIZE: u32 = 0x4000_0000; // 1 GiB

/// Physical address backing [`KERNEL_VM_START`].
pub const KERNEL_PHYS_START: PhysicalAddress = PhysicalAddress::new(0x0000_0000);

/// Where the kernel image is placed in physical memory.
pub const PHYS_LOAD: PhysicalAddress = PhysicalAddress::new(0x0010_0000); // 1 MiB

/// First virtual address available to user regions.
pub const USER_VM_START: VirtualAddress = VirtualAddress::new(KERNEL_VM_START.as_u32() + KERNEL_VM_SIZE);

/// Exclusive end of the user zone; the topmost page is never mapped.
pub const USER_VM_END: VirtualAddress = VirtualAddress::new(0xFFFF_F000);

/// Initial (empty) program break of a fresh address space.
pub const USER_HEAP_START: VirtualAddress = VirtualAddress::new(0x5000_0000);

/// The user stack region ends here and grows downward.
pub const USER_STACK_TOP: VirtualAddress = VirtualAddress::new(0xC000_0000);

/// Default size of the user stack region.
pub const USER_STACK_SIZE: u32 = 64 * 1024;

/// Physical range serving entry-table allocations (page directories and page tables).
pub const TABLE_POOL_START: PhysicalAddress = PhysicalAddress::new(0x0080_0000);

/// Exclusive end of the entry-table pool.
pub const TABLE_POOL_END: PhysicalAddress = PhysicalAddress::new(0x0100_0000);

/// Physical range serving pages for user regions.
pub const USER_FRAMES_START: PhysicalAddress = PhysicalAddress::new(0x0100_0000);

/// Exclusive end of the user page range.
pub const USER_FRAMES_END: PhysicalAddress = PhysicalAddress::new(0x1000_0000);

const _: () = {
    assert!(PAGE_SIZE.is_power_of_two());
    assert!(KERNEL_VM_SIZE.is_multiple_of(TABLE_SPAN));
    assert!(KERNEL_VM_START.as_u32().is_multiple_of(TABLE_SPAN));
    assert!(USER_VM_START.as_u32() < USER_HEAP_START.as_u32());
    assert!(USER_HEAP_START.as_u32() < USER_STACK_TOP.as_u32() - USER_STACK_SIZE);
    assert!(USER_STACK_TOP.as_u32() < USER_VM_END.as_u32());
    assert!(USER_STACK_SIZE.is_multiple_of(PAGE_SIZE));
    assert!(PHYS_LOAD.as_u32() < TABLE_POOL_START.as_u32());
    assert!(TABLE_POOL_END.as_u32() <= USER_FRAMES_START.as_u32());
    assert!(USER_FRAMES_END.as_u32() <= KERNEL_PHYS_START.as_u32() + KERNEL_VM_SIZE);
};
