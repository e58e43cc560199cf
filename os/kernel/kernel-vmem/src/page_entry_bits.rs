use bitfield_struct::bitfield;
use kernel_memory_addresses::{PhysicalAddress, PhysicalPage, Size4K};

/// A single 32-bit x86 paging entry in its raw bitfield form.
///
/// The same layout serves both levels of the walk: a **directory entry**
/// (PDE) either points to a page table or, with `PS=1`, maps a 4 MiB page;
/// a **table entry** (PTE) always maps one 4 KiB page.
///
/// ### Bit layout
///
/// | Bits  | Name / Mnemonic   | Meaning |
/// |-------|-------------------|----------|
/// | 0     | `P` (present)     | Valid entry if set |
/// | 1     | `RW`              | Writable if set |
/// | 2     | `US`              | User-mode accessible if set |
/// | 3     | `PWT`             | Write-through caching |
/// | 4     | `PCD`             | Disable caching |
/// | 5     | `A`               | Accessed |
/// | 6     | `D`               | Dirty (leaf only) |
/// | 7     | `PS` / `PAT`      | 4 MiB page in a PDE, PAT in a PTE |
/// | 8     | `G`               | Global (leaf only, needs CR4.PGE) |
/// | 9     | OS: shared table  | Directory entry references a kernel table shared by all directories |
/// | 10–11 | OS avail          | Ignored by hardware |
/// | 12–31 | `addr`            | Physical frame bits [31:12] |
///
/// Permissions are the intersection over the walk: a page is writable (or
/// user accessible) only if both its directory entry and its table entry say so.
///
/// ### Example
/// ```rust
/// # use kernel_memory_addresses::PhysicalAddress;
/// # use kernel_vmem::PageEntryBits;
/// let e = PageEntryBits::new()
///     .with_present(true)
///     .with_writable(true)
///     .with_user_access(true)
///     .with_physical_address(PhysicalAddress::new(0x0010_0000));
/// assert_eq!(e.into_bits(), 0x0010_0007);
/// ```
#[bitfield(u32)]
#[derive(PartialEq, Eq)]
pub struct PageEntryBits {
    /// Present (P, bit 0).
    ///
    /// Clear means any access through this entry raises a page fault.
    pub present: bool,

    /// Writable (RW, bit 1).
    ///
    /// Supervisor writes ignore it unless CR0.WP is set.
    pub writable: bool,

    /// User/Supervisor (US, bit 2).
    pub user_access: bool,

    /// Page Write-Through (PWT, bit 3).
    pub write_through: bool,

    /// Page Cache Disable (PCD, bit 4).
    pub cache_disabled: bool,

    /// Accessed (A, bit 5). Set by the CPU.
    pub accessed: bool,

    /// Dirty (D, bit 6). Set by the CPU on first write through a leaf.
    pub dirty: bool,

    /// Page Size (PS, bit 7).
    ///
    /// In a directory entry: the entry maps a 4 MiB page instead of
    /// pointing to a page table (requires CR4.PSE). In a table entry this
    /// position is PAT and stays clear here.
    pub large_page: bool,

    /// Global (G, bit 8).
    ///
    /// The TLB keeps the translation across CR3 reloads when CR4.PGE is set.
    pub global: bool,

    /// Shared kernel table (bit 9, OS available).
    ///
    /// Marks a directory entry whose page table is owned by the kernel zone
    /// and referenced from every directory; such a table is never freed by
    /// unmapping or tearing down a single address space.
    pub shared_table: bool,

    /// Remaining OS-available bits (10..=11).
    #[bits(2)]
    pub os_available: u8,

    /// Physical address bits [31:12].
    #[bits(20)]
    frame: u32,
}

impl PageEntryBits {
    /// Point the entry at `phys`.
    ///
    /// # Panics
    /// If `phys` is not 4 KiB aligned.
    #[inline]
    pub const fn set_physical_address(&mut self, phys: PhysicalAddress) {
        assert!(phys.is_aligned::<Size4K>(), "entry address must be page aligned");
        self.set_frame(phys.as_u32() >> 12);
    }

    #[inline]
    #[must_use]
    pub const fn with_physical_address(mut self, phys: PhysicalAddress) -> Self {
        self.set_physical_address(phys);
        self
    }

    #[inline]
    #[must_use]
    pub const fn physical_address(&self) -> PhysicalAddress {
        PhysicalAddress::new(self.frame() << 12)
    }

    /// The 4 KiB frame this entry references (table or leaf page).
    #[inline]
    #[must_use]
    pub const fn frame_page(&self) -> PhysicalPage<Size4K> {
        PhysicalPage::containing_address(self.physical_address())
    }
}
