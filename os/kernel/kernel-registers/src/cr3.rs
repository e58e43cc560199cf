use bitfield_struct::bitfield;
use kernel_memory_addresses::{PhysicalAddress, PhysicalPage, Size4K};

/// CR3: Page-Directory Base Register (32-bit paging).
///
/// Holds the physical base address of the active page directory and the
/// cache-control flags used when the walker reads it.
#[bitfield(u32)]
pub struct Cr3 {
    #[bits(3, default = 0)]
    _reserved_0_2: u8,

    /// Bit 3: PWT: Page-level Write-Through for the directory.
    pub pwt: bool,

    /// Bit 4: PCD: Page-level Cache Disable for the directory.
    pub pcd: bool,

    #[bits(7, default = 0)]
    _reserved_5_11: u8,

    /// Bits 12–31: Page directory physical base >> 12.
    #[bits(20)]
    directory_base_4k: u32,
}

impl Cr3 {
    /// Build a `Cr3` value that selects the directory at `directory`.
    #[must_use]
    pub const fn from_directory(directory: PhysicalPage<Size4K>) -> Self {
        Self::new().with_directory_base_4k(directory.base().as_u32() >> 12)
    }

    /// Physical page holding the page directory.
    #[must_use]
    pub const fn directory(&self) -> PhysicalPage<Size4K> {
        PhysicalPage::containing_address(PhysicalAddress::new(self.directory_base_4k() << 12))
    }
}

#[cfg(all(feature = "asm", target_arch = "x86"))]
impl crate::LoadRegisterUnsafe for Cr3 {
    unsafe fn load_unsafe() -> Self {
        let cr3: u32;
        unsafe {
            core::arch::asm!("mov {}, cr3", out(reg) cr3, options(nomem, nostack, preserves_flags));
        }
        Self::from_bits(cr3)
    }
}

/// Writing CR3 also flushes every non-global TLB entry.
#[cfg(all(feature = "asm", target_arch = "x86"))]
impl crate::StoreRegisterUnsafe for Cr3 {
    unsafe fn store_unsafe(self) {
        let cr3 = self.into_bits();
        unsafe {
            core::arch::asm!("mov cr3, {}", in(reg) cr3, options(nostack, preserves_flags));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn directory_round_trips_through_register_value() {
        let dir = PhysicalPage::containing_address(PhysicalAddress::new(0x0080_3000));
        let cr3 = Cr3::from_directory(dir).with_pcd(true);
        assert_eq!(cr3.into_bits(), 0x0080_3010);
        assert_eq!(cr3.directory(), dir);
    }
}
