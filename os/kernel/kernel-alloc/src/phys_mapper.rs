//! # Direct-map `PhysMapper`
//!
//! The kernel zone maps physical memory at a fixed offset (on the layout in
//! `kernel-info`, identity). Any physical address inside the zone's backing
//! range is therefore reachable at `virt_start + (pa - phys_start)` in every
//! address space, which is all the page mapper needs to edit entry tables.

use kernel_memory_addresses::PhysicalAddress;
use kernel_vmem::{KernelZone, PhysMapper};

/// [`PhysMapper`] through the kernel-zone direct map.
#[derive(Debug, Copy, Clone)]
pub struct DirectMapPhysMapper {
    zone: KernelZone,
}

impl DirectMapPhysMapper {
    #[must_use]
    pub const fn new(zone: KernelZone) -> Self {
        Self { zone }
    }

    #[must_use]
    pub const fn from_layout() -> Self {
        Self::new(KernelZone::from_layout())
    }

    /// Kernel virtual address of `pa`, if the direct map covers it.
    #[must_use]
    pub const fn virtual_address_of(&self, pa: PhysicalAddress) -> Option<u32> {
        let start = self.zone.phys_start.as_u32();
        let pa = pa.as_u32();
        if pa < start || pa - start >= self.zone.size {
            return None;
        }
        Some(self.zone.virt_start.as_u32() + (pa - start))
    }
}

impl Default for DirectMapPhysMapper {
    fn default() -> Self {
        Self::from_layout()
    }
}

impl PhysMapper for DirectMapPhysMapper {
    unsafe fn phys_to_mut<'a, T>(&self, pa: PhysicalAddress) -> &'a mut T {
        let Some(va) = self.virtual_address_of(pa) else {
            panic!("{pa} is outside the kernel direct map");
        };
        // Safety: the caller guarantees the frame holds a `T` and is not aliased.
        unsafe { &mut *(va as usize as *mut T) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kernel_memory_addresses::VirtualAddress;

    #[test]
    fn offsets_into_the_zone() {
        let m = DirectMapPhysMapper::new(KernelZone {
            virt_start: VirtualAddress::new(0xC000_0000),
            phys_start: PhysicalAddress::new(0x0010_0000),
            size: 0x0040_0000,
        });
        assert_eq!(m.virtual_address_of(PhysicalAddress::new(0x0010_2000)), Some(0xC000_2000));
        assert_eq!(m.virtual_address_of(PhysicalAddress::new(0x000F_F000)), None);
        assert_eq!(m.virtual_address_of(PhysicalAddress::new(0x0050_0000)), None);
    }

    #[test]
    fn layout_map_is_identity() {
        let m = DirectMapPhysMapper::from_layout();
        assert_eq!(m.virtual_address_of(PhysicalAddress::new(0x0080_0000)), Some(0x0080_0000));
        assert_eq!(m.virtual_address_of(PhysicalAddress::new(0x4000_0000)), None);
    }
}
