use kernel_info::memory::PAGE_SIZE;
use kernel_memory_addresses::{Size4K, VirtualAddress, VirtualPage};
use kernel_vmem::VmFlags;

/// A contiguous, page-aligned virtual range with one set of flags.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct VmRegion {
    pub address: VirtualAddress,
    pub size: u32,
    pub flags: VmFlags,
    /// Pages of the region not yet backed by a physical frame.
    pub unfulfilled_ppages: u32,
}

impl VmRegion {
    /// An empty region anchored at `address`.
    #[must_use]
    pub const fn empty(address: VirtualAddress, flags: VmFlags) -> Self {
        Self {
            address,
            size: 0,
            flags,
            unfulfilled_ppages: 0,
        }
    }

    #[inline]
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// Exclusive end (may be `2^32`).
    #[inline]
    #[must_use]
    pub const fn end(&self) -> u64 {
        self.address.as_u32() as u64 + self.size as u64
    }

    #[inline]
    #[must_use]
    pub const fn page_count(&self) -> u32 {
        self.size / PAGE_SIZE
    }

    #[must_use]
    pub const fn contains(&self, va: VirtualAddress) -> bool {
        va.as_u32() >= self.address.as_u32() && (va.as_u32() as u64) < self.end()
    }

    /// Whether the region shares at least one byte with `[start, end)`.
    #[must_use]
    pub const fn overlaps(&self, start: u64, end: u64) -> bool {
        !self.is_empty() && start < end && (self.address.as_u32() as u64) < end && start < self.end()
    }

    /// Every page of the region, in ascending order.
    pub fn pages(&self) -> impl Iterator<Item = VirtualPage<Size4K>> + Clone + use<> {
        let first = VirtualPage::containing_address(self.address);
        (0..self.page_count()).filter_map(move |i| first.checked_add_pages(i))
    }

    /// The part of the region inside `[start, end)`, if any.
    #[must_use]
    pub fn intersect(&self, start: u64, end: u64) -> Option<(u64, u64)> {
        let lo = start.max(u64::from(self.address.as_u32()));
        let hi = end.min(self.end());
        (lo < hi).then_some((lo, hi))
    }

    /// Same flags over `[start, end)`, with no fulfilment accounting.
    #[allow(clippy::cast_possible_truncation)]
    pub(crate) const fn piece(&self, start: u64, end: u64) -> Self {
        Self {
            address: VirtualAddress::new(start as u32),
            size: (end - start) as u32,
            flags: self.flags,
            unfulfilled_ppages: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn region(address: u32, size: u32) -> VmRegion {
        VmRegion {
            address: VirtualAddress::new(address),
            size,
            flags: VmFlags::READ,
            unfulfilled_ppages: 0,
        }
    }

    #[test]
    fn bounds_are_half_open() {
        let r = region(0x4000_0000, 0x3000);
        assert!(r.contains(VirtualAddress::new(0x4000_2FFF)));
        assert!(!r.contains(VirtualAddress::new(0x4000_3000)));
        assert!(r.overlaps(0x4000_2000, 0x4000_5000));
        assert!(!r.overlaps(0x4000_3000, 0x4000_5000));
        assert!(!r.overlaps(0x3FFF_F000, 0x4000_0000));
        assert_eq!(r.page_count(), 3);
        assert_eq!(r.pages().count(), 3);
    }

    #[test]
    fn region_reaching_the_top_of_memory() {
        let r = region(0xFFFF_E000, 0x2000);
        assert_eq!(r.end(), 1 << 32);
        assert!(r.contains(VirtualAddress::new(0xFFFF_FFFF)));
        assert_eq!(r.pages().last(), Some(VirtualPage::containing_address(VirtualAddress::new(0xFFFF_F000))));
    }

    #[test]
    fn empty_regions_overlap_nothing() {
        let r = region(0x5000_0000, 0);
        assert!(!r.overlaps(0, 1 << 32));
        assert!(!r.contains(VirtualAddress::new(0x5000_0000)));
    }

    #[test]
    fn intersection_clips_to_both_ranges() {
        let r = region(0x4000_0000, 0x4000);
        assert_eq!(r.intersect(0x4000_1000, 0x5000_0000), Some((0x4000_1000, 0x4000_4000)));
        assert_eq!(r.intersect(0x4000_4000, 0x5000_0000), None);
    }
}
