use crate::{MemoryAddressOffset, MemoryPage, PageSize, PhysicalAddress};
use core::fmt;

/// Physical memory page (frame) base for size `S`.
///
/// ### Invariants
/// - The low `S::SHIFT` bits of the base are always zero (page aligned).
///
/// ### Examples
/// ```rust
/// # use kernel_memory_addresses::*;
/// let vp = PhysicalPage::<Size4K>::try_from_aligned(PhysicalAddress::new(0x0010_0000)).unwrap();
/// assert_eq!(vp.checked_add_pages(1).unwrap().base().as_u32(), 0x0010_1000);
/// assert!(PhysicalPage::<Size4K>::try_from_aligned(PhysicalAddress::new(0x0010_0800)).is_none());
/// ```
#[repr(transparent)]
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct PhysicalPage<S: PageSize>(pub(crate) MemoryPage<S>);

impl<S: PageSize> PhysicalPage<S> {
    #[inline]
    #[must_use]
    pub const fn from_page(p: MemoryPage<S>) -> Self {
        Self(p)
    }

    /// Page that contains `addr` (aligns down to page boundary).
    #[inline]
    #[must_use]
    pub const fn containing_address(addr: PhysicalAddress) -> Self {
        Self(MemoryPage::from_addr(addr.0))
    }

    /// Page starting exactly at `addr`; `None` if `addr` is not `S`-aligned.
    #[inline]
    #[must_use]
    pub const fn try_from_aligned(addr: PhysicalAddress) -> Option<Self> {
        match MemoryPage::try_from_aligned(addr.0) {
            Some(p) => Some(Self(p)),
            None => None,
        }
    }

    #[inline]
    #[must_use]
    pub const fn base(self) -> PhysicalAddress {
        PhysicalAddress(self.0.base())
    }

    #[inline]
    #[must_use]
    pub const fn join(self, off: MemoryAddressOffset<S>) -> PhysicalAddress {
        PhysicalAddress(self.0.join(off))
    }

    #[inline]
    #[must_use]
    pub const fn checked_add_pages(self, count: u32) -> Option<Self> {
        match self.0.checked_add_pages(count) {
            Some(p) => Some(Self(p)),
            None => None,
        }
    }
}

impl<S> fmt::Display for PhysicalPage<S>
where
    S: PageSize,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl<S: PageSize> fmt::Debug for PhysicalPage<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PhysicalPage<{}>(0x{:08X})", S::as_str(), self.0.base().as_u32())
    }
}

impl<S: PageSize> TryFrom<PhysicalAddress> for PhysicalPage<S> {
    type Error = PhysicalAddress;

    #[inline]
    fn try_from(va: PhysicalAddress) -> Result<Self, PhysicalAddress> {
        Self::try_from_aligned(va).ok_or(va)
    }
}

impl<S> From<MemoryPage<S>> for PhysicalPage<S>
where
    S: PageSize,
{
    #[inline]
    fn from(p: MemoryPage<S>) -> Self {
        Self(p)
    }
}
