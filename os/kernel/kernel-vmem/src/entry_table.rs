//! # Entry Table (page directory / page table)
//!
//! Both levels of the 32-bit walk use the same container: a 4 KiB-aligned
//! array of 1024 [`PageEntryBits`].
//!
//! - [`DirectoryIndex`]: index for VA bits `[31:22]`.
//! - [`TableIndex`]: index for VA bits `[21:12]`.
//! - [`EntryTable`]: the table itself, plus allocation through a [`TableAlloc`].
//!
//! A fresh table has every entry not present; the hardware must never see a
//! table with stale contents.

use crate::{PageEntryBits, PhysMapper, TableAlloc};
use core::fmt;
use kernel_memory_addresses::{PhysicalPage, Size4K, Size4M, VirtualAddress};

/// Number of entries in a directory or table.
pub const ENTRY_COUNT: usize = 1024;

/// Index into the page directory (VA bits `[31:22]`).
#[repr(transparent)]
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct DirectoryIndex(u16);

/// Index into a page table (VA bits `[21:12]`).
#[repr(transparent)]
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct TableIndex(u16);

impl DirectoryIndex {
    #[inline]
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn from(va: VirtualAddress) -> Self {
        Self((va.as_u32() >> 22) as u16)
    }

    /// Construct from a raw index; asserts `v < 1024` in debug builds.
    #[inline]
    #[must_use]
    pub const fn new(v: u16) -> Self {
        debug_assert!((v as usize) < ENTRY_COUNT);
        Self(v)
    }

    #[inline]
    #[must_use]
    pub const fn as_usize(self) -> usize {
        self.0 as usize
    }

    /// First virtual address translated through this directory entry.
    #[inline]
    #[must_use]
    pub const fn base(self) -> VirtualAddress {
        VirtualAddress::new((self.0 as u32) << 22)
    }

    /// Iterate all indices whose 4 MiB span intersects `[start, start + size)`.
    #[allow(clippy::cast_possible_truncation)]
    pub fn covering(start: VirtualAddress, size: u32) -> impl Iterator<Item = Self> + Clone {
        let first = u64::from(start.as_u32()) >> 22;
        let end = (u64::from(start.as_u32()) + u64::from(size)).div_ceil(1 << 22);
        (first..end).map(|i| Self(i as u16))
    }
}

impl TableIndex {
    #[inline]
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn from(va: VirtualAddress) -> Self {
        Self(((va.as_u32() >> 12) & 0x3FF) as u16)
    }

    /// Construct from a raw index; asserts `v < 1024` in debug builds.
    #[inline]
    #[must_use]
    pub const fn new(v: u16) -> Self {
        debug_assert!((v as usize) < ENTRY_COUNT);
        Self(v)
    }

    #[inline]
    #[must_use]
    pub const fn as_usize(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Debug for DirectoryIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PDE#{}", self.0)
    }
}

impl fmt::Debug for TableIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PTE#{}", self.0)
    }
}

/// Split a virtual address into its directory and table indices.
#[inline]
#[must_use]
pub const fn split_indices(va: VirtualAddress) -> (DirectoryIndex, TableIndex) {
    (DirectoryIndex::from(va), TableIndex::from(va))
}

/// What a present directory entry refers to.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum DirectoryEntryKind {
    /// Points to a page table.
    Table(PhysicalPage<Size4K>, PageEntryBits),
    /// Maps a 4 MiB page directly (`PS=1`).
    Large(PhysicalPage<Size4M>, PageEntryBits),
}

impl DirectoryEntryKind {
    /// Decode a directory entry; `None` if it is not present.
    #[inline]
    #[must_use]
    pub const fn of(e: PageEntryBits) -> Option<Self> {
        if !e.present() {
            return None;
        }
        if e.large_page() {
            Some(Self::Large(
                PhysicalPage::containing_address(e.physical_address()),
                e,
            ))
        } else {
            Some(Self::Table(e.frame_page(), e))
        }
    }
}

/// A page directory or page table: 1024 entries, 4 KiB-aligned.
#[repr(C, align(4096))]
pub struct EntryTable {
    entries: [PageEntryBits; ENTRY_COUNT],
}

const _: () = {
    assert!(size_of::<EntryTable>() == 4096);
    assert!(align_of::<EntryTable>() == 4096);
};

impl EntryTable {
    /// A table with every entry not present.
    #[inline]
    #[must_use]
    pub const fn empty() -> Self {
        Self {
            entries: [PageEntryBits::new(); ENTRY_COUNT],
        }
    }

    /// Reset every entry to not present.
    #[inline]
    pub fn clear(&mut self) {
        self.entries.fill(PageEntryBits::new());
    }

    #[inline]
    #[must_use]
    pub const fn directory_entry(&self, i: DirectoryIndex) -> PageEntryBits {
        self.entries[i.as_usize()]
    }

    #[inline]
    pub const fn set_directory_entry(&mut self, i: DirectoryIndex, e: PageEntryBits) {
        self.entries[i.as_usize()] = e;
    }

    #[inline]
    #[must_use]
    pub const fn table_entry(&self, i: TableIndex) -> PageEntryBits {
        self.entries[i.as_usize()]
    }

    #[inline]
    pub const fn set_table_entry(&mut self, i: TableIndex, e: PageEntryBits) {
        self.entries[i.as_usize()] = e;
    }

    /// Whether any entry is present.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        !self.entries.iter().any(|e| e.present())
    }

    /// Number of present entries.
    #[inline]
    #[must_use]
    pub fn present_count(&self) -> usize {
        self.entries.iter().filter(|e| e.present()).count()
    }

    /// Allocate a table from `tables` and reset it to all not present.
    ///
    /// Returns `None` when the allocator is exhausted.
    ///
    /// # Panics
    /// If the allocator hands out storage that is not 4 KiB aligned; the
    /// hardware cannot reference such a table.
    pub fn alloc<T: TableAlloc + ?Sized, P: PhysMapper + ?Sized>(
        tables: &mut T,
        mapper: &P,
    ) -> Option<PhysicalPage<Size4K>> {
        let pa = tables.alloc_aligned(size_of::<Self>(), align_of::<Self>())?;
        let Some(page) = PhysicalPage::<Size4K>::try_from_aligned(pa) else {
            panic!("table allocator returned unaligned storage at {pa}");
        };

        // Safety: the frame was just handed to us and is not referenced anywhere else.
        unsafe { mapper.table_mut(page) }.clear();
        log::trace!("allocated entry table at {pa}");
        Some(page)
    }

    /// Return a table's storage to `tables`.
    ///
    /// The caller must have unlinked the table from every directory first.
    pub fn free<T: TableAlloc + ?Sized>(tables: &mut T, page: PhysicalPage<Size4K>) {
        log::trace!("freeing entry table at {}", page.base());
        tables.free(page.base(), size_of::<Self>());
    }
}

impl Default for EntryTable {
    fn default() -> Self {
        Self::empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kernel_memory_addresses::PhysicalAddress;

    #[test]
    fn indices_split_at_bits_22_and_12() {
        let (d, t) = split_indices(VirtualAddress::new(0x0040_1000));
        assert_eq!(d.as_usize(), 1);
        assert_eq!(t.as_usize(), 1);

        let (d, t) = split_indices(VirtualAddress::new(0xFFFF_FFFF));
        assert_eq!(d.as_usize(), 1023);
        assert_eq!(t.as_usize(), 1023);
    }

    #[test]
    fn covering_spans_partial_tables() {
        let v: Vec<_> = DirectoryIndex::covering(VirtualAddress::new(0x003F_F000), 0x2000)
            .map(DirectoryIndex::as_usize)
            .collect();
        assert_eq!(v, [0, 1]);
        assert_eq!(DirectoryIndex::covering(VirtualAddress::new(0xFFC0_0000), 0x40_0000).count(), 1);
        assert_eq!(DirectoryIndex::covering(VirtualAddress::new(0), 0).count(), 0);
    }

    #[test]
    fn empty_table_reports_no_present_entries() {
        let mut t = EntryTable::empty();
        assert!(t.is_empty());
        t.set_table_entry(TableIndex::new(5), PageEntryBits::new().with_present(true));
        assert_eq!(t.present_count(), 1);
        assert!(!t.is_empty());
        t.clear();
        assert!(t.is_empty());
    }

    #[test]
    fn directory_kind_distinguishes_large_pages() {
        let table = PageEntryBits::new()
            .with_present(true)
            .with_physical_address(PhysicalAddress::new(0x0080_1000));
        assert!(matches!(DirectoryEntryKind::of(table), Some(DirectoryEntryKind::Table(p, _)) if p.base().as_u32() == 0x0080_1000));

        let large = table
            .with_large_page(true)
            .with_physical_address(PhysicalAddress::new(0x0040_0000));
        assert!(matches!(DirectoryEntryKind::of(large), Some(DirectoryEntryKind::Large(p, _)) if p.base().as_u32() == 0x0040_0000));

        assert_eq!(DirectoryEntryKind::of(PageEntryBits::new()), None);
    }
}
