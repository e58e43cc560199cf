//! # Address Space (32-bit x86, directory-rooted)
//!
//! The page mapper: strongly-typed helpers that build and manipulate a
//! **single** virtual address space, i.e. one page directory and the page
//! tables hanging off it.
//!
//! ## Highlights
//!
//! - [`AddressSpace::map_pages`] installs a batch of 4 KiB mappings with
//!   all-or-nothing semantics: on failure every entry written and every table
//!   allocated by the batch is reverted.
//! - [`AddressSpace::unmap_pages`] clears mappings, hands the released frames
//!   back to the caller and frees page tables that became empty.
//! - [`AddressSpace::translate`] walks the two levels like the hardware does.
//! - [`AddressSpace::release`] tears the whole directory down.
//!
//! ## TLB maintenance
//!
//! Overwriting or clearing an entry that was present is followed by an
//! `invlpg` for that page. Installing a mapping where nothing was present does
//! not need one; the hardware never caches non-present translations.

mod undo_log;

use crate::address_space::undo_log::{Undo, UndoLog};
use crate::entry_table::{DirectoryEntryKind, DirectoryIndex, EntryTable, split_indices};
use crate::{Mmu, PageEntryBits, PhysMapper, TableAlloc, VmFlags};
use kernel_memory_addresses::{PhysicalAddress, PhysicalPage, Size4K, Size4M, VirtualAddress, VirtualPage};
use log::{debug, trace, warn};

/// Handle to a single, concrete address space.
pub struct AddressSpace<'m, P: PhysMapper> {
    root: PhysicalPage<Size4K>,
    mapper: &'m P,
}

/// The page directory of an [`AddressSpace`].
pub type RootPage = PhysicalPage<Size4K>;

/// An address handed to the mapper is not aligned to the page size.
#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AlignmentViolation {
    #[error("virtual address {0} is not page aligned")]
    Virtual(VirtualAddress),
    #[error("physical address {0} is not page aligned")]
    Physical(PhysicalAddress),
    #[error("size {0:#x} is not a multiple of the page size")]
    Size(u32),
}

/// No present translation exists for the address.
#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{0} is not mapped")]
pub struct NotMapped(pub VirtualAddress);

#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MapError {
    /// A page table (or bookkeeping for the batch) could not be allocated.
    #[error("out of memory while mapping page {index} of the batch")]
    OutOfMemory { index: usize },
    #[error(transparent)]
    AlignmentViolation(#[from] AlignmentViolation),
    /// The 4 MiB span containing the address is mapped by a `PS=1` directory entry.
    #[error("{0} is covered by a 4 MiB directory entry")]
    LargePageConflict(VirtualAddress),
}

impl<'m, P: PhysMapper> AddressSpace<'m, P> {
    /// Wrap an existing directory.
    #[inline]
    pub const fn from_root(mapper: &'m P, root: RootPage) -> Self {
        Self { root, mapper }
    }

    /// Allocate an empty directory. `None` if `tables` is exhausted.
    pub fn create<T: TableAlloc + ?Sized>(mapper: &'m P, tables: &mut T) -> Option<Self> {
        let root = EntryTable::alloc(tables, mapper)?;
        debug!("created page directory at {}", root.base());
        Some(Self { root, mapper })
    }

    /// Physical page of the directory.
    #[inline]
    pub const fn root_page(&self) -> RootPage {
        self.root
    }

    #[inline]
    pub(crate) fn directory(&self) -> &'m mut EntryTable {
        // Safety: the root frame is a directory owned by this address space.
        unsafe { self.mapper.table_mut(self.root) }
    }

    #[inline]
    pub(crate) fn table(&self, page: PhysicalPage<Size4K>) -> &'m mut EntryTable {
        // Safety: `page` was read from a present, non-PS directory entry of this space.
        unsafe { self.mapper.table_mut(page) }
    }

    /// Map a batch of `(virtual page, physical page)` pairs with `flags`.
    ///
    /// Every address is validated before anything is touched; a misaligned
    /// pair fails the whole call with [`MapError::AlignmentViolation`]. Missing
    /// page tables are allocated on demand. If any pair cannot be installed,
    /// every change made by this call is reverted before the error is
    /// returned.
    ///
    /// Returns the number of pages mapped.
    ///
    /// # Errors
    /// - [`MapError::AlignmentViolation`] for an unaligned address (nothing mutated).
    /// - [`MapError::OutOfMemory`] when a page table cannot be allocated.
    /// - [`MapError::LargePageConflict`] when a pair falls under a 4 MiB entry.
    pub fn map_pages<I, T, U>(&self, tables: &mut T, mmu: &U, pages: I, flags: VmFlags) -> Result<usize, MapError>
    where
        I: IntoIterator<Item = (VirtualAddress, PhysicalAddress)>,
        I::IntoIter: Clone,
        T: TableAlloc + ?Sized,
        U: Mmu + ?Sized,
    {
        let pages = pages.into_iter();
        for (va, pa) in pages.clone() {
            if !va.is_aligned::<Size4K>() {
                return Err(AlignmentViolation::Virtual(va).into());
            }
            if !pa.is_aligned::<Size4K>() {
                return Err(AlignmentViolation::Physical(pa).into());
            }
        }

        let mut undo = UndoLog::with_capacity(pages.size_hint().0)
            .map_err(|_| MapError::OutOfMemory { index: 0 })?;
        let leaf_bits = flags.entry_bits();
        let dir_bits = flags.directory_bits();

        let mut count = 0;
        for (index, (va, pa)) in pages.enumerate() {
            if let Err(e) = self.map_one(tables, mmu, &mut undo, index, va, pa, leaf_bits, dir_bits) {
                warn!(
                    "mapping {va} -> {pa} failed: {e}; reverting {} change(s) of the batch",
                    undo.len()
                );
                undo.rollback(self, tables, mmu);
                return Err(e);
            }
            count += 1;
        }

        debug!("mapped {count} page(s) with {flags:?} in directory {}", self.root.base());
        Ok(count)
    }

    #[allow(clippy::too_many_arguments)]
    fn map_one<T, U>(
        &self,
        tables: &mut T,
        mmu: &U,
        undo: &mut UndoLog,
        index: usize,
        va: VirtualAddress,
        pa: PhysicalAddress,
        leaf_bits: PageEntryBits,
        dir_bits: PageEntryBits,
    ) -> Result<(), MapError>
    where
        T: TableAlloc + ?Sized,
        U: Mmu + ?Sized,
    {
        // At most one directory record plus one leaf record per page.
        undo.reserve(2).map_err(|_| MapError::OutOfMemory { index })?;

        let (di, ti) = split_indices(va);
        let pde = self.directory().directory_entry(di);
        let table = match DirectoryEntryKind::of(pde) {
            Some(DirectoryEntryKind::Large(..)) => return Err(MapError::LargePageConflict(va)),
            Some(DirectoryEntryKind::Table(table, bits)) => {
                let widened = bits
                    .with_writable(bits.writable() || dir_bits.writable())
                    .with_user_access(bits.user_access() || dir_bits.user_access());
                if widened != bits {
                    undo.push(Undo::Directory {
                        index: di,
                        previous: bits,
                    });
                    self.directory().set_directory_entry(di, widened);
                }
                table
            }
            None => {
                let table = EntryTable::alloc(tables, self.mapper).ok_or(MapError::OutOfMemory { index })?;
                let entry = dir_bits.with_present(true).with_physical_address(table.base());
                self.directory().set_directory_entry(di, entry);
                undo.push(Undo::NewTable {
                    index: di,
                    table,
                    previous: pde,
                });
                trace!("linked page table {} at {di:?} for {va}", table.base());
                table
            }
        };

        let t = self.table(table);
        let previous = t.table_entry(ti);
        undo.push(Undo::Leaf {
            table,
            index: ti,
            va,
            previous,
        });
        t.set_table_entry(ti, leaf_bits.with_present(true).with_physical_address(pa));
        if previous.present() {
            mmu.invalidate_page(va.page());
        }
        trace!("mapped {va} -> {pa}");

        debug_assert_eq!(
            self.translate(va),
            Ok(pa),
            "translation self-check failed for {va}"
        );
        Ok(())
    }

    /// Remove the mappings of `pages`.
    ///
    /// Pages without a present translation are skipped, so unmapping is
    /// idempotent. For every mapping removed, `released` receives the page and
    /// the physical frame it referenced. Page tables left without any present
    /// entry are freed and unlinked, except shared kernel tables.
    ///
    /// Returns the number of mappings removed.
    pub fn unmap_pages<I, T, U, F>(&self, tables: &mut T, mmu: &U, pages: I, mut released: F) -> usize
    where
        I: IntoIterator<Item = VirtualPage<Size4K>>,
        T: TableAlloc + ?Sized,
        U: Mmu + ?Sized,
        F: FnMut(VirtualPage<Size4K>, PhysicalPage<Size4K>),
    {
        let mut pending: Option<DirectoryIndex> = None;
        let mut count = 0;

        for page in pages {
            let va = page.base();
            let (di, ti) = split_indices(va);
            if let Some(prev) = pending
                && prev != di
            {
                self.reclaim_if_empty(tables, prev);
                pending = None;
            }

            match DirectoryEntryKind::of(self.directory().directory_entry(di)) {
                None => {}
                Some(DirectoryEntryKind::Large(..)) => {
                    warn!("not unmapping {va}: covered by a 4 MiB directory entry");
                }
                Some(DirectoryEntryKind::Table(table, _)) => {
                    let t = self.table(table);
                    let pte = t.table_entry(ti);
                    if pte.present() {
                        t.set_table_entry(ti, PageEntryBits::new());
                        mmu.invalidate_page(page);
                        trace!("unmapped {va} (was {})", pte.physical_address());
                        released(page, pte.frame_page());
                        count += 1;
                        pending = Some(di);
                    }
                }
            }
        }

        if let Some(prev) = pending {
            self.reclaim_if_empty(tables, prev);
        }
        count
    }

    fn reclaim_if_empty<T: TableAlloc + ?Sized>(&self, tables: &mut T, di: DirectoryIndex) {
        let Some(DirectoryEntryKind::Table(table, bits)) = DirectoryEntryKind::of(self.directory().directory_entry(di)) else {
            return;
        };
        if bits.shared_table() || !self.table(table).is_empty() {
            return;
        }
        self.directory().set_directory_entry(di, PageEntryBits::new());
        EntryTable::free(tables, table);
        trace!("released empty page table {} at {di:?}", table.base());
    }

    /// Translate `va` through this directory.
    ///
    /// Handles 4 MiB directory entries by adding the 22-bit in-page offset.
    ///
    /// # Errors
    /// [`NotMapped`] if either level of the walk is not present.
    pub fn translate(&self, va: VirtualAddress) -> Result<PhysicalAddress, NotMapped> {
        let (di, ti) = split_indices(va);
        match DirectoryEntryKind::of(self.directory().directory_entry(di)).ok_or(NotMapped(va))? {
            DirectoryEntryKind::Large(base, _) => Ok(base.join(va.offset::<Size4M>())),
            DirectoryEntryKind::Table(table, _) => {
                let pte = self.table(table).table_entry(ti);
                if pte.present() {
                    Ok(pte.frame_page().join(va.offset::<Size4K>()))
                } else {
                    Err(NotMapped(va))
                }
            }
        }
    }

    /// The leaf entry for `va`, if its page table exists.
    #[must_use]
    pub fn leaf_entry(&self, va: VirtualAddress) -> Option<PageEntryBits> {
        let (di, ti) = split_indices(va);
        match DirectoryEntryKind::of(self.directory().directory_entry(di))? {
            DirectoryEntryKind::Large(_, bits) => Some(bits),
            DirectoryEntryKind::Table(table, _) => Some(self.table(table).table_entry(ti)),
        }
    }

    /// Flag the present directory entries in `indices` as shared kernel tables.
    pub fn mark_shared(&self, indices: impl IntoIterator<Item = DirectoryIndex>) {
        let dir = self.directory();
        for di in indices {
            let pde = dir.directory_entry(di);
            if pde.present() && !pde.large_page() {
                dir.set_directory_entry(di, pde.with_shared_table(true));
            }
        }
    }

    /// Copy the directory entries in `indices` from `source`, so both spaces
    /// reference the same page tables there.
    pub fn link_shared_tables(&self, source: &Self, indices: impl IntoIterator<Item = DirectoryIndex>) {
        let dir = self.directory();
        let src = source.directory();
        for di in indices {
            let pde = src.directory_entry(di);
            debug_assert!(!pde.present() || pde.large_page() || pde.shared_table());
            dir.set_directory_entry(di, pde);
        }
    }

    /// Free every page table owned by this space, then the directory itself.
    ///
    /// Shared kernel tables and 4 MiB entries are left alone. The directory
    /// must not be active on any processor. Returns the number of page tables
    /// freed (not counting the directory).
    pub fn release<T: TableAlloc + ?Sized>(self, tables: &mut T) -> usize {
        let dir = self.directory();
        let mut freed = 0;
        for i in 0..crate::entry_table::ENTRY_COUNT {
            #[allow(clippy::cast_possible_truncation)]
            let di = DirectoryIndex::new(i as u16);
            if let Some(DirectoryEntryKind::Table(table, bits)) = DirectoryEntryKind::of(dir.directory_entry(di))
                && !bits.shared_table()
            {
                dir.set_directory_entry(di, PageEntryBits::new());
                EntryTable::free(tables, table);
                freed += 1;
            }
        }
        EntryTable::free(tables, self.root);
        debug!("released page directory {} and {freed} page table(s)", self.root.base());
        freed
    }

    /// Load CR3 with this space's directory.
    ///
    /// # Safety
    /// The directory must map the executing code and stack; interrupts
    /// should be disabled by the caller.
    #[inline]
    pub unsafe fn activate<U: Mmu + ?Sized>(&self, mmu: &U) {
        unsafe { mmu.load_directory(self.root) }
    }
}
