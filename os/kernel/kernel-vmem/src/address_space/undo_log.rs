//! Undo log for mapping batches.
//!
//! Every structural change a batch makes is recorded before (or, for freshly
//! allocated tables, right after) it happens. On failure the log is replayed
//! in reverse, which restores the directory and every touched table to the
//! exact state they had before the batch started.

use crate::entry_table::{DirectoryIndex, EntryTable, TableIndex};
use crate::{AddressSpace, Mmu, PageEntryBits, PhysMapper, TableAlloc};
use alloc::collections::TryReserveError;
use alloc::vec::Vec;
use kernel_memory_addresses::{PhysicalPage, Size4K, VirtualAddress};

#[derive(Copy, Clone, Debug)]
pub(super) enum Undo {
    /// A leaf entry was overwritten.
    Leaf {
        table: PhysicalPage<Size4K>,
        index: TableIndex,
        va: VirtualAddress,
        previous: PageEntryBits,
    },
    /// An existing directory entry had its permissions widened.
    Directory {
        index: DirectoryIndex,
        previous: PageEntryBits,
    },
    /// A page table was allocated and linked into the directory.
    NewTable {
        index: DirectoryIndex,
        table: PhysicalPage<Size4K>,
        previous: PageEntryBits,
    },
}

pub(super) struct UndoLog {
    entries: Vec<Undo>,
}

impl UndoLog {
    pub(super) fn with_capacity(n: usize) -> Result<Self, TryReserveError> {
        let mut entries = Vec::new();
        entries.try_reserve(n)?;
        Ok(Self { entries })
    }

    /// Make room for `n` more records so the following pushes cannot fail.
    pub(super) fn reserve(&mut self, n: usize) -> Result<(), TryReserveError> {
        self.entries.try_reserve(n)
    }

    /// Record a change. Space must have been reserved.
    pub(super) fn push(&mut self, undo: Undo) {
        debug_assert!(self.entries.len() < self.entries.capacity());
        self.entries.push(undo);
    }

    pub(super) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(super) fn rollback<P, T, U>(self, space: &AddressSpace<'_, P>, tables: &mut T, mmu: &U)
    where
        P: PhysMapper,
        T: TableAlloc + ?Sized,
        U: Mmu + ?Sized,
    {
        let mut flush = false;
        for undo in self.entries.into_iter().rev() {
            match undo {
                Undo::Leaf {
                    table,
                    index,
                    va,
                    previous,
                } => {
                    let t = space.table(table);
                    let current = t.table_entry(index);
                    t.set_table_entry(index, previous);
                    if current.present() {
                        mmu.invalidate_page(va.page());
                    }
                }
                Undo::Directory { index, previous } => {
                    space.directory().set_directory_entry(index, previous);
                    flush = true;
                }
                Undo::NewTable {
                    index,
                    table,
                    previous,
                } => {
                    space.directory().set_directory_entry(index, previous);
                    EntryTable::free(tables, table);
                }
            }
        }
        if flush {
            mmu.flush_tlb();
        }
    }
}
