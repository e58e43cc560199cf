//! # Machine VM Interface
//!
//! The capability set an architecture supplies to the architecture-neutral
//! address-space model. Exactly one implementation is selected at build time;
//! the model is generic over it, so there is no dynamic dispatch.
//!
//! Each address space owns one opaque [`MachineVm::Object`] (on x86, its page
//! directory). Operations that touch live translation state (`map`, `unmap`,
//! `activate`) run with interrupts disabled inside the implementation.

use crate::entry_table::DirectoryIndex;
use crate::{AlignmentViolation, MapError, NotMapped, VmFlags};
use core::fmt;
use kernel_info::memory::{KERNEL_PHYS_START, KERNEL_VM_SIZE, KERNEL_VM_START};
use kernel_memory_addresses::{PageSize, PhysicalAddress, PhysicalPage, Size4K, Size4M, VirtualAddress, VirtualPage};

/// The kernel zone: a virtual range direct mapped onto physical memory and
/// shared, with identical supervisor-only translations, by every address space.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct KernelZone {
    pub virt_start: VirtualAddress,
    pub phys_start: PhysicalAddress,
    pub size: u32,
}

impl KernelZone {
    /// The zone described by the kernel memory layout.
    #[must_use]
    pub const fn from_layout() -> Self {
        Self {
            virt_start: KERNEL_VM_START,
            phys_start: KERNEL_PHYS_START,
            size: KERNEL_VM_SIZE,
        }
    }

    /// Exclusive end of the zone (may be `2^32`).
    #[inline]
    #[must_use]
    pub const fn end(&self) -> u64 {
        self.virt_start.as_u32() as u64 + self.size as u64
    }

    #[inline]
    #[must_use]
    pub const fn contains(&self, va: VirtualAddress) -> bool {
        va.as_u32() >= self.virt_start.as_u32() && (va.as_u32() as u64) < self.end()
    }

    /// Whether the zone starts and ends on directory-entry boundaries, which
    /// is required for its page tables to be shareable.
    #[inline]
    #[must_use]
    pub const fn is_table_aligned(&self) -> bool {
        self.size != 0 && self.virt_start.is_aligned::<Size4M>() && self.size.is_multiple_of(Size4M::SIZE)
    }

    /// Directory entries covering the zone.
    pub fn directory_indices(&self) -> impl Iterator<Item = DirectoryIndex> + Clone {
        DirectoryIndex::covering(self.virt_start, self.size)
    }
}

impl Default for KernelZone {
    fn default() -> Self {
        Self::from_layout()
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MachineError {
    #[error("out of memory")]
    OutOfMemory,
    #[error(transparent)]
    AlignmentViolation(#[from] AlignmentViolation),
    #[error("{0} is covered by a 4 MiB directory entry")]
    LargePageConflict(VirtualAddress),
    #[error("paging has not been bootstrapped")]
    NotBootstrapped,
    #[error("paging is already bootstrapped")]
    AlreadyBootstrapped,
    #[error("{virt} virtual page(s) paired with {phys} physical page(s)")]
    LengthMismatch { virt: usize, phys: usize },
    #[error("the kernel directory cannot be released")]
    KernelDirectory,
    #[error("the active directory cannot be released")]
    ActiveDirectory,
}

impl From<MapError> for MachineError {
    fn from(e: MapError) -> Self {
        match e {
            MapError::OutOfMemory { .. } => Self::OutOfMemory,
            MapError::AlignmentViolation(a) => Self::AlignmentViolation(a),
            MapError::LargePageConflict(va) => Self::LargePageConflict(va),
        }
    }
}

/// Architecture-provided virtual memory capabilities.
pub trait MachineVm {
    /// Per-address-space translation root.
    type Object: Copy + Eq + fmt::Debug;

    /// The shared kernel zone this machine maps into every object.
    fn kernel_zone(&self) -> KernelZone;

    /// Build the boot translation root with the kernel zone direct mapped
    /// and turn translation on. Returns the boot object.
    ///
    /// # Errors
    /// [`MachineError::AlreadyBootstrapped`] on a second call, or
    /// [`MachineError::OutOfMemory`] if the boot tables cannot be allocated.
    fn bootstrap(&mut self) -> Result<Self::Object, MachineError>;

    /// Post-bootstrap hardware setup (global pages, supervisor write protection).
    ///
    /// # Errors
    /// [`MachineError::NotBootstrapped`] before [`bootstrap`](Self::bootstrap).
    fn init(&mut self) -> Result<(), MachineError>;

    /// A fresh object whose kernel zone is shared with the boot object and
    /// whose user zone is empty.
    ///
    /// # Errors
    /// [`MachineError::NotBootstrapped`] or [`MachineError::OutOfMemory`].
    fn init_object(&mut self) -> Result<Self::Object, MachineError>;

    /// Free an object's private translation structures.
    ///
    /// # Errors
    /// Refuses the boot object and the active object.
    fn release_object(&mut self, object: Self::Object) -> Result<(), MachineError>;

    /// Map `vpages[i] → ppages[i]` for all `i` with `flags`, all or nothing.
    ///
    /// # Errors
    /// [`MachineError::AlignmentViolation`] (nothing mutated),
    /// [`MachineError::LengthMismatch`], [`MachineError::OutOfMemory`] or
    /// [`MachineError::LargePageConflict`] (all changes reverted).
    fn map(
        &mut self,
        object: Self::Object,
        vpages: &[VirtualAddress],
        ppages: &[PhysicalAddress],
        flags: VmFlags,
    ) -> Result<(), MachineError>;

    /// Remove the mappings of `vpages`, reporting each released frame.
    /// Pages that are not mapped are skipped.
    fn unmap(
        &mut self,
        object: Self::Object,
        vpages: &[VirtualPage<Size4K>],
        released: &mut dyn FnMut(VirtualPage<Size4K>, PhysicalPage<Size4K>),
    );

    /// Translate `va` within `object`.
    ///
    /// # Errors
    /// [`NotMapped`] if no present translation exists.
    fn translate(&self, object: Self::Object, va: VirtualAddress) -> Result<PhysicalAddress, NotMapped>;

    /// Make `object` the translation root of the executing processor.
    fn activate(&mut self, object: Self::Object);

    /// Fill a physical page with zeroes.
    fn clear_page(&mut self, page: PhysicalPage<Size4K>);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_zone_is_table_aligned() {
        let zone = KernelZone::from_layout();
        assert!(zone.is_table_aligned());
        assert_eq!(zone.directory_indices().count(), 256);
        assert!(zone.contains(VirtualAddress::new(0x3FFF_FFFF)));
        assert!(!zone.contains(VirtualAddress::new(0x4000_0000)));
    }

    #[test]
    fn unaligned_zone_is_detected() {
        let zone = KernelZone {
            virt_start: VirtualAddress::new(0x1000),
            phys_start: PhysicalAddress::new(0),
            size: 0x40_0000,
        };
        assert!(!zone.is_table_aligned());
    }

    #[test]
    fn map_errors_convert() {
        let e: MachineError = MapError::OutOfMemory { index: 3 }.into();
        assert_eq!(e, MachineError::OutOfMemory);
        let va = VirtualAddress::new(0x123);
        let e: MachineError = MapError::from(AlignmentViolation::Virtual(va)).into();
        assert_eq!(e, MachineError::AlignmentViolation(AlignmentViolation::Virtual(va)));
    }
}
