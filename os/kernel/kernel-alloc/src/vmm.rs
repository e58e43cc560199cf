//! # Virtual address-space model
//!
//! [`Vm`] owns the machine ([`MachineVm`]) and the physical page allocator
//! and manages [`VmSpace`]s: per-process sets of non-overlapping
//! [`VmRegion`]s backed either eagerly (frames allocated and mapped when the
//! region is created) or lazily (`VmFlags::LAZY`, frames supplied one page at
//! a time by [`Vm::handle_fault`]).
//!
//! For every region, `unfulfilled_ppages` equals the number of its pages that
//! have no translation.
//!
//! Exactly one space is active at a time; [`Vm::switch_to`] is the only way
//! to change it.

mod fault;
mod region;
mod space;

pub use fault::{FaultAccess, FaultError};
pub use region::VmRegion;
pub use space::{KERNEL_REGION_FLAGS, VmSpace, WellKnown};

use alloc::vec::Vec;
use kernel_info::memory::{PAGE_SIZE, USER_VM_END};
use kernel_memory_addresses::{PhysicalAddress, PhysicalPage, Size4K, VirtualAddress, VirtualPage};
use kernel_vmem::{AlignmentViolation, FrameAlloc, KernelZone, MachineError, MachineVm, NotMapped, VmFlags, checked_align_up};
use log::{debug, info, trace, warn};

/// Pages handed to the machine per `unmap` call.
const UNMAP_BATCH: usize = 64;

#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum VmError {
    #[error("out of memory")]
    OutOfMemory,
    /// The requested range overlaps the region starting at this address.
    #[error("range overlaps the region at {0}")]
    Overlap(VirtualAddress),
    #[error(transparent)]
    AlignmentViolation(#[from] AlignmentViolation),
    #[error("invalid range: {size:#x} bytes at {address}")]
    InvalidRange { address: VirtualAddress, size: u32 },
    /// User regions cannot carry translations that survive a space switch.
    #[error("flags {0:?} are not allowed outside the kernel zone")]
    InvalidFlags(VmFlags),
    #[error("the {0:?} region is already placed")]
    RegionInUse(WellKnown),
    #[error("the kernel region cannot be unmapped")]
    KernelRange,
    #[error("the active address space cannot be destroyed")]
    SpaceActive,
    #[error(transparent)]
    Machine(MachineError),
}

impl From<MachineError> for VmError {
    fn from(e: MachineError) -> Self {
        match e {
            MachineError::OutOfMemory => Self::OutOfMemory,
            MachineError::AlignmentViolation(a) => Self::AlignmentViolation(a),
            e => Self::Machine(e),
        }
    }
}

pub struct Vm<M: MachineVm, F: FrameAlloc> {
    machine: M,
    frames: F,
    zone: KernelZone,
    kernel: M::Object,
    active: M::Object,
}

impl<M: MachineVm, F: FrameAlloc> Vm<M, F> {
    /// Bring up paging on `machine` and return the manager together with the
    /// kernel's own space, which is active afterwards.
    ///
    /// # Errors
    /// Whatever the machine reports for `bootstrap` or `init`.
    pub fn bootstrap(mut machine: M, frames: F) -> Result<(Self, VmSpace<M::Object>), VmError> {
        let kernel = machine.bootstrap()?;
        machine.init()?;
        let zone = machine.kernel_zone();
        info!("virtual memory up; kernel zone {}..{:#x}", zone.virt_start, zone.end());
        let vm = Self {
            machine,
            frames,
            zone,
            kernel,
            active: kernel,
        };
        Ok((vm, VmSpace::new(kernel, zone)))
    }

    #[inline]
    pub const fn machine(&self) -> &M {
        &self.machine
    }

    #[inline]
    pub const fn frames(&self) -> &F {
        &self.frames
    }

    /// The object of the active space.
    #[inline]
    pub const fn active(&self) -> M::Object {
        self.active
    }

    /// The object of the kernel's boot space.
    #[inline]
    pub const fn kernel_object(&self) -> M::Object {
        self.kernel
    }

    /// A fresh space: kernel region shared, empty stack and heap.
    ///
    /// # Errors
    /// [`VmError::OutOfMemory`] if the translation root cannot be allocated.
    pub fn create_space(&mut self) -> Result<VmSpace<M::Object>, VmError> {
        let object = self.machine.init_object()?;
        debug!("created address space {object:?}");
        Ok(VmSpace::new(object, self.zone))
    }

    /// Unmap every region of `space`, return its frames and release its
    /// translation root.
    ///
    /// # Errors
    /// The active space (and the kernel space) are handed back unchanged with
    /// [`VmError::SpaceActive`] or [`VmError::KernelRange`].
    pub fn destroy_space(&mut self, mut space: VmSpace<M::Object>) -> Result<(), (VmSpace<M::Object>, VmError)> {
        let object = space.object();
        if object == self.active {
            return Err((space, VmError::SpaceActive));
        }
        if object == self.kernel {
            return Err((space, VmError::KernelRange));
        }

        let dropped = space.unfulfilled_ppages();
        let mut released = 0;
        for which in [WellKnown::Stack, WellKnown::Heap] {
            let region = *space.well_known(which);
            released += self.unmap_pages(object, region.pages());
            *space.well_known_mut(which) = VmRegion::empty(which.anchor(), region.flags);
        }
        while let Some((_, region)) = space.others.pop_first() {
            released += self.unmap_pages(object, region.pages());
        }

        if let Err(e) = self.machine.release_object(object) {
            return Err((space, e.into()));
        }
        debug!("destroyed address space {object:?}: {released} frame(s) returned, {dropped} unfulfilled page(s) dropped");
        Ok(())
    }

    /// Add the region `[address, address + size)` to `space`.
    ///
    /// Without `VmFlags::LAZY` every page is backed by a zeroed frame and
    /// mapped before this returns, all or nothing. With it, the pages are
    /// recorded as unfulfilled and backed on first touch.
    ///
    /// # Errors
    /// - [`VmError::AlignmentViolation`] for an unaligned address or size.
    /// - [`VmError::InvalidRange`] for an empty range or one past the user zone.
    /// - [`VmError::InvalidFlags`] for `VmFlags::GLOBAL`.
    /// - [`VmError::Overlap`] if any existing region shares a page with it.
    /// - [`VmError::OutOfMemory`] if frames or page tables run out.
    pub fn map_region(
        &mut self,
        space: &mut VmSpace<M::Object>,
        address: VirtualAddress,
        size: u32,
        flags: VmFlags,
    ) -> Result<(), VmError> {
        let region = self.place(space, address, size, flags)?;
        space.others.insert(address.as_u32(), region);
        debug!("mapped region {address}+{size:#x} {flags:?} in {:?}", space.object());
        Ok(())
    }

    /// Place the stack or heap region. Each can only be placed while empty.
    ///
    /// # Errors
    /// [`VmError::RegionInUse`], or anything [`map_region`](Self::map_region) reports.
    pub fn map_well_known(
        &mut self,
        space: &mut VmSpace<M::Object>,
        which: WellKnown,
        address: VirtualAddress,
        size: u32,
        flags: VmFlags,
    ) -> Result<(), VmError> {
        if !space.well_known(which).is_empty() {
            return Err(VmError::RegionInUse(which));
        }
        let region = self.place(space, address, size, flags)?;
        *space.well_known_mut(which) = region;
        debug!("placed {which:?} at {address}+{size:#x} in {:?}", space.object());
        Ok(())
    }

    /// Extend the heap by `bytes` (rounded up to whole pages) with the heap's
    /// flags and return the previous break.
    ///
    /// # Errors
    /// [`VmError::Overlap`] if the extension runs into another region, or
    /// anything backing the new pages reports.
    pub fn grow_heap(&mut self, space: &mut VmSpace<M::Object>, bytes: u32) -> Result<VirtualAddress, VmError> {
        let old_break = space.heap_break();
        if bytes == 0 {
            return Ok(old_break);
        }
        let size = checked_align_up(bytes, PAGE_SIZE).ok_or(VmError::InvalidRange {
            address: old_break,
            size: bytes,
        })?;
        let extension = self.place(space, old_break, size, space.heap.flags)?;
        space.heap.size += extension.size;
        space.heap.unfulfilled_ppages += extension.unfulfilled_ppages;
        trace!("heap break {old_break} -> {}", space.heap_break());
        Ok(old_break)
    }

    /// Remove `[address, address + size)` from `space`.
    ///
    /// Pages are unmapped, fulfilled frames returned to the allocator and
    /// unfulfilled pages forgotten. Regions only partly covered keep their
    /// remainder; one covered in the middle is split in two. A range touching
    /// no region is not an error.
    ///
    /// # Errors
    /// [`VmError::AlignmentViolation`], [`VmError::InvalidRange`] on overflow,
    /// or [`VmError::KernelRange`] if the range touches the kernel region.
    pub fn unmap_region(
        &mut self,
        space: &mut VmSpace<M::Object>,
        address: VirtualAddress,
        size: u32,
    ) -> Result<(), VmError> {
        check_alignment(address, size)?;
        if size == 0 {
            return Ok(());
        }
        let start = u64::from(address.as_u32());
        let end = start + u64::from(size);
        if end > 1 << 32 {
            return Err(VmError::InvalidRange { address, size });
        }
        if space.kernel.overlaps(start, end) {
            warn!("refusing to unmap {address}+{size:#x}: kernel region");
            return Err(VmError::KernelRange);
        }

        let object = space.object();
        for which in [WellKnown::Stack, WellKnown::Heap] {
            let region = *space.well_known(which);
            let Some((lo, hi)) = region.intersect(start, end) else {
                continue;
            };
            self.unmap_range(object, lo, hi);
            let (left, right) = self.split(object, &region, lo, hi);
            // The lower remainder keeps the role; an upper one split off becomes a plain region.
            let (kept, spilled) = match (left, right) {
                (Some(left), right) => (left, right),
                (None, Some(right)) => (right, None),
                (None, None) => (VmRegion::empty(which.anchor(), region.flags), None),
            };
            *space.well_known_mut(which) = kept;
            if let Some(spilled) = spilled {
                space.others.insert(spilled.address.as_u32(), spilled);
            }
        }

        while let Some(region) = space.others.values().find(|r| r.overlaps(start, end)).copied() {
            space.others.remove(&region.address.as_u32());
            let Some((lo, hi)) = region.intersect(start, end) else {
                continue;
            };
            self.unmap_range(object, lo, hi);
            let (left, right) = self.split(object, &region, lo, hi);
            for piece in [left, right].into_iter().flatten() {
                space.others.insert(piece.address.as_u32(), piece);
            }
        }

        debug!("unmapped {address}+{size:#x} in {object:?}");
        Ok(())
    }

    /// Resolve a fault at `va` by backing its page, if `space` reserved it.
    ///
    /// Returns the frame now backing the page.
    ///
    /// # Errors
    /// - [`FaultError::NoRegion`] if `va` lies in no region.
    /// - [`FaultError::AccessViolation`] if the access is not allowed by the
    ///   region's flags or the page is already backed.
    /// - [`FaultError::Unreserved`] if the region has no unfulfilled page left.
    /// - [`FaultError::OutOfMemory`] if no frame is available.
    pub fn handle_fault(
        &mut self,
        space: &mut VmSpace<M::Object>,
        va: VirtualAddress,
        access: FaultAccess,
    ) -> Result<PhysicalPage<Size4K>, FaultError> {
        let object = space.object();
        let Some(region) = space.region_containing_mut(va) else {
            return Err(FaultError::NoRegion(va));
        };
        let page = VirtualPage::<Size4K>::containing_address(va);
        if !access.permitted_by(region.flags)
            || access.present
            || self.machine.translate(object, page.base()).is_ok()
        {
            return Err(FaultError::AccessViolation(va));
        }
        if region.unfulfilled_ppages == 0 {
            return Err(FaultError::Unreserved(va));
        }

        let frame = self.frames.alloc_page().ok_or(FaultError::OutOfMemory)?;
        self.machine.clear_page(frame);
        if let Err(e) = self.machine.map(object, &[page.base()], &[frame.base()], region.flags) {
            self.frames.free_page(frame);
            return Err(e.into());
        }
        region.unfulfilled_ppages -= 1;
        trace!("fault at {va} backed by {frame}; {} page(s) left", region.unfulfilled_ppages);
        Ok(frame)
    }

    /// Make `space` the active address space and return the previously
    /// active object.
    pub fn switch_to(&mut self, space: &VmSpace<M::Object>) -> M::Object {
        let previous = self.active;
        let next = space.object();
        if next != previous {
            self.machine.activate(next);
            self.active = next;
            trace!("switched address space {previous:?} -> {next:?}");
        }
        previous
    }

    /// Translate `va` through `space`.
    ///
    /// # Errors
    /// [`NotMapped`] if the page has no translation.
    pub fn translate(&self, space: &VmSpace<M::Object>, va: VirtualAddress) -> Result<PhysicalAddress, NotMapped> {
        self.machine.translate(space.object(), va)
    }

    /// Validate and back a new region without recording it.
    fn place(
        &mut self,
        space: &VmSpace<M::Object>,
        address: VirtualAddress,
        size: u32,
        flags: VmFlags,
    ) -> Result<VmRegion, VmError> {
        check_alignment(address, size)?;
        let start = u64::from(address.as_u32());
        let end = start + u64::from(size);
        if size == 0 || end > u64::from(USER_VM_END.as_u32()) {
            return Err(VmError::InvalidRange { address, size });
        }
        if flags.contains(VmFlags::GLOBAL) {
            warn!("{address}+{size:#x}: global mappings are reserved for the kernel zone");
            return Err(VmError::InvalidFlags(flags));
        }
        if let Some(other) = space.first_overlapping(start, end) {
            warn!(
                "{address}+{size:#x} overlaps region {}+{:#x}",
                other.address, other.size
            );
            return Err(VmError::Overlap(other.address));
        }

        let mut region = VmRegion {
            address,
            size,
            flags,
            unfulfilled_ppages: 0,
        };
        if flags.contains(VmFlags::LAZY) {
            region.unfulfilled_ppages = region.page_count();
        } else {
            self.back_eagerly(space.object(), &region)?;
        }
        Ok(region)
    }

    fn back_eagerly(&mut self, object: M::Object, region: &VmRegion) -> Result<(), VmError> {
        let count = region.page_count() as usize;
        let mut vpages = Vec::new();
        let mut ppages = Vec::new();
        vpages.try_reserve_exact(count).map_err(|_| VmError::OutOfMemory)?;
        ppages.try_reserve_exact(count).map_err(|_| VmError::OutOfMemory)?;

        for page in region.pages() {
            let Some(frame) = self.frames.alloc_page() else {
                warn!("out of frames backing {}+{:#x}", region.address, region.size);
                self.free_frames(&ppages);
                return Err(VmError::OutOfMemory);
            };
            self.machine.clear_page(frame);
            vpages.push(page.base());
            ppages.push(frame.base());
        }

        if let Err(e) = self.machine.map(object, &vpages, &ppages, region.flags) {
            self.free_frames(&ppages);
            return Err(e.into());
        }
        Ok(())
    }

    fn free_frames(&mut self, frames: &[PhysicalAddress]) {
        for &pa in frames {
            self.frames.free_page(PhysicalPage::containing_address(pa));
        }
    }

    /// Unmap `[lo, hi)`, returning the frames behind it.
    #[allow(clippy::cast_possible_truncation)]
    fn unmap_range(&mut self, object: M::Object, lo: u64, hi: u64) -> usize {
        let first = VirtualPage::<Size4K>::containing_address(VirtualAddress::new(lo as u32));
        let count = ((hi - lo) / u64::from(PAGE_SIZE)) as u32;
        self.unmap_pages(object, (0..count).filter_map(move |i| first.checked_add_pages(i)))
    }

    fn unmap_pages(&mut self, object: M::Object, pages: impl Iterator<Item = VirtualPage<Size4K>>) -> usize {
        let mut batch = [VirtualPage::containing_address(VirtualAddress::zero()); UNMAP_BATCH];
        let mut pages = pages;
        let mut released = 0;
        loop {
            let mut n = 0;
            for page in pages.by_ref().take(UNMAP_BATCH) {
                batch[n] = page;
                n += 1;
            }
            if n == 0 {
                break;
            }
            let frames = &mut self.frames;
            self.machine.unmap(object, &batch[..n], &mut |_, frame| {
                frames.free_page(frame);
                released += 1;
            });
        }
        released
    }

    /// The parts of `region` left after removing `[lo, hi)`.
    fn split(&self, object: M::Object, region: &VmRegion, lo: u64, hi: u64) -> (Option<VmRegion>, Option<VmRegion>) {
        let start = u64::from(region.address.as_u32());
        let left = (start < lo).then(|| self.with_fulfilment(object, region.piece(start, lo)));
        let right = (hi < region.end()).then(|| self.with_fulfilment(object, region.piece(hi, region.end())));
        (left, right)
    }

    #[allow(clippy::cast_possible_truncation)]
    fn with_fulfilment(&self, object: M::Object, mut piece: VmRegion) -> VmRegion {
        piece.unfulfilled_ppages = piece
            .pages()
            .filter(|p| self.machine.translate(object, p.base()).is_err())
            .count() as u32;
        piece
    }
}

fn check_alignment(address: VirtualAddress, size: u32) -> Result<(), AlignmentViolation> {
    if !address.is_aligned::<Size4K>() {
        return Err(AlignmentViolation::Virtual(address));
    }
    if !size.is_multiple_of(PAGE_SIZE) {
        return Err(AlignmentViolation::Size(size));
    }
    Ok(())
}
