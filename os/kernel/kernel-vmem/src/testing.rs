//! Host-side doubles for the allocation and hardware seams.
//!
//! [`TestPhys`] simulates RAM as an array of 4 KiB frames starting at
//! physical address 0, [`TestPool`] hands out frames from a range of it and
//! can be told to run dry, and [`FakeCpu`] records every MMU operation along
//! with the interrupt state it ran under.

use crate::{FrameAlloc, Mmu, PhysMapper, TableAlloc};
use alloc::boxed::Box;
use alloc::collections::BTreeSet;
use alloc::vec::Vec;
use core::cell::{Cell, RefCell, UnsafeCell};
use core::ops::Range;
use kernel_info::memory::PAGE_SIZE;
use kernel_memory_addresses::{PhysicalAddress, PhysicalPage, Size4K, VirtualPage};
use kernel_sync::InterruptControl;

#[repr(C, align(4096))]
struct Frame([u8; PAGE_SIZE as usize]);

/// Simulated physical memory: `frames` frames from physical address 0.
pub struct TestPhys {
    frames: Box<[UnsafeCell<Frame>]>,
}

impl TestPhys {
    #[must_use]
    pub fn new(frames: usize) -> Self {
        Self {
            frames: (0..frames)
                .map(|_| UnsafeCell::new(Frame([0; PAGE_SIZE as usize])))
                .collect(),
        }
    }

    /// Bytes of simulated memory.
    #[must_use]
    pub fn len(&self) -> usize {
        self.frames.len() * PAGE_SIZE as usize
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    fn frame_ptr(&self, pa: PhysicalAddress, len: usize) -> *mut u8 {
        let index = (pa.as_u32() / PAGE_SIZE) as usize;
        let offset = (pa.as_u32() % PAGE_SIZE) as usize;
        assert!(index < self.frames.len(), "{pa} is outside simulated memory");
        assert!(offset + len <= PAGE_SIZE as usize, "access at {pa} crosses a frame");
        // Safety: offset stays within the frame.
        unsafe { self.frames[index].get().cast::<u8>().add(offset) }
    }

    pub fn fill(&self, page: PhysicalPage<Size4K>, byte: u8) {
        // Safety: the pointer covers the whole frame and no reference to it is live.
        unsafe { self.frame_ptr(page.base(), PAGE_SIZE as usize).write_bytes(byte, PAGE_SIZE as usize) }
    }

    #[must_use]
    pub fn is_zeroed(&self, page: PhysicalPage<Size4K>) -> bool {
        let ptr = self.frame_ptr(page.base(), PAGE_SIZE as usize);
        // Safety: see `fill`.
        let bytes = unsafe { core::slice::from_raw_parts(ptr, PAGE_SIZE as usize) };
        bytes.iter().all(|&b| b == 0)
    }

    #[must_use]
    pub fn read_u32(&self, pa: PhysicalAddress) -> u32 {
        // Safety: bounds checked by `frame_ptr`.
        unsafe { self.frame_ptr(pa, 4).cast::<u32>().read_unaligned() }
    }

    pub fn write_u32(&self, pa: PhysicalAddress, value: u32) {
        // Safety: bounds checked by `frame_ptr`.
        unsafe { self.frame_ptr(pa, 4).cast::<u32>().write_unaligned(value) }
    }
}

impl PhysMapper for TestPhys {
    unsafe fn phys_to_mut<'a, T>(&self, pa: PhysicalAddress) -> &'a mut T {
        let ptr = self.frame_ptr(pa, size_of::<T>()).cast::<T>();
        assert!(ptr.is_aligned(), "{pa} is not aligned for the requested type");
        // Safety: the caller upholds the `PhysMapper` contract.
        unsafe { &mut *ptr }
    }
}

struct PoolState {
    free: BTreeSet<u32>,
    allocated: BTreeSet<u32>,
    remaining: Option<usize>,
}

/// Frame and table allocator over a range of frame numbers.
///
/// Always hands out the lowest free frame. [`fail_after`](Self::fail_after)
/// makes it report out-of-memory after a number of further allocations.
pub struct TestPool {
    state: RefCell<PoolState>,
}

impl TestPool {
    /// A pool owning frames `frames.start..frames.end` (frame numbers, not addresses).
    #[must_use]
    pub fn new(frames: Range<u32>) -> Self {
        Self {
            state: RefCell::new(PoolState {
                free: frames.collect(),
                allocated: BTreeSet::new(),
                remaining: None,
            }),
        }
    }

    /// Allow `n` more allocations, then fail every further one.
    pub fn fail_after(&self, n: usize) {
        self.state.borrow_mut().remaining = Some(n);
    }

    /// Lift a limit set by [`fail_after`](Self::fail_after).
    pub fn never_fail(&self) {
        self.state.borrow_mut().remaining = None;
    }

    /// Frames currently handed out.
    #[must_use]
    pub fn outstanding(&self) -> usize {
        self.state.borrow().allocated.len()
    }

    /// Frames still free.
    #[must_use]
    pub fn available(&self) -> usize {
        self.state.borrow().free.len()
    }

    #[must_use]
    pub fn is_allocated(&self, page: PhysicalPage<Size4K>) -> bool {
        self.state.borrow().allocated.contains(&(page.base().as_u32() / PAGE_SIZE))
    }

    fn take(&self) -> Option<PhysicalPage<Size4K>> {
        let mut s = self.state.borrow_mut();
        if let Some(n) = s.remaining.as_mut() {
            if *n == 0 {
                return None;
            }
            *n -= 1;
        }
        let frame = s.free.pop_first()?;
        s.allocated.insert(frame);
        Some(PhysicalPage::containing_address(PhysicalAddress::new(frame * PAGE_SIZE)))
    }

    fn give_back(&self, page: PhysicalPage<Size4K>) {
        let frame = page.base().as_u32() / PAGE_SIZE;
        let mut s = self.state.borrow_mut();
        assert!(s.allocated.remove(&frame), "double free of {page}");
        s.free.insert(frame);
    }
}

impl FrameAlloc for &TestPool {
    fn alloc_page(&mut self) -> Option<PhysicalPage<Size4K>> {
        self.take()
    }

    fn free_page(&mut self, page: PhysicalPage<Size4K>) {
        self.give_back(page);
    }
}

impl TableAlloc for &TestPool {
    fn alloc_aligned(&mut self, size: usize, align: usize) -> Option<PhysicalAddress> {
        assert!(size <= PAGE_SIZE as usize && align <= PAGE_SIZE as usize);
        self.take().map(PhysicalPage::base)
    }

    fn free(&mut self, addr: PhysicalAddress, size: usize) {
        assert!(size <= PAGE_SIZE as usize);
        self.give_back(PhysicalPage::containing_address(addr));
    }
}

impl FrameAlloc for TestPool {
    fn alloc_page(&mut self) -> Option<PhysicalPage<Size4K>> {
        self.take()
    }

    fn free_page(&mut self, page: PhysicalPage<Size4K>) {
        self.give_back(page);
    }
}

impl TableAlloc for TestPool {
    fn alloc_aligned(&mut self, size: usize, align: usize) -> Option<PhysicalAddress> {
        assert!(size <= PAGE_SIZE as usize && align <= PAGE_SIZE as usize);
        self.take().map(PhysicalPage::base)
    }

    fn free(&mut self, addr: PhysicalAddress, size: usize) {
        assert!(size <= PAGE_SIZE as usize);
        self.give_back(PhysicalPage::containing_address(addr));
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CpuEvent {
    Invalidate(VirtualPage<Size4K>),
    FlushTlb,
    LoadDirectory(PhysicalPage<Size4K>),
    EnablePaging,
    EnableGlobalPages,
    EnableWriteProtect,
}

/// A recording MMU and interrupt flag.
pub struct FakeCpu {
    interrupts: Cell<bool>,
    directory: Cell<Option<PhysicalPage<Size4K>>>,
    events: RefCell<Vec<CpuEvent>>,
    unguarded: Cell<usize>,
}

impl Default for FakeCpu {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeCpu {
    /// Interrupts enabled, no directory loaded.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            interrupts: Cell::new(true),
            directory: Cell::new(None),
            events: RefCell::new(Vec::new()),
            unguarded: Cell::new(0),
        }
    }

    #[must_use]
    pub fn directory(&self) -> Option<PhysicalPage<Size4K>> {
        self.directory.get()
    }

    #[must_use]
    pub fn events(&self) -> Vec<CpuEvent> {
        self.events.borrow().clone()
    }

    pub fn take_events(&self) -> Vec<CpuEvent> {
        self.events.take()
    }

    /// Pages passed to `invalidate_page`, in order.
    #[must_use]
    pub fn invalidations(&self) -> Vec<VirtualPage<Size4K>> {
        self.events
            .borrow()
            .iter()
            .filter_map(|e| match e {
                CpuEvent::Invalidate(p) => Some(*p),
                _ => None,
            })
            .collect()
    }

    #[must_use]
    pub fn flushes(&self) -> usize {
        self.events.borrow().iter().filter(|e| **e == CpuEvent::FlushTlb).count()
    }

    /// MMU operations that ran while interrupts were enabled.
    #[must_use]
    pub fn unguarded_operations(&self) -> usize {
        self.unguarded.get()
    }

    fn record(&self, event: CpuEvent) {
        if self.interrupts.get() {
            self.unguarded.set(self.unguarded.get() + 1);
        }
        self.events.borrow_mut().push(event);
    }
}

impl InterruptControl for FakeCpu {
    fn interrupts_enabled(&self) -> bool {
        self.interrupts.get()
    }

    fn disable_interrupts(&self) {
        self.interrupts.set(false);
    }

    fn enable_interrupts(&self) {
        self.interrupts.set(true);
    }
}

impl Mmu for FakeCpu {
    fn invalidate_page(&self, page: VirtualPage<Size4K>) {
        self.record(CpuEvent::Invalidate(page));
    }

    fn flush_tlb(&self) {
        self.record(CpuEvent::FlushTlb);
    }

    fn active_directory(&self) -> PhysicalPage<Size4K> {
        self.directory
            .get()
            .unwrap_or(PhysicalPage::containing_address(PhysicalAddress::zero()))
    }

    unsafe fn load_directory(&self, directory: PhysicalPage<Size4K>) {
        self.directory.set(Some(directory));
        self.record(CpuEvent::LoadDirectory(directory));
    }

    unsafe fn enable_paging(&self) {
        self.record(CpuEvent::EnablePaging);
    }

    unsafe fn enable_global_pages(&self) {
        self.record(CpuEvent::EnableGlobalPages);
    }

    unsafe fn enable_write_protect(&self) {
        self.record(CpuEvent::EnableWriteProtect);
    }
}
