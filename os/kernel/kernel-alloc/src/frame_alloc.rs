//! # Bitmap physical frame allocator
//!
//! One bit per 4 KiB frame of a fixed physical range, set while the frame is
//! handed out. Allocation is first-fit from a rotating hint; double frees are
//! detected and reported instead of corrupting the map.
//!
//! The same allocator backs entry tables: page-sized, page-aligned requests
//! through [`TableAlloc`] are served from the frame map.

use kernel_info::memory::{PAGE_SIZE, USER_FRAMES_END, USER_FRAMES_START};
use kernel_memory_addresses::{PhysicalAddress, PhysicalPage, Size4K};
use kernel_vmem::{FrameAlloc, TableAlloc};
use log::{error, trace};

/// Largest number of frames one allocator tracks (256 MiB).
pub const MAX_FRAMES: usize = 64 * 1024;
const WORDS: usize = MAX_FRAMES / 64;

pub struct BitmapFrameAlloc {
    base: u32,
    frames: usize,
    used: [u64; WORDS],
    free: usize,
    next: usize,
}

impl BitmapFrameAlloc {
    /// Allocator over the frames in `[start, end)`, all free.
    ///
    /// # Panics
    /// If either bound is not page aligned, the range is inverted, or it
    /// holds more than [`MAX_FRAMES`] frames.
    #[must_use]
    pub const fn new(start: PhysicalAddress, end: PhysicalAddress) -> Self {
        assert!(start.is_aligned::<Size4K>() && end.is_aligned::<Size4K>());
        assert!(start.as_u32() <= end.as_u32());
        let frames = ((end.as_u32() - start.as_u32()) / PAGE_SIZE) as usize;
        assert!(frames <= MAX_FRAMES);

        let mut used = [0u64; WORDS];
        // Frames past the end of the range are permanently in use.
        let mut i = frames;
        while i < MAX_FRAMES {
            used[i / 64] |= 1 << (i % 64);
            i += 1;
        }

        Self {
            base: start.as_u32(),
            frames,
            used,
            free: frames,
            next: 0,
        }
    }

    /// Allocator over the user frame pool of the memory layout.
    #[must_use]
    pub const fn from_layout() -> Self {
        Self::new(USER_FRAMES_START, USER_FRAMES_END)
    }

    /// Frames tracked.
    #[inline]
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.frames
    }

    /// Frames currently free.
    #[inline]
    #[must_use]
    pub const fn free_count(&self) -> usize {
        self.free
    }

    #[must_use]
    pub const fn contains(&self, page: PhysicalPage<Size4K>) -> bool {
        self.index_of(page).is_some()
    }

    #[must_use]
    pub const fn is_allocated(&self, page: PhysicalPage<Size4K>) -> bool {
        match self.index_of(page) {
            Some(i) => self.is_used(i),
            None => false,
        }
    }

    /// Mark every frame overlapping `[start, end)` as in use, e.g. for the
    /// kernel image or firmware tables. Frames outside the range are ignored.
    ///
    /// Returns the number of frames newly reserved.
    pub fn reserve(&mut self, start: PhysicalAddress, end: PhysicalAddress) -> usize {
        let first = start.as_u32().max(self.base);
        let last = end.as_u32().min(self.limit());
        if first >= last {
            return 0;
        }
        let mut reserved = 0;
        let mut i = ((first - self.base) / PAGE_SIZE) as usize;
        let stop = (last - self.base).div_ceil(PAGE_SIZE) as usize;
        while i < stop {
            if !self.is_used(i) {
                self.set(i);
                self.free -= 1;
                reserved += 1;
            }
            i += 1;
        }
        trace!("reserved {reserved} frame(s) in {start}..{end}");
        reserved
    }

    /// Exclusive upper bound of the tracked range.
    #[allow(clippy::cast_possible_truncation)]
    const fn limit(&self) -> u32 {
        self.base + (self.frames as u32) * PAGE_SIZE
    }

    #[allow(clippy::cast_possible_truncation)]
    const fn index_of(&self, page: PhysicalPage<Size4K>) -> Option<usize> {
        let pa = page.base().as_u32();
        if pa < self.base || pa >= self.limit() {
            return None;
        }
        Some(((pa - self.base) / PAGE_SIZE) as usize)
    }

    #[allow(clippy::cast_possible_truncation)]
    const fn page_at(&self, i: usize) -> PhysicalPage<Size4K> {
        PhysicalPage::containing_address(PhysicalAddress::new(self.base + (i as u32) * PAGE_SIZE))
    }

    #[inline]
    const fn is_used(&self, i: usize) -> bool {
        self.used[i / 64] & (1 << (i % 64)) != 0
    }

    #[inline]
    const fn set(&mut self, i: usize) {
        self.used[i / 64] |= 1 << (i % 64);
    }

    #[inline]
    const fn clear(&mut self, i: usize) {
        self.used[i / 64] &= !(1 << (i % 64));
    }

    fn find_free(&self, from: usize) -> Option<usize> {
        let words = self.frames.div_ceil(64);
        let start = from / 64;
        (start..words)
            .chain(0..start)
            .find(|&w| self.used[w] != u64::MAX)
            .map(|w| w * 64 + self.used[w].trailing_ones() as usize)
    }
}

impl FrameAlloc for BitmapFrameAlloc {
    fn alloc_page(&mut self) -> Option<PhysicalPage<Size4K>> {
        if self.free == 0 {
            return None;
        }
        let i = self.find_free(self.next)?;
        self.set(i);
        self.free -= 1;
        self.next = (i + 1) % self.frames;
        Some(self.page_at(i))
    }

    fn free_page(&mut self, page: PhysicalPage<Size4K>) {
        let Some(i) = self.index_of(page) else {
            error!("freeing frame {page} that this allocator does not own");
            if cfg!(debug_assertions) {
                panic!("foreign frame {page}");
            }
            return;
        };
        if !self.is_used(i) {
            error!("double free of frame {page}");
            if cfg!(debug_assertions) {
                panic!("double free of frame {page}");
            }
            return;
        }
        self.clear(i);
        self.free += 1;
    }
}

impl TableAlloc for BitmapFrameAlloc {
    fn alloc_aligned(&mut self, size: usize, align: usize) -> Option<PhysicalAddress> {
        if size > PAGE_SIZE as usize || align > PAGE_SIZE as usize || !align.is_power_of_two() {
            error!("table allocation of {size} bytes aligned to {align} cannot be served by frames");
            return None;
        }
        self.alloc_page().map(PhysicalPage::base)
    }

    fn free(&mut self, addr: PhysicalAddress, size: usize) {
        debug_assert!(size <= PAGE_SIZE as usize);
        self.free_page(PhysicalPage::containing_address(addr));
    }
}
