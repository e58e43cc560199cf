use kernel_memory_addresses::{PhysicalAddress, PhysicalPage, Size4K};
use kernel_sync::SpinLock;
use kernel_vmem::{FrameAlloc, TableAlloc};

/// A shared allocator behind a [`SpinLock`].
///
/// Allocation is not re-entrant: allocating from inside another allocator
/// call (say, from an interrupt that arrived mid-allocation) would deadlock a
/// single core, so it panics instead.
pub struct LockedAlloc<A> {
    inner: SpinLock<A>,
}

impl<A> LockedAlloc<A> {
    pub const fn new(inner: A) -> Self {
        Self {
            inner: SpinLock::new(inner),
        }
    }

    /// Run `f` with exclusive access to the allocator.
    ///
    /// # Panics
    /// If the allocator is already in use.
    pub fn with<R>(&self, f: impl FnOnce(&mut A) -> R) -> R {
        match self.inner.try_with_lock(f) {
            Some(r) => r,
            None => panic!("allocator re-entered"),
        }
    }
}

impl<A: FrameAlloc> FrameAlloc for &LockedAlloc<A> {
    fn alloc_page(&mut self) -> Option<PhysicalPage<Size4K>> {
        self.with(FrameAlloc::alloc_page)
    }

    fn free_page(&mut self, page: PhysicalPage<Size4K>) {
        self.with(|a| a.free_page(page));
    }
}

impl<A: TableAlloc> TableAlloc for &LockedAlloc<A> {
    fn alloc_aligned(&mut self, size: usize, align: usize) -> Option<PhysicalAddress> {
        self.with(|a| a.alloc_aligned(size, align))
    }

    fn free(&mut self, addr: PhysicalAddress, size: usize) {
        self.with(|a| a.free(addr, size));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame_alloc::BitmapFrameAlloc;

    #[test]
    fn shared_reference_allocates() {
        let pool = LockedAlloc::new(BitmapFrameAlloc::new(PhysicalAddress::new(0), PhysicalAddress::new(0x2000)));
        let mut frames = &pool;
        let p = frames.alloc_page().unwrap();
        assert_eq!(pool.with(|a| a.free_count()), 1);
        frames.free_page(p);
        assert_eq!(pool.with(|a| a.free_count()), 2);
    }

    #[test]
    #[should_panic(expected = "re-entered")]
    fn nested_use_panics() {
        let pool = LockedAlloc::new(BitmapFrameAlloc::new(PhysicalAddress::new(0), PhysicalAddress::new(0x2000)));
        pool.with(|_| {
            let mut frames = &pool;
            frames.alloc_page()
        });
    }
}
