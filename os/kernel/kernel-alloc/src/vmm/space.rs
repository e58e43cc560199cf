use crate::vmm::region::VmRegion;
use alloc::collections::BTreeMap;
use kernel_info::memory::{USER_HEAP_START, USER_STACK_SIZE, USER_STACK_TOP};
use kernel_memory_addresses::VirtualAddress;
use kernel_vmem::{KernelZone, VmFlags};

/// The regions every address space carries from creation.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum WellKnown {
    Stack,
    Heap,
}

impl WellKnown {
    /// Default flags: user read/write, backed on first touch.
    pub const FLAGS: VmFlags = VmFlags::READ
        .union(VmFlags::WRITE)
        .union(VmFlags::USER)
        .union(VmFlags::LAZY);

    /// Where the region sits until placed explicitly.
    #[must_use]
    pub const fn anchor(self) -> VirtualAddress {
        match self {
            Self::Stack => VirtualAddress::new(USER_STACK_TOP.as_u32() - USER_STACK_SIZE),
            Self::Heap => USER_HEAP_START,
        }
    }

    /// The default `(address, size)` of the region.
    #[must_use]
    pub const fn default_range(self) -> (VirtualAddress, u32) {
        match self {
            Self::Stack => (self.anchor(), USER_STACK_SIZE),
            Self::Heap => (self.anchor(), 0),
        }
    }
}

/// Flags of the kernel region present in every space.
pub const KERNEL_REGION_FLAGS: VmFlags = VmFlags::READ
    .union(VmFlags::WRITE)
    .union(VmFlags::EXECUTE)
    .union(VmFlags::SUPERVISOR)
    .union(VmFlags::GLOBAL);

/// One address space: its machine object and its regions.
///
/// Regions never overlap. The kernel region covers the shared kernel zone;
/// the stack and heap start out empty at their anchors.
#[derive(Debug)]
pub struct VmSpace<O> {
    object: O,
    pub(crate) kernel: VmRegion,
    pub(crate) stack: VmRegion,
    pub(crate) heap: VmRegion,
    pub(crate) others: BTreeMap<u32, VmRegion>,
}

impl<O: Copy> VmSpace<O> {
    pub(crate) fn new(object: O, zone: KernelZone) -> Self {
        Self {
            object,
            kernel: VmRegion {
                address: zone.virt_start,
                size: zone.size,
                flags: KERNEL_REGION_FLAGS,
                unfulfilled_ppages: 0,
            },
            stack: VmRegion::empty(WellKnown::Stack.anchor(), WellKnown::FLAGS),
            heap: VmRegion::empty(WellKnown::Heap.anchor(), WellKnown::FLAGS),
            others: BTreeMap::new(),
        }
    }

    /// The machine translation root of this space.
    #[inline]
    #[must_use]
    pub const fn object(&self) -> O {
        self.object
    }

    #[must_use]
    pub const fn kernel_region(&self) -> &VmRegion {
        &self.kernel
    }

    #[must_use]
    pub const fn well_known(&self, which: WellKnown) -> &VmRegion {
        match which {
            WellKnown::Stack => &self.stack,
            WellKnown::Heap => &self.heap,
        }
    }

    pub(crate) const fn well_known_mut(&mut self, which: WellKnown) -> &mut VmRegion {
        match which {
            WellKnown::Stack => &mut self.stack,
            WellKnown::Heap => &mut self.heap,
        }
    }

    /// The current end of the heap.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn heap_break(&self) -> VirtualAddress {
        VirtualAddress::new(self.heap.end() as u32)
    }

    /// Every non-empty region, kernel first, the rest by address.
    pub fn regions(&self) -> impl Iterator<Item = &VmRegion> {
        [&self.kernel, &self.stack, &self.heap]
            .into_iter()
            .chain(self.others.values())
            .filter(|r| !r.is_empty())
    }

    /// The region holding `va`.
    #[must_use]
    pub fn region_containing(&self, va: VirtualAddress) -> Option<&VmRegion> {
        self.regions().find(|r| r.contains(va))
    }

    pub(crate) fn region_containing_mut(&mut self, va: VirtualAddress) -> Option<&mut VmRegion> {
        [&mut self.kernel, &mut self.stack, &mut self.heap]
            .into_iter()
            .chain(self.others.values_mut())
            .find(|r| r.contains(va))
    }

    /// The first region sharing a byte with `[start, end)`.
    #[must_use]
    pub fn first_overlapping(&self, start: u64, end: u64) -> Option<&VmRegion> {
        self.regions().find(|r| r.overlaps(start, end))
    }

    /// Total number of pages still awaiting a frame.
    #[must_use]
    pub fn unfulfilled_ppages(&self) -> u32 {
        self.regions().map(|r| r.unfulfilled_ppages).sum()
    }
}
