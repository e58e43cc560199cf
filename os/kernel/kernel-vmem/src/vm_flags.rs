//! # Mapping flags
//!
//! Architecture-neutral permission flags attached to a mapping request or an
//! address-space region, and their translation into x86 entry bits.

use crate::PageEntryBits;

bitflags::bitflags! {
    /// Permissions and placement hints of a mapping.
    ///
    /// `SUPERVISOR` wins over `USER` when both are given. x86 without NX
    /// cannot deny execution of a readable page; `EXECUTE` is tracked for the
    /// fault classifier but does not change the entry bits.
    #[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
    pub struct VmFlags: u32 {
        /// Pages may be read.
        const READ       = 1 << 0;
        /// Pages may be written.
        const WRITE      = 1 << 1;
        /// Pages may be executed.
        const EXECUTE    = 1 << 2;
        /// Pages are accessible from user mode.
        const USER       = 1 << 3;
        /// Pages are accessible from supervisor mode only.
        const SUPERVISOR = 1 << 4;
        /// Translation survives address-space switches (kernel zone).
        const GLOBAL     = 1 << 5;
        /// Back the region on first touch instead of at creation.
        const LAZY       = 1 << 6;
    }
}

impl VmFlags {
    /// Whether user-mode code may access pages with these flags.
    #[inline]
    #[must_use]
    pub const fn user_accessible(self) -> bool {
        self.contains(Self::USER) && !self.contains(Self::SUPERVISOR)
    }

    /// Leaf (table) entry bits for these flags, without the present bit or a frame.
    #[inline]
    #[must_use]
    pub const fn entry_bits(self) -> PageEntryBits {
        PageEntryBits::new()
            .with_writable(self.contains(Self::WRITE))
            .with_user_access(self.user_accessible())
            .with_global(self.contains(Self::GLOBAL))
    }

    /// Directory entry bits for a page table created on behalf of these flags.
    ///
    /// `G` is meaningless on a directory entry that points to a table.
    #[inline]
    #[must_use]
    pub const fn directory_bits(self) -> PageEntryBits {
        self.entry_bits().with_global(false)
    }
}
