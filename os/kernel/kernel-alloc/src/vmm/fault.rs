use kernel_memory_addresses::VirtualAddress;
use kernel_vmem::{MachineError, VmFlags};

/// What the faulting access attempted, as reported by the hardware.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct FaultAccess {
    pub write: bool,
    pub user: bool,
    /// The page was present; the fault is a protection violation.
    pub present: bool,
    pub instruction_fetch: bool,
}

impl FaultAccess {
    #[must_use]
    pub const fn user_read() -> Self {
        Self {
            write: false,
            user: true,
            present: false,
            instruction_fetch: false,
        }
    }

    #[must_use]
    pub const fn user_write() -> Self {
        Self {
            write: true,
            ..Self::user_read()
        }
    }

    /// Whether a region with `flags` allows this access at all.
    #[must_use]
    pub const fn permitted_by(&self, flags: VmFlags) -> bool {
        if self.user && !flags.user_accessible() {
            return false;
        }
        if self.write {
            flags.contains(VmFlags::WRITE)
        } else if self.instruction_fetch {
            flags.contains(VmFlags::EXECUTE)
        } else {
            flags.intersects(VmFlags::READ.union(VmFlags::WRITE).union(VmFlags::EXECUTE))
        }
    }
}

/// A fault that cannot be resolved by backing a page.
#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FaultError {
    #[error("{0} is not inside any region")]
    NoRegion(VirtualAddress),
    #[error("access to {0} violates the region's flags")]
    AccessViolation(VirtualAddress),
    #[error("{0} has no page left to fulfil")]
    Unreserved(VirtualAddress),
    #[error("out of memory")]
    OutOfMemory,
    #[error(transparent)]
    Machine(MachineError),
}

impl From<MachineError> for FaultError {
    fn from(e: MachineError) -> Self {
        match e {
            MachineError::OutOfMemory => Self::OutOfMemory,
            e => Self::Machine(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_access_needs_a_user_region() {
        let kernel = VmFlags::READ | VmFlags::WRITE | VmFlags::SUPERVISOR;
        assert!(!FaultAccess::user_read().permitted_by(kernel));
        assert!(FaultAccess::default().permitted_by(kernel));
    }

    #[test]
    fn writes_need_write() {
        let ro = VmFlags::READ | VmFlags::USER;
        assert!(FaultAccess::user_read().permitted_by(ro));
        assert!(!FaultAccess::user_write().permitted_by(ro));
        assert!(FaultAccess::user_write().permitted_by(ro | VmFlags::WRITE));
    }

    #[test]
    fn no_access_flags_deny_everything() {
        assert!(!FaultAccess::user_read().permitted_by(VmFlags::USER));
    }
}
