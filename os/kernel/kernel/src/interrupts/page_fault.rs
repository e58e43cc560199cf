//! # Page faults (`#PF`, vector 14)
//!
//! The trap stub saves a [`TrapFrame`] and passes it, together with `CR2`,
//! to [`page_fault`]. Faults on pages a region reserved are resolved by
//! backing the page; everything else is classified so the caller can kill the
//! offending process or stop the kernel.

use bitfield_struct::bitfield;
use kernel_alloc::vmm::{FaultAccess, FaultError, Vm, VmSpace};
use kernel_memory_addresses::VirtualAddress;
use kernel_qemu::qemu_trace;
use kernel_vmem::{FrameAlloc, MachineVm};
use log::{error, trace, warn};

pub const PAGE_FAULT_VECTOR: u8 = 0x0E; // 14

/// Page-fault error code layout (IA-32).
///
/// Each bit describes the condition that caused the page fault.
/// Reference: Intel SDM Vol. 3A, §6.15 "Page-Fault Exception (#PF)".
#[bitfield(u32)]
#[derive(PartialEq, Eq)]
pub struct PageFaultError {
    /// 0 = non-present page.
    /// 1 = protection violation (page present but access disallowed).
    pub present: bool, // bit 0

    /// 0 = read or execute.
    /// 1 = write access.
    pub write: bool, // bit 1

    /// 0 = supervisor (CPL 0–2).
    /// 1 = user mode (CPL 3).
    pub user: bool, // bit 2

    /// 1 = caused by reserved bit set in a paging structure.
    pub reserved_bit: bool, // bit 3

    /// 1 = instruction fetch (PAE with NX only).
    pub instruction_fetch: bool, // bit 4

    /// 1 = protection-key violation (if CR4.PKE=1).
    pub protection_key: bool, // bit 5

    /// 1 = shadow stack access (if CET-SS enabled).
    pub shadow_stack: bool, // bit 6

    #[bits(25)]
    __: u32, // reserved / ignored bits
}

impl PageFaultError {
    #[must_use]
    pub const fn explain(&self) -> &'static str {
        if self.reserved_bit() {
            "Reserved bit set in a paging structure"
        } else if !self.present() {
            "Non-present page (page not mapped or not yet backed)"
        } else if self.instruction_fetch() {
            if self.user() {
                "User-mode instruction fetch on protected page"
            } else {
                "Kernel instruction fetch on protected page"
            }
        } else if self.write() {
            "Write access to protected page"
        } else {
            "Read access to protected page"
        }
    }
}

impl From<PageFaultError> for FaultAccess {
    fn from(err: PageFaultError) -> Self {
        Self {
            write: err.write(),
            user: err.user(),
            present: err.present(),
            instruction_fetch: err.instruction_fetch(),
        }
    }
}

/// Register state saved by the exception stub, lowest address first.
///
/// `pusha` order, the data segments, the vector and error code pushed by the
/// stub, then what the processor pushed. `user_esp`/`user_ss` are only valid
/// when the fault came from ring 3.
#[repr(C)]
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct TrapFrame {
    pub edi: u32,
    pub esi: u32,
    pub ebp: u32,
    pub esp: u32,
    pub ebx: u32,
    pub edx: u32,
    pub ecx: u32,
    pub eax: u32,
    pub gs: u32,
    pub fs: u32,
    pub es: u32,
    pub ds: u32,
    pub vector: u32,
    pub error_code: u32,
    pub eip: u32,
    pub cs: u32,
    pub eflags: u32,
    pub user_esp: u32,
    pub user_ss: u32,
}

const _: () = assert!(size_of::<TrapFrame>() == 19 * 4);

impl TrapFrame {
    /// Whether the interrupted code ran in ring 3.
    #[inline]
    #[must_use]
    pub const fn from_user(&self) -> bool {
        self.cs & 3 == 3
    }

    #[inline]
    #[must_use]
    pub const fn page_fault_error(&self) -> PageFaultError {
        PageFaultError::from_bits(self.error_code)
    }
}

/// What the trap handler does after a page fault.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum FaultVerdict {
    /// The page is now backed; return and retry the access.
    Resume,
    /// The user process made an access it is not allowed to make.
    KillProcess(FaultError),
    /// The kernel itself faulted; there is nothing to recover.
    KernelPanic(FaultError),
}

/// Resolve or classify a page fault at `cr2` taken in `space`.
pub fn page_fault<M, F>(
    vm: &mut Vm<M, F>,
    space: &mut VmSpace<M::Object>,
    cr2: VirtualAddress,
    frame: &TrapFrame,
) -> FaultVerdict
where
    M: MachineVm,
    F: FrameAlloc,
{
    let err = frame.page_fault_error();
    let access = FaultAccess::from(err);

    if err.reserved_bit() {
        error!("corrupted paging structure at {cr2}, eip={:#010x}", frame.eip);
        log_page_fault(cr2, frame);
        return FaultVerdict::KernelPanic(FaultError::AccessViolation(cr2));
    }

    if space.kernel_region().contains(cr2) {
        log_page_fault(cr2, frame);
        let e = FaultError::AccessViolation(cr2);
        return if access.user {
            warn!("user access to kernel address {cr2}, eip={:#010x}", frame.eip);
            FaultVerdict::KillProcess(e)
        } else {
            error!("kernel fault on kernel address {cr2}, eip={:#010x}", frame.eip);
            FaultVerdict::KernelPanic(e)
        };
    }

    match vm.handle_fault(space, cr2, access) {
        Ok(backing) => {
            trace!("resolved fault at {cr2} with {backing}");
            FaultVerdict::Resume
        }
        Err(e) if access.user => {
            warn!("killing process: {e} (eip={:#010x})", frame.eip);
            log_page_fault(cr2, frame);
            FaultVerdict::KillProcess(e)
        }
        Err(e) => {
            error!("unresolved kernel fault: {e} (eip={:#010x})", frame.eip);
            log_page_fault(cr2, frame);
            FaultVerdict::KernelPanic(e)
        }
    }
}

/// Dump a fault to the debug console, bypassing the logger.
pub fn log_page_fault(cr2: VirtualAddress, frame: &TrapFrame) {
    let err = frame.page_fault_error();
    qemu_trace!("PAGE FAULT: cr2={cr2} err={raw:#x}\n", raw = err.into_bits());
    qemu_trace!("{}\n", err.explain());
    qemu_trace!("{err:#?}\n");
    qemu_trace!("{frame:#x?}\n");
}
