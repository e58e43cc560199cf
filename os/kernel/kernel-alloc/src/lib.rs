//! # Kernel Memory Allocation and Virtual Memory Management
//!
//! The architecture-neutral half of the memory manager, layered on the
//! page mapper and machine interface of `kernel-vmem`:
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │           Address-space model ([`vmm`])             │
//! │    • regions, overlap rules, eager / lazy backing   │
//! │    • page-fault fulfilment, address-space switch    │
//! └─────────────────┬───────────────────────────────────┘
//!                   │ MachineVm (kernel-vmem)
//! ┌─────────────────▼───────────────────────────────────┐
//! │           Physical mapper ([`phys_mapper`])         │
//! │    • entry tables reached through the kernel zone   │
//! └─────────────────┬───────────────────────────────────┘
//!                   │
//! ┌─────────────────▼───────────────────────────────────┐
//! │         Physical frame allocator ([`frame_alloc`])  │
//! │    • bitmap over a fixed range, no heap             │
//! │    • serialized by [`locked::LockedAlloc`]          │
//! └─────────────────────────────────────────────────────┘
//! ```
//!
//! ## Usage
//!
//! ```rust
//! use kernel_alloc::vmm::{FaultAccess, Vm};
//! use kernel_memory_addresses::VirtualAddress;
//! use kernel_vmem::testing::{FakeCpu, TestPhys, TestPool};
//! use kernel_vmem::x86::X86Vm;
//! use kernel_vmem::{KernelZone, VmFlags};
//!
//! let phys = TestPhys::new(64);
//! let tables = TestPool::new(0..32);
//! let frames = TestPool::new(32..64);
//! let cpu = FakeCpu::new();
//! let zone = KernelZone { size: 0x0040_0000, ..KernelZone::from_layout() };
//! let machine = X86Vm::with_kernel_zone(&phys, &tables, &cpu, zone);
//!
//! let (mut vm, _kernel) = Vm::bootstrap(machine, &frames).unwrap();
//! let mut space = vm.create_space().unwrap();
//! let heap = VirtualAddress::new(0x5000_0000);
//! vm.map_region(&mut space, heap, 0x4000, VmFlags::READ | VmFlags::WRITE | VmFlags::USER | VmFlags::LAZY)
//!     .unwrap();
//! vm.handle_fault(&mut space, heap, FaultAccess::user_write()).unwrap();
//! assert!(vm.translate(&space, heap).is_ok());
//! ```

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

extern crate alloc;

pub mod frame_alloc;
pub mod locked;
pub mod phys_mapper;
pub mod vmm;
