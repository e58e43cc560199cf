//! # Kernel Memory Layout Configuration
//!
//! Compile-time constants that fix how the 32-bit virtual address space is
//! split between the kernel and user programs, and which physical ranges feed
//! the page allocators. Everything that needs to agree on the layout (the
//! paging bootstrap, the address-space model, the bring-up code) reads it from
//! here.
//!
//! ## Virtual Memory Architecture
//!
//! ```text
//! Virtual Address Space Layout (32-bit):
//!
//! 0x0000_0000 ┌─────────────────────────────────┐ KERNEL_VM_START
//!             │   Kernel zone                   │
//!             │   direct map of physical RAM    │
//!             │   (supervisor, global, shared   │
//!             │    by every address space)      │
//! 0x4000_0000 ├─────────────────────────────────┤ USER_VM_START
//!             │   User zone                     │
//!             │   USER_HEAP_START  heap grows ↑ │
//!             │                                 │
//!             │   USER_STACK_TOP   stack grows ↓│
//! 0xFFFF_F000 ├─────────────────────────────────┤ USER_VM_END
//!             │   Unmapped guard page           │
//! 0xFFFF_FFFF └─────────────────────────────────┘
//! ```
//!
//! ## Physical Memory Layout
//!
//! ```text
//! 0x0000_0000 ┌─────────────────────────────────┐
//!             │     Low Memory (< 1MiB)         │
//! PHYS_LOAD   ├─────────────────────────────────┤ 0x0010_0000
//!             │     Kernel Image                │
//! TABLE_POOL  ├─────────────────────────────────┤ 0x0080_0000
//!             │     Entry-table pool            │
//! USER_FRAMES ├─────────────────────────────────┤ 0x0100_0000
//!             │     Pages for user regions      │
//!             └─────────────────────────────────┘
//! ```
//!
//! Every physical range lies below [`memory::KERNEL_VM_SIZE`], so the kernel
//! can reach any frame it hands out through the kernel-zone direct map.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![deny(unsafe_code)]

pub mod memory;
