//! # Kernel synchronization primitives
//!
//! The memory manager runs on a single core and only has to protect its
//! critical sections against the core's own interrupt handlers. Two tools
//! cover that: [`IrqGuard`] keeps interrupts off for a scope, and
//! [`SpinLock`] detects (and on SMP, serializes) overlapping use of a shared
//! resource such as the physical page allocator.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

pub mod irq;
mod spin_lock;

pub use irq::{InterruptControl, IrqGuard};
pub use spin_lock::{SpinLock, SpinLockGuard};
