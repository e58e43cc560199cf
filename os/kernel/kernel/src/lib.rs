//! # Kernel bring-up
//!
//! Glue between the hardware and the memory manager: installs the debug
//! console logger, brings paging up on the boot processor and turns page
//! faults into a verdict for the trap handler.
//!
//! Only the memory manager is wired here; the boot entry and the interrupt
//! descriptor table are owned by the platform code that links this crate.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

pub mod boot;
pub mod interrupts;
