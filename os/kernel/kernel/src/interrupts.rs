//! # Exception handling
//!
//! Decoding and dispatch of the processor exceptions the memory manager
//! cares about. Installing gates is left to the platform code; the handlers
//! here take an already saved [`TrapFrame`](page_fault::TrapFrame).

pub mod page_fault;

pub use page_fault::{FaultVerdict, PAGE_FAULT_VECTOR, PageFaultError, TrapFrame, page_fault};
