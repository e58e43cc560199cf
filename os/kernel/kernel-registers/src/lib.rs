//! # Typed IA-32 Registers
//!
//! Bitfield models of the control registers the paging code touches
//! (`CR0`, `CR3`, `CR4`) and of `EFLAGS`. The models are plain values and can
//! be built and inspected anywhere; the actual `mov` to and from the hardware
//! registers is only compiled for 32-bit x86 targets with the `asm` feature.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

#[cfg(feature = "cr0")]
pub mod cr0;

#[cfg(feature = "cr3")]
pub mod cr3;

#[cfg(feature = "cr4")]
pub mod cr4;

#[cfg(feature = "eflags")]
pub mod eflags;

pub trait LoadRegisterUnsafe {
    /// # Safety
    /// Reading a control register is privileged and must happen in ring 0.
    unsafe fn load_unsafe() -> Self;
}

pub trait StoreRegisterUnsafe {
    /// # Safety
    /// Writing a control register changes how every subsequent memory access
    /// is translated or protected; the caller must make sure the new value
    /// keeps the currently executing code and stack mapped.
    unsafe fn store_unsafe(self);
}

pub trait LoadRegister {
    /// Loading this register is allowed at any privilege level.
    fn load() -> Self;
}

impl<T> LoadRegisterUnsafe for T
where
    T: LoadRegister,
{
    #[inline]
    unsafe fn load_unsafe() -> Self {
        <Self as LoadRegister>::load()
    }
}
