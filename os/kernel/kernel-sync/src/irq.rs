/// Access to the local processor's interrupt-enable flag.
///
/// Code that must not be interrupted takes an [`IrqGuard`] over an
/// implementation of this trait instead of issuing `cli`/`sti` directly, so the
/// same code paths can run against a recording double on the host.
pub trait InterruptControl {
    /// Whether maskable interrupts are currently delivered (`EFLAGS.IF`).
    fn interrupts_enabled(&self) -> bool;

    /// Mask interrupts (`cli`).
    fn disable_interrupts(&self);

    /// Unmask interrupts (`sti`).
    fn enable_interrupts(&self);
}

impl<T: InterruptControl + ?Sized> InterruptControl for &T {
    #[inline]
    fn interrupts_enabled(&self) -> bool {
        (**self).interrupts_enabled()
    }

    #[inline]
    fn disable_interrupts(&self) {
        (**self).disable_interrupts();
    }

    #[inline]
    fn enable_interrupts(&self) {
        (**self).enable_interrupts();
    }
}

/// RAII guard that disables interrupts on creation and restores them on drop.
///
/// The guard snapshots the enable flag. If interrupts were enabled it masks
/// them; on drop it unmasks them **only** if they were enabled before, so
/// guards nest and a guard taken inside a handler leaves interrupts off.
///
/// # Examples
///
/// ```
/// use core::cell::Cell;
/// use kernel_sync::{InterruptControl, IrqGuard};
///
/// struct Flag(Cell<bool>);
/// impl InterruptControl for Flag {
///     fn interrupts_enabled(&self) -> bool { self.0.get() }
///     fn disable_interrupts(&self) { self.0.set(false) }
///     fn enable_interrupts(&self) { self.0.set(true) }
/// }
///
/// let cpu = Flag(Cell::new(true));
/// {
///     let _g = IrqGuard::new(&cpu);
///     assert!(!cpu.interrupts_enabled());
/// }
/// assert!(cpu.interrupts_enabled());
/// ```
#[must_use = "interrupts are re-enabled as soon as the guard is dropped"]
pub struct IrqGuard<'a, C: InterruptControl + ?Sized> {
    cpu: &'a C,
    /// Whether interrupts were enabled (IF=1) when the guard was created.
    were_enabled: bool,
}

impl<'a, C: InterruptControl + ?Sized> IrqGuard<'a, C> {
    /// Disables interrupts if they are currently enabled and remembers the state.
    #[inline]
    pub fn new(cpu: &'a C) -> Self {
        let were_enabled = cpu.interrupts_enabled();
        if were_enabled {
            cpu.disable_interrupts();
        }
        Self { cpu, were_enabled }
    }

    /// Whether this guard will re-enable interrupts when dropped.
    #[inline]
    #[must_use]
    pub const fn restores(&self) -> bool {
        self.were_enabled
    }
}

impl<C: InterruptControl + ?Sized> Drop for IrqGuard<'_, C> {
    fn drop(&mut self) {
        if self.were_enabled {
            self.cpu.enable_interrupts();
        }
    }
}

/// The executing processor, driven through `cli`, `sti` and `EFLAGS.IF`.
///
/// # Safety & Privilege
///
/// `cli`/`sti` are only legal at CPL 0 (or with sufficient IOPL); this type
/// must only be used from kernel code.
#[cfg(target_arch = "x86")]
#[derive(Debug, Default, Copy, Clone)]
pub struct LocalCpu;

#[cfg(target_arch = "x86")]
impl InterruptControl for LocalCpu {
    #[inline]
    fn interrupts_enabled(&self) -> bool {
        use kernel_registers::LoadRegister;
        kernel_registers::eflags::Eflags::load().if_interrupt_enable()
    }

    #[inline]
    fn disable_interrupts(&self) {
        unsafe { core::arch::asm!("cli", options(nomem, nostack, preserves_flags)) }
    }

    #[inline]
    fn enable_interrupts(&self) {
        unsafe { core::arch::asm!("sti", options(nomem, nostack, preserves_flags)) }
    }
}
