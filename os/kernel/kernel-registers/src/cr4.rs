use bitfield_struct::bitfield;

/// CR4: Control Register 4 (IA-32).
#[bitfield(u32)]
pub struct Cr4 {
    /// Bit 0: VME: Virtual-8086 Mode Extensions.
    pub vme: bool,

    /// Bit 1: PVI: Protected-Mode Virtual Interrupts.
    pub pvi: bool,

    /// Bit 2: TSD: Time Stamp Disable.
    pub tsd: bool,

    /// Bit 3: DE: Debugging Extensions.
    pub de: bool,

    /// Bit 4: PSE: Page Size Extensions (4 MiB directory entries).
    pub pse: bool,

    /// Bit 5: PAE: Physical Address Extension. Must stay clear for two-level paging.
    pub pae: bool,

    /// Bit 6: MCE: Machine-Check Enable.
    pub mce: bool,

    /// Bit 7: PGE: Page Global Enable.
    ///
    /// Entries with `G=1` survive a CR3 reload, which is what keeps the
    /// shared kernel zone hot in the TLB across address-space switches.
    pub pge: bool,

    /// Bit 8: PCE: Performance-Monitoring Counter Enable.
    pub pce: bool,

    /// Bit 9: OSFXSR.
    pub osfxsr: bool,

    /// Bit 10: OSXMMEXCPT.
    pub osxmmexcpt: bool,

    /// Bit 11: UMIP: User-Mode Instruction Prevention.
    pub umip: bool,

    #[bits(8, default = 0)]
    _reserved_12_19: u8,

    /// Bit 20: SMEP: Supervisor Mode Execution Prevention.
    pub smep: bool,

    /// Bit 21: SMAP: Supervisor Mode Access Prevention.
    pub smap: bool,

    #[bits(10, default = 0)]
    _reserved_22_31: u16,
}

#[cfg(all(feature = "asm", target_arch = "x86"))]
impl crate::LoadRegisterUnsafe for Cr4 {
    unsafe fn load_unsafe() -> Self {
        let cr4: u32;
        unsafe {
            core::arch::asm!("mov {}, cr4", out(reg) cr4, options(nomem, nostack, preserves_flags));
        }
        Self::from_bits(cr4)
    }
}

#[cfg(all(feature = "asm", target_arch = "x86"))]
impl crate::StoreRegisterUnsafe for Cr4 {
    unsafe fn store_unsafe(self) {
        let cr4 = self.into_bits();
        unsafe {
            core::arch::asm!("mov cr4, {}", in(reg) cr4, options(nostack, preserves_flags));
        }
    }
}
