//! Debug register definitions

use super::memory_mapped_registers::memory_mapped_bitfield_register;

/// Offset of the core's cross trigger interface from its debug base.
pub const CTI_OFFSET: u64 = 0x1_0000;

memory_mapped_bitfield_register! {
    /// DBGDTRRX - Debug Data Transfer Register, Receive
    ///
    /// After `MSR DBGDTR_EL0, Xt` this holds the upper half of `Xt`.
    pub struct Dbgdtrrx(u32);
    0x080, "DBGDTRRX",
    impl From;

    /// Value
    pub value, set_value: 31, 0;
}

memory_mapped_bitfield_register! {
    /// EDITR - External Debug Instruction Transfer Register
    pub struct Editr(u32);
    0x084, "EDITR",
    impl From;

    /// Instruction value
    pub value, set_value: 31, 0;
}

memory_mapped_bitfield_register! {
    /// EDSCR - Debug Status and Control Register
    pub struct Edscr(u32);
    0x088, "EDSCR",
    impl From;

    /// DTRRX full.
    pub rxfull, set_rxfull: 30;

    /// DTRTX full.
    pub txfull, set_txfull: 29;

    /// ITR empty.
    pub ite, _: 24;

    /// Halting debug enable.
    pub hde, set_hde: 14;

    /// Debug status flags.
    pub u8, status, _: 5, 0;
}

memory_mapped_bitfield_register! {
    /// DBGDTRTX - Debug Data Transfer Register, Transmit
    ///
    /// After `MSR DBGDTR_EL0, Xt` this holds the lower half of `Xt`.
    pub struct Dbgdtrtx(u32);
    0x08C, "DBGDTRTX",
    impl From;

    /// Value
    pub value, set_value: 31, 0;
}

memory_mapped_bitfield_register! {
    /// EDPCSRlo - External Debug Program Counter Sample Register, low word
    pub struct Edpcsrlo(u32);
    0x0A0, "EDPCSRlo",
    impl From;

    /// Sampled program counter, bits 31:0.
    pub value, _: 31, 0;
}

memory_mapped_bitfield_register! {
    /// EDPCSRhi - External Debug Program Counter Sample Register, high word
    ///
    /// Only valid after EDPCSRlo was read.
    pub struct Edpcsrhi(u32);
    0x0AC, "EDPCSRhi",
    impl From;

    /// Sampled program counter, bits 63:32.
    pub value, _: 31, 0;
}

memory_mapped_bitfield_register! {
    /// EDPRSR - External Debug Processor Status Register
    pub struct Edprsr(u32);
    0x314, "EDPRSR",
    impl From;

    /// Sticky Debug Restart.
    pub sdr, _: 11;

    /// OS Lock status bit.
    pub oslk, _: 5;

    /// Halted status bit.
    pub halted, _: 4;

    /// Sticky core Reset status bit.
    pub sr, _: 3;

    /// PE Reset status bit.
    pub r, _: 2;

    /// Sticky core Powerdown status bit.
    pub spd, _: 1;

    /// Core powerup status bit.
    pub pu, _: 0;
}

memory_mapped_bitfield_register! {
    /// DBGBVR - Breakpoint Value Register, low word. Comparator `n` is at `n * 16` from the
    /// first one.
    pub struct Dbgbvr(u32);
    0x400, "DBGBVR",
    impl From;

    /// Breakpoint address
    pub value, set_value : 31, 0;
}

memory_mapped_bitfield_register! {
    /// DBGBVR - Breakpoint Value Register, high word.
    pub struct DbgbvrHi(u32);
    0x404, "DBGBVR_HI",
    impl From;

    /// Breakpoint address, bits 63:32
    pub value, set_value : 31, 0;
}

memory_mapped_bitfield_register! {
    /// DBGBCR - Breakpoint Control Register
    pub struct Dbgbcr(u32);
    0x408, "DBGBCR",
    impl From;

    /// Breakpoint type
    pub u8, bt, set_bt : 23, 20;

    /// Security state control
    pub u8, ssc, set_ssc : 15, 14;

    /// Hyp mode control bit
    pub hmc, set_hmc: 13;

    /// Byte address select
    pub u8, bas, set_bas: 8, 5;

    /// Privilege mode control
    pub u8, pmc, set_pmc: 2, 1;

    /// Enable
    pub e, set_e: 0;
}

memory_mapped_bitfield_register! {
    /// ID_AA64DFR0_EL1 - AArch64 Debug Feature Register 0
    pub struct IdAa64dfr0(u32);
    0xD28, "ID_AA64DFR0_EL1",
    impl From;

    /// Number of watchpoints, minus one.
    pub u8, wrps, _: 23, 20;

    /// Number of breakpoints, minus one.
    pub u8, brps, _: 15, 12;
}

memory_mapped_bitfield_register! {
    /// CTICONTROL - CTI control register
    pub struct CtiControl(u32);
    0x000, "CTICONTROL",
    impl From;

    /// Enables or disables the CTI mapping functions.
    pub glben, set_glben : 0;
}

memory_mapped_bitfield_register! {
    /// CTIINTACK - CTI Output Trigger Acknowledge register
    pub struct CtiIntack(u32);
    0x010, "CTIINTACK",
    impl From;

    /// Ack trigger on output N
    pub ack, set_ack : 0, 0, 32;
}

memory_mapped_bitfield_register! {
    /// CTIAPPPULSE - CTI application pulse register
    pub struct CtiApppulse(u32);
    0x01C, "CTIAPPPULSE",
    impl From;

    /// Generate a pulse on channel N
    pub apppulse, set_apppulse : 0, 0, 32;
}

memory_mapped_bitfield_register! {
    /// CTIINEN<n> - CTI input enable register. Trigger input `n` is at `n * 4` from the first.
    pub struct CtiInen(u32);
    0x020, "CTIINEN",
    impl From;

    /// Enables trigger input <n> generating an event on channel N
    pub inen, set_inen : 0, 0, 32;
}

memory_mapped_bitfield_register! {
    /// CTIOUTEN<n> - CTI output enable register. Trigger output `n` is at `n * 4` from the first.
    pub struct CtiOuten(u32);
    0x0A0, "CTIOUTEN",
    impl From;

    /// Enables or disables channel N generating output <n>
    pub outen, set_outen : 0, 0, 32;
}

memory_mapped_bitfield_register! {
    /// CTIGATE - CTI gate register
    pub struct CtiGate(u32);
    0x140, "CTIGATE",
    impl From;

    /// Enables channel N being passed to the cross trigger matrix.
    pub en, set_en : 0, 0, 32;
}
