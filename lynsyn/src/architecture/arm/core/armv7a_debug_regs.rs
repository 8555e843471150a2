//! Debug register definitions

use super::memory_mapped_registers::memory_mapped_bitfield_register;

memory_mapped_bitfield_register! {
    /// DBGDIDR - Debug ID Register
    pub struct Dbgdidr(u32);
    0x000, "DBGDIDR",
    impl From;

    /// The number of watchpoints implemented, minus one.
    pub u8, wrps, _: 31, 28;

    /// The number of breakpoints implemented, minus one.
    pub u8, brps, _: 27, 24;

    /// Debug architecture version.
    pub u8, version, _: 19, 16;
}

memory_mapped_bitfield_register! {
    /// DBGPCSR - Program Counter Sampling Register
    ///
    /// Reads as `0xFFFF_FFFF` while the processor is halted or non-invasive debug is not
    /// permitted. Shares its address with DBGITR.
    pub struct Dbgpcsr(u32);
    0x084, "DBGPCSR",
    impl From;

    /// Sampled program counter, with an offset that depends on the instruction set state.
    pub pcs, _: 31, 0;
}

memory_mapped_bitfield_register! {
    /// DBGITR - Instruction Transfer Register
    pub struct Dbgitr(u32);
    0x084, "DBGITR",
    impl From;

    /// Instruction to execute in debug state.
    pub value, set_value: 31, 0;
}

memory_mapped_bitfield_register! {
    /// DBGDSCR - Debug Status and Control Register
    pub struct Dbgdscr(u32);
    0x088, "DBGDSCR",
    impl From;

    /// DBGDTRRX register full.
    pub rxfull, _: 30;

    /// DBGDTRTX register full.
    pub txfull, _: 29;

    /// Halting debug-mode enable.
    pub hdbgen, set_hdbgen: 14;

    /// Execute ARM instruction enable. Instructions written to DBGITR are only executed with this
    /// bit set.
    pub itren, set_itren: 13;

    /// Method of debug entry.
    pub u8, moe, _: 5, 2;

    /// Core restarted.
    pub restarted, _: 1;

    /// Core halted.
    pub halted, _: 0;
}

memory_mapped_bitfield_register! {
    /// DBGDTRTX - Target to Host data transfer register
    pub struct Dbgdtrtx(u32);
    0x08C, "DBGDTRTX",
    impl From;

    /// Value
    pub value, set_value: 31, 0;
}

memory_mapped_bitfield_register! {
    /// DBGDRCR - Debug Run Control Register
    pub struct Dbgdrcr(u32);
    0x090, "DBGDRCR",
    impl From;

    /// Clear sticky exceptions.
    pub cse, set_cse: 2;

    /// Restart request.
    pub rrq, set_rrq: 1;

    /// Halt request.
    pub hrq, set_hrq: 0;
}

memory_mapped_bitfield_register! {
    /// DBGBVR - Breakpoint Value Register. Comparator `n` is at `n * 4` from the first one.
    pub struct Dbgbvr(u32);
    0x100, "DBGBVR",
    impl From;

    /// Breakpoint address
    pub value, set_value : 31, 0;
}

memory_mapped_bitfield_register! {
    /// DBGBCR - Breakpoint Control Register. Comparator `n` is at `n * 4` from the first one.
    pub struct Dbgbcr(u32);
    0x140, "DBGBCR",
    impl From;

    /// Breakpoint type
    pub u8, bt, set_bt : 23, 20;

    /// Byte address select
    pub u8, bas, set_bas: 8, 5;

    /// Privileged mode control
    pub u8, pmc, set_pmc: 2, 1;

    /// Breakpoint enable
    pub e, set_e: 0;
}
