//! Contains helpers to build instructions for the instruction transfer register.
pub(crate) mod aarch32 {
    /// Build a MOV instruction
    pub(crate) fn build_mov(rd: u16, rm: u16) -> u32 {
        let mut ret = 0b1110_0001_1010_0000_0000_0000_0000_0000;

        ret |= (rd as u32) << 12;
        ret |= rm as u32;

        ret
    }

    /// Build a MCR instruction
    pub(crate) fn build_mcr(
        coproc: u8,
        opcode1: u8,
        reg: u16,
        ctrl_reg_n: u8,
        ctrl_reg_m: u8,
        opcode2: u8,
    ) -> u32 {
        let mut ret = 0b1110_1110_0000_0000_0000_0000_0001_0000;

        ret |= (coproc as u32) << 8;
        ret |= (opcode1 as u32) << 21;
        ret |= (reg as u32) << 12;
        ret |= (ctrl_reg_n as u32) << 16;
        ret |= ctrl_reg_m as u32;
        ret |= (opcode2 as u32) << 5;

        ret
    }

}

pub(crate) mod aarch64 {
    /// An AArch64 system register, as its op0, op1, CRn, CRm and op2 fields.
    #[derive(Debug, Clone, Copy)]
    pub(crate) struct SystemRegister {
        op0: u8,
        op1: u8,
        crn: u8,
        crm: u8,
        op2: u8,
    }

    impl SystemRegister {
        fn encode(self) -> u32 {
            (self.op0 as u32 & 0b1) << 19
                | (self.op1 as u32) << 16
                | (self.crn as u32) << 12
                | (self.crm as u32) << 8
                | (self.op2 as u32) << 5
        }
    }

    /// DLR_EL0, the address execution resumes at when leaving debug state.
    pub(crate) const DLR_EL0: SystemRegister = SystemRegister {
        op0: 3,
        op1: 3,
        crn: 4,
        crm: 5,
        op2: 1,
    };

    /// DBGDTR_EL0, both halves of the debug communication channel.
    pub(crate) const DBGDTR_EL0: SystemRegister = SystemRegister {
        op0: 2,
        op1: 3,
        crn: 0,
        crm: 4,
        op2: 0,
    };

    /// Build a MRS instruction, reading `register` into `rt`.
    pub(crate) fn build_mrs(register: SystemRegister, rt: u16) -> u32 {
        let mut ret = 0b1101_0101_0011_0000_0000_0000_0000_0000;

        ret |= register.encode();
        ret |= rt as u32;

        ret
    }

    /// Build a MSR instruction, writing `rt` to `register`.
    pub(crate) fn build_msr(register: SystemRegister, rt: u16) -> u32 {
        let mut ret = 0b1101_0101_0001_0000_0000_0000_0000_0000;

        ret |= register.encode();
        ret |= rt as u32;

        ret
    }

}
