//! Register level debug of ARMv7-A cores (Cortex-A9).

use super::{
    armv7a_debug_regs::{Dbgbcr, Dbgbvr, Dbgdidr, Dbgdrcr, Dbgdscr, Dbgdtrtx, Dbgitr, Dbgpcsr},
    instructions::aarch32::{build_mcr, build_mov},
    memory_mapped_registers::MemoryMappedRegister,
    CoreError,
};
use crate::{architecture::arm::memory::DebugBus, poll::poll_until};

/// PCSR value while the core is halted or sampling is prohibited.
pub const PCSR_HALTED: u32 = 0xFFFF_FFFF;

/// The ARM-state PC reads two instructions ahead of the executing one.
const PC_READ_OFFSET: u32 = 8;

/// Debug registers of one ARMv7-A core.
#[derive(Debug)]
pub struct Armv7a<'a, M: DebugBus> {
    memory: &'a mut M,
    base_address: u64,
}

impl<'a, M: DebugBus> Armv7a<'a, M> {
    /// Accesses the core whose debug registers are at `base_address`.
    pub fn new(memory: &'a mut M, base_address: u64) -> Self {
        Self {
            memory,
            base_address,
        }
    }

    fn read<R: MemoryMappedRegister>(&mut self) -> Result<R, CoreError> {
        let address = R::get_mmio_address_from_base(self.base_address);
        Ok(R::from(self.memory.read_word_32(address)?))
    }

    fn write<R: MemoryMappedRegister>(&mut self, register: R) -> Result<(), CoreError> {
        let address = R::get_mmio_address_from_base(self.base_address);
        self.memory.write_word_32(address, register.into())?;
        Ok(())
    }

    /// Number of hardware breakpoint comparators.
    pub fn breakpoint_units(&mut self) -> Result<usize, CoreError> {
        let didr: Dbgdidr = self.read()?;
        Ok(didr.brps() as usize + 1)
    }

    /// Programs comparator `unit` to halt on `addr` in any mode.
    pub fn set_hw_breakpoint(&mut self, unit: usize, addr: u64) -> Result<(), CoreError> {
        let bp_value_addr =
            Dbgbvr::get_mmio_address_from_base(self.base_address) + (unit * 4) as u64;
        let bp_control_addr =
            Dbgbcr::get_mmio_address_from_base(self.base_address) + (unit * 4) as u64;

        let mut bp_control = Dbgbcr(0);
        // Match on all bytes
        bp_control.set_bas(0b1111);
        bp_control.set_e(true);

        self.memory
            .write_word_32(bp_value_addr, addr as u32 & !0b11)?;
        self.memory
            .write_word_32(bp_control_addr, bp_control.into())?;

        Ok(())
    }

    /// Disables comparator `unit`.
    pub fn clear_hw_breakpoint(&mut self, unit: usize) -> Result<(), CoreError> {
        let bp_control_addr =
            Dbgbcr::get_mmio_address_from_base(self.base_address) + (unit * 4) as u64;

        self.memory.write_word_32(bp_control_addr, 0)?;
        Ok(())
    }

    /// Reads the raw program counter sample.
    pub fn read_pcsr(&mut self) -> Result<u32, CoreError> {
        let pcsr: Dbgpcsr = self.read()?;
        Ok(pcsr.into())
    }

    /// Whether the core is halted, as reported by the PC sampling register.
    pub fn is_halted(&mut self) -> Result<bool, CoreError> {
        Ok(self.read_pcsr()? == PCSR_HALTED)
    }

    /// Reads the PC of the halted core by executing `MOV r0, pc` and moving r0 to DBGDTRTX.
    pub fn read_halted_pc(&mut self) -> Result<u64, CoreError> {
        let mut dscr: Dbgdscr = self.read()?;
        dscr.set_itren(true);
        self.write(dscr)?;

        self.write(Dbgitr(build_mov(0, 15)))?;
        self.write(Dbgitr(build_mcr(14, 0, 0, 0, 5, 0)))?;

        let dtrtx: Dbgdtrtx = self.read()?;
        Ok(u64::from(dtrtx.value().wrapping_sub(PC_READ_OFFSET)))
    }

    fn request_restart(&mut self) -> Result<(), CoreError> {
        let mut drcr = Dbgdrcr(0);
        drcr.set_cse(true);
        drcr.set_rrq(true);
        self.write(drcr)
    }

    /// Enables halting debug mode and restarts the core, reissuing the restart request until the
    /// core reports it restarted, at most `budget` times.
    pub fn resume(&mut self, budget: u32) -> Result<(), CoreError> {
        let mut dscr: Dbgdscr = self.read()?;
        dscr.set_hdbgen(true);
        dscr.set_itren(false);
        self.write(dscr)?;

        self.request_restart()?;

        poll_until("core restart", budget, || {
            let dscr: Dbgdscr = self.read()?;
            if dscr.restarted() {
                return Ok(Some(()));
            }

            self.request_restart()?;
            Ok(None)
        })
    }
}
