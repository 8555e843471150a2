//! Register level debug of ARMv8-A cores (Cortex-A53, Cortex-A57).
//!
//! Halting and restarting goes through the cross trigger interface of each core. Channel 1
//! carries halt events: a core entering debug state signals it, and every core halts when it
//! sees it. Channel 0 carries the restart event.

use super::{
    armv8a_debug_regs::{
        CtiApppulse, CtiControl, CtiGate, CtiInen, CtiIntack, CtiOuten, Dbgbcr, Dbgbvr, DbgbvrHi,
        Dbgdtrrx, Dbgdtrtx, Editr, Edprsr, Edscr, IdAa64dfr0, CTI_OFFSET,
    },
    instructions::aarch64::{build_mrs, build_msr, DBGDTR_EL0, DLR_EL0},
    memory_mapped_registers::MemoryMappedRegister,
    CoreError,
};
use crate::{architecture::arm::memory::DebugBus, poll::poll_until};

const CHANNEL_RESTART: usize = 0;
const CHANNEL_HALT: usize = 1;

/// CTI trigger signalling debug entry.
const TRIGGER_HALT: u64 = 0;
/// CTI trigger requesting a restart.
const TRIGGER_RESTART: u64 = 1;

/// Breakpoint comparators are 16 bytes apart.
const BREAKPOINT_STRIDE: u64 = 16;

/// Debug registers of one ARMv8-A core.
#[derive(Debug)]
pub struct Armv8a<'a, M: DebugBus> {
    memory: &'a mut M,
    base_address: u64,
    cti_address: u64,
}

impl<'a, M: DebugBus> Armv8a<'a, M> {
    /// Accesses the core whose debug registers are at `base_address`.
    pub fn new(memory: &'a mut M, base_address: u64) -> Self {
        Self {
            memory,
            base_address,
            cti_address: base_address + CTI_OFFSET,
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

    fn write_cti<R: MemoryMappedRegister>(&mut self, index: u64, register: R) -> Result<(), CoreError> {
        let address = R::get_mmio_address_from_base(self.cti_address) + index * 4;
        self.memory.write_word_32(address, register.into())?;
        Ok(())
    }

    /// Whether the core is powered up.
    pub fn is_powered_up(&mut self) -> Result<bool, CoreError> {
        let prsr: Edprsr = self.read()?;
        Ok(prsr.pu())
    }

    /// Routes halt and restart events of this core through the cross trigger matrix.
    pub fn configure_cti(&mut self) -> Result<(), CoreError> {
        let mut control = CtiControl(0);
        control.set_glben(true);
        self.write_cti(0, control)?;

        let mut gate = CtiGate(0);
        gate.set_en(CHANNEL_RESTART, 1);
        gate.set_en(CHANNEL_HALT, 1);
        self.write_cti(0, gate)?;

        // Debug entry raises the halt channel.
        let mut inen = CtiInen(0);
        inen.set_inen(CHANNEL_HALT, 1);
        self.write_cti(TRIGGER_HALT, inen)?;

        // The halt channel halts the core.
        let mut outen = CtiOuten(0);
        outen.set_outen(CHANNEL_HALT, 1);
        self.write_cti(TRIGGER_HALT, outen)?;

        // The restart channel restarts it.
        let mut outen = CtiOuten(0);
        outen.set_outen(CHANNEL_RESTART, 1);
        self.write_cti(TRIGGER_RESTART, outen)?;

        Ok(())
    }

    /// Number of hardware breakpoint comparators.
    pub fn breakpoint_units(&mut self) -> Result<usize, CoreError> {
        let dfr0: IdAa64dfr0 = self.read()?;
        Ok(dfr0.brps() as usize + 1)
    }

    /// Programs comparator `unit` to halt on `addr` at any exception level, and enables halting
    /// debug.
    pub fn set_hw_breakpoint(&mut self, unit: usize, addr: u64) -> Result<(), CoreError> {
        let offset = unit as u64 * BREAKPOINT_STRIDE;

        let bp_value_addr = Dbgbvr::get_mmio_address_from_base(self.base_address) + offset;
        let bp_value_hi_addr = DbgbvrHi::get_mmio_address_from_base(self.base_address) + offset;
        let bp_control_addr = Dbgbcr::get_mmio_address_from_base(self.base_address) + offset;

        let mut bp_control = Dbgbcr(0);
        // Match in all modes and on all bytes
        bp_control.set_hmc(true);
        bp_control.set_pmc(0b11);
        bp_control.set_bas(0b1111);
        bp_control.set_e(true);

        self.memory
            .write_word_32(bp_value_addr, addr as u32 & !0b11)?;
        self.memory
            .write_word_32(bp_value_hi_addr, (addr >> 32) as u32)?;
        self.memory
            .write_word_32(bp_control_addr, bp_control.into())?;

        let mut edscr: Edscr = self.read()?;
        edscr.set_hde(true);
        self.write(edscr)?;

        Ok(())
    }

    /// Disables comparator `unit`.
    pub fn clear_hw_breakpoint(&mut self, unit: usize) -> Result<(), CoreError> {
        let bp_control_addr = Dbgbcr::get_mmio_address_from_base(self.base_address)
            + unit as u64 * BREAKPOINT_STRIDE;

        self.memory.write_word_32(bp_control_addr, 0)?;
        Ok(())
    }

    /// Whether the core is in debug state.
    pub fn is_halted(&mut self) -> Result<bool, CoreError> {
        let prsr: Edprsr = self.read()?;
        Ok(prsr.halted())
    }

    /// Reads the PC of the halted core by moving DLR_EL0 through the debug communication channel.
    pub fn read_halted_pc(&mut self) -> Result<u64, CoreError> {
        self.write(Editr(build_mrs(DLR_EL0, 0)))?;
        self.write(Editr(build_msr(DBGDTR_EL0, 0)))?;

        let high: Dbgdtrrx = self.read()?;
        let low: Dbgdtrtx = self.read()?;

        Ok(u64::from(high.value()) << 32 | u64::from(low.value()))
    }

    /// Acknowledges the halt trigger, so the core can be restarted.
    pub fn acknowledge_halt(&mut self) -> Result<(), CoreError> {
        let mut ack = CtiIntack(0);
        ack.set_ack(TRIGGER_HALT as usize, 1);
        self.write_cti(0, ack)
    }

    /// Pulses the restart channel. Every core with the restart trigger enabled restarts.
    pub fn pulse_restart(&mut self) -> Result<(), CoreError> {
        let mut pulse = CtiApppulse(0);
        pulse.set_apppulse(CHANNEL_RESTART, 1);
        self.write_cti(0, pulse)
    }

    /// Waits for the core to report the restart, checking at most `budget` times.
    pub fn wait_for_restart(&mut self, budget: u32) -> Result<(), CoreError> {
        poll_until("core restart", budget, || {
            let prsr: Edprsr = self.read()?;
            Ok(prsr.sdr().then_some(()))
        })
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{architecture::arm::memory::mock::MockBus, poll::Timeout};

    const BASE: u64 = 0x8041_0000;
    const CTI: u64 = BASE + 0x1_0000;

    #[test]
    fn cti_routes_halt_and_restart_channels() {
        let mut bus = MockBus::new();

        Armv8a::new(&mut bus, BASE).configure_cti().unwrap();

        assert_eq!(
            bus.writes(),
            vec![
                (CTI, 1),
                (CTI + 0x140, 0b11),
                (CTI + 0x20, 0b10),
                (CTI + 0xA0, 0b10),
                (CTI + 0xA4, 0b01),
            ]
        );
    }

    #[test]
    fn breakpoint_units_from_dfr0() {
        let mut bus = MockBus::new();
        bus.set(BASE + 0xD28, 0x1030_5106);

        assert_eq!(Armv8a::new(&mut bus, BASE).breakpoint_units().unwrap(), 6);
    }

    #[test]
    fn set_breakpoint_enables_halting_debug() {
        let mut bus = MockBus::new();
        bus.set(BASE + 0x88, 0x0300_0002);

        Armv8a::new(&mut bus, BASE)
            .set_hw_breakpoint(1, 0x0000_0008_0000_1237)
            .unwrap();

        assert_eq!(
            bus.writes(),
            vec![
                (BASE + 0x410, 0x0000_1234),
                (BASE + 0x414, 0x8),
                (BASE + 0x418, 0x21e7),
                (BASE + 0x88, 0x0300_4002),
            ]
        );
    }

    #[test]
    fn clear_breakpoint_touches_only_its_control_register() {
        let mut bus = MockBus::new();
        let mut core = Armv8a::new(&mut bus, BASE);

        core.set_hw_breakpoint(0, 0x1000).unwrap();
        core.set_hw_breakpoint(2, 0x2000).unwrap();
        core.clear_hw_breakpoint(2).unwrap();

        assert_eq!(bus.get(BASE + 0x408), 0x21e7);
        assert_eq!(bus.get(BASE + 0x428), 0);
        assert_eq!(bus.get(BASE + 0x420), 0x2000);
    }

    #[test]
    fn halted_pc_through_dcc() {
        let mut bus = MockBus::new();
        bus.set(BASE + 0x80, 0x0000_0001);
        bus.set(BASE + 0x8C, 0x0000_1000);

        let pc = Armv8a::new(&mut bus, BASE).read_halted_pc().unwrap();

        assert_eq!(pc, 0x0000_0001_0000_1000);
        assert_eq!(
            bus.writes(),
            vec![(BASE + 0x84, 0xD53B_4520), (BASE + 0x84, 0xD513_0400)]
        );
    }

    #[test]
    fn restart_through_cti() {
        let mut bus = MockBus::new();
        bus.script(BASE + 0x314, [0x1, 0x1, 0x801]);
        let mut core = Armv8a::new(&mut bus, BASE);

        core.acknowledge_halt().unwrap();
        core.pulse_restart().unwrap();
        core.wait_for_restart(5).unwrap();

        assert_eq!(bus.writes(), vec![(CTI + 0x10, 1), (CTI + 0x1C, 1)]);
    }

    #[test]
    fn restart_wait_is_bounded() {
        let mut bus = MockBus::new();
        bus.set(BASE + 0x314, 0x1);

        let error = Armv8a::new(&mut bus, BASE)
            .wait_for_restart(4)
            .unwrap_err();

        assert!(matches!(
            error,
            CoreError::Timeout(Timeout { attempts: 4, .. })
        ));
    }
}
