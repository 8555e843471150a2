//! The cores the probe samples, and their debug register files.

pub mod armv7a;
pub mod armv7a_debug_regs;
pub mod armv8a;
pub mod armv8a_debug_regs;
pub(crate) mod instructions;
pub mod memory_mapped_registers;

use serde::{Deserialize, Serialize};

use self::{
    armv7a::{Armv7a, PCSR_HALTED},
    armv8a::Armv8a,
    memory_mapped_registers::MemoryMappedRegister,
};
use crate::{
    architecture::arm::{memory::DebugBus, DebugTransportError},
    poll::Timeout,
};

/// Errors of the core layer.
#[derive(Debug, thiserror::Error, docsplay::Display)]
pub enum CoreError {
    /// Debug transport error
    Transport(#[from] DebugTransportError),

    /// Breakpoint unit {unit} does not exist, the core has {available} units.
    BreakpointUnitUnavailable { unit: usize, available: usize },

    /// There is no core {0}.
    UnknownCore(usize),

    /// Core {0} is powered down.
    CoreDisabled(usize),

    /// {0}
    Timeout(#[from] Timeout),
}

/// The debug architecture of a core.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CoreArchitecture {
    /// ARMv7-A, debug registers as in the ARMv7 debug architecture.
    Armv7a,
    /// ARMv8-A, external debug interface with a cross trigger interface per core.
    Armv8a,
}

/// The cores the probe recognizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CoreType {
    /// ARM Cortex-A9
    CortexA9,
    /// ARM Cortex-A53
    CortexA53,
    /// ARM Cortex-A57
    CortexA57,
}

impl CoreType {
    /// The debug architecture of this core type.
    pub fn architecture(self) -> CoreArchitecture {
        match self {
            CoreType::CortexA9 => CoreArchitecture::Armv7a,
            CoreType::CortexA53 | CoreType::CortexA57 => CoreArchitecture::Armv8a,
        }
    }
}

/// A discovered core.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Core {
    /// Which core this is.
    pub core_type: CoreType,
    /// Index of the access port its debug registers are reached through.
    pub ap: u8,
    /// Base address of its debug registers.
    pub debug_base: u32,
    /// Whether the core is powered up. Disabled cores are not sampled.
    pub enabled: bool,
}

impl Core {
    /// Brings up a core found during discovery.
    ///
    /// ARMv8-A cores are checked for power and get their cross trigger interface configured.
    /// ARMv7-A cores are always considered enabled.
    pub fn init(
        memory: &mut impl DebugBus,
        core_type: CoreType,
        ap: u8,
        debug_base: u32,
    ) -> Result<Self, CoreError> {
        let enabled = match core_type.architecture() {
            CoreArchitecture::Armv7a => true,
            CoreArchitecture::Armv8a => {
                let mut core = Armv8a::new(memory, u64::from(debug_base));
                let enabled = core.is_powered_up()?;
                if enabled {
                    core.configure_cti()?;
                }
                enabled
            }
        };

        tracing::info!(
            "Found {:?} at {:#010x} on AP {} ({})",
            core_type,
            debug_base,
            ap,
            if enabled { "enabled" } else { "disabled" }
        );

        Ok(Self {
            core_type,
            ap,
            debug_base,
            enabled,
        })
    }

    /// The debug architecture of the core.
    pub fn architecture(&self) -> CoreArchitecture {
        self.core_type.architecture()
    }

    fn base(&self) -> u64 {
        u64::from(self.debug_base)
    }

    /// Number of hardware breakpoint comparators.
    pub fn breakpoint_units(&self, memory: &mut impl DebugBus) -> Result<usize, CoreError> {
        match self.architecture() {
            CoreArchitecture::Armv7a => Armv7a::new(memory, self.base()).breakpoint_units(),
            CoreArchitecture::Armv8a => Armv8a::new(memory, self.base()).breakpoint_units(),
        }
    }

    /// Programs comparator `unit` with `addr`.
    pub fn set_hw_breakpoint(
        &self,
        memory: &mut impl DebugBus,
        unit: usize,
        addr: u64,
    ) -> Result<(), CoreError> {
        match self.architecture() {
            CoreArchitecture::Armv7a => Armv7a::new(memory, self.base()).set_hw_breakpoint(unit, addr),
            CoreArchitecture::Armv8a => Armv8a::new(memory, self.base()).set_hw_breakpoint(unit, addr),
        }
    }

    /// Disables comparator `unit`.
    pub fn clear_hw_breakpoint(
        &self,
        memory: &mut impl DebugBus,
        unit: usize,
    ) -> Result<(), CoreError> {
        match self.architecture() {
            CoreArchitecture::Armv7a => Armv7a::new(memory, self.base()).clear_hw_breakpoint(unit),
            CoreArchitecture::Armv8a => Armv8a::new(memory, self.base()).clear_hw_breakpoint(unit),
        }
    }

    /// Whether the core is halted.
    pub fn is_halted(&self, memory: &mut impl DebugBus) -> Result<bool, CoreError> {
        match self.architecture() {
            CoreArchitecture::Armv7a => Armv7a::new(memory, self.base()).is_halted(),
            CoreArchitecture::Armv8a => Armv8a::new(memory, self.base()).is_halted(),
        }
    }

    /// Reads the PC of the halted core.
    pub fn read_halted_pc(&self, memory: &mut impl DebugBus) -> Result<u64, CoreError> {
        match self.architecture() {
            CoreArchitecture::Armv7a => Armv7a::new(memory, self.base()).read_halted_pc(),
            CoreArchitecture::Armv8a => Armv8a::new(memory, self.base()).read_halted_pc(),
        }
    }

    /// Addresses of the PC sample registers, in the order they have to be read.
    pub fn pc_sample_addresses(&self) -> Vec<u32> {
        use self::{armv7a_debug_regs::Dbgpcsr, armv8a_debug_regs::{Edpcsrhi, Edpcsrlo}};

        let offsets: &[u64] = match self.architecture() {
            CoreArchitecture::Armv7a => &[Dbgpcsr::ADDRESS],
            // Reading the low word latches the high word.
            CoreArchitecture::Armv8a => &[Edpcsrlo::ADDRESS, Edpcsrhi::ADDRESS],
        };

        offsets
            .iter()
            .map(|offset| self.debug_base.wrapping_add(*offset as u32))
            .collect()
    }

    /// Turns the words read from [`Core::pc_sample_addresses`] into a program counter.
    ///
    /// An ARMv7-A core that cannot be sampled reports `0xFFFF_FFFF`, which is passed on. An
    /// ARMv8-A core reporting the same is mapped to 0.
    pub fn parse_pc_sample(&self, words: &[u32]) -> u64 {
        match (self.architecture(), words) {
            (CoreArchitecture::Armv7a, [pcsr, ..]) if *pcsr == PCSR_HALTED => u64::from(*pcsr),
            (CoreArchitecture::Armv7a, [pcsr, ..]) => u64::from(*pcsr & !0b11),
            (CoreArchitecture::Armv8a, [low, high, ..]) => {
                let pcsr = u64::from(*high) << 32 | u64::from(*low);
                if pcsr == u64::from(PCSR_HALTED) {
                    0
                } else {
                    pcsr & !0b11
                }
            }
            _ => 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use test_case::test_case;

    use super::*;
    use crate::architecture::arm::memory::mock::MockBus;

    fn core(core_type: CoreType) -> Core {
        Core {
            core_type,
            ap: 1,
            debug_base: 0x8009_0000,
            enabled: true,
        }
    }

    #[test]
    fn armv8_core_init_checks_power() {
        let mut bus = MockBus::new();
        bus.set(0x8041_0314, 0);

        let core = Core::init(&mut bus, CoreType::CortexA53, 1, 0x8041_0000).unwrap();

        assert!(!core.enabled);
        assert!(bus.writes().is_empty());
    }

    #[test]
    fn powered_armv8_core_gets_cti_configured() {
        let mut bus = MockBus::new();
        bus.set(0x8041_0314, 1);

        let core = Core::init(&mut bus, CoreType::CortexA53, 1, 0x8041_0000).unwrap();

        assert!(core.enabled);
        pretty_assertions::assert_eq!(bus.get(0x8042_0000), 1);
    }

    #[test]
    fn armv7_core_is_always_enabled() {
        let mut bus = MockBus::new();

        let core = Core::init(&mut bus, CoreType::CortexA9, 1, 0x8009_0000).unwrap();

        assert!(core.enabled);
        assert!(bus.log().is_empty());
    }

    #[test]
    fn sample_addresses() {
        pretty_assertions::assert_eq!(core(CoreType::CortexA9).pc_sample_addresses(), vec![0x8009_0084]);
        pretty_assertions::assert_eq!(
            core(CoreType::CortexA53).pc_sample_addresses(),
            vec![0x8009_00A0, 0x8009_00AC]
        );
    }

    #[test_case(CoreType::CortexA9, &[0x0010_0a13] => 0x0010_0a10; "armv7 aligned")]
    #[test_case(CoreType::CortexA9, &[0xFFFF_FFFF] => 0xFFFF_FFFF; "armv7 halted")]
    #[test_case(CoreType::CortexA53, &[0x0000_1007, 0x0000_0004] => 0x4_0000_1004; "armv8 wide")]
    #[test_case(CoreType::CortexA53, &[0xFFFF_FFFF, 0] => 0; "armv8 halted")]
    fn parse_pc(core_type: CoreType, words: &[u32]) -> u64 {
        core(core_type).parse_pc_sample(words)
    }
}
