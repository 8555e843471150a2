//! ARM debug interface support: the ADIv5 JTAG-DP, memory access ports, ROM table discovery and
//! the ARMv7-A/ARMv8-A external debug registers.

pub mod ap;
mod communication_interface;
pub mod core;
pub mod dp;
pub mod memory;

pub use communication_interface::{ApMemory, ArmDebugInterface, DebugTransportError, MemoryAp};

/// JTAG instruction selecting the ABORT register.
pub const JTAG_ABORT_IR_VALUE: u32 = 0x8;
/// JTAG instruction selecting debug port accesses.
pub const JTAG_DP_IR_VALUE: u32 = 0xA;
/// JTAG instruction selecting access port accesses.
pub const JTAG_AP_IR_VALUE: u32 = 0xB;
/// Length of the DPACC, APACC and ABORT scan registers.
pub const JTAG_DR_BIT_LENGTH: usize = 35;

/// Maximum number of access ports probed during discovery.
pub const DEFAULT_MAX_APS: u8 = 10;

/// Default number of attempts for a transaction answered with WAIT.
pub const DEFAULT_WAIT_RETRIES: usize = 1024;

/// A DP or AP register.
pub trait Register: Clone + From<u32> + Into<u32> + Sized + std::fmt::Debug {
    /// The register address, the bank in the upper nibble.
    const ADDRESS: u8;
    /// The register name.
    const NAME: &'static str;
}

/// The port a transaction addresses.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum PortType {
    /// The debug port, reached through DPACC.
    DebugPort,
    /// The currently selected access port, reached through APACC.
    AccessPort,
}

impl PortType {
    /// The JTAG instruction that reaches this port.
    pub fn ir(self) -> u32 {
        match self {
            PortType::DebugPort => JTAG_DP_IR_VALUE,
            PortType::AccessPort => JTAG_AP_IR_VALUE,
        }
    }
}
