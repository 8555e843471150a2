//! Structures shared by the JTAG backends and the scan chain model.

use bitfield::bitfield;
use bitvec::prelude::*;
use serde::{Deserialize, Serialize};

/// The largest scan chain the probe will look for.
pub const MAX_JTAG_DEVICES: usize = 32;

/// IDCODE of the CoreSight DAP TAP found on Zynq-7000 devices (Cortex-A9).
pub const CORTEX_A9_DAP_IDCODE: u32 = 0x4ba0_0477;

/// IDCODE of the CoreSight DAP TAP found on Zynq UltraScale+ devices (Cortex-A53).
pub const CORTEX_A53_DAP_IDCODE: u32 = 0x5ba0_0477;

/// Loads up to 32 bits from the front of `bits`, least significant bit first.
pub(crate) fn bits_to_word(bits: &BitSlice<u8>) -> u32 {
    let len = bits.len().min(32);
    if len == 0 {
        return 0;
    }
    bits[..len].load_le::<u32>()
}

bitfield! {
    /// A JTAG IDCODE.
    /// Identifies a particular Test Access Port (TAP) on the JTAG scan chain.
    #[derive(Copy, Clone, Eq, PartialEq, Hash, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct IdCode(u32);
    impl Debug;

    u8;
    /// The IDCODE version.
    pub version, set_version: 31, 28;

    u16;
    /// The part number.
    pub part_number, set_part_number: 27, 12;

    /// The JEDEC JEP-106 Manufacturer ID.
    pub manufacturer, set_manufacturer: 11, 1;

    u8;
    /// The continuation code of the JEDEC JEP-106 Manufacturer ID.
    pub manufacturer_continuation, set_manufacturer_continuation: 11, 8;

    /// The identity code of the JEDEC JEP-106 Manufacturer ID.
    pub manufacturer_identity, set_manufacturer_identity: 7, 1;

    bool;
    /// The least-significant bit.
    /// Always set.
    pub lsbit, set_lsbit: 0;
}

impl std::fmt::Display for IdCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if let Some(mfn) = self.manufacturer_name() {
            write!(f, "0x{:08X} ({})", self.0, mfn)
        } else {
            write!(f, "0x{:08X}", self.0)
        }
    }
}

impl IdCode {
    /// Returns `true` iff the IDCODE's least significant bit is `1`
    /// and the 7-bit `manufacturer_identity` is set to one of the non-reserved values in the range `[1,126]`.
    pub fn valid(&self) -> bool {
        self.lsbit() && (self.manufacturer() != 0) && (self.manufacturer() != 127)
    }

    /// Return the manufacturer name, if available.
    pub fn manufacturer_name(&self) -> Option<&'static str> {
        let cc = self.manufacturer_continuation();
        let id = self.manufacturer_identity();
        jep106::JEP106Code::new(cc, id).get()
    }

    /// Whether this is one of the ARM DAP TAPs the probe can drive.
    pub fn is_arm_dap(&self) -> bool {
        matches!(self.0, CORTEX_A9_DAP_IDCODE | CORTEX_A53_DAP_IDCODE)
    }
}

impl From<u32> for IdCode {
    fn from(value: u32) -> Self {
        IdCode(value)
    }
}

impl From<IdCode> for u32 {
    fn from(value: IdCode) -> Self {
        value.0
    }
}

/// One TAP on the scan chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanChainDevice {
    /// The IDCODE the TAP reports after reset.
    pub idcode: IdCode,
    /// Length of the instruction register in bits.
    pub irlen: u32,
}

/// Instruction register lengths for TAPs identified by IDCODE.
///
/// Lookups prefer entries supplied by the host for the current session over the entries
/// built into the configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TapTable {
    entries: Vec<ScanChainDevice>,
}

impl Default for TapTable {
    fn default() -> Self {
        Self {
            entries: vec![
                ScanChainDevice {
                    idcode: IdCode(CORTEX_A9_DAP_IDCODE),
                    irlen: 4,
                },
                ScanChainDevice {
                    idcode: IdCode(CORTEX_A53_DAP_IDCODE),
                    irlen: 4,
                },
            ],
        }
    }
}

impl TapTable {
    /// Creates a table from a list of known devices.
    pub fn new(entries: Vec<ScanChainDevice>) -> Self {
        Self { entries }
    }

    /// Returns a table where `host` entries shadow the entries of `self`.
    ///
    /// An IDCODE of zero terminates the host list, as in the JTAG init request.
    pub fn with_host_devices(&self, host: &[ScanChainDevice]) -> Self {
        let mut entries: Vec<ScanChainDevice> = host
            .iter()
            .take_while(|device| device.idcode.0 != 0)
            .copied()
            .collect();
        entries.extend(self.entries.iter().copied());
        Self { entries }
    }

    /// Looks up the IR length of the TAP with the given IDCODE.
    pub fn irlen(&self, idcode: IdCode) -> Option<u32> {
        self.entries
            .iter()
            .find(|device| device.idcode == idcode)
            .map(|device| device.irlen)
    }
}
