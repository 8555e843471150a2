//! CoreSight ROM table discovery.

use std::collections::BTreeSet;

use enum_primitive_derive::Primitive;
use num_traits::cast::FromPrimitive;

use super::DebugBus;
use crate::architecture::arm::{core::CoreType, DebugTransportError};

/// A ROM table has at most this many entries before the component identification block.
const MAX_ROM_TABLE_ENTRIES: u32 = 960;

/// An error to report any errors that are romtable discovery specific.
#[derive(Debug, thiserror::Error, docsplay::Display)]
pub enum RomTableError {
    /// Could not access the ROM table
    Memory(#[from] DebugTransportError),

    /// The ROM table at {0:#010x} has no terminating entry.
    Unterminated(u32),
}

/// This enum describes the class of a CoreSight component, as read from CIDR1.
#[derive(Primitive, Debug, Clone, Copy, PartialEq, Eq)]
enum RawComponent {
    GenericVerificationComponent = 0,
    RomTable = 1,
    CoreSightComponent = 9,
    PeripheralTestBlock = 0xB,
    GenericIPComponent = 0xE,
    CoreLinkOrPrimeCellOrSystemComponent = 0xF,
}

/// Peripheral ID of a CoreSight component, as the low bytes of PIDR0, PIDR1, PIDR2 and PIDR4.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeripheralId {
    raw: [u8; 4],
}

impl PeripheralId {
    /// Builds the ID from the PIDR0, PIDR1, PIDR2 and PIDR4 register values.
    pub fn from_registers(pidr0: u32, pidr1: u32, pidr2: u32, pidr4: u32) -> Self {
        Self {
            raw: [pidr0 as u8, pidr1 as u8, pidr2 as u8, pidr4 as u8],
        }
    }

    /// The part number of the component.
    pub fn part(&self) -> u16 {
        u16::from(self.raw[1] & 0x0F) << 8 | u16::from(self.raw[0])
    }

    /// The JEP106 code of the designer, if it is given in JEP106 format.
    pub fn jep106(&self) -> Option<jep106::JEP106Code> {
        let legacy = self.raw[2] & 0x8 == 0;
        if legacy {
            return None;
        }

        let id = (self.raw[2] & 0x07) << 4 | (self.raw[1] >> 4) & 0x0F;
        Some(jep106::JEP106Code::new(self.raw[3] & 0x0F, id))
    }

    /// The core whose debug registers this component holds, if it is one the probe supports.
    pub fn core_type(&self) -> Option<CoreType> {
        let [pidr0, pidr1, pidr2, pidr4] = self.raw;

        match (pidr0, pidr1, pidr2 & 0x0F, pidr4 & 0x0F) {
            (0x09, 0xBC, 0xB, 0x4) => Some(CoreType::CortexA9),
            (0x03, 0xBD, 0xB, 0x4) => Some(CoreType::CortexA53),
            (0x07, 0xBD, 0xB, 0x4) => Some(CoreType::CortexA57),
            _ => None,
        }
    }
}

/// A debug component found in a ROM table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DebugComponent {
    /// Base address of the component.
    pub address: u32,
    /// The component's peripheral ID.
    pub peripheral_id: PeripheralId,
}

/// Walks a tree of ROM tables.
///
/// Nested tables are kept on an explicit stack, so arbitrarily deep trees don't grow the call
/// stack. Components are reported in the order a depth-first walk reaches them. Tables that were
/// visited already are skipped, which also breaks reference loops.
#[derive(Debug)]
pub struct RomTableWalker<'a, M: DebugBus> {
    memory: &'a mut M,
    visited: BTreeSet<u32>,
    pending: Vec<u32>,
}

impl<'a, M: DebugBus> RomTableWalker<'a, M> {
    /// Creates a walker reading through `memory`.
    pub fn new(memory: &'a mut M) -> Self {
        Self {
            memory,
            visited: BTreeSet::new(),
            pending: Vec::new(),
        }
    }

    /// Walks the tree below `base` and returns the debug components found in it.
    #[tracing::instrument(skip(self))]
    pub fn walk(mut self, base: u32) -> Result<Vec<DebugComponent>, RomTableError> {
        let mut components = Vec::new();
        self.pending.push(base);

        while let Some(address) = self.pending.pop() {
            if !self.visited.insert(address) {
                tracing::warn!("Component at {:#010x} was already visited", address);
                continue;
            }

            match self.component_class(address)? {
                Some(RawComponent::RomTable) => {
                    let entries = self.rom_table_entries(address)?;
                    // Reversed, so the first entry is walked first.
                    self.pending.extend(entries.into_iter().rev());
                }
                Some(RawComponent::CoreSightComponent) => {
                    let peripheral_id = self.peripheral_id(address)?;
                    tracing::debug!(
                        "Debug component at {:#010x}: part {:#05x}",
                        address,
                        peripheral_id.part()
                    );
                    components.push(DebugComponent {
                        address,
                        peripheral_id,
                    });
                }
                class => {
                    tracing::trace!("Skipping component {:?} at {:#010x}", class, address);
                }
            }
        }

        Ok(components)
    }

    fn component_class(&mut self, address: u32) -> Result<Option<RawComponent>, RomTableError> {
        let cidr1 = self.memory.read_word_32(u64::from(address) + 0xFF4)?;
        Ok(RawComponent::from_u32((cidr1 >> 4) & 0x0F))
    }

    /// Reads the present entries of the ROM table at `base` and returns the addresses they point
    /// to.
    fn rom_table_entries(&mut self, base: u32) -> Result<Vec<u32>, RomTableError> {
        let mut addresses = Vec::new();

        for index in 0..MAX_ROM_TABLE_ENTRIES {
            let entry = self.memory.read_word_32(u64::from(base.wrapping_add(4 * index)))?;

            // End of entries is marked by an all zero entry
            if entry == 0 {
                return Ok(addresses);
            }

            if entry & 1 != 0 {
                // The offset is signed, components may sit below the table.
                addresses.push(base.wrapping_add(entry & 0xFFFF_F000));
            }
        }

        Err(RomTableError::Unterminated(base))
    }

    fn peripheral_id(&mut self, base: u32) -> Result<PeripheralId, RomTableError> {
        let base = u64::from(base);

        let pidr0 = self.memory.read_word_32(base + 0xFE0)?;
        let pidr1 = self.memory.read_word_32(base + 0xFE4)?;
        let pidr2 = self.memory.read_word_32(base + 0xFE8)?;
        let pidr4 = self.memory.read_word_32(base + 0xFD0)?;

        Ok(PeripheralId::from_registers(pidr0, pidr1, pidr2, pidr4))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use test_case::test_case;

    use super::*;
    use crate::architecture::arm::memory::mock::MockBus;

    pub(crate) fn rom_table(bus: &mut MockBus, base: u32, entries: &[u32]) {
        bus.set(u64::from(base) + 0xFF4, 0x10);
        for (index, entry) in entries.iter().enumerate() {
            bus.set(u64::from(base) + 4 * index as u64, *entry);
        }
    }

    pub(crate) fn debug_component(bus: &mut MockBus, base: u32, pidr: [u32; 4]) {
        let base = u64::from(base);
        bus.set(base + 0xFF4, 0x90);
        bus.set(base + 0xFE0, pidr[0]);
        bus.set(base + 0xFE4, pidr[1]);
        bus.set(base + 0xFE8, pidr[2]);
        bus.set(base + 0xFD0, pidr[3]);
    }

    pub(crate) const CORTEX_A9_PIDR: [u32; 4] = [0x09, 0xBC, 0x3B, 0x04];
    pub(crate) const CORTEX_A53_PIDR: [u32; 4] = [0x03, 0xBD, 0x4B, 0x04];

    #[test_case([0x09, 0xBC, 0x3B, 0x04] => Some(CoreType::CortexA9); "cortex a9")]
    #[test_case([0x03, 0xBD, 0x4B, 0x04] => Some(CoreType::CortexA53); "cortex a53")]
    #[test_case([0x07, 0xBD, 0x0B, 0x04] => Some(CoreType::CortexA57); "cortex a57")]
    #[test_case([0x15, 0xBC, 0x0B, 0x04] => None; "cortex r5")]
    #[test_case([0x06, 0xB9, 0x0B, 0x04] => None; "cti")]
    fn classify_peripheral(pidr: [u32; 4]) -> Option<CoreType> {
        PeripheralId::from_registers(pidr[0], pidr[1], pidr[2], pidr[3]).core_type()
    }

    #[test]
    fn arm_designed_component() {
        let id = PeripheralId::from_registers(0x09, 0xBC, 0x3B, 0x04);

        pretty_assertions::assert_eq!(id.part(), 0xC09);
        pretty_assertions::assert_eq!(id.jep106(), Some(jep106::JEP106Code::new(4, 0x3B)));
    }

    #[test]
    fn walks_nested_tables_depth_first() {
        let mut bus = MockBus::new();
        rom_table(&mut bus, 0x8000_0000, &[0x0001_0003, 0x0010_0003, 0x0002_0003, 0]);
        rom_table(&mut bus, 0x8010_0000, &[0x0001_0003, 0]);
        debug_component(&mut bus, 0x8001_0000, CORTEX_A9_PIDR);
        debug_component(&mut bus, 0x8011_0000, CORTEX_A9_PIDR);
        debug_component(&mut bus, 0x8002_0000, CORTEX_A53_PIDR);

        let components = RomTableWalker::new(&mut bus).walk(0x8000_0000).unwrap();

        let addresses: Vec<u32> = components.iter().map(|c| c.address).collect();
        pretty_assertions::assert_eq!(addresses, vec![0x8001_0000, 0x8011_0000, 0x8002_0000]);
    }

    #[test]
    fn skips_absent_entries() {
        let mut bus = MockBus::new();
        rom_table(&mut bus, 0x8000_0000, &[0x0001_0002, 0x0002_0003, 0]);
        debug_component(&mut bus, 0x8001_0000, CORTEX_A9_PIDR);
        debug_component(&mut bus, 0x8002_0000, CORTEX_A9_PIDR);

        let components = RomTableWalker::new(&mut bus).walk(0x8000_0000).unwrap();

        pretty_assertions::assert_eq!(components.len(), 1);
        pretty_assertions::assert_eq!(components[0].address, 0x8002_0000);
    }

    #[test]
    fn negative_offsets_wrap() {
        let mut bus = MockBus::new();
        rom_table(&mut bus, 0x8010_0000, &[0xFFF0_0003, 0]);
        debug_component(&mut bus, 0x8000_0000, CORTEX_A53_PIDR);

        let components = RomTableWalker::new(&mut bus).walk(0x8010_0000).unwrap();

        pretty_assertions::assert_eq!(components[0].address, 0x8000_0000);
    }

    #[test]
    fn self_reference_terminates() {
        let mut bus = MockBus::new();
        rom_table(&mut bus, 0x8000_0000, &[0x0000_0003, 0x0001_0003, 0]);
        debug_component(&mut bus, 0x8001_0000, CORTEX_A9_PIDR);

        let components = RomTableWalker::new(&mut bus).walk(0x8000_0000).unwrap();

        pretty_assertions::assert_eq!(components.len(), 1);
    }

    #[test]
    fn unterminated_table_is_an_error() {
        let mut bus = MockBus::new();
        bus.set(0x8000_0FF4, 0x10);
        for index in 0..MAX_ROM_TABLE_ENTRIES {
            // Present bit clear, so nothing is followed.
            bus.set(0x8000_0000 + 4 * u64::from(index), 0x0000_1002);
        }

        let error = RomTableWalker::new(&mut bus).walk(0x8000_0000).unwrap_err();

        assert!(matches!(error, RomTableError::Unterminated(0x8000_0000)));
    }
}
