//! Access to the debug address space behind a memory access port.

pub mod romtable;

pub use romtable::{DebugComponent, PeripheralId, RomTableError, RomTableWalker};

use super::DebugTransportError;

/// Word access to a debug bus.
///
/// Discovery and the core register files only need 32-bit accesses, so they are written against
/// this trait instead of a concrete access port.
pub trait DebugBus {
    /// Reads the word at `address`.
    fn read_word_32(&mut self, address: u64) -> Result<u32, DebugTransportError>;

    /// Writes `value` to the word at `address`.
    fn write_word_32(&mut self, address: u64, value: u32) -> Result<(), DebugTransportError>;
}

impl<T: DebugBus + ?Sized> DebugBus for &mut T {
    fn read_word_32(&mut self, address: u64) -> Result<u32, DebugTransportError> {
        (**self).read_word_32(address)
    }

    fn write_word_32(&mut self, address: u64, value: u32) -> Result<(), DebugTransportError> {
        (**self).write_word_32(address, value)
    }
}

#[cfg(test)]
pub(crate) mod mock {
    use std::collections::{BTreeMap, VecDeque};

    use super::DebugBus;
    use crate::architecture::arm::DebugTransportError;

    /// A bus access seen by [`MockBus`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum Access {
        Read(u64),
        Write(u64, u32),
    }

    /// A word-addressed memory map that logs every access.
    ///
    /// Addresses can be given a script of values. Each read pops the next value; the last one
    /// is returned for all further reads.
    #[derive(Debug, Default)]
    pub struct MockBus {
        memory: BTreeMap<u64, u32>,
        scripts: BTreeMap<u64, VecDeque<u32>>,
        log: Vec<Access>,
    }

    impl MockBus {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn set(&mut self, address: u64, value: u32) {
            self.memory.insert(address, value);
        }

        pub fn script(&mut self, address: u64, values: impl IntoIterator<Item = u32>) {
            self.scripts.insert(address, values.into_iter().collect());
        }

        pub fn get(&self, address: u64) -> u32 {
            self.memory.get(&address).copied().unwrap_or(0)
        }

        pub fn log(&self) -> &[Access] {
            &self.log
        }

        pub fn writes(&self) -> Vec<(u64, u32)> {
            self.log
                .iter()
                .filter_map(|access| match access {
                    Access::Write(address, value) => Some((*address, *value)),
                    Access::Read(_) => None,
                })
                .collect()
        }

        pub fn clear_log(&mut self) {
            self.log.clear();
        }
    }

    impl DebugBus for MockBus {
        fn read_word_32(&mut self, address: u64) -> Result<u32, DebugTransportError> {
            self.log.push(Access::Read(address));

            if let Some(script) = self.scripts.get_mut(&address) {
                if script.len() > 1 {
                    return Ok(script.pop_front().unwrap_or_default());
                }
                if let Some(value) = script.front() {
                    return Ok(*value);
                }
            }

            Ok(self.get(address))
        }

        fn write_word_32(&mut self, address: u64, value: u32) -> Result<(), DebugTransportError> {
            self.log.push(Access::Write(address, value));
            self.memory.insert(address, value);
            Ok(())
        }
    }
}
