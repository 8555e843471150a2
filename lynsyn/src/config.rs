//! Probe configuration and the non-volatile key/value store.
//!
//! [`ProbeConfig`] is fixed when the probe is brought up. It selects the JTAG backend and holds
//! the limits of every retry loop. It can be loaded from YAML.
//!
//! [`ConfigStore`] models the small key/value store the probe keeps its hardware version and
//! calibration in.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::{
    architecture::arm::{DEFAULT_MAX_APS, DEFAULT_WAIT_RETRIES},
    calibration::CalibrationLimits,
    poll::PollBudgets,
    probe::TapTable,
    target::BreakpointSlots,
};

/// Keys are stored in 8 byte fields including a terminating zero.
pub const MAX_KEY_LEN: usize = 7;

/// Entries the store can hold.
pub const STORE_CAPACITY: usize = 31;

/// Errors of the configuration layer.
#[derive(Debug, thiserror::Error, docsplay::Display)]
pub enum ConfigError {
    /// The probe configuration could not be parsed.
    Yaml(#[from] serde_yaml::Error),

    /// The key '{0}' is longer than 7 bytes.
    KeyTooLong(String),

    /// The configuration store is full, it holds at most {0} entries.
    StoreFull(usize),
}

/// Which JTAG backend drives the target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// The MCU drives the JTAG pins itself.
    DirectBitBang,
    /// The FPGA sequence engine runs the sequences, reached over SPI.
    #[default]
    FpgaSequencer,
}

/// Configuration of the probe.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ProbeConfig {
    /// The JTAG backend.
    pub backend: BackendKind,
    /// How often a DP/AP transaction is attempted while the target answers WAIT.
    pub wait_retries: usize,
    /// Number of access ports scanned during discovery.
    pub max_access_ports: u8,
    /// Budgets of the polling loops.
    pub poll_budgets: PollBudgets,
    /// Comparators used for the breakpoint slots.
    pub breakpoints: BreakpointSlots,
    /// IR lengths of TAPs that may appear on the chain.
    pub known_taps: TapTable,
    /// Accepted calibration measurements.
    pub calibration: CalibrationLimits,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::default(),
            wait_retries: DEFAULT_WAIT_RETRIES,
            max_access_ports: DEFAULT_MAX_APS,
            poll_budgets: PollBudgets::default(),
            breakpoints: BreakpointSlots::default(),
            known_taps: TapTable::default(),
            calibration: CalibrationLimits::default(),
        }
    }
}

impl ProbeConfig {
    /// Parses a configuration from YAML. Missing fields take their default values.
    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        let config = serde_yaml::from_str(yaml)?;
        tracing::debug!("Loaded probe configuration: {:?}", config);
        Ok(config)
    }
}

/// The non-volatile key/value store.
///
/// Reads of missing keys yield `None`.
pub trait ConfigStore {
    /// Reads an integer.
    fn get_u32(&self, key: &str) -> Option<u32>;

    /// Reads a floating point value.
    fn get_f64(&self, key: &str) -> Option<f64>;

    /// Stores an integer, replacing any previous value of `key`.
    fn set_u32(&mut self, key: &str, value: u32) -> Result<(), ConfigError>;

    /// Stores a floating point value, replacing any previous value of `key`.
    fn set_f64(&mut self, key: &str, value: f64) -> Result<(), ConfigError>;

    /// Removes every entry.
    fn clear(&mut self) -> Result<(), ConfigError>;
}

impl<T: ConfigStore + ?Sized> ConfigStore for &mut T {
    fn get_u32(&self, key: &str) -> Option<u32> {
        (**self).get_u32(key)
    }

    fn get_f64(&self, key: &str) -> Option<f64> {
        (**self).get_f64(key)
    }

    fn set_u32(&mut self, key: &str, value: u32) -> Result<(), ConfigError> {
        (**self).set_u32(key, value)
    }

    fn set_f64(&mut self, key: &str, value: f64) -> Result<(), ConfigError> {
        (**self).set_f64(key, value)
    }

    fn clear(&mut self) -> Result<(), ConfigError> {
        (**self).clear()
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum StoredValue {
    U32(u32),
    F64(f64),
}

/// A [`ConfigStore`] held in RAM, with the same key and capacity limits as the flash store.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MemoryConfigStore {
    entries: BTreeMap<String, StoredValue>,
}

impl MemoryConfigStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the store is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn insert(&mut self, key: &str, value: StoredValue) -> Result<(), ConfigError> {
        if key.len() > MAX_KEY_LEN {
            return Err(ConfigError::KeyTooLong(key.to_owned()));
        }

        if !self.entries.contains_key(key) && self.entries.len() >= STORE_CAPACITY {
            tracing::warn!("Config store full, dropping '{}'", key);
            return Err(ConfigError::StoreFull(STORE_CAPACITY));
        }

        self.entries.insert(key.to_owned(), value);
        Ok(())
    }
}

impl ConfigStore for MemoryConfigStore {
    fn get_u32(&self, key: &str) -> Option<u32> {
        match self.entries.get(key)? {
            StoredValue::U32(value) => Some(*value),
            StoredValue::F64(_) => None,
        }
    }

    fn get_f64(&self, key: &str) -> Option<f64> {
        match self.entries.get(key)? {
            StoredValue::F64(value) => Some(*value),
            StoredValue::U32(_) => None,
        }
    }

    fn set_u32(&mut self, key: &str, value: u32) -> Result<(), ConfigError> {
        self.insert(key, StoredValue::U32(value))
    }

    fn set_f64(&mut self, key: &str, value: f64) -> Result<(), ConfigError> {
        self.insert(key, StoredValue::F64(value))
    }

    fn clear(&mut self) -> Result<(), ConfigError> {
        self.entries.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::probe::{IdCode, ScanChainDevice};

    #[test]
    fn empty_yaml_gives_defaults() {
        let config = ProbeConfig::from_yaml("{}").unwrap();

        assert_eq!(config, ProbeConfig::default());
        assert_eq!(config.wait_retries, 1024);
        assert_eq!(config.max_access_ports, 10);
    }

    #[test]
    fn yaml_overrides() {
        let config = ProbeConfig::from_yaml(
            r#"
backend: direct_bit_bang
wait_retries: 16
poll_budgets:
  power_up: 5
breakpoints:
  start: 3
known_taps:
  - idcode: 0x03727093
    irlen: 6
"#,
        )
        .unwrap();

        assert_eq!(config.backend, BackendKind::DirectBitBang);
        assert_eq!(config.wait_retries, 16);
        assert_eq!(config.poll_budgets.power_up, 5);
        assert_eq!(config.poll_budgets.resume, PollBudgets::default().resume);
        assert_eq!(config.breakpoints.start, 3);
        assert_eq!(config.breakpoints.stop, 1);
        assert_eq!(
            config.known_taps,
            TapTable::new(vec![ScanChainDevice {
                idcode: IdCode::from(0x0372_7093),
                irlen: 6,
            }])
        );
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let error = ProbeConfig::from_yaml("wait_retrys: 3").unwrap_err();
        assert!(matches!(error, ConfigError::Yaml(_)));
    }

    #[test]
    fn store_round_trip_and_types() {
        let mut store = MemoryConfigStore::new();
        store.set_u32("hwver", 0x22).unwrap();
        store.set_f64("gain3", 1.25).unwrap();

        assert_eq!(store.get_u32("hwver"), Some(0x22));
        assert_eq!(store.get_f64("gain3"), Some(1.25));
        assert_eq!(store.get_f64("hwver"), None);
        assert_eq!(store.get_u32("offset0"), None);
    }

    #[test]
    fn long_keys_are_rejected() {
        let mut store = MemoryConfigStore::new();

        let error = store.set_u32("hwversion", 1).unwrap_err();

        assert!(matches!(error, ConfigError::KeyTooLong(key) if key == "hwversion"));
        assert!(store.is_empty());
    }

    #[test]
    fn full_store_only_accepts_updates() {
        let mut store = MemoryConfigStore::new();
        for index in 0..STORE_CAPACITY {
            store.set_u32(&format!("k{index}"), 0).unwrap();
        }

        assert!(matches!(
            store.set_u32("extra", 1),
            Err(ConfigError::StoreFull(31))
        ));
        store.set_u32("k0", 7).unwrap();
        assert_eq!(store.get_u32("k0"), Some(7));

        store.clear().unwrap();
        assert!(store.is_empty());
    }
}
