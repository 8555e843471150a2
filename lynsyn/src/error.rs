use crate::{
    architecture::arm::{core::CoreError, memory::RomTableError, DebugTransportError},
    calibration::CalibrationError,
    config::ConfigError,
    poll::Timeout,
    probe::JtagError,
    protocol::PacketError,
    sampling::SamplingError,
    upgrade::UpgradeError,
};

/// The overarching error type of the probe.
#[derive(Debug, thiserror::Error, docsplay::Display)]
pub enum Error {
    /// JTAG transport error
    Jtag(#[from] JtagError),

    /// Debug transport error
    DebugTransport(#[from] DebugTransportError),

    /// ROM table error
    RomTable(#[from] RomTableError),

    /// Core error
    Core(#[from] CoreError),

    /// Sampling error
    Sampling(#[from] SamplingError),

    /// Calibration error
    Calibration(#[from] CalibrationError),

    /// Configuration error
    Config(#[from] ConfigError),

    /// Malformed packet
    Packet(#[from] PacketError),

    /// Firmware upgrade error
    Upgrade(#[from] UpgradeError),

    /// {0}
    Timeout(#[from] Timeout),

    /// No ARM debug port was found on the scan chain.
    DapNotFound,

    /// No supported core was found behind the debug port.
    NoCores,

    /// The target has not been initialized, send JTAG_INIT first.
    NotInitialized,
}
