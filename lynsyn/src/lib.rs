//! # Core of the Lynsyn power measurement probe
//!
//! The probe measures the current drawn by a board and correlates it with the program counters
//! of the ARM cores running on it. It reaches the cores over JTAG, either by driving the pins
//! itself or through the sequence engine in its FPGA, and talks to the host over USB.
//!
//! # Examples
//!
//! ## Discovering a target
//! ```no_run
//! use lynsyn::{
//!     config::ProbeConfig,
//!     probe::{JtagBackend, JtagMux, ScanChain},
//!     DebugTarget, Error, Target,
//! };
//!
//! fn show_pcs<B: JtagBackend + JtagMux>(chain: ScanChain<B>) -> Result<(), Error> {
//!     let config = ProbeConfig::default();
//!
//!     // Find the ARM debug port on the chain and the cores behind it.
//!     let mut target = Target::discover(chain, &config, &[])?;
//!
//!     // Read the program counter of every core without halting them.
//!     let sample = target.sample_pcs()?;
//!     println!("{:x?}", sample.pcs);
//!     Ok(())
//! }
//! ```
//!
//! The crate is built around the [probe::ScanChain], [target::Target],
//! [sampling::SamplingEngine] and [dispatch::Probe] structs.

pub mod architecture;
pub mod calibration;
pub mod config;
pub mod dispatch;
mod error;
pub mod poll;
pub mod probe;
pub mod protocol;
pub mod sampling;
pub mod target;
pub mod upgrade;

pub use crate::error::Error;
pub use crate::target::{Connector, DebugTarget, Target};
