//! JTAG transport.
//!
//! A [`JtagBackend`] clocks raw TMS/TDI sequences through the target's TAP controllers and
//! returns what it sampled on TDO. Two backends exist: [`BitBang`], which drives the JTAG pins
//! directly, and [`FpgaSequencer`], which hands sequences to the sequence engine in the probe's
//! FPGA over SPI. The backend is chosen once when the transport is built, [`Backend`] holds
//! whichever one the configuration selected.
//!
//! [`ScanChain`] sits on top of a backend and knows the layout of the chain: it pads IR and DR
//! scans with BYPASS bits for the devices that are not addressed and keeps track of the last
//! instruction written.

mod bitbang;
pub mod common;
#[cfg(any(test, feature = "test"))]
pub mod fake_chain;
pub mod program;
mod scan_chain;
mod sequencer;

use bitvec::prelude::*;

pub use bitbang::BitBang;
pub use common::{IdCode, ScanChainDevice, TapTable, MAX_JTAG_DEVICES};
pub use program::{ProgramCommand, ScanProgram};
pub use scan_chain::ScanChain;
pub use sequencer::{FpgaSequencer, SequencerStatus};

use crate::{config::BackendKind, poll::Timeout};

/// Bit buffer used for TDI, TMS and TDO data, first bit on the wire first.
pub type Bits = BitVec<u8, Lsb0>;

/// Errors of the JTAG transport.
#[derive(Debug, thiserror::Error, docsplay::Display)]
pub enum JtagError {
    /// No JTAG scan chain was found.
    NoChain,

    /// The scan chain did not terminate within {0} devices.
    ChainTooLong(usize),

    /// The IR length of the TAP with IDCODE {0} is unknown.
    UnknownIrLength(IdCode),

    /// The TAP with IDCODE {0} is not part of the scan chain.
    DeviceNotFound(IdCode),

    /// A JTAG pin could not be driven or sampled: {0:?}
    Pin(embedded_hal::digital::ErrorKind),

    /// An SPI transfer to the sequencer failed: {0:?}
    Spi(embedded_hal::spi::ErrorKind),

    /// The sequencer answered with magic number {0:#04x}.
    SequencerMagic(u8),

    /// A sequence of {bits} bits exceeds the backend limit of {limit} bits.
    SequenceTooLong { bits: usize, limit: usize },

    /// A scan program of {commands} commands exceeds the backend limit of {limit} commands.
    ProgramTooLong { commands: usize, limit: usize },

    /// No scan program has been stored.
    NoProgram,

    /// Scan program command {command} was acknowledged with {ack:#05b}.
    ProgramFault { command: usize, ack: u8 },

    /// Scan program command {command} was still answered with WAIT after {attempts} attempts.
    ProgramWaitLimit { command: usize, attempts: usize },

    /// {0}
    Timeout(#[from] Timeout),
}

/// A TMS/TDI sequence, one entry per TCK cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JtagSequence {
    tdi: Bits,
    tms: Bits,
}

impl JtagSequence {
    /// Creates an empty sequence.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of TCK cycles in the sequence.
    pub fn len(&self) -> usize {
        self.tdi.len()
    }

    /// Whether the sequence has no cycles.
    pub fn is_empty(&self) -> bool {
        self.tdi.is_empty()
    }

    /// TDI values, one per cycle.
    pub fn tdi(&self) -> &BitSlice<u8> {
        &self.tdi
    }

    /// TMS values, one per cycle.
    pub fn tms(&self) -> &BitSlice<u8> {
        &self.tms
    }

    /// Appends a single cycle.
    pub fn push(&mut self, tdi: bool, tms: bool) {
        self.tdi.push(tdi);
        self.tms.push(tms);
    }

    /// Walks the TAP state machine with `len` TMS bits taken from `tms`, least significant first.
    pub fn tms_path(&mut self, tms: u8, len: usize) {
        for bit in 0..len {
            self.push(false, tms & (1 << bit) != 0);
        }
    }

    /// Shifts the lowest `len` bits of `value`, least significant first.
    ///
    /// With `exit` set, TMS is raised on the final bit so the TAP leaves the shift state.
    pub fn shift_value(&mut self, value: u64, len: usize, exit: bool) {
        for bit in 0..len {
            let tdi = bit < 64 && value & (1u64 << bit) != 0;
            self.push(tdi, exit && bit + 1 == len);
        }
    }

    /// Shifts `len` copies of `tdi`, raising TMS on the final bit when `exit` is set.
    pub fn shift_repeated(&mut self, tdi: bool, len: usize, exit: bool) {
        for bit in 0..len {
            self.push(tdi, exit && bit + 1 == len);
        }
    }

    /// Shifts `bits`, raising TMS on the final bit when `exit` is set.
    pub fn shift_bits(&mut self, bits: &BitSlice<u8>, exit: bool) {
        let len = bits.len();
        for (index, bit) in bits.iter().by_vals().enumerate() {
            self.push(bit, exit && index + 1 == len);
        }
    }

    /// Copies the cycles in `range` into a new sequence.
    pub fn slice(&self, range: std::ops::Range<usize>) -> JtagSequence {
        JtagSequence {
            tdi: self.tdi[range.clone()].to_bitvec(),
            tms: self.tms[range].to_bitvec(),
        }
    }
}

/// Drives TMS/TDI sequences through the scan chain.
pub trait JtagBackend {
    /// Clocks out `sequence`, discarding TDO.
    fn write_sequence(&mut self, sequence: &JtagSequence) -> Result<(), JtagError>;

    /// Clocks out `sequence` and returns TDO as sampled on every cycle.
    fn read_write_sequence(&mut self, sequence: &JtagSequence) -> Result<Bits, JtagError>;

    /// Stores a program that is executed repeatedly with [`JtagBackend::execute_program`].
    fn store_program(&mut self, program: ScanProgram) -> Result<(), JtagError>;

    /// Runs the stored program and returns the words captured by its reading commands.
    fn execute_program(&mut self) -> Result<Vec<u32>, JtagError>;
}

impl<T: JtagBackend + ?Sized> JtagBackend for &mut T {
    fn write_sequence(&mut self, sequence: &JtagSequence) -> Result<(), JtagError> {
        (**self).write_sequence(sequence)
    }

    fn read_write_sequence(&mut self, sequence: &JtagSequence) -> Result<Bits, JtagError> {
        (**self).read_write_sequence(sequence)
    }

    fn store_program(&mut self, program: ScanProgram) -> Result<(), JtagError> {
        (**self).store_program(program)
    }

    fn execute_program(&mut self) -> Result<Vec<u32>, JtagError> {
        (**self).execute_program()
    }
}

/// Which side drives the target's JTAG port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JtagMuxSelect {
    /// The external debugger connector is routed to the target.
    External,
    /// The probe drives the target.
    Internal,
}

/// Control over the multiplexer that shares the target's JTAG port with an external debugger.
pub trait JtagMux {
    /// Routes the target's JTAG port.
    fn select(&mut self, select: JtagMuxSelect) -> Result<(), JtagError>;
}

impl<T: JtagMux + ?Sized> JtagMux for &mut T {
    fn select(&mut self, select: JtagMuxSelect) -> Result<(), JtagError> {
        (**self).select(select)
    }
}

/// The backend selected by [`BackendKind`].
#[derive(Debug)]
pub enum Backend<D, F> {
    /// The MCU drives the JTAG pins, usually a [`BitBang`].
    DirectBitBang(D),
    /// The FPGA runs the sequences, usually a [`FpgaSequencer`].
    FpgaSequencer(F),
}

impl<D, F> Backend<D, F> {
    /// Which kind of backend this is.
    pub fn kind(&self) -> BackendKind {
        match self {
            Backend::DirectBitBang(_) => BackendKind::DirectBitBang,
            Backend::FpgaSequencer(_) => BackendKind::FpgaSequencer,
        }
    }
}

impl<D: JtagBackend, F: JtagBackend> JtagBackend for Backend<D, F> {
    fn write_sequence(&mut self, sequence: &JtagSequence) -> Result<(), JtagError> {
        match self {
            Backend::DirectBitBang(backend) => backend.write_sequence(sequence),
            Backend::FpgaSequencer(backend) => backend.write_sequence(sequence),
        }
    }

    fn read_write_sequence(&mut self, sequence: &JtagSequence) -> Result<Bits, JtagError> {
        match self {
            Backend::DirectBitBang(backend) => backend.read_write_sequence(sequence),
            Backend::FpgaSequencer(backend) => backend.read_write_sequence(sequence),
        }
    }

    fn store_program(&mut self, program: ScanProgram) -> Result<(), JtagError> {
        match self {
            Backend::DirectBitBang(backend) => backend.store_program(program),
            Backend::FpgaSequencer(backend) => backend.store_program(program),
        }
    }

    fn execute_program(&mut self) -> Result<Vec<u32>, JtagError> {
        match self {
            Backend::DirectBitBang(backend) => backend.execute_program(),
            Backend::FpgaSequencer(backend) => backend.execute_program(),
        }
    }
}

impl<D: JtagMux, F: JtagMux> JtagMux for Backend<D, F> {
    fn select(&mut self, select: JtagMuxSelect) -> Result<(), JtagError> {
        match self {
            Backend::DirectBitBang(backend) => backend.select(select),
            Backend::FpgaSequencer(backend) => backend.select(select),
        }
    }
}
