//! The JTAG sequence engine in the probe's FPGA.
//!
//! The microcontroller talks to the FPGA over SPI. Every command is a single chip-select
//! transaction starting with the command byte; the byte clocked back during the command byte is
//! the sequencer status. TDI/TMS data is sent as interleaved byte pairs, first bit in the least
//! significant position.
//!
//! ```text
//! STATUS       cmd 0
//! WR_SEQ       cmd size (tdi tms)* 0
//! RDWR_SEQ     cmd size (tdi tms)* 0
//! GET_DATA     cmd 0* ff                   returns TDO bytes
//! STORE_SEQ    cmd size_lo size_hi (tdi tms)* 0
//! STORE_PROG   cmd count (read init loop ack end)* 0
//! ```

use embedded_hal::spi::{Error as _, SpiDevice};

use crate::{
    poll::poll_until,
    probe::{
        common::bits_to_word, Bits, JtagBackend, JtagError, JtagMux, JtagMuxSelect,
        JtagSequence, ScanProgram,
    },
};

const SPI_CMD_STATUS: u8 = 0;
const SPI_CMD_MAGIC: u8 = 1;
const SPI_CMD_JTAG_SEL: u8 = 2;
const SPI_CMD_WR_SEQ: u8 = 3;
const SPI_CMD_RDWR_SEQ: u8 = 4;
const SPI_CMD_GET_DATA: u8 = 5;
const SPI_CMD_STORE_SEQ: u8 = 6;
const SPI_CMD_STORE_PROG: u8 = 7;
const SPI_CMD_EXECUTE_SEQ: u8 = 8;
const SPI_CMD_JTAG_TEST: u8 = 9;
const SPI_CMD_OSC_TEST: u8 = 10;

const JTAG_SEL_EXT: u8 = 0;
const JTAG_SEL_INT: u8 = 1;
const JTAG_SEL_TEST: u8 = 2;

/// The value the sequencer answers MAGIC with.
pub const SEQUENCER_MAGIC: u8 = 0xad;

/// Both the "idle" and "data ready" status bits.
const STATUS_READY: u8 = 0b11;

/// The oscillator test passes when all four clock domains report activity.
const OSC_TEST_OK: u8 = 0xf;

/// Bits per WR_SEQ/RDWR_SEQ command. The size field is a single byte, and chunks are kept at
/// byte boundaries.
const MAX_SHORT_SEQUENCE_BITS: usize = 248;

/// Bytes of TDI (and of TMS) the sequencer can store.
const MAX_STORED_SEQUENCE_BYTES: usize = 2048;

/// Commands the sequencer can store.
const MAX_STORED_COMMANDS: usize = 63;

/// Result of bringing up the FPGA, as reported to the host by the SPI self test.
#[derive(Debug, Clone, Copy, PartialEq, Eq, enum_primitive_derive::Primitive)]
pub enum SequencerStatus {
    /// The sequencer answered with the right magic number.
    InitOk = 0,
    /// The FPGA did not finish configuration.
    ConfigureFailed = 1,
    /// The sequencer did not answer over SPI.
    SpiFailed = 2,
}

fn spi_error(error: impl embedded_hal::spi::Error) -> JtagError {
    JtagError::Spi(error.kind())
}

/// Packs TDI and TMS into interleaved byte pairs.
fn interleave(sequence: &JtagSequence, out: &mut Vec<u8>) {
    for (tdi, tms) in sequence.tdi().chunks(8).zip(sequence.tms().chunks(8)) {
        out.push(bits_to_word(tdi) as u8);
        out.push(bits_to_word(tms) as u8);
    }
}

/// A [`JtagBackend`] that hands sequences to the FPGA sequencer.
#[derive(Debug)]
pub struct FpgaSequencer<SPI> {
    spi: SPI,
    status_budget: u32,
    status: SequencerStatus,
    program: Option<ScanProgram>,
}

impl<SPI: SpiDevice> FpgaSequencer<SPI> {
    /// Creates a backend on `spi`. Status polls give up after `status_budget` reads.
    pub fn new(spi: SPI, status_budget: u32) -> Self {
        Self {
            spi,
            status_budget,
            status: SequencerStatus::SpiFailed,
            program: None,
        }
    }

    /// Result of the last [`FpgaSequencer::init`].
    pub fn status(&self) -> SequencerStatus {
        self.status
    }

    /// Checks that the sequencer answers and hands the JTAG port to the external connector.
    #[tracing::instrument(skip(self))]
    pub fn init(&mut self) -> Result<(), JtagError> {
        let magic = self.read_magic()?;
        if magic != SEQUENCER_MAGIC {
            tracing::warn!("Got incorrect FPGA magic number {:#04x}", magic);
            self.status = SequencerStatus::SpiFailed;
            return Err(JtagError::SequencerMagic(magic));
        }

        self.status = SequencerStatus::InitOk;
        self.select(JtagMuxSelect::External)
    }

    /// Runs one command transaction. `buffer` holds the command byte and its payload and is
    /// overwritten with the bytes clocked back.
    fn command(&mut self, buffer: &mut [u8]) -> Result<(), JtagError> {
        self.spi.transfer_in_place(buffer).map_err(spi_error)
    }

    fn query(&mut self, command: u8, argument: u8) -> Result<u8, JtagError> {
        let mut buffer = [command, argument];
        self.command(&mut buffer)?;
        Ok(buffer[1])
    }

    /// Reads the status register.
    pub fn read_status(&mut self) -> Result<u8, JtagError> {
        self.query(SPI_CMD_STATUS, 0)
    }

    /// Reads the magic number.
    pub fn read_magic(&mut self) -> Result<u8, JtagError> {
        self.query(SPI_CMD_MAGIC, 0)
    }

    fn wait_ready(&mut self) -> Result<(), JtagError> {
        let budget = self.status_budget;
        poll_until("sequencer status", budget, || {
            Ok::<_, JtagError>((self.read_status()? & STATUS_READY == STATUS_READY).then_some(()))
        })
    }

    /// Loops a test pattern back through the JTAG multiplexer.
    ///
    /// Returns a mask of the bits among 0x01, 0x02, 0x04, 0x08 and 0x10 that did not come back.
    /// The multiplexer is left in test mode.
    pub fn jtag_test(&mut self) -> Result<u8, JtagError> {
        let mut failed = 0;
        for pattern in [0x01u8, 0x02, 0x04, 0x08, 0x10] {
            self.query(SPI_CMD_JTAG_SEL, JTAG_SEL_TEST | pattern << 2)?;
            if self.query(SPI_CMD_JTAG_TEST, 0)? != pattern {
                failed |= pattern;
            }
        }
        Ok(failed)
    }

    /// Checks that the FPGA oscillators run.
    pub fn osc_test(&mut self) -> Result<bool, JtagError> {
        Ok(self.query(SPI_CMD_OSC_TEST, 0)? == OSC_TEST_OK)
    }

    fn send_short(&mut self, command: u8, sequence: &JtagSequence) -> Result<(), JtagError> {
        let mut buffer = Vec::with_capacity(3 + 2 * sequence.len().div_ceil(8));
        buffer.push(command);
        buffer.push(sequence.len() as u8);
        interleave(sequence, &mut buffer);
        buffer.push(0);
        self.command(&mut buffer)
    }

    /// Fetches `bits` captured TDO bits.
    fn get_data(&mut self, bits: usize) -> Result<Bits, JtagError> {
        let bytes = bits.div_ceil(8);
        if bytes == 0 {
            return Ok(Bits::new());
        }

        self.wait_ready()?;

        let mut buffer = vec![0; bytes + 1];
        buffer[0] = SPI_CMD_GET_DATA;
        buffer[bytes] = 0xff;
        self.command(&mut buffer)?;

        // The final partial byte is shifted in from the top.
        let partial = bits % 8;
        if partial != 0 {
            buffer[bytes] >>= 8 - partial;
        }

        let mut tdo = Bits::from_vec(buffer.split_off(1));
        tdo.truncate(bits);
        Ok(tdo)
    }

    fn chunks(sequence: &JtagSequence) -> impl Iterator<Item = JtagSequence> + '_ {
        (0..sequence.len())
            .step_by(MAX_SHORT_SEQUENCE_BITS)
            .map(move |start| {
                let end = (start + MAX_SHORT_SEQUENCE_BITS).min(sequence.len());
                sequence.slice(start..end)
            })
    }
}

impl<SPI: SpiDevice> JtagBackend for FpgaSequencer<SPI> {
    fn write_sequence(&mut self, sequence: &JtagSequence) -> Result<(), JtagError> {
        for chunk in Self::chunks(sequence) {
            self.send_short(SPI_CMD_WR_SEQ, &chunk)?;
        }
        Ok(())
    }

    fn read_write_sequence(&mut self, sequence: &JtagSequence) -> Result<Bits, JtagError> {
        let mut tdo = Bits::with_capacity(sequence.len());
        for chunk in Self::chunks(sequence) {
            self.send_short(SPI_CMD_RDWR_SEQ, &chunk)?;
            tdo.extend_from_bitslice(&self.get_data(chunk.len())?);
        }
        Ok(tdo)
    }

    #[tracing::instrument(skip_all)]
    fn store_program(&mut self, program: ScanProgram) -> Result<(), JtagError> {
        let sequence = program.sequence();
        let bytes = sequence.len().div_ceil(8);
        if bytes > MAX_STORED_SEQUENCE_BYTES {
            return Err(JtagError::SequenceTooLong {
                bits: sequence.len(),
                limit: MAX_STORED_SEQUENCE_BYTES * 8,
            });
        }
        let commands = program.commands();
        if commands.len() > MAX_STORED_COMMANDS {
            return Err(JtagError::ProgramTooLong {
                commands: commands.len(),
                limit: MAX_STORED_COMMANDS,
            });
        }

        let size = (bytes * 2) as u16;
        let mut buffer = Vec::with_capacity(4 + 2 * bytes);
        buffer.push(SPI_CMD_STORE_SEQ);
        buffer.extend_from_slice(&size.to_le_bytes());
        interleave(sequence, &mut buffer);
        buffer.push(0);
        self.command(&mut buffer)?;

        let mut buffer = Vec::with_capacity(3 + 9 * commands.len());
        buffer.push(SPI_CMD_STORE_PROG);
        buffer.push(commands.len() as u8);
        for command in commands {
            buffer.push(command.read as u8);
            for position in [command.init, command.repeat, command.ack, command.end] {
                buffer.extend_from_slice(&(position as u16).to_le_bytes());
            }
        }
        buffer.push(0);
        self.command(&mut buffer)?;

        tracing::debug!(
            "Stored {} commands over {} bits",
            commands.len(),
            sequence.len()
        );

        self.program = Some(program);
        Ok(())
    }

    fn execute_program(&mut self) -> Result<Vec<u32>, JtagError> {
        let bits = self
            .program
            .as_ref()
            .map(ScanProgram::captured_bits)
            .ok_or(JtagError::NoProgram)?;

        self.query(SPI_CMD_EXECUTE_SEQ, 0)?;
        let capture = self.get_data(bits)?;

        match &self.program {
            Some(program) => program.parse_capture(&capture),
            None => Err(JtagError::NoProgram),
        }
    }
}

impl<SPI: SpiDevice> JtagMux for FpgaSequencer<SPI> {
    fn select(&mut self, select: JtagMuxSelect) -> Result<(), JtagError> {
        let value = match select {
            JtagMuxSelect::External => JTAG_SEL_EXT,
            JtagMuxSelect::Internal => JTAG_SEL_INT,
        };
        self.query(SPI_CMD_JTAG_SEL, value).map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use std::convert::Infallible;

    use bitvec::prelude::*;
    use embedded_hal::spi::{ErrorType, Operation};

    use super::*;
    use crate::probe::{
        fake_chain::{FakeChain, FakeDap, FakeDevice},
        program::JTAG_STATUS_OK,
        IdCode, ProgramCommand, ScanChain, ScanChainDevice, TapTable,
    };

    /// Decodes sequencer commands and runs them on a simulated chain.
    struct FakeSequencer {
        chain: FakeChain,
        magic: u8,
        busy_polls: usize,
        tdo: Bits,
        stored: JtagSequence,
        commands: Vec<ProgramCommand>,
        mux: Option<u8>,
        loopback: u8,
        log: Vec<u8>,
    }

    impl FakeSequencer {
        fn new(chain: FakeChain) -> Self {
            Self {
                chain,
                magic: SEQUENCER_MAGIC,
                busy_polls: 0,
                tdo: Bits::new(),
                stored: JtagSequence::new(),
                commands: Vec::new(),
                mux: None,
                loopback: 0,
                log: Vec::new(),
            }
        }

        fn decode_pairs(pairs: &[u8], bits: usize) -> JtagSequence {
            let mut sequence = JtagSequence::new();
            for bit in 0..bits {
                let tdi = pairs[2 * (bit / 8)] >> (bit % 8) & 1 != 0;
                let tms = pairs[2 * (bit / 8) + 1] >> (bit % 8) & 1 != 0;
                sequence.push(tdi, tms);
            }
            sequence
        }

        fn handle(&mut self, buffer: &mut [u8]) {
            let command = buffer[0];
            self.log.push(command);
            buffer[0] = STATUS_READY;

            match command {
                SPI_CMD_STATUS => {
                    buffer[1] = if self.busy_polls > 0 {
                        self.busy_polls -= 1;
                        0
                    } else {
                        STATUS_READY
                    };
                }
                SPI_CMD_MAGIC => buffer[1] = self.magic,
                SPI_CMD_JTAG_SEL => {
                    self.mux = Some(buffer[1]);
                    if buffer[1] & 0b11 == JTAG_SEL_TEST {
                        self.loopback = buffer[1] >> 2;
                    }
                }
                SPI_CMD_JTAG_TEST => buffer[1] = self.loopback & 0x1b,
                SPI_CMD_OSC_TEST => buffer[1] = OSC_TEST_OK,
                SPI_CMD_WR_SEQ | SPI_CMD_RDWR_SEQ => {
                    let bits = buffer[1] as usize;
                    let sequence = Self::decode_pairs(&buffer[2..], bits);
                    self.tdo = self.chain.read_write_sequence(&sequence).unwrap();
                }
                SPI_CMD_GET_DATA => {
                    let bytes = self.tdo.len().div_ceil(8);
                    let partial = self.tdo.len() % 8;
                    self.tdo.resize(bytes * 8, false);
                    let mut data = self.tdo.as_raw_slice().to_vec();
                    if partial != 0 {
                        data[bytes - 1] <<= 8 - partial;
                    }
                    buffer[1..=bytes].copy_from_slice(&data);
                }
                SPI_CMD_STORE_SEQ => {
                    let size = u16::from_le_bytes([buffer[1], buffer[2]]) as usize;
                    self.stored = Self::decode_pairs(&buffer[3..], size / 2 * 8);
                }
                SPI_CMD_STORE_PROG => {
                    let count = buffer[1] as usize;
                    self.commands = buffer[2..2 + 9 * count]
                        .chunks(9)
                        .map(|c| {
                            let word = |i: usize| u16::from_le_bytes([c[i], c[i + 1]]) as usize;
                            ProgramCommand {
                                read: c[0] != 0,
                                init: word(1),
                                repeat: word(3),
                                ack: word(5),
                                end: word(7),
                            }
                        })
                        .collect();
                }
                SPI_CMD_EXECUTE_SEQ => {
                    let mut program = ScanProgram::new(1024);
                    *program.sequence_mut() = self.stored.clone();
                    for command in &self.commands {
                        program.push_command(*command);
                    }
                    let mut words = program.replay(&mut self.chain).unwrap().into_iter();

                    self.tdo = Bits::new();
                    for command in &self.commands {
                        if command.read {
                            let mut word = bitvec![u8, Lsb0; 0; 32];
                            word.store_le(words.next().unwrap());
                            self.tdo.extend_from_bitslice(&word);
                        }
                        let mut ack = bitvec![u8, Lsb0; 0; 3];
                        ack.store_le(JTAG_STATUS_OK);
                        self.tdo.extend_from_bitslice(&ack);
                    }
                }
                other => panic!("unexpected command {other}"),
            }
        }
    }

    impl ErrorType for FakeSequencer {
        type Error = Infallible;
    }

    impl SpiDevice for FakeSequencer {
        fn transaction(&mut self, operations: &mut [Operation<'_, u8>]) -> Result<(), Infallible> {
            for operation in operations {
                match operation {
                    Operation::TransferInPlace(buffer) => self.handle(buffer),
                    _ => unimplemented!(),
                }
            }
            Ok(())
        }
    }

    const ARM_DAP: u32 = 0x4ba0_0477;
    const XILINX_PL: u32 = 0x0372_7093;

    fn zynq_devices() -> Vec<ScanChainDevice> {
        vec![
            ScanChainDevice {
                idcode: IdCode::from(XILINX_PL),
                irlen: 6,
            },
            ScanChainDevice {
                idcode: IdCode::from(ARM_DAP),
                irlen: 4,
            },
        ]
    }

    fn dpacc(value: u32, address: u8, read: bool) -> BitVec<u8, Lsb0> {
        let mut data = bitvec![u8, Lsb0; 0; 35];
        data.store_le((value as u64) << 3 | (address as u64 & 0b1100) >> 1 | read as u64);
        data
    }

    fn sequencer() -> FpgaSequencer<FakeSequencer> {
        let chain = FakeChain::new(vec![
            FakeDevice::bypass_only(XILINX_PL, 6),
            FakeDevice::dap(ARM_DAP, FakeDap::new()),
        ]);
        FpgaSequencer::new(FakeSequencer::new(chain), 100)
    }

    #[test]
    fn init_checks_magic_and_releases_mux() {
        let mut backend = sequencer();

        backend.init().unwrap();

        assert_eq!(backend.status(), SequencerStatus::InitOk);
        assert_eq!(backend.spi.mux, Some(JTAG_SEL_EXT));
    }

    #[test]
    fn wrong_magic_is_reported() {
        let mut backend = sequencer();
        backend.spi.magic = 0x12;

        assert!(matches!(
            backend.init(),
            Err(JtagError::SequencerMagic(0x12))
        ));
        assert_eq!(backend.status(), SequencerStatus::SpiFailed);
    }

    #[test]
    fn scan_chain_runs_over_sequencer() {
        let taps = TapTable::default().with_host_devices(&zynq_devices());
        let mut chain = ScanChain::new(sequencer());

        let devices = chain.query_chain(&taps).unwrap();

        assert_eq!(devices.len(), 2);
        assert_eq!(devices[1].idcode, IdCode::from(ARM_DAP));
    }

    #[test]
    fn stored_program_returns_read_words() {
        let mut chain = ScanChain::new(sequencer());
        chain.set_devices(zynq_devices());
        chain.reset_then_idle().unwrap();

        let dap = IdCode::from(ARM_DAP);
        let mut program = ScanProgram::new(16);
        for (data, read) in [
            (dpacc(0x0100_00f0, 0x8, false), false),
            (dpacc(0, 0x8, true), false),
            (dpacc(0, 0xC, true), true),
        ] {
            chain
                .record_transaction(&mut program, dap, 0xA, &data, read)
                .unwrap();
        }
        assert_eq!(program.captured_bits(), 41);

        chain.store_program(program).unwrap();

        assert_eq!(chain.execute_program().unwrap(), vec![0x0100_00f0]);
        assert_eq!(chain.execute_program().unwrap(), vec![0x0100_00f0]);
    }

    #[test]
    fn busy_sequencer_times_out() {
        let mut backend = sequencer();
        backend.spi.busy_polls = 1_000;

        let mut sequence = JtagSequence::new();
        sequence.push(false, false);

        assert!(matches!(
            backend.read_write_sequence(&sequence),
            Err(JtagError::Timeout(_))
        ));
    }

    #[test]
    fn long_sequences_are_split() {
        let mut backend = sequencer();

        let mut sequence = JtagSequence::new();
        sequence.tms_path(0b01_1111, 6);
        sequence.shift_repeated(false, 600, false);
        backend.write_sequence(&sequence).unwrap();

        assert_eq!(
            backend.spi.log,
            vec![SPI_CMD_WR_SEQ, SPI_CMD_WR_SEQ, SPI_CMD_WR_SEQ]
        );
    }

    #[test]
    fn jtag_test_reports_stuck_bits() {
        let mut backend = sequencer();

        // The fake drops bit 0x04 on the loopback path.
        assert_eq!(backend.jtag_test().unwrap(), 0x04);
        assert!(backend.osc_test().unwrap());
    }

    #[test]
    fn oversized_program_is_rejected() {
        let mut backend = sequencer();
        let mut program = ScanProgram::new(1);
        program
            .sequence_mut()
            .shift_repeated(false, MAX_STORED_SEQUENCE_BYTES * 8 + 1, false);

        assert!(matches!(
            backend.store_program(program),
            Err(JtagError::SequenceTooLong { .. })
        ));
    }
}
