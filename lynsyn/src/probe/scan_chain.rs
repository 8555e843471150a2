use bitvec::prelude::*;

use crate::probe::{
    common::bits_to_word, Bits, IdCode, JtagBackend, JtagError, JtagSequence, ProgramCommand,
    ScanChainDevice, ScanProgram, TapTable, MAX_JTAG_DEVICES,
};

/// TMS path from Run-Test/Idle to Shift-IR.
const GOTO_SHIFT_IR: (u8, usize) = (0b0011, 4);
/// TMS path from Run-Test/Idle to Shift-DR.
const GOTO_SHIFT_DR: (u8, usize) = (0b001, 3);
/// TMS path from Exit1-IR/DR to Run-Test/Idle.
const EXIT_TO_IDLE: (u8, usize) = (0b01, 2);
/// TMS path from Exit1-IR to Shift-DR.
const EXIT_IR_TO_SHIFT_DR: (u8, usize) = (0b0011, 4);
/// Five cycles with TMS high reach Test-Logic-Reset from any state, the sixth moves to Idle.
const RESET_THEN_IDLE: (u8, usize) = (0b01_1111, 6);

/// Instruction register state, as (device position, instruction).
pub(crate) type IrState = Option<(usize, u32)>;

/// A JTAG scan chain on top of a [`JtagBackend`].
///
/// Devices are numbered from the TDO end of the chain: device 0 is the one whose output drives
/// the probe's TDO pin, and bits shifted first end up in it.
#[derive(Debug)]
pub struct ScanChain<B> {
    backend: B,
    devices: Vec<ScanChainDevice>,
    last_ir: IrState,
    program_ir: IrState,
}

impl<B: JtagBackend> ScanChain<B> {
    /// Creates a scan chain with no known devices.
    pub fn new(backend: B) -> Self {
        Self {
            backend,
            devices: Vec::new(),
            last_ir: None,
            program_ir: None,
        }
    }

    /// The devices found by the last [`ScanChain::query_chain`].
    pub fn devices(&self) -> &[ScanChainDevice] {
        &self.devices
    }

    /// Replaces the chain layout without probing the hardware.
    pub fn set_devices(&mut self, devices: Vec<ScanChainDevice>) {
        self.devices = devices;
        self.last_ir = None;
    }

    /// Access the backend.
    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    /// Consumes the chain and returns the backend.
    pub fn into_backend(self) -> B {
        self.backend
    }

    /// Forgets which instruction was written last, forcing the next IR scan.
    pub fn invalidate_ir_cache(&mut self) {
        self.last_ir = None;
    }

    /// Drives all TAPs to Test-Logic-Reset and then to Run-Test/Idle.
    ///
    /// Resetting loads IDCODE into every instruction register.
    pub fn reset_then_idle(&mut self) -> Result<(), JtagError> {
        let mut sequence = JtagSequence::new();
        sequence.tms_path(RESET_THEN_IDLE.0, RESET_THEN_IDLE.1);
        self.backend.write_sequence(&sequence)?;

        self.last_ir = None;
        Ok(())
    }

    /// Counts the devices on the chain.
    ///
    /// All devices are put into BYPASS and the bypass registers are flushed with zeros. Ones are
    /// then clocked in until the first one comes out on TDO; the number of clocks this takes is
    /// the number of one-bit bypass registers in the chain.
    ///
    /// A return value of [`MAX_JTAG_DEVICES`] means no one was seen, the chain is broken or too
    /// long.
    #[tracing::instrument(skip(self))]
    pub fn count_devices(&mut self) -> Result<usize, JtagError> {
        let mut sequence = JtagSequence::new();
        sequence.tms_path(GOTO_SHIFT_IR.0, GOTO_SHIFT_IR.1);
        sequence.shift_repeated(true, MAX_JTAG_DEVICES, true);
        sequence.tms_path(EXIT_IR_TO_SHIFT_DR.0, EXIT_IR_TO_SHIFT_DR.1);
        sequence.shift_repeated(false, MAX_JTAG_DEVICES, false);
        self.backend.write_sequence(&sequence)?;

        let mut probe = JtagSequence::new();
        probe.push(true, false);

        let mut count = MAX_JTAG_DEVICES;
        for clocks in 0..MAX_JTAG_DEVICES {
            let tdo = self.backend.read_write_sequence(&probe)?;
            if tdo.first().is_some_and(|bit| *bit) {
                count = clocks;
                break;
            }
        }

        self.reset_then_idle()?;

        tracing::debug!("Found {} devices on the scan chain", count);
        Ok(count)
    }

    /// Reads the IDCODE of the first `count` devices.
    ///
    /// Expects the chain to be in Run-Test/Idle right after a reset, so that every device has
    /// IDCODE selected. The chain is reset again afterwards.
    pub fn read_idcodes(&mut self, count: usize) -> Result<Vec<IdCode>, JtagError> {
        let mut sequence = JtagSequence::new();
        sequence.tms_path(GOTO_SHIFT_DR.0, GOTO_SHIFT_DR.1);
        self.backend.write_sequence(&sequence)?;

        let mut word = JtagSequence::new();
        word.shift_repeated(false, 32, false);

        let mut idcodes = Vec::with_capacity(count);
        for _ in 0..count {
            let tdo = self.backend.read_write_sequence(&word)?;
            idcodes.push(IdCode::from(bits_to_word(&tdo)));
        }

        self.reset_then_idle()?;

        Ok(idcodes)
    }

    /// Discovers the devices on the chain and their instruction register lengths.
    ///
    /// IR lengths are looked up in `taps`. A device reporting an IDCODE of zero ends the chain.
    #[tracing::instrument(skip_all)]
    pub fn query_chain(&mut self, taps: &TapTable) -> Result<&[ScanChainDevice], JtagError> {
        self.devices.clear();
        self.last_ir = None;

        let count = self.count_devices()?;
        if count == 0 {
            tracing::warn!("No JTAG chain found");
            return Err(JtagError::NoChain);
        }
        if count >= MAX_JTAG_DEVICES {
            tracing::warn!("No JTAG chain found");
            return Err(JtagError::ChainTooLong(count));
        }

        let idcodes = self.read_idcodes(count)?;

        let mut devices = Vec::with_capacity(count);
        for (position, idcode) in idcodes.into_iter().enumerate() {
            if u32::from(idcode) == 0 {
                tracing::debug!("Chain ends at device {}", position);
                break;
            }

            let irlen = taps
                .irlen(idcode)
                .ok_or(JtagError::UnknownIrLength(idcode))?;

            tracing::info!("Device {}: idcode {}", position, idcode);
            devices.push(ScanChainDevice { idcode, irlen });
        }

        self.devices = devices;
        Ok(&self.devices)
    }

    /// Position of the device with the given IDCODE.
    pub fn position(&self, idcode: IdCode) -> Result<usize, JtagError> {
        self.devices
            .iter()
            .position(|device| device.idcode == idcode)
            .ok_or(JtagError::DeviceNotFound(idcode))
    }

    /// Shifts `ir` into the instruction register of the device with the given IDCODE.
    ///
    /// All other devices are put into BYPASS. Nothing is shifted if the same instruction was the
    /// last one written to that device.
    pub fn write_ir(&mut self, idcode: IdCode, ir: u32) -> Result<(), JtagError> {
        let position = self.position(idcode)?;

        let mut sequence = JtagSequence::new();
        let mut state = self.last_ir;
        push_ir_scan(&self.devices, &mut state, &mut sequence, position, ir);

        if !sequence.is_empty() {
            self.backend.write_sequence(&sequence)?;
        }
        self.last_ir = state;

        Ok(())
    }

    /// Shifts `data` through the data register of the device with the given IDCODE and returns
    /// the bits captured from it.
    ///
    /// The other devices are expected to be in BYPASS; each of them is padded with a single one.
    pub fn read_write_dr(&mut self, idcode: IdCode, data: &BitSlice<u8>) -> Result<Bits, JtagError> {
        let position = self.position(idcode)?;

        let mut sequence = JtagSequence::new();
        let offset = push_dr_scan(self.devices.len(), &mut sequence, position, data);

        let tdo = self.backend.read_write_sequence(&sequence)?;

        Ok(tdo
            .get(offset..offset + data.len())
            .map(BitSlice::to_bitvec)
            .unwrap_or_default())
    }

    /// Appends an IR scan followed by a DR transaction on the device with the given IDCODE to
    /// `program`.
    ///
    /// The first three bits captured from the data register are the transaction's acknowledge
    /// field. With `read` set the 32 bits following it are returned on every run.
    pub fn record_transaction(
        &self,
        program: &mut ScanProgram,
        idcode: IdCode,
        ir: u32,
        data: &BitSlice<u8>,
        read: bool,
    ) -> Result<(), JtagError> {
        let position = self.position(idcode)?;

        let init = program.sequence().len();
        let mut state = program.ir_state();
        push_ir_scan(
            &self.devices,
            &mut state,
            program.sequence_mut(),
            position,
            ir,
        );
        program.set_ir_state(state);

        let repeat = program.sequence().len();
        let ack = push_dr_scan(
            self.devices.len(),
            program.sequence_mut(),
            position,
            data,
        );
        let end = program.sequence().len();

        program.push_command(ProgramCommand {
            read,
            init,
            repeat,
            ack,
            end,
        });

        Ok(())
    }

    /// Hands `program` to the backend for repeated execution.
    #[tracing::instrument(skip_all, fields(commands = program.commands().len(), bits = program.sequence().len()))]
    pub fn store_program(&mut self, program: ScanProgram) -> Result<(), JtagError> {
        self.program_ir = program.ir_state();
        self.backend.store_program(program)
    }

    /// Runs the stored program once.
    pub fn execute_program(&mut self) -> Result<Vec<u32>, JtagError> {
        let words = self.backend.execute_program()?;
        // The program leaves the last instruction it recorded in the IR.
        self.last_ir = self.program_ir;
        Ok(words)
    }
}

/// Appends an IR scan writing `ir` to the device at `position` and BYPASS to all others.
///
/// `state` holds the instruction the chain is known to contain. Nothing is appended if it
/// already matches.
fn push_ir_scan(
    devices: &[ScanChainDevice],
    state: &mut IrState,
    sequence: &mut JtagSequence,
    position: usize,
    ir: u32,
) {
    if *state == Some((position, ir)) {
        return;
    }

    sequence.tms_path(GOTO_SHIFT_IR.0, GOTO_SHIFT_IR.1);
    let last = devices.len().saturating_sub(1);
    for (index, device) in devices.iter().enumerate() {
        let irlen = device.irlen as usize;
        if index == position {
            sequence.shift_value(ir as u64, irlen, index == last);
        } else {
            sequence.shift_repeated(true, irlen, index == last);
        }
    }
    sequence.tms_path(EXIT_TO_IDLE.0, EXIT_TO_IDLE.1);

    *state = Some((position, ir));
}

/// Appends a DR scan of `data` through the device at `position`, padding one bypass bit per
/// other device. Returns the offset of the first data bit within `sequence`.
fn push_dr_scan(
    device_count: usize,
    sequence: &mut JtagSequence,
    position: usize,
    data: &BitSlice<u8>,
) -> usize {
    let prescan = position;
    let postscan = device_count.saturating_sub(position + 1);

    sequence.tms_path(GOTO_SHIFT_DR.0, GOTO_SHIFT_DR.1);
    sequence.shift_repeated(true, prescan, false);

    let offset = sequence.len();
    sequence.shift_bits(data, postscan == 0);
    if postscan > 0 {
        sequence.shift_repeated(true, postscan, true);
    }
    sequence.tms_path(EXIT_TO_IDLE.0, EXIT_TO_IDLE.1);

    offset
}
