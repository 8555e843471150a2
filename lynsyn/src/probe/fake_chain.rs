#![allow(missing_docs)] // Don't require docs for test code
//! A simulated JTAG scan chain.
//!
//! [`FakeChain`] clocks sequences through a model of the TAP state machine of every device,
//! so the transport and the ADIv5 layer can be tested down to the bit level. Devices answer
//! IDCODE and BYPASS; a device with a [`FakeDap`] additionally implements the ABORT, DPACC and
//! APACC registers of an ARM JTAG-DP, backed by a word-addressed memory map per access port.

use std::collections::BTreeMap;

use crate::probe::{
    Bits, JtagBackend, JtagError, JtagMux, JtagMuxSelect, JtagSequence, ScanProgram,
};

const IR_ABORT: u32 = 0x8;
const IR_DPACC: u32 = 0xA;
const IR_APACC: u32 = 0xB;
const DAP_IDCODE_INSTRUCTION: u32 = 0xE;

const ACK_OK: u64 = 0b010;
const ACK_WAIT: u64 = 0b001;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum RegisterState {
    Select,
    Capture,
    Shift,
    Exit1,
    Pause,
    Exit2,
    Update,
}

impl RegisterState {
    fn update(self, tms: bool) -> Self {
        if tms {
            match self {
                Self::Capture | Self::Shift => Self::Exit1,
                Self::Exit1 | Self::Exit2 => Self::Update,
                Self::Pause => Self::Exit2,
                Self::Select | Self::Update => unreachable!(),
            }
        } else {
            match self {
                Self::Select => Self::Capture,
                Self::Capture | Self::Shift => Self::Shift,
                Self::Exit1 | Self::Pause => Self::Pause,
                Self::Exit2 => Self::Shift,
                Self::Update => unreachable!(),
            }
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum TapState {
    Reset,
    Idle,
    Dr(RegisterState),
    Ir(RegisterState),
}

impl TapState {
    fn update(self, tms: bool) -> Self {
        match self {
            Self::Reset if tms => Self::Reset,
            Self::Reset => Self::Idle,
            Self::Idle if tms => Self::Dr(RegisterState::Select),
            Self::Idle => Self::Idle,
            Self::Dr(RegisterState::Select) if tms => Self::Ir(RegisterState::Select),
            Self::Ir(RegisterState::Select) if tms => Self::Reset,
            Self::Dr(RegisterState::Update) | Self::Ir(RegisterState::Update) => {
                if tms {
                    Self::Dr(RegisterState::Select)
                } else {
                    Self::Idle
                }
            }
            Self::Dr(state) => Self::Dr(state.update(tms)),
            Self::Ir(state) => Self::Ir(state.update(tms)),
        }
    }
}

/// A shift register of up to 64 bits.
#[derive(Clone, Copy, Debug, Default)]
struct ShiftRegister {
    value: u64,
    len: usize,
}

impl ShiftRegister {
    fn load(value: u64, len: usize) -> Self {
        Self { value, len }
    }

    fn shift(&mut self, input: bool) -> bool {
        let output = self.value & 1 != 0;
        self.value >>= 1;
        if input {
            self.value |= 1 << (self.len - 1);
        }
        output
    }
}

/// One simulated TAP.
#[derive(Debug)]
pub struct FakeDevice {
    idcode: u32,
    irlen: usize,
    idcode_instruction: u32,
    ir: u32,
    shift: ShiftRegister,
    dap: Option<FakeDap>,
}

impl FakeDevice {
    /// A TAP that implements nothing but IDCODE and BYPASS.
    pub fn bypass_only(idcode: u32, irlen: usize) -> Self {
        Self {
            idcode,
            irlen,
            idcode_instruction: 0b1,
            ir: 0b1,
            shift: ShiftRegister::default(),
            dap: None,
        }
    }

    /// An ARM JTAG-DP.
    pub fn dap(idcode: u32, dap: FakeDap) -> Self {
        Self {
            idcode,
            irlen: 4,
            idcode_instruction: DAP_IDCODE_INSTRUCTION,
            ir: DAP_IDCODE_INSTRUCTION,
            shift: ShiftRegister::default(),
            dap: Some(dap),
        }
    }

    /// The instruction currently in the IR.
    pub fn ir(&self) -> u32 {
        self.ir
    }

    pub fn dap_mut(&mut self) -> Option<&mut FakeDap> {
        self.dap.as_mut()
    }

    fn ir_mask(&self) -> u32 {
        ((1u64 << self.irlen) - 1) as u32
    }

    fn reset(&mut self) {
        self.ir = self.idcode_instruction;
    }

    fn capture_ir(&mut self) {
        self.shift = ShiftRegister::load(0b01, self.irlen);
    }

    fn update_ir(&mut self) {
        self.ir = self.shift.value as u32 & self.ir_mask();
    }

    fn capture_dr(&mut self) {
        self.shift = match (self.ir, self.dap.as_mut()) {
            (ir, _) if ir == self.idcode_instruction => {
                ShiftRegister::load(self.idcode as u64, 32)
            }
            (IR_ABORT, Some(_)) => ShiftRegister::load(0, 35),
            (IR_DPACC | IR_APACC, Some(dap)) => ShiftRegister::load(dap.capture(), 35),
            _ => ShiftRegister::load(0, 1),
        };
    }

    fn update_dr(&mut self) {
        let value = self.shift.value;
        match (self.ir, self.dap.as_mut()) {
            (IR_ABORT, Some(dap)) => dap.abort((value >> 3) as u32),
            (IR_DPACC, Some(dap)) => dap.update(false, value),
            (IR_APACC, Some(dap)) => dap.update(true, value),
            _ => {}
        }
    }
}

/// A simulated scan chain, device 0 being closest to TDO.
#[derive(Debug)]
pub struct FakeChain {
    devices: Vec<FakeDevice>,
    state: TapState,
    clocks: usize,
    program: Option<ScanProgram>,
    mux: Option<JtagMuxSelect>,
}

impl FakeChain {
    pub fn new(devices: Vec<FakeDevice>) -> Self {
        Self {
            devices,
            state: TapState::Reset,
            clocks: 0,
            program: None,
            mux: None,
        }
    }

    pub fn device(&self, position: usize) -> &FakeDevice {
        &self.devices[position]
    }

    pub fn device_mut(&mut self, position: usize) -> &mut FakeDevice {
        &mut self.devices[position]
    }

    /// The first device carrying a DAP.
    pub fn dap_mut(&mut self) -> &mut FakeDap {
        self.devices
            .iter_mut()
            .find_map(|device| device.dap.as_mut())
            .expect("no DAP on the fake chain")
    }

    /// Number of TCK cycles clocked so far.
    pub fn clocks(&self) -> usize {
        self.clocks
    }

    /// The last mux selection.
    pub fn mux(&self) -> Option<JtagMuxSelect> {
        self.mux
    }

    /// Clocks a single cycle and returns TDO.
    pub fn clock(&mut self, tdi: bool, tms: bool) -> bool {
        self.clocks += 1;

        let mut tdo = false;
        match self.state {
            TapState::Reset => self.devices.iter_mut().for_each(FakeDevice::reset),
            TapState::Ir(RegisterState::Capture) => {
                self.devices.iter_mut().for_each(FakeDevice::capture_ir)
            }
            TapState::Dr(RegisterState::Capture) => {
                self.devices.iter_mut().for_each(FakeDevice::capture_dr)
            }
            TapState::Ir(RegisterState::Shift) | TapState::Dr(RegisterState::Shift) => {
                // Bits travel from TDI through the last device towards device 0.
                let mut carry = tdi;
                for device in self.devices.iter_mut().rev() {
                    carry = device.shift.shift(carry);
                }
                tdo = carry;
            }
            TapState::Ir(RegisterState::Update) => {
                self.devices.iter_mut().for_each(FakeDevice::update_ir)
            }
            TapState::Dr(RegisterState::Update) => {
                self.devices.iter_mut().for_each(FakeDevice::update_dr)
            }
            _ => {}
        }

        self.state = self.state.update(tms);

        // An empty chain has nothing driving TDO.
        tdo && !self.devices.is_empty()
    }
}

impl JtagBackend for FakeChain {
    fn write_sequence(&mut self, sequence: &JtagSequence) -> Result<(), JtagError> {
        self.read_write_sequence(sequence).map(|_| ())
    }

    fn read_write_sequence(&mut self, sequence: &JtagSequence) -> Result<Bits, JtagError> {
        let mut tdo = Bits::with_capacity(sequence.len());
        for (tdi, tms) in sequence
            .tdi()
            .iter()
            .by_vals()
            .zip(sequence.tms().iter().by_vals())
        {
            tdo.push(self.clock(tdi, tms));
        }
        Ok(tdo)
    }

    fn store_program(&mut self, program: ScanProgram) -> Result<(), JtagError> {
        self.program = Some(program);
        Ok(())
    }

    fn execute_program(&mut self) -> Result<Vec<u32>, JtagError> {
        let program = self.program.take().ok_or(JtagError::NoProgram)?;
        let result = program.replay(self);
        self.program = Some(program);
        result
    }
}

impl JtagMux for FakeChain {
    fn select(&mut self, select: JtagMuxSelect) -> Result<(), JtagError> {
        self.mux = Some(select);
        Ok(())
    }
}

/// A simulated access port.
#[derive(Debug, Clone, Default)]
pub struct FakeAp {
    pub idr: u32,
    pub base: u32,
    pub cfg: u32,
    csw: u32,
    tar: u32,
    tar_hi: u32,
    memory: BTreeMap<u64, u32>,
    writes: Vec<(u64, u32)>,
}

impl FakeAp {
    /// An APB-AP with a ROM table at `base`.
    pub fn apb(base: u32) -> Self {
        Self {
            idr: 0x0477_0002,
            base: base | 1,
            ..Default::default()
        }
    }

    /// An AXI-AP, optionally with a 64-bit address space.
    pub fn axi(large_address: bool) -> Self {
        Self {
            idr: 0x0477_0004,
            cfg: if large_address { 0b10 } else { 0 },
            ..Default::default()
        }
    }

    pub fn csw(&self) -> u32 {
        self.csw
    }

    pub fn set_word(&mut self, address: u64, value: u32) {
        self.memory.insert(address, value);
    }

    pub fn word(&self, address: u64) -> u32 {
        self.memory.get(&address).copied().unwrap_or(0)
    }

    /// Memory writes performed through DRW, in order.
    pub fn writes(&self) -> &[(u64, u32)] {
        &self.writes
    }

    fn address(&self) -> u64 {
        (self.tar_hi as u64) << 32 | self.tar as u64
    }

    fn read(&mut self, register: u8) -> u32 {
        match register {
            0x00 => self.csw,
            0x04 => self.tar,
            0x08 => self.tar_hi,
            0x0C => self.word(self.address()),
            0xF4 => self.cfg,
            0xF8 => self.base,
            0xFC => self.idr,
            _ => 0,
        }
    }

    fn write(&mut self, register: u8, value: u32) {
        match register {
            0x00 => self.csw = value,
            0x04 => self.tar = value,
            0x08 => self.tar_hi = value,
            0x0C => {
                let address = self.address();
                self.memory.insert(address, value);
                self.writes.push((address, value));
            }
            _ => {}
        }
    }
}

/// A simulated JTAG-DP.
#[derive(Debug, Default)]
pub struct FakeDap {
    ctrl_stat: u32,
    select: u32,
    read_result: u32,
    last_ack: u64,
    pending_waits: usize,
    pending_fault: Option<u8>,
    power_up_stuck: bool,
    select_writes: usize,
    aborts: Vec<u32>,
    aps: BTreeMap<u8, FakeAp>,
}

impl FakeDap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_ap(mut self, index: u8, ap: FakeAp) -> Self {
        self.aps.insert(index, ap);
        self
    }

    pub fn ap_mut(&mut self, index: u8) -> &mut FakeAp {
        self.aps.entry(index).or_default()
    }

    /// The next `count` transactions are answered with WAIT.
    pub fn inject_waits(&mut self, count: usize) {
        self.pending_waits = count;
    }

    /// The next transaction is answered with `ack`.
    pub fn inject_fault(&mut self, ack: u8) {
        self.pending_fault = Some(ack);
    }

    /// Power-up requests are never acknowledged.
    pub fn set_power_up_stuck(&mut self, stuck: bool) {
        self.power_up_stuck = stuck;
    }

    pub fn ctrl_stat(&self) -> u32 {
        self.ctrl_stat
    }

    pub fn select(&self) -> u32 {
        self.select
    }

    /// Number of writes to SELECT.
    pub fn select_writes(&self) -> usize {
        self.select_writes
    }

    /// Values written to ABORT.
    pub fn aborts(&self) -> &[u32] {
        &self.aborts
    }

    fn capture(&mut self) -> u64 {
        self.last_ack = if let Some(ack) = self.pending_fault.take() {
            ack as u64
        } else if self.pending_waits > 0 {
            self.pending_waits -= 1;
            ACK_WAIT
        } else {
            ACK_OK
        };

        (self.read_result as u64) << 3 | self.last_ack
    }

    fn abort(&mut self, value: u32) {
        self.aborts.push(value);
    }

    fn update(&mut self, access_port: bool, request: u64) {
        // A request answered with anything but OK is dropped by the DP.
        if self.last_ack != ACK_OK {
            return;
        }

        let read = request & 1 != 0;
        let address = ((request >> 1) & 0b11) as u8 * 4;
        let value = (request >> 3) as u32;

        if access_port {
            let register = (self.select & 0xF0) as u8 | address;
            let ap = self.aps.entry((self.select >> 24) as u8).or_default();
            if read {
                self.read_result = ap.read(register);
            } else {
                ap.write(register, value);
            }
            return;
        }

        match (address, read) {
            (0x4, true) => self.read_result = self.ctrl_stat,
            (0x4, false) => {
                self.ctrl_stat = value;
                if !self.power_up_stuck {
                    // Mirror CSYSPWRUPREQ and CDBGPWRUPREQ into their ACK bits.
                    self.ctrl_stat |= (value & (1 << 30)) << 1 | (value & (1 << 28)) << 1;
                }
            }
            (0x8, true) => self.read_result = self.select,
            (0x8, false) => {
                self.select = value;
                self.select_writes += 1;
            }
            // RDBUFF returns the previous result again.
            (0xC, true) => {}
            _ => {}
        }
    }
}
