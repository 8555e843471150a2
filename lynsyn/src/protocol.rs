//! The USB packet format.
//!
//! Every request starts with a one byte command, followed by the packed, little endian fields of
//! the command. Replies are packed and little endian as well and carry no command byte.

use enum_primitive_derive::Primitive;
use num_traits::FromPrimitive;
use scroll::{ctx, Endian, Pread, Pwrite, LE};

use crate::{
    calibration::{CalibrationPoint, ChannelCalibration},
    probe::{IdCode, ScanChainDevice, MAX_JTAG_DEVICES},
    sampling::{SampleRecord, SamplingFlags, CHANNELS},
    target::{BreakpointSlot, MAX_CORES},
};

/// Firmware version reported in the INIT reply (1.6).
pub const SW_VERSION: u8 = 0x16;

/// Bytes per UPGRADE_STORE request.
pub const FLASH_BUFFER_SIZE: usize = 64;

/// Bytes of a [`SampleRecord`] on the wire.
pub const SAMPLE_REPLY_SIZE: usize = std::mem::size_of::<i64>()
    + MAX_CORES * std::mem::size_of::<u64>()
    + CHANNELS * std::mem::size_of::<i16>()
    + std::mem::size_of::<u16>();

static_assertions::const_assert_eq!(SAMPLE_REPLY_SIZE, 56);

/// Bytes of the USB self test reply.
pub const USB_TEST_REPLY_SIZE: usize = 256;

/// Calibration request flag for the low reference point.
pub const CALREQ_FLAG_LOW: u32 = 1 << 0;

/// Calibration request flag for the high reference point.
pub const CALREQ_FLAG_HIGH: u32 = 1 << 1;

/// Errors while decoding or encoding packets.
#[derive(Debug, thiserror::Error, docsplay::Display)]
pub enum PacketError {
    /// The packet is empty.
    Empty,

    /// Unknown command {0:#04x}.
    UnknownCommand(u8),

    /// The {command:?} packet needs {expected} bytes but only {actual} arrived.
    Truncated {
        command: Command,
        expected: usize,
        actual: usize,
    },

    /// {value:#x} is not a valid {field}.
    InvalidValue { field: &'static str, value: u64 },

    /// Packet encoding failed
    Scroll(#[from] scroll::Error),
}

/// The command byte of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Primitive)]
pub enum Command {
    /// `'i'`: report versions and calibration.
    Init = 0x69,
    /// `'h'`: rewrite the hardware version record.
    HwInit = 0x68,
    /// `'j'`: discover the target.
    JtagInit = 0x6a,
    /// `'b'`: set a breakpoint.
    Breakpoint = 0x62,
    /// `'s'`: start a capture.
    StartSampling = 0x73,
    /// `'g'`: take a single sample.
    GetSample = 0x67,
    /// `'l'`: measure a calibration point.
    Cal = 0x6c,
    /// `'c'`: set the calibration of a channel.
    CalSet = 0x63,
    /// `'t'`: run a self test.
    Test = 0x74,
    /// `'u'`: start a firmware upgrade.
    UpgradeInit = 0x75,
    /// `'f'`: store a firmware block.
    UpgradeStore = 0x66,
    /// `'r'`: check and activate the new firmware.
    UpgradeFinalise = 0x72,
}

impl Command {
    /// Bytes of a request with this command, including the command byte.
    pub fn request_size(self) -> usize {
        1 + match self {
            Command::Init | Command::UpgradeInit => 0,
            Command::HwInit | Command::Test => 1,
            Command::JtagInit => MAX_JTAG_DEVICES * 8,
            Command::Breakpoint => 2 + 8,
            Command::StartSampling => 8 + 8,
            Command::GetSample => 8,
            Command::Cal => 1 + 4 + 4,
            Command::CalSet => 1 + 8 + 8,
            Command::UpgradeStore => FLASH_BUFFER_SIZE,
            Command::UpgradeFinalise => 4,
        }
    }
}

/// The self tests of the TEST request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Primitive)]
pub enum TestKind {
    /// Reply with the bytes 0 to 255.
    Usb = 0,
    /// Check the SPI link to the FPGA.
    Spi = 1,
    /// Loop test patterns through the JTAG ports.
    Jtag = 2,
    /// Check the FPGA oscillator.
    Osc = 3,
    /// Switch the LED on.
    LedsOn = 4,
    /// Switch the LED off.
    LedsOff = 5,
    /// Average every ADC channel.
    Adc = 6,
}

/// The wire values of the breakpoint types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Primitive)]
enum BreakpointType {
    Start = 0,
    Stop = 1,
    Frame = 2,
}

impl From<BreakpointType> for BreakpointSlot {
    fn from(value: BreakpointType) -> Self {
        match value {
            BreakpointType::Start => BreakpointSlot::Start,
            BreakpointType::Stop => BreakpointSlot::Stop,
            BreakpointType::Frame => BreakpointSlot::Frame,
        }
    }
}

impl From<BreakpointSlot> for BreakpointType {
    fn from(value: BreakpointSlot) -> Self {
        match value {
            BreakpointSlot::Start => BreakpointType::Start,
            BreakpointSlot::Stop => BreakpointType::Stop,
            BreakpointSlot::Frame => BreakpointType::Frame,
        }
    }
}

/// A decoded request.
#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    /// Report versions and calibration.
    Init,
    /// Wipe the configuration store and write the hardware version.
    HwInit {
        /// Hardware version, major in the high nibble.
        hw_version: u8,
    },
    /// Discover the target.
    JtagInit {
        /// The devices the host knows to be on the chain, up to the first zero IDCODE.
        devices: Vec<ScanChainDevice>,
    },
    /// Program or remember a breakpoint.
    Breakpoint {
        /// Core the breakpoint is set on.
        core: u8,
        /// Role of the breakpoint.
        slot: BreakpointSlot,
        /// Address.
        addr: u64,
    },
    /// Start a capture.
    StartSampling {
        /// Capture length in cycles, if the capture is timed.
        period: i64,
        /// Capture mode.
        flags: SamplingFlags,
    },
    /// Take a single sample.
    GetSample {
        /// [`SamplingFlags::SAMPLE_PC`] and [`SamplingFlags::AVERAGE`] are used.
        flags: SamplingFlags,
    },
    /// Measure a calibration point.
    Calibrate {
        /// ADC channel.
        channel: u8,
        /// Expected reading, doubled.
        reference: i32,
        /// Low or high point.
        point: CalibrationPoint,
    },
    /// Set the calibration of a channel.
    CalSet {
        /// ADC channel.
        channel: u8,
        /// Calibration values.
        calibration: ChannelCalibration,
    },
    /// Run a self test.
    Test(TestKind),
    /// Erase the upgrade area.
    UpgradeInit,
    /// Store the next firmware block.
    UpgradeStore {
        /// Block contents.
        data: [u8; FLASH_BUFFER_SIZE],
    },
    /// Check the checksum of the stored firmware and activate it.
    UpgradeFinalise {
        /// Sum of all stored words.
        crc: u32,
    },
}

fn invalid(field: &'static str, value: impl Into<u64>) -> PacketError {
    PacketError::InvalidValue {
        field,
        value: value.into(),
    }
}

impl Request {
    /// The command byte of this request.
    pub fn command(&self) -> Command {
        match self {
            Request::Init => Command::Init,
            Request::HwInit { .. } => Command::HwInit,
            Request::JtagInit { .. } => Command::JtagInit,
            Request::Breakpoint { .. } => Command::Breakpoint,
            Request::StartSampling { .. } => Command::StartSampling,
            Request::GetSample { .. } => Command::GetSample,
            Request::Calibrate { .. } => Command::Cal,
            Request::CalSet { .. } => Command::CalSet,
            Request::Test(_) => Command::Test,
            Request::UpgradeInit => Command::UpgradeInit,
            Request::UpgradeStore { .. } => Command::UpgradeStore,
            Request::UpgradeFinalise { .. } => Command::UpgradeFinalise,
        }
    }

    /// Decodes a request. Bytes past the end of the request are ignored.
    pub fn from_bytes(buffer: &[u8]) -> Result<Self, PacketError> {
        let (&byte, _) = buffer.split_first().ok_or(PacketError::Empty)?;
        let command = Command::from_u8(byte).ok_or(PacketError::UnknownCommand(byte))?;

        let expected = command.request_size();
        if buffer.len() < expected {
            return Err(PacketError::Truncated {
                command,
                expected,
                actual: buffer.len(),
            });
        }

        let offset = &mut 1;
        let request = match command {
            Command::Init => Request::Init,
            Command::HwInit => Request::HwInit {
                hw_version: buffer.gread(offset)?,
            },
            Command::JtagInit => {
                let mut devices = Vec::new();
                for _ in 0..MAX_JTAG_DEVICES {
                    let idcode: u32 = buffer.gread_with(offset, LE)?;
                    let irlen: u32 = buffer.gread_with(offset, LE)?;
                    if idcode == 0 {
                        break;
                    }
                    devices.push(ScanChainDevice {
                        idcode: IdCode::from(idcode),
                        irlen,
                    });
                }
                Request::JtagInit { devices }
            }
            Command::Breakpoint => {
                let core = buffer.gread(offset)?;
                let bp_type: u8 = buffer.gread(offset)?;
                let slot = BreakpointType::from_u8(bp_type)
                    .ok_or_else(|| invalid("breakpoint type", bp_type))?
                    .into();
                Request::Breakpoint {
                    core,
                    slot,
                    addr: buffer.gread_with(offset, LE)?,
                }
            }
            Command::StartSampling => Request::StartSampling {
                period: buffer.gread_with(offset, LE)?,
                flags: SamplingFlags::new(buffer.gread_with(offset, LE)?),
            },
            Command::GetSample => Request::GetSample {
                flags: SamplingFlags::new(buffer.gread_with(offset, LE)?),
            },
            Command::Cal => {
                let channel = buffer.gread(offset)?;
                let reference = buffer.gread_with(offset, LE)?;
                let flags: u32 = buffer.gread_with(offset, LE)?;
                // Anything without the high flag measures the low point.
                let point = if flags & CALREQ_FLAG_HIGH != 0 {
                    CalibrationPoint::High
                } else {
                    CalibrationPoint::Low
                };
                Request::Calibrate {
                    channel,
                    reference,
                    point,
                }
            }
            Command::CalSet => Request::CalSet {
                channel: buffer.gread(offset)?,
                calibration: ChannelCalibration {
                    offset: buffer.gread_with(offset, LE)?,
                    gain: buffer.gread_with(offset, LE)?,
                },
            },
            Command::Test => {
                let test: u8 = buffer.gread(offset)?;
                Request::Test(TestKind::from_u8(test).ok_or_else(|| invalid("test", test))?)
            }
            Command::UpgradeInit => Request::UpgradeInit,
            Command::UpgradeStore => {
                let mut data = [0; FLASH_BUFFER_SIZE];
                buffer.gread_inout(offset, &mut data)?;
                Request::UpgradeStore { data }
            }
            Command::UpgradeFinalise => Request::UpgradeFinalise {
                crc: buffer.gread_with(offset, LE)?,
            },
        };

        tracing::trace!("Received {:?}", request);
        Ok(request)
    }

    /// Encodes the request the way the host sends it.
    pub fn to_bytes(&self) -> Result<Vec<u8>, PacketError> {
        let command = self.command();
        let mut buffer = vec![0; command.request_size()];
        let offset = &mut 0;

        buffer.gwrite(command as u8, offset)?;
        match self {
            Request::Init | Request::UpgradeInit => {}
            Request::HwInit { hw_version } => {
                buffer.gwrite(*hw_version, offset)?;
            }
            Request::JtagInit { devices } => {
                for device in devices.iter().take(MAX_JTAG_DEVICES) {
                    buffer.gwrite_with(u32::from(device.idcode), offset, LE)?;
                    buffer.gwrite_with(device.irlen, offset, LE)?;
                }
            }
            Request::Breakpoint { core, slot, addr } => {
                buffer.gwrite(*core, offset)?;
                buffer.gwrite(BreakpointType::from(*slot) as u8, offset)?;
                buffer.gwrite_with(*addr, offset, LE)?;
            }
            Request::StartSampling { period, flags } => {
                buffer.gwrite_with(*period, offset, LE)?;
                buffer.gwrite_with(flags.bits(), offset, LE)?;
            }
            Request::GetSample { flags } => {
                buffer.gwrite_with(flags.bits(), offset, LE)?;
            }
            Request::Calibrate {
                channel,
                reference,
                point,
            } => {
                let flags = match point {
                    CalibrationPoint::Low => CALREQ_FLAG_LOW,
                    CalibrationPoint::High => CALREQ_FLAG_HIGH,
                };
                buffer.gwrite(*channel, offset)?;
                buffer.gwrite_with(*reference, offset, LE)?;
                buffer.gwrite_with(flags, offset, LE)?;
            }
            Request::CalSet {
                channel,
                calibration,
            } => {
                buffer.gwrite(*channel, offset)?;
                buffer.gwrite_with(calibration.offset, offset, LE)?;
                buffer.gwrite_with(calibration.gain, offset, LE)?;
            }
            Request::Test(test) => {
                buffer.gwrite(*test as u8, offset)?;
            }
            Request::UpgradeStore { data } => {
                buffer.gwrite(&data[..], offset)?;
            }
            Request::UpgradeFinalise { crc } => {
                buffer.gwrite_with(*crc, offset, LE)?;
            }
        }

        Ok(buffer)
    }
}

/// A packet sent to the host.
pub trait Reply {
    /// Bytes on the wire.
    const SIZE: usize;

    /// Encodes the reply into `buffer`, which must hold at least [`Reply::SIZE`] bytes.
    fn to_bytes(&self, buffer: &mut [u8]) -> Result<usize, PacketError>;

    /// Encodes the reply into a new buffer.
    fn to_vec(&self) -> Result<Vec<u8>, PacketError> {
        let mut buffer = vec![0; Self::SIZE];
        self.to_bytes(&mut buffer)?;
        Ok(buffer)
    }
}

/// Reply to INIT.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InitReply {
    /// Hardware version from the configuration store.
    pub hw_version: u8,
    /// Firmware version.
    pub sw_version: u8,
    /// Bootloader version.
    pub boot_version: u8,
}

impl Reply for InitReply {
    const SIZE: usize = 64 - 2;

    fn to_bytes(&self, buffer: &mut [u8]) -> Result<usize, PacketError> {
        let offset = &mut 0;
        buffer.gwrite(self.hw_version, offset)?;
        buffer.gwrite(self.sw_version, offset)?;
        buffer.gwrite(self.boot_version, offset)?;
        // Reserved.
        while *offset < Self::SIZE {
            buffer.gwrite(0u8, offset)?;
        }
        Ok(*offset)
    }
}

/// Calibration of every channel, sent after [`InitReply`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CalInfo(pub [ChannelCalibration; CHANNELS]);

impl Reply for CalInfo {
    const SIZE: usize = 2 * CHANNELS * 8;

    fn to_bytes(&self, buffer: &mut [u8]) -> Result<usize, PacketError> {
        let offset = &mut 0;
        for channel in &self.0 {
            buffer.gwrite_with(channel.offset, offset, LE)?;
        }
        for channel in &self.0 {
            buffer.gwrite_with(channel.gain, offset, LE)?;
        }
        Ok(*offset)
    }
}

/// Status reply of the SPI, JTAG and OSC self tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TestReply {
    /// Test specific status word.
    pub status: u32,
}

impl Reply for TestReply {
    const SIZE: usize = 4;

    fn to_bytes(&self, buffer: &mut [u8]) -> Result<usize, PacketError> {
        Ok(buffer.pwrite_with(self.status, 0, LE)?)
    }
}

/// Reply of the USB self test: the bytes 0 to 255.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct UsbTestReply;

impl Reply for UsbTestReply {
    const SIZE: usize = USB_TEST_REPLY_SIZE;

    fn to_bytes(&self, buffer: &mut [u8]) -> Result<usize, PacketError> {
        let offset = &mut 0;
        for byte in 0..=u8::MAX {
            buffer.gwrite(byte, offset)?;
        }
        Ok(*offset)
    }
}

/// Reply of the ADC self test.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdcTestReply {
    /// Average reading per channel.
    pub current: [i16; CHANNELS],
}

impl Reply for AdcTestReply {
    const SIZE: usize = CHANNELS * 2;

    fn to_bytes(&self, buffer: &mut [u8]) -> Result<usize, PacketError> {
        let offset = &mut 0;
        for current in self.current {
            buffer.gwrite_with(current, offset, LE)?;
        }
        Ok(*offset)
    }
}

impl ctx::TryIntoCtx<Endian> for SampleRecord {
    type Error = scroll::Error;

    fn try_into_ctx(self, buffer: &mut [u8], endian: Endian) -> Result<usize, Self::Error> {
        let offset = &mut 0;
        buffer.gwrite_with(self.time, offset, endian)?;
        for pc in self.pc {
            buffer.gwrite_with(pc, offset, endian)?;
        }
        for current in self.current {
            buffer.gwrite_with(current, offset, endian)?;
        }
        buffer.gwrite_with(self.flags, offset, endian)?;
        Ok(*offset)
    }
}

impl<'a> ctx::TryFromCtx<'a, Endian> for SampleRecord {
    type Error = scroll::Error;

    fn try_from_ctx(buffer: &'a [u8], endian: Endian) -> Result<(Self, usize), Self::Error> {
        let offset = &mut 0;
        let mut record = SampleRecord {
            time: buffer.gread_with(offset, endian)?,
            ..Default::default()
        };
        for pc in &mut record.pc {
            *pc = buffer.gread_with(offset, endian)?;
        }
        for current in &mut record.current {
            *current = buffer.gread_with(offset, endian)?;
        }
        record.flags = buffer.gread_with(offset, endian)?;
        Ok((record, *offset))
    }
}

impl Reply for SampleRecord {
    const SIZE: usize = SAMPLE_REPLY_SIZE;

    fn to_bytes(&self, buffer: &mut [u8]) -> Result<usize, PacketError> {
        Ok(buffer.pwrite_with(*self, 0, LE)?)
    }
}

/// Encodes a batch of sample records back to back.
pub fn encode_samples(samples: &[SampleRecord]) -> Result<Vec<u8>, PacketError> {
    let mut buffer = vec![0; samples.len() * SAMPLE_REPLY_SIZE];
    let offset = &mut 0;
    for sample in samples {
        buffer.gwrite_with(*sample, offset, LE)?;
    }
    Ok(buffer)
}

/// Decodes records encoded by [`encode_samples`], as the host does.
pub fn decode_samples(buffer: &[u8]) -> Result<Vec<SampleRecord>, PacketError> {
    let offset = &mut 0;
    let mut samples = Vec::with_capacity(buffer.len() / SAMPLE_REPLY_SIZE);
    while *offset + SAMPLE_REPLY_SIZE <= buffer.len() {
        samples.push(buffer.gread_with(offset, LE)?);
    }
    Ok(samples)
}
