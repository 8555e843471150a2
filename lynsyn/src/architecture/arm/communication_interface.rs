use bitvec::prelude::*;

use crate::{
    architecture::arm::{
        ap::{ApRegister, Drw, Tar, TarHi},
        dp::{Abort, Ctrl, DpRegister, RdBuff, Select},
        memory::DebugBus,
        PortType, Register, JTAG_ABORT_IR_VALUE, JTAG_DR_BIT_LENGTH,
    },
    poll::{poll_until, Timeout},
    probe::{
        common::bits_to_word,
        program::{JTAG_STATUS_OK, JTAG_STATUS_WAIT},
        Bits, IdCode, JtagBackend, JtagError, ScanChain, ScanProgram,
    },
};

/// Errors of the ADIv5 transaction layer.
#[derive(Debug, thiserror::Error, docsplay::Display)]
pub enum DebugTransportError {
    /// JTAG transport error
    Jtag(#[from] JtagError),

    /// The target answered WAIT to {attempts} attempts in a row.
    WaitRetriesExhausted { attempts: usize },

    /// The target answered with acknowledge {0:#05b}.
    UnexpectedAck(u8),

    /// {0}
    Timeout(#[from] Timeout),
}

/// A memory access port and the width of its address space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryAp {
    /// Index of the access port.
    pub ap: u8,
    /// Whether TAR_HI has to be written for each access.
    pub large_address: bool,
}

impl MemoryAp {
    /// An access port with a 32-bit address space.
    pub fn new(ap: u8) -> Self {
        Self {
            ap,
            large_address: false,
        }
    }
}

/// ADIv5 register access through a JTAG-DP.
///
/// Every DPACC/APACC transaction returns the result of the previous one, so reads are followed
/// by a read of RDBUFF. AP bank selection is cached; SELECT is only written when the access port
/// or the register bank changes.
#[derive(Debug)]
pub struct ArmDebugInterface<B> {
    chain: ScanChain<B>,
    dap: IdCode,
    wait_retries: usize,
    select: Option<Select>,
}

impl<B: JtagBackend> ArmDebugInterface<B> {
    /// Creates the interface for the DAP with the given IDCODE, which has to be part of the
    /// queried chain. Transactions answered with WAIT are attempted at most `wait_retries` times.
    pub fn new(
        chain: ScanChain<B>,
        dap: IdCode,
        wait_retries: usize,
    ) -> Result<Self, DebugTransportError> {
        chain.position(dap)?;

        Ok(Self::with_dap(chain, dap, wait_retries))
    }

    /// Creates the interface for a DAP that was already found on the queried chain.
    pub(crate) fn with_dap(chain: ScanChain<B>, dap: IdCode, wait_retries: usize) -> Self {
        Self {
            chain,
            dap,
            wait_retries,
            select: None,
        }
    }

    /// The IDCODE of the DAP.
    pub fn dap(&self) -> IdCode {
        self.dap
    }

    /// Access the underlying scan chain.
    pub fn chain_mut(&mut self) -> &mut ScanChain<B> {
        &mut self.chain
    }

    /// Consumes the interface and returns the scan chain.
    pub fn into_chain(self) -> ScanChain<B> {
        self.chain
    }

    /// Performs a single DPACC or APACC transaction and returns the data captured with it,
    /// which is the result of the previous read.
    ///
    /// Only bits 2 and 3 of `address` are sent; bank selection is the caller's responsibility.
    pub fn low_access(
        &mut self,
        port: PortType,
        read: bool,
        address: u8,
        value: u32,
    ) -> Result<u32, DebugTransportError> {
        self.chain.write_ir(self.dap, port.ir())?;

        let payload = build_jtag_payload_and_address(read, address, value);

        for _ in 0..self.wait_retries {
            let response = self.chain.read_write_dr(self.dap, &payload)?;
            let (ack, data) = parse_jtag_response(&response);

            match ack {
                JTAG_STATUS_OK => return Ok(data),
                JTAG_STATUS_WAIT => continue,
                ack => {
                    tracing::warn!(
                        "{:?} {} of {:#x} answered with {:#05b}",
                        port,
                        if read { "read" } else { "write" },
                        address,
                        ack
                    );
                    return Err(DebugTransportError::UnexpectedAck(ack));
                }
            }
        }

        tracing::warn!("Giving up after {} WAIT responses", self.wait_retries);
        Err(DebugTransportError::WaitRetriesExhausted {
            attempts: self.wait_retries,
        })
    }

    /// Writes ABORT. ABORT transactions are not acknowledged.
    pub fn dp_abort(&mut self, abort: Abort) -> Result<(), DebugTransportError> {
        self.chain.write_ir(self.dap, JTAG_ABORT_IR_VALUE)?;

        let payload = build_jtag_payload_and_address(false, 0, abort.into());
        self.chain.read_write_dr(self.dap, &payload)?;

        Ok(())
    }

    /// Aborts any pending transaction and powers up the debug and system domains, waiting at most
    /// `budget` reads of CTRL/STAT for the acknowledge.
    #[tracing::instrument(skip(self))]
    pub fn dp_init(&mut self, budget: u32) -> Result<(), DebugTransportError> {
        let mut abort = Abort(0);
        abort.set_dapabort(true);
        self.dp_abort(abort)?;

        self.select = None;

        let mut ctrl: Ctrl = self.read_dp_register()?;
        ctrl.set_csyspwrupreq(true);
        ctrl.set_cdbgpwrupreq(true);
        self.write_dp_register(ctrl)?;

        poll_until("debug power-up", budget, || {
            let ctrl: Ctrl = self.read_dp_register()?;
            Ok::<_, DebugTransportError>(ctrl.powered_up().then_some(()))
        })?;

        tracing::debug!("Debug port powered up");
        Ok(())
    }

    /// Reads a debug port register.
    pub fn read_dp_register<R: DpRegister>(&mut self) -> Result<R, DebugTransportError> {
        self.low_access(PortType::DebugPort, true, R::ADDRESS, 0)?;
        let value = self.low_access(PortType::DebugPort, true, RdBuff::ADDRESS, 0)?;

        tracing::trace!("Read DP register {}: {:#010x}", R::NAME, value);
        Ok(R::from(value))
    }

    /// Writes a debug port register.
    pub fn write_dp_register<R: DpRegister>(&mut self, register: R) -> Result<(), DebugTransportError> {
        let value: u32 = register.into();
        tracing::trace!("Write DP register {}: {:#010x}", R::NAME, value);

        if R::ADDRESS == Select::ADDRESS {
            self.select = None;
        }

        self.low_access(PortType::DebugPort, false, R::ADDRESS, value)?;

        if R::ADDRESS == Select::ADDRESS {
            self.select = Some(Select::from(value));
        }

        Ok(())
    }

    fn select_ap_bank(&mut self, ap: u8, address: u8) -> Result<(), DebugTransportError> {
        let select = Select::for_ap_register(ap, address);

        if self.select != Some(select) {
            self.write_dp_register(select)?;
        }

        Ok(())
    }

    /// Reads a register of access port `ap`.
    pub fn read_ap_register<R: ApRegister>(&mut self, ap: u8) -> Result<R, DebugTransportError> {
        self.select_ap_bank(ap, R::ADDRESS)?;

        self.low_access(PortType::AccessPort, true, R::ADDRESS, 0)?;
        let value = self.low_access(PortType::DebugPort, true, RdBuff::ADDRESS, 0)?;

        tracing::trace!("Read AP {} register {}: {:#010x}", ap, R::NAME, value);
        Ok(R::from(value))
    }

    /// Writes a register of access port `ap`.
    pub fn write_ap_register<R: ApRegister>(
        &mut self,
        ap: u8,
        register: R,
    ) -> Result<(), DebugTransportError> {
        self.select_ap_bank(ap, R::ADDRESS)?;

        let value: u32 = register.into();
        tracing::trace!("Write AP {} register {}: {:#010x}", ap, R::NAME, value);

        self.low_access(PortType::AccessPort, false, R::ADDRESS, value)?;
        Ok(())
    }

    fn write_address(&mut self, ap: MemoryAp, address: u64) -> Result<(), DebugTransportError> {
        self.write_ap_register(ap.ap, Tar(address as u32))?;
        if ap.large_address {
            self.write_ap_register(ap.ap, TarHi((address >> 32) as u32))?;
        }
        Ok(())
    }

    /// Reads a word of target memory through a memory access port.
    pub fn read_word_32(&mut self, ap: MemoryAp, address: u64) -> Result<u32, DebugTransportError> {
        self.write_address(ap, address)?;
        let drw: Drw = self.read_ap_register(ap.ap)?;
        Ok(drw.into())
    }

    /// Writes a word of target memory through a memory access port.
    pub fn write_word_32(
        &mut self,
        ap: MemoryAp,
        address: u64,
        value: u32,
    ) -> Result<(), DebugTransportError> {
        self.write_address(ap, address)?;
        self.write_ap_register(ap.ap, Drw(value))
    }

    /// The memory behind `ap`, as a [`DebugBus`].
    pub fn memory(&mut self, ap: MemoryAp) -> ApMemory<'_, B> {
        ApMemory {
            interface: self,
            ap,
        }
    }

    /// Appends a read of the word at `address` behind access port `ap` to `program`.
    ///
    /// The read takes four transactions: SELECT, TAR, DRW and RDBUFF. Only the RDBUFF result is
    /// returned when the program runs.
    pub fn record_memory_read(
        &self,
        program: &mut ScanProgram,
        ap: u8,
        address: u32,
    ) -> Result<(), DebugTransportError> {
        let transactions = [
            (
                PortType::DebugPort,
                false,
                Select::ADDRESS,
                Select::for_ap_register(ap, Tar::ADDRESS).into(),
                false,
            ),
            (PortType::AccessPort, false, Tar::ADDRESS, address, false),
            (PortType::AccessPort, true, Drw::ADDRESS, 0, false),
            (PortType::DebugPort, true, RdBuff::ADDRESS, 0, true),
        ];

        for (port, read, register, value, capture) in transactions {
            let payload = build_jtag_payload_and_address(read, register, value);
            self.chain
                .record_transaction(program, self.dap, port.ir(), &payload, capture)?;
        }

        Ok(())
    }

    /// Stores a recorded program on the backend.
    pub fn store_program(&mut self, program: ScanProgram) -> Result<(), DebugTransportError> {
        Ok(self.chain.store_program(program)?)
    }

    /// Runs the stored program and returns the words it read.
    pub fn execute_program(&mut self) -> Result<Vec<u32>, DebugTransportError> {
        // Recorded programs write SELECT on their own.
        self.select = None;

        Ok(self.chain.execute_program()?)
    }
}

/// Target memory behind one access port.
#[derive(Debug)]
pub struct ApMemory<'a, B> {
    interface: &'a mut ArmDebugInterface<B>,
    ap: MemoryAp,
}

impl<B: JtagBackend> DebugBus for ApMemory<'_, B> {
    fn read_word_32(&mut self, address: u64) -> Result<u32, DebugTransportError> {
        self.interface.read_word_32(self.ap, address)
    }

    fn write_word_32(&mut self, address: u64, value: u32) -> Result<(), DebugTransportError> {
        self.interface.write_word_32(self.ap, address, value)
    }
}

/// Builds the 35-bit DPACC/APACC request: RnW, A[3:2] and the data word.
fn build_jtag_payload_and_address(read: bool, address: u8, value: u32) -> Bits {
    let address = address as u64;
    let payload = (value as u64) << 3 | (address & 0b1000) >> 1 | (address & 0b0100) >> 1 | read as u64;

    let mut bits = Bits::repeat(false, JTAG_DR_BIT_LENGTH);
    bits.store_le(payload);
    bits
}

/// Splits a captured DPACC/APACC register into acknowledge and data.
fn parse_jtag_response(response: &BitSlice<u8>) -> (u8, u32) {
    let ack = response
        .get(..3)
        .map(|bits| bits_to_word(bits) as u8)
        .unwrap_or(0);
    let data = response
        .get(3..)
        .map(bits_to_word)
        .unwrap_or(0);

    (ack, data)
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{
        architecture::arm::{ap::Idr, DEFAULT_WAIT_RETRIES},
        probe::{
            fake_chain::{FakeAp, FakeChain, FakeDap, FakeDevice},
            ScanChainDevice, TapTable,
        },
    };

    const ARM_DAP: u32 = 0x4ba0_0477;
    const XILINX_PL: u32 = 0x0372_7093;

    fn interface(dap: FakeDap) -> ArmDebugInterface<FakeChain> {
        let fake = FakeChain::new(vec![
            FakeDevice::bypass_only(XILINX_PL, 6),
            FakeDevice::dap(ARM_DAP, dap),
        ]);
        let taps = TapTable::default().with_host_devices(&[ScanChainDevice {
            idcode: IdCode::from(XILINX_PL),
            irlen: 6,
        }]);

        let mut chain = ScanChain::new(fake);
        chain.query_chain(&taps).unwrap();

        ArmDebugInterface::new(chain, IdCode::from(ARM_DAP), DEFAULT_WAIT_RETRIES).unwrap()
    }

    fn fake(interface: &mut ArmDebugInterface<FakeChain>) -> &mut FakeDap {
        interface.chain_mut().backend_mut().dap_mut()
    }

    #[test]
    fn payload_layout() {
        let payload = build_jtag_payload_and_address(true, 0xC, 0x8000_0001);

        assert_eq!(payload.len(), 35);
        assert_eq!(payload[..3].load_le::<u8>(), 0b111);
        assert_eq!(payload[3..].load_le::<u32>(), 0x8000_0001);
    }

    #[test]
    fn dp_init_powers_up() {
        let mut interface = interface(FakeDap::new());

        interface.dp_init(10).unwrap();

        let dap = fake(&mut interface);
        assert_eq!(dap.aborts(), &[1]);
        assert_eq!(dap.ctrl_stat() & 0xF000_0000, 0xF000_0000);
    }

    #[test]
    fn stuck_power_up_times_out() {
        let mut dap = FakeDap::new();
        dap.set_power_up_stuck(true);
        let mut interface = interface(dap);

        let error = interface.dp_init(5).unwrap_err();

        assert!(matches!(
            error,
            DebugTransportError::Timeout(Timeout { attempts: 5, .. })
        ));
    }

    #[test]
    fn wait_is_retried() {
        let mut interface = interface(FakeDap::new().with_ap(0, FakeAp::apb(0x8000_0000)));
        fake(&mut interface).inject_waits(DEFAULT_WAIT_RETRIES - 1);

        let idr: Idr = interface.read_ap_register(0).unwrap();

        assert_eq!(u32::from(idr), 0x0477_0002);
    }

    #[test]
    fn wait_retries_are_bounded() {
        let mut interface = interface(FakeDap::new());
        fake(&mut interface).inject_waits(DEFAULT_WAIT_RETRIES + 1);

        let error = interface
            .low_access(PortType::DebugPort, true, Ctrl::ADDRESS, 0)
            .unwrap_err();

        assert!(matches!(
            error,
            DebugTransportError::WaitRetriesExhausted {
                attempts: DEFAULT_WAIT_RETRIES
            }
        ));
    }

    #[test]
    fn fault_ack_is_reported() {
        let mut interface = interface(FakeDap::new());
        fake(&mut interface).inject_fault(0b100);

        let error = interface
            .low_access(PortType::DebugPort, true, Ctrl::ADDRESS, 0)
            .unwrap_err();

        assert!(matches!(error, DebugTransportError::UnexpectedAck(0b100)));
    }

    #[test]
    fn select_is_cached_per_bank() {
        let mut interface = interface(
            FakeDap::new()
                .with_ap(0, FakeAp::apb(0x8000_0000))
                .with_ap(1, FakeAp::axi(false)),
        );

        let _: Idr = interface.read_ap_register(0).unwrap();
        let _: Idr = interface.read_ap_register(0).unwrap();
        assert_eq!(fake(&mut interface).select_writes(), 1);

        interface.write_ap_register(0, Tar(0x1000)).unwrap();
        assert_eq!(fake(&mut interface).select_writes(), 2);

        let _: Idr = interface.read_ap_register(1).unwrap();
        assert_eq!(fake(&mut interface).select_writes(), 3);
        assert_eq!(fake(&mut interface).select(), 0x0100_00F0);
    }

    #[test]
    fn memory_access_uses_tar_hi_for_large_addresses() {
        let mut interface = interface(FakeDap::new().with_ap(2, FakeAp::axi(true)));
        let ap = MemoryAp {
            ap: 2,
            large_address: true,
        };

        interface
            .write_word_32(ap, 0x0000_0008_0000_1000, 0xcafe_f00d)
            .unwrap();

        let dap = fake(&mut interface);
        assert_eq!(dap.ap_mut(2).writes(), &[(0x0000_0008_0000_1000, 0xcafe_f00d)]);
        assert_eq!(
            interface.read_word_32(ap, 0x0000_0008_0000_1000).unwrap(),
            0xcafe_f00d
        );
    }

    #[test]
    fn debug_bus_reads_through_ap() {
        let mut dap = FakeDap::new().with_ap(1, FakeAp::apb(0x8000_0000));
        dap.ap_mut(1).set_word(0x8001_0088, 0x0300_4002);
        let mut interface = interface(dap);

        let mut memory = interface.memory(MemoryAp::new(1));

        assert_eq!(memory.read_word_32(0x8001_0088).unwrap(), 0x0300_4002);
    }

    #[test]
    fn recorded_read_matches_direct_read() {
        let mut dap = FakeDap::new().with_ap(1, FakeAp::apb(0x8000_0000));
        dap.ap_mut(1).set_word(0x8009_0084, 0x0010_2345);
        dap.ap_mut(1).set_word(0x8009_2084, 0x0010_6789);
        let mut interface = interface(dap);

        let mut program = ScanProgram::new(DEFAULT_WAIT_RETRIES);
        interface
            .record_memory_read(&mut program, 1, 0x8009_0084)
            .unwrap();
        interface
            .record_memory_read(&mut program, 1, 0x8009_2084)
            .unwrap();
        interface.store_program(program).unwrap();

        // A direct access in between must not be confused by the program's SELECT writes.
        let _: Idr = interface.read_ap_register(0).unwrap();

        for _ in 0..2 {
            assert_eq!(
                interface.execute_program().unwrap(),
                vec![0x0010_2345, 0x0010_6789]
            );
        }

        assert_eq!(
            interface.read_word_32(MemoryAp::new(1), 0x8009_2084).unwrap(),
            0x0010_6789
        );
    }
}
