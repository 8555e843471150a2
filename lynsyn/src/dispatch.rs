//! Request handling.
//!
//! [`Probe`] owns everything the firmware works with: the configuration store, the sampling
//! engine with its peripherals and, once the host sent JTAG_INIT, the debug target. USB packets
//! from the host are passed to [`Probe::handle`], and the main loop calls [`Probe::tick`] as often
//! as it can.

use embedded_hal::{
    digital::{Error as _, InputPin, OutputPin},
    spi::SpiDevice,
};

use crate::{
    calibration::{
        average_scans, calibration_info, hw_init, set_calibration, Calibrator, CALIBRATION_SCANS,
        HW_VERSION_KEY,
    },
    config::{ConfigStore, ProbeConfig},
    probe::{FpgaSequencer, JtagError},
    protocol::{
        AdcTestReply, CalInfo, InitReply, Reply, Request, TestKind, TestReply, UsbTestReply,
        SW_VERSION,
    },
    sampling::{AdcSource, CycleCounter, Peripherals, SampleSink, SamplingEngine, SamplingError},
    target::{BackendConnector, Connector, Detached},
    upgrade::{FirmwareStore, Upgrade, UpgradeError},
    Error,
};

/// The USB endpoint replies are written to.
pub trait ReplySink {
    /// Sends one reply packet.
    fn send_reply(&mut self, data: &[u8]);
}

impl ReplySink for Vec<Vec<u8>> {
    fn send_reply(&mut self, data: &[u8]) {
        self.push(data.to_vec());
    }
}

/// Board level self tests, run by the TEST request.
pub trait BoardTest {
    /// The [`SequencerStatus`](crate::probe::SequencerStatus) of the FPGA bring-up.
    fn spi_status(&self) -> u32;

    /// Loops test patterns through the JTAG ports. Returns the mask of failed patterns.
    fn jtag_test(&mut self) -> Result<u32, JtagError>;

    /// Checks the FPGA oscillator.
    fn osc_test(&mut self) -> Result<bool, JtagError>;
}

impl<SPI: SpiDevice> BoardTest for FpgaSequencer<SPI> {
    fn spi_status(&self) -> u32 {
        self.status() as u32
    }

    fn jtag_test(&mut self) -> Result<u32, JtagError> {
        FpgaSequencer::jtag_test(self).map(u32::from)
    }

    fn osc_test(&mut self) -> Result<bool, JtagError> {
        FpgaSequencer::osc_test(self)
    }
}

/// The probe firmware.
pub struct Probe<N: Connector, K, A, C, S, P, L> {
    config: ProbeConfig,
    engine: SamplingEngine<A, C, S, P, L>,
    connector: N,
    target: Option<N::Target>,
    store: K,
    calibrator: Calibrator,
    board: Option<Box<dyn BoardTest>>,
    firmware: Option<Box<dyn FirmwareStore>>,
    upgrade: Upgrade,
    boot_version: u8,
}

impl<OD, OF, K, A, C, S, P, L> Probe<BackendConnector<OD, OF>, K, A, C, S, P, L>
where
    BackendConnector<OD, OF>: Connector,
    K: ConfigStore,
    A: AdcSource,
    C: CycleCounter,
    S: SampleSink,
    P: InputPin,
    L: OutputPin,
{
    /// Creates a probe that connects through the backend selected by `config.backend`.
    ///
    /// `open_direct` and `open_sequencer` open the bit-bang and the FPGA backend. Only the
    /// selected one is ever called.
    pub fn from_config(
        config: ProbeConfig,
        io: Peripherals<A, C, S, P, L>,
        open_direct: OD,
        open_sequencer: OF,
        store: K,
        boot_version: u8,
    ) -> Self {
        let connector = BackendConnector::new(open_direct, open_sequencer);
        Self::new(config, io, connector, store, boot_version)
    }
}

impl<N, K, A, C, S, P, L> Probe<N, K, A, C, S, P, L>
where
    N: Connector,
    K: ConfigStore,
    A: AdcSource,
    C: CycleCounter,
    S: SampleSink,
    P: InputPin,
    L: OutputPin,
{
    /// Creates a probe without a target. `connector` is used on every JTAG_INIT.
    pub fn new(
        config: ProbeConfig,
        io: Peripherals<A, C, S, P, L>,
        connector: N,
        store: K,
        boot_version: u8,
    ) -> Self {
        Self {
            engine: SamplingEngine::new(io, config.poll_budgets),
            calibrator: Calibrator::new(config.calibration),
            config,
            connector,
            target: None,
            store,
            board: None,
            firmware: None,
            upgrade: Upgrade::new(),
            boot_version,
        }
    }

    /// Attaches the FPGA for the SPI, JTAG and OSC self tests.
    ///
    /// Without it those tests report the results of a board without FPGA.
    pub fn with_board_test(mut self, board: impl BoardTest + 'static) -> Self {
        self.board = Some(Box::new(board));
        self
    }

    /// Attaches the flash area that receives firmware upgrades.
    pub fn with_firmware_store(mut self, firmware: impl FirmwareStore + 'static) -> Self {
        self.firmware = Some(Box::new(firmware));
        self
    }

    /// The configuration.
    pub fn config(&self) -> &ProbeConfig {
        &self.config
    }

    /// The sampling engine.
    pub fn engine(&self) -> &SamplingEngine<A, C, S, P, L> {
        &self.engine
    }

    /// The target, if JTAG_INIT succeeded.
    pub fn target(&self) -> Option<&N::Target> {
        self.target.as_ref()
    }

    /// The target, mutably.
    pub fn target_mut(&mut self) -> Option<&mut N::Target> {
        self.target.as_mut()
    }

    /// The configuration store.
    pub fn store(&self) -> &K {
        &self.store
    }

    /// The firmware upgrade state.
    pub fn upgrade(&self) -> &Upgrade {
        &self.upgrade
    }

    /// Runs one iteration of the main loop, see [`SamplingEngine::tick`].
    pub fn tick(&mut self) -> Result<(), Error> {
        match self.target.as_mut() {
            Some(target) => self.engine.tick(target)?,
            None => self.engine.tick(&mut Detached)?,
        }
        Ok(())
    }

    /// Handles one request packet from the host. Replies are written to `replies`.
    ///
    /// A request that fails sends no reply.
    pub fn handle(&mut self, packet: &[u8], replies: &mut impl ReplySink) -> Result<(), Error> {
        match Request::from_bytes(packet)? {
            Request::Init => {
                let hw_version = self.store.get_u32(HW_VERSION_KEY).unwrap_or(0) as u8;
                let init = InitReply {
                    hw_version,
                    sw_version: SW_VERSION,
                    boot_version: self.boot_version,
                };
                replies.send_reply(&init.to_vec()?);
                replies.send_reply(&CalInfo(calibration_info(&self.store)).to_vec()?);
            }
            Request::HwInit { hw_version } => hw_init(&mut self.store, hw_version)?,
            Request::JtagInit { devices } => {
                // The old target goes away even if the new one cannot be reached.
                self.target = None;
                self.engine.reset_breakpoints();
                let target = self.connector.connect(&self.config, &devices)?;
                self.target = Some(target);
            }
            Request::Breakpoint { core, slot, addr } => {
                let target = self.target.as_mut().ok_or(Error::NotInitialized)?;
                self.engine.set_breakpoint_request(target, core.into(), slot, addr)?;
            }
            Request::StartSampling { period, flags } => match self.target.as_mut() {
                Some(target) => self.engine.start_sampling(target, period, flags)?,
                None => self.engine.start_sampling(&mut Detached, period, flags)?,
            },
            Request::GetSample { flags } => {
                let record = match self.target.as_mut() {
                    Some(target) => self.engine.get_sample(target, flags),
                    None => self.engine.get_sample(&mut Detached, flags),
                };
                replies.send_reply(&record.to_vec()?);
            }
            Request::Calibrate {
                channel,
                reference,
                point,
            } => {
                self.calibrator.calibrate(
                    &mut self.engine.peripherals_mut().adc,
                    &mut self.store,
                    channel.into(),
                    reference,
                    point,
                )?;
            }
            Request::CalSet {
                channel,
                calibration,
            } => set_calibration(&mut self.store, channel.into(), calibration)?,
            Request::Test(test) => self.self_test(test, replies)?,
            Request::UpgradeInit => {
                let firmware = self
                    .firmware
                    .as_deref_mut()
                    .ok_or(UpgradeError::NoFirmwareStore)?;
                self.upgrade.init(firmware)?;
            }
            Request::UpgradeStore { data } => {
                let firmware = self
                    .firmware
                    .as_deref_mut()
                    .ok_or(UpgradeError::NoFirmwareStore)?;
                self.upgrade.store(firmware, &data)?;
            }
            Request::UpgradeFinalise { crc } => {
                let firmware = self
                    .firmware
                    .as_deref_mut()
                    .ok_or(UpgradeError::NoFirmwareStore)?;
                self.upgrade.finalise(firmware, crc)?;
            }
        }

        Ok(())
    }

    fn self_test(&mut self, test: TestKind, replies: &mut impl ReplySink) -> Result<(), Error> {
        tracing::debug!("Running {:?} test", test);

        let status = match test {
            TestKind::Usb => {
                replies.send_reply(&UsbTestReply.to_vec()?);
                return Ok(());
            }
            TestKind::LedsOn | TestKind::LedsOff => {
                let led = &mut self.engine.peripherals_mut().led;
                let result = if test == TestKind::LedsOn {
                    led.set_high()
                } else {
                    led.set_low()
                };
                result.map_err(|error| SamplingError::Pin(error.kind()))?;
                return Ok(());
            }
            TestKind::Adc => {
                let adc = &mut self.engine.peripherals_mut().adc;
                let averages = average_scans(adc, CALIBRATION_SCANS);
                let reply = AdcTestReply {
                    current: averages.map(|average| average as i16),
                };
                replies.send_reply(&reply.to_vec()?);
                return Ok(());
            }
            TestKind::Spi => self.board.as_ref().map_or(0, |board| board.spi_status()),
            TestKind::Jtag => match self.board.as_mut() {
                Some(board) => board.jtag_test()?,
                None => 0,
            },
            TestKind::Osc => match self.board.as_mut() {
                Some(board) => u32::from(board.osc_test()?),
                None => 1,
            },
        };

        replies.send_reply(&TestReply { status }.to_vec()?);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::{cell::RefCell, rc::Rc};

    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{
        calibration::{CalibrationLimits, CalibrationPoint, ChannelCalibration},
        config::MemoryConfigStore,
        probe::{IdCode, ScanChainDevice},
        protocol::{decode_samples, FLASH_BUFFER_SIZE},
        sampling::{
            hal::fake::{Led, RecordingSink, ScriptedAdc, ScriptedPin, SteppingCounter},
            SamplingFlags, SamplingState, Timestamp, SAMPLE_INVALID,
        },
        target::{fake_target::FakeTarget, BreakpointSlot},
        upgrade::{fake::MemoryFirmwareStore, word_sum},
    };

    #[derive(Debug, Default)]
    struct FakeConnector {
        cores: usize,
        connects: Vec<Vec<ScanChainDevice>>,
    }

    impl Connector for FakeConnector {
        type Target = FakeTarget;

        fn connect(
            &mut self,
            _config: &ProbeConfig,
            host_devices: &[ScanChainDevice],
        ) -> Result<FakeTarget, Error> {
            self.connects.push(host_devices.to_vec());
            if self.cores == 0 {
                return Err(Error::NoCores);
            }
            Ok(FakeTarget::new(self.cores))
        }
    }

    struct FakeBoard;

    impl BoardTest for FakeBoard {
        fn spi_status(&self) -> u32 {
            2
        }

        fn jtag_test(&mut self) -> Result<u32, JtagError> {
            Ok(0x04)
        }

        fn osc_test(&mut self) -> Result<bool, JtagError> {
            Ok(false)
        }
    }

    #[derive(Clone, Default)]
    struct SharedFlash(Rc<RefCell<MemoryFirmwareStore>>);

    impl FirmwareStore for SharedFlash {
        fn capacity(&self) -> usize {
            self.0.borrow().capacity()
        }

        fn erase(&mut self) -> Result<(), UpgradeError> {
            self.0.borrow_mut().erase()
        }

        fn write(&mut self, offset: usize, data: &[u8]) -> Result<(), UpgradeError> {
            self.0.borrow_mut().write(offset, data)
        }

        fn mark_for_install(&mut self) -> Result<(), UpgradeError> {
            self.0.borrow_mut().mark_for_install()
        }
    }

    type TestProbe = Probe<
        FakeConnector,
        MemoryConfigStore,
        ScriptedAdc,
        SteppingCounter,
        RecordingSink,
        ScriptedPin,
        Led,
    >;

    fn probe_with(adc: ScriptedAdc, cores: usize) -> TestProbe {
        let config = ProbeConfig {
            calibration: CalibrationLimits {
                max_deviation: 200,
                scans: 4,
            },
            ..Default::default()
        };

        Probe::new(
            config,
            Peripherals {
                adc,
                clock: Timestamp::new(SteppingCounter::new(0, 1_000)),
                sink: RecordingSink::default(),
                trigger: ScriptedPin::default(),
                led: Led::default(),
            },
            FakeConnector {
                cores,
                ..Default::default()
            },
            MemoryConfigStore::new(),
            2,
        )
    }

    fn probe() -> TestProbe {
        probe_with(ScriptedAdc::new([[10; 7]]), 2)
    }

    fn send(probe: &mut TestProbe, request: Request) -> Result<Vec<Vec<u8>>, Error> {
        let mut replies = Vec::new();
        probe.handle(&request.to_bytes().unwrap(), &mut replies)?;
        Ok(replies)
    }

    fn jtag_init(probe: &mut TestProbe) {
        let devices = vec![ScanChainDevice {
            idcode: IdCode::from(0x0372_7093),
            irlen: 6,
        }];
        send(probe, Request::JtagInit { devices }).unwrap();
    }

    #[test]
    fn init_reports_versions_and_calibration() {
        let mut probe = probe();
        send(&mut probe, Request::HwInit { hw_version: 0x23 }).unwrap();

        let replies = send(&mut probe, Request::Init).unwrap();

        assert_eq!(replies.len(), 2);
        assert_eq!(&replies[0][..3], &[0x23, SW_VERSION, 2]);
        assert_eq!(
            replies[1],
            CalInfo([ChannelCalibration::default(); 7]).to_vec().unwrap()
        );
    }

    #[test]
    fn malformed_packets_are_rejected() {
        let mut probe = probe();
        let mut replies = Vec::new();

        let error = probe.handle(&[b'x'], &mut replies).unwrap_err();

        assert!(matches!(error, Error::Packet(_)));
        assert!(replies.is_empty());
    }

    #[test]
    fn breakpoint_needs_a_target() {
        let mut probe = probe();

        let error = send(
            &mut probe,
            Request::Breakpoint {
                core: 0,
                slot: BreakpointSlot::Stop,
                addr: 0x100,
            },
        )
        .unwrap_err();

        assert!(matches!(error, Error::NotInitialized));
    }

    #[test]
    fn breakpoints_reach_the_target_after_jtag_init() {
        let mut probe = probe();
        jtag_init(&mut probe);

        send(
            &mut probe,
            Request::Breakpoint {
                core: 1,
                slot: BreakpointSlot::Stop,
                addr: 0x8000,
            },
        )
        .unwrap();

        assert_eq!(probe.engine().stop_core(), 1);
        assert_eq!(
            probe.target().unwrap().breakpoint(1, BreakpointSlot::Stop),
            Some(0x8000)
        );
        assert_eq!(probe.connector.connects[0][0].irlen, 6);
    }

    #[test]
    fn jtag_init_forgets_breakpoint_cores() {
        let mut probe = probe();
        jtag_init(&mut probe);
        for slot in [BreakpointSlot::Start, BreakpointSlot::Stop, BreakpointSlot::Frame] {
            send(
                &mut probe,
                Request::Breakpoint {
                    core: 1,
                    slot,
                    addr: 0x8000,
                },
            )
            .unwrap();
        }
        assert_eq!(probe.engine().start_core(), 1);

        jtag_init(&mut probe);

        assert_eq!(probe.engine().start_core(), 0);
        assert_eq!(probe.engine().stop_core(), 0);
        assert_eq!(probe.engine().frame_breakpoint(), None);
        assert!(probe.target().unwrap().events().is_empty());
    }

    #[test]
    fn failed_jtag_init_drops_the_old_target() {
        let mut probe = probe();
        jtag_init(&mut probe);
        assert!(probe.target().is_some());

        probe.connector.cores = 0;
        let error = send(&mut probe, Request::JtagInit { devices: vec![] }).unwrap_err();

        assert!(matches!(error, Error::NoCores));
        assert!(probe.target().is_none());
    }

    #[test]
    fn period_capture_without_target() {
        let mut probe = probe();

        send(
            &mut probe,
            Request::StartSampling {
                period: 3_500,
                flags: SamplingFlags::PERIOD,
            },
        )
        .unwrap();

        for _ in 0..10 {
            if probe.engine().state() == SamplingState::Idle {
                break;
            }
            probe.tick().unwrap();
        }

        let records = &probe.engine().peripherals().sink.records;
        assert_eq!(records.len(), 4);
        assert!(records[3].is_end_of_capture());
        assert_eq!(records[0].current, [10; 7]);
    }

    #[test]
    fn single_sample_without_target_is_invalid() {
        let mut probe = probe();
        probe.tick().unwrap();
        probe.tick().unwrap();

        let replies = send(
            &mut probe,
            Request::GetSample {
                flags: SamplingFlags::SAMPLE_PC | SamplingFlags::AVERAGE,
            },
        )
        .unwrap();

        let records = decode_samples(&replies[0]).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].flags, SAMPLE_INVALID);
        assert_eq!(records[0].current, [10; 7]);
        assert_eq!(probe.engine().idle_current().count(), 0);
    }

    #[test]
    fn calibration_over_usb() {
        let mut scans = vec![[110; 7]; 4];
        scans.push([2010; 7]);
        let mut probe = probe_with(ScriptedAdc::new(scans), 1);

        for (reference, point) in [(200, CalibrationPoint::Low), (4000, CalibrationPoint::High)] {
            let replies = send(
                &mut probe,
                Request::Calibrate {
                    channel: 5,
                    reference,
                    point,
                },
            )
            .unwrap();
            assert!(replies.is_empty());
        }

        let replies = send(&mut probe, Request::Init).unwrap();
        let mut expected = [ChannelCalibration {
            offset: 0.0,
            gain: 0.0,
        }; 7];
        expected[5] = ChannelCalibration {
            offset: 10.0,
            gain: 1.0,
        };
        assert_eq!(replies[1], CalInfo(expected).to_vec().unwrap());
    }

    #[test]
    fn cal_set_stores_the_channel() {
        let mut probe = probe();
        let calibration = ChannelCalibration {
            offset: 3.0,
            gain: 0.25,
        };

        send(
            &mut probe,
            Request::CalSet {
                channel: 6,
                calibration,
            },
        )
        .unwrap();

        assert_eq!(calibration_info(probe.store())[6], calibration);
    }

    #[test]
    fn self_tests_without_fpga() {
        let mut probe = probe();
        let status = |probe: &mut TestProbe, test| send(probe, Request::Test(test)).unwrap();

        assert_eq!(status(&mut probe, TestKind::Spi), vec![vec![0, 0, 0, 0]]);
        assert_eq!(status(&mut probe, TestKind::Jtag), vec![vec![0, 0, 0, 0]]);
        assert_eq!(status(&mut probe, TestKind::Osc), vec![vec![1, 0, 0, 0]]);
        assert_eq!(status(&mut probe, TestKind::Usb)[0].len(), 256);

        let adc = status(&mut probe, TestKind::Adc);
        assert_eq!(adc, vec![[10u8, 0].repeat(7)]);
    }

    #[test]
    fn self_tests_with_fpga() {
        let mut probe = probe().with_board_test(FakeBoard);

        assert_eq!(
            send(&mut probe, Request::Test(TestKind::Spi)).unwrap(),
            vec![vec![2, 0, 0, 0]]
        );
        assert_eq!(
            send(&mut probe, Request::Test(TestKind::Jtag)).unwrap(),
            vec![vec![4, 0, 0, 0]]
        );
        assert_eq!(
            send(&mut probe, Request::Test(TestKind::Osc)).unwrap(),
            vec![vec![0, 0, 0, 0]]
        );
    }

    #[test]
    fn led_tests_switch_the_led() {
        let mut probe = probe();

        assert!(send(&mut probe, Request::Test(TestKind::LedsOn))
            .unwrap()
            .is_empty());
        assert!(probe.engine().peripherals().led.on);

        send(&mut probe, Request::Test(TestKind::LedsOff)).unwrap();
        assert!(!probe.engine().peripherals().led.on);
    }

    #[test]
    fn upgrade_needs_a_firmware_store() {
        let mut probe = probe();

        let error = send(&mut probe, Request::UpgradeInit).unwrap_err();

        assert!(matches!(
            error,
            Error::Upgrade(UpgradeError::NoFirmwareStore)
        ));
    }

    #[test]
    fn firmware_upgrade() {
        let flash = SharedFlash(Rc::new(RefCell::new(MemoryFirmwareStore::new(
            2 * FLASH_BUFFER_SIZE,
        ))));
        let mut probe = probe().with_firmware_store(flash.clone());
        let data = [0x5a; FLASH_BUFFER_SIZE];

        send(&mut probe, Request::UpgradeInit).unwrap();
        send(&mut probe, Request::UpgradeStore { data }).unwrap();
        send(
            &mut probe,
            Request::UpgradeFinalise {
                crc: word_sum(0, &data),
            },
        )
        .unwrap();

        assert_eq!(probe.upgrade().blocks(), 1);
        let flash = flash.0.borrow();
        assert!(flash.marked);
        assert_eq!(flash.erased, 1);
        assert_eq!(&flash.image[..FLASH_BUFFER_SIZE], &data);
    }
}
