//! The sampling engine.
//!
//! A capture correlates the current drawn by the board with the program counters of the target
//! cores. Every [`SamplingEngine::tick`] of a capture produces at most one [`SampleRecord`]:
//! the time, one ADC scan of all channels and, if requested, one program counter per core.
//! Records are collected in [`SampleBuffers`] and handed to the [`SampleSink`] in batches of
//! [`MAX_SAMPLES`]. The last record of a capture has its time set to [`END_OF_CAPTURE`].
//!
//! A capture ends either when its period has elapsed or when the stop core halts on the stop
//! breakpoint. In between captures the engine averages the current in the background, see
//! [`IdleCurrent`].

pub mod accumulator;
pub mod buffer;
pub mod clock;
pub mod hal;

use bitflags::bitflags;
use embedded_hal::digital::{Error as _, ErrorKind, InputPin, OutputPin};

pub use self::{
    accumulator::IdleCurrent,
    buffer::{SampleBuffers, SampleRecord, END_OF_CAPTURE, FRAME_DONE, MAX_SAMPLES},
    clock::Timestamp,
    hal::{AdcSource, Currents, CycleCounter, SampleSink, CHANNELS},
};
use crate::{
    architecture::arm::core::CoreError,
    poll::{poll_until, PollBudgets, Timeout},
    probe::JtagMuxSelect,
    target::{BreakpointSlot, DebugTarget},
};

bitflags! {
    /// Mode of a capture, as sent with the START_SAMPLING request.
    #[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
    pub struct SamplingFlags: u64 {
        /// Sample the program counters of the cores.
        const SAMPLE_PC = 1 << 0;
        /// Run to the start breakpoint before sampling.
        const START_BP = 1 << 1;
        /// Only record while the trigger input is high.
        const GPIO = 1 << 2;
        /// Stop when the sample period has elapsed instead of at the stop breakpoint.
        const PERIOD = 1 << 3;
        /// Report the background average instead of a fresh scan. Only used by single samples.
        const AVERAGE = 1 << 4;
    }
}

impl SamplingFlags {
    /// Parses the flags of a request. Unknown bits are dropped.
    pub fn new(bits: u64) -> Self {
        let flags = SamplingFlags::from_bits_truncate(bits);
        if flags.bits() != bits {
            tracing::warn!("Unknown sampling flag bits: {:#x}", bits);
        }
        flags
    }
}

/// Set in a single sample when the stop core was halted.
pub const SAMPLE_HALTED: u16 = 1 << 1;

/// Set in a single sample when the program counters could not be read.
pub const SAMPLE_INVALID: u16 = 1 << 2;

/// Errors of the sampling engine.
///
/// A capture that fails is abandoned: the JTAG port is handed back to the external debugger and
/// the engine returns to [`SamplingState::Idle`] before the error is returned.
#[derive(Debug, thiserror::Error, docsplay::Display)]
pub enum SamplingError {
    /// Debug target error
    Core(#[from] CoreError),

    /// {0}
    Timeout(#[from] Timeout),

    /// Trigger or LED pin access failed: {0:?}
    Pin(ErrorKind),
}

fn pin_error(error: impl embedded_hal::digital::Error) -> SamplingError {
    SamplingError::Pin(error.kind())
}

/// What the engine is doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SamplingState {
    /// No capture runs. Scans go into the background average.
    Idle,
    /// A capture runs.
    Sampling,
}

#[derive(Debug, Clone, Copy)]
struct Capture {
    flags: SamplingFlags,
    deadline: i64,
    samples: u32,
}

impl Capture {
    fn sample_pc(&self) -> bool {
        self.flags.contains(SamplingFlags::SAMPLE_PC)
    }

    fn gpio(&self) -> bool {
        self.flags.contains(SamplingFlags::GPIO)
    }

    fn stops_at_breakpoint(&self) -> bool {
        !self.flags.contains(SamplingFlags::PERIOD)
    }
}

/// The hardware the engine drives, apart from the debug target.
#[derive(Debug)]
pub struct Peripherals<A, C, S, P, L> {
    /// Current sense ADC.
    pub adc: A,
    /// Sample clock.
    pub clock: Timestamp<C>,
    /// Receives the finished sample buffers.
    pub sink: S,
    /// External trigger input.
    pub trigger: P,
    /// Lit while a capture runs.
    pub led: L,
}

/// The capture state machine.
#[derive(Debug)]
pub struct SamplingEngine<A, C, S, P, L> {
    io: Peripherals<A, C, S, P, L>,
    budgets: PollBudgets,
    capture: Option<Capture>,
    start_core: usize,
    stop_core: usize,
    frame_breakpoint: Option<u64>,
    buffers: SampleBuffers,
    idle: IdleCurrent,
}

impl<A, C, S, P, L> SamplingEngine<A, C, S, P, L>
where
    A: AdcSource,
    C: CycleCounter,
    S: SampleSink,
    P: InputPin,
    L: OutputPin,
{
    /// Creates an idle engine.
    pub fn new(io: Peripherals<A, C, S, P, L>, budgets: PollBudgets) -> Self {
        Self {
            io,
            budgets,
            capture: None,
            start_core: 0,
            stop_core: 0,
            frame_breakpoint: None,
            buffers: SampleBuffers::new(),
            idle: IdleCurrent::new(),
        }
    }

    /// What the engine is doing.
    pub fn state(&self) -> SamplingState {
        if self.capture.is_some() {
            SamplingState::Sampling
        } else {
            SamplingState::Idle
        }
    }

    /// The peripherals.
    pub fn peripherals(&self) -> &Peripherals<A, C, S, P, L> {
        &self.io
    }

    /// The peripherals, mutably. Calibration and the self tests scan the ADC through this.
    pub fn peripherals_mut(&mut self) -> &mut Peripherals<A, C, S, P, L> {
        &mut self.io
    }

    /// The background current average.
    pub fn idle_current(&self) -> &IdleCurrent {
        &self.idle
    }

    /// The core that runs to the start breakpoint and carries the frame breakpoint.
    pub fn start_core(&self) -> usize {
        self.start_core
    }

    /// The core whose halt ends a capture in breakpoint mode.
    pub fn stop_core(&self) -> usize {
        self.stop_core
    }

    /// The address of the frame breakpoint, if one was requested.
    pub fn frame_breakpoint(&self) -> Option<u64> {
        self.frame_breakpoint
    }

    /// Forgets all breakpoint requests. A freshly discovered target has every comparator
    /// cleared and core 0 as its stop core.
    pub fn reset_breakpoints(&mut self) {
        self.start_core = 0;
        self.stop_core = 0;
        self.frame_breakpoint = None;
    }

    /// Handles a BREAKPOINT request.
    ///
    /// The start and stop breakpoints are programmed right away, and `core` becomes the start or
    /// stop core. The frame breakpoint is only remembered and gets armed on the start core when
    /// a capture starts at the start breakpoint.
    #[tracing::instrument(skip(self, target))]
    pub fn set_breakpoint_request(
        &mut self,
        target: &mut impl DebugTarget,
        core: usize,
        slot: BreakpointSlot,
        addr: u64,
    ) -> Result<(), SamplingError> {
        match slot {
            BreakpointSlot::Start => {
                target.select_jtag(JtagMuxSelect::Internal)?;
                target.set_breakpoint(core, slot, addr)?;
                self.start_core = core;
                tracing::info!("Set start BP {:#x} on core {}", addr, core);
            }
            BreakpointSlot::Stop => {
                target.select_jtag(JtagMuxSelect::Internal)?;
                target.set_stop_core(core)?;
                target.set_breakpoint(core, slot, addr)?;
                self.stop_core = core;
                tracing::info!("Set stop BP {:#x} on core {}", addr, core);
            }
            BreakpointSlot::Frame => {
                self.frame_breakpoint = Some(addr);
                tracing::info!("Set frame BP {:#x}", addr);
            }
        }

        Ok(())
    }

    /// Starts a capture.
    ///
    /// With [`SamplingFlags::START_BP`] the cores are resumed and the call blocks until the start
    /// core halts on the start breakpoint. The start breakpoint is then replaced by the frame
    /// breakpoint and the cores are resumed again. The capture period starts counting after
    /// that.
    ///
    /// Starting a capture while another one runs replaces it. Records of the old capture that
    /// were not sent yet are dropped.
    #[tracing::instrument(skip(self, target))]
    pub fn start_sampling(
        &mut self,
        target: &mut impl DebugTarget,
        period: i64,
        flags: SamplingFlags,
    ) -> Result<(), SamplingError> {
        tracing::info!("Starting sample mode ({:?})", flags);

        if self.capture.take().is_some() {
            tracing::warn!("Restarting a running capture");
            self.buffers.discard();
        }

        let result = self.arm(target, period, flags);
        if result.is_err() {
            self.abort(target);
        }
        result
    }

    fn arm(
        &mut self,
        target: &mut impl DebugTarget,
        period: i64,
        flags: SamplingFlags,
    ) -> Result<(), SamplingError> {
        target.select_jtag(JtagMuxSelect::Internal)?;
        self.io.led.set_high().map_err(pin_error)?;

        if flags.contains(SamplingFlags::START_BP) {
            target.resume_all()?;

            let start_core = self.start_core;
            poll_until(
                "start breakpoint",
                self.budgets.start_breakpoint,
                || -> Result<_, SamplingError> {
                    Ok(target.core_halted(start_core)?.then_some(()))
                },
            )?;
            tracing::debug!("Core {} reached the start breakpoint", start_core);

            target.clear_breakpoint(start_core, BreakpointSlot::Start)?;
            if let Some(frame) = self.frame_breakpoint {
                target.set_breakpoint(start_core, BreakpointSlot::Frame, frame)?;
            }
            target.resume_all()?;
        }

        self.capture = Some(Capture {
            flags,
            deadline: self.io.clock.now().saturating_add(period),
            samples: 0,
        });

        Ok(())
    }

    /// Runs one iteration of the main loop.
    ///
    /// While a capture runs this takes one sample. Otherwise one scan is added to the background
    /// average.
    pub fn tick(&mut self, target: &mut impl DebugTarget) -> Result<(), SamplingError> {
        let Some(capture) = self.capture else {
            self.idle_tick();
            return Ok(());
        };

        let result = self.sample_tick(target, capture);
        if result.is_err() {
            self.abort(target);
        }
        result
    }

    fn idle_tick(&mut self) {
        let currents = self.io.adc.scan();
        self.idle.accumulate(&currents);
    }

    fn sample_tick(
        &mut self,
        target: &mut impl DebugTarget,
        mut capture: Capture,
    ) -> Result<(), SamplingError> {
        let now = self.io.clock.now();
        let mut record = SampleRecord::default();
        let mut halted = false;
        let mut send = !capture.gpio();

        if capture.gpio() && self.io.trigger.is_low().map_err(pin_error)? {
            // Outside the trigger window only the stop condition is checked.
            halted = if capture.stops_at_breakpoint() {
                target.core_halted(self.stop_core)?
            } else {
                now >= capture.deadline
            };
        } else {
            record.time = now;

            self.io.adc.start_scan();
            let pcs = if capture.sample_pc() {
                self.sample_pcs(target, &mut record)
            } else {
                Ok(false)
            };
            record.current = self.io.adc.wait_scan();
            halted = pcs?;

            if !capture.stops_at_breakpoint() {
                halted = now >= capture.deadline;
            }

            if capture.gpio() && self.io.trigger.is_high().map_err(pin_error)? {
                send = true;
            }
        }

        if halted {
            send = true;
            record.time = END_OF_CAPTURE;
            self.finish_capture(target, &capture)?;
        }

        if send {
            capture.samples += 1;
            if record.frame_done() {
                record.pc[0] = self.io.clock.now() as u64;
            }
            self.buffers.push(record, &mut self.io.sink);
        }

        if !halted {
            self.capture = Some(capture);
        }

        Ok(())
    }

    /// Reads the program counters into `record` and handles a frame end. Returns whether the
    /// stop core is halted.
    fn sample_pcs(
        &mut self,
        target: &mut impl DebugTarget,
        record: &mut SampleRecord,
    ) -> Result<bool, SamplingError> {
        let sample = target.sample_pcs()?;
        record.pc = sample.pcs;

        if !sample.halted {
            return Ok(false);
        }

        let Some(frame) = self.frame_breakpoint else {
            return Ok(true);
        };

        if target.read_halted_pc(self.start_core)? != frame {
            return Ok(true);
        }

        tracing::trace!("Frame done on core {}", self.start_core);
        target.clear_breakpoint(self.start_core, BreakpointSlot::Frame)?;
        target.resume_all()?;
        target.set_breakpoint(self.start_core, BreakpointSlot::Frame, frame)?;
        record.flags = FRAME_DONE;

        Ok(false)
    }

    /// Leaves sample mode after the last record of a capture.
    fn finish_capture(
        &mut self,
        target: &mut impl DebugTarget,
        capture: &Capture,
    ) -> Result<(), SamplingError> {
        self.capture = None;

        if capture.stops_at_breakpoint() {
            target.clear_breakpoint(self.stop_core, BreakpointSlot::Stop)?;
            target.resume_all()?;
        }

        target.select_jtag(JtagMuxSelect::External)?;
        self.io.led.set_low().map_err(pin_error)?;

        tracing::info!("Exiting sample mode, {} samples", capture.samples);

        Ok(())
    }

    /// Gives up on the current capture after an error.
    fn abort(&mut self, target: &mut impl DebugTarget) {
        self.capture = None;
        self.buffers.discard();

        if let Err(error) = target.select_jtag(JtagMuxSelect::External) {
            tracing::warn!("Failed to release the JTAG port: {}", error);
        }
        if self.io.led.set_low().is_err() {
            tracing::warn!("Failed to switch off the sampling LED");
        }
    }

    /// Takes a single sample outside of a capture.
    ///
    /// With [`SamplingFlags::AVERAGE`] the current is the background average since the last
    /// query, otherwise a fresh scan. Program counters that cannot be read are reported with
    /// [`SAMPLE_INVALID`] instead of an error.
    pub fn get_sample(
        &mut self,
        target: &mut impl DebugTarget,
        flags: SamplingFlags,
    ) -> SampleRecord {
        let mut record = SampleRecord {
            time: self.io.clock.now(),
            ..Default::default()
        };

        if flags.contains(SamplingFlags::SAMPLE_PC) {
            match target.sample_pcs() {
                Ok(sample) => {
                    record.pc = sample.pcs;
                    if sample.halted {
                        record.flags |= SAMPLE_HALTED;
                    }
                }
                Err(error) => {
                    tracing::debug!("PC sampling failed: {}", error);
                    record.flags |= SAMPLE_INVALID;
                }
            }
        }

        record.current = if flags.contains(SamplingFlags::AVERAGE) {
            self.idle.take_average()
        } else {
            self.io.adc.scan()
        };

        record
    }
}
