//! The peripherals the sampling engine runs on.
//!
//! The trigger input and the status LED are plain `embedded-hal` pins. The ADC, the cycle
//! counter and the USB sample stream have no `embedded-hal` abstraction and get their own traits.

use super::buffer::SampleRecord;

/// Number of current sensor channels.
pub const CHANNELS: usize = 7;

/// One raw ADC code per channel.
pub type Currents = [i16; CHANNELS];

/// The current sense ADC.
///
/// A scan converts all channels. It runs in the background between [`AdcSource::start_scan`]
/// and [`AdcSource::wait_scan`].
pub trait AdcSource {
    /// Starts a scan of all channels.
    fn start_scan(&mut self);

    /// Blocks until the scan started last is complete and returns the codes.
    fn wait_scan(&mut self) -> Currents;

    /// Runs a complete scan.
    fn scan(&mut self) -> Currents {
        self.start_scan();
        self.wait_scan()
    }
}

impl<T: AdcSource + ?Sized> AdcSource for &mut T {
    fn start_scan(&mut self) {
        (**self).start_scan()
    }

    fn wait_scan(&mut self) -> Currents {
        (**self).wait_scan()
    }
}

/// A free running 32-bit cycle counter.
pub trait CycleCounter {
    /// The current counter value.
    fn cycles(&self) -> u32;
}

impl<T: CycleCounter + ?Sized> CycleCounter for &T {
    fn cycles(&self) -> u32 {
        (**self).cycles()
    }
}

/// Where finished sample buffers go.
pub trait SampleSink {
    /// Sends `samples` to the host, blocking until the transfer is done.
    fn send_samples(&mut self, samples: &[SampleRecord]);
}

impl<T: SampleSink + ?Sized> SampleSink for &mut T {
    fn send_samples(&mut self, samples: &[SampleRecord]) {
        (**self).send_samples(samples)
    }
}

#[cfg(any(test, feature = "test"))]
pub mod fake {
    #![allow(missing_docs)]
    //! Peripherals for exercising the engine off-target.

    use std::{
        cell::Cell,
        collections::VecDeque,
        convert::Infallible,
    };

    use embedded_hal::digital::{ErrorType, InputPin, OutputPin};

    use super::*;

    /// A cycle counter that advances by a fixed step on every read.
    #[derive(Debug)]
    pub struct SteppingCounter {
        value: Cell<u32>,
        step: u32,
    }

    impl SteppingCounter {
        pub fn new(start: u32, step: u32) -> Self {
            Self {
                value: Cell::new(start),
                step,
            }
        }

        pub fn set(&self, value: u32) {
            self.value.set(value);
        }
    }

    impl CycleCounter for SteppingCounter {
        fn cycles(&self) -> u32 {
            let value = self.value.get();
            self.value.set(value.wrapping_add(self.step));
            value
        }
    }

    /// An ADC returning scripted scans. The last scan repeats.
    #[derive(Debug, Default)]
    pub struct ScriptedAdc {
        scans: VecDeque<Currents>,
        started: usize,
        pending: bool,
    }

    impl ScriptedAdc {
        pub fn new(scans: impl IntoIterator<Item = Currents>) -> Self {
            Self {
                scans: scans.into_iter().collect(),
                ..Default::default()
            }
        }

        /// Number of scans started.
        pub fn started(&self) -> usize {
            self.started
        }
    }

    impl AdcSource for ScriptedAdc {
        fn start_scan(&mut self) {
            self.started += 1;
            self.pending = true;
        }

        fn wait_scan(&mut self) -> Currents {
            assert!(self.pending, "waited for a scan that was never started");
            self.pending = false;

            if self.scans.len() > 1 {
                self.scans.pop_front().unwrap_or_default()
            } else {
                self.scans.front().copied().unwrap_or_default()
            }
        }
    }

    /// Collects every record sent, and the size of every transfer.
    #[derive(Debug, Default)]
    pub struct RecordingSink {
        pub records: Vec<SampleRecord>,
        pub transfers: Vec<usize>,
    }

    impl SampleSink for RecordingSink {
        fn send_samples(&mut self, samples: &[SampleRecord]) {
            self.transfers.push(samples.len());
            self.records.extend_from_slice(samples);
        }
    }

    /// A digital input with a scripted level per read. The last level repeats.
    #[derive(Debug, Default)]
    pub struct ScriptedPin {
        levels: VecDeque<bool>,
    }

    impl ScriptedPin {
        pub fn new(levels: impl IntoIterator<Item = bool>) -> Self {
            Self {
                levels: levels.into_iter().collect(),
            }
        }
    }

    impl ErrorType for ScriptedPin {
        type Error = Infallible;
    }

    impl InputPin for ScriptedPin {
        fn is_high(&mut self) -> Result<bool, Self::Error> {
            Ok(if self.levels.len() > 1 {
                self.levels.pop_front().unwrap_or(false)
            } else {
                self.levels.front().copied().unwrap_or(false)
            })
        }

        fn is_low(&mut self) -> Result<bool, Self::Error> {
            self.is_high().map(|high| !high)
        }
    }

    /// An output that remembers its level.
    #[derive(Debug, Default)]
    pub struct Led {
        pub on: bool,
    }

    impl ErrorType for Led {
        type Error = Infallible;
    }

    impl OutputPin for Led {
        fn set_low(&mut self) -> Result<(), Self::Error> {
            self.on = false;
            Ok(())
        }

        fn set_high(&mut self) -> Result<(), Self::Error> {
            self.on = true;
            Ok(())
        }
    }
}
