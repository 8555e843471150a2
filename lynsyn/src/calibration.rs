//! Two-point calibration of the current sense channels.
//!
//! Each channel is calibrated by feeding it a known low and a known high reference current. The
//! average ADC reading at both points gives a line, whose offset and inverse slope are stored in
//! the [`ConfigStore`] as `offset{n}` and `gain{n}`. The host applies them to the raw codes it
//! receives.

use serde::{Deserialize, Serialize};

use crate::{
    config::{ConfigError, ConfigStore},
    sampling::{AdcSource, CHANNELS},
};

/// Scans averaged per calibration point and per ADC self test.
pub const CALIBRATION_SCANS: usize = 1024;

/// Errors of the calibration procedure.
#[derive(Debug, thiserror::Error, docsplay::Display)]
pub enum CalibrationError {
    /// Channel {channel} read {actual}, which is more than {max_deviation} away from the expected {wanted}.
    OutOfRange {
        channel: usize,
        wanted: i64,
        actual: i64,
        max_deviation: u32,
    },

    /// There is no channel {0}.
    BadChannel(usize),

    /// Channel {0} has no low reference point, calibrate the low point first.
    MissingLowReference(usize),

    /// The reference points of channel {0} are equal.
    ZeroSpan(usize),

    /// The measured slope of channel {0} is not usable.
    NonFiniteSlope(usize),

    /// Storing the calibration failed
    Config(#[from] ConfigError),
}

/// Accepted calibration measurements.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CalibrationLimits {
    /// How far the average reading may be from the reference, in ADC codes.
    pub max_deviation: u32,
    /// Scans averaged per point.
    pub scans: usize,
}

impl Default for CalibrationLimits {
    fn default() -> Self {
        Self {
            max_deviation: 1024,
            scans: CALIBRATION_SCANS,
        }
    }
}

/// Which reference point a CAL request measures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CalibrationPoint {
    /// The low reference. Only remembered.
    Low,
    /// The high reference. Completes the calibration of the channel.
    High,
}

/// Offset and gain of one channel.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChannelCalibration {
    /// ADC code at zero current.
    pub offset: f64,
    /// Reference units per ADC code.
    pub gain: f64,
}

impl Default for ChannelCalibration {
    fn default() -> Self {
        Self {
            offset: 0.0,
            gain: 1.0,
        }
    }
}

/// Key of the offset of `channel`.
pub fn offset_key(channel: usize) -> String {
    format!("offset{channel}")
}

/// Key of the gain of `channel`.
pub fn gain_key(channel: usize) -> String {
    format!("gain{channel}")
}

/// Key of the hardware version.
pub const HW_VERSION_KEY: &str = "hwver";

#[derive(Debug, Clone, Copy, PartialEq)]
struct Reference {
    wanted: i64,
    actual: i64,
}

/// Averages `scans` ADC scans per channel.
pub fn average_scans(adc: &mut impl AdcSource, scans: usize) -> [i64; CHANNELS] {
    let mut sums = [0i64; CHANNELS];
    for _ in 0..scans {
        let currents = adc.scan();
        for (sum, current) in sums.iter_mut().zip(currents) {
            *sum += i64::from(current);
        }
    }

    let scans = scans.max(1) as i64;
    sums.map(|sum| sum / scans)
}

/// Runs the calibration requests of the host.
#[derive(Debug, Clone)]
pub struct Calibrator {
    limits: CalibrationLimits,
    low: [Option<Reference>; CHANNELS],
}

impl Calibrator {
    /// Creates a calibrator without any low reference.
    pub fn new(limits: CalibrationLimits) -> Self {
        Self {
            limits,
            low: [None; CHANNELS],
        }
    }

    /// Measures one reference point on `channel`.
    ///
    /// `reference` is the value the host expects, in twice the ADC resolution. After the high
    /// point the channel's offset and gain are stored and returned.
    #[tracing::instrument(skip(self, adc, store))]
    pub fn calibrate(
        &mut self,
        adc: &mut impl AdcSource,
        store: &mut impl ConfigStore,
        channel: usize,
        reference: i32,
        point: CalibrationPoint,
    ) -> Result<Option<ChannelCalibration>, CalibrationError> {
        if channel >= CHANNELS {
            return Err(CalibrationError::BadChannel(channel));
        }

        let measured = Reference {
            wanted: i64::from(reference >> 1),
            actual: average_scans(adc, self.limits.scans)[channel],
        };
        tracing::debug!(
            "Channel {} reads {} for {}",
            channel,
            measured.actual,
            measured.wanted
        );

        if measured.wanted.abs_diff(measured.actual) > u64::from(self.limits.max_deviation) {
            return Err(CalibrationError::OutOfRange {
                channel,
                wanted: measured.wanted,
                actual: measured.actual,
                max_deviation: self.limits.max_deviation,
            });
        }

        match point {
            CalibrationPoint::Low => {
                self.low[channel] = Some(measured);
                Ok(None)
            }
            CalibrationPoint::High => {
                let low = self.low[channel].ok_or(CalibrationError::MissingLowReference(channel))?;
                let calibration = Self::fit(channel, low, measured)?;

                tracing::info!(
                    "Calibrating ADC channel {} (offset {} gain {})",
                    channel,
                    calibration.offset,
                    calibration.gain
                );
                set_calibration(store, channel, calibration)?;
                Ok(Some(calibration))
            }
        }
    }

    fn fit(
        channel: usize,
        low: Reference,
        high: Reference,
    ) -> Result<ChannelCalibration, CalibrationError> {
        let span = (high.wanted - low.wanted) as f64;
        if span == 0.0 {
            return Err(CalibrationError::ZeroSpan(channel));
        }

        let slope = (high.actual - low.actual) as f64 / span;
        let gain = 1.0 / slope;
        if !slope.is_normal() || !gain.is_finite() {
            return Err(CalibrationError::NonFiniteSlope(channel));
        }

        Ok(ChannelCalibration {
            offset: high.actual as f64 - slope * high.wanted as f64,
            gain,
        })
    }
}

/// Stores the calibration of `channel`, as done by the CAL_SET request.
pub fn set_calibration(
    store: &mut impl ConfigStore,
    channel: usize,
    calibration: ChannelCalibration,
) -> Result<(), CalibrationError> {
    if channel >= CHANNELS {
        return Err(CalibrationError::BadChannel(channel));
    }

    store.set_f64(&offset_key(channel), calibration.offset)?;
    store.set_f64(&gain_key(channel), calibration.gain)?;
    Ok(())
}

/// Reads the calibration of every channel. Missing values read as 0.
pub fn calibration_info(store: &impl ConfigStore) -> [ChannelCalibration; CHANNELS] {
    std::array::from_fn(|channel| ChannelCalibration {
        offset: store.get_f64(&offset_key(channel)).unwrap_or(0.0),
        gain: store.get_f64(&gain_key(channel)).unwrap_or(0.0),
    })
}

/// Wipes the store and writes the hardware version and a neutral calibration.
pub fn hw_init(store: &mut impl ConfigStore, hw_version: u8) -> Result<(), CalibrationError> {
    tracing::info!("Init non-volatile memory, version {:#x}", hw_version);

    store.clear()?;
    store.set_u32(HW_VERSION_KEY, u32::from(hw_version))?;
    for channel in 0..CHANNELS {
        set_calibration(store, channel, ChannelCalibration::default())?;
    }
    Ok(())
}
