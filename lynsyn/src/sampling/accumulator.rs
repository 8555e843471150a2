//! Background current averaging while no capture runs.

use std::cell::RefCell;

use critical_section::Mutex;

use super::hal::{Currents, CHANNELS};

#[derive(Debug, Clone, Copy, Default)]
struct Accumulated {
    sum: [i64; CHANNELS],
    count: u32,
    instant: Currents,
}

/// Per-channel current sums since the last query.
///
/// Scans are added from the main loop and the average is taken from the host query path, which
/// may run in interrupt context. Both sides go through a critical section.
#[derive(Debug)]
pub struct IdleCurrent {
    state: Mutex<RefCell<Accumulated>>,
}

impl Default for IdleCurrent {
    fn default() -> Self {
        Self::new()
    }
}

impl IdleCurrent {
    /// Creates an empty accumulator.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(RefCell::new(Accumulated::default())),
        }
    }

    /// Adds one scan.
    pub fn accumulate(&self, currents: &Currents) {
        critical_section::with(|cs| {
            let mut state = self.state.borrow_ref_mut(cs);
            for (sum, current) in state.sum.iter_mut().zip(currents) {
                *sum += i64::from(*current);
            }
            state.count = state.count.saturating_add(1);
            state.instant = *currents;
        });
    }

    /// The last scan added.
    pub fn instant(&self) -> Currents {
        critical_section::with(|cs| self.state.borrow_ref(cs).instant)
    }

    /// Number of scans added since the last [`IdleCurrent::take_average`].
    pub fn count(&self) -> u32 {
        critical_section::with(|cs| self.state.borrow_ref(cs).count)
    }

    /// The average of the scans added since the last call, and resets the sums.
    ///
    /// Without any scan since the last call the last instantaneous value is returned.
    pub fn take_average(&self) -> Currents {
        critical_section::with(|cs| {
            let mut state = self.state.borrow_ref_mut(cs);
            if state.count == 0 {
                return state.instant;
            }

            let count = i64::from(state.count);
            let mut average = [0; CHANNELS];
            for (average, sum) in average.iter_mut().zip(&state.sum) {
                *average = (*sum / count) as i16;
            }

            state.sum = [0; CHANNELS];
            state.count = 0;
            average
        })
    }
}
