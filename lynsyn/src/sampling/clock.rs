//! The 64-bit sample clock.

use std::cell::Cell;

use critical_section::Mutex;

use super::hal::CycleCounter;

#[derive(Debug, Clone, Copy, Default)]
struct Widening {
    last_low: u32,
    high: u32,
}

/// Extends a free running 32-bit cycle counter to a monotonic 64-bit timestamp.
///
/// The counter has to be read at least once per wrap period for wraps to be detected.
#[derive(Debug)]
pub struct Timestamp<C> {
    counter: C,
    state: Mutex<Cell<Widening>>,
}

impl<C: CycleCounter> Timestamp<C> {
    /// Starts widening `counter`.
    pub fn new(counter: C) -> Self {
        Self {
            counter,
            state: Mutex::new(Cell::new(Widening::default())),
        }
    }

    /// The current time in cycles.
    pub fn now(&self) -> i64 {
        let low = self.counter.cycles();

        // The update of the high word must not interleave with another reader.
        let high = critical_section::with(|cs| {
            let cell = self.state.borrow(cs);
            let mut state = cell.get();
            if low < state.last_low {
                state.high = state.high.wrapping_add(1);
            }
            state.last_low = low;
            cell.set(state);
            state.high
        });

        (u64::from(high) << 32 | u64::from(low)) as i64
    }

    /// The widened counter.
    pub fn counter(&self) -> &C {
        &self.counter
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sampling::hal::fake::SteppingCounter;

    #[test]
    fn follows_the_counter() {
        let clock = Timestamp::new(SteppingCounter::new(100, 10));

        assert_eq!(clock.now(), 100);
        assert_eq!(clock.now(), 110);
    }

    #[test]
    fn wraps_into_the_high_word() {
        let clock = Timestamp::new(SteppingCounter::new(0xFFFF_FFF0, 0x10));

        assert_eq!(clock.now(), 0xFFFF_FFF0);
        assert_eq!(clock.now(), 0x1_0000_0000);
        assert_eq!(clock.now(), 0x1_0000_0010);

        clock.counter().set(0xFFFF_FFFF);
        assert_eq!(clock.now(), 0x1_FFFF_FFFF);
        assert_eq!(clock.now(), 0x2_0000_000F);
    }
}
