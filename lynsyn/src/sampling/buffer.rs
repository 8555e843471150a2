//! Sample records and the double buffer they are collected in.

use super::hal::{Currents, SampleSink};
use crate::target::MAX_CORES;

/// Records per transfer to the host.
pub const MAX_SAMPLES: usize = 32;

/// Set on the record of the tick in which a frame ended. `pc[0]` then holds the frame end time.
pub const FRAME_DONE: u16 = 1;

/// The time of the last record of a capture.
pub const END_OF_CAPTURE: i64 = -1;

/// One sample: a timestamp, the program counter of every core and the current of every channel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SampleRecord {
    /// Cycle count at the start of the tick, or [`END_OF_CAPTURE`].
    pub time: i64,
    /// Program counter per core.
    pub pc: [u64; MAX_CORES],
    /// Raw ADC code per channel.
    pub current: Currents,
    /// [`FRAME_DONE`] or 0.
    pub flags: u16,
}

impl SampleRecord {
    /// Whether this record closes a capture.
    pub fn is_end_of_capture(&self) -> bool {
        self.time == END_OF_CAPTURE
    }

    /// Whether a frame ended in this tick.
    pub fn frame_done(&self) -> bool {
        self.flags & FRAME_DONE != 0
    }
}

/// Two record buffers used in turn.
///
/// Records go into the active buffer. Once it is full, or a record ends the capture, the buffer
/// is handed to the sink and the other buffer becomes active. The sink blocks until the
/// transfer is done, so a buffer is never refilled while it is still being sent.
#[derive(Debug)]
pub struct SampleBuffers {
    buffers: [[SampleRecord; MAX_SAMPLES]; 2],
    active: usize,
    len: usize,
}

impl Default for SampleBuffers {
    fn default() -> Self {
        Self {
            buffers: [[SampleRecord::default(); MAX_SAMPLES]; 2],
            active: 0,
            len: 0,
        }
    }
}

impl SampleBuffers {
    /// Creates empty buffers.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records waiting in the active buffer.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the active buffer is empty.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Appends `record`, handing the buffer to `sink` when it is full or `record` ends the
    /// capture. Returns whether the buffer was sent.
    pub fn push(&mut self, record: SampleRecord, sink: &mut impl SampleSink) -> bool {
        self.buffers[self.active][self.len] = record;
        self.len += 1;

        if self.len >= MAX_SAMPLES || record.is_end_of_capture() {
            self.flush(sink);
            true
        } else {
            false
        }
    }

    /// Sends the records of the active buffer and swaps buffers.
    pub fn flush(&mut self, sink: &mut impl SampleSink) {
        if self.len == 0 {
            return;
        }

        tracing::trace!("Sending {} samples from buffer {}", self.len, self.active);
        sink.send_samples(&self.buffers[self.active][..self.len]);

        self.active ^= 1;
        self.len = 0;
    }

    /// Drops the records of the active buffer.
    pub fn discard(&mut self) {
        self.len = 0;
    }
}
