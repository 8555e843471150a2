//! Recorded scan programs.
//!
//! Reading the program counters of all cores on every sampling tick would mean building the same
//! JTAG sequences over and over. Instead the reads are recorded once into a [`ScanProgram`] and
//! handed to the backend, which can replay it without involving the upper layers. The FPGA
//! sequencer keeps the program in its own memory, the bit-bang backend replays it in software.
//!
//! Each [`ProgramCommand`] covers one DR transaction of the recorded sequence:
//!
//! ```text
//! init ........ repeat ........ ack ... ack+3 ........ end
//! |  IR scan   |  DR prescan   | ACK  |  data + postscan |
//! ```
//!
//! The `init` part is clocked once. The `repeat` part is clocked until the acknowledge field
//! stops reporting WAIT.

use bitvec::slice::BitSlice;

use crate::probe::{
    common::bits_to_word, scan_chain::IrState, Bits, JtagBackend, JtagError, JtagSequence,
};

/// Acknowledge field value for a transaction that completed.
pub const JTAG_STATUS_OK: u8 = 0b010;
/// Acknowledge field value for a transaction that has to be retried.
pub const JTAG_STATUS_WAIT: u8 = 0b001;

/// One transaction of a [`ScanProgram`], as bit positions into the recorded sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgramCommand {
    /// Whether the 32 bits following the acknowledge field are returned.
    pub read: bool,
    /// First bit of the part clocked once.
    pub init: usize,
    /// First bit of the part repeated while the target answers WAIT.
    pub repeat: usize,
    /// Position of the 3-bit acknowledge field.
    pub ack: usize,
    /// One past the last bit of the command.
    pub end: usize,
}

/// A recorded sequence together with the transactions it consists of.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanProgram {
    sequence: JtagSequence,
    commands: Vec<ProgramCommand>,
    wait_retries: usize,
    ir_state: IrState,
}

impl ScanProgram {
    /// Creates an empty program. Each command is retried at most `wait_retries` times.
    pub fn new(wait_retries: usize) -> Self {
        Self {
            sequence: JtagSequence::new(),
            commands: Vec::new(),
            wait_retries,
            ir_state: None,
        }
    }

    /// The instruction the chain holds after the recorded sequence.
    pub(crate) fn ir_state(&self) -> IrState {
        self.ir_state
    }

    pub(crate) fn set_ir_state(&mut self, state: IrState) {
        self.ir_state = state;
    }

    /// The recorded sequence.
    pub fn sequence(&self) -> &JtagSequence {
        &self.sequence
    }

    /// The sequence new commands are recorded into.
    pub fn sequence_mut(&mut self) -> &mut JtagSequence {
        &mut self.sequence
    }

    /// The recorded transactions.
    pub fn commands(&self) -> &[ProgramCommand] {
        &self.commands
    }

    /// How often a transaction answered with WAIT is retried.
    pub fn wait_retries(&self) -> usize {
        self.wait_retries
    }

    /// Number of words a run of the program returns.
    pub fn read_count(&self) -> usize {
        self.commands.iter().filter(|command| command.read).count()
    }

    /// Number of TDO bits the sequencer returns for one run: the acknowledge field of every
    /// command and the data of every reading command.
    pub fn captured_bits(&self) -> usize {
        self.commands
            .iter()
            .map(|command| if command.read { 35 } else { 3 })
            .sum()
    }

    /// Appends a transaction. Positions are bit offsets into [`ScanProgram::sequence`].
    pub fn push_command(&mut self, command: ProgramCommand) {
        debug_assert!(command.init <= command.repeat);
        debug_assert!(command.repeat <= command.ack);
        debug_assert!(command.ack + 3 <= command.end);
        debug_assert!(command.end <= self.sequence.len());

        self.commands.push(command);
    }

    /// Replays the program through `backend`, retrying commands answered with WAIT.
    pub fn replay<B: JtagBackend + ?Sized>(&self, backend: &mut B) -> Result<Vec<u32>, JtagError> {
        let mut words = Vec::with_capacity(self.read_count());

        for (index, command) in self.commands.iter().enumerate() {
            if command.repeat > command.init {
                backend.write_sequence(&self.sequence.slice(command.init..command.repeat))?;
            }

            let repeated = self.sequence.slice(command.repeat..command.end);
            let ack_offset = command.ack - command.repeat;

            let mut attempts = 0;
            let tdo = loop {
                let tdo = backend.read_write_sequence(&repeated)?;
                attempts += 1;

                if ack_of(&tdo, ack_offset) != JTAG_STATUS_WAIT {
                    break tdo;
                }
                if attempts >= self.wait_retries {
                    return Err(JtagError::ProgramWaitLimit {
                        command: index,
                        attempts,
                    });
                }
            };

            let ack = ack_of(&tdo, ack_offset);
            if ack != JTAG_STATUS_OK {
                return Err(JtagError::ProgramFault {
                    command: index,
                    ack,
                });
            }

            if command.read {
                words.push(bits_to_word(tdo.get(ack_offset + 3..).unwrap_or(BitSlice::empty())));
            }
        }

        Ok(words)
    }

    /// Splits the compact capture returned by the FPGA sequencer into words.
    ///
    /// The sequencer only keeps the bits that matter: the 32 data bits of every reading command,
    /// followed by that command's 3-bit acknowledge field. Commands that do not read contribute
    /// just their acknowledge field.
    pub fn parse_capture(&self, capture: &Bits) -> Result<Vec<u32>, JtagError> {
        let mut words = Vec::with_capacity(self.read_count());
        let mut position = 0;

        for (index, command) in self.commands.iter().enumerate() {
            if command.read {
                words.push(bits_to_word(capture.get(position..).unwrap_or(BitSlice::empty())));
                position += 32;
            }

            let ack = ack_of(capture, position);
            position += 3;

            if ack != JTAG_STATUS_OK {
                return Err(JtagError::ProgramFault {
                    command: index,
                    ack,
                });
            }
        }

        Ok(words)
    }
}

fn ack_of(tdo: &Bits, offset: usize) -> u8 {
    tdo.get(offset..offset + 3)
        .map(|bits| bits_to_word(bits) as u8)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use bitvec::prelude::*;

    use super::*;

    /// Answers every repeated segment from a script of acknowledge values.
    struct ScriptedBackend {
        acks: Vec<u8>,
        data: u32,
        writes: usize,
        reads: usize,
    }

    impl JtagBackend for ScriptedBackend {
        fn write_sequence(&mut self, _sequence: &JtagSequence) -> Result<(), JtagError> {
            self.writes += 1;
            Ok(())
        }

        fn read_write_sequence(&mut self, sequence: &JtagSequence) -> Result<Bits, JtagError> {
            self.reads += 1;
            let ack = self.acks.remove(0);

            let mut tdo = Bits::repeat(false, sequence.len());
            tdo[1..4].store_le(ack);
            tdo[4..36].store_le(self.data);
            Ok(tdo)
        }

        fn store_program(&mut self, _program: ScanProgram) -> Result<(), JtagError> {
            unreachable!()
        }

        fn execute_program(&mut self) -> Result<Vec<u32>, JtagError> {
            unreachable!()
        }
    }

    fn single_read_program(wait_retries: usize) -> ScanProgram {
        let mut program = ScanProgram::new(wait_retries);
        program.sequence_mut().shift_repeated(true, 4, true);
        program.sequence_mut().shift_repeated(false, 37, false);
        program.push_command(ProgramCommand {
            read: true,
            init: 0,
            repeat: 4,
            ack: 5,
            end: 41,
        });
        program
    }

    #[test]
    fn replay_retries_wait() {
        let program = single_read_program(4);
        let mut backend = ScriptedBackend {
            acks: vec![JTAG_STATUS_WAIT, JTAG_STATUS_WAIT, JTAG_STATUS_OK],
            data: 0xdead_beef,
            writes: 0,
            reads: 0,
        };

        let words = program.replay(&mut backend).unwrap();

        assert_eq!(words, vec![0xdead_beef]);
        assert_eq!(backend.writes, 1);
        assert_eq!(backend.reads, 3);
    }

    #[test]
    fn replay_gives_up_after_wait_limit() {
        let program = single_read_program(2);
        let mut backend = ScriptedBackend {
            acks: vec![JTAG_STATUS_WAIT; 3],
            data: 0,
            writes: 0,
            reads: 0,
        };

        let error = program.replay(&mut backend).unwrap_err();

        assert!(matches!(
            error,
            JtagError::ProgramWaitLimit {
                command: 0,
                attempts: 2
            }
        ));
        assert_eq!(backend.reads, 2);
    }

    #[test]
    fn replay_reports_faults() {
        let program = single_read_program(2);
        let mut backend = ScriptedBackend {
            acks: vec![0b100],
            data: 0,
            writes: 0,
            reads: 0,
        };

        let error = program.replay(&mut backend).unwrap_err();

        assert!(matches!(
            error,
            JtagError::ProgramFault {
                command: 0,
                ack: 0b100
            }
        ));
    }

    #[test]
    fn parse_compact_capture() {
        let mut program = single_read_program(1);
        program.push_command(ProgramCommand {
            read: false,
            init: 4,
            repeat: 4,
            ack: 5,
            end: 41,
        });
        assert_eq!(program.captured_bits(), 38);

        let mut capture = Bits::repeat(false, 38);
        capture[0..32].store_le(0x1234_5678u32);
        capture[32..35].store_le(JTAG_STATUS_OK);
        capture[35..38].store_le(JTAG_STATUS_OK);

        assert_eq!(program.parse_capture(&capture).unwrap(), vec![0x1234_5678]);
    }
}
