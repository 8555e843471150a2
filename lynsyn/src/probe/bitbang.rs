use embedded_hal::digital::{Error as _, InputPin, OutputPin, PinState};

use crate::probe::{Bits, JtagBackend, JtagError, JtagMux, JtagMuxSelect, JtagSequence, ScanProgram};

/// Drives the JTAG pins directly.
///
/// Recorded programs are replayed in software, clock by clock, with the same WAIT handling the
/// FPGA sequencer implements in hardware.
#[derive(Debug)]
pub struct BitBang<Tck, Tms, Tdi, Tdo, Sel> {
    tck: Tck,
    tms: Tms,
    tdi: Tdi,
    tdo: Tdo,
    select: Sel,
    program: Option<ScanProgram>,
}

fn pin_error(error: impl embedded_hal::digital::Error) -> JtagError {
    JtagError::Pin(error.kind())
}

impl<Tck, Tms, Tdi, Tdo, Sel> BitBang<Tck, Tms, Tdi, Tdo, Sel>
where
    Tck: OutputPin,
    Tms: OutputPin,
    Tdi: OutputPin,
    Tdo: InputPin,
    Sel: OutputPin,
{
    /// Creates a bit-bang backend. `select` drives the JTAG multiplexer, high routes the target
    /// to the probe.
    pub fn new(tck: Tck, tms: Tms, tdi: Tdi, tdo: Tdo, select: Sel) -> Self {
        Self {
            tck,
            tms,
            tdi,
            tdo,
            select,
            program: None,
        }
    }

    /// Clocks out `tms` and `tdi` and samples TDO. Starts on a falling edge, the TAP samples TDI
    /// and TMS on the rising edge.
    fn clock(&mut self, tms: bool, tdi: bool) -> Result<bool, JtagError> {
        self.tck.set_low().map_err(pin_error)?;
        self.tms.set_state(PinState::from(tms)).map_err(pin_error)?;
        self.tdi.set_state(PinState::from(tdi)).map_err(pin_error)?;
        self.tck.set_high().map_err(pin_error)?;

        self.tdo.is_high().map_err(pin_error)
    }
}

impl<Tck, Tms, Tdi, Tdo, Sel> JtagBackend for BitBang<Tck, Tms, Tdi, Tdo, Sel>
where
    Tck: OutputPin,
    Tms: OutputPin,
    Tdi: OutputPin,
    Tdo: InputPin,
    Sel: OutputPin,
{
    fn write_sequence(&mut self, sequence: &JtagSequence) -> Result<(), JtagError> {
        for (tdi, tms) in sequence
            .tdi()
            .iter()
            .by_vals()
            .zip(sequence.tms().iter().by_vals())
        {
            self.clock(tms, tdi)?;
        }
        Ok(())
    }

    fn read_write_sequence(&mut self, sequence: &JtagSequence) -> Result<Bits, JtagError> {
        let mut tdo = Bits::with_capacity(sequence.len());
        for (tdi, tms) in sequence
            .tdi()
            .iter()
            .by_vals()
            .zip(sequence.tms().iter().by_vals())
        {
            tdo.push(self.clock(tms, tdi)?);
        }
        Ok(tdo)
    }

    fn store_program(&mut self, program: ScanProgram) -> Result<(), JtagError> {
        self.program = Some(program);
        Ok(())
    }

    fn execute_program(&mut self) -> Result<Vec<u32>, JtagError> {
        let program = self.program.take().ok_or(JtagError::NoProgram)?;
        let result = program.replay(self);
        self.program = Some(program);
        result
    }
}

impl<Tck, Tms, Tdi, Tdo, Sel> JtagMux for BitBang<Tck, Tms, Tdi, Tdo, Sel>
where
    Sel: OutputPin,
{
    fn select(&mut self, select: JtagMuxSelect) -> Result<(), JtagError> {
        let state = PinState::from(select == JtagMuxSelect::Internal);
        self.select.set_state(state).map_err(pin_error)
    }
}
