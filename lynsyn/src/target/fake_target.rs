#![allow(missing_docs)] // Don't require docs for test code
//! A scripted [`DebugTarget`].
//!
//! Program counter samples and halt states are taken from per-call scripts; the last entry of a
//! script repeats once the others are used up. Every call that changes the target is logged.

use std::collections::{BTreeMap, VecDeque};

use crate::{
    architecture::arm::core::CoreError,
    probe::JtagMuxSelect,
    target::{BreakpointSlot, DebugTarget, PcSample, MAX_CORES},
};

/// A call that changed the state of the target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetEvent {
    SetBreakpoint {
        core: usize,
        slot: BreakpointSlot,
        addr: u64,
    },
    ClearBreakpoint {
        core: usize,
        slot: BreakpointSlot,
    },
    SetStopCore(usize),
    ResumeAll,
    SelectJtag(JtagMuxSelect),
}

fn next<T: Copy>(script: &mut VecDeque<T>, default: T) -> T {
    if script.len() > 1 {
        script.pop_front().unwrap_or(default)
    } else {
        script.front().copied().unwrap_or(default)
    }
}

#[derive(Debug, Default)]
pub struct FakeTarget {
    cores: usize,
    samples: VecDeque<PcSample>,
    halted: BTreeMap<usize, VecDeque<bool>>,
    halted_pcs: BTreeMap<usize, u64>,
    breakpoints: BTreeMap<(usize, BreakpointSlot), u64>,
    events: Vec<TargetEvent>,
    sample_count: usize,
}

impl FakeTarget {
    pub fn new(cores: usize) -> Self {
        Self {
            cores,
            ..Default::default()
        }
    }

    /// Answers for successive [`DebugTarget::sample_pcs`] calls.
    pub fn script_samples(&mut self, samples: impl IntoIterator<Item = PcSample>) {
        self.samples = samples.into_iter().collect();
    }

    /// Answers for successive [`DebugTarget::core_halted`] calls on `core`.
    pub fn script_halted(&mut self, core: usize, halted: impl IntoIterator<Item = bool>) {
        self.halted.insert(core, halted.into_iter().collect());
    }

    pub fn set_halted_pc(&mut self, core: usize, pc: u64) {
        self.halted_pcs.insert(core, pc);
    }

    pub fn breakpoint(&self, core: usize, slot: BreakpointSlot) -> Option<u64> {
        self.breakpoints.get(&(core, slot)).copied()
    }

    pub fn events(&self) -> &[TargetEvent] {
        &self.events
    }

    pub fn clear_events(&mut self) {
        self.events.clear();
    }

    /// Number of [`DebugTarget::sample_pcs`] calls.
    pub fn sample_count(&self) -> usize {
        self.sample_count
    }

    fn check_core(&self, core: usize) -> Result<(), CoreError> {
        if core < self.cores {
            Ok(())
        } else {
            Err(CoreError::UnknownCore(core))
        }
    }
}

impl DebugTarget for FakeTarget {
    fn core_count(&self) -> usize {
        self.cores
    }

    fn set_breakpoint(
        &mut self,
        core: usize,
        slot: BreakpointSlot,
        addr: u64,
    ) -> Result<(), CoreError> {
        self.check_core(core)?;
        self.breakpoints.insert((core, slot), addr);
        self.events
            .push(TargetEvent::SetBreakpoint { core, slot, addr });
        Ok(())
    }

    fn clear_breakpoint(&mut self, core: usize, slot: BreakpointSlot) -> Result<(), CoreError> {
        self.check_core(core)?;
        self.breakpoints.remove(&(core, slot));
        self.events.push(TargetEvent::ClearBreakpoint { core, slot });
        Ok(())
    }

    fn set_stop_core(&mut self, core: usize) -> Result<(), CoreError> {
        self.check_core(core)?;
        self.events.push(TargetEvent::SetStopCore(core));
        Ok(())
    }

    fn resume_all(&mut self) -> Result<(), CoreError> {
        self.events.push(TargetEvent::ResumeAll);
        Ok(())
    }

    fn core_halted(&mut self, core: usize) -> Result<bool, CoreError> {
        self.check_core(core)?;
        Ok(self
            .halted
            .get_mut(&core)
            .map(|script| next(script, false))
            .unwrap_or(false))
    }

    fn sample_pcs(&mut self) -> Result<PcSample, CoreError> {
        self.sample_count += 1;
        Ok(next(&mut self.samples, PcSample::default()))
    }

    fn read_halted_pc(&mut self, core: usize) -> Result<u64, CoreError> {
        self.check_core(core)?;
        Ok(self.halted_pcs.get(&core).copied().unwrap_or(0))
    }

    fn select_jtag(&mut self, select: JtagMuxSelect) -> Result<(), CoreError> {
        self.events.push(TargetEvent::SelectJtag(select));
        Ok(())
    }
}

/// A sample with the same program counter on every core.
pub fn uniform_sample(pc: u64, halted: bool) -> PcSample {
    PcSample {
        pcs: [pc; MAX_CORES],
        halted,
    }
}
