//! The debugged system: its cores, their breakpoints and run state.
//!
//! [`Target::discover`] brings up the debug port, finds the cores behind the APB access ports and
//! records the scan program that samples their program counters. The sampling engine only talks
//! to the target through the [`DebugTarget`] trait.

#[cfg(any(test, feature = "test"))]
pub mod fake_target;

use serde::{Deserialize, Serialize};

use crate::{
    architecture::arm::{
        ap::{ApClass, Base, Cfg, Csw, Idr},
        core::{
            armv7a::{Armv7a, PCSR_HALTED},
            armv7a_debug_regs::Dbgpcsr,
            armv8a::Armv8a,
            armv8a_debug_regs::Edprsr,
            memory_mapped_registers::MemoryMappedRegister,
            Core, CoreArchitecture, CoreError,
        },
        memory::RomTableWalker,
        ApMemory, ArmDebugInterface, DebugTransportError, MemoryAp,
    },
    config::{BackendKind, ProbeConfig},
    poll::PollBudgets,
    probe::{
        Backend, IdCode, JtagBackend, JtagError, JtagMux, JtagMuxSelect, ScanChain, ScanChainDevice,
        ScanProgram,
    },
    Error,
};

/// Number of cores whose program counter is sampled.
pub const MAX_CORES: usize = 4;

/// The roles a hardware breakpoint can have during a capture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum BreakpointSlot {
    /// Sampling starts when the start core halts here.
    Start,
    /// Sampling stops when the stop core halts here.
    Stop,
    /// Marks the end of a frame. The core is resumed immediately.
    Frame,
}

/// The comparator used for each [`BreakpointSlot`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BreakpointSlots {
    /// Comparator of the start breakpoint.
    pub start: usize,
    /// Comparator of the stop breakpoint.
    pub stop: usize,
    /// Comparator of the frame breakpoint.
    pub frame: usize,
}

impl Default for BreakpointSlots {
    fn default() -> Self {
        Self {
            start: 0,
            stop: 1,
            frame: 2,
        }
    }
}

impl BreakpointSlots {
    /// The comparator index of `slot`.
    pub fn unit(&self, slot: BreakpointSlot) -> usize {
        match slot {
            BreakpointSlot::Start => self.start,
            BreakpointSlot::Stop => self.stop,
            BreakpointSlot::Frame => self.frame,
        }
    }
}

/// Program counters of the sampled cores, read in one go.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PcSample {
    /// One program counter per core. Disabled and missing cores read 0.
    pub pcs: [u64; MAX_CORES],
    /// Whether the stop core is halted.
    pub halted: bool,
}

/// Breakpoint and run control as used by the sampling engine.
pub trait DebugTarget {
    /// Number of discovered cores.
    fn core_count(&self) -> usize;

    /// Programs the comparator of `slot` on `core`.
    fn set_breakpoint(
        &mut self,
        core: usize,
        slot: BreakpointSlot,
        addr: u64,
    ) -> Result<(), CoreError>;

    /// Disables the comparator of `slot` on `core`.
    fn clear_breakpoint(&mut self, core: usize, slot: BreakpointSlot) -> Result<(), CoreError>;

    /// Selects the core whose halt state [`DebugTarget::sample_pcs`] reports.
    fn set_stop_core(&mut self, core: usize) -> Result<(), CoreError>;

    /// Restarts the halted cores.
    fn resume_all(&mut self) -> Result<(), CoreError>;

    /// Whether `core` is halted.
    fn core_halted(&mut self, core: usize) -> Result<bool, CoreError>;

    /// Samples the program counters of all cores and the halt state of the stop core.
    fn sample_pcs(&mut self) -> Result<PcSample, CoreError>;

    /// Reads the PC of a halted core.
    fn read_halted_pc(&mut self, core: usize) -> Result<u64, CoreError>;

    /// Routes the JTAG port to the probe or to the external debugger.
    fn select_jtag(&mut self, select: JtagMuxSelect) -> Result<(), CoreError>;
}

impl<T: DebugTarget + ?Sized> DebugTarget for &mut T {
    fn core_count(&self) -> usize {
        (**self).core_count()
    }

    fn set_breakpoint(
        &mut self,
        core: usize,
        slot: BreakpointSlot,
        addr: u64,
    ) -> Result<(), CoreError> {
        (**self).set_breakpoint(core, slot, addr)
    }

    fn clear_breakpoint(&mut self, core: usize, slot: BreakpointSlot) -> Result<(), CoreError> {
        (**self).clear_breakpoint(core, slot)
    }

    fn set_stop_core(&mut self, core: usize) -> Result<(), CoreError> {
        (**self).set_stop_core(core)
    }

    fn resume_all(&mut self) -> Result<(), CoreError> {
        (**self).resume_all()
    }

    fn core_halted(&mut self, core: usize) -> Result<bool, CoreError> {
        (**self).core_halted(core)
    }

    fn sample_pcs(&mut self) -> Result<PcSample, CoreError> {
        (**self).sample_pcs()
    }

    fn read_halted_pc(&mut self, core: usize) -> Result<u64, CoreError> {
        (**self).read_halted_pc(core)
    }

    fn select_jtag(&mut self, select: JtagMuxSelect) -> Result<(), CoreError> {
        (**self).select_jtag(select)
    }
}

/// Stands in for the target before JTAG_INIT.
///
/// Captures that only measure current work without a target. Everything that needs a core fails
/// with [`CoreError::UnknownCore`].
#[derive(Debug, Clone, Copy, Default)]
pub struct Detached;

impl DebugTarget for Detached {
    fn core_count(&self) -> usize {
        0
    }

    fn set_breakpoint(
        &mut self,
        core: usize,
        _slot: BreakpointSlot,
        _addr: u64,
    ) -> Result<(), CoreError> {
        Err(CoreError::UnknownCore(core))
    }

    fn clear_breakpoint(&mut self, core: usize, _slot: BreakpointSlot) -> Result<(), CoreError> {
        Err(CoreError::UnknownCore(core))
    }

    fn set_stop_core(&mut self, core: usize) -> Result<(), CoreError> {
        Err(CoreError::UnknownCore(core))
    }

    fn resume_all(&mut self) -> Result<(), CoreError> {
        Err(CoreError::UnknownCore(0))
    }

    fn core_halted(&mut self, core: usize) -> Result<bool, CoreError> {
        Err(CoreError::UnknownCore(core))
    }

    fn sample_pcs(&mut self) -> Result<PcSample, CoreError> {
        Err(CoreError::UnknownCore(0))
    }

    fn read_halted_pc(&mut self, core: usize) -> Result<u64, CoreError> {
        Err(CoreError::UnknownCore(core))
    }

    fn select_jtag(&mut self, _select: JtagMuxSelect) -> Result<(), CoreError> {
        Ok(())
    }
}

/// Brings up a target on request of the host.
pub trait Connector {
    /// The target this connector produces.
    type Target: DebugTarget;

    /// Discovers the target. `host_devices` are the chain devices the host described.
    fn connect(
        &mut self,
        config: &ProbeConfig,
        host_devices: &[ScanChainDevice],
    ) -> Result<Self::Target, Error>;
}

/// Any closure that opens a fresh scan chain connects to a [`Target`] on it.
impl<F, B> Connector for F
where
    F: FnMut() -> Result<ScanChain<B>, JtagError>,
    B: JtagBackend + JtagMux,
{
    type Target = Target<B>;

    fn connect(
        &mut self,
        config: &ProbeConfig,
        host_devices: &[ScanChainDevice],
    ) -> Result<Target<B>, Error> {
        let chain = self()?;
        Target::discover(chain, config, host_devices)
    }
}

/// Connects through the backend selected by [`ProbeConfig::backend`].
///
/// The backend is opened anew on every connect, the one of the previous target is gone by then.
#[derive(Debug)]
pub struct BackendConnector<OD, OF> {
    open_direct: OD,
    open_sequencer: OF,
}

impl<OD, OF> BackendConnector<OD, OF> {
    /// Creates a connector from the functions opening either backend.
    pub fn new(open_direct: OD, open_sequencer: OF) -> Self {
        Self {
            open_direct,
            open_sequencer,
        }
    }
}

impl<OD, OF, D, F> Connector for BackendConnector<OD, OF>
where
    OD: FnMut() -> Result<D, JtagError>,
    OF: FnMut() -> Result<F, JtagError>,
    D: JtagBackend + JtagMux,
    F: JtagBackend + JtagMux,
{
    type Target = Target<Backend<D, F>>;

    fn connect(
        &mut self,
        config: &ProbeConfig,
        host_devices: &[ScanChainDevice],
    ) -> Result<Self::Target, Error> {
        tracing::debug!("Opening the {:?} backend", config.backend);
        let backend = match config.backend {
            BackendKind::DirectBitBang => Backend::DirectBitBang((self.open_direct)()?),
            BackendKind::FpgaSequencer => Backend::FpgaSequencer((self.open_sequencer)()?),
        };
        Target::discover(ScanChain::new(backend), config, host_devices)
    }
}

/// A discovered target, reached through the ARM debug port on the scan chain.
#[derive(Debug)]
pub struct Target<B> {
    interface: ArmDebugInterface<B>,
    cores: Vec<Core>,
    system_ap: Option<MemoryAp>,
    breakpoint_units: usize,
    slots: BreakpointSlots,
    budgets: PollBudgets,
    wait_retries: usize,
    stop_core: usize,
}

impl<B: JtagBackend + JtagMux> Target<B> {
    /// Discovers the target on `chain`.
    ///
    /// IR lengths are taken from `host_devices` first and from the configured table after that.
    /// Discovery always starts from scratch: the chain is reset and queried, the DAP is powered
    /// up, and all access ports are scanned for ROM tables. Afterwards every comparator of every
    /// enabled core is cleared.
    ///
    /// If discovery fails, the JTAG port is handed back to the external debugger.
    #[tracing::instrument(skip_all)]
    pub fn discover(
        mut chain: ScanChain<B>,
        config: &ProbeConfig,
        host_devices: &[ScanChainDevice],
    ) -> Result<Self, Error> {
        chain.backend_mut().select(JtagMuxSelect::Internal)?;

        let dap = match find_dap(&mut chain, config, host_devices) {
            Ok(dap) => dap,
            Err(error) => return Err(release_port(&mut chain, error)),
        };

        let mut target = Self {
            interface: ArmDebugInterface::with_dap(chain, dap, config.wait_retries),
            cores: Vec::new(),
            system_ap: None,
            breakpoint_units: 0,
            slots: config.breakpoints,
            budgets: config.poll_budgets,
            wait_retries: config.wait_retries,
            stop_core: 0,
        };

        match target.attach(config) {
            Ok(()) => {
                tracing::info!("JTAG chain init done");
                Ok(target)
            }
            Err(error) => Err(release_port(target.interface.chain_mut(), error)),
        }
    }

    /// Powers up the DAP, finds the cores and clears their comparators.
    fn attach(&mut self, config: &ProbeConfig) -> Result<(), Error> {
        self.interface.dp_init(config.poll_budgets.power_up)?;

        for ap in 0..config.max_access_ports {
            let idr: Idr = self.interface.read_ap_register(ap)?;
            let base: Base = self.interface.read_ap_register(ap)?;
            let cfg: Cfg = self.interface.read_ap_register(ap)?;

            match idr.ap_class() {
                Some(ApClass::AmbaApb) => {
                    tracing::info!("Found APB AP ({})", ap);

                    if base.present() {
                        self.interface.write_ap_register(ap, Csw::APB_WORD)?;
                        discover_cores(
                            &mut self.interface.memory(MemoryAp::new(ap)),
                            ap,
                            base,
                            &mut self.cores,
                        )?;
                    }
                }
                Some(ApClass::AmbaAxi) => {
                    tracing::info!("Found AXI AP ({})", ap);
                    if cfg.large_address() {
                        tracing::info!("64 bit AXI memory space");
                    }

                    self.system_ap = Some(MemoryAp {
                        ap,
                        large_address: cfg.large_address(),
                    });
                }
                _ => {}
            }
        }

        if self.cores.is_empty() {
            tracing::warn!("No cores found");
            return Err(Error::NoCores);
        }

        tracing::info!(
            "Number of cores: {}. Number of enabled cores: {}",
            self.cores.len(),
            self.cores.iter().filter(|core| core.enabled).count()
        );

        let lead = self.cores[0];
        self.breakpoint_units =
            lead.breakpoint_units(&mut self.interface.memory(MemoryAp::new(lead.ap)))?;
        tracing::info!("Number of HW breakpoints: {}", self.breakpoint_units);

        for core in self.cores.iter().filter(|core| core.enabled) {
            let mut memory = self.interface.memory(MemoryAp::new(core.ap));
            for unit in 0..self.breakpoint_units {
                core.clear_hw_breakpoint(&mut memory, unit)?;
            }
        }

        self.record_sample_program()?;
        Ok(())
    }
}

/// Resets the chain and returns the IDCODE of the first ARM DAP on it.
fn find_dap<B: JtagBackend>(
    chain: &mut ScanChain<B>,
    config: &ProbeConfig,
    host_devices: &[ScanChainDevice],
) -> Result<IdCode, Error> {
    chain.reset_then_idle()?;

    let taps = config.known_taps.with_host_devices(host_devices);
    chain
        .query_chain(&taps)?
        .iter()
        .map(|device| device.idcode)
        .find(|idcode| idcode.is_arm_dap())
        .ok_or_else(|| {
            tracing::warn!("TAP not found");
            Error::DapNotFound
        })
}

/// Routes the JTAG port back to the external debugger after a failed discovery.
fn release_port<B: JtagBackend + JtagMux>(chain: &mut ScanChain<B>, error: Error) -> Error {
    tracing::warn!("JTAG init failed: {}", error);
    if let Err(release_error) = chain.backend_mut().select(JtagMuxSelect::External) {
        tracing::warn!("Failed to release the JTAG port: {}", release_error);
    }
    error
}

/// Walks the ROM table behind `base` and appends the supported cores found in it.
fn discover_cores(
    memory: &mut impl crate::architecture::arm::memory::DebugBus,
    ap: u8,
    base: Base,
    cores: &mut Vec<Core>,
) -> Result<(), Error> {
    let components = RomTableWalker::new(memory).walk(base.address())?;

    for component in components {
        if let Some(core_type) = component.peripheral_id.core_type() {
            cores.push(Core::init(memory, core_type, ap, component.address)?);
        }
    }

    Ok(())
}

impl<B: JtagBackend> Target<B> {
    /// The discovered cores.
    pub fn cores(&self) -> &[Core] {
        &self.cores
    }

    /// Number of hardware breakpoint comparators per core.
    pub fn breakpoint_units(&self) -> usize {
        self.breakpoint_units
    }

    /// The system memory, if an AXI access port was found.
    pub fn system_memory(&mut self) -> Option<ApMemory<'_, B>> {
        let ap = self.system_ap?;
        Some(self.interface.memory(ap))
    }

    /// Access the debug interface.
    pub fn interface_mut(&mut self) -> &mut ArmDebugInterface<B> {
        &mut self.interface
    }

    fn core(&self, core: usize) -> Result<Core, CoreError> {
        self.cores
            .get(core)
            .copied()
            .ok_or(CoreError::UnknownCore(core))
    }

    fn enabled_core(&self, core: usize) -> Result<Core, CoreError> {
        let info = self.core(core)?;
        if !info.enabled {
            return Err(CoreError::CoreDisabled(core));
        }
        Ok(info)
    }

    fn memory(&mut self, core: Core) -> ApMemory<'_, B> {
        self.interface.memory(MemoryAp::new(core.ap))
    }

    /// Cores whose program counters are sampled, with their index.
    fn sampled_cores(&self) -> impl Iterator<Item = (usize, Core)> + '_ {
        self.cores
            .iter()
            .copied()
            .enumerate()
            .take(MAX_CORES)
            .filter(|(_, core)| core.enabled)
    }

    /// The register read after the program counters to learn whether the stop core halted, if
    /// the program counter samples don't tell already.
    fn halt_status_address(&self) -> Option<u32> {
        let stop = self.cores.get(self.stop_core)?;
        match stop.architecture() {
            CoreArchitecture::Armv8a => {
                Some(stop.debug_base.wrapping_add(Edprsr::ADDRESS as u32))
            }
            CoreArchitecture::Armv7a if self.stop_core >= MAX_CORES || !stop.enabled => {
                Some(stop.debug_base.wrapping_add(Dbgpcsr::ADDRESS as u32))
            }
            CoreArchitecture::Armv7a => None,
        }
    }

    /// Records the reads [`Target::sample_pcs`] performs and stores them on the backend.
    fn record_sample_program(&mut self) -> Result<(), CoreError> {
        let mut program = ScanProgram::new(self.wait_retries);

        for (_, core) in self.sampled_cores() {
            for address in core.pc_sample_addresses() {
                self.interface
                    .record_memory_read(&mut program, core.ap, address)?;
            }
        }

        if let Some(address) = self.halt_status_address() {
            let stop = self.core(self.stop_core)?;
            self.interface
                .record_memory_read(&mut program, stop.ap, address)?;
        }

        tracing::debug!(
            "Recorded PC sample program with {} reads",
            program.read_count()
        );
        self.interface.store_program(program)?;
        Ok(())
    }

    /// Programs the comparator of `slot` on `core` with `addr`.
    ///
    /// Fails without touching the core if the comparator does not exist.
    pub fn set_breakpoint(
        &mut self,
        core: usize,
        slot: BreakpointSlot,
        addr: u64,
    ) -> Result<(), CoreError> {
        let unit = self.checked_unit(slot)?;
        let info = self.enabled_core(core)?;

        tracing::debug!("Set {:?} breakpoint {:#x} on core {}", slot, addr, core);
        info.set_hw_breakpoint(&mut self.memory(info), unit, addr)
    }

    /// Disables the comparator of `slot` on `core`.
    pub fn clear_breakpoint(&mut self, core: usize, slot: BreakpointSlot) -> Result<(), CoreError> {
        let unit = self.checked_unit(slot)?;
        let info = self.enabled_core(core)?;

        tracing::debug!("Clear {:?} breakpoint on core {}", slot, core);
        info.clear_hw_breakpoint(&mut self.memory(info), unit)
    }

    fn checked_unit(&self, slot: BreakpointSlot) -> Result<usize, CoreError> {
        let unit = self.slots.unit(slot);
        if unit >= self.breakpoint_units {
            tracing::warn!(
                "{:?} breakpoint needs comparator {}, the cores have {}",
                slot,
                unit,
                self.breakpoint_units
            );
            return Err(CoreError::BreakpointUnitUnavailable {
                unit,
                available: self.breakpoint_units,
            });
        }
        Ok(unit)
    }

    /// Selects the core whose halt state is reported with the program counter samples.
    pub fn set_stop_core(&mut self, core: usize) -> Result<(), CoreError> {
        self.core(core)?;
        if core != self.stop_core {
            self.stop_core = core;
            self.record_sample_program()?;
        }
        Ok(())
    }

    /// Restarts the halted cores.
    ///
    /// How this is done depends on the architecture of core 0. ARMv7-A cores are restarted one by
    /// one through DBGDRCR. ARMv8-A cores get their halt trigger acknowledged and are restarted
    /// together by a pulse on the restart channel of core 0's cross trigger interface.
    #[tracing::instrument(skip(self))]
    pub fn resume_all(&mut self) -> Result<(), CoreError> {
        let lead = self.core(0)?;
        let budget = self.budgets.resume;
        let enabled: Vec<Core> = self.cores.iter().copied().filter(|c| c.enabled).collect();

        match lead.architecture() {
            CoreArchitecture::Armv7a => {
                for core in enabled
                    .iter()
                    .filter(|core| core.architecture() == CoreArchitecture::Armv7a)
                {
                    Armv7a::new(&mut self.memory(*core), u64::from(core.debug_base))
                        .resume(budget)?;
                }
            }
            CoreArchitecture::Armv8a => {
                for core in enabled
                    .iter()
                    .filter(|core| core.architecture() == CoreArchitecture::Armv8a)
                {
                    Armv8a::new(&mut self.memory(*core), u64::from(core.debug_base))
                        .acknowledge_halt()?;
                }

                let mut memory = self.memory(lead);
                let mut lead_core = Armv8a::new(&mut memory, u64::from(lead.debug_base));
                lead_core.pulse_restart()?;
                lead_core.wait_for_restart(budget)?;
            }
        }

        Ok(())
    }

    /// Whether `core` is halted.
    pub fn core_halted(&mut self, core: usize) -> Result<bool, CoreError> {
        let info = self.core(core)?;
        info.is_halted(&mut self.memory(info))
    }

    /// Runs the recorded program and decodes the program counters and the stop core's halt state.
    pub fn sample_pcs(&mut self) -> Result<PcSample, CoreError> {
        let words = self.interface.execute_program()?;

        let mut sample = PcSample::default();
        let mut position = 0;

        let sampled: Vec<(usize, Core)> = self.sampled_cores().collect();
        for (index, core) in sampled {
            let count = core.pc_sample_addresses().len();
            let core_words = words.get(position..position + count).unwrap_or(&[]);
            sample.pcs[index] = core.parse_pc_sample(core_words);
            position += count;
        }

        sample.halted = match (self.halt_status_address(), self.cores.get(self.stop_core)) {
            (Some(_), Some(stop)) => {
                let status = words.get(position).copied().unwrap_or(0);
                match stop.architecture() {
                    CoreArchitecture::Armv8a => Edprsr::from(status).halted(),
                    CoreArchitecture::Armv7a => status == PCSR_HALTED,
                }
            }
            _ => sample.pcs.get(self.stop_core).copied() == Some(u64::from(PCSR_HALTED)),
        };

        Ok(sample)
    }

    /// Reads the PC of the halted `core`.
    pub fn read_halted_pc(&mut self, core: usize) -> Result<u64, CoreError> {
        let info = self.enabled_core(core)?;
        info.read_halted_pc(&mut self.memory(info))
    }
}

impl<B: JtagBackend + JtagMux> DebugTarget for Target<B> {
    fn core_count(&self) -> usize {
        self.cores.len()
    }

    fn set_breakpoint(
        &mut self,
        core: usize,
        slot: BreakpointSlot,
        addr: u64,
    ) -> Result<(), CoreError> {
        Target::set_breakpoint(self, core, slot, addr)
    }

    fn clear_breakpoint(&mut self, core: usize, slot: BreakpointSlot) -> Result<(), CoreError> {
        Target::clear_breakpoint(self, core, slot)
    }

    fn set_stop_core(&mut self, core: usize) -> Result<(), CoreError> {
        Target::set_stop_core(self, core)
    }

    fn resume_all(&mut self) -> Result<(), CoreError> {
        Target::resume_all(self)
    }

    fn core_halted(&mut self, core: usize) -> Result<bool, CoreError> {
        Target::core_halted(self, core)
    }

    fn sample_pcs(&mut self) -> Result<PcSample, CoreError> {
        Target::sample_pcs(self)
    }

    fn read_halted_pc(&mut self, core: usize) -> Result<u64, CoreError> {
        Target::read_halted_pc(self, core)
    }

    fn select_jtag(&mut self, select: JtagMuxSelect) -> Result<(), CoreError> {
        self.interface
            .chain_mut()
            .backend_mut()
            .select(select)
            .map_err(DebugTransportError::from)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use test_case::test_case;

    use super::*;
    use crate::{
        architecture::arm::core::CoreType,
        probe::{
            fake_chain::{FakeAp, FakeChain, FakeDap, FakeDevice},
            IdCode,
        },
    };

    const A53_DAP: u32 = 0x5ba0_0477;
    const XILINX_PL: u32 = 0x0372_7093;

    const ROM: u32 = 0x8000_0000;
    const CORE0: u64 = 0x8041_0000;
    const CORE1: u64 = 0x8051_0000;
    const CTI0: u64 = CORE0 + 0x1_0000;

    fn a53_component(ap: &mut FakeAp, base: u64) {
        ap.set_word(base + 0xFF4, 0x90);
        ap.set_word(base + 0xFE0, 0x03);
        ap.set_word(base + 0xFE4, 0xBD);
        ap.set_word(base + 0xFE8, 0x4B);
        ap.set_word(base + 0xFD0, 0x04);
    }

    /// An UltraScale+ like system: an AXI-AP with a 64-bit address space at 0, an APB-AP with a
    /// ROM table at 1 listing two Cortex-A53 cores, of which only the first is powered.
    fn ultrascale() -> FakeChain {
        let mut apb = FakeAp::apb(ROM);
        apb.set_word(u64::from(ROM) + 0xFF4, 0x10);
        apb.set_word(u64::from(ROM), 0x0041_0003);
        apb.set_word(u64::from(ROM) + 4, 0x0051_0003);

        a53_component(&mut apb, CORE0);
        a53_component(&mut apb, CORE1);
        apb.set_word(CORE0 + 0x314, 0x801);
        apb.set_word(CORE0 + 0xD28, 0x1030_5106);

        let dap = FakeDap::new()
            .with_ap(0, FakeAp::axi(true))
            .with_ap(1, apb);

        FakeChain::new(vec![
            FakeDevice::bypass_only(XILINX_PL, 6),
            FakeDevice::dap(A53_DAP, dap),
        ])
    }

    fn host_devices() -> Vec<ScanChainDevice> {
        vec![ScanChainDevice {
            idcode: IdCode::from(XILINX_PL),
            irlen: 6,
        }]
    }

    fn discover(fake: FakeChain, config: &ProbeConfig) -> Target<FakeChain> {
        Target::discover(ScanChain::new(fake), config, &host_devices()).unwrap()
    }

    fn apb(target: &mut Target<FakeChain>) -> &mut FakeAp {
        target
            .interface_mut()
            .chain_mut()
            .backend_mut()
            .dap_mut()
            .ap_mut(1)
    }

    #[test]
    fn discovers_cores_and_system_memory() {
        let mut target = discover(ultrascale(), &ProbeConfig::default());

        assert_eq!(
            target.cores(),
            &[
                Core {
                    core_type: CoreType::CortexA53,
                    ap: 1,
                    debug_base: CORE0 as u32,
                    enabled: true,
                },
                Core {
                    core_type: CoreType::CortexA53,
                    ap: 1,
                    debug_base: CORE1 as u32,
                    enabled: false,
                },
            ]
        );
        assert_eq!(target.breakpoint_units(), 6);
        assert_eq!(target.system_ap, Some(MemoryAp { ap: 0, large_address: true }));

        let fake = target.interface_mut().chain_mut().backend_mut();
        assert_eq!(fake.mux(), Some(JtagMuxSelect::Internal));

        let apb = fake.dap_mut().ap_mut(1);
        assert_eq!(apb.csw(), 0x8000_0042);
        // CTI enabled on the powered core only.
        assert_eq!(apb.word(CTI0), 1);
        assert_eq!(apb.word(CORE1 + 0x1_0000), 0);
        // Every comparator of the powered core cleared.
        let cleared: Vec<u64> = apb
            .writes()
            .iter()
            .filter(|(address, _)| (CORE0 + 0x400..CORE0 + 0x500).contains(address))
            .map(|(address, _)| *address)
            .collect();
        assert_eq!(
            cleared,
            (0..6).map(|unit| CORE0 + 0x408 + 16 * unit).collect::<Vec<_>>()
        );
    }

    #[test]
    fn missing_dap_is_reported() {
        let mut fake = FakeChain::new(vec![FakeDevice::bypass_only(XILINX_PL, 6)]);

        let error = Target::discover(
            ScanChain::new(&mut fake),
            &ProbeConfig::default(),
            &host_devices(),
        )
        .unwrap_err();

        assert!(matches!(error, Error::DapNotFound));
        assert_eq!(fake.mux(), Some(JtagMuxSelect::External));
    }

    #[test]
    fn empty_chain_releases_jtag() {
        let mut fake = FakeChain::new(vec![]);

        let error = Target::discover(ScanChain::new(&mut fake), &ProbeConfig::default(), &[])
            .unwrap_err();

        assert!(matches!(error, Error::Jtag(JtagError::NoChain)));
        assert_eq!(fake.mux(), Some(JtagMuxSelect::External));
    }

    #[test]
    fn no_cores_is_an_error() {
        let dap = FakeDap::new().with_ap(0, FakeAp::axi(false));
        let mut fake = FakeChain::new(vec![FakeDevice::dap(A53_DAP, dap)]);

        let error = Target::discover(ScanChain::new(&mut fake), &ProbeConfig::default(), &[])
            .unwrap_err();

        assert!(matches!(error, Error::NoCores));
        assert_eq!(fake.mux(), Some(JtagMuxSelect::External));
    }

    #[test]
    fn sample_program_reads_pcs_and_halt_state() {
        let mut target = discover(ultrascale(), &ProbeConfig::default());
        apb(&mut target).set_word(CORE0 + 0xA0, 0x0000_1007);
        apb(&mut target).set_word(CORE0 + 0xAC, 0x0000_0004);

        let sample = target.sample_pcs().unwrap();
        assert_eq!(
            sample,
            PcSample {
                pcs: [0x4_0000_1004, 0, 0, 0],
                halted: false,
            }
        );

        apb(&mut target).set_word(CORE0 + 0x314, 0x811);
        assert!(target.sample_pcs().unwrap().halted);
    }

    #[test]
    fn breakpoint_capacity_is_checked() {
        let mut config = ProbeConfig::default();
        config.breakpoints.frame = 6;
        let mut target = discover(ultrascale(), &config);
        let writes_before = apb(&mut target).writes().len();

        let error = target
            .set_breakpoint(0, BreakpointSlot::Frame, 0x1000)
            .unwrap_err();

        assert!(matches!(
            error,
            CoreError::BreakpointUnitUnavailable {
                unit: 6,
                available: 6
            }
        ));
        assert_eq!(apb(&mut target).writes().len(), writes_before);
    }

    #[test]
    fn breakpoints_on_disabled_or_missing_cores_fail() {
        let mut target = discover(ultrascale(), &ProbeConfig::default());

        assert!(matches!(
            target.set_breakpoint(1, BreakpointSlot::Start, 0x1000),
            Err(CoreError::CoreDisabled(1))
        ));
        assert!(matches!(
            target.set_breakpoint(4, BreakpointSlot::Start, 0x1000),
            Err(CoreError::UnknownCore(4))
        ));
    }

    #[test]
    fn set_then_clear_restores_comparator() {
        let mut target = discover(ultrascale(), &ProbeConfig::default());

        target
            .set_breakpoint(0, BreakpointSlot::Stop, 0x0000_0008_0000_2000)
            .unwrap();
        assert_eq!(apb(&mut target).word(CORE0 + 0x418), 0x21e7);
        assert_eq!(apb(&mut target).word(CORE0 + 0x414), 0x8);

        target.clear_breakpoint(0, BreakpointSlot::Stop).unwrap();
        assert_eq!(apb(&mut target).word(CORE0 + 0x418), 0);
        assert_eq!(apb(&mut target).word(CORE0 + 0x408), 0);
    }

    #[test]
    fn resume_pulses_lead_cti() {
        let mut target = discover(ultrascale(), &ProbeConfig::default());

        target.resume_all().unwrap();

        let apb = apb(&mut target);
        assert_eq!(apb.word(CTI0 + 0x10), 1);
        assert_eq!(apb.word(CTI0 + 0x1C), 1);
        assert_eq!(apb.word(CORE1 + 0x1_0010), 0);
    }

    #[test]
    fn system_memory_uses_tar_hi() {
        let mut target = discover(ultrascale(), &ProbeConfig::default());

        {
            use crate::architecture::arm::memory::DebugBus;
            let mut memory = target.system_memory().unwrap();
            memory.write_word_32(0x8_0000_0010, 0xCAFE_F00D).unwrap();
        }

        let axi = target
            .interface_mut()
            .chain_mut()
            .backend_mut()
            .dap_mut()
            .ap_mut(0);
        assert_eq!(axi.word(0x8_0000_0010), 0xCAFE_F00D);
    }

    #[test]
    fn releasing_jtag_reaches_the_mux() {
        let mut target = discover(ultrascale(), &ProbeConfig::default());

        DebugTarget::select_jtag(&mut target, JtagMuxSelect::External).unwrap();

        assert_eq!(
            target.interface_mut().chain_mut().backend_mut().mux(),
            Some(JtagMuxSelect::External)
        );
    }

    /// Opens the fake board if `available`, otherwise fails like a backend without hardware.
    fn open_if(available: bool) -> impl FnMut() -> Result<FakeChain, JtagError> {
        move || {
            if available {
                Ok(ultrascale())
            } else {
                Err(JtagError::NoChain)
            }
        }
    }

    #[test_case(BackendKind::DirectBitBang; "direct")]
    #[test_case(BackendKind::FpgaSequencer; "fpga sequencer")]
    fn connector_opens_the_configured_backend(kind: BackendKind) {
        let config = ProbeConfig {
            backend: kind,
            ..ProbeConfig::default()
        };
        let mut connector = BackendConnector::new(
            open_if(kind == BackendKind::DirectBitBang),
            open_if(kind == BackendKind::FpgaSequencer),
        );

        let mut target = connector.connect(&config, &host_devices()).unwrap();

        assert_eq!(target.cores().len(), 2);
        assert_eq!(
            target.interface_mut().chain_mut().backend_mut().kind(),
            kind
        );
    }
}
