//! ICS/OSC clock-tree controller.
//!
//! The ICS block derives ICSOUT (core clock) from either the internal
//! reference (IRC) or the external reference on EXTAL/XTAL, optionally
//! multiplied by the FLL. The active [`ClockMode`] is fully determined by
//! `C1[CLKS]`, `C1[IREFS]` and `C2[LP]`.
//!
//! ```text
//!  FBILP ◀──▶ FBI ◀──────▶ FBE ◀──▶ FBELP
//!              ▲ ╲        ╱ ▲
//!              │   ╲    ╱   │
//!              │     ╳      │
//!              │   ╱    ╲   │
//!              ▼ ╱        ╲ ▼
//!             FEI ◀──────▶ FEE
//! ```
//!
//! The four full-power modes reach each other directly. A low-power mode is
//! only entered from, and left to, its bypass mode. [`transition_steps`]
//! holds the register sequence of every edge.

use core::cell::RefCell;
use core::fmt;

use config::{BusDivider, ClockConfig, ClockKind, ClockMode, ClockRequest, ClockSource, ReferenceSource, Silicon};
use critical_section::Mutex;
use poll::{wait_until, TimeSource};
use regs::{clear_loss_of_lock, Fields, IcsRegisters, Reg, Snapshot, LOLS_MASK};

pub mod config;
pub mod divider;
pub mod freq;
mod osc;
pub mod poll;
pub mod regs;
#[cfg(test)]
mod sim;

pub use divider::{select_reference_divider, select_reference_divider_legacy};
pub use freq::{derive_clock, recompute_core_clock};

static CLOCKS: Mutex<RefCell<Option<Clocks>>> = Mutex::new(RefCell::new(None));

/// `init` is the main entrypoint for configuring clocks.
///
/// This should be called once on startup, before any peripheral asks for
/// its clock. It resets the ICS to FEI, applies the IRC trim, walks to the
/// mode selected by `config` and publishes the result.
///
/// The published state can later be read in one of two ways:
///
/// 1. Via the [`with_clocks`] method, which gives read-only access to [`Clocks`]
/// 2. Via [`get_clock`], for a single derived frequency
///
/// The returned controller keeps the published state current across later
/// transitions.
pub fn init<R, T>(regs: R, time: T, config: ClockConfig) -> Result<IcsController<R, T>, ClockError>
where
    R: IcsRegisters,
    T: TimeSource,
{
    // Ensure we haven't already configured the clocks
    critical_section::with(|cs| {
        if CLOCKS.borrow_ref(cs).is_some() {
            Err(ClockError::AlreadyConfigured)
        } else {
            Ok(())
        }
    })?;

    let mut controller = IcsController::new(regs, time, config);
    controller.initialize(&config.request())?;

    let clocks = controller.clocks()?;
    critical_section::with(|cs| {
        *CLOCKS.borrow_ref_mut(cs) = Some(clocks);
    });
    controller.published = true;

    info!(
        "clocks: {} core {} Hz bus {} Hz",
        clocks.mode.name(),
        clocks.core_clk,
        derive_clock(&clocks, ClockKind::Bus)
    );
    Ok(controller)
}

/// Clock tree state as last observed by the controller.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Clocks {
    /// Active ICS mode
    pub mode: ClockMode,
    /// ICSOUT in Hz, see [`recompute_core_clock`]
    pub core_clk: u32,
    /// Configured external reference in kHz, `0` if none
    pub external_khz: u32,
    /// `C1[RDIV]`
    pub rdiv: u8,
    /// `SIM_BUSDIV[BUSDIV]`
    pub busdiv: u8,
    /// `SIM_SOPT[BUSREF]`
    pub busref: u8,
}

/// Clock configuration errors.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClockError {
    /// The requested edge is not in the transition table
    InvalidTransition {
        /// Mode the hardware was in
        from: ClockMode,
        /// Requested mode
        to: ClockMode,
    },
    /// No reference divider brings this frequency into the FLL input window
    UnsupportedReferenceFrequency {
        /// Requested external reference
        khz: u32,
    },
    /// `S[IREFST]` or `S[CLKST]` did not follow its control field in time
    ClockSourceTimeout,
    /// `OSC_CR[OSCINIT]` was not reported in time
    OscillatorNotReady,
    /// `S[LOCK]` was not reported in time
    ClockNotLocked,
    /// `C1[CLKS]` holds the reserved value
    UnknownMode {
        /// Raw clock select field
        clks: u8,
    },
    /// The requested configuration was impossible or conflicting
    BadConfiguration {
        /// What was wrong
        reason: &'static str,
    },
    /// Attempted to re-configure the clocks, calling `init` twice.
    AlreadyConfigured,
}

impl ClockError {
    fn bad_config(reason: &'static str) -> Self {
        Self::BadConfiguration { reason }
    }
}

impl fmt::Display for ClockError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClockError::InvalidTransition { from, to } => {
                write!(f, "no transition from {} to {}", from.name(), to.name())
            }
            ClockError::UnsupportedReferenceFrequency { khz } => {
                write!(f, "no reference divider for {khz} kHz")
            }
            ClockError::ClockSourceTimeout => f.write_str("clock source did not switch"),
            ClockError::OscillatorNotReady => f.write_str("oscillator did not initialize"),
            ClockError::ClockNotLocked => f.write_str("FLL did not lock"),
            ClockError::UnknownMode { clks } => write!(f, "reserved clock select {clks:#04b}"),
            ClockError::BadConfiguration { reason } => write!(f, "bad clock configuration: {reason}"),
            ClockError::AlreadyConfigured => f.write_str("clocks already configured"),
        }
    }
}

/// One micro-step of a mode transition.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// Program and start the external oscillator
    EnableOscillator,
    /// Write `C1[RDIV]` with the selected reference divider
    SetReferenceDivider,
    /// Write `C1[IREFS]`
    SelectReference(ReferenceSource),
    /// Write `C1[CLKS]`
    SelectClock(ClockSource),
    /// Write `C2[LP]`
    LowPower(bool),
    /// Wait for `S[IREFST]` to report the reference
    WaitReference(ReferenceSource),
    /// Wait for `S[CLKST]` to report the clock source
    WaitClock(ClockSource),
    /// Wait for `S[LOCK]`
    WaitLock,
    /// Write-one-to-clear `S[LOLS]`
    ClearLossOfLock,
    /// Bring `C2[BDIV]` to the mode's required value
    FixBusDivider(BusDivider),
    /// Return `OSC_CR` to reset
    DisableOscillator,
}

mod sequences {
    use super::config::BusDivider::{Div1, Div2};
    use super::config::{ClockSource, ReferenceSource};
    use super::Step::{self, *};

    const IRC: ReferenceSource = ReferenceSource::Internal;
    const EXT: ReferenceSource = ReferenceSource::External;
    const FLL: ClockSource = ClockSource::Fll;
    const INT: ClockSource = ClockSource::Internal;
    const XTL: ClockSource = ClockSource::External;

    pub(super) const FEI_FEE: &[Step] = &[
        EnableOscillator,
        SetReferenceDivider,
        SelectReference(EXT),
        WaitReference(EXT),
        WaitLock,
        FixBusDivider(Div1),
        ClearLossOfLock,
    ];
    pub(super) const FEI_FBI: &[Step] = &[
        SelectClock(INT),
        LowPower(false),
        WaitClock(INT),
        FixBusDivider(Div2),
        ClearLossOfLock,
    ];
    pub(super) const FEI_FBE: &[Step] = &[
        EnableOscillator,
        SetReferenceDivider,
        SelectReference(EXT),
        SelectClock(XTL),
        LowPower(false),
        WaitClock(XTL),
        WaitReference(EXT),
        FixBusDivider(Div2),
        ClearLossOfLock,
    ];
    pub(super) const FEE_FEI: &[Step] = &[
        SelectReference(IRC),
        WaitReference(IRC),
        WaitLock,
        ClearLossOfLock,
        FixBusDivider(Div1),
        DisableOscillator,
    ];
    pub(super) const FEE_FBI: &[Step] = &[
        ClearLossOfLock,
        SelectReference(IRC),
        SelectClock(INT),
        LowPower(false),
        WaitReference(IRC),
        WaitClock(INT),
        FixBusDivider(Div2),
        DisableOscillator,
    ];
    pub(super) const FEE_FBE: &[Step] = &[
        ClearLossOfLock,
        SelectClock(XTL),
        LowPower(false),
        WaitClock(XTL),
        FixBusDivider(Div2),
    ];
    pub(super) const FBI_FBE: &[Step] = &[
        EnableOscillator,
        SetReferenceDivider,
        SelectReference(EXT),
        SelectClock(XTL),
        WaitClock(XTL),
        WaitReference(EXT),
        FixBusDivider(Div2),
    ];
    pub(super) const FBI_FEE: &[Step] = &[
        EnableOscillator,
        SetReferenceDivider,
        SelectReference(EXT),
        SelectClock(FLL),
        WaitClock(FLL),
        WaitReference(EXT),
        WaitLock,
        FixBusDivider(Div1),
        ClearLossOfLock,
    ];
    pub(super) const FBI_FEI: &[Step] = &[
        SelectReference(IRC),
        SelectClock(FLL),
        LowPower(false),
        WaitClock(FLL),
        WaitReference(IRC),
        WaitLock,
        FixBusDivider(Div1),
        ClearLossOfLock,
    ];
    pub(super) const FBE_FBI: &[Step] = &[
        SelectReference(IRC),
        SelectClock(INT),
        WaitClock(INT),
        WaitReference(IRC),
        FixBusDivider(Div2),
        DisableOscillator,
    ];
    pub(super) const FBE_FEE: &[Step] = &[
        SetReferenceDivider,
        SelectClock(FLL),
        WaitClock(FLL),
        WaitLock,
        FixBusDivider(Div1),
        ClearLossOfLock,
    ];
    pub(super) const FBE_FEI: &[Step] = &[
        SelectReference(IRC),
        SelectClock(FLL),
        WaitClock(FLL),
        WaitReference(IRC),
        WaitLock,
        FixBusDivider(Div1),
        ClearLossOfLock,
        DisableOscillator,
    ];
    pub(super) const ENTER_LOW_POWER: &[Step] = &[LowPower(true)];
    pub(super) const LEAVE_LOW_POWER: &[Step] = &[LowPower(false)];
}

/// The ordered micro-steps that move the hardware from `from` to `to`.
///
/// Returns `None` for edges that are not legal, including every self-edge.
pub fn transition_steps(from: ClockMode, to: ClockMode) -> Option<&'static [Step]> {
    use ClockMode::{
        FbeExternalBypassed as Fbe, FbelpExternalBypassedLowPower as Fbelp, FbiInternalBypassed as Fbi,
        FbilpInternalBypassedLowPower as Fbilp, FeeExternalLocked as Fee, FeiInternalLocked as Fei,
    };

    let steps = match (from, to) {
        (Fei, Fee) => sequences::FEI_FEE,
        (Fei, Fbi) => sequences::FEI_FBI,
        (Fei, Fbe) => sequences::FEI_FBE,
        (Fee, Fei) => sequences::FEE_FEI,
        (Fee, Fbi) => sequences::FEE_FBI,
        (Fee, Fbe) => sequences::FEE_FBE,
        (Fbi, Fbe) => sequences::FBI_FBE,
        (Fbi, Fee) => sequences::FBI_FEE,
        (Fbi, Fbilp) => sequences::ENTER_LOW_POWER,
        (Fbi, Fei) => sequences::FBI_FEI,
        (Fbe, Fbi) => sequences::FBE_FBI,
        (Fbe, Fee) => sequences::FBE_FEE,
        (Fbe, Fei) => sequences::FBE_FEI,
        (Fbe, Fbelp) => sequences::ENTER_LOW_POWER,
        (Fbelp, Fbe) => sequences::LEAVE_LOW_POWER,
        (Fbilp, Fbi) => sequences::LEAVE_LOW_POWER,
        _ => return None,
    };
    Some(steps)
}

/// Legal path from the reset mode (FEI) to `target`, excluding FEI itself.
fn boot_path(target: ClockMode) -> &'static [ClockMode] {
    match target {
        ClockMode::FeiInternalLocked => &[],
        ClockMode::FeeExternalLocked => &[ClockMode::FeeExternalLocked],
        ClockMode::FbiInternalBypassed => &[ClockMode::FbiInternalBypassed],
        ClockMode::FbilpInternalBypassedLowPower => &[
            ClockMode::FbiInternalBypassed,
            ClockMode::FbilpInternalBypassedLowPower,
        ],
        ClockMode::FbeExternalBypassed => &[ClockMode::FbeExternalBypassed],
        ClockMode::FbelpExternalBypassedLowPower => &[
            ClockMode::FbeExternalBypassed,
            ClockMode::FbelpExternalBypassedLowPower,
        ],
    }
}

/// Owning handle over the ICS and OSC register blocks.
///
/// Not `Clone`: holding the controller is what serializes register access.
/// Everything that writes takes `&mut self`, so a transition can never
/// interleave with another one or with [`refresh`](Self::refresh).
#[derive(Debug)]
pub struct IcsController<R, T> {
    regs: R,
    time: T,
    config: ClockConfig,
    external_khz: u32,
    core_clk: u32,
    published: bool,
}

impl<R: IcsRegisters, T: TimeSource> IcsController<R, T> {
    /// Take ownership of the registers. Nothing is written.
    pub fn new(regs: R, time: T, config: ClockConfig) -> Self {
        let mut this = Self {
            regs,
            time,
            config,
            external_khz: config.external_khz(),
            core_clk: 0,
            published: false,
        };
        this.refresh();
        this
    }

    /// The mode the hardware is in right now.
    pub fn mode(&self) -> Result<ClockMode, ClockError> {
        let clks = self.regs.clks();
        ClockMode::decode(clks, self.regs.irefs() != 0, self.regs.lp() != 0).ok_or(ClockError::UnknownMode { clks })
    }

    /// Move from the current mode to `request.target`.
    ///
    /// Illegal edges and bad parameters are rejected before the first
    /// register write. A wait that times out aborts the transition and
    /// leaves the registers as far as they got; call [`mode`](Self::mode)
    /// or [`refresh`](Self::refresh) before relying on any frequency.
    pub fn transition(&mut self, request: &ClockRequest) -> Result<ClockMode, ClockError> {
        let from = self.mode()?;
        let to = request.target;
        let steps = transition_steps(from, to).ok_or(ClockError::InvalidTransition { from, to })?;

        let external = to.reference() == ReferenceSource::External;
        let khz = if request.external_khz != 0 {
            request.external_khz
        } else {
            self.external_khz
        };
        if external && khz == 0 {
            return Err(ClockError::bad_config("external mode requested without an external reference"));
        }
        let request = ClockRequest {
            external_khz: khz,
            ..*request
        };
        let rdiv = if steps.contains(&Step::SetReferenceDivider) {
            Some(self.config.divider_policy.select(khz)?)
        } else {
            None
        };

        debug!("ics: {} -> {}", from.name(), to.name());
        let mut operator = ClockOperator {
            regs: &mut self.regs,
            time: &mut self.time,
            config: &self.config,
            request: &request,
            rdiv,
        };
        if let Some(value) = request.trim {
            operator.trim(from, value)?;
        }
        let result = operator.run(steps);

        if external {
            self.external_khz = khz;
        }
        self.refresh();
        result.map(|()| to)
    }

    /// Bring the hardware from any state to `request.target`.
    ///
    /// Resets the ICS to FEI, applies the trim, follows the legal path to
    /// the target and finally sets the bus divider to divide-by-1.
    pub fn initialize(&mut self, request: &ClockRequest) -> Result<ClockMode, ClockError> {
        self.deinit()?;
        if let Some(value) = request.trim {
            self.trim(value)?;
        }
        for &hop in boot_path(request.target) {
            self.transition(&ClockRequest {
                target: hop,
                trim: None,
                ..*request
            })?;
        }
        self.regs.set_bdiv(BusDivider::Div1.bits());
        self.refresh();
        self.mode()
    }

    /// Write the 9 bit IRC trim and wait for the FLL to re-lock if it runs.
    pub fn trim(&mut self, value: u16) -> Result<(), ClockError> {
        let mode = self.mode()?;
        let request = ClockRequest::new(mode);
        let mut operator = ClockOperator {
            regs: &mut self.regs,
            time: &mut self.time,
            config: &self.config,
            request: &request,
            rdiv: None,
        };
        operator.trim(mode, value)
    }

    /// Return the ICS and OSC to their power-on-reset state (FEI, BDIV = /2).
    pub fn deinit(&mut self) -> Result<(), ClockError> {
        let request = ClockRequest::new(ClockMode::FeiInternalLocked);
        let mut operator = ClockOperator {
            regs: &mut self.regs,
            time: &mut self.time,
            config: &self.config,
            request: &request,
            rdiv: None,
        };
        let result = operator.deinit();
        self.refresh();
        result
    }

    /// Recompute the core clock from the registers and cache it.
    pub fn refresh(&mut self) -> u32 {
        let snapshot = Snapshot::capture(&self.regs);
        self.core_clk = recompute_core_clock(&snapshot, self.external_khz);
        if self.published {
            match self.clocks_from(&snapshot) {
                Ok(clocks) => critical_section::with(|cs| {
                    *CLOCKS.borrow_ref_mut(cs) = Some(clocks);
                }),
                Err(_) => warn!("clocks: not republished, mode undecodable"),
            }
        }
        self.core_clk
    }

    /// Core clock in Hz as of the last [`refresh`](Self::refresh).
    pub fn core_clock(&self) -> u32 {
        self.core_clk
    }

    /// Snapshot of the whole clock tree.
    pub fn clocks(&self) -> Result<Clocks, ClockError> {
        self.clocks_from(&Snapshot::capture(&self.regs))
    }

    /// Frequency of one derived clock, in Hz.
    pub fn clock(&self, kind: ClockKind) -> Result<u32, ClockError> {
        Ok(derive_clock(&self.clocks()?, kind))
    }

    /// Give the registers and time source back.
    pub fn release(self) -> (R, T) {
        (self.regs, self.time)
    }

    fn clocks_from(&self, snapshot: &Snapshot) -> Result<Clocks, ClockError> {
        let mode = ClockMode::decode(snapshot.clks, snapshot.irefs, snapshot.lp)
            .ok_or(ClockError::UnknownMode { clks: snapshot.clks })?;
        Ok(Clocks {
            mode,
            core_clk: recompute_core_clock(snapshot, self.external_khz),
            external_khz: self.external_khz,
            rdiv: snapshot.rdiv,
            busdiv: snapshot.busdiv,
            busref: snapshot.busref,
        })
    }
}

struct ClockOperator<'a, R: ?Sized, T: ?Sized> {
    regs: &'a mut R,
    time: &'a mut T,
    config: &'a ClockConfig,
    request: &'a ClockRequest,
    rdiv: Option<u8>,
}

impl<R: IcsRegisters + ?Sized, T: TimeSource + ?Sized> ClockOperator<'_, R, T> {
    fn run(&mut self, steps: &[Step]) -> Result<(), ClockError> {
        for &step in steps {
            trace!("ics: {:?}", step);
            self.step(step)?;
        }
        Ok(())
    }

    fn step(&mut self, step: Step) -> Result<(), ClockError> {
        match step {
            Step::EnableOscillator => osc::configure(
                self.regs,
                self.time,
                &self.request.oscillator(),
                self.config.timeouts.oscillator_us,
            )?,
            Step::SetReferenceDivider => {
                let rdiv = self
                    .rdiv
                    .ok_or(ClockError::bad_config("no reference divider selected"))?;
                self.regs.set_rdiv(rdiv);
            }
            Step::SelectReference(source) => self.regs.set_irefs(internal_bit(source)),
            Step::SelectClock(source) => self.regs.set_clks(source.bits()),
            Step::LowPower(enabled) => self.regs.set_lp(enabled as u8),
            Step::WaitReference(source) => {
                let expected = internal_bit(source);
                let regs = &*self.regs;
                if !wait_until(self.time, self.config.timeouts.reference_us, || regs.irefst() == expected) {
                    warn!("ics: IREFST stuck at {}", regs.irefst());
                    return Err(ClockError::ClockSourceTimeout);
                }
            }
            Step::WaitClock(source) => {
                let expected = source.bits();
                let regs = &*self.regs;
                if !wait_until(self.time, self.config.timeouts.clock_source_us, || regs.clkst() == expected) {
                    warn!("ics: CLKST stuck at {}", regs.clkst());
                    return Err(ClockError::ClockSourceTimeout);
                }
            }
            Step::WaitLock => self.wait_lock()?,
            Step::ClearLossOfLock => clear_loss_of_lock(self.regs),
            Step::FixBusDivider(divider) => self.fix_bus_divider(divider),
            Step::DisableOscillator => osc::disable(self.regs),
        }
        Ok(())
    }

    fn wait_lock(&mut self) -> Result<(), ClockError> {
        let regs = &*self.regs;
        if !wait_until(self.time, self.config.timeouts.lock_us, || regs.lock() != 0) {
            warn!("ics: FLL not locked after {} us", self.config.timeouts.lock_us);
            return Err(ClockError::ClockNotLocked);
        }
        Ok(())
    }

    fn fix_bus_divider(&mut self, divider: BusDivider) {
        match self.config.silicon {
            Silicon::Nv32 if self.regs.bdiv() == divider.bits() => {}
            Silicon::Nv32 => self.regs.set_bdiv(divider.bits()),
            Silicon::Generic => self.regs.set_bdiv(BusDivider::Div1.bits()),
        }
    }

    fn trim(&mut self, mode: ClockMode, value: u16) -> Result<(), ClockError> {
        trace!("ics: trim {}", value);
        self.regs.write(Reg::C3, value as u8);
        self.regs.set_scftrim(((value >> 8) & 1) as u8);
        if mode.fll_running() {
            self.wait_lock()?;
        }
        Ok(())
    }

    fn deinit(&mut self) -> Result<(), ClockError> {
        for reg in [Reg::C1, Reg::C2, Reg::C3, Reg::C4] {
            self.regs.write(reg, reg.reset_value());
        }
        let expected = Reg::S.reset_value() & !LOLS_MASK;
        let regs = &*self.regs;
        if !wait_until(self.time, self.config.timeouts.clock_source_us, || {
            regs.read(Reg::S) & !LOLS_MASK == expected
        }) {
            warn!("ics: status did not return to reset");
            return Err(ClockError::ClockSourceTimeout);
        }
        clear_loss_of_lock(self.regs);
        osc::disable(self.regs);
        Ok(())
    }
}

fn internal_bit(source: ReferenceSource) -> u8 {
    match source {
        ReferenceSource::Internal => 1,
        ReferenceSource::External => 0,
    }
}

/// In MOST cases, peripherals should determine their clock frequency by
/// calling [`get_clock`].
///
/// For cases where you REALLY want to view the full clock state, this
/// function can be used to view the clocks.
///
/// This function runs the provided closure *inside of a critical section*, so move with
/// purpose! You can clone-out the Clocks struct if necessary, or perform a more directed
/// query and return that instead.
///
/// Returns `None` if the clocks have not yet been initialized.
pub fn with_clocks<F: FnOnce(&Clocks) -> R, R>(f: F) -> Option<R> {
    critical_section::with(|cs| {
        let c = CLOCKS.borrow_ref(cs);
        let c = c.as_ref()?;
        Some(f(c))
    })
}

/// Frequency of `kind` in Hz, or `None` before [`init`].
pub fn get_clock(kind: ClockKind) -> Option<u32> {
    with_clocks(|clocks| derive_clock(clocks, kind))
}

#[cfg(test)]
mod tests {
    use super::config::{ExternalKind, Reference, Timeouts};
    use super::regs::{Reg, BDIV_MASK, CLKS_MASK, IREFS_MASK, OSCINIT_MASK, RDIV_MASK};
    use super::sim::{SimRegisters, SimTime, Stuck};
    use super::*;

    const XTAL_KHZ: u32 = 10_000;

    fn config() -> ClockConfig {
        ClockConfig {
            reference: Reference::External {
                khz: XTAL_KHZ,
                kind: ExternalKind::Crystal,
                high_gain: true,
                stop_enabled: false,
            },
            trim: None,
            timeouts: Timeouts {
                reference_us: 50,
                clock_source_us: 50,
                lock_us: 50,
                oscillator_us: 50,
            },
            ..Default::default()
        }
    }

    fn controller(mode: ClockMode, config: ClockConfig) -> IcsController<SimRegisters, SimTime> {
        IcsController::new(SimRegisters::in_mode(mode), SimTime::default(), config)
    }

    fn request(target: ClockMode) -> ClockRequest {
        ClockRequest::new(target).with_external(XTAL_KHZ, ExternalKind::Crystal)
    }

    fn assert_fields(regs: &SimRegisters, mode: ClockMode) {
        assert_eq!(regs.clks(), mode.clock_source().bits(), "CLKS for {}", mode.name());
        assert_eq!(
            regs.irefs() != 0,
            mode.reference() == ReferenceSource::Internal,
            "IREFS for {}",
            mode.name()
        );
        assert_eq!(regs.lp() != 0, mode.is_low_power(), "LP for {}", mode.name());
        assert_eq!(regs.bdiv(), mode.bus_divider().bits(), "BDIV for {}", mode.name());
    }

    #[test]
    fn every_legal_edge_lands_on_its_target() {
        for from in ClockMode::ALL {
            for to in ClockMode::ALL {
                if transition_steps(from, to).is_none() {
                    continue;
                }
                let mut ics = controller(from, config());
                assert_eq!(ics.transition(&request(to)), Ok(to), "{} -> {}", from.name(), to.name());
                assert_eq!(ics.mode(), Ok(to));
                let (regs, _) = ics.release();
                assert_fields(&regs, to);
            }
        }
    }

    #[test]
    fn illegal_edges_write_nothing() {
        let mut illegal = 0;
        for from in ClockMode::ALL {
            for to in ClockMode::ALL {
                if transition_steps(from, to).is_some() {
                    continue;
                }
                illegal += 1;
                let mut ics = controller(from, config());
                assert_eq!(
                    ics.transition(&request(to)),
                    Err(ClockError::InvalidTransition { from, to })
                );
                assert_eq!(ics.release().0.write_count(), 0);
            }
        }
        // 36 pairs, 16 edges
        assert_eq!(illegal, 20);
    }

    #[test]
    fn self_edges_are_rejected() {
        for mode in ClockMode::ALL {
            assert_eq!(transition_steps(mode, mode), None);
        }
    }

    #[test]
    fn external_target_needs_a_reference() {
        let config = ClockConfig {
            reference: Reference::Internal,
            ..config()
        };
        let mut ics = controller(ClockMode::FeiInternalLocked, config);
        assert_eq!(
            ics.transition(&ClockRequest::new(ClockMode::FeeExternalLocked)),
            Err(ClockError::bad_config("external mode requested without an external reference"))
        );
        assert_eq!(ics.release().0.write_count(), 0);
    }

    #[test]
    fn unsupported_crystal_writes_nothing() {
        let mut ics = controller(ClockMode::FeiInternalLocked, config());
        let request = ClockRequest::new(ClockMode::FeeExternalLocked).with_external(100_000, ExternalKind::Crystal);
        assert_eq!(
            ics.transition(&request),
            Err(ClockError::UnsupportedReferenceFrequency { khz: 100_000 })
        );
        assert_eq!(ics.release().0.write_count(), 0);
    }

    #[test]
    fn low_range_crystal_writes_nothing() {
        let mut ics = controller(ClockMode::FeiInternalLocked, config());
        let request = ClockRequest::new(ClockMode::FeeExternalLocked).with_external(100, ExternalKind::Crystal);
        assert_eq!(
            ics.transition(&request),
            Err(ClockError::UnsupportedReferenceFrequency { khz: 100 })
        );
        assert_eq!(ics.mode(), Ok(ClockMode::FeiInternalLocked));
        assert_eq!(ics.release().0.write_count(), 0);
    }

    #[test]
    fn legacy_policy_rejects_unlisted_crystals() {
        let config = ClockConfig {
            divider_policy: config::DividerPolicy::LegacyTable,
            ..config()
        };
        let mut ics = controller(ClockMode::FeiInternalLocked, config);
        let request = ClockRequest::new(ClockMode::FbeExternalBypassed).with_external(6_000, ExternalKind::Crystal);
        assert_eq!(
            ics.transition(&request),
            Err(ClockError::UnsupportedReferenceFrequency { khz: 6_000 })
        );
    }

    #[test]
    fn reserved_clock_select_is_reported() {
        let mut ics = controller(ClockMode::FeiInternalLocked, config());
        let (regs, time) = ics.release();
        regs.raw_set(Reg::C1, regs.raw(Reg::C1) | CLKS_MASK);
        ics = IcsController::new(regs, time, config());
        assert_eq!(ics.mode(), Err(ClockError::UnknownMode { clks: 3 }));
        assert_eq!(
            ics.transition(&request(ClockMode::FeeExternalLocked)),
            Err(ClockError::UnknownMode { clks: 3 })
        );
        assert!(ics.clocks().is_err());
    }

    #[test]
    fn rdiv_follows_the_crystal() {
        let mut ics = controller(ClockMode::FeiInternalLocked, config());
        let request = ClockRequest::new(ClockMode::FeeExternalLocked).with_external(20_000, ExternalKind::Crystal);
        ics.transition(&request).unwrap();
        assert_eq!(ics.clocks().unwrap().rdiv, 4);
        assert_eq!(ics.core_clock(), 50_000_000);
    }

    #[test]
    fn oscillator_only_runs_in_external_modes() {
        let external = [ClockMode::FeeExternalLocked, ClockMode::FbeExternalBypassed];
        let internal = [ClockMode::FeiInternalLocked, ClockMode::FbiInternalBypassed];
        for from in external {
            for to in internal {
                let mut ics = controller(from, config());
                ics.transition(&request(to)).unwrap();
                assert_eq!(ics.release().0.raw(Reg::OscCr), 0, "{} -> {}", from.name(), to.name());
            }
        }
        for from in internal {
            for to in external {
                let mut ics = controller(from, config());
                ics.transition(&request(to)).unwrap();
                let (regs, _) = ics.release();
                assert_eq!(regs.oscen(), 1, "{} -> {}", from.name(), to.name());
                assert_eq!(regs.oscos(), 1);
                assert_eq!(regs.range(), 1);
            }
        }
    }

    #[test]
    fn clock_input_skips_the_oscillator_wait() {
        let mut ics = controller(ClockMode::FeiInternalLocked, config());
        let (mut regs, time) = ics.release();
        regs.stuck.oscillator = true;
        ics = IcsController::new(regs, time, config());
        let request = ClockRequest::new(ClockMode::FbeExternalBypassed).with_external(XTAL_KHZ, ExternalKind::ClockInput);
        assert_eq!(ics.transition(&request), Ok(ClockMode::FbeExternalBypassed));
        assert_eq!(ics.release().0.oscos(), 0);
    }

    fn stuck_transition(from: ClockMode, to: ClockMode, stuck: Stuck) -> ClockError {
        let mut regs = SimRegisters::in_mode(from);
        regs.stuck = stuck;
        let mut ics = IcsController::new(regs, SimTime::default(), config());
        ics.transition(&request(to)).unwrap_err()
    }

    #[test]
    fn stuck_status_times_out() {
        let reference = Stuck {
            reference: true,
            ..Default::default()
        };
        let clock = Stuck {
            clock: true,
            ..Default::default()
        };
        let lock = Stuck {
            lock: true,
            ..Default::default()
        };
        let oscillator = Stuck {
            oscillator: true,
            ..Default::default()
        };
        use ClockMode::{FbiInternalBypassed as Fbi, FeeExternalLocked as Fee, FeiInternalLocked as Fei};
        assert_eq!(stuck_transition(Fei, Fee, reference), ClockError::ClockSourceTimeout);
        assert_eq!(stuck_transition(Fei, Fbi, clock), ClockError::ClockSourceTimeout);
        assert_eq!(stuck_transition(Fbi, Fei, lock), ClockError::ClockNotLocked);
        assert_eq!(stuck_transition(Fei, Fee, oscillator), ClockError::OscillatorNotReady);
    }

    #[test]
    fn timeout_leaves_partial_state() {
        let mut regs = SimRegisters::in_mode(ClockMode::FeiInternalLocked);
        regs.stuck.lock = true;
        let mut ics = IcsController::new(regs, SimTime::default(), config());
        assert_eq!(
            ics.transition(&request(ClockMode::FeeExternalLocked)),
            Err(ClockError::ClockNotLocked)
        );
        // reference already switched, loss of lock not yet cleared
        assert_eq!(ics.mode(), Ok(ClockMode::FeeExternalLocked));
        let (regs, _) = ics.release();
        assert_ne!(regs.raw(Reg::S) & LOLS_MASK, 0);
        assert_eq!(regs.oscen(), 1);
    }

    #[test]
    fn lock_clears_loss_of_lock() {
        let mut ics = controller(ClockMode::FeiInternalLocked, config());
        ics.transition(&request(ClockMode::FeeExternalLocked)).unwrap();
        let (regs, _) = ics.release();
        assert_eq!(regs.raw(Reg::S) & LOLS_MASK, 0);
    }

    #[test]
    fn writes_follow_the_hardware_order() {
        use ClockMode::{
            FbeExternalBypassed as Fbe, FbiInternalBypassed as Fbi, FeeExternalLocked as Fee, FeiInternalLocked as Fei,
        };

        // (from, to, starts the oscillator, stops the oscillator, waits for lock)
        let edges = [
            (Fei, Fee, true, false, true),
            (Fei, Fbe, true, false, false),
            (Fbi, Fee, true, false, true),
            (Fee, Fei, false, true, true),
            (Fbe, Fei, false, true, true),
        ];
        for (from, to, starts, stops, locks) in edges {
            let name = format!("{} -> {}", from.name(), to.name());
            let mut ics = controller(from, config());
            assert_eq!(ics.transition(&request(to)), Ok(to), "{name}");
            let (regs, _) = ics.release();
            let writes = &regs.writes;

            // the FLL never sees the external reference undivided
            for &(reg, value) in writes {
                if reg == Reg::C1 && value & IREFS_MASK == 0 {
                    assert_eq!((value & RDIV_MASK) >> 3, 3, "{name}: C1 {value:#04x}");
                }
            }

            if starts {
                let osc = writes.iter().position(|&(reg, _)| reg == Reg::OscCr).unwrap();
                let external = writes
                    .iter()
                    .position(|&(reg, value)| reg == Reg::C1 && value & IREFS_MASK == 0)
                    .unwrap();
                assert!(osc < external, "{name}: {writes:?}");
            }

            if stops {
                assert_eq!(writes.last(), Some(&(Reg::OscCr, 0)), "{name}");
            }

            if locks {
                let c1 = writes.iter().rposition(|&(reg, _)| reg == Reg::C1).unwrap();
                let clear = writes
                    .iter()
                    .rposition(|&(reg, value)| reg == Reg::S && value & LOLS_MASK != 0)
                    .unwrap();
                assert!(clear > c1, "{name}: {writes:?}");
            }
        }
    }

    #[test]
    fn clock_input_reaches_fee_without_oscinit() {
        let mut regs = SimRegisters::in_mode(ClockMode::FeiInternalLocked);
        regs.stuck.oscillator = true;
        let mut ics = IcsController::new(regs, SimTime::default(), config());
        let request = ClockRequest::new(ClockMode::FeeExternalLocked).with_external(XTAL_KHZ, ExternalKind::ClockInput);
        assert_eq!(ics.transition(&request), Ok(ClockMode::FeeExternalLocked));
        let (regs, _) = ics.release();
        assert_eq!(regs.oscen(), 1);
        assert_eq!(regs.oscos(), 0);
        assert_eq!(regs.raw(Reg::OscCr) & OSCINIT_MASK, 0);
    }

    #[test]
    fn fee_to_fbe_keeps_the_reference_divider() {
        let mut ics = controller(ClockMode::FeeExternalLocked, config());
        let request = ClockRequest::new(ClockMode::FbeExternalBypassed).with_external(20_000, ExternalKind::Crystal);
        assert_eq!(ics.transition(&request), Ok(ClockMode::FbeExternalBypassed));
        let (regs, _) = ics.release();
        assert_eq!(regs.rdiv(), 3);
        for value in regs.writes_to(Reg::C1) {
            assert_eq!((value & RDIV_MASK) >> 3, 3, "C1 {value:#04x}");
        }
    }

    #[test]
    fn nv32_skips_redundant_divider_writes() {
        let mut ics = controller(ClockMode::FbeExternalBypassed, config());
        ics.transition(&request(ClockMode::FbiInternalBypassed)).unwrap();
        let (regs, _) = ics.release();
        assert!(regs.writes_to(Reg::C2).is_empty());
        assert_eq!(regs.bdiv(), BusDivider::Div2.bits());

        let generic = ClockConfig {
            silicon: Silicon::Generic,
            ..config()
        };
        let mut ics = controller(ClockMode::FbeExternalBypassed, generic);
        ics.transition(&request(ClockMode::FbiInternalBypassed)).unwrap();
        let (regs, _) = ics.release();
        assert_eq!(regs.writes_to(Reg::C2), vec![regs.raw(Reg::C2)]);
        assert_eq!(regs.bdiv(), 0);
    }

    #[test]
    fn generic_silicon_always_writes_divide_by_one() {
        let mut ics = controller(ClockMode::FeiInternalLocked, config());
        ics.transition(&request(ClockMode::FbeExternalBypassed)).unwrap();
        assert_eq!(ics.release().0.bdiv(), BusDivider::Div2.bits());

        let generic = ClockConfig {
            silicon: Silicon::Generic,
            ..config()
        };
        let mut ics = controller(ClockMode::FeiInternalLocked, generic);
        ics.transition(&request(ClockMode::FbeExternalBypassed)).unwrap();
        let (regs, _) = ics.release();
        let c2 = regs.writes_to(Reg::C2);
        // LP cleared, then BDIV
        assert_eq!(c2.len(), 2);
        assert!(c2.iter().all(|value| value & BDIV_MASK == 0), "{c2:?}");
        assert_eq!(regs.bdiv(), 0);
    }

    #[test]
    fn low_power_is_a_single_write() {
        let mut ics = controller(ClockMode::FbeExternalBypassed, config());
        ics.transition(&request(ClockMode::FbelpExternalBypassedLowPower)).unwrap();
        let (regs, _) = ics.release();
        assert_eq!(regs.write_count(), 1);
        assert_eq!(regs.lp(), 1);
    }

    #[test]
    fn initialize_reaches_every_mode() {
        let expected = [
            (ClockMode::FeiInternalLocked, 48_000_000),
            (ClockMode::FeeExternalLocked, 50_000_000),
            (ClockMode::FbeExternalBypassed, 10_000_000),
            (ClockMode::FbelpExternalBypassedLowPower, 10_000_000),
            // bypass reports the configured external reference
            (ClockMode::FbiInternalBypassed, 10_000_000),
            (ClockMode::FbilpInternalBypassedLowPower, 10_000_000),
        ];
        for (target, hz) in expected {
            let mut ics = IcsController::new(SimRegisters::new(), SimTime::default(), config());
            let request = ClockRequest {
                trim: Some(0x29),
                ..request(target)
            };
            assert_eq!(ics.initialize(&request), Ok(target), "{}", target.name());
            assert_eq!(ics.core_clock(), hz, "{}", target.name());
            let (regs, _) = ics.release();
            assert_eq!(regs.bdiv(), 0);
            assert_eq!(regs.sctrim(), 0x29);
        }
    }

    #[test]
    fn initialize_from_a_dirty_state() {
        let mut ics = controller(ClockMode::FbelpExternalBypassedLowPower, config());
        let request = ClockRequest::new(ClockMode::FeiInternalLocked);
        assert_eq!(ics.initialize(&request), Ok(ClockMode::FeiInternalLocked));
        assert_eq!(ics.core_clock(), 48_000_000);
        assert_eq!(ics.release().0.raw(Reg::OscCr), 0);
    }

    #[test]
    fn internal_only_bypass_falls_back_to_32k() {
        let config = ClockConfig {
            reference: Reference::Internal,
            fll: config::FllSetting::Bypassed,
            ..config()
        };
        let mut ics = IcsController::new(SimRegisters::new(), SimTime::default(), config);
        ics.initialize(&config.request()).unwrap();
        assert_eq!(ics.core_clock(), 32_768);
    }

    #[test]
    fn trim_splits_across_c3_and_c4() {
        let mut ics = controller(ClockMode::FeiInternalLocked, config());
        ics.trim(0x1A5).unwrap();
        let (regs, _) = ics.release();
        assert_eq!(regs.sctrim(), 0xA5);
        assert_eq!(regs.scftrim(), 1);
    }

    #[test]
    fn trim_waits_for_lock_only_with_fll_running() {
        let mut regs = SimRegisters::in_mode(ClockMode::FeiInternalLocked);
        regs.stuck.lock = true;
        regs.latency = 0;
        let mut ics = IcsController::new(regs, SimTime::default(), config());
        assert_eq!(ics.trim(0x29), Err(ClockError::ClockNotLocked));

        let mut regs = SimRegisters::in_mode(ClockMode::FbilpInternalBypassedLowPower);
        regs.stuck.lock = true;
        let mut ics = IcsController::new(regs, SimTime::default(), config());
        assert_eq!(ics.trim(0x29), Ok(()));
    }

    #[test]
    fn trim_in_request_is_applied_after_the_legality_check() {
        let mut ics = controller(ClockMode::FeiInternalLocked, config());
        let bad = ClockRequest {
            trim: Some(0x10),
            ..request(ClockMode::FbelpExternalBypassedLowPower)
        };
        assert!(ics.transition(&bad).is_err());
        let good = ClockRequest {
            trim: Some(0x10),
            ..request(ClockMode::FbiInternalBypassed)
        };
        ics.transition(&good).unwrap();
        let (regs, _) = ics.release();
        assert_eq!(regs.writes[0], (Reg::C3, 0x10));
    }

    #[test]
    fn deinit_restores_reset_values() {
        let mut ics = controller(ClockMode::FeeExternalLocked, config());
        ics.deinit().unwrap();
        assert_eq!(ics.mode(), Ok(ClockMode::FeiInternalLocked));
        assert_eq!(ics.core_clock(), 24_000_000);
        let (regs, _) = ics.release();
        for reg in [Reg::C1, Reg::C2, Reg::C3, Reg::C4, Reg::OscCr] {
            assert_eq!(regs.raw(reg), reg.reset_value(), "{:?}", reg);
        }
        assert_eq!(regs.raw(Reg::S), 0x50);
    }

    #[test]
    fn deinit_times_out_when_lock_never_returns() {
        let mut regs = SimRegisters::in_mode(ClockMode::FbeExternalBypassed);
        regs.stuck.lock = true;
        let mut ics = IcsController::new(regs, SimTime::default(), config());
        assert_eq!(ics.deinit(), Err(ClockError::ClockSourceTimeout));
    }

    #[test]
    fn projections_use_sim_dividers() {
        let mut regs = SimRegisters::in_mode(ClockMode::FeiInternalLocked);
        regs.busdiv = 1;
        regs.sopt = 3 << regs::SIM_SOPT_BUSREF_SHIFT;
        let ics = IcsController::new(regs, SimTime::default(), config());
        assert_eq!(ics.clock(ClockKind::Core), Ok(48_000_000));
        assert_eq!(ics.clock(ClockKind::Bus), Ok(24_000_000));
        assert_eq!(ics.clock(ClockKind::Out), Ok(3_000_000));
    }

    #[test]
    fn errors_display() {
        let err = ClockError::InvalidTransition {
            from: ClockMode::FbelpExternalBypassedLowPower,
            to: ClockMode::FeiInternalLocked,
        };
        assert_eq!(err.to_string(), "no transition from FBELP to FEI");
        assert_eq!(
            ClockError::UnsupportedReferenceFrequency { khz: 5 }.to_string(),
            "no reference divider for 5 kHz"
        );
        assert_eq!(ClockError::UnknownMode { clks: 3 }.to_string(), "reserved clock select 0b11");
    }

    // The only test touching the global state.
    #[test]
    fn init_publishes_once() {
        assert_eq!(get_clock(ClockKind::Core), None);

        let mut ics = init(SimRegisters::new(), SimTime::default(), ClockConfig::default()).unwrap();
        assert_eq!(get_clock(ClockKind::Core), Some(48_000_000));
        assert_eq!(with_clocks(|c| c.mode), Some(ClockMode::FeiInternalLocked));

        let again = init(SimRegisters::new(), SimTime::default(), ClockConfig::default());
        assert_eq!(again.unwrap_err(), ClockError::AlreadyConfigured);

        ics.transition(&ClockRequest::new(ClockMode::FbiInternalBypassed)).unwrap();
        assert_eq!(get_clock(ClockKind::Core), Some(ics.core_clock()));
        assert_eq!(get_clock(ClockKind::Core), Some(16_384));
    }
}
