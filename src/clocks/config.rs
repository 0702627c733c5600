//! Board configuration, clock requests and the clock-mode vocabulary.

/// The six operating modes of the Internal Clock Source (ICS) block.
///
/// ```text
///                          ┌─────┐
///  internal ref ──────────▶│1    │ FLL reference
///  (IRC, 37.5k)            │     │─────┐     ┌─────┐ ┌──────────┐
///  external ref  ┌──────┐  │     │     └────▶│ FLL │ │          │
///  ─────────────▶│ RDIV │─▶│0    │           │x1280│─▶│00        │
///          │     └──────┘  └─────┘           └─────┘ │          │  ┌──────┐ ICSOUT
///          │                  ▲     internal ref ───▶│01        │─▶│ BDIV │──────▶
///          │                  │                      │          │  └──────┘
///          └───────────────────────────────────────▶│10        │      ▲
///                           C1[IREFS]                └──────────┘      │
///                                                         ▲          C2[BDIV]
///                                                         │
///                                                     C1[CLKS]
/// ```
///
/// Exactly one mode is active at a time. It is decoded from `C1[CLKS]`,
/// `C1[IREFS]` and `C2[LP]` by [`ClockMode::decode`], never stored on its own.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ClockMode {
    /// FLL engaged, internal reference. This is the reset mode.
    FeiInternalLocked,
    /// FLL bypassed, internal reference drives ICSOUT.
    FbiInternalBypassed,
    /// Like FBI with the FLL powered down.
    FbilpInternalBypassedLowPower,
    /// FLL engaged, external reference (after RDIV).
    FeeExternalLocked,
    /// FLL bypassed, external reference drives ICSOUT.
    FbeExternalBypassed,
    /// Like FBE with the FLL powered down.
    FbelpExternalBypassedLowPower,
}

impl ClockMode {
    /// All modes, in declaration order.
    pub const ALL: [ClockMode; 6] = [
        ClockMode::FeiInternalLocked,
        ClockMode::FbiInternalBypassed,
        ClockMode::FbilpInternalBypassedLowPower,
        ClockMode::FeeExternalLocked,
        ClockMode::FbeExternalBypassed,
        ClockMode::FbelpExternalBypassedLowPower,
    ];

    /// Decode the active mode from the raw `CLKS`, `IREFS` and `LP` fields.
    ///
    /// Returns `None` for the reserved clock-select code `0b11`.
    pub fn decode(clks: u8, irefs: bool, low_power: bool) -> Option<Self> {
        let mode = match (ClockSource::from_bits(clks)?, irefs, low_power) {
            (ClockSource::Fll, true, _) => ClockMode::FeiInternalLocked,
            (ClockSource::Fll, false, _) => ClockMode::FeeExternalLocked,
            (ClockSource::Internal, _, false) => ClockMode::FbiInternalBypassed,
            (ClockSource::Internal, _, true) => ClockMode::FbilpInternalBypassedLowPower,
            (ClockSource::External, _, false) => ClockMode::FbeExternalBypassed,
            (ClockSource::External, _, true) => ClockMode::FbelpExternalBypassedLowPower,
        };
        Some(mode)
    }

    /// The reference the mode runs from.
    pub fn reference(&self) -> ReferenceSource {
        match self {
            ClockMode::FeiInternalLocked
            | ClockMode::FbiInternalBypassed
            | ClockMode::FbilpInternalBypassedLowPower => ReferenceSource::Internal,
            ClockMode::FeeExternalLocked
            | ClockMode::FbeExternalBypassed
            | ClockMode::FbelpExternalBypassedLowPower => ReferenceSource::External,
        }
    }

    /// The `C1[CLKS]` selection the mode requires.
    pub fn clock_source(&self) -> ClockSource {
        match self {
            ClockMode::FeiInternalLocked | ClockMode::FeeExternalLocked => ClockSource::Fll,
            ClockMode::FbiInternalBypassed | ClockMode::FbilpInternalBypassedLowPower => ClockSource::Internal,
            ClockMode::FbeExternalBypassed | ClockMode::FbelpExternalBypassedLowPower => ClockSource::External,
        }
    }

    /// Returns `true` if `C2[LP]` is set in this mode.
    pub fn is_low_power(&self) -> bool {
        matches!(
            self,
            ClockMode::FbilpInternalBypassedLowPower | ClockMode::FbelpExternalBypassedLowPower
        )
    }

    /// Returns `true` if the FLL is powered in this mode and can report lock.
    pub fn fll_running(&self) -> bool {
        !self.is_low_power()
    }

    /// The bus divider the mode's transitions settle on.
    pub fn bus_divider(&self) -> BusDivider {
        match self.clock_source() {
            ClockSource::Fll => BusDivider::Div1,
            ClockSource::Internal | ClockSource::External => BusDivider::Div2,
        }
    }

    /// Short vendor name, e.g. `"FBELP"`.
    pub fn name(&self) -> &'static str {
        match self {
            ClockMode::FeiInternalLocked => "FEI",
            ClockMode::FbiInternalBypassed => "FBI",
            ClockMode::FbilpInternalBypassedLowPower => "FBILP",
            ClockMode::FeeExternalLocked => "FEE",
            ClockMode::FbeExternalBypassed => "FBE",
            ClockMode::FbelpExternalBypassedLowPower => "FBELP",
        }
    }
}

/// Reference clock feeding the FLL or the bypass path, `C1[IREFS]`.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReferenceSource {
    /// Internal reference clock (IRC)
    Internal,
    /// External crystal or clock input, through the OSC block
    External,
}

/// `C1[CLKS]` / `S[CLKST]` encoding.
///
/// ```text
///                ┌────┐
///  FLL out ─────▶│00  │
///  int. ref ────▶│01  │─────▶ ICSOUT (before BDIV)
///  ext. ref ────▶│10  │
///                └────┘
///                   ▲
///                C1[CLKS]
/// ```
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ClockSource {
    /// FLL output
    Fll = 0b00,
    /// Internal reference, FLL bypassed
    Internal = 0b01,
    /// External reference, FLL bypassed
    External = 0b10,
}

impl ClockSource {
    /// Decode a two bit field, `None` for the reserved `0b11`.
    pub fn from_bits(bits: u8) -> Option<Self> {
        match bits & 0b11 {
            0b00 => Some(ClockSource::Fll),
            0b01 => Some(ClockSource::Internal),
            0b10 => Some(ClockSource::External),
            _ => None,
        }
    }

    /// Raw field value.
    pub fn bits(self) -> u8 {
        self as u8
    }
}

/// `C2[BDIV]`: divider applied after the mode-selected clock.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BusDivider {
    /// ICSOUT = selected clock
    Div1 = 0,
    /// ICSOUT = selected clock / 2 (reset value)
    Div2 = 1,
}

impl BusDivider {
    /// Raw field value.
    pub fn bits(self) -> u8 {
        self as u8
    }
}

/// What sits on the EXTAL/XTAL pins.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExternalKind {
    /// Passive crystal driven by the OSC block. Needs `OSC_CR[OSCINIT]` before use.
    Crystal,
    /// Already oscillating clock input. Usable immediately.
    ClockInput,
}

/// Settings for the external oscillator block (`OSC_CR`).
///
/// ```text
///                ┌────────────┐  OSCOS
///  EXTAL ───────▶│ OSC        │───┐   ┌───┐ OSCOUT
///  XTAL ────────▶│ (HGO,RANGE)│   └──▶│1  │───────▶
///                └────────────┘ ┌───▶│0  │
///  EXTAL (clock in) ────────────┘    └───┘
/// ```
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct OscillatorConfig {
    /// `OSCEN`
    pub enabled: bool,
    /// `OSCOS`: crystal oscillator output instead of the raw EXTAL input
    pub crystal: bool,
    /// `HGO`: high gain instead of low power
    pub high_gain: bool,
    /// `RANGE`: 4-24 MHz instead of 32 kHz
    pub high_range: bool,
    /// `OSCSTEN`: keep running in stop mode
    pub stop_enabled: bool,
    /// Block until `OSCINIT` is reported
    pub wait_for_ready: bool,
}

/// Reference wiring of the board.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Reference {
    /// Only the internal reference is used
    Internal,
    /// An external part of `khz` kilohertz is fitted
    External {
        /// Frequency in kHz; `32` selects the low range
        khz: u32,
        /// Crystal or clock input
        kind: ExternalKind,
        /// High gain oscillator drive
        high_gain: bool,
        /// Keep the oscillator on in stop mode
        stop_enabled: bool,
    },
}

/// How the FLL should be used after boot.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum FllSetting {
    /// FLL multiplies the reference (FEI/FEE)
    #[default]
    Engaged,
    /// FLL running but bypassed (FBI/FBE)
    Bypassed,
    /// FLL powered down and bypassed (FBILP/FBELP)
    BypassedLowPower,
}

/// Silicon revision. Selects how the bus divider is fixed up.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Silicon {
    /// NV32: only write `BDIV` when it differs from the required value
    #[default]
    Nv32,
    /// Other parts of the family: write `BDIV` = 0 (divide-by-1) on every
    /// edge, whatever the mode
    Generic,
}

/// Which reference divider selection to use.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum DividerPolicy {
    /// Search for the smallest exponent that brings the reference under 40 kHz
    #[default]
    Search,
    /// Older firmware's fixed table. Only knows 32, 4000, 8000, 10000, 12000,
    /// 16000 and 20000 kHz.
    LegacyTable,
}

/// Bounds for every status poll, in microseconds.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Timeouts {
    /// `S[IREFST]` following `C1[IREFS]`
    pub reference_us: u32,
    /// `S[CLKST]` following `C1[CLKS]`
    pub clock_source_us: u32,
    /// `S[LOCK]`
    pub lock_us: u32,
    /// `OSC_CR[OSCINIT]`
    pub oscillator_us: u32,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            reference_us: 2_000,
            clock_source_us: 2_000,
            lock_us: 10_000,
            // 32 kHz crystals take hundreds of milliseconds to start
            oscillator_us: 1_000_000,
        }
    }
}

/// Board-level clock configuration, resolved once at startup.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ClockConfig {
    /// What drives the reference path
    pub reference: Reference,
    /// FLL usage after boot
    pub fll: FllSetting,
    /// IRC trim applied during initialization
    pub trim: Option<u16>,
    /// Silicon variant
    pub silicon: Silicon,
    /// RDIV selection
    pub divider_policy: DividerPolicy,
    /// Poll bounds
    pub timeouts: Timeouts,
}

impl Default for ClockConfig {
    /// FEI at 48 MHz, IRC trimmed to 0x29.
    fn default() -> Self {
        Self {
            reference: Reference::Internal,
            fll: FllSetting::Engaged,
            trim: Some(0x29),
            silicon: Silicon::Nv32,
            divider_policy: DividerPolicy::Search,
            timeouts: Timeouts::default(),
        }
    }
}

impl ClockConfig {
    /// The mode this configuration boots into.
    pub fn target_mode(&self) -> ClockMode {
        match (self.reference, self.fll) {
            (Reference::Internal, FllSetting::Engaged) => ClockMode::FeiInternalLocked,
            (Reference::Internal, FllSetting::Bypassed) => ClockMode::FbiInternalBypassed,
            (Reference::Internal, FllSetting::BypassedLowPower) => ClockMode::FbilpInternalBypassedLowPower,
            (Reference::External { .. }, FllSetting::Engaged) => ClockMode::FeeExternalLocked,
            (Reference::External { .. }, FllSetting::Bypassed) => ClockMode::FbeExternalBypassed,
            (Reference::External { .. }, FllSetting::BypassedLowPower) => ClockMode::FbelpExternalBypassedLowPower,
        }
    }

    /// The boot request implied by this configuration.
    pub fn request(&self) -> ClockRequest {
        let mut request = ClockRequest::new(self.target_mode());
        if let Reference::External {
            khz,
            kind,
            high_gain,
            stop_enabled,
        } = self.reference
        {
            request = request.with_external(khz, kind);
            request.high_gain = high_gain;
            request.stop_enabled = stop_enabled;
        }
        request.trim = self.trim;
        request
    }

    /// External reference in kHz, `0` if none is fitted.
    pub fn external_khz(&self) -> u32 {
        match self.reference {
            Reference::Internal => 0,
            Reference::External { khz, .. } => khz,
        }
    }
}

/// One requested transition. Immutable for the duration of that transition.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ClockRequest {
    /// Mode to end up in
    pub target: ClockMode,
    /// External reference in kHz, `0` for none
    pub external_khz: u32,
    /// Crystal or clock input on EXTAL
    pub external_kind: ExternalKind,
    /// Oscillator high gain
    pub high_gain: bool,
    /// Keep the oscillator running in stop mode
    pub stop_enabled: bool,
    /// IRC trim to apply before the transition
    pub trim: Option<u16>,
}

impl ClockRequest {
    /// A request with no external reference and no trim.
    pub const fn new(target: ClockMode) -> Self {
        Self {
            target,
            external_khz: 0,
            external_kind: ExternalKind::Crystal,
            high_gain: false,
            stop_enabled: false,
            trim: None,
        }
    }

    /// Attach an external reference.
    pub const fn with_external(mut self, khz: u32, kind: ExternalKind) -> Self {
        self.external_khz = khz;
        self.external_kind = kind;
        self
    }

    /// Oscillator settings for engaging the external reference of this request.
    ///
    /// A crystal needs a settle wait, a clock input does not. Range follows the
    /// frequency: 4 MHz and above is the high range.
    pub fn oscillator(&self) -> OscillatorConfig {
        let crystal = self.external_kind == ExternalKind::Crystal;
        OscillatorConfig {
            enabled: true,
            crystal,
            high_gain: self.high_gain,
            high_range: self.external_khz >= 4_000,
            stop_enabled: self.stop_enabled,
            wait_for_ready: crystal,
        }
    }
}

/// ETM (timer/PWM) counter clock select, `ETMx_SC[CLKS]`.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EtmSource {
    /// Counter stopped
    None,
    /// ICSOUT
    System,
    /// ICSFFCLK, the FLL reference after RDIV
    FixedFrequency,
    /// External reference
    External,
}

/// RTC clock select, `RTC_SC[RTCLKS]`.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RtcSource {
    /// OSCOUT
    External,
    /// 1 kHz low power oscillator
    Lpo,
    /// ICSIRCLK
    InternalReference,
    /// Bus clock
    Bus,
}

/// ADC input clock select, `ADC_SC3[ADICLK]`.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AdcSource {
    /// Bus clock
    Bus,
    /// Bus clock / 2
    BusDiv2,
    /// ALTCLK (OSCOUT)
    Alternate,
}

/// Clocks a peripheral driver can ask about.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ClockKind {
    /// Core and system clock, ICSOUT
    Core,
    /// Bus and flash clock, ICSOUT / `SIM_BUSDIV`
    Bus,
    /// Bus clock output pin, bus / 2^`SIM_SOPT[BUSREF]`
    Out,
    /// ETM counter clock
    Etm {
        /// `ETMx_SC[CLKS]`
        source: EtmSource,
        /// `ETMx_SC[PS]`, divide by 2^prescaler
        prescaler: u8,
    },
    /// RTC and watchdog clock
    Rtc(RtcSource),
    /// ADC conversion clock
    Adc {
        /// `ADC_SC3[ADICLK]`
        source: AdcSource,
        /// `ADC_SC3[ADIV]`, divide by 2^divider
        divider: u8,
    },
}
