//! Frequency Oracle: clock frequencies recovered from register state.
//!
//! ```text
//!                   ┌──────┐ core  ┌───────────┐ bus  ┌─────────────┐
//!  ICSOUT ─────────▶│ core │──────▶│ SIM_BUSDIV│─────▶│ SIM BUSREF  │──▶ BUSOUT pin
//!                   └──────┘       └───────────┘      └─────────────┘
//! ```
//!
//! Everything here is a pure function. Register reads happen once, in
//! [`Snapshot::capture`](super::regs::Snapshot::capture).

use super::config::{AdcSource, ClockKind, ClockSource, EtmSource, ReferenceSource, RtcSource};
use super::divider::divided_reference_hz;
use super::regs::Snapshot;
use super::Clocks;

/// FLL multiplication factor.
pub const FLL_FACTOR: u32 = 1280;
/// Trimmed IRC frequency.
pub const INTERNAL_REFERENCE_HZ: u32 = 37_500;
/// FLL output on the trimmed internal reference.
pub const FLL_INTERNAL_HZ: u32 = INTERNAL_REFERENCE_HZ * FLL_FACTOR;
/// Reference assumed when no external part is configured.
pub const FALLBACK_HZ: u32 = 32_768;
/// Low power oscillator.
pub const LPO_HZ: u32 = 1_000;

/// ICSOUT in Hz for the given register state.
///
/// The external FLL path is computed as `khz * 10_000 / (32 << RDIV) * 128`
/// in that order. The truncation of the division is part of the result.
pub fn recompute_core_clock(snapshot: &Snapshot, external_khz: u32) -> u32 {
    let base = if external_khz != 0 {
        external_khz.saturating_mul(1000)
    } else {
        FALLBACK_HZ
    };

    let selected = if ClockSource::from_bits(snapshot.clks) == Some(ClockSource::Fll) {
        if snapshot.irefs {
            FLL_INTERNAL_HZ
        } else {
            let scaled = (external_khz as u64 * 1000 * 10) / (32u64 << snapshot.rdiv) * 128;
            u32::try_from(scaled).unwrap_or(u32::MAX)
        }
    } else {
        base
    };

    shr(selected, snapshot.bdiv)
}

/// Frequency of `kind` in Hz, `0` if the clock is gated.
pub fn derive_clock(clocks: &Clocks, kind: ClockKind) -> u32 {
    let bus = shr(clocks.core_clk, clocks.busdiv);
    match kind {
        ClockKind::Core => clocks.core_clk,
        ClockKind::Bus => bus,
        ClockKind::Out => shr(bus, clocks.busref),
        ClockKind::Etm { source, prescaler } => match source {
            EtmSource::None => 0,
            EtmSource::System => shr(clocks.core_clk, prescaler),
            EtmSource::FixedFrequency => shr(clocks.fll_reference_hz(), prescaler),
            EtmSource::External => shr(clocks.external_hz(), prescaler),
        },
        ClockKind::Rtc(source) => match source {
            RtcSource::External => clocks.external_hz(),
            RtcSource::Lpo => LPO_HZ,
            RtcSource::InternalReference => INTERNAL_REFERENCE_HZ,
            RtcSource::Bus => bus,
        },
        ClockKind::Adc { source, divider } => match source {
            AdcSource::Bus => shr(bus, divider),
            AdcSource::BusDiv2 => shr(bus >> 1, divider),
            AdcSource::Alternate => shr(clocks.external_hz(), divider),
        },
    }
}

impl Clocks {
    /// External reference in Hz, `0` if none is fitted.
    pub fn external_hz(&self) -> u32 {
        self.external_khz.saturating_mul(1000)
    }

    /// The reference entering the FLL (ICSFFCLK).
    pub fn fll_reference_hz(&self) -> u32 {
        match self.mode.reference() {
            ReferenceSource::Internal => INTERNAL_REFERENCE_HZ,
            ReferenceSource::External => divided_reference_hz(self.external_khz, self.rdiv),
        }
    }
}

fn shr(value: u32, exponent: u8) -> u32 {
    value.checked_shr(exponent as u32).unwrap_or(0)
}
