//! Reference divider (`C1[RDIV]`) selection.
//!
//! The FLL wants a 31.25-39.0625 kHz reference (hardware limit 26-46 kHz).
//! In the high oscillator range RDIV divides the external reference by
//! `32 << RDIV`, that is 32 up to 2048.

use super::config::DividerPolicy;
use super::ClockError;

/// Divided reference ceiling, in kHz.
const FLL_INPUT_MAX_KHZ: u32 = 40;
/// Base divide ratio of RDIV = 0 in the high range.
const RDIV_BASE: u32 = 32;
/// Lowest reference the oscillator's high range accepts, in kHz.
const HIGH_RANGE_MIN_KHZ: u32 = 4_000;
/// Largest RDIV exponent.
pub const RDIV_MAX: u8 = 6;

/// Smallest RDIV that brings `khz` to 40 kHz or below.
///
/// A 32 kHz reference sits in the low range and needs no division. Any other
/// part below 4 MHz is also in the low range, where RDIV divides by
/// `1 << RDIV`, and is rejected.
pub fn select_reference_divider(khz: u32) -> Result<u8, ClockError> {
    if khz == 32 {
        return Ok(0);
    }
    if khz < HIGH_RANGE_MIN_KHZ {
        return Err(ClockError::UnsupportedReferenceFrequency { khz });
    }

    let mut ceiling = FLL_INPUT_MAX_KHZ * RDIV_BASE;
    for rdiv in 0..=RDIV_MAX {
        if ceiling >= khz {
            return Ok(rdiv);
        }
        ceiling <<= 1;
    }
    Err(ClockError::UnsupportedReferenceFrequency { khz })
}

/// The table older firmware used.
///
/// Agrees with [`select_reference_divider`] wherever it has an entry, but
/// knows nothing about 6 MHz, 24 MHz or any other crystal.
pub fn select_reference_divider_legacy(khz: u32) -> Result<u8, ClockError> {
    match khz {
        32 => Ok(0),
        4_000 => Ok(2),
        8_000 | 10_000 => Ok(3),
        12_000 | 16_000 | 20_000 => Ok(4),
        _ => Err(ClockError::UnsupportedReferenceFrequency { khz }),
    }
}

impl DividerPolicy {
    /// RDIV for `khz` under this policy.
    pub fn select(&self, khz: u32) -> Result<u8, ClockError> {
        match self {
            DividerPolicy::Search => select_reference_divider(khz),
            DividerPolicy::LegacyTable => select_reference_divider_legacy(khz),
        }
    }
}

/// Frequency reaching the FLL, in Hz, for an external `khz` reference.
pub fn divided_reference_hz(khz: u32, rdiv: u8) -> u32 {
    if khz == 32 && rdiv == 0 {
        return 32 * 1000;
    }
    ((khz as u64 * 1000) / ((RDIV_BASE as u64) << rdiv)) as u32
}
