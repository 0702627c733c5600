//! External oscillator block (`OSC_CR`).
//!
//! ```text
//!                ┌────────────┐  OSCOS
//!  EXTAL ───────▶│ OSC        │───┐   ┌───┐ OSCOUT
//!  XTAL ────────▶│ (HGO,RANGE)│   └──▶│1  │───────▶ external reference
//!                └────────────┘ ┌───▶│0  │
//!  EXTAL (clock in) ────────────┘    └───┘
//! ```

use super::config::OscillatorConfig;
use super::poll::{wait_until, TimeSource};
use super::regs::{Fields, IcsRegisters, Reg, HGO_MASK, OSCEN_MASK, OSCOS_MASK, OSCSTEN_MASK, RANGE_MASK};
use super::ClockError;

impl OscillatorConfig {
    /// The `OSC_CR` word for this configuration.
    pub fn bits(&self) -> u8 {
        let mut cr = 0;
        if self.high_gain {
            cr |= HGO_MASK;
        }
        if self.high_range {
            cr |= RANGE_MASK;
        }
        if self.stop_enabled {
            cr |= OSCSTEN_MASK;
        }
        if self.crystal {
            cr |= OSCOS_MASK;
        }
        if self.enabled {
            cr |= OSCEN_MASK;
        }
        cr
    }
}

/// Program the oscillator and, if requested, wait for `OSCINIT`.
///
/// All fields land in a single write: a partially written `OSC_CR` can
/// briefly mis-configure the analog block. On timeout the oscillator is
/// left enabled, since powering it down mid-startup is not safe.
pub(crate) fn configure<R, T>(
    regs: &mut R,
    time: &mut T,
    config: &OscillatorConfig,
    timeout_us: u32,
) -> Result<(), ClockError>
where
    R: IcsRegisters + ?Sized,
    T: TimeSource + ?Sized,
{
    trace!("osc: cr <= {:#x}", config.bits());
    regs.write(Reg::OscCr, config.bits());

    if config.wait_for_ready && !wait_until(time, timeout_us, || regs.oscinit() != 0) {
        warn!("osc: OSCINIT not set after {} us", timeout_us);
        return Err(ClockError::OscillatorNotReady);
    }
    Ok(())
}

/// Return `OSC_CR` to its power-on-reset value.
pub(crate) fn disable<R: IcsRegisters + ?Sized>(regs: &mut R) {
    trace!("osc: disable");
    regs.write(Reg::OscCr, Reg::OscCr.reset_value());
}
