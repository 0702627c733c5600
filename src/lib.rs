#![cfg_attr(not(test), no_std)]
#![doc = include_str!("../README.md")]
#![warn(missing_docs)]

//! ## Feature flags
#![doc = document_features::document_features!(feature_label = r#"<span class="stab portability"><code>{feature}</code></span>"#)]

// This mod MUST go first, so that the others see its macros.
pub(crate) mod fmt;

pub mod clocks;

pub use clocks::config::{
    AdcSource, ClockConfig, ClockKind, ClockMode, ClockRequest, DividerPolicy, EtmSource, ExternalKind, FllSetting,
    Reference, ReferenceSource, RtcSource, Silicon, Timeouts,
};
pub use clocks::{get_clock, init, with_clocks, ClockError, Clocks, IcsController};
