//! Firmware control core for 3D printers.
//!
//! Three subsystems around an externally supplied event loop and motion
//! planner:
//!
//! * [`aux_control`] — closed-loop heater control with ADC safety
//!   supervision, planner-synchronized target and fan duty changes, and the
//!   M109/M116 wait protocol.
//! * [`bed_probe`] — the multi-phase bed probing sequencer and the
//!   least-squares bed-shape correction applied to the kinematic transform.
//! * the SPI transaction engine, which lives in its own `spi_engine` crate.
//!
//! The hardware and harness seams are traits ([`hal`], [`planner`]): a
//! monotonic tick clock, PWM outputs, fixed-point ADC inputs, the probe
//! endstop pin, the motion planner's auxiliary channel, and the textual
//! console. The core owns no interrupt vectors and never blocks; deferred
//! work is expressed through [`time::TimedEvent`] deadlines serviced by
//! `poll` calls and through completion callbacks from the planner.

#![cfg_attr(not(test), no_std)]

pub mod aux_control;
pub mod bed_probe;
pub mod command;
mod error;
pub use error::*;
pub mod hal;
pub mod planner;
pub mod time;

/// Bitmask over physical/virtual kinematic axes, as used by the motion
/// layer's interlock checks.
pub type AxisMask = u32;

/// Upper bound on platform (non-probe) axes participating in correction.
pub const MAX_PLATFORM_AXES: usize = 3;

/// Upper bound on configured probe points.
pub const MAX_PROBE_POINTS: usize = 8;

/// Correction vector capacity: one linear term per platform axis, a
/// constant, and the pairwise quadratic products.
pub const MAX_CORRECTION_FACTORS: usize =
    MAX_PLATFORM_AXES + 1 + MAX_PLATFORM_AXES * (MAX_PLATFORM_AXES + 1) / 2;
