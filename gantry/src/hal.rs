//! Hardware and harness seams consumed by the control core.

use core::fmt::{Display, Write};

use crate::time::Instant;

/// Monotonic tick source.
pub trait Clock {
    fn now(&self) -> Instant;
}

/// Hardware-ready duty value for one PWM output, computed once at task level
/// and applied atomically.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct DutyCycle(pub u16);

/// One PWM output.
pub trait PwmChannel {
    /// Map a duty fraction in `[0, 1]` into hardware duty data. Task-level
    /// only; may involve float math.
    fn compute_duty(&self, frac: f32) -> DutyCycle;

    /// The duty data meaning "output off".
    fn zero_duty(&self) -> DutyCycle;

    /// Apply precomputed duty data. Must be safe to call inside a critical
    /// section and from the planner's channel callback.
    fn set_duty(&mut self, duty: DutyCycle);

    /// Force the output to its safe off state. Callable from any context,
    /// including fault paths.
    fn emergency_off(&mut self);
}

/// Fixed-point ADC source for one temperature channel.
pub trait AnalogInput {
    /// Significant bits per sample; raw samples span `0..2^BITS`.
    const BITS: u32;

    /// Whether samples are rounded to the nearest code. When false, a
    /// half-LSB bias is added before formula evaluation to center the
    /// truncation.
    const IS_ROUNDED: bool;

    fn read(&mut self) -> u16;

    /// Sentinel/out-of-band sample detection (e.g. conversion not ready).
    fn is_invalid(sample: u16) -> bool;

    /// Hook for input self-checks on the low-rate safety path.
    fn check_safety(&mut self) {}
}

/// ASCII reply sink. Replies are newline-terminated; asynchronous lines are
/// prefixed `//` and followed by a [`OutputStream::poke`].
pub trait OutputStream {
    fn append(&mut self, s: &str);

    /// Hint that buffered output should be pushed out now.
    fn poke(&mut self) {}
}

/// Command-side view of the reply plumbing: the reply stream of the command
/// currently holding the machine (the "locked" command), the asynchronous
/// message stream, and deferred completion for commands that outlive their
/// dispatch (heater waits, probing).
pub trait Console {
    type Stream: OutputStream;

    fn locked(&mut self) -> &mut Self::Stream;

    fn msg(&mut self) -> &mut Self::Stream;

    /// Complete the locked command; `ok = false` finishes it in error.
    fn finish_locked(&mut self, ok: bool);
}

/// Append a `Display` value through a small stack buffer.
pub fn append_display(out: &mut (impl OutputStream + ?Sized), value: impl Display) {
    let mut buf: heapless::String<24> = heapless::String::new();
    if write!(buf, "{}", value).is_ok() {
        out.append(&buf);
    }
}

pub fn append_f32(out: &mut (impl OutputStream + ?Sized), value: f32) {
    append_display(out, value);
}

pub fn append_u32(out: &mut (impl OutputStream + ?Sized), value: u32) {
    append_display(out, value);
}
