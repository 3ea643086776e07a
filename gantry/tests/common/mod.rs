//! Mock collaborators shared by the integration suites.
#![allow(dead_code)]

use std::cell::Cell;
use std::convert::Infallible;
use std::rc::Rc;

use gantry::hal::{AnalogInput, Clock, Console, DutyCycle, OutputStream, PwmChannel};
use gantry::planner::{AuxPlanner, ChannelPayload, ProbeHost, ProbeMove, ProbePlanner};
use gantry::time::Instant;

/// Settable tick source.
#[derive(Default)]
pub struct FakeClock {
    ticks: Cell<u32>,
}

impl FakeClock {
    pub fn set(&self, ticks: u32) {
        self.ticks.set(ticks);
    }
}

impl Clock for FakeClock {
    fn now(&self) -> Instant {
        Instant::from_ticks(self.ticks.get())
    }
}

/// Reply sink capturing everything appended.
#[derive(Default)]
pub struct StringStream {
    pub content: String,
}

impl OutputStream for StringStream {
    fn append(&mut self, s: &str) {
        self.content.push_str(s);
    }
}

/// Console with a captured locked-command stream, a captured message
/// stream, and a record of deferred completions.
#[derive(Default)]
pub struct MockConsole {
    pub locked: StringStream,
    pub msg: StringStream,
    pub finished: Vec<bool>,
}

impl Console for MockConsole {
    type Stream = StringStream;

    fn locked(&mut self) -> &mut StringStream {
        &mut self.locked
    }

    fn msg(&mut self) -> &mut StringStream {
        &mut self.msg
    }

    fn finish_locked(&mut self, ok: bool) {
        self.finished.push(ok);
    }
}

/// PWM whose applied duty is observable from outside the owning module.
/// `compute_duty` maps the full scale onto 0..=1000.
#[derive(Clone, Default)]
pub struct SharedPwm {
    pub duty: Rc<Cell<u16>>,
    pub emergency: Rc<Cell<bool>>,
}

impl PwmChannel for SharedPwm {
    fn compute_duty(&self, frac: f32) -> DutyCycle {
        DutyCycle((frac.clamp(0.0, 1.0) * 1000.0) as u16)
    }

    fn zero_duty(&self) -> DutyCycle {
        DutyCycle(0)
    }

    fn set_duty(&mut self, duty: DutyCycle) {
        self.duty.set(duty.0);
    }

    fn emergency_off(&mut self) {
        self.duty.set(0);
        self.emergency.set(true);
    }
}

/// 12-bit ADC fed from a shared cell; `0xffff` is the invalid sentinel.
#[derive(Clone, Default)]
pub struct SharedAdc {
    pub raw: Rc<Cell<u16>>,
}

pub const ADC_INVALID: u16 = 0xffff;

impl AnalogInput for SharedAdc {
    const BITS: u32 = 12;
    const IS_ROUNDED: bool = false;

    fn read(&mut self) -> u16 {
        self.raw.get()
    }

    fn is_invalid(sample: u16) -> bool {
        sample == ADC_INVALID
    }
}

/// Records auxiliary channel payloads for later motion-time delivery.
#[derive(Default)]
pub struct RecordingAuxPlanner {
    pub payloads: Vec<ChannelPayload>,
}

impl AuxPlanner for RecordingAuxPlanner {
    fn submit(&mut self, payload: ChannelPayload) {
        self.payloads.push(payload);
    }
}

/// Records probe moves and tracks the probe-axis position the sequencer
/// reads back between phases.
#[derive(Default)]
pub struct MockProbePlanner {
    pub moves: Vec<ProbeMove>,
    pub position: f32,
}

impl ProbePlanner for MockProbePlanner {
    fn probe_axis_position(&self) -> f32 {
        self.position
    }

    fn submit(&mut self, mv: ProbeMove) {
        self.moves.push(mv);
    }
}

#[derive(Default)]
pub struct MockHost {
    pub corrections_changed: usize,
    pub hooks_started: usize,
}

impl ProbeHost for MockHost {
    fn corrections_changed(&mut self) {
        self.corrections_changed += 1;
    }

    fn start_after_probing_hook(&mut self) {
        self.hooks_started += 1;
    }
}

/// Probe endstop input backed by a shared cell.
#[derive(Clone, Default)]
pub struct SharedPin {
    pub high: Rc<Cell<bool>>,
}

impl embedded_hal::digital::ErrorType for SharedPin {
    type Error = Infallible;
}

impl embedded_hal::digital::InputPin for SharedPin {
    fn is_high(&mut self) -> Result<bool, Infallible> {
        Ok(self.high.get())
    }

    fn is_low(&mut self) -> Result<bool, Infallible> {
        Ok(!self.high.get())
    }
}
