use control::{Formula, Observer, ObserverConfig, Pid, PidConfig};
use serde::{Deserialize, Serialize};

use super::AuxName;
use crate::error::AuxError;
use crate::hal::{append_display, append_f32, AnalogInput, OutputStream, PwmChannel};
use crate::time::{Instant, TimeConversion, TimedEvent};
use crate::AxisMask;

/// Delay before the first control interval after init, seconds.
const STARTUP_DELAY: f32 = 0.05;

/// Cold-extrusion interlock settings for heaters guarding extruder axes.
#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ColdExtrusionConfig {
    /// Minimum temperature at which extruder-axis moves are allowed.
    pub min_extrusion_temp: f32,
    /// The axes this interlock gates.
    pub extruder_axes: AxisMask,
}

/// Static configuration of one heater.
#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HeaterConfig {
    pub name: AuxName,
    /// Command number this heater also answers for a plain set (0 = none).
    /// The shared set command (104) reaches it through name matching or the
    /// default pass.
    pub set_m_command: u16,
    /// Command number for set-and-wait (0 = none).
    pub set_wait_m_command: u16,
    pub min_safe_temp: f32,
    pub max_safe_temp: f32,
    /// Seconds between control updates.
    pub control_interval: f32,
    pub pid: PidConfig,
    pub observer: ObserverConfig,
    pub cold_extrusion: Option<ColdExtrusionConfig>,
}

/// Limits derived from [`HeaterConfig`] + formula + tick rate. Must be
/// re-derived whenever any of those change.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct HeaterLimits {
    pub min_safe_temp: f32,
    pub max_safe_temp: f32,
    /// ADC readings at or below this are unsafe.
    pub inf_adc: u16,
    /// ADC readings at or above this are unsafe.
    pub sup_adc: u16,
    pub control_interval_ticks: u32,
}

impl HeaterLimits {
    pub fn derive<A: AnalogInput, F: Formula>(
        cfg: &HeaterConfig,
        formula: &F,
        time: TimeConversion,
    ) -> Self {
        let range = (1u64 << A::BITS) as f32;
        // Keep a margin inside the rails so a shorted or open sensor always
        // reads as unsafe.
        let low_limit = 1.0 + 0.1;
        let high_limit = range - 1.0 - 0.1;
        let (inf_temp, sup_temp) = if formula.negative_slope() {
            (cfg.max_safe_temp, cfg.min_safe_temp)
        } else {
            (cfg.min_safe_temp, cfg.max_safe_temp)
        };
        Self {
            min_safe_temp: cfg.min_safe_temp,
            max_safe_temp: cfg.max_safe_temp,
            inf_adc: (formula.temp_to_adc(inf_temp) * range).max(low_limit) as u16,
            sup_adc: (formula.temp_to_adc(sup_temp) * range).min(high_limit) as u16,
            control_interval_ticks: time.ticks(cfg.control_interval),
        }
    }
}

/// Snapshot of a heater for status reporting.
#[derive(Copy, Clone, Debug)]
pub struct HeaterState {
    pub current: f32,
    pub target: f32,
    /// Target present but the loop tripped out.
    pub error: bool,
}

/// What one control interval means for the module-level wait protocol.
#[derive(Copy, Clone, Debug, Default)]
pub(crate) struct IntervalStatus {
    /// The observer is active but the heater is no longer enabled: a safety
    /// trip happened while a wait was in progress.
    pub runaway_while_observing: bool,
    /// In-range verdict for this interval, when observing and healthy.
    pub inrange: Option<bool>,
}

/// Fields shared with interrupt-context callers (safety path, planner
/// channel callback). Only ever touched inside critical sections.
#[derive(Copy, Clone, Debug)]
struct Shared {
    enabled: bool,
    target: f32,
    was_not_unset: bool,
    report_thermal_runaway: bool,
}

/// One closed-loop heater: PID control with ADC safety supervision.
pub struct Heater<P: PwmChannel, A: AnalogInput, F: Formula> {
    cfg: HeaterConfig,
    limits: HeaterLimits,
    pwm: P,
    adc: A,
    formula: F,
    pid: Pid,
    observer: Observer,
    control_event: TimedEvent,
    shared: Shared,
    cold_extrusion_allowed: bool,
}

impl<P: PwmChannel, A: AnalogInput, F: Formula> Heater<P, A, F> {
    pub fn new(
        cfg: HeaterConfig,
        pwm: P,
        adc: A,
        formula: F,
        time: TimeConversion,
        now: Instant,
    ) -> Self {
        let limits = HeaterLimits::derive::<A, F>(&cfg, &formula, time);
        let mut control_event = TimedEvent::new();
        // Stagger the first interval so PWM setup settles first.
        let start = now.wrapping_add(time.ticks(STARTUP_DELAY));
        control_event.append_at(start.wrapping_add(limits.control_interval_ticks / 2));
        let pid = Pid::new(cfg.pid, cfg.control_interval);
        let observer = Observer::new(ObserverConfig {
            sample_interval: cfg.control_interval,
            ..cfg.observer
        });
        Self {
            cfg,
            limits,
            pwm,
            adc,
            formula,
            pid,
            observer,
            control_event,
            shared: Shared {
                enabled: false,
                target: f32::NAN,
                was_not_unset: false,
                report_thermal_runaway: false,
            },
            cold_extrusion_allowed: false,
        }
    }

    /// Re-derive everything that depends on the configuration. The heater
    /// comes back disabled.
    pub fn reconfigure(&mut self, cfg: HeaterConfig, time: TimeConversion) {
        self.unset(true);
        self.limits = HeaterLimits::derive::<A, F>(&cfg, &self.formula, time);
        self.pid = Pid::new(cfg.pid, cfg.control_interval);
        self.observer = Observer::new(ObserverConfig {
            sample_interval: cfg.control_interval,
            ..cfg.observer
        });
        self.cfg = cfg;
    }

    pub fn cfg(&self) -> &HeaterConfig {
        &self.cfg
    }

    pub fn limits(&self) -> &HeaterLimits {
        &self.limits
    }

    fn raw_to_temp(&self, raw: u16) -> f32 {
        if A::is_invalid(raw) {
            return f32::NAN;
        }
        let range = (1u64 << A::BITS) as f32;
        let mut frac = raw as f32 / range;
        if !A::IS_ROUNDED {
            frac += 0.5 / range;
        }
        self.formula.adc_to_temp(frac)
    }

    fn adc_is_unsafe(&self, raw: u16) -> bool {
        A::is_invalid(raw) || raw <= self.limits.inf_adc || raw >= self.limits.sup_adc
    }

    pub fn get_temp(&mut self) -> f32 {
        let raw = self.adc.read();
        self.raw_to_temp(raw)
    }

    pub fn state(&mut self) -> HeaterState {
        let current = self.get_temp();
        let (target, enabled) =
            critical_section::with(|_| (self.shared.target, self.shared.enabled));
        HeaterState {
            current,
            target,
            error: !target.is_nan() && !enabled,
        }
    }

    /// Set a (finite) target and enable the loop.
    pub fn set(&mut self, target: f32) {
        debug_assert!(!target.is_nan());
        critical_section::with(|_| {
            self.shared.target = target;
            self.shared.enabled = true;
        });
    }

    /// Disable the loop and force the output off. `orderly` clears the
    /// target (operator request); a non-orderly unset keeps it and flags a
    /// thermal-runaway report instead.
    pub fn unset(&mut self, orderly: bool) {
        critical_section::with(|_| {
            if orderly {
                self.shared.target = f32::NAN;
            } else if self.shared.enabled {
                self.shared.report_thermal_runaway = true;
            }
            self.shared.enabled = false;
            self.shared.was_not_unset = false;
            let duty = self.pwm.zero_duty();
            self.pwm.set_duty(duty);
        });
    }

    pub fn set_or_unset(&mut self, target: f32) {
        if !target.is_nan() {
            self.set(target);
        } else {
            self.unset(true);
        }
    }

    /// Re-enable after a safety trip, using the target still on record.
    pub fn clear_error(&mut self) {
        let (target, enabled) =
            critical_section::with(|_| (self.shared.target, self.shared.enabled));
        if !target.is_nan() && !enabled {
            self.set(target);
        }
    }

    /// Low-rate safety check, independent of the control interval. May run
    /// from interrupt context.
    pub fn check_safety(&mut self) {
        self.adc.check_safety();
        let raw = self.adc.read();
        if self.adc_is_unsafe(raw) {
            self.unset(false);
        }
    }

    pub fn emergency(&mut self) {
        self.pwm.emergency_off();
    }

    pub(crate) fn control_due(&mut self, now: Instant) -> bool {
        self.control_event.poll(now)
    }

    /// One control interval: safety check, state snapshot, PID update with
    /// the duty apply guarded against a racing unset, runaway reporting, and
    /// the observer verdict for the wait protocol.
    pub(crate) fn control_interval(
        &mut self,
        msg: &mut impl OutputStream,
    ) -> IntervalStatus {
        self.control_event
            .append_after_previous(self.limits.control_interval_ticks);

        let raw = self.adc.read();
        if self.adc_is_unsafe(raw) {
            self.unset(false);
        }

        let snapshot = critical_section::with(|_| {
            let snapshot = self.shared;
            self.shared.was_not_unset = self.shared.enabled;
            self.shared.report_thermal_runaway = false;
            snapshot
        });

        let sensor = self.raw_to_temp(raw);

        if snapshot.enabled {
            if !snapshot.was_not_unset {
                // First interval after enabling.
                self.pid.reset();
            }
            if sensor.is_finite() {
                let output = self.pid.update(sensor, snapshot.target);
                let duty = self.pwm.compute_duty(output);
                critical_section::with(|_| {
                    // A safety unset may have raced the computation above;
                    // never overwrite its zero duty.
                    if self.shared.was_not_unset {
                        self.pwm.set_duty(duty);
                    }
                });
            }
        }

        if snapshot.report_thermal_runaway {
            msg.append("//");
            self.append_error(msg, AuxError::HeaterThermalRunaway);
            msg.poke();
            log::error!("heater {} thermal runaway, output disabled", self.cfg.name);
        }

        let mut status = IntervalStatus::default();
        if self.observer.observing() {
            if !snapshot.enabled {
                status.runaway_while_observing = true;
            } else {
                status.inrange = Some(self.observer.sample(sensor));
            }
        }
        status
    }

    pub(crate) fn target_enabled(&mut self) -> (f32, bool) {
        critical_section::with(|_| (self.shared.target, self.shared.enabled))
    }

    pub(crate) fn observer_start(&mut self, target: f32) {
        self.observer.start(target);
    }

    pub(crate) fn observer_stop(&mut self) {
        self.observer.stop();
    }

    /// ` <name>:<current> /<target>[,err]`
    pub(crate) fn append_value(&mut self, out: &mut (impl OutputStream + ?Sized)) {
        let st = self.state();
        out.append(" ");
        append_display(out, self.cfg.name);
        out.append(":");
        append_f32(out, st.current);
        out.append(" /");
        append_f32(out, st.target);
        if st.error {
            out.append(",err");
        }
    }

    /// ` <name>A:<fraction>`
    pub(crate) fn append_adc_value(&mut self, out: &mut (impl OutputStream + ?Sized)) {
        let raw = self.adc.read();
        let range = (1u64 << A::BITS) as f32;
        out.append(" ");
        append_display(out, self.cfg.name);
        out.append("A:");
        append_f32(out, raw as f32 / range);
    }

    /// `Error:<token>:<name>\n`
    pub(crate) fn append_error(
        &self,
        out: &mut (impl OutputStream + ?Sized),
        error: AuxError,
    ) {
        out.append("Error:");
        append_display(out, error);
        out.append(":");
        append_display(out, self.cfg.name);
        out.append("\n");
    }

    /// Gate a move touching extruder axes on the interlock. Writes the
    /// diagnostic and returns false when the move must be blocked.
    pub fn check_move_interlock(
        &mut self,
        err_output: &mut (impl OutputStream + ?Sized),
        move_axes: AxisMask,
    ) -> bool {
        let Some(interlock) = self.cfg.cold_extrusion else {
            return true;
        };
        if self.cold_extrusion_allowed || (move_axes & interlock.extruder_axes) == 0 {
            return true;
        }
        let temp = self.get_temp();
        if temp >= interlock.min_extrusion_temp && !temp.is_infinite() {
            return true;
        }
        self.append_error(err_output, AuxError::ColdExtrusionPrevented);
        false
    }

    pub(crate) fn set_cold_extrude(&mut self, allow: bool) {
        if self.cfg.cold_extrusion.is_some() {
            self.cold_extrusion_allowed = allow;
        }
    }

    /// ` <name>=<0|1>`, only for heaters carrying the interlock.
    pub(crate) fn append_cold_extrude(&self, out: &mut (impl OutputStream + ?Sized)) {
        if self.cfg.cold_extrusion.is_none() {
            return;
        }
        out.append(" ");
        append_display(out, self.cfg.name);
        out.append(if self.cold_extrusion_allowed { "=1" } else { "=0" });
    }
}
