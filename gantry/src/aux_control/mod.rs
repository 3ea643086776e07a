//! Auxiliary device control: heaters and fans.
//!
//! Each heater runs a per-interval control event (safety supervision, PID
//! update, guarded duty apply) off the shared tick clock. Target and fan
//! duty changes either apply immediately (`F` force parameter) or travel
//! through the motion planner's auxiliary channel so they take effect at the
//! motion-correct time. The set-and-wait protocol (M109/M116) observes the
//! targeted heaters until all are in range, a safety trip surfaces, or the
//! configured timeout elapses.
//!
//! Heater enable/target state and the PWM duty apply are shared with
//! interrupt-context callers; every such access runs inside a
//! `critical_section`, and the duty apply re-checks the enable flag so a
//! racing safety unset is never overwritten.

use core::fmt;

use control::Formula;
use serde::{Deserialize, Serialize};

mod fan;
mod heater;
pub use fan::*;
pub use heater::*;

use crate::command::{CmdStatus, CommandParams};
use crate::error::{report_error, AuxError};
use crate::hal::{AnalogInput, Clock, Console, OutputStream, PwmChannel};
use crate::planner::{AuxPlanner, ChannelPayload};
use crate::time::{Instant, PollTimer, TimeConversion};
use crate::AxisMask;

/// A heater or fan name as it appears in commands and replies: a letter plus
/// an optional number (`T`, `T1`, `B`, …). `F` and `S` are reserved for the
/// force and value parameters.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuxName {
    pub letter: char,
    pub number: u32,
}

impl AuxName {
    pub const fn new(letter: char, number: u32) -> Self {
        Self { letter, number }
    }
}

impl fmt::Display for AuxName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_fmt(format_args!("{}", self.letter))?;
        if self.number != 0 {
            f.write_fmt(format_args!("{}", self.number))?;
        }
        Ok(())
    }
}

/// Module-wide settings.
#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AuxConfig {
    pub time: TimeConversion,
    /// Ceiling on a set-and-wait, seconds.
    pub wait_timeout: f32,
    /// Period of `//HeatProgress` reports during a wait, seconds.
    pub wait_report_period: f32,
}

/// The auxiliary control module: `NH` heaters and `NF` fans.
pub struct AuxControl<HP, HA, HF, FP, const NH: usize, const NF: usize>
where
    HP: PwmChannel,
    HA: AnalogInput,
    HF: Formula,
    FP: PwmChannel,
{
    heaters: [Heater<HP, HA, HF>; NH],
    fans: [Fan<FP>; NF],
    wait_timeout_ticks: u32,
    wait_report_ticks: u32,
    waiting_heaters: u8,
    inrange_heaters: u8,
    wait_started: Instant,
    report_timer: PollTimer,
}

impl<HP, HA, HF, FP, const NH: usize, const NF: usize>
    AuxControl<HP, HA, HF, FP, NH, NF>
where
    HP: PwmChannel,
    HA: AnalogInput,
    HF: Formula,
    FP: PwmChannel,
{
    const MASKS_FIT: () = assert!(NH <= 8);
    const ALL_HEATERS: u8 = ((1u16 << NH) - 1) as u8;

    pub fn new(
        heaters: [Heater<HP, HA, HF>; NH],
        fans: [Fan<FP>; NF],
        cfg: AuxConfig,
    ) -> Self {
        #[allow(clippy::let_unit_value)]
        let () = Self::MASKS_FIT;
        debug_assert!(heaters
            .iter()
            .map(|h| h.cfg().name.letter)
            .chain(fans.iter().map(|f| f.cfg().name.letter))
            .all(|letter| letter != 'F' && letter != 'S'));
        Self {
            heaters,
            fans,
            wait_timeout_ticks: cfg.time.ticks(cfg.wait_timeout),
            wait_report_ticks: cfg.time.ticks(cfg.wait_report_period),
            waiting_heaters: 0,
            inrange_heaters: 0,
            wait_started: Instant::from_ticks(0),
            report_timer: PollTimer::default(),
        }
    }

    pub fn heater(&mut self, index: usize) -> &mut Heater<HP, HA, HF> {
        &mut self.heaters[index]
    }

    /// Whether a set-and-wait is currently holding a command.
    pub fn waiting(&self) -> bool {
        self.waiting_heaters != 0
    }

    /// Service due control events. Call from the event loop whenever a
    /// heater's control deadline may have passed.
    pub fn poll(&mut self, clock: &impl Clock, console: &mut impl Console) {
        let now = clock.now();
        for index in 0..NH {
            if self.heaters[index].control_due(now) {
                self.heater_interval(index, now, console);
            }
        }
    }

    fn heater_interval(
        &mut self,
        index: usize,
        now: Instant,
        console: &mut impl Console,
    ) {
        let status = self.heaters[index].control_interval(console.msg());
        let bit = 1u8 << index;
        if self.waiting_heaters & bit != 0 {
            if status.runaway_while_observing {
                self.heaters[index]
                    .append_error(console.locked(), AuxError::HeaterThermalRunaway);
                self.complete_wait(false, console);
            } else if let Some(inrange) = status.inrange {
                if inrange {
                    self.inrange_heaters |= bit;
                } else {
                    self.inrange_heaters &= !bit;
                }
                self.check_wait_completion(now, console);
            }
        }
        self.maybe_report(now, console);
    }

    /// Low-rate safety sweep, independent of the control intervals.
    pub fn check_safety(&mut self) {
        for heater in &mut self.heaters {
            heater.check_safety();
        }
    }

    /// Force every output to its safe off state. Callable from any context.
    pub fn emergency(&mut self) {
        for heater in &mut self.heaters {
            heater.emergency();
        }
        for fan in &mut self.fans {
            fan.emergency();
        }
    }

    /// Consult every cold-extrusion interlock before a move over
    /// `move_axes`; false blocks the move (diagnostic already written).
    pub fn check_move_interlocks(
        &mut self,
        err_output: &mut (impl OutputStream + ?Sized),
        move_axes: AxisMask,
    ) -> bool {
        self.heaters
            .iter_mut()
            .all(|h| h.check_move_interlock(err_output, move_axes))
    }

    /// Motion-time delivery of a planner channel payload.
    pub fn channel_callback(&mut self, payload: ChannelPayload) {
        match payload {
            ChannelPayload::Heater { index, target } => {
                debug_assert!(index < NH);
                if let Some(heater) = self.heaters.get_mut(index) {
                    heater.set_or_unset(target);
                }
            }
            ChannelPayload::Fan { index, duty } => {
                debug_assert!(index < NF);
                if let Some(fan) = self.fans.get_mut(index) {
                    fan.set_duty(duty);
                }
            }
        }
    }

    /// Handle a command owned by this module; `None` for foreign numbers.
    pub fn dispatch(
        &mut self,
        cmd: &CommandParams,
        clock: &impl Clock,
        console: &mut impl Console,
        planner: &mut impl AuxPlanner,
    ) -> Option<CmdStatus> {
        if cmd.letter != 'M' {
            return None;
        }
        let now = clock.now();
        match cmd.number {
            104 => Some(self.handle_set_heater(cmd, false, now, console, planner)),
            109 => Some(self.handle_set_heater(cmd, true, now, console, planner)),
            105 => {
                let out = console.locked();
                out.append("ok");
                for heater in &mut self.heaters {
                    heater.append_value(out);
                }
                out.append("\n");
                Some(CmdStatus::Done)
            }
            106 => Some(self.handle_set_fan(cmd, false, console, planner)),
            107 => Some(self.handle_set_fan(cmd, true, console, planner)),
            116 => {
                let mask = self.name_mask(cmd);
                Some(self.do_wait_heaters(mask, now, console))
            }
            302 => Some(self.handle_cold_extrude(cmd, console)),
            921 => {
                let out = console.locked();
                out.append("ok");
                for heater in &mut self.heaters {
                    heater.append_adc_value(out);
                }
                out.append("\n");
                Some(CmdStatus::Done)
            }
            922 => {
                for heater in &mut self.heaters {
                    heater.clear_error();
                }
                Some(CmdStatus::Done)
            }
            number => self.dispatch_custom(number, cmd, now, console, planner),
        }
    }

    /// Per-device command numbers (a bed heater answering its own M number,
    /// a chamber fan with dedicated on/off codes).
    fn dispatch_custom(
        &mut self,
        number: u16,
        cmd: &CommandParams,
        now: Instant,
        console: &mut impl Console,
        planner: &mut impl AuxPlanner,
    ) -> Option<CmdStatus> {
        if number == 0 {
            return None;
        }
        for index in 0..NH {
            let cfg = *self.heaters[index].cfg();
            if cfg.set_m_command == number && number != 104 {
                let force = cmd.has('F');
                return Some(
                    self.handle_set_command(index, cmd, false, force, now, console, planner),
                );
            }
            if cfg.set_wait_m_command == number && number != 109 {
                return Some(
                    self.handle_set_command(index, cmd, true, false, now, console, planner),
                );
            }
        }
        for index in 0..NF {
            let cfg = *self.fans[index].cfg();
            if cfg.set_m_command == number && number != 106 {
                return Some(self.fan_set(index, cmd, cmd.has('F'), false, planner));
            }
            if cfg.off_m_command == number && number != 107 {
                return Some(self.fan_set(index, cmd, cmd.has('F'), true, planner));
            }
        }
        None
    }

    fn handle_set_heater(
        &mut self,
        cmd: &CommandParams,
        wait: bool,
        now: Instant,
        console: &mut impl Console,
        planner: &mut impl AuxPlanner,
    ) -> CmdStatus {
        let force = !wait && cmd.has('F');
        for index in 0..NH {
            if Self::matches_name(cmd, self.heaters[index].cfg().name) {
                return self
                    .handle_set_command(index, cmd, wait, force, now, console, planner);
            }
        }
        for index in 0..NH {
            let cfg = self.heaters[index].cfg();
            let own = if wait {
                cfg.set_wait_m_command == 109
            } else {
                cfg.set_m_command == 104
            };
            if own {
                return self
                    .handle_set_command(index, cmd, wait, force, now, console, planner);
            }
        }
        if NH > 0 {
            report_error(console.locked(), AuxError::UnknownHeater);
            return CmdStatus::Error;
        }
        CmdStatus::Done
    }

    #[allow(clippy::too_many_arguments)]
    fn handle_set_command(
        &mut self,
        index: usize,
        cmd: &CommandParams,
        wait: bool,
        force: bool,
        now: Instant,
        console: &mut impl Console,
        planner: &mut impl AuxPlanner,
    ) -> CmdStatus {
        let mut target = cmd.get_f32('S').unwrap_or(0.0);
        let limits = *self.heaters[index].limits();
        // Out-of-range requests turn the heater off rather than clamping.
        if !(target >= limits.min_safe_temp && target <= limits.max_safe_temp) {
            target = f32::NAN;
        }

        if force || wait {
            self.heaters[index].set_or_unset(target);
        } else {
            planner.submit(ChannelPayload::Heater { index, target });
        }

        if wait {
            self.do_wait_heaters(1u8 << index, now, console)
        } else {
            CmdStatus::Done
        }
    }

    fn handle_set_fan(
        &mut self,
        cmd: &CommandParams,
        is_off: bool,
        console: &mut impl Console,
        planner: &mut impl AuxPlanner,
    ) -> CmdStatus {
        let force = cmd.has('F');
        for index in 0..NF {
            if Self::matches_name(cmd, self.fans[index].cfg().name) {
                return self.fan_set(index, cmd, force, is_off, planner);
            }
        }
        for index in 0..NF {
            let cfg = self.fans[index].cfg();
            let own = if is_off {
                cfg.off_m_command == 107
            } else {
                cfg.set_m_command == 106
            };
            if own {
                return self.fan_set(index, cmd, force, is_off, planner);
            }
        }
        if NF > 0 {
            report_error(console.locked(), AuxError::UnknownFan);
            return CmdStatus::Error;
        }
        CmdStatus::Done
    }

    fn fan_set(
        &mut self,
        index: usize,
        cmd: &CommandParams,
        force: bool,
        is_off: bool,
        planner: &mut impl AuxPlanner,
    ) -> CmdStatus {
        let mut target = 0.0;
        if !is_off {
            target = 1.0;
            if let Some(s) = cmd.get_f32('S') {
                target = s * self.fans[index].cfg().speed_multiply;
            }
        }
        let duty = self.fans[index].compute_duty(target);
        if force {
            self.fans[index].set_duty(duty);
        } else {
            planner.submit(ChannelPayload::Fan { index, duty });
        }
        CmdStatus::Done
    }

    fn handle_cold_extrude(
        &mut self,
        cmd: &CommandParams,
        console: &mut impl Console,
    ) -> CmdStatus {
        if !cmd.has('P') {
            let out = console.locked();
            out.append("ColdExtrude:");
            for heater in &self.heaters {
                heater.append_cold_extrude(out);
            }
            out.append("\n");
        } else {
            let allow = cmd.get_u32('P').unwrap_or(0) > 0;
            let mut mask = self.name_mask(cmd);
            if mask == 0 {
                mask = Self::ALL_HEATERS;
            }
            for index in 0..NH {
                if mask & (1u8 << index) != 0 {
                    self.heaters[index].set_cold_extrude(allow);
                }
            }
        }
        CmdStatus::Done
    }

    /// Begin observing the heaters in `mask` (all heaters with live targets
    /// when `mask` is empty). `Pending` parks the locked command until the
    /// wait resolves.
    pub fn do_wait_heaters(
        &mut self,
        mask: u8,
        now: Instant,
        console: &mut impl Console,
    ) -> CmdStatus {
        debug_assert!(self.waiting_heaters == 0);
        self.waiting_heaters = 0;
        self.inrange_heaters = 0;
        self.wait_started = now;

        for index in 0..NH {
            let bit = 1u8 << index;
            if mask & bit == 0 && mask != 0 {
                continue;
            }
            let (target, enabled) = self.heaters[index].target_enabled();
            if !target.is_nan() {
                if !enabled {
                    self.heaters[index]
                        .append_error(console.locked(), AuxError::HeaterThermalRunaway);
                    self.abort_wait_setup();
                    return CmdStatus::Error;
                }
                self.waiting_heaters |= bit;
                self.heaters[index].observer_start(target);
            } else if mask & bit != 0 {
                self.heaters[index]
                    .append_error(console.locked(), AuxError::HeaterNotEnabled);
                self.abort_wait_setup();
                return CmdStatus::Error;
            }
        }

        if self.waiting_heaters != 0 {
            self.report_timer.set_to(self.wait_started);
            CmdStatus::Pending
        } else {
            CmdStatus::Done
        }
    }

    fn abort_wait_setup(&mut self) {
        for index in 0..NH {
            if self.waiting_heaters & (1u8 << index) != 0 {
                self.heaters[index].observer_stop();
            }
        }
        self.waiting_heaters = 0;
    }

    fn complete_wait(&mut self, ok: bool, console: &mut impl Console) {
        debug_assert!(self.waiting_heaters != 0);
        console.finish_locked(ok);
        self.abort_wait_setup();
    }

    fn check_wait_completion(&mut self, now: Instant, console: &mut impl Console) {
        debug_assert!(self.waiting_heaters != 0);
        let reached = self.inrange_heaters == self.waiting_heaters;
        let timed_out =
            now.ticks_since(self.wait_started) >= self.wait_timeout_ticks;
        if reached || timed_out {
            if timed_out {
                report_error(console.locked(), AuxError::WaitTimedOut);
            }
            self.complete_wait(!timed_out, console);
        }
    }

    fn maybe_report(&mut self, now: Instant, console: &mut impl Console) {
        if self.waiting_heaters != 0 && self.report_timer.is_expired(now) {
            self.report_timer.add_time(self.wait_report_ticks);
            let msg = console.msg();
            msg.append("//HeatProgress");
            for heater in &mut self.heaters {
                heater.append_value(msg);
            }
            msg.append("\n");
            msg.poke();
        }
    }

    fn matches_name(cmd: &CommandParams, name: AuxName) -> bool {
        cmd.name_value(name.letter) == Some(name.number)
    }

    fn name_mask(&self, cmd: &CommandParams) -> u8 {
        let mut mask = 0u8;
        for index in 0..NH {
            if Self::matches_name(cmd, self.heaters[index].cfg().name) {
                mask |= 1u8 << index;
            }
        }
        mask
    }
}
