//! Bed probing and bed-shape correction.
//!
//! Each probe point runs a five-phase move sequence: travel to the point at
//! the start height, a fast endstop-watched descent, a short retract, a slow
//! endstop-watched descent for the actual measurement, and the final
//! retract. The measured heights feed a linear (optionally quadratic)
//! least-squares fit whose coefficients perturb the probe-axis coordinate in
//! the kinematic transform (see [`BedProbe::do_correction`]).
//!
//! The sequencer is driven by the motion planner: it submits one
//! [`ProbeMove`] at a time and advances on `move_finished` callbacks. During
//! watched moves the planner polls [`BedProbe::prestep_callback`] from its
//! step interrupt and aborts the move once the endstop fires.

use embedded_hal::digital::InputPin;
use serde::{Deserialize, Serialize};

mod correction;

use crate::command::{CmdStatus, CommandParams};
use crate::error::{report_error, ProbeError};
use crate::hal::{append_f32, append_u32, Console, OutputStream};
use crate::planner::{ProbeHost, ProbeMove, ProbePlanner};
use crate::{MAX_CORRECTION_FACTORS, MAX_PLATFORM_AXES, MAX_PROBE_POINTS};

/// No probing in progress.
const IDLE: i8 = -1;
/// The after-probing hook is running; the command finishes when it does.
const HOOK_RUNNING: i8 = -2;

const LAST_POINT_STATE: u8 = 4;

/// One configured probe point.
#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProbePoint {
    pub enabled: bool,
    /// Platform-axis coordinates of the point.
    pub coords: [f32; MAX_PLATFORM_AXES],
    /// Per-point offset added to the reported height.
    pub z_offset: f32,
}

/// Static probing configuration.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProbeConfig {
    /// Display names of the platform axes, `num_platform_axes` of them.
    pub platform_axis_names: [char; MAX_PLATFORM_AXES],
    pub num_platform_axes: usize,
    pub probe_axis_name: char,
    /// Endstop polarity: triggered when the pin level differs from this.
    pub invert: bool,
    /// Probe-to-nozzle offset per platform axis, added to point coords.
    pub platform_offset: [f32; MAX_PLATFORM_AXES],
    pub start_height: f32,
    pub low_height: f32,
    pub retract_dist: f32,
    pub move_speed: f32,
    pub fast_speed: f32,
    pub retract_speed: f32,
    pub slow_speed: f32,
    /// Offset added to every reported height.
    pub general_z_offset: f32,
    pub points: heapless::Vec<ProbePoint, MAX_PROBE_POINTS>,
    /// Whether quadratic correction terms exist at all.
    pub quadratic_supported: bool,
    /// Whether the fit currently uses them.
    pub quadratic_enabled: bool,
}

/// The probing module.
pub struct BedProbe<Pin: InputPin> {
    cfg: ProbeConfig,
    pin: Pin,
    current_point: i8,
    point_state: u8,
    single_point_mode: bool,
    single_point_retract: f32,
    fit_dry_run: bool,
    command_sent: bool,
    move_error: bool,
    heights: [f32; MAX_PROBE_POINTS],
    corrections: [f32; MAX_CORRECTION_FACTORS],
}

impl<Pin: InputPin> BedProbe<Pin> {
    pub fn new(cfg: ProbeConfig, pin: Pin) -> Self {
        debug_assert!(cfg.num_platform_axes <= MAX_PLATFORM_AXES);
        Self {
            cfg,
            pin,
            current_point: IDLE,
            point_state: 0,
            single_point_mode: false,
            single_point_retract: 0.0,
            fit_dry_run: false,
            command_sent: false,
            move_error: false,
            heights: [f32::NAN; MAX_PROBE_POINTS],
            corrections: [0.0; MAX_CORRECTION_FACTORS],
        }
    }

    pub fn cfg(&self) -> &ProbeConfig {
        &self.cfg
    }

    /// Whether a probe sequence (or its completion hook) is in progress.
    pub fn busy(&self) -> bool {
        self.current_point != IDLE
    }

    /// Endstop state after polarity correction. Pin faults read as not
    /// triggered; the watched-move timeout then surfaces the problem.
    pub fn endstop_triggered(&mut self) -> bool {
        let level = self.pin.is_high().unwrap_or(self.cfg.invert);
        level != self.cfg.invert
    }

    /// Per-step predicate installed on the planner during watched moves.
    /// Runs in step-interrupt context.
    pub fn prestep_callback(&mut self) -> bool {
        self.endstop_triggered()
    }

    /// ` Probe:<0|1>` for endstop status lines.
    pub fn append_endstop_status(&mut self, out: &mut (impl OutputStream + ?Sized)) {
        let triggered = self.endstop_triggered();
        out.append(" Probe:");
        out.append(if triggered { "1" } else { "0" });
    }

    /// Handle a command owned by this module; `None` for foreign numbers.
    pub fn dispatch(
        &mut self,
        cmd: &CommandParams,
        console: &mut impl Console,
        planner: &mut impl ProbePlanner,
        host: &mut impl ProbeHost,
    ) -> Option<CmdStatus> {
        match (cmd.letter, cmd.number) {
            ('G', 32) => Some(self.start_probe(cmd, console, planner)),
            ('M', 561) => {
                self.corrections = [0.0; MAX_CORRECTION_FACTORS];
                host.corrections_changed();
                Some(CmdStatus::Done)
            }
            ('M', 937) => {
                self.print_corrections(
                    console.locked(),
                    "EffectiveCorrections",
                    &self.corrections,
                );
                Some(CmdStatus::Done)
            }
            _ => None,
        }
    }

    /// Begin probing: all enabled points, or a single point with `P<n>` (and
    /// an optional `R` retract distance). `D` computes the correction fit
    /// without committing it.
    fn start_probe(
        &mut self,
        cmd: &CommandParams,
        console: &mut impl Console,
        planner: &mut impl ProbePlanner,
    ) -> CmdStatus {
        debug_assert_eq!(self.current_point, IDLE);

        if let Some(point_number) = cmd.get_u32('P') {
            if !(point_number >= 1 && point_number <= self.cfg.points.len() as u32) {
                report_error(console.locked(), ProbeError::InvalidPointNumber);
                return CmdStatus::Error;
            }
            self.single_point_retract = cmd.get_f32('R').unwrap_or(0.0);
            self.current_point = (point_number - 1) as i8;
            self.single_point_mode = true;
        } else {
            self.current_point = 0;
            self.single_point_mode = false;
            self.skip_disabled_points();
            if self.current_point == IDLE {
                report_error(console.locked(), ProbeError::NoProbePointsEnabled);
                return CmdStatus::Error;
            }
        }

        self.fit_dry_run = cmd.has('D');
        self.point_state = 0;
        self.command_sent = false;
        self.move_error = false;
        self.heights = [f32::NAN; MAX_PROBE_POINTS];
        self.begin_point_move(planner);
        CmdStatus::Pending
    }

    /// Planner callback: the submitted move was rejected or failed.
    /// `move_finished` still follows and aborts the sequence.
    pub fn move_failed(&mut self) {
        debug_assert!(self.current_point >= 0);
        debug_assert!(self.command_sent);
        self.move_error = true;
    }

    /// Planner callback: the submitted move ran to completion (`aborted`
    /// false) or was cut short by the endstop predicate (`aborted` true).
    pub fn move_finished(
        &mut self,
        aborted: bool,
        console: &mut impl Console,
        planner: &mut impl ProbePlanner,
        host: &mut impl ProbeHost,
    ) {
        debug_assert!(self.current_point >= 0);
        debug_assert!(self.point_state <= LAST_POINT_STATE);
        debug_assert!(self.command_sent);
        debug_assert!(!aborted || Self::state_watches(self.point_state));
        self.command_sent = false;

        if self.move_error {
            return self.finish_probing(Some(ProbeError::Move), console, host);
        }

        if Self::state_watches(self.point_state) && !aborted {
            return self.finish_probing(
                Some(ProbeError::EndstopNotTriggeredInProbeMove),
                console,
                host,
            );
        }

        if self.point_state == LAST_POINT_STATE {
            if self.single_point_mode {
                self.current_point = IDLE;
            } else {
                self.current_point += 1;
                self.skip_disabled_points();
            }
            if self.current_point == IDLE {
                return self.finish_probing(None, console, host);
            }
            self.point_state = 0;
            self.begin_point_move(planner);
            return;
        }

        if self.point_state == 3 {
            // The slow descent stopped at the trigger height.
            let height = planner.probe_axis_position()
                + self.cfg.general_z_offset
                + self.cfg.points[self.current_point as usize].z_offset;
            self.record_measurement(self.current_point as usize, height, console);
        }

        self.point_state += 1;
        if Self::state_watches(self.point_state) && self.endstop_triggered() {
            return self.finish_probing(
                Some(ProbeError::EndstopTriggeredBeforeProbeMove),
                console,
                host,
            );
        }
        self.begin_point_move(planner);
    }

    /// After-probing hook completion; finishes the G32 command.
    pub fn hook_completed(&mut self, error: bool, console: &mut impl Console) {
        debug_assert_eq!(self.current_point, HOOK_RUNNING);
        self.current_point = IDLE;
        console.finish_locked(!error);
    }

    fn state_watches(point_state: u8) -> bool {
        point_state == 1 || point_state == 3
    }

    fn skip_disabled_points(&mut self) {
        let count = self.cfg.points.len() as i8;
        while self.current_point >= 0
            && self.current_point < count
            && !self.cfg.points[self.current_point as usize].enabled
        {
            self.current_point += 1;
        }
        if self.current_point >= count {
            self.current_point = IDLE;
        }
    }

    fn begin_point_move(&mut self, planner: &mut impl ProbePlanner) {
        debug_assert!(self.current_point >= 0);
        debug_assert!(!self.command_sent);
        let point = &self.cfg.points[self.current_point as usize];

        let mv = match self.point_state {
            0 => {
                let mut platform = [0.0; MAX_PLATFORM_AXES];
                for axis in 0..self.cfg.num_platform_axes {
                    platform[axis] =
                        point.coords[axis] + self.cfg.platform_offset[axis];
                }
                ProbeMove {
                    platform: Some(platform),
                    probe_height: self.cfg.start_height,
                    speed: self.cfg.move_speed,
                    watch_endstop: false,
                }
            }
            1 => ProbeMove {
                platform: None,
                probe_height: self.cfg.low_height,
                speed: self.cfg.fast_speed,
                watch_endstop: true,
            },
            2 => ProbeMove {
                platform: None,
                probe_height: planner.probe_axis_position() + self.cfg.retract_dist,
                speed: self.cfg.retract_speed,
                watch_endstop: false,
            },
            3 => ProbeMove {
                platform: None,
                probe_height: self.cfg.low_height,
                speed: self.cfg.slow_speed,
                watch_endstop: true,
            },
            _ => {
                let probe_height = if self.single_point_mode {
                    planner.probe_axis_position() + self.single_point_retract
                } else {
                    self.cfg.start_height
                };
                ProbeMove {
                    platform: None,
                    probe_height,
                    speed: self.cfg.retract_speed,
                    watch_endstop: false,
                }
            }
        };

        self.command_sent = true;
        planner.submit(mv);
    }

    fn record_measurement(
        &mut self,
        point: usize,
        height: f32,
        console: &mut impl Console,
    ) {
        self.heights[point] = height;
        let out = console.locked();
        out.append("//ProbeHeight@P");
        append_u32(out, point as u32 + 1);
        out.append(" ");
        append_f32(out, height);
        out.append("\n");
        out.poke();
    }

    fn finish_probing(
        &mut self,
        error: Option<ProbeError>,
        console: &mut impl Console,
        host: &mut impl ProbeHost,
    ) {
        let mut ok = error.is_none();
        let mut run_hook = false;
        if let Some(e) = error {
            report_error(console.locked(), e);
            log::warn!("probing aborted: {}", e);
        } else if !self.single_point_mode {
            match self.fit_corrections(console, host) {
                Ok(()) => run_hook = true,
                Err(e) => {
                    report_error(console.locked(), e);
                    ok = false;
                }
            }
        }

        if !run_hook {
            self.current_point = IDLE;
            console.finish_locked(ok);
            return;
        }

        self.current_point = HOOK_RUNNING;
        host.start_after_probing_hook();
    }
}
