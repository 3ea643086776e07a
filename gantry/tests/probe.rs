//! End-to-end probing and correction scenarios.

mod common;

use std::cell::Cell;
use std::rc::Rc;

use common::*;
use gantry::bed_probe::{BedProbe, ProbeConfig, ProbePoint};
use gantry::command::{CmdStatus, CommandParams};
use gantry::hal::Clock;

const RETRACT: f32 = 1.0;

fn point(x: f32, y: f32) -> ProbePoint {
    ProbePoint {
        enabled: true,
        coords: [x, y, 0.0],
        z_offset: 0.0,
    }
}

fn config() -> ProbeConfig {
    let mut points = heapless::Vec::new();
    for p in [point(0.0, 0.0), point(2.0, 0.0), point(0.0, 2.0), point(2.0, 2.0)] {
        points.push(p).unwrap();
    }
    ProbeConfig {
        platform_axis_names: ['X', 'Y', '_'],
        num_platform_axes: 2,
        probe_axis_name: 'Z',
        invert: false,
        platform_offset: [0.0; 3],
        start_height: 5.0,
        low_height: -1.0,
        retract_dist: RETRACT,
        move_speed: 100.0,
        fast_speed: 10.0,
        retract_speed: 20.0,
        slow_speed: 2.0,
        general_z_offset: 0.0,
        points,
        quadratic_supported: false,
        quadratic_enabled: false,
    }
}

struct ProbeRig {
    probe: BedProbe<SharedPin>,
    pin: Rc<Cell<bool>>,
    planner: MockProbePlanner,
    console: MockConsole,
    host: MockHost,
}

fn rig_with(cfg: ProbeConfig) -> ProbeRig {
    let pin = SharedPin::default();
    let level = pin.high.clone();
    ProbeRig {
        probe: BedProbe::new(cfg, pin),
        pin: level,
        planner: MockProbePlanner::default(),
        console: MockConsole::default(),
        host: MockHost::default(),
    }
}

impl ProbeRig {
    fn dispatch(&mut self, cmd: &CommandParams) -> Option<CmdStatus> {
        self.probe
            .dispatch(cmd, &mut self.console, &mut self.planner, &mut self.host)
    }

    fn finish(&mut self, aborted: bool) {
        self.probe
            .move_finished(aborted, &mut self.console, &mut self.planner, &mut self.host);
    }

    /// Drive the five phases of one point, with the endstop firing at
    /// `trigger_z` on both watched descents.
    fn run_point(&mut self, trigger_z: f32) {
        self.finish(false); // travel to the point
        self.planner.position = trigger_z;
        self.finish(true); // fast descent, aborted at the trigger
        self.planner.position = trigger_z + RETRACT;
        self.finish(false); // retract
        self.planner.position = trigger_z;
        self.finish(true); // slow descent, the measurement
        let final_target = self.planner.moves.last().unwrap().probe_height;
        self.planner.position = final_target;
        self.finish(false); // final retract
    }
}

fn g32() -> CommandParams {
    CommandParams::new('G', 32)
}

#[test]
fn single_point_probe_reports_and_retracts() {
    let mut cfg = config();
    cfg.general_z_offset = 0.25;
    cfg.points[0].z_offset = 0.05;
    let mut rig = rig_with(cfg);

    let status = rig.dispatch(&g32().with('P', Some(1.0)).with('R', Some(5.0)));
    assert_eq!(status, Some(CmdStatus::Pending));

    // Approach move carries the platform coordinates and start height.
    let approach = rig.planner.moves[0];
    assert_eq!(approach.platform, Some([0.0, 0.0, 0.0]));
    assert_eq!(approach.probe_height, 5.0);
    assert!(!approach.watch_endstop);

    rig.run_point(0.2);

    let expected = format!("//ProbeHeight@P1 {}\n", 0.2f32 + 0.25 + 0.05);
    assert!(
        rig.console.locked.content.contains(&expected),
        "{}",
        rig.console.locked.content
    );
    // Final retract is the user distance above the trigger height.
    assert_eq!(rig.planner.moves.last().unwrap().probe_height, 0.2 + 5.0);
    assert_eq!(rig.console.finished, vec![true]);
    assert!(!rig.probe.busy());
    // Single-point probing never touches the corrections.
    assert_eq!(rig.host.hooks_started, 0);
    assert!(rig.probe.corrections().iter().all(|c| *c == 0.0));
}

#[test]
fn watched_phases_alternate_with_retracts() {
    let mut rig = rig_with(config());
    rig.dispatch(&g32().with('P', Some(1.0)));
    rig.run_point(0.2);
    let watch: Vec<bool> = rig.planner.moves.iter().map(|m| m.watch_endstop).collect();
    assert_eq!(watch, vec![false, true, false, true, false]);
    // Retract between the descents sits `retract_dist` above the trigger.
    assert_eq!(rig.planner.moves[2].probe_height, 0.2 + RETRACT);
}

#[test]
fn unwatched_trigger_is_an_error() {
    let mut rig = rig_with(config());
    rig.dispatch(&g32().with('P', Some(1.0)));
    rig.finish(false); // travel
    rig.finish(false); // fast descent ran to the bottom without a trigger
    assert_eq!(rig.console.finished, vec![false]);
    assert!(rig
        .console
        .locked
        .content
        .contains("Error:EndstopNotTriggeredInProbeMove\n"));
    assert!(!rig.probe.busy());
}

#[test]
fn early_trigger_is_an_error() {
    let mut rig = rig_with(config());
    rig.dispatch(&g32().with('P', Some(1.0)));
    rig.finish(false); // travel
    rig.planner.position = 0.2;
    rig.finish(true); // fast descent triggers
    rig.planner.position = 0.2 + RETRACT;
    // The probe is still reading triggered when the slow descent would
    // start.
    rig.pin.set(true);
    rig.finish(false); // retract done
    assert_eq!(rig.console.finished, vec![false]);
    assert!(rig
        .console
        .locked
        .content
        .contains("Error:EndstopTriggeredBeforeProbeMove\n"));
}

#[test]
fn rejected_move_aborts_the_sequence() {
    let mut rig = rig_with(config());
    rig.dispatch(&g32().with('P', Some(1.0)));
    rig.probe.move_failed();
    rig.finish(false);
    assert_eq!(rig.console.finished, vec![false]);
    assert!(rig.console.locked.content.contains("Error:Move\n"));
}

#[test]
fn invalid_point_number() {
    let mut rig = rig_with(config());
    let status = rig.dispatch(&g32().with('P', Some(9.0)));
    assert_eq!(status, Some(CmdStatus::Error));
    assert!(rig
        .console
        .locked
        .content
        .contains("Error:InvalidPointNumber\n"));
}

#[test]
fn all_points_disabled() {
    let mut cfg = config();
    for p in cfg.points.iter_mut() {
        p.enabled = false;
    }
    let mut rig = rig_with(cfg);
    let status = rig.dispatch(&g32());
    assert_eq!(status, Some(CmdStatus::Error));
    assert!(rig
        .console
        .locked
        .content
        .contains("Error:NoProbePointsEnabled\n"));
}

#[test]
fn full_probe_fits_a_plane_and_commits() {
    let h = 0.8f32;
    let mut rig = rig_with(config());
    let status = rig.dispatch(&g32());
    assert_eq!(status, Some(CmdStatus::Pending));

    // Corners measure [0, 0, h, h]: a pure tilt along y.
    for trigger in [0.0, 0.0, h, h] {
        rig.run_point(trigger);
    }

    assert!(rig.console.locked.content.contains("RelativeCorrections Z:"));
    assert_eq!(rig.host.corrections_changed, 1);
    assert_eq!(rig.host.hooks_started, 1);
    assert!(rig.probe.busy());
    rig.probe.hook_completed(false, &mut rig.console);
    assert_eq!(rig.console.finished, vec![true]);
    assert!(!rig.probe.busy());

    let c = rig.probe.corrections();
    assert!(c[0].abs() < 1e-3, "linear x = {}", c[0]);
    assert!((c[1] - h / 2.0).abs() < 1e-3, "linear y = {}", c[1]);
    assert!(c[2].abs() < 1e-3, "const = {}", c[2]);

    // The fitted surface reproduces every measurement.
    for (coords, measured) in [
        ([0.0, 0.0], 0.0),
        ([2.0, 0.0], 0.0),
        ([0.0, 2.0], h),
        ([2.0, 2.0], h),
    ] {
        let residual = measured - rig.probe.correction_for(&coords);
        assert!(residual.abs() < 1e-3, "residual {residual}");
    }

    // Forward then inverse application is an identity on the probe axis.
    let platform = [1.3, 0.7];
    let z = 2.5f32;
    let forward = rig.probe.do_correction(&platform, z, false);
    let back = rig.probe.do_correction(&platform, forward, true);
    assert!((back - z).abs() < 1e-6);
}

#[test]
fn dry_run_reports_without_committing() {
    let h = 0.8f32;
    let mut rig = rig_with(config());
    rig.dispatch(&g32().with('D', None));
    for trigger in [0.0, 0.0, h, h] {
        rig.run_point(trigger);
    }
    assert!(rig.console.locked.content.contains("RelativeCorrections Z:"));
    assert_eq!(rig.host.corrections_changed, 0);
    assert!(rig.probe.corrections().iter().all(|c| *c == 0.0));
    // The hook still runs; only the commit is skipped.
    assert_eq!(rig.host.hooks_started, 1);
}

#[test]
fn too_few_valid_points_fail_the_fit() {
    let mut cfg = config();
    cfg.points[2].enabled = false;
    cfg.points[3].enabled = false;
    let mut rig = rig_with(cfg);
    rig.dispatch(&g32());
    rig.run_point(0.1);
    rig.run_point(0.1);
    assert_eq!(rig.console.finished, vec![false]);
    assert!(rig
        .console
        .locked
        .content
        .contains("Error:TooFewPointsForCorrection\n"));
    assert_eq!(rig.host.hooks_started, 0);
}

#[test]
fn disabled_points_are_skipped() {
    let mut cfg = config();
    cfg.points[1].enabled = false;
    let mut rig = rig_with(cfg);
    rig.dispatch(&g32());
    for trigger in [0.1, 0.1, 0.1] {
        rig.run_point(trigger);
    }
    rig.probe.hook_completed(false, &mut rig.console);
    let replies = &rig.console.locked.content;
    assert!(replies.contains("//ProbeHeight@P1 "));
    assert!(!replies.contains("//ProbeHeight@P2 "));
    assert!(replies.contains("//ProbeHeight@P3 "));
    assert!(replies.contains("//ProbeHeight@P4 "));
    // Three points, five moves each.
    assert_eq!(rig.planner.moves.len(), 15);
}

#[test]
fn quadratic_fit_recovers_a_saddle() {
    let mut cfg = config();
    cfg.quadratic_supported = true;
    cfg.quadratic_enabled = true;
    cfg.points.clear();
    for (x, y) in [
        (0.0, 0.0),
        (2.0, 0.0),
        (4.0, 0.0),
        (0.0, 2.0),
        (2.0, 2.0),
        (4.0, 2.0),
        (0.0, 4.0),
        (2.0, 4.0),
    ] {
        cfg.points.push(point(x, y)).unwrap();
    }
    let mut rig = rig_with(cfg);
    rig.dispatch(&g32());

    // Bed shaped like z = 0.1 * x * y.
    let triggers: Vec<f32> = rig
        .probe
        .cfg()
        .points
        .iter()
        .map(|p| 0.1 * p.coords[0] * p.coords[1])
        .collect();
    for trigger in triggers {
        rig.run_point(trigger);
    }

    let c = rig.probe.corrections();
    // Layout: x, y, const, xx, xy, yy.
    assert!((c[4] - 0.1).abs() < 1e-3, "xy = {}", c[4]);
    for (index, value) in c.iter().enumerate() {
        if index != 4 {
            assert!(value.abs() < 1e-3, "c[{index}] = {value}");
        }
    }
}

#[test]
fn dispatcher_routes_between_subsystems() {
    use control::{ObserverConfig, PidConfig, Thermistor, ThermistorConfig};
    use gantry::aux_control::{AuxConfig, AuxControl, AuxName, Fan, Heater, HeaterConfig};
    use gantry::time::TimeConversion;

    let clock = FakeClock::default();
    let heater_cfg = HeaterConfig {
        name: AuxName::new('T', 0),
        set_m_command: 104,
        set_wait_m_command: 109,
        min_safe_temp: 10.0,
        max_safe_temp: 280.0,
        control_interval: 0.25,
        pid: PidConfig::default(),
        observer: ObserverConfig::default(),
        cold_extrusion: None,
    };
    let heaters = [Heater::new(
        heater_cfg,
        SharedPwm::default(),
        SharedAdc::default(),
        Thermistor::new(ThermistorConfig::default()),
        TimeConversion {
            ticks_per_second: 1000.0,
        },
        clock.now(),
    )];
    let fans: [Fan<SharedPwm>; 0] = [];
    let mut aux: AuxControl<_, _, _, SharedPwm, 1, 0> = AuxControl::new(
        heaters,
        fans,
        AuxConfig {
            time: TimeConversion {
                ticks_per_second: 1000.0,
            },
            wait_timeout: 10.0,
            wait_report_period: 1.0,
        },
    );
    let mut probe = BedProbe::new(config(), SharedPin::default());
    let mut console = MockConsole::default();
    let mut aux_planner = RecordingAuxPlanner::default();
    let mut probe_planner = MockProbePlanner::default();
    let mut host = MockHost::default();

    let status = gantry::command::dispatch(
        &mut aux,
        &mut probe,
        &CommandParams::new('M', 105),
        &clock,
        &mut console,
        &mut aux_planner,
        &mut probe_planner,
        &mut host,
    );
    assert_eq!(status, Some(CmdStatus::Done));
    assert!(console.locked.content.starts_with("ok T:"));

    let status = gantry::command::dispatch(
        &mut aux,
        &mut probe,
        &g32().with('P', Some(1.0)),
        &clock,
        &mut console,
        &mut aux_planner,
        &mut probe_planner,
        &mut host,
    );
    assert_eq!(status, Some(CmdStatus::Pending));
    assert_eq!(probe_planner.moves.len(), 1);

    let status = gantry::command::dispatch(
        &mut aux,
        &mut probe,
        &CommandParams::new('M', 999),
        &clock,
        &mut console,
        &mut aux_planner,
        &mut probe_planner,
        &mut host,
    );
    assert_eq!(status, None);
}

#[test]
fn zero_and_print_corrections() {
    let mut rig = rig_with(config());
    rig.dispatch(&g32());
    for trigger in [0.0, 0.0, 0.8, 0.8] {
        rig.run_point(trigger);
    }
    rig.probe.hook_completed(false, &mut rig.console);
    assert!(rig.probe.corrections().iter().any(|c| *c != 0.0));

    let status = rig.dispatch(&CommandParams::new('M', 561));
    assert_eq!(status, Some(CmdStatus::Done));
    assert_eq!(rig.host.corrections_changed, 2);
    assert!(rig.probe.corrections().iter().all(|c| *c == 0.0));

    rig.console.locked.content.clear();
    let status = rig.dispatch(&CommandParams::new('M', 937));
    assert_eq!(status, Some(CmdStatus::Done));
    assert_eq!(
        rig.console.locked.content,
        "EffectiveCorrections Z:0 X:0 Y:0\n"
    );
}
