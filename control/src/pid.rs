use serde::{Deserialize, Serialize};

/// PID gains and limits for one heater loop.
///
/// The integrator state is clamped to `[i_state_min, i_state_max]` which
/// doubles as anti-windup and as a cap on the steady-state drive. The
/// derivative acts on the measurement (not the error) and is smoothed by a
/// first-order filter with factor `d_history` in `[0, 1)`; higher values
/// average over more intervals.
#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PidConfig {
    pub p: f32,
    pub i: f32,
    pub d: f32,
    pub i_state_min: f32,
    pub i_state_max: f32,
    pub d_history: f32,
}

impl Default for PidConfig {
    fn default() -> Self {
        Self {
            p: 0.05,
            i: 0.0006,
            d: 0.2,
            i_state_min: 0.0,
            i_state_max: 0.6,
            d_history: 0.7,
        }
    }
}

/// Discrete PID controller updated once per control interval.
///
/// The update period is fixed at construction; all gains are expressed per
/// second so retuning survives an interval change.
#[derive(Copy, Clone, Debug)]
pub struct Pid {
    cfg: PidConfig,
    interval: f32,
    integral: f32,
    derivative: f32,
    last_measurement: f32,
    first_update: bool,
}

impl Pid {
    /// `interval` is the update period in seconds.
    pub fn new(cfg: PidConfig, interval: f32) -> Self {
        Self {
            cfg,
            interval,
            integral: 0.0,
            derivative: 0.0,
            last_measurement: 0.0,
            first_update: true,
        }
    }

    /// Clears integrator and derivative history. Called when a loop is
    /// (re-)enabled so stale state from a previous run cannot kick the
    /// output.
    pub fn reset(&mut self) {
        self.integral = 0.0;
        self.derivative = 0.0;
        self.first_update = true;
    }

    /// Feed one measurement and obtain the new drive in `[0, 1]`.
    pub fn update(&mut self, measurement: f32, target: f32) -> f32 {
        let error = target - measurement;

        if self.first_update {
            self.first_update = false;
            self.derivative = 0.0;
        } else {
            let slope = (self.last_measurement - measurement) / self.interval;
            self.derivative = self.cfg.d_history * self.derivative
                + (1.0 - self.cfg.d_history) * slope;
        }
        self.last_measurement = measurement;

        self.integral += self.cfg.i * error * self.interval;
        self.integral = self
            .integral
            .clamp(self.cfg.i_state_min, self.cfg.i_state_max);

        let output =
            self.cfg.p * error + self.integral + self.cfg.d * self.derivative;
        output.clamp(0.0, 1.0)
    }
}
