use serde::{Deserialize, Serialize};

use super::AuxName;
use crate::hal::{DutyCycle, PwmChannel};

/// Static configuration of one fan.
#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FanConfig {
    pub name: AuxName,
    /// Command number this fan also answers for a plain set (0 = none).
    pub set_m_command: u16,
    /// Command number this fan also answers for off (0 = none).
    pub off_m_command: u16,
    /// Scale applied to the `S` parameter of set commands.
    pub speed_multiply: f32,
}

/// One fan output. The PWM holds all runtime state; the last duty applied is
/// the current duty.
pub struct Fan<P: PwmChannel> {
    cfg: FanConfig,
    pwm: P,
}

impl<P: PwmChannel> Fan<P> {
    pub fn new(cfg: FanConfig, pwm: P) -> Self {
        Self { cfg, pwm }
    }

    pub fn cfg(&self) -> &FanConfig {
        &self.cfg
    }

    pub(crate) fn compute_duty(&self, frac: f32) -> DutyCycle {
        self.pwm.compute_duty(frac)
    }

    pub(crate) fn set_duty(&mut self, duty: DutyCycle) {
        self.pwm.set_duty(duty);
    }

    pub fn emergency(&mut self) {
        self.pwm.emergency_off();
    }
}
