use num_traits::Float;
use serde::{Deserialize, Serialize};

/// Bidirectional mapping between a normalized ADC reading in `(0, 1)` and a
/// temperature in degrees Celsius.
///
/// `negative_slope` declares the direction of the mapping: when true, a
/// larger ADC value means a lower temperature. Safety-limit derivation uses
/// this to decide which temperature bound maps to which ADC bound.
pub trait Formula {
    fn adc_to_temp(&self, adc: f32) -> f32;
    fn temp_to_adc(&self, temp: f32) -> f32;
    fn negative_slope(&self) -> bool;
}

const ZERO_CELSIUS: f32 = 273.15;

/// NTC thermistor in a divider against a pull-up resistor.
#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ThermistorConfig {
    /// Pull-up resistance, ohms.
    pub resistor: f32,
    /// Thermistor resistance at `t0`, ohms.
    pub r0: f32,
    /// Beta coefficient, kelvin.
    pub beta: f32,
    /// Reference temperature for `r0`, degrees Celsius.
    pub t0: f32,
    /// Conversion results are clamped to this range.
    pub min_temp: f32,
    pub max_temp: f32,
}

impl Default for ThermistorConfig {
    fn default() -> Self {
        // 100k NTC (EPCOS B57560G104F class), 4.7k pull-up.
        Self {
            resistor: 4700.0,
            r0: 100000.0,
            beta: 3960.0,
            t0: 25.0,
            min_temp: -40.0,
            max_temp: 300.0,
        }
    }
}

/// Beta-equation evaluation of a [`ThermistorConfig`].
///
/// The divider has the thermistor on the low side, so the measured fraction
/// is `r / (r + resistor)`: resistance falls with temperature and so does the
/// ADC value.
#[derive(Copy, Clone, Debug)]
pub struct Thermistor {
    cfg: ThermistorConfig,
}

impl Thermistor {
    pub fn new(cfg: ThermistorConfig) -> Self {
        Self { cfg }
    }
}

impl Formula for Thermistor {
    fn adc_to_temp(&self, adc: f32) -> f32 {
        if !(adc > 0.0 && adc < 1.0) {
            return f32::NAN;
        }
        let r = self.cfg.resistor * adc / (1.0 - adc);
        let t0_k = self.cfg.t0 + ZERO_CELSIUS;
        let inv_t = 1.0 / t0_k + (r / self.cfg.r0).ln() / self.cfg.beta;
        let temp = 1.0 / inv_t - ZERO_CELSIUS;
        temp.clamp(self.cfg.min_temp, self.cfg.max_temp)
    }

    fn temp_to_adc(&self, temp: f32) -> f32 {
        let t_k = temp + ZERO_CELSIUS;
        let t0_k = self.cfg.t0 + ZERO_CELSIUS;
        let r = self.cfg.r0 * (self.cfg.beta * (1.0 / t_k - 1.0 / t0_k)).exp();
        r / (r + self.cfg.resistor)
    }

    fn negative_slope(&self) -> bool {
        true
    }
}
