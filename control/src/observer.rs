use num_traits::Float;
use serde::{Deserialize, Serialize};

/// Window and dwell for declaring a signal "in range".
#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ObserverConfig {
    /// Half-width of the acceptance window around the target.
    pub tolerance: f32,
    /// The signal must stay inside the window this long, in seconds.
    pub min_time: f32,
    /// Seconds between two samples fed to the observer.
    pub sample_interval: f32,
}

impl Default for ObserverConfig {
    fn default() -> Self {
        Self {
            tolerance: 3.0,
            min_time: 3.0,
            sample_interval: 0.25,
        }
    }
}

/// Watches a scalar signal and reports true once it has stayed within the
/// configured window around the target for the configured dwell time.
///
/// Leaving the window resets the dwell; the observer never latches.
#[derive(Copy, Clone, Debug)]
pub struct Observer {
    tolerance: f32,
    dwell_samples: u32,
    target: f32,
    inrange_samples: u32,
    observing: bool,
}

impl Observer {
    pub fn new(cfg: ObserverConfig) -> Self {
        let dwell_samples = ((cfg.min_time / cfg.sample_interval).ceil() as u32).max(1);
        Self {
            tolerance: cfg.tolerance,
            dwell_samples,
            target: 0.0,
            inrange_samples: 0,
            observing: false,
        }
    }

    pub fn start(&mut self, target: f32) {
        self.target = target;
        self.inrange_samples = 0;
        self.observing = true;
    }

    pub fn stop(&mut self) {
        self.observing = false;
    }

    pub fn observing(&self) -> bool {
        self.observing
    }

    /// Feed one sample; returns the current in-range verdict.
    pub fn sample(&mut self, value: f32) -> bool {
        debug_assert!(self.observing);
        if (value - self.target).abs() <= self.tolerance {
            self.inrange_samples = self.inrange_samples.saturating_add(1);
        } else {
            self.inrange_samples = 0;
        }
        self.inrange_samples >= self.dwell_samples
    }
}
