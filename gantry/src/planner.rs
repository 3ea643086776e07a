//! Motion-planner collaborator interfaces.
//!
//! The planner itself is external. The core pushes typed payloads into its
//! auxiliary channel buffer and receives them back, at the
//! motion-synchronized instant, through
//! [`crate::aux_control::AuxControl::channel_callback`]. Probing drives the
//! planner with single moves and gets completion callbacks in return.

use serde::{Deserialize, Serialize};

use crate::hal::DutyCycle;
use crate::MAX_PLATFORM_AXES;

/// Auxiliary channel payload, delivered at the scheduled motion time.
#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum ChannelPayload {
    Heater { index: usize, target: f32 },
    Fan { index: usize, duty: DutyCycle },
}

/// The planner's auxiliary command channel.
pub trait AuxPlanner {
    /// Queue a payload behind the motion already buffered; the planner
    /// hands it back to the channel callback when the timeline reaches it.
    fn submit(&mut self, payload: ChannelPayload);
}

/// One probing move request.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct ProbeMove {
    /// Platform-axis targets, present only for the approach move of each
    /// point (probe offsets already applied).
    pub platform: Option<[f32; MAX_PLATFORM_AXES]>,
    /// Probe-axis target.
    pub probe_height: f32,
    /// Speed limit for the move.
    pub speed: f32,
    /// Whether the move aborts when the endstop trigger predicate fires;
    /// the predicate is polled from the planner's per-step callback.
    pub watch_endstop: bool,
}

/// Move submission interface used by the probing sequencer. Completion comes
/// back through `BedProbe::move_finished` (with the abort flag) and
/// `BedProbe::move_failed` for rejected moves.
pub trait ProbePlanner {
    /// Current probe-axis position in virtual coordinates.
    fn probe_axis_position(&self) -> f32;

    fn submit(&mut self, mv: ProbeMove);
}

/// Printer-side services the probe module calls out to.
pub trait ProbeHost {
    /// The corrections vector changed; the kinematic transform must refresh
    /// any cached state.
    fn corrections_changed(&mut self);

    /// Begin the after-probing hook (other modules react to fresh probe
    /// data). Completion is reported back via `BedProbe::hook_completed`.
    fn start_after_probing_hook(&mut self);
}
