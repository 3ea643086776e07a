//! Parsed command access and the numeric command dispatcher.
//!
//! The wire harness (line reader, checksums, ok/error framing) is external;
//! it hands the core a [`CommandParams`] view of the parsed command and a
//! [`crate::hal::Console`] for replies.

use control::Formula;
use embedded_hal::digital::InputPin;

use crate::aux_control::AuxControl;
use crate::bed_probe::BedProbe;
use crate::hal::{AnalogInput, Clock, Console, PwmChannel};
use crate::planner::{AuxPlanner, ProbeHost, ProbePlanner};

pub const MAX_PARAMS: usize = 8;

/// One `<letter>[value]` command parameter.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct Param {
    pub letter: char,
    pub value: Option<f32>,
}

/// A parsed command: the code letter (`G`/`M`), the numeric code, and the
/// parameters.
#[derive(Clone, Debug)]
pub struct CommandParams {
    pub letter: char,
    pub number: u16,
    pub params: heapless::Vec<Param, MAX_PARAMS>,
}

impl CommandParams {
    pub fn new(letter: char, number: u16) -> Self {
        Self {
            letter,
            number,
            params: heapless::Vec::new(),
        }
    }

    /// Builder-style parameter append; excess parameters are dropped.
    pub fn with(mut self, letter: char, value: Option<f32>) -> Self {
        let _ = self.params.push(Param { letter, value });
        self
    }

    pub fn has(&self, letter: char) -> bool {
        self.params.iter().any(|p| p.letter == letter)
    }

    pub fn get_f32(&self, letter: char) -> Option<f32> {
        self.params
            .iter()
            .find(|p| p.letter == letter)
            .and_then(|p| p.value)
    }

    pub fn get_u32(&self, letter: char) -> Option<u32> {
        self.get_f32(letter).map(|v| v as u32)
    }

    /// Numeric value of a parameter, with a valueless parameter reading as
    /// zero. `None` when the letter is absent entirely.
    pub fn name_value(&self, letter: char) -> Option<u32> {
        self.params
            .iter()
            .find(|p| p.letter == letter)
            .map(|p| p.value.unwrap_or(0.0) as u32)
    }
}

/// Outcome of dispatching one command.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CmdStatus {
    /// Replied and finished.
    Done,
    /// Finished with an `Error:` diagnostic already written.
    Error,
    /// The command holds the machine; completion arrives later through
    /// [`Console::finish_locked`].
    Pending,
}

/// Route a command to the subsystem owning its number. Returns `None` for
/// numbers no subsystem claims.
#[allow(clippy::too_many_arguments)]
pub fn dispatch<HP, HA, HF, FP, const NH: usize, const NF: usize, PIN>(
    aux: &mut AuxControl<HP, HA, HF, FP, NH, NF>,
    probe: &mut BedProbe<PIN>,
    cmd: &CommandParams,
    clock: &impl Clock,
    console: &mut impl Console,
    aux_planner: &mut impl AuxPlanner,
    probe_planner: &mut impl ProbePlanner,
    host: &mut impl ProbeHost,
) -> Option<CmdStatus>
where
    HP: PwmChannel,
    HA: AnalogInput,
    HF: Formula,
    FP: PwmChannel,
    PIN: InputPin,
{
    if let Some(status) = aux.dispatch(cmd, clock, console, aux_planner) {
        return Some(status);
    }
    probe.dispatch(cmd, console, probe_planner, host)
}
