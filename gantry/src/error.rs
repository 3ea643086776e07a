use thiserror::Error;

use crate::hal::{append_display, OutputStream};

/// Heater/fan error tokens. `Display` output is the stable wire token, so
/// diagnostics embed it directly as `Error:<token>`.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Error)]
pub enum AuxError {
    #[error("HeaterThermalRunaway")]
    HeaterThermalRunaway,
    #[error("WaitTimedOut")]
    WaitTimedOut,
    #[error("HeaterNotEnabled")]
    HeaterNotEnabled,
    #[error("UnknownHeater")]
    UnknownHeater,
    #[error("UnknownFan")]
    UnknownFan,
    #[error("ColdExtrusionPrevented")]
    ColdExtrusionPrevented,
}

/// Probing and correction error tokens.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Error)]
pub enum ProbeError {
    #[error("InvalidPointNumber")]
    InvalidPointNumber,
    #[error("NoProbePointsEnabled")]
    NoProbePointsEnabled,
    #[error("EndstopNotTriggeredInProbeMove")]
    EndstopNotTriggeredInProbeMove,
    #[error("EndstopTriggeredBeforeProbeMove")]
    EndstopTriggeredBeforeProbeMove,
    #[error("Move")]
    Move,
    #[error("TooFewPointsForCorrection")]
    TooFewPointsForCorrection,
    #[error("BadCorrections")]
    BadCorrections,
}

/// Write `Error:<token>\n` to a reply stream.
pub(crate) fn report_error(
    out: &mut (impl OutputStream + ?Sized),
    error: impl core::fmt::Display,
) {
    out.append("Error:");
    append_display(out, error);
    out.append("\n");
}
