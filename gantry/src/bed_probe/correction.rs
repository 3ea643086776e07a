//! Least-squares bed-shape correction.
//!
//! Column layout of the correction vector: one linear term per platform
//! axis, then the constant, then (when supported) the pairwise quadratic
//! products `x_i * x_j` for `i <= j` in lexicographic order.

use control::lstsq;
use embedded_hal::digital::InputPin;

use super::BedProbe;
use crate::error::ProbeError;
use crate::hal::{append_display, append_f32, Console, OutputStream};
use crate::planner::ProbeHost;
use crate::{MAX_CORRECTION_FACTORS, MAX_PROBE_POINTS};

impl<Pin: InputPin> BedProbe<Pin> {
    fn quadratic_active(&self) -> bool {
        self.cfg.quadratic_supported && self.cfg.quadratic_enabled
    }

    /// Fit the valid height samples and fold the result into the persistent
    /// correction vector (unless the command asked for a dry run). Reports
    /// the fitted delta as `RelativeCorrections`.
    pub(super) fn fit_corrections(
        &mut self,
        console: &mut impl Console,
        host: &mut impl ProbeHost,
    ) -> Result<(), ProbeError> {
        let axes = self.cfg.num_platform_axes;
        let quadratic = self.quadratic_active();
        let num_cols = axes + 1 + if quadratic { axes * (axes + 1) / 2 } else { 0 };

        let mut a = [[0.0f32; MAX_CORRECTION_FACTORS]; MAX_PROBE_POINTS];
        let mut b = [0.0f32; MAX_PROBE_POINTS];
        let mut rows = 0usize;
        for (index, point) in self.cfg.points.iter().enumerate() {
            let height = self.heights[index];
            if height.is_nan() {
                continue;
            }
            for axis in 0..axes {
                a[rows][axis] = point.coords[axis];
            }
            a[rows][axes] = 1.0;
            if quadratic {
                let mut col = axes + 1;
                for i in 0..axes {
                    for j in i..axes {
                        a[rows][col] = point.coords[i] * point.coords[j];
                        col += 1;
                    }
                }
            }
            b[rows] = height;
            rows += 1;
        }

        if rows < num_cols {
            return Err(ProbeError::TooFewPointsForCorrection);
        }

        let mut delta = [0.0f32; MAX_CORRECTION_FACTORS];
        lstsq::solve_in_place(&mut a, &mut b, rows, num_cols, &mut delta);

        self.print_corrections(console.locked(), "RelativeCorrections", &delta);

        if delta.iter().any(|x| !x.is_finite()) {
            return Err(ProbeError::BadCorrections);
        }

        if !self.fit_dry_run {
            for (current, d) in self.corrections.iter_mut().zip(delta.iter()) {
                *current += *d;
            }
            host.corrections_changed();
            log::info!("bed corrections updated from {} samples", rows);
        }
        Ok(())
    }

    /// `<label> Z:<const> X:<lin> Y:<lin> [XX:<q> XY:<q> YY:<q>]`
    pub(super) fn print_corrections(
        &self,
        out: &mut (impl OutputStream + ?Sized),
        label: &str,
        corrections: &[f32; MAX_CORRECTION_FACTORS],
    ) {
        let axes = self.cfg.num_platform_axes;
        out.append(label);
        out.append(" ");
        append_display(out, self.cfg.probe_axis_name);
        out.append(":");
        append_f32(out, corrections[axes]);
        for axis in 0..axes {
            out.append(" ");
            append_display(out, self.cfg.platform_axis_names[axis]);
            out.append(":");
            append_f32(out, corrections[axis]);
        }
        if self.cfg.quadratic_supported {
            let mut col = axes + 1;
            for i in 0..axes {
                for j in i..axes {
                    out.append(" ");
                    append_display(out, self.cfg.platform_axis_names[i]);
                    append_display(out, self.cfg.platform_axis_names[j]);
                    out.append(":");
                    append_f32(out, corrections[col]);
                    col += 1;
                }
            }
        }
        out.append("\n");
    }

    /// The effective correction vector (linear terms, constant, quadratic
    /// terms).
    pub fn corrections(&self) -> &[f32; MAX_CORRECTION_FACTORS] {
        &self.corrections
    }

    /// Probe-axis offset at a platform-coordinate point.
    pub fn correction_for(&self, platform: &[f32]) -> f32 {
        let axes = self.cfg.num_platform_axes;
        debug_assert!(platform.len() >= axes);
        let mut value = self.corrections[axes];
        for axis in 0..axes {
            value += platform[axis] * self.corrections[axis];
        }
        if self.cfg.quadratic_supported {
            let mut col = axes + 1;
            for i in 0..axes {
                for j in i..axes {
                    value += platform[i] * platform[j] * self.corrections[col];
                    col += 1;
                }
            }
        }
        value
    }

    /// Apply (or, for the inverse transform, remove) the correction on the
    /// probe-axis coordinate of a point.
    pub fn do_correction(&self, platform: &[f32], probe_coord: f32, reverse: bool) -> f32 {
        let correction = self.correction_for(platform);
        if reverse {
            probe_coord - correction
        } else {
            probe_coord + correction
        }
    }
}
