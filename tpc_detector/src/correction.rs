//! Space-point correction providers.
//!
//! A correction maps a measured (distorted) global position back to where the
//! ionisation was produced. The reconstruction only depends on the
//! [`PositionCorrection`] contract; [`SpaceChargeDistortion`] is a simple
//! analytic field used by the toy simulation to distort clusters and by the
//! reconstruction to undo it.

use serde::{Deserialize, Serialize};

/// Maps a measured global position of a cluster in `sector` to a corrected one.
pub trait PositionCorrection: Send + Sync {
    fn correct_point(&self, xyz: [f64; 3], sector: u16) -> [f64; 3];
}

/// Identity correction.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NoCorrection;

impl PositionCorrection for NoCorrection {
    fn correct_point(&self, xyz: [f64; 3], _sector: u16) -> [f64; 3] {
        xyz
    }
}

impl<F> PositionCorrection for F
where
    F: Fn([f64; 3], u16) -> [f64; 3] + Send + Sync,
{
    fn correct_point(&self, xyz: [f64; 3], sector: u16) -> [f64; 3] {
        self(xyz, sector)
    }
}

/// Radial space-charge distortion.
///
/// Drifting electrons are pulled inward by an amount that is largest at the
/// inner field cage (`r_inner`) and at the central electrode (z = 0), and
/// vanishes at the outer field cage and at the read-out plane:
///
/// Δr(r, z) = −A · u² · w,  u = (r_outer − r)/(r_outer − r_inner),
/// w = 1 − |z| / z_length   (both clamped to [0, 1])
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SpaceChargeDistortion {
    /// Maximum radial shift (cm)
    pub amplitude: f64,
    pub r_inner: f64,
    pub r_outer: f64,
    pub z_length: f64,
    /// Fixed-point iterations used when inverting the distortion
    pub iterations: u8,
}

impl Default for SpaceChargeDistortion {
    fn default() -> Self {
        Self {
            amplitude: 2.0,
            r_inner: 83.0,
            r_outer: 250.0,
            z_length: 250.0,
            iterations: 4,
        }
    }
}

impl SpaceChargeDistortion {
    /// Signed radial displacement of charge created at (r, z).
    pub fn radial_shift(&self, r: f64, z: f64) -> f64 {
        let span = self.r_outer - self.r_inner;
        if span <= 0.0 || self.z_length <= 0.0 {
            return 0.0;
        }
        let u = ((self.r_outer - r) / span).clamp(0.0, 1.0);
        let w = (1.0 - z.abs() / self.z_length).clamp(0.0, 1.0);
        -self.amplitude * u * u * w
    }

    /// Where charge created at `xyz` is measured.
    pub fn distort_point(&self, xyz: [f64; 3]) -> [f64; 3] {
        let r = xyz[0].hypot(xyz[1]);
        if r <= 0.0 {
            return xyz;
        }
        let scale = (r + self.radial_shift(r, xyz[2])) / r;
        [xyz[0] * scale, xyz[1] * scale, xyz[2]]
    }
}

impl PositionCorrection for SpaceChargeDistortion {
    /// Invert [`distort_point`](Self::distort_point) by fixed-point iteration
    /// on the radius: r ← r_measured − Δr(r, z).
    fn correct_point(&self, xyz: [f64; 3], _sector: u16) -> [f64; 3] {
        let r_meas = xyz[0].hypot(xyz[1]);
        if r_meas <= 0.0 {
            return xyz;
        }
        let mut r = r_meas;
        for _ in 0..self.iterations.max(1) {
            r = r_meas - self.radial_shift(r, xyz[2]);
        }
        let scale = r / r_meas;
        [xyz[0] * scale, xyz[1] * scale, xyz[2]]
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
