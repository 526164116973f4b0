//! Stepped propagation of track parameters through the drift volume.
//!
//! # Design choices
//! - [`Propagator`] is the injection seam: the seeder and the fitter only see
//!   the trait, so a field map or a detailed material model can be swapped in.
//! - [`HelixPropagator`] assumes a uniform solenoidal field and a homogeneous
//!   gas ([`MaterialBudget`]).
//! - A failed step leaves the track where the last successful step put it.

use crate::{error::TrackError, track_param::TrackParam};
use serde::{Deserialize, Serialize};

/// Charged pion mass (GeV), the default mass hypothesis.
pub const PION_MASS: f64 = 0.139_57;

/// Per-call propagation settings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PropagationOptions {
    /// Mass hypothesis (GeV)
    pub mass: f64,
    /// Largest step in x (cm)
    pub max_step: f64,
    /// Re-align the frame with the track position after each step
    pub rotate_to_local: bool,
    /// Largest |sin φ| tolerated along the way
    pub max_snp: f64,
    /// Apply multiple scattering and energy loss
    pub use_material: bool,
}

impl Default for PropagationOptions {
    fn default() -> Self {
        Self {
            mass: PION_MASS,
            max_step: 5.0,
            rotate_to_local: false,
            max_snp: 0.85,
            use_material: false,
        }
    }
}

impl PropagationOptions {
    pub fn with_step(mut self, max_step: f64) -> Self {
        self.max_step = max_step;
        self
    }

    pub fn with_rotation(mut self, rotate_to_local: bool) -> Self {
        self.rotate_to_local = rotate_to_local;
        self
    }

    pub fn with_material(mut self, use_material: bool) -> Self {
        self.use_material = use_material;
        self
    }
}

/// Moves a track to a target local x.
pub trait Propagator: Send + Sync {
    /// Solenoid field (kG).
    fn bz(&self) -> f64;

    fn propagate_to(
        &self,
        track: &mut TrackParam,
        x: f64,
        options: &PropagationOptions,
    ) -> Result<(), TrackError>;
}

/// Homogeneous gas traversed by the tracks.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MaterialBudget {
    /// Radiation length (cm)
    pub radiation_length: f64,
    /// Density (g/cm³)
    pub density: f64,
    /// Mean ⟨Z/A⟩
    pub z_over_a: f64,
    /// Mean excitation energy (GeV)
    pub mean_excitation: f64,
}

impl Default for MaterialBudget {
    /// Ne-CO₂ drift gas.
    fn default() -> Self {
        Self {
            radiation_length: 2.8e4,
            density: 1.8e-3,
            z_over_a: 0.49,
            mean_excitation: 1.37e-7,
        }
    }
}

impl MaterialBudget {
    /// Mean energy loss (GeV·cm²/g) at βγ, Bethe–Bloch without density term.
    pub fn bethe_bloch(&self, bg: f64) -> f64 {
        const K: f64 = 0.307_075e-3;
        const ELECTRON_MASS: f64 = 0.511e-3;
        if bg <= 0.0 {
            return 0.0;
        }
        let bg2 = bg * bg;
        let beta2 = bg2 / (1.0 + bg2);
        let t_max = 2.0 * ELECTRON_MASS * bg2;
        let arg = 2.0 * ELECTRON_MASS * bg2 * t_max / (self.mean_excitation * self.mean_excitation);
        (K * self.z_over_a / beta2 * (0.5 * arg.ln() - beta2)).max(0.0)
    }

    /// (x/X₀, x·ρ) of a straight path of `length` cm.
    pub fn for_path(&self, length: f64) -> (f64, f64) {
        (length / self.radiation_length, length * self.density)
    }
}

/// Uniform-field helix propagator.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HelixPropagator {
    /// Field (kG)
    pub bz: f64,
    pub material: MaterialBudget,
    /// Safety bound on the number of steps of one call
    pub max_iterations: usize,
}

impl Default for HelixPropagator {
    fn default() -> Self {
        Self::new(5.0, MaterialBudget::default())
    }
}

impl HelixPropagator {
    pub fn new(bz: f64, material: MaterialBudget) -> Self {
        Self {
            bz,
            material,
            max_iterations: 10_000,
        }
    }
}

impl Propagator for HelixPropagator {
    fn bz(&self) -> f64 {
        self.bz
    }

    fn propagate_to(
        &self,
        track: &mut TrackParam,
        x_to_go: f64,
        options: &PropagationOptions,
    ) -> Result<(), TrackError> {
        const EPS: f64 = 1e-5;

        let max_step = options.max_step.abs().max(EPS);
        let mut x_pos = track.x;
        let dir = if x_pos < x_to_go { 1.0 } else { -1.0 };
        let mut steps = 0usize;

        while (x_to_go - x_pos) * dir > EPS {
            steps += 1;
            if steps > self.max_iterations {
                return Err(TrackError::NotConverged(self.max_iterations));
            }

            let step = dir * (x_to_go - x_pos).abs().min(max_step);
            let x = x_pos + step;
            let snp = track.snp_at(x, self.bz);
            if snp.abs() >= options.max_snp {
                return Err(TrackError::SnpLimit {
                    snp,
                    limit: options.max_snp,
                });
            }

            let before = track.global_position();
            track.propagate_to(x, self.bz)?;

            if options.use_material {
                let path = (track.global_position() - before).norm();
                let (x_over_x0, x_times_rho) = self.material.for_path(path);
                // moving against x undoes the loss
                let x_times_rho = if dir > 0.0 { x_times_rho } else { -x_times_rho };
                track.correct_for_material(x_over_x0, x_times_rho, options.mass, |bg| {
                    self.material.bethe_bloch(bg)
                })?;
            }

            if options.rotate_to_local {
                let pos = track.global_position();
                let alpha = pos.y.atan2(pos.x);
                let (sa, ca) = (alpha - track.alpha).sin_cos();
                let sf = track.snp();
                let cf = ((1.0 - sf) * (1.0 + sf)).sqrt();
                let snp = sf * ca - cf * sa;
                if snp.abs() >= options.max_snp {
                    return Err(TrackError::SnpLimit {
                        snp,
                        limit: options.max_snp,
                    });
                }
                track.rotate(alpha)?;
            }

            x_pos = track.x;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ParamCov, ParamVec};
    use approx::assert_abs_diff_eq;

    fn outgoing(q_pt: f64) -> TrackParam {
        TrackParam::new(
            85.0,
            0.2,
            ParamVec::new(0.5, 10.0, 0.05, 0.3, q_pt),
            ParamCov::identity() * 0.01,
        )
    }

    #[test]
    fn stepped_equals_single_step_without_material() {
        let prop = HelixPropagator::default();
        let mut stepped = outgoing(0.7);
        prop.propagate_to(&mut stepped, 240.0, &PropagationOptions::default())
            .unwrap();
        let mut direct = outgoing(0.7);
        direct.propagate_to(240.0, prop.bz()).unwrap();
        assert_abs_diff_eq!(stepped.x, 240.0, epsilon = 1e-9);
        for i in 0..5 {
            assert_abs_diff_eq!(stepped.params[i], direct.params[i], epsilon = 1e-7);
        }
    }

    #[test]
    fn snp_limit_stops_low_momentum_track() {
        let prop = HelixPropagator::default();
        let mut t = outgoing(8.0);
        let err = prop
            .propagate_to(&mut t, 240.0, &PropagationOptions::default())
            .unwrap_err();
        assert!(matches!(err, TrackError::SnpLimit { .. }));
        // partially propagated, still representable
        assert!(t.x > 85.0 && t.x < 240.0);
        assert!(t.snp().abs() < 0.85);
    }

    #[test]
    fn rotating_to_local_keeps_track_on_the_x_axis() {
        let prop = HelixPropagator::default();
        let mut t = outgoing(0.5);
        let opts = PropagationOptions::default().with_rotation(true);
        prop.propagate_to(&mut t, 20.0, &opts).unwrap();
        // every step ends in a frame aligned with the position
        assert_abs_diff_eq!(t.x, 20.0, epsilon = 1e-4);
        assert_abs_diff_eq!(t.y(), 0.0, epsilon = 1e-9);
    }

    #[test]
    fn material_inflates_covariance() {
        let prop = HelixPropagator::default();
        let opts = PropagationOptions::default().with_material(true);
        let mut with = outgoing(1.0);
        prop.propagate_to(&mut with, 200.0, &opts).unwrap();
        let mut without = outgoing(1.0);
        prop.propagate_to(&mut without, 200.0, &PropagationOptions::default())
            .unwrap();
        assert!(with.cov[(2, 2)] > without.cov[(2, 2)]);
        assert!(with.q_pt().abs() > without.q_pt().abs());
    }

    #[test]
    fn bethe_bloch_has_minimum_near_bg_three() {
        let m = MaterialBudget::default();
        let low = m.bethe_bloch(0.5);
        let min = m.bethe_bloch(3.5);
        let high = m.bethe_bloch(1000.0);
        assert!(low > min);
        assert!(high > min);
        assert!(min > 1.0e-3 && min < 3.0e-3);
    }
}
