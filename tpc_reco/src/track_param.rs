//! Helix track parameters in a rotated local frame, with Kalman update.
//!
//! # State
//! p = [y, z, sin φ, tan λ, q/pT]ᵀ at local x, in the frame rotated by α
//! around the beam axis. φ is the azimuth of the momentum in that frame.
//!
//! # Field convention
//! Curvature κ = (q/pT) · Bz · [`B2C`], with Bz in kG and lengths in cm.
//! With a positive field a positive track bends clockwise.
//!
//! # Design choices
//! - Rotation and propagation transform vector and covariance together; a
//!   failed operation leaves the state untouched.
//! - The update uses the Joseph form, so the covariance
//!   stays symmetric positive-definite over long fits.

use crate::{
    error::TrackError,
    types::{MeasCov, MeasVec, ParamCov, ParamVec},
};
use nalgebra::{Matrix2x5, Matrix3, Vector3};
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;

/// Curvature per unit (q/pT · Bz), cm⁻¹ / (GeV⁻¹ · kG).
pub const B2C: f64 = -0.299_792_458e-3;

/// Upper bound on |sin φ| for a representable state.
pub const ALMOST_ONE: f64 = 1.0 - f32::EPSILON as f64;

const ALMOST_ZERO: f64 = f32::MIN_POSITIVE as f64;
const ALMOST_ZERO_FIELD: f64 = 1e-13;

/// Caps of the diagonal after [`TrackParam::reset_covariance`].
const COV_CAPS: [f64; 5] = [100.0, 100.0, 1.0, 1.0, 100.0];

/// Multiple-scattering constant (GeV).
const MS_SCALE: f64 = 0.0136;

/// Largest energy loss accepted in one material step, as a fraction of E.
const MAX_ENERGY_LOSS_FRACTION: f64 = 0.3;

/// Energy-loss straggling coefficient: σ(ΔE) = k · sqrt(ΔE).
const STRAGGLING: f64 = 0.07;

/// Map an angle into (−π, π].
pub fn normalize_angle(a: f64) -> f64 {
    let a = a.rem_euclid(2.0 * PI);
    if a > PI {
        a - 2.0 * PI
    } else {
        a
    }
}

/// Helix state with covariance.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct TrackParam {
    /// Local x of the reference plane (cm)
    pub x: f64,
    /// Frame angle (rad)
    pub alpha: f64,
    pub params: ParamVec,
    pub cov: ParamCov,
}

impl Default for TrackParam {
    fn default() -> Self {
        Self {
            x: 0.0,
            alpha: 0.0,
            params: ParamVec::zeros(),
            cov: ParamCov::zeros(),
        }
    }
}

impl TrackParam {
    pub fn new(x: f64, alpha: f64, params: ParamVec, cov: ParamCov) -> Self {
        Self {
            x,
            alpha: normalize_angle(alpha),
            params,
            cov,
        }
    }

    pub fn y(&self) -> f64 {
        self.params[0]
    }

    pub fn z(&self) -> f64 {
        self.params[1]
    }

    pub fn snp(&self) -> f64 {
        self.params[2]
    }

    pub fn tgl(&self) -> f64 {
        self.params[3]
    }

    pub fn q_pt(&self) -> f64 {
        self.params[4]
    }

    /// +1, −1, or 0 for a straight track.
    pub fn charge(&self) -> i8 {
        if self.params[4] > 0.0 {
            1
        } else if self.params[4] < 0.0 {
            -1
        } else {
            0
        }
    }

    /// Transverse momentum (GeV); infinite for a straight track.
    pub fn pt(&self) -> f64 {
        1.0 / self.params[4].abs()
    }

    /// Total momentum (GeV).
    pub fn p(&self) -> f64 {
        self.pt() * (1.0 + self.tgl() * self.tgl()).sqrt()
    }

    /// Signed curvature (cm⁻¹) in field `bz`.
    pub fn curvature(&self, bz: f64) -> f64 {
        if bz.abs() < ALMOST_ZERO_FIELD {
            0.0
        } else {
            self.params[4] * bz * B2C
        }
    }

    /// Momentum azimuth in the global frame.
    pub fn phi(&self) -> f64 {
        normalize_angle(self.snp().asin() + self.alpha)
    }

    /// Global position.
    pub fn global_position(&self) -> Vector3<f64> {
        let (sa, ca) = self.alpha.sin_cos();
        Vector3::new(
            self.x * ca - self.y() * sa,
            self.x * sa + self.y() * ca,
            self.z(),
        )
    }

    /// Unit momentum direction in the global frame.
    pub fn global_direction(&self) -> Vector3<f64> {
        let (sa, ca) = self.alpha.sin_cos();
        let sf = self.snp();
        let cf = ((1.0 - sf) * (1.0 + sf)).max(0.0).sqrt();
        let d = Vector3::new(cf * ca - sf * sa, cf * sa + sf * ca, self.tgl());
        d / d.norm()
    }

    /// Global covariance of the position (zero along local x).
    pub fn global_position_cov(&self) -> Matrix3<f64> {
        let (sa, ca) = self.alpha.sin_cos();
        let mut local = Matrix3::zeros();
        local[(1, 1)] = self.cov[(0, 0)];
        local[(1, 2)] = self.cov[(0, 1)];
        local[(2, 1)] = self.cov[(1, 0)];
        local[(2, 2)] = self.cov[(1, 1)];
        #[rustfmt::skip]
        let r = Matrix3::new(
            ca, -sa, 0.0,
            sa,  ca, 0.0,
            0.0, 0.0, 1.0,
        );
        r * local * r.transpose()
    }

    /// sin φ the track would have at local `x`.
    pub fn snp_at(&self, x: f64, bz: f64) -> f64 {
        self.snp() + self.curvature(bz) * (x - self.x)
    }

    /// Global position at local `x`, without modifying the track.
    pub fn xyz_at(&self, x: f64, bz: f64) -> Result<Vector3<f64>, TrackError> {
        let mut probe = *self;
        probe.propagate_to(x, bz)?;
        Ok(probe.global_position())
    }

    // -----------------------------------------------------------------------
    // Frame operations
    // -----------------------------------------------------------------------

    /// Re-express the state in the frame rotated by `alpha`.
    pub fn rotate(&mut self, alpha: f64) -> Result<(), TrackError> {
        let alpha = normalize_angle(alpha);
        let (sa, ca) = (alpha - self.alpha).sin_cos();
        let sf = self.snp();
        let cf = ((1.0 - sf) * (1.0 + sf)).sqrt();
        let snp = sf * ca - cf * sa;
        // the track must still move toward increasing x in the new frame
        if snp.abs() >= ALMOST_ONE || cf * ca + sf * sa < 0.0 {
            return Err(TrackError::SnpOutOfRange { snp });
        }
        let cf = cf.max(ALMOST_ZERO);

        let x = self.x * ca + self.y() * sa;
        let y = -self.x * sa + self.y() * ca;

        // Jacobian is diagonal: ∂y/∂y = cos Δα, ∂snp/∂snp = cos Δα + tan φ sin Δα
        let mut j = ParamCov::identity();
        j[(0, 0)] = ca;
        j[(2, 2)] = ca + sf / cf * sa;
        self.cov = j * self.cov * j.transpose();

        self.x = x;
        self.alpha = alpha;
        self.params[0] = y;
        self.params[2] = snp;
        Ok(())
    }

    /// Move the state along the helix to local `xk` in field `bz`.
    pub fn propagate_to(&mut self, xk: f64, bz: f64) -> Result<(), TrackError> {
        let dx = xk - self.x;
        if dx.abs() < ALMOST_ZERO {
            self.x = xk;
            return Ok(());
        }
        let crv = self.curvature(bz);
        let f1 = self.snp();
        let f2 = f1 + crv * dx;
        if f1.abs() >= ALMOST_ONE {
            return Err(TrackError::SnpOutOfRange { snp: f1 });
        }
        if f2.abs() >= ALMOST_ONE {
            return Err(TrackError::SnpOutOfRange { snp: f2 });
        }
        let r1 = ((1.0 - f1) * (1.0 + f1)).sqrt();
        let r2 = ((1.0 - f2) * (1.0 + f2)).sqrt();
        if r1 < ALMOST_ZERO || r2 < ALMOST_ZERO {
            return Err(TrackError::SnpOutOfRange { snp: f2 });
        }
        let dy2dx = (f1 + f2) / (r1 + r2);
        let tgl = self.tgl();
        let arc = transverse_arc(dx, dy2dx, crv, f1, r1, f2, r2);

        self.x = xk;
        self.params[0] += dx * dy2dx;
        self.params[1] += tgl * arc;
        self.params[2] = f2;

        let cc = if bz.abs() < ALMOST_ZERO_FIELD {
            0.0
        } else {
            bz * B2C
        };
        let r1_3 = r1 * r1 * r1;
        let mut f = ParamCov::identity();
        f[(0, 2)] = dx / r1_3;
        f[(0, 4)] = 0.5 * dx * dx / r1_3 * cc;
        f[(1, 2)] = dx * tgl * f1 / r1_3;
        f[(1, 3)] = dx / r1;
        f[(1, 4)] = 0.5 * dx * dx * tgl * f1 / r1_3 * cc;
        f[(2, 4)] = dx * cc;
        self.cov = symmetrize(f * self.cov * f.transpose());
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Measurement update
    // -----------------------------------------------------------------------

    fn projection() -> Matrix2x5<f64> {
        #[rustfmt::skip]
        let h = Matrix2x5::new(
            1.0, 0.0, 0.0, 0.0, 0.0,
            0.0, 1.0, 0.0, 0.0, 0.0,
        );
        h
    }

    fn innovation(&self, meas: &MeasVec, meas_cov: &MeasCov) -> Result<(MeasVec, MeasCov), TrackError> {
        let s = meas_cov + self.cov.fixed_view::<2, 2>(0, 0).into_owned();
        if s.determinant().abs() < ALMOST_ZERO {
            return Err(TrackError::SingularInnovation);
        }
        let s_inv = s.try_inverse().ok_or(TrackError::SingularInnovation)?;
        Ok((meas - MeasVec::new(self.y(), self.z()), s_inv))
    }

    /// χ² the measurement would add, without updating.
    pub fn predicted_chi2(&self, meas: &MeasVec, meas_cov: &MeasCov) -> Result<f64, TrackError> {
        let (nu, s_inv) = self.innovation(meas, meas_cov)?;
        Ok(nu.dot(&(s_inv * nu)))
    }

    /// Kalman update with a local (y, z) measurement. Returns the predicted χ².
    pub fn update(&mut self, meas: &MeasVec, meas_cov: &MeasCov) -> Result<f64, TrackError> {
        let (nu, s_inv) = self.innovation(meas, meas_cov)?;
        let h = Self::projection();
        let k = self.cov * h.transpose() * s_inv;

        let params = self.params + k * nu;
        if params[2].abs() >= ALMOST_ONE {
            return Err(TrackError::SnpOutOfRange { snp: params[2] });
        }

        // Joseph form: P' = (I − KH)·P·(I − KH)ᵀ + K·R·Kᵀ
        let i_kh = ParamCov::identity() - k * h;
        let cov = i_kh * self.cov * i_kh.transpose() + k * meas_cov * k.transpose();

        self.params = params;
        self.cov = symmetrize(cov);
        Ok(nu.dot(&(s_inv * nu)))
    }

    /// Replace the covariance by its diagonal scaled by `s2`, capped per
    /// parameter. Non-finite entries take the cap.
    pub fn reset_covariance(&mut self, s2: f64) {
        let s2 = s2.abs();
        let mut cov = ParamCov::zeros();
        for (i, cap) in COV_CAPS.iter().enumerate() {
            let v = (self.cov[(i, i)] * s2).abs();
            cov[(i, i)] = if v.is_finite() { v.min(*cap) } else { *cap };
        }
        self.cov = cov;
    }

    // -----------------------------------------------------------------------
    // Material
    // -----------------------------------------------------------------------

    /// Apply multiple scattering and mean energy loss.
    ///
    /// `x_times_rho > 0` removes energy (moving with the particle), negative
    /// adds it back. `dedx(βγ)` gives the mean loss in GeV·cm²/g.
    pub fn correct_for_material<F>(
        &mut self,
        x_over_x0: f64,
        x_times_rho: f64,
        mass: f64,
        dedx: F,
    ) -> Result<(), TrackError>
    where
        F: Fn(f64) -> f64,
    {
        let p4 = self.q_pt();
        if p4.abs() < ALMOST_ZERO {
            return Ok(());
        }
        let snp = self.snp();
        let tgl = self.tgl();
        let t = 1.0 + tgl * tgl;
        let p2 = t / (p4 * p4);
        let beta2 = p2 / (p2 + mass * mass);

        let mut cov = self.cov;
        if x_over_x0 != 0.0 {
            let theta2 = MS_SCALE * MS_SCALE / (beta2 * p2) * x_over_x0.abs();
            if theta2 > PI * PI {
                return Err(TrackError::MaterialTooThick);
            }
            cov[(2, 2)] += theta2 * (1.0 - snp) * (1.0 + snp) * t;
            cov[(3, 3)] += theta2 * t * t;
            cov[(4, 3)] += theta2 * tgl * p4 * t;
            cov[(3, 4)] += theta2 * tgl * p4 * t;
            cov[(4, 4)] += theta2 * tgl * tgl * p4 * p4;
        }

        let mut params = self.params;
        if x_times_rho != 0.0 {
            let e = (p2 + mass * mass).sqrt();
            let de = dedx(p2.sqrt() / mass) * x_times_rho;
            if de.abs() > MAX_ENERGY_LOSS_FRACTION * e {
                return Err(TrackError::MaterialTooThick);
            }
            // p' / p to first order in ΔE
            let scale = 1.0 - e / p2 * de;
            if scale <= 0.0 {
                return Err(TrackError::MaterialTooThick);
            }
            params[4] /= scale;
            let sigma_de = STRAGGLING * de.abs().sqrt();
            cov[(4, 4)] += (sigma_de * e / p2 * params[4]).powi(2);
        }

        self.params = params;
        self.cov = cov;
        Ok(())
    }
}

/// Signed transverse path length between two points of a helix step.
fn transverse_arc(dx: f64, dy2dx: f64, crv: f64, f1: f64, r1: f64, f2: f64, r2: f64) -> f64 {
    let chord = dx * (1.0 + dy2dx * dy2dx).sqrt();
    let turn = crv * chord;
    if turn.abs() < 0.05 {
        chord * (1.0 + turn * turn / 24.0)
    } else {
        let mut rot = (r1 * f2 - r2 * f1).clamp(-1.0, 1.0).asin();
        if f1 * f1 + f2 * f2 > 1.0 && f1 * f2 < 0.0 {
            rot = if f2 > 0.0 { PI - rot } else { -PI - rot };
        }
        rot / crv
    }
}

fn symmetrize(m: ParamCov) -> ParamCov {
    (m + m.transpose()) * 0.5
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
