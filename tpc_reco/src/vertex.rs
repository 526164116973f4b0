//! Primary-vertex fit with iterative outlier rejection.
//!
//! # Track model
//! Close to the vertex every track is a straight line: point r, unit
//! direction u, 3×3 position covariance V. Only the two coordinates
//! transverse to u carry information about the vertex. With B the 2×3 basis
//! of that plane:
//!
//! W = Bᵀ (B V Bᵀ)⁻¹ B
//!
//! # Fit
//! v = (Λ₀ + Σ Wᵢ)⁻¹ (Λ₀ v₀ + Σ Wᵢ rᵢ),   C = (Λ₀ + Σ Wᵢ)⁻¹
//!
//! Λ₀, v₀ are a weak prior at the origin, or the beam spot when a beam
//! constraint is set. χ² = Σ (v − rᵢ)ᵀ Wᵢ (v − rᵢ) (+ beam term).
//! ndf = 2n − 3, or 2n with the beam constraint.
//!
//! # Outlier rejection
//! See [`Vertex::construct_primary_vertex`]. Removing a track subtracts its
//! information, so χ², ndf and position always describe the same set.

use crate::{error::VertexError, track_param::TrackParam};
use nalgebra::{Matrix2x3, Matrix3, Vector3};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// ndf of a vertex without valid contributors.
pub const INVALID_NDF: i32 = -3;

/// Outlier-rejection parameters.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VertexFitConfig {
    /// Rejection stops at this many tracks
    pub min_tracks: usize,
    /// Deviation (in σ) above which the worst track is removed
    pub chi_cut: f64,
    /// Width of the uninformative prior (cm)
    pub prior_sigma: f64,
}

impl Default for VertexFitConfig {
    fn default() -> Self {
        Self {
            min_tracks: 2,
            chi_cut: 3.5,
            prior_sigma: 1000.0,
        }
    }
}

/// Straight-line track contribution.
#[derive(Clone, Debug, PartialEq)]
pub struct VertexTrack {
    pub point: Vector3<f64>,
    /// Unit direction
    pub direction: Vector3<f64>,
    pub cov: Matrix3<f64>,
    basis: Matrix2x3<f64>,
    weight: Matrix3<f64>,
}

impl VertexTrack {
    pub fn new(point: Vector3<f64>, direction: Vector3<f64>, cov: Matrix3<f64>) -> Result<Self, VertexError> {
        let norm = direction.norm();
        if !(norm > f64::EPSILON) || !norm.is_finite() {
            return Err(VertexError::ZeroDirection);
        }
        if !point.iter().chain(cov.iter()).all(|v| v.is_finite()) {
            return Err(VertexError::NonFinite);
        }
        let u = direction / norm;
        let helper = if u.x.abs() < 0.9 { Vector3::x() } else { Vector3::y() };
        let e1 = u.cross(&helper).normalize();
        let e2 = u.cross(&e1);
        let basis = Matrix2x3::from_rows(&[e1.transpose(), e2.transpose()]);
        let projected = basis * cov * basis.transpose();
        let inv = projected
            .try_inverse()
            .filter(|m| m.iter().all(|v| v.is_finite()))
            .ok_or(VertexError::SingularTrackCovariance)?;
        Ok(Self {
            point,
            direction: u,
            cov,
            basis,
            weight: basis.transpose() * inv * basis,
        })
    }

    /// Straight-line approximation of a helix at its reference point.
    pub fn from_track_param(track: &TrackParam) -> Result<Self, VertexError> {
        Self::new(
            track.global_position(),
            track.global_direction(),
            track.global_position_cov(),
        )
    }

    /// (v − r)ᵀ W (v − r)
    pub fn chi2_to(&self, v: &Vector3<f64>) -> f64 {
        let d = v - self.point;
        d.dot(&(self.weight * d))
    }

    /// Transverse distance to `position` in units of the combined error,
    /// √(χ²/2) of the 2-D residual with covariance B(V + C)Bᵀ.
    pub fn deviation(&self, position: &Vector3<f64>, cov: &Matrix3<f64>) -> f64 {
        let d = self.basis * (position - self.point);
        let s = self.basis * (self.cov + cov) * self.basis.transpose();
        let Some(s_inv) = s.try_inverse() else {
            return f64::INFINITY;
        };
        let q = d.dot(&(s_inv * d)) / 2.0;
        if q.is_nan() {
            f64::INFINITY
        } else {
            q.max(0.0).sqrt()
        }
    }
}

/// Beam-spot pseudo-measurement.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct BeamConstraint {
    pub position: Vector3<f64>,
    pub sigma: Vector3<f64>,
}

impl BeamConstraint {
    fn information(&self) -> Matrix3<f64> {
        Matrix3::from_diagonal(&self.sigma.map(|s| 1.0 / (s * s).max(f64::MIN_POSITIVE)))
    }

    fn chi2(&self, v: &Vector3<f64>) -> f64 {
        let d = v - self.position;
        d.dot(&(self.information() * d))
    }
}

/// Accumulated information (Λ, Λ·v).
#[derive(Clone, Copy, Debug, Default, PartialEq)]
struct Information {
    matrix: Matrix3<f64>,
    vector: Vector3<f64>,
}

impl Information {
    fn add(&mut self, t: &VertexTrack) {
        self.matrix += t.weight;
        self.vector += t.weight * t.point;
    }

    fn subtract(&mut self, t: &VertexTrack) {
        self.matrix -= t.weight;
        self.vector -= t.weight * t.point;
    }

    fn solve(&self) -> Option<(Vector3<f64>, Matrix3<f64>)> {
        let cov = self.matrix.try_inverse()?;
        Some((cov * self.vector, cov))
    }
}

/// Fitted vertex.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Vertex {
    pub position: Vector3<f64>,
    pub cov: Matrix3<f64>,
    pub chi2: f64,
    pub ndf: i32,
    pub n_contributors: usize,
    beam: Option<BeamConstraint>,
    #[serde(skip)]
    info: Information,
}

impl Default for Vertex {
    fn default() -> Self {
        Self {
            position: Vector3::zeros(),
            cov: Matrix3::identity() * 100.0,
            chi2: 0.0,
            ndf: INVALID_NDF,
            n_contributors: 0,
            beam: None,
            info: Information::default(),
        }
    }
}

impl Vertex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Vertex from an external estimate.
    pub fn from_estimate(position: Vector3<f64>, cov: Matrix3<f64>, chi2: f64, n_contributors: usize) -> Self {
        Self {
            position,
            cov,
            chi2,
            ndf: 2 * n_contributors as i32 - 3,
            n_contributors,
            beam: None,
            info: Information::default(),
        }
    }

    /// Use the beam spot as an additional measurement of all three coordinates.
    pub fn set_beam_constraint(&mut self, x: f64, y: f64, z: f64, sigma_x: f64, sigma_y: f64, sigma_z: f64) {
        let beam = BeamConstraint {
            position: Vector3::new(x, y, z),
            sigma: Vector3::new(sigma_x, sigma_y, sigma_z),
        };
        self.position = beam.position;
        self.cov = Matrix3::from_diagonal(&beam.sigma.map(|s| s * s));
        self.beam = Some(beam);
    }

    pub fn set_beam_constraint_off(&mut self) {
        self.beam = None;
    }

    pub fn beam_constraint(&self) -> Option<&BeamConstraint> {
        self.beam.as_ref()
    }

    pub fn is_valid(&self) -> bool {
        self.ndf >= 0
    }

    fn ndf_for(&self, n: usize) -> i32 {
        let measured = 2 * n as i32;
        if self.beam.is_some() {
            measured
        } else {
            measured - 3
        }
    }

    fn prior(&self, config: &VertexFitConfig) -> Information {
        match &self.beam {
            Some(beam) => {
                let matrix = beam.information();
                Information {
                    matrix,
                    vector: matrix * beam.position,
                }
            }
            None => Information {
                matrix: Matrix3::identity() / (config.prior_sigma * config.prior_sigma),
                vector: Vector3::zeros(),
            },
        }
    }

    /// Solve for the accumulated information and refresh χ² and ndf for the
    /// active tracks.
    fn refresh(&mut self, tracks: &[VertexTrack], active: &[bool]) {
        match self.info.solve() {
            Some((position, cov)) => {
                self.position = position;
                self.cov = cov;
            }
            None => warn!("vertex information matrix is singular"),
        }
        let n = active.iter().filter(|a| **a).count();
        let track_chi2: f64 = tracks
            .iter()
            .zip(active)
            .filter(|(_, a)| **a)
            .map(|(t, _)| t.chi2_to(&self.position))
            .sum();
        self.chi2 = track_chi2 + self.beam.map_or(0.0, |b| b.chi2(&self.position));
        self.ndf = self.ndf_for(n);
        self.n_contributors = n;
    }

    /// Fit from all `tracks`.
    pub fn construct(&mut self, tracks: &[VertexTrack], config: &VertexFitConfig) {
        self.info = self.prior(config);
        for t in tracks {
            self.info.add(t);
        }
        let active = vec![true; tracks.len()];
        self.refresh(tracks, &active);
    }

    /// Deactivate track `i` and update the fit.
    fn remove(&mut self, tracks: &[VertexTrack], active: &mut [bool], i: usize) {
        if !active[i] {
            return;
        }
        active[i] = false;
        self.info.subtract(&tracks[i]);
        self.refresh(tracks, active);
    }

    /// Position and covariance without track `t`.
    fn without(&self, t: &VertexTrack) -> Option<(Vector3<f64>, Matrix3<f64>)> {
        let mut info = self.info;
        info.subtract(t);
        info.solve()
    }

    /// Active track deviating most from the vertex of all other active
    /// tracks. Ties keep the first such track.
    pub fn worst_contributor(&self, tracks: &[VertexTrack], active: &[bool]) -> Option<(usize, f64)> {
        let mut worst: Option<(usize, f64)> = None;
        for (i, t) in tracks.iter().enumerate() {
            if !active.get(i).copied().unwrap_or(false) {
                continue;
            }
            let chi = match self.without(t) {
                Some((position, cov)) => t.deviation(&position, &cov),
                None => f64::INFINITY,
            };
            // strict comparison: the first of equal deviations wins
            if worst.map_or(true, |(_, w)| w < chi) {
                worst = Some((i, chi));
            }
        }
        worst
    }

    /// Fit with iterative removal of the worst track.
    ///
    /// Returns `None` (and leaves the vertex untouched) with fewer than
    /// `min_tracks` tracks (never fewer than 2), otherwise the contributor
    /// flags. While more than `min_tracks` tracks are active, the track deviating most from the
    /// vertex of the others is removed if its deviation reaches `chi_cut`.
    /// A vertex left with `min_tracks` or fewer tracks and χ² > chi_cut²·ndf
    /// is invalidated: all flags false, ndf = −3, χ² = 0.
    pub fn construct_primary_vertex(&mut self, tracks: &[VertexTrack], config: &VertexFitConfig) -> Option<Vec<bool>> {
        let min_tracks = config.min_tracks.max(2);
        if tracks.len() < min_tracks {
            return None;
        }
        self.construct(tracks, config);
        let mut active = vec![true; tracks.len()];
        let mut n_rest = tracks.len();

        while n_rest > min_tracks {
            let Some((worst, chi)) = self.worst_contributor(tracks, &active) else {
                break;
            };
            if chi < config.chi_cut {
                break;
            }
            debug!(track = worst, deviation = chi, "removing vertex outlier");
            self.remove(tracks, &mut active, worst);
            n_rest -= 1;
        }

        let cut = config.chi_cut * config.chi_cut * f64::from(self.ndf);
        if n_rest <= min_tracks && self.chi2 > cut {
            debug!(chi2 = self.chi2, ndf = self.ndf, "vertex fit rejected");
            active.iter_mut().for_each(|a| *a = false);
            self.ndf = INVALID_NDF;
            self.chi2 = 0.0;
            self.n_contributors = 0;
        }
        Some(active)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
