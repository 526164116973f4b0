//! Resolution metrics: residuals and pulls of fitted vs generated tracks,
//! time-zero and vertex residuals, failure counters.

use crate::{
    pipeline::{EventOutput, TrackReco},
    track_param::normalize_angle,
    types::{Event, TrackCandidate},
};
use serde::{Deserialize, Serialize};
use tpc_detector::DetectorGeometry;

/// Names of the five track parameters, in state order.
pub const PARAM_NAMES: [&str; 5] = ["y", "z", "snp", "tgl", "q/pt"];

/// Running sums of one quantity.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Moments {
    pub n: u64,
    pub sum: f64,
    pub sum_sq: f64,
}

impl Moments {
    pub fn push(&mut self, value: f64) {
        if !value.is_finite() {
            return;
        }
        self.n += 1;
        self.sum += value;
        self.sum_sq += value * value;
    }

    pub fn mean(&self) -> f64 {
        if self.n == 0 {
            return 0.0;
        }
        self.sum / self.n as f64
    }

    /// Root mean square about zero.
    pub fn rms(&self) -> f64 {
        if self.n == 0 {
            return 0.0;
        }
        (self.sum_sq / self.n as f64).sqrt()
    }
}

/// Accumulated reconstruction statistics.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ResolutionMetrics {
    pub n_events: u64,
    pub n_candidates: u64,
    /// Candidates without a seed
    pub seed_failures: u64,
    /// Fits that ended before the last cluster
    pub incomplete_fits: u64,
    /// Fits that did not reach the reference surface
    pub reference_misses: u64,
    /// Fitted minus true, per track parameter
    pub residuals: [Moments; 5],
    /// Residual over the fitted σ, per track parameter
    pub pulls: [Moments; 5],
    /// Estimated minus expected time-zero (µs). The drift time fixes only
    /// t0 − s·vz/v_drift (s the side sign), so that is the expectation.
    pub time0_residual: Moments,
    /// Vertices found
    pub n_vertices: u64,
    /// Fitted minus true vertex position (cm), per axis
    pub vertex_residuals: [Moments; 3],
}

impl ResolutionMetrics {
    /// Accumulate one reconstructed event against its generated truth.
    pub fn accumulate(&mut self, event: &Event, output: &EventOutput, geometry: &dyn DetectorGeometry) {
        self.n_events += 1;
        for reco in &output.tracks {
            let Some(candidate) = event.tracks.get(reco.candidate) else {
                continue;
            };
            self.accumulate_track(event, candidate, reco, geometry);
        }

        if let Some(vertex) = output.vertex.as_ref().filter(|v| v.is_valid()) {
            self.n_vertices += 1;
            for (axis, moments) in self.vertex_residuals.iter_mut().enumerate() {
                moments.push(vertex.position[axis] - event.vertex[axis]);
            }
        }
    }

    fn accumulate_track(
        &mut self,
        event: &Event,
        candidate: &TrackCandidate,
        reco: &TrackReco,
        geometry: &dyn DetectorGeometry,
    ) {
        self.n_candidates += 1;
        let side = candidate
            .clusters
            .first()
            .and_then(|cl| geometry.sector(cl.sector).ok())
            .map(|sector| sector.side.sign());
        if let (Some(time0), Some(sign)) = (reco.time0, side) {
            let expected = event.t0 - sign * event.vertex[2] / geometry.drift_velocity();
            self.time0_residual.push(time0 - expected);
        }
        if reco.seed.is_none() {
            self.seed_failures += 1;
            return;
        }
        let Some(fit) = &reco.fit else {
            return;
        };
        if !fit.is_complete() {
            self.incomplete_fits += 1;
        }
        if !fit.reached_reference {
            self.reference_misses += 1;
            return;
        }

        let truth = &candidate.truth;
        let track = &fit.track;
        if normalize_angle(track.alpha - truth.alpha).abs() > 1e-6 {
            return;
        }
        for i in 0..5 {
            let residual = track.params[i] - truth.params[i];
            self.residuals[i].push(residual);
            let sigma = track.cov[(i, i)].sqrt();
            if sigma > 0.0 {
                self.pulls[i].push(residual / sigma);
            }
        }
    }

    /// Per-parameter residual RMS, in [`PARAM_NAMES`] order.
    pub fn residual_rms(&self) -> [f64; 5] {
        self.residuals.map(|m| m.rms())
    }

    /// Per-parameter pull RMS; close to 1 for a consistent fit.
    pub fn pull_rms(&self) -> [f64; 5] {
        self.pulls.map(|m| m.rms())
    }

    pub fn seed_efficiency(&self) -> f64 {
        if self.n_candidates == 0 {
            return 1.0;
        }
        1.0 - self.seed_failures as f64 / self.n_candidates as f64
    }

    /// Fold statistics of another run into this one.
    pub fn merge(&mut self, other: &ResolutionMetrics) {
        fn add(a: &mut Moments, b: &Moments) {
            a.n += b.n;
            a.sum += b.sum;
            a.sum_sq += b.sum_sq;
        }
        self.n_events += other.n_events;
        self.n_candidates += other.n_candidates;
        self.seed_failures += other.seed_failures;
        self.incomplete_fits += other.incomplete_fits;
        self.reference_misses += other.reference_misses;
        self.n_vertices += other.n_vertices;
        for (a, b) in self.residuals.iter_mut().zip(&other.residuals) {
            add(a, b);
        }
        for (a, b) in self.pulls.iter_mut().zip(&other.pulls) {
            add(a, b);
        }
        for (a, b) in self.vertex_residuals.iter_mut().zip(&other.vertex_residuals) {
            add(a, b);
        }
        add(&mut self.time0_residual, &other.time0_residual);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        fitter::{FitResult, FitTermination},
        track_param::TrackParam,
        types::{Cluster, ParamCov, ParamVec},
        vertex::Vertex,
    };
    use approx::assert_abs_diff_eq;
    use nalgebra::{Matrix3, Vector3};
    use tpc_detector::TpcGeometry;

    fn truth() -> TrackParam {
        TrackParam::new(0.0, 0.3, ParamVec::new(0.0, 1.0, 0.1, 0.2, 0.5), ParamCov::identity())
    }

    fn event() -> Event {
        Event {
            id: 1,
            vertex: [0.0, 0.0, 1.0],
            t0: 2.0,
            tracks: vec![
                TrackCandidate {
                    truth: truth(),
                    clusters: vec![cluster()],
                    distorted_clusters: Vec::new(),
                },
                TrackCandidate {
                    truth: truth(),
                    clusters: Vec::new(),
                    distorted_clusters: Vec::new(),
                },
            ],
        }
    }

    fn cluster() -> Cluster {
        Cluster {
            sector: 0,
            row: 0,
            x: 85.0,
            y: 0.0,
            z: 20.0,
            time_bin: 0.0,
            sigma_y2: 0.01,
            sigma_z2: 0.01,
        }
    }

    fn fitted(offset_y: f64) -> TrackReco {
        let mut track = truth();
        track.params[0] += offset_y;
        track.cov = ParamCov::identity() * 0.25;
        TrackReco {
            candidate: 0,
            time0: Some(2.1),
            seed: Some(truth()),
            fit: Some(FitResult {
                track,
                n_updates: 10,
                n_skipped: 0,
                chi2: 5.0,
                termination: FitTermination::Exhausted,
                reached_reference: true,
            }),
            ..TrackReco::default()
        }
    }

    #[test]
    fn moments_rms_and_mean() {
        let mut m = Moments::default();
        for v in [3.0, -4.0, f64::NAN] {
            m.push(v);
        }
        assert_eq!(m.n, 2);
        assert_abs_diff_eq!(m.mean(), -0.5);
        assert_abs_diff_eq!(m.rms(), 12.5f64.sqrt());
        assert_eq!(Moments::default().rms(), 0.0);
    }

    #[test]
    fn residuals_pulls_and_failures() {
        let ev = event();
        let unseeded = TrackReco {
            candidate: 1,
            failure: Some("insufficient seed points".into()),
            ..TrackReco::default()
        };
        let output = EventOutput {
            event_id: 1,
            tracks: vec![fitted(0.5), unseeded],
            vertex: Some(Vertex::from_estimate(
                Vector3::new(0.1, 0.0, 0.8),
                Matrix3::identity(),
                1.0,
                2,
            )),
            vertex_candidates: vec![0],
            vertex_contributors: vec![true],
            timing_tracks_us: 0,
            timing_vertex_us: 0,
            total_time_us: 0,
        };

        let geo = TpcGeometry::default();
        let mut metrics = ResolutionMetrics::default();
        metrics.accumulate(&ev, &output, &geo);

        assert_eq!(metrics.n_candidates, 2);
        assert_eq!(metrics.seed_failures, 1);
        assert_abs_diff_eq!(metrics.seed_efficiency(), 0.5);
        assert_abs_diff_eq!(metrics.residual_rms()[0], 0.5);
        assert_abs_diff_eq!(metrics.pull_rms()[0], 1.0);
        assert_abs_diff_eq!(metrics.residual_rms()[4], 0.0);
        // sector 0 is on the positive side: expected 2 - 1/v_drift
        let expected = 2.0 - 1.0 / geo.drift_velocity();
        assert_abs_diff_eq!(metrics.time0_residual.mean(), 2.1 - expected, epsilon = 1e-12);
        assert_eq!(metrics.time0_residual.n, 1);
        assert_eq!(metrics.n_vertices, 1);
        assert_abs_diff_eq!(metrics.vertex_residuals[2].mean(), -0.2, epsilon = 1e-12);

        let mut total = ResolutionMetrics::default();
        total.merge(&metrics);
        total.merge(&metrics);
        assert_eq!(total.n_candidates, 4);
        assert_abs_diff_eq!(total.residual_rms()[0], 0.5);
    }
}
