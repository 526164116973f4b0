//! Sequential Kalman fit of a seed through its clusters.
//!
//! # Per-cluster step
//! 1. rotate the track into the cluster's sector frame
//! 2. convert the cluster to a space point (time-zero, correction) and rotate
//!    it with its covariance into the same frame
//! 3. skip points outside the sensitive radial envelope
//! 4. propagate to the point's local x
//! 5. stop when the propagation fails or the track leaves the |z| / |x| envelope
//! 6. update with the local (y, z) measurement; a failed update stops the fit
//!
//! After the last cluster the track is moved to the reference surface:
//! coarse steps re-aligning the frame with the position, a rotation into the
//! reference frame, then fine steps to the reference x.
//!
//! A stopped fit is not an error: [`FitResult`] carries the partial state and
//! the reason in [`FitTermination`].

use crate::{
    cluster_index::{ClusterIndex, RowBin},
    error::RecoError,
    propagation::{PropagationOptions, PION_MASS},
    track_param::TrackParam,
    types::{Cluster, CorrectionMode, MeasCov, MeasVec, PointConversion, Providers, ReferenceSurface, TrackPoint},
};
use serde::{Deserialize, Serialize};
use tpc_detector::{Sector, Side};
use tracing::debug;

/// χ²(0.99, 2): gate for 2-D cluster candidates when following through the index.
pub const CHI2_99_2D: f64 = 9.21;

/// Order in which the clusters of a candidate are visited.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum FitDirection {
    /// From the last (outermost) cluster toward the first
    #[default]
    Inward,
    Outward,
}

/// Fit parameters.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FitConfig {
    pub direction: FitDirection,
    pub use_material: bool,
    /// Mass hypothesis (GeV)
    pub mass: f64,
    pub max_snp: f64,
    /// Step between clusters (cm)
    pub max_step: f64,
    /// Fit stops when |x| exceeds this (cm)
    pub max_x: f64,
    /// Fit stops when |z| exceeds this (cm)
    pub max_z: f64,
    /// Step toward the reference before the final rotation (cm)
    pub reference_coarse_step: f64,
    /// Step after the final rotation (cm)
    pub reference_fine_step: f64,
    /// Index following: half-width of the y road (cm)
    pub road_y: f64,
    /// Index following: half-width of the drift-time road (µs)
    pub road_time: f64,
    /// Index following: largest accepted χ² of a cluster
    pub max_cluster_chi2: f64,
}

impl Default for FitConfig {
    fn default() -> Self {
        Self {
            direction: FitDirection::Inward,
            use_material: false,
            mass: PION_MASS,
            max_snp: 0.85,
            max_step: 5.0,
            max_x: 500.0,
            max_z: 500.0,
            reference_coarse_step: 5.0,
            reference_fine_step: 1.0,
            road_y: 2.0,
            road_time: 1.0,
            max_cluster_chi2: CHI2_99_2D,
        }
    }
}

/// Why the cluster loop ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum FitTermination {
    /// All clusters (or rows) were visited
    Exhausted,
    RotationFailed,
    PropagationFailed,
    /// Track left the |x| / |z| envelope
    LeftEnvelope,
    UpdateFailed,
}

/// Outcome of a fit. Always carries the last valid state.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FitResult {
    pub track: TrackParam,
    pub n_updates: usize,
    /// Points outside the envelope, or rows without a matching cluster
    pub n_skipped: usize,
    /// Sum of the predicted χ² of all updates
    pub chi2: f64,
    pub termination: FitTermination,
    /// The final state lies on the reference surface
    pub reached_reference: bool,
}

impl FitResult {
    pub fn ndf(&self) -> i32 {
        2 * self.n_updates as i32 - 5
    }

    /// Every cluster was used and the reference was reached.
    pub fn is_complete(&self) -> bool {
        self.termination == FitTermination::Exhausted && self.reached_reference
    }
}

/// Running state of one fit.
struct FitState {
    track: TrackParam,
    n_updates: usize,
    n_skipped: usize,
    chi2: f64,
    termination: FitTermination,
}

impl FitState {
    fn new(seed: &TrackParam) -> Self {
        Self {
            track: *seed,
            n_updates: 0,
            n_skipped: 0,
            chi2: 0.0,
            termination: FitTermination::Exhausted,
        }
    }

    fn stop(&mut self, termination: FitTermination, reason: &dyn std::fmt::Display) {
        debug!(?termination, %reason, x = self.track.x, updates = self.n_updates, "fit stopped early");
        self.termination = termination;
    }
}

/// Kalman fitter over the clusters of a candidate.
#[derive(Clone)]
pub struct TrackFitter<'a> {
    pub config: FitConfig,
    conversion: PointConversion,
    providers: Providers<'a>,
}

impl<'a> TrackFitter<'a> {
    pub fn new(config: FitConfig, conversion: PointConversion, providers: Providers<'a>) -> Self {
        Self {
            config,
            conversion,
            providers,
        }
    }

    fn step_options(&self, max_step: f64, rotate_to_local: bool) -> PropagationOptions {
        PropagationOptions {
            mass: self.config.mass,
            max_step,
            rotate_to_local,
            max_snp: self.config.max_snp,
            use_material: self.config.use_material,
        }
    }

    /// Space point of a cluster once the event time-zero is known.
    fn point(&self, cluster: &Cluster, time0: f64) -> Result<TrackPoint, RecoError> {
        self.converted_point(cluster, (!self.conversion.ideal_tracking).then_some(time0))
    }

    /// `time0 = None` keeps the stored depth.
    fn converted_point(&self, cluster: &Cluster, time0: Option<f64>) -> Result<TrackPoint, RecoError> {
        let mut point = TrackPoint::from_cluster(cluster, self.providers.geometry, time0)?;
        if self.conversion.correction != CorrectionMode::None {
            point.xyz = self
                .providers
                .correction
                .correct_point(point.as_array(), cluster.sector)
                .into();
        }
        Ok(point)
    }

    fn outside_envelope(&self, track: &TrackParam) -> bool {
        track.z().abs() > self.config.max_z || track.x.abs() > self.config.max_x
    }

    /// Fit `seed` through `clusters` (ordered by increasing row) and report it
    /// at `reference`.
    pub fn fit(
        &self,
        seed: &TrackParam,
        clusters: &[Cluster],
        reference: &ReferenceSurface,
        time0: f64,
    ) -> Result<FitResult, RecoError> {
        let geometry = self.providers.geometry;
        let propagator = self.providers.propagator;
        let (r_min, r_max) = geometry.sensitive_radius();
        let options = self.step_options(self.config.max_step, false);
        let ordered: Vec<&Cluster> = match self.config.direction {
            FitDirection::Inward => clusters.iter().rev().collect(),
            FitDirection::Outward => clusters.iter().collect(),
        };

        let mut state = FitState::new(seed);
        for cluster in ordered {
            let sector = geometry.sector(cluster.sector)?;
            let point = self.point(cluster, time0)?;

            if let Err(err) = state.track.rotate(geometry.sector_alpha(&sector)) {
                state.stop(FitTermination::RotationFailed, &err);
                break;
            }
            let local = point.rotate(state.track.alpha);
            if local.xyz.x.abs() < r_min || local.xyz.x.abs() > r_max {
                state.n_skipped += 1;
                continue;
            }

            if let Err(err) = propagator.propagate_to(&mut state.track, local.xyz.x, &options) {
                state.stop(FitTermination::PropagationFailed, &err);
                break;
            }
            if self.outside_envelope(&state.track) {
                state.stop(FitTermination::LeftEnvelope, &"outside |x| / |z| envelope");
                break;
            }

            let (meas, meas_cov) = local.measurement();
            match state.track.update(&meas, &meas_cov) {
                Ok(chi2) => {
                    state.n_updates += 1;
                    state.chi2 += chi2;
                }
                Err(err) => {
                    state.stop(FitTermination::UpdateFailed, &err);
                    break;
                }
            }
        }

        Ok(self.finish(state, reference))
    }

    /// Follow `seed` row by row from the outer edge inward, picking the best
    /// cluster of each row from the index inside a (y, drift time) road.
    pub fn follow_in_index(
        &self,
        seed: &TrackParam,
        index: &ClusterIndex<'_>,
        reference: &ReferenceSurface,
        time0: f64,
    ) -> Result<FitResult, RecoError> {
        let geometry = self.providers.geometry;
        let propagator = self.providers.propagator;
        let options = self.step_options(self.config.max_step, false);
        let (_, r_max) = geometry.sensitive_radius();

        let mut state = FitState::new(seed);
        if let Err(err) = propagator.propagate_to(&mut state.track, r_max, &options) {
            state.stop(FitTermination::PropagationFailed, &err);
            return Ok(self.finish(state, reference));
        }

        for global_row in (0..geometry.total_rows()).rev() {
            let (roc, row) = geometry.row_location(global_row);
            let radius = geometry.pad_row_radius(roc, row)?;
            let pos = state.track.global_position();
            let az = geometry.azimuth_index(pos.y.atan2(pos.x));
            let frame = geometry.sector(geometry.sector_id(roc, Side::A, az))?;

            if let Err(err) = state.track.rotate(geometry.sector_alpha(&frame)) {
                state.stop(FitTermination::RotationFailed, &err);
                break;
            }
            if let Err(err) = propagator.propagate_to(&mut state.track, radius, &options) {
                state.stop(FitTermination::PropagationFailed, &err);
                break;
            }
            if self.outside_envelope(&state.track) {
                state.stop(FitTermination::LeftEnvelope, &"outside |x| / |z| envelope");
                break;
            }
            // side of the crossing at this row
            let sector = geometry.sector(geometry.sector_id(roc, Side::from_z(state.track.z()), az))?;

            let bin = index.row_bin(roc, sector.azimuth_index, row)?;
            let Some((meas, meas_cov)) = self.best_in_road(index, bin, &sector, &state.track, time0)? else {
                state.n_skipped += 1;
                continue;
            };
            match state.track.update(&meas, &meas_cov) {
                Ok(chi2) => {
                    state.n_updates += 1;
                    state.chi2 += chi2;
                }
                Err(err) => {
                    state.stop(FitTermination::UpdateFailed, &err);
                    break;
                }
            }
        }

        Ok(self.finish(state, reference))
    }

    /// Lowest-χ² cluster of `bin` on the track's side inside the road.
    fn best_in_road(
        &self,
        index: &ClusterIndex<'_>,
        bin: &RowBin,
        sector: &Sector,
        track: &TrackParam,
        time0: f64,
    ) -> Result<Option<(MeasVec, MeasCov)>, RecoError> {
        if bin.is_empty() {
            return Ok(None);
        }
        let geometry = self.providers.geometry;
        let predicted_time =
            time0 + (geometry.z_length(sector) - track.z() * sector.side.sign()) / geometry.drift_velocity();
        let lower = predicted_time - self.config.road_time;
        let upper = predicted_time + self.config.road_time;

        let mut i = bin.nearest(index.config().clamped_bucket(predicted_time));
        while i > 0 && bin.get(i - 1).is_some_and(|(_, c)| c.z >= lower) {
            i -= 1;
        }

        let mut best: Option<(f64, MeasVec, MeasCov)> = None;
        while let Some((key, cluster)) = bin.get(i) {
            i += 1;
            if cluster.z > upper {
                break;
            }
            if cluster.z < lower || key.sector() != sector.id {
                continue;
            }
            // indexed clusters carry the drift time as depth
            let local = self.converted_point(cluster, Some(time0))?.rotate(track.alpha);
            if (local.xyz.y - track.y()).abs() > self.config.road_y {
                continue;
            }
            let (meas, meas_cov) = local.measurement();
            let Ok(chi2) = track.predicted_chi2(&meas, &meas_cov) else {
                continue;
            };
            if chi2 < self.config.max_cluster_chi2 && best.map_or(true, |(b, _, _)| chi2 < b) {
                best = Some((chi2, meas, meas_cov));
            }
        }
        Ok(best.map(|(_, m, c)| (m, c)))
    }

    /// Move the fitted track onto the reference surface.
    fn finish(&self, state: FitState, reference: &ReferenceSurface) -> FitResult {
        let propagator = self.providers.propagator;
        let mut track = state.track;

        let coarse = self.step_options(self.config.reference_coarse_step, true);
        if let Err(err) = propagator.propagate_to(&mut track, reference.x, &coarse) {
            // expected close to the axis, where the local frame turns fast
            debug!(error = %err, x = track.x, "coarse approach to reference stopped");
        }
        let rotated = track.rotate(reference.alpha);
        let fine = self.step_options(self.config.reference_fine_step, false);
        let reached = rotated.is_ok() && propagator.propagate_to(&mut track, reference.x, &fine).is_ok();
        if !reached {
            debug!(x = track.x, alpha = track.alpha, "reference surface not reached");
        }

        FitResult {
            track,
            n_updates: state.n_updates,
            n_skipped: state.n_skipped,
            chi2: state.chi2,
            termination: state.termination,
            reached_reference: reached,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        cluster_index::ClusterIndexConfig,
        propagation::{HelixPropagator, Propagator},
        seeding::{SeedBuilder, SeedConfig, SeedPass},
        testutil::ToyTrack,
        types::ClusterSource,
    };
    use approx::assert_abs_diff_eq;
    use tpc_detector::{DetectorGeometry, NoCorrection, TpcGeometry};

    struct Setup {
        geo: TpcGeometry,
        prop: HelixPropagator,
    }

    impl Setup {
        fn new() -> Self {
            Self {
                geo: TpcGeometry::default(),
                prop: HelixPropagator::default(),
            }
        }

        fn providers(&self) -> Providers<'_> {
            Providers {
                geometry: &self.geo,
                correction: &NoCorrection,
                propagator: &self.prop,
            }
        }

        fn seed(&self, clusters: &[Cluster], time0: f64) -> TrackParam {
            SeedBuilder::new(SeedConfig::default(), PointConversion::default(), self.providers())
                .build(clusters, ClusterSource::Ideal, SeedPass::Physical { time0 })
                .unwrap()
        }
    }

    fn reference(toy: &ToyTrack) -> ReferenceSurface {
        ReferenceSurface {
            x: toy.truth().x,
            alpha: toy.truth().alpha,
        }
    }

    #[test]
    fn fit_recovers_generated_track() {
        let s = Setup::new();
        let toy = ToyTrack::new(1.2, 0.9, 0.25, 1, 0.0);
        let clusters = s.geo_clusters(&toy, 2.0);
        let seed = s.seed(&clusters, 2.0);
        let fitter = TrackFitter::new(FitConfig::default(), PointConversion::default(), s.providers());
        let result = fitter.fit(&seed, &clusters, &reference(&toy), 2.0).unwrap();

        assert!(result.is_complete(), "{result:?}");
        assert_eq!(result.n_updates, clusters.len());
        assert_abs_diff_eq!(result.track.x, 0.0, epsilon = 1e-4);
        assert_abs_diff_eq!(result.track.alpha, toy.truth().alpha, epsilon = 1e-12);
        let truth = toy.truth();
        assert_abs_diff_eq!(result.track.y(), truth.y(), epsilon = 1e-3);
        assert_abs_diff_eq!(result.track.z(), truth.z(), epsilon = 1e-3);
        assert_abs_diff_eq!(result.track.snp(), truth.snp(), epsilon = 1e-4);
        assert_abs_diff_eq!(result.track.tgl(), truth.tgl(), epsilon = 1e-4);
        assert_abs_diff_eq!(result.track.q_pt(), truth.q_pt(), epsilon = 1e-3);
        // noise-free points: every update is consistent
        assert!(result.chi2 < 1.0);
    }

    #[test]
    fn fit_is_bit_reproducible() {
        let s = Setup::new();
        let toy = ToyTrack::new(0.6, -2.0, -0.5, -1, -3.0);
        let clusters = s.geo_clusters(&toy, 7.0);
        let seed = s.seed(&clusters, 7.0);
        let fitter = TrackFitter::new(
            FitConfig {
                use_material: true,
                ..FitConfig::default()
            },
            PointConversion::default(),
            s.providers(),
        );
        let a = fitter.fit(&seed, &clusters, &reference(&toy), 7.0).unwrap();
        let b = fitter.fit(&seed, &clusters, &reference(&toy), 7.0).unwrap();
        assert_eq!(a, b);
        for (x, y) in a.track.params.iter().zip(b.track.params.iter()) {
            assert_eq!(x.to_bits(), y.to_bits());
        }
    }

    #[test]
    fn points_outside_envelope_are_skipped() {
        let s = Setup::new();
        let toy = ToyTrack::new(2.0, 0.3, 0.1, 1, 0.0);
        let mut clusters = s.geo_clusters(&toy, 0.0);
        let mut stray = clusters[0];
        stray.x = 40.0;
        clusters.insert(0, stray);
        let seed = s.seed(&clusters, 0.0);
        let fitter = TrackFitter::new(FitConfig::default(), PointConversion::default(), s.providers());
        let result = fitter.fit(&seed, &clusters, &reference(&toy), 0.0).unwrap();
        assert_eq!(result.n_skipped, 1);
        assert_eq!(result.n_updates, clusters.len() - 1);
    }

    #[test]
    fn envelope_exit_returns_partial_result() {
        let s = Setup::new();
        let toy = ToyTrack::new(2.0, 0.3, 0.1, 1, 0.0);
        let clusters = s.geo_clusters(&toy, 0.0);
        let seed = s.seed(&clusters, 0.0);
        let fitter = TrackFitter::new(
            FitConfig {
                max_z: 10.0,
                ..FitConfig::default()
            },
            PointConversion::default(),
            s.providers(),
        );
        let result = fitter.fit(&seed, &clusters, &reference(&toy), 0.0).unwrap();
        assert_eq!(result.termination, FitTermination::LeftEnvelope);
        assert!(result.n_updates < clusters.len());
        assert!(!result.is_complete());
    }

    #[test]
    fn bad_sector_is_a_contract_violation() {
        let s = Setup::new();
        let toy = ToyTrack::new(2.0, 0.3, 0.1, 1, 0.0);
        let mut clusters = s.geo_clusters(&toy, 0.0);
        let seed = s.seed(&clusters, 0.0);
        let last = clusters.len() - 1;
        clusters[last].sector = 99;
        let fitter = TrackFitter::new(FitConfig::default(), PointConversion::default(), s.providers());
        assert!(matches!(
            fitter.fit(&seed, &clusters, &reference(&toy), 0.0),
            Err(RecoError::Detector(_))
        ));
    }

    #[test]
    fn following_through_the_index_finds_the_track() {
        let s = Setup::new();
        let t0 = 1.0;
        let toy = ToyTrack::new(1.0, 1.3, 0.4, -1, 0.0);
        let other = ToyTrack::new(0.7, 1.45, -0.3, 1, 0.0);
        let clusters = s.geo_clusters(&toy, t0);

        let mut index = ClusterIndex::new(&s.geo, ClusterIndexConfig::default());
        for cl in clusters.iter().chain(s.geo_clusters(&other, t0).iter()) {
            index.insert(cl, 0).unwrap();
        }
        index.finalize();

        let seed = s.seed(&clusters, t0);
        let fitter = TrackFitter::new(FitConfig::default(), PointConversion::default(), s.providers());
        let result = fitter.follow_in_index(&seed, &index, &reference(&toy), t0).unwrap();
        assert!(result.reached_reference);
        assert!(result.n_updates + 5 >= clusters.len(), "{result:?}");
        assert_abs_diff_eq!(result.track.q_pt(), toy.truth().q_pt(), epsilon = 1e-2);
        assert_abs_diff_eq!(result.track.tgl(), toy.truth().tgl(), epsilon = 1e-3);
    }

    #[test]
    fn following_across_the_central_electrode_keeps_every_row() {
        let s = Setup::new();
        let t0 = 0.5;
        // A side up to r = 200 cm, C side beyond, no sector boundary crossed
        let toy = ToyTrack::new(2.0, 0.5, -0.2, 1, 40.06);
        let clusters = s.geo_clusters(&toy, t0);
        let sides: Vec<_> = clusters.iter().map(|c| s.geo.sector(c.sector).unwrap().side).collect();
        assert!(sides.contains(&tpc_detector::Side::A) && sides.contains(&tpc_detector::Side::C));

        let mut index = ClusterIndex::new(&s.geo, ClusterIndexConfig::default());
        for cl in &clusters {
            index.insert(cl, 0).unwrap();
        }
        index.finalize();

        let seed = s.seed(&clusters, t0);
        let fitter = TrackFitter::new(FitConfig::default(), PointConversion::default(), s.providers());
        let result = fitter.follow_in_index(&seed, &index, &reference(&toy), t0).unwrap();
        assert_eq!(result.n_updates, clusters.len(), "{result:?}");
        assert_eq!(result.n_skipped, 0);
    }

    impl Setup {
        fn geo_clusters(&self, toy: &ToyTrack, t0: f64) -> Vec<Cluster> {
            let clusters = toy.clusters(&self.geo, &self.prop, t0);
            assert!(clusters.len() > 100);
            assert!(self.prop.bz() != 0.0);
            clusters
        }
    }
}
