//! Three-point helix seeds, with and without a known time-zero.
//!
//! # Point selection
//! Clusters are scanned in row order. A cluster is picked when its global
//! row reaches a moving threshold (`seeding_row`, then `+ seeding_dist` after
//! every pick), or when it is the last cluster of the list. Three picks end
//! the scan.
//!
//! # Passes
//! - [`SeedPass::TimeZero`]: the depth coordinate is the raw drift time.
//!   The seed is propagated to the beam axis; its z there gives the event
//!   time-zero, see [`SeedBuilder::time0_from_seed`].
//! - [`SeedPass::Physical`]: depths come from the drift time and the
//!   time-zero of the first pass.

use crate::{
    error::SeedError,
    propagation::{PropagationOptions, PION_MASS},
    track_param::{TrackParam, ALMOST_ONE, B2C},
    types::{Cluster, ClusterSource, CorrectionMode, ParamCov, ParamVec, PointConversion, Providers, TrackPoint},
};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Seeding parameters.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SeedConfig {
    /// Global row of the first seed point
    pub seeding_row: u16,
    /// Row spacing between seed points
    pub seeding_dist: u16,
    /// Scale applied to the seed covariance diagonal
    pub covariance_scale: f64,
    /// Largest |x| at the axis for a usable time-zero seed (cm)
    pub axis_tolerance: f64,
    /// Assumed |z| of all points for [`CorrectionMode::DetectorCenter`] (cm)
    pub center_z: f64,
    /// Dip angle assumed for [`CorrectionMode::AverageEta`] (degrees)
    pub average_dip_deg: f64,
    /// Propagation of the time-zero seed to the axis
    pub axis_propagation: PropagationOptions,
}

impl Default for SeedConfig {
    fn default() -> Self {
        Self {
            seeding_row: 10,
            seeding_dist: 70,
            covariance_scale: 10.0,
            axis_tolerance: 3.0,
            center_z: 125.0,
            average_dip_deg: 22.5,
            axis_propagation: PropagationOptions {
                mass: PION_MASS,
                max_step: 5.0,
                rotate_to_local: true,
                max_snp: 0.85,
                use_material: false,
            },
        }
    }
}

/// Which of the two seeding passes is run.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub enum SeedPass {
    TimeZero,
    Physical { time0: f64 },
}

/// Builds seeds for track candidates.
#[derive(Clone)]
pub struct SeedBuilder<'a> {
    pub config: SeedConfig,
    conversion: PointConversion,
    providers: Providers<'a>,
}

impl<'a> SeedBuilder<'a> {
    pub fn new(config: SeedConfig, conversion: PointConversion, providers: Providers<'a>) -> Self {
        Self {
            config,
            conversion,
            providers,
        }
    }

    /// Pick the three seed clusters.
    pub fn select<'c>(&self, clusters: &'c [Cluster]) -> Result<[&'c Cluster; 3], SeedError> {
        let geometry = self.providers.geometry;
        let mut next_row = self.config.seeding_row;
        let mut picked: Vec<&Cluster> = Vec::with_capacity(3);
        let last = clusters.len().saturating_sub(1);

        for (i, cluster) in clusters.iter().enumerate() {
            let sector = geometry.sector(cluster.sector)?;
            // no pad row behind this cluster
            if cluster.row >= geometry.n_rows(sector.roc) {
                continue;
            }
            let row = geometry.global_row(&sector, cluster.row);
            if row >= next_row || i == last {
                picked.push(cluster);
                next_row = next_row.saturating_add(self.config.seeding_dist);
                if picked.len() == 3 {
                    break;
                }
            }
        }

        match picked.as_slice() {
            [a, b, c] => Ok([*a, *b, *c]),
            _ => Err(SeedError::InsufficientPoints {
                found: picked.len(),
                first_row: self.config.seeding_row,
                spacing: self.config.seeding_dist,
            }),
        }
    }

    /// Space point of a seed cluster for the given pass.
    fn seed_point(&self, cluster: &Cluster, source: ClusterSource, pass: SeedPass) -> Result<TrackPoint, SeedError> {
        let geometry = self.providers.geometry;
        let sector = geometry.sector(cluster.sector)?;
        let time0 = match pass {
            SeedPass::Physical { time0 } if !self.conversion.ideal_tracking => Some(time0),
            _ => None,
        };
        let mut point = TrackPoint::from_cluster(cluster, geometry, time0)?;

        let mode = self.conversion.correction;
        if source == ClusterSource::Distorted && mode != CorrectionMode::None {
            let sign = sector.side.sign();
            if pass == SeedPass::TimeZero {
                match mode {
                    CorrectionMode::DetectorCenter => point.xyz.z = self.config.center_z * sign,
                    CorrectionMode::AverageEta => {
                        point.xyz.z = self.config.average_dip_deg.to_radians().tan() * point.radius() * sign
                    }
                    _ => {}
                }
            }
            if mode == CorrectionMode::Ideal {
                point.xyz.z = cluster.z;
            }
            let corrected = self.providers.correction.correct_point(point.as_array(), cluster.sector);
            point.xyz = corrected.into();
        }

        if pass == SeedPass::TimeZero {
            point.xyz.z = cluster.time_bin;
        }
        Ok(point)
    }

    /// Build a seed from an ordered cluster list.
    pub fn build(&self, clusters: &[Cluster], source: ClusterSource, pass: SeedPass) -> Result<TrackParam, SeedError> {
        let picked = self.select(clusters)?;
        let points = [
            self.seed_point(picked[0], source, pass)?,
            self.seed_point(picked[1], source, pass)?,
            self.seed_point(picked[2], source, pass)?,
        ];
        let mut seed = helix_from_points(&points, self.providers.propagator.bz())?;
        seed.reset_covariance(self.config.covariance_scale);

        if pass == SeedPass::TimeZero {
            let reached = self
                .providers
                .propagator
                .propagate_to(&mut seed, 0.0, &self.config.axis_propagation);
            if seed.x.abs() > self.config.axis_tolerance {
                warn!(
                    x = seed.x,
                    alpha = seed.alpha,
                    y = seed.y(),
                    z = seed.z(),
                    snp = seed.snp(),
                    "time-zero seed did not reach the beam axis"
                );
                return Err(SeedError::TimeZeroNotConverged { x: seed.x });
            }
            if let Err(err) = reached {
                debug!(error = %err, x = seed.x, "time-zero seed stopped close to the axis");
            }
        }
        Ok(seed)
    }

    /// Event time-zero from a time-zero seed sitting at the beam axis.
    pub fn time0_from_seed(&self, seed: &TrackParam) -> Result<f64, SeedError> {
        let geometry = self.providers.geometry;
        let sector = geometry.sector(0)?;
        Ok(seed.z() - geometry.z_length(&sector) / geometry.drift_velocity())
    }
}

/// Closed-form helix through three space points, in the frame of the first.
///
/// Curvature from the circumscribed circle, κ = 2·(p₁−p₀)×(p₂−p₀) / (|p₁−p₀|·|p₂−p₁|·|p₂−p₀|);
/// the direction at p₀ is the chord direction minus half the turning angle.
/// Collinear points give a straight track (q/pT = 0).
pub fn helix_from_points(points: &[TrackPoint; 3], bz: f64) -> Result<TrackParam, SeedError> {
    const MIN_DISTANCE: f64 = 1e-6;

    let alpha = points[0].xyz.y.atan2(points[0].xyz.x);
    let [p0, p1, p2] = [points[0].rotate(alpha), points[1].rotate(alpha), points[2].rotate(alpha)];
    let (x0, y0, z0) = (p0.xyz.x, p0.xyz.y, p0.xyz.z);
    let (dx1, dy1) = (p1.xyz.x - x0, p1.xyz.y - y0);
    let (dx2, dy2) = (p2.xyz.x - x0, p2.xyz.y - y0);

    let l01 = dx1.hypot(dy1);
    let l02 = dx2.hypot(dy2);
    let l12 = (p2.xyz.x - p1.xyz.x).hypot(p2.xyz.y - p1.xyz.y);
    if l01 < MIN_DISTANCE || l02 < MIN_DISTANCE || l12 < MIN_DISTANCE {
        return Err(SeedError::Degenerate("coincident seed points"));
    }

    let crv = 2.0 * (dx1 * dy2 - dy1 * dx2) / (l01 * l12 * l02);
    let phi0 = dy1.atan2(dx1) - (0.5 * crv * l01).clamp(-1.0, 1.0).asin();
    let snp = phi0.sin();
    if snp.abs() >= ALMOST_ONE || phi0.cos() <= 0.0 {
        return Err(SeedError::Degenerate("seed points do not move outward"));
    }

    let arc02 = if (crv * l02).abs() < 1e-9 {
        l02
    } else {
        2.0 * (0.5 * crv * l02).clamp(-1.0, 1.0).asin() / crv
    };
    let tgl = (p2.xyz.z - z0) / arc02;
    let cc = bz * B2C;
    let q_pt = if cc.abs() < f64::EPSILON { 0.0 } else { crv / cc };

    let params = ParamVec::new(y0, z0, snp, tgl, q_pt);
    if !params.iter().all(|v| v.is_finite()) {
        return Err(SeedError::Degenerate("non-finite helix parameters"));
    }

    let sy2 = p0.cov[(1, 1)].max(p1.cov[(1, 1)]).max(p2.cov[(1, 1)]);
    let sz2 = p0.cov[(2, 2)].max(p1.cov[(2, 2)]).max(p2.cov[(2, 2)]);
    let crv_var = 64.0 * sy2 / (l02 * l02 * l02 * l02);
    let mut cov = ParamCov::zeros();
    cov[(0, 0)] = sy2;
    cov[(1, 1)] = sz2;
    cov[(2, 2)] = 4.0 * sy2 / (l02 * l02);
    cov[(3, 3)] = 4.0 * sz2 / (l02 * l02);
    cov[(4, 4)] = if cc.abs() < f64::EPSILON { 100.0 } else { crv_var / (cc * cc) };

    Ok(TrackParam::new(x0, alpha, params, cov))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        propagation::{HelixPropagator, Propagator},
        testutil::ToyTrack,
    };
    use approx::assert_abs_diff_eq;
    use nalgebra::{Matrix3, Vector3};
    use tpc_detector::{DetectorGeometry, NoCorrection, TpcGeometry};

    fn providers<'a>(geo: &'a TpcGeometry, prop: &'a HelixPropagator) -> Providers<'a> {
        Providers {
            geometry: geo,
            correction: &NoCorrection,
            propagator: prop,
        }
    }

    fn outer_rows() -> SeedConfig {
        SeedConfig {
            seeding_row: 140,
            seeding_dist: 10,
            ..SeedConfig::default()
        }
    }

    fn at_row(geo: &TpcGeometry, global_row: u16) -> Cluster {
        let (roc, row) = geo.row_location(global_row);
        let sector = geo.sector_id(roc, tpc_detector::Side::A, 0);
        Cluster {
            sector,
            row,
            x: geo.pad_row_radius(roc, row).unwrap(),
            y: 0.0,
            z: 10.0,
            time_bin: 80.0,
            sigma_y2: 0.01,
            sigma_z2: 0.01,
        }
    }

    #[test]
    fn selection_follows_moving_threshold() {
        let geo = TpcGeometry::default();
        let prop = HelixPropagator::default();
        let seeder = SeedBuilder::new(outer_rows(), PointConversion::default(), providers(&geo, &prop));
        let clusters: Vec<Cluster> = [100, 139, 140, 145, 150, 151, 158].iter().map(|&r| at_row(&geo, r)).collect();
        let picked = seeder.select(&clusters).unwrap();
        let rows: Vec<u16> = picked
            .iter()
            .map(|c| geo.global_row(&geo.sector(c.sector).unwrap(), c.row))
            .collect();
        assert_eq!(rows, vec![140, 150, 158]);
    }

    #[test]
    fn last_cluster_is_forced() {
        let geo = TpcGeometry::default();
        let prop = HelixPropagator::default();
        let seeder = SeedBuilder::new(outer_rows(), PointConversion::default(), providers(&geo, &prop));
        // 152 does not reach the third threshold (160) but is the final element
        let clusters: Vec<Cluster> = [141, 150, 152].iter().map(|&r| at_row(&geo, r)).collect();
        let picked = seeder.select(&clusters).unwrap();
        assert_eq!(picked[2].row, geo.row_location(152).1);
    }

    #[test]
    fn too_few_points_is_recoverable() {
        let geo = TpcGeometry::default();
        let prop = HelixPropagator::default();
        let seeder = SeedBuilder::new(outer_rows(), PointConversion::default(), providers(&geo, &prop));
        let clusters: Vec<Cluster> = [10, 20, 30, 150].iter().map(|&r| at_row(&geo, r)).collect();
        let err = seeder.select(&clusters).unwrap_err();
        assert_eq!(
            err,
            SeedError::InsufficientPoints {
                found: 1,
                first_row: 140,
                spacing: 10
            }
        );
        assert!(err.is_recoverable());

        let mut bad = clusters.clone();
        bad[0].sector = 500;
        let err = seeder.select(&bad).unwrap_err();
        assert!(!err.is_recoverable());
    }

    fn point(x: f64, y: f64, z: f64) -> TrackPoint {
        TrackPoint {
            xyz: Vector3::new(x, y, z),
            cov: Matrix3::from_diagonal(&Vector3::new(0.0, 0.01, 0.01)),
            volume: 0,
        }
    }

    #[test]
    fn collinear_points_give_straight_seed() {
        let pts = [point(100.0, 0.0, 5.0), point(150.0, 0.0, 7.5), point(200.0, 0.0, 10.0)];
        let seed = helix_from_points(&pts, 5.0).unwrap();
        assert_eq!(seed.q_pt(), 0.0);
        assert!(seed.params.iter().all(|v| v.is_finite()));
        assert!(seed.cov.iter().all(|v| v.is_finite()));
        assert_abs_diff_eq!(seed.snp(), 0.0);
        assert_abs_diff_eq!(seed.tgl(), 0.05, epsilon = 1e-12);
    }

    #[test]
    fn coincident_points_are_degenerate() {
        let pts = [point(100.0, 0.0, 0.0), point(100.0, 0.0, 0.0), point(200.0, 0.0, 0.0)];
        assert!(matches!(
            helix_from_points(&pts, 5.0),
            Err(SeedError::Degenerate(_))
        ));
    }

    #[test]
    fn three_points_on_a_helix_recover_it() {
        let toy = ToyTrack::new(0.8, 0.7, 0.3, 1, 2.0);
        let prop = HelixPropagator::default();
        let pts: Vec<TrackPoint> = [120.0, 160.0, 200.0]
            .iter()
            .map(|&r| point_from(toy.global_at_radius(&prop, r)))
            .collect();
        let seed = helix_from_points(&[pts[0], pts[1], pts[2]], prop.bz()).unwrap();
        assert_abs_diff_eq!(seed.q_pt(), toy.truth().q_pt(), epsilon = 1e-6);
        assert_abs_diff_eq!(seed.tgl(), toy.truth().tgl(), epsilon = 1e-9);

        // same track seen from the axis
        let mut back = seed;
        prop.propagate_to(&mut back, 0.0, &PropagationOptions::default().with_rotation(true))
            .ok();
        assert!(back.x.abs() < 3.0);
        assert_abs_diff_eq!(back.z(), 2.0, epsilon = 1e-3);
    }

    fn point_from(xyz: Vector3<f64>) -> TrackPoint {
        point(xyz.x, xyz.y, xyz.z)
    }

    #[test]
    fn time_zero_seed_measures_event_time() {
        let geo = TpcGeometry::default();
        let prop = HelixPropagator::default();
        let seeder = SeedBuilder::new(SeedConfig::default(), PointConversion::default(), providers(&geo, &prop));
        let t0 = 3.5;
        let toy = ToyTrack::new(1.5, -0.4, 0.2, -1, 4.0);
        let clusters = toy.clusters(&geo, &prop, t0);

        let t0_seed = seeder.build(&clusters, ClusterSource::Ideal, SeedPass::TimeZero).unwrap();
        let time0 = seeder.time0_from_seed(&t0_seed).unwrap();
        // the vertex z is absorbed into the time-zero
        assert_abs_diff_eq!(time0, t0 - 4.0 / geo.drift_velocity(), epsilon = 1e-6);

        let seed = seeder
            .build(&clusters, ClusterSource::Ideal, SeedPass::Physical { time0 })
            .unwrap();
        assert_abs_diff_eq!(seed.tgl(), toy.truth().tgl(), epsilon = 1e-3);
        assert!(seed.cov[(0, 0)] > 0.0 && seed.cov[(4, 4)] <= 100.0);
    }

    #[test]
    fn default_rows_seed_noisy_tracks_to_the_axis() {
        let geo = TpcGeometry::default();
        let prop = HelixPropagator::default();
        let seeder = SeedBuilder::new(SeedConfig::default(), PointConversion::default(), providers(&geo, &prop));
        let offsets = [0.1, -0.1, 0.0];
        for (pt, phi, tgl, charge) in [(0.4, 0.3, 0.5, 1), (1.0, 2.0, -0.4, -1), (3.0, -1.2, 0.1, 1)] {
            let toy = ToyTrack::new(pt, phi, tgl, charge, 0.0);
            let mut clusters = toy.clusters(&geo, &prop, 2.0);
            for c in &mut clusters {
                let shift = offsets[usize::from(c.row) % 3];
                c.y += shift;
                c.time_bin += shift / geo.drift_velocity();
            }
            let seed = seeder.build(&clusters, ClusterSource::Ideal, SeedPass::TimeZero);
            assert!(seed.is_ok(), "pt {pt}: {seed:?}");
            let time0 = seeder.time0_from_seed(&seed.unwrap()).unwrap();
            assert!((time0 - 2.0).abs() < 0.5, "pt {pt}: time0 {time0}");
        }
    }
}
