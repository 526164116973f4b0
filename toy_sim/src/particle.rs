//! Generated particle: helix from the production vertex, walked outward
//! through the pad rows to produce clusters.
//!
//! Each crossed pad row gives one cluster in the local frame of the sector
//! the helix crosses it in. The walk stops when the helix leaves the drift
//! volume, curls back, or cannot be rotated into the next sector.

use nalgebra::Vector3;
use rand::Rng;
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};
use tpc_detector::{DetectorGeometry, Sector, Side, SpaceChargeDistortion};
use tpc_reco::{
    propagation::{PropagationOptions, Propagator},
    track_param::TrackParam,
    types::{Cluster, ParamCov, ParamVec},
};

/// Kinematics of one generated particle.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Particle {
    /// Production point (cm)
    pub vertex: [f64; 3],
    /// Transverse momentum (GeV)
    pub pt: f64,
    /// Momentum azimuth (rad)
    pub phi: f64,
    /// Pseudorapidity
    pub eta: f64,
    /// ±1
    pub charge: i8,
}

/// Per-cluster resolution of the generated clusters.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct ClusterNoise {
    /// σ along the pad row (cm)
    pub sigma_y: f64,
    /// σ in depth (cm)
    pub sigma_z: f64,
}

impl Default for ClusterNoise {
    fn default() -> Self {
        Self {
            sigma_y: 0.1,
            sigma_z: 0.1,
        }
    }
}

/// Undistorted and distorted clusters of one particle.
#[derive(Clone, Debug, Default)]
pub struct ClusterTrail {
    pub clusters: Vec<Cluster>,
    pub distorted: Vec<Cluster>,
}

impl Particle {
    pub fn tgl(&self) -> f64 {
        self.eta.sinh()
    }

    /// Helix parameters at the production point, in the frame rotated by the
    /// momentum azimuth (so y = 0, snp = 0 for a vertex on the axis).
    pub fn truth(&self) -> TrackParam {
        let (sa, ca) = self.phi.sin_cos();
        let [vx, vy, vz] = self.vertex;
        let x = vx * ca + vy * sa;
        let y = -vx * sa + vy * ca;
        let params = ParamVec::new(y, vz, 0.0, self.tgl(), f64::from(self.charge) / self.pt);
        TrackParam::new(x, self.phi, params, ParamCov::identity() * 1e-6)
    }

    /// Walk the helix outward through every pad row.
    ///
    /// `t0` is the collision time; drift times are computed from the smeared
    /// depth. Distorted copies share the drift time of their ideal cluster.
    pub fn clusters<R: Rng>(
        &self,
        geometry: &dyn DetectorGeometry,
        propagator: &dyn Propagator,
        t0: f64,
        noise: &ClusterNoise,
        distortion: Option<&SpaceChargeDistortion>,
        rng: &mut R,
    ) -> ClusterTrail {
        let options = PropagationOptions::default();
        let n = geometry.sectors_per_side();
        let half_width = (geometry.sector_width() / 2.0).tan();
        let y_noise = Normal::new(0.0, noise.sigma_y.max(0.0)).ok();
        let z_noise = Normal::new(0.0, noise.sigma_z.max(0.0)).ok();
        let mut track = self.truth();
        let mut trail = ClusterTrail::default();

        for global_row in 0..geometry.total_rows() {
            let (roc, row) = geometry.row_location(global_row);
            let Ok(radius) = geometry.pad_row_radius(roc, row) else {
                break;
            };
            let pos = track.global_position();
            let phi = if pos.x.hypot(pos.y) < 1.0 {
                track.phi()
            } else {
                pos.y.atan2(pos.x)
            };

            // the crossing may sit in the neighbouring sector
            let mut az = geometry.azimuth_index(phi);
            let mut hit = None;
            for _ in 0..2 {
                // the frame depends on the azimuth only, the side on the crossing
                let Ok(frame) = geometry.sector(geometry.sector_id(roc, Side::A, az)) else { break };
                let mut probe = track;
                if probe.rotate(geometry.sector_alpha(&frame)).is_err()
                    || propagator.propagate_to(&mut probe, radius, &options).is_err()
                {
                    break;
                }
                if probe.y().abs() <= radius * half_width {
                    let id = geometry.sector_id(roc, Side::from_z(probe.z()), az);
                    let Ok(sector) = geometry.sector(id) else { break };
                    hit = Some((sector, probe));
                    break;
                }
                az = if probe.y() > 0.0 { (az + 1) % n } else { (az + n - 1) % n };
            }
            let Some((sector, probe)) = hit else { break };
            let z_length = geometry.z_length(&sector);
            if probe.z().abs() > z_length {
                break;
            }
            track = probe;

            let y = probe.y() + y_noise.map_or(0.0, |d| d.sample(rng));
            let z = probe.z() + z_noise.map_or(0.0, |d| d.sample(rng));
            let cluster = Cluster {
                sector: sector.id,
                row,
                x: radius,
                y,
                z,
                time_bin: t0 + (z_length - z * sector.side.sign()).max(0.0) / geometry.drift_velocity(),
                sigma_y2: noise.sigma_y * noise.sigma_y,
                sigma_z2: noise.sigma_z * noise.sigma_z,
            };
            trail.clusters.push(cluster);
            if let Some(distortion) = distortion {
                trail
                    .distorted
                    .push(distort(&cluster, &sector, geometry, distortion));
            }
        }
        if distortion.is_none() {
            trail.distorted = trail.clusters.clone();
        }
        trail
    }
}

/// Move a cluster to where its charge is read out under `distortion`.
fn distort(
    cluster: &Cluster,
    sector: &Sector,
    geometry: &dyn DetectorGeometry,
    distortion: &SpaceChargeDistortion,
) -> Cluster {
    let (sa, ca) = geometry.sector_alpha(sector).sin_cos();
    let global = Vector3::new(
        cluster.x * ca - cluster.y * sa,
        cluster.x * sa + cluster.y * ca,
        cluster.z,
    );
    let [gx, gy, gz] = distortion.distort_point([global.x, global.y, global.z]);
    Cluster {
        x: gx * ca + gy * sa,
        y: -gx * sa + gy * ca,
        z: gz,
        ..*cluster
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
