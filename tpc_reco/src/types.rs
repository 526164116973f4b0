//! Fundamental types used across the workspace.

use crate::{propagation::Propagator, track_param::TrackParam};
use nalgebra::{Matrix2, Matrix3, Matrix5, Vector2, Vector3, Vector5};
use serde::{Deserialize, Serialize};
use std::fmt;
use tpc_detector::{DetectorError, DetectorGeometry, PositionCorrection, Sector};

// ---------------------------------------------------------------------------
// Matrix aliases: f64 throughout for numerical precision in the filter.
// ---------------------------------------------------------------------------

/// Track parameters [y, z, sin φ, tan λ, q/pT]
pub type ParamVec = Vector5<f64>;

/// 5×5 track parameter covariance
pub type ParamCov = Matrix5<f64>;

/// 2-D local measurement (y, z)
pub type MeasVec = Vector2<f64>;

/// 2×2 measurement covariance
pub type MeasCov = Matrix2<f64>;

// ---------------------------------------------------------------------------
// Cluster
// ---------------------------------------------------------------------------

/// One TPC cluster, in the local frame of its sector.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Cluster {
    /// Read-out chamber id
    pub sector: u16,
    /// Pad row within the chamber
    pub row: u16,
    /// Local x (pad-row radius for undistorted clusters, cm)
    pub x: f64,
    /// Local y along the pad row (cm)
    pub y: f64,
    /// Depth coordinate (cm). The cluster index rewrites it to the drift time.
    pub z: f64,
    /// Raw drift time (µs)
    pub time_bin: f64,
    pub sigma_y2: f64,
    pub sigma_z2: f64,
}

/// Packed cluster address: sector, row and slot within the row bin.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct ClusterKey(pub u64);

impl ClusterKey {
    pub fn new(sector: u16, row: u16, slot: usize) -> Self {
        Self((u64::from(sector) << 48) | (u64::from(row) << 32) | (slot as u64 & 0xffff_ffff))
    }

    pub fn sector(self) -> u16 {
        (self.0 >> 48) as u16
    }

    pub fn row(self) -> u16 {
        ((self.0 >> 32) & 0xffff) as u16
    }

    pub fn slot(self) -> usize {
        (self.0 & 0xffff_ffff) as usize
    }
}

impl fmt::Display for ClusterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "S{}R{}#{}", self.sector(), self.row(), self.slot())
    }
}

// ---------------------------------------------------------------------------
// Space points
// ---------------------------------------------------------------------------

/// A space point with its covariance, in global or in a rotated frame.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct TrackPoint {
    pub xyz: Vector3<f64>,
    pub cov: Matrix3<f64>,
    /// Sector the point was measured in
    pub volume: u16,
}

impl TrackPoint {
    /// Global space point of a cluster.
    ///
    /// `time0 = Some(t0)` replaces the cluster depth by the position computed
    /// from its drift time; `None` keeps `cluster.z`.
    pub fn from_cluster(
        cluster: &Cluster,
        geometry: &dyn DetectorGeometry,
        time0: Option<f64>,
    ) -> Result<Self, DetectorError> {
        let sector = geometry.sector(cluster.sector)?;
        let z = match time0 {
            Some(t0) => drift_z(cluster, &sector, geometry, t0),
            None => cluster.z,
        };
        let local = TrackPoint {
            xyz: Vector3::new(cluster.x, cluster.y, z),
            cov: Matrix3::from_diagonal(&Vector3::new(0.0, cluster.sigma_y2, cluster.sigma_z2)),
            volume: cluster.sector,
        };
        Ok(local.rotate(-geometry.sector_alpha(&sector)))
    }

    /// Express the point in the frame rotated by `alpha` around the z axis.
    pub fn rotate(&self, alpha: f64) -> TrackPoint {
        let (sa, ca) = alpha.sin_cos();
        #[rustfmt::skip]
        let r = Matrix3::new(
             ca, sa, 0.0,
            -sa, ca, 0.0,
            0.0, 0.0, 1.0,
        );
        TrackPoint {
            xyz: r * self.xyz,
            cov: r * self.cov * r.transpose(),
            volume: self.volume,
        }
    }

    pub fn radius(&self) -> f64 {
        self.xyz.x.hypot(self.xyz.y)
    }

    pub fn as_array(&self) -> [f64; 3] {
        [self.xyz.x, self.xyz.y, self.xyz.z]
    }

    /// Local (y, z) measurement and its covariance.
    pub fn measurement(&self) -> (MeasVec, MeasCov) {
        (
            MeasVec::new(self.xyz.y, self.xyz.z),
            MeasCov::new(
                self.cov[(1, 1)],
                self.cov[(1, 2)],
                self.cov[(2, 1)],
                self.cov[(2, 2)],
            ),
        )
    }
}

/// z position of a cluster from its drift time and the event time-zero.
pub fn drift_z(cluster: &Cluster, sector: &Sector, geometry: &dyn DetectorGeometry, time0: f64) -> f64 {
    (geometry.z_length(sector) - (cluster.time_bin - time0) * geometry.drift_velocity())
        * sector.side.sign()
}

// ---------------------------------------------------------------------------
// Policies
// ---------------------------------------------------------------------------

/// Which cluster list of a candidate is reconstructed.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum,
)]
pub enum ClusterSource {
    /// Clusters at their true positions
    #[default]
    Ideal,
    /// Clusters displaced by the distortion field
    Distorted,
}

/// Space-point correction policy.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum,
)]
pub enum CorrectionMode {
    /// Use measured points as they are
    #[default]
    None,
    /// Time-zero seed: assume the points sit half-way to the read-out
    DetectorCenter,
    /// Time-zero seed: assume the points lie on a 22.5° dip line
    AverageEta,
    /// Use the true depth; only meaningful on simulated data
    Ideal,
}

/// How clusters are turned into space points.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PointConversion {
    pub correction: CorrectionMode,
    /// Keep the cluster's true z instead of the drift-time position
    pub ideal_tracking: bool,
}

/// Injected collaborators, valid for one reconstruction run.
#[derive(Clone, Copy)]
pub struct Providers<'a> {
    pub geometry: &'a dyn DetectorGeometry,
    pub correction: &'a dyn PositionCorrection,
    pub propagator: &'a dyn Propagator,
}

// ---------------------------------------------------------------------------
// Event input
// ---------------------------------------------------------------------------

/// Surface the fitted track is reported at.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ReferenceSurface {
    /// Local x of the surface
    pub x: f64,
    /// Frame angle
    pub alpha: f64,
}

/// Clusters belonging to one particle, ordered by increasing row.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TrackCandidate {
    /// Generated track parameters at the production point
    pub truth: TrackParam,
    pub clusters: Vec<Cluster>,
    pub distorted_clusters: Vec<Cluster>,
}

impl TrackCandidate {
    pub fn clusters(&self, source: ClusterSource) -> &[Cluster] {
        match source {
            ClusterSource::Ideal => &self.clusters,
            ClusterSource::Distorted => &self.distorted_clusters,
        }
    }

    /// The fit is reported in the frame and at the x of the generated track.
    pub fn reference(&self) -> ReferenceSurface {
        ReferenceSurface {
            x: self.truth.x,
            alpha: self.truth.alpha,
        }
    }
}

/// One collision: a common vertex, a time-zero and its track candidates.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Event {
    pub id: u64,
    /// True primary vertex (cm)
    pub vertex: [f64; 3],
    /// True time-zero (µs)
    pub t0: f64,
    pub tracks: Vec<TrackCandidate>,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
