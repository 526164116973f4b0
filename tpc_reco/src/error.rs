//! Error types of the reconstruction core.
//!
//! Three families, matching how the caller must react:
//! - [`TrackError`]: numerical failure of one propagation / rotation / update.
//!   Ends the current fit early; never escalated past the fitter.
//! - [`SeedError`]: a candidate produced no seed. Recoverable unless it wraps
//!   a geometry contract violation.
//! - [`RecoError`]: contract violations (bad sector/row, index misuse). These
//!   abort the batch.

use thiserror::Error;
use tpc_detector::DetectorError;

/// Numerical failure of a single track-parameter operation.
#[derive(Clone, Debug, Error, PartialEq)]
pub enum TrackError {
    #[error("|sin(phi)| = {snp:.6} is not below 1")]
    SnpOutOfRange { snp: f64 },

    #[error("|sin(phi)| = {snp:.4} exceeds the limit {limit}")]
    SnpLimit { snp: f64, limit: f64 },

    #[error("innovation covariance is singular")]
    SingularInnovation,

    #[error("material correction too large for the track momentum")]
    MaterialTooThick,

    #[error("propagation did not converge within {0} steps")]
    NotConverged(usize),
}

/// Why a candidate produced no seed.
#[derive(Clone, Debug, Error, PartialEq)]
pub enum SeedError {
    #[error("insufficient seed points: found {found} of 3 (first row {first_row}, spacing {spacing})")]
    InsufficientPoints {
        found: usize,
        first_row: u16,
        spacing: u16,
    },

    #[error("degenerate seed: {0}")]
    Degenerate(&'static str),

    #[error("time-zero seed did not reach the beam axis (x = {x:.2})")]
    TimeZeroNotConverged { x: f64 },

    #[error(transparent)]
    Detector(#[from] DetectorError),
}

impl SeedError {
    /// Data conditions are recoverable (skip the candidate); geometry
    /// contract violations are not.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, SeedError::Detector(_))
    }
}

/// Contract violations: abort the current batch.
#[derive(Clone, Debug, Error, PartialEq)]
pub enum RecoError {
    #[error(transparent)]
    Detector(#[from] DetectorError),

    #[error("seeding aborted: {0}")]
    Seed(SeedError),

    #[error("cluster index queried before finalize()")]
    IndexNotFinalized,

    #[error("cluster inserted after the index was finalized")]
    IndexFinalized,
}

impl From<SeedError> for RecoError {
    fn from(err: SeedError) -> Self {
        match err {
            SeedError::Detector(e) => RecoError::Detector(e),
            other => RecoError::Seed(other),
        }
    }
}

/// The vertex fit could not use a track.
#[derive(Clone, Debug, Error, PartialEq)]
pub enum VertexError {
    #[error("track direction has zero length")]
    ZeroDirection,

    #[error("track position covariance is singular in the plane transverse to the track")]
    SingularTrackCovariance,

    #[error("track point or covariance is not finite")]
    NonFinite,
}
