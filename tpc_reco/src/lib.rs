//! `tpc_reco` — TPC track reconstruction and primary-vertex finding.
//!
//! # Module layout
//! - [`types`]         — Clusters, space points, candidates, events, providers
//! - [`track_param`]   — Helix parameters: rotate, propagate, Kalman update
//! - [`propagation`]   — Stepped helix propagator with material corrections
//! - [`cluster_index`] — Per-row cluster bins sorted in depth, fast lookup
//! - [`seeding`]       — Three-point helix seeds, time-zero estimate
//! - [`fitter`]        — Kalman fit over clusters or through the index
//! - [`vertex`]        — Straight-line vertex fit with outlier rejection
//! - [`pipeline`]      — Per-event reconstruction orchestrator
//! - [`metrics`]       — Residuals, pulls, failure counters
//! - [`error`]         — Error families

pub mod cluster_index;
pub mod error;
pub mod fitter;
pub mod metrics;
pub mod pipeline;
pub mod propagation;
pub mod seeding;
pub mod track_param;
pub mod types;
pub mod vertex;

#[cfg(test)]
mod testutil;

pub use cluster_index::{ClusterIndex, ClusterIndexConfig};
pub use error::{RecoError, SeedError, TrackError, VertexError};
pub use fitter::{FitConfig, FitResult, FitTermination, TrackFitter};
pub use metrics::ResolutionMetrics;
pub use pipeline::{EventOutput, Reconstruction, ReconstructionConfig, TrackReco};
pub use propagation::{HelixPropagator, MaterialBudget, PropagationOptions, Propagator};
pub use seeding::{SeedBuilder, SeedConfig, SeedPass};
pub use track_param::TrackParam;
pub use types::{
    Cluster, ClusterKey, ClusterSource, CorrectionMode, Event, PointConversion, Providers,
    ReferenceSurface, TrackCandidate, TrackPoint,
};
pub use vertex::{Vertex, VertexFitConfig, VertexTrack};
