//! `tpc_detector` — TPC read-out geometry and space-point correction models.

pub mod correction;
pub mod error;
pub mod geometry;

pub use correction::{NoCorrection, PositionCorrection, SpaceChargeDistortion};
pub use error::DetectorError;
pub use geometry::{DetectorGeometry, PadRowRegion, RocKind, Sector, Side, TpcGeometry};
