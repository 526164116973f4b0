//! Error types for geometry lookups.

use crate::geometry::RocKind;
use thiserror::Error;

/// A geometry lookup was asked for something the detector does not have.
///
/// These are configuration or caller bugs, never data conditions.
#[derive(Clone, Debug, Error, PartialEq)]
pub enum DetectorError {
    #[error("sector {sector} out of range (detector has {n_sectors} sectors)")]
    SectorOutOfRange { sector: u16, n_sectors: u16 },

    #[error("row {row} out of range for {roc:?} chamber ({n_rows} rows)")]
    RowOutOfRange { roc: RocKind, row: u16, n_rows: u16 },
}
