//! Cylindrical TPC geometry: read-out chambers, sectors, pad rows and drift.
//!
//! # Sector numbering
//! With `n = sectors_per_side` (18 by default) there are `4n` read-out
//! chambers:
//! - `0 .. n`     inner chambers, A side (z > 0)
//! - `n .. 2n`    inner chambers, C side (z < 0)
//! - `2n .. 3n`   outer chambers, A side
//! - `3n .. 4n`   outer chambers, C side
//!
//! Each chamber covers `360° / n` in azimuth; chamber `s` is centred at
//! `((s % n) + 0.5) * 360° / n`.
//!
//! # Rows
//! Rows are numbered per chamber. The *global* row of an outer-chamber row is
//! shifted by the number of inner rows, so global rows increase with radius.

use crate::error::DetectorError;
use serde::{Deserialize, Serialize};
use std::f64::consts::TAU;

/// Inner or outer read-out chamber (one detector "half" in radius).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RocKind {
    Inner,
    Outer,
}

/// Drift volume side.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Side {
    /// z > 0
    A,
    /// z < 0
    C,
}

impl Side {
    /// +1 for the A side, −1 for the C side.
    pub fn sign(self) -> f64 {
        match self {
            Side::A => 1.0,
            Side::C => -1.0,
        }
    }

    pub fn from_z(z: f64) -> Self {
        if z >= 0.0 {
            Side::A
        } else {
            Side::C
        }
    }
}

/// A validated read-out chamber address.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Sector {
    /// Raw chamber id (0 .. 4n)
    pub id: u16,
    pub roc: RocKind,
    pub side: Side,
    /// Azimuthal slot (0 .. n)
    pub azimuth_index: u16,
}

/// Geometry provider consumed by the reconstruction.
///
/// Implementations must be pure: the same question always gets the same
/// answer for the lifetime of a reconstruction run.
pub trait DetectorGeometry: Send + Sync {
    /// Number of azimuthal sectors on one side of one chamber type.
    fn sectors_per_side(&self) -> u16;

    /// Number of pad rows in a chamber type.
    fn n_rows(&self, roc: RocKind) -> u16;

    /// Radius (local x) of a pad row.
    fn pad_row_radius(&self, roc: RocKind, row: u16) -> Result<f64, DetectorError>;

    /// Drift length of a chamber (distance from the central electrode to the
    /// read-out plane).
    fn z_length(&self, sector: &Sector) -> f64;

    /// Electron drift velocity (cm/µs).
    fn drift_velocity(&self) -> f64;

    /// Radial envelope of the sensitive volume (inner, outer edge).
    fn sensitive_radius(&self) -> (f64, f64);

    fn n_sectors(&self) -> u16 {
        4 * self.sectors_per_side()
    }

    /// Decode a raw chamber id.
    fn sector(&self, id: u16) -> Result<Sector, DetectorError> {
        let n = self.sectors_per_side();
        if id >= self.n_sectors() {
            return Err(DetectorError::SectorOutOfRange {
                sector: id,
                n_sectors: self.n_sectors(),
            });
        }
        let roc = if id < 2 * n {
            RocKind::Inner
        } else {
            RocKind::Outer
        };
        let side = if (id / n) % 2 == 0 { Side::A } else { Side::C };
        Ok(Sector {
            id,
            roc,
            side,
            azimuth_index: id % n,
        })
    }

    /// Encode a chamber id from its parts.
    fn sector_id(&self, roc: RocKind, side: Side, azimuth_index: u16) -> u16 {
        let n = self.sectors_per_side();
        let roc_offset = match roc {
            RocKind::Inner => 0,
            RocKind::Outer => 2 * n,
        };
        let side_offset = match side {
            Side::A => 0,
            Side::C => n,
        };
        roc_offset + side_offset + azimuth_index % n
    }

    /// Azimuthal width of one sector (radians).
    fn sector_width(&self) -> f64 {
        TAU / f64::from(self.sectors_per_side())
    }

    /// Rotation angle of the local frame of a sector.
    fn sector_alpha(&self, sector: &Sector) -> f64 {
        (f64::from(sector.azimuth_index) + 0.5) * self.sector_width()
    }

    /// Azimuthal slot containing the global azimuth `phi`.
    fn azimuth_index(&self, phi: f64) -> u16 {
        let n = self.sectors_per_side();
        ((phi.rem_euclid(TAU) / self.sector_width()).floor() as u16) % n
    }

    /// Total number of rows over both chamber types.
    fn total_rows(&self) -> u16 {
        self.n_rows(RocKind::Inner) + self.n_rows(RocKind::Outer)
    }

    /// Row index counted from the innermost inner-chamber row.
    fn global_row(&self, sector: &Sector, row: u16) -> u16 {
        match sector.roc {
            RocKind::Inner => row,
            RocKind::Outer => row + self.n_rows(RocKind::Inner),
        }
    }

    /// Inverse of [`global_row`](Self::global_row).
    fn row_location(&self, global_row: u16) -> (RocKind, u16) {
        let n_inner = self.n_rows(RocKind::Inner);
        if global_row < n_inner {
            (RocKind::Inner, global_row)
        } else {
            (RocKind::Outer, global_row - n_inner)
        }
    }
}

/// A block of equally spaced pad rows.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PadRowRegion {
    /// Radius of the first row in the block (cm)
    pub first_radius: f64,
    /// Distance between neighbouring rows (cm)
    pub pitch: f64,
    pub n_rows: u16,
}

/// Default cylindrical TPC, dimensions close to a large LHC-style TPC.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TpcGeometry {
    pub sectors_per_side: u16,
    /// Pad-row blocks of the inner chamber, ordered by radius
    pub inner_rows: Vec<PadRowRegion>,
    /// Pad-row blocks of the outer chamber, ordered by radius
    pub outer_rows: Vec<PadRowRegion>,
    /// Drift length on each side (cm)
    pub z_length: f64,
    /// Drift velocity (cm/µs)
    pub drift_velocity: f64,
}

impl Default for TpcGeometry {
    fn default() -> Self {
        Self {
            sectors_per_side: 18,
            inner_rows: vec![PadRowRegion {
                first_radius: 85.225,
                pitch: 0.75,
                n_rows: 63,
            }],
            outer_rows: vec![
                PadRowRegion {
                    first_radius: 135.1,
                    pitch: 1.0,
                    n_rows: 64,
                },
                PadRowRegion {
                    first_radius: 199.35,
                    pitch: 1.5,
                    n_rows: 32,
                },
            ],
            z_length: 250.0,
            drift_velocity: 2.58,
        }
    }
}

impl TpcGeometry {
    fn regions(&self, roc: RocKind) -> &[PadRowRegion] {
        match roc {
            RocKind::Inner => &self.inner_rows,
            RocKind::Outer => &self.outer_rows,
        }
    }
}

impl DetectorGeometry for TpcGeometry {
    fn sectors_per_side(&self) -> u16 {
        self.sectors_per_side
    }

    fn n_rows(&self, roc: RocKind) -> u16 {
        self.regions(roc).iter().map(|r| r.n_rows).sum()
    }

    fn pad_row_radius(&self, roc: RocKind, row: u16) -> Result<f64, DetectorError> {
        let mut remaining = row;
        for region in self.regions(roc) {
            if remaining < region.n_rows {
                return Ok(region.first_radius + f64::from(remaining) * region.pitch);
            }
            remaining -= region.n_rows;
        }
        Err(DetectorError::RowOutOfRange {
            roc,
            row,
            n_rows: self.n_rows(roc),
        })
    }

    fn z_length(&self, _sector: &Sector) -> f64 {
        self.z_length
    }

    fn drift_velocity(&self) -> f64 {
        self.drift_velocity
    }

    fn sensitive_radius(&self) -> (f64, f64) {
        // pads extend half a pitch beyond the first and last row centres
        let first = self
            .inner_rows
            .first()
            .map(|r| r.first_radius - 0.5 * r.pitch)
            .unwrap_or(0.0);
        let last = self
            .outer_rows
            .last()
            .or_else(|| self.inner_rows.last())
            .map(|r| r.first_radius + (f64::from(r.n_rows.saturating_sub(1)) + 0.5) * r.pitch)
            .unwrap_or(first);
        (first, last)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
