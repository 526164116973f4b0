//! Per-sector, per-row cluster index with constant-time depth lookup.
//!
//! # Layout
//! [`ClusterIndex`] holds one [`SectorArray`] per chamber type. Each array has
//! `sectors_per_side` azimuthal slots, each slot one [`RowBin`] per pad row.
//! A bin collects the clusters of both drift sides separately (A side "left",
//! C side "right") while the batch is filled.
//!
//! # Fast lookup
//! `finalize()` merges left and right into one view sorted by depth and
//! builds a table over quantized depth buckets:
//!
//! bucket(d) = ⌊d + depth_offset⌋,  0 ≤ bucket < n_buckets
//!
//! `fast[b]` is the index of the last cluster whose bucket is `b`; empty
//! buckets repeat the previous entry, leading empty buckets point at 0. A
//! query therefore lands at (or just before) the first cluster deeper than
//! the requested bucket without any search.
//!
//! # Depth
//! Inserted clusters have their depth replaced by the drift time, so the
//! index is valid before the event time-zero is known.

use crate::{
    error::RecoError,
    types::{Cluster, ClusterKey},
};
use serde::{Deserialize, Serialize};
use tpc_detector::{DetectorError, DetectorGeometry, RocKind, Side};
use tracing::debug;

/// Depth quantization of the fast lookup.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterIndexConfig {
    /// Added to the depth before flooring
    pub depth_offset: f64,
    pub n_buckets: usize,
}

impl Default for ClusterIndexConfig {
    fn default() -> Self {
        Self {
            depth_offset: 255.0,
            n_buckets: 510,
        }
    }
}

impl ClusterIndexConfig {
    /// Bucket of a depth value, `None` outside the table.
    pub fn bucket(&self, depth: f64) -> Option<usize> {
        let b = (depth + self.depth_offset).floor();
        if b >= 0.0 && (b as usize) < self.n_buckets {
            Some(b as usize)
        } else {
            None
        }
    }

    /// Like [`bucket`](Self::bucket) but clamped to the table.
    pub fn clamped_bucket(&self, depth: f64) -> usize {
        let b = (depth + self.depth_offset).floor().max(0.0) as usize;
        b.min(self.n_buckets.saturating_sub(1))
    }
}

/// Largest pre-allocation a slot hint may ask for beyond the current fill.
const MAX_SLOT_RESERVE: usize = 4096;

/// Entry of the merged, depth-sorted view of a bin.
#[derive(Clone, Copy, Debug, PartialEq)]
struct SortedEntry {
    key: ClusterKey,
    side: Side,
    slot: usize,
}

/// Clusters of one (sector, row) position on both drift sides.
#[derive(Clone, Debug, Default)]
pub struct RowBin {
    left: Vec<Cluster>,
    right: Vec<Cluster>,
    sorted: Vec<SortedEntry>,
    fast: Vec<usize>,
}

impl RowBin {
    fn side_mut(&mut self, side: Side) -> &mut Vec<Cluster> {
        match side {
            Side::A => &mut self.left,
            Side::C => &mut self.right,
        }
    }

    fn insert(&mut self, cluster: Cluster, side: Side, slot_hint: usize) -> usize {
        let list = self.side_mut(side);
        let slot = list.len();
        if slot_hint != slot {
            debug!(slot_hint, slot, "slot hint differs from bin occupancy");
        }
        let extra = slot_hint.saturating_sub(slot);
        if slot_hint >= list.capacity() && extra < MAX_SLOT_RESERVE {
            list.reserve(extra + 1);
        }
        list.push(cluster);
        slot
    }

    fn finalize(&mut self, left_id: u16, right_id: u16, row: u16, config: &ClusterIndexConfig) {
        let left = &self.left;
        let right = &self.right;

        self.sorted.clear();
        self.sorted.extend((0..left.len()).map(|slot| SortedEntry {
            key: ClusterKey::new(left_id, row, slot),
            side: Side::A,
            slot,
        }));
        self.sorted.extend((0..right.len()).map(|slot| SortedEntry {
            key: ClusterKey::new(right_id, row, slot),
            side: Side::C,
            slot,
        }));
        let depth = |e: &SortedEntry| match e.side {
            Side::A => left[e.slot].z,
            Side::C => right[e.slot].z,
        };
        // stable: equal depths keep left-before-right insertion order
        self.sorted.sort_by(|a, b| depth(a).total_cmp(&depth(b)));

        let mut table: Vec<Option<usize>> = vec![None; config.n_buckets];
        for (i, entry) in self.sorted.iter().enumerate() {
            if let Some(b) = config.bucket(depth(entry)) {
                table[b] = Some(i);
            }
        }
        let mut last = 0;
        self.fast = table
            .into_iter()
            .map(|slot| {
                if let Some(i) = slot {
                    last = i;
                }
                last
            })
            .collect();
    }

    /// Clusters deposited on both sides.
    pub fn len(&self) -> usize {
        self.left.len() + self.right.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Clusters reachable through the sorted view.
    pub fn n_sorted(&self) -> usize {
        self.sorted.len()
    }

    /// i-th cluster in depth order.
    pub fn get(&self, i: usize) -> Option<(ClusterKey, &Cluster)> {
        let entry = self.sorted.get(i)?;
        let cluster = match entry.side {
            Side::A => self.left.get(entry.slot)?,
            Side::C => self.right.get(entry.slot)?,
        };
        Some((entry.key, cluster))
    }

    /// Depth-ordered iteration.
    pub fn iter(&self) -> impl Iterator<Item = (ClusterKey, &Cluster)> + '_ {
        (0..self.sorted.len()).filter_map(move |i| self.get(i))
    }

    /// Sorted index to start a search at for a depth bucket. Buckets past the
    /// table resolve to its last entry.
    pub fn nearest(&self, bucket: usize) -> usize {
        match self.fast.len() {
            0 => 0,
            n => self.fast[bucket.min(n - 1)],
        }
    }

    fn by_side(&self, side: Side, slot: usize) -> Option<&Cluster> {
        match side {
            Side::A => self.left.get(slot),
            Side::C => self.right.get(slot),
        }
    }
}

/// All sectors of one chamber type.
#[derive(Clone, Debug)]
pub struct SectorArray {
    pub roc: RocKind,
    /// [azimuth slot][row]
    bins: Vec<Vec<RowBin>>,
}

impl SectorArray {
    fn new(roc: RocKind, n_sectors: u16, n_rows: u16) -> Self {
        Self {
            roc,
            bins: (0..n_sectors)
                .map(|_| vec![RowBin::default(); usize::from(n_rows)])
                .collect(),
        }
    }

    fn bins(&self) -> impl Iterator<Item = &RowBin> {
        self.bins.iter().flatten()
    }
}

/// Index over all clusters of a batch.
#[derive(Clone)]
pub struct ClusterIndex<'g> {
    geometry: &'g dyn DetectorGeometry,
    config: ClusterIndexConfig,
    inner: SectorArray,
    outer: SectorArray,
    n_inserted: usize,
    finalized: bool,
}

impl<'g> ClusterIndex<'g> {
    pub fn new(geometry: &'g dyn DetectorGeometry, config: ClusterIndexConfig) -> Self {
        let n = geometry.sectors_per_side();
        Self {
            inner: SectorArray::new(RocKind::Inner, n, geometry.n_rows(RocKind::Inner)),
            outer: SectorArray::new(RocKind::Outer, n, geometry.n_rows(RocKind::Outer)),
            geometry,
            config,
            n_inserted: 0,
            finalized: false,
        }
    }

    pub fn config(&self) -> &ClusterIndexConfig {
        &self.config
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized
    }

    /// Clusters accepted by [`insert`](Self::insert).
    pub fn len(&self) -> usize {
        self.n_inserted
    }

    pub fn is_empty(&self) -> bool {
        self.n_inserted == 0
    }

    /// Clusters reachable through the sorted views.
    pub fn n_retrievable(&self) -> usize {
        self.inner.bins().chain(self.outer.bins()).map(RowBin::n_sorted).sum()
    }

    fn array(&self, roc: RocKind) -> &SectorArray {
        match roc {
            RocKind::Inner => &self.inner,
            RocKind::Outer => &self.outer,
        }
    }

    /// Place a cluster in its (sector, row) bin. The depth is replaced by the
    /// drift time. `slot_hint` is the expected position inside the bin side
    /// and only pre-sizes storage.
    pub fn insert(&mut self, cluster: &Cluster, slot_hint: usize) -> Result<ClusterKey, RecoError> {
        if self.finalized {
            return Err(RecoError::IndexFinalized);
        }
        let sector = self.geometry.sector(cluster.sector)?;
        let n_rows = self.geometry.n_rows(sector.roc);
        if cluster.row >= n_rows {
            return Err(DetectorError::RowOutOfRange {
                roc: sector.roc,
                row: cluster.row,
                n_rows,
            }
            .into());
        }

        let mut stored = *cluster;
        stored.z = stored.time_bin;

        let array = match sector.roc {
            RocKind::Inner => &mut self.inner,
            RocKind::Outer => &mut self.outer,
        };
        let bin = &mut array.bins[usize::from(sector.azimuth_index)][usize::from(cluster.row)];
        let slot = bin.insert(stored, sector.side, slot_hint);
        self.n_inserted += 1;
        Ok(ClusterKey::new(sector.id, cluster.row, slot))
    }

    /// Sort every bin and build its lookup table. Call once per batch.
    pub fn finalize(&mut self) {
        let geometry = self.geometry;
        for array in [&mut self.inner, &mut self.outer] {
            let roc = array.roc;
            for (az, rows) in array.bins.iter_mut().enumerate() {
                let az = az as u16;
                let left_id = geometry.sector_id(roc, Side::A, az);
                let right_id = geometry.sector_id(roc, Side::C, az);
                for (row, bin) in rows.iter_mut().enumerate() {
                    bin.finalize(left_id, right_id, row as u16, &self.config);
                }
            }
        }
        self.finalized = true;
        debug!(
            inserted = self.n_inserted,
            retrievable = self.n_retrievable(),
            "cluster index finalized"
        );
    }

    /// Bin of an azimuthal slot and row.
    pub fn row_bin(&self, roc: RocKind, azimuth_index: u16, row: u16) -> Result<&RowBin, RecoError> {
        if !self.finalized {
            return Err(RecoError::IndexNotFinalized);
        }
        let array = self.array(roc);
        let rows = array
            .bins
            .get(usize::from(azimuth_index))
            .ok_or(DetectorError::SectorOutOfRange {
                sector: azimuth_index,
                n_sectors: self.geometry.sectors_per_side(),
            })?;
        rows.get(usize::from(row)).ok_or_else(|| {
            DetectorError::RowOutOfRange {
                roc,
                row,
                n_rows: rows.len() as u16,
            }
            .into()
        })
    }

    /// Sorted index to start a depth search at.
    pub fn nearest(&self, roc: RocKind, azimuth_index: u16, row: u16, bucket: usize) -> Result<usize, RecoError> {
        Ok(self.row_bin(roc, azimuth_index, row)?.nearest(bucket))
    }

    /// Stored copy of a cluster.
    pub fn cluster(&self, key: ClusterKey) -> Result<Option<&Cluster>, RecoError> {
        let sector = self.geometry.sector(key.sector())?;
        let bin = self.row_bin(sector.roc, sector.azimuth_index, key.row())?;
        Ok(bin.by_side(sector.side, key.slot()))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
