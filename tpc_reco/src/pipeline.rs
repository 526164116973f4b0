//! Reconstruction orchestrator: tracks and primary vertex of one event.
//!
//! # Processing steps per track candidate
//! 1. Time-zero seed (depth = drift time), propagated to the beam axis
//! 2. Event time-zero from the seed's z at the axis
//! 3. Physical seed with the estimated time-zero
//! 4. Fit through the candidate's clusters, or follow through the cluster
//!    index when `follow_in_index` is set
//! 5. Seed also propagated to the axis, for comparison with the fit
//!
//! # Per event
//! Candidates are reconstructed in parallel (rayon), results kept in input
//! order. Fitted tracks that reached their reference surface feed the
//! primary-vertex fit.
//!
//! A candidate that cannot be seeded or fitted is recorded with its reason;
//! only contract violations abort the event.

use crate::{
    cluster_index::{ClusterIndex, ClusterIndexConfig},
    error::{RecoError, SeedError},
    fitter::{FitConfig, FitResult, TrackFitter},
    propagation::{MaterialBudget, PropagationOptions},
    seeding::{SeedBuilder, SeedConfig, SeedPass},
    track_param::TrackParam,
    types::{ClusterSource, CorrectionMode, Event, PointConversion, Providers, TrackCandidate},
    vertex::{Vertex, VertexFitConfig, VertexTrack},
};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::{collections::HashMap, time::Instant};
use tracing::{debug, info, warn};

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

/// Configuration of a reconstruction run.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconstructionConfig {
    /// Solenoid field (kG)
    pub bz: f64,
    pub material: MaterialBudget,
    /// Which cluster list of the candidates is reconstructed
    pub cluster_source: ClusterSource,
    pub correction: CorrectionMode,
    /// Keep the true cluster z instead of the drift-time position
    pub ideal_tracking: bool,
    /// Run the fit after seeding
    pub do_track_fit: bool,
    /// Pick clusters from the event index instead of the candidate's list
    pub follow_in_index: bool,
    pub fit_vertex: bool,
    /// Optional beam spot (x, y, z, σx, σy, σz) for the vertex fit
    pub beam_spot: Option<[f64; 6]>,
    /// Reconstruct candidates in parallel
    pub parallel: bool,
    pub seed: SeedConfig,
    pub fit: FitConfig,
    pub index: ClusterIndexConfig,
    pub vertex: VertexFitConfig,
}

impl Default for ReconstructionConfig {
    fn default() -> Self {
        Self {
            bz: 5.0,
            material: MaterialBudget::default(),
            cluster_source: ClusterSource::Ideal,
            correction: CorrectionMode::None,
            ideal_tracking: false,
            do_track_fit: true,
            follow_in_index: false,
            fit_vertex: true,
            beam_spot: None,
            parallel: true,
            seed: SeedConfig::default(),
            fit: FitConfig::default(),
            index: ClusterIndexConfig::default(),
            vertex: VertexFitConfig::default(),
        }
    }
}

impl ReconstructionConfig {
    pub fn conversion(&self) -> PointConversion {
        PointConversion {
            correction: self.correction,
            ideal_tracking: self.ideal_tracking,
        }
    }
}

// ---------------------------------------------------------------------------
// Outputs
// ---------------------------------------------------------------------------

/// Reconstruction record of one candidate.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TrackReco {
    /// Position of the candidate in the event
    pub candidate: usize,
    pub t0_seed: Option<TrackParam>,
    pub time0: Option<f64>,
    pub seed: Option<TrackParam>,
    /// Physical seed propagated to the beam axis
    pub seed_at_axis: Option<TrackParam>,
    pub fit: Option<FitResult>,
    /// First reason the chain stopped
    pub failure: Option<String>,
}

impl TrackReco {
    fn new(candidate: usize) -> Self {
        Self {
            candidate,
            ..Self::default()
        }
    }

    /// Record a recoverable seeding failure, escalate contract violations.
    fn skipped(mut self, err: SeedError) -> Result<Self, RecoError> {
        if !err.is_recoverable() {
            return Err(err.into());
        }
        debug!(candidate = self.candidate, error = %err, "candidate not seeded");
        self.failure = Some(err.to_string());
        Ok(self)
    }
}

/// Outputs of one event.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EventOutput {
    pub event_id: u64,
    pub tracks: Vec<TrackReco>,
    /// `None` when the vertex fit was disabled or had too few tracks
    pub vertex: Option<Vertex>,
    /// Candidate indices that entered the vertex fit
    pub vertex_candidates: Vec<usize>,
    /// Contributor flags, parallel to `vertex_candidates`
    pub vertex_contributors: Vec<bool>,
    /// Timings in microseconds
    pub timing_tracks_us: u64,
    pub timing_vertex_us: u64,
    pub total_time_us: u64,
}

// ---------------------------------------------------------------------------
// Reconstruction
// ---------------------------------------------------------------------------

/// Event reconstruction against injected providers.
pub struct Reconstruction<'a> {
    pub config: ReconstructionConfig,
    providers: Providers<'a>,
}

impl<'a> Reconstruction<'a> {
    pub fn new(config: ReconstructionConfig, providers: Providers<'a>) -> Self {
        Self { config, providers }
    }

    pub fn seed_builder(&self) -> SeedBuilder<'a> {
        SeedBuilder::new(self.config.seed.clone(), self.config.conversion(), self.providers)
    }

    pub fn fitter(&self) -> TrackFitter<'a> {
        TrackFitter::new(self.config.fit.clone(), self.config.conversion(), self.providers)
    }

    /// Index over the selected clusters of all `events`.
    pub fn build_index(&self, events: &[Event]) -> Result<ClusterIndex<'a>, RecoError> {
        let mut index = ClusterIndex::new(self.providers.geometry, self.config.index.clone());
        let mut occupancy: HashMap<(u16, u16), usize> = HashMap::new();
        for event in events {
            for candidate in &event.tracks {
                for cluster in candidate.clusters(self.config.cluster_source) {
                    let slot = occupancy.entry((cluster.sector, cluster.row)).or_default();
                    index.insert(cluster, *slot)?;
                    *slot += 1;
                }
            }
        }
        index.finalize();
        Ok(index)
    }

    /// Two-pass reconstruction of one candidate.
    pub fn reconstruct_track(
        &self,
        candidate_idx: usize,
        candidate: &TrackCandidate,
        index: Option<&ClusterIndex<'_>>,
    ) -> Result<TrackReco, RecoError> {
        let seeder = self.seed_builder();
        let source = self.config.cluster_source;
        let clusters = candidate.clusters(source);
        let mut reco = TrackReco::new(candidate_idx);

        let t0_seed = match seeder.build(clusters, source, SeedPass::TimeZero) {
            Ok(seed) => seed,
            Err(err) => return reco.skipped(err),
        };
        reco.t0_seed = Some(t0_seed);
        let time0 = match seeder.time0_from_seed(&t0_seed) {
            Ok(time0) => time0,
            Err(err) => return reco.skipped(err),
        };
        reco.time0 = Some(time0);

        let seed = match seeder.build(clusters, source, SeedPass::Physical { time0 }) {
            Ok(seed) => seed,
            Err(err) => return reco.skipped(err),
        };
        reco.seed = Some(seed);

        if self.config.do_track_fit {
            let fitter = self.fitter();
            let reference = candidate.reference();
            let fit = match index.filter(|_| self.config.follow_in_index) {
                Some(index) => fitter.follow_in_index(&seed, index, &reference, time0)?,
                None => fitter.fit(&seed, clusters, &reference, time0)?,
            };
            if !fit.is_complete() {
                warn!(
                    candidate = candidate_idx,
                    termination = ?fit.termination,
                    updates = fit.n_updates,
                    reached_reference = fit.reached_reference,
                    "track fit incomplete"
                );
                reco.failure = Some(format!(
                    "fit ended with {:?} after {} updates",
                    fit.termination, fit.n_updates
                ));
            }
            reco.fit = Some(fit);
        }

        let mut at_axis = seed;
        let options = PropagationOptions {
            mass: self.config.fit.mass,
            max_step: 5.0,
            rotate_to_local: true,
            max_snp: self.config.fit.max_snp,
            use_material: false,
        };
        let reached = self.providers.propagator.propagate_to(&mut at_axis, 0.0, &options);
        // stepping may stop just short of the axis, where the frame turns fast
        if reached.is_ok() || at_axis.x.abs() <= self.config.seed.axis_tolerance {
            reco.seed_at_axis = Some(at_axis);
        }
        Ok(reco)
    }

    /// Primary vertex from the fitted tracks.
    pub fn fit_vertex(&self, tracks: &[TrackReco]) -> (Option<Vertex>, Vec<usize>, Vec<bool>) {
        let (candidates, vertex_tracks): (Vec<usize>, Vec<VertexTrack>) = tracks
            .iter()
            .filter_map(|t| {
                let fit = t.fit.as_ref().filter(|f| f.reached_reference)?;
                let vt = VertexTrack::from_track_param(&fit.track).ok()?;
                Some((t.candidate, vt))
            })
            .unzip();

        let mut vertex = Vertex::new();
        if let Some([x, y, z, sx, sy, sz]) = self.config.beam_spot {
            vertex.set_beam_constraint(x, y, z, sx, sy, sz);
        }
        match vertex.construct_primary_vertex(&vertex_tracks, &self.config.vertex) {
            Some(flags) => (Some(vertex), candidates, flags),
            None => (None, candidates, Vec::new()),
        }
    }

    /// Reconstruct one event. With `follow_in_index` set and no `index`
    /// given, an index over this event alone is built.
    pub fn process_event(&self, event: &Event, index: Option<&ClusterIndex<'_>>) -> Result<EventOutput, RecoError> {
        let start_total = Instant::now();

        let own_index = match (index, self.config.follow_in_index) {
            (None, true) => Some(self.build_index(std::slice::from_ref(event))?),
            _ => None,
        };
        let index = index.or(own_index.as_ref());

        // ── Tracks ────────────────────────────────────────────────────────
        let t0 = Instant::now();
        let results: Vec<Result<TrackReco, RecoError>> = if self.config.parallel {
            event
                .tracks
                .par_iter()
                .enumerate()
                .map(|(i, c)| self.reconstruct_track(i, c, index))
                .collect()
        } else {
            event
                .tracks
                .iter()
                .enumerate()
                .map(|(i, c)| self.reconstruct_track(i, c, index))
                .collect()
        };
        let tracks = results.into_iter().collect::<Result<Vec<_>, _>>()?;
        let timing_tracks_us = t0.elapsed().as_micros() as u64;

        // ── Vertex ────────────────────────────────────────────────────────
        let t0 = Instant::now();
        let (vertex, vertex_candidates, vertex_contributors) = if self.config.fit_vertex {
            self.fit_vertex(&tracks)
        } else {
            (None, Vec::new(), Vec::new())
        };
        let timing_vertex_us = t0.elapsed().as_micros() as u64;

        let n_fitted = tracks.iter().filter(|t| t.fit.is_some()).count();
        info!(
            event = event.id,
            candidates = event.tracks.len(),
            fitted = n_fitted,
            vertex_ndf = vertex.as_ref().map(|v| v.ndf),
            "event reconstructed"
        );

        Ok(EventOutput {
            event_id: event.id,
            tracks,
            vertex,
            vertex_candidates,
            vertex_contributors,
            timing_tracks_us,
            timing_vertex_us,
            total_time_us: start_total.elapsed().as_micros() as u64,
        })
    }

    /// Reconstruct a batch of events. Events overlap in drift time, so index
    /// following uses one index per event.
    pub fn process_events(&self, events: &[Event]) -> Result<Vec<EventOutput>, RecoError> {
        events.iter().map(|e| self.process_event(e, None)).collect()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{propagation::HelixPropagator, testutil::ToyTrack};
    use approx::assert_abs_diff_eq;
    use tpc_detector::{DetectorGeometry, NoCorrection, TpcGeometry};

    fn event(geo: &TpcGeometry, prop: &HelixPropagator, t0: f64) -> Event {
        let toys = [
            ToyTrack::new(1.0, 0.4, 0.3, 1, 0.0),
            ToyTrack::new(0.8, 2.1, -0.2, -1, 0.0),
            ToyTrack::new(2.5, -1.2, 0.6, 1, 0.0),
            ToyTrack::new(1.5, -2.8, -0.5, -1, 0.0),
        ];
        Event {
            id: 7,
            vertex: [0.0; 3],
            t0,
            tracks: toys
                .iter()
                .map(|toy| {
                    let clusters = toy.clusters(geo, prop, t0);
                    TrackCandidate {
                        truth: toy.truth(),
                        distorted_clusters: clusters.clone(),
                        clusters,
                    }
                })
                .collect(),
        }
    }

    #[test]
    fn event_reconstruction_finds_tracks_and_vertex() {
        let geo = TpcGeometry::default();
        let prop = HelixPropagator::default();
        let providers = Providers {
            geometry: &geo,
            correction: &NoCorrection,
            propagator: &prop,
        };
        let reco = Reconstruction::new(ReconstructionConfig::default(), providers);
        let ev = event(&geo, &prop, 4.0);
        let out = reco.process_event(&ev, None).unwrap();

        assert_eq!(out.tracks.len(), 4);
        for (i, t) in out.tracks.iter().enumerate() {
            assert_eq!(t.candidate, i);
            assert_abs_diff_eq!(t.time0.unwrap(), 4.0, epsilon = 1e-3);
            let fit = t.fit.as_ref().unwrap();
            assert!(fit.is_complete(), "{fit:?}");
        }
        let vertex = out.vertex.unwrap();
        assert_eq!(out.vertex_contributors, vec![true; 4]);
        assert_eq!(vertex.ndf, 5);
        assert_abs_diff_eq!(vertex.position.z, 0.0, epsilon = 1e-3);
    }

    #[test]
    fn parallel_and_sequential_agree() {
        let geo = TpcGeometry::default();
        let prop = HelixPropagator::default();
        let providers = Providers {
            geometry: &geo,
            correction: &NoCorrection,
            propagator: &prop,
        };
        let ev = event(&geo, &prop, 1.0);
        let par = Reconstruction::new(ReconstructionConfig::default(), providers)
            .process_event(&ev, None)
            .unwrap();
        let seq = Reconstruction::new(
            ReconstructionConfig {
                parallel: false,
                ..ReconstructionConfig::default()
            },
            providers,
        )
        .process_event(&ev, None)
        .unwrap();
        assert_eq!(par.tracks, seq.tracks);
    }

    #[test]
    fn short_candidate_is_recorded_not_fatal() {
        let geo = TpcGeometry::default();
        let prop = HelixPropagator::default();
        let providers = Providers {
            geometry: &geo,
            correction: &NoCorrection,
            propagator: &prop,
        };
        let mut ev = event(&geo, &prop, 0.0);
        ev.tracks[1].clusters.truncate(2);
        let out = Reconstruction::new(ReconstructionConfig::default(), providers)
            .process_event(&ev, None)
            .unwrap();
        assert!(out.tracks[1].seed.is_none());
        assert!(out.tracks[1].failure.as_deref().unwrap_or("").contains("insufficient"));
        assert_eq!(out.vertex_candidates, vec![0, 2, 3]);
    }

    #[test]
    fn index_following_mode_runs_end_to_end() {
        let geo = TpcGeometry::default();
        let prop = HelixPropagator::default();
        let providers = Providers {
            geometry: &geo,
            correction: &NoCorrection,
            propagator: &prop,
        };
        let config = ReconstructionConfig {
            follow_in_index: true,
            ..ReconstructionConfig::default()
        };
        let ev = event(&geo, &prop, 2.0);
        let out = Reconstruction::new(config, providers).process_event(&ev, None).unwrap();
        for (t, candidate) in out.tracks.iter().zip(&ev.tracks) {
            let fit = t.fit.as_ref().unwrap();
            assert!(fit.reached_reference);
            assert!(2 * fit.n_updates >= candidate.clusters.len(), "{fit:?}");
        }
    }

    #[test]
    fn c_side_event_keeps_every_track() {
        let geo = TpcGeometry::default();
        let prop = HelixPropagator::default();
        let providers = Providers {
            geometry: &geo,
            correction: &NoCorrection,
            propagator: &prop,
        };
        let vz = -6.0;
        let t0 = 3.0;
        let toys = [
            ToyTrack::new(1.0, 0.4, -0.3, 1, vz),
            ToyTrack::new(0.8, 2.1, -0.2, -1, vz),
            ToyTrack::new(2.5, -1.2, -0.6, 1, vz),
        ];
        let ev = Event {
            id: 9,
            vertex: [0.0, 0.0, vz],
            t0,
            tracks: toys
                .iter()
                .map(|toy| {
                    let clusters = toy.clusters(&geo, &prop, t0);
                    TrackCandidate {
                        truth: toy.truth(),
                        distorted_clusters: clusters.clone(),
                        clusters,
                    }
                })
                .collect(),
        };
        let config = ReconstructionConfig {
            ideal_tracking: true,
            ..ReconstructionConfig::default()
        };
        let out = Reconstruction::new(config, providers).process_event(&ev, None).unwrap();

        for t in &out.tracks {
            // vz seen through the C-side drift direction
            assert_abs_diff_eq!(t.time0.unwrap(), t0 + vz / geo.drift_velocity(), epsilon = 1e-3);
            let fit = t.fit.as_ref().unwrap();
            assert!(fit.is_complete(), "{fit:?}");
            assert_abs_diff_eq!(fit.track.z(), vz, epsilon = 1e-3);
        }
        assert_eq!(out.vertex_contributors, vec![true; 3]);
        assert_abs_diff_eq!(out.vertex.unwrap().position.z, vz, epsilon = 1e-3);
    }
}
