//! Toy collision generator.
//!
//! Every event draws a vertex and a time-zero, then `n_tracks` particles
//! with uniform pT, φ and η. Each particle is walked through the pad rows
//! (see [`Particle::clusters`]); particles leaving fewer than
//! `min_clusters` clusters are dropped. All randomness comes from one
//! `ChaCha8Rng`, so a seed fully determines the event sequence.

use crate::particle::{ClusterNoise, Particle};
use rand::prelude::*;
use rand_chacha::ChaCha8Rng;
use rand_distr::Normal;
use serde::{Deserialize, Serialize};
use std::f64::consts::TAU;
use tpc_detector::{SpaceChargeDistortion, TpcGeometry};
use tpc_reco::{
    propagation::{HelixPropagator, MaterialBudget},
    types::{Event, TrackCandidate},
};
use tracing::debug;

/// Parameters of the toy events.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ToyEventConfig {
    /// Particles generated per event
    pub n_tracks: usize,
    /// Transverse momentum range (GeV)
    pub pt_min: f64,
    pub pt_max: f64,
    /// |η| range
    pub eta_max: f64,
    /// Vertex spread (cm)
    pub sigma_vertex_xy: f64,
    pub sigma_vertex_z: f64,
    /// Time-zero spread around zero (µs)
    pub sigma_t0: f64,
    pub noise: ClusterNoise,
    /// Distortion applied to the distorted cluster copies
    pub distortion: Option<SpaceChargeDistortion>,
    /// Candidates with fewer clusters are dropped
    pub min_clusters: usize,
    /// Solenoid field (kG)
    pub bz: f64,
}

impl Default for ToyEventConfig {
    fn default() -> Self {
        Self {
            n_tracks: 20,
            pt_min: 0.3,
            pt_max: 5.0,
            eta_max: 0.9,
            sigma_vertex_xy: 0.01,
            sigma_vertex_z: 5.0,
            sigma_t0: 2.0,
            noise: ClusterNoise::default(),
            distortion: None,
            min_clusters: 20,
            bz: 5.0,
        }
    }
}

/// Deterministic event source.
pub struct EventGenerator {
    pub config: ToyEventConfig,
    pub geometry: TpcGeometry,
    propagator: HelixPropagator,
    rng: ChaCha8Rng,
    next_id: u64,
}

impl EventGenerator {
    pub fn new(config: ToyEventConfig, geometry: TpcGeometry, seed: u64) -> Self {
        let propagator = HelixPropagator::new(config.bz, MaterialBudget::default());
        Self {
            config,
            geometry,
            propagator,
            rng: ChaCha8Rng::seed_from_u64(seed),
            next_id: 0,
        }
    }

    fn gauss(&mut self, sigma: f64) -> f64 {
        match Normal::new(0.0, sigma.max(0.0)) {
            Ok(d) => d.sample(&mut self.rng),
            Err(_) => 0.0,
        }
    }

    fn particle(&mut self, vertex: [f64; 3]) -> Particle {
        let cfg = &self.config;
        let (pt_min, pt_max, eta_max) = (cfg.pt_min, cfg.pt_max.max(cfg.pt_min), cfg.eta_max.abs());
        Particle {
            vertex,
            pt: pt_min + self.rng.gen::<f64>() * (pt_max - pt_min),
            phi: self.rng.gen::<f64>() * TAU,
            eta: (2.0 * self.rng.gen::<f64>() - 1.0) * eta_max,
            charge: if self.rng.gen_bool(0.5) { 1 } else { -1 },
        }
    }

    /// Generate the next event.
    pub fn generate(&mut self) -> Event {
        let id = self.next_id;
        self.next_id += 1;

        let vertex = [
            self.gauss(self.config.sigma_vertex_xy),
            self.gauss(self.config.sigma_vertex_xy),
            self.gauss(self.config.sigma_vertex_z),
        ];
        let t0 = self.gauss(self.config.sigma_t0);

        let mut tracks = Vec::with_capacity(self.config.n_tracks);
        for _ in 0..self.config.n_tracks {
            let particle = self.particle(vertex);
            let trail = particle.clusters(
                &self.geometry,
                &self.propagator,
                t0,
                &self.config.noise,
                self.config.distortion.as_ref(),
                &mut self.rng,
            );
            if trail.clusters.len() < self.config.min_clusters {
                debug!(event = id, pt = particle.pt, n = trail.clusters.len(), "particle dropped");
                continue;
            }
            tracks.push(TrackCandidate {
                truth: particle.truth(),
                clusters: trail.clusters,
                distorted_clusters: trail.distorted,
            });
        }

        Event {
            id,
            vertex,
            t0,
            tracks,
        }
    }

    /// Generate `n` consecutive events.
    pub fn generate_batch(&mut self, n: usize) -> Vec<Event> {
        (0..n).map(|_| self.generate()).collect()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
