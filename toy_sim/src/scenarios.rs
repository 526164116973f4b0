//! Named event presets.
//!
//! Each scenario fixes the generator configuration and the number of events.
//! All scenarios are deterministic given the same seed.

use crate::event_gen::{EventGenerator, ToyEventConfig};
use crate::particle::ClusterNoise;
use serde::{Deserialize, Serialize};
use tpc_detector::{SpaceChargeDistortion, TpcGeometry};

/// Which pre-defined scenario to load.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, clap::ValueEnum)]
pub enum ScenarioKind {
    /// Few high-pT tracks, noise-free clusters
    Clean,
    /// 20 tracks per event, nominal cluster resolution
    Nominal,
    /// Nominal events with space-charge distorted cluster copies
    Distorted,
    /// 200 low-pT tracks per event
    HighMultiplicity,
}

/// A fully configured simulation scenario.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Scenario {
    pub name: String,
    pub seed: u64,
    pub n_events: usize,
    pub geometry: TpcGeometry,
    pub events: ToyEventConfig,
}

impl Scenario {
    /// Build the named scenario. Uses `seed` for repeatability.
    pub fn build(kind: ScenarioKind, seed: u64) -> Self {
        let (name, n_events, events) = match kind {
            ScenarioKind::Clean => (
                "clean",
                5,
                ToyEventConfig {
                    n_tracks: 5,
                    pt_min: 1.0,
                    pt_max: 10.0,
                    noise: ClusterNoise {
                        sigma_y: 0.0,
                        sigma_z: 0.0,
                    },
                    ..ToyEventConfig::default()
                },
            ),
            ScenarioKind::Nominal => ("nominal", 20, ToyEventConfig::default()),
            ScenarioKind::Distorted => (
                "distorted",
                20,
                ToyEventConfig {
                    distortion: Some(SpaceChargeDistortion::default()),
                    ..ToyEventConfig::default()
                },
            ),
            ScenarioKind::HighMultiplicity => (
                "high_multiplicity",
                10,
                ToyEventConfig {
                    n_tracks: 200,
                    pt_min: 0.2,
                    pt_max: 2.0,
                    ..ToyEventConfig::default()
                },
            ),
        };
        Scenario {
            name: name.into(),
            seed,
            n_events,
            geometry: TpcGeometry::default(),
            events,
        }
    }

    pub fn generator(&self) -> EventGenerator {
        EventGenerator::new(self.events.clone(), self.geometry.clone(), self.seed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn distorted_preset_carries_distortion() {
        assert!(Scenario::build(ScenarioKind::Distorted, 0).events.distortion.is_some());
        assert!(Scenario::build(ScenarioKind::Nominal, 0).events.distortion.is_none());
    }

    #[test]
    fn clean_preset_is_noise_free() {
        let scenario = Scenario::build(ScenarioKind::Clean, 9);
        let event = scenario.generator().generate();
        for track in &event.tracks {
            assert_eq!(track.clusters[0].sigma_y2, 0.0);
        }
    }
}
