//! `toy_sim` — Toy TPC events: helix particles, pad-row clusters, drift
//! times, distortions, presets and event files.

pub mod event_gen;
pub mod particle;
pub mod replay;
pub mod scenarios;

pub use event_gen::{EventGenerator, ToyEventConfig};
pub use particle::{ClusterNoise, ClusterTrail, Particle};
pub use replay::{load_events, save_events, EventFile};
pub use scenarios::{Scenario, ScenarioKind};

// ---------------------------------------------------------------------------
// End-to-end tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use tpc_detector::NoCorrection;
    use tpc_reco::{
        HelixPropagator, MaterialBudget, Providers, Reconstruction, ReconstructionConfig,
        ResolutionMetrics,
    };
    use tpc_reco::types::{ClusterSource, CorrectionMode};

    #[test]
    fn nominal_events_reconstruct_with_unit_pulls() {
        let scenario = Scenario::build(ScenarioKind::Nominal, 42);
        let events = scenario.generator().generate_batch(5);
        let propagator = HelixPropagator::new(scenario.events.bz, MaterialBudget::default());
        let providers = Providers {
            geometry: &scenario.geometry,
            correction: &NoCorrection,
            propagator: &propagator,
        };
        // true depth: the drift time alone cannot separate vertex z from t0
        let config = ReconstructionConfig {
            ideal_tracking: true,
            ..ReconstructionConfig::default()
        };
        let reco = Reconstruction::new(config, providers);

        let mut metrics = ResolutionMetrics::default();
        for event in &events {
            let output = reco.process_event(event, None).unwrap();
            metrics.accumulate(event, &output, &scenario.geometry);
        }

        assert!(metrics.n_candidates > 50);
        assert!(metrics.seed_efficiency() > 0.9, "{metrics:?}");
        assert_eq!(metrics.n_vertices, 5);
        for axis in 0..3 {
            assert!(metrics.vertex_residuals[axis].rms() < 0.1, "{metrics:?}");
        }
        assert!(metrics.time0_residual.rms() < 1.0, "{metrics:?}");
        for pull in metrics.pull_rms() {
            assert!(pull > 0.5 && pull < 2.0, "{metrics:?}");
        }
    }

    #[test]
    fn distorted_clusters_reconstruct_with_correction() {
        let scenario = Scenario::build(ScenarioKind::Distorted, 7);
        let events = scenario.generator().generate_batch(3);
        let propagator = HelixPropagator::new(scenario.events.bz, MaterialBudget::default());
        let distortion = scenario.events.distortion.clone().unwrap_or_default();
        let providers = Providers {
            geometry: &scenario.geometry,
            correction: &distortion,
            propagator: &propagator,
        };
        let config = ReconstructionConfig {
            cluster_source: ClusterSource::Distorted,
            correction: CorrectionMode::AverageEta,
            ..ReconstructionConfig::default()
        };
        let reco = Reconstruction::new(config, providers);

        let mut metrics = ResolutionMetrics::default();
        for event in &events {
            let output = reco.process_event(event, None).unwrap();
            assert_eq!(output.tracks.len(), event.tracks.len());
            metrics.accumulate(event, &output, &scenario.geometry);
        }
        assert!(metrics.seed_efficiency() > 0.9, "{metrics:?}");
        assert_eq!(metrics.n_vertices, 3);
        for axis in 0..2 {
            assert!(metrics.vertex_residuals[axis].rms() < 0.2, "{metrics:?}");
        }
    }
}
