//! `tpcreco` CLI: toy event generation, batch reconstruction, vertex fits.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use nalgebra::{Matrix3, Vector3};
use serde::{Deserialize, Serialize};
use std::io::{BufRead, BufReader, BufWriter};
use std::path::{Path, PathBuf};
use tpc_detector::{NoCorrection, PositionCorrection, SpaceChargeDistortion};
use tpc_reco::types::{ClusterSource, CorrectionMode};
use tpc_reco::{
    EventOutput, HelixPropagator, Providers, Reconstruction, ReconstructionConfig,
    ResolutionMetrics, Vertex, VertexFitConfig, VertexTrack,
};
use toy_sim::replay::{load_events, save_events, EventFile};
use toy_sim::scenarios::{Scenario, ScenarioKind};
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "tpcreco", about = "TPC track and vertex reconstruction CLI")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate toy events for a named scenario and save them.
    Simulate {
        #[arg(value_enum)]
        scenario: ScenarioKind,
        /// Random seed for reproducibility
        #[arg(long, default_value_t = 42)]
        seed: u64,
        /// Number of events (defaults to the scenario's)
        #[arg(long)]
        events: Option<usize>,
        /// Event file to write
        #[arg(long)]
        output: PathBuf,
    },
    /// Reconstruct tracks and vertices of an event file.
    Reconstruct {
        /// Event file written by `simulate`
        input: PathBuf,
        /// Reconstruction config (JSON); flags below override it
        #[arg(long)]
        config: Option<PathBuf>,
        #[arg(long, value_enum)]
        source: Option<ClusterSource>,
        #[arg(long, value_enum)]
        correction: Option<CorrectionMode>,
        /// Keep the true cluster depth instead of the drift-time position
        #[arg(long)]
        ideal_tracking: bool,
        /// Pick clusters from the event index instead of the candidate lists
        #[arg(long)]
        follow_in_index: bool,
        /// Stop after seeding
        #[arg(long)]
        no_fit: bool,
        #[arg(long)]
        no_vertex: bool,
        /// Reconstruct candidates on one thread
        #[arg(long)]
        sequential: bool,
        /// Per-event outputs (JSON)
        #[arg(long)]
        output: Option<PathBuf>,
        /// Resolution metrics (JSON)
        #[arg(long)]
        metrics: Option<PathBuf>,
    },
    /// Fit a primary vertex to straight-line tracks, one JSON object per line.
    Vertex {
        input: PathBuf,
        #[arg(long, default_value_t = 3.5)]
        chi_cut: f64,
        #[arg(long, default_value_t = 2)]
        min_tracks: usize,
        /// Beam spot x,y,z,σx,σy,σz (cm)
        #[arg(long, value_delimiter = ',')]
        beam: Option<Vec<f64>>,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Simulate {
            scenario,
            seed,
            events,
            output,
        } => run_simulate(scenario, seed, events, &output)?,
        Commands::Reconstruct {
            input,
            config,
            source,
            correction,
            ideal_tracking,
            follow_in_index,
            no_fit,
            no_vertex,
            sequential,
            output,
            metrics,
        } => {
            let mut cfg = match config {
                Some(path) => load_config(&path)?,
                None => ReconstructionConfig::default(),
            };
            if let Some(source) = source {
                cfg.cluster_source = source;
            }
            if let Some(correction) = correction {
                cfg.correction = correction;
            }
            cfg.ideal_tracking |= ideal_tracking;
            cfg.follow_in_index |= follow_in_index;
            cfg.do_track_fit &= !no_fit;
            cfg.fit_vertex &= !no_vertex;
            cfg.parallel &= !sequential;
            run_reconstruct(&input, cfg, output.as_deref(), metrics.as_deref())?;
        }
        Commands::Vertex {
            input,
            chi_cut,
            min_tracks,
            beam,
        } => {
            let config = VertexFitConfig {
                chi_cut,
                min_tracks,
                ..VertexFitConfig::default()
            };
            run_vertex(&input, &config, beam.as_deref())?;
        }
    }

    Ok(())
}

fn run_simulate(kind: ScenarioKind, seed: u64, n_events: Option<usize>, output: &Path) -> Result<()> {
    let scenario = Scenario::build(kind, seed);
    let n_events = n_events.unwrap_or(scenario.n_events);
    println!(
        "Generating scenario '{}' (seed={}, events={})...",
        scenario.name, seed, n_events
    );

    let start = std::time::Instant::now();
    let events = scenario.generator().generate_batch(n_events);
    let n_tracks: usize = events.iter().map(|e| e.tracks.len()).sum();
    println!(
        "Done: {} events, {} track candidates, elapsed={:.2}s",
        events.len(),
        n_tracks,
        start.elapsed().as_secs_f64()
    );

    let file = EventFile {
        scenario_name: scenario.name.clone(),
        seed,
        bz: scenario.events.bz,
        geometry: scenario.geometry.clone(),
        distortion: scenario.events.distortion.clone(),
        events,
    };
    save_events(&file, output).with_context(|| format!("writing {}", output.display()))?;
    println!("Events saved to {}", output.display());
    Ok(())
}

fn load_config(path: &Path) -> Result<ReconstructionConfig> {
    let file = std::fs::File::open(path).with_context(|| format!("opening {}", path.display()))?;
    let config = serde_json::from_reader(BufReader::new(file))
        .with_context(|| format!("parsing {}", path.display()))?;
    Ok(config)
}

fn run_reconstruct(
    input: &Path,
    mut config: ReconstructionConfig,
    output_path: Option<&Path>,
    metrics_path: Option<&Path>,
) -> Result<()> {
    let file = load_events(input).with_context(|| format!("reading {}", input.display()))?;
    if (config.bz - file.bz).abs() > 1e-9 {
        warn!(config = config.bz, file = file.bz, "field differs from the generated one, using the file's");
        config.bz = file.bz;
    }

    let propagator = HelixPropagator::new(config.bz, config.material.clone());
    let correction: Box<dyn PositionCorrection> = match config.correction {
        CorrectionMode::None => Box::new(NoCorrection),
        _ => Box::new(file.distortion.clone().unwrap_or_else(SpaceChargeDistortion::default)),
    };
    let providers = Providers {
        geometry: &file.geometry,
        correction: correction.as_ref(),
        propagator: &propagator,
    };
    let reco = Reconstruction::new(config, providers);

    println!(
        "Reconstructing {} events from '{}' (scenario {})...",
        file.events.len(),
        input.display(),
        file.scenario_name
    );
    let start = std::time::Instant::now();
    let mut outputs: Vec<EventOutput> = Vec::with_capacity(file.events.len());
    let mut metrics = ResolutionMetrics::default();
    for event in &file.events {
        let output = reco.process_event(event, None)?;
        metrics.accumulate(event, &output, &file.geometry);
        outputs.push(output);
    }
    info!(events = outputs.len(), "reconstruction finished");

    println!(
        "Done: {} candidates, seed efficiency {:.3}, {} vertices, elapsed={:.2}s",
        metrics.n_candidates,
        metrics.seed_efficiency(),
        metrics.n_vertices,
        start.elapsed().as_secs_f64()
    );
    let names = tpc_reco::metrics::PARAM_NAMES;
    for (i, name) in names.iter().enumerate() {
        println!(
            "  {:>5}: residual RMS {:.4e}  pull RMS {:.3}",
            name,
            metrics.residual_rms()[i],
            metrics.pull_rms()[i]
        );
    }
    println!(
        "  vertex RMS (x, y, z) = ({:.4}, {:.4}, {:.4}) cm, time0 RMS {:.4} µs",
        metrics.vertex_residuals[0].rms(),
        metrics.vertex_residuals[1].rms(),
        metrics.vertex_residuals[2].rms(),
        metrics.time0_residual.rms()
    );

    if let Some(path) = output_path {
        write_json(path, &outputs)?;
        println!("Outputs saved to {}", path.display());
    }
    if let Some(path) = metrics_path {
        write_json(path, &metrics)?;
        println!("Metrics saved to {}", path.display());
    }
    Ok(())
}

/// One straight-line track of the `vertex` input.
#[derive(Debug, Deserialize)]
struct LineInput {
    point: [f64; 3],
    direction: [f64; 3],
    /// Position covariance, row-major
    cov: [[f64; 3]; 3],
}

#[derive(Debug, Serialize)]
struct VertexReport<'a> {
    vertex: Option<&'a Vertex>,
    contributors: Vec<bool>,
}

fn run_vertex(input: &Path, config: &VertexFitConfig, beam: Option<&[f64]>) -> Result<()> {
    let file = std::fs::File::open(input).with_context(|| format!("opening {}", input.display()))?;
    let mut tracks = Vec::new();
    for (line_no, line) in BufReader::new(file).lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let parsed: LineInput =
            serde_json::from_str(&line).with_context(|| format!("line {}", line_no + 1))?;
        let cov = Matrix3::from_fn(|r, c| parsed.cov[r][c]);
        let track = VertexTrack::new(Vector3::from(parsed.point), Vector3::from(parsed.direction), cov)
            .with_context(|| format!("line {}", line_no + 1))?;
        tracks.push(track);
    }

    let mut vertex = Vertex::new();
    match beam {
        Some(&[x, y, z, sx, sy, sz]) => vertex.set_beam_constraint(x, y, z, sx, sy, sz),
        Some(other) => bail!("--beam needs 6 values, got {}", other.len()),
        None => {}
    }
    let flags = vertex.construct_primary_vertex(&tracks, config);
    let report = VertexReport {
        vertex: flags.as_ref().map(|_| &vertex),
        contributors: flags.clone().unwrap_or_default(),
    };
    println!("{}", serde_json::to_string_pretty(&report)?);
    if flags.is_none() {
        warn!(tracks = tracks.len(), min = config.min_tracks, "too few tracks for a vertex");
    }
    Ok(())
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let file = std::fs::File::create(path).with_context(|| format!("creating {}", path.display()))?;
    serde_json::to_writer_pretty(BufWriter::new(file), value)?;
    Ok(())
}
