//! Event files: serialize/deserialize generated events for offline
//! reconstruction.

use serde::{Deserialize, Serialize};
use std::io::{BufReader, BufWriter};
use std::path::Path;
use tpc_detector::{SpaceChargeDistortion, TpcGeometry};
use tpc_reco::types::Event;

/// A recorded batch of events with the conditions they were generated in.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EventFile {
    pub scenario_name: String,
    pub seed: u64,
    /// Solenoid field (kG)
    pub bz: f64,
    pub geometry: TpcGeometry,
    /// Distortion of the distorted cluster copies, if any
    pub distortion: Option<SpaceChargeDistortion>,
    pub events: Vec<Event>,
}

/// Save an event file as JSON.
pub fn save_events(file: &EventFile, path: &Path) -> anyhow::Result<()> {
    let out = std::fs::File::create(path)?;
    let writer = BufWriter::new(out);
    serde_json::to_writer(writer, file)?;
    Ok(())
}

/// Load an event file from JSON.
pub fn load_events(path: &Path) -> anyhow::Result<EventFile> {
    let file = std::fs::File::open(path)?;
    let reader = BufReader::new(file);
    let events: EventFile = serde_json::from_reader(reader)?;
    Ok(events)
}
