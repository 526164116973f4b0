//! Noise-free helix tracks for unit tests.

use crate::{
    propagation::{HelixPropagator, PropagationOptions, Propagator},
    track_param::TrackParam,
    types::{Cluster, ParamCov, ParamVec},
};
use nalgebra::Vector3;
use tpc_detector::{DetectorGeometry, Side, TpcGeometry};

pub struct ToyTrack {
    truth: TrackParam,
}

impl ToyTrack {
    /// Track from the origin (shifted to `vz`) with momentum azimuth `phi`.
    pub fn new(pt: f64, phi: f64, tgl: f64, charge: i8, vz: f64) -> Self {
        let params = ParamVec::new(0.0, vz, 0.0, tgl, f64::from(charge) / pt);
        Self {
            truth: TrackParam::new(0.0, phi, params, ParamCov::identity() * 1e-4),
        }
    }

    pub fn truth(&self) -> TrackParam {
        self.truth
    }

    /// Global position where the track crosses radius `r`.
    pub fn global_at_radius(&self, prop: &HelixPropagator, r: f64) -> Vector3<f64> {
        let mut t = self.truth;
        let opts = PropagationOptions::default().with_rotation(true).with_step(2.0);
        prop.propagate_to(&mut t, r, &opts).unwrap();
        t.global_position()
    }

    /// One cluster per crossed pad row, in the local frame of the crossed sector.
    pub fn clusters(&self, geo: &TpcGeometry, prop: &HelixPropagator, t0: f64) -> Vec<Cluster> {
        let opts = PropagationOptions::default();
        let n = geo.sectors_per_side();
        let half_width = (geo.sector_width() / 2.0).tan();
        let mut track = self.truth;
        let mut out = Vec::new();

        for global_row in 0..geo.total_rows() {
            let (roc, row) = geo.row_location(global_row);
            let radius = geo.pad_row_radius(roc, row).unwrap();
            let pos = track.global_position();
            let phi = if pos.x.hypot(pos.y) < 1.0 {
                track.phi()
            } else {
                pos.y.atan2(pos.x)
            };
            let mut az = geo.azimuth_index(phi);
            let mut hit = None;
            for _ in 0..2 {
                let frame = geo.sector(geo.sector_id(roc, Side::A, az)).unwrap();
                let mut probe = track;
                if probe.rotate(geo.sector_alpha(&frame)).is_err()
                    || prop.propagate_to(&mut probe, radius, &opts).is_err()
                {
                    break;
                }
                if probe.y().abs() <= radius * half_width {
                    let sector = geo.sector(geo.sector_id(roc, Side::from_z(probe.z()), az)).unwrap();
                    hit = Some((sector, probe));
                    break;
                }
                az = if probe.y() > 0.0 { (az + 1) % n } else { (az + n - 1) % n };
            }
            let Some((sector, probe)) = hit else { break };
            let z_length = geo.z_length(&sector);
            if probe.z().abs() > z_length {
                break;
            }
            track = probe;
            out.push(Cluster {
                sector: sector.id,
                row,
                x: radius,
                y: probe.y(),
                z: probe.z(),
                time_bin: t0 + (z_length - probe.z().abs()) / geo.drift_velocity(),
                sigma_y2: 0.01,
                sigma_z2: 0.01,
            });
        }
        out
    }
}
