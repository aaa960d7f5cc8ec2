//! Append-only per-cycle log and its replay.
//!
//! One CSV row per filter cycle: `timestamp,x,y,z,ess,state`. The `z` column is empty when only two
//! axes are tracked. Every row is flushed as it is written, so a log cut short by a crash still
//! replays up to the last completed cycle.
use crate::{Axes, Result, StateEstimate, TrackingState};

use serde::{Deserialize, Serialize};
use std::fmt::{self, Display};
use std::fs::{File, OpenOptions};
use std::path::Path;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CycleRecord {
    pub timestamp: f64,
    pub x: f64,
    pub y: f64,
    pub z: Option<f64>,
    pub ess: f64,
    pub state: TrackingState,
}

impl CycleRecord {
    pub fn from_estimate(estimate: &StateEstimate, axes: Axes) -> Self {
        CycleRecord {
            timestamp: estimate.timestamp,
            x: estimate.position.x,
            y: estimate.position.y,
            z: match axes {
                Axes::Planar => None,
                Axes::Volumetric => Some(estimate.position.z),
            },
            ess: estimate.ess,
            state: estimate.state,
        }
    }
}

/// CSV writer that flushes after every row.
pub struct TrajectoryLog {
    writer: csv::Writer<File>,
    axes: Axes,
    rows: usize,
}

impl TrajectoryLog {
    /// Create (or truncate) a log at `path`.
    pub fn create<P: AsRef<Path>>(path: P, axes: Axes) -> Result<Self> {
        let writer = csv::Writer::from_path(path)?;
        Ok(TrajectoryLog {
            writer,
            axes,
            rows: 0,
        })
    }

    /// Open `path` for appending. The header is written only if the file is new or empty.
    pub fn append<P: AsRef<Path>>(path: P, axes: Axes) -> Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        let needs_header = file.metadata()?.len() == 0;
        let writer = csv::WriterBuilder::new()
            .has_headers(needs_header)
            .from_writer(file);
        Ok(TrajectoryLog {
            writer,
            axes,
            rows: 0,
        })
    }

    pub fn write(&mut self, record: &CycleRecord) -> Result<()> {
        self.writer.serialize(record)?;
        self.writer.flush()?;
        self.rows += 1;
        Ok(())
    }

    pub fn write_estimate(&mut self, estimate: &StateEstimate) -> Result<()> {
        let record = CycleRecord::from_estimate(estimate, self.axes);
        self.write(&record)
    }

    /// Rows written through this handle.
    pub fn rows(&self) -> usize {
        self.rows
    }
}

/// Read a cycle log back into memory.
pub fn read_trajectory<P: AsRef<Path>>(path: P) -> Result<Vec<CycleRecord>> {
    let mut rdr = csv::Reader::from_path(path)?;
    let mut records = Vec::new();
    for result in rdr.deserialize() {
        let record: CycleRecord = result?;
        records.push(record);
    }
    Ok(records)
}

/// Aggregate view of a replayed log.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct TrajectorySummary {
    pub cycles: usize,
    pub tracking: usize,
    pub degenerate: usize,
    pub lost: usize,
    pub uninitialized: usize,
    /// Sum of distances between consecutive estimates.
    pub path_length: f64,
    pub mean_ess: f64,
    pub start_time: f64,
    pub end_time: f64,
    pub final_position: Option<(f64, f64, Option<f64>)>,
}

impl TrajectorySummary {
    pub fn from_records(records: &[CycleRecord]) -> Self {
        let mut summary = TrajectorySummary {
            cycles: records.len(),
            ..TrajectorySummary::default()
        };
        if records.is_empty() {
            return summary;
        }
        for record in records {
            match record.state {
                TrackingState::Tracking => summary.tracking += 1,
                TrackingState::Degenerate => summary.degenerate += 1,
                TrackingState::Lost => summary.lost += 1,
                TrackingState::Uninitialized => summary.uninitialized += 1,
            }
        }
        summary.path_length = records
            .windows(2)
            .map(|w| {
                let dz = w[1].z.unwrap_or(0.0) - w[0].z.unwrap_or(0.0);
                ((w[1].x - w[0].x).powi(2) + (w[1].y - w[0].y).powi(2) + dz * dz).sqrt()
            })
            .sum();
        summary.mean_ess = records.iter().map(|r| r.ess).sum::<f64>() / records.len() as f64;
        summary.start_time = records[0].timestamp;
        let last = &records[records.len() - 1];
        summary.end_time = last.timestamp;
        summary.final_position = Some((last.x, last.y, last.z));
        summary
    }
}

impl Display for TrajectorySummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "cycles:        {}", self.cycles)?;
        writeln!(
            f,
            "states:        tracking={} degenerate={} lost={} uninitialized={}",
            self.tracking, self.degenerate, self.lost, self.uninitialized
        )?;
        writeln!(f, "time span:     {:.3} .. {:.3}", self.start_time, self.end_time)?;
        writeln!(f, "path length:   {:.4}", self.path_length)?;
        writeln!(f, "mean ESS:      {:.1}", self.mean_ess)?;
        match self.final_position {
            Some((x, y, Some(z))) => write!(f, "final:         ({x:.4}, {y:.4}, {z:.4})"),
            Some((x, y, None)) => write!(f, "final:         ({x:.4}, {y:.4})"),
            None => write!(f, "final:         n/a"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;
    use nalgebra::{Matrix3, Vector3};
    use tempfile::tempdir;

    fn estimate(t: f64, x: f64, state: TrackingState) -> StateEstimate {
        StateEstimate {
            position: Vector3::new(x, 0.0, 0.5),
            covariance: Matrix3::identity(),
            timestamp: t,
            ess: 100.0 + t,
            state,
        }
    }

    #[test]
    fn test_log_and_replay() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("cycles.csv");
        let mut log = TrajectoryLog::create(&path, Axes::Planar).unwrap();
        log.write_estimate(&estimate(1.0, 0.0, TrackingState::Tracking)).unwrap();
        log.write_estimate(&estimate(2.0, 3.0, TrackingState::Tracking)).unwrap();
        log.write_estimate(&estimate(3.0, 4.0, TrackingState::Degenerate)).unwrap();
        assert_eq!(log.rows(), 3);

        let records = read_trajectory(&path).unwrap();
        assert_eq!(records.len(), 3);
        assert_eq!(records[2].state, TrackingState::Degenerate);
        assert!(records.iter().all(|r| r.z.is_none()));

        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.starts_with("timestamp,x,y,z,ess,state"));
        assert!(text.contains("3.0,4.0,0.0,,103.0,degenerate"));
    }

    #[test]
    fn test_append_keeps_single_header() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("cycles.csv");
        {
            let mut log = TrajectoryLog::append(&path, Axes::Volumetric).unwrap();
            log.write_estimate(&estimate(1.0, 1.0, TrackingState::Tracking)).unwrap();
        }
        {
            let mut log = TrajectoryLog::append(&path, Axes::Volumetric).unwrap();
            log.write_estimate(&estimate(2.0, 2.0, TrackingState::Lost)).unwrap();
        }
        let records = read_trajectory(&path).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].z, Some(0.5));
        assert_eq!(records[1].state, TrackingState::Lost);
    }

    #[test]
    fn test_summary() {
        let records: Vec<CycleRecord> = [
            (0.0, 0.0, TrackingState::Tracking),
            (1.0, 3.0, TrackingState::Tracking),
            (2.0, 7.0, TrackingState::Degenerate),
        ]
        .iter()
        .map(|&(t, x, s)| CycleRecord::from_estimate(&estimate(t, x, s), Axes::Planar))
        .collect();
        let summary = TrajectorySummary::from_records(&records);
        assert_eq!(summary.cycles, 3);
        assert_eq!(summary.tracking, 2);
        assert_eq!(summary.degenerate, 1);
        assert_approx_eq!(summary.path_length, 7.0, 1e-12);
        assert_approx_eq!(summary.mean_ess, 101.0, 1e-12);
        assert_eq!(summary.final_position, Some((7.0, 0.0, None)));
        assert!(summary.to_string().contains("path length:   7.0000"));
    }

    #[test]
    fn test_empty_summary() {
        let summary = TrajectorySummary::from_records(&[]);
        assert_eq!(summary.cycles, 0);
        assert!(summary.final_position.is_none());
    }
}
