//! Result sink: one durable row per scenario.
//!
//! Rows are appended to a CSV file and synced to disk before `record`
//! returns, so every completed scenario survives a crash later in the run.

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use fanout_common::models::ScenarioResult;
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("result file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("result file {path} has an incompatible header: {found}")]
    HeaderMismatch { path: PathBuf, found: String },
    #[error("failed to encode result row: {0}")]
    Csv(#[from] csv::Error),
}

/// Destination for scenario results.
pub trait ResultSink {
    fn record(&mut self, result: &ScenarioResult) -> Result<(), SinkError>;
}

pub const COLUMNS: [&str; 25] = [
    "timestamp",
    "runId",
    "architecture",
    "viewerCount",
    "lossRate",
    "bandwidthCap",
    "repetition",
    "cpuAvg",
    "cpuMax",
    "cpuSamples",
    "bandwidthAvg",
    "bandwidthSamples",
    "latencyAvg",
    "latencyMin",
    "latencyMax",
    "latencySamples",
    "latencyPath",
    "jitterAvg",
    "jitterSamples",
    "packetsLostTotal",
    "packetsLostSamples",
    "durationMs",
    "impairmentApplied",
    "success",
    "errorMessage",
];

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ResultRow<'a> {
    timestamp: String,
    run_id: &'a str,
    architecture: String,
    viewer_count: u32,
    loss_rate: f32,
    bandwidth_cap: String,
    repetition: u32,
    cpu_avg: f64,
    cpu_max: f64,
    cpu_samples: usize,
    bandwidth_avg: f64,
    bandwidth_samples: usize,
    latency_avg: f64,
    latency_min: f64,
    latency_max: f64,
    latency_samples: usize,
    latency_path: String,
    jitter_avg: f64,
    jitter_samples: usize,
    packets_lost_total: u64,
    packets_lost_samples: usize,
    duration_ms: u64,
    impairment_applied: bool,
    success: bool,
    error_message: &'a str,
}

impl<'a> From<&'a ScenarioResult> for ResultRow<'a> {
    fn from(r: &'a ScenarioResult) -> Self {
        let m = &r.metrics;
        Self {
            timestamp: r.timestamp.to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
            run_id: &r.run_id,
            architecture: r.scenario.architecture().to_string(),
            viewer_count: r.scenario.viewer_count(),
            loss_rate: r.scenario.loss_rate_percent(),
            bandwidth_cap: r.scenario.bandwidth_cap().to_string(),
            repetition: r.scenario.repetition(),
            cpu_avg: round2(m.cpu_percent.avg),
            cpu_max: round2(m.cpu_percent.max),
            cpu_samples: m.cpu_percent.count,
            bandwidth_avg: round2(m.bandwidth_bps.avg),
            bandwidth_samples: m.bandwidth_bps.count,
            latency_avg: round2(m.latency_ms.avg),
            latency_min: round2(m.latency_ms.min),
            latency_max: round2(m.latency_ms.max),
            latency_samples: m.latency_ms.count,
            latency_path: r.latency_path().to_string(),
            jitter_avg: round2(m.jitter_ms.avg),
            jitter_samples: m.jitter_ms.count,
            packets_lost_total: m.packets_lost_total,
            packets_lost_samples: m.packets_lost_samples,
            duration_ms: r.wall_clock.as_millis() as u64,
            impairment_applied: r.impairment_applied,
            success: r.success,
            error_message: r.error.as_deref().unwrap_or(""),
        }
    }
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

/// Appends rows to a CSV file, writing the header only when the file is new.
pub struct CsvSink {
    path: PathBuf,
    writer: csv::Writer<File>,
    rows: usize,
}

impl CsvSink {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, SinkError> {
        let path = path.as_ref().to_path_buf();
        let io_err = |source| SinkError::Io {
            path: path.clone(),
            source,
        };

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(io_err)?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&path)
            .map_err(io_err)?;

        let is_new = file.metadata().map_err(io_err)?.len() == 0;
        if !is_new {
            let mut first = String::new();
            BufReader::new(&file).read_line(&mut first).map_err(io_err)?;
            let found = first.trim_end_matches(['\r', '\n']);
            if found != COLUMNS.join(",") {
                return Err(SinkError::HeaderMismatch {
                    path: path.clone(),
                    found: found.to_string(),
                });
            }
            file.seek(SeekFrom::End(0)).map_err(io_err)?;
        }

        let mut writer = csv::WriterBuilder::new()
            .has_headers(false)
            .from_writer(file);
        if is_new {
            writer.write_record(COLUMNS)?;
            writer.flush().map_err(io_err)?;
        }
        tracing::info!(path = %path.display(), new = is_new, "result sink opened");
        Ok(Self {
            path,
            writer,
            rows: 0,
        })
    }

    /// Rows written through this sink (not counting earlier runs).
    pub fn rows(&self) -> usize {
        self.rows
    }
}

impl ResultSink for CsvSink {
    fn record(&mut self, result: &ScenarioResult) -> Result<(), SinkError> {
        let io_err = |source| SinkError::Io {
            path: self.path.clone(),
            source,
        };
        self.writer.serialize(ResultRow::from(result))?;
        self.writer.flush().map_err(io_err)?;
        self.writer.get_ref().sync_data().map_err(io_err)?;
        self.rows += 1;
        Ok(())
    }
}

/// Keeps results in memory.
#[derive(Debug, Default)]
pub struct MemorySink {
    pub results: Vec<ScenarioResult>,
}

impl ResultSink for MemorySink {
    fn record(&mut self, result: &ScenarioResult) -> Result<(), SinkError> {
        self.results.push(result.clone());
        Ok(())
    }
}

impl<S: ResultSink + ?Sized> ResultSink for &mut S {
    fn record(&mut self, result: &ScenarioResult) -> Result<(), SinkError> {
        (**self).record(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fanout_common::models::{AggregatedMetrics, Architecture, BandwidthCap, MetricSummary, Scenario};
    use std::time::Duration;

    fn result(success: bool) -> ScenarioResult {
        let scenario = Scenario::new(
            Architecture::Relay,
            5,
            5.0,
            BandwidthCap::mbit(5),
            2,
            Duration::from_secs(15),
        )
        .unwrap();
        let outcome = if success {
            Ok(AggregatedMetrics {
                latency_ms: MetricSummary::from_values([41.234, 44.0]),
                packets_lost_total: 17,
                packets_lost_samples: 4,
                ..Default::default()
            })
        } else {
            Err("viewer 3: connection timeout after 30s, \"quoted\"".to_string())
        };
        ScenarioResult::new("run_t", scenario, outcome, Duration::from_millis(15_120), true)
    }

    #[test]
    fn header_written_once_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out/results.csv");
        {
            let mut sink = CsvSink::open(&path).unwrap();
            sink.record(&result(true)).unwrap();
        }
        {
            let mut sink = CsvSink::open(&path).unwrap();
            sink.record(&result(false)).unwrap();
            assert_eq!(sink.rows(), 1);
        }

        let mut reader = csv::Reader::from_path(&path).unwrap();
        let headers = reader.headers().unwrap().clone();
        assert_eq!(headers.iter().collect::<Vec<_>>(), COLUMNS.to_vec());
        let rows: Vec<csv::StringRecord> = reader.records().map(|r| r.unwrap()).collect();
        assert_eq!(rows.len(), 2);

        let col = |name: &str| headers.iter().position(|h| h == name).unwrap();
        assert_eq!(&rows[0][col("architecture")], "relay");
        assert_eq!(&rows[0][col("latencyAvg")], "42.62");
        assert_eq!(&rows[0][col("latencySamples")], "2");
        assert_eq!(&rows[0][col("latencyPath")], "presenter-relay");
        assert_eq!(&rows[0][col("jitterSamples")], "0");
        assert_eq!(&rows[0][col("packetsLostTotal")], "17");
        assert_eq!(&rows[0][col("packetsLostSamples")], "4");
        assert_eq!(&rows[0][col("cpuSamples")], "0");
        assert_eq!(&rows[0][col("bandwidthSamples")], "0");
        // Failed scenarios carry no signal at all, not a measured zero.
        assert_eq!(&rows[1][col("packetsLostTotal")], "0");
        assert_eq!(&rows[1][col("packetsLostSamples")], "0");
        assert_eq!(&rows[0][col("durationMs")], "15120");
        assert_eq!(&rows[0][col("success")], "true");
        assert_eq!(&rows[1][col("success")], "false");
        assert!(rows[1][col("errorMessage")].contains("\"quoted\""));
    }

    #[test]
    fn mismatched_header_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("legacy.csv");
        std::fs::write(&path, "timestamp,architecture,viewerCount\n").unwrap();
        let err = CsvSink::open(&path).err().unwrap();
        assert!(matches!(err, SinkError::HeaderMismatch { .. }));
    }

    #[test]
    fn serialized_row_matches_header_order() {
        let mut w = csv::WriterBuilder::new()
            .has_headers(true)
            .from_writer(Vec::new());
        w.serialize(ResultRow::from(&result(true))).unwrap();
        let text = String::from_utf8(w.into_inner().unwrap()).unwrap();
        assert_eq!(text.lines().next().unwrap(), COLUMNS.join(","));
    }
}
