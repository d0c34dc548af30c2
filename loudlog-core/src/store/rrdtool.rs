//! `rrdtool` command-line client.
//!
//! Every operation is one `rrdtool` invocation. Updates go through
//! `rrdcached` when a daemon address is configured so the pipeline never
//! waits on the RRD file itself.

use std::path::PathBuf;
use std::process::Command;

use tracing::{debug, info};

use super::{CreateOutcome, StoreLayout, TimeSeriesStore, FIELD_NAMES};
use crate::error::{LoudlogError, Result};

/// Value rrdtool reads as "unknown".
const UNKNOWN: &str = "U";

/// Largest RMS a block of `i16` samples can have.
const RMS_CEILING: u32 = 32_768;

/// Round-robin archives declared at create time.
const RRA_SPECS: [&str; 3] = [
    "RRA:AVERAGE:0.5:1s:1d",
    "RRA:MAX:0.5:1m:30d",
    "RRA:AVERAGE:0.5:1m:30d",
];

#[derive(Debug, Clone)]
pub struct RrdtoolStore {
    binary: PathBuf,
    path: PathBuf,
    /// rrdcached address, e.g. `unix:/tmp/rrdcached.sock`.
    daemon: Option<String>,
}

impl RrdtoolStore {
    pub fn new(path: impl Into<PathBuf>, daemon: Option<String>) -> Self {
        Self {
            binary: PathBuf::from("rrdtool"),
            path: path.into(),
            daemon,
        }
    }

    /// Use a specific `rrdtool` executable instead of the one on `PATH`.
    pub fn with_binary(mut self, binary: impl Into<PathBuf>) -> Self {
        self.binary = binary.into();
        self
    }

    fn path_arg(&self) -> String {
        self.path.display().to_string()
    }

    pub fn create_args(&self, layout: &StoreLayout) -> Vec<String> {
        let mut args = vec![
            "create".to_string(),
            self.path_arg(),
            "--step".to_string(),
            layout.step_secs.to_string(),
            "--no-overwrite".to_string(),
        ];
        for name in FIELD_NAMES {
            let (min, max) = match name {
                "peak" => ("0".to_string(), layout.max_full_scale.to_string()),
                // RMS is unclamped; an all-i16::MIN block reaches 32768.
                "rms" => (
                    "0".to_string(),
                    layout.max_full_scale.max(RMS_CEILING).to_string(),
                ),
                _ => (UNKNOWN.to_string(), UNKNOWN.to_string()),
            };
            args.push(format!(
                "DS:{name}:GAUGE:{}:{min}:{max}",
                layout.heartbeat_secs
            ));
        }
        args.extend(RRA_SPECS.iter().map(|s| s.to_string()));
        args
    }

    pub fn update_args(&self, timestamp: i64, values: [f64; 4]) -> Vec<String> {
        let mut args = vec!["update".to_string()];
        if let Some(daemon) = &self.daemon {
            args.push("--daemon".to_string());
            args.push(daemon.clone());
        }
        args.push("--skip-past-updates".to_string());
        args.push(self.path_arg());

        let mut row = timestamp.to_string();
        for value in values {
            row.push(':');
            row.push_str(&format_value(value));
        }
        args.push(row);
        args
    }

    pub fn flush_args(&self) -> Option<Vec<String>> {
        let daemon = self.daemon.as_ref()?;
        Some(vec![
            "flushcached".to_string(),
            "--daemon".to_string(),
            daemon.clone(),
            self.path_arg(),
        ])
    }

    fn run(&self, args: &[String]) -> Result<()> {
        debug!(binary = ?self.binary, ?args, "running rrdtool");
        let output = Command::new(&self.binary).args(args).output().map_err(|e| {
            LoudlogError::StoreWrite(format!("failed to run {}: {e}", self.binary.display()))
        })?;
        if output.status.success() {
            return Ok(());
        }
        Err(LoudlogError::StoreWrite(format!(
            "rrdtool {} exited with {}: {}",
            args.first().map(String::as_str).unwrap_or_default(),
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        )))
    }
}

/// Non-finite values (silent-block dBFS) become unknown.
fn format_value(value: f64) -> String {
    if value.is_finite() {
        format!("{value}")
    } else {
        UNKNOWN.to_string()
    }
}

impl TimeSeriesStore for RrdtoolStore {
    fn create(&mut self, layout: &StoreLayout) -> Result<CreateOutcome> {
        if self.path.exists() {
            info!(path = ?self.path, "time-series file already exists");
            return Ok(CreateOutcome::AlreadyExists);
        }
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        self.run(&self.create_args(layout))?;
        info!(path = ?self.path, "time-series file created");
        Ok(CreateOutcome::Created)
    }

    fn update(&mut self, timestamp: i64, values: [f64; 4]) -> Result<()> {
        self.run(&self.update_args(timestamp, values))
    }

    fn flush(&mut self) -> Result<()> {
        match self.flush_args() {
            Some(args) => self.run(&args),
            None => {
                debug!("no rrdcached daemon configured; nothing to flush");
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_declares_fields_in_update_order() {
        let store = RrdtoolStore::new("/var/lib/loudlog/mixer.rrd", None);
        let args = store.create_args(&StoreLayout::new("/var/lib/loudlog/mixer.rrd"));
        assert_eq!(
            &args[..5],
            &["create", "/var/lib/loudlog/mixer.rrd", "--step", "1", "--no-overwrite"]
        );
        assert_eq!(
            &args[5..9],
            &[
                "DS:peak:GAUGE:60:0:32767",
                "DS:peak_dbfs:GAUGE:60:U:U",
                "DS:rms:GAUGE:60:0:32768",
                "DS:rms_dbfs:GAUGE:60:U:U",
            ]
        );
        assert_eq!(args.len(), 9 + RRA_SPECS.len());
    }

    #[test]
    fn update_goes_through_daemon_and_skips_past() {
        let store = RrdtoolStore::new("mixer.rrd", Some("unix:/tmp/rrdcached.sock".into()));
        let args = store.update_args(1_700_000_000, [16_384.0, -6.02, 11_585.24, -9.03]);
        assert_eq!(
            args,
            vec![
                "update",
                "--daemon",
                "unix:/tmp/rrdcached.sock",
                "--skip-past-updates",
                "mixer.rrd",
                "1700000000:16384:-6.02:11585.24:-9.03",
            ]
        );
    }

    #[test]
    fn rms_bound_admits_a_full_negative_block() {
        let store = RrdtoolStore::new("mixer.rrd", None);
        let args = store.create_args(&StoreLayout::new("mixer.rrd"));
        assert!(args.contains(&"DS:rms:GAUGE:60:0:32768".to_string()));

        let mut wide = StoreLayout::new("mixer.rrd");
        wide.max_full_scale = 100_000;
        let args = store.create_args(&wide);
        assert!(args.contains(&"DS:peak:GAUGE:60:0:100000".to_string()));
        assert!(args.contains(&"DS:rms:GAUGE:60:0:100000".to_string()));
    }

    #[test]
    fn silent_block_is_written_as_unknown() {
        let store = RrdtoolStore::new("mixer.rrd", None);
        let args = store.update_args(10, [0.0, f64::NEG_INFINITY, 0.0, f64::NEG_INFINITY]);
        assert_eq!(args.last().unwrap(), "10:0:U:0:U");
        assert!(!args.iter().any(|a| a == "--daemon"));
    }

    #[test]
    fn flush_needs_a_daemon() {
        let local = RrdtoolStore::new("mixer.rrd", None);
        assert!(local.flush_args().is_none());
        let cached = RrdtoolStore::new("mixer.rrd", Some("localhost:42217".into()));
        assert_eq!(
            cached.flush_args().unwrap(),
            vec!["flushcached", "--daemon", "localhost:42217", "mixer.rrd"]
        );
    }

    #[test]
    fn create_on_existing_file_is_a_no_op() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mixer.rrd");
        std::fs::write(&path, b"existing data").unwrap();

        // The binary does not exist: a spawn would fail the test.
        let mut store = RrdtoolStore::new(&path, None).with_binary("/nonexistent/rrdtool");
        let outcome = store.create(&StoreLayout::new(&path)).unwrap();
        assert_eq!(outcome, CreateOutcome::AlreadyExists);
        assert_eq!(std::fs::read(&path).unwrap(), b"existing data");
    }

    #[test]
    fn missing_binary_is_a_store_error() {
        let mut store =
            RrdtoolStore::new("mixer.rrd", None).with_binary("/nonexistent/rrdtool");
        let err = store.update(1, [0.0; 4]).unwrap_err();
        assert!(matches!(err, LoudlogError::StoreWrite(_)));
        assert!(!err.is_fatal());
    }
}
