//! YAML configuration for readout applications.
//!
//! Every struct uses `#[serde(default)]`, so a configuration only names what it changes.
//! Durations are plain millisecond counts.
//!
//! ```rust
//! use fdreadout::config::ReadoutConfig;
//!
//! let config = ReadoutConfig::from_yaml_str(r#"
//! queues:
//!   - uid: wib_link0
//!     data_type: WIBEthFrame
//!     capacity: 1000
//! readers:
//!   wib_reader0:
//!     output: wib_link0
//!     source:
//!       kind: emulated
//!       rate_limited: false
//! handlers:
//!   wib_handler0:
//!     raw_input: wib_link0
//!     latency_buffer_size: 4096
//! "#).unwrap();
//! assert_eq!(config.queues[0].capacity, 1000);
//! assert_eq!(config.handlers["wib_handler0"].latency_buffer_size, 4096);
//! ```

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::acquisition::RetryPolicy;
use crate::{ReadoutError, Result};

/// Default queue send/receive timeout.
pub const DEFAULT_QUEUE_TIMEOUT_MS: u64 = 100;

/// A bounded queue between two modules.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub uid: String,
    /// Canonical frame format name, e.g. `WIBEthFrame`.
    pub data_type: String,
    pub capacity: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self { uid: String::new(), data_type: String::new(), capacity: 1000 }
    }
}

/// Emulated source settings. Unset overrides keep the per-format defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EmulatorConfig {
    /// Pace frames at the format's nominal rate instead of emitting on every poll.
    pub rate_limited: bool,
    /// Seed for dropout sampling.
    pub seed: u64,
    pub first_timestamp: u64,
    /// Stop producing after this many frames.
    pub max_frames: Option<u64>,
    pub rate_khz: Option<f64>,
    pub dropout_rate: Option<f64>,
    pub frames_per_tick: Option<u32>,
}

impl Default for EmulatorConfig {
    fn default() -> Self {
        Self {
            rate_limited: true,
            seed: 0,
            first_timestamp: 0,
            max_frames: None,
            rate_khz: None,
            dropout_rate: None,
            frames_per_tick: None,
        }
    }
}

/// Where a reader gets its data from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SourceConfig {
    Emulated(EmulatorConfig),
    Replay {
        file: PathBuf,
        #[serde(default)]
        looping: bool,
    },
}

impl Default for SourceConfig {
    fn default() -> Self {
        SourceConfig::Emulated(EmulatorConfig::default())
    }
}

/// Reader module settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReaderConfig {
    /// Uid of the queue frames are pushed to.
    pub output: String,
    pub queue_timeout_ms: u64,
    pub retry_policy: RetryPolicy,
    pub source: SourceConfig,
}

impl Default for ReaderConfig {
    fn default() -> Self {
        Self {
            output: String::new(),
            queue_timeout_ms: DEFAULT_QUEUE_TIMEOUT_MS,
            retry_policy: RetryPolicy::default(),
            source: SourceConfig::default(),
        }
    }
}

impl ReaderConfig {
    pub fn queue_timeout(&self) -> Duration {
        Duration::from_millis(self.queue_timeout_ms)
    }
}

/// Data handler settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HandlerConfig {
    /// Uid of the queue the handler consumes.
    pub raw_input: String,
    /// Frames retained for window requests.
    pub latency_buffer_size: usize,
    pub receive_timeout_ms: u64,
    /// Frames between two statistics snapshots.
    pub stats_every: u64,
    /// Target of the `record` command.
    pub recording_file: Option<PathBuf>,
}

impl Default for HandlerConfig {
    fn default() -> Self {
        Self {
            raw_input: String::new(),
            latency_buffer_size: 4096,
            receive_timeout_ms: DEFAULT_QUEUE_TIMEOUT_MS,
            stats_every: 1000,
            recording_file: None,
        }
    }
}

impl HandlerConfig {
    pub fn receive_timeout(&self) -> Duration {
        Duration::from_millis(self.receive_timeout_ms)
    }
}

/// Data recorder settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecorderConfig {
    pub input: String,
    pub output_file: PathBuf,
    pub receive_timeout_ms: u64,
    /// Write buffer size in bytes.
    pub stream_buffer_size: usize,
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self {
            input: String::new(),
            output_file: PathBuf::from("raw_recording.bin"),
            receive_timeout_ms: DEFAULT_QUEUE_TIMEOUT_MS,
            stream_buffer_size: 8 * 1024 * 1024,
        }
    }
}

impl RecorderConfig {
    pub fn receive_timeout(&self) -> Duration {
        Duration::from_millis(self.receive_timeout_ms)
    }
}

/// A whole readout application: queues plus the modules bound to them, keyed by name.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReadoutConfig {
    pub queues: Vec<QueueConfig>,
    pub readers: BTreeMap<String, ReaderConfig>,
    pub handlers: BTreeMap<String, HandlerConfig>,
    pub recorders: BTreeMap<String, RecorderConfig>,
}

impl ReadoutConfig {
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: Self = serde_yaml_ng::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let yaml = std::fs::read_to_string(path).map_err(|e| ReadoutError::file_error(path, e))?;
        Self::from_yaml_str(&yaml)
    }

    /// Checks cross references: queue uids are unique and every module names a declared queue.
    pub fn validate(&self) -> Result<()> {
        let declared = |uid: &str| self.queues.iter().any(|q| q.uid == uid);
        let mut seen = HashSet::new();
        for queue in &self.queues {
            if queue.capacity == 0 {
                return Err(ReadoutError::configuration(format!("queue '{}' has zero capacity", queue.uid)));
            }
            if !seen.insert(queue.uid.as_str()) {
                return Err(ReadoutError::configuration(format!("queue '{}' is declared more than once", queue.uid)));
            }
        }
        let references = self
            .readers
            .iter()
            .map(|(name, r)| (name, &r.output))
            .chain(self.handlers.iter().map(|(name, h)| (name, &h.raw_input)))
            .chain(self.recorders.iter().map(|(name, r)| (name, &r.input)));
        for (module, uid) in references {
            if !declared(uid) {
                return Err(ReadoutError::configuration(format!("module '{module}' references undeclared queue '{uid}'")));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_fill_missing_fields() {
        let config = ReadoutConfig::from_yaml_str(
            "queues: [{uid: q, data_type: CRTFrame}]\nreaders: {r: {output: q}}\nhandlers: {h: {raw_input: q}}\n",
        )
        .unwrap();
        assert_eq!(config.queues[0].capacity, 1000);
        let reader = &config.readers["r"];
        assert_eq!(reader.queue_timeout(), Duration::from_millis(100));
        assert_eq!(reader.retry_policy, RetryPolicy::Forever);
        assert!(matches!(&reader.source, SourceConfig::Emulated(e) if e.rate_limited));
        assert_eq!(config.handlers["h"].receive_timeout(), Duration::from_millis(100));
    }

    #[test]
    fn replay_source_and_bounded_retry() {
        let config = ReadoutConfig::from_yaml_str(
            r#"
queues:
  - {uid: q, data_type: TDEFrame, capacity: 10}
readers:
  r:
    output: q
    queue_timeout_ms: 5
    retry_policy: {policy: bounded, max_timeouts: 3}
    source: {kind: replay, file: /data/tde.bin, looping: true}
"#,
        )
        .unwrap();
        let reader = &config.readers["r"];
        assert_eq!(reader.retry_policy, RetryPolicy::Bounded { max_timeouts: 3 });
        assert_eq!(reader.source, SourceConfig::Replay { file: PathBuf::from("/data/tde.bin"), looping: true });
    }

    #[test]
    fn undeclared_queue_is_a_configuration_error() {
        let err = ReadoutConfig::from_yaml_str("handlers: {h: {raw_input: nowhere}}").unwrap_err();
        assert!(matches!(err, ReadoutError::Configuration { .. }));
        assert!(err.to_string().contains("nowhere"));
    }

    #[test]
    fn duplicate_queue_uid_is_a_configuration_error() {
        let err = ReadoutConfig::from_yaml_str("queues: [{uid: q, data_type: CRTFrame}, {uid: q, data_type: TDEFrame}]")
            .unwrap_err();
        assert!(matches!(err, ReadoutError::Configuration { .. }));
        assert!(err.to_string().contains("more than once"));
    }

    #[test]
    fn malformed_yaml_is_a_parse_error() {
        let err = ReadoutConfig::from_yaml_str("queues: [uid: {").unwrap_err();
        assert!(matches!(err, ReadoutError::Parse { .. }));
    }

    #[test]
    fn load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("readout.yaml");
        std::fs::write(&path, "queues: [{uid: q, data_type: SSPFrame, capacity: 2}]\n").unwrap();
        let config = ReadoutConfig::from_yaml_file(&path).unwrap();
        assert_eq!(config.queues[0].data_type, "SSPFrame");

        let missing = ReadoutConfig::from_yaml_file(dir.path().join("missing.yaml")).unwrap_err();
        assert!(matches!(missing, ReadoutError::File { .. }));
    }
}
