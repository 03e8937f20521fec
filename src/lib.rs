//! Acquisition and dispatch engine for far-detector readout.
//!
//! fdreadout moves fixed-size frames from a polled hardware source into a bounded queue
//! and from there into a pipeline specialized at compile time for the frame format of
//! that queue. Pipelines buffer recent frames by timestamp, serve time-window requests
//! and can stream raw data to disk.
//!
//! # Features
//!
//! - **Backpressure-aware acquisition**: the same frame is retried on every send
//!   timeout, a disconnected queue ends the run
//! - **Static specialization**: one `match` on the data type picks a monomorphized
//!   pipeline; nothing on the per-frame path is dynamically dispatched
//! - **Emulation and replay**: per-format emulated sources and raw-file playback
//! - **Monitoring**: pipeline statistics as a rate-limited `Stream`
//!
//! ## Example
//!
//! ```rust,no_run
//! use fdreadout::{DataHandlerModule, DaqModule, QueueRegistry, ReadoutConfig, RunMarker, TimeWindow};
//! use fdreadout::reader::create_reader;
//!
//! fn main() -> fdreadout::Result<()> {
//!     let config = ReadoutConfig::from_yaml_file("readout.yaml")?;
//!     let registry = QueueRegistry::from_config(&config.queues)?;
//!     let marker = RunMarker::new();
//!
//!     let mut handler =
//!         DataHandlerModule::init_with_marker("handler0", &registry, config.handlers["handler0"].clone(), marker.clone())?;
//!     let mut reader = create_reader("reader0", &registry, &config.readers["reader0"], marker)?;
//!
//!     handler.configure()?;
//!     reader.configure()?;
//!     handler.start()?;
//!     reader.start()?;
//!     std::thread::sleep(std::time::Duration::from_millis(100));
//!
//!     let fragment = handler.request(TimeWindow::new(0, 1 << 20))?;
//!     println!("{} frames, {:?}", fragment.frame_count(), fragment.outcome);
//!
//!     reader.stop()?;
//!     handler.stop()?;
//!     Ok(())
//! }
//! ```

// Core types and error handling
mod error;
pub mod lifecycle;
#[cfg(any(test, feature = "benchmark"))]
pub mod test_utils;
pub mod types;

// Transport and configuration
pub mod channel;
pub mod config;

// Acquisition
pub mod acquisition;
pub mod provider;
pub mod providers;
pub mod reader;

// Dispatch and data handling
pub mod handler;
pub mod opmon;
pub mod pipeline;
pub mod recorder;
pub mod stream;

// Inspection
pub mod consumer;

// Core exports
pub use error::*;
pub use types::*;

pub use acquisition::{AcquisitionLoop, LoopCounters, LoopStats, RetryPolicy};
pub use channel::{ChannelError, Endpoint, FrameReceiver, FrameSender, QueueReceiver, QueueRegistry, QueueSender};
pub use config::{EmulatorConfig, HandlerConfig, ReaderConfig, ReadoutConfig, RecorderConfig, SourceConfig};
pub use handler::DataHandlerModule;
pub use lifecycle::{DaqModule, ModuleInfo, ModuleState, RunMarker};
pub use opmon::PipelineStats;
pub use pipeline::{Fragment, Pipeline, PipelineSpec, RequestOutcome, TimeWindow, create_pipeline};
pub use provider::{HardwareBuffer, HardwareSource};
