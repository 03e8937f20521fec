//! Operational monitoring snapshots for handler pipelines.
//!
//! The consumer thread of a pipeline publishes a [`PipelineStats`] snapshot into a
//! `watch` channel every few thousand frames, on idle receive timeouts and when it
//! exits. Readers of the channel always see the latest snapshot; [`stats_stream`] turns
//! it into a `Stream`, optionally rate limited.

use futures::StreamExt;
use futures::stream::BoxStream;
use serde::Serialize;
use tokio::sync::watch;
use tokio_stream::wrappers::WatchStream;

use crate::pipeline::{ProcessorStats, RequestStats};
use crate::stream::ThrottleExt;
use crate::types::{FormatDescriptor, UpdateRate};

/// Counters of one handler pipeline.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PipelineStats {
    pub format: FormatDescriptor,
    /// Frames taken off the input queue.
    pub received: u64,
    /// Idle receive timeouts on the input queue.
    pub receive_timeouts: u64,
    pub buffer_occupancy: usize,
    pub buffer_capacity: usize,
    /// Frames evicted from the latency buffer to make room.
    pub evicted: u64,
    /// Frames written to the recording file.
    pub recorded: u64,
    pub processor: ProcessorStats,
    pub requests: RequestStats,
}

impl PipelineStats {
    pub fn new(format: FormatDescriptor) -> Self {
        Self {
            format,
            received: 0,
            receive_timeouts: 0,
            buffer_occupancy: 0,
            buffer_capacity: 0,
            evicted: 0,
            recorded: 0,
            processor: ProcessorStats::default(),
            requests: RequestStats::default(),
        }
    }
}

/// Snapshots from `rx`, at most as often as `rate` allows.
///
/// The current snapshot is yielded first. The stream ends when the publisher is dropped.
pub fn stats_stream(rx: watch::Receiver<PipelineStats>, rate: UpdateRate) -> BoxStream<'static, PipelineStats> {
    let snapshots = WatchStream::new(rx);
    match rate.interval() {
        None => snapshots.boxed(),
        Some(period) => snapshots.throttle(period).boxed(),
    }
}
