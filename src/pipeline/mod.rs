//! Statically specialized processing pipelines and the dispatcher that selects them.
//!
//! A pipeline is a latency buffer, a request handler and a frame processor bound to one
//! frame type. The combination for each frame type is fixed at compile time through
//! [`PipelineSpec`]; the runtime [`FormatDescriptor`] of an endpoint only picks which
//! monomorphized [`DataHandlingModel`] gets built, see [`create_pipeline`].
//!
//! ```
//! use fdreadout::lifecycle::RunMarker;
//! use fdreadout::pipeline::create_pipeline;
//!
//! let pipeline = create_pipeline("WIBEthFrame", RunMarker::new()).unwrap();
//! assert_eq!(pipeline.shape().frame_processor, "WibEthFrameProcessor");
//! assert!(create_pipeline("UnknownFrame", RunMarker::new()).is_none());
//! ```

pub mod dispatch;
pub mod latency_buffer;
pub mod model;
pub mod processor;
pub mod request_handler;

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::watch;

use crate::Result;
use crate::channel::QueueRegistry;
use crate::config::HandlerConfig;
use crate::opmon::PipelineStats;
use crate::types::{CrtFrame, DaphneFrame, DaphneStreamFrame, FormatDescriptor, FrameAdapter, SspFrame, TdeFrame, WibEthFrame};

pub use dispatch::{FormatVisitor, PipelineShape, create_pipeline};
pub use latency_buffer::{LatencyBuffer, OrderedMapBuffer, SortedQueue};
pub use model::DataHandlingModel;
pub use processor::{
    CrtFrameProcessor, DaphneFrameProcessor, DaphneStreamFrameProcessor, FrameCheck, FrameProcessor, ProcessorStats,
    SspFrameProcessor, TdeFrameProcessor, WibEthFrameProcessor,
};
pub use request_handler::{DefaultRequestHandler, RequestHandler, RequestStats};

/// Half-open timestamp range `[begin, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TimeWindow {
    pub begin: u64,
    pub end: u64,
}

impl TimeWindow {
    pub const fn new(begin: u64, end: u64) -> Self {
        Self { begin, end }
    }

    pub const fn is_empty(&self) -> bool {
        self.end <= self.begin
    }

    pub const fn contains(&self, timestamp: u64) -> bool {
        timestamp >= self.begin && timestamp < self.end
    }
}

/// How a window request relates to the buffered data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestOutcome {
    /// The whole window lies inside the buffered range.
    Found,
    /// The window overlaps the buffered range but sticks out of it.
    Partial,
    /// Everything in the window has already been evicted.
    TooOld,
    /// The window starts after the newest buffered frame.
    NotYet,
    /// Zero-length or inverted window.
    Empty,
}

/// Frames returned for one window request, concatenated in timestamp order.
#[derive(Clone, PartialEq, Eq)]
pub struct Fragment {
    pub format: FormatDescriptor,
    pub window: TimeWindow,
    pub outcome: RequestOutcome,
    frame_size: usize,
    timestamp_offset: usize,
    data: Vec<u8>,
}

impl std::fmt::Debug for Fragment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fragment")
            .field("format", &self.format)
            .field("window", &self.window)
            .field("outcome", &self.outcome)
            .field("frames", &self.frame_count())
            .finish()
    }
}

impl Fragment {
    /// An empty fragment for frames of type `F`.
    pub fn new<F: FrameAdapter>(window: TimeWindow, outcome: RequestOutcome) -> Self {
        Self {
            format: F::FORMAT,
            window,
            outcome,
            frame_size: F::SIZE,
            timestamp_offset: F::TIMESTAMP_OFFSET,
            data: Vec::new(),
        }
    }

    pub(crate) fn push_frame(&mut self, bytes: &[u8]) {
        self.data.extend_from_slice(bytes);
    }

    pub fn frame_size(&self) -> usize {
        self.frame_size
    }

    pub fn frame_count(&self) -> usize {
        self.data.len() / self.frame_size.max(1)
    }

    /// Raw bytes of each frame.
    pub fn frames(&self) -> impl Iterator<Item = &[u8]> {
        self.data.chunks_exact(self.frame_size.max(1))
    }

    pub fn timestamps(&self) -> impl Iterator<Item = u64> + '_ {
        let offset = self.timestamp_offset;
        self.frames().map(move |frame| crate::types::read_u64_le(frame, offset))
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn into_data(self) -> Vec<u8> {
        self.data
    }
}

/// Compile-time pipeline composition for one frame type.
pub trait PipelineSpec: FrameAdapter {
    type Buffer: LatencyBuffer<Self>;
    type Handler: RequestHandler<Self, Self::Buffer>;
    type Processor: FrameProcessor<Self>;
}

macro_rules! pipeline_spec {
    ($($frame:ty => $buffer:ident, $processor:ty;)*) => {
        $(
            impl PipelineSpec for $frame {
                type Buffer = $buffer<$frame>;
                type Handler = DefaultRequestHandler;
                type Processor = $processor;
            }
        )*
    };
}

pipeline_spec! {
    WibEthFrame => SortedQueue, WibEthFrameProcessor;
    DaphneFrame => OrderedMapBuffer, DaphneFrameProcessor;
    DaphneStreamFrame => SortedQueue, DaphneStreamFrameProcessor;
    SspFrame => SortedQueue, SspFrameProcessor;
    TdeFrame => OrderedMapBuffer, TdeFrameProcessor;
    CrtFrame => SortedQueue, CrtFrameProcessor;
}

/// A type-erased pipeline, as handed to the data handler module.
///
/// All per-frame work happens inside the monomorphized implementation; this trait is
/// only crossed by lifecycle commands and requests.
pub trait Pipeline: Send {
    fn format(&self) -> FormatDescriptor;

    fn shape(&self) -> PipelineShape;

    /// Binds the pipeline to its input queue and sizes its buffer.
    fn init(&mut self, registry: &QueueRegistry, config: &HandlerConfig) -> Result<()>;

    /// Starts the consumer thread. Clears previously buffered frames.
    fn start(&mut self) -> Result<()>;

    /// Stops the consumer thread. The buffer stays queryable.
    fn stop(&mut self) -> Result<()>;

    /// Drops the input queue and buffered frames.
    fn scrap(&mut self) -> Result<()>;

    /// Reads every buffered frame inside `window`, waiting at most `timeout` for a
    /// running consumer thread to answer.
    fn request(&mut self, window: TimeWindow, timeout: Duration) -> Result<Fragment>;

    /// Streams received frames to the recording file for `duration`.
    fn record(&mut self, duration: Duration) -> Result<()>;

    fn stats(&self) -> PipelineStats;

    fn subscribe(&self) -> watch::Receiver<PipelineStats>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn window_is_half_open() {
        let window = TimeWindow::new(10, 20);
        assert!(window.contains(10));
        assert!(!window.contains(20));
        assert!(!window.is_empty());
        assert!(TimeWindow::new(5, 5).is_empty());
        assert!(TimeWindow::new(6, 5).is_empty());
    }

    #[test]
    fn fragment_splits_frames_and_reads_timestamps() {
        let mut fragment = Fragment::new::<CrtFrame>(TimeWindow::new(0, 100), RequestOutcome::Found);
        for ts in [3u64, 4] {
            fragment.push_frame(&crate::test_utils::frame_bytes::<CrtFrame>(ts));
        }
        assert_eq!(fragment.frame_count(), 2);
        assert_eq!(fragment.frames().count(), 2);
        assert_eq!(fragment.timestamps().collect::<Vec<_>>(), vec![3, 4]);
        assert_eq!(fragment.into_data().len(), 2 * CrtFrame::SIZE);
    }
}
