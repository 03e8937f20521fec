//! Runtime format descriptor to compile-time pipeline dispatch.
//!
//! [`FormatDescriptor::dispatch`] is the single `match` over the closed set of formats.
//! Everything generic over the frame type goes through a [`FormatVisitor`], whose
//! `visit::<F>()` is monomorphized once per frame type, so code written against `F`
//! never branches on the format again.

use serde::Serialize;
use tracing::{info, warn};

use super::{DataHandlingModel, FrameProcessor, LatencyBuffer, Pipeline, PipelineSpec, RequestHandler};
use crate::lifecycle::RunMarker;
use crate::types::{CrtFrame, DaphneFrame, DaphneStreamFrame, FormatDescriptor, FrameAdapter, SspFrame, TdeFrame, WibEthFrame};

/// Generic operation over one frame type, selected at runtime by a descriptor.
pub trait FormatVisitor {
    type Output;

    fn visit<F: PipelineSpec>(self) -> Self::Output;
}

impl FormatDescriptor {
    /// Runs `visitor` with the frame type this descriptor names.
    pub fn dispatch<V: FormatVisitor>(self, visitor: V) -> V::Output {
        match self {
            FormatDescriptor::WibEth => visitor.visit::<WibEthFrame>(),
            FormatDescriptor::Daphne => visitor.visit::<DaphneFrame>(),
            FormatDescriptor::DaphneStream => visitor.visit::<DaphneStreamFrame>(),
            FormatDescriptor::Ssp => visitor.visit::<SspFrame>(),
            FormatDescriptor::Tde => visitor.visit::<TdeFrame>(),
            FormatDescriptor::Crt => visitor.visit::<CrtFrame>(),
        }
    }

    /// Bytes per frame.
    pub fn frame_size(self) -> usize {
        self.dispatch(Layout).0
    }

    /// Byte offset of the 64-bit timestamp inside a frame.
    pub fn timestamp_offset(self) -> usize {
        self.dispatch(Layout).1
    }

    /// Expected timestamp step between consecutive frames of one stream.
    pub fn tick_diff(self) -> u64 {
        self.dispatch(Layout).2
    }
}

struct Layout;

impl FormatVisitor for Layout {
    type Output = (usize, usize, u64);

    fn visit<F: PipelineSpec>(self) -> Self::Output {
        (F::SIZE, F::TIMESTAMP_OFFSET, F::TICK_DIFF)
    }
}

/// Names of the components a pipeline was specialized with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PipelineShape {
    pub format: FormatDescriptor,
    pub latency_buffer: &'static str,
    pub request_handler: &'static str,
    pub frame_processor: &'static str,
}

impl PipelineShape {
    pub fn of<F: PipelineSpec>() -> Self {
        Self {
            format: F::FORMAT,
            latency_buffer: <F::Buffer as LatencyBuffer<F>>::NAME,
            request_handler: <F::Handler as RequestHandler<F, F::Buffer>>::NAME,
            frame_processor: <F::Processor as FrameProcessor<F>>::NAME,
        }
    }
}

struct Build {
    run_marker: RunMarker,
}

impl FormatVisitor for Build {
    type Output = Box<dyn Pipeline>;

    fn visit<F: PipelineSpec>(self) -> Self::Output {
        Box::new(DataHandlingModel::<F>::new(self.run_marker))
    }
}

/// Builds the pipeline specialized for `descriptor`.
///
/// The descriptor must name a supported format exactly. Anything else yields `None`
/// and a warning; callers turn that into a configuration error. The pipeline keeps
/// `run_marker`, so whoever holds another clone can stop it.
pub fn create_pipeline(descriptor: &str, run_marker: RunMarker) -> Option<Box<dyn Pipeline>> {
    let Some(format) = FormatDescriptor::lookup(descriptor) else {
        warn!(data_type = descriptor, "No pipeline for data type, it is not a supported frame format");
        return None;
    };
    info!("Choosing specializations for DataHandlingModel with data_type: {}", descriptor);
    let pipeline = format.dispatch(Build { run_marker });
    let shape = pipeline.shape();
    info!(
        format = %shape.format,
        latency_buffer = shape.latency_buffer,
        request_handler = shape.request_handler,
        frame_processor = shape.frame_processor,
        "Pipeline created"
    );
    Some(pipeline)
}
