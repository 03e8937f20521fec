//! The monomorphized pipeline: consumer thread, latency buffer, request handler,
//! frame processor and raw recording for one frame type.
//!
//! While running, the latency buffer is owned by the consumer thread. Window requests
//! and recording commands reach it through a control channel that the thread selects
//! on together with the input queue, so no lock ever wraps the buffer. While stopped
//! the buffer is back with the model and requests are served in place.

use crossbeam_channel::{Receiver, Sender, select};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, error, info, trace, warn};

use super::dispatch::PipelineShape;
use super::{Fragment, FrameProcessor, LatencyBuffer, Pipeline, PipelineSpec, RequestHandler, TimeWindow};
use crate::channel::{FrameReceiver, QueueReceiver, QueueRegistry};
use crate::config::HandlerConfig;
use crate::lifecycle::{RunMarker, WorkerThread};
use crate::opmon::PipelineStats;
use crate::types::{FormatDescriptor, FrameAdapter};
use crate::{ReadoutError, Result};

/// Frames streamed to a file until a deadline.
struct Recording {
    path: PathBuf,
    writer: BufWriter<File>,
    until: Instant,
    frames: u64,
}

enum Control {
    Request { window: TimeWindow, reply: Sender<Fragment> },
    Record(Recording),
}

/// Buffer, handler and processor of one pipeline, moved into the consumer thread for
/// the duration of a run.
struct Core<F: PipelineSpec> {
    buffer: F::Buffer,
    handler: F::Handler,
    processor: F::Processor,
    stats: PipelineStats,
    recording: Option<Recording>,
}

impl<F: PipelineSpec> Core<F> {
    fn new(config: &HandlerConfig) -> Self {
        Self {
            buffer: <F::Buffer as LatencyBuffer<F>>::with_capacity(config.latency_buffer_size),
            handler: <F::Handler as RequestHandler<F, F::Buffer>>::new(config),
            processor: Default::default(),
            stats: PipelineStats::new(F::FORMAT),
            recording: None,
        }
    }

    #[inline]
    fn ingest(&mut self, frame: F) {
        self.stats.received += 1;
        let check = self.processor.process(&frame);
        if !check.is_clean() {
            trace!(timestamp = frame.timestamp(), ?check, "Frame check failed");
        }
        if let Some(recording) = self.recording.as_mut() {
            match recording.writer.write_all(frame.as_bytes()) {
                Ok(()) => {
                    recording.frames += 1;
                    self.stats.recorded += 1;
                }
                Err(e) => {
                    error!(path = %recording.path.display(), error = %e, "Recording write failed, stopping recording");
                    self.recording = None;
                }
            }
        }
        if self.buffer.write(frame) {
            self.stats.evicted += 1;
        }
    }

    fn control(&mut self, command: Control) {
        match command {
            Control::Request { window, reply } => {
                let fragment = self.handler.issue_request(&self.buffer, window);
                // The requester may have given up already.
                let _ = reply.send(fragment);
            }
            Control::Record(recording) => {
                info!(path = %recording.path.display(), "Recording started");
                self.finish_recording();
                self.recording = Some(recording);
            }
        }
    }

    fn expire_recording(&mut self, now: Instant) {
        if self.recording.as_ref().is_some_and(|r| now >= r.until) {
            self.finish_recording();
        }
    }

    fn finish_recording(&mut self) {
        if let Some(mut recording) = self.recording.take() {
            match recording.writer.flush() {
                Ok(()) => info!(path = %recording.path.display(), frames = recording.frames, "Recording finished"),
                Err(e) => error!(path = %recording.path.display(), error = %e, "Failed to flush recording"),
            }
        }
    }

    fn snapshot(&self) -> PipelineStats {
        let mut stats = self.stats.clone();
        stats.buffer_occupancy = self.buffer.occupancy();
        stats.buffer_capacity = self.buffer.capacity();
        stats.processor = self.processor.stats();
        stats.requests = self.handler.stats();
        stats
    }

    fn publish(&self, tx: &watch::Sender<PipelineStats>) {
        tx.send_replace(self.snapshot());
    }
}

/// Consumer loop: receive, process, buffer; answer control commands in between.
fn consume<F: PipelineSpec>(
    mut core: Core<F>,
    input: QueueReceiver<F>,
    control: Receiver<Control>,
    running: RunMarker,
    timeout: Duration,
    stats_every: u64,
    stats_tx: Arc<watch::Sender<PipelineStats>>,
) -> Core<F> {
    info!(format = %F::FORMAT, queue = input.name(), "Consumer loop started");
    let stats_every = stats_every.max(1);

    while running.is_running() {
        select! {
            recv(input.as_crossbeam()) -> frame => match frame {
                Ok(frame) => {
                    // Commands issued before this frame was queued apply to it.
                    while let Ok(command) = control.try_recv() {
                        core.control(command);
                    }
                    core.ingest(frame);
                    if core.stats.received % stats_every == 0 {
                        core.publish(&stats_tx);
                    }
                }
                Err(_) => {
                    error!(format = %F::FORMAT, "Input queue disconnected, consumer loop exiting");
                    break;
                }
            },
            recv(control) -> command => match command {
                Ok(command) => core.control(command),
                Err(_) => break,
            },
            default(timeout) => {
                core.stats.receive_timeouts += 1;
                core.publish(&stats_tx);
            }
        }
        core.expire_recording(Instant::now());
    }

    core.finish_recording();
    core.publish(&stats_tx);
    info!(format = %F::FORMAT, received = core.stats.received, "Consumer loop stopped");
    core
}

/// Pipeline for frames of type `F`, assembled from its [`PipelineSpec`] table entry.
pub struct DataHandlingModel<F: PipelineSpec> {
    run_marker: RunMarker,
    config: HandlerConfig,
    input: Option<QueueReceiver<F>>,
    /// Present while not running.
    core: Option<Core<F>>,
    worker: Option<WorkerThread<Core<F>>>,
    control: Option<Sender<Control>>,
    recording_until: Option<Instant>,
    stats_tx: Arc<watch::Sender<PipelineStats>>,
}

impl<F: PipelineSpec> DataHandlingModel<F> {
    pub fn new(run_marker: RunMarker) -> Self {
        let (stats_tx, _) = watch::channel(PipelineStats::new(F::FORMAT));
        Self {
            run_marker,
            config: HandlerConfig::default(),
            input: None,
            core: None,
            worker: None,
            control: None,
            recording_until: None,
            stats_tx: Arc::new(stats_tx),
        }
    }

    pub fn is_running(&self) -> bool {
        self.worker.is_some()
    }

    /// Takes the core back from a consumer loop that ended on its own, e.g. because a
    /// shared run marker was cleared elsewhere.
    fn reclaim_core(&mut self) -> Result<()> {
        let Some(worker) = self.worker.take() else {
            return Ok(());
        };
        self.control = None;
        self.recording_until = None;
        self.core = Some(worker.join()?);
        warn!(format = %F::FORMAT, "Consumer loop ended without a stop command, serving requests from the buffer");
        Ok(())
    }

    fn serve(&mut self, window: TimeWindow) -> Option<Fragment> {
        self.core.as_mut().map(|core| core.handler.issue_request(&core.buffer, window))
    }
}

impl<F: PipelineSpec> Pipeline for DataHandlingModel<F> {
    fn format(&self) -> FormatDescriptor {
        F::FORMAT
    }

    fn shape(&self) -> PipelineShape {
        PipelineShape::of::<F>()
    }

    fn init(&mut self, registry: &QueueRegistry, config: &HandlerConfig) -> Result<()> {
        let input = registry.receiver::<F>(&config.raw_input)?;
        self.config = config.clone();
        self.input = Some(input);
        self.core = Some(Core::new(config));
        debug!(format = %F::FORMAT, queue = %config.raw_input, capacity = config.latency_buffer_size, "Pipeline initialized");
        Ok(())
    }

    fn start(&mut self) -> Result<()> {
        if self.worker.is_some() {
            return Err(ReadoutError::configuration(format!("{} pipeline is already running", F::FORMAT)));
        }
        let input = self
            .input
            .clone()
            .ok_or_else(|| ReadoutError::configuration(format!("{} pipeline started before init", F::FORMAT)))?;
        let mut core = self.core.take().unwrap_or_else(|| Core::new(&self.config));
        core.buffer.clear();
        core.publish(&self.stats_tx);

        let (control_tx, control_rx) = crossbeam_channel::unbounded();
        let timeout = self.config.receive_timeout();
        let stats_every = self.config.stats_every;
        let stats_tx = Arc::clone(&self.stats_tx);
        let worker = WorkerThread::spawn(format!("consumer-{}", self.config.raw_input), self.run_marker.clone(), move |running| {
            consume(core, input, control_rx, running, timeout, stats_every, stats_tx)
        })?;
        self.worker = Some(worker);
        self.control = Some(control_tx);
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        let Some(worker) = self.worker.take() else {
            return Ok(());
        };
        let core = worker.stop();
        self.control = None;
        self.recording_until = None;
        self.core = Some(core?);
        Ok(())
    }

    fn scrap(&mut self) -> Result<()> {
        self.stop()?;
        self.input = None;
        self.core = None;
        Ok(())
    }

    fn request(&mut self, window: TimeWindow, timeout: Duration) -> Result<Fragment> {
        if self.worker.as_ref().is_some_and(WorkerThread::is_finished) {
            self.reclaim_core()?;
        }
        if let Some(fragment) = self.serve(window) {
            return Ok(fragment);
        }
        let control = self
            .control
            .as_ref()
            .ok_or_else(|| ReadoutError::configuration(format!("{} pipeline is not initialized", F::FORMAT)))?;
        let (reply_tx, reply_rx) = crossbeam_channel::bounded(1);
        let reply = match control.send(Control::Request { window, reply: reply_tx }) {
            Ok(()) => reply_rx.recv_timeout(timeout),
            Err(_) => Err(crossbeam_channel::RecvTimeoutError::Disconnected),
        };
        match reply {
            Ok(fragment) => Ok(fragment),
            Err(crossbeam_channel::RecvTimeoutError::Timeout) => Err(ReadoutError::Timeout { duration: timeout }),
            // The consumer loop exited between the check above and the send.
            Err(crossbeam_channel::RecvTimeoutError::Disconnected) => {
                self.reclaim_core()?;
                self.serve(window).ok_or_else(|| ReadoutError::disconnected(format!("{} consumer", F::FORMAT)))
            }
        }
    }

    fn record(&mut self, duration: Duration) -> Result<()> {
        let control = self
            .control
            .as_ref()
            .ok_or_else(|| ReadoutError::configuration(format!("{} pipeline is not running", F::FORMAT)))?;
        if self.recording_until.is_some_and(|until| Instant::now() < until) {
            warn!(format = %F::FORMAT, "A recording is already in progress");
            return Err(ReadoutError::configuration("a recording is already in progress"));
        }
        let path = self
            .config
            .recording_file
            .clone()
            .ok_or_else(|| ReadoutError::configuration("no recording_file configured for this handler"))?;
        let file = File::create(&path).map_err(|e| ReadoutError::file_error(&path, e))?;
        let until = Instant::now() + duration;
        let recording = Recording { path, writer: BufWriter::new(file), until, frames: 0 };
        control
            .send(Control::Record(recording))
            .map_err(|_| ReadoutError::disconnected(format!("{} consumer", F::FORMAT)))?;
        self.recording_until = Some(until);
        Ok(())
    }

    fn stats(&self) -> PipelineStats {
        self.stats_tx.borrow().clone()
    }

    fn subscribe(&self) -> watch::Receiver<PipelineStats> {
        self.stats_tx.subscribe()
    }
}
