//! Recorder modules: drain a queue and write raw frames to a file.
//!
//! The output is the plain concatenation of frame bytes, which is exactly what
//! [`ReplaySource`](crate::providers::ReplaySource) reads back.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{error, info};

use crate::channel::{ChannelError, FrameReceiver, QueueRegistry};
use crate::config::RecorderConfig;
use crate::lifecycle::{Command, DaqModule, ModuleInfo, ModuleState, RunMarker, WorkerThread};
use crate::pipeline::{FormatVisitor, PipelineSpec};
use crate::types::FrameAdapter;
use crate::{ReadoutError, Result};

/// Frames and bytes written so far.
#[derive(Debug, Default)]
pub struct RecorderCounters {
    frames: AtomicU64,
    bytes: AtomicU64,
}

impl RecorderCounters {
    pub fn frames(&self) -> u64 {
        self.frames.load(Ordering::Relaxed)
    }

    pub fn bytes(&self) -> u64 {
        self.bytes.load(Ordering::Relaxed)
    }
}

/// Writes every frame received from `Rx` to the output file.
pub struct RecorderModule<F, Rx>
where
    F: FrameAdapter,
    Rx: FrameReceiver<F> + 'static,
{
    name: String,
    state: ModuleState,
    run_marker: RunMarker,
    output_file: PathBuf,
    buffer_size: usize,
    receive_timeout: Duration,
    input: Option<Rx>,
    writer: Option<BufWriter<File>>,
    worker: Option<WorkerThread<(Rx, BufWriter<File>, Result<()>)>>,
    counters: Arc<RecorderCounters>,
    _frame: std::marker::PhantomData<fn() -> F>,
}

impl<F, Rx> RecorderModule<F, Rx>
where
    F: FrameAdapter,
    Rx: FrameReceiver<F> + 'static,
{
    pub fn new(name: impl Into<String>, input: Rx, config: &RecorderConfig) -> Self {
        Self {
            name: name.into(),
            state: ModuleState::Unconfigured,
            run_marker: RunMarker::new(),
            output_file: config.output_file.clone(),
            buffer_size: config.stream_buffer_size.max(F::SIZE),
            receive_timeout: config.receive_timeout(),
            input: Some(input),
            writer: None,
            worker: None,
            counters: Arc::default(),
            _frame: std::marker::PhantomData,
        }
    }

    pub fn with_run_marker(mut self, marker: RunMarker) -> Self {
        self.run_marker = marker;
        self
    }

    pub fn counters(&self) -> Arc<RecorderCounters> {
        Arc::clone(&self.counters)
    }
}

fn record_loop<F: FrameAdapter, Rx: FrameReceiver<F>>(
    input: &mut Rx,
    writer: &mut BufWriter<File>,
    path: &Path,
    running: &RunMarker,
    timeout: Duration,
    counters: &RecorderCounters,
) -> Result<()> {
    while running.is_running() {
        match input.recv_timeout(timeout) {
            Ok(frame) => {
                writer.write_all(frame.as_bytes()).map_err(|e| ReadoutError::file_error(path, e))?;
                counters.frames.fetch_add(1, Ordering::Relaxed);
                counters.bytes.fetch_add(F::SIZE as u64, Ordering::Relaxed);
            }
            Err(ChannelError::Timeout(())) => continue,
            Err(ChannelError::Disconnected(())) => return Err(ReadoutError::disconnected(input.name())),
        }
    }
    writer.flush().map_err(|e| ReadoutError::file_error(path, e))
}

impl<F, Rx> DaqModule for RecorderModule<F, Rx>
where
    F: FrameAdapter,
    Rx: FrameReceiver<F> + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn state(&self) -> ModuleState {
        self.state
    }

    fn configure(&mut self) -> Result<()> {
        let next = self.state.transition(Command::Configure)?;
        let file = File::create(&self.output_file).map_err(|e| ReadoutError::file_error(&self.output_file, e))?;
        self.writer = Some(BufWriter::with_capacity(self.buffer_size, file));
        info!(recorder = %self.name, path = %self.output_file.display(), format = %F::FORMAT, "Recorder configured");
        self.state = next;
        Ok(())
    }

    fn start(&mut self) -> Result<()> {
        let next = self.state.transition(Command::Start)?;
        let (Some(mut input), Some(mut writer)) = (self.input.take(), self.writer.take()) else {
            return Err(ReadoutError::configuration(format!("recorder '{}' lost its queue or file", self.name)));
        };
        let timeout = self.receive_timeout;
        let counters = Arc::clone(&self.counters);
        let path = self.output_file.clone();
        let worker = WorkerThread::spawn(format!("recorder-{}", self.name), self.run_marker.clone(), move |running| {
            let outcome = record_loop(&mut input, &mut writer, &path, &running, timeout, &counters);
            (input, writer, outcome)
        })?;
        self.worker = Some(worker);
        self.state = next;
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        let next = self.state.transition(Command::Stop)?;
        self.state = next;
        let Some(worker) = self.worker.take() else {
            return Ok(());
        };
        let (input, writer, outcome) = worker.stop()?;
        self.input = Some(input);
        self.writer = Some(writer);
        info!(
            recorder = %self.name,
            frames = self.counters.frames(),
            bytes = self.counters.bytes(),
            "Recorder stopped"
        );
        if let Err(e) = &outcome {
            error!(recorder = %self.name, error = %e, "Recording loop failed");
        }
        outcome
    }

    fn scrap(&mut self) -> Result<()> {
        let next = self.state.transition(Command::Scrap)?;
        if let Some(mut writer) = self.writer.take() {
            writer.flush().map_err(|e| ReadoutError::file_error(&self.output_file, e))?;
        }
        self.state = next;
        Ok(())
    }

    fn info(&self) -> ModuleInfo {
        ModuleInfo { name: self.name.clone(), state: self.state, frames: self.counters.frames() }
    }
}

/// Builds a recorder for the queue named in `config.input`.
pub fn create_recorder(name: &str, registry: &QueueRegistry, config: &RecorderConfig) -> Result<Box<dyn DaqModule>> {
    let format = registry.endpoint(&config.input)?.resolve_format()?;
    format.dispatch(MakeRecorder { name, registry, config })
}

struct MakeRecorder<'a> {
    name: &'a str,
    registry: &'a QueueRegistry,
    config: &'a RecorderConfig,
}

impl FormatVisitor for MakeRecorder<'_> {
    type Output = Result<Box<dyn DaqModule>>;

    fn visit<F: PipelineSpec>(self) -> Self::Output {
        let input = self.registry.receiver::<F>(&self.config.input)?;
        Ok(Box::new(RecorderModule::<F, _>::new(self.name, input, self.config)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::FrameSender;
    use crate::providers::ReplaySource;
    use crate::provider::HardwareSource;
    use crate::test_utils::frame;
    use crate::types::SspFrame;
    use std::time::Instant;

    #[test]
    fn recorded_file_replays_frame_for_frame() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ssp.bin");
        let mut registry = QueueRegistry::new();
        registry.declare::<SspFrame>("ssp", 16).unwrap();
        let mut tx = registry.sender::<SspFrame>("ssp").unwrap();
        let config = RecorderConfig { input: "ssp".into(), output_file: path.clone(), receive_timeout_ms: 5, ..RecorderConfig::default() };

        let mut recorder = create_recorder("rec", &registry, &config).unwrap();
        recorder.configure().unwrap();
        recorder.start().unwrap();
        for ts in [10, 20, 30] {
            tx.send_timeout(frame::<SspFrame>(ts), Duration::from_millis(100)).unwrap();
        }
        let deadline = Instant::now() + Duration::from_secs(5);
        while recorder.info().frames < 3 {
            assert!(Instant::now() < deadline);
            std::thread::sleep(Duration::from_millis(1));
        }
        recorder.stop().unwrap();
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 3 * SspFrame::SIZE as u64);

        let mut replay = ReplaySource::<SspFrame>::open(&path, false).unwrap();
        let mut buffer = replay.allocate().unwrap();
        replay.start().unwrap();
        let mut timestamps = Vec::new();
        while replay.fill(&mut buffer).unwrap() > 0 {
            timestamps.push(SspFrame::from_bytes(buffer.as_slice()).unwrap().timestamp());
        }
        assert_eq!(timestamps, vec![10, 20, 30]);
    }

    #[test]
    fn unwritable_output_fails_configure() {
        let dir = tempfile::tempdir().unwrap();
        let (_tx, rx) = crate::channel::bounded::<SspFrame>("ssp", 1);
        let config = RecorderConfig { output_file: dir.path().join("missing/dir/out.bin"), ..RecorderConfig::default() };
        let mut recorder = RecorderModule::<SspFrame, _>::new("rec", rx, &config);
        assert!(matches!(recorder.configure(), Err(ReadoutError::File { .. })));
        assert_eq!(recorder.state(), ModuleState::Unconfigured);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn failed_write_reports_the_output_path() {
        let (mut tx, rx) = crate::channel::bounded::<SspFrame>("ssp", 4);
        // An unbuffered writer hits the device on the first frame.
        let config = RecorderConfig {
            output_file: PathBuf::from("/dev/full"),
            receive_timeout_ms: 5,
            stream_buffer_size: 0,
            ..RecorderConfig::default()
        };
        let mut recorder = RecorderModule::<SspFrame, _>::new("rec", rx, &config);
        recorder.configure().unwrap();
        recorder.start().unwrap();
        tx.send_timeout(frame(1), Duration::from_millis(100)).unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        while !recorder.worker.as_ref().is_some_and(WorkerThread::is_finished) {
            assert!(Instant::now() < deadline, "recorder kept running after a failed write");
            std::thread::sleep(Duration::from_millis(1));
        }
        match recorder.stop() {
            Err(ReadoutError::File { path, .. }) => assert_eq!(path, PathBuf::from("/dev/full")),
            other => panic!("expected a file error, got {other:?}"),
        }
        assert_eq!(recorder.counters().frames(), 0);
    }

    #[test]
    fn counters_track_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let (mut tx, rx) = crate::channel::bounded::<SspFrame>("ssp", 4);
        let config = RecorderConfig { output_file: dir.path().join("out.bin"), receive_timeout_ms: 5, ..RecorderConfig::default() };
        let mut recorder = RecorderModule::<SspFrame, _>::new("rec", rx, &config);
        let counters = recorder.counters();
        recorder.configure().unwrap();
        recorder.start().unwrap();
        tx.send_timeout(frame(1), Duration::from_millis(100)).unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        while counters.frames() < 1 {
            assert!(Instant::now() < deadline);
            std::thread::sleep(Duration::from_millis(1));
        }
        recorder.stop().unwrap();
        assert_eq!(counters.bytes(), SspFrame::SIZE as u64);
    }
}
