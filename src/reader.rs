//! Reader modules: a hardware source and its acquisition loop behind the module
//! lifecycle.
//!
//! `configure` allocates the hardware buffer, `start` starts data-taking and spawns the
//! loop thread, `stop` joins the loop, stops data-taking and frees the buffer. A restart
//! allocates a fresh buffer.

use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use crate::acquisition::{AcquisitionLoop, LoopCounters, LoopStats, RetryPolicy};
use crate::channel::{FrameSender, QueueRegistry};
use crate::config::{ReaderConfig, SourceConfig};
use crate::lifecycle::{Command, DaqModule, ModuleInfo, ModuleState, RunMarker, WorkerThread};
use crate::pipeline::{FormatVisitor, PipelineSpec};
use crate::provider::{HardwareBuffer, HardwareSource};
use crate::providers::{EmulatedSource, ReplaySource};
use crate::types::FrameAdapter;
use crate::{ReadoutError, Result};

type LoopOutcome<F, S, Tx> = (AcquisitionLoop<F, S, Tx>, Result<()>);

/// Reads frames of type `F` from source `S` and pushes them into `Tx`.
pub struct ReaderModule<F, S, Tx>
where
    F: FrameAdapter,
    S: HardwareSource,
    Tx: FrameSender<F> + 'static,
{
    name: String,
    state: ModuleState,
    run_marker: RunMarker,
    send_timeout: Duration,
    retry: RetryPolicy,
    counters: Arc<LoopCounters>,
    /// Source and sender while the loop is not running.
    idle: Option<(S, Tx)>,
    buffer: Option<HardwareBuffer>,
    worker: Option<WorkerThread<LoopOutcome<F, S, Tx>>>,
    last_fault: Option<String>,
}

impl<F, S, Tx> ReaderModule<F, S, Tx>
where
    F: FrameAdapter,
    S: HardwareSource,
    Tx: FrameSender<F> + 'static,
{
    pub fn new(name: impl Into<String>, source: S, sender: Tx) -> Self {
        Self {
            name: name.into(),
            state: ModuleState::Unconfigured,
            run_marker: RunMarker::new(),
            send_timeout: Duration::from_millis(crate::config::DEFAULT_QUEUE_TIMEOUT_MS),
            retry: RetryPolicy::default(),
            counters: Arc::default(),
            idle: Some((source, sender)),
            buffer: None,
            worker: None,
            last_fault: None,
        }
    }

    pub fn with_send_timeout(mut self, timeout: Duration) -> Self {
        self.send_timeout = timeout;
        self
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Shares `marker` with other modules so one stop signal reaches all of them.
    pub fn with_run_marker(mut self, marker: RunMarker) -> Self {
        self.run_marker = marker;
        self
    }

    pub fn run_marker(&self) -> RunMarker {
        self.run_marker.clone()
    }

    /// Totals across all runs of this module.
    pub fn stats(&self) -> LoopStats {
        self.counters.snapshot()
    }

    /// The error that ended the last run, if it ended on its own.
    pub fn last_fault(&self) -> Option<&str> {
        self.last_fault.as_deref()
    }

    /// True while the loop thread is alive.
    pub fn is_acquiring(&self) -> bool {
        self.worker.as_ref().is_some_and(|w| !w.is_finished())
    }

    fn idle_source(&mut self) -> Result<&mut (S, Tx)> {
        self.idle
            .as_mut()
            .ok_or_else(|| ReadoutError::configuration(format!("reader '{}' lost its source in a failed run", self.name)))
    }
}

impl<F, S, Tx> DaqModule for ReaderModule<F, S, Tx>
where
    F: FrameAdapter,
    S: HardwareSource,
    Tx: FrameSender<F> + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn state(&self) -> ModuleState {
        self.state
    }

    fn configure(&mut self) -> Result<()> {
        let next = self.state.transition(Command::Configure)?;
        let (source, _) = self.idle_source()?;
        let buffer = source.allocate()?;
        info!(reader = %self.name, format = %F::FORMAT, buffer_bytes = buffer.capacity(), "Reader configured");
        self.buffer = Some(buffer);
        self.state = next;
        Ok(())
    }

    fn start(&mut self) -> Result<()> {
        let next = self.state.transition(Command::Start)?;
        let held = self.buffer.take();
        let Some((mut source, sender)) = self.idle.take() else {
            self.buffer = held;
            return Err(ReadoutError::configuration(format!("reader '{}' lost its source in a failed run", self.name)));
        };
        let prepared = match held {
            Some(buffer) => Ok(buffer),
            None => source.allocate(),
        }
        .and_then(|buffer| match source.start() {
            Ok(()) => Ok(buffer),
            Err(e) => {
                self.buffer = Some(buffer);
                Err(e)
            }
        });
        let buffer = match prepared {
            Ok(buffer) => buffer,
            Err(e) => {
                self.idle = Some((source, sender));
                return Err(e);
            }
        };

        let acquisition = AcquisitionLoop::new(self.name.clone(), source, buffer, sender)
            .with_send_timeout(self.send_timeout)
            .with_retry_policy(self.retry)
            .with_counters(Arc::clone(&self.counters));
        self.last_fault = None;
        let spawned = WorkerThread::spawn_with(
            format!("reader-{}", self.name),
            self.run_marker.clone(),
            acquisition,
            |mut acquisition, running| {
                let outcome = acquisition.run(&running);
                (acquisition, outcome)
            },
        );
        let worker = match spawned {
            Ok(worker) => worker,
            Err((e, acquisition)) => {
                error!(reader = %self.name, error = %e, "Could not spawn the acquisition thread");
                if let Some(acquisition) = acquisition {
                    let (mut source, buffer, sender) = acquisition.into_parts();
                    if let Err(stop_error) = source.stop() {
                        warn!(reader = %self.name, error = %stop_error, "Failed to stop the source after a failed start");
                    }
                    self.buffer = Some(buffer);
                    self.idle = Some((source, sender));
                }
                return Err(e);
            }
        };
        self.worker = Some(worker);
        self.state = next;
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        let next = self.state.transition(Command::Stop)?;
        let Some(worker) = self.worker.take() else {
            self.state = next;
            return Ok(());
        };
        // The loop is gone after this either way.
        self.state = next;
        let (acquisition, outcome) = worker.stop()?;
        if let Err(e) = outcome {
            warn!(reader = %self.name, error = %e, "Acquisition loop had ended on its own");
            self.last_fault = Some(e.to_string());
        }

        let (mut source, buffer, sender) = acquisition.into_parts();
        let stopped = source.stop();
        let freed = source.free(buffer);
        self.idle = Some((source, sender));
        stopped?;
        freed?;
        let stats = self.counters.snapshot();
        info!(reader = %self.name, sent = stats.sent, dropped = stats.dropped, "Reader stopped");
        Ok(())
    }

    fn scrap(&mut self) -> Result<()> {
        let next = self.state.transition(Command::Scrap)?;
        if let Some(buffer) = self.buffer.take() {
            let (source, _) = self.idle_source()?;
            source.free(buffer)?;
        }
        self.state = next;
        Ok(())
    }

    fn info(&self) -> ModuleInfo {
        ModuleInfo { name: self.name.clone(), state: self.state, frames: self.counters.sent() }
    }
}

impl<F, S, Tx> Drop for ReaderModule<F, S, Tx>
where
    F: FrameAdapter,
    S: HardwareSource,
    Tx: FrameSender<F> + 'static,
{
    fn drop(&mut self) {
        if let Some(worker) = self.worker.take() {
            if let Ok((acquisition, _)) = worker.stop() {
                let (mut source, buffer, _) = acquisition.into_parts();
                let _ = source.stop();
                let _ = source.free(buffer);
            }
        } else if let (Some(buffer), Some((source, _))) = (self.buffer.take(), self.idle.as_mut()) {
            if let Err(e) = source.free(buffer) {
                error!(reader = %self.name, error = %e, "Failed to free hardware buffer on drop");
            }
        }
    }
}

/// Builds the reader for the queue named in `config.output`, specialized for the frame
/// type its endpoint declares.
pub fn create_reader(
    name: &str,
    registry: &QueueRegistry,
    config: &ReaderConfig,
    run_marker: RunMarker,
) -> Result<Box<dyn DaqModule>> {
    let format = registry.endpoint(&config.output)?.resolve_format()?;
    info!(reader = name, format = %format, queue = %config.output, "Creating reader");
    format.dispatch(MakeReader { name, registry, config, run_marker })
}

struct MakeReader<'a> {
    name: &'a str,
    registry: &'a QueueRegistry,
    config: &'a ReaderConfig,
    run_marker: RunMarker,
}

impl MakeReader<'_> {
    fn module<F, S, Tx>(self, source: S, sender: Tx) -> Box<dyn DaqModule>
    where
        F: FrameAdapter,
        S: HardwareSource,
        Tx: FrameSender<F> + 'static,
    {
        Box::new(
            ReaderModule::<F, S, Tx>::new(self.name, source, sender)
                .with_send_timeout(self.config.queue_timeout())
                .with_retry_policy(self.config.retry_policy)
                .with_run_marker(self.run_marker),
        )
    }
}

impl FormatVisitor for MakeReader<'_> {
    type Output = Result<Box<dyn DaqModule>>;

    fn visit<F: PipelineSpec>(self) -> Self::Output {
        let config = self.config;
        let sender = self.registry.sender::<F>(&config.output)?;
        match &config.source {
            SourceConfig::Emulated(emulator) => {
                let source = EmulatedSource::<F>::new(emulator);
                Ok(self.module::<F, _, _>(source, sender))
            }
            SourceConfig::Replay { file, looping } => {
                let source = ReplaySource::<F>::open(file, *looping)?;
                Ok(self.module::<F, _, _>(source, sender))
            }
        }
    }
}
