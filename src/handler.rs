//! Data handler modules: a dispatched pipeline behind the module lifecycle.

use futures::stream::BoxStream;
use std::time::Duration;
use tracing::{info, warn};

use crate::channel::QueueRegistry;
use crate::config::HandlerConfig;
use crate::lifecycle::{Command, DaqModule, ModuleInfo, ModuleState, RunMarker};
use crate::opmon::{PipelineStats, stats_stream};
use crate::pipeline::{Fragment, Pipeline, PipelineShape, TimeWindow, create_pipeline};
use crate::types::{FormatDescriptor, UpdateRate};
use crate::{ReadoutError, Result};

/// How long a request waits for the consumer thread of a running pipeline.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(1);

/// Owns the pipeline selected for its input queue's data type.
pub struct DataHandlerModule {
    name: String,
    state: ModuleState,
    run_marker: RunMarker,
    pipeline: Box<dyn Pipeline>,
    request_timeout: Duration,
}

impl DataHandlerModule {
    /// Resolves the data type of `config.raw_input`, builds the matching pipeline and
    /// binds it to the queue.
    pub fn init(name: impl Into<String>, registry: &QueueRegistry, config: HandlerConfig) -> Result<Self> {
        Self::init_with_marker(name, registry, config, RunMarker::new())
    }

    /// Like [`init`](Self::init), sharing `run_marker` with other modules.
    pub fn init_with_marker(
        name: impl Into<String>,
        registry: &QueueRegistry,
        config: HandlerConfig,
        run_marker: RunMarker,
    ) -> Result<Self> {
        let name = name.into();
        let endpoint = registry.endpoint(&config.raw_input)?;
        let data_type = endpoint.data_type()?;
        let mut pipeline = create_pipeline(data_type, run_marker.clone())
            .ok_or_else(|| ReadoutError::unsupported_format(data_type))?;
        pipeline.init(registry, &config)?;
        info!(handler = %name, queue = %config.raw_input, format = %pipeline.format(), "Data handler initialized");
        Ok(Self { name, state: ModuleState::Unconfigured, run_marker, pipeline, request_timeout: REQUEST_TIMEOUT })
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn format(&self) -> FormatDescriptor {
        self.pipeline.format()
    }

    pub fn shape(&self) -> PipelineShape {
        self.pipeline.shape()
    }

    pub fn run_marker(&self) -> RunMarker {
        self.run_marker.clone()
    }

    /// Reads the buffered frames inside `window`.
    ///
    /// Served by the consumer thread while running, directly from the buffer otherwise.
    pub fn request(&mut self, window: TimeWindow) -> Result<Fragment> {
        match self.state {
            ModuleState::Configured | ModuleState::Running | ModuleState::Stopped => {
                self.pipeline.request(window, self.request_timeout)
            }
            state => Err(ReadoutError::InvalidTransition { command: "request", state }),
        }
    }

    /// Writes every received frame to the configured recording file for `duration`.
    pub fn record(&mut self, duration: Duration) -> Result<()> {
        self.state.transition(Command::Record)?;
        info!(handler = %self.name, duration_ms = duration.as_millis() as u64, "Recording requested");
        self.pipeline.record(duration)
    }

    pub fn stats(&self) -> PipelineStats {
        self.pipeline.stats()
    }

    /// Statistics snapshots, at most as often as `rate` allows.
    pub fn stats_updates(&self, rate: UpdateRate) -> BoxStream<'static, PipelineStats> {
        stats_stream(self.pipeline.subscribe(), rate)
    }
}

impl DaqModule for DataHandlerModule {
    fn name(&self) -> &str {
        &self.name
    }

    fn state(&self) -> ModuleState {
        self.state
    }

    fn configure(&mut self) -> Result<()> {
        self.state = self.state.transition(Command::Configure)?;
        Ok(())
    }

    fn start(&mut self) -> Result<()> {
        let next = self.state.transition(Command::Start)?;
        self.pipeline.start()?;
        info!(handler = %self.name, "Data handler started");
        self.state = next;
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        let next = self.state.transition(Command::Stop)?;
        self.state = next;
        self.pipeline.stop()?;
        let stats = self.pipeline.stats();
        info!(handler = %self.name, received = stats.received, "Data handler stopped");
        Ok(())
    }

    fn scrap(&mut self) -> Result<()> {
        let next = self.state.transition(Command::Scrap)?;
        self.pipeline.scrap()?;
        self.state = next;
        Ok(())
    }

    fn info(&self) -> ModuleInfo {
        ModuleInfo { name: self.name.clone(), state: self.state, frames: self.pipeline.stats().received }
    }
}

impl Drop for DataHandlerModule {
    fn drop(&mut self) {
        if let Err(e) = self.pipeline.stop() {
            warn!(handler = %self.name, error = %e, "Failed to stop pipeline on drop");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::FrameSender;
    use crate::pipeline::RequestOutcome;
    use crate::test_utils::frame;
    use crate::types::{FrameAdapter, TdeFrame};
    use futures::StreamExt;
    use std::time::Instant;
    use tracing_test::traced_test;

    fn registry() -> QueueRegistry {
        let mut registry = QueueRegistry::new();
        registry.declare::<TdeFrame>("tde_link0", 32).unwrap();
        registry
    }

    fn config() -> HandlerConfig {
        HandlerConfig { raw_input: "tde_link0".into(), receive_timeout_ms: 5, stats_every: 1, ..HandlerConfig::default() }
    }

    #[test]
    fn selects_the_pipeline_of_the_input_queue() {
        let handler = DataHandlerModule::init("h", &registry(), config()).unwrap();
        assert_eq!(handler.format(), FormatDescriptor::Tde);
        assert_eq!(handler.shape().latency_buffer, "OrderedMapBuffer");
        assert_eq!(handler.state(), ModuleState::Unconfigured);
    }

    #[test]
    fn unsupported_or_ambiguous_inputs_fail_init() {
        let mut registry = registry();
        registry.declare_endpoint("odd", vec!["UnknownFrame".into()]).unwrap();
        registry.declare_endpoint("multi", vec!["TDEFrame".into(), "CRTFrame".into()]).unwrap();
        let with_input = |uid: &str| HandlerConfig { raw_input: uid.into(), ..HandlerConfig::default() };
        assert!(matches!(
            DataHandlerModule::init("h", &registry, with_input("odd")),
            Err(ReadoutError::UnsupportedFormat { .. })
        ));
        assert!(matches!(
            DataHandlerModule::init("h", &registry, with_input("multi")),
            Err(ReadoutError::Configuration { .. })
        ));
    }

    #[test]
    fn commands_follow_the_lifecycle() {
        let registry = registry();
        let mut tx = registry.sender::<TdeFrame>("tde_link0").unwrap();
        let mut handler = DataHandlerModule::init("h", &registry, config()).unwrap();

        assert!(matches!(handler.start(), Err(ReadoutError::InvalidTransition { .. })));
        assert!(matches!(handler.request(TimeWindow::new(0, 1)), Err(ReadoutError::InvalidTransition { .. })));
        handler.configure().unwrap();
        assert!(matches!(handler.record(Duration::from_secs(1)), Err(ReadoutError::InvalidTransition { .. })));
        handler.start().unwrap();

        let step = TdeFrame::TICK_DIFF;
        for i in 0..4 {
            tx.send_timeout(frame(i * step), Duration::from_millis(100)).unwrap();
        }
        let deadline = Instant::now() + Duration::from_secs(5);
        while handler.stats().received < 4 {
            assert!(Instant::now() < deadline);
            std::thread::sleep(Duration::from_millis(1));
        }
        let fragment = handler.request(TimeWindow::new(step, 3 * step)).unwrap();
        assert_eq!(fragment.outcome, RequestOutcome::Found);
        assert_eq!(fragment.frame_count(), 2);

        handler.stop().unwrap();
        assert_eq!(handler.info().frames, 4);
        handler.scrap().unwrap();
        assert_eq!(handler.state(), ModuleState::Scrapped);
    }

    #[test]
    #[traced_test]
    fn requests_are_served_after_a_shared_marker_stops_the_consumer() {
        let registry = registry();
        let mut tx = registry.sender::<TdeFrame>("tde_link0").unwrap();
        let marker = RunMarker::new();
        let mut handler = DataHandlerModule::init_with_marker("h", &registry, config(), marker.clone()).unwrap();
        handler.configure().unwrap();
        handler.start().unwrap();

        let step = TdeFrame::TICK_DIFF;
        for i in 0..4 {
            tx.send_timeout(frame(i * step), Duration::from_millis(100)).unwrap();
        }
        let deadline = Instant::now() + Duration::from_secs(5);
        while handler.stats().received < 4 {
            assert!(Instant::now() < deadline);
            std::thread::sleep(Duration::from_millis(1));
        }

        marker.clear();
        // The consumer notices the cleared marker within one receive timeout.
        std::thread::sleep(Duration::from_millis(200));
        let fragment = handler.request(TimeWindow::new(0, 2 * step)).unwrap();
        assert_eq!(fragment.outcome, RequestOutcome::Found);
        assert_eq!(fragment.frame_count(), 2);
        assert!(logs_contain("Consumer loop ended without a stop command"));

        assert_eq!(handler.state(), ModuleState::Running);
        handler.stop().unwrap();
        assert_eq!(handler.request(TimeWindow::new(0, 4 * step)).unwrap().frame_count(), 4);
    }

    /// Delegates everything but `stop`, which always fails.
    struct StuckPipeline(Box<dyn Pipeline>);

    impl Pipeline for StuckPipeline {
        fn format(&self) -> FormatDescriptor {
            self.0.format()
        }
        fn shape(&self) -> PipelineShape {
            self.0.shape()
        }
        fn init(&mut self, registry: &QueueRegistry, config: &HandlerConfig) -> Result<()> {
            self.0.init(registry, config)
        }
        fn start(&mut self) -> Result<()> {
            self.0.start()
        }
        fn stop(&mut self) -> Result<()> {
            Err(ReadoutError::Thread { thread: "consumer-stuck".into(), reason: "panicked".into() })
        }
        fn scrap(&mut self) -> Result<()> {
            self.0.scrap()
        }
        fn request(&mut self, window: TimeWindow, timeout: Duration) -> Result<Fragment> {
            self.0.request(window, timeout)
        }
        fn record(&mut self, duration: Duration) -> Result<()> {
            self.0.record(duration)
        }
        fn stats(&self) -> PipelineStats {
            self.0.stats()
        }
        fn subscribe(&self) -> tokio::sync::watch::Receiver<PipelineStats> {
            self.0.subscribe()
        }
    }

    #[test]
    #[traced_test]
    fn drop_logs_a_failed_pipeline_stop() {
        let mut handler = DataHandlerModule::init("stuck", &registry(), config()).unwrap();
        let inner = std::mem::replace(&mut handler.pipeline, create_pipeline("CRTFrame", RunMarker::new()).unwrap());
        handler.pipeline = Box::new(StuckPipeline(inner));
        drop(handler);
        assert!(logs_contain("Failed to stop pipeline on drop"));
        assert!(logs_contain("consumer-stuck"));
    }

    #[tokio::test]
    async fn stats_updates_start_with_the_current_snapshot() {
        let handler = DataHandlerModule::init("h", &registry(), config()).unwrap();
        let mut updates = handler.stats_updates(UpdateRate::Native);
        let first = updates.next().await.unwrap();
        assert_eq!(first.format, FormatDescriptor::Tde);
        assert_eq!(first.received, 0);
    }
}
