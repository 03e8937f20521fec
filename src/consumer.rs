//! Generic consumer modules for queues whose contents are only inspected.
//!
//! A [`DummyConsumer`] drains a queue on its own thread and hands every packet to a
//! [`PacketCallback`]. The callbacks here validate fragments against their request
//! window and count WIBEth error bits.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::channel::{ChannelError, FrameReceiver};
use crate::lifecycle::{Command, DaqModule, ModuleInfo, ModuleState, RunMarker, WorkerThread};
use crate::pipeline::Fragment;
use crate::types::WibEthFrame;
use crate::{ReadoutError, Result};

const RECEIVE_TIMEOUT: Duration = Duration::from_millis(100);

/// Per-packet hook of a [`DummyConsumer`].
pub trait PacketCallback<T>: Send + 'static {
    fn on_packet(&mut self, packet: &mut T);
}

/// Accepts packets and does nothing with them.
#[derive(Debug, Default, Clone, Copy)]
pub struct Discard;

impl<T> PacketCallback<T> for Discard {
    fn on_packet(&mut self, _packet: &mut T) {}
}

/// Checks that every frame of a fragment lies inside the fragment's window.
#[derive(Debug, Default, Clone)]
pub struct FragmentValidator {
    counts: Arc<ValidationCounts>,
}

#[derive(Debug, Default)]
pub struct ValidationCounts {
    pub fragments: AtomicU64,
    pub empty_fragments: AtomicU64,
    /// Frames whose timestamp falls outside the requested window.
    pub misplaced_frames: AtomicU64,
}

impl FragmentValidator {
    pub fn counts(&self) -> Arc<ValidationCounts> {
        Arc::clone(&self.counts)
    }

    /// Number of frames in `fragment` outside its window.
    pub fn misplaced(fragment: &Fragment) -> u64 {
        fragment.timestamps().filter(|&ts| !fragment.window.contains(ts)).count() as u64
    }
}

impl PacketCallback<Fragment> for FragmentValidator {
    fn on_packet(&mut self, fragment: &mut Fragment) {
        self.counts.fragments.fetch_add(1, Ordering::Relaxed);
        if fragment.frame_count() == 0 {
            self.counts.empty_fragments.fetch_add(1, Ordering::Relaxed);
            debug!(format = %fragment.format, outcome = ?fragment.outcome, "Empty fragment");
            return;
        }
        let misplaced = Self::misplaced(fragment);
        if misplaced > 0 {
            self.counts.misplaced_frames.fetch_add(misplaced, Ordering::Relaxed);
            warn!(
                format = %fragment.format,
                begin = fragment.window.begin,
                end = fragment.window.end,
                misplaced,
                "Fragment contains frames outside the requested window"
            );
        }
    }
}

/// Sums the error bits of WIBEth frames.
#[derive(Debug, Default, Clone)]
pub struct ErroredFrameCounter {
    error_bits: Arc<AtomicU64>,
}

impl ErroredFrameCounter {
    pub fn error_bits(&self) -> u64 {
        self.error_bits.load(Ordering::Relaxed)
    }
}

impl PacketCallback<WibEthFrame> for ErroredFrameCounter {
    fn on_packet(&mut self, frame: &mut WibEthFrame) {
        let flags = frame.error_flags();
        if flags != 0 {
            self.error_bits.fetch_add(u64::from(flags.count_ones()), Ordering::Relaxed);
        }
    }
}

/// Drains a queue of `T`, running `C` on each packet.
pub struct DummyConsumer<T, Rx, C>
where
    T: Send + 'static,
    Rx: FrameReceiver<T> + 'static,
    C: PacketCallback<T>,
{
    name: String,
    state: ModuleState,
    run_marker: RunMarker,
    parts: Option<(Rx, C)>,
    worker: Option<WorkerThread<(Rx, C)>>,
    processed: Arc<AtomicU64>,
    _packet: std::marker::PhantomData<fn() -> T>,
}

impl<T, Rx, C> DummyConsumer<T, Rx, C>
where
    T: Send + 'static,
    Rx: FrameReceiver<T> + 'static,
    C: PacketCallback<T>,
{
    pub fn new(name: impl Into<String>, input: Rx, callback: C) -> Self {
        Self {
            name: name.into(),
            state: ModuleState::Unconfigured,
            run_marker: RunMarker::new(),
            parts: Some((input, callback)),
            worker: None,
            processed: Arc::default(),
            _packet: std::marker::PhantomData,
        }
    }

    pub fn packets_processed(&self) -> u64 {
        self.processed.load(Ordering::Relaxed)
    }
}

impl<T, Rx, C> DaqModule for DummyConsumer<T, Rx, C>
where
    T: Send + 'static,
    Rx: FrameReceiver<T> + 'static,
    C: PacketCallback<T>,
{
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
        let (mut input, mut callback) = self
            .parts
            .take()
            .ok_or_else(|| ReadoutError::configuration(format!("consumer '{}' lost its queue", self.name)))?;
        let processed = Arc::clone(&self.processed);
        let name = self.name.clone();
        let worker = WorkerThread::spawn(format!("consumer-{}", self.name), self.run_marker.clone(), move |running| {
            while running.is_running() {
                match input.recv_timeout(RECEIVE_TIMEOUT) {
                    Ok(mut packet) => {
                        callback.on_packet(&mut packet);
                        processed.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(ChannelError::Timeout(())) => {}
                    Err(ChannelError::Disconnected(())) => {
                        warn!(consumer = %name, "Input queue disconnected");
                        break;
                    }
                }
            }
            (input, callback)
        })?;
        self.worker = Some(worker);
        self.state = next;
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        self.state = self.state.transition(Command::Stop)?;
        if let Some(worker) = self.worker.take() {
            self.parts = Some(worker.stop()?);
        }
        info!(consumer = %self.name, processed = self.packets_processed(), "Consumer stopped");
        Ok(())
    }

    fn scrap(&mut self) -> Result<()> {
        self.state = self.state.transition(Command::Scrap)?;
        Ok(())
    }

    fn info(&self) -> ModuleInfo {
        ModuleInfo { name: self.name.clone(), state: self.state, frames: self.packets_processed() }
    }
}
