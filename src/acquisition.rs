//! The poll, adapt and send loop that moves frames from a hardware source into a queue.
//!
//! One loop runs per source on a dedicated thread. Each iteration:
//!
//! 1. polls the source with a non-blocking `fill`; zero bytes means poll again at once
//! 2. adapts the filled bytes into one typed frame, discarding fills shorter than a frame
//! 3. pushes the frame with a timed send, retrying the same frame on every timeout
//!
//! The loop only ends when its [`RunMarker`] clears, on a hardware fault, or when the
//! queue is disconnected. A cleared marker is observed within one poll plus one send
//! timeout.

use serde::{Deserialize, Serialize};
use std::marker::PhantomData;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, error, info, trace, warn};

use crate::channel::{ChannelError, FrameSender};
use crate::config::DEFAULT_QUEUE_TIMEOUT_MS;
use crate::lifecycle::RunMarker;
use crate::provider::{HardwareBuffer, HardwareSource};
use crate::types::FrameAdapter;
use crate::{ReadoutError, Result};

/// What the loop does with a frame the queue keeps refusing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum RetryPolicy {
    /// Retry until the frame is delivered or the loop is stopped.
    #[default]
    Forever,
    /// Drop the frame (and count it) after this many consecutive timeouts.
    Bounded { max_timeouts: u32 },
}

/// Monotonic counters written by the loop thread and read from anywhere.
#[derive(Debug, Default)]
pub struct LoopCounters {
    sent: AtomicU64,
    send_timeouts: AtomicU64,
    dropped: AtomicU64,
    discarded_fills: AtomicU64,
    empty_polls: AtomicU64,
}

/// Point-in-time copy of [`LoopCounters`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LoopStats {
    /// Frames accepted by the queue.
    pub sent: u64,
    /// Send attempts that timed out.
    pub send_timeouts: u64,
    /// Frames given up on, by retry policy or because the loop was stopped mid-retry.
    pub dropped: u64,
    /// Fills too short to hold a frame.
    pub discarded_fills: u64,
    pub empty_polls: u64,
}

impl LoopCounters {
    pub fn sent(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> LoopStats {
        LoopStats {
            sent: self.sent.load(Ordering::Relaxed),
            send_timeouts: self.send_timeouts.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            discarded_fills: self.discarded_fills.load(Ordering::Relaxed),
            empty_polls: self.empty_polls.load(Ordering::Relaxed),
        }
    }

    #[inline]
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// The acquisition loop for frames of type `F`.
///
/// Owns the source, its buffer and the queue sender for the duration of a run;
/// [`into_parts`](Self::into_parts) returns them so the owner can stop data-taking and
/// free the buffer once the loop has exited.
pub struct AcquisitionLoop<F, S, Tx> {
    name: String,
    source: S,
    buffer: HardwareBuffer,
    sender: Tx,
    send_timeout: Duration,
    retry: RetryPolicy,
    counters: Arc<LoopCounters>,
    _frame: PhantomData<fn() -> F>,
}

impl<F, S, Tx> AcquisitionLoop<F, S, Tx>
where
    F: FrameAdapter,
    S: HardwareSource,
    Tx: FrameSender<F>,
{
    pub fn new(name: impl Into<String>, source: S, buffer: HardwareBuffer, sender: Tx) -> Self {
        Self {
            name: name.into(),
            source,
            buffer,
            sender,
            send_timeout: Duration::from_millis(DEFAULT_QUEUE_TIMEOUT_MS),
            retry: RetryPolicy::Forever,
            counters: Arc::default(),
            _frame: PhantomData,
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

    /// Shares an existing set of counters, so totals survive a stop/start cycle.
    pub fn with_counters(mut self, counters: Arc<LoopCounters>) -> Self {
        self.counters = counters;
        self
    }

    pub fn counters(&self) -> Arc<LoopCounters> {
        Arc::clone(&self.counters)
    }

    pub fn into_parts(self) -> (S, HardwareBuffer, Tx) {
        (self.source, self.buffer, self.sender)
    }

    /// Runs until `running` clears.
    ///
    /// Returns `Err` on a hardware fault or a disconnected queue; the loop is over in
    /// both cases.
    pub fn run(&mut self, running: &RunMarker) -> Result<()> {
        info!(
            reader = %self.name,
            source = self.source.name(),
            format = %F::FORMAT,
            queue = self.sender.name(),
            "Acquisition loop started"
        );

        while running.is_running() {
            let bytes_read = match self.source.fill(&mut self.buffer) {
                Ok(n) => n,
                Err(e) => {
                    error!(reader = %self.name, error = %e, "Hardware fault while polling, acquisition loop exiting");
                    return Err(e);
                }
            };

            if bytes_read == 0 {
                LoopCounters::bump(&self.counters.empty_polls);
                continue;
            }

            let Some(frame) = F::from_bytes(self.buffer.filled(bytes_read)) else {
                LoopCounters::bump(&self.counters.discarded_fills);
                debug!(reader = %self.name, bytes_read, frame_size = F::SIZE, "Discarding short fill");
                continue;
            };

            self.deliver(frame, running)?;
        }

        let stats = self.counters.snapshot();
        info!(reader = %self.name, sent = stats.sent, send_timeouts = stats.send_timeouts, dropped = stats.dropped, "Acquisition loop stopped");
        Ok(())
    }

    /// Pushes one frame, retrying the same frame on every timeout.
    fn deliver(&mut self, frame: F, running: &RunMarker) -> Result<()> {
        let mut pending = frame;
        let mut timeouts = 0u32;
        loop {
            match self.sender.send_timeout(pending, self.send_timeout) {
                Ok(()) => {
                    let sent = self.counters.sent.fetch_add(1, Ordering::Relaxed) + 1;
                    trace!(reader = %self.name, sent, "Frame pushed");
                    return Ok(());
                }
                Err(ChannelError::Timeout(frame)) => {
                    timeouts += 1;
                    LoopCounters::bump(&self.counters.send_timeouts);
                    warn!(
                        reader = %self.name,
                        queue = self.sender.name(),
                        timeout_ms = self.send_timeout.as_millis() as u64,
                        attempt = timeouts,
                        "Timeout pushing frame to output queue"
                    );

                    if matches!(self.retry, RetryPolicy::Bounded { max_timeouts } if timeouts >= max_timeouts) {
                        LoopCounters::bump(&self.counters.dropped);
                        warn!(reader = %self.name, timeouts, "Dropping frame after repeated send timeouts");
                        return Ok(());
                    }
                    if !running.is_running() {
                        LoopCounters::bump(&self.counters.dropped);
                        debug!(reader = %self.name, "Stopped while retrying, frame abandoned");
                        return Ok(());
                    }
                    pending = frame;
                }
                Err(ChannelError::Disconnected(_)) => {
                    error!(reader = %self.name, queue = self.sender.name(), "Output queue disconnected, acquisition loop exiting");
                    return Err(ReadoutError::disconnected(self.sender.name()));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{FrameReceiver, bounded};
    use crate::lifecycle::WorkerThread;
    use crate::test_utils::{FillStep, FlakySender, ScriptedSource, frame_bytes};
    use crate::types::{CrtFrame, WibEthFrame};
    use proptest::prelude::*;
    use std::time::Instant;
    use tracing_test::traced_test;

    /// Runs `acq` on the current thread until its script is exhausted.
    fn run_to_completion<F, Tx>(acq: &mut AcquisitionLoop<F, ScriptedSource, Tx>, marker: &RunMarker) -> Result<()>
    where
        F: FrameAdapter,
        Tx: FrameSender<F>,
    {
        marker.set_running();
        acq.run(marker)
    }

    fn scripted(marker: &RunMarker, steps: Vec<FillStep>) -> (ScriptedSource, HardwareBuffer) {
        let mut source = ScriptedSource::new(steps).clear_when_exhausted(marker.clone());
        let buffer = source.allocate().unwrap();
        (source, buffer)
    }

    #[test]
    fn crt_fill_is_delivered_exactly_once() {
        let marker = RunMarker::new();
        let (source, buffer) = scripted(&marker, vec![FillStep::Frame(frame_bytes::<CrtFrame>(77))]);
        let (tx, mut rx) = bounded::<CrtFrame>("crt", 4);
        let mut acq = AcquisitionLoop::new("crt_reader", source, buffer, tx);

        run_to_completion(&mut acq, &marker).unwrap();

        let frame = rx.recv_timeout(Duration::from_millis(10)).unwrap();
        assert_eq!(frame.timestamp(), 77);
        assert_eq!(frame.as_bytes().len(), 288);
        assert!(rx.recv_timeout(Duration::from_millis(1)).is_err());
        assert_eq!(acq.counters().sent(), 1);
    }

    #[test]
    #[traced_test]
    fn two_timeouts_then_success_sends_one_frame() {
        let marker = RunMarker::new();
        let (source, buffer) = scripted(&marker, vec![FillStep::Frame(frame_bytes::<CrtFrame>(5))]);
        let sender = FlakySender::<CrtFrame>::new("crt", vec![2]);
        let delivered = sender.delivered();
        let mut acq = AcquisitionLoop::new("crt_reader", source, buffer, sender).with_send_timeout(Duration::from_millis(1));

        run_to_completion(&mut acq, &marker).unwrap();

        let stats = acq.counters().snapshot();
        assert_eq!(stats.sent, 1);
        assert_eq!(stats.send_timeouts, 2);
        assert_eq!(stats.dropped, 0);
        let delivered = delivered.lock().unwrap();
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].timestamp(), 5);

        logs_assert(|lines: &[&str]| {
            match lines.iter().filter(|line| line.contains("WARN") && line.contains("Timeout pushing frame")).count() {
                2 => Ok(()),
                n => Err(format!("expected 2 timeout warnings, found {n}")),
            }
        });
    }

    #[test]
    fn empty_polls_produce_no_frames() {
        let marker = RunMarker::new();
        let mut steps = vec![FillStep::Empty; 100];
        steps.push(FillStep::Frame(frame_bytes::<CrtFrame>(1)));
        steps.extend(vec![FillStep::Empty; 50]);
        let (source, buffer) = scripted(&marker, steps);
        let sender = FlakySender::<CrtFrame>::new("crt", vec![]);
        let delivered = sender.delivered();
        let mut acq = AcquisitionLoop::<CrtFrame, _, _>::new("crt_reader", source, buffer, sender);

        run_to_completion(&mut acq, &marker).unwrap();

        // The poll that finds the script exhausted clears the marker and also reports empty.
        let stats = acq.counters().snapshot();
        assert_eq!(stats.empty_polls, 151);
        assert_eq!(stats.sent, 1);
        assert_eq!(delivered.lock().unwrap().len(), 1);
    }

    #[test]
    fn short_fill_is_discarded_not_sent() {
        let marker = RunMarker::new();
        let (source, buffer) = scripted(&marker, vec![FillStep::Frame(vec![0u8; 100])]);
        let sender = FlakySender::<CrtFrame>::new("crt", vec![]);
        let delivered = sender.delivered();
        let mut acq = AcquisitionLoop::<CrtFrame, _, _>::new("crt_reader", source, buffer, sender);

        run_to_completion(&mut acq, &marker).unwrap();

        assert_eq!(acq.counters().snapshot().discarded_fills, 1);
        assert_eq!(acq.counters().sent(), 0);
        assert!(delivered.lock().unwrap().is_empty());
    }

    #[test]
    fn hardware_fault_ends_the_loop() {
        let marker = RunMarker::new();
        let (source, buffer) = scripted(
            &marker,
            vec![FillStep::Frame(frame_bytes::<CrtFrame>(1)), FillStep::Fault("link lost".into()), FillStep::Frame(frame_bytes::<CrtFrame>(2))],
        );
        let sender = FlakySender::<CrtFrame>::new("crt", vec![]);
        let mut acq = AcquisitionLoop::<CrtFrame, _, _>::new("crt_reader", source, buffer, sender);

        let err = run_to_completion(&mut acq, &marker).unwrap_err();
        assert!(matches!(err, ReadoutError::Hardware { operation: "fill", .. }));
        assert_eq!(acq.counters().sent(), 1);
    }

    #[test]
    fn disconnected_queue_is_fatal() {
        let marker = RunMarker::new();
        let (source, buffer) = scripted(&marker, vec![FillStep::Frame(frame_bytes::<CrtFrame>(1))]);
        let (tx, rx) = bounded::<CrtFrame>("crt", 4);
        drop(rx);
        let mut acq = AcquisitionLoop::new("crt_reader", source, buffer, tx);

        assert!(matches!(run_to_completion(&mut acq, &marker), Err(ReadoutError::Disconnected { .. })));
        assert_eq!(acq.counters().sent(), 0);
    }

    #[test]
    fn bounded_policy_drops_after_max_timeouts() {
        let marker = RunMarker::new();
        let (source, buffer) =
            scripted(&marker, vec![FillStep::Frame(frame_bytes::<CrtFrame>(1)), FillStep::Frame(frame_bytes::<CrtFrame>(2))]);
        let sender = FlakySender::<CrtFrame>::new("crt", vec![3]);
        let delivered = sender.delivered();
        let mut acq = AcquisitionLoop::<CrtFrame, _, _>::new("crt_reader", source, buffer, sender)
            .with_send_timeout(Duration::from_millis(1))
            .with_retry_policy(RetryPolicy::Bounded { max_timeouts: 3 });

        run_to_completion(&mut acq, &marker).unwrap();

        let stats = acq.counters().snapshot();
        assert_eq!(stats.send_timeouts, 3);
        assert_eq!(stats.dropped, 1);
        assert_eq!(stats.sent, 1);
        assert_eq!(delivered.lock().unwrap()[0].timestamp(), 2);
    }

    #[test]
    fn stop_is_observed_while_busy_polling() {
        let marker = RunMarker::new();
        let mut source = ScriptedSource::new(vec![]).repeat_last(FillStep::Empty);
        let buffer = source.allocate().unwrap();
        let (tx, _rx) = bounded::<WibEthFrame>("wib", 4);
        let mut acq = AcquisitionLoop::new("wib_reader", source, buffer, tx);

        let worker = WorkerThread::spawn("acq-test", marker, move |m| {
            let result = acq.run(&m);
            (acq, result)
        })
        .unwrap();
        std::thread::sleep(Duration::from_millis(20));

        let start = Instant::now();
        let (acq, result) = worker.stop().unwrap();
        assert!(start.elapsed() < Duration::from_millis(500));
        result.unwrap();
        assert!(acq.counters().snapshot().empty_polls > 0);
    }

    #[test]
    fn stop_is_observed_while_retrying_a_send() {
        let marker = RunMarker::new();
        let mut source = ScriptedSource::new(vec![]).repeat_last(FillStep::Frame(frame_bytes::<CrtFrame>(3)));
        let buffer = source.allocate().unwrap();
        let sender = FlakySender::<CrtFrame>::new("crt", vec![u32::MAX]).with_real_timeouts();
        let send_timeout = Duration::from_millis(20);
        let mut acq = AcquisitionLoop::new("crt_reader", source, buffer, sender).with_send_timeout(send_timeout);

        let worker = WorkerThread::spawn("acq-retry-test", marker, move |m| {
            let result = acq.run(&m);
            (acq, result)
        })
        .unwrap();
        std::thread::sleep(Duration::from_millis(50));

        let start = Instant::now();
        let (acq, result) = worker.stop().unwrap();
        assert!(start.elapsed() < send_timeout + Duration::from_millis(500));
        result.unwrap();
        let stats = acq.counters().snapshot();
        assert_eq!(stats.sent, 0);
        assert_eq!(stats.dropped, 1);
        assert!(stats.send_timeouts >= 1);
    }

    #[derive(Debug, Clone)]
    enum Step {
        Frame,
        Empty,
        Short,
    }

    fn step() -> impl Strategy<Value = Step> {
        prop_oneof![4 => Just(Step::Frame), 2 => Just(Step::Empty), 1 => Just(Step::Short)]
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn every_adapted_frame_is_delivered_in_order(
            steps in prop::collection::vec(step(), 0..60),
            timeouts in prop::collection::vec(0u32..4, 0..60),
        ) {
            let marker = RunMarker::new();
            let mut next_ts = 0u64;
            let mut expected = Vec::new();
            let script = steps
                .iter()
                .map(|s| match s {
                    Step::Frame => {
                        next_ts += 1;
                        expected.push(next_ts);
                        FillStep::Frame(frame_bytes::<CrtFrame>(next_ts))
                    }
                    Step::Empty => FillStep::Empty,
                    Step::Short => FillStep::Frame(vec![0xff; 17]),
                })
                .collect();
            let (source, buffer) = scripted(&marker, script);
            let sender = FlakySender::<CrtFrame>::new("crt", timeouts.clone());
            let delivered = sender.delivered();
            let mut acq = AcquisitionLoop::<CrtFrame, _, _>::new("crt_reader", source, buffer, sender)
                .with_send_timeout(Duration::from_millis(1));

            run_to_completion(&mut acq, &marker).unwrap();

            let got: Vec<u64> = delivered.lock().unwrap().iter().map(|f| f.timestamp()).collect();
            prop_assert_eq!(&got, &expected);
            prop_assert_eq!(acq.counters().sent(), expected.len() as u64);
            let expected_timeouts: u64 = timeouts.iter().take(expected.len()).map(|&t| u64::from(t)).sum();
            prop_assert_eq!(acq.counters().snapshot().send_timeouts, expected_timeouts);
        }
    }
}
