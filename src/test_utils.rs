//! Test doubles for hardware sources and queues, plus frame builders.
//!
//! Compiled for unit tests and for the `benchmark` feature so benches can drive the
//! acquisition loop without hardware.

#![cfg(any(test, feature = "benchmark"))]

use std::collections::VecDeque;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::channel::{ChannelError, FrameSender};
use crate::lifecycle::RunMarker;
use crate::provider::{HardwareBuffer, HardwareSource};
use crate::types::{FrameAdapter, write_u64_le};
use crate::{ReadoutError, Result};

/// Raw bytes of an `F` frame carrying `timestamp`, all other bytes zero.
pub fn frame_bytes<F: FrameAdapter>(timestamp: u64) -> Vec<u8> {
    let mut bytes = vec![0u8; F::SIZE];
    write_u64_le(&mut bytes, F::TIMESTAMP_OFFSET, timestamp);
    bytes
}

/// An `F` frame carrying `timestamp`.
pub fn frame<F: FrameAdapter>(timestamp: u64) -> F {
    match F::from_bytes(&frame_bytes::<F>(timestamp)) {
        Some(frame) => frame,
        None => unreachable!("frame_bytes always produces SIZE bytes"),
    }
}

/// One scripted answer of [`ScriptedSource::fill`].
#[derive(Debug, Clone)]
pub enum FillStep {
    /// Copy these bytes to the buffer and report their length.
    Frame(Vec<u8>),
    /// Report zero bytes.
    Empty,
    /// Fail with a hardware error.
    Fault(String),
}

/// Calls seen by a [`ScriptedSource`], shared so tests can inspect them after the
/// source moved into a module.
#[derive(Debug, Default)]
pub struct SourceLedger {
    pub allocations: AtomicU32,
    pub frees: AtomicU32,
    pub starts: AtomicU32,
    pub stops: AtomicU32,
}

impl SourceLedger {
    pub fn outstanding_buffers(&self) -> i64 {
        i64::from(self.allocations.load(Ordering::SeqCst)) - i64::from(self.frees.load(Ordering::SeqCst))
    }
}

/// A hardware source that replays a fixed script of fills.
#[derive(Debug)]
pub struct ScriptedSource {
    steps: VecDeque<FillStep>,
    repeat: Option<FillStep>,
    on_exhausted: Option<RunMarker>,
    capacity: usize,
    fail_allocate: bool,
    ledger: Arc<SourceLedger>,
}

impl ScriptedSource {
    pub fn new(steps: Vec<FillStep>) -> Self {
        let capacity = steps
            .iter()
            .filter_map(|s| match s {
                FillStep::Frame(bytes) => Some(bytes.len()),
                _ => None,
            })
            .max()
            .unwrap_or(0)
            .max(16 * 1024);
        Self {
            steps: steps.into(),
            repeat: None,
            on_exhausted: None,
            capacity,
            fail_allocate: false,
            ledger: Arc::default(),
        }
    }

    /// Clears `marker` once the script runs out, ending the loop that polls this source.
    pub fn clear_when_exhausted(mut self, marker: RunMarker) -> Self {
        self.on_exhausted = Some(marker);
        self
    }

    /// Answers every fill after the script with `step`.
    pub fn repeat_last(mut self, step: FillStep) -> Self {
        if let FillStep::Frame(bytes) = &step {
            self.capacity = self.capacity.max(bytes.len());
        }
        self.repeat = Some(step);
        self
    }

    pub fn failing_allocate(mut self) -> Self {
        self.fail_allocate = true;
        self
    }

    pub fn ledger(&self) -> Arc<SourceLedger> {
        Arc::clone(&self.ledger)
    }

    fn next_step(&mut self) -> FillStep {
        if let Some(step) = self.steps.pop_front() {
            return step;
        }
        if let Some(step) = &self.repeat {
            return step.clone();
        }
        if let Some(marker) = &self.on_exhausted {
            marker.clear();
        }
        FillStep::Empty
    }
}

impl HardwareSource for ScriptedSource {
    fn name(&self) -> &str {
        "scripted"
    }

    fn allocate(&mut self) -> Result<HardwareBuffer> {
        if self.fail_allocate {
            return Err(ReadoutError::hardware("allocate", "scripted allocation failure"));
        }
        self.ledger.allocations.fetch_add(1, Ordering::SeqCst);
        Ok(HardwareBuffer::with_capacity(self.capacity))
    }

    fn start(&mut self) -> Result<()> {
        self.ledger.starts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        self.ledger.stops.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn free(&mut self, _buffer: HardwareBuffer) -> Result<()> {
        self.ledger.frees.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn fill(&mut self, buffer: &mut HardwareBuffer) -> Result<usize> {
        match self.next_step() {
            FillStep::Frame(bytes) => {
                let n = bytes.len().min(buffer.capacity());
                buffer.as_mut_slice()[..n].copy_from_slice(&bytes[..n]);
                Ok(n)
            }
            FillStep::Empty => Ok(0),
            FillStep::Fault(reason) => Err(ReadoutError::hardware("fill", reason)),
        }
    }
}

/// A queue sender that times out a scripted number of times before each delivery.
///
/// `timeouts[i]` is how many sends time out before delivery number `i` succeeds;
/// deliveries past the end of the script succeed immediately. Delivered items are
/// collected in a shared vector.
pub struct FlakySender<T> {
    name: String,
    timeouts: VecDeque<u32>,
    real_timeouts: bool,
    delivered: Arc<Mutex<Vec<T>>>,
    _item: PhantomData<fn(T)>,
}

impl<T> FlakySender<T> {
    pub fn new(name: &str, timeouts: Vec<u32>) -> Self {
        Self {
            name: name.to_string(),
            timeouts: timeouts.into(),
            real_timeouts: false,
            delivered: Arc::default(),
            _item: PhantomData,
        }
    }

    /// Sleep for the requested timeout before reporting it, like a real full queue.
    pub fn with_real_timeouts(mut self) -> Self {
        self.real_timeouts = true;
        self
    }

    pub fn delivered(&self) -> Arc<Mutex<Vec<T>>> {
        Arc::clone(&self.delivered)
    }
}

impl<T: Send> FrameSender<T> for FlakySender<T> {
    fn name(&self) -> &str {
        &self.name
    }

    fn send_timeout(&mut self, item: T, timeout: Duration) -> std::result::Result<(), ChannelError<T>> {
        if let Some(remaining) = self.timeouts.front_mut() {
            if *remaining > 0 {
                *remaining -= 1;
                if self.real_timeouts {
                    std::thread::sleep(timeout);
                }
                return Err(ChannelError::Timeout(item));
            }
            self.timeouts.pop_front();
        }
        match self.delivered.lock() {
            Ok(mut delivered) => {
                delivered.push(item);
                Ok(())
            }
            Err(_) => Err(ChannelError::Disconnected(item)),
        }
    }
}
