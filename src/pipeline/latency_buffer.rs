//! Time-indexed frame stores.
//!
//! A latency buffer keeps the most recent frames of one stream, bounded by a frame
//! count, and answers range scans by timestamp. It is owned by the consumer thread of
//! its pipeline; nothing else touches it while the pipeline runs.

use std::collections::{BTreeMap, VecDeque};

use super::TimeWindow;
use crate::types::FrameAdapter;

/// Bounded, timestamp-ordered frame store.
pub trait LatencyBuffer<F: FrameAdapter>: Send + 'static {
    const NAME: &'static str;

    /// A buffer holding at most `capacity` frames (at least one).
    fn with_capacity(capacity: usize) -> Self
    where
        Self: Sized;

    /// Stores `frame`, evicting the oldest frame when full. Returns true on eviction.
    fn write(&mut self, frame: F) -> bool;

    fn occupancy(&self) -> usize;

    fn capacity(&self) -> usize;

    /// Smallest stored timestamp.
    fn oldest(&self) -> Option<u64>;

    /// Largest stored timestamp.
    fn newest(&self) -> Option<u64>;

    /// Visits the frames with `window.begin <= timestamp < window.end` in timestamp order.
    fn for_each_in(&self, window: TimeWindow, visit: impl FnMut(&F));

    fn clear(&mut self);
}

/// Sorted ring of frames for streams that arrive (almost) in order.
///
/// In-order frames are appended in O(1); late frames are placed by binary search.
#[derive(Debug)]
pub struct SortedQueue<F> {
    frames: VecDeque<F>,
    capacity: usize,
}

impl<F: FrameAdapter> LatencyBuffer<F> for SortedQueue<F> {
    const NAME: &'static str = "SortedQueue";

    fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self { frames: VecDeque::with_capacity(capacity), capacity }
    }

    fn write(&mut self, frame: F) -> bool {
        let ts = frame.timestamp();
        match self.frames.back() {
            Some(last) if last.timestamp() > ts => {
                let at = self.frames.partition_point(|f| f.timestamp() <= ts);
                self.frames.insert(at, frame);
            }
            _ => self.frames.push_back(frame),
        }
        // Evict after placing, so a late frame older than everything kept is the one dropped.
        if self.frames.len() > self.capacity {
            return self.frames.pop_front().is_some();
        }
        false
    }

    fn occupancy(&self) -> usize {
        self.frames.len()
    }

    fn capacity(&self) -> usize {
        self.capacity
    }

    fn oldest(&self) -> Option<u64> {
        self.frames.front().map(F::timestamp)
    }

    fn newest(&self) -> Option<u64> {
        self.frames.back().map(F::timestamp)
    }

    fn for_each_in(&self, window: TimeWindow, mut visit: impl FnMut(&F)) {
        if window.is_empty() {
            return;
        }
        let lo = self.frames.partition_point(|f| f.timestamp() < window.begin);
        let hi = self.frames.partition_point(|f| f.timestamp() < window.end);
        self.frames.range(lo..hi.max(lo)).for_each(&mut visit);
    }

    fn clear(&mut self) {
        self.frames.clear();
    }
}

/// Ordered map for streams where many frames share a timestamp or arrive out of order,
/// such as self-triggered or per-channel data.
#[derive(Debug)]
pub struct OrderedMapBuffer<F> {
    frames: BTreeMap<(u64, u64), F>,
    capacity: usize,
    next_seq: u64,
}

impl<F: FrameAdapter> LatencyBuffer<F> for OrderedMapBuffer<F> {
    const NAME: &'static str = "OrderedMapBuffer";

    fn with_capacity(capacity: usize) -> Self {
        Self { frames: BTreeMap::new(), capacity: capacity.max(1), next_seq: 0 }
    }

    fn write(&mut self, frame: F) -> bool {
        // Arrival order breaks timestamp ties.
        self.frames.insert((frame.timestamp(), self.next_seq), frame);
        self.next_seq += 1;
        if self.frames.len() > self.capacity {
            return self.frames.pop_first().is_some();
        }
        false
    }

    fn occupancy(&self) -> usize {
        self.frames.len()
    }

    fn capacity(&self) -> usize {
        self.capacity
    }

    fn oldest(&self) -> Option<u64> {
        self.frames.first_key_value().map(|((ts, _), _)| *ts)
    }

    fn newest(&self) -> Option<u64> {
        self.frames.last_key_value().map(|((ts, _), _)| *ts)
    }

    fn for_each_in(&self, window: TimeWindow, mut visit: impl FnMut(&F)) {
        if window.is_empty() {
            return;
        }
        self.frames.range((window.begin, 0)..(window.end, 0)).for_each(|(_, frame)| visit(frame));
    }

    fn clear(&mut self) {
        self.frames.clear();
    }
}
