//! Per-frame validation stages.
//!
//! Each frame type gets a processor that checks timestamp continuity against the
//! expected tick step of its stream and, where the header carries them, counts error
//! bits. Processors never reject a frame; they report what they saw and keep counters.

use serde::Serialize;
use std::collections::HashMap;
use tracing::trace;

use crate::types::{CrtFrame, DaphneFrame, DaphneStreamFrame, FrameAdapter, SspFrame, TdeFrame, WibEthFrame};

/// Result of checking one frame.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameCheck {
    /// `(expected, found)` when the timestamp broke the expected sequence.
    pub timestamp_jump: Option<(u64, u64)>,
    /// Error bits set in the frame header.
    pub error_bits: u32,
}

impl FrameCheck {
    pub fn is_clean(&self) -> bool {
        self.timestamp_jump.is_none() && self.error_bits == 0
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ProcessorStats {
    pub processed: u64,
    pub timestamp_jumps: u64,
    /// Frames with at least one error bit.
    pub errored_frames: u64,
    pub error_bits: u64,
}

impl ProcessorStats {
    fn record(&mut self, check: FrameCheck) {
        self.processed += 1;
        if check.timestamp_jump.is_some() {
            self.timestamp_jumps += 1;
        }
        if check.error_bits > 0 {
            self.errored_frames += 1;
            self.error_bits += u64::from(check.error_bits);
        }
    }
}

/// Validation stage run on every received frame before it is buffered.
pub trait FrameProcessor<F: FrameAdapter>: Default + Send + 'static {
    const NAME: &'static str;

    fn process(&mut self, frame: &F) -> FrameCheck;

    fn stats(&self) -> ProcessorStats;
}

/// Expects each timestamp to be the previous one plus a fixed step.
#[derive(Debug, Clone, Copy, Default)]
pub struct ContinuityCheck {
    last: Option<u64>,
}

impl ContinuityCheck {
    /// Returns `(expected, found)` on a gap, then follows the new timestamp.
    pub fn check(&mut self, timestamp: u64, step: u64) -> Option<(u64, u64)> {
        let jump = self
            .last
            .map(|last| last.wrapping_add(step))
            .filter(|&expected| expected != timestamp)
            .map(|expected| (expected, timestamp));
        self.last = Some(timestamp);
        jump
    }
}

/// Expects timestamps never to go backwards. Equal timestamps are fine.
#[derive(Debug, Clone, Copy, Default)]
pub struct MonotonicCheck {
    last: Option<u64>,
}

impl MonotonicCheck {
    pub fn check(&mut self, timestamp: u64) -> Option<(u64, u64)> {
        let jump = self.last.filter(|&last| timestamp < last).map(|last| (last, timestamp));
        self.last = Some(timestamp);
        jump
    }
}

#[derive(Debug, Default)]
pub struct WibEthFrameProcessor {
    continuity: ContinuityCheck,
    stats: ProcessorStats,
}

impl FrameProcessor<WibEthFrame> for WibEthFrameProcessor {
    const NAME: &'static str = "WibEthFrameProcessor";

    fn process(&mut self, frame: &WibEthFrame) -> FrameCheck {
        let check = FrameCheck {
            timestamp_jump: self.continuity.check(frame.timestamp(), WibEthFrame::TICK_DIFF),
            error_bits: frame.error_flags().count_ones(),
        };
        if let Some((expected, found)) = check.timestamp_jump {
            trace!(expected, found, "WIBEth timestamp jump");
        }
        self.stats.record(check);
        check
    }

    fn stats(&self) -> ProcessorStats {
        self.stats
    }
}

/// Self-triggered frames: per-channel ordering only, gaps are expected.
#[derive(Debug, Default)]
pub struct DaphneFrameProcessor {
    channels: HashMap<u8, MonotonicCheck>,
    stats: ProcessorStats,
}

impl FrameProcessor<DaphneFrame> for DaphneFrameProcessor {
    const NAME: &'static str = "DaphneFrameProcessor";

    fn process(&mut self, frame: &DaphneFrame) -> FrameCheck {
        let check = FrameCheck {
            timestamp_jump: self.channels.entry(frame.channel()).or_default().check(frame.timestamp()),
            error_bits: 0,
        };
        self.stats.record(check);
        check
    }

    fn stats(&self) -> ProcessorStats {
        self.stats
    }
}

#[derive(Debug, Default)]
pub struct DaphneStreamFrameProcessor {
    continuity: ContinuityCheck,
    stats: ProcessorStats,
}

impl FrameProcessor<DaphneStreamFrame> for DaphneStreamFrameProcessor {
    const NAME: &'static str = "DaphneStreamFrameProcessor";

    fn process(&mut self, frame: &DaphneStreamFrame) -> FrameCheck {
        let check = FrameCheck {
            timestamp_jump: self.continuity.check(frame.timestamp(), DaphneStreamFrame::TICK_DIFF),
            error_bits: 0,
        };
        self.stats.record(check);
        check
    }

    fn stats(&self) -> ProcessorStats {
        self.stats
    }
}

#[derive(Debug, Default)]
pub struct SspFrameProcessor {
    order: MonotonicCheck,
    stats: ProcessorStats,
}

impl FrameProcessor<SspFrame> for SspFrameProcessor {
    const NAME: &'static str = "SspFrameProcessor";

    fn process(&mut self, frame: &SspFrame) -> FrameCheck {
        let check = FrameCheck { timestamp_jump: self.order.check(frame.timestamp()), error_bits: 0 };
        self.stats.record(check);
        check
    }

    fn stats(&self) -> ProcessorStats {
        self.stats
    }
}

/// One continuity check per TDE channel; each channel streams back to back.
#[derive(Debug, Default)]
pub struct TdeFrameProcessor {
    channels: HashMap<u8, ContinuityCheck>,
    stats: ProcessorStats,
}

impl FrameProcessor<TdeFrame> for TdeFrameProcessor {
    const NAME: &'static str = "TdeFrameProcessor";

    fn process(&mut self, frame: &TdeFrame) -> FrameCheck {
        let continuity = self.channels.entry(frame.channel()).or_default();
        let check = FrameCheck { timestamp_jump: continuity.check(frame.timestamp(), TdeFrame::TICK_DIFF), error_bits: 0 };
        self.stats.record(check);
        check
    }

    fn stats(&self) -> ProcessorStats {
        self.stats
    }
}

#[derive(Debug, Default)]
pub struct CrtFrameProcessor {
    order: MonotonicCheck,
    stats: ProcessorStats,
}

impl FrameProcessor<CrtFrame> for CrtFrameProcessor {
    const NAME: &'static str = "CrtFrameProcessor";

    fn process(&mut self, frame: &CrtFrame) -> FrameCheck {
        let check = FrameCheck { timestamp_jump: self.order.check(frame.timestamp()), error_bits: 0 };
        self.stats.record(check);
        check
    }

    fn stats(&self) -> ProcessorStats {
        self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{frame, frame_bytes};

    #[test]
    fn wibeth_continuity_and_error_bits() {
        let mut processor = WibEthFrameProcessor::default();
        assert!(processor.process(&frame(0)).is_clean());
        assert!(processor.process(&frame(2048)).is_clean());
        let gap = processor.process(&frame(3 * 2048));
        assert_eq!(gap.timestamp_jump, Some((2 * 2048, 3 * 2048)));

        let mut raw = frame_bytes::<WibEthFrame>(4 * 2048);
        raw[16] = 0b0000_0101;
        let errored = processor.process(&WibEthFrame::from_bytes(&raw).unwrap());
        assert_eq!(errored, FrameCheck { timestamp_jump: None, error_bits: 2 });

        let stats = FrameProcessor::<WibEthFrame>::stats(&processor);
        assert_eq!(stats, ProcessorStats { processed: 4, timestamp_jumps: 1, errored_frames: 1, error_bits: 2 });
    }

    #[test]
    fn daphne_orders_per_channel() {
        let with_channel = |ts: u64, channel: u8| {
            let mut raw = frame_bytes::<DaphneFrame>(ts);
            raw[16] = channel;
            DaphneFrame::from_bytes(&raw).unwrap()
        };
        let mut processor = DaphneFrameProcessor::default();
        assert!(processor.process(&with_channel(100, 1)).is_clean());
        // Another channel may lag behind.
        assert!(processor.process(&with_channel(50, 2)).is_clean());
        assert!(processor.process(&with_channel(500, 1)).is_clean());
        assert_eq!(processor.process(&with_channel(400, 1)).timestamp_jump, Some((500, 400)));
    }

    #[test]
    fn tde_continuity_is_per_channel() {
        let step = TdeFrame::TICK_DIFF;
        let with_channel = |ts: u64, channel: u8| {
            let mut raw = frame_bytes::<TdeFrame>(ts);
            raw[16] = channel;
            TdeFrame::from_bytes(&raw).unwrap()
        };
        let mut processor = TdeFrameProcessor::default();
        for ts in [0, step, 2 * step] {
            assert!(processor.process(&with_channel(ts, 0)).is_clean());
            assert!(processor.process(&with_channel(ts, 7)).is_clean());
        }
        assert!(processor.process(&with_channel(5 * step, 7)).timestamp_jump.is_some());
        assert_eq!(FrameProcessor::<TdeFrame>::stats(&processor).timestamp_jumps, 1);
    }

    #[test]
    fn monotonic_streams_accept_repeats() {
        let mut processor = CrtFrameProcessor::default();
        for ts in [5, 5, 9, 3] {
            processor.process(&frame(ts));
        }
        let stats = FrameProcessor::<CrtFrame>::stats(&processor);
        assert_eq!((stats.processed, stats.timestamp_jumps), (4, 1));
    }

    #[test]
    fn daphne_stream_and_ssp_checks() {
        let mut stream = DaphneStreamFrameProcessor::default();
        stream.process(&frame(0));
        assert_eq!(stream.process(&frame(65)).timestamp_jump, Some((64, 65)));

        let mut ssp = SspFrameProcessor::default();
        ssp.process(&frame(10));
        assert!(ssp.process(&frame(1000)).is_clean());
    }
}
