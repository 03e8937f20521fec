//! Window request servicing.

use serde::Serialize;
use tracing::debug;

use super::latency_buffer::LatencyBuffer;
use super::{Fragment, RequestOutcome, TimeWindow};
use crate::config::HandlerConfig;
use crate::types::FrameAdapter;

/// Per-outcome request counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RequestStats {
    pub served: u64,
    pub found: u64,
    pub partial: u64,
    pub too_old: u64,
    pub not_yet: u64,
    pub empty: u64,
}

impl RequestStats {
    fn record(&mut self, outcome: RequestOutcome) {
        self.served += 1;
        match outcome {
            RequestOutcome::Found => self.found += 1,
            RequestOutcome::Partial => self.partial += 1,
            RequestOutcome::TooOld => self.too_old += 1,
            RequestOutcome::NotYet => self.not_yet += 1,
            RequestOutcome::Empty => self.empty += 1,
        }
    }
}

/// Serves time-window reads against a latency buffer.
pub trait RequestHandler<F: FrameAdapter, B: LatencyBuffer<F>>: Send + 'static {
    const NAME: &'static str;

    fn new(config: &HandlerConfig) -> Self
    where
        Self: Sized;

    /// Copies every buffered frame inside `window` into a fragment.
    fn issue_request(&mut self, buffer: &B, window: TimeWindow) -> Fragment;

    fn stats(&self) -> RequestStats;
}

/// Classifies the window against the buffered range and copies out matching frames.
#[derive(Debug, Default)]
pub struct DefaultRequestHandler {
    stats: RequestStats,
}

impl DefaultRequestHandler {
    /// Outcome of `window` against a buffer spanning `oldest..=newest`, where the
    /// newest frame covers `tick_diff` ticks.
    pub fn classify(window: TimeWindow, oldest: Option<u64>, newest: Option<u64>, tick_diff: u64) -> RequestOutcome {
        if window.is_empty() {
            return RequestOutcome::Empty;
        }
        let (Some(oldest), Some(newest)) = (oldest, newest) else {
            return RequestOutcome::NotYet;
        };
        if window.end <= oldest {
            RequestOutcome::TooOld
        } else if window.begin > newest {
            RequestOutcome::NotYet
        } else if window.begin >= oldest && window.end <= newest.saturating_add(tick_diff) {
            RequestOutcome::Found
        } else {
            RequestOutcome::Partial
        }
    }
}

impl<F: FrameAdapter, B: LatencyBuffer<F>> RequestHandler<F, B> for DefaultRequestHandler {
    const NAME: &'static str = "DefaultRequestHandler";

    fn new(_config: &HandlerConfig) -> Self {
        Self::default()
    }

    fn issue_request(&mut self, buffer: &B, window: TimeWindow) -> Fragment {
        let outcome = Self::classify(window, buffer.oldest(), buffer.newest(), F::TICK_DIFF);
        let mut fragment = Fragment::new::<F>(window, outcome);
        if matches!(outcome, RequestOutcome::Found | RequestOutcome::Partial) {
            buffer.for_each_in(window, |frame| fragment.push_frame(frame.as_bytes()));
        }
        self.stats.record(outcome);
        debug!(
            format = %F::FORMAT,
            begin = window.begin,
            end = window.end,
            ?outcome,
            frames = fragment.frame_count(),
            "Window request served"
        );
        fragment
    }

    fn stats(&self) -> RequestStats {
        self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::latency_buffer::SortedQueue;
    use crate::test_utils::frame;
    use crate::types::WibEthFrame;

    fn buffer_with(timestamps: impl IntoIterator<Item = u64>) -> SortedQueue<WibEthFrame> {
        let mut buffer = SortedQueue::with_capacity(100);
        for ts in timestamps {
            buffer.write(frame::<WibEthFrame>(ts));
        }
        buffer
    }

    fn request(buffer: &SortedQueue<WibEthFrame>, begin: u64, end: u64) -> (Fragment, RequestStats) {
        let mut handler = <DefaultRequestHandler as RequestHandler<WibEthFrame, SortedQueue<WibEthFrame>>>::new(&HandlerConfig::default());
        let fragment = handler.issue_request(buffer, TimeWindow::new(begin, end));
        (fragment, RequestHandler::<WibEthFrame, SortedQueue<WibEthFrame>>::stats(&handler))
    }

    #[test]
    fn covered_window_is_found_with_its_frames() {
        let buffer = buffer_with((0..10).map(|i| i * 2048));
        let (fragment, stats) = request(&buffer, 2048, 3 * 2048);
        assert_eq!(fragment.outcome, RequestOutcome::Found);
        assert_eq!(fragment.timestamps().collect::<Vec<_>>(), vec![2048, 4096]);
        assert_eq!(fragment.data().len(), 2 * WibEthFrame::SIZE);
        assert_eq!((stats.served, stats.found), (1, 1));
    }

    #[test]
    fn outcomes_at_the_edges() {
        let buffer = buffer_with((10..20).map(|i| i * 2048));
        let oldest = 10 * 2048;
        let newest = 19 * 2048;
        assert_eq!(request(&buffer, 0, oldest).0.outcome, RequestOutcome::TooOld);
        assert_eq!(request(&buffer, newest + 1, newest + 10).0.outcome, RequestOutcome::NotYet);
        let (partial, _) = request(&buffer, oldest - 100, oldest + 1);
        assert_eq!(partial.outcome, RequestOutcome::Partial);
        assert_eq!(partial.frame_count(), 1);
        assert_eq!(request(&buffer, newest, newest + 2048).0.outcome, RequestOutcome::Found);
        assert_eq!(request(&buffer, 50, 50).0.outcome, RequestOutcome::Empty);
    }

    #[test]
    fn empty_buffer_is_not_yet() {
        let buffer = buffer_with([]);
        let (fragment, stats) = request(&buffer, 0, 100);
        assert_eq!(fragment.outcome, RequestOutcome::NotYet);
        assert_eq!(fragment.frame_count(), 0);
        assert_eq!(stats.not_yet, 1);
    }
}
