//! Rate limiting for snapshot streams

use futures::{Stream, ready};
use pin_project_lite::pin_project;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::time::{Interval, MissedTickBehavior, interval};

/// Extension trait to add throttling to any Stream
pub trait ThrottleExt: Stream {
    /// Yield at most one item per `period`, keeping only the latest.
    ///
    /// Items superseded before they could be yielded are counted, see
    /// [`Throttle::coalesced`]. When the inner stream ends, a held item is still
    /// yielded before the throttled stream ends.
    fn throttle(self, period: Duration) -> Throttle<Self>
    where
        Self: Sized,
    {
        Throttle::new(self, period)
    }
}

impl<T: Stream> ThrottleExt for T {}

pin_project! {
    /// Latest-wins rate limiter. Needs a tokio runtime with the time driver.
    pub struct Throttle<S: Stream> {
        #[pin]
        stream: S,
        interval: Interval,
        latest: Option<S::Item>,
        coalesced: u64,
        inner_done: bool,
    }
}

impl<S: Stream> Throttle<S> {
    pub fn new(stream: S, period: Duration) -> Self {
        let mut interval = interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        Self { stream, interval, latest: None, coalesced: 0, inner_done: false }
    }

    /// Items dropped because a newer one arrived within the same period.
    pub fn coalesced(&self) -> u64 {
        self.coalesced
    }
}

impl<S: Stream> Stream for Throttle<S> {
    type Item = S::Item;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let mut this = self.project();

        while !*this.inner_done {
            match this.stream.as_mut().poll_next(cx) {
                Poll::Ready(Some(item)) => {
                    if this.latest.replace(item).is_some() {
                        *this.coalesced += 1;
                    }
                }
                Poll::Ready(None) => *this.inner_done = true,
                Poll::Pending => break,
            }
        }

        if *this.inner_done {
            return Poll::Ready(this.latest.take());
        }
        if this.latest.is_none() {
            // The inner stream registered the waker.
            return Poll::Pending;
        }
        ready!(this.interval.poll_tick(cx));
        Poll::Ready(this.latest.take())
    }
}
