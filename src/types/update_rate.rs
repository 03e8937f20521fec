//! Update rate control for monitoring streams

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// How often a monitoring stream yields snapshots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum UpdateRate {
    /// Every snapshot the publisher produces.
    #[default]
    Native,

    /// At most this many snapshots per second; intermediate ones are coalesced.
    /// `Max(0)` behaves like `Native`.
    Max(u32),
}

impl UpdateRate {
    /// Minimum spacing between yielded snapshots, `None` when unthrottled.
    pub fn interval(self) -> Option<Duration> {
        match self {
            UpdateRate::Native | UpdateRate::Max(0) => None,
            UpdateRate::Max(hz) => Some(Duration::from_secs_f64(1.0 / f64::from(hz))),
        }
    }
}
