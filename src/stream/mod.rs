//! Stream combinators for monitoring snapshots.

pub mod throttle;

pub use throttle::{Throttle, ThrottleExt};
