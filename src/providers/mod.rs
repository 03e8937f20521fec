//! Concrete hardware sources.
//!
//! - [`EmulatedSource`] synthesizes frames with per-format timing and dropouts
//! - [`ReplaySource`] plays back a raw recording

pub mod emulated;
pub mod replay;

pub use emulated::{EmulatedSource, EmulatorParams};
pub use replay::ReplaySource;
