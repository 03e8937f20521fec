//! Frame types and format descriptors.
//!
//! - [`FormatDescriptor`] names a layout and is resolved once per queue endpoint
//! - [`FrameAdapter`] turns the bytes of one hardware fill into a typed frame
//! - the concrete frames ([`WibEthFrame`], [`DaphneFrame`], ...) are fixed-size,
//!   heap-backed byte records with accessors for the header fields the processors use
//!
//! ```rust
//! use fdreadout::types::{CrtFrame, FrameAdapter};
//!
//! let mut raw = vec![0u8; 288];
//! raw[8..16].copy_from_slice(&1234u64.to_le_bytes());
//! let frame = CrtFrame::from_bytes(&raw).expect("a full CRT record");
//! assert_eq!(frame.timestamp(), 1234);
//! ```

mod format;
mod frame;
mod frames;
mod update_rate;

pub use format::FormatDescriptor;
pub use frame::{FrameAdapter, RawFrame, read_u64_le, write_u64_le};
pub use frames::*;
pub use update_rate::UpdateRate;
