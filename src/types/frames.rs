//! Concrete frame layouts.
//!
//! Every detector frame except CRT starts with the 16-byte DAQ ethernet header: one
//! packed 64-bit word ([`DaqEthHeader`]) followed by the 64-bit timestamp at offset 8.
//! CRT hit records keep their own 8-byte preamble but place the timestamp at the same
//! offset.
//!
//! | Format           | Size | Tick step | Payload after header                           |
//! |------------------|------|-----------|------------------------------------------------|
//! | `WIBEthFrame`    | 7200 | 2048      | 16-byte WIB header, 64 x 64 x 14-bit samples   |
//! | `PDSFrame`       | 584  | 16        | self-triggered waveform of one channel         |
//! | `PDSStreamFrame` | 472  | 64        | 4 channel ids, interleaved stream samples      |
//! | `SSPFrame`       | 176  | 1         | SSP event header and short waveform            |
//! | `TDEFrame`       | 8972 | 143168    | 8-byte TDE header, 4474 16-bit samples         |
//! | `CRTFrame`       | 288  | 1         | hit record                                     |

use std::fmt;

use super::frame::{FrameAdapter, RawFrame};
use super::FormatDescriptor;

pub const WIBETH_FRAME_SIZE: usize = 7200;
pub const DAPHNE_FRAME_SIZE: usize = 584;
pub const DAPHNE_STREAM_FRAME_SIZE: usize = 472;
pub const SSP_FRAME_SIZE: usize = 176;
pub const TDE_FRAME_SIZE: usize = 8972;
pub const CRT_FRAME_SIZE: usize = 288;

/// 64 time samples of 32 ticks each.
pub const WIBETH_TICK_DIFF: u64 = 32 * 64;
pub const DAPHNE_TICK_DIFF: u64 = 16;
pub const DAPHNE_STREAM_TICK_DIFF: u64 = 64;
pub const TDE_TICKS_BETWEEN_SAMPLES: u64 = 32;
pub const TDE_SAMPLES_PER_FRAME: u64 = 4474;

const TIMESTAMP_OFFSET: usize = 8;
/// First byte after the DAQ ethernet header.
const PAYLOAD_OFFSET: usize = 16;

/// Decoded first word of the DAQ ethernet header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DaqEthHeader {
    pub version: u8,
    pub det_id: u8,
    pub crate_id: u16,
    pub slot_id: u8,
    pub stream_id: u8,
    pub seq_id: u16,
    pub block_length: u16,
}

impl DaqEthHeader {
    /// Bit layout, LSB first: version:6 det_id:6 crate_id:10 slot_id:4 stream_id:8
    /// reserved:6 seq_id:12 block_length:12.
    pub fn decode(word: u64) -> Self {
        let field = |shift: u32, bits: u32| (word >> shift) & ((1u64 << bits) - 1);
        Self {
            version: field(0, 6) as u8,
            det_id: field(6, 6) as u8,
            crate_id: field(12, 10) as u16,
            slot_id: field(22, 4) as u8,
            stream_id: field(26, 8) as u8,
            seq_id: field(40, 12) as u16,
            block_length: field(52, 12) as u16,
        }
    }

    pub fn encode(&self) -> u64 {
        (u64::from(self.version) & 0x3f)
            | ((u64::from(self.det_id) & 0x3f) << 6)
            | ((u64::from(self.crate_id) & 0x3ff) << 12)
            | ((u64::from(self.slot_id) & 0xf) << 22)
            | (u64::from(self.stream_id) << 26)
            | ((u64::from(self.seq_id) & 0xfff) << 40)
            | ((u64::from(self.block_length) & 0xfff) << 52)
    }
}

macro_rules! frame_type {
    ($(#[$meta:meta])* $name:ident, $format:ident, $size:expr, $tick:expr $(, channel_at = $channel:expr)?) => {
        $(#[$meta])*
        #[derive(Clone, PartialEq, Eq)]
        pub struct $name(RawFrame<{ $size }>);

        impl FrameAdapter for $name {
            const FORMAT: FormatDescriptor = FormatDescriptor::$format;
            const SIZE: usize = $size;
            const TIMESTAMP_OFFSET: usize = TIMESTAMP_OFFSET;
            const TICK_DIFF: u64 = $tick;
            $(const CHANNEL_OFFSET: Option<usize> = Some($channel);)?

            #[inline]
            fn from_bytes(bytes: &[u8]) -> Option<Self> {
                RawFrame::copy_from(bytes).map(Self)
            }

            #[inline]
            fn as_bytes(&self) -> &[u8] {
                self.0.as_bytes()
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.debug_struct(stringify!($name)).field("timestamp", &self.timestamp()).finish()
            }
        }
    };
}

frame_type!(
    /// WIB ethernet frame: 64 channels x 64 time samples.
    WibEthFrame, WibEth, WIBETH_FRAME_SIZE, WIBETH_TICK_DIFF
);
frame_type!(
    /// DAPHNE self-triggered frame carrying one channel's waveform.
    DaphneFrame, Daphne, DAPHNE_FRAME_SIZE, DAPHNE_TICK_DIFF, channel_at = PAYLOAD_OFFSET
);
frame_type!(
    /// DAPHNE streaming frame carrying four interleaved channels.
    DaphneStreamFrame, DaphneStream, DAPHNE_STREAM_FRAME_SIZE, DAPHNE_STREAM_TICK_DIFF
);
frame_type!(
    /// SSP photon-detector event.
    SspFrame, Ssp, SSP_FRAME_SIZE, 1
);
frame_type!(
    /// TDE frame: one channel, 4474 samples of 16 bits.
    TdeFrame, Tde, TDE_FRAME_SIZE, TDE_TICKS_BETWEEN_SAMPLES * TDE_SAMPLES_PER_FRAME, channel_at = PAYLOAD_OFFSET
);
frame_type!(
    /// CRT hit record.
    CrtFrame, Crt, CRT_FRAME_SIZE, 1
);

impl WibEthFrame {
    pub fn header(&self) -> DaqEthHeader {
        DaqEthHeader::decode(self.0.u64_at(0))
    }

    /// WIB error flags; nonzero bits mark link or data errors.
    pub fn error_flags(&self) -> u16 {
        self.0.u16_at(PAYLOAD_OFFSET)
    }
}

impl DaphneFrame {
    pub fn header(&self) -> DaqEthHeader {
        DaqEthHeader::decode(self.0.u64_at(0))
    }

    pub fn channel(&self) -> u8 {
        self.0.u8_at(PAYLOAD_OFFSET)
    }
}

impl DaphneStreamFrame {
    pub fn header(&self) -> DaqEthHeader {
        DaqEthHeader::decode(self.0.u64_at(0))
    }

    pub fn channels(&self) -> [u8; 4] {
        std::array::from_fn(|i| self.0.u8_at(PAYLOAD_OFFSET + i))
    }
}

impl TdeFrame {
    pub fn header(&self) -> DaqEthHeader {
        DaqEthHeader::decode(self.0.u64_at(0))
    }

    pub fn channel(&self) -> u8 {
        self.0.u8_at(PAYLOAD_OFFSET)
    }
}

impl CrtFrame {
    pub fn module(&self) -> u16 {
        self.0.u16_at(0)
    }
}
