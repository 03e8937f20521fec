//! Emulated hardware that synthesizes frames of one format.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::marker::PhantomData;
use std::time::{Duration, Instant};
use tracing::{debug, info};

use crate::config::EmulatorConfig;
use crate::provider::{HardwareBuffer, HardwareSource};
use crate::types::{FormatDescriptor, FrameAdapter, write_u64_le};
use crate::{ReadoutError, Result};

/// Per-format generation parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EmulatorParams {
    /// Timestamp increment between ticks.
    pub time_tick_diff: u64,
    /// Frames emitted per tick, each with its own channel id where the format has one.
    pub frames_per_tick: u32,
    /// Probability that a whole tick is skipped.
    pub dropout_rate: f64,
    /// Nominal frame rate.
    pub rate_khz: f64,
}

impl EmulatorParams {
    pub fn for_format(format: FormatDescriptor) -> Self {
        use crate::types::*;
        match format {
            FormatDescriptor::WibEth => {
                Self { time_tick_diff: WIBETH_TICK_DIFF, frames_per_tick: 1, dropout_rate: 0.0, rate_khz: 30.5176 }
            }
            FormatDescriptor::Daphne => {
                Self { time_tick_diff: DAPHNE_TICK_DIFF, frames_per_tick: 1, dropout_rate: 0.9, rate_khz: 200.0 }
            }
            FormatDescriptor::DaphneStream => {
                Self { time_tick_diff: DAPHNE_STREAM_TICK_DIFF, frames_per_tick: 1, dropout_rate: 0.0, rate_khz: 976.5625 }
            }
            FormatDescriptor::Ssp => Self { time_tick_diff: 1, frames_per_tick: 1, dropout_rate: 0.0, rate_khz: 10.0 },
            // 64 channels per AMC, one frame per channel every 4474 samples of a 62.5 MHz clock.
            FormatDescriptor::Tde => Self {
                time_tick_diff: TDE_TICKS_BETWEEN_SAMPLES * TDE_SAMPLES_PER_FRAME,
                frames_per_tick: 64,
                dropout_rate: 0.0,
                rate_khz: 62_500.0 / (TDE_TICKS_BETWEEN_SAMPLES * TDE_SAMPLES_PER_FRAME) as f64 * 64.0,
            },
            FormatDescriptor::Crt => Self { time_tick_diff: 1, frames_per_tick: 1, dropout_rate: 0.0, rate_khz: 1.0 },
        }
    }

    pub fn with_overrides(mut self, config: &EmulatorConfig) -> Self {
        if let Some(rate) = config.rate_khz {
            self.rate_khz = rate;
        }
        if let Some(dropout) = config.dropout_rate {
            self.dropout_rate = dropout;
        }
        if let Some(frames) = config.frames_per_tick {
            self.frames_per_tick = frames;
        }
        self.dropout_rate = self.dropout_rate.clamp(0.0, 1.0);
        self.frames_per_tick = self.frames_per_tick.max(1);
        self
    }

    /// Time between two frames at the nominal rate.
    pub fn frame_period(&self) -> Option<Duration> {
        (self.rate_khz > 0.0).then(|| Duration::from_secs_f64(1.0 / (self.rate_khz * 1000.0)))
    }
}

/// Emulated readout card producing `F` frames with increasing timestamps.
///
/// Dropouts skip a tick without emitting anything, leaving a timestamp gap downstream.
/// With `rate_limited` the source answers empty polls until the next frame is due.
#[derive(Debug)]
pub struct EmulatedSource<F> {
    params: EmulatorParams,
    pacing: Option<Duration>,
    max_frames: Option<u64>,
    rng: StdRng,
    next_timestamp: u64,
    index_in_tick: u32,
    next_due: Option<Instant>,
    emitted: u64,
    dropped_ticks: u64,
    running: bool,
    _frame: PhantomData<fn() -> F>,
}

impl<F: FrameAdapter> EmulatedSource<F> {
    pub fn new(config: &EmulatorConfig) -> Self {
        let params = EmulatorParams::for_format(F::FORMAT).with_overrides(config);
        Self {
            params,
            pacing: if config.rate_limited { params.frame_period() } else { None },
            max_frames: config.max_frames,
            rng: StdRng::seed_from_u64(config.seed),
            next_timestamp: config.first_timestamp,
            index_in_tick: 0,
            next_due: None,
            emitted: 0,
            dropped_ticks: 0,
            running: false,
            _frame: PhantomData,
        }
    }

    pub fn params(&self) -> &EmulatorParams {
        &self.params
    }

    pub fn emitted(&self) -> u64 {
        self.emitted
    }

    pub fn dropped_ticks(&self) -> u64 {
        self.dropped_ticks
    }

    fn frame_due(&mut self) -> bool {
        let Some(period) = self.pacing else {
            return true;
        };
        let now = Instant::now();
        match self.next_due {
            Some(due) if now < due => false,
            Some(due) => {
                // Resynchronise instead of bursting after a long stall.
                let next = due + period;
                self.next_due = Some(if next < now { now + period } else { next });
                true
            }
            None => {
                self.next_due = Some(now + period);
                true
            }
        }
    }

    fn advance_tick(&mut self) {
        self.index_in_tick = 0;
        self.next_timestamp = self.next_timestamp.wrapping_add(self.params.time_tick_diff);
    }
}

impl<F: FrameAdapter> HardwareSource for EmulatedSource<F> {
    fn name(&self) -> &str {
        "emulated"
    }

    fn allocate(&mut self) -> Result<HardwareBuffer> {
        Ok(HardwareBuffer::with_capacity(F::SIZE))
    }

    fn start(&mut self) -> Result<()> {
        info!(format = %F::FORMAT, rate_khz = self.params.rate_khz, dropout_rate = self.params.dropout_rate, "Emulated data-taking started");
        self.running = true;
        self.next_due = None;
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        self.running = false;
        debug!(format = %F::FORMAT, emitted = self.emitted, dropped_ticks = self.dropped_ticks, "Emulated data-taking stopped");
        Ok(())
    }

    fn free(&mut self, _buffer: HardwareBuffer) -> Result<()> {
        Ok(())
    }

    fn fill(&mut self, buffer: &mut HardwareBuffer) -> Result<usize> {
        if !self.running {
            return Err(ReadoutError::hardware("fill", "data-taking is not started"));
        }
        if buffer.capacity() < F::SIZE {
            return Err(ReadoutError::hardware("fill", format!("buffer of {} bytes cannot hold a {} byte frame", buffer.capacity(), F::SIZE)));
        }
        if self.max_frames.is_some_and(|max| self.emitted >= max) || !self.frame_due() {
            return Ok(0);
        }

        if self.index_in_tick == 0 && self.params.dropout_rate > 0.0 && self.rng.gen_bool(self.params.dropout_rate) {
            self.dropped_ticks += 1;
            self.advance_tick();
            return Ok(0);
        }

        let bytes = &mut buffer.as_mut_slice()[..F::SIZE];
        bytes.fill(0);
        write_u64_le(bytes, F::TIMESTAMP_OFFSET, self.next_timestamp);
        if let Some(offset) = F::CHANNEL_OFFSET {
            if let Some(channel) = bytes.get_mut(offset) {
                *channel = self.index_in_tick as u8;
            }
        }

        self.emitted += 1;
        self.index_in_tick += 1;
        if self.index_in_tick >= self.params.frames_per_tick {
            self.advance_tick();
        }
        Ok(F::SIZE)
    }
}
