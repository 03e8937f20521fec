//! Replay source for raw recordings

use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::provider::{HardwareBuffer, HardwareSource};
use crate::types::FrameAdapter;
use crate::{ReadoutError, Result};

/// Feeds the frames of a raw recording back one per fill.
///
/// The file is the concatenation of whole `F` frames, as written by the recorder.
/// At the end of the file the source either wraps around or reports empty polls.
#[derive(Debug)]
pub struct ReplaySource<F> {
    path: PathBuf,
    data: Vec<u8>,
    frame_count: usize,
    position: usize,
    looping: bool,
    completed_loops: u64,
    running: bool,
    _frame: PhantomData<fn() -> F>,
}

impl<F: FrameAdapter> ReplaySource<F> {
    /// Loads `path` into memory.
    pub fn open(path: impl AsRef<Path>, looping: bool) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let data = std::fs::read(&path).map_err(|e| ReadoutError::file_error(&path, e))?;
        if data.is_empty() || data.len() % F::SIZE != 0 {
            return Err(ReadoutError::parse(
                format!("replay file {}", path.display()),
                format!("{} bytes is not a whole number of {} byte {} frames", data.len(), F::SIZE, F::FORMAT),
            ));
        }
        let frame_count = data.len() / F::SIZE;
        info!(path = %path.display(), frames = frame_count, format = %F::FORMAT, looping, "Opened replay file");
        Ok(Self { path, data, frame_count, position: 0, looping, completed_loops: 0, running: false, _frame: PhantomData })
    }

    pub fn frame_count(&self) -> usize {
        self.frame_count
    }

    pub fn completed_loops(&self) -> u64 {
        self.completed_loops
    }
}

impl<F: FrameAdapter> HardwareSource for ReplaySource<F> {
    fn name(&self) -> &str {
        "replay"
    }

    fn allocate(&mut self) -> Result<HardwareBuffer> {
        Ok(HardwareBuffer::with_capacity(F::SIZE))
    }

    fn start(&mut self) -> Result<()> {
        self.running = true;
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        self.running = false;
        debug!(path = %self.path.display(), position = self.position, loops = self.completed_loops, "Replay stopped");
        Ok(())
    }

    fn free(&mut self, _buffer: HardwareBuffer) -> Result<()> {
        Ok(())
    }

    fn fill(&mut self, buffer: &mut HardwareBuffer) -> Result<usize> {
        if !self.running {
            return Err(ReadoutError::hardware("fill", "replay is not started"));
        }
        if self.position >= self.frame_count {
            if !self.looping {
                return Ok(0);
            }
            self.position = 0;
            self.completed_loops += 1;
        }
        let start = self.position * F::SIZE;
        let frame = &self.data[start..start + F::SIZE];
        let target = buffer
            .as_mut_slice()
            .get_mut(..F::SIZE)
            .ok_or_else(|| ReadoutError::hardware("fill", "buffer smaller than one frame"))?;
        target.copy_from_slice(frame);
        self.position += 1;
        Ok(F::SIZE)
    }
}
