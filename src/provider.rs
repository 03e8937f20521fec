//! Hardware source contract.

use crate::Result;

/// DMA-style memory region a source fills and the acquisition loop reads.
///
/// Owned by exactly one loop at a time. It is not `Clone`; it moves between the owning
/// module and the loop thread and is handed back to the source to be freed.
#[derive(Debug)]
pub struct HardwareBuffer {
    data: Box<[u8]>,
}

impl HardwareBuffer {
    pub fn with_capacity(capacity: usize) -> Self {
        Self { data: vec![0u8; capacity].into_boxed_slice() }
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// The first `len` bytes, clamped to the capacity.
    #[inline]
    pub fn filled(&self, len: usize) -> &[u8] {
        &self.data[..len.min(self.data.len())]
    }
}

/// A polled data source such as a readout card or an emulator.
///
/// The owning module calls `allocate` and `start` when configuring and starting,
/// `stop` and `free` when stopping. `fill` is the only call made from the acquisition
/// thread; it must not block.
///
/// `fill` returns the number of bytes written at offset 0 of the buffer. `Ok(0)` means
/// nothing is available yet and is not an error. `Err` is a non-recoverable hardware
/// fault.
pub trait HardwareSource: Send + 'static {
    /// Short name for logs.
    fn name(&self) -> &str;

    /// Allocates the buffer the source will fill.
    fn allocate(&mut self) -> Result<HardwareBuffer>;

    /// Starts data-taking.
    fn start(&mut self) -> Result<()>;

    /// Stops data-taking. Called after the acquisition loop has exited.
    fn stop(&mut self) -> Result<()>;

    /// Releases a buffer obtained from `allocate`.
    fn free(&mut self, buffer: HardwareBuffer) -> Result<()>;

    /// Non-blocking poll.
    fn fill(&mut self, buffer: &mut HardwareBuffer) -> Result<usize>;
}
