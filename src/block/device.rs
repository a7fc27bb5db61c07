// ============================================================================
// src/block/device.rs - Block Device Trait and Queue-Backed Implementation
// ============================================================================
//! Unified block device interface.
//!
//! Bounds and buffer sizing are validated here, before anything reaches the
//! command engine. Retry, threshold accounting and reset are entirely the
//! engine's business; this layer only maps outcomes into statistics.

use crate::dma::SliceBuffer;
use crate::engine::{CommandEngine, EngineHealth};
use crate::error::{IoError, IoResult};
use crate::time::MonotonicClock;
use crate::transport::{BlockCommand, QueueTransport};

use super::stats::{DeviceStats, StatsSnapshot};

// ============================================================================
// Device Info
// ============================================================================

/// Block device geometry and capabilities
#[derive(Clone, Debug)]
pub struct BlockDeviceInfo {
    /// Device name
    pub name: &'static str,
    /// Total number of addressable blocks
    pub capacity_blocks: u64,
    /// Block size in bytes
    pub block_size: u32,
    /// Is device read-only
    pub read_only: bool,
    /// Maximum blocks per request
    pub max_blocks: u32,
    /// Device supports trim/deallocate
    pub supports_trim: bool,
}

impl Default for BlockDeviceInfo {
    fn default() -> Self {
        Self {
            name: "unknown",
            capacity_blocks: 0,
            block_size: 512,
            read_only: false,
            max_blocks: 256,
            supports_trim: false,
        }
    }
}

// ============================================================================
// Block Device Trait
// ============================================================================

/// Block device trait consumed by filesystem/registry layers
pub trait BlockDevice: Send + Sync {
    /// Get device information
    fn info(&self) -> BlockDeviceInfo;

    /// Read `count` blocks starting at `lba` into `buf`
    fn read(&self, lba: u64, count: u32, buf: &mut [u8]) -> IoResult<()>;

    /// Write `count` blocks starting at `lba` from `buf`
    fn write(&self, lba: u64, count: u32, buf: &[u8]) -> IoResult<()>;

    /// Flush the device write cache
    fn flush(&self) -> IoResult<()>;

    /// Discard `count` blocks starting at `lba` (optional capability)
    fn trim(&self, lba: u64, count: u32) -> IoResult<()>;

    /// Read-only statistics snapshot
    fn stats(&self) -> StatsSnapshot;
}

// ============================================================================
// Queue-Backed Block Device
// ============================================================================

/// Block device backed by a hardware command-queue engine
pub struct QueueBlockDevice<T: QueueTransport, C: MonotonicClock> {
    engine: CommandEngine<T, C>,
    info: BlockDeviceInfo,
    stats: DeviceStats,
}

impl<T: QueueTransport, C: MonotonicClock> QueueBlockDevice<T, C> {
    /// Bind an engine and a geometry into a block device
    pub fn new(engine: CommandEngine<T, C>, info: BlockDeviceInfo) -> Self {
        Self {
            engine,
            info,
            stats: DeviceStats::new(),
        }
    }

    /// Access the underlying engine (health/monitor observation)
    pub fn engine(&self) -> &CommandEngine<T, C> {
        &self.engine
    }

    /// Current engine health
    pub fn health(&self) -> EngineHealth {
        self.engine.health()
    }

    fn check_range(&self, lba: u64, count: u32) -> IoResult<()> {
        let end = lba.checked_add(count as u64).ok_or(IoError::OutOfRange)?;
        if end > self.info.capacity_blocks || count > self.info.max_blocks {
            return Err(IoError::OutOfRange);
        }
        Ok(())
    }

    fn check_buffer(&self, count: u32, len: usize) -> IoResult<()> {
        if len < count as usize * self.info.block_size as usize {
            return Err(IoError::ShortBuffer);
        }
        Ok(())
    }
}

impl<T: QueueTransport, C: MonotonicClock> BlockDevice for QueueBlockDevice<T, C> {
    fn info(&self) -> BlockDeviceInfo {
        self.info.clone()
    }

    fn read(&self, lba: u64, count: u32, buf: &mut [u8]) -> IoResult<()> {
        self.check_range(lba, count)?;
        self.check_buffer(count, buf.len())?;
        if count == 0 {
            return Ok(());
        }

        let byte_len = count as usize * self.info.block_size as usize;
        let mut dma = SliceBuffer::new(&mut buf[..byte_len]);
        match self.engine.execute(&BlockCommand::read(lba, count), Some(&mut dma)) {
            Ok(_) => {
                self.stats.record_read(count);
                Ok(())
            }
            Err(e) => {
                self.stats.record_error();
                Err(e)
            }
        }
    }

    fn write(&self, lba: u64, count: u32, buf: &[u8]) -> IoResult<()> {
        if self.info.read_only {
            return Err(IoError::Unsupported);
        }
        self.check_range(lba, count)?;
        self.check_buffer(count, buf.len())?;
        if count == 0 {
            return Ok(());
        }

        // The engine only reads from the buffer for a write command; the
        // transport contract still takes the mutable DMA view, so the
        // payload is staged through a local copy to keep the caller's
        // slice immutable.
        let byte_len = count as usize * self.info.block_size as usize;
        let mut staged = alloc::vec::Vec::with_capacity(byte_len);
        staged.extend_from_slice(&buf[..byte_len]);
        let mut dma = SliceBuffer::new(&mut staged);

        match self.engine.execute(&BlockCommand::write(lba, count), Some(&mut dma)) {
            Ok(_) => {
                self.stats.record_write(count);
                Ok(())
            }
            Err(e) => {
                self.stats.record_error();
                Err(e)
            }
        }
    }

    fn flush(&self) -> IoResult<()> {
        match self.engine.execute(&BlockCommand::flush(), None) {
            Ok(_) => {
                self.stats.record_flush();
                Ok(())
            }
            Err(e) => {
                self.stats.record_error();
                Err(e)
            }
        }
    }

    fn trim(&self, lba: u64, count: u32) -> IoResult<()> {
        if !self.info.supports_trim {
            return Err(IoError::Unsupported);
        }
        self.check_range(lba, count)?;
        if count == 0 {
            return Ok(());
        }

        match self.engine.execute(&BlockCommand::trim(lba, count), None) {
            Ok(_) => {
                self.stats.record_trim();
                Ok(())
            }
            Err(e) => {
                self.stats.record_error();
                Err(e)
            }
        }
    }

    fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }
}
