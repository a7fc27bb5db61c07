// ============================================================================
// src/block/request.rs - Generic Block Request Queue
// ============================================================================
//! FIFO buffering layer above the command ring.
//!
//! `RingFull` is a synchronous back-pressure signal, not a failure: the
//! correct caller response is to park the request here and drain it when
//! slots free up. This is a pure data structure with no hardware knowledge
//! and is reusable by any block device.

use alloc::collections::VecDeque;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicUsize, Ordering};

use spin::Mutex;

use crate::error::IoError;
use crate::transport::BlockOp;

// ============================================================================
// Block Request
// ============================================================================

/// Request lifecycle state
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RequestState {
    /// Request is waiting in the queue
    Pending,
    /// Request has been handed to the engine
    Submitted,
    /// Request completed successfully
    Completed,
    /// Request failed
    Failed(IoError),
}

/// A buffered block I/O request
#[derive(Debug)]
pub struct BlockRequest {
    /// Request ID (assigned by the queue)
    pub id: u64,
    /// Operation
    pub op: BlockOp,
    /// Starting block address
    pub lba: u64,
    /// Number of blocks
    pub count: u32,
    /// Data payload (write data in, read data out)
    pub buffer: Option<Vec<u8>>,
    /// Lifecycle state
    pub state: RequestState,
}

impl BlockRequest {
    pub fn read(lba: u64, count: u32, block_size: u32) -> Self {
        Self {
            id: 0,
            op: BlockOp::Read,
            lba,
            count,
            buffer: Some(alloc::vec![0u8; count as usize * block_size as usize]),
            state: RequestState::Pending,
        }
    }

    pub fn write(lba: u64, data: Vec<u8>, block_size: u32) -> Self {
        let count = (data.len() / block_size as usize) as u32;
        Self {
            id: 0,
            op: BlockOp::Write,
            lba,
            count,
            buffer: Some(data),
            state: RequestState::Pending,
        }
    }

    pub fn flush() -> Self {
        Self {
            id: 0,
            op: BlockOp::Flush,
            lba: 0,
            count: 0,
            buffer: None,
            state: RequestState::Pending,
        }
    }

    pub fn is_complete(&self) -> bool {
        matches!(self.state, RequestState::Completed | RequestState::Failed(_))
    }
}

// ============================================================================
// Request Queue
// ============================================================================

/// FIFO request queue with O(1) length query
pub struct RequestQueue {
    queue: Mutex<VecDeque<BlockRequest>>,
    /// Length mirror, readable without taking the lock
    len: AtomicUsize,
    next_id: AtomicUsize,
}

impl RequestQueue {
    pub const fn new() -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            len: AtomicUsize::new(0),
            next_id: AtomicUsize::new(1),
        }
    }

    /// Append a request, assigning it a fresh ID. Returns the ID.
    pub fn enqueue(&self, mut request: BlockRequest) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) as u64;
        request.id = id;
        let mut queue = self.queue.lock();
        queue.push_back(request);
        self.len.store(queue.len(), Ordering::Release);
        id
    }

    /// Pop the oldest request (FIFO order)
    pub fn dequeue(&self) -> Option<BlockRequest> {
        let mut queue = self.queue.lock();
        let request = queue.pop_front();
        self.len.store(queue.len(), Ordering::Release);
        request
    }

    /// Number of parked requests, without taking the lock
    pub fn len(&self) -> usize {
        self.len.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for RequestQueue {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Tests
// ============================================================================
