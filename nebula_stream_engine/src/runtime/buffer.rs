// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Tuple buffers and the process-wide buffer manager.
//!
//! The manager keeps two tiers: a pre-allocated pool of fixed-size buffers, and unpooled
//! arbitrary-size allocations for results that do not fit the fixed size. Pooled buffers
//! return to the pool when dropped; unpooled ones are freed. Acquisition comes in blocking,
//! timed, and non-blocking flavors, all over one condition variable.

use std::sync::{Arc, Condvar, Mutex, Weak};
use std::time::Duration;

use crate::catalog::OriginId;

/// Size of the on-wire buffer header: `numTuples`, `originId`, `watermark`,
/// `sequenceNumber`, each a `u64`.
pub const BUFFER_HEADER_SIZE: usize = 32;

struct PoolShared {
    free: Mutex<Vec<Box<[u8]>>>,
    available: Condvar,
}

/// Process-wide pool of tuple buffers.
pub struct BufferManager {
    shared: Arc<PoolShared>,
    buffer_size: usize,
    pool_size: usize,
}

impl BufferManager {
    pub fn new(pool_size: usize, buffer_size: usize) -> Self {
        let free = (0..pool_size)
            .map(|_| vec![0u8; buffer_size].into_boxed_slice())
            .collect();
        Self {
            shared: Arc::new(PoolShared {
                free: Mutex::new(free),
                available: Condvar::new(),
            }),
            buffer_size,
            pool_size,
        }
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    pub fn pool_size(&self) -> usize {
        self.pool_size
    }

    /// Buffers currently available in the pool.
    pub fn available(&self) -> usize {
        self.shared.free.lock().expect("pool lock").len()
    }

    /// Waits until a pooled buffer is available.
    pub fn get_blocking(&self) -> TupleBuffer {
        let mut free = self.shared.free.lock().expect("pool lock");
        loop {
            if let Some(data) = free.pop() {
                return self.wrap(data);
            }
            free = self.shared.available.wait(free).expect("pool lock");
        }
    }

    /// Waits up to `timeout` for a pooled buffer; `None` on expiry.
    pub fn get_timeout(&self, timeout: Duration) -> Option<TupleBuffer> {
        let mut free = self.shared.free.lock().expect("pool lock");
        loop {
            if let Some(data) = free.pop() {
                return Some(self.wrap(data));
            }
            let (guard, result) = self
                .shared
                .available
                .wait_timeout(free, timeout)
                .expect("pool lock");
            free = guard;
            if result.timed_out() {
                return free.pop().map(|data| self.wrap(data));
            }
        }
    }

    /// Returns a pooled buffer immediately, or `None` when the pool is empty.
    pub fn get_no_blocking(&self) -> Option<TupleBuffer> {
        let mut free = self.shared.free.lock().expect("pool lock");
        free.pop().map(|data| self.wrap(data))
    }

    /// Allocates an unpooled buffer of arbitrary size; it is freed on drop, not recycled.
    pub fn get_unpooled(&self, size: usize) -> TupleBuffer {
        TupleBuffer {
            data: Some(vec![0u8; size].into_boxed_slice()),
            pool: None,
            num_tuples: 0,
            origin_id: OriginId(0),
            watermark: 0,
            sequence_number: 0,
        }
    }

    fn wrap(&self, mut data: Box<[u8]>) -> TupleBuffer {
        data.fill(0);
        TupleBuffer {
            data: Some(data),
            pool: Some(Arc::downgrade(&self.shared)),
            num_tuples: 0,
            origin_id: OriginId(0),
            watermark: 0,
            sequence_number: 0,
        }
    }
}

/// A contiguous byte region carrying tuples, preceded (on the wire) by a fixed header.
///
/// Ownership is unique; pipeline stages pass buffers by value and consumers that need to
/// retain one wrap it in an `Arc`. Dropping the last owner returns pooled memory to its
/// pool.
pub struct TupleBuffer {
    data: Option<Box<[u8]>>,
    pool: Option<Weak<PoolShared>>,
    num_tuples: u64,
    origin_id: OriginId,
    watermark: u64,
    sequence_number: u64,
}

impl TupleBuffer {
    pub fn payload(&self) -> &[u8] {
        self.data.as_deref().expect("buffer not yet dropped")
    }

    pub fn payload_mut(&mut self) -> &mut [u8] {
        self.data.as_deref_mut().expect("buffer not yet dropped")
    }

    pub fn capacity(&self) -> usize {
        self.payload().len()
    }

    pub fn num_tuples(&self) -> u64 {
        self.num_tuples
    }

    pub fn set_num_tuples(&mut self, count: u64) {
        self.num_tuples = count;
    }

    pub fn origin_id(&self) -> OriginId {
        self.origin_id
    }

    pub fn set_origin_id(&mut self, origin: OriginId) {
        self.origin_id = origin;
    }

    pub fn watermark(&self) -> u64 {
        self.watermark
    }

    pub fn set_watermark(&mut self, watermark: u64) {
        self.watermark = watermark;
    }

    pub fn sequence_number(&self) -> u64 {
        self.sequence_number
    }

    pub fn set_sequence_number(&mut self, sequence_number: u64) {
        self.sequence_number = sequence_number;
    }
}

impl std::fmt::Debug for TupleBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("TupleBuffer")
            .field("capacity", &self.capacity())
            .field("num_tuples", &self.num_tuples)
            .field("origin_id", &self.origin_id)
            .field("watermark", &self.watermark)
            .field("sequence_number", &self.sequence_number)
            .finish()
    }
}

impl Drop for TupleBuffer {
    fn drop(&mut self) {
        let Some(data) = self.data.take() else {
            return;
        };
        if let Some(pool) = self.pool.as_ref().and_then(Weak::upgrade) {
            pool.free.lock().expect("pool lock").push(data);
            pool.available.notify_one();
        }
    }
}
