// SPDX-FileCopyrightText: © 2025 Castflow Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Bounded, recycling byte-buffer pool.
//!
//! Every output port owns one pool. Acquisition waits when all buffers are
//! in flight — that is the framework's backpressure: a producer cannot run
//! further ahead than the pool capacity lets it. `unblock()` releases every
//! waiter with `None` at teardown, and makes all subsequent acquisitions
//! fail fast.

use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::Notify;

struct PoolState {
    free: Vec<Vec<u8>>,
    /// Buffers currently in existence (free + in flight).
    allocated: usize,
    capacity: usize,
    unblocked: bool,
}

struct PoolShared {
    state: Mutex<PoolState>,
    returned: Notify,
}

/// Bounded pool of reusable byte buffers.
#[derive(Clone)]
pub struct BufferPool {
    shared: Arc<PoolShared>,
}

impl BufferPool {
    /// A pool that hands out at most `capacity` buffers at a time.
    pub fn new(capacity: usize) -> Self {
        Self {
            shared: Arc::new(PoolShared {
                state: Mutex::new(PoolState { free: Vec::new(), allocated: 0, capacity, unblocked: false }),
                returned: Notify::new(),
            }),
        }
    }

    /// Acquire a zero-filled buffer of exactly `size` bytes (the storage may
    /// be larger if recycled). Waits while the pool is exhausted; returns
    /// `None` once [`BufferPool::unblock`] has been called.
    ///
    /// A caller that gets `None` must abandon the current tick and must not
    /// emit a packet for it.
    pub async fn alloc(&self, size: usize) -> Option<PooledBuffer> {
        loop {
            // register for wakeups before re-checking, so a buffer returned
            // (or an unblock) in between is not missed
            let mut wait = std::pin::pin!(self.shared.returned.notified());
            wait.as_mut().enable();
            {
                let mut st = self.shared.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
                if st.unblocked {
                    return None;
                }
                if let Some(mut data) = st.free.pop() {
                    data.clear();
                    data.resize(size, 0);
                    return Some(PooledBuffer::recyclable(data, &self.shared));
                }
                if st.allocated < st.capacity {
                    st.allocated += 1;
                    return Some(PooledBuffer::recyclable(vec![0; size], &self.shared));
                }
            }
            wait.await;
        }
    }

    /// Wake all waiters with `None` and fail every future acquisition.
    pub fn unblock(&self) {
        let mut st = self.shared.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        st.unblocked = true;
        drop(st);
        self.shared.returned.notify_waiters();
    }

    /// Buffers currently available without waiting.
    pub fn available(&self) -> usize {
        let st = self.shared.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        st.free.len() + (st.capacity - st.allocated)
    }
}

/// A buffer handle. Recyclable handles give their storage back to the pool
/// on drop; detached ones free it.
pub struct PooledBuffer {
    data: Vec<u8>,
    pool: Option<Weak<PoolShared>>,
}

impl PooledBuffer {
    fn recyclable(data: Vec<u8>, pool: &Arc<PoolShared>) -> Self {
        Self { data, pool: Some(Arc::downgrade(pool)) }
    }

    /// A buffer not backed by any pool (control packets, tests).
    pub const fn detached(data: Vec<u8>) -> Self {
        Self { data, pool: None }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Shrink or grow the logical contents.
    pub fn resize(&mut self, len: usize) {
        self.data.resize(len, 0);
    }

    /// Take the storage out, opting out of recycling.
    pub fn into_vec(mut self) -> Vec<u8> {
        if let Some(pool) = self.pool.take() {
            if let Some(shared) = pool.upgrade() {
                let mut st = shared.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
                st.allocated = st.allocated.saturating_sub(1);
                drop(st);
                shared.returned.notify_one();
            }
        }
        std::mem::take(&mut self.data)
    }
}

impl std::fmt::Debug for PooledBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledBuffer")
            .field("len", &self.data.len())
            .field("recyclable", &self.pool.is_some())
            .finish()
    }
}

impl Deref for PooledBuffer {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        self.as_slice()
    }
}

impl DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.as_mut_slice()
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        let Some(pool) = self.pool.take() else { return };
        let Some(shared) = pool.upgrade() else { return };
        let mut st = shared.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        st.free.push(std::mem::take(&mut self.data));
        drop(st);
        shared.returned.notify_one();
    }
}
