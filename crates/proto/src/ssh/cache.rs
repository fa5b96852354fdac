//! Bounded receive buffer for channel data.
//!
//! Data is appended by the channel's ordered task and read by the
//! application. Closing the cache stops further writes, but everything
//! already buffered stays readable; end-of-stream is reported only once the
//! cache is both closed and empty.

use super::sync::{lock, wait_until};
use bytes::{Bytes, BytesMut};
use skiff_platform::{SkiffError, SkiffResult};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

#[derive(Debug)]
struct CacheInner {
    buffer: BytesMut,
    open: bool,
}

/// Bounded byte buffer with half-close semantics.
#[derive(Debug)]
pub struct ReceiveCache {
    inner: Mutex<CacheInner>,
    capacity: usize,
    poll_interval: Duration,
    data_ready: Notify,
    space_ready: Notify,
}

impl ReceiveCache {
    /// Creates an open cache holding at most `capacity` bytes.
    pub fn new(capacity: usize, poll_interval: Duration) -> Self {
        Self {
            inner: Mutex::new(CacheInner {
                buffer: BytesMut::new(),
                open: true,
            }),
            capacity,
            poll_interval,
            data_ready: Notify::new(),
            space_ready: Notify::new(),
        }
    }

    /// Maximum number of buffered bytes.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of buffered bytes.
    pub fn len(&self) -> usize {
        lock(&self.inner).buffer.len()
    }

    /// True when nothing is buffered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// True until [`close`](Self::close) is called.
    pub fn is_open(&self) -> bool {
        lock(&self.inner).open
    }

    /// True once closed and fully drained.
    pub fn is_eof(&self) -> bool {
        let inner = lock(&self.inner);
        !inner.open && inner.buffer.is_empty()
    }

    /// Appends data, waiting for space as needed.
    ///
    /// Fails if the cache is closed before all of `data` fits.
    pub async fn put(&self, data: &[u8]) -> SkiffResult<()> {
        let mut written = 0;
        while written < data.len() {
            let step = wait_until(&self.space_ready, self.poll_interval, None, || {
                let mut inner = lock(&self.inner);
                if !inner.open {
                    return Some(Err(SkiffError::Channel(
                        "receive cache is closed".to_string(),
                    )));
                }
                let free = self.capacity.saturating_sub(inner.buffer.len());
                if free == 0 {
                    return None;
                }
                let n = free.min(data.len() - written);
                inner.buffer.extend_from_slice(&data[written..written + n]);
                Some(Ok(n))
            })
            .await;

            match step {
                Some(Ok(n)) => {
                    written += n;
                    self.data_ready.notify_waiters();
                }
                Some(Err(e)) => return Err(e),
                None => return Err(SkiffError::timeout("receive cache put timed out")),
            }
        }
        Ok(())
    }

    /// Reads up to `max` bytes, waiting for data.
    ///
    /// Returns `Ok(None)` at end-of-stream.
    pub async fn get(&self, max: usize) -> SkiffResult<Option<Bytes>> {
        self.get_until(max, None).await
    }

    /// Like [`get`](Self::get) but gives up after `timeout`.
    pub async fn get_timeout(&self, max: usize, timeout: Duration) -> SkiffResult<Option<Bytes>> {
        self.get_until(max, Some(Instant::now() + timeout)).await
    }

    /// Reads whatever is buffered without waiting.
    pub fn try_get(&self, max: usize) -> Option<Bytes> {
        let data = self.take(&mut lock(&self.inner), max)?;
        self.space_ready.notify_waiters();
        Some(data)
    }

    async fn get_until(
        &self,
        max: usize,
        deadline: Option<Instant>,
    ) -> SkiffResult<Option<Bytes>> {
        let result = wait_until(&self.data_ready, self.poll_interval, deadline, || {
            let mut inner = lock(&self.inner);
            match self.take(&mut inner, max) {
                Some(data) => Some(Some(data)),
                None if !inner.open => Some(None),
                None => None,
            }
        })
        .await
        .ok_or_else(|| SkiffError::timeout("receive timed out"))?;
        if result.is_some() {
            self.space_ready.notify_waiters();
        }
        Ok(result)
    }

    fn take(&self, inner: &mut CacheInner, max: usize) -> Option<Bytes> {
        if inner.buffer.is_empty() || max == 0 {
            return None;
        }
        let n = max.min(inner.buffer.len());
        Some(inner.buffer.split_to(n).freeze())
    }

    /// Closes the cache for writing and wakes all waiters.
    pub fn close(&self) {
        lock(&self.inner).open = false;
        self.data_ready.notify_waiters();
        self.space_ready.notify_waiters();
    }
}
