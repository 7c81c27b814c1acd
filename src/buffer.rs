//! Growable byte queue used for connection and tunnel buffers.
//!
//! The buffer has a logical capacity that only changes when an enqueue would
//! overflow it. Consuming bytes from the front shifts the remainder down to
//! offset 0; there is no ring-buffer wraparound.

use crate::config::DEFAULT_BUFFER_PAGE_SIZE;
use crate::error::Error;
use std::io::{self, Read, Write};
use tracing::debug;

/// A byte queue with explicit capacity that grows in page-sized steps.
#[derive(Debug)]
pub struct GrowableBuffer {
    data: Vec<u8>,
    capacity: usize,
    page_size: usize,
}

impl GrowableBuffer {
    /// Creates a buffer with the given capacity and the default page size.
    pub fn new(capacity: usize) -> Result<Self, Error> {
        Self::with_page_size(capacity, DEFAULT_BUFFER_PAGE_SIZE)
    }

    /// Creates a buffer with the given capacity and growth granularity.
    pub fn with_page_size(capacity: usize, page_size: usize) -> Result<Self, Error> {
        let mut data = Vec::new();
        data.try_reserve_exact(capacity)?;
        Ok(Self {
            data,
            capacity,
            page_size: page_size.max(1),
        })
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Current logical capacity.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Bytes that can be stored without growing.
    pub fn remaining(&self) -> usize {
        self.capacity.saturating_sub(self.data.len())
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    /// Appends bytes, growing the buffer if they do not fit.
    pub fn enqueue(&mut self, bytes: &[u8]) -> Result<(), Error> {
        self.enqueue_parts(&[bytes])
    }

    /// Appends several slices as one unit.
    ///
    /// Capacity for all parts is secured before anything is copied, so a
    /// failed growth leaves the buffer untouched.
    pub fn enqueue_parts(&mut self, parts: &[&[u8]]) -> Result<(), Error> {
        let total: usize = parts.iter().map(|part| part.len()).sum();
        if total > self.remaining() {
            self.grow(total)?;
        }
        for part in parts {
            self.data.extend_from_slice(part);
        }
        Ok(())
    }

    /// Drops `n` bytes from the front and shifts the rest to offset 0.
    pub fn consume(&mut self, n: usize) {
        let n = n.min(self.data.len());
        self.data.drain(..n);
    }

    pub fn clear(&mut self) {
        self.data.clear();
    }

    /// Performs a single read of at most `limit` bytes into free space.
    ///
    /// Never grows the buffer: with no free space this returns `Ok(0)`
    /// without touching the reader, so callers must check
    /// [`remaining`](Self::remaining) to tell a full buffer from EOF.
    pub fn fill_from<R: Read>(&mut self, reader: &mut R, limit: usize) -> io::Result<usize> {
        let want = limit.min(self.remaining());
        if want == 0 {
            return Ok(0);
        }
        let start = self.data.len();
        self.data.resize(start + want, 0);
        match reader.read(&mut self.data[start..]) {
            Ok(n) => {
                self.data.truncate(start + n);
                Ok(n)
            }
            Err(err) => {
                self.data.truncate(start);
                Err(err)
            }
        }
    }

    /// Performs a single write of the queued bytes and consumes what was
    /// written.
    pub fn drain_into<W: Write>(&mut self, writer: &mut W) -> io::Result<usize> {
        if self.data.is_empty() {
            return Ok(0);
        }
        let written = writer.write(&self.data)?;
        self.consume(written);
        Ok(written)
    }

    fn grow(&mut self, additional: usize) -> Result<(), Error> {
        let page = self.page_size;
        let new_capacity = self
            .capacity
            .saturating_add(additional)
            .saturating_add(page)
            / page
            * page;
        self.data
            .try_reserve_exact(new_capacity - self.data.len())?;
        debug!(
            old_capacity = self.capacity,
            new_capacity, "Enlarging buffer"
        );
        self.capacity = new_capacity;
        Ok(())
    }
}
