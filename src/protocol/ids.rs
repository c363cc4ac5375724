//! Cyclic request-id allocation.
//!
//! Each sub-protocol that issues requests owns one allocator over a fixed
//! half-open range (default `[100, 999)`). Ids are handed out in ring
//! order and recycled once released; an id still outstanding is skipped on
//! wraparound rather than reused, and a fully outstanding range is an
//! error instead of a silent collision.

use std::collections::HashSet;

use crate::error::{ProtocolError, Result};

/// Ring allocator over `[start, end)` that never reissues an outstanding id
#[derive(Debug)]
pub struct IdAllocator {
    start: u32,
    end: u32,
    next: u32,
    outstanding: HashSet<u32>,
}

impl IdAllocator {
    /// Allocator over the half-open range `[start, end)`.
    ///
    /// # Errors
    /// `ConfigError` if the range is empty.
    pub fn new(start: u32, end: u32) -> Result<Self> {
        if start >= end {
            return Err(ProtocolError::ConfigError(format!(
                "id range [{start}, {end}) is empty"
            )));
        }
        Ok(Self {
            start,
            end,
            next: start,
            outstanding: HashSet::new(),
        })
    }

    /// Allocator over the default range
    pub fn with_defaults() -> Self {
        let (start, end) = crate::config::DEFAULT_ID_RANGE;
        Self {
            start,
            end,
            next: start,
            outstanding: HashSet::new(),
        }
    }

    /// Size of the id range
    pub fn capacity(&self) -> u32 {
        self.end - self.start
    }

    /// Number of ids currently outstanding
    pub fn outstanding(&self) -> usize {
        self.outstanding.len()
    }

    /// Whether `id` is currently outstanding
    pub fn is_outstanding(&self, id: u32) -> bool {
        self.outstanding.contains(&id)
    }

    /// Hand out the next free id.
    ///
    /// # Errors
    /// `IdSpaceExhausted` when every id in the range is outstanding.
    pub fn allocate(&mut self) -> Result<u32> {
        let capacity = self.capacity();
        if self.outstanding.len() as u32 >= capacity {
            return Err(ProtocolError::IdSpaceExhausted(capacity));
        }

        // Bounded by capacity: at least one id is free.
        let mut candidate = self.next;
        for _ in 0..capacity {
            let id = candidate;
            candidate = if id + 1 >= self.end { self.start } else { id + 1 };
            if !self.outstanding.contains(&id) {
                self.outstanding.insert(id);
                self.next = candidate;
                return Ok(id);
            }
        }

        Err(ProtocolError::IdSpaceExhausted(capacity))
    }

    /// Return an id to the pool. Returns whether it was outstanding.
    pub fn release(&mut self, id: u32) -> bool {
        self.outstanding.remove(&id)
    }

    /// Forget all outstanding ids
    pub fn clear(&mut self) {
        self.outstanding.clear();
    }
}
