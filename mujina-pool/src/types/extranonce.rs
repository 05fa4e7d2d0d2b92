//! Extranonce1 allocation.
//!
//! Every session gets a distinct extranonce1 so that no two sessions can
//! search the same coinbase space. Values come from a bounded allocator and
//! return to it on disconnect.

use std::collections::BTreeSet;
use std::fmt;

use thiserror::Error;

/// Bytes of extranonce1 handed to each session.
pub const EXTRANONCE1_SIZE: usize = 4;

/// Per-session extranonce1, serialized big-endian into the coinbase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Extranonce1(u32);

impl Extranonce1 {
    pub fn value(&self) -> u32 {
        self.0
    }

    pub fn to_bytes(&self) -> [u8; EXTRANONCE1_SIZE] {
        self.0.to_be_bytes()
    }

    pub fn from_bytes(bytes: [u8; EXTRANONCE1_SIZE]) -> Self {
        Self(u32::from_be_bytes(bytes))
    }
}

impl fmt::Display for Extranonce1 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08x}", self.0)
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AllocError {
    #[error("extranonce1 space exhausted ({0} in use)")]
    Exhausted(usize),
}

/// Hands out unique extranonce1 values up to a fixed capacity.
///
/// Released values are reused lowest-first before fresh ones are minted.
#[derive(Debug)]
pub struct ExtranonceAllocator {
    next: u64,
    free: BTreeSet<u32>,
    in_use: usize,
    capacity: usize,
}

impl ExtranonceAllocator {
    pub fn new(capacity: usize) -> Self {
        Self {
            next: 1,
            free: BTreeSet::new(),
            in_use: 0,
            capacity: capacity.min(u32::MAX as usize),
        }
    }

    pub fn allocate(&mut self) -> Result<Extranonce1, AllocError> {
        if self.in_use >= self.capacity {
            return Err(AllocError::Exhausted(self.in_use));
        }
        let value = if let Some(v) = self.free.pop_first() {
            v
        } else if self.next <= u32::MAX as u64 {
            let v = self.next as u32;
            self.next += 1;
            v
        } else {
            return Err(AllocError::Exhausted(self.in_use));
        };
        self.in_use += 1;
        Ok(Extranonce1(value))
    }

    pub fn release(&mut self, extranonce1: Extranonce1) {
        if (extranonce1.0 as u64) < self.next && self.free.insert(extranonce1.0) {
            self.in_use = self.in_use.saturating_sub(1);
        }
    }

    pub fn in_use(&self) -> usize {
        self.in_use
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocations_are_unique() {
        let mut alloc = ExtranonceAllocator::new(100);
        let a = alloc.allocate().unwrap();
        let b = alloc.allocate().unwrap();
        assert_ne!(a, b);
        assert_eq!(alloc.in_use(), 2);
    }

    #[test]
    fn test_exhaustion_and_release() {
        let mut alloc = ExtranonceAllocator::new(2);
        let a = alloc.allocate().unwrap();
        let _b = alloc.allocate().unwrap();
        assert_eq!(alloc.allocate(), Err(AllocError::Exhausted(2)));

        alloc.release(a);
        let c = alloc.allocate().unwrap();
        assert_eq!(c, a, "released value is reused");
    }

    #[test]
    fn test_double_release_is_ignored() {
        let mut alloc = ExtranonceAllocator::new(4);
        let a = alloc.allocate().unwrap();
        alloc.release(a);
        alloc.release(a);
        assert_eq!(alloc.in_use(), 0);
    }

    #[test]
    fn test_bytes_and_display() {
        let e = Extranonce1::from_bytes([0xde, 0xad, 0xbe, 0xef]);
        assert_eq!(e.to_string(), "deadbeef");
        assert_eq!(e.to_bytes(), [0xde, 0xad, 0xbe, 0xef]);
    }
}
