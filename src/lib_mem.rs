#![forbid(unsafe_code)]
#![warn(clippy::pedantic)]

use std::sync::atomic::Ordering;
use std::sync::Arc;

use rand::RngCore;

use crate::domain::RunCounters;
use crate::error::SqueezeError;

/// A fixed-size block filled with random bytes so the kernel cannot share,
/// compress or lazily back it.
pub struct AllocationUnit {
    bytes: Box<[u8]>,
}

impl AllocationUnit {
    /// Allocates and fills `size` bytes. A refused reservation is reported as
    /// [`SqueezeError::ResourceExhaustion`] instead of aborting the process.
    pub fn write<R: RngCore>(size: u64, rng: &mut R) -> Result<Self, SqueezeError> {
        let exhausted = || SqueezeError::ResourceExhaustion { requested: size };
        let len = usize::try_from(size).map_err(|_| exhausted())?;
        let mut buf: Vec<u8> = Vec::new();
        buf.try_reserve_exact(len).map_err(|_| exhausted())?;
        buf.resize(len, 0);
        rng.fill_bytes(&mut buf);
        Ok(Self {
            bytes: buf.into_boxed_slice(),
        })
    }

    #[must_use]
    pub fn len(&self) -> u64 {
        self.bytes.len() as u64
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }
}

/// Append-only list of retained units. The byte total is tracked on push and
/// mirrored into the shared counters so readers never walk the list.
pub struct RetentionList {
    units: Vec<AllocationUnit>,
    retained: u64,
    counters: Arc<RunCounters>,
}

impl RetentionList {
    pub fn new(counters: Arc<RunCounters>) -> Self {
        Self {
            units: Vec::new(),
            retained: 0,
            counters,
        }
    }

    pub fn push(&mut self, unit: AllocationUnit) {
        self.retained += unit.len();
        self.units.push(unit);
        self.counters
            .retained_bytes
            .store(self.retained, Ordering::Release);
        self.counters.allocations.fetch_add(1, Ordering::AcqRel);
    }

    #[must_use]
    pub fn retained_bytes(&self) -> u64 {
        self.retained
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.units.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    #[must_use]
    pub fn units(&self) -> &[AllocationUnit] {
        &self.units
    }

    /// Frees every unit and zeroes the published total. Returns the bytes freed.
    pub fn release(&mut self) -> u64 {
        let freed = self.retained;
        self.units = Vec::new();
        self.retained = 0;
        self.counters.retained_bytes.store(0, Ordering::Release);
        freed
    }

    /// Drops the units without touching the published counters.
    pub fn abandon(self) {
        drop(self.units);
    }
}
