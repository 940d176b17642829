//! Deterministic VLAN id allocation.
//!
//! A slice's VLAN is derived from a hash of its id, so the same slice lands on the same VLAN
//! across attempts. Collisions with VLANs held by other live slices are resolved by rehashing
//! with a salt, then by a linear scan of the range.

use std::{
    hash::Hasher,
    ops::RangeInclusive,
};

use parking_lot::Mutex;
use rustc_hash::{FxHashMap, FxHashSet, FxHasher};
use thiserror::Error;

use crate::model::SliceId;

/// Reserved for the quarantine segment. Never allocated to a slice.
pub const QUARANTINE_VLAN: u16 = 99;
/// Range used by the access point, container and simulated backends.
pub const SLICE_RANGE: RangeInclusive<u16> = 100..=999;
/// Range used by the bridge backend.
pub const LEGACY_RANGE: RangeInclusive<u16> = 1..=4094;

const SALTED_ATTEMPTS: u32 = 16;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("no free VLAN id in {start}..={end}")]
pub struct VlanExhausted {
    pub start: u16,
    pub end: u16,
}

#[derive(Debug, Default)]
struct Allocations {
    by_vlan: FxHashMap<u16, SliceId>,
    by_slice: FxHashMap<SliceId, u16>,
}

/// Tracks which VLAN ids are held by live slices.
#[derive(Debug)]
pub struct VlanAllocator {
    allocations: Mutex<Allocations>,
    reserved: FxHashSet<u16>,
}

impl Default for VlanAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl VlanAllocator {
    pub fn new() -> Self {
        Self { allocations: Mutex::default(), reserved: FxHashSet::from_iter([QUARANTINE_VLAN]) }
    }

    /// The candidate VLAN of `id` for a given salt.
    pub fn derive(id: &SliceId, salt: u32, range: &RangeInclusive<u16>) -> u16 {
        let mut hasher = FxHasher::default();
        hasher.write(id.as_uuid().as_bytes());
        hasher.write_u32(salt);

        let len = u64::from(range.end() - range.start()) + 1;
        range.start() + (hasher.finish() % len) as u16
    }

    /// Allocates a VLAN in `range` for `id`.
    ///
    /// Idempotent: a slice that already holds a VLAN in `range` gets the same one back. A VLAN
    /// held outside `range` is released first.
    pub fn allocate(&self, id: SliceId, range: RangeInclusive<u16>) -> Result<u16, VlanExhausted> {
        let mut allocations = self.allocations.lock();

        if let Some(&vlan) = allocations.by_slice.get(&id) {
            if range.contains(&vlan) {
                return Ok(vlan);
            }
            allocations.by_slice.remove(&id);
            allocations.by_vlan.remove(&vlan);
        }

        let free = |vlan: u16| !self.reserved.contains(&vlan) && !allocations.by_vlan.contains_key(&vlan);

        let first = Self::derive(&id, 0, &range);
        let vlan = std::iter::once(first)
            .chain((1..=SALTED_ATTEMPTS).map(|salt| Self::derive(&id, salt, &range)))
            .find(|vlan| free(*vlan))
            .or_else(|| {
                let (start, end) = (*range.start(), *range.end());
                (first..=end).chain(start..first).find(|vlan| free(*vlan))
            })
            .ok_or(VlanExhausted { start: *range.start(), end: *range.end() })?;

        if vlan != first {
            tracing::debug!(slice = %id, first, vlan, "vlan collision resolved");
        }

        allocations.by_vlan.insert(vlan, id);
        allocations.by_slice.insert(id, vlan);
        Ok(vlan)
    }

    /// Releases the VLAN of `id`, returning it.
    pub fn release(&self, id: &SliceId) -> Option<u16> {
        let mut allocations = self.allocations.lock();
        let vlan = allocations.by_slice.remove(id)?;
        allocations.by_vlan.remove(&vlan);
        Some(vlan)
    }

    pub fn holder(&self, vlan: u16) -> Option<SliceId> {
        self.allocations.lock().by_vlan.get(&vlan).copied()
    }

    pub fn vlan_of(&self, id: &SliceId) -> Option<u16> {
        self.allocations.lock().by_slice.get(id).copied()
    }

    /// Number of VLANs currently held.
    pub fn allocated(&self) -> usize {
        self.allocations.lock().by_vlan.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derivation_is_stable_and_in_range() {
        let id = SliceId::new();
        let vlan = VlanAllocator::derive(&id, 0, &SLICE_RANGE);
        assert!(SLICE_RANGE.contains(&vlan));
        assert_eq!(vlan, VlanAllocator::derive(&id, 0, &SLICE_RANGE));
    }

    #[test]
    fn allocation_is_idempotent() {
        let allocator = VlanAllocator::new();
        let id = SliceId::new();

        let vlan = allocator.allocate(id, SLICE_RANGE).unwrap();
        assert_eq!(allocator.allocate(id, SLICE_RANGE).unwrap(), vlan);
        assert_eq!(allocator.allocated(), 1);
        assert_eq!(allocator.holder(vlan), Some(id));

        assert_eq!(allocator.release(&id), Some(vlan));
        assert_eq!(allocator.allocated(), 0);
        assert_eq!(allocator.release(&id), None);
    }

    #[test]
    fn collisions_are_resolved_until_exhaustion() {
        let allocator = VlanAllocator::new();
        let range = 100..=109;

        let mut seen = FxHashSet::default();
        for _ in 0..10 {
            let vlan = allocator.allocate(SliceId::new(), range.clone()).unwrap();
            assert!(range.contains(&vlan));
            assert!(seen.insert(vlan), "vlan {vlan} allocated twice");
        }

        let err = allocator.allocate(SliceId::new(), range).unwrap_err();
        assert_eq!(err, VlanExhausted { start: 100, end: 109 });
    }

    #[test]
    fn quarantine_is_never_allocated() {
        let allocator = VlanAllocator::new();
        let range = 98..=100;

        let vlans: Vec<u16> = (0..2).map(|_| allocator.allocate(SliceId::new(), range.clone()).unwrap()).collect();
        assert!(!vlans.contains(&QUARANTINE_VLAN));
        assert!(allocator.allocate(SliceId::new(), range).is_err());
    }

    #[test]
    fn changing_range_reallocates() {
        let allocator = VlanAllocator::new();
        let id = SliceId::new();

        allocator.allocate(id, 100..=100).unwrap();
        assert_eq!(allocator.allocate(id, 200..=200).unwrap(), 200);
        assert_eq!(allocator.holder(100), None);
        assert_eq!(allocator.allocated(), 1);
    }
}
