/*
 * This source code is licensed under the MIT license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Fixed-capacity ring of per-tick sample buckets.
//!
//! Capacity is fixed at construction; once the ring wraps, pushing a bucket
//! overwrites the oldest slot in place. Buckets are only pushed after a
//! tick completed successfully, so every stored bucket is immutable and
//! safe to expose to readers.

use crate::trace::Sample;

/// All samples produced by a single tick, one per observed thread.
#[derive(Debug, Default)]
pub struct Bucket {
    pub samples: Vec<Sample>,
}

pub struct BucketRing {
    slots: Vec<Option<Bucket>>,
    /// Slot holding the most recently published bucket.
    head: usize,
}

impl BucketRing {
    pub fn with_capacity(capacity: usize) -> Self {
        assert!(capacity > 0, "ring capacity must be non-zero");
        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, || None);
        BucketRing { slots, head: 0 }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Publish a completed bucket, evicting the oldest one once the ring
    /// has wrapped.
    pub fn push(&mut self, bucket: Bucket) {
        self.head = (self.head + 1) % self.slots.len();
        self.slots[self.head] = Some(bucket);
    }

    /// The most recently published bucket.
    pub fn latest(&self) -> Option<&Bucket> {
        self.slots[self.head].as_ref()
    }

    /// All currently retained buckets, oldest first.
    pub fn iter(&self) -> impl Iterator<Item = &Bucket> {
        let capacity = self.slots.len();
        (1..=capacity)
            .map(move |offset| (self.head + offset) % capacity)
            .filter_map(|slot| self.slots[slot].as_ref())
    }

    /// Total number of retained samples across all buckets.
    pub fn sample_count(&self) -> usize {
        self.iter().map(|b| b.samples.len()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bucket(thread_id: u64, elapsed_since_start_ns: u64) -> Bucket {
        Bucket {
            samples: vec![Sample {
                thread_id,
                stack_id: 0,
                elapsed_since_start_ns,
            }],
        }
    }

    #[test]
    fn empty_ring() {
        let ring = BucketRing::with_capacity(4);
        assert_eq!(ring.capacity(), 4);
        assert!(ring.latest().is_none());
        assert_eq!(ring.iter().count(), 0);
        assert_eq!(ring.sample_count(), 0);
    }

    #[test]
    fn chronological_iteration_before_wrap() {
        let mut ring = BucketRing::with_capacity(4);
        for t in 0..3 {
            ring.push(bucket(1, t));
        }
        let order: Vec<u64> = ring
            .iter()
            .map(|b| b.samples[0].elapsed_since_start_ns)
            .collect();
        assert_eq!(order, vec![0, 1, 2]);
        assert_eq!(ring.latest().unwrap().samples[0].elapsed_since_start_ns, 2);
    }

    #[test]
    fn wrap_evicts_oldest_and_keeps_capacity() {
        let mut ring = BucketRing::with_capacity(3);
        for t in 0..10 {
            ring.push(bucket(1, t));
            assert_eq!(ring.capacity(), 3);
            assert!(ring.iter().count() <= 3);
        }
        let order: Vec<u64> = ring
            .iter()
            .map(|b| b.samples[0].elapsed_since_start_ns)
            .collect();
        assert_eq!(order, vec![7, 8, 9]);
    }

    #[test]
    fn retained_samples_bounded_by_capacity_times_threads() {
        let threads = 5;
        let mut ring = BucketRing::with_capacity(8);
        for t in 0..100u64 {
            let samples = (0..threads)
                .map(|id| Sample {
                    thread_id: id,
                    stack_id: 0,
                    elapsed_since_start_ns: t,
                })
                .collect();
            ring.push(Bucket { samples });
            assert!(ring.sample_count() <= 8 * threads as usize);
        }
        assert_eq!(ring.sample_count(), 8 * threads as usize);
    }
}
