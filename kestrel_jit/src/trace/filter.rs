//! Trace-admission filtering.
//!
//! Hot entry addresses pass through two gates before a trace selection is
//! admitted: a coarse per-entry hotness counter (owned by the interpreter,
//! compared against the configured threshold), then this associative
//! filter, which requires the same (method, entry-address) key to recur
//! before admitting a request. The recurrence requirement trades trace
//! precision for responsiveness: a loop body that keeps reappearing wins a
//! filter slot; one-shot code does not.
//!
//! Replacement on collision is randomized rather than LRU so that large
//! trace bodies whose entries hash widely are not starved by a handful of
//! very hot keys.

use std::hash::Hasher;
use std::sync::atomic::{AtomicU64, Ordering};

use kestrel_core::{BytecodeAddr, MethodId};
use rustc_hash::FxHasher;

/// Default number of filter slots.
pub const DEFAULT_FILTER_SIZE: usize = 32;

/// How many low bits of the entry address participate in the key.
const ADDR_LOW_BITS: usize = 12;

// =============================================================================
// Filter Key
// =============================================================================

/// Build the filter key from the containing method and the low bits of the
/// entry address.
#[inline]
pub fn filter_key(method: MethodId, entry: BytecodeAddr) -> u64 {
    let mut hasher = FxHasher::default();
    hasher.write_usize(method.0);
    hasher.write_usize(entry.0 & ((1 << ADDR_LOW_BITS) - 1));
    hasher.finish()
}

// =============================================================================
// Threshold Filter
// =============================================================================

/// Fixed-size associative filter over trace-request keys.
///
/// Lock-free: slots are relaxed atomics and the replacement RNG races are
/// benign; the filter is a heuristic, not a correctness structure.
#[derive(Debug)]
pub struct TraceThresholdFilter {
    slots: Box<[AtomicU64]>,
    rng: AtomicU64,
    admits: AtomicU64,
    inserts: AtomicU64,
}

impl TraceThresholdFilter {
    /// Create a filter with `size` slots, seeded for replacement.
    pub fn new(size: usize, seed: u64) -> Self {
        let size = size.max(1);
        let slots = (0..size).map(|_| AtomicU64::new(0)).collect();
        TraceThresholdFilter {
            slots,
            // Xorshift state must be non-zero.
            rng: AtomicU64::new(seed | 1),
            admits: AtomicU64::new(0),
            inserts: AtomicU64::new(0),
        }
    }

    /// Number of slots.
    #[inline]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Whether the filter has zero slots (never true in practice).
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Check whether the key has recurred.
    ///
    /// Returns `true` (admit) when the key is already present. Otherwise
    /// the key replaces a randomly chosen victim slot and the request is
    /// denied; a subsequent occurrence of the same key will be admitted.
    pub fn admit(&self, key: u64) -> bool {
        for slot in self.slots.iter() {
            if slot.load(Ordering::Relaxed) == key {
                self.admits.fetch_add(1, Ordering::Relaxed);
                return true;
            }
        }

        let victim = (self.next_random() as usize) % self.slots.len();
        self.slots[victim].store(key, Ordering::Relaxed);
        self.inserts.fetch_add(1, Ordering::Relaxed);
        false
    }

    /// Convenience: admit by (method, entry) pair.
    #[inline]
    pub fn admit_entry(&self, method: MethodId, entry: BytecodeAddr) -> bool {
        self.admit(filter_key(method, entry))
    }

    /// Clear all slots.
    pub fn reset(&self) {
        for slot in self.slots.iter() {
            slot.store(0, Ordering::Relaxed);
        }
    }

    /// (admitted, inserted) counters.
    pub fn counters(&self) -> (u64, u64) {
        (
            self.admits.load(Ordering::Relaxed),
            self.inserts.load(Ordering::Relaxed),
        )
    }

    /// Advance the xorshift replacement RNG. Races lose updates, which is
    /// acceptable for victim selection.
    fn next_random(&self) -> u64 {
        let mut x = self.rng.load(Ordering::Relaxed);
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.rng.store(x, Ordering::Relaxed);
        x
    }
}

// =============================================================================
// Tests
// =============================================================================
