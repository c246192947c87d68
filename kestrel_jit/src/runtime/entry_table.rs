//! The JIT entry table: bytecode entry address → compiled-code address.
//!
//! A fixed-size, open-addressed hash table with collision chains threaded
//! through the slot array itself. The table is the hottest structure in
//! the JIT: `lookup` runs before every potential trace entry on every
//! interpreter thread and therefore never takes a lock. Inserts are rare
//! (once per selected trace) and go through a mutex; resizing stops the
//! world and rebuilds.
//!
//! Publication protocol: a slot's `key` is release-stored after all other
//! fields, and `code` is release-stored after the instruction-set tag, so
//! an acquire-loading reader always observes a fully-old or fully-new
//! slot, never a half-written one.

use std::sync::atomic::{AtomicPtr, AtomicU8, AtomicU16, AtomicU64, AtomicUsize, Ordering};

use kestrel_core::{BytecodeAddr, CodeAddr, InstructionSet, JitError, JitResult};
use parking_lot::Mutex;

use crate::safepoint::SafepointCoordinator;

/// Chain terminator stored in a slot's `chain` field.
const CHAIN_END: u16 = u16::MAX;

/// Largest supported table capacity: chain links are 16-bit slot indices
/// and `CHAIN_END` is reserved.
pub const MAX_TABLE_SIZE: usize = 1 << 15;

/// Slot flag: a trace-selection attempt owns this entry.
const FLAG_UNDER_CONSTRUCTION: u8 = 1 << 0;
/// Slot flag: compilation failed persistently; do not retranslate.
const FLAG_NOT_RETRANSLATABLE: u8 = 1 << 1;

// =============================================================================
// Slot
// =============================================================================

/// One entry-table slot.
///
/// `key == 0` means empty. A key transitions from empty to a fixed value
/// exactly once and is cleared only by a full-table reset. `code == 0`
/// means "not compiled"; it is rewritten only by the compiler thread.
#[derive(Debug)]
#[repr(C)]
pub struct JitSlot {
    key: AtomicUsize,
    code: AtomicUsize,
    chain: AtomicU16,
    isa: AtomicU8,
    flags: AtomicU8,
}

impl JitSlot {
    fn empty() -> Self {
        JitSlot {
            key: AtomicUsize::new(0),
            code: AtomicUsize::new(0),
            chain: AtomicU16::new(CHAIN_END),
            isa: AtomicU8::new(InstructionSet::None as u8),
            flags: AtomicU8::new(0),
        }
    }

    /// Reset auxiliary fields, then publish the key.
    fn publish_key(&self, addr: BytecodeAddr) {
        self.code.store(0, Ordering::Relaxed);
        self.isa.store(InstructionSet::None as u8, Ordering::Relaxed);
        self.flags.store(0, Ordering::Relaxed);
        self.key.store(addr.0, Ordering::Release);
    }

    fn wipe(&self) {
        // Clear `code` before `key` so a racing reader that matched the old
        // key sees "not compiled" rather than a dangling address.
        self.code.store(0, Ordering::Release);
        self.isa.store(InstructionSet::None as u8, Ordering::Relaxed);
        self.flags.store(0, Ordering::Relaxed);
        self.chain.store(CHAIN_END, Ordering::Relaxed);
        self.key.store(0, Ordering::Release);
    }
}

// =============================================================================
// Entry Handle
// =============================================================================

/// Borrowed view of one live slot.
///
/// Handles stay valid for the lifetime of the table borrow: retired slot
/// arrays are kept alive until the table is dropped.
#[derive(Clone, Copy)]
pub struct EntryHandle<'t> {
    slot: &'t JitSlot,
}

impl EntryHandle<'_> {
    /// The bytecode entry address this slot is keyed by.
    #[inline]
    pub fn entry_addr(&self) -> BytecodeAddr {
        BytecodeAddr(self.slot.key.load(Ordering::Acquire))
    }

    /// Current compiled-code address, if published.
    #[inline]
    pub fn code(&self) -> Option<CodeAddr> {
        match self.slot.code.load(Ordering::Acquire) {
            0 => None,
            addr => Some(CodeAddr(addr)),
        }
    }

    /// Instruction set of the published translation.
    #[inline]
    pub fn instruction_set(&self) -> InstructionSet {
        InstructionSet::from_u8(self.slot.isa.load(Ordering::Acquire))
    }

    /// Publish a compiled-code address. Compiler thread only.
    ///
    /// The instruction-set tag is written first; the address is
    /// release-stored last so concurrent lookups see a consistent pair.
    pub fn set_code_address(&self, code: CodeAddr, isa: InstructionSet) {
        debug_assert!(!code.is_none());
        self.slot.isa.store(isa as u8, Ordering::Relaxed);
        self.slot.code.store(code.0, Ordering::Release);
    }

    /// Reset the slot to the "not compiled" sentinel (aborted compile).
    pub fn clear_code(&self) {
        self.slot.code.store(0, Ordering::Release);
    }

    /// Atomically claim this entry for trace construction.
    ///
    /// Returns `false` when another selection attempt already owns it.
    #[inline]
    pub fn try_begin_construction(&self) -> bool {
        let prev = self
            .slot
            .flags
            .fetch_or(FLAG_UNDER_CONSTRUCTION, Ordering::AcqRel);
        prev & FLAG_UNDER_CONSTRUCTION == 0
    }

    /// Release the construction claim.
    #[inline]
    pub fn end_construction(&self) {
        self.slot
            .flags
            .fetch_and(!FLAG_UNDER_CONSTRUCTION, Ordering::AcqRel);
    }

    /// Whether a selection attempt currently owns this entry.
    #[inline]
    pub fn under_construction(&self) -> bool {
        self.slot.flags.load(Ordering::Acquire) & FLAG_UNDER_CONSTRUCTION != 0
    }

    /// Mark this entry as permanently failed for the session.
    pub fn mark_not_retranslatable(&self) {
        self.slot
            .flags
            .fetch_or(FLAG_NOT_RETRANSLATABLE, Ordering::AcqRel);
    }

    /// Whether compilation for this entry has been given up on.
    #[inline]
    pub fn is_not_retranslatable(&self) -> bool {
        self.slot.flags.load(Ordering::Acquire) & FLAG_NOT_RETRANSLATABLE != 0
    }
}

// =============================================================================
// Slot Array
// =============================================================================

struct SlotArray {
    slots: Box<[JitSlot]>,
    mask: usize,
}

impl SlotArray {
    fn new(capacity: usize) -> Box<SlotArray> {
        debug_assert!(capacity.is_power_of_two());
        let slots: Box<[JitSlot]> = (0..capacity).map(|_| JitSlot::empty()).collect();
        Box::new(SlotArray {
            slots,
            mask: capacity - 1,
        })
    }

    #[inline]
    fn bucket(&self, addr: BytecodeAddr) -> usize {
        let a = addr.0;
        ((a >> 12) ^ (a >> 2)) & self.mask
    }
}

// =============================================================================
// Entry Table
// =============================================================================

/// The content-addressed table mapping bytecode entry points to compiled
/// code.
pub struct JitEntryTable {
    /// The live slot array. Swapped only under stop-the-world by `resize`.
    current: AtomicPtr<SlotArray>,
    /// Serializes inserts and resizes.
    insert_lock: Mutex<()>,
    /// Replaced slot arrays, kept alive so readers that raced past a
    /// resize never touch freed memory. Freed on drop.
    retired: Mutex<Vec<*mut SlotArray>>,
    /// Live entry count.
    entries: AtomicUsize,
    /// Lookup hit counter.
    hits: AtomicU64,
    /// Lookup miss counter.
    misses: AtomicU64,
}

impl JitEntryTable {
    /// Create a table with `capacity` slots (power of two, clamped to
    /// [`MAX_TABLE_SIZE`]).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.next_power_of_two().clamp(2, MAX_TABLE_SIZE);
        JitEntryTable {
            current: AtomicPtr::new(Box::into_raw(SlotArray::new(capacity))),
            insert_lock: Mutex::new(()),
            retired: Mutex::new(Vec::new()),
            entries: AtomicUsize::new(0),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    #[inline]
    fn array(&self) -> &SlotArray {
        // SAFETY: the pointer is always a live SlotArray; replaced arrays
        // are retired, not freed, until the table itself drops.
        unsafe { &*self.current.load(Ordering::Acquire) }
    }

    /// Number of slots in the live array.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.array().slots.len()
    }

    /// Number of occupied slots.
    #[inline]
    pub fn entry_count(&self) -> usize {
        self.entries.load(Ordering::Relaxed)
    }

    /// Look up the compiled-code address for a bytecode entry.
    ///
    /// Lock-free; safe to call from any thread at any time. This is the
    /// hot path executed before every potential trace entry.
    pub fn lookup(&self, addr: BytecodeAddr) -> Option<CodeAddr> {
        debug_assert!(!addr.is_none());
        let arr = self.array();
        let mut idx = arr.bucket(addr);

        loop {
            let slot = &arr.slots[idx];
            if slot.key.load(Ordering::Acquire) == addr.0 {
                return match slot.code.load(Ordering::Acquire) {
                    0 => {
                        self.misses.fetch_add(1, Ordering::Relaxed);
                        None
                    }
                    code => {
                        self.hits.fetch_add(1, Ordering::Relaxed);
                        Some(CodeAddr(code))
                    }
                };
            }
            let next = slot.chain.load(Ordering::Acquire);
            if next == CHAIN_END {
                self.misses.fetch_add(1, Ordering::Relaxed);
                return None;
            }
            idx = next as usize;
        }
    }

    /// Find the slot for `addr`, without creating one. Lock-free.
    pub fn find(&self, addr: BytecodeAddr) -> Option<EntryHandle<'_>> {
        debug_assert!(!addr.is_none());
        let arr = self.array();
        let mut idx = arr.bucket(addr);

        loop {
            let slot = &arr.slots[idx];
            if slot.key.load(Ordering::Acquire) == addr.0 {
                return Some(EntryHandle { slot });
            }
            let next = slot.chain.load(Ordering::Acquire);
            if next == CHAIN_END {
                return None;
            }
            idx = next as usize;
        }
    }

    /// Find the slot for `addr`, creating one if absent.
    ///
    /// Returns `None` when the table is full; the caller must abandon the
    /// current trace-selection attempt, not crash.
    pub fn find_or_create(&self, addr: BytecodeAddr) -> Option<EntryHandle<'_>> {
        debug_assert!(!addr.is_none());
        let _guard = self.insert_lock.lock();
        let arr = self.array();
        let head = arr.bucket(addr);

        // Walk the chain: return an existing slot, or claim the natural
        // slot, or remember the tail to link a new overflow slot from.
        let mut idx = head;
        let tail = loop {
            let slot = &arr.slots[idx];
            let key = slot.key.load(Ordering::Relaxed);
            if key == addr.0 {
                return Some(EntryHandle { slot });
            }
            if key == 0 && idx == head {
                slot.publish_key(addr);
                self.entries.fetch_add(1, Ordering::Relaxed);
                return Some(EntryHandle { slot });
            }
            let next = slot.chain.load(Ordering::Relaxed);
            if next == CHAIN_END {
                break idx;
            }
            idx = next as usize;
        };

        // Claim a free overflow slot, scanning from the top of the table
        // to stay clear of low natural-slot indices for as long as
        // possible.
        let free = (0..arr.slots.len())
            .rev()
            .find(|&i| i != head && arr.slots[i].key.load(Ordering::Relaxed) == 0)?;

        let slot = &arr.slots[free];
        slot.publish_key(addr);
        // Link after the key is visible so chain-walking readers never
        // land on an unpublished slot.
        arr.slots[tail].chain.store(free as u16, Ordering::Release);
        self.entries.fetch_add(1, Ordering::Relaxed);
        Some(EntryHandle { slot })
    }

    /// Rebuild the table at `new_capacity`, preserving live entries.
    ///
    /// Compiler thread only (single resizer by construction). Stops the
    /// world for the swap; the old array is retired, not freed, to keep
    /// racing readers safe.
    pub fn resize(
        &self,
        new_capacity: usize,
        safepoints: &SafepointCoordinator,
    ) -> JitResult<()> {
        let new_capacity = new_capacity.next_power_of_two().clamp(2, MAX_TABLE_SIZE);
        // World first, lock second: a thread blocked on the insert lock
        // cannot reach a safepoint, so taking the lock first could
        // deadlock the stop.
        let _world = safepoints.stop_the_world();
        let _guard = self.insert_lock.lock();

        let old = self.array();
        let new = SlotArray::new(new_capacity);

        for slot in old.slots.iter() {
            let key = slot.key.load(Ordering::Relaxed);
            if key == 0 {
                continue;
            }
            let dest = Self::rehash_into(&new, BytecodeAddr(key)).ok_or(
                JitError::EntryTableFull {
                    capacity: new_capacity,
                },
            )?;
            dest.code
                .store(slot.code.load(Ordering::Relaxed), Ordering::Relaxed);
            dest.isa
                .store(slot.isa.load(Ordering::Relaxed), Ordering::Relaxed);
            dest.flags
                .store(slot.flags.load(Ordering::Relaxed), Ordering::Relaxed);
        }

        let old_ptr = self.current.swap(Box::into_raw(new), Ordering::AcqRel);
        self.retired.lock().push(old_ptr);
        Ok(())
    }

    /// Insert `addr` into a fresh array during resize. Single-threaded
    /// (world is stopped); returns the claimed slot.
    fn rehash_into(arr: &SlotArray, addr: BytecodeAddr) -> Option<&JitSlot> {
        let head = arr.bucket(addr);
        let mut idx = head;
        let tail = loop {
            let slot = &arr.slots[idx];
            if slot.key.load(Ordering::Relaxed) == 0 && idx == head {
                slot.key.store(addr.0, Ordering::Relaxed);
                return Some(slot);
            }
            let next = slot.chain.load(Ordering::Relaxed);
            if next == CHAIN_END {
                break idx;
            }
            idx = next as usize;
        };

        let free = (0..arr.slots.len())
            .rev()
            .find(|&i| i != head && arr.slots[i].key.load(Ordering::Relaxed) == 0)?;
        arr.slots[free].key.store(addr.0, Ordering::Relaxed);
        arr.slots[tail].chain.store(free as u16, Ordering::Relaxed);
        Some(&arr.slots[free])
    }

    /// Wipe every slot, including keys.
    ///
    /// Used when the code cache is invalidated; callers hold a
    /// stop-the-world (compiled addresses become dangling the moment the
    /// cache resets).
    pub fn reset(&self) {
        let _guard = self.insert_lock.lock();
        for slot in self.array().slots.iter() {
            slot.wipe();
        }
        self.entries.store(0, Ordering::Relaxed);
    }

    /// Snapshot of lookup statistics.
    pub fn stats(&self) -> EntryTableStats {
        EntryTableStats {
            entries: self.entries.load(Ordering::Relaxed),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }

    /// Visit every occupied slot.
    pub fn for_each_entry(&self, mut f: impl FnMut(EntryHandle<'_>)) {
        let arr = self.array();
        for slot in arr.slots.iter() {
            if slot.key.load(Ordering::Acquire) != 0 {
                f(EntryHandle { slot });
            }
        }
    }
}

impl Drop for JitEntryTable {
    fn drop(&mut self) {
        // SAFETY: both the live array and every retired array came from
        // Box::into_raw and are dropped exactly once here.
        unsafe {
            drop(Box::from_raw(self.current.load(Ordering::Acquire)));
            for ptr in self.retired.lock().drain(..) {
                drop(Box::from_raw(ptr));
            }
        }
    }
}

// SAFETY: all slot state is atomic; the raw pointers are only created from
// owned boxes and freed once in drop.
unsafe impl Send for JitEntryTable {}
unsafe impl Sync for JitEntryTable {}

// =============================================================================
// Statistics
// =============================================================================

/// Snapshot of entry-table statistics.
#[derive(Debug, Clone, Copy, Default)]
pub struct EntryTableStats {
    /// Occupied slots.
    pub entries: usize,
    /// Lookups that returned a compiled address.
    pub hits: u64,
    /// Lookups that returned "not compiled".
    pub misses: u64,
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    fn addr(a: usize) -> BytecodeAddr {
        BytecodeAddr(a)
    }

    /// Addresses of the form 0x4 + k * 0x10000 all share bucket 1 in a
    /// 16-slot table, forcing collision chains.
    fn colliding(k: usize) -> BytecodeAddr {
        BytecodeAddr(0x4 + k * 0x10000)
    }

    #[test]
    fn test_lookup_empty() {
        let table = JitEntryTable::new(16);
        assert!(table.lookup(addr(0x100)).is_none());
        assert_eq!(table.stats().misses, 1);
    }

    #[test]
    fn test_find_or_create_then_publish() {
        let table = JitEntryTable::new(16);
        let entry = table.find_or_create(addr(0x100)).unwrap();
        assert_eq!(entry.entry_addr(), addr(0x100));
        assert!(entry.code().is_none());

        // Not yet compiled: lookup still misses.
        assert!(table.lookup(addr(0x100)).is_none());

        entry.set_code_address(CodeAddr(0xBEEF0), InstructionSet::Portable);
        assert_eq!(table.lookup(addr(0x100)), Some(CodeAddr(0xBEEF0)));
        assert_eq!(entry.instruction_set(), InstructionSet::Portable);
    }

    #[test]
    fn test_lookup_idempotent() {
        let table = JitEntryTable::new(16);
        let entry = table.find_or_create(addr(0x200)).unwrap();
        entry.set_code_address(CodeAddr(0x1000), InstructionSet::Portable);

        for _ in 0..100 {
            assert_eq!(table.lookup(addr(0x200)), Some(CodeAddr(0x1000)));
        }
    }

    #[test]
    fn test_find_or_create_is_idempotent() {
        let table = JitEntryTable::new(16);
        table.find_or_create(addr(0x100)).unwrap();
        table.find_or_create(addr(0x100)).unwrap();
        assert_eq!(table.entry_count(), 1);
    }

    #[test]
    fn test_collision_chains() {
        let table = JitEntryTable::new(16);
        for k in 0..6 {
            let entry = table.find_or_create(colliding(k)).unwrap();
            entry.set_code_address(CodeAddr(0x1000 + k), InstructionSet::Portable);
        }
        for k in 0..6 {
            assert_eq!(table.lookup(colliding(k)), Some(CodeAddr(0x1000 + k)));
        }
        assert_eq!(table.entry_count(), 6);
        // A non-inserted member of the same bucket misses through the chain.
        assert!(table.lookup(colliding(9)).is_none());
    }

    #[test]
    fn test_table_full_returns_none() {
        let table = JitEntryTable::new(4);
        let mut created = 0;
        for k in 1..=16 {
            if table.find_or_create(addr(k * 8)).is_some() {
                created += 1;
            }
        }
        assert!(created >= 3);
        assert!(created <= 4);
        // Table saturated: a fresh address cannot be created.
        assert!(table.find_or_create(addr(0xABC0)).is_none());
        // Existing entries still resolve.
        assert!(table.find(addr(8)).is_some());
    }

    #[test]
    fn test_under_construction_claim() {
        let table = JitEntryTable::new(16);
        let entry = table.find_or_create(addr(0x300)).unwrap();

        assert!(entry.try_begin_construction());
        assert!(!entry.try_begin_construction());
        assert!(entry.under_construction());

        entry.end_construction();
        assert!(!entry.under_construction());
        assert!(entry.try_begin_construction());
    }

    #[test]
    fn test_construction_claim_race_exactly_one_winner() {
        for _ in 0..20 {
            let table = Arc::new(JitEntryTable::new(64));
            table.find_or_create(addr(0x500)).unwrap();

            let mut handles = vec![];
            for _ in 0..8 {
                let t = Arc::clone(&table);
                handles.push(thread::spawn(move || {
                    let entry = t.find(addr(0x500)).unwrap();
                    entry.try_begin_construction()
                }));
            }

            let winners = handles
                .into_iter()
                .map(|h| h.join().unwrap())
                .filter(|&won| won)
                .count();
            assert_eq!(winners, 1);
        }
    }

    #[test]
    fn test_not_retranslatable_flag() {
        let table = JitEntryTable::new(16);
        let entry = table.find_or_create(addr(0x700)).unwrap();
        assert!(!entry.is_not_retranslatable());
        entry.mark_not_retranslatable();
        assert!(entry.is_not_retranslatable());
    }

    #[test]
    fn test_clear_code_restores_sentinel() {
        let table = JitEntryTable::new(16);
        let entry = table.find_or_create(addr(0x100)).unwrap();
        entry.set_code_address(CodeAddr(0x9000), InstructionSet::Portable);
        assert!(table.lookup(addr(0x100)).is_some());

        entry.clear_code();
        assert!(table.lookup(addr(0x100)).is_none());
    }

    #[test]
    fn test_reset_wipes_everything() {
        let table = JitEntryTable::new(16);
        for k in 0..4 {
            let entry = table.find_or_create(colliding(k)).unwrap();
            entry.set_code_address(CodeAddr(0x1000 + k), InstructionSet::Portable);
        }

        table.reset();

        assert_eq!(table.entry_count(), 0);
        for k in 0..4 {
            assert!(table.lookup(colliding(k)).is_none());
            assert!(table.find(colliding(k)).is_none());
        }
    }

    #[test]
    fn test_resize_preserves_entries() {
        let table = JitEntryTable::new(8);
        let safepoints = SafepointCoordinator::new();

        for k in 0..5 {
            let entry = table.find_or_create(colliding(k)).unwrap();
            entry.set_code_address(CodeAddr(0x2000 + k), InstructionSet::Portable);
        }

        table.resize(64, &safepoints).unwrap();

        assert_eq!(table.capacity(), 64);
        for k in 0..5 {
            assert_eq!(table.lookup(colliding(k)), Some(CodeAddr(0x2000 + k)));
        }

        // Table keeps accepting inserts after the swap.
        assert!(table.find_or_create(addr(0x8888)).is_some());
    }

    #[test]
    fn test_concurrent_lookups_during_inserts() {
        let table = Arc::new(JitEntryTable::new(256));

        let reader_table = Arc::clone(&table);
        let reader = thread::spawn(move || {
            for _ in 0..10_000 {
                // Must never observe a torn slot: either miss or a valid
                // published address.
                if let Some(code) = reader_table.lookup(addr(0x4004)) {
                    assert_eq!(code, CodeAddr(0xC0DE));
                }
            }
        });

        let writer_table = Arc::clone(&table);
        let writer = thread::spawn(move || {
            for k in 1..200 {
                writer_table.find_or_create(addr(k * 4)).unwrap();
            }
            let entry = writer_table.find_or_create(addr(0x4004)).unwrap();
            entry.set_code_address(CodeAddr(0xC0DE), InstructionSet::Portable);
        });

        reader.join().unwrap();
        writer.join().unwrap();
        assert_eq!(table.lookup(addr(0x4004)), Some(CodeAddr(0xC0DE)));
    }
}
