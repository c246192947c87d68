//! Predicted chaining: speculative direct dispatch for virtual calls.
//!
//! An `InvokePredicted` cell caches one (receiver class → compiled callee)
//! binding per call site, like a monomorphic inline cache. Compiled code
//! executes the fast path inline: compare the receiver's class against the
//! cell key and branch directly on a match. Everything else funnels into
//! the slow-path [`PredictedChainPatcher::patch`], which resolves races
//! between concurrent callers and applies the five-case rebind protocol:
//!
//! 1. callee not compilable → poison the cell permanently
//! 2. callee not compiled yet → install a retry delay and stay slow
//! 3. uninitialized cell → publish branch/method first, class key last
//! 4. rebind with the method unchanged → hot-swap the class key only
//! 5. rebind to a different (class, method) → stage the class, require it
//!    to recur, then commit under stop-the-world or via the bounded
//!    safepoint-drained patch queue
//!
//! Readers never block: the class key is the publication point, written
//! with release ordering after every dependent field.

use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, Ordering};

use kestrel_core::{BytecodeAddr, ClassId, CodeAddr, JitError, JitResult, MethodId};
use parking_lot::Mutex;
use tracing::debug;

use super::{CLASS_POISON, CLASS_UNINIT, ChainingCell};
use crate::runtime::code_cache::CodeCache;
use crate::runtime::entry_table::JitEntryTable;

// =============================================================================
// Fast path
// =============================================================================

/// Lock-free receiver check, executed at every predicted call site.
///
/// Returns the direct branch target when the cell is bound to `receiver`'s
/// class. The acquire on the key pairs with the patcher's release-store,
/// so a hit always observes the branch published together with the key.
#[inline]
pub fn predict(cell: &ChainingCell, receiver: ClassId) -> Option<CodeAddr> {
    let key = cell.class_word().load(Ordering::Acquire);
    if key != receiver.0 {
        return None;
    }
    match cell.branch_word().load(Ordering::Acquire) {
        0 => None,
        target => Some(CodeAddr(target)),
    }
}

// =============================================================================
// Callee descriptor
// =============================================================================

/// What the interpreter resolved at the call site.
#[derive(Debug, Clone, Copy)]
pub struct CalleeRef {
    /// The resolved method.
    pub method: MethodId,
    /// Bytecode entry address of the method body.
    pub entry: BytecodeAddr,
    /// False for intrinsically native/uncompilable callees.
    pub compilable: bool,
}

/// Outcome of a slow-path patch attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatchOutcome {
    /// Cell bound (or already bound) to the requested target.
    Chained,
    /// Class key hot-swapped; branch and method untouched.
    ClassSwapped,
    /// Cell permanently poisoned; callers stay on the slow path.
    Poisoned,
    /// Callee has no compiled code yet; retry delay installed.
    NotCompiled,
    /// Class staged; the same class must recur before a rebind commits.
    Staged,
    /// Rebind enqueued for the next safepoint drain.
    Queued,
    /// Rebind dropped (patch queue full). Correctness is preserved; the
    /// cell keeps falling back to the slow path.
    Dropped,
}

// =============================================================================
// Patcher options
// =============================================================================

/// Tuning for the predicted-chaining protocol.
#[derive(Debug, Clone)]
pub struct PredictedOptions {
    /// Calls to spend on the slow path before re-attempting a patch when
    /// the callee is not yet compiled.
    pub delay: u32,
    /// Consecutive re-observations of a staged class required before a
    /// rebind commits (at least one repeat).
    pub repeat: u32,
    /// Commit full rebinds via the safepoint-drained queue instead of an
    /// immediate stop-the-world.
    pub defer_repatch: bool,
}

impl Default for PredictedOptions {
    fn default() -> Self {
        PredictedOptions {
            delay: 32,
            repeat: 1,
            defer_repatch: true,
        }
    }
}

// =============================================================================
// Patcher
// =============================================================================

/// Slow-path patch engine for predicted cells.
pub struct PredictedChainPatcher<'a> {
    cache: &'a CodeCache,
    table: &'a JitEntryTable,
    queue: &'a PredictedPatchQueue,
    options: PredictedOptions,
}

impl<'a> PredictedChainPatcher<'a> {
    /// Create a patcher over the given cache, table, and patch queue.
    pub fn new(
        cache: &'a CodeCache,
        table: &'a JitEntryTable,
        queue: &'a PredictedPatchQueue,
        options: PredictedOptions,
    ) -> Self {
        PredictedChainPatcher {
            cache,
            table,
            queue,
            options,
        }
    }

    /// Resolve a fast-path miss: bind, rebind, stage, delay, or poison.
    ///
    /// Writers serialize on the cache lock; the published key stays
    /// consistent for lock-free readers throughout.
    pub fn patch(
        &self,
        cell: &ChainingCell,
        callee: CalleeRef,
        receiver: ClassId,
    ) -> JitResult<PatchOutcome> {
        if !cell.kind().is_predicted() {
            return Err(JitError::Protocol(format!(
                "predicted patch on a {:?} cell",
                cell.kind()
            )));
        }
        debug_assert!(!receiver.is_none());

        // Case 1: the callee can never be compiled. Poison the key so
        // every future call compares-and-misses cheaply. Only the
        // comparison key changes, so no stop-the-world is needed.
        if !callee.compilable {
            let session = self.cache.begin_patch()?;
            cell.class_word().store(CLASS_POISON, Ordering::Release);
            drop(session);
            return Ok(PatchOutcome::Poisoned);
        }

        // Case 2: nothing to chain to yet. Ask the caller to stay on the
        // slow path for a while before trying again.
        let Some(target) = self.table.lookup(callee.entry) else {
            let session = self.cache.begin_patch()?;
            cell.counter_word().store(self.options.delay, Ordering::Release);
            drop(session);
            return Ok(PatchOutcome::NotCompiled);
        };

        let session = self.cache.begin_patch()?;
        let current = cell.class_word().load(Ordering::Acquire);

        // Case 3: first binding. Publish every dependent field before the
        // key; a reader that acquires the key sees a fully-formed cell.
        if current == CLASS_UNINIT {
            cell.branch_word().store(target.0, Ordering::Relaxed);
            cell.method_word().store(callee.method.0, Ordering::Relaxed);
            cell.staged_word().store(0, Ordering::Relaxed);
            cell.counter_word().store(0, Ordering::Relaxed);
            cell.class_word().store(receiver.0, Ordering::Release);
            drop(session);
            self.cache.note_patch();
            return Ok(PatchOutcome::Chained);
        }

        if current == CLASS_POISON {
            return Ok(PatchOutcome::Poisoned);
        }

        let bound_method = cell.method_word().load(Ordering::Acquire);
        if current == receiver.0 && bound_method == callee.method.0 {
            // Lost a race against an identical patch; nothing to do.
            return Ok(PatchOutcome::Chained);
        }

        // Anti-thrash staging: a new receiver class must recur before any
        // rebind commits, so a megamorphic site does not churn the cell.
        let staged = cell.staged_word().load(Ordering::Acquire);
        if staged != receiver.0 {
            cell.staged_word().store(receiver.0, Ordering::Relaxed);
            // The counter doubles as the repeat count while staging; it
            // cannot be serving as a case-2 delay here because the callee
            // is known compiled.
            cell.counter_word().store(0, Ordering::Relaxed);
            return Ok(PatchOutcome::Staged);
        }
        let seen = cell.counter_word().load(Ordering::Relaxed) + 1;
        if seen < self.options.repeat {
            cell.counter_word().store(seen, Ordering::Relaxed);
            return Ok(PatchOutcome::Staged);
        }

        // Case 4: same method, new class. The branch target stays valid,
        // so the key alone is hot-swapped with no stop-the-world.
        if bound_method == callee.method.0 {
            cell.staged_word().store(0, Ordering::Relaxed);
            cell.counter_word().store(0, Ordering::Relaxed);
            cell.class_word().store(receiver.0, Ordering::Release);
            drop(session);
            self.cache.note_patch();
            return Ok(PatchOutcome::ClassSwapped);
        }

        // Case 5: genuinely different (class, method). The triple cannot
        // be updated atomically in place, so commit either at the next
        // safepoint or immediately under a stop-the-world.
        drop(session);
        if self.options.defer_repatch {
            if self.queue.push(cell, receiver, callee.method, target) {
                Ok(PatchOutcome::Queued)
            } else {
                Ok(PatchOutcome::Dropped)
            }
        } else {
            let stopped = self.cache.begin_patch_stopped()?;
            cell.branch_word().store(target.0, Ordering::Relaxed);
            cell.method_word().store(callee.method.0, Ordering::Relaxed);
            cell.staged_word().store(0, Ordering::Relaxed);
            cell.counter_word().store(0, Ordering::Relaxed);
            cell.class_word().store(receiver.0, Ordering::Release);
            drop(stopped);
            self.cache.note_patch();
            Ok(PatchOutcome::Chained)
        }
    }
}

// =============================================================================
// Patch queue
// =============================================================================

/// One deferred rebind.
struct PendingPatch {
    cell: NonNull<ChainingCell>,
    class: ClassId,
    method: MethodId,
    target: CodeAddr,
}

// SAFETY: the cell pointer targets the code-cache region, which outlives
// the queue (both are owned by the runtime and the queue is cleared on
// cache reset); all cell fields are atomics.
unsafe impl Send for PendingPatch {}

/// Bounded queue of deferred predicted-cell rebinds, drained at the next
/// safepoint (typically the next GC pause).
pub struct PredictedPatchQueue {
    pending: Mutex<Vec<PendingPatch>>,
    capacity: usize,
    queued: AtomicU64,
    dropped: AtomicU64,
    applied: AtomicU64,
}

impl PredictedPatchQueue {
    /// Create a queue holding at most `capacity` deferred rebinds.
    pub fn new(capacity: usize) -> Self {
        PredictedPatchQueue {
            pending: Mutex::new(Vec::new()),
            capacity,
            queued: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            applied: AtomicU64::new(0),
        }
    }

    /// Enqueue a rebind. Returns `false` (silently dropping the request)
    /// when the queue is full.
    fn push(
        &self,
        cell: &ChainingCell,
        class: ClassId,
        method: MethodId,
        target: CodeAddr,
    ) -> bool {
        let mut pending = self.pending.lock();
        if pending.len() >= self.capacity {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            return false;
        }
        pending.push(PendingPatch {
            cell: NonNull::from(cell),
            class,
            method,
            target,
        });
        self.queued.fetch_add(1, Ordering::Relaxed);
        true
    }

    /// Number of rebinds waiting.
    pub fn len(&self) -> usize {
        self.pending.lock().len()
    }

    /// Whether no rebinds are waiting.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Apply every pending rebind under one stop-the-world.
    ///
    /// Called from the VM's safepoint (e.g. at a GC pause).
    pub fn drain(&self, cache: &CodeCache) -> JitResult<usize> {
        let mut pending = std::mem::take(&mut *self.pending.lock());
        if pending.is_empty() {
            return Ok(0);
        }

        let session = cache.begin_patch_stopped()?;
        for patch in &pending {
            // SAFETY: see PendingPatch Send rationale; the world is
            // stopped and the cache lock is held.
            let cell = unsafe { patch.cell.as_ref() };
            cell.branch_word().store(patch.target.0, Ordering::Relaxed);
            cell.method_word().store(patch.method.0, Ordering::Relaxed);
            cell.staged_word().store(0, Ordering::Relaxed);
            cell.counter_word().store(0, Ordering::Relaxed);
            cell.class_word().store(patch.class.0, Ordering::Release);
        }
        drop(session);

        let applied = pending.len();
        pending.clear();
        self.applied.fetch_add(applied as u64, Ordering::Relaxed);
        debug!(applied, "drained predicted-chain patch queue");
        Ok(applied)
    }

    /// Discard all pending rebinds (cache reset).
    pub fn clear(&self) {
        self.pending.lock().clear();
    }

    /// (queued, applied, dropped) counters.
    pub fn counters(&self) -> (u64, u64, u64) {
        (
            self.queued.load(Ordering::Relaxed),
            self.applied.load(Ordering::Relaxed),
            self.dropped.load(Ordering::Relaxed),
        )
    }
}

// =============================================================================
// Tests
// =============================================================================
