//! Chaining cells: patchable stubs wiring compiled traces together.
//!
//! Every installed translation ends in one or more chaining cells. A cell
//! starts out "unchained", meaning control transferring through it
//! reenters the interpreter, and can later be patched to branch to another
//! compiled translation, so hot paths never leave native code.
//!
//! Five kinds exist. Four of them (`Normal`, `Hot`, `InvokeSingleton`,
//! `BackwardBranch`) hold a single branch word. `InvokePredicted` cells
//! additionally carry a receiver-class key, the bound method, a staged
//! class for thrash avoidance, and a delay counter; their protocol lives
//! in [`predicted`].
//!
//! Cells are laid down inside the code cache by `install` and mutated only
//! through the cache's patch sessions (lock held, region writable). The
//! fields are atomics because the predicted fast path reads them without
//! any lock from every call site.

pub mod predicted;

use std::sync::atomic::{AtomicU8, AtomicU32, AtomicUsize, Ordering};

use kestrel_core::{ClassId, CodeAddr, MethodId};

/// Branch word sentinel: control reenters the interpreter.
pub const INTERPRETER_REENTRY: usize = 0;

/// Predicted-cell class key sentinel: cell not yet initialized.
pub const CLASS_UNINIT: usize = 0;

/// Predicted-cell class key sentinel: cell permanently poisoned. Never
/// equal to a real class, so every call falls through to the slow path.
pub const CLASS_POISON: usize = usize::MAX;

// =============================================================================
// Cell Kind
// =============================================================================

/// The five chaining-cell kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum CellKind {
    /// Fall-through exit to the next bytecode address.
    Normal = 0,
    /// Exit on a trace-to-trace transition considered hot.
    Hot = 1,
    /// Invoke of a statically-bound (singleton) callee.
    InvokeSingleton = 2,
    /// Invoke of a virtual/interface callee, keyed on the receiver class.
    InvokePredicted = 3,
    /// Loop back-edge exit.
    BackwardBranch = 4,
}

impl CellKind {
    /// Convert from the raw tag stored in a cell.
    #[inline]
    pub const fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::Hot,
            2 => Self::InvokeSingleton,
            3 => Self::InvokePredicted,
            4 => Self::BackwardBranch,
            _ => Self::Normal,
        }
    }

    /// Whether this kind carries the predicted-chaining fields.
    #[inline]
    pub const fn is_predicted(self) -> bool {
        matches!(self, Self::InvokePredicted)
    }
}

// =============================================================================
// Chaining Cell
// =============================================================================

/// Size of one cell as laid out in the code cache.
pub const CELL_BYTES: usize = std::mem::size_of::<ChainingCell>();

/// A fixed-size, alignment-constrained stub inside the code cache.
///
/// One layout serves all five kinds; the predicted-only fields stay at
/// their initialization values for the other four. The `class` key of a
/// predicted cell is the publication point: it is release-stored last by
/// writers, so any reader that acquires a non-sentinel class observes the
/// branch and method published together with it.
#[derive(Debug)]
#[repr(C, align(16))]
pub struct ChainingCell {
    branch: AtomicUsize,
    class: AtomicUsize,
    method: AtomicUsize,
    staged_class: AtomicUsize,
    counter: AtomicU32,
    kind: AtomicU8,
}

impl ChainingCell {
    /// Initialize a freshly allocated cell to its unchained state.
    ///
    /// Called during installation while the region is writable; the cell
    /// is not visible to other threads until install publishes it.
    pub(crate) fn init(&self, kind: CellKind, singleton_callee: Option<MethodId>) {
        self.kind.store(kind as u8, Ordering::Relaxed);
        self.branch.store(INTERPRETER_REENTRY, Ordering::Relaxed);
        self.class.store(CLASS_UNINIT, Ordering::Relaxed);
        self.method
            .store(singleton_callee.map_or(0, |m| m.0), Ordering::Relaxed);
        self.staged_class.store(0, Ordering::Relaxed);
        self.counter.store(0, Ordering::Release);
    }

    /// The cell's kind.
    #[inline]
    pub fn kind(&self) -> CellKind {
        CellKind::from_u8(self.kind.load(Ordering::Relaxed))
    }

    /// Current branch target, or `None` when unchained.
    #[inline]
    pub fn branch_target(&self) -> Option<CodeAddr> {
        match self.branch.load(Ordering::Acquire) {
            INTERPRETER_REENTRY => None,
            target => Some(CodeAddr(target)),
        }
    }

    /// Whether the cell currently reenters the interpreter.
    #[inline]
    pub fn is_unchained(&self) -> bool {
        self.branch.load(Ordering::Acquire) == INTERPRETER_REENTRY
    }

    /// Singleton-invoke callee, when one was recorded at install.
    #[inline]
    pub fn singleton_callee(&self) -> Option<MethodId> {
        match self.method.load(Ordering::Acquire) {
            0 => None,
            m => Some(MethodId(m)),
        }
    }

    /// Receiver class a predicted cell is currently bound to.
    #[inline]
    pub fn observed_class(&self) -> Option<ClassId> {
        match self.class.load(Ordering::Acquire) {
            CLASS_UNINIT | CLASS_POISON => None,
            c => Some(ClassId(c)),
        }
    }

    /// Whether a predicted cell has been permanently poisoned.
    #[inline]
    pub fn is_poisoned(&self) -> bool {
        self.class.load(Ordering::Acquire) == CLASS_POISON
    }

    /// Rewrite the branch to jump directly to compiled code.
    ///
    /// Callers hold the cache's patch session (lock + writable region).
    pub(crate) fn set_branch(&self, target: CodeAddr) {
        debug_assert!(!target.is_none());
        self.branch.store(target.0, Ordering::Release);
    }

    /// Revert the cell to its interpreter-reentry state.
    ///
    /// For predicted cells the class key is invalidated first, so the
    /// lock-free fast path starts missing before the rest of the state is
    /// torn down; `rechain_delay` throttles how eagerly the slow path may
    /// rebind the cell.
    pub(crate) fn unchain(&self, rechain_delay: u32) {
        if self.kind().is_predicted() {
            self.class.store(CLASS_UNINIT, Ordering::Release);
            self.method.store(0, Ordering::Relaxed);
            self.staged_class.store(0, Ordering::Relaxed);
            self.counter.store(rechain_delay, Ordering::Relaxed);
        }
        self.branch.store(INTERPRETER_REENTRY, Ordering::Release);
    }

    // Field access for the predicted-chaining protocol (same module tree).

    #[inline]
    pub(crate) fn class_word(&self) -> &AtomicUsize {
        &self.class
    }

    #[inline]
    pub(crate) fn method_word(&self) -> &AtomicUsize {
        &self.method
    }

    #[inline]
    pub(crate) fn staged_word(&self) -> &AtomicUsize {
        &self.staged_class
    }

    #[inline]
    pub(crate) fn branch_word(&self) -> &AtomicUsize {
        &self.branch
    }

    #[inline]
    pub(crate) fn counter_word(&self) -> &AtomicU32 {
        &self.counter
    }
}

// =============================================================================
// Tests
// =============================================================================
