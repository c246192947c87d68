//! Error types and result definitions for the Kestrel JIT core.
//!
//! The error taxonomy mirrors how failures propagate through the JIT:
//! - Capacity errors (table/cache/queue full) are non-fatal; the affected
//!   request is dropped and execution continues interpreted.
//! - Compilation errors abandon a single translation attempt.
//! - Verification errors are fatal correctness failures of the compiler
//!   and are surfaced loudly rather than recovered.
//! - Protocol errors indicate internal-logic bugs (invariant violations).

use thiserror::Error;

/// The unified result type used throughout the JIT core.
pub type JitResult<T> = Result<T, JitError>;

/// Comprehensive error type covering all JIT-core error conditions.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum JitError {
    /// The code cache cannot hold the requested translation.
    ///
    /// Sticky: once raised, all further compile requests are dropped until
    /// the cache is explicitly reset.
    #[error("code cache full: {requested} bytes requested, {available} of {capacity} available")]
    CodeCacheFull {
        /// Bytes requested by the failed allocation.
        requested: usize,
        /// Bytes still unused when the request was made.
        available: usize,
        /// Total cache capacity in bytes.
        capacity: usize,
    },

    /// The entry table has no free slot for a new trace entry.
    #[error("JIT entry table full ({capacity} slots)")]
    EntryTableFull {
        /// Number of slots in the table.
        capacity: usize,
    },

    /// The compiler work queue rejected a submission.
    #[error("compiler work queue full ({capacity} orders)")]
    QueueFull {
        /// Maximum number of queued orders.
        capacity: usize,
    },

    /// The predicted-chaining patch queue rejected a request.
    #[error("predicted-chain patch queue full")]
    PatchQueueFull,

    /// Code generation failed for a trace.
    #[error("compilation failed at {entry:#x}: {message}")]
    Compilation {
        /// Bytecode entry address of the failed trace.
        entry: usize,
        /// Human-readable failure description.
        message: String,
    },

    /// Self-verification detected a divergence between compiled code and
    /// the interpreter. Fatal: indicates a compiler bug.
    #[error("self-verification divergence: {detail}")]
    Verification {
        /// Description of the first observed mismatch.
        detail: String,
    },

    /// A chaining/patching invariant was violated.
    #[error("chaining protocol violation: {0}")]
    Protocol(String),

    /// Executable memory could not be allocated or reprotected.
    #[error("executable memory error: {0}")]
    Memory(String),
}

impl JitError {
    /// Whether this error is a capacity condition the runtime absorbs by
    /// continuing to interpret.
    #[inline]
    #[must_use]
    pub const fn is_capacity(&self) -> bool {
        matches!(
            self,
            JitError::CodeCacheFull { .. }
                | JitError::EntryTableFull { .. }
                | JitError::QueueFull { .. }
                | JitError::PatchQueueFull
        )
    }

    /// Whether this error must halt forward progress.
    #[inline]
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(self, JitError::Verification { .. })
    }
}

// =============================================================================
// Tests
// =============================================================================
