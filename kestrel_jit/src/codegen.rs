//! The code-generator contract.
//!
//! The JIT core treats compiled code as an opaque blob: a backend is handed
//! a sealed trace description plus a length budget and an abort token, and
//! returns the assembled bytes together with the list of chaining-cell
//! sites to lay down after the code body. Backend selection happens once at
//! startup; the core never dispatches per instruction.

use kestrel_core::{InstructionSet, MethodId};
use thiserror::Error;

use crate::chain::CellKind;
use crate::runtime::compiler_thread::AbortHandle;
use crate::trace::JitTraceDescription;

// =============================================================================
// Request / Result
// =============================================================================

/// A chaining-cell site requested by the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CellSite {
    /// Kind of cell to lay down.
    pub kind: CellKind,
    /// Singleton-invoke callee, when the kind carries one.
    pub callee: Option<MethodId>,
}

impl CellSite {
    /// A plain cell of the given kind.
    #[inline]
    pub const fn of(kind: CellKind) -> Self {
        CellSite { kind, callee: None }
    }

    /// A singleton-invoke cell bound to `callee`.
    #[inline]
    pub const fn singleton(callee: MethodId) -> Self {
        CellSite {
            kind: CellKind::InvokeSingleton,
            callee: Some(callee),
        }
    }
}

/// Everything a backend needs for one compilation.
#[derive(Debug)]
pub struct TranslationRequest<'a> {
    /// The sealed trace description to compile.
    pub trace: &'a JitTraceDescription,
    /// Maximum instruction count the backend may accept; traces longer
    /// than this fail with [`CodegenError::TraceTooLong`].
    pub max_insns: u16,
    /// Cooperative cancellation token; backends should check it at
    /// convenient boundaries and bail with [`CodegenError::Aborted`].
    pub abort: &'a AbortHandle,
}

/// A fully assembled translation, ready for installation.
#[derive(Debug, Clone)]
pub struct Translation {
    /// The opaque code blob.
    pub code: Vec<u8>,
    /// Entry-point offset inside `code`.
    pub entry_offset: usize,
    /// Chaining-cell sites to lay down after the code body.
    pub cells: Vec<CellSite>,
    /// Literal pool words appended after the cells.
    pub literals: Vec<usize>,
    /// Instruction set the blob was assembled for.
    pub isa: InstructionSet,
}

// =============================================================================
// Errors
// =============================================================================

/// Failure modes of a code-generation attempt.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodegenError {
    /// The trace exceeds what the backend can assemble at this length.
    /// Retryable with a shorter length budget.
    #[error("trace too long ({insns} instructions over budget {budget})")]
    TraceTooLong {
        /// Instructions in the offending trace.
        insns: u32,
        /// Budget the request carried.
        budget: u16,
    },

    /// The trace contains an opcode the backend does not support.
    #[error("unsupported opcode {opcode:#04x}")]
    Unsupported {
        /// The offending opcode.
        opcode: u8,
    },

    /// The abort token was raised mid-compilation.
    #[error("compilation aborted")]
    Aborted,

    /// Backend-internal failure.
    #[error("backend error: {0}")]
    Internal(String),
}

impl CodegenError {
    /// Whether retrying with a shorter trace length could succeed.
    #[inline]
    pub const fn is_length_dependent(&self) -> bool {
        matches!(self, CodegenError::TraceTooLong { .. })
    }
}

// =============================================================================
// Generator trait
// =============================================================================

/// A target backend: assembles trace descriptions into code blobs.
pub trait CodeGenerator: Send + Sync {
    /// Instruction set this backend produces.
    fn instruction_set(&self) -> InstructionSet;

    /// Assemble `request.trace` into a translation.
    fn compile(&self, request: &TranslationRequest<'_>) -> Result<Translation, CodegenError>;
}

// =============================================================================
// Stub backend
// =============================================================================

/// Deterministic architecture-neutral backend.
///
/// Emits a fixed byte pattern proportional to the trace length instead of
/// real machine code. Used by the test suite, tooling, and the portable
/// interpreter-only build; the core's installation, chaining, and lookup
/// paths are identical to a real backend's.
#[derive(Debug, Clone)]
pub struct StubGenerator {
    /// Bytes of "code" emitted per trace instruction.
    pub bytes_per_insn: usize,
    /// Cell sites attached to every translation.
    pub cells: Vec<CellSite>,
    /// Literal pool attached to every translation.
    pub literals: Vec<usize>,
    /// Simulated backend length limit, independent of the request budget.
    pub max_ok_insns: Option<u32>,
}

impl Default for StubGenerator {
    fn default() -> Self {
        StubGenerator {
            bytes_per_insn: 8,
            cells: vec![CellSite::of(CellKind::Normal)],
            literals: Vec::new(),
            max_ok_insns: None,
        }
    }
}

impl StubGenerator {
    /// A stub backend with the default shape.
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the cell sites attached to every translation.
    pub fn with_cells(mut self, cells: Vec<CellSite>) -> Self {
        self.cells = cells;
        self
    }

    /// Set the per-instruction code size.
    pub fn with_bytes_per_insn(mut self, bytes: usize) -> Self {
        self.bytes_per_insn = bytes;
        self
    }

    /// Simulate a backend that fails length-dependently above `cap`.
    pub fn with_length_limit(mut self, cap: u32) -> Self {
        self.max_ok_insns = Some(cap);
        self
    }
}

impl CodeGenerator for StubGenerator {
    fn instruction_set(&self) -> InstructionSet {
        InstructionSet::Portable
    }

    fn compile(&self, request: &TranslationRequest<'_>) -> Result<Translation, CodegenError> {
        if request.abort.is_bailed() {
            return Err(CodegenError::Aborted);
        }

        let insns = request.trace.total_insns();
        if insns > u32::from(request.max_insns) {
            return Err(CodegenError::TraceTooLong {
                insns,
                budget: request.max_insns,
            });
        }
        if let Some(cap) = self.max_ok_insns {
            if insns > cap {
                return Err(CodegenError::TraceTooLong {
                    insns,
                    budget: request.max_insns,
                });
            }
        }

        let size = (insns as usize * self.bytes_per_insn).max(1);
        let entry = request.trace.entry().0;
        // Recognizable pattern: each byte mixes the entry address and its
        // position, so tests can assert the blob was copied intact.
        let code = (0..size)
            .map(|i| (entry as u8).wrapping_add(i as u8))
            .collect();

        Ok(Translation {
            code,
            entry_offset: 0,
            cells: self.cells.clone(),
            literals: self.literals.clone(),
            isa: InstructionSet::Portable,
        })
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use kestrel_core::BytecodeAddr;

    fn sealed_trace(insns: usize) -> JitTraceDescription {
        let mut desc = JitTraceDescription::new(BytecodeAddr(0x100));
        desc.open_run(BytecodeAddr(0x100));
        for _ in 1..insns {
            desc.extend_run().unwrap();
        }
        desc.seal().unwrap();
        desc
    }

    #[test]
    fn test_stub_generator_compiles() {
        let generator = StubGenerator::new();
        let trace = sealed_trace(4);
        let abort = AbortHandle::new();

        let translation = generator
            .compile(&TranslationRequest {
                trace: &trace,
                max_insns: 100,
                abort: &abort,
            })
            .unwrap();

        assert_eq!(translation.code.len(), 32);
        assert_eq!(translation.isa, InstructionSet::Portable);
        assert_eq!(translation.cells.len(), 1);
    }

    #[test]
    fn test_stub_generator_respects_budget() {
        let generator = StubGenerator::new();
        let trace = sealed_trace(10);
        let abort = AbortHandle::new();

        let err = generator
            .compile(&TranslationRequest {
                trace: &trace,
                max_insns: 4,
                abort: &abort,
            })
            .unwrap_err();
        assert!(err.is_length_dependent());
    }

    #[test]
    fn test_stub_generator_honors_abort() {
        let generator = StubGenerator::new();
        let trace = sealed_trace(2);
        let abort = AbortHandle::new();
        abort.bail();

        let err = generator
            .compile(&TranslationRequest {
                trace: &trace,
                max_insns: 100,
                abort: &abort,
            })
            .unwrap_err();
        assert_eq!(err, CodegenError::Aborted);
    }

    #[test]
    fn test_length_limit_simulation() {
        let generator = StubGenerator::new().with_length_limit(3);
        let trace = sealed_trace(5);
        let abort = AbortHandle::new();

        let err = generator
            .compile(&TranslationRequest {
                trace: &trace,
                max_insns: 100,
                abort: &abort,
            })
            .unwrap_err();
        assert!(err.is_length_dependent());
    }
}
