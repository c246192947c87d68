//! Trace-selection and code-cache management core of the Kestrel JIT.
//!
//! Interpreter threads propose hot bytecode traces, one background
//! compiler thread turns accepted proposals into installed translations,
//! and patchable chaining cells wire translations together so control
//! flows between compiled fragments without reentering the interpreter:
//!
//! - Content-addressed entry table with lock-free lookup
//! - Per-thread trace-selection state machine
//! - Bounded work queue feeding a single compiler thread
//! - Bump-allocated executable code cache with W^X protection
//! - Chaining-cell protocol, including receiver-class-predicted dispatch
//! - Shadow-execution self-verification of compiled traces
//!
//! The bytecode interpreter, the target-specific code generators, and the
//! object model are external collaborators reached through the traits in
//! [`codegen`] and [`verify`].

#![deny(unsafe_op_in_unsafe_fn)]

pub mod chain;
pub mod codegen;
pub mod runtime;
pub mod safepoint;
pub mod trace;
pub mod verify;

pub use chain::predicted::{CalleeRef, PatchOutcome, predict};
pub use chain::{CellKind, ChainingCell};
pub use codegen::{CellSite, CodeGenerator, CodegenError, StubGenerator, Translation};
pub use runtime::{JitConfig, JitRuntime, JitStats, spawn_compiler};
pub use trace::selector::{
    InstructionEvent, OpcodeClass, SelectionState, SelectorAction, TraceSelector,
};
pub use trace::{JitTraceDescription, TraceRun};
pub use verify::{InterpreterBridge, ReplayResult, ShadowSpace};
