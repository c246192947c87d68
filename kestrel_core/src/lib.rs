//! # Kestrel Core
//!
//! Core types shared across the Kestrel virtual machine components.
//!
//! This crate provides the foundational building blocks used by the JIT
//! compiler and the interpreter glue:
//!
//! - **Identifiers**: lightweight handles for methods, classes, bytecode
//!   addresses and compiled-code addresses
//! - **Error Handling**: the unified error taxonomy and result alias

#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod ids;

pub use error::{JitError, JitResult};
pub use ids::{BytecodeAddr, ClassId, CodeAddr, InstructionSet, MethodId};

/// Kestrel runtime version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
