//! Self-verification: shadow re-execution of compiled traces.
//!
//! In self-verification mode a compiled trace's execution is checked
//! against the interpreter. On entry the live register/frame state is
//! captured into a [`ShadowSpace`]; the compiled code's memory writes are
//! logged as (address, value) observations. On exit the same bytecode
//! range is re-run through an [`InterpreterBridge`] against the shadow
//! copy and three things are compared: final register/frame bytes, the
//! write logs, and the control-flow endpoint.
//!
//! A mismatch is a fatal correctness failure of the compiler. It is
//! reported loudly (diagnostic dump) and, in the production
//! configuration, the thread parks in a spin loop so the state can be
//! inspected. It is never silently ignored.

use kestrel_core::{BytecodeAddr, JitError, JitResult};
use tracing::error;

// =============================================================================
// Options
// =============================================================================

/// Tuning for shadow verification.
#[derive(Debug, Clone)]
pub struct VerifyOptions {
    /// Replay budget; a replay that exhausts it counts as divergence.
    pub max_insns: u32,
    /// Capacity of the shadow write log; overflow counts as divergence.
    pub log_capacity: usize,
    /// Park the thread after reporting a divergence (production default)
    /// instead of returning the error to the caller.
    pub halt_on_divergence: bool,
}

impl Default for VerifyOptions {
    fn default() -> Self {
        VerifyOptions {
            max_insns: 4096,
            log_capacity: 1024,
            halt_on_divergence: true,
        }
    }
}

impl VerifyOptions {
    /// Small limits, divergences surfaced as errors.
    pub fn for_testing() -> Self {
        VerifyOptions {
            max_insns: 256,
            log_capacity: 64,
            halt_on_divergence: false,
        }
    }
}

// =============================================================================
// Interpreter bridge
// =============================================================================

/// Result of re-running a bytecode range in the interpreter.
#[derive(Debug, Clone)]
pub struct ReplayResult {
    /// Bytecode address the replay stopped at.
    pub end: BytecodeAddr,
    /// Instructions executed.
    pub insn_count: u32,
    /// Memory writes performed, in order.
    pub writes: Vec<(usize, u64)>,
}

/// Cooperative re-execution capability supplied by the interpreter.
pub trait InterpreterBridge {
    /// Re-run bytecode starting at `start` against the given register and
    /// frame copies, stopping at a trace boundary or after `max_insns`
    /// instructions.
    fn replay(
        &self,
        start: BytecodeAddr,
        regs: &mut [u64],
        frame: &mut [u8],
        max_insns: u32,
    ) -> ReplayResult;
}

// =============================================================================
// Shadow space
// =============================================================================

/// State tag of a shadow space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShadowState {
    /// Captured and recording compiled-side writes.
    Active,
    /// Comparison in progress.
    Comparing,
    /// Verification finished.
    Inactive,
}

/// Per-execution-context scratch copy taken at trace entry.
#[derive(Debug)]
pub struct ShadowSpace {
    state: ShadowState,
    start: BytecodeAddr,
    regs: Box<[u64]>,
    frame: Box<[u8]>,
    writes: Vec<(usize, u64)>,
    overflowed: bool,
    options: VerifyOptions,
}

impl ShadowSpace {
    /// Capture the live state at entry to a shadowed trace.
    pub fn enter(
        start: BytecodeAddr,
        regs: &[u64],
        frame: &[u8],
        options: VerifyOptions,
    ) -> Self {
        ShadowSpace {
            state: ShadowState::Active,
            start,
            regs: regs.into(),
            frame: frame.into(),
            writes: Vec::new(),
            overflowed: false,
            options,
        }
    }

    /// Current state tag.
    #[inline]
    pub fn state(&self) -> ShadowState {
        self.state
    }

    /// Entry address of the shadowed trace.
    #[inline]
    pub fn start(&self) -> BytecodeAddr {
        self.start
    }

    /// Record one memory write performed by the compiled code.
    pub fn log_write(&mut self, addr: usize, value: u64) {
        debug_assert_eq!(self.state, ShadowState::Active);
        if self.writes.len() >= self.options.log_capacity {
            self.overflowed = true;
            return;
        }
        self.writes.push((addr, value));
    }

    /// Number of logged writes.
    #[inline]
    pub fn logged_writes(&self) -> usize {
        self.writes.len()
    }

    /// Compare the compiled execution against an interpreted replay.
    ///
    /// `live_regs`/`live_frame` are the state left behind by the compiled
    /// code; `end` is where it claims control left the trace. Any
    /// mismatch is fatal.
    pub fn exit(
        &mut self,
        live_regs: &[u64],
        live_frame: &[u8],
        end: BytecodeAddr,
        interpreter: &dyn InterpreterBridge,
    ) -> JitResult<()> {
        self.state = ShadowState::Comparing;

        let divergence = self.compare(live_regs, live_frame, end, interpreter);
        match divergence {
            None => {
                self.state = ShadowState::Inactive;
                Ok(())
            }
            Some(detail) => {
                error!(
                    start = %self.start,
                    end = %end,
                    logged_writes = self.writes.len(),
                    regs = self.regs.len(),
                    %detail,
                    "self-verification divergence: compiled code disagrees with the interpreter"
                );
                if self.options.halt_on_divergence {
                    halt_for_inspection();
                }
                Err(JitError::Verification { detail })
            }
        }
    }

    fn compare(
        &self,
        live_regs: &[u64],
        live_frame: &[u8],
        end: BytecodeAddr,
        interpreter: &dyn InterpreterBridge,
    ) -> Option<String> {
        if self.overflowed {
            return Some(format!(
                "shadow write log overflowed ({} entries)",
                self.options.log_capacity
            ));
        }

        let mut regs = self.regs.clone();
        let mut frame = self.frame.clone();
        let replay = interpreter.replay(self.start, &mut regs, &mut frame, self.options.max_insns);

        if replay.insn_count >= self.options.max_insns {
            return Some(format!(
                "interpreter replay exhausted its {}-instruction budget",
                self.options.max_insns
            ));
        }
        if replay.end != end {
            return Some(format!(
                "control-flow endpoint mismatch: compiled exited at {end}, interpreter at {}",
                replay.end
            ));
        }
        if regs.len() != live_regs.len() {
            return Some("register file sizes differ".into());
        }
        for (i, (shadow, live)) in regs.iter().zip(live_regs).enumerate() {
            if shadow != live {
                return Some(format!(
                    "register v{i} mismatch: interpreter {shadow:#x}, compiled {live:#x}"
                ));
            }
        }
        if frame.as_ref() != live_frame {
            return Some("frame contents mismatch".into());
        }
        if replay.writes.len() != self.writes.len() {
            return Some(format!(
                "memory write count mismatch: compiled performed {}, interpreter {}",
                self.writes.len(),
                replay.writes.len()
            ));
        }
        for (i, (compiled, interpreted)) in self.writes.iter().zip(&replay.writes).enumerate() {
            if compiled != interpreted {
                return Some(format!(
                    "memory write {i} mismatch: compiled ({:#x} <- {:#x}), interpreter ({:#x} <- {:#x})",
                    compiled.0, compiled.1, interpreted.0, interpreted.1
                ));
            }
        }
        None
    }
}

/// Park the thread after a divergence so a human can attach and inspect.
fn halt_for_inspection() -> ! {
    error!("halting thread for divergence inspection");
    loop {
        std::hint::spin_loop();
        std::thread::yield_now();
    }
}

// =============================================================================
// Tests
// =============================================================================
