//! Trace descriptions: the unit of work handed to the code generator.
//!
//! A trace is an ordered, possibly discontinuous sequence of bytecode
//! instruction runs selected for compilation. Runs are either code
//! fragments (start address + instruction count) or opaque metadata slots
//! carrying a resolved callee identity attached after an invoke fragment.
//!
//! Invariant: a sealed description has exactly one code run with
//! `is_last == true`, located at the end of the run list, and every code
//! run covers at least one instruction.

pub mod filter;
pub mod selector;

use kestrel_core::{BytecodeAddr, ClassId, JitError, JitResult, MethodId};
use smallvec::SmallVec;

/// Inline capacity of the run list; traces rarely exceed this many runs.
const INLINE_RUNS: usize = 8;

// =============================================================================
// Runs
// =============================================================================

/// Branch-prediction hint recorded for a code run's exit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BranchHint {
    /// No prediction recorded.
    #[default]
    None,
    /// The run's ending branch was observed taken.
    Taken,
    /// The run's ending branch was observed not taken.
    NotTaken,
}

/// A contiguous fragment of bytecode inside a trace.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CodeRun {
    /// Address of the first instruction in the run.
    pub start: BytecodeAddr,
    /// Number of instructions in the run (always ≥ 1 once sealed).
    pub insn_count: u16,
    /// Whether this is the final code run of the trace.
    pub is_last: bool,
    /// Prediction hint for the run's ending branch.
    pub hint: BranchHint,
}

/// Callee identity resolved at an invoke site while selecting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedCallee {
    /// Runtime class of the observed receiver.
    pub class: ClassId,
    /// Method the invoke resolved to.
    pub method: MethodId,
}

/// One element of a trace description.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraceRun {
    /// A code fragment.
    Code(CodeRun),
    /// Opaque metadata attached after an invoke fragment.
    Meta(ResolvedCallee),
}

impl TraceRun {
    /// View as a code run, if this is one.
    #[inline]
    pub fn as_code(&self) -> Option<&CodeRun> {
        match self {
            TraceRun::Code(run) => Some(run),
            TraceRun::Meta(_) => None,
        }
    }
}

// =============================================================================
// Trace Description
// =============================================================================

/// An ordered sequence of trace runs rooted at one bytecode entry address.
///
/// Built incrementally by the trace selector, sealed before submission,
/// and owned by the work order from then on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JitTraceDescription {
    entry: BytecodeAddr,
    runs: SmallVec<[TraceRun; INLINE_RUNS]>,
    sealed: bool,
}

impl JitTraceDescription {
    /// Create an empty description for the given entry address.
    pub fn new(entry: BytecodeAddr) -> Self {
        JitTraceDescription {
            entry,
            runs: SmallVec::new(),
            sealed: false,
        }
    }

    /// Create a method-shaped description: a single run starting at the
    /// method entry, used by whole-method compile orders.
    pub fn for_method(entry: BytecodeAddr, insn_count: u16) -> JitResult<Self> {
        let mut desc = JitTraceDescription::new(entry);
        desc.open_run(entry);
        for _ in 1..insn_count {
            desc.extend_run()?;
        }
        desc.seal()?;
        Ok(desc)
    }

    /// Bytecode entry address this trace starts at.
    #[inline]
    pub fn entry(&self) -> BytecodeAddr {
        self.entry
    }

    /// All runs, in order.
    #[inline]
    pub fn runs(&self) -> &[TraceRun] {
        &self.runs
    }

    /// Number of runs (code and metadata).
    #[inline]
    pub fn run_count(&self) -> usize {
        self.runs.len()
    }

    /// Number of code runs.
    pub fn code_run_count(&self) -> usize {
        self.runs.iter().filter(|r| r.as_code().is_some()).count()
    }

    /// Total instruction count across all code runs.
    pub fn total_insns(&self) -> u32 {
        self.runs
            .iter()
            .filter_map(TraceRun::as_code)
            .map(|r| u32::from(r.insn_count))
            .sum()
    }

    /// Whether the description has been sealed.
    #[inline]
    pub fn is_sealed(&self) -> bool {
        self.sealed
    }

    /// Open a new code run starting at `start` with one instruction.
    pub fn open_run(&mut self, start: BytecodeAddr) {
        debug_assert!(!self.sealed, "trace already sealed");
        self.runs.push(TraceRun::Code(CodeRun {
            start,
            insn_count: 1,
            is_last: false,
            hint: BranchHint::None,
        }));
    }

    /// Extend the most recent code run by one instruction.
    ///
    /// Fails if no code run is open (the last element is metadata, or the
    /// description is empty); callers must `open_run` first.
    pub fn extend_run(&mut self) -> JitResult<()> {
        debug_assert!(!self.sealed, "trace already sealed");
        match self.runs.last_mut() {
            Some(TraceRun::Code(run)) => {
                run.insn_count = run.insn_count.saturating_add(1);
                Ok(())
            }
            _ => Err(JitError::Protocol(
                "extend_run with no open code run".into(),
            )),
        }
    }

    /// Record a branch-prediction hint on the most recent code run.
    pub fn set_last_hint(&mut self, hint: BranchHint) {
        if let Some(TraceRun::Code(run)) = self.runs.last_mut() {
            run.hint = hint;
        }
    }

    /// Append a resolved-callee metadata slot after an invoke fragment.
    pub fn push_meta(&mut self, callee: ResolvedCallee) {
        debug_assert!(!self.sealed, "trace already sealed");
        self.runs.push(TraceRun::Meta(callee));
    }

    /// Seal the description: mark the final code run as last and verify
    /// well-formedness.
    ///
    /// A metadata slot trailing the final code run is dropped: the last
    /// element of a sealed description is always the last code run.
    pub fn seal(&mut self) -> JitResult<()> {
        while matches!(self.runs.last(), Some(TraceRun::Meta(_))) {
            self.runs.pop();
        }
        match self.runs.last_mut() {
            Some(TraceRun::Code(run)) => run.is_last = true,
            _ => return Err(JitError::Protocol("sealing an empty trace".into())),
        }
        self.sealed = true;
        self.validate()
    }

    /// Check the sealed-description invariants.
    pub fn validate(&self) -> JitResult<()> {
        let mut last_seen = 0usize;
        for (idx, run) in self.runs.iter().enumerate() {
            if let TraceRun::Code(code) = run {
                if code.insn_count == 0 {
                    return Err(JitError::Protocol(format!(
                        "code run {idx} has zero instructions"
                    )));
                }
                if code.is_last {
                    last_seen += 1;
                    if idx != self.runs.len() - 1 {
                        return Err(JitError::Protocol(format!(
                            "last-run marker at {idx} is not the final element"
                        )));
                    }
                }
            }
        }
        if last_seen != 1 {
            return Err(JitError::Protocol(format!(
                "expected exactly one last run, found {last_seen}"
            )));
        }
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(a: usize) -> BytecodeAddr {
        BytecodeAddr(a)
    }

    #[test]
    fn test_single_run_trace() {
        let mut desc = JitTraceDescription::new(addr(0x100));
        desc.open_run(addr(0x100));
        desc.extend_run().unwrap();
        desc.extend_run().unwrap();
        desc.seal().unwrap();

        assert!(desc.is_sealed());
        assert_eq!(desc.run_count(), 1);
        assert_eq!(desc.total_insns(), 3);

        let run = desc.runs()[0].as_code().unwrap();
        assert!(run.is_last);
        assert_eq!(run.start, addr(0x100));
    }

    #[test]
    fn test_multi_run_with_meta() {
        let mut desc = JitTraceDescription::new(addr(0x100));
        desc.open_run(addr(0x100));
        desc.extend_run().unwrap();
        desc.push_meta(ResolvedCallee {
            class: ClassId(0x10),
            method: MethodId(0x20),
        });
        desc.open_run(addr(0x400));
        desc.seal().unwrap();

        assert_eq!(desc.run_count(), 3);
        assert_eq!(desc.code_run_count(), 2);
        assert_eq!(desc.total_insns(), 3);

        // Only the final code run carries the marker.
        let firsts: Vec<bool> = desc
            .runs()
            .iter()
            .filter_map(TraceRun::as_code)
            .map(|r| r.is_last)
            .collect();
        assert_eq!(firsts, vec![false, true]);
    }

    #[test]
    fn test_trailing_meta_dropped_on_seal() {
        let mut desc = JitTraceDescription::new(addr(0x100));
        desc.open_run(addr(0x100));
        desc.push_meta(ResolvedCallee {
            class: ClassId(1),
            method: MethodId(2),
        });
        desc.seal().unwrap();

        assert_eq!(desc.run_count(), 1);
        assert!(matches!(desc.runs()[0], TraceRun::Code(r) if r.is_last));
    }

    #[test]
    fn test_extend_without_open_fails() {
        let mut desc = JitTraceDescription::new(addr(0x100));
        assert!(desc.extend_run().is_err());

        desc.open_run(addr(0x100));
        desc.push_meta(ResolvedCallee {
            class: ClassId(1),
            method: MethodId(2),
        });
        assert!(desc.extend_run().is_err());
    }

    #[test]
    fn test_seal_empty_fails() {
        let mut desc = JitTraceDescription::new(addr(0x100));
        assert!(desc.seal().is_err());
    }

    #[test]
    fn test_branch_hint() {
        let mut desc = JitTraceDescription::new(addr(0x100));
        desc.open_run(addr(0x100));
        desc.set_last_hint(BranchHint::Taken);
        desc.seal().unwrap();
        assert_eq!(desc.runs()[0].as_code().unwrap().hint, BranchHint::Taken);
    }

    #[test]
    fn test_method_shaped_description() {
        let desc = JitTraceDescription::for_method(addr(0x200), 5).unwrap();
        assert!(desc.is_sealed());
        assert_eq!(desc.run_count(), 1);
        assert_eq!(desc.total_insns(), 5);
    }

    #[test]
    fn test_validate_rejects_misplaced_last() {
        let mut desc = JitTraceDescription::new(addr(0x100));
        desc.open_run(addr(0x100));
        desc.open_run(addr(0x200));
        desc.seal().unwrap();

        // Corrupt: mark the first run as last too.
        if let TraceRun::Code(run) = &mut desc.runs[0] {
            run.is_last = true;
        }
        assert!(desc.validate().is_err());
    }
}
