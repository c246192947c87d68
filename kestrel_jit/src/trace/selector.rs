//! The per-thread trace-selection state machine.
//!
//! Each execution context owns one selector. The interpreter drives it
//! with two signals: a hotness trigger when a per-entry profiling counter
//! crosses the threshold ([`TraceSelector::request_selection`]), and a
//! post-execution callback for every interpreted instruction while a
//! selection is active ([`TraceSelector::on_instruction`]).
//!
//! ```text
//! Idle ──request──▶ SelectRequested ──slot claimed──▶ Selecting
//!                        │ duplicate / table full          │ trace ends
//!                        ▼                                 ▼
//!                      Done ◀────────── submit ◀──── SelectEnding
//!
//! SingleStep ──▶ SingleStepEnding ──▶ Done (resume compiled code)
//! SelfVerifying ──▶ Done (or a forced single-step continuation)
//! ```
//!
//! `Done` is the terminal state of one attempt; the next request starts a
//! fresh attempt from it.

use kestrel_core::{BytecodeAddr, MethodId};

use crate::runtime::JitRuntime;
use crate::runtime::compiler_thread::{CompilerWorkOrder, ProfileMode};
use crate::trace::{BranchHint, JitTraceDescription, ResolvedCallee};

// =============================================================================
// Instruction events
// =============================================================================

/// Coarse classification of an interpreted instruction, as far as trace
/// selection cares.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpcodeClass {
    /// Ordinary straight-line instruction.
    Straightline,
    /// Conditional or unconditional branch.
    Branch,
    /// Table/lookup switch.
    Switch,
    /// Return without a value.
    ReturnVoid,
    /// Return carrying a value.
    ReturnValue,
    /// Throw.
    Throw,
    /// Invoke of any flavor.
    Invoke,
    /// Move-result-style instruction following an invoke.
    MoveResult,
    /// Control-flow instruction designated to never end a trace.
    NoSelect,
}

impl OpcodeClass {
    /// Whether this instruction class ends a trace.
    #[inline]
    pub const fn ends_trace(self) -> bool {
        matches!(
            self,
            OpcodeClass::Branch
                | OpcodeClass::Switch
                | OpcodeClass::ReturnVoid
                | OpcodeClass::ReturnValue
                | OpcodeClass::Throw
                | OpcodeClass::Invoke
        )
    }
}

/// What the interpreter reports after executing one instruction.
#[derive(Debug, Clone, Copy)]
pub struct InstructionEvent {
    /// Address of the executed instruction.
    pub addr: BytecodeAddr,
    /// Width in code units (for contiguity checks).
    pub width: u16,
    /// Raw opcode (for the per-opcode debug filter).
    pub opcode: u8,
    /// Classification.
    pub class: OpcodeClass,
    /// Containing method.
    pub method: MethodId,
    /// Resolved callee at invoke sites.
    pub resolved_callee: Option<ResolvedCallee>,
    /// For ending branches: whether the branch was taken.
    pub branch_taken: Option<bool>,
}

impl InstructionEvent {
    /// A plain straight-line instruction event.
    pub fn straightline(addr: BytecodeAddr, width: u16, method: MethodId) -> Self {
        InstructionEvent {
            addr,
            width,
            opcode: 0,
            class: OpcodeClass::Straightline,
            method,
            resolved_callee: None,
            branch_taken: None,
        }
    }

    /// Same event with a different opcode class.
    pub fn with_class(mut self, class: OpcodeClass) -> Self {
        self.class = class;
        self
    }

    /// Same event with a raw opcode value.
    pub fn with_opcode(mut self, opcode: u8) -> Self {
        self.opcode = opcode;
        self
    }

    /// Same event with a resolved callee attached.
    pub fn with_callee(mut self, callee: ResolvedCallee) -> Self {
        self.resolved_callee = Some(callee);
        self
    }
}

// =============================================================================
// Per-opcode debug filter
// =============================================================================

/// Include/exclude filter over raw opcodes, for debugging miscompiles by
/// bisecting which instructions may enter traces.
#[derive(Clone)]
pub struct OpcodeFilter {
    include: bool,
    set: [bool; 256],
}

impl OpcodeFilter {
    /// Only the listed opcodes may be selected.
    pub fn include(opcodes: &[u8]) -> Self {
        let mut set = [false; 256];
        for &op in opcodes {
            set[op as usize] = true;
        }
        OpcodeFilter { include: true, set }
    }

    /// The listed opcodes may never be selected.
    pub fn exclude(opcodes: &[u8]) -> Self {
        let mut set = [false; 256];
        for &op in opcodes {
            set[op as usize] = true;
        }
        OpcodeFilter {
            include: false,
            set,
        }
    }

    /// Whether an opcode may be part of a trace.
    #[inline]
    pub fn allows(&self, opcode: u8) -> bool {
        self.set[opcode as usize] == self.include
    }
}

impl std::fmt::Debug for OpcodeFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let listed = self.set.iter().filter(|&&b| b).count();
        f.debug_struct("OpcodeFilter")
            .field("include", &self.include)
            .field("listed", &listed)
            .finish()
    }
}

// =============================================================================
// States and actions
// =============================================================================

/// Selector state, one attempt at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectionState {
    /// No selection in progress.
    Idle,
    /// A hot entry requested selection; slot not yet claimed.
    SelectRequested {
        /// Bypass the recurrence filter (forced-hot request).
        hot: bool,
    },
    /// Growing a trace, one instruction at a time.
    Selecting,
    /// Finalizing and submitting the trace.
    SelectEnding,
    /// Interpreting exactly one instruction before resuming compiled code.
    SingleStep,
    /// The single allowed instruction has executed.
    SingleStepEnding,
    /// Shadow-verifying a compiled trace.
    SelfVerifying,
    /// Attempt finished (successfully or not).
    Done,
}

/// Why an attempt was abandoned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbandonReason {
    /// Entry already compiled, poisoned, or claimed by another thread.
    Duplicate,
    /// The entry table has no free slot.
    TableFull,
    /// A debugger or profiler became active mid-selection.
    DebuggerActive,
    /// An instruction was rejected by the per-opcode debug filter.
    FilteredOpcode,
}

/// What the interpreter should do after a selector callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectorAction {
    /// Nothing; keep interpreting.
    None,
    /// The trace was finalized and submitted (or rejected by the queue).
    Submitted {
        /// Whether the work queue accepted the order.
        accepted: bool,
    },
    /// The attempt was abandoned; keep interpreting.
    Abandoned(AbandonReason),
    /// Resume compiled code at the pending entry.
    ResumeCompiled,
    /// Begin shadow execution of the compiled trace.
    ShadowStart,
}

// =============================================================================
// Trace Selector
// =============================================================================

/// The per-execution-context selection state machine.
#[derive(Debug)]
pub struct TraceSelector {
    state: SelectionState,
    trace: Option<JitTraceDescription>,
    entry: BytecodeAddr,
    method: MethodId,
    last_addr: BytecodeAddr,
    last_width: u16,
    total_insns: u32,
    /// The next appended instruction opens a new run (after an invoke or a
    /// move-result).
    pending_new_run: bool,
}

impl TraceSelector {
    /// Create an idle selector.
    pub fn new() -> Self {
        TraceSelector {
            state: SelectionState::Idle,
            trace: None,
            entry: BytecodeAddr::NONE,
            method: MethodId::NONE,
            last_addr: BytecodeAddr::NONE,
            last_width: 0,
            total_insns: 0,
            pending_new_run: false,
        }
    }

    /// Current state.
    #[inline]
    pub fn state(&self) -> SelectionState {
        self.state
    }

    /// Entry address of the attempt in progress.
    #[inline]
    pub fn entry(&self) -> BytecodeAddr {
        self.entry
    }

    /// Level-1 admission: compare a raw per-entry execution count against
    /// the configured hotness threshold, then fall through to
    /// [`request_selection`](Self::request_selection).
    pub fn note_hot_entry(
        &mut self,
        entry: BytecodeAddr,
        method: MethodId,
        count: u32,
        runtime: &JitRuntime,
    ) -> SelectorAction {
        if count < runtime.config().hotness_threshold {
            return SelectorAction::None;
        }
        self.request_selection(entry, method, false, runtime)
    }

    /// The interpreter's per-entry counter crossed the hotness threshold.
    ///
    /// Applies the two-level admission filter (unless `hot`), claims the
    /// entry-table slot, and begins selecting. Idempotent with respect to
    /// duplicates: an entry already compiled or already claimed ends the
    /// attempt immediately.
    pub fn request_selection(
        &mut self,
        entry: BytecodeAddr,
        method: MethodId,
        hot: bool,
        runtime: &JitRuntime,
    ) -> SelectorAction {
        if !matches!(self.state, SelectionState::Idle | SelectionState::Done) {
            return SelectorAction::None;
        }
        if runtime.profile_mode() == ProfileMode::Off || runtime.debug_active() {
            return SelectorAction::None;
        }

        // Level-2 filter: the same (method, entry) key must recur before
        // a selection is admitted. Forced-hot requests bypass it.
        if !hot && !runtime.filter().admit_entry(method, entry) {
            return SelectorAction::None;
        }

        self.state = SelectionState::SelectRequested { hot };

        let Some(slot) = runtime.entry_table().find_or_create(entry) else {
            self.state = SelectionState::Done;
            return SelectorAction::Abandoned(AbandonReason::TableFull);
        };
        if slot.code().is_some() || slot.is_not_retranslatable() || !slot.try_begin_construction()
        {
            self.state = SelectionState::Done;
            return SelectorAction::Abandoned(AbandonReason::Duplicate);
        }

        self.state = SelectionState::Selecting;
        self.trace = Some(JitTraceDescription::new(entry));
        self.entry = entry;
        self.method = method;
        self.last_addr = BytecodeAddr::NONE;
        self.last_width = 0;
        self.total_insns = 0;
        self.pending_new_run = false;
        SelectorAction::None
    }

    /// Post-execution callback for each interpreted instruction.
    pub fn on_instruction(
        &mut self,
        event: &InstructionEvent,
        runtime: &JitRuntime,
    ) -> SelectorAction {
        match self.state {
            SelectionState::Selecting => self.select_step(event, runtime),
            SelectionState::SingleStep => {
                // The one allowed instruction has now executed.
                self.state = SelectionState::SingleStepEnding;
                SelectorAction::None
            }
            _ => SelectorAction::None,
        }
    }

    /// Called by the dispatch loop after a single-step window closes.
    pub fn resume_after_single_step(&mut self) -> SelectorAction {
        if self.state == SelectionState::SingleStepEnding {
            self.state = SelectionState::Done;
            SelectorAction::ResumeCompiled
        } else {
            SelectorAction::None
        }
    }

    /// Arm a single-step window: interpret exactly one more instruction
    /// (after a non-void return) before resuming compiled code.
    pub fn request_single_step(&mut self) {
        self.state = SelectionState::SingleStep;
    }

    /// Decide how to enter compiled code found by a lookup: under shadow
    /// verification when configured, directly otherwise.
    pub fn enter_compiled(&mut self, runtime: &JitRuntime) -> SelectorAction {
        if runtime.config().self_verify {
            self.begin_self_verify()
        } else {
            self.state = SelectionState::Done;
            SelectorAction::ResumeCompiled
        }
    }

    /// Enter shadow verification for a compiled trace about to execute.
    pub fn begin_self_verify(&mut self) -> SelectorAction {
        self.state = SelectionState::SelfVerifying;
        SelectorAction::ShadowStart
    }

    /// Shadow verification finished; fold back into `Done`, or continue
    /// through a forced single-step window.
    pub fn end_self_verify(&mut self, forced_single_step: bool) {
        if forced_single_step {
            self.state = SelectionState::SingleStep;
        } else {
            self.state = SelectionState::Done;
        }
    }

    // =========================================================================
    // Internal
    // =========================================================================

    fn select_step(&mut self, event: &InstructionEvent, runtime: &JitRuntime) -> SelectorAction {
        // Debugger activity aborts the attempt; nothing is submitted.
        if runtime.debug_active() {
            return self.abandon(runtime, AbandonReason::DebuggerActive);
        }
        if let Some(filter) = &runtime.config().opcode_filter {
            if !filter.allows(event.opcode) {
                return self.abandon(runtime, AbandonReason::FilteredOpcode);
            }
        }

        // Self-loop: the trace closed back on its own head. End without
        // appending the head a second time.
        if self.total_insns > 0 && event.addr == self.entry {
            return self.end_selection(runtime);
        }

        let trace = self
            .trace
            .as_mut()
            .expect("selecting state always owns a trace");

        let contiguous = !self.last_addr.is_none()
            && event.addr == self.last_addr.offset(usize::from(self.last_width));
        if self.total_insns == 0 || self.pending_new_run || !contiguous {
            trace.open_run(event.addr);
            self.pending_new_run = false;
        } else if trace.extend_run().is_err() {
            // A metadata slot is trailing; continue in a fresh run.
            trace.open_run(event.addr);
        }

        self.total_insns += 1;
        self.last_addr = event.addr;
        self.last_width = event.width;

        match event.class {
            OpcodeClass::Invoke => {
                // The callee's body (if inlined into the trace) begins a
                // separate run, annotated with the resolved callee.
                if let Some(callee) = event.resolved_callee {
                    trace.push_meta(callee);
                }
                self.pending_new_run = true;
            }
            OpcodeClass::MoveResult => {
                // The instruction after a move-result likewise opens a
                // new run.
                self.pending_new_run = true;
            }
            _ => {}
        }

        let flow_ends = event.class.ends_trace();
        let runs_full = trace.run_count() >= runtime.config().max_trace_runs;
        let length_capped = self.total_insns >= u32::from(runtime.config().max_trace_insns);

        if flow_ends || runs_full || length_capped {
            if let Some(taken) = event.branch_taken {
                trace.set_last_hint(if taken {
                    BranchHint::Taken
                } else {
                    BranchHint::NotTaken
                });
            }
            return self.end_selection(runtime);
        }

        SelectorAction::None
    }

    fn end_selection(&mut self, runtime: &JitRuntime) -> SelectorAction {
        self.state = SelectionState::SelectEnding;

        let mut trace = self
            .trace
            .take()
            .expect("select-ending state always owns a trace");
        if trace.seal().is_err() {
            return self.abandon(runtime, AbandonReason::Duplicate);
        }

        let accepted = runtime.queue().submit(CompilerWorkOrder::trace(trace));

        // Release the construction claim regardless of acceptance.
        if let Some(slot) = runtime.entry_table().find(self.entry) {
            slot.end_construction();
        }

        self.state = SelectionState::Done;
        SelectorAction::Submitted { accepted }
    }

    fn abandon(&mut self, runtime: &JitRuntime, reason: AbandonReason) -> SelectorAction {
        self.trace = None;
        if let Some(slot) = runtime.entry_table().find(self.entry) {
            slot.end_construction();
        }
        self.state = SelectionState::Done;
        SelectorAction::Abandoned(reason)
    }
}

impl Default for TraceSelector {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::{JitConfig, JitRuntime};
    use crate::trace::TraceRun;
    use kestrel_core::ClassId;

    fn runtime() -> JitRuntime {
        JitRuntime::new(JitConfig::for_testing()).unwrap()
    }

    fn start_selecting(selector: &mut TraceSelector, rt: &JitRuntime, entry: usize) {
        // for_testing admits on recurrence: prime the filter, then request.
        let action = selector.request_selection(BytecodeAddr(entry), MethodId(1), false, rt);
        assert_eq!(action, SelectorAction::None);
        if selector.state() != SelectionState::Selecting {
            let action = selector.request_selection(BytecodeAddr(entry), MethodId(1), false, rt);
            assert_eq!(action, SelectorAction::None);
        }
        assert_eq!(selector.state(), SelectionState::Selecting);
    }

    fn insn(addr: usize) -> InstructionEvent {
        InstructionEvent::straightline(BytecodeAddr(addr), 2, MethodId(1))
    }

    #[test]
    fn test_filter_denies_first_request() {
        let rt = runtime();
        let mut selector = TraceSelector::new();

        let action = selector.request_selection(BytecodeAddr(0x100), MethodId(1), false, &rt);
        assert_eq!(action, SelectorAction::None);
        assert_eq!(selector.state(), SelectionState::Idle);

        // Second occurrence of the same key is admitted.
        let action = selector.request_selection(BytecodeAddr(0x100), MethodId(1), false, &rt);
        assert_eq!(action, SelectorAction::None);
        assert_eq!(selector.state(), SelectionState::Selecting);
    }

    #[test]
    fn test_hot_request_bypasses_filter() {
        let rt = runtime();
        let mut selector = TraceSelector::new();

        let action = selector.request_selection(BytecodeAddr(0x100), MethodId(1), true, &rt);
        assert_eq!(action, SelectorAction::None);
        assert_eq!(selector.state(), SelectionState::Selecting);
    }

    #[test]
    fn test_duplicate_request_abandons() {
        let rt = runtime();
        let mut first = TraceSelector::new();
        let mut second = TraceSelector::new();

        first.request_selection(BytecodeAddr(0x100), MethodId(1), true, &rt);
        assert_eq!(first.state(), SelectionState::Selecting);

        let action = second.request_selection(BytecodeAddr(0x100), MethodId(1), true, &rt);
        assert_eq!(
            action,
            SelectorAction::Abandoned(AbandonReason::Duplicate)
        );
        assert_eq!(second.state(), SelectionState::Done);
    }

    #[test]
    fn test_straightline_trace_ends_on_return() {
        let rt = runtime();
        let mut selector = TraceSelector::new();
        start_selecting(&mut selector, &rt, 0x100);

        assert_eq!(selector.on_instruction(&insn(0x100), &rt), SelectorAction::None);
        assert_eq!(selector.on_instruction(&insn(0x102), &rt), SelectorAction::None);
        let action = selector.on_instruction(
            &insn(0x104).with_class(OpcodeClass::ReturnVoid),
            &rt,
        );
        assert_eq!(action, SelectorAction::Submitted { accepted: true });
        assert_eq!(selector.state(), SelectionState::Done);

        // One well-formed order landed in the queue.
        let order = rt.queue().try_pop().unwrap();
        match order.kind {
            crate::runtime::compiler_thread::WorkOrderKind::TraceCompile(desc) => {
                desc.validate().unwrap();
                assert_eq!(desc.total_insns(), 3);
                assert_eq!(desc.code_run_count(), 1);
            }
            other => panic!("unexpected order kind {other:?}"),
        }

        // The construction claim was released.
        let slot = rt.entry_table().find(BytecodeAddr(0x100)).unwrap();
        assert!(!slot.under_construction());
    }

    #[test]
    fn test_noncontiguous_instruction_opens_new_run() {
        let rt = runtime();
        let mut selector = TraceSelector::new();
        start_selecting(&mut selector, &rt, 0x100);

        selector.on_instruction(&insn(0x100), &rt);
        // Jump target: not contiguous with 0x100+2.
        selector.on_instruction(&insn(0x200), &rt);
        let action =
            selector.on_instruction(&insn(0x202).with_class(OpcodeClass::Throw), &rt);
        assert!(matches!(action, SelectorAction::Submitted { .. }));

        let order = rt.queue().try_pop().unwrap();
        let crate::runtime::compiler_thread::WorkOrderKind::TraceCompile(desc) = order.kind
        else {
            panic!("expected trace order");
        };
        assert_eq!(desc.code_run_count(), 2);
        assert_eq!(desc.total_insns(), 3);
    }

    #[test]
    fn test_invoke_attaches_callee_meta_and_ends_trace() {
        let rt = runtime();
        let mut selector = TraceSelector::new();
        start_selecting(&mut selector, &rt, 0x100);

        selector.on_instruction(&insn(0x100), &rt);
        let callee = ResolvedCallee {
            class: ClassId(0x30),
            method: MethodId(0x31),
        };
        let action = selector.on_instruction(
            &insn(0x102)
                .with_class(OpcodeClass::Invoke)
                .with_callee(callee),
            &rt,
        );
        assert!(matches!(action, SelectorAction::Submitted { accepted: true }));

        let order = rt.queue().try_pop().unwrap();
        let crate::runtime::compiler_thread::WorkOrderKind::TraceCompile(desc) = order.kind
        else {
            panic!("expected trace order");
        };
        // Trailing metadata after the final code run is dropped by seal.
        assert!(desc.validate().is_ok());
        assert_eq!(desc.total_insns(), 2);
    }

    #[test]
    fn test_self_loop_ends_trace() {
        let rt = runtime();
        let mut selector = TraceSelector::new();
        start_selecting(&mut selector, &rt, 0x100);

        selector.on_instruction(&insn(0x100), &rt);
        selector.on_instruction(&insn(0x102).with_class(OpcodeClass::NoSelect), &rt);
        // Control arrives back at the trace head.
        let action = selector.on_instruction(&insn(0x100), &rt);
        assert!(matches!(action, SelectorAction::Submitted { .. }));

        let order = rt.queue().try_pop().unwrap();
        let crate::runtime::compiler_thread::WorkOrderKind::TraceCompile(desc) = order.kind
        else {
            panic!("expected trace order");
        };
        // The head instruction appears exactly once.
        assert_eq!(desc.total_insns(), 2);
    }

    #[test]
    fn test_never_ends_class_continues_trace() {
        let rt = runtime();
        let mut selector = TraceSelector::new();
        start_selecting(&mut selector, &rt, 0x100);

        let action = selector.on_instruction(
            &insn(0x100).with_class(OpcodeClass::NoSelect),
            &rt,
        );
        assert_eq!(action, SelectorAction::None);
        assert_eq!(selector.state(), SelectionState::Selecting);
    }

    #[test]
    fn test_max_length_ends_trace() {
        let rt = runtime();
        let max = rt.config().max_trace_insns;
        let mut selector = TraceSelector::new();
        start_selecting(&mut selector, &rt, 0x100);

        let mut addr = 0x100;
        let mut last = SelectorAction::None;
        for _ in 0..max {
            last = selector.on_instruction(&insn(addr), &rt);
            addr += 2;
        }
        assert!(matches!(last, SelectorAction::Submitted { .. }));
    }

    #[test]
    fn test_debugger_aborts_selection() {
        let rt = runtime();
        let mut selector = TraceSelector::new();
        start_selecting(&mut selector, &rt, 0x100);
        selector.on_instruction(&insn(0x100), &rt);

        rt.set_debug_active(true);
        let action = selector.on_instruction(&insn(0x102), &rt);
        assert_eq!(
            action,
            SelectorAction::Abandoned(AbandonReason::DebuggerActive)
        );
        // Nothing was submitted.
        assert!(rt.queue().is_empty());
        // The slot is reusable.
        let slot = rt.entry_table().find(BytecodeAddr(0x100)).unwrap();
        assert!(!slot.under_construction());
    }

    #[test]
    fn test_opcode_filter_abandons() {
        let mut config = JitConfig::for_testing();
        config.opcode_filter = Some(OpcodeFilter::exclude(&[0x6E]));
        let rt = JitRuntime::new(config).unwrap();

        let mut selector = TraceSelector::new();
        selector.request_selection(BytecodeAddr(0x100), MethodId(1), true, &rt);

        let action =
            selector.on_instruction(&insn(0x100).with_opcode(0x6E), &rt);
        assert_eq!(
            action,
            SelectorAction::Abandoned(AbandonReason::FilteredOpcode)
        );
    }

    #[test]
    fn test_single_step_window() {
        let rt = runtime();
        let mut selector = TraceSelector::new();

        selector.request_single_step();
        assert_eq!(selector.state(), SelectionState::SingleStep);

        // Exactly one interpreted instruction...
        let action = selector.on_instruction(&insn(0x100), &rt);
        assert_eq!(action, SelectorAction::None);
        assert_eq!(selector.state(), SelectionState::SingleStepEnding);

        // ...then compiled code resumes.
        assert_eq!(
            selector.resume_after_single_step(),
            SelectorAction::ResumeCompiled
        );
        assert_eq!(selector.state(), SelectionState::Done);
    }

    #[test]
    fn test_enter_compiled_honors_self_verify_flag() {
        let rt = runtime();
        let mut selector = TraceSelector::new();
        assert_eq!(selector.enter_compiled(&rt), SelectorAction::ResumeCompiled);

        let mut config = JitConfig::for_testing();
        config.self_verify = true;
        let rt = JitRuntime::new(config).unwrap();
        let mut selector = TraceSelector::new();
        assert_eq!(selector.enter_compiled(&rt), SelectorAction::ShadowStart);
        assert_eq!(selector.state(), SelectionState::SelfVerifying);
    }

    #[test]
    fn test_self_verify_folds_to_done() {
        let rt = runtime();
        let mut selector = TraceSelector::new();

        assert_eq!(selector.begin_self_verify(), SelectorAction::ShadowStart);
        assert_eq!(selector.state(), SelectionState::SelfVerifying);

        selector.end_self_verify(false);
        assert_eq!(selector.state(), SelectionState::Done);

        // Forced single-step continuation.
        selector.begin_self_verify();
        selector.end_self_verify(true);
        assert_eq!(selector.state(), SelectionState::SingleStep);
        let _ = rt;
    }

    #[test]
    fn test_selector_reusable_after_done() {
        let rt = runtime();
        let mut selector = TraceSelector::new();

        start_selecting(&mut selector, &rt, 0x100);
        selector.on_instruction(&insn(0x100).with_class(OpcodeClass::ReturnVoid), &rt);
        assert_eq!(selector.state(), SelectionState::Done);

        // A fresh entry starts a fresh attempt.
        let action = selector.request_selection(BytecodeAddr(0x900), MethodId(2), true, &rt);
        assert_eq!(action, SelectorAction::None);
        assert_eq!(selector.state(), SelectionState::Selecting);
    }

    #[test]
    fn test_hotness_threshold_gates_requests() {
        let rt = runtime();
        let threshold = rt.config().hotness_threshold;
        let mut selector = TraceSelector::new();

        // Below threshold: not even the filter is consulted.
        let action =
            selector.note_hot_entry(BytecodeAddr(0x100), MethodId(1), threshold - 1, &rt);
        assert_eq!(action, SelectorAction::None);
        assert_eq!(rt.filter().counters(), (0, 0));

        // At threshold: the request flows into the recurrence filter.
        selector.note_hot_entry(BytecodeAddr(0x100), MethodId(1), threshold, &rt);
        selector.note_hot_entry(BytecodeAddr(0x100), MethodId(1), threshold, &rt);
        assert_eq!(selector.state(), SelectionState::Selecting);
    }

    #[test]
    fn test_profile_mode_off_ignores_requests() {
        let rt = runtime();
        rt.set_profile_mode(ProfileMode::Off);

        let mut selector = TraceSelector::new();
        let action = selector.request_selection(BytecodeAddr(0x100), MethodId(1), true, &rt);
        assert_eq!(action, SelectorAction::None);
        assert_eq!(selector.state(), SelectionState::Idle);
    }
}
