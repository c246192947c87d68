//! Background compilation: work orders, the bounded queue, and the
//! single compiler thread.
//!
//! Interpreter threads submit work orders; exactly one compiler thread
//! drains them. Submission is non-blocking by default (a full queue
//! rejects the order and the trace simply stays interpreted) or blocking,
//! where the producer waits for the compiler to drain its order (used for
//! deterministic testing).
//!
//! Compilation failures are contained: a length-dependent failure is
//! retried once with a halved trace budget, anything persistent marks the
//! entry as not-retranslatable for the session, and an aborted order
//! resets its entry-table slot instead of leaving it under construction.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

use kestrel_core::BytecodeAddr;
use tracing::{debug, warn};

use crate::codegen::{CodeGenerator, CodegenError, TranslationRequest};
use crate::runtime::JitRuntime;
use crate::trace::JitTraceDescription;

// =============================================================================
// Abort Handle
// =============================================================================

/// Cooperative cancellation token carried by every work order.
///
/// The code generator checks it at convenient boundaries; a bailed order
/// is discarded and its entry-table slot reset to "not compiled".
#[derive(Debug, Clone, Default)]
pub struct AbortHandle(Arc<AtomicBool>);

impl AbortHandle {
    /// Create a fresh, unbailed handle.
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation.
    pub fn bail(&self) {
        self.0.store(true, Ordering::Release);
    }

    /// Whether cancellation was requested.
    #[inline]
    pub fn is_bailed(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

// =============================================================================
// Work Orders
// =============================================================================

/// Trace-profiling mode applied through a mode-change order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ProfileMode {
    /// No trace profiling.
    Off = 0,
    /// Periodic sampling (default).
    Periodic = 1,
    /// Continuous per-entry counting.
    Continuous = 2,
}

impl ProfileMode {
    /// Convert from the raw stored tag.
    pub const fn from_u8(v: u8) -> Self {
        match v {
            2 => Self::Continuous,
            1 => Self::Periodic,
            _ => Self::Off,
        }
    }
}

/// What a work order asks the compiler thread to do.
#[derive(Debug)]
pub enum WorkOrderKind {
    /// Compile a selected trace.
    TraceCompile(JitTraceDescription),
    /// Compile a whole method (method-shaped description).
    MethodCompile(JitTraceDescription),
    /// Switch the trace-profiling mode.
    ModeChange(ProfileMode),
}

/// One unit of work for the compiler thread.
///
/// Ownership of the trace description transfers to the queue on submit
/// and to the compiler thread on pop.
#[derive(Debug)]
pub struct CompilerWorkOrder {
    /// What to do.
    pub kind: WorkOrderKind,
    /// Bytecode entry address this order concerns (sentinel for
    /// mode changes).
    pub entry: BytecodeAddr,
    /// Cooperative cancellation token.
    pub abort: AbortHandle,
    /// Completion latch, present in blocking submission mode.
    latch: Option<Arc<Latch>>,
}

impl CompilerWorkOrder {
    /// A trace-compile order.
    pub fn trace(description: JitTraceDescription) -> Self {
        CompilerWorkOrder {
            entry: description.entry(),
            kind: WorkOrderKind::TraceCompile(description),
            abort: AbortHandle::new(),
            latch: None,
        }
    }

    /// A whole-method compile order.
    pub fn method(description: JitTraceDescription) -> Self {
        CompilerWorkOrder {
            entry: description.entry(),
            kind: WorkOrderKind::MethodCompile(description),
            abort: AbortHandle::new(),
            latch: None,
        }
    }

    /// A profiling-mode change.
    pub fn mode_change(mode: ProfileMode) -> Self {
        CompilerWorkOrder {
            entry: BytecodeAddr::NONE,
            kind: WorkOrderKind::ModeChange(mode),
            abort: AbortHandle::new(),
            latch: None,
        }
    }
}

/// Producer-side completion latch for blocking submission.
#[derive(Debug, Default)]
struct Latch {
    done: Mutex<bool>,
    condvar: Condvar,
}

impl Latch {
    fn wait(&self) {
        let mut done = self.done.lock().unwrap();
        while !*done {
            done = self.condvar.wait(done).unwrap();
        }
    }

    fn signal(&self) {
        *self.done.lock().unwrap() = true;
        self.condvar.notify_all();
    }
}

// =============================================================================
// Work Queue
// =============================================================================

/// Bounded queue between interpreter threads and the compiler thread.
#[derive(Debug)]
pub struct CompilerWorkQueue {
    /// Pending orders, oldest first.
    queue: Mutex<VecDeque<CompilerWorkOrder>>,
    /// Signals the consumer that work (or shutdown) arrived.
    condvar: Condvar,
    /// Maximum queued orders.
    capacity: usize,
    /// Blocking submission discipline (producers wait for drain).
    blocking: AtomicBool,
    /// Raised once, on shutdown.
    shutdown: AtomicBool,
    submitted: AtomicU64,
    rejected: AtomicU64,
    drained: AtomicU64,
}

impl CompilerWorkQueue {
    /// Create a queue with the given capacity and submission discipline.
    pub fn new(capacity: usize, blocking: bool) -> Self {
        CompilerWorkQueue {
            queue: Mutex::new(VecDeque::new()),
            condvar: Condvar::new(),
            capacity,
            blocking: AtomicBool::new(blocking),
            shutdown: AtomicBool::new(false),
            submitted: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
            drained: AtomicU64::new(0),
        }
    }

    /// Maximum number of queued orders.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Switch between blocking and non-blocking submission.
    pub fn set_blocking(&self, blocking: bool) {
        self.blocking.store(blocking, Ordering::Release);
    }

    /// Whether producers wait for their orders to drain.
    #[inline]
    pub fn is_blocking(&self) -> bool {
        self.blocking.load(Ordering::Acquire)
    }

    /// Submit a work order.
    ///
    /// Returns `false` when the queue is full or shut down; the caller
    /// must release any per-entry under-construction marker regardless of
    /// acceptance. In blocking mode a `true` return additionally means the
    /// compiler thread has finished processing the order.
    pub fn submit(&self, mut order: CompilerWorkOrder) -> bool {
        if self.shutdown.load(Ordering::Acquire) {
            self.rejected.fetch_add(1, Ordering::Relaxed);
            return false;
        }

        let latch = if self.is_blocking() {
            let latch = Arc::new(Latch::default());
            order.latch = Some(Arc::clone(&latch));
            Some(latch)
        } else {
            None
        };

        {
            let mut queue = self.queue.lock().unwrap();
            if queue.len() >= self.capacity {
                self.rejected.fetch_add(1, Ordering::Relaxed);
                return false;
            }
            queue.push_back(order);
        }
        self.submitted.fetch_add(1, Ordering::Relaxed);
        self.condvar.notify_one();

        if let Some(latch) = latch {
            latch.wait();
        }
        true
    }

    /// Wait for and take the next order.
    ///
    /// Returns `None` once the queue is shutting down.
    pub fn wait_for_order(&self) -> Option<CompilerWorkOrder> {
        let mut queue = self.queue.lock().unwrap();
        loop {
            if let Some(order) = queue.pop_front() {
                return Some(order);
            }
            if self.shutdown.load(Ordering::Acquire) {
                return None;
            }
            queue = self.condvar.wait(queue).unwrap();
        }
    }

    /// Take an order without blocking.
    pub fn try_pop(&self) -> Option<CompilerWorkOrder> {
        self.queue.lock().unwrap().pop_front()
    }

    /// Number of pending orders.
    pub fn len(&self) -> usize {
        self.queue.lock().unwrap().len()
    }

    /// Whether no orders are pending.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Signal shutdown; pending orders are still drained first.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
        self.condvar.notify_all();
    }

    /// Whether shutdown has been signaled.
    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    /// (submitted, rejected, drained) counters.
    pub fn counters(&self) -> (u64, u64, u64) {
        (
            self.submitted.load(Ordering::Relaxed),
            self.rejected.load(Ordering::Relaxed),
            self.drained.load(Ordering::Relaxed),
        )
    }

    fn note_drained(&self) {
        self.drained.fetch_add(1, Ordering::Relaxed);
    }
}

// =============================================================================
// Compiler Thread
// =============================================================================

/// The single background compiler: pops orders, drives the code
/// generator, and installs results.
pub struct CompilerThread {
    runtime: Arc<JitRuntime>,
    generator: Box<dyn CodeGenerator>,
}

impl CompilerThread {
    /// Create a compiler for the given runtime and backend.
    pub fn new(runtime: Arc<JitRuntime>, generator: Box<dyn CodeGenerator>) -> Self {
        CompilerThread { runtime, generator }
    }

    /// Run the drain loop until shutdown. Blocking.
    pub fn run(&self) {
        debug!("compiler thread started");
        while let Some(order) = self.runtime.queue().wait_for_order() {
            self.process(order);
        }
        debug!("compiler thread exiting");
    }

    /// Process one order.
    pub fn process(&self, mut order: CompilerWorkOrder) {
        let latch = order.latch.take();

        match order.kind {
            WorkOrderKind::TraceCompile(ref description)
            | WorkOrderKind::MethodCompile(ref description) => {
                self.compile(order.entry, description, &order.abort);
            }
            WorkOrderKind::ModeChange(mode) => {
                self.runtime.set_profile_mode(mode);
                debug!(?mode, "profile mode changed");
            }
        }

        self.runtime.queue().note_drained();
        if let Some(latch) = latch {
            latch.signal();
        }
    }

    fn compile(&self, entry: BytecodeAddr, description: &JitTraceDescription, abort: &AbortHandle) {
        let runtime = &*self.runtime;
        let stats = runtime.compiler_stats();

        let Some(slot) = runtime.entry_table().find(entry) else {
            // Slot vanished in a full reset between submit and pop.
            stats.dropped.fetch_add(1, Ordering::Relaxed);
            return;
        };
        if slot.is_not_retranslatable() {
            slot.end_construction();
            stats.dropped.fetch_add(1, Ordering::Relaxed);
            return;
        }

        // A full cache halts all new translation work until reset.
        if runtime.code_cache().is_full() {
            slot.end_construction();
            stats.dropped.fetch_add(1, Ordering::Relaxed);
            debug!(%entry, "compile dropped: code cache full");
            return;
        }

        let mut budget = runtime.config().max_trace_insns;
        let mut attempt = self.generator.compile(&TranslationRequest {
            trace: description,
            max_insns: budget,
            abort,
        });

        // One retry with a shorter trace budget for length-dependent
        // failures.
        if matches!(&attempt, Err(e) if e.is_length_dependent()) {
            budget = (budget / 2).max(1);
            stats.retried.fetch_add(1, Ordering::Relaxed);
            attempt = self.generator.compile(&TranslationRequest {
                trace: description,
                max_insns: budget,
                abort,
            });
        }

        match attempt {
            Ok(translation) => match runtime.code_cache().install(&translation, description) {
                Ok(installed) => {
                    slot.set_code_address(installed.entry_point(), translation.isa);
                    slot.end_construction();
                    stats.compiled.fetch_add(1, Ordering::Relaxed);
                }
                Err(err) => {
                    // Capacity exhaustion mid-install: drop, stay
                    // interpreted.
                    debug!(%entry, %err, "install failed");
                    slot.end_construction();
                    stats.dropped.fetch_add(1, Ordering::Relaxed);
                }
            },
            Err(CodegenError::Aborted) => {
                slot.clear_code();
                slot.end_construction();
                stats.aborted.fetch_add(1, Ordering::Relaxed);
                debug!(%entry, "compile aborted");
            }
            Err(err) => {
                slot.mark_not_retranslatable();
                slot.end_construction();
                stats.failed.fetch_add(1, Ordering::Relaxed);
                warn!(%entry, %err, "compile failed; entry marked not retranslatable");
            }
        }
    }
}

/// Spawn the compiler thread; the returned handle shuts it down on drop.
pub fn spawn_compiler(
    runtime: Arc<JitRuntime>,
    generator: Box<dyn CodeGenerator>,
) -> CompilerHandle {
    let thread = CompilerThread::new(Arc::clone(&runtime), generator);
    let handle = std::thread::Builder::new()
        .name("kestrel-jit-compiler".into())
        .spawn(move || thread.run())
        .expect("failed to spawn compiler thread");
    CompilerHandle {
        runtime,
        handle: Some(handle),
    }
}

/// Owner handle for a running compiler thread.
pub struct CompilerHandle {
    runtime: Arc<JitRuntime>,
    handle: Option<JoinHandle<()>>,
}

impl CompilerHandle {
    /// Signal shutdown and wait for the drain loop to exit.
    pub fn shutdown(mut self) {
        self.shutdown_internal();
    }

    fn shutdown_internal(&mut self) {
        if let Some(handle) = self.handle.take() {
            self.runtime.queue().shutdown();
            let _ = handle.join();
        }
    }
}

impl Drop for CompilerHandle {
    fn drop(&mut self) {
        self.shutdown_internal();
    }
}

// =============================================================================
// Statistics
// =============================================================================

/// Atomic compiler-thread counters, owned by the runtime.
#[derive(Debug, Default)]
pub struct CompilerStats {
    /// Successful translations installed.
    pub compiled: AtomicU64,
    /// Persistent failures (entry marked not retranslatable).
    pub failed: AtomicU64,
    /// Orders discarded via the abort handle.
    pub aborted: AtomicU64,
    /// Length-dependent retries attempted.
    pub retried: AtomicU64,
    /// Orders dropped (cache full, stale slot, poisoned entry).
    pub dropped: AtomicU64,
}

impl CompilerStats {
    /// Copy out a snapshot.
    pub fn snapshot(&self) -> CompilerStatsSnapshot {
        CompilerStatsSnapshot {
            compiled: self.compiled.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            aborted: self.aborted.load(Ordering::Relaxed),
            retried: self.retried.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time compiler statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CompilerStatsSnapshot {
    /// Successful translations installed.
    pub compiled: u64,
    /// Persistent failures.
    pub failed: u64,
    /// Aborted orders.
    pub aborted: u64,
    /// Retries attempted.
    pub retried: u64,
    /// Dropped orders.
    pub dropped: u64,
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use kestrel_core::BytecodeAddr;

    fn order_for(entry: usize) -> CompilerWorkOrder {
        let mut desc = JitTraceDescription::new(BytecodeAddr(entry));
        desc.open_run(BytecodeAddr(entry));
        desc.seal().unwrap();
        CompilerWorkOrder::trace(desc)
    }

    #[test]
    fn test_abort_handle() {
        let handle = AbortHandle::new();
        assert!(!handle.is_bailed());
        let clone = handle.clone();
        clone.bail();
        assert!(handle.is_bailed());
    }

    #[test]
    fn test_queue_fifo() {
        let queue = CompilerWorkQueue::new(8, false);
        assert!(queue.submit(order_for(0x100)));
        assert!(queue.submit(order_for(0x200)));

        assert_eq!(queue.try_pop().unwrap().entry, BytecodeAddr(0x100));
        assert_eq!(queue.try_pop().unwrap().entry, BytecodeAddr(0x200));
        assert!(queue.try_pop().is_none());
    }

    #[test]
    fn test_queue_rejects_when_full() {
        let queue = CompilerWorkQueue::new(2, false);
        assert!(queue.submit(order_for(0x100)));
        assert!(queue.submit(order_for(0x200)));
        assert!(!queue.submit(order_for(0x300)));

        let (submitted, rejected, _) = queue.counters();
        assert_eq!(submitted, 2);
        assert_eq!(rejected, 1);
    }

    #[test]
    fn test_queue_rejects_after_shutdown() {
        let queue = CompilerWorkQueue::new(8, false);
        queue.shutdown();
        assert!(!queue.submit(order_for(0x100)));
        assert!(queue.wait_for_order().is_none());
    }

    #[test]
    fn test_wait_for_order_drains_before_shutdown_returns_none() {
        let queue = Arc::new(CompilerWorkQueue::new(8, false));
        queue.submit(order_for(0x100));
        queue.shutdown();

        // Pending order is still handed out before None.
        assert!(queue.wait_for_order().is_some());
        assert!(queue.wait_for_order().is_none());
    }

    #[test]
    fn test_blocking_submit_waits_for_drain() {
        let queue = Arc::new(CompilerWorkQueue::new(8, true));

        let consumer_queue = Arc::clone(&queue);
        let consumer = std::thread::spawn(move || {
            let mut order = consumer_queue.wait_for_order().unwrap();
            // Simulate processing, then release the producer.
            std::thread::sleep(std::time::Duration::from_millis(10));
            if let Some(latch) = order.latch.take() {
                latch.signal();
            }
        });

        let start = std::time::Instant::now();
        assert!(queue.submit(order_for(0x100)));
        // The producer cannot have returned before the consumer signaled.
        assert!(start.elapsed() >= std::time::Duration::from_millis(10));

        consumer.join().unwrap();
    }

    #[test]
    fn test_mode_order_shape() {
        let order = CompilerWorkOrder::mode_change(ProfileMode::Continuous);
        assert!(order.entry.is_none());
        assert!(matches!(
            order.kind,
            WorkOrderKind::ModeChange(ProfileMode::Continuous)
        ));
    }

    #[test]
    fn test_profile_mode_roundtrip() {
        for mode in [
            ProfileMode::Off,
            ProfileMode::Periodic,
            ProfileMode::Continuous,
        ] {
            assert_eq!(ProfileMode::from_u8(mode as u8), mode);
        }
    }
}
