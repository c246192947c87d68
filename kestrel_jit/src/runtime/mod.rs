//! JIT runtime integration: configuration and the long-lived services.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │                          JitRuntime                                 │
//! ├─────────────────────────────────────────────────────────────────────┤
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────┐              │
//! │  │ JitEntryTable│  │  CodeCache   │  │ WorkQueue +  │              │
//! │  │              │  │              │  │ CompilerThrd │              │
//! │  │ entry addr → │  │ translations │  │ background   │              │
//! │  │ compiled code│  │ + chaining   │  │ compilation  │              │
//! │  │ (lock-free)  │  │ cells        │  │ (1 consumer) │              │
//! │  └──────────────┘  └──────────────┘  └──────────────┘              │
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────┐              │
//! │  │ ThreshFilter │  │ PatchQueue   │  │  Safepoints  │              │
//! │  └──────────────┘  └──────────────┘  └──────────────┘              │
//! └─────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! One `JitRuntime` is constructed at VM start and passed by reference to
//! every thread; nothing in this crate is a process-wide global, so tests
//! run any number of independent instances.

pub mod code_cache;
pub mod compiler_thread;
pub mod entry_table;
pub mod memory;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};

use kestrel_core::JitResult;
use tracing::debug;

use crate::chain::predicted::{
    PredictedChainPatcher, PredictedOptions, PredictedPatchQueue,
};
use crate::safepoint::{SafepointCoordinator, SafepointStatsSnapshot};
use crate::trace::filter::{DEFAULT_FILTER_SIZE, TraceThresholdFilter};
use crate::trace::selector::OpcodeFilter;
use crate::verify::VerifyOptions;

pub use code_cache::{CodeCache, CodeCacheOptions, CodeCacheStats, InstalledTranslation};
pub use compiler_thread::{
    AbortHandle, CompilerHandle, CompilerStats, CompilerStatsSnapshot, CompilerThread,
    CompilerWorkOrder, CompilerWorkQueue, ProfileMode, WorkOrderKind, spawn_compiler,
};
pub use entry_table::{EntryHandle, EntryTableStats, JitEntryTable};

// =============================================================================
// Configuration
// =============================================================================

/// Configuration for the whole JIT core.
#[derive(Debug, Clone)]
pub struct JitConfig {
    /// Initial entry-table size (power of two).
    pub table_size: usize,
    /// Per-entry execution count before a trace is proposed.
    pub hotness_threshold: u32,
    /// Slots in the trace-admission recurrence filter.
    pub filter_size: usize,
    /// Seed for the filter's replacement RNG.
    pub filter_seed: u64,
    /// Maximum instructions per trace.
    pub max_trace_insns: u16,
    /// Maximum runs (code + metadata) per trace.
    pub max_trace_runs: usize,
    /// Compiler work-queue capacity.
    pub queue_capacity: usize,
    /// Blocking submission discipline (deterministic testing).
    pub blocking_queue: bool,
    /// Capacity of the deferred predicted-patch queue.
    pub patch_queue_capacity: usize,
    /// Code cache sizing and protection.
    pub code_cache: CodeCacheOptions,
    /// Predicted-chaining tuning.
    pub predicted: PredictedOptions,
    /// Shadow-verification tuning.
    pub verify: VerifyOptions,
    /// Run every compiled trace under shadow verification.
    pub self_verify: bool,
    /// Per-opcode include/exclude filter for debugging.
    pub opcode_filter: Option<OpcodeFilter>,
}

impl Default for JitConfig {
    fn default() -> Self {
        JitConfig {
            table_size: 1024,
            hotness_threshold: 40,
            filter_size: DEFAULT_FILTER_SIZE,
            filter_seed: 0x9E37_79B9_7F4A_7C15,
            max_trace_insns: 100,
            max_trace_runs: 8,
            queue_capacity: 100,
            blocking_queue: false,
            patch_queue_capacity: 16,
            code_cache: CodeCacheOptions::default(),
            predicted: PredictedOptions::default(),
            verify: VerifyOptions::default(),
            self_verify: false,
            opcode_filter: None,
        }
    }
}

impl JitConfig {
    /// Small deterministic limits for tests.
    pub fn for_testing() -> Self {
        JitConfig {
            table_size: 64,
            hotness_threshold: 2,
            filter_size: 8,
            filter_seed: 0x1234_5678,
            max_trace_insns: 16,
            max_trace_runs: 8,
            queue_capacity: 8,
            blocking_queue: false,
            patch_queue_capacity: 4,
            code_cache: CodeCacheOptions::for_testing(),
            predicted: PredictedOptions {
                delay: 8,
                repeat: 1,
                defer_repatch: true,
            },
            verify: VerifyOptions::for_testing(),
            self_verify: false,
            opcode_filter: None,
        }
    }
}

// =============================================================================
// Runtime
// =============================================================================

/// The long-lived JIT services, constructed once at VM start.
pub struct JitRuntime {
    config: JitConfig,
    safepoints: Arc<SafepointCoordinator>,
    entry_table: JitEntryTable,
    code_cache: CodeCache,
    queue: CompilerWorkQueue,
    filter: TraceThresholdFilter,
    patch_queue: PredictedPatchQueue,
    profile_mode: AtomicU8,
    debug_active: AtomicBool,
    compiler_stats: CompilerStats,
}

impl JitRuntime {
    /// Build the runtime from a configuration.
    pub fn new(config: JitConfig) -> JitResult<Self> {
        let safepoints = Arc::new(SafepointCoordinator::new());
        let code_cache = CodeCache::new(config.code_cache.clone(), Arc::clone(&safepoints))?;
        Ok(JitRuntime {
            entry_table: JitEntryTable::new(config.table_size),
            queue: CompilerWorkQueue::new(config.queue_capacity, config.blocking_queue),
            filter: TraceThresholdFilter::new(config.filter_size, config.filter_seed),
            patch_queue: PredictedPatchQueue::new(config.patch_queue_capacity),
            profile_mode: AtomicU8::new(ProfileMode::Periodic as u8),
            debug_active: AtomicBool::new(false),
            compiler_stats: CompilerStats::default(),
            code_cache,
            safepoints,
            config,
        })
    }

    /// Runtime with the testing configuration.
    pub fn for_testing() -> Self {
        Self::new(JitConfig::for_testing()).expect("test runtime construction")
    }

    /// The configuration this runtime was built from.
    #[inline]
    pub fn config(&self) -> &JitConfig {
        &self.config
    }

    /// The entry table.
    #[inline]
    pub fn entry_table(&self) -> &JitEntryTable {
        &self.entry_table
    }

    /// The code cache.
    #[inline]
    pub fn code_cache(&self) -> &CodeCache {
        &self.code_cache
    }

    /// The compiler work queue.
    #[inline]
    pub fn queue(&self) -> &CompilerWorkQueue {
        &self.queue
    }

    /// The trace-admission filter.
    #[inline]
    pub fn filter(&self) -> &TraceThresholdFilter {
        &self.filter
    }

    /// The deferred predicted-patch queue.
    #[inline]
    pub fn patch_queue(&self) -> &PredictedPatchQueue {
        &self.patch_queue
    }

    /// The stop-the-world coordinator.
    #[inline]
    pub fn safepoints(&self) -> &Arc<SafepointCoordinator> {
        &self.safepoints
    }

    /// Compiler-thread counters.
    #[inline]
    pub fn compiler_stats(&self) -> &CompilerStats {
        &self.compiler_stats
    }

    /// A patcher bound to this runtime's cache, table and patch queue.
    pub fn predicted_patcher(&self) -> PredictedChainPatcher<'_> {
        PredictedChainPatcher::new(
            &self.code_cache,
            &self.entry_table,
            &self.patch_queue,
            self.config.predicted.clone(),
        )
    }

    /// Current trace-profiling mode.
    pub fn profile_mode(&self) -> ProfileMode {
        ProfileMode::from_u8(self.profile_mode.load(Ordering::Acquire))
    }

    /// Switch the trace-profiling mode (applied by mode-change orders).
    pub fn set_profile_mode(&self, mode: ProfileMode) {
        self.profile_mode.store(mode as u8, Ordering::Release);
    }

    /// Whether a debugger/profiler is active.
    #[inline]
    pub fn debug_active(&self) -> bool {
        self.debug_active.load(Ordering::Acquire)
    }

    /// Toggle debugger activity. Attaching reverts every chaining cell so
    /// control flow returns to the interpreter at trace exits.
    pub fn set_debug_active(&self, active: bool) {
        let was = self.debug_active.swap(active, Ordering::AcqRel);
        if active && !was {
            debug!("debugger attached; unchaining all translations");
            if let Err(err) = self.code_cache.unchain_all() {
                debug!(%err, "unchain-all failed");
            }
        }
    }

    /// Apply all deferred predicted-cell rebinds (safepoint hook).
    pub fn drain_patch_queue(&self) -> JitResult<usize> {
        self.patch_queue.drain(&self.code_cache)
    }

    /// Wipe the code cache, the entry table, the admission filter and the
    /// deferred patch queue. The only recovery from a full cache.
    pub fn reset_code_cache(&self) -> JitResult<()> {
        self.patch_queue.clear();
        self.code_cache.reset(&self.entry_table)?;
        self.filter.reset();
        Ok(())
    }

    /// Aggregate statistics snapshot.
    pub fn stats(&self) -> JitStats {
        let (submitted, rejected, drained) = self.queue.counters();
        JitStats {
            entry_table: self.entry_table.stats(),
            code_cache: self.code_cache.stats(),
            compiler: self.compiler_stats.snapshot(),
            safepoints: self.safepoints.stats(),
            queue_submitted: submitted,
            queue_rejected: rejected,
            queue_drained: drained,
        }
    }
}

// =============================================================================
// Statistics
// =============================================================================

/// Aggregate point-in-time statistics for the whole JIT core.
#[derive(Debug, Clone, Copy, Default)]
pub struct JitStats {
    /// Entry-table statistics.
    pub entry_table: EntryTableStats,
    /// Code-cache statistics.
    pub code_cache: CodeCacheStats,
    /// Compiler-thread statistics.
    pub compiler: CompilerStatsSnapshot,
    /// Safepoint statistics.
    pub safepoints: SafepointStatsSnapshot,
    /// Work orders accepted.
    pub queue_submitted: u64,
    /// Work orders rejected (queue full or shut down).
    pub queue_rejected: u64,
    /// Work orders processed by the compiler thread.
    pub queue_drained: u64,
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = JitConfig::default();
        assert_eq!(config.table_size, 1024);
        assert_eq!(config.hotness_threshold, 40);
        assert_eq!(config.queue_capacity, 100);
        assert!(!config.blocking_queue);
        assert!(!config.self_verify);
        assert!(config.code_cache.protect_code);
    }

    #[test]
    fn test_testing_config() {
        let config = JitConfig::for_testing();
        assert_eq!(config.table_size, 64);
        assert_eq!(config.hotness_threshold, 2);
        assert!(!config.code_cache.protect_code);
        assert!(!config.verify.halt_on_divergence);
    }

    #[test]
    fn test_runtime_construction() {
        let rt = JitRuntime::for_testing();
        assert_eq!(rt.entry_table().capacity(), 64);
        assert_eq!(rt.queue().capacity(), 8);
        assert_eq!(rt.profile_mode(), ProfileMode::Periodic);
        assert!(!rt.debug_active());
        assert!(!rt.code_cache().is_full());
    }

    #[test]
    fn test_profile_mode_switch() {
        let rt = JitRuntime::for_testing();
        rt.set_profile_mode(ProfileMode::Continuous);
        assert_eq!(rt.profile_mode(), ProfileMode::Continuous);
        rt.set_profile_mode(ProfileMode::Off);
        assert_eq!(rt.profile_mode(), ProfileMode::Off);
    }

    #[test]
    fn test_debugger_attach_unchains() {
        let rt = JitRuntime::for_testing();
        rt.set_debug_active(true);
        assert!(rt.debug_active());
        // Toggling again is a no-op (no second unchain pass).
        rt.set_debug_active(true);
        rt.set_debug_active(false);
        assert!(!rt.debug_active());
    }

    #[test]
    fn test_stats_snapshot_shape() {
        let rt = JitRuntime::for_testing();
        rt.entry_table().find_or_create(kestrel_core::BytecodeAddr(0x10)).unwrap();
        let stats = rt.stats();
        assert_eq!(stats.entry_table.entries, 1);
        assert_eq!(stats.queue_submitted, 0);
        assert_eq!(stats.code_cache.installs, 0);
    }
}
