//! The code cache: a fixed-capacity executable arena for translations.
//!
//! Installed translations are never individually freed. The cache
//! bump-allocates until capacity is exhausted, at which point a sticky
//! "full" flag stops all further compilation until an explicit [`reset`]
//! wipes the cache and the entry table together.
//!
//! Each translation is written in one contiguous block:
//!
//! ```text
//! ┌──────────────┬──────────────┬───────────────┬──────────┬───────────┐
//! │   header     │  code body   │ chaining cells│ literals │ trace runs│
//! │  (counts)    │              │  (aligned)    │          │ (records) │
//! └──────────────┴──────────────┴───────────────┴──────────┴───────────┘
//! ```
//!
//! Mutation discipline: installs and patches serialize on the cache lock,
//! with the region temporarily writable. Patches that cannot be applied
//! as a single aligned word write additionally stop the world first.
//!
//! [`reset`]: CodeCache::reset

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering, fence};

use kestrel_core::{BytecodeAddr, CodeAddr, JitError, JitResult};
use parking_lot::{Mutex, MutexGuard};
use tracing::{debug, warn};

use crate::chain::{CELL_BYTES, ChainingCell};
use crate::codegen::Translation;
use crate::runtime::entry_table::JitEntryTable;
use crate::runtime::memory::ExecutableRegion;
use crate::safepoint::{SafepointCoordinator, WorldStoppedGuard};
use crate::trace::{JitTraceDescription, TraceRun};

/// Allocation granularity inside the cache.
const ALLOC_ALIGN: usize = 16;

/// Words per flattened trace-run record.
const RUN_RECORD_WORDS: usize = 3;

// =============================================================================
// Options
// =============================================================================

/// Construction options for the code cache.
#[derive(Debug, Clone)]
pub struct CodeCacheOptions {
    /// Arena capacity in bytes (rounded up to a page).
    pub capacity: usize,
    /// Keep the region execute-only between mutations (W^X).
    pub protect_code: bool,
    /// Whether a branch rewrite is a single atomic word store on this
    /// target. When false, every cell patch stops the world first.
    pub atomic_branch_patch: bool,
    /// Delay counter installed into predicted cells on unchain.
    pub rechain_delay: u32,
}

impl Default for CodeCacheOptions {
    fn default() -> Self {
        CodeCacheOptions {
            capacity: 1024 * 1024,
            protect_code: true,
            atomic_branch_patch: true,
            rechain_delay: 16,
        }
    }
}

impl CodeCacheOptions {
    /// Small, unprotected cache for tests.
    pub fn for_testing() -> Self {
        CodeCacheOptions {
            capacity: 64 * 1024,
            protect_code: false,
            atomic_branch_patch: true,
            rechain_delay: 4,
        }
    }
}

// =============================================================================
// Translation layout
// =============================================================================

/// Per-translation header written at the start of its block.
#[repr(C)]
struct TranslationHeader {
    code_len: u32,
    cell_count: u32,
    literal_count: u32,
    run_count: u32,
}

const HEADER_BYTES: usize = std::mem::size_of::<TranslationHeader>();

/// Registry record for one installed translation.
#[derive(Debug, Clone, Copy)]
struct InstallRecord {
    entry: BytecodeAddr,
    code_addr: CodeAddr,
    code_len: usize,
    cells_offset: usize,
    cell_count: usize,
}

/// Borrowed view of one installed translation.
#[derive(Clone, Copy)]
pub struct InstalledTranslation<'c> {
    cache: &'c CodeCache,
    record: InstallRecord,
}

impl<'c> InstalledTranslation<'c> {
    /// Entry point of the installed code.
    #[inline]
    pub fn entry_point(&self) -> CodeAddr {
        self.record.code_addr
    }

    /// Bytecode entry address this translation was compiled for.
    #[inline]
    pub fn entry_addr(&self) -> BytecodeAddr {
        self.record.entry
    }

    /// Length of the installed code body.
    #[inline]
    pub fn code_len(&self) -> usize {
        self.record.code_len
    }

    /// The translation's chaining cells.
    pub fn cells(&self) -> &'c [ChainingCell] {
        let base = self.cache.region.base() as usize + self.record.cells_offset;
        // SAFETY: the cells were laid out at this aligned offset by
        // install and live as long as the cache (never individually
        // freed); all cell fields are atomics.
        unsafe {
            std::slice::from_raw_parts(base as *const ChainingCell, self.record.cell_count)
        }
    }
}

// =============================================================================
// Code Cache
// =============================================================================

/// The append-only executable arena plus its install registry.
pub struct CodeCache {
    region: ExecutableRegion,
    options: CodeCacheOptions,
    safepoints: Arc<SafepointCoordinator>,
    /// Bytes handed out; monotonically increasing until reset.
    used: AtomicUsize,
    /// Sticky capacity-exhausted flag.
    full: AtomicBool,
    /// Serializes installs and patches.
    lock: Mutex<()>,
    /// Installed translations, for unchain-all and diagnostics.
    installs: Mutex<Vec<InstallRecord>>,
    installs_count: AtomicU64,
    bytes_installed: AtomicU64,
    patches: AtomicU64,
    unchains: AtomicU64,
    resets: AtomicU64,
}

impl CodeCache {
    /// Create a cache with the given options.
    pub fn new(options: CodeCacheOptions, safepoints: Arc<SafepointCoordinator>) -> JitResult<Self> {
        let region = ExecutableRegion::new(options.capacity)?;
        if options.protect_code {
            region.make_executable()?;
        }
        Ok(CodeCache {
            region,
            options,
            safepoints,
            used: AtomicUsize::new(0),
            full: AtomicBool::new(false),
            lock: Mutex::new(()),
            installs: Mutex::new(Vec::new()),
            installs_count: AtomicU64::new(0),
            bytes_installed: AtomicU64::new(0),
            patches: AtomicU64::new(0),
            unchains: AtomicU64::new(0),
            resets: AtomicU64::new(0),
        })
    }

    /// Arena capacity in bytes.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.region.capacity()
    }

    /// Bytes allocated so far.
    #[inline]
    pub fn bytes_used(&self) -> usize {
        self.used.load(Ordering::Acquire)
    }

    /// Whether the sticky full flag is set.
    #[inline]
    pub fn is_full(&self) -> bool {
        self.full.load(Ordering::Acquire)
    }

    /// Number of installed translations.
    pub fn installed_count(&self) -> usize {
        self.installs.lock().len()
    }

    /// Bump-allocate `size` bytes.
    ///
    /// On overflow the sticky full flag is set and the caller must treat
    /// the failure as "stop compiling", not retry.
    pub fn allocate(&self, size: usize) -> JitResult<usize> {
        let _guard = self.lock.lock();
        self.allocate_locked(size)
    }

    fn allocate_locked(&self, size: usize) -> JitResult<usize> {
        let size = align_up(size, ALLOC_ALIGN);
        let capacity = self.region.capacity();
        let used = self.used.load(Ordering::Relaxed);

        if self.full.load(Ordering::Relaxed) || used + size > capacity {
            if !self.full.swap(true, Ordering::AcqRel) {
                warn!(
                    requested = size,
                    used, capacity, "code cache exhausted; halting new translations"
                );
            }
            return Err(JitError::CodeCacheFull {
                requested: size,
                available: capacity - used,
                capacity,
            });
        }

        self.used.store(used + size, Ordering::Release);
        Ok(used)
    }

    /// Install a fully-assembled translation.
    ///
    /// Copies header, code body, chaining cells, literal pool and the
    /// flattened trace description into the cache in one contiguous write
    /// while the region is temporarily writable, then restores protection.
    pub fn install(
        &self,
        translation: &Translation,
        trace: &JitTraceDescription,
    ) -> JitResult<InstalledTranslation<'_>> {
        let guard = self.lock.lock();

        let code_len = translation.code.len();
        let cells_offset_rel = align_up(HEADER_BYTES + code_len, ALLOC_ALIGN);
        let literals_offset_rel = cells_offset_rel + translation.cells.len() * CELL_BYTES;
        let runs_offset_rel =
            literals_offset_rel + translation.literals.len() * std::mem::size_of::<usize>();
        let total = runs_offset_rel
            + trace.run_count() * RUN_RECORD_WORDS * std::mem::size_of::<usize>();

        let block = self.allocate_locked(total)?;
        let base = self.region.base() as usize + block;

        if self.options.protect_code {
            self.region.make_writable()?;
        }

        // SAFETY: [base, base+total) was just reserved by allocate_locked,
        // lies inside the mapped region, and the region is writable here;
        // the cache lock serializes all writers.
        unsafe {
            let header = base as *mut TranslationHeader;
            header.write(TranslationHeader {
                code_len: code_len as u32,
                cell_count: translation.cells.len() as u32,
                literal_count: translation.literals.len() as u32,
                run_count: trace.run_count() as u32,
            });

            std::ptr::copy_nonoverlapping(
                translation.code.as_ptr(),
                (base + HEADER_BYTES) as *mut u8,
                code_len,
            );

            let cells = (base + cells_offset_rel) as *const ChainingCell;
            for (i, site) in translation.cells.iter().enumerate() {
                (*cells.add(i)).init(site.kind, site.callee);
            }

            let literals = (base + literals_offset_rel) as *mut usize;
            for (i, &value) in translation.literals.iter().enumerate() {
                literals.add(i).write(value);
            }

            let runs = (base + runs_offset_rel) as *mut usize;
            for (i, run) in trace.runs().iter().enumerate() {
                let [a, b, c] = encode_run(run);
                runs.add(i * RUN_RECORD_WORDS).write(a);
                runs.add(i * RUN_RECORD_WORDS + 1).write(b);
                runs.add(i * RUN_RECORD_WORDS + 2).write(c);
            }
        }

        if self.options.protect_code {
            self.region.make_executable()?;
        }
        fence(Ordering::SeqCst);

        let record = InstallRecord {
            entry: trace.entry(),
            code_addr: CodeAddr(base + HEADER_BYTES + translation.entry_offset),
            code_len,
            cells_offset: block + cells_offset_rel,
            cell_count: translation.cells.len(),
        };
        self.installs.lock().push(record);
        self.installs_count.fetch_add(1, Ordering::Relaxed);
        self.bytes_installed.fetch_add(total as u64, Ordering::Relaxed);
        drop(guard);

        debug!(
            entry = %trace.entry(),
            code = %record.code_addr,
            bytes = total,
            cells = record.cell_count,
            "installed translation"
        );
        Ok(InstalledTranslation {
            cache: self,
            record,
        })
    }

    /// Find the installed translation whose code body contains `addr`.
    pub fn find_by_code(&self, addr: CodeAddr) -> Option<InstalledTranslation<'_>> {
        let installs = self.installs.lock();
        installs
            .iter()
            .find(|r| addr.0 >= r.code_addr.0 && addr.0 < r.code_addr.0 + r.code_len.max(1))
            .map(|record| InstalledTranslation {
                cache: self,
                record: *record,
            })
    }

    // =========================================================================
    // Patch operations
    // =========================================================================

    /// Open a patch session: cache lock held, region writable.
    pub(crate) fn begin_patch(&self) -> JitResult<PatchSession<'_>> {
        let guard = self.lock.lock();
        if self.options.protect_code {
            self.region.make_writable()?;
        }
        Ok(PatchSession {
            cache: self,
            _world: None,
            _guard: guard,
        })
    }

    /// Open a patch session under a stop-the-world.
    pub(crate) fn begin_patch_stopped(&self) -> JitResult<PatchSession<'_>> {
        // World first, lock second: nothing may hold the cache lock while
        // waiting for threads to park.
        let world = self.safepoints.stop_the_world();
        let guard = self.lock.lock();
        if self.options.protect_code {
            self.region.make_writable()?;
        }
        Ok(PatchSession {
            cache: self,
            _world: Some(world),
            _guard: guard,
        })
    }

    /// Session for a branch-word rewrite, stopping the world when the
    /// target cannot patch a branch atomically.
    pub(crate) fn begin_branch_patch(&self) -> JitResult<PatchSession<'_>> {
        if self.options.atomic_branch_patch {
            self.begin_patch()
        } else {
            self.begin_patch_stopped()
        }
    }

    /// Rewrite a non-predicted cell to branch directly to compiled code.
    pub fn patch_cell(&self, cell: &ChainingCell, target: CodeAddr) -> JitResult<()> {
        if cell.kind().is_predicted() {
            return Err(JitError::Protocol(
                "predicted cells are patched through the predicted-chain patcher".into(),
            ));
        }
        if target.is_none() {
            return Err(JitError::Protocol("patch target is null".into()));
        }
        let session = self.begin_branch_patch()?;
        cell.set_branch(target);
        drop(session);
        self.patches.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Revert a cell to its interpreter-reentry state.
    pub fn unchain_cell(&self, cell: &ChainingCell) -> JitResult<()> {
        let session = self.begin_branch_patch()?;
        cell.unchain(self.options.rechain_delay);
        drop(session);
        self.unchains.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Revert every chaining cell of every installed translation.
    ///
    /// Used when invalidating the cache, when a debugger attaches, and
    /// before a full table reset. Runs under a stop-the-world.
    pub fn unchain_all(&self) -> JitResult<usize> {
        let session = self.begin_patch_stopped()?;
        let mut reverted = 0;
        let installs = self.installs.lock();
        for record in installs.iter() {
            let base = self.region.base() as usize + record.cells_offset;
            // SAFETY: same layout argument as InstalledTranslation::cells.
            let cells = unsafe {
                std::slice::from_raw_parts(base as *const ChainingCell, record.cell_count)
            };
            for cell in cells {
                cell.unchain(self.options.rechain_delay);
                reverted += 1;
            }
        }
        drop(installs);
        drop(session);
        self.unchains.fetch_add(reverted as u64, Ordering::Relaxed);
        debug!(cells = reverted, "unchained all translations");
        Ok(reverted)
    }

    /// Wipe the cache and the entry table.
    ///
    /// The only way to recover from the sticky full flag. Stops the world:
    /// every published code address dangles the moment the arena resets.
    pub fn reset(&self, table: &JitEntryTable) -> JitResult<()> {
        let _world = self.safepoints.stop_the_world();
        let _guard = self.lock.lock();

        self.installs.lock().clear();
        self.used.store(0, Ordering::Release);
        self.full.store(false, Ordering::Release);
        table.reset();
        self.resets.fetch_add(1, Ordering::Relaxed);

        debug!("code cache and entry table reset");
        Ok(())
    }

    /// Snapshot of cache statistics.
    pub fn stats(&self) -> CodeCacheStats {
        CodeCacheStats {
            capacity: self.region.capacity(),
            bytes_used: self.used.load(Ordering::Relaxed),
            installs: self.installs_count.load(Ordering::Relaxed),
            bytes_installed: self.bytes_installed.load(Ordering::Relaxed),
            patches: self.patches.load(Ordering::Relaxed),
            unchains: self.unchains.load(Ordering::Relaxed),
            resets: self.resets.load(Ordering::Relaxed),
            full: self.full.load(Ordering::Relaxed),
        }
    }

    pub(crate) fn note_patch(&self) {
        self.patches.fetch_add(1, Ordering::Relaxed);
    }
}

/// An open patch window: cache lock held, region writable; restores
/// protection on drop.
pub(crate) struct PatchSession<'c> {
    cache: &'c CodeCache,
    _world: Option<WorldStoppedGuard<'c>>,
    _guard: MutexGuard<'c, ()>,
}

impl Drop for PatchSession<'_> {
    fn drop(&mut self) {
        if self.cache.options.protect_code {
            // Failure to reprotect is not recoverable mid-drop; the next
            // session will retry the toggle.
            let _ = self.cache.region.make_executable();
        }
        fence(Ordering::SeqCst);
    }
}

#[inline]
fn align_up(value: usize, align: usize) -> usize {
    (value + align - 1) & !(align - 1)
}

fn encode_run(run: &TraceRun) -> [usize; 3] {
    match run {
        TraceRun::Code(code) => [
            0,
            code.start.0,
            usize::from(code.insn_count) | (usize::from(code.is_last) << 16),
        ],
        TraceRun::Meta(callee) => [1, callee.class.0, callee.method.0],
    }
}

// =============================================================================
// Statistics
// =============================================================================

/// Snapshot of code-cache statistics.
#[derive(Debug, Clone, Copy, Default)]
pub struct CodeCacheStats {
    /// Arena capacity in bytes.
    pub capacity: usize,
    /// Bytes allocated from the arena.
    pub bytes_used: usize,
    /// Translations installed since the last reset.
    pub installs: u64,
    /// Total bytes written by installs.
    pub bytes_installed: u64,
    /// Individual cell patches applied.
    pub patches: u64,
    /// Cells reverted to interpreter reentry.
    pub unchains: u64,
    /// Wholesale resets performed.
    pub resets: u64,
    /// Whether the sticky full flag is currently set.
    pub full: bool,
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::CellKind;
    use crate::codegen::CellSite;
    use kestrel_core::InstructionSet;

    fn cache() -> CodeCache {
        CodeCache::new(
            CodeCacheOptions {
                capacity: 8 * 1024,
                protect_code: false,
                atomic_branch_patch: true,
                rechain_delay: 4,
            },
            Arc::new(SafepointCoordinator::new()),
        )
        .unwrap()
    }

    fn translation(code_len: usize, cells: Vec<CellSite>) -> (Translation, JitTraceDescription) {
        let mut trace = JitTraceDescription::new(BytecodeAddr(0x100));
        trace.open_run(BytecodeAddr(0x100));
        trace.seal().unwrap();
        (
            Translation {
                code: vec![0xAA; code_len],
                entry_offset: 0,
                cells,
                literals: vec![0x1111, 0x2222],
                isa: InstructionSet::Portable,
            },
            trace,
        )
    }

    #[test]
    fn test_install_and_read_back() {
        let cache = cache();
        let (t, trace) = translation(32, vec![CellSite::of(CellKind::Normal)]);

        let installed = cache.install(&t, &trace).unwrap();
        assert_eq!(installed.code_len(), 32);
        assert_eq!(installed.entry_addr(), BytecodeAddr(0x100));

        // Code body copied intact.
        let code = installed.entry_point().0 as *const u8;
        for i in 0..32 {
            // SAFETY: reading back the bytes just installed.
            assert_eq!(unsafe { *code.add(i) }, 0xAA);
        }

        let cells = installed.cells();
        assert_eq!(cells.len(), 1);
        assert!(cells[0].is_unchained());
        assert_eq!(cells[0].kind(), CellKind::Normal);
    }

    #[test]
    fn test_allocate_full_is_sticky() {
        let cache = cache();
        let capacity = cache.capacity();

        // Fill to capacity minus a sliver.
        cache.allocate(capacity - ALLOC_ALIGN).unwrap();
        assert!(!cache.is_full());

        // Two more bytes than remain: full, and sticky from then on.
        let err = cache.allocate(ALLOC_ALIGN * 2).unwrap_err();
        assert!(matches!(err, JitError::CodeCacheFull { .. }));
        assert!(cache.is_full());

        // Even a request that would have fit is now refused.
        assert!(cache.allocate(1).is_err());
        let used_after = cache.bytes_used();

        // No further bytes are handed out.
        assert!(cache.allocate(1).is_err());
        assert_eq!(cache.bytes_used(), used_after);
    }

    #[test]
    fn test_reset_clears_cache_and_table() {
        let cache = cache();
        let table = JitEntryTable::new(16);
        let (t, trace) = translation(16, vec![]);

        let installed = cache.install(&t, &trace).unwrap();
        let entry = table.find_or_create(BytecodeAddr(0x100)).unwrap();
        entry.set_code_address(installed.entry_point(), InstructionSet::Portable);

        // Exhaust and verify sticky.
        let _ = cache.allocate(cache.capacity());
        assert!(cache.is_full());

        cache.reset(&table).unwrap();

        assert_eq!(cache.bytes_used(), 0);
        assert!(!cache.is_full());
        assert_eq!(cache.installed_count(), 0);
        assert!(table.lookup(BytecodeAddr(0x100)).is_none());
        assert_eq!(table.entry_count(), 0);
    }

    #[test]
    fn test_patch_and_unchain_cell() {
        let cache = cache();
        let (t, trace) = translation(16, vec![CellSite::of(CellKind::BackwardBranch)]);
        let installed = cache.install(&t, &trace).unwrap();
        let cell = &installed.cells()[0];

        cache.patch_cell(cell, CodeAddr(0xD00D)).unwrap();
        assert_eq!(cell.branch_target(), Some(CodeAddr(0xD00D)));

        cache.unchain_cell(cell).unwrap();
        assert!(cell.is_unchained());

        let stats = cache.stats();
        assert_eq!(stats.patches, 1);
        assert_eq!(stats.unchains, 1);
    }

    #[test]
    fn test_patch_cell_rejects_predicted_kind() {
        let cache = cache();
        let (t, trace) = translation(16, vec![CellSite::of(CellKind::InvokePredicted)]);
        let installed = cache.install(&t, &trace).unwrap();

        let err = cache
            .patch_cell(&installed.cells()[0], CodeAddr(0x1000))
            .unwrap_err();
        assert!(matches!(err, JitError::Protocol(_)));
    }

    #[test]
    fn test_unchain_all_reverts_every_cell() {
        let cache = cache();
        let mut patched = Vec::new();
        for _ in 0..3 {
            let (t, trace) = translation(
                16,
                vec![
                    CellSite::of(CellKind::Normal),
                    CellSite::of(CellKind::Hot),
                ],
            );
            let installed = cache.install(&t, &trace).unwrap();
            for cell in installed.cells() {
                cache.patch_cell(cell, CodeAddr(0xF00)).unwrap();
            }
            patched.push(installed);
        }

        let reverted = cache.unchain_all().unwrap();
        assert_eq!(reverted, 6);
        for installed in &patched {
            for cell in installed.cells() {
                assert!(cell.is_unchained());
            }
        }
    }

    #[test]
    fn test_find_by_code() {
        let cache = cache();
        let (t, trace) = translation(64, vec![]);
        let installed = cache.install(&t, &trace).unwrap();

        let mid = CodeAddr(installed.entry_point().0 + 10);
        let found = cache.find_by_code(mid).unwrap();
        assert_eq!(found.entry_addr(), BytecodeAddr(0x100));

        assert!(cache.find_by_code(CodeAddr(0x1)).is_none());
    }

    #[cfg(unix)]
    #[test]
    fn test_install_with_protection_enabled() {
        let cache = CodeCache::new(
            CodeCacheOptions {
                capacity: 8 * 1024,
                protect_code: true,
                atomic_branch_patch: true,
                rechain_delay: 4,
            },
            Arc::new(SafepointCoordinator::new()),
        )
        .unwrap();

        let (t, trace) = translation(32, vec![CellSite::of(CellKind::Normal)]);
        let installed = cache.install(&t, &trace).unwrap();

        // Region is execute-only between mutations but still readable.
        let code = installed.entry_point().0 as *const u8;
        // SAFETY: address points at installed code inside the live region.
        assert_eq!(unsafe { *code }, 0xAA);

        // Patching toggles writability transparently.
        let cell = &installed.cells()[0];
        cache.patch_cell(cell, CodeAddr(0xABC0)).unwrap();
        assert_eq!(cell.branch_target(), Some(CodeAddr(0xABC0)));
    }
}
