//! GC Control Switch
//!
//! The only writer of the collector's disabled flag. Also hosts the protection
//! arena and the registered-root table that keep host-held references alive.

use std::ops::{Deref, DerefMut};

use super::error::{BridgeError, BridgeResult};
use super::value::Value;
use crate::vm::value::RawValue;
use crate::vm::{Engine, Unwind};

/// Position in the GC arena, returned by `arena_save`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct ArenaIndex(usize);

/// Snapshot of collector state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GcStats {
    pub live: usize,
    pub collections: u64,
    /// Live count that triggers the next automatic collection.
    pub threshold: usize,
    pub arena: usize,
    pub registered: usize,
    pub disabled: bool,
}

impl Engine {
    /// Suppress every collection until `enable_gc`.
    ///
    /// The flag is a plain toggle: two disables are undone by one enable.
    pub fn disable_gc(&mut self) {
        self.gc.disabled = true;
    }

    pub fn enable_gc(&mut self) {
        self.gc.disabled = false;
    }

    pub fn gc_disabled(&self) -> bool {
        self.gc.disabled
    }

    /// Number of objects the collector currently tracks.
    pub fn live_count(&self) -> usize {
        self.heap.live()
    }

    /// Run a full collection now. A no-op returning 0 while GC is disabled.
    pub fn full_gc(&mut self) -> usize {
        if self.gc.disabled {
            log::debug!("full gc requested while disabled; skipped");
            return 0;
        }
        self.collect()
    }

    /// Disable collection for the lifetime of the returned guard.
    pub fn pause_gc(&mut self) -> GcPause<'_> {
        GcPause::new(self)
    }

    // =========================================================================
    // Protection
    // =========================================================================

    /// Pin `value` in the arena until the arena is restored below it.
    pub fn gc_protect(&mut self, value: Value) {
        self.arena_push(value.to_raw());
    }

    pub fn arena_save(&self) -> ArenaIndex {
        log::trace!("arena save at {}", self.gc.arena.len());
        ArenaIndex(self.gc.arena.len())
    }

    /// Release every value pinned since `index` was saved.
    pub fn arena_restore(&mut self, index: ArenaIndex) {
        log::trace!("arena restore {} -> {}", self.gc.arena.len(), index.0);
        self.gc.arena.truncate(index.0);
    }

    /// Root `value` until a matching `unregister`. Registrations nest.
    pub fn register(&mut self, value: Value) -> BridgeResult<()> {
        self.check_live(value)?;
        if value.is_immediate() {
            return Ok(());
        }
        *self.gc.roots.entry(value.to_raw()).or_insert(0) += 1;
        Ok(())
    }

    /// Drop one registration. Returns false if the value was not registered.
    pub fn unregister(&mut self, value: Value) -> bool {
        let raw = value.to_raw();
        match self.gc.roots.get_mut(&raw) {
            Some(count) if *count > 1 => {
                *count -= 1;
                true
            }
            Some(_) => {
                self.gc.roots.remove(&raw);
                true
            }
            None => false,
        }
    }

    pub fn gc_stats(&self) -> GcStats {
        GcStats {
            live: self.heap.live(),
            collections: self.gc.collections,
            threshold: self.gc.threshold,
            arena: self.gc.arena.len(),
            registered: self.gc.roots.len(),
            disabled: self.gc.disabled,
        }
    }

    /// Run an allocating engine operation on behalf of host code.
    ///
    /// Heap exhaustion surfaces as `BridgeError::HeapExhausted` instead of a
    /// pending `NoMemoryError`.
    pub(crate) fn host_alloc(
        &mut self,
        op: impl FnOnce(&mut Engine) -> Result<RawValue, Unwind>,
    ) -> BridgeResult<Value> {
        match op(self) {
            Ok(raw) => Ok(Value::from_raw(raw)),
            Err(Unwind::Raise(exc)) if exc == self.nomem_err => {
                self.exc = RawValue::nil();
                Err(BridgeError::HeapExhausted {
                    live: self.heap.live(),
                })
            }
            Err(Unwind::Raise(exc)) => {
                let caught = self.capture_exception(exc);
                self.exc = RawValue::nil();
                Err(BridgeError::Raised(caught))
            }
            Err(Unwind::Break { .. } | Unwind::Return { .. }) => {
                Err(BridgeError::host("unexpected non-local exit during allocation"))
            }
        }
    }
}

/// Scoped GC pause. Disables collection on creation and puts the flag back
/// to its previous value on drop.
pub struct GcPause<'a> {
    engine: &'a mut Engine,
    previous: bool,
}

impl<'a> GcPause<'a> {
    pub fn new(engine: &'a mut Engine) -> Self {
        let previous = engine.gc.disabled;
        engine.gc.disabled = true;
        log::trace!("gc paused (was disabled: {})", previous);
        Self { engine, previous }
    }
}

impl Deref for GcPause<'_> {
    type Target = Engine;

    fn deref(&self) -> &Engine {
        self.engine
    }
}

impl DerefMut for GcPause<'_> {
    fn deref_mut(&mut self) -> &mut Engine {
        self.engine
    }
}

impl Drop for GcPause<'_> {
    fn drop(&mut self) {
        self.engine.gc.disabled = self.previous;
        log::trace!("gc pause released (disabled: {})", self.previous);
    }
}
