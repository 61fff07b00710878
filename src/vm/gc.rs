//! Mark & sweep collector
//!
//! Stop-the-world and non-incremental. A collection runs only from `alloc`
//! (when the live count crosses the threshold) or from an explicit full GC,
//! and never while the disabled flag is set.

use std::collections::HashMap;

use super::heap::HeapConfig;
use super::value::{ObjPtr, RawValue};
use super::Engine;

pub struct GcState {
    /// Suppresses every collection while set.
    pub(crate) disabled: bool,
    /// Live count that triggers the next automatic collection.
    pub(crate) threshold: usize,
    base_threshold: usize,
    growth_percent: usize,
    /// Values pinned until the arena is restored below them.
    pub(crate) arena: Vec<RawValue>,
    /// Host-registered roots with their registration counts.
    pub(crate) roots: HashMap<RawValue, usize>,
    pub(crate) collections: u64,
    arena_warned: bool,
}

impl GcState {
    pub fn new(config: &HeapConfig) -> Self {
        Self {
            disabled: false,
            threshold: config.gc_threshold.max(1),
            base_threshold: config.gc_threshold.max(1),
            growth_percent: config.gc_growth_percent.max(100),
            arena: Vec::new(),
            roots: HashMap::new(),
            collections: 0,
            arena_warned: false,
        }
    }
}

impl Engine {
    pub(crate) fn arena_push(&mut self, v: RawValue) {
        if !v.is_object() {
            return;
        }
        self.gc.arena.push(v);
        if self.gc.arena.len() >= self.config.arena_warn_size && !self.gc.arena_warned {
            self.gc.arena_warned = true;
            log::warn!(
                "GC arena holds {} values; a protection window is probably never restored",
                self.gc.arena.len()
            );
        }
    }

    pub(crate) fn maybe_collect(&mut self) {
        if !self.gc.disabled && self.heap.live() >= self.gc.threshold {
            self.collect();
        }
    }

    /// Run one full collection. Returns the number of objects freed.
    pub(crate) fn collect(&mut self) -> usize {
        let before = self.heap.live();
        log::debug!("gc start: {} live objects", before);

        let mut worklist: Vec<ObjPtr> = Vec::new();
        self.gather_roots(&mut worklist);
        while let Some(ptr) = worklist.pop() {
            if self.heap.mark(ptr) {
                self.heap.children(ptr, &mut worklist);
            }
        }
        let freed = self.heap.sweep();

        let live = self.heap.live();
        let grown = live.saturating_mul(self.gc.growth_percent) / 100;
        self.gc.threshold = grown.max(self.gc.base_threshold);
        self.gc.collections += 1;
        if self.gc.arena.len() < self.config.arena_warn_size {
            self.gc.arena_warned = false;
        }
        log::debug!(
            "gc end: freed {}, {} live, next threshold {}",
            freed,
            live,
            self.gc.threshold
        );
        freed
    }

    fn gather_roots(&self, out: &mut Vec<ObjPtr>) {
        let mut push = |v: RawValue| {
            if let Some(ptr) = v.as_object() {
                out.push(ptr);
            }
        };

        for v in &self.stack {
            push(*v);
        }
        for ci in &self.ci {
            push(ci.self_val);
            push(ci.block);
            push(ci.env);
            push(ci.proc_val);
            for v in &ci.args {
                push(*v);
            }
        }
        for v in self.constants.values() {
            push(*v);
        }
        for v in &self.gc.arena {
            push(*v);
        }
        for v in self.gc.roots.keys() {
            push(*v);
        }
        push(self.top_self);
        push(self.nomem_err);
        push(self.exc);

        // Core classes stay alive even if their constants are reassigned.
        let c = &self.classes;
        for ptr in [
            c.object,
            c.class,
            c.nil,
            c.true_,
            c.false_,
            c.integer,
            c.float,
            c.string,
            c.symbol,
            c.array,
            c.proc_,
            c.exception,
            c.standard_error,
            c.runtime_error,
            c.argument_error,
            c.type_error,
            c.name_error,
            c.no_method_error,
            c.zero_division_error,
            c.local_jump_error,
            c.index_error,
            c.syntax_error,
            c.system_stack_error,
            c.no_memory_error,
        ] {
            push(RawValue::object(ptr));
        }
    }
}
