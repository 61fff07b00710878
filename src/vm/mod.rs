//! Guest engine
//!
//! A small Ruby-flavoured interpreter that the boundary layer in `runtime`
//! drives. Everything that can unwind (`Unwind`) is crate-private; host code
//! only reaches guest execution through the trampoline in `runtime::protect`.

pub mod builtins;
pub mod class;
pub mod exec;
pub mod gc;
pub mod heap;
pub mod opcodes;
pub mod symbol;
pub mod value;

use std::collections::{HashMap, HashSet};

use crate::vm::class::{ClassData, CoreClasses};
use crate::vm::gc::GcState;
use crate::vm::heap::{ExceptionData, Heap, HeapConfig, HeapData};
use crate::vm::symbol::{Sym, SymbolTable};
use crate::vm::value::{ObjPtr, RawTag, RawValue};

/// Non-local exit of guest code. This is the engine's jump-buffer transfer,
/// expressed as the error side of a `Result`.
#[derive(Debug, Clone, Copy)]
pub enum Unwind {
    /// A guest exception. The value is also stored in `Engine::exc`.
    Raise(RawValue),
    /// `break` out of a block, caught by the call the block was attached to.
    Break { target: u64, value: RawValue },
    /// `return` from inside a block, caught by the enclosing method.
    Return { target: u64, value: RawValue },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    Top,
    Method,
    Block,
    Builtin,
    Host,
}

/// One guest call in progress. Everything referenced here is a GC root.
pub struct CallInfo {
    pub id: u64,
    pub kind: FrameKind,
    pub mid: Option<Sym>,
    pub self_val: RawValue,
    pub args: Vec<RawValue>,
    pub block: RawValue,
    /// Local variable storage (`Env` object) or nil for native frames.
    pub env: RawValue,
    /// The running proc for block frames.
    pub proc_val: RawValue,
    /// Frame that `return` inside a block of this frame unwinds to.
    pub home_method: u64,
}

/// The engine's active jump target. `runtime::protect` installs one per
/// protected call and restores the previous one on exit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JumpTarget {
    pub id: u64,
    pub depth: usize,
}

/// Engine-wide configuration.
#[derive(Clone, Debug)]
pub struct EngineConfig {
    pub heap: HeapConfig,
    /// Guest frames allowed before `SystemStackError` is raised.
    pub max_call_depth: usize,
    /// Arena size that triggers a warning about unreleased protections.
    pub arena_warn_size: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            heap: HeapConfig::default(),
            max_call_depth: 200,
            arena_warn_size: 10_000,
        }
    }
}

/// An embedded guest engine instance.
///
/// All engine state (heap, GC flags, jump target, call stack) is scoped to the
/// instance; nothing is process-global.
pub struct Engine {
    pub(crate) heap: Heap,
    pub(crate) gc: GcState,
    pub(crate) symbols: SymbolTable,
    /// Operand stack shared by all guest frames.
    pub(crate) stack: Vec<RawValue>,
    pub(crate) ci: Vec<CallInfo>,
    pub(crate) jmp: Option<JumpTarget>,
    /// Pending exception, nil when none.
    pub(crate) exc: RawValue,
    pub(crate) classes: CoreClasses,
    pub(crate) constants: HashMap<Sym, RawValue>,
    pub(crate) top_self: RawValue,
    /// Preallocated so running out of memory can still raise.
    pub(crate) nomem_err: RawValue,
    pub(crate) config: EngineConfig,
    next_ci_id: u64,
    pub(crate) next_jmp_id: u64,
}

impl Default for Engine {
    fn default() -> Self {
        Self::new()
    }
}

impl Engine {
    pub fn new() -> Self {
        Self::with_config(EngineConfig::default())
    }

    pub fn with_config(config: EngineConfig) -> Self {
        let mut engine = Self {
            heap: Heap::new(&config.heap),
            gc: GcState::new(&config.heap),
            symbols: SymbolTable::new(),
            stack: Vec::new(),
            ci: Vec::new(),
            jmp: None,
            exc: RawValue::nil(),
            classes: CoreClasses::placeholder(),
            constants: HashMap::new(),
            top_self: RawValue::nil(),
            nomem_err: RawValue::nil(),
            config,
            next_ci_id: 1,
            next_jmp_id: 1,
        };
        engine.bootstrap();
        builtins::install(&mut engine);
        engine
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    fn bootstrap(&mut self) {
        let object_name = self.symbols.intern("Object");
        let class_name = self.symbols.intern("Class");
        let object = self.heap.alloc_permanent(
            ObjPtr::null(),
            HeapData::Class(ClassData::new(object_name, None)),
        );
        let class = self.heap.alloc_permanent(
            ObjPtr::null(),
            HeapData::Class(ClassData::new(class_name, Some(object))),
        );
        for ptr in [object, class] {
            if let Some(obj) = self.heap.get_mut(ptr) {
                obj.header.class = class;
            }
        }
        self.constants.insert(object_name, RawValue::object(object));
        self.constants.insert(class_name, RawValue::object(class));
        self.classes.object = object;
        self.classes.class = class;

        let c = &mut self.classes;
        let boot = |symbols: &mut SymbolTable,
                        heap: &mut Heap,
                        constants: &mut HashMap<Sym, RawValue>,
                        name: &str,
                        superclass: ObjPtr| {
            let sym = symbols.intern(name);
            let ptr = heap.alloc_permanent(class, HeapData::Class(ClassData::new(sym, Some(superclass))));
            constants.insert(sym, RawValue::object(ptr));
            ptr
        };
        let (s, h, k) = (&mut self.symbols, &mut self.heap, &mut self.constants);
        c.nil = boot(s, h, k, "NilClass", object);
        c.true_ = boot(s, h, k, "TrueClass", object);
        c.false_ = boot(s, h, k, "FalseClass", object);
        c.integer = boot(s, h, k, "Integer", object);
        c.float = boot(s, h, k, "Float", object);
        c.string = boot(s, h, k, "String", object);
        c.symbol = boot(s, h, k, "Symbol", object);
        c.array = boot(s, h, k, "Array", object);
        c.proc_ = boot(s, h, k, "Proc", object);
        c.exception = boot(s, h, k, "Exception", object);
        let script_error = boot(s, h, k, "ScriptError", c.exception);
        c.syntax_error = boot(s, h, k, "SyntaxError", script_error);
        c.no_memory_error = boot(s, h, k, "NoMemoryError", c.exception);
        c.system_stack_error = boot(s, h, k, "SystemStackError", c.exception);
        c.standard_error = boot(s, h, k, "StandardError", c.exception);
        c.runtime_error = boot(s, h, k, "RuntimeError", c.standard_error);
        c.argument_error = boot(s, h, k, "ArgumentError", c.standard_error);
        c.type_error = boot(s, h, k, "TypeError", c.standard_error);
        c.name_error = boot(s, h, k, "NameError", c.standard_error);
        c.no_method_error = boot(s, h, k, "NoMethodError", c.name_error);
        c.zero_division_error = boot(s, h, k, "ZeroDivisionError", c.standard_error);
        c.local_jump_error = boot(s, h, k, "LocalJumpError", c.standard_error);
        c.index_error = boot(s, h, k, "IndexError", c.standard_error);

        let top = self.heap.alloc_permanent(object, HeapData::Object);
        self.top_self = RawValue::object(top);
        let nomem = self.heap.alloc_permanent(
            self.classes.no_memory_error,
            HeapData::Exception(ExceptionData {
                message: "failed to allocate memory".into(),
                backtrace: Vec::new(),
            }),
        );
        self.nomem_err = RawValue::object(nomem);
    }

    // =========================================================================
    // Call infos
    // =========================================================================

    pub(crate) fn next_call_id(&mut self) -> u64 {
        let id = self.next_ci_id;
        self.next_ci_id += 1;
        id
    }

    pub(crate) fn current_ci(&self) -> Option<&CallInfo> {
        self.ci.last()
    }

    // =========================================================================
    // Allocation
    // =========================================================================

    /// Allocate a guest object. May run a collection first, so every value
    /// referenced from `data` must already be reachable from a root.
    pub(crate) fn alloc(&mut self, class: ObjPtr, data: HeapData) -> Result<ObjPtr, Unwind> {
        self.maybe_collect();
        match self.heap.alloc(class, data) {
            Ok(ptr) => {
                self.arena_push(RawValue::object(ptr));
                Ok(ptr)
            }
            Err(exhausted) => {
                log::warn!("guest heap exhausted with {} live objects", exhausted.live);
                Err(self.raise(self.nomem_err))
            }
        }
    }

    pub(crate) fn new_string(&mut self, s: impl Into<String>) -> Result<RawValue, Unwind> {
        let class = self.classes.string;
        self.alloc(class, HeapData::String(s.into()))
            .map(RawValue::object)
    }

    pub(crate) fn new_array(&mut self, elements: Vec<RawValue>) -> Result<RawValue, Unwind> {
        let class = self.classes.array;
        self.alloc(class, HeapData::Array(elements))
            .map(RawValue::object)
    }

    pub(crate) fn new_exception(&mut self, class: ObjPtr, message: impl Into<String>) -> Result<RawValue, Unwind> {
        self.alloc(
            class,
            HeapData::Exception(ExceptionData {
                message: message.into(),
                backtrace: Vec::new(),
            }),
        )
        .map(RawValue::object)
    }

    pub(crate) fn new_class(&mut self, name: Sym, superclass: ObjPtr) -> Result<ObjPtr, Unwind> {
        let class = self.classes.class;
        let ptr = self.alloc(class, HeapData::Class(ClassData::new(name, Some(superclass))))?;
        self.constants.insert(name, RawValue::object(ptr));
        Ok(ptr)
    }

    // =========================================================================
    // Raising
    // =========================================================================

    /// The raise primitive. Records the exception in the pending slot and
    /// returns the unwind to propagate.
    pub(crate) fn raise(&mut self, exc: RawValue) -> Unwind {
        if self.jmp.is_none() {
            log::warn!("guest exception raised with no active jump target");
        }
        let trace: Vec<String> = self
            .ci
            .iter()
            .rev()
            .filter_map(|ci| ci.mid.map(|mid| self.symbols.name(mid).to_string()))
            .collect();
        if let Some(obj) = exc.as_object().and_then(|ptr| self.heap.get_mut(ptr)) {
            if let HeapData::Exception(data) = &mut obj.data {
                if data.backtrace.is_empty() {
                    data.backtrace = trace;
                }
            }
        }
        self.exc = exc;
        Unwind::Raise(exc)
    }

    /// Build and raise an exception of `class`.
    pub(crate) fn raise_error(&mut self, class: ObjPtr, message: impl Into<String>) -> Unwind {
        match self.new_exception(class, message) {
            Ok(exc) => self.raise(exc),
            Err(unwind) => unwind,
        }
    }

    pub(crate) fn type_error(&mut self, message: impl Into<String>) -> Unwind {
        let class = self.classes.type_error;
        self.raise_error(class, message)
    }

    pub(crate) fn argument_error(&mut self, message: impl Into<String>) -> Unwind {
        let class = self.classes.argument_error;
        self.raise_error(class, message)
    }

    pub(crate) fn arity_error(&mut self, given: usize, expected: impl std::fmt::Display) -> Unwind {
        self.argument_error(format!(
            "wrong number of arguments (given {}, expected {})",
            given, expected
        ))
    }

    pub(crate) fn is_exception(&self, v: RawValue) -> bool {
        matches!(
            v.as_object().and_then(|ptr| self.heap.get(ptr)).map(|obj| &obj.data),
            Some(HeapData::Exception(_))
        )
    }

    pub(crate) fn exception_message(&self, v: RawValue) -> Option<&str> {
        match v.as_object().and_then(|ptr| self.heap.get(ptr)).map(|obj| &obj.data) {
            Some(HeapData::Exception(data)) => Some(&data.message),
            _ => None,
        }
    }

    pub(crate) fn exception_backtrace(&self, v: RawValue) -> Vec<String> {
        match v.as_object().and_then(|ptr| self.heap.get(ptr)).map(|obj| &obj.data) {
            Some(HeapData::Exception(data)) => data.backtrace.clone(),
            _ => Vec::new(),
        }
    }

    // =========================================================================
    // Rendering
    // =========================================================================

    /// `inspect` rendering. Nested arrays are walked with an explicit stack;
    /// an array that contains one of its own ancestors shows it as `[...]`.
    pub(crate) fn inspect_raw(&self, v: RawValue) -> String {
        enum Piece {
            Value(RawValue),
            Separator,
            Close(RawValue),
        }

        let mut out = String::new();
        let mut open: HashSet<RawValue> = HashSet::new();
        let mut work = vec![Piece::Value(v)];
        while let Some(piece) = work.pop() {
            match piece {
                Piece::Separator => out.push_str(", "),
                Piece::Close(array) => {
                    open.remove(&array);
                    out.push(']');
                }
                Piece::Value(v) => match self.array_elements(v) {
                    Some(_) if open.contains(&v) => out.push_str("[...]"),
                    Some(elements) => {
                        open.insert(v);
                        out.push('[');
                        work.push(Piece::Close(v));
                        for (i, e) in elements.iter().enumerate().rev() {
                            work.push(Piece::Value(*e));
                            if i > 0 {
                                work.push(Piece::Separator);
                            }
                        }
                    }
                    None => out.push_str(&self.inspect_scalar(v)),
                },
            }
        }
        out
    }

    /// Rendering of anything but an array.
    fn inspect_scalar(&self, v: RawValue) -> String {
        match v.tag() {
            RawTag::Nil | RawTag::Undef => "nil".into(),
            RawTag::True => "true".into(),
            RawTag::False => "false".into(),
            RawTag::Fixnum => v.as_fixnum().unwrap_or_default().to_string(),
            RawTag::Float => float_to_s(v.as_float().unwrap_or_default()),
            RawTag::Symbol => format!(
                ":{}",
                v.as_symbol().map(|s| self.symbols.name(s)).unwrap_or("")
            ),
            RawTag::Object => {
                let Some(ptr) = v.as_object() else {
                    return "nil".into();
                };
                let Some(obj) = self.heap.get(ptr) else {
                    return "#<collected>".into();
                };
                match &obj.data {
                    HeapData::String(s) => format!("{:?}", s),
                    HeapData::Array(_) => "[...]".into(),
                    HeapData::Class(data) => self.symbols.name(data.name).to_string(),
                    HeapData::Exception(data) => {
                        format!("#<{}: {}>", self.class_name(obj.header.class), data.message)
                    }
                    HeapData::Proc(_) => "#<Proc>".into(),
                    HeapData::Env(_) => "#<Env>".into(),
                    HeapData::Object if v == self.top_self => "main".into(),
                    HeapData::Object => format!("#<{}>", self.class_name(obj.header.class)),
                }
            }
        }
    }

    pub(crate) fn to_s_raw(&self, v: RawValue) -> String {
        if v.is_nil() {
            return String::new();
        }
        if let Some(sym) = v.as_symbol() {
            return self.symbols.name(sym).to_string();
        }
        match v.as_object().and_then(|ptr| self.heap.get(ptr)).map(|obj| &obj.data) {
            Some(HeapData::String(s)) => s.clone(),
            Some(HeapData::Exception(data)) => data.message.clone(),
            _ => self.inspect_raw(v),
        }
    }

    pub(crate) fn string_raw(&self, v: RawValue) -> Option<&str> {
        match v.as_object().and_then(|ptr| self.heap.get(ptr)).map(|obj| &obj.data) {
            Some(HeapData::String(s)) => Some(s),
            _ => None,
        }
    }
}

/// Ruby-style float rendering: integral floats keep a trailing `.0`.
pub(crate) fn float_to_s(f: f64) -> String {
    if f.is_nan() {
        "NaN".into()
    } else if f.is_infinite() {
        if f > 0.0 { "Infinity".into() } else { "-Infinity".into() }
    } else if f.fract() == 0.0 && f.abs() < 1e16 {
        format!("{:.1}", f)
    } else {
        format!("{}", f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bootstrap_registers_core_classes() {
        let engine = Engine::new();
        for name in ["Object", "Class", "Integer", "StandardError", "ZeroDivisionError"] {
            let sym = engine.symbols.lookup(name).expect("symbol interned");
            assert!(engine.constants.contains_key(&sym), "missing constant {}", name);
        }
        assert!(engine.class_inherits(engine.classes.no_method_error, engine.classes.standard_error));
        assert!(!engine.class_inherits(engine.classes.syntax_error, engine.classes.standard_error));
        assert_eq!(engine.class_name(engine.classes.class), "Class");
    }

    #[test]
    fn test_float_to_s() {
        assert_eq!(float_to_s(1.0), "1.0");
        assert_eq!(float_to_s(2.5), "2.5");
        assert_eq!(float_to_s(f64::INFINITY), "Infinity");
        assert_eq!(float_to_s(f64::NAN), "NaN");
    }

    #[test]
    fn test_inspect_immediates() {
        let mut engine = Engine::new();
        let sym = engine.symbols.intern("ok");
        assert_eq!(engine.inspect_raw(RawValue::nil()), "nil");
        assert_eq!(engine.inspect_raw(RawValue::integer(-42)), "-42");
        assert_eq!(engine.inspect_raw(RawValue::symbol(sym)), ":ok");
        assert_eq!(engine.inspect_raw(engine.top_self), "main");
    }
}
