//! Exception-Safe Call Trampoline
//!
//! Every host-to-guest call runs inside `Engine::protect`. The guest's
//! non-local exits (`Unwind`) are caught here and turned into a host-level
//! `BridgeResult`, so a raise never travels past the host frame that made
//! the call.
//!
//! There are three outcomes:
//! - returned: the value is pinned in the GC arena and handed back
//! - raised: the exception is contained as `BridgeError::Raised`
//! - escaped: a `break` or `return` with no guest frame left to catch it,
//!   converted into a contained `LocalJumpError`

use std::ops::{Deref, DerefMut};
use std::rc::Rc;

use super::error::{BridgeError, BridgeResult, GuestException};
use super::value::Value;
use crate::compiler::{self, ParseError};
use crate::vm::opcodes::{CallKind, Irep};
use crate::vm::value::RawValue;
use crate::vm::{Engine, JumpTarget, Unwind};

/// Saved and installed jump target of one protected call.
///
/// The previous target is put back when the scope drops, whichever way the
/// protected operation ended. The caller's pending exception is cleared on
/// entry; if a panic unwinds through the scope it is put back as well, since
/// `protect` never gets to do it.
pub struct JumpScope<'a> {
    engine: &'a mut Engine,
    previous: Option<JumpTarget>,
    target: JumpTarget,
    pending: RawValue,
}

impl<'a> JumpScope<'a> {
    pub(crate) fn enter(engine: &'a mut Engine) -> Self {
        let previous = engine.jmp;
        let target = JumpTarget {
            id: engine.next_jmp_id,
            depth: previous.map_or(0, |t| t.depth) + 1,
        };
        engine.next_jmp_id += 1;
        engine.jmp = Some(target);
        let pending = std::mem::replace(&mut engine.exc, RawValue::nil());
        log::trace!("jump scope {} entered at depth {}", target.id, target.depth);
        Self {
            engine,
            previous,
            target,
            pending,
        }
    }

    pub fn target(&self) -> JumpTarget {
        self.target
    }

    pub fn previous(&self) -> Option<JumpTarget> {
        self.previous
    }
}

impl Deref for JumpScope<'_> {
    type Target = Engine;

    fn deref(&self) -> &Engine {
        self.engine
    }
}

impl DerefMut for JumpScope<'_> {
    fn deref_mut(&mut self) -> &mut Engine {
        self.engine
    }
}

impl Drop for JumpScope<'_> {
    fn drop(&mut self) {
        log::trace!(
            "jump scope {} left, restoring depth {}",
            self.target.id,
            self.previous.map_or(0, |t| t.depth)
        );
        self.engine.jmp = self.previous;
        if std::thread::panicking() {
            self.engine.exc = self.pending;
        }
    }
}

/// A compiled program, ready to `run`.
#[derive(Debug, Clone)]
pub struct Program {
    irep: Rc<Irep>,
}

impl Program {
    pub fn name(&self) -> &str {
        &self.irep.name
    }
}

impl Engine {
    /// Run `op` under a fresh jump target and contain whatever it raises.
    pub(crate) fn protect(
        &mut self,
        op: impl FnOnce(&mut Engine) -> Result<RawValue, Unwind>,
    ) -> BridgeResult<Value> {
        let ci_depth = self.ci.len();
        let stack_depth = self.stack.len();
        let outer_exc = self.exc;
        if self.jmp.is_some() {
            // Out of the pending slot until the nested call returns.
            self.arena_push(outer_exc);
        }

        let outcome = {
            let mut scope = JumpScope::enter(self);
            op(&mut *scope)
        };

        let exc = match outcome {
            Ok(raw) => {
                // A nested call that succeeds leaves the caller's pending
                // exception as it found it.
                self.exc = if self.jmp.is_some() { outer_exc } else { RawValue::nil() };
                let value = Value::from_raw(raw);
                self.gc_protect(value);
                return Ok(value);
            }
            Err(Unwind::Raise(exc)) => exc,
            Err(Unwind::Break { .. }) => self.escape_error("break from proc-closure"),
            Err(Unwind::Return { .. }) => self.escape_error("unexpected return"),
        };

        self.ci.truncate(ci_depth);
        self.stack.truncate(stack_depth);
        // Nested calls hand the exception to the host only; the guest frames
        // below still see their own.
        self.exc = if self.jmp.is_some() { outer_exc } else { exc };
        let caught = self.capture_exception(exc);
        log::debug!("contained guest exception: {}", caught);
        Err(BridgeError::Raised(caught))
    }

    /// Build the `LocalJumpError` for a `break` or `return` nobody caught.
    fn escape_error(&mut self, message: &str) -> RawValue {
        let class = self.classes.local_jump_error;
        match self.new_exception(class, message) {
            Ok(exc) => exc,
            Err(Unwind::Raise(exc)) => exc,
            Err(_) => self.nomem_err,
        }
    }

    /// Host-side description of a guest exception. Pins it in the arena.
    pub(crate) fn capture_exception(&mut self, exc: RawValue) -> GuestException {
        self.arena_push(exc);
        let class_name = self.class_name(self.class_of(exc)).to_string();
        let message = match self.exception_message(exc) {
            Some(message) => message.to_string(),
            None => self.inspect_raw(exc),
        };
        GuestException {
            value: Value::from_raw(exc),
            class_name,
            message,
            backtrace: self.exception_backtrace(exc),
        }
    }

    // =========================================================================
    // Entry points
    // =========================================================================

    /// Compile and run `source` at the top level.
    ///
    /// A syntax error is raised as a guest `SyntaxError` and contained like
    /// any other exception.
    pub fn load_string(&mut self, source: &str) -> BridgeResult<Value> {
        self.protect(|engine| {
            let irep = match compiler::compile(source, &mut engine.symbols) {
                Ok(irep) => irep,
                Err(errors) => {
                    let message = errors
                        .iter()
                        .map(ToString::to_string)
                        .collect::<Vec<_>>()
                        .join("\n");
                    let class = engine.classes.syntax_error;
                    return Err(engine.raise_error(class, message));
                }
            };
            engine.run_toplevel(&irep)
        })
    }

    /// Compile without running. Syntax errors come back as diagnostics.
    pub fn parse(&mut self, source: &str) -> Result<Program, Vec<ParseError>> {
        compiler::compile(source, &mut self.symbols).map(|irep| Program { irep })
    }

    pub fn run(&mut self, program: &Program) -> BridgeResult<Value> {
        let irep = Rc::clone(&program.irep);
        self.protect(move |engine| engine.run_toplevel(&irep))
    }

    /// Call a guest block with `args`.
    ///
    /// A nil block raises `ArgumentError`, any other non-proc raises
    /// `TypeError`; both are contained.
    pub fn yield_block(&mut self, block: Value, args: &[Value]) -> BridgeResult<Value> {
        self.check_live(block)?;
        for arg in args {
            self.check_live(*arg)?;
        }
        let block = block.to_raw();
        let args: Vec<RawValue> = args.iter().map(|v| v.to_raw()).collect();
        self.protect(move |engine| {
            if block.is_nil() {
                return Err(engine.argument_error("no block given"));
            }
            if !engine.is_proc_raw(block) {
                let name = engine.class_name(engine.class_of(block)).to_string();
                return Err(engine.type_error(format!("wrong argument type {} (expected Proc)", name)));
            }
            engine.call_block(block, &args)
        })
    }

    /// Protected method call `recv.name(*args)`.
    pub fn funcall(&mut self, recv: Value, name: &str, args: &[Value]) -> BridgeResult<Value> {
        self.check_live(recv)?;
        for arg in args {
            self.check_live(*arg)?;
        }
        let mid = self.symbols.intern(name);
        let recv = recv.to_raw();
        let args: Vec<RawValue> = args.iter().map(|v| v.to_raw()).collect();
        self.protect(move |engine| engine.send(recv, mid, &args, RawValue::nil(), CallKind::Call))
    }

    /// Number of protected calls currently on the host stack.
    pub fn jump_depth(&self) -> usize {
        self.jmp.map_or(0, |t| t.depth)
    }

    /// The pending exception: the last one contained, or nil.
    pub fn exception(&self) -> Value {
        Value::from_raw(self.exc)
    }

    pub fn clear_exception(&mut self) {
        self.exc = RawValue::nil();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raised(result: BridgeResult<Value>) -> GuestException {
        match result {
            Err(BridgeError::Raised(exc)) => exc,
            other => panic!("expected a guest raise, got {:?}", other),
        }
    }

    #[test]
    fn test_load_string_returns_last_value() {
        let mut engine = Engine::new();
        assert_eq!(engine.load_string("x = 20\nx + 22"), Ok(Value::Fixnum(42)));
        assert_eq!(engine.jump_depth(), 0);
    }

    #[test]
    fn test_raise_is_contained_and_depth_restored() {
        let mut engine = Engine::new();
        let exc = raised(engine.load_string("raise ArgumentError, 'bad'"));
        assert_eq!(exc.class_name, "ArgumentError");
        assert_eq!(exc.message, "bad");
        assert_eq!(engine.jump_depth(), 0);
        assert_eq!(engine.exception(), exc.value);

        engine.clear_exception();
        assert!(engine.exception().is_nil());
    }

    #[test]
    fn test_next_protected_call_clears_exception() {
        let mut engine = Engine::new();
        assert!(engine.load_string("raise 'x'").is_err());
        assert!(!engine.exception().is_nil());
        engine.load_string("1").expect("load");
        assert!(engine.exception().is_nil());
    }

    #[test]
    fn test_syntax_error_is_raised_in_guest() {
        let mut engine = Engine::new();
        let exc = raised(engine.load_string("def (("));
        assert_eq!(exc.class_name, "SyntaxError");
        assert_eq!(engine.jump_depth(), 0);
    }

    #[test]
    fn test_parse_reports_diagnostics() {
        let mut engine = Engine::new();
        let errors = engine.parse("x = ").unwrap_err();
        assert!(!errors.is_empty());
        assert!(errors[0].line >= 1);

        let program = engine.parse("3 * 4").expect("parse");
        assert_eq!(engine.run(&program), Ok(Value::Fixnum(12)));
        assert_eq!(engine.run(&program), Ok(Value::Fixnum(12)));
    }

    #[test]
    fn test_escaping_break_becomes_local_jump_error() {
        let mut engine = Engine::new();
        let block = engine.load_string("proc { |x| break x }").expect("proc");
        let exc = raised(engine.yield_block(block, &[Value::Fixnum(1)]));
        assert_eq!(exc.class_name, "LocalJumpError");
        assert_eq!(engine.jump_depth(), 0);
    }

    #[test]
    fn test_yield_block_rejects_nil_and_non_procs() {
        let mut engine = Engine::new();
        let exc = raised(engine.yield_block(Value::Nil, &[]));
        assert_eq!(exc.class_name, "ArgumentError");

        let exc = raised(engine.yield_block(Value::Fixnum(3), &[]));
        assert_eq!(exc.class_name, "TypeError");
        assert_eq!(engine.jump_depth(), 0);
    }

    #[test]
    fn test_yield_block_passes_args() {
        let mut engine = Engine::new();
        let block = engine.load_string("proc { |a, b| a * b }").expect("proc");
        assert_eq!(
            engine.yield_block(block, &[Value::Fixnum(6), Value::Fixnum(7)]),
            Ok(Value::Fixnum(42))
        );
    }

    #[test]
    fn test_funcall() {
        let mut engine = Engine::new();
        engine.load_string("def twice(n)\n  n * 2\nend").expect("def");
        let main = engine.load_string("self").expect("self");
        assert_eq!(engine.funcall(main, "twice", &[Value::Fixnum(21)]), Ok(Value::Fixnum(42)));

        let exc = raised(engine.funcall(main, "nope", &[]));
        assert_eq!(exc.class_name, "NoMethodError");
    }

    #[test]
    fn test_scope_restores_previous_target() {
        let mut engine = Engine::new();
        {
            let mut outer = JumpScope::enter(&mut engine);
            assert_eq!(outer.jump_depth(), 1);
            {
                let inner = JumpScope::enter(&mut outer);
                assert_eq!(inner.jump_depth(), 2);
                assert_eq!(inner.previous().map(|t| t.depth), Some(1));
            }
            assert_eq!(outer.jump_depth(), 1);
        }
        assert_eq!(engine.jump_depth(), 0);
        assert!(engine.jmp.is_none());
    }

    #[test]
    fn test_panic_through_scope_restores_pending_exception() {
        let mut engine = Engine::new();
        let exc = raised(engine.load_string("raise 'pending'"));
        assert_eq!(engine.exception(), exc.value);

        let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let scope = JumpScope::enter(&mut engine);
            assert!(scope.exception().is_nil());
            panic!("unwinding through a protected call");
        }));
        assert!(outcome.is_err());
        assert_eq!(engine.exception(), exc.value);
        assert_eq!(engine.jump_depth(), 0);
    }

    #[test]
    fn test_scope_leaves_exception_to_protect_on_normal_exit() {
        let mut engine = Engine::new();
        assert!(engine.load_string("raise 'pending'").is_err());
        {
            let _scope = JumpScope::enter(&mut engine);
        }
        assert!(engine.exception().is_nil());
    }
}
