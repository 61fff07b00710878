//! Host-Callback Bridge
//!
//! Guest code calls host functions through `invoke_host`. The host function
//! never raises: it reports through two out-slots (or an `Err`), and the
//! bridge performs the guest-level raise after control is back on the guest
//! side of the boundary.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::rc::Rc;

use super::args::ArgSpec;
use super::error::{BridgeError, BridgeResult};
use super::value::Value;
use crate::vm::class::{HostMethod, Method};
use crate::vm::symbol::Sym;
use crate::vm::value::{ObjPtr, RawValue};
use crate::vm::{CallInfo, Engine, FrameKind, Unwind};

/// A host function callable from guest code.
///
/// Receives the receiver; arguments are read with `Engine::get_args`.
pub type HostFn = dyn Fn(&mut Engine, Value, &mut CallSlots) -> BridgeResult<()>;

/// Out-slots filled by a host function. Both start as nil.
///
/// A non-nil `exception` is raised in the guest once the host function has
/// returned; otherwise `result` is the call's value.
#[derive(Debug, Default, Clone, Copy, PartialEq)]
pub struct CallSlots {
    result: Value,
    exception: Value,
}

impl CallSlots {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_result(&mut self, value: impl Into<Value>) {
        self.result = value.into();
    }

    /// Must hold an exception object; anything else is raised as TypeError.
    pub fn set_exception(&mut self, exception: Value) {
        self.exception = exception;
    }

    pub fn result(&self) -> Value {
        self.result
    }

    pub fn exception(&self) -> Value {
        self.exception
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".into()
    }
}

impl Engine {
    pub(crate) fn invoke_host(
        &mut self,
        host: &HostMethod,
        recv: RawValue,
        mid: Sym,
        args: &[RawValue],
        block: RawValue,
    ) -> Result<RawValue, Unwind> {
        host.spec.check(self, args.len())?;

        let id = self.next_call_id();
        self.push_ci(CallInfo {
            id,
            kind: FrameKind::Host,
            mid: Some(mid),
            self_val: recv,
            args: args.to_vec(),
            block,
            env: RawValue::nil(),
            proc_val: RawValue::nil(),
            home_method: id,
        })?;
        let ci_depth = self.ci.len();
        let stack_depth = self.stack.len();

        let func = Rc::clone(&host.func);
        let mut slots = CallSlots::new();
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            func(self, Value::from_raw(recv), &mut slots)
        }));

        // A panic can leave frames of nested guest calls behind.
        self.ci.truncate(ci_depth);
        self.stack.truncate(stack_depth);
        self.ci.pop();

        match outcome {
            Ok(Ok(())) => self.deliver_slots(slots),
            Ok(Err(err)) => {
                log::debug!("host callback '{}' failed: {}", self.symbols.name(mid), err);
                Err(self.raise_bridge_error(err))
            }
            Err(payload) => {
                let message = format!("host callback panicked: {}", panic_message(&*payload));
                log::debug!("{} (in '{}')", message, self.symbols.name(mid));
                let class = self.classes.runtime_error;
                Err(self.raise_error(class, message))
            }
        }
    }

    fn deliver_slots(&mut self, slots: CallSlots) -> Result<RawValue, Unwind> {
        let exception = slots.exception.to_raw();
        if !exception.is_nil() {
            if self.is_exception(exception) {
                return Err(self.raise(exception));
            }
            log::warn!(
                "host exception slot holds {} instead of an exception",
                self.inspect_raw(exception)
            );
            return Err(self.type_error("exception object expected"));
        }
        if let Err(err) = self.check_live(slots.result) {
            return Err(self.type_error(err.to_string()));
        }
        Ok(slots.result.to_raw())
    }

    /// Raise the guest exception that corresponds to a host-side failure.
    fn raise_bridge_error(&mut self, err: BridgeError) -> Unwind {
        match err {
            BridgeError::Raised(caught) => {
                let exc = caught.value.to_raw();
                if self.is_exception(exc) {
                    self.raise(exc)
                } else {
                    let class = self.classes.runtime_error;
                    self.raise_error(class, caught.message)
                }
            }
            BridgeError::WrongTag { .. } | BridgeError::DeadReference(_) | BridgeError::NotAnException => {
                self.type_error(err.to_string())
            }
            BridgeError::HeapExhausted { .. } => self.raise(self.nomem_err),
            BridgeError::UnknownClass(_) | BridgeError::Host(_) => {
                let class = self.classes.runtime_error;
                self.raise_error(class, err.to_string())
            }
        }
    }

    // =========================================================================
    // Classes and methods
    // =========================================================================

    pub fn object_class(&self) -> Value {
        Value::from_raw(RawValue::object(self.classes.object))
    }

    /// Look up a class constant by name.
    pub fn class_get(&self, name: &str) -> BridgeResult<Value> {
        self.symbols
            .lookup(name)
            .and_then(|sym| self.constants.get(&sym))
            .copied()
            .filter(|v| self.is_class(*v))
            .map(Value::from_raw)
            .ok_or_else(|| BridgeError::UnknownClass(name.to_string()))
    }

    /// Define (or reopen) a class under `superclass`.
    pub fn define_class(&mut self, name: &str, superclass: Value) -> BridgeResult<Value> {
        let superclass = self.class_ptr(superclass)?.ptr();
        if let Ok(existing) = self.class_get(name) {
            return Ok(existing);
        }
        let sym = self.symbols.intern(name);
        let class = self.host_alloc(|engine| engine.new_class(sym, superclass).map(RawValue::object))?;
        log::debug!("defined class {} < {}", name, self.class_name(superclass));
        Ok(class)
    }

    /// Register `func` as an instance method of `class`.
    pub fn define_method<F>(&mut self, class: Value, name: &str, spec: ArgSpec, func: F) -> BridgeResult<()>
    where
        F: Fn(&mut Engine, Value, &mut CallSlots) -> BridgeResult<()> + 'static,
    {
        let class = self.class_ptr(class)?.ptr();
        self.install_host_method(class, name, spec, Rc::new(func), false)
    }

    /// Register `func` as a singleton method of `class`.
    pub fn define_class_method<F>(&mut self, class: Value, name: &str, spec: ArgSpec, func: F) -> BridgeResult<()>
    where
        F: Fn(&mut Engine, Value, &mut CallSlots) -> BridgeResult<()> + 'static,
    {
        let class = self.class_ptr(class)?.ptr();
        self.install_host_method(class, name, spec, Rc::new(func), true)
    }

    fn install_host_method(
        &mut self,
        class: ObjPtr,
        name: &str,
        spec: ArgSpec,
        func: Rc<HostFn>,
        singleton: bool,
    ) -> BridgeResult<()> {
        let mid = self.symbols.intern(name);
        let method = Method::Host(HostMethod { func, spec });
        let data = self
            .class_data_mut(class)
            .ok_or(BridgeError::WrongTag {
                expected: "class",
                found: "object",
            })?;
        if singleton {
            data.class_methods.insert(mid, method);
        } else {
            data.methods.insert(mid, method);
        }
        Ok(())
    }

    // =========================================================================
    // Marshaling helpers
    // =========================================================================

    /// New exception of the named class, for a callback's exception slot.
    pub fn exception_new(&mut self, class_name: &str, message: &str) -> BridgeResult<Value> {
        let class = self.class_get(class_name)?;
        let class = self.class_ptr(class)?.ptr();
        if !self.class_inherits(class, self.classes.exception) {
            return Err(BridgeError::NotAnException);
        }
        self.host_alloc(|engine| engine.new_exception(class, message))
    }

    pub fn str_new(&mut self, s: &str) -> BridgeResult<Value> {
        self.host_alloc(|engine| engine.new_string(s))
    }

    pub fn ary_new(&mut self, elements: &[Value]) -> BridgeResult<Value> {
        for v in elements {
            self.check_live(*v)?;
        }
        let raw = elements.iter().map(|v| v.to_raw()).collect();
        self.host_alloc(|engine| engine.new_array(raw))
    }

    pub fn symbol(&mut self, name: &str) -> Value {
        Value::Symbol(self.symbols.intern(name))
    }

    pub fn sym_name(&self, sym: Sym) -> &str {
        self.symbols.name(sym)
    }

    /// Contents of a guest string.
    pub fn string(&self, value: Value) -> BridgeResult<String> {
        let found = self.vtype(value)?;
        self.string_raw(value.to_raw())
            .map(str::to_string)
            .ok_or(BridgeError::WrongTag {
                expected: "string",
                found: found.name(),
            })
    }

    /// Elements of a guest array.
    pub fn array(&self, value: Value) -> BridgeResult<Vec<Value>> {
        let found = self.vtype(value)?;
        self.array_elements(value.to_raw())
            .map(|elements| elements.iter().map(|raw| Value::from_raw(*raw)).collect())
            .ok_or(BridgeError::WrongTag {
                expected: "array",
                found: found.name(),
            })
    }

    /// Ruby `inspect` rendering.
    pub fn inspect(&self, value: Value) -> BridgeResult<String> {
        self.check_live(value)?;
        Ok(self.inspect_raw(value.to_raw()))
    }
}
