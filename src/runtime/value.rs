//! Value Classifier
//!
//! `Value` is the host-facing view of a guest value: an explicit tagged
//! variant instead of the engine's NaN-boxed word. This module is the only
//! place the two representations are converted.
//!
//! Immediates (nil, booleans, fixnums, floats, symbols) are owned by nobody
//! and can never be collected. `Object` carries an `ObjRef`, a non-owning
//! handle whose validity the guest collector controls.

use super::error::{BridgeError, BridgeResult};
use crate::vm::Engine;
use crate::vm::heap::{HeapData, ObjectHeader, ObjectKind};
use crate::vm::symbol::Sym;
use crate::vm::value::{ObjPtr, RawTag, RawValue};

/// Handle to a guest heap object: a slot index plus the slot's generation
/// at the time the handle was made.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObjRef(ObjPtr);

impl ObjRef {
    pub(crate) fn from_ptr(ptr: ObjPtr) -> Self {
        ObjRef(ptr)
    }

    pub(crate) fn ptr(self) -> ObjPtr {
        self.0
    }

    /// A handle that refers to nothing. Always reported dead.
    pub const fn null() -> Self {
        ObjRef(ObjPtr::null())
    }

    pub fn index(self) -> u32 {
        self.0.index()
    }

    pub fn generation(self) -> u32 {
        self.0.generation()
    }
}

impl std::fmt::Debug for ObjRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ObjRef({}#{})", self.index(), self.generation())
    }
}

/// A guest value as seen by the host.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum Value {
    #[default]
    Nil,
    Bool(bool),
    /// Fixnums are 48-bit in the engine; wider integers become floats when
    /// they cross into it.
    Fixnum(i64),
    Float(f64),
    Symbol(Sym),
    Object(ObjRef),
}

/// Payload of a value that is not collected.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Immediate {
    Nil,
    Bool(bool),
    Fixnum(i64),
    Float(f64),
    Symbol(Sym),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Classified {
    Immediate(Immediate),
    Heap(ObjRef),
}

/// Full type tag, including the kind of heap object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueType {
    Nil,
    False,
    True,
    Fixnum,
    Float,
    Symbol,
    Object,
    Class,
    String,
    Array,
    Proc,
    Exception,
}

impl ValueType {
    pub fn name(self) -> &'static str {
        match self {
            ValueType::Nil => "nil",
            ValueType::False => "false",
            ValueType::True => "true",
            ValueType::Fixnum => "fixnum",
            ValueType::Float => "float",
            ValueType::Symbol => "symbol",
            ValueType::Object => "object",
            ValueType::Class => "class",
            ValueType::String => "string",
            ValueType::Array => "array",
            ValueType::Proc => "proc",
            ValueType::Exception => "exception",
        }
    }
}

impl Value {
    pub(crate) fn from_raw(raw: RawValue) -> Self {
        match raw.tag() {
            RawTag::Nil | RawTag::Undef => Value::Nil,
            RawTag::True => Value::Bool(true),
            RawTag::False => Value::Bool(false),
            RawTag::Fixnum => Value::Fixnum(raw.as_fixnum().unwrap_or_default()),
            RawTag::Float => Value::Float(raw.as_float().unwrap_or_default()),
            RawTag::Symbol => raw.as_symbol().map(Value::Symbol).unwrap_or(Value::Nil),
            RawTag::Object => raw
                .as_object()
                .map(|ptr| Value::Object(ObjRef(ptr)))
                .unwrap_or(Value::Nil),
        }
    }

    pub(crate) fn to_raw(self) -> RawValue {
        match self {
            Value::Nil => RawValue::nil(),
            Value::Bool(b) => RawValue::boolean(b),
            Value::Fixnum(n) => RawValue::integer(n),
            Value::Float(f) => RawValue::float(f),
            Value::Symbol(sym) => RawValue::symbol(sym),
            Value::Object(obj) => RawValue::object(obj.0),
        }
    }

    /// Immediate or heap object. A pure function of the tag.
    pub fn classify(self) -> Classified {
        match self {
            Value::Nil => Classified::Immediate(Immediate::Nil),
            Value::Bool(b) => Classified::Immediate(Immediate::Bool(b)),
            Value::Fixnum(n) => Classified::Immediate(Immediate::Fixnum(n)),
            Value::Float(f) => Classified::Immediate(Immediate::Float(f)),
            Value::Symbol(sym) => Classified::Immediate(Immediate::Symbol(sym)),
            Value::Object(obj) => Classified::Heap(obj),
        }
    }

    #[inline]
    pub fn is_immediate(self) -> bool {
        !matches!(self, Value::Object(_))
    }

    #[inline]
    pub fn is_nil(self) -> bool {
        matches!(self, Value::Nil)
    }

    /// Ruby truthiness: only nil and false are false.
    pub fn is_truthy(self) -> bool {
        !matches!(self, Value::Nil | Value::Bool(false))
    }

    /// Name of the value's tag.
    pub fn tag(self) -> &'static str {
        match self {
            Value::Nil => "nil",
            Value::Bool(_) => "bool",
            Value::Fixnum(_) => "fixnum",
            Value::Float(_) => "float",
            Value::Symbol(_) => "symbol",
            Value::Object(_) => "object",
        }
    }

    fn wrong_tag(self, expected: &'static str) -> BridgeError {
        BridgeError::WrongTag {
            expected,
            found: self.tag(),
        }
    }

    pub fn as_float(self) -> BridgeResult<f64> {
        match self {
            Value::Float(f) => Ok(f),
            other => Err(other.wrong_tag("float")),
        }
    }

    pub fn as_fixnum(self) -> BridgeResult<i64> {
        match self {
            Value::Fixnum(n) => Ok(n),
            other => Err(other.wrong_tag("fixnum")),
        }
    }

    pub fn as_bool(self) -> BridgeResult<bool> {
        match self {
            Value::Bool(b) => Ok(b),
            other => Err(other.wrong_tag("bool")),
        }
    }

    pub fn as_symbol(self) -> BridgeResult<Sym> {
        match self {
            Value::Symbol(sym) => Ok(sym),
            other => Err(other.wrong_tag("symbol")),
        }
    }

    pub fn as_object(self) -> BridgeResult<ObjRef> {
        match self {
            Value::Object(obj) => Ok(obj),
            other => Err(other.wrong_tag("object")),
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Fixnum(n)
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::Float(f)
    }
}

impl From<Sym> for Value {
    fn from(sym: Sym) -> Self {
        Value::Symbol(sym)
    }
}

impl From<ObjRef> for Value {
    fn from(obj: ObjRef) -> Self {
        Value::Object(obj)
    }
}

impl Engine {
    /// Header of whatever occupies the reference's slot, if anything.
    ///
    /// The slot may have been reused by a newer object; pair this with
    /// `is_dead` before trusting the header.
    pub fn object_header(&self, obj: ObjRef) -> Option<&ObjectHeader> {
        self.heap.header(obj.ptr())
    }

    /// Full type of a value. Heap objects must be alive.
    pub fn vtype(&self, value: Value) -> BridgeResult<ValueType> {
        Ok(match value {
            Value::Nil => ValueType::Nil,
            Value::Bool(false) => ValueType::False,
            Value::Bool(true) => ValueType::True,
            Value::Fixnum(_) => ValueType::Fixnum,
            Value::Float(_) => ValueType::Float,
            Value::Symbol(_) => ValueType::Symbol,
            Value::Object(obj) => {
                self.check_live(value)?;
                match self.heap.header(obj.ptr()).map(|h| h.kind) {
                    Some(ObjectKind::Class) => ValueType::Class,
                    Some(ObjectKind::String) => ValueType::String,
                    Some(ObjectKind::Array) => ValueType::Array,
                    Some(ObjectKind::Proc) => ValueType::Proc,
                    Some(ObjectKind::Exception) => ValueType::Exception,
                    Some(ObjectKind::Object | ObjectKind::Env) | None => ValueType::Object,
                }
            }
        })
    }

    fn downcast(&self, value: Value, expected: ValueType) -> BridgeResult<ObjRef> {
        let found = self.vtype(value)?;
        if found != expected {
            return Err(BridgeError::WrongTag {
                expected: expected.name(),
                found: found.name(),
            });
        }
        value.as_object()
    }

    /// Checked downcast to a proc.
    pub fn proc_ptr(&self, value: Value) -> BridgeResult<ObjRef> {
        self.downcast(value, ValueType::Proc)
    }

    /// Checked downcast to a class.
    pub fn class_ptr(&self, value: Value) -> BridgeResult<ObjRef> {
        self.downcast(value, ValueType::Class)
    }

    pub(crate) fn is_proc_raw(&self, raw: RawValue) -> bool {
        matches!(
            raw.as_object().and_then(|ptr| self.heap.get(ptr)).map(|obj| &obj.data),
            Some(HeapData::Proc(_))
        )
    }
}
