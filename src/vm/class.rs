//! Method tables and class lookup.

use std::collections::HashMap;
use std::rc::Rc;

use super::heap::HeapData;
use super::opcodes::Irep;
use super::symbol::Sym;
use super::value::{ObjPtr, RawTag, RawValue};
use super::{Engine, Unwind};
use crate::runtime::args::ArgSpec;
use crate::runtime::callback::HostFn;

/// Native method implemented inside the engine. Unlike host functions these
/// may raise directly.
pub type BuiltinFn = fn(&mut Engine, RawValue, &[RawValue], RawValue) -> Result<RawValue, Unwind>;

#[derive(Clone)]
pub struct HostMethod {
    pub func: Rc<HostFn>,
    pub spec: ArgSpec,
}

#[derive(Clone)]
pub enum Method {
    Builtin(BuiltinFn),
    Iseq(Rc<Irep>),
    Host(HostMethod),
}

pub struct ClassData {
    pub name: Sym,
    pub superclass: Option<ObjPtr>,
    pub methods: HashMap<Sym, Method>,
    /// Singleton methods called on the class object itself.
    pub class_methods: HashMap<Sym, Method>,
}

impl ClassData {
    pub fn new(name: Sym, superclass: Option<ObjPtr>) -> Self {
        Self {
            name,
            superclass,
            methods: HashMap::new(),
            class_methods: HashMap::new(),
        }
    }
}

/// Pointers to the classes the engine itself needs.
#[derive(Clone, Copy)]
pub struct CoreClasses {
    pub object: ObjPtr,
    pub class: ObjPtr,
    pub nil: ObjPtr,
    pub true_: ObjPtr,
    pub false_: ObjPtr,
    pub integer: ObjPtr,
    pub float: ObjPtr,
    pub string: ObjPtr,
    pub symbol: ObjPtr,
    pub array: ObjPtr,
    pub proc_: ObjPtr,
    pub exception: ObjPtr,
    pub standard_error: ObjPtr,
    pub runtime_error: ObjPtr,
    pub argument_error: ObjPtr,
    pub type_error: ObjPtr,
    pub name_error: ObjPtr,
    pub no_method_error: ObjPtr,
    pub zero_division_error: ObjPtr,
    pub local_jump_error: ObjPtr,
    pub index_error: ObjPtr,
    pub syntax_error: ObjPtr,
    pub system_stack_error: ObjPtr,
    pub no_memory_error: ObjPtr,
}

impl CoreClasses {
    pub(crate) fn placeholder() -> Self {
        let n = ObjPtr::null();
        Self {
            object: n,
            class: n,
            nil: n,
            true_: n,
            false_: n,
            integer: n,
            float: n,
            string: n,
            symbol: n,
            array: n,
            proc_: n,
            exception: n,
            standard_error: n,
            runtime_error: n,
            argument_error: n,
            type_error: n,
            name_error: n,
            no_method_error: n,
            zero_division_error: n,
            local_jump_error: n,
            index_error: n,
            syntax_error: n,
            system_stack_error: n,
            no_memory_error: n,
        }
    }
}

impl Engine {
    /// The class of any value.
    pub(crate) fn class_of(&self, v: RawValue) -> ObjPtr {
        let c = &self.classes;
        match v.tag() {
            RawTag::Float => c.float,
            RawTag::Fixnum => c.integer,
            RawTag::Nil | RawTag::Undef => c.nil,
            RawTag::True => c.true_,
            RawTag::False => c.false_,
            RawTag::Symbol => c.symbol,
            RawTag::Object => v
                .as_object()
                .and_then(|ptr| self.heap.get(ptr))
                .map(|obj| obj.header.class)
                .unwrap_or(c.object),
        }
    }

    pub(crate) fn class_data(&self, class: ObjPtr) -> Option<&ClassData> {
        match self.heap.get(class).map(|obj| &obj.data) {
            Some(HeapData::Class(data)) => Some(data),
            _ => None,
        }
    }

    pub(crate) fn class_data_mut(&mut self, class: ObjPtr) -> Option<&mut ClassData> {
        match self.heap.get_mut(class).map(|obj| &mut obj.data) {
            Some(HeapData::Class(data)) => Some(data),
            _ => None,
        }
    }

    pub(crate) fn class_name(&self, class: ObjPtr) -> &str {
        self.class_data(class)
            .map(|data| self.symbols.name(data.name))
            .unwrap_or("Object")
    }

    /// Walk the superclass chain looking for an instance method.
    pub(crate) fn find_method(&self, class: ObjPtr, mid: Sym) -> Option<Method> {
        let mut current = Some(class);
        while let Some(ptr) = current {
            let data = self.class_data(ptr)?;
            if let Some(m) = data.methods.get(&mid) {
                return Some(m.clone());
            }
            current = data.superclass;
        }
        None
    }

    /// Method lookup for a receiver: class objects see their singleton methods
    /// (inherited along the superclass chain) before Class's instance methods.
    pub(crate) fn lookup_method(&self, recv: RawValue, mid: Sym) -> Option<Method> {
        if let Some(ptr) = recv.as_object() {
            if self.class_data(ptr).is_some() {
                let mut current = Some(ptr);
                while let Some(c) = current {
                    let Some(data) = self.class_data(c) else {
                        break;
                    };
                    if let Some(m) = data.class_methods.get(&mid) {
                        return Some(m.clone());
                    }
                    current = data.superclass;
                }
            }
        }
        self.find_method(self.class_of(recv), mid)
    }

    /// True if `class` is `ancestor` or inherits from it.
    pub(crate) fn class_inherits(&self, class: ObjPtr, ancestor: ObjPtr) -> bool {
        let mut current = Some(class);
        while let Some(ptr) = current {
            if ptr == ancestor {
                return true;
            }
            current = self.class_data(ptr).and_then(|data| data.superclass);
        }
        false
    }

    pub(crate) fn is_kind_of(&self, v: RawValue, class: ObjPtr) -> bool {
        self.class_inherits(self.class_of(v), class)
    }

    pub(crate) fn is_class(&self, v: RawValue) -> bool {
        v.as_object()
            .is_some_and(|ptr| self.class_data(ptr).is_some())
    }

    pub(crate) fn define_builtin(&mut self, class: ObjPtr, name: &str, f: BuiltinFn) {
        let mid = self.symbols.intern(name);
        if let Some(data) = self.class_data_mut(class) {
            data.methods.insert(mid, Method::Builtin(f));
        }
    }
}
