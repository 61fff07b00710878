//! Symbol interning.

use std::collections::HashMap;
use std::rc::Rc;

/// An interned symbol id. Only meaningful for the engine that produced it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Sym(u32);

impl Sym {
    #[inline]
    pub(crate) fn from_id(id: u32) -> Self {
        Sym(id)
    }

    #[inline]
    pub fn id(self) -> u32 {
        self.0
    }
}

#[derive(Default)]
pub struct SymbolTable {
    names: Vec<Rc<str>>,
    index: HashMap<Rc<str>, Sym>,
}

impl SymbolTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn intern(&mut self, name: &str) -> Sym {
        if let Some(sym) = self.index.get(name) {
            return *sym;
        }
        let sym = Sym(self.names.len() as u32);
        let name: Rc<str> = Rc::from(name);
        self.names.push(Rc::clone(&name));
        self.index.insert(name, sym);
        sym
    }

    pub fn lookup(&self, name: &str) -> Option<Sym> {
        self.index.get(name).copied()
    }

    pub fn name(&self, sym: Sym) -> &str {
        self.names
            .get(sym.0 as usize)
            .map(|s| &**s)
            .unwrap_or("")
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }
}
