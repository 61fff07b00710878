//! Guest heap
//!
//! Objects live in a slot arena. Each slot carries a generation counter that
//! is bumped whenever the collector frees it, so a stale `ObjPtr` can be told
//! apart from the object that reuses its slot:
//! - slot 0 is never handed out and stands in for a null pointer
//! - freed slot indices are recycled through a free list
//! - `live` counts occupied slots and is what the GC switch reports
//!
//! Generations are 24 bits wide and wrap. A handle held across 2^24 reuses of
//! its slot matches the generation again and reads as alive.
//!
//! Marking and sweeping are driven from `vm::gc`; this module only knows how
//! to flip mark bits, enumerate children and reclaim unmarked slots.

use std::rc::Rc;

use super::class::ClassData;
use super::opcodes::Irep;
use super::symbol::Sym;
use super::value::{MAX_GENERATION, MAX_SLOT_INDEX, ObjPtr, RawValue};

// =========================================================================
// Object Headers
// =========================================================================

/// Type tag stored in every object header.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ObjectKind {
    /// A plain instance of some class.
    Object,
    /// A class object.
    Class,
    /// A UTF-8 string.
    String,
    /// An array of values.
    Array,
    /// A block or proc.
    Proc,
    /// An exception instance.
    Exception,
    /// A frame's local variable storage (captured by blocks).
    Env,
}

/// Header for every heap object.
#[derive(Clone, Debug)]
pub struct ObjectHeader {
    /// Object type tag.
    pub kind: ObjectKind,
    /// The object's class.
    pub class: ObjPtr,
    /// Generation of the slot when this object was allocated.
    pub generation: u32,
    /// GC mark bit.
    pub(crate) marked: bool,
}

pub struct ProcData {
    pub irep: Rc<Irep>,
    /// Env of the defining frame.
    pub env: RawValue,
    pub self_val: RawValue,
    /// Block of the defining method, used by `yield` inside the block.
    pub outer_block: RawValue,
    /// Call info id that created the block; `break` unwinds to it.
    pub home: u64,
    /// Call info id of the enclosing method; `return` unwinds to it.
    pub home_method: u64,
}

pub struct ExceptionData {
    pub message: String,
    pub backtrace: Vec<String>,
}

pub struct EnvData {
    pub slots: Vec<RawValue>,
    pub parent: RawValue,
}

pub enum HeapData {
    Object,
    Class(ClassData),
    String(String),
    Array(Vec<RawValue>),
    Proc(ProcData),
    Exception(ExceptionData),
    Env(EnvData),
}

impl HeapData {
    pub fn kind(&self) -> ObjectKind {
        match self {
            HeapData::Object => ObjectKind::Object,
            HeapData::Class(_) => ObjectKind::Class,
            HeapData::String(_) => ObjectKind::String,
            HeapData::Array(_) => ObjectKind::Array,
            HeapData::Proc(_) => ObjectKind::Proc,
            HeapData::Exception(_) => ObjectKind::Exception,
            HeapData::Env(_) => ObjectKind::Env,
        }
    }
}

pub struct HeapObject {
    pub header: ObjectHeader,
    pub ivars: Vec<(Sym, RawValue)>,
    pub data: HeapData,
}

impl HeapObject {
    pub fn ivar(&self, name: Sym) -> RawValue {
        self.ivars
            .iter()
            .find(|(k, _)| *k == name)
            .map(|(_, v)| *v)
            .unwrap_or_default()
    }

    pub fn set_ivar(&mut self, name: Sym, value: RawValue) {
        match self.ivars.iter_mut().find(|(k, _)| *k == name) {
            Some(slot) => slot.1 = value,
            None => self.ivars.push((name, value)),
        }
    }

    fn children(&self, out: &mut Vec<ObjPtr>) {
        fn push(out: &mut Vec<ObjPtr>, v: RawValue) {
            if let Some(ptr) = v.as_object() {
                out.push(ptr);
            }
        }

        if !self.header.class.is_null() {
            out.push(self.header.class);
        }
        for (_, v) in &self.ivars {
            push(out, *v);
        }
        match &self.data {
            HeapData::Object | HeapData::String(_) | HeapData::Exception(_) => {}
            HeapData::Class(class) => {
                if let Some(superclass) = class.superclass {
                    out.push(superclass);
                }
            }
            HeapData::Array(elements) => {
                for v in elements {
                    push(out, *v);
                }
            }
            HeapData::Proc(p) => {
                push(out, p.env);
                push(out, p.self_val);
                push(out, p.outer_block);
            }
            HeapData::Env(env) => {
                for v in &env.slots {
                    push(out, *v);
                }
                push(out, env.parent);
            }
        }
    }
}

// =========================================================================
// Heap
// =========================================================================

/// Configuration for the guest heap.
#[derive(Clone, Debug)]
pub struct HeapConfig {
    /// Live-object count that triggers the first automatic collection.
    pub gc_threshold: usize,
    /// Next threshold as a percentage of the objects surviving a collection.
    pub gc_growth_percent: usize,
    /// Upper bound on simultaneously live objects.
    pub max_objects: usize,
}

impl Default for HeapConfig {
    fn default() -> Self {
        Self {
            gc_threshold: 1024,
            gc_growth_percent: 200,
            max_objects: MAX_SLOT_INDEX as usize,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeapExhausted {
    pub live: usize,
}

struct Slot {
    generation: u32,
    object: Option<HeapObject>,
}

pub struct Heap {
    slots: Vec<Slot>,
    free: Vec<u32>,
    live: usize,
    max_objects: usize,
}

impl Heap {
    pub fn new(config: &HeapConfig) -> Self {
        Self {
            // Slot 0 is the null sentinel.
            slots: vec![Slot {
                generation: 0,
                object: None,
            }],
            free: Vec::new(),
            live: 0,
            max_objects: config.max_objects.min(MAX_SLOT_INDEX as usize),
        }
    }

    /// Allocate a new object of the given class.
    pub fn alloc(&mut self, class: ObjPtr, data: HeapData) -> Result<ObjPtr, HeapExhausted> {
        if self.live >= self.max_objects {
            return Err(HeapExhausted { live: self.live });
        }

        let index = match self.free.pop() {
            Some(index) => index,
            None => {
                let index = self.slots.len();
                if index > MAX_SLOT_INDEX as usize {
                    return Err(HeapExhausted { live: self.live });
                }
                self.slots.push(Slot {
                    generation: 0,
                    object: None,
                });
                index as u32
            }
        };

        let slot = &mut self.slots[index as usize];
        let ptr = ObjPtr::new(index, slot.generation);
        slot.object = Some(HeapObject {
            header: ObjectHeader {
                kind: data.kind(),
                class,
                generation: ptr.generation(),
                marked: false,
            },
            ivars: Vec::new(),
            data,
        });
        self.live += 1;
        Ok(ptr)
    }

    /// Allocate at engine boot, ignoring `max_objects`. Boot objects are
    /// rooted for the engine's lifetime.
    pub(crate) fn alloc_permanent(&mut self, class: ObjPtr, data: HeapData) -> ObjPtr {
        let index = self.slots.len() as u32;
        self.slots.push(Slot {
            generation: 0,
            object: Some(HeapObject {
                header: ObjectHeader {
                    kind: data.kind(),
                    class,
                    generation: 0,
                    marked: false,
                },
                ivars: Vec::new(),
                data,
            }),
        });
        self.live += 1;
        ObjPtr::new(index, 0)
    }

    /// Header of whatever currently occupies the pointer's slot.
    ///
    /// `None` for null pointers and empty slots. A reused slot still yields a
    /// header; `object_dead_p` is what tells the two objects apart.
    pub fn header(&self, ptr: ObjPtr) -> Option<&ObjectHeader> {
        if ptr.is_null() {
            return None;
        }
        self.slots
            .get(ptr.index() as usize)
            .and_then(|slot| slot.object.as_ref())
            .map(|obj| &obj.header)
    }

    /// The collector's dead-object predicate.
    #[inline]
    pub fn object_dead_p(&self, ptr: ObjPtr, header: &ObjectHeader) -> bool {
        header.generation != ptr.generation()
    }

    pub fn is_dead(&self, ptr: ObjPtr) -> bool {
        match self.header(ptr) {
            Some(header) => self.object_dead_p(ptr, header),
            None => true,
        }
    }

    pub fn get(&self, ptr: ObjPtr) -> Option<&HeapObject> {
        if ptr.is_null() {
            return None;
        }
        self.slots
            .get(ptr.index() as usize)
            .and_then(|slot| slot.object.as_ref())
            .filter(|obj| obj.header.generation == ptr.generation())
    }

    pub fn get_mut(&mut self, ptr: ObjPtr) -> Option<&mut HeapObject> {
        if ptr.is_null() {
            return None;
        }
        self.slots
            .get_mut(ptr.index() as usize)
            .and_then(|slot| slot.object.as_mut())
            .filter(|obj| obj.header.generation == ptr.generation())
    }

    /// Number of occupied slots.
    pub fn live(&self) -> usize {
        self.live
    }

    // =========================================================================
    // Collector hooks
    // =========================================================================

    /// Set the mark bit. Returns true if the object was live and not yet marked.
    pub(crate) fn mark(&mut self, ptr: ObjPtr) -> bool {
        match self.get_mut(ptr) {
            Some(obj) if !obj.header.marked => {
                obj.header.marked = true;
                true
            }
            _ => false,
        }
    }

    pub(crate) fn children(&self, ptr: ObjPtr, out: &mut Vec<ObjPtr>) {
        if let Some(obj) = self.get(ptr) {
            obj.children(out);
        }
    }

    /// Free every unmarked object and clear the marks of the survivors.
    /// Returns the number of objects freed.
    pub(crate) fn sweep(&mut self) -> usize {
        let mut freed = 0;
        for (index, slot) in self.slots.iter_mut().enumerate().skip(1) {
            let Some(obj) = slot.object.as_mut() else {
                continue;
            };
            if obj.header.marked {
                obj.header.marked = false;
                continue;
            }
            slot.object = None;
            slot.generation = next_generation(slot.generation);
            self.free.push(index as u32);
            freed += 1;
        }
        self.live -= freed;
        freed
    }
}

fn next_generation(generation: u32) -> u32 {
    if generation >= MAX_GENERATION { 0 } else { generation + 1 }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn heap() -> Heap {
        Heap::new(&HeapConfig::default())
    }

    #[test]
    fn test_alloc_string() {
        let mut heap = heap();
        let ptr = heap
            .alloc(ObjPtr::null(), HeapData::String("hello".into()))
            .expect("allocation failed");
        assert!(!ptr.is_null());
        assert_eq!(heap.live(), 1);

        let obj = heap.get(ptr).expect("object missing");
        assert_eq!(obj.header.kind, ObjectKind::String);
        assert!(matches!(&obj.data, HeapData::String(s) if s == "hello"));
    }

    #[test]
    fn test_sweep_frees_unmarked_and_bumps_generation() {
        let mut heap = heap();
        let keep = heap.alloc(ObjPtr::null(), HeapData::Object).unwrap();
        let drop = heap.alloc(ObjPtr::null(), HeapData::Object).unwrap();

        assert!(heap.mark(keep));
        assert!(!heap.mark(keep), "second mark is a no-op");
        assert_eq!(heap.sweep(), 1);

        assert_eq!(heap.live(), 1);
        assert!(!heap.is_dead(keep));
        assert!(heap.is_dead(drop));
        assert!(heap.header(drop).is_none());

        // The freed slot is recycled under a new generation.
        let reused = heap.alloc(ObjPtr::null(), HeapData::Object).unwrap();
        assert_eq!(reused.index(), drop.index());
        assert_ne!(reused.generation(), drop.generation());
        assert!(heap.header(drop).is_some());
        assert!(heap.is_dead(drop));
        assert!(heap.get(drop).is_none());
    }

    #[test]
    fn test_null_pointer_has_no_header() {
        let heap = heap();
        assert!(heap.header(ObjPtr::null()).is_none());
        assert!(heap.is_dead(ObjPtr::null()));
    }

    #[test]
    fn test_max_objects() {
        let mut heap = Heap::new(&HeapConfig {
            max_objects: 2,
            ..HeapConfig::default()
        });
        heap.alloc(ObjPtr::null(), HeapData::Object).unwrap();
        heap.alloc(ObjPtr::null(), HeapData::Object).unwrap();
        assert_eq!(
            heap.alloc(ObjPtr::null(), HeapData::Object),
            Err(HeapExhausted { live: 2 })
        );
    }

    #[test]
    fn test_children_include_array_elements_and_class() {
        let mut heap = heap();
        let class = heap.alloc(ObjPtr::null(), HeapData::Object).unwrap();
        let elem = heap.alloc(ObjPtr::null(), HeapData::Object).unwrap();
        let arr = heap
            .alloc(class, HeapData::Array(vec![RawValue::object(elem), RawValue::nil()]))
            .unwrap();

        let mut out = Vec::new();
        heap.children(arr, &mut out);
        assert_eq!(out, vec![class, elem]);
    }

    #[test]
    fn test_generation_wraps_to_zero() {
        assert_eq!(next_generation(0), 1);
        assert_eq!(next_generation(MAX_GENERATION - 1), MAX_GENERATION);
        assert_eq!(next_generation(MAX_GENERATION), 0);

        let mut heap = heap();
        let old = heap.alloc(ObjPtr::null(), HeapData::Object).expect("alloc");
        heap.slots[old.index() as usize].generation = MAX_GENERATION;
        heap.slots[old.index() as usize]
            .object
            .as_mut()
            .expect("occupied")
            .header
            .generation = MAX_GENERATION;
        let stale = ObjPtr::new(old.index(), MAX_GENERATION);
        assert_eq!(heap.sweep(), 1);
        assert!(heap.is_dead(stale));

        let reused = heap.alloc(ObjPtr::null(), HeapData::Object).expect("alloc");
        assert_eq!(reused.index(), old.index());
        assert_eq!(reused.generation(), 0);
        assert!(heap.is_dead(stale));
    }
}
