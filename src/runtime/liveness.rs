//! Liveness Oracle

use super::error::{BridgeError, BridgeResult};
use super::value::{Classified, Value};
use crate::vm::Engine;

impl Engine {
    /// Has the object behind `value` been reclaimed?
    ///
    /// Immediates are never dead. A heap reference with no header (null
    /// pointer, or a slot that is currently empty) counts as dead. Otherwise
    /// the collector's own predicate decides, which catches references whose
    /// slot was reused by a newer object.
    ///
    /// Safe to call at any time, including while GC is disabled.
    pub fn is_dead(&self, value: Value) -> bool {
        match value.classify() {
            Classified::Immediate(_) => false,
            Classified::Heap(obj) => match self.object_header(obj) {
                Some(header) => self.heap.object_dead_p(obj.ptr(), header),
                None => true,
            },
        }
    }

    pub fn check_live(&self, value: Value) -> BridgeResult<()> {
        match value {
            Value::Object(obj) if self.is_dead(value) => Err(BridgeError::DeadReference(obj)),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::value::ObjRef;

    #[test]
    fn test_immediates_are_never_dead() {
        let mut engine = Engine::new();
        let sym = engine.symbol("x");
        for v in [Value::Nil, Value::Bool(false), Value::Fixnum(0), Value::Float(-1.0), sym] {
            assert!(!engine.is_dead(v));
            assert!(engine.check_live(v).is_ok());
        }
    }

    #[test]
    fn test_null_reference_is_dead() {
        let engine = Engine::new();
        let null = Value::Object(ObjRef::null());
        assert!(engine.is_dead(null));
        assert_eq!(engine.check_live(null), Err(BridgeError::DeadReference(ObjRef::null())));
    }

    #[test]
    fn test_out_of_range_slot_is_dead() {
        let engine = Engine::new();
        let v = Value::Object(ObjRef::from_ptr(crate::vm::value::ObjPtr::new(1 << 20, 0)));
        assert!(engine.is_dead(v));
    }

    #[test]
    fn test_collected_then_reused_slot_stays_dead() {
        let mut engine = Engine::new();
        let mark = engine.arena_save();
        let stale = engine.str_new("gone").expect("str_new");
        engine.arena_restore(mark);
        assert!(!engine.is_dead(stale));

        engine.full_gc();
        assert!(engine.is_dead(stale));

        let fresh = engine.str_new("new").expect("str_new");
        let (Value::Object(a), Value::Object(b)) = (stale, fresh) else {
            panic!("expected heap values");
        };
        assert_eq!(a.index(), b.index(), "freed slot is reused first");
        assert!(engine.is_dead(stale));
        assert!(!engine.is_dead(fresh));
    }
}
