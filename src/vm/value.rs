//! NaN-boxed word representation used inside the guest engine
//!
//! Every value the interpreter touches (operand stack, locals, heap slots) is a
//! single 64-bit word:
//! - Floats: plain IEEE 754 bits. NaNs are canonicalised to the positive quiet NaN.
//! - Tagged values: `0xFFF8_xxxx_xxxx_xxxx` (negative quiet NaN space).
//!
//! Tag encoding (bits 48-50):
//! - 0x0: Object pointer (slot index in bits 0-23, generation in bits 24-47)
//! - 0x1: nil
//! - 0x2: false
//! - 0x3: true
//! - 0x4: Fixnum (48-bit two's complement)
//! - 0x5: Symbol id
//! - 0x6: undef (engine-internal "no value")
//!
//! Host code never sees this type; `runtime::value` converts it to the public
//! `Value` enum.

use super::symbol::Sym;

/// All tagged words share this prefix.
const BOX: u64 = 0xFFF8_0000_0000_0000;

/// Mask for the tag bits (bits 48-50)
const TAG_MASK: u64 = 0x0007_0000_0000_0000;

/// Mask for the payload (bits 0-47)
const PAYLOAD_MASK: u64 = 0x0000_FFFF_FFFF_FFFF;

const TAG_OBJECT: u64 = 0x0000_0000_0000_0000;
const TAG_NIL: u64 = 0x0001_0000_0000_0000;
const TAG_FALSE: u64 = 0x0002_0000_0000_0000;
const TAG_TRUE: u64 = 0x0003_0000_0000_0000;
const TAG_FIXNUM: u64 = 0x0004_0000_0000_0000;
const TAG_SYMBOL: u64 = 0x0005_0000_0000_0000;
const TAG_UNDEF: u64 = 0x0006_0000_0000_0000;

/// Smallest integer representable as a fixnum.
pub const FIXNUM_MIN: i64 = -(1 << 47);
/// Largest integer representable as a fixnum.
pub const FIXNUM_MAX: i64 = (1 << 47) - 1;

const INDEX_BITS: u32 = 24;
const INDEX_MASK: u64 = (1 << INDEX_BITS) - 1;
const GENERATION_BITS: u32 = 24;
const GENERATION_MASK: u64 = (1 << GENERATION_BITS) - 1;

/// Largest slot index a pointer can encode.
pub const MAX_SLOT_INDEX: u32 = INDEX_MASK as u32;
/// Largest generation a pointer can encode; the next one is 0 again.
pub const MAX_GENERATION: u32 = GENERATION_MASK as u32;

/// A pointer into the guest heap: slot index plus the slot generation it was
/// handed out with. Index 0 is never allocated and doubles as null.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObjPtr {
    index: u32,
    generation: u32,
}

impl ObjPtr {
    #[inline]
    pub(crate) fn new(index: u32, generation: u32) -> Self {
        Self {
            index,
            generation: generation & GENERATION_MASK as u32,
        }
    }

    #[inline]
    pub const fn null() -> Self {
        Self {
            index: 0,
            generation: 0,
        }
    }

    #[inline]
    pub fn is_null(self) -> bool {
        self.index == 0
    }

    #[inline]
    pub fn index(self) -> u32 {
        self.index
    }

    #[inline]
    pub fn generation(self) -> u32 {
        self.generation
    }

    #[inline]
    fn to_payload(self) -> u64 {
        (self.index as u64 & INDEX_MASK) | ((self.generation as u64 & GENERATION_MASK) << INDEX_BITS)
    }

    #[inline]
    fn from_payload(payload: u64) -> Self {
        Self {
            index: (payload & INDEX_MASK) as u32,
            generation: ((payload >> INDEX_BITS) & GENERATION_MASK) as u32,
        }
    }
}

impl std::fmt::Debug for ObjPtr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ObjPtr({}#{})", self.index, self.generation)
    }
}

/// Coarse type tag of a raw word. Heap objects report `Object`; the heap
/// header refines that into the object kind.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RawTag {
    Float,
    Object,
    Nil,
    False,
    True,
    Fixnum,
    Symbol,
    Undef,
}

/// A NaN-boxed guest value.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct RawValue {
    bits: u64,
}

impl RawValue {
    // =========================================================================
    // Constructors
    // =========================================================================

    #[inline]
    pub const fn nil() -> Self {
        Self {
            bits: BOX | TAG_NIL,
        }
    }

    #[inline]
    pub const fn undef() -> Self {
        Self {
            bits: BOX | TAG_UNDEF,
        }
    }

    #[inline]
    pub fn boolean(b: bool) -> Self {
        Self {
            bits: BOX | if b { TAG_TRUE } else { TAG_FALSE },
        }
    }

    /// Create a float value. Every NaN collapses to the positive quiet NaN so
    /// it can never be mistaken for a tagged word.
    #[inline]
    pub fn float(n: f64) -> Self {
        if n.is_nan() {
            Self {
                bits: f64::NAN.to_bits() & !(1 << 63),
            }
        } else {
            Self { bits: n.to_bits() }
        }
    }

    /// Create a fixnum, or `None` when `n` does not fit in 48 bits.
    #[inline]
    pub fn fixnum(n: i64) -> Option<Self> {
        if (FIXNUM_MIN..=FIXNUM_MAX).contains(&n) {
            Some(Self {
                bits: BOX | TAG_FIXNUM | (n as u64 & PAYLOAD_MASK),
            })
        } else {
            None
        }
    }

    /// Integer result of arithmetic: a fixnum when it fits, a float otherwise.
    #[inline]
    pub fn integer(n: i64) -> Self {
        Self::fixnum(n).unwrap_or_else(|| Self::float(n as f64))
    }

    #[inline]
    pub fn symbol(sym: Sym) -> Self {
        Self {
            bits: BOX | TAG_SYMBOL | sym.id() as u64,
        }
    }

    #[inline]
    pub fn object(ptr: ObjPtr) -> Self {
        Self {
            bits: BOX | TAG_OBJECT | ptr.to_payload(),
        }
    }

    #[inline]
    pub const fn from_bits(bits: u64) -> Self {
        Self { bits }
    }

    #[inline]
    pub const fn to_bits(self) -> u64 {
        self.bits
    }

    // =========================================================================
    // Type Checking
    // =========================================================================

    #[inline]
    fn is_boxed(self) -> bool {
        (self.bits & BOX) == BOX
    }

    pub fn tag(self) -> RawTag {
        if !self.is_boxed() {
            return RawTag::Float;
        }
        match self.bits & TAG_MASK {
            TAG_OBJECT => RawTag::Object,
            TAG_NIL => RawTag::Nil,
            TAG_FALSE => RawTag::False,
            TAG_TRUE => RawTag::True,
            TAG_FIXNUM => RawTag::Fixnum,
            TAG_SYMBOL => RawTag::Symbol,
            _ => RawTag::Undef,
        }
    }

    #[inline]
    pub fn is_nil(self) -> bool {
        self.bits == BOX | TAG_NIL
    }

    #[inline]
    pub fn is_undef(self) -> bool {
        self.bits == BOX | TAG_UNDEF
    }

    #[inline]
    pub fn is_object(self) -> bool {
        self.is_boxed() && (self.bits & TAG_MASK) == TAG_OBJECT
    }

    /// Everything except heap pointers is immediate.
    #[inline]
    pub fn is_immediate(self) -> bool {
        !self.is_object()
    }

    /// Only nil and false are falsy.
    #[inline]
    pub fn is_truthy(self) -> bool {
        !(self.is_nil() || self.bits == BOX | TAG_FALSE)
    }

    // =========================================================================
    // Value Extraction
    // =========================================================================

    #[inline]
    pub fn as_float(self) -> Option<f64> {
        if self.is_boxed() {
            None
        } else {
            Some(f64::from_bits(self.bits))
        }
    }

    #[inline]
    pub fn as_fixnum(self) -> Option<i64> {
        if self.tag() == RawTag::Fixnum {
            // Sign-extend the 48-bit payload.
            Some((((self.bits & PAYLOAD_MASK) << 16) as i64) >> 16)
        } else {
            None
        }
    }

    #[inline]
    pub fn as_bool(self) -> Option<bool> {
        match self.tag() {
            RawTag::True => Some(true),
            RawTag::False => Some(false),
            _ => None,
        }
    }

    #[inline]
    pub fn as_symbol(self) -> Option<Sym> {
        if self.tag() == RawTag::Symbol {
            Some(Sym::from_id((self.bits & PAYLOAD_MASK) as u32))
        } else {
            None
        }
    }

    #[inline]
    pub fn as_object(self) -> Option<ObjPtr> {
        if self.is_object() {
            Some(ObjPtr::from_payload(self.bits & PAYLOAD_MASK))
        } else {
            None
        }
    }

    /// Numeric view used by mixed int/float arithmetic.
    #[inline]
    pub fn as_number(self) -> Option<f64> {
        self.as_fixnum()
            .map(|n| n as f64)
            .or_else(|| self.as_float())
    }
}

impl std::fmt::Debug for RawValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.tag() {
            RawTag::Float => write!(f, "Float({})", f64::from_bits(self.bits)),
            RawTag::Object => match self.as_object() {
                Some(ptr) => write!(f, "{:?}", ptr),
                None => write!(f, "Object(?)"),
            },
            RawTag::Nil => write!(f, "Nil"),
            RawTag::False => write!(f, "False"),
            RawTag::True => write!(f, "True"),
            RawTag::Fixnum => write!(f, "Fixnum({})", self.as_fixnum().unwrap_or_default()),
            RawTag::Symbol => write!(f, "Symbol({})", self.bits & PAYLOAD_MASK),
            RawTag::Undef => write!(f, "Undef"),
        }
    }
}

impl Default for RawValue {
    fn default() -> Self {
        Self::nil()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_float_roundtrip() {
        let values = [
            0.0,
            -0.0,
            1.5,
            -3.25,
            f64::MAX,
            f64::MIN,
            f64::INFINITY,
            f64::NEG_INFINITY,
        ];
        for n in values {
            let v = RawValue::float(n);
            assert_eq!(v.tag(), RawTag::Float, "expected float for {}", n);
            assert_eq!(v.as_float().map(f64::to_bits), Some(n.to_bits()));
        }
    }

    #[test]
    fn test_negative_nan_is_not_a_tagged_word() {
        let neg_nan = f64::from_bits(0xFFF8_0000_0000_0000);
        let v = RawValue::float(neg_nan);
        assert_eq!(v.tag(), RawTag::Float);
        assert!(v.as_float().is_some_and(f64::is_nan));
    }

    #[test]
    fn test_fixnum_bounds() {
        assert_eq!(RawValue::fixnum(FIXNUM_MAX).and_then(RawValue::as_fixnum), Some(FIXNUM_MAX));
        assert_eq!(RawValue::fixnum(FIXNUM_MIN).and_then(RawValue::as_fixnum), Some(FIXNUM_MIN));
        assert_eq!(RawValue::fixnum(-1).and_then(RawValue::as_fixnum), Some(-1));
        assert!(RawValue::fixnum(FIXNUM_MAX + 1).is_none());
        assert_eq!(RawValue::integer(FIXNUM_MAX + 1).tag(), RawTag::Float);
    }

    #[test]
    fn test_specials() {
        assert!(RawValue::nil().is_nil());
        assert!(!RawValue::nil().is_truthy());
        assert!(!RawValue::boolean(false).is_truthy());
        assert!(RawValue::boolean(true).is_truthy());
        assert!(RawValue::fixnum(0).is_some_and(RawValue::is_truthy));
        assert!(RawValue::undef().is_undef());
        assert!(RawValue::nil().is_immediate());
    }

    #[test]
    fn test_object_pointer_roundtrip() {
        let ptr = ObjPtr::new(0x00AB_CDEF, 0x0012_3456);
        let v = RawValue::object(ptr);
        assert!(v.is_object());
        assert!(!v.is_immediate());
        assert_eq!(v.as_object(), Some(ptr));
    }

    #[test]
    fn test_null_pointer_is_still_an_object_word() {
        let v = RawValue::object(ObjPtr::null());
        assert_eq!(v.tag(), RawTag::Object);
        assert!(v.as_object().is_some_and(ObjPtr::is_null));
    }
}
