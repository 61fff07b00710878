//! Argument Accumulator Protocol
//!
//! Host callbacks receive their arguments as one ordered sequence: the
//! positional arguments in call order, followed by the block when one was
//! passed. A nil block is never appended.

use std::fmt;
use std::ops::BitOr;

use super::value::Value;
use crate::vm::{Engine, Unwind};

/// Ordered, host-owned argument list. Built fresh for each call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ArgAccumulator {
    values: Vec<Value>,
}

impl ArgAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(n: usize) -> Self {
        Self {
            values: Vec::with_capacity(n),
        }
    }

    pub fn append(&mut self, value: Value) {
        self.values.push(value);
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<Value> {
        self.values.get(index).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = Value> + '_ {
        self.values.iter().copied()
    }

    pub fn as_slice(&self) -> &[Value] {
        &self.values
    }

    pub fn into_vec(self) -> Vec<Value> {
        self.values
    }

    /// Drain positional args and an optional trailing block.
    pub fn collect(args: impl IntoIterator<Item = Value>, block: Value) -> Self {
        let args = args.into_iter();
        let mut acc = Self::with_capacity(args.size_hint().0 + 1);
        for arg in args {
            acc.append(arg);
        }
        if !block.is_nil() {
            acc.append(block);
        }
        acc
    }
}

impl IntoIterator for ArgAccumulator {
    type Item = Value;
    type IntoIter = std::vec::IntoIter<Value>;

    fn into_iter(self) -> Self::IntoIter {
        self.values.into_iter()
    }
}

/// Accepted argument shape of a host method.
///
/// ```ignore
/// engine.define_method(class, "clamp", ArgSpec::req(1) | ArgSpec::opt(1), clamp)?;
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ArgSpec {
    required: usize,
    optional: usize,
    rest: bool,
    block: bool,
}

impl ArgSpec {
    /// No positional arguments.
    pub const fn none() -> Self {
        Self {
            required: 0,
            optional: 0,
            rest: false,
            block: false,
        }
    }

    /// Any number of positional arguments.
    pub const fn any() -> Self {
        Self {
            rest: true,
            ..Self::none()
        }
    }

    pub const fn req(n: usize) -> Self {
        Self {
            required: n,
            ..Self::none()
        }
    }

    pub const fn opt(n: usize) -> Self {
        Self {
            optional: n,
            ..Self::none()
        }
    }

    pub const fn arg(required: usize, optional: usize) -> Self {
        Self {
            required,
            optional,
            ..Self::none()
        }
    }

    /// Accepts a block. Blocks are never counted toward arity.
    pub const fn block() -> Self {
        Self {
            block: true,
            ..Self::none()
        }
    }

    pub fn required(self) -> usize {
        self.required
    }

    pub fn optional(self) -> usize {
        self.optional
    }

    pub fn takes_rest(self) -> bool {
        self.rest
    }

    pub fn takes_block(self) -> bool {
        self.block
    }

    pub fn accepts(self, given: usize) -> bool {
        given >= self.required && (self.rest || given <= self.required + self.optional)
    }

    /// Raise the guest `ArgumentError` for a bad positional count.
    pub(crate) fn check(self, engine: &mut Engine, given: usize) -> Result<(), Unwind> {
        if self.accepts(given) {
            Ok(())
        } else {
            Err(engine.arity_error(given, self))
        }
    }
}

impl BitOr for ArgSpec {
    type Output = ArgSpec;

    fn bitor(self, rhs: ArgSpec) -> ArgSpec {
        ArgSpec {
            required: self.required + rhs.required,
            optional: self.optional + rhs.optional,
            rest: self.rest || rhs.rest,
            block: self.block || rhs.block,
        }
    }
}

/// Renders the expected count the way arity errors report it.
impl fmt::Display for ArgSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.rest {
            write!(f, "{}+", self.required)
        } else if self.optional > 0 {
            write!(f, "{}..{}", self.required, self.required + self.optional)
        } else {
            write!(f, "{}", self.required)
        }
    }
}

impl Engine {
    /// Arguments of the innermost guest call, block last.
    ///
    /// Meant for host callbacks; outside one it returns an empty accumulator.
    pub fn get_args(&self) -> ArgAccumulator {
        match self.current_ci() {
            Some(ci) => ArgAccumulator::collect(
                ci.args.iter().map(|raw| Value::from_raw(*raw)),
                Value::from_raw(ci.block),
            ),
            None => ArgAccumulator::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_block_is_appended_last() {
        let block = Value::Fixnum(99);
        let acc = ArgAccumulator::collect([Value::Fixnum(1), Value::Nil], block);
        assert_eq!(acc.as_slice(), &[Value::Fixnum(1), Value::Nil, block]);
    }

    #[test]
    fn test_nil_block_is_not_appended() {
        let acc = ArgAccumulator::collect([Value::Nil], Value::Nil);
        assert_eq!(acc.len(), 1);
        assert!(ArgAccumulator::collect(std::iter::empty(), Value::Nil).is_empty());
    }

    #[test]
    fn test_spec_combination() {
        let spec = ArgSpec::req(1) | ArgSpec::opt(2) | ArgSpec::block();
        assert_eq!(spec, ArgSpec::arg(1, 2) | ArgSpec::block());
        assert!(spec.takes_block());
        assert!(!spec.accepts(0));
        assert!(spec.accepts(1));
        assert!(spec.accepts(3));
        assert!(!spec.accepts(4));
        assert!((ArgSpec::req(2) | ArgSpec::any()).accepts(50));
    }

    #[test]
    fn test_spec_display() {
        assert_eq!(ArgSpec::none().to_string(), "0");
        assert_eq!(ArgSpec::req(2).to_string(), "2");
        assert_eq!(ArgSpec::arg(1, 1).to_string(), "1..2");
        assert_eq!((ArgSpec::req(1) | ArgSpec::any()).to_string(), "1+");
    }

    #[test]
    fn test_get_args_outside_a_call_is_empty() {
        let engine = Engine::new();
        assert!(engine.get_args().is_empty());
    }

    fn scalar() -> impl Strategy<Value = Value> {
        prop_oneof![
            Just(Value::Nil),
            any::<bool>().prop_map(Value::Bool),
            any::<i32>().prop_map(|n| Value::Fixnum(n as i64)),
        ]
    }

    proptest! {
        #[test]
        fn accumulator_preserves_order(
            args in proptest::collection::vec(scalar(), 0..16),
            block in proptest::option::of(1i64..1000),
        ) {
            let block_val = block.map(Value::Fixnum).unwrap_or(Value::Nil);
            let acc = ArgAccumulator::collect(args.iter().copied(), block_val);

            let expected_len = args.len() + usize::from(block.is_some());
            prop_assert_eq!(acc.len(), expected_len);
            prop_assert_eq!(&acc.as_slice()[..args.len()], args.as_slice());
            if block.is_some() {
                prop_assert_eq!(acc.get(args.len()), Some(block_val));
            }
        }
    }
}
