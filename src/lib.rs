//! Exception-safe boundary for an embedded, garbage-collected guest engine
//!
//! The guest engine (`compiler`, `vm`) is a small Ruby-flavoured interpreter.
//! Host code talks to it only through `runtime`: every call into the guest is
//! trampolined so a guest raise comes back as a `BridgeError`, and every call
//! out of the guest goes through the callback bridge.
//!
//! ```ignore
//! let mut engine = mrglue::Engine::new();
//! let sum = engine.load_string("[1, 2, 3].map { |x| x * 2 }")?;
//! ```

pub mod compiler;
pub mod runtime;
pub mod vm;

pub use runtime::*;
pub use vm::heap::{HeapConfig, ObjectHeader, ObjectKind};
pub use vm::symbol::Sym;
pub use vm::{Engine, EngineConfig, JumpTarget};

#[cfg(test)]
mod tests;
