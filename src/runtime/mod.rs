//! Host side of the guest-engine boundary
//!
//! Everything the host needs to drive the embedded engine safely:
//! - value classification and conversion (value.rs)
//! - the liveness oracle for heap references (liveness.rs)
//! - the GC switch, protection arena and registered roots (gc.rs)
//! - the argument accumulator and arity specs (args.rs)
//! - the exception-safe call trampoline (protect.rs)
//! - the host-callback bridge and marshaling helpers (callback.rs)
//!
//! Guest raises never cross into host frames: host-to-guest calls go through
//! the trampoline, guest-to-host calls through the bridge.

pub mod args;
pub mod callback;
pub mod error;
pub mod gc;
pub mod liveness;
pub mod protect;
pub mod value;

pub use args::{ArgAccumulator, ArgSpec};
pub use callback::{CallSlots, HostFn};
pub use error::{BridgeError, BridgeResult, GuestException};
pub use gc::{ArenaIndex, GcPause, GcStats};
pub use protect::{JumpScope, Program};
pub use value::{Classified, Immediate, ObjRef, Value, ValueType};
