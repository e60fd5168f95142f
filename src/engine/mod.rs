//! Host engine
//!
//! Safe-ish handles over QuickJS, consumed through its raw C API
//! (`rquickjs-sys`). The binding layer above works in terms of these types
//! only; nothing outside this module touches the FFI.
//!
//! Memory model:
//! - [`RawValue`] is the engine's tagged value; counted values are released
//!   explicitly with `free_value`
//! - A [`Runtime`] handle owns the engine runtime and every [`EngineCtx`]
//!   keeps its runtime alive; the engine runtime is freed last
//! - Objects of host classes carry a boxed payload that the engine finalizes
//!   with the object; mark hooks expose the values a payload holds to the
//!   cycle collector
//! - Engine contexts released while a finalizer runs are freed at the next
//!   safe point

mod context;
mod function;
mod module;
mod object;
mod promise;
mod property;
mod runtime;
mod value;

pub use context::{EngineCtx, EngineStr, Thrown};
pub use function::{FunctionFlavor, NativeFn, NativeFunction};
pub use module::{EvalFlags, ModuleInitFn};
pub use object::{ClassId, ErrorKind};
pub use promise::{PromiseCapability, PromiseState};
pub use property::{Atom, MAX_INDEX_ATOM, flags};
pub use runtime::{
    ClassDef, ClassError, FinalizerFn, GcMarkFn, GcStats, HeapStats, JobOutcome, ModuleLoaderFn,
    RejectionTrackerFn, Runtime, RuntimeConfig,
};
pub use value::{ModuleId, RawValue, Tag};
