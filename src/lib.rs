//! qjs - type-safe native bindings for QuickJS
//!
//! The crate wraps the QuickJS C API ([`engine`]) with a binding layer that
//! moves native values in and out of scripts:
//!
//! - [`Value`]: counted handle to an engine value
//! - [`FromJs`] / [`IntoJs`]: conversions for primitives, strings, sequences,
//!   maps, tuples, optionals, functions and class instances
//! - [`FWrapper`] / [`JsFunction`]: native callables exposed to scripts and
//!   script functions called from native code
//! - [`ClassRegistrar`]: native types as script classes with single
//!   inheritance
//! - [`Module`]: native modules with named exports
//! - promise bridging and unhandled rejection reporting
//!
//! # Example
//! ```ignore
//! use qjs::{Context, EvalFlags, Runtime};
//!
//! let rt = Runtime::new();
//! let ctx = Context::new(&rt)?;
//! let module = ctx.add_module("math")?;
//! module.function("add", |a: f64, b: f64| a + b)?;
//! let ns = ctx.import("math")?;
//! assert_eq!(ns.invoke("add", (1, 2))?.get::<f64>()?, 3.0);
//! ```

// Engine
pub mod engine;

// Values and conversions
pub mod convert;
pub mod error;
pub mod property;
pub mod value;

// Functions and classes
pub mod class;
pub mod function;
pub mod registrar;

// Contexts, modules and runtimes
pub mod context;
pub mod module;
pub mod runtime;

// Utilities
pub mod util;

pub use class::Inherits;
pub use context::{Context, ModuleData};
pub use convert::{FromJs, IntoJs, JsStr};
pub use engine::{ClassId, EvalFlags, PromiseState, RuntimeConfig};
pub use error::{Error, Exception, Result};
pub use function::{Callable, CtorWrapper, FWrapper, IntoJsArgs, JsFunction, Method, Rest};
pub use module::Module;
pub use property::{PropertyKey, PropertyProxy};
pub use registrar::ClassRegistrar;
pub use runtime::Runtime;
pub use value::Value;
