//! Object classes
//!
//! Class identities and the native payload ("opaque") attached to objects
//! of user classes. A payload is a `Box<dyn Any>` owned by the object; the
//! engine calls back into [`finalize_opaque`] when the object dies and into
//! [`mark_opaque`] while tracing, so payloads that hold engine values take
//! part in cycle collection.

use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU32, Ordering};

use log::warn;
use rquickjs_sys as qjs;

use super::runtime::RuntimeState;
use super::value::RawValue;

/// Class identity of an object
///
/// Built-in classes use the engine's fixed ids. User classes get ids from a
/// process-wide counter, so an id is stable for the lifetime of the process
/// and can be defined independently in every runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClassId(pub u32);

static NEXT_CLASS_ID: AtomicU32 = AtomicU32::new(ClassId::FIRST_USER.0);

impl ClassId {
    /// Not a class; returned for non-object values
    pub const INVALID: ClassId = ClassId(0);
    pub const OBJECT: ClassId = ClassId(1);
    pub const ARRAY: ClassId = ClassId(2);
    pub const ERROR: ClassId = ClassId(3);
    /// First id handed out by [`ClassId::new_unique`]
    pub const FIRST_USER: ClassId = ClassId(256);
    /// Ids at or above this are rejected by the engine
    pub const LIMIT: u32 = 1 << 16;

    /// Allocate a fresh user class id
    pub fn new_unique() -> ClassId {
        ClassId(NEXT_CLASS_ID.fetch_add(1, Ordering::Relaxed))
    }

    #[inline]
    pub fn is_user(self) -> bool {
        self >= ClassId::FIRST_USER && self.0 < ClassId::LIMIT
    }

    /// Name of an engine class
    pub fn builtin_name(self) -> Option<&'static str> {
        let name = match self.0 {
            1 => "Object",
            2 => "Array",
            3 => "Error",
            4 => "Number",
            5 => "String",
            6 => "Boolean",
            7 => "Symbol",
            8 | 9 => "Arguments",
            10 => "Date",
            11 => "Module",
            12..=16 => "Function",
            _ => return None,
        };
        Some(name)
    }
}

impl fmt::Display for ClassId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Error object kinds the host can throw
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Error,
    RangeError,
    ReferenceError,
    SyntaxError,
    TypeError,
    InternalError,
}

impl ErrorKind {
    pub const fn name(self) -> &'static str {
        match self {
            ErrorKind::Error => "Error",
            ErrorKind::RangeError => "RangeError",
            ErrorKind::ReferenceError => "ReferenceError",
            ErrorKind::SyntaxError => "SyntaxError",
            ErrorKind::TypeError => "TypeError",
            ErrorKind::InternalError => "InternalError",
        }
    }
}

/// Native payload slot as stored in the engine object
pub(crate) type Payload = Box<dyn Any>;

/// Payload of `obj` if it belongs to class `id`
///
/// # Safety
/// `obj` must be a live value and the returned reference must not outlive it.
pub(crate) unsafe fn payload_of<'a>(obj: RawValue, id: ClassId) -> Option<&'a dyn Any> {
    unsafe {
        let cell = qjs::JS_GetOpaque(obj.0, id.0) as *const Payload;
        cell.as_ref().map(|payload| &**payload)
    }
}

/// Class finalizer installed for every class the host defines
pub(crate) unsafe extern "C" fn finalize_opaque(rt: *mut qjs::JSRuntime, val: qjs::JSValue) {
    unsafe {
        let id = ClassId(qjs::JS_GetClassID(val));
        let cell = qjs::JS_GetOpaque(val, id.0) as *mut Payload;
        if cell.is_null() {
            return;
        }
        let payload = *Box::from_raw(cell);
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| match RuntimeState::from_raw(rt) {
            Some(state) => state.finalize(id, payload),
            None => drop(payload),
        }));
        if outcome.is_err() {
            warn!("finalizer for class {} panicked", id);
        }
    }
}

/// Class mark hook; reports the engine values a payload holds
pub(crate) unsafe extern "C" fn mark_opaque(
    rt: *mut qjs::JSRuntime,
    val: qjs::JSValue,
    mark_func: qjs::JS_MarkFunc,
) {
    unsafe {
        let id = ClassId(qjs::JS_GetClassID(val));
        let Some(payload) = payload_of(RawValue(val), id) else {
            return;
        };
        let Some(mark) = RuntimeState::from_raw(rt).and_then(|state| state.gc_mark_hook(id)) else {
            return;
        };
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            mark(payload, &mut |v: RawValue| qjs::JS_MarkValue(rt, v.0, mark_func))
        }));
        if outcome.is_err() {
            warn!("mark hook for class {} panicked", id);
        }
    }
}
