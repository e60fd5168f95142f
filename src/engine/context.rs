//! Engine context
//!
//! An [`EngineCtx`] is a counted handle to one QuickJS context: a realm with
//! its own global object, intrinsics and loaded modules. The methods are a
//! thin layer over the engine API with explicit ownership. Arguments are
//! borrowed unless documented as consumed, and returned values are owned
//! by the caller. Fallible operations return [`RawValue::EXCEPTION`] or
//! `Err(Thrown)` with the exception left pending in the context.
//!
//! The engine context's opaque pointer refers back to the handle's shared
//! state, so engine callbacks can recover an `EngineCtx` from a bare
//! `JSContext` pointer. The engine context is freed with the last handle.

use std::any::Any;
use std::cell::RefCell;
use std::collections::HashMap;
use std::ffi::{CStr, CString, c_char, c_int};
use std::fmt;
use std::ops::Deref;
use std::ptr::{self, NonNull};
use std::rc::Rc;
use std::slice;

use log::trace;
use rquickjs_sys as qjs;

use super::module::ModuleInitFn;
use super::object::{self, ClassId, ErrorKind, Payload};
use super::property::Atom;
use super::runtime::{Runtime, RuntimeState};
use super::value::{ModuleId, RawValue};

/// Marker for "an exception is pending in the context"
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Thrown;

impl fmt::Display for Thrown {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("exception pending")
    }
}

impl std::error::Error for Thrown {}

pub(crate) struct CtxInner {
    rt: Runtime,
    raw: *mut qjs::JSContext,
    slot: RefCell<Option<Box<dyn Any>>>,
    pub(crate) native_modules: RefCell<HashMap<ModuleId, Rc<ModuleInitFn>>>,
    pub(crate) module_names: RefCell<HashMap<String, ModuleId>>,
}

impl Drop for CtxInner {
    fn drop(&mut self) {
        trace!("releasing context {:p}", self.raw);
        unsafe { qjs::JS_SetContextOpaque(self.raw, ptr::null_mut()) };
        self.rt.release_context(self.raw);
    }
}

/// Engine context handle
///
/// Cloning yields another handle to the same context.
#[derive(Clone)]
pub struct EngineCtx(pub(crate) Rc<CtxInner>);

impl EngineCtx {
    /// New context with the standard intrinsics
    pub fn new(rt: &Runtime) -> Option<EngineCtx> {
        rt.drain_retired();
        let raw = unsafe { qjs::JS_NewContext(rt.raw()) };
        if raw.is_null() {
            return None;
        }
        let inner = Rc::new(CtxInner {
            rt: rt.clone(),
            raw,
            slot: RefCell::new(None),
            native_modules: RefCell::new(HashMap::new()),
            module_names: RefCell::new(HashMap::new()),
        });
        unsafe { qjs::JS_SetContextOpaque(raw, Rc::as_ptr(&inner) as *mut _) };
        trace!("created context {:p}", raw);
        Some(EngineCtx(inner))
    }

    /// Handle for a raw context created by [`EngineCtx::new`]
    ///
    /// Returns `None` once every handle to the context has been dropped.
    ///
    /// # Safety
    /// `raw` must be a live context of a runtime created by this crate.
    pub(crate) unsafe fn from_raw(raw: *mut qjs::JSContext) -> Option<EngineCtx> {
        unsafe {
            let inner = qjs::JS_GetContextOpaque(raw) as *const CtxInner;
            if inner.is_null() {
                return None;
            }
            Rc::increment_strong_count(inner);
            Some(EngineCtx(Rc::from_raw(inner)))
        }
    }

    #[inline]
    pub(crate) fn raw(&self) -> *mut qjs::JSContext {
        self.0.raw
    }

    #[inline]
    pub fn runtime(&self) -> &Runtime {
        &self.0.rt
    }

    #[inline]
    pub fn ptr_eq(&self, other: &EngineCtx) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }

    // ------------------------------------------------------------------
    // Reference counting
    // ------------------------------------------------------------------

    #[inline]
    pub fn dup_value(&self, v: RawValue) -> RawValue {
        self.0.rt.dup_value(v)
    }

    #[inline]
    pub fn free_value(&self, v: RawValue) {
        self.0.rt.free_value(v)
    }

    /// Reference count of a counted value
    pub fn ref_count(&self, v: RawValue) -> Option<u32> {
        if !v.has_ref_count() {
            return None;
        }
        // Every counted cell starts with a `JSRefCountHeader`
        let count = unsafe { *(v.ptr() as *const c_int) };
        u32::try_from(count).ok()
    }

    // ------------------------------------------------------------------
    // Exceptions
    // ------------------------------------------------------------------

    /// Throw a value (consumed)
    pub fn throw(&self, v: RawValue) -> RawValue {
        RawValue(unsafe { qjs::JS_Throw(self.raw(), v.0) })
    }

    /// Throw a new error object of the given kind
    pub fn throw_error(&self, kind: ErrorKind, message: impl AsRef<str>) -> RawValue {
        unsafe { throw_raw(self.raw(), kind, message.as_ref()) }
    }

    pub fn throw_type_error(&self, message: impl AsRef<str>) -> RawValue {
        self.throw_error(ErrorKind::TypeError, message)
    }

    pub fn throw_range_error(&self, message: impl AsRef<str>) -> RawValue {
        self.throw_error(ErrorKind::RangeError, message)
    }

    pub fn throw_reference_error(&self, message: impl AsRef<str>) -> RawValue {
        self.throw_error(ErrorKind::ReferenceError, message)
    }

    pub fn throw_syntax_error(&self, message: impl AsRef<str>) -> RawValue {
        self.throw_error(ErrorKind::SyntaxError, message)
    }

    pub fn throw_internal_error(&self, message: impl AsRef<str>) -> RawValue {
        self.throw_error(ErrorKind::InternalError, message)
    }

    /// Take the pending exception; `null` when none is pending
    pub fn get_exception(&self) -> RawValue {
        let v = RawValue(unsafe { qjs::JS_GetException(self.raw()) });
        if v.tag() == super::Tag::Uninitialized {
            RawValue::NULL
        } else {
            v
        }
    }

    #[inline]
    pub fn has_exception(&self) -> bool {
        unsafe { qjs::JS_HasException(self.raw()) }
    }

    // ------------------------------------------------------------------
    // Strings and conversions
    // ------------------------------------------------------------------

    pub fn new_string(&self, s: &str) -> RawValue {
        RawValue(unsafe { qjs::JS_NewStringLen(self.raw(), s.as_ptr().cast(), s.len() as qjs::size_t) })
    }

    /// UTF-8 view of a value converted to string
    pub fn to_engine_str(&self, v: RawValue) -> Result<EngineStr, Thrown> {
        let mut len: qjs::size_t = 0;
        let ptr = unsafe { qjs::JS_ToCStringLen2(self.raw(), &mut len, v.0, false) };
        let len = len as usize;
        let ptr = NonNull::new(ptr as *mut c_char).ok_or(Thrown)?;
        let bytes = unsafe { slice::from_raw_parts(ptr.as_ptr() as *const u8, len) };
        if std::str::from_utf8(bytes).is_ok() {
            return Ok(EngineStr(StrRepr::Engine {
                ctx: self.clone(),
                ptr,
                len,
            }));
        }
        // Lone surrogates come out as invalid UTF-8
        let owned = String::from_utf8_lossy(bytes).into_owned().into_boxed_str();
        unsafe { qjs::JS_FreeCString(self.raw(), ptr.as_ptr()) };
        Ok(EngineStr(StrRepr::Owned(owned)))
    }

    pub fn to_string(&self, v: RawValue) -> Result<String, Thrown> {
        self.to_engine_str(v).map(|s| s.to_string())
    }

    pub fn to_bool(&self, v: RawValue) -> bool {
        unsafe { qjs::JS_ToBool(self.raw(), v.0) > 0 }
    }

    pub fn to_number(&self, v: RawValue) -> Result<f64, Thrown> {
        if let Some(n) = v.as_f64() {
            return Ok(n);
        }
        let mut n = 0.0;
        if unsafe { qjs::JS_ToFloat64(self.raw(), &mut n, v.0) } < 0 {
            return Err(Thrown);
        }
        Ok(n)
    }

    // ------------------------------------------------------------------
    // Objects
    // ------------------------------------------------------------------

    pub fn global_object(&self) -> RawValue {
        RawValue(unsafe { qjs::JS_GetGlobalObject(self.raw()) })
    }

    pub fn new_object(&self) -> RawValue {
        RawValue(unsafe { qjs::JS_NewObject(self.raw()) })
    }

    pub fn new_object_proto(&self, proto: RawValue) -> RawValue {
        RawValue(unsafe { qjs::JS_NewObjectProto(self.raw(), proto.0) })
    }

    /// Object of a class, with the class prototype
    pub fn new_object_class(&self, id: ClassId) -> RawValue {
        RawValue(unsafe { qjs::JS_NewObjectClass(self.raw(), id.0 as c_int) })
    }

    pub fn new_object_proto_class(&self, proto: RawValue, id: ClassId) -> RawValue {
        RawValue(unsafe { qjs::JS_NewObjectProtoClass(self.raw(), proto.0, id.0) })
    }

    pub fn new_array(&self) -> RawValue {
        RawValue(unsafe { qjs::JS_NewArray(self.raw()) })
    }

    /// Array holding `items` (consumed)
    pub fn new_array_from(&self, items: Vec<RawValue>) -> RawValue {
        let array = self.new_array();
        let mut items = items.into_iter();
        if array.is_exception() {
            items.for_each(|v| self.free_value(v));
            return array;
        }
        for (i, v) in (0u32..).zip(items.by_ref()) {
            if unsafe { qjs::JS_SetPropertyUint32(self.raw(), array.0, i, v.0) } < 0 {
                items.for_each(|v| self.free_value(v));
                self.free_value(array);
                return RawValue::EXCEPTION;
            }
        }
        array
    }

    #[inline]
    pub fn class_id_of(&self, v: RawValue) -> ClassId {
        ClassId(unsafe { qjs::JS_GetClassID(v.0) })
    }

    pub fn is_function(&self, v: RawValue) -> bool {
        unsafe { qjs::JS_IsFunction(self.raw(), v.0) }
    }

    pub fn is_constructor(&self, v: RawValue) -> bool {
        unsafe { qjs::JS_IsConstructor(self.raw(), v.0) }
    }

    pub fn is_array(&self, v: RawValue) -> bool {
        unsafe { qjs::JS_IsArray(self.raw(), v.0) > 0 }
    }

    pub fn is_error(&self, v: RawValue) -> bool {
        unsafe { qjs::JS_IsError(self.raw(), v.0) }
    }

    // ------------------------------------------------------------------
    // Opaque payloads
    // ------------------------------------------------------------------

    /// Attach a native payload to an object of a user class
    pub fn set_opaque(&self, obj: RawValue, payload: Payload) -> Result<(), Thrown> {
        let id = self.class_id_of(obj);
        if !id.is_user() || unsafe { object::payload_of(obj, id) }.is_some() {
            drop(payload);
            self.throw_type_error("object cannot hold a native payload");
            return Err(Thrown);
        }
        let cell = Box::into_raw(Box::new(payload));
        if unsafe { qjs::JS_SetOpaque(obj.0, cell.cast()) } < 0 {
            drop(unsafe { Box::from_raw(cell) });
            self.throw_type_error("object cannot hold a native payload");
            return Err(Thrown);
        }
        Ok(())
    }

    /// Borrow the payload of an object of class `id`
    pub fn with_opaque<R>(&self, v: RawValue, id: ClassId, f: impl FnOnce(&dyn Any) -> R) -> Option<R> {
        unsafe { object::payload_of(v, id) }.map(f)
    }

    /// Host data attached to the context itself
    pub fn set_opaque_slot(&self, data: Option<Box<dyn Any>>) {
        let old = std::mem::replace(&mut *self.0.slot.borrow_mut(), data);
        drop(old);
    }

    pub fn has_opaque_slot(&self) -> bool {
        self.0.slot.borrow().is_some()
    }

    pub fn with_opaque_slot<R>(&self, f: impl FnOnce(Option<&dyn Any>) -> R) -> R {
        let slot = self.0.slot.borrow();
        f(slot.as_deref())
    }

    // ------------------------------------------------------------------
    // Prototypes
    // ------------------------------------------------------------------

    /// Set the prototype used for new objects of a class (consumed)
    pub fn set_class_proto(&self, id: ClassId, proto: RawValue) {
        unsafe { qjs::JS_SetClassProto(self.raw(), id.0, proto.0) }
    }

    pub fn get_class_proto(&self, id: ClassId) -> RawValue {
        RawValue(unsafe { qjs::JS_GetClassProto(self.raw(), id.0) })
    }

    pub fn get_prototype(&self, obj: RawValue) -> RawValue {
        RawValue(unsafe { qjs::JS_GetPrototype(self.raw(), obj.0) })
    }

    pub fn set_prototype(&self, obj: RawValue, proto: RawValue) -> Result<(), Thrown> {
        match unsafe { qjs::JS_SetPrototype(self.raw(), obj.0, proto.0) } {
            n if n < 0 => Err(Thrown),
            _ => Ok(()),
        }
    }

    /// Link a constructor and its prototype both ways
    pub fn set_constructor(&self, ctor: RawValue, proto: RawValue) {
        unsafe { qjs::JS_SetConstructor(self.raw(), ctor.0, proto.0) }
    }

    pub fn prevent_extensions(&self, obj: RawValue) -> Result<(), Thrown> {
        match unsafe { qjs::JS_PreventExtensions(self.raw(), obj.0) } {
            n if n < 0 => Err(Thrown),
            _ => Ok(()),
        }
    }

    // ------------------------------------------------------------------
    // Properties
    // ------------------------------------------------------------------

    fn atom(&self, key: &Atom) -> Result<AtomRef<'_>, Thrown> {
        let atom = match key {
            Atom::Index(i) => unsafe { qjs::JS_NewAtomUInt32(self.raw(), *i) },
            Atom::Name(name) => unsafe {
                qjs::JS_NewAtomLen(self.raw(), name.as_ptr().cast(), name.len() as qjs::size_t)
            },
        };
        if atom == qjs::JS_ATOM_NULL {
            return Err(Thrown);
        }
        Ok(AtomRef { ctx: self, atom })
    }

    pub fn get_property(&self, obj: RawValue, key: &Atom) -> RawValue {
        match self.atom(key) {
            Ok(atom) => RawValue(unsafe { qjs::JS_GetProperty(self.raw(), obj.0, atom.atom) }),
            Err(Thrown) => RawValue::EXCEPTION,
        }
    }

    pub fn get_property_str(&self, obj: RawValue, name: &str) -> RawValue {
        self.get_property(obj, &Atom::new(name))
    }

    pub fn get_property_u32(&self, obj: RawValue, index: u32) -> RawValue {
        RawValue(unsafe { qjs::JS_GetPropertyUint32(self.raw(), obj.0, index) })
    }

    pub fn get_property_i64(&self, obj: RawValue, index: i64) -> RawValue {
        RawValue(unsafe { qjs::JS_GetPropertyInt64(self.raw(), obj.0, index) })
    }

    /// Assign a property (value consumed); throws where assignment fails
    pub fn set_property(&self, obj: RawValue, key: &Atom, v: RawValue) -> Result<(), Thrown> {
        let atom = match self.atom(key) {
            Ok(atom) => atom,
            Err(Thrown) => {
                self.free_value(v);
                return Err(Thrown);
            }
        };
        match unsafe { qjs::JS_SetProperty(self.raw(), obj.0, atom.atom, v.0) } {
            n if n < 0 => Err(Thrown),
            _ => Ok(()),
        }
    }

    /// Define a data property (value consumed)
    pub fn define_property_value(
        &self,
        obj: RawValue,
        key: &Atom,
        v: RawValue,
        flags: u8,
    ) -> Result<(), Thrown> {
        let atom = match self.atom(key) {
            Ok(atom) => atom,
            Err(Thrown) => {
                self.free_value(v);
                return Err(Thrown);
            }
        };
        let flags = flags as c_int | qjs::JS_PROP_THROW as c_int;
        match unsafe { qjs::JS_DefinePropertyValue(self.raw(), obj.0, atom.atom, v.0, flags) } {
            n if n < 0 => Err(Thrown),
            _ => Ok(()),
        }
    }

    /// Define an accessor property (getter and setter consumed)
    pub fn define_property_get_set(
        &self,
        obj: RawValue,
        key: &Atom,
        getter: RawValue,
        setter: RawValue,
        flags: u8,
    ) -> Result<(), Thrown> {
        let atom = match self.atom(key) {
            Ok(atom) => atom,
            Err(Thrown) => {
                self.free_value(getter);
                self.free_value(setter);
                return Err(Thrown);
            }
        };
        let flags = flags as c_int | qjs::JS_PROP_THROW as c_int;
        let status = unsafe {
            qjs::JS_DefinePropertyGetSet(self.raw(), obj.0, atom.atom, getter.0, setter.0, flags)
        };
        if status < 0 { Err(Thrown) } else { Ok(()) }
    }

    /// Own string keys in property order
    pub fn get_own_property_names(&self, obj: RawValue, enumerable_only: bool) -> Result<Vec<Atom>, Thrown> {
        let mut flags = qjs::JS_GPN_STRING_MASK;
        if enumerable_only {
            flags |= qjs::JS_GPN_ENUM_ONLY;
        }
        let mut tab = ptr::null_mut();
        let mut len = 0u32;
        let status = unsafe {
            qjs::JS_GetOwnPropertyNames(self.raw(), &mut tab, &mut len, obj.0, flags as c_int)
        };
        if status < 0 {
            return Err(Thrown);
        }
        let entries = unsafe { slice::from_raw_parts(tab, len as usize) };
        let mut names = Vec::with_capacity(entries.len());
        let mut result = Ok(());
        for entry in entries {
            let name = unsafe { qjs::JS_AtomToCString(self.raw(), entry.atom) };
            if name.is_null() {
                result = Err(Thrown);
                break;
            }
            names.push(Atom::new(&unsafe { CStr::from_ptr(name) }.to_string_lossy()));
            unsafe { qjs::JS_FreeCString(self.raw(), name) };
        }
        unsafe { qjs::JS_FreePropertyEnum(self.raw(), tab, len) };
        result.map(|()| names)
    }

    /// `length` of an array-like
    pub fn get_length(&self, obj: RawValue) -> Result<i64, Thrown> {
        let mut len = 0i64;
        if unsafe { qjs::JS_GetLength(self.raw(), obj.0, &mut len) } < 0 {
            return Err(Thrown);
        }
        Ok(len)
    }

    // ------------------------------------------------------------------
    // Calls
    // ------------------------------------------------------------------

    pub fn call(&self, func: RawValue, this: RawValue, args: &[RawValue]) -> RawValue {
        RawValue(unsafe {
            qjs::JS_Call(self.raw(), func.0, this.0, args.len() as c_int, args.as_ptr() as *mut _)
        })
    }

    /// `new func(...args)`
    pub fn construct(&self, func: RawValue, args: &[RawValue]) -> RawValue {
        RawValue(unsafe {
            qjs::JS_CallConstructor(self.raw(), func.0, args.len() as c_int, args.as_ptr() as *mut _)
        })
    }

    /// Call a method by name
    pub fn invoke(&self, obj: RawValue, name: &str, args: &[RawValue]) -> RawValue {
        let Ok(atom) = self.atom(&Atom::new(name)) else {
            return RawValue::EXCEPTION;
        };
        RawValue(unsafe {
            qjs::JS_Invoke(self.raw(), obj.0, atom.atom, args.len() as c_int, args.as_ptr() as *mut _)
        })
    }

    // ------------------------------------------------------------------
    // JSON
    // ------------------------------------------------------------------

    pub fn parse_json(&self, text: &str, filename: &str) -> RawValue {
        let source = nul_terminated(text);
        let filename = c_string(filename);
        RawValue(unsafe {
            qjs::JS_ParseJSON(self.raw(), source.as_ptr().cast(), text.len() as qjs::size_t, filename.as_ptr())
        })
    }

    /// `JSON.stringify(v, replacer, space)`; `undefined` for unserializable
    /// values
    pub fn json_stringify(&self, v: RawValue, replacer: RawValue, space: RawValue) -> RawValue {
        RawValue(unsafe { qjs::JS_JSONStringify(self.raw(), v.0, replacer.0, space.0) })
    }

    // ------------------------------------------------------------------
    // Jobs
    // ------------------------------------------------------------------

    /// Queue a call of `func` with no arguments on the runtime's job queue
    pub fn enqueue_call(&self, func: RawValue) -> Result<(), Thrown> {
        let mut argv = [func.0];
        // The engine does not keep the context alive for queued jobs
        unsafe { qjs::JS_DupContext(self.raw()) };
        if unsafe { qjs::JS_EnqueueJob(self.raw(), Some(run_call_job), 1, argv.as_mut_ptr()) } < 0 {
            unsafe { qjs::JS_FreeContext(self.raw()) };
            return Err(Thrown);
        }
        self.0.rt.hold_job_context(self.raw());
        Ok(())
    }
}

impl fmt::Debug for EngineCtx {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineCtx").field("raw", &self.0.raw).finish()
    }
}

unsafe extern "C" fn run_call_job(
    ctx: *mut qjs::JSContext,
    _argc: c_int,
    argv: *mut qjs::JSValue,
) -> qjs::JSValue {
    unsafe {
        let result = qjs::JS_Call(ctx, *argv, qjs::JS_UNDEFINED, 0, ptr::null_mut());
        if let Some(state) = RuntimeState::from_raw(qjs::JS_GetRuntime(ctx)) {
            state.release_job_context(ctx);
        }
        result
    }
}

/// Engine atom for the duration of one operation
struct AtomRef<'a> {
    ctx: &'a EngineCtx,
    atom: qjs::JSAtom,
}

impl Drop for AtomRef<'_> {
    fn drop(&mut self) {
        unsafe { qjs::JS_FreeAtom(self.ctx.raw(), self.atom) }
    }
}

enum StrRepr {
    Engine {
        ctx: EngineCtx,
        ptr: NonNull<c_char>,
        len: usize,
    },
    Owned(Box<str>),
}

/// String contents of an engine value
///
/// Borrows the engine's UTF-8 buffer where it can; the buffer is released
/// on drop.
pub struct EngineStr(StrRepr);

impl Deref for EngineStr {
    type Target = str;

    fn deref(&self) -> &str {
        match &self.0 {
            StrRepr::Engine { ptr, len, .. } => unsafe {
                // Checked as UTF-8 on creation
                std::str::from_utf8_unchecked(slice::from_raw_parts(ptr.as_ptr() as *const u8, *len))
            },
            StrRepr::Owned(s) => s,
        }
    }
}

impl Drop for EngineStr {
    fn drop(&mut self) {
        if let StrRepr::Engine { ctx, ptr, .. } = &self.0 {
            unsafe { qjs::JS_FreeCString(ctx.raw(), ptr.as_ptr()) };
        }
    }
}

impl fmt::Debug for EngineStr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&**self, f)
    }
}

impl fmt::Display for EngineStr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self)
    }
}

/// Throw on a raw context, with or without a handle
///
/// # Safety
/// `ctx` must be a live context.
pub(crate) unsafe fn throw_raw(ctx: *mut qjs::JSContext, kind: ErrorKind, message: &str) -> RawValue {
    let message = c_string(message);
    let fmt = c"%s".as_ptr();
    let v = unsafe {
        match kind {
            ErrorKind::Error => qjs::JS_ThrowPlainError(ctx, fmt, message.as_ptr()),
            ErrorKind::RangeError => qjs::JS_ThrowRangeError(ctx, fmt, message.as_ptr()),
            ErrorKind::ReferenceError => qjs::JS_ThrowReferenceError(ctx, fmt, message.as_ptr()),
            ErrorKind::SyntaxError => qjs::JS_ThrowSyntaxError(ctx, fmt, message.as_ptr()),
            ErrorKind::TypeError => qjs::JS_ThrowTypeError(ctx, fmt, message.as_ptr()),
            ErrorKind::InternalError => qjs::JS_ThrowInternalError(ctx, fmt, message.as_ptr()),
        }
    };
    RawValue(v)
}

/// C string for the engine; interior NULs are dropped
pub(crate) fn c_string(s: &str) -> CString {
    CString::new(s).unwrap_or_else(|e| {
        let mut bytes = e.into_vec();
        bytes.retain(|&b| b != 0);
        CString::new(bytes).unwrap_or_default()
    })
}

/// Source text with the terminating NUL the parser expects
pub(crate) fn nul_terminated(text: &str) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(text.len() + 1);
    bytes.extend_from_slice(text.as_bytes());
    bytes.push(0);
    bytes
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{Tag, flags};

    fn setup() -> (Runtime, EngineCtx) {
        let rt = Runtime::new();
        let ctx = EngineCtx::new(&rt).unwrap();
        (rt, ctx)
    }

    #[test]
    fn test_strings() {
        let (_rt, ctx) = setup();
        let s = ctx.new_string("héllo");
        assert_eq!(s.tag(), Tag::String);
        assert_eq!(&*ctx.to_engine_str(s).unwrap(), "héllo");
        assert_eq!(ctx.to_string(RawValue::from_f64(2.5)).unwrap(), "2.5");
        assert_eq!(ctx.to_string(RawValue::NULL).unwrap(), "null");
        ctx.free_value(s);
    }

    #[test]
    fn test_properties_in_order() {
        let (_rt, ctx) = setup();
        let obj = ctx.new_object();
        for (name, n) in [("b", 1), ("a", 2), ("c", 3)] {
            ctx.set_property(obj, &Atom::new(name), RawValue::from_i32(n)).unwrap();
        }
        ctx.define_property_value(obj, &Atom::new("hidden"), RawValue::TRUE, flags::CONFIGURABLE)
            .unwrap();
        let keys: Vec<String> = ctx
            .get_own_property_names(obj, true)
            .unwrap()
            .iter()
            .map(|k| k.to_string())
            .collect();
        assert_eq!(keys, ["b", "a", "c"]);
        assert_eq!(ctx.get_own_property_names(obj, false).unwrap().len(), 4);
        assert_eq!(ctx.get_property(obj, &Atom::new("a")).as_i32(), Some(2));
        assert!(ctx.get_property(obj, &Atom::new("zzz")).is_undefined());
        ctx.free_value(obj);
    }

    #[test]
    fn test_arrays() {
        let (_rt, ctx) = setup();
        let items = vec![ctx.new_string("x"), RawValue::from_i32(7)];
        let array = ctx.new_array_from(items);
        assert!(ctx.is_array(array));
        assert_eq!(ctx.get_length(array).unwrap(), 2);
        assert_eq!(ctx.get_property_u32(array, 1).as_i32(), Some(7));
        assert_eq!(ctx.class_id_of(array), ClassId::ARRAY);
        ctx.free_value(array);
    }

    #[test]
    fn test_thrown_errors() {
        let (_rt, ctx) = setup();
        assert!(ctx.get_exception().is_null());
        assert!(ctx.throw_range_error("out of range").is_exception());
        assert!(ctx.has_exception());
        let exc = ctx.get_exception();
        assert!(ctx.is_error(exc));
        assert_eq!(ctx.to_string(exc).unwrap(), "RangeError: out of range");
        ctx.free_value(exc);
        assert!(!ctx.has_exception());
    }

    #[test]
    fn test_ref_count() {
        let (_rt, ctx) = setup();
        let obj = ctx.new_object();
        assert_eq!(ctx.ref_count(obj), Some(1));
        let copy = ctx.dup_value(obj);
        assert_eq!(ctx.ref_count(obj), Some(2));
        ctx.free_value(copy);
        assert_eq!(ctx.ref_count(obj), Some(1));
        assert_eq!(ctx.ref_count(RawValue::from_i32(1)), None);
        ctx.free_value(obj);
    }

    #[test]
    fn test_opaque_slot() {
        let (_rt, ctx) = setup();
        assert!(!ctx.has_opaque_slot());
        ctx.set_opaque_slot(Some(Box::new(17u32)));
        let n = ctx.with_opaque_slot(|slot| slot.and_then(|a| a.downcast_ref::<u32>()).copied());
        assert_eq!(n, Some(17));

        // Plain objects cannot carry payloads
        let obj = ctx.new_object();
        assert!(ctx.set_opaque(obj, Box::new(1u8)).is_err());
        ctx.free_value(ctx.get_exception());
        ctx.free_value(obj);
    }

    #[test]
    fn test_handle_recovery() {
        let (_rt, ctx) = setup();
        let found = unsafe { EngineCtx::from_raw(ctx.raw()) }.unwrap();
        assert!(found.ptr_eq(&ctx));
    }

    #[test]
    fn test_json() {
        let (_rt, ctx) = setup();
        let v = ctx.parse_json(r#"{"a": [1, 2]}"#, "<test>");
        let text = ctx.json_stringify(v, RawValue::UNDEFINED, RawValue::UNDEFINED);
        assert_eq!(ctx.to_string(text).unwrap(), r#"{"a":[1,2]}"#);
        ctx.free_value(text);
        ctx.free_value(v);

        assert!(ctx.parse_json("{oops", "<test>").is_exception());
        let exc = ctx.get_exception();
        assert!(ctx.to_string(exc).unwrap().starts_with("SyntaxError"));
        ctx.free_value(exc);
    }
}
