//! Native function objects
//!
//! Host callables are objects of one engine class whose `call` hook
//! dispatches to a shared Rust closure. The closure is invoked with the
//! calling context, the `this` value and the argument list. Arguments and
//! `this` are borrowed; the returned value is owned by the caller. For
//! `new` calls the engine passes the new target as `this`.

use std::ffi::c_int;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::ptr;
use std::rc::Rc;
use std::slice;
use std::sync::LazyLock;

use log::{debug, warn};
use rquickjs_sys as qjs;

use super::context::{EngineCtx, throw_raw};
use super::object::{self, ClassId, ErrorKind};
use super::property::{Atom, flags};
use super::runtime::Runtime;
use super::value::RawValue;

/// Native function signature
pub type NativeFn = dyn Fn(&EngineCtx, RawValue, &[RawValue]) -> RawValue;

/// How a native function may be invoked
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FunctionFlavor {
    /// Ordinary function
    Normal,
    /// Also callable with `new`; receives the new target as `this`
    Constructor,
}

/// Payload of a native function object
#[derive(Clone)]
pub struct NativeFunction {
    pub name: Rc<str>,
    pub flavor: FunctionFlavor,
    pub func: Rc<NativeFn>,
}

impl fmt::Debug for NativeFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NativeFunction")
            .field("name", &self.name)
            .field("flavor", &self.flavor)
            .finish()
    }
}

static FUNCTION_CLASS: LazyLock<ClassId> = LazyLock::new(ClassId::new_unique);

/// Class of native function objects, shared by all runtimes
pub(crate) fn function_class() -> ClassId {
    *FUNCTION_CLASS
}

pub(crate) fn define_function_class(rt: &Runtime) {
    let class = qjs::JSClassDef {
        class_name: c"Function".as_ptr(),
        finalizer: Some(object::finalize_opaque),
        gc_mark: None,
        call: Some(call_native),
        exotic: ptr::null_mut(),
    };
    if unsafe { qjs::JS_NewClass(rt.raw(), function_class().0, &class) } != 0 {
        warn!("could not define the native function class");
    }
}

unsafe extern "C" fn call_native(
    ctx: *mut qjs::JSContext,
    func_obj: qjs::JSValue,
    this_val: qjs::JSValue,
    argc: c_int,
    argv: *mut qjs::JSValue,
    _flags: c_int,
) -> qjs::JSValue {
    unsafe {
        let native = object::payload_of(RawValue(func_obj), function_class())
            .and_then(|payload| payload.downcast_ref::<NativeFunction>())
            .map(|native| native.func.clone());
        let Some(func) = native else {
            return throw_raw(ctx, ErrorKind::TypeError, "not a function").0;
        };
        let Some(engine) = EngineCtx::from_raw(ctx) else {
            return throw_raw(ctx, ErrorKind::InternalError, "context was released").0;
        };
        let args: &[RawValue] = if argc > 0 && !argv.is_null() {
            slice::from_raw_parts(argv as *const RawValue, argc as usize)
        } else {
            &[]
        };
        match panic::catch_unwind(AssertUnwindSafe(|| func(&engine, RawValue(this_val), args))) {
            Ok(v) => v.0,
            Err(_) => {
                debug!("native function panicked");
                engine.throw_internal_error("Unknown error").0
            }
        }
    }
}

impl EngineCtx {
    /// Create a function object running `func`
    pub fn new_native_function(
        &self,
        name: &str,
        length: u32,
        flavor: FunctionFlavor,
        func: Rc<NativeFn>,
    ) -> RawValue {
        let proto = RawValue(unsafe { qjs::JS_GetFunctionProto(self.raw()) });
        let obj = self.new_object_proto_class(proto, function_class());
        self.free_value(proto);
        if obj.is_exception() {
            return obj;
        }
        let native = NativeFunction {
            name: Rc::from(name),
            flavor,
            func,
        };
        let length = RawValue::from_i64(length.into());
        let defined = self
            .set_opaque(obj, Box::new(native))
            .and_then(|()| self.define_property_value(obj, &Atom::new("length"), length, flags::CONFIGURABLE))
            .and_then(|()| {
                let name = self.new_string(name);
                self.define_property_value(obj, &Atom::new("name"), name, flags::CONFIGURABLE)
            });
        if defined.is_err() {
            self.free_value(obj);
            return RawValue::EXCEPTION;
        }
        if flavor == FunctionFlavor::Constructor {
            unsafe { qjs::JS_SetConstructorBit(self.raw(), obj.0, true) };
        }
        obj
    }

    /// Metadata of a native function object
    pub fn native_function(&self, v: RawValue) -> Option<NativeFunction> {
        self.with_opaque(v, function_class(), |any| any.downcast_ref::<NativeFunction>().cloned())
            .flatten()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> (Runtime, EngineCtx) {
        let rt = Runtime::new();
        let ctx = EngineCtx::new(&rt).unwrap();
        (rt, ctx)
    }

    #[test]
    fn test_call_native() {
        let (_rt, ctx) = setup();
        let func: Rc<NativeFn> = Rc::new(|_ctx, _this, args| {
            let sum: f64 = args.iter().filter_map(|v| v.as_f64()).sum();
            RawValue::from_f64(sum)
        });
        let f = ctx.new_native_function("sum", 2, FunctionFlavor::Normal, func);
        assert!(ctx.is_function(f));
        assert!(!ctx.is_constructor(f));
        let args = [RawValue::from_i32(2), RawValue::from_f64(0.5)];
        assert_eq!(ctx.call(f, RawValue::UNDEFINED, &args).as_f64(), Some(2.5));

        let length = ctx.get_property_str(f, "length");
        assert_eq!(length.as_i32(), Some(2));
        let name = ctx.get_property_str(f, "name");
        assert_eq!(ctx.to_string(name).unwrap(), "sum");
        ctx.free_value(name);
        assert_eq!(ctx.native_function(f).unwrap().flavor, FunctionFlavor::Normal);
        ctx.free_value(f);
    }

    #[test]
    fn test_constructor_receives_new_target() {
        let (_rt, ctx) = setup();
        let func: Rc<NativeFn> = Rc::new(|ctx, new_target, _args| ctx.dup_value(new_target));
        let f = ctx.new_native_function("Make", 0, FunctionFlavor::Constructor, func);
        assert!(ctx.is_constructor(f));
        let made = ctx.construct(f, &[]);
        assert!(made.same_identity(f));
        ctx.free_value(made);
        ctx.free_value(f);
    }

    #[test]
    fn test_panic_becomes_internal_error() {
        let (_rt, ctx) = setup();
        let func: Rc<NativeFn> = Rc::new(|_, _, _| panic!("boom"));
        let f = ctx.new_native_function("explode", 0, FunctionFlavor::Normal, func);
        assert!(ctx.call(f, RawValue::UNDEFINED, &[]).is_exception());
        let exc = ctx.get_exception();
        assert_eq!(ctx.to_string(exc).unwrap(), "InternalError: Unknown error");
        ctx.free_value(exc);
        ctx.free_value(f);
    }
}
