//! Script evaluation and modules
//!
//! Source modules are compiled by the engine and linked through the
//! runtime's loader hook. Native modules are engine C modules whose exports
//! are declared up front and filled from an init callback when the module
//! is first evaluated. Each context remembers the modules it loaded by
//! name, so the host can reach their `import.meta`.

use std::ffi::{CStr, c_char, c_int, c_void};
use std::ops::BitOr;
use std::panic::{self, AssertUnwindSafe};
use std::ptr;
use std::rc::Rc;

use log::{debug, trace, warn};
use rquickjs_sys as qjs;

use super::context::{EngineCtx, Thrown, c_string, nul_terminated, throw_raw};
use super::object::ErrorKind;
use super::promise::PromiseState;
use super::runtime::JobOutcome;
use super::value::{ModuleId, RawValue};

/// Native module init callback; returns false with an exception pending
pub type ModuleInitFn = dyn Fn(&EngineCtx, ModuleId) -> bool;

/// Flags for [`EngineCtx::eval`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EvalFlags(u32);

impl EvalFlags {
    /// Global script
    pub const TYPE_GLOBAL: EvalFlags = EvalFlags(qjs::JS_EVAL_TYPE_GLOBAL);
    /// ES module; evaluation yields a promise
    pub const TYPE_MODULE: EvalFlags = EvalFlags(qjs::JS_EVAL_TYPE_MODULE);
    /// Force strict mode
    pub const STRICT: EvalFlags = EvalFlags(qjs::JS_EVAL_FLAG_STRICT);
    /// Compile without running
    pub const COMPILE_ONLY: EvalFlags = EvalFlags(qjs::JS_EVAL_FLAG_COMPILE_ONLY);

    #[inline]
    pub const fn bits(self) -> u32 {
        self.0
    }

    #[inline]
    pub const fn contains(self, other: EvalFlags) -> bool {
        self.0 & other.0 == other.0
    }

    #[inline]
    pub const fn is_module(self) -> bool {
        self.0 & qjs::JS_EVAL_TYPE_MASK == qjs::JS_EVAL_TYPE_MODULE
    }
}

impl BitOr for EvalFlags {
    type Output = EvalFlags;

    fn bitor(self, rhs: EvalFlags) -> EvalFlags {
        EvalFlags(self.0 | rhs.0)
    }
}

impl EngineCtx {
    /// Evaluate source text
    ///
    /// Global scripts yield their completion value. Modules yield a promise
    /// for their evaluation, or the compiled module with `COMPILE_ONLY`.
    pub fn eval(&self, source: &str, filename: &str, flags: EvalFlags) -> RawValue {
        let text = nul_terminated(source);
        let filename = c_string(filename);
        trace!("eval {:?} ({} bytes)", filename, source.len());
        RawValue(unsafe {
            qjs::JS_Eval(
                self.raw(),
                text.as_ptr().cast(),
                source.len() as qjs::size_t,
                filename.as_ptr(),
                flags.bits() as c_int,
            )
        })
    }

    /// Compile module source without evaluating it
    pub fn compile_module(&self, source: &str, name: &str) -> Result<ModuleId, Thrown> {
        let compiled = self.eval(source, name, EvalFlags::TYPE_MODULE | EvalFlags::COMPILE_ONLY);
        if compiled.is_exception() {
            return Err(Thrown);
        }
        let Some(m) = compiled.as_module() else {
            self.free_value(compiled);
            self.throw_type_error("source did not compile to a module");
            return Err(Thrown);
        };
        // The record stays in the context's module list
        self.free_value(compiled);
        Ok(m)
    }

    /// Create a native module whose exports are set by `init`
    pub fn new_native_module(&self, name: &str, init: Rc<ModuleInitFn>) -> Result<ModuleId, Thrown> {
        let cname = c_string(name);
        let m = unsafe { qjs::JS_NewCModule(self.raw(), cname.as_ptr(), Some(init_native_module)) };
        if m.is_null() {
            return Err(Thrown);
        }
        let id = ModuleId(m);
        self.0.native_modules.borrow_mut().insert(id, init);
        self.0.module_names.borrow_mut().insert(name.to_owned(), id);
        debug!("created native module {}", name);
        Ok(id)
    }

    /// Declare an export of a native module
    pub fn add_module_export(&self, m: ModuleId, name: &str) -> Result<(), Thrown> {
        let name = c_string(name);
        match unsafe { qjs::JS_AddModuleExport(self.raw(), m.0, name.as_ptr()) } {
            n if n < 0 => Err(Thrown),
            _ => Ok(()),
        }
    }

    /// Set a declared export (value consumed); only valid during init
    pub fn set_module_export(&self, m: ModuleId, name: &str, v: RawValue) -> Result<(), Thrown> {
        let name = c_string(name);
        match unsafe { qjs::JS_SetModuleExport(self.raw(), m.0, name.as_ptr(), v.0) } {
            n if n < 0 => Err(Thrown),
            _ => Ok(()),
        }
    }

    /// A module this context created or loaded under `name`
    pub fn find_module(&self, name: &str) -> Option<ModuleId> {
        self.0.module_names.borrow().get(name).copied()
    }

    /// The module's `import.meta` object
    pub fn get_import_meta(&self, m: ModuleId) -> RawValue {
        RawValue(unsafe { qjs::JS_GetImportMeta(self.raw(), m.0) })
    }

    /// `import(name)`: a promise for the module namespace
    pub fn dynamic_import(&self, name: &str) -> RawValue {
        let name = c_string(name);
        RawValue(unsafe { qjs::JS_LoadModule(self.raw(), c"".as_ptr(), name.as_ptr()) })
    }

    /// Load and evaluate a module now, returning its namespace
    ///
    /// Runs pending jobs until the module's evaluation settles.
    pub fn import_module(&self, name: &str) -> RawValue {
        let promise = self.dynamic_import(name);
        if promise.is_exception() {
            return promise;
        }
        loop {
            match self.promise_state(promise) {
                Some(PromiseState::Pending) => match self.runtime().execute_pending_job() {
                    JobOutcome::Idle => {
                        self.free_value(promise);
                        return self.throw_internal_error(format!("module '{}' did not finish evaluating", name));
                    }
                    JobOutcome::Failed(Some(ctx)) => {
                        let exc = ctx.get_exception();
                        warn!("job failed while importing {}: {:?}", name, exc);
                        ctx.free_value(exc);
                    }
                    JobOutcome::Failed(None) | JobOutcome::Completed(_) => {}
                },
                Some(PromiseState::Fulfilled) => {
                    let namespace = self.promise_result(promise);
                    self.free_value(promise);
                    return namespace;
                }
                Some(PromiseState::Rejected) => {
                    let reason = self.promise_result(promise);
                    self.free_value(promise);
                    return self.throw(reason);
                }
                None => {
                    self.free_value(promise);
                    return self.throw_type_error("module loading did not produce a promise");
                }
            }
        }
    }
}

unsafe extern "C" fn init_native_module(ctx: *mut qjs::JSContext, m: *mut qjs::JSModuleDef) -> c_int {
    let Some(engine) = (unsafe { EngineCtx::from_raw(ctx) }) else {
        unsafe { throw_raw(ctx, ErrorKind::InternalError, "context was released") };
        return -1;
    };
    let init = engine.0.native_modules.borrow().get(&ModuleId(m)).cloned();
    let Some(init) = init else {
        engine.throw_reference_error("native module is not registered in this context");
        return -1;
    };
    match panic::catch_unwind(AssertUnwindSafe(|| init(&engine, ModuleId(m)))) {
        Ok(true) => 0,
        Ok(false) => -1,
        Err(_) => {
            engine.throw_internal_error("Unknown error");
            -1
        }
    }
}

/// Loader installed on every runtime; defers to the host's loader hook
pub(crate) unsafe extern "C" fn load_module(
    ctx: *mut qjs::JSContext,
    module_name: *const c_char,
    _opaque: *mut c_void,
) -> *mut qjs::JSModuleDef {
    let name = unsafe { CStr::from_ptr(module_name) }.to_string_lossy().into_owned();
    let Some(engine) = (unsafe { EngineCtx::from_raw(ctx) }) else {
        unsafe { throw_raw(ctx, ErrorKind::InternalError, "context was released") };
        return ptr::null_mut();
    };
    let Some(loader) = engine.runtime().state().module_loader() else {
        engine.throw_reference_error(format!("could not load module '{}'", name));
        return ptr::null_mut();
    };
    trace!("loading module {}", name);
    match panic::catch_unwind(AssertUnwindSafe(|| loader(&engine, &name))) {
        Ok(Some(m)) => {
            engine.0.module_names.borrow_mut().insert(name, m);
            m.0
        }
        Ok(None) => {
            if !engine.has_exception() {
                engine.throw_reference_error(format!("could not load module '{}'", name));
            }
            ptr::null_mut()
        }
        Err(_) => {
            engine.throw_internal_error("Unknown error");
            ptr::null_mut()
        }
    }
}
