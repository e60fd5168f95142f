//! Execution context
//!
//! A [`Context`] owns one engine context and everything the binding layer
//! attaches to it: native modules, the module loader and the handler for
//! unhandled promise rejections. The engine context's opaque slot points
//! back at the `Context`, so engine callbacks can find it again.

use std::cell::RefCell;
use std::fmt;
use std::path::Path;
use std::rc::{Rc, Weak};

use log::debug;

use crate::class;
use crate::convert::IntoJs;
use crate::engine::{ClassId, EngineCtx, EvalFlags, ModuleId, PromiseState};
use crate::error::{Error, Result};
use crate::function::{self, Callable, FWrapper};
use crate::module::{Module, ModuleState};
use crate::registrar::ClassRegistrar;
use crate::runtime::Runtime;
use crate::util;
use crate::value::Value;

/// Source of a module returned by a module loader
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ModuleData {
    /// Module source; `None` when the module does not exist
    pub source: Option<String>,
    /// Canonical URL, exposed as `import.meta.url`; defaults to the name
    pub url: Option<String>,
}

impl ModuleData {
    pub fn new(source: impl Into<String>) -> Self {
        ModuleData {
            source: Some(source.into()),
            url: None,
        }
    }

    pub fn with_url(url: impl Into<String>, source: impl Into<String>) -> Self {
        ModuleData {
            source: Some(source.into()),
            url: Some(url.into()),
        }
    }

    /// A module that could not be found
    pub fn missing() -> Self {
        ModuleData::default()
    }
}

type ModuleLoader = dyn Fn(&str) -> ModuleData;
type RejectionHandler = dyn Fn(Value);

/// Load modules from the file system
fn default_module_loader(name: &str) -> ModuleData {
    let source = match util::read_file(name) {
        Ok(source) => source,
        Err(e) => {
            debug!("could not read module '{}': {}", name, e);
            None
        }
    };
    ModuleData {
        source,
        url: Some(util::to_uri(name)),
    }
}

pub(crate) struct ContextState {
    engine: EngineCtx,
    modules: RefCell<Vec<Rc<ModuleState>>>,
    module_loader: RefCell<Rc<ModuleLoader>>,
    rejection_handler: RefCell<Option<Rc<RejectionHandler>>>,
}

impl Drop for ContextState {
    fn drop(&mut self) {
        // Export values must be released while the engine context is alive
        let modules = std::mem::take(&mut *self.modules.borrow_mut());
        drop(modules);
        self.engine.set_opaque_slot(None);
    }
}

/// Handle to an execution context
///
/// Cloning yields another handle to the same context; the engine context
/// is freed when the last handle is dropped.
#[derive(Clone)]
pub struct Context(Rc<ContextState>);

impl Context {
    /// New context in a runtime
    pub fn new(rt: &Runtime) -> Result<Context> {
        let engine = EngineCtx::new(rt.engine())
            .ok_or_else(|| Error::Runtime("could not create engine context".to_string()))?;
        Context::from_engine(engine)
    }

    /// Attach the binding layer to an existing engine context
    ///
    /// Fails when another binding context is already attached.
    pub fn from_engine(engine: EngineCtx) -> Result<Context> {
        if engine.has_opaque_slot() {
            return Err(Error::Runtime(
                "engine context already has a binding context".to_string(),
            ));
        }
        let loader: Rc<ModuleLoader> = Rc::new(default_module_loader);
        let state = Rc::new(ContextState {
            engine,
            modules: RefCell::new(Vec::new()),
            module_loader: RefCell::new(loader),
            rejection_handler: RefCell::new(None),
        });
        let weak: Weak<ContextState> = Rc::downgrade(&state);
        state.engine.set_opaque_slot(Some(Box::new(weak)));
        Ok(Context(state))
    }

    /// The binding context attached to an engine context
    pub fn get(engine: &EngineCtx) -> Option<Context> {
        engine
            .with_opaque_slot(|slot| {
                slot.and_then(|any| any.downcast_ref::<Weak<ContextState>>())
                    .and_then(Weak::upgrade)
            })
            .map(Context)
    }

    #[inline]
    pub fn engine(&self) -> &EngineCtx {
        &self.0.engine
    }

    #[inline]
    pub fn ptr_eq(&self, other: &Context) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }

    // ------------------------------------------------------------------
    // Values
    // ------------------------------------------------------------------

    /// `globalThis`
    pub fn global(&self) -> Value {
        Value::from_raw(self.engine(), self.engine().global_object())
    }

    pub fn new_object(&self) -> Value {
        Value::from_raw(self.engine(), self.engine().new_object())
    }

    pub fn new_array(&self) -> Value {
        Value::from_raw(self.engine(), self.engine().new_array())
    }

    /// Convert a native value
    pub fn new_value<T: IntoJs>(&self, value: T) -> Result<Value> {
        let engine = self.engine();
        Value::check(engine, value.into_js(engine)?)
    }

    /// Native callable as a named engine function
    pub fn new_function<F, M>(&self, name: &str, f: F) -> Result<Value>
    where
        F: Callable<M>,
        F::Output: IntoJs,
        M: 'static,
    {
        function::new_function(self.engine(), name, f)
    }

    /// Take the pending exception (`null` when none is pending)
    pub fn get_exception(&self) -> Value {
        Value::from_raw(self.engine(), self.engine().get_exception())
    }

    // ------------------------------------------------------------------
    // Classes and modules
    // ------------------------------------------------------------------

    /// Register `T` with an explicit prototype object
    ///
    /// Prefer [`Context::class_registrar`] or [`Module::register_class`].
    pub fn register_class<T: 'static>(&self, name: &str, proto: Value) -> Result<ClassId> {
        class::register_class::<T>(self.engine(), name, proto.release())
    }

    /// Start registering a class that no module exports
    pub fn class_registrar<T: 'static>(&self, name: &str) -> ClassRegistrar<T> {
        ClassRegistrar::new(self, name, None)
    }

    /// New native module
    pub fn add_module(&self, name: &str) -> Result<Module> {
        let module = Module::new(self, name)?;
        self.0.modules.borrow_mut().push(module.state());
        debug!("added native module '{}'", name);
        Ok(module)
    }

    /// Replace the module loader
    pub fn set_module_loader(&self, loader: impl Fn(&str) -> ModuleData + 'static) {
        *self.0.module_loader.borrow_mut() = Rc::new(loader);
    }

    /// Handle promise rejections nothing ever handles
    pub fn on_unhandled_rejection(&self, handler: impl Fn(Value) + 'static) {
        *self.0.rejection_handler.borrow_mut() = Some(Rc::new(handler));
    }

    pub(crate) fn rejection_handler(&self) -> Option<Rc<RejectionHandler>> {
        self.0.rejection_handler.borrow().clone()
    }

    /// Compile a module through the loader; called by the engine
    pub(crate) fn load_module(&self, name: &str) -> Option<ModuleId> {
        let engine = self.engine();
        let loader = self.0.module_loader.borrow().clone();
        let data = loader(name);
        let Some(source) = data.source else {
            engine.throw_reference_error(format!("Could not load module filename '{}'", name));
            return None;
        };
        let url = data.url.unwrap_or_else(|| name.to_string());
        debug!("loading module '{}' from {}", name, url);
        let m = engine.compile_module(&source, name).ok()?;
        let meta = Value::check(engine, engine.get_import_meta(m)).ok()?;
        meta.set_prop("url", url).ok()?;
        meta.set_prop("main", false).ok()?;
        Some(m)
    }

    // ------------------------------------------------------------------
    // Evaluation
    // ------------------------------------------------------------------

    /// Evaluate source text
    ///
    /// A module whose evaluation fails with an Error throws that error
    /// instead of returning a rejected promise.
    pub fn eval(&self, source: &str, filename: &str, flags: EvalFlags) -> Result<Value> {
        let engine = self.engine();
        let v = engine.eval(source, filename, flags);
        if engine.promise_state(v) == Some(PromiseState::Rejected) {
            let result = engine.promise_result(v);
            if engine.is_error(result) {
                engine.free_value(v);
                engine.throw(result);
                return Err(Error::exception(engine));
            }
            engine.free_value(result);
        }
        Value::check(engine, v)
    }

    /// Evaluate the contents of a file
    pub fn eval_file(&self, path: impl AsRef<Path>, flags: EvalFlags) -> Result<Value> {
        let path = path.as_ref();
        let filename = path.to_string_lossy();
        let Some(source) = util::read_file(path)? else {
            return Err(Error::Runtime(format!("Can't read file: {}", filename)));
        };
        self.eval(&source, &filename, flags)
    }

    /// Parse JSON text
    pub fn from_json(&self, text: &str, filename: &str) -> Result<Value> {
        let engine = self.engine();
        Value::check(engine, engine.parse_json(text, filename))
    }

    /// Import a module and return its namespace
    pub fn import(&self, name: &str) -> Result<Value> {
        let engine = self.engine();
        Value::check(engine, engine.import_module(name))
    }

    /// Import a module and return a promise for its namespace
    pub fn dynamic_import(&self, name: &str) -> Result<Value> {
        let engine = self.engine();
        Value::check(engine, engine.dynamic_import(name))
    }

    // ------------------------------------------------------------------
    // Jobs
    // ------------------------------------------------------------------

    /// Queue a native closure on the runtime's job queue
    ///
    /// The closure runs once, when the embedder drains the queue.
    pub fn enqueue_job<F, R>(&self, job: F) -> Result<()>
    where
        F: FnOnce() -> R + 'static,
        R: IntoJs + 'static,
    {
        let slot = RefCell::new(Some(job));
        let func = self.new_value(FWrapper::new(
            move || -> Result<R> {
                let job = slot.borrow_mut().take();
                job.map(|job| job())
                    .ok_or_else(|| Error::Runtime("job already ran".to_string()))
            },
            "job",
        ))?;
        self.engine()
            .enqueue_call(func.raw())
            .map_err(|_| Error::exception(self.engine()))
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("engine", &self.0.engine)
            .field("modules", &self.0.modules.borrow().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::io::Write;

    #[test]
    fn test_get_recovers_context() {
        let rt = Runtime::new();
        let ctx = Context::new(&rt).unwrap();
        let found = Context::get(ctx.engine()).unwrap();
        assert!(found.ptr_eq(&ctx));
        assert!(Context::from_engine(ctx.engine().clone()).is_err());
    }

    #[test]
    fn test_eval_json() {
        let rt = Runtime::new();
        let ctx = Context::new(&rt).unwrap();
        let v = ctx
            .eval("({items: [1, 2, 3]})", "<eval>", EvalFlags::TYPE_GLOBAL)
            .unwrap();
        assert_eq!(v.get_prop::<Vec<i32>, _>("items").unwrap(), [1, 2, 3]);

        let err = ctx.from_json("{oops", "bad.json").unwrap_err();
        let Error::Exception(exc) = err else {
            panic!("expected an exception");
        };
        assert!(exc.value().get::<String>().unwrap().starts_with("SyntaxError"));
    }

    #[test]
    fn test_eval_file() {
        let rt = Runtime::new();
        let ctx = Context::new(&rt).unwrap();
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "[true, false]").unwrap();
        let v = ctx.eval_file(file.path(), EvalFlags::TYPE_GLOBAL).unwrap();
        assert_eq!(v.get::<Vec<bool>>().unwrap(), [true, false]);

        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope.json");
        let err = ctx.eval_file(&missing, EvalFlags::TYPE_GLOBAL).unwrap_err();
        assert_eq!(
            err.to_string(),
            format!("Can't read file: {}", missing.display())
        );
    }

    #[test]
    fn test_custom_module_loader() {
        let rt = Runtime::new();
        let ctx = Context::new(&rt).unwrap();
        ctx.set_module_loader(|name| match name {
            "settings" => ModuleData::with_url("mem://settings", "export default {debug: true};"),
            _ => ModuleData::missing(),
        });
        let ns = ctx.import("settings").unwrap();
        let settings = ns.get_prop::<Value, _>("default").unwrap();
        assert!(settings.get_prop::<bool, _>("debug").unwrap());

        let m = ctx.engine().find_module("settings").unwrap();
        let meta = Value::from_raw(ctx.engine(), ctx.engine().get_import_meta(m));
        assert_eq!(meta.get_prop::<String, _>("url").unwrap(), "mem://settings");
        assert!(!meta.get_prop::<bool, _>("main").unwrap());

        let err = ctx.import("elsewhere").unwrap_err();
        let Error::Exception(exc) = err else {
            panic!("expected an exception");
        };
        assert_eq!(
            exc.value().get::<String>().unwrap(),
            "ReferenceError: Could not load module filename 'elsewhere'"
        );
    }

    #[test]
    fn test_enqueue_job_runs_once() {
        let rt = Runtime::new();
        let ctx = Context::new(&rt).unwrap();
        let runs = Rc::new(Cell::new(0));
        let counter = runs.clone();
        ctx.enqueue_job(move || counter.set(counter.get() + 1))
            .unwrap();
        assert!(rt.is_job_pending());
        assert_eq!(runs.get(), 0);
        let ran_in = rt.execute_pending_job().unwrap().unwrap();
        assert!(ran_in.ptr_eq(&ctx));
        assert_eq!(runs.get(), 1);
        assert!(rt.execute_pending_job().unwrap().is_none());
    }

    #[test]
    fn test_failing_job_reports_exception() {
        let rt = Runtime::new();
        let ctx = Context::new(&rt).unwrap();
        ctx.enqueue_job(|| -> Result<()> { Err(Error::from("job failed")) })
            .unwrap();
        let err = rt.execute_pending_job().unwrap_err();
        let Error::Exception(exc) = err else {
            panic!("expected an exception");
        };
        assert_eq!(
            exc.value().get::<String>().unwrap(),
            "InternalError: job failed"
        );
    }
}
