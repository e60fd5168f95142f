//! Native modules
//!
//! A [`Module`] declares its exports up front; the values are handed to the
//! engine when a script first imports the module. Declaring an export that
//! is never given a value makes the import fail.

use std::cell::RefCell;
use std::rc::{Rc, Weak};

use log::debug;

use crate::context::Context;
use crate::convert::IntoJs;
use crate::engine::{EngineCtx, ModuleId};
use crate::error::{Error, Result};
use crate::function::{Callable, FWrapper};
use crate::registrar::ClassRegistrar;
use crate::value::Value;

pub(crate) struct ModuleState {
    name: String,
    id: ModuleId,
    declared: RefCell<Vec<String>>,
    exports: RefCell<Vec<(String, Value)>>,
}

impl ModuleState {
    /// Hand every export to the engine at link time
    fn init(&self, engine: &EngineCtx, m: ModuleId) -> bool {
        let exports = self.exports.borrow().clone();
        debug!("linking native module '{}' ({} exports)", self.name, exports.len());
        let declared = self.declared.borrow();
        if let Some(unset) = declared
            .iter()
            .find(|name| !exports.iter().any(|(set, _)| set == *name))
        {
            engine.throw_reference_error(format!(
                "export '{}' in module '{}' is not initialized",
                unset, self.name
            ));
            return false;
        }
        exports
            .into_iter()
            .all(|(name, value)| engine.set_module_export(m, &name, value.release()).is_ok())
    }

    /// Declare `name` with the engine once
    fn declare(&self, engine: &EngineCtx, name: &str) -> Result<()> {
        if self.declared.borrow().iter().any(|d| d == name) {
            return Ok(());
        }
        engine
            .add_module_export(self.id, name)
            .map_err(|_| Error::exception(engine))?;
        self.declared.borrow_mut().push(name.to_string());
        Ok(())
    }
}

/// Handle to a native module of a context
#[derive(Clone)]
pub struct Module {
    ctx: Context,
    state: Rc<ModuleState>,
}

impl Module {
    pub(crate) fn new(ctx: &Context, name: &str) -> Result<Module> {
        let engine = ctx.engine();
        let slot: Rc<RefCell<Weak<ModuleState>>> = Rc::new(RefCell::new(Weak::new()));
        let target = slot.clone();
        let id = engine
            .new_native_module(
                name,
                Rc::new(move |engine: &EngineCtx, m: ModuleId| {
                    let state = target.borrow().upgrade();
                    match state {
                        Some(state) => state.init(engine, m),
                        None => {
                            engine.throw_reference_error("native module was dropped");
                            false
                        }
                    }
                }),
            )
            .map_err(|_| Error::exception(engine))?;
        let state = Rc::new(ModuleState {
            name: name.to_string(),
            id,
            declared: RefCell::new(Vec::new()),
            exports: RefCell::new(Vec::new()),
        });
        *slot.borrow_mut() = Rc::downgrade(&state);
        Ok(Module {
            ctx: ctx.clone(),
            state,
        })
    }

    pub(crate) fn state(&self) -> Rc<ModuleState> {
        self.state.clone()
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.state.name
    }

    #[inline]
    pub fn id(&self) -> ModuleId {
        self.state.id
    }

    #[inline]
    pub fn context(&self) -> &Context {
        &self.ctx
    }

    /// Declare an export with its value
    ///
    /// Adding a name again replaces its value.
    pub fn add<T: IntoJs>(&self, name: &str, value: T) -> Result<&Self> {
        let engine = self.ctx.engine();
        let value = Value::check(engine, value.into_js(engine)?)?;
        self.state.declare(engine, name)?;
        let mut exports = self.state.exports.borrow_mut();
        match exports.iter_mut().find(|(n, _)| n == name) {
            Some(slot) => slot.1 = value,
            None => exports.push((name.to_string(), value)),
        }
        Ok(self)
    }

    /// Declare an export without a value yet
    ///
    /// The export must be given a value with [`Module::add`] before the
    /// module is imported.
    pub fn declare(&self, name: &str) -> Result<&Self> {
        self.state.declare(self.ctx.engine(), name)?;
        Ok(self)
    }

    /// Export a native function
    pub fn function<F, M>(&self, name: &str, f: F) -> Result<&Self>
    where
        F: Callable<M>,
        F::Output: IntoJs,
        M: 'static,
    {
        self.add(name, FWrapper::new(f, name))
    }

    /// Start registering a class whose constructor is exported by this module
    pub fn register_class<T: 'static>(&self, name: &str) -> ClassRegistrar<T> {
        ClassRegistrar::new(&self.ctx, name, Some(self.clone()))
    }
}

#[cfg(test)]
mod tests {
    use crate::{Context, Runtime};

    #[test]
    fn test_exports_readable_after_import() {
        let rt = Runtime::new();
        let ctx = Context::new(&rt).unwrap();
        let module = ctx.add_module("tools").unwrap();
        module
            .add("version", "1.2.0")
            .unwrap()
            .function("double", |x: i32| x * 2)
            .unwrap();
        assert_eq!(module.name(), "tools");

        let ns = ctx.import("tools").unwrap();
        assert_eq!(ns.get_prop::<String, _>("version").unwrap(), "1.2.0");
        assert_eq!(ns.invoke("double", (4,)).unwrap().get::<i32>().unwrap(), 8);
        // Imported once; a second import yields the same namespace
        assert_eq!(ctx.import("tools").unwrap(), ns);
    }

    #[test]
    fn test_unset_export_fails_import() {
        let rt = Runtime::new();
        let ctx = Context::new(&rt).unwrap();
        let module = ctx.add_module("partial").unwrap();
        module.add("a", 1).unwrap().declare("b").unwrap();
        let err = ctx.import("partial").unwrap_err();
        let crate::Error::Exception(exc) = err else {
            panic!("expected an exception");
        };
        assert_eq!(
            exc.value().get::<String>().unwrap(),
            "ReferenceError: export 'b' in module 'partial' is not initialized"
        );
    }

    #[test]
    fn test_redeclared_export_is_linked_once() {
        let rt = Runtime::new();
        let ctx = Context::new(&rt).unwrap();
        let module = ctx.add_module("settings").unwrap();
        module
            .declare("level")
            .unwrap()
            .add("level", 1)
            .unwrap()
            .add("level", 3)
            .unwrap();
        assert_eq!(module.state().declared.borrow().len(), 1);
        let ns = ctx.import("settings").unwrap();
        assert_eq!(ns.get_prop::<i32, _>("level").unwrap(), 3);
    }
}
