//! Builder for native classes
//!
//! ```ignore
//! module
//!     .register_class::<Point>("Point")
//!     .constructor(|x: f64, y: f64| Point::new(x, y))?
//!     .property("x", |p: &Point| p.x())?
//!     .method("norm", |p: &Point| p.norm())?
//!     .finish()?;
//! ```
//!
//! Members are collected on a fresh prototype object; `finish` registers
//! the class with that prototype.

use std::marker::PhantomData;

use crate::class::{self, Inherits, MarkField};
use crate::context::Context;
use crate::convert::IntoJs;
use crate::engine::ClassId;
use crate::error::{Error, Result};
use crate::function::{Callable, CtorWrapper, FWrapper};
use crate::module::Module;
use crate::value::Value;

pub struct ClassRegistrar<T: 'static> {
    ctx: Context,
    module: Option<Module>,
    name: String,
    proto: Value,
    ctor: Option<Value>,
    _marker: PhantomData<fn() -> T>,
}

impl<T: 'static> ClassRegistrar<T> {
    pub(crate) fn new(ctx: &Context, name: &str, module: Option<Module>) -> Self {
        ClassRegistrar {
            ctx: ctx.clone(),
            module,
            name: name.to_string(),
            proto: ctx.new_object(),
            ctor: None,
            _marker: PhantomData,
        }
    }

    /// The prototype members are added to
    #[inline]
    pub fn prototype(&self) -> &Value {
        &self.proto
    }

    /// Derive from the registered class `B`
    ///
    /// Instances of `T` become acceptable where a `B` is expected, and the
    /// prototype chains to `B`'s prototype.
    ///
    /// # Panics
    /// If `B` has not been registered.
    pub fn base<B: 'static>(self) -> Result<Self>
    where
        T: Inherits<B>,
    {
        assert!(class::is_registered::<B>(), "base class is not registered");
        class::register_base::<T, B>();
        let engine = self.ctx.engine();
        let base_proto = Value::from_raw(engine, engine.get_class_proto(class::class_id::<B>()));
        engine
            .set_prototype(self.proto.raw(), base_proto.raw())
            .map_err(|_| Error::exception(engine))?;
        Ok(self)
    }

    fn install_ctor(mut self, ctor: Value) -> Result<Self> {
        let engine = self.ctx.engine();
        engine.set_constructor(ctor.raw(), self.proto.raw());
        if let Some(module) = &self.module {
            module.add(&self.name, &ctor)?;
        }
        self.ctor = Some(ctor);
        Ok(self)
    }

    /// Constructor built from a native factory
    pub fn constructor<F, M>(self, f: F) -> Result<Self>
    where
        F: Callable<M, Output = T>,
    {
        let engine = self.ctx.engine();
        let ctor = CtorWrapper::new(f, &self.name).into_js(engine)?;
        let ctor = Value::check(engine, ctor)?;
        self.install_ctor(ctor)
    }

    /// Constructor built from a factory that may fail
    pub fn try_constructor<F, M, E>(self, f: F) -> Result<Self>
    where
        F: Callable<M, Output = std::result::Result<T, E>>,
        E: Into<Error>,
    {
        let engine = self.ctx.engine();
        let ctor = CtorWrapper::fallible(f, &self.name).into_js(engine)?;
        let ctor = Value::check(engine, ctor)?;
        self.install_ctor(ctor)
    }

    /// Function on the prototype, called without a receiver
    pub fn function<F, M>(self, name: &str, f: F) -> Result<Self>
    where
        F: Callable<M>,
        F::Output: IntoJs,
        M: 'static,
    {
        self.proto.set_prop(name, FWrapper::new(f, name))?;
        Ok(self)
    }

    /// Method on the prototype; `this` is the receiver
    pub fn method<F, M>(self, name: &str, f: F) -> Result<Self>
    where
        F: Callable<M>,
        F::Output: IntoJs,
        M: 'static,
    {
        self.proto.set_prop(name, FWrapper::method(f, name))?;
        Ok(self)
    }

    /// Read-only accessor property
    pub fn property<F, M>(self, name: &str, getter: F) -> Result<Self>
    where
        F: Callable<M>,
        F::Output: IntoJs,
        M: 'static,
    {
        self.proto.add_getter(name, getter)?;
        Ok(self)
    }

    /// Accessor property with a getter and a setter
    pub fn property_rw<G, GM, S, SM>(self, name: &str, getter: G, setter: S) -> Result<Self>
    where
        G: Callable<GM>,
        G::Output: IntoJs,
        GM: 'static,
        S: Callable<SM>,
        S::Output: IntoJs,
        SM: 'static,
    {
        self.proto.add_getter_setter(name, getter, setter)?;
        Ok(self)
    }

    fn ctor(&self) -> &Value {
        match &self.ctor {
            Some(ctor) => ctor,
            None => panic!("constructor must be registered before static members of {}", self.name),
        }
    }

    /// Value on the constructor
    ///
    /// # Panics
    /// If no constructor was registered.
    pub fn static_member<V: IntoJs>(self, name: &str, value: V) -> Result<Self> {
        self.ctor().set_prop(name, value)?;
        Ok(self)
    }

    /// Function on the constructor
    ///
    /// # Panics
    /// If no constructor was registered.
    pub fn static_fn<F, M>(self, name: &str, f: F) -> Result<Self>
    where
        F: Callable<M>,
        F::Output: IntoJs,
        M: 'static,
    {
        self.ctor().set_prop(name, FWrapper::new(f, name))?;
        Ok(self)
    }

    /// Trace a `Value` field of every instance during cycle collection
    pub fn mark(self, field: MarkField<T>) -> Self {
        class::add_mark_field(field);
        self
    }

    /// Register the class with the collected prototype
    pub fn finish(self) -> Result<ClassId> {
        let ClassRegistrar {
            ctx, name, proto, ..
        } = self;
        class::register_class::<T>(ctx.engine(), &name, proto.release())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    use crate::{Context, Error, Runtime, Value};

    struct Gauge {
        level: AtomicU32,
    }

    #[test]
    fn test_accessors_and_statics() {
        let rt = Runtime::new();
        let ctx = Context::new(&rt).unwrap();
        let registrar = ctx
            .class_registrar::<Gauge>("Gauge")
            .constructor(|level: u32| Gauge {
                level: AtomicU32::new(level),
            })
            .unwrap()
            .property_rw(
                "level",
                |g: &Gauge| g.level.load(Ordering::Relaxed),
                |g: &Gauge, level: u32| g.level.store(level, Ordering::Relaxed),
            )
            .unwrap()
            .static_fn("empty", || Arc::new(Gauge { level: AtomicU32::new(0) }))
            .unwrap()
            .static_member("MAX", 100)
            .unwrap();
        let ctor: Value = registrar.prototype().get_prop("constructor").unwrap();
        registrar.finish().unwrap();

        let gauge = ctor.construct((40,)).unwrap();
        assert_eq!(gauge.get_prop::<u32, _>("level").unwrap(), 40);
        gauge.set_prop("level", 75).unwrap();
        assert_eq!(gauge.get::<Arc<Gauge>>().unwrap().level.load(Ordering::Relaxed), 75);

        let empty = ctor.invoke("empty", ()).unwrap();
        assert_eq!(empty.get_prop::<u32, _>("level").unwrap(), 0);
        assert_eq!(ctor.get_prop::<u32, _>("MAX").unwrap(), 100);

        let err = ctor.construct(()).unwrap_err();
        let Error::Exception(exc) = err else {
            panic!("expected an exception");
        };
        assert_eq!(
            exc.value().get::<String>().unwrap(),
            "TypeError: Expected at least 1 arguments but received 0"
        );
    }

    #[test]
    #[should_panic(expected = "constructor must be registered")]
    fn test_static_without_constructor_panics() {
        struct Bare;
        let rt = Runtime::new();
        let ctx = Context::new(&rt).unwrap();
        let _ = ctx.class_registrar::<Bare>("Bare").static_member("X", 1);
    }

    struct Node {
        peer: Value,
    }

    #[test]
    fn test_marked_fields_let_cycles_be_collected() {
        let rt = Runtime::new();
        let ctx = Context::new(&rt).unwrap();
        ctx.class_registrar::<Node>("Node")
            .mark(|n: &Node| &n.peer)
            .finish()
            .unwrap();

        let before = rt.heap_stats().live();
        {
            let holder = ctx.new_object();
            let node = ctx
                .new_value(Arc::new(Node {
                    peer: holder.clone(),
                }))
                .unwrap();
            holder.set_prop("node", &node).unwrap();
        }
        assert_eq!(rt.heap_stats().live(), before + 2);
        let stats = rt.run_gc();
        assert!(stats.collected >= 2);
        assert_eq!(rt.heap_stats().live(), before);
    }
}
