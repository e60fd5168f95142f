//! Owned engine values
//!
//! A [`Value`] pairs an engine context with one engine value and owns one
//! reference to it: cloning duplicates the reference, dropping releases it.

use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;

use crate::convert::{FromJs, IntoJs};
use crate::engine::{Atom, EngineCtx, PromiseState, RawValue, Tag, flags};
use crate::error::{Error, Result};
use crate::function::{Callable, FWrapper, IntoJsArgs};
use crate::property::{PropertyKey, PropertyProxy};

/// Reference-counted handle to an engine value
pub struct Value {
    ctx: Option<EngineCtx>,
    v: RawValue,
}

impl Value {
    /// Adopt an owned engine value without duplicating it
    pub fn from_raw(ctx: &EngineCtx, v: RawValue) -> Self {
        Value {
            ctx: Some(ctx.clone()),
            v,
        }
    }

    /// Take a new reference to a borrowed engine value
    pub fn from_borrowed(ctx: &EngineCtx, v: RawValue) -> Self {
        Value::from_raw(ctx, ctx.dup_value(v))
    }

    /// A value with no context; it is never released
    pub const fn detached(v: RawValue) -> Self {
        Value { ctx: None, v }
    }

    /// Wrap an engine result, turning the exception marker into an error
    #[track_caller]
    pub fn check(ctx: &EngineCtx, v: RawValue) -> Result<Self> {
        if v.is_exception() {
            Err(Error::exception(ctx))
        } else {
            Ok(Value::from_raw(ctx, v))
        }
    }

    #[inline]
    pub fn engine(&self) -> Option<&EngineCtx> {
        self.ctx.as_ref()
    }

    pub(crate) fn ctx(&self) -> Result<&EngineCtx> {
        self.ctx
            .as_ref()
            .ok_or_else(|| Error::Runtime("value has no context".to_string()))
    }

    /// The underlying engine value (borrowed)
    #[inline]
    pub fn raw(&self) -> RawValue {
        self.v
    }

    /// Give up ownership; the caller becomes responsible for the reference
    pub fn release(mut self) -> RawValue {
        self.ctx = None;
        self.v
    }

    #[inline]
    pub fn tag(&self) -> Tag {
        self.v.tag()
    }

    /// Convert to a native type
    pub fn get<T: FromJs>(&self) -> Result<T> {
        T::from_js(self.ctx()?, self.v)
    }

    /// Property accessor for `key`
    pub fn prop<K: PropertyKey>(&self, key: K) -> Result<PropertyProxy<K>> {
        let ctx = self.ctx()?;
        Ok(PropertyProxy::new(ctx, ctx.dup_value(self.v), key))
    }

    pub fn get_prop<T: FromJs, K: PropertyKey>(&self, key: K) -> Result<T> {
        self.prop(key)?.get()
    }

    pub fn set_prop<T: IntoJs, K: PropertyKey>(&self, key: K, value: T) -> Result<()> {
        self.prop(key)?.set(value)
    }

    /// Own enumerable properties converted to a map
    pub fn properties<K, V>(&self) -> Result<HashMap<K, V>>
    where
        K: FromJs + Eq + Hash,
        V: FromJs,
    {
        HashMap::from_js(self.ctx()?, self.v)
    }

    /// Define an accessor property with a getter receiving the object
    pub fn add_getter<F, M>(&self, name: &str, getter: F) -> Result<()>
    where
        F: Callable<M>,
        F::Output: IntoJs,
        M: 'static,
    {
        let ctx = self.ctx()?;
        let getter = FWrapper::method(getter, name).into_js(ctx)?;
        ctx.define_property_get_set(
            self.v,
            &Atom::new(name),
            getter,
            RawValue::UNDEFINED,
            flags::CONFIGURABLE | flags::ENUMERABLE,
        )
        .map_err(|_| Error::exception(ctx))
    }

    /// Define an accessor property with a getter and a setter
    pub fn add_getter_setter<G, GM, S, SM>(&self, name: &str, getter: G, setter: S) -> Result<()>
    where
        G: Callable<GM>,
        G::Output: IntoJs,
        GM: 'static,
        S: Callable<SM>,
        S::Output: IntoJs,
        SM: 'static,
    {
        let ctx = self.ctx()?;
        let getter = FWrapper::method(getter, name).into_js(ctx)?;
        let setter = match FWrapper::method(setter, name).into_js(ctx) {
            Ok(setter) => setter,
            Err(e) => {
                ctx.free_value(getter);
                return Err(e);
            }
        };
        ctx.define_property_get_set(self.v, &Atom::new(name), getter, setter, flags::C_W_E)
            .map_err(|_| Error::exception(ctx))
    }

    pub fn prevent_extensions(&self) -> Result<()> {
        let ctx = self.ctx()?;
        ctx.prevent_extensions(self.v)
            .map_err(|_| Error::exception(ctx))
    }

    /// JSON text of the value
    pub fn to_json(&self) -> Result<String> {
        self.to_json_with(RawValue::UNDEFINED, RawValue::UNDEFINED)
    }

    /// JSON text with a replacer function and an indentation (both borrowed)
    pub fn to_json_with(&self, replacer: RawValue, space: RawValue) -> Result<String> {
        let ctx = self.ctx()?;
        let text = Value::check(ctx, ctx.json_stringify(self.v, replacer, space))?;
        text.get()
    }

    /// Reference count of the underlying cell, for diagnostics
    pub fn ref_count(&self) -> Option<u32> {
        self.ctx.as_ref().and_then(|ctx| ctx.ref_count(self.v))
    }

    #[inline]
    pub fn is_undefined(&self) -> bool {
        self.v.is_undefined()
    }

    #[inline]
    pub fn is_null(&self) -> bool {
        self.v.is_null()
    }

    #[inline]
    pub fn is_bool(&self) -> bool {
        self.v.is_bool()
    }

    #[inline]
    pub fn is_number(&self) -> bool {
        self.v.is_number()
    }

    #[inline]
    pub fn is_string(&self) -> bool {
        self.v.is_string()
    }

    #[inline]
    pub fn is_object(&self) -> bool {
        self.v.is_object()
    }

    #[inline]
    pub fn is_module(&self) -> bool {
        self.v.is_module()
    }

    pub fn is_function(&self) -> bool {
        self.ctx.as_ref().is_some_and(|ctx| ctx.is_function(self.v))
    }

    pub fn is_array(&self) -> bool {
        self.ctx.as_ref().is_some_and(|ctx| ctx.is_array(self.v))
    }

    pub fn is_error(&self) -> bool {
        self.ctx.as_ref().is_some_and(|ctx| ctx.is_error(self.v))
    }

    /// Promise state, `None` when the value is not a promise
    pub fn promise_state(&self) -> Option<PromiseState> {
        self.ctx.as_ref().and_then(|ctx| ctx.promise_state(self.v))
    }

    /// Call the value with `this = undefined`
    pub fn call<A: IntoJsArgs>(&self, args: A) -> Result<Value> {
        self.call_with_this(RawValue::UNDEFINED, args)
    }

    /// Call the value with an explicit `this` (borrowed)
    pub fn call_with_this<A: IntoJsArgs>(&self, this: RawValue, args: A) -> Result<Value> {
        let ctx = self.ctx()?;
        let argv = args.into_js_args(ctx)?;
        let result = ctx.call(self.v, this, &argv);
        argv.into_iter().for_each(|v| ctx.free_value(v));
        Value::check(ctx, result)
    }

    /// Call the value as a constructor (`new value(..args)`)
    pub fn construct<A: IntoJsArgs>(&self, args: A) -> Result<Value> {
        let ctx = self.ctx()?;
        let argv = args.into_js_args(ctx)?;
        let result = ctx.construct(self.v, &argv);
        argv.into_iter().for_each(|v| ctx.free_value(v));
        Value::check(ctx, result)
    }

    /// Call a method of the value by name
    pub fn invoke<A: IntoJsArgs>(&self, name: &str, args: A) -> Result<Value> {
        let ctx = self.ctx()?;
        let argv = args.into_js_args(ctx)?;
        let result = ctx.invoke(self.v, name, &argv);
        argv.into_iter().for_each(|v| ctx.free_value(v));
        Value::check(ctx, result)
    }

    /// Run a callable or wait for a promise, then hand the result to
    /// `callback` exactly once
    ///
    /// Fulfilled promises deliver synchronously; pending ones deliver from
    /// the job queue once settled. Callables are invoked with `args`; when
    /// the callable is an async function its promise is bridged in turn.
    /// Rejected promises and other values are an error.
    pub fn invoke_then<R, F, A>(&self, callback: F, args: A) -> Result<()>
    where
        R: FromJs + 'static,
        F: FnOnce(R) + 'static,
        A: IntoJsArgs,
    {
        let ctx = self.ctx()?;
        match ctx.promise_state(self.v) {
            Some(PromiseState::Pending) => {
                let slot = std::cell::RefCell::new(Some(callback));
                let then = FWrapper::new(
                    move |result: Value| -> Result<()> {
                        if let Some(callback) = slot.borrow_mut().take() {
                            callback(result.get::<R>()?);
                        }
                        Ok(())
                    },
                    "then",
                );
                let then = Value::check(ctx, then.into_js(ctx)?)?;
                let derived = ctx.promise_then(self.v, then.raw(), RawValue::UNDEFINED);
                Value::check(ctx, derived).map(drop)
            }
            Some(PromiseState::Fulfilled) => {
                let result = Value::from_raw(ctx, ctx.promise_result(self.v));
                callback(result.get::<R>()?);
                Ok(())
            }
            Some(PromiseState::Rejected) => Err(Error::Runtime(
                "Value is either non-invocable or a rejected promise".to_string(),
            )),
            None if ctx.is_function(self.v) => {
                let result = self.call(args)?;
                let ctor_name: Option<String> = self.prop("constructor")?.prop("name")?.get()?;
                if ctor_name.as_deref() == Some("AsyncFunction") {
                    result.invoke_then(callback, ())
                } else {
                    callback(result.get::<R>()?);
                    Ok(())
                }
            }
            None => Err(Error::Runtime(
                "Value is either non-invocable or a rejected promise".to_string(),
            )),
        }
    }

    /// Throw the value as an exception in its context
    pub fn throw(self) -> Error {
        match self.ctx.clone() {
            Some(ctx) => {
                ctx.throw(self.release());
                Error::exception(&ctx)
            }
            None => Error::Runtime("value has no context".to_string()),
        }
    }
}

impl Clone for Value {
    fn clone(&self) -> Self {
        match &self.ctx {
            Some(ctx) => Value::from_borrowed(ctx, self.v),
            None => Value::detached(self.v),
        }
    }
}

impl Drop for Value {
    fn drop(&mut self) {
        if let Some(ctx) = self.ctx.take() {
            ctx.free_value(self.v);
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        self.v.same_identity(other.v)
    }
}

impl PartialEq<RawValue> for Value {
    fn eq(&self, other: &RawValue) -> bool {
        self.v.same_identity(*other)
    }
}

impl Default for Value {
    fn default() -> Self {
        Value::detached(RawValue::UNDEFINED)
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut s = f.debug_struct("Value");
        s.field("value", &self.v);
        if let Some(ctx) = &self.ctx {
            if let Ok(text) = ctx.to_string(self.v) {
                s.field("text", &text);
            }
        }
        s.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Context, Runtime};
    use std::cell::Cell;
    use std::rc::Rc;

    #[test]
    fn test_clone_and_drop_balance_refcount() {
        let rt = Runtime::new();
        let ctx = Context::new(&rt).unwrap();
        let obj = ctx.new_object();
        let before = obj.ref_count();
        let copies: Vec<Value> = (0..5).map(|_| obj.clone()).collect();
        assert_eq!(obj.ref_count(), before.map(|n| n + 5));
        drop(copies);
        assert_eq!(obj.ref_count(), before);
    }

    #[test]
    fn test_release_detaches() {
        let rt = Runtime::new();
        let ctx = Context::new(&rt).unwrap();
        let obj = ctx.new_object();
        let copy = obj.clone();
        let raw = copy.release();
        assert_eq!(obj.ref_count(), Some(2));
        ctx.engine().free_value(raw);
        assert_eq!(obj.ref_count(), Some(1));
    }

    #[test]
    fn test_equality_is_identity() {
        let rt = Runtime::new();
        let ctx = Context::new(&rt).unwrap();
        let a = ctx.new_object();
        let b = ctx.new_object();
        assert_eq!(a, a.clone());
        assert_ne!(a, b);
        let s1 = ctx.new_value("same").unwrap();
        let s2 = ctx.new_value("same").unwrap();
        assert_ne!(s1, s2);
    }

    #[test]
    fn test_props_and_json() {
        let rt = Runtime::new();
        let ctx = Context::new(&rt).unwrap();
        let obj = ctx.new_object();
        obj.set_prop("name", "point").unwrap();
        obj.set_prop("x", 3).unwrap();
        obj.prop("nested").unwrap().set(ctx.new_object()).unwrap();
        obj.prop("nested").unwrap().prop("deep").unwrap().set(true).unwrap();
        assert_eq!(obj.get_prop::<String, _>("name").unwrap(), "point");
        assert_eq!(obj.get_prop::<i32, _>("x").unwrap(), 3);
        assert_eq!(
            obj.to_json().unwrap(),
            r#"{"name":"point","x":3,"nested":{"deep":true}}"#
        );
        let props: HashMap<String, Value> = obj.properties().unwrap();
        assert_eq!(props.len(), 3);
    }

    #[test]
    fn test_getter_setter_on_object() {
        let rt = Runtime::new();
        let ctx = Context::new(&rt).unwrap();
        let obj = ctx.new_object();
        let store = Rc::new(Cell::new(10));
        let read = store.clone();
        let write = store.clone();
        obj.add_getter_setter(
            "level",
            move |_this: Value| read.get(),
            move |_this: Value, v: i32| write.set(v),
        )
        .unwrap();
        assert_eq!(obj.get_prop::<i32, _>("level").unwrap(), 10);
        obj.set_prop("level", 42).unwrap();
        assert_eq!(store.get(), 42);

        obj.add_getter("fixed", |_this: Value| "const").unwrap();
        assert!(obj.set_prop("fixed", "x").is_err());
    }

    #[test]
    fn test_prevent_extensions() {
        let rt = Runtime::new();
        let ctx = Context::new(&rt).unwrap();
        let obj = ctx.new_object();
        obj.prevent_extensions().unwrap();
        let err = obj.set_prop("x", 1).unwrap_err();
        let Error::Exception(exc) = err else {
            panic!("expected an exception, got {err:?}");
        };
        assert!(exc.value().is_error());
    }

    /// A promise settled through one of its resolving functions
    fn settled(ctx: &Context, fulfill: bool, v: RawValue) -> Value {
        let engine = ctx.engine();
        let cap = engine.new_promise().unwrap();
        let settle = if fulfill { cap.resolve } else { cap.reject };
        engine.free_value(engine.call(settle, RawValue::UNDEFINED, &[v]));
        let promise = Value::from_borrowed(engine, cap.promise);
        engine.free_capability(cap);
        promise
    }

    #[test]
    fn test_invoke_then_fulfilled_is_synchronous() {
        let rt = Runtime::new();
        let ctx = Context::new(&rt).unwrap();
        let promise = settled(&ctx, true, RawValue::from_i32(7));
        let seen = Rc::new(Cell::new(0));
        let sink = seen.clone();
        promise
            .invoke_then(move |v: i32| sink.set(v), ())
            .unwrap();
        assert_eq!(seen.get(), 7);
    }

    #[test]
    fn test_invoke_then_rejected_is_error() {
        let rt = Runtime::new();
        let ctx = Context::new(&rt).unwrap();
        let promise = settled(&ctx, false, RawValue::from_i32(1));
        let err = promise.invoke_then(|_: ()| {}, ()).unwrap_err();
        assert_eq!(
            err.to_string(),
            "Value is either non-invocable or a rejected promise"
        );
        let number = ctx.new_value(5).unwrap();
        assert!(number.invoke_then(|_: ()| {}, ()).is_err());
    }
}
