//! Native functions as engine functions, and engine functions as native ones
//!
//! A Rust closure or fn item becomes callable from scripts through
//! [`FWrapper`]: its parameters are unwrapped from the arguments with
//! [`FromJs`] and its result is wrapped with [`IntoJs`]. Two calling
//! conventions are supported:
//!
//! - free functions, `Fn(A1, .., An) -> R`
//! - methods, `Fn(&T, A1, .., An) -> R`, where the receiver is an instance
//!   of a registered class
//!
//! With `PASS_THIS` the receiver (or, for free functions, the first
//! parameter) is taken from `this`; otherwise it is taken from the first
//! argument and the remaining parameters shift by one.
//!
//! Missing trailing arguments are an error, extra ones are ignored. A final
//! [`Rest<T>`] parameter collects everything left over.

use std::marker::PhantomData;
use std::ops::{Deref, DerefMut};
use std::panic::{self, AssertUnwindSafe};
use std::rc::Rc;
use std::sync::Arc;

use log::{debug, trace};

use crate::class::{self, ClassPayload};
use crate::convert::{FromJs, IntoJs, throw_internal_error, throw_type_error};
use crate::engine::{EngineCtx, FunctionFlavor, NativeFn, RawValue};
use crate::error::{Error, Result};
use crate::value::Value;

// ----------------------------------------------------------------------
// Argument unwrapping
// ----------------------------------------------------------------------

/// Cursor over the arguments of a native call
pub struct ArgCursor<'a> {
    ctx: &'a EngineCtx,
    /// Bound to the first parameter ahead of the arguments
    this: Option<RawValue>,
    args: &'a [RawValue],
    pos: usize,
}

impl<'a> ArgCursor<'a> {
    pub fn new(ctx: &'a EngineCtx, this: Option<RawValue>, args: &'a [RawValue]) -> Self {
        ArgCursor {
            ctx,
            this,
            args,
            pos: 0,
        }
    }

    #[inline]
    pub fn engine(&self) -> &'a EngineCtx {
        self.ctx
    }

    /// Next positional value; `undefined` past the end
    pub fn next_raw(&mut self) -> RawValue {
        if let Some(this) = self.this.take() {
            return this;
        }
        let v = self.args.get(self.pos).copied().unwrap_or(RawValue::UNDEFINED);
        self.pos += 1;
        v
    }

    /// Every remaining argument
    pub fn rest(&mut self) -> &'a [RawValue] {
        let rest = self.args.get(self.pos..).unwrap_or(&[]);
        self.pos = self.args.len();
        rest
    }
}

/// Raise a TypeError unless at least `required` arguments were passed
fn check_arity(ctx: &EngineCtx, received: usize, required: u32) -> Result<()> {
    if received < required as usize {
        return Err(throw_type_error(
            ctx,
            format!(
                "Expected at least {} arguments but received {}",
                required, received
            ),
        ));
    }
    Ok(())
}

/// A native parameter type
///
/// Implemented for every [`FromJs`] type and for [`Rest`].
pub trait FromArg: Sized {
    /// Consumes all remaining arguments
    const IS_REST: bool = false;

    fn from_arg(cursor: &mut ArgCursor<'_>) -> Result<Self>;
}

impl<T: FromJs> FromArg for T {
    fn from_arg(cursor: &mut ArgCursor<'_>) -> Result<Self> {
        let v = cursor.next_raw();
        T::from_js(cursor.engine(), v)
    }
}

/// Trailing parameter collecting the remaining arguments
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Rest<T>(pub Vec<T>);

impl<T> Rest<T> {
    #[inline]
    pub fn into_inner(self) -> Vec<T> {
        self.0
    }
}

impl<T> Deref for Rest<T> {
    type Target = Vec<T>;

    fn deref(&self) -> &Vec<T> {
        &self.0
    }
}

impl<T> DerefMut for Rest<T> {
    fn deref_mut(&mut self) -> &mut Vec<T> {
        &mut self.0
    }
}

impl<T> IntoIterator for Rest<T> {
    type Item = T;
    type IntoIter = std::vec::IntoIter<T>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

impl<T: FromJs> FromArg for Rest<T> {
    const IS_REST: bool = true;

    fn from_arg(cursor: &mut ArgCursor<'_>) -> Result<Self> {
        let ctx = cursor.engine();
        cursor
            .rest()
            .iter()
            .map(|&v| T::from_js(ctx, v))
            .collect::<Result<Vec<_>>>()
            .map(Rest)
    }
}

/// Whether a `Rest` parameter, if any, comes last
const fn rest_is_last<const N: usize>(flags: [bool; N]) -> bool {
    let mut i = 0;
    while i < N {
        if flags[i] && i + 1 != N {
            return false;
        }
        i += 1;
    }
    true
}

// ----------------------------------------------------------------------
// Callables
// ----------------------------------------------------------------------

/// Marker for method-style callables `Fn(&T, A..) -> R`
pub struct Method<T, A>(PhantomData<fn(&T, A)>);

/// A native function callable with engine arguments
///
/// `M` is a marker that keeps the free-function and method implementations
/// apart; it is always inferred.
pub trait Callable<M>: 'static {
    type Output;

    /// Declared parameter count, excluding a receiver and a `Rest` tail
    const ARITY: u32;

    /// Takes a class instance receiver ahead of its parameters
    const TAKES_RECEIVER: bool = false;

    fn call_unwrapped(
        &self,
        ctx: &EngineCtx,
        this: RawValue,
        args: &[RawValue],
        pass_this: bool,
    ) -> Result<Self::Output>;
}

macro_rules! impl_callable {
    ($($a:ident),*) => {
        impl<F, R, $($a,)*> Callable<($($a,)*)> for F
        where
            F: Fn($($a),*) -> R + 'static,
            $($a: FromArg,)*
        {
            type Output = R;

            const ARITY: u32 = 0 $(+ if <$a as FromArg>::IS_REST { 0 } else { 1 })*;

            #[allow(non_snake_case, unused_mut, unused_variables)]
            fn call_unwrapped(
                &self,
                ctx: &EngineCtx,
                this: RawValue,
                args: &[RawValue],
                pass_this: bool,
            ) -> Result<R> {
                const { assert!(rest_is_last([$(<$a as FromArg>::IS_REST),*]), "Rest must be the last parameter") };
                let required = if pass_this { Self::ARITY.saturating_sub(1) } else { Self::ARITY };
                check_arity(ctx, args.len(), required)?;
                let mut cursor = ArgCursor::new(ctx, pass_this.then_some(this), args);
                $(let $a = <$a as FromArg>::from_arg(&mut cursor)?;)*
                Ok(self($($a),*))
            }
        }

        impl<T, F, R, $($a,)*> Callable<Method<T, ($($a,)*)>> for F
        where
            T: 'static,
            F: Fn(&T, $($a),*) -> R + 'static,
            $($a: FromArg,)*
        {
            type Output = R;

            const ARITY: u32 = 0 $(+ if <$a as FromArg>::IS_REST { 0 } else { 1 })*;

            const TAKES_RECEIVER: bool = true;

            #[allow(non_snake_case, unused_mut)]
            fn call_unwrapped(
                &self,
                ctx: &EngineCtx,
                this: RawValue,
                args: &[RawValue],
                pass_this: bool,
            ) -> Result<R> {
                const { assert!(rest_is_last([$(<$a as FromArg>::IS_REST),*]), "Rest must be the last parameter") };
                let (receiver, args) = if pass_this {
                    (this, args)
                } else {
                    check_arity(ctx, args.len(), Self::ARITY + 1)?;
                    match args.split_first() {
                        Some((&receiver, rest)) => (receiver, rest),
                        None => (RawValue::UNDEFINED, args),
                    }
                };
                check_arity(ctx, args.len(), Self::ARITY)?;
                let receiver: Arc<T> = class::unwrap_arc(ctx, receiver)?;
                let mut cursor = ArgCursor::new(ctx, None, args);
                $(let $a = <$a as FromArg>::from_arg(&mut cursor)?;)*
                Ok(self(&receiver, $($a),*))
            }
        }
    };
}

impl_callable!();
impl_callable!(A1);
impl_callable!(A1, A2);
impl_callable!(A1, A2, A3);
impl_callable!(A1, A2, A3, A4);
impl_callable!(A1, A2, A3, A4, A5);
impl_callable!(A1, A2, A3, A4, A5, A6);
impl_callable!(A1, A2, A3, A4, A5, A6, A7);
impl_callable!(A1, A2, A3, A4, A5, A6, A7, A8);

/// Run a native call body, translating its failure into a pending exception
///
/// Exceptions already pending pass through; other errors and panics become
/// an InternalError.
pub(crate) fn wrap_call(
    ctx: &EngineCtx,
    name: &str,
    body: impl FnOnce() -> Result<RawValue>,
) -> RawValue {
    match panic::catch_unwind(AssertUnwindSafe(body)) {
        Ok(Ok(v)) => v,
        Ok(Err(Error::Exception(_))) => {
            if !ctx.has_exception() {
                debug!("native function '{}' failed without a pending exception", name);
                ctx.throw_internal_error("Unknown error");
            }
            RawValue::EXCEPTION
        }
        Ok(Err(e)) => {
            debug!("native function '{}' failed: {}", name, e);
            ctx.throw_internal_error(e.to_string())
        }
        Err(_) => {
            debug!("native function '{}' panicked", name);
            ctx.throw_internal_error("Unknown error")
        }
    }
}

/// A native callable ready to become an engine function
///
/// `new` builds a function whose parameters all come from the arguments;
/// `method` binds `this` to the receiver (or first parameter).
pub struct FWrapper<F, M, const PASS_THIS: bool = false> {
    f: F,
    name: String,
    _marker: PhantomData<fn() -> M>,
}

impl<F: Callable<M>, M> FWrapper<F, M, false> {
    pub fn new(f: F, name: &str) -> Self {
        FWrapper {
            f,
            name: name.to_string(),
            _marker: PhantomData,
        }
    }
}

impl<F: Callable<M>, M> FWrapper<F, M, true> {
    pub fn method(f: F, name: &str) -> Self {
        FWrapper {
            f,
            name: name.to_string(),
            _marker: PhantomData,
        }
    }
}

impl<F, M, const PASS_THIS: bool> FWrapper<F, M, PASS_THIS> {
    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl<F, M, const PASS_THIS: bool> IntoJs for FWrapper<F, M, PASS_THIS>
where
    F: Callable<M>,
    F::Output: IntoJs,
    M: 'static,
{
    fn into_js(self, ctx: &EngineCtx) -> Result<RawValue> {
        let FWrapper { f, name, .. } = self;
        let length = match (F::TAKES_RECEIVER, PASS_THIS) {
            (true, false) => F::ARITY + 1,
            (false, true) => F::ARITY.saturating_sub(1),
            _ => F::ARITY,
        };
        let label: Rc<str> = Rc::from(name.as_str());
        let func: Rc<NativeFn> = Rc::new(move |ctx: &EngineCtx, this: RawValue, args: &[RawValue]| {
            trace!("calling native function '{}' with {} arguments", label, args.len());
            wrap_call(ctx, &label, || {
                f.call_unwrapped(ctx, this, args, PASS_THIS)?.into_js(ctx)
            })
        });
        Ok(ctx.new_native_function(&name, length, FunctionFlavor::Normal, func))
    }
}

// ----------------------------------------------------------------------
// Constructors
// ----------------------------------------------------------------------

type Factory<T> = dyn Fn(&EngineCtx, &[RawValue]) -> Result<Arc<T>>;

/// A native factory exposed as a class constructor
///
/// Calling it with `new` creates an instance of the registered class `T`
/// whose prototype comes from `new.target`.
pub struct CtorWrapper<T: 'static> {
    factory: Rc<Factory<T>>,
    arity: u32,
    name: String,
}

impl<T: 'static> CtorWrapper<T> {
    /// Constructor from a factory returning the instance
    pub fn new<F, M>(f: F, name: &str) -> Self
    where
        F: Callable<M, Output = T>,
    {
        CtorWrapper {
            factory: Rc::new(move |ctx: &EngineCtx, args: &[RawValue]| {
                f.call_unwrapped(ctx, RawValue::UNDEFINED, args, false)
                    .map(Arc::new)
            }),
            arity: F::ARITY,
            name: name.to_string(),
        }
    }

    /// Constructor from a factory that may fail
    pub fn fallible<F, M, E>(f: F, name: &str) -> Self
    where
        F: Callable<M, Output = std::result::Result<T, E>>,
        E: Into<Error>,
    {
        CtorWrapper {
            factory: Rc::new(move |ctx: &EngineCtx, args: &[RawValue]| {
                f.call_unwrapped(ctx, RawValue::UNDEFINED, args, false)?
                    .map(Arc::new)
                    .map_err(Into::into)
            }),
            arity: F::ARITY,
            name: name.to_string(),
        }
    }
}

impl<T: 'static> IntoJs for CtorWrapper<T> {
    fn into_js(self, ctx: &EngineCtx) -> Result<RawValue> {
        let CtorWrapper {
            factory,
            arity,
            name,
        } = self;
        let label: Rc<str> = Rc::from(name.as_str());
        let func: Rc<NativeFn> = Rc::new(
            move |ctx: &EngineCtx, new_target: RawValue, args: &[RawValue]| {
                wrap_call(ctx, &label, || {
                    if !ctx.is_constructor(new_target) {
                        return Err(throw_type_error(ctx, format!("Constructor {} requires 'new'", label)));
                    }
                    let proto = Value::check(ctx, ctx.get_property_str(new_target, "prototype"))?;
                    let class_id = class::ensure_defined::<T>(ctx)?;
                    let obj = Value::check(ctx, ctx.new_object_proto_class(proto.raw(), class_id))?;
                    let instance = factory(ctx, args)?;
                    ctx.set_opaque(obj.raw(), Box::new(ClassPayload::Owned(instance)))
                        .map_err(|_| Error::exception(ctx))?;
                    Ok(obj.release())
                })
            },
        );
        Ok(ctx.new_native_function(&name, arity, FunctionFlavor::Constructor, func))
    }
}

// ----------------------------------------------------------------------
// Engine functions seen from native code
// ----------------------------------------------------------------------

/// Arguments for calling an engine function
pub trait IntoJsArgs {
    /// Wrap every argument; the caller owns the result
    fn into_js_args(self, ctx: &EngineCtx) -> Result<Vec<RawValue>>;
}

macro_rules! impl_into_js_args {
    ($($a:ident),*) => {
        impl<$($a: IntoJs,)*> IntoJsArgs for ($($a,)*) {
            #[allow(non_snake_case, unused_variables, unused_mut)]
            fn into_js_args(self, ctx: &EngineCtx) -> Result<Vec<RawValue>> {
                let ($($a,)*) = self;
                let mut argv = Vec::new();
                $(
                    match $a.into_js(ctx) {
                        Ok(v) => argv.push(v),
                        Err(e) => {
                            argv.into_iter().for_each(|v| ctx.free_value(v));
                            return Err(e);
                        }
                    }
                )*
                Ok(argv)
            }
        }
    };
}

impl_into_js_args!();
impl_into_js_args!(A1);
impl_into_js_args!(A1, A2);
impl_into_js_args!(A1, A2, A3);
impl_into_js_args!(A1, A2, A3, A4);
impl_into_js_args!(A1, A2, A3, A4, A5);
impl_into_js_args!(A1, A2, A3, A4, A5, A6);
impl_into_js_args!(A1, A2, A3, A4, A5, A6, A7);
impl_into_js_args!(A1, A2, A3, A4, A5, A6, A7, A8);

/// Spread a list of values as arguments
impl<T: IntoJs> IntoJsArgs for Vec<T> {
    fn into_js_args(self, ctx: &EngineCtx) -> Result<Vec<RawValue>> {
        let mut argv = Vec::with_capacity(self.len());
        for item in self {
            match item.into_js(ctx) {
                Ok(v) => argv.push(v),
                Err(e) => {
                    argv.into_iter().for_each(|v| ctx.free_value(v));
                    return Err(e);
                }
            }
        }
        Ok(argv)
    }
}

/// Typed handle to an engine function
///
/// Unwrapping checks that the value is callable; calling wraps `Args` and
/// unwraps the result as `R`.
pub struct JsFunction<Args, R> {
    func: Value,
    _marker: PhantomData<fn(Args) -> R>,
}

impl<Args: IntoJsArgs, R: FromJs> JsFunction<Args, R> {
    pub fn call(&self, args: Args) -> Result<R> {
        self.func.call(args)?.get()
    }

    pub fn call_with_this(&self, this: &Value, args: Args) -> Result<R> {
        self.func.call_with_this(this.raw(), args)?.get()
    }
}

impl<Args, R> JsFunction<Args, R> {
    #[inline]
    pub fn value(&self) -> &Value {
        &self.func
    }

    pub fn into_value(self) -> Value {
        self.func
    }
}

impl<Args, R> Clone for JsFunction<Args, R> {
    fn clone(&self) -> Self {
        JsFunction {
            func: self.func.clone(),
            _marker: PhantomData,
        }
    }
}

impl<Args, R> FromJs for JsFunction<Args, R> {
    fn from_js(ctx: &EngineCtx, v: RawValue) -> Result<Self> {
        if !ctx.is_function(v) {
            return Err(throw_type_error(
                ctx,
                format!("Expected function, got {}", v.tag().name()),
            ));
        }
        Ok(JsFunction {
            func: Value::from_borrowed(ctx, v),
            _marker: PhantomData,
        })
    }
}

impl<Args, R> IntoJs for JsFunction<Args, R> {
    fn into_js(self, ctx: &EngineCtx) -> Result<RawValue> {
        self.func.into_js(ctx)
    }
}

/// Build a named engine function from a native callable (owned result)
pub fn new_function<F, M>(ctx: &EngineCtx, name: &str, f: F) -> Result<Value>
where
    F: Callable<M>,
    F::Output: IntoJs,
    M: 'static,
{
    let v = FWrapper::new(f, name).into_js(ctx)?;
    if v.is_exception() {
        return Err(throw_internal_error(ctx, "could not create function"));
    }
    Ok(Value::from_raw(ctx, v))
}
