//! Conversions between native and engine values
//!
//! [`FromJs`] unwraps a borrowed engine value into a native type and
//! [`IntoJs`] wraps a native value into an owned engine value. Every other
//! part of the crate dispatches through these two traits, and embedders
//! extend them for their own types.
//!
//! Failures raise an engine exception (TypeError or RangeError) and return
//! [`Error::Exception`], so scripts and native callers observe the same error.
//! `Option<T>` is the one exception: `null` is `None`, and a failed
//! conversion of anything else degrades to `None` as well.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::fmt;
use std::hash::Hash;
use std::ops::Deref;

use crate::engine::{Atom, EngineCtx, EngineStr, ErrorKind, RawValue};
use crate::error::{Error, Result};
use crate::property::PropertyKey;
use crate::value::Value;

/// Unwrap an engine value (borrowed) into a native value
pub trait FromJs: Sized {
    fn from_js(ctx: &EngineCtx, v: RawValue) -> Result<Self>;
}

/// Wrap a native value into an engine value owned by the caller
pub trait IntoJs {
    fn into_js(self, ctx: &EngineCtx) -> Result<RawValue>;
}

/// Raise an engine error and return the matching binding error
#[track_caller]
pub fn throw(ctx: &EngineCtx, kind: ErrorKind, message: impl fmt::Display) -> Error {
    ctx.throw_error(kind, message.to_string());
    Error::exception(ctx)
}

#[track_caller]
pub fn throw_type_error(ctx: &EngineCtx, message: impl fmt::Display) -> Error {
    throw(ctx, ErrorKind::TypeError, message)
}

#[track_caller]
pub fn throw_range_error(ctx: &EngineCtx, message: impl fmt::Display) -> Error {
    throw(ctx, ErrorKind::RangeError, message)
}

#[track_caller]
pub fn throw_internal_error(ctx: &EngineCtx, message: impl fmt::Display) -> Error {
    throw(ctx, ErrorKind::InternalError, message)
}

/// Free engine values after a failed multi-value conversion
fn free_all(ctx: &EngineCtx, values: Vec<RawValue>) {
    values.into_iter().for_each(|v| ctx.free_value(v));
}

// ----------------------------------------------------------------------
// Primitives
// ----------------------------------------------------------------------

impl FromJs for bool {
    fn from_js(ctx: &EngineCtx, v: RawValue) -> Result<Self> {
        if v.is_exception() {
            return Err(Error::exception(ctx));
        }
        Ok(ctx.to_bool(v))
    }
}

impl IntoJs for bool {
    fn into_js(self, _ctx: &EngineCtx) -> Result<RawValue> {
        Ok(RawValue::from_bool(self))
    }
}

impl FromJs for () {
    fn from_js(_ctx: &EngineCtx, _v: RawValue) -> Result<Self> {
        Ok(())
    }
}

/// `()` results become `null`
impl IntoJs for () {
    fn into_js(self, _ctx: &EngineCtx) -> Result<RawValue> {
        Ok(RawValue::NULL)
    }
}

/// ToNumber, truncated, with NaN mapped to zero and a range check against
/// `[min, end)`
fn unwrap_integer(ctx: &EngineCtx, v: RawValue, min: f64, end: f64, name: &str) -> Result<f64> {
    let n = ctx.to_number(v).map_err(|_| Error::exception(ctx))?;
    let n = if n.is_nan() { 0.0 } else { n.trunc() };
    if n < min || n >= end {
        return Err(throw_range_error(
            ctx,
            format!("Could not unwrap integer into {}", name),
        ));
    }
    Ok(n)
}

macro_rules! impl_integer {
    ($($t:ty),*) => {$(
        impl FromJs for $t {
            fn from_js(ctx: &EngineCtx, v: RawValue) -> Result<Self> {
                // MAX + 1 is exact: a power of two
                let end = <$t>::MAX as f64 + 1.0;
                let n = unwrap_integer(ctx, v, <$t>::MIN as f64, end, stringify!($t))?;
                Ok(n as $t)
            }
        }
    )*};
}

impl_integer!(i8, i16, i32, i64, isize, u8, u16, u32, u64, usize);

macro_rules! impl_into_js_lossless {
    ($($t:ty),*) => {$(
        impl IntoJs for $t {
            fn into_js(self, _ctx: &EngineCtx) -> Result<RawValue> {
                Ok(RawValue::from_i64(self as i64))
            }
        }
    )*};
}

impl_into_js_lossless!(i8, i16, i32, i64, isize, u8, u16, u32);

macro_rules! impl_into_js_unsigned_wide {
    ($($t:ty),*) => {$(
        impl IntoJs for $t {
            fn into_js(self, ctx: &EngineCtx) -> Result<RawValue> {
                match i64::try_from(self) {
                    Ok(n) => Ok(RawValue::from_i64(n)),
                    Err(_) => Err(throw_range_error(
                        ctx,
                        format!("Could not wrap integer into {}", stringify!($t)),
                    )),
                }
            }
        }
    )*};
}

impl_into_js_unsigned_wide!(u64, usize);

impl FromJs for f64 {
    fn from_js(ctx: &EngineCtx, v: RawValue) -> Result<Self> {
        ctx.to_number(v).map_err(|_| Error::exception(ctx))
    }
}

impl IntoJs for f64 {
    fn into_js(self, _ctx: &EngineCtx) -> Result<RawValue> {
        Ok(RawValue::from_f64(self))
    }
}

impl FromJs for f32 {
    fn from_js(ctx: &EngineCtx, v: RawValue) -> Result<Self> {
        f64::from_js(ctx, v).map(|n| n as f32)
    }
}

impl IntoJs for f32 {
    fn into_js(self, _ctx: &EngineCtx) -> Result<RawValue> {
        Ok(RawValue::from_f64(self as f64))
    }
}

// ----------------------------------------------------------------------
// Strings
// ----------------------------------------------------------------------

impl FromJs for String {
    fn from_js(ctx: &EngineCtx, v: RawValue) -> Result<Self> {
        JsStr::from_js(ctx, v).map(|s| s.to_string())
    }
}

impl IntoJs for String {
    fn into_js(self, ctx: &EngineCtx) -> Result<RawValue> {
        Ok(ctx.new_string(&self))
    }
}

impl IntoJs for &str {
    fn into_js(self, ctx: &EngineCtx) -> Result<RawValue> {
        Ok(ctx.new_string(self))
    }
}

impl IntoJs for &String {
    fn into_js(self, ctx: &EngineCtx) -> Result<RawValue> {
        Ok(ctx.new_string(self))
    }
}

/// Zero-copy view of an engine string
///
/// Borrows the UTF-8 bytes of the engine string it was read from where the
/// engine stores them that way (ASCII text); non-string values are converted
/// with ToString first. Use `to_string()` for an owned copy.
pub struct JsStr(EngineStr);

impl JsStr {
    #[inline]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Deref for JsStr {
    type Target = str;

    fn deref(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JsStr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self)
    }
}

impl fmt::Debug for JsStr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self.as_str(), f)
    }
}

impl PartialEq for JsStr {
    fn eq(&self, other: &JsStr) -> bool {
        self.as_str() == other.as_str()
    }
}

impl Eq for JsStr {}

impl Hash for JsStr {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.as_str().hash(state)
    }
}

impl PartialEq<str> for JsStr {
    fn eq(&self, other: &str) -> bool {
        self.as_str() == other
    }
}

impl PartialEq<&str> for JsStr {
    fn eq(&self, other: &&str) -> bool {
        self.as_str() == *other
    }
}

impl FromJs for JsStr {
    fn from_js(ctx: &EngineCtx, v: RawValue) -> Result<Self> {
        ctx.to_engine_str(v)
            .map(JsStr)
            .map_err(|_| Error::exception(ctx))
    }
}

impl IntoJs for JsStr {
    fn into_js(self, ctx: &EngineCtx) -> Result<RawValue> {
        Ok(ctx.new_string(&self))
    }
}

// ----------------------------------------------------------------------
// Values
// ----------------------------------------------------------------------

impl FromJs for Value {
    fn from_js(ctx: &EngineCtx, v: RawValue) -> Result<Self> {
        if v.is_exception() {
            return Err(Error::exception(ctx));
        }
        Ok(Value::from_borrowed(ctx, v))
    }
}

impl IntoJs for Value {
    fn into_js(self, ctx: &EngineCtx) -> Result<RawValue> {
        match self.engine() {
            Some(_) => Ok(self.release()),
            None => Ok(ctx.dup_value(self.release())),
        }
    }
}

impl IntoJs for &Value {
    fn into_js(self, ctx: &EngineCtx) -> Result<RawValue> {
        Ok(ctx.dup_value(self.raw()))
    }
}

// ----------------------------------------------------------------------
// Optional values and results
// ----------------------------------------------------------------------

/// `null` unwraps to `None`. Anything else, `undefined` included, goes
/// through `T`; a failed conversion is `None` with the exception cleared.
impl<T: FromJs> FromJs for Option<T> {
    fn from_js(ctx: &EngineCtx, v: RawValue) -> Result<Self> {
        if v.is_null() {
            return Ok(None);
        }
        match T::from_js(ctx, v) {
            Ok(value) => Ok(Some(value)),
            Err(_) => {
                ctx.free_value(ctx.get_exception());
                Ok(None)
            }
        }
    }
}

impl<T: IntoJs> IntoJs for Option<T> {
    fn into_js(self, ctx: &EngineCtx) -> Result<RawValue> {
        match self {
            Some(value) => value.into_js(ctx),
            None => Ok(RawValue::NULL),
        }
    }
}

/// Native results: `Err` propagates out of the wrapped call
impl<T: IntoJs, E: Into<Error>> IntoJs for std::result::Result<T, E> {
    fn into_js(self, ctx: &EngineCtx) -> Result<RawValue> {
        match self {
            Ok(value) => value.into_js(ctx),
            Err(e) => Err(e.into()),
        }
    }
}

// ----------------------------------------------------------------------
// Sequences
// ----------------------------------------------------------------------

/// Collect the elements of an array-like object
fn unwrap_sequence<T: FromJs, C: FromIterator<T>>(ctx: &EngineCtx, v: RawValue) -> Result<C> {
    if !v.is_object() {
        return Err(throw_type_error(
            ctx,
            format!("Expected array, got {}", v.tag().name()),
        ));
    }
    let len = ctx.get_length(v).map_err(|_| Error::exception(ctx))?;
    (0..len)
        .map(|i| {
            let item = Value::check(ctx, ctx.get_property_i64(v, i))?;
            T::from_js(ctx, item.raw())
        })
        .collect()
}

/// Build an array from native elements
fn wrap_sequence<T: IntoJs>(ctx: &EngineCtx, items: impl IntoIterator<Item = T>) -> Result<RawValue> {
    let mut elements = Vec::new();
    for item in items {
        match item.into_js(ctx) {
            Ok(v) => elements.push(v),
            Err(e) => {
                free_all(ctx, elements);
                return Err(e);
            }
        }
    }
    Ok(ctx.new_array_from(elements))
}

impl<T: FromJs> FromJs for Vec<T> {
    fn from_js(ctx: &EngineCtx, v: RawValue) -> Result<Self> {
        unwrap_sequence(ctx, v)
    }
}

impl<T: IntoJs> IntoJs for Vec<T> {
    fn into_js(self, ctx: &EngineCtx) -> Result<RawValue> {
        wrap_sequence(ctx, self)
    }
}

impl<T: FromJs> FromJs for VecDeque<T> {
    fn from_js(ctx: &EngineCtx, v: RawValue) -> Result<Self> {
        unwrap_sequence(ctx, v)
    }
}

impl<T: IntoJs> IntoJs for VecDeque<T> {
    fn into_js(self, ctx: &EngineCtx) -> Result<RawValue> {
        wrap_sequence(ctx, self)
    }
}

/// Duplicate elements collapse
impl<T: FromJs + Eq + Hash> FromJs for HashSet<T> {
    fn from_js(ctx: &EngineCtx, v: RawValue) -> Result<Self> {
        unwrap_sequence(ctx, v)
    }
}

impl<T: IntoJs> IntoJs for HashSet<T> {
    fn into_js(self, ctx: &EngineCtx) -> Result<RawValue> {
        wrap_sequence(ctx, self)
    }
}

impl<T: FromJs + Ord> FromJs for BTreeSet<T> {
    fn from_js(ctx: &EngineCtx, v: RawValue) -> Result<Self> {
        unwrap_sequence(ctx, v)
    }
}

impl<T: IntoJs> IntoJs for BTreeSet<T> {
    fn into_js(self, ctx: &EngineCtx) -> Result<RawValue> {
        wrap_sequence(ctx, self)
    }
}

impl<T: IntoJs + Clone> IntoJs for &[T] {
    fn into_js(self, ctx: &EngineCtx) -> Result<RawValue> {
        wrap_sequence(ctx, self.iter().cloned())
    }
}

impl<A: FromJs, B: FromJs> FromJs for (A, B) {
    fn from_js(ctx: &EngineCtx, v: RawValue) -> Result<Self> {
        if !ctx.is_array(v) {
            return Err(throw_type_error(
                ctx,
                format!("Expected array, got {}", v.tag().name()),
            ));
        }
        let len = ctx.get_length(v).map_err(|_| Error::exception(ctx))?;
        if len != 2 {
            return Err(throw_type_error(
                ctx,
                format!("Expected array of length 2, got {}", len),
            ));
        }
        let first = Value::check(ctx, ctx.get_property_u32(v, 0))?;
        let second = Value::check(ctx, ctx.get_property_u32(v, 1))?;
        Ok((A::from_js(ctx, first.raw())?, B::from_js(ctx, second.raw())?))
    }
}

impl<A: IntoJs, B: IntoJs> IntoJs for (A, B) {
    fn into_js(self, ctx: &EngineCtx) -> Result<RawValue> {
        let first = self.0.into_js(ctx)?;
        let second = match self.1.into_js(ctx) {
            Ok(v) => v,
            Err(e) => {
                ctx.free_value(first);
                return Err(e);
            }
        };
        Ok(ctx.new_array_from(vec![first, second]))
    }
}

// ----------------------------------------------------------------------
// Associative containers
// ----------------------------------------------------------------------

fn atom_to_value(ctx: &EngineCtx, atom: &Atom) -> Value {
    match atom {
        Atom::Index(i) => Value::from_raw(ctx, RawValue::from_i64(*i as i64)),
        Atom::Name(name) => Value::from_raw(ctx, ctx.new_string(name)),
    }
}

/// Own enumerable string-keyed properties as key/value pairs
fn unwrap_entries<K: FromJs, V: FromJs, C: FromIterator<(K, V)>>(
    ctx: &EngineCtx,
    v: RawValue,
) -> Result<C> {
    if !v.is_object() {
        return Err(throw_type_error(ctx, "Value is not an object"));
    }
    let keys = ctx
        .get_own_property_names(v, true)
        .map_err(|_| Error::exception(ctx))?;
    keys.iter()
        .map(|atom| {
            let key = K::from_js(ctx, atom_to_value(ctx, atom).raw())?;
            let item = Value::check(ctx, ctx.get_property(v, atom))?;
            Ok((key, V::from_js(ctx, item.raw())?))
        })
        .collect()
}

fn wrap_entries<K: PropertyKey, V: IntoJs>(
    ctx: &EngineCtx,
    entries: impl IntoIterator<Item = (K, V)>,
) -> Result<RawValue> {
    let obj = Value::from_raw(ctx, ctx.new_object());
    for (key, item) in entries {
        let item = item.into_js(ctx)?;
        ctx.set_property(obj.raw(), &key.to_atom(), item)
            .map_err(|_| Error::exception(ctx))?;
    }
    Ok(obj.release())
}

impl<K: FromJs + Eq + Hash, V: FromJs> FromJs for HashMap<K, V> {
    fn from_js(ctx: &EngineCtx, v: RawValue) -> Result<Self> {
        unwrap_entries(ctx, v)
    }
}

impl<K: PropertyKey, V: IntoJs> IntoJs for HashMap<K, V> {
    fn into_js(self, ctx: &EngineCtx) -> Result<RawValue> {
        wrap_entries(ctx, self)
    }
}

impl<K: FromJs + Ord, V: FromJs> FromJs for BTreeMap<K, V> {
    fn from_js(ctx: &EngineCtx, v: RawValue) -> Result<Self> {
        unwrap_entries(ctx, v)
    }
}

impl<K: PropertyKey, V: IntoJs> IntoJs for BTreeMap<K, V> {
    fn into_js(self, ctx: &EngineCtx) -> Result<RawValue> {
        wrap_entries(ctx, self)
    }
}

/// Conversions for a fieldless enum through its discriminant, as the
/// enum's `repr` integer type
///
/// ```ignore
/// #[derive(Clone, Copy)]
/// #[repr(u8)]
/// enum Color { Red, Green }
/// qjs::js_enum!(Color: u8 { Red, Green });
/// ```
#[macro_export]
macro_rules! js_enum {
    ($name:ident : $repr:ty { $($variant:ident),+ $(,)? }) => {
        impl $crate::FromJs for $name {
            fn from_js(
                ctx: &$crate::engine::EngineCtx,
                v: $crate::engine::RawValue,
            ) -> $crate::Result<Self> {
                let n = <$repr as $crate::FromJs>::from_js(ctx, v)?;
                $(
                    if n == $name::$variant as $repr {
                        return Ok($name::$variant);
                    }
                )+
                Err($crate::convert::throw_range_error(
                    ctx,
                    format!("Could not unwrap integer into {}", stringify!($name)),
                ))
            }
        }

        impl $crate::IntoJs for $name {
            fn into_js(
                self,
                ctx: &$crate::engine::EngineCtx,
            ) -> $crate::Result<$crate::engine::RawValue> {
                $crate::IntoJs::into_js(self as $repr, ctx)
            }
        }
    };
}
