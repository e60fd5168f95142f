//! Property keys and deferred property access

use crate::convert::{FromJs, IntoJs};
use crate::engine::{Atom, EngineCtx, RawValue};
use crate::error::{Error, Result};
use crate::function::{Callable, FWrapper};
use crate::value::Value;

/// A type usable as a property key
///
/// Strings name properties; integers address indexed properties.
pub trait PropertyKey: Clone {
    fn to_atom(&self) -> Atom;
}

impl PropertyKey for &str {
    fn to_atom(&self) -> Atom {
        Atom::new(self)
    }
}

impl PropertyKey for String {
    fn to_atom(&self) -> Atom {
        Atom::new(self)
    }
}

impl PropertyKey for &String {
    fn to_atom(&self) -> Atom {
        Atom::new(self)
    }
}

macro_rules! impl_index_key {
    (u32: $($u:ty),*; i64: $($i:ty),*) => {
        $(
            impl PropertyKey for $u {
                fn to_atom(&self) -> Atom {
                    Atom::from_u32(*self as u32)
                }
            }
        )*
        $(
            impl PropertyKey for $i {
                fn to_atom(&self) -> Atom {
                    Atom::from_i64(*self as i64)
                }
            }
        )*
    };
}

impl_index_key!(u32: u8, u16, u32; i64: i8, i16, i32, i64, isize);

macro_rules! impl_wide_key {
    ($($t:ty),*) => {$(
        impl PropertyKey for $t {
            fn to_atom(&self) -> Atom {
                match i64::try_from(*self) {
                    Ok(key) => Atom::from_i64(key),
                    Err(_) => Atom::new(&self.to_string()),
                }
            }
        }
    )*};
}

impl_wide_key!(u64, usize);

/// A property of an object, resolved when read or written
///
/// Holds its own reference to the object.
pub struct PropertyProxy<K: PropertyKey> {
    ctx: EngineCtx,
    obj: RawValue,
    key: K,
}

impl<K: PropertyKey> PropertyProxy<K> {
    /// Proxy for `obj[key]`; `obj` is consumed
    pub fn new(ctx: &EngineCtx, obj: RawValue, key: K) -> Self {
        PropertyProxy {
            ctx: ctx.clone(),
            obj,
            key,
        }
    }

    #[inline]
    pub fn key(&self) -> &K {
        &self.key
    }

    /// Read the property as a binding value
    pub fn value(&self) -> Result<Value> {
        let v = self.ctx.get_property(self.obj, &self.key.to_atom());
        Value::check(&self.ctx, v)
    }

    /// Read and convert the property
    pub fn get<T: FromJs>(&self) -> Result<T> {
        self.value()?.get()
    }

    /// Alias for [`PropertyProxy::get`]
    #[inline]
    pub fn as_<T: FromJs>(&self) -> Result<T> {
        self.get()
    }

    /// Convert and assign the property
    pub fn set<T: IntoJs>(&self, value: T) -> Result<()> {
        let v = value.into_js(&self.ctx)?;
        self.ctx
            .set_property(self.obj, &self.key.to_atom(), v)
            .map_err(|_| Error::exception(&self.ctx))
    }

    /// Assign a native function named after the key
    pub fn set_fn<F, M>(&self, f: F) -> Result<()>
    where
        F: Callable<M>,
        F::Output: IntoJs,
        M: 'static,
    {
        let name = self.key.to_atom().to_string();
        self.set(FWrapper::new(f, &name))
    }

    /// Proxy for a property of this property's value
    pub fn prop<K2: PropertyKey>(&self, key: K2) -> Result<PropertyProxy<K2>> {
        let v = self.value()?;
        Ok(PropertyProxy::new(&self.ctx, v.release(), key))
    }
}

impl<K: PropertyKey> Drop for PropertyProxy<K> {
    fn drop(&mut self) {
        self.ctx.free_value(self.obj);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Context, Runtime};

    #[test]
    fn test_key_atoms() {
        assert_eq!("x".to_atom(), Atom::new("x"));
        assert_eq!(3u8.to_atom(), Atom::Index(3));
        assert_eq!(7i32.to_atom(), Atom::Index(7));
        assert_eq!((-1i32).to_atom(), Atom::new("-1"));
        assert_eq!(u64::MAX.to_atom().to_string(), "18446744073709551615");
    }

    #[test]
    fn test_proxy_read_write() {
        let rt = Runtime::new();
        let ctx = Context::new(&rt).unwrap();
        let obj = ctx.new_object();
        obj.prop("count").unwrap().set(41).unwrap();
        let count = obj.prop("count").unwrap();
        assert_eq!(count.get::<i32>().unwrap(), 41);
        count.set(count.get::<i32>().unwrap() + 1).unwrap();
        assert_eq!(obj.get_prop::<i32, _>("count").unwrap(), 42);

        let list = ctx.new_array();
        list.prop(0u32).unwrap().set("first").unwrap();
        list.prop(1u32).unwrap().set("second").unwrap();
        assert_eq!(list.get::<Vec<String>>().unwrap(), ["first", "second"]);
    }

    #[test]
    fn test_proxy_nested_and_fn() {
        let rt = Runtime::new();
        let ctx = Context::new(&rt).unwrap();
        let obj = ctx.new_object();
        let inner = ctx.new_object();
        inner.set_prop("depth", 2).unwrap();
        obj.set_prop("inner", &inner).unwrap();
        let depth: i32 = obj.prop("inner").unwrap().prop("depth").unwrap().get().unwrap();
        assert_eq!(depth, 2);

        obj.prop("twice").unwrap().set_fn(|x: i32| x * 2).unwrap();
        let twice = obj.prop("twice").unwrap().value().unwrap();
        assert_eq!(twice.prop("name").unwrap().get::<String>().unwrap(), "twice");
        assert_eq!(obj.invoke("twice", (21,)).unwrap().get::<i32>().unwrap(), 42);
    }

    #[test]
    fn test_proxy_holds_object() {
        let rt = Runtime::new();
        let ctx = Context::new(&rt).unwrap();
        let obj = ctx.new_object();
        let before = obj.ref_count();
        let proxy = obj.prop("x").unwrap();
        assert_eq!(obj.ref_count(), before.map(|n| n + 1));
        drop(proxy);
        assert_eq!(obj.ref_count(), before);
    }
}
