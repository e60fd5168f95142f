//! Engine value representation
//!
//! A [`RawValue`] is the engine's tagged value, copied by bits. Strings,
//! symbols, big integers, objects and modules carry a reference count that
//! is managed explicitly through `EngineCtx::dup_value` and
//! `EngineCtx::free_value`; every other tag is an immediate.

use std::fmt;

use rquickjs_sys as qjs;

/// Compiled module record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ModuleId(pub(crate) *mut qjs::JSModuleDef);

/// Value tag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Tag {
    Undefined,
    Null,
    Bool,
    Int,
    Float,
    String,
    Symbol,
    BigInt,
    Object,
    Module,
    Exception,
    Uninitialized,
}

impl Tag {
    fn from_raw(tag: i32) -> Tag {
        match tag {
            qjs::JS_TAG_UNDEFINED => Tag::Undefined,
            qjs::JS_TAG_NULL => Tag::Null,
            qjs::JS_TAG_BOOL => Tag::Bool,
            qjs::JS_TAG_INT => Tag::Int,
            qjs::JS_TAG_FLOAT64 => Tag::Float,
            qjs::JS_TAG_STRING => Tag::String,
            qjs::JS_TAG_SYMBOL => Tag::Symbol,
            qjs::JS_TAG_BIG_INT => Tag::BigInt,
            qjs::JS_TAG_OBJECT => Tag::Object,
            qjs::JS_TAG_MODULE => Tag::Module,
            qjs::JS_TAG_EXCEPTION => Tag::Exception,
            _ => Tag::Uninitialized,
        }
    }

    /// Script-visible name of the tag, as used in type errors
    pub fn name(self) -> &'static str {
        match self {
            Tag::Undefined => "undefined",
            Tag::Null => "null",
            Tag::Bool => "boolean",
            Tag::Int | Tag::Float => "number",
            Tag::String => "string",
            Tag::Symbol => "symbol",
            Tag::BigInt => "bigint",
            Tag::Object => "object",
            Tag::Module => "module",
            Tag::Exception => "exception",
            Tag::Uninitialized => "uninitialized",
        }
    }
}

/// Engine value
#[repr(transparent)]
#[derive(Clone, Copy)]
pub struct RawValue(pub(crate) qjs::JSValue);

impl RawValue {
    pub const UNDEFINED: RawValue = RawValue(qjs::JS_UNDEFINED);
    pub const NULL: RawValue = RawValue(qjs::JS_NULL);
    pub const TRUE: RawValue = RawValue(qjs::JS_TRUE);
    pub const FALSE: RawValue = RawValue(qjs::JS_FALSE);
    /// Marker returned by operations that left an exception pending
    pub const EXCEPTION: RawValue = RawValue(qjs::JS_EXCEPTION);
    pub const UNINITIALIZED: RawValue = RawValue(qjs::JS_UNINITIALIZED);

    #[inline]
    pub const fn from_bool(b: bool) -> Self {
        RawValue(qjs::JS_MKVAL(qjs::JS_TAG_BOOL, b as i32))
    }

    #[inline]
    pub const fn from_i32(n: i32) -> Self {
        RawValue(qjs::JS_MKVAL(qjs::JS_TAG_INT, n))
    }

    /// Number value; integral doubles are stored as ints
    #[inline]
    pub fn from_f64(n: f64) -> Self {
        RawValue(qjs::JS_NewFloat64(n))
    }

    /// Number value from a 64-bit integer, exact up to 2^53
    #[inline]
    pub fn from_i64(n: i64) -> Self {
        match i32::try_from(n) {
            Ok(i) => Self::from_i32(i),
            Err(_) => RawValue(qjs::__JS_NewFloat64(n as f64)),
        }
    }

    #[inline]
    pub(crate) fn raw_tag(self) -> i32 {
        unsafe { qjs::JS_VALUE_GET_TAG(self.0) }
    }

    #[inline]
    pub fn tag(self) -> Tag {
        Tag::from_raw(self.raw_tag())
    }

    /// Check if the value holds a reference count
    #[inline]
    pub fn has_ref_count(self) -> bool {
        unsafe { qjs::JS_VALUE_HAS_REF_COUNT(self.0) }
    }

    #[inline]
    pub(crate) fn ptr(self) -> *mut std::ffi::c_void {
        unsafe { qjs::JS_VALUE_GET_PTR(self.0) }
    }

    #[inline]
    pub fn is_undefined(self) -> bool {
        self.raw_tag() == qjs::JS_TAG_UNDEFINED
    }

    #[inline]
    pub fn is_null(self) -> bool {
        self.raw_tag() == qjs::JS_TAG_NULL
    }

    #[inline]
    pub fn is_exception(self) -> bool {
        self.raw_tag() == qjs::JS_TAG_EXCEPTION
    }

    #[inline]
    pub fn is_bool(self) -> bool {
        self.raw_tag() == qjs::JS_TAG_BOOL
    }

    #[inline]
    pub fn is_number(self) -> bool {
        matches!(self.raw_tag(), qjs::JS_TAG_INT | qjs::JS_TAG_FLOAT64)
    }

    #[inline]
    pub fn is_string(self) -> bool {
        self.raw_tag() == qjs::JS_TAG_STRING
    }

    #[inline]
    pub fn is_object(self) -> bool {
        self.raw_tag() == qjs::JS_TAG_OBJECT
    }

    #[inline]
    pub fn is_module(self) -> bool {
        self.raw_tag() == qjs::JS_TAG_MODULE
    }

    /// Boolean payload
    #[inline]
    pub fn as_bool(self) -> Option<bool> {
        self.is_bool().then(|| unsafe { qjs::JS_VALUE_GET_BOOL(self.0) })
    }

    /// Int payload, without conversion from floats
    #[inline]
    pub fn as_i32(self) -> Option<i32> {
        (self.raw_tag() == qjs::JS_TAG_INT).then(|| unsafe { qjs::JS_VALUE_GET_INT(self.0) })
    }

    /// Numeric payload for ints and floats
    #[inline]
    pub fn as_f64(self) -> Option<f64> {
        match self.raw_tag() {
            qjs::JS_TAG_INT => Some(unsafe { qjs::JS_VALUE_GET_INT(self.0) } as f64),
            qjs::JS_TAG_FLOAT64 => Some(unsafe { qjs::JS_VALUE_GET_FLOAT64(self.0) }),
            _ => None,
        }
    }

    /// Module record behind a module value
    #[inline]
    pub fn as_module(self) -> Option<ModuleId> {
        self.is_module().then(|| ModuleId(self.ptr().cast()))
    }

    /// Identity comparison: same cell for counted values, same bits otherwise
    pub fn same_identity(self, other: RawValue) -> bool {
        if self.raw_tag() != other.raw_tag() {
            return false;
        }
        if self.has_ref_count() {
            return self.ptr() == other.ptr();
        }
        match self.raw_tag() {
            qjs::JS_TAG_FLOAT64 => unsafe {
                qjs::JS_VALUE_GET_FLOAT64(self.0).to_bits()
                    == qjs::JS_VALUE_GET_FLOAT64(other.0).to_bits()
            },
            _ => unsafe { qjs::JS_VALUE_GET_INT(self.0) == qjs::JS_VALUE_GET_INT(other.0) },
        }
    }
}

impl Default for RawValue {
    fn default() -> Self {
        RawValue::UNDEFINED
    }
}

impl PartialEq for RawValue {
    fn eq(&self, other: &Self) -> bool {
        self.same_identity(*other)
    }
}

impl fmt::Debug for RawValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.tag() {
            Tag::Bool => write!(f, "Bool({})", self.as_bool().unwrap_or_default()),
            Tag::Int => write!(f, "Int({})", self.as_i32().unwrap_or_default()),
            Tag::Float => write!(f, "Float({})", self.as_f64().unwrap_or_default()),
            tag if self.has_ref_count() => write!(f, "{:?}({:p})", tag, self.ptr()),
            tag => write!(f, "{:?}", tag),
        }
    }
}
