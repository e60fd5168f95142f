//! Native classes
//!
//! Every Rust type exposed to scripts gets one process-wide class entry,
//! keyed by its `TypeId`. The entry carries the engine class id, the class
//! name, the cast table used to unwrap instances of derived classes, and the
//! fields the cycle collector should trace.
//!
//! Instances hold an `Arc<T>` (owned) or a `Weak<T>` (borrowed) as their
//! opaque payload. Marked fields are traced only while the object is the
//! sole owner of its instance; an instance also held natively keeps its
//! fields alive as roots. Inheritance is expressed through [`Inherits`]: a derived
//! type knows how to produce its base, and registering the relation teaches
//! the base (and its own bases, transitively) to accept derived instances.

use std::any::{Any, TypeId, type_name};
use std::collections::{HashMap, HashSet};
use std::rc::Rc;
use std::sync::{Arc, LazyLock, Weak};

use log::{debug, trace};
use parking_lot::Mutex;

use crate::convert::{FromJs, IntoJs, throw_internal_error, throw_type_error};
use crate::engine::{ClassDef, ClassId, EngineCtx, RawValue};
use crate::error::{Error, Result};
use crate::value::Value;

/// Opaque payload of a class instance
pub enum ClassPayload<T> {
    /// The object shares ownership of the instance
    Owned(Arc<T>),
    /// The object refers to an instance owned elsewhere
    Borrowed(Weak<T>),
}

impl<T> ClassPayload<T> {
    /// The instance, if it is still alive
    pub fn get(&self) -> Option<Arc<T>> {
        match self {
            ClassPayload::Owned(arc) => Some(arc.clone()),
            ClassPayload::Borrowed(weak) => weak.upgrade(),
        }
    }
}

/// A derived class that can be viewed as its base `B`
///
/// ```ignore
/// struct Shape { name: String }
/// struct Circle { shape: Arc<Shape>, radius: f64 }
///
/// impl Inherits<Shape> for Circle {
///     fn upcast(this: Arc<Self>) -> Arc<Shape> {
///         this.shape.clone()
///     }
/// }
/// ```
pub trait Inherits<B: 'static>: 'static {
    fn upcast(this: Arc<Self>) -> Arc<B>;
}

type CastFn<T> = Arc<dyn Fn(&EngineCtx, RawValue) -> Result<Arc<T>> + Send + Sync>;

/// Forwards a derived-class cast to one base of `T`
type BaseHook<T> = Arc<dyn Fn(ClassId, CastFn<T>) + Send + Sync>;

/// A `Value` field of `T` holding a script reference
pub type MarkField<T> = fn(&T) -> &Value;

struct ClassEntry<T> {
    class_id: Option<ClassId>,
    name: Option<String>,
    casts: HashMap<ClassId, CastFn<T>>,
    bases: Vec<BaseHook<T>>,
    /// Bases already attached through `register_base`
    base_ids: HashSet<TypeId>,
    mark_fields: Vec<MarkField<T>>,
}

impl<T> Default for ClassEntry<T> {
    fn default() -> Self {
        ClassEntry {
            class_id: None,
            name: None,
            casts: HashMap::new(),
            bases: Vec::new(),
            base_ids: HashSet::new(),
            mark_fields: Vec::new(),
        }
    }
}

static REGISTRY: LazyLock<Mutex<HashMap<TypeId, Box<dyn Any + Send>>>> =
    LazyLock::new(|| Mutex::new(HashMap::new()));

/// Run `f` on the entry of `T`, creating it on first use
///
/// The registry lock is held while `f` runs; `f` must not re-enter.
fn with_entry<T: 'static, R>(f: impl FnOnce(&mut ClassEntry<T>) -> R) -> R {
    let mut registry = REGISTRY.lock();
    let slot = registry
        .entry(TypeId::of::<T>())
        .or_insert_with(|| Box::new(ClassEntry::<T>::default()));
    match slot.downcast_mut::<ClassEntry<T>>() {
        Some(entry) => f(entry),
        None => unreachable!("class registry entry has the wrong type"),
    }
}

/// Class id of `T`, allocated on first use
pub fn class_id<T: 'static>() -> ClassId {
    with_entry::<T, _>(|entry| *entry.class_id.get_or_insert_with(ClassId::new_unique))
}

/// Check if `T` has been registered with a name
pub fn is_registered<T: 'static>() -> bool {
    with_entry::<T, _>(|entry| entry.name.is_some())
}

/// Name of the class of `T`; the Rust type name before registration
pub fn class_name<T: 'static>() -> String {
    with_entry::<T, _>(|entry| entry.name.clone())
        .unwrap_or_else(|| type_name::<T>().to_string())
}

/// Trace `field` of every owned instance of `T` during cycle collection
///
/// Adding the same field function again is a no-op.
pub fn add_mark_field<T: 'static>(field: MarkField<T>) {
    with_entry::<T, _>(|entry| {
        if !entry.mark_fields.iter().any(|f| *f as usize == field as usize) {
            entry.mark_fields.push(field);
        }
    });
}

fn add_cast<T: 'static>(derived: ClassId, cast: CastFn<T>) {
    let bases = with_entry::<T, _>(|entry| {
        entry.casts.insert(derived, cast.clone());
        entry.bases.clone()
    });
    for hook in bases {
        hook(derived, cast.clone());
    }
}

/// Make instances of `D` acceptable wherever a `B` is expected
///
/// Applies transitively: classes derived from `D`, before or after this
/// call, are accepted by `B` and by every base of `B`. Registering the same
/// pair again is a no-op.
pub fn register_base<D, B>()
where
    D: Inherits<B>,
    B: 'static,
{
    if !with_entry::<D, _>(|entry| entry.base_ids.insert(TypeId::of::<B>())) {
        return;
    }
    let derived = class_id::<D>();
    debug!(
        "registering {} as derived from {}",
        type_name::<D>(),
        type_name::<B>()
    );
    let direct: CastFn<B> = Arc::new(|ctx: &EngineCtx, v: RawValue| {
        unwrap_own::<D>(ctx, v).map(<D as Inherits<B>>::upcast)
    });
    add_cast::<B>(derived, direct);

    let hook: BaseHook<D> = Arc::new(|id: ClassId, cast: CastFn<D>| {
        let upcast: CastFn<B> = Arc::new(move |ctx: &EngineCtx, v: RawValue| {
            cast(ctx, v).map(<D as Inherits<B>>::upcast)
        });
        add_cast::<B>(id, upcast);
    });
    let known = with_entry::<D, _>(|entry| {
        entry.bases.push(hook.clone());
        entry
            .casts
            .iter()
            .map(|(id, cast)| (*id, cast.clone()))
            .collect::<Vec<_>>()
    });
    for (id, cast) in known {
        hook(id, cast);
    }
}

/// Payload of an object whose class is exactly `T`
fn unwrap_own<T: 'static>(ctx: &EngineCtx, v: RawValue) -> Result<Arc<T>> {
    let id = class_id::<T>();
    let payload = ctx
        .with_opaque(v, id, |any| {
            any.downcast_ref::<ClassPayload<T>>().and_then(ClassPayload::get)
        })
        .flatten();
    payload.ok_or_else(|| throw_internal_error(ctx, "Object's opaque pointer is null"))
}

/// Instance of `T`, or of a class registered as derived from `T`
pub fn unwrap_arc<T: 'static>(ctx: &EngineCtx, v: RawValue) -> Result<Arc<T>> {
    if !v.is_object() {
        return Err(throw_type_error(
            ctx,
            format!("Expected type {}, got {}", class_name::<T>(), v.tag().name()),
        ));
    }
    let object_class = ctx.class_id_of(v);
    let (own, cast) = with_entry::<T, _>(|entry| {
        (entry.class_id, entry.casts.get(&object_class).cloned())
    });
    if own == Some(object_class) {
        return unwrap_own::<T>(ctx, v);
    }
    match cast {
        Some(cast) => cast(ctx, v),
        None => {
            let found = ctx
                .runtime()
                .class_name(object_class)
                .map_or_else(|| "<unknown>".to_string(), |n| n.to_string());
            Err(throw_type_error(
                ctx,
                format!(
                    "Expected type {}, got object of class {} (class ID {})",
                    class_name::<T>(),
                    found,
                    object_class.0
                ),
            ))
        }
    }
}

fn new_instance<T: 'static>(ctx: &EngineCtx, payload: ClassPayload<T>) -> Result<RawValue> {
    let id = ensure_defined::<T>(ctx)?;
    let obj = Value::check(ctx, ctx.new_object_class(id))?;
    ctx.set_opaque(obj.raw(), Box::new(payload))
        .map_err(|_| Error::exception(ctx))?;
    Ok(obj.release())
}

/// New object of class `T` sharing ownership of `instance`
pub fn wrap_arc<T: 'static>(ctx: &EngineCtx, instance: Arc<T>) -> Result<RawValue> {
    new_instance(ctx, ClassPayload::Owned(instance))
}

/// New object of class `T` referring to an instance owned elsewhere
pub fn wrap_weak<T: 'static>(ctx: &EngineCtx, instance: Weak<T>) -> Result<RawValue> {
    new_instance(ctx, ClassPayload::Borrowed(instance))
}

fn class_def<T: 'static>(name: &str) -> ClassDef {
    let mut def = ClassDef::new(name);
    def.finalizer = Some(Rc::new(|payload: Box<dyn Any>| {
        trace!("finalizing instance of {}", type_name::<T>());
        drop(payload);
    }));
    let traced = with_entry::<T, _>(|entry| !entry.mark_fields.is_empty());
    if traced {
        def.gc_mark = Some(Rc::new(|payload: &dyn Any, mark: &mut dyn FnMut(RawValue)| {
            let Some(ClassPayload::Owned(instance)) = payload.downcast_ref::<ClassPayload<T>>()
            else {
                return;
            };
            if Arc::strong_count(instance) != 1 {
                return;
            }
            let fields = with_entry::<T, _>(|entry| entry.mark_fields.clone());
            // Each held reference is reported once, however many fields name it
            let mut seen: Vec<*const Value> = Vec::with_capacity(fields.len());
            for field in fields {
                let value = field(instance);
                if !seen.contains(&(value as *const Value)) {
                    seen.push(value);
                    mark(value.raw());
                }
            }
        }));
    }
    def
}

fn define_in_runtime<T: 'static>(ctx: &EngineCtx, id: ClassId, name: &str) -> Result<()> {
    let rt = ctx.runtime();
    if rt.is_registered_class(id) {
        return Ok(());
    }
    rt.new_class(id, class_def::<T>(name)).map_err(|e| {
        debug!("class {} rejected: {}", name, e);
        throw_internal_error(ctx, format!("Could not register class {}", name))
    })
}

/// Class id of `T`, defining the class in the context's runtime if needed
pub fn ensure_defined<T: 'static>(ctx: &EngineCtx) -> Result<ClassId> {
    let id = class_id::<T>();
    if !ctx.runtime().is_registered_class(id) {
        define_in_runtime::<T>(ctx, id, &class_name::<T>())?;
    }
    Ok(id)
}

/// Register `T` under `name` with the prototype `proto` (consumed)
pub fn register_class<T: 'static>(ctx: &EngineCtx, name: &str, proto: RawValue) -> Result<ClassId> {
    let id = with_entry::<T, _>(|entry| {
        entry.name.get_or_insert_with(|| name.to_string());
        *entry.class_id.get_or_insert_with(ClassId::new_unique)
    });
    if let Err(e) = define_in_runtime::<T>(ctx, id, name) {
        ctx.free_value(proto);
        return Err(e);
    }
    ctx.set_class_proto(id, proto);
    Ok(id)
}

impl<T: 'static> FromJs for Arc<T> {
    fn from_js(ctx: &EngineCtx, v: RawValue) -> Result<Self> {
        unwrap_arc(ctx, v)
    }
}

impl<T: 'static> IntoJs for Arc<T> {
    fn into_js(self, ctx: &EngineCtx) -> Result<RawValue> {
        wrap_arc(ctx, self)
    }
}

impl<T: 'static> FromJs for Weak<T> {
    fn from_js(ctx: &EngineCtx, v: RawValue) -> Result<Self> {
        unwrap_arc(ctx, v).map(|arc| Arc::downgrade(&arc))
    }
}

/// Dead references wrap to `null`
impl<T: 'static> IntoJs for Weak<T> {
    fn into_js(self, ctx: &EngineCtx) -> Result<RawValue> {
        if self.strong_count() == 0 {
            return Ok(RawValue::NULL);
        }
        wrap_weak(ctx, self)
    }
}
