//! Engine runtime
//!
//! The runtime owns the QuickJS heap, the class table and the job queue
//! shared by all contexts created from it. It also carries the host hooks:
//! the module loader and the promise rejection tracker.
//!
//! Host-side state lives in a [`RuntimeState`] registered as the runtime
//! opaque, so engine callbacks (finalizers, mark hooks, the loader) can
//! reach it from a bare `JSRuntime` pointer.

use std::any::Any;
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::ffi::CString;
use std::fmt;
use std::mem::MaybeUninit;
use std::ptr;
use std::rc::Rc;

use log::{debug, trace};
use rquickjs_sys as qjs;

use super::context::EngineCtx;
use super::function;
use super::module;
use super::object::{self, ClassId};
use super::value::{ModuleId, RawValue};

/// Finalizer receiving an object's opaque payload
pub type FinalizerFn = dyn Fn(Box<dyn Any>);

/// Mark callback reporting the engine values held by an opaque payload
pub type GcMarkFn = dyn Fn(&dyn Any, &mut dyn FnMut(RawValue));

/// Module loader hook: resolve a module name to a compiled module
pub type ModuleLoaderFn = dyn Fn(&EngineCtx, &str) -> Option<ModuleId>;

/// Promise rejection tracker: `(ctx, promise, reason, is_handled)`
pub type RejectionTrackerFn = dyn Fn(&EngineCtx, RawValue, RawValue, bool);

/// Class definition
#[derive(Clone)]
pub struct ClassDef {
    pub name: Rc<str>,
    pub finalizer: Option<Rc<FinalizerFn>>,
    pub gc_mark: Option<Rc<GcMarkFn>>,
}

impl ClassDef {
    /// A class with no hooks
    pub fn new(name: &str) -> Self {
        ClassDef {
            name: Rc::from(name),
            finalizer: None,
            gc_mark: None,
        }
    }
}

impl fmt::Debug for ClassDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClassDef")
            .field("name", &self.name)
            .field("finalizer", &self.finalizer.is_some())
            .field("gc_mark", &self.gc_mark.is_some())
            .finish()
    }
}

/// Class definition failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClassError {
    /// The id is reserved for built-in classes or out of range
    Reserved(ClassId),
    /// The id is already defined in this runtime
    AlreadyDefined(ClassId),
    /// The engine refused the definition
    Rejected(ClassId),
}

impl fmt::Display for ClassError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClassError::Reserved(id) => write!(f, "class id {} is reserved", id),
            ClassError::AlreadyDefined(id) => write!(f, "class id {} is already defined", id),
            ClassError::Rejected(id) => write!(f, "engine rejected class id {}", id),
        }
    }
}

impl std::error::Error for ClassError {}

/// Runtime tuning knobs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RuntimeConfig {
    /// Bytes allocated before an automatic cycle collection (0 disables)
    pub gc_threshold: usize,
    /// Maximum native stack the engine may use, in bytes
    pub max_stack_size: usize,
    /// Heap limit in bytes (0 means unlimited)
    pub memory_limit: usize,
}

impl RuntimeConfig {
    pub const DEFAULT_GC_THRESHOLD: usize = 256 * 1024;
    pub const DEFAULT_MAX_STACK_SIZE: usize = 1024 * 1024;

    pub fn gc_threshold(mut self, bytes: usize) -> Self {
        self.gc_threshold = bytes;
        self
    }

    pub fn max_stack_size(mut self, bytes: usize) -> Self {
        self.max_stack_size = bytes;
        self
    }

    pub fn memory_limit(mut self, bytes: usize) -> Self {
        self.memory_limit = bytes;
        self
    }

    /// Threshold handed to the engine
    fn engine_gc_threshold(&self) -> usize {
        if cfg!(feature = "debug-gc") {
            0
        } else if self.gc_threshold == 0 {
            usize::MAX
        } else {
            self.gc_threshold
        }
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        RuntimeConfig {
            gc_threshold: Self::DEFAULT_GC_THRESHOLD,
            max_stack_size: Self::DEFAULT_MAX_STACK_SIZE,
            memory_limit: 0,
        }
    }
}

/// Heap usage snapshot
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeapStats {
    pub objects: usize,
    pub strings: usize,
    pub atoms: usize,
    pub functions: usize,
    /// Bytes in use by the engine
    pub memory_used: usize,
    /// Bytes obtained from the allocator
    pub malloc_size: usize,
}

impl HeapStats {
    /// Number of live garbage-collected objects
    #[inline]
    pub fn live(&self) -> usize {
        self.objects
    }
}

/// Result of a cycle collection
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GcStats {
    /// Objects reclaimed
    pub collected: usize,
}

/// Outcome of [`Runtime::execute_pending_job`]
pub enum JobOutcome {
    /// The queue was empty
    Idle,
    /// A job ran to completion in the given context
    Completed(Option<EngineCtx>),
    /// A job threw; the exception is pending in the given context
    Failed(Option<EngineCtx>),
}

/// Host state reachable from engine callbacks
pub(crate) struct RuntimeState {
    classes: RefCell<HashMap<ClassId, Rc<ClassDef>>>,
    module_loader: RefCell<Option<Rc<ModuleLoaderFn>>>,
    rejection_tracker: RefCell<Option<Rc<RejectionTrackerFn>>>,
    /// Depth of finalizers currently running
    finalizing: Cell<u32>,
    /// Contexts released while a finalizer was running
    retired: RefCell<Vec<*mut qjs::JSContext>>,
    /// Context references held by host jobs that have not run yet
    job_contexts: RefCell<Vec<*mut qjs::JSContext>>,
    config: RuntimeConfig,
}

impl RuntimeState {
    /// State registered on a raw runtime
    ///
    /// # Safety
    /// `rt` must be a runtime created by [`Runtime::with_config`].
    pub(crate) unsafe fn from_raw<'a>(rt: *mut qjs::JSRuntime) -> Option<&'a RuntimeState> {
        unsafe { (qjs::JS_GetRuntimeOpaque(rt) as *const RuntimeState).as_ref() }
    }

    pub(crate) fn finalize(&self, id: ClassId, payload: Box<dyn Any>) {
        let finalizer = self.classes.borrow().get(&id).and_then(|def| def.finalizer.clone());
        self.finalizing.set(self.finalizing.get() + 1);
        match finalizer {
            Some(finalizer) => {
                trace!("finalizing payload of class {}", id);
                finalizer(payload);
            }
            None => drop(payload),
        }
        self.finalizing.set(self.finalizing.get() - 1);
    }

    pub(crate) fn gc_mark_hook(&self, id: ClassId) -> Option<Rc<GcMarkFn>> {
        self.classes.borrow().get(&id).and_then(|def| def.gc_mark.clone())
    }

    pub(crate) fn module_loader(&self) -> Option<Rc<ModuleLoaderFn>> {
        self.module_loader.borrow().clone()
    }

    pub(crate) fn rejection_tracker(&self) -> Option<Rc<RejectionTrackerFn>> {
        self.rejection_tracker.borrow().clone()
    }

    /// A host job finished with its context; free it at the next safe point
    pub(crate) fn release_job_context(&self, ctx: *mut qjs::JSContext) {
        let mut held = self.job_contexts.borrow_mut();
        if let Some(pos) = held.iter().position(|&raw| raw == ctx) {
            held.swap_remove(pos);
            self.retired.borrow_mut().push(ctx);
        }
    }

    fn drain_retired(&self) {
        let retired = std::mem::take(&mut *self.retired.borrow_mut());
        for raw in retired {
            unsafe { qjs::JS_FreeContext(raw) };
        }
    }
}

pub(crate) struct RuntimeInner {
    pub(crate) raw: *mut qjs::JSRuntime,
    state: Rc<RuntimeState>,
}

impl Drop for RuntimeInner {
    fn drop(&mut self) {
        let held = std::mem::take(&mut *self.state.job_contexts.borrow_mut());
        self.state.retired.borrow_mut().extend(held);
        self.state.drain_retired();
        debug!("freeing runtime");
        unsafe { qjs::JS_FreeRuntime(self.raw) };
    }
}

/// Engine runtime handle
///
/// Cloning yields another handle to the same runtime. The engine runtime is
/// freed with the last handle; every context holds one.
#[derive(Clone)]
pub struct Runtime(pub(crate) Rc<RuntimeInner>);

impl Runtime {
    pub fn new() -> Self {
        Self::with_config(RuntimeConfig::default())
    }

    /// Create a runtime
    ///
    /// # Panics
    /// Panics if the engine cannot allocate the runtime.
    pub fn with_config(config: RuntimeConfig) -> Self {
        let raw = unsafe { qjs::JS_NewRuntime() };
        if raw.is_null() {
            panic!("out of memory creating a JavaScript runtime");
        }
        let state = Rc::new(RuntimeState {
            classes: RefCell::new(HashMap::new()),
            module_loader: RefCell::new(None),
            rejection_tracker: RefCell::new(None),
            finalizing: Cell::new(0),
            retired: RefCell::new(Vec::new()),
            job_contexts: RefCell::new(Vec::new()),
            config,
        });
        unsafe {
            qjs::JS_SetRuntimeOpaque(raw, Rc::as_ptr(&state) as *mut _);
            qjs::JS_SetGCThreshold(raw, config.engine_gc_threshold() as qjs::size_t);
            qjs::JS_SetMaxStackSize(raw, config.max_stack_size as qjs::size_t);
            if config.memory_limit > 0 {
                qjs::JS_SetMemoryLimit(raw, config.memory_limit as qjs::size_t);
            }
            qjs::JS_SetModuleLoaderFunc(raw, None, Some(module::load_module), ptr::null_mut());
            qjs::JS_SetHostPromiseRejectionTracker(raw, Some(track_rejection), ptr::null_mut());
        }
        let rt = Runtime(Rc::new(RuntimeInner { raw, state }));
        function::define_function_class(&rt);
        debug!("runtime created ({:?})", config);
        rt
    }

    #[inline]
    pub(crate) fn raw(&self) -> *mut qjs::JSRuntime {
        self.0.raw
    }

    #[inline]
    pub(crate) fn state(&self) -> &RuntimeState {
        &self.0.state
    }

    #[inline]
    pub fn config(&self) -> RuntimeConfig {
        self.0.state.config
    }

    /// Check if two handles refer to the same runtime
    #[inline]
    pub fn ptr_eq(&self, other: &Runtime) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }

    // ------------------------------------------------------------------
    // Classes
    // ------------------------------------------------------------------

    /// Define a user class in this runtime
    pub fn new_class(&self, id: ClassId, def: ClassDef) -> Result<(), ClassError> {
        if !id.is_user() {
            return Err(ClassError::Reserved(id));
        }
        if self.is_registered_class(id) {
            return Err(ClassError::AlreadyDefined(id));
        }
        let name = CString::new(def.name.replace('\0', "")).unwrap_or_default();
        let class = qjs::JSClassDef {
            class_name: name.as_ptr(),
            finalizer: Some(object::finalize_opaque),
            gc_mark: if def.gc_mark.is_some() { Some(object::mark_opaque) } else { None },
            call: None,
            exotic: ptr::null_mut(),
        };
        if unsafe { qjs::JS_NewClass(self.raw(), id.0, &class) } != 0 {
            return Err(ClassError::Rejected(id));
        }
        debug!("defined class {} ({})", def.name, id);
        self.0.state.classes.borrow_mut().insert(id, Rc::new(def));
        Ok(())
    }

    #[inline]
    pub fn is_registered_class(&self, id: ClassId) -> bool {
        unsafe { qjs::JS_IsRegisteredClass(self.raw(), id.0) }
    }

    pub fn class_def(&self, id: ClassId) -> Option<Rc<ClassDef>> {
        self.0.state.classes.borrow().get(&id).cloned()
    }

    /// Class name, for built-in and defined classes
    pub fn class_name(&self, id: ClassId) -> Option<Rc<str>> {
        if let Some(name) = id.builtin_name() {
            return Some(Rc::from(name));
        }
        if id == function::function_class() {
            return Some(Rc::from("Function"));
        }
        self.class_def(id).map(|def| def.name.clone())
    }

    // ------------------------------------------------------------------
    // Hooks
    // ------------------------------------------------------------------

    pub fn set_module_loader(&self, loader: Option<Rc<ModuleLoaderFn>>) {
        *self.0.state.module_loader.borrow_mut() = loader;
    }

    pub fn set_host_promise_rejection_tracker(&self, tracker: Option<Rc<RejectionTrackerFn>>) {
        *self.0.state.rejection_tracker.borrow_mut() = tracker;
    }

    // ------------------------------------------------------------------
    // Jobs
    // ------------------------------------------------------------------

    #[inline]
    pub fn is_job_pending(&self) -> bool {
        unsafe { qjs::JS_IsJobPending(self.raw()) }
    }

    /// Run the oldest pending job
    pub fn execute_pending_job(&self) -> JobOutcome {
        self.0.state.drain_retired();
        let mut raw_ctx = ptr::null_mut();
        let status = unsafe { qjs::JS_ExecutePendingJob(self.raw(), &mut raw_ctx) };
        if cfg!(feature = "debug-gc") && status != 0 {
            unsafe { qjs::JS_RunGC(self.raw()) };
        }
        let ctx = if raw_ctx.is_null() {
            None
        } else {
            unsafe { EngineCtx::from_raw(raw_ctx) }
        };
        match status {
            0 => JobOutcome::Idle,
            s if s < 0 => {
                debug!("pending job threw");
                JobOutcome::Failed(ctx)
            }
            _ => {
                trace!("ran pending job");
                JobOutcome::Completed(ctx)
            }
        }
    }

    // ------------------------------------------------------------------
    // Memory
    // ------------------------------------------------------------------

    pub fn dup_value(&self, v: RawValue) -> RawValue {
        RawValue(unsafe { qjs::JS_DupValueRT(self.raw(), v.0) })
    }

    /// Release one reference
    pub fn free_value(&self, v: RawValue) {
        if v.has_ref_count() {
            unsafe { qjs::JS_FreeValueRT(self.raw(), v.0) };
        }
    }

    pub fn heap_stats(&self) -> HeapStats {
        let mut usage = MaybeUninit::<qjs::JSMemoryUsage>::zeroed();
        let usage = unsafe {
            qjs::JS_ComputeMemoryUsage(self.raw(), usage.as_mut_ptr());
            usage.assume_init()
        };
        let count = |n: i64| usize::try_from(n).unwrap_or(0);
        HeapStats {
            objects: count(usage.obj_count),
            strings: count(usage.str_count),
            atoms: count(usage.atom_count),
            functions: count(usage.js_func_count + usage.c_func_count),
            memory_used: count(usage.memory_used_size),
            malloc_size: count(usage.malloc_size),
        }
    }

    /// Collect unreachable reference cycles
    pub fn run_gc(&self) -> GcStats {
        let before = self.heap_stats().objects;
        unsafe { qjs::JS_RunGC(self.raw()) };
        self.0.state.drain_retired();
        let after = self.heap_stats().objects;
        let collected = before.saturating_sub(after);
        debug!("gc: collected {} objects, {} live", collected, after);
        GcStats { collected }
    }

    /// Free a context now, or once no finalizer is running
    pub(crate) fn release_context(&self, raw: *mut qjs::JSContext) {
        let state = &self.0.state;
        if state.finalizing.get() > 0 {
            state.retired.borrow_mut().push(raw);
        } else {
            state.drain_retired();
            unsafe { qjs::JS_FreeContext(raw) };
        }
    }

    pub(crate) fn drain_retired(&self) {
        self.0.state.drain_retired();
    }

    /// Record a context reference taken for a queued host job
    pub(crate) fn hold_job_context(&self, raw: *mut qjs::JSContext) {
        self.0.state.job_contexts.borrow_mut().push(raw);
    }
}

impl Default for Runtime {
    fn default() -> Self {
        Self::new()
    }
}

unsafe extern "C" fn track_rejection(
    ctx: *mut qjs::JSContext,
    promise: qjs::JSValue,
    reason: qjs::JSValue,
    is_handled: bool,
    _opaque: *mut std::ffi::c_void,
) {
    let Some(engine) = (unsafe { EngineCtx::from_raw(ctx) }) else {
        return;
    };
    let Some(tracker) = engine.runtime().state().rejection_tracker() else {
        return;
    };
    let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        tracker(&engine, RawValue(promise), RawValue(reason), is_handled)
    }));
    if outcome.is_err() {
        log::warn!("promise rejection tracker panicked");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_class_once() {
        let rt = Runtime::new();
        let id = ClassId::new_unique();
        assert!(!rt.is_registered_class(id));
        rt.new_class(id, ClassDef::new("Point")).unwrap();
        assert!(rt.is_registered_class(id));
        assert_eq!(
            rt.new_class(id, ClassDef::new("Point")),
            Err(ClassError::AlreadyDefined(id))
        );
        assert_eq!(
            rt.new_class(ClassId::ARRAY, ClassDef::new("Array")),
            Err(ClassError::Reserved(ClassId::ARRAY))
        );
        assert_eq!(rt.class_name(id).as_deref(), Some("Point"));
        assert_eq!(rt.class_name(ClassId::ARRAY).as_deref(), Some("Array"));
    }

    #[test]
    fn test_class_ids_are_shared_across_runtimes() {
        let id = ClassId::new_unique();
        let a = Runtime::new();
        let b = Runtime::new();
        a.new_class(id, ClassDef::new("Shared")).unwrap();
        assert!(!b.is_registered_class(id));
        b.new_class(id, ClassDef::new("Shared")).unwrap();
    }

    #[test]
    fn test_config_builder() {
        let config = RuntimeConfig::default()
            .gc_threshold(0)
            .max_stack_size(512 * 1024)
            .memory_limit(64 << 20);
        assert_eq!(config.gc_threshold, 0);
        assert_eq!(config.max_stack_size, 512 * 1024);
        assert_eq!(config.memory_limit, 64 << 20);
        if !cfg!(feature = "debug-gc") {
            assert_eq!(config.engine_gc_threshold(), usize::MAX);
        }
    }

    #[test]
    fn test_idle_job_queue() {
        let rt = Runtime::new();
        assert!(!rt.is_job_pending());
        assert!(matches!(rt.execute_pending_job(), JobOutcome::Idle));
    }

    #[test]
    fn test_heap_stats() {
        let rt = Runtime::new();
        let stats = rt.heap_stats();
        assert!(stats.memory_used > 0);
        assert!(stats.malloc_size >= stats.memory_used);
        assert_eq!(rt.run_gc().collected, 0);
    }
}
