//! Runtime
//!
//! Owns the engine runtime shared by a set of contexts: the heap, the job
//! queue and the class table. Creating a [`Runtime`] installs the hooks that
//! route module loading and unhandled promise rejections to the
//! [`Context`] they happen in.

use std::fmt;
use std::rc::Rc;

use log::{debug, warn};

use crate::context::Context;
use crate::engine::{self, EngineCtx, GcStats, HeapStats, JobOutcome, RawValue, RuntimeConfig};
use crate::error::{Error, Result};
use crate::value::Value;

pub struct Runtime {
    rt: engine::Runtime,
}

impl Runtime {
    pub fn new() -> Self {
        Self::with_config(RuntimeConfig::default())
    }

    pub fn with_config(config: RuntimeConfig) -> Self {
        let rt = engine::Runtime::with_config(config);
        rt.set_module_loader(Some(Rc::new(load_module)));
        rt.set_host_promise_rejection_tracker(Some(Rc::new(track_rejection)));
        debug!("runtime created ({:?})", config);
        Runtime { rt }
    }

    #[inline]
    pub fn engine(&self) -> &engine::Runtime {
        &self.rt
    }

    #[inline]
    pub fn is_job_pending(&self) -> bool {
        self.rt.is_job_pending()
    }

    /// Run the oldest pending job
    ///
    /// Returns the context the job ran in, `None` when the queue was empty,
    /// or the exception the job threw.
    pub fn execute_pending_job(&self) -> Result<Option<Context>> {
        match self.rt.execute_pending_job() {
            JobOutcome::Idle => Ok(None),
            JobOutcome::Completed(engine) => Ok(engine.as_ref().and_then(Context::get)),
            JobOutcome::Failed(Some(engine)) => Err(Error::exception(&engine)),
            JobOutcome::Failed(None) => Err(Error::Runtime(
                "pending job failed in a released context".to_string(),
            )),
        }
    }

    /// Drain the job queue; stops at the first job that throws
    pub fn run_pending_jobs(&self) -> Result<usize> {
        let mut count = 0;
        while self.rt.is_job_pending() {
            self.execute_pending_job()?;
            count += 1;
        }
        Ok(count)
    }

    /// Collect unreachable reference cycles
    pub fn run_gc(&self) -> GcStats {
        self.rt.run_gc()
    }

    pub fn heap_stats(&self) -> HeapStats {
        self.rt.heap_stats()
    }
}

impl Default for Runtime {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Runtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runtime")
            .field("config", &self.rt.config())
            .field("heap", &self.rt.heap_stats())
            .finish()
    }
}

fn load_module(engine: &EngineCtx, name: &str) -> Option<engine::ModuleId> {
    match Context::get(engine) {
        Some(ctx) => ctx.load_module(name),
        None => {
            debug!("no binding context to load module '{}'", name);
            None
        }
    }
}

fn track_rejection(engine: &EngineCtx, _promise: RawValue, reason: RawValue, is_handled: bool) {
    if is_handled {
        return;
    }
    let reason = Value::from_borrowed(engine, reason);
    match Context::get(engine).and_then(|ctx| ctx.rejection_handler()) {
        Some(handler) => handler(reason),
        None => {
            let message = reason
                .get::<String>()
                .unwrap_or_else(|_| "<unprintable>".to_string());
            warn!("unhandled promise rejection: {}", message);
        }
    }
}
