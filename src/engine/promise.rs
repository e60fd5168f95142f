//! Promises
//!
//! Inspection of engine promises and creation of promises the host settles
//! through their resolving functions.

use rquickjs_sys as qjs;

use super::context::{EngineCtx, Thrown};
use super::value::RawValue;

/// State of a promise
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromiseState {
    Pending,
    Fulfilled,
    Rejected,
}

/// A new promise with its resolving functions, all owned by the holder
#[derive(Debug)]
pub struct PromiseCapability {
    pub promise: RawValue,
    pub resolve: RawValue,
    pub reject: RawValue,
}

impl EngineCtx {
    /// State of `v`, or `None` if it is not a promise
    pub fn promise_state(&self, v: RawValue) -> Option<PromiseState> {
        if !unsafe { qjs::JS_IsPromise(v.0) } {
            return None;
        }
        let state = match unsafe { qjs::JS_PromiseState(self.raw(), v.0) } {
            qjs::JSPromiseStateEnum_JS_PROMISE_PENDING => PromiseState::Pending,
            qjs::JSPromiseStateEnum_JS_PROMISE_FULFILLED => PromiseState::Fulfilled,
            _ => PromiseState::Rejected,
        };
        Some(state)
    }

    /// Fulfillment value or rejection reason; `undefined` while pending
    pub fn promise_result(&self, v: RawValue) -> RawValue {
        RawValue(unsafe { qjs::JS_PromiseResult(self.raw(), v.0) })
    }

    /// `promise.then(on_fulfilled, on_rejected)`
    pub fn promise_then(&self, promise: RawValue, on_fulfilled: RawValue, on_rejected: RawValue) -> RawValue {
        self.invoke(promise, "then", &[on_fulfilled, on_rejected])
    }

    pub fn new_promise(&self) -> Result<PromiseCapability, Thrown> {
        let mut funcs = [qjs::JS_UNDEFINED; 2];
        let promise = RawValue(unsafe { qjs::JS_NewPromiseCapability(self.raw(), funcs.as_mut_ptr()) });
        if promise.is_exception() {
            return Err(Thrown);
        }
        Ok(PromiseCapability {
            promise,
            resolve: RawValue(funcs[0]),
            reject: RawValue(funcs[1]),
        })
    }

    /// Release a capability's three values
    pub fn free_capability(&self, cap: PromiseCapability) {
        self.free_value(cap.promise);
        self.free_value(cap.resolve);
        self.free_value(cap.reject);
    }
}
