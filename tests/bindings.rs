//! End-to-end behaviour of the binding layer

use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::io::Write;
use std::rc::Rc;
use std::sync::Arc;

use qjs::engine::RawValue;
use qjs::{Context, Error, EvalFlags, Inherits, PromiseState, Rest, Runtime, Value};

fn setup() -> (Runtime, Context) {
    let _ = env_logger::builder().is_test(true).try_init();
    let rt = Runtime::new();
    let ctx = Context::new(&rt).unwrap();
    (rt, ctx)
}

fn message(err: Error) -> String {
    match err {
        Error::Exception(exc) => exc.value().get::<String>().unwrap(),
        other => other.to_string(),
    }
}

#[test]
fn test_value_copies_keep_refcount() {
    let (_rt, ctx) = setup();
    let obj = ctx.new_object();
    let before = obj.ref_count();
    let copies: Vec<Value> = (0..8).map(|_| obj.clone()).collect();
    assert_eq!(obj.ref_count(), before.map(|n| n + 8));

    // Drop from both ends toward the middle
    let mut copies: std::collections::VecDeque<_> = copies.into();
    while !copies.is_empty() {
        drop(copies.pop_back());
        drop(copies.pop_front());
    }
    assert_eq!(obj.ref_count(), before);
}

// ----------------------------------------------------------------------
// Class lattice
// ----------------------------------------------------------------------

struct Vehicle {
    wheels: u32,
}

struct Car {
    vehicle: Arc<Vehicle>,
    seats: u32,
}

struct RaceCar {
    car: Arc<Car>,
    team: String,
}

#[derive(Debug)]
struct Bicycle;

impl Inherits<Vehicle> for Car {
    fn upcast(this: Arc<Self>) -> Arc<Vehicle> {
        this.vehicle.clone()
    }
}

impl Inherits<Car> for RaceCar {
    fn upcast(this: Arc<Self>) -> Arc<Car> {
        this.car.clone()
    }
}

fn car(seats: u32) -> Car {
    Car {
        vehicle: Arc::new(Vehicle { wheels: 4 }),
        seats,
    }
}

#[test]
fn test_class_lattice() {
    let (_rt, ctx) = setup();
    let garage = ctx.add_module("garage").unwrap();
    garage
        .register_class::<Vehicle>("Vehicle")
        .constructor(|wheels: u32| Vehicle { wheels })
        .unwrap()
        .property("wheels", |v: &Vehicle| v.wheels)
        .unwrap()
        .finish()
        .unwrap();
    garage
        .register_class::<Car>("Car")
        .base::<Vehicle>()
        .unwrap()
        .constructor(car)
        .unwrap()
        .method("seats", |c: &Car| c.seats)
        .unwrap()
        .finish()
        .unwrap();
    garage
        .register_class::<RaceCar>("RaceCar")
        .base::<Car>()
        .unwrap()
        .constructor(|team: String| RaceCar {
            car: Arc::new(car(1)),
            team,
        })
        .unwrap()
        .property("team", |r: &RaceCar| r.team.clone())
        .unwrap()
        .static_member("topSpeed", 340)
        .unwrap()
        .finish()
        .unwrap();
    garage
        .register_class::<Bicycle>("Bicycle")
        .constructor(|| Bicycle)
        .unwrap()
        .finish()
        .unwrap();

    let ns = ctx.import("garage").unwrap();
    let race_car_ctor = ns.get_prop::<Value, _>("RaceCar").unwrap();
    assert_eq!(race_car_ctor.get_prop::<i32, _>("topSpeed").unwrap(), 340);
    let racer = race_car_ctor.construct(("Falcon",)).unwrap();

    assert_eq!(racer.get::<Arc<RaceCar>>().unwrap().team, "Falcon");
    assert_eq!(racer.get::<Arc<Car>>().unwrap().seats, 1);
    assert_eq!(racer.get::<Arc<Vehicle>>().unwrap().wheels, 4);

    // Members are inherited through the prototype chain
    assert_eq!(racer.get_prop::<String, _>("team").unwrap(), "Falcon");
    assert_eq!(racer.invoke("seats", ()).unwrap().get::<u32>().unwrap(), 1);
    assert_eq!(racer.get_prop::<u32, _>("wheels").unwrap(), 4);

    let err = racer.get::<Arc<Bicycle>>().unwrap_err();
    let text = message(err);
    assert!(
        text.starts_with("TypeError: Expected type Bicycle, got object of class RaceCar"),
        "{}",
        text
    );

    // Constructors refuse plain calls
    assert!(race_car_ctor.call(("Falcon",)).is_err());
}

#[test]
fn test_instances_release_native_objects() {
    struct Tracked(Rc<Cell<u32>>);
    impl Drop for Tracked {
        fn drop(&mut self) {
            self.0.set(self.0.get() + 1);
        }
    }

    let (rt, ctx) = setup();
    let dropped = Rc::new(Cell::new(0));
    let counter = dropped.clone();
    let registrar = ctx
        .class_registrar::<Tracked>("Tracked")
        .constructor(move || Tracked(counter.clone()))
        .unwrap();
    let ctor: Value = registrar.prototype().get_prop("constructor").unwrap();
    registrar.finish().unwrap();

    let instance = ctor.construct(()).unwrap();
    drop(instance);
    assert_eq!(dropped.get(), 1);

    // A cycle through the instance is left to the collector
    let instance = ctor.construct(()).unwrap();
    let holder = ctx.new_object();
    holder.set_prop("instance", &instance).unwrap();
    instance.set_prop("holder", &holder).unwrap();
    drop(instance);
    drop(holder);
    assert_eq!(dropped.get(), 1);
    rt.run_gc();
    assert_eq!(dropped.get(), 2);
}

// ----------------------------------------------------------------------
// Function adaptation
// ----------------------------------------------------------------------

#[test]
fn test_arity_and_rest() {
    let (_rt, ctx) = setup();
    let collect = ctx
        .new_function("collect", |prefix: String, rest: Rest<String>| {
            rest.into_inner()
                .into_iter()
                .map(|s| format!("{}{}", prefix, s))
                .collect::<Vec<_>>()
        })
        .unwrap();

    let err = collect.call(()).unwrap_err();
    assert_eq!(
        message(err),
        "TypeError: Expected at least 1 arguments but received 0"
    );
    assert!(collect.call(("-",)).unwrap().get::<Vec<String>>().unwrap().is_empty());
    assert_eq!(
        collect.call(("-", "a")).unwrap().get::<Vec<String>>().unwrap(),
        ["-a"]
    );
    assert_eq!(
        collect
            .call(("-", "a", "b", "c"))
            .unwrap()
            .get::<Vec<String>>()
            .unwrap(),
        ["-a", "-b", "-c"]
    );
}

#[test]
fn test_native_errors_reach_native_callers() {
    let (_rt, ctx) = setup();
    let parse = ctx
        .new_function("parse", |text: String| text.parse::<i32>().map_err(|e| e.to_string()))
        .unwrap();
    assert_eq!(parse.call(("12",)).unwrap().get::<i32>().unwrap(), 12);
    assert_eq!(
        message(parse.call(("twelve",)).unwrap_err()),
        "InternalError: invalid digit found in string"
    );
}

// ----------------------------------------------------------------------
// Modules
// ----------------------------------------------------------------------

#[test]
fn test_module_exports() {
    let (_rt, ctx) = setup();
    let partial = ctx.add_module("partial").unwrap();
    partial.add("a", 1).unwrap().declare("b").unwrap();
    let err = ctx.import("partial").unwrap_err();
    assert!(message(err).starts_with("ReferenceError"));

    let complete = ctx.add_module("complete").unwrap();
    complete.declare("a").unwrap().declare("b").unwrap();
    complete.add("a", 1).unwrap();
    complete.add("b", vec!["x", "y"]).unwrap();
    let ns = ctx.import("complete").unwrap();
    assert_eq!(ns.get_prop::<i32, _>("a").unwrap(), 1);
    assert_eq!(ns.get_prop::<Vec<String>, _>("b").unwrap(), ["x", "y"]);
}

#[test]
fn test_dynamic_import() {
    let (rt, ctx) = setup();
    let module = ctx.add_module("lazy").unwrap();
    module.add("answer", 42).unwrap();

    let promise = ctx.dynamic_import("lazy").unwrap();
    rt.run_pending_jobs().unwrap();
    assert_eq!(promise.promise_state(), Some(PromiseState::Fulfilled));
    let answer = Rc::new(Cell::new(0));
    let sink = answer.clone();
    promise
        .invoke_then(move |ns: Value| sink.set(ns.get_prop::<i32, _>("answer").unwrap()), ())
        .unwrap();
    assert_eq!(answer.get(), 42);
}

#[test]
fn test_file_modules() {
    let (_rt, ctx) = setup();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("limits.js");
    let mut file = std::fs::File::create(&path).unwrap();
    write!(file, "export default {{max: 10, min: -10}};").unwrap();
    drop(file);
    let script = dir.path().join("limits.txt");
    std::fs::write(&script, "({max: 10, min: -10})").unwrap();

    let name = path.to_string_lossy().into_owned();
    let ns = ctx.import(&name).unwrap();
    let limits: BTreeMap<String, i32> = ns.get_prop("default").unwrap();
    assert_eq!(limits["max"], 10);
    assert_eq!(limits["min"], -10);

    let engine = ctx.engine();
    let m = engine.find_module(&name).unwrap();
    let meta = Value::from_raw(engine, engine.get_import_meta(m));
    let url = meta.get_prop::<String, _>("url").unwrap();
    assert!(url.starts_with("file://"));
    assert!(url.ends_with("/limits.js"));

    let value = ctx.eval_file(&script, EvalFlags::TYPE_GLOBAL).unwrap();
    assert_eq!(value.get_prop::<i32, _>("max").unwrap(), 10);

    let missing = dir.path().join("missing.js");
    let err = ctx.import(&missing.to_string_lossy()).unwrap_err();
    assert!(message(err).starts_with("ReferenceError: Could not load module filename"));
}

#[test]
fn test_module_eval_errors_are_thrown() {
    let (rt, ctx) = setup();
    let done = ctx
        .eval("export const ok = true;", "ok.js", EvalFlags::TYPE_MODULE)
        .unwrap();
    rt.run_pending_jobs().unwrap();
    assert_eq!(done.promise_state(), Some(PromiseState::Fulfilled));

    let err = ctx
        .eval("{broken", "broken.js", EvalFlags::TYPE_MODULE)
        .unwrap_err();
    assert!(message(err).starts_with("SyntaxError"));

    let err = ctx
        .eval("throw new RangeError('bad module');", "throws.js", EvalFlags::TYPE_MODULE)
        .unwrap_err();
    assert_eq!(message(err), "RangeError: bad module");
}

// ----------------------------------------------------------------------
// Promises and jobs
// ----------------------------------------------------------------------

#[test]
fn test_promise_bridge_pending() {
    let (rt, ctx) = setup();
    let engine = ctx.engine();
    let cap = engine.new_promise().unwrap();
    let promise = Value::from_borrowed(engine, cap.promise);
    let results = Rc::new(RefCell::new(Vec::new()));
    let sink = results.clone();
    promise
        .invoke_then(move |n: i32| sink.borrow_mut().push(n), ())
        .unwrap();
    assert!(results.borrow().is_empty());

    for n in [1, 2] {
        let settle = engine.call(cap.resolve, RawValue::UNDEFINED, &[RawValue::from_i32(n)]);
        engine.free_value(settle);
    }
    engine.free_capability(cap);
    assert!(results.borrow().is_empty());
    rt.run_pending_jobs().unwrap();
    assert_eq!(*results.borrow(), [1]);
}

#[test]
fn test_promise_bridge_async_function() {
    let (rt, ctx) = setup();
    let fetch = ctx
        .eval(
            "(async function fetch(n) { await null; return n * 10; })",
            "<test>",
            EvalFlags::TYPE_GLOBAL,
        )
        .unwrap();
    let seen = Rc::new(Cell::new(0.0));
    let sink = seen.clone();
    fetch.invoke_then(move |x: f64| sink.set(x), (4.5,)).unwrap();
    rt.run_pending_jobs().unwrap();
    assert_eq!(seen.get(), 45.0);

    let plain = ctx.new_function("plain", |x: f64| x + 1.0).unwrap();
    let sink = seen.clone();
    plain.invoke_then(move |x: f64| sink.set(x), (1.0,)).unwrap();
    assert_eq!(seen.get(), 2.0);

    let err = ctx.new_object().invoke_then(|_: Value| {}, ()).unwrap_err();
    assert_eq!(
        err.to_string(),
        "Value is either non-invocable or a rejected promise"
    );
}

#[test]
fn test_unhandled_rejection() {
    let (rt, ctx) = setup();
    let reasons = Rc::new(RefCell::new(Vec::new()));
    let sink = reasons.clone();
    ctx.on_unhandled_rejection(move |reason| {
        sink.borrow_mut().push(reason.get::<String>().unwrap());
    });

    // Nothing ever handles a failed dynamic import
    let failed = ctx.dynamic_import("nowhere").unwrap();
    rt.run_pending_jobs().unwrap();
    assert_eq!(failed.promise_state(), Some(PromiseState::Rejected));
    assert_eq!(reasons.borrow().len(), 1);
    assert!(reasons.borrow()[0].starts_with("ReferenceError"));

    // A handler attached before rejection suppresses the report
    let engine = ctx.engine();
    let cap = engine.new_promise().unwrap();
    let recovered = Rc::new(Cell::new(false));
    let flag = recovered.clone();
    let on_rejected = ctx
        .new_function("recover", move |_reason: Value| flag.set(true))
        .unwrap();
    let derived = Value::from_raw(
        engine,
        engine.promise_then(cap.promise, RawValue::UNDEFINED, on_rejected.raw()),
    );
    let reason = ctx.new_value("late").unwrap();
    engine.free_value(engine.call(cap.reject, RawValue::UNDEFINED, &[reason.raw()]));
    engine.free_capability(cap);
    rt.run_pending_jobs().unwrap();
    assert!(recovered.get());
    assert_eq!(derived.promise_state(), Some(PromiseState::Fulfilled));
    assert_eq!(reasons.borrow().len(), 1);
}

#[test]
fn test_enqueued_jobs_run_in_order() {
    let (rt, ctx) = setup();
    let order = Rc::new(RefCell::new(Vec::new()));
    for i in 0..3 {
        let order = order.clone();
        ctx.enqueue_job(move || order.borrow_mut().push(i)).unwrap();
    }
    assert!(order.borrow().is_empty());
    assert_eq!(rt.run_pending_jobs().unwrap(), 3);
    assert_eq!(*order.borrow(), [0, 1, 2]);
}
