//! End-to-end embedding scenarios driven purely through the public API.

use std::rc::Rc;

use moonbind_bridge::{
    runtime, BridgeError, CallOutcome, GcRequest, HostCallable, HostError, HostFrame, Library,
    ResultCount, Session, ThreadStatus,
};
use moonbind_engine::{call as engine_call, Value, MULTI};

fn session() -> Session {
    let _ = env_logger::builder().is_test(true).try_init();
    // Tests share the process-wide runtime; none of them shut it down.
    let _ = runtime::init();
    Session::create().unwrap()
}

fn load_str(session: &mut Session, source: &str, name: &str) {
    session.load(&mut source.as_bytes(), name, "t").unwrap();
}

struct Adder;

impl HostCallable for Adder {
    fn name(&self) -> &str {
        "add"
    }

    fn call(&self, frame: &mut HostFrame<'_>) -> Result<CallOutcome, HostError> {
        let a = frame
            .to_integer(-2)
            .ok_or_else(|| frame.arg_error(1, "add", "integer expected"))?;
        let b = frame
            .to_integer(-1)
            .ok_or_else(|| frame.arg_error(2, "add", "integer expected"))?;
        frame.push_integer(a + b)?;
        Ok(CallOutcome::Return(1))
    }
}

#[test]
fn load_and_invoke_computes() {
    let mut s = session();
    load_str(&mut s, "return 1 + 1", "sum");
    assert_eq!(s.invoke(0, ResultCount::Exact(1)).unwrap(), 1);
    assert_eq!(s.to_integer(-1).unwrap(), Some(2));
}

#[test]
fn host_callable_invoked_from_guest_code() {
    let mut s = session();
    s.push_callable(Rc::new(Adder)).unwrap();
    s.set_global("add").unwrap();
    load_str(&mut s, "return add(19, 23)", "calc");
    assert_eq!(s.invoke(0, ResultCount::Exact(1)).unwrap(), 1);
    assert_eq!(s.to_integer(-1).unwrap(), Some(42));
}

#[test]
fn host_callables_reenter_guest_code() {
    // Guest calls `run`, which re-enters the interpreter to call the
    // guest function it was handed, which in turn calls back into `add`.
    struct Run;
    impl HostCallable for Run {
        fn name(&self) -> &str {
            "run"
        }
        fn call(&self, frame: &mut HostFrame<'_>) -> Result<CallOutcome, HostError> {
            let n = frame.invoke(0, ResultCount::Exact(1))?;
            Ok(CallOutcome::Return(n))
        }
    }

    let mut s = session();
    s.push_callable(Rc::new(Adder)).unwrap();
    s.set_global("add").unwrap();
    s.push_callable(Rc::new(Run)).unwrap();
    s.set_global("run").unwrap();
    load_str(&mut s, "return add(20, 22)", "task");
    s.set_global("task").unwrap();

    load_str(&mut s, "return run(task) + 1", "outer");
    assert_eq!(s.invoke(0, ResultCount::Exact(1)).unwrap(), 1);
    assert_eq!(s.to_integer(-1).unwrap(), Some(43));
}

#[test]
fn argument_complaints_cross_the_boundary_as_argument_errors() {
    let mut s = session();
    s.push_callable(Rc::new(Adder)).unwrap();
    s.set_global("add").unwrap();
    load_str(&mut s, "return add('x', 1)", "calc");
    match s.invoke(0, ResultCount::All).unwrap_err() {
        BridgeError::Argument(message) => {
            assert!(message.contains("bad argument #1 to 'add'"), "{}", message);
        }
        other => panic!("expected argument error, got {:?}", other),
    }
}

#[test]
fn host_errors_chain_their_cause_through_the_guest() {
    struct Failing;
    impl HostCallable for Failing {
        fn name(&self) -> &str {
            "explode"
        }
        fn call(&self, _frame: &mut HostFrame<'_>) -> Result<CallOutcome, HostError> {
            Err("disk on fire".into())
        }
    }

    let mut s = session();
    s.push_callable(Rc::new(Failing)).unwrap();
    s.set_global("explode").unwrap();
    load_str(&mut s, "return explode()", "boom");
    match s.invoke(0, ResultCount::All).unwrap_err() {
        BridgeError::Runtime { message, cause, .. } => {
            assert!(message.contains("error invoking 'explode'"), "{}", message);
            assert_eq!(cause.unwrap().to_string(), "disk on fire");
        }
        other => panic!("expected chained runtime error, got {:?}", other),
    }
}

#[test]
fn guest_errors_carry_a_trace() {
    let mut s = session();
    s.open_library(Library::Base).unwrap();
    load_str(&mut s, "local x = 1\nerror('boom')", "script");
    match s.invoke(0, ResultCount::All).unwrap_err() {
        BridgeError::Runtime { message, trace, .. } => {
            assert!(message.contains("boom"), "{}", message);
            assert!(!trace.is_empty());
            // The innermost guest frame comes first.
            assert_eq!(trace[0].source.as_deref(), Some("script"));
        }
        other => panic!("expected runtime error, got {:?}", other),
    }
}

#[test]
fn embedded_objects_round_trip_and_release_on_collection() {
    let mut s = session();
    let live_before = s.live_handles();
    s.push_object(Rc::new(String::from("payload"))).unwrap();
    assert_eq!(s.live_handles(), live_before + 1);

    let back = s.as_callable(-1);
    assert!(back.is_none());
    let object = s.as_object(-1).unwrap();
    assert_eq!(object.downcast_ref::<String>().unwrap(), "payload");
    drop(object);

    let released_before = s.released_handles();
    s.pop(1).unwrap();
    s.gc(GcRequest::Collect).unwrap();
    assert_eq!(s.released_handles(), released_before + 1);
    assert_eq!(s.live_handles(), live_before);
}

#[test]
fn collection_cycles_are_counted() {
    let mut s = session();
    let before = s.gc(GcRequest::CycleCount).unwrap();
    s.gc(GcRequest::Collect).unwrap();
    assert_eq!(s.gc(GcRequest::CycleCount).unwrap(), before + 1);
}

#[test]
fn coroutine_transfers_values_both_ways() {
    let mut s = session();
    s.open_library(Library::Coroutine).unwrap();
    load_str(&mut s, "yield(1, 2)\nreturn 3", "co");
    let id = s.new_thread().unwrap();
    s.pop(1).unwrap();
    assert_eq!(s.thread_status(id).unwrap(), ThreadStatus::NotStarted);

    let yielded = s.resume(id, 0).unwrap();
    assert_eq!(yielded, 2);
    assert_eq!(s.to_integer(-2).unwrap(), Some(1));
    assert_eq!(s.to_integer(-1).unwrap(), Some(2));
    s.pop(2).unwrap();
    assert_eq!(s.thread_status(id).unwrap(), ThreadStatus::Suspended);

    s.push_integer(99).unwrap();
    let returned = s.resume(id, 1).unwrap();
    assert_eq!(returned, 1);
    assert_eq!(s.to_integer(-1).unwrap(), Some(3));
    assert_eq!(s.thread_status(id).unwrap(), ThreadStatus::Dead);
}

#[test]
fn resuming_a_dead_thread_is_an_error() {
    let mut s = session();
    load_str(&mut s, "return 1", "t");
    let id = s.new_thread().unwrap();
    s.pop(1).unwrap();
    s.resume(id, 0).unwrap();
    s.pop(1).unwrap();
    assert!(s.resume(id, 0).is_err());
    assert!(matches!(
        s.thread_status(999),
        Err(BridgeError::Argument(_))
    ));
}

#[test]
fn dumped_chunks_reload_with_identical_behavior() {
    let mut s = session();
    load_str(&mut s, "return 10 + 32", "calc");
    let mut image = Vec::new();
    s.dump(&mut image).unwrap();

    s.invoke(0, ResultCount::Exact(1)).unwrap();
    assert_eq!(s.to_integer(-1).unwrap(), Some(42));
    s.pop(1).unwrap();

    s.load(&mut image.as_slice(), "calc", "b").unwrap();
    s.invoke(0, ResultCount::Exact(1)).unwrap();
    assert_eq!(s.to_integer(-1).unwrap(), Some(42));
}

#[test]
fn load_mode_gates_chunk_format() {
    let mut s = session();
    let err = s.load(&mut "return 1".as_bytes(), "t", "b").unwrap_err();
    assert!(matches!(err, BridgeError::Syntax(_)));

    load_str(&mut s, "return 1", "t");
    let mut image = Vec::new();
    s.dump(&mut image).unwrap();
    s.pop(1).unwrap();
    let err = s.load(&mut image.as_slice(), "t", "t").unwrap_err();
    assert!(matches!(err, BridgeError::Syntax(_)));
}

#[test]
fn stream_failures_surface_as_io_errors() {
    struct Broken;
    impl std::io::Read for Broken {
        fn read(&mut self, _buf: &mut [u8]) -> std::io::Result<usize> {
            Err(std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe"))
        }
    }

    let mut s = session();
    match s.load(&mut Broken, "t", "bt").unwrap_err() {
        BridgeError::Io { source, .. } => {
            assert_eq!(source.kind(), std::io::ErrorKind::BrokenPipe);
        }
        other => panic!("expected io error, got {:?}", other),
    }
}

#[test]
fn wrapper_calls_fail_cleanly_after_detach() {
    let mut s = session();
    s.push_callable(Rc::new(Adder)).unwrap();
    s.set_global("add").unwrap();
    load_str(&mut s, "return add(1, 2)", "t");

    let mut state = s.close(false).unwrap().unwrap();
    drop(s);

    // The state is alive but the session's boundary is gone.
    let fault = engine_call(&mut state, 0, MULTI).unwrap_err();
    assert!(fault.message.contains("host runtime unreachable"), "{}", fault.message);
    state.close();
}

#[test]
fn detached_state_finalizers_tolerate_a_dropped_session() {
    let mut s = session();
    s.push_object(Rc::new(7_i64)).unwrap();
    let state = s.close(false).unwrap().unwrap();
    drop(s);
    // Force-finalizing the embedded cell finds its registry gone; that
    // must be a no-op, not a failure.
    state.close();
}

#[test]
fn dropping_an_open_session_destroys_its_state() {
    let mut s = session();
    s.push_object(Rc::new(String::from("held"))).unwrap();
    s.push_callable(Rc::new(Adder)).unwrap();
    drop(s);
}

#[test]
fn direct_pushes_are_readable_back() {
    let mut s = session();
    s.push_nil().unwrap();
    s.push_bool(true).unwrap();
    s.push_number(1.5).unwrap();
    s.push_str("hello").unwrap();
    assert_eq!(s.top().unwrap(), 4);
    assert_eq!(s.to_str(-1).unwrap().as_deref(), Some("hello"));
    assert_eq!(s.to_number(-2).unwrap(), Some(1.5));
    assert_eq!(s.to_bool(-3).unwrap(), Some(true));
    assert_eq!(s.to_bool(1).unwrap(), Some(false));

    // Detached engine states still expose the same values.
    let mut state = s.close(false).unwrap().unwrap();
    assert!(matches!(state.pop().unwrap(), Value::Str(_)));
    state.close();
}
