//! Call marshalling: the trampoline that lets guest code invoke host
//! callables.
//!
//! A wrapper is an engine native function tagged `NativeKind::HostBridge`
//! whose sole upvalue is a foreign cell holding the handle to the host
//! callable. The callable itself is resolved through the handle registry on
//! every invocation, so clearing the handle externally is observable.

use std::cell::RefCell;
use std::rc::Rc;

use moonbind_engine::{
    EResult, Fault, Function, NativeFunction, NativeKind, NativeOutcome, State, Value,
};

use crate::error::{ArgComplaint, BoundaryLost, HostCause, NotBridgeCallable};
use crate::guard;
use crate::handles::{self, HandleTable, HostRef, Strength};
use crate::host::{CallOutcome, HostCallable, HostFrame};

/// Builds a wrapper value for `callable` and leaves it on the stack.
pub(crate) fn push_callable_wrapper(
    state: &mut State,
    handles: &Rc<RefCell<HandleTable>>,
    callable: Rc<dyn HostCallable>,
) -> EResult<()> {
    let name: Rc<str> = Rc::from(callable.name());
    handles::embed(state, handles, HostRef::Callable(callable), Strength::Ordinary)?;
    let upvalue = state.pop()?;
    let wrapper = NativeFunction {
        kind: NativeKind::HostBridge,
        name,
        upvalue,
        func: Box::new(trampoline),
    };
    state.push(Value::Function(Function::Native(Rc::new(wrapper))))
}

/// True when the value is one of the bridge's callable wrappers.
pub(crate) fn is_wrapper(value: &Value) -> bool {
    matches!(
        value,
        Value::Function(Function::Native(nf)) if nf.kind == NativeKind::HostBridge
    )
}

/// Recovers the host callable behind a wrapper value, if the wrapper's
/// handle still resolves to one.
pub(crate) fn unwrap_callable(
    state: &State,
    handles: &Rc<RefCell<HandleTable>>,
    value: &Value,
) -> Option<Rc<dyn HostCallable>> {
    let nf = match value {
        Value::Function(Function::Native(nf)) if nf.kind == NativeKind::HostBridge => nf,
        _ => return None,
    };
    match handles::unwrap_value(state, handles, &nf.upvalue)? {
        HostRef::Callable(c) => Some(c),
        HostRef::Object(_) => None,
    }
}

/// The single native entry the engine invokes for every wrapper.
fn trampoline(state: &mut State, upvalue: &Value, nargs: usize) -> EResult<NativeOutcome> {
    let ctx = match guard::current_context(state) {
        Some(ctx) => ctx,
        None => {
            return Err(Fault::runtime("host runtime unreachable from guest call")
                .with_payload(Box::new(BoundaryLost)))
        }
    };
    let handles = match ctx.handles.upgrade() {
        Some(h) => h,
        None => {
            return Err(Fault::runtime("host session released during guest call")
                .with_payload(Box::new(BoundaryLost)))
        }
    };
    let handle = match handles::handle_of(state, upvalue) {
        Some(h) => h,
        None => {
            return Err(Fault::runtime("callable wrapper carries no bridge handle")
                .with_payload(Box::new(NotBridgeCallable)))
        }
    };
    let callable = match handles.borrow().resolve(handle) {
        Some(HostRef::Callable(c)) => c,
        Some(HostRef::Object(_)) => {
            return Err(Fault::runtime("wrapper handle does not reference a callable")
                .with_payload(Box::new(NotBridgeCallable)))
        }
        None => {
            return Err(Fault::runtime("host callable has been released")
                .with_payload(Box::new(BoundaryLost)))
        }
    };

    log::trace!("invoking host callable '{}' with {} args", callable.name(), nargs);
    let mut frame = HostFrame::new(state, handles, nargs);
    let outcome = callable.call(&mut frame);

    match outcome {
        Ok(CallOutcome::Return(n)) => {
            check_result_count(state, n)?;
            Ok(NativeOutcome::Return(n))
        }
        Ok(CallOutcome::Yield(n)) => {
            check_result_count(state, n)?;
            Ok(NativeOutcome::Yield(n))
        }
        Err(host_err) => Err(render_host_failure(state, callable.name(), host_err)),
    }
}

/// The reported count must refer to values actually on the stack.
fn check_result_count(state: &State, n: usize) -> EResult<()> {
    if n > state.top() {
        return Err(Fault::runtime("host callable reported more results than it pushed"));
    }
    Ok(())
}

/// Renders a failed host invocation as a guest error at the current call
/// site, chaining the host error as the fault payload.
fn render_host_failure(state: &State, name: &str, err: crate::error::HostError) -> Fault {
    let prefix = state.where_prefix();
    match err.downcast::<ArgComplaint>() {
        Ok(complaint) => {
            let message = format!("{}{}", prefix, complaint);
            Fault::runtime(message).with_payload(complaint)
        }
        Err(err) => {
            let message = format!("{}error invoking '{}': {}", prefix, name, err);
            Fault::runtime(message).with_payload(Box::new(HostCause(err)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{BridgeError, ErrorRecord};
    use crate::guard::with_guard;
    use moonbind_engine::{call as vm_call, MULTI};

    struct Adder;
    impl HostCallable for Adder {
        fn name(&self) -> &str {
            "adder"
        }
        fn call(&self, frame: &mut HostFrame<'_>) -> Result<CallOutcome, crate::error::HostError> {
            let a = frame
                .to_integer(-2)
                .ok_or_else(|| frame.arg_error(1, "adder", "integer expected"))?;
            let b = frame
                .to_integer(-1)
                .ok_or_else(|| frame.arg_error(2, "adder", "integer expected"))?;
            frame.push_integer(a + b)?;
            Ok(CallOutcome::Return(1))
        }
    }

    fn table() -> Rc<RefCell<HandleTable>> {
        Rc::new(RefCell::new(HandleTable::new()))
    }

    #[test]
    fn wrapper_calls_through_to_the_host() {
        let mut state = State::new();
        let handles = table();
        let n = with_guard(&mut state, &handles, |st| {
            push_callable_wrapper(st, &handles, Rc::new(Adder))?;
            st.push(Value::Integer(19))?;
            st.push(Value::Integer(23))?;
            vm_call(st, 2, MULTI)
        })
        .unwrap();
        assert_eq!(n, 1);
        assert!(matches!(state.pop().unwrap(), Value::Integer(42)));
    }

    #[test]
    fn wrapper_identity_is_the_explicit_tag() {
        let mut state = State::new();
        let handles = table();
        with_guard(&mut state, &handles, |st| {
            push_callable_wrapper(st, &handles, Rc::new(Adder))
        })
        .unwrap();
        let wrapper = state.value(-1).cloned().unwrap();
        assert!(is_wrapper(&wrapper));
        let callable = unwrap_callable(&state, &handles, &wrapper).unwrap();
        assert_eq!(callable.name(), "adder");
        // A plain engine value is not a wrapper.
        assert!(!is_wrapper(&Value::Integer(3)));
    }

    #[test]
    fn invocation_without_context_is_boundary_unavailable() {
        let mut state = State::new();
        let handles = table();
        with_guard(&mut state, &handles, |st| {
            push_callable_wrapper(st, &handles, Rc::new(Adder))
        })
        .unwrap();
        state.push(Value::Integer(1)).unwrap();
        state.push(Value::Integer(2)).unwrap();
        // No guard region is open, so the trampoline has no context.
        let fault = vm_call(&mut state, 2, MULTI).unwrap_err();
        let err = ErrorRecord::from_fault(fault).translate();
        assert!(matches!(err, BridgeError::BoundaryUnavailable(_)));
    }

    #[test]
    fn released_callable_is_a_boundary_error() {
        let mut state = State::new();
        let handles = table();
        with_guard(&mut state, &handles, |st| {
            push_callable_wrapper(st, &handles, Rc::new(Adder))
        })
        .unwrap();
        // Clear every handle out from under the wrapper.
        *handles.borrow_mut() = HandleTable::new();
        let err = with_guard(&mut state, &handles, |st| {
            st.push(Value::Integer(1))?;
            st.push(Value::Integer(2))?;
            vm_call(st, 2, MULTI)
        })
        .unwrap_err();
        assert!(matches!(err, BridgeError::BoundaryUnavailable(_)));
    }

    #[test]
    fn non_callable_resolution_is_a_state_error() {
        // A wrapper whose handle resolves to a plain object.
        let mut state = State::new();
        let handles = table();
        let err = with_guard(&mut state, &handles, |st| {
            handles::embed(st, &handles, HostRef::Object(Rc::new(5_i64)), Strength::Ordinary)?;
            let upvalue = st.pop()?;
            let wrapper = NativeFunction {
                kind: NativeKind::HostBridge,
                name: Rc::from("impostor"),
                upvalue,
                func: Box::new(trampoline),
            };
            st.push(Value::Function(Function::Native(Rc::new(wrapper))))?;
            vm_call(st, 0, MULTI)
        })
        .unwrap_err();
        assert!(matches!(err, BridgeError::State(_)));
    }

    #[test]
    fn non_handle_upvalue_is_a_state_error() {
        // A tagged wrapper whose upvalue never was a bridge handle.
        let mut state = State::new();
        let handles = table();
        let err = with_guard(&mut state, &handles, |st| {
            let wrapper = NativeFunction {
                kind: NativeKind::HostBridge,
                name: Rc::from("unmoored"),
                upvalue: Value::Integer(7),
                func: Box::new(trampoline),
            };
            st.push(Value::Function(Function::Native(Rc::new(wrapper))))?;
            vm_call(st, 0, MULTI)
        })
        .unwrap_err();
        assert!(matches!(err, BridgeError::State(_)));
    }

    #[test]
    fn host_failure_chains_the_original_error() {
        struct Failing;
        impl HostCallable for Failing {
            fn name(&self) -> &str {
                "failing"
            }
            fn call(
                &self,
                _frame: &mut HostFrame<'_>,
            ) -> Result<CallOutcome, crate::error::HostError> {
                Err("disk on fire".into())
            }
        }
        let mut state = State::new();
        let handles = table();
        let err = with_guard(&mut state, &handles, |st| {
            push_callable_wrapper(st, &handles, Rc::new(Failing))?;
            vm_call(st, 0, MULTI)
        })
        .unwrap_err();
        match err {
            BridgeError::Runtime { message, cause, .. } => {
                assert!(message.contains("error invoking 'failing'"));
                assert_eq!(cause.unwrap().to_string(), "disk on fire");
            }
            other => panic!("expected chained runtime error, got {:?}", other),
        }
    }

    #[test]
    fn arg_complaint_classifies_as_argument() {
        let mut state = State::new();
        let handles = table();
        let err = with_guard(&mut state, &handles, |st| {
            push_callable_wrapper(st, &handles, Rc::new(Adder))?;
            st.push(Value::Str(Rc::from("x")))?;
            st.push(Value::Integer(2))?;
            vm_call(st, 2, MULTI)
        })
        .unwrap_err();
        match err {
            BridgeError::Argument(message) => {
                assert!(message.contains("bad argument #1 to 'adder'"));
            }
            other => panic!("expected argument error, got {:?}", other),
        }
    }

    #[test]
    fn over_reported_result_count_is_rejected() {
        struct Liar;
        impl HostCallable for Liar {
            fn call(
                &self,
                _frame: &mut HostFrame<'_>,
            ) -> Result<CallOutcome, crate::error::HostError> {
                Ok(CallOutcome::Return(3))
            }
        }
        let mut state = State::new();
        let handles = table();
        let err = with_guard(&mut state, &handles, |st| {
            push_callable_wrapper(st, &handles, Rc::new(Liar))?;
            vm_call(st, 0, MULTI)
        })
        .unwrap_err();
        match err {
            BridgeError::Runtime { message, .. } => {
                assert!(message.contains("more results than it pushed"));
            }
            other => panic!("expected runtime error, got {:?}", other),
        }
    }
}
