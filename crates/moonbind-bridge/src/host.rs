//! The host side of the boundary: the callable trait and the stack view a
//! callable works through while the interpreter is suspended in it.

use std::any::Any;
use std::cell::RefCell;
use std::rc::Rc;

use moonbind_engine::{call as engine_call, State, Value, ValueKind, MULTI};

use crate::error::{ArgComplaint, HostError};
use crate::guard::with_guard;
use crate::handles::{self, HandleTable, HostRef, Strength};
use crate::session::{want_of, ResultCount};

/// What a host callable wants done with the values it pushed.
///
/// `Yield` is only honored when the invocation happens inside a coroutine;
/// on the main thread it is a guest error. The count refers to values the
/// callable left on top of the stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallOutcome {
    Return(usize),
    Yield(usize),
}

/// A host-supplied function invocable from guest code.
///
/// The callable reads its arguments and pushes its results through the
/// [`HostFrame`]; returning `Err` raises a guest error at the call site,
/// carrying the host error as the chained cause.
pub trait HostCallable {
    /// Name used for the wrapper value and in rendered errors.
    fn name(&self) -> &str {
        "host function"
    }

    fn call(&self, frame: &mut HostFrame<'_>) -> Result<CallOutcome, HostError>;
}

/// Error raised by [`HostFrame`] operations that fail host-side.
#[derive(Debug, thiserror::Error)]
#[error("{0}")]
struct FrameError(String);

/// The stack view passed to a host callable for the duration of one
/// invocation. Indices follow the engine convention: 1-based from the
/// bottom, negative from the top.
pub struct HostFrame<'a> {
    state: &'a mut State,
    handles: Rc<RefCell<HandleTable>>,
    nargs: usize,
}

impl<'a> HostFrame<'a> {
    pub(crate) fn new(
        state: &'a mut State,
        handles: Rc<RefCell<HandleTable>>,
        nargs: usize,
    ) -> Self {
        HostFrame { state, handles, nargs }
    }

    /// Number of arguments the guest passed to this invocation. They are
    /// the top `arg_count()` values at entry.
    pub fn arg_count(&self) -> usize {
        self.nargs
    }

    pub fn top(&self) -> usize {
        self.state.top()
    }

    pub fn value_kind(&self, index: i32) -> ValueKind {
        self.state.value(index).map(Value::kind).unwrap_or(ValueKind::None)
    }

    pub fn to_integer(&self, index: i32) -> Option<i64> {
        self.state.value(index).and_then(Value::as_integer)
    }

    pub fn to_number(&self, index: i32) -> Option<f64> {
        self.state.value(index).and_then(Value::as_number)
    }

    pub fn to_str(&self, index: i32) -> Option<Rc<str>> {
        match self.state.value(index) {
            Some(Value::Str(s)) => Some(s.clone()),
            _ => None,
        }
    }

    /// Guest truthiness of the value at `index`; `None` for a bad index.
    pub fn to_bool(&self, index: i32) -> Option<bool> {
        self.state.value(index).map(Value::truthy)
    }

    pub fn push_nil(&mut self) -> Result<(), HostError> {
        self.push(Value::Nil)
    }

    pub fn push_bool(&mut self, b: bool) -> Result<(), HostError> {
        self.push(Value::Boolean(b))
    }

    pub fn push_integer(&mut self, i: i64) -> Result<(), HostError> {
        self.push(Value::Integer(i))
    }

    pub fn push_number(&mut self, n: f64) -> Result<(), HostError> {
        self.push(Value::Number(n))
    }

    pub fn push_str(&mut self, s: &str) -> Result<(), HostError> {
        self.push(Value::Str(Rc::from(s)))
    }

    pub fn pop(&mut self, n: usize) -> Result<(), HostError> {
        self.state
            .pop_n(n)
            .map_err(|f| Box::new(FrameError(f.message)) as HostError)
    }

    /// Embeds a host object as a fresh foreign value on the stack.
    pub fn push_object(&mut self, object: Rc<dyn Any>) -> Result<(), HostError> {
        handles::embed(self.state, &self.handles, HostRef::Object(object), Strength::Ordinary)
            .map(|_| ())
            .map_err(|f| Box::new(FrameError(f.message)) as HostError)
    }

    /// Recovers the host object embedded at `index`, if the value there is
    /// one of this session's wrappers.
    pub fn as_object(&self, index: i32) -> Option<Rc<dyn Any>> {
        let value = self.state.value(index)?;
        match handles::unwrap_value(self.state, &self.handles, value)? {
            HostRef::Object(o) => Some(o),
            HostRef::Callable(_) => None,
        }
    }

    /// Calls the function below the top `arg_count` stack values from
    /// inside this invocation, opening a nested guard region for the
    /// duration. Returns the number of results left in the function's
    /// place. A failure comes back as a host error; returning it to the
    /// engine re-raises it at the outer guest call site.
    pub fn invoke(&mut self, arg_count: usize, results: ResultCount) -> Result<usize, HostError> {
        let want = want_of(results).map_err(|e| Box::new(e) as HostError)?;
        if self.state.top() < arg_count + 1 {
            return Err(Box::new(FrameError(format!(
                "call needs a function and {} arguments, stack holds {}",
                arg_count,
                self.state.top()
            ))));
        }
        let handles = self.handles.clone();
        with_guard(self.state, &handles, |st| {
            if want != MULTI {
                st.check_slots(want as usize)?;
            }
            engine_call(st, arg_count, want)
        })
        .map_err(|e| Box::new(e) as HostError)
    }

    /// Builds the error for a precondition failure on argument `index`,
    /// rendered like `bad argument #2 to 'name' (message)`. Returning it
    /// from the callable classifies the failure as an argument error at
    /// the boundary.
    pub fn arg_error(&self, index: usize, func: &str, message: &str) -> HostError {
        Box::new(ArgComplaint {
            message: format!("bad argument #{} to '{}' ({})", index, func, message),
        })
    }

    fn push(&mut self, value: Value) -> Result<(), HostError> {
        self.state
            .push(value)
            .map_err(|f| Box::new(FrameError(f.message)) as HostError)
    }
}
