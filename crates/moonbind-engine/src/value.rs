use std::any::Any;
use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

use crate::chunk::Proto;
use crate::error::EResult;
use crate::state::State;

/// Identifier of a cooperative thread inside one [`State`].
///
/// Threads are never removed from the state's thread list, so an id stays
/// valid (and keeps reporting `Dead`) for the lifetime of the state.
pub type ThreadId = usize;

/// Discriminates what created a native function.
///
/// The embedder's callable wrappers are recognised by this explicit tag
/// rather than by comparing trampoline function pointers, which keeps the
/// "is this a bridge callable" query O(1) and side-effect free.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NativeKind {
    /// A function installed by one of the engine's own library bundles.
    Builtin,
    /// A trampoline created by the embedding layer around a host callable.
    HostBridge,
}

/// Outcome of a native function invocation.
///
/// `Yield` is an explicit return variant rather than a side-channel flag, so
/// a stale yield request can never leak across re-entrant calls. The count
/// always refers to values currently on top of the calling thread's stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NativeOutcome {
    Return(usize),
    Yield(usize),
}

/// Implementation of a native function. Receives the state, the function's
/// sole upvalue and the argument count; arguments sit on top of the current
/// thread's stack.
pub type NativeImpl = Box<dyn Fn(&mut State, &Value, usize) -> EResult<NativeOutcome>>;

/// A function implemented outside the bytecode interpreter.
pub struct NativeFunction {
    pub kind: NativeKind,
    pub name: Rc<str>,
    /// The sole upvalue. For embedder trampolines this is the foreign cell
    /// wrapping the handle to the host callable.
    pub upvalue: Value,
    pub func: NativeImpl,
}

impl fmt::Debug for NativeFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NativeFunction")
            .field("kind", &self.kind)
            .field("name", &self.name)
            .finish()
    }
}

/// A callable interpreter value.
#[derive(Debug, Clone)]
pub enum Function {
    /// A compiled chunk.
    Chunk(Rc<Proto>),
    Native(Rc<NativeFunction>),
}

impl Function {
    pub fn name(&self) -> &str {
        match self {
            Function::Chunk(p) => &p.source_name,
            Function::Native(n) => &n.name,
        }
    }
}

/// Finalizer invoked by the collector with the cell's payload when the
/// wrapping value becomes unreachable.
pub type Finalizer = Box<dyn Fn(Box<dyn Any>) -> Result<(), String>>;

/// A host-owned payload embedded as an interpreter value.
///
/// Cells are tagged with the private marker token of the state that created
/// them; a cell constructed for another state (or forged by other means)
/// fails the marker identity check and is treated as foreign data of an
/// unknown kind. The payload is taken exactly once, either by the collector
/// running the finalizer or by an explicit teardown sweep.
pub struct ForeignCell {
    pub(crate) marker: u64,
    pub(crate) payload: RefCell<Option<Box<dyn Any>>>,
    pub(crate) finalizer: Option<Finalizer>,
}

impl ForeignCell {
    /// Reads the payload through `f` if the marker matches.
    pub fn inspect<R>(&self, marker: u64, f: impl FnOnce(&dyn Any) -> R) -> Option<R> {
        if self.marker != marker {
            return None;
        }
        let guard = self.payload.borrow();
        guard.as_deref().map(f)
    }

    /// Takes the payload out for finalization; `None` if already finalized.
    pub(crate) fn take_payload(&self) -> Option<Box<dyn Any>> {
        self.payload.borrow_mut().take()
    }
}

impl fmt::Debug for ForeignCell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ForeignCell(marker={})", self.marker)
    }
}

/// The interpreter value model.
#[derive(Debug, Clone)]
pub enum Value {
    Nil,
    Boolean(bool),
    Integer(i64),
    Number(f64),
    Str(Rc<str>),
    Function(Function),
    Foreign(Rc<ForeignCell>),
    Thread(ThreadId),
}

/// Kind tag of a stack slot, including `None` for an invalid index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueKind {
    None,
    Nil,
    Boolean,
    Integer,
    Number,
    Str,
    Function,
    Foreign,
    Thread,
}

impl Value {
    pub fn kind(&self) -> ValueKind {
        match self {
            Value::Nil => ValueKind::Nil,
            Value::Boolean(_) => ValueKind::Boolean,
            Value::Integer(_) => ValueKind::Integer,
            Value::Number(_) => ValueKind::Number,
            Value::Str(_) => ValueKind::Str,
            Value::Function(_) => ValueKind::Function,
            Value::Foreign(_) => ValueKind::Foreign,
            Value::Thread(_) => ValueKind::Thread,
        }
    }

    /// Guest truthiness: only `nil` and `false` are falsy.
    pub fn truthy(&self) -> bool {
        !matches!(self, Value::Nil | Value::Boolean(false))
    }

    /// Numeric view used by arithmetic, or `None` for non-numbers.
    pub fn as_number(&self) -> Option<f64> {
        match self {
            Value::Integer(i) => Some(*i as f64),
            Value::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Value::Integer(i) => Some(*i),
            Value::Number(n) if n.fract() == 0.0 => Some(*n as i64),
            _ => None,
        }
    }

    /// Raw equality, without coercions across unrelated kinds.
    pub fn raw_eq(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Nil, Value::Nil) => true,
            (Value::Boolean(a), Value::Boolean(b)) => a == b,
            (Value::Integer(a), Value::Integer(b)) => a == b,
            (Value::Number(a), Value::Number(b)) => a == b,
            (Value::Integer(a), Value::Number(b)) | (Value::Number(b), Value::Integer(a)) => {
                (*a as f64) == *b
            }
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::Function(Function::Chunk(a)), Value::Function(Function::Chunk(b))) => {
                Rc::ptr_eq(a, b)
            }
            (Value::Function(Function::Native(a)), Value::Function(Function::Native(b))) => {
                Rc::ptr_eq(a, b)
            }
            (Value::Foreign(a), Value::Foreign(b)) => Rc::ptr_eq(a, b),
            (Value::Thread(a), Value::Thread(b)) => a == b,
            _ => false,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Nil => write!(f, "nil"),
            Value::Boolean(b) => write!(f, "{}", b),
            Value::Integer(i) => write!(f, "{}", i),
            Value::Number(n) => {
                if n.fract() == 0.0 && n.is_finite() && n.abs() < 1e15 {
                    write!(f, "{:.1}", n)
                } else {
                    write!(f, "{}", n)
                }
            }
            Value::Str(s) => write!(f, "{}", s),
            Value::Function(func) => write!(f, "function: {}", func.name()),
            Value::Foreign(cell) => write!(f, "foreign: {:p}", Rc::as_ptr(cell)),
            Value::Thread(id) => write!(f, "thread: {}", id),
        }
    }
}
