//! The error translation pipeline: one engine fault in, exactly one
//! structured host failure out.

use std::error::Error as StdError;

use moonbind_engine::{Fault, FrameInfo, Status, StreamFailure};

/// An error produced by host-side code (a callable body or an I/O stream).
pub type HostError = Box<dyn StdError + Send + Sync + 'static>;

/// One frame of a guest stack trace, innermost call site first.
pub type TraceFrame = FrameInfo;

/// The structured failure a bridge entry point raises.
///
/// Kinds are mutually exclusive; the variant is decided either by a local
/// precondition check before the engine is touched (`Argument`, `State`) or
/// by the classification of the engine fault that reached the guard.
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    /// A caller-supplied value violates a documented precondition.
    #[error("bad argument: {0}")]
    Argument(String),
    /// An operation invariant is violated (closed session, live frames).
    #[error("invalid state: {0}")]
    State(String),
    /// A chunk failed to parse or decode during load.
    #[error("syntax error: {0}")]
    Syntax(String),
    /// Allocation or stack-resource exhaustion.
    #[error("out of memory: {0}")]
    Memory(String),
    /// The error-formatting handler itself failed.
    #[error("message handler failed: {0}")]
    MessageHandler(String),
    /// A collector-invoked finalizer failed.
    #[error("finalizer failed: {0}")]
    Finalizer(String),
    /// A guest-raised error, with the richest payload: the rendered
    /// message, a best-effort guest stack trace, and the original host
    /// exception when the error began as a failed host callable.
    #[error("{message}")]
    Runtime {
        message: String,
        trace: Vec<TraceFrame>,
        #[source]
        cause: Option<HostError>,
    },
    /// The host runtime cannot be reached from a re-entrant callback.
    #[error("host boundary unavailable: {0}")]
    BoundaryUnavailable(String),
    /// A host stream failed during a chunk load or dump.
    #[error("{message}")]
    Io {
        message: String,
        #[source]
        source: std::io::Error,
    },
}

pub type BridgeResult<T> = Result<T, BridgeError>;

impl BridgeError {
    pub(crate) fn argument(message: impl Into<String>) -> Self {
        BridgeError::Argument(message.into())
    }

    pub(crate) fn state(message: impl Into<String>) -> Self {
        BridgeError::State(message.into())
    }
}

/// Marker payload: the trampoline could not reach the host runtime.
pub(crate) struct BoundaryLost;

/// Marker payload: the wrapper's upvalue no longer resolves to a callable.
pub(crate) struct NotBridgeCallable;

/// Payload chaining the host exception that failed a callable invocation.
pub(crate) struct HostCause(pub HostError);

/// Payload marking a host callable's argument complaint, so it surfaces as
/// an `Argument` failure instead of a plain runtime error.
#[derive(Debug, thiserror::Error)]
#[error("{message}")]
pub struct ArgComplaint {
    pub(crate) message: String,
}

/// The classification-plus-payload carrier produced when an engine fault
/// reaches a guard region. Created once per failing entry point and
/// consumed exactly once by [`ErrorRecord::translate`].
pub struct ErrorRecord {
    status: Status,
    message: String,
    trace: Option<Vec<TraceFrame>>,
    payload: Option<Box<dyn std::any::Any>>,
}

impl ErrorRecord {
    pub(crate) fn from_fault(fault: Fault) -> Self {
        ErrorRecord {
            status: fault.status,
            message: fault.message,
            trace: fault.trace,
            payload: fault.payload,
        }
    }

    /// Converts the record into the one host failure the entry point
    /// raises.
    pub(crate) fn translate(self) -> BridgeError {
        match self.status {
            Status::Syntax => BridgeError::Syntax(self.message),
            Status::Memory => BridgeError::Memory(self.message),
            Status::Handler => BridgeError::MessageHandler(self.message),
            Status::Finalizer => BridgeError::Finalizer(self.message),
            _ => self.translate_runtime(),
        }
    }

    fn translate_runtime(self) -> BridgeError {
        let ErrorRecord { message, trace, payload, .. } = self;
        let trace = trace.unwrap_or_default();
        let payload = match payload {
            None => {
                return BridgeError::Runtime { message, trace, cause: None };
            }
            Some(p) => p,
        };
        let payload = match payload.downcast::<BoundaryLost>() {
            Ok(_) => return BridgeError::BoundaryUnavailable(message),
            Err(p) => p,
        };
        let payload = match payload.downcast::<NotBridgeCallable>() {
            Ok(_) => return BridgeError::State(message),
            Err(p) => p,
        };
        let payload = match payload.downcast::<ArgComplaint>() {
            Ok(complaint) => return BridgeError::Argument(complaint.message),
            Err(p) => p,
        };
        let payload = match payload.downcast::<StreamFailure>() {
            Ok(failure) => {
                let source = match failure.0.downcast::<std::io::Error>() {
                    Ok(io) => *io,
                    Err(other) => std::io::Error::new(std::io::ErrorKind::Other, other),
                };
                return BridgeError::Io { message, source };
            }
            Err(p) => p,
        };
        match payload.downcast::<HostCause>() {
            Ok(cause) => BridgeError::Runtime { message, trace, cause: Some(cause.0) },
            Err(_) => BridgeError::Runtime { message, trace, cause: None },
        }
    }
}

/// Shorthand used by every guarded entry point.
pub(crate) fn translate(fault: Fault) -> BridgeError {
    ErrorRecord::from_fault(fault).translate()
}
