use std::any::Any;
use std::error::Error;
use std::fmt;

/// Completion status of a protected interpreter operation.
///
/// Mirrors the interpreter's classic status codes: `Ok`/`Yield` are the two
/// normal completions of a resume, everything else identifies the phase that
/// failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Ok,
    Yield,
    /// A guest-level error raised while running code.
    Runtime,
    /// A parse failure while loading a chunk.
    Syntax,
    /// Allocation or stack-resource exhaustion.
    Memory,
    /// The error-formatting handler itself failed.
    Handler,
    /// A collector-invoked finalizer failed.
    Finalizer,
}

/// A frame of a guest stack trace.
///
/// Frames with neither a function name nor a source name carry no useful
/// position and are dropped by [`crate::State::traceback`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameInfo {
    pub name: Option<String>,
    pub source: Option<String>,
    pub line: u32,
}

/// An error unwinding out of the interpreter.
///
/// This is the explicit, `Result`-propagated rendition of the interpreter's
/// internal non-local jump: every engine operation that can fail returns
/// `Result<T, Fault>`, and the fault travels up to whichever protected scope
/// installed itself around the operation. The opaque `payload` slot lets an
/// embedder smuggle its own structured cause (for example a failed host
/// invocation) through the unwinding without the engine inspecting it.
pub struct Fault {
    pub status: Status,
    pub message: String,
    /// Guest stack trace, captured at the protected-call boundary.
    pub trace: Option<Vec<FrameInfo>>,
    /// Embedder-defined structured cause; opaque to the engine.
    pub payload: Option<Box<dyn Any>>,
}

impl Fault {
    pub fn new(status: Status, message: impl Into<String>) -> Self {
        Fault { status, message: message.into(), trace: None, payload: None }
    }

    pub fn with_payload(mut self, payload: Box<dyn Any>) -> Self {
        self.payload = Some(payload);
        self
    }

    pub fn runtime(message: impl Into<String>) -> Self {
        Fault::new(Status::Runtime, message)
    }

    pub fn memory(message: impl Into<String>) -> Self {
        Fault::new(Status::Memory, message)
    }

    pub fn syntax(message: impl Into<String>) -> Self {
        Fault::new(Status::Syntax, message)
    }
}

impl fmt::Debug for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Fault")
            .field("status", &self.status)
            .field("message", &self.message)
            .field("trace", &self.trace)
            .field("payload", &self.payload.as_ref().map(|_| "<opaque>"))
            .finish()
    }
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl Error for Fault {}

/// Shorthand for engine results that unwind with a [`Fault`].
pub type EResult<T> = Result<T, Fault>;

/// A failure reported by a host-supplied chunk source or sink.
///
/// Stream faults must abort a load or dump without being swallowed; the
/// original host error rides along as the fault payload so the embedder can
/// recover it after translation.
pub struct StreamFailure(pub Box<dyn Error + Send + Sync>);

impl StreamFailure {
    pub(crate) fn into_fault(self, op: &str) -> Fault {
        let message = format!("{} failed: {}", op, self.0);
        Fault::runtime(message).with_payload(Box::new(self))
    }
}

impl fmt::Debug for StreamFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StreamFailure({})", self.0)
    }
}

/// A chunk failed to compile.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{source_name}:{line}: {message}")]
pub struct CompileError {
    pub source_name: String,
    pub line: u32,
    pub message: String,
}

impl From<CompileError> for Fault {
    fn from(e: CompileError) -> Self {
        Fault::syntax(e.to_string())
    }
}
