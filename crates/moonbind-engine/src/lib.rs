//! A small embeddable scripting engine.
//!
//! The engine is built to be driven from a managing host: all state lives in
//! a [`State`] value, every fallible operation returns a [`Fault`]-carrying
//! `Result` instead of unwinding, and coroutines are stackless so a yield
//! never has to cut through native frames. Host-owned data enters the value
//! model as [`ForeignCell`]s with optional finalizers, and host functions as
//! [`NativeFunction`]s tagged with their origin.

mod chunk;
mod compiler;
mod error;
mod serialize;
mod state;
mod stdlib;
mod value;
mod vm;

pub use chunk::{Constant, Op, Proto, MULTI};
pub use compiler::compile;
pub use error::{CompileError, EResult, Fault, FrameInfo, Status, StreamFailure};
pub use serialize::{
    dump, load, ChunkMode, ChunkSink, ChunkSource, SIGNATURE, STREAM_BLOCK,
};
pub use state::{State, ThreadStatus, MAX_CALL_DEPTH, MAX_STACK, MIN_HEADROOM};
pub use stdlib::Library;
pub use value::{
    Finalizer, ForeignCell, Function, NativeFunction, NativeImpl, NativeKind, NativeOutcome,
    ThreadId, Value, ValueKind,
};
pub use vm::{call, load_source, new_thread, resume, Resume};

/// Engine name and version, as reported to embedders.
pub const VERSION: &str = concat!("Moonbind ", env!("CARGO_PKG_VERSION"));
