//! Host-side bridge for embedding the Moonbind engine.
//!
//! The bridge wraps an engine [`State`](moonbind_engine::State) in a
//! [`Session`] that marshals calls in both directions. Guest-visible host
//! functions and objects are registered in a generation-checked handle
//! table, every entry point runs inside a guard region that binds the
//! session context for re-entrant calls, and engine faults crossing back
//! into the host are translated into one [`BridgeError`] per crossing.
//!
//! ```no_run
//! use moonbind_bridge::{runtime, ResultCount, Session};
//!
//! runtime::init()?;
//! let mut session = Session::create()?;
//! session.load(&mut "return 1 + 1".as_bytes(), "demo", "t")?;
//! session.invoke(0, ResultCount::Exact(1))?;
//! assert_eq!(session.to_integer(-1)?, Some(2));
//! # Ok::<(), moonbind_bridge::BridgeError>(())
//! ```

mod coroutine;
mod error;
mod guard;
mod handles;
mod host;
mod marshal;
pub mod runtime;
mod session;
mod stream;

pub use error::{BridgeError, BridgeResult, HostError, TraceFrame};
pub use host::{CallOutcome, HostCallable, HostFrame};
pub use session::{GcRequest, ResultCount, Session};

pub use moonbind_engine::{Library, ThreadId, ThreadStatus, ValueKind};
