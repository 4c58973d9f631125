//! The protected call guard: the scope every bridge entry point runs in.
//!
//! The interpreter's historical non-local unwinding is rendered here as
//! plain `Result` propagation: opening a region binds the host context onto
//! the engine state and verifies headroom, the operation runs, and the
//! context is unbound on every exit path. A fault that reaches the region
//! is translated to exactly one [`BridgeError`].

use std::any::Any;
use std::cell::RefCell;
use std::rc::{Rc, Weak};

use moonbind_engine::{EResult, State, ThreadId, MIN_HEADROOM};

use crate::error::{translate, BridgeError, BridgeResult};
use crate::handles::HandleTable;

/// The execution context bound for the duration of one bridge entry.
///
/// Re-entrant callbacks recover the innermost context to reach back into
/// the session's handle table; the table is held weakly because the context
/// must never extend the session's lifetime.
#[derive(Clone)]
pub(crate) struct HostContext {
    pub handles: Weak<RefCell<HandleTable>>,
    /// Thread that was current when this entry began.
    pub thread: ThreadId,
}

/// Runs `f` inside a guard region on `state`.
///
/// Headroom is verified before any mutation, the context binding is strictly
/// LIFO across nested regions, and the region consumes at most one fault.
pub(crate) fn with_guard<T>(
    state: &mut State,
    handles: &Rc<RefCell<HandleTable>>,
    f: impl FnOnce(&mut State) -> EResult<T>,
) -> BridgeResult<T> {
    state
        .check_headroom(MIN_HEADROOM)
        .map_err(|f| BridgeError::Memory(f.message))?;
    let depth = state.host_context_depth();
    let ctx: Rc<dyn Any> = Rc::new(HostContext {
        handles: Rc::downgrade(handles),
        thread: state.current_thread(),
    });
    state.push_host_context(ctx);
    log::trace!("guard region opened (depth {})", depth + 1);

    let result = f(state);

    let popped = state.pop_host_context();
    debug_assert!(popped.is_some(), "guard context must still be bound at exit");
    if let Some(ctx) = popped.as_ref().and_then(|rc| rc.downcast_ref::<HostContext>()) {
        // Resume restores the resumer on every exit path, so a region
        // always closes on the thread it opened on.
        debug_assert_eq!(
            ctx.thread,
            state.current_thread(),
            "guard region must close on its opening thread"
        );
    }
    debug_assert_eq!(
        state.host_context_depth(),
        depth,
        "guard regions must unwind in LIFO order"
    );
    log::trace!("guard region closed (depth {})", depth + 1);
    result.map_err(translate)
}

/// Recovers the innermost bound context, if any.
pub(crate) fn current_context(state: &State) -> Option<HostContext> {
    state
        .current_host_context()
        .and_then(|rc| rc.downcast_ref::<HostContext>())
        .cloned()
}
