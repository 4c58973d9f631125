//! The coroutine/thread bridge.
//!
//! Resume is synchronous: it blocks the calling host thread until the
//! target yields, completes, or faults. A completion and a yield both
//! surface as a plain result count; the session's `thread_status` probe
//! tells them apart when the caller needs to.

use moonbind_engine::{new_thread as engine_new_thread, resume as engine_resume};
use moonbind_engine::{EResult, Resume, State, ThreadId, ThreadStatus};

/// Captures the top-of-stack callable into a new, not-yet-started thread.
/// The thread value replaces the callable on the stack.
pub(crate) fn new_thread(state: &mut State) -> EResult<ThreadId> {
    let id = engine_new_thread(state)?;
    log::debug!("spawned thread {}", id);
    Ok(id)
}

/// Resumes `id`, transferring the top `nargs` values of the current thread
/// to it, and returns the number of values it handed back (via yield or
/// completion), now on the caller's stack.
pub(crate) fn resume(state: &mut State, id: ThreadId, nargs: usize) -> EResult<usize> {
    let outcome = engine_resume(state, id, nargs)?;
    let n = match outcome {
        Resume::Return(n) => {
            log::trace!("thread {} completed with {} results", id, n);
            n
        }
        Resume::Yield(n) => {
            log::trace!("thread {} yielded {} values", id, n);
            n
        }
    };
    Ok(n)
}

/// Purely descriptive status probe.
pub(crate) fn status(state: &State, id: ThreadId) -> Option<ThreadStatus> {
    state.thread_status(id)
}
