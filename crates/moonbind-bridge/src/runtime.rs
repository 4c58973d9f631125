//! Process-wide bridge runtime with an explicit lifecycle.
//!
//! Misuse of the lifecycle (double init, use before init, double shutdown)
//! is a detectable `State` error. A clean shutdown permits a later re-init.

use once_cell::sync::OnceCell;
use parking_lot::Mutex;

use crate::error::{BridgeError, BridgeResult};

struct Runtime {
    initialized: bool,
    /// Sessions created since the last init, for diagnostics.
    sessions: u64,
}

static RUNTIME: OnceCell<Mutex<Runtime>> = OnceCell::new();

fn cell() -> &'static Mutex<Runtime> {
    RUNTIME.get_or_init(|| Mutex::new(Runtime { initialized: false, sessions: 0 }))
}

/// Initializes the bridge runtime. Must be called once before any session
/// is created; initializing an already-initialized runtime is a `State`
/// error.
pub fn init() -> BridgeResult<()> {
    let mut rt = cell().lock();
    if rt.initialized {
        return Err(BridgeError::state("bridge runtime is already initialized"));
    }
    rt.initialized = true;
    rt.sessions = 0;
    log::debug!("bridge runtime initialized");
    Ok(())
}

/// Tears the runtime down. Requires a prior [`init`]; a second shutdown is
/// a `State` error.
pub fn shutdown() -> BridgeResult<()> {
    let mut rt = cell().lock();
    if !rt.initialized {
        return Err(BridgeError::state("bridge runtime is not initialized"));
    }
    rt.initialized = false;
    log::debug!("bridge runtime shut down after {} sessions", rt.sessions);
    Ok(())
}

pub fn is_initialized() -> bool {
    cell().lock().initialized
}

/// Called by session creation; fails when the runtime is down.
pub(crate) fn register_session() -> BridgeResult<()> {
    let mut rt = cell().lock();
    if !rt.initialized {
        return Err(BridgeError::state(
            "bridge runtime is not initialized; call runtime::init first",
        ));
    }
    rt.sessions += 1;
    Ok(())
}

/// Serializes tests that depend on the process-global lifecycle.
#[cfg(test)]
pub(crate) fn test_lock() -> parking_lot::MutexGuard<'static, ()> {
    static LOCK: Mutex<()> = Mutex::new(());
    LOCK.lock()
}

/// Initializes the runtime if a test has not done so already.
#[cfg(test)]
pub(crate) fn ensure_initialized_for_tests() {
    let _ = init();
}
