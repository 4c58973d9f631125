//! The session: one engine state plus the bridge machinery around it.
//!
//! Every entry point runs inside a guard region (context bound, headroom
//! verified, at most one translated failure) and takes `&mut self`, so the
//! one-host-thread-per-state precondition is enforced by the borrow checker
//! rather than arbitrated at runtime.

use std::any::Any;
use std::cell::RefCell;
use std::io::{Read, Write};
use std::rc::Rc;

use moonbind_engine::{
    self as engine, ChunkMode, Library, State, ThreadId, ThreadStatus, Value, ValueKind, MULTI,
};

use crate::coroutine;
use crate::error::{BridgeError, BridgeResult};
use crate::guard::with_guard;
use crate::handles::{self, Handle, HandleTable, HostRef, Strength};
use crate::host::HostCallable;
use crate::marshal;
use crate::runtime;
use crate::stream::{ReadCursor, WriteCursor};

/// How many results an invocation should leave on the stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultCount {
    Exact(usize),
    /// Keep every result the call produces.
    All,
}

/// A request to the collector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GcRequest {
    /// Run a full collection cycle; reports the number of cells collected.
    Collect,
    /// Report the number of cycles run so far.
    CycleCount,
}

/// Marker object anchoring the session itself in the handle registry.
struct SessionAnchor;

/// A host-side handle to one interpreter state.
pub struct Session {
    state: Option<State>,
    handles: Rc<RefCell<HandleTable>>,
    /// Strong handle for the session's own anchor; released exactly once.
    anchor: Option<Handle>,
    opened: Vec<Library>,
}

impl Session {
    /// Creates a session around a fresh engine state. Fails with a `State`
    /// error when the process-wide runtime is not initialized.
    pub fn create() -> BridgeResult<Session> {
        Self::with_engine(State::new())
    }

    /// Creates a session around an existing engine state, for embedders
    /// that construct or re-attach states themselves.
    pub fn with_engine(state: State) -> BridgeResult<Session> {
        runtime::register_session()?;
        let handles = Rc::new(RefCell::new(HandleTable::new()));
        let anchor = handles
            .borrow_mut()
            .acquire(HostRef::Object(Rc::new(SessionAnchor)), Strength::Strong);
        log::debug!("session created (marker {})", state.marker());
        Ok(Session { state: Some(state), handles, anchor: Some(anchor), opened: Vec::new() })
    }

    /// Closes the session. Refuses with a `State` error while guest call
    /// frames are live on any thread, leaving the session open.
    ///
    /// With `owns_state` the engine state is destroyed, force-finalizing
    /// every remaining foreign cell. Without it the state is detached and
    /// returned, still usable through the engine API; its bound contexts
    /// are cleared so later guest calls into the bridge fail as
    /// boundary-unavailable. The session anchor is released exactly once
    /// either way.
    pub fn close(&mut self, owns_state: bool) -> BridgeResult<Option<State>> {
        let state = self.state.as_ref().ok_or_else(closed)?;
        for id in 0..state.thread_count() {
            if state.has_frames(id) {
                return Err(BridgeError::state(format!(
                    "cannot close: thread {} still has live call frames",
                    id
                )));
            }
        }
        if state.current_thread() != state.main_thread() || state.host_context_depth() > 0 {
            return Err(BridgeError::state("cannot close: a guest call is still active"));
        }
        if let Some(anchor) = self.anchor.take() {
            self.handles.borrow_mut().release(anchor);
        }
        let mut state = match self.state.take() {
            Some(s) => s,
            None => return Err(closed()),
        };
        if owns_state {
            state.close();
            log::debug!("session closed, engine state destroyed");
            Ok(None)
        } else {
            state.clear_host_contexts();
            log::debug!("session closed, engine state detached");
            Ok(Some(state))
        }
    }

    pub fn is_open(&self) -> bool {
        self.state.is_some()
    }

    /// Engine name and version string.
    pub fn version(&self) -> &'static str {
        engine::VERSION
    }

    // ---- Protected call entry ----

    /// Calls the function below the top `arg_count` stack values. Returns
    /// the number of results left in its place.
    pub fn invoke(&mut self, arg_count: usize, results: ResultCount) -> BridgeResult<usize> {
        let want = want_of(results)?;
        let state = self.state.as_ref().ok_or_else(closed)?;
        if state.top() < arg_count + 1 {
            return Err(BridgeError::argument(format!(
                "call needs a function and {} arguments, stack holds {}",
                arg_count,
                state.top()
            )));
        }
        self.guarded(move |st| {
            if want != MULTI {
                st.check_slots(want as usize)?;
            }
            engine::call(st, arg_count, want)
        })
    }

    // ---- Chunk streaming ----

    /// Loads a chunk from `reader` and pushes the resulting function.
    /// `mode` is `"t"`, `"b"` or `"bt"`.
    pub fn load(
        &mut self,
        reader: &mut dyn Read,
        chunk_name: &str,
        mode: &str,
    ) -> BridgeResult<()> {
        let mode = ChunkMode::parse(mode)
            .ok_or_else(|| BridgeError::argument(format!("unknown load mode '{}'", mode)))?;
        self.guarded(|st| {
            let mut cursor = ReadCursor::new(reader);
            engine::load(st, &mut cursor, chunk_name, mode)
        })
    }

    /// Dumps the chunk function at the top of the stack into `writer`.
    pub fn dump(&mut self, writer: &mut dyn Write) -> BridgeResult<()> {
        self.guarded(|st| {
            let mut cursor = WriteCursor::new(writer);
            engine::dump(st, &mut cursor)
        })
    }

    // ---- Coroutines ----

    /// Captures the top-of-stack function into a new thread; the thread
    /// value replaces it.
    pub fn new_thread(&mut self) -> BridgeResult<ThreadId> {
        let state = self.state.as_ref().ok_or_else(closed)?;
        if !matches!(state.value(-1), Some(Value::Function(_))) {
            return Err(BridgeError::argument("function expected at the top of the stack"));
        }
        self.guarded(coroutine::new_thread)
    }

    /// Resumes `thread` with the top `arg_count` values as arguments and
    /// returns how many values it handed back.
    pub fn resume(&mut self, thread: ThreadId, arg_count: usize) -> BridgeResult<usize> {
        let state = self.state.as_ref().ok_or_else(closed)?;
        if state.thread_status(thread).is_none() {
            return Err(BridgeError::argument(format!("no thread with index {}", thread)));
        }
        if state.top() < arg_count {
            return Err(BridgeError::argument(format!(
                "resume needs {} arguments, stack holds {}",
                arg_count,
                state.top()
            )));
        }
        self.guarded(move |st| coroutine::resume(st, thread, arg_count))
    }

    pub fn thread_status(&self, thread: ThreadId) -> BridgeResult<ThreadStatus> {
        let state = self.state.as_ref().ok_or_else(closed)?;
        coroutine::status(state, thread)
            .ok_or_else(|| BridgeError::argument(format!("no thread with index {}", thread)))
    }

    // ---- Embedding ----

    /// Wraps a host callable and pushes the wrapper function.
    pub fn push_callable(&mut self, callable: Rc<dyn HostCallable>) -> BridgeResult<()> {
        let handles = self.handles.clone();
        self.guarded(move |st| marshal::push_callable_wrapper(st, &handles, callable))
    }

    /// Embeds a host object and pushes the wrapping foreign value.
    pub fn push_object(&mut self, object: Rc<dyn Any>) -> BridgeResult<()> {
        let handles = self.handles.clone();
        self.guarded(move |st| {
            handles::embed(st, &handles, HostRef::Object(object), Strength::Ordinary).map(|_| ())
        })
    }

    /// The host callable behind the wrapper at `index`, or `None` when the
    /// value there is not one of this session's live wrappers.
    pub fn as_callable(&self, index: i32) -> Option<Rc<dyn HostCallable>> {
        let state = self.state.as_ref()?;
        let value = state.value(index)?.clone();
        marshal::unwrap_callable(state, &self.handles, &value)
    }

    /// The host object behind the foreign value at `index`, or `None`.
    pub fn as_object(&self, index: i32) -> Option<Rc<dyn Any>> {
        let state = self.state.as_ref()?;
        let value = state.value(index)?;
        match handles::unwrap_value(state, &self.handles, value)? {
            HostRef::Object(o) => Some(o),
            HostRef::Callable(_) => None,
        }
    }

    /// True when the value at `index` is one of the bridge's callable
    /// wrappers, decided by its explicit tag alone.
    pub fn is_bridge_callable(&self, index: i32) -> bool {
        self.state
            .as_ref()
            .and_then(|st| st.value(index))
            .map(marshal::is_wrapper)
            .unwrap_or(false)
    }

    // ---- Libraries and globals ----

    /// Installs a library bundle. Opening the same bundle twice is a no-op.
    pub fn open_library(&mut self, library: Library) -> BridgeResult<()> {
        if self.opened.contains(&library) {
            return Ok(());
        }
        self.guarded(move |st| {
            library.open(st);
            Ok(())
        })?;
        self.opened.push(library);
        Ok(())
    }

    /// Installs the bundle named `name`; an unknown name is an `Argument`
    /// error.
    pub fn open_library_by_name(&mut self, name: &str) -> BridgeResult<()> {
        let library = Library::from_name(name)
            .ok_or_else(|| BridgeError::argument(format!("unknown library '{}'", name)))?;
        self.open_library(library)
    }

    /// Pushes the global named `name` (nil when unset).
    pub fn get_global(&mut self, name: &str) -> BridgeResult<()> {
        self.guarded(|st| {
            st.check_slots(1)?;
            let v = st.global(name);
            st.push(v)
        })
    }

    /// Pops the top value into the global named `name`.
    pub fn set_global(&mut self, name: &str) -> BridgeResult<()> {
        self.guarded(|st| {
            let v = st.pop()?;
            st.set_global_value(name, v);
            Ok(())
        })
    }

    // ---- Collector ----

    pub fn gc(&mut self, request: GcRequest) -> BridgeResult<u64> {
        match request {
            GcRequest::Collect => self.guarded(|st| st.gc().map(|n| n as u64)),
            GcRequest::CycleCount => {
                let state = self.state.as_ref().ok_or_else(closed)?;
                Ok(state.gc_cycles())
            }
        }
    }

    /// Successful handle releases over the session's lifetime.
    pub fn released_handles(&self) -> u64 {
        self.handles.borrow().released()
    }

    /// Host references the registry currently holds (anchor included).
    pub fn live_handles(&self) -> usize {
        self.handles.borrow().len()
    }

    // ---- Stack pass-throughs ----

    pub fn top(&self) -> BridgeResult<usize> {
        Ok(self.state.as_ref().ok_or_else(closed)?.top())
    }

    pub fn value_kind(&self, index: i32) -> BridgeResult<ValueKind> {
        let state = self.state.as_ref().ok_or_else(closed)?;
        Ok(state.value(index).map(Value::kind).unwrap_or(ValueKind::None))
    }

    pub fn to_integer(&self, index: i32) -> BridgeResult<Option<i64>> {
        let state = self.state.as_ref().ok_or_else(closed)?;
        Ok(state.value(index).and_then(Value::as_integer))
    }

    pub fn to_number(&self, index: i32) -> BridgeResult<Option<f64>> {
        let state = self.state.as_ref().ok_or_else(closed)?;
        Ok(state.value(index).and_then(Value::as_number))
    }

    pub fn to_str(&self, index: i32) -> BridgeResult<Option<Rc<str>>> {
        let state = self.state.as_ref().ok_or_else(closed)?;
        Ok(match state.value(index) {
            Some(Value::Str(s)) => Some(s.clone()),
            _ => None,
        })
    }

    pub fn to_bool(&self, index: i32) -> BridgeResult<Option<bool>> {
        let state = self.state.as_ref().ok_or_else(closed)?;
        Ok(state.value(index).map(Value::truthy))
    }

    pub fn push_nil(&mut self) -> BridgeResult<()> {
        self.guarded(|st| st.push(Value::Nil))
    }

    pub fn push_bool(&mut self, b: bool) -> BridgeResult<()> {
        self.guarded(move |st| st.push(Value::Boolean(b)))
    }

    pub fn push_integer(&mut self, i: i64) -> BridgeResult<()> {
        self.guarded(move |st| st.push(Value::Integer(i)))
    }

    pub fn push_number(&mut self, n: f64) -> BridgeResult<()> {
        self.guarded(move |st| st.push(Value::Number(n)))
    }

    pub fn push_str(&mut self, s: &str) -> BridgeResult<()> {
        let v = Value::Str(Rc::from(s));
        self.guarded(move |st| st.push(v))
    }

    pub fn pop(&mut self, n: usize) -> BridgeResult<()> {
        self.guarded(move |st| st.pop_n(n))
    }

    // ---- Internals ----

    fn guarded<T>(
        &mut self,
        f: impl FnOnce(&mut State) -> engine::EResult<T>,
    ) -> BridgeResult<T> {
        let handles = self.handles.clone();
        let state = self.state.as_mut().ok_or_else(closed)?;
        with_guard(state, &handles, f)
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if let Some(state) = self.state.take() {
            log::debug!("session dropped while open; destroying engine state");
            state.close();
        }
    }
}

fn closed() -> BridgeError {
    BridgeError::state("session is closed")
}

pub(crate) fn want_of(results: ResultCount) -> BridgeResult<u8> {
    match results {
        ResultCount::All => Ok(MULTI),
        ResultCount::Exact(n) if n < MULTI as usize => Ok(n as u8),
        ResultCount::Exact(n) => {
            Err(BridgeError::argument(format!("result count {} is out of range", n)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime;

    fn session() -> (Session, parking_lot::MutexGuard<'static, ()>) {
        let guard = runtime::test_lock();
        runtime::ensure_initialized_for_tests();
        (Session::create().unwrap(), guard)
    }

    fn load_str(session: &mut Session, source: &str, name: &str) {
        let mut bytes = source.as_bytes();
        session.load(&mut bytes, name, "t").unwrap();
    }

    #[test]
    fn create_requires_an_initialized_runtime() {
        let _guard = runtime::test_lock();
        runtime::ensure_initialized_for_tests();
        runtime::shutdown().unwrap();
        assert!(matches!(Session::create(), Err(BridgeError::State(_))));
        runtime::init().unwrap();
        assert!(Session::create().is_ok());
    }

    #[test]
    fn load_and_invoke_return_one_plus_one() {
        let (mut s, _guard) = session();
        load_str(&mut s, "return 1+1", "sum");
        let n = s.invoke(0, ResultCount::Exact(1)).unwrap();
        assert_eq!(n, 1);
        assert_eq!(s.to_integer(-1).unwrap(), Some(2));
    }

    #[test]
    fn unknown_load_mode_is_an_argument_error() {
        let (mut s, _guard) = session();
        let mut bytes: &[u8] = b"return 1";
        assert!(matches!(
            s.load(&mut bytes, "t", "w"),
            Err(BridgeError::Argument(_))
        ));
    }

    #[test]
    fn unknown_library_name_is_an_argument_error() {
        let (mut s, _guard) = session();
        assert!(matches!(
            s.open_library_by_name("io"),
            Err(BridgeError::Argument(_))
        ));
        s.open_library_by_name("base").unwrap();
        // Idempotent double-open.
        s.open_library_by_name("base").unwrap();
        s.open_library(Library::Base).unwrap();
    }

    #[test]
    fn close_refuses_while_thread_frames_are_live() {
        let (mut s, _guard) = session();
        s.open_library(Library::Coroutine).unwrap();
        load_str(&mut s, "yield(1) return 2", "co");
        let id = s.new_thread().unwrap();
        s.pop(1).unwrap();
        assert_eq!(s.resume(id, 0).unwrap(), 1);
        s.pop(1).unwrap();
        assert_eq!(s.thread_status(id).unwrap(), ThreadStatus::Suspended);

        // The suspended thread still has a live chunk frame.
        match s.close(true) {
            Err(BridgeError::State(_)) => {}
            _ => panic!("close must refuse while frames are live"),
        }
        assert!(s.is_open());

        assert_eq!(s.resume(id, 0).unwrap(), 1);
        assert_eq!(s.to_integer(-1).unwrap(), Some(2));
        s.pop(1).unwrap();
        s.close(true).unwrap();
        assert!(!s.is_open());
    }

    #[test]
    fn double_close_is_a_state_error_and_anchor_releases_once() {
        let (mut s, _guard) = session();
        assert_eq!(s.live_handles(), 1); // the anchor
        s.close(true).unwrap();
        assert!(matches!(s.close(true), Err(BridgeError::State(_))));
    }

    #[test]
    fn detached_state_remains_usable_through_the_engine_api() {
        let (mut s, _guard) = session();
        load_str(&mut s, "return 5", "t");
        let mut state = s.close(false).unwrap().unwrap();
        let n = engine::call(&mut state, 0, MULTI).unwrap();
        assert_eq!(n, 1);
        assert!(matches!(state.pop().unwrap(), Value::Integer(5)));
        state.close();
    }

    #[test]
    fn result_count_padding_matches_request() {
        let (mut s, _guard) = session();
        load_str(&mut s, "return 1, 2", "t");
        let n = s.invoke(0, ResultCount::Exact(4)).unwrap();
        assert_eq!(n, 4);
        assert_eq!(s.value_kind(-1).unwrap(), ValueKind::Nil);
        assert_eq!(s.to_integer(1).unwrap(), Some(1));
        s.pop(4).unwrap();
    }

    #[test]
    fn globals_round_trip() {
        let (mut s, _guard) = session();
        s.push_integer(99).unwrap();
        s.set_global("answer").unwrap();
        s.get_global("answer").unwrap();
        assert_eq!(s.to_integer(-1).unwrap(), Some(99));
        s.pop(1).unwrap();
        load_str(&mut s, "return answer + 1", "t");
        s.invoke(0, ResultCount::Exact(1)).unwrap();
        assert_eq!(s.to_integer(-1).unwrap(), Some(100));
    }

    #[test]
    fn version_names_the_engine() {
        let (s, _guard) = session();
        assert!(s.version().starts_with("Moonbind "));
    }
}
