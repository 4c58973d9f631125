use std::any::Any;
use std::cell::RefCell;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};

use rustc_hash::FxHashMap;

use crate::chunk::Proto;
use crate::error::{EResult, Fault, FrameInfo, Status};
use crate::value::{Finalizer, ForeignCell, ThreadId, Value};

/// Upper bound on value-stack slots per thread.
pub const MAX_STACK: usize = 100_000;
/// Upper bound on nested call frames (bytecode and native combined).
pub const MAX_CALL_DEPTH: usize = 200;
/// Call-depth margin every boundary entry reserves before touching the state.
pub const MIN_HEADROOM: usize = 20;

static NEXT_MARKER: AtomicU64 = AtomicU64::new(1);

/// Lifecycle status of a cooperative thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadStatus {
    NotStarted,
    Suspended,
    /// Alive but currently resuming another thread.
    Normal,
    Running,
    Dead,
}

/// An activation record of a chunk on a thread's stack.
#[derive(Debug, Clone)]
pub(crate) struct Frame {
    pub proto: Rc<Proto>,
    pub pc: usize,
    /// First local slot; temporaries live above `base + num_locals`.
    pub base: usize,
    /// Slot holding the function value; results are placed here on return.
    pub func_slot: usize,
    /// How many results the caller wants (MULTI = all).
    pub want: u8,
}

/// One cooperative thread: a value stack plus its chunk frames.
#[derive(Debug, Default)]
pub(crate) struct ThreadState {
    pub stack: Vec<Value>,
    pub frames: Vec<Frame>,
    pub status: ThreadStatus,
    /// Result arity of the call suspended by a yield, so resume arguments
    /// can be adjusted into its place.
    pub pending_want: Option<u8>,
}

impl Default for ThreadStatus {
    fn default() -> Self {
        ThreadStatus::NotStarted
    }
}

/// The interpreter's per-session state: a main thread, zero or more
/// coroutines spawned from it, the global table, and the foreign-cell heap.
///
/// At most one embedder call may be active inside a `State` at a time; the
/// `&mut` receivers of every operation make a second concurrent entry
/// unrepresentable rather than arbitrated.
pub struct State {
    pub(crate) globals: FxHashMap<Rc<str>, Value>,
    pub(crate) threads: Vec<ThreadState>,
    pub(crate) current: ThreadId,
    foreign: Vec<Rc<ForeignCell>>,
    gc_cycles: u64,
    marker: u64,
    pub(crate) call_depth: usize,
    /// Stack of embedder execution contexts, innermost last. Opaque to the
    /// engine; trampolines recover the top entry during re-entrant calls.
    host_contexts: Vec<Rc<dyn Any>>,
}

impl Default for State {
    fn default() -> Self {
        Self::new()
    }
}

impl State {
    pub fn new() -> Self {
        let main = ThreadState { status: ThreadStatus::Running, ..Default::default() };
        State {
            globals: FxHashMap::default(),
            threads: vec![main],
            current: 0,
            foreign: Vec::new(),
            gc_cycles: 0,
            marker: NEXT_MARKER.fetch_add(1, Ordering::Relaxed),
            call_depth: 0,
            host_contexts: Vec::new(),
        }
    }

    /// The state's private marker token. Foreign cells created by this state
    /// carry it; identity comparison against it rejects look-alike cells.
    pub fn marker(&self) -> u64 {
        self.marker
    }

    pub fn main_thread(&self) -> ThreadId {
        0
    }

    pub fn current_thread(&self) -> ThreadId {
        self.current
    }

    pub fn thread_status(&self, id: ThreadId) -> Option<ThreadStatus> {
        self.threads.get(id).map(|t| t.status)
    }

    /// Number of threads ever spawned on this state, main thread included.
    pub fn thread_count(&self) -> usize {
        self.threads.len()
    }

    pub(crate) fn cur(&self) -> &ThreadState {
        &self.threads[self.current]
    }

    pub(crate) fn cur_mut(&mut self) -> &mut ThreadState {
        &mut self.threads[self.current]
    }

    // ---- Globals ----

    pub fn global(&self, name: &str) -> Value {
        self.globals.get(name).cloned().unwrap_or(Value::Nil)
    }

    pub fn set_global_value(&mut self, name: &str, value: Value) {
        if matches!(value, Value::Nil) {
            self.globals.remove(name);
        } else {
            self.globals.insert(Rc::from(name), value);
        }
    }

    // ---- Stack access (current thread) ----

    pub fn top(&self) -> usize {
        self.cur().stack.len()
    }

    /// Converts a 1-based, possibly negative index into a stack slot.
    pub fn abs_index(&self, index: i32) -> Option<usize> {
        let top = self.top() as i64;
        let index = index as i64;
        let slot = if index > 0 { index - 1 } else { top + index };
        if slot >= 0 && slot < top {
            Some(slot as usize)
        } else {
            None
        }
    }

    pub fn value(&self, index: i32) -> Option<&Value> {
        let slot = self.abs_index(index)?;
        self.cur().stack.get(slot)
    }

    pub fn push(&mut self, value: Value) -> EResult<()> {
        if self.cur().stack.len() >= MAX_STACK {
            return Err(Fault::memory("stack overflow"));
        }
        self.cur_mut().stack.push(value);
        Ok(())
    }

    pub fn pop(&mut self) -> EResult<Value> {
        self.cur_mut()
            .stack
            .pop()
            .ok_or_else(|| Fault::new(Status::Runtime, "stack underflow"))
    }

    pub fn pop_n(&mut self, n: usize) -> EResult<()> {
        let len = self.cur().stack.len();
        if n > len {
            return Err(Fault::new(Status::Runtime, "stack underflow"));
        }
        self.cur_mut().stack.truncate(len - n);
        Ok(())
    }

    /// Verifies `extra` more slots fit on the current thread's stack.
    pub fn check_slots(&self, extra: usize) -> EResult<()> {
        if self.cur().stack.len() + extra > MAX_STACK {
            return Err(Fault::memory("stack overflow"));
        }
        Ok(())
    }

    /// Verifies the call-depth budget leaves at least `margin` frames.
    pub fn check_headroom(&self, margin: usize) -> EResult<()> {
        if self.call_depth + margin > MAX_CALL_DEPTH {
            return Err(Fault::memory("native call depth exhausted"));
        }
        Ok(())
    }

    pub(crate) fn enter_call(&mut self) -> EResult<()> {
        if self.call_depth >= MAX_CALL_DEPTH {
            return Err(Fault::memory("call depth exhausted"));
        }
        self.call_depth += 1;
        Ok(())
    }

    pub(crate) fn leave_call(&mut self) {
        debug_assert!(self.call_depth > 0);
        self.call_depth = self.call_depth.saturating_sub(1);
    }

    /// Moves the top `n` values of thread `from` onto thread `to`, keeping
    /// their order.
    pub(crate) fn move_values(&mut self, from: ThreadId, to: ThreadId, n: usize) -> EResult<()> {
        if from == to || n == 0 {
            return Ok(());
        }
        let src_len = self.threads[from].stack.len();
        if n > src_len {
            return Err(Fault::new(Status::Runtime, "stack underflow"));
        }
        if self.threads[to].stack.len() + n > MAX_STACK {
            return Err(Fault::memory("stack overflow"));
        }
        let moved: Vec<Value> = self.threads[from].stack.split_off(src_len - n);
        self.threads[to].stack.extend(moved);
        Ok(())
    }

    // ---- Foreign cells ----

    /// Embeds an opaque payload as a new foreign cell tagged with this
    /// state's marker and pushes the wrapping value.
    pub fn push_foreign(
        &mut self,
        payload: Box<dyn Any>,
        finalizer: Option<Finalizer>,
    ) -> EResult<Rc<ForeignCell>> {
        let cell = Rc::new(ForeignCell {
            marker: self.marker,
            payload: RefCell::new(Some(payload)),
            finalizer,
        });
        self.check_slots(1)?;
        self.foreign.push(cell.clone());
        self.push(Value::Foreign(cell.clone()))?;
        Ok(cell)
    }

    pub fn gc_cycles(&self) -> u64 {
        self.gc_cycles
    }

    /// Runs a full collection cycle over the foreign heap.
    ///
    /// A cell referenced only by the heap registry is unreachable from guest
    /// values; its finalizer runs exactly once with the payload. Returns the
    /// number of cells collected. The sweep always completes; the first
    /// finalizer failure is reported afterwards as a `Finalizer` fault.
    pub fn gc(&mut self) -> EResult<usize> {
        self.gc_cycles += 1;
        let mut live = Vec::with_capacity(self.foreign.len());
        let mut collected = 0usize;
        let mut first_error: Option<String> = None;
        for cell in self.foreign.drain(..) {
            if Rc::strong_count(&cell) > 1 {
                live.push(cell);
                continue;
            }
            collected += 1;
            if let Some(payload) = cell.take_payload() {
                if let Some(fin) = &cell.finalizer {
                    if let Err(msg) = fin(payload) {
                        log::warn!("finalizer failed during gc: {}", msg);
                        first_error.get_or_insert(msg);
                    }
                }
            }
        }
        self.foreign = live;
        match first_error {
            Some(msg) => Err(Fault::new(Status::Finalizer, msg)),
            None => Ok(collected),
        }
    }

    /// Destroys the state, force-finalizing every remaining foreign cell.
    /// Finalizer failures during teardown are logged, never raised.
    pub fn close(mut self) {
        log::debug!("closing interpreter state ({} foreign cells)", self.foreign.len());
        for thread in &mut self.threads {
            thread.stack.clear();
            thread.frames.clear();
        }
        self.globals.clear();
        for cell in self.foreign.drain(..) {
            if let Some(payload) = cell.take_payload() {
                if let Some(fin) = &cell.finalizer {
                    if let Err(msg) = fin(payload) {
                        log::warn!("finalizer failed during close: {}", msg);
                    }
                }
            }
        }
    }

    // ---- Embedder execution contexts ----

    pub fn push_host_context(&mut self, ctx: Rc<dyn Any>) {
        self.host_contexts.push(ctx);
    }

    pub fn pop_host_context(&mut self) -> Option<Rc<dyn Any>> {
        self.host_contexts.pop()
    }

    pub fn current_host_context(&self) -> Option<&Rc<dyn Any>> {
        self.host_contexts.last()
    }

    pub fn host_context_depth(&self) -> usize {
        self.host_contexts.len()
    }

    /// Drops every bound context, severing the state from its embedder.
    pub fn clear_host_contexts(&mut self) {
        self.host_contexts.clear();
    }

    // ---- Debug info ----

    /// True when chunk frames are live on the given thread.
    pub fn has_frames(&self, id: ThreadId) -> bool {
        self.threads.get(id).map(|t| !t.frames.is_empty()).unwrap_or(false)
    }

    /// Best-effort guest stack trace of the current thread, innermost frame
    /// first. Frames without position information are omitted.
    pub fn traceback(&self) -> Vec<FrameInfo> {
        self.cur()
            .frames
            .iter()
            .rev()
            .map(|f| FrameInfo {
                name: None,
                source: Some(f.proto.source_name.to_string()),
                line: f.proto.line_at(f.pc),
            })
            .filter(|f| f.name.is_some() || f.source.is_some())
            .collect()
    }

    /// Positional prefix of the innermost call site, e.g. `"chunk:3: "`.
    pub fn where_prefix(&self) -> String {
        match self.cur().frames.last() {
            Some(f) => format!("{}:{}: ", f.proto.source_name, f.proto.line_at(f.pc)),
            None => String::new(),
        }
    }

    /// Raises a runtime fault prefixed with the current guest position.
    pub fn rt_error<T>(&self, message: impl AsRef<str>) -> EResult<T> {
        Err(Fault::runtime(format!("{}{}", self.where_prefix(), message.as_ref())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stack_indexing_is_one_based_and_signed() {
        let mut state = State::new();
        state.push(Value::Integer(10)).unwrap();
        state.push(Value::Integer(20)).unwrap();
        assert!(matches!(state.value(1), Some(Value::Integer(10))));
        assert!(matches!(state.value(-1), Some(Value::Integer(20))));
        assert!(state.value(3).is_none());
        assert!(state.value(0).is_none());
        assert!(state.value(-3).is_none());
    }

    #[test]
    fn gc_finalizes_unreachable_cells_once() {
        use std::cell::Cell;
        let releases = Rc::new(Cell::new(0u32));
        let mut state = State::new();
        let r = releases.clone();
        state
            .push_foreign(
                Box::new(7u32),
                Some(Box::new(move |_| {
                    r.set(r.get() + 1);
                    Ok(())
                })),
            )
            .unwrap();
        // Still referenced from the stack: survives a cycle.
        assert_eq!(state.gc().unwrap(), 0);
        state.pop().unwrap();
        assert_eq!(state.gc().unwrap(), 1);
        assert_eq!(releases.get(), 1);
        // Nothing left to collect.
        assert_eq!(state.gc().unwrap(), 0);
        assert_eq!(releases.get(), 1);
    }

    #[test]
    fn close_forces_finalizers() {
        use std::cell::Cell;
        let releases = Rc::new(Cell::new(0u32));
        let mut state = State::new();
        let r = releases.clone();
        state
            .push_foreign(
                Box::new(()),
                Some(Box::new(move |_| {
                    r.set(r.get() + 1);
                    Ok(())
                })),
            )
            .unwrap();
        // Cell is reachable from the stack, but close finalizes regardless.
        state.close();
        assert_eq!(releases.get(), 1);
    }

    #[test]
    fn headroom_check_fails_fast() {
        let mut state = State::new();
        state.call_depth = MAX_CALL_DEPTH - 5;
        assert!(state.check_headroom(4).is_ok());
        assert!(state.check_headroom(6).is_err());
    }
}
