//! The bytecode run loop and the call/resume entry points.
//!
//! Execution is stackless: chunk activations live as [`Frame`]s on the
//! thread, so a yield anywhere in a coroutine returns through plain `Result`
//! values instead of unwinding native frames.

use std::cmp::Ordering;
use std::rc::Rc;

use crate::chunk::{Constant, Op, MULTI};
use crate::error::{EResult, Fault};
use crate::state::{Frame, State, ThreadState, ThreadStatus};
use crate::value::{Function, NativeOutcome, ThreadId, Value};

/// Outcome of resuming a coroutine: either it ran to completion or it
/// yielded. The count is the number of values transferred back onto the
/// resuming thread's stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resume {
    Return(usize),
    Yield(usize),
}

enum CallStep {
    /// A chunk frame was pushed; the run loop continues inside it.
    Framed,
    /// A native function returned; its results have been placed.
    Returned(usize),
    /// A native function yielded `n` values still on the stack.
    Yielded { func_slot: usize, want: u8, n: usize },
}

enum Exec {
    Done(usize),
    Yielded(Vec<Value>),
}

enum Inner {
    Done(usize),
    Yielded(Vec<Value>),
}

fn kind_name(v: &Value) -> &'static str {
    match v {
        Value::Nil => "nil",
        Value::Boolean(_) => "boolean",
        Value::Integer(_) | Value::Number(_) => "number",
        Value::Str(_) => "string",
        Value::Function(_) => "function",
        Value::Foreign(_) => "foreign",
        Value::Thread(_) => "thread",
    }
}

/// Compiles `source` and pushes the resulting chunk function.
pub fn load_source(state: &mut State, source: &str, chunk_name: &str) -> EResult<()> {
    let proto = crate::compiler::compile(source, chunk_name)?;
    state.check_slots(1)?;
    state.push(Value::Function(Function::Chunk(Rc::new(proto))))
}

/// Calls the function below the top `nargs` stack values and runs it to
/// completion, leaving `want` results (`MULTI` = all) in its place. Returns
/// the number of results actually left.
///
/// On a fault the stack and frames of the current thread are unwound to
/// their state before the call, and a guest stack trace is attached to the
/// fault if it does not already carry one.
pub fn call(state: &mut State, nargs: usize, want: u8) -> EResult<usize> {
    let top = state.top();
    if top < nargs + 1 {
        return Err(Fault::runtime("call target missing from the stack"));
    }
    let func_slot = top - nargs - 1;
    let frames_floor = state.cur().frames.len();
    let entry_depth = state.call_depth;
    match call_inner(state, nargs, want, frames_floor) {
        Ok(n) => Ok(n),
        Err(mut fault) => {
            if fault.trace.is_none() && state.cur().frames.len() > frames_floor {
                fault.trace = Some(state.traceback());
            }
            let th = state.cur_mut();
            th.frames.truncate(frames_floor);
            th.stack.truncate(func_slot);
            state.call_depth = entry_depth;
            Err(fault)
        }
    }
}

fn call_inner(state: &mut State, nargs: usize, want: u8, floor: usize) -> EResult<usize> {
    match begin_call(state, nargs, want)? {
        CallStep::Returned(n) => Ok(n),
        CallStep::Framed => match execute(state, floor, false)? {
            Exec::Done(n) => Ok(n),
            Exec::Yielded(_) => Err(Fault::runtime("yield escaped a call boundary")),
        },
        CallStep::Yielded { .. } => yield_refused(state),
    }
}

fn yield_refused<T>(state: &State) -> EResult<T> {
    if state.current_thread() == state.main_thread() {
        state.rt_error("attempt to yield from outside a coroutine")
    } else {
        state.rt_error("attempt to yield across a call boundary")
    }
}

/// Pops a function from the current stack and wraps it in a fresh
/// not-yet-started thread, pushing the thread value.
pub fn new_thread(state: &mut State) -> EResult<ThreadId> {
    let func = state.pop()?;
    if !matches!(func, Value::Function(_)) {
        let msg = format!("cannot spawn a thread from a {} value", kind_name(&func));
        state.push(func)?;
        return state.rt_error(msg);
    }
    let id = state.threads.len();
    state.threads.push(ThreadState { stack: vec![func], ..Default::default() });
    state.check_slots(1)?;
    state.push(Value::Thread(id))?;
    Ok(id)
}

/// Transfers the top `nargs` values of the current thread to `id` and runs
/// it until it returns, yields or faults.
///
/// On `Resume::Return` the thread is dead and its results sit on the
/// resumer's stack; on `Resume::Yield` it is suspended with the yielded
/// values transferred likewise. A faulting thread is marked dead and the
/// fault propagates to the resumer.
pub fn resume(state: &mut State, id: ThreadId, nargs: usize) -> EResult<Resume> {
    let resumer = state.current_thread();
    let prior = state
        .thread_status(id)
        .ok_or_else(|| Fault::runtime("no such thread"))?;
    if id == resumer {
        return Err(Fault::runtime("cannot resume the running coroutine"));
    }
    match prior {
        ThreadStatus::NotStarted | ThreadStatus::Suspended => {}
        ThreadStatus::Dead => return Err(Fault::runtime("cannot resume dead coroutine")),
        ThreadStatus::Normal | ThreadStatus::Running => {
            return Err(Fault::runtime("cannot resume non-suspended coroutine"))
        }
    }
    if state.top() < nargs {
        return Err(Fault::runtime("stack underflow"));
    }
    let entry_depth = state.call_depth;
    let revived_frames = state.threads[id].frames.len();
    state.move_values(resumer, id, nargs)?;
    state.threads[resumer].status = ThreadStatus::Normal;
    state.threads[id].status = ThreadStatus::Running;
    state.current = id;

    let outcome = match resume_inner(state, prior, nargs) {
        Ok(inner) => Ok(inner),
        Err(mut fault) => {
            // Trace is taken while the failed thread is still current.
            if fault.trace.is_none() {
                fault.trace = Some(state.traceback());
            }
            let th = &mut state.threads[id];
            th.frames.clear();
            th.stack.clear();
            th.pending_want = None;
            th.status = ThreadStatus::Dead;
            state.call_depth = entry_depth.saturating_sub(revived_frames);
            Err(fault)
        }
    };

    state.current = resumer;
    state.threads[resumer].status = ThreadStatus::Running;
    match outcome? {
        Inner::Done(n) => {
            state.threads[id].status = ThreadStatus::Dead;
            state.threads[id].pending_want = None;
            state.move_values(id, resumer, n)?;
            state.threads[id].stack.clear();
            Ok(Resume::Return(n))
        }
        Inner::Yielded(vals) => {
            let n = vals.len();
            state.check_slots(n)?;
            for v in vals {
                state.push(v)?;
            }
            Ok(Resume::Yield(n))
        }
    }
}

fn resume_inner(state: &mut State, prior: ThreadStatus, nargs: usize) -> EResult<Inner> {
    match prior {
        ThreadStatus::NotStarted => match begin_call(state, nargs, MULTI)? {
            CallStep::Returned(n) => Ok(Inner::Done(n)),
            CallStep::Framed => run_thread(state),
            CallStep::Yielded { func_slot, want, n } => {
                suspend(state, func_slot, want, n).map(Inner::Yielded)
            }
        },
        ThreadStatus::Suspended => {
            if !state.cur().frames.is_empty() {
                // The resume arguments become the results of the call the
                // yield interrupted.
                let want = state.cur_mut().pending_want.take().unwrap_or(MULTI);
                let slot = state.top() - nargs;
                place_results(state, slot, nargs, want);
                run_thread(state)
            } else {
                // The thread body was a native that yielded directly; the
                // resume arguments are its final results.
                Ok(Inner::Done(nargs))
            }
        }
        _ => Err(Fault::runtime("cannot resume non-suspended coroutine")),
    }
}

fn run_thread(state: &mut State) -> EResult<Inner> {
    match execute(state, 0, true)? {
        Exec::Done(n) => Ok(Inner::Done(n)),
        Exec::Yielded(vals) => Ok(Inner::Yielded(vals)),
    }
}

/// Removes the call scaffolding under the top `nres` values so they start at
/// `func_slot`, then pads or truncates them to `want` results. Returns the
/// result count actually left.
fn place_results(state: &mut State, func_slot: usize, nres: usize, want: u8) -> usize {
    let th = state.cur_mut();
    let results_start = th.stack.len() - nres;
    th.stack.drain(func_slot..results_start);
    if want == MULTI {
        return nres;
    }
    th.stack.resize(func_slot + want as usize, Value::Nil);
    want as usize
}

/// Takes the top `n` yield values off the stack, drops the interrupted
/// call's scaffolding and marks the thread suspended.
fn suspend(state: &mut State, func_slot: usize, want: u8, n: usize) -> EResult<Vec<Value>> {
    let th = state.cur_mut();
    if th.stack.len() < func_slot + n {
        return Err(Fault::runtime("stack underflow"));
    }
    let split = th.stack.len() - n;
    let vals = th.stack.split_off(split);
    th.stack.truncate(func_slot);
    th.pending_want = Some(want);
    th.status = ThreadStatus::Suspended;
    Ok(vals)
}

fn begin_call(state: &mut State, nargs: usize, want: u8) -> EResult<CallStep> {
    let top = state.top();
    if top < nargs + 1 {
        return Err(Fault::runtime("call target missing from the stack"));
    }
    let func_slot = top - nargs - 1;
    let callee = state.cur().stack[func_slot].clone();
    match callee {
        Value::Function(Function::Chunk(proto)) => {
            state.enter_call()?;
            state.check_slots(proto.num_locals as usize)?;
            let base = func_slot + 1 + nargs;
            let num_locals = proto.num_locals as usize;
            let th = state.cur_mut();
            th.stack.resize(base + num_locals, Value::Nil);
            th.frames.push(Frame { proto, pc: 0, base, func_slot, want });
            Ok(CallStep::Framed)
        }
        Value::Function(Function::Native(nf)) => {
            state.enter_call()?;
            let outcome = (nf.func)(state, &nf.upvalue, nargs);
            state.leave_call();
            match outcome? {
                NativeOutcome::Return(nres) => {
                    if state.top() < func_slot + nres {
                        return Err(Fault::runtime("native function under-produced results"));
                    }
                    Ok(CallStep::Returned(place_results(state, func_slot, nres, want)))
                }
                NativeOutcome::Yield(n) => Ok(CallStep::Yielded { func_slot, want, n }),
            }
        }
        other => state.rt_error(format!("attempt to call a {} value", kind_name(&other))),
    }
}

/// Runs the current thread until its frame stack drops back to `floor`.
fn execute(state: &mut State, floor: usize, allow_yield: bool) -> EResult<Exec> {
    loop {
        let (proto, pc, base) = {
            let fr = state
                .cur()
                .frames
                .last()
                .ok_or_else(|| Fault::runtime("no active frame"))?;
            (fr.proto.clone(), fr.pc, fr.base)
        };
        let op = if pc < proto.code.len() { proto.code[pc] } else { Op::Return(0) };
        if let Some(fr) = state.cur_mut().frames.last_mut() {
            fr.pc = pc + 1;
        }
        match op {
            Op::Const(k) => {
                let v = match proto.consts.get(k as usize) {
                    Some(Constant::Integer(i)) => Value::Integer(*i),
                    Some(Constant::Number(n)) => Value::Number(*n),
                    Some(Constant::Str(s)) => Value::Str(s.clone()),
                    None => return Err(Fault::runtime("malformed chunk: bad constant")),
                };
                state.push(v)?;
            }
            Op::Nil => state.push(Value::Nil)?,
            Op::True => state.push(Value::Boolean(true))?,
            Op::False => state.push(Value::Boolean(false))?,
            Op::GetGlobal(k) => {
                let name = global_name(&proto.consts, k)?;
                let v = state.global(&name);
                state.push(v)?;
            }
            Op::SetGlobal(k) => {
                let name = global_name(&proto.consts, k)?;
                let v = state.pop()?;
                state.set_global_value(&name, v);
            }
            Op::GetLocal(i) => {
                let v = state
                    .cur()
                    .stack
                    .get(base + i as usize)
                    .cloned()
                    .ok_or_else(|| Fault::runtime("malformed chunk: bad local slot"))?;
                state.push(v)?;
            }
            Op::SetLocal(i) => {
                let v = state.pop()?;
                let slot = base + i as usize;
                let th = state.cur_mut();
                match th.stack.get_mut(slot) {
                    Some(dst) => *dst = v,
                    None => return Err(Fault::runtime("malformed chunk: bad local slot")),
                }
            }
            Op::Add | Op::Sub | Op::Mul | Op::Div | Op::Mod => arith(state, op)?,
            Op::Neg => {
                let v = state.pop()?;
                let r = match &v {
                    Value::Integer(i) => Value::Integer(i.wrapping_neg()),
                    Value::Number(n) => Value::Number(-n),
                    other => {
                        return state.rt_error(format!(
                            "attempt to perform arithmetic on a {} value",
                            kind_name(other)
                        ))
                    }
                };
                state.push(r)?;
            }
            Op::Not => {
                let v = state.pop()?;
                state.push(Value::Boolean(!v.truthy()))?;
            }
            Op::Concat => concat(state)?,
            Op::Eq | Op::Ne | Op::Lt | Op::Le | Op::Gt | Op::Ge => compare(state, op)?,
            Op::Jump(off) => branch(state, off)?,
            Op::JumpIfFalse(off) => {
                let cond = state.pop()?;
                if !cond.truthy() {
                    branch(state, off)?;
                }
            }
            Op::JumpIfFalseOrPop(off) => {
                let keep = state
                    .value(-1)
                    .map(|v| !v.truthy())
                    .ok_or_else(|| Fault::runtime("stack underflow"))?;
                if keep {
                    branch(state, off)?;
                } else {
                    state.pop()?;
                }
            }
            Op::JumpIfTrueOrPop(off) => {
                let keep = state
                    .value(-1)
                    .map(|v| v.truthy())
                    .ok_or_else(|| Fault::runtime("stack underflow"))?;
                if keep {
                    branch(state, off)?;
                } else {
                    state.pop()?;
                }
            }
            Op::Call { nargs, want } => match begin_call(state, nargs as usize, want)? {
                CallStep::Framed | CallStep::Returned(_) => {}
                CallStep::Yielded { func_slot, want, n } => {
                    if !allow_yield || state.current_thread() == state.main_thread() {
                        return yield_refused(state);
                    }
                    let vals = suspend(state, func_slot, want, n)?;
                    return Ok(Exec::Yielded(vals));
                }
            },
            Op::Return(n) => {
                let frame = state
                    .cur_mut()
                    .frames
                    .pop()
                    .ok_or_else(|| Fault::runtime("no active frame"))?;
                let nres = if n == MULTI {
                    let locals_top = frame.base + frame.proto.num_locals as usize;
                    state.top().saturating_sub(locals_top)
                } else {
                    n as usize
                };
                if state.top() < nres || state.top() - nres < frame.func_slot {
                    return Err(Fault::runtime("stack underflow"));
                }
                let actual = place_results(state, frame.func_slot, nres, frame.want);
                state.leave_call();
                if state.cur().frames.len() == floor {
                    return Ok(Exec::Done(actual));
                }
            }
            Op::Pop(n) => state.pop_n(n as usize)?,
        }
    }
}

fn global_name(consts: &[Constant], k: u32) -> EResult<Rc<str>> {
    match consts.get(k as usize) {
        Some(Constant::Str(s)) => Ok(s.clone()),
        _ => Err(Fault::runtime("malformed chunk: bad global name")),
    }
}

fn branch(state: &mut State, offset: i32) -> EResult<()> {
    let fr = state
        .cur_mut()
        .frames
        .last_mut()
        .ok_or_else(|| Fault::runtime("no active frame"))?;
    let target = fr.pc as i64 + offset as i64;
    if target < 0 {
        return Err(Fault::runtime("malformed chunk: jump out of range"));
    }
    fr.pc = target as usize;
    Ok(())
}

fn arith(state: &mut State, op: Op) -> EResult<()> {
    let b = state.pop()?;
    let a = state.pop()?;
    let v = match (&a, &b) {
        (Value::Integer(x), Value::Integer(y)) => match op {
            Op::Add => Value::Integer(x.wrapping_add(*y)),
            Op::Sub => Value::Integer(x.wrapping_sub(*y)),
            Op::Mul => Value::Integer(x.wrapping_mul(*y)),
            Op::Div => Value::Number(*x as f64 / *y as f64),
            Op::Mod => {
                if *y == 0 {
                    return state.rt_error("attempt to perform 'n%0'");
                }
                // Floored modulo: the result takes the divisor's sign.
                let r = x.wrapping_rem(*y);
                Value::Integer(if r != 0 && (r < 0) != (*y < 0) { r + *y } else { r })
            }
            _ => return Err(Fault::runtime("malformed chunk: bad arithmetic opcode")),
        },
        _ => match (a.as_number(), b.as_number()) {
            (Some(x), Some(y)) => match op {
                Op::Add => Value::Number(x + y),
                Op::Sub => Value::Number(x - y),
                Op::Mul => Value::Number(x * y),
                Op::Div => Value::Number(x / y),
                Op::Mod => Value::Number(x - (x / y).floor() * y),
                _ => return Err(Fault::runtime("malformed chunk: bad arithmetic opcode")),
            },
            _ => {
                let offender = if a.as_number().is_none() { &a } else { &b };
                return state.rt_error(format!(
                    "attempt to perform arithmetic on a {} value",
                    kind_name(offender)
                ));
            }
        },
    };
    state.push(v)
}

fn concat(state: &mut State) -> EResult<()> {
    let b = state.pop()?;
    let a = state.pop()?;
    let ok = |v: &Value| matches!(v, Value::Str(_) | Value::Integer(_) | Value::Number(_));
    if !ok(&a) || !ok(&b) {
        let offender = if ok(&a) { &b } else { &a };
        return state.rt_error(format!(
            "attempt to concatenate a {} value",
            kind_name(offender)
        ));
    }
    state.push(Value::Str(Rc::from(format!("{}{}", a, b))))
}

fn compare(state: &mut State, op: Op) -> EResult<()> {
    let b = state.pop()?;
    let a = state.pop()?;
    let result = match op {
        Op::Eq => a.raw_eq(&b),
        Op::Ne => !a.raw_eq(&b),
        _ => {
            let ord = match (&a, &b) {
                (Value::Str(x), Value::Str(y)) => x.as_ref().partial_cmp(y.as_ref()),
                _ => match (a.as_number(), b.as_number()) {
                    (Some(x), Some(y)) => x.partial_cmp(&y),
                    _ => {
                        return state.rt_error(format!(
                            "attempt to compare {} with {}",
                            kind_name(&a),
                            kind_name(&b)
                        ))
                    }
                },
            };
            // An incomparable pair (NaN) makes every order test false.
            match (op, ord) {
                (Op::Lt, Some(Ordering::Less)) => true,
                (Op::Le, Some(Ordering::Less | Ordering::Equal)) => true,
                (Op::Gt, Some(Ordering::Greater)) => true,
                (Op::Ge, Some(Ordering::Greater | Ordering::Equal)) => true,
                _ => false,
            }
        }
    };
    state.push(Value::Boolean(result))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::{NativeFunction, NativeKind};

    fn run(source: &str) -> Vec<Value> {
        let _ = env_logger::builder().is_test(true).try_init();
        let mut state = State::new();
        run_in(&mut state, source)
    }

    fn run_in(state: &mut State, source: &str) -> Vec<Value> {
        load_source(state, source, "test").unwrap();
        let n = call(state, 0, MULTI).unwrap();
        let mut out = Vec::new();
        for _ in 0..n {
            out.push(state.pop().unwrap());
        }
        out.reverse();
        out
    }

    fn push_native(
        state: &mut State,
        name: &str,
        f: impl Fn(&mut State, &Value, usize) -> EResult<NativeOutcome> + 'static,
    ) {
        state
            .push(Value::Function(Function::Native(Rc::new(NativeFunction {
                kind: NativeKind::Builtin,
                name: Rc::from(name),
                upvalue: Value::Nil,
                func: Box::new(f),
            }))))
            .unwrap();
    }

    #[test]
    fn evaluates_arithmetic() {
        assert!(matches!(run("return 1+1")[..], [Value::Integer(2)]));
        assert!(matches!(run("return 7 % 3")[..], [Value::Integer(1)]));
        assert!(matches!(run("return -7 % 3")[..], [Value::Integer(2)]));
        assert!(matches!(run("return 1 / 2")[..], [Value::Number(n)] if n == 0.5));
    }

    #[test]
    fn short_circuit_keeps_operand_value() {
        assert!(matches!(run("return nil or 3")[..], [Value::Integer(3)]));
        assert!(matches!(run("return 1 and 2")[..], [Value::Integer(2)]));
        assert!(matches!(run("return false and boom()")[..], [Value::Boolean(false)]));
    }

    #[test]
    fn while_loop_accumulates() {
        let out = run("local i = 0 local s = 0 while i < 5 do i = i + 1 s = s + i end return s");
        assert!(matches!(out[..], [Value::Integer(15)]));
    }

    #[test]
    fn globals_are_shared_across_chunks() {
        let mut state = State::new();
        run_in(&mut state, "answer = 42 return nil");
        let out = run_in(&mut state, "return answer");
        assert!(matches!(out[..], [Value::Integer(42)]));
    }

    #[test]
    fn native_call_receives_args_and_places_results() {
        let mut state = State::new();
        push_native(&mut state, "double", |st, _, nargs| {
            assert_eq!(nargs, 1);
            let v = st.pop()?;
            let n = v.as_integer().unwrap();
            st.push(Value::Integer(n * 2))?;
            Ok(NativeOutcome::Return(1))
        });
        let f = state.pop().unwrap();
        state.set_global_value("double", f);
        let out = run_in(&mut state, "return double(21)");
        assert!(matches!(out[..], [Value::Integer(42)]));
    }

    #[test]
    fn call_to_non_function_faults_and_unwinds() {
        let mut state = State::new();
        load_source(&mut state, "return missing()", "test").unwrap();
        let err = call(&mut state, 0, MULTI).unwrap_err();
        assert!(err.message.contains("attempt to call a nil value"));
        assert!(err.message.starts_with("test:1:"));
        assert!(err.trace.is_some());
        // Unwound: nothing left of the call.
        assert_eq!(state.top(), 0);
        assert!(!state.has_frames(state.main_thread()));
    }

    #[test]
    fn runtime_fault_carries_innermost_frame_first() {
        let mut state = State::new();
        load_source(&mut state, "x = 1\ny = x .. nil", "chunk").unwrap();
        let err = call(&mut state, 0, 0).unwrap_err();
        let trace = err.trace.unwrap();
        assert_eq!(trace[0].source.as_deref(), Some("chunk"));
        assert_eq!(trace[0].line, 2);
    }

    #[test]
    fn coroutine_round_trip_transfers_values() {
        let mut state = State::new();
        // Body yields its arguments once, then returns the resume arguments.
        push_native(&mut state, "body", |_, _, nargs| Ok(NativeOutcome::Yield(nargs)));
        let id = new_thread(&mut state).unwrap();
        state.pop().unwrap(); // thread value
        state.push(Value::Integer(7)).unwrap();
        assert_eq!(resume(&mut state, id, 1).unwrap(), Resume::Yield(1));
        assert!(matches!(state.pop().unwrap(), Value::Integer(7)));
        assert_eq!(state.thread_status(id), Some(ThreadStatus::Suspended));

        state.push(Value::Str(Rc::from("done"))).unwrap();
        assert_eq!(resume(&mut state, id, 1).unwrap(), Resume::Return(1));
        assert!(matches!(state.pop().unwrap(), Value::Str(s) if &*s == "done"));
        assert_eq!(state.thread_status(id), Some(ThreadStatus::Dead));
    }

    #[test]
    fn chunk_coroutine_yields_mid_loop() {
        let mut state = State::new();
        push_native(&mut state, "pause", |_, _, nargs| Ok(NativeOutcome::Yield(nargs)));
        let f = state.pop().unwrap();
        state.set_global_value("pause", f);
        load_source(
            &mut state,
            "local i = 0 while i < 3 do i = i + 1 pause(i) end return 'end'",
            "co",
        )
        .unwrap();
        let id = new_thread(&mut state).unwrap();
        state.pop().unwrap();
        for expect in 1..=3i64 {
            assert_eq!(resume(&mut state, id, 0).unwrap(), Resume::Yield(1));
            assert!(matches!(state.pop().unwrap(), Value::Integer(i) if i == expect));
        }
        assert_eq!(resume(&mut state, id, 0).unwrap(), Resume::Return(1));
        assert!(matches!(state.pop().unwrap(), Value::Str(s) if &*s == "end"));
    }

    #[test]
    fn resume_rejects_dead_and_running_threads() {
        let mut state = State::new();
        push_native(&mut state, "noop", |_, _, _| Ok(NativeOutcome::Return(0)));
        let id = new_thread(&mut state).unwrap();
        state.pop().unwrap();
        assert_eq!(resume(&mut state, id, 0).unwrap(), Resume::Return(0));
        let err = resume(&mut state, id, 0).unwrap_err();
        assert!(err.message.contains("dead coroutine"));
    }

    #[test]
    fn yield_on_main_thread_is_an_error() {
        let mut state = State::new();
        push_native(&mut state, "y", |_, _, n| Ok(NativeOutcome::Yield(n)));
        let f = state.pop().unwrap();
        state.set_global_value("y", f);
        load_source(&mut state, "y()", "test").unwrap();
        let err = call(&mut state, 0, 0).unwrap_err();
        assert!(err.message.contains("outside a coroutine"));
    }

    #[test]
    fn faulting_coroutine_dies_and_reports() {
        let mut state = State::new();
        load_source(&mut state, "return nil + 1", "bad").unwrap();
        let id = new_thread(&mut state).unwrap();
        state.pop().unwrap();
        let err = resume(&mut state, id, 0).unwrap_err();
        assert!(err.message.contains("arithmetic"));
        assert_eq!(state.thread_status(id), Some(ThreadStatus::Dead));
        // The resumer is running again with a clean stack.
        assert_eq!(state.current_thread(), state.main_thread());
        assert_eq!(state.top(), 0);
    }

    #[test]
    fn want_adjustment_pads_and_truncates() {
        let mut state = State::new();
        load_source(&mut state, "return 1, 2", "t").unwrap();
        let n = call(&mut state, 0, 3).unwrap();
        assert_eq!(n, 3);
        assert!(matches!(state.value(3), Some(Value::Nil)));
        assert!(matches!(state.value(1), Some(Value::Integer(1))));
        state.pop_n(3).unwrap();

        load_source(&mut state, "return 1, 2", "t").unwrap();
        let n = call(&mut state, 0, 1).unwrap();
        assert_eq!(n, 1);
        assert!(matches!(state.pop().unwrap(), Value::Integer(1)));
    }
}
