//! The engine's built-in library bundles.
//!
//! Bundles install plain global functions; which bundles a state gets is
//! entirely up to the embedder.

use std::rc::Rc;

use crate::error::EResult;
use crate::state::State;
use crate::value::{Function, NativeFunction, NativeKind, NativeOutcome, Value};

/// A bundle of built-in functions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Library {
    Base,
    Math,
    Str,
    Coroutine,
}

impl Library {
    pub const ALL: [Library; 4] = [Library::Base, Library::Math, Library::Str, Library::Coroutine];

    pub fn name(self) -> &'static str {
        match self {
            Library::Base => "base",
            Library::Math => "math",
            Library::Str => "string",
            Library::Coroutine => "coroutine",
        }
    }

    pub fn from_name(name: &str) -> Option<Library> {
        Library::ALL.into_iter().find(|l| l.name() == name)
    }

    /// Installs the bundle's functions as globals.
    pub fn open(self, state: &mut State) {
        match self {
            Library::Base => {
                install(state, "print", print);
                install(state, "tostring", tostring);
                install(state, "type", type_of);
                install(state, "error", raise);
                install(state, "assert", check);
            }
            Library::Math => {
                install(state, "abs", abs);
                install(state, "floor", floor);
                install(state, "max", max);
            }
            Library::Str => {
                install(state, "len", len);
                install(state, "sub", sub);
                install(state, "upper", upper);
            }
            Library::Coroutine => {
                install(state, "yield", yield_values);
            }
        }
    }
}

fn install(
    state: &mut State,
    name: &str,
    f: fn(&mut State, usize) -> EResult<NativeOutcome>,
) {
    let func = NativeFunction {
        kind: NativeKind::Builtin,
        name: Rc::from(name),
        upvalue: Value::Nil,
        func: Box::new(move |st, _, nargs| f(st, nargs)),
    };
    state.set_global_value(name, Value::Function(Function::Native(Rc::new(func))));
}

/// Pops the call's arguments off the stack in call order.
fn take_args(state: &mut State, nargs: usize) -> EResult<Vec<Value>> {
    let mut args = Vec::with_capacity(nargs);
    for _ in 0..nargs {
        args.push(state.pop()?);
    }
    args.reverse();
    Ok(args)
}

fn bad_arg<T>(state: &State, index: usize, func: &str, expected: &str, got: &Value) -> EResult<T> {
    let got = match got {
        Value::Nil => "no value".to_string(),
        other => format!("{:?}", other.kind()).to_lowercase(),
    };
    state.rt_error(format!(
        "bad argument #{} to '{}' ({} expected, got {})",
        index, func, expected, got
    ))
}

fn print(state: &mut State, nargs: usize) -> EResult<NativeOutcome> {
    let args = take_args(state, nargs)?;
    let line = args
        .iter()
        .map(|v| v.to_string())
        .collect::<Vec<_>>()
        .join("\t");
    println!("{}", line);
    Ok(NativeOutcome::Return(0))
}

fn tostring(state: &mut State, nargs: usize) -> EResult<NativeOutcome> {
    let args = take_args(state, nargs)?;
    let v = args.first().cloned().unwrap_or(Value::Nil);
    state.push(Value::Str(Rc::from(v.to_string())))?;
    Ok(NativeOutcome::Return(1))
}

fn type_of(state: &mut State, nargs: usize) -> EResult<NativeOutcome> {
    let args = take_args(state, nargs)?;
    let name = match args.first() {
        Some(Value::Nil) | None => "nil",
        Some(Value::Boolean(_)) => "boolean",
        Some(Value::Integer(_) | Value::Number(_)) => "number",
        Some(Value::Str(_)) => "string",
        Some(Value::Function(_)) => "function",
        Some(Value::Foreign(_)) => "foreign",
        Some(Value::Thread(_)) => "thread",
    };
    state.push(Value::Str(Rc::from(name)))?;
    Ok(NativeOutcome::Return(1))
}

fn raise(state: &mut State, nargs: usize) -> EResult<NativeOutcome> {
    let args = take_args(state, nargs)?;
    let message = match args.first() {
        Some(Value::Str(s)) => format!("{}{}", state.where_prefix(), s),
        Some(other) => other.to_string(),
        None => format!("{}nil", state.where_prefix()),
    };
    Err(crate::error::Fault::runtime(message))
}

fn check(state: &mut State, nargs: usize) -> EResult<NativeOutcome> {
    let args = take_args(state, nargs)?;
    match args.first() {
        Some(v) if v.truthy() => {
            let n = args.len();
            for a in args {
                state.push(a)?;
            }
            Ok(NativeOutcome::Return(n))
        }
        _ => {
            let message = match args.get(1) {
                Some(Value::Str(s)) => s.to_string(),
                Some(other) => other.to_string(),
                None => "assertion failed!".to_string(),
            };
            state.rt_error(message)
        }
    }
}

fn abs(state: &mut State, nargs: usize) -> EResult<NativeOutcome> {
    let args = take_args(state, nargs)?;
    let r = match args.first() {
        Some(Value::Integer(i)) => Value::Integer(i.wrapping_abs()),
        Some(Value::Number(n)) => Value::Number(n.abs()),
        other => return bad_arg(state, 1, "abs", "number", other.unwrap_or(&Value::Nil)),
    };
    state.push(r)?;
    Ok(NativeOutcome::Return(1))
}

fn floor(state: &mut State, nargs: usize) -> EResult<NativeOutcome> {
    let args = take_args(state, nargs)?;
    let r = match args.first() {
        Some(Value::Integer(i)) => Value::Integer(*i),
        Some(Value::Number(n)) => Value::Integer(n.floor() as i64),
        other => return bad_arg(state, 1, "floor", "number", other.unwrap_or(&Value::Nil)),
    };
    state.push(r)?;
    Ok(NativeOutcome::Return(1))
}

fn max(state: &mut State, nargs: usize) -> EResult<NativeOutcome> {
    let args = take_args(state, nargs)?;
    if args.is_empty() {
        return bad_arg(state, 1, "max", "number", &Value::Nil);
    }
    let mut best = args[0].clone();
    let mut best_n = match best.as_number() {
        Some(n) => n,
        None => return bad_arg(state, 1, "max", "number", &best),
    };
    for (i, v) in args.iter().enumerate().skip(1) {
        match v.as_number() {
            Some(n) if n > best_n => {
                best_n = n;
                best = v.clone();
            }
            Some(_) => {}
            None => return bad_arg(state, i + 1, "max", "number", v),
        }
    }
    state.push(best)?;
    Ok(NativeOutcome::Return(1))
}

fn string_arg<'a>(
    state: &State,
    args: &'a [Value],
    index: usize,
    func: &str,
) -> EResult<&'a Rc<str>> {
    match args.get(index - 1) {
        Some(Value::Str(s)) => Ok(s),
        other => bad_arg(state, index, func, "string", other.unwrap_or(&Value::Nil)),
    }
}

fn len(state: &mut State, nargs: usize) -> EResult<NativeOutcome> {
    let args = take_args(state, nargs)?;
    let s = string_arg(state, &args, 1, "len")?;
    let n = s.chars().count() as i64;
    state.push(Value::Integer(n))?;
    Ok(NativeOutcome::Return(1))
}

fn sub(state: &mut State, nargs: usize) -> EResult<NativeOutcome> {
    let args = take_args(state, nargs)?;
    let s = string_arg(state, &args, 1, "sub")?.clone();
    let chars: Vec<char> = s.chars().collect();
    let n = chars.len() as i64;
    let pick = |v: Option<&Value>, default: i64| -> Option<i64> {
        match v {
            None => Some(default),
            Some(v) => v.as_integer(),
        }
    };
    let i = match pick(args.get(1), 1) {
        Some(i) => i,
        None => return bad_arg(state, 2, "sub", "number", &args[1]),
    };
    let j = match pick(args.get(2), -1) {
        Some(j) => j,
        None => return bad_arg(state, 3, "sub", "number", &args[2]),
    };
    // 1-based inclusive range; negative counts from the end.
    let from = if i < 0 { (n + i + 1).max(1) } else { i.max(1) };
    let to = if j < 0 { n + j + 1 } else { j.min(n) };
    let out: String = if from > to {
        String::new()
    } else {
        chars[(from - 1) as usize..to as usize].iter().collect()
    };
    state.push(Value::Str(Rc::from(out)))?;
    Ok(NativeOutcome::Return(1))
}

fn upper(state: &mut State, nargs: usize) -> EResult<NativeOutcome> {
    let args = take_args(state, nargs)?;
    let s = string_arg(state, &args, 1, "upper")?;
    state.push(Value::Str(Rc::from(s.to_uppercase())))?;
    Ok(NativeOutcome::Return(1))
}

fn yield_values(_state: &mut State, nargs: usize) -> EResult<NativeOutcome> {
    Ok(NativeOutcome::Yield(nargs))
}
