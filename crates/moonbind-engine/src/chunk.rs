use std::rc::Rc;

/// Constants referenced by bytecode.
#[derive(Debug, Clone, PartialEq)]
pub enum Constant {
    Integer(i64),
    Number(f64),
    Str(Rc<str>),
}

/// Sentinel operand meaning "all available values" for calls and returns.
pub const MULTI: u8 = u8::MAX;

/// The bytecode instruction set.
///
/// Operands that index constants or locals are u32 slots; jump offsets are
/// relative to the instruction following the jump.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Op {
    /// Push constant `k`.
    Const(u32),
    Nil,
    True,
    False,
    /// Push the global named by string constant `k`.
    GetGlobal(u32),
    /// Pop a value into the global named by string constant `k`.
    SetGlobal(u32),
    /// Push local slot `i`.
    GetLocal(u32),
    /// Pop into local slot `i`.
    SetLocal(u32),
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Neg,
    Not,
    Concat,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Jump(i32),
    /// Pop the condition; jump when it is falsy.
    JumpIfFalse(i32),
    /// Short-circuit `and`: keep the value and jump when falsy, else pop.
    JumpIfFalseOrPop(i32),
    /// Short-circuit `or`: keep the value and jump when truthy, else pop.
    JumpIfTrueOrPop(i32),
    /// Call with `nargs` fixed arguments; `want` results (MULTI = all).
    Call { nargs: u8, want: u8 },
    /// Return the top `n` values (MULTI = everything above the locals).
    Return(u8),
    Pop(u8),
}

/// A compiled chunk: the unit of load, dump and execution.
///
/// Chunks take no declared parameters; a chunk invoked with arguments simply
/// leaves them below its local area.
#[derive(Debug, Clone, PartialEq)]
pub struct Proto {
    pub source_name: Rc<str>,
    pub num_locals: u32,
    pub consts: Vec<Constant>,
    pub code: Vec<Op>,
    /// Source line of each instruction, parallel to `code`.
    pub lines: Vec<u32>,
}

impl Proto {
    /// Source line for a frame whose saved pc points at the *next*
    /// instruction, as the run loop keeps it.
    pub fn line_at(&self, pc: usize) -> u32 {
        let idx = pc.saturating_sub(1).min(self.lines.len().saturating_sub(1));
        self.lines.get(idx).copied().unwrap_or(0)
    }
}
