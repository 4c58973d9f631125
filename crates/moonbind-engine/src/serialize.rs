//! Binary chunk format: dumping compiled chunks and loading them back,
//! through embedder-supplied block streams.

use std::rc::Rc;

use crate::chunk::{Constant, Op, Proto};
use crate::error::{EResult, Fault, StreamFailure};
use crate::state::State;
use crate::value::{Function, Value};

/// Leading bytes of a binary chunk. The escape prefix keeps binary chunks
/// from ever parsing as source text.
pub const SIGNATURE: [u8; 4] = *b"\x1bMBC";

const FORMAT_VERSION: u8 = 1;

/// Maximum number of bytes handed to a sink per block, and the granularity
/// sources are expected to produce.
pub const STREAM_BLOCK: usize = 1024;

/// What kinds of chunk a load accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkMode {
    Text,
    Binary,
    Either,
}

impl ChunkMode {
    /// Parses the conventional mode string: `"t"`, `"b"` or `"bt"`.
    pub fn parse(mode: &str) -> Option<ChunkMode> {
        match mode {
            "t" => Some(ChunkMode::Text),
            "b" => Some(ChunkMode::Binary),
            "bt" | "tb" => Some(ChunkMode::Either),
            _ => None,
        }
    }

    fn allows_binary(self) -> bool {
        matches!(self, ChunkMode::Binary | ChunkMode::Either)
    }

    fn allows_text(self) -> bool {
        matches!(self, ChunkMode::Text | ChunkMode::Either)
    }
}

/// Producer of chunk bytes for a load. Blocks may be any size; an empty or
/// `None` block ends the stream.
pub trait ChunkSource {
    fn read_block(&mut self) -> Result<Option<Vec<u8>>, StreamFailure>;
}

/// Consumer of chunk bytes for a dump. Receives blocks of at most
/// [`STREAM_BLOCK`] bytes.
pub trait ChunkSink {
    fn write_block(&mut self, block: &[u8]) -> Result<(), StreamFailure>;
}

/// Loads a chunk from `source` and pushes the resulting function.
///
/// Binary input is recognised by [`SIGNATURE`]; everything else is treated
/// as source text. Input of a kind `mode` excludes is a syntax fault, and a
/// failing source aborts the load with its error as the fault payload.
pub fn load(
    state: &mut State,
    source: &mut dyn ChunkSource,
    chunk_name: &str,
    mode: ChunkMode,
) -> EResult<()> {
    let mut bytes = Vec::new();
    loop {
        match source.read_block().map_err(|e| e.into_fault("chunk read"))? {
            Some(block) if !block.is_empty() => bytes.extend_from_slice(&block),
            _ => break,
        }
    }
    if bytes.starts_with(&SIGNATURE) {
        if !mode.allows_binary() {
            return Err(Fault::syntax("attempt to load a binary chunk (mode is 'text')"));
        }
        let proto = decode(&bytes)?;
        state.check_slots(1)?;
        state.push(Value::Function(Function::Chunk(Rc::new(proto))))
    } else {
        if !mode.allows_text() {
            return Err(Fault::syntax("attempt to load a text chunk (mode is 'binary')"));
        }
        let text = std::str::from_utf8(&bytes)
            .map_err(|_| Fault::syntax("chunk source is not valid UTF-8"))?;
        crate::vm::load_source(state, text, chunk_name)
    }
}

/// Dumps the chunk function at the top of the stack into `sink` as blocks of
/// at most [`STREAM_BLOCK`] bytes. The function stays on the stack.
pub fn dump(state: &mut State, sink: &mut dyn ChunkSink) -> EResult<()> {
    let proto = match state.value(-1) {
        Some(Value::Function(Function::Chunk(p))) => p.clone(),
        Some(Value::Function(Function::Native(_))) => {
            return Err(Fault::runtime("unable to dump a native function"))
        }
        _ => return Err(Fault::runtime("function expected at the top of the stack")),
    };
    let bytes = encode(&proto);
    for block in bytes.chunks(STREAM_BLOCK) {
        sink.write_block(block).map_err(|e| e.into_fault("chunk write"))?;
    }
    Ok(())
}

// ---- Encoding ----

fn encode(proto: &Proto) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&SIGNATURE);
    out.push(FORMAT_VERSION);
    put_str(&mut out, &proto.source_name);
    put_u32(&mut out, proto.num_locals);
    put_u32(&mut out, proto.consts.len() as u32);
    for c in &proto.consts {
        match c {
            Constant::Integer(i) => {
                out.push(0);
                out.extend_from_slice(&i.to_le_bytes());
            }
            Constant::Number(n) => {
                out.push(1);
                out.extend_from_slice(&n.to_bits().to_le_bytes());
            }
            Constant::Str(s) => {
                out.push(2);
                put_str(&mut out, s);
            }
        }
    }
    put_u32(&mut out, proto.code.len() as u32);
    for op in &proto.code {
        encode_op(&mut out, *op);
    }
    for line in &proto.lines {
        put_u32(&mut out, *line);
    }
    out
}

fn put_u32(out: &mut Vec<u8>, v: u32) {
    out.extend_from_slice(&v.to_le_bytes());
}

fn put_str(out: &mut Vec<u8>, s: &str) {
    put_u32(out, s.len() as u32);
    out.extend_from_slice(s.as_bytes());
}

fn encode_op(out: &mut Vec<u8>, op: Op) {
    match op {
        Op::Const(k) => {
            out.push(0);
            put_u32(out, k);
        }
        Op::Nil => out.push(1),
        Op::True => out.push(2),
        Op::False => out.push(3),
        Op::GetGlobal(k) => {
            out.push(4);
            put_u32(out, k);
        }
        Op::SetGlobal(k) => {
            out.push(5);
            put_u32(out, k);
        }
        Op::GetLocal(i) => {
            out.push(6);
            put_u32(out, i);
        }
        Op::SetLocal(i) => {
            out.push(7);
            put_u32(out, i);
        }
        Op::Add => out.push(8),
        Op::Sub => out.push(9),
        Op::Mul => out.push(10),
        Op::Div => out.push(11),
        Op::Mod => out.push(12),
        Op::Neg => out.push(13),
        Op::Not => out.push(14),
        Op::Concat => out.push(15),
        Op::Eq => out.push(16),
        Op::Ne => out.push(17),
        Op::Lt => out.push(18),
        Op::Le => out.push(19),
        Op::Gt => out.push(20),
        Op::Ge => out.push(21),
        Op::Jump(o) => {
            out.push(22);
            put_u32(out, o as u32);
        }
        Op::JumpIfFalse(o) => {
            out.push(23);
            put_u32(out, o as u32);
        }
        Op::JumpIfFalseOrPop(o) => {
            out.push(24);
            put_u32(out, o as u32);
        }
        Op::JumpIfTrueOrPop(o) => {
            out.push(25);
            put_u32(out, o as u32);
        }
        Op::Call { nargs, want } => {
            out.push(26);
            out.push(nargs);
            out.push(want);
        }
        Op::Return(n) => {
            out.push(27);
            out.push(n);
        }
        Op::Pop(n) => {
            out.push(28);
            out.push(n);
        }
    }
}

// ---- Decoding ----

struct Cursor<'b> {
    bytes: &'b [u8],
    pos: usize,
}

impl<'b> Cursor<'b> {
    fn truncated() -> Fault {
        Fault::syntax("binary chunk is truncated")
    }

    fn take(&mut self, n: usize) -> EResult<&'b [u8]> {
        let end = self.pos.checked_add(n).ok_or_else(Self::truncated)?;
        if end > self.bytes.len() {
            return Err(Self::truncated());
        }
        let s = &self.bytes[self.pos..end];
        self.pos = end;
        Ok(s)
    }

    fn u8(&mut self) -> EResult<u8> {
        Ok(self.take(1)?[0])
    }

    fn u32(&mut self) -> EResult<u32> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn i64(&mut self) -> EResult<i64> {
        let b = self.take(8)?;
        let mut buf = [0u8; 8];
        buf.copy_from_slice(b);
        Ok(i64::from_le_bytes(buf))
    }

    fn str(&mut self) -> EResult<Rc<str>> {
        let len = self.u32()? as usize;
        let bytes = self.take(len)?;
        std::str::from_utf8(bytes)
            .map(Rc::from)
            .map_err(|_| Fault::syntax("binary chunk has a malformed string"))
    }
}

fn decode(bytes: &[u8]) -> EResult<Proto> {
    let mut c = Cursor { bytes, pos: SIGNATURE.len() };
    if c.u8()? != FORMAT_VERSION {
        return Err(Fault::syntax("binary chunk has an unsupported format version"));
    }
    let source_name = c.str()?;
    let num_locals = c.u32()?;
    let nconsts = c.u32()? as usize;
    let mut consts = Vec::with_capacity(nconsts.min(1 << 16));
    for _ in 0..nconsts {
        consts.push(match c.u8()? {
            0 => Constant::Integer(c.i64()?),
            1 => Constant::Number(f64::from_bits(c.i64()? as u64)),
            2 => Constant::Str(c.str()?),
            _ => return Err(Fault::syntax("binary chunk has an unknown constant tag")),
        });
    }
    let ncode = c.u32()? as usize;
    let mut code = Vec::with_capacity(ncode.min(1 << 16));
    for _ in 0..ncode {
        code.push(decode_op(&mut c)?);
    }
    let mut lines = Vec::with_capacity(ncode.min(1 << 16));
    for _ in 0..ncode {
        lines.push(c.u32()?);
    }
    if c.pos != bytes.len() {
        return Err(Fault::syntax("binary chunk has trailing bytes"));
    }
    Ok(Proto { source_name, num_locals, consts, code, lines })
}

fn decode_op(c: &mut Cursor<'_>) -> EResult<Op> {
    Ok(match c.u8()? {
        0 => Op::Const(c.u32()?),
        1 => Op::Nil,
        2 => Op::True,
        3 => Op::False,
        4 => Op::GetGlobal(c.u32()?),
        5 => Op::SetGlobal(c.u32()?),
        6 => Op::GetLocal(c.u32()?),
        7 => Op::SetLocal(c.u32()?),
        8 => Op::Add,
        9 => Op::Sub,
        10 => Op::Mul,
        11 => Op::Div,
        12 => Op::Mod,
        13 => Op::Neg,
        14 => Op::Not,
        15 => Op::Concat,
        16 => Op::Eq,
        17 => Op::Ne,
        18 => Op::Lt,
        19 => Op::Le,
        20 => Op::Gt,
        21 => Op::Ge,
        22 => Op::Jump(c.u32()? as i32),
        23 => Op::JumpIfFalse(c.u32()? as i32),
        24 => Op::JumpIfFalseOrPop(c.u32()? as i32),
        25 => Op::JumpIfTrueOrPop(c.u32()? as i32),
        26 => Op::Call { nargs: c.u8()?, want: c.u8()? },
        27 => Op::Return(c.u8()?),
        28 => Op::Pop(c.u8()?),
        _ => return Err(Fault::syntax("binary chunk has an unknown opcode")),
    })
}
