//! Single-pass compiler from chunk source to bytecode.
//!
//! The accepted language is the small imperative subset the embedding
//! boundary needs to exercise: literals, globals, function-scoped locals,
//! arithmetic/comparison/concat expressions with short-circuit `and`/`or`,
//! calls, `if`/`while` statements and multi-value `return`.

use std::rc::Rc;

use crate::chunk::{Constant, Op, Proto, MULTI};
use crate::error::CompileError;

#[derive(Debug, Clone, PartialEq)]
enum Tok {
    Name(String),
    Int(i64),
    Num(f64),
    Str(String),
    // Keywords.
    Local,
    Return,
    If,
    Then,
    Else,
    End,
    While,
    Do,
    True,
    False,
    Nil,
    Not,
    And,
    Or,
    // Symbols.
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    Concat,
    EqEq,
    NotEq,
    Lt,
    Le,
    Gt,
    Ge,
    Assign,
    LParen,
    RParen,
    Comma,
    Semi,
    Eof,
}

struct Lexer<'s> {
    src: &'s [u8],
    pos: usize,
    line: u32,
    source_name: String,
}

impl<'s> Lexer<'s> {
    fn new(src: &'s str, source_name: &str) -> Self {
        Lexer { src: src.as_bytes(), pos: 0, line: 1, source_name: source_name.to_string() }
    }

    fn error(&self, message: impl Into<String>) -> CompileError {
        CompileError { source_name: self.source_name.clone(), line: self.line, message: message.into() }
    }

    fn peek_byte(&self) -> Option<u8> {
        self.src.get(self.pos).copied()
    }

    fn bump(&mut self) -> Option<u8> {
        let b = self.peek_byte()?;
        self.pos += 1;
        if b == b'\n' {
            self.line += 1;
        }
        Some(b)
    }

    fn skip_trivia(&mut self) {
        loop {
            match self.peek_byte() {
                Some(b' ' | b'\t' | b'\r' | b'\n') => {
                    self.bump();
                }
                Some(b'-') if self.src.get(self.pos + 1) == Some(&b'-') => {
                    while let Some(b) = self.peek_byte() {
                        if b == b'\n' {
                            break;
                        }
                        self.bump();
                    }
                }
                _ => return,
            }
        }
    }

    fn next_token(&mut self) -> Result<(Tok, u32), CompileError> {
        self.skip_trivia();
        let line = self.line;
        let b = match self.bump() {
            Some(b) => b,
            None => return Ok((Tok::Eof, line)),
        };
        let tok = match b {
            b'+' => Tok::Plus,
            b'-' => Tok::Minus,
            b'*' => Tok::Star,
            b'/' => Tok::Slash,
            b'%' => Tok::Percent,
            b'(' => Tok::LParen,
            b')' => Tok::RParen,
            b',' => Tok::Comma,
            b';' => Tok::Semi,
            b'.' => {
                if self.peek_byte() == Some(b'.') {
                    self.bump();
                    Tok::Concat
                } else {
                    return Err(self.error("unexpected '.'"));
                }
            }
            b'=' => {
                if self.peek_byte() == Some(b'=') {
                    self.bump();
                    Tok::EqEq
                } else {
                    Tok::Assign
                }
            }
            b'~' => {
                if self.peek_byte() == Some(b'=') {
                    self.bump();
                    Tok::NotEq
                } else {
                    return Err(self.error("unexpected '~'"));
                }
            }
            b'<' => {
                if self.peek_byte() == Some(b'=') {
                    self.bump();
                    Tok::Le
                } else {
                    Tok::Lt
                }
            }
            b'>' => {
                if self.peek_byte() == Some(b'=') {
                    self.bump();
                    Tok::Ge
                } else {
                    Tok::Gt
                }
            }
            b'"' | b'\'' => self.string(b)?,
            b'0'..=b'9' => self.number(b)?,
            b'_' | b'a'..=b'z' | b'A'..=b'Z' => self.name(b),
            other => return Err(self.error(format!("unexpected character {:?}", other as char))),
        };
        Ok((tok, line))
    }

    fn string(&mut self, quote: u8) -> Result<Tok, CompileError> {
        let mut out = String::new();
        loop {
            match self.bump() {
                None | Some(b'\n') => return Err(self.error("unfinished string")),
                Some(b) if b == quote => return Ok(Tok::Str(out)),
                Some(b'\\') => {
                    let esc = self.bump().ok_or_else(|| self.error("unfinished string"))?;
                    out.push(match esc {
                        b'n' => '\n',
                        b't' => '\t',
                        b'r' => '\r',
                        b'\\' => '\\',
                        b'"' => '"',
                        b'\'' => '\'',
                        b'0' => '\0',
                        other => {
                            return Err(self.error(format!("invalid escape '\\{}'", other as char)))
                        }
                    });
                }
                Some(b) => out.push(b as char),
            }
        }
    }

    fn number(&mut self, first: u8) -> Result<Tok, CompileError> {
        let mut text = String::new();
        text.push(first as char);
        let mut is_float = false;
        while let Some(b) = self.peek_byte() {
            match b {
                b'0'..=b'9' => text.push(self.bump().unwrap() as char),
                b'.' if self.src.get(self.pos + 1) != Some(&b'.') => {
                    is_float = true;
                    text.push(self.bump().unwrap() as char);
                }
                b'e' | b'E' => {
                    is_float = true;
                    text.push(self.bump().unwrap() as char);
                    if let Some(b'+' | b'-') = self.peek_byte() {
                        text.push(self.bump().unwrap() as char);
                    }
                }
                _ => break,
            }
        }
        if is_float {
            text.parse::<f64>()
                .map(Tok::Num)
                .map_err(|_| self.error(format!("malformed number '{}'", text)))
        } else {
            text.parse::<i64>()
                .map(Tok::Int)
                .map_err(|_| self.error(format!("malformed number '{}'", text)))
        }
    }

    fn name(&mut self, first: u8) -> Tok {
        let mut text = String::new();
        text.push(first as char);
        while let Some(b) = self.peek_byte() {
            if b.is_ascii_alphanumeric() || b == b'_' {
                text.push(self.bump().unwrap() as char);
            } else {
                break;
            }
        }
        match text.as_str() {
            "local" => Tok::Local,
            "return" => Tok::Return,
            "if" => Tok::If,
            "then" => Tok::Then,
            "else" => Tok::Else,
            "end" => Tok::End,
            "while" => Tok::While,
            "do" => Tok::Do,
            "true" => Tok::True,
            "false" => Tok::False,
            "nil" => Tok::Nil,
            "not" => Tok::Not,
            "and" => Tok::And,
            "or" => Tok::Or,
            _ => Tok::Name(text),
        }
    }
}

struct Compiler<'s> {
    lexer: Lexer<'s>,
    tok: Tok,
    tok_line: u32,
    ahead: Option<(Tok, u32)>,
    source_name: Rc<str>,
    consts: Vec<Constant>,
    code: Vec<Op>,
    lines: Vec<u32>,
    locals: Vec<String>,
}

/// Compiles chunk source into a [`Proto`].
pub fn compile(source: &str, chunk_name: &str) -> Result<Proto, CompileError> {
    let mut lexer = Lexer::new(source, chunk_name);
    let (tok, tok_line) = lexer.next_token()?;
    let mut c = Compiler {
        lexer,
        tok,
        tok_line,
        ahead: None,
        source_name: Rc::from(chunk_name),
        consts: Vec::new(),
        code: Vec::new(),
        lines: Vec::new(),
        locals: Vec::new(),
    };
    c.chunk()?;
    Ok(Proto {
        source_name: c.source_name,
        num_locals: c.locals.len() as u32,
        consts: c.consts,
        code: c.code,
        lines: c.lines,
    })
}

impl<'s> Compiler<'s> {
    fn error(&self, message: impl Into<String>) -> CompileError {
        CompileError {
            source_name: self.lexer.source_name.clone(),
            line: self.tok_line,
            message: message.into(),
        }
    }

    fn advance(&mut self) -> Result<(), CompileError> {
        let next = match self.ahead.take() {
            Some(pair) => pair,
            None => self.lexer.next_token()?,
        };
        self.tok = next.0;
        self.tok_line = next.1;
        Ok(())
    }

    fn peek_ahead(&mut self) -> Result<&Tok, CompileError> {
        if self.ahead.is_none() {
            self.ahead = Some(self.lexer.next_token()?);
        }
        Ok(&self.ahead.as_ref().unwrap().0)
    }

    fn expect(&mut self, tok: Tok, what: &str) -> Result<(), CompileError> {
        if self.tok == tok {
            self.advance()
        } else {
            Err(self.error(format!("'{}' expected", what)))
        }
    }

    fn emit(&mut self, op: Op) {
        self.code.push(op);
        self.lines.push(self.tok_line);
    }

    fn konst(&mut self, c: Constant) -> u32 {
        if let Some(i) = self.consts.iter().position(|k| *k == c) {
            return i as u32;
        }
        self.consts.push(c);
        (self.consts.len() - 1) as u32
    }

    fn string_const(&mut self, s: &str) -> u32 {
        self.konst(Constant::Str(Rc::from(s)))
    }

    fn emit_jump(&mut self, op: Op) -> usize {
        self.emit(op);
        self.code.len() - 1
    }

    fn patch_jump(&mut self, at: usize) {
        let offset = (self.code.len() - at - 1) as i32;
        self.code[at] = match self.code[at] {
            Op::Jump(_) => Op::Jump(offset),
            Op::JumpIfFalse(_) => Op::JumpIfFalse(offset),
            Op::JumpIfFalseOrPop(_) => Op::JumpIfFalseOrPop(offset),
            Op::JumpIfTrueOrPop(_) => Op::JumpIfTrueOrPop(offset),
            other => other,
        };
    }

    // ---- Statements ----

    fn chunk(&mut self) -> Result<(), CompileError> {
        self.block(&[Tok::Eof])?;
        if self.tok != Tok::Eof {
            return Err(self.error("unexpected trailing input"));
        }
        // Implicit empty return for chunks that fall off the end; a chunk
        // closed by an explicit return already ends in one.
        if !matches!(self.code.last(), Some(Op::Return(_))) {
            self.emit(Op::Return(0));
        }
        Ok(())
    }

    /// Compiles statements until one of `until` is the current token.
    fn block(&mut self, until: &[Tok]) -> Result<(), CompileError> {
        loop {
            while self.tok == Tok::Semi {
                self.advance()?;
            }
            if until.contains(&self.tok) {
                return Ok(());
            }
            match &self.tok {
                Tok::Eof => return Err(self.error("unexpected end of chunk")),
                Tok::Local => self.local_stat()?,
                Tok::Return => {
                    self.return_stat(until)?;
                    return Ok(());
                }
                Tok::If => self.if_stat()?,
                Tok::While => self.while_stat()?,
                Tok::Name(_) => {
                    if *self.peek_ahead()? == Tok::Assign {
                        self.assign_stat()?;
                    } else {
                        // Expression statement; result discarded.
                        self.expression()?;
                        self.emit(Op::Pop(1));
                    }
                }
                _ => {
                    // Expression statement; result discarded.
                    self.expression()?;
                    self.emit(Op::Pop(1));
                }
            }
        }
    }

    fn local_stat(&mut self) -> Result<(), CompileError> {
        self.advance()?;
        let name = match &self.tok {
            Tok::Name(n) => n.clone(),
            _ => return Err(self.error("name expected after 'local'")),
        };
        self.advance()?;
        self.expect(Tok::Assign, "=")?;
        self.expression()?;
        let slot = self.locals.len() as u32;
        self.locals.push(name);
        self.emit(Op::SetLocal(slot));
        Ok(())
    }

    fn assign_stat(&mut self) -> Result<(), CompileError> {
        let name = match &self.tok {
            Tok::Name(n) => n.clone(),
            _ => unreachable!("assign_stat entered without a name"),
        };
        self.advance()?;
        self.expect(Tok::Assign, "=")?;
        self.expression()?;
        if let Some(slot) = self.locals.iter().rposition(|l| *l == name) {
            self.emit(Op::SetLocal(slot as u32));
        } else {
            let k = self.string_const(&name);
            self.emit(Op::SetGlobal(k));
        }
        Ok(())
    }

    fn if_stat(&mut self) -> Result<(), CompileError> {
        self.advance()?;
        self.expression()?;
        self.expect(Tok::Then, "then")?;
        let jump_else = self.emit_jump(Op::JumpIfFalse(0));
        self.block(&[Tok::Else, Tok::End])?;
        if self.tok == Tok::Else {
            let jump_end = self.emit_jump(Op::Jump(0));
            self.patch_jump(jump_else);
            self.advance()?;
            self.block(&[Tok::End])?;
            self.patch_jump(jump_end);
        } else {
            self.patch_jump(jump_else);
        }
        self.expect(Tok::End, "end")
    }

    fn while_stat(&mut self) -> Result<(), CompileError> {
        self.advance()?;
        let loop_top = self.code.len();
        self.expression()?;
        self.expect(Tok::Do, "do")?;
        let jump_out = self.emit_jump(Op::JumpIfFalse(0));
        self.block(&[Tok::End])?;
        let back = -((self.code.len() - loop_top + 1) as i32);
        self.emit(Op::Jump(back));
        self.patch_jump(jump_out);
        self.expect(Tok::End, "end")
    }

    fn return_stat(&mut self, until: &[Tok]) -> Result<(), CompileError> {
        self.advance()?;
        let mut n: u8 = 0;
        let mut multi = false;
        if !(until.contains(&self.tok) || self.tok == Tok::Semi) {
            loop {
                let is_last_call = self.expression()?;
                n = n
                    .checked_add(1)
                    .ok_or_else(|| self.error("too many return values"))?;
                if self.tok == Tok::Comma {
                    self.advance()?;
                } else {
                    // A call in tail position forwards all of its results.
                    if is_last_call {
                        if let Some(Op::Call { nargs, .. }) = self.code.last().copied() {
                            let at = self.code.len() - 1;
                            self.code[at] = Op::Call { nargs, want: MULTI };
                            multi = true;
                        }
                    }
                    break;
                }
            }
        }
        while self.tok == Tok::Semi {
            self.advance()?;
        }
        if !until.contains(&self.tok) {
            return Err(self.error("'return' must end a block"));
        }
        self.emit(if multi { Op::Return(MULTI) } else { Op::Return(n) });
        Ok(())
    }

    // ---- Expressions ----
    // Returns whether the expression was exactly a function call (which makes
    // it eligible for multi-value expansion in tail position).

    fn expression(&mut self) -> Result<bool, CompileError> {
        self.or_expr()
    }

    fn or_expr(&mut self) -> Result<bool, CompileError> {
        let mut is_call = self.and_expr()?;
        while self.tok == Tok::Or {
            self.advance()?;
            let jump = self.emit_jump(Op::JumpIfTrueOrPop(0));
            self.and_expr()?;
            self.patch_jump(jump);
            is_call = false;
        }
        Ok(is_call)
    }

    fn and_expr(&mut self) -> Result<bool, CompileError> {
        let mut is_call = self.cmp_expr()?;
        while self.tok == Tok::And {
            self.advance()?;
            let jump = self.emit_jump(Op::JumpIfFalseOrPop(0));
            self.cmp_expr()?;
            self.patch_jump(jump);
            is_call = false;
        }
        Ok(is_call)
    }

    fn cmp_expr(&mut self) -> Result<bool, CompileError> {
        let mut is_call = self.concat_expr()?;
        loop {
            let op = match self.tok {
                Tok::EqEq => Op::Eq,
                Tok::NotEq => Op::Ne,
                Tok::Lt => Op::Lt,
                Tok::Le => Op::Le,
                Tok::Gt => Op::Gt,
                Tok::Ge => Op::Ge,
                _ => return Ok(is_call),
            };
            self.advance()?;
            self.concat_expr()?;
            self.emit(op);
            is_call = false;
        }
    }

    fn concat_expr(&mut self) -> Result<bool, CompileError> {
        let is_call = self.add_expr()?;
        if self.tok == Tok::Concat {
            self.advance()?;
            // Right associative.
            self.concat_expr()?;
            self.emit(Op::Concat);
            return Ok(false);
        }
        Ok(is_call)
    }

    fn add_expr(&mut self) -> Result<bool, CompileError> {
        let mut is_call = self.mul_expr()?;
        loop {
            let op = match self.tok {
                Tok::Plus => Op::Add,
                Tok::Minus => Op::Sub,
                _ => return Ok(is_call),
            };
            self.advance()?;
            self.mul_expr()?;
            self.emit(op);
            is_call = false;
        }
    }

    fn mul_expr(&mut self) -> Result<bool, CompileError> {
        let mut is_call = self.unary_expr()?;
        loop {
            let op = match self.tok {
                Tok::Star => Op::Mul,
                Tok::Slash => Op::Div,
                Tok::Percent => Op::Mod,
                _ => return Ok(is_call),
            };
            self.advance()?;
            self.unary_expr()?;
            self.emit(op);
            is_call = false;
        }
    }

    fn unary_expr(&mut self) -> Result<bool, CompileError> {
        match self.tok {
            Tok::Minus => {
                self.advance()?;
                self.unary_expr()?;
                self.emit(Op::Neg);
                Ok(false)
            }
            Tok::Not => {
                self.advance()?;
                self.unary_expr()?;
                self.emit(Op::Not);
                Ok(false)
            }
            _ => self.primary_expr(),
        }
    }

    fn primary_expr(&mut self) -> Result<bool, CompileError> {
        let mut is_call = false;
        match self.tok.clone() {
            Tok::Int(i) => {
                let k = self.konst(Constant::Integer(i));
                self.emit(Op::Const(k));
                self.advance()?;
            }
            Tok::Num(n) => {
                let k = self.konst(Constant::Number(n));
                self.emit(Op::Const(k));
                self.advance()?;
            }
            Tok::Str(s) => {
                let k = self.string_const(&s);
                self.emit(Op::Const(k));
                self.advance()?;
            }
            Tok::True => {
                self.emit(Op::True);
                self.advance()?;
            }
            Tok::False => {
                self.emit(Op::False);
                self.advance()?;
            }
            Tok::Nil => {
                self.emit(Op::Nil);
                self.advance()?;
            }
            Tok::LParen => {
                self.advance()?;
                self.expression()?;
                self.expect(Tok::RParen, ")")?;
            }
            Tok::Name(name) => {
                if let Some(slot) = self.locals.iter().rposition(|l| *l == name) {
                    self.emit(Op::GetLocal(slot as u32));
                } else {
                    let k = self.string_const(&name);
                    self.emit(Op::GetGlobal(k));
                }
                self.advance()?;
            }
            _ => return Err(self.error("unexpected symbol")),
        }
        // Call suffixes.
        while self.tok == Tok::LParen {
            self.advance()?;
            let mut nargs: u8 = 0;
            if self.tok != Tok::RParen {
                loop {
                    self.expression()?;
                    nargs = nargs
                        .checked_add(1)
                        .ok_or_else(|| self.error("too many arguments"))?;
                    if self.tok == Tok::Comma {
                        self.advance()?;
                    } else {
                        break;
                    }
                }
            }
            self.expect(Tok::RParen, ")")?;
            self.emit(Op::Call { nargs, want: 1 });
            is_call = true;
        }
        Ok(is_call)
    }
}
