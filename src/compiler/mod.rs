//! Single-pass Pratt compiler from tokens to register bytecode.
//!
//! There is no syntax tree. Every production writes its value into an
//! advisory destination register and reports whether that value came from
//! an addressable load ([`Operand`]), which is how assignment and the
//! increment operators find their target.

use std::mem;
use std::rc::Rc;

mod scope;

use scope::FunctionState;

use crate::bytecode::{Chunk, Instruction, Op};
use crate::error::{Result, ScriptError};
use crate::lexer::{Lexer, Token, TokenKind, normalize_newlines};
use crate::value::{Function, Value};

/// Statement results land here; falling off the end returns it.
const RESULT: i32 = 2;

/// Admits a single primary expression.
const PRIMARY: u16 = 300;
/// Floor for nested expressions; statement keywords are refused at or above it.
const EXPR: u16 = 5;
const COMMA: u16 = 10;
const ASSIGN: u16 = 20;
const TERNARY: u16 = 30;
const UNARY: u16 = 190;
const LOGICAL_NOT: u16 = 189;
const CONVERT: u16 = 195;

type Pos = (u32, u32);

/// Where the value of the expression just compiled came from.
#[derive(Debug, Clone, Copy, PartialEq)]
enum Operand {
    /// Computed into the destination register; not assignable.
    Temp,
    /// Copied out of a local register by the instruction at `at`.
    Local { slot: i32, at: usize },
    /// Loaded by the `Dot` at `at` from `recv[key]`.
    Member { recv: i32, key: i32, at: usize },
    /// A self-terminating statement (`if`, loops, blocks, declarations).
    Done,
}

fn left_power(kind: &TokenKind) -> u16 {
    use TokenKind::*;
    match kind {
        Comma | Arrow => COMMA,
        Assign | AddAssign | SubAssign | MulAssign | DivAssign | IntDivAssign | ModAssign
        | BitAndAssign | BitOrAssign | BitXorAssign | ShlAssign | ShrAssign | AndAssign
        | OrAssign => ASSIGN,
        Question => TERNARY,
        Instanceof => 40,
        Or => 50,
        And => 60,
        BitOr => 70,
        BitXor => 80,
        BitAnd => 90,
        Eq | NotEq | StrictEq | StrictNotEq => 100,
        Lt | Gt | Le | Ge => 110,
        Shl | Shr => 120,
        Add | Sub => 130,
        Mul | Div | Mod | IntDiv => 140,
        Inc | Dec => UNARY,
        LBracket | Dot | LParen => 200,
        _ => 0,
    }
}

fn binary_op(kind: &TokenKind) -> Option<Op> {
    use TokenKind::*;
    let op = match kind {
        BitOr => Op::BitOr,
        BitXor => Op::BitXor,
        BitAnd => Op::BitAnd,
        Eq => Op::Eq,
        NotEq => Op::NotEq,
        StrictEq => Op::StrictEq,
        StrictNotEq => Op::StrictNotEq,
        Lt => Op::Lt,
        Gt => Op::Gt,
        Le => Op::Le,
        Ge => Op::Ge,
        Shl => Op::Shl,
        Shr => Op::Shr,
        Add => Op::Add,
        Sub => Op::Sub,
        Mul => Op::Mul,
        Div => Op::Div,
        Mod => Op::Mod,
        IntDiv => Op::IntDiv,
        Instanceof => Op::InstanceOf,
        _ => return None,
    };
    Some(op)
}

fn compound_op(kind: &TokenKind) -> Option<Op> {
    use TokenKind::*;
    let op = match kind {
        AddAssign => Op::Add,
        SubAssign => Op::Sub,
        MulAssign => Op::Mul,
        DivAssign => Op::Div,
        IntDivAssign => Op::IntDiv,
        ModAssign => Op::Mod,
        BitAndAssign => Op::BitAnd,
        BitOrAssign => Op::BitOr,
        BitXorAssign => Op::BitXor,
        ShlAssign => Op::Shl,
        ShrAssign => Op::Shr,
        AndAssign => Op::And,
        OrAssign => Op::Or,
        _ => return None,
    };
    Some(op)
}

fn is_statement(kind: &TokenKind) -> bool {
    use TokenKind::*;
    matches!(kind, If | While | Do | For | LBrace | Var | Return | Break | Continue)
}

fn syntax(pos: Pos, message: impl Into<String>) -> ScriptError {
    ScriptError::syntax(message, pos.0, pos.1)
}

/// Compiles a whole program. Any error aborts the compilation.
pub fn compile(source: &str) -> Result<Chunk> {
    let source = normalize_newlines(source);
    let chunk = Compiler::new(&source).program().inspect_err(|e| {
        tracing::debug!(error = %e, "compilation failed");
    })?;
    tracing::debug!(
        source_len = source.len(),
        instructions = chunk.code.len(),
        constants = chunk.constants.len(),
        "compiled script"
    );
    Ok(chunk)
}

struct Compiler<'src> {
    lexer: Lexer<'src>,
    current: FunctionState,
    enclosing: Vec<FunctionState>,
    pos: Pos,
}

impl<'src> Compiler<'src> {
    fn new(source: &'src str) -> Self {
        Compiler { lexer: Lexer::new(source), current: FunctionState::script(), enclosing: Vec::new(), pos: (1, 1) }
    }

    fn program(mut self) -> Result<Chunk> {
        loop {
            let token = self.next()?;
            match token.kind {
                TokenKind::End => break,
                TokenKind::RBrace => return Err(syntax((token.line, token.col), "unexpected `}`")),
                _ => {
                    self.lexer.push_back(token);
                    self.statement()?;
                }
            }
        }
        self.emit(Op::Return, RESULT, 0, 0);
        Ok(self.current.chunk)
    }

    // ── Token plumbing ───────────────────────────────────────────────

    fn next(&mut self) -> Result<Token> {
        let token = self.lexer.next_token()?;
        self.pos = (token.line, token.col);
        Ok(token)
    }

    fn expect(&mut self, expected: TokenKind) -> Result<Token> {
        let token = self.next()?;
        if token.kind == expected {
            Ok(token)
        } else {
            Err(syntax((token.line, token.col), format!("expected `{expected}` but found {}", token.kind)))
        }
    }

    /// Peeks for the end of a statement without consuming it.
    fn at_terminator(&mut self) -> Result<bool> {
        let token = self.next()?;
        let done = matches!(token.kind, TokenKind::Semicolon | TokenKind::RBrace | TokenKind::End);
        self.lexer.push_back(token);
        Ok(done)
    }

    // ── Emission ─────────────────────────────────────────────────────

    fn emit_at(&mut self, pos: Pos, op: Op, a: i32, b: i32, c: i32) -> usize {
        self.current.chunk.emit(Instruction { op, a, b, c, line: pos.0, col: pos.1 })
    }

    fn emit(&mut self, op: Op, a: i32, b: i32, c: i32) -> usize {
        self.emit_at(self.pos, op, a, b, c)
    }

    fn here(&self) -> usize {
        self.current.chunk.code.len()
    }

    fn patch(&mut self, at: usize, target: usize) {
        self.current.chunk.patch_jump(at, target);
    }

    fn constant(&mut self, value: Value) -> i32 {
        self.current.chunk.add_const(value)
    }

    fn nop(&mut self, at: usize) {
        self.current.chunk.code[at].op = Op::Nop;
    }

    /// Redirects the member load at `at` into a register clear of every
    /// operand, returning that register.
    fn retarget(&mut self, at: usize, dest: i32, recv: i32, key: i32) -> i32 {
        let t = dest.max(recv).max(key) + 1;
        self.current.chunk.code[at].a = t;
        self.current.chunk.reserve(t + 1);
        t
    }

    fn enter_function(&mut self, state: FunctionState) {
        let outer = mem::replace(&mut self.current, state);
        self.enclosing.push(outer);
    }

    fn leave_function(&mut self) -> FunctionState {
        let outer = self.enclosing.pop().unwrap_or_else(FunctionState::script);
        mem::replace(&mut self.current, outer)
    }

    // ── Pratt core ───────────────────────────────────────────────────

    fn parse(&mut self, rbp: u16, dest: i32) -> Result<Operand> {
        let token = self.next()?;
        self.parse_from(token, rbp, dest)
    }

    fn parse_from(&mut self, token: Token, rbp: u16, dest: i32) -> Result<Operand> {
        let mut left = self.nud(token, rbp, dest)?;
        if left == Operand::Done {
            return Ok(left);
        }
        loop {
            let token = self.next()?;
            if left_power(&token.kind) <= rbp {
                self.lexer.push_back(token);
                return Ok(left);
            }
            left = self.led(token, left, dest)?;
        }
    }

    fn nud(&mut self, token: Token, rbp: u16, dest: i32) -> Result<Operand> {
        let Token { kind, line, col } = token;
        let pos = (line, col);
        if is_statement(&kind) && rbp >= EXPR {
            return Err(syntax(pos, format!("`{kind}` cannot be used inside an expression")));
        }
        match kind {
            TokenKind::Number(n) => {
                let k = self.constant(Value::Number(n));
                self.emit_at(pos, Op::LoadConst, dest, k, 0);
                Ok(Operand::Temp)
            }
            TokenKind::Str(s) => {
                let k = self.constant(Value::from(s));
                self.emit_at(pos, Op::LoadConst, dest, k, 0);
                Ok(Operand::Temp)
            }
            TokenKind::Ident(name) => Ok(self.load_name(&name, dest, pos)),
            TokenKind::True => {
                self.emit_at(pos, Op::LoadTrue, dest, 0, 0);
                Ok(Operand::Temp)
            }
            TokenKind::False => {
                self.emit_at(pos, Op::LoadFalse, dest, 0, 0);
                Ok(Operand::Temp)
            }
            TokenKind::This => {
                self.emit_at(pos, Op::Copy, dest, 1, 0);
                Ok(Operand::Temp)
            }
            TokenKind::Global => {
                self.emit_at(pos, Op::LoadGlobal, dest, 0, 0);
                Ok(Operand::Temp)
            }
            TokenKind::LParen => self.paren(dest),
            TokenKind::LBracket => self.array_literal(dest, pos),
            TokenKind::DictOpen => self.dict_literal(dest, pos),
            TokenKind::Function => self.function(rbp, dest, pos),
            TokenKind::New => self.new_instance(dest, pos),

            TokenKind::Sub => self.unary(Op::Negate, UNARY, dest, pos),
            TokenKind::Add => self.unary(Op::ToNumber, UNARY, dest, pos),
            TokenKind::Not => self.unary(Op::Not, LOGICAL_NOT, dest, pos),
            TokenKind::BitNot => self.unary(Op::BitNot, LOGICAL_NOT, dest, pos),
            TokenKind::Typeof => self.unary(Op::TypeOf, CONVERT, dest, pos),
            TokenKind::Hash => self.unary(Op::Char, CONVERT, dest, pos),
            TokenKind::Dollar => self.unary(Op::StrOf, CONVERT, dest, pos),
            TokenKind::Int => self.unary(Op::ToInt, CONVERT, dest, pos),
            TokenKind::Real => self.unary(Op::ToReal, CONVERT, dest, pos),
            TokenKind::String => self.unary(Op::ToStr, CONVERT, dest, pos),
            TokenKind::Inc => self.pre_step(Op::Inc, dest, pos),
            TokenKind::Dec => self.pre_step(Op::Dec, dest, pos),
            TokenKind::Delete => self.delete(dest, pos),

            TokenKind::If => self.if_statement(dest),
            TokenKind::While => self.while_statement(dest),
            TokenKind::Do => self.do_statement(dest),
            TokenKind::For => self.for_statement(dest),
            TokenKind::LBrace => self.block(),
            TokenKind::Var => self.var_statement(dest),
            TokenKind::Return => self.return_statement(dest, pos),
            TokenKind::Break => self.jump_out(true, pos),
            TokenKind::Continue => self.jump_out(false, pos),

            TokenKind::Switch | TokenKind::Case | TokenKind::Default | TokenKind::Class | TokenKind::Super => {
                Err(syntax(pos, format!("`{kind}` is not supported")))
            }
            other => Err(syntax(pos, format!("unexpected {other}"))),
        }
    }

    fn led(&mut self, token: Token, left: Operand, dest: i32) -> Result<Operand> {
        let pos = (token.line, token.col);
        let power = left_power(&token.kind);
        if let Some(op) = binary_op(&token.kind) {
            self.parse(power, dest + 1)?;
            self.emit_at(pos, op, dest, dest, dest + 1);
            return Ok(Operand::Temp);
        }
        if token.kind == TokenKind::Assign {
            return self.assign(left, None, dest, pos);
        }
        if let Some(op) = compound_op(&token.kind) {
            return self.assign(left, Some(op), dest, pos);
        }
        match token.kind {
            TokenKind::Comma => self.parse(COMMA, dest),
            TokenKind::Question => self.ternary(dest, pos),
            TokenKind::And => self.short_circuit(Op::JumpFalse, Op::And, Op::LoadFalse, power, dest, pos),
            TokenKind::Or => self.short_circuit(Op::JumpTrue, Op::Or, Op::LoadTrue, power, dest, pos),
            TokenKind::Inc => self.post_step(left, Op::PostInc, dest, pos),
            TokenKind::Dec => self.post_step(left, Op::PostDec, dest, pos),
            TokenKind::Dot => {
                let name = self.next()?;
                let TokenKind::Ident(name) = name.kind else {
                    return Err(syntax((name.line, name.col), format!("expected member name but found {}", name.kind)));
                };
                let k = self.constant(Value::from(name));
                self.emit_at(pos, Op::LoadConst, dest + 1, k, 0);
                let at = self.emit_at(pos, Op::Dot, dest, dest, dest + 1);
                Ok(Operand::Member { recv: dest, key: dest + 1, at })
            }
            TokenKind::LBracket => {
                self.parse(EXPR, dest + 1)?;
                self.expect(TokenKind::RBracket)?;
                let at = self.emit_at(pos, Op::Dot, dest, dest, dest + 1);
                Ok(Operand::Member { recv: dest, key: dest + 1, at })
            }
            TokenKind::LParen => {
                let end = self.arguments(dest + 1)?;
                self.emit(Op::Call, dest, dest + 1, end);
                Ok(Operand::Temp)
            }
            other => Err(syntax(pos, format!("unexpected {other}"))),
        }
    }

    // ── Expressions ──────────────────────────────────────────────────

    /// Locals read their register; everything else goes through the
    /// activation closure in register 0.
    fn load_name(&mut self, name: &str, dest: i32, pos: Pos) -> Operand {
        if let Some(slot) = self.current.resolve(name) {
            let at = self.emit_at(pos, Op::Copy, dest, slot, 0);
            return Operand::Local { slot, at };
        }
        let k = self.constant(Value::from(name));
        if self.enclosing.iter().any(|f| f.resolve(name).is_some()) {
            self.emit_at(pos, Op::CaptureUpvalue, k, 0, 0);
        }
        self.emit_at(pos, Op::LoadConst, dest, k, 0);
        let at = self.emit_at(pos, Op::Dot, dest, 0, dest);
        Operand::Member { recv: 0, key: dest, at }
    }

    fn unary(&mut self, op: Op, rbp: u16, dest: i32, pos: Pos) -> Result<Operand> {
        self.parse(rbp, dest)?;
        self.emit_at(pos, op, dest, dest, 0);
        Ok(Operand::Temp)
    }

    /// `( expr )`, or a `(int)` / `(real)` / `(string)` cast.
    fn paren(&mut self, dest: i32) -> Result<Operand> {
        let first = self.next()?;
        let cast = match first.kind {
            TokenKind::Int => Some(Op::ToInt),
            TokenKind::Real => Some(Op::ToReal),
            TokenKind::String => Some(Op::ToStr),
            _ => None,
        };
        if let Some(op) = cast {
            let second = self.next()?;
            if second.kind == TokenKind::RParen {
                self.parse(CONVERT, dest)?;
                self.emit_at((first.line, first.col), op, dest, dest, 0);
                return Ok(Operand::Temp);
            }
            self.lexer.push_back(second);
        }
        let inner = self.parse_from(first, EXPR, dest)?;
        self.expect(TokenKind::RParen)?;
        Ok(inner)
    }

    /// Parses `a, b, ...)` into consecutive registers from `first`;
    /// returns one past the last.
    fn arguments(&mut self, first: i32) -> Result<i32> {
        let mut reg = first;
        let token = self.next()?;
        if token.kind == TokenKind::RParen {
            return Ok(reg);
        }
        self.lexer.push_back(token);
        loop {
            self.parse(COMMA, reg)?;
            reg += 1;
            let token = self.next()?;
            match token.kind {
                TokenKind::Comma => continue,
                TokenKind::RParen => return Ok(reg),
                other => return Err(syntax((token.line, token.col), format!("expected `,` or `)` but found {other}"))),
            }
        }
    }

    fn array_literal(&mut self, dest: i32, pos: Pos) -> Result<Operand> {
        let mut reg = dest + 1;
        loop {
            let token = self.next()?;
            match token.kind {
                TokenKind::RBracket => break,
                TokenKind::Comma => {
                    self.emit(Op::LoadVoid, reg, 0, 0);
                    reg += 1;
                    continue;
                }
                _ => {}
            }
            self.parse_from(token, COMMA, reg)?;
            reg += 1;
            let token = self.next()?;
            match token.kind {
                TokenKind::Comma => {}
                TokenKind::RBracket => break,
                other => return Err(syntax((token.line, token.col), format!("expected `,` or `]` but found {other}"))),
            }
        }
        self.emit_at(pos, Op::MakeArray, dest, dest + 1, reg);
        Ok(Operand::Temp)
    }

    /// `%[ name: value, key => value ]`
    fn dict_literal(&mut self, dest: i32, pos: Pos) -> Result<Operand> {
        let mut reg = dest + 1;
        loop {
            let token = self.next()?;
            if token.kind == TokenKind::RBracket {
                break;
            }
            let mut labelled = false;
            if let TokenKind::Ident(name) = &token.kind {
                let after = self.next()?;
                if after.kind == TokenKind::Colon {
                    let k = self.constant(Value::from(name.as_str()));
                    self.emit(Op::LoadConst, reg, k, 0);
                    labelled = true;
                } else {
                    self.lexer.push_back(after);
                }
            }
            if !labelled {
                self.parse_from(token, COMMA, reg)?;
                let sep = self.next()?;
                if !matches!(sep.kind, TokenKind::Arrow | TokenKind::Colon) {
                    return Err(syntax((sep.line, sep.col), format!("expected `=>` but found {}", sep.kind)));
                }
            }
            self.parse(COMMA, reg + 1)?;
            reg += 2;
            let token = self.next()?;
            match token.kind {
                TokenKind::Comma => {}
                TokenKind::RBracket => break,
                other => return Err(syntax((token.line, token.col), format!("expected `,` or `]` but found {other}"))),
            }
        }
        self.emit_at(pos, Op::MakeDict, dest, dest + 1, reg);
        Ok(Operand::Temp)
    }

    fn new_instance(&mut self, dest: i32, pos: Pos) -> Result<Operand> {
        let token = self.next()?;
        let mut fallback = match &token.kind {
            TokenKind::Ident(name) => self.constant(Value::from(name.as_str())),
            _ => -1,
        };
        self.parse_from(token, PRIMARY, dest)?;
        loop {
            let token = self.next()?;
            if token.kind != TokenKind::Dot {
                self.lexer.push_back(token);
                break;
            }
            self.led(token, Operand::Temp, dest)?;
            fallback = -1;
        }
        self.emit_at(pos, Op::New, dest, dest, fallback);
        let token = self.next()?;
        let end = if token.kind == TokenKind::LParen {
            self.arguments(dest + 1)?
        } else {
            self.lexer.push_back(token);
            dest + 1
        };
        self.emit_at(pos, Op::Call, dest, dest + 1, end);
        Ok(Operand::Temp)
    }

    fn assign(&mut self, left: Operand, op: Option<Op>, dest: i32, pos: Pos) -> Result<Operand> {
        match (left, op) {
            (Operand::Local { slot, at }, None) => {
                self.nop(at);
                self.parse(ASSIGN - 1, dest)?;
                self.emit_at(pos, Op::Copy, slot, dest, 0);
            }
            (Operand::Local { slot, .. }, Some(op)) => {
                self.parse(ASSIGN - 1, dest + 1)?;
                self.emit_at(pos, op, dest, dest, dest + 1);
                self.emit_at(pos, Op::Copy, slot, dest, 0);
            }
            (Operand::Member { recv, key, at }, None) => {
                self.nop(at);
                let t = dest.max(recv).max(key) + 1;
                self.parse(ASSIGN - 1, t)?;
                self.emit_at(pos, Op::DotSet, recv, key, t);
                self.emit_at(pos, Op::Copy, dest, t, 0);
            }
            (Operand::Member { recv, key, at }, Some(op)) => {
                let t = self.retarget(at, dest, recv, key);
                self.parse(ASSIGN - 1, t + 1)?;
                self.emit_at(pos, op, t, t, t + 1);
                self.emit_at(pos, Op::DotSet, recv, key, t);
                self.emit_at(pos, Op::Copy, dest, t, 0);
            }
            _ => return Err(syntax(pos, "operand must be a variable")),
        }
        Ok(Operand::Temp)
    }

    fn pre_step(&mut self, op: Op, dest: i32, pos: Pos) -> Result<Operand> {
        match self.parse(UNARY, dest)? {
            Operand::Local { slot, at } => {
                self.nop(at);
                self.emit_at(pos, op, dest, slot, 0);
            }
            Operand::Member { recv, key, at } => {
                let t = self.retarget(at, dest, recv, key);
                self.emit_at(pos, op, t, t, 0);
                self.emit_at(pos, Op::DotSet, recv, key, t);
                self.emit_at(pos, Op::Copy, dest, t, 0);
            }
            _ => return Err(syntax(pos, "operand must be a variable")),
        }
        Ok(Operand::Temp)
    }

    fn post_step(&mut self, left: Operand, op: Op, dest: i32, pos: Pos) -> Result<Operand> {
        match left {
            Operand::Local { slot, at } => {
                self.nop(at);
                self.emit_at(pos, op, dest, slot, 0);
            }
            Operand::Member { recv, key, at } => {
                let t = self.retarget(at, dest, recv, key);
                self.emit_at(pos, op, t + 1, t, 0);
                self.emit_at(pos, Op::DotSet, recv, key, t);
                self.emit_at(pos, Op::Copy, dest, t + 1, 0);
            }
            _ => return Err(syntax(pos, "operand must be a variable")),
        }
        Ok(Operand::Temp)
    }

    fn delete(&mut self, dest: i32, pos: Pos) -> Result<Operand> {
        match self.parse(CONVERT, dest)? {
            Operand::Local { slot, at } => {
                self.nop(at);
                self.emit_at(pos, Op::LoadVoid, slot, 0, 0);
            }
            Operand::Member { recv, key, at } => {
                self.current.chunk.code[at] = Instruction { op: Op::Delete, a: recv, b: key, c: 0, line: pos.0, col: pos.1 };
            }
            _ => return Err(syntax(pos, "operand must be a variable")),
        }
        self.emit_at(pos, Op::LoadVoid, dest, 0, 0);
        Ok(Operand::Temp)
    }

    fn ternary(&mut self, dest: i32, pos: Pos) -> Result<Operand> {
        let skip = self.emit_at(pos, Op::JumpFalse, dest, 0, 0);
        self.parse(COMMA, dest)?;
        self.expect(TokenKind::Colon)?;
        let exit = self.emit_at(pos, Op::Jump, 0, 0, 0);
        let otherwise = self.here();
        self.patch(skip, otherwise);
        self.parse(TERNARY - 1, dest)?;
        let end = self.here();
        self.patch(exit, end);
        Ok(Operand::Temp)
    }

    /// `a && b` / `a || b`: `b` runs only when `a` does not decide.
    fn short_circuit(&mut self, jump: Op, op: Op, decided: Op, power: u16, dest: i32, pos: Pos) -> Result<Operand> {
        let skip = self.emit_at(pos, jump, dest, 0, 0);
        self.parse(power, dest + 1)?;
        self.emit_at(pos, op, dest, dest, dest + 1);
        let exit = self.emit_at(pos, Op::Jump, 0, 0, 0);
        let shortcut = self.here();
        self.patch(skip, shortcut);
        self.emit_at(pos, decided, dest, 0, 0);
        let end = self.here();
        self.patch(exit, end);
        Ok(Operand::Temp)
    }

    // ── Functions ────────────────────────────────────────────────────

    fn function(&mut self, rbp: u16, dest: i32, pos: Pos) -> Result<Operand> {
        let first = self.next()?;
        let (name, token) = match first.kind {
            TokenKind::Ident(name) => (Some(name), self.next()?),
            kind => (None, Token { kind, line: first.line, col: first.col }),
        };
        if token.kind != TokenKind::LParen {
            return Err(syntax((token.line, token.col), format!("expected `(` but found {}", token.kind)));
        }

        // Defaults are evaluated here, in the defining frame.
        let mut params: Vec<String> = Vec::new();
        let mut seen_default = false;
        let mut token = self.next()?;
        if token.kind != TokenKind::RParen {
            loop {
                let param_pos = (token.line, token.col);
                let TokenKind::Ident(param) = token.kind else {
                    return Err(syntax(param_pos, format!("expected parameter name but found {}", token.kind)));
                };
                if params.contains(&param) {
                    return Err(syntax(param_pos, format!("duplicate parameter name `{param}`")));
                }
                let reg = dest + 1 + params.len() as i32;
                let mut after = self.next()?;
                if after.kind == TokenKind::Assign {
                    self.parse(COMMA, reg)?;
                    seen_default = true;
                    after = self.next()?;
                } else if seen_default {
                    return Err(syntax(param_pos, "default parameters must be placed last"));
                } else {
                    self.emit_at(param_pos, Op::LoadVoid, reg, 0, 0);
                }
                params.push(param);
                match after.kind {
                    TokenKind::Comma => token = self.next()?,
                    TokenKind::RParen => break,
                    other => {
                        return Err(syntax((after.line, after.col), format!("expected `,` or `)` but found {other}")));
                    }
                }
            }
        }

        let slot = match &name {
            Some(n) if !self.current.is_global_level() => Some(self.current.declare(n)),
            _ => None,
        };

        self.enter_function(FunctionState::function(name.clone(), &params));
        let body = self.function_body(&params);
        let inner = self.leave_function();
        body?;

        let count = params.len() as i32;
        let k = self.constant(Value::function(Function::script(Rc::new(inner.chunk))));
        self.emit_at(pos, Op::LoadConst, dest, k, 0);
        self.emit_at(pos, Op::MakeFunc, dest, dest + 1, dest + 1 + count);
        self.emit_at(pos, Op::BindClosure, dest, 0, 0);

        let Some(name) = name else {
            return Ok(Operand::Temp);
        };
        let kn = self.constant(Value::from(name));
        match slot {
            Some(slot) => {
                self.emit_at(pos, Op::RegisterLocal, slot, kn, 0);
                self.emit_at(pos, Op::Copy, slot, dest, 0);
            }
            None => {
                self.emit_at(pos, Op::LoadConst, dest + 1, kn, 0);
                self.emit_at(pos, Op::DotSet, 0, dest + 1, dest);
            }
        }
        Ok(if rbp == 0 { Operand::Done } else { Operand::Temp })
    }

    fn function_body(&mut self, params: &[String]) -> Result<()> {
        for (i, param) in params.iter().enumerate() {
            let k = self.constant(Value::from(param.as_str()));
            self.emit(Op::RegisterLocal, -(i as i32) - 1, k, 0);
        }
        self.expect(TokenKind::LBrace)?;
        self.block_body()?;
        self.emit(Op::Return, RESULT, 0, 0);
        Ok(())
    }

    // ── Statements ───────────────────────────────────────────────────

    fn statement(&mut self) -> Result<()> {
        let token = self.next()?;
        match token.kind {
            TokenKind::Semicolon => return Ok(()),
            TokenKind::RBrace | TokenKind::End => {
                self.lexer.push_back(token);
                return Ok(());
            }
            _ => {}
        }
        if self.parse_from(token, 0, RESULT)? == Operand::Done {
            return Ok(());
        }
        let token = self.next()?;
        match token.kind {
            TokenKind::Semicolon => Ok(()),
            TokenKind::RBrace | TokenKind::End => {
                self.lexer.push_back(token);
                Ok(())
            }
            other => Err(syntax((token.line, token.col), format!("expected `;` but found {other}"))),
        }
    }

    /// Statements up to and including the closing `}`.
    fn block_body(&mut self) -> Result<()> {
        loop {
            let token = self.next()?;
            match token.kind {
                TokenKind::RBrace => return Ok(()),
                TokenKind::End => return Err(syntax((token.line, token.col), "expected `}` but found end of input")),
                _ => {
                    self.lexer.push_back(token);
                    self.statement()?;
                }
            }
        }
    }

    fn block(&mut self) -> Result<Operand> {
        self.current.push_scope();
        self.block_body()?;
        self.current.pop_scope();
        Ok(Operand::Done)
    }

    fn condition(&mut self, dest: i32) -> Result<()> {
        self.expect(TokenKind::LParen)?;
        self.parse(EXPR, dest)?;
        self.expect(TokenKind::RParen)?;
        Ok(())
    }

    fn if_statement(&mut self, dest: i32) -> Result<Operand> {
        self.condition(dest)?;
        let skip = self.emit(Op::JumpFalse, dest, 0, 0);
        self.statement()?;
        let token = self.next()?;
        if token.kind == TokenKind::Else {
            let exit = self.emit(Op::Jump, 0, 0, 0);
            let otherwise = self.here();
            self.patch(skip, otherwise);
            self.statement()?;
            let end = self.here();
            self.patch(exit, end);
        } else {
            self.lexer.push_back(token);
            let end = self.here();
            self.patch(skip, end);
        }
        Ok(Operand::Done)
    }

    fn close_loop(&mut self, end: usize, resume: usize) {
        let labels = self.current.pop_loop();
        for at in labels.breaks {
            self.patch(at, end);
        }
        for at in labels.continues {
            self.patch(at, resume);
        }
    }

    fn while_statement(&mut self, dest: i32) -> Result<Operand> {
        let top = self.here();
        self.condition(dest)?;
        let exit = self.emit(Op::JumpFalse, dest, 0, 0);
        self.current.push_loop();
        self.statement()?;
        self.emit(Op::Jump, top as i32, 0, 0);
        let end = self.here();
        self.patch(exit, end);
        self.close_loop(end, top);
        Ok(Operand::Done)
    }

    fn do_statement(&mut self, dest: i32) -> Result<Operand> {
        let top = self.here();
        self.current.push_loop();
        self.statement()?;
        self.expect(TokenKind::While)?;
        let check = self.here();
        self.condition(dest)?;
        self.emit(Op::JumpTrue, dest, top as i32, 0);
        let end = self.here();
        self.close_loop(end, check);
        Ok(Operand::Temp)
    }

    /// Layout: init; top: cond; JF end; J body; step: ...; J top; body: ...; J step; end:
    fn for_statement(&mut self, dest: i32) -> Result<Operand> {
        self.expect(TokenKind::LParen)?;
        self.current.push_scope();

        let token = self.next()?;
        match token.kind {
            TokenKind::Var => {
                self.var_statement(dest)?;
                self.expect(TokenKind::Semicolon)?;
            }
            TokenKind::Semicolon => {}
            _ => {
                self.parse_from(token, EXPR, dest)?;
                self.expect(TokenKind::Semicolon)?;
            }
        }

        let top = self.here();
        let token = self.next()?;
        let exit = if token.kind == TokenKind::Semicolon {
            None
        } else {
            self.parse_from(token, EXPR, dest)?;
            self.expect(TokenKind::Semicolon)?;
            Some(self.emit(Op::JumpFalse, dest, 0, 0))
        };
        let to_body = self.emit(Op::Jump, 0, 0, 0);

        let step = self.here();
        let token = self.next()?;
        if token.kind != TokenKind::RParen {
            self.parse_from(token, EXPR, dest)?;
            self.expect(TokenKind::RParen)?;
        }
        self.emit(Op::Jump, top as i32, 0, 0);

        let body = self.here();
        self.patch(to_body, body);
        self.current.push_loop();
        self.statement()?;
        self.emit(Op::Jump, step as i32, 0, 0);
        let end = self.here();
        if let Some(exit) = exit {
            self.patch(exit, end);
        }
        self.close_loop(end, step);
        self.current.pop_scope();
        Ok(Operand::Done)
    }

    fn var_statement(&mut self, dest: i32) -> Result<Operand> {
        loop {
            let token = self.next()?;
            let pos = (token.line, token.col);
            let TokenKind::Ident(name) = token.kind else {
                return Err(syntax(pos, format!("expected variable name but found {}", token.kind)));
            };
            let k = self.constant(Value::from(name.as_str()));
            let slot = if self.current.is_global_level() {
                None
            } else {
                let slot = self.current.declare(&name);
                self.emit_at(pos, Op::RegisterLocal, slot, k, 0);
                Some(slot)
            };

            let mut token = self.next()?;
            if token.kind == TokenKind::Assign {
                self.parse(COMMA, dest)?;
                match slot {
                    Some(slot) => {
                        self.emit_at(pos, Op::Copy, slot, dest, 0);
                    }
                    None => {
                        self.emit_at(pos, Op::LoadConst, dest + 1, k, 0);
                        self.emit_at(pos, Op::DotSet, 0, dest + 1, dest);
                    }
                }
                token = self.next()?;
            } else {
                match slot {
                    Some(slot) => {
                        self.emit_at(pos, Op::LoadVoid, slot, 0, 0);
                    }
                    None => {
                        self.emit_at(pos, Op::LoadConst, dest, k, 0);
                        self.emit_at(pos, Op::DotSetVoid, 0, dest, 0);
                    }
                }
            }

            match token.kind {
                TokenKind::Comma => continue,
                TokenKind::Semicolon | TokenKind::RBrace | TokenKind::End => {
                    self.lexer.push_back(token);
                    return Ok(Operand::Temp);
                }
                other => return Err(syntax((token.line, token.col), format!("expected `;` but found {other}"))),
            }
        }
    }

    fn return_statement(&mut self, dest: i32, pos: Pos) -> Result<Operand> {
        if self.at_terminator()? {
            self.emit_at(pos, Op::ReturnVoid, 0, 0, 0);
        } else {
            self.parse(EXPR, dest)?;
            self.emit_at(pos, Op::Return, dest, 0, 0);
        }
        Ok(Operand::Temp)
    }

    fn jump_out(&mut self, is_break: bool, pos: Pos) -> Result<Operand> {
        if self.current.current_loop().is_none() {
            let word = if is_break { "break" } else { "continue" };
            return Err(syntax(pos, format!("`{word}` outside of a loop")));
        }
        let at = self.emit_at(pos, Op::Jump, 0, 0, 0);
        if let Some(labels) = self.current.current_loop() {
            if is_break {
                labels.breaks.push(at);
            } else {
                labels.continues.push(at);
            }
        }
        Ok(Operand::Temp)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    fn ops(source: &str) -> Vec<Op> {
        compile(source).unwrap().code.iter().map(|i| i.op).collect()
    }

    fn syntax_error(source: &str) -> ScriptError {
        let err = compile(source).unwrap_err();
        assert_eq!(err.kind, ErrorKind::Syntax, "{err}");
        err
    }

    #[test]
    fn global_assignment_becomes_member_store() {
        let ops = ops("x = 1;");
        assert!(ops.contains(&Op::DotSet), "{ops:?}");
        assert!(!ops.contains(&Op::Dot), "load should be rewritten away: {ops:?}");
    }

    #[test]
    fn compound_member_assignment_keeps_the_load() {
        let chunk = compile("a.b += 2;").unwrap();
        let dots: Vec<_> = chunk.code.iter().filter(|i| i.op == Op::Dot).collect();
        // global `a` plus the retargeted `a.b`
        assert_eq!(dots.len(), 2);
        let set = chunk.code.iter().find(|i| i.op == Op::DotSet).unwrap();
        let member_load = dots[1];
        assert_eq!(member_load.a, set.c);
        assert!(set.c > set.a && set.c > set.b, "value register must clear receiver and key");
    }

    #[test]
    fn local_assignment_copies_into_slot() {
        let chunk = compile("function f(a) { a = 3; }").unwrap();
        let inner = chunk.constants.iter().find_map(|k| k.as_script_chunk()).unwrap();
        assert!(inner.code.iter().any(|i| i.op == Op::Copy && i.a == -1));
        assert!(inner.code.iter().any(|i| i.op == Op::Nop));
    }

    #[test]
    fn jump_targets_are_absolute() {
        let chunk = compile("while (x) { y; }").unwrap();
        let jf = chunk.code.iter().find(|i| i.op == Op::JumpFalse).unwrap();
        let back = chunk.code.iter().rev().find(|i| i.op == Op::Jump).unwrap();
        assert_eq!(back.a, 0);
        assert_eq!(chunk.code[jf.b as usize - 1].op, Op::Jump);
    }

    #[test]
    fn function_declarations_bind_globally_at_script_level() {
        let ops = ops("function f() { return 1; }");
        assert_eq!(&ops[..3], &[Op::LoadConst, Op::MakeFunc, Op::BindClosure]);
        assert!(ops.contains(&Op::DotSet));
    }

    #[test]
    fn nested_function_captures_upvalue() {
        let chunk = compile("function outer() { var x = 1; function inner() { return x; } }").unwrap();
        let outer = chunk.constants.iter().find_map(|k| k.as_script_chunk()).unwrap();
        let inner = outer.constants.iter().find_map(|k| k.as_script_chunk()).unwrap();
        assert!(inner.code.iter().any(|i| i.op == Op::CaptureUpvalue));
        assert!(outer.code.iter().any(|i| i.op == Op::RegisterLocal));
    }

    #[test]
    fn cast_uses_lookahead() {
        assert!(ops("(int)x;").contains(&Op::ToInt));
        assert!(ops("(int x);").contains(&Op::ToInt));
        assert!(ops("(string)1;").contains(&Op::ToStr));
    }

    #[test]
    fn literal_registers_are_contiguous() {
        let chunk = compile("[1, , 3];").unwrap();
        let make = chunk.code.iter().find(|i| i.op == Op::MakeArray).unwrap();
        assert_eq!((make.a, make.b, make.c), (2, 3, 6));
        let chunk = compile("%[a: 1, \"b\" => 2];").unwrap();
        let make = chunk.code.iter().find(|i| i.op == Op::MakeDict).unwrap();
        assert_eq!(make.c - make.b, 4);
    }

    #[test]
    fn statement_keyword_inside_expression() {
        let err = syntax_error("a + if (b) c;");
        assert!(err.message.contains("cannot be used inside an expression"), "{}", err.message);
    }

    #[test]
    fn parameter_errors() {
        assert!(syntax_error("function f(a, a) {}").message.contains("duplicate parameter"));
        assert!(syntax_error("function f(a = 1, b) {}").message.contains("placed last"));
    }

    #[test]
    fn invalid_targets_and_jumps() {
        assert_eq!(syntax_error("1 = 2;").message, "operand must be a variable");
        assert_eq!(syntax_error("x++ = 1;").message, "operand must be a variable");
        assert!(syntax_error("break;").message.contains("outside of a loop"));
        assert!(syntax_error("function f() { while (1) {} continue; }").message.contains("outside of a loop"));
    }

    #[test]
    fn unsupported_constructs() {
        assert!(syntax_error("switch (x) {}").message.contains("not supported"));
        assert!(syntax_error("class A {}").message.contains("not supported"));
    }

    #[test]
    fn block_structure_errors() {
        let err = syntax_error("}");
        assert_eq!(err.trace[0].line, 1);
        syntax_error("{ x = 1;");
        syntax_error("x = 1 y = 2;");
    }

    #[test]
    fn error_positions_point_at_token() {
        let err = syntax_error("x = 1;\n  y = ;");
        assert_eq!((err.trace[0].line, err.trace[0].col), (2, 7));
    }

    #[test]
    fn lexical_errors_pass_through() {
        let err = compile("x = \"open").unwrap_err();
        assert_eq!(err.kind, ErrorKind::Lexical);
    }

    #[test]
    fn empty_statements_and_program() {
        assert_eq!(ops(""), vec![Op::Return]);
        assert_eq!(ops(";;;"), vec![Op::Return]);
    }
}
