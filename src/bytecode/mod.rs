use std::fmt;

use crate::value::Value;

// ── Opcodes ──────────────────────────────────────────────────────────
//
// Every instruction carries three i32 operands (a, b, c). Unless noted,
// operands are register numbers relative to the frame base: 0 is the
// activation closure, 1 is `this`, 2 is the statement result register,
// negatives are named locals and parameters.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    // R[a] = R[b] <op> R[c]
    BitAnd,
    BitOr,
    BitXor,
    Sub,
    Add,
    Mod,
    Div,
    IntDiv,
    Mul,
    And,
    Or,
    Shl,
    Shr,
    Eq,
    StrictEq,
    NotEq,
    StrictNotEq,
    Gt,
    Ge,
    Lt,
    Le,

    // R[a] = <op> R[b]
    Not,
    BitNot,
    ToInt,
    ToReal,
    Negate,
    ToStr,
    ToNumber,
    Char,
    StrOf,
    TypeOf,

    /// R[a] = R[b].member(R[c])
    Dot,
    /// R[a].member(R[b]) = R[c]
    DotSet,
    /// R[a].member(R[b]) = void
    DotSetVoid,
    /// remove R[a].member(R[b])
    Delete,

    /// R[a] = K[b]
    LoadConst,
    /// R[a] = R[b]; a Property in R[a] receives the value through its setter.
    Copy,
    LoadVoid,
    LoadTrue,
    LoadFalse,

    /// R[a] = R[a](R[b..c])
    Call,
    /// pc = a
    Jump,
    /// if !R[a] { pc = b }
    JumpFalse,
    /// if R[a] { pc = b }
    JumpTrue,
    Return,
    ReturnVoid,

    /// R[b] += 1; R[a] = R[b]
    Inc,
    Dec,
    /// R[a] = R[b]; R[b] += 1
    PostInc,
    PostDec,

    /// R[a] = [R[b..c]]
    MakeArray,
    /// R[a] = %[R[b] => R[b+1], ...] over b..c
    MakeDict,
    /// R[a] = instantiate template R[a] with defaults R[b..c]
    MakeFunc,
    /// bind R[a]'s closure to the running activation
    BindClosure,

    /// R[a] = class resolved from R[b], falling back to the global named K[c]
    New,
    /// R[a] = R[b] instanceof R[c]
    InstanceOf,
    LoadGlobal,
    /// declare K[b] as the local stored in register a
    RegisterLocal,
    /// capture the ancestor local named K[a]
    CaptureUpvalue,

    Nop,
}

impl Op {
    pub fn name(self) -> &'static str {
        match self {
            Op::BitAnd => "BITAND",
            Op::BitOr => "BITOR",
            Op::BitXor => "BITXOR",
            Op::Sub => "SUB",
            Op::Add => "ADD",
            Op::Mod => "MOD",
            Op::Div => "DIV",
            Op::IntDiv => "INTDIV",
            Op::Mul => "MUL",
            Op::And => "AND",
            Op::Or => "OR",
            Op::Shl => "SHL",
            Op::Shr => "SHR",
            Op::Eq => "EQ",
            Op::StrictEq => "STRICTEQ",
            Op::NotEq => "NE",
            Op::StrictNotEq => "STRICTNE",
            Op::Gt => "GT",
            Op::Ge => "GE",
            Op::Lt => "LT",
            Op::Le => "LE",
            Op::Not => "NOT",
            Op::BitNot => "BITNOT",
            Op::ToInt => "TOINT",
            Op::ToReal => "TOREAL",
            Op::Negate => "NEG",
            Op::ToStr => "TOSTR",
            Op::ToNumber => "TONUM",
            Op::Char => "CHAR",
            Op::StrOf => "STROF",
            Op::TypeOf => "TYPEOF",
            Op::Dot => "DOT",
            Op::DotSet => "DOTSET",
            Op::DotSetVoid => "DOTSETVOID",
            Op::Delete => "DELETE",
            Op::LoadConst => "LOADK",
            Op::Copy => "COPY",
            Op::LoadVoid => "LOADVOID",
            Op::LoadTrue => "LOADTRUE",
            Op::LoadFalse => "LOADFALSE",
            Op::Call => "CALL",
            Op::Jump => "JMP",
            Op::JumpFalse => "JMPF",
            Op::JumpTrue => "JMPT",
            Op::Return => "RET",
            Op::ReturnVoid => "RETVOID",
            Op::Inc => "INC",
            Op::Dec => "DEC",
            Op::PostInc => "POSTINC",
            Op::PostDec => "POSTDEC",
            Op::MakeArray => "MKARRAY",
            Op::MakeDict => "MKDICT",
            Op::MakeFunc => "MKFUNC",
            Op::BindClosure => "BINDCLO",
            Op::New => "NEW",
            Op::InstanceOf => "INSTANCEOF",
            Op::LoadGlobal => "GLOBAL",
            Op::RegisterLocal => "REGVAR",
            Op::CaptureUpvalue => "UPVAL",
            Op::Nop => "NOP",
        }
    }

    /// Which of (a, b, c) name registers rather than constants or targets.
    fn register_operands(self) -> [bool; 3] {
        match self {
            Op::LoadConst => [true, false, false],
            Op::Jump => [false, false, false],
            Op::JumpFalse | Op::JumpTrue => [true, false, false],
            Op::New => [true, true, false],
            Op::RegisterLocal => [true, false, false],
            Op::CaptureUpvalue | Op::Nop | Op::ReturnVoid => [false, false, false],
            Op::LoadGlobal | Op::LoadVoid | Op::LoadTrue | Op::LoadFalse | Op::Return
            | Op::BindClosure => [true, false, false],
            Op::DotSetVoid | Op::Delete => [true, true, false],
            Op::Not | Op::BitNot | Op::ToInt | Op::ToReal | Op::Negate | Op::ToStr
            | Op::ToNumber | Op::Char | Op::StrOf | Op::TypeOf | Op::Copy | Op::Inc | Op::Dec
            | Op::PostInc | Op::PostDec => [true, true, false],
            _ => [true, true, true],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Instruction {
    pub op: Op,
    pub a: i32,
    pub b: i32,
    pub c: i32,
    pub line: u32,
    pub col: u32,
}

impl Instruction {
    /// Highest register the instruction touches, if any.
    pub fn max_register(&self) -> Option<i32> {
        let [ra, rb, rc] = self.op.register_operands();
        [(ra, self.a), (rb, self.b), (rc, self.c)]
            .into_iter()
            .filter(|&(is_reg, _)| is_reg)
            .map(|(_, r)| r)
            .max()
    }

    /// Lowest register the instruction touches, if any.
    pub fn min_register(&self) -> Option<i32> {
        let [ra, rb, rc] = self.op.register_operands();
        [(ra, self.a), (rb, self.b), (rc, self.c)]
            .into_iter()
            .filter(|&(is_reg, _)| is_reg)
            .map(|(_, r)| r)
            .min()
    }
}

// ── Chunk ────────────────────────────────────────────────────────────

/// A compiled program: immutable once the compiler hands it over, and
/// shared by every activation that runs it.
#[derive(Debug, Clone)]
pub struct Chunk {
    pub name: Option<String>,
    pub code: Vec<Instruction>,
    pub constants: Vec<Value>,
    /// One past the highest non-negative register used; at least 3.
    pub temp_count: i32,
    /// Lowest negative register used, or 0.
    pub local_floor: i32,
    pub param_count: usize,
}

impl Chunk {
    pub fn new(name: Option<String>) -> Self {
        Chunk {
            name,
            code: Vec::new(),
            constants: Vec::new(),
            temp_count: 3,
            local_floor: 0,
            param_count: 0,
        }
    }

    /// Registers needed by one activation.
    pub fn frame_size(&self) -> usize {
        (self.temp_count - self.local_floor) as usize
    }

    /// Interns strings and numbers; function templates are always appended.
    pub fn add_const(&mut self, value: Value) -> i32 {
        let existing = self.constants.iter().position(|c| match (c, &value) {
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::Number(a), Value::Number(b)) => a.to_bits() == b.to_bits(),
            _ => false,
        });
        if let Some(i) = existing {
            return i as i32;
        }
        self.constants.push(value);
        (self.constants.len() - 1) as i32
    }

    pub fn emit(&mut self, inst: Instruction) -> usize {
        if let Some(hi) = inst.max_register() {
            self.temp_count = self.temp_count.max(hi + 1);
        }
        if let Some(lo) = inst.min_register() {
            self.local_floor = self.local_floor.min(lo);
        }
        self.code.push(inst);
        self.code.len() - 1
    }

    /// Points a placeholder jump at `target`.
    pub fn patch_jump(&mut self, at: usize, target: usize) {
        let inst = &mut self.code[at];
        match inst.op {
            Op::Jump => inst.a = target as i32,
            Op::JumpFalse | Op::JumpTrue => inst.b = target as i32,
            _ => debug_assert!(false, "patching a non-jump at {at}"),
        }
    }

    pub fn reserve(&mut self, reg: i32) {
        self.temp_count = self.temp_count.max(reg + 1);
    }
}

impl fmt::Display for Chunk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = self.name.as_deref().unwrap_or("<script>");
        writeln!(
            f,
            "== {name} (params {}, registers {}..{}) ==",
            self.param_count, self.local_floor, self.temp_count
        )?;
        for (pc, inst) in self.code.iter().enumerate() {
            write!(f, "{pc:04}  {:<10} {:>4} {:>4} {:>4}", inst.op.name(), inst.a, inst.b, inst.c)?;
            let konst = match inst.op {
                Op::LoadConst | Op::RegisterLocal => self.constants.get(inst.b as usize),
                Op::CaptureUpvalue => self.constants.get(inst.a as usize),
                Op::New if inst.c >= 0 => self.constants.get(inst.c as usize),
                _ => None,
            };
            if let Some(k) = konst {
                write!(f, "    ; {}", k.describe())?;
            }
            writeln!(f, "    @{}:{}", inst.line, inst.col)?;
        }
        for konst in &self.constants {
            if let Some(nested) = konst.as_script_chunk() {
                writeln!(f)?;
                write!(f, "{nested}")?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inst(op: Op, a: i32, b: i32, c: i32) -> Instruction {
        Instruction { op, a, b, c, line: 1, col: 1 }
    }

    #[test]
    fn emit_tracks_register_watermarks() {
        let mut chunk = Chunk::new(None);
        chunk.emit(inst(Op::LoadConst, 7, 40, 0));
        chunk.emit(inst(Op::Copy, -3, 7, 0));
        assert_eq!(chunk.temp_count, 8);
        assert_eq!(chunk.local_floor, -3);
        assert_eq!(chunk.frame_size(), 11);
    }

    #[test]
    fn jump_targets_do_not_count_as_registers() {
        let mut chunk = Chunk::new(None);
        chunk.emit(inst(Op::Jump, 500, 0, 0));
        chunk.emit(inst(Op::JumpFalse, 2, 900, 0));
        assert_eq!(chunk.temp_count, 3);
    }

    #[test]
    fn constants_are_interned() {
        let mut chunk = Chunk::new(None);
        let a = chunk.add_const(Value::from("x"));
        let b = chunk.add_const(Value::Number(1.0));
        let c = chunk.add_const(Value::from("x"));
        assert_eq!(a, c);
        assert_ne!(a, b);
        assert_eq!(chunk.constants.len(), 2);
    }

    #[test]
    fn patch_jump_sets_target_operand() {
        let mut chunk = Chunk::new(None);
        let j = chunk.emit(inst(Op::Jump, 0, 0, 0));
        let jf = chunk.emit(inst(Op::JumpFalse, 2, 0, 0));
        chunk.patch_jump(j, 9);
        chunk.patch_jump(jf, 4);
        assert_eq!(chunk.code[j].a, 9);
        assert_eq!(chunk.code[jf].b, 4);
    }

    #[test]
    fn disassembly_names_constants() {
        let mut chunk = Chunk::new(Some("f".into()));
        let k = chunk.add_const(Value::from("x"));
        chunk.emit(inst(Op::LoadConst, 2, k, 0));
        let text = chunk.to_string();
        assert!(text.contains("== f"), "{text}");
        assert!(text.contains("LOADK"), "{text}");
        assert!(text.contains("\"x\""), "{text}");
    }
}
