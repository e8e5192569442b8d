//! Bytecode executor.
//!
//! Every call gets its own register window. Register 0 holds the
//! activation closure, register 1 holds `this`, and parameters and named
//! locals live below zero. Script calls re-enter [`execute`] recursively.

use std::cell::RefCell;
use std::rc::Rc;

use crate::bytecode::{Chunk, Instruction, Op};
use crate::engine::Engine;
use crate::error::{Result, ScriptError};
use crate::value::{Class, Closure, Object, Registers, Value};

/// Runs `chunk` in a fresh activation whose parent scope is `closure`.
pub fn execute(engine: &Engine, chunk: &Rc<Chunk>, closure: Rc<Closure>, this: Value, args: &[Value]) -> Result<Value> {
    let _guard = engine.enter_call()?;
    let base = chunk.local_floor.unsigned_abs() as usize;
    let size = chunk.frame_size().max(base + 3);
    let registers: Registers = Rc::new(RefCell::new(vec![Value::Void; size]));
    let activation = Closure::activation(closure, Rc::clone(&registers));
    {
        let mut regs = registers.borrow_mut();
        regs[base] = Value::closure(Rc::clone(&activation));
        regs[base + 1] = this;
        for (i, arg) in args.iter().take(chunk.param_count).enumerate() {
            if let Some(slot) = base.checked_sub(i + 1) {
                regs[slot] = arg.clone();
            }
        }
    }
    tracing::trace!(
        function = chunk.name.as_deref().unwrap_or("<script>"),
        depth = engine.call_depth(),
        registers = size,
        "enter frame"
    );

    let frame = Frame { engine, chunk, registers: Rc::clone(&registers), activation, base, size };
    let result = frame.run();

    // The activation holds the window; drop the window's link back to it.
    if let Some(slot) = registers.borrow_mut().get_mut(base) {
        *slot = Value::Void;
    }
    result
}

enum Flow {
    Next,
    Jump(usize),
    Return(Value),
}

struct Frame<'a> {
    engine: &'a Engine,
    chunk: &'a Chunk,
    registers: Registers,
    activation: Rc<Closure>,
    base: usize,
    size: usize,
}

fn jump_target(target: i32) -> Result<usize> {
    usize::try_from(target).map_err(|_| ScriptError::runtime(format!("invalid jump target {target}")))
}

impl<'a> Frame<'a> {
    fn run(&self) -> Result<Value> {
        let code: &'a [Instruction] = &self.chunk.code;
        let mut pc = 0;
        while let Some(inst) = code.get(pc) {
            match self.step(inst) {
                Ok(Flow::Next) => pc += 1,
                Ok(Flow::Jump(target)) => pc = target,
                Ok(Flow::Return(value)) => return Ok(value),
                Err(mut e) => {
                    e.push_trace(inst.line, inst.col);
                    return Err(e);
                }
            }
        }
        Ok(Value::Void)
    }

    // ── Register access ──────────────────────────────────────────────

    fn slot(&self, reg: i32) -> Result<usize> {
        let index = self.base as i64 + reg as i64;
        if index < 0 || index as usize >= self.size {
            return Err(ScriptError::runtime(format!("register {reg} outside the frame")));
        }
        Ok(index as usize)
    }

    fn get(&self, reg: i32) -> Result<Value> {
        let i = self.slot(reg)?;
        Ok(self.registers.borrow()[i].clone())
    }

    fn set(&self, reg: i32, value: Value) -> Result<()> {
        let i = self.slot(reg)?;
        self.registers.borrow_mut()[i] = value;
        Ok(())
    }

    fn num(&self, reg: i32) -> Result<f64> {
        self.get(reg)?.to_number()
    }

    fn int(&self, reg: i32) -> Result<i32> {
        self.get(reg)?.to_int()
    }

    fn range(&self, from: i32, to: i32) -> Result<Vec<Value>> {
        (from..to).map(|r| self.get(r)).collect()
    }

    fn constant(&self, k: i32) -> Result<Value> {
        usize::try_from(k)
            .ok()
            .and_then(|i| self.chunk.constants.get(i))
            .cloned()
            .ok_or_else(|| ScriptError::runtime(format!("constant {k} out of range")))
    }

    fn name(&self, k: i32) -> Result<String> {
        match self.constant(k)? {
            Value::Str(s) => Ok(s.to_string()),
            other => Err(ScriptError::runtime(format!("expected a name constant, found {}", other.kind_name()))),
        }
    }

    /// Named locals holding a property route the write through its setter.
    /// Temporaries are scratch: a property left in one by an earlier call
    /// result is overwritten, not written through.
    fn copy(&self, to: i32, from: i32) -> Result<()> {
        let value = self.get(from)?;
        if to < 0 {
            if let Value::Object(Object::Property(p)) = self.get(to)? {
                return p.set(self.engine, value);
            }
        }
        self.set(to, value)
    }

    fn global_class(&self, name: &str) -> Result<Rc<Class>> {
        match self.engine.get_global(name) {
            Some(Value::Object(Object::Class(class))) => Ok(class),
            _ => Err(ScriptError::runtime(format!("`{name}` is not a class"))),
        }
    }

    fn resolve_class(&self, target: Value, fallback: i32) -> Result<Rc<Class>> {
        match target {
            Value::Object(Object::Class(class)) => Ok(class),
            Value::Str(name) => self.global_class(&name),
            _ if fallback >= 0 => {
                let name = self.name(fallback)?;
                self.global_class(&name)
            }
            other => Err(ScriptError::runtime(format!("cannot instantiate {}", other.kind_name()))),
        }
    }

    // ── Dispatch ─────────────────────────────────────────────────────

    fn step(&self, inst: &Instruction) -> Result<Flow> {
        let Instruction { op, a, b, c, .. } = *inst;
        let engine = self.engine;
        match op {
            Op::BitAnd => self.set(a, Value::from(self.int(b)? & self.int(c)?))?,
            Op::BitOr => self.set(a, Value::from(self.int(b)? | self.int(c)?))?,
            Op::BitXor => self.set(a, Value::from(self.int(b)? ^ self.int(c)?))?,
            Op::Sub => self.set(a, Value::from(self.num(b)? - self.num(c)?))?,
            Op::Add => {
                let lhs = self.get(b)?;
                let rhs = self.get(c)?;
                let sum = match lhs {
                    Value::Str(_) => Value::from(format!("{lhs}{rhs}")),
                    _ => Value::from(lhs.to_number()? + rhs.to_number()?),
                };
                self.set(a, sum)?
            }
            Op::Mod => self.set(a, Value::from(self.num(b)? % self.num(c)?))?,
            Op::Div => self.set(a, Value::from(self.num(b)? / self.num(c)?))?,
            Op::IntDiv => {
                let divisor = self.int(c)?;
                if divisor == 0 {
                    return Err(ScriptError::runtime("division by zero"));
                }
                self.set(a, Value::from(self.int(b)?.wrapping_div(divisor)))?
            }
            Op::Mul => self.set(a, Value::from(self.num(b)? * self.num(c)?))?,
            Op::And => self.set(a, Value::from(self.get(b)?.truthy() && self.get(c)?.truthy()))?,
            Op::Or => self.set(a, Value::from(self.get(b)?.truthy() || self.get(c)?.truthy()))?,
            Op::Shl => self.set(a, Value::from(self.int(b)?.wrapping_shl(self.int(c)? as u32)))?,
            Op::Shr => self.set(a, Value::from(self.int(b)?.wrapping_shr(self.int(c)? as u32)))?,
            Op::Eq => self.set(a, Value::from(self.get(b)?.loose_equals(&self.get(c)?)))?,
            Op::NotEq => self.set(a, Value::from(!self.get(b)?.loose_equals(&self.get(c)?)))?,
            Op::StrictEq => self.set(a, Value::from(self.get(b)?.strict_equals(&self.get(c)?)))?,
            Op::StrictNotEq => self.set(a, Value::from(!self.get(b)?.strict_equals(&self.get(c)?)))?,
            Op::Gt => self.set(a, Value::from(self.get(b)?.greater_than(&self.get(c)?)))?,
            Op::Ge => self.set(a, Value::from(self.get(b)?.greater_or_equal(&self.get(c)?)))?,
            Op::Lt => self.set(a, Value::from(self.get(c)?.greater_than(&self.get(b)?)))?,
            Op::Le => self.set(a, Value::from(self.get(c)?.greater_or_equal(&self.get(b)?)))?,

            Op::Not => self.set(a, Value::from(!self.get(b)?.truthy()))?,
            Op::BitNot => self.set(a, Value::from(!self.int(b)?))?,
            Op::ToInt => self.set(a, Value::from(self.int(b)?))?,
            Op::ToReal | Op::ToNumber => self.set(a, Value::from(self.num(b)?))?,
            Op::Negate => self.set(a, Value::from(-self.num(b)?))?,
            Op::ToStr => self.set(a, Value::from(self.get(b)?.to_string()))?,
            Op::Char => {
                let text = self.get(b)?.to_string();
                let first = text
                    .chars()
                    .next()
                    .ok_or_else(|| ScriptError::runtime("`#` needs a non-empty string"))?;
                self.set(a, Value::from(first as u32 as f64))?
            }
            Op::StrOf => {
                let code = self.int(b)?;
                let ch = u32::try_from(code)
                    .ok()
                    .and_then(char::from_u32)
                    .ok_or_else(|| ScriptError::runtime(format!("{code} is not a valid character code")))?;
                self.set(a, Value::from(ch.to_string()))?
            }
            Op::TypeOf => self.set(a, Value::from(self.get(b)?.type_of()))?,

            Op::Dot => {
                let value = self.get(b)?.get_member(engine, &self.get(c)?)?;
                self.set(a, value)?
            }
            Op::DotSet => self.get(a)?.set_member(engine, &self.get(b)?, self.get(c)?)?,
            Op::DotSetVoid => self.get(a)?.set_member(engine, &self.get(b)?, Value::Void)?,
            Op::Delete => self.get(a)?.remove_member(&self.get(b)?)?,

            Op::LoadConst => self.set(a, self.constant(b)?)?,
            Op::Copy => self.copy(a, b)?,
            Op::LoadVoid => self.set(a, Value::Void)?,
            Op::LoadTrue => self.set(a, Value::from(true))?,
            Op::LoadFalse => self.set(a, Value::from(false))?,

            Op::Call => {
                let callee = self.get(a)?;
                let args = self.range(b, c)?;
                let result = callee.call(engine, &args)?;
                self.set(a, result)?
            }
            Op::Jump => return Ok(Flow::Jump(jump_target(a)?)),
            Op::JumpFalse => {
                if !self.get(a)?.truthy() {
                    return Ok(Flow::Jump(jump_target(b)?));
                }
            }
            Op::JumpTrue => {
                if self.get(a)?.truthy() {
                    return Ok(Flow::Jump(jump_target(b)?));
                }
            }
            Op::Return => return Ok(Flow::Return(self.get(a)?)),
            Op::ReturnVoid => return Ok(Flow::Return(Value::Void)),

            Op::Inc | Op::Dec => {
                let n = self.int(b)?;
                let stepped = Value::from(if op == Op::Inc { n.wrapping_add(1) } else { n.wrapping_sub(1) });
                self.set(b, stepped.clone())?;
                if a != b {
                    self.set(a, stepped)?;
                }
            }
            Op::PostInc | Op::PostDec => {
                let old = self.get(b)?;
                let n = old.to_int()?;
                self.set(a, old)?;
                self.set(b, Value::from(if op == Op::PostInc { n.wrapping_add(1) } else { n.wrapping_sub(1) }))?;
            }

            Op::MakeArray => self.set(a, Value::array(self.range(b, c)?))?,
            Op::MakeDict => {
                let items = self.range(b, c)?;
                let entries = items
                    .chunks(2)
                    .filter_map(|pair| match pair {
                        [key, value] => Some((key.to_string(), value.clone())),
                        _ => None,
                    })
                    .collect();
                self.set(a, Value::dict(entries))?
            }
            Op::MakeFunc => {
                let template = self.get(a)?;
                let f = template
                    .as_function()
                    .ok_or_else(|| ScriptError::runtime("function template expected"))?;
                let made = f.instantiate(Rc::clone(engine.global()), self.range(b, c)?);
                self.set(a, Value::function(made))?
            }
            Op::BindClosure => {
                let value = self.get(a)?;
                let f = value
                    .as_function()
                    .ok_or_else(|| ScriptError::runtime("only functions can bind a closure"))?;
                self.set(a, Value::function(f.with_closure(Rc::clone(&self.activation))))?
            }

            Op::New => {
                let class = self.resolve_class(self.get(b)?, c)?;
                self.set(a, Value::class(class))?
            }
            Op::InstanceOf => {
                let name = match self.get(c)? {
                    Value::Object(Object::Class(class)) => class.name().to_string(),
                    other => other.to_string(),
                };
                self.set(a, Value::from(self.get(b)?.is_instance_of(&name)))?
            }
            Op::LoadGlobal => self.set(a, Value::closure(Rc::clone(engine.global())))?,
            Op::RegisterLocal => {
                let name = self.name(b)?;
                let index = self.slot(a)?;
                self.activation.register_local(&name, index);
            }
            Op::CaptureUpvalue => {
                let name = self.name(a)?;
                self.activation.capture_upvalue(&name);
            }
            Op::Nop => {}
        }
        Ok(Flow::Next)
    }
}
