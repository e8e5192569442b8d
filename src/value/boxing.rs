//! Transient adapters that give primitives member access through the
//! engine's prototype classes.

use std::rc::Rc;

use super::{ArrayRef, DictRef, Key, Object, Value};
use crate::engine::Engine;
use crate::error::{Result, ScriptError};
use crate::value::Class;

pub(crate) enum Boxed<'a> {
    Number(f64),
    Str(&'a Rc<str>),
    Array(&'a ArrayRef),
    Dict(&'a DictRef),
}

impl Boxed<'_> {
    fn prototype<'e>(&self, engine: &'e Engine) -> &'e Rc<Class> {
        match self {
            Boxed::Number(_) => engine.number_class(),
            Boxed::Str(_) => engine.string_class(),
            Boxed::Array(_) => engine.array_class(),
            Boxed::Dict(_) => engine.dict_class(),
        }
    }

    fn receiver(&self) -> Value {
        match self {
            Boxed::Number(n) => Value::Number(*n),
            Boxed::Str(s) => Value::Str(Rc::clone(s)),
            Boxed::Array(a) => Value::Object(Object::Array(Rc::clone(a))),
            Boxed::Dict(d) => Value::Object(Object::Dict(Rc::clone(d))),
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            Boxed::Number(_) => "number",
            Boxed::Str(_) => "string",
            Boxed::Array(_) => "array",
            Boxed::Dict(_) => "dictionary",
        }
    }

    /// Prototype member with `this` bound to the primitive.
    fn method(&self, engine: &Engine, name: &str) -> Result<Option<Value>> {
        match self.prototype(engine).find_member(name) {
            Some(Value::Object(Object::Function(f))) => {
                Ok(Some(Value::function(f.bind_this(self.receiver()))))
            }
            Some(Value::Object(Object::Property(p))) => p.bind_this(&self.receiver()).get(engine).map(Some),
            other => Ok(other),
        }
    }

    fn missing(&self, name: &str) -> ScriptError {
        ScriptError::runtime(format!("member `{name}` does not exist in {}", self.kind()))
    }

    pub(crate) fn get(&self, engine: &Engine, key: Key) -> Result<Value> {
        match (self, key) {
            (Boxed::Array(a), Key::Index(i)) => Ok(array_get(a, i)),
            (Boxed::Array(a), Key::Name(name)) if name == "length" => Ok(Value::from(a.borrow().len())),
            (Boxed::Dict(d), key) => {
                let name = key.into_name();
                if name == "length" {
                    return Ok(Value::from(d.borrow().len()));
                }
                let entry = d.borrow().get(&name).cloned();
                match entry {
                    Some(v) => Ok(v),
                    None => Ok(self.method(engine, &name)?.unwrap_or(Value::Undefined)),
                }
            }
            (Boxed::Str(s), Key::Index(i)) => string_char(s, i),
            (_, Key::Name(name)) => {
                if let Some(v) = self.method(engine, &name)? {
                    return Ok(v);
                }
                match (self, Key::Name(name.clone()).as_index()) {
                    (Boxed::Array(a), Some(i)) => Ok(array_get(a, i)),
                    (Boxed::Str(s), Some(i)) => string_char(s, i),
                    _ => Err(self.missing(&name)),
                }
            }
            (Boxed::Number(_), key) => Err(self.missing(&key.into_name())),
        }
    }

    pub(crate) fn set(&self, engine: &Engine, key: Key, value: Value) -> Result<()> {
        let cap = engine.config().max_array_length;
        match self {
            Boxed::Dict(d) => {
                d.borrow_mut().insert(key.into_name(), value);
                Ok(())
            }
            Boxed::Array(a) => {
                if let Some(i) = key.as_index() {
                    return array_set(a, i, value, cap);
                }
                let name = key.into_name();
                if name == "length" {
                    return array_resize(a, value.to_number()?, cap);
                }
                match self.prototype(engine).find_member(&name) {
                    Some(Value::Object(Object::Property(p))) => p.bind_this(&self.receiver()).set(engine, value),
                    _ => Err(ScriptError::runtime(format!("cannot set member `{name}` of array"))),
                }
            }
            Boxed::Number(_) | Boxed::Str(_) => {
                let name = key.into_name();
                match self.prototype(engine).find_member(&name) {
                    Some(Value::Object(Object::Property(p))) => p.bind_this(&self.receiver()).set(engine, value),
                    _ => Err(ScriptError::runtime(format!("cannot set member `{name}` of {}", self.kind()))),
                }
            }
        }
    }

    pub(crate) fn remove(&self, key: Key) -> Result<()> {
        match self {
            Boxed::Dict(d) => {
                d.borrow_mut().remove(&key.into_name());
                Ok(())
            }
            Boxed::Array(a) => match key.as_index() {
                Some(i) => {
                    let mut items = a.borrow_mut();
                    if let Some(idx) = resolve_index(i, items.len()) {
                        items.remove(idx);
                    }
                    Ok(())
                }
                None => Err(ScriptError::runtime(format!(
                    "cannot delete member `{}` of array",
                    key.into_name()
                ))),
            },
            Boxed::Number(_) | Boxed::Str(_) => Err(ScriptError::runtime(format!(
                "cannot delete member `{}` of {}",
                key.into_name(),
                self.kind()
            ))),
        }
    }
}

/// Maps a possibly negative index onto `0..len`.
pub(crate) fn resolve_index(index: i64, len: usize) -> Option<usize> {
    let len = len as i64;
    let i = if index < 0 { index + len } else { index };
    (0..len).contains(&i).then_some(i as usize)
}

fn array_get(a: &ArrayRef, index: i64) -> Value {
    let items = a.borrow();
    resolve_index(index, items.len()).map(|i| items[i].clone()).unwrap_or_default()
}

/// Stores at `index`, growing with void up to `cap` elements.
pub(crate) fn array_set(a: &ArrayRef, index: i64, value: Value, cap: usize) -> Result<()> {
    let mut items = a.borrow_mut();
    let i = if index < 0 { index + items.len() as i64 } else { index };
    if i < 0 {
        return Err(ScriptError::runtime(format!("array index {index} out of range")));
    }
    let i = i as usize;
    if i >= cap {
        return Err(ScriptError::runtime(format!("array size exceeds {cap}")));
    }
    if i >= items.len() {
        items.resize(i + 1, Value::Void);
    }
    items[i] = value;
    Ok(())
}

pub(crate) fn array_resize(a: &ArrayRef, len: f64, cap: usize) -> Result<()> {
    if !(0.0..=cap as f64).contains(&len) {
        return Err(ScriptError::runtime(format!("array size exceeds {cap}")));
    }
    a.borrow_mut().resize(len as usize, Value::Void);
    Ok(())
}

fn string_char(s: &str, index: i64) -> Result<Value> {
    let len = s.chars().count();
    match resolve_index(index, len).and_then(|i| s.chars().nth(i)) {
        Some(c) => Ok(Value::from(c.to_string())),
        None => Err(ScriptError::runtime(format!("string index {index} out of range"))),
    }
}
