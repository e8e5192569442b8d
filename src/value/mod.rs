use std::cell::RefCell;
use std::collections::BTreeMap;
use std::fmt;
use std::rc::Rc;

mod boxing;
mod object;

pub use object::{
    Class, Closure, Function, FunctionBody, HostFactory, NativeFn, NormalClosure, Property,
    Registers, StackClosure, Upvalue,
};

use crate::bytecode::Chunk;
use crate::engine::Engine;
use crate::error::{Result, ScriptError};
use boxing::Boxed;
pub(crate) use boxing::{array_resize, array_set, resolve_index};

pub type ArrayRef = Rc<RefCell<Vec<Value>>>;
pub type DictRef = Rc<RefCell<BTreeMap<String, Value>>>;

/// Numbers closer than this compare equal.
pub const EPSILON: f64 = 1e-9;

/// Runtime value. Numbers and strings are copied by value; `Object`
/// copies share the referenced entity.
#[derive(Clone, Default)]
pub enum Value {
    #[default]
    Void,
    Undefined,
    Number(f64),
    Str(Rc<str>),
    Object(Object),
}

/// Compound kinds, all reference-counted handles.
#[derive(Clone)]
pub enum Object {
    Array(ArrayRef),
    Dict(DictRef),
    Function(Rc<Function>),
    Property(Rc<Property>),
    Closure(Rc<Closure>),
    Class(Rc<Class>),
}

impl Object {
    pub fn ptr_eq(&self, other: &Object) -> bool {
        match (self, other) {
            (Object::Array(a), Object::Array(b)) => Rc::ptr_eq(a, b),
            (Object::Dict(a), Object::Dict(b)) => Rc::ptr_eq(a, b),
            (Object::Function(a), Object::Function(b)) => Rc::ptr_eq(a, b),
            (Object::Property(a), Object::Property(b)) => Rc::ptr_eq(a, b),
            (Object::Closure(a), Object::Closure(b)) => Rc::ptr_eq(a, b),
            (Object::Class(a), Object::Class(b)) => Rc::ptr_eq(a, b),
            _ => false,
        }
    }
}

/// A member selector: integral numbers index, everything else names.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Key {
    Index(i64),
    Name(String),
}

impl Key {
    pub(crate) fn from_value(v: &Value) -> Key {
        match v {
            Value::Number(n) if n.fract() == 0.0 && n.abs() < 9.0e15 => Key::Index(*n as i64),
            other => Key::Name(other.to_string()),
        }
    }

    pub(crate) fn into_name(self) -> String {
        match self {
            Key::Index(i) => i.to_string(),
            Key::Name(name) => name,
        }
    }

    /// Names that spell an integer select by index on sequences.
    pub(crate) fn as_index(&self) -> Option<i64> {
        match self {
            Key::Index(i) => Some(*i),
            Key::Name(name) => name.trim().parse().ok(),
        }
    }
}

// ── Construction ─────────────────────────────────────────────────────

impl Value {
    pub fn array(items: Vec<Value>) -> Value {
        Value::Object(Object::Array(Rc::new(RefCell::new(items))))
    }

    pub fn dict(entries: BTreeMap<String, Value>) -> Value {
        Value::Object(Object::Dict(Rc::new(RefCell::new(entries))))
    }

    pub fn function(f: Function) -> Value {
        Value::Object(Object::Function(Rc::new(f)))
    }

    pub fn native(f: impl Fn(&Engine, &Value, &[Value]) -> Result<Value> + 'static) -> Value {
        Value::function(Function::native(f))
    }

    pub fn property(p: Property) -> Value {
        Value::Object(Object::Property(Rc::new(p)))
    }

    pub fn closure(c: Rc<Closure>) -> Value {
        Value::Object(Object::Closure(c))
    }

    pub fn class(c: Rc<Class>) -> Value {
        Value::Object(Object::Class(c))
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Number(n)
    }
}

impl From<i32> for Value {
    fn from(n: i32) -> Self {
        Value::Number(n as f64)
    }
}

impl From<usize> for Value {
    fn from(n: usize) -> Self {
        Value::Number(n as f64)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Number(if b { 1.0 } else { 0.0 })
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(Rc::from(s))
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Str(Rc::from(s))
    }
}

// ── Inspection & coercion ────────────────────────────────────────────

impl Value {
    pub fn is_void(&self) -> bool {
        matches!(self, Value::Void | Value::Undefined)
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&ArrayRef> {
        match self {
            Value::Object(Object::Array(a)) => Some(a),
            _ => None,
        }
    }

    pub fn as_dict(&self) -> Option<&DictRef> {
        match self {
            Value::Object(Object::Dict(d)) => Some(d),
            _ => None,
        }
    }

    pub fn as_function(&self) -> Option<&Rc<Function>> {
        match self {
            Value::Object(Object::Function(f)) => Some(f),
            _ => None,
        }
    }

    pub fn as_class(&self) -> Option<&Rc<Class>> {
        match self {
            Value::Object(Object::Class(c)) => Some(c),
            _ => None,
        }
    }

    pub fn as_closure(&self) -> Option<&Rc<Closure>> {
        match self {
            Value::Object(Object::Closure(c)) => Some(c),
            _ => None,
        }
    }

    pub(crate) fn as_script_chunk(&self) -> Option<&Rc<Chunk>> {
        self.as_function().and_then(|f| f.chunk())
    }

    /// Kind name used by `instanceof` and in error messages.
    pub fn kind_name(&self) -> &'static str {
        match self {
            Value::Void => "void",
            Value::Undefined => "undefined",
            Value::Number(_) => "number",
            Value::Str(_) => "string",
            Value::Object(Object::Array(_)) => "array",
            Value::Object(Object::Dict(_)) => "dictionary",
            Value::Object(Object::Function(_)) => "function",
            Value::Object(Object::Property(_)) => "property",
            Value::Object(Object::Closure(_)) => "closure",
            Value::Object(Object::Class(_)) => "class",
        }
    }

    /// Result of the `typeof` operator.
    pub fn type_of(&self) -> &'static str {
        match self {
            Value::Void => "void",
            Value::Undefined => "undefined",
            Value::Number(_) => "number",
            Value::Str(_) => "string",
            Value::Object(_) => "object",
        }
    }

    pub fn truthy(&self) -> bool {
        match self {
            Value::Void | Value::Undefined => false,
            Value::Number(n) => n.abs() > EPSILON,
            Value::Str(s) => !s.is_empty() && &**s != "false",
            Value::Object(_) => true,
        }
    }

    /// Lenient numeric view: unparsable strings read as 0.
    pub fn to_number(&self) -> Result<f64> {
        match self {
            Value::Void | Value::Undefined => Ok(0.0),
            Value::Number(n) => Ok(*n),
            Value::Str(s) => Ok(s.trim().parse::<f64>().unwrap_or(0.0)),
            Value::Object(_) => Err(ScriptError::runtime(format!(
                "cannot convert {} to number",
                self.kind_name()
            ))),
        }
    }

    /// Truncating 32-bit view; NaN reads as 0 and out-of-range saturates.
    pub fn to_int(&self) -> Result<i32> {
        Ok(self.to_number()?.trunc() as i32)
    }

    pub fn is_instance_of(&self, name: &str) -> bool {
        match self {
            Value::Void | Value::Undefined => false,
            Value::Number(_) => name == "number",
            Value::Str(_) => name == "string",
            Value::Object(Object::Class(c)) => c.is_instance_of(name),
            Value::Object(_) => name == self.kind_name() || name == "object",
        }
    }

    /// Short rendering for disassembly listings.
    pub fn describe(&self) -> String {
        match self {
            Value::Str(s) => format!("{:?}", &**s),
            Value::Object(Object::Function(f)) => match f.chunk() {
                Some(chunk) => format!("<function {}>", chunk.name.as_deref().unwrap_or("anonymous")),
                None => "<native function>".to_string(),
            },
            other => other.inspect(),
        }
    }
}

// ── Equality & ordering ──────────────────────────────────────────────

impl Value {
    pub fn strict_equals(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Void, Value::Void) | (Value::Undefined, Value::Undefined) => true,
            (Value::Number(a), Value::Number(b)) => (a - b).abs() < EPSILON,
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::Object(a), Value::Object(b)) => a.ptr_eq(b),
            _ => false,
        }
    }

    pub fn loose_equals(&self, other: &Value) -> bool {
        if self.strict_equals(other) {
            return true;
        }
        match (self, other) {
            (a, b) if a.is_void() && b.is_void() => true,
            (v, Value::Number(n)) | (Value::Number(n), v) if v.is_void() => n.abs() < EPSILON,
            (v, Value::Str(s)) | (Value::Str(s), v) if v.is_void() => s.is_empty(),
            (Value::Number(n), Value::Str(s)) | (Value::Str(s), Value::Number(n)) => {
                format_number(*n) == **s
            }
            _ => false,
        }
    }

    /// `self > other`. Void sorts below everything that is not void.
    pub fn greater_than(&self, other: &Value) -> bool {
        match (self.is_void(), other.is_void()) {
            (true, _) => return false,
            (false, true) => return true,
            _ => {}
        }
        match (self, other) {
            (Value::Number(a), Value::Number(b)) => a > b,
            (Value::Str(_), _) | (_, Value::Str(_)) => self.to_string() > other.to_string(),
            _ => false,
        }
    }

    /// `self >= other`. Void is only at least as large as void.
    pub fn greater_or_equal(&self, other: &Value) -> bool {
        match (self.is_void(), other.is_void()) {
            (true, rhs) => return rhs,
            (false, true) => return true,
            _ => {}
        }
        match (self, other) {
            (Value::Number(a), Value::Number(b)) => a >= b,
            (Value::Str(_), _) | (_, Value::Str(_)) => self.to_string() >= other.to_string(),
            _ => self.strict_equals(other),
        }
    }
}

// ── Member access ────────────────────────────────────────────────────

impl Value {
    fn boxed(&self) -> Option<Boxed<'_>> {
        match self {
            Value::Number(n) => Some(Boxed::Number(*n)),
            Value::Str(s) => Some(Boxed::Str(s)),
            Value::Object(Object::Array(a)) => Some(Boxed::Array(a)),
            Value::Object(Object::Dict(d)) => Some(Boxed::Dict(d)),
            _ => None,
        }
    }

    /// `self[key]` / `self.key`.
    pub fn get_member(&self, engine: &Engine, key: &Value) -> Result<Value> {
        let key = Key::from_value(key);
        if let Some(boxed) = self.boxed() {
            return boxed.get(engine, key);
        }
        match self {
            Value::Object(Object::Closure(c)) => c.get_field(engine, &key.into_name()),
            Value::Object(Object::Class(c)) => Class::get_field(c, engine, &key.into_name()),
            _ => Err(ScriptError::runtime(format!(
                "cannot read member `{}` of {}",
                key.into_name(),
                self.kind_name()
            ))),
        }
    }

    pub fn set_member(&self, engine: &Engine, key: &Value, value: Value) -> Result<()> {
        let key = Key::from_value(key);
        if let Some(boxed) = self.boxed() {
            return boxed.set(engine, key, value);
        }
        match self {
            Value::Object(Object::Closure(c)) => c.set_field(engine, &key.into_name(), value),
            Value::Object(Object::Class(c)) => Class::set_field(c, engine, &key.into_name(), value),
            _ => Err(ScriptError::runtime(format!(
                "cannot set member `{}` of {}",
                key.into_name(),
                self.kind_name()
            ))),
        }
    }

    pub fn remove_member(&self, key: &Value) -> Result<()> {
        let key = Key::from_value(key);
        if let Some(boxed) = self.boxed() {
            return boxed.remove(key);
        }
        match self {
            Value::Object(Object::Closure(c)) => c.remove(&key.into_name()),
            Value::Object(Object::Class(c)) => {
                c.remove_member(&key.into_name());
                Ok(())
            }
            _ => Err(ScriptError::runtime(format!(
                "cannot delete member `{}` of {}",
                key.into_name(),
                self.kind_name()
            ))),
        }
    }

    /// Functions run; classes construct an instance.
    pub fn call(&self, engine: &Engine, args: &[Value]) -> Result<Value> {
        match self {
            Value::Object(Object::Function(f)) => f.call(engine, args),
            Value::Object(Object::Class(c)) => Ok(Value::class(Class::create_instance(c, engine, args)?)),
            _ => Err(ScriptError::runtime(format!("{} is not callable", self.kind_name()))),
        }
    }
}

// ── Formatting ───────────────────────────────────────────────────────

/// Number rendering shared by string conversion and loose equality.
pub fn format_number(n: f64) -> String {
    if n.is_nan() {
        "NaN".to_string()
    } else if n.is_infinite() {
        if n > 0.0 { "Infinity".to_string() } else { "-Infinity".to_string() }
    } else if n == 0.0 {
        "0".to_string()
    } else if n.fract() == 0.0 && n.abs() < 1e15 {
        format!("{}", n as i64)
    } else {
        format!("{n}")
    }
}

const MAX_FORMAT_DEPTH: usize = 10;

impl Value {
    /// Debug-style rendering: strings quoted, void spelled out.
    pub fn inspect(&self) -> String {
        self.render(true, 0)
    }

    fn render(&self, quoted: bool, depth: usize) -> String {
        match self {
            Value::Void => if quoted { "void".into() } else { String::new() },
            Value::Undefined => if quoted { "undefined".into() } else { String::new() },
            Value::Number(n) => format_number(*n),
            Value::Str(s) => if quoted { format!("{:?}", &**s) } else { s.to_string() },
            Value::Object(Object::Array(items)) => {
                let items = items.borrow();
                if items.is_empty() {
                    return "[]".into();
                }
                if depth >= MAX_FORMAT_DEPTH {
                    return "Array".into();
                }
                let parts: Vec<String> = items.iter().map(|v| v.render(quoted, depth + 1)).collect();
                format!("[{}]", parts.join(","))
            }
            Value::Object(Object::Dict(entries)) => {
                let entries = entries.borrow();
                if entries.is_empty() {
                    return "%[]".into();
                }
                if depth >= MAX_FORMAT_DEPTH {
                    return "Dictionary".into();
                }
                let parts: Vec<String> = entries
                    .iter()
                    .map(|(k, v)| format!("{k:?}=>{}", v.render(quoted, depth + 1)))
                    .collect();
                format!("%[{}]", parts.join(","))
            }
            Value::Object(Object::Function(_)) => "(function)".into(),
            Value::Object(Object::Property(_)) => "(property)".into(),
            Value::Object(Object::Closure(_)) => "(closure)".into(),
            Value::Object(Object::Class(c)) => {
                if c.is_instance() {
                    format!("({} instance)", c.name())
                } else {
                    format!("(class {})", c.name())
                }
            }
        }
    }

    /// JSON view for embedders; non-data objects become descriptive strings.
    pub fn to_json(&self) -> serde_json::Value {
        self.json_at(0)
    }

    fn json_at(&self, depth: usize) -> serde_json::Value {
        match self {
            Value::Void | Value::Undefined => serde_json::Value::Null,
            Value::Number(n) => serde_json::Number::from_f64(*n)
                .map(serde_json::Value::Number)
                .unwrap_or_else(|| serde_json::Value::String(format_number(*n))),
            Value::Str(s) => serde_json::Value::String(s.to_string()),
            Value::Object(Object::Array(items)) if depth < MAX_FORMAT_DEPTH => {
                serde_json::Value::Array(items.borrow().iter().map(|v| v.json_at(depth + 1)).collect())
            }
            Value::Object(Object::Dict(entries)) if depth < MAX_FORMAT_DEPTH => serde_json::Value::Object(
                entries.borrow().iter().map(|(k, v)| (k.clone(), v.json_at(depth + 1))).collect(),
            ),
            other => serde_json::Value::String(other.render(false, depth)),
        }
    }
}

/// Script string conversion (`string x`, concatenation).
impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.render(false, 0))
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.inspect())
    }
}
