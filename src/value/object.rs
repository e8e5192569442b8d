use std::any::Any;
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use super::{Object, Value};
use crate::bytecode::Chunk;
use crate::engine::Engine;
use crate::error::{Result, ScriptError};

/// Host callable: `(engine, this, args) -> value`.
pub type NativeFn = dyn Fn(&Engine, &Value, &[Value]) -> Result<Value>;

/// Produces the host payload attached to a new instance of a host class.
pub type HostFactory = dyn Fn(&Engine, &[Value]) -> Result<Rc<dyn Any>>;

/// An activation's register window, shared with the closures that capture it.
pub type Registers = Rc<RefCell<Vec<Value>>>;

// ── Function ─────────────────────────────────────────────────────────

#[derive(Clone)]
pub enum FunctionBody {
    Native(Rc<NativeFn>),
    Script(Rc<Chunk>),
}

#[derive(Clone)]
pub struct Function {
    body: FunctionBody,
    closure: Option<Rc<Closure>>,
    this: Value,
    defaults: Rc<[Value]>,
}

impl Function {
    pub fn native(f: impl Fn(&Engine, &Value, &[Value]) -> Result<Value> + 'static) -> Self {
        Function {
            body: FunctionBody::Native(Rc::new(f)),
            closure: None,
            this: Value::Void,
            defaults: Rc::from([]),
        }
    }

    /// An unbound template, as stored in a constant pool.
    pub fn script(chunk: Rc<Chunk>) -> Self {
        Function { body: FunctionBody::Script(chunk), closure: None, this: Value::Void, defaults: Rc::from([]) }
    }

    pub fn body(&self) -> &FunctionBody {
        &self.body
    }

    pub fn chunk(&self) -> Option<&Rc<Chunk>> {
        match &self.body {
            FunctionBody::Script(chunk) => Some(chunk),
            FunctionBody::Native(_) => None,
        }
    }

    pub fn this(&self) -> &Value {
        &self.this
    }

    pub fn closure(&self) -> Option<&Rc<Closure>> {
        self.closure.as_ref()
    }

    /// Same code and closure, new receiver.
    pub fn bind_this(&self, this: Value) -> Function {
        Function { this, ..self.clone() }
    }

    pub(crate) fn with_closure(&self, closure: Rc<Closure>) -> Function {
        Function { closure: Some(closure), ..self.clone() }
    }

    pub(crate) fn instantiate(&self, closure: Rc<Closure>, defaults: Vec<Value>) -> Function {
        Function {
            body: self.body.clone(),
            closure: Some(closure),
            this: Value::Void,
            defaults: Rc::from(defaults),
        }
    }

    pub fn call(&self, engine: &Engine, args: &[Value]) -> Result<Value> {
        match &self.body {
            FunctionBody::Native(f) => f(engine, &self.this, args),
            FunctionBody::Script(chunk) => {
                let params: Vec<Value> = (0..chunk.param_count)
                    .map(|i| args.get(i).or_else(|| self.defaults.get(i)).cloned().unwrap_or_default())
                    .collect();
                let closure = self.closure.clone().unwrap_or_else(|| Rc::clone(engine.global()));
                crate::vm::execute(engine, chunk, closure, self.this.clone(), &params)
            }
        }
    }
}

// ── Property ─────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct Property {
    getter: Option<Rc<Function>>,
    setter: Option<Rc<Function>>,
}

impl Property {
    pub fn new(getter: Option<Function>, setter: Option<Function>) -> Self {
        Property { getter: getter.map(Rc::new), setter: setter.map(Rc::new) }
    }

    pub fn get(&self, engine: &Engine) -> Result<Value> {
        match &self.getter {
            Some(f) => f.call(engine, &[]),
            None => Err(ScriptError::runtime("property has no getter")),
        }
    }

    pub fn set(&self, engine: &Engine, value: Value) -> Result<()> {
        match &self.setter {
            Some(f) => f.call(engine, &[value]).map(drop),
            None => Err(ScriptError::runtime("property has no setter")),
        }
    }

    pub fn bind_this(&self, this: &Value) -> Property {
        Property {
            getter: self.getter.as_ref().map(|f| Rc::new(f.bind_this(this.clone()))),
            setter: self.setter.as_ref().map(|f| Rc::new(f.bind_this(this.clone()))),
        }
    }
}

/// Reads through a property, passing other values along.
fn read_slot(engine: &Engine, value: Value) -> Result<Value> {
    match value {
        Value::Object(Object::Property(p)) => p.get(engine),
        other => Ok(other),
    }
}

// ── Closure ──────────────────────────────────────────────────────────

pub enum Closure {
    Normal(NormalClosure),
    Stack(StackClosure),
}

/// Name-keyed scope: the global scope and embedder-supplied scopes.
pub struct NormalClosure {
    parent: Option<Rc<Closure>>,
    vars: RefCell<HashMap<String, Value>>,
}

/// One function activation.
pub struct StackClosure {
    parent: Option<Rc<Closure>>,
    registers: Registers,
    locals: RefCell<HashMap<String, usize>>,
    upvalues: RefCell<HashMap<String, Upvalue>>,
}

/// A shared cell inside an ancestor's register window.
#[derive(Clone)]
pub struct Upvalue {
    registers: Registers,
    index: usize,
}

impl Upvalue {
    fn get(&self) -> Value {
        self.registers.borrow().get(self.index).cloned().unwrap_or_default()
    }
}

/// Writes into a register slot, routing through a property setter if the
/// slot currently holds one.
fn write_slot(engine: &Engine, registers: &Registers, index: usize, value: Value) -> Result<()> {
    let current = registers.borrow().get(index).cloned();
    match current {
        Some(Value::Object(Object::Property(p))) => p.set(engine, value),
        Some(_) => {
            registers.borrow_mut()[index] = value;
            Ok(())
        }
        None => Err(ScriptError::runtime("register slot out of range")),
    }
}

impl Closure {
    pub fn normal(parent: Option<Rc<Closure>>) -> Rc<Closure> {
        Rc::new(Closure::Normal(NormalClosure { parent, vars: RefCell::new(HashMap::new()) }))
    }

    pub(crate) fn activation(parent: Rc<Closure>, registers: Registers) -> Rc<Closure> {
        Rc::new(Closure::Stack(StackClosure {
            parent: Some(parent),
            registers,
            locals: RefCell::new(HashMap::new()),
            upvalues: RefCell::new(HashMap::new()),
        }))
    }

    pub fn parent(&self) -> Option<&Rc<Closure>> {
        match self {
            Closure::Normal(c) => c.parent.as_ref(),
            Closure::Stack(c) => c.parent.as_ref(),
        }
    }

    /// Binds `name` in this scope without consulting parents.
    pub fn define(&self, name: &str, value: Value) {
        match self {
            Closure::Normal(c) => {
                c.vars.borrow_mut().insert(name.to_string(), value);
            }
            Closure::Stack(c) => {
                let index = c.locals.borrow().get(name).copied();
                if let Some(index) = index {
                    if let Some(slot) = c.registers.borrow_mut().get_mut(index) {
                        *slot = value;
                    }
                }
            }
        }
    }

    /// Raw chain lookup; properties are returned unevaluated.
    pub fn lookup(&self, name: &str) -> Option<Value> {
        let own = match self {
            Closure::Normal(c) => c.vars.borrow().get(name).cloned(),
            Closure::Stack(c) => {
                let index = c.locals.borrow().get(name).copied();
                let upvalue = c.upvalues.borrow().get(name).cloned();
                match (index, upvalue) {
                    (Some(i), _) => c.registers.borrow().get(i).cloned(),
                    (None, Some(up)) => Some(up.get()),
                    (None, None) => None,
                }
            }
        };
        own.or_else(|| self.parent().and_then(|p| p.lookup(name)))
    }

    pub fn get_field(&self, engine: &Engine, name: &str) -> Result<Value> {
        match self {
            Closure::Normal(c) => {
                let found = c.vars.borrow().get(name).cloned();
                match (found, &c.parent) {
                    (Some(v), _) => read_slot(engine, v),
                    (None, Some(parent)) => parent.get_field(engine, name),
                    (None, None) => Ok(Value::Undefined),
                }
            }
            Closure::Stack(c) => {
                let index = c.locals.borrow().get(name).copied();
                if let Some(i) = index {
                    let v = c.registers.borrow().get(i).cloned().unwrap_or_default();
                    return read_slot(engine, v);
                }
                let upvalue = c.upvalues.borrow().get(name).cloned();
                if let Some(up) = upvalue {
                    return read_slot(engine, up.get());
                }
                match &c.parent {
                    Some(parent) => parent.get_field(engine, name),
                    None => Ok(Value::Undefined),
                }
            }
        }
    }

    /// Assigns to the nearest scope that binds `name`; unbound names land
    /// in the outermost scope.
    pub fn set_field(&self, engine: &Engine, name: &str, value: Value) -> Result<()> {
        match self {
            Closure::Normal(c) => {
                let existing = c.vars.borrow().get(name).cloned();
                match (existing, &c.parent) {
                    (Some(Value::Object(Object::Property(p))), _) => p.set(engine, value),
                    (Some(_), _) | (None, None) => {
                        c.vars.borrow_mut().insert(name.to_string(), value);
                        Ok(())
                    }
                    (None, Some(parent)) => parent.set_field(engine, name, value),
                }
            }
            Closure::Stack(c) => {
                let index = c.locals.borrow().get(name).copied();
                if let Some(i) = index {
                    return write_slot(engine, &c.registers, i, value);
                }
                let upvalue = c.upvalues.borrow().get(name).cloned();
                if let Some(up) = upvalue {
                    return write_slot(engine, &up.registers, up.index, value);
                }
                match &c.parent {
                    Some(parent) => parent.set_field(engine, name, value),
                    None => Err(ScriptError::runtime(format!("variable `{name}` is not declared"))),
                }
            }
        }
    }

    pub fn remove(&self, name: &str) -> Result<()> {
        match self {
            Closure::Normal(c) => {
                let removed = c.vars.borrow_mut().remove(name).is_some();
                match (&c.parent, removed) {
                    (Some(parent), false) => parent.remove(name),
                    _ => Ok(()),
                }
            }
            Closure::Stack(c) => {
                if c.locals.borrow().contains_key(name) || c.upvalues.borrow().contains_key(name) {
                    return Err(ScriptError::runtime(format!("cannot delete local variable `{name}`")));
                }
                match &c.parent {
                    Some(parent) => parent.remove(name),
                    None => Ok(()),
                }
            }
        }
    }

    /// Records that `name` lives in register `index` of this activation.
    pub(crate) fn register_local(&self, name: &str, index: usize) {
        if let Closure::Stack(c) = self {
            c.locals.borrow_mut().insert(name.to_string(), index);
        }
    }

    /// Links `name` to the nearest enclosing activation that declares it.
    /// Later accesses in this frame reuse the link.
    pub(crate) fn capture_upvalue(&self, name: &str) {
        let Closure::Stack(frame) = self else { return };
        if frame.upvalues.borrow().contains_key(name) {
            return;
        }
        let mut cursor = frame.parent.clone();
        while let Some(scope) = cursor {
            let Closure::Stack(ancestor) = &*scope else { return };
            let index = ancestor.locals.borrow().get(name).copied();
            if let Some(index) = index {
                let upvalue = Upvalue { registers: Rc::clone(&ancestor.registers), index };
                frame.upvalues.borrow_mut().insert(name.to_string(), upvalue);
                return;
            }
            cursor = ancestor.parent.clone();
        }
    }
}

// ── Class ────────────────────────────────────────────────────────────

/// Classes and their instances share this representation; an instance
/// is a class whose `defining` link is set.
pub struct Class {
    name: String,
    parents: Vec<Rc<Class>>,
    instantiable: bool,
    define_vars: RefCell<HashMap<String, Value>>,
    members: RefCell<HashMap<String, Value>>,
    defining: Option<Rc<Class>>,
    factory: Option<Rc<HostFactory>>,
    host: Option<Rc<dyn Any>>,
}

impl Class {
    pub fn new(name: impl Into<String>) -> Self {
        Class {
            name: name.into(),
            parents: Vec::new(),
            instantiable: false,
            define_vars: RefCell::new(HashMap::new()),
            members: RefCell::new(HashMap::new()),
            defining: None,
            factory: None,
            host: None,
        }
    }

    pub fn extends(mut self, parent: Rc<Class>) -> Self {
        self.parents.push(parent);
        self
    }

    pub fn instantiable(mut self, yes: bool) -> Self {
        self.instantiable = yes;
        self
    }

    pub(crate) fn with_factory(mut self, factory: Rc<HostFactory>) -> Self {
        self.factory = Some(factory);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn parents(&self) -> &[Rc<Class>] {
        &self.parents
    }

    pub fn is_instance(&self) -> bool {
        self.defining.is_some()
    }

    pub fn defining_class(&self) -> Option<&Rc<Class>> {
        self.defining.as_ref()
    }

    pub fn host(&self) -> Option<&Rc<dyn Any>> {
        self.host.as_ref()
    }

    /// Default field value copied into every new instance.
    pub fn define_var(&self, name: &str, value: Value) {
        self.define_vars.borrow_mut().insert(name.to_string(), value);
    }

    pub fn set_member(&self, name: &str, value: Value) {
        self.members.borrow_mut().insert(name.to_string(), value);
    }

    pub fn own_member(&self, name: &str) -> Option<Value> {
        self.members.borrow().get(name).cloned()
    }

    pub fn remove_member(&self, name: &str) -> bool {
        self.members.borrow_mut().remove(name).is_some()
    }

    /// Own members, then parents depth-first in declaration order.
    pub fn find_member(&self, name: &str) -> Option<Value> {
        self.own_member(name)
            .or_else(|| self.parents.iter().find_map(|p| p.find_member(name)))
    }

    fn inherited(&self, name: &str) -> Option<Value> {
        match &self.defining {
            Some(def) => def.find_member(name),
            None => self.parents.iter().find_map(|p| p.find_member(name)),
        }
    }

    pub fn get_field(this: &Rc<Class>, engine: &Engine, name: &str) -> Result<Value> {
        let receiver = Value::class(Rc::clone(this));
        if let Some(own) = this.own_member(name) {
            return match own {
                Value::Object(Object::Property(p)) => p.bind_this(&receiver).get(engine),
                other => Ok(other),
            };
        }
        match this.inherited(name) {
            Some(Value::Object(Object::Function(f))) => Ok(Value::function(f.bind_this(receiver))),
            Some(Value::Object(Object::Property(p))) => p.bind_this(&receiver).get(engine),
            Some(other) => Ok(other),
            None => Err(ScriptError::runtime(format!(
                "member `{name}` does not exist in {}",
                this.name
            ))),
        }
    }

    /// Inherited property setters win; otherwise the value becomes an own member.
    pub fn set_field(this: &Rc<Class>, engine: &Engine, name: &str, value: Value) -> Result<()> {
        let target = match this.own_member(name) {
            Some(own) => Some(own),
            None => this.inherited(name),
        };
        if let Some(Value::Object(Object::Property(p))) = target {
            return p.bind_this(&Value::class(Rc::clone(this))).set(engine, value);
        }
        this.set_member(name, value);
        Ok(())
    }

    fn collect_defaults(&self, into: &mut HashMap<String, Value>) {
        for parent in &self.parents {
            parent.collect_defaults(into);
        }
        for (k, v) in self.define_vars.borrow().iter() {
            into.insert(k.clone(), v.clone());
        }
    }

    pub fn create_instance(this: &Rc<Class>, engine: &Engine, args: &[Value]) -> Result<Rc<Class>> {
        let def = this.defining.clone().unwrap_or_else(|| Rc::clone(this));
        if !def.instantiable {
            return Err(ScriptError::runtime(format!("class {} cannot be instantiated", def.name)));
        }
        let host = match &def.factory {
            Some(factory) => Some(factory(engine, args)?),
            None => None,
        };
        Ok(Class::instance(def, host))
    }

    /// An instance around an existing host value, bypassing the constructor.
    pub(crate) fn wrap_host(this: &Rc<Class>, host: Rc<dyn Any>) -> Rc<Class> {
        let def = this.defining.clone().unwrap_or_else(|| Rc::clone(this));
        Class::instance(def, Some(host))
    }

    fn instance(def: Rc<Class>, host: Option<Rc<dyn Any>>) -> Rc<Class> {
        let mut members = HashMap::new();
        def.collect_defaults(&mut members);
        Rc::new(Class {
            name: def.name.clone(),
            parents: Vec::new(),
            instantiable: def.instantiable,
            define_vars: RefCell::new(HashMap::new()),
            members: RefCell::new(members),
            defining: Some(def),
            factory: None,
            host,
        })
    }

    pub fn is_instance_of(&self, name: &str) -> bool {
        if let Some(def) = &self.defining {
            return def.is_instance_of(name);
        }
        name == self.name || name == "object" || self.parents.iter().any(|p| p.is_instance_of(name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::Engine;

    fn getter_returning(v: f64) -> Function {
        Function::native(move |_, _, _| Ok(Value::Number(v)))
    }

    #[test]
    fn normal_closure_chain() {
        let engine = Engine::new();
        let outer = Closure::normal(None);
        outer.define("a", Value::from(1));
        let inner = Closure::normal(Some(Rc::clone(&outer)));
        assert_eq!(inner.get_field(&engine, "a").unwrap().as_number(), Some(1.0));
        assert!(matches!(inner.get_field(&engine, "missing").unwrap(), Value::Undefined));

        inner.set_field(&engine, "a", Value::from(5)).unwrap();
        assert_eq!(outer.lookup("a").unwrap().as_number(), Some(5.0));
        inner.set_field(&engine, "fresh", Value::from(2)).unwrap();
        assert!(outer.lookup("fresh").is_some(), "unbound names land in the outermost scope");
    }

    #[test]
    fn closure_property_slot_uses_accessors() {
        let engine = Engine::new();
        let scope = Closure::normal(None);
        scope.define("p", Value::property(Property::new(Some(getter_returning(42.0)), None)));
        assert_eq!(scope.get_field(&engine, "p").unwrap().as_number(), Some(42.0));
        let err = scope.set_field(&engine, "p", Value::from(1)).unwrap_err();
        assert!(err.message.contains("no setter"));
    }

    #[test]
    fn upvalue_shares_ancestor_register() {
        let engine = Engine::new();
        let root = Closure::normal(None);
        let outer_regs: Registers = Rc::new(RefCell::new(vec![Value::Void, Value::from(7)]));
        let outer = Closure::activation(Rc::clone(&root), Rc::clone(&outer_regs));
        outer.register_local("x", 1);
        let inner = Closure::activation(Rc::clone(&outer), Rc::new(RefCell::new(vec![Value::Void])));
        inner.capture_upvalue("x");

        inner.set_field(&engine, "x", Value::from(9)).unwrap();
        assert_eq!(outer_regs.borrow()[1].as_number(), Some(9.0));
        outer_regs.borrow_mut()[1] = Value::from(11);
        assert_eq!(inner.get_field(&engine, "x").unwrap().as_number(), Some(11.0));
    }

    #[test]
    fn instances_copy_defaults_and_rebind_methods() {
        let engine = Engine::new();
        let base = Rc::new(Class::new("Base").instantiable(true));
        base.define_var("f", Value::from(1));
        base.set_member("who", Value::native(|_, this, _| Ok(this.clone())));
        let derived = Rc::new(Class::new("Derived").extends(Rc::clone(&base)).instantiable(true));

        let a = Class::create_instance(&derived, &engine, &[]).unwrap();
        let b = Class::create_instance(&derived, &engine, &[]).unwrap();
        Class::set_field(&a, &engine, "f", Value::from(5)).unwrap();
        assert_eq!(Class::get_field(&a, &engine, "f").unwrap().as_number(), Some(5.0));
        assert_eq!(Class::get_field(&b, &engine, "f").unwrap().as_number(), Some(1.0));

        let who = Class::get_field(&a, &engine, "who").unwrap();
        let this = who.call(&engine, &[]).unwrap();
        assert!(this.strict_equals(&Value::class(Rc::clone(&a))));
        assert!(a.is_instance_of("Base"));
        assert!(a.is_instance_of("object"));
        assert!(!a.is_instance_of("Other"));
    }

    #[test]
    fn inherited_property_setter_is_used() {
        let engine = Engine::new();
        let log: Rc<RefCell<Vec<f64>>> = Rc::default();
        let sink = Rc::clone(&log);
        let setter = Function::native(move |_, _, args| {
            sink.borrow_mut().push(args[0].to_number()?);
            Ok(Value::Void)
        });
        let base = Rc::new(Class::new("Base").instantiable(true));
        base.set_member("size", Value::property(Property::new(Some(getter_returning(3.0)), Some(setter))));
        let inst = Class::create_instance(&base, &engine, &[]).unwrap();
        Class::set_field(&inst, &engine, "size", Value::from(8)).unwrap();
        assert_eq!(*log.borrow(), vec![8.0]);
        assert!(inst.own_member("size").is_none());
        assert_eq!(Class::get_field(&inst, &engine, "size").unwrap().as_number(), Some(3.0));
    }

    #[test]
    fn own_property_getter_sees_the_instance() {
        let engine = Engine::new();
        let base = Rc::new(Class::new("Base").instantiable(true));
        let inst = Class::create_instance(&base, &engine, &[]).unwrap();
        let getter = Function::native(|_, this, _| Ok(this.clone()));
        inst.set_member("me", Value::property(Property::new(Some(getter), None)));
        let me = Class::get_field(&inst, &engine, "me").unwrap();
        assert!(me.strict_equals(&Value::class(Rc::clone(&inst))));
    }

    #[test]
    fn non_instantiable_class_errors() {
        let engine = Engine::new();
        let c = Rc::new(Class::new("Fixed"));
        let err = Class::create_instance(&c, &engine, &[]).err().unwrap();
        assert_eq!(err.message, "class Fixed cannot be instantiated");
    }

    #[test]
    fn missing_member_errors() {
        let engine = Engine::new();
        let c = Rc::new(Class::new("Empty"));
        assert!(Class::get_field(&c, &engine, "nope").is_err());
    }
}
