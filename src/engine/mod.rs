//! The embedding surface: one [`Engine`] owns a global scope, the four
//! prototype classes and the registered host classes.

use std::any::Any;
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::Rc;

use serde::{Deserialize, Serialize};

use crate::bytecode::Chunk;
use crate::error::{Result, ScriptError};
use crate::value::{Class, Closure, Object, Value};
use crate::{builtins, compiler, vm};

mod host;

pub use host::HostClass;

/// Tunable limits, loadable from JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Writes past this many elements fail instead of growing the array.
    pub max_array_length: usize,
    pub max_call_depth: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig { max_array_length: 100_000, max_call_depth: 200 }
    }
}

pub struct Engine {
    config: EngineConfig,
    global: Rc<Closure>,
    number_class: Rc<Class>,
    string_class: Rc<Class>,
    array_class: Rc<Class>,
    dict_class: Rc<Class>,
    depth: Cell<usize>,
    classes: RefCell<HashMap<String, Rc<Class>>>,
}

/// Decrements the call depth when a frame unwinds.
pub(crate) struct CallGuard<'a> {
    depth: &'a Cell<usize>,
}

impl Drop for CallGuard<'_> {
    fn drop(&mut self) {
        self.depth.set(self.depth.get().saturating_sub(1));
    }
}

impl Default for Engine {
    fn default() -> Self {
        Engine::new()
    }
}

impl Engine {
    pub fn new() -> Self {
        Engine::with_config(EngineConfig::default())
    }

    pub fn with_config(config: EngineConfig) -> Self {
        let engine = Engine {
            config,
            global: Closure::normal(None),
            number_class: Rc::new(Class::new("int")),
            string_class: Rc::new(Class::new("string")),
            array_class: Rc::new(Class::new("array")),
            dict_class: Rc::new(Class::new("dictionary")),
            depth: Cell::new(0),
            classes: RefCell::new(HashMap::new()),
        };
        builtins::install(&engine);
        engine
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn global(&self) -> &Rc<Closure> {
        &self.global
    }

    pub fn number_class(&self) -> &Rc<Class> {
        &self.number_class
    }

    pub fn string_class(&self) -> &Rc<Class> {
        &self.string_class
    }

    pub fn array_class(&self) -> &Rc<Class> {
        &self.array_class
    }

    pub fn dict_class(&self) -> &Rc<Class> {
        &self.dict_class
    }

    // ── Entry points ─────────────────────────────────────────────────

    pub fn compile(&self, source: &str) -> Result<Chunk> {
        compiler::compile(source)
    }

    /// Compiles and runs `source` against the global scope.
    pub fn eval(&self, source: &str) -> Result<Value> {
        self.run(source, Rc::clone(&self.global))
    }

    /// Like [`Engine::eval`], with `closure` as the script's enclosing scope.
    /// Names it binds are visible to the script; assignments to unbound
    /// names still land in the global scope.
    pub fn eval_in_closure(&self, source: &str, closure: &Rc<Closure>) -> Result<Value> {
        self.run(source, Rc::clone(closure))
    }

    fn run(&self, source: &str, scope: Rc<Closure>) -> Result<Value> {
        let chunk = Rc::new(self.compile(source)?);
        tracing::debug!(instructions = chunk.code.len(), constants = chunk.constants.len(), "run script");
        vm::execute(self, &chunk, scope, Value::Void, &[])
            .inspect_err(|e| tracing::debug!(error = %e, depth = e.trace.len(), "script failed"))
    }

    /// Calls a function or constructs a class instance from host code.
    pub fn call(&self, callee: &Value, args: &[Value]) -> Result<Value> {
        callee.call(self, args)
    }

    // ── Scopes ───────────────────────────────────────────────────────

    pub fn set_global(&self, name: &str, value: Value) {
        self.global.define(name, value);
    }

    pub fn get_global(&self, name: &str) -> Option<Value> {
        self.global.lookup(name)
    }

    /// A fresh scope chained to the global one, for [`Engine::eval_in_closure`].
    pub fn new_scope(&self) -> Rc<Closure> {
        Closure::normal(Some(Rc::clone(&self.global)))
    }

    // ── Call depth ───────────────────────────────────────────────────

    pub(crate) fn enter_call(&self) -> Result<CallGuard<'_>> {
        let depth = self.depth.get();
        if depth >= self.config.max_call_depth {
            return Err(ScriptError::runtime("call stack overflow"));
        }
        self.depth.set(depth + 1);
        Ok(CallGuard { depth: &self.depth })
    }

    /// Script frames currently on the stack.
    pub fn call_depth(&self) -> usize {
        self.depth.get()
    }

    // ── Host classes ─────────────────────────────────────────────────

    /// Builds `class` and binds it globally under its name.
    pub fn register_class(&self, class: HostClass) -> Rc<Class> {
        let built = class.build();
        let name = built.name().to_string();
        tracing::debug!(class = %name, "register host class");
        self.set_global(&name, Value::class(Rc::clone(&built)));
        self.classes.borrow_mut().insert(name, Rc::clone(&built));
        built
    }

    pub fn class(&self, name: &str) -> Option<Rc<Class>> {
        self.classes.borrow().get(name).cloned()
    }

    /// An instance of a registered class around an existing host value.
    pub fn wrap(&self, class_name: &str, value: impl Any) -> Result<Value> {
        let class = self
            .class(class_name)
            .ok_or_else(|| ScriptError::runtime(format!("class {class_name} is not registered")))?;
        Ok(Value::class(Class::wrap_host(&class, Rc::new(value))))
    }

    /// The host payload carried by `this`, for use inside native members.
    pub fn host_data<T: Any>(&self, this: &Value) -> Result<Rc<T>> {
        let Value::Object(Object::Class(instance)) = this else {
            return Err(ScriptError::runtime(format!("expected a host object, found {}", this.kind_name())));
        };
        let data = instance
            .host()
            .cloned()
            .ok_or_else(|| ScriptError::runtime(format!("{} carries no host data", instance.name())))?;
        data.downcast::<T>()
            .map_err(|_| ScriptError::runtime(format!("{} carries a different host type", instance.name())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_defaults_and_partial_json() {
        let cfg: EngineConfig = serde_json::from_str(r#"{"max_call_depth": 12}"#).unwrap();
        assert_eq!(cfg.max_call_depth, 12);
        assert_eq!(cfg.max_array_length, 100_000);
        assert_eq!(EngineConfig::default().max_call_depth, 200);
    }

    #[test]
    fn depth_guard_restores_on_drop() {
        let engine = Engine::with_config(EngineConfig { max_call_depth: 2, ..EngineConfig::default() });
        {
            let _a = engine.enter_call().unwrap();
            let _b = engine.enter_call().unwrap();
            assert_eq!(engine.call_depth(), 2);
            assert!(engine.enter_call().is_err());
        }
        assert_eq!(engine.call_depth(), 0);
    }

    #[test]
    fn prototype_classes_are_bound_globally() {
        let engine = Engine::new();
        for name in ["int", "string", "array", "dictionary"] {
            let class = engine.get_global(name).and_then(|v| v.as_class().cloned()).unwrap();
            assert_eq!(class.name(), name);
        }
        let err = engine.eval("return new array();").unwrap_err();
        assert!(err.message.contains("cannot be instantiated"), "{}", err.message);
    }

    #[test]
    fn globals_round_through_scripts() {
        let engine = Engine::new();
        engine.set_global("answer", Value::from(41));
        assert_eq!(engine.eval("answer += 1; return answer;").unwrap().as_number(), Some(42.0));
        assert_eq!(engine.get_global("answer").unwrap().as_number(), Some(42.0));
    }

    #[test]
    fn scoped_eval_sees_scope_and_globals() {
        let engine = Engine::new();
        engine.set_global("base", Value::from(10));
        let scope = engine.new_scope();
        scope.define("mp", Value::from(5));
        let v = engine.eval_in_closure("return mp + base;", &scope).unwrap();
        assert_eq!(v.as_number(), Some(15.0));
        assert!(matches!(engine.eval("return mp;").unwrap(), Value::Undefined));
    }

    #[test]
    fn engine_survives_failures() {
        let engine = Engine::new();
        assert!(engine.eval("return (;").is_err());
        assert!(engine.eval("return nothing.here;").is_err());
        assert_eq!(engine.eval("return 2;").unwrap().as_number(), Some(2.0));
        assert_eq!(engine.call_depth(), 0);
    }

    #[test]
    fn wrap_requires_registered_class() {
        let engine = Engine::new();
        assert!(engine.wrap("Nope", 1u8).is_err());
    }
}
