//! Statically declared bindings for host types.
//!
//! A [`HostClass`] is a table of named members, each a typed closure the
//! embedder supplies up front. Instances carry the host value as an
//! `Rc<dyn Any>` that natives recover with [`Engine::host_data`].

use std::any::Any;
use std::rc::Rc;

use crate::engine::Engine;
use crate::error::Result;
use crate::value::{Class, Function, HostFactory, Property, Value};

pub struct HostClass {
    name: String,
    factory: Option<Rc<HostFactory>>,
    parents: Vec<Rc<Class>>,
    fields: Vec<(String, Value)>,
    members: Vec<(String, Value)>,
}

impl HostClass {
    pub fn new(name: impl Into<String>) -> Self {
        HostClass { name: name.into(), factory: None, parents: Vec::new(), fields: Vec::new(), members: Vec::new() }
    }

    /// Runs on `new Name(args)`; the result becomes the instance's host data.
    pub fn constructor<T: Any>(mut self, make: impl Fn(&Engine, &[Value]) -> Result<T> + 'static) -> Self {
        let factory: Rc<HostFactory> = Rc::new(move |engine: &Engine, args: &[Value]| -> Result<Rc<dyn Any>> {
            let data: Rc<dyn Any> = Rc::new(make(engine, args)?);
            Ok(data)
        });
        self.factory = Some(factory);
        self
    }

    pub fn method(
        mut self,
        name: &str,
        f: impl Fn(&Engine, &Value, &[Value]) -> Result<Value> + 'static,
    ) -> Self {
        self.members.push((name.to_string(), Value::native(f)));
        self
    }

    /// Read-only property.
    pub fn getter(mut self, name: &str, get: impl Fn(&Engine, &Value) -> Result<Value> + 'static) -> Self {
        let getter = Function::native(move |engine, this, _| get(engine, this));
        self.members.push((name.to_string(), Value::property(Property::new(Some(getter), None))));
        self
    }

    pub fn property(
        mut self,
        name: &str,
        get: impl Fn(&Engine, &Value) -> Result<Value> + 'static,
        set: impl Fn(&Engine, &Value, Value) -> Result<()> + 'static,
    ) -> Self {
        let getter = Function::native(move |engine, this, _| get(engine, this));
        let setter = Function::native(move |engine, this, args| {
            set(engine, this, args.first().cloned().unwrap_or_default())?;
            Ok(Value::Void)
        });
        self.members.push((name.to_string(), Value::property(Property::new(Some(getter), Some(setter)))));
        self
    }

    /// A shared member, such as a constant or a script function.
    pub fn member(mut self, name: &str, value: Value) -> Self {
        self.members.push((name.to_string(), value));
        self
    }

    /// Per-instance field initialised to `default`.
    pub fn field(mut self, name: &str, default: Value) -> Self {
        self.fields.push((name.to_string(), default));
        self
    }

    pub fn parent(mut self, class: Rc<Class>) -> Self {
        self.parents.push(class);
        self
    }

    pub fn build(self) -> Rc<Class> {
        let mut class = Class::new(self.name).instantiable(true);
        for parent in self.parents {
            class = class.extends(parent);
        }
        if let Some(factory) = self.factory {
            class = class.with_factory(factory);
        }
        for (name, value) in &self.fields {
            class.define_var(name, value.clone());
        }
        for (name, value) in &self.members {
            class.set_member(name, value.clone());
        }
        Rc::new(class)
    }
}
