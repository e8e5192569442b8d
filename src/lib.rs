//! An embeddable scripting engine for a TJS subset.
//!
//! Source text is compiled in a single pass to register bytecode and run by
//! a register-window VM. Embedders drive it through [`Engine::eval`] and
//! [`Engine::eval_in_closure`], and expose native types with [`HostClass`].
//!
//! ```
//! let engine = tjs::Engine::new();
//! let v = engine.eval("function f(a, b = 10) { return a + b; } return f(5);").unwrap();
//! assert_eq!(v.as_number(), Some(15.0));
//! ```

mod builtins;
pub mod bytecode;
pub mod compiler;
pub mod diagnostic;
pub mod engine;
pub mod error;
pub mod lexer;
pub mod value;
pub mod vm;

pub use engine::{Engine, EngineConfig, HostClass};
pub use error::{ErrorKind, Result, ScriptError};
pub use value::Value;
