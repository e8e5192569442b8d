use std::collections::HashMap;

use crate::bytecode::Chunk;

/// Names declared by one lexical block, mapped to their (negative) register.
#[derive(Debug, Default)]
struct Scope {
    names: HashMap<String, i32>,
}

/// Pending jump sites of the innermost enclosing loop.
#[derive(Debug, Default)]
pub(super) struct LoopLabels {
    pub breaks: Vec<usize>,
    pub continues: Vec<usize>,
}

/// Compile-time state of one function body (or the script itself).
pub(super) struct FunctionState {
    pub chunk: Chunk,
    scopes: Vec<Scope>,
    next_local: i32,
    loops: Vec<LoopLabels>,
}

impl FunctionState {
    /// The outermost program: no scope, so declarations go to the closure chain.
    pub fn script() -> Self {
        FunctionState { chunk: Chunk::new(None), scopes: Vec::new(), next_local: -1, loops: Vec::new() }
    }

    /// A function body whose parameters occupy registers -1, -2, ...
    pub fn function(name: Option<String>, params: &[String]) -> Self {
        let mut chunk = Chunk::new(name);
        chunk.param_count = params.len();
        let mut state = FunctionState { chunk, scopes: vec![Scope::default()], next_local: -1, loops: Vec::new() };
        for p in params {
            state.declare(p);
        }
        state
    }

    /// True while no block is open at script level.
    pub fn is_global_level(&self) -> bool {
        self.scopes.is_empty()
    }

    pub fn push_scope(&mut self) {
        self.scopes.push(Scope::default());
    }

    /// Slots are not recycled: a closure may still reach them by name.
    pub fn pop_scope(&mut self) {
        self.scopes.pop();
    }

    pub fn resolve(&self, name: &str) -> Option<i32> {
        self.scopes.iter().rev().find_map(|s| s.names.get(name).copied())
    }

    /// Redeclaring in the same block reuses the slot.
    pub fn declare(&mut self, name: &str) -> i32 {
        if self.scopes.is_empty() {
            self.scopes.push(Scope::default());
        }
        let scope = self.scopes.len() - 1;
        if let Some(&slot) = self.scopes[scope].names.get(name) {
            return slot;
        }
        let slot = self.next_local;
        self.next_local -= 1;
        self.scopes[scope].names.insert(name.to_string(), slot);
        self.chunk.local_floor = self.chunk.local_floor.min(slot);
        slot
    }

    pub fn push_loop(&mut self) {
        self.loops.push(LoopLabels::default());
    }

    pub fn pop_loop(&mut self) -> LoopLabels {
        self.loops.pop().unwrap_or_default()
    }

    pub fn current_loop(&mut self) -> Option<&mut LoopLabels> {
        self.loops.last_mut()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn params_take_the_first_negative_slots() {
        let f = FunctionState::function(Some("f".into()), &["a".into(), "b".into()]);
        assert_eq!(f.resolve("a"), Some(-1));
        assert_eq!(f.resolve("b"), Some(-2));
        assert_eq!(f.chunk.param_count, 2);
        assert_eq!(f.chunk.local_floor, -2);
    }

    #[test]
    fn inner_blocks_shadow_and_never_reuse_slots() {
        let mut f = FunctionState::function(None, &[]);
        let outer = f.declare("x");
        f.push_scope();
        let inner = f.declare("x");
        assert_ne!(outer, inner);
        assert_eq!(f.resolve("x"), Some(inner));
        f.pop_scope();
        assert_eq!(f.resolve("x"), Some(outer));
        f.push_scope();
        let fresh = f.declare("y");
        assert!(fresh < inner);
    }

    #[test]
    fn redeclaration_reuses_slot() {
        let mut f = FunctionState::function(None, &[]);
        assert_eq!(f.declare("x"), f.declare("x"));
    }

    #[test]
    fn script_level_has_no_scope() {
        let mut s = FunctionState::script();
        assert!(s.is_global_level());
        assert_eq!(s.resolve("x"), None);
        s.push_scope();
        assert!(!s.is_global_level());
    }
}
