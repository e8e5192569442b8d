use std::rc::Rc;

use tjs::value::Closure;
use tjs::{Engine, EngineConfig, ErrorKind, HostClass, Value};

fn eval(source: &str) -> Value {
    Engine::new().eval(source).unwrap_or_else(|e| panic!("{source}\n{e}\n{}", e.backtrace()))
}

fn num(source: &str) -> f64 {
    eval(source).as_number().unwrap_or_else(|| panic!("{source} did not yield a number"))
}

// --- Core scenarios ---

#[test]
fn compound_assignment() {
    assert_eq!(num("var x = 1; x += 2; return x;"), 3.0);
}

#[test]
fn default_parameters() {
    assert_eq!(num("function f(a,b=10){return a+b;} return f(5);"), 15.0);
    assert_eq!(num("function f(a,b=10){return a+b;} return f(5, 1);"), 6.0);
}

#[test]
fn defaults_are_evaluated_where_the_function_is_defined() {
    let source = "var base = 2; function f(a, b = base * 3) { return a + b; } base = 100; return f(1);";
    assert_eq!(num(source), 7.0);
}

#[test]
fn inner_functions_share_captured_cells() {
    let source = "function make(){var x=0; function inc(){x+=1; return x;} function get(){return x;} \
                  var r = inc(); var r2 = get(); return r==1 && r2==1;} return make();";
    assert!(eval(source).truthy());
}

#[test]
fn captured_cells_outlive_their_frame() {
    let source = "function counter() { var n = 0; return function() { n += 1; return n; }; }\n\
                  var c = counter(); c(); c(); return c();";
    assert_eq!(num(source), 3.0);
    let source = "function counter() { var n = 0; return function() { n += 1; return n; }; }\n\
                  var a = counter(); var b = counter(); a(); a(); return b();";
    assert_eq!(num(source), 1.0);
}

#[test]
fn recursion() {
    assert_eq!(num("function fib(n) { if (n < 2) return n; return fib(n - 1) + fib(n - 2); } return fib(15);"), 610.0);
    let source = "function outer() { function fact(n) { return n <= 1 ? 1 : n * fact(n - 1); } return fact(5); }\n\
                  return outer();";
    assert_eq!(num(source), 120.0);
}

#[test]
fn nested_blocks_shadow() {
    let source = "function f() { var x = 1; { var x = 2; x += 1; } return x; } return f();";
    assert_eq!(num(source), 1.0);
}

// --- Classes ---

#[test]
fn inherited_methods_read_instance_fields() {
    let engine = Engine::new();
    let m = engine.eval("return function() { return this.f; };").unwrap();
    let base = engine.register_class(HostClass::new("Base").field("f", Value::from(1)).member("m", m));
    engine.register_class(HostClass::new("Derived").parent(base));

    let source = "var a = new Derived(); var b = new Derived(); a.f = 5; return a.m() * 10 + b.m();";
    assert_eq!(engine.eval(source).unwrap().as_number(), Some(51.0));
    assert_eq!(engine.eval("return new Base().m();").unwrap().as_number(), Some(1.0));
}

#[test]
fn instances_report_their_class() {
    let engine = Engine::new();
    let base = engine.register_class(HostClass::new("Base"));
    engine.register_class(HostClass::new("Derived").parent(base));
    assert_eq!(engine.eval("return new Derived() instanceof \"Base\";").unwrap().as_number(), Some(1.0));
    assert_eq!(engine.eval("return new Base() instanceof \"Derived\";").unwrap().as_number(), Some(0.0));
    assert_eq!(engine.eval("return typeof new Base();").unwrap().to_string(), "object");
}

// --- Errors ---

#[test]
fn error_trace_is_innermost_first() {
    let source = "function inner() { return undefinedThing.member; }\n\
                  function middle() { return inner(); }\n\
                  return middle();";
    let err = Engine::new().eval(source).unwrap_err();
    assert_eq!(err.kind, ErrorKind::Runtime);
    let lines: Vec<u32> = err.trace.iter().map(|p| p.line).collect();
    assert_eq!(lines, [1, 2, 3]);
}

#[test]
fn compile_errors_carry_one_position() {
    let err = Engine::new().eval("var x = 1;\nreturn x +;").unwrap_err();
    assert_eq!(err.kind, ErrorKind::Syntax);
    assert_eq!(err.trace.len(), 1);
    assert_eq!(err.trace[0].line, 2);

    let err = Engine::new().eval("return \"open;").unwrap_err();
    assert_eq!(err.kind, ErrorKind::Lexical);
}

#[test]
fn statements_are_rejected_inside_expressions() {
    let err = Engine::new().eval("var x = if (1) 2;").unwrap_err();
    assert_eq!(err.kind, ErrorKind::Syntax);
    let err = Engine::new().eval("switch (1) {}").unwrap_err();
    assert!(err.message.contains("not supported"), "{}", err.message);
}

#[test]
fn parameter_errors() {
    assert!(Engine::new().eval("function f(a, a) {}").is_err());
    assert!(Engine::new().eval("function f(a = 1, b) {}").is_err());
}

#[test]
fn assignment_needs_a_target() {
    let err = Engine::new().eval("1 = 2;").unwrap_err();
    assert!(err.message.contains("operand must be a variable"), "{}", err.message);
}

#[test]
fn engine_is_reusable_after_errors() {
    let engine = Engine::new();
    engine.eval("var kept = 4;").unwrap();
    assert!(engine.eval("return kept.nope.deeper;").is_err());
    assert!(engine.eval("return (;").is_err());
    assert_eq!(engine.eval("return kept;").unwrap().as_number(), Some(4.0));
}

// --- Arrays and strings ---

#[test]
fn arrays_grow_with_void() {
    let source = "var a = []; a[3] = \"x\"; return a.length * 10 + (a[1] == void_check());";
    let engine = Engine::new();
    engine.set_global("void_check", Value::native(|_, _, _| Ok(Value::Void)));
    assert_eq!(engine.eval(source).unwrap().as_number(), Some(41.0));
}

#[test]
fn array_growth_limit() {
    assert_eq!(num("var a = []; a[99999] = 1; return a.length;"), 100_000.0);
    let err = Engine::new().eval("var a = []; a[100000] = 1;").unwrap_err();
    assert!(err.message.contains("array size exceeds 100000"), "{}", err.message);

    let engine = Engine::with_config(EngineConfig { max_array_length: 4, ..EngineConfig::default() });
    assert!(engine.eval("var a = [1, 2, 3, 4]; a.add(5);").is_err());
}

#[test]
fn negative_indices() {
    assert_eq!(eval("var s = \"hello\"; return s[-1];").to_string(), "o");
    assert_eq!(num("var a = [1, 2, 3]; return a[-3];"), 1.0);
    assert_eq!(num("var a = [1, 2, 3]; a[-1] = 9; return a[2];"), 9.0);
    assert!(Engine::new().eval("var a = [1]; a[-2] = 0;").is_err());
}

#[test]
fn coercions() {
    assert!(eval("var v; return 0 == v;").truthy());
    assert!(eval("var v; return \"\" == v;").truthy());
    assert!(eval("return 1 == \"1\";").truthy());
    assert!(!eval("return 1 === \"1\";").truthy());
    assert_eq!(eval("return \"n=\" + 1.5;").to_string(), "n=1.5");
    assert_eq!(num("return \"3\" * \"4\";"), 12.0);
}

#[test]
fn aliasing_is_shared() {
    assert_eq!(num("var a = [1]; var b = a; b[0] = 7; return a[0];"), 7.0);
    assert_eq!(num("var d = %[k: 1]; function set(x) { x.k = 2; } set(d); return d.k;"), 2.0);
}

// --- Embedding ---

#[test]
fn scoped_eval() {
    let engine = Engine::new();
    let scope: Rc<Closure> = engine.new_scope();
    scope.define("mp", Value::from("left"));
    let v = engine.eval_in_closure("return mp + \"/\" + string typeof mp;", &scope).unwrap();
    assert_eq!(v.to_string(), "left/string");
}

#[test]
fn host_calls_script_functions() {
    let engine = Engine::new();
    let f = engine.eval("return function(x, y = 1) { return x + y; };").unwrap();
    assert_eq!(engine.call(&f, &[Value::from(2)]).unwrap().as_number(), Some(3.0));
    assert_eq!(engine.call(&f, &[Value::from(2), Value::from(5)]).unwrap().as_number(), Some(7.0));
}

#[test]
fn script_calls_host_functions() {
    let engine = Engine::new();
    engine.set_global("twice", Value::native(|_, _, args| Ok(Value::from(args[0].to_number()? * 2.0))));
    assert_eq!(engine.eval("return twice(21);").unwrap().as_number(), Some(42.0));
}

#[test]
fn host_errors_gain_script_positions() {
    let engine = Engine::new();
    engine.set_global("fail", Value::native(|_, _, _| Err(tjs::ScriptError::runtime("host refused"))));
    let err = engine.eval("var x = 1;\n\nfail();").unwrap_err();
    assert_eq!(err.message, "host refused");
    assert_eq!(err.trace.len(), 1);
    assert_eq!(err.trace[0].line, 3);
}
