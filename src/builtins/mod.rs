//! Members of the four prototype classes and the global helpers.
//!
//! Every native here receives the boxed primitive as `this`.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::sync::LazyLock;

use regex::Regex;

use crate::engine::Engine;
use crate::error::{Result, ScriptError};
use crate::value::{array_resize, array_set, resolve_index, ArrayRef, Class, Function, Object, Property, Value};

static PLACEHOLDER: LazyLock<Option<Regex>> = LazyLock::new(|| Regex::new(r"\{(\d+)\}").ok());

/// Binds the prototype classes and `log` into the engine's global scope.
pub fn install(engine: &Engine) {
    install_number(engine.number_class());
    install_string(engine.string_class());
    install_array(engine.array_class());

    engine.set_global("int", Value::class(engine.number_class().clone()));
    engine.set_global("string", Value::class(engine.string_class().clone()));
    engine.set_global("array", Value::class(engine.array_class().clone()));
    engine.set_global("dictionary", Value::class(engine.dict_class().clone()));
    engine.set_global("log", Value::native(log));
}

fn log(_: &Engine, _: &Value, args: &[Value]) -> Result<Value> {
    let line = args.iter().map(Value::to_string).collect::<Vec<_>>().join(",");
    tracing::info!(target: "tjs::script", "{line}");
    Ok(Value::Void)
}

// ── Helpers ──────────────────────────────────────────────────────────

fn arg(args: &[Value], i: usize) -> Value {
    args.get(i).cloned().unwrap_or_default()
}

fn require(name: &str, args: &[Value], n: usize) -> Result<()> {
    if args.len() < n {
        return Err(ScriptError::runtime(format!("{name}: expected {n} args, got {}", args.len())));
    }
    Ok(())
}

fn method(class: &Class, name: &str, f: impl Fn(&Engine, &Value, &[Value]) -> Result<Value> + 'static) {
    class.set_member(name, Value::native(f));
}

fn text<'a>(name: &str, this: &'a Value) -> Result<&'a str> {
    this.as_str()
        .ok_or_else(|| ScriptError::runtime(format!("{name}: only strings have this method")))
}

fn array<'a>(name: &str, this: &'a Value) -> Result<&'a ArrayRef> {
    this.as_array()
        .ok_or_else(|| ScriptError::runtime(format!("{name}: only arrays have this method")))
}

/// Char offset `start` as a byte offset into `s`, clamped to the end.
fn byte_offset(s: &str, start: usize) -> usize {
    s.char_indices().nth(start).map(|(i, _)| i).unwrap_or(s.len())
}

// ── Number ───────────────────────────────────────────────────────────

fn install_number(class: &Class) {
    method(class, "toString", |_, this, _| Ok(Value::from(this.to_string())));
}

// ── String ───────────────────────────────────────────────────────────

fn install_string(class: &Class) {
    let length = Function::native(|_, this, _| Ok(Value::from(text("length", this)?.chars().count())));
    class.set_member("length", Value::property(Property::new(Some(length), None)));

    method(class, "toString", |_, this, _| Ok(Value::from(text("toString", this)?)));

    method(class, "startsWith", |_, this, args| {
        require("startsWith", args, 1)?;
        let s = text("startsWith", this)?;
        Ok(Value::from(s.starts_with(&*args[0].to_string())))
    });

    method(class, "indexOf", |_, this, args| {
        require("indexOf", args, 1)?;
        let s = text("indexOf", this)?;
        let needle = args[0].to_string();
        let start = arg(args, 1).to_int()?.max(0) as usize;
        if start > s.chars().count() {
            return Ok(Value::from(-1));
        }
        let from = byte_offset(s, start);
        let found = s[from..].find(&needle).map(|pos| s[..from + pos].chars().count());
        Ok(found.map(Value::from).unwrap_or(Value::from(-1)))
    });

    method(class, "toLowerCase", |_, this, _| Ok(Value::from(text("toLowerCase", this)?.to_lowercase())));
    method(class, "toUpperCase", |_, this, _| Ok(Value::from(text("toUpperCase", this)?.to_uppercase())));

    let substring = |_: &Engine, this: &Value, args: &[Value]| -> Result<Value> {
        require("substring", args, 1)?;
        let s = text("substring", this)?;
        let count = s.chars().count();
        let start = args[0].to_int()?;
        if start < 0 || start as usize > count {
            return Err(ScriptError::runtime(format!("substring: start {start} out of range")));
        }
        let rest = count - start as usize;
        let len = match args.get(1) {
            Some(v) => {
                let len = v.to_int()?;
                if len < 0 || len as usize > rest {
                    return Err(ScriptError::runtime(format!("substring: length {len} out of range")));
                }
                len as usize
            }
            None => rest,
        };
        Ok(Value::from(s.chars().skip(start as usize).take(len).collect::<String>()))
    };
    method(class, "substring", substring);
    method(class, "substr", substring);

    method(class, "format", |_, this, args| {
        let s = text("format", this)?;
        let re = PLACEHOLDER
            .as_ref()
            .ok_or_else(|| ScriptError::runtime("format: placeholder pattern unavailable"))?;
        let mut out = String::with_capacity(s.len());
        let mut last = 0;
        for caps in re.captures_iter(s) {
            let (Some(whole), Some(index)) = (caps.get(0), caps.get(1)) else { continue };
            let value = index
                .as_str()
                .parse::<usize>()
                .ok()
                .and_then(|i| args.get(i))
                .ok_or_else(|| ScriptError::runtime(format!("format: no argument for {}", whole.as_str())))?;
            out.push_str(&s[last..whole.start()]);
            out.push_str(&value.to_string());
            last = whole.end();
        }
        out.push_str(&s[last..]);
        Ok(Value::from(out))
    });
}

// ── Array ────────────────────────────────────────────────────────────

fn install_array(class: &Class) {
    let length = Property::new(
        Some(Function::native(|_, this, _| Ok(Value::from(array("length", this)?.borrow().len())))),
        Some(Function::native(|engine, this, args| {
            let len = arg(args, 0).to_number()?;
            if len < 0.0 {
                return Err(ScriptError::runtime("length cannot be negative"));
            }
            array_resize(array("length", this)?, len, engine.config().max_array_length)?;
            Ok(Value::Void)
        })),
    );
    class.set_member("length", Value::property(length.clone()));
    class.set_member("count", Value::property(length));

    method(class, "add", |engine, this, args| {
        let a = array("add", this)?;
        let index = a.borrow().len();
        array_set(a, index as i64, arg(args, 0), engine.config().max_array_length)?;
        Ok(Value::from(index))
    });

    method(class, "insert", |engine, this, args| {
        let a = array("insert", this)?;
        let requested = arg(args, 0).to_int()? as i64;
        let mut items = a.borrow_mut();
        let len = items.len() as i64;
        let index = if requested < 0 { requested + len } else { requested };
        if !(0..=len).contains(&index) {
            return Err(ScriptError::runtime(format!("insert: index {requested} out of range")));
        }
        if items.len() >= engine.config().max_array_length {
            return Err(ScriptError::runtime(format!("array size exceeds {}", engine.config().max_array_length)));
        }
        items.insert(index as usize, arg(args, 1));
        Ok(Value::Void)
    });

    method(class, "erase", |_, this, args| {
        let a = array("erase", this)?;
        let requested = arg(args, 0).to_int()? as i64;
        let mut items = a.borrow_mut();
        let index = resolve_index(requested, items.len())
            .ok_or_else(|| ScriptError::runtime(format!("erase: index {requested} out of range")))?;
        items.remove(index);
        Ok(Value::Void)
    });

    method(class, "remove", |_, this, args| {
        let a = array("remove", this)?;
        let target = arg(args, 0);
        let all = args.get(1).map(Value::truthy).unwrap_or(true);
        let mut items = a.borrow_mut();
        if all {
            items.retain(|v| !v.strict_equals(&target));
        } else if let Some(i) = items.iter().position(|v| v.strict_equals(&target)) {
            items.remove(i);
        }
        Ok(Value::Void)
    });

    method(class, "find", |_, this, args| {
        let a = array("find", this)?;
        let target = arg(args, 0);
        let items = a.borrow();
        let start = arg(args, 1).to_int()? as i64;
        let start = if start < 0 { (start + items.len() as i64).max(0) } else { start };
        let start = start as usize;
        let found = items.iter().skip(start).position(|v| v.strict_equals(&target)).map(|i| i + start);
        Ok(found.map(Value::from).unwrap_or(Value::from(-1)))
    });

    method(class, "clear", |_, this, _| {
        array("clear", this)?.borrow_mut().clear();
        Ok(Value::Void)
    });

    method(class, "reverse", |_, this, _| {
        array("reverse", this)?.borrow_mut().reverse();
        Ok(Value::Void)
    });

    method(class, "sort", |_, this, args| {
        let a = array("sort", this)?;
        let mode = match args.first() {
            Some(v) if !v.is_void() => v.to_string(),
            _ => "+".to_string(),
        };
        let items = std::mem::take(&mut *a.borrow_mut());
        let sorted = sort_values(items, &mode);
        match sorted {
            Ok(items) => {
                *a.borrow_mut() = items;
                Ok(Value::Void)
            }
            Err((items, e)) => {
                *a.borrow_mut() = items;
                Err(e)
            }
        }
    });

    method(class, "join", |_, this, args| {
        let a = array("join", this)?;
        let sep = arg(args, 0).to_string();
        let skip_empty = arg(args, 2).truthy();
        let parts: Vec<String> = a
            .borrow()
            .iter()
            .filter(|v| !(skip_empty && v.is_void()))
            .map(Value::to_string)
            .collect();
        Ok(Value::from(parts.join(&sep)))
    });

    method(class, "split", |_, _, args| {
        let sep = arg(args, 0).to_string();
        let source = arg(args, 1).to_string();
        let skip_empty = arg(args, 3).truthy();
        let pieces: Vec<&str> = if sep.is_empty() {
            vec![source.as_str()]
        } else {
            source.split(sep.as_str()).collect()
        };
        let items = pieces
            .into_iter()
            .filter(|p| !(skip_empty && p.is_empty()))
            .map(Value::from)
            .collect();
        Ok(Value::array(items))
    });

    let assign = |_: &Engine, this: &Value, args: &[Value]| -> Result<Value> {
        let a = array("assign", this)?;
        let items = flatten(&arg(args, 0));
        *a.borrow_mut() = items;
        Ok(Value::Void)
    };
    method(class, "assign", assign);
    method(class, "copy", assign);

    let assign_struct = |_: &Engine, this: &Value, args: &[Value]| -> Result<Value> {
        let a = array("assignStruct", this)?;
        let items = flatten(&deep_clone(&arg(args, 0), &mut Vec::new())?);
        *a.borrow_mut() = items;
        Ok(Value::Void)
    };
    method(class, "assignStruct", assign_struct);
    method(class, "deepcopy", assign_struct);
}

/// Array contents for `assign`: arrays copy, dictionaries flatten to
/// key/value pairs, void clears, anything else becomes one element.
fn flatten(source: &Value) -> Vec<Value> {
    match source {
        Value::Void | Value::Undefined => Vec::new(),
        Value::Object(Object::Array(items)) => items.borrow().clone(),
        Value::Object(Object::Dict(entries)) => entries
            .borrow()
            .iter()
            .flat_map(|(k, v)| [Value::from(k.as_str()), v.clone()])
            .collect(),
        other => vec![other.clone()],
    }
}

/// Copies arrays and dictionaries recursively; other objects stay shared.
/// `ancestors` holds the containers being copied, so a cycle is an error.
fn deep_clone(value: &Value, ancestors: &mut Vec<Object>) -> Result<Value> {
    let Value::Object(obj @ (Object::Array(_) | Object::Dict(_))) = value else {
        return Ok(value.clone());
    };
    if ancestors.iter().any(|a| a.ptr_eq(obj)) {
        return Err(ScriptError::runtime("deepcopy: structure contains itself"));
    }
    ancestors.push(obj.clone());
    let copied = match obj {
        Object::Array(items) => Value::array(
            items
                .borrow()
                .iter()
                .map(|v| deep_clone(v, ancestors))
                .collect::<Result<Vec<_>>>()?,
        ),
        Object::Dict(entries) => Value::dict(
            entries
                .borrow()
                .iter()
                .map(|(k, v)| Ok((k.clone(), deep_clone(v, ancestors)?)))
                .collect::<Result<BTreeMap<_, _>>>()?,
        ),
        _ => value.clone(),
    };
    ancestors.pop();
    Ok(copied)
}

fn rank(v: &Value) -> u8 {
    match v {
        Value::Void | Value::Undefined => 0,
        Value::Number(_) => 1,
        Value::Str(_) => 2,
        Value::Object(_) => 3,
    }
}

/// Void, then numbers, then strings, then objects in their original order.
fn natural_order(a: &Value, b: &Value) -> Ordering {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.total_cmp(y),
        (Value::Str(x), Value::Str(y)) => x.cmp(y),
        _ => rank(a).cmp(&rank(b)),
    }
}

/// Hands the items back alongside the error so the array is left intact.
fn sort_values(mut items: Vec<Value>, mode: &str) -> std::result::Result<Vec<Value>, (Vec<Value>, ScriptError)> {
    match mode {
        "+" => items.sort_by(natural_order),
        "-" => items.sort_by(|a, b| natural_order(b, a)),
        "0" | "9" => {
            let keys: Result<Vec<f64>> = items.iter().map(Value::to_number).collect();
            let keys = match keys {
                Ok(keys) => keys,
                Err(e) => return Err((items, e)),
            };
            let mut keyed: Vec<(f64, Value)> = keys.into_iter().zip(items).collect();
            if mode == "0" {
                keyed.sort_by(|a, b| a.0.total_cmp(&b.0));
            } else {
                keyed.sort_by(|a, b| b.0.total_cmp(&a.0));
            }
            items = keyed.into_iter().map(|(_, v)| v).collect();
        }
        "a" | "z" => {
            let mut keyed: Vec<(String, Value)> = items.into_iter().map(|v| (v.to_string(), v)).collect();
            if mode == "a" {
                keyed.sort_by(|a, b| a.0.cmp(&b.0));
            } else {
                keyed.sort_by(|a, b| b.0.cmp(&a.0));
            }
            items = keyed.into_iter().map(|(_, v)| v).collect();
        }
        other => {
            let e = ScriptError::runtime(format!("sort: unknown mode `{other}`"));
            return Err((items, e));
        }
    }
    Ok(items)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn eval(source: &str) -> Value {
        Engine::new().eval(source).unwrap()
    }

    fn text_of(source: &str) -> String {
        eval(source).to_string()
    }

    fn num(source: &str) -> f64 {
        eval(source).as_number().unwrap()
    }

    #[test]
    fn number_to_string() {
        assert_eq!(text_of("var n = 42; return n.toString();"), "42");
        assert_eq!(text_of("var n = 0.5; return n.toString();"), "0.5");
    }

    #[test]
    fn string_members() {
        assert_eq!(num("return \"héllo\".length;"), 5.0);
        assert_eq!(num("return \"hello\".startsWith(\"he\");"), 1.0);
        assert!(Engine::new().eval("return \"x\".startsWith();").is_err());
        assert_eq!(num("return \"abcabc\".indexOf(\"c\");"), 2.0);
        assert_eq!(num("return \"abcabc\".indexOf(\"c\", 3);"), 5.0);
        assert_eq!(num("return \"ééb\".indexOf(\"b\");"), 2.0);
        assert_eq!(num("return \"abc\".indexOf(\"z\");"), -1.0);
        assert_eq!(num("return \"abc\".indexOf(\"a\", 10);"), -1.0);
        assert_eq!(text_of("return \"MiXed\".toLowerCase();"), "mixed");
        assert_eq!(text_of("return \"MiXed\".toUpperCase();"), "MIXED");
        assert_eq!(text_of("return \"abcdef\".substring(2);"), "cdef");
        assert_eq!(text_of("return \"abcdef\".substr(1, 3);"), "bcd");
        assert!(Engine::new().eval("return \"abc\".substr(1, 5);").is_err());
    }

    #[test]
    fn string_format() {
        assert_eq!(text_of("return \"{1}-{0}-{1}\".format(\"a\", 2);"), "2-a-2");
        assert_eq!(text_of("return \"plain\".format();"), "plain");
        let err = Engine::new().eval("return \"{3}\".format(1);").unwrap_err();
        assert!(err.message.contains("{3}"));
    }

    #[test]
    fn array_length_and_count() {
        assert_eq!(num("var a = [1, 2, 3]; return a.count;"), 3.0);
        assert_eq!(num("var a = [1, 2, 3]; a.count = 5; return a.length;"), 5.0);
        assert!(eval("var a = [1]; a.length = 3; return a[2];").is_void());
        assert!(Engine::new().eval("var a = []; a.count = -1;").is_err());
    }

    #[test]
    fn add_returns_new_index() {
        assert_eq!(num("var a = [7]; return a.add(8);"), 1.0);
        assert_eq!(num("var a = []; a.add(1); a.add(2); return a.length;"), 2.0);
    }

    #[test]
    fn insert_and_erase() {
        assert_eq!(text_of("var a = [1, 3]; a.insert(1, 2); return a.join(\",\");"), "1,2,3");
        assert_eq!(text_of("var a = [1, 2]; a.insert(2, 3); return a.join(\",\");"), "1,2,3");
        assert_eq!(text_of("var a = [1, 3]; a.insert(-1, 2); return a.join(\",\");"), "1,2,3");
        assert!(Engine::new().eval("var a = [1]; a.insert(5, 0);").is_err());
        assert_eq!(text_of("var a = [1, 2, 3]; a.erase(-1); return a.join(\",\");"), "1,2");
        assert!(Engine::new().eval("var a = [1]; a.erase(1);").is_err());
    }

    #[test]
    fn remove_and_find() {
        assert_eq!(text_of("var a = [1, 2, 1, 3]; a.remove(1); return a.join(\",\");"), "2,3");
        assert_eq!(text_of("var a = [1, 2, 1]; a.remove(1, false); return a.join(\",\");"), "2,1");
        assert_eq!(text_of("var a = [1, \"1\"]; a.remove(\"1\"); return a.join(\",\");"), "1");
        assert_eq!(num("var a = [5, 6, 5]; return a.find(5, 1);"), 2.0);
        assert_eq!(num("var a = [5, 6]; return a.find(7);"), -1.0);
    }

    #[test]
    fn clear_and_reverse() {
        assert_eq!(text_of("var a = [1, 2, 3]; a.reverse(); return a.join(\"\");"), "321");
        assert_eq!(num("var a = [1, 2]; a.clear(); return a.length;"), 0.0);
    }

    #[test]
    fn sort_modes() {
        assert_eq!(text_of("var a = [3, 1, 2]; a.sort(); return a.join(\",\");"), "1,2,3");
        assert_eq!(text_of("var a = [3, 1, 2]; a.sort(\"-\"); return a.join(\",\");"), "3,2,1");
        assert_eq!(text_of("var a = [\"b\", 2, \"a\", 1]; a.sort(\"+\"); return a.join(\",\");"), "1,2,a,b");
        assert_eq!(text_of("var a = [\"10\", \"9\", \"100\"]; a.sort(\"0\"); return a.join(\",\");"), "9,10,100");
        assert_eq!(text_of("var a = [\"10\", \"9\", \"100\"]; a.sort(\"9\"); return a.join(\",\");"), "100,10,9");
        assert_eq!(text_of("var a = [10, 9, 100]; a.sort(\"a\"); return a.join(\",\");"), "10,100,9");
        assert_eq!(text_of("var a = [10, 9, 100]; a.sort(\"z\"); return a.join(\",\");"), "9,100,10");
    }

    #[test]
    fn sort_failure_keeps_contents() {
        let engine = Engine::new();
        assert!(engine.eval("var a = [2, [], 1]; a.sort(\"0\");").is_err());
        assert_eq!(engine.eval("return a.length;").unwrap().as_number(), Some(3.0));
        assert!(engine.eval("a.sort(\"?\");").is_err());
    }

    #[test]
    fn sort_is_stable() {
        let source = "var a = [10, \"10\", 9]; a.sort(\"a\"); return typeof a[0] + typeof a[1] + a[2];";
        assert_eq!(text_of(source), "numberstring9");
        let source = "var a = [\"1.0\", 1, \"1\"]; a.sort(\"9\"); return typeof a[0] + typeof a[1] + a[2];";
        assert_eq!(text_of(source), "stringnumber1");
    }

    #[test]
    fn join_and_split() {
        assert_eq!(text_of("var a = [1, , 2]; return a.join(\"-\");"), "1--2");
        assert_eq!(text_of("var a = [1, , 2]; return a.join(\"-\", 0, true);"), "1-2");
        assert_eq!(num("var a = []; var p = a.split(\",\", \"a,b,,c\"); return p.length;"), 4.0);
        assert_eq!(num("var a = []; var p = a.split(\",\", \"a,b,,c\", 0, true); return p.length;"), 3.0);
        assert_eq!(text_of("var a = []; var p = a.split(\"::\", \"x::y\"); return p[1];"), "y");
        assert_eq!(num("var a = [9]; a.split(\",\", \"q,r\"); return a.length;"), 1.0);
    }

    #[test]
    fn assign_copies_shallowly() {
        let source = "var inner = [1]; var src = [inner, 2]; var a = []; a.assign(src);\
                      inner[0] = 5; return a[0][0];";
        assert_eq!(num(source), 5.0);
        assert_eq!(text_of("var a = [1]; a.assign(%[x: 1]); return a.join(\",\");"), "x,1");
        assert_eq!(num("var v; var a = [1]; a.copy(v); return a.length;"), 0.0);
        assert_eq!(text_of("var a = [1]; a.assign(\"s\"); return a[0];"), "s");
    }

    #[test]
    fn deep_copy_detaches_nested_values() {
        let source = "var inner = [1]; var src = [inner]; var a = []; a.deepcopy(src);\
                      inner[0] = 5; return a[0][0];";
        assert_eq!(num(source), 1.0);
        let source = "var d = %[k: [1]]; var a = []; a.assignStruct(d); d.k[0] = 2; return a[1][0];";
        assert_eq!(num(source), 1.0);
    }

    #[test]
    fn deep_copy_rejects_cycles() {
        let err = Engine::new().eval("var a = []; a.add(a); var b = []; b.deepcopy(a);").unwrap_err();
        assert!(err.message.contains("contains itself"), "{}", err.message);
        assert!(Engine::new().eval("var d = %[k: 1]; d.self = d; var b = []; b.assignStruct(d);").is_err());
        let source = "var shared = [1]; var src = [shared, shared]; var b = []; b.deepcopy(src); return b.length;";
        assert_eq!(num(source), 2.0);
    }

    #[test]
    fn globals_name_the_prototypes() {
        assert_eq!(num("return \"s\" instanceof \"string\";"), 1.0);
        assert_eq!(text_of("return array.split(\",\", \"a,b\").join(\"+\");"), "a+b");
        assert!(eval("return log(\"hello\", [1, 2]);").is_void());
    }

    #[test]
    fn dictionaries_expose_length_only() {
        assert_eq!(num("var d = %[a: 1, \"b\" => 2]; return d.length;"), 2.0);
        assert!(matches!(eval("var d = %[]; return d.keys;"), Value::Undefined));
    }

    #[test]
    fn natural_order_ranks_kinds() {
        let mut v = vec![Value::from("a"), Value::from(2), Value::Void, Value::from(1)];
        v.sort_by(natural_order);
        assert_eq!(v.iter().map(Value::inspect).collect::<Vec<_>>(), ["void", "1", "2", "\"a\""]);
    }
}
