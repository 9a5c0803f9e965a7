/// Core native functions.
///
/// The VM only specifies the binding mechanism (`register_native`); these are
/// the default bindings the CLI installs into the root environment. Hosts
/// embedding the VM can skip `install_core` and register their own set.
///
/// Every native receives the implicit receiver as args[0]; user arguments
/// start at args[1]. Declared arity counts the receiver.

use once_cell::sync::Lazy;
use std::time::Instant;

use crate::core::value::Value;
use crate::errors::RuntimeError;
use crate::gc::Object;
use crate::vm::Vm;

static PROCESS_START: Lazy<Instant> = Lazy::new(Instant::now);

pub fn install_core(vm: &mut Vm) {
    // Reading the lazy cell here pins the epoch to install time at the
    // latest, so the first `clock()` call does not measure zero.
    Lazy::force(&PROCESS_START);

    vm.register_native("print", 2, true, native_print);
    vm.register_native("toInt", 2, false, native_to_int);
    vm.register_native("toFloat", 2, false, native_to_float);
    vm.register_native("toStr", 2, false, native_to_str);
    vm.register_native("len", 2, false, native_len);
    vm.register_native("typeOf", 2, false, native_type_of);
    vm.register_native("clock", 1, false, native_clock);
}

fn native_print(vm: &mut Vm, args: &[Value]) -> Result<Value, RuntimeError> {
    let rendered: Vec<String> = args[1..].iter().map(|v| vm.heap().display_value(v)).collect();
    let mut line = rendered.join(" ");
    line.push('\n');
    vm.print(&line);
    Ok(Value::Nil)
}

fn native_to_int(vm: &mut Vm, args: &[Value]) -> Result<Value, RuntimeError> {
    Ok(match args[1] {
        Value::Int(n) => Value::Int(n),
        Value::Float(f) => Value::Int(f.trunc() as i64),
        Value::Bool(b) => Value::Int(b as i64),
        Value::Obj(h) => match vm.heap().as_str(h) {
            Some(s) => s.trim().parse::<i64>().map(Value::Int).unwrap_or(Value::Nil),
            None => Value::Nil,
        },
        Value::Nil => Value::Nil,
    })
}

fn native_to_float(vm: &mut Vm, args: &[Value]) -> Result<Value, RuntimeError> {
    Ok(match args[1] {
        Value::Int(n) => Value::Float(n as f64),
        Value::Float(f) => Value::Float(f),
        Value::Obj(h) => match vm.heap().as_str(h) {
            Some(s) => s.trim().parse::<f64>().map(Value::Float).unwrap_or(Value::Nil),
            None => Value::Nil,
        },
        _ => Value::Nil,
    })
}

fn native_to_str(vm: &mut Vm, args: &[Value]) -> Result<Value, RuntimeError> {
    let rendered = vm.heap().display_value(&args[1]);
    let handle = vm.allocate_string(&rendered);
    Ok(Value::Obj(handle))
}

fn native_len(vm: &mut Vm, args: &[Value]) -> Result<Value, RuntimeError> {
    let len = match args[1] {
        Value::Obj(h) => match vm.heap().get(h) {
            Object::Str(s) => Some(s.chars().count()),
            Object::List(items) => Some(items.len()),
            Object::Map(m) => Some(m.len()),
            _ => None,
        },
        _ => None,
    };
    match len {
        Some(n) => Ok(Value::Int(n as i64)),
        None => Err(RuntimeError::Type {
            message: format!("len() expects a list, map or string, got {}",
                vm.heap().value_type_name(&args[1])),
            line: 0,
        }),
    }
}

fn native_type_of(vm: &mut Vm, args: &[Value]) -> Result<Value, RuntimeError> {
    let name = vm.heap().value_type_name(&args[1]).to_string();
    let handle = vm.allocate_string(&name);
    Ok(Value::Obj(handle))
}

fn native_clock(_vm: &mut Vm, _args: &[Value]) -> Result<Value, RuntimeError> {
    Ok(Value::Float(PROCESS_START.elapsed().as_secs_f64()))
}
