use super::heap::Gc;
use super::object::Obj;
use super::value::Value;
use super::vm::Vm;

pub fn install(vm: &mut Vm) {
    vm.define_native("clock", 0, clock);
    vm.define_native("sqrt", 1, sqrt);
    vm.define_native("str", 1, str_);
    vm.define_native("getField", 2, get_field);
    vm.define_native("setField", 3, set_field);
    vm.define_native("deleteField", 2, delete_field);
    vm.define_native("append", 2, append);
}

fn instance_arg(vm: &Vm, value: Value, who: &str) -> Result<Gc, String> {
    match value {
        Value::Obj(handle) if matches!(vm.heap.obj(handle), Obj::Instance(_)) => Ok(handle),
        _ => Err(format!("Argument to '{who}' must be an instance.")),
    }
}

fn string_arg(vm: &Vm, value: Value) -> Result<Gc, String> {
    match value {
        Value::Obj(handle) if matches!(vm.heap.obj(handle), Obj::Str(_)) => Ok(handle),
        _ => Err("Field name must be a string.".to_string()),
    }
}

/// Seconds since the VM came up.
fn clock(vm: &mut Vm, _args: &[Value]) -> Result<Value, String> {
    Ok(Value::Number(vm.uptime()))
}

fn sqrt(_vm: &mut Vm, args: &[Value]) -> Result<Value, String> {
    match args[0] {
        Value::Number(n) => Ok(Value::Number(n.sqrt())),
        _ => Err("Argument to 'sqrt' must be a number.".to_string()),
    }
}

/// The text `print` would produce, as an interned string value.
fn str_(vm: &mut Vm, args: &[Value]) -> Result<Value, String> {
    let text = vm.heap.show(args[0]);
    Ok(Value::Obj(vm.intern(&text)))
}

fn get_field(vm: &mut Vm, args: &[Value]) -> Result<Value, String> {
    let instance = instance_arg(vm, args[0], "getField")?;
    let name = string_arg(vm, args[1])?;

    let hash = vm.heap.string_hash(name);
    match vm.heap.instance(instance).fields.get(name, hash) {
        Some(value) => Ok(value),
        None => Err(format!("Undefined property '{}'.", vm.heap.string(name))),
    }
}

fn set_field(vm: &mut Vm, args: &[Value]) -> Result<Value, String> {
    let instance = instance_arg(vm, args[0], "setField")?;
    let name = string_arg(vm, args[1])?;

    let hash = vm.heap.string_hash(name);
    vm.heap
        .instance_mut(instance)
        .fields
        .set(name, hash, args[2]);
    Ok(Value::Nil)
}

fn delete_field(vm: &mut Vm, args: &[Value]) -> Result<Value, String> {
    let instance = instance_arg(vm, args[0], "deleteField")?;
    let name = string_arg(vm, args[1])?;

    let hash = vm.heap.string_hash(name);
    vm.heap.instance_mut(instance).fields.delete(name, hash);
    Ok(Value::Nil)
}

fn append(vm: &mut Vm, args: &[Value]) -> Result<Value, String> {
    let array = match args[0] {
        Value::Obj(handle) if matches!(vm.heap.obj(handle), Obj::Array(_)) => handle,
        _ => return Err("Argument to 'append' must be an array.".to_string()),
    };
    vm.heap.array_mut(array).items.push(args[1]);
    Ok(Value::Nil)
}
