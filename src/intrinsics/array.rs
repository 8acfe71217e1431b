// File: src/intrinsics/array.rs
//
// Intrinsic methods on array receivers. Callback-taking methods (map,
// filter, reduce, find) snapshot the elements before invoking user code so a
// callback touching the same array cannot deadlock on the element mutex.

use std::sync::Arc;

use crate::value::{format_value, values_equal, Array, Value};
use crate::vm::{Vm, VmError};

use super::IntrinsicFn;

pub fn lookup(name: &str) -> Option<IntrinsicFn> {
    Some(match name {
        "push" => push,
        "pop" => pop,
        "shift" => shift,
        "unshift" => unshift,
        "join" => join,
        "map" => map,
        "filter" => filter,
        "reduce" => reduce,
        "slice" => slice,
        "concat" => concat,
        "find" => find,
        "contains" => contains,
        "first" => first,
        "last" => last,
        "clear" => clear,
        "reverse" => reverse,
        "insert" => insert,
        "remove" => remove,
        _ => return None,
    })
}

fn expect_array(receiver: &Value) -> &Arc<Array> {
    match receiver {
        Value::Array(array) => array,
        _ => unreachable!("array intrinsic on non-array"),
    }
}

fn expect_callback(args: &[Value], method: &str) -> Result<Value, VmError> {
    match args.first() {
        Some(value @ (Value::Function(_) | Value::Builtin(_))) => Ok(value.clone()),
        _ => Err(VmError::exception(format!("{} expects a function", method))),
    }
}

fn snapshot(array: &Arc<Array>) -> Vec<Value> {
    array.elements.lock().unwrap().clone()
}

fn push(_vm: &mut Vm, receiver: &Value, args: Vec<Value>) -> Result<Value, VmError> {
    let array = expect_array(receiver);
    let mut elements = array.elements.lock().unwrap();
    for arg in args {
        elements.push(arg);
    }
    Ok(Value::I64(elements.len() as i64))
}

fn pop(_vm: &mut Vm, receiver: &Value, _args: Vec<Value>) -> Result<Value, VmError> {
    Ok(expect_array(receiver).elements.lock().unwrap().pop().unwrap_or(Value::Null))
}

fn shift(_vm: &mut Vm, receiver: &Value, _args: Vec<Value>) -> Result<Value, VmError> {
    let array = expect_array(receiver);
    let mut elements = array.elements.lock().unwrap();
    if elements.is_empty() {
        return Ok(Value::Null);
    }
    Ok(elements.remove(0))
}

fn unshift(_vm: &mut Vm, receiver: &Value, args: Vec<Value>) -> Result<Value, VmError> {
    let array = expect_array(receiver);
    let mut elements = array.elements.lock().unwrap();
    for (i, arg) in args.into_iter().enumerate() {
        elements.insert(i, arg);
    }
    Ok(Value::I64(elements.len() as i64))
}

fn join(_vm: &mut Vm, receiver: &Value, args: Vec<Value>) -> Result<Value, VmError> {
    let separator = match args.first() {
        Some(Value::Str(s)) => s.as_str().to_string(),
        Some(other) => {
            return Err(VmError::exception(format!(
                "join expects a string separator, got {}",
                other.kind_name()
            )))
        }
        None => ",".to_string(),
    };
    let elements = snapshot(expect_array(receiver));
    let parts: Vec<String> = elements.iter().map(format_value).collect();
    Ok(Value::str(parts.join(&separator)))
}

fn map(vm: &mut Vm, receiver: &Value, args: Vec<Value>) -> Result<Value, VmError> {
    let callback = expect_callback(&args, "map")?;
    let elements = snapshot(expect_array(receiver));
    let mut result = Vec::with_capacity(elements.len());
    for element in elements {
        result.push(vm.call_function_value(&callback, vec![element])?);
    }
    Ok(Value::array(result))
}

fn filter(vm: &mut Vm, receiver: &Value, args: Vec<Value>) -> Result<Value, VmError> {
    let callback = expect_callback(&args, "filter")?;
    let elements = snapshot(expect_array(receiver));
    let mut result = Vec::new();
    for element in elements {
        if vm.call_function_value(&callback, vec![element.clone()])?.is_truthy() {
            result.push(element);
        }
    }
    Ok(Value::array(result))
}

fn reduce(vm: &mut Vm, receiver: &Value, args: Vec<Value>) -> Result<Value, VmError> {
    let callback = expect_callback(&args, "reduce")?;
    let elements = snapshot(expect_array(receiver));
    let mut iter = elements.into_iter();
    let mut accumulator = match args.get(1) {
        Some(initial) => initial.clone(),
        None => iter.next().ok_or_else(|| {
            VmError::exception("Reduce of empty array with no initial value")
        })?,
    };
    for element in iter {
        accumulator = vm.call_function_value(&callback, vec![accumulator, element])?;
    }
    Ok(accumulator)
}

/// Clamp a possibly-negative index the way slice arguments expect.
fn clamp_index(value: Option<&Value>, len: usize, default: usize) -> usize {
    match value.and_then(Value::as_i128) {
        Some(n) if n < 0 => len.saturating_sub((-n) as usize),
        Some(n) => (n as usize).min(len),
        None => default,
    }
}

fn slice(_vm: &mut Vm, receiver: &Value, args: Vec<Value>) -> Result<Value, VmError> {
    let elements = snapshot(expect_array(receiver));
    let len = elements.len();
    let start = clamp_index(args.first(), len, 0);
    let end = clamp_index(args.get(1), len, len);
    let result = if start < end { elements[start..end].to_vec() } else { Vec::new() };
    Ok(Value::array(result))
}

fn concat(_vm: &mut Vm, receiver: &Value, args: Vec<Value>) -> Result<Value, VmError> {
    let mut result = snapshot(expect_array(receiver));
    for arg in &args {
        match arg {
            Value::Array(other) => result.extend(other.elements.lock().unwrap().iter().cloned()),
            other => result.push(other.clone()),
        }
    }
    Ok(Value::array(result))
}

fn find(vm: &mut Vm, receiver: &Value, args: Vec<Value>) -> Result<Value, VmError> {
    let callback = expect_callback(&args, "find")?;
    let elements = snapshot(expect_array(receiver));
    for element in elements {
        if vm.call_function_value(&callback, vec![element.clone()])?.is_truthy() {
            return Ok(element);
        }
    }
    Ok(Value::Null)
}

fn contains(_vm: &mut Vm, receiver: &Value, args: Vec<Value>) -> Result<Value, VmError> {
    let Some(needle) = args.first() else {
        return Err(VmError::exception("contains expects a value"));
    };
    let elements = snapshot(expect_array(receiver));
    Ok(Value::Bool(elements.iter().any(|e| values_equal(e, needle))))
}

fn first(_vm: &mut Vm, receiver: &Value, _args: Vec<Value>) -> Result<Value, VmError> {
    Ok(expect_array(receiver).get(0).unwrap_or(Value::Null))
}

fn last(_vm: &mut Vm, receiver: &Value, _args: Vec<Value>) -> Result<Value, VmError> {
    let array = expect_array(receiver);
    let elements = array.elements.lock().unwrap();
    Ok(elements.last().cloned().unwrap_or(Value::Null))
}

fn clear(_vm: &mut Vm, receiver: &Value, _args: Vec<Value>) -> Result<Value, VmError> {
    expect_array(receiver).elements.lock().unwrap().clear();
    Ok(Value::Null)
}

fn reverse(_vm: &mut Vm, receiver: &Value, _args: Vec<Value>) -> Result<Value, VmError> {
    expect_array(receiver).elements.lock().unwrap().reverse();
    Ok(receiver.clone())
}

fn insert(_vm: &mut Vm, receiver: &Value, args: Vec<Value>) -> Result<Value, VmError> {
    let index = args
        .first()
        .and_then(Value::as_index)
        .ok_or_else(|| VmError::exception("insert expects an index"))?;
    let Some(value) = args.get(1) else {
        return Err(VmError::exception("insert expects a value"));
    };
    let array = expect_array(receiver);
    let mut elements = array.elements.lock().unwrap();
    if index > elements.len() {
        return Err(VmError::exception("Insert index out of range"));
    }
    elements.insert(index, value.clone());
    Ok(Value::Null)
}

fn remove(_vm: &mut Vm, receiver: &Value, args: Vec<Value>) -> Result<Value, VmError> {
    let index = args
        .first()
        .and_then(Value::as_index)
        .ok_or_else(|| VmError::exception("remove expects an index"))?;
    let array = expect_array(receiver);
    let mut elements = array.elements.lock().unwrap();
    if index >= elements.len() {
        return Err(VmError::exception("Remove index out of range"));
    }
    Ok(elements.remove(index))
}
