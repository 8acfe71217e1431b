// File: src/intrinsics/string.rs
//
// Intrinsic methods on string receivers. Index-taking methods (char_at,
// substr, slice, find, chars) operate on Unicode codepoints; byte_at, bytes
// and to_bytes expose the raw UTF-8 encoding.

use std::sync::Arc;

use crate::value::{Buffer, HmString, Value};
use crate::vm::{Vm, VmError};

use super::IntrinsicFn;

pub fn lookup(name: &str) -> Option<IntrinsicFn> {
    Some(match name {
        "split" => split,
        "contains" => contains,
        "length" => length,
        "substr" => substr,
        "slice" => slice,
        "find" => find,
        "trim" => trim,
        "to_upper" => to_upper,
        "to_lower" => to_lower,
        "starts_with" => starts_with,
        "ends_with" => ends_with,
        "replace" => replace,
        "replace_all" => replace_all,
        "repeat" => repeat,
        "char_at" => char_at,
        "byte_at" => byte_at,
        "chars" => chars,
        "bytes" => bytes,
        "to_bytes" => to_bytes,
        "deserialize" => deserialize,
        _ => return None,
    })
}

fn expect_str(receiver: &Value) -> &Arc<HmString> {
    match receiver {
        Value::Str(s) => s,
        _ => unreachable!("string intrinsic on non-string"),
    }
}

fn str_arg<'a>(args: &'a [Value], index: usize, method: &str) -> Result<&'a str, VmError> {
    match args.get(index) {
        Some(Value::Str(s)) => Ok(s.as_str()),
        _ => Err(VmError::exception(format!("{} expects a string argument", method))),
    }
}

fn split(_vm: &mut Vm, receiver: &Value, args: Vec<Value>) -> Result<Value, VmError> {
    let text = expect_str(receiver).as_str();
    let separator = str_arg(&args, 0, "split")?;
    let parts: Vec<Value> = if separator.is_empty() {
        text.chars().map(|c| Value::str(c.to_string())).collect()
    } else {
        text.split(separator).map(Value::str).collect()
    };
    Ok(Value::array(parts))
}

fn contains(_vm: &mut Vm, receiver: &Value, args: Vec<Value>) -> Result<Value, VmError> {
    let needle = str_arg(&args, 0, "contains")?;
    Ok(Value::Bool(expect_str(receiver).as_str().contains(needle)))
}

fn length(_vm: &mut Vm, receiver: &Value, _args: Vec<Value>) -> Result<Value, VmError> {
    Ok(Value::I64(expect_str(receiver).char_count() as i64))
}

fn substr(_vm: &mut Vm, receiver: &Value, args: Vec<Value>) -> Result<Value, VmError> {
    let s = expect_str(receiver);
    let start = args
        .first()
        .and_then(Value::as_index)
        .ok_or_else(|| VmError::exception("substr expects a start index"))?;
    let count = args.get(1).and_then(Value::as_index).unwrap_or(usize::MAX);
    let result: String = s.as_str().chars().skip(start).take(count).collect();
    Ok(Value::str(result))
}

fn clamp_index(value: Option<&Value>, len: usize, default: usize) -> usize {
    match value.and_then(Value::as_i128) {
        Some(n) if n < 0 => len.saturating_sub((-n) as usize),
        Some(n) => (n as usize).min(len),
        None => default,
    }
}

fn slice(_vm: &mut Vm, receiver: &Value, args: Vec<Value>) -> Result<Value, VmError> {
    let s = expect_str(receiver);
    let len = s.char_count();
    let start = clamp_index(args.first(), len, 0);
    let end = clamp_index(args.get(1), len, len);
    let result: String = if start < end {
        s.as_str().chars().skip(start).take(end - start).collect()
    } else {
        String::new()
    };
    Ok(Value::str(result))
}

fn find(_vm: &mut Vm, receiver: &Value, args: Vec<Value>) -> Result<Value, VmError> {
    let needle = str_arg(&args, 0, "find")?;
    let text = expect_str(receiver).as_str();
    match text.find(needle) {
        Some(byte_index) => {
            let char_index = text[..byte_index].chars().count();
            Ok(Value::I64(char_index as i64))
        }
        None => Ok(Value::I64(-1)),
    }
}

fn trim(_vm: &mut Vm, receiver: &Value, _args: Vec<Value>) -> Result<Value, VmError> {
    Ok(Value::str(expect_str(receiver).as_str().trim()))
}

fn to_upper(_vm: &mut Vm, receiver: &Value, _args: Vec<Value>) -> Result<Value, VmError> {
    Ok(Value::str(expect_str(receiver).as_str().to_uppercase()))
}

fn to_lower(_vm: &mut Vm, receiver: &Value, _args: Vec<Value>) -> Result<Value, VmError> {
    Ok(Value::str(expect_str(receiver).as_str().to_lowercase()))
}

fn starts_with(_vm: &mut Vm, receiver: &Value, args: Vec<Value>) -> Result<Value, VmError> {
    let prefix = str_arg(&args, 0, "starts_with")?;
    Ok(Value::Bool(expect_str(receiver).as_str().starts_with(prefix)))
}

fn ends_with(_vm: &mut Vm, receiver: &Value, args: Vec<Value>) -> Result<Value, VmError> {
    let suffix = str_arg(&args, 0, "ends_with")?;
    Ok(Value::Bool(expect_str(receiver).as_str().ends_with(suffix)))
}

fn replace(_vm: &mut Vm, receiver: &Value, args: Vec<Value>) -> Result<Value, VmError> {
    let from = str_arg(&args, 0, "replace")?;
    let to = str_arg(&args, 1, "replace")?;
    Ok(Value::str(expect_str(receiver).as_str().replacen(from, to, 1)))
}

fn replace_all(_vm: &mut Vm, receiver: &Value, args: Vec<Value>) -> Result<Value, VmError> {
    let from = str_arg(&args, 0, "replace_all")?;
    let to = str_arg(&args, 1, "replace_all")?;
    Ok(Value::str(expect_str(receiver).as_str().replace(from, to)))
}

fn repeat(_vm: &mut Vm, receiver: &Value, args: Vec<Value>) -> Result<Value, VmError> {
    let count = args
        .first()
        .and_then(Value::as_index)
        .ok_or_else(|| VmError::exception("repeat expects a count"))?;
    Ok(Value::str(expect_str(receiver).as_str().repeat(count)))
}

fn char_at(_vm: &mut Vm, receiver: &Value, args: Vec<Value>) -> Result<Value, VmError> {
    let index = args
        .first()
        .and_then(Value::as_index)
        .ok_or_else(|| VmError::exception("char_at expects an index"))?;
    Ok(expect_str(receiver).char_at(index).map(Value::Rune).unwrap_or(Value::Null))
}

fn byte_at(_vm: &mut Vm, receiver: &Value, args: Vec<Value>) -> Result<Value, VmError> {
    let index = args
        .first()
        .and_then(Value::as_index)
        .ok_or_else(|| VmError::exception("byte_at expects an index"))?;
    let s = expect_str(receiver);
    Ok(s.as_str()
        .as_bytes()
        .get(index)
        .map(|b| Value::U8(*b))
        .unwrap_or(Value::Null))
}

fn chars(_vm: &mut Vm, receiver: &Value, _args: Vec<Value>) -> Result<Value, VmError> {
    let runes: Vec<Value> = expect_str(receiver).as_str().chars().map(Value::Rune).collect();
    Ok(Value::array(runes))
}

fn bytes(_vm: &mut Vm, receiver: &Value, _args: Vec<Value>) -> Result<Value, VmError> {
    let bytes: Vec<Value> =
        expect_str(receiver).as_str().bytes().map(Value::U8).collect();
    Ok(Value::array(bytes))
}

fn to_bytes(_vm: &mut Vm, receiver: &Value, _args: Vec<Value>) -> Result<Value, VmError> {
    let data = expect_str(receiver).as_str().as_bytes().to_vec();
    Ok(Value::Buffer(Arc::new(Buffer::new(data))))
}

fn deserialize(_vm: &mut Vm, receiver: &Value, _args: Vec<Value>) -> Result<Value, VmError> {
    let parsed: serde_json::Value = serde_json::from_str(expect_str(receiver).as_str())
        .map_err(|e| VmError::exception(format!("Invalid JSON: {}", e)))?;
    Ok(super::object::json_to_value(&parsed))
}
