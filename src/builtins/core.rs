// File: src/builtins/core.rs
//
// Core builtins: output, assertions, type inspection, hashing, integer
// division and indirect calls.

use std::fs::OpenOptions;
use std::io::BufRead;
use std::sync::Arc;

use md5::Md5;
use sha2::{Digest, Sha256, Sha512};

use crate::value::{format_value, FileHandle, Value};
use crate::vm::{make_int, Vm, VmError};

use super::{int_arg, str_arg, Registry};

pub fn register(registry: &mut Registry) {
    registry.add("print", 0, true, print);
    registry.add("eprint", 0, true, eprint);
    registry.add("assert", 1, true, assert);
    registry.add("panic", 0, true, panic);
    registry.add("typeof", 1, false, type_of);
    registry.add("read_line", 0, false, read_line);
    registry.add("open", 1, true, open);
    registry.add("divi", 2, false, divi);
    registry.add("modi", 2, false, modi);
    registry.add("string_concat_many", 0, true, string_concat_many);
    registry.add("sha256", 1, false, sha256);
    registry.add("sha512", 1, false, sha512);
    registry.add("md5", 1, false, md5_hash);
    registry.add("apply", 2, false, apply);
    registry.add("exit", 0, true, exit);
}

fn print(vm: &mut Vm, args: Vec<Value>) -> Result<Value, VmError> {
    let rendered: Vec<String> = args.iter().map(format_value).collect();
    vm.output.write(&format!("{}\n", rendered.join(" ")));
    Ok(Value::Null)
}

fn eprint(vm: &mut Vm, args: Vec<Value>) -> Result<Value, VmError> {
    let rendered: Vec<String> = args.iter().map(format_value).collect();
    vm.output.write_err(&format!("{}\n", rendered.join(" ")));
    Ok(Value::Null)
}

fn assert(_vm: &mut Vm, args: Vec<Value>) -> Result<Value, VmError> {
    if args[0].is_truthy() {
        return Ok(Value::Null);
    }
    let message = match args.get(1) {
        Some(value) => format!("Assertion failed: {}", format_value(value)),
        None => "Assertion failed".to_string(),
    };
    Err(VmError::exception(message))
}

/// Not catchable: prints to stderr and terminates the process.
fn panic(_vm: &mut Vm, args: Vec<Value>) -> Result<Value, VmError> {
    let message = match args.first() {
        Some(value) => format_value(value),
        None => "panic".to_string(),
    };
    eprintln!("panic: {}", message);
    std::process::exit(1);
}

fn type_of(_vm: &mut Vm, args: Vec<Value>) -> Result<Value, VmError> {
    Ok(Value::str(args[0].type_of()))
}

fn read_line(_vm: &mut Vm, _args: Vec<Value>) -> Result<Value, VmError> {
    let mut line = String::new();
    match std::io::stdin().lock().read_line(&mut line) {
        Ok(0) => Ok(Value::Null),
        Ok(_) => {
            if line.ends_with('\n') {
                line.pop();
                if line.ends_with('\r') {
                    line.pop();
                }
            }
            Ok(Value::str(line))
        }
        Err(e) => Err(VmError::exception(format!("Failed to read line: {}", e))),
    }
}

fn open(_vm: &mut Vm, args: Vec<Value>) -> Result<Value, VmError> {
    let path = str_arg(&args, 0, "open")?;
    let mode = match args.get(1) {
        Some(Value::Str(mode)) => mode.as_str().to_string(),
        Some(other) => {
            return Err(VmError::exception(format!(
                "open expected a mode string, got {}",
                other.kind_name()
            )))
        }
        None => "r".to_string(),
    };
    let mut options = OpenOptions::new();
    match mode.as_str() {
        "r" => options.read(true),
        "w" => options.write(true).create(true).truncate(true),
        "a" => options.append(true).create(true),
        "r+" => options.read(true).write(true),
        "w+" => options.read(true).write(true).create(true).truncate(true),
        other => return Err(VmError::exception(format!("Invalid open mode '{}'", other))),
    };
    let file = options
        .open(path)
        .map_err(|e| VmError::exception(format!("Failed to open '{}': {}", path, e)))?;
    Ok(Value::File(Arc::new(FileHandle::new(path.to_string(), file))))
}

fn int_pair(args: &[Value], name: &str) -> Result<(i128, i128, Value, Value), VmError> {
    let a = int_arg(args, 0, name)? as i128;
    let b = int_arg(args, 1, name)? as i128;
    Ok((a, b, args[0].clone(), args[1].clone()))
}

fn divi(_vm: &mut Vm, args: Vec<Value>) -> Result<Value, VmError> {
    let (a, b, va, vb) = int_pair(&args, "divi")?;
    if b == 0 {
        return Err(VmError::exception("Division by zero"));
    }
    Ok(make_int(promoted_tag(&va, &vb), a / b))
}

fn modi(_vm: &mut Vm, args: Vec<Value>) -> Result<Value, VmError> {
    let (a, b, va, vb) = int_pair(&args, "modi")?;
    if b == 0 {
        return Err(VmError::exception("Modulo by zero"));
    }
    Ok(make_int(promoted_tag(&va, &vb), a % b))
}

fn promoted_tag(a: &Value, b: &Value) -> crate::value::TypeTag {
    if a.is_integer() && b.is_integer() {
        crate::vm::promote_int_tags(a.tag(), b.tag())
    } else {
        crate::value::TypeTag::I64
    }
}

fn string_concat_many(_vm: &mut Vm, args: Vec<Value>) -> Result<Value, VmError> {
    let mut result = String::new();
    for arg in &args {
        result.push_str(&format_value(arg));
    }
    Ok(Value::str(result))
}

fn hash_input(args: &[Value], name: &str) -> Result<Vec<u8>, VmError> {
    match args.first() {
        Some(Value::Str(s)) => Ok(s.as_str().as_bytes().to_vec()),
        Some(Value::Buffer(buf)) => Ok(buf.data.lock().unwrap().clone()),
        Some(other) => Err(VmError::exception(format!(
            "{} expected a string or buffer, got {}",
            name,
            other.kind_name()
        ))),
        None => Err(VmError::exception(format!("{} missing argument", name))),
    }
}

fn to_hex(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        out.push_str(&format!("{:02x}", byte));
    }
    out
}

fn sha256(_vm: &mut Vm, args: Vec<Value>) -> Result<Value, VmError> {
    let input = hash_input(&args, "sha256")?;
    Ok(Value::str(to_hex(&Sha256::digest(&input))))
}

fn sha512(_vm: &mut Vm, args: Vec<Value>) -> Result<Value, VmError> {
    let input = hash_input(&args, "sha512")?;
    Ok(Value::str(to_hex(&Sha512::digest(&input))))
}

fn md5_hash(_vm: &mut Vm, args: Vec<Value>) -> Result<Value, VmError> {
    let input = hash_input(&args, "md5")?;
    Ok(Value::str(to_hex(&Md5::digest(&input))))
}

/// Calls `fn` with arguments taken from an array. The frame is rebuilt
/// through the re-entrant closure path, so sequencing matches a direct CALL.
fn apply(vm: &mut Vm, args: Vec<Value>) -> Result<Value, VmError> {
    let callee = args[0].clone();
    let Value::Array(call_args) = &args[1] else {
        return Err(VmError::exception("apply expects an array of arguments"));
    };
    let call_args = call_args.elements.lock().unwrap().clone();
    vm.call_function_value(&callee, call_args)
}

fn exit(_vm: &mut Vm, args: Vec<Value>) -> Result<Value, VmError> {
    let code = if args.is_empty() { 0 } else { int_arg(&args, 0, "exit")? as i32 };
    std::process::exit(code);
}
