// File: src/builtins/fs.rs
//
// Filesystem builtins. All failures surface as catchable exceptions carrying
// the OS error text.

use crate::value::Value;
use crate::vm::{Vm, VmError};

use super::{str_arg, Registry};

pub fn register(registry: &mut Registry) {
    registry.add("read_file", 1, false, read_file);
    registry.add("write_file", 2, false, write_file);
    registry.add("append_file", 2, false, append_file);
    registry.add("remove_file", 1, false, remove_file);
    registry.add("cwd", 0, false, cwd);
    registry.add("chdir", 1, false, chdir);
    registry.add("rename", 2, false, rename);
    registry.add("make_dir", 1, false, make_dir);
    registry.add("remove_dir", 1, false, remove_dir);
    registry.add("list_dir", 1, false, list_dir);
    registry.add("exists", 1, false, exists);
    registry.add("is_file", 1, false, is_file);
    registry.add("is_dir", 1, false, is_dir);
}

fn io_err(op: &str, path: &str, err: std::io::Error) -> VmError {
    VmError::exception(format!("Failed to {} '{}': {}", op, path, err))
}

fn read_file(_vm: &mut Vm, args: Vec<Value>) -> Result<Value, VmError> {
    let path = str_arg(&args, 0, "read_file")?;
    std::fs::read_to_string(path).map(Value::str).map_err(|e| io_err("read", path, e))
}

fn write_file(_vm: &mut Vm, args: Vec<Value>) -> Result<Value, VmError> {
    let path = str_arg(&args, 0, "write_file")?;
    let content = str_arg(&args, 1, "write_file")?;
    std::fs::write(path, content).map_err(|e| io_err("write", path, e))?;
    Ok(Value::Null)
}

fn append_file(_vm: &mut Vm, args: Vec<Value>) -> Result<Value, VmError> {
    use std::io::Write;
    let path = str_arg(&args, 0, "append_file")?;
    let content = str_arg(&args, 1, "append_file")?;
    let mut file = std::fs::OpenOptions::new()
        .append(true)
        .create(true)
        .open(path)
        .map_err(|e| io_err("append to", path, e))?;
    file.write_all(content.as_bytes()).map_err(|e| io_err("append to", path, e))?;
    Ok(Value::Null)
}

fn remove_file(_vm: &mut Vm, args: Vec<Value>) -> Result<Value, VmError> {
    let path = str_arg(&args, 0, "remove_file")?;
    std::fs::remove_file(path).map_err(|e| io_err("remove", path, e))?;
    Ok(Value::Null)
}

fn cwd(_vm: &mut Vm, _args: Vec<Value>) -> Result<Value, VmError> {
    std::env::current_dir()
        .map(|p| Value::str(p.to_string_lossy().into_owned()))
        .map_err(|e| VmError::exception(format!("Failed to get cwd: {}", e)))
}

fn chdir(_vm: &mut Vm, args: Vec<Value>) -> Result<Value, VmError> {
    let path = str_arg(&args, 0, "chdir")?;
    std::env::set_current_dir(path).map_err(|e| io_err("chdir to", path, e))?;
    Ok(Value::Null)
}

fn rename(_vm: &mut Vm, args: Vec<Value>) -> Result<Value, VmError> {
    let from = str_arg(&args, 0, "rename")?;
    let to = str_arg(&args, 1, "rename")?;
    std::fs::rename(from, to).map_err(|e| io_err("rename", from, e))?;
    Ok(Value::Null)
}

fn make_dir(_vm: &mut Vm, args: Vec<Value>) -> Result<Value, VmError> {
    let path = str_arg(&args, 0, "make_dir")?;
    std::fs::create_dir_all(path).map_err(|e| io_err("create directory", path, e))?;
    Ok(Value::Null)
}

fn remove_dir(_vm: &mut Vm, args: Vec<Value>) -> Result<Value, VmError> {
    let path = str_arg(&args, 0, "remove_dir")?;
    std::fs::remove_dir(path).map_err(|e| io_err("remove directory", path, e))?;
    Ok(Value::Null)
}

fn list_dir(_vm: &mut Vm, args: Vec<Value>) -> Result<Value, VmError> {
    let path = str_arg(&args, 0, "list_dir")?;
    let entries = std::fs::read_dir(path).map_err(|e| io_err("list", path, e))?;
    let mut names = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| io_err("list", path, e))?;
        names.push(Value::str(entry.file_name().to_string_lossy().into_owned()));
    }
    Ok(Value::array(names))
}

fn exists(_vm: &mut Vm, args: Vec<Value>) -> Result<Value, VmError> {
    let path = str_arg(&args, 0, "exists")?;
    Ok(Value::Bool(std::path::Path::new(path).exists()))
}

fn is_file(_vm: &mut Vm, args: Vec<Value>) -> Result<Value, VmError> {
    let path = str_arg(&args, 0, "is_file")?;
    Ok(Value::Bool(std::path::Path::new(path).is_file()))
}

fn is_dir(_vm: &mut Vm, args: Vec<Value>) -> Result<Value, VmError> {
    let path = str_arg(&args, 0, "is_dir")?;
    Ok(Value::Bool(std::path::Path::new(path).is_dir()))
}
