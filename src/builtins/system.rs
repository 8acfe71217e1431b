// File: src/builtins/system.rs
//
// Process, environment, time and signal builtins. Signal registration is
// limited to the "default" and "ignore" dispositions.

use std::process::Command;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use once_cell::sync::Lazy;

use crate::value::Value;
use crate::vm::{Vm, VmError};

use super::{int_arg, str_arg, Registry};

static PROCESS_START: Lazy<Instant> = Lazy::new(Instant::now);

pub fn register(registry: &mut Registry) {
    registry.add("get_pid", 0, false, get_pid);
    registry.add("getppid", 0, false, getppid);
    registry.add("getuid", 0, false, getuid);
    registry.add("geteuid", 0, false, geteuid);
    registry.add("getenv", 1, false, getenv);
    registry.add("setenv", 2, false, setenv);
    registry.add("unsetenv", 1, false, unsetenv);
    registry.add("now", 0, false, now);
    registry.add("time_ms", 0, false, time_ms);
    registry.add("sleep", 1, false, sleep);
    registry.add("clock", 0, false, clock);
    registry.add("platform", 0, false, platform);
    registry.add("arch", 0, false, arch);
    registry.add("exec", 1, false, exec);
    registry.add("exec_argv", 1, false, exec_argv);
    registry.add("raise", 1, false, raise);
    registry.add("signal", 2, false, signal);
}

fn get_pid(_vm: &mut Vm, _args: Vec<Value>) -> Result<Value, VmError> {
    Ok(Value::I64(std::process::id() as i64))
}

fn getppid(_vm: &mut Vm, _args: Vec<Value>) -> Result<Value, VmError> {
    Ok(Value::I64(unsafe { libc::getppid() } as i64))
}

fn getuid(_vm: &mut Vm, _args: Vec<Value>) -> Result<Value, VmError> {
    Ok(Value::I64(unsafe { libc::getuid() } as i64))
}

fn geteuid(_vm: &mut Vm, _args: Vec<Value>) -> Result<Value, VmError> {
    Ok(Value::I64(unsafe { libc::geteuid() } as i64))
}

fn getenv(_vm: &mut Vm, args: Vec<Value>) -> Result<Value, VmError> {
    let name = str_arg(&args, 0, "getenv")?;
    Ok(std::env::var(name).map(Value::str).unwrap_or(Value::Null))
}

fn setenv(_vm: &mut Vm, args: Vec<Value>) -> Result<Value, VmError> {
    let name = str_arg(&args, 0, "setenv")?;
    let value = str_arg(&args, 1, "setenv")?;
    std::env::set_var(name, value);
    Ok(Value::Null)
}

fn unsetenv(_vm: &mut Vm, args: Vec<Value>) -> Result<Value, VmError> {
    let name = str_arg(&args, 0, "unsetenv")?;
    std::env::remove_var(name);
    Ok(Value::Null)
}

fn now(_vm: &mut Vm, _args: Vec<Value>) -> Result<Value, VmError> {
    Ok(Value::I64(Utc::now().timestamp()))
}

fn time_ms(_vm: &mut Vm, _args: Vec<Value>) -> Result<Value, VmError> {
    Ok(Value::I64(Utc::now().timestamp_millis()))
}

fn sleep(_vm: &mut Vm, args: Vec<Value>) -> Result<Value, VmError> {
    let ms = int_arg(&args, 0, "sleep")?;
    if ms > 0 {
        std::thread::sleep(Duration::from_millis(ms as u64));
    }
    Ok(Value::Null)
}

/// Monotonic seconds since process start.
fn clock(_vm: &mut Vm, _args: Vec<Value>) -> Result<Value, VmError> {
    Ok(Value::F64(PROCESS_START.elapsed().as_secs_f64()))
}

fn platform(_vm: &mut Vm, _args: Vec<Value>) -> Result<Value, VmError> {
    Ok(Value::str(std::env::consts::OS))
}

fn arch(_vm: &mut Vm, _args: Vec<Value>) -> Result<Value, VmError> {
    Ok(Value::str(std::env::consts::ARCH))
}

fn command_result(output: std::process::Output) -> Value {
    let fields: Vec<(Arc<str>, Value)> = vec![
        (Arc::from("stdout"), Value::str(String::from_utf8_lossy(&output.stdout).into_owned())),
        (Arc::from("stderr"), Value::str(String::from_utf8_lossy(&output.stderr).into_owned())),
        (Arc::from("status"), Value::I64(output.status.code().unwrap_or(-1) as i64)),
    ];
    Value::object(fields)
}

fn exec(_vm: &mut Vm, args: Vec<Value>) -> Result<Value, VmError> {
    let command = str_arg(&args, 0, "exec")?;
    let output = Command::new("sh")
        .arg("-c")
        .arg(command)
        .output()
        .map_err(|e| VmError::exception(format!("Failed to execute command: {}", e)))?;
    Ok(command_result(output))
}

fn exec_argv(_vm: &mut Vm, args: Vec<Value>) -> Result<Value, VmError> {
    let Some(Value::Array(argv)) = args.first() else {
        return Err(VmError::exception("exec_argv expects an array of strings"));
    };
    let argv = argv.elements.lock().unwrap().clone();
    let mut strings = Vec::with_capacity(argv.len());
    for value in &argv {
        match value {
            Value::Str(s) => strings.push(s.as_str().to_string()),
            other => {
                return Err(VmError::exception(format!(
                    "exec_argv expects strings, got {}",
                    other.kind_name()
                )))
            }
        }
    }
    let Some((program, rest)) = strings.split_first() else {
        return Err(VmError::exception("exec_argv expects a non-empty argv"));
    };
    let output = Command::new(program)
        .args(rest)
        .output()
        .map_err(|e| VmError::exception(format!("Failed to execute '{}': {}", program, e)))?;
    Ok(command_result(output))
}

fn raise(_vm: &mut Vm, args: Vec<Value>) -> Result<Value, VmError> {
    let sig = int_arg(&args, 0, "raise")? as i32;
    let rc = unsafe { libc::raise(sig) };
    if rc != 0 {
        return Err(VmError::exception(format!("Failed to raise signal {}", sig)));
    }
    Ok(Value::Null)
}

fn signal(_vm: &mut Vm, args: Vec<Value>) -> Result<Value, VmError> {
    let sig = int_arg(&args, 0, "signal")? as i32;
    let disposition = str_arg(&args, 1, "signal")?;
    let handler = match disposition {
        "default" => libc::SIG_DFL,
        "ignore" => libc::SIG_IGN,
        other => {
            return Err(VmError::exception(format!(
                "signal expects \"default\" or \"ignore\", got \"{}\"",
                other
            )))
        }
    };
    let previous = unsafe { libc::signal(sig, handler) };
    if previous == libc::SIG_ERR {
        return Err(VmError::exception(format!("Failed to register signal {}", sig)));
    }
    Ok(Value::Null)
}
