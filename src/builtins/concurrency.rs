// File: src/builtins/concurrency.rs
//
// Task and channel builtins: spawn/join/detach/await, channel construction
// and select. Arguments to spawn are deep-copied for cross-thread isolation;
// channels, tasks and primitives pass through as-is.

use std::sync::Arc;

use crate::async_runtime::{
    detach_task, join_task, select_channels, spawn_task, Channel, TaskStatus,
};
use crate::value::Value;
use crate::vm::{Vm, VmError};

use super::{usize_arg, Registry};

pub fn register(registry: &mut Registry) {
    registry.add("spawn", 1, true, spawn);
    registry.add("join", 1, false, join);
    registry.add("detach", 1, true, detach);
    registry.add("await", 1, false, await_task);
    registry.add("channel", 0, true, channel);
    registry.add("select", 1, true, select);
    registry.add("task_debug_info", 1, false, task_debug_info);
}

fn spawn_from_args(vm: &mut Vm, args: &[Value]) -> Result<Value, VmError> {
    let Some(Value::Function(closure)) = args.first() else {
        return Err(VmError::exception("spawn expects a function"));
    };
    if !closure.chunk.is_async {
        return Err(VmError::exception("spawn expects an async function"));
    }
    let task_args: Vec<Value> = args[1..].iter().map(Value::deep_copy).collect();
    let task = spawn_task(
        Arc::clone(closure),
        task_args,
        vm.output.clone(),
        vm.globals.snapshot(),
    );
    Ok(Value::Task(task))
}

fn spawn(vm: &mut Vm, args: Vec<Value>) -> Result<Value, VmError> {
    spawn_from_args(vm, &args)
}

fn join(_vm: &mut Vm, args: Vec<Value>) -> Result<Value, VmError> {
    let Some(Value::Task(task)) = args.first() else {
        return Err(VmError::exception("join expects a task"));
    };
    join_task(task)
}

/// `detach(task)` releases an existing task; `detach(async_fn, ...)` spawns
/// and detaches in one step.
fn detach(vm: &mut Vm, args: Vec<Value>) -> Result<Value, VmError> {
    match args.first() {
        Some(Value::Task(task)) => {
            detach_task(task)?;
            Ok(Value::Task(Arc::clone(task)))
        }
        Some(Value::Function(_)) => {
            let spawned = spawn_from_args(vm, &args)?;
            let Value::Task(task) = &spawned else { unreachable!() };
            detach_task(task)?;
            Ok(spawned)
        }
        _ => Err(VmError::exception("detach expects a task or an async function")),
    }
}

fn await_task(_vm: &mut Vm, args: Vec<Value>) -> Result<Value, VmError> {
    let Some(Value::Task(task)) = args.first() else {
        return Err(VmError::exception("await expects a task"));
    };
    join_task(task)
}

fn channel(_vm: &mut Vm, args: Vec<Value>) -> Result<Value, VmError> {
    let capacity = if args.is_empty() { 0 } else { usize_arg(&args, 0, "channel")? };
    Ok(Value::Channel(Arc::new(Channel::new(capacity))))
}

fn select(_vm: &mut Vm, args: Vec<Value>) -> Result<Value, VmError> {
    let Some(Value::Array(array)) = args.first() else {
        return Err(VmError::exception("select expects an array of channels"));
    };
    let elements = array.elements.lock().unwrap().clone();
    let mut channels = Vec::with_capacity(elements.len());
    for element in &elements {
        match element {
            Value::Channel(channel) => channels.push(Arc::clone(channel)),
            other => {
                return Err(VmError::exception(format!(
                    "select expects channels, got {}",
                    other.kind_name()
                )))
            }
        }
    }
    let timeout = match args.get(1) {
        Some(_) => Some(usize_arg(&args, 1, "select")? as u64),
        None => None,
    };
    match select_channels(&channels, timeout) {
        Some((channel, value)) => Ok(Value::object(vec![
            (Arc::from("channel"), Value::Channel(channel)),
            (Arc::from("value"), value),
        ])),
        None => Ok(Value::Null),
    }
}

fn task_debug_info(_vm: &mut Vm, args: Vec<Value>) -> Result<Value, VmError> {
    let Some(Value::Task(task)) = args.first() else {
        return Err(VmError::exception("task_debug_info expects a task"));
    };
    let state = task.state.lock().unwrap();
    let status = match state.status {
        TaskStatus::Ready => "ready",
        TaskStatus::Running => "running",
        TaskStatus::Completed => "completed",
    };
    Ok(Value::object(vec![
        (Arc::from("id"), Value::I64(task.id as i64)),
        (Arc::from("state"), Value::str(status)),
        (Arc::from("joined"), Value::Bool(state.joined)),
        (Arc::from("detached"), Value::Bool(state.detached)),
        (Arc::from("has_exception"), Value::Bool(state.exception.is_some())),
    ]))
}
