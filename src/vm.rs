// File: src/vm.rs
//
// Stack-based virtual machine for executing Hemlock bytecode.
// One VM per thread: spawned tasks build their own VM with fresh globals.
// The dispatch loop is a single match over the opcode byte; helpers that can
// fail return a VmError which is either delivered to the innermost handler
// or propagated out as an uncaught runtime error.

use std::sync::{Arc, Mutex};

use ahash::AHashMap;
use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::async_runtime::join_task;
use crate::builtins::{self, BuiltinDef};
use crate::bytecode::{Chunk, Constant, Op};
use crate::errors::TraceFrame;
use crate::intrinsics;
use crate::value::{
    format_value, values_equal, Closure, Upvalue, UpvalueState, Value,
};
use crate::value::TypeTag;

const MAX_FRAMES: usize = 1024;

/// Runtime failure. `Exception` is catchable by `try`; `Fatal` terminates
/// execution unconditionally.
#[derive(Debug)]
pub enum VmError {
    Exception(Value),
    Fatal(String),
}

impl VmError {
    pub fn exception(message: impl Into<String>) -> VmError {
        VmError::Exception(Value::str(message.into()))
    }
}

/// An uncaught exception or fatal error, with the stack trace captured at the
/// throw site.
#[derive(Debug)]
pub struct UncaughtError {
    pub message: String,
    pub trace: Vec<TraceFrame>,
}

/// Where `print`/`eprint` output goes. Tests capture it; spawned tasks
/// inherit the parent VM's sink.
#[derive(Clone)]
pub enum Output {
    Stdout,
    Capture(Arc<Mutex<Vec<u8>>>),
}

impl Output {
    pub fn write(&self, text: &str) {
        match self {
            Output::Stdout => print!("{}", text),
            Output::Capture(buffer) => {
                buffer.lock().unwrap().extend_from_slice(text.as_bytes());
            }
        }
    }

    pub fn write_err(&self, text: &str) {
        match self {
            Output::Stdout => eprint!("{}", text),
            Output::Capture(buffer) => {
                buffer.lock().unwrap().extend_from_slice(text.as_bytes());
            }
        }
    }
}

struct CallFrame {
    closure: Arc<Closure>,
    ip: usize,
    /// Base index into the value stack; slot 0 holds the closure value.
    slots: usize,
}

struct Handler {
    catch_ip: usize,
    /// Control reaches the finally section by falling through the catch
    /// section; the unwinder itself only jumps to `catch_ip`.
    #[allow(dead_code)]
    finally_ip: usize,
    stack_top: usize,
    frame_count: usize,
    /// Set once the handler has caught; a throw from inside the catch body
    /// then propagates outward instead of looping.
    in_catch: bool,
}

struct DeferEntry {
    frame_index: usize,
    closure: Arc<Closure>,
}

struct GlobalEntry {
    name: Arc<str>,
    value: Value,
    is_const: bool,
}

/// Globals table: insertion-ordered entries plus a hash index by name.
#[derive(Default)]
pub struct Globals {
    entries: Vec<GlobalEntry>,
    index: AHashMap<Arc<str>, usize>,
}

impl Globals {
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.index.get(name).map(|&i| &self.entries[i].value)
    }

    pub fn define(&mut self, name: &str, value: Value, is_const: bool) {
        match self.index.get(name) {
            Some(&i) => {
                self.entries[i].value = value;
                self.entries[i].is_const = is_const;
            }
            None => {
                let name: Arc<str> = Arc::from(name);
                self.index.insert(Arc::clone(&name), self.entries.len());
                self.entries.push(GlobalEntry { name, value, is_const });
            }
        }
    }

    /// Shallow snapshot used to seed a spawned task's VM: bindings are
    /// copied, heap values stay shared through their reference counts.
    pub fn snapshot(&self) -> Vec<(Arc<str>, Value, bool)> {
        self.entries
            .iter()
            .map(|entry| (Arc::clone(&entry.name), entry.value.clone(), entry.is_const))
            .collect()
    }

    pub fn install(&mut self, snapshot: Vec<(Arc<str>, Value, bool)>) {
        for (name, value, is_const) in snapshot {
            self.define(&name, value, is_const);
        }
    }

    fn assign(&mut self, name: &str, value: Value) -> Result<(), VmError> {
        match self.index.get(name) {
            Some(&i) => {
                if self.entries[i].is_const {
                    return Err(VmError::exception(format!(
                        "Cannot reassign constant '{}'",
                        name
                    )));
                }
                self.entries[i].value = value;
                Ok(())
            }
            None => Err(VmError::exception(format!("Undefined variable '{}'", name))),
        }
    }
}

enum Flow {
    Continue,
    Exit(Value),
}

pub struct Vm {
    pub stack: Vec<Value>,
    frames: Vec<CallFrame>,
    pub globals: Globals,
    /// Open upvalues sorted by stack slot, highest first.
    open_upvalues: Vec<Arc<Upvalue>>,
    handlers: Vec<Handler>,
    defers: Vec<DeferEntry>,
    self_stack: Vec<Value>,
    pub output: Output,
    pub trace: bool,
    pub rng: StdRng,
}

impl Vm {
    pub fn new() -> Self {
        Self::with_output(Output::Stdout)
    }

    pub fn with_output(output: Output) -> Self {
        let mut vm = Vm {
            stack: Vec::with_capacity(256),
            frames: Vec::new(),
            globals: Globals::default(),
            open_upvalues: Vec::new(),
            handlers: Vec::new(),
            defers: Vec::new(),
            self_stack: Vec::new(),
            output,
            trace: false,
            rng: StdRng::from_entropy(),
        };
        vm.init_stdlib();
        vm
    }

    /// Seed the globals table. Builtin functions resolve lazily through
    /// `GET_GLOBAL`; only constants need eager entries.
    fn init_stdlib(&mut self) {
        self.globals.define("PI", Value::F64(std::f64::consts::PI), true);
        self.globals.define("E", Value::F64(std::f64::consts::E), true);
        self.globals.define("TAU", Value::F64(std::f64::consts::TAU), true);
        self.globals.define("INF", Value::F64(f64::INFINITY), true);
        self.globals.define("NAN", Value::F64(f64::NAN), true);
    }

    // ----- stack primitives -----

    fn push(&mut self, value: Value) {
        self.stack.push(value);
    }

    fn pop(&mut self) -> Result<Value, VmError> {
        self.stack.pop().ok_or_else(|| VmError::Fatal("Stack underflow".to_string()))
    }

    fn peek(&self, distance: usize) -> Result<&Value, VmError> {
        let len = self.stack.len();
        if distance >= len {
            return Err(VmError::Fatal("Stack underflow".to_string()));
        }
        Ok(&self.stack[len - 1 - distance])
    }

    // ----- frame helpers -----

    fn frame(&self) -> &CallFrame {
        self.frames.last().unwrap()
    }

    fn chunk(&self) -> &Arc<Chunk> {
        &self.frame().closure.chunk
    }

    fn read_byte(&mut self) -> u8 {
        let frame = self.frames.last_mut().unwrap();
        let byte = frame.closure.chunk.code[frame.ip];
        frame.ip += 1;
        byte
    }

    fn read_short(&mut self) -> u16 {
        let hi = self.read_byte() as u16;
        let lo = self.read_byte() as u16;
        (hi << 8) | lo
    }

    fn identifier(&self, index: u16) -> Arc<str> {
        Arc::clone(&self.chunk().identifiers[index as usize])
    }

    pub fn trace_frames(&self) -> Vec<TraceFrame> {
        self.frames
            .iter()
            .rev()
            .map(|frame| {
                let name = if frame.closure.chunk.name.is_empty() {
                    "<fn>".to_string()
                } else {
                    frame.closure.chunk.name.clone()
                };
                TraceFrame { name, line: frame.closure.chunk.get_line(frame.ip.saturating_sub(1)) }
            })
            .collect()
    }

    // ----- entry points -----

    /// Execute a compiled program on this VM.
    pub fn interpret(&mut self, chunk: Arc<Chunk>) -> Result<Value, UncaughtError> {
        let closure = Arc::new(Closure::new(chunk, Vec::new()));
        self.stack.push(Value::Function(Arc::clone(&closure)));
        self.frames.push(CallFrame { closure, ip: 0, slots: 0 });
        match self.run(0) {
            Ok(value) => Ok(value),
            Err(VmError::Exception(value)) => {
                let trace = self.trace_frames();
                Err(UncaughtError { message: format_value(&value), trace })
            }
            Err(VmError::Fatal(message)) => {
                let trace = self.trace_frames();
                Err(UncaughtError { message, trace })
            }
        }
    }

    /// Re-entrant closure invocation, used by intrinsic callbacks
    /// (map/filter/reduce), deferred closures, method dispatch and task
    /// entry.
    pub fn call_closure(
        &mut self,
        closure: &Arc<Closure>,
        args: Vec<Value>,
    ) -> Result<Value, VmError> {
        let base = self.frames.len();
        let argc = args.len();
        self.push(Value::Function(Arc::clone(closure)));
        for arg in args {
            self.push(arg);
        }
        self.setup_closure_call(Arc::clone(closure), argc as u8)?;
        self.run(base)
    }

    /// Main dispatch loop. Returns when the frame count drops back to
    /// `base_frame_count` after a RETURN (or HALT).
    fn run(&mut self, base_frame_count: usize) -> Result<Value, VmError> {
        loop {
            if self.trace {
                self.trace_instruction();
            }
            let byte = self.read_byte();
            let op = match Op::from_byte(byte) {
                Some(op) => op,
                None => return Err(VmError::Fatal(format!("Unknown opcode {:#04x}", byte))),
            };
            match self.exec_op(op, base_frame_count) {
                Ok(Flow::Continue) => {}
                Ok(Flow::Exit(value)) => return Ok(value),
                Err(VmError::Exception(value)) => {
                    // Either jumps to a handler in this invocation or
                    // propagates out through the `?`.
                    self.deliver_exception(value, base_frame_count)?;
                }
                Err(fatal) => return Err(fatal),
            }
        }
    }

    fn trace_instruction(&self) {
        let frame = self.frame();
        let rendered =
            crate::disassembler::disassemble_instruction(&frame.closure.chunk, frame.ip);
        eprintln!(
            "{:>24} | stack {:>3} | {}",
            frame.closure.chunk.name,
            self.stack.len(),
            rendered
        );
    }

    // ----- exception machinery -----

    /// Unwind to the innermost live handler belonging to this `run`
    /// invocation. Handlers already in their catch body are discarded so the
    /// exception propagates outward.
    fn deliver_exception(&mut self, value: Value, base_frame_count: usize) -> Result<(), VmError> {
        loop {
            let Some(handler) = self.handlers.last_mut() else {
                return Err(VmError::Exception(value));
            };
            if handler.in_catch {
                self.handlers.pop();
                continue;
            }
            if handler.frame_count <= base_frame_count {
                // Belongs to an outer vm_execute; let the native caller
                // propagate.
                return Err(VmError::Exception(value));
            }
            handler.in_catch = true;
            let catch_ip = handler.catch_ip;
            let stack_top = handler.stack_top;
            let frame_count = handler.frame_count;

            // Run deferred closures of the frames being discarded, then drop
            // everything above the handler watermark.
            let mut unwound_defers = Vec::new();
            while let Some(entry) = self.defers.last() {
                if entry.frame_index >= frame_count {
                    unwound_defers.push(self.defers.pop().unwrap());
                } else {
                    break;
                }
            }
            self.close_upvalues(stack_top);
            self.stack.truncate(stack_top);
            self.frames.truncate(frame_count);
            self.frames.last_mut().unwrap().ip = catch_ip;
            self.push(value);
            for entry in unwound_defers {
                // Exceptions inside an unwind-time defer are discarded.
                let _ = self.call_closure(&entry.closure, Vec::new());
            }
            return Ok(());
        }
    }

    // ----- upvalues -----

    fn capture_upvalue(&mut self, slot: usize) -> Arc<Upvalue> {
        // The list is sorted by slot, highest first.
        let mut insert_at = self.open_upvalues.len();
        for (i, upvalue) in self.open_upvalues.iter().enumerate() {
            match upvalue.open_slot() {
                Some(existing) if existing == slot => return Arc::clone(upvalue),
                Some(existing) if existing < slot => {
                    insert_at = i;
                    break;
                }
                _ => {}
            }
        }
        let upvalue = Arc::new(Upvalue::open(slot));
        self.open_upvalues.insert(insert_at, Arc::clone(&upvalue));
        upvalue
    }

    fn close_upvalues(&mut self, from_slot: usize) {
        while let Some(upvalue) = self.open_upvalues.first() {
            let Some(slot) = upvalue.open_slot() else {
                self.open_upvalues.remove(0);
                continue;
            };
            if slot < from_slot {
                break;
            }
            upvalue.close(self.stack[slot].clone());
            self.open_upvalues.remove(0);
        }
    }

    fn read_upvalue(&self, upvalue: &Upvalue) -> Value {
        match &*upvalue.state.lock().unwrap() {
            // An open slot belonging to another thread's stack reads as null;
            // tasks are expected to capture by closing or communicate via
            // channels.
            UpvalueState::Open(slot) => self.stack.get(*slot).cloned().unwrap_or(Value::Null),
            UpvalueState::Closed(value) => value.clone(),
        }
    }

    fn write_upvalue(&mut self, upvalue: &Upvalue, value: Value) {
        let mut state = upvalue.state.lock().unwrap();
        match &mut *state {
            UpvalueState::Open(slot) => {
                let slot = *slot;
                drop(state);
                self.stack[slot] = value;
            }
            UpvalueState::Closed(stored) => *stored = value,
        }
    }

    // ----- calls -----

    fn setup_closure_call(&mut self, closure: Arc<Closure>, argc: u8) -> Result<(), VmError> {
        if self.frames.len() >= MAX_FRAMES {
            return Err(VmError::Fatal("Stack overflow".to_string()));
        }
        let chunk = Arc::clone(&closure.chunk);
        let arity = chunk.arity as usize;
        let required = arity - chunk.optional_params as usize;
        let mut argc = argc as usize;

        if chunk.has_rest {
            if argc < required {
                return Err(VmError::exception(format!(
                    "Expected at least {} arguments but got {}",
                    required, argc
                )));
            }
            let extras = argc.saturating_sub(arity);
            let mut rest = Vec::with_capacity(extras);
            for _ in 0..extras {
                rest.push(self.pop()?);
            }
            rest.reverse();
            argc -= extras;
            for _ in argc..arity {
                self.push(Value::Null);
            }
            self.push(Value::array(rest));
        } else {
            if argc < required || argc > arity {
                return Err(VmError::exception(format!(
                    "Expected {} arguments but got {}",
                    arity, argc
                )));
            }
            for _ in argc..arity {
                self.push(Value::Null);
            }
        }

        let param_slots = arity + chunk.has_rest as usize;
        let slots = self.stack.len() - param_slots - 1;
        self.frames.push(CallFrame { closure, ip: 0, slots });
        Ok(())
    }

    fn call_value(&mut self, argc: u8) -> Result<(), VmError> {
        let callee = self.peek(argc as usize)?.clone();
        match callee {
            Value::Function(closure) => self.setup_closure_call(closure, argc),
            Value::Builtin(def) => {
                let args = self.pop_args(argc as usize)?;
                self.pop()?; // the builtin value itself
                let result = self.call_builtin(def, args)?;
                self.push(result);
                Ok(())
            }
            other => Err(VmError::exception(format!(
                "Cannot call value of type {}",
                other.kind_name()
            ))),
        }
    }

    fn pop_args(&mut self, argc: usize) -> Result<Vec<Value>, VmError> {
        let mut args = Vec::with_capacity(argc);
        for _ in 0..argc {
            args.push(self.pop()?);
        }
        args.reverse();
        Ok(args)
    }

    pub fn call_builtin(
        &mut self,
        def: &'static BuiltinDef,
        args: Vec<Value>,
    ) -> Result<Value, VmError> {
        let required = def.arity as usize;
        if args.len() < required || (!def.variadic && args.len() > required) {
            return Err(VmError::exception(format!(
                "{} expected {} argument{} but got {}",
                def.name,
                required,
                if required == 1 { "" } else { "s" },
                args.len()
            )));
        }
        (def.func)(self, args)
    }

    /// Call an arbitrary callable value with already-evaluated arguments.
    /// Used by `apply`, method dispatch and intrinsic callbacks.
    pub fn call_function_value(
        &mut self,
        callee: &Value,
        args: Vec<Value>,
    ) -> Result<Value, VmError> {
        match callee {
            Value::Function(closure) => self.call_closure(closure, args),
            Value::Builtin(def) => self.call_builtin(def, args),
            other => Err(VmError::exception(format!(
                "Cannot call value of type {}",
                other.kind_name()
            ))),
        }
    }

    /// Method call with the receiver installed as `self` for the duration.
    pub fn call_method_closure(
        &mut self,
        closure: &Arc<Closure>,
        receiver: Value,
        args: Vec<Value>,
    ) -> Result<Value, VmError> {
        self.self_stack.push(receiver);
        let result = self.call_closure(closure, args);
        self.self_stack.pop();
        result
    }

    fn call_method(&mut self, name: &str, argc: u8) -> Result<(), VmError> {
        let receiver = self.peek(argc as usize)?.clone();

        // 1. Intrinsic methods on the receiver's runtime kind.
        if let Some(intrinsic) = intrinsics::lookup(&receiver, name) {
            let args = self.pop_args(argc as usize)?;
            self.pop()?; // receiver
            let result = intrinsic(self, &receiver, args)?;
            self.push(result);
            return Ok(());
        }

        // 2. A closure stored as an object field, with `self` bound.
        if let Value::Object(object) = &receiver {
            if let Some(field) = object.get(name) {
                let args = self.pop_args(argc as usize)?;
                self.pop()?;
                let result = match &field {
                    Value::Function(closure) => {
                        self.call_method_closure(&Arc::clone(closure), receiver.clone(), args)?
                    }
                    Value::Builtin(def) => self.call_builtin(def, args)?,
                    other => {
                        return Err(VmError::exception(format!(
                            "Object field '{}' is not callable (found {})",
                            name,
                            other.kind_name()
                        )))
                    }
                };
                self.push(result);
                return Ok(());
            }
            return Err(VmError::exception(format!("Object has no method '{}'", name)));
        }

        Err(VmError::exception(format!(
            "Cannot call method '{}' on {}",
            name,
            receiver.kind_name()
        )))
    }

    // ----- opcode execution -----

    fn exec_op(&mut self, op: Op, base_frame_count: usize) -> Result<Flow, VmError> {
        match op {
            Op::Const => {
                let index = self.read_short();
                let value = match &self.chunk().constants[index as usize] {
                    Constant::I32(n) => Value::I32(*n),
                    Constant::I64(n) => Value::I64(*n),
                    Constant::F64(n) => Value::F64(*n),
                    Constant::Str(s) => Value::str(s.to_string()),
                    Constant::Rune(r) => Value::Rune(*r),
                    Constant::Chunk(_) => {
                        return Err(VmError::Fatal(
                            "CONST cannot load a function chunk".to_string(),
                        ))
                    }
                };
                self.push(value);
            }
            Op::ConstByte => {
                let byte = self.read_byte();
                self.push(Value::I32(byte as i32));
            }
            Op::Null => self.push(Value::Null),
            Op::True => self.push(Value::Bool(true)),
            Op::False => self.push(Value::Bool(false)),
            Op::Array => {
                let count = self.read_short() as usize;
                let mut elements = self.pop_args(count)?;
                elements.shrink_to_fit();
                self.push(Value::array(elements));
            }
            Op::Object => {
                let count = self.read_short() as usize;
                let mut fields = Vec::with_capacity(count);
                for _ in 0..count {
                    let value = self.pop()?;
                    let key = self.pop()?;
                    let Value::Str(key) = key else {
                        return Err(VmError::exception("Object key must be a string"));
                    };
                    fields.push((Arc::from(key.as_str()), value));
                }
                fields.reverse();
                self.push(Value::object(fields));
            }
            Op::Closure => {
                let index = self.read_short();
                let upvalue_count = self.read_byte() as usize;
                let chunk = match &self.chunk().constants[index as usize] {
                    Constant::Chunk(chunk) => Arc::clone(chunk),
                    other => {
                        return Err(VmError::Fatal(format!(
                            "CLOSURE operand is not a chunk: {}",
                            other
                        )))
                    }
                };
                let mut upvalues = Vec::with_capacity(upvalue_count);
                for _ in 0..upvalue_count {
                    let is_local = self.read_byte() == 1;
                    let index = self.read_byte() as usize;
                    if is_local {
                        let slot = self.frame().slots + index;
                        upvalues.push(self.capture_upvalue(slot));
                    } else {
                        upvalues.push(Arc::clone(&self.frame().closure.upvalues[index]));
                    }
                }
                self.push(Value::Function(Arc::new(Closure::new(chunk, upvalues))));
            }
            Op::StringInterp => {
                let count = self.read_short() as usize;
                let parts = self.pop_args(count)?;
                let mut result = String::new();
                for part in &parts {
                    result.push_str(&format_value(part));
                }
                self.push(Value::str(result));
            }

            Op::GetLocal => {
                let slot = self.read_byte() as usize;
                let value = self.stack[self.frame().slots + slot].clone();
                self.push(value);
            }
            Op::SetLocal => {
                let slot = self.read_byte() as usize;
                let value = self.peek(0)?.clone();
                let base = self.frame().slots;
                self.stack[base + slot] = value;
            }
            Op::GetUpvalue => {
                let index = self.read_byte() as usize;
                let upvalue = Arc::clone(&self.frame().closure.upvalues[index]);
                let value = self.read_upvalue(&upvalue);
                self.push(value);
            }
            Op::SetUpvalue => {
                let index = self.read_byte() as usize;
                let upvalue = Arc::clone(&self.frame().closure.upvalues[index]);
                let value = self.peek(0)?.clone();
                self.write_upvalue(&upvalue, value);
            }
            Op::GetGlobal => {
                let index = self.read_short();
                let name = self.identifier(index);
                let value = match self.globals.get(&name) {
                    Some(value) => value.clone(),
                    None => match builtins::lookup(&name) {
                        Some(def) => Value::Builtin(def),
                        None => {
                            return Err(VmError::exception(format!(
                                "Undefined variable '{}'",
                                name
                            )))
                        }
                    },
                };
                self.push(value);
            }
            Op::SetGlobal => {
                let index = self.read_short();
                let name = self.identifier(index);
                let value = self.peek(0)?.clone();
                self.globals.assign(&name, value)?;
            }
            Op::DefineGlobal => {
                let index = self.read_short();
                let name = self.identifier(index);
                let value = self.pop()?;
                self.globals.define(&name, value, false);
            }
            Op::DefineGlobalConst => {
                let index = self.read_short();
                let name = self.identifier(index);
                let value = self.pop()?;
                self.globals.define(&name, value, true);
            }
            Op::GetProperty => {
                let index = self.read_short();
                let name = self.identifier(index);
                let object = self.pop()?;
                let value = self.get_property(&object, &name)?;
                self.push(value);
            }
            Op::SetProperty => {
                let index = self.read_short();
                let name = self.identifier(index);
                let value = self.pop()?;
                let object = self.pop()?;
                match &object {
                    Value::Object(obj) => obj.set(&name, value.clone()),
                    other => {
                        return Err(VmError::exception(format!(
                            "Cannot set property on {}",
                            other.kind_name()
                        )))
                    }
                }
                self.push(value);
            }
            Op::GetIndex => {
                let index = self.pop()?;
                let object = self.pop()?;
                let value = self.get_index(&object, &index)?;
                self.push(value);
            }
            Op::SetIndex => {
                let value = self.pop()?;
                let index = self.pop()?;
                let object = self.pop()?;
                self.set_index(&object, &index, value.clone())?;
                self.push(value);
            }
            Op::GetSelf => {
                let value = self.self_stack.last().cloned().unwrap_or(Value::Null);
                self.push(value);
            }
            Op::SetSelf => {
                let value = self.pop()?;
                match self.self_stack.last_mut() {
                    Some(slot) => *slot = value,
                    None => self.self_stack.push(value),
                }
            }
            Op::GetKey => {
                let index = self.pop()?;
                let iterable = self.pop()?;
                let i = index
                    .as_index()
                    .ok_or_else(|| VmError::exception("Iteration index must be an integer"))?;
                let key = match &iterable {
                    Value::Object(object) => match object.entry_at(i) {
                        Some((name, _)) => Value::str(name.to_string()),
                        None => Value::Null,
                    },
                    Value::Array(_) | Value::Str(_) => Value::I64(i as i64),
                    other => {
                        return Err(VmError::exception(format!(
                            "for-in requires an iterable, got {}",
                            other.kind_name()
                        )))
                    }
                };
                self.push(key);
            }
            Op::SetObjType => {
                let index = self.read_short();
                let name = self.identifier(index);
                let value = self.peek(0)?;
                match value {
                    Value::Object(object) => object.set_type_name(name.to_string()),
                    other => {
                        return Err(VmError::exception(format!(
                            "Cannot apply object type to {}",
                            other.kind_name()
                        )))
                    }
                }
            }

            Op::Add | Op::Sub | Op::Mul | Op::Div | Op::Mod => {
                let b = self.pop()?;
                let a = self.pop()?;
                let result = self.binary_arith(op, a, b)?;
                self.push(result);
            }
            Op::AddI32 | Op::SubI32 | Op::MulI32 => {
                let b = self.pop()?;
                let a = self.pop()?;
                let result = match (&a, &b) {
                    (Value::I32(x), Value::I32(y)) => match op {
                        Op::AddI32 => Value::I32(x.wrapping_add(*y)),
                        Op::SubI32 => Value::I32(x.wrapping_sub(*y)),
                        _ => Value::I32(x.wrapping_mul(*y)),
                    },
                    _ => {
                        let generic = match op {
                            Op::AddI32 => Op::Add,
                            Op::SubI32 => Op::Sub,
                            _ => Op::Mul,
                        };
                        self.binary_arith(generic, a, b)?
                    }
                };
                self.push(result);
            }
            Op::Negate => {
                let value = self.pop()?;
                let result = self.negate(value)?;
                self.push(result);
            }
            Op::Eq => {
                let b = self.pop()?;
                let a = self.pop()?;
                self.push(Value::Bool(values_equal(&a, &b)));
            }
            Op::EqI32 => {
                let b = self.pop()?;
                let a = self.pop()?;
                let result = match (&a, &b) {
                    (Value::I32(x), Value::I32(y)) => x == y,
                    _ => values_equal(&a, &b),
                };
                self.push(Value::Bool(result));
            }
            Op::Ne => {
                let b = self.pop()?;
                let a = self.pop()?;
                self.push(Value::Bool(!values_equal(&a, &b)));
            }
            Op::Lt | Op::Le | Op::Gt | Op::Ge => {
                let b = self.pop()?;
                let a = self.pop()?;
                let result = self.compare(op, &a, &b)?;
                self.push(Value::Bool(result));
            }
            Op::LtI32 => {
                let b = self.pop()?;
                let a = self.pop()?;
                let result = match (&a, &b) {
                    (Value::I32(x), Value::I32(y)) => x < y,
                    _ => self.compare(Op::Lt, &a, &b)?,
                };
                self.push(Value::Bool(result));
            }
            Op::Not => {
                let value = self.pop()?;
                self.push(Value::Bool(!value.is_truthy()));
            }
            Op::BitAnd | Op::BitOr | Op::BitXor | Op::Shl | Op::Shr => {
                let b = self.pop()?;
                let a = self.pop()?;
                let result = self.binary_bitwise(op, &a, &b)?;
                self.push(result);
            }
            Op::BitNot => {
                let value = self.pop()?;
                let result = match value.as_i128() {
                    Some(n) => make_int(int_tag(&value), !n),
                    None => {
                        return Err(VmError::exception(format!(
                            "Cannot apply bitwise not to {}",
                            value.kind_name()
                        )))
                    }
                };
                self.push(result);
            }

            Op::Pop => {
                self.pop()?;
            }
            Op::PopN => {
                let count = self.read_byte() as usize;
                for _ in 0..count {
                    self.pop()?;
                }
            }
            Op::Dup => {
                let value = self.peek(0)?.clone();
                self.push(value);
            }
            Op::Dup2 => {
                let b = self.peek(0)?.clone();
                let a = self.peek(1)?.clone();
                self.push(a);
                self.push(b);
            }
            Op::Swap => {
                let len = self.stack.len();
                if len < 2 {
                    return Err(VmError::Fatal("Stack underflow".to_string()));
                }
                self.stack.swap(len - 1, len - 2);
            }
            Op::Bury3 => {
                // [a b c] -> [c a b]
                let c = self.pop()?;
                let b = self.pop()?;
                let a = self.pop()?;
                self.push(c);
                self.push(a);
                self.push(b);
            }
            Op::Rot3 => {
                // [a b c] -> [b c a]
                let c = self.pop()?;
                let b = self.pop()?;
                let a = self.pop()?;
                self.push(b);
                self.push(c);
                self.push(a);
            }

            Op::Jump => {
                let offset = self.read_short() as usize;
                self.frames.last_mut().unwrap().ip += offset;
            }
            Op::JumpIfFalse => {
                let offset = self.read_short() as usize;
                if !self.peek(0)?.is_truthy() {
                    self.frames.last_mut().unwrap().ip += offset;
                }
            }
            Op::JumpIfTrue => {
                let offset = self.read_short() as usize;
                if self.peek(0)?.is_truthy() {
                    self.frames.last_mut().unwrap().ip += offset;
                }
            }
            Op::Loop => {
                let offset = self.read_short() as usize;
                self.frames.last_mut().unwrap().ip -= offset;
            }
            Op::Coalesce => {
                let offset = self.read_short() as usize;
                if !self.peek(0)?.is_null() {
                    self.frames.last_mut().unwrap().ip += offset;
                }
            }
            Op::OptionalChain => {
                let offset = self.read_short() as usize;
                if self.peek(0)?.is_null() {
                    self.frames.last_mut().unwrap().ip += offset;
                }
            }

            Op::Call => {
                let argc = self.read_byte();
                self.call_value(argc)?;
            }
            Op::CallBuiltin => {
                let id = self.read_short();
                let argc = self.read_byte();
                let def = builtins::by_id(id);
                let args = self.pop_args(argc as usize)?;
                let result = self.call_builtin(def, args)?;
                self.push(result);
            }
            Op::CallMethod => {
                let index = self.read_short();
                let name = self.identifier(index);
                let argc = self.read_byte();
                self.call_method(&name, argc)?;
            }
            Op::Print => {
                let argc = self.read_byte();
                let args = self.pop_args(argc as usize)?;
                let rendered: Vec<String> = args.iter().map(format_value).collect();
                self.output.write(&format!("{}\n", rendered.join(" ")));
                self.push(Value::Null);
            }
            Op::Return => {
                let result = self.pop()?;
                let frame_index = self.frames.len() - 1;
                while let Some(entry) = self.defers.last() {
                    if entry.frame_index != frame_index {
                        break;
                    }
                    let entry = self.defers.pop().unwrap();
                    self.call_closure(&entry.closure, Vec::new())?;
                }
                let slots = self.frame().slots;
                self.close_upvalues(slots);
                self.stack.truncate(slots);
                self.frames.pop();
                // Drop handlers installed by the exiting frame.
                while let Some(handler) = self.handlers.last() {
                    if handler.frame_count > self.frames.len() {
                        self.handlers.pop();
                    } else {
                        break;
                    }
                }
                if self.frames.len() <= base_frame_count {
                    return Ok(Flow::Exit(result));
                }
                self.push(result);
            }

            Op::Try => {
                let catch_offset = self.read_short() as usize;
                let finally_offset = self.read_short() as usize;
                let base_ip = self.frame().ip;
                self.handlers.push(Handler {
                    catch_ip: base_ip + catch_offset,
                    finally_ip: base_ip + finally_offset,
                    stack_top: self.stack.len(),
                    frame_count: self.frames.len(),
                    in_catch: false,
                });
            }
            Op::Throw => {
                let value = self.pop()?;
                return Err(VmError::Exception(value));
            }
            Op::Catch | Op::Finally | Op::Nop => {}
            Op::EndTry => {
                self.handlers.pop();
            }
            Op::Defer => {
                let value = self.pop()?;
                let Value::Function(closure) = value else {
                    return Err(VmError::Fatal("DEFER operand is not a closure".to_string()));
                };
                self.defers.push(DeferEntry {
                    frame_index: self.frames.len() - 1,
                    closure,
                });
            }
            Op::Await => {
                let task = match self.pop()? {
                    Value::Task(task) => task,
                    other => {
                        return Err(VmError::exception(format!(
                            "Cannot await {}",
                            other.kind_name()
                        )))
                    }
                };
                let result = join_task(&task)?;
                self.push(result);
            }

            Op::Cast => {
                let tag = self.read_byte();
                let tag = TypeTag::from_byte(tag)
                    .ok_or_else(|| VmError::Fatal("Invalid cast type id".to_string()))?;
                let value = self.pop()?;
                let result = cast_value(value, tag)?;
                self.push(result);
            }
            Op::Typeof => {
                let value = self.pop()?;
                self.push(Value::str(value.type_of()));
            }
            Op::CloseUpvalue => {
                let top = self.stack.len() - 1;
                self.close_upvalues(top);
                self.pop()?;
            }
            Op::Halt => {
                return Ok(Flow::Exit(Value::Null));
            }
        }
        Ok(Flow::Continue)
    }

    // ----- property / index access -----

    fn get_property(&mut self, object: &Value, name: &str) -> Result<Value, VmError> {
        match object {
            Value::Object(obj) => {
                if let Some(value) = obj.get(name) {
                    return Ok(value);
                }
                if name == "length" {
                    return Ok(Value::I64(obj.len() as i64));
                }
                Ok(Value::Null)
            }
            Value::Array(arr) => match name {
                "length" => Ok(Value::I64(arr.len() as i64)),
                _ => Err(VmError::exception(format!("Array has no property '{}'", name))),
            },
            Value::Str(s) => match name {
                "length" => Ok(Value::I64(s.char_count() as i64)),
                _ => Err(VmError::exception(format!("String has no property '{}'", name))),
            },
            Value::Buffer(buf) => match name {
                "length" => Ok(Value::I64(buf.len() as i64)),
                _ => Err(VmError::exception(format!("Buffer has no property '{}'", name))),
            },
            other => Err(VmError::exception(format!(
                "Cannot get property on {}",
                other.kind_name()
            ))),
        }
    }

    fn get_index(&mut self, object: &Value, index: &Value) -> Result<Value, VmError> {
        match object {
            Value::Array(arr) => match index.as_index() {
                Some(i) => Ok(arr.get(i).unwrap_or(Value::Null)),
                None if index.is_integer() => Ok(Value::Null),
                None => Err(VmError::exception("Array index must be an integer")),
            },
            Value::Str(s) => match index.as_index() {
                Some(i) => Ok(s.char_at(i).map(Value::Rune).unwrap_or(Value::Null)),
                None if index.is_integer() => Ok(Value::Null),
                None => Err(VmError::exception("String index must be an integer")),
            },
            Value::Object(obj) => match index {
                Value::Str(key) => Ok(obj.get(key.as_str()).unwrap_or(Value::Null)),
                _ if index.is_integer() => {
                    let i = index
                        .as_index()
                        .ok_or_else(|| VmError::exception("Object key must be a string"))?;
                    Ok(obj.entry_at(i).map(|(_, value)| value).unwrap_or(Value::Null))
                }
                _ => Err(VmError::exception("Object key must be a string")),
            },
            Value::Buffer(buf) => {
                let i = index
                    .as_index()
                    .ok_or_else(|| VmError::exception("Buffer index must be an integer"))?;
                let data = buf.data.lock().unwrap();
                data.get(i)
                    .map(|b| Value::U8(*b))
                    .ok_or_else(|| VmError::exception("Buffer index out of bounds"))
            }
            other => Err(VmError::exception(format!("Cannot index {}", other.kind_name()))),
        }
    }

    fn set_index(&mut self, object: &Value, index: &Value, value: Value) -> Result<(), VmError> {
        match object {
            Value::Array(arr) => {
                let i = index
                    .as_index()
                    .ok_or_else(|| VmError::exception("Array index out of bounds"))?;
                let mut elements = arr.elements.lock().unwrap();
                if i >= elements.len() {
                    elements.resize(i + 1, Value::Null);
                }
                elements[i] = value;
                Ok(())
            }
            Value::Object(obj) => match index {
                Value::Str(key) => {
                    obj.set(key.as_str(), value);
                    Ok(())
                }
                _ => Err(VmError::exception("Object key must be a string")),
            },
            Value::Buffer(buf) => {
                let i = index
                    .as_index()
                    .ok_or_else(|| VmError::exception("Buffer index out of bounds"))?;
                let byte = value
                    .as_i128()
                    .ok_or_else(|| VmError::exception("Buffer element must be an integer"))?;
                let mut data = buf.data.lock().unwrap();
                if i >= data.len() {
                    return Err(VmError::exception("Buffer index out of bounds"));
                }
                data[i] = byte as u8;
                Ok(())
            }
            other => Err(VmError::exception(format!("Cannot index {}", other.kind_name()))),
        }
    }

    // ----- arithmetic -----

    fn binary_arith(&mut self, op: Op, a: Value, b: Value) -> Result<Value, VmError> {
        if op == Op::Add {
            if let (Value::Str(x), Value::Str(y)) = (&a, &b) {
                let mut s = String::with_capacity(x.byte_len() + y.byte_len());
                s.push_str(x.as_str());
                s.push_str(y.as_str());
                return Ok(Value::str(s));
            }
        }

        if !a.is_numeric() || !b.is_numeric() {
            let verb = match op {
                Op::Add => "add",
                Op::Sub => "subtract",
                Op::Mul => "multiply",
                Op::Div => "divide",
                _ => "take modulo of",
            };
            return Err(VmError::exception(format!(
                "Cannot {} {} and {}",
                verb,
                a.kind_name(),
                b.kind_name()
            )));
        }

        // Division always produces F64; integer division is the `divi`
        // builtin.
        if op == Op::Div {
            let x = a.as_f64().unwrap();
            let y = b.as_f64().unwrap();
            if y == 0.0 {
                return Err(VmError::exception("Division by zero"));
            }
            return Ok(Value::F64(x / y));
        }

        if a.is_float() || b.is_float() {
            let x = a.as_f64().unwrap();
            let y = b.as_f64().unwrap();
            if op == Op::Mod && y == 0.0 {
                return Err(VmError::exception("Modulo by zero"));
            }
            let result = match op {
                Op::Add => x + y,
                Op::Sub => x - y,
                Op::Mul => x * y,
                _ => x % y,
            };
            // F32 only survives when no F64 is involved.
            let both_f32 = !matches!(a, Value::F64(_)) && !matches!(b, Value::F64(_));
            return Ok(if both_f32 { Value::F32(result as f32) } else { Value::F64(result) });
        }

        let x = a.as_i128().unwrap();
        let y = b.as_i128().unwrap();
        if op == Op::Mod && y == 0 {
            return Err(VmError::exception("Modulo by zero"));
        }
        let result = match op {
            Op::Add => x.wrapping_add(y),
            Op::Sub => x.wrapping_sub(y),
            Op::Mul => x.wrapping_mul(y),
            _ => x % y,
        };
        Ok(make_int(promote_int_tags(int_tag(&a), int_tag(&b)), result))
    }

    fn negate(&mut self, value: Value) -> Result<Value, VmError> {
        match value {
            Value::F32(n) => Ok(Value::F32(-n)),
            Value::F64(n) => Ok(Value::F64(-n)),
            ref v if v.is_integer() => {
                let n = v.as_i128().unwrap();
                Ok(make_int(signed_tag(int_tag(v)), -n))
            }
            other => Err(VmError::exception(format!(
                "Cannot negate {}",
                other.kind_name()
            ))),
        }
    }

    fn compare(&mut self, op: Op, a: &Value, b: &Value) -> Result<bool, VmError> {
        if let (Value::Str(x), Value::Str(y)) = (a, b) {
            let ord = x.as_str().cmp(y.as_str());
            return Ok(match op {
                Op::Lt => ord.is_lt(),
                Op::Le => ord.is_le(),
                Op::Gt => ord.is_gt(),
                _ => ord.is_ge(),
            });
        }
        if let (Value::Rune(x), Value::Rune(y)) = (a, b) {
            return Ok(match op {
                Op::Lt => x < y,
                Op::Le => x <= y,
                Op::Gt => x > y,
                _ => x >= y,
            });
        }
        if a.is_numeric() && b.is_numeric() {
            if a.is_float() || b.is_float() {
                let x = a.as_f64().unwrap();
                let y = b.as_f64().unwrap();
                return Ok(match op {
                    Op::Lt => x < y,
                    Op::Le => x <= y,
                    Op::Gt => x > y,
                    _ => x >= y,
                });
            }
            let x = a.as_i128().unwrap();
            let y = b.as_i128().unwrap();
            return Ok(match op {
                Op::Lt => x < y,
                Op::Le => x <= y,
                Op::Gt => x > y,
                _ => x >= y,
            });
        }
        Err(VmError::exception(format!(
            "Cannot compare {} and {}",
            a.kind_name(),
            b.kind_name()
        )))
    }

    fn binary_bitwise(&mut self, op: Op, a: &Value, b: &Value) -> Result<Value, VmError> {
        let (Some(x), Some(y)) = (a.as_i128(), b.as_i128()) else {
            return Err(VmError::exception(format!(
                "Bitwise operation requires integers, got {} and {}",
                a.kind_name(),
                b.kind_name()
            )));
        };
        let tag = promote_int_tags(int_tag(a), int_tag(b));
        let result = match op {
            Op::BitAnd => x & y,
            Op::BitOr => x | y,
            Op::BitXor => x ^ y,
            Op::Shl => x.wrapping_shl((y & 63) as u32),
            _ => x.wrapping_shr((y & 63) as u32),
        };
        Ok(make_int(tag, result))
    }
}

impl Default for Vm {
    fn default() -> Self {
        Vm::new()
    }
}

// ----- integer promotion helpers -----

fn int_tag(value: &Value) -> TypeTag {
    value.tag()
}

fn int_width(tag: TypeTag) -> u8 {
    match tag {
        TypeTag::I8 | TypeTag::U8 => 1,
        TypeTag::I16 | TypeTag::U16 => 2,
        TypeTag::I32 | TypeTag::U32 => 4,
        _ => 8,
    }
}

fn is_unsigned(tag: TypeTag) -> bool {
    matches!(tag, TypeTag::U8 | TypeTag::U16 | TypeTag::U32 | TypeTag::U64)
}

fn signed_tag(tag: TypeTag) -> TypeTag {
    match tag {
        TypeTag::U8 => TypeTag::I8,
        TypeTag::U16 => TypeTag::I16,
        TypeTag::U32 => TypeTag::I32,
        TypeTag::U64 => TypeTag::I64,
        other => other,
    }
}

/// C-style promotion: the wider type wins; at equal width unsigned wins.
pub fn promote_int_tags(a: TypeTag, b: TypeTag) -> TypeTag {
    let (wa, wb) = (int_width(a), int_width(b));
    if wa > wb {
        return a;
    }
    if wb > wa {
        return b;
    }
    if is_unsigned(a) {
        a
    } else {
        b
    }
}

/// Narrow an i128 result into the requested integer type, wrapping like C.
pub fn make_int(tag: TypeTag, n: i128) -> Value {
    match tag {
        TypeTag::I8 => Value::I8(n as i8),
        TypeTag::I16 => Value::I16(n as i16),
        TypeTag::I32 => Value::I32(n as i32),
        TypeTag::U8 => Value::U8(n as u8),
        TypeTag::U16 => Value::U16(n as u16),
        TypeTag::U32 => Value::U32(n as u32),
        TypeTag::U64 => Value::U64(n as u64),
        _ => Value::I64(n as i64),
    }
}

/// Explicit conversion for `CAST` and the `as`-style annotations.
pub fn cast_value(value: Value, tag: TypeTag) -> Result<Value, VmError> {
    if value.tag() == tag || tag == TypeTag::Any {
        return Ok(value);
    }
    match tag {
        TypeTag::Bool => Ok(Value::Bool(value.is_truthy())),
        TypeTag::String => Ok(Value::str(format_value(&value))),
        TypeTag::F32 => match value.as_f64() {
            Some(n) => Ok(Value::F32(n as f32)),
            None => cast_error(&value, tag),
        },
        TypeTag::F64 => match value.as_f64() {
            Some(n) => Ok(Value::F64(n)),
            None => cast_error(&value, tag),
        },
        TypeTag::Rune => match &value {
            Value::Rune(r) => Ok(Value::Rune(*r)),
            _ => match value.as_i128() {
                Some(n) => u32::try_from(n)
                    .ok()
                    .and_then(char::from_u32)
                    .map(Value::Rune)
                    .ok_or_else(|| {
                        VmError::exception(format!("Invalid rune value {}", n))
                    }),
                None => cast_error(&value, tag),
            },
        },
        TypeTag::I8
        | TypeTag::I16
        | TypeTag::I32
        | TypeTag::I64
        | TypeTag::U8
        | TypeTag::U16
        | TypeTag::U32
        | TypeTag::U64 => match &value {
            Value::Rune(r) => Ok(make_int(tag, *r as i128)),
            Value::Bool(b) => Ok(make_int(tag, *b as i128)),
            Value::F32(n) => Ok(make_int(tag, *n as i128)),
            Value::F64(n) => Ok(make_int(tag, *n as i128)),
            _ => match value.as_i128() {
                Some(n) => Ok(make_int(tag, n)),
                None => cast_error(&value, tag),
            },
        },
        TypeTag::Pointer => match value.as_i128() {
            Some(n) => Ok(Value::Pointer(n as usize)),
            None => cast_error(&value, tag),
        },
        _ => cast_error(&value, tag),
    }
}

fn cast_error(value: &Value, tag: TypeTag) -> Result<Value, VmError> {
    Err(VmError::exception(format!(
        "Cannot cast {} to {}",
        value.kind_name(),
        tag.name()
    )))
}
