// File: src/intrinsics/mod.rs
//
// Intrinsic methods dispatched by CALL_METHOD on the receiver's runtime
// kind. These bypass user-defined object fields; a static lookup keyed by
// (kind, name) keeps dispatch flat.

mod array;
mod object;
mod string;

use std::io::{Read, Seek, SeekFrom, Write};
use std::sync::Arc;

use crate::value::{Buffer, Value};
use crate::vm::{Vm, VmError};

pub type IntrinsicFn = fn(&mut Vm, &Value, Vec<Value>) -> Result<Value, VmError>;

/// Resolve an intrinsic method for the receiver, if one exists.
pub fn lookup(receiver: &Value, name: &str) -> Option<IntrinsicFn> {
    match receiver {
        Value::Array(_) => array::lookup(name),
        Value::Str(_) => string::lookup(name),
        Value::Object(_) => object::lookup(name),
        Value::Channel(_) => channel_lookup(name),
        Value::File(_) => file_lookup(name),
        Value::Buffer(_) => buffer_lookup(name),
        _ => None,
    }
}

// ----- channel methods -----

fn channel_lookup(name: &str) -> Option<IntrinsicFn> {
    Some(match name {
        "send" => channel_send,
        "recv" => channel_recv,
        "close" => channel_close,
        _ => return None,
    })
}

fn expect_channel(receiver: &Value) -> &Arc<crate::async_runtime::Channel> {
    match receiver {
        Value::Channel(channel) => channel,
        _ => unreachable!("channel intrinsic on non-channel"),
    }
}

fn channel_send(_vm: &mut Vm, receiver: &Value, mut args: Vec<Value>) -> Result<Value, VmError> {
    if args.len() != 1 {
        return Err(VmError::exception("send expects 1 argument"));
    }
    expect_channel(receiver).send(args.remove(0))?;
    Ok(Value::Null)
}

fn channel_recv(_vm: &mut Vm, receiver: &Value, args: Vec<Value>) -> Result<Value, VmError> {
    if !args.is_empty() {
        return Err(VmError::exception("recv expects no arguments"));
    }
    Ok(expect_channel(receiver).recv())
}

fn channel_close(_vm: &mut Vm, receiver: &Value, args: Vec<Value>) -> Result<Value, VmError> {
    if !args.is_empty() {
        return Err(VmError::exception("close expects no arguments"));
    }
    expect_channel(receiver).close();
    Ok(Value::Null)
}

// ----- file methods -----

fn file_lookup(name: &str) -> Option<IntrinsicFn> {
    Some(match name {
        "read" => file_read,
        "read_all" => file_read_all,
        "write" => file_write,
        "seek" => file_seek,
        "close" => file_close,
        _ => return None,
    })
}

fn with_file<T>(
    receiver: &Value,
    op: &str,
    f: impl FnOnce(&mut std::fs::File) -> std::io::Result<T>,
) -> Result<T, VmError> {
    let Value::File(handle) = receiver else {
        unreachable!("file intrinsic on non-file");
    };
    let mut guard = handle.file.lock().unwrap();
    let Some(file) = guard.as_mut() else {
        return Err(VmError::exception(format!("Cannot {} closed file", op)));
    };
    f(file).map_err(|e| VmError::exception(format!("File {} failed: {}", op, e)))
}

fn file_read(_vm: &mut Vm, receiver: &Value, args: Vec<Value>) -> Result<Value, VmError> {
    let count = match args.first() {
        Some(v) => v
            .as_index()
            .ok_or_else(|| VmError::exception("read expects a byte count"))?,
        None => {
            return file_read_all(_vm, receiver, Vec::new());
        }
    };
    let bytes = with_file(receiver, "read", |file| {
        let mut buf = vec![0u8; count];
        let n = file.read(&mut buf)?;
        buf.truncate(n);
        Ok(buf)
    })?;
    Ok(Value::str(String::from_utf8_lossy(&bytes).into_owned()))
}

fn file_read_all(_vm: &mut Vm, receiver: &Value, _args: Vec<Value>) -> Result<Value, VmError> {
    let text = with_file(receiver, "read", |file| {
        let mut s = String::new();
        file.read_to_string(&mut s)?;
        Ok(s)
    })?;
    Ok(Value::str(text))
}

fn file_write(_vm: &mut Vm, receiver: &Value, args: Vec<Value>) -> Result<Value, VmError> {
    let Some(Value::Str(text)) = args.first() else {
        return Err(VmError::exception("write expects a string"));
    };
    let written = with_file(receiver, "write", |file| {
        file.write_all(text.as_str().as_bytes())?;
        Ok(text.byte_len())
    })?;
    Ok(Value::I64(written as i64))
}

fn file_seek(_vm: &mut Vm, receiver: &Value, args: Vec<Value>) -> Result<Value, VmError> {
    let Some(position) = args.first().and_then(Value::as_index) else {
        return Err(VmError::exception("seek expects a byte offset"));
    };
    let pos = with_file(receiver, "seek", |file| file.seek(SeekFrom::Start(position as u64)))?;
    Ok(Value::I64(pos as i64))
}

fn file_close(_vm: &mut Vm, receiver: &Value, _args: Vec<Value>) -> Result<Value, VmError> {
    let Value::File(handle) = receiver else {
        unreachable!("file intrinsic on non-file");
    };
    let mut guard = handle.file.lock().unwrap();
    if guard.take().is_none() {
        return Err(VmError::exception("File already closed"));
    }
    Ok(Value::Null)
}

// ----- buffer methods -----

fn buffer_lookup(name: &str) -> Option<IntrinsicFn> {
    Some(match name {
        "length" => buffer_length,
        "fill" => buffer_fill,
        "slice" => buffer_slice,
        _ => return None,
    })
}

fn expect_buffer(receiver: &Value) -> &Arc<Buffer> {
    match receiver {
        Value::Buffer(buffer) => buffer,
        _ => unreachable!("buffer intrinsic on non-buffer"),
    }
}

fn buffer_length(_vm: &mut Vm, receiver: &Value, _args: Vec<Value>) -> Result<Value, VmError> {
    Ok(Value::I64(expect_buffer(receiver).len() as i64))
}

fn buffer_fill(_vm: &mut Vm, receiver: &Value, args: Vec<Value>) -> Result<Value, VmError> {
    let byte = args
        .first()
        .and_then(Value::as_i128)
        .ok_or_else(|| VmError::exception("fill expects a byte value"))?;
    let buffer = expect_buffer(receiver);
    for slot in buffer.data.lock().unwrap().iter_mut() {
        *slot = byte as u8;
    }
    Ok(Value::Null)
}

fn buffer_slice(_vm: &mut Vm, receiver: &Value, args: Vec<Value>) -> Result<Value, VmError> {
    let buffer = expect_buffer(receiver);
    let data = buffer.data.lock().unwrap();
    let len = data.len();
    let start = args.first().and_then(Value::as_index).unwrap_or(0).min(len);
    let end = args.get(1).and_then(Value::as_index).unwrap_or(len).min(len);
    let slice = if start < end { data[start..end].to_vec() } else { Vec::new() };
    Ok(Value::Buffer(Arc::new(Buffer::new(slice))))
}
