// File: src/builtins/memory.rs
//
// Raw memory builtins: alloc/free, pointer reads and writes, buffers and
// sequentially-consistent atomics. Pointers are user-managed addresses; the
// VM only guards against null dereference and double free, everything else
// is the program's responsibility.

use std::alloc::{alloc_zeroed, dealloc, realloc as sys_realloc, Layout};
use std::sync::atomic::{fence, AtomicI32, AtomicI64, Ordering};
use std::sync::{Arc, Mutex};

use ahash::AHashMap;
use once_cell::sync::Lazy;

use crate::value::{Buffer, TypeTag, Value};
use crate::vm::{Vm, VmError};

use super::{int_arg, ptr_arg, usize_arg, Registry};

/// Live allocations made through `alloc`/`talloc`/`realloc`, keyed by
/// address. Needed to recover layouts for free and to detect double frees.
static ALLOCATIONS: Lazy<Mutex<AHashMap<usize, Layout>>> =
    Lazy::new(|| Mutex::new(AHashMap::new()));

pub fn register(registry: &mut Registry) {
    registry.add("alloc", 1, false, alloc_bytes);
    registry.add("talloc", 2, false, talloc);
    registry.add("realloc", 2, false, realloc);
    registry.add("free", 1, false, free);
    registry.add("memset", 3, false, memset);
    registry.add("memcpy", 3, false, memcpy);
    registry.add("sizeof", 1, false, sizeof);
    registry.add("buffer", 1, false, buffer);
    registry.add("buffer_ptr", 1, false, buffer_ptr);
    registry.add("ptr_null", 0, false, ptr_null);
    registry.add("ptr_to_buffer", 2, false, ptr_to_buffer);
    registry.add("ptr_offset", 2, false, ptr_offset);
    registry.add("ptr_deref_i32", 1, false, |vm, args| read_typed::<i32>(vm, args, "ptr_deref_i32"));

    registry.add("ptr_read_i8", 1, false, |vm, args| read_typed::<i8>(vm, args, "ptr_read_i8"));
    registry.add("ptr_read_i16", 1, false, |vm, args| read_typed::<i16>(vm, args, "ptr_read_i16"));
    registry.add("ptr_read_i32", 1, false, |vm, args| read_typed::<i32>(vm, args, "ptr_read_i32"));
    registry.add("ptr_read_i64", 1, false, |vm, args| read_typed::<i64>(vm, args, "ptr_read_i64"));
    registry.add("ptr_read_u8", 1, false, |vm, args| read_typed::<u8>(vm, args, "ptr_read_u8"));
    registry.add("ptr_read_u16", 1, false, |vm, args| read_typed::<u16>(vm, args, "ptr_read_u16"));
    registry.add("ptr_read_u32", 1, false, |vm, args| read_typed::<u32>(vm, args, "ptr_read_u32"));
    registry.add("ptr_read_u64", 1, false, |vm, args| read_typed::<u64>(vm, args, "ptr_read_u64"));
    registry.add("ptr_read_f32", 1, false, |vm, args| read_typed::<f32>(vm, args, "ptr_read_f32"));
    registry.add("ptr_read_f64", 1, false, |vm, args| read_typed::<f64>(vm, args, "ptr_read_f64"));
    registry.add("ptr_read_ptr", 1, false, read_ptr);

    registry.add("ptr_write_i8", 2, false, |vm, args| write_typed::<i8>(vm, args, "ptr_write_i8"));
    registry.add("ptr_write_i16", 2, false, |vm, args| {
        write_typed::<i16>(vm, args, "ptr_write_i16")
    });
    registry.add("ptr_write_i32", 2, false, |vm, args| {
        write_typed::<i32>(vm, args, "ptr_write_i32")
    });
    registry.add("ptr_write_i64", 2, false, |vm, args| {
        write_typed::<i64>(vm, args, "ptr_write_i64")
    });
    registry.add("ptr_write_u8", 2, false, |vm, args| write_typed::<u8>(vm, args, "ptr_write_u8"));
    registry.add("ptr_write_u16", 2, false, |vm, args| {
        write_typed::<u16>(vm, args, "ptr_write_u16")
    });
    registry.add("ptr_write_u32", 2, false, |vm, args| {
        write_typed::<u32>(vm, args, "ptr_write_u32")
    });
    registry.add("ptr_write_u64", 2, false, |vm, args| {
        write_typed::<u64>(vm, args, "ptr_write_u64")
    });
    registry.add("ptr_write_f32", 2, false, write_f32);
    registry.add("ptr_write_f64", 2, false, write_f64);
    registry.add("ptr_write_ptr", 2, false, write_ptr);

    registry.add("atomic_load_i32", 1, false, |vm, args| atomic_i32(vm, args, AtomicOp::Load));
    registry.add("atomic_store_i32", 2, false, |vm, args| atomic_i32(vm, args, AtomicOp::Store));
    registry.add("atomic_add_i32", 2, false, |vm, args| atomic_i32(vm, args, AtomicOp::Add));
    registry.add("atomic_sub_i32", 2, false, |vm, args| atomic_i32(vm, args, AtomicOp::Sub));
    registry.add("atomic_and_i32", 2, false, |vm, args| atomic_i32(vm, args, AtomicOp::And));
    registry.add("atomic_or_i32", 2, false, |vm, args| atomic_i32(vm, args, AtomicOp::Or));
    registry.add("atomic_xor_i32", 2, false, |vm, args| atomic_i32(vm, args, AtomicOp::Xor));
    registry.add("atomic_cas_i32", 3, false, |vm, args| atomic_i32(vm, args, AtomicOp::Cas));
    registry.add("atomic_exchange_i32", 2, false, |vm, args| {
        atomic_i32(vm, args, AtomicOp::Exchange)
    });
    registry.add("atomic_load_i64", 1, false, |vm, args| atomic_i64(vm, args, AtomicOp::Load));
    registry.add("atomic_store_i64", 2, false, |vm, args| atomic_i64(vm, args, AtomicOp::Store));
    registry.add("atomic_add_i64", 2, false, |vm, args| atomic_i64(vm, args, AtomicOp::Add));
    registry.add("atomic_sub_i64", 2, false, |vm, args| atomic_i64(vm, args, AtomicOp::Sub));
    registry.add("atomic_and_i64", 2, false, |vm, args| atomic_i64(vm, args, AtomicOp::And));
    registry.add("atomic_or_i64", 2, false, |vm, args| atomic_i64(vm, args, AtomicOp::Or));
    registry.add("atomic_xor_i64", 2, false, |vm, args| atomic_i64(vm, args, AtomicOp::Xor));
    registry.add("atomic_cas_i64", 3, false, |vm, args| atomic_i64(vm, args, AtomicOp::Cas));
    registry.add("atomic_exchange_i64", 2, false, |vm, args| {
        atomic_i64(vm, args, AtomicOp::Exchange)
    });
    registry.add("atomic_fence", 0, false, atomic_fence);
}

fn layout_for(size: usize) -> Result<Layout, VmError> {
    Layout::from_size_align(size.max(1), 8)
        .map_err(|_| VmError::exception("Allocation size too large"))
}

fn alloc_raw(size: usize) -> Result<Value, VmError> {
    let layout = layout_for(size)?;
    let ptr = unsafe { alloc_zeroed(layout) };
    if ptr.is_null() {
        return Err(VmError::exception("Out of memory"));
    }
    ALLOCATIONS.lock().unwrap().insert(ptr as usize, layout);
    Ok(Value::Pointer(ptr as usize))
}

fn alloc_bytes(_vm: &mut Vm, args: Vec<Value>) -> Result<Value, VmError> {
    alloc_raw(usize_arg(&args, 0, "alloc")?)
}

fn type_tag_arg(args: &[Value], index: usize, name: &str) -> Result<TypeTag, VmError> {
    match args.get(index) {
        Some(Value::Type(tag)) => Ok(*tag),
        Some(Value::Str(s)) => TypeTag::from_name(s.as_str())
            .ok_or_else(|| VmError::exception(format!("Unknown type '{}'", s.as_str()))),
        Some(other) => Err(VmError::exception(format!(
            "{} expected a type, got {}",
            name,
            other.kind_name()
        ))),
        None => Err(VmError::exception(format!("{} missing type argument", name))),
    }
}

fn talloc(_vm: &mut Vm, args: Vec<Value>) -> Result<Value, VmError> {
    let tag = type_tag_arg(&args, 0, "talloc")?;
    let count = usize_arg(&args, 1, "talloc")?;
    alloc_raw(tag.size_of().saturating_mul(count))
}

fn realloc(_vm: &mut Vm, args: Vec<Value>) -> Result<Value, VmError> {
    let addr = ptr_arg(&args, 0, "realloc")?;
    let new_size = usize_arg(&args, 1, "realloc")?;
    if addr == 0 {
        return alloc_raw(new_size);
    }
    let mut allocations = ALLOCATIONS.lock().unwrap();
    let Some(old_layout) = allocations.remove(&addr) else {
        return Err(VmError::exception("realloc of unknown pointer"));
    };
    let new_layout = layout_for(new_size)?;
    let ptr = unsafe { sys_realloc(addr as *mut u8, old_layout, new_layout.size()) };
    if ptr.is_null() {
        allocations.insert(addr, old_layout);
        return Err(VmError::exception("Out of memory"));
    }
    allocations.insert(ptr as usize, new_layout);
    Ok(Value::Pointer(ptr as usize))
}

fn free(_vm: &mut Vm, args: Vec<Value>) -> Result<Value, VmError> {
    match &args[0] {
        Value::Pointer(addr) => {
            let Some(layout) = ALLOCATIONS.lock().unwrap().remove(addr) else {
                return Err(VmError::exception("Double free or invalid pointer"));
            };
            unsafe { dealloc(*addr as *mut u8, layout) };
            Ok(Value::Null)
        }
        Value::Array(array) => {
            if !array.mark_freed() {
                return Err(VmError::exception("Double free of array"));
            }
            array.elements.lock().unwrap().clear();
            Ok(Value::Null)
        }
        Value::Object(object) => {
            if !object.mark_freed() {
                return Err(VmError::exception("Double free of object"));
            }
            object.fields.lock().unwrap().clear();
            Ok(Value::Null)
        }
        Value::Buffer(buffer) => {
            if !buffer.mark_freed() {
                return Err(VmError::exception("Double free of buffer"));
            }
            buffer.data.lock().unwrap().clear();
            Ok(Value::Null)
        }
        other => Err(VmError::exception(format!("Cannot free {}", other.kind_name()))),
    }
}

fn nonnull(addr: usize, name: &str) -> Result<*mut u8, VmError> {
    if addr == 0 {
        return Err(VmError::exception(format!("Null pointer dereference in {}", name)));
    }
    Ok(addr as *mut u8)
}

fn memset(_vm: &mut Vm, args: Vec<Value>) -> Result<Value, VmError> {
    let addr = ptr_arg(&args, 0, "memset")?;
    let byte = int_arg(&args, 1, "memset")? as u8;
    let count = usize_arg(&args, 2, "memset")?;
    let ptr = nonnull(addr, "memset")?;
    unsafe { std::ptr::write_bytes(ptr, byte, count) };
    Ok(Value::Null)
}

fn memcpy(_vm: &mut Vm, args: Vec<Value>) -> Result<Value, VmError> {
    let dst = nonnull(ptr_arg(&args, 0, "memcpy")?, "memcpy")?;
    let src = nonnull(ptr_arg(&args, 1, "memcpy")?, "memcpy")?;
    let count = usize_arg(&args, 2, "memcpy")?;
    unsafe { std::ptr::copy(src, dst, count) };
    Ok(Value::Null)
}

fn sizeof(_vm: &mut Vm, args: Vec<Value>) -> Result<Value, VmError> {
    let tag = match &args[0] {
        Value::Type(tag) => *tag,
        Value::Str(s) if TypeTag::from_name(s.as_str()).is_some() => {
            TypeTag::from_name(s.as_str()).unwrap()
        }
        other => other.tag(),
    };
    Ok(Value::I64(tag.size_of() as i64))
}

fn buffer(_vm: &mut Vm, args: Vec<Value>) -> Result<Value, VmError> {
    let size = usize_arg(&args, 0, "buffer")?;
    Ok(Value::Buffer(Arc::new(Buffer::new(vec![0u8; size]))))
}

/// Address of the buffer's storage. Valid until the buffer is freed or
/// resized.
fn buffer_ptr(_vm: &mut Vm, args: Vec<Value>) -> Result<Value, VmError> {
    let Some(Value::Buffer(buffer)) = args.first() else {
        return Err(VmError::exception("buffer_ptr expects a buffer"));
    };
    let data = buffer.data.lock().unwrap();
    Ok(Value::Pointer(data.as_ptr() as usize))
}

fn ptr_null(_vm: &mut Vm, _args: Vec<Value>) -> Result<Value, VmError> {
    Ok(Value::Pointer(0))
}

fn ptr_to_buffer(_vm: &mut Vm, args: Vec<Value>) -> Result<Value, VmError> {
    let addr = ptr_arg(&args, 0, "ptr_to_buffer")?;
    let len = usize_arg(&args, 1, "ptr_to_buffer")?;
    let ptr = nonnull(addr, "ptr_to_buffer")?;
    let data = unsafe { std::slice::from_raw_parts(ptr, len) }.to_vec();
    Ok(Value::Buffer(Arc::new(Buffer::new(data))))
}

fn ptr_offset(_vm: &mut Vm, args: Vec<Value>) -> Result<Value, VmError> {
    let addr = ptr_arg(&args, 0, "ptr_offset")?;
    let offset = int_arg(&args, 1, "ptr_offset")?;
    Ok(Value::Pointer(addr.wrapping_add_signed(offset as isize)))
}

// ----- typed reads and writes -----

trait PtrValue: Copy {
    fn into_value(self) -> Value;
    fn from_i128(n: i128) -> Self;
}

macro_rules! ptr_int {
    ($($ty:ty => $variant:ident),*) => {
        $(impl PtrValue for $ty {
            fn into_value(self) -> Value {
                Value::$variant(self)
            }
            fn from_i128(n: i128) -> Self {
                n as $ty
            }
        })*
    };
}

ptr_int!(i8 => I8, i16 => I16, i32 => I32, i64 => I64, u8 => U8, u16 => U16, u32 => U32, u64 => U64);

impl PtrValue for f32 {
    fn into_value(self) -> Value {
        Value::F32(self)
    }
    fn from_i128(n: i128) -> Self {
        n as f32
    }
}

impl PtrValue for f64 {
    fn into_value(self) -> Value {
        Value::F64(self)
    }
    fn from_i128(n: i128) -> Self {
        n as f64
    }
}

fn read_typed<T: PtrValue>(_vm: &mut Vm, args: Vec<Value>, name: &str) -> Result<Value, VmError> {
    let addr = ptr_arg(&args, 0, name)?;
    let ptr = nonnull(addr, name)? as *const T;
    Ok(unsafe { std::ptr::read_unaligned(ptr) }.into_value())
}

fn write_typed<T: PtrValue>(_vm: &mut Vm, args: Vec<Value>, name: &str) -> Result<Value, VmError> {
    let addr = ptr_arg(&args, 0, name)?;
    let value = args
        .get(1)
        .and_then(Value::as_i128)
        .ok_or_else(|| VmError::exception(format!("{} expected an integer value", name)))?;
    let ptr = nonnull(addr, name)? as *mut T;
    unsafe { std::ptr::write_unaligned(ptr, T::from_i128(value)) };
    Ok(Value::Null)
}

fn write_f32(_vm: &mut Vm, args: Vec<Value>) -> Result<Value, VmError> {
    let addr = ptr_arg(&args, 0, "ptr_write_f32")?;
    let value = super::num_arg(&args, 1, "ptr_write_f32")? as f32;
    let ptr = nonnull(addr, "ptr_write_f32")? as *mut f32;
    unsafe { std::ptr::write_unaligned(ptr, value) };
    Ok(Value::Null)
}

fn write_f64(_vm: &mut Vm, args: Vec<Value>) -> Result<Value, VmError> {
    let addr = ptr_arg(&args, 0, "ptr_write_f64")?;
    let value = super::num_arg(&args, 1, "ptr_write_f64")?;
    let ptr = nonnull(addr, "ptr_write_f64")? as *mut f64;
    unsafe { std::ptr::write_unaligned(ptr, value) };
    Ok(Value::Null)
}

fn read_ptr(_vm: &mut Vm, args: Vec<Value>) -> Result<Value, VmError> {
    let addr = ptr_arg(&args, 0, "ptr_read_ptr")?;
    let ptr = nonnull(addr, "ptr_read_ptr")? as *const usize;
    Ok(Value::Pointer(unsafe { std::ptr::read_unaligned(ptr) }))
}

fn write_ptr(_vm: &mut Vm, args: Vec<Value>) -> Result<Value, VmError> {
    let addr = ptr_arg(&args, 0, "ptr_write_ptr")?;
    let value = match args.get(1) {
        Some(Value::Pointer(p)) => *p,
        Some(other) => other
            .as_i128()
            .map(|n| n as usize)
            .ok_or_else(|| VmError::exception("ptr_write_ptr expected a pointer value"))?,
        None => return Err(VmError::exception("ptr_write_ptr missing value")),
    };
    let ptr = nonnull(addr, "ptr_write_ptr")? as *mut usize;
    unsafe { std::ptr::write_unaligned(ptr, value) };
    Ok(Value::Null)
}

// ----- atomics -----

#[derive(Clone, Copy)]
enum AtomicOp {
    Load,
    Store,
    Add,
    Sub,
    And,
    Or,
    Xor,
    Cas,
    Exchange,
}

fn atomic_i32(_vm: &mut Vm, args: Vec<Value>, op: AtomicOp) -> Result<Value, VmError> {
    let addr = ptr_arg(&args, 0, "atomic_i32")?;
    nonnull(addr, "atomic op")?;
    let atomic = unsafe { &*(addr as *const AtomicI32) };
    let operand = |i: usize| int_arg(&args, i, "atomic op").map(|n| n as i32);
    let result = match op {
        AtomicOp::Load => atomic.load(Ordering::SeqCst),
        AtomicOp::Store => {
            atomic.store(operand(1)?, Ordering::SeqCst);
            0
        }
        AtomicOp::Add => atomic.fetch_add(operand(1)?, Ordering::SeqCst),
        AtomicOp::Sub => atomic.fetch_sub(operand(1)?, Ordering::SeqCst),
        AtomicOp::And => atomic.fetch_and(operand(1)?, Ordering::SeqCst),
        AtomicOp::Or => atomic.fetch_or(operand(1)?, Ordering::SeqCst),
        AtomicOp::Xor => atomic.fetch_xor(operand(1)?, Ordering::SeqCst),
        AtomicOp::Cas => {
            let expected = operand(1)?;
            let new = operand(2)?;
            match atomic.compare_exchange(expected, new, Ordering::SeqCst, Ordering::SeqCst) {
                Ok(old) | Err(old) => old,
            }
        }
        AtomicOp::Exchange => atomic.swap(operand(1)?, Ordering::SeqCst),
    };
    Ok(Value::I32(result))
}

fn atomic_i64(_vm: &mut Vm, args: Vec<Value>, op: AtomicOp) -> Result<Value, VmError> {
    let addr = ptr_arg(&args, 0, "atomic_i64")?;
    nonnull(addr, "atomic op")?;
    let atomic = unsafe { &*(addr as *const AtomicI64) };
    let operand = |i: usize| int_arg(&args, i, "atomic op");
    let result = match op {
        AtomicOp::Load => atomic.load(Ordering::SeqCst),
        AtomicOp::Store => {
            atomic.store(operand(1)?, Ordering::SeqCst);
            0
        }
        AtomicOp::Add => atomic.fetch_add(operand(1)?, Ordering::SeqCst),
        AtomicOp::Sub => atomic.fetch_sub(operand(1)?, Ordering::SeqCst),
        AtomicOp::And => atomic.fetch_and(operand(1)?, Ordering::SeqCst),
        AtomicOp::Or => atomic.fetch_or(operand(1)?, Ordering::SeqCst),
        AtomicOp::Xor => atomic.fetch_xor(operand(1)?, Ordering::SeqCst),
        AtomicOp::Cas => {
            let expected = operand(1)?;
            let new = operand(2)?;
            match atomic.compare_exchange(expected, new, Ordering::SeqCst, Ordering::SeqCst) {
                Ok(old) | Err(old) => old,
            }
        }
        AtomicOp::Exchange => atomic.swap(operand(1)?, Ordering::SeqCst),
    };
    Ok(Value::I64(result))
}

fn atomic_fence(_vm: &mut Vm, _args: Vec<Value>) -> Result<Value, VmError> {
    fence(Ordering::SeqCst);
    Ok(Value::Null)
}
