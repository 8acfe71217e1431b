// File: src/builtins/mod.rs
//
// Flat registry of native functions for the Hemlock standard library.
// Each entry is (name, arity, native_fn); the compiler routes statically
// resolvable calls through CALL_BUILTIN by id, and GET_GLOBAL falls back to
// this table so builtins are first-class values. Every name also resolves
// with a `__` prefix.

mod concurrency;
mod core;
mod fs;
mod math;
mod memory;
mod system;

use ahash::AHashMap;
use once_cell::sync::Lazy;

use crate::value::Value;
use crate::vm::{Vm, VmError};

pub type NativeFn = fn(&mut Vm, Vec<Value>) -> Result<Value, VmError>;

pub struct BuiltinDef {
    pub name: &'static str,
    /// Required argument count.
    pub arity: u8,
    /// Variadic builtins accept any number of extra arguments.
    pub variadic: bool,
    pub func: NativeFn,
}

pub struct Registry {
    defs: Vec<BuiltinDef>,
    index: AHashMap<&'static str, u16>,
}

impl Registry {
    fn new() -> Self {
        let mut registry = Registry { defs: Vec::new(), index: AHashMap::new() };
        core::register(&mut registry);
        math::register(&mut registry);
        fs::register(&mut registry);
        system::register(&mut registry);
        memory::register(&mut registry);
        concurrency::register(&mut registry);
        registry
    }

    pub fn add(&mut self, name: &'static str, arity: u8, variadic: bool, func: NativeFn) {
        debug_assert!(!self.index.contains_key(name), "duplicate builtin {}", name);
        let id = self.defs.len() as u16;
        self.defs.push(BuiltinDef { name, arity, variadic, func });
        self.index.insert(name, id);
    }
}

static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

/// Builtin id for the compiler's CALL_BUILTIN lowering. Accepts the bare
/// name or the `__`-prefixed alias.
pub fn builtin_id(name: &str) -> Option<u16> {
    let bare = name.strip_prefix("__").unwrap_or(name);
    REGISTRY.index.get(bare).copied()
}

pub fn lookup(name: &str) -> Option<&'static BuiltinDef> {
    builtin_id(name).map(by_id)
}

pub fn by_id(id: u16) -> &'static BuiltinDef {
    &REGISTRY.defs[id as usize]
}

/// All registered names, for diagnostics and tests.
pub fn names() -> Vec<&'static str> {
    REGISTRY.defs.iter().map(|def| def.name).collect()
}

// ----- shared argument helpers -----

pub(crate) fn str_arg<'a>(args: &'a [Value], index: usize, name: &str) -> Result<&'a str, VmError> {
    match args.get(index) {
        Some(Value::Str(s)) => Ok(s.as_str()),
        Some(other) => Err(VmError::exception(format!(
            "{} expected a string, got {}",
            name,
            other.kind_name()
        ))),
        None => Err(VmError::exception(format!("{} missing argument {}", name, index + 1))),
    }
}

pub(crate) fn num_arg(args: &[Value], index: usize, name: &str) -> Result<f64, VmError> {
    args.get(index).and_then(Value::as_f64).ok_or_else(|| {
        VmError::exception(format!("{} expected a number for argument {}", name, index + 1))
    })
}

pub(crate) fn int_arg(args: &[Value], index: usize, name: &str) -> Result<i64, VmError> {
    match args.get(index) {
        Some(value) if value.is_integer() => Ok(value.as_i128().unwrap() as i64),
        Some(Value::F32(n)) => Ok(*n as i64),
        Some(Value::F64(n)) => Ok(*n as i64),
        Some(other) => Err(VmError::exception(format!(
            "{} expected an integer, got {}",
            name,
            other.kind_name()
        ))),
        None => Err(VmError::exception(format!("{} missing argument {}", name, index + 1))),
    }
}

pub(crate) fn usize_arg(args: &[Value], index: usize, name: &str) -> Result<usize, VmError> {
    let n = int_arg(args, index, name)?;
    usize::try_from(n)
        .map_err(|_| VmError::exception(format!("{} expected a non-negative integer", name)))
}

pub(crate) fn ptr_arg(args: &[Value], index: usize, name: &str) -> Result<usize, VmError> {
    match args.get(index) {
        Some(Value::Pointer(addr)) => Ok(*addr),
        Some(other) => Err(VmError::exception(format!(
            "{} expected a pointer, got {}",
            name,
            other.kind_name()
        ))),
        None => Err(VmError::exception(format!("{} missing argument {}", name, index + 1))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn registry_has_no_duplicate_names() {
        let all = names();
        let unique: HashSet<&str> = all.iter().copied().collect();
        assert_eq!(all.len(), unique.len());
    }

    #[test]
    fn double_underscore_alias_resolves() {
        assert_eq!(builtin_id("sleep"), builtin_id("__sleep"));
        assert!(builtin_id("sleep").is_some());
    }

    #[test]
    fn surface_contract_entries_are_registered() {
        let required = [
            "print", "eprint", "assert", "panic", "typeof", "read_line", "open", "divi", "modi",
            "string_concat_many", "sha256", "sha512", "md5", "read_file", "write_file",
            "append_file", "remove_file", "cwd", "chdir", "rename", "make_dir", "remove_dir",
            "list_dir", "exists", "is_file", "is_dir", "get_pid", "getppid", "getuid", "geteuid",
            "exit", "getenv", "setenv", "unsetenv", "now", "time_ms", "sleep", "clock",
            "platform", "arch", "spawn", "join", "detach", "await", "channel", "select", "raise",
            "signal", "exec", "exec_argv", "apply", "alloc", "talloc", "realloc", "free",
            "memset", "memcpy", "sizeof", "buffer", "buffer_ptr", "ptr_null", "ptr_to_buffer",
            "ptr_offset", "ptr_deref_i32", "atomic_fence", "task_debug_info", "sin", "cos",
            "tan", "asin", "acos", "atan", "atan2", "sqrt", "pow", "exp", "log", "log10", "log2",
            "floor", "ceil", "round", "trunc", "abs", "min", "max", "clamp", "rand",
            "rand_range", "seed", "floori", "ceili", "roundi", "trunci", "div",
        ];
        for name in required {
            assert!(builtin_id(name).is_some(), "missing builtin {}", name);
        }
        for ty in ["i8", "i16", "i32", "i64", "u8", "u16", "u32", "u64", "f32", "f64", "ptr"] {
            assert!(builtin_id(&format!("ptr_read_{}", ty)).is_some(), "missing ptr_read_{}", ty);
            assert!(
                builtin_id(&format!("ptr_write_{}", ty)).is_some(),
                "missing ptr_write_{}",
                ty
            );
        }
        for width in ["i32", "i64"] {
            for op in ["load", "store", "add", "sub", "and", "or", "xor", "cas", "exchange"] {
                let name = format!("atomic_{}_{}", op, width);
                assert!(builtin_id(&name).is_some(), "missing {}", name);
            }
        }
    }
}
