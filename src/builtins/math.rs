// File: src/builtins/math.rs
//
// Math builtins. Transcendental functions work in f64; the *-i variants
// truncate to integers. Random numbers come from the VM's seedable RNG.

use rand::{Rng, SeedableRng};

use crate::value::Value;
use crate::vm::{Vm, VmError};

use super::{int_arg, num_arg, Registry};

pub fn register(registry: &mut Registry) {
    registry.add("sin", 1, false, |vm, args| unary(vm, args, "sin", f64::sin));
    registry.add("cos", 1, false, |vm, args| unary(vm, args, "cos", f64::cos));
    registry.add("tan", 1, false, |vm, args| unary(vm, args, "tan", f64::tan));
    registry.add("asin", 1, false, |vm, args| unary(vm, args, "asin", f64::asin));
    registry.add("acos", 1, false, |vm, args| unary(vm, args, "acos", f64::acos));
    registry.add("atan", 1, false, |vm, args| unary(vm, args, "atan", f64::atan));
    registry.add("atan2", 2, false, atan2);
    registry.add("sqrt", 1, false, |vm, args| unary(vm, args, "sqrt", f64::sqrt));
    registry.add("pow", 2, false, pow);
    registry.add("exp", 1, false, |vm, args| unary(vm, args, "exp", f64::exp));
    registry.add("log", 1, false, |vm, args| unary(vm, args, "log", f64::ln));
    registry.add("log10", 1, false, |vm, args| unary(vm, args, "log10", f64::log10));
    registry.add("log2", 1, false, |vm, args| unary(vm, args, "log2", f64::log2));
    registry.add("floor", 1, false, |vm, args| unary(vm, args, "floor", f64::floor));
    registry.add("ceil", 1, false, |vm, args| unary(vm, args, "ceil", f64::ceil));
    registry.add("round", 1, false, |vm, args| unary(vm, args, "round", f64::round));
    registry.add("trunc", 1, false, |vm, args| unary(vm, args, "trunc", f64::trunc));
    registry.add("abs", 1, false, abs);
    registry.add("min", 2, false, min);
    registry.add("max", 2, false, max);
    registry.add("clamp", 3, false, clamp);
    registry.add("rand", 0, false, rand_float);
    registry.add("rand_range", 2, false, rand_range);
    registry.add("seed", 1, false, seed);
    registry.add("floori", 1, false, |vm, args| unary_int(vm, args, "floori", f64::floor));
    registry.add("ceili", 1, false, |vm, args| unary_int(vm, args, "ceili", f64::ceil));
    registry.add("roundi", 1, false, |vm, args| unary_int(vm, args, "roundi", f64::round));
    registry.add("trunci", 1, false, |vm, args| unary_int(vm, args, "trunci", f64::trunc));
    registry.add("div", 2, false, div);
}

fn unary(
    _vm: &mut Vm,
    args: Vec<Value>,
    name: &str,
    f: fn(f64) -> f64,
) -> Result<Value, VmError> {
    Ok(Value::F64(f(num_arg(&args, 0, name)?)))
}

fn unary_int(
    _vm: &mut Vm,
    args: Vec<Value>,
    name: &str,
    f: fn(f64) -> f64,
) -> Result<Value, VmError> {
    Ok(Value::I64(f(num_arg(&args, 0, name)?) as i64))
}

fn atan2(_vm: &mut Vm, args: Vec<Value>) -> Result<Value, VmError> {
    Ok(Value::F64(num_arg(&args, 0, "atan2")?.atan2(num_arg(&args, 1, "atan2")?)))
}

fn pow(_vm: &mut Vm, args: Vec<Value>) -> Result<Value, VmError> {
    Ok(Value::F64(num_arg(&args, 0, "pow")?.powf(num_arg(&args, 1, "pow")?)))
}

fn abs(_vm: &mut Vm, args: Vec<Value>) -> Result<Value, VmError> {
    // Integer inputs keep their type; floats stay floats.
    match &args[0] {
        value if value.is_integer() => {
            let n = value.as_i128().unwrap();
            Ok(crate::vm::make_int(value.tag(), n.abs()))
        }
        Value::F32(n) => Ok(Value::F32(n.abs())),
        _ => Ok(Value::F64(num_arg(&args, 0, "abs")?.abs())),
    }
}

fn min(_vm: &mut Vm, args: Vec<Value>) -> Result<Value, VmError> {
    let a = num_arg(&args, 0, "min")?;
    let b = num_arg(&args, 1, "min")?;
    Ok(if a <= b { args[0].clone() } else { args[1].clone() })
}

fn max(_vm: &mut Vm, args: Vec<Value>) -> Result<Value, VmError> {
    let a = num_arg(&args, 0, "max")?;
    let b = num_arg(&args, 1, "max")?;
    Ok(if a >= b { args[0].clone() } else { args[1].clone() })
}

fn clamp(_vm: &mut Vm, args: Vec<Value>) -> Result<Value, VmError> {
    let value = num_arg(&args, 0, "clamp")?;
    let low = num_arg(&args, 1, "clamp")?;
    let high = num_arg(&args, 2, "clamp")?;
    if value < low {
        Ok(args[1].clone())
    } else if value > high {
        Ok(args[2].clone())
    } else {
        Ok(args[0].clone())
    }
}

fn rand_float(vm: &mut Vm, _args: Vec<Value>) -> Result<Value, VmError> {
    Ok(Value::F64(vm.rng.gen::<f64>()))
}

fn rand_range(vm: &mut Vm, args: Vec<Value>) -> Result<Value, VmError> {
    let low = int_arg(&args, 0, "rand_range")?;
    let high = int_arg(&args, 1, "rand_range")?;
    if low >= high {
        return Err(VmError::exception("rand_range expects low < high"));
    }
    Ok(Value::I64(vm.rng.gen_range(low..high)))
}

fn seed(vm: &mut Vm, args: Vec<Value>) -> Result<Value, VmError> {
    let n = int_arg(&args, 0, "seed")?;
    vm.rng = rand::rngs::StdRng::seed_from_u64(n as u64);
    Ok(Value::Null)
}

/// Float division, unlike the `/` operator only in that it accepts any
/// numeric pair explicitly.
fn div(_vm: &mut Vm, args: Vec<Value>) -> Result<Value, VmError> {
    let a = num_arg(&args, 0, "div")?;
    let b = num_arg(&args, 1, "div")?;
    if b == 0.0 {
        return Err(VmError::exception("Division by zero"));
    }
    Ok(Value::F64(a / b))
}
