// File: src/intrinsics/object.rs
//
// Intrinsic methods on object receivers, plus the JSON conversion shared
// with string deserialization. Serialization emits single-line JSON with
// fields in insertion order.

use std::sync::Arc;

use serde_json::{Map, Number};

use crate::value::{Object, Value};
use crate::vm::{Vm, VmError};

use super::IntrinsicFn;

pub fn lookup(name: &str) -> Option<IntrinsicFn> {
    Some(match name {
        "keys" => keys,
        "has" => has,
        "serialize" => serialize,
        _ => return None,
    })
}

fn expect_object(receiver: &Value) -> &Arc<Object> {
    match receiver {
        Value::Object(object) => object,
        _ => unreachable!("object intrinsic on non-object"),
    }
}

fn keys(_vm: &mut Vm, receiver: &Value, _args: Vec<Value>) -> Result<Value, VmError> {
    let fields = expect_object(receiver).fields.lock().unwrap();
    let names: Vec<Value> = fields.iter().map(|(name, _)| Value::str(name.to_string())).collect();
    Ok(Value::array(names))
}

fn has(_vm: &mut Vm, receiver: &Value, args: Vec<Value>) -> Result<Value, VmError> {
    let Some(Value::Str(name)) = args.first() else {
        return Err(VmError::exception("has expects a field name"));
    };
    Ok(Value::Bool(expect_object(receiver).has(name.as_str())))
}

fn serialize(_vm: &mut Vm, receiver: &Value, _args: Vec<Value>) -> Result<Value, VmError> {
    let json = value_to_json(receiver)?;
    Ok(Value::str(json.to_string()))
}

/// Convert a Hemlock value into JSON. Heap kinds with no JSON analogue are
/// rejected with a catchable error.
pub fn value_to_json(value: &Value) -> Result<serde_json::Value, VmError> {
    Ok(match value {
        Value::Null => serde_json::Value::Null,
        Value::Bool(b) => serde_json::Value::Bool(*b),
        Value::F32(n) => Number::from_f64(*n as f64)
            .map(serde_json::Value::Number)
            .unwrap_or(serde_json::Value::Null),
        Value::F64(n) => Number::from_f64(*n)
            .map(serde_json::Value::Number)
            .unwrap_or(serde_json::Value::Null),
        Value::U64(n) => serde_json::Value::Number((*n).into()),
        Value::Rune(r) => serde_json::Value::String(r.to_string()),
        Value::Str(s) => serde_json::Value::String(s.as_str().to_string()),
        Value::Array(array) => {
            let elements = array.elements.lock().unwrap().clone();
            let mut items = Vec::with_capacity(elements.len());
            for element in &elements {
                items.push(value_to_json(element)?);
            }
            serde_json::Value::Array(items)
        }
        Value::Object(object) => {
            let fields = object.fields.lock().unwrap().clone();
            let mut map = Map::with_capacity(fields.len());
            for (name, field) in &fields {
                map.insert(name.to_string(), value_to_json(field)?);
            }
            serde_json::Value::Object(map)
        }
        other if other.is_integer() => {
            serde_json::Value::Number((other.as_i128().unwrap() as i64).into())
        }
        other => {
            return Err(VmError::exception(format!(
                "Cannot serialize {}",
                other.kind_name()
            )))
        }
    })
}

/// Convert parsed JSON back into Hemlock values. Integers that fit an i32
/// come back as i32, matching integer-literal typing.
pub fn json_to_value(json: &serde_json::Value) -> Value {
    match json {
        serde_json::Value::Null => Value::Null,
        serde_json::Value::Bool(b) => Value::Bool(*b),
        serde_json::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                if let Ok(small) = i32::try_from(i) {
                    Value::I32(small)
                } else {
                    Value::I64(i)
                }
            } else if let Some(u) = n.as_u64() {
                Value::U64(u)
            } else {
                Value::F64(n.as_f64().unwrap_or(f64::NAN))
            }
        }
        serde_json::Value::String(s) => Value::str(s.clone()),
        serde_json::Value::Array(items) => {
            Value::array(items.iter().map(json_to_value).collect())
        }
        serde_json::Value::Object(map) => {
            let fields: Vec<(Arc<str>, Value)> = map
                .iter()
                .map(|(name, value)| (Arc::from(name.as_str()), json_to_value(value)))
                .collect();
            Value::object(fields)
        }
    }
}
