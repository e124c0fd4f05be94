//! Helpers for GVariant.  Converts between the daemon's variants and the
//! JSON rendering used by the rest of the crate.
// SPDX-License-Identifier: Apache-2.0 OR MIT

use glib::prelude::*;
use glib::{Variant, VariantClass, VariantTy};
use serde_json::{Map, Number, Value};

use crate::error::{Error, Result};

/// Render a variant as JSON.  Dictionaries become objects, tuples and
/// other containers become arrays, boxed variants are unwrapped.
pub(crate) fn variant_to_json(v: &Variant) -> Value {
    match v.classify() {
        VariantClass::Boolean => Value::Bool(v.get::<bool>().unwrap_or_default()),
        VariantClass::Byte => v.get::<u8>().map(Value::from).unwrap_or_default(),
        VariantClass::Int16 => v.get::<i16>().map(Value::from).unwrap_or_default(),
        VariantClass::Uint16 => v.get::<u16>().map(Value::from).unwrap_or_default(),
        VariantClass::Int32 => v.get::<i32>().map(Value::from).unwrap_or_default(),
        VariantClass::Uint32 => v.get::<u32>().map(Value::from).unwrap_or_default(),
        VariantClass::Int64 => v.get::<i64>().map(Value::from).unwrap_or_default(),
        VariantClass::Uint64 => v.get::<u64>().map(Value::from).unwrap_or_default(),
        VariantClass::Double => v
            .get::<f64>()
            .and_then(Number::from_f64)
            .map(Value::Number)
            .unwrap_or_default(),
        VariantClass::String | VariantClass::ObjectPath | VariantClass::Signature => v
            .str()
            .map(|s| Value::String(s.to_string()))
            .unwrap_or_default(),
        VariantClass::Variant => v
            .as_variant()
            .map(|inner| variant_to_json(&inner))
            .unwrap_or_default(),
        VariantClass::Maybe => v
            .as_maybe()
            .map(|inner| variant_to_json(&inner))
            .unwrap_or_default(),
        VariantClass::Array if v.type_().as_str().starts_with("a{") => {
            let mut m = Map::new();
            for i in 0..v.n_children() {
                let entry = v.child_value(i);
                let k = match variant_to_json(&entry.child_value(0)) {
                    Value::String(s) => s,
                    o => o.to_string(),
                };
                m.insert(k, variant_to_json(&entry.child_value(1)));
            }
            Value::Object(m)
        }
        VariantClass::Array | VariantClass::Tuple | VariantClass::DictEntry => Value::Array(
            (0..v.n_children())
                .map(|i| variant_to_json(&v.child_value(i)))
                .collect(),
        ),
        _ => Value::Null,
    }
}

/// Render a method reply or signal body (always a tuple) as a list.
pub(crate) fn tuple_to_json(v: &Variant) -> Vec<Value> {
    match variant_to_json(v) {
        Value::Array(a) => a,
        Value::Null => Vec::new(),
        o => vec![o],
    }
}

/// Build a variant for a method argument.  Objects become `a{sv}`,
/// string lists (including empty lists) become `as`.
pub(crate) fn json_to_variant(v: &Value) -> Result<Variant> {
    let r = match v {
        Value::Null => return Err(Error::protocol("cannot send null over DBus")),
        Value::Bool(b) => b.to_variant(),
        Value::Number(n) => match (n.as_i64(), n.as_u64(), n.as_f64()) {
            (Some(i), _, _) => i.to_variant(),
            (None, Some(u), _) => u.to_variant(),
            (_, _, Some(f)) => f.to_variant(),
            _ => return Err(Error::protocol(format!("unrepresentable number {n}"))),
        },
        Value::String(s) => s.to_variant(),
        Value::Array(a) if a.iter().all(Value::is_string) => a
            .iter()
            .filter_map(|s| s.as_str().map(ToOwned::to_owned))
            .collect::<Vec<String>>()
            .to_variant(),
        Value::Array(a) => {
            let children = a
                .iter()
                .map(|c| json_to_variant(c).map(|c| Variant::from_variant(&c)))
                .collect::<Result<Vec<_>>>()?;
            Variant::array_from_iter_with_type(VariantTy::VARIANT, children)
        }
        Value::Object(m) => {
            let dict = glib::VariantDict::new(None);
            for (k, v) in m {
                dict.insert_value(k, &json_to_variant(v)?);
            }
            dict.end()
        }
    };
    Ok(r)
}

/// Build the parameter tuple for a method call.
pub(crate) fn args_to_variant(args: &[Value]) -> Result<Variant> {
    let children = args
        .iter()
        .map(json_to_variant)
        .collect::<Result<Vec<_>>>()?;
    Ok(Variant::tuple_from_iter(children))
}
