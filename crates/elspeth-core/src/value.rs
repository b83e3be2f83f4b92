//! Dynamic row-field value model.
//!
//! A pipeline row is a map from normalized field name to a closed,
//! serializable value. Languages with reflective type systems carry an
//! open-ended value space; here it is represented as a tagged union so the
//! schema contract can reason about it exhaustively.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// A single row field value.
///
/// `Object` is the collapse target for any producer-side type that
/// doesn't fit the closed set — an unsupported complex type infers as
/// `object` rather than failing. It carries the original JSON
/// representation so the value survives the pipeline even though
/// type-checking on it is weaker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Value {
    Int(i64),
    Float(f64),
    String(String),
    Bool(bool),
    Bytes(Vec<u8>),
    List(Vec<Value>),
    Map(BTreeMap<String, Value>),
    Object(serde_json::Value),
    Null,
}

/// The type tag used by schema contracts, independent of the carried value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueType {
    Int,
    Float,
    String,
    Bool,
    Bytes,
    List,
    Map,
    Object,
    Null,
}

impl Value {
    /// Classify this value's type tag for schema inference.
    ///
    /// Non-finite floats are rejected by the caller (`SchemaContract`'s
    /// inference path), not here — `type_tag` is infallible by design,
    /// mirroring that token construction never fails.
    pub fn type_tag(&self) -> ValueType {
        match self {
            Value::Int(_) => ValueType::Int,
            Value::Float(_) => ValueType::Float,
            Value::String(_) => ValueType::String,
            Value::Bool(_) => ValueType::Bool,
            Value::Bytes(_) => ValueType::Bytes,
            Value::List(_) => ValueType::List,
            Value::Map(_) => ValueType::Map,
            Value::Object(_) => ValueType::Object,
            Value::Null => ValueType::Null,
        }
    }

    /// Whether this value is a non-finite float (NaN or +/-Infinity).
    pub fn is_non_finite_float(&self) -> bool {
        matches!(self, Value::Float(f) if !f.is_finite())
    }

    /// Two types are "assignable" if a consumer expecting `expected` can
    /// accept a producer field typed `self`. `Null` is assignable to any
    /// type (an absent/optional value), and every type is assignable to
    /// `Object` (the weakest contract).
    pub fn assignable_to(produced: ValueType, expected: ValueType) -> bool {
        if expected == ValueType::Object {
            return true;
        }
        produced == expected || produced == ValueType::Null
    }
}

/// A single pipeline row: normalized field name -> value.
///
/// `BTreeMap` (not `HashMap`) so canonical serialization for audit
/// fingerprints needs no separate key-sort pass.
pub type RowData = BTreeMap<String, Value>;
