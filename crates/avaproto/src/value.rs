//! Tagged argument values.
//!
//! Every value crossing the bridge is an [`OscValue`]. Host input (JSON numbers,
//! strings, booleans) is converted once at the API boundary with
//! [`OscValue::from_json`]; nothing downstream inspects loose types.

use rosc::OscType;
use serde::{Deserialize, Serialize};

use crate::codec::WireError;

/// One argument on the wire: `i`, `f`, `s`, `T`/`F`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OscValue {
    Bool(bool),
    Int(i32),
    Float(f32),
    Str(String),
}

/// Declared type of a parameter, as reported by discovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueType {
    Int,
    Float,
    String,
    Bool,
}

impl ValueType {
    /// Map an OSC type tag string (`"i"`, `"f"`, `"s"`, `"T"`, `"F"`) to a type.
    ///
    /// Only the first tag counts; parameters carry a single argument.
    pub fn from_type_tag(tag: &str) -> Option<Self> {
        match tag.trim_start_matches(',').chars().next()? {
            'i' | 'h' => Some(ValueType::Int),
            'f' | 'd' => Some(ValueType::Float),
            's' => Some(ValueType::String),
            'T' | 'F' => Some(ValueType::Bool),
            _ => None,
        }
    }
}

impl OscValue {
    /// Convert a JSON value: whole numbers become `Int`, fractional numbers
    /// `Float`, strings `Str`, booleans `Bool`. Anything else is rejected.
    pub fn from_json(value: &serde_json::Value) -> Option<Self> {
        match value {
            serde_json::Value::Bool(b) => Some(OscValue::Bool(*b)),
            serde_json::Value::String(s) => Some(OscValue::Str(s.clone())),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    return Some(match i32::try_from(i) {
                        Ok(i) => OscValue::Int(i),
                        Err(_) => OscValue::Float(i as f32),
                    });
                }
                let f = n.as_f64()?;
                if f.fract() == 0.0 && f >= f64::from(i32::MIN) && f <= f64::from(i32::MAX) {
                    Some(OscValue::Int(f as i32))
                } else {
                    Some(OscValue::Float(f as f32))
                }
            }
            _ => None,
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        match self {
            OscValue::Bool(b) => serde_json::Value::Bool(*b),
            OscValue::Int(i) => serde_json::Value::from(*i),
            OscValue::Float(f) => serde_json::Value::from(f64::from(*f)),
            OscValue::Str(s) => serde_json::Value::String(s.clone()),
        }
    }

    pub fn value_type(&self) -> ValueType {
        match self {
            OscValue::Bool(_) => ValueType::Bool,
            OscValue::Int(_) => ValueType::Int,
            OscValue::Float(_) => ValueType::Float,
            OscValue::Str(_) => ValueType::String,
        }
    }

    /// The OSC type tag this value encodes as.
    pub fn type_tag(&self) -> char {
        match self {
            OscValue::Bool(true) => 'T',
            OscValue::Bool(false) => 'F',
            OscValue::Int(_) => 'i',
            OscValue::Float(_) => 'f',
            OscValue::Str(_) => 's',
        }
    }

    /// Numeric view; booleans read as 0/1, strings as `None`.
    pub fn as_f32(&self) -> Option<f32> {
        match self {
            OscValue::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            OscValue::Int(i) => Some(*i as f32),
            OscValue::Float(f) => Some(*f),
            OscValue::Str(_) => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            OscValue::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Coerce to the declared type of a parameter, if the conversion is lossless
    /// enough to make sense (`1` → `true`, `0.0` → `0`, …).
    pub fn coerce_to(&self, target: ValueType) -> Option<OscValue> {
        match (target, self) {
            (ValueType::Int, OscValue::Int(_))
            | (ValueType::Float, OscValue::Float(_))
            | (ValueType::Bool, OscValue::Bool(_))
            | (ValueType::String, OscValue::Str(_)) => Some(self.clone()),
            (ValueType::Float, v) => v.as_f32().map(OscValue::Float),
            (ValueType::Int, OscValue::Float(f)) => Some(OscValue::Int(f.round() as i32)),
            (ValueType::Int, OscValue::Bool(b)) => Some(OscValue::Int(i32::from(*b))),
            (ValueType::Bool, v) => v.as_f32().map(|f| OscValue::Bool(f != 0.0)),
            (ValueType::String, v) => Some(OscValue::Str(v.to_string())),
            (ValueType::Int, OscValue::Str(_)) => None,
        }
    }

    pub(crate) fn to_osc(&self) -> OscType {
        match self {
            OscValue::Bool(b) => OscType::Bool(*b),
            OscValue::Int(i) => OscType::Int(*i),
            OscValue::Float(f) => OscType::Float(*f),
            OscValue::Str(s) => OscType::String(s.clone()),
        }
    }

    /// Narrow an inbound OSC argument. 64-bit ints and doubles are accepted and
    /// narrowed; blobs, timetags, MIDI, nil and friends are not.
    pub(crate) fn from_osc(address: &str, arg: OscType) -> Result<Self, WireError> {
        match arg {
            OscType::Bool(b) => Ok(OscValue::Bool(b)),
            OscType::Int(i) => Ok(OscValue::Int(i)),
            OscType::Float(f) => Ok(OscValue::Float(f)),
            OscType::String(s) => Ok(OscValue::Str(s)),
            OscType::Long(l) => Ok(match i32::try_from(l) {
                Ok(i) => OscValue::Int(i),
                Err(_) => OscValue::Float(l as f32),
            }),
            OscType::Double(d) => Ok(OscValue::Float(d as f32)),
            other => Err(WireError::UnsupportedArgument {
                address: address.to_string(),
                kind: format!("{:?}", other),
            }),
        }
    }
}

impl std::fmt::Display for OscValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OscValue::Bool(b) => write!(f, "{}", b),
            OscValue::Int(i) => write!(f, "{}", i),
            OscValue::Float(v) => write!(f, "{}", v),
            OscValue::Str(s) => write!(f, "{}", s),
        }
    }
}

impl From<bool> for OscValue {
    fn from(v: bool) -> Self {
        OscValue::Bool(v)
    }
}

impl From<i32> for OscValue {
    fn from(v: i32) -> Self {
        OscValue::Int(v)
    }
}

impl From<f32> for OscValue {
    fn from(v: f32) -> Self {
        OscValue::Float(v)
    }
}

impl From<&str> for OscValue {
    fn from(v: &str) -> Self {
        OscValue::Str(v.to_string())
    }
}

impl From<String> for OscValue {
    fn from(v: String) -> Self {
        OscValue::Str(v)
    }
}
