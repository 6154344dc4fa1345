//! Tracked avatar data.

use std::collections::BTreeMap;

use avaproto::{OscValue, ValueType};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Who may read or write a parameter, as reported by discovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Access {
    None,
    Read,
    Write,
    #[default]
    ReadWrite,
}

impl Access {
    /// Discovery encodes access as 0 = none, 1 = read, 2 = write, 3 = both.
    pub fn from_code(code: i64) -> Self {
        match code {
            0 => Access::None,
            1 => Access::Read,
            2 => Access::Write,
            _ => Access::ReadWrite,
        }
    }

    pub fn writable(&self) -> bool {
        matches!(self, Access::Write | Access::ReadWrite)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Range {
    pub min: Option<f64>,
    pub max: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Parameter {
    pub address: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value_type: Option<ValueType>,
    #[serde(default)]
    pub access: Access,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<OscValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub range: Option<Range>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

impl Parameter {
    /// A parameter first seen in traffic: type inferred from the value.
    pub fn observed(address: impl Into<String>, value: OscValue) -> Self {
        Self {
            address: address.into(),
            value_type: Some(value.value_type()),
            access: Access::ReadWrite,
            value: Some(value),
            range: None,
            description: None,
            updated_at: Some(Utc::now()),
        }
    }

    /// Path segments, e.g. `["avatar", "parameters", "Wave"]`.
    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.address.split('/').filter(|s| !s.is_empty())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub value: OscValue,
    pub timestamp: DateTime<Utc>,
}

/// The avatar currently loaded in the remote application.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AvatarContext {
    pub id: Option<String>,
    pub name: Option<String>,
    pub loaded_at: Option<DateTime<Utc>>,
}

/// An animatable avatar sub-part and the addresses it exposes, keyed by
/// sub-parameter name (`Angle`, `Stretch`, ...).
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PhysBone {
    pub name: String,
    pub parameters: BTreeMap<String, String>,
}

impl PhysBone {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            parameters: BTreeMap::new(),
        }
    }
}
