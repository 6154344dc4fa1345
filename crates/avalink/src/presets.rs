//! Named parameter presets persisted as one JSON file.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use avaproto::{validate_address, OscValue};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{BridgeError, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresetValue {
    pub address: String,
    pub value: OscValue,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Preset {
    pub name: String,
    /// Applied in this order.
    pub values: Vec<PresetValue>,
    pub created_at: DateTime<Utc>,
}

pub struct PresetStore {
    path: PathBuf,
    presets: BTreeMap<String, Preset>,
}

impl PresetStore {
    /// Load from `path`; a missing file is an empty store.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        let presets = if path.exists() {
            let json = std::fs::read_to_string(&path)?;
            let list: Vec<Preset> = serde_json::from_str(&json).map_err(|e| {
                BridgeError::Protocol(format!("bad preset file {}: {}", path.display(), e))
            })?;
            list.into_iter().map(|p| (p.name.clone(), p)).collect()
        } else {
            BTreeMap::new()
        };
        debug!(path = %path.display(), count = presets.len(), "presets loaded");

        Ok(Self { path, presets })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn save(&self) -> Result<()> {
        let list: Vec<&Preset> = self.presets.values().collect();
        let json = serde_json::to_string_pretty(&list)
            .map_err(|e| BridgeError::Protocol(e.to_string()))?;

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let temp_path = self.path.with_extension("tmp");
        std::fs::write(&temp_path, json)?;
        std::fs::rename(&temp_path, &self.path)?;
        Ok(())
    }

    /// Create or replace a preset and persist. Addresses are validated up
    /// front so a bad preset never reaches disk.
    pub fn upsert(&mut self, name: &str, values: Vec<PresetValue>) -> Result<&Preset> {
        let name = name.trim();
        if name.is_empty() {
            return Err(BridgeError::Validation("preset name is empty".into()));
        }
        if values.is_empty() {
            return Err(BridgeError::Validation(format!("preset {} has no values", name)));
        }
        for v in &values {
            validate_address(&v.address)?;
        }

        let previous = self.presets.insert(
            name.to_string(),
            Preset {
                name: name.to_string(),
                values,
                created_at: Utc::now(),
            },
        );
        if let Err(e) = self.save() {
            // Keep memory and disk in agreement.
            match previous {
                Some(p) => self.presets.insert(name.to_string(), p),
                None => self.presets.remove(name),
            };
            return Err(e);
        }

        self.presets
            .get(name)
            .ok_or_else(|| BridgeError::Validation(format!("preset {} vanished", name)))
    }

    /// Returns false if no such preset existed.
    pub fn remove(&mut self, name: &str) -> Result<bool> {
        let Some(previous) = self.presets.remove(name) else {
            return Ok(false);
        };
        if let Err(e) = self.save() {
            self.presets.insert(name.to_string(), previous);
            return Err(e);
        }
        Ok(true)
    }

    pub fn get(&self, name: &str) -> Option<&Preset> {
        self.presets.get(name)
    }

    pub fn list(&self) -> Vec<Preset> {
        self.presets.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.presets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.presets.is_empty()
    }
}
