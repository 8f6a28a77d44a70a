// ============================================================================
// ATTRIBUTES.RS - DEVICE ATTRIBUTES AND COMPATIBILITY
// Accumulates status reports and classifies the bulb against static tables
// ============================================================================

use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

use crate::constants::{COMPATIBLE_IDENTIFY_MARKERS, REQUIRED_ATTRIBUTES, SUPPORTED_TYPECODES};

/// Attributes collected from `wifielement/<MAC>/status` messages
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DeviceAttributes {
    values: BTreeMap<String, String>,
}

impl DeviceAttributes {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: &str, value: &str) {
        self.values.insert(name.to_string(), value.to_string());
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.values.get(name).map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &String)> {
        self.values.iter()
    }

    pub fn type_code(&self) -> Option<&str> {
        self.get("typeCode")
    }

    pub fn identify_no(&self) -> Option<&str> {
        self.get("identifyNO")
    }

    /// Every required attribute has been seen
    pub fn is_complete(&self) -> bool {
        REQUIRED_ATTRIBUTES.iter().all(|name| self.values.contains_key(*name))
    }

    /// Merge one status payload (a JSON array of `{type, value}`).
    ///
    /// Only the required attributes are kept. Anything unparseable is
    /// ignored. Returns the number of attributes taken from the payload.
    pub fn absorb(&mut self, payload: &[u8]) -> usize {
        let Ok(Value::Array(items)) = serde_json::from_slice::<Value>(payload) else {
            return 0;
        };

        let mut taken = 0;
        for item in items {
            let (Some(kind), Some(value)) = (item.get("type").and_then(Value::as_str), item.get("value")) else {
                continue;
            };
            if !REQUIRED_ATTRIBUTES.iter().any(|name| *name == kind) {
                continue;
            }
            let value = match value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            self.insert(kind, &value);
            taken += 1;
        }
        taken
    }
}

/// How likely the shim firmware is to work on this bulb
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CompatibilityCategory {
    Supported,
    Untested,
    NotSupported,
    Unknown,
}

impl fmt::Display for CompatibilityCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            CompatibilityCategory::Supported => "supported",
            CompatibilityCategory::Untested => "untested",
            CompatibilityCategory::NotSupported => "not_supported",
            CompatibilityCategory::Unknown => "unknown",
        };
        f.write_str(label)
    }
}

/// Model, module and verdict, as shown to the operator
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SupportInfo {
    pub model: String,
    pub module: String,
    pub category: CompatibilityCategory,
}

/// Pure classification. No attributes at all means `Unknown`.
pub fn classify(attributes: &DeviceAttributes) -> CompatibilityCategory {
    if attributes.is_empty() {
        return CompatibilityCategory::Unknown;
    }

    let type_code = attributes.type_code().unwrap_or_default();
    let identify_no = attributes.identify_no().unwrap_or_default().to_uppercase();

    if SUPPORTED_TYPECODES.iter().any(|code| *code == type_code) {
        CompatibilityCategory::Supported
    } else if COMPATIBLE_IDENTIFY_MARKERS.iter().any(|marker| identify_no.contains(marker)) {
        CompatibilityCategory::Untested
    } else {
        CompatibilityCategory::NotSupported
    }
}

pub fn support_info(attributes: &DeviceAttributes) -> SupportInfo {
    let or_unknown = |v: Option<&str>| match v {
        Some(s) if !s.is_empty() => s.to_string(),
        _ => "Unknown".to_string(),
    };
    SupportInfo {
        model: or_unknown(attributes.type_code()),
        module: or_unknown(attributes.identify_no()),
        category: classify(attributes),
    }
}
