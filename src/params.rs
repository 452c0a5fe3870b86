//! Typed plugin parameters
//!
//! Raw `name=value` strings are bound against a plugin's declared
//! parameter schema once, at submission time.

use std::collections::BTreeMap;
use std::fmt;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{CharmError, Result};
use crate::record::PluginDescriptor;

/// Plugin and parameter names become path segments and flags
static NAME_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_.-]*$").expect("valid regex"));

pub fn validate_name(kind: &str, name: &str) -> Result<()> {
    if NAME_PATTERN.is_match(name) {
        Ok(())
    } else {
        Err(CharmError::validation(format!(
            "invalid {} name '{}' (allowed: letters, digits, '_', '.', '-')",
            kind, name
        )))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParameterType {
    #[default]
    String,
    Integer,
    Float,
    Boolean,
}

impl fmt::Display for ParameterType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::String => "string",
            Self::Integer => "integer",
            Self::Float => "float",
            Self::Boolean => "boolean",
        };
        f.write_str(s)
    }
}

fn default_optional() -> bool {
    true
}

/// Declared parameter of a plugin
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterDefinition {
    pub name: String,
    #[serde(default = "default_optional")]
    pub optional: bool,
    #[serde(default)]
    pub default: String,
    #[serde(rename = "type", default)]
    pub param_type: ParameterType,
    #[serde(default)]
    pub help: String,
    /// Command-line flag; `--<name>` when unset
    #[serde(default)]
    pub flag: Option<String>,
}

impl ParameterDefinition {
    pub fn new(name: impl Into<String>, param_type: ParameterType) -> Self {
        Self {
            name: name.into(),
            optional: true,
            default: String::new(),
            param_type,
            help: String::new(),
            flag: None,
        }
    }

    pub fn required(mut self) -> Self {
        self.optional = false;
        self
    }

    pub fn with_default(mut self, default: impl Into<String>) -> Self {
        self.default = default.into();
        self
    }

    pub fn with_flag(mut self, flag: impl Into<String>) -> Self {
        self.flag = Some(flag.into());
        self
    }

    pub fn flag(&self) -> String {
        self.flag
            .clone()
            .unwrap_or_else(|| format!("--{}", self.name))
    }
}

/// A value in one of the four supported types
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "lowercase")]
pub enum TypedValue {
    String(String),
    Integer(i64),
    Float(f64),
    Boolean(bool),
}

impl TypedValue {
    pub fn parse(param_type: ParameterType, raw: &str) -> Result<Self> {
        let invalid = || {
            CharmError::validation(format!("'{}' is not a valid {}", raw, param_type))
        };
        Ok(match param_type {
            ParameterType::String => Self::String(raw.to_string()),
            ParameterType::Integer => Self::Integer(raw.trim().parse().map_err(|_| invalid())?),
            ParameterType::Float => Self::Float(raw.trim().parse().map_err(|_| invalid())?),
            ParameterType::Boolean => match raw.trim().to_ascii_lowercase().as_str() {
                "true" | "1" => Self::Boolean(true),
                "false" | "0" => Self::Boolean(false),
                _ => return Err(invalid()),
            },
        })
    }

    pub fn param_type(&self) -> ParameterType {
        match self {
            Self::String(_) => ParameterType::String,
            Self::Integer(_) => ParameterType::Integer,
            Self::Float(_) => ParameterType::Float,
            Self::Boolean(_) => ParameterType::Boolean,
        }
    }
}

impl fmt::Display for TypedValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::String(s) => f.write_str(s),
            Self::Integer(i) => write!(f, "{}", i),
            Self::Float(x) => write!(f, "{}", x),
            Self::Boolean(b) => write!(f, "{}", b),
        }
    }
}

/// A parameter value bound to one record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterValue {
    pub name: String,
    pub value: TypedValue,
}

impl ParameterValue {
    pub fn new(name: impl Into<String>, value: TypedValue) -> Self {
        Self {
            name: name.into(),
            value,
        }
    }
}

/// Bind raw strings against `plugin`'s schema
///
/// Unknown names, unparsable values and missing required parameters are
/// rejected. Optional parameters with a non-empty default are filled in.
pub fn bind(plugin: &PluginDescriptor, raw: &BTreeMap<String, String>) -> Result<Vec<ParameterValue>> {
    for name in raw.keys() {
        if plugin.parameter(name).is_none() {
            return Err(CharmError::validation(format!(
                "plugin '{}' declares no parameter '{}'",
                plugin.name, name
            )));
        }
    }

    let mut values = Vec::new();
    for def in &plugin.parameters {
        match raw.get(&def.name) {
            Some(v) => values.push(ParameterValue::new(
                &def.name,
                TypedValue::parse(def.param_type, v)?,
            )),
            None if !def.optional => {
                return Err(CharmError::validation(format!(
                    "missing required parameter '{}'",
                    def.name
                )))
            }
            None if !def.default.is_empty() => values.push(ParameterValue::new(
                &def.name,
                TypedValue::parse(def.param_type, &def.default)?,
            )),
            None => {}
        }
    }
    Ok(values)
}
