//! Device filter interpreter.
//!
//! A job stores its target filter as a JSON object. Each recognized key becomes
//! one [`Predicate`]; a device is targeted when it satisfies every predicate
//! that has evaluation logic. Predicates without evaluation logic are kept so
//! they show up in logs, but they do not narrow the target set.

use std::collections::BTreeSet;

use serde_json::Value;

use crate::error::FilterError;
use crate::types::Device;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Predicate {
    /// Case-sensitive substring match on the device name.
    NameContains(String),
    /// Group membership. Accepted, not evaluated: devices carry no group data.
    GroupIds(BTreeSet<String>),
    /// A key this interpreter does not know. Accepted, not evaluated.
    Unsupported(String),
}

impl Predicate {
    /// `true` when the predicate does not exclude `device`.
    fn admits(&self, device: &Device) -> bool {
        match self {
            Predicate::NameContains(needle) => device.name.contains(needle.as_str()),
            Predicate::GroupIds(_) | Predicate::Unsupported(_) => true,
        }
    }

    fn is_evaluated(&self) -> bool {
        matches!(self, Predicate::NameContains(_))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceFilter {
    pub predicates: Vec<Predicate>,
}

impl DeviceFilter {
    /// Parse the stored JSON blob.
    pub fn parse(raw: &str) -> Result<Self, FilterError> {
        let value: Value = serde_json::from_str(raw)?;
        Self::from_value(&value)
    }

    pub fn from_value(value: &Value) -> Result<Self, FilterError> {
        let obj = match value {
            Value::Object(obj) => obj,
            Value::Null => return Ok(Self::default()),
            other => return Err(FilterError::NotAnObject(json_kind(other))),
        };

        let mut predicates = Vec::with_capacity(obj.len());
        for (key, val) in obj {
            predicates.push(parse_predicate(key, val)?);
        }
        Ok(Self { predicates })
    }

    pub fn matches(&self, device: &Device) -> bool {
        self.predicates.iter().all(|p| p.admits(device))
    }

    /// Predicates that were accepted but have no effect on the target set.
    pub fn ignored(&self) -> impl Iterator<Item = &Predicate> {
        self.predicates.iter().filter(|p| !p.is_evaluated())
    }

    pub fn apply(&self, devices: Vec<Device>) -> Vec<Device> {
        devices.into_iter().filter(|d| self.matches(d)).collect()
    }
}

fn parse_predicate(key: &str, val: &Value) -> Result<Predicate, FilterError> {
    match key {
        "name_contains" | "nameContains" => match val {
            Value::String(s) => Ok(Predicate::NameContains(s.clone())),
            _ => Err(FilterError::WrongType {
                field: key.to_string(),
                expected: "string",
            }),
        },
        "group_ids" | "groupIds" => {
            let wrong = || FilterError::WrongType {
                field: key.to_string(),
                expected: "array of strings",
            };
            let items = val.as_array().ok_or_else(wrong)?;
            let ids = items
                .iter()
                .map(|v| v.as_str().map(String::from).ok_or_else(wrong))
                .collect::<Result<BTreeSet<_>, _>>()?;
            Ok(Predicate::GroupIds(ids))
        }
        other => Ok(Predicate::Unsupported(other.to_string())),
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
