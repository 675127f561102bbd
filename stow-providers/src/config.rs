// SPDX-License-Identifier: AGPL-3.0-or-later
//! Typed access to a descriptor's resolved key/value config

use std::collections::BTreeMap;
use std::str::FromStr;

use stow_core::{StorageDescriptor, StorageKind, StowError, StowResult};

pub(crate) struct Settings {
    kind: StorageKind,
    values: BTreeMap<String, String>,
}

impl Settings {
    pub fn from_descriptor(descriptor: &StorageDescriptor) -> StowResult<Self> {
        Ok(Self {
            kind: descriptor.kind,
            values: descriptor.resolved_config()?,
        })
    }

    pub fn optional(&self, key: &str) -> Option<&str> {
        self.values
            .get(key)
            .map(|v| v.trim())
            .filter(|v| !v.is_empty())
    }

    pub fn required(&self, key: &str) -> StowResult<&str> {
        self.optional(key).ok_or_else(|| {
            StowError::InvalidConfig(format!("{} storage requires `{}`", self.kind, key))
        })
    }

    pub fn parse_or<T: FromStr>(&self, key: &str, default: T) -> StowResult<T> {
        match self.optional(key) {
            None => Ok(default),
            Some(raw) => raw.parse().map_err(|_| {
                StowError::InvalidConfig(format!("{}: invalid value for `{}`: {}", self.kind, key, raw))
            }),
        }
    }

    pub fn flag(&self, key: &str, default: bool) -> StowResult<bool> {
        match self.optional(key).map(|v| v.to_ascii_lowercase()) {
            None => Ok(default),
            Some(v) if matches!(v.as_str(), "true" | "yes" | "1" | "on") => Ok(true),
            Some(v) if matches!(v.as_str(), "false" | "no" | "0" | "off") => Ok(false),
            Some(v) => Err(StowError::InvalidConfig(format!(
                "{}: `{}` must be a boolean, got {}",
                self.kind, key, v
            ))),
        }
    }
}
