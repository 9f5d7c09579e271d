// SPDX-FileCopyrightText: © 2025 Patchbay Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Ordered string dictionaries attached to core, clients, nodes, and links.

use crate::error::{Error, Result};
use crate::pod::Pod;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// A set of `key = value` properties with stable insertion order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Properties {
    dict: IndexMap<String, String>,
}

impl Properties {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.dict.get(key).map(String::as_str)
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.dict.insert(key.into(), value.into());
    }

    pub fn remove(&mut self, key: &str) -> Option<String> {
        self.dict.shift_remove(key)
    }

    /// Merges `other` into `self`, overwriting existing keys.
    pub fn update(&mut self, other: &Self) {
        for (k, v) in &other.dict {
            self.dict.insert(k.clone(), v.clone());
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.dict.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.dict.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dict.is_empty()
    }

    /// Wire form: a struct of alternating key and value strings.
    pub fn to_pod(&self) -> Pod {
        let mut fields = Vec::with_capacity(self.dict.len() * 2);
        for (k, v) in &self.dict {
            fields.push(Pod::String(k.clone()));
            fields.push(Pod::String(v.clone()));
        }
        Pod::Struct(fields)
    }

    pub fn from_pod(pod: &Pod) -> Result<Self> {
        let fields = pod
            .as_struct()
            .ok_or_else(|| Error::Protocol("properties must be a struct pod".into()))?;
        if fields.len() % 2 != 0 {
            return Err(Error::Protocol("odd number of property fields".into()));
        }
        let mut props = Self::new();
        for pair in fields.chunks_exact(2) {
            let key = pair[0]
                .as_str()
                .ok_or_else(|| Error::Protocol("property key must be a string".into()))?;
            let value = pair[1]
                .as_str()
                .ok_or_else(|| Error::Protocol("property value must be a string".into()))?;
            props.set(key, value);
        }
        Ok(props)
    }
}

impl<K: Into<String>, V: Into<String>, const N: usize> From<[(K, V); N]> for Properties {
    fn from(pairs: [(K, V); N]) -> Self {
        let mut props = Self::new();
        for (k, v) in pairs {
            props.set(k, v);
        }
        props
    }
}
