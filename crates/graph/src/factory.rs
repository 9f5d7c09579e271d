// SPDX-FileCopyrightText: © 2025 Patchbay Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Node factories: named constructors for plugin-backed nodes.

use crate::node::NodePlugin;
use patchbay_core::{Properties, Result};

/// A registered way of making nodes. Factories are published as globals so
/// clients can discover and use them by name.
pub struct FactoryDef {
    pub name: String,
    pub version: u32,
    create: Box<dyn FnMut(&Properties) -> Result<Box<dyn NodePlugin>> + Send>,
}

impl FactoryDef {
    pub fn new(
        name: impl Into<String>,
        version: u32,
        create: impl FnMut(&Properties) -> Result<Box<dyn NodePlugin>> + Send + 'static,
    ) -> Self {
        Self { name: name.into(), version, create: Box::new(create) }
    }

    pub fn create(&mut self, props: &Properties) -> Result<Box<dyn NodePlugin>> {
        (self.create)(props)
    }
}

impl std::fmt::Debug for FactoryDef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FactoryDef")
            .field("name", &self.name)
            .field("version", &self.version)
            .finish_non_exhaustive()
    }
}
