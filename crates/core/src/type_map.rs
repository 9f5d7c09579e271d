// SPDX-FileCopyrightText: © 2025 Patchbay Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Process-wide type interning: string URIs mapped to dense numeric ids.
//!
//! Every identifier that crosses a process boundary (interface types, format
//! keys, metadata kinds, commands) is registered here once and referred to by
//! its dense id afterwards. The table is append-only; ids are stable for the
//! lifetime of the map.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Dense id for an interned URI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TypeId(pub u32);

impl std::fmt::Display for TypeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Default)]
struct Inner {
    by_uri: HashMap<Arc<str>, TypeId>,
    by_id: Vec<Arc<str>>,
}

/// A cloneable handle to the interning table.
///
/// Passed explicitly into constructors instead of living in a global; clones
/// share the same table.
#[derive(Debug, Clone, Default)]
pub struct TypeMap {
    inner: Arc<Mutex<Inner>>,
}

impl TypeMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the id for `uri`, interning it on first sight.
    ///
    /// Repeated lookups of the same URI always return the same id.
    pub fn id_of(&self, uri: &str) -> TypeId {
        let mut inner = self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        if let Some(&id) = inner.by_uri.get(uri) {
            return id;
        }
        let id = TypeId(u32::try_from(inner.by_id.len()).unwrap_or(u32::MAX));
        let uri: Arc<str> = Arc::from(uri);
        inner.by_id.push(uri.clone());
        inner.by_uri.insert(uri, id);
        id
    }

    /// Reverse lookup. `None` for ids never handed out.
    pub fn uri_of(&self, id: TypeId) -> Option<Arc<str>> {
        let inner = self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        inner.by_id.get(id.0 as usize).cloned()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner).by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// The interface URIs every component needs, resolved once at startup.
#[derive(Debug, Clone)]
pub struct InterfaceTypes {
    pub core: TypeId,
    pub registry: TypeId,
    pub node: TypeId,
    pub client: TypeId,
    pub client_node: TypeId,
    pub link: TypeId,
    pub module: TypeId,
    pub factory: TypeId,
}

pub mod uri {
    pub const CORE: &str = "patchbay:interface:Core";
    pub const REGISTRY: &str = "patchbay:interface:Registry";
    pub const NODE: &str = "patchbay:interface:Node";
    pub const CLIENT: &str = "patchbay:interface:Client";
    pub const CLIENT_NODE: &str = "patchbay:interface:ClientNode";
    pub const LINK: &str = "patchbay:interface:Link";
    pub const MODULE: &str = "patchbay:interface:Module";
    pub const FACTORY: &str = "patchbay:interface:Factory";
}

impl InterfaceTypes {
    pub fn register(map: &TypeMap) -> Self {
        Self {
            core: map.id_of(uri::CORE),
            registry: map.id_of(uri::REGISTRY),
            node: map.id_of(uri::NODE),
            client: map.id_of(uri::CLIENT),
            client_node: map.id_of(uri::CLIENT_NODE),
            link: map.id_of(uri::LINK),
            module: map.id_of(uri::MODULE),
            factory: map.id_of(uri::FACTORY),
        }
    }
}
