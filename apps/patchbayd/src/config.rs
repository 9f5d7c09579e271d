// SPDX-FileCopyrightText: © 2025 Patchbay Contributors
//
// SPDX-License-Identifier: MPL-2.0

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

fn default_idle_timeout_secs() -> u64 {
    3
}

const fn default_true() -> bool {
    true
}

fn default_level() -> String {
    "info".to_string()
}

/// Core identity and socket naming.
#[derive(Deserialize, Serialize, Debug, Clone, Default)]
pub struct CoreConfig {
    /// Socket name under `$XDG_RUNTIME_DIR`. Resolution order:
    /// `PATCHBAY_CORE` env, this field, `patchbay-0`.
    pub name: Option<String>,
    /// Properties published on the core object.
    #[serde(default)]
    pub properties: HashMap<String, String>,
}

/// Logging configuration. `PATCHBAY_DEBUG` and `RUST_LOG` override it.
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct LogConfig {
    #[serde(default = "default_level")]
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self { level: default_level() }
    }
}

/// Which built-in modules to load.
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct ModulesConfig {
    /// Registry access control by owner uid.
    #[serde(default = "default_true")]
    pub access: bool,
    /// Suspend nodes that stay idle.
    #[serde(default = "default_true")]
    pub suspend_on_idle: bool,
    /// Idle timeout before suspension, in seconds.
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
}

impl Default for ModulesConfig {
    fn default() -> Self {
        Self {
            access: true,
            suspend_on_idle: true,
            idle_timeout_secs: default_idle_timeout_secs(),
        }
    }
}

#[derive(Deserialize, Serialize, Debug, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub core: CoreConfig,
    #[serde(default)]
    pub log: LogConfig,
    #[serde(default)]
    pub modules: ModulesConfig,
}

impl Config {
    /// Layered load: defaults, then the TOML file, then `PATCHBAYD_*` env.
    pub fn load(path: &str) -> Result<Self, figment::Error> {
        Figment::from(figment::providers::Serialized::defaults(Self::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed("PATCHBAYD_").split("__"))
            .extract()
    }

    /// The socket name after applying the resolution order.
    pub fn socket_name(&self) -> String {
        std::env::var("PATCHBAY_CORE")
            .ok()
            .or_else(|| self.core.name.clone())
            .unwrap_or_else(|| "patchbay-0".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = Config::default();
        assert!(config.modules.access);
        assert!(config.modules.suspend_on_idle);
        assert_eq!(config.modules.idle_timeout_secs, 3);
        assert_eq!(config.log.level, "info");
    }

    #[test]
    fn toml_roundtrip() {
        let config = Config::default();
        let text = toml::to_string(&config).unwrap();
        let back: Config = toml::from_str(&text).unwrap();
        assert_eq!(back.modules.idle_timeout_secs, config.modules.idle_timeout_secs);
    }
}
