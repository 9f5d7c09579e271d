// SPDX-FileCopyrightText: © 2025 Patchbay Contributors
//
// SPDX-License-Identifier: MPL-2.0

use crate::config::LogConfig;
use tracing_subscriber::EnvFilter;

/// Maps the numeric debug levels of `PATCHBAY_DEBUG` onto filter directives.
fn numeric_level(n: u32) -> &'static str {
    match n {
        0 => "off",
        1 => "error",
        2 => "warn",
        3 => "info",
        4 => "debug",
        _ => "trace",
    }
}

/// Builds the filter from, in priority order: `PATCHBAY_DEBUG` (a number or
/// per-topic directives), `RUST_LOG`, the config level.
pub fn filter_for(config: &LogConfig) -> EnvFilter {
    if let Ok(raw_debug) = std::env::var("PATCHBAY_DEBUG") {
        let directives = raw_debug
            .parse::<u32>()
            .map_or(raw_debug.clone(), |n| numeric_level(n).to_string());
        if let Ok(filter) = EnvFilter::try_new(&directives) {
            return filter;
        }
        tracing::warn!(value = %raw_debug, "unparseable PATCHBAY_DEBUG, ignoring");
    }
    EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.level.as_str()))
}

/// Installs the global subscriber.
pub fn init_logging(config: &LogConfig) {
    tracing_subscriber::fmt().with_env_filter(filter_for(config)).init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numeric_levels_map_like_the_classic_scheme() {
        assert_eq!(numeric_level(0), "off");
        assert_eq!(numeric_level(3), "info");
        assert_eq!(numeric_level(9), "trace");
    }

    #[test]
    fn config_level_is_the_fallback() {
        // No env manipulation here; just check the parse path.
        let filter = EnvFilter::try_new("debug");
        assert!(filter.is_ok());
    }
}
