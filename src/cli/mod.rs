// Copyright 2024-2026 extract-core Contributors
// SPDX-License-Identifier: Apache-2.0

//! CLI subcommands for the `extract-core` binary.
//!
//! ## Usage
//!
//! ```bash
//! extract-core simulate --items 50 --concurrency 4   # run a synthetic batch
//! extract-core config show                           # effective configuration
//! extract-core config validate                       # exit 1 on invalid config
//! ```

pub mod config_cmd;
pub mod simulate;

use std::path::PathBuf;

pub use simulate::{print_results, run_simulate, SimulateArgs};

use crate::config::{self, ConfigError, EngineConfig};

/// Environment variable naming a TOML config file.
pub const CONFIG_PATH_ENV: &str = "EXTRACT_CORE_CONFIG";

/// Config file from `--config PATH` or the environment, if any.
///
/// `--config PATH` is removed from `args` so subcommands never see it.
pub fn take_config_path(args: &mut Vec<String>) -> Option<PathBuf> {
    if let Some(pos) = args.iter().position(|a| a == "--config") {
        if pos + 1 < args.len() {
            let path = args.remove(pos + 1);
            args.remove(pos);
            return Some(PathBuf::from(path));
        }
    }
    std::env::var(CONFIG_PATH_ENV).ok().filter(|p| !p.is_empty()).map(PathBuf::from)
}

/// Load from the file when one is given, else from the environment.
pub fn load_config(path: Option<&PathBuf>) -> Result<EngineConfig, ConfigError> {
    match path {
        Some(path) => config::load_file(path),
        None => Ok(config::load()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_take_config_path_strips_flag() {
        let mut args: Vec<String> = ["extract-core", "--config", "engine.toml", "simulate"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let path = take_config_path(&mut args);
        assert_eq!(path, Some(PathBuf::from("engine.toml")));
        assert_eq!(args, vec!["extract-core", "simulate"]);
    }

    #[test]
    fn test_load_config_missing_file_is_error() {
        let path = PathBuf::from("/nonexistent/extract-core.toml");
        assert!(matches!(load_config(Some(&path)), Err(ConfigError::Io { .. })));
    }
}
