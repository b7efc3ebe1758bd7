//! File names, environment variables and path helpers used by the CLI.

use std::path::{Path, PathBuf};

/// Hidden per-project and per-user directory
pub const ORCA_DIR_NAME: &str = ".orca";

/// Configuration file name inside [`ORCA_DIR_NAME`]
pub const CONFIG_FILE_NAME: &str = "config.toml";

/// Stand-alone configuration file looked up in the working directory
pub const LOCAL_CONFIG_FILE_NAME: &str = "orca.toml";

/// Explicit configuration file, takes precedence over discovery
pub const CONFIG_ENV_VAR: &str = "ORCA_CONFIG";

/// System-wide configuration directory (Unix-like systems)
pub const SYSTEM_CONFIG_DIR: &str = "/etc/orca";

/// Log filter used when neither `RUST_LOG` nor the config sets one
pub const DEFAULT_LOG_FILTER: &str = "orca=info";

/// Log filter forced by `--verbose`
pub const VERBOSE_LOG_FILTER: &str = "orca=debug";

/// Build the .orca directory path under `root`
pub fn orca_dir_path(root: &Path) -> PathBuf {
    root.join(ORCA_DIR_NAME)
}

pub fn user_config_dir_path(home_dir: &Path) -> PathBuf {
    orca_dir_path(home_dir)
}

/// ~/.orca/config.toml
pub fn user_config_file_path(home_dir: &Path) -> PathBuf {
    user_config_dir_path(home_dir).join(CONFIG_FILE_NAME)
}

/// ./.orca/config.toml
pub fn local_config_file_path(current_dir: &Path) -> PathBuf {
    orca_dir_path(current_dir).join(CONFIG_FILE_NAME)
}

/// ./orca.toml
pub fn local_config_toml_path(current_dir: &Path) -> PathBuf {
    current_dir.join(LOCAL_CONFIG_FILE_NAME)
}

pub fn system_config_file_path() -> PathBuf {
    Path::new(SYSTEM_CONFIG_DIR).join(CONFIG_FILE_NAME)
}

/// Home directory from `HOME` (or `USERPROFILE` on Windows)
pub fn home_dir() -> Option<PathBuf> {
    std::env::var_os("HOME")
        .or_else(|| std::env::var_os("USERPROFILE"))
        .filter(|value| !value.is_empty())
        .map(PathBuf::from)
}
