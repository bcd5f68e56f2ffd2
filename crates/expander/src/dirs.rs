use std::path::PathBuf;

use etcetera::{BaseStrategy, choose_base_strategy};

/// Name of the configuration file looked up in every configuration layer.
pub const CONFIG_FILE_NAME: &str = "expander.toml";

/// Returns the user-level configuration file path, e.g.
/// `~/.config/expander/expander.toml` on Linux.
///
/// Returns `None` when no home directory can be determined.
pub fn user_config_file() -> Option<PathBuf> {
    let strategy = choose_base_strategy().ok()?;
    Some(strategy.config_dir().join("expander").join(CONFIG_FILE_NAME))
}
