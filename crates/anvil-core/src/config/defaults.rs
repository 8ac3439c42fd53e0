//! Default configuration values

/// Default configuration file name (TOML)
pub const DEFAULT_CONFIG_TOML: &str = "anvil.toml";

/// Default configuration file name (YAML)
pub const DEFAULT_CONFIG_YAML: &str = "anvil.yaml";

/// Directory under the build root holding history and the local cache
pub const STATE_DIR: &str = ".anvil";

/// Default maximum age of cache entries kept by `cache prune`
pub const DEFAULT_CACHE_MAX_AGE_DAYS: u64 = 30;

/// Default shell used to run task commands
pub const DEFAULT_SHELL: &str = "sh";

/// Config file names, in lookup priority order
pub fn config_file_names() -> Vec<&'static str> {
    vec![DEFAULT_CONFIG_TOML, DEFAULT_CONFIG_YAML, ".anvil.toml", ".anvil.yaml"]
}
