use std::io;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use thiserror::Error;

use crate::environment::{Environment, ParseEnvironmentError};

/// Directory containing configuration files relative to the working directory.
const CONFIGURATION_DIR: &str = "configuration";

/// Environment variable for specifying an absolute path to the configuration
/// directory.
const CONFIG_DIR_ENV_VAR: &str = "CHETL_CONFIG_DIR";

/// Supported extensions for base and environment configuration files.
const CONFIG_FILE_EXTENSIONS: &[&str] = &["yaml", "yml", "json"];

/// Prefix for environment variable configuration overrides.
const ENV_PREFIX: &str = "CHETL";

/// Separator for nested configuration keys in environment variables.
const ENV_SEPARATOR: &str = "__";

/// Errors that can occur while loading configuration files and overrides.
#[derive(Debug, Error)]
pub enum LoadConfigError {
    /// Failed to determine the current working directory.
    #[error("failed to determine the current directory")]
    CurrentDir(#[source] io::Error),

    /// The configuration directory does not exist.
    #[error("configuration directory `{0}` does not exist")]
    MissingConfigurationDirectory(PathBuf),

    /// Could not locate the base configuration file.
    #[error("could not locate a base configuration file in `{0}`")]
    BaseConfigurationMissing(PathBuf),

    /// The runtime environment name is not recognized.
    #[error(transparent)]
    Environment(#[from] ParseEnvironmentError),

    /// The configuration sources failed to merge or deserialize.
    #[error("failed to build the configuration")]
    Config(#[from] config::ConfigError),
}

/// Loads a configuration of type `T` from layered sources.
///
/// Sources are merged in order of increasing precedence:
/// 1. `<dir>/base.{yaml,yml,json}`
/// 2. `<dir>/<environment>.{yaml,yml,json}`, when present
/// 3. environment variables prefixed with `CHETL` and `__`-separated
///    (`CHETL__STORAGE__PERS_STORAGE_PATH=/var/lib/chetl`)
///
/// The directory is `$CHETL_CONFIG_DIR` when set, otherwise `./configuration`.
pub fn load_config<T: DeserializeOwned>() -> Result<T, LoadConfigError> {
    let directory = configuration_directory()?;
    if !directory.is_dir() {
        return Err(LoadConfigError::MissingConfigurationDirectory(directory));
    }

    let environment = Environment::load()?;

    let base_file = find_config_file(&directory, "base")
        .ok_or_else(|| LoadConfigError::BaseConfigurationMissing(directory.clone()))?;

    let mut builder = config::Config::builder().add_source(config::File::from(base_file));

    if let Some(environment_file) = find_config_file(&directory, &environment.to_string()) {
        builder = builder.add_source(config::File::from(environment_file));
    }

    let settings = builder
        .add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator(ENV_SEPARATOR)
                .separator(ENV_SEPARATOR),
        )
        .build()?;

    Ok(settings.try_deserialize::<T>()?)
}

fn configuration_directory() -> Result<PathBuf, LoadConfigError> {
    if let Ok(dir) = std::env::var(CONFIG_DIR_ENV_VAR) {
        return Ok(PathBuf::from(dir));
    }

    let current_dir = std::env::current_dir().map_err(LoadConfigError::CurrentDir)?;
    Ok(current_dir.join(CONFIGURATION_DIR))
}

fn find_config_file(directory: &Path, stem: &str) -> Option<PathBuf> {
    CONFIG_FILE_EXTENSIONS
        .iter()
        .map(|extension| directory.join(format!("{stem}.{extension}")))
        .find(|candidate| candidate.is_file())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shared::ReplicatorConfig;
    use std::fs;

    // Both scenarios share the CHETL_CONFIG_DIR process global, so they run
    // in one test to avoid racing with the parallel test harness.
    #[test]
    fn test_load_config_from_directory() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("base.yaml"),
            r#"
sync_workers: 2
storage:
  pers_storage_type: diskv
  pers_storage_path: /tmp/chetl-state
tables:
  public.users:
    engine: CollapsingMergeTree
"#,
        )
        .unwrap();

        unsafe {
            std::env::set_var(CONFIG_DIR_ENV_VAR, dir.path());
        }
        let config: ReplicatorConfig = load_config().unwrap();
        assert_eq!(config.sync_workers, 2);
        assert!(config.tables.contains_key("public.users"));

        unsafe {
            std::env::set_var(CONFIG_DIR_ENV_VAR, "/definitely/not/a/real/path");
        }
        let result: Result<ReplicatorConfig, _> = load_config();
        assert!(matches!(
            result,
            Err(LoadConfigError::MissingConfigurationDirectory(_))
        ));

        unsafe {
            std::env::remove_var(CONFIG_DIR_ENV_VAR);
        }
    }
}
