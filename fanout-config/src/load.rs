use std::io;
use std::path::{Path, PathBuf};

use rust_cli_config::{File, Map};
use serde::de::DeserializeOwned;
use thiserror::Error;

use crate::environment::Environment;

const CONFIGURATION_DIR: &str = "configuration";

const EXTENSIONS: &[&str] = &["yaml", "yml", "json"];

const ENV_PREFIX: &str = "APP";

#[derive(Debug, Error)]
pub enum LoadConfigError {
    #[error("failed to determine the current directory: {0}")]
    CurrentDir(#[source] io::Error),

    #[error("configuration directory `{0}` does not exist")]
    MissingConfigurationDirectory(PathBuf),

    #[error("no `base.(yaml|yml|json)` in `{0}`")]
    MissingBaseFile(PathBuf),

    #[error("failed to read `{path}`: {source}")]
    File {
        path: PathBuf,
        source: rust_cli_config::ConfigError,
    },

    #[error("failed to build configuration: {0}")]
    Build(#[source] rust_cli_config::ConfigError),

    #[error("failed to determine runtime environment: {0}")]
    Environment(#[from] io::Error),
}

/// Loads configuration from `./configuration` for the environment named by `APP_ENVIRONMENT`.
pub fn load_config<T: DeserializeOwned>() -> Result<T, LoadConfigError> {
    let directory = std::env::current_dir()
        .map_err(LoadConfigError::CurrentDir)?
        .join(CONFIGURATION_DIR);

    load_config_from(&directory, Environment::load()?)
}

/// Loads configuration from `directory`.
///
/// `base.*` is required, `{environment}.*` is optional and `APP_`-prefixed variables win over
/// both (`APP_MAX_CONCURRENCY=8`).
pub fn load_config_from<T: DeserializeOwned>(
    directory: &Path,
    environment: Environment,
) -> Result<T, LoadConfigError> {
    load_layers(directory, environment, None)
}

fn load_layers<T: DeserializeOwned>(
    directory: &Path,
    environment: Environment,
    variables: Option<Map<String, String>>,
) -> Result<T, LoadConfigError> {
    if !directory.is_dir() {
        return Err(LoadConfigError::MissingConfigurationDirectory(
            directory.to_path_buf(),
        ));
    }

    let base = find_file(directory, "base")
        .ok_or_else(|| LoadConfigError::MissingBaseFile(directory.to_path_buf()))?;

    let mut builder = rust_cli_config::Config::builder();
    for path in std::iter::once(base).chain(find_file(directory, environment.as_str())) {
        // Each file is built on its own first so a broken file is reported by path.
        rust_cli_config::Config::builder()
            .add_source(File::from(path.as_path()))
            .build()
            .map_err(|source| LoadConfigError::File {
                path: path.clone(),
                source,
            })?;
        builder = builder.add_source(File::from(path));
    }

    builder
        .add_source(
            rust_cli_config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true)
                .source(variables),
        )
        .build()
        .and_then(|config| config.try_deserialize())
        .map_err(LoadConfigError::Build)
}

fn find_file(directory: &Path, stem: &str) -> Option<PathBuf> {
    EXTENSIONS
        .iter()
        .map(|extension| directory.join(format!("{stem}.{extension}")))
        .find(|path| path.is_file())
}
