use std::fmt;
use std::str::FromStr;

use thiserror::Error;

/// Environment variable used to select the runtime environment.
pub const ENVIRONMENT_ENV_VAR: &str = "CHETL_ENVIRONMENT";

/// The runtime environment the replicator is deployed in.
///
/// Selects which environment-specific configuration file is layered on top
/// of the base configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Environment {
    #[default]
    Dev,
    Staging,
    Prod,
}

/// Error returned when an environment name is not recognized.
#[derive(Debug, Error)]
#[error("`{0}` is not a supported environment; use `dev`, `staging` or `prod`")]
pub struct ParseEnvironmentError(String);

impl Environment {
    /// Reads the environment from [`ENVIRONMENT_ENV_VAR`], defaulting to
    /// [`Environment::Dev`] when unset.
    pub fn load() -> Result<Environment, ParseEnvironmentError> {
        match std::env::var(ENVIRONMENT_ENV_VAR) {
            Ok(value) => value.parse(),
            Err(_) => Ok(Environment::default()),
        }
    }
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Environment::Dev => write!(f, "dev"),
            Environment::Staging => write!(f, "staging"),
            Environment::Prod => write!(f, "prod"),
        }
    }
}

impl FromStr for Environment {
    type Err = ParseEnvironmentError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "dev" => Ok(Environment::Dev),
            "staging" => Ok(Environment::Staging),
            "prod" => Ok(Environment::Prod),
            other => Err(ParseEnvironmentError(other.to_string())),
        }
    }
}
