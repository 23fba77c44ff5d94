//! Runtime configuration for the `cord` binary.
//!
//! Values come from the process environment, after loading a `.env` file if
//! one is present.

use std::env;
use std::str::FromStr;

use thiserror::Error;
use tracing::Level;

pub const TOKEN_VAR: &str = "DISCORD_TOKEN";
pub const USER_AGENT_VAR: &str = "CORD_USER_AGENT";
pub const PREFIX_VAR: &str = "CORD_COMMAND_PREFIX";
pub const LOG_LEVEL_VAR: &str = "CORD_LOG_LEVEL";

const DEFAULT_PREFIX: &str = "!";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing environment variable {0}")]
    Missing(&'static str),

    #[error("invalid value for {name}: {value:?}")]
    Invalid { name: &'static str, value: String },
}

#[derive(Debug, Clone)]
pub struct Config {
    pub token: String,
    /// Replaces the default control channel user agent when set.
    pub user_agent: Option<String>,
    pub command_prefix: String,
    pub log_level: Level,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        // A missing .env file is fine; the variables may already be exported.
        let _ = dotenvy::dotenv();
        Self::from_lookup(|name| env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let token = lookup(TOKEN_VAR).ok_or(ConfigError::Missing(TOKEN_VAR))?;
        let user_agent = lookup(USER_AGENT_VAR).filter(|agent| !agent.is_empty());
        let command_prefix = match lookup(PREFIX_VAR) {
            Some(prefix) if prefix.is_empty() => {
                return Err(ConfigError::Invalid {
                    name: PREFIX_VAR,
                    value: prefix,
                })
            }
            Some(prefix) => prefix,
            None => DEFAULT_PREFIX.to_owned(),
        };
        let log_level = match lookup(LOG_LEVEL_VAR) {
            Some(level) => Level::from_str(&level).map_err(|_| ConfigError::Invalid {
                name: LOG_LEVEL_VAR,
                value: level,
            })?,
            None => Level::INFO,
        };

        Ok(Config {
            token,
            user_agent,
            command_prefix,
            log_level,
        })
    }
}
