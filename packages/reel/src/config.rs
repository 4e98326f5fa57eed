use std::ffi::OsStr;
use std::str::FromStr;

use serde::Deserialize;

use crate::ErrorContext as _;

/// Configuration of a [`Driver`](crate::Driver)
///
/// All fields have defaults, so a partial TOML document (or an empty environment)
/// is a valid configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Size of the worker pool.
    ///
    /// - `> 0`: exactly that many workers
    /// - `0`: the number of logical processors
    /// - `< 0`: the number of logical processors minus that many, minimum 1
    pub workers: isize,
    /// Chunks a stream may produce ahead of demand. `0` is fully lazy
    pub prefetch: usize,
    /// Read size for file and network primitives
    pub chunk_size: usize,
    /// Name prefix of the threads owned by the driver
    pub thread_prefix: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            workers: 0,
            prefetch: 0,
            chunk_size: 65536,
            thread_prefix: "reel".to_string(),
        }
    }
}

impl Config {
    /// Read the configuration from environment variables.
    ///
    /// `REEL_WORKERS`, `REEL_PREFETCH`, `REEL_CHUNK_SIZE` and `REEL_THREAD_PREFIX`
    /// override the respective fields. Unset or empty variables keep the default.
    pub fn from_env() -> crate::Result<Self> {
        let mut config = Self::default();
        if let Some(x) = parse_env_var("REEL_WORKERS")? {
            config.workers = x;
        }
        if let Some(x) = parse_env_var("REEL_PREFETCH")? {
            config.prefetch = x;
        }
        if let Some(x) = parse_env_var("REEL_CHUNK_SIZE")? {
            config.chunk_size = x;
        }
        let prefix = env_var("REEL_THREAD_PREFIX")?;
        if !prefix.is_empty() {
            config.thread_prefix = prefix;
        }
        Ok(config)
    }

    /// Parse the configuration from a TOML document
    ///
    /// ```rust
    /// # use pistonite_reel as reel;
    /// let config = reel::Config::from_toml("workers = 2\nprefetch = 1")?;
    /// assert_eq!(config.workers, 2);
    /// assert_eq!(config.chunk_size, 65536);
    /// # Ok::<(), reel::Error>(())
    /// ```
    #[cfg(feature = "toml")]
    pub fn from_toml(input: &str) -> crate::Result<Self> {
        crate::check!(toml::from_str(input), "failed to parse configuration")
    }

    /// Load the configuration from a TOML file
    #[cfg(feature = "toml")]
    pub fn load(path: impl AsRef<std::path::Path>) -> crate::Result<Self> {
        let path = path.as_ref();
        let input = crate::check!(
            std::fs::read_to_string(path),
            "failed to read configuration file '{}'",
            path.display()
        )?;
        crate::check!(
            Self::from_toml(&input),
            "invalid configuration file '{}'",
            path.display()
        )
    }
}

/// Like [`std::env::var`], but treat not-set as empty string.
fn env_var(var: impl AsRef<OsStr>) -> crate::Result<String> {
    let var = var.as_ref();
    crate::trace!("reading env var '{}'", var.display());
    match std::env::var(var) {
        Ok(v) => Ok(v),
        Err(std::env::VarError::NotPresent) => Ok(String::new()),
        Err(e) => {
            crate::rethrow!(e, "failed to read env var '{}'", var.display());
        }
    }
}

fn parse_env_var<T>(var: &str) -> crate::Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let value = env_var(var)?;
    let value = value.trim();
    if value.is_empty() {
        return Ok(None);
    }
    let parsed = crate::check!(value.parse(), "invalid value for {var}: '{value}'")?;
    Ok(Some(parsed))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = Config::default();
        assert_eq!(config.workers, 0);
        assert_eq!(config.prefetch, 0);
        assert_eq!(config.chunk_size, 65536);
        assert_eq!(config.thread_prefix, "reel");
    }

    #[test]
    fn unset_env_var_is_empty() {
        assert!(env_var("REEL_TEST_SURELY_NOT_SET").unwrap().is_empty());
        assert!(parse_env_var::<usize>("REEL_TEST_SURELY_NOT_SET").unwrap().is_none());
    }

    #[cfg(feature = "toml")]
    #[test]
    fn toml_partial_document() {
        let config = Config::from_toml("thread_prefix = \"demo\"\nworkers = -1").unwrap();
        assert_eq!(config.thread_prefix, "demo");
        assert_eq!(config.workers, -1);
        assert_eq!(config.prefetch, 0);
        assert_eq!(Config::from_toml("").unwrap(), Config::default());
    }

    #[cfg(feature = "toml")]
    #[test]
    fn toml_rejects_unknown_and_malformed() {
        assert!(Config::from_toml("wrokers = 2").is_err());
        assert!(Config::from_toml("prefetch = -3").is_err());
        let e = Config::load("/no/such/reel.toml").unwrap_err();
        assert!(e.to_string().contains("/no/such/reel.toml"));
    }
}
