//! YAML configuration file
//!
//! Durations are integer milliseconds.
use std::collections::BTreeSet;
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use std::{fs, io};

use raftd_api::NodeId;
use serde::Deserialize;
use thiserror::Error;

use crate::node::{ConnectionParameters, Parameters, StateParameters};
use crate::storage::{FileStorage, Storage, StorageError};

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("can't read config file: {0}")]
    Io(#[from] io::Error),
    #[error("invalid config: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("invalid address `{0}`")]
    InvalidAddress(String),
    #[error("invalid node uuid `{0}`")]
    InvalidUuid(String),
    #[error("missing field `{0}`")]
    MissingField(&'static str),
    #[error("can't open data dir: {0}")]
    Storage(#[from] StorageError),
}

pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

#[derive(Deserialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub concurrency: ConcurrencyConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    pub parameters: Option<ParametersConfig>,
}

#[derive(Deserialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct ConcurrencyConfig {
    /// Worker threads of the runtime
    pub threads: Option<usize>,
}

#[derive(Deserialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct LoggingConfig {
    /// `EnvFilter` directives, e.g. `info` or `raftd=debug`
    pub level: Option<String>,
}

#[derive(Deserialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct ParametersConfig {
    pub bind: Option<String>,
    pub neighbours: Option<Vec<String>>,
    pub data_dir: Option<PathBuf>,
    pub connection: Option<ConnectionConfig>,
    pub state: Option<StateConfig>,
}

#[derive(Deserialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct ConnectionConfig {
    pub retry: Option<u64>,
    pub connect_timeout: Option<u64>,
}

#[derive(Deserialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct StateConfig {
    pub uuid: Option<String>,
    pub election_timeout: Option<u64>,
    pub election_start_min: Option<u64>,
    pub election_start_max: Option<u64>,
}

impl Config {
    pub fn from_yaml_str(s: &str) -> ConfigResult<Self> {
        Ok(serde_yaml::from_str(s)?)
    }

    pub fn load(path: &Path) -> ConfigResult<Self> {
        Self::from_yaml_str(&fs::read_to_string(path)?)
    }

    /// Validate and turn into node [`Parameters`]
    pub fn parameters(&self) -> ConfigResult<Parameters> {
        let params = self
            .parameters
            .as_ref()
            .ok_or(ConfigError::MissingField("parameters"))?;

        let bind = resolve(required(params.bind.as_ref(), "parameters.bind")?)?;
        let neighbours = required(params.neighbours.as_ref(), "parameters.neighbours")?
            .iter()
            .map(|n| resolve(n))
            .collect::<ConfigResult<BTreeSet<_>>>()?;

        let connection = required(params.connection.as_ref(), "parameters.connection")?;
        let connection = ConnectionParameters::builder()
            .retry(millis(required(connection.retry, "parameters.connection.retry")?))
            .connect_timeout(
                connection
                    .connect_timeout
                    .map(millis)
                    .unwrap_or(ConnectionParameters::DEFAULT_CONNECT_TIMEOUT),
            )
            .build();

        let state = required(params.state.as_ref(), "parameters.state")?;
        let uuid = required(state.uuid.as_ref(), "parameters.state.uuid")?;
        let state = StateParameters::builder()
            .uuid(
                uuid.parse::<NodeId>()
                    .map_err(|_| ConfigError::InvalidUuid(uuid.clone()))?,
            )
            .election_timeout(millis(required(
                state.election_timeout,
                "parameters.state.election-timeout",
            )?))
            .election_start_min(millis(required(
                state.election_start_min,
                "parameters.state.election-start-min",
            )?))
            .election_start_max(millis(required(
                state.election_start_max,
                "parameters.state.election-start-max",
            )?))
            .build();

        let storage: Arc<dyn Storage> = match params.data_dir.as_ref() {
            Some(data_dir) => Arc::new(FileStorage::new(data_dir)?),
            None => Parameters::default_storage(),
        };

        Ok(Parameters::builder()
            .bind(bind)
            .neighbours(neighbours)
            .connection(connection)
            .state(state)
            .storage(storage)
            .build())
    }
}

fn required<T>(v: Option<T>, name: &'static str) -> ConfigResult<T> {
    v.ok_or(ConfigError::MissingField(name))
}

fn millis(ms: u64) -> Duration {
    Duration::from_millis(ms)
}

/// `host:port`, resolving host names
fn resolve(addr: &str) -> ConfigResult<SocketAddr> {
    if let Ok(addr) = addr.parse() {
        return Ok(addr);
    }
    addr.to_socket_addrs()
        .ok()
        .and_then(|mut addrs| addrs.next())
        .ok_or_else(|| ConfigError::InvalidAddress(addr.to_owned()))
}

#[cfg(test)]
mod tests {
    use super::*;

    const FULL: &str = r#"
concurrency:
  threads: 3
logging:
  level: debug
parameters:
  bind: "127.0.0.1:7000"
  neighbours: ["127.0.0.1:7001", "[::1]:7002"]
  connection:
    retry: 100
    connect-timeout: 250
  state:
    uuid: 67e55044-10b1-426f-9247-bb680e5fe0c8
    election-timeout: 300
    election-start-min: 150
    election-start-max: 200
"#;

    #[test]
    fn full_config() -> anyhow::Result<()> {
        let config = Config::from_yaml_str(FULL)?;
        assert_eq!(config.concurrency.threads, Some(3));
        assert_eq!(config.logging.level.as_deref(), Some("debug"));

        let params = config.parameters()?;
        assert_eq!(params.bind, "127.0.0.1:7000".parse::<SocketAddr>()?);
        assert_eq!(
            params.neighbours.into_iter().collect::<Vec<_>>(),
            vec![
                "127.0.0.1:7001".parse::<SocketAddr>()?,
                "[::1]:7002".parse::<SocketAddr>()?
            ]
        );
        assert_eq!(params.connection.retry, Duration::from_millis(100));
        assert_eq!(params.connection.connect_timeout, Duration::from_millis(250));
        assert_eq!(
            params.state.uuid,
            "67e55044-10b1-426f-9247-bb680e5fe0c8".parse::<NodeId>()?
        );
        assert_eq!(params.state.election_timeout, Duration::from_millis(300));
        assert_eq!(params.state.election_start_min, Duration::from_millis(150));
        assert_eq!(params.state.election_start_max, Duration::from_millis(200));
        Ok(())
    }

    #[test]
    fn optional_sections_default() -> anyhow::Result<()> {
        let config = Config::from_yaml_str(
            r#"
parameters:
  bind: 127.0.0.1:0
  neighbours: []
  connection: { retry: 50 }
  state:
    uuid: 67e55044-10b1-426f-9247-bb680e5fe0c8
    election-timeout: 1
    election-start-min: 2
    election-start-max: 3
"#,
        )?;
        assert_eq!(config.concurrency, ConcurrencyConfig::default());
        assert_eq!(config.logging, LoggingConfig::default());

        let params = config.parameters()?;
        assert!(params.neighbours.is_empty());
        assert_eq!(
            params.connection.connect_timeout,
            ConnectionParameters::DEFAULT_CONNECT_TIMEOUT
        );
        Ok(())
    }

    #[test]
    fn data_dir_selects_file_storage() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let yaml = FULL.replace(
            "  bind: \"127.0.0.1:7000\"\n",
            &format!("  bind: \"127.0.0.1:7000\"\n  data-dir: {}\n", dir.path().display()),
        );
        let params = Config::from_yaml_str(&yaml)?.parameters()?;
        assert_eq!(params.storage.load()?, None);
        Ok(())
    }

    #[test]
    fn missing_and_invalid_fields() {
        let without = |line: &str| Config::from_yaml_str(&FULL.replace(line, "")).unwrap();

        assert!(matches!(
            without("    election-timeout: 300\n").parameters(),
            Err(ConfigError::MissingField("parameters.state.election-timeout"))
        ));
        assert!(matches!(
            without("  bind: \"127.0.0.1:7000\"\n").parameters(),
            Err(ConfigError::MissingField("parameters.bind"))
        ));
        assert!(matches!(
            Config::default().parameters(),
            Err(ConfigError::MissingField("parameters"))
        ));

        let bad_addr = FULL.replace("127.0.0.1:7001", "not an address");
        assert!(matches!(
            Config::from_yaml_str(&bad_addr).unwrap().parameters(),
            Err(ConfigError::InvalidAddress(_))
        ));

        let bad_uuid = FULL.replace("67e55044-10b1", "zz");
        assert!(matches!(
            Config::from_yaml_str(&bad_uuid).unwrap().parameters(),
            Err(ConfigError::InvalidUuid(_))
        ));

        assert!(matches!(
            Config::from_yaml_str("parameters: { bogus: 1 }"),
            Err(ConfigError::Yaml(_))
        ));
    }
}
