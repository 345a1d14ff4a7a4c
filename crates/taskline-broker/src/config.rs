use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub const ENV_PREFIX: &str = "TASKLINE_BROKER";

/// Settings of the broker service process
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub max_connections: usize,
    /// Seconds a consumed message may stay unacknowledged before redelivery
    pub visibility_timeout_secs: u64,
    /// Seconds between sweeps of expired results and visibility timeouts
    pub purge_interval_secs: u64,
    /// Prometheus endpoint; disabled when unset
    pub metrics_port: Option<u16>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            host: "0.0.0.0".to_string(),
            port: taskline_protocol::DEFAULT_PORT,
            max_connections: 1000,
            visibility_timeout_secs: 3600,
            purge_interval_secs: 10,
            metrics_port: Some(9091),
        }
    }
}

impl ServerConfig {
    /// Optional file layered under `TASKLINE_BROKER_*` variables
    pub fn load(path: Option<&str>) -> anyhow::Result<Self> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(File::with_name(path).required(false));
        }
        let config = builder
            .add_source(Environment::with_prefix(ENV_PREFIX).try_parsing(true))
            .build()?
            .try_deserialize::<ServerConfig>()?;

        if config.max_connections == 0 {
            anyhow::bail!("max_connections must be at least 1");
        }
        Ok(config)
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn visibility_timeout(&self) -> Duration {
        Duration::from_secs(self.visibility_timeout_secs)
    }

    pub fn purge_interval(&self) -> Duration {
        Duration::from_secs(self.purge_interval_secs.max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_load_file_over_defaults() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "port = 7400\nvisibility_timeout_secs = 30").unwrap();

        let config = ServerConfig::load(file.path().to_str()).unwrap();
        assert_eq!(config.port, 7400);
        assert_eq!(config.visibility_timeout(), Duration::from_secs(30));
        assert_eq!(config.max_connections, 1000);
        assert_eq!(config.bind_address(), "0.0.0.0:7400");
    }
}
