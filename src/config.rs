use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::appcontext::PollPolicy;
use crate::certissuer::{DEFAULT_KEY_SIZE, MIN_KEY_SIZE};
use crate::error::Error;
use crate::inventory::ClusterEntry;
use crate::rsync::WatchPolicy;
use crate::store::{ConfigMapStore, MemoryStore, ResourceStore};

#[derive(Serialize, Deserialize, Clone, PartialEq, Debug)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StoreConfig {
    Memory,
    Configmap { namespace: String },
}

impl StoreConfig {
    pub async fn open(&self) -> Result<Arc<dyn ResourceStore>, Error> {
        match self {
            StoreConfig::Memory => Ok(Arc::new(MemoryStore::new())),
            StoreConfig::Configmap { namespace } => {
                let client = kube::Client::try_default().await?;
                info!(namespace = %namespace, "using configmap store");
                Ok(Arc::new(ConfigMapStore::new(client, namespace)))
            }
        }
    }
}

#[derive(Serialize, Deserialize, Clone, PartialEq, Debug)]
#[serde(default, rename_all = "camelCase")]
pub struct Config {
    pub rsync_endpoint: String,
    /// Name this service subscribes to ready notifications with
    pub client_name: String,
    pub backoff_secs: u64,
    pub max_backoff_secs: u64,
    /// 0 polls until the certificates show up
    pub status_poll_attempts: u32,
    pub status_poll_interval_ms: u64,
    /// 0 disables the watch deadline
    pub watch_timeout_secs: u64,
    pub default_key_size: usize,
    pub store: StoreConfig,
    pub clusters: Vec<ClusterEntry>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            rsync_endpoint: "http://rsync:9031".into(),
            client_name: "ca-cert-orchestrator".into(),
            backoff_secs: 5,
            max_backoff_secs: 60,
            status_poll_attempts: 300,
            status_poll_interval_ms: 2000,
            watch_timeout_secs: 0,
            default_key_size: DEFAULT_KEY_SIZE,
            store: StoreConfig::Memory,
            clusters: Vec::new(),
        }
    }
}

impl Config {
    pub fn from_file(path: &Path) -> Result<Config, Error> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("unable to read {}: {}", path.display(), e)))?;
        let config: Config = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.client_name.is_empty() {
            return Err(Error::Config("clientName must not be empty".into()));
        }
        if self.backoff_secs == 0 {
            return Err(Error::Config("backoffSecs must be at least 1".into()));
        }
        if self.max_backoff_secs < self.backoff_secs {
            return Err(Error::Config(format!(
                "maxBackoffSecs {} is below backoffSecs {}",
                self.max_backoff_secs, self.backoff_secs
            )));
        }
        if self.default_key_size < MIN_KEY_SIZE {
            return Err(Error::Config(format!(
                "defaultKeySize must be at least {}",
                MIN_KEY_SIZE
            )));
        }
        Ok(())
    }

    pub fn settings(&self) -> Settings {
        Settings {
            client_name: self.client_name.clone(),
            default_key_size: self.default_key_size,
            watch: WatchPolicy {
                backoff: Duration::from_secs(self.backoff_secs),
                max_backoff: Duration::from_secs(self.max_backoff_secs),
                timeout: match self.watch_timeout_secs {
                    0 => None,
                    secs => Some(Duration::from_secs(secs)),
                },
            },
            poll: PollPolicy {
                max_attempts: self.status_poll_attempts,
                interval: Duration::from_millis(self.status_poll_interval_ms),
            },
        }
    }
}

/// Runtime knobs handed to the orchestrators
#[derive(Clone, Debug, PartialEq)]
pub struct Settings {
    pub client_name: String,
    pub default_key_size: usize,
    pub watch: WatchPolicy,
    pub poll: PollPolicy,
}

impl Default for Settings {
    fn default() -> Self {
        Config::default().settings()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn partial_config_uses_defaults() {
        let config: Config = serde_json::from_value(json!({
            "rsyncEndpoint": "http://127.0.0.1:9031",
            "store": {"type": "configmap", "namespace": "emco"},
            "clusters": [{"provider": "p1", "name": "c1", "labels": ["edge"]}]
        }))
        .unwrap();
        assert_eq!(config.client_name, "ca-cert-orchestrator");
        assert_eq!(
            config.store,
            StoreConfig::Configmap {
                namespace: "emco".into()
            }
        );
        assert_eq!(config.clusters[0].labels, vec!["edge"]);
        config.validate().unwrap();
    }

    #[test]
    fn zero_timeout_means_no_deadline() {
        let settings = Config::default().settings();
        assert_eq!(settings.watch.timeout, None);
        assert_eq!(settings.poll.max_attempts, 300);

        let config = Config {
            watch_timeout_secs: 600,
            ..Default::default()
        };
        assert_eq!(
            config.settings().watch.timeout,
            Some(Duration::from_secs(600))
        );
    }

    #[test]
    fn invalid_backoff_is_rejected() {
        let config = Config {
            backoff_secs: 10,
            max_backoff_secs: 5,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn small_default_key_is_rejected() {
        let config = Config {
            default_key_size: 1024,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
