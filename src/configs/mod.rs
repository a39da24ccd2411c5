use crate::error::AppResult;
use config::{Config, Environment as ConfigEnv, File as ConfigFile, FileFormat};
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub const DEFAULT_CONFIG_FILE: &str = "certsentry.json";

/// Application configuration, loaded from a JSON file with
/// `CERTSENTRY_*` environment overrides.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MonitorConfig {
    pub work_dir: String,
    pub listen: String,
    pub log_prefix: String,
    pub max_threads: usize,
    pub retransfer_delay: u64,
    pub tls_timeout: u64,
    pub watcher_delay: u64,
    pub zones: Vec<ZoneConfig>,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            work_dir: ".".to_owned(),
            listen: "127.0.0.1:8080".to_owned(),
            log_prefix: "certsentry".to_owned(),
            max_threads: 2,
            retransfer_delay: 3600,
            tls_timeout: 5,
            watcher_delay: 300,
            zones: Vec::new(),
        }
    }
}

impl MonitorConfig {
    pub fn load_config(path: &str) -> AppResult<Self> {
        let cfg = Config::builder()
            .add_source(ConfigFile::new(path, FileFormat::Json).required(true))
            .add_source(ConfigEnv::with_prefix("CERTSENTRY").separator("__"))
            .build()?
            .try_deserialize()?;
        Ok(cfg)
    }

    pub fn tls_timeout(&self) -> Duration {
        Duration::from_secs(self.tls_timeout)
    }

    pub fn retransfer_delay(&self) -> Duration {
        Duration::from_secs(self.retransfer_delay)
    }

    pub fn watcher_delay(&self) -> Duration {
        Duration::from_secs(self.watcher_delay)
    }
}

/// One DNS zone to discover endpoints from.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ZoneConfig {
    pub master: String,
    pub name: String,
    pub proto: String,
    #[serde(rename = "omitMX")]
    pub omit_mx: bool,
    #[serde(rename = "portMX")]
    pub port_mx: u16,
    pub excludes: Vec<String>,
}

#[cfg(test)]
mod test {
    use super::*;

    const SAMPLE: &str = r#"{
        "workDir": "/var/lib/certsentry",
        "listen": "0.0.0.0:9000",
        "logPrefix": "[certsentry] ",
        "maxThreads": 8,
        "retransferDelay": 1800,
        "tlsTimeout": 3,
        "watcherDelay": 120,
        "zones": [
            {
                "master": "10.0.0.53:53",
                "name": "corp.example.",
                "proto": "tcp",
                "omitMX": false,
                "portMX": 25,
                "excludes": ["legacy.corp.example"]
            }
        ]
    }"#;

    #[test]
    fn parse_sample_config() {
        let cfg: MonitorConfig = Config::builder()
            .add_source(ConfigFile::from_str(SAMPLE, FileFormat::Json))
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap();

        assert_eq!(cfg.work_dir, "/var/lib/certsentry");
        assert_eq!(cfg.max_threads, 8);
        assert_eq!(cfg.retransfer_delay(), Duration::from_secs(1800));
        assert_eq!(cfg.zones.len(), 1);
        let zone = &cfg.zones[0];
        assert_eq!(zone.name, "corp.example.");
        assert_eq!(zone.port_mx, 25);
        assert!(!zone.omit_mx);
        assert_eq!(zone.excludes, vec!["legacy.corp.example".to_owned()]);
    }

    #[test]
    fn defaults_apply_for_missing_keys() {
        let cfg: MonitorConfig = Config::builder()
            .add_source(ConfigFile::from_str(r#"{"listen": "[::1]:8443"}"#, FileFormat::Json))
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap();

        assert_eq!(cfg.listen, "[::1]:8443");
        assert_eq!(cfg.max_threads, 2);
        assert_eq!(cfg.watcher_delay(), Duration::from_secs(300));
        assert!(cfg.zones.is_empty());
    }
}
