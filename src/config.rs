//! Daemon configuration: optional file, then defaults, then `CASCADE_*` env overrides.

use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::cascade::{CascadeConfig, Identity};
use crate::context::RuntimeContext;
use crate::export::telemetry::{parse_mqtt_endpoint, DEFAULT_TOPIC};
use crate::export::{HttpBlobStore, LocalBlobStore, MqttPublisher, MqttSettings};
use crate::model::http::{HttpInferenceClient, DEFAULT_TIMEOUT};

const DEFAULT_API_ADDR: &str = "127.0.0.1:8790";

#[derive(Debug, Deserialize, Default)]
struct DaemonConfigFile {
    api: Option<ApiConfigFile>,
    cascades: Option<Vec<PathBuf>>,
    mqtt: Option<MqttConfigFile>,
    blob: Option<BlobConfigFile>,
    inference: Option<InferenceConfigFile>,
    identity: Option<Identity>,
}

#[derive(Debug, Deserialize, Default)]
struct ApiConfigFile {
    addr: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct MqttConfigFile {
    broker: Option<String>,
    client_id: Option<String>,
    username: Option<String>,
    password: Option<String>,
    topic: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct BlobConfigFile {
    container_url: Option<String>,
    sas_token: Option<String>,
    local_dir: Option<PathBuf>,
}

#[derive(Debug, Deserialize, Default)]
struct InferenceConfigFile {
    endpoint: Option<String>,
    timeout_ms: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct DaemonConfig {
    pub api_addr: String,
    pub cascades: Vec<PathBuf>,
    pub mqtt: Option<MqttConfig>,
    pub blob: BlobSettings,
    pub inference: Option<InferenceSettings>,
    pub identity: Identity,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MqttConfig {
    pub settings: MqttSettings,
    pub topic: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BlobSettings {
    pub container_url: Option<String>,
    pub sas_token: Option<String>,
    pub local_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InferenceSettings {
    pub endpoint: String,
    pub timeout: Duration,
}

impl DaemonConfig {
    pub fn load() -> Result<Self> {
        let config_path = env_value("CASCADE_CONFIG").map(PathBuf::from);
        Self::load_from(config_path.as_deref())
    }

    /// Like `load()`, with the config file chosen by the caller.
    pub fn load_from(path: Option<&Path>) -> Result<Self> {
        let file_cfg = match path {
            Some(path) => Some(read_config_file(path)?),
            None => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default());
        cfg.apply_env();
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: DaemonConfigFile) -> Self {
        let api_addr = file
            .api
            .and_then(|api| api.addr)
            .unwrap_or_else(|| DEFAULT_API_ADDR.to_string());
        let mqtt = file.mqtt.and_then(|mqtt| {
            let broker = mqtt.broker.filter(|b| !b.trim().is_empty())?;
            Some(MqttConfig {
                settings: MqttSettings {
                    broker,
                    client_id: mqtt.client_id.unwrap_or_default(),
                    username: mqtt.username,
                    password: mqtt.password,
                },
                topic: mqtt.topic.unwrap_or_else(|| DEFAULT_TOPIC.to_string()),
            })
        });
        let blob = file
            .blob
            .map(|blob| BlobSettings {
                container_url: blob.container_url,
                sas_token: blob.sas_token,
                local_dir: blob.local_dir,
            })
            .unwrap_or_default();
        let inference = file.inference.and_then(|inference| {
            Some(InferenceSettings {
                endpoint: inference.endpoint.filter(|e| !e.trim().is_empty())?,
                timeout: inference
                    .timeout_ms
                    .map(Duration::from_millis)
                    .unwrap_or(DEFAULT_TIMEOUT),
            })
        });
        Self {
            api_addr,
            cascades: file.cascades.unwrap_or_default(),
            mqtt,
            blob,
            inference,
            identity: file.identity.unwrap_or_default(),
        }
    }

    fn apply_env(&mut self) {
        if let Some(addr) = env_value("CASCADE_API_ADDR") {
            self.api_addr = addr;
        }
        if let Some(files) = env_value("CASCADE_FILES") {
            let parsed = split_csv(&files);
            if !parsed.is_empty() {
                self.cascades = parsed.into_iter().map(PathBuf::from).collect();
            }
        }
        if let Some(broker) = env_value("CASCADE_MQTT_BROKER") {
            match self.mqtt.as_mut() {
                Some(mqtt) => mqtt.settings.broker = broker,
                None => {
                    self.mqtt = Some(MqttConfig {
                        settings: MqttSettings::new(&broker),
                        topic: DEFAULT_TOPIC.to_string(),
                    })
                }
            }
        }
        if let Some(url) = env_value("CASCADE_BLOB_URL") {
            self.blob.container_url = Some(url);
            self.blob.local_dir = None;
        }
        if let Some(dir) = env_value("CASCADE_BLOB_DIR") {
            self.blob.local_dir = Some(PathBuf::from(dir));
            self.blob.container_url = None;
        }
        if let Some(endpoint) = env_value("CASCADE_INFERENCE_URL") {
            match self.inference.as_mut() {
                Some(inference) => inference.endpoint = endpoint,
                None => {
                    self.inference = Some(InferenceSettings {
                        endpoint,
                        timeout: DEFAULT_TIMEOUT,
                    })
                }
            }
        }
        if let Some(instance) = env_value("CASCADE_INSTANCE_ID") {
            self.identity.instance_id = instance;
        }
    }

    fn validate(&mut self) -> Result<()> {
        self.api_addr
            .parse::<SocketAddr>()
            .map_err(|_| anyhow!("api addr '{}' must be host:port", self.api_addr))?;
        if let Some(mqtt) = &self.mqtt {
            parse_mqtt_endpoint(&mqtt.settings.broker)?;
            if mqtt.topic.trim().is_empty() {
                return Err(anyhow!("mqtt topic must not be empty"));
            }
        }
        if self.blob.container_url.is_some() && self.blob.local_dir.is_some() {
            return Err(anyhow!(
                "blob.container_url and blob.local_dir are mutually exclusive"
            ));
        }
        if let Some(inference) = &self.inference {
            if inference.timeout.is_zero() {
                return Err(anyhow!("inference timeout must be greater than zero"));
            }
        }
        self.cascades.dedup();
        Ok(())
    }

    /// Collaborators for every cascade this daemon runs.
    pub fn runtime_context(&self) -> Result<RuntimeContext> {
        let mut ctx = RuntimeContext::new().with_identity(self.identity.clone());
        if let Some(mqtt) = &self.mqtt {
            let publisher = MqttPublisher::connect(&mqtt.settings)
                .with_context(|| format!("mqtt broker {}", mqtt.settings.broker))?;
            ctx = ctx
                .with_telemetry(Arc::new(publisher))
                .with_telemetry_topic(&mqtt.topic);
        }
        if let Some(url) = &self.blob.container_url {
            ctx = ctx.with_blob_store(Arc::new(HttpBlobStore::new(
                url,
                self.blob.sas_token.as_deref(),
            )?));
        } else if let Some(dir) = &self.blob.local_dir {
            ctx = ctx.with_blob_store(Arc::new(LocalBlobStore::new(dir.clone())));
        }
        if let Some(inference) = &self.inference {
            ctx = ctx.with_inference(Arc::new(HttpInferenceClient::new(
                &inference.endpoint,
                inference.timeout,
            )?));
        }
        Ok(ctx)
    }

    /// Parse every configured cascade file.
    pub fn load_cascades(&self) -> Result<Vec<CascadeConfig>> {
        self.cascades
            .iter()
            .map(|path| CascadeConfig::load(path))
            .collect()
    }
}

fn env_value(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn read_config_file(path: &Path) -> Result<DaemonConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let cfg = match path.extension().and_then(|ext| ext.to_str()) {
        Some("toml") => toml::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?,
        _ => serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?,
    };
    Ok(cfg)
}

pub(crate) fn split_csv(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|entry| entry.trim())
        .filter(|entry| !entry.is_empty())
        .map(|entry| entry.to_string())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_without_file() {
        let cfg = DaemonConfig::from_file(DaemonConfigFile::default());
        assert_eq!(cfg.api_addr, DEFAULT_API_ADDR);
        assert!(cfg.cascades.is_empty());
        assert!(cfg.mqtt.is_none());
        assert!(cfg.inference.is_none());
    }

    #[test]
    fn mqtt_section_without_broker_is_ignored() {
        let file: DaemonConfigFile =
            serde_json::from_str(r#"{"mqtt": {"topic": "t"}}"#).expect("parse");
        assert!(DaemonConfig::from_file(file).mqtt.is_none());
    }

    #[test]
    fn both_blob_targets_are_rejected() {
        let mut cfg = DaemonConfig::from_file(DaemonConfigFile::default());
        cfg.blob.container_url = Some("https://acct.blob.example/c".into());
        cfg.blob.local_dir = Some(PathBuf::from("/tmp/x"));
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn split_csv_skips_blanks() {
        assert_eq!(split_csv(" a.json, ,b.toml,"), vec!["a.json", "b.toml"]);
    }
}
