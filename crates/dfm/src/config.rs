//! Site and environment configuration.
//!
//! The site YAML is loaded once at service start and is read-only afterwards;
//! replacing it means restarting the service. Unknown keys are rejected.

use crate::error::{DfmError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Blob store protocol for adapter output materialization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BlobProtocol {
    /// Local directory.
    File,
    /// In-process map. Test and single-node use.
    Memory,
}

/// fsspec-style description of where a provider materializes large values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FsspecConf {
    pub protocol: BlobProtocol,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_path: Option<PathBuf>,
}

/// Binding of one api class to an adapter implementation plus its static
/// configuration. Adapter-specific fields ride along untyped and are
/// validated by the adapter's own config schema at executor startup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdapterBinding {
    pub adapter_class: String,
    #[serde(flatten)]
    pub config: serde_json::Map<String, serde_json::Value>,
}

impl AdapterBinding {
    pub fn new(adapter_class: impl Into<String>) -> Self {
        Self {
            adapter_class: adapter_class.into(),
            config: serde_json::Map::new(),
        }
    }

    /// The adapter-specific fields as a JSON object.
    pub fn config_value(&self) -> serde_json::Value {
        serde_json::Value::Object(self.config.clone())
    }
}

/// One provider namespace: a named grouping of adapters with shared defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProviderConfig {
    #[serde(default)]
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_fsspec_conf: Option<FsspecConf>,
    /// api_class -> adapter binding.
    pub interface: BTreeMap<String, AdapterBinding>,
}

/// The site configuration shared by the ingress and the executor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SiteConfig {
    pub site: String,
    pub providers: BTreeMap<String, ProviderConfig>,
}

impl SiteConfig {
    /// Parse from YAML text.
    pub fn from_yaml(text: &str) -> Result<Self> {
        serde_yml::from_str(text)
            .map_err(|e| DfmError::Config(format!("invalid site configuration: {e}")))
    }

    /// Load from a YAML file.
    pub fn from_path(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            DfmError::Config(format!(
                "cannot read site configuration '{}': {e}",
                path.display()
            ))
        })?;
        Self::from_yaml(&text)
    }

    pub fn provider(&self, name: &str) -> Option<&ProviderConfig> {
        self.providers.get(name)
    }

    /// Whether `provider` offers `api_class`.
    pub fn offers(&self, provider: &str, api_class: &str) -> bool {
        self.providers
            .get(provider)
            .is_some_and(|p| p.interface.contains_key(api_class))
    }
}

/// Log output format, selected via `DFM_LOG_FORMAT`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Plain,
    Json,
}

impl std::str::FromStr for LogFormat {
    type Err = DfmError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "plain" => Ok(LogFormat::Plain),
            "json" => Ok(LogFormat::Json),
            other => Err(DfmError::Config(format!(
                "DFM_LOG_FORMAT must be 'plain' or 'json', got '{other}'"
            ))),
        }
    }
}

pub const DEFAULT_BROKER_URL: &str = "redis://127.0.0.1:6379";
pub const DEFAULT_BIND_ADDR: &str = "0.0.0.0:8080";
pub const DEFAULT_REQUEST_TTL: Duration = Duration::from_secs(24 * 60 * 60);
pub const DEFAULT_CACHE_BUDGET_BYTES: u64 = 1024 * 1024 * 1024;

/// Process-environment knobs shared by the three services.
#[derive(Debug, Clone)]
pub struct EnvConfig {
    /// Broker endpoint, e.g. `redis://127.0.0.1:6379`.
    pub broker_url: String,
    /// Broker database index.
    pub broker_db: Option<i64>,
    /// HTTP bind address (ingress only).
    pub bind_addr: String,
    /// Executor worker count.
    pub workers: usize,
    pub log_format: LogFormat,
    pub otlp_endpoint: Option<String>,
    /// Bearer token required on the HTTP surface. Unset means open access.
    pub auth_token: Option<String>,
    /// How long request records outlive their last refresh.
    pub request_ttl: Duration,
    /// Cache eviction byte budget.
    pub cache_budget_bytes: u64,
}

impl EnvConfig {
    /// Read configuration from `DFM_*` environment variables, applying
    /// defaults for everything unset.
    pub fn from_env() -> Result<Self> {
        let get = |name: &str| std::env::var(name).ok().filter(|v| !v.is_empty());

        let broker_db = match get("DFM_BROKER_DB") {
            Some(raw) => Some(raw.parse::<i64>().map_err(|e| {
                DfmError::Config(format!("DFM_BROKER_DB must be an integer: {e}"))
            })?),
            None => None,
        };

        let workers = match get("DFM_WORKERS") {
            Some(raw) => raw
                .parse::<usize>()
                .ok()
                .filter(|w| *w > 0)
                .ok_or_else(|| {
                    DfmError::Config("DFM_WORKERS must be a positive integer".to_string())
                })?,
            None => std::thread::available_parallelism()
                .map(usize::from)
                .unwrap_or(4),
        };

        let log_format = match get("DFM_LOG_FORMAT") {
            Some(raw) => raw.parse()?,
            None => LogFormat::default(),
        };

        let request_ttl = match get("DFM_REQUEST_TTL_SECS") {
            Some(raw) => Duration::from_secs(raw.parse::<u64>().map_err(|e| {
                DfmError::Config(format!("DFM_REQUEST_TTL_SECS must be an integer: {e}"))
            })?),
            None => DEFAULT_REQUEST_TTL,
        };

        let cache_budget_bytes = match get("DFM_CACHE_BUDGET_BYTES") {
            Some(raw) => raw.parse::<u64>().map_err(|e| {
                DfmError::Config(format!("DFM_CACHE_BUDGET_BYTES must be an integer: {e}"))
            })?,
            None => DEFAULT_CACHE_BUDGET_BYTES,
        };

        Ok(Self {
            broker_url: get("DFM_BROKER_URL").unwrap_or_else(|| DEFAULT_BROKER_URL.to_string()),
            broker_db,
            bind_addr: get("DFM_BIND_ADDR").unwrap_or_else(|| DEFAULT_BIND_ADDR.to_string()),
            workers,
            log_format,
            otlp_endpoint: get("DFM_OTLP_ENDPOINT"),
            auth_token: get("DFM_AUTH_TOKEN"),
            request_ttl,
            cache_budget_bytes,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SITE_YAML: &str = r#"
site: earth2-demo
providers:
  dfm:
    description: Built-in function set
    cache_fsspec_conf:
      protocol: file
      base_path: /var/lib/dfm/cache
    interface:
      dfm.api.Constant:
        adapter_class: ConstantAdapter
      dfm.api.data_loader.LoadEra5ModelData:
        adapter_class: Era5Adapter
        archive_root: /data/era5
        timeout_secs: 120
"#;

    // ==========================================================================
    // Unit Tests - Site YAML
    // ==========================================================================

    #[test]
    fn test_parse_site_yaml() {
        let site = SiteConfig::from_yaml(SITE_YAML).unwrap();
        assert_eq!(site.site, "earth2-demo");
        let provider = site.provider("dfm").unwrap();
        assert_eq!(provider.description, "Built-in function set");
        assert_eq!(
            provider.cache_fsspec_conf.as_ref().unwrap().protocol,
            BlobProtocol::File
        );
        assert_eq!(provider.interface.len(), 2);
    }

    #[test]
    fn test_adapter_binding_carries_extra_fields() {
        let site = SiteConfig::from_yaml(SITE_YAML).unwrap();
        let binding = &site.provider("dfm").unwrap().interface
            ["dfm.api.data_loader.LoadEra5ModelData"];
        assert_eq!(binding.adapter_class, "Era5Adapter");
        let config = binding.config_value();
        assert_eq!(config["archive_root"], "/data/era5");
        assert_eq!(config["timeout_secs"], 120);
    }

    #[test]
    fn test_unknown_top_level_key_rejected() {
        let yaml = "site: s\nproviders: {}\nbogus: 1\n";
        let err = SiteConfig::from_yaml(yaml).unwrap_err();
        assert!(matches!(err, DfmError::Config(_)));
    }

    #[test]
    fn test_unknown_provider_key_rejected() {
        let yaml = r#"
site: s
providers:
  dfm:
    interface: {}
    surprise: true
"#;
        assert!(SiteConfig::from_yaml(yaml).is_err());
    }

    #[test]
    fn test_offers() {
        let site = SiteConfig::from_yaml(SITE_YAML).unwrap();
        assert!(site.offers("dfm", "dfm.api.Constant"));
        assert!(!site.offers("dfm", "dfm.api.GreetMe"));
        assert!(!site.offers("nope", "dfm.api.Constant"));
    }

    #[test]
    fn test_memory_protocol() {
        let yaml = r#"
site: s
providers:
  test:
    cache_fsspec_conf:
      protocol: memory
    interface: {}
"#;
        let site = SiteConfig::from_yaml(yaml).unwrap();
        let conf = site.provider("test").unwrap().cache_fsspec_conf.clone();
        assert_eq!(conf.unwrap().protocol, BlobProtocol::Memory);
    }

    // ==========================================================================
    // Unit Tests - Log Format
    // ==========================================================================

    #[test]
    fn test_log_format_parse() {
        assert_eq!("plain".parse::<LogFormat>().unwrap(), LogFormat::Plain);
        assert_eq!("JSON".parse::<LogFormat>().unwrap(), LogFormat::Json);
        assert!("xml".parse::<LogFormat>().is_err());
    }
}
