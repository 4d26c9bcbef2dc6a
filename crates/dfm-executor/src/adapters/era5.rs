//! ERA5 archive loader.
//!
//! The archive itself is an external collaborator outside this runtime; the
//! adapter materializes a deterministic slice per `(time, variable)` so the
//! interface resolves identically on every site. One datum is yielded per
//! requested variable, in request order.

use crate::adapter::{Adapter, AdapterContext, ValueStream};
use dfm::error::{DfmError, Result};
use dfm::registry::{Arity, LoadEra5Params};
use futures::StreamExt;
use serde::Deserialize;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;

const GRID_POINTS: usize = 16;

/// Static binding config from the site YAML.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Era5Config {
    /// Root of the archive mount. Unused by the synthetic slice generator
    /// but kept in the binding so sites carry their mount point in one place.
    pub archive_root: Option<String>,
    /// Per-node soft timeout override, seconds.
    pub timeout_secs: Option<u64>,
}

/// `dfm.api.data_loader.LoadEra5ModelData`.
#[derive(Debug, Default)]
pub struct Era5Adapter {
    config: Era5Config,
}

impl Era5Adapter {
    pub fn from_config(config: &Value) -> Result<Self> {
        let config: Era5Config = serde_json::from_value(config.clone())
            .map_err(|e| dfm::DfmError::Config(format!("invalid Era5Adapter config: {e}")))?;
        Ok(Self { config })
    }
}

fn parse_time(raw: &str) -> Result<chrono::NaiveDateTime> {
    chrono::NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M")
        .or_else(|_| chrono::NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S"))
        .or_else(|_| {
            chrono::DateTime::parse_from_rfc3339(raw).map(|dt| dt.naive_utc())
        })
        .map_err(|e| DfmError::AdapterBadInput(format!("invalid ERA5 time '{raw}': {e}")))
}

fn units_for(variable: &str) -> &'static str {
    match variable {
        "t2m" | "sst" => "K",
        "u10" | "v10" | "u100" | "v100" => "m s**-1",
        "tp" => "m",
        "msl" | "sp" => "Pa",
        _ => "1",
    }
}

/// Same `(time, variable)` always produces the same slice.
fn synthetic_values(time: &chrono::NaiveDateTime, variable: &str) -> Vec<f64> {
    let mut hasher = Sha256::new();
    hasher.update(time.and_utc().timestamp().to_be_bytes());
    hasher.update(variable.as_bytes());
    let digest = hasher.finalize();

    digest
        .chunks(2)
        .take(GRID_POINTS)
        .map(|pair| {
            let raw = u16::from_be_bytes([pair[0], pair[1]]);
            (f64::from(raw) / f64::from(u16::MAX) * 100.0 * 1000.0).round() / 1000.0
        })
        .collect()
}

#[async_trait::async_trait]
impl Adapter for Era5Adapter {
    fn arity(&self) -> Arity {
        Arity::Nullary
    }

    fn soft_timeout(&self) -> Option<Duration> {
        self.config.timeout_secs.map(Duration::from_secs)
    }

    async fn body(&self, ctx: Arc<AdapterContext>) -> Result<ValueStream> {
        let params: LoadEra5Params = ctx.params_as()?;
        let time = parse_time(&params.time)?;
        if params.variables.is_empty() {
            return Err(DfmError::AdapterBadInput(
                "LoadEra5ModelData needs at least one variable".to_string(),
            ));
        }

        let data: Vec<Value> = params
            .variables
            .iter()
            .map(|variable| {
                json!({
                    "variable": variable,
                    "time": time.format("%Y-%m-%dT%H:%M:%S").to_string(),
                    "units": units_for(variable),
                    "values": synthetic_values(&time, variable),
                })
            })
            .collect();

        Ok(futures::stream::iter(data.into_iter().map(Ok)).boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::ProviderRuntime;
    use dfm_broker::{store::request_store, MemoryBroker};
    use dfm_cache::InMemoryBlobStore;

    fn context(params: Value) -> Arc<AdapterContext> {
        Arc::new(AdapterContext::new(
            "req".into(),
            "n".into(),
            ProviderRuntime {
                name: "dfm".into(),
                description: String::new(),
                blobs: Arc::new(InMemoryBlobStore::new()),
            },
            params,
            request_store(Arc::new(MemoryBroker::new())),
            Vec::new(),
            None,
        ))
    }

    async fn run(params: Value) -> Result<Vec<Value>> {
        let adapter = Era5Adapter::default();
        let stream = adapter.body(context(params)).await?;
        let values: Vec<Value> = stream.map(|item| item.unwrap()).collect().await;
        Ok(values)
    }

    #[tokio::test]
    async fn test_one_datum_per_variable_in_order() {
        let values = run(json!({
            "time": "2024-01-01T00:00",
            "variables": ["t2m", "u10", "v10"]
        }))
        .await
        .unwrap();
        assert_eq!(values.len(), 3);
        assert_eq!(values[0]["variable"], "t2m");
        assert_eq!(values[1]["variable"], "u10");
        assert_eq!(values[2]["variable"], "v10");
        assert_eq!(values[0]["units"], "K");
        assert_eq!(values[0]["values"].as_array().unwrap().len(), GRID_POINTS);
    }

    #[tokio::test]
    async fn test_slices_are_deterministic() {
        let params = json!({"time": "2024-01-01T00:00", "variables": ["t2m"]});
        let a = run(params.clone()).await.unwrap();
        let b = run(params).await.unwrap();
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn test_different_times_differ() {
        let a = run(json!({"time": "2024-01-01T00:00", "variables": ["t2m"]}))
            .await
            .unwrap();
        let b = run(json!({"time": "2024-01-02T00:00", "variables": ["t2m"]}))
            .await
            .unwrap();
        assert_ne!(a[0]["values"], b[0]["values"]);
    }

    #[tokio::test]
    async fn test_accepts_rfc3339_time() {
        let values = run(json!({
            "time": "2024-01-01T06:00:00Z",
            "variables": ["tp"]
        }))
        .await
        .unwrap();
        assert_eq!(values[0]["time"], "2024-01-01T06:00:00");
        assert_eq!(values[0]["units"], "m");
    }

    #[tokio::test]
    async fn test_rejects_bad_time() {
        let err = run(json!({"time": "yesterday", "variables": ["t2m"]}))
            .await
            .unwrap_err();
        assert!(matches!(err, DfmError::AdapterBadInput(_)));
    }

    #[tokio::test]
    async fn test_rejects_empty_variables() {
        let err = run(json!({"time": "2024-01-01T00:00", "variables": []}))
            .await
            .unwrap_err();
        assert!(matches!(err, DfmError::AdapterBadInput(_)));
    }

    #[test]
    fn test_config_timeout_override() {
        let adapter =
            Era5Adapter::from_config(&json!({"archive_root": "/mnt/era5", "timeout_secs": 120}))
                .unwrap();
        assert_eq!(adapter.soft_timeout(), Some(Duration::from_secs(120)));
    }
}
