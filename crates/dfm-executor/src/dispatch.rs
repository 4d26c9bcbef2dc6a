//! Adapter dispatch: `(provider, api_class) -> adapter` resolution.
//!
//! The dispatch table is built once at startup from the site YAML and held
//! immutable. Unknown adapter classes, unregistered api classes, and arity
//! mismatches between an adapter and its api class are startup errors, so a
//! misconfigured site never reaches the work queue.

use crate::adapter::{Adapter, ProviderRuntime};
use crate::adapters::{
    ConstantAdapter, ConvertToImageAdapter, DelayAdapter, Era5Adapter, EvalExprAdapter,
    GreetMeAdapter, MergeAdapter, SignalClientAdapter, SlowConstantAdapter,
};
use dfm::config::{AdapterBinding, ProviderConfig, SiteConfig};
use dfm::error::{DfmError, Result};
use dfm::registry::{api, ApiRegistry};
use dfm_cache::{blob_store_for, InMemoryBlobStore};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::info;

/// Adapter class names accepted in site YAML `adapter_class` fields.
pub mod adapter_classes {
    pub const CONSTANT: &str = "ConstantAdapter";
    pub const GREET_ME: &str = "GreetMeAdapter";
    pub const SIGNAL_CLIENT: &str = "SignalClientAdapter";
    pub const DELAY: &str = "DelayAdapter";
    pub const SLOW_CONSTANT: &str = "SlowConstantAdapter";
    pub const ERA5: &str = "Era5Adapter";
    pub const CONVERT_TO_IMAGE: &str = "ConvertToImageAdapter";
    pub const EVAL_EXPR: &str = "EvalExprAdapter";
    pub const MERGE: &str = "MergeAdapter";
}

fn build_builtin(adapter_class: &str, config: &Value) -> Result<Arc<dyn Adapter>> {
    use adapter_classes::*;
    Ok(match adapter_class {
        CONSTANT => Arc::new(ConstantAdapter::from_config(config)?),
        GREET_ME => Arc::new(GreetMeAdapter::from_config(config)?),
        SIGNAL_CLIENT => Arc::new(SignalClientAdapter::from_config(config)?),
        DELAY => Arc::new(DelayAdapter::from_config(config)?),
        SLOW_CONSTANT => Arc::new(SlowConstantAdapter::from_config(config)?),
        ERA5 => Arc::new(Era5Adapter::from_config(config)?),
        CONVERT_TO_IMAGE => Arc::new(ConvertToImageAdapter::from_config(config)?),
        EVAL_EXPR => Arc::new(EvalExprAdapter::from_config(config)?),
        MERGE => Arc::new(MergeAdapter::from_config(config)?),
        other => {
            return Err(DfmError::Config(format!(
                "unknown adapter class '{other}'"
            )))
        }
    })
}

/// The immutable dispatch table of one executor.
pub struct AdapterRegistry {
    adapters: HashMap<(String, String), Arc<dyn Adapter>>,
    providers: HashMap<String, ProviderRuntime>,
}

impl AdapterRegistry {
    /// Build the table from the site configuration.
    pub fn from_site(site: &SiteConfig, registry: &ApiRegistry) -> Result<Self> {
        let mut adapters = HashMap::new();
        let mut providers = HashMap::new();

        for (provider_name, provider) in &site.providers {
            let blobs = blob_store_for(provider.cache_fsspec_conf.as_ref())?;
            providers.insert(
                provider_name.clone(),
                ProviderRuntime {
                    name: provider_name.clone(),
                    description: provider.description.clone(),
                    blobs,
                },
            );

            for (api_class, binding) in &provider.interface {
                let descriptor = registry.get(api_class).ok_or_else(|| {
                    DfmError::Config(format!(
                        "provider '{provider_name}' binds unregistered api class '{api_class}'"
                    ))
                })?;

                let adapter = build_builtin(&binding.adapter_class, &binding.config_value())?;

                if adapter.arity() != descriptor.arity {
                    return Err(DfmError::Config(format!(
                        "adapter '{}' is {:?} but api class '{api_class}' is {:?}",
                        binding.adapter_class,
                        adapter.arity(),
                        descriptor.arity
                    )));
                }

                adapters.insert((provider_name.clone(), api_class.clone()), adapter);
            }
        }

        info!(
            "dispatch table built: {} providers, {} bindings",
            providers.len(),
            adapters.len()
        );

        Ok(Self {
            adapters,
            providers,
        })
    }

    /// Register an adapter programmatically. Creates the provider runtime
    /// (in-memory blob store) when it does not exist yet; test harnesses use
    /// this to wire counting and failing adapters.
    pub fn register(
        &mut self,
        provider: impl Into<String>,
        api_class: impl Into<String>,
        adapter: Arc<dyn Adapter>,
    ) {
        let provider = provider.into();
        self.providers
            .entry(provider.clone())
            .or_insert_with(|| ProviderRuntime {
                name: provider.clone(),
                description: String::new(),
                blobs: Arc::new(InMemoryBlobStore::new()),
            });
        self.adapters.insert((provider, api_class.into()), adapter);
    }

    pub fn resolve(&self, provider: &str, api_class: &str) -> Option<Arc<dyn Adapter>> {
        self.adapters
            .get(&(provider.to_string(), api_class.to_string()))
            .cloned()
    }

    pub fn provider(&self, name: &str) -> Option<&ProviderRuntime> {
        self.providers.get(name)
    }

    /// The configured provider runtimes.
    pub fn providers(&self) -> impl Iterator<Item = &ProviderRuntime> {
        self.providers.values()
    }
}

/// A site configuration binding the complete built-in function set under the
/// default `dfm` provider. Service binaries fall back to this when no site
/// YAML is given; tests extend it.
pub fn builtin_site(site_name: impl Into<String>) -> SiteConfig {
    let bindings = [
        (api::CONSTANT, adapter_classes::CONSTANT),
        (api::GREET_ME, adapter_classes::GREET_ME),
        (api::SIGNAL_CLIENT, adapter_classes::SIGNAL_CLIENT),
        (api::DELAY, adapter_classes::DELAY),
        (api::SLOW_CONSTANT, adapter_classes::SLOW_CONSTANT),
        (api::LOAD_ERA5, adapter_classes::ERA5),
        (api::CONVERT_TO_IMAGE, adapter_classes::CONVERT_TO_IMAGE),
        (api::EVAL_EXPR, adapter_classes::EVAL_EXPR),
        (api::MERGE, adapter_classes::MERGE),
    ];

    let interface: BTreeMap<String, AdapterBinding> = bindings
        .into_iter()
        .map(|(api_class, adapter_class)| {
            (api_class.to_string(), AdapterBinding::new(adapter_class))
        })
        .collect();

    SiteConfig {
        site: site_name.into(),
        providers: [(
            "dfm".to_string(),
            ProviderConfig {
                description: "Built-in DFM function set".to_string(),
                cache_fsspec_conf: None,
                interface,
            },
        )]
        .into_iter()
        .collect(),
    }
}
