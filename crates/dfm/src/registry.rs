//! The closed, versioned api-class registry.
//!
//! Every node names an `api_class`; the registry binds that tag to a
//! parameter schema, an arity, and a human-readable description. Adding an
//! api class means adding a tag + schema + arity here (or registering one
//! programmatically for a custom site). No runtime type introspection is
//! involved: validation happens against the JSON Schema derived from the
//! parameter struct.

use crate::error::{DfmError, Result};
use schemars::{schema_for, JsonSchema};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Well-known api-class tags of the built-in `dfm` function set.
pub mod api {
    pub const CONSTANT: &str = "dfm.api.Constant";
    pub const GREET_ME: &str = "dfm.api.GreetMe";
    pub const SIGNAL_CLIENT: &str = "dfm.api.SignalClient";
    pub const DELAY: &str = "dfm.api.Delay";
    pub const SLOW_CONSTANT: &str = "dfm.api.SlowConstant";
    pub const LOAD_ERA5: &str = "dfm.api.data_loader.LoadEra5ModelData";
    pub const CONVERT_TO_IMAGE: &str = "dfm.api.xarray.ConvertToImage";
    pub const EVAL_EXPR: &str = "dfm.api.EvalExpr";
    pub const MERGE: &str = "dfm.api.Merge";
}

/// How many upstream streams a node consumes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Arity {
    /// No upstream values.
    Nullary,
    /// Exactly one upstream stream.
    Unary,
    /// One or more ordered upstream streams.
    Variadic,
}

impl Arity {
    /// Whether a declared number of input edges satisfies this arity.
    pub fn accepts(&self, n_inputs: usize) -> bool {
        match self {
            Arity::Nullary => n_inputs == 0,
            Arity::Unary => n_inputs == 1,
            Arity::Variadic => n_inputs >= 1,
        }
    }
}

// ============================================================================
// Built-in parameter records
// ============================================================================

/// Params for `dfm.api.Constant`: the pure-constant function.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct ConstantParams {
    pub value: Value,
}

/// Params for `dfm.api.GreetMe`.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct GreetMeParams {
    pub name: String,
}

/// Params for `dfm.api.SignalClient`: writes `message` straight to the
/// client response queue, typically ordered behind other nodes via `after`.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct SignalClientParams {
    pub message: String,
}

/// Params for `dfm.api.Delay`: reschedules itself `seconds` into the future
/// on first activation, yields `value` on the second.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct DelayParams {
    pub seconds: f64,
    pub value: Value,
}

/// Params for `dfm.api.SlowConstant`: sleeps cooperatively, then yields.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct SlowConstantParams {
    pub value: Value,
    pub delay_seconds: f64,
}

/// Params for `dfm.api.data_loader.LoadEra5ModelData`.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct LoadEra5Params {
    /// ISO-8601 timestamp of the archive slice.
    pub time: String,
    /// Variable short names, e.g. `t2m`, `u10`.
    pub variables: Vec<String>,
}

/// Output format of `dfm.api.xarray.ConvertToImage`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum ImageFormat {
    Png,
    Jpeg,
}

/// Params for `dfm.api.xarray.ConvertToImage`.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct ConvertToImageParams {
    pub format: ImageFormat,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub colormap: Option<String>,
}

/// Params for `dfm.api.EvalExpr`: evaluates `expression` once per upstream
/// value, with the variable `x` bound to that value.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct EvalExprParams {
    pub expression: String,
}

/// Params for `dfm.api.Merge` (none).
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct MergeParams {}

// ============================================================================
// Registry
// ============================================================================

/// Descriptor of one api class: tag, arity, and parameter schema.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiDescriptor {
    pub api_class: String,
    pub description: String,
    pub arity: Arity,
    /// JSON Schema for the node's `params` record.
    pub params_schema: Value,
}

impl ApiDescriptor {
    /// Build a descriptor from a parameter struct's derived schema.
    pub fn new<P: JsonSchema>(
        api_class: impl Into<String>,
        description: impl Into<String>,
        arity: Arity,
    ) -> Self {
        let schema = schema_for!(P);
        let params_schema = serde_json::to_value(schema)
            .unwrap_or_else(|_| serde_json::json!({"type": "object"}));
        Self {
            api_class: api_class.into(),
            description: description.into(),
            arity,
            params_schema,
        }
    }
}

/// The closed registry of api classes known to a site.
pub struct ApiRegistry {
    descriptors: BTreeMap<String, ApiDescriptor>,
    validators: BTreeMap<String, jsonschema::Validator>,
}

impl std::fmt::Debug for ApiRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiRegistry")
            .field("api_classes", &self.descriptors.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl ApiRegistry {
    /// An empty registry. Sites with custom function sets start here.
    pub fn empty() -> Self {
        Self {
            descriptors: BTreeMap::new(),
            validators: BTreeMap::new(),
        }
    }

    /// The built-in `dfm` function set.
    pub fn builtin() -> Self {
        let mut registry = Self::empty();
        let built_ins = [
            ApiDescriptor::new::<ConstantParams>(
                api::CONSTANT,
                "Yield a single literal value",
                Arity::Nullary,
            ),
            ApiDescriptor::new::<GreetMeParams>(
                api::GREET_ME,
                "Yield a greeting for the given name",
                Arity::Nullary,
            ),
            ApiDescriptor::new::<SignalClientParams>(
                api::SIGNAL_CLIENT,
                "Write a message to the client response queue",
                Arity::Nullary,
            ),
            ApiDescriptor::new::<DelayParams>(
                api::DELAY,
                "Yield a value after a scheduled delay",
                Arity::Nullary,
            ),
            ApiDescriptor::new::<SlowConstantParams>(
                api::SLOW_CONSTANT,
                "Yield a value after sleeping in place",
                Arity::Nullary,
            ),
            ApiDescriptor::new::<LoadEra5Params>(
                api::LOAD_ERA5,
                "Load an ERA5 archive slice, one datum per variable",
                Arity::Nullary,
            ),
            ApiDescriptor::new::<ConvertToImageParams>(
                api::CONVERT_TO_IMAGE,
                "Render each upstream datum to an image artifact",
                Arity::Unary,
            ),
            ApiDescriptor::new::<EvalExprParams>(
                api::EVAL_EXPR,
                "Evaluate an arithmetic expression per upstream value",
                Arity::Unary,
            ),
            ApiDescriptor::new::<MergeParams>(
                api::MERGE,
                "Concatenate closed upstream streams in port order",
                Arity::Variadic,
            ),
        ];
        for descriptor in built_ins {
            // Built-in schemas are well-formed.
            let _ = registry.register(descriptor);
        }
        registry
    }

    /// Register an api class, compiling its schema validator.
    pub fn register(&mut self, descriptor: ApiDescriptor) -> Result<()> {
        let validator = jsonschema::validator_for(&descriptor.params_schema).map_err(|e| {
            DfmError::Config(format!(
                "invalid params schema for api class '{}': {e}",
                descriptor.api_class
            ))
        })?;
        self.validators
            .insert(descriptor.api_class.clone(), validator);
        self.descriptors
            .insert(descriptor.api_class.clone(), descriptor);
        Ok(())
    }

    pub fn get(&self, api_class: &str) -> Option<&ApiDescriptor> {
        self.descriptors.get(api_class)
    }

    pub fn contains(&self, api_class: &str) -> bool {
        self.descriptors.contains_key(api_class)
    }

    /// Registered api-class tags in sorted order.
    pub fn api_classes(&self) -> impl Iterator<Item = &str> {
        self.descriptors.keys().map(String::as_str)
    }

    /// Validate a node's `params` record against its api-class schema.
    pub fn validate_params(&self, api_class: &str, params: &Value) -> Result<()> {
        let validator = self.validators.get(api_class).ok_or_else(|| {
            DfmError::BadPipeline(format!("unknown api class '{api_class}'"))
        })?;
        validator.validate(params).map_err(|e| {
            DfmError::BadPipeline(format!(
                "invalid params for api class '{api_class}': {e}"
            ))
        })
    }
}

impl Default for ApiRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}
