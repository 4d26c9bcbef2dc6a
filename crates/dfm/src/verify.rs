//! Pipeline verification.
//!
//! Runs synchronously inside `process` before a request id is minted. A
//! pipeline is rejected if it contains a cycle, references an unknown node,
//! names an api class the site does not register or its provider does not
//! offer, carries a schema-invalid param record, or wires a number of inputs
//! the api class's arity does not accept.

use crate::config::SiteConfig;
use crate::error::{DfmError, Result};
use crate::pipeline::Pipeline;
use crate::registry::ApiRegistry;

/// Verify a freshly submitted pipeline against the site's registry and
/// provider table.
pub fn verify_pipeline(
    pipeline: &Pipeline,
    registry: &ApiRegistry,
    site: &SiteConfig,
) -> Result<()> {
    pipeline.validate_edges()?;
    pipeline.topo_order()?;

    for node in &pipeline.nodes {
        let descriptor = registry.get(&node.api_class).ok_or_else(|| {
            DfmError::BadPipeline(format!(
                "node '{}': api class '{}' is not registered at this site",
                node.node_id, node.api_class
            ))
        })?;

        if !site.offers(&node.provider, &node.api_class) {
            return Err(DfmError::BadPipeline(format!(
                "node '{}': provider '{}' does not offer api class '{}'",
                node.node_id, node.provider, node.api_class
            )));
        }

        registry
            .validate_params(&node.api_class, &node.params)
            .map_err(|e| {
                DfmError::BadPipeline(format!("node '{}': {e}", node.node_id))
            })?;

        if !descriptor.arity.accepts(node.inputs.len()) {
            return Err(DfmError::BadPipeline(format!(
                "node '{}': api class '{}' is {:?} but {} input(s) are wired",
                node.node_id,
                node.api_class,
                descriptor.arity,
                node.inputs.len()
            )));
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::Node;
    use crate::registry::api;
    use serde_json::json;

    fn test_site() -> SiteConfig {
        let interface = [
            api::CONSTANT,
            api::GREET_ME,
            api::SIGNAL_CLIENT,
            api::EVAL_EXPR,
            api::MERGE,
        ]
        .iter()
        .map(|class| {
            (
                class.to_string(),
                crate::config::AdapterBinding::new(format!("{class}Adapter")),
            )
        })
        .collect();

        SiteConfig {
            site: "test".to_string(),
            providers: [(
                "dfm".to_string(),
                crate::config::ProviderConfig {
                    description: String::new(),
                    cache_fsspec_conf: None,
                    interface,
                },
            )]
            .into_iter()
            .collect(),
        }
    }

    fn verify(pipeline: &Pipeline) -> Result<()> {
        verify_pipeline(pipeline, &ApiRegistry::builtin(), &test_site())
    }

    #[test]
    fn test_accepts_valid_pipeline() {
        let p = Pipeline::new(vec![
            Node::new("c", api::CONSTANT)
                .with_params(json!({"value": 42}))
                .output(),
            Node::new("sq", api::EVAL_EXPR)
                .with_params(json!({"expression": "x * x"}))
                .with_inputs(["c"]),
            Node::new("done", api::SIGNAL_CLIENT)
                .with_params(json!({"message": "ok"}))
                .with_after(["sq"]),
        ]);
        assert!(verify(&p).is_ok());
    }

    #[test]
    fn test_rejects_cycle() {
        let p = Pipeline::new(vec![
            Node::new("a", api::EVAL_EXPR)
                .with_params(json!({"expression": "x"}))
                .with_inputs(["b"]),
            Node::new("b", api::EVAL_EXPR)
                .with_params(json!({"expression": "x"}))
                .with_inputs(["a"]),
        ]);
        let err = verify(&p).unwrap_err();
        assert!(err.to_string().contains("cycle"));
    }

    #[test]
    fn test_rejects_unknown_edge() {
        let p = Pipeline::new(vec![Node::new("a", api::EVAL_EXPR)
            .with_params(json!({"expression": "x"}))
            .with_inputs(["ghost"])]);
        assert!(verify(&p).is_err());
    }

    #[test]
    fn test_rejects_unregistered_api_class() {
        let p = Pipeline::new(vec![Node::new("a", "dfm.api.DoesNotExist")]);
        let err = verify(&p).unwrap_err();
        assert!(err.to_string().contains("not registered"));
    }

    #[test]
    fn test_rejects_provider_not_offering() {
        // Delay is registered but the test site's dfm provider does not bind it.
        let p = Pipeline::new(vec![
            Node::new("d", api::DELAY).with_params(json!({"seconds": 1, "value": null}))
        ]);
        let err = verify(&p).unwrap_err();
        assert!(err.to_string().contains("does not offer"));
    }

    #[test]
    fn test_rejects_unknown_provider() {
        let p = Pipeline::new(vec![Node::new("c", api::CONSTANT)
            .with_params(json!({"value": 1}))
            .with_provider("elsewhere")]);
        assert!(verify(&p).is_err());
    }

    #[test]
    fn test_rejects_schema_invalid_params() {
        let p = Pipeline::new(vec![
            Node::new("g", api::GREET_ME).with_params(json!({"name": 7}))
        ]);
        let err = verify(&p).unwrap_err();
        assert!(err.to_string().contains("invalid params"));
    }

    #[test]
    fn test_rejects_arity_mismatch() {
        // Nullary with an input.
        let p = Pipeline::new(vec![
            Node::new("c", api::CONSTANT).with_params(json!({"value": 1})),
            Node::new("c2", api::CONSTANT)
                .with_params(json!({"value": 2}))
                .with_inputs(["c"]),
        ]);
        assert!(verify(&p).is_err());

        // Unary with two inputs.
        let p = Pipeline::new(vec![
            Node::new("a", api::CONSTANT).with_params(json!({"value": 1})),
            Node::new("b", api::CONSTANT).with_params(json!({"value": 2})),
            Node::new("sq", api::EVAL_EXPR)
                .with_params(json!({"expression": "x"}))
                .with_inputs(["a", "b"]),
        ]);
        assert!(verify(&p).is_err());

        // Variadic with zero inputs.
        let p = Pipeline::new(vec![Node::new("m", api::MERGE)]);
        assert!(verify(&p).is_err());
    }

    #[test]
    fn test_empty_pipeline_is_valid() {
        assert!(verify(&Pipeline::default()).is_ok());
    }
}
