//! Stream transforms: per-value expression evaluation and stream merging.

use crate::adapter::{Adapter, AdapterContext, ValueStream};
use dfm::error::{DfmError, Result};
use dfm::registry::{Arity, EvalExprParams};
use serde_json::{Number, Value};
use std::collections::BTreeMap;
use std::sync::Arc;

/// `dfm.api.EvalExpr`: evaluates an arithmetic expression once per upstream
/// value, with `x` bound to that value. Integral results stay integers.
#[derive(Debug, Default)]
pub struct EvalExprAdapter;

impl EvalExprAdapter {
    pub fn from_config(_config: &Value) -> Result<Self> {
        Ok(Self)
    }
}

fn eval(expression: &str, x: f64) -> Result<Value> {
    let mut vars: BTreeMap<String, f64> = BTreeMap::new();
    vars.insert("x".to_string(), x);
    let y = fasteval2::ez_eval(expression, &mut vars).map_err(|e| {
        DfmError::AdapterBadInput(format!("cannot evaluate '{expression}': {e}"))
    })?;

    if !y.is_finite() {
        return Err(DfmError::AdapterBadInput(format!(
            "expression '{expression}' produced a non-finite result for x = {x}"
        )));
    }
    if y.fract() == 0.0 && y.abs() < (i64::MAX as f64) {
        return Ok(Value::Number(Number::from(y as i64)));
    }
    Number::from_f64(y)
        .map(Value::Number)
        .ok_or_else(|| DfmError::Internal(format!("unrepresentable result {y}")))
}

#[async_trait::async_trait]
impl Adapter for EvalExprAdapter {
    fn arity(&self) -> Arity {
        Arity::Unary
    }

    async fn body(&self, ctx: Arc<AdapterContext>) -> Result<ValueStream> {
        let params: EvalExprParams = ctx.params_as()?;
        let mut input = ctx.take_input()?;

        Ok(Box::pin(async_stream::stream! {
            use futures::StreamExt;
            while let Some(item) = input.next().await {
                match item {
                    Ok(value) => {
                        let Some(x) = value.as_f64() else {
                            yield Err(DfmError::AdapterBadInput(format!(
                                "EvalExpr expects numeric upstream values, got {value}"
                            )));
                            break;
                        };
                        match eval(&params.expression, x) {
                            Ok(result) => yield Ok(result),
                            Err(e) => {
                                yield Err(e);
                                break;
                            }
                        }
                    }
                    Err(e) => {
                        yield Err(e);
                        break;
                    }
                }
            }
        }))
    }
}

/// `dfm.api.Merge`: concatenates its closed upstream streams in port order.
#[derive(Debug, Default)]
pub struct MergeAdapter;

impl MergeAdapter {
    pub fn from_config(_config: &Value) -> Result<Self> {
        Ok(Self)
    }
}

#[async_trait::async_trait]
impl Adapter for MergeAdapter {
    fn arity(&self) -> Arity {
        Arity::Variadic
    }

    async fn body(&self, ctx: Arc<AdapterContext>) -> Result<ValueStream> {
        let inputs = ctx.take_inputs();
        Ok(Box::pin(async_stream::stream! {
            use futures::StreamExt;
            for mut input in inputs {
                while let Some(item) = input.next().await {
                    match item {
                        Ok(value) => yield Ok(value),
                        Err(e) => {
                            yield Err(e);
                            return;
                        }
                    }
                }
            }
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::ProviderRuntime;
    use crate::streams::replay_stream;
    use dfm_broker::{store::request_store, MemoryBroker};
    use dfm_cache::InMemoryBlobStore;
    use futures::StreamExt;
    use serde_json::json;

    fn context(params: Value, upstreams: Vec<Vec<Value>>) -> Arc<AdapterContext> {
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
            upstreams.into_iter().map(replay_stream).collect(),
            None,
        ))
    }

    // ==========================================================================
    // Unit Tests - EvalExpr
    // ==========================================================================

    #[tokio::test]
    async fn test_eval_squares_stream_in_order() {
        let ctx = context(
            json!({"expression": "x * x"}),
            vec![vec![json!(1), json!(2), json!(3), json!(4), json!(5)]],
        );
        let values: Vec<Value> = EvalExprAdapter
            .body(ctx)
            .await
            .unwrap()
            .map(|item| item.unwrap())
            .collect()
            .await;
        assert_eq!(
            values,
            vec![json!(1), json!(4), json!(9), json!(16), json!(25)]
        );
    }

    #[tokio::test]
    async fn test_eval_fractional_results_stay_floats() {
        let ctx = context(json!({"expression": "x / 2"}), vec![vec![json!(3)]]);
        let values: Vec<Value> = EvalExprAdapter
            .body(ctx)
            .await
            .unwrap()
            .map(|item| item.unwrap())
            .collect()
            .await;
        assert_eq!(values, vec![json!(1.5)]);
    }

    #[tokio::test]
    async fn test_eval_non_numeric_upstream_fails() {
        let ctx = context(json!({"expression": "x"}), vec![vec![json!("nope")]]);
        let mut stream = EvalExprAdapter.body(ctx).await.unwrap();
        let err = stream.next().await.unwrap().unwrap_err();
        assert!(matches!(err, DfmError::AdapterBadInput(_)));
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn test_eval_bad_expression_fails() {
        let ctx = context(json!({"expression": "x +* 2"}), vec![vec![json!(1)]]);
        let mut stream = EvalExprAdapter.body(ctx).await.unwrap();
        assert!(stream.next().await.unwrap().is_err());
    }

    #[tokio::test]
    async fn test_eval_division_by_zero_is_bad_input() {
        let ctx = context(json!({"expression": "1 / x"}), vec![vec![json!(0)]]);
        let mut stream = EvalExprAdapter.body(ctx).await.unwrap();
        let err = stream.next().await.unwrap().unwrap_err();
        assert!(matches!(err, DfmError::AdapterBadInput(_)));
    }

    // ==========================================================================
    // Unit Tests - Merge
    // ==========================================================================

    #[tokio::test]
    async fn test_merge_concatenates_in_port_order() {
        let ctx = context(
            json!({}),
            vec![
                vec![json!(1), json!(2)],
                vec![json!("a")],
                vec![json!(3)],
            ],
        );
        let values: Vec<Value> = MergeAdapter
            .body(ctx)
            .await
            .unwrap()
            .map(|item| item.unwrap())
            .collect()
            .await;
        assert_eq!(values, vec![json!(1), json!(2), json!("a"), json!(3)]);
    }

    #[tokio::test]
    async fn test_merge_empty_streams() {
        let ctx = context(json!({}), vec![vec![], vec![json!(9)]]);
        let values: Vec<Value> = MergeAdapter
            .body(ctx)
            .await
            .unwrap()
            .map(|item| item.unwrap())
            .collect()
            .await;
        assert_eq!(values, vec![json!(9)]);
    }
}
