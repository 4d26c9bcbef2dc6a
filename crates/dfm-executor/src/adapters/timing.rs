//! Time-shaped adapters: scheduled delays and in-place sleeps.

use crate::adapter::{Adapter, AdapterContext, ValueStream};
use dfm::error::Result;
use dfm::registry::{Arity, DelayParams, SlowConstantParams};
use futures::StreamExt;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

/// `dfm.api.Delay`: releases its worker for the wait.
///
/// First activation parks the node on the delayed queue via
/// `schedule_after` and yields nothing; the scheduler re-enqueues it when
/// due, and the second activation (recognized by the continuation) yields
/// the configured value.
#[derive(Debug, Default)]
pub struct DelayAdapter;

impl DelayAdapter {
    pub fn from_config(_config: &Value) -> Result<Self> {
        Ok(Self)
    }
}

#[async_trait::async_trait]
impl Adapter for DelayAdapter {
    fn arity(&self) -> Arity {
        Arity::Nullary
    }

    async fn body(&self, ctx: Arc<AdapterContext>) -> Result<ValueStream> {
        let params: DelayParams = ctx.params_as()?;

        if ctx.continuation().is_none() {
            ctx.set_continuation(json!({"fired": true}));
            ctx.schedule_after(Duration::from_secs_f64(params.seconds.max(0.0)))
                .await?;
            return Ok(futures::stream::empty().boxed());
        }

        Ok(futures::stream::once(async move { Ok(params.value) }).boxed())
    }
}

/// `dfm.api.SlowConstant`: sleeps in place, holding its worker.
///
/// The sleep is a cooperative await point, so cancellation and the soft
/// timeout interrupt it.
#[derive(Debug, Default)]
pub struct SlowConstantAdapter;

impl SlowConstantAdapter {
    pub fn from_config(_config: &Value) -> Result<Self> {
        Ok(Self)
    }
}

#[async_trait::async_trait]
impl Adapter for SlowConstantAdapter {
    fn arity(&self) -> Arity {
        Arity::Nullary
    }

    async fn body(&self, ctx: Arc<AdapterContext>) -> Result<ValueStream> {
        let params: SlowConstantParams = ctx.params_as()?;
        Ok(Box::pin(async_stream::stream! {
            tokio::time::sleep(Duration::from_secs_f64(params.delay_seconds.max(0.0))).await;
            yield Ok(params.value);
        }))
    }
}
