//! The elementary nullary adapters: constants, greetings, and client
//! signals.

use crate::adapter::{Adapter, AdapterContext, ValueStream};
use dfm::error::Result;
use dfm::registry::{Arity, ConstantParams, GreetMeParams, SignalClientParams};
use futures::StreamExt;
use serde_json::{json, Value};
use std::sync::Arc;

/// `dfm.api.Constant`: yields its configured literal once.
#[derive(Debug, Default)]
pub struct ConstantAdapter;

impl ConstantAdapter {
    pub fn from_config(_config: &Value) -> Result<Self> {
        Ok(Self)
    }
}

#[async_trait::async_trait]
impl Adapter for ConstantAdapter {
    fn arity(&self) -> Arity {
        Arity::Nullary
    }

    async fn body(&self, ctx: Arc<AdapterContext>) -> Result<ValueStream> {
        let params: ConstantParams = ctx.params_as()?;
        Ok(futures::stream::once(async move { Ok(params.value) }).boxed())
    }
}

/// `dfm.api.GreetMe`: yields a greeting for the given name.
#[derive(Debug, Default)]
pub struct GreetMeAdapter;

impl GreetMeAdapter {
    pub fn from_config(_config: &Value) -> Result<Self> {
        Ok(Self)
    }
}

#[async_trait::async_trait]
impl Adapter for GreetMeAdapter {
    fn arity(&self) -> Arity {
        Arity::Nullary
    }

    async fn body(&self, ctx: Arc<AdapterContext>) -> Result<ValueStream> {
        let params: GreetMeParams = ctx.params_as()?;
        let greeting = json!(format!("Hello, {}!", params.name));
        Ok(futures::stream::once(async move { Ok(greeting) }).boxed())
    }
}

/// `dfm.api.SignalClient`: writes its message straight to the client
/// response queue and yields nothing. Typically ordered behind other nodes
/// via `after` to tell the client a stage is done.
#[derive(Debug, Default)]
pub struct SignalClientAdapter;

impl SignalClientAdapter {
    pub fn from_config(_config: &Value) -> Result<Self> {
        Ok(Self)
    }
}

#[async_trait::async_trait]
impl Adapter for SignalClientAdapter {
    fn arity(&self) -> Arity {
        Arity::Nullary
    }

    fn cacheable(&self) -> bool {
        false
    }

    async fn body(&self, ctx: Arc<AdapterContext>) -> Result<ValueStream> {
        let params: SignalClientParams = ctx.params_as()?;
        ctx.send_value_response(json!(params.message)).await?;
        Ok(futures::stream::empty().boxed())
    }
}
