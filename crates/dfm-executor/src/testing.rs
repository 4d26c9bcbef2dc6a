//! Test adapters for exercising the execution plane.
//!
//! These are real [`Adapter`] implementations registered programmatically by
//! test harnesses: an invocation counter for cache assertions and failure
//! injectors for the retry and cascade paths.

use crate::adapter::{Adapter, AdapterContext, ValueStream};
use dfm::error::{DfmError, Result};
use dfm::registry::Arity;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Counts `body()` invocations of the wrapped adapter.
///
/// A cache hit must not touch the adapter, so the counter is the observable
/// of the cache-singleton property.
pub struct CountingAdapter {
    inner: Arc<dyn Adapter>,
    calls: Arc<AtomicUsize>,
}

impl CountingAdapter {
    pub fn wrap(inner: Arc<dyn Adapter>) -> (Arc<Self>, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        (
            Arc::new(Self {
                inner,
                calls: Arc::clone(&calls),
            }),
            calls,
        )
    }
}

#[async_trait::async_trait]
impl Adapter for CountingAdapter {
    fn arity(&self) -> Arity {
        self.inner.arity()
    }

    fn cacheable(&self) -> bool {
        self.inner.cacheable()
    }

    async fn body(&self, ctx: Arc<AdapterContext>) -> Result<ValueStream> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.inner.body(ctx).await
    }
}

/// Always reports its upstream as unreachable. Exercises the retry budget
/// and the failure cascade.
#[derive(Debug, Default)]
pub struct UnavailableUpstreamAdapter;

#[async_trait::async_trait]
impl Adapter for UnavailableUpstreamAdapter {
    fn arity(&self) -> Arity {
        Arity::Nullary
    }

    async fn body(&self, _ctx: Arc<AdapterContext>) -> Result<ValueStream> {
        Err(DfmError::UpstreamUnavailable(
            "synthetic upstream is down".to_string(),
        ))
    }
}

/// Rejects its inputs immediately. Never retried.
#[derive(Debug, Default)]
pub struct BadInputAdapter;

#[async_trait::async_trait]
impl Adapter for BadInputAdapter {
    fn arity(&self) -> Arity {
        Arity::Nullary
    }

    async fn body(&self, _ctx: Arc<AdapterContext>) -> Result<ValueStream> {
        Err(DfmError::AdapterBadInput(
            "synthetic parameter rejection".to_string(),
        ))
    }
}
