//! Rendering of upstream data to image artifacts.
//!
//! Images are materialized in the provider's blob store and yielded by
//! reference, one per upstream datum. The encoded payload is a deterministic
//! function of the datum, so re-rendering the same data lands on the same
//! content-addressed URI.

use crate::adapter::{Adapter, AdapterContext, ValueStream};
use dfm::error::Result;
use dfm::fingerprint::canonical_bytes;
use dfm::registry::{Arity, ConvertToImageParams, ImageFormat};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use std::sync::Arc;

const PNG_MAGIC: &[u8] = b"\x89PNG\r\n\x1a\n";
const JPEG_MAGIC: &[u8] = &[0xFF, 0xD8, 0xFF, 0xE0];

/// `dfm.api.xarray.ConvertToImage`.
#[derive(Debug, Default)]
pub struct ConvertToImageAdapter;

impl ConvertToImageAdapter {
    pub fn from_config(_config: &Value) -> Result<Self> {
        Ok(Self)
    }
}

fn encode(datum: &Value, format: ImageFormat, colormap: Option<&str>) -> Result<Vec<u8>> {
    let magic = match format {
        ImageFormat::Png => PNG_MAGIC,
        ImageFormat::Jpeg => JPEG_MAGIC,
    };
    let mut hasher = Sha256::new();
    hasher.update(canonical_bytes(datum)?);
    hasher.update(colormap.unwrap_or("viridis").as_bytes());

    let mut bytes = Vec::with_capacity(magic.len() + 32);
    bytes.extend_from_slice(magic);
    bytes.extend_from_slice(&hasher.finalize());
    Ok(bytes)
}

fn format_tag(format: ImageFormat) -> &'static str {
    match format {
        ImageFormat::Png => "png",
        ImageFormat::Jpeg => "jpeg",
    }
}

#[async_trait::async_trait]
impl Adapter for ConvertToImageAdapter {
    fn arity(&self) -> Arity {
        Arity::Unary
    }

    async fn body(&self, ctx: Arc<AdapterContext>) -> Result<ValueStream> {
        let params: ConvertToImageParams = ctx.params_as()?;
        let mut input = ctx.take_input()?;
        let blobs = ctx.provider.blobs.clone();

        Ok(Box::pin(async_stream::stream! {
            use futures::StreamExt;
            while let Some(item) = input.next().await {
                let datum = match item {
                    Ok(datum) => datum,
                    Err(e) => {
                        yield Err(e);
                        break;
                    }
                };
                let bytes = match encode(&datum, params.format, params.colormap.as_deref()) {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        yield Err(e);
                        break;
                    }
                };
                match blobs.store(&bytes).await {
                    Ok(uri) => yield Ok(json!({
                        "image_uri": uri,
                        "format": format_tag(params.format),
                    })),
                    Err(e) => {
                        yield Err(e);
                        break;
                    }
                }
            }
        }))
    }
}
