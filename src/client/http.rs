//! reqwest-backed transport for pre-signed PUTs.

use crate::client::driver::{PartProgress, PartTransport, TransportError};
use async_trait::async_trait;
use bytes::Bytes;
use futures::{StreamExt, stream};
use reqwest::{
    Body, Client, Response,
    header::{CONTENT_LENGTH, CONTENT_TYPE, ETAG},
};
use std::io;

/// Bodies are handed to the connection in chunks of this size so progress
/// moves while a part is in flight.
pub const CHUNK_SIZE: usize = 64 * 1024;

#[derive(Debug, Clone, Default)]
pub struct HttpPartTransport {
    client: Client,
}

impl HttpPartTransport {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Single PUT of a whole object. The signed URL is bound to
    /// `content_type`, so the header must match it exactly.
    pub async fn put_object(
        &self,
        url: &str,
        content_type: &str,
        body: Bytes,
        progress: PartProgress,
    ) -> Result<String, TransportError> {
        let len = body.len();
        let response = self
            .client
            .put(url)
            .header(CONTENT_TYPE, content_type)
            .header(CONTENT_LENGTH, len)
            .body(chunked_body(body, progress))
            .send()
            .await
            .map_err(|err| TransportError::Network(err.to_string()))?;
        etag_of(response).await
    }
}

#[async_trait]
impl PartTransport for HttpPartTransport {
    async fn put_part(
        &self,
        url: &str,
        body: Bytes,
        progress: PartProgress,
    ) -> Result<String, TransportError> {
        let len = body.len();
        let response = self
            .client
            .put(url)
            .header(CONTENT_LENGTH, len)
            .body(chunked_body(body, progress))
            .send()
            .await
            .map_err(|err| TransportError::Network(err.to_string()))?;
        etag_of(response).await
    }
}

fn chunked_body(body: Bytes, progress: PartProgress) -> Body {
    let chunks = (0..body.len())
        .step_by(CHUNK_SIZE)
        .map(|start| body.slice(start..(start + CHUNK_SIZE).min(body.len())))
        .collect::<Vec<_>>();
    let stream = stream::iter(chunks).map(move |chunk| {
        progress.add(chunk.len() as u64);
        Ok::<_, io::Error>(chunk)
    });
    Body::wrap_stream(stream)
}

async fn etag_of(response: Response) -> Result<String, TransportError> {
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(TransportError::Status {
            status: status.as_u16(),
            body,
        });
    }
    response
        .headers()
        .get(ETAG)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
        .ok_or(TransportError::MissingEtag)
}
