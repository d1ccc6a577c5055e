use crate::jsonrpc::JsonRpcRequest;
use crate::upstream::Upstream;
use async_trait::async_trait;
use serde_json::Value;

#[derive(thiserror::Error, Debug)]
pub enum TransportError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("upstream returned {0}")]
    BadStatus(reqwest::StatusCode),
    #[error("invalid JSON-RPC response: {0}")]
    InvalidResponse(String),
}

/// Delivers one call to one upstream and returns its JSON-RPC response object.
///
/// A JSON-RPC `error` member in the response is still a successful delivery; only
/// transport failures and malformed responses are errors. Timeouts are applied by the
/// caller.
#[async_trait]
pub trait UpstreamTransport: Send + Sync {
    async fn send(&self, upstream: &Upstream, request: &JsonRpcRequest)
    -> Result<Value, TransportError>;
}

pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl UpstreamTransport for HttpTransport {
    async fn send(
        &self,
        upstream: &Upstream,
        request: &JsonRpcRequest,
    ) -> Result<Value, TransportError> {
        let response = self
            .client
            .post(upstream.url.clone())
            .json(request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(TransportError::BadStatus(status));
        }

        let bytes = response.bytes().await?;
        let payload: Value = serde_json::from_slice(&bytes)
            .map_err(|e| TransportError::InvalidResponse(e.to_string()))?;

        if !payload.is_object() {
            return Err(TransportError::InvalidResponse(
                "response is not an object".to_string(),
            ));
        }

        Ok(payload)
    }
}
