//! Request transport to the server.

use async_trait::async_trait;
use missive_shared::protocol::ErrorBody;
use serde_json::Value;

use crate::error::ClientError;

/// Posts a JSON body to a named server method.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn post(&self, method: &str, body: Value) -> Result<Value, ClientError>;
}

/// `POST <server_url>/<method>` over HTTP.
pub struct HttpTransport {
    client: reqwest::Client,
    base_url: String,
}

impl HttpTransport {
    pub fn new(base_url: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn post(&self, method: &str, body: Value) -> Result<Value, ClientError> {
        let url = format!("{}/{}", self.base_url, method);
        let response = self.client.post(&url).json(&body).send().await?;

        let status = response.status();
        if status.is_client_error() || status.is_server_error() {
            let message = match response.json::<ErrorBody>().await {
                Ok(body) => body.message,
                Err(_) => status.canonical_reason().unwrap_or("error").to_string(),
            };
            tracing::debug!(method, status = status.as_u16(), %message, "Server rejected request");
            return Err(ClientError::Server {
                code: status.as_u16(),
                message,
            });
        }

        Ok(response.json().await?)
    }
}
