// OMChat Client: Network seams
// The token exchange and the streaming POST sit behind traits so the
// session layer can be driven by scripted fakes in tests. The real
// implementations are thin wrappers over a shared reqwest::Client.

use crate::error::{ClientError, ClientResult};
use crate::types::{truncate_utf8, TokenSet};
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use futures::StreamExt;
use log::{error, info};
use reqwest::header::{HeaderMap, ACCEPT, CONTENT_TYPE, ORIGIN};
use reqwest::Client;
use serde_json::{json, Value};
use std::time::Duration;

/// Build the client the session shares across login, refresh, and
/// streaming requests. Streams can be long-lived, so only the connect
/// phase carries a timeout.
pub fn http_client() -> Client {
    Client::builder()
        .connect_timeout(Duration::from_secs(10))
        .build()
        .unwrap_or_default()
}

// ── Token refresh seam ─────────────────────────────────────────────────

/// One refresh-token exchange against the auth service.
#[async_trait]
pub trait TokenEndpoint: Send + Sync {
    async fn exchange(&self, refresh_token: &str) -> ClientResult<TokenSet>;
}

pub struct HttpTokenEndpoint {
    client: Client,
    url: String,
}

impl HttpTokenEndpoint {
    pub fn new(client: Client, url: String) -> Self {
        HttpTokenEndpoint { client, url }
    }
}

#[async_trait]
impl TokenEndpoint for HttpTokenEndpoint {
    async fn exchange(&self, refresh_token: &str) -> ClientResult<TokenSet> {
        let response = self
            .client
            .post(&self.url)
            .json(&json!({ "refresh_token": refresh_token }))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            error!("[tokens] Refresh endpoint returned {}: {}", status, truncate_utf8(&body, 200));
            return Err(ClientError::RefreshFailure(format!(
                "refresh endpoint returned {}",
                status.as_u16()
            )));
        }

        let tokens: TokenSet = response.json().await?;
        info!("[tokens] Refresh exchange succeeded");
        Ok(tokens)
    }
}

// ── Login seam ─────────────────────────────────────────────────────────

/// Raw login response: the status plus the headers and body the session
/// inspects for token material.
pub struct LoginResponse {
    pub status: u16,
    pub headers: HeaderMap,
    pub body: String,
}

/// One credential submission against the user API.
#[async_trait]
pub trait LoginEndpoint: Send + Sync {
    async fn submit(&self, email: &str, password: &str) -> ClientResult<LoginResponse>;
}

pub struct HttpLoginEndpoint {
    client: Client,
    url: String,
    origin: String,
}

impl HttpLoginEndpoint {
    pub fn new(client: Client, url: String, origin: String) -> Self {
        HttpLoginEndpoint { client, url, origin }
    }
}

#[async_trait]
impl LoginEndpoint for HttpLoginEndpoint {
    async fn submit(&self, email: &str, password: &str) -> ClientResult<LoginResponse> {
        let response = self
            .client
            .post(&self.url)
            .header(CONTENT_TYPE, "application/json")
            .header(ACCEPT, "application/json")
            .header(ORIGIN, &self.origin)
            .json(&json!({ "_email": email, "_password": password }))
            .send()
            .await?;

        let status = response.status().as_u16();
        let headers = response.headers().clone();
        let body = response.text().await.unwrap_or_default();
        Ok(LoginResponse { status, headers, body })
    }
}

// ── Streaming seam ─────────────────────────────────────────────────────

/// A streaming POST response: the status line plus an incremental body.
pub struct StreamingResponse {
    pub status: u16,
    pub body: BoxStream<'static, ClientResult<Bytes>>,
}

impl StreamingResponse {
    /// Drain the body into a string. Used for error reporting on non-2xx
    /// responses, where the "stream" is just an error document.
    pub async fn text(mut self) -> String {
        let mut out = String::new();
        while let Some(chunk) = self.body.next().await {
            match chunk {
                Ok(bytes) => out.push_str(&String::from_utf8_lossy(&bytes)),
                Err(_) => break,
            }
        }
        out
    }
}

/// Issues the streaming agent request.
#[async_trait]
pub trait StreamTransport: Send + Sync {
    async fn post_stream(
        &self,
        url: &str,
        headers: HeaderMap,
        body: Value,
    ) -> ClientResult<StreamingResponse>;
}

pub struct HttpStreamTransport {
    client: Client,
}

impl HttpStreamTransport {
    pub fn new(client: Client) -> Self {
        HttpStreamTransport { client }
    }
}

#[async_trait]
impl StreamTransport for HttpStreamTransport {
    async fn post_stream(
        &self,
        url: &str,
        headers: HeaderMap,
        body: Value,
    ) -> ClientResult<StreamingResponse> {
        let response = self
            .client
            .post(url)
            .headers(headers)
            .json(&body)
            .send()
            .await?;

        let status = response.status().as_u16();
        let body = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(|e| ClientError::Transport(format!("Stream read error: {}", e))))
            .boxed();

        Ok(StreamingResponse { status, body })
    }
}

// ── Tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;

    #[tokio::test]
    async fn streaming_response_text_collects_chunks() {
        let body = stream::iter(vec![
            Ok(Bytes::from_static(b"error ")),
            Ok(Bytes::from_static(b"document")),
        ])
        .boxed();
        let response = StreamingResponse { status: 500, body };
        assert_eq!(response.text().await, "error document");
    }

    #[tokio::test]
    async fn streaming_response_text_stops_at_transport_error() {
        let body = stream::iter(vec![
            Ok(Bytes::from_static(b"partial")),
            Err(ClientError::Transport("reset".into())),
            Ok(Bytes::from_static(b" never seen")),
        ])
        .boxed();
        let response = StreamingResponse { status: 500, body };
        assert_eq!(response.text().await, "partial");
    }
}
