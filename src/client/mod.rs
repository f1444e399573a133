//! Thin HTTP client for one running server
//!
//! Stateless request/response (and streaming) layer bound to a single server
//! address. The client only encodes requests, decodes responses, and surfaces
//! transport errors; retries, pooling, and health tracking belong to the pool.
//! A client carries the mode its server was launched in and rejects
//! operations the server cannot answer, before any bytes hit the wire.

mod types;

pub use types::{
    GenerationChunk, GenerationRequest, GenerationResponse, RerankResult, SamplingParams,
};

use async_stream::try_stream;
use futures::Stream;

use crate::config::ServerMode;
use crate::constants::process as defaults;
use crate::error::{Error, Result};
use types::{EmbeddingsWire, RerankWire};

/// HTTP client bound to one server process
#[derive(Debug, Clone)]
pub struct LlamaClient {
    http: reqwest::Client,
    base_url: String,
    mode: Option<ServerMode>,
}

impl LlamaClient {
    /// Client with no mode restriction, for servers not managed by a pool.
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::build(base_url.into(), None)
    }

    /// Client gated to the operations valid for `mode`.
    pub fn for_mode(base_url: impl Into<String>, mode: ServerMode) -> Self {
        Self::build(base_url.into(), Some(mode))
    }

    fn build(base_url: String, mode: Option<ServerMode>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            mode,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Probe the liveness endpoint.
    pub async fn health(&self) -> Result<bool> {
        let url = format!("{}{}", self.base_url, defaults::HEALTH_PATH);
        let response = self.http.get(&url).send().await?;
        Ok(response.status().is_success())
    }

    /// Run one completion to the end and return the full result.
    pub async fn generate(&self, request: &GenerationRequest) -> Result<GenerationResponse> {
        self.check_mode(ServerMode::Generation)?;
        let mut body = serde_json::to_value(request)?;
        body["stream"] = serde_json::Value::Bool(false);
        let response = self.post_json("/completion", &body).await?;
        Ok(response.json().await?)
    }

    /// Stream completion tokens as they are produced.
    ///
    /// The stream ends after the chunk carrying `stop == true`.
    pub fn generate_stream(
        &self,
        request: &GenerationRequest,
    ) -> impl Stream<Item = Result<GenerationChunk>> + Send + 'static {
        let mode_check = self.check_mode(ServerMode::Generation);
        let http = self.http.clone();
        let url = format!("{}/completion", self.base_url);
        let body = serde_json::to_value(request).map(|mut value| {
            value["stream"] = serde_json::Value::Bool(true);
            value
        });

        try_stream! {
            mode_check?;
            let body = body?;
            let response = http.post(&url).json(&body).send().await?;
            let mut response = ensure_success("/completion", response).await?;

            let mut buffer: Vec<u8> = Vec::new();
            'body: while let Some(bytes) = response.chunk().await? {
                buffer.extend_from_slice(&bytes);
                while let Some(newline) = buffer.iter().position(|&b| b == b'\n') {
                    let line: Vec<u8> = buffer.drain(..=newline).collect();
                    let line = String::from_utf8_lossy(&line);
                    if let Some(parsed) = parse_sse_line(&line) {
                        let chunk = parsed?;
                        let stop = chunk.stop;
                        yield chunk;
                        if stop {
                            break 'body;
                        }
                    }
                }
            }
        }
    }

    /// Embed one input, returning its vector.
    pub async fn embed_one(&self, input: &str) -> Result<Vec<f32>> {
        let mut vectors = self.embed(&[input]).await?;
        vectors
            .pop()
            .ok_or_else(|| Error::Transport("embeddings response was empty".to_string()))
    }

    /// Embed a batch of inputs, returning one vector per input, in order.
    pub async fn embed(&self, inputs: &[&str]) -> Result<Vec<Vec<f32>>> {
        self.check_mode(ServerMode::Embedding)?;
        let body = serde_json::json!({ "input": inputs });
        let response = self.post_json("/v1/embeddings", &body).await?;
        let wire: EmbeddingsWire = response.json().await?;

        if wire.data.len() != inputs.len() {
            return Err(Error::Transport(format!(
                "expected {} embeddings, server returned {}",
                inputs.len(),
                wire.data.len()
            )));
        }
        let mut rows = wire.data;
        rows.sort_by_key(|row| row.index);
        Ok(rows.into_iter().map(|row| row.embedding).collect())
    }

    /// Score each document's relevance to the query.
    pub async fn rerank(&self, query: &str, documents: &[&str]) -> Result<Vec<RerankResult>> {
        self.check_mode(ServerMode::Reranking)?;
        let body = serde_json::json!({ "query": query, "documents": documents });
        let response = self.post_json("/rerank", &body).await?;
        let wire: RerankWire = response.json().await?;
        Ok(wire.results)
    }

    async fn post_json(
        &self,
        path: &str,
        body: &serde_json::Value,
    ) -> Result<reqwest::Response> {
        let url = format!("{}{}", self.base_url, path);
        let response = self.http.post(&url).json(body).send().await?;
        ensure_success(path, response).await
    }

    fn check_mode(&self, required: ServerMode) -> Result<()> {
        match self.mode {
            Some(mode) if mode != required => Err(Error::InvalidMode(format!(
                "server is running in {mode} mode, operation requires {required}"
            ))),
            _ => Ok(()),
        }
    }
}

/// Surface a non-2xx status as a transport error carrying the body text.
async fn ensure_success(path: &str, response: reqwest::Response) -> Result<reqwest::Response> {
    if response.status().is_success() {
        return Ok(response);
    }
    let status = response.status();
    let text = response.text().await.unwrap_or_default();
    Err(Error::Transport(format!("POST {path}: HTTP {status}: {text}")))
}

/// Parse one server-sent-events line into a token chunk.
///
/// Returns `None` for keep-alives, blank lines, and stream terminators.
pub(crate) fn parse_sse_line(line: &str) -> Option<Result<GenerationChunk>> {
    let data = line.trim().strip_prefix("data:")?.trim_start();
    if data.is_empty() || data == "[DONE]" {
        return None;
    }
    Some(serde_json::from_str(data).map_err(Error::from))
}
