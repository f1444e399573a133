//! Wire types for the server HTTP protocol
//!
//! Field names follow the server's native completion endpoint; the client
//! structs rename where our naming differs so callers never see wire names.

use serde::{Deserialize, Serialize};

/// Sampling parameters for text generation
///
/// Unset fields are omitted from the request body and take the server's
/// defaults.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SamplingParams {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_k: Option<i32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_p: Option<f32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub repeat_penalty: Option<f32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub presence_penalty: Option<f32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub frequency_penalty: Option<f32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub seed: Option<i64>,

    /// Stop sequences; generation halts when any is produced
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub stop: Vec<String>,

    /// GBNF grammar constraining the output
    #[serde(skip_serializing_if = "Option::is_none")]
    pub grammar: Option<String>,

    /// JSON schema constraining the output (mutually exclusive with grammar)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub json_schema: Option<serde_json::Value>,
}

/// One generation request
#[derive(Debug, Clone, Serialize)]
pub struct GenerationRequest {
    pub prompt: String,

    #[serde(rename = "n_predict", skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,

    #[serde(flatten)]
    pub sampling: SamplingParams,
}

impl GenerationRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            max_tokens: None,
            sampling: SamplingParams::default(),
        }
    }

    pub fn max_tokens(mut self, tokens: u32) -> Self {
        self.max_tokens = Some(tokens);
        self
    }

    pub fn sampling(mut self, sampling: SamplingParams) -> Self {
        self.sampling = sampling;
        self
    }
}

/// Complete (non-streaming) generation result
#[derive(Debug, Clone, Deserialize)]
pub struct GenerationResponse {
    pub content: String,

    #[serde(default)]
    pub tokens_predicted: Option<u64>,

    #[serde(default)]
    pub tokens_evaluated: Option<u64>,

    /// Whether generation stopped naturally rather than being truncated
    #[serde(default)]
    pub stop: bool,
}

/// One incremental token chunk from a streaming generation
#[derive(Debug, Clone, Deserialize)]
pub struct GenerationChunk {
    pub content: String,

    /// Final chunk marker; no further chunks follow
    #[serde(default)]
    pub stop: bool,
}

/// Relevance score for one reranked document
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RerankResult {
    /// Index into the submitted document list
    pub index: usize,

    #[serde(rename = "relevance_score")]
    pub score: f32,
}

#[derive(Debug, Deserialize)]
pub(crate) struct EmbeddingsWire {
    pub data: Vec<EmbeddingRow>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct EmbeddingRow {
    pub index: usize,
    pub embedding: Vec<f32>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct RerankWire {
    pub results: Vec<RerankResult>,
}
