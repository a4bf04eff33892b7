//! The LLM client boundary consumed by [`crate::worker`].
//!
//! [`LlmClient`] is the trait every stage call goes through; [`ReqwestLlmClient`]
//! is the reference implementation satisfying the HTTP requirements of
//! the pipeline's external interface: bearer auth, JSON bodies, a
//! pooled, keep-alive client, and an identifying `User-Agent`.

use crate::error::PipelineError;
use crate::types::{Stage1Result, Term, Usage};
use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;

/// Consumed boundary: turns a `Term` (optionally with its Stage 1 result)
/// into the next stage's output plus token usage.
#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn process_stage1(&self, term: &Term) -> Result<(Stage1Result, Usage), PipelineError>;

    async fn process_stage2(
        &self,
        term: &Term,
        stage1: &Stage1Result,
    ) -> Result<(String, Usage), PipelineError>;
}

/// Reference `LlmClient` backed by an OpenRouter-style chat completions
/// endpoint. Stage 1 responses are parsed as JSON (optionally fenced);
/// Stage 2 responses are left as raw TSV text for [`crate::worker`] to parse.
pub struct ReqwestLlmClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    stage1_model: String,
    stage2_model: String,
}

#[derive(Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<ChatChoice>,
    usage: Option<ChatUsage>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Deserialize)]
struct ChatMessage {
    content: String,
}

#[derive(Deserialize, Default)]
struct ChatUsage {
    #[serde(default)]
    prompt_tokens: u32,
    #[serde(default)]
    completion_tokens: u32,
    #[serde(default)]
    total_tokens: u32,
}

impl From<Option<ChatUsage>> for Usage {
    fn from(usage: Option<ChatUsage>) -> Self {
        match usage {
            Some(u) => Usage {
                tokens_prompt: u.prompt_tokens,
                tokens_completion: u.completion_tokens,
                tokens_total: u.total_tokens,
                estimated_cost: 0.0,
            },
            None => Usage::default(),
        }
    }
}

impl ReqwestLlmClient {
    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        stage1_model: impl Into<String>,
        stage2_model: impl Into<String>,
    ) -> Result<Self, PipelineError> {
        let http = reqwest::Client::builder()
            .pool_idle_timeout(Duration::from_secs(90))
            .tcp_keepalive(Duration::from_secs(60))
            .user_agent(concat!("flashpipe/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| PipelineError::internal(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            http,
            base_url: base_url.into(),
            api_key: api_key.into(),
            stage1_model: stage1_model.into(),
            stage2_model: stage2_model.into(),
        })
    }

    async fn complete(&self, model: &str, prompt: &str) -> Result<(String, Usage), PipelineError> {
        let body = serde_json::json!({
            "model": model,
            "messages": [{"role": "user", "content": prompt}],
        });

        let response = self
            .http
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(classify_transport_error)?;

        let status = response.status();
        if status == 429 {
            let retry_after = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok())
                .map(Duration::from_secs);
            return Err(PipelineError::rate_limit(retry_after));
        }
        if status == 401 || status == 403 {
            return Err(PipelineError::new(
                crate::error::ErrorKind::Auth,
                format!("authentication failed: {status}"),
            ));
        }
        if status.is_client_error() {
            let body = response.text().await.unwrap_or_default();
            return Err(PipelineError::client_api(status.as_u16(), body));
        }
        if status.is_server_error() {
            let body = response.text().await.unwrap_or_default();
            return Err(PipelineError::server_api(status.as_u16(), body));
        }

        let parsed: ChatCompletionResponse = response
            .json()
            .await
            .map_err(|e| PipelineError::validation(format!("malformed chat completion response: {e}")))?;

        let content = parsed
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| PipelineError::validation("response contained no choices"))?;

        Ok((content, parsed.usage.into()))
    }
}

fn classify_transport_error(err: reqwest::Error) -> PipelineError {
    if err.is_timeout() {
        PipelineError::timeout(err.to_string())
    } else {
        PipelineError::network(err.to_string())
    }
}

#[async_trait]
impl LlmClient for ReqwestLlmClient {
    async fn process_stage1(&self, term: &Term) -> Result<(Stage1Result, Usage), PipelineError> {
        let prompt = format!(
            "Analyze the term \"{}\"{} and respond with a single fenced JSON object.",
            term.term,
            term.kind.as_deref().map(|k| format!(" ({k})")).unwrap_or_default()
        );
        let (content, usage) = self.complete(&self.stage1_model, &prompt).await?;
        let result = crate::worker::parse_stage1_content(&content)?;
        Ok((result, usage))
    }

    async fn process_stage2(
        &self,
        term: &Term,
        stage1: &Stage1Result,
    ) -> Result<(String, Usage), PipelineError> {
        let prompt = format!(
            "Render flashcards for \"{}\" given this analysis: {}. Respond with TSV rows.",
            term.term,
            serde_json::to_string(stage1).unwrap_or_default()
        );
        self.complete(&self.stage2_model, &prompt).await
    }
}
