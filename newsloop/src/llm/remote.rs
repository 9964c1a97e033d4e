//! Remote LLM provider talking to a single OpenAI-compatible chat-completions
//! endpoint, configured via `[llm.remote]` (§10.3). The teacher split this
//! into background/interactive modes with separate base URLs; this core only
//! ever drives one analysis endpoint, so that split is gone.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::{build_prompt, extract_json_from_text, AnalysisResult, LlmClient};
use crate::models::TokensUsed;

pub struct RemoteLlmClient {
    api_url: String,
    api_key: String,
    model: String,
    timeout: Duration,
    max_tokens: Option<usize>,
    client: reqwest::Client,
}

impl RemoteLlmClient {
    pub fn new(
        api_url: impl Into<String>,
        api_key: impl Into<String>,
        model: impl Into<String>,
        timeout_seconds: u64,
        max_tokens: Option<usize>,
    ) -> Self {
        Self {
            api_url: api_url.into(),
            api_key: api_key.into(),
            model: model.into(),
            timeout: Duration::from_secs(timeout_seconds),
            max_tokens,
            client: reqwest::Client::new(),
        }
    }

    pub fn analyze_item(&self, title: &str, body: &str) -> String {
        build_prompt(title, body)
    }
}

#[async_trait::async_trait]
impl LlmClient for RemoteLlmClient {
    async fn analyze(&self, prompt: &str) -> Result<AnalysisResult> {
        let req_body = ChatRequest {
            model: self.model.clone(),
            messages: vec![ChatMessage {
                role: "user".to_string(),
                content: prompt.to_string(),
            }],
            max_tokens: self.max_tokens,
            temperature: Some(0.0),
        };

        let response = tokio::time::timeout(
            self.timeout,
            self.client
                .post(&self.api_url)
                .header("Authorization", format!("Bearer {}", self.api_key))
                .header("Content-Type", "application/json")
                .json(&req_body)
                .send(),
        )
        .await
        .context("LLM request timed out")?
        .context("LLM HTTP request failed")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("LLM API error {}: {}", status, body);
        }

        let resp_body: ChatResponse = response.json().await.context("Failed to parse LLM response")?;

        let choice = resp_body.choices.first().context("LLM response has no choices")?;

        let raw_json = extract_json_from_text(&choice.message.content)
            .context("No valid JSON found in LLM analysis response")?;

        let parsed: AnalyzeJson = serde_json::from_str(&raw_json)
            .with_context(|| format!("Failed to parse LLM analysis JSON: {raw_json}"))?;

        let usage = resp_body.usage.unwrap_or_default();
        let tokens_used = TokensUsed {
            input: usage.prompt_tokens.unwrap_or(0) as i64,
            output: usage.completion_tokens.unwrap_or(0) as i64,
            cached: usage
                .prompt_tokens_details
                .and_then(|d| d.cached_tokens)
                .unwrap_or(0) as i64,
        };

        Ok(AnalysisResult {
            sentiment: parsed.sentiment,
            impact: parsed.impact,
            tokens_used,
        })
    }
}

#[derive(Debug, Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
}

#[derive(Debug, Serialize, Deserialize)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize, Default)]
struct Usage {
    #[serde(default)]
    prompt_tokens: Option<usize>,
    #[serde(default)]
    completion_tokens: Option<usize>,
    #[serde(default)]
    prompt_tokens_details: Option<PromptTokensDetails>,
}

#[derive(Debug, Deserialize, Default)]
struct PromptTokensDetails {
    #[serde(default)]
    cached_tokens: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct AnalyzeJson {
    sentiment: serde_json::Value,
    impact: serde_json::Value,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_prompt_with_title_and_body() {
        let client = RemoteLlmClient::new("http://localhost/v1/chat/completions", "key", "gpt-4.1-mini", 30, None);
        let prompt = client.analyze_item("t", "b");
        assert!(prompt.contains('t'));
        assert!(prompt.contains('b'));
    }
}
