//! LLM client (§6): the only outbound dependency besides the database and
//! feed HTTP. Contract is deliberately narrow — `analyze(prompt)` returns a
//! sentiment/impact judgement plus token counts, or an error classifiable by
//! `errors::ErrorKind`. There is no summarization or embedding surface here;
//! that belonged to the admin UI's article-summary feature and is out of
//! scope for this core.

use anyhow::Result;

use crate::models::TokensUsed;

pub mod remote;

/// Result of one sentiment/impact analysis call.
#[derive(Debug, Clone)]
pub struct AnalysisResult {
    pub sentiment: serde_json::Value,
    pub impact: serde_json::Value,
    pub tokens_used: TokensUsed,
}

#[async_trait::async_trait]
pub trait LlmClient: Send + Sync {
    async fn analyze(&self, prompt: &str) -> Result<AnalysisResult>;
}

/// Build the analysis prompt for one item (§4.8 step 3: "Build prompt from
/// the item (title + description/content)").
pub fn build_prompt(title: &str, body: &str) -> String {
    format!(
        r#"Analyze the sentiment and real-world impact of this news article.

OUTPUT FORMAT (strict JSON, no markdown fences):
{{
  "sentiment": {{"label": "positive|neutral|negative", "score": -1.0..1.0}},
  "impact": {{"overall": 0.0..1.0, "urgency": 0.0..1.0, "factors": ["..."]}}
}}

TITLE: {title}

BODY:
{body}
"#
    )
}

/// Pull a JSON object out of a model response that may be wrapped in
/// markdown code fences or preceded by prose.
pub fn extract_json_from_text(text: &str) -> Option<String> {
    let trimmed = text.trim();
    if let Some(start) = trimmed.find("```") {
        let after = &trimmed[start + 3..];
        let after = after.strip_prefix("json").unwrap_or(after);
        if let Some(end) = after.find("```") {
            return Some(after[..end].trim().to_string());
        }
    }
    let start = trimmed.find('{')?;
    let end = trimmed.rfind('}')?;
    if end < start {
        return None;
    }
    Some(trimmed[start..=end].to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_json_from_fenced_block() {
        let text = "here you go:\n```json\n{\"a\": 1}\n```\n";
        assert_eq!(extract_json_from_text(text).unwrap(), "{\"a\": 1}");
    }

    #[test]
    fn extracts_bare_json_object() {
        let text = "  {\"a\": 1}  ";
        assert_eq!(extract_json_from_text(text).unwrap(), "{\"a\": 1}");
    }

    #[test]
    fn prompt_includes_title_and_body() {
        let p = build_prompt("Title here", "Body here");
        assert!(p.contains("Title here"));
        assert!(p.contains("Body here"));
    }
}
