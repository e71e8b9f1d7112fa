use anyhow::anyhow;
use async_trait::async_trait;
use reqwest::Client;
use serde::{de::IgnoredAny, Deserialize, Serialize};
use tracing::{error, info};

use crate::errors::GradingError;

/// Common message structure for LLM requests
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LLMMessage {
    pub role: String,
    pub content: String,
}

/// The seam between the grader and whatever produces completions.
#[async_trait]
pub trait CompletionClient: Send + Sync {
    async fn complete(&self, system_message: Option<&str>, prompt: &str) -> Result<String, GradingError>;

    fn provider_name(&self) -> &str;

    fn model_name(&self) -> &str;
}

/// Enum-based LLM provider implementation
#[derive(Debug, Clone)]
pub enum LLMProvider {
    OpenAI(OpenAIProvider),
    Gemini(GeminiProvider),
}

#[async_trait]
impl CompletionClient for LLMProvider {
    async fn complete(&self, system_message: Option<&str>, prompt: &str) -> Result<String, GradingError> {
        match self {
            LLMProvider::OpenAI(provider) => provider.make_request(system_message, prompt).await,
            LLMProvider::Gemini(provider) => provider.make_request(system_message, prompt).await,
        }
    }

    fn provider_name(&self) -> &str {
        match self {
            LLMProvider::OpenAI(_) => "OpenAI",
            LLMProvider::Gemini(_) => "Gemini",
        }
    }

    fn model_name(&self) -> &str {
        match self {
            LLMProvider::OpenAI(provider) => &provider.model,
            LLMProvider::Gemini(provider) => &provider.model,
        }
    }
}

/// OpenAI chat-completions provider
#[derive(Debug, Clone)]
pub struct OpenAIProvider {
    client: Client,
    api_key: String,
    base_url: String,
    model: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct OpenAIRequest {
    model: String,
    messages: Vec<LLMMessage>,
    temperature: f32,
    max_tokens: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct OpenAIResponse {
    choices: Vec<OpenAIChoice>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct OpenAIChoice {
    message: LLMMessage,
}

impl OpenAIProvider {
    pub fn new(api_key: String, base_url: Option<String>, model: Option<String>) -> Self {
        Self {
            client: Client::new(),
            api_key,
            base_url: base_url.unwrap_or_else(|| "https://api.openai.com/v1".to_string()),
            model: model.unwrap_or_else(|| "gpt-4o-mini".to_string()),
        }
    }

    pub async fn make_request(&self, system_message: Option<&str>, prompt: &str) -> Result<String, GradingError> {
        if self.api_key.trim().is_empty() {
            return Err(GradingError::MissingApiKey);
        }

        let mut messages = Vec::new();

        if let Some(sys_msg) = system_message {
            messages.push(LLMMessage {
                role: "system".to_string(),
                content: sys_msg.to_string(),
            });
        }

        messages.push(LLMMessage {
            role: "user".to_string(),
            content: prompt.to_string(),
        });

        let request_body = OpenAIRequest {
            model: self.model.clone(),
            messages,
            temperature: 0.0,
            max_tokens: 800,
        };

        info!(
            provider = "OpenAI",
            model = %self.model,
            base_url = %self.base_url,
            prompt_length = prompt.len(),
            "Making LLM request"
        );

        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&request_body)
            .send()
            .await
            .map_err(|e| GradingError::Provider(e.into()))?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            error!(
                provider = "OpenAI",
                status = %status,
                error = %error_text,
                "LLM API request failed"
            );
            return Err(GradingError::Provider(anyhow!(
                "OpenAI API request failed ({}): {}",
                status,
                error_text
            )));
        }

        let openai_response: OpenAIResponse = response
            .json()
            .await
            .map_err(|e| GradingError::Provider(e.into()))?;

        let response_content = openai_response
            .choices
            .into_iter()
            .next()
            .map(|choice| choice.message.content)
            .filter(|content| !content.trim().is_empty())
            .ok_or(GradingError::EmptyResponse)?;

        info!(
            provider = "OpenAI",
            response_length = response_content.len(),
            "Successfully received LLM response"
        );

        Ok(response_content)
    }
}

/// Gemini generateContent provider
#[derive(Debug, Clone)]
pub struct GeminiProvider {
    client: Client,
    api_key: String,
    base_url: String,
    model: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct GeminiRequest {
    contents: Vec<GeminiContent>,
    #[serde(rename = "generationConfig")]
    generation_config: GeminiGenerationConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct GeminiContent {
    parts: Vec<GeminiPart>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct GeminiPart {
    text: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct GeminiGenerationConfig {
    temperature: f32,
    #[serde(rename = "maxOutputTokens")]
    max_output_tokens: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct GeminiResponse {
    #[serde(default)]
    candidates: Vec<GeminiCandidate>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct GeminiCandidate {
    content: GeminiContent,
}

impl GeminiProvider {
    pub fn new(api_key: String, base_url: Option<String>, model: Option<String>) -> Self {
        Self {
            client: Client::new(),
            api_key,
            base_url: base_url
                .unwrap_or_else(|| "https://generativelanguage.googleapis.com/v1beta".to_string()),
            model: model.unwrap_or_else(|| "gemini-2.0-flash".to_string()),
        }
    }

    pub async fn make_request(&self, system_message: Option<&str>, prompt: &str) -> Result<String, GradingError> {
        if self.api_key.trim().is_empty() {
            return Err(GradingError::MissingApiKey);
        }

        let full_prompt = match system_message {
            Some(sys_msg) => format!("{}\n\n{}", sys_msg, prompt),
            None => prompt.to_string(),
        };

        let request_body = GeminiRequest {
            contents: vec![GeminiContent {
                parts: vec![GeminiPart { text: full_prompt }],
            }],
            generation_config: GeminiGenerationConfig {
                temperature: 0.0,
                max_output_tokens: 800,
            },
        };

        let url = format!(
            "{}/models/{}:generateContent?key={}",
            self.base_url, self.model, self.api_key
        );

        info!(
            provider = "Gemini",
            model = %self.model,
            base_url = %self.base_url,
            prompt_length = prompt.len(),
            "Making LLM request"
        );

        let response = self
            .client
            .post(&url)
            .header("Content-Type", "application/json")
            .json(&request_body)
            .send()
            .await
            .map_err(|e| GradingError::Provider(e.into()))?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            error!(
                provider = "Gemini",
                status = %status,
                error = %error_text,
                "LLM API request failed"
            );
            return Err(GradingError::Provider(anyhow!(
                "Gemini API request failed ({}): {}",
                status,
                error_text
            )));
        }

        let gemini_response: GeminiResponse = response
            .json()
            .await
            .map_err(|e| GradingError::Provider(e.into()))?;

        let response_content = gemini_response
            .candidates
            .into_iter()
            .next()
            .and_then(|candidate| candidate.content.parts.into_iter().next())
            .map(|part| part.text)
            .filter(|text| !text.trim().is_empty())
            .ok_or(GradingError::EmptyResponse)?;

        info!(
            provider = "Gemini",
            response_length = response_content.len(),
            "Successfully received LLM response"
        );

        Ok(response_content)
    }
}

/// Defensive JSON extraction for model output that may carry prose or markdown fences
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonResponseParser;

impl JsonResponseParser {
    /// Best-effort JSON text for logging: fenced block, else first balanced value, else the trimmed input.
    pub fn extract_json_from_response(content: &str) -> String {
        let unfenced = strip_code_fences(content);
        match balanced_json_candidates(&unfenced).next() {
            Some(candidate) => candidate.to_string(),
            None => unfenced.trim().to_string(),
        }
    }

    /// Parse directly; on failure try each balanced `{...}` / `[...]` substring in order.
    /// A candidate that is valid JSON of the wrong shape hides its nested values,
    /// so an inner `[]` never stands in for a rejected outer array.
    pub fn parse_json_response<T>(&self, content: &str) -> Result<T, GradingError>
    where
        T: serde::de::DeserializeOwned,
    {
        let unfenced = strip_code_fences(content);
        let trimmed = unfenced.trim();
        if trimmed.is_empty() {
            return Err(GradingError::EmptyResponse);
        }

        let direct_error = match serde_json::from_str::<T>(trimmed) {
            Ok(value) => return Ok(value),
            Err(e) => e,
        };

        let mut covered_until = 0;
        for (start, candidate) in balanced_json_spans(trimmed) {
            if start < covered_until {
                continue;
            }
            match serde_json::from_str::<T>(candidate) {
                Ok(value) => return Ok(value),
                Err(_) if serde_json::from_str::<IgnoredAny>(candidate).is_ok() => {
                    covered_until = start + candidate.len();
                }
                Err(_) => {}
            }
        }

        Err(GradingError::Parse(direct_error.to_string()))
    }
}

fn strip_code_fences(content: &str) -> String {
    if !content.contains("```") {
        return content.to_string();
    }
    content
        .lines()
        .filter(|line| !line.trim_start().starts_with("```"))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Balanced JSON object/array substrings, one per opening bracket position,
/// in order of appearance. String literals and escapes are respected.
pub fn balanced_json_candidates(content: &str) -> impl Iterator<Item = &str> {
    balanced_json_spans(content).map(|(_, span)| span)
}

fn balanced_json_spans(content: &str) -> impl Iterator<Item = (usize, &str)> {
    content
        .char_indices()
        .filter(|(_, c)| *c == '{' || *c == '[')
        .filter_map(move |(start, _)| balanced_span(content, start).map(|span| (start, span)))
}

fn balanced_span(content: &str, start: usize) -> Option<&str> {
    let mut stack: Vec<char> = Vec::new();
    let mut in_string = false;
    let mut escaped = false;

    for (offset, ch) in content[start..].char_indices() {
        if in_string {
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == '"' {
                in_string = false;
            }
            continue;
        }

        match ch {
            '"' => in_string = true,
            '{' | '[' => stack.push(ch),
            '}' | ']' => {
                let open = stack.pop()?;
                if (open == '{') != (ch == '}') {
                    return None;
                }
                if stack.is_empty() {
                    let end = start + offset + ch.len_utf8();
                    return Some(&content[start..end]);
                }
            }
            _ => {}
        }
    }

    None
}

/// Factory for creating LLM providers based on provider type
pub struct LLMProviderFactory;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum LLMProviderType {
    OpenAI,
    Gemini,
}

impl LLMProviderType {
    pub fn parse(value: &str) -> Self {
        match value.to_lowercase().as_str() {
            "gemini" | "google" => LLMProviderType::Gemini,
            "openai" | "chatgpt" | "gpt" => LLMProviderType::OpenAI,
            _ => {
                info!("Unknown LLM provider '{}', defaulting to OpenAI", value);
                LLMProviderType::OpenAI
            }
        }
    }
}

impl LLMProviderFactory {
    pub fn create_provider(
        provider_type: LLMProviderType,
        api_key: String,
        base_url: Option<String>,
        model: Option<String>,
    ) -> LLMProvider {
        match provider_type {
            LLMProviderType::OpenAI => {
                LLMProvider::OpenAI(OpenAIProvider::new(api_key, base_url, model))
            }
            LLMProviderType::Gemini => {
                LLMProvider::Gemini(GeminiProvider::new(api_key, base_url, model))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    #[test]
    fn test_provider_type_parsing() {
        assert_eq!(LLMProviderType::parse("OpenAI"), LLMProviderType::OpenAI);
        assert_eq!(LLMProviderType::parse("gpt"), LLMProviderType::OpenAI);
        assert_eq!(LLMProviderType::parse("GOOGLE"), LLMProviderType::Gemini);
        assert_eq!(LLMProviderType::parse("gemini"), LLMProviderType::Gemini);
        assert_eq!(LLMProviderType::parse("claude"), LLMProviderType::OpenAI);
    }

    #[test]
    fn test_factory_defaults() {
        let provider = LLMProviderFactory::create_provider(
            LLMProviderType::OpenAI,
            "key".to_string(),
            None,
            None,
        );
        assert_eq!(provider.provider_name(), "OpenAI");
        assert_eq!(provider.model_name(), "gpt-4o-mini");

        let provider = LLMProviderFactory::create_provider(
            LLMProviderType::Gemini,
            "key".to_string(),
            None,
            Some("gemini-custom".to_string()),
        );
        assert_eq!(provider.provider_name(), "Gemini");
        assert_eq!(provider.model_name(), "gemini-custom");
    }

    #[tokio::test]
    async fn test_missing_api_key_fails_before_network() {
        let provider = LLMProviderFactory::create_provider(
            LLMProviderType::OpenAI,
            "   ".to_string(),
            Some("http://127.0.0.1:9".to_string()),
            None,
        );
        let result = provider.complete(None, "grade this").await;
        assert!(matches!(result, Err(GradingError::MissingApiKey)));
    }

    #[test]
    fn test_balanced_candidates_respect_strings() {
        let text = r#"Sure! {"score": 7, "suggestion": "use } and { carefully"} trailing"#;
        let first = balanced_json_candidates(text).next().unwrap();
        assert_eq!(first, r#"{"score": 7, "suggestion": "use } and { carefully"}"#);

        let escaped = r#"{"a": "quote \" and } brace"}"#;
        assert_eq!(balanced_json_candidates(escaped).next().unwrap(), escaped);

        assert!(balanced_json_candidates("no json here").next().is_none());
        assert!(balanced_json_candidates("{ unclosed").next().is_none());
        assert!(balanced_json_candidates("{ mismatched ]").next().is_none());
    }

    #[test]
    fn test_parse_tolerates_prose_and_fences() {
        let parser = JsonResponseParser;

        let fenced = "```json\n{\"score\": 8, \"suggestion\": \"good\"}\n```";
        let value: Value = parser.parse_json_response(fenced).unwrap();
        assert_eq!(value["score"], 8);

        let prose = "Here is my evaluation: {\"score\": 4, \"suggestion\": \"expand\"} Hope it helps.";
        let value: Value = parser.parse_json_response(prose).unwrap();
        assert_eq!(value["suggestion"], "expand");

        let array = "Results:\n[{\"id\": \"q1\", \"score\": 90}]\nDone";
        let value: Vec<Value> = parser.parse_json_response(array).unwrap();
        assert_eq!(value[0]["id"], "q1");
    }

    #[test]
    fn test_parse_skips_non_json_brackets() {
        #[derive(serde::Deserialize)]
        struct Scored {
            score: f64,
        }

        let parser = JsonResponseParser;
        let text = "Note [see rubric] then {\"score\": 6}";
        let scored: Scored = parser.parse_json_response(text).unwrap();
        assert_eq!(scored.score, 6.0);
    }

    #[test]
    fn test_parse_does_not_descend_into_rejected_json() {
        #[derive(Debug, serde::Deserialize)]
        struct Strict {
            #[allow(dead_code)]
            tags: Vec<String>,
        }

        let parser = JsonResponseParser;
        let text = r#"Results: [{"tags": null, "extra": []}]"#;
        assert!(matches!(
            parser.parse_json_response::<Vec<Strict>>(text),
            Err(GradingError::Parse(_))
        ));

        let prose_then_json = r#"Scores [see below] [{"tags": ["a"]}]"#;
        let parsed: Vec<Strict> = parser.parse_json_response(prose_then_json).unwrap();
        assert_eq!(parsed.len(), 1);
    }

    #[test]
    fn test_parse_failures() {
        let parser = JsonResponseParser;
        assert!(matches!(
            parser.parse_json_response::<Value>("   "),
            Err(GradingError::EmptyResponse)
        ));
        assert!(matches!(
            parser.parse_json_response::<Value>("I cannot grade this."),
            Err(GradingError::Parse(_))
        ));
    }

    #[test]
    fn test_extract_json_for_logging() {
        assert_eq!(
            JsonResponseParser::extract_json_from_response("text {\"a\":1} more"),
            "{\"a\":1}"
        );
        assert_eq!(JsonResponseParser::extract_json_from_response("  plain  "), "plain");
    }
}
