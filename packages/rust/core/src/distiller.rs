//! The distillation capability.
//!
//! [`Distiller`] is the seam: the engine hands it a knowledge snapshot and
//! gets back a structured artifact, treating every failure as opaque.
//! [`OpenAiDistiller`] talks to any OpenAI-compatible chat completions API
//! with a JSON response format.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument};
use url::Url;

use corelogic_shared::{
    CoreLogicContent, CoreLogicError, CoreLogicVersion, Domain, KnowledgeItem, ProviderConfig,
    Result,
};

/// Most recent knowledge items included in a prompt.
const MAX_PROMPT_ITEMS: usize = 50;

/// Characters of each item's content included in a prompt.
const ITEM_EXCERPT_CHARS: usize = 300;

const SYSTEM_PROMPT: &str = "You are an expert knowledge distiller. Extract core logic from \
knowledge: first principles, mental models, decision rules, and anti-patterns. Return structured JSON.";

// ---------------------------------------------------------------------------
// Inputs & outputs
// ---------------------------------------------------------------------------

/// The snapshot a distillation runs against.
#[derive(Debug, Clone)]
pub struct DomainContext {
    pub domain: Domain,
    /// Newest first.
    pub items: Vec<KnowledgeItem>,
}

/// Per-job overrides, read from the job's opaque `config`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DistillOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
}

impl DistillOptions {
    /// Read options from a job config; `null` means no overrides.
    pub fn from_job_config(config: &serde_json::Value) -> Result<Self> {
        if config.is_null() {
            return Ok(Self::default());
        }
        serde_json::from_value(config.clone()).map_err(|e| {
            CoreLogicError::validation(format!("invalid distillation options: {e}"))
        })
    }
}

/// Resource usage reported by a distillation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Usage {
    pub tokens_used: u64,
}

/// A successful distillation.
#[derive(Debug, Clone, PartialEq)]
pub struct Distillation {
    pub content: CoreLogicContent,
    pub summary: Option<String>,
    pub usage: Usage,
}

/// Opaque `knowledge -> structured artifact` capability.
#[async_trait]
pub trait Distiller: Send + Sync {
    async fn distill(
        &self,
        ctx: &DomainContext,
        existing: Option<&CoreLogicVersion>,
        options: &DistillOptions,
    ) -> Result<Distillation>;
}

// ---------------------------------------------------------------------------
// Prompt construction
// ---------------------------------------------------------------------------

/// One line per item: `- {title}: {excerpt}` for the newest items.
pub(crate) fn knowledge_summary(items: &[KnowledgeItem]) -> String {
    items
        .iter()
        .take(MAX_PROMPT_ITEMS)
        .map(|item| {
            let excerpt: String = item.content.chars().take(ITEM_EXCERPT_CHARS).collect();
            format!("- {}: {}", item.title, excerpt)
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Build the user prompt for a distillation run.
pub(crate) fn build_prompt(ctx: &DomainContext, existing: Option<&CoreLogicVersion>) -> String {
    let summary = knowledge_summary(&ctx.items);
    let included = ctx.items.len().min(MAX_PROMPT_ITEMS);

    let mut prompt = format!(
        "Distill core logic from the following knowledge domain.\n\nDomain: {}\n",
        ctx.domain.name
    );
    if let Some(description) = &ctx.domain.description {
        prompt.push_str(&format!("Description: {description}\n"));
    }
    prompt.push_str(&format!(
        "\nKnowledge Items ({included} items):\n{summary}\n\n"
    ));

    if let Some(previous) = existing {
        let c = &previous.content;
        prompt.push_str(&format!(
            "Previous Core Logic (Version {}):\n\
             - First Principles: {} items\n\
             - Mental Models: {} items\n\
             - Decision Rules: {} items\n\
             - Anti-patterns: {} items\n\n\
             Please update and refine the core logic based on new knowledge.\n",
            previous.version,
            c.first_principles.len(),
            c.mental_models.len(),
            c.decision_rules.len(),
            c.anti_patterns.len(),
        ));
    }

    prompt.push_str(
        r#"
Extract and structure the following:

1. First Principles (fundamental truths): core concepts that are always true.
2. Mental Models (ways of thinking): frameworks for understanding.
3. Decision Rules (guidelines for decisions): when-then rules and criteria.
4. Anti-patterns (things to avoid): common mistakes and warning signs.
5. Cross-domain Links: related concepts from other domains.

Return as JSON:
{
  "first_principles": [{"title": "...", "description": "...", "examples": [...]}],
  "mental_models": [{"name": "...", "description": "...", "application": "..."}],
  "decision_rules": [{"condition": "...", "action": "...", "rationale": "..."}],
  "anti_patterns": [{"name": "...", "description": "...", "alternative": "..."}],
  "cross_domain_links": [{"domain": "...", "concept": "...", "relationship": "..."}],
  "summary": "Brief summary of what was distilled"
}"#,
    );

    prompt
}

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f32,
    max_tokens: u32,
    response_format: ResponseFormat,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    kind: &'static str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
    #[serde(default)]
    usage: Option<ChatUsage>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChatChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatUsage {
    #[serde(default)]
    total_tokens: u64,
}

/// The JSON object the model is asked to return.
#[derive(Debug, Deserialize)]
struct DistilledPayload {
    #[serde(flatten)]
    content: CoreLogicContent,
    #[serde(default)]
    summary: Option<String>,
}

/// Turn a raw chat completion body into a [`Distillation`].
pub(crate) fn parse_completion(body: &str) -> Result<Distillation> {
    let response: ChatResponse = serde_json::from_str(body)
        .map_err(|e| CoreLogicError::Provider(format!("invalid completion response: {e}")))?;

    let text = response
        .choices
        .into_iter()
        .next()
        .and_then(|c| c.message.content)
        .unwrap_or_else(|| "{}".to_string());

    let payload: DistilledPayload = serde_json::from_str(&text).map_err(|e| {
        CoreLogicError::Provider(format!(
            "model returned malformed core logic: {e} (got: {})",
            text.chars().take(200).collect::<String>()
        ))
    })?;

    Ok(Distillation {
        content: payload.content,
        summary: payload.summary.filter(|s| !s.trim().is_empty()),
        usage: Usage {
            tokens_used: response.usage.map(|u| u.total_tokens).unwrap_or(0),
        },
    })
}

// ---------------------------------------------------------------------------
// OpenAI-compatible distiller
// ---------------------------------------------------------------------------

/// Distiller backed by an OpenAI-compatible chat completions endpoint.
pub struct OpenAiDistiller {
    client: reqwest::Client,
    endpoint: Url,
    api_key: String,
    defaults: ProviderConfig,
}

impl OpenAiDistiller {
    /// Build a distiller from provider settings and a resolved API key.
    pub fn new(config: &ProviderConfig, api_key: impl Into<String>) -> Result<Self> {
        let endpoint = completions_endpoint(&config.base_url)?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| CoreLogicError::config(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            endpoint,
            api_key: api_key.into(),
            defaults: config.clone(),
        })
    }
}

fn completions_endpoint(base_url: &str) -> Result<Url> {
    let base = if base_url.ends_with('/') {
        base_url.to_string()
    } else {
        format!("{base_url}/")
    };
    Url::parse(&base)
        .and_then(|u| u.join("chat/completions"))
        .map_err(|e| CoreLogicError::config(format!("invalid provider base_url '{base_url}': {e}")))
}

#[async_trait]
impl Distiller for OpenAiDistiller {
    #[instrument(skip_all, fields(domain_id = %ctx.domain.id, items = ctx.items.len()))]
    async fn distill(
        &self,
        ctx: &DomainContext,
        existing: Option<&CoreLogicVersion>,
        options: &DistillOptions,
    ) -> Result<Distillation> {
        if ctx.items.is_empty() {
            return Err(CoreLogicError::Provider(
                "no knowledge found in this domain".into(),
            ));
        }

        let prompt = build_prompt(ctx, existing);
        let model = options.model.as_deref().unwrap_or(&self.defaults.model);
        let request = ChatRequest {
            model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: SYSTEM_PROMPT,
                },
                ChatMessage {
                    role: "user",
                    content: &prompt,
                },
            ],
            temperature: options.temperature.unwrap_or(self.defaults.temperature),
            max_tokens: options.max_tokens.unwrap_or(self.defaults.max_tokens),
            response_format: ResponseFormat {
                kind: "json_object",
            },
        };

        debug!(model, prompt_chars = prompt.len(), "sending distillation request");

        let response = self
            .client
            .post(self.endpoint.clone())
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| CoreLogicError::Provider(format!("request failed: {e}")))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| CoreLogicError::Provider(format!("failed to read response: {e}")))?;

        if !status.is_success() {
            return Err(CoreLogicError::Provider(format!(
                "provider returned {status}: {}",
                body.chars().take(300).collect::<String>()
            )));
        }

        let distillation = parse_completion(&body)?;
        info!(
            model,
            tokens = distillation.usage.tokens_used,
            principles = distillation.content.first_principles.len(),
            "distillation response received"
        );
        Ok(distillation)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;

    fn ctx(n: usize) -> DomainContext {
        DomainContext {
            domain: Domain {
                id: "d1".into(),
                owner: "o".into(),
                name: "Negotiation".into(),
                description: Some("Deal making".into()),
                created_at: Utc::now(),
            },
            items: (0..n)
                .map(|i| KnowledgeItem {
                    id: format!("k{i}"),
                    domain_id: "d1".into(),
                    owner: "o".into(),
                    title: format!("Note {i}"),
                    content: "x".repeat(500),
                    tags: vec![],
                    created_at: Utc::now(),
                })
                .collect(),
        }
    }

    fn previous() -> CoreLogicVersion {
        let content = CoreLogicContent {
            first_principles: vec![json!({}), json!({})],
            anti_patterns: vec![json!({})],
            ..Default::default()
        };
        CoreLogicVersion {
            id: "v3".into(),
            domain_id: "d1".into(),
            version: 3,
            parent_version_id: None,
            content_hash: content.content_hash(),
            content,
            changelog: vec![],
            change_summary: None,
            is_active: true,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn summary_caps_items_and_excerpts() {
        let summary = knowledge_summary(&ctx(60).items);
        assert_eq!(summary.lines().count(), MAX_PROMPT_ITEMS);
        let first = summary.lines().next().unwrap();
        assert_eq!(first, format!("- Note 0: {}", "x".repeat(ITEM_EXCERPT_CHARS)));
    }

    #[test]
    fn excerpt_respects_char_boundaries() {
        let mut c = ctx(1);
        c.items[0].content = "é".repeat(400);
        let summary = knowledge_summary(&c.items);
        assert_eq!(summary.chars().filter(|ch| *ch == 'é').count(), ITEM_EXCERPT_CHARS);
    }

    #[test]
    fn prompt_mentions_domain_and_previous_counts() {
        let prev = previous();
        let prompt = build_prompt(&ctx(3), Some(&prev));
        assert!(prompt.contains("Domain: Negotiation"));
        assert!(prompt.contains("Description: Deal making"));
        assert!(prompt.contains("Knowledge Items (3 items)"));
        assert!(prompt.contains("Previous Core Logic (Version 3)"));
        assert!(prompt.contains("- First Principles: 2 items"));
        assert!(prompt.contains("- Anti-patterns: 1 items"));

        let fresh = build_prompt(&ctx(3), None);
        assert!(!fresh.contains("Previous Core Logic"));
    }

    #[test]
    fn parse_completion_defaults_missing_fields() {
        let inner = json!({
            "first_principles": [{"title": "Anchor early"}],
            "decision_rules": [{"condition": "a", "action": "b"}],
            "summary": "two items"
        })
        .to_string();
        let body = json!({
            "choices": [{"message": {"content": inner}}],
            "usage": {"total_tokens": 1234}
        })
        .to_string();

        let d = parse_completion(&body).expect("parse");
        assert_eq!(d.content.first_principles.len(), 1);
        assert_eq!(d.content.decision_rules.len(), 1);
        assert!(d.content.mental_models.is_empty());
        assert!(d.content.cross_domain_links.is_empty());
        assert_eq!(d.summary.as_deref(), Some("two items"));
        assert_eq!(d.usage.tokens_used, 1234);
    }

    #[test]
    fn parse_completion_without_usage_or_content() {
        let d = parse_completion(r#"{"choices":[]}"#).expect("parse");
        assert_eq!(d.content, CoreLogicContent::default());
        assert_eq!(d.usage.tokens_used, 0);
        assert!(d.summary.is_none());
    }

    #[test]
    fn malformed_model_output_is_a_provider_error() {
        let body = json!({
            "choices": [{"message": {"content": "{\"first_principles\": \"not a list\"}"}}]
        })
        .to_string();
        let err = parse_completion(&body).unwrap_err();
        assert!(matches!(err, CoreLogicError::Provider(_)));

        let err = parse_completion("<html>502</html>").unwrap_err();
        assert!(matches!(err, CoreLogicError::Provider(_)));
    }

    #[test]
    fn endpoint_keeps_base_path() {
        let url = completions_endpoint("https://api.openai.com/v1").unwrap();
        assert_eq!(url.as_str(), "https://api.openai.com/v1/chat/completions");
        let url = completions_endpoint("http://localhost:8080/v1/").unwrap();
        assert_eq!(url.as_str(), "http://localhost:8080/v1/chat/completions");
        assert!(completions_endpoint("::nope").is_err());
    }

    #[test]
    fn options_from_job_config() {
        let opts = DistillOptions::from_job_config(&json!({"model": "gpt-4o", "max_tokens": 2000}))
            .unwrap();
        assert_eq!(opts.model.as_deref(), Some("gpt-4o"));
        assert_eq!(opts.max_tokens, Some(2000));
        assert!(opts.temperature.is_none());

        assert_eq!(
            DistillOptions::from_job_config(&serde_json::Value::Null).unwrap(),
            DistillOptions::default()
        );
        assert!(DistillOptions::from_job_config(&json!({"max_tokens": "lots"})).is_err());
    }

    #[tokio::test]
    async fn empty_snapshot_fails_before_any_request() {
        let distiller = OpenAiDistiller::new(&ProviderConfig::default(), "sk-test").unwrap();
        let err = distiller
            .distill(&ctx(0), None, &DistillOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, CoreLogicError::Provider(_)));
        assert!(err.to_string().contains("no knowledge"));
    }
}
