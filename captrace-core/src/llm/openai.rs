use std::time::Duration;

use async_openai::{
    config::OpenAIConfig,
    error::OpenAIError,
    types::{
        ChatCompletionRequestSystemMessageArgs, ChatCompletionRequestUserMessageArgs,
        CreateChatCompletionRequestArgs, ResponseFormat,
    },
    Client,
};
use async_trait::async_trait;
use tracing::{debug, warn};

use captrace_model::DocType;

use super::{
    render_table, truncate_chars, Classification, FieldExtractionRequest, LlmClient,
    LlmError, MAX_PROMPT_TABLES, MAX_PROMPT_TEXT,
};

const CLASSIFY_SYSTEM_PROMPT: &str = "\
You are a document classifier for private-equity reporting. Classify the \
document into exactly one of: capital_account_statement, capital_call_notice, \
distribution_notice, quarterly_report, annual_report, subscription, lpa, ppm, \
other. Respond with a JSON object: {\"document_type\": string, \
\"confidence_score\": number between 0.0 and 1.0}. Be conservative: when \
uncertain, answer \"other\" with a low confidence.";

const EXTRACT_SYSTEM_PROMPT: &str = "\
You extract structured financial fields from private-equity documents. \
Respond with a single JSON object keyed by field name. Monetary values must \
be plain numbers without thousands separators, dates must be ISO \
(YYYY-MM-DD), currency codes must be ISO-4217. Omit any field the document \
does not state; never guess.";

/// Production [`LlmClient`] backed by the OpenAI chat completions API.
pub struct OpenAiLlm {
    client: Client<OpenAIConfig>,
    model: String,
    classify_timeout: Duration,
    extract_timeout: Duration,
}

impl std::fmt::Debug for OpenAiLlm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenAiLlm")
            .field("model", &self.model)
            .finish()
    }
}

impl OpenAiLlm {
    /// API key comes from `OPENAI_API_KEY` in the environment.
    pub fn from_env(
        model: impl Into<String>,
        classify_timeout: Duration,
        extract_timeout: Duration,
    ) -> Self {
        Self {
            client: Client::new(),
            model: model.into(),
            classify_timeout,
            extract_timeout,
        }
    }

    pub fn with_api_key(
        api_key: impl Into<String>,
        model: impl Into<String>,
        classify_timeout: Duration,
        extract_timeout: Duration,
    ) -> Self {
        let config = OpenAIConfig::new().with_api_key(api_key.into());
        Self {
            client: Client::with_config(config),
            model: model.into(),
            classify_timeout,
            extract_timeout,
        }
    }

    async fn chat_json(
        &self,
        system: &str,
        user: String,
        deadline: Duration,
    ) -> Result<serde_json::Value, LlmError> {
        let request = CreateChatCompletionRequestArgs::default()
            .model(self.model.clone())
            .temperature(0.1)
            .response_format(ResponseFormat::JsonObject)
            .messages([
                ChatCompletionRequestSystemMessageArgs::default()
                    .content(system)
                    .build()
                    .map_err(map_openai_err)?
                    .into(),
                ChatCompletionRequestUserMessageArgs::default()
                    .content(user)
                    .build()
                    .map_err(map_openai_err)?
                    .into(),
            ])
            .build()
            .map_err(map_openai_err)?;

        let response = tokio::time::timeout(deadline, self.client.chat().create(request))
            .await
            .map_err(|_| LlmError::Transient(format!("llm call exceeded {deadline:?}")))?
            .map_err(map_openai_err)?;

        let content = response
            .choices
            .first()
            .and_then(|choice| choice.message.content.clone())
            .ok_or_else(|| LlmError::Invalid("empty completion".into()))?;

        serde_json::from_str(&content)
            .map_err(|e| LlmError::Invalid(format!("completion is not JSON: {e}")))
    }
}

#[async_trait]
impl LlmClient for OpenAiLlm {
    async fn classify(
        &self,
        text: &str,
        filename: &str,
    ) -> Result<Classification, LlmError> {
        let excerpt = truncate_chars(text, MAX_PROMPT_TEXT);
        let user = format!("Filename: {filename}\n\nDocument text:\n{excerpt}");
        let value = self
            .chat_json(CLASSIFY_SYSTEM_PROMPT, user, self.classify_timeout)
            .await?;

        let raw_type = value
            .get("document_type")
            .and_then(|v| v.as_str())
            .ok_or_else(|| LlmError::Invalid("missing document_type".into()))?;
        let doc_type = DocType::parse(raw_type).unwrap_or_else(|| {
            warn!(raw_type, "unknown document_type from provider; using other");
            DocType::Other
        });
        let confidence = value
            .get("confidence_score")
            .and_then(|v| v.as_f64())
            .unwrap_or(0.0)
            .clamp(0.0, 1.0);

        debug!(doc_type = %doc_type, confidence, "llm classification");
        Ok(Classification {
            doc_type,
            confidence,
        })
    }

    async fn extract_fields(
        &self,
        request: &FieldExtractionRequest,
    ) -> Result<serde_json::Map<String, serde_json::Value>, LlmError> {
        let mut user = format!(
            "Document type: {}\nFilename: {}\n\nFields to extract:\n",
            request.doc_type, request.filename
        );
        for field in &request.fields {
            user.push_str(&format!(
                "- {} (labels seen in the wild: {})\n",
                field.name,
                field.hints.join(", ")
            ));
        }
        for (idx, table) in request.tables.iter().take(MAX_PROMPT_TABLES).enumerate() {
            user.push_str(&format!("\nTable {}:\n{}", idx + 1, render_table(table)));
        }
        user.push_str("\nDocument text:\n");
        user.push_str(truncate_chars(&request.text_excerpt, MAX_PROMPT_TEXT));

        let value = self
            .chat_json(EXTRACT_SYSTEM_PROMPT, user, self.extract_timeout)
            .await?;
        match value {
            serde_json::Value::Object(map) => Ok(map),
            other => Err(LlmError::Invalid(format!(
                "expected a JSON object, got {other}"
            ))),
        }
    }
}

fn map_openai_err(err: OpenAIError) -> LlmError {
    match err {
        OpenAIError::ApiError(api) => {
            let kind = api.r#type.clone().unwrap_or_default();
            let message = api.message.clone();
            if kind.contains("rate_limit") || message.to_lowercase().contains("rate limit")
            {
                LlmError::RateLimited
            } else if kind.contains("server_error")
                || kind.contains("overloaded")
                || kind.contains("timeout")
            {
                LlmError::Transient(message)
            } else {
                LlmError::Invalid(message)
            }
        }
        OpenAIError::Reqwest(e) => LlmError::Transient(e.to_string()),
        OpenAIError::JSONDeserialize(e) => LlmError::Transient(e.to_string()),
        other => LlmError::Invalid(other.to_string()),
    }
}
