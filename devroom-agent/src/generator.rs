//! Prompt → [`Directive`].
//!
//! The model's text is parsed strictly. Anything that is not a Directive
//! fails the turn with [`UpstreamError`]; there is no repair pass.

use std::sync::Arc;
use std::time::Instant;

use devroom_sdk::{CommandSpec, Directive, TreeError};

use crate::llm::{GenerationRequest, GenerativeModel};
use crate::persona::PersonaConfig;

#[derive(Debug, thiserror::Error)]
pub enum UpstreamError {
    #[error("model request failed: {0}")]
    Request(String),
    #[error("model returned HTTP {status}: {body}")]
    Status { status: u16, body: String },
    #[error("model returned no text")]
    EmptyResponse,
    #[error("model output is not valid JSON: {0}")]
    Malformed(#[source] serde_json::Error),
    #[error("model output does not match the directive schema: {0}")]
    Schema(String),
    #[error("no model configured")]
    NotConfigured,
}

pub struct DirectiveGenerator {
    model: Arc<dyn GenerativeModel>,
    persona: PersonaConfig,
}

impl DirectiveGenerator {
    pub fn new(model: Arc<dyn GenerativeModel>, persona: PersonaConfig) -> Self {
        Self { model, persona }
    }

    pub fn persona(&self) -> &PersonaConfig {
        &self.persona
    }

    /// Ask the model and parse its answer into a directive.
    ///
    /// Latency is unbounded and identical prompts may yield different
    /// directives.
    pub async fn generate(&self, prompt: &str) -> Result<Directive, UpstreamError> {
        let request = GenerationRequest {
            model: self.persona.model.clone(),
            system_instruction: self.persona.system_instruction.clone(),
            prompt: prompt.to_string(),
            temperature: self.persona.temperature,
            response_mime_type: self.persona.response_mime_type.clone(),
        };

        let started = Instant::now();
        let text = self.model.generate(&request).await?;
        tracing::debug!(
            model = %self.persona.model,
            elapsed_ms = started.elapsed().as_millis() as u64,
            bytes = text.len(),
            "Model answered"
        );

        parse_directive(&text)
    }
}

/// Parse and validate raw model output.
pub fn parse_directive(text: &str) -> Result<Directive, UpstreamError> {
    let value: serde_json::Value =
        serde_json::from_str(text.trim()).map_err(UpstreamError::Malformed)?;
    let directive: Directive =
        serde_json::from_value(value).map_err(|e| UpstreamError::Schema(e.to_string()))?;
    validate(&directive)?;
    Ok(directive)
}

fn validate(directive: &Directive) -> Result<(), UpstreamError> {
    if directive.text.trim().is_empty() {
        return Err(UpstreamError::Schema("empty text".to_string()));
    }
    if let Some(tree) = &directive.file_tree {
        tree.validate()
            .map_err(|e: TreeError| UpstreamError::Schema(e.to_string()))?;
    }
    for (name, command) in [
        ("buildCommand", &directive.build_command),
        ("startCommand", &directive.start_command),
    ] {
        if let Some(CommandSpec { executable, .. }) = command
            && executable.trim().is_empty()
        {
            return Err(UpstreamError::Schema(format!("{name} has an empty mainItem")));
        }
    }
    Ok(())
}

/// A model that always fails; used when no API key is configured.
pub struct UnconfiguredModel;

#[async_trait::async_trait]
impl GenerativeModel for UnconfiguredModel {
    async fn generate(&self, _request: &GenerationRequest) -> Result<String, UpstreamError> {
        Err(UpstreamError::NotConfigured)
    }
}
