use rig::client::{completion::CompletionClient, ProviderClient};
use rig::completion::Prompt;
use rig::providers::openai;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::model::{EvidenceId, EvidenceItem, Incident};

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LlmConfig {
    pub provider: String,
    pub model: String,
    pub api_key_env: String,
    pub temperature: f64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: "openai".into(),
            model: "gpt-4o-mini".into(),
            api_key_env: "OPENAI_API_KEY".into(),
            temperature: 0.2,
        }
    }
}

impl LlmConfig {
    /// Enabled only when the configured API key variable is present.
    pub fn from_env() -> Option<Self> {
        let api_key_env =
            std::env::var("LLM_API_KEY_ENV").unwrap_or_else(|_| "OPENAI_API_KEY".into());
        if std::env::var(&api_key_env).is_err() {
            return None;
        }

        let defaults = Self::default();
        Some(Self {
            provider: std::env::var("LLM_PROVIDER").unwrap_or(defaults.provider),
            model: std::env::var("LLM_MODEL").unwrap_or(defaults.model),
            api_key_env,
            temperature: std::env::var("LLM_TEMPERATURE")
                .ok()
                .and_then(|v| v.parse::<f64>().ok())
                .unwrap_or(defaults.temperature),
        })
    }
}

#[derive(Debug, Error)]
pub enum LlmError {
    #[error("unsupported llm provider '{0}'")]
    UnsupportedProvider(String),
    #[error("missing env var {0}")]
    MissingKey(String),
    #[error("llm client error: {0}")]
    Client(String),
    #[error("llm prompt failed: {0}")]
    Prompt(String),
    #[error("invalid llm response: {0}")]
    InvalidResponse(String),
}

/// Reworded hypothesis proposed by the model. Citations must reference
/// evidence ids that were actually offered.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Refinement {
    pub hypothesis: String,
    #[serde(default)]
    pub citations: Vec<EvidenceId>,
}

/// Asks the model to restate the rule-based hypothesis given the evidence.
/// The model only proposes; [`parse_refinement`] validates the citations.
pub async fn refine_hypothesis(
    config: &LlmConfig,
    incident: &Incident,
    evidence: &[EvidenceItem],
    hypothesis: &str,
) -> Result<Refinement, LlmError> {
    let schema = serde_json::to_string(&schemars::schema_for!(Refinement))
        .map_err(|e| LlmError::InvalidResponse(e.to_string()))?;
    let listing: Vec<String> = evidence
        .iter()
        .map(|item| format!("[{}] ({}) {}", item.id, item.source.as_str(), item.summary))
        .collect();
    let prompt = format!(
        "Return JSON only, matching this schema: {schema}\n\
         service={service} severity={severity} alert={title}\n\
         current_hypothesis={hypothesis}\n\
         evidence:\n{listing}",
        service = incident.service,
        severity = incident.severity.map(|s| s.as_str()).unwrap_or("unknown"),
        title = incident.alert.title,
        listing = listing.join("\n"),
    );

    let raw = run_prompt(
        config,
        "You are an incident analyst. Restate the most probable cause in one sentence.",
        &prompt,
    )
    .await?;

    let known: Vec<EvidenceId> = evidence.iter().map(|item| item.id).collect();
    parse_refinement(&raw, &known)
}

async fn run_prompt(config: &LlmConfig, preamble: &str, prompt: &str) -> Result<String, LlmError> {
    if config.provider.to_lowercase() != "openai" {
        return Err(LlmError::UnsupportedProvider(config.provider.clone()));
    }

    let client = if config.api_key_env == "OPENAI_API_KEY" {
        openai::Client::from_env()
    } else {
        let api_key = std::env::var(&config.api_key_env)
            .map_err(|_| LlmError::MissingKey(config.api_key_env.clone()))?;
        openai::Client::new(&api_key).map_err(|e| LlmError::Client(e.to_string()))?
    };

    let agent = client
        .agent(&config.model)
        .preamble(preamble)
        .temperature(config.temperature)
        .build();

    agent
        .prompt(prompt)
        .await
        .map_err(|e| LlmError::Prompt(e.to_string()))
}

/// Parses the model output, keeping only citations that name known evidence.
pub fn parse_refinement(raw: &str, known: &[EvidenceId]) -> Result<Refinement, LlmError> {
    let trimmed = raw
        .trim()
        .trim_start_matches("```json")
        .trim_start_matches("```")
        .trim_end_matches("```")
        .trim();
    let mut refinement: Refinement =
        serde_json::from_str(trimmed).map_err(|e| LlmError::InvalidResponse(e.to_string()))?;
    if refinement.hypothesis.trim().is_empty() {
        return Err(LlmError::InvalidResponse("empty hypothesis".into()));
    }
    refinement.citations.retain(|id| known.contains(id));
    Ok(refinement)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_refinement_drops_unknown_citations() {
        let raw = r#"{"hypothesis":"node failure exhausting DB connections","citations":[3,99]}"#;
        let parsed = parse_refinement(raw, &[3, 4]).expect("parse");
        assert_eq!(parsed.citations, vec![3]);
    }

    #[test]
    fn parse_refinement_accepts_fenced_json() {
        let raw = "```json\n{\"hypothesis\":\"bad deploy\"}\n```";
        let parsed = parse_refinement(raw, &[]).expect("parse");
        assert_eq!(parsed.hypothesis, "bad deploy");
        assert!(parsed.citations.is_empty());
    }

    #[test]
    fn parse_refinement_rejects_blank_hypothesis() {
        assert!(parse_refinement(r#"{"hypothesis":"  "}"#, &[]).is_err());
    }

    // Runs on a single-threaded runtime with no blocking pool in play, so the
    // prompt path must be plain async all the way down.
    #[tokio::test(flavor = "current_thread")]
    async fn refinement_runs_on_the_caller_runtime() {
        let incident = crate::incidents::tests::sample_incident("PD-1");

        let unsupported = LlmConfig {
            provider: "anthropic".into(),
            ..LlmConfig::default()
        };
        let err = refine_hypothesis(&unsupported, &incident, &[], "node failure")
            .await
            .expect_err("unsupported provider");
        assert!(matches!(err, LlmError::UnsupportedProvider(p) if p == "anthropic"));

        let missing_key = LlmConfig {
            api_key_env: "ACK_TEST_KEY_THAT_IS_NEVER_SET".into(),
            ..LlmConfig::default()
        };
        let err = tokio::time::timeout(
            std::time::Duration::from_secs(5),
            refine_hypothesis(&missing_key, &incident, &[], "node failure"),
        )
        .await
        .expect("returns without blocking")
        .expect_err("missing key");
        assert!(matches!(err, LlmError::MissingKey(_)));
    }
}
