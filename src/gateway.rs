//! The LLM Gateway: a single `call_llm` entry point used by
//! every stage and the Reflection Engine. Hides provider selection,
//! primary/secondary/tertiary failover, exponential backoff on
//! transport-class errors, and decision caching behind one call.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::sleep;
use tracing::{debug, instrument, warn};

use crate::cache::decision_cache::{CachedDecision, LlmDecisionCache};
use crate::config::{PipelineConfig, ProviderConfig};
use crate::error::{Error, Result};
use crate::llm::{AnthropicClient, ChatMessage, ClientConfig, CompletionRequest, LLMClient, OpenAIClient, Provider};
#[cfg(feature = "gemini")]
use crate::llm::GoogleClient;

/// One configured provider tier: a client plus the model name to request.
struct Tier {
    label: &'static str,
    model: String,
    client: Arc<dyn LLMClient>,
}

fn provider_for_model(model: &str) -> Provider {
    let lower = model.to_lowercase();
    if lower.contains("claude") {
        Provider::Anthropic
    } else if lower.contains("gemini") {
        #[cfg(feature = "gemini")]
        {
            Provider::Google
        }
        #[cfg(not(feature = "gemini"))]
        {
            Provider::OpenAI
        }
    } else {
        Provider::OpenAI
    }
}

fn build_client(cfg: &ProviderConfig, timeout_secs: u64) -> Arc<dyn LLMClient> {
    let mut client_config = ClientConfig::new(cfg.api_key.clone())
        .with_default_model(cfg.model.clone())
        .with_timeout(timeout_secs);
    if let Some(base_url) = &cfg.base_url {
        client_config = client_config.with_base_url(base_url.clone());
    }

    match provider_for_model(&cfg.model) {
        Provider::Anthropic => Arc::new(AnthropicClient::new(client_config)),
        #[cfg(feature = "gemini")]
        Provider::Google => Arc::new(GoogleClient::new(client_config)),
        _ => Arc::new(OpenAIClient::new(client_config)),
    }
}

/// Uniform LLM access point for the whole pipeline.
pub struct LlmGateway {
    tiers: Vec<Tier>,
    decision_cache: Arc<LlmDecisionCache>,
    max_retries: u32,
    backoff_base: Duration,
    backoff_max: Duration,
}

impl LlmGateway {
    pub fn new(config: &PipelineConfig, decision_cache: Arc<LlmDecisionCache>) -> Self {
        let timeout_secs = config.timeout.as_secs();
        let mut tiers = vec![Tier {
            label: "primary",
            model: config.primary.model.clone(),
            client: build_client(&config.primary, timeout_secs),
        }];
        if let Some(secondary) = &config.secondary {
            tiers.push(Tier {
                label: "secondary",
                model: secondary.model.clone(),
                client: build_client(secondary, timeout_secs),
            });
        }
        if let Some(tertiary) = &config.tertiary {
            tiers.push(Tier {
                label: "tertiary",
                model: tertiary.model.clone(),
                client: build_client(tertiary, timeout_secs),
            });
        }

        Self {
            tiers,
            decision_cache,
            max_retries: config.max_retries,
            backoff_base: config.backoff_base,
            backoff_max: config.backoff_max,
        }
    }

    /// Call the LLM on behalf of `stage`. Tries each provider tier in
    /// order; within a tier, retries transport-class errors with
    /// exponential backoff capped at `backoff_max`, then moves to the
    /// next tier. Surfaces [`Error::LlmExhausted`] only once every tier's
    /// retry budget is spent.
    #[instrument(skip(self, prompt), fields(stage = %stage, json_mode, max_tokens))]
    pub async fn call_llm(
        &self,
        stage: &str,
        prompt: &str,
        json_mode: bool,
        max_tokens: u32,
        temperature: f64,
    ) -> Result<String> {
        if self.tiers.is_empty() {
            return Err(Error::config("no LLM provider tiers configured"));
        }

        let mut last_error = String::new();

        for tier in &self.tiers {
            if let Some(cached) = self.decision_cache.get(prompt, &tier.model) {
                debug!(tier = tier.label, model = %tier.model, "llm decision cache hit");
                return Ok(cached.raw_response);
            }

            let mut attempt = 0u32;
            loop {
                let request = CompletionRequest {
                    model: Some(tier.model.clone()),
                    system: if json_mode {
                        Some("Respond with valid JSON only, no surrounding prose.".to_string())
                    } else {
                        None
                    },
                    messages: vec![ChatMessage::user(prompt)],
                    max_tokens: Some(max_tokens),
                    temperature: Some(temperature),
                    stop: None,
                    enable_caching: false,
                    metadata: None,
                };

                match tier.client.complete(request).await {
                    Ok(response) => {
                        self.decision_cache.set(
                            prompt,
                            &tier.model,
                            CachedDecision {
                                raw_response: response.content.clone(),
                                json_mode,
                                provider: tier.client.provider().to_string(),
                                model: tier.model.clone(),
                            },
                        );
                        return Ok(response.content);
                    }
                    Err(err) => {
                        let message = err.to_string();
                        last_error = message.clone();
                        if attempt >= self.max_retries || !Error::is_retryable(&message) {
                            warn!(tier = tier.label, attempt, %message, "llm tier exhausted, failing over");
                            break;
                        }
                        let backoff = self
                            .backoff_base
                            .saturating_mul(2u32.saturating_pow(attempt))
                            .min(self.backoff_max);
                        debug!(tier = tier.label, attempt, ?backoff, "retrying after transport error");
                        sleep(backoff).await;
                        attempt += 1;
                    }
                }
            }
        }

        Err(Error::llm_exhausted(stage, last_error))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_inferred_from_model_name() {
        assert_eq!(provider_for_model("claude-3-5-sonnet-20241022"), Provider::Anthropic);
        assert_eq!(provider_for_model("gpt-5-mini"), Provider::OpenAI);
    }

    #[tokio::test]
    async fn empty_tier_list_is_a_config_error() {
        let gateway = LlmGateway {
            tiers: vec![],
            decision_cache: Arc::new(
                LlmDecisionCache::open(&std::env::temp_dir().join("gateway_test_empty.json"), "v1").unwrap(),
            ),
            max_retries: 3,
            backoff_base: Duration::from_millis(1),
            backoff_max: Duration::from_millis(5),
        };
        let result = gateway.call_llm("stage2_atomic_decomposition", "prompt", true, 100, 0.0).await;
        assert!(matches!(result, Err(Error::Config(_))));
    }
}
