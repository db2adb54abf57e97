use std::env;
use std::time::Duration;

use anyhow::{anyhow, Result};
use tracing::{debug, warn};
use ultradoc_llm::{ChatClient, Prompt, Provider};

use crate::pipeline::{AnswerOrigin, AskResponse};

pub const DEFAULT_REFINE_TIMEOUT: Duration = Duration::from_millis(15_000);

const REFUSAL_MARKER: &str = "not found in document";

/// Optional rewrite of an already grounded answer.
///
/// Implementations may fail; callers keep the grounded answer when they do.
pub trait Refiner: Send + Sync {
    fn refine(&self, question: &str, grounded_answer: &str) -> Result<String>;
}

/// Refiner backed by a chat model.
pub struct LlmRefiner {
    client: ChatClient,
    timeout: Duration,
}

impl LlmRefiner {
    pub fn new(client: ChatClient, timeout: Duration) -> Self {
        Self { client, timeout }
    }

    /// Reads `ULTRADOC_REFINE_PROVIDER`, `ULTRADOC_REFINE_MODEL` and
    /// `ULTRADOC_REFINE_TIMEOUT_MS`. No provider means no refiner.
    pub fn from_env() -> Result<Option<Self>> {
        let Ok(name) = env::var("ULTRADOC_REFINE_PROVIDER") else {
            return Ok(None);
        };
        if name.trim().is_empty() {
            return Ok(None);
        }
        let provider = Provider::parse(&name)
            .ok_or_else(|| anyhow!("unknown refine provider {name}"))?;
        let model = env::var("ULTRADOC_REFINE_MODEL")
            .unwrap_or_else(|_| provider.default_model().to_string());
        let timeout = env::var("ULTRADOC_REFINE_TIMEOUT_MS")
            .ok()
            .and_then(|value| value.trim().parse().ok())
            .map(Duration::from_millis)
            .unwrap_or(DEFAULT_REFINE_TIMEOUT);
        let client = ChatClient::new(provider, model, timeout)?;
        Ok(Some(Self::new(client, timeout)))
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

impl Refiner for LlmRefiner {
    fn refine(&self, question: &str, grounded_answer: &str) -> Result<String> {
        let prompt = format!(
            "Context from the document:\n\"\"\"\n{grounded_answer}\n\"\"\"\n\nQuestion: {question}\n\nAnswer:"
        );
        debug!(provider = self.client.provider().name(), "refining grounded answer");
        let completion = self.client.complete_blocking(&Prompt {
            system: Some(
                "Answer only from the context. If the context does not contain the answer, reply \"Not found in document.\""
                    .to_string(),
            ),
            user: prompt,
        })?;
        Ok(completion.text)
    }
}

/// Applies `refiner` to an unblocked retrieval answer.
///
/// Structured and refused answers pass through untouched. A failed, empty or
/// refusing rewrite leaves the grounded answer in place.
pub fn refine_answer(refiner: &dyn Refiner, question: &str, response: AskResponse) -> AskResponse {
    if response.blocked || response.origin != AnswerOrigin::Retrieval {
        return response;
    }
    match refiner.refine(question, &response.answer) {
        Ok(text) => {
            let text = text.trim();
            if text.is_empty() || text.to_lowercase().contains(REFUSAL_MARKER) {
                warn!("refiner produced no usable answer, keeping grounded answer");
                return response;
            }
            AskResponse {
                answer: text.to_string(),
                origin: AnswerOrigin::Refined,
                ..response
            }
        }
        Err(err) => {
            warn!(error = %err, "refiner failed, keeping grounded answer");
            response
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::Source;

    struct Fixed(Result<&'static str, &'static str>);

    impl Refiner for Fixed {
        fn refine(&self, _question: &str, _grounded_answer: &str) -> Result<String> {
            self.0.map(str::to_string).map_err(|msg| anyhow!(msg))
        }
    }

    fn grounded() -> AskResponse {
        AskResponse {
            answer: "Loading dock closes at 5pm.".to_string(),
            confidence: 0.7,
            blocked: false,
            block_reason: None,
            sources: vec![Source {
                document_id: Some("notes.txt".to_string()),
                page: Some(1),
                text: "Loading dock closes at 5pm.".to_string(),
            }],
            origin: AnswerOrigin::Retrieval,
        }
    }

    #[test]
    fn usable_rewrite_replaces_answer() {
        let refined = refine_answer(&Fixed(Ok(" The dock closes at 5pm. ")), "q", grounded());
        assert_eq!(refined.answer, "The dock closes at 5pm.");
        assert_eq!(refined.origin, AnswerOrigin::Refined);
        assert_eq!(refined.confidence, 0.7);
        assert_eq!(refined.sources.len(), 1);
    }

    #[test]
    fn failures_fall_back_to_grounded_answer() {
        for refiner in [
            Fixed(Err("timeout")),
            Fixed(Ok("   ")),
            Fixed(Ok("Not found in document.")),
        ] {
            let response = refine_answer(&refiner, "q", grounded());
            assert_eq!(response, grounded());
        }
    }

    #[test]
    fn blocked_and_structured_answers_are_not_rewritten() {
        let mut blocked = AskResponse::refusal(crate::guardrails::BlockReason::LowCoverage);
        blocked = refine_answer(&Fixed(Ok("invented")), "q", blocked);
        assert_eq!(blocked.answer, "Not found in document.");

        let structured = AskResponse {
            origin: AnswerOrigin::StructuredField,
            ..grounded()
        };
        let kept = refine_answer(&Fixed(Ok("invented")), "q", structured.clone());
        assert_eq!(kept, structured);
    }

    #[test]
    fn local_refiner_echoes_grounded_answer() {
        let client = ChatClient::new(Provider::Local, "local", Duration::from_secs(1)).unwrap();
        let refiner = LlmRefiner::new(client, Duration::from_secs(1));
        let text = refiner
            .refine("When does the dock close?", "Loading dock closes at 5pm.")
            .unwrap();
        assert_eq!(text, "Loading dock closes at 5pm.");
    }
}
