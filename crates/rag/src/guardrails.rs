use std::collections::HashSet;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::confidence::ConfidenceScorer;
use crate::error::{RagError, Result};

static WORD_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\w+").expect("valid regex"));
static NUMBER_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\d[\d,]*(?:\.\d+)?").expect("valid regex"));

const STOP_WORDS: &[&str] = &[
    "a", "an", "the", "is", "are", "was", "were", "be", "been", "being", "have", "has", "had",
    "do", "does", "did", "will", "would", "could", "should", "may", "might", "shall", "can",
    "need", "dare", "ought", "and", "but", "or", "nor", "not", "so", "yet", "both", "either",
    "neither", "each", "every", "all", "any", "few", "more", "most", "other", "some", "such",
    "no", "only", "own", "same", "than", "too", "very", "just", "because", "as", "until",
    "while", "of", "at", "by", "for", "with", "about", "against", "between", "through",
    "during", "before", "after", "above", "below", "to", "from", "up", "down", "in", "out",
    "on", "off", "over", "under", "again", "further", "then", "once", "here", "there", "when",
    "where", "why", "how", "what", "which", "who", "whom", "this", "that", "these", "those",
    "i", "me", "my", "myself", "we", "our", "ours", "ourselves", "you", "your", "yours",
    "yourself", "he", "him", "his", "himself", "she", "her", "hers", "herself", "it", "its",
    "itself", "they", "them", "their", "theirs", "themselves", "many", "much", "tell", "give",
    "show", "find", "get", "list", "describe",
];

static STOP_SET: Lazy<HashSet<&'static str>> = Lazy::new(|| STOP_WORDS.iter().copied().collect());

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GuardrailConfig {
    /// Squared L2 distance at which retrieval stops counting as evidence.
    pub max_distance: f32,
    /// Share of question content words that must occur in the retrieved text.
    pub coverage_min: f32,
    pub financial_keywords: Vec<String>,
    pub currency_tokens: Vec<String>,
    pub rate_terms: Vec<String>,
    pub rate_proximity_chars: usize,
}

impl Default for GuardrailConfig {
    fn default() -> Self {
        Self {
            max_distance: 1.5,
            coverage_min: 0.2,
            financial_keywords: strings(&["ifsc", "swift", "iban", "routing"]),
            currency_tokens: strings(&["$", "€", "£", "₹", "usd", "inr", "eur", "gbp", "cad"]),
            rate_terms: strings(&["rate", "charge", "cost", "amount"]),
            rate_proximity_chars: 24,
        }
    }
}

fn strings(values: &[&str]) -> Vec<String> {
    values.iter().map(|value| value.to_string()).collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockReason {
    LowRetrieval,
    MissingFinancialId,
    LowCoverage,
    UnsupportedRate,
}

impl BlockReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            BlockReason::LowRetrieval => "low_retrieval",
            BlockReason::MissingFinancialId => "missing_financial_id",
            BlockReason::LowCoverage => "low_coverage",
            BlockReason::UnsupportedRate => "unsupported_rate",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Guardrail {
    StrongRetrieval,
    KeywordIntent,
    QuestionCoverage,
    RateEvidence,
}

impl Guardrail {
    /// Evaluation order; the first rail that blocks decides the reason.
    pub const ORDER: [Guardrail; 4] = [
        Guardrail::StrongRetrieval,
        Guardrail::KeywordIntent,
        Guardrail::QuestionCoverage,
        Guardrail::RateEvidence,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Guardrail::StrongRetrieval => "strong_retrieval",
            Guardrail::KeywordIntent => "keyword_intent",
            Guardrail::QuestionCoverage => "question_coverage",
            Guardrail::RateEvidence => "rate_evidence",
        }
    }

    pub fn block_reason(&self) -> BlockReason {
        match self {
            Guardrail::StrongRetrieval => BlockReason::LowRetrieval,
            Guardrail::KeywordIntent => BlockReason::MissingFinancialId,
            Guardrail::QuestionCoverage => BlockReason::LowCoverage,
            Guardrail::RateEvidence => BlockReason::UnsupportedRate,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuardrailVerdict {
    pub allowed: bool,
    pub reason: Option<BlockReason>,
}

impl GuardrailVerdict {
    pub fn allow() -> Self {
        Self {
            allowed: true,
            reason: None,
        }
    }

    pub fn block(reason: BlockReason) -> Self {
        Self {
            allowed: false,
            reason: Some(reason),
        }
    }
}

/// What the rails get to look at for one question.
#[derive(Debug, Clone, Copy)]
pub struct Evidence<'a> {
    pub question: &'a str,
    /// Distance of the nearest live chunk, `None` when nothing was retrieved.
    pub best_distance: Option<f32>,
    /// Text of the leading chunks joined by newlines.
    pub retrieved_text: &'a str,
}

#[derive(Debug, Clone)]
pub struct Guardrails {
    config: GuardrailConfig,
    scorer: ConfidenceScorer,
    currency_re: Option<Regex>,
}

impl Guardrails {
    pub fn new(config: GuardrailConfig) -> Result<Self> {
        let currency_re = currency_regex(&config.currency_tokens)?;
        Ok(Self {
            scorer: ConfidenceScorer::new(config.max_distance),
            config,
            currency_re,
        })
    }

    pub fn config(&self) -> &GuardrailConfig {
        &self.config
    }

    pub fn scorer(&self) -> ConfidenceScorer {
        self.scorer
    }

    /// Runs every rail in [`Guardrail::ORDER`] and stops at the first block.
    pub fn evaluate(&self, evidence: &Evidence<'_>) -> GuardrailVerdict {
        for rail in Guardrail::ORDER {
            if !self.check(rail, evidence) {
                debug!(rail = rail.name(), question = evidence.question, "guardrail blocked answer");
                return GuardrailVerdict::block(rail.block_reason());
            }
        }
        GuardrailVerdict::allow()
    }

    /// True when `rail` lets the answer through.
    pub fn check(&self, rail: Guardrail, evidence: &Evidence<'_>) -> bool {
        match rail {
            Guardrail::StrongRetrieval => self.scorer.score_best(evidence.best_distance) > 0.0,
            Guardrail::KeywordIntent => self.keyword_intent(evidence),
            Guardrail::QuestionCoverage => self.question_coverage(evidence),
            Guardrail::RateEvidence => self.rate_evidence(evidence),
        }
    }

    fn keyword_intent(&self, evidence: &Evidence<'_>) -> bool {
        let question = evidence.question.to_lowercase();
        let text = evidence.retrieved_text.to_lowercase();
        let asked: Vec<&str> = self
            .config
            .financial_keywords
            .iter()
            .map(|keyword| keyword.as_str())
            .filter(|keyword| question.contains(&keyword.to_lowercase()))
            .collect();
        asked.is_empty() || asked.iter().any(|keyword| text.contains(&keyword.to_lowercase()))
    }

    fn question_coverage(&self, evidence: &Evidence<'_>) -> bool {
        let words = content_words(evidence.question);
        if words.is_empty() {
            return true;
        }
        let text = evidence.retrieved_text.to_lowercase();
        let available: HashSet<&str> = WORD_RE.find_iter(&text).map(|m| m.as_str()).collect();
        let matched = words
            .iter()
            .filter(|word| available.contains(word.as_str()))
            .count();
        matched as f32 / words.len() as f32 >= self.config.coverage_min
    }

    fn rate_evidence(&self, evidence: &Evidence<'_>) -> bool {
        if !self.asks_about_rate(evidence.question) {
            return true;
        }
        let Some(currency_re) = &self.currency_re else {
            return false;
        };
        let text = evidence.retrieved_text.to_lowercase();
        let currencies: Vec<(usize, usize)> = currency_re
            .find_iter(&text)
            .map(|m| (m.start(), m.end()))
            .collect();
        NUMBER_RE.find_iter(&text).any(|number| {
            currencies.iter().any(|&(start, end)| {
                char_gap(&text, (number.start(), number.end()), (start, end))
                    <= self.config.rate_proximity_chars
            })
        })
    }

    fn asks_about_rate(&self, question: &str) -> bool {
        let question = question.to_lowercase();
        WORD_RE.find_iter(&question).any(|word| {
            self.config
                .rate_terms
                .iter()
                .any(|term| word.as_str().starts_with(&term.to_lowercase()))
        })
    }
}

/// Lowercased question words longer than one character that are not stop words.
pub fn content_words(question: &str) -> Vec<String> {
    let lowered = question.to_lowercase();
    WORD_RE
        .find_iter(&lowered)
        .map(|m| m.as_str())
        .filter(|word| word.chars().count() > 1 && !STOP_SET.contains(word))
        .map(str::to_string)
        .collect()
}

fn currency_regex(tokens: &[String]) -> Result<Option<Regex>> {
    let alternatives: Vec<String> = tokens
        .iter()
        .filter(|token| !token.is_empty())
        .map(|token| {
            let escaped = regex::escape(&token.to_lowercase());
            if token.chars().all(char::is_alphanumeric) {
                format!(r"\b{escaped}\b")
            } else {
                escaped
            }
        })
        .collect();
    if alternatives.is_empty() {
        return Ok(None);
    }
    Regex::new(&alternatives.join("|"))
        .map(Some)
        .map_err(|err| RagError::Config(format!("currency tokens: {err}")))
}

/// Characters strictly between two byte spans, zero when they touch or overlap.
fn char_gap(text: &str, a: (usize, usize), b: (usize, usize)) -> usize {
    let (first, second) = if a.0 <= b.0 { (a, b) } else { (b, a) };
    if second.0 <= first.1 {
        return 0;
    }
    text[first.1..second.0].chars().count()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rails() -> Guardrails {
        Guardrails::new(GuardrailConfig::default()).unwrap()
    }

    fn evidence<'a>(question: &'a str, distance: Option<f32>, text: &'a str) -> Evidence<'a> {
        Evidence {
            question,
            best_distance: distance,
            retrieved_text: text,
        }
    }

    #[test]
    fn strong_retrieval_agrees_with_confidence() {
        let rails = rails();
        let text = "Carrier Rate: 2500 USD";
        assert!(rails.check(Guardrail::StrongRetrieval, &evidence("q", Some(1.49), text)));
        assert!(!rails.check(Guardrail::StrongRetrieval, &evidence("q", Some(1.5), text)));
        assert!(!rails.check(Guardrail::StrongRetrieval, &evidence("q", None, "")));
        for distance in [0.0f32, 0.4, 1.0, 1.49, 1.5, 1.8, 3.0] {
            let passes = rails.check(Guardrail::StrongRetrieval, &evidence("q", Some(distance), text));
            assert_eq!(passes, rails.scorer().score(distance) > 0.0);
        }
    }

    #[test]
    fn retrieval_fires_before_keyword_intent() {
        let verdict = rails().evaluate(&evidence(
            "What is the IBAN for payment?",
            Some(2.0),
            "Shipper: Acme Corp",
        ));
        assert_eq!(verdict, GuardrailVerdict::block(BlockReason::LowRetrieval));
    }

    #[test]
    fn keyword_intent_needs_the_identifier_in_text() {
        let rails = rails();
        let blocked = rails.evaluate(&evidence(
            "What is the IBAN of the shipper?",
            Some(0.5),
            "Shipper: Acme Corp, bank details on request",
        ));
        assert_eq!(blocked.reason, Some(BlockReason::MissingFinancialId));

        let allowed = rails.check(
            Guardrail::KeywordIntent,
            &evidence("Shipper IBAN?", Some(0.5), "IBAN: DE89 3704 0044"),
        );
        assert!(allowed);
        assert!(rails.check(
            Guardrail::KeywordIntent,
            &evidence("Who is the shipper?", Some(0.5), "nothing"),
        ));
    }

    #[test]
    fn coverage_counts_content_words() {
        let rails = rails();
        assert_eq!(content_words("What is the carrier rate?"), vec!["carrier", "rate"]);
        assert!(content_words("What is it?").is_empty());

        assert!(rails.check(
            Guardrail::QuestionCoverage,
            &evidence("What is it?", Some(0.5), "anything"),
        ));
        assert!(rails.check(
            Guardrail::QuestionCoverage,
            &evidence("Who is the shipper of this load?", Some(0.5), "Shipper: Acme"),
        ));
        assert!(!rails.check(
            Guardrail::QuestionCoverage,
            &evidence("What is the carrier rate?", Some(0.5), "Shipper: Acme Corp"),
        ));
        // exact tokens only: "rates" does not cover "rate"
        assert!(!rails.check(
            Guardrail::QuestionCoverage,
            &evidence("rate", Some(0.5), "rates apply"),
        ));
    }

    #[test]
    fn rate_needs_number_and_currency_close_together() {
        let rails = rails();
        let ask = "What is the carrier rate?";
        assert!(rails.check(Guardrail::RateEvidence, &evidence(ask, Some(0.5), "Carrier Rate: 2500 USD")));
        assert!(rails.check(Guardrail::RateEvidence, &evidence(ask, Some(0.5), "Total: $1,250.00")));
        assert!(!rails.check(Guardrail::RateEvidence, &evidence(ask, Some(0.5), "Carrier Rate: 2500")));
        assert!(!rails.check(Guardrail::RateEvidence, &evidence(ask, Some(0.5), "Rate in USD, see annex")));
        let far = format!("2500 {} USD", "x".repeat(40));
        assert!(!rails.check(Guardrail::RateEvidence, &evidence(ask, Some(0.5), &far)));
        // "usd" inside another word is not a currency
        assert!(!rails.check(Guardrail::RateEvidence, &evidence(ask, Some(0.5), "2500 usdollars")));
    }

    #[test]
    fn rate_rail_ignores_other_questions() {
        let rails = rails();
        assert!(rails.check(
            Guardrail::RateEvidence,
            &evidence("Who is the consignee?", Some(0.5), "Consignee: Beta LLC"),
        ));
        assert!(rails.check(
            Guardrail::RateEvidence,
            &evidence("Are there extra charges?", Some(0.5), "Detention charges: 75 USD per hour"),
        ));
    }

    #[test]
    fn grounded_rate_answer_passes_every_rail() {
        let verdict = rails().evaluate(&evidence(
            "What is the carrier rate?",
            Some(0.45),
            "Carrier Rate: 2500 USD\nShipment ID: SH-12345",
        ));
        assert_eq!(verdict, GuardrailVerdict::allow());
    }

    #[test]
    fn unsupported_rate_is_the_last_rail() {
        let verdict = rails().evaluate(&evidence(
            "What is the carrier rate?",
            Some(0.45),
            "Carrier rate to be confirmed with dispatch",
        ));
        assert_eq!(verdict.reason, Some(BlockReason::UnsupportedRate));
    }
}
