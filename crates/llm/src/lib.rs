//! Minimal chat-completion client used to rephrase grounded answers.
//!
//! Two hosted backends are supported plus an offline `local` backend that
//! never leaves the process. Every call is bounded by the timeout given at
//! construction.

use std::env;
use std::future::Future;

use anyhow::{anyhow, bail, Context, Result};
use reqwest::{header::HeaderValue, Client, RequestBuilder, Response, StatusCode};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tokio::time::{sleep, Duration};
use tracing::{debug, warn};

const RATE_LIMIT_RETRIES: usize = 2;
const ANTHROPIC_URL: &str = "https://api.anthropic.com/v1/messages";
const ANTHROPIC_VERSION: &str = "2023-06-01";
const LOCAL_CONTEXT_MARKER: &str = "Context from the document:";
const LOCAL_STOP_MARKER: &str = "Question:";
const LOCAL_MAX_WORDS: usize = 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provider {
    OpenAi,
    Anthropic,
    Local,
}

impl Provider {
    pub fn name(self) -> &'static str {
        match self {
            Provider::OpenAi => "openai",
            Provider::Anthropic => "anthropic",
            Provider::Local => "local",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        [Provider::OpenAi, Provider::Anthropic, Provider::Local]
            .into_iter()
            .find(|provider| value.trim().eq_ignore_ascii_case(provider.name()))
    }

    pub fn default_model(self) -> &'static str {
        match self {
            Provider::OpenAi => "gpt-4o-mini",
            Provider::Anthropic => "claude-3-5-haiku-latest",
            Provider::Local => "local",
        }
    }
}

/// One single-turn exchange.
#[derive(Debug, Clone, Default)]
pub struct Prompt {
    pub system: Option<String>,
    pub user: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Completion {
    pub text: String,
    pub input_tokens: u32,
    pub output_tokens: u32,
}

enum Backend {
    OpenAi { key: String, endpoint: String },
    Anthropic { key: String, max_tokens: u32 },
    Local,
}

pub struct ChatClient {
    http: Client,
    model: String,
    backend: Backend,
}

impl ChatClient {
    /// Credentials come from `OPENAI_API_KEY` / `ANTHROPIC_API_KEY`;
    /// `OPENAI_BASE_URL` and `ANTHROPIC_MAX_TOKENS` are optional.
    pub fn new(provider: Provider, model: impl Into<String>, timeout: Duration) -> Result<Self> {
        let backend = match provider {
            Provider::OpenAi => {
                let base = env::var("OPENAI_BASE_URL")
                    .unwrap_or_else(|_| "https://api.openai.com/v1".to_string());
                Backend::OpenAi {
                    key: required_env("OPENAI_API_KEY")?,
                    endpoint: format!("{}/chat/completions", base.trim_end_matches('/')),
                }
            }
            Provider::Anthropic => Backend::Anthropic {
                key: required_env("ANTHROPIC_API_KEY")?,
                max_tokens: match env::var("ANTHROPIC_MAX_TOKENS") {
                    Ok(raw) => raw
                        .trim()
                        .parse()
                        .with_context(|| format!("ANTHROPIC_MAX_TOKENS={raw} is not a number"))?,
                    Err(_) => 512,
                },
            },
            Provider::Local => Backend::Local,
        };
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build http client")?;
        Ok(Self {
            http,
            model: model.into(),
            backend,
        })
    }

    pub fn provider(&self) -> Provider {
        match self.backend {
            Backend::OpenAi { .. } => Provider::OpenAi,
            Backend::Anthropic { .. } => Provider::Anthropic,
            Backend::Local => Provider::Local,
        }
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub async fn complete(&self, prompt: &Prompt) -> Result<Completion> {
        debug!(provider = self.provider().name(), model = %self.model, "chat completion");
        match &self.backend {
            Backend::OpenAi { key, endpoint } => self.complete_openai(key, endpoint, prompt).await,
            Backend::Anthropic { key, max_tokens } => {
                self.complete_anthropic(key, *max_tokens, prompt).await
            }
            Backend::Local => Ok(complete_local(prompt)),
        }
    }

    /// Runs [`ChatClient::complete`] on a private current-thread runtime.
    /// Must not be called from inside an async task.
    pub fn complete_blocking(&self, prompt: &Prompt) -> Result<Completion> {
        tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .context("failed to start chat runtime")?
            .block_on(self.complete(prompt))
    }

    async fn complete_openai(&self, key: &str, endpoint: &str, prompt: &Prompt) -> Result<Completion> {
        let mut messages = Vec::with_capacity(2);
        if let Some(system) = prompt.system.as_deref() {
            messages.push(WireMessage { role: "system", content: system });
        }
        messages.push(WireMessage { role: "user", content: &prompt.user });
        let body = OpenAiRequest {
            model: &self.model,
            messages,
            temperature: 0.0,
        };
        let reply: OpenAiReply = send_json("openai", || {
            self.http.post(endpoint).bearer_auth(key).json(&body)
        })
        .await?;
        let text = reply
            .choices
            .into_iter()
            .find_map(|choice| choice.message.content)
            .ok_or_else(|| anyhow!("openai reply has no message content"))?;
        let usage = reply.usage.unwrap_or_default();
        Ok(Completion {
            text,
            input_tokens: usage.prompt_tokens,
            output_tokens: usage.completion_tokens,
        })
    }

    async fn complete_anthropic(&self, key: &str, max_tokens: u32, prompt: &Prompt) -> Result<Completion> {
        let body = AnthropicRequest {
            model: &self.model,
            max_tokens,
            system: prompt.system.as_deref(),
            messages: [WireMessage { role: "user", content: &prompt.user }],
        };
        let reply: AnthropicReply = send_json("anthropic", || {
            self.http
                .post(ANTHROPIC_URL)
                .header("x-api-key", key)
                .header("anthropic-version", ANTHROPIC_VERSION)
                .json(&body)
        })
        .await?;
        let text = reply
            .content
            .into_iter()
            .find_map(|block| block.text)
            .ok_or_else(|| anyhow!("anthropic reply has no text block"))?;
        let usage = reply.usage.unwrap_or_default();
        Ok(Completion {
            text,
            input_tokens: usage.input_tokens,
            output_tokens: usage.output_tokens,
        })
    }
}

/// Sends the request built by `build`, retrying on 429 with backoff.
async fn send_json<R, F>(backend: &str, build: F) -> Result<R>
where
    R: DeserializeOwned,
    F: Fn() -> RequestBuilder,
{
    let response = retry_rate_limited(backend, || build().send()).await?;
    let status = response.status();
    if !status.is_success() {
        let detail = response.text().await.unwrap_or_default();
        bail!("{backend} returned {status}: {detail}");
    }
    response
        .json::<R>()
        .await
        .with_context(|| format!("failed to decode {backend} reply"))
}

async fn retry_rate_limited<F, Fut>(backend: &str, send: F) -> Result<Response>
where
    F: Fn() -> Fut,
    Fut: Future<Output = reqwest::Result<Response>>,
{
    for attempt in 1.. {
        let response = send()
            .await
            .with_context(|| format!("{backend} request failed"))?;
        if response.status() != StatusCode::TOO_MANY_REQUESTS {
            return Ok(response);
        }
        if attempt > RATE_LIMIT_RETRIES {
            break;
        }
        let delay = backoff_delay(attempt, response.headers().get("retry-after"));
        warn!(backend, attempt, delay_ms = delay.as_millis() as u64, "rate limited");
        sleep(delay).await;
    }
    bail!("{backend} still rate limited after {RATE_LIMIT_RETRIES} retries")
}

fn backoff_delay(attempt: usize, retry_after: Option<&HeaderValue>) -> Duration {
    retry_after
        .and_then(|value| value.to_str().ok())
        .and_then(|secs| secs.trim().parse::<u64>().ok())
        .map(|secs| Duration::from_secs(secs.max(1)))
        .unwrap_or_else(|| Duration::from_millis(250 << attempt.min(4)))
}

/// Offline backend: replies with the leading words of the prompt's context block.
fn complete_local(prompt: &Prompt) -> Completion {
    let user = prompt.user.as_str();
    let context = match user.find(LOCAL_CONTEXT_MARKER) {
        Some(start) => {
            let rest = &user[start + LOCAL_CONTEXT_MARKER.len()..];
            rest.find(LOCAL_STOP_MARKER).map_or(rest, |end| &rest[..end])
        }
        None => user,
    };
    let text = context
        .split_whitespace()
        .filter(|word| !word.chars().all(|c| c == '"'))
        .take(LOCAL_MAX_WORDS)
        .collect::<Vec<_>>()
        .join(" ");
    Completion {
        text,
        ..Completion::default()
    }
}

fn required_env(var: &str) -> Result<String> {
    match env::var(var) {
        Ok(value) if !value.trim().is_empty() => Ok(value),
        Ok(_) => bail!("{var} is empty"),
        Err(_) => bail!("{var} is not set"),
    }
}

#[derive(Serialize)]
struct WireMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Serialize)]
struct OpenAiRequest<'a> {
    model: &'a str,
    messages: Vec<WireMessage<'a>>,
    temperature: f32,
}

#[derive(Deserialize)]
struct OpenAiReply {
    choices: Vec<OpenAiChoice>,
    #[serde(default)]
    usage: Option<OpenAiUsage>,
}

#[derive(Deserialize)]
struct OpenAiChoice {
    message: OpenAiMessage,
}

#[derive(Deserialize)]
struct OpenAiMessage {
    content: Option<String>,
}

#[derive(Default, Deserialize)]
struct OpenAiUsage {
    #[serde(default)]
    prompt_tokens: u32,
    #[serde(default)]
    completion_tokens: u32,
}

#[derive(Serialize)]
struct AnthropicRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<&'a str>,
    messages: [WireMessage<'a>; 1],
}

#[derive(Deserialize)]
struct AnthropicReply {
    content: Vec<AnthropicBlock>,
    #[serde(default)]
    usage: Option<AnthropicUsage>,
}

#[derive(Deserialize)]
struct AnthropicBlock {
    text: Option<String>,
}

#[derive(Default, Deserialize)]
struct AnthropicUsage {
    #[serde(default)]
    input_tokens: u32,
    #[serde(default)]
    output_tokens: u32,
}
