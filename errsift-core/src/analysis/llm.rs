//! HTTP completion clients (Ollama, Claude, OpenAI)

use crate::config::{LlmConfig, LlmProvider};
use crate::error::{Error, Result};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use serde_json::json;
use std::time::Duration;

pub(crate) const SYSTEM_PROMPT: &str = "You are an on-call engineering assistant. Given structured log events and optional runbook context, identify the probable root cause, the impacted components, the severity, immediate fix suggestions and longer-term remediation. Answer in concise bullet points.";

/// Text completion interface used by the analysis pipeline.
pub trait CompletionClient: Send + Sync {
    fn complete(&self, prompt: &str) -> Result<String>;
}

/// Create the default HTTP-backed completion client.
pub fn create_completion_client(llm: &LlmConfig) -> Result<Box<dyn CompletionClient>> {
    Ok(Box::new(HttpCompletionClient::new(llm)?))
}

/// Blocking client over `reqwest`, driven by its own tokio runtime.
///
/// The runtime is multi-threaded so that several worker threads can block on
/// requests at the same time.
pub struct HttpCompletionClient {
    model: String,
    provider: LlmProvider,
    endpoint: String,
    api_key: Option<String>,
    runtime: tokio::runtime::Runtime,
    http: reqwest::Client,
}

impl HttpCompletionClient {
    pub fn new(config: &LlmConfig) -> Result<Self> {
        let endpoint = config
            .endpoint
            .clone()
            .unwrap_or_else(|| config.provider.default_endpoint().to_string());
        let api_key = config.api_key.clone().or_else(|| {
            config
                .provider
                .api_key_env()
                .and_then(|var| std::env::var(var).ok())
        });

        if config.provider != LlmProvider::Ollama && api_key.is_none() {
            return Err(Error::Config(
                "llm.api_key (or provider env var) is required".to_string(),
            ));
        }

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name("errsift-http")
            .enable_all()
            .build()
            .map_err(|e| Error::Analysis(format!("failed to build tokio runtime: {e}")))?;
        let timeout_secs = config.timeout_secs.max(1);
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .map_err(|e| Error::Analysis(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            model: config.model.clone(),
            provider: config.provider,
            endpoint,
            api_key,
            runtime,
            http,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.endpoint.trim_end_matches('/'), path)
    }

    async fn post(
        &self,
        name: &str,
        url: String,
        headers: HeaderMap,
        body: serde_json::Value,
    ) -> Result<serde_json::Value> {
        let resp = self
            .http
            .post(url)
            .headers(headers)
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::Analysis(format!("{name} request failed: {e}")))?;
        let status = resp.status();
        let text = resp
            .text()
            .await
            .map_err(|e| Error::Analysis(format!("{name} read body failed: {e}")))?;
        if !status.is_success() {
            return Err(Error::Analysis(format!(
                "{name} returned {}: {}",
                status.as_u16(),
                text
            )));
        }
        Ok(serde_json::from_str(&text)?)
    }

    async fn complete_ollama(&self, prompt: &str) -> Result<String> {
        let json = self
            .post(
                "ollama",
                self.url("/api/generate"),
                HeaderMap::new(),
                json!({
                    "model": self.model,
                    "system": SYSTEM_PROMPT,
                    "prompt": prompt,
                    "stream": false,
                }),
            )
            .await?;
        json.get("response")
            .and_then(|v| v.as_str())
            .map(ToString::to_string)
            .ok_or_else(|| {
                Error::Analysis("ollama response missing string field `response`".to_string())
            })
    }

    async fn complete_claude(&self, prompt: &str) -> Result<String> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(
            "x-api-key",
            HeaderValue::from_str(self.api_key.as_deref().unwrap_or_default())
                .map_err(|e| Error::Analysis(format!("invalid claude api key header: {e}")))?,
        );
        headers.insert("anthropic-version", HeaderValue::from_static("2023-06-01"));

        let json = self
            .post(
                "claude",
                self.url("/v1/messages"),
                headers,
                json!({
                    "model": self.model,
                    "max_tokens": 1024,
                    "temperature": 0.2,
                    "system": SYSTEM_PROMPT,
                    "messages": [{ "role": "user", "content": prompt }],
                }),
            )
            .await?;
        json.get("content")
            .and_then(|v| v.as_array())
            .and_then(|arr| arr.first())
            .and_then(|v| v.get("text"))
            .and_then(|v| v.as_str())
            .map(ToString::to_string)
            .ok_or_else(|| Error::Analysis("claude response missing content[0].text".to_string()))
    }

    async fn complete_openai(&self, prompt: &str) -> Result<String> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!(
                "Bearer {}",
                self.api_key.as_deref().unwrap_or_default()
            ))
            .map_err(|e| Error::Analysis(format!("invalid auth header: {e}")))?,
        );

        let json = self
            .post(
                "openai",
                self.url("/v1/chat/completions"),
                headers,
                json!({
                    "model": self.model,
                    "temperature": 0.2,
                    "messages": [
                        { "role": "system", "content": SYSTEM_PROMPT },
                        { "role": "user", "content": prompt }
                    ]
                }),
            )
            .await?;
        json.get("choices")
            .and_then(|v| v.as_array())
            .and_then(|arr| arr.first())
            .and_then(|v| v.get("message"))
            .and_then(|v| v.get("content"))
            .and_then(|v| v.as_str())
            .map(ToString::to_string)
            .ok_or_else(|| {
                Error::Analysis("openai response missing choices[0].message.content".to_string())
            })
    }
}

impl CompletionClient for HttpCompletionClient {
    fn complete(&self, prompt: &str) -> Result<String> {
        self.runtime.block_on(async {
            match self.provider {
                LlmProvider::Ollama => self.complete_ollama(prompt).await,
                LlmProvider::Claude => self.complete_claude(prompt).await,
                LlmProvider::OpenAI => self.complete_openai(prompt).await,
            }
        })
    }
}
