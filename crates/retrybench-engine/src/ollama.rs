use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use retrybench_core::{Message, ModelError, OllamaConfig};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

use crate::client::{ModelClient, ModelInfo};
use crate::prompt::clip;

/// Backoff for transient transport failures.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(8),
        }
    }
}

impl RetryPolicy {
    pub fn from_config(config: &OllamaConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            initial_backoff: Duration::from_millis(config.initial_backoff_ms),
            ..Self::default()
        }
    }

    /// Delay before retry number `retry` (0-based).
    pub fn delay_for(&self, retry: u32) -> Duration {
        let factor = 2u32.saturating_pow(retry);
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }
}

#[derive(Debug, Deserialize)]
struct TagsResponse {
    models: Vec<OllamaModel>,
}

#[derive(Debug, Deserialize)]
struct OllamaModel {
    name: String,
    #[serde(default)]
    size: u64,
    #[serde(default)]
    details: Option<ModelDetails>,
}

#[derive(Debug, Deserialize)]
struct ModelDetails {
    parameter_size: Option<String>,
    quantization_level: Option<String>,
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    stream: bool,
    options: ChatOptions,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct ChatOptions {
    temperature: f32,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    message: Option<ResponseMessage>,
    #[serde(default)]
    eval_count: Option<u64>,
    #[serde(default)]
    eval_duration: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    content: String,
}

impl ChatResponse {
    fn tokens_per_sec(&self) -> f64 {
        match (self.eval_count, self.eval_duration) {
            (Some(count), Some(ns)) if ns > 0 => count as f64 / (ns as f64 / 1_000_000_000.0),
            _ => 0.0,
        }
    }
}

/// Client for a local Ollama server's non-streaming chat API.
#[derive(Debug, Clone)]
pub struct OllamaClient {
    host: String,
    client: reqwest::Client,
    retry: RetryPolicy,
}

fn transport_error(e: reqwest::Error) -> ModelError {
    match e.is_connect() || e.is_timeout() || e.is_request() {
        true => ModelError::Transient(e.to_string()),
        false => ModelError::Fatal(e.to_string()),
    }
}

fn status_error(status: StatusCode, body: &str) -> ModelError {
    let message = format!("{status}: {}", clip(body, 300));
    match status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        true => ModelError::Transient(message),
        false => ModelError::Fatal(message),
    }
}

impl OllamaClient {
    pub fn new(host: &str) -> Self {
        Self {
            host: host.trim_end_matches('/').to_string(),
            client: reqwest::Client::new(),
            retry: RetryPolicy::default(),
        }
    }

    pub fn from_config(config: &OllamaConfig) -> Result<Self, ModelError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| ModelError::Fatal(format!("Failed to build HTTP client: {e}")))?;

        Ok(Self {
            host: config.host.trim_end_matches('/').to_string(),
            client,
            retry: RetryPolicy::from_config(config),
        })
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    async fn with_retry<T, F, Fut>(&self, op: &str, mut call: F) -> Result<T, ModelError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ModelError>>,
    {
        let mut retry = 0;
        loop {
            match call().await {
                Err(e) if e.is_transient() && retry < self.retry.max_retries => {
                    let delay = self.retry.delay_for(retry);
                    warn!("{} failed ({}), retrying in {:?}", op, e, delay);
                    tokio::time::sleep(delay).await;
                    retry += 1;
                }
                other => return other,
            }
        }
    }

    async fn chat_once(&self, request: &ChatRequest<'_>) -> Result<ChatResponse, ModelError> {
        let url = format!("{}/api/chat", self.host);
        let resp = self
            .client
            .post(&url)
            .json(request)
            .send()
            .await
            .map_err(transport_error)?;

        let status = resp.status();
        let body = resp.text().await.map_err(transport_error)?;
        if !status.is_success() {
            return Err(status_error(status, &body));
        }

        serde_json::from_str(&body).map_err(|e| {
            ModelError::Fatal(format!(
                "Failed to parse response: {} - Body: {}",
                e,
                clip(&body, 500)
            ))
        })
    }

    async fn tags_once(&self) -> Result<TagsResponse, ModelError> {
        let url = format!("{}/api/tags", self.host);
        let resp = self.client.get(&url).send().await.map_err(transport_error)?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(status_error(status, &body));
        }
        resp.json()
            .await
            .map_err(|e| ModelError::Fatal(format!("Failed to parse model list: {e}")))
    }
}

#[async_trait]
impl ModelClient for OllamaClient {
    #[instrument(skip(self, messages), fields(messages = messages.len()))]
    async fn send(
        &self,
        model: &str,
        messages: &[Message],
        temperature: f32,
    ) -> Result<String, ModelError> {
        let request = ChatRequest {
            model,
            messages: messages
                .iter()
                .map(|m| ChatMessage {
                    role: m.role.as_str(),
                    content: &m.content,
                })
                .collect(),
            stream: false,
            options: ChatOptions { temperature },
        };

        let resp = self.with_retry("chat", || self.chat_once(&request)).await?;
        info!(
            "Ollama: {} eval tokens, {:.1} tok/s",
            resp.eval_count.unwrap_or(0),
            resp.tokens_per_sec()
        );

        Ok(resp.message.map(|m| m.content).unwrap_or_default())
    }

    #[instrument(skip(self))]
    async fn list_models(&self) -> Result<Vec<ModelInfo>, ModelError> {
        let tags = self.with_retry("list models", || self.tags_once()).await?;

        Ok(tags
            .models
            .into_iter()
            .map(|m| {
                let (parameter_size, quantization) = match m.details {
                    Some(d) => (d.parameter_size, d.quantization_level),
                    None => (None, None),
                };
                ModelInfo {
                    name: m.name,
                    size: m.size,
                    parameter_size,
                    quantization,
                }
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use retrybench_core::Role;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    const CHAT_OK: &str = r#"{
        "model": "m",
        "message": {"role": "assistant", "content": "def f():\n    return 1"},
        "done": true,
        "eval_count": 12,
        "eval_duration": 1000000000
    }"#;

    async fn read_request(socket: &mut TcpStream) {
        let mut buf = Vec::new();
        let mut chunk = [0u8; 4096];
        loop {
            let n = socket.read(&mut chunk).await.unwrap_or(0);
            if n == 0 {
                return;
            }
            buf.extend_from_slice(&chunk[..n]);
            let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") else {
                continue;
            };
            let head = String::from_utf8_lossy(&buf[..pos]).to_ascii_lowercase();
            let len = head
                .lines()
                .find_map(|l| l.strip_prefix("content-length:"))
                .and_then(|v| v.trim().parse::<usize>().ok())
                .unwrap_or(0);
            if buf.len() >= pos + 4 + len {
                return;
            }
        }
    }

    /// Answers one connection per canned response, in order.
    async fn serve(responses: Vec<(u16, &'static str)>) -> (String, Arc<AtomicUsize>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);

        tokio::spawn(async move {
            for (status, body) in responses {
                let Ok((mut socket, _)) = listener.accept().await else {
                    return;
                };
                counter.fetch_add(1, Ordering::SeqCst);
                read_request(&mut socket).await;
                let reply = format!(
                    "HTTP/1.1 {status} Canned\r\nContent-Type: application/json\r\n\
                     Content-Length: {}\r\nConnection: close\r\n\r\n{body}",
                    body.len()
                );
                let _ = socket.write_all(reply.as_bytes()).await;
                let _ = socket.shutdown().await;
            }
        });

        (format!("http://{addr}"), hits)
    }

    fn fast_retry() -> RetryPolicy {
        RetryPolicy {
            max_retries: 2,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(5),
        }
    }

    fn prompt() -> Vec<Message> {
        vec![Message::new(Role::User, "write f")]
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for(0), Duration::from_millis(500));
        assert_eq!(policy.delay_for(1), Duration::from_millis(1000));
        assert_eq!(policy.delay_for(2), Duration::from_millis(2000));
        assert_eq!(policy.delay_for(10), Duration::from_secs(8));
    }

    #[test]
    fn test_status_classification() {
        assert!(status_error(StatusCode::TOO_MANY_REQUESTS, "").is_transient());
        assert!(status_error(StatusCode::BAD_GATEWAY, "").is_transient());
        assert!(!status_error(StatusCode::NOT_FOUND, "model not found").is_transient());
    }

    #[tokio::test]
    async fn test_transient_status_is_retried() {
        let (host, hits) = serve(vec![(503, "{}"), (200, CHAT_OK)]).await;
        let client = OllamaClient::new(&host).with_retry_policy(fast_retry());

        let reply = client.send("m", &prompt(), 0.0).await.unwrap();
        assert_eq!(reply, "def f():\n    return 1");
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_fatal_status_is_not_retried() {
        let (host, hits) = serve(vec![(404, r#"{"error":"model not found"}"#)]).await;
        let client = OllamaClient::new(&host).with_retry_policy(fast_retry());

        let err = client.send("m", &prompt(), 0.0).await.unwrap_err();
        assert!(matches!(err, ModelError::Fatal(ref m) if m.contains("model not found")));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_transient_errors_surface_after_budget() {
        let (host, hits) = serve(vec![(500, "{}"), (500, "{}"), (500, "{}")]).await;
        let client = OllamaClient::new(&host).with_retry_policy(fast_retry());

        let err = client.send("m", &prompt(), 0.0).await.unwrap_err();
        assert!(err.is_transient());
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_unreachable_host_is_transient() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let client = OllamaClient::new(&format!("http://{addr}")).with_retry_policy(fast_retry());
        let err = client.list_models().await.unwrap_err();
        assert!(err.is_transient());
        assert!(!client.is_available().await);
    }

    #[tokio::test]
    async fn test_list_models() {
        let body = r#"{"models": [
            {
                "name": "qwen2.5-coder:7b",
                "size": 4683087332,
                "details": {"parameter_size": "7.6B", "quantization_level": "Q4_K_M"}
            },
            {"name": "tiny"}
        ]}"#;
        let (host, _) = serve(vec![(200, body)]).await;
        let client = OllamaClient::new(&host);

        let models = client.list_models().await.unwrap();
        assert_eq!(models.len(), 2);
        assert_eq!(models[0].quantization.as_deref(), Some("Q4_K_M"));
        assert_eq!(models[1].parameter_size, None);
    }
}
